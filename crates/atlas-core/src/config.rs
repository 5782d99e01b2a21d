//! Path resolution, persisted user settings and data-pack handling.
//!
//! A data pack is a directory bundle:
//!
//! ```text
//! <pack>/manifest.json
//! <pack>/data/        catchments.geojson, scenario CSVs, sites/, mbtiles/
//! <pack>/resources/   mbtiles/
//! ```
//!
//! It is installed either as a directory or as a `.zip` of one. Archives are
//! unpacked into `datapacks/` next to the settings file first. Installing
//! records the pack path in the settings file and swaps a fresh snapshot
//! into the running [`AtlasHandle`].

use std::fs::File;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::atlas::AtlasHandle;
use crate::error::{AtlasError, Result};

pub const SETTINGS_FILE: &str = "settings.json";
pub const MANIFEST_FILE: &str = "manifest.json";
const APP_DIR: &str = "catchment-atlas";
const DATAPACKS_DIR: &str = "datapacks";

// ── AtlasConfig ───────────────────────────────────────────────────────────────

/// Where one snapshot reads its data from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AtlasConfig {
    pub data_dir: PathBuf,
    pub resources_dir: PathBuf,
}

impl AtlasConfig {
    pub fn new(data_dir: impl Into<PathBuf>, resources_dir: impl Into<PathBuf>) -> Self {
        Self { data_dir: data_dir.into(), resources_dir: resources_dir.into() }
    }

    /// `<root>/data` and `<root>/resources`.
    pub fn for_pack(root: &Path) -> Self {
        Self::new(root.join("data"), root.join("resources"))
    }

    pub fn sites_dir(&self) -> PathBuf {
        self.data_dir.join("sites")
    }

    /// MBTiles search order; on a name clash the earlier directory wins.
    pub fn mbtiles_dirs(&self) -> Vec<PathBuf> {
        vec![self.data_dir.join("mbtiles"), self.resources_dir.join("mbtiles")]
    }

    /// Explicit paths first, then the installed data pack, then `./data` and
    /// `./resources`. Each directory falls back independently.
    pub fn resolve(data_dir: Option<PathBuf>, resources_dir: Option<PathBuf>, settings: &Settings) -> Self {
        let pack = settings.data_pack_path.as_deref().and_then(|root| {
            if root.join("data").is_dir() {
                Some(Self::for_pack(root))
            } else {
                warn!(path = %root.display(), "Saved data pack has no data/ directory, ignoring it");
                None
            }
        });
        let fallback = pack.unwrap_or_else(|| Self::new("data", "resources"));

        let config = Self {
            data_dir: data_dir.unwrap_or(fallback.data_dir),
            resources_dir: resources_dir.unwrap_or(fallback.resources_dir),
        };
        info!(
            data_dir = %config.data_dir.display(),
            resources_dir = %config.resources_dir.display(),
            "Resolved data directories"
        );
        config
    }
}

// ── Settings ──────────────────────────────────────────────────────────────────

/// User settings persisted between runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_pack_path: Option<PathBuf>,
}

impl Settings {
    /// `<config dir>/catchment-atlas/settings.json`, if the platform has a
    /// config directory.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join(APP_DIR).join(SETTINGS_FILE))
    }

    /// A missing file yields default settings.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => Ok(serde_json::from_str(&text)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

// ── Data packs ────────────────────────────────────────────────────────────────

/// Contents of a pack's `manifest.json`. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataPackManifest {
    pub format: Option<String>,
    pub version: Option<String>,
    pub description: Option<String>,
    pub created: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DataPack {
    pub root: PathBuf,
    pub manifest: DataPackManifest,
}

/// Installation state as reported to users.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DataPackStatus {
    pub installed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DataPack {
    /// Validate a pack directory. `resources/` is required; an unreadable
    /// manifest is logged and treated as empty.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        if !root.is_dir() {
            return Err(AtlasError::invalid(format!("data pack {} is not a directory", root.display())));
        }
        if !root.join("resources").is_dir() {
            return Err(AtlasError::invalid(format!(
                "invalid data pack {}: missing resources/ directory",
                root.display()
            )));
        }

        let manifest_path = root.join(MANIFEST_FILE);
        let manifest = match std::fs::read_to_string(&manifest_path) {
            Ok(text) => serde_json::from_str(&text).unwrap_or_else(|e| {
                warn!(path = %manifest_path.display(), error = %e, "Ignoring malformed manifest");
                DataPackManifest::default()
            }),
            Err(_) => DataPackManifest::default(),
        };
        Ok(Self { root, manifest })
    }

    pub fn config(&self) -> AtlasConfig {
        AtlasConfig::for_pack(&self.root)
    }

    pub fn status(settings: &Settings) -> DataPackStatus {
        let Some(root) = &settings.data_pack_path else {
            return DataPackStatus::default();
        };
        if !root.exists() {
            return DataPackStatus {
                error: Some("data pack path no longer exists".to_string()),
                ..Default::default()
            };
        }
        match Self::open(root) {
            Ok(pack) => DataPackStatus {
                installed: true,
                path: Some(pack.root),
                version: pack.manifest.version,
                description: pack.manifest.description,
                error: None,
            },
            Err(e) => DataPackStatus { error: Some(e.to_string()), ..Default::default() },
        }
    }
}

/// Unpack a data-pack archive into `target_dir` and return the pack root.
///
/// Archives holding a single top-level directory unpack to that directory;
/// otherwise the archive's file stem names the root. An earlier unpack of
/// the same pack is replaced.
pub fn extract_archive(archive_path: &Path, target_dir: &Path) -> Result<PathBuf> {
    let mut archive = zip::ZipArchive::new(File::open(archive_path)?)?;
    if archive.is_empty() {
        return Err(AtlasError::invalid(format!("{} is an empty archive", archive_path.display())));
    }

    let mut names = Vec::with_capacity(archive.len());
    for i in 0..archive.len() {
        let entry = archive.by_index(i)?;
        if entry.enclosed_name().is_none() {
            return Err(AtlasError::invalid(format!("illegal path in archive: {}", entry.name())));
        }
        names.push(entry.name().to_string());
    }

    let first = names[0].split('/').next().unwrap_or_default().to_string();
    let prefix = format!("{first}/");
    let single_root = !first.is_empty()
        && names.iter().all(|n| n.starts_with(&prefix))
        && names.iter().any(|n| n.len() > prefix.len());
    let (root, dest) = if single_root {
        (target_dir.join(&first), target_dir.to_path_buf())
    } else {
        let stem = archive_path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| AtlasError::invalid(format!("bad archive name {}", archive_path.display())))?;
        let root = target_dir.join(stem);
        (root.clone(), root)
    };

    if root.exists() {
        std::fs::remove_dir_all(&root)?;
    }
    std::fs::create_dir_all(&dest)?;
    archive.extract(&dest)?;
    info!(archive = %archive_path.display(), root = %root.display(), entries = names.len(), "Data pack unpacked");
    Ok(root)
}

fn is_archive(path: &Path) -> bool {
    path.is_file() && path.extension().is_some_and(|e| e.eq_ignore_ascii_case("zip"))
}

/// Validate `source` (a pack directory or `.zip` archive), record it in the
/// settings at `settings_path` and reload `handle` from it.
pub fn install(source: &Path, settings_path: &Path, handle: &AtlasHandle) -> Result<DataPack> {
    let pack_path = if is_archive(source) {
        let target = settings_path.parent().unwrap_or(Path::new(".")).join(DATAPACKS_DIR);
        extract_archive(source, &target)?
    } else if source.is_file() {
        return Err(AtlasError::invalid(format!(
            "{} must be a data pack directory or .zip archive",
            source.display()
        )));
    } else {
        source.to_path_buf()
    };
    let pack = DataPack::open(&pack_path)?;

    let mut settings = Settings::load(settings_path)?;
    settings.data_pack_path = Some(pack.root.clone());
    settings.save(settings_path)?;

    handle.reload(pack.config());
    info!(
        path = %pack.root.display(),
        version = pack.manifest.version.as_deref().unwrap_or("unknown"),
        "Data pack installed"
    );
    Ok(pack)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    /// Zip `entries` (name, contents); names ending in `/` become directories.
    fn write_zip(path: &Path, entries: &[(&str, &str)]) {
        let mut zip = zip::ZipWriter::new(File::create(path).unwrap());
        for (name, contents) in entries {
            if name.ends_with('/') {
                zip.add_directory(*name, SimpleFileOptions::default()).unwrap();
            } else {
                zip.start_file(*name, SimpleFileOptions::default()).unwrap();
                zip.write_all(contents.as_bytes()).unwrap();
            }
        }
        zip.finish().unwrap();
    }

    fn pack_dir(with_data: bool) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("resources")).unwrap();
        if with_data {
            std::fs::create_dir_all(dir.path().join("data")).unwrap();
        }
        dir
    }

    #[test]
    fn explicit_paths_win_over_settings() {
        let pack = pack_dir(true);
        let settings = Settings { data_pack_path: Some(pack.path().to_path_buf()) };

        let cfg = AtlasConfig::resolve(Some("/tmp/d".into()), None, &settings);
        assert_eq!(cfg.data_dir, PathBuf::from("/tmp/d"));
        assert_eq!(cfg.resources_dir, pack.path().join("resources"));
    }

    #[test]
    fn pack_without_data_dir_falls_back_to_cwd() {
        let pack = pack_dir(false);
        let settings = Settings { data_pack_path: Some(pack.path().to_path_buf()) };
        let cfg = AtlasConfig::resolve(None, None, &settings);
        assert_eq!(cfg, AtlasConfig::new("data", "resources"));
    }

    #[test]
    fn derived_directories() {
        let cfg = AtlasConfig::new("/p/data", "/p/resources");
        assert_eq!(cfg.sites_dir(), PathBuf::from("/p/data/sites"));
        assert_eq!(
            cfg.mbtiles_dirs(),
            vec![PathBuf::from("/p/data/mbtiles"), PathBuf::from("/p/resources/mbtiles")]
        );
    }

    #[test]
    fn settings_roundtrip_and_missing_file_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(SETTINGS_FILE);
        assert_eq!(Settings::load(&path).unwrap(), Settings::default());

        let settings = Settings { data_pack_path: Some("/packs/africa".into()) };
        settings.save(&path).unwrap();
        assert!(std::fs::read_to_string(&path).unwrap().contains("dataPackPath"));
        assert_eq!(Settings::load(&path).unwrap(), settings);
    }

    #[test]
    fn open_requires_resources_and_reads_manifest() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(DataPack::open(dir.path()), Err(AtlasError::InvalidInput(_))));

        let pack = pack_dir(true);
        std::fs::write(
            pack.path().join(MANIFEST_FILE),
            r#"{"format":"datapack","version":"2.1","description":"Nile basin","extra":1}"#,
        )
        .unwrap();
        let opened = DataPack::open(pack.path()).unwrap();
        assert_eq!(opened.manifest.version.as_deref(), Some("2.1"));
        assert_eq!(opened.manifest.created, None);
    }

    #[test]
    fn status_reports_missing_and_installed_packs() {
        assert!(!DataPack::status(&Settings::default()).installed);

        let gone = Settings { data_pack_path: Some("/definitely/not/here".into()) };
        let status = DataPack::status(&gone);
        assert!(!status.installed);
        assert!(status.error.is_some());

        let pack = pack_dir(true);
        std::fs::write(pack.path().join(MANIFEST_FILE), r#"{"version":"1.0"}"#).unwrap();
        let status = DataPack::status(&Settings { data_pack_path: Some(pack.path().to_path_buf()) });
        assert!(status.installed);
        assert_eq!(status.version.as_deref(), Some("1.0"));
    }

    #[test]
    fn archive_with_a_root_directory_unpacks_to_it() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("africa-v2.zip");
        write_zip(
            &archive,
            &[
                ("africa/", ""),
                ("africa/manifest.json", r#"{"version":"2.0"}"#),
                ("africa/resources/", ""),
                ("africa/data/reference.csv", "catchID,rainfall\n1,2\n"),
            ],
        );
        let target = dir.path().join("packs");

        let root = extract_archive(&archive, &target).unwrap();
        assert_eq!(root, target.join("africa"));
        assert!(root.join("data").join("reference.csv").is_file());
        assert_eq!(DataPack::open(&root).unwrap().manifest.version.as_deref(), Some("2.0"));

        // A second unpack replaces the first.
        std::fs::write(root.join("stale.txt"), "old").unwrap();
        extract_archive(&archive, &target).unwrap();
        assert!(!root.join("stale.txt").exists());
    }

    #[test]
    fn flat_archive_unpacks_under_its_file_stem() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("nile.zip");
        write_zip(&archive, &[("manifest.json", "{}"), ("resources/", ""), ("data/", "")]);

        let root = extract_archive(&archive, &dir.path().join("packs")).unwrap();
        assert_eq!(root, dir.path().join("packs").join("nile"));
        assert!(root.join("resources").is_dir());
    }

    #[test]
    fn archive_paths_may_not_escape_the_target() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("evil.zip");
        write_zip(&archive, &[("pack/resources/", ""), ("../escaped.txt", "x")]);

        let target = dir.path().join("packs");
        assert!(matches!(extract_archive(&archive, &target), Err(AtlasError::InvalidInput(_))));
        assert!(!dir.path().join("escaped.txt").exists());
    }

    #[test]
    fn install_rejects_files_that_are_not_archives() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("pack.tar");
        std::fs::write(&file, "not a pack").unwrap();
        let handle = AtlasHandle::load(AtlasConfig::for_pack(dir.path()));

        let err = install(&file, &dir.path().join(SETTINGS_FILE), &handle).unwrap_err();
        assert!(matches!(err, AtlasError::InvalidInput(_)));
        assert_eq!(Settings::load(&dir.path().join(SETTINGS_FILE)).unwrap(), Settings::default());
    }
}
