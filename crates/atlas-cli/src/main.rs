/// `atlas`: query a catchment data pack and manage sites from the shell.
///
/// Every command loads one snapshot of the configured data pack, runs
/// against it, and prints JSON on stdout. Logs go to stderr.
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use atlas_core::bbox::map_coords;
use atlas_core::coords::TileAddr;
use atlas_core::config::{install, DataPack, Settings};
use atlas_core::tiles::TileEncoding;
use atlas_core::{Atlas, AtlasConfig, AtlasHandle, BoundingBox, CreationMethod, Scenario};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

// ── CLI ──────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "atlas", version, about = "Catchment attributes, tiles and site boundaries for African basins")]
struct Cli {
    /// Directory holding catchments.geojson, scenario CSVs and sites/
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Directory holding bundled resources such as mbtiles/
    #[arg(long, global = true)]
    resources_dir: Option<PathBuf>,

    /// Settings file (defaults to the platform config directory)
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write one raw tile blob to a file or stdout
    Tile {
        tileset: String,
        z: u32,
        x: u32,
        y: u32,
        /// Output file (stdout if omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Show a tileset's metadata, or a TileJSON document with --tiles-url
    Metadata {
        tileset: String,
        #[arg(long)]
        tiles_url: Option<String>,
    },
    /// List available tilesets
    Tilesets,
    /// Global attribute ranges across every scenario
    Domain { attribute: Option<String> },
    /// Every value of one attribute in one scenario
    Scenario { scenario: Scenario, attribute: String },
    /// Paired values of one attribute in two scenarios
    Compare { left: Scenario, right: Scenario, attribute: String },
    /// Catchments intersecting a bounding box, as GeoJSON
    Query {
        scenario: Scenario,
        attribute: String,
        /// "minx,miny,maxx,maxy" in degrees
        #[arg(long)]
        bbox: String,
        /// Round output coordinates to this many decimals
        #[arg(long)]
        precision: Option<u32>,
    },
    /// Every attribute of one catchment across scenarios
    Inspect { catchment: i64 },
    /// Create, edit and summarize sites
    #[command(subcommand)]
    Site(SiteCommand),
    /// Inspect or install a data pack
    #[command(subcommand)]
    Pack(PackCommand),
}

#[derive(Subcommand, Debug)]
enum SiteCommand {
    /// Create a site from catchments or from a GeoJSON file
    Create(CreateArgs),
    /// Merge a catchment into a site's boundary
    Union { site: Uuid, catchment: i64 },
    /// Remove a catchment from a site's boundary
    Difference { site: Uuid, catchment: i64 },
    /// Aggregate indicators from the site's catchments
    Extract { site: Uuid },
    /// Set ideal values, given as name=value pairs
    SetIdeal {
        site: Uuid,
        #[arg(required = true, value_parser = parse_assignment)]
        values: Vec<(String, f64)>,
    },
    /// Reset ideal values to the reference scenario
    ResetIdeal { site: Uuid },
    Show { site: Uuid },
    List,
    Delete { site: Uuid },
}

#[derive(Args, Debug)]
struct CreateArgs {
    #[arg(long)]
    title: String,

    #[arg(long)]
    description: Option<String>,

    /// Comma-separated catchment ids to dissolve
    #[arg(long, value_delimiter = ',', conflicts_with = "geometry", required_unless_present = "geometry")]
    catchments: Vec<i64>,

    /// GeoJSON file holding a Polygon/MultiPolygon geometry, feature or collection
    #[arg(long)]
    geometry: Option<PathBuf>,

    /// Creation method recorded with a geometry: shapefile, geojson or drawn
    #[arg(long, default_value = "geojson")]
    method: CreationMethod,
}

#[derive(Subcommand, Debug)]
enum PackCommand {
    /// Report the installed data pack
    Status,
    /// Validate a pack directory or .zip archive and make it the active one
    Install { path: PathBuf },
}

fn parse_assignment(s: &str) -> std::result::Result<(String, f64), String> {
    let (name, value) = s.split_once('=').ok_or_else(|| format!("expected name=value, got {s:?}"))?;
    let value: f64 = value.trim().parse().map_err(|_| format!("{value:?} is not a number"))?;
    Ok((name.trim().to_string(), value))
}

// ── Helpers ──────────────────────────────────────────────────────────────────

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let mut out = std::io::stdout().lock();
    serde_json::to_writer_pretty(&mut out, value)?;
    writeln!(out)?;
    Ok(())
}

fn settings_path(cli: &Cli) -> Result<PathBuf> {
    match &cli.settings {
        Some(p) => Ok(p.clone()),
        None => Settings::default_path().context("no platform config directory; pass --settings"),
    }
}

/// Read a geometry from a GeoJSON file. Features and collections contribute
/// every polygonal geometry they hold.
fn read_geometry(path: &Path) -> Result<geojson::Geometry> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let doc: geojson::GeoJson = text.parse().with_context(|| format!("parsing {}", path.display()))?;
    let geometry = match doc {
        geojson::GeoJson::Geometry(g) => g,
        geojson::GeoJson::Feature(f) => f.geometry.context("feature has no geometry")?,
        geojson::GeoJson::FeatureCollection(fc) => {
            let parts: Vec<geojson::Geometry> = fc.features.into_iter().filter_map(|f| f.geometry).collect();
            if parts.is_empty() {
                bail!("{} holds no geometries", path.display());
            }
            geojson::Geometry::new(geojson::Value::GeometryCollection(parts))
        }
    };
    Ok(geometry)
}

// ── Entry point ──────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    let cli = Cli::parse();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();

    let settings_file = settings_path(&cli).ok();
    let settings = match &settings_file {
        Some(p) => Settings::load(p).with_context(|| format!("loading settings from {}", p.display()))?,
        None => Settings::default(),
    };

    if let Command::Pack(cmd) = &cli.command {
        return run_pack(cmd, &cli, &settings);
    }

    let config = AtlasConfig::resolve(cli.data_dir.clone(), cli.resources_dir.clone(), &settings);
    let handle = AtlasHandle::load(config);
    let atlas = handle.snapshot();
    run(&cli.command, &atlas)
}

fn run_pack(cmd: &PackCommand, cli: &Cli, settings: &Settings) -> Result<()> {
    match cmd {
        PackCommand::Status => print_json(&DataPack::status(settings)),
        PackCommand::Install { path } => {
            let settings_file = settings_path(cli)?;
            let current = AtlasConfig::resolve(cli.data_dir.clone(), cli.resources_dir.clone(), settings);
            let handle = AtlasHandle::load(current);
            let pack = install(path, &settings_file, &handle)
                .with_context(|| format!("installing data pack {}", path.display()))?;
            let atlas = handle.snapshot();
            for (store, reason) in atlas.unavailable() {
                eprintln!("warning: {store} store unavailable in new pack: {reason}");
            }
            print_json(&DataPack::status(&Settings::load(&settings_file)?))?;
            info!(path = %pack.root.display(), "Active data pack changed");
            Ok(())
        }
    }
}

fn run(command: &Command, atlas: &Atlas) -> Result<()> {
    match command {
        Command::Tile { tileset, z, x, y, output } => {
            let data = atlas.tiles()?.get_tile(tileset, *z, *x, *y)?;
            let (south, west, north, east) = TileAddr::new(*z, *x, *y).bounds();
            let encoding = TileEncoding::detect(&data).content_encoding().unwrap_or("identity");
            info!(
                tile = %format!("{tileset}/{z}/{x}/{y}"),
                bytes = data.len(),
                encoding,
                bounds = %format!("{west:.5},{south:.5},{east:.5},{north:.5}"),
                "Tile read"
            );
            match output {
                Some(path) => std::fs::write(path, &data).with_context(|| format!("writing {}", path.display()))?,
                None => std::io::stdout().lock().write_all(&data)?,
            }
            Ok(())
        }
        Command::Metadata { tileset, tiles_url } => {
            let tiles = atlas.tiles()?;
            match tiles_url {
                Some(url) => print_json(&tiles.tile_json(tileset, url)?),
                None => print_json(&tiles.get_metadata(tileset)?),
            }
        }
        Command::Tilesets => print_json(&atlas.tiles()?.tileset_names()),
        Command::Domain { attribute } => {
            let store = atlas.catchments()?;
            match attribute {
                Some(a) => print_json(&store.domain_range(a)?),
                None => print_json(store.domain_ranges()),
            }
        }
        Command::Scenario { scenario, attribute } => {
            print_json(&atlas.catchments()?.scenario_data(*scenario, attribute)?)
        }
        Command::Compare { left, right, attribute } => {
            let pairs = atlas.catchments()?.comparison_data(*left, *right, attribute)?;
            let doc: BTreeMap<i64, BTreeMap<&str, f64>> = pairs
                .into_iter()
                .map(|(id, (l, r))| (id, BTreeMap::from([(left.as_str(), l), (right.as_str(), r)])))
                .collect();
            print_json(&doc)
        }
        Command::Query { scenario, attribute, bbox, precision } => {
            let bbox = BoundingBox::parse(bbox)?;
            let mut fc = atlas.catchments()?.query_catchments(*scenario, attribute, &bbox)?;
            if let Some(digits) = precision {
                let scale = 10f64.powi(*digits as i32);
                let mut round = |x: f64, y: f64| ((x * scale).round() / scale, (y * scale).round() / scale);
                for geom in fc.features.iter_mut().filter_map(|f| f.geometry.as_mut()) {
                    map_coords(&mut geom.value, &mut round);
                }
            }
            print_json(&fc)
        }
        Command::Inspect { catchment } => print_json(&atlas.catchments()?.catchment_attributes(*catchment)?),
        Command::Site(cmd) => run_site(cmd, atlas),
        Command::Pack(_) => bail!("pack commands run without a loaded atlas"),
    }
}

fn run_site(cmd: &SiteCommand, atlas: &Atlas) -> Result<()> {
    match cmd {
        SiteCommand::Create(args) => {
            let engine = atlas.boundary_engine()?;
            let site = match &args.geometry {
                Some(path) => engine.create_from_geometry(
                    &args.title,
                    args.description.clone(),
                    read_geometry(path)?,
                    args.method,
                )?,
                None => {
                    let mut site = engine.dissolve(&args.title, &args.catchments)?;
                    if let Some(d) = &args.description {
                        site.description = Some(d.clone());
                        atlas.sites()?.save(&site)?;
                    }
                    site
                }
            };
            print_json(&site)
        }
        SiteCommand::Union { site, catchment } => print_json(&atlas.boundary_engine()?.union(*site, *catchment)?),
        SiteCommand::Difference { site, catchment } => {
            print_json(&atlas.boundary_engine()?.difference(*site, *catchment)?)
        }
        SiteCommand::Extract { site } => print_json(&atlas.indicator_aggregator()?.extract(*site)?),
        SiteCommand::SetIdeal { site, values } => {
            let partial: BTreeMap<String, f64> = values.iter().cloned().collect();
            print_json(&atlas.indicator_aggregator()?.update_ideal(*site, &partial)?)
        }
        SiteCommand::ResetIdeal { site } => print_json(&atlas.indicator_aggregator()?.reset_ideal(*site)?),
        SiteCommand::Show { site } => print_json(&atlas.sites()?.get(*site)?),
        SiteCommand::List => {
            #[derive(Serialize)]
            #[serde(rename_all = "camelCase")]
            struct Summary {
                id: Uuid,
                title: String,
                area_km2: f64,
                creation_method: CreationMethod,
                catchments: usize,
                extracted: bool,
            }
            let summaries: Vec<Summary> = atlas
                .sites()?
                .list()?
                .into_iter()
                .map(|s| Summary {
                    id: s.id,
                    title: s.title,
                    area_km2: s.area_km2,
                    creation_method: s.creation_method,
                    catchments: s.catchment_ids.len(),
                    extracted: s.indicators.is_some(),
                })
                .collect();
            print_json(&summaries)
        }
        SiteCommand::Delete { site } => {
            atlas.boundary_engine()?.delete(*site)?;
            eprintln!("deleted site {site}");
            Ok(())
        }
    }
}
