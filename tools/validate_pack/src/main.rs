/// Data-pack validator: loads a pack the way `atlas` would and reports what
/// it found. Exits non-zero if a store fails to load, or with `--strict`, if
/// any scenario row or site refers to a catchment without geometry.
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use atlas_core::{Atlas, AtlasConfig, DataPack};
use clap::Parser;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "validate_pack", about = "Check a catchment data pack before installing it")]
struct Args {
    /// Data pack root (holding manifest.json, data/ and resources/)
    pack: PathBuf,

    /// Treat dangling catchment references as errors
    #[arg(long)]
    strict: bool,

    /// Print the report as JSON instead of text
    #[arg(long)]
    json: bool,
}

// ── Report ───────────────────────────────────────────────────────────────────

#[derive(Serialize, Default)]
#[serde(rename_all = "camelCase")]
struct Report {
    version: Option<String>,
    description: Option<String>,
    tilesets: Vec<String>,
    catchments: usize,
    scenarios: Vec<ScenarioReport>,
    attributes: usize,
    sites: usize,
    unavailable: Vec<String>,
    problems: Vec<String>,
}

#[derive(Serialize)]
struct ScenarioReport {
    name: String,
    rows: usize,
    attributes: usize,
    /// Rows whose catchment has no geometry.
    orphans: usize,
}

fn build_report(pack: &DataPack, atlas: &Atlas) -> Report {
    let mut report = Report {
        version: pack.manifest.version.clone(),
        description: pack.manifest.description.clone(),
        unavailable: atlas.unavailable().iter().map(|(s, r)| format!("{s}: {r}")).collect(),
        ..Default::default()
    };

    if let Ok(tiles) = atlas.tiles() {
        report.tilesets = tiles.tileset_names();
    }

    if let Ok(store) = atlas.catchments() {
        report.catchments = store.len();
        report.attributes = store.domain_ranges().len();
        for scenario in store.scenarios() {
            let Ok(table) = store.scenario_table(scenario) else { continue };
            let orphans = table.ids().iter().filter(|id| store.catchment(**id).is_err()).count();
            if orphans > 0 {
                report.problems.push(format!("{orphans} {scenario} rows have no catchment geometry"));
            }
            report.scenarios.push(ScenarioReport {
                name: scenario.to_string(),
                rows: table.len(),
                attributes: table.attributes().count(),
                orphans,
            });
        }

        if let Ok(sites) = atlas.sites() {
            match sites.list() {
                Ok(list) => {
                    report.sites = list.len();
                    for site in &list {
                        let dangling = site
                            .catchment_ids
                            .iter()
                            .filter(|id| id.parse::<i64>().map_or(true, |id| store.catchment(id).is_err()))
                            .count();
                        if dangling > 0 {
                            report
                                .problems
                                .push(format!("site {} ({}) references {dangling} unknown catchments", site.id, site.title));
                        }
                    }
                }
                Err(e) => report.problems.push(format!("listing sites: {e}")),
            }
        }
    }
    report
}

fn print_text(report: &Report) {
    println!("version:     {}", report.version.as_deref().unwrap_or("-"));
    if let Some(d) = &report.description {
        println!("description: {d}");
    }
    println!("tilesets:    {}", report.tilesets.join(", "));
    println!("catchments:  {}", report.catchments);
    for s in &report.scenarios {
        println!("  {:<10} {:>8} rows {:>4} attributes {:>6} orphans", s.name, s.rows, s.attributes, s.orphans);
    }
    println!("attributes:  {}", report.attributes);
    println!("sites:       {}", report.sites);
    for u in &report.unavailable {
        println!("UNAVAILABLE  {u}");
    }
    for p in &report.problems {
        println!("WARNING      {p}");
    }
}

// ── Entry point ──────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    let args = Args::parse();
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .try_init();

    let pack = DataPack::open(&args.pack).with_context(|| format!("opening {}", args.pack.display()))?;
    let atlas = Atlas::load(AtlasConfig::for_pack(&pack.root));
    let report = build_report(&pack, &atlas);

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_text(&report);
    }

    if !report.unavailable.is_empty() {
        bail!("{} store(s) failed to load", report.unavailable.len());
    }
    if args.strict && !report.problems.is_empty() {
        bail!("{} problem(s) found in strict mode", report.problems.len());
    }
    Ok(())
}
