//! Full data-pack round trip through an `AtlasHandle`: load, tile lookup,
//! site dissolve, extraction, editing and data-pack install.

use std::collections::BTreeMap;
use std::path::Path;

use approx::assert_relative_eq;
use atlas_core::config::{install, Settings};
use atlas_core::{AtlasConfig, AtlasError, AtlasHandle, BoundingBox, Scenario};

fn square(id: i64, x0: f64, y0: f64, size: f64, area_km2: f64) -> String {
    let (x1, y1) = (x0 + size, y0 + size);
    format!(
        r#"{{"type":"Feature","properties":{{"HYBAS_ID":{id},"area_km2":{area_km2}}},
            "geometry":{{"type":"Polygon","coordinates":[[[{x0},{y0}],[{x1},{y0}],[{x1},{y1}],[{x0},{y1}],[{x0},{y0}]]]}}}}"#
    )
}

fn write_pack(root: &Path) {
    let data = root.join("data");
    std::fs::create_dir_all(data.join("mbtiles")).unwrap();
    std::fs::create_dir_all(root.join("resources").join("mbtiles")).unwrap();
    std::fs::write(root.join("manifest.json"), r#"{"format":"datapack","version":"1.0"}"#).unwrap();

    let features = [
        square(101, 30.0, -1.0, 0.1, 5.0),
        square(102, 30.1, -1.0, 0.1, 7.0),
        square(103, 32.0, 1.0, 0.1, 3.0),
    ];
    std::fs::write(
        data.join("catchments.geojson"),
        format!(r#"{{"type":"FeatureCollection","features":[{}]}}"#, features.join(",")),
    )
    .unwrap();
    std::fs::write(data.join("reference.csv"), "catchID,rainfall,runoff\n101,10,1\n102,22,NA\n103,4,2\n").unwrap();
    std::fs::write(data.join("current.csv"), "catchID,rainfall,runoff\n101,8,1.5\n102,20,0.5\n103,5,2.5\n").unwrap();

    let conn = rusqlite::Connection::open(root.join("resources").join("mbtiles").join("catchments.mbtiles")).unwrap();
    conn.execute_batch(
        "CREATE TABLE metadata (name TEXT, value TEXT);
         CREATE TABLE tiles (zoom_level INTEGER, tile_column INTEGER, tile_row INTEGER, tile_data BLOB);
         INSERT INTO metadata VALUES ('format', 'pbf');
         INSERT INTO tiles VALUES (1, 1, 0, X'1f8b0800');",
    )
    .unwrap();
}

#[test]
fn dissolve_extract_union_reextract() {
    let pack = tempfile::tempdir().unwrap();
    write_pack(pack.path());
    let handle = AtlasHandle::load(AtlasConfig::for_pack(pack.path()));
    let atlas = handle.snapshot();
    assert!(atlas.unavailable().is_empty(), "{:?}", atlas.unavailable());

    // XYZ row 1 at zoom 1 is TMS row 0.
    assert_eq!(atlas.tiles().unwrap().get_tile("catchments", 1, 1, 1).unwrap(), vec![0x1f, 0x8b, 0x08, 0x00]);

    let boundaries = atlas.boundary_engine().unwrap();
    let aggregator = atlas.indicator_aggregator().unwrap();

    let site = boundaries.dissolve("Lake shore", &[101, 102]).unwrap();
    let site = aggregator.extract(site.id).unwrap();
    let ind = site.indicators.clone().unwrap();
    assert_eq!(ind.catchment_count, 2);
    assert_relative_eq!(ind.total_area_km2, 12.0);
    assert_relative_eq!(ind.reference["rainfall"], (10.0 * 5.0 + 22.0 * 7.0) / 12.0);
    // 102 has no reference runoff, so 101 alone decides it.
    assert_relative_eq!(ind.reference["runoff"], 1.0);
    assert_eq!(ind.ideal, ind.reference);

    let grown = boundaries.union(site.id, 103).unwrap();
    assert_eq!(grown.catchment_ids, vec!["101", "102", "103"]);
    assert_eq!(grown.indicators, site.indicators, "edits must not re-extract");

    let site = aggregator.extract(site.id).unwrap();
    let ind = site.indicators.unwrap();
    assert_eq!(ind.catchment_count, 3);
    assert_relative_eq!(ind.total_area_km2, 15.0);
    assert_eq!(ind.catchment_ids, vec!["101", "102", "103"]);
}

#[test]
fn ideal_values_survive_reextraction_until_reset() {
    let pack = tempfile::tempdir().unwrap();
    write_pack(pack.path());
    let handle = AtlasHandle::load(AtlasConfig::for_pack(pack.path()));
    let atlas = handle.snapshot();
    let boundaries = atlas.boundary_engine().unwrap();
    let aggregator = atlas.indicator_aggregator().unwrap();

    let site = boundaries.dissolve("Upland", &[101]).unwrap();
    assert!(matches!(
        aggregator.update_ideal(site.id, &BTreeMap::from([("rainfall".to_string(), 1.0)])),
        Err(AtlasError::InvalidInput(_))
    ));
    assert!(matches!(aggregator.reset_ideal(site.id), Err(AtlasError::InvalidInput(_))));

    aggregator.extract(site.id).unwrap();
    aggregator
        .update_ideal(site.id, &BTreeMap::from([("rainfall".to_string(), 99.0)]))
        .unwrap();
    let site = aggregator.extract(site.id).unwrap();
    let ind = site.indicators.unwrap();
    assert_eq!(ind.ideal["rainfall"], 99.0);
    assert_eq!(ind.ideal["runoff"], 1.0);

    let site = aggregator.reset_ideal(site.id).unwrap();
    let ind = site.indicators.unwrap();
    assert_eq!(ind.ideal, ind.reference);
}

#[test]
fn catchment_queries_through_the_snapshot() {
    let pack = tempfile::tempdir().unwrap();
    write_pack(pack.path());
    let handle = AtlasHandle::load(AtlasConfig::for_pack(pack.path()));
    let atlas = handle.snapshot();
    let store = atlas.catchments().unwrap();

    let fc = store
        .query_catchments(Scenario::Current, "runoff", &BoundingBox::new(29.0, -2.0, 31.0, 0.0))
        .unwrap();
    assert_eq!(fc.features.len(), 2);

    let cmp = store.comparison_data(Scenario::Reference, Scenario::Current, "runoff").unwrap();
    assert!(!cmp.contains_key(&102));
    assert_eq!(store.domain_range("rainfall").unwrap().max, 22.0);
}

#[test]
fn install_swaps_in_the_new_pack() {
    let empty = tempfile::tempdir().unwrap();
    let handle = AtlasHandle::load(AtlasConfig::for_pack(empty.path()));
    let before = handle.snapshot();
    assert!(before.catchments().is_err());

    let pack = tempfile::tempdir().unwrap();
    write_pack(pack.path());
    let settings_dir = tempfile::tempdir().unwrap();
    let settings_path = settings_dir.path().join("settings.json");

    let installed = install(pack.path(), &settings_path, &handle).unwrap();
    assert_eq!(installed.manifest.version.as_deref(), Some("1.0"));
    assert_eq!(Settings::load(&settings_path).unwrap().data_pack_path.as_deref(), Some(pack.path()));

    assert_eq!(handle.snapshot().catchments().unwrap().len(), 3);
    // The old snapshot is untouched.
    assert!(before.catchments().is_err());
}
