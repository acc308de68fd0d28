use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use chrono::{NaiveDate, NaiveDateTime};
use tempfile::{tempdir, TempDir};

use rusty_doas::data::series::Interpolation;
use rusty_doas::data::setup::SpeciesSpec;
use rusty_doas::data::{Dataset, FormatCatalog, ImportConfig, ImportError, ImportSetup};

const HEADER: &str = "StartTime\tStopTime\tElev\tChi2\tSO2_Hermans\tSO2_Hermans err\tBrO\tBrO err";

fn at(h: u32, m: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2013, 9, 9)
        .unwrap()
        .and_hms_opt(h, m, 0)
        .unwrap()
}

/// One row per `(minute offset from 05:50, so2, bro)`.
fn write_doasis(dir: &TempDir, name: &str, rows: &[(u32, f64, f64)]) {
    let mut text = format!("{HEADER}\n");
    for (offset, so2, bro) in rows {
        let start = at(5, 50) + chrono::Duration::minutes(*offset as i64);
        let stop = start + chrono::Duration::seconds(30);
        text.push_str(&format!(
            "{}\t{}\t10\t0.9\t{so2}\t1e16\t{bro}\t1e13\n",
            start.format("%Y.%m.%d %H:%M:%S"),
            stop.format("%Y.%m.%d %H:%M:%S"),
        ));
    }
    fs::write(dir.path().join(name), text).unwrap();
}

fn scan_directory() -> TempDir {
    let dir = tempdir().unwrap();
    let rows = |scale: f64| -> Vec<(u32, f64, f64)> {
        (0..5)
            .map(|i| (i * 10, scale * (i + 1) as f64 * 1e17, 1e14))
            .collect()
    };
    write_doasis(&dir, "D130909_f01.dat", &rows(1.0));
    write_doasis(&dir, "D130909_f02.dat", &rows(1.1));
    write_doasis(&dir, "D130909_f03.dat", &rows(1.2));
    write_doasis(&dir, "D130909_f04.dat", &rows(0.0));
    // no fit scenario ID in the name
    write_doasis(&dir, "D130909_reference.dat", &rows(9.0));
    dir
}

fn scan_setup(dir: &Path) -> ImportSetup {
    let schema = FormatCatalog::builtin().get_schema("doasis").unwrap();
    let species = BTreeMap::from([
        (
            "so2".to_string(),
            SpeciesSpec::header("SO2_Hermans", &["f01", "f02", "f03"]),
        ),
        ("bro".to_string(), SpeciesSpec::header("BrO", &["f04"])),
    ]);
    let mut setup = ImportSetup::new(dir, schema, species)
        .with_window(Some(at(6, 0).into()), Some(at(7, 0).into()))
        .unwrap();
    let defaults = BTreeMap::from([("so2".to_string(), "f03".to_string())]);
    assert!(setup.resolve_defaults(&defaults));
    setup
}

#[test]
fn default_fit_scenario_series_matches_file_rows() {
    let dir = scan_directory();
    let dataset = Dataset::load(scan_setup(dir.path())).unwrap();

    // f03 has rows at 05:50, 06:00, 06:10, 06:20, 06:30; 05:50 is outside
    let so2 = dataset.get_series("so2", None, None, None).unwrap();
    assert_eq!(so2.fit_id(), "f03");
    assert_eq!(so2.len(), 4);
    assert_eq!(dataset.raw_result("f03").unwrap().len(), 4);

    let f01 = dataset.get_series("so2", Some("f01"), None, None).unwrap();
    assert_ne!(f01.mean(), so2.mean());
    assert_eq!(f01.mean(), Some(3.5e17));

    let bro = dataset.get_series("bro", None, None, None).unwrap();
    assert_eq!(bro.fit_id(), "f04");
}

#[test]
fn unknown_species_is_not_found() {
    let dir = scan_directory();
    let dataset = Dataset::load(scan_setup(dir.path())).unwrap();
    assert!(dataset.get_series("unknown_species", None, None, None).is_none());
    // bro is only configured for f04
    assert!(dataset.get_series("bro", Some("f01"), None, None).is_none());
}

#[test]
fn files_without_fit_id_are_excluded() {
    let dir = scan_directory();
    let dataset = Dataset::load(scan_setup(dir.path())).unwrap();
    let total: usize = dataset.raw_results().values().map(|t| t.len()).sum();
    assert_eq!(total, 16);
    let max = dataset
        .get_series("so2", Some("f03"), None, None)
        .and_then(|s| s.series().max())
        .unwrap();
    assert!(max < 9.0e17);
}

#[test]
fn species_from_different_scenarios_can_be_merged() {
    let dir = scan_directory();
    let dataset = Dataset::load(scan_setup(dir.path())).unwrap();
    let a = dataset.get_series("so2", Some("f01"), None, None).unwrap();
    let b = dataset.get_series("so2", Some("f02"), None, None).unwrap();
    let (ma, mb) = dataset.merge_series(a.series(), b.series(), Interpolation::Linear, true);
    assert_eq!(ma.len(), 4);
    assert_eq!(ma.index(), mb.index());
    let ratio = mb.div(&ma);
    assert!(ratio.values().iter().all(|r| (r - 1.1).abs() < 1e-9));
}

#[test]
fn json_configuration_drives_the_import() {
    let dir = scan_directory();
    let json = format!(
        r#"{{
            "base_dir": {:?},
            "start": "2013-09-09 06:00:00",
            "stop": "2013-09-09 07:00:00",
            "species": {{
                "so2": ["SO2_Hermans", ["f01", "f02", "f03"]]
            }},
            "defaults": {{ "so2": "f02" }},
            "fit_err_factors": {{ "f02": 2.0 }}
        }}"#,
        dir.path().to_string_lossy()
    );
    let config = ImportConfig::from_json(&json).unwrap();
    let setup = ImportSetup::from_config(config, &FormatCatalog::builtin()).unwrap();
    let dataset = Dataset::load(setup).unwrap();

    let so2 = dataset.get_series("so2", None, None, None).unwrap();
    assert_eq!(so2.fit_id(), "f02");
    assert_eq!(so2.fit_err_corr_factor(), 2.0);
    assert_eq!(so2.len(), 4);
}

#[test]
fn fixed_column_format_imports_semicolon_files() {
    let dir = tempdir().unwrap();
    fs::write(
        dir.path().join("scan_f01.csv"),
        "start;stop;a;b;scans;so2;so2err\n\
         201309090628;201309090629;x;y;20;1.5e17;1e16\n\
         201309090630;201309090631;x;y;20;2.5e17;1e16\n",
    )
    .unwrap();
    let schema = FormatCatalog::builtin().get_schema("fake").unwrap();
    let species = BTreeMap::from([("so2".to_string(), SpeciesSpec::column(5, &["f01"]))]);
    let dataset = Dataset::load(ImportSetup::new(dir.path(), schema, species)).unwrap();

    let so2 = dataset.get_series("so2", None, None, None).unwrap();
    assert_eq!(so2.values(), &[1.5e17, 2.5e17]);
    assert_eq!(so2.fit_errs(), &[1e16, 1e16]);
    let scans = dataset.get_meta("f01", "num_scans", None, None).unwrap();
    assert_eq!(scans.to_time_series().mean(), Some(20.0));
}

#[test]
fn empty_directory_is_a_discovery_error() {
    let dir = tempdir().unwrap();
    let err = Dataset::load(scan_setup(dir.path())).unwrap_err();
    assert!(matches!(err, ImportError::NoMatchingFiles { .. }));
}

#[test]
fn latin1_header_does_not_abort_the_import() {
    let dir = scan_directory();
    let mut bytes = b"StartTime\tStopTime\tAzim \xb0\tSO2_Hermans\tSO2_Hermans err\n".to_vec();
    bytes.extend_from_slice(b"2013.09.09 06:15:00\t2013.09.09 06:15:30\t120\t7e17\t1e16\n");
    fs::write(dir.path().join("D130909_f02_latin1.dat"), bytes).unwrap();

    let dataset = Dataset::load(scan_setup(dir.path())).unwrap();
    assert_eq!(dataset.get_series("so2", Some("f01"), None, None).unwrap().len(), 4);
    let f02 = dataset.get_series("so2", Some("f02"), None, None).unwrap();
    assert_eq!(f02.len(), 5);
    assert!(f02.values().contains(&7e17));
}
