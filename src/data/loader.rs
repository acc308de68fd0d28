use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use chrono::NaiveDateTime;

use super::catalog::FormatSchema;
use super::error::{ImportError, ImportResult};
use super::filter::TimeWindow;
use super::locator::LocatedFiles;
use super::model::{err_field, field_kind, CellValue, Column, RawResultTable};
use super::setup::ImportSetup;

/// All rows of a result file, header included.
pub type Rows = Vec<Vec<String>>;

// ---------------------------------------------------------------------------
// Delimited text reading
// ---------------------------------------------------------------------------

/// Read a whole delimited text file. Rows may differ in length; bytes that
/// are not UTF-8 (e.g. Latin-1 `°` in headers) become U+FFFD.
pub fn read_text_file(path: &Path, delimiter: char) -> ImportResult<Rows> {
    let csv_err = |source| ImportError::Csv {
        path: path.to_path_buf(),
        source,
    };
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter as u8)
        .has_headers(false)
        .flexible(true)
        .from_path(path)
        .map_err(csv_err)?;

    let mut rows = Vec::new();
    let mut lossy = 0usize;
    for record in reader.byte_records() {
        let record = record.map_err(csv_err)?;
        let row: Vec<String> = record
            .iter()
            .map(|field| match String::from_utf8_lossy(field) {
                Cow::Borrowed(text) => text.to_string(),
                Cow::Owned(text) => {
                    lossy += 1;
                    text
                }
            })
            .collect();
        rows.push(row);
    }
    if lossy > 0 {
        log::warn!("{}: {lossy} cells are not valid UTF-8", path.display());
    }
    Ok(rows)
}

/// Column holding the acquisition start time.
pub(crate) fn start_column(schema: &FormatSchema, header: &[String]) -> Option<usize> {
    schema
        .meta_columns
        .get("start")?
        .resolve(schema.access, header)
}

/// Start times of all data rows that parse with `time_format`.
pub(crate) fn start_times(
    rows: &[Vec<String>],
    column: usize,
    first_data_row: usize,
    time_format: &str,
) -> Vec<NaiveDateTime> {
    rows.iter()
        .skip(first_data_row)
        .filter_map(|row| row.get(column))
        .filter_map(|cell| NaiveDateTime::parse_from_str(cell.trim(), time_format).ok())
        .collect()
}

// ---------------------------------------------------------------------------
// ResultParser – per fit scenario: resolve → accumulate → finalize
// ---------------------------------------------------------------------------

/// Progress of one fit scenario through the parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParseStage {
    #[default]
    Pending,
    ColumnsResolved,
    RowsAccumulated,
    Finalized,
}

impl ParseStage {
    fn describe(self) -> &'static str {
        match self {
            ParseStage::Pending => "no columns are resolved",
            ParseStage::ColumnsResolved => "rows of the current file are unread",
            ParseStage::RowsAccumulated => "rows are accumulated",
            ParseStage::Finalized => "finalized",
        }
    }
}

#[derive(Debug, Default)]
struct ScenarioBuffers {
    stage: ParseStage,
    /// Field → column of the file currently being read.
    columns: BTreeMap<String, usize>,
    /// Append-only cell buffers, one per field, all of length `rows`.
    buffers: BTreeMap<String, Vec<CellValue>>,
    /// Fields found in at least one file.
    located: BTreeSet<String>,
    rows: usize,
    table: Option<RawResultTable>,
}

/// Parses result files into one [`RawResultTable`] per fit scenario.
pub struct ResultParser<'a> {
    setup: &'a ImportSetup,
    time_format: String,
    window: TimeWindow,
    scenarios: BTreeMap<String, ScenarioBuffers>,
    warnings: Vec<String>,
}

impl<'a> ResultParser<'a> {
    /// Parser for every fit scenario of `setup`, reading times with
    /// `time_format`.
    pub fn new(setup: &'a ImportSetup, time_format: impl Into<String>) -> Self {
        let mut scenarios = BTreeMap::new();
        for fit_id in setup.all_fit_scenario_ids() {
            let mut state = ScenarioBuffers::default();
            for field in setup.schema().meta_columns.keys() {
                state.buffers.insert(field.clone(), Vec::new());
            }
            for (species_id, spec) in setup.species() {
                if spec.fit_ids.contains(&fit_id) {
                    state.buffers.insert(species_id.clone(), Vec::new());
                    state.buffers.insert(err_field(species_id), Vec::new());
                }
            }
            scenarios.insert(fit_id, state);
        }
        ResultParser {
            setup,
            time_format: time_format.into(),
            window: TimeWindow::new(setup.start(), setup.stop()),
            scenarios,
            warnings: Vec::new(),
        }
    }

    /// Parse every located file and finalize all fit scenarios.
    pub fn parse_all(
        setup: &ImportSetup,
        located: &LocatedFiles,
    ) -> ImportResult<BTreeMap<String, RawResultTable>> {
        let mut parser = ResultParser::new(setup, located.time_format.clone());
        for fit_id in setup.all_fit_scenario_ids() {
            for path in located.files_for(&fit_id) {
                parser.parse_file(path, &fit_id)?;
            }
            let table = parser.finalize(&fit_id)?;
            log::info!("fit scenario {fit_id}: {} spectra imported", table.len());
        }
        for warning in parser.warnings() {
            log::warn!("{warning}");
        }
        Ok(parser.into_tables())
    }

    pub fn stage(&self, fit_id: &str) -> Option<ParseStage> {
        self.scenarios.get(fit_id).map(|s| s.stage)
    }

    /// Species columns that could not be located, one entry per file.
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    /// Read one file and accumulate its rows under `fit_id`.
    pub fn parse_file(&mut self, path: &Path, fit_id: &str) -> ImportResult<usize> {
        let rows = read_text_file(path, self.setup.schema().delimiter)?;
        let header = rows.first().map(Vec::as_slice).unwrap_or(&[]);
        self.resolve_columns(header, fit_id, path)?;
        let accepted = self.accumulate(&rows, fit_id)?;
        log::debug!(
            "{}: {accepted} of {} spectra inside {} .. {}",
            path.display(),
            rows.len().saturating_sub(self.setup.first_data_row()),
            self.window.start,
            self.window.stop
        );
        Ok(accepted)
    }

    /// Locate metadata and species columns of one file.
    ///
    /// A species that cannot be located is recorded as a warning and left
    /// empty for this file. A missing start time column is fatal.
    pub fn resolve_columns(
        &mut self,
        header_row: &[String],
        fit_id: &str,
        file: &Path,
    ) -> ImportResult<()> {
        let setup = self.setup;
        let schema = setup.schema();
        let state = scenario_mut(&mut self.scenarios, fit_id)?;
        if state.stage == ParseStage::Finalized {
            return Err(stage_error(fit_id, "resolve columns", state.stage));
        }

        let mut columns: BTreeMap<String, usize> = schema
            .meta_columns
            .iter()
            .filter_map(|(field, locator)| {
                locator
                    .resolve(schema.access, header_row)
                    .map(|idx| (field.clone(), idx))
            })
            .collect();
        if !columns.contains_key("start") {
            return Err(ImportError::TimestampColumnUnresolved {
                file: file.to_path_buf(),
            });
        }

        for (species_id, spec) in setup.species() {
            if !spec.fit_ids.iter().any(|id| id == fit_id) {
                continue;
            }
            match spec.locator.resolve(schema.access, header_row) {
                Some(idx) => {
                    columns.insert(species_id.clone(), idx);
                    columns.insert(err_field(species_id), idx + schema.fit_err_offset);
                }
                None => self.warnings.push(format!(
                    "{}: no column for species '{species_id}' (key '{}'), skipped",
                    file.display(),
                    spec.locator.key()
                )),
            }
        }

        state.located.extend(columns.keys().cloned());
        state.columns = columns;
        state.stage = ParseStage::ColumnsResolved;
        Ok(())
    }

    /// Append every data row whose start time lies inside the import
    /// window (inclusive). Returns the number of accepted rows.
    pub fn accumulate(&mut self, file_rows: &[Vec<String>], fit_id: &str) -> ImportResult<usize> {
        let first_data_row = self.setup.first_data_row();
        let time_format = self.time_format.as_str();
        let window = self.window;
        let state = scenario_mut(&mut self.scenarios, fit_id)?;
        if state.stage != ParseStage::ColumnsResolved {
            return Err(stage_error(fit_id, "accumulate rows", state.stage));
        }
        let start_col = state.columns["start"];

        let mut accepted = 0;
        for row in file_rows.iter().skip(first_data_row) {
            let Some(start) = row
                .get(start_col)
                .and_then(|cell| NaiveDateTime::parse_from_str(cell.trim(), time_format).ok())
            else {
                log::debug!("skipping row without readable start time: {row:?}");
                continue;
            };
            if !window.contains(start) {
                continue;
            }
            for (field, buffer) in state.buffers.iter_mut() {
                let cell = match state.columns.get(field) {
                    Some(&idx) => match row.get(idx) {
                        Some(raw) => CellValue::coerce(raw, field_kind(field), time_format),
                        None => CellValue::Missing,
                    },
                    None => CellValue::Missing,
                };
                buffer.push(cell);
            }
            accepted += 1;
        }

        state.rows += accepted;
        state.stage = ParseStage::RowsAccumulated;
        Ok(accepted)
    }

    /// Freeze the buffers of `fit_id` into fixed arrays.
    ///
    /// May be called repeatedly; each call rebuilds the table from the
    /// buffers. Fields never located in any file are left out.
    pub fn finalize(&mut self, fit_id: &str) -> ImportResult<&RawResultTable> {
        let state = scenario_mut(&mut self.scenarios, fit_id)?;
        if state.stage == ParseStage::ColumnsResolved {
            return Err(stage_error(fit_id, "finalize", state.stage));
        }
        let columns: BTreeMap<String, Column> = state
            .buffers
            .iter()
            .filter(|(field, _)| state.located.contains(*field))
            .map(|(field, cells)| (field.clone(), Column::from_cells(cells, field_kind(field))))
            .collect();
        let table = RawResultTable::from_buffers(columns, state.rows);
        state.stage = ParseStage::Finalized;
        Ok(state.table.insert(table))
    }

    /// Finalized tables of all fit scenarios.
    pub fn into_tables(mut self) -> BTreeMap<String, RawResultTable> {
        let fit_ids: Vec<String> = self.scenarios.keys().cloned().collect();
        for fit_id in &fit_ids {
            let needs_finalize = self
                .scenarios
                .get(fit_id)
                .is_some_and(|s| s.table.is_none() && s.stage != ParseStage::ColumnsResolved);
            if needs_finalize {
                if let Err(e) = self.finalize(fit_id) {
                    log::error!("{e}");
                }
            }
        }
        self.scenarios
            .into_iter()
            .filter_map(|(fit_id, state)| state.table.map(|t| (fit_id, t)))
            .collect()
    }
}

fn scenario_mut<'s>(
    scenarios: &'s mut BTreeMap<String, ScenarioBuffers>,
    fit_id: &str,
) -> ImportResult<&'s mut ScenarioBuffers> {
    scenarios
        .get_mut(fit_id)
        .ok_or_else(|| ImportError::InvalidSetup(format!("unknown fit scenario '{fit_id}'")))
}

fn stage_error(fit_id: &str, action: &'static str, stage: ParseStage) -> ImportError {
    ImportError::ParserStage {
        fit_id: fit_id.to_string(),
        action,
        stage: stage.describe(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::catalog::FormatCatalog;
    use crate::data::setup::SpeciesSpec;
    use chrono::NaiveDate;
    use std::io::Write;
    use std::path::PathBuf;

    fn row(cells: &[&str]) -> Vec<String> {
        cells.iter().map(|c| c.to_string()).collect()
    }

    fn header() -> Vec<String> {
        row(&[
            "StartTime",
            "StopTime",
            "Geom",
            "SO2_Hermans",
            "SO2 err",
            "O3_burrows",
            "O3 err",
        ])
    }

    fn data_rows() -> Rows {
        let t1 = "2013.09.09 06:00:00";
        let t2 = "2013.09.09 06:01:00";
        let t3 = "2013.09.09 07:00:00";
        vec![
            header(),
            row(&[t1, "2013.09.09 06:00:30", "zenith", "1.0e17", "1e16", "2", "0.2"]),
            row(&[t2, "2013.09.09 06:01:30", "15", "2.0e17", "1e16", "x", "0.2"]),
            row(&[t3, "2013.09.09 07:00:30", "zenith", "3.0e17", "1e16", "4", "0.2"]),
            row(&["garbage", "", "", "", "", "", ""]),
            row(&["2013.09.09 06:02:00"]),
        ]
    }

    fn setup() -> ImportSetup {
        let schema = FormatCatalog::builtin().get_schema("doasis").unwrap();
        let species = BTreeMap::from([
            ("so2".to_string(), SpeciesSpec::header("SO2_Hermans", &["f01"])),
            ("o3".to_string(), SpeciesSpec::header("O3_burrows", &["f01", "f02"])),
            ("bro".to_string(), SpeciesSpec::header("BrO", &["f01"])),
        ]);
        let day = NaiveDate::from_ymd_opt(2013, 9, 9).unwrap();
        ImportSetup::new("/tmp", schema, species)
            .with_window(
                Some(day.and_hms_opt(6, 0, 0).unwrap().into()),
                Some(day.and_hms_opt(6, 30, 0).unwrap().into()),
            )
            .unwrap()
    }

    const FMT: &str = "%Y.%m.%d %H:%M:%S";

    #[test]
    fn stages_advance_in_order() {
        let setup = setup();
        let mut parser = ResultParser::new(&setup, FMT);
        let file = PathBuf::from("f01.dat");
        assert_eq!(parser.stage("f01"), Some(ParseStage::Pending));
        assert!(parser.accumulate(&data_rows(), "f01").is_err());

        parser.resolve_columns(&header(), "f01", &file).unwrap();
        assert_eq!(parser.stage("f01"), Some(ParseStage::ColumnsResolved));
        assert!(parser.finalize("f01").is_err());

        parser.accumulate(&data_rows(), "f01").unwrap();
        assert_eq!(parser.stage("f01"), Some(ParseStage::RowsAccumulated));
        assert!(parser.accumulate(&data_rows(), "f01").is_err());

        parser.finalize("f01").unwrap();
        assert_eq!(parser.stage("f01"), Some(ParseStage::Finalized));
        assert!(parser.resolve_columns(&header(), "f01", &file).is_err());
    }

    #[test]
    fn rows_inside_window_share_length() {
        let setup = setup();
        let mut parser = ResultParser::new(&setup, FMT);
        parser.resolve_columns(&header(), "f01", Path::new("f01.dat")).unwrap();
        // 07:00 is outside, "garbage" is unreadable; the short 06:02 row counts
        assert_eq!(parser.accumulate(&data_rows(), "f01").unwrap(), 3);

        let table = parser.finalize("f01").unwrap().clone();
        assert_eq!(table.len(), 3);
        for column in table.columns().values() {
            assert_eq!(column.len(), 3);
        }
        assert_eq!(table.get("so2").unwrap().f64_at(1), 2.0e17);
        assert!(table.get("so2").unwrap().f64_at(2).is_nan());
        assert!(matches!(table.get("o3"), Some(Column::Mixed(_))));
        assert!(matches!(table.get("geom"), Some(Column::Mixed(_))));
        assert!(matches!(table.get("start"), Some(Column::Timestamp(_))));
        // never located
        assert!(!table.contains("bro"));
        assert!(!table.contains("texp"));
        assert_eq!(parser.warnings().len(), 1);
    }

    #[test]
    fn finalize_is_idempotent() {
        let setup = setup();
        let mut parser = ResultParser::new(&setup, FMT);
        parser.resolve_columns(&header(), "f01", Path::new("a.dat")).unwrap();
        parser.accumulate(&data_rows(), "f01").unwrap();
        let first = parser.finalize("f01").unwrap().clone();
        let second = parser.finalize("f01").unwrap().clone();
        assert_eq!(first, second);
    }

    #[test]
    fn buffers_accumulate_across_files() {
        let setup = setup();
        let mut parser = ResultParser::new(&setup, FMT);
        for name in ["a.dat", "b.dat"] {
            parser.resolve_columns(&header(), "f02", Path::new(name)).unwrap();
            parser.accumulate(&data_rows(), "f02").unwrap();
        }
        let table = parser.finalize("f02").unwrap();
        assert_eq!(table.len(), 6);
        assert!(!table.contains("so2"));
    }

    #[test]
    fn missing_start_column_is_fatal() {
        let setup = setup();
        let mut parser = ResultParser::new(&setup, FMT);
        let err = parser
            .resolve_columns(&row(&["Time", "SO2_Hermans"]), "f01", Path::new("x.dat"))
            .unwrap_err();
        assert!(matches!(err, ImportError::TimestampColumnUnresolved { .. }));
    }

    #[test]
    fn non_utf8_bytes_are_read_lossily() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"StartTime\tAzim \xb0\tSO2\n2013.09.09 06:00:00\t120\t1e17\n")
            .unwrap();
        let rows = read_text_file(file.path(), '\t').unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0][1], "Azim \u{fffd}");
        assert_eq!(rows[1][2], "1e17");
    }

    #[test]
    fn error_column_offset_follows_schema() {
        let catalog = FormatCatalog::from_text(
            "type: shifted\n\
             access_type: header_str\n\
             has_header_line: 1\n\
             file_type: dat\n\
             time_str_formats: %Y.%m.%d %H:%M:%S\n\
             delim: \\t\n\
             fit_err_add_col: 2\n\
             start: StartTime\n\
             ENDTYPE\n",
        );
        let schema = catalog.get_schema("shifted").unwrap();
        assert_eq!(schema.fit_err_offset, 2);
        let species = BTreeMap::from([("so2".to_string(), SpeciesSpec::header("SO2", &["f01"]))]);
        let setup = ImportSetup::new("/tmp", schema, species);

        let rows = vec![
            row(&["StartTime", "SO2", "SO2 shift", "SO2 err"]),
            row(&["2013.09.09 06:00:00", "1e17", "0.5", "2e16"]),
        ];
        let mut parser = ResultParser::new(&setup, FMT);
        parser.resolve_columns(&rows[0], "f01", Path::new("f01.dat")).unwrap();
        parser.accumulate(&rows, "f01").unwrap();
        let table = parser.finalize("f01").unwrap();
        assert_eq!(table.get("so2").unwrap().f64_at(0), 1e17);
        assert_eq!(table.get("so2_err").unwrap().f64_at(0), 2e16);
    }

    #[test]
    fn unknown_fit_scenario_is_rejected() {
        let setup = setup();
        let mut parser = ResultParser::new(&setup, FMT);
        assert!(parser.finalize("f99").is_err());
    }
}
