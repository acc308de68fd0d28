use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;

use super::error::{ImportError, ImportResult};
use super::filter::{any_strictly_inside, TimeWindow};
use super::loader::{read_text_file, start_column, start_times};
use super::setup::ImportSetup;

/// Result files per fit scenario, plus the time format every file is read
/// with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocatedFiles {
    pub files: BTreeMap<String, Vec<PathBuf>>,
    /// Index into the schema's candidate formats.
    pub time_format_index: usize,
    pub time_format: String,
}

impl LocatedFiles {
    pub fn files_for(&self, fit_id: &str) -> &[PathBuf] {
        self.files.get(fit_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn total(&self) -> usize {
        self.files.values().map(Vec::len).sum()
    }
}

/// Finds the result files of an import setup.
pub struct FileLocator<'a> {
    setup: &'a ImportSetup,
}

impl<'a> FileLocator<'a> {
    pub fn new(setup: &'a ImportSetup) -> Self {
        FileLocator { setup }
    }

    /// Files in the base directory whose name ends with the schema's file
    /// type, sorted by name.
    pub fn candidates(&self) -> ImportResult<Vec<PathBuf>> {
        let dir = self.setup.base_dir();
        let suffix = &self.setup.schema().file_type;
        let entries = std::fs::read_dir(dir).map_err(|e| ImportError::io(dir, e))?;

        let mut files = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| ImportError::io(dir, e))?.path();
            if path.is_file() && file_name(&path).ends_with(suffix.as_str()) {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    /// Index of the first candidate time format that reads the first data
    /// row of `rows`.
    pub fn sniff_time_format(&self, rows: &[Vec<String>], file: &Path) -> ImportResult<usize> {
        let schema = self.setup.schema();
        let unresolved = || ImportError::TimestampFormatUnresolved {
            file: file.to_path_buf(),
            formats: schema.time_formats.clone(),
        };
        let header = rows.first().map(Vec::as_slice).unwrap_or(&[]);
        let cell = start_column(schema, header)
            .and_then(|col| rows.get(self.setup.first_data_row())?.get(col))
            .ok_or_else(unresolved)?;

        let index = schema
            .time_formats
            .iter()
            .position(|fmt| NaiveDateTime::parse_from_str(cell.trim(), fmt).is_ok())
            .ok_or_else(unresolved)?;
        log::info!(
            "time format '{}' read from {}",
            schema.time_formats[index],
            file.display()
        );
        Ok(index)
    }

    /// Assign result files to fit scenarios.
    ///
    /// A file belongs to every fit scenario whose ID is part of its name,
    /// provided at least one of its spectra started strictly inside the
    /// import window.
    pub fn locate(&self) -> ImportResult<LocatedFiles> {
        let schema = self.setup.schema();
        let candidates = self.candidates()?;
        let Some(first) = candidates.first() else {
            return Err(ImportError::NoMatchingFiles {
                dir: self.setup.base_dir().to_path_buf(),
                file_type: schema.file_type.clone(),
            });
        };

        let sniffed = read_text_file(first, schema.delimiter)?;
        let time_format_index = self.sniff_time_format(&sniffed, first)?;
        let time_format = schema.time_formats[time_format_index].clone();

        let fit_ids = self.setup.all_fit_scenario_ids();
        let window = TimeWindow::new(self.setup.start(), self.setup.stop());
        let mut files: BTreeMap<String, Vec<PathBuf>> = fit_ids
            .iter()
            .map(|id| (id.clone(), Vec::new()))
            .collect();

        for path in &candidates {
            let name = file_name(path);
            let matching: Vec<&String> = fit_ids
                .iter()
                .filter(|id| name.contains(id.as_str()))
                .collect();
            if matching.is_empty() {
                log::debug!("{name}: no fit scenario ID in file name");
                continue;
            }

            let rows = read_text_file(path, schema.delimiter)?;
            let header = rows.first().map(Vec::as_slice).unwrap_or(&[]);
            let Some(col) = start_column(schema, header) else {
                log::warn!("{name}: start time column not found, file skipped");
                continue;
            };
            let times = start_times(&rows, col, self.setup.first_data_row(), &time_format);
            if !any_strictly_inside(&times, &window) {
                log::debug!("{name}: no spectra inside {} .. {}", window.start, window.stop);
                continue;
            }

            for fit_id in matching {
                log::debug!("{name}: accepted for fit scenario {fit_id}");
                if let Some(list) = files.get_mut(fit_id) {
                    list.push(path.clone());
                }
            }
        }

        let located = LocatedFiles {
            files,
            time_format_index,
            time_format,
        };
        log::info!(
            "{} result files located in {}",
            located.total(),
            self.setup.base_dir().display()
        );
        Ok(located)
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}
