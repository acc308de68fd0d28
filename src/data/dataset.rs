use std::collections::BTreeMap;
use std::fmt;

use chrono::NaiveDateTime;

use super::error::{ImportError, ImportResult};
use super::filter::{any_strictly_inside, window_indices, TimeWindow};
use super::loader::ResultParser;
use super::locator::FileLocator;
use super::model::{err_field, Column, RawResultTable};
use super::series::{self, Interpolation, LinearFit, ResultSeries, TimeSeries};
use super::setup::{ImportSetup, TimeInput};

// ---------------------------------------------------------------------------
// MetaSeries – one metadata field over time
// ---------------------------------------------------------------------------

/// A metadata field of one fit scenario, indexed by acquisition start.
#[derive(Debug, Clone, PartialEq)]
pub struct MetaSeries {
    pub field: String,
    pub index: Vec<NaiveDateTime>,
    pub values: Column,
}

impl MetaSeries {
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Numeric view; NaN where a cell is not a number.
    pub fn to_time_series(&self) -> TimeSeries {
        TimeSeries::new(self.field.clone(), self.index.clone(), self.values.to_f64())
    }
}

/// Two species merged onto a common index, with the line through them.
#[derive(Debug, Clone, PartialEq)]
pub struct Correlation {
    pub x: TimeSeries,
    pub y: TimeSeries,
    pub fit: LinearFit,
}

// ---------------------------------------------------------------------------
// Dataset – imported results of one setup
// ---------------------------------------------------------------------------

/// Raw result tables of every fit scenario plus lookup by species.
#[derive(Debug, Clone)]
pub struct Dataset {
    setup: ImportSetup,
    raw_results: BTreeMap<String, RawResultTable>,
    /// First and last acquisition start over all non-empty fit scenarios.
    span: Option<TimeWindow>,
}

impl Dataset {
    pub fn new(setup: ImportSetup) -> Self {
        Dataset {
            setup,
            raw_results: BTreeMap::new(),
            span: None,
        }
    }

    /// Import setup, locate result files, parse them and load everything
    /// in one call.
    pub fn load(setup: ImportSetup) -> ImportResult<Self> {
        let mut dataset = Dataset::new(setup);
        dataset.load_raw_results()?;
        Ok(dataset)
    }

    pub fn setup(&self) -> &ImportSetup {
        &self.setup
    }

    pub fn raw_results(&self) -> &BTreeMap<String, RawResultTable> {
        &self.raw_results
    }

    pub fn raw_result(&self, fit_id: &str) -> Option<&RawResultTable> {
        self.raw_results.get(fit_id)
    }

    pub fn time_span(&self) -> Option<TimeWindow> {
        self.span
    }

    /// Replace all raw results with a fresh import.
    pub fn load_raw_results(&mut self) -> ImportResult<()> {
        let issues = self.setup.completeness_issues();
        if !issues.is_empty() {
            return Err(ImportError::IncompleteSetup(issues));
        }
        log::info!("importing results\n{}", self.setup);

        let located = FileLocator::new(&self.setup).locate()?;
        self.raw_results = ResultParser::parse_all(&self.setup, &located)?;
        self.span = None;
        self.span = Some(observed_span(&self.raw_results)?);
        Ok(())
    }

    /// Move the import window. Loaded results are discarded.
    pub fn change_time_interval(
        &mut self,
        start: Option<TimeInput>,
        stop: Option<TimeInput>,
    ) -> ImportResult<()> {
        self.setup = self.setup.clone().with_window(start, stop)?;
        self.raw_results.clear();
        self.span = None;
        Ok(())
    }

    /// Change default fit scenarios per species.
    pub fn set_default_fit_scenarios(&mut self, overrides: &BTreeMap<String, String>) -> bool {
        self.setup.resolve_defaults(overrides)
    }

    pub fn default_fit_id(&self, species_id: &str) -> Option<&str> {
        self.setup.default_fit_id(species_id)
    }

    /// Query window; omitted bounds fall back to the observed span, then to
    /// the import window.
    fn window(&self, start: Option<TimeInput>, stop: Option<TimeInput>) -> TimeWindow {
        let fallback = self
            .span
            .unwrap_or_else(|| TimeWindow::new(self.setup.start(), self.setup.stop()));
        TimeWindow::resolve(start, stop, fallback)
    }

    /// Rows of `table` whose start time lies in the window, with those
    /// start times.
    fn select_rows(
        &self,
        table: &RawResultTable,
        start: Option<TimeInput>,
        stop: Option<TimeInput>,
    ) -> Option<(Vec<usize>, Vec<NaiveDateTime>)> {
        let start_col = table.get("start")?;
        let window = self.window(start, stop);
        let rows: Vec<usize> = (0..table.len())
            .filter(|&row| start_col.timestamp_at(row).is_some_and(|t| window.contains(t)))
            .collect();
        let starts = rows.iter().filter_map(|&row| start_col.timestamp_at(row)).collect();
        Some((rows, starts))
    }

    /// Results of one species.
    ///
    /// Without `fit_id` the species' default fit scenario is used. `None`
    /// when the species or fit scenario is unknown or no spectra fall into
    /// the window. Values are indexed by the middle of each acquisition.
    pub fn get_series(
        &self,
        species_id: &str,
        fit_id: Option<&str>,
        start: Option<TimeInput>,
        stop: Option<TimeInput>,
    ) -> Option<ResultSeries> {
        let fit_id = fit_id.or_else(|| self.setup.default_fit_id(species_id))?;
        let table = self.raw_results.get(fit_id)?;
        let column = table.get(species_id)?;
        let (rows, starts) = self.select_rows(table, start, stop)?;
        if rows.is_empty() {
            log::debug!("{species_id} ({fit_id}): no spectra in window");
            return None;
        }

        let stops: Option<Vec<NaiveDateTime>> = table
            .get("stop")
            .and_then(|col| rows.iter().map(|&row| col.timestamp_at(row)).collect());
        let index: Vec<NaiveDateTime> = match &stops {
            Some(stops) => starts
                .iter()
                .zip(stops)
                .map(|(start, stop)| *start + (*stop - *start) / 2)
                .collect(),
            None => starts.clone(),
        };
        let values = rows.iter().map(|&row| column.f64_at(row)).collect();
        let fit_errs = match table.get(&err_field(species_id)) {
            Some(col) => rows.iter().map(|&row| col.f64_at(row)).collect(),
            None => vec![f64::NAN; rows.len()],
        };

        let series = ResultSeries::new(
            TimeSeries::new(species_id, index, values),
            fit_errs,
            fit_id,
            self.setup.fit_err_factor(fit_id),
        );
        Some(match stops {
            Some(stops) => series.with_acquisition_times(starts, stops),
            None => series,
        })
    }

    /// A metadata field of one fit scenario; `None` if it was not imported.
    pub fn get_meta(
        &self,
        fit_id: &str,
        field: &str,
        start: Option<TimeInput>,
        stop: Option<TimeInput>,
    ) -> Option<MetaSeries> {
        let table = self.raw_results.get(fit_id)?;
        let column = table.get(field)?;
        let (rows, index) = self.select_rows(table, start, stop)?;
        Some(MetaSeries {
            field: field.to_string(),
            index,
            values: column.select(&rows),
        })
    }

    /// Whether `fit_id` imported a column for `species_id`.
    ///
    /// With both bounds given, one of its spectra must also start strictly
    /// between them (the file acceptance test, not the inclusive row
    /// selection of [`Dataset::get_series`]).
    pub fn has_data(
        &self,
        fit_id: &str,
        species_id: &str,
        start: Option<TimeInput>,
        stop: Option<TimeInput>,
    ) -> bool {
        let Some(table) = self.raw_results.get(fit_id) else {
            return false;
        };
        if !table.contains(species_id) {
            return false;
        }
        match (start, stop) {
            (Some(start), Some(stop)) => {
                let window = TimeWindow::new(start.to_datetime(), stop.to_datetime());
                any_strictly_inside(&table.start_times(), &window)
            }
            _ => true,
        }
    }

    /// Acquisition start of every spectrum of a fit scenario.
    pub fn spectrum_times(&self, fit_id: &str) -> Option<Vec<NaiveDateTime>> {
        self.raw_results.get(fit_id).map(RawResultTable::start_times)
    }

    /// Spectra of a fit scenario inside the window, as row indices.
    pub fn rows_in_window(&self, fit_id: &str, window: &TimeWindow) -> Vec<usize> {
        self.spectrum_times(fit_id)
            .map(|times| window_indices(&times, window))
            .unwrap_or_default()
    }

    pub fn merge_series(
        &self,
        a: &TimeSeries,
        b: &TimeSeries,
        method: Interpolation,
        drop_na: bool,
    ) -> (TimeSeries, TimeSeries) {
        a.merge(b, method, drop_na)
    }

    pub fn linear_regression(
        &self,
        x: &[f64],
        y: &[f64],
        mask: Option<&[bool]>,
    ) -> Option<LinearFit> {
        series::linear_regression(x, y, mask)
    }

    /// Merge two species onto a common index and fit `y` against `x`.
    pub fn correlate(
        &self,
        species_x: &str,
        fit_x: Option<&str>,
        species_y: &str,
        fit_y: Option<&str>,
        start: Option<TimeInput>,
        stop: Option<TimeInput>,
    ) -> Option<Correlation> {
        let x = self.get_series(species_x, fit_x, start, stop)?;
        let y = self.get_series(species_y, fit_y, start, stop)?;
        let (x, y) = x.merge_with(y.series(), Interpolation::Linear, true);
        let fit = series::linear_regression(x.values(), y.values(), None)?;
        Some(Correlation { x, y, fit })
    }
}

/// First and last start time over the non-empty tables.
fn observed_span(tables: &BTreeMap<String, RawResultTable>) -> ImportResult<TimeWindow> {
    let times: Vec<NaiveDateTime> = tables
        .values()
        .filter(|t| !t.is_empty())
        .flat_map(RawResultTable::start_times)
        .collect();
    match (times.iter().min(), times.iter().max()) {
        (Some(start), Some(stop)) => Ok(TimeWindow::new(*start, *stop)),
        _ => Err(ImportError::NoData),
    }
}

impl fmt::Display for Dataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.setup)?;
        match self.span {
            Some(span) => writeln!(f, "observed: {} .. {}", span.start, span.stop)?,
            None => writeln!(f, "observed: no results loaded")?,
        }
        for (fit_id, table) in &self.raw_results {
            let fields: Vec<&str> = table.field_names().collect();
            writeln!(f, "  {fit_id}: {} spectra, fields {fields:?}", table.len())?;
        }
        Ok(())
    }
}
