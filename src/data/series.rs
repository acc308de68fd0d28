use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};

use chrono::{Duration, NaiveDateTime};

// ---------------------------------------------------------------------------
// TimeSeries – time-indexed values
// ---------------------------------------------------------------------------

/// Named numeric values on a time index. NaN marks an undefined value.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeSeries {
    name: String,
    index: Vec<NaiveDateTime>,
    values: Vec<f64>,
}

/// Gap filling used when two series are aligned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Interpolation {
    /// Straight line between neighbours, treating samples as equally spaced.
    #[default]
    Linear,
    /// Straight line between neighbours, weighted by elapsed time.
    Time,
    /// Value of the closer neighbour in time.
    Nearest,
}

impl TimeSeries {
    /// # Panics
    /// If `index` and `values` differ in length.
    pub fn new(name: impl Into<String>, index: Vec<NaiveDateTime>, values: Vec<f64>) -> Self {
        assert_eq!(index.len(), values.len(), "index and values must have equal length");
        TimeSeries {
            name: name.into(),
            index,
            values,
        }
    }

    pub fn empty(name: impl Into<String>) -> Self {
        Self::new(name, Vec::new(), Vec::new())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn index(&self) -> &[NaiveDateTime] {
        &self.index
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (NaiveDateTime, f64)> + '_ {
        self.index.iter().copied().zip(self.values.iter().copied())
    }

    /// First timestamp.
    pub fn start(&self) -> Option<NaiveDateTime> {
        self.index.first().copied()
    }

    /// Last timestamp.
    pub fn stop(&self) -> Option<NaiveDateTime> {
        self.index.last().copied()
    }

    /// Value at `t` (first match).
    pub fn get(&self, t: NaiveDateTime) -> Option<f64> {
        self.index.iter().position(|x| *x == t).map(|i| self.values[i])
    }

    fn defined(&self) -> impl Iterator<Item = f64> + '_ {
        self.values.iter().copied().filter(|v| !v.is_nan())
    }

    /// Mean of the defined values.
    pub fn mean(&self) -> Option<f64> {
        let (sum, n) = self.defined().fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
        (n > 0).then(|| sum / n as f64)
    }

    /// Sample standard deviation (n - 1) of the defined values.
    pub fn std(&self) -> Option<f64> {
        let mean = self.mean()?;
        let (ss, n) = self
            .defined()
            .fold((0.0, 0usize), |(s, n), v| (s + (v - mean).powi(2), n + 1));
        (n > 1).then(|| (ss / (n - 1) as f64).sqrt())
    }

    pub fn median(&self) -> Option<f64> {
        let mut sorted: Vec<f64> = self.defined().collect();
        if sorted.is_empty() {
            return None;
        }
        sorted.sort_by(f64::total_cmp);
        let mid = sorted.len() / 2;
        Some(if sorted.len() % 2 == 0 {
            (sorted[mid - 1] + sorted[mid]) / 2.0
        } else {
            sorted[mid]
        })
    }

    pub fn min(&self) -> Option<f64> {
        self.defined().reduce(f64::min)
    }

    pub fn max(&self) -> Option<f64> {
        self.defined().reduce(f64::max)
    }

    /// Multiply every value by `factor`.
    pub fn scale(&self, factor: f64) -> TimeSeries {
        self.map_values(|v| v * factor)
    }

    /// Move the index by `delta`.
    pub fn shift(&self, delta: Duration) -> TimeSeries {
        TimeSeries {
            name: self.name.clone(),
            index: self.index.iter().map(|t| *t + delta).collect(),
            values: self.values.clone(),
        }
    }

    fn map_values(&self, f: impl Fn(f64) -> f64) -> TimeSeries {
        TimeSeries {
            name: self.name.clone(),
            index: self.index.clone(),
            values: self.values.iter().map(|v| f(*v)).collect(),
        }
    }

    pub fn add(&self, other: &TimeSeries) -> TimeSeries {
        self.combine(other, |a, b| a + b)
    }

    pub fn sub(&self, other: &TimeSeries) -> TimeSeries {
        self.combine(other, |a, b| a - b)
    }

    pub fn mul(&self, other: &TimeSeries) -> TimeSeries {
        self.combine(other, |a, b| a * b)
    }

    pub fn div(&self, other: &TimeSeries) -> TimeSeries {
        self.combine(other, |a, b| a / b)
    }

    /// Element-wise on the union of both indices; a timestamp present in
    /// only one series yields NaN.
    fn combine(&self, other: &TimeSeries, op: impl Fn(f64, f64) -> f64) -> TimeSeries {
        let index = union_index(&self.index, &other.index);
        let a = self.reindex(&index);
        let b = other.reindex(&index);
        let values = a.iter().zip(&b).map(|(x, y)| op(*x, *y)).collect();
        TimeSeries {
            name: self.name.clone(),
            index,
            values,
        }
    }

    /// Timestamp → value; a repeated timestamp keeps its first value.
    fn lookup(&self) -> BTreeMap<NaiveDateTime, f64> {
        let mut map = BTreeMap::new();
        let mut repeated = 0usize;
        for (t, v) in self.iter() {
            match map.entry(t) {
                Entry::Vacant(slot) => {
                    slot.insert(v);
                }
                Entry::Occupied(_) => repeated += 1,
            }
        }
        if repeated > 0 {
            log::warn!(
                "{}: {repeated} repeated timestamps, keeping the first value of each",
                self.name
            );
        }
        map
    }

    /// Values on another index; NaN where this series has no sample.
    pub fn reindex(&self, index: &[NaiveDateTime]) -> Vec<f64> {
        let lookup = self.lookup();
        index
            .iter()
            .map(|t| lookup.get(t).copied().unwrap_or(f64::NAN))
            .collect()
    }

    /// Align two series on the union of their timestamps and fill interior
    /// gaps with `method`. Rows where either side stays undefined are
    /// dropped when `drop_na` is set. Neither input is changed.
    pub fn merge(
        &self,
        other: &TimeSeries,
        method: Interpolation,
        drop_na: bool,
    ) -> (TimeSeries, TimeSeries) {
        let index = union_index(&self.index, &other.index);
        let mut a = self.reindex(&index);
        let mut b = other.reindex(&index);
        interpolate(&index, &mut a, method);
        interpolate(&index, &mut b, method);

        let keep: Vec<usize> = (0..index.len())
            .filter(|&i| !drop_na || (!a[i].is_nan() && !b[i].is_nan()))
            .collect();
        let pick = |values: &[f64]| keep.iter().map(|&i| values[i]).collect::<Vec<_>>();
        let kept_index: Vec<NaiveDateTime> = keep.iter().map(|&i| index[i]).collect();
        (
            TimeSeries::new(self.name.clone(), kept_index.clone(), pick(&a)),
            TimeSeries::new(other.name.clone(), kept_index, pick(&b)),
        )
    }
}

fn union_index(a: &[NaiveDateTime], b: &[NaiveDateTime]) -> Vec<NaiveDateTime> {
    a.iter()
        .chain(b)
        .copied()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Fill NaN runs that have a defined neighbour on both sides.
fn interpolate(index: &[NaiveDateTime], values: &mut [f64], method: Interpolation) {
    let defined: Vec<usize> = (0..values.len()).filter(|&i| !values[i].is_nan()).collect();
    for pair in defined.windows(2) {
        let (lo, hi) = (pair[0], pair[1]);
        if hi - lo < 2 {
            continue;
        }
        let (v0, v1) = (values[lo], values[hi]);
        let span_ms = (index[hi] - index[lo]).num_milliseconds() as f64;
        for k in lo + 1..hi {
            let elapsed_ms = (index[k] - index[lo]).num_milliseconds() as f64;
            values[k] = match method {
                Interpolation::Linear => v0 + (v1 - v0) * (k - lo) as f64 / (hi - lo) as f64,
                Interpolation::Time if span_ms > 0.0 => v0 + (v1 - v0) * elapsed_ms / span_ms,
                Interpolation::Time => v0,
                Interpolation::Nearest => {
                    if elapsed_ms <= span_ms - elapsed_ms {
                        v0
                    } else {
                        v1
                    }
                }
            };
        }
    }
}

// ---------------------------------------------------------------------------
// ResultSeries – one species from one fit scenario
// ---------------------------------------------------------------------------

/// Fit results of one species with their fit errors.
///
/// The index is the middle of each spectrum's acquisition; `start_acq` and
/// `stop_acq` keep the acquisition bounds when they were imported.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultSeries {
    series: TimeSeries,
    fit_errs: Vec<f64>,
    fit_id: String,
    fit_err_corr_factor: f64,
    start_acq: Vec<NaiveDateTime>,
    stop_acq: Vec<NaiveDateTime>,
}

impl ResultSeries {
    pub fn new(
        series: TimeSeries,
        fit_errs: Vec<f64>,
        fit_id: impl Into<String>,
        fit_err_corr_factor: f64,
    ) -> Self {
        ResultSeries {
            series,
            fit_errs,
            fit_id: fit_id.into(),
            fit_err_corr_factor,
            start_acq: Vec::new(),
            stop_acq: Vec::new(),
        }
    }

    pub fn with_acquisition_times(
        mut self,
        start_acq: Vec<NaiveDateTime>,
        stop_acq: Vec<NaiveDateTime>,
    ) -> Self {
        self.start_acq = start_acq;
        self.stop_acq = stop_acq;
        self
    }

    pub fn series(&self) -> &TimeSeries {
        &self.series
    }

    pub fn species(&self) -> &str {
        self.series.name()
    }

    pub fn fit_id(&self) -> &str {
        &self.fit_id
    }

    pub fn fit_errs(&self) -> &[f64] {
        &self.fit_errs
    }

    pub fn fit_err_corr_factor(&self) -> f64 {
        self.fit_err_corr_factor
    }

    pub fn start_acq(&self) -> &[NaiveDateTime] {
        &self.start_acq
    }

    pub fn stop_acq(&self) -> &[NaiveDateTime] {
        &self.stop_acq
    }

    pub fn index(&self) -> &[NaiveDateTime] {
        self.series.index()
    }

    pub fn values(&self) -> &[f64] {
        self.series.values()
    }

    pub fn len(&self) -> usize {
        self.series.len()
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }

    pub fn start(&self) -> Option<NaiveDateTime> {
        self.series.start()
    }

    pub fn stop(&self) -> Option<NaiveDateTime> {
        self.series.stop()
    }

    pub fn mean(&self) -> Option<f64> {
        self.series.mean()
    }

    pub fn std(&self) -> Option<f64> {
        self.series.std()
    }

    pub fn median(&self) -> Option<f64> {
        self.series.median()
    }

    /// Whether both acquisition arrays are present and match the values.
    pub fn has_acquisition_times(&self) -> bool {
        let n = self.len();
        n > 0 && self.start_acq.len() == n && self.stop_acq.len() == n
    }

    /// Correction factor × fit error, per value.
    pub fn detection_limits(&self) -> Vec<f64> {
        self.fit_errs
            .iter()
            .map(|e| e * self.fit_err_corr_factor)
            .collect()
    }

    /// Values exceeding their detection limit.
    pub fn above_detection_limit(&self) -> TimeSeries {
        let limits = self.detection_limits();
        let (index, values) = self
            .series
            .iter()
            .zip(limits)
            .filter(|((_, v), limit)| v > limit)
            .map(|(point, _)| point)
            .unzip();
        TimeSeries::new(self.species(), index, values)
    }

    /// Same results with every timestamp moved by `delta`.
    pub fn shift(&self, delta: Duration) -> ResultSeries {
        let shift_all = |times: &[NaiveDateTime]| -> Vec<NaiveDateTime> {
            times.iter().map(|t| *t + delta).collect()
        };
        ResultSeries {
            series: self.series.shift(delta),
            fit_errs: self.fit_errs.clone(),
            fit_id: self.fit_id.clone(),
            fit_err_corr_factor: self.fit_err_corr_factor,
            start_acq: shift_all(&self.start_acq),
            stop_acq: shift_all(&self.stop_acq),
        }
    }

    /// See [`TimeSeries::merge`].
    pub fn merge_with(
        &self,
        other: &TimeSeries,
        method: Interpolation,
        drop_na: bool,
    ) -> (TimeSeries, TimeSeries) {
        self.series.merge(other, method, drop_na)
    }
}

// ---------------------------------------------------------------------------
// Linear regression
// ---------------------------------------------------------------------------

/// `y = slope * x + intercept`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearFit {
    pub slope: f64,
    pub intercept: f64,
}

impl LinearFit {
    pub fn eval(&self, x: f64) -> f64 {
        self.slope * x + self.intercept
    }
}

/// Least-squares line through the points selected by `mask` (all when
/// `None`), ignoring pairs with a NaN. `None` if fewer than two usable
/// points or no spread in `x`.
pub fn linear_regression(x: &[f64], y: &[f64], mask: Option<&[bool]>) -> Option<LinearFit> {
    let points: Vec<(f64, f64)> = x
        .iter()
        .zip(y)
        .enumerate()
        .filter(|(i, _)| mask.map_or(true, |m| m.get(*i).copied().unwrap_or(false)))
        .map(|(_, (a, b))| (*a, *b))
        .filter(|(a, b)| !a.is_nan() && !b.is_nan())
        .collect();
    if points.len() < 2 {
        return None;
    }
    let n = points.len() as f64;
    let mean_x = points.iter().map(|p| p.0).sum::<f64>() / n;
    let mean_y = points.iter().map(|p| p.1).sum::<f64>() / n;
    let sxx: f64 = points.iter().map(|p| (p.0 - mean_x).powi(2)).sum();
    let sxy: f64 = points.iter().map(|p| (p.0 - mean_x) * (p.1 - mean_y)).sum();
    if sxx == 0.0 {
        return None;
    }
    let slope = sxy / sxx;
    Some(LinearFit {
        slope,
        intercept: mean_y - slope * mean_x,
    })
}
