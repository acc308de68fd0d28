use std::collections::BTreeMap;
use std::fmt;

use chrono::NaiveDateTime;

// ---------------------------------------------------------------------------
// Field catalog – metadata columns every result format may carry
// ---------------------------------------------------------------------------

/// How a metadata column is coerced on import.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Parsed with the sniffed time format.
    Timestamp,
    Float,
    /// Declared textual, but still goes through the float-first coercion.
    Text,
}

/// Known metadata fields and their coercion kind.
pub const META_FIELDS: &[(&str, FieldKind)] = &[
    ("start", FieldKind::Timestamp),
    ("stop", FieldKind::Timestamp),
    ("texp", FieldKind::Float),
    ("num_scans", FieldKind::Float),
    ("azim", FieldKind::Float),
    ("elev", FieldKind::Float),
    ("lat", FieldKind::Float),
    ("lon", FieldKind::Float),
    ("geom", FieldKind::Text),
    ("chi2", FieldKind::Float),
    ("delta", FieldKind::Float),
    ("rms", FieldKind::Float),
    ("fit_low", FieldKind::Float),
    ("fit_high", FieldKind::Float),
];

/// Kind of a named field; species and their error columns are floats.
pub fn field_kind(name: &str) -> FieldKind {
    META_FIELDS
        .iter()
        .find(|(field, _)| *field == name)
        .map(|(_, kind)| *kind)
        .unwrap_or(FieldKind::Float)
}

/// Whether `name` is one of the catalogued metadata fields.
pub fn is_meta_field(name: &str) -> bool {
    META_FIELDS.iter().any(|(field, _)| *field == name)
}

/// Name of the error field paired with a species.
pub fn err_field(species_id: &str) -> String {
    format!("{species_id}_err")
}

// ---------------------------------------------------------------------------
// CellValue – one coerced cell of a result file
// ---------------------------------------------------------------------------

/// A single imported cell.
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Float(f64),
    Timestamp(NaiveDateTime),
    /// Raw text kept when coercion failed.
    Text(String),
    /// Column not present in the file (or row too short).
    Missing,
}

impl CellValue {
    /// Coerce a raw cell.
    ///
    /// Timestamp fields use `time_format`; every other field tries `f64`
    /// first. Anything that does not convert is kept verbatim.
    pub fn coerce(raw: &str, kind: FieldKind, time_format: &str) -> Self {
        let trimmed = raw.trim();
        match kind {
            FieldKind::Timestamp => match NaiveDateTime::parse_from_str(trimmed, time_format) {
                Ok(ts) => CellValue::Timestamp(ts),
                Err(_) => CellValue::Text(raw.to_string()),
            },
            FieldKind::Float | FieldKind::Text => match trimmed.parse::<f64>() {
                Ok(v) => CellValue::Float(v),
                Err(_) => CellValue::Text(raw.to_string()),
            },
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            CellValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<NaiveDateTime> {
        match self {
            CellValue::Timestamp(ts) => Some(*ts),
            _ => None,
        }
    }
}

impl fmt::Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CellValue::Float(v) => write!(f, "{v}"),
            CellValue::Timestamp(ts) => write!(f, "{ts}"),
            CellValue::Text(s) => write!(f, "{s}"),
            CellValue::Missing => write!(f, "<missing>"),
        }
    }
}

// ---------------------------------------------------------------------------
// Column – a finalized, fixed-length field array
// ---------------------------------------------------------------------------

/// A frozen field array.
///
/// Homogeneous buffers become `Float` or `Timestamp`; anything that mixes
/// coerced and raw cells stays `Mixed`.
#[derive(Debug, Clone, PartialEq)]
pub enum Column {
    Float(Vec<f64>),
    Timestamp(Vec<NaiveDateTime>),
    Mixed(Vec<CellValue>),
}

impl Column {
    /// Freeze a buffer of cells.
    ///
    /// `Missing` cells are tolerated in float columns (as NaN) but force a
    /// timestamp column to `Mixed`.
    pub fn from_cells(cells: &[CellValue], kind: FieldKind) -> Self {
        if cells.is_empty() {
            return match kind {
                FieldKind::Timestamp => Column::Timestamp(Vec::new()),
                _ => Column::Float(Vec::new()),
            };
        }
        if let Some(times) = cells
            .iter()
            .map(CellValue::as_timestamp)
            .collect::<Option<Vec<_>>>()
        {
            return Column::Timestamp(times);
        }
        let floats: Option<Vec<f64>> = cells
            .iter()
            .map(|c| match c {
                CellValue::Float(v) => Some(*v),
                CellValue::Missing => Some(f64::NAN),
                _ => None,
            })
            .collect();
        match floats {
            Some(values) => Column::Float(values),
            None => Column::Mixed(cells.to_vec()),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Column::Float(v) => v.len(),
            Column::Timestamp(v) => v.len(),
            Column::Mixed(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cell at `row` as a float (NaN where it is not numeric).
    pub fn f64_at(&self, row: usize) -> f64 {
        match self {
            Column::Float(v) => v.get(row).copied().unwrap_or(f64::NAN),
            Column::Mixed(v) => v.get(row).and_then(CellValue::as_f64).unwrap_or(f64::NAN),
            Column::Timestamp(_) => f64::NAN,
        }
    }

    /// Cell at `row` as a timestamp, if it is one.
    pub fn timestamp_at(&self, row: usize) -> Option<NaiveDateTime> {
        match self {
            Column::Timestamp(v) => v.get(row).copied(),
            Column::Mixed(v) => v.get(row).and_then(CellValue::as_timestamp),
            Column::Float(_) => None,
        }
    }

    /// Numeric view of the whole column.
    pub fn to_f64(&self) -> Vec<f64> {
        (0..self.len()).map(|row| self.f64_at(row)).collect()
    }

    /// Sub-select rows by index.
    pub fn select(&self, rows: &[usize]) -> Column {
        match self {
            Column::Float(v) => Column::Float(rows.iter().map(|&i| v[i]).collect()),
            Column::Timestamp(v) => Column::Timestamp(rows.iter().map(|&i| v[i]).collect()),
            Column::Mixed(v) => Column::Mixed(rows.iter().map(|&i| v[i].clone()).collect()),
        }
    }
}

// ---------------------------------------------------------------------------
// RawResultTable – all fields imported for one fit scenario
// ---------------------------------------------------------------------------

/// Every imported field of one fit scenario. All columns share `rows`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawResultTable {
    columns: BTreeMap<String, Column>,
    rows: usize,
}

impl RawResultTable {
    /// Build a table; `None` if the columns disagree on length.
    pub fn new(columns: BTreeMap<String, Column>) -> Option<Self> {
        let rows = columns.values().next().map(Column::len).unwrap_or(0);
        if columns.values().any(|c| c.len() != rows) {
            return None;
        }
        Some(RawResultTable { columns, rows })
    }

    /// Table from parser buffers that are known to hold `rows` cells each.
    pub(crate) fn from_buffers(columns: BTreeMap<String, Column>, rows: usize) -> Self {
        debug_assert!(columns.values().all(|c| c.len() == rows));
        RawResultTable { columns, rows }
    }

    pub fn get(&self, field: &str) -> Option<&Column> {
        self.columns.get(field)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.columns.contains_key(field)
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(String::as_str)
    }

    pub fn columns(&self) -> &BTreeMap<String, Column> {
        &self.columns
    }

    /// Number of accepted rows.
    pub fn len(&self) -> usize {
        self.rows
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    /// Acquisition start time of every row that has one.
    pub fn start_times(&self) -> Vec<NaiveDateTime> {
        self.timestamps("start")
    }

    pub fn stop_times(&self) -> Vec<NaiveDateTime> {
        self.timestamps("stop")
    }

    fn timestamps(&self, field: &str) -> Vec<NaiveDateTime> {
        match self.columns.get(field) {
            Some(col) => (0..col.len()).filter_map(|i| col.timestamp_at(i)).collect(),
            None => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn ts(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2013, 9, 9)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    #[test]
    fn coerce_prefers_float_and_falls_back_to_text() {
        assert_eq!(
            CellValue::coerce(" 1.5e17 ", FieldKind::Float, ""),
            CellValue::Float(1.5e17)
        );
        assert_eq!(
            CellValue::coerce("zenith", FieldKind::Text, ""),
            CellValue::Text("zenith".into())
        );
        assert_eq!(
            CellValue::coerce("12", FieldKind::Text, ""),
            CellValue::Float(12.0)
        );
    }

    #[test]
    fn coerce_timestamp_uses_format() {
        assert_eq!(
            CellValue::coerce("201309090628", FieldKind::Timestamp, "%Y%m%d%H%M"),
            CellValue::Timestamp(ts(6, 28))
        );
        assert_eq!(
            CellValue::coerce("not a time", FieldKind::Timestamp, "%Y%m%d%H%M"),
            CellValue::Text("not a time".into())
        );
    }

    #[test]
    fn column_from_cells_picks_narrowest_type() {
        let floats = [CellValue::Float(1.0), CellValue::Missing];
        match Column::from_cells(&floats, FieldKind::Float) {
            Column::Float(v) => {
                assert_eq!(v[0], 1.0);
                assert!(v[1].is_nan());
            }
            other => panic!("expected float column, got {other:?}"),
        }

        let times = [CellValue::Timestamp(ts(6, 0)), CellValue::Timestamp(ts(6, 1))];
        assert_eq!(
            Column::from_cells(&times, FieldKind::Timestamp),
            Column::Timestamp(vec![ts(6, 0), ts(6, 1)])
        );

        let mixed = [CellValue::Float(1.0), CellValue::Text("x".into())];
        assert!(matches!(
            Column::from_cells(&mixed, FieldKind::Float),
            Column::Mixed(_)
        ));
        assert!(Column::from_cells(&mixed, FieldKind::Float).f64_at(1).is_nan());
    }

    #[test]
    fn table_rejects_ragged_columns() {
        let mut cols = BTreeMap::new();
        cols.insert("a".to_string(), Column::Float(vec![1.0, 2.0]));
        cols.insert("b".to_string(), Column::Float(vec![1.0]));
        assert!(RawResultTable::new(cols).is_none());
    }

    #[test]
    fn field_kinds() {
        assert_eq!(field_kind("start"), FieldKind::Timestamp);
        assert_eq!(field_kind("geom"), FieldKind::Text);
        assert_eq!(field_kind("so2"), FieldKind::Float);
        assert!(is_meta_field("chi2"));
        assert!(!is_meta_field("so2_err"));
        assert_eq!(err_field("so2"), "so2_err");
    }
}
