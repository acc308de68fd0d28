use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::Deserialize;

use super::catalog::{
    AccessMode, ColumnLocator, FormatCatalog, FormatSchema, SchemaEntries, SchemaValue,
};
use super::error::{ImportError, ImportResult};

/// Error correction factor for fit scenarios without an override.
pub const DEFAULT_FIT_ERR_FACTOR: f64 = 3.0;

/// Default window start when none is given.
pub fn default_start() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(1900, 1, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .unwrap_or(NaiveDateTime::MIN)
}

/// Default window stop when none is given.
pub fn default_stop() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(3000, 1, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .unwrap_or(NaiveDateTime::MAX)
}

// ---------------------------------------------------------------------------
// TimeInput – date, time or datetime, normalised to a datetime
// ---------------------------------------------------------------------------

/// A point in time as given by a caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum TimeInput {
    DateTime(NaiveDateTime),
    /// Midnight of that day.
    Date(NaiveDate),
    /// That time on 1900-01-01.
    Time(NaiveTime),
}

impl TimeInput {
    pub fn to_datetime(self) -> NaiveDateTime {
        match self {
            TimeInput::DateTime(dt) => dt,
            TimeInput::Date(d) => d.and_time(NaiveTime::MIN),
            TimeInput::Time(t) => default_start().date().and_time(t),
        }
    }
}

impl From<NaiveDateTime> for TimeInput {
    fn from(dt: NaiveDateTime) -> Self {
        TimeInput::DateTime(dt)
    }
}

impl From<NaiveDate> for TimeInput {
    fn from(d: NaiveDate) -> Self {
        TimeInput::Date(d)
    }
}

impl From<NaiveTime> for TimeInput {
    fn from(t: NaiveTime) -> Self {
        TimeInput::Time(t)
    }
}

impl FromStr for TimeInput {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"] {
            if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
                return Ok(TimeInput::DateTime(dt));
            }
        }
        if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
            return Ok(TimeInput::Date(d));
        }
        for fmt in ["%H:%M:%S", "%H:%M"] {
            if let Ok(t) = NaiveTime::parse_from_str(s, fmt) {
                return Ok(TimeInput::Time(t));
            }
        }
        Err(format!("'{s}' is neither a date, a time nor a datetime"))
    }
}

impl TryFrom<String> for TimeInput {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

// ---------------------------------------------------------------------------
// Species import mapping
// ---------------------------------------------------------------------------

/// Where one species lives and which fit scenarios carry it.
///
/// Deserialises from the compact pair `["SO2_Hermans", ["f01", "f02"]]`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "(ColumnLocator, Vec<String>)")]
pub struct SpeciesSpec {
    pub locator: ColumnLocator,
    pub fit_ids: Vec<String>,
}

impl SpeciesSpec {
    pub fn new(locator: ColumnLocator, fit_ids: &[&str]) -> Self {
        SpeciesSpec {
            locator,
            fit_ids: fit_ids.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn header(key: &str, fit_ids: &[&str]) -> Self {
        Self::new(ColumnLocator::HeaderSubstring(key.to_string()), fit_ids)
    }

    pub fn column(idx: usize, fit_ids: &[&str]) -> Self {
        Self::new(ColumnLocator::FixedIndex(idx), fit_ids)
    }
}

impl From<(ColumnLocator, Vec<String>)> for SpeciesSpec {
    fn from((locator, fit_ids): (ColumnLocator, Vec<String>)) -> Self {
        SpeciesSpec { locator, fit_ids }
    }
}

// ---------------------------------------------------------------------------
// ImportConfig – serde view of the setup
// ---------------------------------------------------------------------------

/// Result format reference: a registry name or inline registry entries.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum SchemaSource {
    Named(String),
    Inline(SchemaEntries),
}

impl Default for SchemaSource {
    fn default() -> Self {
        SchemaSource::Named("doasis".into())
    }
}

/// Import configuration as read from JSON.
#[derive(Debug, Clone, Deserialize)]
pub struct ImportConfig {
    pub base_dir: PathBuf,
    #[serde(default)]
    pub start: Option<TimeInput>,
    #[serde(default)]
    pub stop: Option<TimeInput>,
    #[serde(default)]
    pub schema: SchemaSource,
    /// Registry file; the built-in registry is used when absent.
    #[serde(default)]
    pub registry: Option<PathBuf>,
    pub species: BTreeMap<String, SpeciesSpec>,
    #[serde(default)]
    pub defaults: BTreeMap<String, String>,
    #[serde(default)]
    pub fit_err_factors: BTreeMap<String, f64>,
    #[serde(default)]
    pub device_id: String,
}

impl ImportConfig {
    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

// ---------------------------------------------------------------------------
// ImportSetup
// ---------------------------------------------------------------------------

/// Everything needed to import one batch of result files.
#[derive(Debug, Clone)]
pub struct ImportSetup {
    base_dir: PathBuf,
    start: NaiveDateTime,
    stop: NaiveDateTime,
    schema: FormatSchema,
    species: BTreeMap<String, SpeciesSpec>,
    default_fit_ids: BTreeMap<String, String>,
    fit_err_factors: BTreeMap<String, f64>,
    device_id: String,
}

impl ImportSetup {
    /// Setup spanning all time with first-listed default fit scenarios and
    /// default error factors.
    pub fn new(
        base_dir: impl Into<PathBuf>,
        schema: FormatSchema,
        species: BTreeMap<String, SpeciesSpec>,
    ) -> Self {
        let mut setup = ImportSetup {
            base_dir: base_dir.into(),
            start: default_start(),
            stop: default_stop(),
            schema,
            species,
            default_fit_ids: BTreeMap::new(),
            fit_err_factors: BTreeMap::new(),
            device_id: String::new(),
        };
        setup.resolve_defaults(&BTreeMap::new());
        setup.resolve_error_factors(&BTreeMap::new());
        setup
    }

    /// Build from a configuration, resolving named schemas in `catalog`.
    pub fn from_config(config: ImportConfig, catalog: &FormatCatalog) -> ImportResult<Self> {
        let schema = match &config.schema {
            SchemaSource::Named(name) => catalog.get_schema(name)?,
            SchemaSource::Inline(entries) => {
                let name = match entries.get("type") {
                    Some(SchemaValue::Text(name)) => name.clone(),
                    _ => "inline".to_string(),
                };
                FormatSchema::from_entries(&name, entries)?
            }
        };
        let mut setup = ImportSetup::new(config.base_dir, schema, config.species)
            .with_window(config.start, config.stop)?;
        setup.resolve_defaults(&config.defaults);
        setup.resolve_error_factors(&config.fit_err_factors);
        setup.device_id = config.device_id;
        Ok(setup)
    }

    /// Set both window bounds; `None` keeps the current bound.
    pub fn with_window(
        mut self,
        start: Option<TimeInput>,
        stop: Option<TimeInput>,
    ) -> ImportResult<Self> {
        let start = start.map(TimeInput::to_datetime).unwrap_or(self.start);
        let stop = stop.map(TimeInput::to_datetime).unwrap_or(self.stop);
        if start > stop {
            return Err(ImportError::InvalidSetup(format!(
                "start {start} is after stop {stop}"
            )));
        }
        self.start = start;
        self.stop = stop;
        Ok(self)
    }

    pub fn with_device_id(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = device_id.into();
        self
    }

    // ---- accessors ----

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn start(&self) -> NaiveDateTime {
        self.start
    }

    pub fn stop(&self) -> NaiveDateTime {
        self.stop
    }

    pub fn schema(&self) -> &FormatSchema {
        &self.schema
    }

    pub fn species(&self) -> &BTreeMap<String, SpeciesSpec> {
        &self.species
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn default_fit_ids(&self) -> &BTreeMap<String, String> {
        &self.default_fit_ids
    }

    pub fn default_fit_id(&self, species_id: &str) -> Option<&str> {
        self.default_fit_ids.get(species_id).map(String::as_str)
    }

    pub fn fit_err_factors(&self) -> &BTreeMap<String, f64> {
        &self.fit_err_factors
    }

    pub fn fit_err_factor(&self, fit_id: &str) -> f64 {
        self.fit_err_factors
            .get(fit_id)
            .copied()
            .unwrap_or(DEFAULT_FIT_ERR_FACTOR)
    }

    /// Fit scenarios listed for a species.
    pub fn fit_ids_for_species(&self, species_id: &str) -> Option<&[String]> {
        self.species.get(species_id).map(|s| s.fit_ids.as_slice())
    }

    pub fn access(&self) -> AccessMode {
        self.schema.access
    }

    pub fn header_access(&self) -> bool {
        self.schema.header_access()
    }

    pub fn first_data_row(&self) -> usize {
        self.schema.first_data_row()
    }

    // ---- mutation ----

    /// Move the window start. Rejected (returns false) if it would pass
    /// the stop time.
    pub fn set_start(&mut self, start: impl Into<TimeInput>) -> bool {
        let start = start.into().to_datetime();
        if start > self.stop {
            log::warn!("start {start} not applied: after stop {}", self.stop);
            return false;
        }
        self.start = start;
        true
    }

    pub fn set_stop(&mut self, stop: impl Into<TimeInput>) -> bool {
        let stop = stop.into().to_datetime();
        if stop < self.start {
            log::warn!("stop {stop} not applied: before start {}", self.start);
            return false;
        }
        self.stop = stop;
        true
    }

    /// Pick the default fit scenario of every species: the override if one
    /// is given, else the first listed scenario.
    ///
    /// Returns false and changes nothing while no species are configured.
    pub fn resolve_defaults(&mut self, overrides: &BTreeMap<String, String>) -> bool {
        if self.all_fit_scenario_ids().is_empty() {
            return false;
        }
        for (species_id, spec) in &self.species {
            let chosen = match overrides.get(species_id) {
                Some(fit_id) => {
                    if !spec.fit_ids.contains(fit_id) {
                        log::warn!(
                            "default fit scenario '{fit_id}' for '{species_id}' is not one of {:?}",
                            spec.fit_ids
                        );
                    }
                    fit_id.clone()
                }
                None => match spec.fit_ids.first() {
                    Some(first) => {
                        log::debug!("no default fit scenario for '{species_id}', using '{first}'");
                        first.clone()
                    }
                    None => continue,
                },
            };
            self.default_fit_ids.insert(species_id.clone(), chosen);
        }
        true
    }

    /// Set the fit error correction factor of every known fit scenario.
    pub fn resolve_error_factors(&mut self, overrides: &BTreeMap<String, f64>) {
        self.fit_err_factors = self
            .all_fit_scenario_ids()
            .into_iter()
            .map(|fit_id| {
                let factor = overrides
                    .get(&fit_id)
                    .copied()
                    .unwrap_or(DEFAULT_FIT_ERR_FACTOR);
                (fit_id, factor)
            })
            .collect();
    }

    // ---- derived views ----

    /// Every fit scenario referenced by any species, sorted and unique.
    pub fn all_fit_scenario_ids(&self) -> Vec<String> {
        self.species
            .values()
            .flat_map(|spec| spec.fit_ids.iter().cloned())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Sorted column search keys of all species.
    ///
    /// A key used by two species is logged and listed once.
    pub fn all_species_ids(&self) -> Vec<String> {
        let mut seen: BTreeMap<String, &str> = BTreeMap::new();
        for (species_id, spec) in &self.species {
            let key = spec.locator.key();
            if let Some(first) = seen.get(&key) {
                log::error!(
                    "column key '{key}' of '{species_id}' is already used by '{first}'"
                );
                continue;
            }
            seen.insert(key, species_id);
        }
        seen.into_keys().collect()
    }

    /// Every check that keeps this setup from being imported.
    pub fn completeness_issues(&self) -> Vec<String> {
        let mut issues = Vec::new();
        if !self.base_dir.is_dir() {
            issues.push(format!(
                "base directory {} does not exist",
                self.base_dir.display()
            ));
        }
        if self.start > self.stop {
            issues.push(format!("start {} is after stop {}", self.start, self.stop));
        }
        if self.species.is_empty() {
            issues.push("no species import information specified".to_string());
        }
        issues
    }

    /// Whether the setup can be imported; every failed check is logged.
    pub fn is_complete(&self) -> bool {
        let issues = self.completeness_issues();
        for issue in &issues {
            log::warn!("import setup: {issue}");
        }
        issues.is_empty()
    }
}

impl fmt::Display for ImportSetup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Import setup")?;
        writeln!(f, "  base dir:  {}", self.base_dir.display())?;
        writeln!(f, "  window:    {} .. {}", self.start, self.stop)?;
        writeln!(f, "  format:    {}", self.schema.name)?;
        if !self.device_id.is_empty() {
            writeln!(f, "  device:    {}", self.device_id)?;
        }
        for (species_id, spec) in &self.species {
            writeln!(
                f,
                "  {species_id}: '{}' in {:?}",
                spec.locator.key(),
                spec.fit_ids
            )?;
        }
        write!(f, "  fit scenarios: {:?}", self.all_fit_scenario_ids())
    }
}
