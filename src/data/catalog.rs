use std::collections::{BTreeMap, BTreeSet};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use super::error::{ImportError, ImportResult};
use super::model::{is_meta_field, META_FIELDS};

/// Registry shipped with the crate.
const BUILTIN_REGISTRY: &str = include_str!("../../data/import_info.txt");

/// Registry keys that describe the file layout itself.
const LAYOUT_KEYS: &[&str] = &[
    "type",
    "access_type",
    "has_header_line",
    "file_type",
    "time_str_formats",
    "delim",
    "fit_err_add_col",
];

/// Keys a schema must define.
const REQUIRED_KEYS: &[&str] = &[
    "start",
    "delim",
    "access_type",
    "has_header_line",
    "file_type",
    "time_str_formats",
];

const END_MARKER: &str = "ENDTYPE";

// ---------------------------------------------------------------------------
// Column addressing
// ---------------------------------------------------------------------------

/// How columns are addressed in a result file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    /// First header cell containing a search string (`header_str`).
    HeaderSubstring,
    /// Fixed 0-based column index (`col_index`).
    ColumnIndex,
}

impl AccessMode {
    fn from_key(value: &str) -> Option<Self> {
        match value {
            "header_str" => Some(AccessMode::HeaderSubstring),
            "col_index" => Some(AccessMode::ColumnIndex),
            _ => None,
        }
    }

    fn as_key(self) -> &'static str {
        match self {
            AccessMode::HeaderSubstring => "header_str",
            AccessMode::ColumnIndex => "col_index",
        }
    }
}

/// Where to find a column: a header substring or a fixed index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
#[serde(untagged)]
pub enum ColumnLocator {
    FixedIndex(usize),
    HeaderSubstring(String),
}

impl ColumnLocator {
    /// Resolve to a column index for one file.
    ///
    /// In index mode a header string is read as a number; a fixed index is
    /// taken as is in either mode.
    pub fn resolve(&self, access: AccessMode, header: &[String]) -> Option<usize> {
        match (self, access) {
            (ColumnLocator::FixedIndex(idx), _) => Some(*idx),
            (ColumnLocator::HeaderSubstring(key), AccessMode::HeaderSubstring) => {
                find_col_index(key, header)
            }
            (ColumnLocator::HeaderSubstring(key), AccessMode::ColumnIndex) => {
                key.trim().parse().ok()
            }
        }
    }

    /// The locator as registry / log text.
    pub fn key(&self) -> String {
        match self {
            ColumnLocator::FixedIndex(idx) => idx.to_string(),
            ColumnLocator::HeaderSubstring(key) => key.clone(),
        }
    }
}

/// Index of the first header cell containing `substr`.
pub fn find_col_index(substr: &str, header: &[String]) -> Option<usize> {
    header.iter().position(|cell| cell.contains(substr))
}

// ---------------------------------------------------------------------------
// Raw registry entries
// ---------------------------------------------------------------------------

/// A registry value: integer, text, or comma-separated list.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum SchemaValue {
    Int(i64),
    Text(String),
    List(Vec<String>),
}

impl SchemaValue {
    fn as_text(&self) -> String {
        match self {
            SchemaValue::Int(i) => i.to_string(),
            SchemaValue::Text(s) => s.clone(),
            SchemaValue::List(items) => items.join(","),
        }
    }

    fn as_list(&self) -> Vec<String> {
        match self {
            SchemaValue::List(items) => items.clone(),
            other => vec![other.as_text()],
        }
    }
}

/// Untyped key/value form of a schema, as found in a registry block or an
/// inline configuration.
pub type SchemaEntries = BTreeMap<String, SchemaValue>;

// ---------------------------------------------------------------------------
// FormatSchema
// ---------------------------------------------------------------------------

/// Layout of one family of result files.
#[derive(Debug, Clone, PartialEq)]
pub struct FormatSchema {
    pub name: String,
    pub access: AccessMode,
    pub has_header_line: bool,
    /// File name suffix, e.g. `dat`.
    pub file_type: String,
    /// Candidate time formats (chrono `strftime` syntax), tried in order.
    pub time_formats: Vec<String>,
    pub delimiter: char,
    /// Columns between a species and its fit error.
    pub fit_err_offset: usize,
    /// Metadata field → column locator.
    pub meta_columns: BTreeMap<String, ColumnLocator>,
}

impl FormatSchema {
    /// Build a schema from raw entries. Unknown keys are dropped with a
    /// warning; missing required keys are an error.
    pub fn from_entries(name: &str, entries: &SchemaEntries) -> ImportResult<Self> {
        for key in entries.keys() {
            if !is_known_key(key) {
                log::warn!("format '{name}': ignoring unknown key '{key}'");
            }
        }
        let missing: Vec<&str> = REQUIRED_KEYS
            .iter()
            .copied()
            .filter(|k| !entries.contains_key(*k))
            .collect();
        if !missing.is_empty() {
            return Err(ImportError::malformed(
                name,
                format!("missing keys {missing:?}"),
            ));
        }

        let access_raw = entries["access_type"].as_text();
        let access = AccessMode::from_key(access_raw.trim()).ok_or_else(|| {
            ImportError::malformed(name, format!("unknown access_type '{access_raw}'"))
        })?;

        let has_header_line = match &entries["has_header_line"] {
            SchemaValue::Int(v) => *v != 0,
            other => {
                return Err(ImportError::malformed(
                    name,
                    format!("has_header_line must be 0 or 1, got '{}'", other.as_text()),
                ))
            }
        };
        if access == AccessMode::HeaderSubstring && !has_header_line {
            return Err(ImportError::malformed(
                name,
                "header_str access requires has_header_line = 1",
            ));
        }

        let time_formats: Vec<String> = entries["time_str_formats"]
            .as_list()
            .into_iter()
            .map(|f| f.trim().to_string())
            .filter(|f| !f.is_empty())
            .collect();
        if time_formats.is_empty() {
            return Err(ImportError::malformed(name, "time_str_formats is empty"));
        }

        let delim_raw = entries["delim"].as_text();
        let mut delim_chars = delim_raw.chars();
        let delimiter = match (delim_chars.next(), delim_chars.next()) {
            (Some(c), None) if c.is_ascii() => c,
            _ => {
                return Err(ImportError::malformed(
                    name,
                    format!("delim must be a single ASCII character, got {delim_raw:?}"),
                ))
            }
        };

        let fit_err_offset = match entries.get("fit_err_add_col") {
            None => 1,
            Some(SchemaValue::Int(v)) if *v >= 0 => *v as usize,
            Some(other) => {
                return Err(ImportError::malformed(
                    name,
                    format!(
                        "fit_err_add_col must be a non-negative integer, got '{}'",
                        other.as_text()
                    ),
                ))
            }
        };

        let meta_columns = entries
            .iter()
            .filter(|(key, _)| is_meta_field(key))
            .map(|(key, value)| {
                let locator = match (access, value) {
                    (AccessMode::ColumnIndex, SchemaValue::Int(idx)) if *idx >= 0 => {
                        ColumnLocator::FixedIndex(*idx as usize)
                    }
                    _ => ColumnLocator::HeaderSubstring(value.as_text().trim().to_string()),
                };
                (key.clone(), locator)
            })
            .collect();

        Ok(FormatSchema {
            name: name.to_string(),
            access,
            has_header_line,
            file_type: entries["file_type"].as_text().trim().to_string(),
            time_formats,
            delimiter,
            fit_err_offset,
            meta_columns,
        })
    }

    /// Whether columns are looked up in the header row.
    pub fn header_access(&self) -> bool {
        self.access == AccessMode::HeaderSubstring && self.has_header_line
    }

    /// Index of the first data row.
    pub fn first_data_row(&self) -> usize {
        usize::from(self.has_header_line)
    }

    /// Render as a registry block (terminated by `ENDTYPE`).
    pub fn to_block(&self) -> String {
        let mut out = format!("type: {}\n", self.name);
        out.push_str(&format!("access_type: {}\n", self.access.as_key()));
        out.push_str(&format!("has_header_line: {}\n", u8::from(self.has_header_line)));
        out.push_str(&format!("file_type: {}\n", self.file_type));
        out.push_str(&format!("time_str_formats: {}\n", self.time_formats.join(", ")));
        out.push_str(&format!("delim: {}\n", encode_escapes(self.delimiter)));
        out.push_str(&format!("fit_err_add_col: {}\n", self.fit_err_offset));
        for (field, _) in META_FIELDS {
            if let Some(locator) = self.meta_columns.get(*field) {
                out.push_str(&format!("{field}: {}\n", locator.key()));
            }
        }
        out.push_str(END_MARKER);
        out.push('\n');
        out
    }
}

fn is_known_key(key: &str) -> bool {
    LAYOUT_KEYS.contains(&key) || is_meta_field(key)
}

// ---------------------------------------------------------------------------
// FormatCatalog
// ---------------------------------------------------------------------------

/// Named result file formats, backed by a registry text.
#[derive(Debug, Clone)]
pub struct FormatCatalog {
    registry: String,
    /// Registrations are appended here too when set.
    path: Option<PathBuf>,
}

impl Default for FormatCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}

impl FormatCatalog {
    /// The registry compiled into the crate; registrations stay in memory.
    pub fn builtin() -> Self {
        Self::from_text(BUILTIN_REGISTRY)
    }

    pub fn from_text(registry: impl Into<String>) -> Self {
        FormatCatalog {
            registry: registry.into(),
            path: None,
        }
    }

    /// Load a registry file; new formats are appended to it.
    pub fn from_path(path: &Path) -> ImportResult<Self> {
        let registry = std::fs::read_to_string(path).map_err(|e| ImportError::io(path, e))?;
        Ok(FormatCatalog {
            registry,
            path: Some(path.to_path_buf()),
        })
    }

    /// Look up a format by name.
    pub fn get_schema(&self, name: &str) -> ImportResult<FormatSchema> {
        let entries = read_block(&self.registry, name)
            .ok_or_else(|| ImportError::SchemaNotFound(name.to_string()))?;
        FormatSchema::from_entries(name, &entries)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.list_schema_names().contains(name)
    }

    pub fn list_schema_names(&self) -> BTreeSet<String> {
        self.registry
            .lines()
            .filter_map(|line| {
                let (key, value) = line.trim().split_once(':')?;
                (key.trim() == "type").then(|| strip_comment(value).trim().to_string())
            })
            .filter(|name| !name.is_empty())
            .collect()
    }

    /// Append a new format to the registry.
    pub fn register_schema(&mut self, schema: &FormatSchema) -> ImportResult<()> {
        if self.contains(&schema.name) {
            return Err(ImportError::DuplicateSchema(schema.name.clone()));
        }
        let block = format!("\n{}", schema.to_block());
        if let Some(path) = &self.path {
            let mut file = OpenOptions::new()
                .append(true)
                .open(path)
                .map_err(|e| ImportError::io(path, e))?;
            file.write_all(block.as_bytes())
                .map_err(|e| ImportError::io(path, e))?;
            log::info!("registered format '{}' in {}", schema.name, path.display());
        } else {
            log::info!("registered format '{}'", schema.name);
        }
        if !self.registry.ends_with('\n') {
            self.registry.push('\n');
        }
        self.registry.push_str(&block);
        Ok(())
    }

    /// Register raw entries; the name is taken from the `type` entry.
    pub fn register_entries(&mut self, entries: &SchemaEntries) -> ImportResult<FormatSchema> {
        let name = entries
            .get("type")
            .map(SchemaValue::as_text)
            .ok_or_else(|| ImportError::malformed("<unnamed>", "entry 'type' is required"))?;
        let schema = FormatSchema::from_entries(&name, entries)?;
        self.register_schema(&schema)?;
        Ok(schema)
    }
}

// ---------------------------------------------------------------------------
// Registry text parsing
// ---------------------------------------------------------------------------

fn strip_comment(value: &str) -> &str {
    value.split('#').next().unwrap_or("")
}

/// Entries of the block `type: <name>` ... `ENDTYPE`, if it is complete.
fn read_block(registry: &str, name: &str) -> Option<SchemaEntries> {
    let mut block: Option<SchemaEntries> = None;
    for line in registry.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if line.starts_with(END_MARKER) {
            if block.is_some() {
                return block;
            }
            continue;
        }
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim();
        match block.as_mut() {
            None => {
                if key == "type" && strip_comment(value).trim() == name {
                    let mut entries = SchemaEntries::new();
                    entries.insert("type".into(), SchemaValue::Text(name.to_string()));
                    block = Some(entries);
                }
            }
            Some(entries) => {
                entries.insert(key.to_string(), parse_value(key, value));
            }
        }
    }
    None
}

fn parse_value(key: &str, raw: &str) -> SchemaValue {
    let value = strip_comment(raw).trim();
    match key {
        "time_str_formats" => SchemaValue::List(
            value
                .split(',')
                .map(|f| f.trim().to_string())
                .filter(|f| !f.is_empty())
                .collect(),
        ),
        "delim" => SchemaValue::Text(decode_escapes(value)),
        _ => {
            let first = value.split(',').next().unwrap_or("").trim();
            match first.parse::<i64>() {
                Ok(v) => SchemaValue::Int(v),
                Err(_) => SchemaValue::Text(first.to_string()),
            }
        }
    }
}

/// Decode `\t`, `\n`, `\r`, `\\`, `\xNN` and `\uNNNN`.
fn decode_escapes(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('t') => out.push('\t'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('\\') => out.push('\\'),
            Some(kind @ ('x' | 'u')) => {
                let width = if kind == 'x' { 2 } else { 4 };
                let hex: String = (0..width).filter_map(|_| chars.next()).collect();
                match u32::from_str_radix(&hex, 16).ok().and_then(char::from_u32) {
                    Some(decoded) if hex.len() == width => out.push(decoded),
                    _ => {
                        out.push('\\');
                        out.push(kind);
                        out.push_str(&hex);
                    }
                }
            }
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

/// Inverse of [`decode_escapes`] for a delimiter.
fn encode_escapes(c: char) -> String {
    match c {
        '\t' => "\\t".into(),
        '\n' => "\\n".into(),
        '\r' => "\\r".into(),
        '\\' => "\\\\".into(),
        ',' | '#' | ' ' => format!("\\x{:02x}", c as u32),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn builtin_doasis_schema() {
        let schema = FormatCatalog::builtin().get_schema("doasis").unwrap();
        assert_eq!(schema.access, AccessMode::HeaderSubstring);
        assert!(schema.has_header_line);
        assert_eq!(schema.delimiter, '\t');
        assert_eq!(schema.file_type, "dat");
        assert_eq!(schema.time_formats.len(), 3);
        assert_eq!(schema.time_formats[1], "%d.%m.%Y %H:%M:%S");
        assert_eq!(schema.fit_err_offset, 1);
        assert_eq!(
            schema.meta_columns.get("fit_high"),
            Some(&ColumnLocator::HeaderSubstring("FitHigh".into()))
        );
    }

    #[test]
    fn builtin_fake_schema_uses_indices() {
        let schema = FormatCatalog::builtin().get_schema("fake").unwrap();
        assert_eq!(schema.access, AccessMode::ColumnIndex);
        assert_eq!(schema.delimiter, ';');
        assert_eq!(schema.meta_columns["stop"], ColumnLocator::FixedIndex(1));
        assert_eq!(schema.meta_columns["num_scans"], ColumnLocator::FixedIndex(4));
    }

    #[test]
    fn unknown_schema_is_an_error() {
        let err = FormatCatalog::builtin().get_schema("nope").unwrap_err();
        assert!(matches!(err, ImportError::SchemaNotFound(name) if name == "nope"));
    }

    #[test]
    fn unterminated_block_is_not_found() {
        let catalog = FormatCatalog::from_text("type: open\naccess_type: col_index\n");
        assert!(matches!(
            catalog.get_schema("open"),
            Err(ImportError::SchemaNotFound(_))
        ));
    }

    #[test]
    fn list_schema_names_reads_type_lines() {
        let names = FormatCatalog::builtin().list_schema_names();
        assert!(names.contains("doasis"));
        assert!(names.contains("fake"));
        assert_eq!(names.len(), 2);
    }

    #[test]
    fn header_access_requires_header_line() {
        let catalog = FormatCatalog::from_text(
            "type: bad\naccess_type: header_str\nhas_header_line: 0\nfile_type: txt\n\
             time_str_formats: %Y\ndelim: ;\nstart: Start\nENDTYPE\n",
        );
        assert!(matches!(
            catalog.get_schema("bad"),
            Err(ImportError::MalformedSchema { .. })
        ));
    }

    #[test]
    fn missing_required_keys_are_reported() {
        let mut entries = SchemaEntries::new();
        entries.insert("access_type".into(), SchemaValue::Text("col_index".into()));
        let err = FormatSchema::from_entries("thin", &entries).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("delim"));
        assert!(msg.contains("time_str_formats"));
    }

    #[test]
    fn escapes_decode_and_encode() {
        assert_eq!(decode_escapes("\\t"), "\t");
        assert_eq!(decode_escapes("\\x3b"), ";");
        assert_eq!(decode_escapes("\\u002c"), ",");
        assert_eq!(decode_escapes(";"), ";");
        assert_eq!(decode_escapes("\\q"), "\\q");
        for c in ['\t', ',', ';', '#', ' ', '|'] {
            assert_eq!(decode_escapes(&encode_escapes(c)), c.to_string());
        }
    }

    fn fake_entries() -> SchemaEntries {
        let mut entries = SchemaEntries::new();
        entries.insert("type".into(), SchemaValue::Text("fake2".into()));
        entries.insert("access_type".into(), SchemaValue::Text("col_index".into()));
        entries.insert("has_header_line".into(), SchemaValue::Int(1));
        entries.insert(
            "time_str_formats".into(),
            SchemaValue::List(vec!["%Y%m%d%H%M".into(), "%Y-%m-%d %H:%M".into()]),
        );
        entries.insert("file_type".into(), SchemaValue::Text("csv".into()));
        entries.insert("delim".into(), SchemaValue::Text(",".into()));
        entries.insert("start".into(), SchemaValue::Int(0));
        entries.insert("stop".into(), SchemaValue::Int(1));
        entries.insert("bla".into(), SchemaValue::Text("Blub".into()));
        entries.insert("num_scans".into(), SchemaValue::Int(4));
        entries
    }

    #[test]
    fn register_then_get_round_trips() {
        let mut catalog = FormatCatalog::builtin();
        let registered = catalog.register_entries(&fake_entries()).unwrap();
        let loaded = catalog.get_schema("fake2").unwrap();
        assert_eq!(registered, loaded);
        assert_eq!(loaded.delimiter, ',');
        assert!(!loaded.meta_columns.contains_key("bla"));
        assert_eq!(loaded.meta_columns.len(), 3);
    }

    #[test]
    fn register_rejects_duplicates() {
        let mut catalog = FormatCatalog::builtin();
        let doasis = catalog.get_schema("doasis").unwrap();
        assert!(matches!(
            catalog.register_schema(&doasis),
            Err(ImportError::DuplicateSchema(name)) if name == "doasis"
        ));
    }

    #[test]
    fn register_appends_to_registry_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{BUILTIN_REGISTRY}").unwrap();

        let mut catalog = FormatCatalog::from_path(file.path()).unwrap();
        catalog.register_entries(&fake_entries()).unwrap();

        let reopened = FormatCatalog::from_path(file.path()).unwrap();
        assert!(reopened.contains("fake2"));
        assert_eq!(
            reopened.get_schema("fake2").unwrap(),
            catalog.get_schema("fake2").unwrap()
        );
    }
}
