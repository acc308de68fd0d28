/// Data layer: result file formats, discovery, parsing and lookup.
///
/// Architecture:
/// ```text
///   import_info.txt            ImportConfig (.json)
///        │                           │
///        ▼                           ▼
///   ┌──────────┐               ┌──────────┐
///   │ catalog   │ FormatSchema │  setup    │  window, species, defaults
///   └──────────┘ ────────────▶ └──────────┘
///                                    │
///                                    ▼
///                              ┌──────────┐
///                              │ locator   │  sniff time format, match files
///                              └──────────┘
///                                    │
///                                    ▼
///                              ┌──────────┐
///                              │  loader   │  resolve → accumulate → finalize
///                              └──────────┘
///                                    │  RawResultTable per fit scenario
///                                    ▼
///                              ┌──────────┐
///                              │ dataset   │  get_series / get_meta
///                              └──────────┘
///                                    │
///                                    ▼
///                              ┌──────────┐
///                              │  series   │  merge, statistics, regression
///                              └──────────┘
/// ```

pub mod catalog;
pub mod dataset;
pub mod error;
pub mod filter;
pub mod loader;
pub mod locator;
pub mod model;
pub mod series;
pub mod setup;

pub use catalog::FormatCatalog;
pub use dataset::Dataset;
pub use error::{ImportError, ImportResult};
pub use setup::{ImportConfig, ImportSetup};
