use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{Duration, NaiveDate, NaiveDateTime};

const TIME_FORMAT: &str = "%Y.%m.%d %H:%M:%S";

const HEADER: &[&str] = &[
    "StartTime", "StopTime", "Expo", "Scans", "Azim", "Elev", "Geom", "Chi2", "Delta", "RMS",
    "FitLow", "FitHigh", "SO2_Hermans", "SO2_Hermans err", "BrO", "BrO err", "O4", "O4 err",
];

/// Fit scenarios written: ID, fit range in nm, SO2 scaling, BrO scaling.
const SCENARIOS: &[(&str, (f64, f64), f64, f64)] = &[
    ("f01", (314.8, 326.8), 1.00, 0.0),
    ("f02", (322.0, 332.0), 0.93, 0.0),
    ("f03", (314.8, 340.0), 1.06, 0.0),
    ("f04", (330.6, 352.8), 0.0, 1.0),
];

const SPECTRA: usize = 90;
const EXPOSURE_S: i64 = 30;

/// Minimal deterministic PRNG (xoshiro256**)
struct SimpleRng {
    state: [u64; 4],
}

impl SimpleRng {
    fn new(seed: u64) -> Self {
        let mut s = [0u64; 4];
        let mut x = seed;
        for slot in &mut s {
            x = x.wrapping_mul(6364136223846793005).wrapping_add(1);
            *slot = x;
        }
        SimpleRng { state: s }
    }

    fn next_u64(&mut self) -> u64 {
        let result = (self.state[1].wrapping_mul(5))
            .rotate_left(7)
            .wrapping_mul(9);
        let t = self.state[1] << 17;
        self.state[2] ^= self.state[0];
        self.state[3] ^= self.state[1];
        self.state[1] ^= self.state[2];
        self.state[0] ^= self.state[3];
        self.state[2] ^= t;
        self.state[3] = self.state[3].rotate_left(45);
        result
    }

    fn next_f64(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }

    /// Box-Muller transform for normal distribution
    fn gauss(&mut self, mean: f64, std_dev: f64) -> f64 {
        let u1 = self.next_f64().max(1e-15);
        let u2 = self.next_f64();
        let z = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos();
        mean + std_dev * z
    }
}

/// SCD of a plume crossing the field of view; peaks mid-scan.
fn plume(i: usize, peak: f64) -> f64 {
    let x = (i as f64 - SPECTRA as f64 / 2.0) / (SPECTRA as f64 / 8.0);
    peak * (-0.5 * x * x).exp()
}

fn write_scenario(
    dir: &Path,
    scan_start: NaiveDateTime,
    scenario: &(&str, (f64, f64), f64, f64),
    rng: &mut SimpleRng,
) -> Result<PathBuf> {
    let (fit_id, (fit_low, fit_high), so2_scale, bro_scale) = *scenario;
    let path = dir.join(format!("D{}_{fit_id}.dat", scan_start.format("%y%m%d_%H%M%S")));
    let mut writer = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .from_path(&path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    writer.write_record(HEADER)?;

    for i in 0..SPECTRA {
        let start = scan_start + Duration::seconds(i as i64 * (EXPOSURE_S + 10));
        let stop = start + Duration::seconds(EXPOSURE_S);
        let elev = -60.0 + 120.0 * i as f64 / (SPECTRA - 1) as f64;
        let so2_err = 2.0e16 + rng.gauss(0.0, 1.0e15).abs();
        let bro_err = 4.0e13 + rng.gauss(0.0, 2.0e12).abs();
        let o4_err = 1.0e41 + rng.gauss(0.0, 5.0e39).abs();
        let so2 = so2_scale * plume(i, 1.2e18) + rng.gauss(0.0, so2_err);
        let bro = bro_scale * plume(i, 6.0e14) + rng.gauss(0.0, bro_err);
        let o4 = 3.5e43 + rng.gauss(0.0, o4_err);

        let record = [
            start.format(TIME_FORMAT).to_string(),
            stop.format(TIME_FORMAT).to_string(),
            "1500".to_string(),
            "20".to_string(),
            "120.5".to_string(),
            format!("{elev:.1}"),
            if elev.abs() < 1e-9 { "zenith".to_string() } else { "scan".to_string() },
            format!("{:.4}", 0.8 + rng.next_f64() * 0.4),
            format!("{:.6}", 1e-3 + rng.next_f64() * 1e-4),
            format!("{:.6}", 8e-4 + rng.next_f64() * 1e-4),
            fit_low.to_string(),
            fit_high.to_string(),
            format!("{so2:.6e}"),
            format!("{so2_err:.6e}"),
            format!("{bro:.6e}"),
            format!("{bro_err:.6e}"),
            format!("{o4:.6e}"),
            format!("{o4_err:.6e}"),
        ];
        writer.write_record(&record)?;
    }
    writer.flush()?;
    Ok(path)
}

/// Import configuration matching the written files.
fn sample_config(dir: &Path) -> serde_json::Value {
    serde_json::json!({
        "base_dir": dir,
        "schema": "doasis",
        "species": {
            "so2": ["SO2_Hermans", ["f01", "f02", "f03"]],
            "bro": ["BrO", ["f04"]],
            "o4": ["O4", ["f04"]]
        },
        "defaults": { "so2": "f03" },
        "device_id": "sample"
    })
}

fn main() -> Result<()> {
    env_logger::init();

    let dir = PathBuf::from(
        std::env::args()
            .nth(1)
            .unwrap_or_else(|| "sample_results".to_string()),
    );
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create {}", dir.display()))?;

    let scan_start = NaiveDate::from_ymd_opt(2013, 9, 9)
        .and_then(|d| d.and_hms_opt(6, 28, 0))
        .context("Invalid scan start")?;

    let mut rng = SimpleRng::new(42);
    for scenario in SCENARIOS {
        let path = write_scenario(&dir, scan_start, scenario, &mut rng)?;
        log::info!("wrote {}", path.display());
    }

    let config_path = dir.join("import_config.json");
    let config = serde_json::to_string_pretty(&sample_config(&dir))?;
    std::fs::write(&config_path, config)
        .with_context(|| format!("Failed to write {}", config_path.display()))?;

    println!(
        "Wrote {} fit scenarios ({SPECTRA} spectra each) to {}; import with `rusty-doas load {}`",
        SCENARIOS.len(),
        dir.display(),
        config_path.display()
    );
    Ok(())
}
