use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use camino::Utf8PathBuf;
use chrono::Datelike;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::domain::{Location, Signal};
use crate::error::AqError;

pub const CONFIG_FILE_NAME: &str = "aqsat.json";
pub const DEFAULT_OUTPUT: &str = "S5P_AQI_Data_Delhi_NCR_2020_Present_NRTI.csv";
pub const DEFAULT_HYPERLOCAL_OUTPUT: &str = "delhi_hyperlocal_context_features_1000m.csv";
pub const DEFAULT_MERGE_OUTPUT: &str = "S5P_AQI_Data_with_hyperlocal_features.csv";
pub const SCHEMA_VERSION: u32 = 1;
pub const DEFAULT_START_YEAR: i32 = 2020;
pub const DEFAULT_CALL_DELAY_MS: u64 = 500;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 5_000;
pub const DEFAULT_MIN_RESUME_BYTES: u64 = 50;
pub const DEFAULT_SCALE_M: u32 = 1_000;
pub const DEFAULT_RADIUS_M: f64 = 1_000.0;
pub const DEFAULT_BACKEND_ENDPOINT: &str = "https://earthengine.googleapis.com/v1";
pub const DEFAULT_OVERPASS_URL: &str = "https://overpass-api.de/api/interpreter";

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub locations: Option<Vec<LocationEntry>>,
    #[serde(default)]
    pub signals: Option<Vec<SignalEntry>>,
    #[serde(default)]
    pub extraction: ExtractionEntry,
    #[serde(default)]
    pub backend: BackendEntry,
    #[serde(default)]
    pub hyperlocal: HyperlocalEntry,
    #[serde(default)]
    pub merge: MergeEntry,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LocationEntry {
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SignalEntry {
    pub name: String,
    pub collection: String,
    pub band: String,
    #[serde(default)]
    pub unit: Option<String>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct ExtractionEntry {
    #[serde(default)]
    pub start_year: Option<i32>,
    #[serde(default)]
    pub call_delay_ms: Option<u64>,
    #[serde(default)]
    pub retry_delay_ms: Option<u64>,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub min_resume_bytes: Option<u64>,
    #[serde(default)]
    pub scale_m: Option<u32>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct BackendEntry {
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub project: Option<String>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct HyperlocalEntry {
    #[serde(default)]
    pub stations: Option<Vec<LocationEntry>>,
    #[serde(default)]
    pub radius_m: Option<f64>,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub overpass_url: Option<String>,
    #[serde(default)]
    pub call_delay_ms: Option<u64>,
    #[serde(default)]
    pub retry_delay_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct MergeEntry {
    #[serde(default)]
    pub output: Option<String>,
    /// Hyperlocal station name to satellite location name.
    #[serde(default)]
    pub station_aliases: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone)]
pub struct BackendSettings {
    pub endpoint: String,
    pub project: Option<String>,
}

#[derive(Debug, Clone)]
pub struct HyperlocalSettings {
    pub stations: Vec<Location>,
    pub radius_m: f64,
    pub output: Utf8PathBuf,
    pub overpass_url: String,
    pub call_delay: Duration,
    pub retry_delay: Duration,
}

#[derive(Debug, Clone)]
pub struct MergeSettings {
    pub output: Utf8PathBuf,
    pub station_aliases: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub locations: Vec<Location>,
    pub signals: Vec<Signal>,
    pub start_year: i32,
    pub call_delay: Duration,
    pub retry_delay: Duration,
    pub output: Utf8PathBuf,
    pub min_resume_bytes: u64,
    pub scale_m: u32,
    pub backend: BackendSettings,
    pub hyperlocal: HyperlocalSettings,
    pub merge: MergeSettings,
}

impl ResolvedConfig {
    /// Output column names: `date`, one per signal, `location`.
    pub fn header(&self) -> Vec<String> {
        let mut header = Vec::with_capacity(self.signals.len() + 2);
        header.push("date".to_string());
        header.extend(self.signals.iter().map(|signal| signal.name.clone()));
        header.push("location".to_string());
        header
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Loads an explicit path, else `aqsat.json` in the working directory,
    /// else the platform config directory, else the built-in defaults.
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, AqError> {
        let config_path = match path {
            Some(path) => Some(PathBuf::from(path)),
            None => Self::discover(),
        };

        let Some(config_path) = config_path else {
            info!("no {CONFIG_FILE_NAME} found, using built-in defaults");
            return Self::resolve_config(Config::default());
        };

        debug!(path = %config_path.display(), "loading config");
        let content = fs::read_to_string(&config_path)
            .map_err(|_| AqError::ConfigRead(config_path.clone()))?;
        let config: Config =
            serde_json::from_str(&content).map_err(|err| AqError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn default_path() -> PathBuf {
        PathBuf::from(CONFIG_FILE_NAME)
    }

    fn discover() -> Option<PathBuf> {
        let local = Self::default_path();
        if local.exists() {
            return Some(local);
        }
        ProjectDirs::from("", "", "aqsat")
            .map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
            .filter(|path| path.exists())
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, AqError> {
        let schema_version = config.schema_version.unwrap_or(SCHEMA_VERSION);
        if schema_version != SCHEMA_VERSION {
            return Err(AqError::InvalidConfig(format!(
                "unsupported schema_version {schema_version}, expected {SCHEMA_VERSION}"
            )));
        }

        let locations = resolve_locations(
            config.locations.unwrap_or_else(default_locations),
            "location",
        )?;
        if locations.is_empty() {
            return Err(AqError::InvalidConfig(
                "at least one location is required".to_string(),
            ));
        }

        let signals = config
            .signals
            .unwrap_or_else(default_signals)
            .into_iter()
            .map(|entry| {
                let name = entry.name.trim().to_string();
                if name.is_empty() || matches!(name.as_str(), "date" | "location") {
                    return Err(AqError::InvalidSignal(format!("reserved or empty name {name:?}")));
                }
                if entry.band.trim().is_empty() {
                    return Err(AqError::InvalidSignal(format!("{name}: empty band")));
                }
                Ok(Signal {
                    name,
                    collection: entry.collection.parse()?,
                    band: entry.band.trim().to_string(),
                    unit: entry.unit.unwrap_or_default(),
                })
            })
            .collect::<Result<Vec<_>, AqError>>()?;
        if signals.is_empty() {
            return Err(AqError::InvalidConfig(
                "at least one signal is required".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        for signal in &signals {
            if !seen.insert(signal.name.as_str()) {
                return Err(AqError::InvalidSignal(format!(
                    "duplicate signal {}",
                    signal.name
                )));
            }
        }

        let extraction = config.extraction;
        let start_year = extraction.start_year.unwrap_or(DEFAULT_START_YEAR);
        let current_year = chrono::Local::now().date_naive().year();
        if start_year > current_year {
            return Err(AqError::InvalidConfig(format!(
                "start year {start_year} is after the current year {current_year}"
            )));
        }

        let hyperlocal = config.hyperlocal;
        let stations = match hyperlocal.stations {
            Some(entries) => resolve_locations(entries, "station")?,
            None => locations.clone(),
        };
        let radius_m = hyperlocal.radius_m.unwrap_or(DEFAULT_RADIUS_M);
        if radius_m.is_nan() || radius_m <= 0.0 {
            return Err(AqError::InvalidConfig(format!(
                "hyperlocal radius must be positive, got {radius_m}"
            )));
        }

        let merge = config.merge;
        let station_aliases = merge.station_aliases.unwrap_or_default();
        if let Some((station, _)) = station_aliases
            .iter()
            .find(|(station, location)| station.trim().is_empty() || location.trim().is_empty())
        {
            return Err(AqError::InvalidConfig(format!(
                "merge alias for {station:?} has an empty name"
            )));
        }

        Ok(ResolvedConfig {
            locations,
            signals,
            start_year,
            call_delay: Duration::from_millis(
                extraction.call_delay_ms.unwrap_or(DEFAULT_CALL_DELAY_MS),
            ),
            retry_delay: Duration::from_millis(
                extraction.retry_delay_ms.unwrap_or(DEFAULT_RETRY_DELAY_MS),
            ),
            output: Utf8PathBuf::from(extraction.output.unwrap_or_else(|| DEFAULT_OUTPUT.to_string())),
            min_resume_bytes: extraction
                .min_resume_bytes
                .unwrap_or(DEFAULT_MIN_RESUME_BYTES),
            scale_m: extraction.scale_m.unwrap_or(DEFAULT_SCALE_M),
            backend: BackendSettings {
                endpoint: config
                    .backend
                    .endpoint
                    .unwrap_or_else(|| DEFAULT_BACKEND_ENDPOINT.to_string()),
                project: config.backend.project,
            },
            hyperlocal: HyperlocalSettings {
                stations,
                radius_m,
                output: Utf8PathBuf::from(
                    hyperlocal
                        .output
                        .unwrap_or_else(|| DEFAULT_HYPERLOCAL_OUTPUT.to_string()),
                ),
                overpass_url: hyperlocal
                    .overpass_url
                    .unwrap_or_else(|| DEFAULT_OVERPASS_URL.to_string()),
                call_delay: Duration::from_millis(
                    hyperlocal.call_delay_ms.unwrap_or(DEFAULT_CALL_DELAY_MS),
                ),
                retry_delay: Duration::from_millis(
                    hyperlocal.retry_delay_ms.unwrap_or(DEFAULT_RETRY_DELAY_MS),
                ),
            },
            merge: MergeSettings {
                output: Utf8PathBuf::from(
                    merge.output.unwrap_or_else(|| DEFAULT_MERGE_OUTPUT.to_string()),
                ),
                station_aliases,
            },
        })
    }
}

impl Config {
    /// Fully populated document written by `aqsat init`.
    pub fn default_document() -> Self {
        Self {
            schema_version: Some(SCHEMA_VERSION),
            locations: Some(default_locations()),
            signals: Some(default_signals()),
            extraction: ExtractionEntry {
                start_year: Some(DEFAULT_START_YEAR),
                call_delay_ms: Some(DEFAULT_CALL_DELAY_MS),
                retry_delay_ms: Some(DEFAULT_RETRY_DELAY_MS),
                output: Some(DEFAULT_OUTPUT.to_string()),
                min_resume_bytes: Some(DEFAULT_MIN_RESUME_BYTES),
                scale_m: Some(DEFAULT_SCALE_M),
            },
            backend: BackendEntry {
                endpoint: Some(DEFAULT_BACKEND_ENDPOINT.to_string()),
                project: None,
            },
            hyperlocal: HyperlocalEntry {
                stations: None,
                radius_m: Some(DEFAULT_RADIUS_M),
                output: Some(DEFAULT_HYPERLOCAL_OUTPUT.to_string()),
                overpass_url: Some(DEFAULT_OVERPASS_URL.to_string()),
                call_delay_ms: Some(DEFAULT_CALL_DELAY_MS),
                retry_delay_ms: Some(DEFAULT_RETRY_DELAY_MS),
            },
            merge: MergeEntry {
                output: Some(DEFAULT_MERGE_OUTPUT.to_string()),
                station_aliases: None,
            },
        }
    }
}

fn resolve_locations(entries: Vec<LocationEntry>, kind: &str) -> Result<Vec<Location>, AqError> {
    let locations = entries
        .into_iter()
        .map(|entry| Location::new(&entry.name, entry.latitude, entry.longitude))
        .collect::<Result<Vec<_>, AqError>>()?;
    let mut seen = HashSet::new();
    for location in &locations {
        if !seen.insert(location.name.as_str()) {
            let message = format!("duplicate {kind} {}", location.name);
            return Err(match kind {
                "station" => AqError::InvalidStation(message),
                _ => AqError::InvalidLocation(message),
            });
        }
    }
    Ok(locations)
}

pub fn default_locations() -> Vec<LocationEntry> {
    [
        ("Anand Vihar, Delhi", 28.6473, 77.3185),
        ("RK Puram, Delhi", 28.5643, 77.1818),
        ("Punjabi Bagh, Delhi", 28.6678, 77.1213),
        ("Mandir Marg, Delhi", 28.6274, 77.2010),
        ("Vikas Sadan, Gurugram", 28.4601, 77.0318),
        ("Sector 51, Gurugram", 28.4287, 77.0706),
        ("Sector 62, Noida", 28.6195, 77.3618),
        ("Sector 125, Noida", 28.5376, 77.3338),
    ]
    .into_iter()
    .map(|(name, latitude, longitude)| LocationEntry {
        name: name.to_string(),
        latitude,
        longitude,
    })
    .collect()
}

pub fn default_signals() -> Vec<SignalEntry> {
    [
        (
            "NO2",
            "COPERNICUS/S5P/NRTI/L3_NO2",
            "tropospheric_NO2_column_number_density",
            "mol/m^2",
        ),
        (
            "SO2",
            "COPERNICUS/S5P/NRTI/L3_SO2",
            "SO2_column_number_density",
            "mol/m^2",
        ),
        (
            "CO",
            "COPERNICUS/S5P/NRTI/L3_CO",
            "CO_column_number_density",
            "mol/m^2",
        ),
        (
            "O3",
            "COPERNICUS/S5P/NRTI/L3_O3",
            "O3_column_number_density",
            "mol/m^2",
        ),
        (
            "Aerosol_Index",
            "COPERNICUS/S5P/NRTI/L3_AER_AI",
            "absorbing_aerosol_index",
            "",
        ),
    ]
    .into_iter()
    .map(|(name, collection, band, unit)| SignalEntry {
        name: name.to_string(),
        collection: collection.to_string(),
        band: band.to_string(),
        unit: Some(unit.to_string()),
    })
    .collect()
}
