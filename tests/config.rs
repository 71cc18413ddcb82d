use std::fs;
use std::time::Duration;

use assert_matches::assert_matches;

use aqsat_extract::config::{
    Config, ConfigLoader, ExtractionEntry, HyperlocalEntry, SignalEntry, default_locations,
    default_signals,
};
use aqsat_extract::error::AqError;

#[test]
fn default_document_round_trips_through_json() {
    let json = serde_json::to_string_pretty(&Config::default_document()).unwrap();
    let parsed: Config = serde_json::from_str(&json).unwrap();
    let resolved = ConfigLoader::resolve_config(parsed).unwrap();
    assert_eq!(resolved.locations.len(), default_locations().len());
    assert_eq!(resolved.signals.len(), default_signals().len());
}

#[test]
fn resolve_reads_explicit_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("aqsat.json");
    fs::write(
        &path,
        r#"{
            "locations": [{"name": "Station 1", "latitude": 10.0, "longitude": 20.0}],
            "signals": [{"name": "NO2", "collection": "COPERNICUS/S5P/NRTI/L3_NO2",
                         "band": "NO2_column_number_density", "unit": "mol/m^2"}],
            "extraction": {"start_year": 2023, "call_delay_ms": 0}
        }"#,
    )
    .unwrap();

    let resolved = ConfigLoader::resolve(Some(path.to_str().unwrap())).unwrap();
    assert_eq!(resolved.locations[0].name, "Station 1");
    assert_eq!(resolved.signals[0].unit, "mol/m^2");
    assert_eq!(resolved.start_year, 2023);
    assert_eq!(resolved.call_delay, Duration::ZERO);
}

#[test]
fn missing_and_malformed_files_are_config_errors() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("nope.json");
    let err = ConfigLoader::resolve(Some(missing.to_str().unwrap())).unwrap_err();
    assert_matches!(err, AqError::ConfigRead(_));
    assert!(err.is_configuration());

    let broken = dir.path().join("broken.json");
    fs::write(&broken, "{ not json").unwrap();
    let err = ConfigLoader::resolve(Some(broken.to_str().unwrap())).unwrap_err();
    assert_matches!(err, AqError::ConfigParse(_));
}

#[test]
fn rejects_out_of_range_values() {
    let bad_collection = Config {
        signals: Some(vec![SignalEntry {
            name: "NO2".to_string(),
            collection: "not a collection".to_string(),
            band: "b".to_string(),
            unit: None,
        }]),
        ..Config::default()
    };
    assert_matches!(
        ConfigLoader::resolve_config(bad_collection),
        Err(AqError::InvalidCollection(_))
    );

    let future = Config {
        extraction: ExtractionEntry {
            start_year: Some(9999),
            ..ExtractionEntry::default()
        },
        ..Config::default()
    };
    assert_matches!(
        ConfigLoader::resolve_config(future),
        Err(AqError::InvalidConfig(_))
    );

    let radius = Config {
        hyperlocal: HyperlocalEntry {
            radius_m: Some(0.0),
            ..HyperlocalEntry::default()
        },
        ..Config::default()
    };
    assert_matches!(
        ConfigLoader::resolve_config(radius),
        Err(AqError::InvalidConfig(_))
    );
}
