use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue, USER_AGENT};
use serde_json::{Value, json};
use tracing::debug;

use crate::config::BackendSettings;
use crate::domain::{CollectionId, Coordinates, DateRange};
use crate::error::AqError;

pub const TOKEN_ENV: &str = "AQSAT_BACKEND_TOKEN";

/// Point time-series request against one collection band.
#[derive(Debug, Clone)]
pub struct RegionQuery {
    pub collection: CollectionId,
    pub band: String,
    pub point: Coordinates,
    pub range: DateRange,
    pub scale_m: u32,
}

/// Raw `getRegion` output: a header row followed by data rows.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegionTable {
    pub header: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl RegionTable {
    pub fn from_json(value: &Value) -> Result<Self, AqError> {
        let Some(table) = value.as_array() else {
            return Err(AqError::MalformedResponse(
                "region result is not an array".to_string(),
            ));
        };
        let Some((first, rest)) = table.split_first() else {
            return Ok(Self::default());
        };
        let header = first
            .as_array()
            .ok_or_else(|| AqError::MalformedResponse("region header is not an array".to_string()))?
            .iter()
            .map(|cell| cell.as_str().unwrap_or_default().to_string())
            .collect();
        let rows = rest
            .iter()
            .map(|row| row.as_array().cloned().unwrap_or_default())
            .collect();
        Ok(Self { header, rows })
    }

    pub fn column(&self, name: &str) -> Option<usize> {
        self.header.iter().position(|column| column == name)
    }
}

pub trait RegionClient: Send + Sync {
    fn get_region(&self, query: &RegionQuery) -> Result<RegionTable, AqError>;
}

impl<C: RegionClient + ?Sized> RegionClient for &C {
    fn get_region(&self, query: &RegionQuery) -> Result<RegionTable, AqError> {
        (**self).get_region(query)
    }
}

/// Earth Engine REST client evaluating `ImageCollection.getRegion` via
/// `value:compute`.
#[derive(Clone)]
pub struct EarthEngineHttpClient {
    client: Client,
    compute_url: String,
}

impl EarthEngineHttpClient {
    /// Builds the client and probes the project. Any failure here is fatal
    /// for the run.
    pub fn connect(settings: &BackendSettings) -> Result<Self, AqError> {
        let project = settings
            .project
            .as_deref()
            .filter(|project| !project.trim().is_empty())
            .ok_or_else(|| AqError::BackendInit("no backend project configured".to_string()))?;
        let token = std::env::var(TOKEN_ENV)
            .ok()
            .filter(|token| !token.trim().is_empty())
            .ok_or_else(|| AqError::BackendInit(format!("{TOKEN_ENV} is not set")))?;

        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("aqsat/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| AqError::BackendInit(err.to_string()))?,
        );
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", token.trim()))
                .map_err(|err| AqError::BackendInit(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|err| AqError::BackendInit(err.to_string()))?;

        let this = Self {
            client,
            compute_url: format!(
                "{}/projects/{}/value:compute",
                settings.endpoint.trim_end_matches('/'),
                project.trim()
            ),
        };
        this.probe()?;
        Ok(this)
    }

    fn probe(&self) -> Result<(), AqError> {
        let body = json!({
            "expression": {"result": "0", "values": {"0": {"constantValue": 1}}}
        });
        let response = self
            .client
            .post(&self.compute_url)
            .json(&body)
            .send()
            .map_err(|err| AqError::BackendInit(err.to_string()))?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().unwrap_or_default();
            return Err(AqError::BackendInit(format!("status {status}: {message}")));
        }
        Ok(())
    }

    fn handle_status(
        response: reqwest::blocking::Response,
    ) -> Result<reqwest::blocking::Response, AqError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let message = response
            .text()
            .unwrap_or_else(|_| "region request failed".to_string());
        Err(AqError::BackendStatus { status, message })
    }
}

impl RegionClient for EarthEngineHttpClient {
    fn get_region(&self, query: &RegionQuery) -> Result<RegionTable, AqError> {
        debug!(
            collection = %query.collection,
            start = %query.range.start,
            end = %query.range.end,
            "getRegion"
        );
        let response = self
            .client
            .post(&self.compute_url)
            .json(&get_region_expression(query))
            .send()
            .map_err(|err| AqError::BackendHttp(err.to_string()))?;
        let payload: Value = Self::handle_status(response)?
            .json()
            .map_err(|err| AqError::MalformedResponse(err.to_string()))?;
        let result = payload
            .get("result")
            .ok_or_else(|| AqError::MalformedResponse("missing result field".to_string()))?;
        RegionTable::from_json(result)
    }
}

fn invoke(function: &str, arguments: Value) -> Value {
    json!({"functionInvocationValue": {"functionName": function, "arguments": arguments}})
}

fn constant(value: Value) -> Value {
    json!({ "constantValue": value })
}

fn get_region_expression(query: &RegionQuery) -> Value {
    let collection = invoke(
        "ImageCollection.load",
        json!({ "id": constant(json!(query.collection.as_str())) }),
    );
    let date_range = invoke(
        "DateRange",
        json!({
            "start": constant(json!(query.range.start.format("%Y-%m-%d").to_string())),
            "end": constant(json!(query.range.end.format("%Y-%m-%d").to_string())),
        }),
    );
    let filter = invoke(
        "Filter.dateRangeContains",
        json!({
            "leftValue": date_range,
            "rightField": constant(json!("system:time_start")),
        }),
    );
    let filtered = invoke(
        "Collection.filter",
        json!({ "collection": collection, "filter": filter }),
    );
    let point = invoke(
        "GeometryConstructors.Point",
        json!({
            "coordinates": constant(json!([query.point.longitude, query.point.latitude])),
        }),
    );
    let region = invoke(
        "ImageCollection.getRegion",
        json!({
            "collection": filtered,
            "geometry": point,
            "scale": constant(json!(query.scale_m)),
        }),
    );
    json!({ "expression": { "result": "0", "values": { "0": region } } })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn table_from_json_splits_header() {
        let value = json!([
            ["id", "longitude", "latitude", "time", "NO2"],
            ["a", 77.0, 28.0, 1704067200000i64, 0.0001],
        ]);
        let table = RegionTable::from_json(&value).unwrap();
        assert_eq!(table.column("time"), Some(3));
        assert_eq!(table.rows.len(), 1);
        assert!(RegionTable::from_json(&json!([])).unwrap().rows.is_empty());
        assert!(RegionTable::from_json(&json!({"a": 1})).is_err());
    }

    #[test]
    fn expression_names_collection_and_point() {
        let query = RegionQuery {
            collection: "COPERNICUS/S5P/NRTI/L3_CO".parse().unwrap(),
            band: "CO_column_number_density".to_string(),
            point: Coordinates::new(28.6, 77.3).unwrap(),
            range: DateRange {
                start: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
                end: NaiveDate::from_ymd_opt(2024, 2, 1).unwrap(),
            },
            scale_m: 1000,
        };
        let text = get_region_expression(&query).to_string();
        assert!(text.contains("COPERNICUS/S5P/NRTI/L3_CO"));
        assert!(text.contains("ImageCollection.getRegion"));
        assert!(text.contains("[77.3,28.6]"));
        assert!(text.contains("2024-02-01"));
    }
}
