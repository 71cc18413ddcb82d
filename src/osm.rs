use std::collections::BTreeMap;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::Coordinates;
use crate::error::AqError;

const METERS_PER_DEGREE_LAT: f64 = 111_320.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub south: f64,
    pub west: f64,
    pub north: f64,
    pub east: f64,
}

impl BoundingBox {
    /// Smallest lat/lon box containing a circle of `radius_m` around `center`.
    pub fn around(center: Coordinates, radius_m: f64) -> Self {
        let dlat = radius_m / METERS_PER_DEGREE_LAT;
        let dlon = radius_m / (METERS_PER_DEGREE_LAT * center.latitude.to_radians().cos().max(1e-6));
        Self {
            south: (center.latitude - dlat).max(-90.0),
            west: (center.longitude - dlon).max(-180.0),
            north: (center.latitude + dlat).min(90.0),
            east: (center.longitude + dlon).min(180.0),
        }
    }
}

/// One `key` or `key=value|value` clause; clauses are OR-ed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagClause {
    pub key: String,
    pub values: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagFilter {
    pub clauses: Vec<TagClause>,
}

impl TagFilter {
    fn clause(key: &str, values: &[&str]) -> TagClause {
        TagClause {
            key: key.to_string(),
            values: values.iter().map(|value| value.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureCategory {
    Roads,
    LandUse,
    Buildings,
}

impl FeatureCategory {
    pub const ALL: [FeatureCategory; 3] = [
        FeatureCategory::Roads,
        FeatureCategory::LandUse,
        FeatureCategory::Buildings,
    ];

    pub fn label(self) -> &'static str {
        match self {
            FeatureCategory::Roads => "roads",
            FeatureCategory::LandUse => "land_use",
            FeatureCategory::Buildings => "buildings",
        }
    }

    pub fn tag_filter(self) -> TagFilter {
        let clauses = match self {
            FeatureCategory::Roads => vec![TagFilter::clause("highway", &[])],
            FeatureCategory::LandUse => vec![
                TagFilter::clause("landuse", &[]),
                TagFilter::clause("leisure", &["park", "garden"]),
                TagFilter::clause("natural", &["wood", "grassland", "scrub"]),
            ],
            FeatureCategory::Buildings => vec![TagFilter::clause("building", &[])],
        };
        TagFilter { clauses }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Geometry {
    Point(Coordinates),
    LineString(Vec<Coordinates>),
    Polygon(Vec<Coordinates>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct OsmFeature {
    pub geometry: Geometry,
    pub tags: BTreeMap<String, String>,
}

impl OsmFeature {
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }
}

pub trait FeatureClient: Send + Sync {
    fn query(&self, bbox: &BoundingBox, filter: &TagFilter) -> Result<Vec<OsmFeature>, AqError>;
}

impl<F: FeatureClient + ?Sized> FeatureClient for &F {
    fn query(&self, bbox: &BoundingBox, filter: &TagFilter) -> Result<Vec<OsmFeature>, AqError> {
        (**self).query(bbox, filter)
    }
}

#[derive(Clone)]
pub struct OverpassClient {
    client: Client,
    url: String,
}

impl OverpassClient {
    pub fn new(url: &str) -> Result<Self, AqError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("aqsat/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| AqError::OverpassHttp(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(180))
            .build()
            .map_err(|err| AqError::OverpassHttp(err.to_string()))?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }
}

impl FeatureClient for OverpassClient {
    fn query(&self, bbox: &BoundingBox, filter: &TagFilter) -> Result<Vec<OsmFeature>, AqError> {
        let query = overpass_query(bbox, filter);
        debug!(%query, "overpass query");
        let response = self
            .client
            .post(&self.url)
            .form(&[("data", query.as_str())])
            .send()
            .map_err(|err| AqError::OverpassHttp(err.to_string()))?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response
                .text()
                .unwrap_or_else(|_| "Overpass request failed".to_string());
            return Err(AqError::OverpassStatus { status, message });
        }
        let payload: OverpassResponse = response
            .json()
            .map_err(|err| AqError::OverpassHttp(err.to_string()))?;
        Ok(payload
            .elements
            .into_iter()
            .filter_map(OverpassElement::into_feature)
            .collect())
    }
}

pub fn overpass_query(bbox: &BoundingBox, filter: &TagFilter) -> String {
    let bounds = format!(
        "({:.6},{:.6},{:.6},{:.6})",
        bbox.south, bbox.west, bbox.north, bbox.east
    );
    let mut query = String::from("[out:json][timeout:90];(");
    for clause in &filter.clauses {
        if clause.values.is_empty() {
            query.push_str(&format!("way[\"{}\"]{bounds};", clause.key));
        } else {
            query.push_str(&format!(
                "way[\"{}\"~\"^({})$\"]{bounds};",
                clause.key,
                clause.values.join("|")
            ));
        }
    }
    query.push_str(");out geom;");
    query
}

#[derive(Debug, Deserialize)]
struct OverpassResponse {
    #[serde(default)]
    elements: Vec<OverpassElement>,
}

#[derive(Debug, Deserialize)]
struct OverpassElement {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    lat: Option<f64>,
    #[serde(default)]
    lon: Option<f64>,
    #[serde(default)]
    geometry: Option<Vec<LatLon>>,
    #[serde(default)]
    tags: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct LatLon {
    lat: f64,
    lon: f64,
}

impl OverpassElement {
    fn into_feature(self) -> Option<OsmFeature> {
        let geometry = match self.kind.as_str() {
            "node" => Geometry::Point(Coordinates {
                latitude: self.lat?,
                longitude: self.lon?,
            }),
            "way" => {
                let points = self
                    .geometry?
                    .into_iter()
                    .map(|point| Coordinates {
                        latitude: point.lat,
                        longitude: point.lon,
                    })
                    .collect::<Vec<_>>();
                let closed = points.len() >= 4 && points.first() == points.last();
                let linear = self.tags.contains_key("highway")
                    && self.tags.get("area").map(String::as_str) != Some("yes");
                if closed && !linear {
                    Geometry::Polygon(points)
                } else if points.len() >= 2 {
                    Geometry::LineString(points)
                } else {
                    return None;
                }
            }
            _ => return None,
        };
        Some(OsmFeature {
            geometry,
            tags: self.tags,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_lists_each_clause() {
        let bbox = BoundingBox {
            south: 28.0,
            west: 77.0,
            north: 28.1,
            east: 77.1,
        };
        let query = overpass_query(&bbox, &FeatureCategory::LandUse.tag_filter());
        assert!(query.starts_with("[out:json]"));
        assert!(query.contains("way[\"landuse\"](28.000000,77.000000,28.100000,77.100000);"));
        assert!(query.contains("way[\"leisure\"~\"^(park|garden)$\"]"));
        assert!(query.ends_with("out geom;"));
    }

    #[test]
    fn parses_ways_into_geometries() {
        let payload: OverpassResponse = serde_json::from_str(
            r#"{"elements":[
                {"type":"way","id":1,"tags":{"highway":"primary"},
                 "geometry":[{"lat":0,"lon":0},{"lat":0,"lon":1}]},
                {"type":"way","id":2,"tags":{"building":"yes"},
                 "geometry":[{"lat":0,"lon":0},{"lat":0,"lon":1},{"lat":1,"lon":1},{"lat":0,"lon":0}]},
                {"type":"relation","id":3}
            ]}"#,
        )
        .unwrap();
        let features: Vec<_> = payload
            .elements
            .into_iter()
            .filter_map(OverpassElement::into_feature)
            .collect();
        assert_eq!(features.len(), 2);
        assert!(matches!(features[0].geometry, Geometry::LineString(_)));
        assert!(matches!(features[1].geometry, Geometry::Polygon(_)));
        assert_eq!(features[0].tag("highway"), Some("primary"));
    }

    #[test]
    fn bbox_contains_radius() {
        let center = Coordinates::new(28.6, 77.2).unwrap();
        let bbox = BoundingBox::around(center, 1000.0);
        assert!(bbox.south < 28.6 && bbox.north > 28.6);
        assert!((bbox.north - bbox.south - 2.0 * 1000.0 / METERS_PER_DEGREE_LAT).abs() < 1e-9);
        assert!(bbox.east - bbox.west > bbox.north - bbox.south);
    }
}
