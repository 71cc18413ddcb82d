//! Urban context features around each station, computed from OSM ways
//! inside a circular buffer. Shares the store, retry and resume machinery
//! with the satellite pipeline; one CSV row per station.

use std::f64::consts::PI;
use std::time::{Duration, Instant};

use csv::StringRecord;
use geo::{Area, BooleanOps, Coord, LineString, MultiLineString, Polygon};
use haversine::{Location as HaversineLocation, Units, distance};
use serde::Serialize;
use tracing::{info, warn};

use crate::checkpoint::{CheckpointKey, CheckpointStore, CsvRow, field, format_value};
use crate::config::ResolvedConfig;
use crate::domain::{Coordinates, Location};
use crate::driver::{CancelToken, ProgressEvent, ProgressSink, describe};
use crate::error::AqError;
use crate::fetcher::{Sleeper, call_with_retry};
use crate::osm::{BoundingBox, FeatureCategory, FeatureClient, Geometry, OsmFeature};
use crate::resume::{ResumeState, plan_stations};

const EARTH_RADIUS_M: f64 = 6_371_000.0;
const BUFFER_SEGMENTS: usize = 64;
const MAJOR_HIGHWAYS: &[&str] = &["motorway", "trunk", "primary", "secondary"];
const GREEN_LANDUSE: &[&str] = &[
    "grass",
    "forest",
    "meadow",
    "recreation_ground",
    "village_green",
];

pub const HYPERLOCAL_HEADER: &[&str] = &[
    "station",
    "latitude",
    "longitude",
    "road_length_m",
    "major_road_length_m",
    "road_density_km_per_km2",
    "building_count",
    "building_area_m2",
    "building_coverage",
    "industrial_area_m2",
    "residential_area_m2",
    "commercial_area_m2",
    "green_area_m2",
];

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RoadFeatures {
    pub length_m: f64,
    pub major_length_m: f64,
    pub density_km_per_km2: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BuildingFeatures {
    pub count: usize,
    pub area_m2: f64,
    pub coverage: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct LandUseFeatures {
    pub industrial_m2: f64,
    pub residential_m2: f64,
    pub commercial_m2: f64,
    pub green_m2: f64,
}

/// A category whose query failed twice is `None` and written as empty cells.
#[derive(Debug, Clone, PartialEq)]
pub struct StationFeatures {
    pub station: String,
    pub coordinates: Coordinates,
    pub roads: Option<RoadFeatures>,
    pub buildings: Option<BuildingFeatures>,
    pub land_use: Option<LandUseFeatures>,
}

impl CsvRow for StationFeatures {
    fn to_fields(&self) -> Vec<String> {
        let number = |value: Option<f64>| format_value(value.map(round3));
        vec![
            self.station.clone(),
            self.coordinates.latitude.to_string(),
            self.coordinates.longitude.to_string(),
            number(self.roads.map(|r| r.length_m)),
            number(self.roads.map(|r| r.major_length_m)),
            number(self.roads.map(|r| r.density_km_per_km2)),
            self.buildings
                .map(|b| b.count.to_string())
                .unwrap_or_default(),
            number(self.buildings.map(|b| b.area_m2)),
            number(self.buildings.map(|b| b.coverage)),
            number(self.land_use.map(|l| l.industrial_m2)),
            number(self.land_use.map(|l| l.residential_m2)),
            number(self.land_use.map(|l| l.commercial_m2)),
            number(self.land_use.map(|l| l.green_m2)),
        ]
    }
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

/// Last station written to a hyperlocal store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StationKey(pub String);

impl CheckpointKey for StationKey {
    fn from_last_row(header: &StringRecord, row: &StringRecord) -> Result<Self, String> {
        let station = field(header, row, "station")?;
        if station.trim().is_empty() {
            return Err("empty station name".to_string());
        }
        Ok(Self(station.to_string()))
    }
}

/// Local equirectangular projection in meters around `center`.
fn project(point: Coordinates, center: Coordinates) -> Coord<f64> {
    Coord {
        x: (point.longitude - center.longitude).to_radians()
            * EARTH_RADIUS_M
            * center.latitude.to_radians().cos(),
        y: (point.latitude - center.latitude).to_radians() * EARTH_RADIUS_M,
    }
}

fn unproject(coord: Coord<f64>, center: Coordinates) -> Coordinates {
    Coordinates {
        latitude: center.latitude + (coord.y / EARTH_RADIUS_M).to_degrees(),
        longitude: center.longitude
            + (coord.x / (EARTH_RADIUS_M * center.latitude.to_radians().cos())).to_degrees(),
    }
}

fn haversine_m(a: Coordinates, b: Coordinates) -> f64 {
    distance(
        HaversineLocation {
            latitude: a.latitude,
            longitude: a.longitude,
        },
        HaversineLocation {
            latitude: b.latitude,
            longitude: b.longitude,
        },
        Units::Kilometers,
    ) * 1000.0
}

/// Circle of `radius_m` around the projection origin, as a regular polygon.
fn buffer_polygon(radius_m: f64) -> Polygon<f64> {
    let ring: Vec<Coord<f64>> = (0..BUFFER_SEGMENTS)
        .map(|i| {
            let angle = 2.0 * PI * i as f64 / BUFFER_SEGMENTS as f64;
            Coord {
                x: radius_m * angle.cos(),
                y: radius_m * angle.sin(),
            }
        })
        .collect();
    Polygon::new(LineString::new(ring), vec![])
}

/// Length of a polyline that lies within `radius_m` of `center`. Clipping
/// happens in the local projection; clipped pieces are measured on the sphere.
pub fn clipped_length_m(points: &[Coordinates], center: Coordinates, radius_m: f64) -> f64 {
    if points.len() < 2 {
        return 0.0;
    }
    let line = LineString::new(points.iter().map(|p| project(*p, center)).collect());
    let clipped = buffer_polygon(radius_m).clip(&MultiLineString::new(vec![line]), false);
    clipped
        .0
        .iter()
        .flat_map(|piece| piece.lines())
        .map(|segment| haversine_m(unproject(segment.start, center), unproject(segment.end, center)))
        .sum()
}

/// Area of a lat/lon ring that falls within `radius_m` of `center`.
pub fn clipped_area_m2(ring: &[Coordinates], center: Coordinates, radius_m: f64) -> f64 {
    if ring.len() < 3 {
        return 0.0;
    }
    let polygon = Polygon::new(
        LineString::new(ring.iter().map(|p| project(*p, center)).collect()),
        vec![],
    );
    polygon
        .intersection(&buffer_polygon(radius_m))
        .unsigned_area()
}

fn buffer_area_m2(radius_m: f64) -> f64 {
    PI * radius_m * radius_m
}

pub fn road_features(features: &[OsmFeature], center: Coordinates, radius_m: f64) -> RoadFeatures {
    let mut roads = RoadFeatures::default();
    for feature in features {
        let (Geometry::LineString(points), Some(highway)) = (&feature.geometry, feature.tag("highway"))
        else {
            continue;
        };
        let length = clipped_length_m(points, center, radius_m);
        roads.length_m += length;
        let class = highway.trim_end_matches("_link");
        if MAJOR_HIGHWAYS.contains(&class) {
            roads.major_length_m += length;
        }
    }
    roads.density_km_per_km2 = (roads.length_m / 1000.0) / (buffer_area_m2(radius_m) / 1e6);
    roads
}

pub fn building_features(
    features: &[OsmFeature],
    center: Coordinates,
    radius_m: f64,
) -> BuildingFeatures {
    let mut buildings = BuildingFeatures::default();
    for feature in features {
        let Geometry::Polygon(ring) = &feature.geometry else {
            continue;
        };
        if feature.tag("building").is_none() {
            continue;
        }
        let area = clipped_area_m2(ring, center, radius_m);
        if area > 0.0 {
            buildings.count += 1;
            buildings.area_m2 += area;
        }
    }
    buildings.coverage = buildings.area_m2 / buffer_area_m2(radius_m);
    buildings
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LandUseClass {
    Industrial,
    Residential,
    Commercial,
    Green,
}

fn land_use_class(feature: &OsmFeature) -> Option<LandUseClass> {
    match feature.tag("landuse") {
        Some("industrial") => return Some(LandUseClass::Industrial),
        Some("residential") => return Some(LandUseClass::Residential),
        Some("commercial" | "retail") => return Some(LandUseClass::Commercial),
        Some(value) if GREEN_LANDUSE.contains(&value) => return Some(LandUseClass::Green),
        _ => {}
    }
    let green = matches!(feature.tag("leisure"), Some("park" | "garden"))
        || matches!(feature.tag("natural"), Some("wood" | "grassland" | "scrub"));
    green.then_some(LandUseClass::Green)
}

pub fn land_use_features(
    features: &[OsmFeature],
    center: Coordinates,
    radius_m: f64,
) -> LandUseFeatures {
    let mut land_use = LandUseFeatures::default();
    for feature in features {
        let Geometry::Polygon(ring) = &feature.geometry else {
            continue;
        };
        let Some(class) = land_use_class(feature) else {
            continue;
        };
        let area = clipped_area_m2(ring, center, radius_m);
        match class {
            LandUseClass::Industrial => land_use.industrial_m2 += area,
            LandUseClass::Residential => land_use.residential_m2 += area,
            LandUseClass::Commercial => land_use.commercial_m2 += area,
            LandUseClass::Green => land_use.green_m2 += area,
        }
    }
    land_use
}

#[derive(Debug, Clone, Serialize)]
pub struct HyperlocalSummary {
    pub output: String,
    pub resume: ResumeState,
    pub discarded_corrupt_store: bool,
    pub stations_total: usize,
    pub stations_skipped: usize,
    pub stations_processed: usize,
    pub failed_queries: usize,
    pub cancelled: bool,
}

pub struct HyperlocalDriver<F: FeatureClient, S: Sleeper> {
    client: F,
    sleeper: S,
    store: CheckpointStore,
    stations: Vec<Location>,
    radius_m: f64,
    call_delay: Duration,
    retry_delay: Duration,
}

impl<F: FeatureClient, S: Sleeper> HyperlocalDriver<F, S> {
    pub fn new(config: &ResolvedConfig, client: F, sleeper: S) -> Self {
        let settings = &config.hyperlocal;
        Self {
            client,
            sleeper,
            store: CheckpointStore::new(
                settings.output.clone(),
                HYPERLOCAL_HEADER.iter().map(|s| s.to_string()).collect(),
                config.min_resume_bytes,
            ),
            stations: settings.stations.clone(),
            radius_m: settings.radius_m,
            call_delay: settings.call_delay,
            retry_delay: settings.retry_delay,
        }
    }

    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    pub fn plan(&self) -> Result<(ResumeState, Vec<Location>), AqError> {
        let last = self.store.read_last::<StationKey>()?;
        Ok(plan_stations(&self.stations, last.as_ref().map(|key| key.0.as_str())))
    }

    pub fn run(&self, cancel: &CancelToken, sink: &dyn ProgressSink) -> Result<HyperlocalSummary, AqError> {
        let mut discarded = false;
        let last = match self.store.read_last::<StationKey>() {
            Ok(last) => last,
            Err(err @ AqError::CorruptCheckpoint { .. }) => {
                warn!(error = %err, "hyperlocal store unreadable, starting from scratch");
                sink.event(ProgressEvent::message(format!(
                    "phase=Resume; discarding corrupt store: {err}"
                )));
                self.store.discard()?;
                discarded = true;
                None
            }
            Err(err) => return Err(err),
        };
        self.store.ensure_header()?;

        let (state, pending) = plan_stations(&self.stations, last.as_ref().map(|key| key.0.as_str()));
        sink.event(ProgressEvent::message(format!(
            "phase=Resume; {}; {} of {} stations pending",
            describe(&state),
            pending.len(),
            self.stations.len()
        )));

        let mut summary = HyperlocalSummary {
            output: self.store.path().to_string(),
            resume: state,
            discarded_corrupt_store: discarded,
            stations_total: self.stations.len(),
            stations_skipped: self.stations.len() - pending.len(),
            stations_processed: 0,
            failed_queries: 0,
            cancelled: false,
        };

        for station in &pending {
            if cancel.is_cancelled() {
                summary.cancelled = true;
                break;
            }
            let start = Instant::now();
            let (features, failed) = self.process_station(station);
            self.store.append(std::slice::from_ref(&features))?;
            summary.stations_processed += 1;
            summary.failed_queries += failed;
            sink.event(ProgressEvent {
                message: format!("phase=Store; {}: {failed} failed queries", station.name),
                elapsed: Some(start.elapsed()),
                unit: None,
            });
        }
        Ok(summary)
    }

    fn process_station(&self, station: &Location) -> (StationFeatures, usize) {
        let center = station.coordinates;
        let bbox = BoundingBox::around(center, self.radius_m);
        let mut features = StationFeatures {
            station: station.name.clone(),
            coordinates: center,
            roads: None,
            buildings: None,
            land_use: None,
        };
        let mut failed = 0;
        info!(station = %station.name, "extracting hyperlocal features");

        for category in FeatureCategory::ALL {
            self.sleeper.sleep(self.call_delay);
            let filter = category.tag_filter();
            let label = format!("{} {}", station.name, category.label());
            let Ok(result) = call_with_retry(&self.sleeper, self.retry_delay, &label, || {
                self.client.query(&bbox, &filter)
            }) else {
                failed += 1;
                continue;
            };
            match category {
                FeatureCategory::Roads => {
                    features.roads = Some(road_features(&result, center, self.radius_m))
                }
                FeatureCategory::LandUse => {
                    features.land_use = Some(land_use_features(&result, center, self.radius_m))
                }
                FeatureCategory::Buildings => {
                    features.buildings = Some(building_features(&result, center, self.radius_m))
                }
            }
        }
        (features, failed)
    }
}
