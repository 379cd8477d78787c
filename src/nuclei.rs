use geo::{Coord, LineString};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;

use crate::error::{JoinError, Result};
use crate::geometry::{contains_point, polygon_moments};

pub type NucleusId = u32;

// Measurement key QuPath uses for the nucleus area.
pub const NUCLEUS_AREA_MEASUREMENT: &str = "Nucleus: Area";

#[derive(Clone, Debug, PartialEq)]
pub struct Nucleus {
    pub id: NucleusId,
    pub polygon: LineString<f64>,
    pub centroid: Coord<f64>,
    pub area: f64,
}

impl Nucleus {
    // Build a nucleus from its outline. The centroid is always derived from the
    // polygon; the area is taken from `area` when the segmentation tool
    // measured one, and from the polygon otherwise.
    pub fn from_polygon(id: NucleusId, polygon: LineString<f64>, area: Option<f64>) -> Result<Self> {
        if polygon.0.len() < 3 {
            return Err(JoinError::MalformedFeature {
                id,
                reason: format!("polygon has {} vertices, need at least 3", polygon.0.len()),
            });
        }

        let moments = polygon_moments(&polygon).ok_or(JoinError::DegeneratePolygon { id })?;

        Ok(Nucleus {
            id,
            polygon,
            centroid: moments.centroid,
            area: area.unwrap_or_else(|| moments.area()),
        })
    }

    pub fn contains(&self, point: Coord<f64>) -> bool {
        contains_point(&self.polygon, point)
    }
}

// The nuclei of one image, in the order segmentation reported them. Lookups
// that resolve containment walk this order, so it is part of the result.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NucleusCatalog {
    nuclei: Vec<Nucleus>,
}

impl NucleusCatalog {
    pub fn new(nuclei: Vec<Nucleus>) -> Result<Self> {
        let mut seen = HashSet::with_capacity(nuclei.len());
        for nucleus in &nuclei {
            if !seen.insert(nucleus.id) {
                return Err(JoinError::DuplicateNucleusId(nucleus.id));
            }
        }
        Ok(NucleusCatalog { nuclei })
    }

    pub fn len(&self) -> usize {
        self.nuclei.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nuclei.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Nucleus> {
        self.nuclei.iter()
    }

    pub fn get(&self, id: NucleusId) -> Option<&Nucleus> {
        self.nuclei.iter().find(|n| n.id == id)
    }

    /// First nucleus in catalog order whose polygon contains `point`.
    /// Overlapping polygons are resolved by that order alone.
    pub fn first_containing(&self, point: Coord<f64>) -> Option<&Nucleus> {
        self.nuclei.iter().find(|n| n.contains(point))
    }
}

impl<'a> IntoIterator for &'a NucleusCatalog {
    type Item = &'a Nucleus;
    type IntoIter = std::slice::Iter<'a, Nucleus>;

    fn into_iter(self) -> Self::IntoIter {
        self.nuclei.iter()
    }
}

// On-disk form of a nucleus, as written to the per-image and global nuclei
// files. Global records carry the image they came from.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NucleusRecord {
    pub id: NucleusId,
    pub polygon: Vec<[f64; 2]>,
    pub centroid: [f64; 2],
    pub area: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

impl NucleusRecord {
    pub fn new(nucleus: &Nucleus, filename: Option<&str>) -> Self {
        NucleusRecord {
            id: nucleus.id,
            polygon: nucleus.polygon.coords().map(|c| [c.x, c.y]).collect(),
            centroid: [nucleus.centroid.x, nucleus.centroid.y],
            area: nucleus.area,
            filename: filename.map(str::to_string),
        }
    }

    pub fn into_nucleus(self) -> Nucleus {
        Nucleus {
            id: self.id,
            polygon: self.polygon.into_iter().map(|[x, y]| Coord { x, y }).collect(),
            centroid: Coord {
                x: self.centroid[0],
                y: self.centroid[1],
            },
            area: self.area,
        }
    }
}

// Where a nucleus gets its area from.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum AreaSource {
    // QuPath's "Nucleus: Area" measurement. Features without it are malformed.
    #[default]
    Measurement,
    // Absolute shoelace area of the outline.
    Polygon,
}

#[derive(Debug, Default)]
pub struct ParsedCatalog {
    pub catalog: NucleusCatalog,
    // Candidates that consumed an id but were dropped.
    pub skipped: Vec<JoinError>,
}

impl From<NucleusCatalog> for ParsedCatalog {
    fn from(catalog: NucleusCatalog) -> Self {
        ParsedCatalog {
            catalog,
            skipped: Vec::new(),
        }
    }
}

// Build a catalog from a QuPath GeoJSON FeatureCollection of cell detections.
//
// Features that are not cells are ignored outright. Every cell feature takes
// the next id, and keeps taking it even when the feature turns out to be
// unusable, so ids can have gaps.
pub fn parse_qupath_geojson(geojson: &Value, area_source: AreaSource) -> std::result::Result<ParsedCatalog, String> {
    let features = geojson["features"]
        .as_array()
        .ok_or_else(|| String::from("missing 'features' array"))?;

    let mut nuclei = Vec::new();
    let mut skipped = Vec::new();
    let mut next_id: NucleusId = 0;

    for feature in features {
        if feature["properties"]["objectType"].as_str() != Some("cell") {
            continue;
        }

        let id = next_id;
        next_id += 1;

        match parse_cell_feature(id, feature, area_source) {
            Ok(nucleus) => nuclei.push(nucleus),
            Err(e) => {
                warn!("parse_qupath_geojson: skipping nucleus {}: {}", id, e);
                skipped.push(e);
            }
        }
    }

    debug!(
        "parse_qupath_geojson: {} nuclei, {} skipped",
        nuclei.len(),
        skipped.len()
    );

    // ids are handed out sequentially, so they can't collide
    Ok(ParsedCatalog {
        catalog: NucleusCatalog { nuclei },
        skipped,
    })
}

fn parse_cell_feature(id: NucleusId, feature: &Value, area_source: AreaSource) -> Result<Nucleus> {
    let malformed = |reason: &str| JoinError::MalformedFeature {
        id,
        reason: reason.to_string(),
    };

    let ring = feature["nucleusGeometry"]["coordinates"][0]
        .as_array()
        .ok_or_else(|| malformed("missing nucleusGeometry coordinates"))?;

    let mut polygon = Vec::with_capacity(ring.len());
    for vertex in ring {
        let x = vertex[0].as_f64();
        let y = vertex[1].as_f64();
        match (x, y) {
            (Some(x), Some(y)) => polygon.push(Coord { x, y }),
            _ => return Err(malformed("vertex is not an [x, y] pair")),
        }
    }

    let area = match area_source {
        AreaSource::Measurement => Some(
            measurement(&feature["properties"]["measurements"], NUCLEUS_AREA_MEASUREMENT)
                .ok_or_else(|| malformed("missing 'Nucleus: Area' measurement"))?,
        ),
        AreaSource::Polygon => None,
    };

    Nucleus::from_polygon(id, LineString::from(polygon), area)
}

// QuPath writes measurements as an object; older exports use a list of
// {"name", "value"} pairs.
fn measurement(measurements: &Value, name: &str) -> Option<f64> {
    match measurements {
        Value::Object(map) => map.get(name).and_then(Value::as_f64),
        Value::Array(entries) => entries
            .iter()
            .find(|m| m["name"].as_str() == Some(name))
            .and_then(|m| m["value"].as_f64()),
        _ => None,
    }
}
