use std::{f64::consts::PI, fmt, path::Path, str::FromStr};

use geo::{BooleanOps, BoundingRect, MultiPolygon, Point, Polygon, Rect};
use geojson::{FeatureCollection, GeoJson};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Number of straight segments used to approximate a buffered point.
const DISK_SEGMENTS: usize = 64;

/// The unified area of interest, in lon/lat degrees.
#[derive(Debug, Clone, PartialEq)]
pub struct Boundary {
    geometry: MultiPolygon,
    bbox: Rect,
}

impl Boundary {
    /// Wraps a geometry, returning `None` when it is empty.
    pub fn new(geometry: MultiPolygon) -> Option<Self> {
        let bbox = geometry.bounding_rect()?;
        Some(Self { geometry, bbox })
    }

    pub fn geometry(&self) -> &MultiPolygon {
        &self.geometry
    }

    pub fn bbox(&self) -> &Rect {
        &self.bbox
    }
}

/// Which features of the boundary document make up the area of interest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum FeatureKind {
    #[default]
    Polygon,
    /// Points, each grown into a disk of the buffer radius.
    Point,
}

impl FromStr for FeatureKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "polygon" => Ok(FeatureKind::Polygon),
            "point" => Ok(FeatureKind::Point),
            _ => Err(Error::UnsupportedFeatureKind(s.to_string())),
        }
    }
}

impl TryFrom<String> for FeatureKind {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<FeatureKind> for String {
    fn from(kind: FeatureKind) -> Self {
        kind.to_string()
    }
}

impl fmt::Display for FeatureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeatureKind::Polygon => f.write_str("polygon"),
            FeatureKind::Point => f.write_str("point"),
        }
    }
}

/// Loads a GeoJSON FeatureCollection from an `http(s)://` URL or a local path.
pub async fn load_collection(client: &reqwest::Client, source: &str) -> Result<FeatureCollection> {
    let text = if source.starts_with("http://") || source.starts_with("https://") {
        debug!(url = source, "fetching boundary document");
        client
            .get(source)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?
    } else {
        debug!(path = source, "reading boundary document");
        tokio::fs::read_to_string(Path::new(source)).await?
    };
    parse_collection(&text)
}

pub fn parse_collection(text: &str) -> Result<FeatureCollection> {
    let geojson = text.parse::<GeoJson>()?;
    FeatureCollection::try_from(geojson).map_err(|_| Error::NotAFeatureCollection)
}

/// Merges every qualifying feature geometry into one boundary.
///
/// Returns `Ok(None)` when the collection holds nothing of the requested kind,
/// which callers treat as "no work" rather than a failure.
pub fn resolve(
    collection: &FeatureCollection,
    kind: FeatureKind,
    buffer_radius: f64,
) -> Result<Option<Boundary>> {
    if kind == FeatureKind::Point && !(buffer_radius.is_finite() && buffer_radius > 0.0) {
        return Err(Error::InvalidBufferRadius(buffer_radius));
    }

    let mut polygons: Vec<Polygon> = vec![];
    for feature in &collection.features {
        let Some(geometry) = feature.geometry.as_ref() else {
            continue;
        };
        match geo_types::Geometry::<f64>::try_from(&geometry.value) {
            Ok(geometry) => collect_polygons(geometry, kind, buffer_radius, &mut polygons),
            Err(e) => warn!(error = %e, "skipping feature with unreadable geometry"),
        }
    }

    if polygons.is_empty() {
        info!(%kind, features = collection.features.len(), "no geometry found");
        return Ok(None);
    }

    let count = polygons.len();
    let unified = polygons
        .into_iter()
        .fold(MultiPolygon::new(vec![]), |acc, polygon| {
            acc.union(&MultiPolygon::new(vec![polygon]))
        });
    debug!(inputs = count, parts = unified.0.len(), "unified boundary");
    Ok(Boundary::new(unified))
}

fn collect_polygons(
    geometry: geo_types::Geometry<f64>,
    kind: FeatureKind,
    buffer_radius: f64,
    polygons: &mut Vec<Polygon>,
) {
    use geo_types::Geometry as G;

    match (kind, geometry) {
        (FeatureKind::Polygon, G::Polygon(polygon)) => polygons.push(polygon),
        (FeatureKind::Polygon, G::MultiPolygon(multi_polygon)) => polygons.extend(multi_polygon),
        (FeatureKind::Polygon, G::Rect(rect)) => polygons.push(rect.to_polygon()),
        (FeatureKind::Polygon, G::Triangle(triangle)) => polygons.push(triangle.to_polygon()),
        (FeatureKind::Point, G::Point(point)) => polygons.push(disk(point, buffer_radius)),
        (FeatureKind::Point, G::MultiPoint(points)) => polygons.extend(
            points
                .into_iter()
                .map(|point| disk(point, buffer_radius)),
        ),
        (_, G::GeometryCollection(collection)) => {
            for geometry in collection {
                collect_polygons(geometry, kind, buffer_radius, polygons);
            }
        }
        _ => {}
    }
}

fn disk(center: Point, radius: f64) -> Polygon {
    let ring: Vec<(f64, f64)> = (0..=DISK_SEGMENTS)
        .map(|i| {
            let angle = 2.0 * PI * (i % DISK_SEGMENTS) as f64 / DISK_SEGMENTS as f64;
            (
                center.x() + radius * angle.cos(),
                center.y() + radius * angle.sin(),
            )
        })
        .collect();
    Polygon::new(ring.into(), vec![])
}
