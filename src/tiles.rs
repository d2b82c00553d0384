//! Slippy-map tile pyramid math and boundary enumeration.

use std::{f64::consts::PI, fmt, str::FromStr};

use geo::{Intersects, Point, Rect};

use crate::{
    boundary::Boundary,
    error::{Error, Result},
};

/// Deepest zoom level whose tile indices fit in a `u32`.
pub const MAX_ZOOM: u8 = 30;

/// Web Mercator latitude limits.
pub const MIN_LAT: f64 = -85.051129;
pub const MAX_LAT: f64 = 85.051129;
pub const MIN_LON: f64 = -180.0;
pub const MAX_LON: f64 = 180.0;

/// Points within this distance of a tile's far edge count as the next tile,
/// absorbing the loss of precision when round-tripping through lon/lat.
const EDGE_EPSILON: f64 = 1e-14;

/// Nudge applied to the east and south edges of a bounding box so that a box
/// ending exactly on a tile edge does not pull in the neighbouring tile.
const LL_EPSILON: f64 = 1e-11;

/// A tile in the standard `z/x/y` pyramid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileCoordinate {
    pub z: u8,
    pub x: u32,
    pub y: u32,
}

impl TileCoordinate {
    pub fn new(z: u8, x: u32, y: u32) -> Result<Self> {
        check_zoom(z)?;
        let n = tiles_per_side(z);
        if x >= n || y >= n {
            return Err(Error::InvalidTile(format!("{z}/{x}/{y}")));
        }
        Ok(Self { z, x, y })
    }

    /// Geographic footprint of the tile as `(west, south) -> (east, north)`.
    pub fn footprint(&self) -> Rect {
        let n = tiles_per_side(self.z) as f64;
        let west = self.x as f64 / n * 360.0 - 180.0;
        let east = (self.x + 1) as f64 / n * 360.0 - 180.0;
        let north = row_to_lat(self.y as f64, n);
        let south = row_to_lat((self.y + 1) as f64, n);
        Rect::new((west, south), (east, north))
    }

    pub fn centroid(&self) -> Point {
        let rect = self.footprint();
        Point::new(
            (rect.min().x + rect.max().x) / 2.0,
            (rect.min().y + rect.max().y) / 2.0,
        )
    }
}

impl fmt::Display for TileCoordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.z, self.x, self.y)
    }
}

impl FromStr for TileCoordinate {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidTile(s.to_string());
        let mut parts = s.trim().split('/');
        let (Some(z), Some(x), Some(y), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(invalid());
        };
        let z = z.parse().map_err(|_| invalid())?;
        let x = x.parse().map_err(|_| invalid())?;
        let y = y.parse().map_err(|_| invalid())?;
        TileCoordinate::new(z, x, y).map_err(|_| invalid())
    }
}

/// A tile request URL pattern with `{z}`, `{x}` and `{y}` placeholders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlTemplate(String);

pub const DEFAULT_URL_TEMPLATE: &str =
    "https://vtiles.openhistoricalmap.org/maps/osm/{z}/{x}/{y}.pbf";

impl UrlTemplate {
    pub fn new(template: impl Into<String>) -> Result<Self> {
        let template = template.into();
        if ["{z}", "{x}", "{y}"]
            .iter()
            .all(|placeholder| template.contains(placeholder))
        {
            Ok(Self(template))
        } else {
            Err(Error::InvalidUrlTemplate(template))
        }
    }

    pub fn render(&self, tile: &TileCoordinate) -> String {
        self.0
            .replace("{z}", &tile.z.to_string())
            .replace("{x}", &tile.x.to_string())
            .replace("{y}", &tile.y.to_string())
    }
}

impl Default for UrlTemplate {
    fn default() -> Self {
        Self(DEFAULT_URL_TEMPLATE.to_string())
    }
}

impl FromStr for UrlTemplate {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        UrlTemplate::new(s)
    }
}

/// A tile together with what the dispatchers need to report on it.
#[derive(Debug, Clone, PartialEq)]
pub struct TileTask {
    pub tile: TileCoordinate,
    /// Request URL, only present for benchmarking runs.
    pub url: Option<String>,
    pub centroid: Point,
}

impl TileTask {
    pub fn new(tile: TileCoordinate, template: Option<&UrlTemplate>) -> Self {
        Self {
            tile,
            url: template.map(|template| template.render(&tile)),
            centroid: tile.centroid(),
        }
    }
}

pub fn tasks(tiles: &[TileCoordinate], template: Option<&UrlTemplate>) -> Vec<TileTask> {
    tiles
        .iter()
        .map(|tile| TileTask::new(*tile, template))
        .collect()
}

pub fn check_zoom(zoom: u8) -> Result<()> {
    if zoom > MAX_ZOOM {
        Err(Error::InvalidZoom(zoom))
    } else {
        Ok(())
    }
}

/// Every tile at `zoom` whose footprint overlaps `rect`, column by column.
pub fn tiles_in_rect(rect: &Rect, zoom: u8) -> Result<impl Iterator<Item = TileCoordinate>> {
    check_zoom(zoom)?;
    let west = rect.min().x.max(MIN_LON);
    let south = rect.min().y.max(MIN_LAT);
    let east = rect.max().x.min(MAX_LON);
    let north = rect.max().y.min(MAX_LAT);

    let (min_x, min_y) = tile_index(west, north, zoom);
    let (max_x, max_y) = tile_index(east - LL_EPSILON, south + LL_EPSILON, zoom);
    // a degenerate (zero width or height) box still covers the tile it sits in
    let max_x = max_x.max(min_x);
    let max_y = max_y.max(min_y);

    Ok((min_x..=max_x).flat_map(move |x| (min_y..=max_y).map(move |y| TileCoordinate { z: zoom, x, y })))
}

/// Enumerates the tiles whose footprint intersects the boundary, one pass per
/// zoom level in the order given.
///
/// Candidates come from the boundary's bounding box and are then kept only if
/// the tile footprint touches or overlaps the boundary shape itself. A missing
/// boundary yields no tiles.
pub fn enumerate(boundary: Option<&Boundary>, zoom_levels: &[u8]) -> Result<Vec<TileCoordinate>> {
    for zoom in zoom_levels {
        check_zoom(*zoom)?;
    }
    let Some(boundary) = boundary else {
        return Ok(Vec::new());
    };

    let mut tiles = Vec::new();
    for &zoom in zoom_levels {
        let before = tiles.len();
        tiles.extend(
            tiles_in_rect(boundary.bbox(), zoom)?
                .filter(|tile| tile.footprint().intersects(boundary.geometry())),
        );
        tracing::debug!(zoom, count = tiles.len() - before, "enumerated tiles");
    }
    Ok(tiles)
}

fn tiles_per_side(zoom: u8) -> u32 {
    1u32 << zoom
}

fn row_to_lat(row: f64, n: f64) -> f64 {
    (PI * (1.0 - 2.0 * row / n)).sinh().atan().to_degrees()
}

/// Tile column and row containing a lon/lat point.
fn tile_index(lon: f64, lat: f64, zoom: u8) -> (u32, u32) {
    let n = tiles_per_side(zoom);
    let x = lon / 360.0 + 0.5;
    let sin_lat = lat.to_radians().sin();
    let y = 0.5 - 0.25 * ((1.0 + sin_lat) / (1.0 - sin_lat)).ln() / PI;
    (fraction_to_index(x, n), fraction_to_index(y, n))
}

fn fraction_to_index(fraction: f64, n: u32) -> u32 {
    if fraction.is_nan() || fraction <= 0.0 {
        0
    } else if fraction >= 1.0 {
        n - 1
    } else {
        (((fraction + EDGE_EPSILON) * n as f64).floor() as u32).min(n - 1)
    }
}
