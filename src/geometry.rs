use serde::{Deserialize, Serialize};

use crate::error::HarvestError;

/// Axis-aligned box in WGS84 degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_lon: f64,
    pub min_lat: f64,
    pub max_lon: f64,
    pub max_lat: f64,
}

impl BoundingBox {
    pub fn new(min_lon: f64, min_lat: f64, max_lon: f64, max_lat: f64) -> Result<Self, HarvestError> {
        let bbox = Self {
            min_lon,
            min_lat,
            max_lon,
            max_lat,
        };
        let finite = [min_lon, min_lat, max_lon, max_lat]
            .iter()
            .all(|value| value.is_finite());
        if !finite || min_lon >= max_lon || min_lat >= max_lat {
            return Err(HarvestError::InvalidBoundingBox(bbox.to_string()));
        }
        Ok(bbox)
    }

    pub fn width(&self) -> f64 {
        self.max_lon - self.min_lon
    }

    pub fn height(&self) -> f64 {
        self.max_lat - self.min_lat
    }

    pub fn as_array(&self) -> [f64; 4] {
        [self.min_lon, self.min_lat, self.max_lon, self.max_lat]
    }
}

impl std::fmt::Display for BoundingBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{},{},{},{}",
            self.min_lon, self.min_lat, self.max_lon, self.max_lat
        )
    }
}

impl std::str::FromStr for BoundingBox {
    type Err = HarvestError;

    /// Parses `min_lon,min_lat,max_lon,max_lat`.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let parts = value
            .split(',')
            .map(|part| part.trim().parse::<f64>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| HarvestError::InvalidBoundingBox(value.to_string()))?;
        match parts.as_slice() {
            [min_lon, min_lat, max_lon, max_lat] => Self::new(*min_lon, *min_lat, *max_lon, *max_lat),
            _ => Err(HarvestError::InvalidBoundingBox(value.to_string())),
        }
    }
}

/// Lazy n×n tiling of a bounding box, row-major from the south-west corner.
#[derive(Debug, Clone)]
pub struct Tiles {
    bbox: BoundingBox,
    n: usize,
    buffer: f64,
    next: usize,
}

impl Tiles {
    pub fn total(&self) -> usize {
        self.n * self.n
    }

    fn edge(min: f64, max: f64, n: usize, step: usize) -> f64 {
        if step == n {
            max
        } else {
            min + (max - min) * step as f64 / n as f64
        }
    }
}

impl Iterator for Tiles {
    type Item = BoundingBox;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.total() {
            return None;
        }
        let row = self.next / self.n;
        let col = self.next % self.n;
        self.next += 1;

        let bbox = &self.bbox;
        Some(BoundingBox {
            min_lon: Self::edge(bbox.min_lon, bbox.max_lon, self.n, col) - self.buffer,
            min_lat: Self::edge(bbox.min_lat, bbox.max_lat, self.n, row) - self.buffer,
            max_lon: Self::edge(bbox.min_lon, bbox.max_lon, self.n, col + 1) + self.buffer,
            max_lat: Self::edge(bbox.min_lat, bbox.max_lat, self.n, row + 1) + self.buffer,
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.total().saturating_sub(self.next);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for Tiles {}

/// Splits `bbox` into `n * n` tiles, each grown on every side by `buffer_pct` of a tile's width.
pub fn tile_bounding_box(bbox: BoundingBox, n: usize, buffer_pct: f64) -> Tiles {
    let buffer = if n == 0 {
        0.0
    } else {
        buffer_pct * bbox.width() / n as f64
    };
    Tiles {
        bbox,
        n,
        buffer,
        next: 0,
    }
}

/// Reads the coordinates of a WKT `Point(lon lat)` literal.
pub fn parse_wkt_point(value: &str) -> Option<(f64, f64)> {
    let trimmed = value.trim();
    let (kind, rest) = trimmed.split_once('(')?;
    if !kind.trim().eq_ignore_ascii_case("point") {
        return None;
    }
    let inner = rest.strip_suffix(')')?;
    let mut parts = inner.split_whitespace().map(|part| part.parse::<f64>());
    let lon = parts.next()?.ok()?;
    let lat = parts.next()?.ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((lon, lat))
}
