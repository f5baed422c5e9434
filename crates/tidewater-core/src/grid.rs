//! Fixed-resolution spatial bucketing.
//!
//! A point maps to the cell whose south-west corner is
//! `floor(lat / res) * res, floor(lng / res) * res`. Lookups scan the 3×3
//! block of cells around the query point, which gives an approximate-radius
//! search of at least one cell width in every direction.
//!
//! Two points further apart than one cell width on either axis are not
//! guaranteed to see each other. That is accepted: lookups answer "nearby",
//! not "nearest".

use crate::{Error, Result};

/// Default resolution in degrees (≈ 11 km of latitude).
pub const DEFAULT_RESOLUTION: f64 = 0.1;

/// Maps coordinates to grid cell keys at a fixed resolution.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridIndex {
  resolution: f64,
  /// Decimal places used when formatting keys; derived from `resolution`.
  precision:  usize,
}

impl Default for GridIndex {
  fn default() -> Self {
    Self { resolution: DEFAULT_RESOLUTION, precision: 1 }
  }
}

impl GridIndex {
  pub fn new(resolution: f64) -> Result<Self> {
    if !resolution.is_finite() || resolution <= 0.0 || resolution > 10.0 {
      return Err(Error::InvalidResolution(resolution));
    }
    Ok(Self { resolution, precision: decimals(resolution) })
  }

  pub fn resolution(&self) -> f64 { self.resolution }

  /// Integer lattice coordinates of the cell containing the point.
  pub fn cell(&self, lat: f64, lng: f64) -> (i64, i64) {
    (
      (lat / self.resolution).floor() as i64,
      (lng / self.resolution).floor() as i64,
    )
  }

  /// Deterministic string key of the cell containing `(lat, lng)`.
  pub fn key(&self, lat: f64, lng: f64) -> String {
    self.key_for_cell(self.cell(lat, lng))
  }

  /// The containing cell followed by its eight lattice neighbours.
  pub fn neighbor_keys(&self, lat: f64, lng: f64) -> [String; 9] {
    let (row, col) = self.cell(lat, lng);
    const OFFSETS: [(i64, i64); 9] = [
      (0, 0),
      (-1, -1),
      (-1, 0),
      (-1, 1),
      (0, -1),
      (0, 1),
      (1, -1),
      (1, 0),
      (1, 1),
    ];
    OFFSETS.map(|(dr, dc)| self.key_for_cell((row + dr, col + dc)))
  }

  fn key_for_cell(&self, (row, col): (i64, i64)) -> String {
    let p = self.precision;
    let lat = normalise_zero(row as f64 * self.resolution);
    let lng = normalise_zero(col as f64 * self.resolution);
    format!("{lat:.p$}_{lng:.p$}")
  }
}

/// Number of decimals needed to print multiples of `resolution` exactly.
fn decimals(resolution: f64) -> usize {
  let mut scaled = resolution;
  let mut places = 0;
  while (scaled - scaled.round()).abs() > 1e-9 && places < 6 {
    scaled *= 10.0;
    places += 1;
  }
  places
}

// `-0.0` would otherwise format as "-0.0".
fn normalise_zero(v: f64) -> f64 { if v == 0.0 { 0.0 } else { v } }
