//! Per-don price derivation and period-over-period changes.

use crate::core::align::AlignedFrame;
use crate::core::quote::Quantity;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Physical conversion constants. Kept in configuration so they can be corrected
/// without a code change.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UnitConstants {
    #[serde(default = "default_grams_per_troy_ounce")]
    pub grams_per_troy_ounce: f64,
    #[serde(default = "default_grams_per_don")]
    pub grams_per_don: f64,
}

fn default_grams_per_troy_ounce() -> f64 {
    31.1034768
}

fn default_grams_per_don() -> f64 {
    3.75
}

impl Default for UnitConstants {
    fn default() -> Self {
        Self {
            grams_per_troy_ounce: default_grams_per_troy_ounce(),
            grams_per_don: default_grams_per_don(),
        }
    }
}

impl UnitConstants {
    /// KRW per don from a USD per troy ounce spot price.
    pub fn don_price_krw(&self, spot_usd_per_oz: f64, krw_per_usd: f64) -> f64 {
        (spot_usd_per_oz / self.grams_per_troy_ounce) * krw_per_usd * self.grams_per_don
    }

    /// KRW per don from a KRW per gram price.
    pub fn don_price_from_gram(&self, krw_per_gram: f64) -> f64 {
        krw_per_gram * self.grams_per_don
    }
}

/// How a frame's spot column becomes a per-don KRW value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Conversion {
    /// USD per troy ounce, converted with the given FX column.
    UsdPerOunce { fx: Quantity },
    /// Already KRW per gram.
    KrwPerGram,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Up,
    Down,
    Unchanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Delta {
    pub change: f64,
    /// Percent of the previous value; `None` when the previous value is zero.
    pub pct: Option<f64>,
    pub direction: Direction,
}

impl Delta {
    pub fn between(current: f64, previous: f64) -> Self {
        let change = current - previous;
        let pct = if previous != 0.0 {
            Some(change / previous * 100.0)
        } else {
            None
        };
        let direction = if change > 0.0 {
            Direction::Up
        } else if change < 0.0 {
            Direction::Down
        } else {
            Direction::Unchanged
        };
        Self {
            change,
            pct,
            direction,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DerivedRow {
    pub at: DateTime<Utc>,
    pub spot: f64,
    pub fx: Option<f64>,
    pub don_price_krw: f64,
    /// Newest observation time among the row's inputs.
    pub observed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
pub struct PriceDeriver {
    units: UnitConstants,
}

impl PriceDeriver {
    pub fn new(units: UnitConstants) -> Self {
        Self { units }
    }

    pub fn units(&self) -> UnitConstants {
        self.units
    }

    /// Computes the per-don price for every row that has all required inputs.
    /// Rows missing an input are left out, never zero-filled.
    pub fn derive(
        &self,
        frame: &AlignedFrame,
        spot: Quantity,
        conversion: Conversion,
    ) -> Vec<DerivedRow> {
        frame
            .rows
            .iter()
            .filter_map(|row| {
                let spot_cell = frame.cell(row, spot)?;
                match conversion {
                    Conversion::UsdPerOunce { fx } => {
                        let fx_cell = frame.cell(row, fx)?;
                        Some(DerivedRow {
                            at: row.at,
                            spot: spot_cell.value,
                            fx: Some(fx_cell.value),
                            don_price_krw: self.units.don_price_krw(spot_cell.value, fx_cell.value),
                            observed_at: spot_cell.observed_at.max(fx_cell.observed_at),
                        })
                    }
                    Conversion::KrwPerGram => Some(DerivedRow {
                        at: row.at,
                        spot: spot_cell.value,
                        fx: None,
                        don_price_krw: self.units.don_price_from_gram(spot_cell.value),
                        observed_at: spot_cell.observed_at,
                    }),
                }
            })
            .collect()
    }
}

/// Change of the last value against the one before it.
pub fn latest_delta(values: &[f64]) -> Option<Delta> {
    match values {
        [.., previous, current] => Some(Delta::between(*current, *previous)),
        _ => None,
    }
}
