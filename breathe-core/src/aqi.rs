//! Concentration → AQI conversion.
//!
//! Piecewise-linear interpolation over per-pollutant breakpoint tables, plus
//! the fixed index → category mapping. Pure functions, no I/O.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::error::Error;
use crate::model::{AqiResult, Pollutant};

pub mod epa;

/// Highest index the scale defines.
pub const MAX_INDEX: u16 = 500;

const EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AqiCategory {
    Good,
    Moderate,
    UnhealthyForSensitiveGroups,
    Unhealthy,
    VeryUnhealthy,
    Hazardous,
}

impl AqiCategory {
    pub const fn all() -> &'static [AqiCategory] {
        &[
            AqiCategory::Good,
            AqiCategory::Moderate,
            AqiCategory::UnhealthyForSensitiveGroups,
            AqiCategory::Unhealthy,
            AqiCategory::VeryUnhealthy,
            AqiCategory::Hazardous,
        ]
    }

    /// Inclusive index range covered by this category.
    pub fn index_range(&self) -> (u16, u16) {
        match self {
            AqiCategory::Good => (0, 50),
            AqiCategory::Moderate => (51, 100),
            AqiCategory::UnhealthyForSensitiveGroups => (101, 150),
            AqiCategory::Unhealthy => (151, 200),
            AqiCategory::VeryUnhealthy => (201, 300),
            AqiCategory::Hazardous => (301, MAX_INDEX),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            AqiCategory::Good => "Good",
            AqiCategory::Moderate => "Moderate",
            AqiCategory::UnhealthyForSensitiveGroups => "Unhealthy for Sensitive Groups",
            AqiCategory::Unhealthy => "Unhealthy",
            AqiCategory::VeryUnhealthy => "Very Unhealthy",
            AqiCategory::Hazardous => "Hazardous",
        }
    }

    pub fn health_message(&self) -> &'static str {
        match self {
            AqiCategory::Good => "Air quality is good. Perfect for outdoor activities!",
            AqiCategory::Moderate => {
                "Air quality is acceptable. Sensitive individuals should limit prolonged outdoor exertion."
            }
            AqiCategory::UnhealthyForSensitiveGroups => {
                "Unhealthy for sensitive groups. Children, elderly, and people with respiratory conditions should reduce outdoor activities."
            }
            AqiCategory::Unhealthy => {
                "Unhealthy air quality. Everyone should reduce prolonged outdoor exertion. Sensitive groups should avoid outdoor activities."
            }
            AqiCategory::VeryUnhealthy => {
                "Very unhealthy. Everyone should avoid prolonged outdoor exertion. Stay indoors if possible."
            }
            AqiCategory::Hazardous => {
                "Hazardous conditions. Everyone should avoid all outdoor activities. Use air purifiers indoors."
            }
        }
    }

    /// Standard display colour.
    pub fn color(&self) -> &'static str {
        match self {
            AqiCategory::Good => "#00E400",
            AqiCategory::Moderate => "#FFFF00",
            AqiCategory::UnhealthyForSensitiveGroups => "#FF7E00",
            AqiCategory::Unhealthy => "#FF0000",
            AqiCategory::VeryUnhealthy => "#8F3F97",
            AqiCategory::Hazardous => "#7E0023",
        }
    }
}

impl fmt::Display for AqiCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Maps an index to its category. Indices above 500 are hazardous; negative
/// indices are rejected.
pub fn category(index: i32) -> Result<AqiCategory, Error> {
    if index < 0 {
        return Err(Error::invalid(format!("AQI index must be non-negative, got {index}")));
    }

    let index = index.min(i32::from(MAX_INDEX)) as u16;
    let found = AqiCategory::all().iter().copied().find(|c| {
        let (lo, hi) = c.index_range();
        (lo..=hi).contains(&index)
    });

    Ok(found.unwrap_or(AqiCategory::Hazardous))
}

/// One row of a breakpoint table.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Breakpoint {
    pub c_lo: f64,
    pub c_hi: f64,
    pub i_lo: u16,
    pub i_hi: u16,
}

impl Breakpoint {
    pub const fn new(c_lo: f64, c_hi: f64, i_lo: u16, i_hi: u16) -> Self {
        Self { c_lo, c_hi, i_lo, i_hi }
    }

    fn interpolate(&self, c: f64) -> u16 {
        let (i_lo, i_hi) = (f64::from(self.i_lo), f64::from(self.i_hi));
        let raw = (i_hi - i_lo) / (self.c_hi - self.c_lo) * (c - self.c_lo) + i_lo;
        round_half_up(raw).clamp(i_lo, i_hi) as u16
    }
}

fn round_half_up(x: f64) -> f64 {
    (x + 0.5).floor()
}

/// Validated, contiguous breakpoint table for one pollutant.
///
/// Concentrations are truncated to `precision` decimal places before lookup,
/// so a row ending at 12.0 and the next starting at 12.1 leave no gap.
#[derive(Debug, Clone, PartialEq)]
pub struct BreakpointTable {
    pollutant: Pollutant,
    precision: u32,
    rows: Vec<Breakpoint>,
}

impl BreakpointTable {
    pub fn new(pollutant: Pollutant, precision: u32, rows: Vec<Breakpoint>) -> Result<Self, Error> {
        if precision > 6 {
            return Err(Error::Config(format!(
                "{pollutant} table precision {precision} exceeds 6 decimal places"
            )));
        }

        let first = rows
            .first()
            .ok_or_else(|| Error::Config(format!("{pollutant} table has no rows")))?;
        if first.i_lo != 0 {
            return Err(Error::Config(format!("{pollutant} table must start at index 0")));
        }

        let scale = 10f64.powi(precision as i32);
        let to_steps = |c: f64| (c * scale).round() as i64;

        for (n, row) in rows.iter().enumerate() {
            if !row.c_lo.is_finite() || !row.c_hi.is_finite() || row.c_lo < 0.0 {
                return Err(Error::Config(format!("{pollutant} row {n} has invalid bounds")));
            }
            if row.c_lo >= row.c_hi || row.i_lo >= row.i_hi {
                return Err(Error::Config(format!(
                    "{pollutant} row {n} is not increasing: [{}, {}] -> [{}, {}]",
                    row.c_lo, row.c_hi, row.i_lo, row.i_hi
                )));
            }
            if row.i_hi > MAX_INDEX {
                return Err(Error::Config(format!(
                    "{pollutant} row {n} exceeds index {MAX_INDEX}"
                )));
            }
        }

        for (n, pair) in rows.windows(2).enumerate() {
            let (prev, next) = (&pair[0], &pair[1]);
            if to_steps(next.c_lo) != to_steps(prev.c_hi) + 1 {
                return Err(Error::Config(format!(
                    "{pollutant} rows {n} and {} are not contiguous in concentration ({} -> {})",
                    n + 1,
                    prev.c_hi,
                    next.c_lo
                )));
            }
            if next.i_lo != prev.i_hi + 1 {
                return Err(Error::Config(format!(
                    "{pollutant} rows {n} and {} are not contiguous in index ({} -> {})",
                    n + 1,
                    prev.i_hi,
                    next.i_lo
                )));
            }
        }

        Ok(Self { pollutant, precision, rows })
    }

    pub fn pollutant(&self) -> Pollutant {
        self.pollutant
    }

    pub fn precision(&self) -> u32 {
        self.precision
    }

    pub fn rows(&self) -> &[Breakpoint] {
        &self.rows
    }

    fn truncate(&self, concentration: f64) -> f64 {
        let scale = 10f64.powi(self.precision as i32);
        (concentration * scale + EPSILON).floor() / scale
    }

    /// Sub-index for a single concentration in this table's unit.
    pub fn sub_index(&self, concentration: f64) -> Result<u16, Error> {
        if !concentration.is_finite() || concentration < 0.0 {
            return Err(Error::invalid(format!(
                "{} concentration must be a non-negative finite number, got {concentration}",
                self.pollutant
            )));
        }

        let (Some(first), Some(last)) = (self.rows.first(), self.rows.last()) else {
            return Err(Error::Config(format!("{} table has no rows", self.pollutant)));
        };

        let c = self.truncate(concentration);
        if c < first.c_lo {
            return Ok(first.i_lo);
        }
        if c > last.c_hi + EPSILON {
            return Ok(MAX_INDEX);
        }

        let row = self
            .rows
            .iter()
            .find(|r| c <= r.c_hi + EPSILON)
            .unwrap_or(last);

        Ok(row.interpolate(c.max(row.c_lo)))
    }
}

/// Converts concentrations to AQI results using one table per pollutant.
#[derive(Debug, Clone)]
pub struct AqiCalculator {
    tables: HashMap<Pollutant, BreakpointTable>,
}

impl Default for AqiCalculator {
    fn default() -> Self {
        Self::epa()
    }
}

impl AqiCalculator {
    /// Calculator with the US EPA table for every pollutant.
    pub fn epa() -> Self {
        let tables = Pollutant::all()
            .iter()
            .map(|p| (*p, epa::table(*p)))
            .collect();
        Self { tables }
    }

    /// Replace the table for its pollutant.
    pub fn with_table(mut self, table: BreakpointTable) -> Self {
        self.tables.insert(table.pollutant(), table);
        self
    }

    pub fn table(&self, pollutant: Pollutant) -> Option<&BreakpointTable> {
        self.tables.get(&pollutant)
    }

    pub fn compute(&self, pollutant: Pollutant, concentration: f64) -> Result<AqiResult, Error> {
        let table = self.tables.get(&pollutant).ok_or_else(|| {
            Error::invalid(format!("no breakpoint table configured for {pollutant}"))
        })?;

        let index = table.sub_index(concentration)?;

        Ok(AqiResult {
            index,
            category: category(i32::from(index))?,
            pollutant,
            computed_at: Utc::now(),
        })
    }

    pub fn category(&self, index: i32) -> Result<AqiCategory, Error> {
        category(index)
    }
}
