//! Conversion of provider units into each pollutant's canonical unit.

use crate::error::SourceError;
use crate::model::Pollutant;

/// Molar volume of an ideal gas at 25 °C and 1 atm, in litres.
const MOLAR_VOLUME: f64 = 24.45;

fn molecular_weight(pollutant: Pollutant) -> Option<f64> {
    match pollutant {
        Pollutant::O3 => Some(48.00),
        Pollutant::No2 => Some(46.01),
        Pollutant::So2 => Some(64.07),
        Pollutant::Co => Some(28.01),
        Pollutant::Pm25 | Pollutant::Pm10 => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Unit {
    MicrogramsPerCubicMetre,
    MilligramsPerCubicMetre,
    Ppb,
    Ppm,
}

fn parse_unit(raw: &str) -> Option<Unit> {
    let normalized = raw
        .trim()
        .to_lowercase()
        .replace(['µ', 'μ'], "u")
        .replace('³', "3");

    match normalized.as_str() {
        "ug/m3" | "ugm-3" | "ug m-3" => Some(Unit::MicrogramsPerCubicMetre),
        "mg/m3" | "mgm-3" | "mg m-3" => Some(Unit::MilligramsPerCubicMetre),
        "ppb" => Some(Unit::Ppb),
        "ppm" => Some(Unit::Ppm),
        _ => None,
    }
}

/// Convert `value` expressed in `unit` into `pollutant`'s canonical unit.
pub fn to_canonical(pollutant: Pollutant, value: f64, unit: &str) -> Result<f64, SourceError> {
    if !value.is_finite() || value < 0.0 {
        return Err(SourceError::Unit(format!(
            "{pollutant} value {value} is not a valid concentration"
        )));
    }

    let unit = parse_unit(unit)
        .ok_or_else(|| SourceError::Unit(format!("unsupported unit '{unit}' for {pollutant}")))?;

    let ug_to_ppb = |ug: f64| -> Result<f64, SourceError> {
        let mw = molecular_weight(pollutant).ok_or_else(|| {
            SourceError::Unit(format!("{pollutant} has no molecular weight"))
        })?;
        Ok(ug * MOLAR_VOLUME / mw)
    };

    let converted = match (pollutant, unit) {
        (Pollutant::Pm25 | Pollutant::Pm10, Unit::MicrogramsPerCubicMetre) => value,
        (Pollutant::Pm25 | Pollutant::Pm10, Unit::MilligramsPerCubicMetre) => value * 1000.0,
        (Pollutant::Pm25 | Pollutant::Pm10, Unit::Ppb | Unit::Ppm) => {
            return Err(SourceError::Unit(format!(
                "{pollutant} cannot be expressed as a mixing ratio"
            )));
        }

        (Pollutant::Co, Unit::Ppm) => value,
        (Pollutant::Co, Unit::Ppb) => value / 1000.0,
        (Pollutant::Co, Unit::MicrogramsPerCubicMetre) => ug_to_ppb(value)? / 1000.0,
        (Pollutant::Co, Unit::MilligramsPerCubicMetre) => ug_to_ppb(value * 1000.0)? / 1000.0,

        (_, Unit::Ppb) => value,
        (_, Unit::Ppm) => value * 1000.0,
        (_, Unit::MicrogramsPerCubicMetre) => ug_to_ppb(value)?,
        (_, Unit::MilligramsPerCubicMetre) => ug_to_ppb(value * 1000.0)?,
    };

    Ok(converted)
}
