//! US EPA breakpoint tables.
//!
//! Units match [`Pollutant::unit`]. Ozone uses the 8-hour table, which stops at
//! index 300; higher concentrations clamp to the top of the scale.

use super::{Breakpoint, BreakpointTable};
use crate::model::Pollutant;

const PM25: [Breakpoint; 7] = [
    Breakpoint::new(0.0, 12.0, 0, 50),
    Breakpoint::new(12.1, 35.4, 51, 100),
    Breakpoint::new(35.5, 55.4, 101, 150),
    Breakpoint::new(55.5, 150.4, 151, 200),
    Breakpoint::new(150.5, 250.4, 201, 300),
    Breakpoint::new(250.5, 350.4, 301, 400),
    Breakpoint::new(350.5, 500.4, 401, 500),
];

const PM10: [Breakpoint; 7] = [
    Breakpoint::new(0.0, 54.0, 0, 50),
    Breakpoint::new(55.0, 154.0, 51, 100),
    Breakpoint::new(155.0, 254.0, 101, 150),
    Breakpoint::new(255.0, 354.0, 151, 200),
    Breakpoint::new(355.0, 424.0, 201, 300),
    Breakpoint::new(425.0, 504.0, 301, 400),
    Breakpoint::new(505.0, 604.0, 401, 500),
];

const O3_8H: [Breakpoint; 5] = [
    Breakpoint::new(0.0, 54.0, 0, 50),
    Breakpoint::new(55.0, 70.0, 51, 100),
    Breakpoint::new(71.0, 85.0, 101, 150),
    Breakpoint::new(86.0, 105.0, 151, 200),
    Breakpoint::new(106.0, 200.0, 201, 300),
];

const NO2: [Breakpoint; 7] = [
    Breakpoint::new(0.0, 53.0, 0, 50),
    Breakpoint::new(54.0, 100.0, 51, 100),
    Breakpoint::new(101.0, 360.0, 101, 150),
    Breakpoint::new(361.0, 649.0, 151, 200),
    Breakpoint::new(650.0, 1249.0, 201, 300),
    Breakpoint::new(1250.0, 1649.0, 301, 400),
    Breakpoint::new(1650.0, 2049.0, 401, 500),
];

const SO2: [Breakpoint; 7] = [
    Breakpoint::new(0.0, 35.0, 0, 50),
    Breakpoint::new(36.0, 75.0, 51, 100),
    Breakpoint::new(76.0, 185.0, 101, 150),
    Breakpoint::new(186.0, 304.0, 151, 200),
    Breakpoint::new(305.0, 604.0, 201, 300),
    Breakpoint::new(605.0, 804.0, 301, 400),
    Breakpoint::new(805.0, 1004.0, 401, 500),
];

const CO: [Breakpoint; 7] = [
    Breakpoint::new(0.0, 4.4, 0, 50),
    Breakpoint::new(4.5, 9.4, 51, 100),
    Breakpoint::new(9.5, 12.4, 101, 150),
    Breakpoint::new(12.5, 15.4, 151, 200),
    Breakpoint::new(15.5, 30.4, 201, 300),
    Breakpoint::new(30.5, 40.4, 301, 400),
    Breakpoint::new(40.5, 50.4, 401, 500),
];

/// Truncation precision (decimal places) for each pollutant's table.
pub fn precision(pollutant: Pollutant) -> u32 {
    match pollutant {
        Pollutant::Pm25 | Pollutant::Co => 1,
        Pollutant::Pm10 | Pollutant::O3 | Pollutant::No2 | Pollutant::So2 => 0,
    }
}

pub fn table(pollutant: Pollutant) -> BreakpointTable {
    let rows: &[Breakpoint] = match pollutant {
        Pollutant::Pm25 => &PM25,
        Pollutant::Pm10 => &PM10,
        Pollutant::O3 => &O3_8H,
        Pollutant::No2 => &NO2,
        Pollutant::So2 => &SO2,
        Pollutant::Co => &CO,
    };

    BreakpointTable {
        pollutant,
        precision: precision(pollutant),
        rows: rows.to_vec(),
    }
}
