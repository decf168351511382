//! Power units and consistent conversion of series and metadata.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::error::{PspError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PowerUnit {
    W,
    KW,
    MW,
}

impl PowerUnit {
    fn watts(self) -> f64 {
        match self {
            PowerUnit::W => 1.0,
            PowerUnit::KW => 1_000.0,
            PowerUnit::MW => 1_000_000.0,
        }
    }

    /// Multiplier converting a value in `self` into `target`.
    pub fn factor_to(self, target: PowerUnit) -> f64 {
        self.watts() / target.watts()
    }
}

/// Factors to apply to the power series and to capacity metadata.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UnitConversion {
    pub power_factor: f64,
    pub capacity_factor: f64,
}

impl UnitConversion {
    pub fn identity() -> Self {
        Self {
            power_factor: 1.0,
            capacity_factor: 1.0,
        }
    }

    pub fn is_identity(&self) -> bool {
        self.power_factor == 1.0 && self.capacity_factor == 1.0
    }
}

/// Work out how to bring series and metadata into the same unit.
///
/// Without a `target` both must already agree. `extra_factor` is applied on
/// top to both sides, so the result stays consistent.
pub fn resolve_units(
    series: PowerUnit,
    metadata: PowerUnit,
    target: Option<PowerUnit>,
    extra_factor: f64,
) -> Result<UnitConversion> {
    if !(extra_factor.is_finite() && extra_factor > 0.0) {
        return Err(PspError::Config(format!(
            "power conversion factor must be positive, got {extra_factor}"
        )));
    }
    let (power_factor, capacity_factor) = match target {
        Some(target) => (series.factor_to(target), metadata.factor_to(target)),
        None if series == metadata => (1.0, 1.0),
        None => {
            return Err(PspError::UnitMismatch {
                series: series.to_string(),
                metadata: metadata.to_string(),
            })
        }
    };
    Ok(UnitConversion {
        power_factor: power_factor * extra_factor,
        capacity_factor: capacity_factor * extra_factor,
    })
}
