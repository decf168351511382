use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Point in time used throughout the pipeline. Always UTC.
pub type Timestamp = DateTime<Utc>;

// ============================================================================
// Site identity
// ============================================================================

/// Identifier of a PV site as it appears in the data source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PvId(pub String);

impl PvId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PvId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PvId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for PvId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// ============================================================================
// Model inputs and outputs
// ============================================================================

/// Model input: the site and the reference time of the forecast.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PvX {
    pub pv_id: PvId,
    pub ts: Timestamp,
}

impl PvX {
    pub fn new(pv_id: PvId, ts: Timestamp) -> Self {
        Self { pv_id, ts }
    }
}

/// Model output or ground truth: one power value per horizon, in horizon order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PvY {
    pub powers: Vec<f64>,
}

impl PvY {
    pub fn new(powers: Vec<f64>) -> Self {
        Self { powers }
    }

    pub fn len(&self) -> usize {
        self.powers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.powers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pv_id_display_and_ordering() {
        let a = PvId::from("10");
        let b = PvId::from("9");
        assert_eq!(a.to_string(), "10");
        // Lexicographic, not numeric
        assert!(a < b);
    }

    #[test]
    fn test_pv_id_serializes_as_plain_string() {
        let json = serde_json::to_string(&PvId::from("abc")).unwrap();
        assert_eq!(json, "\"abc\"");
    }
}
