//! Externally-visible option structs
//!
//! These travel as JSON query parameters on the upgrade request owned by the
//! external HTTP layer: `opt` for the primary connection, `side` for a
//! dedicated side connection (see [`crate::SessionKey`]).

use serde::{Deserialize, Serialize};

/// Options negotiated when a backend establishes its primary connection
///
/// JSON form: `{"Siding":bool,"DialWithAddr":bool}`; both default to false.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelOptions {
    /// One dedicated WebSocket per logical stream instead of multiplexing
    #[serde(rename = "Siding", default)]
    pub siding: bool,
    /// Carry the real client address on side dials (DialSide2)
    #[serde(rename = "DialWithAddr", default)]
    pub dial_with_addr: bool,
}

impl TunnelOptions {
    pub fn to_query(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn from_query(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let opts: TunnelOptions = serde_json::from_str("{}").unwrap();
        assert!(!opts.siding);
        assert!(!opts.dial_with_addr);
    }

    #[test]
    fn test_query_roundtrip() {
        let opts = TunnelOptions {
            siding: true,
            dial_with_addr: false,
        };
        let raw = opts.to_query();
        assert!(raw.contains("\"Siding\":true"));
        assert_eq!(TunnelOptions::from_query(&raw).unwrap(), opts);
    }
}
