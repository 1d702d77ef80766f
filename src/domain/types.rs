use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

/// User-selected charging intent for a loadpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum ChargeMode {
    /// Charging disabled.
    Off,
    /// Charge at maximum current immediately.
    Now,
    /// Charge at least at minimum current, more on PV surplus.
    #[serde(rename = "minpv")]
    MinPv,
    /// Charge on PV surplus only.
    Pv,
}

/// Charger status following the IEC 61851 control pilot states.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChargeStatus {
    /// No status read yet (initial startup).
    #[default]
    None,
    /// State A: no vehicle connected.
    Disconnected,
    /// State B: vehicle connected, not charging.
    Connected,
    /// State C: vehicle charging.
    Charging,
    /// State F: charger fault.
    Fault,
}

impl ChargeStatus {
    /// Pilot state letter as reported by charging hardware.
    pub fn letter(&self) -> &'static str {
        match self {
            ChargeStatus::None => "-",
            ChargeStatus::Disconnected => "A",
            ChargeStatus::Connected => "B",
            ChargeStatus::Charging => "C",
            ChargeStatus::Fault => "F",
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ChargeStatus::Connected | ChargeStatus::Charging)
    }

    pub fn is_charging(&self) -> bool {
        matches!(self, ChargeStatus::Charging)
    }
}

impl std::fmt::Display for ChargeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.letter())
    }
}

/// External demand override, e.g. from a home energy management system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum RemoteDemand {
    /// No override, loadpoint decides.
    Enable,
    /// Suppress PV charging, other modes unaffected.
    SoftDisable,
    /// Stop charging regardless of mode.
    HardDisable,
}

/// Vehicle SoC polling mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum PollMode {
    /// Poll only while charging (default).
    Charging,
    /// Poll while a vehicle is connected.
    Connected,
    /// Poll even when disconnected.
    Always,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn charge_mode_parses_case_insensitive() {
        assert_eq!(ChargeMode::from_str("pv").unwrap(), ChargeMode::Pv);
        assert_eq!(ChargeMode::from_str("MinPV").unwrap(), ChargeMode::MinPv);
        assert_eq!(ChargeMode::from_str("off").unwrap(), ChargeMode::Off);
        assert!(ChargeMode::from_str("fast").is_err());
    }

    #[test]
    fn status_letters() {
        assert_eq!(ChargeStatus::Disconnected.letter(), "A");
        assert_eq!(ChargeStatus::Charging.letter(), "C");
        assert!(ChargeStatus::Charging.is_connected());
        assert!(!ChargeStatus::Disconnected.is_connected());
        assert!(!ChargeStatus::Fault.is_connected());
    }

    #[test]
    fn poll_mode_serde_roundtrip() {
        let m: PollMode = serde_json::from_str("\"always\"").unwrap();
        assert_eq!(m, PollMode::Always);
    }
}
