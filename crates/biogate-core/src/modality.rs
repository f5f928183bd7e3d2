//! Biometric modalities

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Category of biometric technology
///
/// Used both as a request filter and as the tag on every result.
/// `Any` only makes sense as a filter: it matches every modality present
/// in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Modality {
    Fingerprint,
    Face,
    Iris,
    Voice,
    Palm,
    HeartRate,
    Behavior,
    Any,
}

impl Modality {
    /// Every concrete modality (excludes `Any`)
    pub const CONCRETE: [Modality; 7] = [
        Modality::Fingerprint,
        Modality::Face,
        Modality::Iris,
        Modality::Voice,
        Modality::Palm,
        Modality::HeartRate,
        Modality::Behavior,
    ];

    /// Human-readable name
    pub fn display_name(&self) -> &'static str {
        match self {
            Modality::Fingerprint => "Fingerprint",
            Modality::Face => "Face",
            Modality::Iris => "Iris",
            Modality::Voice => "Voice",
            Modality::Palm => "Palm",
            Modality::HeartRate => "Heart Rate",
            Modality::Behavior => "Behavior",
            Modality::Any => "Any",
        }
    }

    /// Stable key used by persistence and the CLI
    pub fn key(&self) -> &'static str {
        match self {
            Modality::Fingerprint => "fingerprint",
            Modality::Face => "face",
            Modality::Iris => "iris",
            Modality::Voice => "voice",
            Modality::Palm => "palm",
            Modality::HeartRate => "heart_rate",
            Modality::Behavior => "behavior",
            Modality::Any => "any",
        }
    }

    pub fn is_any(&self) -> bool {
        matches!(self, Modality::Any)
    }

    /// Whether this modality, used as a filter, matches `other`
    pub fn matches(&self, other: Modality) -> bool {
        self.is_any() || *self == other
    }
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

impl FromStr for Modality {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        match normalized.as_str() {
            "fingerprint" | "finger" => Ok(Modality::Fingerprint),
            "face" => Ok(Modality::Face),
            "iris" => Ok(Modality::Iris),
            "voice" => Ok(Modality::Voice),
            "palm" => Ok(Modality::Palm),
            "heart_rate" | "heartrate" => Ok(Modality::HeartRate),
            "behavior" | "behaviour" => Ok(Modality::Behavior),
            "any" | "undefined" => Ok(Modality::Any),
            _ => Err(Error::UnknownModality(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_aliases() {
        assert_eq!("Fingerprint".parse::<Modality>().unwrap(), Modality::Fingerprint);
        assert_eq!("heart-rate".parse::<Modality>().unwrap(), Modality::HeartRate);
        assert_eq!("undefined".parse::<Modality>().unwrap(), Modality::Any);
        assert!("retina".parse::<Modality>().is_err());
    }

    #[test]
    fn test_key_parses_back() {
        for modality in Modality::CONCRETE {
            assert_eq!(modality.key().parse::<Modality>().unwrap(), modality);
        }
    }

    #[test]
    fn test_any_matches_everything() {
        assert!(Modality::Any.matches(Modality::Iris));
        assert!(Modality::Face.matches(Modality::Face));
        assert!(!Modality::Face.matches(Modality::Iris));
    }

    #[test]
    fn test_serde_uses_snake_case() {
        let json = serde_json::to_string(&Modality::HeartRate).unwrap();
        assert_eq!(json, "\"heart_rate\"");
    }
}
