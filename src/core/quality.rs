//! Data quality codes attached to acquired values.

use serde::{Deserialize, Serialize};

/// Quality of an acquired value, as reported by the source.
///
/// Sources that do not report quality leave it unset; consumers
/// should treat missing quality as [`Quality::Good`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Quality {
    /// The value is trustworthy.
    #[default]
    Good,

    /// The source could not vouch for the value (stale, interpolated,
    /// sensor range exceeded).
    Uncertain,

    /// The value is known to be invalid.
    Bad,
}

impl Quality {
    /// Check if the value can be used without caveats.
    #[inline]
    pub const fn is_good(&self) -> bool {
        matches!(self, Self::Good)
    }

    /// Check if the value must not be used.
    #[inline]
    pub const fn is_bad(&self) -> bool {
        matches!(self, Self::Bad)
    }
}

impl std::fmt::Display for Quality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Good => "good",
            Self::Uncertain => "uncertain",
            Self::Bad => "bad",
        };
        write!(f, "{}", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quality_default_is_good() {
        assert_eq!(Quality::default(), Quality::Good);
        assert!(Quality::Good.is_good());
        assert!(!Quality::Uncertain.is_good());
        assert!(Quality::Bad.is_bad());
    }

    #[test]
    fn test_quality_serde_snake_case() {
        let json = serde_json::to_string(&Quality::Uncertain).unwrap();
        assert_eq!(json, "\"uncertain\"");

        let q: Quality = serde_json::from_str("\"bad\"").unwrap();
        assert_eq!(q, Quality::Bad);
    }
}
