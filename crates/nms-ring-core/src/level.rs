//! Severity scale for probe scan results.
//!
//! The wrapped program grades every scanned region on a fixed ladder from
//! `E` (worthless) up to `SSS` (jackpot). The ordering is the whole point:
//! the aggregator keeps only the running maximum of a burst of tags.

use std::fmt;
use std::str::FromStr;

use crate::types::ProxyError;

/// Probe result severity, ordered worst-to-best.
///
/// `Ord` follows declaration order, so `Severity::E < Severity::Sss` and
/// `max` over any set of tags picks the best grade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    E,
    D,
    C,
    B,
    A,
    S,
    Ss,
    SsPlus,
    Sss,
}

impl Severity {
    /// All levels, ascending.
    pub const ALL: [Severity; 9] = [
        Severity::E,
        Severity::D,
        Severity::C,
        Severity::B,
        Severity::A,
        Severity::S,
        Severity::Ss,
        Severity::SsPlus,
        Severity::Sss,
    ];

    /// Canonical label as printed by the wrapped program.
    pub fn label(&self) -> &'static str {
        match self {
            Severity::E => "E",
            Severity::D => "D",
            Severity::C => "C",
            Severity::B => "B",
            Severity::A => "A",
            Severity::S => "S",
            Severity::Ss => "SS",
            Severity::SsPlus => "SS+",
            Severity::Sss => "SSS",
        }
    }

    /// Rank on the ladder, 0 = E .. 8 = SSS. Used for chime pitch selection.
    pub fn rank(&self) -> u8 {
        *self as u8
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Severity {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "E" => Ok(Severity::E),
            "D" => Ok(Severity::D),
            "C" => Ok(Severity::C),
            "B" => Ok(Severity::B),
            "A" => Ok(Severity::A),
            "S" => Ok(Severity::S),
            "SS" => Ok(Severity::Ss),
            "SS+" => Ok(Severity::SsPlus),
            "SSS" => Ok(Severity::Sss),
            other => Err(ProxyError::UnknownLevel(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering_is_total_and_fixed() {
        let expected = [
            Severity::E,
            Severity::D,
            Severity::C,
            Severity::B,
            Severity::A,
            Severity::S,
            Severity::Ss,
            Severity::SsPlus,
            Severity::Sss,
        ];
        assert_eq!(Severity::ALL, expected);
        for pair in Severity::ALL.windows(2) {
            assert!(pair[0] < pair[1], "{} should rank below {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_max_is_associative_and_commutative() {
        for a in Severity::ALL {
            for b in Severity::ALL {
                assert_eq!(a.max(b), b.max(a));
                for c in Severity::ALL {
                    assert_eq!(a.max(b).max(c), a.max(b.max(c)));
                }
            }
        }
    }

    #[test]
    fn test_label_round_trip() {
        for level in Severity::ALL {
            assert_eq!(level.label().parse::<Severity>().unwrap(), level);
        }
        // Threshold flag input is case-insensitive.
        assert_eq!("sss".parse::<Severity>().unwrap(), Severity::Sss);
        assert_eq!(" ss+ ".parse::<Severity>().unwrap(), Severity::SsPlus);
    }

    #[test]
    fn test_unknown_label_rejected() {
        assert!("F".parse::<Severity>().is_err());
        assert!("".parse::<Severity>().is_err());
        assert!("SSSS".parse::<Severity>().is_err());
    }
}
