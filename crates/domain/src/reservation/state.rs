//! Reservation state machine.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::ReservationError;

/// The status of a reservation journal record.
///
/// State transitions:
/// ```text
/// PENDING ──┬──► CONFIRMED
///           ├──► FAILED
///           └──► RELEASED
/// ```
///
/// A record may also be created directly in FAILED when stock could not be
/// held. CONFIRMED, FAILED and RELEASED are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReservationStatus {
    /// Stock is held for the order.
    #[default]
    Pending,

    /// Payment confirmed; the held stock has been consumed (terminal).
    Confirmed,

    /// Stock could not be held (terminal).
    Failed,

    /// The hold was given back by saga compensation (terminal).
    Released,
}

impl ReservationStatus {
    /// Returns true if `next` is a legal edge from this status.
    pub fn can_transition_to(&self, next: ReservationStatus) -> bool {
        matches!(
            (self, next),
            (
                ReservationStatus::Pending,
                ReservationStatus::Confirmed
                    | ReservationStatus::Failed
                    | ReservationStatus::Released
            )
        )
    }

    /// Returns true if no further transitions are possible.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ReservationStatus::Pending)
    }

    /// Returns true while the record's quantity counts towards `reserved`.
    pub fn holds_stock(&self) -> bool {
        matches!(self, ReservationStatus::Pending)
    }

    /// Returns the status name as stored and transmitted.
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Pending => "PENDING",
            ReservationStatus::Confirmed => "CONFIRMED",
            ReservationStatus::Failed => "FAILED",
            ReservationStatus::Released => "RELEASED",
        }
    }
}

impl std::fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ReservationStatus {
    type Err = ReservationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(ReservationStatus::Pending),
            "CONFIRMED" => Ok(ReservationStatus::Confirmed),
            "FAILED" => Ok(ReservationStatus::Failed),
            "RELEASED" => Ok(ReservationStatus::Released),
            other => Err(ReservationError::UnknownStatus(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [ReservationStatus; 4] = [
        ReservationStatus::Pending,
        ReservationStatus::Confirmed,
        ReservationStatus::Failed,
        ReservationStatus::Released,
    ];

    #[test]
    fn test_default_state_is_pending() {
        assert_eq!(ReservationStatus::default(), ReservationStatus::Pending);
    }

    #[test]
    fn test_pending_reaches_every_terminal_state() {
        assert!(ReservationStatus::Pending.can_transition_to(ReservationStatus::Confirmed));
        assert!(ReservationStatus::Pending.can_transition_to(ReservationStatus::Failed));
        assert!(ReservationStatus::Pending.can_transition_to(ReservationStatus::Released));
        assert!(!ReservationStatus::Pending.can_transition_to(ReservationStatus::Pending));
    }

    #[test]
    fn test_no_edge_leaves_a_terminal_state() {
        for from in ALL.iter().filter(|s| s.is_terminal()) {
            for to in ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to} must be illegal");
            }
        }
    }

    #[test]
    fn test_only_pending_holds_stock() {
        assert!(ReservationStatus::Pending.holds_stock());
        assert!(!ReservationStatus::Confirmed.holds_stock());
        assert!(!ReservationStatus::Failed.holds_stock());
        assert!(!ReservationStatus::Released.holds_stock());
    }

    #[test]
    fn test_parse_matches_display() {
        for status in ALL {
            assert_eq!(status.to_string().parse::<ReservationStatus>(), Ok(status));
        }
        assert_eq!(
            "CANCELLED".parse::<ReservationStatus>(),
            Err(ReservationError::UnknownStatus("CANCELLED".to_string()))
        );
    }

    #[test]
    fn test_serialization_uses_upper_case_names() {
        let json = serde_json::to_string(&ReservationStatus::Released).unwrap();
        assert_eq!(json, "\"RELEASED\"");
    }
}
