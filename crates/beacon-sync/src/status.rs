//! Per-message delivery state machine.
//!
//! Delivery moves strictly forward: pending < sent < delivered < read. A
//! remote update only ever applies when it outranks the current state, so
//! duplicate and out-of-order deliveries are no-ops rather than downgrades.
//! `Failed` is the branch state for a send that exhausted its retries; it
//! leaves the ladder and re-enters only through an explicit user retry — or
//! through a remote echo, which proves the write actually landed.

use serde::{Deserialize, Serialize};

use beacon_remote::WireStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Delivered,
    Read,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Read => "read",
            Self::Failed => "failed",
        }
    }

    /// Parse the database representation; unknown text reads as `Pending`.
    pub fn parse(s: &str) -> Self {
        match s {
            "sent" => Self::Sent,
            "delivered" => Self::Delivered,
            "read" => Self::Read,
            "failed" => Self::Failed,
            _ => Self::Pending,
        }
    }

    pub fn from_wire(wire: WireStatus) -> Self {
        match wire {
            WireStatus::Sent => Self::Sent,
            WireStatus::Delivered => Self::Delivered,
            WireStatus::Read => Self::Read,
        }
    }

    /// Position on the delivery ladder. `Failed` ranks with `Pending`: any
    /// remote-observed state outranks it, which is what lets an echo heal a
    /// message whose write succeeded but whose acknowledgment was lost.
    pub fn rank(self) -> u8 {
        match self {
            Self::Pending | Self::Failed => 0,
            Self::Sent => 1,
            Self::Delivered => 2,
            Self::Read => 3,
        }
    }
}

/// The monotonic guard: the state to store, or `None` when the incoming
/// state does not outrank the current one (duplicate or stale delivery).
pub fn advance(current: DeliveryStatus, incoming: DeliveryStatus) -> Option<DeliveryStatus> {
    (incoming.rank() > current.rank()).then_some(incoming)
}

#[cfg(test)]
mod tests {
    use super::DeliveryStatus::{Delivered, Failed, Pending, Read, Sent};
    use super::*;

    #[test]
    fn forward_transitions_apply() {
        assert_eq!(advance(Pending, Sent), Some(Sent));
        assert_eq!(advance(Pending, Delivered), Some(Delivered));
        assert_eq!(advance(Sent, Delivered), Some(Delivered));
        assert_eq!(advance(Sent, Read), Some(Read));
        assert_eq!(advance(Delivered, Read), Some(Read));
    }

    #[test]
    fn duplicates_are_no_ops() {
        for s in [Pending, Sent, Delivered, Read] {
            assert_eq!(advance(s, s), None, "{s:?} re-delivered");
        }
    }

    #[test]
    fn stale_updates_never_downgrade() {
        assert_eq!(advance(Read, Sent), None);
        assert_eq!(advance(Read, Delivered), None);
        assert_eq!(advance(Delivered, Sent), None);
        assert_eq!(advance(Sent, Pending), None);
    }

    #[test]
    fn an_echo_lifts_a_failed_message_back_onto_the_ladder() {
        assert_eq!(advance(Failed, Sent), Some(Sent));
        assert_eq!(advance(Failed, Delivered), Some(Delivered));
        assert_eq!(advance(Failed, Read), Some(Read));
    }

    #[test]
    fn wire_statuses_map_onto_the_ladder() {
        assert_eq!(DeliveryStatus::from_wire(WireStatus::Sent), Sent);
        assert_eq!(DeliveryStatus::from_wire(WireStatus::Delivered), Delivered);
        assert_eq!(DeliveryStatus::from_wire(WireStatus::Read), Read);
    }

    #[test]
    fn database_text_round_trips() {
        for s in [Pending, Sent, Delivered, Read, Failed] {
            assert_eq!(DeliveryStatus::parse(s.as_str()), s);
        }
        assert_eq!(DeliveryStatus::parse("garbage"), Pending);
    }
}
