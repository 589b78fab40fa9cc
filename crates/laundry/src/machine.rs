//! Machine records and their state machine.
//!
//! ```text
//! Available ──allocate──► InUse ──sweep──► Completed ──release──► Available
//!                           │                   │
//!                           └──────release──────┴──promotion──► InUse (next requester)
//! ```
//!
//! Owner and usage times only exist inside the `InUse`/`Completed` variants, so a
//! machine can never be Available with an owner, or busy without one.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Pool slot number, `1..=N`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MachineId(u32);

impl MachineId {
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for MachineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for MachineId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MachineStatus {
    Available,
    InUse,
    Completed,
}

impl MachineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Available => "available",
            Self::InUse => "in_use",
            Self::Completed => "completed",
        }
    }

    pub(crate) fn parse(value: &str) -> Option<Self> {
        match value {
            "available" => Some(Self::Available),
            "in_use" => Some(Self::InUse),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

/// Who holds a machine and for how long.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Usage {
    pub owner: String,
    pub started_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub duration_minutes: u32,
}

impl Usage {
    pub fn starting(owner: impl Into<String>, now: DateTime<Utc>, duration_minutes: u32) -> Self {
        Self {
            owner: owner.into(),
            started_at: now,
            ends_at: now + Duration::minutes(i64::from(duration_minutes)),
            duration_minutes,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        now >= self.ends_at
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum MachineState {
    #[default]
    Available,
    InUse(Usage),
    Completed(Usage),
}

impl MachineState {
    pub fn status(&self) -> MachineStatus {
        match self {
            Self::Available => MachineStatus::Available,
            Self::InUse(_) => MachineStatus::InUse,
            Self::Completed(_) => MachineStatus::Completed,
        }
    }

    pub fn usage(&self) -> Option<&Usage> {
        match self {
            Self::Available => None,
            Self::InUse(usage) | Self::Completed(usage) => Some(usage),
        }
    }

    pub fn owner(&self) -> Option<&str> {
        self.usage().map(|u| u.owner.as_str())
    }

    pub fn is_available(&self) -> bool {
        matches!(self, Self::Available)
    }

    /// Rebuild a state from flat columns. Returns `None` when the columns break
    /// the owner/times invariant.
    pub(crate) fn from_parts(
        status: MachineStatus,
        owner: Option<String>,
        started_at: Option<DateTime<Utc>>,
        ends_at: Option<DateTime<Utc>>,
        duration_minutes: u32,
    ) -> Option<Self> {
        match (status, owner, started_at, ends_at) {
            (MachineStatus::Available, None, None, None) => Some(Self::Available),
            (MachineStatus::Available, ..) => None,
            (busy, Some(owner), Some(started_at), Some(ends_at)) => {
                let usage = Usage {
                    owner,
                    started_at,
                    ends_at,
                    duration_minutes,
                };
                Some(if busy == MachineStatus::InUse {
                    Self::InUse(usage)
                } else {
                    Self::Completed(usage)
                })
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Machine {
    pub id: MachineId,
    pub state: MachineState,
}

impl Machine {
    pub fn new(id: MachineId) -> Self {
        Self {
            id,
            state: MachineState::Available,
        }
    }

    pub fn status(&self) -> MachineStatus {
        self.state.status()
    }

    /// Whole minutes left on an in-progress wash, floored; 0 otherwise.
    pub fn remaining_minutes(&self, now: DateTime<Utc>) -> i64 {
        match &self.state {
            MachineState::InUse(usage) if usage.ends_at > now => {
                (usage.ends_at - now).num_minutes()
            }
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_machine_is_available_without_owner() {
        let machine = Machine::new(MachineId::new(1));
        assert_eq!(machine.status(), MachineStatus::Available);
        assert!(machine.state.owner().is_none());
        assert!(machine.state.usage().is_none());
    }

    #[test]
    fn usage_ends_after_duration() {
        let now = Utc::now();
        let usage = Usage::starting("alice", now, 30);
        assert_eq!(usage.ends_at - usage.started_at, Duration::minutes(30));
        assert!(!usage.is_due(now));
        assert!(usage.is_due(now + Duration::minutes(30)));
    }

    #[test]
    fn remaining_minutes_floors_and_clamps() {
        let now = Utc::now();
        let machine = Machine {
            id: MachineId::new(2),
            state: MachineState::InUse(Usage::starting("alice", now, 10)),
        };

        assert_eq!(machine.remaining_minutes(now), 10);
        assert_eq!(machine.remaining_minutes(now + Duration::seconds(90)), 8);
        assert_eq!(machine.remaining_minutes(now + Duration::minutes(11)), 0);
    }

    #[test]
    fn completed_machine_reports_no_remaining_time() {
        let now = Utc::now();
        let machine = Machine {
            id: MachineId::new(1),
            state: MachineState::Completed(Usage::starting("alice", now, 10)),
        };
        assert_eq!(machine.remaining_minutes(now), 0);
        assert_eq!(machine.state.owner(), Some("alice"));
    }

    #[test]
    fn from_parts_rejects_broken_rows() {
        let now = Utc::now();
        assert_eq!(
            MachineState::from_parts(MachineStatus::Available, None, None, None, 0),
            Some(MachineState::Available)
        );
        assert!(
            MachineState::from_parts(
                MachineStatus::Available,
                Some("alice".into()),
                None,
                None,
                0
            )
            .is_none()
        );
        assert!(
            MachineState::from_parts(MachineStatus::InUse, None, Some(now), Some(now), 10)
                .is_none()
        );

        let state = MachineState::from_parts(
            MachineStatus::Completed,
            Some("bob".into()),
            Some(now),
            Some(now),
            5,
        );
        assert_eq!(state.map(|s| s.status()), Some(MachineStatus::Completed));
    }

    #[test]
    fn status_round_trips_through_str() {
        for status in [
            MachineStatus::Available,
            MachineStatus::InUse,
            MachineStatus::Completed,
        ] {
            assert_eq!(MachineStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(MachineStatus::parse("broken"), None);
    }

    #[test]
    fn status_serializes_snake_case() {
        insta::assert_json_snapshot!(
            [
                MachineStatus::Available,
                MachineStatus::InUse,
                MachineStatus::Completed,
            ],
            @r#"
        [
          "available",
          "in_use",
          "completed"
        ]
        "#
        );
    }
}
