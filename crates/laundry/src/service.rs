//! Transport-agnostic laundry service.
//!
//! Wraps the pool, queue, notifications and monitor behind one context object
//! that HTTP handlers share through an `Arc`. Results are shaped for the wire
//! here so every transport reports the same thing.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::config::PoolConfig;
use crate::machine::{Machine, MachineId, MachineStatus};
use crate::monitor::StatusMonitor;
use crate::notification::{Notification, NotificationCenter};
use crate::pool::{Allocation, PoolError, ResourcePool, validate_requester};
use crate::reservation::Reservation;
use crate::store::{Store, StoreError};
use crate::version::VersionInfo;

#[derive(Debug, Clone, Serialize)]
pub struct MachineView {
    pub machine_id: MachineId,
    pub status: MachineStatus,
    pub user_name: Option<String>,
    pub remaining_minutes: i64,
    pub end_time: Option<DateTime<Utc>>,
}

impl MachineView {
    fn from_machine(machine: &Machine, now: DateTime<Utc>) -> Self {
        let usage = machine.state.usage();
        Self {
            machine_id: machine.id,
            status: machine.status(),
            user_name: usage.map(|u| u.owner.clone()),
            remaining_minutes: machine.remaining_minutes(now),
            end_time: usage.map(|u| u.ends_at),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReservationView {
    pub user_name: String,
    pub reservation_time: DateTime<Utc>,
    pub expiry_time: DateTime<Utc>,
    pub is_expired: bool,
}

impl ReservationView {
    fn from_reservation(reservation: &Reservation, now: DateTime<Utc>) -> Self {
        Self {
            user_name: reservation.requester.clone(),
            reservation_time: reservation.created_at,
            expiry_time: reservation.expires_at,
            is_expired: reservation.is_expired(now),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub machines: Vec<MachineView>,
    pub reservations: Vec<ReservationView>,
    pub total_machines: usize,
    pub available_count: usize,
    pub in_use_count: usize,
    pub completed_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct NotificationView {
    pub user_name: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl From<Notification> for NotificationView {
    fn from(n: Notification) -> Self {
        Self {
            user_name: n.recipient,
            message: n.message,
            timestamp: n.created_at,
        }
    }
}

/// Outcome of a user action, as reported to the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ActionResult {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub machine_id: Option<MachineId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_reservation: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_position: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_user: Option<String>,
}

impl ActionResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            ..Self::default()
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    Ready,
    Unhealthy,
}

/// Snapshot of service health for transports to query.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub status: HealthStatus,
    pub version: VersionInfo,
    pub total_machines: usize,
}

pub struct LaundryService {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    pool: ResourcePool,
    monitor: Arc<StatusMonitor>,
    notifications: NotificationCenter,
    version: VersionInfo,
}

impl LaundryService {
    /// Build the service over an already-initialised store.
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>, config: PoolConfig) -> Self {
        Self {
            pool: ResourcePool::new(Arc::clone(&store), Arc::clone(&clock), config),
            monitor: Arc::new(StatusMonitor::new(Arc::clone(&store), Arc::clone(&clock))),
            notifications: NotificationCenter::new(Arc::clone(&store)),
            store,
            clock,
            version: VersionInfo::new(),
        }
    }

    pub fn with_version(mut self, version: VersionInfo) -> Self {
        self.version = version;
        self
    }

    pub fn config(&self) -> &PoolConfig {
        self.pool.config()
    }

    /// Run the status monitor on the configured poll interval until `cancel`.
    pub fn start_monitor(&self, cancel: CancellationToken) -> JoinHandle<()> {
        Arc::clone(&self.monitor).spawn(self.config().poll_interval, cancel)
    }

    pub async fn health(&self) -> HealthSnapshot {
        let (status, total_machines) = match self.store.list_machines().await {
            Ok(machines) => (HealthStatus::Ready, machines.len()),
            Err(e) => {
                tracing::warn!(error = %e, "Health check could not read machines");
                (HealthStatus::Unhealthy, 0)
            }
        };
        HealthSnapshot {
            status,
            version: self.version.clone(),
            total_machines,
        }
    }

    /// Full picture of machines and the wait list.
    ///
    /// Finished washes are completed and expired reservations dropped before
    /// reading, so the snapshot never shows stale entries.
    pub async fn status(&self) -> Result<StatusSnapshot, StoreError> {
        self.monitor.sweep().await?;
        let now = self.clock.now();
        self.pool.queue().purge_expired(now).await?;

        let machines = self.store.list_machines().await?;
        let reservations = self.pool.queue().list().await?;

        let count =
            |status: MachineStatus| machines.iter().filter(|m| m.status() == status).count();
        Ok(StatusSnapshot {
            total_machines: machines.len(),
            available_count: count(MachineStatus::Available),
            in_use_count: count(MachineStatus::InUse),
            completed_count: count(MachineStatus::Completed),
            machines: machines
                .iter()
                .map(|m| MachineView::from_machine(m, now))
                .collect(),
            reservations: reservations
                .iter()
                .map(|r| ReservationView::from_reservation(r, now))
                .collect(),
        })
    }

    pub async fn start_use(
        &self,
        requester: &str,
        duration_minutes: Option<u32>,
    ) -> Result<ActionResult, PoolError> {
        let duration = duration_minutes.unwrap_or(self.config().default_duration_minutes);
        Ok(match self.pool.allocate(requester, duration).await? {
            Allocation::Claimed(machine) => ActionResult {
                machine_id: Some(machine),
                ..ActionResult::ok(format!("Machine {machine} has started!"))
            },
            Allocation::Queued { position } => ActionResult {
                is_reservation: Some(true),
                queue_position: Some(position),
                ..ActionResult::ok(format!(
                    "All machines are busy. You have been added to the wait list (position {position})."
                ))
            },
        })
    }

    pub async fn complete_use(
        &self,
        machine: MachineId,
        requester: &str,
    ) -> Result<ActionResult, PoolError> {
        let release = self.pool.release(machine, requester).await?;
        Ok(match release.promoted {
            Some(next) => ActionResult {
                next_user: Some(next),
                ..ActionResult::ok("Laundry collected. The next person in line has started washing.")
            },
            None => ActionResult::ok("Laundry collected."),
        })
    }

    pub async fn cancel_reservation(&self, requester: &str) -> Result<ActionResult, PoolError> {
        self.pool.cancel(requester).await?;
        Ok(ActionResult::ok("Reservation cancelled."))
    }

    /// Unread notifications for `requester`, newest first.
    pub async fn notifications(&self, requester: &str) -> Result<Vec<NotificationView>, PoolError> {
        let requester = validate_requester(requester)?;
        let unread = self.notifications.unread_for(requester).await?;
        Ok(unread.into_iter().map(NotificationView::from).collect())
    }

    pub async fn clear_notifications(&self, requester: &str) -> Result<ActionResult, PoolError> {
        let requester = validate_requester(requester)?;
        let cleared = self.notifications.clear(requester).await?;
        tracing::debug!(requester, cleared, "Notifications cleared");
        Ok(ActionResult::ok("Notifications cleared."))
    }
}
