//! Machine allocation and release.
//!
//! The pool owns every machine transition except `InUse -> Completed`, which
//! belongs to the [`StatusMonitor`](crate::monitor::StatusMonitor).
//!
//! Nothing here is cached. Each call re-reads the store and commits its single
//! machine write through [`Store::compare_and_set_machine`], so two requests
//! racing for the last free machine cannot both win it, and a release racing a
//! sweep cannot resurrect a stale state.

use std::sync::Arc;

use crate::clock::Clock;
use crate::config::PoolConfig;
use crate::machine::{MachineId, MachineState, MachineStatus, Usage};
use crate::notification::{NotificationCenter, promotion_message};
use crate::reservation::ReservationQueue;
use crate::store::{Store, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("{0}")]
    InvalidInput(String),
    #[error("machine {0} does not exist")]
    NotFound(MachineId),
    #[error("machine {machine} is {} and cannot be released", status.as_str())]
    InvalidState {
        machine: MachineId,
        status: MachineStatus,
    },
    #[error("machine {machine} belongs to someone else")]
    Forbidden { machine: MachineId },
    #[error("machine {0} changed while it was being released, try again")]
    Conflict(MachineId),
    #[error("{0} has no reservation to cancel")]
    NothingToCancel(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl PoolError {
    /// Stable snake_case label for logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid_input",
            Self::NotFound(_) => "not_found",
            Self::InvalidState { .. } => "invalid_state",
            Self::Forbidden { .. } => "forbidden",
            Self::Conflict(_) => "conflict",
            Self::NothingToCancel(_) => "nothing_to_cancel",
            Self::Store(_) => "store",
        }
    }
}

/// Outcome of [`ResourcePool::allocate`]: a machine, or a place in line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Allocation {
    Claimed(MachineId),
    Queued { position: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Release {
    pub machine: MachineId,
    /// Requester the machine was handed to, if the queue was non-empty.
    pub promoted: Option<String>,
}

/// Trimmed, non-empty requester name.
pub(crate) fn validate_requester(requester: &str) -> Result<&str, PoolError> {
    let requester = requester.trim();
    if requester.is_empty() {
        return Err(PoolError::InvalidInput(
            "Please enter a user name.".to_string(),
        ));
    }
    Ok(requester)
}

pub struct ResourcePool {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    queue: ReservationQueue,
    notifications: NotificationCenter,
    config: PoolConfig,
}

impl ResourcePool {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>, config: PoolConfig) -> Self {
        Self {
            queue: ReservationQueue::new(Arc::clone(&store), config.reservation_ttl_chrono()),
            notifications: NotificationCenter::new(Arc::clone(&store)),
            store,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn queue(&self) -> &ReservationQueue {
        &self.queue
    }

    fn validate_duration(&self, duration_minutes: u32) -> Result<(), PoolError> {
        let (min, max) = (
            self.config.min_duration_minutes,
            self.config.max_duration_minutes,
        );
        if !(min..=max).contains(&duration_minutes) {
            return Err(PoolError::InvalidInput(format!(
                "Wash duration must be between {min} and {max} minutes."
            )));
        }
        Ok(())
    }

    /// Claim the first Available machine for `requester`, or queue them.
    ///
    /// Writes exactly one machine row or inserts exactly one reservation.
    pub async fn allocate(
        &self,
        requester: &str,
        duration_minutes: u32,
    ) -> Result<Allocation, PoolError> {
        let requester = validate_requester(requester)?;
        self.validate_duration(duration_minutes)?;

        let now = self.clock.now();
        self.queue.purge_expired(now).await?;

        for machine in self.store.list_machines().await? {
            if !machine.state.is_available() {
                continue;
            }
            let claim = MachineState::InUse(Usage::starting(requester, now, duration_minutes));
            if self
                .store
                .compare_and_set_machine(machine.id, &MachineState::Available, claim)
                .await?
            {
                tracing::info!(
                    machine = %machine.id,
                    requester,
                    duration_minutes,
                    "Machine allocated"
                );
                return Ok(Allocation::Claimed(machine.id));
            }
            tracing::debug!(machine = %machine.id, requester, "Lost race for machine, trying next");
        }

        let enqueued = self.queue.enqueue(requester, now).await?;
        tracing::info!(
            requester,
            queue_position = enqueued.position,
            "No machine free, reservation queued"
        );
        Ok(Allocation::Queued {
            position: enqueued.position,
        })
    }

    /// Owner collects from `machine`; hands it straight to the oldest live
    /// reservation if there is one. The promoted requester leaves the wait
    /// list entirely, including any further reservations they held.
    pub async fn release(&self, machine: MachineId, requester: &str) -> Result<Release, PoolError> {
        let requester = validate_requester(requester)?;

        let current = self
            .store
            .list_machines()
            .await?
            .into_iter()
            .find(|m| m.id == machine)
            .ok_or(PoolError::NotFound(machine))?;

        match current.state.owner() {
            None => {
                return Err(PoolError::InvalidState {
                    machine,
                    status: current.status(),
                });
            }
            Some(owner) if owner != requester => {
                tracing::warn!(%machine, requester, "Release rejected: not the owner");
                return Err(PoolError::Forbidden { machine });
            }
            Some(_) => {}
        }

        let now = self.clock.now();
        self.queue.purge_expired(now).await?;

        let Some(next) = self.queue.take_oldest().await? else {
            if !self
                .store
                .compare_and_set_machine(machine, &current.state, MachineState::Available)
                .await?
            {
                return Err(PoolError::Conflict(machine));
            }
            tracing::info!(%machine, requester, "Machine released");
            return Ok(Release {
                machine,
                promoted: None,
            });
        };

        let handoff = MachineState::InUse(Usage::starting(
            &next.requester,
            now,
            self.config.default_duration_minutes,
        ));
        if !self
            .store
            .compare_and_set_machine(machine, &current.state, handoff)
            .await?
        {
            self.queue.restore(&next).await?;
            return Err(PoolError::Conflict(machine));
        }

        tracing::info!(
            %machine,
            requester,
            promoted = %next.requester,
            "Machine handed to next in line"
        );

        // The hand-off is committed; what follows must not turn it into a failure.
        if let Err(e) = self.queue.remove_by_requester(&next.requester).await {
            tracing::warn!(
                %machine,
                promoted = %next.requester,
                error = %e,
                "Failed to drop remaining reservations of promoted requester"
            );
        }
        if let Err(e) = self
            .notifications
            .notify(&next.requester, &promotion_message(machine), now)
            .await
        {
            tracing::warn!(
                %machine,
                promoted = %next.requester,
                error = %e,
                "Failed to notify promoted requester"
            );
        }

        Ok(Release {
            machine,
            promoted: Some(next.requester),
        })
    }

    /// Drop every live reservation held by `requester`.
    pub async fn cancel(&self, requester: &str) -> Result<usize, PoolError> {
        let requester = validate_requester(requester)?;
        let removed = self.queue.remove_by_requester(requester).await?;
        if removed == 0 {
            return Err(PoolError::NothingToCancel(requester.to_string()));
        }
        tracing::info!(requester, removed, "Reservation cancelled");
        Ok(removed)
    }
}
