//! Persistence contract consumed by the engine.
//!
//! The engine keeps no state of its own between calls: every operation re-reads
//! what it needs from a [`Store`], and the only multi-field atomicity it relies
//! on is [`Store::compare_and_set_machine`] on a single machine row.

mod memory;
mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::machine::{Machine, MachineId, MachineState};
use crate::notification::{Notification, NotificationId};
use crate::reservation::{Reservation, ReservationId};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("machine {0} does not exist")]
    UnknownMachine(MachineId),
    #[error("corrupt record: {0}")]
    Corrupt(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// CRUD contract for machines, reservations and notifications.
///
/// All methods must be safe to call concurrently.
#[async_trait]
pub trait Store: Send + Sync {
    /// Create machines `1..=count` if the store holds none yet. Returns how many
    /// machines exist afterwards.
    async fn init_machines(&self, count: u32) -> StoreResult<usize>;

    /// All machines, ordered by id.
    async fn list_machines(&self) -> StoreResult<Vec<Machine>>;

    async fn update_machine(&self, id: MachineId, state: MachineState) -> StoreResult<()>;

    /// Write `new` only if the machine is currently in `expected`.
    ///
    /// Returns `false` when the machine changed underneath the caller.
    async fn compare_and_set_machine(
        &self,
        id: MachineId,
        expected: &MachineState,
        new: MachineState,
    ) -> StoreResult<bool>;

    async fn insert_reservation(
        &self,
        requester: &str,
        created_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> StoreResult<ReservationId>;

    /// All reservations, oldest first (ties broken by id).
    async fn list_reservations(&self) -> StoreResult<Vec<Reservation>>;

    /// Returns `true` only for the call that actually removed the row.
    async fn delete_reservation(&self, id: ReservationId) -> StoreResult<bool>;

    async fn delete_reservations_by_requester(&self, requester: &str) -> StoreResult<usize>;

    /// Remove every reservation with `expires_at < now`.
    async fn delete_expired_reservations(&self, now: DateTime<Utc>) -> StoreResult<usize>;

    async fn insert_notification(
        &self,
        recipient: &str,
        message: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<NotificationId>;

    /// Unread notifications for `recipient`, newest first.
    async fn list_unread_notifications(&self, recipient: &str) -> StoreResult<Vec<Notification>>;

    async fn mark_all_read(&self, recipient: &str) -> StoreResult<usize>;
}


/// [`MemoryStore`] with switchable faults.
#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::*;

    #[derive(Default)]
    pub struct FlakyStore {
        inner: MemoryStore,
        lose_machine_writes: AtomicBool,
        failing_notifications: AtomicUsize,
    }

    impl FlakyStore {
        pub fn new() -> Self {
            Self::default()
        }

        /// Every later compare-and-set reports that the row changed.
        pub fn lose_machine_writes(&self) {
            self.lose_machine_writes.store(true, Ordering::SeqCst);
        }

        /// The next `count` notification inserts fail.
        pub fn fail_next_notifications(&self, count: usize) {
            self.failing_notifications.store(count, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Store for FlakyStore {
        async fn init_machines(&self, count: u32) -> StoreResult<usize> {
            self.inner.init_machines(count).await
        }

        async fn list_machines(&self) -> StoreResult<Vec<Machine>> {
            self.inner.list_machines().await
        }

        async fn update_machine(&self, id: MachineId, state: MachineState) -> StoreResult<()> {
            self.inner.update_machine(id, state).await
        }

        async fn compare_and_set_machine(
            &self,
            id: MachineId,
            expected: &MachineState,
            new: MachineState,
        ) -> StoreResult<bool> {
            if self.lose_machine_writes.load(Ordering::SeqCst) {
                return Ok(false);
            }
            self.inner.compare_and_set_machine(id, expected, new).await
        }

        async fn insert_reservation(
            &self,
            requester: &str,
            created_at: DateTime<Utc>,
            expires_at: DateTime<Utc>,
        ) -> StoreResult<ReservationId> {
            self.inner
                .insert_reservation(requester, created_at, expires_at)
                .await
        }

        async fn list_reservations(&self) -> StoreResult<Vec<Reservation>> {
            self.inner.list_reservations().await
        }

        async fn delete_reservation(&self, id: ReservationId) -> StoreResult<bool> {
            self.inner.delete_reservation(id).await
        }

        async fn delete_reservations_by_requester(&self, requester: &str) -> StoreResult<usize> {
            self.inner.delete_reservations_by_requester(requester).await
        }

        async fn delete_expired_reservations(&self, now: DateTime<Utc>) -> StoreResult<usize> {
            self.inner.delete_expired_reservations(now).await
        }

        async fn insert_notification(
            &self,
            recipient: &str,
            message: &str,
            now: DateTime<Utc>,
        ) -> StoreResult<NotificationId> {
            let failing = self
                .failing_notifications
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(StoreError::Corrupt("injected notification failure".into()));
            }
            self.inner.insert_notification(recipient, message, now).await
        }

        async fn list_unread_notifications(
            &self,
            recipient: &str,
        ) -> StoreResult<Vec<Notification>> {
            self.inner.list_unread_notifications(recipient).await
        }

        async fn mark_all_read(&self, recipient: &str) -> StoreResult<usize> {
            self.inner.mark_all_read(recipient).await
        }
    }
}
