//! In-process store.
//!
//! Machine rows live in a `DashMap`, so a compare-and-set holds the row's shard
//! lock for the whole read-compare-write. The queue is small and guarded by a
//! single mutex.

use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use super::{Store, StoreError, StoreResult};
use crate::machine::{Machine, MachineId, MachineState};
use crate::notification::{Notification, NotificationId};
use crate::reservation::{Reservation, ReservationId};

#[derive(Default)]
pub struct MemoryStore {
    machines: DashMap<MachineId, MachineState>,
    init_lock: StdMutex<()>,
    reservations: StdMutex<Vec<Reservation>>,
    next_reservation: AtomicI64,
    mailboxes: DashMap<String, Vec<Notification>>,
    next_notification: AtomicI64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn reservations(&self) -> std::sync::MutexGuard<'_, Vec<Reservation>> {
        self.reservations.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn init_machines(&self, count: u32) -> StoreResult<usize> {
        let _guard = self.init_lock.lock().unwrap_or_else(|e| e.into_inner());
        if self.machines.is_empty() {
            for id in 1..=count {
                self.machines.insert(MachineId::new(id), MachineState::Available);
            }
        }
        Ok(self.machines.len())
    }

    async fn list_machines(&self) -> StoreResult<Vec<Machine>> {
        let mut machines: Vec<Machine> = self
            .machines
            .iter()
            .map(|entry| Machine {
                id: *entry.key(),
                state: entry.value().clone(),
            })
            .collect();
        machines.sort_by_key(|m| m.id);
        Ok(machines)
    }

    async fn update_machine(&self, id: MachineId, state: MachineState) -> StoreResult<()> {
        let mut row = self
            .machines
            .get_mut(&id)
            .ok_or(StoreError::UnknownMachine(id))?;
        *row = state;
        Ok(())
    }

    async fn compare_and_set_machine(
        &self,
        id: MachineId,
        expected: &MachineState,
        new: MachineState,
    ) -> StoreResult<bool> {
        let mut row = self
            .machines
            .get_mut(&id)
            .ok_or(StoreError::UnknownMachine(id))?;
        if *row != *expected {
            return Ok(false);
        }
        *row = new;
        Ok(true)
    }

    async fn insert_reservation(
        &self,
        requester: &str,
        created_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> StoreResult<ReservationId> {
        let id = ReservationId::new(self.next_reservation.fetch_add(1, Ordering::Relaxed) + 1);
        self.reservations().push(Reservation {
            id,
            requester: requester.to_string(),
            created_at,
            expires_at,
        });
        Ok(id)
    }

    async fn list_reservations(&self) -> StoreResult<Vec<Reservation>> {
        let mut queue = self.reservations().clone();
        queue.sort_by_key(|r| (r.created_at, r.id));
        Ok(queue)
    }

    async fn delete_reservation(&self, id: ReservationId) -> StoreResult<bool> {
        let mut queue = self.reservations();
        let before = queue.len();
        queue.retain(|r| r.id != id);
        Ok(queue.len() < before)
    }

    async fn delete_reservations_by_requester(&self, requester: &str) -> StoreResult<usize> {
        let mut queue = self.reservations();
        let before = queue.len();
        queue.retain(|r| r.requester != requester);
        Ok(before - queue.len())
    }

    async fn delete_expired_reservations(&self, now: DateTime<Utc>) -> StoreResult<usize> {
        let mut queue = self.reservations();
        let before = queue.len();
        queue.retain(|r| r.expires_at >= now);
        Ok(before - queue.len())
    }

    async fn insert_notification(
        &self,
        recipient: &str,
        message: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<NotificationId> {
        let id = NotificationId::new(self.next_notification.fetch_add(1, Ordering::Relaxed) + 1);
        self.mailboxes
            .entry(recipient.to_string())
            .or_default()
            .push(Notification {
                id,
                recipient: recipient.to_string(),
                message: message.to_string(),
                created_at: now,
                read: false,
            });
        Ok(id)
    }

    async fn list_unread_notifications(&self, recipient: &str) -> StoreResult<Vec<Notification>> {
        let mut unread: Vec<Notification> = self
            .mailboxes
            .get(recipient)
            .map(|mailbox| mailbox.iter().filter(|n| !n.read).cloned().collect())
            .unwrap_or_default();
        unread.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(unread)
    }

    async fn mark_all_read(&self, recipient: &str) -> StoreResult<usize> {
        let Some(mut mailbox) = self.mailboxes.get_mut(recipient) else {
            return Ok(0);
        };
        let mut marked = 0;
        for notification in mailbox.iter_mut().filter(|n| !n.read) {
            notification.read = true;
            marked += 1;
        }
        Ok(marked)
    }
}
