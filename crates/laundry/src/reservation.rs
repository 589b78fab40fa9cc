//! FIFO wait list with lazy TTL expiry.
//!
//! Entries are never timed out by a timer; [`ReservationQueue::purge_expired`] is
//! called before anything that reads the queue.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::store::{Store, StoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReservationId(i64);

impl ReservationId {
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    pub const fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for ReservationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub id: ReservationId,
    pub requester: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Reservation {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// A freshly queued reservation and its 1-indexed place in line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Enqueued {
    pub id: ReservationId,
    pub position: usize,
}

#[derive(Clone)]
pub struct ReservationQueue {
    store: Arc<dyn Store>,
    ttl: Duration,
}

impl ReservationQueue {
    pub fn new(store: Arc<dyn Store>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Append `requester`. Does not check for an existing reservation by the
    /// same requester. An expiry past the representable range saturates.
    pub async fn enqueue(&self, requester: &str, now: DateTime<Utc>) -> StoreResult<Enqueued> {
        let expires_at = now
            .checked_add_signed(self.ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let id = self
            .store
            .insert_reservation(requester, now, expires_at)
            .await?;
        let position = self.store.list_reservations().await?.len();
        Ok(Enqueued { id, position })
    }

    pub async fn purge_expired(&self, now: DateTime<Utc>) -> StoreResult<usize> {
        let purged = self.store.delete_expired_reservations(now).await?;
        if purged > 0 {
            tracing::debug!(purged, "Purged expired reservations");
        }
        Ok(purged)
    }

    pub async fn oldest(&self) -> StoreResult<Option<Reservation>> {
        Ok(self.store.list_reservations().await?.into_iter().next())
    }

    /// Remove and return the oldest reservation.
    ///
    /// If a concurrent caller consumes the head first, the next entry is tried.
    pub async fn take_oldest(&self) -> StoreResult<Option<Reservation>> {
        for reservation in self.store.list_reservations().await? {
            if self.store.delete_reservation(reservation.id).await? {
                return Ok(Some(reservation));
            }
        }
        Ok(None)
    }

    /// Put back a reservation taken by [`take_oldest`](Self::take_oldest) with its
    /// original timestamps, so it keeps its place in line.
    pub async fn restore(&self, reservation: &Reservation) -> StoreResult<ReservationId> {
        self.store
            .insert_reservation(
                &reservation.requester,
                reservation.created_at,
                reservation.expires_at,
            )
            .await
    }

    pub async fn remove_by_requester(&self, requester: &str) -> StoreResult<usize> {
        self.store.delete_reservations_by_requester(requester).await
    }

    pub async fn list(&self) -> StoreResult<Vec<Reservation>> {
        self.store.list_reservations().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn queue() -> ReservationQueue {
        ReservationQueue::new(Arc::new(MemoryStore::new()), Duration::minutes(5))
    }

    #[tokio::test]
    async fn positions_count_live_entries() {
        let queue = queue();
        let t0 = Utc::now();

        let a = queue.enqueue("alice", t0).await.unwrap();
        let b = queue.enqueue("bob", t0 + Duration::seconds(1)).await.unwrap();

        assert_eq!(a.position, 1);
        assert_eq!(b.position, 2);
    }

    #[tokio::test]
    async fn duplicate_requesters_are_allowed() {
        let queue = queue();
        let t0 = Utc::now();

        queue.enqueue("alice", t0).await.unwrap();
        let again = queue.enqueue("alice", t0).await.unwrap();

        assert_eq!(again.position, 2);
        assert_eq!(queue.remove_by_requester("alice").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn expired_entries_are_gone_after_ttl() {
        let queue = queue();
        let t0 = Utc::now();
        queue.enqueue("alice", t0).await.unwrap();

        assert_eq!(queue.purge_expired(t0 + Duration::minutes(4)).await.unwrap(), 0);
        assert_eq!(
            queue
                .purge_expired(t0 + Duration::minutes(5) + Duration::seconds(1))
                .await
                .unwrap(),
            1
        );
        assert!(queue.oldest().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn oversized_ttl_saturates_instead_of_overflowing() {
        let queue = ReservationQueue::new(Arc::new(MemoryStore::new()), Duration::MAX);
        let t0 = Utc::now();

        let first = queue.enqueue("alice", t0).await.unwrap();
        let second = queue.enqueue("bob", t0).await.unwrap();

        assert_eq!(second.position, 2);
        let head = queue.oldest().await.unwrap().unwrap();
        assert_eq!(head.id, first.id);
        assert_eq!(head.expires_at, DateTime::<Utc>::MAX_UTC);
        assert_eq!(queue.purge_expired(t0 + Duration::days(365)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn take_oldest_is_fifo() {
        let queue = queue();
        let t0 = Utc::now();
        queue.enqueue("alice", t0).await.unwrap();
        queue.enqueue("bob", t0 + Duration::seconds(1)).await.unwrap();

        let first = queue.take_oldest().await.unwrap().unwrap();
        let second = queue.take_oldest().await.unwrap().unwrap();

        assert_eq!(first.requester, "alice");
        assert_eq!(second.requester, "bob");
        assert!(queue.take_oldest().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn restore_keeps_place_in_line() {
        let queue = queue();
        let t0 = Utc::now();
        queue.enqueue("alice", t0).await.unwrap();
        queue.enqueue("bob", t0 + Duration::seconds(1)).await.unwrap();

        let alice = queue.take_oldest().await.unwrap().unwrap();
        queue.restore(&alice).await.unwrap();

        let head = queue.oldest().await.unwrap().unwrap();
        assert_eq!(head.requester, "alice");
        assert_eq!(head.created_at, alice.created_at);
    }

    #[test]
    fn expiry_is_strictly_after_deadline() {
        let t0 = Utc::now();
        let reservation = Reservation {
            id: ReservationId::new(1),
            requester: "alice".into(),
            created_at: t0,
            expires_at: t0 + Duration::minutes(5),
        };
        assert!(!reservation.is_expired(t0 + Duration::minutes(5)));
        assert!(reservation.is_expired(t0 + Duration::minutes(5) + Duration::milliseconds(1)));
    }
}
