//! Per-user mailbox of unread messages.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::machine::MachineId;
use crate::store::{Store, StoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NotificationId(i64);

impl NotificationId {
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    pub const fn get(self) -> i64 {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub id: NotificationId,
    pub recipient: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
    pub read: bool,
}

pub(crate) fn pickup_message(machine: MachineId) -> String {
    format!("Machine {machine} has finished washing. Please collect your laundry.")
}

pub(crate) fn promotion_message(machine: MachineId) -> String {
    format!("Machine {machine} is now yours. Your wash has started automatically.")
}

#[derive(Clone)]
pub struct NotificationCenter {
    store: Arc<dyn Store>,
}

impl NotificationCenter {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn notify(
        &self,
        recipient: &str,
        message: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<NotificationId> {
        let id = self.store.insert_notification(recipient, message, now).await?;
        tracing::debug!(recipient, notification = id.get(), "Notification queued");
        Ok(id)
    }

    /// Newest first.
    pub async fn unread_for(&self, recipient: &str) -> StoreResult<Vec<Notification>> {
        self.store.list_unread_notifications(recipient).await
    }

    pub async fn clear(&self, recipient: &str) -> StoreResult<usize> {
        self.store.mark_all_read(recipient).await
    }
}
