//! Background sweep that moves finished washes to Completed.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::machine::{MachineId, MachineState};
use crate::notification::{NotificationCenter, pickup_message};
use crate::store::{Store, StoreResult};

pub struct StatusMonitor {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    notifications: NotificationCenter,
}

impl StatusMonitor {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        Self {
            notifications: NotificationCenter::new(Arc::clone(&store)),
            store,
            clock,
        }
    }

    /// Complete every InUse machine whose end time has passed and tell its
    /// owner. Returns how many machines this call completed.
    ///
    /// Running twice for the same instant completes nothing the second time,
    /// and each owner hears about a given wash once. A machine whose pickup
    /// notice cannot be stored stays InUse so the next sweep tries again.
    pub async fn sweep(&self) -> StoreResult<usize> {
        let now = self.clock.now();
        let mut completed = 0;

        for machine in self.store.list_machines().await? {
            let MachineState::InUse(usage) = &machine.state else {
                continue;
            };
            if !usage.is_due(now) {
                continue;
            }
            let done = MachineState::Completed(usage.clone());
            if !self
                .store
                .compare_and_set_machine(machine.id, &machine.state, done.clone())
                .await?
            {
                tracing::debug!(machine = %machine.id, "Machine changed during sweep, skipping");
                continue;
            }

            let notified = self
                .notifications
                .notify(&usage.owner, &pickup_message(machine.id), now)
                .await;
            if let Err(e) = notified {
                tracing::warn!(
                    machine = %machine.id,
                    owner = %usage.owner,
                    error = %e,
                    "Pickup notification failed, will retry next sweep"
                );
                self.rollback(machine.id, &machine.state, done).await;
                continue;
            }

            tracing::info!(machine = %machine.id, owner = %usage.owner, "Wash finished");
            completed += 1;
        }

        Ok(completed)
    }

    /// Return a machine to InUse so the next sweep completes it again. Skipped
    /// when the owner already collected in between.
    async fn rollback(&self, id: MachineId, in_use: &MachineState, done: MachineState) {
        match self
            .store
            .compare_and_set_machine(id, &done, in_use.clone())
            .await
        {
            Ok(true) => {}
            Ok(false) => tracing::debug!(machine = %id, "Machine moved on before rollback"),
            Err(e) => {
                tracing::warn!(machine = %id, error = %e, "Failed to roll back completion");
            }
        }
    }

    /// Sweep every `interval` until `cancel` fires. A failed sweep is logged
    /// and retried on the next tick.
    pub fn spawn(self: Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tracing::debug!(interval_ms = interval.as_millis() as u64, "Status monitor started");

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.sweep().await {
                            tracing::warn!(error = %e, "Status sweep failed");
                        }
                    }
                }
            }

            tracing::debug!("Status monitor stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;

    use super::*;
    use crate::clock::ManualClock;
    use crate::machine::{MachineStatus, Usage};
    use crate::store::MemoryStore;
    use crate::store::testing::FlakyStore;

    async fn setup() -> (Arc<StatusMonitor>, Arc<MemoryStore>, Arc<ManualClock>) {
        let store = Arc::new(MemoryStore::new());
        store.init_machines(2).await.unwrap();
        let clock = Arc::new(ManualClock::default());
        let monitor = Arc::new(StatusMonitor::new(store.clone(), clock.clone()));
        (monitor, store, clock)
    }

    async fn occupy(store: &MemoryStore, clock: &ManualClock, id: u32, owner: &str, minutes: u32) {
        store
            .update_machine(
                MachineId::new(id),
                MachineState::InUse(Usage::starting(owner, clock.now(), minutes)),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn sweep_completes_only_due_machines() {
        let (monitor, store, clock) = setup().await;
        occupy(&store, &clock, 1, "alice", 10).await;
        occupy(&store, &clock, 2, "bob", 60).await;

        assert_eq!(monitor.sweep().await.unwrap(), 0);

        clock.advance(ChronoDuration::minutes(10));
        assert_eq!(monitor.sweep().await.unwrap(), 1);

        let machines = store.list_machines().await.unwrap();
        assert_eq!(machines[0].status(), MachineStatus::Completed);
        assert_eq!(machines[0].state.owner(), Some("alice"));
        assert_eq!(machines[1].status(), MachineStatus::InUse);

        let inbox = store.list_unread_notifications("alice").await.unwrap();
        assert_eq!(inbox.len(), 1);
        assert_eq!(
            inbox[0].message,
            "Machine 1 has finished washing. Please collect your laundry."
        );
    }

    #[tokio::test]
    async fn repeated_sweeps_notify_once() {
        let (monitor, store, clock) = setup().await;
        occupy(&store, &clock, 1, "alice", 10).await;
        clock.advance(ChronoDuration::minutes(11));

        assert_eq!(monitor.sweep().await.unwrap(), 1);
        assert_eq!(monitor.sweep().await.unwrap(), 0);
        clock.advance(ChronoDuration::minutes(30));
        assert_eq!(monitor.sweep().await.unwrap(), 0);

        assert_eq!(store.list_unread_notifications("alice").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failed_pickup_notice_is_retried_next_sweep() {
        let store = Arc::new(FlakyStore::new());
        store.init_machines(2).await.unwrap();
        let clock = Arc::new(ManualClock::default());
        let monitor = StatusMonitor::new(store.clone(), clock.clone());
        for (id, owner) in [(1, "alice"), (2, "bob")] {
            store
                .update_machine(
                    MachineId::new(id),
                    MachineState::InUse(Usage::starting(owner, clock.now(), 10)),
                )
                .await
                .unwrap();
        }
        clock.advance(ChronoDuration::minutes(10));
        store.fail_next_notifications(1);

        // alice's notice fails; bob's machine is still handled in the same pass.
        assert_eq!(monitor.sweep().await.unwrap(), 1);
        let machines = store.list_machines().await.unwrap();
        assert_eq!(machines[0].status(), MachineStatus::InUse);
        assert_eq!(machines[1].status(), MachineStatus::Completed);
        assert!(store.list_unread_notifications("alice").await.unwrap().is_empty());

        assert_eq!(monitor.sweep().await.unwrap(), 1);
        assert_eq!(
            store.list_machines().await.unwrap()[0].status(),
            MachineStatus::Completed
        );
        assert_eq!(store.list_unread_notifications("alice").await.unwrap().len(), 1);
        assert_eq!(store.list_unread_notifications("bob").await.unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_sweeps_notify_once() {
        let (monitor, store, clock) = setup().await;
        occupy(&store, &clock, 1, "alice", 10).await;
        occupy(&store, &clock, 2, "bob", 10).await;
        clock.advance(ChronoDuration::minutes(10));

        let sweeps: Vec<_> = (0..8)
            .map(|_| {
                let monitor = Arc::clone(&monitor);
                tokio::spawn(async move { monitor.sweep().await.unwrap() })
            })
            .collect();
        let total: usize = futures::future::join_all(sweeps)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .sum();

        assert_eq!(total, 2);
        assert_eq!(store.list_unread_notifications("alice").await.unwrap().len(), 1);
        assert_eq!(store.list_unread_notifications("bob").await.unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn spawned_loop_sweeps_until_cancelled() {
        let (monitor, store, clock) = setup().await;
        occupy(&store, &clock, 1, "alice", 1).await;
        clock.advance(ChronoDuration::minutes(2));

        let cancel = CancellationToken::new();
        let handle = Arc::clone(&monitor).spawn(std::time::Duration::from_secs(10), cancel.clone());

        tokio::time::sleep(std::time::Duration::from_secs(11)).await;
        assert_eq!(
            store.list_machines().await.unwrap()[0].status(),
            MachineStatus::Completed
        );

        cancel.cancel();
        handle.await.unwrap();
    }
}
