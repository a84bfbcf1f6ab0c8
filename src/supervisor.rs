// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Supervisor
//!
//! Keeps a set of consumers subscribed across connection losses.
//!
//! The supervisor listens to its [`ConnectionManager`]: every consumer is
//! activated when a connection is established and deactivated when it is lost
//! or closed. Activations that fail, and consumers whose channel alone was
//! shut down, are picked up by a retry task that re-activates them every
//! consumer retry interval for as long as the connection is up. That task is
//! spawned with the supervisor and stops on [`shutdown`](ConsumerSupervisor::shutdown),
//! when the manager is closed or when the last supervisor handle is dropped.
//!
//! ```ignore
//! let supervisor = ConsumerSupervisor::new(manager.clone());
//! supervisor
//!     .add_consumer(ConsumerRegistration::new("orders", handler).topology(topology))
//!     .await?;
//! manager.connect()?;
//! ```

use crate::{
    client::BrokerConnection,
    consumer::ConsumerRegistration,
    errors::AmqpError,
    holder::ConsumerHolder,
    listener::{ConnectionListener, ListenerId},
    manager::ConnectionManager,
    shutdown::RecoveryPolicy,
    topology::{AmqpTopologyDeclarer, TopologyDeclarer},
};
use async_trait::async_trait;
use std::{
    sync::{Arc, PoisonError, RwLock, Weak},
    time::Duration,
};
use tokio::{sync::Notify, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

struct SupervisorInner {
    manager: ConnectionManager,
    declarer: Arc<dyn TopologyDeclarer>,
    policy: Arc<dyn RecoveryPolicy>,
    holders: RwLock<Vec<Arc<ConsumerHolder>>>,
    retry_wake: Arc<Notify>,
    retry_interval: Duration,
    cancel: CancellationToken,
    listener_id: std::sync::Mutex<Option<ListenerId>>,
    retry_watcher: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Drop for SupervisorInner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Handle to a consumer supervisor. Cheap to clone.
#[derive(Clone)]
pub struct ConsumerSupervisor {
    inner: Arc<SupervisorInner>,
}

/// Registered on the manager; holds a weak reference so that neither the
/// manager nor the retry task keeps a dropped supervisor alive.
struct SupervisorListener {
    supervisor: Weak<SupervisorInner>,
}

#[async_trait]
impl ConnectionListener for SupervisorListener {
    async fn on_established(&self, connection: Arc<dyn BrokerConnection>) -> Result<(), AmqpError> {
        if let Some(inner) = self.supervisor.upgrade() {
            let supervisor = ConsumerSupervisor { inner };
            let activated = supervisor.activate_all(&connection).await;
            info!(
                activated,
                total = supervisor.consumer_count(),
                "consumers activated on new connection"
            );
        }
        Ok(())
    }

    async fn on_lost(&self) -> Result<(), AmqpError> {
        if let Some(inner) = self.supervisor.upgrade() {
            let supervisor = ConsumerSupervisor { inner };
            // Consumers already moved to a newer connection stay up.
            let current = supervisor.inner.manager.get_connection().await.ok();
            for holder in supervisor.consumers() {
                holder.deactivate_unless_bound_to(current.as_ref()).await;
            }
        }
        Ok(())
    }

    async fn on_closed(&self) -> Result<(), AmqpError> {
        if let Some(inner) = self.supervisor.upgrade() {
            ConsumerSupervisor { inner }.deactivate_all().await;
        }
        Ok(())
    }
}

impl ConsumerSupervisor {
    /// Creates a supervisor declaring topology with [`AmqpTopologyDeclarer`].
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(manager: ConnectionManager) -> ConsumerSupervisor {
        ConsumerSupervisor::with_declarer(manager, Arc::new(AmqpTopologyDeclarer))
    }

    /// Must be called from within a tokio runtime: the consumer retry task is
    /// spawned right away.
    pub fn with_declarer(
        manager: ConnectionManager,
        declarer: Arc<dyn TopologyDeclarer>,
    ) -> ConsumerSupervisor {
        let policy = manager.recovery_policy();
        let retry_interval = manager.config().consumer_retry_interval_duration();

        let supervisor = ConsumerSupervisor {
            inner: Arc::new(SupervisorInner {
                manager,
                declarer,
                policy,
                holders: RwLock::new(vec![]),
                retry_wake: Arc::new(Notify::new()),
                retry_interval,
                cancel: CancellationToken::new(),
                listener_id: std::sync::Mutex::new(None),
                retry_watcher: std::sync::Mutex::new(None),
            }),
        };

        let id = supervisor
            .inner
            .manager
            .add_listener(Arc::new(SupervisorListener {
                supervisor: Arc::downgrade(&supervisor.inner),
            }));
        *supervisor
            .inner
            .listener_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(id);

        let watcher = tokio::spawn(run_retry_watcher(Arc::downgrade(&supervisor.inner)));
        *supervisor
            .inner
            .retry_watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(watcher);

        supervisor
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.inner.manager
    }

    /// Registers a consumer and activates it right away when connected.
    ///
    /// An activation failure is not returned: the consumer stays registered
    /// and the retry task takes care of it.
    pub async fn add_consumer(
        &self,
        registration: ConsumerRegistration,
    ) -> Result<Arc<ConsumerHolder>, AmqpError> {
        if self.inner.cancel.is_cancelled() {
            return Err(AmqpError::Closed);
        }

        let holder = ConsumerHolder::new(
            registration,
            self.inner.declarer.clone(),
            self.inner.policy.clone(),
            self.inner.retry_wake.clone(),
        );

        self.inner
            .holders
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(holder.clone());

        info!(queue = holder.queue(), "consumer registered");

        if let Ok(connection) = self.inner.manager.get_connection().await {
            // Failure is already logged by the holder.
            let _ = holder.activate(&connection).await;
        }
        self.inner.retry_wake.notify_one();

        Ok(holder)
    }

    /// Unregisters and deactivates every consumer of `queue`.
    pub async fn remove_consumer(&self, queue: &str) -> bool {
        let removed: Vec<Arc<ConsumerHolder>> = {
            let mut holders = self
                .inner
                .holders
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            let (removed, kept) = holders.drain(..).partition(|h| h.queue() == queue);
            *holders = kept;
            removed
        };

        for holder in &removed {
            holder.deactivate().await;
        }

        !removed.is_empty()
    }

    pub fn consumers(&self) -> Vec<Arc<ConsumerHolder>> {
        self.inner
            .holders
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn consumer_count(&self) -> usize {
        self.inner
            .holders
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn active_count(&self) -> usize {
        self.consumers().iter().filter(|h| h.is_active()).count()
    }

    pub fn all_active(&self) -> bool {
        self.consumers().iter().all(|h| h.is_active())
    }

    /// Activates every consumer on `connection` and returns how many ended up
    /// active. Consumers already running on it are left alone.
    pub async fn activate_all(&self, connection: &Arc<dyn BrokerConnection>) -> usize {
        let mut active = 0;

        for holder in self.consumers() {
            if holder.activate(connection).await.is_ok() {
                active += 1;
            }
        }

        active
    }

    pub async fn deactivate_all(&self) {
        for holder in self.consumers() {
            holder.deactivate().await;
        }
    }

    /// Stops the retry task, detaches from the manager and deactivates every
    /// consumer. The manager itself is left running.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();

        let id = self
            .inner
            .listener_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(id) = id {
            self.inner.manager.remove_listener(id);
        }

        let watcher = self
            .inner
            .retry_watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(watcher) = watcher {
            watcher.abort();
        }

        self.deactivate_all().await;
        info!("consumer supervisor stopped");
    }
}

/// Re-activates inactive consumers while the connection is up.
async fn run_retry_watcher(supervisor: Weak<SupervisorInner>) {
    let Some(inner) = supervisor.upgrade() else {
        return;
    };
    let cancel = inner.cancel.clone();
    let retry_wake = inner.retry_wake.clone();
    let retry_interval = inner.retry_interval;
    let mut state_rx = inner.manager.subscribe_state();
    drop(inner);

    debug!("consumer retry watcher started");

    loop {
        let state = *state_rx.borrow_and_update();

        if cancel.is_cancelled() || state.is_closed() {
            break;
        }

        let Some(inner) = supervisor.upgrade() else {
            break;
        };
        let current = ConsumerSupervisor { inner };

        if state.is_connected() && !current.all_active() {
            if let Ok(connection) = current.inner.manager.get_connection().await {
                let total = current.consumer_count();
                let active = current.activate_all(&connection).await;
                if active == total {
                    continue;
                }
                warn!(
                    inactive = total - active,
                    "consumers still inactive, retrying later"
                );
            }
            drop(current);

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(retry_interval) => {}
            }
            continue;
        }
        drop(current);

        // Either waiting for a connection or everything is subscribed.
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = retry_wake.notified() => {}
            changed = state_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    debug!("consumer retry watcher stopped");
}
