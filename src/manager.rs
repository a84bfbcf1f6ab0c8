// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Manager
//!
//! Keeps one logical connection to one broker alive. The manager owns:
//! - the lifecycle [`ConnectionState`] and the live connection handle, both
//!   guarded by a single per-manager lock,
//! - the registered [`ConnectionListener`]s,
//! - the reconnection watcher task (see [`watcher`](crate::watcher)).
//!
//! Every transition is validated and applied under the lock; listeners are
//! notified afterwards, outside of it, before the transition call returns.
//!
//! ```ignore
//! let manager = ConnectionManager::new(config, Arc::new(LapinBrokerClient::new()));
//! manager.add_listener(my_listener);
//! manager.connect()?;
//! let connection = manager.wait_until_connected().await?;
//! ...
//! manager.close().await?;
//! ```

use crate::{
    client::{BrokerClient, BrokerConnection},
    config::ConnectionConfig,
    errors::AmqpError,
    listener::{ConnectionListener, ListenerId, ListenerSet},
    shutdown::{ConnectionShutdownDetector, RecoveryPolicy, ShutdownSignal},
    state::ConnectionState,
};
use futures_util::FutureExt;
use std::{
    fmt,
    panic::AssertUnwindSafe,
    sync::{Arc, PoisonError},
};
use tokio::{
    runtime::Handle,
    sync::{watch, Mutex, Notify},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// State guarded by the manager lock.
struct Shared {
    state: ConnectionState,
    connection: Option<Arc<dyn BrokerConnection>>,
    shutdown_hook: Option<ListenerId>,
    /// Bumped for every established connection, so that shutdown detectors of
    /// superseded handles can be told apart.
    generation: u64,
}

impl Shared {
    /// Unhooks and hands back the live handle, if any.
    fn detach(&mut self) -> Option<Arc<dyn BrokerConnection>> {
        let connection = self.connection.take()?;
        if let Some(hook) = self.shutdown_hook.take() {
            connection.remove_shutdown_listener(hook);
        }
        Some(connection)
    }
}

pub(crate) struct ManagerInner {
    pub(crate) config: ConnectionConfig,
    client: Arc<dyn BrokerClient>,
    policy: Arc<dyn RecoveryPolicy>,
    shared: Mutex<Shared>,
    state_tx: watch::Sender<ConnectionState>,
    listeners: ListenerSet<dyn ConnectionListener>,
    pub(crate) wake: Notify,
    pub(crate) cancel: CancellationToken,
    watcher: std::sync::Mutex<Option<JoinHandle<()>>>,
}

/// Handle to a managed broker connection. Cheap to clone.
#[derive(Clone)]
pub struct ConnectionManager {
    pub(crate) inner: Arc<ManagerInner>,
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("config", &self.inner.config)
            .field("state", &self.state())
            .finish()
    }
}

impl ConnectionManager {
    /// Creates a manager in `NeverConnected` state, using the recovery policy
    /// of `client`. Nothing happens until [`connect`](Self::connect).
    pub fn new(config: ConnectionConfig, client: Arc<dyn BrokerClient>) -> ConnectionManager {
        let policy = client.recovery_policy();
        ConnectionManager::with_recovery_policy(config, client, policy)
    }

    pub fn with_recovery_policy(
        config: ConnectionConfig,
        client: Arc<dyn BrokerClient>,
        policy: Arc<dyn RecoveryPolicy>,
    ) -> ConnectionManager {
        let (state_tx, _) = watch::channel(ConnectionState::NeverConnected);

        ConnectionManager {
            inner: Arc::new(ManagerInner {
                config,
                client,
                policy,
                shared: Mutex::new(Shared {
                    state: ConnectionState::NeverConnected,
                    connection: None,
                    shutdown_hook: None,
                    generation: 0,
                }),
                state_tx,
                listeners: ListenerSet::new(),
                wake: Notify::new(),
                cancel: CancellationToken::new(),
                watcher: std::sync::Mutex::new(None),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<ManagerInner>) -> ConnectionManager {
        ConnectionManager { inner }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    /// Receiver observing every state change.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Decides which shutdown signals are left to the broker client.
    pub fn recovery_policy(&self) -> Arc<dyn RecoveryPolicy> {
        self.inner.policy.clone()
    }

    pub fn add_listener(&self, listener: Arc<dyn ConnectionListener>) -> ListenerId {
        self.inner.listeners.add(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.listeners.remove(id)
    }

    /// Starts the reconnection watcher. Later calls are no-ops.
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect(&self) -> Result<(), AmqpError> {
        if self.state().is_closed() || self.inner.cancel.is_cancelled() {
            return Err(AmqpError::InvalidState(
                "connect called on a closed connection manager".to_owned(),
            ));
        }

        let mut watcher = self
            .inner
            .watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if watcher.is_some() {
            debug!("reconnection watcher already running");
            return Ok(());
        }

        let manager = self.clone();
        *watcher = Some(tokio::spawn(manager.run_watcher()));

        Ok(())
    }

    /// Makes one attempt to open a connection.
    ///
    /// The first attempt moves the manager out of `NeverConnected` into
    /// `Connecting`, which is reported to the listeners as a loss exactly once.
    /// Returns `Ok(false)` when the broker could not be reached; the state is
    /// left untouched in that case. Calling it while `Connected` or `Closed`
    /// is a contract violation.
    pub async fn try_establish(&self) -> Result<bool, AmqpError> {
        self.leave_never_connected().await?;

        let connection = {
            let mut shared = self.inner.shared.lock().await;

            if !shared.state.needs_connection() {
                return Err(AmqpError::InvalidState(format!(
                    "cannot establish a connection while {}",
                    shared.state
                )));
            }

            let opened = tokio::select! {
                biased;
                _ = self.inner.cancel.cancelled() => {
                    debug!("connection attempt cancelled");
                    return Ok(false);
                }
                opened = self.inner.client.open_connection(&self.inner.config) => opened,
            };

            let connection = match opened {
                Ok(connection) => connection,
                Err(err) if err.is_transient() => {
                    warn!(error = err.to_string(), "failure to connect, will retry");
                    return Ok(false);
                }
                Err(err) => {
                    error!(error = err.to_string(), "failure to connect, will retry");
                    return Ok(false);
                }
            };

            shared.generation += 1;
            let detector = ConnectionShutdownDetector::new(
                Arc::downgrade(&self.inner),
                shared.generation,
                self.inner.policy.clone(),
                Handle::current(),
            );
            let hook = connection.add_shutdown_listener(Arc::new(detector));

            // A shutdown fired before the hook was attached would go unnoticed.
            if !connection.is_open() {
                connection.remove_shutdown_listener(hook);
                drop(shared);
                warn!("connection closed right after opening, will retry");
                release(Some(connection)).await;
                return Ok(false);
            }

            shared.connection = Some(connection.clone());
            shared.shutdown_hook = Some(hook);
            self.apply_transition(&mut shared, ConnectionState::Connected)?;

            connection
        };

        self.dispatch(ConnectionState::Connected, Some(connection))
            .await;

        Ok(true)
    }

    async fn leave_never_connected(&self) -> Result<(), AmqpError> {
        {
            let mut shared = self.inner.shared.lock().await;
            if shared.state != ConnectionState::NeverConnected {
                return Ok(());
            }
            self.apply_transition(&mut shared, ConnectionState::Connecting)?;
        }

        self.dispatch(ConnectionState::Connecting, None).await;
        Ok(())
    }

    /// Applies a transition and notifies the listeners.
    ///
    /// `Connected` can only be entered through [`try_establish`](Self::try_establish).
    pub async fn change_state(&self, next: ConnectionState) -> Result<(), AmqpError> {
        let (stale, connection) = {
            let mut shared = self.inner.shared.lock().await;
            let stale = self.apply_transition(&mut shared, next)?;
            (stale, shared.connection.clone())
        };

        self.dispatch(next, connection).await;
        release(stale).await;

        if next.needs_connection() {
            self.inner.wake.notify_one();
        }

        Ok(())
    }

    /// The live connection, if the manager is connected.
    pub async fn get_connection(&self) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        let shared = self.inner.shared.lock().await;

        match (shared.state, &shared.connection) {
            (ConnectionState::Closed, _) => Err(AmqpError::Closed),
            (ConnectionState::Connected, Some(connection)) => Ok(connection.clone()),
            _ => Err(AmqpError::Unavailable),
        }
    }

    /// Waits for the next time the manager is connected.
    pub async fn wait_until_connected(&self) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        let mut state_rx = self.subscribe_state();

        loop {
            let state = *state_rx.borrow_and_update();

            match state {
                ConnectionState::Closed => return Err(AmqpError::Closed),
                ConnectionState::Connected => match self.get_connection().await {
                    Ok(connection) => return Ok(connection),
                    Err(AmqpError::Unavailable) => {}
                    Err(err) => return Err(err),
                },
                _ => {}
            }

            if state_rx.changed().await.is_err() {
                return Err(AmqpError::Closed);
            }
        }
    }

    /// Shuts the manager down for good. Calling it again is a no-op.
    pub async fn close(&self) -> Result<(), AmqpError> {
        self.inner.cancel.cancel();
        self.inner.wake.notify_one();

        let stale = {
            let mut shared = self.inner.shared.lock().await;

            if shared.state.is_closed() {
                warn!("connection manager already closed");
                return Ok(());
            }

            self.apply_transition(&mut shared, ConnectionState::Closed)?
        };

        // The watcher observes the cancellation on its own; awaiting it here
        // would deadlock when close() is called from a listener it drives.
        let watcher = self
            .inner
            .watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(watcher);

        self.dispatch(ConnectionState::Closed, None).await;
        release(stale).await;

        info!("connection manager closed");
        Ok(())
    }

    /// Reaction of the connection shutdown detector to an unrecoverable signal.
    pub(crate) async fn handle_unrecoverable_shutdown(
        &self,
        generation: u64,
        signal: &ShutdownSignal,
    ) {
        let stale = {
            let mut shared = self.inner.shared.lock().await;

            if shared.generation != generation || !shared.state.is_connected() {
                debug!(
                    state = %shared.state,
                    "ignoring shutdown of a connection that is no longer current"
                );
                return;
            }

            match self.apply_transition(&mut shared, ConnectionState::Connecting) {
                Ok(stale) => stale,
                Err(err) => {
                    warn!(error = err.to_string(), "could not mark connection as lost");
                    return;
                }
            }
        };

        warn!(reason = signal.reason.as_str(), "connection lost, reconnecting");

        self.dispatch(ConnectionState::Connecting, None).await;
        release(stale).await;

        // Reconnecting only once the listeners are done with the lost connection.
        self.inner.wake.notify_one();
    }

    fn apply_transition(
        &self,
        shared: &mut Shared,
        next: ConnectionState,
    ) -> Result<Option<Arc<dyn BrokerConnection>>, AmqpError> {
        let current = shared.state;

        if current.is_closed() {
            return Err(AmqpError::Closed);
        }

        if !current.can_transition_to(next) {
            return Err(AmqpError::InvalidState(format!(
                "transition {current} -> {next} is not allowed"
            )));
        }

        if next.is_connected() && shared.connection.is_none() {
            return Err(AmqpError::InvalidState(
                "cannot enter Connected without a live connection".to_owned(),
            ));
        }

        shared.state = next;
        self.inner.state_tx.send_replace(next);

        let stale = if next.is_connected() {
            None
        } else {
            shared.detach()
        };

        if next.is_closed() {
            self.inner.cancel.cancel();
            self.inner.wake.notify_one();
        }

        info!(from = %current, to = %next, "connection state changed");
        Ok(stale)
    }

    /// Notifies every listener of `state`, isolating their failures.
    async fn dispatch(&self, state: ConnectionState, connection: Option<Arc<dyn BrokerConnection>>) {
        for listener in self.inner.listeners.snapshot() {
            let outcome = match (state, &connection) {
                (ConnectionState::Connected, Some(connection)) => {
                    AssertUnwindSafe(listener.on_established(connection.clone()))
                        .catch_unwind()
                        .await
                }
                (ConnectionState::Connecting, _) => {
                    AssertUnwindSafe(listener.on_lost()).catch_unwind().await
                }
                (ConnectionState::Closed, _) => {
                    AssertUnwindSafe(listener.on_closed()).catch_unwind().await
                }
                _ => continue,
            };

            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(err)) => error!(
                    error = err.to_string(),
                    state = %state,
                    "connection listener failed"
                ),
                Err(_) => error!(state = %state, "connection listener panicked"),
            }
        }
    }
}

/// Best-effort close of a handle that is no longer in use.
async fn release(connection: Option<Arc<dyn BrokerConnection>>) {
    if let Some(connection) = connection {
        if let Err(err) = connection.close().await {
            debug!(error = err.to_string(), "ignoring failure closing stale connection");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        client::{MockBrokerClient, MockBrokerConnection},
        shutdown::{NoAutoRecovery, ShutdownCause, TransientNetworkRecovery},
        testing::{eventually, fast_config, FakeBroker, PanickingListener, RecordingListener},
    };
    use mockall::predicate::eq;
    use std::time::Duration;

    fn manager(broker: &Arc<FakeBroker>) -> ConnectionManager {
        ConnectionManager::new(fast_config(), broker.clone())
    }

    #[tokio::test]
    async fn failed_attempts_report_one_loss() {
        let broker = FakeBroker::new();
        broker.set_reachable(false);
        let manager = manager(&broker);
        let listener = RecordingListener::new();
        manager.add_listener(listener.clone());

        assert_eq!(manager.try_establish().await, Ok(false));
        assert_eq!(manager.state(), ConnectionState::Connecting);

        assert_eq!(manager.try_establish().await, Ok(false));
        assert_eq!(manager.state(), ConnectionState::Connecting);
        assert_eq!(manager.get_connection().await.err(), Some(AmqpError::Unavailable));
        assert_eq!(listener.events(), vec!["lost"]);
    }

    #[tokio::test]
    async fn try_establish_while_connected_never_reaches_the_broker() {
        let mut connection = MockBrokerConnection::new();
        connection
            .expect_add_shutdown_listener()
            .times(1)
            .returning(|_| ListenerId(7));
        connection.expect_is_open().return_const(true);
        connection
            .expect_remove_shutdown_listener()
            .with(eq(ListenerId(7)))
            .times(1)
            .return_const(true);
        connection.expect_close().times(1).returning(|| Ok(()));
        let connection: Arc<dyn BrokerConnection> = Arc::new(connection);

        let mut client = MockBrokerClient::new();
        client
            .expect_recovery_policy()
            .returning(|| Arc::new(NoAutoRecovery));
        client
            .expect_open_connection()
            .times(1)
            .return_once(move |_| Ok(connection));

        let manager = ConnectionManager::new(fast_config(), Arc::new(client));

        assert_eq!(manager.try_establish().await, Ok(true));
        assert!(matches!(
            manager.try_establish().await,
            Err(AmqpError::InvalidState(_))
        ));

        manager.close().await.unwrap();
        assert!(matches!(
            manager.try_establish().await,
            Err(AmqpError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn closed_is_terminal() {
        let broker = FakeBroker::new();
        let manager = manager(&broker);

        manager.close().await.unwrap();

        for next in [
            ConnectionState::NeverConnected,
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::Closed,
        ] {
            assert_eq!(manager.change_state(next).await, Err(AmqpError::Closed));
            assert_eq!(manager.state(), ConnectionState::Closed);
        }

        assert_eq!(manager.get_connection().await.err(), Some(AmqpError::Closed));
        assert_eq!(manager.wait_until_connected().await.err(), Some(AmqpError::Closed));
        assert!(matches!(manager.connect(), Err(AmqpError::InvalidState(_))));
        assert_eq!(broker.attempts(), 0);
    }

    #[tokio::test]
    async fn close_twice_notifies_once() {
        let broker = FakeBroker::new();
        let manager = manager(&broker);
        let listener = RecordingListener::new();
        manager.add_listener(listener.clone());

        manager.connect().unwrap();
        manager.wait_until_connected().await.unwrap();

        manager.close().await.unwrap();
        manager.close().await.unwrap();

        assert_eq!(listener.count("closed"), 1);
        assert!(!broker.last_connection().unwrap().is_open());
    }

    #[tokio::test]
    async fn connected_cannot_be_forced() {
        let broker = FakeBroker::new();
        let manager = manager(&broker);

        assert!(matches!(
            manager.change_state(ConnectionState::Connected).await,
            Err(AmqpError::InvalidState(_))
        ));
        assert_eq!(manager.state(), ConnectionState::NeverConnected);
    }

    #[tokio::test]
    async fn failing_listener_does_not_stop_the_others() {
        let broker = FakeBroker::new();
        let manager = manager(&broker);
        let before = RecordingListener::failing();
        let panicking = Arc::new(PanickingListener);
        let after = RecordingListener::new();

        manager.add_listener(before.clone());
        manager.add_listener(panicking);
        manager.add_listener(after.clone());

        assert_eq!(manager.try_establish().await, Ok(true));

        assert_eq!(before.count("established"), 1);
        assert_eq!(after.count("established"), 1);
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert!(manager.get_connection().await.is_ok());

        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn every_move_to_connecting_is_a_loss() {
        let broker = FakeBroker::new();
        let manager = manager(&broker);
        let listener = RecordingListener::new();
        manager.add_listener(listener.clone());

        manager.change_state(ConnectionState::Connecting).await.unwrap();
        assert_eq!(manager.state(), ConnectionState::Connecting);
        assert_eq!(listener.count("lost"), 1);

        assert_eq!(manager.try_establish().await, Ok(true));
        manager.change_state(ConnectionState::Connecting).await.unwrap();
        assert_eq!(listener.events(), vec!["lost", "established", "lost"]);
        assert!(!broker.last_connection().unwrap().is_open());

        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn removed_listener_is_not_notified() {
        let broker = FakeBroker::new();
        let manager = manager(&broker);
        let listener = RecordingListener::new();
        let id = manager.add_listener(listener.clone());

        assert!(manager.remove_listener(id));
        manager.try_establish().await.unwrap();

        assert!(listener.events().is_empty());
        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn watcher_retries_until_broker_is_reachable() {
        let broker = FakeBroker::new();
        broker.set_reachable(false);
        let manager = manager(&broker);
        let listener = RecordingListener::new();
        manager.add_listener(listener.clone());

        manager.connect().unwrap();
        manager.connect().unwrap();

        assert!(eventually(|| broker.attempts() >= 3).await);
        assert_eq!(listener.count("established"), 0);
        assert_eq!(listener.count("lost"), 1);
        assert_eq!(manager.state(), ConnectionState::Connecting);

        broker.set_reachable(true);
        manager.wait_until_connected().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(listener.events(), vec!["lost", "established"]);
        assert_eq!(broker.connections().len(), 1);

        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn lost_connection_is_reestablished() {
        let broker = FakeBroker::new();
        let manager = manager(&broker);
        let listener = RecordingListener::new();
        manager.add_listener(listener.clone());

        manager.connect().unwrap();
        manager.wait_until_connected().await.unwrap();

        broker.set_reachable(false);
        let first = broker.last_connection().unwrap();
        first.kill(ShutdownCause::Io);

        assert!(eventually(|| listener.count("lost") == 2).await);
        assert!(eventually(|| broker.attempts() >= 3).await);
        assert_eq!(listener.count("established"), 1);
        assert_eq!(first.hook_count(), 0);

        broker.set_reachable(true);
        assert!(eventually(|| listener.count("established") == 2).await);
        assert_eq!(listener.count("lost"), 2);
        assert_eq!(broker.connections().len(), 2);

        // A late signal from the superseded handle changes nothing.
        first.kill(ShutdownCause::Io);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(manager.state(), ConnectionState::Connected);

        manager.close().await.unwrap();
        assert_eq!(
            listener.events(),
            vec!["lost", "established", "lost", "established", "closed"]
        );
    }

    #[tokio::test]
    async fn recoverable_shutdown_keeps_connection() {
        let broker = FakeBroker::new();
        let manager = ConnectionManager::with_recovery_policy(
            fast_config(),
            broker.clone(),
            Arc::new(TransientNetworkRecovery),
        );

        manager.try_establish().await.unwrap();
        broker.last_connection().unwrap().signal(ShutdownCause::MissedHeartbeat);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(manager.state(), ConnectionState::Connected);

        broker.last_connection().unwrap().signal(ShutdownCause::BrokerClose);
        assert!(eventually(|| manager.state() == ConnectionState::Connecting).await);

        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn close_stops_the_watcher() {
        let broker = FakeBroker::new();
        broker.set_reachable(false);
        let manager = manager(&broker);

        manager.connect().unwrap();
        assert!(eventually(|| broker.attempts() >= 1).await);
        manager.close().await.unwrap();

        broker.set_reachable(true);
        let attempts = broker.attempts();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(broker.attempts(), attempts);
        assert!(broker.connections().is_empty());
    }
}
