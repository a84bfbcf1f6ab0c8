// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Shutdown Detection
//!
//! Broker clients report the termination of a connection or channel through a
//! [`ShutdownSignal`]. A signal is *unrecoverable* when the application did not
//! ask for it and the [`RecoveryPolicy`] does not expect the broker client to
//! repair it on its own. Only unrecoverable signals make the detectors act:
//!
//! - [`ConnectionShutdownDetector`] moves its manager back to `Connecting`,
//!   which wakes the reconnection watcher and tells listeners the connection
//!   is lost.
//! - [`ChannelShutdownDetector`] deactivates the single consumer bound to the
//!   channel, leaving the connection and every other consumer alone.
//!
//! Shutdown callbacks are synchronous and may fire on a broker client's own
//! thread, so detectors hand the actual work to the tokio runtime they were
//! created on.

use crate::{
    holder::ConsumerHolder,
    manager::{ConnectionManager, ManagerInner},
};
use std::{
    fmt,
    sync::{Arc, Weak},
};
use tokio::runtime::Handle;
use tracing::{debug, warn};

/// Whether the signal concerns a whole connection or a single channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownScope {
    Connection,
    Channel,
}

/// Broad classification of what terminated the connection or channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownCause {
    /// Socket level failure: reset, refused, broken pipe.
    Io,
    /// The broker stopped answering heartbeats.
    MissedHeartbeat,
    /// The broker closed the connection or channel with a protocol reply
    /// (access refused, queue not found, forced close from the management UI).
    BrokerClose,
    Other,
}

/// Describes one termination reported by the broker client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownSignal {
    pub scope: ShutdownScope,
    pub initiated_by_application: bool,
    pub cause: ShutdownCause,
    pub reason: String,
}

impl ShutdownSignal {
    pub fn new(scope: ShutdownScope, cause: ShutdownCause, reason: &str) -> ShutdownSignal {
        ShutdownSignal {
            scope,
            initiated_by_application: false,
            cause,
            reason: reason.to_owned(),
        }
    }

    /// A shutdown the application asked for through `close()`.
    pub fn application(scope: ShutdownScope) -> ShutdownSignal {
        ShutdownSignal {
            scope,
            initiated_by_application: true,
            cause: ShutdownCause::Other,
            reason: "closed by application".to_owned(),
        }
    }

    /// True when the reconnection logic of this crate has to take over.
    pub fn is_unrecoverable(&self, policy: &dyn RecoveryPolicy) -> bool {
        !self.initiated_by_application && !policy.is_recoverable(self)
    }
}

impl fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} shutdown ({:?}): {}", self.scope, self.cause, self.reason)
    }
}

/// Predicts whether the broker client repairs a shutdown by itself.
///
/// This mirrors the auto-recovery trigger of the broker client in use and is
/// pluggable because that predicate is client specific.
pub trait RecoveryPolicy: Send + Sync {
    fn is_recoverable(&self, signal: &ShutdownSignal) -> bool;
}

/// For broker clients without any automatic recovery, lapin included: every
/// shutdown the application did not ask for is handled here.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoAutoRecovery;

impl RecoveryPolicy for NoAutoRecovery {
    fn is_recoverable(&self, _signal: &ShutdownSignal) -> bool {
        false
    }
}

/// For broker clients that transparently reconnect after network blips.
///
/// Socket failures and missed heartbeats on the connection are left to the
/// client; broker-initiated closes and anything on a channel are not.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransientNetworkRecovery;

impl RecoveryPolicy for TransientNetworkRecovery {
    fn is_recoverable(&self, signal: &ShutdownSignal) -> bool {
        signal.scope == ShutdownScope::Connection
            && matches!(
                signal.cause,
                ShutdownCause::Io | ShutdownCause::MissedHeartbeat
            )
    }
}

/// Callback registered on a connection or channel.
pub trait ShutdownListener: Send + Sync {
    fn on_shutdown(&self, signal: &ShutdownSignal);
}

/// Attached to every connection a manager establishes.
///
/// The generation identifies the connection handle it was attached to, so a
/// late signal from a superseded handle cannot tear down its replacement.
pub(crate) struct ConnectionShutdownDetector {
    manager: Weak<ManagerInner>,
    generation: u64,
    policy: Arc<dyn RecoveryPolicy>,
    runtime: Handle,
}

impl ConnectionShutdownDetector {
    pub(crate) fn new(
        manager: Weak<ManagerInner>,
        generation: u64,
        policy: Arc<dyn RecoveryPolicy>,
        runtime: Handle,
    ) -> Self {
        ConnectionShutdownDetector {
            manager,
            generation,
            policy,
            runtime,
        }
    }
}

impl ShutdownListener for ConnectionShutdownDetector {
    fn on_shutdown(&self, signal: &ShutdownSignal) {
        if !signal.is_unrecoverable(self.policy.as_ref()) {
            debug!(signal = %signal, "ignoring recoverable connection shutdown");
            return;
        }

        let Some(inner) = self.manager.upgrade() else {
            return;
        };

        warn!(signal = %signal, "unrecoverable connection shutdown");

        let generation = self.generation;
        let signal = signal.clone();
        self.runtime.spawn(async move {
            ConnectionManager::from_inner(inner)
                .handle_unrecoverable_shutdown(generation, &signal)
                .await;
        });
    }
}

/// Attached to the channel of an active consumer.
pub(crate) struct ChannelShutdownDetector {
    holder: Weak<ConsumerHolder>,
    generation: u64,
    policy: Arc<dyn RecoveryPolicy>,
    runtime: Handle,
}

impl ChannelShutdownDetector {
    pub(crate) fn new(
        holder: Weak<ConsumerHolder>,
        generation: u64,
        policy: Arc<dyn RecoveryPolicy>,
        runtime: Handle,
    ) -> Self {
        ChannelShutdownDetector {
            holder,
            generation,
            policy,
            runtime,
        }
    }
}

impl ShutdownListener for ChannelShutdownDetector {
    fn on_shutdown(&self, signal: &ShutdownSignal) {
        if !signal.is_unrecoverable(self.policy.as_ref()) {
            debug!(signal = %signal, "ignoring recoverable channel shutdown");
            return;
        }

        let Some(holder) = self.holder.upgrade() else {
            return;
        };

        warn!(
            queue = holder.queue(),
            signal = %signal,
            "unrecoverable channel shutdown"
        );

        let generation = self.generation;
        self.runtime.spawn(async move {
            holder.handle_channel_shutdown(generation).await;
        });
    }
}
