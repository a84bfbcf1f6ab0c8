// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Listeners
//!
//! Observers of a [`ConnectionManager`](crate::manager::ConnectionManager)'s
//! availability, and the snapshot-safe registry used to hold them. The same
//! registry backs the shutdown hooks of connections and channels.

use crate::{client::BrokerConnection, errors::AmqpError};
use async_trait::async_trait;
use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, PoisonError, RwLock,
    },
};

/// Receives availability notifications from a connection manager.
///
/// Callbacks run on whichever task drove the transition (the reconnection
/// watcher, a shutdown detector, or the caller of `close()`), so they must not
/// block indefinitely. A returned error or a panic is logged and does not stop
/// the other listeners from being notified.
#[async_trait]
pub trait ConnectionListener: Send + Sync {
    /// A connection was established and is ready to hand out channels.
    async fn on_established(&self, connection: Arc<dyn BrokerConnection>)
        -> Result<(), AmqpError>;

    /// The connection was lost; the manager is reconnecting.
    async fn on_lost(&self) -> Result<(), AmqpError> {
        Ok(())
    }

    /// The manager was closed for good.
    async fn on_closed(&self) -> Result<(), AmqpError> {
        Ok(())
    }
}

/// Handle returned on registration, used to remove the entry again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(pub(crate) u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

/// Registry of listeners that can be mutated while a notification is running.
///
/// Dispatch works on a [`snapshot`](ListenerSet::snapshot) taken under a
/// short read lock, so callbacks never run with the lock held.
pub struct ListenerSet<L: ?Sized> {
    next_id: AtomicU64,
    entries: RwLock<Vec<(ListenerId, Arc<L>)>>,
}

impl<L: ?Sized> Default for ListenerSet<L> {
    fn default() -> Self {
        ListenerSet {
            next_id: AtomicU64::new(1),
            entries: RwLock::new(vec![]),
        }
    }
}

impl<L: ?Sized> ListenerSet<L> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, listener: Arc<L>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, listener));
        id
    }

    /// Returns `false` when the id was not (or no longer) registered.
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|(entry_id, _)| *entry_id != id);
        entries.len() != before
    }

    pub fn snapshot(&self) -> Vec<Arc<L>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
