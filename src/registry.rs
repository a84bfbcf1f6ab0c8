// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Registry
//!
//! One [`ConnectionManager`] per distinct [`ConnectionConfig`], shared by every
//! component that asks for the same broker.

use crate::{client::BrokerClient, config::ConnectionConfig, manager::ConnectionManager};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};
use tracing::{debug, error, info};

pub struct ConnectionRegistry {
    client: Arc<dyn BrokerClient>,
    managers: Mutex<HashMap<ConnectionConfig, ConnectionManager>>,
}

impl ConnectionRegistry {
    pub fn new(client: Arc<dyn BrokerClient>) -> ConnectionRegistry {
        ConnectionRegistry {
            client,
            managers: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the manager for `config`, creating it on first use.
    ///
    /// A manager that was closed in the meantime is replaced by a fresh one.
    /// New managers are not connected yet.
    pub fn get_or_create(&self, config: &ConnectionConfig) -> ConnectionManager {
        let mut managers = self.managers.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(manager) = managers.get(config) {
            if !manager.state().is_closed() {
                return manager.clone();
            }
            debug!("replacing closed connection manager");
        }

        let manager = ConnectionManager::new(config.clone(), self.client.clone());
        managers.insert(config.clone(), manager.clone());
        manager
    }

    pub fn get(&self, config: &ConnectionConfig) -> Option<ConnectionManager> {
        self.managers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(config)
            .cloned()
    }

    /// Forgets the manager of `config` without closing it.
    pub fn remove(&self, config: &ConnectionConfig) -> Option<ConnectionManager> {
        self.managers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(config)
    }

    pub fn len(&self) -> usize {
        self.managers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Closes and forgets every manager.
    pub async fn shutdown_all(&self) {
        let managers: Vec<ConnectionManager> = self
            .managers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, manager)| manager)
            .collect();

        info!(count = managers.len(), "closing all connection managers");

        for manager in managers {
            if let Err(err) = manager.close().await {
                error!(error = err.to_string(), "failure to close connection manager");
            }
        }
    }
}
