// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Reconnection Watcher
//!
//! One background task per [`ConnectionManager`], started by
//! [`connect`](ConnectionManager::connect). While the manager needs a
//! connection the task keeps calling `try_establish`, sleeping the configured
//! retry interval after every failed attempt. Once connected it parks until a
//! transition wakes it up, and it exits as soon as the manager is closed.

use crate::manager::ConnectionManager;
use tracing::{debug, info};

impl ConnectionManager {
    pub(crate) async fn run_watcher(self) {
        let retry_interval = self.inner.config.retry_interval_duration();
        let cancel = self.inner.cancel.clone();

        info!(
            retry_interval_ms = retry_interval.as_millis() as u64,
            "reconnection watcher started"
        );

        loop {
            if cancel.is_cancelled() {
                break;
            }

            if self.state().needs_connection() {
                match self.try_establish().await {
                    Ok(true) => continue,
                    Ok(false) => {
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(retry_interval) => continue,
                        }
                    }
                    // Someone else moved the state while we were waiting for the lock.
                    Err(err) => debug!(error = err.to_string(), "skipping connection attempt"),
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.inner.wake.notified() => {}
            }
        }

        info!("reconnection watcher stopped");
    }
}
