// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connection Management
//!
//! lapin implementation of [`BrokerClient`] and [`BrokerConnection`].
//!
//! lapin has no automatic recovery: a failed connection stays failed and its
//! error callback fires once. [`LapinConnection`] turns that callback into a
//! [`ShutdownSignal`] for every registered shutdown listener.

use crate::{
    channel::LapinChannel,
    client::{BrokerChannel, BrokerClient, BrokerConnection},
    config::ConnectionConfig,
    errors::AmqpError,
    listener::{ListenerId, ListenerSet},
    shutdown::{ShutdownCause, ShutdownListener, ShutdownScope, ShutdownSignal},
};
use async_trait::async_trait;
use lapin::{types::LongString, Connection, ConnectionProperties};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tracing::{debug, error};

/// Reply code of a normal AMQP close.
pub(crate) const REPLY_SUCCESS: u16 = 200;

/// Opens lapin connections, trying every configured host in order.
#[derive(Debug, Clone, Copy, Default)]
pub struct LapinBrokerClient;

impl LapinBrokerClient {
    pub fn new() -> LapinBrokerClient {
        LapinBrokerClient
    }
}

#[async_trait]
impl BrokerClient for LapinBrokerClient {
    async fn open_connection(
        &self,
        config: &ConnectionConfig,
    ) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        config.validate()?;

        let mut last_err = AmqpError::ConnectionError("no host configured".to_owned());

        for host in &config.hosts {
            debug!(host = host.as_str(), "creating amqp connection...");

            let options = ConnectionProperties::default()
                .with_connection_name(LongString::from(config.connection_name.clone()));

            let uri = config.uri(host);
            let connect = Connection::connect(&uri, options);

            match tokio::time::timeout(config.connect_timeout_duration(), connect).await {
                Ok(Ok(conn)) => {
                    debug!(host = host.as_str(), "amqp connected");
                    return Ok(Arc::new(LapinConnection::new(conn)));
                }
                Ok(Err(err)) => {
                    error!(host = host.as_str(), error = err.to_string(), "failure to connect");
                    last_err = AmqpError::from(err);
                }
                Err(_) => {
                    error!(host = host.as_str(), "timeout while connecting");
                    last_err = AmqpError::TimeoutError(config.connect_timeout_ms);
                }
            }
        }

        Err(last_err)
    }
}

pub struct LapinConnection {
    conn: Connection,
    hooks: Arc<ListenerSet<dyn ShutdownListener>>,
    closing: Arc<AtomicBool>,
}

impl LapinConnection {
    pub fn new(conn: Connection) -> LapinConnection {
        let hooks: Arc<ListenerSet<dyn ShutdownListener>> = Arc::new(ListenerSet::new());
        let closing = Arc::new(AtomicBool::new(false));

        let (on_error_hooks, on_error_closing) = (hooks.clone(), closing.clone());
        conn.on_error(move |err| {
            let signal = shutdown_signal(
                ShutdownScope::Connection,
                &err,
                on_error_closing.load(Ordering::Acquire),
            );
            error!(signal = %signal, "amqp connection error");
            for hook in on_error_hooks.snapshot() {
                hook.on_shutdown(&signal);
            }
        });

        LapinConnection {
            conn,
            hooks,
            closing,
        }
    }
}

#[async_trait]
impl BrokerConnection for LapinConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        debug!("creating amqp channel...");
        match self.conn.create_channel().await {
            Ok(channel) => {
                debug!(channel = channel.id(), "channel created");
                Ok(Arc::new(LapinChannel::new(channel)))
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError(err.to_string()))
            }
        }
    }

    fn add_shutdown_listener(&self, listener: Arc<dyn ShutdownListener>) -> ListenerId {
        self.hooks.add(listener)
    }

    fn remove_shutdown_listener(&self, id: ListenerId) -> bool {
        self.hooks.remove(id)
    }

    fn is_open(&self) -> bool {
        self.conn.status().connected()
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.closing.store(true, Ordering::Release);
        self.conn
            .close(REPLY_SUCCESS, "closed by application")
            .await
            .map_err(|err| AmqpError::ConnectionError(err.to_string()))
    }
}

/// Classifies a lapin error reported through an `on_error` callback.
pub(crate) fn shutdown_signal(
    scope: ShutdownScope,
    err: &lapin::Error,
    initiated_by_application: bool,
) -> ShutdownSignal {
    let cause = match err {
        lapin::Error::IOError(_) => ShutdownCause::Io,
        lapin::Error::MissingHeartbeatError => ShutdownCause::MissedHeartbeat,
        lapin::Error::ProtocolError(_) => ShutdownCause::BrokerClose,
        _ => ShutdownCause::Other,
    };

    ShutdownSignal {
        scope,
        initiated_by_application,
        cause,
        reason: err.to_string(),
    }
}
