// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Client Boundary
//!
//! The resilience layer never speaks AMQP itself. It drives a broker through
//! these traits: a [`BrokerClient`] opens [`BrokerConnection`]s, connections
//! hand out [`BrokerChannel`]s, and both report terminations to registered
//! [`ShutdownListener`]s. The production implementation lives in
//! [`connection`](crate::connection) and [`channel`](crate::channel) on top
//! of lapin.

use crate::{
    config::ConnectionConfig,
    errors::AmqpError,
    listener::ListenerId,
    shutdown::{NoAutoRecovery, RecoveryPolicy, ShutdownListener},
    topology::Declaration,
};
use async_trait::async_trait;
use opentelemetry::Context;
use std::sync::Arc;

/// Opens connections to a broker.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Opens a new connection described by `config`.
    async fn open_connection(
        &self,
        config: &ConnectionConfig,
    ) -> Result<Arc<dyn BrokerConnection>, AmqpError>;

    /// The client's own notion of which shutdowns it repairs by itself.
    ///
    /// Clients without built-in recovery leave every shutdown to the
    /// reconnection watcher.
    fn recovery_policy(&self) -> Arc<dyn RecoveryPolicy> {
        Arc::new(NoAutoRecovery)
    }
}

/// A live connection to the broker.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError>;

    fn add_shutdown_listener(&self, listener: Arc<dyn ShutdownListener>) -> ListenerId;

    fn remove_shutdown_listener(&self, id: ListenerId) -> bool;

    fn is_open(&self) -> bool;

    /// Closes the connection on behalf of the application.
    async fn close(&self) -> Result<(), AmqpError>;
}

/// A channel multiplexed over a [`BrokerConnection`].
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Applies one topology declaration.
    async fn declare(&self, declaration: &Declaration) -> Result<(), AmqpError>;

    /// Sets the per-consumer prefetch count.
    async fn set_qos(&self, prefetch: u16) -> Result<(), AmqpError>;

    /// Starts a subscription and returns the broker-side consumer tag.
    async fn consume(
        &self,
        options: ConsumeOptions,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<String, AmqpError>;

    fn add_shutdown_listener(&self, listener: Arc<dyn ShutdownListener>) -> ListenerId;

    fn remove_shutdown_listener(&self, id: ListenerId) -> bool;

    fn is_open(&self) -> bool;

    async fn close(&self) -> Result<(), AmqpError>;
}

/// Parameters of a `consume` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumeOptions {
    pub queue: String,
    pub consumer_tag: String,
    pub auto_ack: bool,
    pub exclusive: bool,
    pub retry: Option<RetryRoute>,
}

/// Where failed deliveries go once the retry queue has been used up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryRoute {
    pub max_retries: i32,
    pub dlq: Option<String>,
}

/// Handles the messages delivered to one consumer.
///
/// With manual acknowledgement an `Ok` acks the delivery and an `Err` nacks it
/// without requeue, which hands it to the queue's dead-letter routing.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn exec(&self, ctx: &Context, msg: &InboundMessage) -> Result<(), AmqpError>;
}

/// A delivery as seen by a [`MessageHandler`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InboundMessage {
    pub queue: String,
    /// Value of the AMQP `type` property, empty when absent.
    pub kind: String,
    pub exchange: String,
    pub routing_key: String,
    pub delivery_tag: u64,
    pub redelivered: bool,
    /// Number of times the broker dead-lettered this message (`x-death` count).
    pub attempts: i64,
    pub data: Vec<u8>,
}
