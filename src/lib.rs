// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Resilience
//!
//! Keeps RabbitMQ connections and consumers alive across broker restarts,
//! network failures and channel-level errors.
//!
//! - [`ConnectionManager`] owns one logical connection: a validated state
//!   machine, a reconnection watcher and availability listeners.
//! - [`ConsumerSupervisor`] keeps a set of consumers subscribed on whatever
//!   connection is currently live, retrying failed activations.
//! - [`ConnectionRegistry`] shares one manager per connection configuration.
//!
//! The broker is reached through the [`BrokerClient`] boundary; the lapin
//! implementation is [`LapinBrokerClient`].

mod consumer;
mod otel;
mod watcher;

pub mod channel;
pub mod client;
pub mod config;
pub mod connection;
pub mod errors;
pub mod exchange;
pub mod holder;
pub mod listener;
pub mod manager;
pub mod queue;
pub mod registry;
pub mod shutdown;
pub mod state;
pub mod supervisor;
pub mod topology;

#[cfg(test)]
pub(crate) mod testing;

pub use client::{
    BrokerChannel, BrokerClient, BrokerConnection, ConsumeOptions, InboundMessage,
    MessageHandler, RetryRoute,
};
pub use config::ConnectionConfig;
pub use connection::LapinBrokerClient;
pub use consumer::ConsumerRegistration;
pub use errors::AmqpError;
pub use holder::ConsumerHolder;
pub use listener::{ConnectionListener, ListenerId};
pub use manager::ConnectionManager;
pub use registry::ConnectionRegistry;
pub use shutdown::{
    NoAutoRecovery, RecoveryPolicy, ShutdownCause, ShutdownListener, ShutdownScope,
    ShutdownSignal, TransientNetworkRecovery,
};
pub use state::ConnectionState;
pub use supervisor::ConsumerSupervisor;
pub use topology::{AmqpTopologyDeclarer, Declaration, Topology, TopologyDeclarer};
