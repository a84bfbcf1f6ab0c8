// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Resilient RabbitMQ Layer
//!
//! The `AmqpError` enum covers both the contract violations of the connection
//! state machine (`InvalidState`, `Unavailable`, `Closed`) and the broker
//! operation failures surfaced by the lapin adapter. Foreign errors are
//! flattened into strings so the enum stays `PartialEq`.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// An operation was invoked out of sequence for the current connection state
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A connection was requested while the manager is not connected
    #[error("connection unavailable")]
    Unavailable,

    /// The operation was attempted after the connection manager was closed
    #[error("connection manager closed")]
    Closed,

    /// Transport level failure talking to the broker
    #[error("io failure `{0}`")]
    IoError(String),

    /// The broker did not answer within the configured timeout
    #[error("timed out after {0}ms")]
    TimeoutError(u64),

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect `{0}`")]
    ConnectionError(String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel `{0}`")]
    ChannelError(String),

    /// A consumer could not complete its activation sequence
    #[error("failure to activate consumer `{0}`")]
    ActivationFailed(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a queue or exchange to an exchange
    #[error("failure to bind `{1}` to exchange `{0}`")]
    BindingError(String, String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error subscribing a consumer to a queue
    #[error("failure to declare consumer `{0}`")]
    BindingConsumerError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// The message handler rejected a delivery
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// The connection configuration is incomplete or malformed
    #[error("invalid configuration `{0}`")]
    InvalidConfig(String),
}

impl AmqpError {
    /// Whether the failure is a transport hiccup worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AmqpError::IoError(_)
                | AmqpError::TimeoutError(_)
                | AmqpError::ConnectionError(_)
                | AmqpError::ChannelError(_)
        )
    }
}

impl From<lapin::Error> for AmqpError {
    fn from(err: lapin::Error) -> Self {
        match err {
            lapin::Error::IOError(io) => AmqpError::IoError(io.to_string()),
            other => AmqpError::ConnectionError(other.to_string()),
        }
    }
}
