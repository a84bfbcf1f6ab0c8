// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology
//!
//! A consumer declares the exchanges, queues and bindings it needs before it
//! subscribes. The declarations are plain values ([`Declaration`]), grouped
//! with the [`Topology`] builder and applied on a channel by a
//! [`TopologyDeclarer`].
//!
//! [`AmqpTopologyDeclarer`] applies them in dependency order:
//! 1. exchanges
//! 2. queues, each preceded by its retry queue and DLQ
//! 3. exchange-to-exchange bindings
//! 4. queue-to-exchange bindings

use crate::{
    client::BrokerChannel,
    errors::AmqpError,
    exchange::{ExchangeBinding, ExchangeDefinition},
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use tracing::{debug, error};

/// A broker-side object that must exist before consuming.
#[derive(Debug, Clone, PartialEq)]
pub enum Declaration {
    Exchange(ExchangeDefinition),
    Queue(QueueDefinition),
    Binding(Binding),
}

/// The two binding flavours AMQP supports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Binding {
    Queue(QueueBinding),
    Exchange(ExchangeBinding),
}

impl Declaration {
    /// Short description used in logs.
    pub fn describe(&self) -> String {
        match self {
            Declaration::Exchange(def) => format!("exchange {}", def.name),
            Declaration::Queue(def) => format!("queue {}", def.name),
            Declaration::Binding(Binding::Queue(b)) => format!(
                "binding {} -> {} ({})",
                b.exchange_name, b.queue_name, b.routing_key
            ),
            Declaration::Binding(Binding::Exchange(b)) => format!(
                "binding {} -> {} ({})",
                b.source, b.destination, b.routing_key
            ),
        }
    }
}

impl From<ExchangeDefinition> for Declaration {
    fn from(def: ExchangeDefinition) -> Self {
        Declaration::Exchange(def)
    }
}

impl From<QueueDefinition> for Declaration {
    fn from(def: QueueDefinition) -> Self {
        Declaration::Queue(def)
    }
}

impl From<QueueBinding> for Declaration {
    fn from(binding: QueueBinding) -> Self {
        Declaration::Binding(Binding::Queue(binding))
    }
}

impl From<ExchangeBinding> for Declaration {
    fn from(binding: ExchangeBinding) -> Self {
        Declaration::Binding(Binding::Exchange(binding))
    }
}

/// Collects declarations with chained calls.
///
/// ```ignore
/// let topology = Topology::new()
///     .exchange(ExchangeDefinition::new("events").topic().durable())
///     .queue(QueueDefinition::new("orders").durable().with_dlq())
///     .queue_binding(QueueBinding::new("orders").exchange("events").routing_key("order.*"));
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Topology {
    declarations: Vec<Declaration>,
}

impl Topology {
    pub fn new() -> Topology {
        Topology::default()
    }

    pub fn exchange(mut self, def: ExchangeDefinition) -> Self {
        self.declarations.push(def.into());
        self
    }

    pub fn queue(mut self, def: QueueDefinition) -> Self {
        self.declarations.push(def.into());
        self
    }

    pub fn exchange_binding(mut self, binding: ExchangeBinding) -> Self {
        self.declarations.push(binding.into());
        self
    }

    pub fn queue_binding(mut self, binding: QueueBinding) -> Self {
        self.declarations.push(binding.into());
        self
    }

    pub fn declarations(&self) -> &[Declaration] {
        &self.declarations
    }

    pub fn into_declarations(self) -> Vec<Declaration> {
        self.declarations
    }
}

/// Applies declarations on a channel.
#[async_trait]
pub trait TopologyDeclarer: Send + Sync {
    async fn declare(
        &self,
        channel: &dyn BrokerChannel,
        declarations: &[Declaration],
    ) -> Result<(), AmqpError>;
}

/// Default declarer: orders declarations by dependency and expands the retry
/// and dead letter queues of every queue definition.
#[derive(Debug, Clone, Copy, Default)]
pub struct AmqpTopologyDeclarer;

impl AmqpTopologyDeclarer {
    /// The exact sequence of declarations sent to the broker.
    pub fn plan(declarations: &[Declaration]) -> Vec<Declaration> {
        let mut exchanges = vec![];
        let mut queues = vec![];
        let mut exchange_bindings = vec![];
        let mut queue_bindings = vec![];

        for declaration in declarations {
            match declaration {
                Declaration::Exchange(_) => exchanges.push(declaration.clone()),
                Declaration::Queue(def) => {
                    if let Some(retry) = def.retry_queue() {
                        queues.push(Declaration::Queue(retry));
                    }
                    if let Some(dlq) = def.dead_letter_queue() {
                        queues.push(Declaration::Queue(dlq));
                    }
                    queues.push(declaration.clone());
                }
                Declaration::Binding(Binding::Exchange(_)) => {
                    exchange_bindings.push(declaration.clone())
                }
                Declaration::Binding(Binding::Queue(_)) => queue_bindings.push(declaration.clone()),
            }
        }

        exchanges
            .into_iter()
            .chain(queues)
            .chain(exchange_bindings)
            .chain(queue_bindings)
            .collect()
    }
}

#[async_trait]
impl TopologyDeclarer for AmqpTopologyDeclarer {
    async fn declare(
        &self,
        channel: &dyn BrokerChannel,
        declarations: &[Declaration],
    ) -> Result<(), AmqpError> {
        for declaration in AmqpTopologyDeclarer::plan(declarations) {
            debug!("declaring {}", declaration.describe());

            if let Err(err) = channel.declare(&declaration).await {
                error!(
                    error = err.to_string(),
                    declaration = declaration.describe(),
                    "failure to declare topology"
                );
                return Err(err);
            }
        }

        Ok(())
    }
}
