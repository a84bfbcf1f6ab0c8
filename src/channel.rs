// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! lapin implementation of [`BrokerChannel`]: topology declarations, prefetch
//! and subscriptions. Each subscription runs on its own task that feeds the
//! deliveries to [`consumer::consume`](crate::consumer::consume); those tasks
//! are aborted when the channel is closed. A stream that ends while the
//! channel is still in use, e.g. after the broker cancelled the consumer, is
//! reported to the shutdown listeners like a channel failure.

use crate::{
    client::{BrokerChannel, ConsumeOptions, MessageHandler},
    connection::{shutdown_signal, REPLY_SUCCESS},
    consumer,
    errors::AmqpError,
    listener::{ListenerId, ListenerSet},
    shutdown::{ShutdownCause, ShutdownListener, ShutdownScope, ShutdownSignal},
    topology::{Binding, Declaration},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicConsumeOptions, BasicQosOptions, ExchangeBindOptions, ExchangeDeclareOptions,
        QueueBindOptions, QueueDeclareOptions,
    },
    types::FieldTable,
    Channel,
};
use opentelemetry::global;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, PoisonError,
};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

pub struct LapinChannel {
    channel: Channel,
    hooks: Arc<ListenerSet<dyn ShutdownListener>>,
    closing: Arc<AtomicBool>,
    subscriptions: Mutex<Vec<JoinHandle<()>>>,
}

impl LapinChannel {
    pub fn new(channel: Channel) -> LapinChannel {
        let hooks: Arc<ListenerSet<dyn ShutdownListener>> = Arc::new(ListenerSet::new());
        let closing = Arc::new(AtomicBool::new(false));

        let (on_error_hooks, on_error_closing) = (hooks.clone(), closing.clone());
        channel.on_error(move |err| {
            let signal = shutdown_signal(
                ShutdownScope::Channel,
                &err,
                on_error_closing.load(Ordering::Acquire),
            );
            warn!(signal = %signal, "amqp channel error");
            notify_shutdown(&on_error_hooks, &signal);
        });

        LapinChannel {
            channel,
            hooks,
            closing,
            subscriptions: Mutex::new(vec![]),
        }
    }

    fn abort_subscriptions(&self) {
        let subscriptions = std::mem::take(
            &mut *self
                .subscriptions
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for subscription in subscriptions {
            subscription.abort();
        }
    }
}

impl Drop for LapinChannel {
    fn drop(&mut self) {
        self.abort_subscriptions();
    }
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    async fn declare(&self, declaration: &Declaration) -> Result<(), AmqpError> {
        match declaration {
            Declaration::Exchange(def) => {
                debug!("creating exchange: {}", def.name);
                self.channel
                    .exchange_declare(
                        &def.name,
                        (&def.kind).into(),
                        ExchangeDeclareOptions {
                            passive: def.passive,
                            durable: def.durable,
                            auto_delete: def.delete,
                            internal: def.internal,
                            nowait: def.no_wait,
                        },
                        FieldTable::from(def.params.clone()),
                    )
                    .await
                    .map_err(|err| {
                        error!(error = err.to_string(), "error to declare the exchange");
                        AmqpError::DeclareExchangeError(def.name.clone())
                    })
            }
            Declaration::Queue(def) => {
                debug!("creating queue: {}", def.name);
                self.channel
                    .queue_declare(
                        &def.name,
                        QueueDeclareOptions {
                            passive: def.passive,
                            durable: def.durable,
                            exclusive: def.exclusive,
                            auto_delete: def.delete,
                            nowait: def.no_wait,
                        },
                        FieldTable::from(def.arguments()),
                    )
                    .await
                    .map(|_| ())
                    .map_err(|err| {
                        error!(error = err.to_string(), "error to declare the queue");
                        AmqpError::DeclareQueueError(def.name.clone())
                    })
            }
            Declaration::Binding(Binding::Queue(binding)) => {
                debug!(
                    "binding queue: {} - exchange: {}",
                    binding.queue_name, binding.exchange_name
                );
                self.channel
                    .queue_bind(
                        &binding.queue_name,
                        &binding.exchange_name,
                        &binding.routing_key,
                        QueueBindOptions { nowait: false },
                        FieldTable::default(),
                    )
                    .await
                    .map_err(|err| {
                        error!(error = err.to_string(), "error to bind the queue");
                        AmqpError::BindingError(
                            binding.exchange_name.clone(),
                            binding.queue_name.clone(),
                        )
                    })
            }
            Declaration::Binding(Binding::Exchange(binding)) => {
                debug!(
                    "binding exchange: {} - source: {}",
                    binding.destination, binding.source
                );
                self.channel
                    .exchange_bind(
                        &binding.destination,
                        &binding.source,
                        &binding.routing_key,
                        ExchangeBindOptions { nowait: false },
                        FieldTable::default(),
                    )
                    .await
                    .map_err(|err| {
                        error!(error = err.to_string(), "error to bind the exchange");
                        AmqpError::BindingError(
                            binding.source.clone(),
                            binding.destination.clone(),
                        )
                    })
            }
        }
    }

    async fn set_qos(&self, prefetch: u16) -> Result<(), AmqpError> {
        self.channel
            .basic_qos(prefetch, BasicQosOptions { global: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to configure qos");
                AmqpError::QoSDeclarationError(err.to_string())
            })
    }

    async fn consume(
        &self,
        options: ConsumeOptions,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<String, AmqpError> {
        let mut deliveries = self
            .channel
            .basic_consume(
                &options.queue,
                &options.consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: options.auto_ack,
                    exclusive: options.exclusive,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to bind consumer");
                AmqpError::BindingConsumerError(options.queue.clone())
            })?;

        let tag = options.consumer_tag.clone();
        let channel = self.channel.clone();
        let (hooks, closing) = (self.hooks.clone(), self.closing.clone());

        let subscription = tokio::spawn(async move {
            let tracer = global::tracer("amqp consumer");

            while let Some(result) = deliveries.next().await {
                match result {
                    Ok(delivery) => {
                        if let Err(err) =
                            consumer::consume(&tracer, &delivery, &options, &handler, &channel)
                                .await
                        {
                            error!(
                                error = err.to_string(),
                                queue = options.queue.as_str(),
                                "error consuming message"
                            );
                        }
                    }
                    Err(err) => {
                        error!(error = err.to_string(), queue = options.queue.as_str(), "errors consume msg")
                    }
                }
            }

            subscription_ended(&hooks, &closing, &options.queue);
        });

        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(subscription);

        Ok(tag)
    }

    fn add_shutdown_listener(&self, listener: Arc<dyn ShutdownListener>) -> ListenerId {
        self.hooks.add(listener)
    }

    fn remove_shutdown_listener(&self, id: ListenerId) -> bool {
        self.hooks.remove(id)
    }

    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.closing.store(true, Ordering::Release);
        self.abort_subscriptions();

        self.channel
            .close(REPLY_SUCCESS, "consumer deactivated")
            .await
            .map_err(|err| AmqpError::ChannelError(err.to_string()))
    }
}

fn notify_shutdown(hooks: &ListenerSet<dyn ShutdownListener>, signal: &ShutdownSignal) {
    for hook in hooks.snapshot() {
        hook.on_shutdown(signal);
    }
}

/// Called once the delivery stream of `queue` is exhausted.
fn subscription_ended(hooks: &ListenerSet<dyn ShutdownListener>, closing: &AtomicBool, queue: &str) {
    if closing.load(Ordering::Acquire) {
        debug!(queue, "consumer stream ended");
        return;
    }

    warn!(queue, "consumer stream ended unexpectedly");
    let signal = ShutdownSignal::new(
        ShutdownScope::Channel,
        ShutdownCause::BrokerClose,
        &format!("consumer of {queue} cancelled by the broker"),
    );
    notify_shutdown(hooks, &signal);
}
