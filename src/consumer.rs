// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumers
//!
//! A [`ConsumerRegistration`] describes one queue subscription: the queue, how
//! deliveries are acknowledged, the prefetch window, the topology it needs and
//! the handler receiving the messages.
//!
//! The lapin adapter feeds each delivery through [`consume`], which runs the
//! handler inside an OpenTelemetry span and settles the delivery:
//! 1. handler succeeded: ack
//! 2. handler failed, no retry queue: nack without requeue
//! 3. handler failed, retries left: nack, the broker moves it to the retry queue
//! 4. handler failed, retries exhausted: publish to the DLQ, then ack

use crate::{
    client::{ConsumeOptions, InboundMessage, MessageHandler, RetryRoute},
    errors::AmqpError,
    otel,
    topology::{Declaration, Topology},
};
use lapin::{
    message::Delivery,
    options::{BasicAckOptions, BasicNackOptions, BasicPublishOptions},
    protocol::basic::AMQPProperties,
    Channel,
};
use opentelemetry::{
    global::{BoxedSpan, BoxedTracer},
    trace::{Span, Status},
};
use std::{borrow::Cow, error::Error, fmt, sync::Arc};
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Constant for the x-death header used in RabbitMQ's dead-lettering mechanism
pub const AMQP_HEADERS_X_DEATH: &str = "x-death";
/// Constant for the count field in the x-death header
pub const AMQP_HEADERS_COUNT: &str = "count";

/// Prefetch applied when a registration does not set one.
pub const DEFAULT_PREFETCH: u16 = 10;

/// One queue subscription managed by a
/// [`ConsumerSupervisor`](crate::supervisor::ConsumerSupervisor).
#[derive(Clone)]
pub struct ConsumerRegistration {
    pub(crate) queue: String,
    pub(crate) auto_ack: bool,
    pub(crate) exclusive: bool,
    pub(crate) prefetch: u16,
    pub(crate) consumer_tag: Option<String>,
    pub(crate) declarations: Vec<Declaration>,
    pub(crate) handler: Arc<dyn MessageHandler>,
}

impl fmt::Debug for ConsumerRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerRegistration")
            .field("queue", &self.queue)
            .field("auto_ack", &self.auto_ack)
            .field("exclusive", &self.exclusive)
            .field("prefetch", &self.prefetch)
            .field("consumer_tag", &self.consumer_tag)
            .field("declarations", &self.declarations.len())
            .finish()
    }
}

impl ConsumerRegistration {
    /// Manual acknowledgement, default prefetch, no topology.
    pub fn new(queue: &str, handler: Arc<dyn MessageHandler>) -> ConsumerRegistration {
        ConsumerRegistration {
            queue: queue.to_owned(),
            auto_ack: false,
            exclusive: false,
            prefetch: DEFAULT_PREFETCH,
            consumer_tag: None,
            declarations: vec![],
            handler,
        }
    }

    /// Lets the broker consider messages settled as soon as they are sent.
    pub fn auto_ack(mut self) -> Self {
        self.auto_ack = true;
        self
    }

    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    pub fn prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch;
        self
    }

    /// Fixed consumer tag. A unique `<queue>-<uuid>` tag is generated otherwise.
    pub fn consumer_tag(mut self, tag: &str) -> Self {
        self.consumer_tag = Some(tag.to_owned());
        self
    }

    pub fn declare(mut self, declaration: impl Into<Declaration>) -> Self {
        self.declarations.push(declaration.into());
        self
    }

    pub fn topology(mut self, topology: Topology) -> Self {
        self.declarations.extend(topology.into_declarations());
        self
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn is_auto_ack(&self) -> bool {
        self.auto_ack
    }

    pub fn prefetch_count(&self) -> u16 {
        self.prefetch
    }

    pub fn declarations(&self) -> &[Declaration] {
        &self.declarations
    }

    pub fn handler(&self) -> Arc<dyn MessageHandler> {
        self.handler.clone()
    }

    /// Options for one activation; every activation gets a fresh tag unless
    /// a fixed one was configured.
    pub(crate) fn consume_options(&self) -> ConsumeOptions {
        ConsumeOptions {
            queue: self.queue.clone(),
            consumer_tag: self
                .consumer_tag
                .clone()
                .unwrap_or_else(|| format!("{}-{}", self.queue, Uuid::new_v4())),
            auto_ack: self.auto_ack,
            exclusive: self.exclusive,
            retry: self.retry_route(),
        }
    }

    /// The retry budget of the consumed queue, when its definition is part of
    /// this registration.
    fn retry_route(&self) -> Option<RetryRoute> {
        self.declarations.iter().find_map(|declaration| match declaration {
            Declaration::Queue(def) if def.name() == self.queue => {
                def.retries().map(|max_retries| RetryRoute {
                    max_retries,
                    dlq: def.dlq_name().map(str::to_owned),
                })
            }
            _ => None,
        })
    }
}

/// Runs the handler for one delivery and settles it.
pub(crate) async fn consume(
    tracer: &BoxedTracer,
    delivery: &Delivery,
    options: &ConsumeOptions,
    handler: &Arc<dyn MessageHandler>,
    channel: &Channel,
) -> Result<(), AmqpError> {
    let (msg_type, count) = extract_header_properties(&delivery.properties);

    let (ctx, mut span) = otel::new_span(&delivery.properties, tracer, &msg_type);

    debug!(
        "received: {} - queue: {} - exchange: {}",
        msg_type,
        options.queue,
        delivery.exchange.to_string(),
    );

    let msg = InboundMessage {
        queue: options.queue.clone(),
        kind: msg_type,
        exchange: delivery.exchange.to_string(),
        routing_key: delivery.routing_key.to_string(),
        delivery_tag: delivery.delivery_tag,
        redelivered: delivery.redelivered,
        attempts: count,
        data: delivery.data.clone(),
    };

    let result = handler.exec(&ctx, &msg).await;

    if options.auto_ack {
        return match result {
            Ok(()) => {
                span.set_status(Status::Ok);
                Ok(())
            }
            Err(err) => {
                warn!(error = err.to_string(), "handler failed on auto-ack delivery");
                fail(&mut span, &err, "handler failure");
                Err(err)
            }
        };
    }

    match &result {
        Ok(()) => {
            debug!("message successfully processed");
            if let Err(e) = delivery.ack(BasicAckOptions { multiple: false }).await {
                error!(error = e.to_string(), "error whiling ack msg");
                fail(&mut span, &e, "error to ack msg");
                return Err(AmqpError::AckMessageError);
            }
            span.set_status(Status::Ok);
            return Ok(());
        }
        Err(err) => span.record_error(err),
    }

    let Some(route) = &options.retry else {
        return nack(delivery, &mut span).await;
    };

    if count < i64::from(route.max_retries) {
        warn!("error whiling handling msg, requeuing for latter");
        return nack(delivery, &mut span).await;
    }

    let Some(dlq) = &route.dlq else {
        error!("too many attempts and no dlq configured, dropping message");
        fail(&mut span, &AmqpError::ConsumerError(msg.kind.clone()), "msg dropped");
        return delivery
            .ack(BasicAckOptions { multiple: false })
            .await
            .map(|_| ())
            .map_err(|_| AmqpError::AckMessageError);
    };

    error!("too many attempts, sending to dlq");

    if let Err(e) = channel
        .basic_publish(
            "",
            dlq,
            BasicPublishOptions::default(),
            &delivery.data,
            delivery.properties.clone(),
        )
        .await
    {
        error!(error = e.to_string(), "error whiling sending to dlq");
        fail(&mut span, &e, "error sending msg to dlq");
        return Err(AmqpError::ConsumerError(format!("dlq publish: {e}")));
    }

    match delivery.ack(BasicAckOptions { multiple: false }).await {
        Err(e) => {
            error!(error = e.to_string(), "error whiling ack msg to default queue");
            fail(&mut span, &e, "msg was sent to dlq");
            Err(AmqpError::AckMessageError)
        }
        _ => Ok(()),
    }
}

async fn nack(delivery: &Delivery, span: &mut BoxedSpan) -> Result<(), AmqpError> {
    match delivery
        .nack(BasicNackOptions {
            multiple: false,
            requeue: false,
        })
        .await
    {
        Ok(_) => Ok(()),
        Err(e) => {
            error!(error = e.to_string(), "error whiling nack msg");
            fail(span, &e, "error to nack msg");
            Err(AmqpError::NackMessageError)
        }
    }
}

fn fail(span: &mut BoxedSpan, err: &dyn Error, description: &'static str) {
    span.record_error(err);
    span.set_status(Status::Error {
        description: Cow::from(description),
    });
}

/// Extracts the message type and the dead-letter count from the properties.
fn extract_header_properties(props: &AMQPProperties) -> (String, i64) {
    let headers = props.headers().clone().unwrap_or_default();

    let count = headers
        .inner()
        .get(AMQP_HEADERS_X_DEATH)
        .and_then(|value| value.as_array())
        .and_then(|arr| arr.as_slice().first())
        .and_then(|value| value.as_field_table())
        .and_then(|table| table.inner().get(AMQP_HEADERS_COUNT))
        .and_then(|value| value.as_long_long_int())
        .unwrap_or_default();

    let msg_type = match props.kind() {
        Some(value) => value.to_string(),
        _ => "".to_owned(),
    };

    (msg_type, count)
}
