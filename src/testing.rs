// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory broker and recording observers shared by the unit tests.

use crate::{
    client::{BrokerChannel, BrokerClient, BrokerConnection, ConsumeOptions, InboundMessage, MessageHandler},
    config::ConnectionConfig,
    errors::AmqpError,
    listener::{ConnectionListener, ListenerId, ListenerSet},
    shutdown::{ShutdownCause, ShutdownListener, ShutdownScope, ShutdownSignal},
    topology::Declaration,
};
use async_trait::async_trait;
use opentelemetry::Context;
use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

type Shared<T> = Arc<Mutex<T>>;

/// Short intervals so that retry paths run within a test.
pub(crate) fn fast_config() -> ConnectionConfig {
    ConnectionConfig::new("broker.test")
        .retry_interval(Duration::from_millis(20))
        .consumer_retry_interval(Duration::from_millis(20))
}

/// Polls `condition` until it holds or a few seconds have passed.
pub(crate) async fn eventually(condition: impl Fn() -> bool) -> bool {
    for _ in 0..300 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

pub(crate) struct FakeBroker {
    reachable: AtomicBool,
    attempts: AtomicUsize,
    connections: Mutex<Vec<Arc<FakeConnection>>>,
    failing_queues: Shared<HashSet<String>>,
}

impl FakeBroker {
    pub(crate) fn new() -> Arc<FakeBroker> {
        Arc::new(FakeBroker {
            reachable: AtomicBool::new(true),
            attempts: AtomicUsize::new(0),
            connections: Mutex::new(vec![]),
            failing_queues: Arc::new(Mutex::new(HashSet::new())),
        })
    }

    pub(crate) fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub(crate) fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub(crate) fn connections(&self) -> Vec<Arc<FakeConnection>> {
        self.connections.lock().unwrap().clone()
    }

    pub(crate) fn last_connection(&self) -> Option<Arc<FakeConnection>> {
        self.connections.lock().unwrap().last().cloned()
    }

    /// Makes every subscription on `queue` fail until allowed again.
    pub(crate) fn fail_consume(&self, queue: &str) {
        self.failing_queues.lock().unwrap().insert(queue.to_owned());
    }

    pub(crate) fn allow_consume(&self, queue: &str) {
        self.failing_queues.lock().unwrap().remove(queue);
    }
}

#[async_trait]
impl BrokerClient for FakeBroker {
    async fn open_connection(
        &self,
        _config: &ConnectionConfig,
    ) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        if !self.reachable.load(Ordering::SeqCst) {
            return Err(AmqpError::IoError("connection refused".to_owned()));
        }

        let connection = Arc::new(FakeConnection {
            open: AtomicBool::new(true),
            hooks: ListenerSet::new(),
            channels: Mutex::new(vec![]),
            failing_queues: self.failing_queues.clone(),
        });
        self.connections.lock().unwrap().push(connection.clone());

        Ok(connection)
    }
}

pub(crate) struct FakeConnection {
    open: AtomicBool,
    hooks: ListenerSet<dyn ShutdownListener>,
    channels: Mutex<Vec<Arc<FakeChannel>>>,
    failing_queues: Shared<HashSet<String>>,
}

impl FakeConnection {
    pub(crate) fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    pub(crate) fn hook_count(&self) -> usize {
        self.hooks.len()
    }

    pub(crate) fn channels(&self) -> Vec<Arc<FakeChannel>> {
        self.channels.lock().unwrap().clone()
    }

    /// Latest channel that subscribed to `queue`.
    pub(crate) fn channel_for(&self, queue: &str) -> Option<Arc<FakeChannel>> {
        self.channels()
            .into_iter()
            .rev()
            .find(|channel| channel.consumed().iter().any(|q| q == queue))
    }

    /// Drops the connection and its channels like a broker-side failure.
    pub(crate) fn kill(&self, cause: ShutdownCause) {
        self.open.store(false, Ordering::SeqCst);
        for channel in self.channels() {
            channel.open.store(false, Ordering::SeqCst);
        }
        self.signal(cause);
    }

    /// Reports a shutdown without touching the connection.
    pub(crate) fn signal(&self, cause: ShutdownCause) {
        let signal = ShutdownSignal::new(ShutdownScope::Connection, cause, "connection killed");
        for hook in self.hooks.snapshot() {
            hook.on_shutdown(&signal);
        }
    }
}

#[async_trait]
impl BrokerConnection for FakeConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        if !self.is_open() {
            return Err(AmqpError::ChannelError("connection is closed".to_owned()));
        }

        let channel = Arc::new(FakeChannel {
            open: AtomicBool::new(true),
            hooks: ListenerSet::new(),
            failing_queues: self.failing_queues.clone(),
            declared: Mutex::new(vec![]),
            consumed: Mutex::new(vec![]),
            prefetch: Mutex::new(None),
        });
        self.channels.lock().unwrap().push(channel.clone());

        Ok(channel)
    }

    fn add_shutdown_listener(&self, listener: Arc<dyn ShutdownListener>) -> ListenerId {
        self.hooks.add(listener)
    }

    fn remove_shutdown_listener(&self, id: ListenerId) -> bool {
        self.hooks.remove(id)
    }

    fn is_open(&self) -> bool {
        FakeConnection::is_open(self)
    }

    async fn close(&self) -> Result<(), AmqpError> {
        if !self.open.swap(false, Ordering::SeqCst) {
            return Err(AmqpError::ConnectionError("already closed".to_owned()));
        }
        for channel in self.channels() {
            channel.open.store(false, Ordering::SeqCst);
        }
        Ok(())
    }
}

pub(crate) struct FakeChannel {
    open: AtomicBool,
    hooks: ListenerSet<dyn ShutdownListener>,
    failing_queues: Shared<HashSet<String>>,
    declared: Mutex<Vec<String>>,
    consumed: Mutex<Vec<String>>,
    prefetch: Mutex<Option<u16>>,
}

impl FakeChannel {
    pub(crate) fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    pub(crate) fn declared(&self) -> Vec<String> {
        self.declared.lock().unwrap().clone()
    }

    pub(crate) fn consumed(&self) -> Vec<String> {
        self.consumed.lock().unwrap().clone()
    }

    pub(crate) fn prefetch(&self) -> Option<u16> {
        *self.prefetch.lock().unwrap()
    }

    /// Closes the channel from the broker side, e.g. after a failed operation.
    pub(crate) fn kill(&self) {
        self.open.store(false, Ordering::SeqCst);
        let signal = ShutdownSignal::new(ShutdownScope::Channel, ShutdownCause::BrokerClose, "NOT_FOUND");
        for hook in self.hooks.snapshot() {
            hook.on_shutdown(&signal);
        }
    }
}

#[async_trait]
impl BrokerChannel for FakeChannel {
    async fn declare(&self, declaration: &Declaration) -> Result<(), AmqpError> {
        self.declared.lock().unwrap().push(declaration.describe());
        Ok(())
    }

    async fn set_qos(&self, prefetch: u16) -> Result<(), AmqpError> {
        *self.prefetch.lock().unwrap() = Some(prefetch);
        Ok(())
    }

    async fn consume(
        &self,
        options: ConsumeOptions,
        _handler: Arc<dyn MessageHandler>,
    ) -> Result<String, AmqpError> {
        if self.failing_queues.lock().unwrap().contains(&options.queue) {
            return Err(AmqpError::BindingConsumerError(options.queue));
        }
        self.consumed.lock().unwrap().push(options.queue);
        Ok(options.consumer_tag)
    }

    fn add_shutdown_listener(&self, listener: Arc<dyn ShutdownListener>) -> ListenerId {
        self.hooks.add(listener)
    }

    fn remove_shutdown_listener(&self, id: ListenerId) -> bool {
        self.hooks.remove(id)
    }

    fn is_open(&self) -> bool {
        FakeChannel::is_open(self)
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// Records every notification it receives, optionally failing each one.
pub(crate) struct RecordingListener {
    events: Mutex<Vec<String>>,
    fail: bool,
}

impl RecordingListener {
    pub(crate) fn new() -> Arc<RecordingListener> {
        Arc::new(RecordingListener {
            events: Mutex::new(vec![]),
            fail: false,
        })
    }

    pub(crate) fn failing() -> Arc<RecordingListener> {
        Arc::new(RecordingListener {
            events: Mutex::new(vec![]),
            fail: true,
        })
    }

    pub(crate) fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub(crate) fn count(&self, event: &str) -> usize {
        self.events().iter().filter(|e| *e == event).count()
    }

    fn record(&self, event: &str) -> Result<(), AmqpError> {
        self.events.lock().unwrap().push(event.to_owned());
        if self.fail {
            return Err(AmqpError::ConnectionError(format!("listener failed on {event}")));
        }
        Ok(())
    }
}

#[async_trait]
impl ConnectionListener for RecordingListener {
    async fn on_established(&self, _connection: Arc<dyn BrokerConnection>) -> Result<(), AmqpError> {
        self.record("established")
    }

    async fn on_lost(&self) -> Result<(), AmqpError> {
        self.record("lost")
    }

    async fn on_closed(&self) -> Result<(), AmqpError> {
        self.record("closed")
    }
}

pub(crate) struct PanickingListener;

#[async_trait]
impl ConnectionListener for PanickingListener {
    async fn on_established(&self, _connection: Arc<dyn BrokerConnection>) -> Result<(), AmqpError> {
        panic!("listener bug")
    }
}

#[derive(Default)]
pub(crate) struct RecordingHandler {
    messages: Mutex<Vec<InboundMessage>>,
}

impl RecordingHandler {
    pub(crate) fn new() -> Arc<RecordingHandler> {
        Arc::new(RecordingHandler::default())
    }

    pub(crate) fn messages(&self) -> Vec<InboundMessage> {
        self.messages.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessageHandler for RecordingHandler {
    async fn exec(&self, _ctx: &Context, msg: &InboundMessage) -> Result<(), AmqpError> {
        self.messages.lock().unwrap().push(msg.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn recording_handler_keeps_messages() {
        let handler = RecordingHandler::new();
        let msg = InboundMessage {
            queue: "orders".to_owned(),
            data: b"{}".to_vec(),
            ..InboundMessage::default()
        };

        handler.exec(&Context::new(), &msg).await.unwrap();

        assert_eq!(handler.messages(), vec![msg]);
    }
}
