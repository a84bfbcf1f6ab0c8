// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Holder
//!
//! Binds one [`ConsumerRegistration`] to at most one live channel. Activation
//! opens a channel on the current connection, hooks a channel shutdown
//! detector, declares the topology, applies the prefetch and subscribes.
//! Any failure tears the partial state down again, so a holder is either
//! fully active or holds nothing.

use crate::{
    client::{BrokerChannel, BrokerConnection},
    consumer::ConsumerRegistration,
    errors::AmqpError,
    listener::ListenerId,
    shutdown::{ChannelShutdownDetector, RecoveryPolicy},
    topology::TopologyDeclarer,
};
use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tokio::{
    runtime::Handle,
    sync::{Mutex, Notify},
};
use tracing::{debug, error, info};

#[derive(Default)]
struct ChannelBinding {
    connection: Option<Arc<dyn BrokerConnection>>,
    channel: Option<Arc<dyn BrokerChannel>>,
    shutdown_hook: Option<ListenerId>,
    consumer_tag: Option<String>,
    /// Identifies the channel the current shutdown detector was attached to.
    generation: u64,
}

impl ChannelBinding {
    fn is_bound_to(&self, connection: &Arc<dyn BrokerConnection>) -> bool {
        self.connection.as_ref().is_some_and(|bound| {
            std::ptr::addr_eq(Arc::as_ptr(bound), Arc::as_ptr(connection))
        })
    }
}

pub struct ConsumerHolder {
    registration: ConsumerRegistration,
    declarer: Arc<dyn TopologyDeclarer>,
    policy: Arc<dyn RecoveryPolicy>,
    retry_wake: Arc<Notify>,
    active: AtomicBool,
    binding: Mutex<ChannelBinding>,
}

impl fmt::Debug for ConsumerHolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerHolder")
            .field("queue", &self.registration.queue)
            .field("active", &self.is_active())
            .finish()
    }
}

impl ConsumerHolder {
    pub(crate) fn new(
        registration: ConsumerRegistration,
        declarer: Arc<dyn TopologyDeclarer>,
        policy: Arc<dyn RecoveryPolicy>,
        retry_wake: Arc<Notify>,
    ) -> Arc<ConsumerHolder> {
        Arc::new(ConsumerHolder {
            registration,
            declarer,
            policy,
            retry_wake,
            active: AtomicBool::new(false),
            binding: Mutex::new(ChannelBinding::default()),
        })
    }

    pub fn queue(&self) -> &str {
        &self.registration.queue
    }

    pub fn registration(&self) -> &ConsumerRegistration {
        &self.registration
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Broker-side tag of the current subscription.
    pub async fn consumer_tag(&self) -> Option<String> {
        self.binding.lock().await.consumer_tag.clone()
    }

    pub async fn has_channel(&self) -> bool {
        self.binding.lock().await.channel.is_some()
    }

    /// Subscribes on a fresh channel of `connection`.
    ///
    /// No-op when already active on that same connection; a consumer still
    /// bound to a previous connection is moved over.
    pub async fn activate(
        self: &Arc<Self>,
        connection: &Arc<dyn BrokerConnection>,
    ) -> Result<(), AmqpError> {
        let mut binding = self.binding.lock().await;

        if self.is_active() {
            if binding.is_bound_to(connection) {
                debug!(queue = self.queue(), "consumer already active");
                return Ok(());
            }
            debug!(queue = self.queue(), "moving consumer to the new connection");
            self.active.store(false, Ordering::Release);
        }

        // Leftovers of a half-finished activation.
        self.teardown(&mut binding).await;

        match self.bind(&mut binding, connection).await {
            Ok(()) => {
                self.active.store(true, Ordering::Release);
                info!(
                    queue = self.queue(),
                    consumer_tag = binding.consumer_tag.as_deref().unwrap_or_default(),
                    "consumer activated"
                );
                Ok(())
            }
            Err(err) => {
                error!(
                    queue = self.queue(),
                    error = err.to_string(),
                    "failure to activate consumer"
                );
                self.teardown(&mut binding).await;
                Err(AmqpError::ActivationFailed(format!(
                    "{}: {}",
                    self.queue(),
                    err
                )))
            }
        }
    }

    /// Drops the subscription and closes its channel. Idempotent.
    pub async fn deactivate(&self) {
        self.deactivate_unless_bound_to(None).await;
    }

    /// Deactivates unless the consumer already runs on `current`.
    pub(crate) async fn deactivate_unless_bound_to(
        &self,
        current: Option<&Arc<dyn BrokerConnection>>,
    ) {
        let mut binding = self.binding.lock().await;

        if current.is_some_and(|connection| binding.is_bound_to(connection)) {
            return;
        }

        let was_active = self.active.swap(false, Ordering::AcqRel);

        self.teardown(&mut binding).await;

        if was_active {
            info!(queue = self.queue(), "consumer deactivated");
        }
    }

    /// Reaction of the channel shutdown detector to an unrecoverable signal.
    pub(crate) async fn handle_channel_shutdown(&self, generation: u64) {
        {
            let mut binding = self.binding.lock().await;

            if binding.generation != generation || binding.channel.is_none() {
                debug!(queue = self.queue(), "ignoring shutdown of a superseded channel");
                return;
            }

            self.active.store(false, Ordering::Release);
            self.teardown(&mut binding).await;
        }

        info!(queue = self.queue(), "consumer deactivated after channel shutdown");
        self.retry_wake.notify_one();
    }

    async fn bind(
        self: &Arc<Self>,
        binding: &mut ChannelBinding,
        connection: &Arc<dyn BrokerConnection>,
    ) -> Result<(), AmqpError> {
        let channel = connection.create_channel().await?;

        binding.generation += 1;
        let detector = ChannelShutdownDetector::new(
            Arc::downgrade(self),
            binding.generation,
            self.policy.clone(),
            Handle::current(),
        );
        binding.shutdown_hook = Some(channel.add_shutdown_listener(Arc::new(detector)));
        binding.channel = Some(channel.clone());
        binding.connection = Some(connection.clone());

        self.declarer
            .declare(channel.as_ref(), self.registration.declarations())
            .await?;

        channel.set_qos(self.registration.prefetch_count()).await?;

        let tag = channel
            .consume(
                self.registration.consume_options(),
                self.registration.handler(),
            )
            .await?;
        binding.consumer_tag = Some(tag);

        Ok(())
    }

    async fn teardown(&self, binding: &mut ChannelBinding) {
        binding.consumer_tag = None;
        binding.connection = None;

        let Some(channel) = binding.channel.take() else {
            return;
        };

        if let Some(hook) = binding.shutdown_hook.take() {
            channel.remove_shutdown_listener(hook);
        }

        if channel.is_open() {
            if let Err(err) = channel.close().await {
                debug!(
                    queue = self.queue(),
                    error = err.to_string(),
                    "ignoring failure closing consumer channel"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        client::{MockBrokerChannel, MockBrokerConnection},
        queue::QueueDefinition,
        shutdown::NoAutoRecovery,
        testing::RecordingHandler,
        topology::AmqpTopologyDeclarer,
    };
    use mockall::predicate::eq;

    fn holder(registration: ConsumerRegistration) -> Arc<ConsumerHolder> {
        ConsumerHolder::new(
            registration,
            Arc::new(AmqpTopologyDeclarer),
            Arc::new(NoAutoRecovery),
            Arc::new(Notify::new()),
        )
    }

    fn connection_with(channel: MockBrokerChannel) -> Arc<dyn BrokerConnection> {
        let channel: Arc<dyn BrokerChannel> = Arc::new(channel);
        let mut connection = MockBrokerConnection::new();
        connection
            .expect_create_channel()
            .times(1)
            .return_once(move || Ok(channel));
        Arc::new(connection)
    }

    #[tokio::test]
    async fn activation_runs_declare_qos_consume() {
        let mut channel = MockBrokerChannel::new();
        channel
            .expect_add_shutdown_listener()
            .times(1)
            .returning(|_| ListenerId(3));
        channel
            .expect_declare()
            .times(2)
            .returning(|_| Ok(()));
        channel
            .expect_set_qos()
            .with(eq(25))
            .times(1)
            .returning(|_| Ok(()));
        channel
            .expect_consume()
            .withf(|options, _| options.queue == "orders" && !options.auto_ack)
            .times(1)
            .returning(|options, _| Ok(options.consumer_tag));

        let holder = holder(
            ConsumerRegistration::new("orders", RecordingHandler::new())
                .prefetch(25)
                .declare(QueueDefinition::new("orders").with_dlq()),
        );
        let connection = connection_with(channel);

        holder.activate(&connection).await.unwrap();
        // Second call must not open another channel.
        holder.activate(&connection).await.unwrap();

        assert!(holder.is_active());
        assert!(holder.has_channel().await);
        assert!(holder
            .consumer_tag()
            .await
            .is_some_and(|tag| tag.starts_with("orders-")));
    }

    #[tokio::test]
    async fn failed_consume_tears_everything_down() {
        let mut channel = MockBrokerChannel::new();
        channel
            .expect_add_shutdown_listener()
            .times(1)
            .returning(|_| ListenerId(9));
        channel.expect_set_qos().returning(|_| Ok(()));
        channel
            .expect_consume()
            .times(1)
            .returning(|_, _| Err(AmqpError::BindingConsumerError("orders".to_owned())));
        channel
            .expect_remove_shutdown_listener()
            .with(eq(ListenerId(9)))
            .times(1)
            .return_const(true);
        channel.expect_is_open().return_const(true);
        channel.expect_close().times(1).returning(|| Ok(()));

        let holder = holder(ConsumerRegistration::new("orders", RecordingHandler::new()));

        let result = holder.activate(&connection_with(channel)).await;

        assert!(matches!(result, Err(AmqpError::ActivationFailed(_))));
        assert!(!holder.is_active());
        assert!(!holder.has_channel().await);
        assert_eq!(holder.consumer_tag().await, None);
    }

    #[tokio::test]
    async fn channel_creation_failure_leaves_nothing_behind() {
        let mut connection = MockBrokerConnection::new();
        connection
            .expect_create_channel()
            .times(1)
            .returning(|| Err(AmqpError::ChannelError("connection closed".to_owned())));
        let connection: Arc<dyn BrokerConnection> = Arc::new(connection);

        let holder = holder(ConsumerRegistration::new("orders", RecordingHandler::new()));

        assert!(holder.activate(&connection).await.is_err());
        assert!(!holder.is_active());
        assert!(!holder.has_channel().await);
    }

    #[tokio::test]
    async fn deactivate_is_idempotent() {
        let holder = holder(ConsumerRegistration::new("orders", RecordingHandler::new()));

        holder.deactivate().await;
        holder.deactivate().await;

        assert!(!holder.is_active());
    }

    #[tokio::test]
    async fn stale_channel_shutdown_is_ignored() {
        let holder = holder(ConsumerRegistration::new("orders", RecordingHandler::new()));

        holder.handle_channel_shutdown(42).await;

        assert!(!holder.is_active());
        assert!(!holder.has_channel().await);
    }
}
