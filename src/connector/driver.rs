//! Background driver
//!
//! A single tokio task that ticks on a fixed interval. Each tick runs to
//! completion before the next one starts: apply session-loss events, honour a
//! shutdown request, reconnect when needed, then publish at most one queued
//! message. The driver owns the broker session, so nothing else can touch it.

use super::state::{SharedState, TickAction};
use crate::config::DriverSettings;
use crate::error::redact_credentials;
use crate::notifier::Notifier;
use crate::transport::{
    Broker, BrokerSession, DeliveryHandler, ExchangeSpec, InboundMessage, QueueSpec,
    SessionEvent, ShutdownHook, TransportError,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn, Instrument};

/// Whether the driver keeps running after a tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Continue,
    Stop,
}

pub struct Driver<B: Broker> {
    broker: B,
    exchange: ExchangeSpec,
    settings: DriverSettings,
    notifiers: Arc<BTreeMap<String, Arc<Notifier>>>,
    state: SharedState,
    session: Option<B::Session>,
    generation: u64,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events_rx: mpsc::UnboundedReceiver<SessionEvent>,
}

impl<B: Broker> Driver<B> {
    pub fn new(
        broker: B,
        exchange: ExchangeSpec,
        settings: DriverSettings,
        notifiers: Arc<BTreeMap<String, Arc<Notifier>>>,
        state: SharedState,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            broker,
            exchange,
            settings,
            notifiers,
            state,
            session: None,
            generation: 0,
            events_tx,
            events_rx,
        }
    }

    /// Tick until shutdown is requested
    pub async fn run(mut self) {
        let span = crate::connector_span!(exchange = %self.exchange.name);
        async move {
            info!(
                topics = self.notifiers.len(),
                tick_ms = self.settings.tick_interval.as_millis() as u64,
                "Connector driver started"
            );

            let mut ticker = interval(self.settings.tick_interval);
            // A slow tick delays the following ones instead of bunching them up
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                if self.tick().await == TickOutcome::Stop {
                    break;
                }
            }

            info!("Connector driver stopped");
        }
        .instrument(span)
        .await
    }

    /// Run one tick
    pub async fn tick(&mut self) -> TickOutcome {
        self.apply_session_events();

        let action = self.state.lock().begin_tick();
        match action {
            TickAction::Shutdown => {
                info!("Close requested, shutting down connection");
                self.close_session().await;
                self.state.lock().mark_closed();
                return TickOutcome::Stop;
            }
            TickAction::WaitForRetry { remaining } => {
                debug!(remaining_ticks = remaining, "Waiting before reconnecting");
                return TickOutcome::Continue;
            }
            TickAction::Connect => {
                if !self.try_connect().await {
                    return TickOutcome::Continue;
                }
            }
            TickAction::Drain => {}
        }

        self.send_next().await;
        TickOutcome::Continue
    }

    /// Handle loss notifications posted by the shutdown hook since the last tick
    fn apply_session_events(&mut self) {
        while let Ok(event) = self.events_rx.try_recv() {
            match event {
                SessionEvent::Lost { generation, reason } => {
                    if generation != self.generation {
                        debug!(
                            generation,
                            current = self.generation,
                            "Ignoring loss event from an earlier connection"
                        );
                        continue;
                    }

                    let (was_open, user_closed) = {
                        let mut state = self.state.lock();
                        (state.mark_connection_lost(), state.is_closed())
                    };

                    if was_open && !user_closed {
                        error!(reason = %redact_credentials(&reason), "Connection lost!");
                    }
                }
            }
        }
    }

    /// Replace any stale session with a fresh one. Returns true on success.
    async fn try_connect(&mut self) -> bool {
        self.close_session().await;

        self.generation += 1;
        let hook = ShutdownHook::new(self.generation, self.events_tx.clone());

        match self.open_session(hook).await {
            Ok(session) => {
                self.session = Some(session);
                self.state.lock().mark_open();
                info!(
                    generation = self.generation,
                    topics = self.notifiers.len(),
                    "Connection set up successfully"
                );
                true
            }
            Err(e) => {
                let retry_ticks = self.settings.retry_countdown_ticks();
                self.state.lock().mark_connect_failed(retry_ticks);
                error!(
                    retry_in_secs = self.settings.retry_interval.as_secs(),
                    error = %redact_credentials(&e.to_string()),
                    "Failed to set up connection"
                );
                false
            }
        }
    }

    /// Open a session and set up the exchange and one consumer per topic.
    /// A partially set up session is closed before the error is returned.
    async fn open_session(&self, hook: ShutdownHook) -> Result<B::Session, TransportError> {
        let session = self.broker.open(hook).await?;

        if let Err(e) = self.set_up_topics(&session).await {
            session.close().await;
            return Err(e);
        }

        Ok(session)
    }

    async fn set_up_topics(&self, session: &B::Session) -> Result<(), TransportError> {
        session.declare_exchange(&self.exchange).await?;

        for (topic, notifier) in self.notifiers.iter() {
            let queue = session
                .declare_queue(&QueueSpec::exclusive_temporary())
                .await?;
            session
                .bind_queue(&queue, &self.exchange.name, topic)
                .await?;
            session
                .consume(&queue, self.delivery_handler(notifier))
                .await?;

            debug!(topic = %topic, queue = %queue, "Now consuming topic");
        }

        Ok(())
    }

    /// Route deliveries of one consumer straight to its notifier
    fn delivery_handler(&self, notifier: &Arc<Notifier>) -> DeliveryHandler {
        let notifier = Arc::clone(notifier);
        let state = self.state.clone();

        Arc::new(move |message: InboundMessage| {
            let span = crate::delivery_span!(
                topic = %notifier.topic(),
                routing_key = %message.routing_key
            );
            let _entered = span.enter();

            let result = notifier.deliver(&message.routing_key, message.payload);
            if result.is_err() {
                state.lock().record_delivery_failure();
            }
            result
        })
    }

    /// Publish the head of the queue, removing it only on success
    async fn send_next(&mut self) {
        let Some(message) = self.state.lock().next_message() else {
            return;
        };

        let Some(session) = self.session.as_ref() else {
            // Open without a session cannot happen, but treat it as a loss
            self.state.lock().mark_connection_lost();
            return;
        };

        let result = session
            .publish(
                &self.exchange.name,
                &message.topic,
                &message.payload,
                self.settings.message_ttl,
            )
            .await;

        match result {
            Ok(()) => {
                self.state.lock().complete_publish();
                debug!(topic = %message.topic, bytes = message.payload.len(), "Message was sent");
            }
            Err(e) if e.is_connection_closed() => {
                self.state.lock().mark_connection_lost();
                warn!(
                    topic = %message.topic,
                    "Failed to send because the connection is closed. A retry will occur."
                );
            }
            Err(e) => {
                error!(
                    topic = %message.topic,
                    error = %redact_credentials(&e.to_string()),
                    "Failed to publish message, retrying on next tick"
                );
            }
        }
    }

    async fn close_session(&mut self) {
        if let Some(session) = self.session.take() {
            session.close().await;
            debug!(generation = self.generation, "Closed connection");
        }
    }
}
