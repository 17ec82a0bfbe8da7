//! Pure connector state and tick decisions
//!
//! Every flag the driver and the public API share lives in [`ConnectorState`],
//! behind a single lock. The decision of what a tick should do is made here,
//! without any I/O, so the retry and shutdown rules can be tested directly.

use super::queue::{OutgoingMessage, OutgoingQueue};
use crate::error::{ConnectorError, ConnectorResult};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// What the driver should do on this tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickAction {
    /// Shutdown requested: close the session and stop ticking
    Shutdown,
    /// Not connected and the retry countdown is still running
    WaitForRetry { remaining: u32 },
    /// Not connected: attempt to (re)establish the session
    Connect,
    /// Connected: publish the next queued message
    Drain,
}

/// Flags, queue and counters shared between the driver and the API
#[derive(Debug, Default)]
pub struct ConnectorState {
    is_open: bool,
    user_closed: bool,
    retry_countdown: u32,
    queue: OutgoingQueue,
    connect_attempts: u64,
    connections_established: u64,
    connections_lost: u64,
    messages_published: u64,
    delivery_failures: u64,
}

impl ConnectorState {
    /// Decide the action for a new tick. Consumes one step of the retry
    /// countdown when waiting.
    pub fn begin_tick(&mut self) -> TickAction {
        if self.user_closed {
            return TickAction::Shutdown;
        }

        if self.is_open {
            return TickAction::Drain;
        }

        if self.retry_countdown > 0 {
            self.retry_countdown -= 1;
            return TickAction::WaitForRetry {
                remaining: self.retry_countdown,
            };
        }

        self.connect_attempts += 1;
        TickAction::Connect
    }

    pub fn mark_open(&mut self) {
        self.is_open = true;
        self.retry_countdown = 0;
        self.connections_established += 1;
    }

    /// A connection attempt failed; wait `retry_ticks` ticks before the next
    pub fn mark_connect_failed(&mut self, retry_ticks: u32) {
        self.is_open = false;
        self.retry_countdown = retry_ticks;
    }

    /// The session went away. Returns whether it was open until now.
    pub fn mark_connection_lost(&mut self) -> bool {
        let was_open = self.is_open;
        self.is_open = false;
        if was_open {
            self.connections_lost += 1;
        }
        was_open
    }

    /// One-way shutdown request. Returns false if already requested.
    pub fn request_close(&mut self) -> bool {
        let first = !self.user_closed;
        self.user_closed = true;
        first
    }

    /// Driver has closed the session after a shutdown request
    pub fn mark_closed(&mut self) {
        self.is_open = false;
    }

    pub fn is_open(&self) -> bool {
        self.is_open
    }

    pub fn is_closed(&self) -> bool {
        self.user_closed
    }

    pub fn retry_countdown(&self) -> u32 {
        self.retry_countdown
    }

    /// Append a message, unless shutdown was requested
    pub fn enqueue(&mut self, message: OutgoingMessage) -> ConnectorResult<()> {
        if self.user_closed {
            return Err(ConnectorError::Closed);
        }
        self.queue.push(message);
        Ok(())
    }

    pub fn next_message(&self) -> Option<OutgoingMessage> {
        self.queue.peek()
    }

    /// Remove the head message after it was published
    pub fn complete_publish(&mut self) -> Option<OutgoingMessage> {
        let sent = self.queue.pop();
        if sent.is_some() {
            self.messages_published += 1;
        }
        sent
    }

    pub fn record_delivery_failure(&mut self) {
        self.delivery_failures += 1;
    }

    pub fn status(&self) -> ConnectorStatus {
        ConnectorStatus {
            is_open: self.is_open,
            closed: self.user_closed,
            queued_messages: self.queue.len(),
            retry_countdown: self.retry_countdown,
            connect_attempts: self.connect_attempts,
            connections_established: self.connections_established,
            connections_lost: self.connections_lost,
            messages_published: self.messages_published,
            delivery_failures: self.delivery_failures,
        }
    }
}

/// Point-in-time view of the connector
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectorStatus {
    pub is_open: bool,
    pub closed: bool,
    pub queued_messages: usize,
    pub retry_countdown: u32,
    pub connect_attempts: u64,
    pub connections_established: u64,
    pub connections_lost: u64,
    pub messages_published: u64,
    pub delivery_failures: u64,
}

/// Cloneable handle to the shared [`ConnectorState`]
#[derive(Debug, Clone, Default)]
pub struct SharedState(Arc<Mutex<ConnectorState>>);

impl SharedState {
    pub fn lock(&self) -> MutexGuard<'_, ConnectorState> {
        // Critical sections never call out to user code
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_tick_connects() {
        let mut state = ConnectorState::default();
        assert_eq!(state.begin_tick(), TickAction::Connect);
        assert_eq!(state.status().connect_attempts, 1);
    }

    #[test]
    fn test_open_connection_drains() {
        let mut state = ConnectorState::default();
        state.begin_tick();
        state.mark_open();
        assert_eq!(state.begin_tick(), TickAction::Drain);
        assert!(state.is_open());
    }

    #[test]
    fn test_failed_connect_waits_full_countdown() {
        let mut state = ConnectorState::default();
        assert_eq!(state.begin_tick(), TickAction::Connect);
        state.mark_connect_failed(3);

        assert_eq!(state.begin_tick(), TickAction::WaitForRetry { remaining: 2 });
        assert_eq!(state.begin_tick(), TickAction::WaitForRetry { remaining: 1 });
        assert_eq!(state.begin_tick(), TickAction::WaitForRetry { remaining: 0 });
        assert_eq!(state.begin_tick(), TickAction::Connect);
        assert_eq!(state.status().connect_attempts, 2);
    }

    #[test]
    fn test_connection_loss_reconnects_on_next_tick() {
        let mut state = ConnectorState::default();
        state.begin_tick();
        state.mark_open();

        assert!(state.mark_connection_lost());
        assert!(!state.is_open());
        assert_eq!(state.begin_tick(), TickAction::Connect);

        // A second loss report for the same outage is not counted again
        assert!(!state.mark_connection_lost());
        assert_eq!(state.status().connections_lost, 1);
    }

    #[test]
    fn test_shutdown_wins_over_everything() {
        let mut state = ConnectorState::default();
        state.mark_connect_failed(10);
        assert!(state.request_close());
        assert!(!state.request_close());
        assert_eq!(state.begin_tick(), TickAction::Shutdown);

        // Countdown untouched by the shutdown tick
        assert_eq!(state.retry_countdown(), 10);
    }

    #[test]
    fn test_enqueue_after_close_fails() {
        let mut state = ConnectorState::default();
        state.enqueue(OutgoingMessage::new("a", "before")).unwrap();
        state.request_close();

        let result = state.enqueue(OutgoingMessage::new("a", "after"));
        assert!(matches!(result, Err(ConnectorError::Closed)));
        assert_eq!(state.status().queued_messages, 1);
    }

    #[test]
    fn test_complete_publish_removes_head_and_counts() {
        let mut state = ConnectorState::default();
        state.enqueue(OutgoingMessage::new("a", "1")).unwrap();
        state.enqueue(OutgoingMessage::new("b", "2")).unwrap();

        assert_eq!(state.next_message().unwrap().topic, "a");
        assert_eq!(state.complete_publish().unwrap().topic, "a");
        assert_eq!(state.next_message().unwrap().topic, "b");

        let status = state.status();
        assert_eq!(status.messages_published, 1);
        assert_eq!(status.queued_messages, 1);
    }

    #[test]
    fn test_complete_publish_on_empty_queue() {
        let mut state = ConnectorState::default();
        assert!(state.complete_publish().is_none());
        assert_eq!(state.status().messages_published, 0);
    }

    #[test]
    fn test_shared_state_is_shared() {
        let shared = SharedState::default();
        let clone = shared.clone();
        clone.lock().record_delivery_failure();
        assert_eq!(shared.lock().status().delivery_failures, 1);
    }
}
