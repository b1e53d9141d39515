//! In-process wakeup channels for blocked waiters.
//!
//! The durable notify tokens live in the store; this hub is the wakeup
//! path. Each recipient gets a `tokio::sync::Notify`; senders signal it
//! after pushing a token row. `notify_one` buffers a permit when no waiter
//! is parked, so a signal that lands between a waiter's inbox check and its
//! park is not lost.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// Per-agent wakeup registry plus the coordinator-wide shutdown latch.
#[derive(Clone, Default)]
pub struct NotifyHub {
    channels: Arc<Mutex<HashMap<String, Arc<Notify>>>>,
    shutdown_flag: Arc<AtomicBool>,
    shutdown_notify: Arc<Notify>,
}

impl NotifyHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// The wakeup channel for one agent, created on first use.
    pub fn handle(&self, agent_id: &str) -> Arc<Notify> {
        let mut channels = self
            .channels
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        channels
            .entry(agent_id.to_string())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    /// Wakes one waiter for the agent (or banks the permit if none is
    /// parked yet).
    pub fn signal(&self, agent_id: &str) {
        self.handle(agent_id).notify_one();
    }

    /// Drops an agent's channel. Called when a record is fully removed.
    pub fn forget(&self, agent_id: &str) {
        let mut channels = self
            .channels
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        channels.remove(agent_id);
    }

    /// Whether shutdown has been requested.
    pub fn is_shutdown(&self) -> bool {
        self.shutdown_flag.load(Ordering::SeqCst)
    }

    /// Latches shutdown and wakes every parked waiter so in-flight
    /// long-polls can return a retry status instead of being severed.
    pub fn shutdown_all(&self) {
        self.shutdown_flag.store(true, Ordering::SeqCst);
        self.shutdown_notify.notify_waiters();
        let channels = self
            .channels
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        for notify in channels.values() {
            notify.notify_waiters();
        }
    }

    /// A future that resolves once shutdown is latched.
    pub async fn shutdown_signal(&self) {
        if self.is_shutdown() {
            return;
        }
        self.shutdown_notify.notified().await;
    }
}
