//! Message engine for the switchboard coordinator.
//!
//! Delivers messages between registered agents with at-least-once
//! semantics: FIFO per recipient, non-destructive reads, explicit
//! acknowledgment, and long-poll blocking waits. Every enqueue appends the
//! inbox row first, then pushes exactly one notify token; waiters tolerate
//! the resulting over-delivery by treating an empty snapshot after a wakeup
//! as spurious and parking again.

mod engine;
mod notify;
mod wait;

pub use engine::{
    ack, delete_expired, delete_stale_tokens, has_pending, inbox_snapshot, send, Outgoing,
    SendInput, SendReceipt,
};
pub use notify::NotifyHub;
pub use wait::{wait_for_messages, WaitOptions, Waited};
