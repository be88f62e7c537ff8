//! Inter-layer messaging for Conductor.
//!
//! - [`signal`] — the directory mailbox shared by the runner, guardian, and
//!   terminal layers: atomic writes, oldest-first listing, explicit
//!   consumption, and poll-with-timeout waits.
//! - [`channel`] — the [`ChannelAdapter`] transport abstraction with console,
//!   queue-CLI, inbox-directory, and mailbox implementations.

pub mod channel;
pub mod signal;

pub use channel::{
    normalize_message_type, ChannelAdapter, ConsoleAdapter, InboxAdapter, MailboxAdapter, Message,
    Priority, QueueAdapter,
};
pub use signal::{PendingSignal, Signal, SignalStore};
