//! Worker runtime primitives shared by the dsync crates.
//!
//! * [`Mailbox`]: bounded FIFO queue with explicit close, used for session
//!   event queues (backpressure) and client outputs (drop-newest).
//! * [`GenerationClock`]: distinguishes successive workers serving one key.
//! * [`spawn`]: task spawn with a [`TaskClass`] label for tracing.

mod class;
mod mailbox;
mod spawn;
mod token;

pub use class::TaskClass;
pub use mailbox::{Mailbox, MailboxPolicy, MailboxReceiver, MailboxSendError, MailboxSendOutcome, MailboxSender};
pub use spawn::spawn;
pub use token::GenerationClock;
