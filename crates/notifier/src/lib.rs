//! Delivery side of the alert pipeline: sender registry, per-contact
//! delivery with resend, and the notification polling worker.

pub mod error;
pub mod notifier;
pub mod registry;
pub mod sender;
pub mod senders;
pub mod worker;
