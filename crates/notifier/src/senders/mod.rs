//! Bundled senders.

use crate::sender::Sender;

pub mod log;
pub mod webhook;

pub use log::LogSender;
pub use webhook::WebhookSender;

/// Build the bundled sender for `sender_type`, if there is one.
pub fn builtin(sender_type: &str) -> Option<Box<dyn Sender>> {
    match sender_type {
        "log" => Some(Box::new(LogSender::default())),
        "webhook" => Some(Box::new(WebhookSender::default())),
        _ => None,
    }
}
