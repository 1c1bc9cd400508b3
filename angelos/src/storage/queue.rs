//! Delivery handles for messages pulled off a channel.

use crate::core::TaskInvocation;

/// A task invocation handed to one consumer.
///
/// The consumer must pass the delivery back to [`super::MessageChannel::ack`]
/// once it has recorded the task's outcome. Until then the channel treats
/// the message as in flight and may hand it out again after the visibility
/// timeout.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub invocation: TaskInvocation,
    /// Backend-specific receipt (stream entry id, in-memory tag).
    pub receipt: String,
    /// Consumer the message was delivered to.
    pub consumer: String,
    /// 1 for the first delivery, incremented on each redelivery.
    pub delivery_count: u32,
}

impl Delivery {
    /// Returns true if this message was delivered before and never acked.
    pub fn is_redelivery(&self) -> bool {
        self.delivery_count > 1
    }
}
