/// Payload of a publisher confirmation from the server.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConfirmPayload {
    /// The confirmed delivery tag. Tags count publishes on a channel,
    /// starting from 1 once confirms are enabled.
    pub delivery_tag: u64,

    /// If true, the confirmation covers every unconfirmed message with a
    /// delivery tag up to and including this one.
    pub multiple: bool,
}

/// A publisher confirmation from the server.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Confirm {
    /// The server took responsibility for the message(s). Note this says
    /// nothing about consumption, only receipt (and, for persistent
    /// messages on durable queues, persistence).
    Ack(ConfirmPayload),

    /// The server rejected the message(s), e.g. because an internal error
    /// made it unable to store them.
    Nack(ConfirmPayload),
}

impl Confirm {
    pub(crate) fn payload(&self) -> ConfirmPayload {
        match self {
            Confirm::Ack(payload) | Confirm::Nack(payload) => *payload,
        }
    }
}
