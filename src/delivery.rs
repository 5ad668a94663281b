use crate::{AmqpProperties, Channel, Result};
use amq_protocol::protocol::basic::{Deliver, GetOk};

/// A message delivered by the server, either to a consumer or in answer to
/// a `basic.get`.
#[derive(Clone, Debug)]
pub struct Delivery {
    delivery_tag: u64,

    /// True if this message was previously delivered and requeued.
    pub redelivered: bool,

    /// The exchange the message was originally published to.
    pub exchange: String,

    /// The routing key it was published with.
    pub routing_key: String,

    /// The message body.
    pub content: Vec<u8>,

    /// The message properties.
    pub properties: AmqpProperties,
}

impl Delivery {
    pub(crate) fn new(
        deliver: Deliver,
        content: Vec<u8>,
        properties: AmqpProperties,
    ) -> (String, Delivery) {
        (
            deliver.consumer_tag,
            Delivery {
                delivery_tag: deliver.delivery_tag,
                redelivered: deliver.redelivered,
                exchange: deliver.exchange,
                routing_key: deliver.routing_key,
                content,
                properties,
            },
        )
    }

    pub(crate) fn new_get_ok(
        get_ok: GetOk,
        content: Vec<u8>,
        properties: AmqpProperties,
    ) -> Delivery {
        Delivery {
            delivery_tag: get_ok.delivery_tag,
            redelivered: get_ok.redelivered,
            exchange: get_ok.exchange,
            routing_key: get_ok.routing_key,
            content,
            properties,
        }
    }

    /// The server-assigned delivery tag; monotonically increasing per
    /// channel, and only meaningful on the channel the message arrived on.
    #[inline]
    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    /// Acknowledge this message (and, if `multiple`, everything unacked
    /// before it on the same channel). Take care to pass the channel the
    /// message was delivered on; delivery tags are per-channel.
    #[inline]
    pub fn ack(&self, channel: &Channel, multiple: bool) -> Result<()> {
        channel.basic_ack(self, multiple)
    }

    /// Negatively acknowledge this message (RabbitMQ extension).
    #[inline]
    pub fn nack(&self, channel: &Channel, multiple: bool, requeue: bool) -> Result<()> {
        channel.basic_nack(self, multiple, requeue)
    }

    /// Reject this message.
    #[inline]
    pub fn reject(&self, channel: &Channel, requeue: bool) -> Result<()> {
        channel.basic_reject(self, requeue)
    }
}
