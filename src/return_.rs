use crate::AmqpProperties;
use amq_protocol::protocol::basic::Return as AmqpReturn;

/// A message the server handed back to its publisher because a `mandatory`
/// or `immediate` condition could not be met.
#[derive(Clone, Debug)]
pub struct Return {
    /// AMQP reply code (e.g. 312 for an unroutable mandatory publish).
    pub reply_code: u16,

    /// Human-readable reason (e.g. `NO_ROUTE`).
    pub reply_text: String,

    /// The exchange the message was published to.
    pub exchange: String,

    /// The routing key the message was published with.
    pub routing_key: String,

    /// The message body.
    pub content: Vec<u8>,

    /// The message properties.
    pub properties: AmqpProperties,
}

impl Return {
    pub(crate) fn new(ret: AmqpReturn, content: Vec<u8>, properties: AmqpProperties) -> Return {
        Return {
            reply_code: ret.reply_code,
            reply_text: ret.reply_text,
            exchange: ret.exchange,
            routing_key: ret.routing_key,
            content,
            properties,
        }
    }
}
