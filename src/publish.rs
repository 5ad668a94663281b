use crate::AmqpProperties;

/// An outgoing message and its routing instructions.
///
/// # Example
///
/// ```rust
/// use coney::{AmqpProperties, Publish};
///
/// // A persistent message with a content type.
/// let publish = Publish {
///     properties: AmqpProperties::default()
///         .with_content_type("application/json".to_string())
///         .with_delivery_mode(2),
///     ..Publish::new(br#"{"seq":1}"#, "work-queue")
/// };
/// ```
pub struct Publish<'a> {
    /// The message body.
    pub body: &'a [u8],

    /// The routing key.
    pub routing_key: String,

    /// If true, the server must route this message to at least one queue or
    /// return it to us. Returned messages surface as
    /// [`MessageReturned`](enum.Error.html#variant.MessageReturned) errors
    /// on channels with publisher confirms enabled, and are logged and
    /// dropped otherwise.
    pub mandatory: bool,

    /// If true, the server must deliver this message to a consumer
    /// immediately or return it. RabbitMQ 3.x does not support this flag.
    pub immediate: bool,

    /// The message properties (content type, headers, delivery mode, ...).
    pub properties: AmqpProperties,
}

impl<'a> Publish<'a> {
    pub fn new(body: &[u8], routing_key: impl Into<String>) -> Publish {
        Publish {
            body,
            routing_key: routing_key.into(),
            mandatory: false,
            immediate: false,
            properties: AmqpProperties::default(),
        }
    }

    pub fn with_properties(
        body: &[u8],
        routing_key: impl Into<String>,
        properties: AmqpProperties,
    ) -> Publish {
        Publish {
            body,
            routing_key: routing_key.into(),
            mandatory: false,
            immediate: false,
            properties,
        }
    }
}
