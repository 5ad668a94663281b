use crate::{Channel, FieldTable, Publish, Result};
use amq_protocol::protocol::exchange::Declare;

/// Types of AMQP exchanges.
pub enum ExchangeType {
    /// Delivers messages to queues whose binding key equals the routing
    /// key.
    Direct,

    /// Delivers messages to all bound queues, ignoring the routing key.
    Fanout,

    /// Delivers messages by matching the routing key against binding
    /// patterns.
    Topic,

    /// Routes on message header fields, ignoring the routing key.
    Headers,

    /// A plugin-provided exchange type; should begin with `x-`.
    Custom(String),
}

impl AsRef<str> for ExchangeType {
    fn as_ref(&self) -> &str {
        use self::ExchangeType::*;
        match self {
            Direct => "direct",
            Fanout => "fanout",
            Topic => "topic",
            Headers => "headers",
            Custom(s) => s,
        }
    }
}

/// Options passed to the server when declaring an exchange.
///
/// The [`default`](#impl-Default) implementation sets all boolean fields to
/// false and has an empty set of arguments.
#[derive(Clone, Debug, Default)]
pub struct ExchangeDeclareOptions {
    /// If true, the exchange survives server restarts.
    pub durable: bool,

    /// If true, the exchange is deleted once nothing is bound to it.
    pub auto_delete: bool,

    /// If true, the exchange may not be published to directly; it exists
    /// only as a target of exchange-to-exchange bindings.
    pub internal: bool,

    /// Extra arguments for plugins or server-specific features.
    pub arguments: FieldTable,
}

impl ExchangeDeclareOptions {
    pub(crate) fn into_declare(
        self,
        type_: ExchangeType,
        name: String,
        passive: bool,
        nowait: bool,
    ) -> Declare {
        Declare {
            ticket: 0,
            exchange: name,
            type_: type_.as_ref().to_string(),
            passive,
            durable: self.durable,
            auto_delete: self.auto_delete,
            internal: self.internal,
            nowait,
            arguments: self.arguments,
        }
    }
}

/// Handle to a declared exchange.
///
/// Obtained from [`Channel::exchange_declare`](struct.Channel.html#method.exchange_declare)
/// or [`Exchange::direct`](#method.direct) for the default exchange.
pub struct Exchange<'a> {
    channel: &'a Channel,
    name: String,
}

impl Exchange<'_> {
    pub(crate) fn new(channel: &Channel, name: String) -> Exchange {
        Exchange { channel, name }
    }

    /// The default (nameless) direct exchange, which routes to the queue
    /// named by the routing key. Always exists; never needs declaring.
    pub fn direct(channel: &Channel) -> Exchange {
        Exchange::new(channel, "".to_string())
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Publish a message to this exchange. See
    /// [`Channel::basic_publish`](struct.Channel.html#method.basic_publish)
    /// for the meaning of the returned `bool`.
    pub fn publish(&self, publish: Publish) -> Result<bool> {
        self.channel.basic_publish(self.name(), publish)
    }

    /// Bind this exchange to receive messages routed by `source`
    /// (RabbitMQ extension).
    pub fn bind_to_source<S: Into<String>>(
        &self,
        source: &Exchange,
        routing_key: S,
        arguments: FieldTable,
    ) -> Result<()> {
        self.channel
            .exchange_bind(self.name(), source.name(), &routing_key.into(), arguments)
    }

    /// Unbind this exchange from `source` (RabbitMQ extension).
    pub fn unbind_from_source<S: Into<String>>(
        &self,
        source: &Exchange,
        routing_key: S,
        arguments: FieldTable,
    ) -> Result<()> {
        self.channel
            .exchange_unbind(self.name(), source.name(), &routing_key.into(), arguments)
    }

    /// Delete this exchange.
    pub fn delete(self, if_unused: bool) -> Result<()> {
        self.channel.exchange_delete(self.name(), if_unused)
    }
}
