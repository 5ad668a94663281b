use crate::{Channel, Consumer, ConsumerOptions, Exchange, FieldTable, Get, Result};
use amq_protocol::protocol::queue::Declare;

/// Options passed to the server when declaring a queue.
///
/// The [`default`](#impl-Default) implementation sets all boolean fields to
/// false and has an empty set of arguments.
///
/// # Example
///
/// Declaring a durable queue with a message TTL and a dead-letter exchange:
///
/// ```rust
/// # use coney::{AmqpValue, FieldTable, QueueDeclareOptions};
/// let mut arguments = FieldTable::new();
/// arguments.insert("x-message-ttl".to_string(), AmqpValue::LongInt(60_000));
/// arguments.insert(
///     "x-dead-letter-exchange".to_string(),
///     AmqpValue::LongString("dlx".to_string()),
/// );
/// let options = QueueDeclareOptions {
///     durable: true,
///     arguments,
///     ..QueueDeclareOptions::default()
/// };
/// ```
#[derive(Clone, Debug, Default)]
pub struct QueueDeclareOptions {
    /// If true, the queue survives server restarts.
    pub durable: bool,

    /// If true, the queue belongs to this connection and is deleted when
    /// the connection closes.
    pub exclusive: bool,

    /// If true, the queue is deleted once its last consumer disconnects.
    pub auto_delete: bool,

    /// Extra arguments; RabbitMQ reads keys like `x-expires`,
    /// `x-message-ttl`, `x-max-length`, `x-dead-letter-exchange`, and
    /// `x-dead-letter-routing-key` from here.
    pub arguments: FieldTable,
}

impl QueueDeclareOptions {
    pub(crate) fn into_declare(self, queue: String, passive: bool, nowait: bool) -> Declare {
        Declare {
            ticket: 0,
            queue,
            passive,
            durable: self.durable,
            exclusive: self.exclusive,
            auto_delete: self.auto_delete,
            nowait,
            arguments: self.arguments,
        }
    }
}

/// Options passed to the server when deleting a queue.
#[derive(Clone, Debug, Default)]
pub struct QueueDeleteOptions {
    /// If true, refuse to delete while the queue has consumers.
    pub if_unused: bool,

    /// If true, refuse to delete while the queue holds messages.
    pub if_empty: bool,
}

/// Handle to a declared queue.
///
/// Obtained from [`Channel::queue_declare`](struct.Channel.html#method.queue_declare)
/// and friends; all operations run on the declaring channel.
pub struct Queue<'a> {
    channel: &'a Channel,
    name: String,
    message_count: Option<u32>,
    consumer_count: Option<u32>,
}

impl Queue<'_> {
    pub(crate) fn new(
        channel: &Channel,
        name: String,
        message_count: Option<u32>,
        consumer_count: Option<u32>,
    ) -> Queue {
        Queue {
            channel,
            name,
            message_count,
            consumer_count,
        }
    }

    /// The queue name; the server-assigned name if the declare sent an
    /// empty one.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The message count reported by the declare-ok that created this
    /// handle, if there was one (`None` after a nowait declare). See
    /// [`message_count`](#method.message_count) for a current value.
    #[inline]
    pub fn declared_message_count(&self) -> Option<u32> {
        self.message_count
    }

    /// The consumer count reported by the declare-ok that created this
    /// handle, if there was one.
    #[inline]
    pub fn declared_consumer_count(&self) -> Option<u32> {
        self.consumer_count
    }

    /// The number of messages currently ready in this queue, read by
    /// re-declaring it passively. Each call is a server round trip.
    pub fn message_count(&self) -> Result<u32> {
        let queue = self.channel.queue_declare_passive(self.name())?;
        Ok(queue
            .declared_message_count()
            .expect("passive declare always returns counts"))
    }

    /// The number of consumers currently attached to this queue, read by
    /// re-declaring it passively.
    pub fn consumer_count(&self) -> Result<u32> {
        let queue = self.channel.queue_declare_passive(self.name())?;
        Ok(queue
            .declared_consumer_count()
            .expect("passive declare always returns counts"))
    }

    /// Synchronously fetch one message, or `None` if the queue is empty.
    pub fn get(&self, no_ack: bool) -> Result<Option<Get>> {
        self.channel.basic_get(self.name(), no_ack)
    }

    /// Start a consumer on this queue.
    pub fn consume(&self, options: ConsumerOptions) -> Result<Consumer> {
        self.channel.basic_consume(self.name(), options)
    }

    /// Bind this queue to an exchange.
    pub fn bind<S: Into<String>>(
        &self,
        exchange: &Exchange,
        routing_key: S,
        arguments: FieldTable,
    ) -> Result<()> {
        self.channel
            .queue_bind(self.name(), exchange.name(), &routing_key.into(), arguments)
    }

    /// Remove a binding between this queue and an exchange.
    pub fn unbind<S: Into<String>>(
        &self,
        exchange: &Exchange,
        routing_key: S,
        arguments: FieldTable,
    ) -> Result<()> {
        self.channel
            .queue_unbind(self.name(), exchange.name(), &routing_key.into(), arguments)
    }

    /// Discard every ready message in this queue, returning how many were
    /// dropped.
    pub fn purge(&self) -> Result<u32> {
        self.channel.queue_purge(self.name())
    }

    /// Delete this queue, returning the number of messages deleted with it.
    pub fn delete(self, options: QueueDeleteOptions) -> Result<u32> {
        self.channel.queue_delete(self.name(), options)
    }
}
