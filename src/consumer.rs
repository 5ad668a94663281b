use crate::errors::*;
use crate::{Channel, Delivery, FieldTable};
use crossbeam_channel::Receiver;
use std::cell::Cell;

/// Options passed to the server when starting a consumer.
///
/// The [`default`](#impl-Default) implementation sets all boolean fields to
/// false and has an empty set of arguments.
///
/// # Example
///
/// The [`arguments`](#structfield.arguments) field can carry a
/// [consumer priority](https://www.rabbitmq.com/consumer-priority.html):
///
/// ```rust
/// # use coney::{AmqpValue, ConsumerOptions, FieldTable};
/// let mut arguments = FieldTable::new();
/// arguments.insert("x-priority".to_string(), AmqpValue::ShortInt(10));
/// let options = ConsumerOptions {
///     arguments,
///     ..ConsumerOptions::default()
/// };
/// ```
#[derive(Clone, Debug, Default)]
pub struct ConsumerOptions {
    /// If true, the server will not send this consumer messages that were
    /// published by the consumer's own connection.
    pub no_local: bool,

    /// If true, the server assumes every delivered message is acknowledged
    /// on delivery; the client must not ack.
    pub no_ack: bool,

    /// If true, this consumer must be the only one attached to the queue;
    /// the server refuses the consume otherwise.
    pub exclusive: bool,

    /// Extra arguments, e.g. `x-priority`.
    pub arguments: FieldTable,
}

/// Items delivered to a consumer. Once any variant other than `Delivery`
/// has been received, no more messages will arrive.
// Clippy warns about Delivery dwarfing the other variants, but nearly every
// instance is a Delivery.
#[allow(clippy::large_enum_variant)]
#[derive(Debug)]
pub enum ConsumerMessage {
    /// A delivered message.
    Delivery(Delivery),

    /// The consumer was cancelled by the client, e.g. by
    /// [`Consumer::cancel`](struct.Consumer.html#method.cancel).
    ClientCancelled,

    /// The consumer was cancelled by the server, e.g. because its queue was
    /// deleted. The channel remains open.
    ServerCancelled,

    /// The client closed the consumer's channel.
    ClientClosedChannel,

    /// The server closed the consumer's channel; carries the close reason.
    ServerClosedChannel(Error),

    /// The client closed the connection.
    ClientClosedConnection,

    /// The connection died; carries the reason.
    ServerClosedConnection(Error),
}

/// A subscription to a queue, created by
/// [`Channel::basic_consume`](struct.Channel.html#method.basic_consume) or
/// [`Queue::consume`](struct.Queue.html#method.consume).
///
/// Deliveries arrive on [`receiver`](#method.receiver) in the order the
/// server sent them; iterating the receiver is the blocking pull loop.
/// Dropping the consumer cancels it.
///
/// # Example
///
/// ```rust
/// use coney::{Consumer, ConsumerMessage, Result};
/// # use coney::Delivery;
///
/// # fn handle_delivery(_: &Delivery) {}
/// // Receive messages until the subscription ends one way or another.
/// fn drain(consumer: Consumer) -> Result<()> {
///     for message in consumer.receiver().iter() {
///         match message {
///             ConsumerMessage::Delivery(delivery) => {
///                 handle_delivery(&delivery);
///                 consumer.ack(&delivery)?;
///             }
///             ConsumerMessage::ServerClosedChannel(err)
///             | ConsumerMessage::ServerClosedConnection(err) => return Err(err),
///             ConsumerMessage::ClientCancelled
///             | ConsumerMessage::ServerCancelled
///             | ConsumerMessage::ClientClosedChannel
///             | ConsumerMessage::ClientClosedConnection => break,
///         }
///     }
///     Ok(())
/// }
/// ```
pub struct Consumer<'a> {
    channel: &'a Channel,
    consumer_tag: String,
    rx: Receiver<ConsumerMessage>,
    cancelled: Cell<bool>,
}

impl Drop for Consumer<'_> {
    fn drop(&mut self) {
        let _ = self.cancel();
    }
}

impl Consumer<'_> {
    pub(crate) fn new(
        channel: &Channel,
        consumer_tag: String,
        rx: Receiver<ConsumerMessage>,
    ) -> Consumer {
        Consumer {
            channel,
            consumer_tag,
            rx,
            cancelled: Cell::new(false),
        }
    }

    /// The server-assigned consumer tag.
    #[inline]
    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    /// The receiver deliveries arrive on. After a terminal message (any
    /// variant but `Delivery`) the sending side is dropped and iteration
    /// ends.
    #[inline]
    pub fn receiver(&self) -> &Receiver<ConsumerMessage> {
        &self.rx
    }

    /// Cancel this consumer. When the server acknowledges, the receiver
    /// yields [`ConsumerMessage::ClientCancelled`](enum.ConsumerMessage.html#variant.ClientCancelled).
    /// Cancellation is inherently racy - deliveries already in flight may
    /// still arrive first.
    ///
    /// Second and later calls return `Ok` without doing anything; capture
    /// the first call's `Err` if you care about cancellation failures.
    pub fn cancel(&self) -> Result<()> {
        if self.cancelled.get() {
            return Ok(());
        }
        self.cancelled.set(true);
        self.channel.basic_cancel(&self.consumer_tag)
    }

    /// Ack `delivery` on the channel this consumer lives on.
    #[inline]
    pub fn ack(&self, delivery: &Delivery) -> Result<()> {
        delivery.ack(self.channel, false)
    }

    /// Ack `delivery` and everything unacked before it.
    #[inline]
    pub fn ack_multiple(&self, delivery: &Delivery) -> Result<()> {
        delivery.ack(self.channel, true)
    }

    /// Nack `delivery` on the channel this consumer lives on.
    #[inline]
    pub fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<()> {
        delivery.nack(self.channel, false, requeue)
    }

    /// Reject `delivery` on the channel this consumer lives on.
    #[inline]
    pub fn reject(&self, delivery: &Delivery, requeue: bool) -> Result<()> {
        delivery.reject(self.channel, requeue)
    }
}
