use crate::errors::*;
use crate::io_loop::ChannelHandle;
use crate::{
    Confirm, Consumer, ConsumerOptions, Delivery, Exchange, ExchangeDeclareOptions, ExchangeType,
    FieldTable, Get, Publish, Queue, QueueDeclareOptions, QueueDeleteOptions, Return, Transaction,
};
use amq_protocol::protocol::basic::AMQPMethod as AmqpBasic;
use amq_protocol::protocol::basic::{
    Ack, Cancel, CancelOk, Get as AmqpGet, Nack, Publish as AmqpPublish, Qos, QosOk, Recover,
    RecoverOk, Reject,
};
use amq_protocol::protocol::confirm::AMQPMethod as AmqpConfirm;
use amq_protocol::protocol::confirm::{Select as ConfirmSelect, SelectOk as ConfirmSelectOk};
use amq_protocol::protocol::exchange::AMQPMethod as AmqpExchange;
use amq_protocol::protocol::exchange::{
    BindOk as ExchangeBindOk, DeclareOk as ExchangeDeclareOk, DeleteOk as ExchangeDeleteOk,
    UnbindOk as ExchangeUnbindOk,
};
use amq_protocol::protocol::queue::AMQPMethod as AmqpQueue;
use amq_protocol::protocol::queue::{
    BindOk as QueueBindOk, DeclareOk as QueueDeclareOk, DeleteOk as QueueDeleteOk,
    PurgeOk as QueuePurgeOk, UnbindOk as QueueUnbindOk,
};
use amq_protocol::protocol::tx::AMQPMethod as AmqpTx;
use amq_protocol::protocol::tx::{
    Commit as TxCommit, CommitOk as TxCommitOk, Rollback as TxRollback,
    RollbackOk as TxRollbackOk, Select as TxSelect, SelectOk as TxSelectOk,
};
use crossbeam_channel::Receiver;
use log::{debug, trace, warn};
use std::sync::Mutex;
use std::time::Duration;

/// A logical AMQP session multiplexed over its connection; RabbitMQ's unit
/// of protocol-level error isolation.
///
/// Channels run one synchronous RPC at a time. A `Channel` may be shared
/// between threads (calls are serialized by an internal mutex), but the
/// intended pattern is one channel per thread; interleaving RPCs from
/// multiple threads on one channel gives no useful ordering guarantees.
///
/// Dropping a channel closes it.
pub struct Channel {
    id: u16,
    inner: Mutex<Inner>,
}

enum Inner {
    Open(OpenChannel),
    /// Closed, with the reason later calls should fail with.
    Closed(Error),
}

struct OpenChannel {
    handle: ChannelHandle,
    confirms: Option<ConfirmState>,
    transactional: bool,
}

struct ConfirmState {
    next_publish_tag: u64,
    confirm_rx: Receiver<Confirm>,
    return_rx: Receiver<Return>,
}

impl Drop for Channel {
    fn drop(&mut self) {
        let _ = self.close_impl();
    }
}

impl Channel {
    pub(crate) fn new(handle: ChannelHandle) -> Channel {
        Channel {
            id: handle.channel_id(),
            inner: Mutex::new(Inner::Open(OpenChannel {
                handle,
                confirms: None,
                transactional: false,
            })),
        }
    }

    /// The channel id (1 or greater; 0 is the connection's own channel).
    #[inline]
    pub fn channel_id(&self) -> u16 {
        self.id
    }

    /// Set a deadline applied to every subsequent synchronous RPC on this
    /// channel. `None` (the default) waits indefinitely. When a deadline
    /// expires the call fails with [`RpcTimeout`](enum.Error.html#variant.RpcTimeout);
    /// the broker-side operation is *not* cancelled, so the channel should
    /// usually be closed after a timeout.
    pub fn set_rpc_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.with_open(|open| {
            open.handle.set_rpc_timeout(timeout);
            Ok(())
        })
    }

    /// Close the channel. This is also called on drop; calling it
    /// explicitly surfaces errors.
    pub fn close(self) -> Result<()> {
        self.close_impl()
    }

    fn close_impl(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        match &mut *inner {
            Inner::Open(open) => {
                let result = open.handle.close();
                // Mark closed even on error; close consumed our last word
                // on this channel and drop must not close again.
                *inner = Inner::Closed(Error::ClientClosedChannel);
                result
            }
            Inner::Closed(_) => Ok(()),
        }
    }

    /// Enable publisher confirms. Once enabled,
    /// [`basic_publish`](#method.basic_publish) blocks until the server
    /// acks or nacks each message, and its `bool` result reflects the
    /// server's answer. Confirms cannot be combined with transactions and
    /// cannot be disabled again.
    pub fn enable_publisher_confirms(&self) -> Result<()> {
        let channel_id = self.id;
        self.with_open(|open| {
            if open.transactional {
                return ConfirmsAndTransactionsExclusiveSnafu { channel_id }.fail();
            }
            if open.confirms.is_some() {
                return Ok(());
            }

            let (confirm_tx, confirm_rx) = crossbeam_channel::unbounded();
            let (return_tx, return_rx) = crossbeam_channel::unbounded();
            open.handle.set_confirm_handler(Some(confirm_tx))?;
            open.handle.set_return_handler(Some(return_tx))?;

            let select_ok: ConfirmSelectOk = open
                .handle
                .call(AmqpConfirm::Select(ConfirmSelect { nowait: false }))?;
            trace!("got confirm select-ok: {:?}", select_ok);

            open.confirms = Some(ConfirmState {
                next_publish_tag: 1,
                confirm_rx,
                return_rx,
            });
            Ok(())
        })
    }

    /// True if publisher confirms have been enabled.
    pub fn publisher_confirms_enabled(&self) -> bool {
        match &*self.inner.lock().unwrap() {
            Inner::Open(open) => open.confirms.is_some(),
            Inner::Closed(_) => false,
        }
    }

    /// Begin a transaction (`tx.select`). The returned guard commits on
    /// [`commit`](struct.Transaction.html#method.commit) and rolls back if
    /// dropped unresolved. Transactions cannot be combined with publisher
    /// confirms.
    pub fn tx(&self) -> Result<Transaction> {
        Transaction::new(self)
    }

    pub(crate) fn tx_select(&self) -> Result<()> {
        let channel_id = self.id;
        self.with_open(|open| {
            if open.confirms.is_some() {
                return ConfirmsAndTransactionsExclusiveSnafu { channel_id }.fail();
            }
            let select_ok: TxSelectOk = open.handle.call(AmqpTx::Select(TxSelect {}))?;
            trace!("got tx select-ok: {:?}", select_ok);
            open.transactional = true;
            Ok(())
        })
    }

    pub(crate) fn tx_commit(&self) -> Result<()> {
        self.with_open(|open| {
            let commit_ok: TxCommitOk = open.handle.call(AmqpTx::Commit(TxCommit {}))?;
            trace!("got tx commit-ok: {:?}", commit_ok);
            Ok(())
        })
    }

    pub(crate) fn tx_rollback(&self) -> Result<()> {
        self.with_open(|open| {
            let rollback_ok: TxRollbackOk = open.handle.call(AmqpTx::Rollback(TxRollback {}))?;
            trace!("got tx rollback-ok: {:?}", rollback_ok);
            Ok(())
        })
    }

    /// Publish a message to `exchange`.
    ///
    /// Without publisher confirms this is fire-and-forget and always
    /// returns `Ok(true)` once the frames are handed to the I/O thread.
    /// With confirms enabled, blocks until the server confirms: `Ok(true)`
    /// for an ack, `Ok(false)` for a nack, and
    /// [`MessageReturned`](enum.Error.html#variant.MessageReturned) if a
    /// `mandatory` publish came back unrouted.
    pub fn basic_publish<S: Into<String>>(&self, exchange: S, publish: Publish) -> Result<bool> {
        let exchange = exchange.into();
        self.with_open(|open| {
            let Publish {
                body,
                routing_key,
                mandatory,
                immediate,
                properties,
            } = publish;

            let pending_tag = open.confirms.as_ref().map(|c| c.next_publish_tag);
            open.handle.publish(
                AmqpPublish {
                    ticket: 0,
                    exchange,
                    routing_key,
                    mandatory,
                    immediate,
                },
                body,
                &properties,
            )?;

            match (pending_tag, &mut open.confirms) {
                (Some(delivery_tag), Some(confirms)) => {
                    confirms.next_publish_tag += 1;
                    wait_for_confirm(&mut open.handle, confirms, delivery_tag)
                }
                _ => Ok(true),
            }
        })
    }

    /// Set this channel's prefetch window (`basic.qos`). With `global`
    /// false the setting applies to new consumers on this channel.
    pub fn qos(&self, prefetch_size: u32, prefetch_count: u16, global: bool) -> Result<()> {
        self.with_open(|open| {
            let qos_ok: QosOk = open.handle.call(AmqpBasic::Qos(Qos {
                prefetch_size,
                prefetch_count,
                global,
            }))?;
            trace!("got qos-ok: {:?}", qos_ok);
            Ok(())
        })
    }

    /// Start a consumer on `queue`. Deliveries arrive on the returned
    /// [`Consumer`](struct.Consumer.html)'s receiver in arrival order.
    pub fn basic_consume<S: Into<String>>(
        &self,
        queue: S,
        options: ConsumerOptions,
    ) -> Result<Consumer> {
        let consume = amq_protocol::protocol::basic::Consume {
            ticket: 0,
            queue: queue.into(),
            consumer_tag: String::new(),
            no_local: options.no_local,
            no_ack: options.no_ack,
            exclusive: options.exclusive,
            nowait: false,
            arguments: options.arguments,
        };
        let (tag, rx) = self.with_open(|open| open.handle.consume(consume))?;
        debug!("started consumer {} on channel {}", tag, self.id);
        Ok(Consumer::new(self, tag, rx))
    }

    pub(crate) fn basic_cancel(&self, consumer_tag: &str) -> Result<()> {
        self.with_open(|open| {
            let cancel_ok: CancelOk = open.handle.call(AmqpBasic::Cancel(Cancel {
                consumer_tag: consumer_tag.to_string(),
                nowait: false,
            }))?;
            trace!("got cancel-ok: {:?}", cancel_ok);
            Ok(())
        })
    }

    /// Synchronously fetch one message from `queue`, or `None` if the
    /// queue is empty. Polling with `basic_get` is much less efficient
    /// than consuming; prefer [`basic_consume`](#method.basic_consume) for
    /// anything throughput-sensitive.
    pub fn basic_get<S: Into<String>>(&self, queue: S, no_ack: bool) -> Result<Option<Get>> {
        let get = AmqpGet {
            ticket: 0,
            queue: queue.into(),
            no_ack,
        };
        self.with_open(|open| open.handle.get(get))
    }

    /// Acknowledge a delivery (and everything unacked before it, if
    /// `multiple`).
    pub fn basic_ack(&self, delivery: &Delivery, multiple: bool) -> Result<()> {
        self.with_open(|open| {
            open.handle.call_nowait(AmqpBasic::Ack(Ack {
                delivery_tag: delivery.delivery_tag(),
                multiple,
            }))
        })
    }

    /// Negatively acknowledge a delivery (RabbitMQ extension).
    pub fn basic_nack(&self, delivery: &Delivery, multiple: bool, requeue: bool) -> Result<()> {
        self.with_open(|open| {
            open.handle.call_nowait(AmqpBasic::Nack(Nack {
                delivery_tag: delivery.delivery_tag(),
                multiple,
                requeue,
            }))
        })
    }

    /// Reject a delivery.
    pub fn basic_reject(&self, delivery: &Delivery, requeue: bool) -> Result<()> {
        self.with_open(|open| {
            open.handle.call_nowait(AmqpBasic::Reject(Reject {
                delivery_tag: delivery.delivery_tag(),
                requeue,
            }))
        })
    }

    /// Ask the server to redeliver every unacknowledged message on this
    /// channel.
    pub fn basic_recover(&self, requeue: bool) -> Result<()> {
        self.with_open(|open| {
            let recover_ok: RecoverOk =
                open.handle.call(AmqpBasic::Recover(Recover { requeue }))?;
            trace!("got recover-ok: {:?}", recover_ok);
            Ok(())
        })
    }

    /// Declare a queue. An empty `name` asks the server to generate one;
    /// the returned [`Queue`](struct.Queue.html) carries the actual name
    /// and the declare-ok counts.
    pub fn queue_declare<S: Into<String>>(
        &self,
        name: S,
        options: QueueDeclareOptions,
    ) -> Result<Queue> {
        let declare = options.into_declare(name.into(), false, false);
        let ok: QueueDeclareOk = self.with_open(|open| open.handle.call(AmqpQueue::Declare(declare)))?;
        Ok(Queue::new(
            self,
            ok.queue,
            Some(ok.message_count),
            Some(ok.consumer_count),
        ))
    }

    /// Declare a queue without waiting for the server's answer. The name
    /// must be nonempty (there is no declare-ok to carry back a generated
    /// name).
    pub fn queue_declare_nowait<S: Into<String>>(
        &self,
        name: S,
        options: QueueDeclareOptions,
    ) -> Result<Queue> {
        let name = name.into();
        let declare = options.into_declare(name.clone(), false, true);
        self.with_open(|open| open.handle.call_nowait(AmqpQueue::Declare(declare)))?;
        Ok(Queue::new(self, name, None, None))
    }

    /// Passively declare a queue: fails with
    /// [`NotFound`](enum.AmqpReplyCode.html#variant.NotFound) if it does
    /// not exist, and otherwise reports its current message and consumer
    /// counts without touching it.
    pub fn queue_declare_passive<S: Into<String>>(&self, name: S) -> Result<Queue> {
        let declare = QueueDeclareOptions::default().into_declare(name.into(), true, false);
        let ok: QueueDeclareOk = self.with_open(|open| open.handle.call(AmqpQueue::Declare(declare)))?;
        Ok(Queue::new(
            self,
            ok.queue,
            Some(ok.message_count),
            Some(ok.consumer_count),
        ))
    }

    pub(crate) fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> Result<()> {
        self.with_open(|open| {
            let bind_ok: QueueBindOk =
                open.handle
                    .call(AmqpQueue::Bind(amq_protocol::protocol::queue::Bind {
                        ticket: 0,
                        queue: queue.to_string(),
                        exchange: exchange.to_string(),
                        routing_key: routing_key.to_string(),
                        nowait: false,
                        arguments,
                    }))?;
            trace!("got bind-ok: {:?}", bind_ok);
            Ok(())
        })
    }

    pub(crate) fn queue_unbind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> Result<()> {
        self.with_open(|open| {
            let unbind_ok: QueueUnbindOk =
                open.handle
                    .call(AmqpQueue::Unbind(amq_protocol::protocol::queue::Unbind {
                        ticket: 0,
                        queue: queue.to_string(),
                        exchange: exchange.to_string(),
                        routing_key: routing_key.to_string(),
                        arguments,
                    }))?;
            trace!("got unbind-ok: {:?}", unbind_ok);
            Ok(())
        })
    }

    pub(crate) fn queue_purge(&self, queue: &str) -> Result<u32> {
        self.with_open(|open| {
            let purge_ok: QueuePurgeOk =
                open.handle
                    .call(AmqpQueue::Purge(amq_protocol::protocol::queue::Purge {
                        ticket: 0,
                        queue: queue.to_string(),
                        nowait: false,
                    }))?;
            Ok(purge_ok.message_count)
        })
    }

    pub(crate) fn queue_delete(&self, queue: &str, options: QueueDeleteOptions) -> Result<u32> {
        self.with_open(|open| {
            let delete_ok: QueueDeleteOk =
                open.handle
                    .call(AmqpQueue::Delete(amq_protocol::protocol::queue::Delete {
                        ticket: 0,
                        queue: queue.to_string(),
                        if_unused: options.if_unused,
                        if_empty: options.if_empty,
                        nowait: false,
                    }))?;
            Ok(delete_ok.message_count)
        })
    }

    /// Declare an exchange of the given type.
    pub fn exchange_declare<S: Into<String>>(
        &self,
        type_: ExchangeType,
        name: S,
        options: ExchangeDeclareOptions,
    ) -> Result<Exchange> {
        let name = name.into();
        let declare = options.into_declare(type_, name.clone(), false, false);
        self.with_open(|open| {
            let declare_ok: ExchangeDeclareOk =
                open.handle.call(AmqpExchange::Declare(declare))?;
            trace!("got declare-ok: {:?}", declare_ok);
            Ok(())
        })?;
        Ok(Exchange::new(self, name))
    }

    /// Passively declare an exchange: fails if it does not exist.
    pub fn exchange_declare_passive<S: Into<String>>(&self, name: S) -> Result<Exchange> {
        let name = name.into();
        // type is ignored for passive declares
        let declare =
            ExchangeDeclareOptions::default().into_declare(ExchangeType::Direct, name.clone(), true, false);
        self.with_open(|open| {
            let declare_ok: ExchangeDeclareOk =
                open.handle.call(AmqpExchange::Declare(declare))?;
            trace!("got declare-ok: {:?}", declare_ok);
            Ok(())
        })?;
        Ok(Exchange::new(self, name))
    }

    pub(crate) fn exchange_delete(&self, exchange: &str, if_unused: bool) -> Result<()> {
        self.with_open(|open| {
            let delete_ok: ExchangeDeleteOk =
                open.handle
                    .call(AmqpExchange::Delete(amq_protocol::protocol::exchange::Delete {
                        ticket: 0,
                        exchange: exchange.to_string(),
                        if_unused,
                        nowait: false,
                    }))?;
            trace!("got delete-ok: {:?}", delete_ok);
            Ok(())
        })
    }

    /// Bind `destination` to receive messages routed by `source`
    /// (`exchange.bind`; RabbitMQ extension).
    pub fn exchange_bind(
        &self,
        destination: &str,
        source: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> Result<()> {
        self.with_open(|open| {
            let bind_ok: ExchangeBindOk =
                open.handle
                    .call(AmqpExchange::Bind(amq_protocol::protocol::exchange::Bind {
                        ticket: 0,
                        destination: destination.to_string(),
                        source: source.to_string(),
                        routing_key: routing_key.to_string(),
                        nowait: false,
                        arguments,
                    }))?;
            trace!("got bind-ok: {:?}", bind_ok);
            Ok(())
        })
    }

    /// Remove an exchange-to-exchange binding (`exchange.unbind`; RabbitMQ
    /// extension).
    pub fn exchange_unbind(
        &self,
        destination: &str,
        source: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> Result<()> {
        self.with_open(|open| {
            let unbind_ok: ExchangeUnbindOk = open.handle.call(AmqpExchange::Unbind(
                amq_protocol::protocol::exchange::Unbind {
                    ticket: 0,
                    destination: destination.to_string(),
                    source: source.to_string(),
                    routing_key: routing_key.to_string(),
                    nowait: false,
                    arguments,
                },
            ))?;
            trace!("got unbind-ok: {:?}", unbind_ok);
            Ok(())
        })
    }

    fn with_open<R, F: FnOnce(&mut OpenChannel) -> Result<R>>(&self, f: F) -> Result<R> {
        let mut inner = self.inner.lock().unwrap();
        match &mut *inner {
            Inner::Closed(err) => Err(err.clone()),
            Inner::Open(open) => {
                let result = f(open);
                if let Err(err) = &result {
                    // A fatal failure (server closed the channel, the
                    // connection died) makes this channel unusable; keep
                    // the reason for later calls.
                    if err.is_fatal_to_channel() {
                        *inner = Inner::Closed(err.clone());
                    }
                }
                result
            }
        }
    }
}

/// Block until the server resolves `delivery_tag`, honoring multiple-acks
/// and surfacing mandatory-publish returns.
fn wait_for_confirm(
    handle: &mut ChannelHandle,
    confirms: &ConfirmState,
    delivery_tag: u64,
) -> Result<bool> {
    loop {
        let confirm = match confirms.confirm_rx.recv() {
            Ok(confirm) => confirm,
            // sender dropped - the channel or connection died mid-wait
            Err(_) => return Err(handle.async_error()),
        };
        let payload = confirm.payload();

        if payload.delivery_tag < delivery_tag {
            // late confirm for an already-resolved publish
            trace!(
                "ignoring stale confirm {:?} while waiting on tag {}",
                confirm,
                delivery_tag
            );
            continue;
        }
        if payload.delivery_tag > delivery_tag && !payload.multiple {
            // should be impossible with one publish in flight
            warn!(
                "confirm for future tag {:?} while waiting on tag {}",
                confirm, delivery_tag
            );
        }

        // A mandatory publish the server could not route comes back as a
        // basic.return followed by its ack; the return wins.
        if let Ok(return_) = confirms.return_rx.try_recv() {
            return MessageReturnedSnafu {
                reply_code: return_.reply_code,
                reply_text: return_.reply_text,
                exchange: return_.exchange,
                routing_key: return_.routing_key,
            }
            .fail();
        }

        return Ok(match confirm {
            Confirm::Ack(_) => true,
            Confirm::Nack(_) => false,
        });
    }
}
