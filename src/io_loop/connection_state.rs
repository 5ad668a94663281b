use super::content_collector::CollectorResult;
use super::{Channel0Slot, ChannelMessage, ChannelSlot, Inner};
use crate::errors::*;
use crate::{Confirm, ConfirmPayload, ConnectionBlockedNotification, ConsumerMessage};
use amq_protocol::frame::AMQPFrame;
use amq_protocol::protocol::basic::AMQPMethod as AmqpBasic;
use amq_protocol::protocol::channel::AMQPMethod as AmqpChannel;
use amq_protocol::protocol::channel::CloseOk as ChannelCloseOk;
use amq_protocol::protocol::channel::FlowOk as ChannelFlowOk;
use amq_protocol::protocol::basic::CancelOk as BasicCancelOk;
use amq_protocol::protocol::connection::AMQPMethod as AmqpConnection;
use amq_protocol::protocol::connection::Close as ConnectionClose;
use amq_protocol::protocol::connection::CloseOk as ConnectionCloseOk;
use amq_protocol::protocol::{AMQPClass, AMQPHardError};
use crossbeam_channel::Sender;
use log::{debug, error, trace, warn};
use std::collections::hash_map::Entry;
use std::mem;

/// Connection lifecycle after the handshake. `Steady` owns the channel 0
/// slot; dropping out of `Steady` (either close direction, or a client
/// exception we raise at the server) drops that slot and with it wakes any
/// waiter parked on connection-level RPCs.
pub(super) enum ConnectionState {
    Steady(Channel0Slot),
    ServerClosing(ConnectionClose),
    ClientException,
    ClientClosed,
}

fn slot_remove(inner: &mut Inner, channel_id: u16) -> Result<ChannelSlot> {
    inner
        .chan_slots
        .remove(channel_id)
        .ok_or(Error::ReceivedFrameWithBogusChannelId { channel_id })
}

fn slot_get(inner: &Inner, channel_id: u16) -> Result<&ChannelSlot> {
    inner
        .chan_slots
        .get(channel_id)
        .ok_or(Error::ReceivedFrameWithBogusChannelId { channel_id })
}

fn slot_get_mut(inner: &mut Inner, channel_id: u16) -> Result<&mut ChannelSlot> {
    inner
        .chan_slots
        .get_mut(channel_id)
        .ok_or(Error::ReceivedFrameWithBogusChannelId { channel_id })
}

fn send<T: Send + Sync + 'static>(tx: &Sender<T>, item: T) -> Result<()> {
    tx.send(item)
        .map_err(|_| Error::EventLoopClientDropped)
}

impl ConnectionState {
    pub(super) fn process(&mut self, inner: &mut Inner, frame: AMQPFrame) -> Result<()> {
        // Once we've left Steady the only traffic we expect is the tail of
        // the close handshake, which never reaches this dispatcher.
        match self {
            ConnectionState::Steady(_) => (),
            ConnectionState::ServerClosing(_)
            | ConnectionState::ClientException
            | ConnectionState::ClientClosed => return FrameUnexpectedSnafu.fail(),
        }

        match frame {
            AMQPFrame::Method(0, AMQPClass::Connection(method)) => {
                self.process_channel0(inner, method)
            }
            AMQPFrame::Method(0, other) => {
                let text = format!("do not know how to handle channel 0 method {:?}", other);
                error!("{} - closing connection", text);
                self.raise_client_exception(inner, AMQPHardError::NOTIMPLEMENTED, text)
            }
            AMQPFrame::Header(0, _, _) | AMQPFrame::Body(0, _) => {
                let text = format!("received illegal channel 0 frame {:?}", frame);
                error!("{} - closing connection", text);
                self.raise_client_exception(inner, AMQPHardError::NOTALLOWED, text)
            }
            frame => Self::process_channel_frame(inner, frame),
        }
    }

    fn process_channel0(&mut self, inner: &mut Inner, method: AmqpConnection) -> Result<()> {
        // Pull the slot out so arms can consume or transition freely; every
        // arm is responsible for writing the successor state back.
        let ch0_slot = match mem::replace(self, ConnectionState::ClientClosed) {
            ConnectionState::Steady(slot) => slot,
            _ => unreachable!("checked Steady in process"),
        };

        match method {
            AmqpConnection::Close(close) => {
                warn!("server closing connection: {:?}", close);
                inner.push_method(0, AmqpConnection::CloseOk(ConnectionCloseOk {}))?;
                inner.seal_writes();
                // ch0_slot drops here, waking connection-level waiters
                *self = ConnectionState::ServerClosing(close);
            }
            AmqpConnection::CloseOk(close_ok) => {
                send(
                    &ch0_slot.common.tx,
                    Ok(ChannelMessage::Method(AMQPClass::Connection(
                        AmqpConnection::CloseOk(close_ok),
                    ))),
                )?;
                *self = ConnectionState::ClientClosed;
            }
            AmqpConnection::Blocked(blocked) => {
                debug!("received connection.blocked: {}", blocked.reason);
                ch0_slot
                    .blocked_listeners
                    .broadcast(ConnectionBlockedNotification::Blocked(blocked.reason));
                *self = ConnectionState::Steady(ch0_slot);
            }
            AmqpConnection::Unblocked(_) => {
                debug!("received connection.unblocked");
                ch0_slot
                    .blocked_listeners
                    .broadcast(ConnectionBlockedNotification::Unblocked);
                *self = ConnectionState::Steady(ch0_slot);
            }
            other => {
                let text = format!("unexpected connection method {:?}", other);
                error!("{} - closing connection", text);
                self.raise_client_exception(inner, AMQPHardError::NOTIMPLEMENTED, text)?;
            }
        }
        Ok(())
    }

    fn raise_client_exception(
        &mut self,
        inner: &mut Inner,
        code: AMQPHardError,
        text: String,
    ) -> Result<()> {
        let close = ConnectionClose {
            reply_code: code.get_id(),
            reply_text: text,
            class_id: 0,
            method_id: 0,
        };
        inner.push_method(0, AmqpConnection::Close(close))?;
        inner.seal_writes();
        *self = ConnectionState::ClientException;
        Ok(())
    }

    fn process_channel_frame(inner: &mut Inner, frame: AMQPFrame) -> Result<()> {
        match frame {
            AMQPFrame::Method(n, AMQPClass::Channel(AmqpChannel::Close(close))) => {
                let slot = slot_remove(inner, n)?;
                warn!("server closing channel {}: {:?}", n, close);
                inner.push_method(n, AmqpChannel::CloseOk(ChannelCloseOk {}))?;

                let err = Error::ServerClosedChannel {
                    channel_id: n,
                    code: AmqpReplyCode::from_code(close.reply_code),
                    message: close.reply_text,
                };
                // the waiter may or may not be parked; its queue always has
                // room for an asynchronous close. Consumers learn the same
                // reason. Either side may already be gone - that's fine.
                let _ = slot.tx.send(Err(err.clone()));
                for (_, tx) in slot.consumers {
                    let _ = tx.send(ConsumerMessage::ServerClosedChannel(err.clone()));
                }
            }
            AMQPFrame::Method(n, AMQPClass::Channel(AmqpChannel::CloseOk(close_ok))) => {
                let slot = slot_remove(inner, n)?;
                send(
                    &slot.tx,
                    Ok(ChannelMessage::Method(AMQPClass::Channel(
                        AmqpChannel::CloseOk(close_ok),
                    ))),
                )?;
                for (_, tx) in slot.consumers {
                    let _ = tx.send(ConsumerMessage::ClientClosedChannel);
                }
            }
            AMQPFrame::Method(n, AMQPClass::Channel(AmqpChannel::Flow(flow))) => {
                let active = flow.active;
                debug!(
                    "server set channel {} flow active={} - answering flow-ok",
                    n, active
                );
                slot_get(inner, n)?.flow.set_active(active);
                inner.push_method(n, AmqpChannel::FlowOk(ChannelFlowOk { active }))?;
            }
            AMQPFrame::Method(n, AMQPClass::Basic(AmqpBasic::ConsumeOk(consume_ok))) => {
                let consumer_tag = consume_ok.consumer_tag;
                let slot = slot_get_mut(inner, n)?;
                match slot.consumers.entry(consumer_tag.clone()) {
                    Entry::Occupied(_) => {
                        return DuplicateConsumerTagSnafu {
                            channel_id: n,
                            consumer_tag,
                        }
                        .fail();
                    }
                    Entry::Vacant(entry) => {
                        let (tx, rx) = crossbeam_channel::unbounded();
                        entry.insert(tx);
                        send(&slot.tx, Ok(ChannelMessage::ConsumeOk(consumer_tag, rx)))?;
                    }
                }
            }
            AMQPFrame::Method(n, AMQPClass::Basic(AmqpBasic::Cancel(cancel))) => {
                // server-initiated cancel (e.g. the queue was deleted); the
                // consumer ends cleanly, the channel stays open.
                warn!(
                    "server cancelled consumer {} on channel {}",
                    cancel.consumer_tag, n
                );
                {
                    let slot = slot_get_mut(inner, n)?;
                    if let Some(tx) = slot.consumers.remove(&cancel.consumer_tag) {
                        let _ = tx.send(ConsumerMessage::ServerCancelled);
                    }
                }
                if !cancel.nowait {
                    inner.push_method(
                        n,
                        AmqpBasic::CancelOk(BasicCancelOk {
                            consumer_tag: cancel.consumer_tag,
                        }),
                    )?;
                }
            }
            AMQPFrame::Method(n, AMQPClass::Basic(AmqpBasic::CancelOk(cancel_ok))) => {
                let slot = slot_get_mut(inner, n)?;
                if let Some(tx) = slot.consumers.remove(&cancel_ok.consumer_tag) {
                    let _ = tx.send(ConsumerMessage::ClientCancelled);
                }
                send(
                    &slot.tx,
                    Ok(ChannelMessage::Method(AMQPClass::Basic(
                        AmqpBasic::CancelOk(cancel_ok),
                    ))),
                )?;
            }
            AMQPFrame::Method(n, AMQPClass::Basic(AmqpBasic::Deliver(deliver))) => {
                let slot = slot_get_mut(inner, n)?;
                slot.collector.collect_deliver(deliver)?;
            }
            AMQPFrame::Method(n, AMQPClass::Basic(AmqpBasic::Return(return_))) => {
                let slot = slot_get_mut(inner, n)?;
                slot.collector.collect_return(return_)?;
            }
            AMQPFrame::Method(n, AMQPClass::Basic(AmqpBasic::GetOk(get_ok))) => {
                let slot = slot_get_mut(inner, n)?;
                slot.collector.collect_get(get_ok)?;
            }
            AMQPFrame::Method(n, AMQPClass::Basic(AmqpBasic::GetEmpty(_))) => {
                let slot = slot_get(inner, n)?;
                send(&slot.tx, Ok(ChannelMessage::GetOk(Box::new(None))))?;
            }
            AMQPFrame::Method(n, AMQPClass::Basic(AmqpBasic::Ack(ack))) => {
                let payload = ConfirmPayload {
                    delivery_tag: ack.delivery_tag,
                    multiple: ack.multiple,
                };
                Self::send_confirm(inner, n, Confirm::Ack(payload))?;
            }
            AMQPFrame::Method(n, AMQPClass::Basic(AmqpBasic::Nack(nack))) => {
                let payload = ConfirmPayload {
                    delivery_tag: nack.delivery_tag,
                    multiple: nack.multiple,
                };
                Self::send_confirm(inner, n, Confirm::Nack(payload))?;
            }
            AMQPFrame::Method(n, method) => {
                let slot = slot_get(inner, n)?;
                trace!("forwarding method to client for channel {}: {:?}", n, method);
                send(&slot.tx, Ok(ChannelMessage::Method(method)))?;
            }
            AMQPFrame::Header(n, _, header) => {
                let done = {
                    let slot = slot_get_mut(inner, n)?;
                    slot.collector.collect_header(*header)?
                };
                if let Some(result) = done {
                    Self::route_collected(inner, n, result)?;
                }
            }
            AMQPFrame::Body(n, body) => {
                let done = {
                    let slot = slot_get_mut(inner, n)?;
                    slot.collector.collect_body(body)?
                };
                if let Some(result) = done {
                    Self::route_collected(inner, n, result)?;
                }
            }
            AMQPFrame::ProtocolHeader | AMQPFrame::Heartbeat(_) => {
                // heartbeats are consumed before dispatch; a protocol
                // header after the handshake is nonsense.
                return FrameUnexpectedSnafu.fail();
            }
        }
        Ok(())
    }

    fn send_confirm(inner: &mut Inner, channel_id: u16, confirm: Confirm) -> Result<()> {
        let slot = slot_get_mut(inner, channel_id)?;
        match &slot.confirm_handler {
            Some(tx) => {
                if tx.send(confirm).is_err() {
                    warn!(
                        "dropping publisher confirm for channel {} (handler gone): {:?}",
                        channel_id, confirm
                    );
                    slot.confirm_handler = None;
                }
            }
            None => warn!(
                "received publisher confirm without a registered handler on channel {}: {:?}",
                channel_id, confirm
            ),
        }
        Ok(())
    }

    fn route_collected(inner: &mut Inner, channel_id: u16, result: CollectorResult) -> Result<()> {
        match result {
            CollectorResult::Delivery((consumer_tag, delivery)) => {
                let slot = slot_get(inner, channel_id)?;
                let tx = slot.consumers.get(&consumer_tag).ok_or_else(|| {
                    Error::UnknownConsumerTag {
                        channel_id,
                        consumer_tag: consumer_tag.clone(),
                    }
                })?;
                send(tx, ConsumerMessage::Delivery(delivery))?;
            }
            CollectorResult::Return(return_) => {
                let slot = slot_get_mut(inner, channel_id)?;
                match &slot.return_handler {
                    Some(tx) => {
                        if tx.send(return_).is_err() {
                            warn!(
                                "dropping returned message on channel {} (handler gone)",
                                channel_id
                            );
                            slot.return_handler = None;
                        }
                    }
                    None => warn!(
                        "dropping returned message on channel {} (no handler registered)",
                        channel_id
                    ),
                }
            }
            CollectorResult::Get(get) => {
                let slot = slot_get(inner, channel_id)?;
                send(&slot.tx, Ok(ChannelMessage::GetOk(Box::new(Some(get)))))?;
            }
        }
        Ok(())
    }
}
