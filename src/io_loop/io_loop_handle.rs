use super::{ChannelMessage, FinalResult, IoLoopMessage};
use crate::errors::*;
use crate::flow_control::FlowControl;
use crate::notification_listeners::NotificationListeners;
use crate::serialize::{IntoAmqpClass, OutputBuffer, TryFromAmqpClass};
use crate::{AmqpProperties, ConnectionBlockedNotification, ConsumerMessage, Get};
use amq_protocol::protocol::basic::AMQPMethod as AmqpBasic;
use amq_protocol::protocol::basic::Consume;
use amq_protocol::protocol::basic::Get as AmqpGet;
use amq_protocol::protocol::connection::AMQPMethod as AmqpConnection;
use amq_protocol::protocol::connection::Close as ConnectionClose;
use amq_protocol::protocol::connection::CloseOk as ConnectionCloseOk;
use crossbeam_channel::Receiver as CrossbeamReceiver;
use crossbeam_channel::RecvTimeoutError;
use crossbeam_channel::TryRecvError;
use log::{error, warn};
use mio_extras::channel::SyncSender as MioSyncSender;
use std::sync::Arc;
use std::time::Duration;

/// Client-side endpoint of one channel's plumbing into the I/O thread:
/// the mio sender that doubles as the thread's wakeup trigger, and the
/// waiter the thread answers synchronous RPCs on.
pub(super) struct IoLoopHandle {
    pub(super) channel_id: u16,
    buf: OutputBuffer,
    tx: MioSyncSender<IoLoopMessage>,
    rx: CrossbeamReceiver<Result<ChannelMessage>>,
    pub(super) flow: Arc<FlowControl>,
    io_result: FinalResult,
    rpc_timeout: Option<Duration>,
}

impl IoLoopHandle {
    pub(super) fn new(
        channel_id: u16,
        tx: MioSyncSender<IoLoopMessage>,
        rx: CrossbeamReceiver<Result<ChannelMessage>>,
        flow: Arc<FlowControl>,
        io_result: FinalResult,
    ) -> IoLoopHandle {
        IoLoopHandle {
            channel_id,
            buf: OutputBuffer::empty(),
            tx,
            rx,
            flow,
            io_result,
            rpc_timeout: None,
        }
    }

    #[inline]
    pub(super) fn channel_id(&self) -> u16 {
        self.channel_id
    }

    pub(super) fn set_rpc_timeout(&mut self, timeout: Option<Duration>) {
        self.rpc_timeout = timeout;
    }

    fn make_buf<M: IntoAmqpClass>(&mut self, method: M) -> Result<OutputBuffer> {
        debug_assert!(self.buf.is_empty());
        self.buf.push_method(self.channel_id, method)?;
        Ok(self.buf.drain_into_new_buf())
    }

    pub(super) fn call<M: IntoAmqpClass, T: TryFromAmqpClass>(&mut self, method: M) -> Result<T> {
        let buf = self.make_buf(method)?;
        self.call_message(IoLoopMessage::Send(buf))
    }

    pub(super) fn call_nowait<M: IntoAmqpClass>(&mut self, method: M) -> Result<()> {
        let buf = self.make_buf(method)?;
        self.send(IoLoopMessage::Send(buf))
    }

    pub(super) fn call_connection_close(
        &mut self,
        close: ConnectionClose,
    ) -> Result<ConnectionCloseOk> {
        let buf = self.make_buf(AmqpConnection::Close(close))?;
        self.call_message(IoLoopMessage::ConnectionClose(buf))
    }

    /// Send a content-bearing method (publish) as one atomic group: method
    /// frame, content header, and body frames of at most `max_payload`
    /// bytes each. Parks first if the server has paused this channel via
    /// `channel.flow`.
    pub(super) fn send_content<M: IntoAmqpClass>(
        &mut self,
        method: M,
        class_id: u16,
        content: &[u8],
        properties: &AmqpProperties,
        max_payload: usize,
    ) -> Result<()> {
        self.flow.wait_until_active();

        debug_assert!(self.buf.is_empty());
        self.buf.push_method(self.channel_id, method)?;
        self.buf
            .push_content_header(self.channel_id, class_id, content.len(), properties)?;
        for chunk in content.chunks(max_payload) {
            self.buf.push_content_body(self.channel_id, chunk)?;
        }
        let buf = self.buf.drain_into_new_buf();
        self.send(IoLoopMessage::Send(buf))
    }

    pub(super) fn get(&mut self, get: AmqpGet) -> Result<Option<Get>> {
        let buf = self.make_buf(AmqpBasic::Get(get))?;
        self.send_rpc(IoLoopMessage::Send(buf))?;
        match self.recv()? {
            ChannelMessage::GetOk(get) => Ok(*get),
            ChannelMessage::Method(_) | ChannelMessage::ConsumeOk(_, _) => {
                FrameUnexpectedSnafu.fail()
            }
        }
    }

    pub(super) fn consume(
        &mut self,
        consume: Consume,
    ) -> Result<(String, CrossbeamReceiver<ConsumerMessage>)> {
        let buf = self.make_buf(AmqpBasic::Consume(consume))?;
        self.send_rpc(IoLoopMessage::Send(buf))?;
        match self.recv()? {
            ChannelMessage::ConsumeOk(tag, rx) => Ok((tag, rx)),
            ChannelMessage::Method(_) | ChannelMessage::GetOk(_) => FrameUnexpectedSnafu.fail(),
        }
    }

    pub(super) fn set_return_handler(
        &mut self,
        handler: Option<crossbeam_channel::Sender<crate::Return>>,
    ) -> Result<()> {
        self.send(IoLoopMessage::SetReturnHandler(handler))
    }

    pub(super) fn set_confirm_handler(
        &mut self,
        handler: Option<crossbeam_channel::Sender<crate::Confirm>>,
    ) -> Result<()> {
        self.send(IoLoopMessage::SetConfirmHandler(handler))
    }

    fn call_message<T: TryFromAmqpClass>(&mut self, message: IoLoopMessage) -> Result<T> {
        self.send_rpc(message)?;
        match self.recv()? {
            ChannelMessage::Method(method) => T::try_from(method),
            ChannelMessage::ConsumeOk(_, _) | ChannelMessage::GetOk(_) => {
                FrameUnexpectedSnafu.fail()
            }
        }
    }

    // Entry point for sends that will wait for a response. If an earlier
    // call timed out, its response may still be parked in our waiter;
    // discard it so it cannot be mistaken for the answer to this call. An
    // asynchronous server close waiting there surfaces now instead.
    fn send_rpc(&mut self, message: IoLoopMessage) -> Result<()> {
        match self.rx.try_recv() {
            Ok(Ok(stale)) => {
                warn!(
                    "discarding stale response on channel {} (lost to an earlier rpc timeout): {:?}",
                    self.channel_id, stale
                );
            }
            Ok(Err(err)) => return Err(err),
            Err(TryRecvError::Empty) => (),
            Err(TryRecvError::Disconnected) => return Err(self.io_loop_error()),
        }
        self.send(message)
    }

    fn send(&mut self, message: IoLoopMessage) -> Result<()> {
        self.tx
            .send(message)
            .map_err(|_| self.check_recv_for_error())
    }

    fn recv(&mut self) -> Result<ChannelMessage> {
        match self.rpc_timeout {
            None => self.rx.recv().map_err(|_| self.io_loop_error())?,
            Some(timeout) => match self.rx.recv_timeout(timeout) {
                Ok(message) => message,
                Err(RecvTimeoutError::Timeout) => RpcTimeoutSnafu.fail(),
                Err(RecvTimeoutError::Disconnected) => Err(self.io_loop_error()),
            },
        }
    }

    /// The reason sends to the I/O thread are failing: either a pending
    /// server close for this channel, or the thread's final error.
    pub(super) fn check_recv_for_error(&mut self) -> Error {
        // A failed send means either the server closed this channel (its
        // slot is gone, but the close reason is waiting on rx) or the I/O
        // thread itself is gone.
        match self.rx.recv() {
            Ok(Ok(_)) => {
                error!("internal error - received frame response after send failure");
                Error::FrameUnexpected
            }
            Ok(Err(err)) => err,
            Err(_) => self.io_loop_error(),
        }
    }

    /// Like `check_recv_for_error`, but without blocking; used when a
    /// side-channel (confirm or consumer receiver) disconnects.
    pub(super) fn async_error(&mut self) -> Error {
        match self.rx.try_recv() {
            Ok(Err(err)) => err,
            _ => self.io_loop_error(),
        }
    }

    pub(super) fn io_loop_error(&self) -> Error {
        self.io_result.error()
    }
}

/// The connection's own handle (channel 0), which additionally brokers
/// channel-id allocation and connection-blocked notifications.
pub(super) struct IoLoopHandle0 {
    common: IoLoopHandle,
    alloc_chan_req_tx: MioSyncSender<Option<u16>>,
    alloc_chan_rep_rx: CrossbeamReceiver<Result<IoLoopHandle>>,
    blocked_listeners: NotificationListeners<ConnectionBlockedNotification>,
}

impl IoLoopHandle0 {
    pub(super) fn new(
        common: IoLoopHandle,
        alloc_chan_req_tx: MioSyncSender<Option<u16>>,
        alloc_chan_rep_rx: CrossbeamReceiver<Result<IoLoopHandle>>,
        blocked_listeners: NotificationListeners<ConnectionBlockedNotification>,
    ) -> IoLoopHandle0 {
        IoLoopHandle0 {
            common,
            alloc_chan_req_tx,
            alloc_chan_rep_rx,
            blocked_listeners,
        }
    }

    #[inline]
    pub(super) fn channel_id(&self) -> u16 {
        self.common.channel_id
    }

    pub(super) fn common(&mut self) -> &mut IoLoopHandle {
        &mut self.common
    }

    pub(super) fn blocked_listeners(&self) -> &NotificationListeners<ConnectionBlockedNotification> {
        &self.blocked_listeners
    }

    pub(super) fn allocate_channel(&mut self, channel_id: Option<u16>) -> Result<IoLoopHandle> {
        self.alloc_chan_req_tx
            .send(channel_id)
            .map_err(|_| self.common.check_recv_for_error())?;
        self.alloc_chan_rep_rx
            .recv()
            .map_err(|_| self.common.io_loop_error())?
    }
}
