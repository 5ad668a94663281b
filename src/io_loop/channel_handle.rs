use super::io_loop_handle::{IoLoopHandle, IoLoopHandle0};
use crate::errors::*;
use crate::notification_listeners::NotificationListener;
use crate::serialize::{IntoAmqpClass, TryFromAmqpClass};
use crate::{AmqpProperties, Confirm, ConnectionBlockedNotification, ConsumerMessage, Get, Return};
use amq_protocol::protocol::basic::AMQPMethod as AmqpBasic;
use amq_protocol::protocol::basic::Consume;
use amq_protocol::protocol::basic::Get as AmqpGet;
use amq_protocol::protocol::basic::Publish;
use amq_protocol::protocol::channel::AMQPMethod as AmqpChannel;
use amq_protocol::protocol::channel::Close as ChannelClose;
use amq_protocol::protocol::channel::CloseOk as ChannelCloseOk;
use amq_protocol::protocol::channel::Open as ChannelOpen;
use amq_protocol::protocol::channel::OpenOk as ChannelOpenOk;
use amq_protocol::protocol::connection::Close as ConnectionClose;
use amq_protocol::protocol::constants::REPLY_SUCCESS;
use crossbeam_channel::{Receiver as CrossbeamReceiver, Sender as CrossbeamSender};
use log::{debug, trace};
use std::time::Duration;

// Content payloads leave 8 bytes of each frame for the frame header and
// frame-end octet.
const CONTENT_FRAME_OVERHEAD: usize = 8;

/// The connection's private handle to the I/O thread.
pub(crate) struct Channel0Handle {
    handle: IoLoopHandle0,
    frame_max: usize,
}

impl Channel0Handle {
    pub(super) fn new(handle: IoLoopHandle0, frame_max: usize) -> Channel0Handle {
        assert_eq!(
            handle.channel_id(),
            0,
            "handle for channel 0 must have channel id 0"
        );
        Channel0Handle { handle, frame_max }
    }

    pub(crate) fn register_blocked_listener(
        &self,
    ) -> NotificationListener<ConnectionBlockedNotification> {
        self.handle.blocked_listeners().register_listener()
    }

    pub(crate) fn close_connection(&mut self) -> Result<()> {
        let close = ConnectionClose {
            reply_code: REPLY_SUCCESS as u16,
            reply_text: "Normal shutdown".to_string(),
            class_id: 0,
            method_id: 0,
        };
        debug!("closing connection");
        self.handle.common().call_connection_close(close)?;
        Ok(())
    }

    pub(crate) fn open_channel(&mut self, channel_id: Option<u16>) -> Result<ChannelHandle> {
        let mut handle = self.handle.allocate_channel(channel_id)?;

        debug!("opening channel {}", handle.channel_id());
        let open = AmqpChannel::Open(ChannelOpen {
            out_of_band: String::new(),
        });
        let open_ok = handle.call::<_, ChannelOpenOk>(open)?;
        trace!("got open-ok: {:?}", open_ok);

        Ok(ChannelHandle {
            handle,
            max_payload: self.frame_max - CONTENT_FRAME_OVERHEAD,
        })
    }
}

/// One open channel's handle to the I/O thread, wrapping the raw plumbing
/// with AMQP-level operations. Owned by `Channel` behind its mutex.
pub(crate) struct ChannelHandle {
    handle: IoLoopHandle,
    max_payload: usize,
}

impl ChannelHandle {
    #[inline]
    pub(crate) fn channel_id(&self) -> u16 {
        self.handle.channel_id()
    }

    pub(crate) fn set_rpc_timeout(&mut self, timeout: Option<Duration>) {
        self.handle.set_rpc_timeout(timeout);
    }

    pub(crate) fn close(&mut self) -> Result<()> {
        let close = AmqpChannel::Close(ChannelClose {
            reply_code: REPLY_SUCCESS as u16,
            reply_text: "Normal shutdown".to_string(),
            class_id: 0,
            method_id: 0,
        });
        debug!("closing channel {}", self.channel_id());
        let close_ok = self.call::<_, ChannelCloseOk>(close)?;
        trace!("got close-ok: {:?}", close_ok);
        Ok(())
    }

    pub(crate) fn call<M: IntoAmqpClass, T: TryFromAmqpClass>(&mut self, method: M) -> Result<T> {
        self.handle.call(method)
    }

    pub(crate) fn call_nowait<M: IntoAmqpClass>(&mut self, method: M) -> Result<()> {
        self.handle.call_nowait(method)
    }

    pub(crate) fn publish(
        &mut self,
        publish: Publish,
        content: &[u8],
        properties: &AmqpProperties,
    ) -> Result<()> {
        self.handle.send_content(
            AmqpBasic::Publish(publish),
            Publish::get_class_id(),
            content,
            properties,
            self.max_payload,
        )
    }

    pub(crate) fn consume(
        &mut self,
        consume: Consume,
    ) -> Result<(String, CrossbeamReceiver<ConsumerMessage>)> {
        self.handle.consume(consume)
    }

    pub(crate) fn get(&mut self, get: AmqpGet) -> Result<Option<Get>> {
        self.handle.get(get)
    }

    pub(crate) fn set_return_handler(
        &mut self,
        handler: Option<CrossbeamSender<Return>>,
    ) -> Result<()> {
        self.handle.set_return_handler(handler)
    }

    pub(crate) fn set_confirm_handler(
        &mut self,
        handler: Option<CrossbeamSender<Confirm>>,
    ) -> Result<()> {
        self.handle.set_confirm_handler(handler)
    }

    /// The error behind an asynchronous wakeup (e.g. a confirm receiver
    /// disconnecting mid-wait).
    pub(crate) fn async_error(&mut self) -> Error {
        self.handle.async_error()
    }
}
