use crate::errors::*;
use amq_protocol::frame::generation::{
    gen_content_body_frame, gen_content_header_frame, gen_heartbeat_frame, gen_method_frame,
};
use amq_protocol::frame::AMQPFrame;
use amq_protocol::protocol::basic::AMQPProperties;
use amq_protocol::protocol::{basic, channel, confirm, connection, exchange, queue, tx};
use amq_protocol::protocol::AMQPClass;
use cookie_factory::GenError;
use std::ops::{Index, RangeFrom};
use std::result::Result as StdResult;

/// Conversion from a method struct's containing enum into the class enum the
/// codec serializes.
pub(crate) trait IntoAmqpClass {
    fn into_class(self) -> AMQPClass;
}

macro_rules! impl_into_amqp_class {
    ($($module:ident => $class:ident),* $(,)?) => {$(
        impl IntoAmqpClass for $module::AMQPMethod {
            fn into_class(self) -> AMQPClass {
                AMQPClass::$class(self)
            }
        }
    )*};
}

impl_into_amqp_class! {
    basic => Basic,
    channel => Channel,
    confirm => Confirm,
    connection => Connection,
    exchange => Exchange,
    queue => Queue,
    tx => Tx,
}

/// Extraction of a typed synchronous RPC response from an inbound method.
pub(crate) trait TryFromAmqpClass: Sized {
    fn try_from(class: AMQPClass) -> Result<Self>;
}

macro_rules! impl_try_from_amqp_class {
    ($($class:ident, $module:ident :: $method:ident);* $(;)?) => {$(
        impl TryFromAmqpClass for $module::$method {
            fn try_from(class: AMQPClass) -> Result<Self> {
                match class {
                    AMQPClass::$class($module::AMQPMethod::$method(inner)) => Ok(inner),
                    _ => FrameUnexpectedSnafu.fail(),
                }
            }
        }
    )*};
}

impl_try_from_amqp_class! {
    Connection, connection::Start;
    Connection, connection::Secure;
    Connection, connection::Tune;
    Connection, connection::OpenOk;
    Connection, connection::Close;
    Connection, connection::CloseOk;
    Channel, channel::OpenOk;
    Channel, channel::CloseOk;
    Basic, basic::QosOk;
    Basic, basic::CancelOk;
    Basic, basic::RecoverOk;
    Confirm, confirm::SelectOk;
    Tx, tx::SelectOk;
    Tx, tx::CommitOk;
    Tx, tx::RollbackOk;
    Queue, queue::DeclareOk;
    Queue, queue::BindOk;
    Queue, queue::UnbindOk;
    Queue, queue::PurgeOk;
    Queue, queue::DeleteOk;
    Exchange, exchange::DeclareOk;
    Exchange, exchange::DeleteOk;
    Exchange, exchange::BindOk;
    Exchange, exchange::UnbindOk;
}

/// Extraction of a typed method from an inbound frame, checking the channel
/// id. Used during the connection handshake, where all traffic is channel 0.
pub(crate) trait TryFromAmqpFrame: Sized {
    fn try_from(channel_id: u16, frame: AMQPFrame) -> Result<Self>;
}

impl<T: TryFromAmqpClass> TryFromAmqpFrame for T {
    fn try_from(expected_id: u16, frame: AMQPFrame) -> Result<Self> {
        match frame {
            AMQPFrame::Method(channel_id, class) if channel_id == expected_id => {
                T::try_from(class)
            }
            _ => FrameUnexpectedSnafu.fail(),
        }
    }
}

/// Buffer of serialized frames waiting to go out on the wire.
#[derive(Clone)]
pub(crate) struct OutputBuffer(Vec<u8>);

impl OutputBuffer {
    /// An output buffer preloaded with the AMQP protocol header, which must
    /// be the first bytes on any new connection.
    pub(crate) fn with_protocol_header() -> OutputBuffer {
        OutputBuffer(Vec::from("AMQP\x00\x00\x09\x01".as_bytes()))
    }

    pub(crate) fn empty() -> OutputBuffer {
        OutputBuffer(Vec::new())
    }

    pub(crate) fn push_method<M: IntoAmqpClass>(
        &mut self,
        channel_id: u16,
        method: M,
    ) -> Result<()> {
        let class = method.into_class();
        serialize(&mut self.0, |buf, pos| {
            gen_method_frame((buf, pos), channel_id, &class)
        })
    }

    pub(crate) fn push_content_header(
        &mut self,
        channel_id: u16,
        class_id: u16,
        body_len: usize,
        properties: &AMQPProperties,
    ) -> Result<()> {
        let body_len = body_len as u64;
        serialize(&mut self.0, |buf, pos| {
            gen_content_header_frame((buf, pos), channel_id, class_id, body_len, properties)
        })
    }

    pub(crate) fn push_content_body(&mut self, channel_id: u16, content: &[u8]) -> Result<()> {
        serialize(&mut self.0, |buf, pos| {
            gen_content_body_frame((buf, pos), channel_id, content)
        })
    }

    pub(crate) fn push_heartbeat(&mut self) {
        // serializing a heartbeat frame cannot fail; safe to unwrap.
        serialize(&mut self.0, |buf, pos| gen_heartbeat_frame((buf, pos))).unwrap();
    }

    /// Move the contents of `self` into a fresh buffer, leaving `self`
    /// empty but with its capacity intact for reuse.
    pub(crate) fn drain_into_new_buf(&mut self) -> OutputBuffer {
        let mut buf = OutputBuffer(Vec::with_capacity(self.0.len()));
        buf.0.append(&mut self.0);
        buf
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub(crate) fn clear(&mut self) {
        self.0.clear()
    }

    #[inline]
    pub(crate) fn drain_written(&mut self, n: usize) {
        self.0.drain(0..n);
    }

    #[inline]
    pub(crate) fn append(&mut self, mut other: OutputBuffer) {
        self.0.append(&mut other.0)
    }
}

impl Index<RangeFrom<usize>> for OutputBuffer {
    type Output = [u8];

    #[inline]
    fn index(&self, index: RangeFrom<usize>) -> &[u8] {
        &self.0[index]
    }
}

/// An output buffer that can be sealed once a `connection.close` or
/// `close-ok` has been appended. Anything pushed after sealing is silently
/// discarded; the connection is going away and only the close handshake may
/// reach the wire.
pub(crate) struct SealableOutputBuffer {
    inner: OutputBuffer,
    sealed: bool,
}

impl SealableOutputBuffer {
    pub(crate) fn new(inner: OutputBuffer) -> SealableOutputBuffer {
        SealableOutputBuffer {
            inner,
            sealed: false,
        }
    }

    #[inline]
    pub(crate) fn seal(&mut self) {
        self.sealed = true;
    }

    #[inline]
    pub(crate) fn is_sealed(&self) -> bool {
        self.sealed
    }

    pub(crate) fn push_method<M: IntoAmqpClass>(
        &mut self,
        channel_id: u16,
        method: M,
    ) -> Result<()> {
        if self.sealed {
            return Ok(());
        }
        self.inner.push_method(channel_id, method)
    }

    pub(crate) fn push_heartbeat(&mut self) {
        if !self.sealed {
            self.inner.push_heartbeat();
        }
    }

    pub(crate) fn append(&mut self, other: OutputBuffer) {
        if !self.sealed {
            self.inner.append(other);
        }
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.inner.len()
    }

    #[inline]
    pub(crate) fn clear(&mut self) {
        self.inner.clear()
    }

    #[inline]
    pub(crate) fn drain_written(&mut self, n: usize) {
        self.inner.drain_written(n)
    }
}

impl Index<RangeFrom<usize>> for SealableOutputBuffer {
    type Output = [u8];

    #[inline]
    fn index(&self, index: RangeFrom<usize>) -> &[u8] {
        &self.inner[index]
    }
}

fn serialize<F: Fn(&mut [u8], usize) -> StdResult<(&mut [u8], usize), GenError>>(
    buf: &mut Vec<u8>,
    f: F,
) -> Result<()> {
    let pos = buf.len();
    loop {
        let resize_to = match f(buf, pos) {
            Ok(_) => return Ok(()),
            Err(GenError::BufferTooSmall(n)) => n,
            Err(_) => return InternalSerializationSnafu.fail(),
        };
        buf.resize(resize_to, 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use amq_protocol::frame::parse_frame;
    use amq_protocol::protocol::channel::AMQPMethod as AmqpChannel;
    use amq_protocol::protocol::channel::Open as ChannelOpen;

    #[test]
    fn protocol_header_is_first_on_the_wire() {
        let buf = OutputBuffer::with_protocol_header();
        assert_eq!(&buf[0..], b"AMQP\x00\x00\x09\x01");
    }

    #[test]
    fn pushed_method_frame_parses_back() {
        let mut buf = OutputBuffer::empty();
        buf.push_method(
            3,
            AmqpChannel::Open(ChannelOpen {
                out_of_band: String::new(),
            }),
        )
        .unwrap();

        let (rest, frame) = parse_frame(&buf[0..]).unwrap();
        assert!(rest.is_empty());
        match frame {
            AMQPFrame::Method(3, AMQPClass::Channel(AmqpChannel::Open(_))) => (),
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn drain_into_new_buf_empties_original() {
        let mut buf = OutputBuffer::empty();
        buf.push_heartbeat();
        let drained = buf.drain_into_new_buf();
        assert!(buf.is_empty());
        assert!(!drained.is_empty());
    }

    #[test]
    fn sealed_buffer_discards_new_writes() {
        let mut buf = SealableOutputBuffer::new(OutputBuffer::empty());
        buf.push_heartbeat();
        let len = buf.len();
        assert!(len > 0);

        buf.seal();
        buf.push_heartbeat();
        let mut extra = OutputBuffer::empty();
        extra.push_heartbeat();
        buf.append(extra);
        assert_eq!(buf.len(), len);
    }
}
