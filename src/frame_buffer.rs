use crate::errors::*;
use amq_protocol::frame::{parse_frame, AMQPFrame};
use amq_protocol::types::parsing::parse_long_uint;
use bytes::Buf;
use input_buffer::{InputBuffer, MIN_READ};
use log::trace;
use snafu::ResultExt;
use std::io;

// Every AMQP frame starts with a 7 byte header (type octet, channel short,
// payload-size long) and ends with a frame-end octet; the payload size
// bytes sit at offsets 3..7.
const PAYLOAD_SIZE_RANGE: std::ops::Range<usize> = 3..7;
const FRAME_OVERHEAD: usize = 8;

/// Accumulates bytes read off the socket and carves them into complete AMQP
/// frames. Partial frames stay buffered until the rest arrives.
pub(crate) struct FrameBuffer {
    buf: InputBuffer,
}

impl FrameBuffer {
    pub(crate) fn new() -> FrameBuffer {
        FrameBuffer {
            buf: InputBuffer::new(),
        }
    }

    /// Read from `stream` until it would block, calling `handler` for every
    /// complete frame. Returns the number of bytes read; 0 means the stream
    /// had no data ready.
    pub(crate) fn read_from<S, F>(&mut self, stream: &mut S, mut handler: F) -> Result<usize>
    where
        S: io::Read,
        F: FnMut(AMQPFrame) -> Result<()>,
    {
        let mut bytes_read = 0;

        loop {
            let mut reserve = MIN_READ;

            // drain every complete frame already buffered before touching
            // the stream again.
            if let Some(frame_size) = self.next_frame_size() {
                if self.buf.bytes().len() >= frame_size {
                    let frame = self.parse_one(frame_size)?;
                    handler(frame)?;
                    self.buf.advance(frame_size);
                    continue;
                }
                // we know how much we're short; ask for at least that much.
                reserve = usize::max(MIN_READ, frame_size);
            }

            match self.buf.prepare_reserve(reserve).read_from(stream) {
                Ok(0) => return UnexpectedSocketCloseSnafu.fail(),
                Ok(n) => {
                    trace!("read {} bytes", n);
                    bytes_read += n;
                }
                Err(err) => match err.kind() {
                    io::ErrorKind::WouldBlock => return Ok(bytes_read),
                    _ => return Err(err).context(IoErrorReadingSocketSnafu),
                },
            }
        }
    }

    // None if we don't yet have enough buffered to know the next frame's
    // size.
    fn next_frame_size(&self) -> Option<usize> {
        let bytes = self.buf.bytes();
        if bytes.len() < PAYLOAD_SIZE_RANGE.end {
            return None;
        }
        // parsing a u32 out of 4 bytes cannot fail; safe to unwrap.
        let (_, payload_size) = parse_long_uint(&bytes[PAYLOAD_SIZE_RANGE]).unwrap();
        Some(payload_size as usize + FRAME_OVERHEAD)
    }

    fn parse_one(&self, frame_size: usize) -> Result<AMQPFrame> {
        let bytes = &self.buf.bytes()[..frame_size];
        match parse_frame(bytes) {
            Ok((rest, frame)) if rest.is_empty() => Ok(frame),
            _ => MalformedFrameSnafu.fail(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serialize::OutputBuffer;
    use amq_protocol::protocol::channel::AMQPMethod as AmqpChannel;
    use amq_protocol::protocol::channel::Open as ChannelOpen;
    use amq_protocol::protocol::AMQPClass;
    use mockstream::FailingMockStream;
    use std::io::{Cursor, Read};

    fn heartbeat_bytes() -> Vec<u8> {
        let mut buf = OutputBuffer::empty();
        buf.push_heartbeat();
        buf[0..].to_vec()
    }

    fn channel_open_bytes(channel_id: u16) -> Vec<u8> {
        let mut buf = OutputBuffer::empty();
        buf.push_method(
            channel_id,
            AmqpChannel::Open(ChannelOpen {
                out_of_band: String::new(),
            }),
        )
        .unwrap();
        buf[0..].to_vec()
    }

    fn would_block() -> FailingMockStream {
        FailingMockStream::new(io::ErrorKind::WouldBlock, "", 1)
    }

    #[test]
    fn whole_frame_in_one_read() {
        let bytes = heartbeat_bytes();
        let mut stream = Cursor::new(bytes.clone()).chain(would_block());

        let mut frames = Vec::new();
        let mut buf = FrameBuffer::new();
        let n = buf.read_from(&mut stream, |f| Ok(frames.push(f))).unwrap();

        assert_eq!(n, bytes.len());
        assert_eq!(frames.len(), 1);
        match frames[0] {
            AMQPFrame::Heartbeat(0) => (),
            ref other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn back_to_back_frames_in_one_read() {
        let mut bytes = channel_open_bytes(1);
        bytes.extend_from_slice(&heartbeat_bytes());
        let total = bytes.len();
        let mut stream = Cursor::new(bytes).chain(would_block());

        let mut frames = Vec::new();
        let mut buf = FrameBuffer::new();
        let n = buf.read_from(&mut stream, |f| Ok(frames.push(f))).unwrap();

        assert_eq!(n, total);
        assert_eq!(frames.len(), 2);
        match &frames[0] {
            AMQPFrame::Method(1, AMQPClass::Channel(AmqpChannel::Open(_))) => (),
            other => panic!("unexpected frame {:?}", other),
        }
        match frames[1] {
            AMQPFrame::Heartbeat(0) => (),
            ref other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn frame_split_across_reads() {
        let bytes = channel_open_bytes(7);
        let (head, tail) = bytes.split_at(5);
        let mut stream = Cursor::new(head.to_vec())
            .chain(would_block())
            .chain(Cursor::new(tail.to_vec()))
            .chain(would_block());

        let mut frames = Vec::new();
        let mut buf = FrameBuffer::new();

        let n = buf.read_from(&mut stream, |f| Ok(frames.push(f))).unwrap();
        assert_eq!(n, head.len());
        assert!(frames.is_empty());

        let n = buf.read_from(&mut stream, |f| Ok(frames.push(f))).unwrap();
        assert_eq!(n, tail.len());
        assert_eq!(frames.len(), 1);
        match &frames[0] {
            AMQPFrame::Method(7, AMQPClass::Channel(AmqpChannel::Open(_))) => (),
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn garbage_is_malformed() {
        // frame type 0x63 does not exist; size bytes claim an empty payload.
        let bytes = vec![0x63, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xce];
        let mut stream = Cursor::new(bytes).chain(would_block());

        let mut buf = FrameBuffer::new();
        let res = buf.read_from(&mut stream, |_| panic!("should not be called"));
        match res.unwrap_err() {
            Error::MalformedFrame => (),
            err => panic!("unexpected error {}", err),
        }
    }

    #[test]
    fn handler_errors_propagate() {
        let bytes = heartbeat_bytes();
        let mut stream = Cursor::new(bytes).chain(would_block());

        let mut buf = FrameBuffer::new();
        let res = buf.read_from(&mut stream, |_| FrameUnexpectedSnafu.fail());
        match res.unwrap_err() {
            Error::FrameUnexpected => (),
            err => panic!("unexpected error {}", err),
        }
    }

    #[test]
    fn eof_mid_frame_is_unexpected_close() {
        let mut bytes = heartbeat_bytes();
        bytes.pop();
        let mut stream = Cursor::new(bytes);

        let mut buf = FrameBuffer::new();
        let res = buf.read_from(&mut stream, |_| panic!("should not be called"));
        match res.unwrap_err() {
            Error::UnexpectedSocketClose => (),
            err => panic!("unexpected error {}", err),
        }
    }

    #[test]
    fn io_errors_propagate() {
        let mut stream =
            FailingMockStream::new(io::ErrorKind::ConnectionReset, "connection reset", 1);

        let mut buf = FrameBuffer::new();
        let res = buf.read_from(&mut stream, |_| panic!("should not be called"));
        match res.unwrap_err() {
            Error::IoErrorReadingSocket { .. } => (),
            err => panic!("unexpected error {}", err),
        }
    }
}
