use crate::errors::*;
use crate::{AmqpProperties, Delivery, Get, Return};
use amq_protocol::frame::AMQPContentHeader;
use amq_protocol::protocol::basic::Deliver;
use amq_protocol::protocol::basic::GetOk as AmqpGetOk;
use amq_protocol::protocol::basic::Return as AmqpReturn;

/// Reassembles inbound content sequences (a content-bearing method, then a
/// content header, then body frames summing exactly to the header's
/// `body_size`) for one channel. Only one sequence may be in flight per
/// channel per direction; anything out of order is a protocol error.
pub(super) struct ContentCollector {
    kind: Option<Kind>,
}

#[derive(Debug)]
pub(super) enum CollectorResult {
    Delivery((String, Delivery)),
    Return(Return),
    Get(Get),
}

impl ContentCollector {
    pub(super) fn new() -> ContentCollector {
        ContentCollector { kind: None }
    }

    pub(super) fn collect_deliver(&mut self, deliver: Deliver) -> Result<()> {
        match self.kind.take() {
            None => {
                self.kind = Some(Kind::Delivery(State::Start(deliver)));
                Ok(())
            }
            Some(_) => FrameUnexpectedSnafu.fail(),
        }
    }

    pub(super) fn collect_return(&mut self, return_: AmqpReturn) -> Result<()> {
        match self.kind.take() {
            None => {
                self.kind = Some(Kind::Return(State::Start(return_)));
                Ok(())
            }
            Some(_) => FrameUnexpectedSnafu.fail(),
        }
    }

    pub(super) fn collect_get(&mut self, get_ok: AmqpGetOk) -> Result<()> {
        match self.kind.take() {
            None => {
                self.kind = Some(Kind::Get(State::Start(get_ok)));
                Ok(())
            }
            Some(_) => FrameUnexpectedSnafu.fail(),
        }
    }

    pub(super) fn collect_header(
        &mut self,
        header: AMQPContentHeader,
    ) -> Result<Option<CollectorResult>> {
        match self.kind.take() {
            Some(kind) => match kind.collect_header(header)? {
                Step::Done(result) => Ok(Some(result)),
                Step::NeedMore(kind) => {
                    self.kind = Some(kind);
                    Ok(None)
                }
            },
            None => FrameUnexpectedSnafu.fail(),
        }
    }

    pub(super) fn collect_body(&mut self, body: Vec<u8>) -> Result<Option<CollectorResult>> {
        match self.kind.take() {
            Some(kind) => match kind.collect_body(body)? {
                Step::Done(result) => Ok(Some(result)),
                Step::NeedMore(kind) => {
                    self.kind = Some(kind);
                    Ok(None)
                }
            },
            None => FrameUnexpectedSnafu.fail(),
        }
    }
}

enum Kind {
    Delivery(State<Deliver>),
    Return(State<AmqpReturn>),
    Get(State<AmqpGetOk>),
}

impl Kind {
    fn collect_header(self, header: AMQPContentHeader) -> Result<Step> {
        match self {
            Kind::Delivery(state) => state.collect_header(header).map(|c| c.map(Kind::Delivery)),
            Kind::Return(state) => state.collect_header(header).map(|c| c.map(Kind::Return)),
            Kind::Get(state) => state.collect_header(header).map(|c| c.map(Kind::Get)),
        }
    }

    fn collect_body(self, body: Vec<u8>) -> Result<Step> {
        match self {
            Kind::Delivery(state) => state.collect_body(body).map(|c| c.map(Kind::Delivery)),
            Kind::Return(state) => state.collect_body(body).map(|c| c.map(Kind::Return)),
            Kind::Get(state) => state.collect_body(body).map(|c| c.map(Kind::Get)),
        }
    }
}

/// Content-bearing method types that can head a reassembly.
trait ContentStart: Sized {
    fn finish(self, buf: Vec<u8>, properties: AmqpProperties) -> CollectorResult;
}

impl ContentStart for Deliver {
    fn finish(self, buf: Vec<u8>, properties: AmqpProperties) -> CollectorResult {
        CollectorResult::Delivery(Delivery::new(self, buf, properties))
    }
}

impl ContentStart for AmqpReturn {
    fn finish(self, buf: Vec<u8>, properties: AmqpProperties) -> CollectorResult {
        CollectorResult::Return(Return::new(self, buf, properties))
    }
}

impl ContentStart for AmqpGetOk {
    fn finish(self, buf: Vec<u8>, properties: AmqpProperties) -> CollectorResult {
        let message_count = self.message_count;
        let delivery = Delivery::new_get_ok(self, buf, properties);
        CollectorResult::Get(Get {
            delivery,
            message_count,
        })
    }
}

enum Content<T: ContentStart> {
    Done(CollectorResult),
    NeedMore(State<T>),
}

impl<T: ContentStart> Content<T> {
    fn map<F: FnOnce(State<T>) -> Kind>(self, f: F) -> Step {
        match self {
            Content::Done(result) => Step::Done(result),
            Content::NeedMore(state) => Step::NeedMore(f(state)),
        }
    }
}

enum Step {
    Done(CollectorResult),
    NeedMore(Kind),
}

// Clippy warns about State::Body being much larger than the other variant,
// but nearly every State transitions to Body.
#[allow(clippy::large_enum_variant)]
enum State<T: ContentStart> {
    Start(T),
    Body(T, AMQPContentHeader, Vec<u8>),
}

impl<T: ContentStart> State<T> {
    fn collect_header(self, header: AMQPContentHeader) -> Result<Content<T>> {
        match self {
            State::Start(start) => {
                if header.body_size == 0 {
                    Ok(Content::Done(start.finish(Vec::new(), header.properties)))
                } else {
                    let buf = Vec::with_capacity(header.body_size as usize);
                    Ok(Content::NeedMore(State::Body(start, header, buf)))
                }
            }
            State::Body(_, _, _) => FrameUnexpectedSnafu.fail(),
        }
    }

    fn collect_body(self, mut body: Vec<u8>) -> Result<Content<T>> {
        match self {
            State::Body(start, header, mut buf) => {
                let body_size = header.body_size as usize;
                buf.append(&mut body);
                if buf.len() == body_size {
                    Ok(Content::Done(start.finish(buf, header.properties)))
                } else if buf.len() < body_size {
                    Ok(Content::NeedMore(State::Body(start, header, buf)))
                } else {
                    FrameUnexpectedSnafu.fail()
                }
            }
            State::Start(_) => FrameUnexpectedSnafu.fail(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use amq_protocol::protocol::basic::Deliver;

    fn deliver(tag: &str) -> Deliver {
        Deliver {
            consumer_tag: tag.to_string(),
            delivery_tag: 1,
            redelivered: false,
            exchange: "".to_string(),
            routing_key: "rk".to_string(),
        }
    }

    fn header(body_size: u64) -> AMQPContentHeader {
        AMQPContentHeader {
            class_id: 60,
            weight: 0,
            body_size,
            properties: AmqpProperties::default(),
        }
    }

    #[test]
    fn assembles_body_split_across_frames() {
        let mut collector = ContentCollector::new();
        collector.collect_deliver(deliver("tag")).unwrap();
        assert!(collector.collect_header(header(10)).unwrap().is_none());
        assert!(collector.collect_body(b"hello".to_vec()).unwrap().is_none());

        match collector.collect_body(b"world".to_vec()).unwrap() {
            Some(CollectorResult::Delivery((tag, delivery))) => {
                assert_eq!(tag, "tag");
                assert_eq!(delivery.content, b"helloworld");
            }
            _ => panic!("expected completed delivery"),
        }
    }

    #[test]
    fn zero_length_body_completes_at_header() {
        let mut collector = ContentCollector::new();
        collector.collect_deliver(deliver("tag")).unwrap();
        match collector.collect_header(header(0)).unwrap() {
            Some(CollectorResult::Delivery((_, delivery))) => {
                assert!(delivery.content.is_empty());
            }
            _ => panic!("expected completed delivery"),
        }
    }

    #[test]
    fn header_without_method_is_protocol_error() {
        let mut collector = ContentCollector::new();
        match collector.collect_header(header(1)).unwrap_err() {
            Error::FrameUnexpected => (),
            err => panic!("unexpected error {}", err),
        }
    }

    #[test]
    fn interleaved_methods_are_protocol_errors() {
        let mut collector = ContentCollector::new();
        collector.collect_deliver(deliver("a")).unwrap();
        match collector.collect_deliver(deliver("b")).unwrap_err() {
            Error::FrameUnexpected => (),
            err => panic!("unexpected error {}", err),
        }
    }

    #[test]
    fn oversized_body_is_protocol_error() {
        let mut collector = ContentCollector::new();
        collector.collect_deliver(deliver("tag")).unwrap();
        collector.collect_header(header(3)).unwrap();
        match collector.collect_body(b"toolong".to_vec()).unwrap_err() {
            Error::FrameUnexpected => (),
            err => panic!("unexpected error {}", err),
        }
    }
}
