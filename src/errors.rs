use snafu::Snafu;
use std::fmt;
use std::io;
use std::sync::Arc;
use url::Url;

/// A type alias for handling errors throughout coney.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Canonical mapping of AMQP reply codes to typed kinds.
///
/// Codes below 500 other than 320 are soft errors (the server closes only
/// the offending channel); 320 and codes of 500 and above are hard errors
/// (the server closes the whole connection). The mapping follows the AMQP
/// 0-9-1 constant table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AmqpReplyCode {
    /// 311 - content larger than the server can accept right now.
    ContentTooLarge,
    /// 312 - a mandatory publish could not be routed to any queue.
    NoRoute,
    /// 313 - an immediate publish found no consumer able to take it.
    NoConsumers,
    /// 320 - an operator forced the connection closed.
    ConnectionForced,
    /// 402 - the client tried to work with an unknown virtual host.
    InvalidPath,
    /// 403 - access to the entity was refused due to security settings.
    AccessRefused,
    /// 404 - the named entity (queue, exchange, ...) does not exist.
    NotFound,
    /// 405 - the entity is exclusively locked by another client.
    ResourceLocked,
    /// 406 - a precondition on the request failed (e.g. redeclaring an
    /// existing queue with different parameters).
    PreconditionFailed,
    /// 501 - malformed frame.
    FrameError,
    /// 502 - a frame contained illegal field values.
    SyntaxError,
    /// 503 - an invalid sequence of frames.
    CommandInvalid,
    /// 504 - use of a channel that was not correctly opened.
    ChannelError,
    /// 505 - a frame that was not expected, usually within a content
    /// sequence.
    UnexpectedFrame,
    /// 506 - the server ran out of a resource.
    ResourceError,
    /// 530 - the request is prohibited by server configuration.
    NotAllowed,
    /// 540 - the server does not implement the requested functionality.
    NotImplemented,
    /// 541 - internal server error.
    InternalError,
    /// A reply code outside the AMQP constant table.
    Other(u16),
}

impl AmqpReplyCode {
    pub fn from_code(code: u16) -> AmqpReplyCode {
        use AmqpReplyCode::*;
        match code {
            311 => ContentTooLarge,
            312 => NoRoute,
            313 => NoConsumers,
            320 => ConnectionForced,
            402 => InvalidPath,
            403 => AccessRefused,
            404 => NotFound,
            405 => ResourceLocked,
            406 => PreconditionFailed,
            501 => FrameError,
            502 => SyntaxError,
            503 => CommandInvalid,
            504 => ChannelError,
            505 => UnexpectedFrame,
            506 => ResourceError,
            530 => NotAllowed,
            540 => NotImplemented,
            541 => InternalError,
            other => Other(other),
        }
    }

    pub fn code(self) -> u16 {
        use AmqpReplyCode::*;
        match self {
            ContentTooLarge => 311,
            NoRoute => 312,
            NoConsumers => 313,
            ConnectionForced => 320,
            InvalidPath => 402,
            AccessRefused => 403,
            NotFound => 404,
            ResourceLocked => 405,
            PreconditionFailed => 406,
            FrameError => 501,
            SyntaxError => 502,
            CommandInvalid => 503,
            ChannelError => 504,
            UnexpectedFrame => 505,
            ResourceError => 506,
            NotAllowed => 530,
            NotImplemented => 540,
            InternalError => 541,
            Other(code) => code,
        }
    }

    /// True if this reply code closes the whole connection rather than a
    /// single channel.
    pub fn is_hard_error(self) -> bool {
        use AmqpReplyCode::*;
        match self {
            ConnectionForced | InvalidPath | FrameError | SyntaxError | CommandInvalid
            | ChannelError | UnexpectedFrame | ResourceError | NotAllowed | NotImplemented
            | InternalError => true,
            ContentTooLarge | NoRoute | NoConsumers | AccessRefused | NotFound
            | ResourceLocked | PreconditionFailed => false,
            Other(code) => code >= 500,
        }
    }
}

impl fmt::Display for AmqpReplyCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} ({:?})", self.code(), self)
    }
}

/// Specific error cases returned by coney.
#[derive(Clone, Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum Error {
    /// URL parsing failed.
    #[snafu(display("could not parse url: {}", source))]
    UrlParse { source: url::ParseError },

    /// URL could not be decoded into an AMQP connection string.
    #[snafu(display("invalid AMQP url: {}", url))]
    InvalidUrl { url: Url },

    /// A query parameter in the connection URL had a malformed value.
    #[snafu(display("invalid value for url parameter {}: {}", parameter, value))]
    InvalidUrlParameter { parameter: String, value: String },

    /// A TLS connection was requested (e.g., via an `amqps` URL), but coney
    /// was built without TLS support.
    #[snafu(display("coney built without TLS support"))]
    TlsFeatureNotEnabled,

    /// The initial TCP connection could not be established.
    #[snafu(display("failed to connect: {}", source))]
    FailedToConnect {
        #[snafu(source(from(io::Error, Arc::new)))]
        source: Arc<io::Error>,
    },

    /// Timeout occurred while connecting or performing the AMQP handshake.
    #[snafu(display("timeout while waiting for connection handshake"))]
    ConnectionTimeout,

    /// The underlying socket was closed by the peer without a
    /// `connection.close` exchange.
    #[snafu(display("underlying socket closed unexpectedly"))]
    UnexpectedSocketClose,

    /// We received data that could not be parsed as an AMQP frame.
    #[snafu(display("received malformed data - expected AMQP frame"))]
    MalformedFrame,

    /// An I/O error occurred while reading the socket.
    #[snafu(display("I/O error reading socket: {}", source))]
    IoErrorReadingSocket {
        #[snafu(source(from(io::Error, Arc::new)))]
        source: Arc<io::Error>,
    },

    /// An I/O error occurred while writing the socket.
    #[snafu(display("I/O error writing socket: {}", source))]
    IoErrorWritingSocket {
        #[snafu(source(from(io::Error, Arc::new)))]
        source: Arc<io::Error>,
    },

    /// Failed to create the I/O thread's polling handle.
    #[snafu(display("failed to create polling handle: {}", source))]
    CreatePollHandle {
        #[snafu(source(from(io::Error, Arc::new)))]
        source: Arc<io::Error>,
    },

    /// Failed to register an event source with the polling handle.
    #[snafu(display("failed to register with polling handle: {}", source))]
    RegisterWithPollHandle {
        #[snafu(source(from(io::Error, Arc::new)))]
        source: Arc<io::Error>,
    },

    /// Failed to deregister an event source from the polling handle.
    #[snafu(display("failed to deregister from polling handle: {}", source))]
    DeregisterWithPollHandle {
        #[snafu(source(from(io::Error, Arc::new)))]
        source: Arc<io::Error>,
    },

    /// Polling for I/O events failed.
    #[snafu(display("failed to poll: {}", source))]
    FailedToPoll {
        #[snafu(source(from(io::Error, Arc::new)))]
        source: Arc<io::Error>,
    },

    /// Spawning the I/O thread failed.
    #[snafu(display("failed to spawn I/O thread: {}", source))]
    ForkFailed {
        #[snafu(source(from(io::Error, Arc::new)))]
        source: Arc<io::Error>,
    },

    /// The server does not support the requested auth mechanism.
    #[snafu(display(
        "requested auth mechanism {} unavailable (available = {})",
        requested,
        available
    ))]
    UnsupportedAuthMechanism { available: String, requested: String },

    /// The server does not support the requested locale.
    #[snafu(display("requested locale {} unavailable (available = {})", requested, available))]
    UnsupportedLocale { available: String, requested: String },

    /// The negotiated frame size is smaller than the minimum required by
    /// AMQP.
    #[snafu(display("requested frame max {} is too small (min = {})", requested, min))]
    FrameMaxTooSmall { min: u32, requested: u32 },

    /// The server requested a Secure/Secure-Ok exchange, which is not
    /// supported.
    #[snafu(display("SASL secure/secure-ok exchanges are not supported"))]
    SaslSecureNotSupported,

    /// The supplied authentication credentials were not accepted by the
    /// server.
    #[snafu(display("invalid credentials"))]
    InvalidCredentials,

    /// The server missed too many successive heartbeats.
    #[snafu(display("missed heartbeats from server"))]
    MissedServerHeartbeats,

    /// The server closed the connection.
    #[snafu(display("server closed connection ({}): {}", code, message))]
    ServerClosedConnection { code: AmqpReplyCode, message: String },

    /// The client closed the connection.
    #[snafu(display("client closed connection"))]
    ClientClosedConnection,

    /// The server closed the given channel.
    #[snafu(display("server closed channel {} ({}): {}", channel_id, code, message))]
    ServerClosedChannel {
        channel_id: u16,
        code: AmqpReplyCode,
        message: String,
    },

    /// The client closed the channel.
    #[snafu(display("channel has been closed"))]
    ClientClosedChannel,

    /// The server returned a mandatory or immediate publish.
    #[snafu(display(
        "message published to exchange {} with routing key {} was returned ({}): {}",
        exchange,
        routing_key,
        reply_code,
        reply_text
    ))]
    MessageReturned {
        reply_code: u16,
        reply_text: String,
        exchange: String,
        routing_key: String,
    },

    /// Publisher confirms and transactions cannot both be enabled on one
    /// channel.
    #[snafu(display(
        "publisher confirms and transactions are mutually exclusive on channel {}",
        channel_id
    ))]
    ConfirmsAndTransactionsExclusive { channel_id: u16 },

    /// A caller-specified RPC deadline was exceeded. The broker-side
    /// operation is not cancelled; the channel should be closed.
    #[snafu(display("timeout waiting for RPC response"))]
    RpcTimeout,

    /// No more channels can be opened because `channel_max` channel ids are
    /// already in use.
    #[snafu(display("no more channel ids are available"))]
    ExhaustedChannelIds,

    /// An explicit channel id was requested, but that id is unavailable for
    /// use.
    #[snafu(display("requested channel id {} is unavailable", channel_id))]
    UnavailableChannelId { channel_id: u16 },

    /// The I/O thread tried to communicate with a caller that no longer
    /// exists.
    #[snafu(display("I/O thread tried to communicate with a nonexistent client"))]
    EventLoopClientDropped,

    /// The I/O thread has dropped the sending side of a channel, typically
    /// because it exited due to another error.
    #[snafu(display("I/O thread dropped sending side of a channel"))]
    EventLoopDropped,

    /// The I/O thread panicked.
    #[snafu(display("I/O thread panicked"))]
    IoThreadPanic,

    /// We received a well-formed AMQP frame we did not expect (e.g., the
    /// wrong response to a synchronous RPC).
    #[snafu(display("AMQP protocol error - received unexpected frame"))]
    FrameUnexpected,

    /// The client sent an AMQP exception to the server and closed the
    /// connection.
    #[snafu(display("internal client exception - received unhandled frames from server"))]
    ClientException,

    /// The server sent frames for a channel id we don't know about.
    #[snafu(display("received frame for nonexistent channel {}", channel_id))]
    ReceivedFrameWithBogusChannelId { channel_id: u16 },

    /// The server sent a consumer tag equal to one already present on the
    /// same channel.
    #[snafu(display(
        "server sent duplicate consumer tag for channel {}: {}",
        channel_id,
        consumer_tag
    ))]
    DuplicateConsumerTag { channel_id: u16, consumer_tag: String },

    /// The server sent a delivery for a consumer tag we don't know about.
    #[snafu(display(
        "received delivery with unknown consumer tag for channel {}: {}",
        channel_id,
        consumer_tag
    ))]
    UnknownConsumerTag { channel_id: u16, consumer_tag: String },

    /// Serializing an outbound frame failed; this indicates a bug in the
    /// frame codec.
    #[snafu(display("internal serialization error"))]
    InternalSerializationError,
}

impl Error {
    /// True if this error leaves the channel it occurred on unusable.
    pub(crate) fn is_fatal_to_channel(&self) -> bool {
        match self {
            Error::ServerClosedChannel { .. }
            | Error::ServerClosedConnection { .. }
            | Error::ClientClosedChannel
            | Error::ClientClosedConnection
            | Error::UnexpectedSocketClose
            | Error::MalformedFrame
            | Error::MissedServerHeartbeats
            | Error::IoErrorReadingSocket { .. }
            | Error::IoErrorWritingSocket { .. }
            | Error::EventLoopClientDropped
            | Error::EventLoopDropped
            | Error::IoThreadPanic => true,
            _ => false,
        }
    }
}

impl From<url::ParseError> for Error {
    fn from(source: url::ParseError) -> Error {
        Error::UrlParse { source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_code_round_trip() {
        for code in &[
            311, 312, 313, 320, 402, 403, 404, 405, 406, 501, 502, 503, 504, 505, 506, 530, 540,
            541,
        ] {
            assert_eq!(AmqpReplyCode::from_code(*code).code(), *code);
        }
        assert_eq!(AmqpReplyCode::from_code(999), AmqpReplyCode::Other(999));
        assert_eq!(AmqpReplyCode::Other(999).code(), 999);
    }

    #[test]
    fn soft_errors_close_only_the_channel() {
        assert!(!AmqpReplyCode::PreconditionFailed.is_hard_error());
        assert!(!AmqpReplyCode::NotFound.is_hard_error());
        assert!(!AmqpReplyCode::AccessRefused.is_hard_error());
        assert!(!AmqpReplyCode::ResourceLocked.is_hard_error());
    }

    #[test]
    fn hard_errors_close_the_connection() {
        assert!(AmqpReplyCode::ConnectionForced.is_hard_error());
        assert!(AmqpReplyCode::FrameError.is_hard_error());
        assert!(AmqpReplyCode::NotAllowed.is_hard_error());
        assert!(AmqpReplyCode::InternalError.is_hard_error());
        assert!(AmqpReplyCode::Other(502).is_hard_error());
        assert!(!AmqpReplyCode::Other(399).is_hard_error());
    }

    #[test]
    fn errors_are_cloneable() {
        let err = Error::IoErrorReadingSocket {
            source: Arc::new(io::Error::new(io::ErrorKind::ConnectionReset, "reset")),
        };
        let clone = err.clone();
        assert_eq!(format!("{}", err), format!("{}", clone));
    }
}
