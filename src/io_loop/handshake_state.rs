use super::Inner;
use crate::auth::Sasl;
use crate::connection_options::ConnectionOptions;
use crate::errors::*;
use crate::serialize::TryFromAmqpFrame;
use amq_protocol::frame::AMQPFrame;
use amq_protocol::protocol::connection::AMQPMethod as AmqpConnection;
use amq_protocol::protocol::connection::{Close, CloseOk, OpenOk, Secure, Start, Tune, TuneOk};
use amq_protocol::protocol::AMQPClass;
use amq_protocol::types::FieldTable;
use log::{debug, error};

/// Client side of the connection handshake, driven one inbound frame at a
/// time: Start/StartOk, (no Secure), Tune/TuneOk, Open/OpenOk. The server
/// may send `connection.close` instead of any expected frame (bad
/// credentials, bad vhost, bad tune parameters); that routes to
/// `ServerClosing`. The server properties from `Start` ride along so the
/// finished connection can expose them.
#[derive(Debug)]
pub(super) enum HandshakeState<Auth: Sasl> {
    Start(ConnectionOptions<Auth>),
    Secure(ConnectionOptions<Auth>, FieldTable),
    Tune(ConnectionOptions<Auth>, FieldTable),
    Open(TuneOk, FieldTable),
    ServerClosing(Close),
    Done(TuneOk, FieldTable),
}

impl<Auth: Sasl> HandshakeState<Auth> {
    pub(super) fn process(&mut self, inner: &mut Inner, frame: AMQPFrame) -> Result<()> {
        // A close can arrive instead of any expected handshake frame.
        if let AMQPFrame::Method(0, AMQPClass::Connection(AmqpConnection::Close(close))) = frame {
            debug!("received close during handshake: {:?}", close);
            inner.push_method(0, AmqpConnection::CloseOk(CloseOk {}))?;
            inner.seal_writes();
            *self = HandshakeState::ServerClosing(close);
            return Ok(());
        }

        match self {
            HandshakeState::Start(options) => {
                let start = Start::try_from(0, frame)?;
                debug!("received handshake {:?}", start);

                let (start_ok, server_properties) = options.make_start_ok(start)?;
                debug!("sending handshake {:?}", start_ok);
                inner.push_method(0, AmqpConnection::StartOk(start_ok))?;

                *self = HandshakeState::Secure(options.clone(), server_properties);
            }
            HandshakeState::Secure(options, server_properties) => {
                // We only support PLAIN and EXTERNAL, neither of which uses
                // a secure/secure-ok exchange.
                if let Ok(secure) = Secure::try_from(0, frame.clone()) {
                    error!("received unsupported handshake {:?}", secure);
                    return SaslSecureNotSupportedSnafu.fail();
                }
                *self = HandshakeState::Tune(options.clone(), std::mem::take(server_properties));
                return self.process(inner, frame);
            }
            HandshakeState::Tune(options, server_properties) => {
                let tune = Tune::try_from(0, frame)?;
                debug!("received handshake {:?}", tune);

                let tune_ok = options.make_tune_ok(tune)?;
                inner.start_heartbeats(tune_ok.heartbeat);

                debug!("sending handshake {:?}", tune_ok);
                inner.push_method(0, AmqpConnection::TuneOk(tune_ok.clone()))?;

                let open = options.make_open();
                debug!("sending handshake {:?}", open);
                inner.push_method(0, AmqpConnection::Open(open))?;

                *self = HandshakeState::Open(tune_ok, std::mem::take(server_properties));
            }
            HandshakeState::Open(tune_ok, server_properties) => {
                let open_ok = OpenOk::try_from(0, frame)?;
                debug!("received handshake {:?}", open_ok);

                *self = HandshakeState::Done(tune_ok.clone(), std::mem::take(server_properties));
            }
            HandshakeState::ServerClosing(_) | HandshakeState::Done(_, _) => {
                return FrameUnexpectedSnafu.fail();
            }
        }
        Ok(())
    }
}
