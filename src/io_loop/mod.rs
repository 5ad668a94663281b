use crate::connection::{ConnectionBlockedNotification, ConnectionTuning};
use crate::connection_options::ConnectionOptions;
use crate::errors::*;
use crate::flow_control::FlowControl;
use crate::frame_buffer::FrameBuffer;
use crate::heartbeats::HeartbeatTimers;
use crate::notification_listeners::NotificationListeners;
use crate::serialize::{IntoAmqpClass, OutputBuffer, SealableOutputBuffer};
use crate::stream::IoStream;
use crate::{Confirm, ConsumerMessage, Get, Return, Sasl};
use amq_protocol::frame::AMQPFrame;
use amq_protocol::protocol::AMQPClass;
use amq_protocol::types::FieldTable;
use crossbeam_channel::Receiver as CrossbeamReceiver;
use crossbeam_channel::SendError;
use crossbeam_channel::Sender as CrossbeamSender;
use log::{debug, trace, warn};
use mio::{Event, Evented, Events, Poll, PollOpt, Ready, Token};
use mio_extras::channel::sync_channel as mio_sync_channel;
use mio_extras::channel::Receiver as MioReceiver;
use snafu::ResultExt;
use std::collections::hash_map::HashMap;
use std::io;
use std::sync::mpsc::TryRecvError;
use std::sync::{Arc, Mutex};
use std::thread::{Builder, JoinHandle};
use std::time::{Duration, Instant};

mod channel_handle;
mod channel_slots;
mod connection_state;
mod content_collector;
mod handshake_state;
mod io_loop_handle;

pub(crate) use channel_handle::{Channel0Handle, ChannelHandle};
use channel_slots::ChannelSlots;
use connection_state::ConnectionState;
use content_collector::ContentCollector;
use handshake_state::HandshakeState;
use io_loop_handle::{IoLoopHandle, IoLoopHandle0};

// Channel ids (u16) are used directly as poll tokens; everything else the
// I/O thread watches lives above that range.
const STREAM: Token = Token(u16::max_value() as usize + 1);
const HEARTBEAT: Token = Token(u16::max_value() as usize + 2);
const ALLOC_CHANNEL: Token = Token(u16::max_value() as usize + 3);

/// Where the I/O thread records why it exited. Handles consult this when
/// their channels to the thread disconnect, so waiters woken by teardown
/// see the underlying failure instead of a generic disconnect.
#[derive(Clone, Default)]
struct FinalResult(Arc<Mutex<Option<Error>>>);

impl FinalResult {
    fn record(&self, err: Error) {
        let mut slot = self.0.lock().unwrap();
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    fn error(&self) -> Error {
        self.0
            .lock()
            .unwrap()
            .clone()
            .unwrap_or(Error::EventLoopDropped)
    }
}

/// Requests from channel handles into the I/O thread.
enum IoLoopMessage {
    /// Append serialized frames to the outbound buffer.
    Send(OutputBuffer),
    /// Append a `connection.close` and seal the buffer; nothing may follow.
    ConnectionClose(OutputBuffer),
    SetReturnHandler(Option<CrossbeamSender<Return>>),
    SetConfirmHandler(Option<CrossbeamSender<Confirm>>),
}

/// Responses from the I/O thread to a channel's RPC waiter.
#[derive(Debug)]
enum ChannelMessage {
    Method(AMQPClass),
    ConsumeOk(String, CrossbeamReceiver<ConsumerMessage>),
    GetOk(Box<Option<Get>>),
}

struct ChannelSlot {
    rx: MioReceiver<IoLoopMessage>,
    tx: CrossbeamSender<Result<ChannelMessage>>,
    collector: ContentCollector,
    consumers: HashMap<String, CrossbeamSender<ConsumerMessage>>,
    return_handler: Option<CrossbeamSender<Return>>,
    confirm_handler: Option<CrossbeamSender<Confirm>>,
    flow: Arc<FlowControl>,
}

impl ChannelSlot {
    fn new(
        mio_channel_bound: usize,
        channel_id: u16,
        io_result: FinalResult,
    ) -> (ChannelSlot, IoLoopHandle) {
        let (mio_tx, mio_rx) = mio_sync_channel(mio_channel_bound);

        // Bound of 2 is intentional. The normal case is at most 1 message
        // in flight (the response to a synchronous RPC), but the server may
        // also close the channel asynchronously, and there must be room to
        // push that error without blocking the I/O thread. If a send to
        // this queue ever does block, something upstream has broken the
        // one-RPC-at-a-time discipline and bailing out is correct.
        let (tx, rx) = crossbeam_channel::bounded(2);

        let flow = Arc::new(FlowControl::new());

        let channel_slot = ChannelSlot {
            rx: mio_rx,
            tx,
            collector: ContentCollector::new(),
            consumers: HashMap::new(),
            return_handler: None,
            confirm_handler: None,
            flow: Arc::clone(&flow),
        };

        let loop_handle = IoLoopHandle::new(channel_id, mio_tx, rx, flow, io_result);

        (channel_slot, loop_handle)
    }
}

struct Channel0Slot {
    common: ChannelSlot,
    blocked_listeners: NotificationListeners<ConnectionBlockedNotification>,
    alloc_chan_req_rx: MioReceiver<Option<u16>>,
    alloc_chan_rep_tx: CrossbeamSender<Result<IoLoopHandle>>,
}

impl Channel0Slot {
    fn new(mio_channel_bound: usize, io_result: FinalResult) -> (Channel0Slot, IoLoopHandle0) {
        let (common_slot, common_handle) = ChannelSlot::new(mio_channel_bound, 0, io_result);
        let (alloc_chan_req_tx, alloc_chan_req_rx) = mio_sync_channel(1);
        let (alloc_chan_rep_tx, alloc_chan_rep_rx) = crossbeam_channel::bounded(1);
        let blocked_listeners = NotificationListeners::new();

        let slot = Channel0Slot {
            common: common_slot,
            blocked_listeners: blocked_listeners.clone(),
            alloc_chan_req_rx,
            alloc_chan_rep_tx,
        };
        let handle = IoLoopHandle0::new(
            common_handle,
            alloc_chan_req_tx,
            alloc_chan_rep_rx,
            blocked_listeners,
        );

        (slot, handle)
    }
}

pub(crate) struct IoLoop {
    poll: Poll,
    connection_timeout: Option<Duration>,
    frame_buffer: FrameBuffer,
    inner: Inner,

    // Bound for buffered outgoing writes. Past the high water mark we stop
    // polling non-0 channels' requests until we drain back below the low
    // water mark; this keeps a fast publisher from ballooning our memory.
    buffered_writes_high_water: usize,
    buffered_writes_low_water: usize,
}

impl IoLoop {
    pub(crate) fn new(tuning: ConnectionTuning) -> Result<Self> {
        let heartbeats = HeartbeatTimers::default();

        let poll = Poll::new().context(CreatePollHandleSnafu)?;
        poll.register(
            &heartbeats.timer,
            HEARTBEAT,
            Ready::readable(),
            PollOpt::edge(),
        )
        .context(RegisterWithPollHandleSnafu)?;

        Ok(IoLoop {
            poll,
            connection_timeout: None,
            frame_buffer: FrameBuffer::new(),
            inner: Inner::new(heartbeats, tuning.mem_channel_bound),
            buffered_writes_high_water: tuning.buffered_writes_high_water,
            buffered_writes_low_water: tuning.buffered_writes_low_water,
        })
    }

    pub(crate) fn start<Auth: Sasl, S: IoStream>(
        mut self,
        stream: S,
        mut options: ConnectionOptions<Auth>,
    ) -> Result<(JoinHandle<Result<()>>, FieldTable, Channel0Handle)> {
        self.poll
            .register(&stream, STREAM, Ready::writable(), PollOpt::edge())
            .context(RegisterWithPollHandleSnafu)?;

        self.connection_timeout = options.connection_timeout.take();
        let (handshake_done_tx, handshake_done_rx) = crossbeam_channel::bounded(1);
        let (ch0_slot, ch0_handle) =
            Channel0Slot::new(self.inner.mio_channel_bound, self.inner.io_result.clone());

        let join_handle = Builder::new()
            .name("coney-io".to_string())
            .spawn(move || self.thread_main(stream, options, handshake_done_tx, ch0_slot))
            .context(ForkFailedSnafu)?;

        IoLoop::wait_for_amqp_handshake(ch0_handle, join_handle, handshake_done_rx)
    }

    fn wait_for_amqp_handshake(
        ch0_handle: IoLoopHandle0,
        join_handle: JoinHandle<Result<()>>,
        handshake_done_rx: CrossbeamReceiver<(usize, FieldTable)>,
    ) -> Result<(JoinHandle<Result<()>>, FieldTable, Channel0Handle)> {
        match handshake_done_rx.recv() {
            Ok((frame_max, server_properties)) => Ok((
                join_handle,
                server_properties,
                Channel0Handle::new(ch0_handle, frame_max),
            )),

            // Sender dropped without sending - the I/O thread failed before
            // finishing the handshake; peel out its final error.
            Err(_) => match join_handle.join() {
                Ok(Ok(())) => {
                    unreachable!("I/O thread ended successfully without completing handshake")
                }
                Ok(Err(err)) => Err(err),
                Err(_) => IoThreadPanicSnafu.fail(),
            },
        }
    }

    fn thread_main<Auth: Sasl, S: IoStream>(
        mut self,
        mut stream: S,
        options: ConnectionOptions<Auth>,
        handshake_done_tx: CrossbeamSender<(usize, FieldTable)>,
        ch0_slot: Channel0Slot,
    ) -> Result<()> {
        let result = self.run(&mut stream, options, handshake_done_tx, ch0_slot);

        // Record why we're exiting, then let every consumer know. Dropping
        // our channel slots afterwards wakes all parked RPC waiters, which
        // read the recorded error.
        let final_error = match &result {
            Ok(()) => Error::ClientClosedConnection,
            Err(err) => err.clone(),
        };
        self.inner.io_result.record(final_error.clone());
        for (_, slot) in self.inner.chan_slots.drain() {
            for (_, tx) in slot.consumers {
                let message = match &result {
                    Ok(()) => ConsumerMessage::ClientClosedConnection,
                    Err(_) => ConsumerMessage::ServerClosedConnection(final_error.clone()),
                };
                let _ = tx.send(message);
            }
        }

        result
    }

    fn run<Auth: Sasl, S: IoStream>(
        &mut self,
        stream: &mut S,
        options: ConnectionOptions<Auth>,
        handshake_done_tx: CrossbeamSender<(usize, FieldTable)>,
        ch0_slot: Channel0Slot,
    ) -> Result<()> {
        self.poll
            .register(
                &ch0_slot.common.rx,
                Token(0),
                Ready::readable(),
                PollOpt::edge(),
            )
            .context(RegisterWithPollHandleSnafu)?;
        self.poll
            .register(
                &ch0_slot.alloc_chan_req_rx,
                ALLOC_CHANNEL,
                Ready::readable(),
                PollOpt::edge(),
            )
            .context(RegisterWithPollHandleSnafu)?;

        let (tune_ok, server_properties) = self.run_amqp_handshake(stream, options)?;
        let channel_max = tune_ok.channel_max;
        match handshake_done_tx.send((tune_ok.frame_max as usize, server_properties)) {
            Ok(_) => (),
            // Connection was dropped before the handshake finished; nothing
            // left to do.
            Err(_) => return Ok(()),
        }
        self.inner.chan_slots.set_channel_max(channel_max);
        self.run_connection(stream, ch0_slot)
    }

    fn run_amqp_handshake<Auth: Sasl, S: IoStream>(
        &mut self,
        stream: &mut S,
        options: ConnectionOptions<Auth>,
    ) -> Result<(amq_protocol::protocol::connection::TuneOk, FieldTable)> {
        let mut state = HandshakeState::Start(options);
        let result = self.run_io_loop(
            stream,
            &mut state,
            Self::handle_handshake_event,
            false,
            Self::is_handshake_done,
        );
        if let Err(err) = result {
            // Servers without authentication_failure_close just drop the
            // socket after start-ok; failing between start-ok and tune
            // almost always means bad credentials.
            return match state {
                HandshakeState::Secure(_, _) => InvalidCredentialsSnafu.fail(),
                _ => Err(err),
            };
        }
        self.connection_timeout = None;
        match state {
            HandshakeState::Start(_)
            | HandshakeState::Secure(_, _)
            | HandshakeState::Tune(_, _)
            | HandshakeState::Open(_, _) => unreachable!("handshake cannot finish mid-state"),
            HandshakeState::Done(tune_ok, server_properties) => Ok((tune_ok, server_properties)),
            HandshakeState::ServerClosing(close) => {
                // 403 before open-ok is an authentication failure from a
                // server speaking authentication_failure_close.
                if close.reply_code == 403 {
                    InvalidCredentialsSnafu.fail()
                } else {
                    ServerClosedConnectionSnafu {
                        code: AmqpReplyCode::from_code(close.reply_code),
                        message: close.reply_text,
                    }
                    .fail()
                }
            }
        }
    }

    fn handle_handshake_event<Auth: Sasl, S: IoStream>(
        &mut self,
        stream: &mut S,
        state: &mut HandshakeState<Auth>,
        event: Event,
    ) -> Result<()> {
        match event.token() {
            STREAM => {
                if event.readiness().is_writable() {
                    self.inner.write_to_stream(stream)?;
                }
                if event.readiness().is_readable() {
                    self.inner
                        .read_from_stream(stream, &mut self.frame_buffer, |inner, frame| {
                            state.process(inner, frame)
                        })?;
                }
            }
            HEARTBEAT => self.inner.process_heartbeat_timers()?,
            _ => unreachable!("no channels exist during the handshake"),
        }
        Ok(())
    }

    fn is_handshake_done<Auth: Sasl>(&self, state: &HandshakeState<Auth>) -> bool {
        match state {
            HandshakeState::Start(_)
            | HandshakeState::Secure(_, _)
            | HandshakeState::Tune(_, _)
            | HandshakeState::Open(_, _) => false,
            HandshakeState::Done(_, _) => true,
            HandshakeState::ServerClosing(_) => {
                // server rejected us (e.g. bad vhost); wait for our close-ok
                // to drain before reporting done
                assert!(
                    self.inner.are_writes_sealed(),
                    "writes must be sealed after a server close request"
                );
                !self.inner.has_data_to_write()
            }
        }
    }

    fn run_connection<S: IoStream>(&mut self, stream: &mut S, ch0_slot: Channel0Slot) -> Result<()> {
        let mut state = ConnectionState::Steady(ch0_slot);
        self.run_io_loop(
            stream,
            &mut state,
            Self::handle_steady_event,
            true,
            Self::is_connection_done,
        )?;
        match state {
            ConnectionState::Steady(_) => unreachable!("connection cannot finish in steady state"),
            ConnectionState::ServerClosing(close) => ServerClosedConnectionSnafu {
                code: AmqpReplyCode::from_code(close.reply_code),
                message: close.reply_text,
            }
            .fail(),
            ConnectionState::ClientException => ClientExceptionSnafu.fail(),
            ConnectionState::ClientClosed => Ok(()),
        }
    }

    fn handle_steady_event<S: IoStream>(
        &mut self,
        stream: &mut S,
        state: &mut ConnectionState,
        event: Event,
    ) -> Result<()> {
        match event.token() {
            STREAM => {
                if event.readiness().is_writable() {
                    self.inner.write_to_stream(stream)?;
                }
                if event.readiness().is_readable() {
                    self.inner
                        .read_from_stream(stream, &mut self.frame_buffer, |inner, frame| {
                            state.process(inner, frame)
                        })?;
                }
            }
            HEARTBEAT => self.inner.process_heartbeat_timers()?,
            ALLOC_CHANNEL => match &*state {
                ConnectionState::Steady(ch0_slot) => {
                    self.inner.allocate_channel(ch0_slot, &self.poll)?
                }
                _ => unreachable!("ch0 slot cannot be readable after it is dropped"),
            },
            Token(0) => match &*state {
                ConnectionState::Steady(ch0_slot) => {
                    self.inner.handle_channel0_readable(ch0_slot)?
                }
                _ => unreachable!("ch0 slot cannot be readable after it is dropped"),
            },
            Token(n) if n <= u16::max_value() as usize => {
                self.inner.handle_channel_readable(n as u16)?
            }
            _ => unreachable!("unknown poll token"),
        }
        Ok(())
    }

    fn is_connection_done(&self, state: &ConnectionState) -> bool {
        match state {
            ConnectionState::Steady(_) => false,
            ConnectionState::ClientClosed => true,
            ConnectionState::ServerClosing(_) | ConnectionState::ClientException => {
                // mid-close; not done until our close / close-ok drains
                assert!(
                    self.inner.are_writes_sealed(),
                    "writes must be sealed when tearing down"
                );
                !self.inner.has_data_to_write()
            }
        }
    }

    fn run_io_loop<State, S, F, G>(
        &mut self,
        stream: &mut S,
        state: &mut State,
        mut handle_event: F,
        mut have_written_to_socket: bool,
        is_done: G,
    ) -> Result<()>
    where
        S: Evented,
        F: FnMut(&mut Self, &mut S, &mut State, Event) -> Result<()>,
        G: Fn(&Self, &State) -> bool,
    {
        // The socket may currently be registered for writes only (fresh
        // connection that still owes the protocol header) or reads only.
        // Note that on Windows we must not register for readable before the
        // first write has gone out, or we get spurious readable wakeups
        // that turn into NotConnected errors; have_written_to_socket tracks
        // that.
        if self.inner.has_data_to_write() && have_written_to_socket {
            trace!("reregistering socket for readable|writable");
            self.poll
                .reregister(
                    stream,
                    STREAM,
                    Ready::readable() | Ready::writable(),
                    PollOpt::edge(),
                )
                .context(RegisterWithPollHandleSnafu)?;
        }

        let mut events = Events::with_capacity(128);
        let mut listening_to_channels = true;
        loop {
            let start_poll = Instant::now();
            self.poll
                .poll(&mut events, self.connection_timeout)
                .context(FailedToPollSnafu)?;
            if events.is_empty() {
                if let Some(timeout) = &self.connection_timeout {
                    if start_poll.elapsed() > *timeout {
                        return ConnectionTimeoutSnafu.fail();
                    }
                }
                continue;
            }

            let had_data_to_write = self.inner.has_data_to_write();

            for event in events.iter() {
                handle_event(self, stream, state, event)?;
            }

            if is_done(self, state) {
                return Ok(());
            }

            // Apply outbound back-pressure: past the high water mark stop
            // listening to non-0 channels until the buffer drains below the
            // low water mark.
            if listening_to_channels && self.inner.outbuf.len() > self.buffered_writes_high_water {
                debug!("passed high water mark for buffered writes; pausing channels");
                self.inner.deregister_nonzero_channels(&self.poll)?;
                listening_to_channels = false;
            } else if !listening_to_channels
                && self.inner.outbuf.len() <= self.buffered_writes_low_water
            {
                debug!("drained below low water mark for buffered writes; resuming channels");
                self.inner.reregister_nonzero_channels(&self.poll)?;
                listening_to_channels = true;
            }

            // If we have data to write, reregister for readable|writable.
            // This can be spurious, but if we wrote everything without a
            // WouldBlock and then queued more data later in the same pass,
            // mio won't wake us again unless we reregister. If we don't
            // have data, drop back to readable-only once.
            if self.inner.has_data_to_write() && have_written_to_socket {
                trace!("reregistering socket for readable|writable");
                self.poll
                    .reregister(
                        stream,
                        STREAM,
                        Ready::readable() | Ready::writable(),
                        PollOpt::edge(),
                    )
                    .context(RegisterWithPollHandleSnafu)?;
            } else if had_data_to_write {
                trace!("reregistering socket for readable only");
                have_written_to_socket = true;
                self.poll
                    .reregister(stream, STREAM, Ready::readable(), PollOpt::edge())
                    .context(RegisterWithPollHandleSnafu)?;
            }
        }
    }
}

struct Inner {
    // Serialized frames waiting to be written. Sealed once a connection
    // close or close-ok is appended.
    outbuf: SealableOutputBuffer,

    // Deadlines for both heartbeat directions.
    heartbeats: HeartbeatTimers,

    // Slots for open channels, including channel 0 once the handshake is
    // done.
    chan_slots: ChannelSlots<ChannelSlot>,

    // Bound for the mio channels carrying requests into the I/O thread.
    // (Channels going the other way are unbounded so the I/O thread never
    // blocks on a slow client.)
    mio_channel_bound: usize,

    // False while non-0 channels are deregistered for back-pressure.
    channels_are_registered: bool,

    // Shared record of the thread's exit reason.
    io_result: FinalResult,
}

impl Inner {
    fn new(heartbeats: HeartbeatTimers, mio_channel_bound: usize) -> Self {
        Inner {
            outbuf: SealableOutputBuffer::new(OutputBuffer::with_protocol_header()),
            heartbeats,
            chan_slots: ChannelSlots::new(),
            mio_channel_bound,
            channels_are_registered: true,
            io_result: FinalResult::default(),
        }
    }

    #[inline]
    fn are_writes_sealed(&self) -> bool {
        self.outbuf.is_sealed()
    }

    #[inline]
    fn seal_writes(&mut self) {
        trace!("sealing writes - no more data may be enqueued");
        self.outbuf.seal();
    }

    #[inline]
    fn push_method<M: IntoAmqpClass>(&mut self, channel_id: u16, method: M) -> Result<()> {
        self.outbuf.push_method(channel_id, method)
    }

    #[inline]
    fn start_heartbeats(&mut self, interval: u16) {
        if interval > 0 {
            self.heartbeats
                .start(Duration::from_secs(u64::from(interval)));
        }
    }

    #[inline]
    fn has_data_to_write(&self) -> bool {
        !self.outbuf.is_empty()
    }

    fn deregister_nonzero_channels(&mut self, poll: &Poll) -> Result<()> {
        for (id, slot) in self.chan_slots.iter() {
            if *id != 0 {
                poll.deregister(&slot.rx)
                    .context(DeregisterWithPollHandleSnafu)?;
            }
        }
        self.channels_are_registered = false;
        Ok(())
    }

    fn reregister_nonzero_channels(&mut self, poll: &Poll) -> Result<()> {
        for (id, slot) in self.chan_slots.iter() {
            if *id != 0 {
                poll.reregister(
                    &slot.rx,
                    Token(*id as usize),
                    Ready::readable(),
                    PollOpt::edge(),
                )
                .context(RegisterWithPollHandleSnafu)?;
            }
        }
        self.channels_are_registered = true;
        Ok(())
    }

    fn process_heartbeat_timers(&mut self) -> Result<()> {
        let Inner {
            heartbeats, outbuf, ..
        } = self;
        heartbeats.process(|| {
            // a tx interval passed with nothing sent; if data is already
            // queued there's no point adding a heartbeat on top of it
            if outbuf.is_empty() {
                debug!("sending heartbeat");
                outbuf.push_heartbeat();
            } else {
                warn!("tx heartbeat fired with data still queued to write - possible socket problem");
            }
        })
    }

    fn handle_channel0_readable(&mut self, ch0_slot: &Channel0Slot) -> Result<()> {
        loop {
            match ch0_slot.common.rx.try_recv() {
                Ok(message) => self.process_channel_message(0, message)?,
                Err(TryRecvError::Empty) => return Ok(()),
                Err(TryRecvError::Disconnected) => return EventLoopClientDroppedSnafu.fail(),
            }
        }
    }

    fn handle_channel_readable(&mut self, channel_id: u16) -> Result<()> {
        loop {
            match self.chan_slots.get(channel_id) {
                Some(slot) => match slot.rx.try_recv() {
                    Ok(message) => self.process_channel_message(channel_id, message)?,
                    Err(TryRecvError::Empty) => return Ok(()),
                    Err(TryRecvError::Disconnected) => return EventLoopClientDroppedSnafu.fail(),
                },
                None => {
                    // A readable event can outlive its channel: the server
                    // may have closed the channel within this same poll
                    // batch, removing the slot. The handle learns its fate
                    // through the message we left in its waiter.
                    return Ok(());
                }
            }
        }
    }

    fn process_channel_message(&mut self, channel_id: u16, message: IoLoopMessage) -> Result<()> {
        match message {
            IoLoopMessage::Send(buf) => {
                self.outbuf.append(buf);
            }
            IoLoopMessage::ConnectionClose(buf) => {
                self.outbuf.append(buf);
                self.seal_writes();
            }
            IoLoopMessage::SetReturnHandler(handler) => {
                assert!(channel_id != 0, "channel 0 cannot have a return handler");
                // unwrap is safe - we were just called because this slot's
                // receiver was readable.
                let slot = self.chan_slots.get_mut(channel_id).unwrap();
                slot.return_handler = handler;
            }
            IoLoopMessage::SetConfirmHandler(handler) => {
                assert!(channel_id != 0, "channel 0 cannot have a confirm handler");
                let slot = self.chan_slots.get_mut(channel_id).unwrap();
                slot.confirm_handler = handler;
            }
        }
        Ok(())
    }

    fn allocate_channel(&mut self, ch0_slot: &Channel0Slot, poll: &Poll) -> Result<()> {
        loop {
            let new_channel_id = match ch0_slot.alloc_chan_req_rx.try_recv() {
                Ok(new_channel_id) => new_channel_id,
                Err(TryRecvError::Empty) => return Ok(()),
                Err(TryRecvError::Disconnected) => return EventLoopClientDroppedSnafu.fail(),
            };

            let mio_channel_bound = self.mio_channel_bound;
            let channels_are_registered = self.channels_are_registered;
            let io_result = self.io_result.clone();
            let result = self.chan_slots.insert(new_channel_id, |new_channel_id| {
                let (slot, handle) =
                    ChannelSlot::new(mio_channel_bound, new_channel_id, io_result);
                poll.register(
                    &slot.rx,
                    Token(new_channel_id as usize),
                    Ready::readable(),
                    PollOpt::edge(),
                )
                .context(RegisterWithPollHandleSnafu)?;
                if !channels_are_registered {
                    // We're in a back-pressure pause. Register+deregister so
                    // the later blanket reregister call is valid for this
                    // new channel too.
                    poll.deregister(&slot.rx)
                        .context(DeregisterWithPollHandleSnafu)?;
                }
                Ok((slot, handle))
            });
            match ch0_slot.alloc_chan_rep_tx.send(result) {
                Ok(()) => (),
                Err(SendError(Ok(handle))) => {
                    // requester vanished - free the id we just allocated
                    self.chan_slots.remove(handle.channel_id());
                }
                Err(SendError(Err(_))) => {
                    // requester vanished and allocation had failed anyway
                }
            }
        }
    }

    fn read_from_stream<S, F>(
        &mut self,
        stream: &mut S,
        frame_buffer: &mut FrameBuffer,
        mut handler: F,
    ) -> Result<()>
    where
        S: IoStream,
        F: FnMut(&mut Inner, AMQPFrame) -> Result<()>,
    {
        let n = frame_buffer.read_from(stream, |frame| {
            trace!("read frame {:?}", frame);
            if let AMQPFrame::Heartbeat(_) = frame {
                // consumed here; never delivered to channels. Receipt
                // counts as rx activity below like any other frame.
                return Ok(());
            }
            handler(self, frame)
        })?;
        if n > 0 {
            self.heartbeats.record_rx_activity();
        }
        Ok(())
    }

    fn write_to_stream<S: IoStream>(&mut self, stream: &mut S) -> Result<()> {
        let len = self.outbuf.len();
        let mut pos = 0;

        // Write until all len bytes are out or we hit WouldBlock.
        while pos < len {
            trace!("trying to write {} bytes", len - pos);
            let n = match stream.write(&self.outbuf[pos..]) {
                Ok(n) => {
                    trace!("wrote {} bytes", n);
                    self.heartbeats.record_tx_activity();
                    n
                }
                Err(err) => match err.kind() {
                    io::ErrorKind::WouldBlock => {
                        self.outbuf.drain_written(pos);
                        return Ok(());
                    }
                    _ => return Err(err).context(IoErrorWritingSocketSnafu),
                },
            };
            pos += n;
        }

        self.outbuf.clear();
        Ok(())
    }
}
