//! One client socket: WebSocket handshake, command decoding, event replay.
//!
//! A connection is a task owning its socket and buffers. After the
//! handshake it waits for an identifying message (new player, private
//! game, join by invite, or reconnect), binds to a seat through the
//! registry, and then pumps: incoming frames become conversation
//! operations, and the conversation's event log is drained from the
//! connection's cursor into outgoing frames.
//!
//! Game-rule failures are dropped silently (the client raced against
//! state it had not seen); wire-level failures close the connection with
//! a code describing the kind.

use crate::registry::{Binding, Registry, RegistryError};
use crate::ws;
use bytes::{Buf, BytesMut};
use derive_more::Display;
use futures::future;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, info_span, Instrument};
use wordgrab::conversation::{ErrorKind, GameError};
use wordgrab::event::{Event, Lookup, Snapshot};
use wordgrab::letters::Language;
use wordgrab::proto::{ClientMessage, ServerMessage};

/// How long a silent peer is kept before the connection is dropped. The
/// player survives and may reconnect.
pub const RECONNECT_GRACE: Duration = Duration::from_secs(90);

/// How long the outgoing side may be quiet before a keep-alive ping.
pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(60);

/// How much encoded output is built up before it must be flushed.
const OUTPUT_CHUNK: usize = 64 * 1024;

/// Grace given to the final flush of a closing connection.
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Close code sent for WebSocket-level framing errors.
const CLOSE_BAD_FRAME: u16 = 4000;

/// Identifier for a connection, for logging only.
///
/// Unlike player and conversation IDs these are just a counter; they are
/// never sent to anyone.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
#[display(fmt = "{}", _0)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> ConnectionId {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        ConnectionId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Why a connection stopped.
#[derive(Debug)]
enum Exit {
    /// The peer closed (close frame or EOF).
    PeerClosed,

    /// Nothing was read for the whole grace period.
    IdleTimeout,

    /// The peer broke the protocol; the code describes how.
    WireError(u16),

    /// The peer asked for something that cannot exist (unknown
    /// conversation, full game, ...). An END message was queued.
    Refused,

    /// The server is shutting down and the backlog has been flushed.
    ShuttingDown,

    Io(std::io::Error),
}

impl From<std::io::Error> for Exit {
    fn from(e: std::io::Error) -> Exit {
        Exit::Io(e)
    }
}

enum Wake {
    Read(usize),
    Events,
    Deadline,
}

/// Runs one client connection to completion.
pub async fn run<S>(stream: S, registry: Rc<Registry>, shutdown: watch::Receiver<bool>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let id = ConnectionId::next();

    async move {
        let mut connection = Connection::new(stream, registry);
        let exit = connection.drive(shutdown).await;

        match &exit {
            Exit::PeerClosed => debug!("peer closed the connection"),
            Exit::IdleTimeout => info!("closing idle connection"),
            Exit::WireError(code) => info!(code = *code, "closing connection after protocol error"),
            Exit::Refused => info!("refused session request"),
            Exit::ShuttingDown => debug!("connection drained for shutdown"),
            Exit::Io(e) => info!(error = %e, "connection failed"),
        }

        connection.close(exit).await;
    }
    .instrument(info_span!("connection", %id))
    .await
}

struct Connection<S> {
    stream: S,
    registry: Rc<Registry>,

    /// Raw bytes from the socket, before WebSocket deframing.
    input: BytesMut,
    /// Binary frame payloads waiting to be decoded as messages.
    messages: BytesMut,
    /// Encoded frames waiting to be written.
    output: BytesMut,
    /// Scratch buffer for encoding one message payload.
    scratch: BytesMut,

    handshaken: bool,
    binding: Option<Binding>,
    events_rx: Option<watch::Receiver<u64>>,
    next_event: u64,

    last_read: Instant,
    last_sent: Instant,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn new(stream: S, registry: Rc<Registry>) -> Connection<S> {
        let now = Instant::now();
        Connection {
            stream,
            registry,
            input: BytesMut::new(),
            messages: BytesMut::new(),
            output: BytesMut::new(),
            scratch: BytesMut::new(),
            handshaken: false,
            binding: None,
            events_rx: None,
            next_event: 0,
            last_read: now,
            last_sent: now,
        }
    }

    async fn drive(&mut self, mut shutdown: watch::Receiver<bool>) -> Exit {
        match self.drive_loop(&mut shutdown).await {
            Ok(never) => match never {},
            Err(exit) => exit,
        }
    }

    async fn drive_loop(
        &mut self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<std::convert::Infallible, Exit> {
        loop {
            if !self.handshaken {
                self.try_handshake()?;
            }
            if self.handshaken {
                self.process_input()?;
                self.pump_events();
            }
            self.flush().await?;

            if self.registry.is_shutting_down() && self.drained() {
                return Err(Exit::ShuttingDown);
            }

            let deadline = self.next_deadline();
            let wake = {
                let Connection {
                    stream,
                    input,
                    events_rx,
                    ..
                } = self;

                tokio::select! {
                    read = stream.read_buf(input) => Wake::Read(read?),
                    _ = wait_for_events(events_rx) => Wake::Events,
                    _ = wait_for_shutdown(shutdown) => Wake::Events,
                    _ = tokio::time::sleep_until(deadline) => Wake::Deadline,
                }
            };

            match wake {
                Wake::Read(0) => return Err(Exit::PeerClosed),
                Wake::Read(_) => self.last_read = Instant::now(),
                Wake::Events => {}
                Wake::Deadline => self.handle_deadlines()?,
            }
        }
    }

    /// Consumes the upgrade request once it is complete and queues the
    /// 101 response.
    fn try_handshake(&mut self) -> Result<(), Exit> {
        match ws::try_parse_handshake(&self.input) {
            Ok(None) => Ok(()),
            Ok(Some((handshake, used))) => {
                self.input.advance(used);
                self.output
                    .extend_from_slice(ws::handshake_response(&handshake).as_bytes());
                self.last_sent = Instant::now();
                self.handshaken = true;
                debug!("websocket handshake complete");
                Ok(())
            }
            Err(e) => {
                info!(error = %e, "bad websocket handshake");
                self.output
                    .extend_from_slice(b"HTTP/1.1 400 Bad Request\r\n\r\n");
                Err(Exit::WireError(CLOSE_BAD_FRAME))
            }
        }
    }

    /// Deframes buffered input and applies every complete message.
    fn process_input(&mut self) -> Result<(), Exit> {
        loop {
            let (frame, used) = match ws::try_decode_frame(&self.input) {
                Ok(Some(decoded)) => decoded,
                Ok(None) => break,
                Err(e) => {
                    info!(error = %e, "bad websocket frame");
                    return Err(Exit::WireError(CLOSE_BAD_FRAME));
                }
            };
            self.input.advance(used);

            match frame {
                ws::Frame::Binary(payload) => self.messages.extend_from_slice(&payload),
                ws::Frame::Ping(payload) => {
                    ws::encode_pong(&payload, &mut self.output);
                    self.last_sent = Instant::now();
                }
                ws::Frame::Pong(_) => {}
                ws::Frame::Close { .. } => return Err(Exit::PeerClosed),
            }
        }

        loop {
            let (message, used) = match ClientMessage::decode(&self.messages) {
                Ok(Some(decoded)) => decoded,
                Ok(None) => break,
                Err(e) => {
                    info!(error = %e, "bad message");
                    return Err(Exit::WireError(e.close_code()));
                }
            };
            self.messages.advance(used);
            self.apply(message)?;
        }

        Ok(())
    }

    fn apply(&mut self, message: ClientMessage) -> Result<(), Exit> {
        if self.binding.is_none() {
            self.apply_header(message)
        } else {
            self.apply_command(message)
        }
    }

    /// Handles the identifying message that binds this connection to a
    /// seat.
    fn apply_header(&mut self, message: ClientMessage) -> Result<(), Exit> {
        let now = Instant::now().into_std();

        match message {
            ClientMessage::NewPlayer { language, name } => {
                let binding = self
                    .registry
                    .new_player(&language, &name, now)
                    .map_err(|e| self.refuse(e))?;
                self.bind(binding, None, false);
            }
            ClientMessage::NewPrivateGame { language, name } => {
                let binding = self
                    .registry
                    .new_private_game(&language, &name, now)
                    .map_err(|e| self.refuse(e))?;
                self.bind(binding, None, true);
            }
            ClientMessage::JoinGame {
                conversation_id,
                name,
            } => {
                let binding = self
                    .registry
                    .join_game(conversation_id, &name, now)
                    .map_err(|e| self.refuse(e))?;
                self.bind(binding, None, false);
            }
            ClientMessage::Reconnect {
                player_id,
                next_event,
            } => {
                let binding = self
                    .registry
                    .reconnect(player_id, now)
                    .map_err(|e| self.refuse(e))?;
                self.bind(binding, Some(next_event), false);
            }
            ClientMessage::KeepAlive => {}
            other => {
                info!(?other, "command before the connection was identified");
                return Err(Exit::WireError(CLOSE_BAD_FRAME));
            }
        }

        Ok(())
    }

    fn refuse(&mut self, error: RegistryError) -> Exit {
        info!(%error, "cannot bind connection");
        self.queue_message(&ServerMessage::End {
            seq: self.next_event as u16,
        });
        Exit::Refused
    }

    fn bind(&mut self, binding: Binding, requested: Option<u16>, announce_invite: bool) {
        let conversation_id = binding.session.conversation.borrow().id();

        self.next_event = {
            let conversation = binding.session.conversation.borrow();
            match requested {
                // A reconnecting client says which event it needs next;
                // anything already compacted falls back to the baseline.
                Some(wire_seq) => conversation.log().resolve_wire_seq(wire_seq),
                // A fresh player replays the conversation from the top.
                None => conversation.log().base_seq(),
            }
        };

        if requested.is_none() {
            self.queue_message(&ServerMessage::PlayerId {
                player_id: binding.player_id,
                conversation_id,
                number: binding.number,
            });
        }
        if announce_invite {
            self.queue_message(&ServerMessage::ConversationId { conversation_id });
        }

        self.events_rx = Some(binding.session.subscribe());
        self.binding = Some(binding);
    }

    /// Applies a game command from a bound connection.
    fn apply_command(&mut self, message: ClientMessage) -> Result<(), Exit> {
        let now = Instant::now().into_std();
        let binding = self.binding.as_ref().unwrap();
        let session = binding.session.clone();
        let number = binding.number;

        let result = match message {
            ClientMessage::KeepAlive => Ok(()),
            ClientMessage::Leave => session.conversation.borrow_mut().leave(number),
            ClientMessage::Shout => {
                let rng = self.registry.bag_rng();
                session
                    .conversation
                    .borrow_mut()
                    .shout(number, now, &mut *rng.borrow_mut())
            }
            ClientMessage::Turn => {
                let rng = self.registry.bag_rng();
                session
                    .conversation
                    .borrow_mut()
                    .turn(number, &mut *rng.borrow_mut())
            }
            ClientMessage::MoveTile { index, x, y } => session
                .conversation
                .borrow_mut()
                .move_tile(number, index, x, y),
            ClientMessage::SendMessage { text } => {
                session.conversation.borrow_mut().send_message(number, &text)
            }
            ClientMessage::SetTyping { typing } => {
                session.conversation.borrow_mut().set_typing(number, typing)
            }
            ClientMessage::SetNTiles { n } => {
                session.conversation.borrow_mut().set_n_tiles(number, n)
            }
            ClientMessage::SetLanguage { code } => match Language::from_code(&code) {
                Some(language) => session
                    .conversation
                    .borrow_mut()
                    .set_language(number, language),
                None => Err(GameError::UnknownLanguage),
            },
            other => {
                info!(?other, "identifying message on a bound connection");
                return Err(Exit::WireError(CLOSE_BAD_FRAME));
            }
        };

        match result {
            Ok(()) => {
                session.publish(now);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::Rule => {
                // The client is allowed to race; it learns the real state
                // from the event log.
                debug!(error = %e, "dropped command");
                Ok(())
            }
            Err(e) => Err(self.refuse(RegistryError::Game(e))),
        }
    }

    /// Drains events from the conversation log into the output buffer,
    /// stopping at the chunk size so the socket applies backpressure.
    fn pump_events(&mut self) {
        let Some(binding) = &self.binding else {
            return;
        };
        let session = binding.session.clone();

        while self.output.len() < OUTPUT_CHUNK {
            let event = {
                let conversation = session.conversation.borrow();
                match conversation.event(self.next_event) {
                    Lookup::Event(event) => event.clone(),
                    Lookup::Compacted => {
                        // The ring moved past our cursor; restart at the
                        // baseline, which holds a snapshot.
                        self.next_event = conversation.log().base_seq();
                        continue;
                    }
                    Lookup::NotYet => break,
                }
            };

            let seq = self.next_event as u16;
            self.queue_event(seq, &event);
            self.next_event += 1;
        }
    }

    fn queue_event(&mut self, seq: u16, event: &Event) {
        match event {
            Event::PlayerAdded { number, name } => {
                self.queue_message(&ServerMessage::PlayerName {
                    seq,
                    number: *number,
                    name: name.clone(),
                });
            }
            Event::PlayerFlags { number, flags } => {
                self.queue_message(&ServerMessage::PlayerFlags {
                    seq,
                    number: *number,
                    flags: flags.bits(),
                });
            }
            Event::TileChanged {
                index,
                x,
                y,
                letter,
                last_player,
            } => {
                self.queue_message(&ServerMessage::Tile {
                    seq,
                    index: *index,
                    x: *x,
                    y: *y,
                    letter: (*letter).to_owned(),
                    last_player: *last_player,
                });
            }
            Event::Shout { number } => {
                self.queue_message(&ServerMessage::PlayerShouted {
                    seq,
                    number: *number,
                });
            }
            Event::Message { number, text } => {
                self.queue_message(&ServerMessage::Message {
                    seq,
                    number: *number,
                    text: text.clone(),
                });
            }
            Event::NTiles { n } => {
                self.queue_message(&ServerMessage::NTiles { seq, n: *n });
            }
            Event::Language { language } => {
                self.queue_message(&ServerMessage::Language {
                    seq,
                    code: language.code().to_owned(),
                });
            }
            Event::End => {
                self.queue_message(&ServerMessage::End { seq });
            }
            Event::Sync { snapshot } => self.queue_snapshot(seq, snapshot),
        }
    }

    /// Expands a compaction snapshot into the wire messages that rebuild
    /// client state, closed by a SYNC marker. Catch-up then continues at
    /// the following sequence number.
    fn queue_snapshot(&mut self, seq: u16, snapshot: &Snapshot) {
        self.queue_message(&ServerMessage::Language {
            seq,
            code: snapshot.language.code().to_owned(),
        });
        self.queue_message(&ServerMessage::NTiles {
            seq,
            n: snapshot.n_tile_targets,
        });

        for player in &snapshot.players {
            self.queue_message(&ServerMessage::PlayerName {
                seq,
                number: player.number,
                name: player.name.clone(),
            });
            self.queue_message(&ServerMessage::PlayerFlags {
                seq,
                number: player.number,
                flags: player.flags.bits(),
            });
        }

        for tile in &snapshot.tiles {
            self.queue_message(&ServerMessage::Tile {
                seq,
                index: tile.index,
                x: tile.x,
                y: tile.y,
                letter: tile.letter.to_owned(),
                last_player: tile.last_player,
            });
        }

        if snapshot.finished {
            self.queue_message(&ServerMessage::End { seq });
        }

        self.queue_message(&ServerMessage::Sync { seq });
    }

    fn queue_message(&mut self, message: &ServerMessage) {
        self.scratch.clear();
        message.encode(&mut self.scratch);
        ws::encode_binary(&self.scratch, &mut self.output);
        self.last_sent = Instant::now();
    }

    async fn flush(&mut self) -> Result<(), Exit> {
        if self.output.is_empty() {
            return Ok(());
        }
        self.stream.write_all(&self.output).await?;
        self.stream.flush().await?;
        self.output.clear();
        Ok(())
    }

    /// Whether everything there is to send has been sent.
    fn drained(&self) -> bool {
        if !self.output.is_empty() {
            return false;
        }
        match &self.binding {
            Some(binding) => {
                let conversation = binding.session.conversation.borrow();
                matches!(conversation.event(self.next_event), Lookup::NotYet)
            }
            None => true,
        }
    }

    fn next_deadline(&self) -> Instant {
        let idle = self.last_read + RECONNECT_GRACE;
        let keep_alive = self.last_sent + KEEP_ALIVE_INTERVAL;
        idle.min(keep_alive)
    }

    fn handle_deadlines(&mut self) -> Result<(), Exit> {
        let now = Instant::now();

        if now >= self.last_read + RECONNECT_GRACE {
            return Err(Exit::IdleTimeout);
        }

        if now >= self.last_sent + KEEP_ALIVE_INTERVAL && self.output.is_empty() {
            // Nothing to say for a while: a ping proves the connection is
            // alive and solicits a pong that refreshes the peer's clock.
            ws::encode_ping(&mut self.output);
            self.last_sent = now;
        }

        Ok(())
    }

    /// Sends the closing frame for `exit` and releases the seat.
    async fn close(&mut self, exit: Exit) {
        match exit {
            Exit::PeerClosed | Exit::IdleTimeout => ws::encode_close(1000, &mut self.output),
            Exit::Refused => ws::encode_close(1000, &mut self.output),
            Exit::ShuttingDown => ws::encode_close(1001, &mut self.output),
            Exit::WireError(code) if self.handshaken => ws::encode_close(code, &mut self.output),
            Exit::WireError(_) | Exit::Io(_) => {}
        }

        if !self.output.is_empty() {
            let flush = async {
                let _ = self.stream.write_all(&self.output).await;
                let _ = self.stream.shutdown().await;
            };
            let _ = tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, flush).await;
            self.output.clear();
        }

        if let Some(binding) = self.binding.take() {
            self.registry.release(&binding, Instant::now().into_std());
        }
    }
}

/// Waits for new events when bound; pends forever otherwise.
async fn wait_for_events(events_rx: &mut Option<watch::Receiver<u64>>) {
    match events_rx {
        Some(rx) => {
            // An error means the session was dropped, which cannot happen
            // while we hold a binding; treat it as a spurious wakeup.
            let _ = rx.changed().await;
        }
        None => future::pending().await,
    }
}

/// Resolves on the shutdown signal. A closed channel pends instead of
/// spinning; the connection then only exits through its own lifecycle.
async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.changed().await.is_err() {
        future::pending::<()>().await;
    }
}
