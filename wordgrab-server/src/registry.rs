//! Process-wide ownership of conversations and players.
//!
//! The registry hands out sessions to connections: it matches public
//! joiners to pending games in their language, creates fresh
//! conversations, resolves invite IDs and rebinds reconnecting players.
//! Everything lives on the reactor thread; connections hold an `Rc` to
//! their session and borrow the conversation per operation.

use rand::rngs::OsRng;
use rand::SeedableRng;
use rand_pcg::Pcg64Mcg;
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info};
use wordgrab::conversation::{Conversation, ConversationState, GameError};
use wordgrab::id::Id;
use wordgrab::id_map::IdMap;
use wordgrab::letters::Language;

/// How often idle conversations are swept.
pub const TICK_INTERVAL: Duration = Duration::from_secs(10);

/// How long a conversation with no attached connections survives.
pub const CONVERSATION_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Hard cap on simultaneously live conversations.
pub const MAX_CONVERSATIONS: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("no conversation with that id")]
    UnknownConversation,

    #[error("no player with that id")]
    UnknownPlayer,

    #[error("too many conversations")]
    ServerFull,

    #[error(transparent)]
    Game(#[from] GameError),
}

/// One live conversation plus the bookkeeping the server keeps around it.
pub struct Session {
    pub conversation: RefCell<Conversation>,
    /// Broadcasts the log's next sequence number so attached connections
    /// wake up and drain.
    events: watch::Sender<u64>,
    /// Number of connections currently bound to this conversation.
    attached: Cell<usize>,
    last_activity: Cell<Instant>,
    /// Whether matchmaking may seat strangers here.
    pending_public: Cell<bool>,
    created_at: Instant,
}

impl Session {
    fn new(conversation: Conversation, public: bool, now: Instant) -> Rc<Session> {
        Rc::new(Session {
            conversation: RefCell::new(conversation),
            events: watch::channel(0).0,
            attached: Cell::new(0),
            last_activity: Cell::new(now),
            pending_public: Cell::new(public),
            created_at: now,
        })
    }

    /// Wakes every attached connection and refreshes the idle clock.
    /// Called after each successful mutating operation.
    pub fn publish(&self, now: Instant) {
        self.last_activity.set(now);
        let next = self.conversation.borrow().log().next_seq();
        self.events.send_replace(next);
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.events.subscribe()
    }
}

/// A connection's hold on a seat in a session.
pub struct Binding {
    pub session: Rc<Session>,
    pub player_id: Id,
    pub number: u8,
}

impl std::fmt::Debug for Binding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Binding")
            .field("player_id", &self.player_id)
            .field("number", &self.number)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Copy)]
struct Seat {
    conversation: Id,
    number: u8,
}

pub struct Registry {
    conversations: RefCell<IdMap<Rc<Session>>>,
    players: RefCell<IdMap<Seat>>,
    /// Bag-fill randomness. IDs come straight from the OS generator
    /// instead; they must be unguessable.
    bag_rng: RefCell<Pcg64Mcg>,
    shutting_down: Cell<bool>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry {
            conversations: RefCell::new(IdMap::new()),
            players: RefCell::new(IdMap::new()),
            bag_rng: RefCell::new(Pcg64Mcg::from_entropy()),
            shutting_down: Cell::new(false),
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.get()
    }

    /// Shared randomness for bag fills, borrowed per operation.
    pub fn bag_rng(&self) -> &RefCell<Pcg64Mcg> {
        &self.bag_rng
    }

    pub fn conversation_count(&self) -> usize {
        self.conversations.borrow().len()
    }

    /// Seats a brand-new player, matchmaking it into the oldest pending
    /// public conversation for its language or creating one.
    pub fn new_player(
        &self,
        language_code: &str,
        name: &str,
        now: Instant,
    ) -> Result<Binding, RegistryError> {
        let language =
            Language::from_code(language_code).ok_or(GameError::UnknownLanguage)?;

        let session = match self.find_pending_public(language) {
            Some(session) => session,
            None => self.create_conversation(language, true, now)?,
        };

        self.seat_player(session, name, now)
    }

    /// Creates a conversation that matchmaking will never touch. The
    /// creator shares its ID out of band as an invite link.
    pub fn new_private_game(
        &self,
        language_code: &str,
        name: &str,
        now: Instant,
    ) -> Result<Binding, RegistryError> {
        let language =
            Language::from_code(language_code).ok_or(GameError::UnknownLanguage)?;

        let session = self.create_conversation(language, false, now)?;
        self.seat_player(session, name, now)
    }

    /// Seats a player into a specific conversation, public or private.
    pub fn join_game(
        &self,
        conversation_id: Id,
        name: &str,
        now: Instant,
    ) -> Result<Binding, RegistryError> {
        let session = self
            .conversations
            .borrow()
            .get(conversation_id)
            .cloned()
            .ok_or(RegistryError::UnknownConversation)?;

        self.seat_player(session, name, now)
    }

    /// Rebinds a connection to an existing player.
    pub fn reconnect(&self, player_id: Id, now: Instant) -> Result<Binding, RegistryError> {
        let seat = self
            .players
            .borrow()
            .get(player_id)
            .copied()
            .ok_or(RegistryError::UnknownPlayer)?;

        let session = self
            .conversations
            .borrow()
            .get(seat.conversation)
            .cloned()
            .ok_or(RegistryError::UnknownPlayer)?;

        session
            .conversation
            .borrow_mut()
            .reconnect(seat.number)
            .map_err(|_| RegistryError::UnknownPlayer)?;

        session.attached.set(session.attached.get() + 1);
        session.publish(now);

        debug!(player = %player_id, number = seat.number, "player reconnected");

        Ok(Binding {
            session,
            player_id,
            number: seat.number,
        })
    }

    /// Releases a connection's hold on its seat. The player itself
    /// survives for the reconnect grace period (or until swept).
    pub fn release(&self, binding: &Binding, now: Instant) {
        let session = &binding.session;
        session.attached.set(session.attached.get().saturating_sub(1));
        session.conversation.borrow_mut().disconnect(binding.number);
        session.publish(now);
    }

    fn seat_player(
        &self,
        session: Rc<Session>,
        name: &str,
        now: Instant,
    ) -> Result<Binding, RegistryError> {
        let player_id = self.fresh_player_id();
        let conversation_id = session.conversation.borrow().id();

        let number = session
            .conversation
            .borrow_mut()
            .add_player(player_id, name)?;

        self.players.borrow_mut().insert(
            player_id,
            Seat {
                conversation: conversation_id,
                number,
            },
        );

        session.attached.set(session.attached.get() + 1);
        session.publish(now);

        info!(
            conversation = %conversation_id,
            player = %player_id,
            number,
            "seated player"
        );

        Ok(Binding {
            session,
            player_id,
            number,
        })
    }

    fn fresh_player_id(&self) -> Id {
        loop {
            let id = Id::fresh(&mut OsRng);
            if self.players.borrow().get(id).is_none() {
                return id;
            }
        }
    }

    fn create_conversation(
        &self,
        language: Language,
        public: bool,
        now: Instant,
    ) -> Result<Rc<Session>, RegistryError> {
        let mut conversations = self.conversations.borrow_mut();

        if conversations.len() >= MAX_CONVERSATIONS {
            return Err(RegistryError::ServerFull);
        }

        let id = loop {
            let id = Id::fresh(&mut OsRng);
            if conversations.get(id).is_none() {
                break id;
            }
        };

        let session = Session::new(Conversation::new(id, language), public, now);
        conversations.insert(id, session.clone());

        info!(conversation = %id, %language, public, "created conversation");

        Ok(session)
    }

    fn find_pending_public(&self, language: Language) -> Option<Rc<Session>> {
        self.conversations
            .borrow()
            .iter()
            .filter(|(_, session)| {
                if !session.pending_public.get() {
                    return false;
                }
                let conversation = session.conversation.borrow();
                conversation.language() == language
                    && conversation.state() == ConversationState::AwaitingStart
                    && conversation.has_free_seat()
            })
            .min_by_key(|(_, session)| session.created_at)
            .map(|(_, session)| session.clone())
    }

    /// Frees conversations nobody is using: no attached connections and
    /// either idle past the timeout or abandoned by every player.
    pub fn sweep(&self, now: Instant) {
        let mut expired = Vec::new();

        for (id, session) in self.conversations.borrow().iter() {
            if session.attached.get() > 0 {
                continue;
            }

            let idle = now.duration_since(session.last_activity.get()) >= CONVERSATION_IDLE_TIMEOUT;
            let abandoned = {
                let conversation = session.conversation.borrow();
                !conversation.players().is_empty()
                    && conversation.players().iter().all(|p| p.departed)
            };

            if idle || abandoned {
                expired.push(id);
            }
        }

        for id in expired {
            if let Some(session) = self.conversations.borrow_mut().remove(id) {
                let conversation = session.conversation.borrow();
                for player in conversation.players() {
                    self.players.borrow_mut().remove(player.id);
                }
                info!(conversation = %id, "swept idle conversation");
            }
        }
    }

    /// Ends every conversation for server shutdown. Connections drain the
    /// END event and close on their own.
    pub fn shutdown(&self, now: Instant) {
        self.shutting_down.set(true);

        for (_, session) in self.conversations.borrow().iter() {
            session.conversation.borrow_mut().finish_now();
            session.publish(now);
        }
    }
}
