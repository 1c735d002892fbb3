//! The authoritative state of one game session.
//!
//! A conversation owns its players, its tiles and its event log. All
//! mutating operations run on the reactor thread with exclusive access;
//! each one validates the request, updates state and appends the events
//! that describe the change. Connections never read conversation state
//! directly to produce output, they only replay the log, so every client
//! observes the same ordering.

use crate::event::{Event, EventLog, Lookup, Snapshot, SnapshotPlayer, SNAPSHOT_FORMAT};
use crate::id::Id;
use crate::letters::{self, Language};
use crate::player::{Player, PlayerFlags};
use crate::tile::{self, Tile};
use rand::RngCore;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Maximum number of seats in a conversation.
pub const MAX_PLAYERS: usize = 6;

/// How long a shout stays exclusive.
pub const SHOUT_INTERVAL: Duration = Duration::from_secs(10);

/// How a failed operation should be treated by the caller.
///
/// Rule errors are races the client is allowed to lose (it acted on state
/// it had not seen updated yet) and are dropped without a reply. Resource
/// errors mean the client cannot have what it asked for at all; the
/// connection reports the end of the session and closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Rule,
    Resource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum GameError {
    #[error("the conversation has no free seat")]
    ConversationFull,

    #[error("the game has already started")]
    GameAlreadyStarted,

    #[error("no such player in this conversation")]
    PlayerGone,

    #[error("it is not this player's turn")]
    NotYourTurn,

    #[error("no tile with that index")]
    UnknownTile,

    #[error("the tile is still in the bag")]
    TileInBag,

    #[error("another shout is still active")]
    ShoutCooldown,

    #[error("the game is over")]
    GameOver,

    #[error("only the first player may change game settings")]
    NotGameOwner,

    #[error("tile count out of range")]
    BadTileCount,

    #[error("unsupported language code")]
    UnknownLanguage,
}

impl GameError {
    pub fn kind(self) -> ErrorKind {
        match self {
            GameError::ConversationFull | GameError::GameAlreadyStarted => ErrorKind::Resource,
            _ => ErrorKind::Rule,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationState {
    AwaitingStart,
    InProgress,
    Finished,
}

pub struct Conversation {
    id: Id,
    language: Language,
    n_tile_targets: u8,
    players: Vec<Player>,
    tiles: Vec<Tile>,
    log: EventLog,
    state: ConversationState,
    shouting_player: Option<u8>,
    shout_expiry: Option<Instant>,
}

impl Conversation {
    pub fn new(id: Id, language: Language) -> Conversation {
        Conversation {
            id,
            language,
            n_tile_targets: letters::FULL_DECK,
            players: Vec::new(),
            tiles: Vec::new(),
            log: EventLog::new(),
            state: ConversationState::AwaitingStart,
            shouting_player: None,
            shout_expiry: None,
        }
    }

    pub fn id(&self) -> Id {
        self.id
    }

    pub fn language(&self) -> Language {
        self.language
    }

    pub fn state(&self) -> ConversationState {
        self.state
    }

    pub fn n_tile_targets(&self) -> u8 {
        self.n_tile_targets
    }

    /// Number of tiles materialized for this game. Zero until the game
    /// starts, then the bag size plus the tiles on the table.
    pub fn n_tiles_in_play(&self) -> u8 {
        self.tiles.len() as u8
    }

    pub fn players(&self) -> &[Player] {
        &self.players
    }

    pub fn tiles(&self) -> &[Tile] {
        &self.tiles
    }

    pub fn log(&self) -> &EventLog {
        &self.log
    }

    pub fn has_free_seat(&self) -> bool {
        self.players.len() < MAX_PLAYERS
    }

    pub fn bag_size(&self) -> usize {
        self.tiles.iter().filter(|t| t.in_bag).count()
    }

    /// The player currently holding an exclusive shout, if any.
    pub fn current_shout(&self, now: Instant) -> Option<u8> {
        match (self.shouting_player, self.shout_expiry) {
            (Some(number), Some(expiry)) if now < expiry => Some(number),
            _ => None,
        }
    }

    fn player(&self, number: u8) -> Result<&Player, GameError> {
        self.players
            .get(number as usize)
            .filter(|p| !p.departed)
            .ok_or(GameError::PlayerGone)
    }

    fn player_mut(&mut self, number: u8) -> Result<&mut Player, GameError> {
        self.players
            .get_mut(number as usize)
            .filter(|p| !p.departed)
            .ok_or(GameError::PlayerGone)
    }

    fn push_event(&mut self, event: Event) -> u64 {
        if self.log.is_full() {
            let snapshot = self.snapshot();
            self.log.compact(snapshot);
        }
        self.log.push(event)
    }

    fn push_flags_event(&mut self, number: u8) {
        let flags = self.players[number as usize].flags;
        self.push_event(Event::PlayerFlags { number, flags });
    }

    /// Seats a new player, returning its number.
    pub fn add_player(&mut self, id: Id, name: &str) -> Result<u8, GameError> {
        if self.state != ConversationState::AwaitingStart {
            return Err(GameError::GameAlreadyStarted);
        }
        if !self.has_free_seat() {
            return Err(GameError::ConversationFull);
        }

        let number = self.players.len() as u8;
        let mut flags = PlayerFlags::default();
        flags.set(PlayerFlags::CONNECTED);
        if number == 0 {
            // The first seat holds the turn marker from the start.
            flags.set(PlayerFlags::NEXT_TURN);
        }

        self.players
            .push(Player::new(id, number, name.to_owned(), flags));
        self.push_event(Event::PlayerAdded {
            number,
            name: name.to_owned(),
        });
        self.push_flags_event(number);

        Ok(number)
    }

    pub fn set_typing(&mut self, number: u8, typing: bool) -> Result<(), GameError> {
        let player = self.player_mut(number)?;

        if player.flags.contains(PlayerFlags::TYPING) == typing {
            return Ok(());
        }

        if typing {
            player.flags.set(PlayerFlags::TYPING);
        } else {
            player.flags.clear(PlayerFlags::TYPING);
        }
        self.push_flags_event(number);

        Ok(())
    }

    /// Appends a chat message. Sending a message always stops the
    /// sender's typing indicator.
    pub fn send_message(&mut self, number: u8, text: &str) -> Result<(), GameError> {
        self.player(number)?;

        self.push_event(Event::Message {
            number,
            text: text.to_owned(),
        });

        if self.players[number as usize]
            .flags
            .contains(PlayerFlags::TYPING)
        {
            self.players[number as usize].flags.clear(PlayerFlags::TYPING);
            self.push_flags_event(number);
        }

        Ok(())
    }

    /// Draws a tile for the player holding the turn marker and passes the
    /// marker on.
    ///
    /// Once the bag is empty a turn command becomes the player's vote to
    /// end the game: no tile event is produced, but the marker still
    /// advances and the game finishes when every connected player has
    /// turned since the last shout.
    pub fn turn(&mut self, number: u8, rng: &mut dyn RngCore) -> Result<(), GameError> {
        let player = self.player(number)?;

        if self.state == ConversationState::Finished {
            return Err(GameError::GameOver);
        }
        if !player.flags.contains(PlayerFlags::NEXT_TURN) {
            return Err(GameError::NotYourTurn);
        }

        self.start_if_needed(rng);

        if let Some(pos) = self.tiles.iter().position(|t| t.in_bag) {
            let nth_on_table = (self.tiles.len() - self.bag_size()) as u8;
            let (x, y) = tile::grid_position(nth_on_table);

            let drawn = &mut self.tiles[pos];
            drawn.in_bag = false;
            drawn.x = x;
            drawn.y = y;
            drawn.last_player = number;

            let event = Event::TileChanged {
                index: drawn.index,
                x,
                y,
                letter: drawn.letter,
                last_player: number,
            };
            self.push_event(event);
        }

        self.players[number as usize].turned_since_shout = true;

        if !self.maybe_finish() {
            self.advance_turn();
        }

        Ok(())
    }

    /// Moves a tile that is already on the table.
    pub fn move_tile(&mut self, number: u8, index: u8, x: i16, y: i16) -> Result<(), GameError> {
        self.player(number)?;

        if self.state == ConversationState::Finished {
            return Err(GameError::GameOver);
        }

        let tile = self
            .tiles
            .get_mut(index as usize)
            .ok_or(GameError::UnknownTile)?;
        if tile.in_bag {
            return Err(GameError::TileInBag);
        }

        tile.x = x;
        tile.y = y;
        tile.last_player = number;

        let event = Event::TileChanged {
            index,
            x,
            y,
            letter: self.tiles[index as usize].letter,
            last_player: number,
        };
        self.push_event(event);

        Ok(())
    }

    /// Claims a word. The first shout to arrive wins; further shouts are
    /// rejected until the interval has passed.
    pub fn shout(
        &mut self,
        number: u8,
        now: Instant,
        rng: &mut dyn RngCore,
    ) -> Result<(), GameError> {
        self.player(number)?;

        if self.state == ConversationState::Finished {
            return Err(GameError::GameOver);
        }
        if let Some(expiry) = self.shout_expiry {
            if now < expiry {
                return Err(GameError::ShoutCooldown);
            }
        }

        self.start_if_needed(rng);

        self.shouting_player = Some(number);
        self.shout_expiry = Some(now + SHOUT_INTERVAL);
        for player in &mut self.players {
            player.turned_since_shout = false;
        }

        self.push_event(Event::Shout { number });
        self.advance_turn();

        Ok(())
    }

    /// Permanently removes a player from play. The seat itself survives
    /// (numbers are stable) but the player leaves the rotation and cannot
    /// reconnect.
    pub fn leave(&mut self, number: u8) -> Result<(), GameError> {
        let player = self.player_mut(number)?;

        let had_turn = player.flags.contains(PlayerFlags::NEXT_TURN);
        player.departed = true;
        player.flags.clear(PlayerFlags::CONNECTED);
        player.flags.clear(PlayerFlags::TYPING);
        player.flags.clear(PlayerFlags::NEXT_TURN);
        self.push_flags_event(number);

        if had_turn {
            self.grant_turn_after(number);
        }
        self.maybe_finish();

        Ok(())
    }

    /// Marks a player's connection as gone without removing it from the
    /// game; the player may still reconnect within the grace period.
    pub fn disconnect(&mut self, number: u8) {
        let Some(player) = self.players.get_mut(number as usize) else {
            return;
        };
        if player.departed || !player.flags.contains(PlayerFlags::CONNECTED) {
            return;
        }

        let had_turn = player.flags.contains(PlayerFlags::NEXT_TURN);
        player.flags.clear(PlayerFlags::CONNECTED);
        player.flags.clear(PlayerFlags::TYPING);
        player.flags.clear(PlayerFlags::NEXT_TURN);
        self.push_flags_event(number);

        if had_turn {
            self.grant_turn_after(number);
        }
        self.maybe_finish();
    }

    /// Restores a player whose connection came back.
    pub fn reconnect(&mut self, number: u8) -> Result<(), GameError> {
        let state = self.state;
        let player = self.player_mut(number)?;

        if player.flags.contains(PlayerFlags::CONNECTED) {
            return Ok(());
        }

        player.flags.set(PlayerFlags::CONNECTED);

        // If everyone was gone the turn marker is unowned; hand it to the
        // player bringing the game back to life.
        let unowned = !self
            .players
            .iter()
            .any(|p| p.flags.contains(PlayerFlags::NEXT_TURN));
        if unowned && state != ConversationState::Finished {
            self.players[number as usize].flags.set(PlayerFlags::NEXT_TURN);
        }

        self.push_flags_event(number);

        Ok(())
    }

    /// Changes the number of tiles for the game. Only the first player may
    /// do this, and only until the game has started.
    pub fn set_n_tiles(&mut self, number: u8, n: u8) -> Result<(), GameError> {
        self.player(number)?;

        if number != 0 {
            return Err(GameError::NotGameOwner);
        }
        if self.state != ConversationState::AwaitingStart {
            return Err(GameError::GameAlreadyStarted);
        }
        if n == 0 || n > letters::FULL_DECK {
            return Err(GameError::BadTileCount);
        }

        self.n_tile_targets = n;
        self.push_event(Event::NTiles { n });

        Ok(())
    }

    /// Changes the language of the game. Same restrictions as
    /// [`set_n_tiles`](Self::set_n_tiles).
    pub fn set_language(&mut self, number: u8, language: Language) -> Result<(), GameError> {
        self.player(number)?;

        if number != 0 {
            return Err(GameError::NotGameOwner);
        }
        if self.state != ConversationState::AwaitingStart {
            return Err(GameError::GameAlreadyStarted);
        }

        self.language = language;
        self.push_event(Event::Language { language });

        Ok(())
    }

    /// Force-finishes the conversation, used at server shutdown. Clients
    /// see a normal end of game.
    pub fn finish_now(&mut self) {
        if self.state == ConversationState::Finished {
            return;
        }
        self.finish();
    }

    fn start_if_needed(&mut self, rng: &mut dyn RngCore) {
        if self.state != ConversationState::AwaitingStart {
            return;
        }

        self.tiles = letters::fill_bag(self.language, self.n_tile_targets, rng);
        self.state = ConversationState::InProgress;
    }

    fn finish(&mut self) {
        if let Some(holder) = self
            .players
            .iter()
            .position(|p| p.flags.contains(PlayerFlags::NEXT_TURN))
        {
            self.players[holder].flags.clear(PlayerFlags::NEXT_TURN);
            self.push_flags_event(holder as u8);
        }

        self.state = ConversationState::Finished;
        self.push_event(Event::End);
    }

    fn maybe_finish(&mut self) -> bool {
        if self.state != ConversationState::InProgress {
            return false;
        }
        if self.tiles.is_empty() || self.tiles.iter().any(|t| t.in_bag) {
            return false;
        }

        let mut any_connected = false;
        for player in &self.players {
            if player.in_rotation() {
                any_connected = true;
                if !player.turned_since_shout {
                    return false;
                }
            }
        }
        if !any_connected {
            return false;
        }

        self.finish();
        true
    }

    /// Moves the turn marker from its current holder to the next connected
    /// player, logging a flags event for both seats (even when they are
    /// the same seat).
    fn advance_turn(&mut self) {
        let Some(holder) = self
            .players
            .iter()
            .position(|p| p.flags.contains(PlayerFlags::NEXT_TURN))
        else {
            return;
        };

        self.players[holder].flags.clear(PlayerFlags::NEXT_TURN);
        self.push_flags_event(holder as u8);
        self.grant_turn_after(holder as u8);
    }

    fn grant_turn_after(&mut self, from: u8) {
        if self.state == ConversationState::Finished {
            return;
        }

        let n = self.players.len();
        let next = (1..=n)
            .map(|i| (from as usize + i) % n)
            .find(|&i| self.players[i].in_rotation());

        if let Some(next) = next {
            self.players[next].flags.set(PlayerFlags::NEXT_TURN);
            self.push_flags_event(next as u8);
        }
    }

    /// Dumps the current state into a compaction baseline.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            format: SNAPSHOT_FORMAT,
            language: self.language,
            n_tile_targets: self.n_tile_targets,
            finished: self.state == ConversationState::Finished,
            players: self
                .players
                .iter()
                .map(|p| SnapshotPlayer {
                    number: p.number,
                    name: p.name.clone(),
                    flags: p.flags,
                })
                .collect(),
            tiles: self.tiles.iter().filter(|t| !t.in_bag).copied().collect(),
        }
    }

    /// Looks up a logged event, for connections replaying the log.
    pub fn event(&self, seq: u64) -> Lookup<'_> {
        self.log.get(seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::player::PlayerFlags as F;
    use rand::SeedableRng;
    use rand_pcg::Pcg64Mcg;

    fn id(raw: u64) -> Id {
        Id::from_raw(raw).unwrap()
    }

    fn conv() -> Conversation {
        Conversation::new(id(1), Language::Esperanto)
    }

    fn rng() -> Pcg64Mcg {
        Pcg64Mcg::seed_from_u64(99)
    }

    fn now() -> Instant {
        Instant::now()
    }

    #[test]
    fn first_player_gets_the_turn_marker() {
        let mut c = conv();

        assert_eq!(c.add_player(id(10), "alice").unwrap(), 0);
        assert_eq!(c.add_player(id(11), "bob").unwrap(), 1);

        assert!(c.players()[0].flags.contains(F::NEXT_TURN));
        assert!(!c.players()[1].flags.contains(F::NEXT_TURN));

        // Seats fill densely.
        for (i, p) in c.players().iter().enumerate() {
            assert_eq!(p.number as usize, i);
        }
    }

    #[test]
    fn conversation_refuses_a_seventh_player() {
        let mut c = conv();
        for i in 0..MAX_PLAYERS {
            c.add_player(id(10 + i as u64), "p").unwrap();
        }
        assert_eq!(
            c.add_player(id(99), "late"),
            Err(GameError::ConversationFull)
        );
    }

    #[test]
    fn joining_a_started_game_is_refused() {
        let mut c = conv();
        c.add_player(id(10), "alice").unwrap();
        c.turn(0, &mut rng()).unwrap();

        assert_eq!(
            c.add_player(id(11), "bob"),
            Err(GameError::GameAlreadyStarted)
        );
        assert_eq!(
            GameError::GameAlreadyStarted.kind(),
            ErrorKind::Resource
        );
    }

    #[test]
    fn first_turn_fills_the_bag_and_draws_one_tile() {
        let mut c = conv();
        c.add_player(id(10), "alice").unwrap();
        c.set_n_tiles(0, 50).unwrap();

        assert_eq!(c.n_tiles_in_play(), 0);
        c.turn(0, &mut rng()).unwrap();

        assert_eq!(c.state(), ConversationState::InProgress);
        assert_eq!(c.n_tiles_in_play(), 50);
        assert_eq!(c.bag_size(), 49);

        let drawn: Vec<&Tile> = c.tiles().iter().filter(|t| !t.in_bag).collect();
        assert_eq!(drawn.len(), 1);
        assert_eq!(drawn[0].last_player, 0);
    }

    #[test]
    fn turn_rotation_skips_disconnected_players() {
        let mut c = conv();
        c.add_player(id(10), "a").unwrap();
        c.add_player(id(11), "b").unwrap();
        c.add_player(id(12), "c").unwrap();

        let mut r = rng();
        c.turn(0, &mut r).unwrap();
        assert!(c.players()[1].flags.contains(F::NEXT_TURN));

        c.disconnect(2);
        c.turn(1, &mut r).unwrap();

        // Seat 2 is disconnected, so the marker wraps back to seat 0.
        assert!(c.players()[0].flags.contains(F::NEXT_TURN));
        assert!(!c.players()[2].flags.contains(F::NEXT_TURN));
    }

    #[test]
    fn turn_is_refused_out_of_order() {
        let mut c = conv();
        c.add_player(id(10), "a").unwrap();
        c.add_player(id(11), "b").unwrap();

        assert_eq!(c.turn(1, &mut rng()), Err(GameError::NotYourTurn));
        assert_eq!(GameError::NotYourTurn.kind(), ErrorKind::Rule);
    }

    #[test]
    fn shout_is_exclusive_for_the_interval() {
        let mut c = conv();
        c.add_player(id(10), "a").unwrap();
        c.add_player(id(11), "b").unwrap();

        let t0 = now();
        let mut r = rng();

        c.shout(0, t0, &mut r).unwrap();
        assert_eq!(c.current_shout(t0), Some(0));

        // A competing shout inside the interval loses.
        assert_eq!(
            c.shout(1, t0 + Duration::from_secs(3), &mut r),
            Err(GameError::ShoutCooldown)
        );

        // After the interval the next shout is accepted.
        c.shout(1, t0 + SHOUT_INTERVAL, &mut r).unwrap();
        assert_eq!(c.current_shout(t0 + SHOUT_INTERVAL), Some(1));
    }

    #[test]
    fn shout_starts_the_game_and_advances_the_marker() {
        let mut c = conv();
        c.add_player(id(10), "a").unwrap();
        c.add_player(id(11), "b").unwrap();

        c.shout(1, now(), &mut rng()).unwrap();

        assert_eq!(c.state(), ConversationState::InProgress);
        // The marker moves from seat 0 to seat 1.
        assert!(c.players()[1].flags.contains(F::NEXT_TURN));
    }

    #[test]
    fn game_ends_when_bag_empty_and_everyone_has_turned() {
        let mut c = conv();
        c.add_player(id(10), "a").unwrap();
        c.add_player(id(11), "b").unwrap();
        c.set_n_tiles(0, 4).unwrap();

        let mut r = rng();
        // Three draws, then a shout wipes the end-of-game votes.
        c.turn(0, &mut r).unwrap();
        c.turn(1, &mut r).unwrap();
        c.turn(0, &mut r).unwrap();
        c.shout(0, now(), &mut r).unwrap();
        assert_eq!(c.bag_size(), 1);

        // The last draw empties the bag, but seat 1 has not turned since
        // the shout, so the game keeps going.
        c.turn(0, &mut r).unwrap();
        assert_eq!(c.bag_size(), 0);
        assert_eq!(c.state(), ConversationState::InProgress);

        // The empty-bag turn completes the vote.
        c.turn(1, &mut r).unwrap();
        assert_eq!(c.state(), ConversationState::Finished);

        // The marker is retired with the game.
        assert!(c.players().iter().all(|p| !p.flags.contains(F::NEXT_TURN)));

        // Only chat-adjacent operations are accepted now.
        assert_eq!(c.turn(0, &mut r), Err(GameError::GameOver));
        assert_eq!(c.move_tile(0, 0, 5, 5), Err(GameError::GameOver));
        assert_eq!(c.shout(0, now(), &mut r), Err(GameError::GameOver));
        c.send_message(0, "gg").unwrap();
        c.set_typing(1, true).unwrap();
        c.leave(0).unwrap();
    }

    #[test]
    fn shout_resets_end_of_game_votes() {
        let mut c = conv();
        c.add_player(id(10), "a").unwrap();
        c.add_player(id(11), "b").unwrap();
        c.set_n_tiles(0, 2).unwrap();

        let mut r = rng();

        c.turn(0, &mut r).unwrap();
        assert_eq!(c.bag_size(), 1);

        // Seat 1 shouts: seat 0's standing vote is wiped and the marker
        // passes back to seat 0.
        c.shout(1, now(), &mut r).unwrap();

        c.turn(0, &mut r).unwrap();
        assert_eq!(c.bag_size(), 0);
        assert_eq!(c.state(), ConversationState::InProgress);

        c.turn(1, &mut r).unwrap();
        assert_eq!(c.state(), ConversationState::Finished);
    }

    #[test]
    fn move_tile_rules() {
        let mut c = conv();
        c.add_player(id(10), "a").unwrap();
        c.set_n_tiles(0, 3).unwrap();
        c.turn(0, &mut rng()).unwrap();

        let on_table = c.tiles().iter().position(|t| !t.in_bag).unwrap() as u8;
        let in_bag = c.tiles().iter().position(|t| t.in_bag).unwrap() as u8;

        c.move_tile(0, on_table, -40, 17).unwrap();
        let tile = c.tiles()[on_table as usize];
        assert_eq!((tile.x, tile.y), (-40, 17));
        assert_eq!(tile.last_player, 0);

        assert_eq!(c.move_tile(0, in_bag, 0, 0), Err(GameError::TileInBag));
        assert_eq!(c.move_tile(0, 200, 0, 0), Err(GameError::UnknownTile));
    }

    #[test]
    fn leaving_hands_over_the_marker_and_blocks_reconnect() {
        let mut c = conv();
        c.add_player(id(10), "a").unwrap();
        c.add_player(id(11), "b").unwrap();

        c.leave(0).unwrap();

        assert!(c.players()[0].departed);
        assert!(!c.players()[0].flags.contains(F::CONNECTED));
        assert!(c.players()[1].flags.contains(F::NEXT_TURN));

        assert_eq!(c.reconnect(0), Err(GameError::PlayerGone));
        assert_eq!(c.send_message(0, "hi"), Err(GameError::PlayerGone));
    }

    #[test]
    fn reconnect_restores_the_marker_to_a_revived_game() {
        let mut c = conv();
        c.add_player(id(10), "a").unwrap();
        c.turn(0, &mut rng()).unwrap();

        c.disconnect(0);
        assert!(c.players().iter().all(|p| !p.flags.contains(F::NEXT_TURN)));

        c.reconnect(0).unwrap();
        assert!(c.players()[0].flags.contains(F::CONNECTED));
        assert!(c.players()[0].flags.contains(F::NEXT_TURN));
    }

    #[test]
    fn settings_are_owner_only_and_pre_start_only() {
        let mut c = conv();
        c.add_player(id(10), "a").unwrap();
        c.add_player(id(11), "b").unwrap();

        assert_eq!(c.set_n_tiles(1, 50), Err(GameError::NotGameOwner));
        assert_eq!(
            c.set_language(1, Language::French),
            Err(GameError::NotGameOwner)
        );
        assert_eq!(c.set_n_tiles(0, 0), Err(GameError::BadTileCount));
        assert_eq!(c.set_n_tiles(0, 123), Err(GameError::BadTileCount));

        c.set_n_tiles(0, 50).unwrap();
        c.set_language(0, Language::French).unwrap();
        assert_eq!(c.language(), Language::French);

        c.turn(0, &mut rng()).unwrap();
        assert_eq!(c.set_n_tiles(0, 122), Err(GameError::GameAlreadyStarted));
        assert_eq!(
            c.set_language(0, Language::English),
            Err(GameError::GameAlreadyStarted)
        );
    }

    #[test]
    fn typing_flag_events_only_fire_on_change() {
        let mut c = conv();
        c.add_player(id(10), "a").unwrap();

        let before = c.log().next_seq();
        c.set_typing(0, true).unwrap();
        assert_eq!(c.log().next_seq(), before + 1);

        // No event when nothing changes.
        c.set_typing(0, true).unwrap();
        assert_eq!(c.log().next_seq(), before + 1);

        // Sending a message clears the indicator with a flags event.
        c.send_message(0, "saluton").unwrap();
        assert_eq!(c.log().next_seq(), before + 3);
        assert!(!c.players()[0].flags.contains(F::TYPING));
    }

    #[test]
    fn snapshot_reflects_visible_state() {
        let mut c = conv();
        c.add_player(id(10), "alice").unwrap();
        c.add_player(id(11), "bob").unwrap();
        c.set_n_tiles(0, 10).unwrap();

        let mut r = rng();
        c.turn(0, &mut r).unwrap();
        c.turn(1, &mut r).unwrap();

        let snapshot = c.snapshot();
        assert_eq!(snapshot.format, SNAPSHOT_FORMAT);
        assert_eq!(snapshot.language, Language::Esperanto);
        assert_eq!(snapshot.n_tile_targets, 10);
        assert!(!snapshot.finished);
        assert_eq!(snapshot.players.len(), 2);
        assert_eq!(snapshot.players[0].name, "alice");
        // Only drawn tiles are dumped.
        assert_eq!(snapshot.tiles.len(), 2);
        assert!(snapshot.tiles.iter().all(|t| !t.in_bag));
    }

    #[test]
    fn log_ordering_matches_operation_order() {
        let mut c = conv();
        c.add_player(id(10), "a").unwrap();

        let base = c.log().next_seq();
        c.send_message(0, "one").unwrap();
        c.send_message(0, "two").unwrap();

        let first = match c.event(base) {
            Lookup::Event(Event::Message { text, .. }) => text.clone(),
            other => panic!("unexpected event {other:?}"),
        };
        let second = match c.event(base + 1) {
            Lookup::Event(Event::Message { text, .. }) => text.clone(),
            other => panic!("unexpected event {other:?}"),
        };
        assert_eq!((first.as_str(), second.as_str()), ("one", "two"));
    }
}
