//! Player identity, roster, and per-player game state
//!
//! This module manages the players of one battle room: their stable
//! identities, validated display names, and the mutable game state
//! (score, streak, combo, lives, power-ups, achievements, answered
//! log) that only the room state machine may touch. The roster
//! preserves join order.

use std::{
    collections::{HashMap, HashSet},
    fmt::Display,
    str::FromStr,
};

use enum_map::EnumMap;
use rustrict::CensorStr;
use serde::{Deserialize, Serialize};
use serde_with::{DeserializeFromStr, SerializeDisplay};
use thiserror::Error;
use uuid::Uuid;
use web_time::SystemTime;

use crate::{
    constants::{display_name::MAX_LENGTH, power_up::USES_PER_GAME, room},
    scoring::Achievement,
};

/// A stable identifier for a player
///
/// Identity is keyed by this id, not by the transport connection, so a
/// dropped and restored real-time connection reconciles into the same
/// player record instead of creating a duplicate.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, DeserializeFromStr, SerializeDisplay,
)]
pub struct Id(Uuid);

impl Id {
    /// Creates a new random player id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for Id {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for Id {
    type Err = uuid::Error;

    /// Parses an id from a UUID string
    ///
    /// # Errors
    ///
    /// Returns a `uuid::Error` if the string is not a valid UUID.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::from_str(s)?))
    }
}

/// Whether a player's real-time connection is currently live
///
/// Disconnection does not mutate the room: the player keeps their
/// slot, their unanswered questions time out normally, and a reconnect
/// restores them in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// The player has a live tunnel
    Connected,
    /// The player's tunnel dropped; they may reconnect by id
    Disconnected,
}

/// The three power-ups every player holds one of per game
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, enum_map::Enum, Serialize, Deserialize)]
pub enum PowerUp {
    /// Removes two incorrect options from that player's view only
    FiftyFifty,
    /// Extends that player's personal deadline for the current question
    TimeFreeze,
    /// Absorbs the life loss of one subsequent miss
    Shield,
}

/// One entry of a player's answered-questions log
///
/// The log carries enough to rebuild score, streak, combo, and lives
/// from scratch; see [`replay_log`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnswerRecord {
    /// Index of the question within the room's bank
    pub question_index: usize,
    /// Stable id of the question
    pub question_id: u32,
    /// The option the player picked, or `None` for a timeout
    pub selected: Option<usize>,
    /// Whether the pick matched the correct option
    pub correct: bool,
    /// Points the scoring engine awarded for this answer
    pub points_earned: u64,
    /// Whether an armed shield absorbed this miss's life loss
    pub shield_absorbed: bool,
}

/// Game state rebuilt from an answered log alone
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayedState {
    /// Total score over the log
    pub score: u64,
    /// Streak after the last entry
    pub streak: u32,
    /// Combo after the last entry
    pub combo: u32,
    /// Lives remaining after the last entry
    pub lives: u8,
}

/// Recomputes a player's game state from their answered log
///
/// The room broadcasts authoritative state, but the log is the ground
/// truth: replaying it must reproduce the same score, streak, combo,
/// and lives the room tracked incrementally.
pub fn replay_log(log: &[AnswerRecord]) -> ReplayedState {
    let mut state = ReplayedState {
        score: 0,
        streak: 0,
        combo: 1,
        lives: room::STARTING_LIVES,
    };
    for record in log {
        if record.correct {
            state.score += record.points_earned;
            state.streak += 1;
            state.combo += 1;
        } else {
            state.streak = 0;
            state.combo = 1;
            if !record.shield_absorbed {
                state.lives = state.lives.saturating_sub(1);
            }
        }
    }
    state
}

/// One player's full state within a room
///
/// Created on join, reset by the room at every game start, and
/// destroyed with the room. Only the room state machine mutates it,
/// and only in response to validated events for this player.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Player {
    /// Stable identity, independent of the transport connection
    pub id: Id,
    /// Validated display name, unique within the room
    pub display_name: String,
    /// Emoji-style glyph shown next to the name
    pub avatar_glyph: String,
    /// Total score; only ever increased by the scoring engine's output
    pub score: u64,
    /// Consecutive correct answers, reset to 0 on any miss
    pub streak: u32,
    /// Combo multiplier level, reset to 1 on any miss
    pub combo: u32,
    /// Lives remaining, clamped to `[0, 3]`; 0 means eliminated
    pub lives: u8,
    /// Remaining uses of each power-up
    pub power_ups: EnumMap<PowerUp, u8>,
    /// Whether an armed shield is waiting to absorb a miss
    pub shield_armed: bool,
    /// Whether an offensive power-up was already played this question
    pub power_up_played: bool,
    /// Achievements unlocked so far this room session
    pub achievements: HashSet<Achievement>,
    /// Log of every answered question, in play order
    pub answered_log: Vec<AnswerRecord>,
    /// Whether this player has authority to start the game
    pub is_host: bool,
    /// Live or dropped transport connection
    pub connection: ConnectionState,
    /// Personal deadline extension from a time freeze, if any
    pub deadline_override: Option<SystemTime>,
}

impl Player {
    /// Creates a player with fresh game state
    pub fn new(id: Id, display_name: String, avatar_glyph: String, is_host: bool) -> Self {
        Self {
            id,
            display_name,
            avatar_glyph,
            score: 0,
            streak: 0,
            combo: 1,
            lives: room::STARTING_LIVES,
            power_ups: EnumMap::from_fn(|_| USES_PER_GAME),
            shield_armed: false,
            power_up_played: false,
            achievements: HashSet::new(),
            answered_log: Vec::new(),
            is_host,
            connection: ConnectionState::Connected,
            deadline_override: None,
        }
    }

    /// Resets per-game state for a new competitive phase
    ///
    /// Achievements persist: each is unlockable at most once per room
    /// session, play-again rounds included.
    pub fn reset_for_game(&mut self) {
        self.score = 0;
        self.streak = 0;
        self.combo = 1;
        self.lives = room::STARTING_LIVES;
        self.power_ups = EnumMap::from_fn(|_| USES_PER_GAME);
        self.shield_armed = false;
        self.power_up_played = false;
        self.answered_log.clear();
        self.deadline_override = None;
    }

    /// Clears the per-question flags when the room advances
    pub fn begin_question(&mut self) {
        self.power_up_played = false;
        self.deadline_override = None;
    }

    /// Whether this player has run out of lives
    ///
    /// Eliminated players stay in the roster with frozen score but are
    /// excluded from further questions.
    pub fn is_eliminated(&self) -> bool {
        self.lives == 0
    }

    /// Applies a correct answer: score, streak, and combo move up
    pub fn record_correct(&mut self, record: AnswerRecord) {
        self.score += record.points_earned;
        self.streak += 1;
        self.combo += 1;
        self.answered_log.push(record);
    }

    /// Applies a miss (wrong answer or timeout)
    ///
    /// Streak and combo reset; one life is lost unless an armed shield
    /// absorbs it, consuming the shield. Returns `true` if the shield
    /// absorbed the loss.
    pub fn record_miss(&mut self, mut record: AnswerRecord) -> bool {
        self.streak = 0;
        self.combo = 1;
        let absorbed = self.shield_armed;
        if absorbed {
            self.shield_armed = false;
        } else {
            self.lives = self.lives.saturating_sub(1);
        }
        record.shield_absorbed = absorbed;
        self.answered_log.push(record);
        absorbed
    }

    /// Whether every logged answer so far was correct
    pub fn flawless(&self) -> bool {
        self.answered_log.iter().all(|r| r.correct)
    }
}

/// Errors that can occur when admitting a player to a roster
#[derive(Error, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The roster has reached the maximum number of players
    #[error("room is full")]
    RoomFull,
    /// The display name is empty or contains only whitespace
    #[error("display name cannot be empty")]
    EmptyName,
    /// The display name exceeds the maximum allowed length
    #[error("display name is too long")]
    NameTooLong,
    /// The display name contains inappropriate content
    #[error("display name is inappropriate")]
    InappropriateName,
    /// The display name is already in use in this room
    #[error("display name already in-use")]
    NameTaken,
}

/// The players of one room, in join order
///
/// Exactly one member has `is_host = true` at any time; the roster is
/// created around the host and players are only removed when they
/// leave permanently or the room is destroyed.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct Roster {
    /// Primary mapping from player id to their state
    mapping: HashMap<Id, Player>,
    /// Ids in join order
    join_order: Vec<Id>,
}

impl Roster {
    /// Validates and cleans a requested display name
    ///
    /// # Errors
    ///
    /// * [`Error::NameTooLong`] - name exceeds the length cap
    /// * [`Error::EmptyName`] - name is empty after trimming
    /// * [`Error::InappropriateName`] - name fails the content filter
    /// * [`Error::NameTaken`] - another member already uses the name
    fn clean_name(&self, name: &str) -> Result<String, Error> {
        if name.len() > MAX_LENGTH {
            return Err(Error::NameTooLong);
        }
        let name = rustrict::trim_whitespace(name);
        if name.is_empty() {
            return Err(Error::EmptyName);
        }
        if name.is_inappropriate() {
            return Err(Error::InappropriateName);
        }
        if self
            .players()
            .any(|p| p.display_name.eq_ignore_ascii_case(name))
        {
            return Err(Error::NameTaken);
        }
        Ok(name.to_owned())
    }

    /// Admits a new player, enforcing capacity and name hygiene
    ///
    /// # Errors
    ///
    /// Returns [`Error::RoomFull`] at capacity, or the name validation
    /// error that applies.
    pub fn add(
        &mut self,
        id: Id,
        display_name: &str,
        avatar_glyph: String,
        is_host: bool,
    ) -> Result<&Player, Error> {
        if self.mapping.len() >= room::MAX_PLAYER_COUNT {
            return Err(Error::RoomFull);
        }
        let name = self.clean_name(display_name)?;
        let player = Player::new(id, name, avatar_glyph, is_host);
        self.mapping.insert(id, player);
        self.join_order.push(id);
        Ok(self.mapping.get(&id).expect("player was just inserted"))
    }

    /// Removes a player permanently
    pub fn remove(&mut self, id: Id) -> Option<Player> {
        self.join_order.retain(|other| *other != id);
        self.mapping.remove(&id)
    }

    /// Gets a player by id
    pub fn get(&self, id: Id) -> Option<&Player> {
        self.mapping.get(&id)
    }

    /// Gets a mutable player by id
    pub fn get_mut(&mut self, id: Id) -> Option<&mut Player> {
        self.mapping.get_mut(&id)
    }

    /// Whether the roster contains the given player
    pub fn contains(&self, id: Id) -> bool {
        self.mapping.contains_key(&id)
    }

    /// Number of players in the roster
    pub fn len(&self) -> usize {
        self.join_order.len()
    }

    /// Whether the roster has no players
    pub fn is_empty(&self) -> bool {
        self.join_order.is_empty()
    }

    /// Iterates over players in join order
    pub fn players(&self) -> impl Iterator<Item = &Player> {
        self.join_order.iter().filter_map(|id| self.mapping.get(id))
    }

    /// Iterates over ids in join order
    pub fn ids(&self) -> impl Iterator<Item = Id> + '_ {
        self.join_order.iter().copied()
    }

    /// Mutably iterates over players, in no particular order
    pub fn players_mut(&mut self) -> impl Iterator<Item = &mut Player> {
        self.mapping.values_mut()
    }

    /// Ids of players still holding lives, in join order
    pub fn active_ids(&self) -> Vec<Id> {
        self.players()
            .filter(|p| !p.is_eliminated())
            .map(|p| p.id)
            .collect()
    }

    /// Whether every player has been eliminated
    pub fn all_eliminated(&self) -> bool {
        self.players().all(Player::is_eliminated)
    }

    /// Whether any player still has a live connection
    pub fn any_connected(&self) -> bool {
        self.players()
            .any(|p| p.connection == ConnectionState::Connected)
    }

    /// The id of the current host, if the roster is non-empty
    pub fn host_id(&self) -> Option<Id> {
        self.players().find(|p| p.is_host).map(|p| p.id)
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    fn roster_with_host() -> (Roster, Id) {
        let mut roster = Roster::default();
        let host = Id::new();
        roster.add(host, "Ada", "🎯".to_string(), true).unwrap();
        (roster, host)
    }

    #[test]
    fn test_add_preserves_join_order() {
        let (mut roster, host) = roster_with_host();
        let second = Id::new();
        let third = Id::new();
        roster.add(second, "Grace", "⚡".to_string(), false).unwrap();
        roster.add(third, "Alan", "🔥".to_string(), false).unwrap();

        let order: Vec<Id> = roster.ids().collect();
        assert_eq!(order, vec![host, second, third]);
        assert_eq!(roster.host_id(), Some(host));
    }

    #[test]
    fn test_add_rejects_when_full() {
        let (mut roster, _) = roster_with_host();
        for i in 1..room::MAX_PLAYER_COUNT {
            roster
                .add(Id::new(), &format!("Player{i}"), "🎮".to_string(), false)
                .unwrap();
        }
        assert!(matches!(
            roster.add(Id::new(), "Late", "🎮".to_string(), false),
            Err(Error::RoomFull)
        ));
    }

    #[test]
    fn test_name_hygiene() {
        let (mut roster, _) = roster_with_host();
        assert!(matches!(
            roster.add(Id::new(), "   ", "🎮".to_string(), false),
            Err(Error::EmptyName)
        ));
        assert!(matches!(
            roster.add(Id::new(), &"a".repeat(MAX_LENGTH + 1), "🎮".to_string(), false),
            Err(Error::NameTooLong)
        ));
        assert!(matches!(
            roster.add(Id::new(), "ada", "🎮".to_string(), false),
            Err(Error::NameTaken)
        ));
    }

    #[test]
    fn test_name_is_trimmed() {
        let (mut roster, _) = roster_with_host();
        let id = Id::new();
        roster.add(id, "  Grace  ", "🎮".to_string(), false).unwrap();
        assert_eq!(roster.get(id).unwrap().display_name, "Grace");
    }

    #[test]
    fn test_record_miss_consumes_shield() {
        let mut player = Player::new(Id::new(), "Ada".to_string(), "🎯".to_string(), false);
        player.shield_armed = true;

        let record = AnswerRecord {
            question_index: 0,
            question_id: 1,
            selected: Some(0),
            correct: false,
            points_earned: 0,
            shield_absorbed: false,
        };
        assert!(player.record_miss(record));
        assert_eq!(player.lives, room::STARTING_LIVES);
        assert!(!player.shield_armed);
        assert!(player.answered_log[0].shield_absorbed);

        // second miss is no longer protected
        assert!(!player.record_miss(record));
        assert_eq!(player.lives, room::STARTING_LIVES - 1);
    }

    #[test]
    fn test_lives_clamp_at_zero() {
        let mut player = Player::new(Id::new(), "Ada".to_string(), "🎯".to_string(), false);
        let record = AnswerRecord {
            question_index: 0,
            question_id: 1,
            selected: None,
            correct: false,
            points_earned: 0,
            shield_absorbed: false,
        };
        for _ in 0..5 {
            player.record_miss(record);
        }
        assert_eq!(player.lives, 0);
        assert!(player.is_eliminated());
    }

    #[test]
    fn test_replay_log_matches_incremental_state() {
        let mut player = Player::new(Id::new(), "Ada".to_string(), "🎯".to_string(), false);
        player.shield_armed = true;

        player.record_correct(AnswerRecord {
            question_index: 0,
            question_id: 1,
            selected: Some(2),
            correct: true,
            points_earned: 163,
            shield_absorbed: false,
        });
        player.record_miss(AnswerRecord {
            question_index: 1,
            question_id: 2,
            selected: Some(0),
            correct: false,
            points_earned: 0,
            shield_absorbed: false,
        });
        player.record_correct(AnswerRecord {
            question_index: 2,
            question_id: 3,
            selected: Some(1),
            correct: true,
            points_earned: 120,
            shield_absorbed: false,
        });
        player.record_miss(AnswerRecord {
            question_index: 3,
            question_id: 4,
            selected: None,
            correct: false,
            points_earned: 0,
            shield_absorbed: false,
        });

        let replayed = replay_log(&player.answered_log);
        assert_eq!(replayed.score, player.score);
        assert_eq!(replayed.streak, player.streak);
        assert_eq!(replayed.combo, player.combo);
        assert_eq!(replayed.lives, player.lives);
        // one miss was absorbed, one cost a life
        assert_eq!(replayed.lives, room::STARTING_LIVES - 1);
    }

    #[test]
    fn test_reset_for_game_keeps_achievements() {
        let mut player = Player::new(Id::new(), "Ada".to_string(), "🎯".to_string(), false);
        player.score = 500;
        player.achievements.insert(Achievement::FirstBlood);
        player.power_ups[PowerUp::Shield] = 0;

        player.reset_for_game();
        assert_eq!(player.score, 0);
        assert_eq!(player.combo, 1);
        assert_eq!(player.lives, room::STARTING_LIVES);
        assert_eq!(player.power_ups[PowerUp::Shield], USES_PER_GAME);
        assert!(player.achievements.contains(&Achievement::FirstBlood));
    }

    #[test]
    fn test_id_string_round_trip() {
        let id = Id::new();
        let parsed = Id::from_str(&id.to_string()).unwrap();
        assert_eq!(id, parsed);
    }
}
