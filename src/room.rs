//! Room state machine and synchronization protocol
//!
//! This module owns one battle's lifecycle: the lobby, the roster, the
//! synchronized question loop with its server-side deadline, scoring
//! application, power-ups, elimination, and the results phase. The
//! server is the single source of truth for scores, lives, and the
//! question index; clients may render optimistic predictions but must
//! reconcile to the broadcasts produced here.
//!
//! All sends for one state transition happen inside the room's
//! serialized scope, in production order, so no client can observe
//! question N+1 before the scoring broadcast for question N.

use std::{collections::HashMap, fmt::Debug, sync::Arc, time::Duration};

use garde::Validate;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use thiserror::Error;
use web_time::SystemTime;

use crate::{
    code::RoomCode,
    constants::{power_up, room as room_constants},
    player::{self, AnswerRecord, ConnectionState, Id, Player, PowerUp, Roster},
    question::{QuestionBank, QuestionView},
    scoring::{
        self, Achievement, AnswerContext, PointsBreakdown, RankHistory,
    },
    session::Tunnel,
};

/// Global configuration options for a battle room
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Validate)]
pub struct Options {
    /// Roster size at which joins are rejected
    #[garde(range(min = 2, max = room_constants::MAX_PLAYER_COUNT))]
    pub max_players: usize,
    /// Roster size required before the host may start
    #[garde(range(min = 2))]
    pub min_players: usize,
    /// Tolerance past the deadline for answers still in flight
    #[garde(skip)]
    pub answer_grace: Duration,
    /// Personal deadline extension granted by a time freeze
    #[garde(skip)]
    pub time_freeze_extension: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            max_players: room_constants::MAX_PLAYER_COUNT,
            min_players: room_constants::MIN_PLAYER_COUNT,
            answer_grace: Duration::from_secs(room_constants::ANSWER_GRACE_SECONDS),
            time_freeze_extension: Duration::from_secs(power_up::TIME_FREEZE_SECONDS),
        }
    }
}

/// Runtime state of the question currently on screen
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurrentQuestion {
    /// Index of the question within the room's bank
    pub index: usize,
    /// When the question was broadcast
    asked_at: SystemTime,
    /// The room-wide deadline (`asked_at + time_limit`)
    deadline: SystemTime,
    /// Submissions so far: picked option (None for a synthesized
    /// timeout) and submission time
    answers: HashMap<Id, (Option<usize>, SystemTime)>,
}

/// The phase a room is in
///
/// A room is allocated in `LobbyPending`, opens as `Waiting` once its
/// host registers, runs the question loop `InProgress`, and parks in
/// `Results` until a play-again or eviction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum State {
    /// Allocated by the registry, host not yet registered
    LobbyPending,
    /// Lobby open; players may join
    Waiting,
    /// Question loop running
    InProgress(Box<CurrentQuestion>),
    /// Competitive phase over; standings on display
    Results,
}

/// Messages received from clients
///
/// Room routing (the wire events' `roomCode` field) happens in the
/// registry; by the time a message reaches a room it carries only the
/// action itself.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum IncomingMessage {
    /// Host starts the game (roster permitting)
    StartGame,
    /// Host ends the game early, jumping to results
    EndGame,
    /// Host returns a finished room to the lobby with the same roster
    PlayAgain,
    /// A player answers the current question
    SubmitAnswer {
        /// Id of the question being answered, as a staleness guard
        question_id: u32,
        /// Index of the picked option
        selected_option: usize,
    },
    /// A player plays a power-up
    UsePowerUp(PowerUp),
}

/// A player's authoritative state as sent to clients
#[derive(Debug, Clone, Serialize)]
pub struct PlayerSnapshot {
    /// Stable player id
    pub id: Id,
    /// Display name
    pub display_name: String,
    /// Avatar glyph
    pub avatar_glyph: String,
    /// Authoritative score
    pub score: u64,
    /// Current streak
    pub streak: u32,
    /// Current combo level
    pub combo: u32,
    /// Lives remaining
    pub lives: u8,
    /// Whether the player has run out of lives
    pub eliminated: bool,
    /// Whether the player's connection is live
    pub connected: bool,
    /// Whether this player is the host
    pub is_host: bool,
    /// Achievements unlocked so far
    pub achievements: Vec<Achievement>,
}

impl PlayerSnapshot {
    fn of(player: &Player) -> Self {
        Self {
            id: player.id,
            display_name: player.display_name.clone(),
            avatar_glyph: player.avatar_glyph.clone(),
            score: player.score,
            streak: player.streak,
            combo: player.combo,
            lives: player.lives,
            eliminated: player.is_eliminated(),
            connected: player.connection == ConnectionState::Connected,
            is_host: player.is_host,
            achievements: player.achievements.iter().copied().sorted().collect(),
        }
    }
}

/// One row of the final standings as sent to clients
#[derive(Debug, Clone, Serialize)]
pub struct StandingEntry {
    /// Stable player id
    pub id: Id,
    /// Display name
    pub display_name: String,
    /// Avatar glyph
    pub avatar_glyph: String,
    /// Final score
    pub score: u64,
    /// Final rank, 1-indexed
    pub rank: usize,
    /// Whether the player ran out of lives
    pub eliminated: bool,
    /// Achievements unlocked this session
    pub achievements: Vec<Achievement>,
}

/// Update messages sent to clients about room state changes
#[skip_serializing_none]
#[derive(Debug, Serialize, Clone)]
pub enum UpdateMessage {
    /// (CREATOR ONLY) The room exists and has this code
    RoomCreated {
        /// The code other players join with
        code: RoomCode,
    },
    /// A player joined the lobby
    PlayerJoined {
        /// The joiner's display name
        display_name: String,
        /// The joiner's avatar glyph
        avatar_glyph: String,
    },
    /// Authoritative roster state, in join order
    RoomUpdate {
        /// Snapshot of every player, eliminated players included
        players: Vec<PlayerSnapshot>,
    },
    /// The game has started
    GameStarted,
    /// A new question is on screen
    QuestionNext {
        /// Index of the question (0-based)
        index: usize,
        /// Total number of questions
        count: usize,
        /// The question, with the correct option withheld
        question: QuestionView,
        /// Absolute deadline for answers
        deadline: SystemTime,
        /// Players still in the running for this question
        active_players: Vec<Id>,
    },
    /// A player has answered the current question
    PlayerAnswered {
        /// The answerer's display name
        display_name: String,
        /// Whether they were right
        correct: bool,
    },
    /// (SENDER ONLY) The authoritative outcome of an answer
    AnswerResult {
        /// Whether the pick was correct
        correct: bool,
        /// The real correct option, for result display
        correct_option: usize,
        /// Itemized points awarded
        breakdown: PointsBreakdown,
        /// Streak after this answer
        streak: u32,
        /// Combo after this answer
        combo: u32,
        /// Lives remaining after this answer
        lives: u8,
        /// Whether an armed shield absorbed the life loss
        shield_absorbed: bool,
        /// Combo milestone hit by this answer, if any
        combo_milestone: Option<u32>,
    },
    /// (SENDER ONLY) Options removed by a fifty-fifty
    FiftyFifty {
        /// Indices of the two incorrect options to hide
        removed: Vec<usize>,
    },
    /// (SENDER ONLY) A time freeze moved the personal deadline
    DeadlineExtended {
        /// The new personal deadline
        deadline: SystemTime,
    },
    /// (SENDER ONLY) A shield is armed and will absorb the next miss
    ShieldArmed,
    /// A player unlocked an achievement
    AchievementUnlocked {
        /// Who unlocked it
        display_name: String,
        /// Which achievement
        achievement: Achievement,
    },
    /// (SENDER ONLY) The player ran out of lives
    Eliminated,
    /// The game is over; final standings
    Results {
        /// Standings in rank order
        final_standings: Vec<StandingEntry>,
    },
    /// (SENDER ONLY) The event was dropped
    Rejected {
        /// Why the event was dropped
        reason: Error,
    },
}

impl UpdateMessage {
    /// Converts the update message to a JSON string for transmission
    ///
    /// # Panics
    ///
    /// This method panics if serialization fails, which should never
    /// happen with the default JSON serializer for well-formed data.
    pub fn to_message(&self) -> String {
        serde_json::to_string(self).expect("default serializer cannot fail")
    }
}

/// Sync messages that replace a client's entire view on (re)connect
#[skip_serializing_none]
#[derive(Debug, Serialize, Clone)]
pub enum SyncMessage {
    /// The room is in its lobby phase
    Waiting {
        /// Snapshot of every player, in join order
        players: Vec<PlayerSnapshot>,
    },
    /// A question is on screen
    InProgress {
        /// Index of the question (0-based)
        index: usize,
        /// Total number of questions
        count: usize,
        /// The question, with the correct option withheld
        question: QuestionView,
        /// The reconnecting player's personal deadline
        deadline: SystemTime,
        /// Whether this player already answered the question
        answered: bool,
        /// Snapshot of every player, in join order
        players: Vec<PlayerSnapshot>,
    },
    /// The game is over
    Results {
        /// Standings in rank order
        final_standings: Vec<StandingEntry>,
    },
}

impl SyncMessage {
    /// Converts the sync message to a JSON string for transmission
    ///
    /// # Panics
    ///
    /// This method panics if serialization fails, which should never
    /// happen with the default JSON serializer for well-formed data.
    pub fn to_message(&self) -> String {
        serde_json::to_string(self).expect("default serializer cannot fail")
    }
}

/// Alarm messages for timed events
///
/// The room hands these to its `schedule_alarm` closure; the host
/// process echoes them back through [`Room::receive_alarm`] when the
/// delay elapses, whether or not any client is still connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlarmMessage {
    /// The current question's answer window has closed
    QuestionDeadline {
        /// The question index the alarm was armed for, as a
        /// staleness guard
        index: usize,
    },
}

/// Errors that drop an event, reported only to the sender
///
/// None of these terminate the room or affect other players; a
/// synthesized timeout is a normal state-machine input, not an error.
#[derive(Error, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The sender is not in this room's roster
    #[error("player is not in this room")]
    UnknownPlayer,
    /// Joins are rejected once the game has started
    #[error("game already started")]
    RoomAlreadyStarted,
    /// Only the host may perform this action
    #[error("not authorized")]
    NotHost,
    /// The roster is below the starting threshold
    #[error("need at least 2 players")]
    NotEnoughPlayers,
    /// The action requires a running game
    #[error("game is not in progress")]
    NotInProgress,
    /// The event targets a question that is no longer current
    #[error("stale question")]
    StaleQuestion,
    /// The player already answered this question
    #[error("already answered")]
    DuplicateAnswer,
    /// The answer arrived past the deadline and tolerance margin
    #[error("too late")]
    TooLate,
    /// Eliminated players cannot act on questions
    #[error("player is eliminated")]
    Eliminated,
    /// The power-up has no uses left
    #[error("power-up exhausted")]
    PowerUpExhausted,
    /// A power-up was already played this question, or the shield is
    /// already armed
    #[error("power-up already in use")]
    PowerUpAlreadyUsed,
    /// The event payload does not make sense for the current question
    #[error("malformed event")]
    MalformedEvent,
    /// The join was rejected by the roster
    #[error(transparent)]
    Roster(#[from] player::Error),
}

/// The state machine for one battle room
///
/// Created by the registry, driven by events and alarms, destroyed
/// when empty or evicted. Mutations to one room must be serialized by
/// the caller; the registry wraps every room in its own lock.
#[derive(Serialize, Deserialize)]
pub struct Room {
    /// The code players join with
    code: RoomCode,
    /// The shared read-only question deck
    bank: Arc<QuestionBank>,
    /// The players, in join order
    pub roster: Roster,
    /// Current phase
    state: State,
    /// Whether First Blood has been claimed this game
    first_correct_claimed: bool,
    /// Scoreboard history for rank-sensitive achievements
    rank_history: RankHistory,
    /// Room configuration
    options: Options,
}

impl Debug for Room {
    /// Custom debug implementation that avoids printing large amounts of data
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Room")
            .field("code", &self.code)
            .finish_non_exhaustive()
    }
}

// Convenience methods
impl Room {
    /// Creates a room in `LobbyPending`; the registry registers the
    /// host immediately afterwards
    pub fn new(code: RoomCode, bank: Arc<QuestionBank>, options: Options) -> Self {
        Self {
            code,
            bank,
            roster: Roster::default(),
            state: State::LobbyPending,
            first_correct_claimed: false,
            rank_history: RankHistory::default(),
            options,
        }
    }

    /// The room's code
    pub fn code(&self) -> RoomCode {
        self.code
    }

    /// The room's current phase
    pub fn state(&self) -> &State {
        &self.state
    }

    /// Whether the room is parked in its results phase
    pub fn is_finished(&self) -> bool {
        matches!(self.state, State::Results)
    }

    /// Sends an update message to one roster member, if connected
    fn send_to<T: Tunnel, F: Fn(Id) -> Option<T>>(
        &self,
        id: Id,
        message: &UpdateMessage,
        tunnel_finder: F,
    ) {
        if let Some(tunnel) = tunnel_finder(id) {
            tunnel.send_message(message);
        }
    }

    /// Broadcasts an update message to every roster member with a
    /// live tunnel, in join order
    fn announce<T: Tunnel, F: Fn(Id) -> Option<T>>(
        &self,
        message: &UpdateMessage,
        tunnel_finder: F,
    ) {
        for id in self.roster.ids() {
            if let Some(tunnel) = tunnel_finder(id) {
                tunnel.send_message(message);
            }
        }
    }

    /// The authoritative roster broadcast
    fn room_update(&self) -> UpdateMessage {
        UpdateMessage::RoomUpdate {
            players: self.roster.players().map(PlayerSnapshot::of).collect(),
        }
    }

    /// Scores of every player, in join order
    fn scores(&self) -> Vec<(Id, u64)> {
        self.roster.players().map(|p| (p.id, p.score)).collect()
    }

    /// The question currently on screen, if any
    fn current_question(&self) -> Option<&CurrentQuestion> {
        match &self.state {
            State::InProgress(current) => Some(current),
            _ => None,
        }
    }

    /// A player's personal deadline, honoring any time-freeze override
    fn personal_deadline(&self, player: &Player, base: SystemTime) -> SystemTime {
        player.deadline_override.map_or(base, |o| o.max(base))
    }

    /// Builds the final standings rows, in rank order
    fn standings_entries(&self) -> Vec<StandingEntry> {
        self.rank_history
            .final_standings(self.scores().into_iter())
            .iter()
            .filter_map(|standing| {
                let player = self.roster.get(standing.id)?;
                Some(StandingEntry {
                    id: standing.id,
                    display_name: player.display_name.clone(),
                    avatar_glyph: player.avatar_glyph.clone(),
                    score: standing.score,
                    rank: standing.rank,
                    eliminated: player.is_eliminated(),
                    achievements: player.achievements.iter().copied().sorted().collect(),
                })
            })
            .collect()
    }

    /// Unlocks achievements for a player and announces the new ones
    fn unlock_achievements<T: Tunnel, F: Fn(Id) -> Option<T>>(
        &mut self,
        player_id: Id,
        unlocked: &[Achievement],
        tunnel_finder: &F,
    ) {
        let Some(player) = self.roster.get_mut(player_id) else {
            return;
        };
        let fresh = unlocked
            .iter()
            .copied()
            .filter(|a| player.achievements.insert(*a))
            .collect_vec();
        let display_name = player.display_name.clone();
        for achievement in fresh {
            self.announce(
                &UpdateMessage::AchievementUnlocked {
                    display_name: display_name.clone(),
                    achievement,
                },
                tunnel_finder,
            );
        }
    }
}

impl Room {
    /// Registers the creator as the sole player and opens the lobby
    ///
    /// Transitions `LobbyPending → Waiting` and confirms the code to
    /// the creator.
    ///
    /// # Errors
    ///
    /// Returns a roster error if the display name fails validation.
    pub fn register_host<T: Tunnel, F: Fn(Id) -> Option<T>>(
        &mut self,
        host_id: Id,
        display_name: &str,
        avatar_glyph: String,
        tunnel_finder: F,
    ) -> Result<(), Error> {
        if !matches!(self.state, State::LobbyPending) {
            return Err(Error::RoomAlreadyStarted);
        }
        self.roster.add(host_id, display_name, avatar_glyph, true)?;
        self.state = State::Waiting;
        tracing::info!(code = %self.code, "room created");

        self.send_to(
            host_id,
            &UpdateMessage::RoomCreated { code: self.code },
            &tunnel_finder,
        );
        self.announce(&self.room_update(), &tunnel_finder);
        Ok(())
    }

    /// Admits a player to the lobby
    ///
    /// # Errors
    ///
    /// * [`Error::RoomAlreadyStarted`] once the state left `Waiting`
    /// * [`Error::Roster`] for capacity or display-name failures
    pub fn join<T: Tunnel, F: Fn(Id) -> Option<T>>(
        &mut self,
        player_id: Id,
        display_name: &str,
        avatar_glyph: String,
        tunnel_finder: F,
    ) -> Result<(), Error> {
        if !matches!(self.state, State::Waiting) {
            return Err(Error::RoomAlreadyStarted);
        }
        if self.roster.len() >= self.options.max_players {
            return Err(player::Error::RoomFull.into());
        }
        let player = self
            .roster
            .add(player_id, display_name, avatar_glyph, false)?;
        let joined = UpdateMessage::PlayerJoined {
            display_name: player.display_name.clone(),
            avatar_glyph: player.avatar_glyph.clone(),
        };
        self.announce(&joined, &tunnel_finder);
        self.announce(&self.room_update(), &tunnel_finder);
        Ok(())
    }

    /// Handles an incoming client event
    ///
    /// Any failure is reported to the sender alone as a
    /// [`UpdateMessage::Rejected`] acknowledgment; it never mutates
    /// shared state and never propagates to other clients.
    pub fn receive_message<
        T: Tunnel,
        F: Fn(Id) -> Option<T>,
        S: FnMut(AlarmMessage, Duration),
    >(
        &mut self,
        player_id: Id,
        message: IncomingMessage,
        schedule_alarm: S,
        tunnel_finder: F,
    ) {
        let outcome = match message {
            IncomingMessage::StartGame => {
                self.start_game(player_id, schedule_alarm, &tunnel_finder)
            }
            IncomingMessage::EndGame => self.end_game(player_id, &tunnel_finder),
            IncomingMessage::PlayAgain => self.play_again(player_id, &tunnel_finder),
            IncomingMessage::SubmitAnswer {
                question_id,
                selected_option,
            } => self.submit_answer(
                player_id,
                question_id,
                selected_option,
                schedule_alarm,
                &tunnel_finder,
            ),
            IncomingMessage::UsePowerUp(power_up) => {
                self.use_power_up(player_id, power_up, &tunnel_finder)
            }
        };

        if let Err(reason) = outcome {
            tracing::debug!(code = %self.code, %player_id, %reason, "event rejected");
            self.send_to(
                player_id,
                &UpdateMessage::Rejected { reason },
                &tunnel_finder,
            );
        }
    }

    /// Starts the game from the lobby
    ///
    /// A duplicate start on an already-running room is absorbed as a
    /// no-op to tolerate double-click and retry races.
    fn start_game<T: Tunnel, F: Fn(Id) -> Option<T>, S: FnMut(AlarmMessage, Duration)>(
        &mut self,
        player_id: Id,
        schedule_alarm: S,
        tunnel_finder: &F,
    ) -> Result<(), Error> {
        let player = self.roster.get(player_id).ok_or(Error::UnknownPlayer)?;
        if !player.is_host {
            return Err(Error::NotHost);
        }
        match self.state {
            State::Waiting => {}
            State::InProgress(_) | State::Results => return Ok(()),
            State::LobbyPending => return Err(Error::NotInProgress),
        }
        if self.roster.len() < self.options.min_players {
            return Err(Error::NotEnoughPlayers);
        }

        for player in self.roster.players_mut() {
            player.reset_for_game();
        }
        self.first_correct_claimed = false;
        self.rank_history.reset();
        tracing::info!(code = %self.code, players = self.roster.len(), "game started");

        self.announce(&UpdateMessage::GameStarted, tunnel_finder);
        self.start_question(0, schedule_alarm, tunnel_finder);
        Ok(())
    }

    /// Puts a question on screen and arms its deadline alarm
    fn start_question<T: Tunnel, F: Fn(Id) -> Option<T>, S: FnMut(AlarmMessage, Duration)>(
        &mut self,
        index: usize,
        mut schedule_alarm: S,
        tunnel_finder: &F,
    ) {
        let Some(question) = self.bank.get(index) else {
            self.finish_game(tunnel_finder);
            return;
        };
        let view = question.view();
        let time_limit = question.time_limit;

        for player in self.roster.players_mut() {
            player.begin_question();
        }

        let asked_at = SystemTime::now();
        let deadline = asked_at + time_limit;
        self.state = State::InProgress(Box::new(CurrentQuestion {
            index,
            asked_at,
            deadline,
            answers: HashMap::new(),
        }));

        self.announce(
            &UpdateMessage::QuestionNext {
                index,
                count: self.bank.len(),
                question: view,
                deadline,
                active_players: self.roster.active_ids(),
            },
            tunnel_finder,
        );

        schedule_alarm(
            AlarmMessage::QuestionDeadline { index },
            time_limit + self.options.answer_grace,
        );
    }

    /// Validates and applies one player's answer
    fn submit_answer<T: Tunnel, F: Fn(Id) -> Option<T>, S: FnMut(AlarmMessage, Duration)>(
        &mut self,
        player_id: Id,
        question_id: u32,
        selected_option: usize,
        schedule_alarm: S,
        tunnel_finder: &F,
    ) -> Result<(), Error> {
        let player = self.roster.get(player_id).ok_or(Error::UnknownPlayer)?;
        if player.is_eliminated() {
            return Err(Error::Eliminated);
        }
        let State::InProgress(current) = &self.state else {
            return Err(Error::NotInProgress);
        };
        let index = current.index;
        let question = self.bank.get(index).ok_or(Error::StaleQuestion)?;
        // a reconnect replaying an event for an earlier question lands here
        if question.id != question_id {
            return Err(Error::StaleQuestion);
        }
        if selected_option >= question.options.len() {
            return Err(Error::MalformedEvent);
        }
        if current.answers.contains_key(&player_id) {
            return Err(Error::DuplicateAnswer);
        }

        let now = SystemTime::now();
        let deadline = self.personal_deadline(player, current.deadline);
        if now > deadline + self.options.answer_grace {
            // the deadline alarm owns the timeout outcome
            return Err(Error::TooLate);
        }
        let seconds_remaining = deadline
            .duration_since(now)
            .map_or(0, |remaining| remaining.as_secs());
        let latency = now
            .duration_since(current.asked_at)
            .unwrap_or(Duration::ZERO);

        let correct = selected_option == question.correct_option;
        let correct_option = question.correct_option;
        let is_first_correct = correct && !self.first_correct_claimed;
        if is_first_correct {
            self.first_correct_claimed = true;
        }

        let context = AnswerContext {
            base_points: question.base_points,
            time_limit: question.time_limit,
            seconds_remaining,
            combo_after: if correct { player.combo + 1 } else { 1 },
            streak_after: if correct { player.streak + 1 } else { 0 },
            is_first_correct_in_room: is_first_correct,
            answer_latency: latency,
        };
        let breakdown = scoring::score_answer(correct, &context);
        let unlocked = scoring::instant_unlocks(correct, &context);

        let State::InProgress(current) = &mut self.state else {
            unreachable!("state checked above");
        };
        current.answers.insert(player_id, (Some(selected_option), now));

        let record = AnswerRecord {
            question_index: index,
            question_id,
            selected: Some(selected_option),
            correct,
            points_earned: breakdown.total,
            shield_absorbed: false,
        };
        let player = self
            .roster
            .get_mut(player_id)
            .expect("player presence checked above");
        let shield_absorbed = if correct {
            player.record_correct(record);
            false
        } else {
            player.record_miss(record)
        };
        let display_name = player.display_name.clone();
        let (streak, combo, lives) = (player.streak, player.combo, player.lives);
        let eliminated = player.is_eliminated();

        self.unlock_achievements(player_id, &unlocked, tunnel_finder);
        self.send_to(
            player_id,
            &UpdateMessage::AnswerResult {
                correct,
                correct_option,
                breakdown,
                streak,
                combo,
                lives,
                shield_absorbed,
                combo_milestone: correct.then(|| scoring::combo_milestone(combo)).flatten(),
            },
            tunnel_finder,
        );
        self.announce(
            &UpdateMessage::PlayerAnswered {
                display_name,
                correct,
            },
            tunnel_finder,
        );
        self.announce(&self.room_update(), tunnel_finder);
        self.rank_history.record_snapshot(self.scores().into_iter());

        if eliminated {
            tracing::info!(code = %self.code, %player_id, "player eliminated");
            self.send_to(player_id, &UpdateMessage::Eliminated, tunnel_finder);
        }

        self.maybe_advance(index, schedule_alarm, tunnel_finder);
        Ok(())
    }

    /// Applies a power-up for one player
    fn use_power_up<T: Tunnel, F: Fn(Id) -> Option<T>>(
        &mut self,
        player_id: Id,
        power_up: PowerUp,
        tunnel_finder: &F,
    ) -> Result<(), Error> {
        let State::InProgress(current) = &self.state else {
            return Err(Error::NotInProgress);
        };
        let already_answered = current.answers.contains_key(&player_id);
        let room_deadline = current.deadline;
        let question_index = current.index;

        let player = self.roster.get(player_id).ok_or(Error::UnknownPlayer)?;
        if player.is_eliminated() {
            return Err(Error::Eliminated);
        }
        if player.power_ups[power_up] == 0 {
            return Err(Error::PowerUpExhausted);
        }
        match power_up {
            PowerUp::FiftyFifty | PowerUp::TimeFreeze => {
                if player.power_up_played || already_answered {
                    return Err(Error::PowerUpAlreadyUsed);
                }
            }
            PowerUp::Shield => {
                if player.shield_armed {
                    return Err(Error::PowerUpAlreadyUsed);
                }
            }
        }

        // advisory effects only: the correctness check and the room
        // deadline stay untouched
        let reply = match power_up {
            PowerUp::FiftyFifty => {
                let question = self
                    .bank
                    .get(question_index)
                    .ok_or(Error::StaleQuestion)?;
                let mut incorrect = question.incorrect_options();
                fastrand::shuffle(&mut incorrect);
                incorrect.truncate(power_up::FIFTY_FIFTY_REMOVALS);
                incorrect.sort_unstable();
                UpdateMessage::FiftyFifty { removed: incorrect }
            }
            PowerUp::TimeFreeze => {
                let extension = self.options.time_freeze_extension;
                let player = self
                    .roster
                    .get(player_id)
                    .expect("player presence checked above");
                let deadline = self.personal_deadline(player, room_deadline) + extension;
                UpdateMessage::DeadlineExtended { deadline }
            }
            PowerUp::Shield => UpdateMessage::ShieldArmed,
        };

        let player = self
            .roster
            .get_mut(player_id)
            .expect("player presence checked above");
        player.power_ups[power_up] -= 1;
        match (power_up, &reply) {
            (PowerUp::FiftyFifty, _) => player.power_up_played = true,
            (PowerUp::TimeFreeze, UpdateMessage::DeadlineExtended { deadline }) => {
                player.power_up_played = true;
                player.deadline_override = Some(*deadline);
            }
            (PowerUp::Shield, _) => player.shield_armed = true,
            _ => {}
        }

        self.send_to(player_id, &reply, tunnel_finder);
        Ok(())
    }

    /// Handles a fired deadline alarm
    ///
    /// Synthesizes a timeout for every active player who has not
    /// answered and whose personal deadline has passed, then advances
    /// the question or re-arms the alarm for outstanding time-freeze
    /// extensions. Runs to completion even when no client is
    /// connected.
    pub fn receive_alarm<
        T: Tunnel,
        F: Fn(Id) -> Option<T>,
        S: FnMut(AlarmMessage, Duration),
    >(
        &mut self,
        alarm: AlarmMessage,
        mut schedule_alarm: S,
        tunnel_finder: F,
    ) {
        let AlarmMessage::QuestionDeadline { index } = alarm;
        let Some(current) = self.current_question() else {
            return;
        };
        if current.index != index {
            return;
        }
        let room_deadline = current.deadline;
        let answered: Vec<Id> = current.answers.keys().copied().collect();

        let now = SystemTime::now();
        let grace = self.options.answer_grace;
        let mut timed_out = Vec::new();
        let mut outstanding: Option<SystemTime> = None;
        for id in self.roster.active_ids() {
            if answered.contains(&id) {
                continue;
            }
            let Some(player) = self.roster.get(id) else {
                continue;
            };
            let personal = self.personal_deadline(player, room_deadline) + grace;
            if now >= personal {
                timed_out.push(id);
            } else {
                outstanding = Some(outstanding.map_or(personal, |o| o.max(personal)));
            }
        }

        for id in timed_out {
            self.apply_timeout(id, index, now, &tunnel_finder);
        }

        if let Some(until) = outstanding {
            // someone froze time; come back when their window closes
            let delay = until.duration_since(now).unwrap_or(Duration::ZERO);
            schedule_alarm(AlarmMessage::QuestionDeadline { index }, delay);
            return;
        }

        self.announce(&self.room_update(), &tunnel_finder);
        self.rank_history.record_snapshot(self.scores().into_iter());
        self.maybe_advance(index, schedule_alarm, &tunnel_finder);
    }

    /// Applies the timeout outcome to one player
    ///
    /// State-identical to a wrong answer at time-up: streak to 0,
    /// combo to 1, one life lost (shield permitting), zero points.
    fn apply_timeout<T: Tunnel, F: Fn(Id) -> Option<T>>(
        &mut self,
        player_id: Id,
        index: usize,
        now: SystemTime,
        tunnel_finder: &F,
    ) {
        let Some(question) = self.bank.get(index) else {
            return;
        };
        let question_id = question.id;
        let State::InProgress(current) = &mut self.state else {
            return;
        };
        current.answers.insert(player_id, (None, now));

        let Some(player) = self.roster.get_mut(player_id) else {
            return;
        };
        player.record_miss(AnswerRecord {
            question_index: index,
            question_id,
            selected: None,
            correct: false,
            points_earned: 0,
            shield_absorbed: false,
        });
        let display_name = player.display_name.clone();
        let eliminated = player.is_eliminated();

        self.announce(
            &UpdateMessage::PlayerAnswered {
                display_name,
                correct: false,
            },
            tunnel_finder,
        );
        if eliminated {
            tracing::info!(code = %self.code, %player_id, "player eliminated on timeout");
            self.send_to(player_id, &UpdateMessage::Eliminated, tunnel_finder);
        }
    }

    /// Advances past `index` once nothing more can happen for it
    ///
    /// The transition fires exactly once per question: it runs under
    /// the room's serialized scope, and moving the state forward makes
    /// any late duplicate trigger a no-op.
    fn maybe_advance<T: Tunnel, F: Fn(Id) -> Option<T>, S: FnMut(AlarmMessage, Duration)>(
        &mut self,
        index: usize,
        schedule_alarm: S,
        tunnel_finder: &F,
    ) {
        let Some(current) = self.current_question() else {
            return;
        };
        if current.index != index {
            return;
        }

        if self.roster.all_eliminated() {
            tracing::info!(code = %self.code, "all players eliminated");
            self.finish_game(tunnel_finder);
            return;
        }

        let answers = &current.answers;
        let all_answered = self
            .roster
            .active_ids()
            .iter()
            .all(|id| answers.contains_key(id));
        if !all_answered {
            return;
        }

        if index + 1 < self.bank.len() {
            self.start_question(index + 1, schedule_alarm, tunnel_finder);
        } else {
            self.finish_game(tunnel_finder);
        }
    }

    /// Ends the competitive phase and publishes final standings
    fn finish_game<T: Tunnel, F: Fn(Id) -> Option<T>>(&mut self, tunnel_finder: &F) {
        self.state = State::Results;

        let standings = self
            .rank_history
            .final_standings(self.scores().into_iter())
            .to_vec();
        let field_size = standings.len();
        for standing in &standings {
            let Some(player) = self.roster.get(standing.id) else {
                continue;
            };
            let unlocked = scoring::results_unlocks(
                standing.rank,
                !player.answered_log.is_empty(),
                player.flawless(),
                self.rank_history.was_ever_last(standing.id),
                field_size,
            );
            self.unlock_achievements(standing.id, &unlocked, tunnel_finder);
        }

        tracing::info!(code = %self.code, "game finished");
        self.announce(
            &UpdateMessage::Results {
                final_standings: self.standings_entries(),
            },
            tunnel_finder,
        );
    }

    /// Ends the game early at the host's request
    fn end_game<T: Tunnel, F: Fn(Id) -> Option<T>>(
        &mut self,
        player_id: Id,
        tunnel_finder: &F,
    ) -> Result<(), Error> {
        let player = self.roster.get(player_id).ok_or(Error::UnknownPlayer)?;
        if !player.is_host {
            return Err(Error::NotHost);
        }
        match self.state {
            State::InProgress(_) => {
                self.finish_game(tunnel_finder);
                Ok(())
            }
            // absorb retries the same way duplicate starts are absorbed
            State::Results => Ok(()),
            State::Waiting | State::LobbyPending => Err(Error::NotInProgress),
        }
    }

    /// Returns a finished room to the lobby with the same roster
    fn play_again<T: Tunnel, F: Fn(Id) -> Option<T>>(
        &mut self,
        player_id: Id,
        tunnel_finder: &F,
    ) -> Result<(), Error> {
        let player = self.roster.get(player_id).ok_or(Error::UnknownPlayer)?;
        if !player.is_host {
            return Err(Error::NotHost);
        }
        if !matches!(self.state, State::Results) {
            return Err(Error::NotInProgress);
        }

        for player in self.roster.players_mut() {
            player.reset_for_game();
        }
        self.first_correct_claimed = false;
        self.rank_history.reset();
        self.state = State::Waiting;
        tracing::info!(code = %self.code, "room reset for another round");

        self.announce(&self.room_update(), tunnel_finder);
        Ok(())
    }

    /// Marks a player's connection as dropped
    ///
    /// No immediate room mutation: their unanswered slot becomes an
    /// eventual timeout, and their record survives for a reconnect.
    pub fn mark_disconnected(&mut self, player_id: Id) {
        if let Some(player) = self.roster.get_mut(player_id) {
            player.connection = ConnectionState::Disconnected;
        }
    }

    /// Removes a player who left for good
    ///
    /// If the departing player was the host, host authority moves to
    /// the earliest-joined remaining player.
    pub fn remove_player<T: Tunnel, F: Fn(Id) -> Option<T>>(
        &mut self,
        player_id: Id,
        tunnel_finder: F,
    ) {
        let Some(removed) = self.roster.remove(player_id) else {
            return;
        };
        if removed.is_host {
            let next_host = self.roster.ids().next();
            if let Some(next_host) = next_host {
                if let Some(player) = self.roster.get_mut(next_host) {
                    player.is_host = true;
                }
            }
        }
        if !self.roster.is_empty() {
            self.announce(&self.room_update(), &tunnel_finder);
        }
    }

    /// Returns the message necessary to synchronize a player's view
    /// with the current room state
    pub fn state_message(&self, player_id: Id) -> SyncMessage {
        let players: Vec<PlayerSnapshot> =
            self.roster.players().map(PlayerSnapshot::of).collect();
        match &self.state {
            State::LobbyPending | State::Waiting => SyncMessage::Waiting { players },
            State::InProgress(current) => {
                let question = self
                    .bank
                    .get(current.index)
                    .expect("in-progress index is always in the bank");
                let deadline = self
                    .roster
                    .get(player_id)
                    .map_or(current.deadline, |p| {
                        self.personal_deadline(p, current.deadline)
                    });
                SyncMessage::InProgress {
                    index: current.index,
                    count: self.bank.len(),
                    question: question.view(),
                    deadline,
                    answered: current.answers.contains_key(&player_id),
                    players,
                }
            }
            State::Results => SyncMessage::Results {
                final_standings: self.standings_entries(),
            },
        }
    }

    /// Reconciles a restored connection into its existing player record
    ///
    /// Keyed by player id, not by transport connection: the player
    /// rejoins with prior state intact and receives a full snapshot of
    /// the current phase.
    pub fn update_session<T: Tunnel, F: Fn(Id) -> Option<T>>(
        &mut self,
        player_id: Id,
        tunnel_finder: F,
    ) {
        let Some(player) = self.roster.get_mut(player_id) else {
            return;
        };
        player.connection = ConnectionState::Connected;

        if let Some(tunnel) = tunnel_finder(player_id) {
            tunnel.send_state(&self.state_message(player_id));
        }
        self.announce(&self.room_update(), &tunnel_finder);
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::question::{Difficulty, Question};
    use std::{
        collections::VecDeque,
        sync::{Arc, Mutex},
    };

    #[derive(Debug, Clone, Default)]
    struct MockTunnel {
        messages: Arc<Mutex<VecDeque<UpdateMessage>>>,
        states: Arc<Mutex<VecDeque<SyncMessage>>>,
    }

    impl MockTunnel {
        fn drain(&self) -> Vec<UpdateMessage> {
            self.messages.lock().unwrap().drain(..).collect()
        }

        fn drain_states(&self) -> Vec<SyncMessage> {
            self.states.lock().unwrap().drain(..).collect()
        }
    }

    impl Tunnel for MockTunnel {
        fn send_message(&self, message: &UpdateMessage) {
            self.messages.lock().unwrap().push_back(message.clone());
        }

        fn send_state(&self, state: &SyncMessage) {
            self.states.lock().unwrap().push_back(state.clone());
        }

        fn close(self) {}
    }

    fn question(id: u32, correct_option: usize, base_points: u64) -> Question {
        Question {
            id,
            text: format!("Question {id}"),
            options: vec![
                "A".to_string(),
                "B".to_string(),
                "C".to_string(),
                "D".to_string(),
            ],
            correct_option,
            base_points,
            time_limit: std::time::Duration::from_secs(15),
            difficulty: Difficulty::Easy,
        }
    }

    fn test_bank() -> Arc<QuestionBank> {
        Arc::new(
            QuestionBank::new(vec![question(1, 2, 100), question(2, 1, 150), question(3, 0, 200)])
                .unwrap(),
        )
    }

    fn setup(players: usize) -> (Room, Vec<Id>, HashMap<Id, MockTunnel>) {
        let mut room = Room::new(RoomCode::generate(), test_bank(), Options::default());
        let mut tunnels = HashMap::new();
        let mut ids = Vec::new();
        for _ in 0..players {
            let id = Id::new();
            tunnels.insert(id, MockTunnel::default());
            ids.push(id);
        }
        {
            let finder = |id: Id| tunnels.get(&id).cloned();
            room.register_host(ids[0], "Host", "🎯".to_string(), &finder)
                .unwrap();
            for (i, id) in ids.iter().enumerate().skip(1) {
                room.join(*id, &format!("Player{i}"), "🎮".to_string(), &finder)
                    .unwrap();
            }
        }
        (room, ids, tunnels)
    }

    fn drain_all(tunnels: &HashMap<Id, MockTunnel>) {
        for tunnel in tunnels.values() {
            tunnel.drain();
            tunnel.drain_states();
        }
    }

    fn start_game(
        room: &mut Room,
        host: Id,
        tunnels: &HashMap<Id, MockTunnel>,
    ) -> Vec<(AlarmMessage, std::time::Duration)> {
        let finder = |id: Id| tunnels.get(&id).cloned();
        let mut alarms = Vec::new();
        room.receive_message(
            host,
            IncomingMessage::StartGame,
            |m, d| alarms.push((m, d)),
            &finder,
        );
        alarms
    }

    fn submit(
        room: &mut Room,
        player: Id,
        question_id: u32,
        selected_option: usize,
        tunnels: &HashMap<Id, MockTunnel>,
    ) -> Vec<(AlarmMessage, std::time::Duration)> {
        let finder = |id: Id| tunnels.get(&id).cloned();
        let mut alarms = Vec::new();
        room.receive_message(
            player,
            IncomingMessage::SubmitAnswer {
                question_id,
                selected_option,
            },
            |m, d| alarms.push((m, d)),
            &finder,
        );
        alarms
    }

    fn fire_deadline(
        room: &mut Room,
        index: usize,
        tunnels: &HashMap<Id, MockTunnel>,
    ) -> Vec<(AlarmMessage, std::time::Duration)> {
        let finder = |id: Id| tunnels.get(&id).cloned();
        let mut alarms = Vec::new();
        room.receive_alarm(
            AlarmMessage::QuestionDeadline { index },
            |m, d| alarms.push((m, d)),
            &finder,
        );
        alarms
    }

    /// Moves the current question's deadline far into the past
    fn force_deadline_past(room: &mut Room) {
        if let State::InProgress(current) = &mut room.state {
            current.deadline = SystemTime::now() - std::time::Duration::from_secs(60);
        }
    }

    fn current_index(room: &Room) -> usize {
        room.current_question().expect("room is in progress").index
    }

    #[test]
    fn test_register_host_opens_lobby() {
        let (room, ids, tunnels) = setup(1);
        assert!(matches!(room.state(), State::Waiting));
        assert_eq!(room.roster.host_id(), Some(ids[0]));

        let messages = tunnels[&ids[0]].drain();
        assert!(messages
            .iter()
            .any(|m| matches!(m, UpdateMessage::RoomCreated { code } if *code == room.code())));
        assert!(messages
            .iter()
            .any(|m| matches!(m, UpdateMessage::RoomUpdate { .. })));
    }

    #[test]
    fn test_join_broadcasts_roster() {
        let (room, ids, tunnels) = setup(3);
        assert_eq!(room.roster.len(), 3);

        let host_messages = tunnels[&ids[0]].drain();
        let joins = host_messages
            .iter()
            .filter(|m| matches!(m, UpdateMessage::PlayerJoined { .. }))
            .count();
        assert_eq!(joins, 2);
    }

    #[test]
    fn test_join_rejected_once_started() {
        let (mut room, ids, tunnels) = setup(2);
        start_game(&mut room, ids[0], &tunnels);

        let finder = |id: Id| tunnels.get(&id).cloned();
        assert!(matches!(
            room.join(Id::new(), "Latecomer", "🎮".to_string(), &finder),
            Err(Error::RoomAlreadyStarted)
        ));
    }

    #[test]
    fn test_start_requires_two_players() {
        let (mut room, ids, tunnels) = setup(1);
        drain_all(&tunnels);
        let alarms = start_game(&mut room, ids[0], &tunnels);

        assert!(alarms.is_empty());
        assert!(matches!(room.state(), State::Waiting));
        let messages = tunnels[&ids[0]].drain();
        assert!(messages.iter().any(|m| matches!(
            m,
            UpdateMessage::Rejected {
                reason: Error::NotEnoughPlayers
            }
        )));
    }

    #[test]
    fn test_start_requires_host() {
        let (mut room, ids, tunnels) = setup(2);
        drain_all(&tunnels);
        start_game(&mut room, ids[1], &tunnels);

        assert!(matches!(room.state(), State::Waiting));
        let messages = tunnels[&ids[1]].drain();
        assert!(messages.iter().any(|m| matches!(
            m,
            UpdateMessage::Rejected {
                reason: Error::NotHost
            }
        )));
    }

    #[test]
    fn test_start_broadcasts_first_question() {
        let (mut room, ids, tunnels) = setup(2);
        drain_all(&tunnels);
        let alarms = start_game(&mut room, ids[0], &tunnels);

        assert_eq!(current_index(&room), 0);
        assert_eq!(
            alarms,
            vec![(
                AlarmMessage::QuestionDeadline { index: 0 },
                std::time::Duration::from_secs(15)
                    + Options::default().answer_grace
            )]
        );

        for id in &ids {
            let messages = tunnels[id].drain();
            let started = messages
                .iter()
                .position(|m| matches!(m, UpdateMessage::GameStarted));
            let question = messages
                .iter()
                .position(|m| matches!(m, UpdateMessage::QuestionNext { index: 0, .. }));
            // every client observes the start before the question
            assert!(started.unwrap() < question.unwrap());
        }
    }

    #[test]
    fn test_duplicate_start_is_noop() {
        let (mut room, ids, tunnels) = setup(2);
        start_game(&mut room, ids[0], &tunnels);
        drain_all(&tunnels);

        let alarms = start_game(&mut room, ids[0], &tunnels);
        assert!(alarms.is_empty());
        assert_eq!(current_index(&room), 0);
        let messages = tunnels[&ids[0]].drain();
        assert!(messages.is_empty());
    }

    #[test]
    fn test_correct_answer_is_scored_authoritatively() {
        let (mut room, ids, tunnels) = setup(2);
        start_game(&mut room, ids[0], &tunnels);
        drain_all(&tunnels);

        submit(&mut room, ids[1], 1, 2, &tunnels);

        let player = room.roster.get(ids[1]).unwrap();
        assert_eq!(player.streak, 1);
        assert_eq!(player.combo, 2);
        assert_eq!(player.lives, room_constants::STARTING_LIVES);
        assert!(player.score > 0);

        let messages = tunnels[&ids[1]].drain();
        let result = messages
            .iter()
            .find_map(|m| match m {
                UpdateMessage::AnswerResult {
                    correct,
                    breakdown,
                    streak,
                    combo,
                    ..
                } => Some((*correct, *breakdown, *streak, *combo)),
                _ => None,
            })
            .expect("answer result sent to submitter");
        assert!(result.0);
        assert_eq!(result.1.total, player.score);
        assert_eq!(result.1.base, 100);
        assert_eq!(result.1.combo_bonus, 20);
        assert_eq!(result.2, 1);
        assert_eq!(result.3, 2);

        // the other player saw the notice and the roster, not the result
        let other = tunnels[&ids[0]].drain();
        assert!(other
            .iter()
            .any(|m| matches!(m, UpdateMessage::PlayerAnswered { correct: true, .. })));
        assert!(other
            .iter()
            .any(|m| matches!(m, UpdateMessage::RoomUpdate { .. })));
        assert!(!other
            .iter()
            .any(|m| matches!(m, UpdateMessage::AnswerResult { .. })));
    }

    #[test]
    fn test_wrong_answer_costs_a_life() {
        let (mut room, ids, tunnels) = setup(2);
        start_game(&mut room, ids[0], &tunnels);
        drain_all(&tunnels);

        submit(&mut room, ids[1], 1, 0, &tunnels);

        let player = room.roster.get(ids[1]).unwrap();
        assert_eq!(player.score, 0);
        assert_eq!(player.streak, 0);
        assert_eq!(player.combo, 1);
        assert_eq!(player.lives, room_constants::STARTING_LIVES - 1);
    }

    #[test]
    fn test_duplicate_answer_is_idempotent() {
        let (mut room, ids, tunnels) = setup(2);
        start_game(&mut room, ids[0], &tunnels);
        submit(&mut room, ids[1], 1, 2, &tunnels);

        let before = room.roster.get(ids[1]).unwrap().clone();
        drain_all(&tunnels);
        submit(&mut room, ids[1], 1, 2, &tunnels);

        let after = room.roster.get(ids[1]).unwrap();
        assert_eq!(after.score, before.score);
        assert_eq!(after.answered_log.len(), before.answered_log.len());
        let messages = tunnels[&ids[1]].drain();
        assert!(messages.iter().any(|m| matches!(
            m,
            UpdateMessage::Rejected {
                reason: Error::DuplicateAnswer
            }
        )));
    }

    #[test]
    fn test_stale_question_id_rejected() {
        let (mut room, ids, tunnels) = setup(2);
        start_game(&mut room, ids[0], &tunnels);
        drain_all(&tunnels);

        // question 2 is not on screen yet; a replayed event for it is stale
        submit(&mut room, ids[1], 2, 1, &tunnels);
        let messages = tunnels[&ids[1]].drain();
        assert!(messages.iter().any(|m| matches!(
            m,
            UpdateMessage::Rejected {
                reason: Error::StaleQuestion
            }
        )));
        assert!(room.roster.get(ids[1]).unwrap().answered_log.is_empty());
    }

    #[test]
    fn test_answer_past_deadline_rejected() {
        let (mut room, ids, tunnels) = setup(2);
        start_game(&mut room, ids[0], &tunnels);
        drain_all(&tunnels);
        force_deadline_past(&mut room);

        submit(&mut room, ids[1], 1, 2, &tunnels);
        let messages = tunnels[&ids[1]].drain();
        assert!(messages.iter().any(|m| matches!(
            m,
            UpdateMessage::Rejected {
                reason: Error::TooLate
            }
        )));
        assert_eq!(room.roster.get(ids[1]).unwrap().score, 0);
    }

    #[test]
    fn test_timeout_equivalent_to_wrong_answer() {
        let (mut room, ids, tunnels) = setup(3);
        start_game(&mut room, ids[0], &tunnels);

        // one player answers wrong at time-up, one never answers
        submit(&mut room, ids[1], 1, 3, &tunnels);
        force_deadline_past(&mut room);
        fire_deadline(&mut room, 0, &tunnels);

        let answered_wrong = room.roster.get(ids[1]).unwrap();
        let timed_out = room.roster.get(ids[2]).unwrap();
        assert_eq!(answered_wrong.streak, timed_out.streak);
        assert_eq!(answered_wrong.combo, timed_out.combo);
        assert_eq!(answered_wrong.lives, timed_out.lives);
        assert_eq!(answered_wrong.score, timed_out.score);
        assert_eq!(timed_out.lives, room_constants::STARTING_LIVES - 1);
        assert_eq!(timed_out.answered_log[0].selected, None);
    }

    #[test]
    fn test_deadline_advances_without_any_client() {
        let (mut room, ids, tunnels) = setup(2);
        start_game(&mut room, ids[0], &tunnels);
        for id in &ids {
            room.mark_disconnected(*id);
        }
        force_deadline_past(&mut room);

        // no tunnels resolve, the room still moves forward
        let empty: HashMap<Id, MockTunnel> = HashMap::new();
        let alarms = fire_deadline(&mut room, 0, &empty);
        assert_eq!(current_index(&room), 1);
        assert_eq!(
            alarms.first().map(|(m, _)| *m),
            Some(AlarmMessage::QuestionDeadline { index: 1 })
        );
    }

    #[test]
    fn test_stale_alarm_is_ignored() {
        let (mut room, ids, tunnels) = setup(2);
        start_game(&mut room, ids[0], &tunnels);
        submit(&mut room, ids[0], 1, 2, &tunnels);
        submit(&mut room, ids[1], 1, 2, &tunnels);
        assert_eq!(current_index(&room), 1);

        // the question 0 alarm fires after everyone already answered
        let before: Vec<u64> = room.roster.players().map(|p| p.score).collect();
        fire_deadline(&mut room, 0, &tunnels);
        assert_eq!(current_index(&room), 1);
        let after: Vec<u64> = room.roster.players().map(|p| p.score).collect();
        assert_eq!(before, after);
    }

    #[test]
    fn test_advances_when_all_active_answered() {
        let (mut room, ids, tunnels) = setup(2);
        start_game(&mut room, ids[0], &tunnels);
        drain_all(&tunnels);

        submit(&mut room, ids[0], 1, 2, &tunnels);
        assert_eq!(current_index(&room), 0);
        let alarms = submit(&mut room, ids[1], 1, 0, &tunnels);

        assert_eq!(current_index(&room), 1);
        assert_eq!(
            alarms.first().map(|(m, _)| *m),
            Some(AlarmMessage::QuestionDeadline { index: 1 })
        );

        // scoring broadcast for question 0 precedes question 1
        let messages = tunnels[&ids[0]].drain();
        let update = messages
            .iter()
            .position(|m| matches!(m, UpdateMessage::RoomUpdate { .. }))
            .unwrap();
        let next = messages
            .iter()
            .position(|m| matches!(m, UpdateMessage::QuestionNext { index: 1, .. }))
            .unwrap();
        assert!(update < next);
    }

    #[test]
    fn test_elimination_freezes_score_and_leaves_roster_visible() {
        let (mut room, ids, tunnels) = setup(3);
        start_game(&mut room, ids[0], &tunnels);
        room.roster.get_mut(ids[2]).unwrap().lives = 1;
        drain_all(&tunnels);

        submit(&mut room, ids[2], 1, 3, &tunnels);

        let eliminated = room.roster.get(ids[2]).unwrap();
        assert!(eliminated.is_eliminated());
        let frozen_score = eliminated.score;

        let messages = tunnels[&ids[2]].drain();
        assert!(messages.iter().any(|m| matches!(m, UpdateMessage::Eliminated)));

        // the roster broadcast still includes them
        let host_messages = tunnels[&ids[0]].drain();
        let update = host_messages
            .iter()
            .find_map(|m| match m {
                UpdateMessage::RoomUpdate { players } => Some(players.clone()),
                _ => None,
            })
            .unwrap();
        assert!(update.iter().any(|p| p.id == ids[2] && p.eliminated));

        // finish the question; the next broadcast excludes them
        submit(&mut room, ids[0], 1, 2, &tunnels);
        submit(&mut room, ids[1], 1, 2, &tunnels);
        let host_messages = tunnels[&ids[0]].drain();
        let active = host_messages
            .iter()
            .find_map(|m| match m {
                UpdateMessage::QuestionNext { active_players, .. } => Some(active_players.clone()),
                _ => None,
            })
            .unwrap();
        assert!(!active.contains(&ids[2]));
        assert!(active.contains(&ids[0]));

        // eliminated players cannot act on later questions
        drain_all(&tunnels);
        submit(&mut room, ids[2], 2, 1, &tunnels);
        assert_eq!(room.roster.get(ids[2]).unwrap().score, frozen_score);
        let messages = tunnels[&ids[2]].drain();
        assert!(messages.iter().any(|m| matches!(
            m,
            UpdateMessage::Rejected {
                reason: Error::Eliminated
            }
        )));
    }

    #[test]
    fn test_all_eliminated_ends_room() {
        let (mut room, ids, tunnels) = setup(2);
        start_game(&mut room, ids[0], &tunnels);
        for player in room.roster.players_mut() {
            player.lives = 1;
        }

        submit(&mut room, ids[0], 1, 3, &tunnels);
        submit(&mut room, ids[1], 1, 3, &tunnels);

        assert!(room.is_finished());
        let messages = tunnels[&ids[0]].drain();
        assert!(messages
            .iter()
            .any(|m| matches!(m, UpdateMessage::Results { .. })));
    }

    #[test]
    fn test_full_game_reaches_results_with_ranked_standings() {
        let (mut room, ids, tunnels) = setup(2);
        start_game(&mut room, ids[0], &tunnels);

        // host answers all three correctly, the other player never scores
        for (question_id, correct) in [(1, 2), (2, 1), (3, 0)] {
            submit(&mut room, ids[0], question_id, correct, &tunnels);
            submit(&mut room, ids[1], question_id, (correct + 1) % 4, &tunnels);
        }

        assert!(room.is_finished());
        let messages = tunnels[&ids[1]].drain();
        let standings = messages
            .iter()
            .find_map(|m| match m {
                UpdateMessage::Results { final_standings } => Some(final_standings.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(standings.len(), 2);
        assert_eq!(standings[0].id, ids[0]);
        assert_eq!(standings[0].rank, 1);
        assert_eq!(standings[1].id, ids[1]);
        assert_eq!(standings[1].rank, 2);
        assert!(standings[0].score > standings[1].score);

        // the flawless winner earned the accuracy achievements
        assert!(standings[0]
            .achievements
            .contains(&Achievement::Perfectionist));
        assert!(standings[0].achievements.contains(&Achievement::Untouchable));
        assert!(!standings[1]
            .achievements
            .contains(&Achievement::Perfectionist));
    }

    #[test]
    fn test_score_equals_sum_of_answered_log() {
        let (mut room, ids, tunnels) = setup(2);
        start_game(&mut room, ids[0], &tunnels);

        for (question_id, pick) in [(1, 2), (2, 0), (3, 0)] {
            submit(&mut room, ids[0], question_id, pick, &tunnels);
            submit(&mut room, ids[1], question_id, 1, &tunnels);
        }

        for id in &ids {
            let player = room.roster.get(*id).unwrap();
            let logged: u64 = player.answered_log.iter().map(|r| r.points_earned).sum();
            assert_eq!(player.score, logged);
        }
    }

    #[test]
    fn test_first_blood_goes_to_first_correct_only() {
        let (mut room, ids, tunnels) = setup(2);
        start_game(&mut room, ids[0], &tunnels);

        submit(&mut room, ids[1], 1, 2, &tunnels);
        submit(&mut room, ids[0], 1, 2, &tunnels);

        assert!(room
            .roster
            .get(ids[1])
            .unwrap()
            .achievements
            .contains(&Achievement::FirstBlood));
        assert!(!room
            .roster
            .get(ids[0])
            .unwrap()
            .achievements
            .contains(&Achievement::FirstBlood));
    }

    #[test]
    fn test_shield_absorbs_one_miss() {
        let (mut room, ids, tunnels) = setup(2);
        start_game(&mut room, ids[0], &tunnels);
        drain_all(&tunnels);

        let finder = |id: Id| tunnels.get(&id).cloned();
        room.receive_message(
            ids[1],
            IncomingMessage::UsePowerUp(PowerUp::Shield),
            |_, _| {},
            &finder,
        );
        let messages = tunnels[&ids[1]].drain();
        assert!(messages.iter().any(|m| matches!(m, UpdateMessage::ShieldArmed)));

        submit(&mut room, ids[1], 1, 3, &tunnels);
        let player = room.roster.get(ids[1]).unwrap();
        assert_eq!(player.lives, room_constants::STARTING_LIVES);
        assert!(!player.shield_armed);
        assert!(player.answered_log[0].shield_absorbed);
        // streak and combo still reset; the shield only protects the life
        assert_eq!(player.streak, 0);
        assert_eq!(player.combo, 1);

        // next miss is unprotected
        submit(&mut room, ids[0], 1, 2, &tunnels);
        submit(&mut room, ids[1], 2, 0, &tunnels);
        assert_eq!(
            room.roster.get(ids[1]).unwrap().lives,
            room_constants::STARTING_LIVES - 1
        );
    }

    #[test]
    fn test_fifty_fifty_removes_two_incorrect_options() {
        let (mut room, ids, tunnels) = setup(2);
        start_game(&mut room, ids[0], &tunnels);
        drain_all(&tunnels);

        let finder = |id: Id| tunnels.get(&id).cloned();
        room.receive_message(
            ids[1],
            IncomingMessage::UsePowerUp(PowerUp::FiftyFifty),
            |_, _| {},
            &finder,
        );

        let messages = tunnels[&ids[1]].drain();
        let removed = messages
            .iter()
            .find_map(|m| match m {
                UpdateMessage::FiftyFifty { removed } => Some(removed.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(removed.len(), 2);
        assert!(removed.iter().all_unique());
        // question 1's correct option is 2; it must survive the cut
        assert!(!removed.contains(&2));

        // the correctness check is untouched by the power-up
        submit(&mut room, ids[1], 1, 2, &tunnels);
        assert!(room.roster.get(ids[1]).unwrap().answered_log[0].correct);

        // no second offensive power-up on the same question
        drain_all(&tunnels);
        room.receive_message(
            ids[1],
            IncomingMessage::UsePowerUp(PowerUp::TimeFreeze),
            |_, _| {},
            &finder,
        );
        let messages = tunnels[&ids[1]].drain();
        assert!(messages.iter().any(|m| matches!(
            m,
            UpdateMessage::Rejected {
                reason: Error::PowerUpAlreadyUsed
            }
        )));
    }

    #[test]
    fn test_power_ups_are_finite() {
        let (mut room, ids, tunnels) = setup(2);
        start_game(&mut room, ids[0], &tunnels);
        let finder = |id: Id| tunnels.get(&id).cloned();

        room.receive_message(
            ids[1],
            IncomingMessage::UsePowerUp(PowerUp::FiftyFifty),
            |_, _| {},
            &finder,
        );
        // move to the next question so the per-question gate resets
        submit(&mut room, ids[0], 1, 2, &tunnels);
        submit(&mut room, ids[1], 1, 2, &tunnels);
        drain_all(&tunnels);

        room.receive_message(
            ids[1],
            IncomingMessage::UsePowerUp(PowerUp::FiftyFifty),
            |_, _| {},
            &finder,
        );
        let messages = tunnels[&ids[1]].drain();
        assert!(messages.iter().any(|m| matches!(
            m,
            UpdateMessage::Rejected {
                reason: Error::PowerUpExhausted
            }
        )));
    }

    #[test]
    fn test_time_freeze_extends_personal_deadline() {
        let (mut room, ids, tunnels) = setup(2);
        start_game(&mut room, ids[0], &tunnels);
        drain_all(&tunnels);

        let finder = |id: Id| tunnels.get(&id).cloned();
        room.receive_message(
            ids[1],
            IncomingMessage::UsePowerUp(PowerUp::TimeFreeze),
            |_, _| {},
            &finder,
        );

        let player = room.roster.get(ids[1]).unwrap();
        let override_deadline = player.deadline_override.unwrap();
        let room_deadline = room.current_question().unwrap().deadline;
        assert_eq!(
            override_deadline,
            room_deadline + Options::default().time_freeze_extension
        );

        // the frozen player's window stays open past the room deadline
        force_deadline_past(&mut room);
        submit(&mut room, ids[0], 1, 2, &tunnels);
        let alarms = fire_deadline(&mut room, 0, &tunnels);

        // host got timed out; the frozen player is still pending
        assert_eq!(current_index(&room), 0);
        assert!(room.roster.get(ids[1]).unwrap().answered_log.is_empty());
        // the alarm re-armed itself for the outstanding extension
        assert_eq!(
            alarms.first().map(|(m, _)| *m),
            Some(AlarmMessage::QuestionDeadline { index: 0 })
        );

        // once the extension lapses too, the timeout lands
        room.roster.get_mut(ids[1]).unwrap().deadline_override =
            Some(SystemTime::now() - std::time::Duration::from_secs(60));
        fire_deadline(&mut room, 0, &tunnels);
        assert_eq!(current_index(&room), 1);
        assert_eq!(
            room.roster.get(ids[1]).unwrap().lives,
            room_constants::STARTING_LIVES - 1
        );
    }

    #[test]
    fn test_end_game_short_circuits_to_results() {
        let (mut room, ids, tunnels) = setup(2);
        start_game(&mut room, ids[0], &tunnels);
        drain_all(&tunnels);

        let finder = |id: Id| tunnels.get(&id).cloned();
        room.receive_message(ids[0], IncomingMessage::EndGame, |_, _| {}, &finder);

        assert!(room.is_finished());
        let messages = tunnels[&ids[1]].drain();
        assert!(messages
            .iter()
            .any(|m| matches!(m, UpdateMessage::Results { .. })));
    }

    #[test]
    fn test_play_again_keeps_roster_and_achievements() {
        let (mut room, ids, tunnels) = setup(2);
        start_game(&mut room, ids[0], &tunnels);
        for (question_id, correct) in [(1, 2), (2, 1), (3, 0)] {
            submit(&mut room, ids[0], question_id, correct, &tunnels);
            submit(&mut room, ids[1], question_id, correct, &tunnels);
        }
        assert!(room.is_finished());

        let finder = |id: Id| tunnels.get(&id).cloned();
        room.receive_message(ids[0], IncomingMessage::PlayAgain, |_, _| {}, &finder);

        assert!(matches!(room.state(), State::Waiting));
        assert_eq!(room.roster.len(), 2);
        let host = room.roster.get(ids[0]).unwrap();
        assert_eq!(host.score, 0);
        assert!(host.answered_log.is_empty());
        // achievements are per room session, not per round
        assert!(host.achievements.contains(&Achievement::FirstBlood));
    }

    #[test]
    fn test_reconnect_restores_same_player() {
        let (mut room, ids, tunnels) = setup(2);
        start_game(&mut room, ids[0], &tunnels);
        submit(&mut room, ids[1], 1, 2, &tunnels);
        let score_before = room.roster.get(ids[1]).unwrap().score;

        room.mark_disconnected(ids[1]);
        assert_eq!(
            room.roster.get(ids[1]).unwrap().connection,
            ConnectionState::Disconnected
        );
        assert_eq!(room.roster.len(), 2);

        drain_all(&tunnels);
        let finder = |id: Id| tunnels.get(&id).cloned();
        room.update_session(ids[1], &finder);

        let player = room.roster.get(ids[1]).unwrap();
        assert_eq!(player.connection, ConnectionState::Connected);
        assert_eq!(player.score, score_before);

        let states = tunnels[&ids[1]].drain_states();
        assert!(matches!(
            states.first(),
            Some(SyncMessage::InProgress {
                index: 0,
                answered: true,
                ..
            })
        ));
    }

    #[test]
    fn test_host_leaving_promotes_next_player() {
        let (mut room, ids, tunnels) = setup(3);
        let finder = |id: Id| tunnels.get(&id).cloned();
        room.remove_player(ids[0], &finder);

        assert_eq!(room.roster.len(), 2);
        assert_eq!(room.roster.host_id(), Some(ids[1]));
    }

    #[test]
    fn test_snapshot_round_trip_preserves_player_state() {
        let (mut room, ids, tunnels) = setup(2);
        start_game(&mut room, ids[0], &tunnels);
        room.roster.get_mut(ids[1]).unwrap().shield_armed = true;
        for (question_id, pick) in [(1, 2), (2, 0)] {
            submit(&mut room, ids[0], question_id, pick, &tunnels);
            submit(&mut room, ids[1], question_id, 3, &tunnels);
        }

        let json = serde_json::to_string(&room).unwrap();
        let restored: Room = serde_json::from_str(&json).unwrap();

        for id in &ids {
            let original = room.roster.get(*id).unwrap();
            let rebuilt = restored.roster.get(*id).unwrap();
            assert_eq!(rebuilt.score, original.score);
            assert_eq!(rebuilt.answered_log, original.answered_log);

            let replayed = player::replay_log(&rebuilt.answered_log);
            assert_eq!(replayed.score, original.score);
            assert_eq!(replayed.streak, original.streak);
            assert_eq!(replayed.combo, original.combo);
            assert_eq!(replayed.lives, original.lives);
        }
    }
}
