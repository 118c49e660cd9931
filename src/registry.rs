//! Room registry and lifecycle management
//!
//! This module owns the process-wide mapping from room codes to live
//! rooms. It allocates collision-free codes, routes events and alarms
//! to the right room, and evicts rooms that sit idle or linger in
//! their results phase.
//!
//! Concurrency model: the registry's map has its own lock, and every
//! room sits behind its own lock. Lock order is always map before
//! room, the map lock is never held while waiting on a room during
//! routing, and eviction flags an entry under its room lock so it can
//! never race an in-flight event. Cross-room operations run in
//! parallel; mutations to one room are serialized.

use std::{
    collections::{HashMap, hash_map::Entry},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use garde::Validate;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use web_time::SystemTime;

use crate::{
    code::RoomCode,
    player::Id,
    question::QuestionBank,
    room::{self, AlarmMessage, IncomingMessage, Room},
    session::Tunnel,
};

/// Lifecycle configuration for the registry
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Validate)]
pub struct Config {
    /// How long a room may have no connected player before eviction
    #[garde(skip)]
    pub idle_grace: Duration,
    /// How long a room may sit in its results phase before eviction
    #[garde(skip)]
    pub results_grace: Duration,
    /// Options applied to every room this registry creates
    #[garde(dive)]
    pub room: room::Options,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            idle_grace: Duration::from_secs(5 * 60),
            results_grace: Duration::from_secs(10 * 60),
            room: room::Options::default(),
        }
    }
}

/// Errors produced by registry operations
#[derive(Error, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// No live room carries the given code
    #[error("room not found")]
    RoomNotFound,
    /// The targeted room rejected the operation
    #[error(transparent)]
    Room(#[from] room::Error),
}

impl From<crate::player::Error> for Error {
    fn from(error: crate::player::Error) -> Self {
        Self::Room(error.into())
    }
}

/// One registered room with its lifecycle bookkeeping
struct RoomEntry {
    room: Room,
    /// Last instant the room had at least one connected player
    last_connected: SystemTime,
    /// When the room entered its results phase, if it is there now
    results_since: Option<SystemTime>,
    /// Set under the room lock at eviction; late events that raced the
    /// sweep see the flag and treat the room as gone
    evicted: bool,
}

impl RoomEntry {
    fn new(room: Room) -> Self {
        Self {
            room,
            last_connected: SystemTime::now(),
            results_since: None,
            evicted: false,
        }
    }

    /// Refreshes the idle and results clocks after an operation
    fn note_activity(&mut self) {
        let now = SystemTime::now();
        if self.room.roster.any_connected() {
            self.last_connected = now;
        }
        self.results_since = if self.room.is_finished() {
            Some(self.results_since.unwrap_or(now))
        } else {
            None
        };
    }
}

/// The authoritative mapping from room codes to live rooms
///
/// One registry exists per server process; its lifetime is the
/// process's. The question bank is shared read-only across every room
/// it creates.
pub struct Registry {
    rooms: Mutex<HashMap<RoomCode, Arc<Mutex<RoomEntry>>>>,
    bank: Arc<QuestionBank>,
    config: Config,
}

fn relock<'a, T>(guard: Result<MutexGuard<'a, T>, PoisonError<MutexGuard<'a, T>>>) -> MutexGuard<'a, T> {
    guard.unwrap_or_else(PoisonError::into_inner)
}

impl Registry {
    /// Creates a registry serving questions from the given bank
    pub fn new(bank: Arc<QuestionBank>, config: Config) -> Self {
        Self {
            rooms: Mutex::new(HashMap::new()),
            bank,
            config,
        }
    }

    /// Number of live rooms
    pub fn room_count(&self) -> usize {
        relock(self.rooms.lock()).len()
    }

    fn entry(&self, code: RoomCode) -> Option<Arc<Mutex<RoomEntry>>> {
        relock(self.rooms.lock()).get(&code).cloned()
    }

    /// Runs an operation under the room's lock, with bookkeeping
    fn with_entry<R>(
        &self,
        code: RoomCode,
        operation: impl FnOnce(&mut RoomEntry) -> R,
    ) -> Result<R, Error> {
        let entry = self.entry(code).ok_or(Error::RoomNotFound)?;
        let mut guard = relock(entry.lock());
        if guard.evicted {
            return Err(Error::RoomNotFound);
        }
        let out = operation(&mut guard);
        guard.note_activity();
        Ok(out)
    }

    /// Read-only access to a room's current state
    ///
    /// Returns `None` for unknown codes.
    pub fn with_room<R>(
        &self,
        code: RoomCode,
        operation: impl FnOnce(&Room) -> R,
    ) -> Option<R> {
        self.with_entry(code, |entry| operation(&entry.room)).ok()
    }

    /// Allocates a room and registers its creator as the host
    ///
    /// Code generation retries on collision; the odds are negligible
    /// in a 36^6 space but the loop makes them irrelevant.
    ///
    /// # Errors
    ///
    /// Returns a roster error if the host's display name fails
    /// validation; no room is left behind in that case.
    pub fn create_room<T: Tunnel, F: Fn(Id) -> Option<T>>(
        &self,
        host_id: Id,
        display_name: &str,
        avatar_glyph: String,
        tunnel_finder: F,
    ) -> Result<RoomCode, Error> {
        let code = {
            let mut rooms = relock(self.rooms.lock());
            loop {
                let code = RoomCode::generate();
                if let Entry::Vacant(vacant) = rooms.entry(code) {
                    vacant.insert(Arc::new(Mutex::new(RoomEntry::new(Room::new(
                        code,
                        Arc::clone(&self.bank),
                        self.config.room,
                    )))));
                    break code;
                }
            }
        };

        let registered = self.with_entry(code, |entry| {
            entry
                .room
                .register_host(host_id, display_name, avatar_glyph, tunnel_finder)
        })?;
        if let Err(error) = registered {
            relock(self.rooms.lock()).remove(&code);
            return Err(error.into());
        }
        Ok(code)
    }

    /// Admits a player to the room with the given code
    ///
    /// # Errors
    ///
    /// * [`Error::RoomNotFound`] for unknown codes
    /// * [`Error::Room`] when the room is full, already started, or
    ///   the display name fails validation
    pub fn join_room<T: Tunnel, F: Fn(Id) -> Option<T>>(
        &self,
        code: RoomCode,
        player_id: Id,
        display_name: &str,
        avatar_glyph: String,
        tunnel_finder: F,
    ) -> Result<(), Error> {
        self.with_entry(code, |entry| {
            entry
                .room
                .join(player_id, display_name, avatar_glyph, tunnel_finder)
        })?
        .map_err(Error::from)
    }

    /// Routes a client event to its room
    ///
    /// Room-level failures are acknowledged to the sender by the room
    /// itself; only an unknown code surfaces here.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RoomNotFound`] for unknown codes.
    pub fn dispatch<T: Tunnel, F: Fn(Id) -> Option<T>, S: FnMut(AlarmMessage, Duration)>(
        &self,
        code: RoomCode,
        player_id: Id,
        message: IncomingMessage,
        schedule_alarm: S,
        tunnel_finder: F,
    ) -> Result<(), Error> {
        self.with_entry(code, |entry| {
            entry
                .room
                .receive_message(player_id, message, schedule_alarm, tunnel_finder);
        })
    }

    /// Routes a fired alarm to its room
    ///
    /// Alarms for rooms that were evicted in the meantime are dropped
    /// silently; a timer is not a client and gets no rejection.
    pub fn alarm<T: Tunnel, F: Fn(Id) -> Option<T>, S: FnMut(AlarmMessage, Duration)>(
        &self,
        code: RoomCode,
        alarm: AlarmMessage,
        schedule_alarm: S,
        tunnel_finder: F,
    ) {
        let _ = self.with_entry(code, |entry| {
            entry.room.receive_alarm(alarm, schedule_alarm, tunnel_finder);
        });
    }

    /// Marks a player's connection as dropped
    pub fn disconnect(&self, code: RoomCode, player_id: Id) {
        let _ = self.with_entry(code, |entry| entry.room.mark_disconnected(player_id));
    }

    /// Reconciles a restored connection into its player record
    ///
    /// # Errors
    ///
    /// Returns [`Error::RoomNotFound`] for unknown codes.
    pub fn reconnect<T: Tunnel, F: Fn(Id) -> Option<T>>(
        &self,
        code: RoomCode,
        player_id: Id,
        tunnel_finder: F,
    ) -> Result<(), Error> {
        self.with_entry(code, |entry| {
            entry.room.update_session(player_id, tunnel_finder);
        })
    }

    /// Removes a player who left for good, destroying the room if it
    /// is now empty
    pub fn leave<T: Tunnel, F: Fn(Id) -> Option<T>>(
        &self,
        code: RoomCode,
        player_id: Id,
        tunnel_finder: F,
    ) {
        let emptied = self
            .with_entry(code, |entry| {
                entry.room.remove_player(player_id, tunnel_finder);
                entry.room.roster.is_empty()
            })
            .unwrap_or(false);
        if emptied {
            self.remove_if(code, |entry| entry.room.roster.is_empty());
        }
    }

    /// Removes a room from the map if the predicate still holds under
    /// its lock
    fn remove_if(&self, code: RoomCode, predicate: impl Fn(&RoomEntry) -> bool) {
        let mut rooms = relock(self.rooms.lock());
        if let Some(entry) = rooms.get(&code) {
            let mut guard = relock(entry.lock());
            if predicate(&guard) {
                guard.evicted = true;
                drop(guard);
                rooms.remove(&code);
                tracing::info!(%code, "room destroyed");
            }
        }
    }

    /// Sweeps out rooms that are empty, idle past the grace period, or
    /// parked in results past theirs
    ///
    /// The sweep takes each room's lock before removing it, so it
    /// serializes with in-flight events instead of racing them.
    pub fn evict_idle(&self) -> Vec<RoomCode> {
        let now = SystemTime::now();
        let mut evicted = Vec::new();
        let mut rooms = relock(self.rooms.lock());
        rooms.retain(|code, entry| {
            let mut guard = relock(entry.lock());
            let idle = now
                .duration_since(guard.last_connected)
                .is_ok_and(|d| d > self.config.idle_grace);
            let parked = guard
                .results_since
                .and_then(|since| now.duration_since(since).ok())
                .is_some_and(|d| d > self.config.results_grace);
            if guard.room.roster.is_empty() || idle || parked {
                guard.evicted = true;
                evicted.push(*code);
                tracing::info!(code = %code, idle, parked, "room evicted");
                false
            } else {
                true
            }
        });
        evicted
    }
}
