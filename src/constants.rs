//! Configuration constants for the quiz battle engine
//!
//! This module contains the limits and tuning values used throughout
//! the engine to ensure data integrity and provide consistent
//! boundaries for rooms, questions, scoring, and power-ups.

/// Room roster and lifecycle constants
pub mod room {
    /// Maximum number of players allowed in a single battle room
    pub const MAX_PLAYER_COUNT: usize = 8;
    /// Minimum number of players required before the host may start
    pub const MIN_PLAYER_COUNT: usize = 2;
    /// Lives each player starts a game with
    pub const STARTING_LIVES: u8 = 3;
    /// Extra time in seconds accepted past the deadline for in-flight answers
    pub const ANSWER_GRACE_SECONDS: u64 = 2;
}

/// Room code constants
pub mod code {
    /// Number of characters in a room code
    pub const LENGTH: usize = 6;
    /// Alphabet room codes are drawn from (36^6 possible codes)
    pub const ALPHABET: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";
}

/// Question record constants
pub mod question {
    /// Number of answer options every question carries
    pub const OPTION_COUNT: usize = 4;
    /// Maximum length of question text in characters
    pub const MAX_TEXT_LENGTH: usize = 200;
    /// Maximum length of a single answer option in characters
    pub const MAX_OPTION_LENGTH: usize = 200;
    /// Minimum time limit in seconds for answering a question
    pub const MIN_TIME_LIMIT: u64 = 5;
    /// Maximum time limit in seconds for answering a question
    pub const MAX_TIME_LIMIT: u64 = 240;
}

/// Scoring formula constants
pub mod scoring {
    /// Ceiling of the speed bonus awarded for an instant correct answer
    pub const TIME_BONUS_CEILING: u64 = 50;
    /// Points awarded per combo level on a correct answer
    pub const COMBO_BONUS_PER_LEVEL: u64 = 10;
    /// Flat bonus awarded while a streak is at or above the threshold
    pub const STREAK_BONUS: u64 = 50;
    /// Streak length at which the streak bonus applies
    pub const STREAK_BONUS_THRESHOLD: u32 = 5;
    /// Answer latency in seconds under which Speed Demon unlocks
    pub const SPEED_DEMON_SECONDS: u64 = 3;
    /// Combo levels at which a milestone callout is attached to the result
    pub const COMBO_MILESTONES: [u32; 4] = [3, 5, 7, 10];
}

/// Power-up constants
pub mod power_up {
    /// Uses of each power-up granted at game start
    pub const USES_PER_GAME: u8 = 1;
    /// Seconds added to a player's personal deadline by a time freeze
    pub const TIME_FREEZE_SECONDS: u64 = 10;
    /// Number of incorrect options removed by a fifty-fifty
    pub const FIFTY_FIFTY_REMOVALS: usize = 2;
}

/// Display name constants
pub mod display_name {
    /// Maximum length of a display name in characters
    pub const MAX_LENGTH: usize = 30;
}
