//! Scoring engine and achievements
//!
//! This module computes points, combo and streak bonuses, and
//! achievement unlocks from answer outcomes. Everything here is pure:
//! no I/O, no clocks, no room state. The room state machine feeds it a
//! context per answer and applies whatever it returns.

use std::{collections::HashSet, time::Duration};

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::{
    constants::scoring::{
        COMBO_BONUS_PER_LEVEL, COMBO_MILESTONES, SPEED_DEMON_SECONDS, STREAK_BONUS,
        STREAK_BONUS_THRESHOLD, TIME_BONUS_CEILING,
    },
    player::Id,
};

/// Everything the engine needs to score one answer
///
/// `combo_after` and `streak_after` are the values the answer produces,
/// not the values before it: a correct answer at combo 2 scores with
/// `combo_after = 3`.
#[derive(Debug, Clone, Copy)]
pub struct AnswerContext {
    /// Points the question is worth before bonuses
    pub base_points: u64,
    /// The question's full time budget
    pub time_limit: Duration,
    /// Whole seconds left on the player's deadline at submission
    pub seconds_remaining: u64,
    /// Combo level after this answer is applied
    pub combo_after: u32,
    /// Streak length after this answer is applied
    pub streak_after: u32,
    /// Whether no one in the room answered correctly before this
    pub is_first_correct_in_room: bool,
    /// Time from question broadcast to this submission
    pub answer_latency: Duration,
}

/// The itemized output of scoring one answer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PointsBreakdown {
    /// The question's base points (zero on a miss)
    pub base: u64,
    /// Speed bonus, scaled by remaining time
    pub time_bonus: u64,
    /// Combo bonus, scaled by the combo level
    pub combo_bonus: u64,
    /// Flat streak bonus, if the streak threshold is met
    pub streak_bonus: u64,
    /// Sum of all components
    pub total: u64,
}

/// Scores a single answer
///
/// A miss (wrong answer or timeout) earns nothing; a correct answer
/// earns `base + time_bonus + combo_bonus + streak_bonus` where:
///
/// * `time_bonus = floor(seconds_remaining / time_limit * 50)`
/// * `combo_bonus = combo_after * 10`
/// * `streak_bonus = 50` once the streak reaches 5
pub fn score_answer(correct: bool, ctx: &AnswerContext) -> PointsBreakdown {
    if !correct {
        return PointsBreakdown::default();
    }

    let limit_seconds = ctx.time_limit.as_secs().max(1);
    let time_bonus =
        (ctx.seconds_remaining.min(limit_seconds) * TIME_BONUS_CEILING) / limit_seconds;
    let combo_bonus = u64::from(ctx.combo_after) * COMBO_BONUS_PER_LEVEL;
    let streak_bonus = if ctx.streak_after >= STREAK_BONUS_THRESHOLD {
        STREAK_BONUS
    } else {
        0
    };

    PointsBreakdown {
        base: ctx.base_points,
        time_bonus,
        combo_bonus,
        streak_bonus,
        total: ctx.base_points + time_bonus + combo_bonus + streak_bonus,
    }
}

/// Returns the combo milestone hit by this answer, if any
///
/// Milestones fire exactly when the combo lands on one of the
/// celebrated levels, so each is announced once per climb.
pub fn combo_milestone(combo_after: u32) -> Option<u32> {
    COMBO_MILESTONES.contains(&combo_after).then_some(combo_after)
}

/// The achievements a player can unlock, each at most once per room session
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Achievement {
    /// First correct answer in the room
    FirstBlood,
    /// Any correct answer in under three seconds
    SpeedDemon,
    /// Streak reached five
    StreakMaster,
    /// Finished with 100% accuracy
    Perfectionist,
    /// Finished without a single wrong answer
    Untouchable,
    /// Finished first after having been in last place
    ComebackKing,
}

impl Achievement {
    /// Human-readable title of the achievement
    pub fn title(self) -> &'static str {
        match self {
            Self::FirstBlood => "First Blood",
            Self::SpeedDemon => "Speed Demon",
            Self::StreakMaster => "Streak Master",
            Self::Perfectionist => "Perfectionist",
            Self::Untouchable => "Untouchable",
            Self::ComebackKing => "Comeback King",
        }
    }
}

/// Achievements that can unlock the moment an answer is scored
pub fn instant_unlocks(correct: bool, ctx: &AnswerContext) -> Vec<Achievement> {
    let mut unlocked = Vec::new();
    if !correct {
        return unlocked;
    }
    if ctx.is_first_correct_in_room {
        unlocked.push(Achievement::FirstBlood);
    }
    if ctx.answer_latency < Duration::from_secs(SPEED_DEMON_SECONDS) {
        unlocked.push(Achievement::SpeedDemon);
    }
    if ctx.streak_after >= STREAK_BONUS_THRESHOLD {
        unlocked.push(Achievement::StreakMaster);
    }
    unlocked
}

/// Achievements judged against the whole game, at results time
///
/// `flawless` means every logged answer was correct; Comeback King
/// additionally requires the rank history to have seen the player in
/// last place at some earlier scoreboard snapshot.
pub fn results_unlocks(
    rank: usize,
    answered_any: bool,
    flawless: bool,
    was_ever_last: bool,
    field_size: usize,
) -> Vec<Achievement> {
    let mut unlocked = Vec::new();
    if answered_any && flawless {
        unlocked.push(Achievement::Perfectionist);
        unlocked.push(Achievement::Untouchable);
    }
    if rank == 1 && was_ever_last && field_size > 1 {
        unlocked.push(Achievement::ComebackKing);
    }
    unlocked
}

/// One row of the final standings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Standing {
    /// The player this row belongs to
    pub id: Id,
    /// Their final score
    pub score: u64,
    /// Their final rank, 1-indexed; ties break by join order
    pub rank: usize,
}

/// Scoreboard history retained for rank-sensitive achievements
///
/// After every scoring update the room records a snapshot; the history
/// remembers which players have ever sat in last place, and lazily
/// computes the final standings once the game ends.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct RankHistory {
    /// Players who have been in last place at any snapshot
    been_last: HashSet<Id>,
    /// Final standings, computed once at results time
    #[serde(skip)]
    final_standings: once_cell_serde::sync::OnceCell<Vec<Standing>>,
}

impl RankHistory {
    /// Records a scoreboard snapshot
    ///
    /// Every player tied for the lowest score counts as being in last
    /// place. Snapshots of fewer than two players are ignored.
    pub fn record_snapshot(&mut self, scores: impl Iterator<Item = (Id, u64)>) {
        let scores = scores.collect_vec();
        if scores.len() < 2 {
            return;
        }
        let Some(lowest) = scores.iter().map(|(_, s)| *s).min() else {
            return;
        };
        for (id, score) in scores {
            if score == lowest {
                self.been_last.insert(id);
            }
        }
    }

    /// Whether a player has ever been in last place
    pub fn was_ever_last(&self, id: Id) -> bool {
        self.been_last.contains(&id)
    }

    /// Computes (once) and returns the final standings
    ///
    /// `scores` must be in join order; the descending sort is stable,
    /// so tied players keep their join order.
    pub fn final_standings(&self, scores: impl Iterator<Item = (Id, u64)>) -> &[Standing] {
        self.final_standings.get_or_init(|| {
            scores
                .sorted_by_key(|(_, score)| std::cmp::Reverse(*score))
                .enumerate()
                .map(|(index, (id, score))| Standing {
                    id,
                    score,
                    rank: index + 1,
                })
                .collect_vec()
        })
    }

    /// Clears the history for a fresh competitive phase
    pub fn reset(&mut self) {
        self.been_last.clear();
        self.final_standings = once_cell_serde::sync::OnceCell::new();
    }
}
