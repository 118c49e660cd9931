//! Question bank records and validation
//!
//! This module defines the immutable question records that drive a
//! battle and the ordered bank they are served from. The bank is
//! read-only, validated once at construction, and shared across all
//! rooms; rooms never mutate it.

use std::time::Duration;

use garde::Validate;
use serde::{Deserialize, Serialize};

use crate::constants::question::{
    MAX_OPTION_LENGTH, MAX_TEXT_LENGTH, MAX_TIME_LIMIT, MIN_TIME_LIMIT, OPTION_COUNT,
};

type ValidationResult = garde::Result;

/// Validates that a question's time limit falls within the allowed bounds
fn validate_time_limit(val: &Duration) -> ValidationResult {
    if (MIN_TIME_LIMIT..=MAX_TIME_LIMIT).contains(&val.as_secs()) {
        Ok(())
    } else {
        Err(garde::Error::new(format!(
            "time_limit is outside of the bounds [{MIN_TIME_LIMIT},{MAX_TIME_LIMIT}]",
        )))
    }
}

/// Validates that the correct-option index points at a real option
fn validate_correct_option(val: &usize) -> ValidationResult {
    if *val < OPTION_COUNT {
        Ok(())
    } else {
        Err(garde::Error::new(format!(
            "correct_option must be below {OPTION_COUNT}",
        )))
    }
}

/// How hard a question is, used for display and deck balancing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Difficulty {
    /// Low-stakes warm-up question
    Easy,
    /// Standard question
    Medium,
    /// High-value question, typically with a shorter time limit
    Hard,
}

/// A single immutable question record
///
/// Every question carries exactly four options and the index of the
/// correct one. The correct index never leaves the server; clients see
/// a [`QuestionView`] instead.
#[serde_with::serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct Question {
    /// Stable identifier of the question within its bank
    #[garde(skip)]
    pub id: u32,
    /// The question text shown to all players
    #[garde(length(max = MAX_TEXT_LENGTH))]
    pub text: String,
    /// The four answer options, in display order
    #[garde(length(min = OPTION_COUNT, max = OPTION_COUNT), inner(length(max = MAX_OPTION_LENGTH)))]
    pub options: Vec<String>,
    /// Index into `options` of the correct answer
    #[garde(custom(|v, _| validate_correct_option(v)))]
    pub correct_option: usize,
    /// Points awarded for a correct answer before bonuses
    #[garde(skip)]
    pub base_points: u64,
    /// Time players have to answer once the question is broadcast
    #[garde(custom(|v, _| validate_time_limit(v)))]
    #[serde_as(as = "serde_with::DurationMilliSeconds<u64>")]
    pub time_limit: Duration,
    /// Difficulty tier of the question
    #[garde(skip)]
    pub difficulty: Difficulty,
}

impl Question {
    /// Returns the player-facing view of this question
    ///
    /// The view carries everything a client needs to render the
    /// question except the correct-option index.
    pub fn view(&self) -> QuestionView {
        QuestionView {
            id: self.id,
            text: self.text.clone(),
            options: self.options.clone(),
            base_points: self.base_points,
            time_limit: self.time_limit,
            difficulty: self.difficulty,
        }
    }

    /// Indices of the options that are not the correct answer
    pub(crate) fn incorrect_options(&self) -> Vec<usize> {
        (0..self.options.len())
            .filter(|i| *i != self.correct_option)
            .collect()
    }
}

/// The wire representation of a question, with the answer withheld
#[serde_with::serde_as]
#[derive(Debug, Clone, Serialize)]
pub struct QuestionView {
    /// Stable identifier of the question within its bank
    pub id: u32,
    /// The question text shown to all players
    pub text: String,
    /// The four answer options, in display order
    pub options: Vec<String>,
    /// Points awarded for a correct answer before bonuses
    pub base_points: u64,
    /// Time players have to answer once the question is broadcast
    #[serde_as(as = "serde_with::DurationMilliSeconds<u64>")]
    pub time_limit: Duration,
    /// Difficulty tier of the question
    pub difficulty: Difficulty,
}

/// Validates that question ids within a bank are unique
fn validate_unique_ids(questions: &[Question]) -> ValidationResult {
    let mut seen = std::collections::HashSet::new();
    for q in questions {
        if !seen.insert(q.id) {
            return Err(garde::Error::new(format!("duplicate question id {}", q.id)));
        }
    }
    Ok(())
}

/// An ordered, immutable sequence of questions
///
/// Banks are validated once and then shared read-only across every
/// room in the process.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct QuestionBank {
    /// The questions in play order
    #[garde(length(min = 1), dive, custom(|v, _| validate_unique_ids(v)))]
    questions: Vec<Question>,
}

impl QuestionBank {
    /// Builds a bank from an ordered list of questions
    ///
    /// # Errors
    ///
    /// Returns a validation report if the list is empty, any record is
    /// malformed, or two records share an id.
    pub fn new(questions: Vec<Question>) -> Result<Self, garde::Report> {
        let bank = Self { questions };
        bank.validate()?;
        Ok(bank)
    }

    /// Returns the question at `index`, if any
    pub fn get(&self, index: usize) -> Option<&Question> {
        self.questions.get(index)
    }

    /// Returns the number of questions in this bank
    pub fn len(&self) -> usize {
        self.questions.len()
    }

    /// Checks whether this bank contains any questions
    pub fn is_empty(&self) -> bool {
        self.questions.is_empty()
    }
}
