//! Room code generation and management
//!
//! This module provides functionality for generating and managing the
//! short human-readable codes that identify battle rooms. Codes are six
//! uppercase alphanumeric characters so they are easy to communicate
//! verbally or type on a phone.

use std::{fmt::Display, str::FromStr};

use serde_with::{DeserializeFromStr, SerializeDisplay};
use thiserror::Error;

use crate::constants::code::{ALPHABET, LENGTH};

/// A short identifier for a battle room
///
/// Room codes are drawn uniformly from a 36-character alphabet, giving
/// a 36^6 code space. Collisions with live rooms are negligible at that
/// size but are still handled by the registry, which retries generation
/// until it finds a free code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, SerializeDisplay, DeserializeFromStr)]
pub struct RoomCode([u8; LENGTH]);

/// Errors that can occur when parsing a room code from a string
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    /// The string is not exactly six characters long
    #[error("room code must be exactly {LENGTH} characters")]
    WrongLength,
    /// The string contains a character outside the code alphabet
    #[error("room code may only contain digits and letters")]
    InvalidCharacter,
}

impl RoomCode {
    /// Creates a new random room code
    pub fn generate() -> Self {
        let mut chars = [0u8; LENGTH];
        for c in &mut chars {
            *c = ALPHABET[fastrand::usize(..ALPHABET.len())];
        }
        Self(chars)
    }

    /// Returns the code as a string slice
    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.0).expect("code alphabet is ascii")
    }
}

impl Display for RoomCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RoomCode {
    type Err = ParseError;

    /// Parses a room code, uppercasing lowercase letters so codes can
    /// be typed without holding shift
    ///
    /// # Errors
    ///
    /// Returns a [`ParseError`] if the string is not exactly six
    /// characters from the code alphabet.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = s.as_bytes();
        if bytes.len() != LENGTH {
            return Err(ParseError::WrongLength);
        }
        let mut chars = [0u8; LENGTH];
        for (slot, b) in chars.iter_mut().zip(bytes) {
            let upper = b.to_ascii_uppercase();
            if !ALPHABET.contains(&upper) {
                return Err(ParseError::InvalidCharacter);
            }
            *slot = upper;
        }
        Ok(Self(chars))
    }
}
