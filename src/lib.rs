//! # Quizclash Game Library
//!
//! This library provides the core engine for real-time multiplayer
//! quiz battles. It handles battle rooms, player rosters, the
//! synchronized question loop, server-authoritative scoring with
//! combos, streaks, power-ups and achievements, and real-time
//! synchronization between all connected clients.
//!
//! The engine is sans-IO: it never owns sockets or timers. A host
//! process delivers messages through the [`session::Tunnel`] trait,
//! resolves player connections through a `tunnel_finder` closure, and
//! arms server-side timers through a `schedule_alarm` closure, echoing
//! each [`room::AlarmMessage`] back into the engine when it fires.

#![cfg_attr(all(coverage_nightly, test), feature(coverage_attribute))]
#![deny(missing_docs)]
#![deny(rustdoc::missing_crate_level_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::too_many_arguments)]
#![allow(clippy::similar_names)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::ignored_unit_patterns)]
#![allow(clippy::struct_field_names)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::wildcard_imports)]

pub mod code;
pub mod constants;
pub mod player;
pub mod question;
pub mod registry;
pub mod room;
pub mod scoring;
pub mod session;
