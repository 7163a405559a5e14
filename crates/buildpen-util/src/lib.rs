//! Shared helpers for buildpen backends.
//!
//! This crate holds the two pieces every backend needs before it can run a
//! command in a target environment: POSIX shell escaping for commands that
//! must travel as a single string, and the personality prefix that makes
//! 32-bit builds behave correctly under a 64-bit kernel.

pub mod personality;
pub mod shell;

pub use personality::{set_personality, PersonalityError};
pub use shell::{escape_args, shell_escape};
