//! Remote session management
//!
//! Everything that touches the target host goes through [`ssh::Session`].
//! Local processes go through a [`runner::CommandRunner`] so both sides can
//! be replaced in tests.

pub mod quote;
pub mod runner;
pub mod ssh;
