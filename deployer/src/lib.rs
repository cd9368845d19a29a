//! nixdeploy library
//!
//! Deploys a NixOS system closure to a remote host over one multiplexed SSH
//! connection: secrets first, then build and copy, activation, and finally
//! best-effort pruning of old generations.

pub mod app;
pub mod deploy;
pub mod errors;
pub mod eval;
pub mod filesys;
pub mod logs;
pub mod models;
pub mod session;
pub mod storage;
pub mod utils;
