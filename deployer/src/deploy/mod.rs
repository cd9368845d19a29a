//! Deployment stages

pub mod activate;
pub mod fsm;
pub mod retention;
pub mod secrets;
pub mod strategy;
pub mod transfer;
