//! Deploy request data model

pub mod request;
pub mod secrets;
