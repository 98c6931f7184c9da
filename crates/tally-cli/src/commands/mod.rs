//! Command handlers

pub mod checkin;
pub mod config;
pub mod log;
pub mod status;
