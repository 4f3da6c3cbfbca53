//! Command handlers

pub mod config;
pub mod kv;
pub mod maintenance;
pub mod status;
pub mod transfer;
