//! btc15m-recorder
//!
//! Library surface for the recorder binary and its tests.

pub mod auth;
pub mod collector;
pub mod config;
pub mod discovery;
pub mod exchange;
pub mod feeds;
pub mod models;
