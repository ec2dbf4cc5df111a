//! Turnstile - Request Admission for HTTP Services
//!
//! This crate implements a sliding-window request admission layer. Every
//! non-exempt request is charged against a per-endpoint budget (when one is
//! configured for its path) and a global per-client budget whose size
//! depends on the caller's identity tier. Counter state lives in process
//! memory and is reclaimed by a background sweeper.

pub mod auth;
pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
