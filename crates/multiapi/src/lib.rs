//! Multi-API - one OpenAI-compatible endpoint in front of many providers
//!
//! This crate provides a gateway daemon that forwards every call to the
//! currently active provider, rewriting the credential and (optionally) the
//! requested model, and can record all traffic into debug trace files.

pub mod admin;
pub mod config;
pub mod error;
pub mod proxy;
pub mod registry;
pub mod testing;
pub mod trace;

pub use error::MultiApiError;
