//! speql — core library for a speculative SQL assistant.
//!
//! This crate holds the synchronous, warehouse-independent half of the
//! system: clause extraction, formatting, the rewrite algebra, the
//! temp-table pool, the sampling strategy, the activity controller, and the
//! contract types for the debug loop. None of these modules perform I/O —
//! the async orchestration, warehouse/LLM clients, and the HTTP/SSE edge
//! live in the sibling `speql-server` binary crate, which depends on this
//! one.
#![allow(dead_code)]

pub mod activity;
pub mod config;
pub mod create_engine;
pub mod debug;
pub mod error;
pub mod formatter;
pub mod hash;
pub mod pool;
pub mod rewriter;
pub mod sampling;
pub mod sql;

pub use config::Config;
pub use error::{Result, SpeqlError, SpeqlErrorKind};
