//! Async HTTP/SSE edge, concurrency kernel, and pipeline orchestrator (C9–C11).
//!
//! Exposed as a library, with a thin `main.rs` binary on top, so integration
//! tests under `tests/` can drive [`orchestrator::handle_request`] end to end
//! against [`llm_client::MockLlm`]/[`warehouse_client::MockWarehouse`] without
//! a live warehouse or model, matching the `spec.md` §8 scenario list.

pub mod background;
pub mod concurrency;
pub mod error;
pub mod http;
pub mod llm_client;
pub mod orchestrator;
pub mod persistence;
pub mod warehouse_client;
