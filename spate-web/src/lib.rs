//! spate web - HTTP surface
//!
//! Thin axum adapter over the stream registry: admission, status, and the
//! wait-for-file semantics ABR players need when playlists and segments are
//! still being written.

pub mod handlers;
pub mod server;

pub use server::{AppState, router, run_server};
