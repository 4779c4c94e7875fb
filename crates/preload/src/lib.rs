//! Preloader: a long-lived process that keeps selected processors' warm
//! state (loaded models, started subprocesses) in memory and executes
//! individual jobs on request over a Unix-domain socket.
//!
//! The [`server`] side preloads the processors listed in the corpus
//! `preload` config section and serves jobs with a bounded worker pool per
//! processor. The [`client`] side implements the scheduler's
//! `RemoteDispatcher` capability with immediate-refusal semantics: a busy
//! pool or a configuration mismatch makes the caller fall back to local
//! execution.

pub mod client;
pub mod server;

pub use client::PreloadClient;
pub use server::{PreloadServer, ServerConfig};
