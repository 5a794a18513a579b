//! HTTP front end for a long-lived, interactive `melotts` synthesis process.
//!
//! One child process is spawned at startup and spoken to over its line
//! oriented stdin/stdout prompt protocol. Callers submit jobs through a
//! [`bridge::SynthesisBridge`]; a single worker task owns the child's streams
//! and services jobs strictly in arrival order.

pub mod args;
pub mod audio;
pub mod bridge;
pub mod config;
pub mod error;
pub mod logging;
pub mod protocol;
pub mod queue;
pub mod reader;
pub mod server;
pub mod supervisor;
