//! # courier
//!
//! Reliable delivery control plane for a NATS-backed message bus client:
//! connection state handling, listener registration, unseen message recovery
//! and retried publishing.
#![warn(
    missing_debug_implementations,
    missing_docs,
    missing_copy_implementations,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![allow(clippy::cognitive_complexity)]
#![deny(rustdoc::broken_intra_doc_links)]
#![doc(test(
    no_crate_inject,
    attr(deny(warnings, rust_2018_idioms), allow(dead_code, unused_variables))
))]
pub use anyhow;
pub use async_trait::async_trait;
pub use tokio;
pub use tokio_util;
pub use tracing;

pub use crate::{
    client::CourierClient,
    error::{DeliveryError, DeliveryResult},
};

pub mod client;
pub mod config;
pub mod error;
pub mod listener;
pub mod metrics;
pub mod pool;
pub mod prelude;
pub mod publisher;
pub mod recovery;
pub mod registry;
pub mod retry;
pub mod scheduler;
pub mod seen;
pub mod state;
pub mod transport;
