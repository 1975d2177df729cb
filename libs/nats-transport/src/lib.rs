//! # nats-transport
//!
//! async-nats adapter for the courier delivery control plane.
//!
//! This library provides:
//! - **Connection manager** ([`NatsClient`]) with bounded connect retry,
//!   optional auth/encryption modes, server list refresh and forwarding of
//!   connect/disconnect events to a [`StateNotifier`].
//! - **Transport and broker** ([`NatsTransport`]) implementing the
//!   [`Transport`] and [`Broker`] boundaries.
//! - **Subject resolver** for the broker endpoints under a configurable
//!   prefix.
//! - **Wire models** for envelopes, unseen queries and seen notices.
//!
//! [`StateNotifier`]: courier_core::state::StateNotifier
//! [`Transport`]: courier_core::transport::Transport
//! [`Broker`]: courier_core::transport::Broker

pub mod client;
pub mod config;
pub mod error;
pub mod models;
mod security;
pub mod subjects;
pub mod transport;

pub use client::{NatsClient, ServerProvider, StaticServers};
pub use config::{NatsConfig, NatsSecurityMode};
pub use error::{NatsError, NatsResult};
pub use models::MessageEnvelope;
pub use subjects::{BrokerSubject, SubjectResolver};
pub use transport::{NatsSubscription, NatsTransport};
