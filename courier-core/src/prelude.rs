//! courier prelude

pub use crate::{
    CourierClient, DeliveryError, DeliveryResult,
    anyhow::{self, Context, Result},
    async_trait,
    listener::{ErrorHandler, ErrorStrategy, EventListener, HandlerPolicy, ListenerEntry},
    publisher::{ExecutionMode, PublishRequest},
    state::{ConnectionRefresher, LifecycleHooks, StateNotifier},
    tokio,
    tracing::{self, debug, error, info, instrument, trace, warn},
    transport::{ConnectionState, PublishStrategy, ResponseHandler},
};

pub use std::sync::Arc;
