//! courier client configs

use std::time::Duration;

use crate::{pool::PoolConfig, publisher::ExecutionMode, retry::DEFAULT_BACKOFF};

/// Publish pool workers
pub const DEFAULT_PUBLISH_POOL_SIZE: usize = 10;
/// Publish pool queue, beyond this publishes run on the caller
pub const DEFAULT_PUBLISH_QUEUE_CAPACITY: usize = 100;
/// Seen pool workers
pub const DEFAULT_SEEN_POOL_SIZE: usize = 20;
/// Seen pool queue
pub const DEFAULT_SEEN_QUEUE_CAPACITY: usize = 100;
/// Recovery pool workers. More than one lets an overlapping tick reach the
/// recovery slot and be skipped instead of waiting behind the schedule.
pub const DEFAULT_RECOVERY_POOL_SIZE: usize = 2;
/// Recovery pool queue
pub const DEFAULT_RECOVERY_QUEUE_CAPACITY: usize = 2;
/// Seconds between unseen recovery runs
pub const DEFAULT_RECOVERY_PERIOD: u64 = 20;
/// Seconds pools and schedules get to drain on shutdown
pub const DEFAULT_SHUTDOWN_GRACE: u64 = 10;

/// Runtime settings of the delivery control plane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryConfig {
    /// pool running async publishes
    pub publish_pool: PoolConfig,
    /// pool running `AsyncSeen` acknowledgements
    pub seen_pool: PoolConfig,
    /// pool running recovery ticks
    pub recovery_pool: PoolConfig,
    /// fixed delay between publish attempts
    pub publish_backoff: Duration,
    /// period of the unseen recovery job
    pub recovery_period: Duration,
    /// bounded wait for pools and schedules on shutdown
    pub shutdown_grace: Duration,
    /// execution mode of events whose publish requests leave it unset
    pub event_modes: Vec<(String, ExecutionMode)>,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            publish_pool: PoolConfig::new(DEFAULT_PUBLISH_POOL_SIZE, DEFAULT_PUBLISH_QUEUE_CAPACITY),
            seen_pool: PoolConfig::new(DEFAULT_SEEN_POOL_SIZE, DEFAULT_SEEN_QUEUE_CAPACITY),
            recovery_pool: PoolConfig::new(DEFAULT_RECOVERY_POOL_SIZE, DEFAULT_RECOVERY_QUEUE_CAPACITY),
            publish_backoff: DEFAULT_BACKOFF,
            recovery_period: Duration::from_secs(DEFAULT_RECOVERY_PERIOD),
            shutdown_grace: Duration::from_secs(DEFAULT_SHUTDOWN_GRACE),
            event_modes: Vec::new(),
        }
    }
}

pub mod cli {
    //! Parse from either cli or env var

    use std::{net::SocketAddr, path::PathBuf, time::Duration};

    pub use clap::Parser;

    use super::*;

    /// Default external api
    pub static DEFAULT_EXTERNAL_API: &str = "[::]:3333";
    /// default NATS server list
    pub static DEFAULT_NATS_SERVERS: &str = "nats://127.0.0.1:4222";
    /// default service name, stamped on every envelope
    pub static DEFAULT_SERVICE_NAME: &str = "courier";
    /// default broker subject prefix
    pub static DEFAULT_SUBJECT_PREFIX: &str = "courier";
    /// default NATS security mode
    pub static DEFAULT_NATS_SECURITY_MODE: &str = "none";
    /// default tokio worker thread name
    pub static DEFAULT_THREAD_NAME: &str = "courier-worker";
    /// default publish backoff in millis
    pub const DEFAULT_PUBLISH_BACKOFF_MS: u64 = 5_000;
    /// default NATS request timeout in millis
    pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 2_000;
    /// default NATS connect timeout in seconds
    pub const DEFAULT_CONNECT_TIMEOUT: u64 = 5;
    /// default NATS connect retries after the first attempt
    pub const DEFAULT_CONNECT_RETRY_MAX: u32 = 10;
    /// default log level. Can use this argument or COURIER_LOG env var
    pub const DEFAULT_COURIER_LOG: &str = "info";
    /// log as "json", "pretty" or "standard" (unstructured)
    pub const DEFAULT_LOG_FORMAT: &str = "standard";

    #[derive(Parser, Debug, Clone, PartialEq, Eq)]
    #[clap(author, name = "courier", bin_name = "courier", about, long_about = None)]
    /// parses from cli & environment var. courier will load `.env` in the same dir as the binary as well
    pub struct Config {
        /// comma separated NATS server urls
        #[clap(long, env, value_parser, value_delimiter = ',', default_value = DEFAULT_NATS_SERVERS)]
        pub nats_servers: Vec<String>,
        /// name of this service, stamped on outgoing envelopes
        #[clap(long, env, value_parser, default_value = DEFAULT_SERVICE_NAME)]
        pub service_name: String,
        /// prefix of the broker subjects (`<prefix>.publish`, `<prefix>.unseen`, `<prefix>.seen`)
        #[clap(long, env, value_parser, default_value = DEFAULT_SUBJECT_PREFIX)]
        pub subject_prefix: String,
        /// none, user_password, token, nkey, tls or creds_file
        #[clap(long, env, value_parser, default_value = DEFAULT_NATS_SECURITY_MODE)]
        pub nats_security_mode: String,
        /// user for user_password mode
        #[clap(long, env, value_parser)]
        pub nats_user: Option<String>,
        /// password for user_password mode
        #[clap(long, env, value_parser)]
        pub nats_password: Option<String>,
        /// token for token mode
        #[clap(long, env, value_parser)]
        pub nats_token: Option<String>,
        /// nkey seed file for nkey mode
        #[clap(long, env, value_parser)]
        pub nats_nkey_seed_path: Option<PathBuf>,
        /// client certificate for tls mode
        #[clap(long, env, value_parser)]
        pub nats_tls_cert_path: Option<PathBuf>,
        /// client key for tls mode
        #[clap(long, env, value_parser)]
        pub nats_tls_key_path: Option<PathBuf>,
        /// root CA, enables tls in any mode
        #[clap(long, env, value_parser)]
        pub nats_tls_ca_path: Option<PathBuf>,
        /// credentials file for creds_file mode
        #[clap(long, env, value_parser)]
        pub nats_creds_file_path: Option<PathBuf>,
        /// seconds before a connect attempt times out
        #[clap(long, env, value_parser, default_value_t = DEFAULT_CONNECT_TIMEOUT)]
        pub nats_connect_timeout: u64,
        /// connect attempts after the first before giving up at startup
        #[clap(long, env, value_parser, default_value_t = DEFAULT_CONNECT_RETRY_MAX)]
        pub nats_connect_retry_max: u32,
        /// millis to wait for a request reply
        #[clap(long, env, value_parser, default_value_t = DEFAULT_REQUEST_TIMEOUT_MS)]
        pub nats_request_timeout_ms: u64,
        /// the address the external api listens on
        #[clap(long, env, value_parser, default_value = DEFAULT_EXTERNAL_API)]
        pub external_api: SocketAddr,
        /// publish pool workers
        #[clap(long, env, value_parser, default_value_t = DEFAULT_PUBLISH_POOL_SIZE)]
        pub publish_pool_size: usize,
        /// publish pool queue capacity
        #[clap(long, env, value_parser, default_value_t = DEFAULT_PUBLISH_QUEUE_CAPACITY)]
        pub publish_queue_capacity: usize,
        /// millis between publish attempts
        #[clap(long, env, value_parser, default_value_t = DEFAULT_PUBLISH_BACKOFF_MS)]
        pub publish_backoff_ms: u64,
        /// seen pool workers
        #[clap(long, env, value_parser, default_value_t = DEFAULT_SEEN_POOL_SIZE)]
        pub seen_pool_size: usize,
        /// seen pool queue capacity
        #[clap(long, env, value_parser, default_value_t = DEFAULT_SEEN_QUEUE_CAPACITY)]
        pub seen_queue_capacity: usize,
        /// recovery pool workers
        #[clap(long, env, value_parser, default_value_t = DEFAULT_RECOVERY_POOL_SIZE)]
        pub recovery_pool_size: usize,
        /// seconds between unseen recovery runs
        #[clap(long, env, value_parser, default_value_t = DEFAULT_RECOVERY_PERIOD)]
        pub recovery_period: u64,
        /// seconds to wait for pools to drain on shutdown
        #[clap(long, env, value_parser, default_value_t = DEFAULT_SHUTDOWN_GRACE)]
        pub shutdown_grace: u64,
        /// comma separated events published on the pool unless the caller says otherwise
        #[clap(long, env, value_parser, value_delimiter = ',')]
        pub async_events: Vec<String>,
        /// comma separated channels whose messages are logged by the binary
        #[clap(long, env, value_parser, value_delimiter = ',')]
        pub tap_channels: Vec<String>,
        /// Worker thread name
        #[clap(long, env, value_parser, default_value = DEFAULT_THREAD_NAME)]
        pub thread_name: String,
        /// set the log level. All valid RUST_LOG arguments are accepted
        #[clap(long, env, value_parser, default_value = DEFAULT_COURIER_LOG)]
        pub courier_log: String,
        /// log output format: standard, json or pretty
        #[clap(long, env, value_parser, default_value = DEFAULT_LOG_FORMAT)]
        pub log_format: String,
    }

    impl Config {
        /// connect timeout as `Duration`
        pub fn nats_connect_timeout(&self) -> Duration {
            Duration::from_secs(self.nats_connect_timeout)
        }

        /// request timeout as `Duration`
        pub fn nats_request_timeout(&self) -> Duration {
            Duration::from_millis(self.nats_request_timeout_ms)
        }

        /// shutdown grace as `Duration`
        pub fn shutdown_grace(&self) -> Duration {
            Duration::from_secs(self.shutdown_grace)
        }

        /// delivery settings for the control plane
        pub fn delivery(&self) -> DeliveryConfig {
            DeliveryConfig {
                publish_pool: PoolConfig::new(self.publish_pool_size, self.publish_queue_capacity),
                seen_pool: PoolConfig::new(self.seen_pool_size, self.seen_queue_capacity),
                recovery_pool: PoolConfig::new(
                    self.recovery_pool_size,
                    DEFAULT_RECOVERY_QUEUE_CAPACITY,
                ),
                publish_backoff: Duration::from_millis(self.publish_backoff_ms),
                recovery_period: Duration::from_secs(self.recovery_period),
                shutdown_grace: self.shutdown_grace(),
                event_modes: self
                    .async_events
                    .iter()
                    .map(|event| event.trim())
                    .filter(|event| !event.is_empty())
                    .map(|event| (event.to_owned(), ExecutionMode::Async))
                    .collect(),
            }
        }
    }
}

pub mod trace {
    //! tracing configuration
    use anyhow::Result;
    use tracing_subscriber::{
        filter::EnvFilter,
        fmt::{
            self,
            format::{Format, PrettyFields},
        },
        prelude::__tracing_subscriber_SubscriberExt,
        util::SubscriberInitExt,
    };

    /// Configuration for the global subscriber
    #[derive(Debug)]
    pub struct Config {
        /// formatting to apply to logs
        pub log_frmt: String,
    }

    impl Config {
        /// Install the global subscriber. Level comes from `courier_log`,
        /// format is one of "json", "pretty" or "standard".
        pub fn parse(courier_log: &str, log_frmt: &str) -> Result<Self> {
            let filter = EnvFilter::try_new(courier_log)
                .or_else(|_| EnvFilter::try_new("info"))?
                .add_directive("hyper=off".parse()?)
                .add_directive("async_nats=warn".parse()?);

            match log_frmt {
                "json" => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(fmt::layer().json())
                        .try_init()?;
                }
                "pretty" => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(
                            fmt::layer()
                                .event_format(
                                    Format::default().pretty().with_source_location(false),
                                )
                                .fmt_fields(PrettyFields::new()),
                        )
                        .try_init()?;
                }
                _ => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(fmt::layer())
                        .try_init()?;
                }
            }

            Ok(Self {
                log_frmt: log_frmt.to_owned(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{cli::Parser, *};

    #[test]
    fn test_defaults() {
        let config = cli::Config::parse_from(["courier"]);
        assert_eq!(config.nats_servers, vec![cli::DEFAULT_NATS_SERVERS.to_owned()]);
        assert_eq!(config.courier_log, "info");
        assert_eq!(config.log_format, "standard");

        let delivery = config.delivery();
        assert_eq!(delivery, DeliveryConfig::default());
        assert_eq!(delivery.publish_backoff, Duration::from_secs(5));
        assert_eq!(delivery.recovery_period, Duration::from_secs(20));
        assert_eq!(delivery.publish_pool, PoolConfig::new(10, 100));
        assert_eq!(delivery.seen_pool, PoolConfig::new(20, 100));
        assert_eq!(delivery.shutdown_grace, Duration::from_secs(10));
    }

    #[test]
    fn test_overrides() {
        let config = cli::Config::parse_from([
            "courier",
            "--nats-servers",
            "nats://a:4222,nats://b:4222",
            "--publish-backoff-ms",
            "250",
            "--async-events",
            "orders.created, ,audit.logged",
        ]);
        assert_eq!(config.nats_servers.len(), 2);

        let delivery = config.delivery();
        assert_eq!(delivery.publish_backoff, Duration::from_millis(250));
        assert_eq!(
            delivery.event_modes,
            vec![
                ("orders.created".to_owned(), ExecutionMode::Async),
                ("audit.logged".to_owned(), ExecutionMode::Async),
            ]
        );
    }
}
