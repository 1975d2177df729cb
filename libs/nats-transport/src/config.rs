//! Connection settings for [`NatsClient`](crate::NatsClient).

use std::{fmt, path::PathBuf, str::FromStr, time::Duration};

use courier_core::config::cli;

use crate::error::NatsError;

/// How the client authenticates to the NATS servers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum NatsSecurityMode {
    /// no authentication
    #[default]
    None,
    /// `user` and `password`
    UserPassword,
    /// shared token
    Token,
    /// nkey seed read from a file
    Nkey,
    /// client certificate
    Tls,
    /// `.creds` file
    CredsFile,
}

impl FromStr for NatsSecurityMode {
    type Err = NatsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "none" => Ok(Self::None),
            "user_password" | "userpassword" => Ok(Self::UserPassword),
            "token" => Ok(Self::Token),
            "nkey" => Ok(Self::Nkey),
            "tls" => Ok(Self::Tls),
            "creds_file" | "credsfile" => Ok(Self::CredsFile),
            other => Err(NatsError::Config(format!(
                "unknown nats security mode '{other}'"
            ))),
        }
    }
}

impl fmt::Display for NatsSecurityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NatsSecurityMode::None => write!(f, "none"),
            NatsSecurityMode::UserPassword => write!(f, "user_password"),
            NatsSecurityMode::Token => write!(f, "token"),
            NatsSecurityMode::Nkey => write!(f, "nkey"),
            NatsSecurityMode::Tls => write!(f, "tls"),
            NatsSecurityMode::CredsFile => write!(f, "creds_file"),
        }
    }
}

/// NATS connection settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NatsConfig {
    /// server urls
    pub servers: Vec<String>,
    /// stamped on every outgoing envelope and broker request
    pub service_name: String,
    /// prefix of the broker subjects
    pub subject_prefix: String,
    /// authentication mode
    pub security_mode: NatsSecurityMode,
    /// user for `UserPassword`
    pub username: Option<String>,
    /// password for `UserPassword`
    pub password: Option<String>,
    /// token for `Token`
    pub token: Option<String>,
    /// seed file for `Nkey`
    pub nkey_seed_path: Option<PathBuf>,
    /// client certificate for `Tls`
    pub tls_cert_path: Option<PathBuf>,
    /// client key for `Tls`
    pub tls_key_path: Option<PathBuf>,
    /// root CA, turns on TLS in every mode
    pub tls_ca_path: Option<PathBuf>,
    /// credentials for `CredsFile`
    pub creds_file_path: Option<PathBuf>,
    /// per-attempt connect timeout
    pub connect_timeout: Option<Duration>,
    /// connect attempts after the first before giving up
    pub connect_retry_max: u32,
    /// how long a request waits for its reply
    pub request_timeout: Option<Duration>,
}

impl TryFrom<&cli::Config> for NatsConfig {
    type Error = NatsError;

    fn try_from(config: &cli::Config) -> Result<Self, Self::Error> {
        let servers = config
            .nats_servers
            .iter()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
            .collect::<Vec<_>>();
        if servers.is_empty() {
            return Err(NatsError::Config("no nats servers configured".into()));
        }
        Ok(Self {
            servers,
            service_name: config.service_name.clone(),
            subject_prefix: config.subject_prefix.clone(),
            security_mode: config.nats_security_mode.parse()?,
            username: config.nats_user.clone(),
            password: config.nats_password.clone(),
            token: config.nats_token.clone(),
            nkey_seed_path: config.nats_nkey_seed_path.clone(),
            tls_cert_path: config.nats_tls_cert_path.clone(),
            tls_key_path: config.nats_tls_key_path.clone(),
            tls_ca_path: config.nats_tls_ca_path.clone(),
            creds_file_path: config.nats_creds_file_path.clone(),
            connect_timeout: Some(config.nats_connect_timeout()),
            connect_retry_max: config.nats_connect_retry_max,
            request_timeout: Some(config.nats_request_timeout()),
        })
    }
}

#[cfg(test)]
mod tests {
    use courier_core::config::cli::Parser;

    use super::*;

    #[test]
    fn test_security_mode_parse() {
        assert_eq!("none".parse::<NatsSecurityMode>().unwrap(), NatsSecurityMode::None);
        assert_eq!(
            "USER_PASSWORD".parse::<NatsSecurityMode>().unwrap(),
            NatsSecurityMode::UserPassword
        );
        assert_eq!(
            " creds_file ".parse::<NatsSecurityMode>().unwrap(),
            NatsSecurityMode::CredsFile
        );
        assert!(matches!(
            "kerberos".parse::<NatsSecurityMode>(),
            Err(NatsError::Config(_))
        ));
        assert_eq!(NatsSecurityMode::Nkey.to_string(), "nkey");
    }

    #[test]
    fn test_from_cli() {
        let cli = cli::Config::parse_from([
            "courier",
            "--nats-servers",
            "nats://a:4222, nats://b:4222",
            "--nats-security-mode",
            "token",
            "--nats-token",
            "secret",
            "--nats-request-timeout-ms",
            "750",
        ]);
        let config = NatsConfig::try_from(&cli).unwrap();
        assert_eq!(config.servers, vec!["nats://a:4222", "nats://b:4222"]);
        assert_eq!(config.security_mode, NatsSecurityMode::Token);
        assert_eq!(config.token.as_deref(), Some("secret"));
        assert_eq!(config.request_timeout, Some(Duration::from_millis(750)));
        assert_eq!(config.connect_retry_max, cli::DEFAULT_CONNECT_RETRY_MAX);
    }

    #[test]
    fn test_from_cli_bad_mode() {
        let cli = cli::Config::parse_from(["courier", "--nats-security-mode", "magic"]);
        assert!(NatsConfig::try_from(&cli).is_err());
    }
}
