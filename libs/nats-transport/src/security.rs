//! Authentication and TLS settings applied to async-nats connect options.

use std::path::Path;

use async_nats::ConnectOptions;

use crate::{
    config::{NatsConfig, NatsSecurityMode},
    error::{NatsError, NatsResult},
};

/// Credentials resolved from a [`NatsConfig`], borrowed from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Credentials<'a> {
    Anonymous,
    UserPassword { user: &'a str, password: &'a str },
    Token(&'a str),
    NkeySeed(&'a Path),
    ClientCert { cert: &'a Path, key: &'a Path },
    CredsFile(&'a Path),
}

fn required<'a, T: ?Sized>(
    value: Option<&'a T>,
    mode: NatsSecurityMode,
    field: &str,
) -> NatsResult<&'a T> {
    value.ok_or_else(|| NatsError::Config(format!("{mode} security mode requires '{field}'")))
}

impl NatsConfig {
    /// Credentials for the configured mode, or the first missing field.
    pub(crate) fn credentials(&self) -> NatsResult<Credentials<'_>> {
        let mode = self.security_mode;
        Ok(match mode {
            NatsSecurityMode::None => Credentials::Anonymous,
            NatsSecurityMode::UserPassword => Credentials::UserPassword {
                user: required(self.username.as_deref(), mode, "username")?,
                password: required(self.password.as_deref(), mode, "password")?,
            },
            NatsSecurityMode::Token => {
                Credentials::Token(required(self.token.as_deref(), mode, "token")?)
            }
            NatsSecurityMode::Nkey => {
                Credentials::NkeySeed(required(self.nkey_seed_path.as_deref(), mode, "nkey_seed_path")?)
            }
            NatsSecurityMode::Tls => Credentials::ClientCert {
                cert: required(self.tls_cert_path.as_deref(), mode, "tls_cert_path")?,
                key: required(self.tls_key_path.as_deref(), mode, "tls_key_path")?,
            },
            NatsSecurityMode::CredsFile => {
                Credentials::CredsFile(required(self.creds_file_path.as_deref(), mode, "creds_file_path")?)
            }
        })
    }

    /// True if the connection must be encrypted: client certificates or a
    /// custom root CA in any mode.
    pub(crate) fn requires_tls(&self) -> bool {
        self.security_mode == NatsSecurityMode::Tls || self.tls_ca_path.is_some()
    }

    /// Apply credentials and TLS settings to `options`. Reads seed and creds
    /// files from disk.
    pub(crate) async fn secure(&self, mut options: ConnectOptions) -> NatsResult<ConnectOptions> {
        options = match self.credentials()? {
            Credentials::Anonymous => options,
            Credentials::UserPassword { user, password } => {
                options.user_and_password(user.to_owned(), password.to_owned())
            }
            Credentials::Token(token) => options.token(token.to_owned()),
            Credentials::NkeySeed(path) => {
                let seed = tokio::fs::read_to_string(path).await.map_err(|e| {
                    NatsError::Config(format!("failed to read nkey seed file '{}': {e}", path.display()))
                })?;
                options.nkey(seed.trim().to_owned())
            }
            Credentials::ClientCert { cert, key } => {
                options.add_client_certificate(cert.to_path_buf(), key.to_path_buf())
            }
            Credentials::CredsFile(path) => options.credentials_file(path).await.map_err(|e| {
                NatsError::Config(format!("failed to load credentials file '{}': {e}", path.display()))
            })?,
        };
        if let Some(ca) = &self.tls_ca_path {
            options = options.add_root_certificates(ca.clone());
        }
        if self.requires_tls() {
            options = options.require_tls(true);
        }
        Ok(options)
    }
}
