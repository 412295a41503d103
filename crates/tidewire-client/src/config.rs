//! Connection configuration.

use std::path::PathBuf;
use std::time::Duration;

use tidewire_proto::prelogin::EncryptionLevel;
use tidewire_proto::version::TdsVersion;

use crate::error::Error;

/// Connection parameters. Immutable once login begins.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host name or address.
    pub server: String,
    /// TCP port; resolved through the browser when absent and an
    /// instance name is set.
    pub port: Option<u16>,
    /// Named instance.
    pub instance: Option<String>,
    /// Secondary endpoint tried when the primary is unreachable.
    pub failover_partner: Option<String>,
    /// Initial catalog; `USE`d after login when it differs.
    pub database: Option<String>,
    /// Login name for SQL authentication.
    pub user: Option<String>,
    /// Password for SQL authentication.
    pub password: Option<String>,
    /// Upper bound on the TDS version; the server picks in LOGINACK.
    pub tds_version: TdsVersion,
    /// Application name reported in LOGIN7.
    pub app_name: String,
    /// Client host name reported in LOGIN7.
    pub client_host: String,
    /// Initial language.
    pub language: Option<String>,
    /// Client LCID.
    pub client_lcid: u32,
    /// Initial packet size; the server may lower it.
    pub block_size: usize,
    /// Encryption preference.
    pub encryption: EncryptionLevel,
    /// Request TLS for the login sequence only.
    pub enc_login_only: bool,
    /// Verify the server certificate.
    pub validate_host: bool,
    /// PEM trust store for TLS validation.
    pub cafile: Option<PathBuf>,
    /// Application intent read-only.
    pub readonly: bool,
    /// Enable MARS.
    pub use_mars: bool,
    /// Client time zone offset from UTC in minutes.
    pub client_time_zone: i32,
    /// Budget for the whole connect sequence.
    pub login_timeout: Duration,
    /// Per-read budget while awaiting query results.
    pub query_timeout: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: "localhost".into(),
            port: None,
            instance: None,
            failover_partner: None,
            database: None,
            user: None,
            password: None,
            tds_version: TdsVersion::V7_4,
            app_name: "tidewire".into(),
            client_host: String::new(),
            language: None,
            client_lcid: 1033,
            block_size: tidewire_proto::packet::DEFAULT_BLOCK_SIZE,
            encryption: EncryptionLevel::Off,
            enc_login_only: false,
            validate_host: true,
            cafile: None,
            readonly: false,
            use_mars: false,
            client_time_zone: 0,
            login_timeout: Duration::from_secs(15),
            query_timeout: None,
        }
    }
}

impl Config {
    /// Start from defaults.
    #[must_use]
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            ..Self::default()
        }
    }

    /// Set the TCP port.
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Set the named instance.
    #[must_use]
    pub fn with_instance(mut self, instance: impl Into<String>) -> Self {
        self.instance = Some(instance.into());
        self
    }

    /// Set SQL authentication credentials.
    #[must_use]
    pub fn with_credentials(
        mut self,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.user = Some(user.into());
        self.password = Some(password.into());
        self
    }

    /// Set the initial catalog.
    #[must_use]
    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    /// Set the encryption preference.
    #[must_use]
    pub fn with_encryption(mut self, level: EncryptionLevel) -> Self {
        self.encryption = level;
        self
    }

    /// Enable MARS.
    #[must_use]
    pub fn with_mars(mut self, enabled: bool) -> Self {
        self.use_mars = enabled;
        self
    }

    /// Cap the TDS version.
    #[must_use]
    pub fn with_tds_version(mut self, version: TdsVersion) -> Self {
        self.tds_version = version;
        self
    }

    /// Parse an ADO.NET-style connection string.
    ///
    /// Recognized keys (case-insensitive): `server` (with optional
    /// `\instance` and `,port`), `database` / `initial catalog`,
    /// `user id` / `uid`, `password` / `pwd`, `encrypt`,
    /// `trustservercertificate`, `failover partner`, `mars`,
    /// `applicationintent`, `connect timeout`, `packet size`, `appname`.
    pub fn from_connection_string(s: &str) -> Result<Self, Error> {
        let mut config = Self::default();
        for pair in s.split(';') {
            let pair = pair.trim();
            if pair.is_empty() {
                continue;
            }
            let Some((key, value)) = pair.split_once('=') else {
                return Err(Error::Interface(format!(
                    "malformed connection string fragment {pair:?}"
                )));
            };
            let key = key.trim().to_lowercase();
            let value = value.trim();
            match key.as_str() {
                "server" | "data source" | "address" => {
                    let mut host = value;
                    if let Some((h, port)) = host.split_once(',') {
                        host = h;
                        config.port = port.trim().parse().ok();
                    }
                    if let Some((h, instance)) = host.split_once('\\') {
                        config.server = h.trim().to_owned();
                        config.instance = Some(instance.trim().to_owned());
                    } else {
                        config.server = host.trim().to_owned();
                    }
                }
                "database" | "initial catalog" => config.database = Some(value.to_owned()),
                "user id" | "uid" | "user" => config.user = Some(value.to_owned()),
                "password" | "pwd" => config.password = Some(value.to_owned()),
                "failover partner" => config.failover_partner = Some(value.to_owned()),
                "encrypt" => {
                    config.encryption = if parse_bool(value) {
                        EncryptionLevel::On
                    } else {
                        EncryptionLevel::Off
                    };
                }
                "trustservercertificate" => config.validate_host = !parse_bool(value),
                "mars" | "multipleactiveresultsets" => config.use_mars = parse_bool(value),
                "applicationintent" => {
                    config.readonly = value.eq_ignore_ascii_case("readonly");
                }
                "connect timeout" | "connection timeout" => {
                    let secs: u64 = value.parse().map_err(|_| {
                        Error::Interface(format!("bad connect timeout {value:?}"))
                    })?;
                    config.login_timeout = Duration::from_secs(secs);
                }
                "packet size" => {
                    config.block_size = value.parse().map_err(|_| {
                        Error::Interface(format!("bad packet size {value:?}"))
                    })?;
                }
                "appname" | "application name" => config.app_name = value.to_owned(),
                other => {
                    tracing::debug!(key = other, "ignoring unknown connection string key");
                }
            }
        }
        Ok(config)
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.to_lowercase().as_str(),
        "true" | "yes" | "1" | "on" | "sspi"
    )
}
