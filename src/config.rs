use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono_tz::Tz;

use crate::calendar::parse_timezone;

const DEFAULT_ADMIN_PASSWORD: &str = "roombook";

/// Server settings, read once from `ROOMBOOK_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    /// Login name to password.
    pub users: HashMap<String, String>,
    /// Failed logins after which a login is locked out.
    pub max_failed_logins: u32,
    pub login_lockout: Duration,
    pub max_connections: usize,
    /// WAL appends after which the compactor rewrites the log.
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls: Option<TlsPaths>,
    /// Facility timezone; calendar days for availability are cut here.
    pub timezone: Tz,
    pub admins: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5433,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            users: HashMap::from([("admin".into(), DEFAULT_ADMIN_PASSWORD.into())]),
            max_failed_logins: 5,
            login_lockout: Duration::from_secs(300),
            max_connections: 256,
            compact_threshold: 1000,
            metrics_port: None,
            tls: None,
            timezone: Tz::UTC,
            admins: vec!["admin".into()],
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as `from_env`, reading variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let var = |name: &'static str| lookup(name).filter(|v| !v.trim().is_empty());

        let tls = match (var("ROOMBOOK_TLS_CERT"), var("ROOMBOOK_TLS_KEY")) {
            (None, None) => None,
            (Some(cert), Some(key)) => Some(TlsPaths {
                cert: cert.into(),
                key: key.into(),
            }),
            _ => return Err(ConfigError::TlsPair),
        };

        let timezone = match var("ROOMBOOK_TIMEZONE") {
            Some(name) => parse_timezone(name.trim()).map_err(|reason| ConfigError::Invalid {
                var: "ROOMBOOK_TIMEZONE",
                value: name,
                reason,
            })?,
            None => defaults.timezone,
        };

        let admins = match var("ROOMBOOK_ADMINS") {
            Some(list) => list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect(),
            None => defaults.admins,
        };

        // Without an account list the only login is `admin`.
        let users = match var("ROOMBOOK_USERS") {
            Some(list) => parse_users(&list)?,
            None => HashMap::from([(
                "admin".to_string(),
                var("ROOMBOOK_PASSWORD").unwrap_or_else(|| DEFAULT_ADMIN_PASSWORD.into()),
            )]),
        };

        let max_connections = at_least_one(
            "ROOMBOOK_MAX_CONNECTIONS",
            parsed(&var, "ROOMBOOK_MAX_CONNECTIONS")?.unwrap_or(defaults.max_connections),
        )?;
        let max_failed_logins = at_least_one(
            "ROOMBOOK_MAX_FAILED_LOGINS",
            parsed(&var, "ROOMBOOK_MAX_FAILED_LOGINS")?.unwrap_or(defaults.max_failed_logins),
        )?;
        let login_lockout = parsed(&var, "ROOMBOOK_LOGIN_LOCKOUT_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.login_lockout);

        Ok(Self {
            port: parsed(&var, "ROOMBOOK_PORT")?.unwrap_or(defaults.port),
            bind: var("ROOMBOOK_BIND").unwrap_or(defaults.bind),
            data_dir: var("ROOMBOOK_DATA_DIR").map(PathBuf::from).unwrap_or(defaults.data_dir),
            users,
            max_failed_logins,
            login_lockout,
            max_connections,
            compact_threshold: parsed(&var, "ROOMBOOK_COMPACT_THRESHOLD")?
                .unwrap_or(defaults.compact_threshold),
            metrics_port: parsed(&var, "ROOMBOOK_METRICS_PORT")?,
            tls,
            timezone,
            admins,
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("rooms.wal")
    }
}

/// `login:password` pairs separated by commas. Passwords may contain `:`.
fn parse_users(list: &str) -> Result<HashMap<String, String>, ConfigError> {
    // Errors name the login only, never the password.
    let invalid = |value: &str, reason: &str| ConfigError::Invalid {
        var: "ROOMBOOK_USERS",
        value: value.to_string(),
        reason: reason.to_string(),
    };
    let mut users = HashMap::new();
    for entry in list.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let Some((login, password)) = entry.split_once(':') else {
            return Err(invalid("", "expected login:password"));
        };
        let login = login.trim();
        if login.is_empty() || password.is_empty() {
            return Err(invalid(login, "login and password must not be empty"));
        }
        if users.insert(login.to_string(), password.to_string()).is_some() {
            return Err(invalid(login, "login listed twice"));
        }
    }
    if users.is_empty() {
        return Err(invalid("", "no accounts listed"));
    }
    Ok(users)
}

fn at_least_one<T: PartialOrd + From<u8> + ToString>(
    var: &'static str,
    value: T,
) -> Result<T, ConfigError> {
    if value < T::from(1) {
        return Err(ConfigError::Invalid {
            var,
            value: value.to_string(),
            reason: "must be at least 1".into(),
        });
    }
    Ok(value)
}

fn parsed<T>(
    var: &impl Fn(&'static str) -> Option<String>,
    name: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    var(name)
        .map(|raw| {
            raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
                var: name,
                value: raw.clone(),
                reason: e.to_string(),
            })
        })
        .transpose()
}

#[derive(Debug, PartialEq, Eq)]
pub enum ConfigError {
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
    TlsPair,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Invalid { var, value, reason } => {
                write!(f, "invalid {var}={value:?}: {reason}")
            }
            ConfigError::TlsPair => write!(
                f,
                "both ROOMBOOK_TLS_CERT and ROOMBOOK_TLS_KEY must be set, or neither"
            ),
        }
    }
}

impl std::error::Error for ConfigError {}
