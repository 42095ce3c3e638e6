use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::Sink;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{
    AuthSource, DefaultServerParameterProvider, LoginInfo, Password, StartupHandler,
};
use pgwire::api::{ClientInfo, METADATA_USER};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::{PgWireBackendMessage, PgWireFrontendMessage};
use tracing::warn;

use crate::model::Principal;
use crate::observability;

/// Logins tracked before expired entries are swept.
const MAX_TRACKED_LOGINS: usize = 10_000;

/// One password per login. Unknown logins fail exactly like a wrong password.
#[derive(Debug)]
pub struct RoomBookAuthSource {
    passwords: HashMap<String, String>,
}

impl RoomBookAuthSource {
    pub fn new(passwords: HashMap<String, String>) -> Self {
        Self { passwords }
    }
}

#[async_trait]
impl AuthSource for RoomBookAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        let user = login.user().unwrap_or_default();
        match self.passwords.get(user) {
            Some(password) => Ok(Password::new(None, password.as_bytes().to_vec())),
            None => Err(PgWireError::InvalidPassword(user.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct FailedLogins {
    count: u32,
    since: Instant,
    locked_until: Option<Instant>,
}

impl FailedLogins {
    fn fresh(now: Instant) -> Self {
        Self {
            count: 0,
            since: now,
            locked_until: None,
        }
    }
}

/// Locks a login out for `lockout` once it fails `max_failures` times
/// within `lockout` of its first failure.
#[derive(Debug)]
pub struct LoginThrottle {
    max_failures: u32,
    lockout: Duration,
    logins: DashMap<String, FailedLogins>,
}

impl LoginThrottle {
    pub fn new(max_failures: u32, lockout: Duration) -> Self {
        Self {
            max_failures,
            lockout,
            logins: DashMap::new(),
        }
    }

    /// `Err` carries how much longer the login stays locked.
    pub fn check(&self, login: &str, now: Instant) -> Result<(), Duration> {
        match self.logins.get(login).and_then(|f| f.locked_until) {
            Some(until) if until > now => Err(until - now),
            _ => Ok(()),
        }
    }

    /// Returns true when this failure locked the login.
    pub fn record_failure(&self, login: &str, now: Instant) -> bool {
        if self.logins.len() >= MAX_TRACKED_LOGINS && !self.logins.contains_key(login) {
            self.sweep(now);
        }
        let mut entry = self
            .logins
            .entry(login.to_string())
            .or_insert_with(|| FailedLogins::fresh(now));
        let failures = entry.value_mut();
        if self.expired(failures, now) {
            *failures = FailedLogins::fresh(now);
        }
        failures.count += 1;
        if failures.count >= self.max_failures {
            failures.locked_until = Some(now + self.lockout);
            return true;
        }
        false
    }

    pub fn clear(&self, login: &str) {
        self.logins.remove(login);
    }

    fn expired(&self, failures: &FailedLogins, now: Instant) -> bool {
        match failures.locked_until {
            Some(until) => until <= now,
            None => now.duration_since(failures.since) > self.lockout,
        }
    }

    fn sweep(&self, now: Instant) {
        self.logins.retain(|_, f| !self.expired(f, now));
    }
}

/// Cleartext password login with per-login throttling of failed attempts.
pub struct RoomBookStartupHandler {
    inner: CleartextPasswordAuthStartupHandler<RoomBookAuthSource, DefaultServerParameterProvider>,
    throttle: LoginThrottle,
}

impl RoomBookStartupHandler {
    pub fn new(passwords: HashMap<String, String>, throttle: LoginThrottle) -> Self {
        Self {
            inner: CleartextPasswordAuthStartupHandler::new(
                RoomBookAuthSource::new(passwords),
                DefaultServerParameterProvider::default(),
            ),
            throttle,
        }
    }
}

#[async_trait]
impl StartupHandler for RoomBookStartupHandler {
    async fn on_startup<C>(
        &self,
        client: &mut C,
        message: PgWireFrontendMessage,
    ) -> PgWireResult<()>
    where
        C: ClientInfo + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<<C as Sink<PgWireBackendMessage>>::Error>,
    {
        if !matches!(message, PgWireFrontendMessage::PasswordMessageFamily(_)) {
            return self.inner.on_startup(client, message).await;
        }

        let login = client
            .metadata()
            .get(METADATA_USER)
            .cloned()
            .unwrap_or_default();
        let now = Instant::now();
        if let Err(remaining) = self.throttle.check(&login, now) {
            metrics::counter!(observability::AUTH_FAILURES_TOTAL, "reason" => "throttled")
                .increment(1);
            warn!(login = %login, "login refused while locked out");
            return Err(PgWireError::UserError(Box::new(ErrorInfo::new(
                "FATAL".into(),
                "28000".into(),
                format!(
                    "too many failed login attempts for \"{login}\", retry in {}s",
                    remaining.as_secs().max(1)
                ),
            ))));
        }

        match self.inner.on_startup(client, message).await {
            Ok(()) => {
                self.throttle.clear(&login);
                Ok(())
            }
            Err(e @ PgWireError::InvalidPassword(_)) => {
                metrics::counter!(observability::AUTH_FAILURES_TOTAL, "reason" => "password")
                    .increment(1);
                if self.throttle.record_failure(&login, now) {
                    warn!(login = %login, "login locked after repeated failures");
                }
                Err(e)
            }
            Err(e) => Err(e),
        }
    }
}

/// Login names with admin rights. Everyone else is a member.
#[derive(Debug, Clone, Default)]
pub struct Roles {
    admins: HashSet<String>,
}

impl Roles {
    pub fn new<I, S>(admins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            admins: admins.into_iter().map(Into::into).collect(),
        }
    }

    pub fn principal(&self, user: &str) -> Principal {
        if self.admins.contains(user) {
            Principal::admin(user)
        } else {
            Principal::member(user)
        }
    }
}
