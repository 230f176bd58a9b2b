//! Sessions, authentication and authorization.
//!
//! Sessions are signed with HMAC-SHA256 so a client cannot forge one. The
//! user and roles granted at opening are kept by the registry, and a
//! session presenting anything else is refused.
//!
//! ## Token Format
//!
//! - 16 bytes: session id
//! - 8 bytes: opening timestamp (Unix millis, big-endian)
//! - 32 bytes: HMAC-SHA256 over the above followed by the user name
//!
//! Total: 56 bytes.

use crate::error::{ServerError, ServerResult};
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use remoting_protocol::{AuthenticationSession, AuthorizationResponse};
use sha2::Sha256;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

const TOKEN_LEN: usize = 56;

/// Checks credentials when a session is opened.
pub trait Authenticator: Send + Sync {
    /// Returns the user's roles if the credentials are valid.
    fn authenticate(&self, user: &str, password: &str) -> ServerResult<Vec<String>>;
}

/// Accepts any non-empty user name, with no roles.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAny;

impl Authenticator for AcceptAny {
    fn authenticate(&self, user: &str, _password: &str) -> ServerResult<Vec<String>> {
        if user.is_empty() {
            return Err(ServerError::AuthenticationFailed("empty user name".into()));
        }
        Ok(Vec::new())
    }
}

/// A fixed table of users, passwords and roles.
#[derive(Debug, Clone, Default)]
pub struct PasswordTable {
    users: HashMap<String, (String, Vec<String>)>,
}

impl PasswordTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a user.
    pub fn with_user(mut self, user: &str, password: &str, roles: &[&str]) -> Self {
        self.users.insert(
            user.to_string(),
            (
                password.to_string(),
                roles.iter().map(|r| r.to_string()).collect(),
            ),
        );
        self
    }
}

impl Authenticator for PasswordTable {
    fn authenticate(&self, user: &str, password: &str) -> ServerResult<Vec<String>> {
        match self.users.get(user) {
            Some((expected, roles)) if expected == password => Ok(roles.clone()),
            _ => Err(ServerError::AuthenticationFailed(format!(
                "bad credentials for {user}"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
struct OpenSession {
    user: String,
    roles: Vec<String>,
    opened_millis: u64,
}

/// Registry of open sessions.
pub struct SessionRegistry {
    secret: Vec<u8>,
    expiry: Duration,
    sessions: RwLock<HashMap<Uuid, OpenSession>>,
}

impl SessionRegistry {
    /// Creates a registry that signs tokens with `secret`.
    pub fn new(secret: Vec<u8>, expiry: Duration) -> Self {
        Self {
            secret,
            expiry,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Creates a registry with a random secret.
    pub fn with_random_secret(expiry: Duration) -> Self {
        let mut secret = Vec::with_capacity(32);
        secret.extend_from_slice(Uuid::new_v4().as_bytes());
        secret.extend_from_slice(Uuid::new_v4().as_bytes());
        Self::new(secret, expiry)
    }

    /// Opens a session for `user` with `roles`.
    pub fn open(&self, user: &str, roles: Vec<String>) -> ServerResult<AuthenticationSession> {
        let id = Uuid::new_v4();
        let opened_millis = now_millis();

        let mut token = Vec::with_capacity(TOKEN_LEN);
        token.extend_from_slice(id.as_bytes());
        token.extend_from_slice(&opened_millis.to_be_bytes());
        let signature = self.sign(&token, user)?;
        token.extend_from_slice(&signature);

        let mut sessions = self.sessions.write();
        let before = sessions.len();
        sessions.retain(|_, open| !self.expired(open.opened_millis, opened_millis));
        if sessions.len() < before {
            debug!(purged = before - sessions.len(), "expired sessions purged");
        }
        sessions.insert(
            id,
            OpenSession {
                user: user.to_string(),
                roles: roles.clone(),
                opened_millis,
            },
        );
        drop(sessions);
        info!(session = %id, user, "session opened");

        Ok(AuthenticationSession {
            id,
            user: user.to_string(),
            roles,
            token,
        })
    }

    /// Checks that `session` was issued by this registry, is still open and
    /// has not expired.
    pub fn validate(&self, session: &AuthenticationSession) -> ServerResult<()> {
        let token = &session.token;
        if token.len() != TOKEN_LEN {
            return Err(ServerError::AuthenticationFailed("invalid token length".into()));
        }

        let (id_bytes, rest) = token.split_at(16);
        let (timestamp_bytes, signature) = rest.split_at(8);

        if id_bytes != session.id.as_bytes() {
            return Err(ServerError::AuthenticationFailed("session id mismatch".into()));
        }

        let expected = self.sign(&token[..24], &session.user)?;
        if signature != expected.as_slice() {
            warn!(session = %session.id, "forged session token");
            return Err(ServerError::AuthenticationFailed("invalid signature".into()));
        }

        let open = self
            .sessions
            .read()
            .get(&session.id)
            .cloned()
            .ok_or_else(|| ServerError::AuthenticationFailed("session is not open".into()))?;
        if open.user != session.user {
            return Err(ServerError::AuthenticationFailed("user mismatch".into()));
        }
        if open.roles != session.roles {
            warn!(session = %session.id, "session presented altered roles");
            return Err(ServerError::AuthenticationFailed("roles mismatch".into()));
        }

        let mut stamp = [0u8; 8];
        stamp.copy_from_slice(timestamp_bytes);
        let opened = u64::from_be_bytes(stamp);
        if opened != open.opened_millis || self.expired(opened, now_millis()) {
            debug!(session = %session.id, "session expired");
            self.sessions.write().remove(&session.id);
            return Err(ServerError::AuthenticationFailed("session expired".into()));
        }

        Ok(())
    }

    /// Closes `session`.
    pub fn close(&self, session: &AuthenticationSession) -> ServerResult<()> {
        self.validate(session)?;
        self.sessions.write().remove(&session.id);
        info!(session = %session.id, user = %session.user, "session closed");
        Ok(())
    }

    /// Returns the number of open sessions.
    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    /// Returns true if no session is open.
    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    fn expired(&self, opened_millis: u64, now: u64) -> bool {
        let expiry_millis = u64::try_from(self.expiry.as_millis()).unwrap_or(u64::MAX);
        now > opened_millis.saturating_add(expiry_millis)
    }

    fn sign(&self, data: &[u8], user: &str) -> ServerResult<[u8; 32]> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| ServerError::Internal(e.to_string()))?;
        mac.update(data);
        mac.update(user.as_bytes());
        Ok(mac.finalize().into_bytes().into())
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}

/// Outcome of a policy check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Authorization {
    /// The member is allowed.
    Allowed,
    /// The member is denied, with a reason.
    Denied(String),
}

impl From<Authorization> for AuthorizationResponse {
    fn from(outcome: Authorization) -> Self {
        match outcome {
            Authorization::Allowed => AuthorizationResponse::allow(),
            Authorization::Denied(reason) => AuthorizationResponse::deny(reason),
        }
    }
}

/// Decides whether a member of a type may be seen or used.
pub trait Authorizer: Send + Sync {
    /// Checks whether `member` of `type_name` may be used.
    fn is_usable(&self, session: &AuthenticationSession, type_name: &str, member: &str)
        -> Authorization;

    /// Checks whether `member` of `type_name` may be seen.
    fn is_visible(
        &self,
        session: &AuthenticationSession,
        type_name: &str,
        member: &str,
    ) -> Authorization;
}

/// Allows everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn is_usable(&self, _: &AuthenticationSession, _: &str, _: &str) -> Authorization {
        Authorization::Allowed
    }

    fn is_visible(&self, _: &AuthenticationSession, _: &str, _: &str) -> Authorization {
        Authorization::Allowed
    }
}

/// Denies listed members unless the user holds an exempt role.
///
/// A hidden member is also unusable.
#[derive(Debug, Clone, Default)]
pub struct RuleAuthorizer {
    hidden: HashMap<(String, String), String>,
    disabled: HashMap<(String, String), String>,
    exempt_roles: HashSet<String>,
}

impl RuleAuthorizer {
    /// Creates an authorizer that allows everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Hides `member` of `type_name`.
    pub fn hide(mut self, type_name: &str, member: &str, reason: &str) -> Self {
        self.hidden
            .insert((type_name.to_string(), member.to_string()), reason.to_string());
        self
    }

    /// Makes `member` of `type_name` unusable.
    pub fn disable(mut self, type_name: &str, member: &str, reason: &str) -> Self {
        self.disabled
            .insert((type_name.to_string(), member.to_string()), reason.to_string());
        self
    }

    /// Exempts users holding `role` from every rule.
    pub fn exempt_role(mut self, role: &str) -> Self {
        self.exempt_roles.insert(role.to_string());
        self
    }

    fn exempt(&self, session: &AuthenticationSession) -> bool {
        session.roles.iter().any(|r| self.exempt_roles.contains(r))
    }

    fn lookup<'a>(
        rules: &'a HashMap<(String, String), String>,
        type_name: &str,
        member: &str,
    ) -> Option<&'a String> {
        rules.get(&(type_name.to_string(), member.to_string()))
    }
}

impl Authorizer for RuleAuthorizer {
    fn is_usable(
        &self,
        session: &AuthenticationSession,
        type_name: &str,
        member: &str,
    ) -> Authorization {
        if let Authorization::Denied(reason) = self.is_visible(session, type_name, member) {
            return Authorization::Denied(reason);
        }
        if self.exempt(session) {
            return Authorization::Allowed;
        }
        match Self::lookup(&self.disabled, type_name, member) {
            Some(reason) => Authorization::Denied(reason.clone()),
            None => Authorization::Allowed,
        }
    }

    fn is_visible(
        &self,
        session: &AuthenticationSession,
        type_name: &str,
        member: &str,
    ) -> Authorization {
        if self.exempt(session) {
            return Authorization::Allowed;
        }
        match Self::lookup(&self.hidden, type_name, member) {
            Some(reason) => Authorization::Denied(reason.clone()),
            None => Authorization::Allowed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> SessionRegistry {
        SessionRegistry::new(b"test-secret-key-32-bytes-long!!".to_vec(), Duration::from_secs(60))
    }

    #[test]
    fn open_and_validate_session() {
        let registry = registry();
        let session = registry.open("alice", vec!["clerk".into()]).unwrap();

        assert_eq!(session.token.len(), TOKEN_LEN);
        assert!(registry.validate(&session).is_ok());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn reject_tampered_token() {
        let registry = registry();
        let mut session = registry.open("alice", vec![]).unwrap();
        session.token[40] ^= 0xFF;

        assert!(registry.validate(&session).is_err());
    }

    #[test]
    fn reject_other_user() {
        let registry = registry();
        let mut session = registry.open("alice", vec![]).unwrap();
        session.user = "mallory".into();

        assert!(registry.validate(&session).is_err());
    }

    #[test]
    fn reject_token_from_other_registry() {
        let other = SessionRegistry::with_random_secret(Duration::from_secs(60));
        let session = other.open("alice", vec![]).unwrap();

        assert!(registry().validate(&session).is_err());
    }

    #[test]
    fn reject_closed_session() {
        let registry = registry();
        let session = registry.open("alice", vec![]).unwrap();
        registry.close(&session).unwrap();

        assert!(registry.validate(&session).is_err());
        assert!(registry.is_empty());
    }

    #[test]
    fn reject_expired_session() {
        let registry = SessionRegistry::new(b"secret".to_vec(), Duration::from_secs(0));
        let session = registry.open("alice", vec![]).unwrap();

        std::thread::sleep(Duration::from_millis(10));

        assert!(registry.validate(&session).is_err());
        assert!(registry.is_empty());
    }

    #[test]
    fn reject_added_role() {
        let registry = registry();
        let mut session = registry.open("alice", vec!["clerk".into()]).unwrap();
        session.roles.push("admin".into());
        assert!(registry.validate(&session).is_err());

        session.roles.clear();
        assert!(registry.validate(&session).is_err());
    }

    #[test]
    fn abandoned_sessions_are_purged_on_open() {
        let registry = SessionRegistry::new(b"secret".to_vec(), Duration::from_millis(0));
        registry.open("alice", vec![]).unwrap();
        registry.open("bob", vec![]).unwrap();

        std::thread::sleep(Duration::from_millis(10));

        registry.open("carol", vec![]).unwrap();
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn password_table() {
        let table = PasswordTable::new().with_user("alice", "pw", &["admin"]);

        assert_eq!(table.authenticate("alice", "pw").unwrap(), vec!["admin"]);
        assert!(table.authenticate("alice", "nope").is_err());
        assert!(table.authenticate("bob", "pw").is_err());
        assert!(AcceptAny.authenticate("", "").is_err());
        assert!(AcceptAny.authenticate("anyone", "").is_ok());
    }

    #[test]
    fn rule_authorizer() {
        let registry = registry();
        let clerk = registry.open("alice", vec!["clerk".into()]).unwrap();
        let admin = registry.open("root", vec!["admin".into()]).unwrap();

        let rules = RuleAuthorizer::new()
            .hide("Customer", "creditLimit", "confidential")
            .disable("Order", "number", "assigned by the system")
            .exempt_role("admin");

        assert_eq!(
            rules.is_visible(&clerk, "Customer", "creditLimit"),
            Authorization::Denied("confidential".into())
        );
        assert_eq!(
            rules.is_usable(&clerk, "Customer", "creditLimit"),
            Authorization::Denied("confidential".into())
        );
        assert_eq!(rules.is_visible(&clerk, "Order", "number"), Authorization::Allowed);
        assert!(matches!(
            rules.is_usable(&clerk, "Order", "number"),
            Authorization::Denied(_)
        ));
        assert_eq!(rules.is_usable(&admin, "Order", "number"), Authorization::Allowed);
        assert_eq!(AllowAll.is_usable(&clerk, "Order", "number"), Authorization::Allowed);
    }
}
