//! Operator sessions: explicit token objects with issuance time and TTL,
//! validated on every privileged call. No ambient login state anywhere;
//! the token is the only credential, and only its SHA-256 digest is kept.

use chrono::{DateTime, Duration, Utc};
use facegate_core::Role;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;

use crate::config::OperatorAccount;

const TOKEN_LEN: usize = 32;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("unknown or expired session")]
    SessionInvalid,
    #[error("requires {required} role")]
    Forbidden { required: Role },
}

/// Returned once, at login. The raw token never appears again on this
/// side; subsequent calls present it and it is matched by digest.
#[derive(Debug, Clone)]
pub struct IssuedSession {
    pub token: String,
    pub email: String,
    pub role: Role,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct OperatorIdentity {
    pub email: String,
    pub role: Role,
}

struct SessionEntry {
    email: String,
    role: Role,
    issued_at: DateTime<Utc>,
}

pub struct SessionBook {
    accounts: Vec<OperatorAccount>,
    ttl: Duration,
    sessions: Mutex<HashMap<String, SessionEntry>>,
}

impl SessionBook {
    pub fn new(accounts: Vec<OperatorAccount>, ttl: Duration) -> Self {
        Self {
            accounts,
            ttl,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn login(&self, email: &str, password: &str) -> Result<IssuedSession, AuthError> {
        let digest = sha256_hex(password.as_bytes());
        let account = self
            .accounts
            .iter()
            .find(|a| {
                a.email.eq_ignore_ascii_case(email)
                    && a.password_sha256.eq_ignore_ascii_case(&digest)
            })
            .ok_or(AuthError::InvalidCredentials)?;

        let mut token_bytes = [0u8; TOKEN_LEN];
        rand::rngs::OsRng.fill_bytes(&mut token_bytes);
        let token = hex_encode(&token_bytes);
        let issued_at = Utc::now();

        self.sessions.lock().expect("session lock poisoned").insert(
            sha256_hex(token.as_bytes()),
            SessionEntry {
                email: account.email.clone(),
                role: account.role,
                issued_at,
            },
        );
        tracing::info!(email = %account.email, role = %account.role, "session issued");

        Ok(IssuedSession {
            token,
            email: account.email.clone(),
            role: account.role,
            issued_at,
            expires_at: issued_at + self.ttl,
        })
    }

    /// Validate the token, enforce TTL expiry, and check the role rank.
    pub fn authorize(&self, token: &str, required: Role) -> Result<OperatorIdentity, AuthError> {
        let key = sha256_hex(token.as_bytes());
        let mut sessions = self.sessions.lock().expect("session lock poisoned");

        let entry = sessions.get(&key).ok_or(AuthError::SessionInvalid)?;
        if entry.issued_at + self.ttl < Utc::now() {
            sessions.remove(&key);
            return Err(AuthError::SessionInvalid);
        }
        if !entry.role.permits(required) {
            return Err(AuthError::Forbidden { required });
        }
        Ok(OperatorIdentity {
            email: entry.email.clone(),
            role: entry.role,
        })
    }

    pub fn logout(&self, token: &str) -> bool {
        self.sessions
            .lock()
            .expect("session lock poisoned")
            .remove(&sha256_hex(token.as_bytes()))
            .is_some()
    }
}

fn sha256_hex(data: &[u8]) -> String {
    hex_encode(&Sha256::digest(data))
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn accounts() -> Vec<OperatorAccount> {
        vec![
            OperatorAccount {
                email: "gate@venue.example".into(),
                password_sha256: sha256_hex(b"turnstile"),
                role: Role::Operator,
            },
            OperatorAccount {
                email: "boss@venue.example".into(),
                password_sha256: sha256_hex(b"backstage"),
                role: Role::Admin,
            },
        ]
    }

    #[test]
    fn test_login_and_authorize() {
        let book = SessionBook::new(accounts(), Duration::hours(24));
        let session = book.login("gate@venue.example", "turnstile").unwrap();
        assert_eq!(session.role, Role::Operator);
        assert!(session.expires_at > session.issued_at);

        let identity = book.authorize(&session.token, Role::Operator).unwrap();
        assert_eq!(identity.email, "gate@venue.example");
    }

    #[test]
    fn test_login_rejects_bad_password() {
        let book = SessionBook::new(accounts(), Duration::hours(24));
        assert!(matches!(
            book.login("gate@venue.example", "wrong"),
            Err(AuthError::InvalidCredentials)
        ));
    }

    #[test]
    fn test_authorize_enforces_role_rank() {
        let book = SessionBook::new(accounts(), Duration::hours(24));
        let operator = book.login("gate@venue.example", "turnstile").unwrap();
        let admin = book.login("boss@venue.example", "backstage").unwrap();

        assert!(matches!(
            book.authorize(&operator.token, Role::Manager),
            Err(AuthError::Forbidden { required: Role::Manager })
        ));
        // Higher rank implies all lower-rank permissions.
        assert!(book.authorize(&admin.token, Role::Operator).is_ok());
    }

    #[test]
    fn test_expired_session_is_removed() {
        let book = SessionBook::new(accounts(), Duration::seconds(-1));
        let session = book.login("gate@venue.example", "turnstile").unwrap();
        assert!(matches!(
            book.authorize(&session.token, Role::Operator),
            Err(AuthError::SessionInvalid)
        ));
        // Still invalid on a second try: the entry is gone, not re-aged.
        assert!(matches!(
            book.authorize(&session.token, Role::Operator),
            Err(AuthError::SessionInvalid)
        ));
    }

    #[test]
    fn test_unknown_token_rejected() {
        let book = SessionBook::new(accounts(), Duration::hours(24));
        assert!(matches!(
            book.authorize("deadbeef", Role::Operator),
            Err(AuthError::SessionInvalid)
        ));
    }

    #[test]
    fn test_logout_invalidates_token() {
        let book = SessionBook::new(accounts(), Duration::hours(24));
        let session = book.login("gate@venue.example", "turnstile").unwrap();
        assert!(book.logout(&session.token));
        assert!(!book.logout(&session.token));
        assert!(book.authorize(&session.token, Role::Operator).is_err());
    }
}
