//! Login credentials and identities

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;

use crate::error::{Error, Result};

/// Username and password presented at login
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn anonymous() -> Self {
        Self::new("anonymous", "")
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Who a logged-in peer is
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity(pub String);

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Turns accepted credentials into an identity
pub trait IdentityProvider: Send + Sync {
    fn identity(&self, credentials: &Credentials, host: IpAddr) -> Identity;
}

/// `username@host`
#[derive(Debug, Clone, Copy, Default)]
pub struct HostIdentityProvider;

impl IdentityProvider for HostIdentityProvider {
    fn identity(&self, credentials: &Credentials, host: IpAddr) -> Identity {
        Identity(format!("{}@{}", credentials.username, host))
    }
}

/// Checks login credentials against a user table
///
/// An empty table lets everyone in.
#[derive(Debug, Clone, Default)]
pub struct CredentialChecker {
    users: BTreeMap<String, String>,
}

impl CredentialChecker {
    pub fn new(users: BTreeMap<String, String>) -> Self {
        Self { users }
    }

    pub fn allows_anonymous(&self) -> bool {
        self.users.is_empty()
    }

    pub fn check(&self, credentials: &Credentials) -> Result<()> {
        if self.allows_anonymous() {
            return Ok(());
        }
        match self.users.get(&credentials.username) {
            Some(password) if *password == credentials.password => Ok(()),
            Some(_) => Err(Error::Unauthorized(format!(
                "wrong password for {}",
                credentials.username
            ))),
            None => Err(Error::Unauthorized(format!(
                "unknown user {}",
                credentials.username
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_anonymous_when_no_users() {
        let checker = CredentialChecker::default();
        assert!(checker.check(&Credentials::anonymous()).is_ok());
    }

    #[test]
    fn test_user_table() {
        let checker = CredentialChecker::new(BTreeMap::from([(
            "user".to_string(),
            "test".to_string(),
        )]));

        assert!(checker.check(&Credentials::new("user", "test")).is_ok());
        assert!(matches!(
            checker.check(&Credentials::new("user", "nope")),
            Err(Error::Unauthorized(_))
        ));
        assert!(matches!(
            checker.check(&Credentials::anonymous()),
            Err(Error::Unauthorized(_))
        ));
    }

    #[test]
    fn test_host_identity() {
        let identity =
            HostIdentityProvider.identity(&Credentials::new("user", "x"), "10.0.0.1".parse().unwrap());
        assert_eq!(identity.to_string(), "user@10.0.0.1");
    }

    #[test]
    fn test_password_not_in_debug() {
        let debug = format!("{:?}", Credentials::new("user", "hunter2"));
        assert!(!debug.contains("hunter2"));
    }
}
