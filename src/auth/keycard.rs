//! Keycards
//!
//! A keycard carries credentials from a requester (a streamer, usually) to a
//! bouncer. The bouncer may decorate it with an id, a domain and a duration
//! before handing it back.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Credentials carried by a keycard
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "class", rename_all = "kebab-case")]
pub enum KeycardCredentials {
    UsernamePassword { username: String, password: String },
    Token { token: String },
    Anonymous,
}

impl KeycardCredentials {
    /// Class name as advertised by `keycardClasses`
    pub fn class_name(&self) -> &'static str {
        match self {
            KeycardCredentials::UsernamePassword { .. } => "username-password",
            KeycardCredentials::Token { .. } => "token",
            KeycardCredentials::Anonymous => "anonymous",
        }
    }
}

/// Where a keycard is in its life
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeycardState {
    #[default]
    Requesting,
    Authenticated,
    Refused,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Keycard {
    /// Assigned by the bouncer on authentication
    #[serde(default)]
    pub id: Option<String>,

    pub credentials: KeycardCredentials,

    /// IP address of the client the keycard was built for
    #[serde(default)]
    pub address: Option<String>,

    /// Avatar id of the component that asked for authentication
    #[serde(default)]
    pub requester_id: Option<String>,

    /// Name of the issuing component, for keep-alives
    #[serde(default)]
    pub issuer_name: Option<String>,

    #[serde(default)]
    pub domain: Option<String>,

    /// Seconds the holder may stay connected
    #[serde(default)]
    pub duration: Option<f64>,

    /// Seconds before the bouncer forgets the keycard without a keep-alive
    #[serde(default)]
    pub ttl: Option<f64>,

    #[serde(default)]
    pub state: KeycardState,
}

impl Keycard {
    pub fn new(credentials: KeycardCredentials) -> Self {
        Self {
            id: None,
            credentials,
            address: None,
            requester_id: None,
            issuer_name: None,
            domain: None,
            duration: None,
            ttl: None,
            state: KeycardState::Requesting,
        }
    }

    pub fn username_password(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self::new(KeycardCredentials::UsernamePassword {
            username: username.into(),
            password: password.into(),
        })
    }

    pub fn token(token: impl Into<String>) -> Self {
        Self::new(KeycardCredentials::Token {
            token: token.into(),
        })
    }

    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    pub fn requester(mut self, requester_id: impl Into<String>) -> Self {
        self.requester_id = Some(requester_id.into());
        self
    }

    pub fn issuer(mut self, issuer_name: impl Into<String>) -> Self {
        self.issuer_name = Some(issuer_name.into());
        self
    }

    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn is_authenticated(&self) -> bool {
        self.state == KeycardState::Authenticated
    }

    /// Connection duration granted by the bouncer, if any
    pub fn duration(&self) -> Option<Duration> {
        self.duration
            .filter(|d| d.is_finite() && *d > 0.0)
            .map(Duration::from_secs_f64)
    }
}

impl fmt::Display for Keycard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<keycard {} {} from {}>",
            self.id.as_deref().unwrap_or("-"),
            self.credentials.class_name(),
            self.address.as_deref().unwrap_or("?")
        )
    }
}
