//! Authentication
//!
//! Login credentials and identities for RPC peers, and keycards with the
//! bouncers that judge them.

pub mod bouncer;
pub mod identity;
pub mod keycard;

pub use bouncer::{Bouncer, RemoteBouncer, StaticBouncer};
pub use identity::{CredentialChecker, Credentials, HostIdentityProvider, Identity, IdentityProvider};
pub use keycard::{Keycard, KeycardCredentials, KeycardState};
