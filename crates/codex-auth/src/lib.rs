//! OAuth credential plumbing for the Codex account pool
//!
//! The authorization-code exchange happens elsewhere; this crate only deals
//! with credentials that already exist:
//! 1. `token::TokenRefresher` turns a refresh token into a fresh token set
//! 2. `claims::decode_claims` pulls account id, user id, plan and email out of
//!    an access token
//! 3. `credentials::read_foreign_credential` reads a single-account credential
//!    file owned by another tool, for one-shot import into the pool

pub mod claims;
pub mod constants;
pub mod credentials;
pub mod error;
pub mod token;

pub use claims::{AccountClaims, decode_claims};
pub use constants::*;
pub use credentials::{ForeignCredential, read_foreign_credential};
pub use error::{Error, Result};
pub use token::{HttpTokenRefresher, RefreshOutcome, TokenRefresher, TokenResponse, TokenSet};
