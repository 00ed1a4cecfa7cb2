//! Session credentials for the compliance API
//!
//! Provides the persisted credential store and the two auth endpoint calls
//! (login, refresh). This crate knows nothing about retry or refresh policy;
//! `session-pipeline` decides when to call into it.
//!
//! Credential flow:
//! 1. `token::login()` exchanges username/password for a token pair + identity
//! 2. `CredentialStore::set()` persists both and bumps the session epoch
//! 3. On an ordinary 401 the pipeline calls `token::refresh_token()`
//! 4. `CredentialStore::replace_tokens()` swaps the pair unless a logout won the race
//! 5. `CredentialStore::clear()` removes everything in a single write

pub mod constants;
pub mod credentials;
pub mod error;
pub mod expiry;
pub mod token;

pub use constants::*;
pub use credentials::{CredentialStore, Identity, SessionSummary, TokenPair};
pub use error::{Error, Result};
pub use expiry::{Expiry, is_time_valid};
pub use token::{LoginRequest, LoginResponse, RefreshedTokens, login, refresh_token};
