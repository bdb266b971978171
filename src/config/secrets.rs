//! Secret handling utilities.
//!
//! Endpoint API keys are held as `SecretString` from the moment they are
//! parsed out of the pipeline file and only exposed at the call site that
//! needs the plaintext.

pub use secrecy::{ExposeSecret, SecretString};

/// Render a bearer `Authorization` header value.
pub fn bearer(key: &SecretString) -> String {
    format!("Bearer {}", key.expose_secret())
}
