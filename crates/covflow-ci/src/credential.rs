//! Upload credential handling.

use crate::error::{PipelineError, Result};
use std::fmt;

/// Secret token for the coverage-tracking service.
///
/// Redacted from `Debug` and `Display`, not serializable, and its buffer is
/// zeroed when dropped. The pipeline moves it into the publish stage, so it
/// is released as soon as that stage ends.
pub struct PublishCredential {
    token: String,
}

impl PublishCredential {
    /// Wrap a token. Empty or whitespace-only tokens are rejected.
    pub fn new(token: impl Into<String>) -> Result<Self> {
        let token = token.into();
        if token.trim().is_empty() {
            return Err(PipelineError::Config("publish token is empty".to_string()));
        }
        Ok(Self { token })
    }

    /// Read the token from environment variable `var`.
    pub fn from_env(var: &str) -> Result<Self> {
        let token = std::env::var(var)
            .map_err(|_| PipelineError::Config(format!("environment variable {var} is not set")))?;
        Self::new(token)
    }

    /// The raw token, for placing in a request header.
    pub fn expose(&self) -> &str {
        &self.token
    }
}

impl fmt::Debug for PublishCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PublishCredential(***)")
    }
}

impl fmt::Display for PublishCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

impl Drop for PublishCredential {
    fn drop(&mut self) {
        let mut bytes = std::mem::take(&mut self.token).into_bytes();
        bytes.iter_mut().for_each(|b| *b = 0);
        std::hint::black_box(&bytes);
    }
}
