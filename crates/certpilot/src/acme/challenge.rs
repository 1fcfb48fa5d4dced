//! HTTP-01 ACME challenge management
//!
//! Pending challenges are either kept in memory for the standalone listener
//! ([`ChallengeManager`]) or written as token files under the document root
//! the proxy serves ([`WebrootPublisher`]).

use dashmap::DashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// HTTP-01 challenge path prefix
pub const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

/// Manages pending ACME HTTP-01 challenges
///
/// Stores the token -> key authorization mapping the standalone listener
/// answers from.
///
/// # Thread Safety
///
/// Uses `DashMap` for lock-free concurrent access from the listener's
/// connection tasks.
#[derive(Debug)]
pub struct ChallengeManager {
    /// Map of challenge token -> key authorization response
    challenges: Arc<DashMap<String, String>>,
}

impl ChallengeManager {
    /// Create a new challenge manager
    pub fn new() -> Self {
        Self {
            challenges: Arc::new(DashMap::new()),
        }
    }

    /// Register a pending challenge
    ///
    /// # Arguments
    ///
    /// * `token` - The challenge token from the ACME server
    /// * `key_authorization` - The response to return (token + account key thumbprint)
    pub fn add_challenge(&self, token: &str, key_authorization: &str) {
        debug!(token = %token, "Registering ACME HTTP-01 challenge");
        self.challenges
            .insert(token.to_string(), key_authorization.to_string());
    }

    /// Remove a completed or expired challenge
    pub fn remove_challenge(&self, token: &str) {
        if self.challenges.remove(token).is_some() {
            debug!(token = %token, "Removed ACME challenge");
        }
    }

    /// Get the key authorization response for a challenge token
    pub fn get_response(&self, token: &str) -> Option<String> {
        let result = self.challenges.get(token).map(|v| v.clone());
        if result.is_some() {
            trace!(token = %token, "ACME challenge token found");
        } else {
            trace!(token = %token, "ACME challenge token not found");
        }
        result
    }

    /// Check if this is an ACME challenge request path
    ///
    /// Returns `Some(token)` if the path matches the challenge prefix,
    /// `None` otherwise.
    pub fn extract_token(path: &str) -> Option<&str> {
        path.strip_prefix(ACME_CHALLENGE_PREFIX)
    }

    /// Get the number of pending challenges
    pub fn pending_count(&self) -> usize {
        self.challenges.len()
    }

    /// Clear all pending challenges
    pub fn clear(&self) {
        let count = self.challenges.len();
        self.challenges.clear();
        if count > 0 {
            debug!(cleared = count, "Cleared all pending ACME challenges");
        }
    }
}

impl Default for ChallengeManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for ChallengeManager {
    fn clone(&self) -> Self {
        Self {
            challenges: Arc::clone(&self.challenges),
        }
    }
}

/// Publishes challenge tokens as files under the proxy's document root.
///
/// Both proxy variants serve `<webroot>/.well-known/acme-challenge/` as
/// static files, so publishing needs no proxy interaction.
#[derive(Debug, Clone)]
pub struct WebrootPublisher {
    challenge_dir: PathBuf,
}

impl WebrootPublisher {
    pub fn new(webroot: &Path) -> Self {
        Self {
            challenge_dir: webroot.join(ACME_CHALLENGE_PREFIX.trim_matches('/')),
        }
    }

    /// Directory the token files are written to
    pub fn challenge_dir(&self) -> &Path {
        &self.challenge_dir
    }

    /// Write the key authorization for `token`
    pub fn publish(&self, token: &str, key_authorization: &str) -> io::Result<PathBuf> {
        if token.is_empty() || token.contains(['/', '\\']) || token.starts_with('.') {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("refusing unsafe challenge token '{}'", token),
            ));
        }

        fs::create_dir_all(&self.challenge_dir)?;
        let path = self.challenge_dir.join(token);
        fs::write(&path, key_authorization)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o644))?;
        }

        debug!(token = %token, path = %path.display(), "Published webroot challenge");
        Ok(path)
    }

    /// Remove the token file; missing files are ignored
    pub fn withdraw(&self, token: &str) {
        let path = self.challenge_dir.join(token);
        match fs::remove_file(&path) {
            Ok(()) => debug!(token = %token, "Withdrew webroot challenge"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(token = %token, error = %e, "Failed to remove webroot challenge file"),
        }
    }
}

/// Where one attempt publishes its tokens
#[derive(Debug, Clone)]
pub enum ChallengeTarget {
    Webroot(WebrootPublisher),
    Standalone(ChallengeManager),
}

/// Tokens published during one issuance attempt.
///
/// Every token is withdrawn when this is dropped, including when the
/// attempt future is dropped mid-flight on timeout or cancellation.
#[derive(Debug)]
pub struct PublishedChallenges {
    target: ChallengeTarget,
    tokens: Vec<String>,
}

impl PublishedChallenges {
    pub fn new(target: ChallengeTarget) -> Self {
        Self {
            target,
            tokens: Vec::new(),
        }
    }

    pub fn publish(&mut self, token: &str, key_authorization: &str) -> io::Result<()> {
        match &self.target {
            ChallengeTarget::Webroot(publisher) => {
                publisher.publish(token, key_authorization)?;
            }
            ChallengeTarget::Standalone(manager) => manager.add_challenge(token, key_authorization),
        }
        self.tokens.push(token.to_string());
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl Drop for PublishedChallenges {
    fn drop(&mut self) {
        for token in self.tokens.drain(..) {
            match &self.target {
                ChallengeTarget::Webroot(publisher) => publisher.withdraw(&token),
                ChallengeTarget::Standalone(manager) => manager.remove_challenge(&token),
            }
        }
    }
}
