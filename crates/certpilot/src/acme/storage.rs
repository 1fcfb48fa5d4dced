//! Certificate and account storage for ACME
//!
//! Provides persistent storage for ACME account credentials, issued
//! certificates, and the per-domain attempt history.
//!
//! # Directory Structure
//!
//! ```text
//! storage/
//! ├── account.json            # Account metadata (contact, creation time)
//! ├── credentials.json        # instant-acme account credentials (0600)
//! └── domains/
//!     └── example.com/
//!         ├── cert.pem        # Certificate chain
//!         ├── key.pem         # Private key (0600)
//!         ├── meta.json       # Issued/expiry timestamps
//!         ├── attempts.jsonl  # Append-only challenge attempt log
//!         ├── proxy-state.json
//!         ├── .lock
//!         └── archive/
//!             └── 20250101T000000Z/   # Previous bundle, moved on renewal
//! ```

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use certpilot_common::{ChallengeStrategy, DomainName, RunId};

use super::error::StorageError;

const CERT_FILE: &str = "cert.pem";
const KEY_FILE: &str = "key.pem";
const META_FILE: &str = "meta.json";
const ATTEMPTS_FILE: &str = "attempts.jsonl";

/// Certificate metadata stored alongside the certificate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificateMeta {
    /// When the certificate was issued (its notBefore)
    pub issued: DateTime<Utc>,
    /// When the certificate expires (its notAfter)
    pub expires: DateTime<Utc>,
    /// Domains covered by this certificate
    pub domains: Vec<String>,
    /// Issuer common name, if present
    #[serde(default)]
    pub issuer: Option<String>,
}

/// On-disk certificate chain and key of a domain.
///
/// Holds references to the files rather than their contents; a bundle is
/// replaced as a whole on renewal and never edited in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateBundle {
    pub domain: DomainName,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CertificateBundle {
    /// Build a bundle, enforcing `expires_at > issued_at`
    pub fn new(
        domain: DomainName,
        cert_path: PathBuf,
        key_path: PathBuf,
        issued_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<Self, StorageError> {
        if expires_at <= issued_at {
            return Err(StorageError::InvalidBundle {
                domain: domain.to_string(),
                reason: format!("expires at {} which is not after issuance {}", expires_at, issued_at),
            });
        }

        Ok(Self {
            domain,
            cert_path,
            key_path,
            issued_at,
            expires_at,
        })
    }

    /// Whether the certificate is still within its validity period
    pub fn is_unexpired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }

    /// Time left before expiry, zero once expired
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        (self.expires_at - now).to_std().unwrap_or(Duration::ZERO)
    }

    /// Renewal is due when strictly less than `threshold` remains
    pub fn needs_renewal(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        match chrono::Duration::from_std(threshold) {
            Ok(threshold) => self.expires_at - now < threshold,
            Err(_) => true,
        }
    }
}

/// Outcome of one issuance attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    Failed,
    Cancelled,
}

/// One issuance attempt, appended to the domain's attempt log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChallengeAttempt {
    pub run_id: RunId,
    pub method: ChallengeStrategy,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: AttemptOutcome,
    /// Stable error label, e.g. `challenge_failed`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// ACME account metadata for storage
///
/// The actual `instant_acme::AccountCredentials` is stored separately as JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredAccountCredentials {
    /// Contact email (for reference)
    #[serde(default)]
    pub contact_email: Option<String>,
    /// Directory the account was registered with
    #[serde(default)]
    pub directory: Option<String>,
    /// When the account was created
    pub created: DateTime<Utc>,
}

/// Certificate storage manager
///
/// Handles persistent storage of ACME account credentials and certificates.
/// Uses a simple filesystem-based storage with restrictive permissions.
#[derive(Debug)]
pub struct CertificateStore {
    /// Base storage directory
    base_path: PathBuf,
}

impl CertificateStore {
    /// Create a new certificate store at the given path
    ///
    /// Creates the directory structure if it doesn't exist and sets
    /// restrictive permissions (0700 on Unix).
    pub fn new(base_path: &Path) -> Result<Self, StorageError> {
        fs::create_dir_all(base_path)?;

        let domains_path = base_path.join("domains");
        fs::create_dir_all(&domains_path)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = fs::Permissions::from_mode(0o700);
            fs::set_permissions(base_path, perms.clone())?;
            fs::set_permissions(&domains_path, perms)?;
        }

        debug!(
            storage_path = %base_path.display(),
            "Initialized certificate storage"
        );

        Ok(Self {
            base_path: base_path.to_path_buf(),
        })
    }

    /// Get the storage base path
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Directory holding everything stored for a domain
    pub fn domain_path(&self, domain: &DomainName) -> PathBuf {
        self.base_path.join("domains").join(domain.as_str())
    }

    /// Paths the TLS variant points the proxy at, whether or not they exist yet
    pub fn live_paths(&self, domain: &DomainName) -> (PathBuf, PathBuf) {
        let dir = self.domain_path(domain);
        (dir.join(CERT_FILE), dir.join(KEY_FILE))
    }

    // =========================================================================
    // Account Operations
    // =========================================================================

    /// Load stored account metadata
    pub fn load_account(&self) -> Result<Option<StoredAccountCredentials>, StorageError> {
        let account_path = self.base_path.join("account.json");

        if !account_path.exists() {
            trace!("No stored ACME account found");
            return Ok(None);
        }

        let content = fs::read_to_string(&account_path)?;
        let creds: StoredAccountCredentials = serde_json::from_str(&content)?;

        debug!(
            contact = ?creds.contact_email,
            created = %creds.created,
            "Loaded ACME account metadata"
        );
        Ok(Some(creds))
    }

    /// Save account metadata
    pub fn save_account(&self, creds: &StoredAccountCredentials) -> Result<(), StorageError> {
        let content = serde_json::to_string_pretty(creds)?;
        write_private(&self.base_path.join("account.json"), content.as_bytes())?;

        info!(contact = ?creds.contact_email, "Saved ACME account metadata");
        Ok(())
    }

    /// Load raw credentials JSON (for instant_acme::AccountCredentials)
    pub fn load_credentials_json(&self) -> Result<Option<String>, StorageError> {
        let creds_path = self.base_path.join("credentials.json");

        if !creds_path.exists() {
            trace!("No stored ACME credentials found");
            return Ok(None);
        }

        let content = fs::read_to_string(&creds_path)?;
        debug!("Loaded ACME credentials JSON");
        Ok(Some(content))
    }

    /// Save raw credentials JSON (for instant_acme::AccountCredentials)
    pub fn save_credentials_json(&self, json: &str) -> Result<(), StorageError> {
        write_private(&self.base_path.join("credentials.json"), json.as_bytes())?;
        info!("Saved ACME credentials JSON");
        Ok(())
    }

    // =========================================================================
    // Certificate Operations
    // =========================================================================

    /// Load the current bundle of a domain.
    ///
    /// Returns `None` unless the chain, key and metadata files all exist.
    pub fn load_bundle(&self, domain: &DomainName) -> Result<Option<CertificateBundle>, StorageError> {
        let dir = self.domain_path(domain);
        let cert_path = dir.join(CERT_FILE);
        let key_path = dir.join(KEY_FILE);
        let meta_path = dir.join(META_FILE);

        if !cert_path.exists() || !key_path.exists() || !meta_path.exists() {
            trace!(domain = %domain, "No complete certificate bundle stored");
            return Ok(None);
        }

        let meta = read_meta(&meta_path)?;
        let bundle = CertificateBundle::new(
            domain.clone(),
            cert_path,
            key_path,
            meta.issued,
            meta.expires,
        )?;

        debug!(
            domain = %domain,
            expires = %bundle.expires_at,
            "Loaded stored certificate bundle"
        );

        Ok(Some(bundle))
    }

    /// Read the PEM chain of the stored bundle
    pub fn read_chain(&self, bundle: &CertificateBundle) -> Result<String, StorageError> {
        Ok(fs::read_to_string(&bundle.cert_path)?)
    }

    /// Store a freshly issued certificate, replacing the current bundle.
    ///
    /// The new files are written next to the live ones and renamed into
    /// place; the previous bundle, if any, is moved to `archive/` first.
    pub fn save_bundle(
        &self,
        domain: &DomainName,
        cert_pem: &str,
        key_pem: &str,
    ) -> Result<CertificateBundle, StorageError> {
        let validity = parse_certificate_validity(cert_pem)?;

        let dir = self.domain_path(domain);
        fs::create_dir_all(&dir)?;

        let cert_path = dir.join(CERT_FILE);
        let key_path = dir.join(KEY_FILE);
        let meta_path = dir.join(META_FILE);

        let bundle = CertificateBundle::new(
            domain.clone(),
            cert_path.clone(),
            key_path.clone(),
            validity.not_before,
            validity.not_after,
        )?;

        let meta = CertificateMeta {
            issued: validity.not_before,
            expires: validity.not_after,
            domains: validity.names,
            issuer: validity.issuer,
        };

        let staged_cert = dir.join(format!("{}.new", CERT_FILE));
        let staged_key = dir.join(format!("{}.new", KEY_FILE));
        let staged_meta = dir.join(format!("{}.new", META_FILE));
        fs::write(&staged_cert, cert_pem)?;
        write_private(&staged_key, key_pem.as_bytes())?;
        fs::write(&staged_meta, serde_json::to_string_pretty(&meta)?)?;

        self.archive_current(domain)?;

        // Key first: a chain without its key would be picked up as a bundle
        fs::rename(&staged_key, &key_path)?;
        fs::rename(&staged_cert, &cert_path)?;
        fs::rename(&staged_meta, &meta_path)?;

        info!(
            domain = %domain,
            issued = %bundle.issued_at,
            expires = %bundle.expires_at,
            "Saved certificate bundle"
        );

        Ok(bundle)
    }

    /// Move whatever live files exist into `archive/<issued_at>/`.
    ///
    /// Unreadable metadata must not block storing a new certificate; the
    /// archive is then named after the chain's notBefore, or the current
    /// time when the chain is unreadable too.
    fn archive_current(&self, domain: &DomainName) -> Result<(), StorageError> {
        let dir = self.domain_path(domain);
        let present: Vec<&str> = [CERT_FILE, KEY_FILE, META_FILE]
            .into_iter()
            .filter(|file| dir.join(file).exists())
            .collect();
        if present.is_empty() {
            return Ok(());
        }

        let issued_at = match read_meta(&dir.join(META_FILE)) {
            Ok(meta) => meta.issued,
            Err(e) => {
                warn!(domain = %domain, error = %e, "Previous certificate metadata unreadable, archiving as is");
                fs::read_to_string(dir.join(CERT_FILE))
                    .ok()
                    .and_then(|pem| parse_certificate_validity(&pem).ok())
                    .map(|validity| validity.not_before)
                    .unwrap_or_else(Utc::now)
            }
        };

        let archive_dir = dir
            .join("archive")
            .join(issued_at.format("%Y%m%dT%H%M%SZ").to_string());
        fs::create_dir_all(&archive_dir)?;

        for file in &present {
            fs::rename(dir.join(file), archive_dir.join(file))?;
        }

        debug!(
            domain = %domain,
            archive = %archive_dir.display(),
            files = present.len(),
            "Archived previous certificate bundle"
        );
        Ok(())
    }

    /// Remove the live bundle; the domain then counts as having no certificate
    pub fn remove_bundle(&self, domain: &DomainName) -> Result<(), StorageError> {
        let dir = self.domain_path(domain);
        let mut removed = false;

        for file in [CERT_FILE, KEY_FILE, META_FILE] {
            let path = dir.join(file);
            if path.exists() {
                fs::remove_file(&path)?;
                removed = true;
            }
        }

        if removed {
            info!(domain = %domain, "Removed stored certificate bundle");
        } else {
            warn!(domain = %domain, "Certificate bundle to remove not found");
        }
        Ok(())
    }

    /// Check if a certificate needs renewal
    ///
    /// Returns `true` if no bundle exists or strictly less than `threshold`
    /// remains before expiry.
    pub fn needs_renewal(&self, domain: &DomainName, threshold: Duration) -> Result<bool, StorageError> {
        let Some(bundle) = self.load_bundle(domain)? else {
            debug!(domain = %domain, "No certificate exists, needs issuance");
            return Ok(true);
        };

        let due = bundle.needs_renewal(Utc::now(), threshold);
        if due {
            debug!(domain = %domain, expires = %bundle.expires_at, "Certificate needs renewal");
        } else {
            trace!(domain = %domain, expires = %bundle.expires_at, "Certificate is still valid");
        }
        Ok(due)
    }

    // =========================================================================
    // Attempt History
    // =========================================================================

    /// Append an attempt to the domain's history
    pub fn record_attempt(&self, domain: &DomainName, attempt: &ChallengeAttempt) -> Result<(), StorageError> {
        let dir = self.domain_path(domain);
        fs::create_dir_all(&dir)?;

        let mut line = serde_json::to_string(attempt)?;
        line.push('\n');

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(ATTEMPTS_FILE))?;
        file.write_all(line.as_bytes())?;

        trace!(
            domain = %domain,
            method = %attempt.method,
            outcome = ?attempt.outcome,
            "Recorded challenge attempt"
        );
        Ok(())
    }

    /// The `limit` most recent attempts, oldest first
    pub fn recent_attempts(&self, domain: &DomainName, limit: usize) -> Result<Vec<ChallengeAttempt>, StorageError> {
        let path = self.domain_path(domain).join(ATTEMPTS_FILE);
        if !path.exists() {
            return Ok(Vec::new());
        }

        let content = fs::read_to_string(&path)?;
        let mut attempts = Vec::new();
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str::<ChallengeAttempt>(line) {
                Ok(attempt) => attempts.push(attempt),
                Err(e) => warn!(domain = %domain, error = %e, "Skipping corrupt attempt record"),
            }
        }

        let skip = attempts.len().saturating_sub(limit);
        Ok(attempts.split_off(skip))
    }
}

/// Validity window and names of a PEM certificate chain's leaf
#[derive(Debug, Clone)]
pub struct CertificateValidity {
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub names: Vec<String>,
    pub issuer: Option<String>,
}

/// Parse the first certificate of a PEM chain
pub fn parse_certificate_validity(cert_pem: &str) -> Result<CertificateValidity, StorageError> {
    use x509_parser::prelude::*;

    let (_, pem) = x509_parser::pem::parse_x509_pem(cert_pem.as_bytes())
        .map_err(|e| StorageError::InvalidCertificate(format!("Failed to parse PEM: {}", e)))?;

    let (_, cert) = X509Certificate::from_der(&pem.contents)
        .map_err(|e| StorageError::InvalidCertificate(format!("Failed to parse certificate: {}", e)))?;

    let to_utc = |t: ASN1Time| {
        DateTime::from_timestamp(t.timestamp(), 0)
            .ok_or_else(|| StorageError::InvalidCertificate("Invalid validity timestamp".to_string()))
    };

    let mut names = Vec::new();
    if let Ok(Some(san)) = cert.subject_alternative_name() {
        for name in &san.value.general_names {
            if let GeneralName::DNSName(dns) = name {
                names.push(dns.to_string());
            }
        }
    }

    let issuer = cert
        .issuer()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(|s| s.to_string());

    Ok(CertificateValidity {
        not_before: to_utc(cert.validity().not_before)?,
        not_after: to_utc(cert.validity().not_after)?,
        names,
        issuer,
    })
}

fn read_meta(path: &Path) -> Result<CertificateMeta, StorageError> {
    Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
}

/// Write a file readable only by the owner
fn write_private(path: &Path, content: &[u8]) -> Result<(), StorageError> {
    fs::write(path, content)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }

    Ok(())
}
