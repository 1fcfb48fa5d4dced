//! ACME client wrapper around instant-acme
//!
//! [`AcmeClient`] is the seam the orchestrator issues through; the
//! production implementation [`InstantAcmeClient`] handles:
//! - Account creation and persistence
//! - Certificate ordering for a single domain
//! - HTTP-01 challenges via webroot files or the standalone listener
//! - Certificate finalization and storage

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, NewAccount,
    NewOrder, Order, OrderStatus,
};
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, info, trace, warn};

use certpilot_common::{ChallengeStrategy, Domain, PollPolicy};

use super::challenge::{ChallengeManager, ChallengeTarget, PublishedChallenges, WebrootPublisher};
use super::error::AcmeError;
use super::standalone::StandaloneServer;
use super::storage::{CertificateBundle, CertificateStore, StoredAccountCredentials};

/// Issues certificates for a domain with one challenge strategy.
///
/// Each call is one time-boxed attempt; on success the bundle has already
/// been written to the certificate store.
#[async_trait]
pub trait AcmeClient: Send + Sync {
    async fn issue(
        &self,
        domain: &Domain,
        strategy: ChallengeStrategy,
    ) -> Result<CertificateBundle, AcmeError>;
}

/// Settings for [`InstantAcmeClient`]
#[derive(Debug, Clone)]
pub struct AcmeClientSettings {
    pub directory_url: String,
    pub webroot: PathBuf,
    pub standalone_address: SocketAddr,
    /// Upper bound for a whole attempt, order to stored certificate
    pub attempt_timeout: Duration,
    /// How often order status is refreshed while waiting on the CA
    pub order_poll: PollPolicy,
}

/// ACME client backed by `instant-acme`
pub struct InstantAcmeClient {
    settings: AcmeClientSettings,
    store: Arc<CertificateStore>,
    /// ACME account (lazy initialized)
    account: Mutex<Option<Account>>,
    challenges: ChallengeManager,
}

impl InstantAcmeClient {
    pub fn new(settings: AcmeClientSettings, store: Arc<CertificateStore>) -> Self {
        Self {
            settings,
            store,
            account: Mutex::new(None),
            challenges: ChallengeManager::new(),
        }
    }

    /// Load the stored account or register a new one
    async fn account(&self, domain: &Domain, strategy: ChallengeStrategy) -> Result<Account, AcmeError> {
        let mut guard = self.account.lock().await;
        if let Some(ref account) = *guard {
            return Ok(account.clone());
        }

        if let Some(creds_json) = self.store.load_credentials_json()? {
            debug!("Loading existing ACME account from storage");

            let credentials: AccountCredentials = serde_json::from_str(&creds_json)
                .map_err(|e| AcmeError::Account(format!("Failed to deserialize credentials: {}", e)))?;

            let account = Account::from_credentials(credentials)
                .await
                .map_err(|e| AcmeError::from_acme(strategy, e))?;

            *guard = Some(account.clone());
            return Ok(account);
        }

        info!(
            email = %domain.email,
            directory = %self.settings.directory_url,
            "Creating new ACME account"
        );

        let contact = domain.contact_uri();
        let (account, credentials) = Account::create(
            &NewAccount {
                contact: &[contact.as_str()],
                terms_of_service_agreed: true,
                only_return_existing: false,
            },
            &self.settings.directory_url,
            None,
        )
        .await
        .map_err(|e| match AcmeError::from_acme(strategy, e) {
            AcmeError::Network(msg) => AcmeError::Network(msg),
            other => AcmeError::Account(other.to_string()),
        })?;

        let creds_json = serde_json::to_string_pretty(&credentials)
            .map_err(|e| AcmeError::Account(format!("Failed to serialize credentials: {}", e)))?;
        self.store.save_credentials_json(&creds_json)?;
        self.store.save_account(&StoredAccountCredentials {
            contact_email: Some(domain.email.clone()),
            directory: Some(self.settings.directory_url.clone()),
            created: Utc::now(),
        })?;

        *guard = Some(account.clone());
        Ok(account)
    }

    async fn attempt(
        &self,
        domain: &Domain,
        strategy: ChallengeStrategy,
    ) -> Result<CertificateBundle, AcmeError> {
        let account = self.account(domain, strategy).await?;

        info!(domain = %domain, strategy = %strategy, "Creating certificate order");
        let identifiers = [Identifier::Dns(domain.name.to_string())];
        let mut order = account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await
            .map_err(|e| match AcmeError::from_acme(strategy, e) {
                AcmeError::Network(msg) => AcmeError::Order(msg),
                other => other,
            })?;

        let listener = match strategy {
            ChallengeStrategy::Standalone => Some(
                StandaloneServer::bind(self.settings.standalone_address, self.challenges.clone())
                    .await
                    .map_err(|e| AcmeError::ChallengeFailed {
                        strategy,
                        message: format!(
                            "cannot bind standalone listener on {}: {}",
                            self.settings.standalone_address, e
                        ),
                    })?,
            ),
            ChallengeStrategy::Webroot => None,
        };

        let target = match strategy {
            ChallengeStrategy::Webroot => {
                ChallengeTarget::Webroot(WebrootPublisher::new(&self.settings.webroot))
            }
            ChallengeStrategy::Standalone => ChallengeTarget::Standalone(self.challenges.clone()),
        };
        let mut published = PublishedChallenges::new(target);
        let result = self
            .validate_and_finalize(domain, strategy, &mut order, &mut published)
            .await;

        drop(published);
        if let Some(listener) = listener {
            listener.shutdown().await;
        }

        let (cert_chain, key_pem) = result?;
        let bundle = self.store.save_bundle(&domain.name, &cert_chain, &key_pem)?;
        Ok(bundle)
    }

    async fn validate_and_finalize(
        &self,
        domain: &Domain,
        strategy: ChallengeStrategy,
        order: &mut Order,
        published: &mut PublishedChallenges,
    ) -> Result<(String, String), AcmeError> {
        let authorizations = order
            .authorizations()
            .await
            .map_err(|e| AcmeError::from_acme(strategy, e))?;

        let mut ready = Vec::new();
        for authz in &authorizations {
            match authz.status {
                AuthorizationStatus::Valid => {
                    debug!(domain = %domain, "Authorization already valid");
                    continue;
                }
                AuthorizationStatus::Pending => {}
                status => {
                    return Err(AcmeError::ChallengeFailed {
                        strategy,
                        message: format!("authorization is {:?}", status),
                    });
                }
            }

            let challenge = authz
                .challenges
                .iter()
                .find(|c| c.r#type == ChallengeType::Http01)
                .ok_or_else(|| AcmeError::ChallengeFailed {
                    strategy,
                    message: "CA offered no HTTP-01 challenge".to_string(),
                })?;

            let key_authorization = order.key_authorization(challenge);
            published
                .publish(&challenge.token, key_authorization.as_str())
                .map_err(|e| AcmeError::ChallengeFailed {
                    strategy,
                    message: format!("cannot publish challenge token: {}", e),
                })?;
            ready.push(challenge.url.clone());
        }

        for url in &ready {
            debug!(url = %url, "Setting challenge ready");
            order
                .set_challenge_ready(url)
                .await
                .map_err(|e| AcmeError::from_acme(strategy, e))?;
        }

        self.wait_for_ready(strategy, order).await?;
        self.finalize(domain, strategy, order).await
    }

    /// Poll the order until the CA has validated every authorization
    async fn wait_for_ready(&self, strategy: ChallengeStrategy, order: &mut Order) -> Result<(), AcmeError> {
        let policy = self.settings.order_poll;
        let start = Instant::now();

        for attempt in 1..=policy.max_attempts() {
            let (status, problem) = {
                let state = order
                    .refresh()
                    .await
                    .map_err(|e| AcmeError::from_acme(strategy, e))?;
                (state.status, state.error.clone())
            };

            match status {
                OrderStatus::Ready | OrderStatus::Valid => {
                    debug!(attempt, "Order is ready for finalization");
                    return Ok(());
                }
                OrderStatus::Invalid => {
                    let err = match problem {
                        Some(p) => AcmeError::from_problem(strategy, p.r#type.as_deref(), p.detail.as_deref()),
                        None => self.authorization_failure(strategy, order).await,
                    };
                    error!(error = %err, "Order became invalid");
                    return Err(err);
                }
                OrderStatus::Pending | OrderStatus::Processing => {
                    trace!(status = ?status, attempt, "Order not ready yet, waiting");
                    sleep(policy.interval).await;
                }
            }
        }

        Err(AcmeError::Timeout {
            strategy,
            elapsed: start.elapsed(),
        })
    }

    /// Extract the CA's reason from the first failed challenge
    async fn authorization_failure(&self, strategy: ChallengeStrategy, order: &mut Order) -> AcmeError {
        let authorizations = match order.authorizations().await {
            Ok(authorizations) => authorizations,
            Err(e) => return AcmeError::from_acme(strategy, e),
        };

        authorizations
            .iter()
            .flat_map(|authz| authz.challenges.iter())
            .find_map(|c| c.error.as_ref())
            .map(|p| AcmeError::from_problem(strategy, p.r#type.as_deref(), p.detail.as_deref()))
            .unwrap_or_else(|| AcmeError::ChallengeFailed {
                strategy,
                message: "order became invalid without a reported reason".to_string(),
            })
    }

    /// Submit a CSR and download the issued chain
    ///
    /// Returns `(certificate_chain_pem, private_key_pem)`.
    async fn finalize(
        &self,
        domain: &Domain,
        strategy: ChallengeStrategy,
        order: &mut Order,
    ) -> Result<(String, String), AcmeError> {
        info!(domain = %domain, "Finalizing certificate order");

        let cert_key = rcgen::KeyPair::generate()
            .map_err(|e| AcmeError::Finalization(format!("Failed to generate key: {}", e)))?;

        let params = rcgen::CertificateParams::new(vec![domain.name.to_string()])
            .map_err(|e| AcmeError::Finalization(format!("Failed to create CSR params: {}", e)))?;

        let csr = params
            .serialize_request(&cert_key)
            .map_err(|e| AcmeError::Finalization(format!("Failed to serialize CSR: {}", e)))?;

        order
            .finalize(csr.der())
            .await
            .map_err(|e| AcmeError::Finalization(format!("Failed to finalize order: {}", e)))?;

        let policy = self.settings.order_poll;
        for attempt in 1..=policy.max_attempts() {
            match order.certificate().await {
                Ok(Some(chain)) => {
                    info!(domain = %domain, "Certificate issued successfully");
                    return Ok((chain, cert_key.serialize_pem()));
                }
                Ok(None) => {
                    trace!(attempt, "Certificate not available yet, waiting");
                    sleep(policy.interval).await;
                }
                Err(e) => {
                    return Err(match AcmeError::from_acme(strategy, e) {
                        AcmeError::Network(msg) => AcmeError::Finalization(msg),
                        other => other,
                    })
                }
            }
        }

        Err(AcmeError::Finalization("No certificate in response".to_string()))
    }
}

#[async_trait]
impl AcmeClient for InstantAcmeClient {
    async fn issue(
        &self,
        domain: &Domain,
        strategy: ChallengeStrategy,
    ) -> Result<CertificateBundle, AcmeError> {
        let start = Instant::now();

        match timeout(self.settings.attempt_timeout, self.attempt(domain, strategy)).await {
            Ok(Ok(bundle)) => {
                info!(
                    domain = %domain,
                    strategy = %strategy,
                    expires = %bundle.expires_at,
                    elapsed_secs = start.elapsed().as_secs(),
                    "Issuance attempt succeeded"
                );
                Ok(bundle)
            }
            Ok(Err(e)) => {
                warn!(domain = %domain, strategy = %strategy, error = %e, "Issuance attempt failed");
                Err(e)
            }
            Err(_) => {
                // Dropping the attempt withdrew its published tokens
                warn!(domain = %domain, strategy = %strategy, "Issuance attempt timed out");
                Err(AcmeError::Timeout {
                    strategy,
                    elapsed: start.elapsed(),
                })
            }
        }
    }
}

impl std::fmt::Debug for InstantAcmeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstantAcmeClient")
            .field("settings", &self.settings)
            .field(
                "has_account",
                &self.account.try_lock().map(|a| a.is_some()).unwrap_or(false),
            )
            .finish()
    }
}
