pub mod callback;
pub mod google;
pub mod store;

pub use callback::{CallbackListener, CodeHandler};
pub use google::GoogleOAuthClient;
pub use store::CredentialStore;

use crate::{AuthConfig, Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Access tokens expiring within this margin are treated as expired.
const EXPIRY_MARGIN_SECS: i64 = 60;

/// The only credential type this application persists.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CredentialKind {
    #[default]
    #[serde(rename = "authorized_user")]
    AuthorizedUser,
}

/// The application's registered OAuth client.
#[derive(Deserialize, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    pub client_id: String,
    pub client_secret: String,
}

impl fmt::Debug for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientIdentity")
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}

/// An authorized user credential.
///
/// Only the client identity and the refresh token are ever persisted. The access token and its
/// expiry live for the duration of a single run.
#[derive(Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct Credential {
    #[serde(rename = "type")]
    pub kind: CredentialKind,
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: String,
    #[serde(default, skip_serializing)]
    pub access_token: Option<String>,
    #[serde(default, skip_serializing)]
    pub expiry: Option<DateTime<Utc>>,
}

impl Credential {
    /// Creates a credential carrying only refresh capability.
    pub fn authorized_user(identity: ClientIdentity, refresh_token: String) -> Credential {
        Credential {
            kind: CredentialKind::AuthorizedUser,
            client_id: identity.client_id,
            client_secret: identity.client_secret,
            refresh_token,
            access_token: None,
            expiry: None,
        }
    }

    /// The client identity this credential was issued to.
    pub fn identity(&self) -> ClientIdentity {
        ClientIdentity {
            client_id: self.client_id.clone(),
            client_secret: self.client_secret.clone(),
        }
    }

    /// Returns the access token if it is present and not about to expire.
    pub fn valid_access_token(&self, now: DateTime<Utc>) -> Option<&str> {
        let token = self.access_token.as_deref().filter(|t| !t.is_empty())?;

        match self.expiry {
            Some(expiry) if expiry - Duration::seconds(EXPIRY_MARGIN_SECS) <= now => None,
            _ => Some(token),
        }
    }

    /// A credential is usable if it can be refreshed or still carries a live access token.
    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        !self.refresh_token.trim().is_empty() || self.valid_access_token(now).is_some()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("client_id", &self.client_id)
            .field("has_refresh_token", &!self.refresh_token.is_empty())
            .field("has_access_token", &self.access_token.is_some())
            .field("expiry", &self.expiry)
            .finish_non_exhaustive()
    }
}

/// Tokens returned by the provider's token endpoint.
#[derive(Deserialize, Clone)]
pub struct TokenGrant {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
}

impl TokenGrant {
    /// Absolute expiry of the access token relative to `now`.
    pub fn expiry(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.expires_in.map(|secs| now + Duration::seconds(secs))
    }
}

impl fmt::Debug for TokenGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenGrant")
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("expires_in", &self.expires_in)
            .finish_non_exhaustive()
    }
}

/// Talks to the provider's OAuth2 endpoints.
#[async_trait]
pub trait Authorizer: Send + Sync {
    /// Builds the consent URL the operator has to visit.
    fn authorization_url(
        &self,
        identity: &ClientIdentity,
        redirect_uri: &str,
        scopes: &[String],
    ) -> Result<String>;

    /// Exchanges a one-time authorization code for tokens.
    async fn exchange_code(
        &self,
        identity: &ClientIdentity,
        code: &str,
        redirect_uri: &str,
    ) -> Result<TokenGrant>;

    /// Obtains a fresh access token from the credential's refresh token.
    async fn refresh_access_token(&self, credential: &Credential) -> Result<TokenGrant>;
}

/// States of the authorization lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorizationState {
    CheckCache,
    CachedValid,
    NeedsGrant,
    AwaitRedirect,
    Exchanging,
    Granted,
    GrantFailed,
}

impl AuthorizationState {
    fn as_str(&self) -> &str {
        match self {
            AuthorizationState::CheckCache => "check-cache",
            AuthorizationState::CachedValid => "cached-valid",
            AuthorizationState::NeedsGrant => "needs-grant",
            AuthorizationState::AwaitRedirect => "await-redirect",
            AuthorizationState::Exchanging => "exchanging",
            AuthorizationState::Granted => "granted",
            AuthorizationState::GrantFailed => "grant-failed",
        }
    }
}

impl fmt::Display for AuthorizationState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.as_str().fmt(f)
    }
}

fn transition(state: AuthorizationState) {
    log::debug!("authorization state: {state}");
}

/// Acquires a usable credential, either from the store or through an interactive grant.
pub struct AuthorizationFlow {
    config: AuthConfig,
    store: CredentialStore,
    authorizer: Arc<dyn Authorizer>,
    in_flight: Mutex<()>,
}

impl AuthorizationFlow {
    pub fn new(config: AuthConfig, authorizer: Arc<dyn Authorizer>) -> AuthorizationFlow {
        let store = CredentialStore::new(&config.token_path, &config.credentials_path);

        AuthorizationFlow {
            config,
            store,
            authorizer,
            in_flight: Mutex::new(()),
        }
    }

    /// Returns the stored credential, or runs the interactive grant if there is none.
    ///
    /// The stored credential is read fresh on every call. A cached credential is accepted as long
    /// as it is usable; it is not refreshed here.
    pub async fn authorize(&self) -> Result<Credential> {
        transition(AuthorizationState::CheckCache);

        if let Some(credential) = self.store.load().await {
            if credential.is_usable(Utc::now()) {
                transition(AuthorizationState::CachedValid);
                return Ok(credential);
            }

            log::warn!(
                "stored credential at {} can neither be refreshed nor used, requesting a new grant",
                self.store.token_path().display()
            );
        }

        self.grant().await
    }

    async fn grant(&self) -> Result<Credential> {
        let _guard = self
            .in_flight
            .try_lock()
            .map_err(|_| Error::AuthorizationPending(self.config.listen_addr))?;

        transition(AuthorizationState::NeedsGrant);

        let identity = self.store.client_identity().await?;
        let redirect_uri = self.config.redirect_uri();
        let auth_url =
            self.authorizer
                .authorization_url(&identity, &redirect_uri, &self.config.scopes)?;

        let exchange = GrantExchange {
            authorizer: self.authorizer.clone(),
            store: self.store.clone(),
            identity,
            redirect_uri,
        };

        let listener =
            CallbackListener::start(self.config.listen_addr, &self.config.redirect_path, exchange)?;

        log::info!("Authorize this app by visiting this url: {auth_url}");
        transition(AuthorizationState::AwaitRedirect);

        match listener.wait().await {
            Ok(credential) => {
                transition(AuthorizationState::Granted);
                Ok(credential)
            }
            Err(err) => {
                transition(AuthorizationState::GrantFailed);
                Err(err)
            }
        }
    }
}

/// Exchanges the redirected code and persists the resulting credential.
struct GrantExchange {
    authorizer: Arc<dyn Authorizer>,
    store: CredentialStore,
    identity: ClientIdentity,
    redirect_uri: String,
}

#[async_trait]
impl CodeHandler for GrantExchange {
    async fn handle_code(&self, code: &str) -> Result<Credential> {
        transition(AuthorizationState::Exchanging);

        let grant = self
            .authorizer
            .exchange_code(&self.identity, code, &self.redirect_uri)
            .await?;

        let refresh_token = grant
            .refresh_token
            .clone()
            .filter(|token| !token.is_empty())
            .ok_or(Error::MissingRefreshToken)?;

        let mut credential = Credential::authorized_user(self.identity.clone(), refresh_token);
        credential.expiry = grant.expiry(Utc::now());
        credential.access_token = Some(grant.access_token);

        self.store.save(&credential).await?;

        Ok(credential)
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use std::net::TcpListener;
    use std::time::Duration as StdDuration;
    use tempfile::TempDir;

    const SECRETS: &str = r#"{"installed":{"client_id":"id.apps","client_secret":"s3cret"}}"#;

    /// Sends redirects until the listener is up and answers.
    async fn redirect(addr: std::net::SocketAddr, query: &str) -> reqwest::StatusCode {
        let url = format!("http://{addr}/oauth2callback{query}");
        for _ in 0..100 {
            if let Ok(response) = reqwest::get(&url).await {
                return response.status();
            }
            tokio::time::sleep(StdDuration::from_millis(20)).await;
        }
        panic!("callback listener never came up on {addr}");
    }

    fn usable(refresh_token: &str, access_token: Option<&str>, expiry: Option<i64>) -> bool {
        let now = Utc::now();
        let mut credential = Credential::authorized_user(
            ClientIdentity {
                client_id: "id".into(),
                client_secret: "secret".into(),
            },
            refresh_token.into(),
        );
        credential.access_token = access_token.map(Into::into);
        credential.expiry = expiry.map(|secs| now + Duration::seconds(secs));
        credential.is_usable(now)
    }

    #[test]
    fn credential_usability() {
        assert!(usable("refresh", None, None));
        assert!(usable("", Some("access"), Some(3600)));
        assert!(usable("", Some("access"), None));
        assert!(!usable("", None, None));
        assert!(!usable("  ", Some("access"), Some(-10)));
        assert!(!usable("", Some("access"), Some(30)));
        assert!(!usable("", Some(""), Some(3600)));
    }

    #[test]
    fn credential_debug_hides_secrets() {
        let credential = Credential::authorized_user(
            ClientIdentity {
                client_id: "id".into(),
                client_secret: "top-secret".into(),
            },
            "refresh-secret".into(),
        );
        let debug = format!("{credential:?}");
        assert!(!debug.contains("top-secret"));
        assert!(!debug.contains("refresh-secret"));
    }

    #[actix_rt::test]
    async fn cached_credential_skips_listener() {
        let dir = TempDir::new().unwrap();
        write_stored_credential(dir.path());

        // Occupy the callback port. Binding it would fail the flow.
        let occupied = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = occupied.local_addr().unwrap();

        let authorizer = Arc::new(FakeAuthorizer::default());
        let flow = AuthorizationFlow::new(auth_config(dir.path(), addr), authorizer.clone());

        let credential = flow.authorize().await.unwrap();

        assert_eq!(credential.refresh_token, "stored");
        assert_eq!(FakeAuthorizer::count(&authorizer.urls), 0);
        assert_eq!(FakeAuthorizer::count(&authorizer.exchanges), 0);
    }

    #[actix_rt::test]
    async fn unusable_cached_credential_requests_grant() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("credentials.json"), SECRETS).unwrap();
        std::fs::write(
            dir.path().join("token.json"),
            r#"{"type":"authorized_user","client_id":"id","client_secret":"secret","refresh_token":""}"#,
        )
        .unwrap();

        let addr = free_addr();
        let authorizer = Arc::new(FakeAuthorizer::default());
        let flow = AuthorizationFlow::new(auth_config(dir.path(), addr), authorizer.clone());

        let grant = tokio::spawn(async move { flow.authorize().await });
        assert_eq!(redirect(addr, "?code=abc").await, reqwest::StatusCode::OK);

        let credential = grant.await.unwrap().unwrap();
        assert_eq!(credential.refresh_token, "refresh-abc");
        assert_eq!(FakeAuthorizer::count(&authorizer.urls), 1);
    }

    #[actix_rt::test]
    async fn malformed_credential_runs_single_grant() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("credentials.json"), SECRETS).unwrap();
        std::fs::write(dir.path().join("token.json"), "garbage").unwrap();

        let addr = free_addr();
        let authorizer = Arc::new(FakeAuthorizer::default());
        let flow = AuthorizationFlow::new(auth_config(dir.path(), addr), authorizer.clone());

        let grant = tokio::spawn(async move { flow.authorize().await });

        // A redirect without a code keeps the listener waiting.
        assert_eq!(redirect(addr, "").await, reqwest::StatusCode::BAD_REQUEST);
        assert_eq!(redirect(addr, "?code=xyz").await, reqwest::StatusCode::OK);

        let credential = grant.await.unwrap().unwrap();
        assert_eq!(credential.client_id, "id.apps");
        assert_eq!(credential.refresh_token, "refresh-xyz");
        assert_eq!(credential.access_token.as_deref(), Some("access-xyz"));
        assert_eq!(FakeAuthorizer::count(&authorizer.exchanges), 1);

        let stored = CredentialStore::new(
            dir.path().join("token.json"),
            dir.path().join("credentials.json"),
        )
        .load()
        .await
        .unwrap();
        assert_eq!(stored.refresh_token, "refresh-xyz");

        assert!(port_released(addr).await);
    }

    #[actix_rt::test]
    async fn failed_exchange_stops_listener() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("credentials.json"), SECRETS).unwrap();

        let addr = free_addr();
        let authorizer = Arc::new(FakeAuthorizer::failing());
        let flow = AuthorizationFlow::new(auth_config(dir.path(), addr), authorizer.clone());

        let grant = tokio::spawn(async move { flow.authorize().await });
        assert_eq!(
            redirect(addr, "?code=bad").await,
            reqwest::StatusCode::INTERNAL_SERVER_ERROR
        );

        assert!(matches!(grant.await.unwrap(), Err(Error::Exchange(_))));
        assert_eq!(FakeAuthorizer::count(&authorizer.exchanges), 1);
        assert!(!dir.path().join("token.json").exists());
        assert!(port_released(addr).await);
    }

    #[actix_rt::test]
    async fn busy_port_rejects_grant() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("credentials.json"), SECRETS).unwrap();

        let occupied = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = occupied.local_addr().unwrap();

        let flow = AuthorizationFlow::new(
            auth_config(dir.path(), addr),
            Arc::new(FakeAuthorizer::default()),
        );

        assert!(matches!(
            flow.authorize().await,
            Err(Error::CallbackPortBusy(busy)) if busy == addr
        ));
    }

    #[actix_rt::test]
    async fn concurrent_grant_is_rejected() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("credentials.json"), SECRETS).unwrap();

        let addr = free_addr();
        let authorizer = Arc::new(FakeAuthorizer::default());
        let flow = Arc::new(AuthorizationFlow::new(
            auth_config(dir.path(), addr),
            authorizer.clone(),
        ));

        let first = tokio::spawn({
            let flow = flow.clone();
            async move { flow.authorize().await }
        });

        // Wait until the first grant is listening for its redirect.
        assert_eq!(redirect(addr, "").await, reqwest::StatusCode::BAD_REQUEST);

        assert!(matches!(
            flow.authorize().await,
            Err(Error::AuthorizationPending(pending)) if pending == addr
        ));
        assert_eq!(FakeAuthorizer::count(&authorizer.urls), 1);

        assert_eq!(redirect(addr, "?code=one").await, reqwest::StatusCode::OK);
        let credential = first.await.unwrap().unwrap();
        assert_eq!(credential.refresh_token, "refresh-one");
        assert!(port_released(addr).await);
    }

    #[actix_rt::test]
    async fn missing_client_identity_fails_before_listening() {
        let dir = TempDir::new().unwrap();
        let addr = free_addr();
        let authorizer = Arc::new(FakeAuthorizer::default());
        let flow = AuthorizationFlow::new(auth_config(dir.path(), addr), authorizer.clone());

        assert!(matches!(flow.authorize().await, Err(Error::Io(_))));
        assert_eq!(FakeAuthorizer::count(&authorizer.urls), 0);
        assert!(TcpListener::bind(addr).is_ok());
    }
}
