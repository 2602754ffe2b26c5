pub mod models;

use crate::auth::{Authorizer, Credential};
use chrono::{DateTime, SecondsFormat, Utc};
use indexmap::IndexMap;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT_ENCODING, AUTHORIZATION};
use reqwest::{Request, Response};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware, Middleware, Next};
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;
use task_local_extensions::Extensions;
use tokio::sync::Mutex;

/// Base URL of the Google Calendar v3 API.
pub const GOOGLE_CALENDAR_API: &str = "https://www.googleapis.com/calendar/v3";

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("calendar request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("calendar request middleware failed: {0}")]
    RequestMiddleware(#[from] reqwest_middleware::Error),

    #[error("invalid header value: {0}")]
    InvalidHeaderValue(#[from] reqwest::header::InvalidHeaderValue),

    #[error("invalid calendar response: {0}")]
    Json(#[from] serde_json::Error),

    /// The access token could not be refreshed.
    #[error("failed to obtain access token: {0}")]
    Token(#[source] Box<crate::Error>),
}

impl From<ClientError> for reqwest_middleware::Error {
    fn from(err: ClientError) -> Self {
        reqwest_middleware::Error::Middleware(anyhow::Error::new(err))
    }
}

/// Something that hands out `Authorization` header values.
#[async_trait::async_trait]
pub trait TokenSource: Send + Sync {
    async fn token(&self) -> Result<String, ClientError>;
}

/// A `TokenSource` backed by an authorized user credential.
///
/// The access token is refreshed through the credential's refresh token whenever it is missing
/// or about to expire, and kept for the lifetime of this source only.
pub struct CredentialTokenSource {
    authorizer: Arc<dyn Authorizer>,
    credential: Mutex<Credential>,
}

impl CredentialTokenSource {
    pub fn new(authorizer: Arc<dyn Authorizer>, credential: Credential) -> CredentialTokenSource {
        CredentialTokenSource {
            authorizer,
            credential: Mutex::new(credential),
        }
    }
}

#[async_trait::async_trait]
impl TokenSource for CredentialTokenSource {
    async fn token(&self) -> Result<String, ClientError> {
        let mut credential = self.credential.lock().await;
        let now = Utc::now();

        if let Some(token) = credential.valid_access_token(now) {
            return Ok(format!("Bearer {token}"));
        }

        let grant = self
            .authorizer
            .refresh_access_token(&credential)
            .await
            .map_err(|err| ClientError::Token(Box::new(err)))?;

        let token = format!("Bearer {}", grant.access_token);
        credential.expiry = grant.expiry(now);
        credential.access_token = Some(grant.access_token);

        Ok(token)
    }
}

struct AuthMiddleware {
    token_source: Arc<dyn TokenSource>,
}

impl AuthMiddleware {
    fn new(token_source: Arc<dyn TokenSource>) -> AuthMiddleware {
        AuthMiddleware { token_source }
    }
}

#[async_trait::async_trait]
impl Middleware for AuthMiddleware {
    async fn handle(
        &self,
        mut req: Request,
        extensions: &mut Extensions,
        next: Next<'_>,
    ) -> reqwest_middleware::Result<Response> {
        let token = self.token_source.token().await?;

        let mut header = HeaderValue::try_from(token).map_err(ClientError::from)?;
        header.set_sensitive(true);
        req.headers_mut().insert(AUTHORIZATION, header);
        next.run(req, extensions).await
    }
}

/// Google calendar client for making requests to the google calendar api
#[derive(Debug)]
pub struct GoogleCalendarClient {
    client: ClientWithMiddleware,
    base_url: String,
    calendar_id: String,
}

impl GoogleCalendarClient {
    /// Creates a new google calendar client querying `calendar_id` below `base_url`. Every
    /// request is authorized with a token obtained from `token_source`.
    pub fn new(
        base_url: &str,
        calendar_id: &str,
        timeout: Duration,
        token_source: Arc<dyn TokenSource>,
    ) -> Result<GoogleCalendarClient, ClientError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT_ENCODING, HeaderValue::from_str("gzip")?);

        let client = ClientBuilder::new(
            reqwest::Client::builder()
                .default_headers(headers)
                .timeout(timeout)
                .build()?,
        )
        .with(AuthMiddleware::new(token_source))
        .build();

        Ok(GoogleCalendarClient {
            client,
            base_url: base_url.trim_end_matches('/').to_owned(),
            calendar_id: calendar_id.to_owned(),
        })
    }

    /// Queries one page of events from the google calendar, optionally filtered by a date range.
    /// The result carries a page token if more events are available.
    pub async fn get_events(
        &self,
        date_range: Option<Range<DateTime<Utc>>>,
        next_page_token: Option<String>,
    ) -> Result<(Vec<models::Event>, Option<String>), ClientError> {
        let events_request = self.client.get(format!(
            "{}/calendars/{}/events",
            self.base_url, self.calendar_id
        ));

        let query = build_query_parameters(&date_range, &next_page_token);

        let events = events_request
            .query(&query)
            .send()
            .await?
            .error_for_status()?
            .json::<models::Events>()
            .await?;

        log::debug!("fetched {} events from Google Calendar", events.items.len());

        Ok((events.items, events.next_page_token))
    }
}

fn build_query_parameters(
    date_range: &Option<Range<DateTime<Utc>>>,
    next_page_token: &Option<String>,
) -> IndexMap<&'static str, String> {
    // Recurring events are expanded server side, which is required for `orderBy=startTime`.
    let mut params: IndexMap<&'static str, String> = IndexMap::from([
        ("singleEvents", "true".to_owned()),
        ("orderBy", "startTime".to_owned()),
    ]);

    // The API expects RFC 3339 timestamps, see
    // https://developers.google.com/calendar/api/v3/reference/events/list
    if let Some(range) = date_range {
        params.insert(
            "timeMin",
            range.start.to_rfc3339_opts(SecondsFormat::Secs, true),
        );
        params.insert(
            "timeMax",
            range.end.to_rfc3339_opts(SecondsFormat::Secs, true),
        );
    }

    if let Some(token) = next_page_token {
        params.insert("pageToken", token.clone());
    }

    params
}
