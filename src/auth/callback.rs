//! Loopback HTTP endpoint receiving the provider's authorization redirect.
//!
//! The listener holds a single-slot resolver. The first redirect carrying a code claims the slot,
//! drives the exchange and resolves the waiting caller; every later redirect finds the slot empty
//! and is turned away. The port is released as soon as the waiting caller has its result.

use super::Credential;
use crate::{Error, Result};
use actix_web::{
    dev::ServerHandle,
    http::{header::ContentType, StatusCode},
    web, App, HttpResponse, HttpServer,
};
use async_trait::async_trait;
use serde::Deserialize;
use std::io;
use std::net::SocketAddr;
use std::sync::{Mutex, PoisonError};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

const SUCCESS_PAGE: &str = "<h1>Authentication successful!</h1><p>You can close this window.</p>";
const FAILURE_PAGE: &str = "<h1>Authentication failed!</h1>";
const MISSING_CODE_PAGE: &str =
    "<h1>No authorization code received.</h1><p>Still waiting for the authorization redirect.</p>";
const ALREADY_RESOLVED_PAGE: &str = "<h1>This authorization has already been completed.</h1>";

/// Seconds an in-flight response gets to finish once the listener stops.
const SHUTDOWN_TIMEOUT_SECS: u64 = 5;

/// Turns an authorization code into a credential.
#[async_trait]
pub trait CodeHandler: Send + Sync + 'static {
    async fn handle_code(&self, code: &str) -> Result<Credential>;
}

/// Progress of the outstanding authorization request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Pending,
    Resolved,
    Failed,
}

type Resolver = oneshot::Sender<Result<Credential>>;

struct AuthorizationRequest {
    state: RequestState,
    resolver: Option<Resolver>,
}

/// Shared between the request handler and the listener that owns it.
struct PendingAuthorization {
    request: Mutex<AuthorizationRequest>,
    handler: Box<dyn CodeHandler>,
}

impl PendingAuthorization {
    fn new(handler: impl CodeHandler, resolver: Resolver) -> PendingAuthorization {
        PendingAuthorization {
            request: Mutex::new(AuthorizationRequest {
                state: RequestState::Pending,
                resolver: Some(resolver),
            }),
            handler: Box::new(handler),
        }
    }

    /// Takes the resolver. Only the first caller gets it.
    fn claim(&self) -> Option<Resolver> {
        let mut request = self.request.lock().unwrap_or_else(PoisonError::into_inner);

        match request.state {
            RequestState::Pending => request.resolver.take(),
            RequestState::Resolved | RequestState::Failed => None,
        }
    }

    fn resolve(&self, resolver: Resolver, result: Result<Credential>) {
        let state = match result {
            Ok(_) => RequestState::Resolved,
            Err(_) => RequestState::Failed,
        };

        self.request
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .state = state;

        if resolver.send(result).is_err() {
            log::warn!("authorization result dropped, nobody is waiting for it anymore");
        }
    }
}

#[derive(Deserialize)]
struct CallbackQuery {
    code: Option<String>,
    error: Option<String>,
}

fn html(status: StatusCode, body: &'static str) -> HttpResponse {
    HttpResponse::build(status)
        .content_type(ContentType::html())
        .body(body)
}

async fn callback(
    query: web::Query<CallbackQuery>,
    pending: web::Data<PendingAuthorization>,
) -> HttpResponse {
    let code = match query.code.as_deref() {
        Some(code) if !code.is_empty() => code,
        _ => {
            match &query.error {
                Some(error) => log::warn!("provider redirected without a code: {error}"),
                None => log::debug!("ignoring redirect without an authorization code"),
            }
            return html(StatusCode::BAD_REQUEST, MISSING_CODE_PAGE);
        }
    };

    let Some(resolver) = pending.claim() else {
        log::warn!("ignoring redirect, the authorization has already been claimed");
        return html(StatusCode::GONE, ALREADY_RESOLVED_PAGE);
    };

    match pending.handler.handle_code(code).await {
        Ok(credential) => {
            pending.resolve(resolver, Ok(credential));
            html(StatusCode::OK, SUCCESS_PAGE)
        }
        Err(err) => {
            log::error!("error during authentication: {err}");
            pending.resolve(resolver, Err(err));
            html(StatusCode::INTERNAL_SERVER_ERROR, FAILURE_PAGE)
        }
    }
}

/// A running callback endpoint.
///
/// Dropping the listener without waiting on it still stops the server.
pub struct CallbackListener {
    local_addr: SocketAddr,
    handle: ServerHandle,
    server: Option<JoinHandle<io::Result<()>>>,
    outcome: oneshot::Receiver<Result<Credential>>,
}

impl CallbackListener {
    /// Binds the endpoint on `addr` and starts serving `path`.
    ///
    /// Fails fast with [`Error::CallbackPortBusy`] if the address is already taken.
    pub fn start(
        addr: SocketAddr,
        path: &str,
        handler: impl CodeHandler,
    ) -> Result<CallbackListener> {
        let (resolver, outcome) = oneshot::channel();
        let pending = web::Data::new(PendingAuthorization::new(handler, resolver));
        let route = path.to_owned();

        let server = HttpServer::new(move || {
            App::new()
                .app_data(pending.clone())
                .route(&route, web::get().to(callback))
        })
        .workers(1)
        .disable_signals()
        .shutdown_timeout(SHUTDOWN_TIMEOUT_SECS)
        .bind(addr)
        .map_err(|err| match err.kind() {
            io::ErrorKind::AddrInUse => Error::CallbackPortBusy(addr),
            _ => Error::Io(err),
        })?;

        let local_addr = server.addrs().first().copied().unwrap_or(addr);
        let server = server.run();
        let handle = server.handle();

        log::info!("waiting for the authorization redirect on http://{local_addr}{path}");

        Ok(CallbackListener {
            local_addr,
            handle,
            server: Some(tokio::spawn(server)),
            outcome,
        })
    }

    /// The address the endpoint is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Waits for the first code-bearing redirect to be handled, then stops the listener.
    pub async fn wait(mut self) -> Result<Credential> {
        let result = match (&mut self.outcome).await {
            Ok(result) => result,
            Err(_) => Err(Error::ListenerClosed),
        };

        self.shutdown().await;

        result
    }

    /// Stops the listener without waiting for a redirect.
    pub async fn stop(mut self) {
        self.shutdown().await;
    }

    async fn shutdown(&mut self) {
        let Some(server) = self.server.take() else {
            return;
        };

        self.handle.stop(true).await;

        match server.await {
            Ok(Ok(())) => log::debug!("callback listener on {} stopped", self.local_addr),
            Ok(Err(err)) => log::warn!("callback listener on {} failed: {err}", self.local_addr),
            Err(err) => log::warn!("callback listener task failed: {err}"),
        }
    }
}

impl Drop for CallbackListener {
    fn drop(&mut self) {
        if self.server.is_some() {
            log::warn!("callback listener dropped while running, stopping it");
            // The stop command is sent right away, the returned future only tracks completion.
            drop(self.handle.stop(false));
        }
    }
}
