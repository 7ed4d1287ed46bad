//! Session token acquisition.
//!
//! The server trusts a short-lived session token obtained by POSTing
//! `{ "room": … }` to an auth endpoint. Three flavors are supported:
//! an anonymous public API key against the public-authorize endpoint, an
//! application-hosted endpoint URL, and a caller-supplied async callback.
//!
//! The token is shaped like a JWT; the client does not verify signatures
//! but does base64url-decode the payload segment to learn its assigned
//! `actor` id. A token the client cannot parse is a permanent failure.

use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde::Deserialize;
use serde_json::{json, Value};

use huddle_store::ActorId;

use crate::error::{AuthError, FetchError};

/// Async callback producing a raw session token for a room.
pub type AuthCallback =
    Arc<dyn Fn(&str) -> BoxFuture<'static, Result<String, AuthError>> + Send + Sync>;

/// Minimal HTTP POST surface, injectable for non-default hosts and tests.
pub trait Fetcher: Send + Sync + 'static {
    fn post_json(
        &self,
        url: &str,
        body: Value,
    ) -> BoxFuture<'static, Result<FetchResponse, FetchError>>;
}

#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub status: u16,
    pub body: String,
}

/// Default fetcher backed by `reqwest`.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Fetcher for HttpFetcher {
    fn post_json(
        &self,
        url: &str,
        body: Value,
    ) -> BoxFuture<'static, Result<FetchResponse, FetchError>> {
        let client = self.client.clone();
        let url = url.to_string();
        async move {
            let response = client
                .post(&url)
                .json(&body)
                .send()
                .await
                .map_err(|e| FetchError(e.to_string()))?;
            let status = response.status().as_u16();
            let body = response
                .text()
                .await
                .map_err(|e| FetchError(e.to_string()))?;
            Ok(FetchResponse { status, body })
        }
        .boxed()
    }
}

/// How this client obtains tokens. Built by `Client::new` from the
/// validated options.
#[derive(Clone)]
pub(crate) enum AuthBackend {
    PublicKey { key: String, endpoint: String },
    Endpoint { url: String },
    Callback(AuthCallback),
}

/// A parsed session token.
#[derive(Debug, Clone)]
pub struct SessionToken {
    pub raw: String,
    pub actor: ActorId,
}

#[derive(Deserialize)]
struct TokenResponse {
    token: String,
}

pub(crate) async fn acquire_token(
    backend: &AuthBackend,
    fetcher: &Arc<dyn Fetcher>,
    room: &str,
) -> Result<SessionToken, AuthError> {
    let raw = match backend {
        AuthBackend::Callback(callback) => callback(room).await?,
        AuthBackend::PublicKey { key, endpoint } => {
            post_for_token(fetcher, endpoint, json!({ "room": room, "publicApiKey": key })).await?
        }
        AuthBackend::Endpoint { url } => {
            post_for_token(fetcher, url, json!({ "room": room })).await?
        }
    };
    parse_token(&raw)
}

async fn post_for_token(
    fetcher: &Arc<dyn Fetcher>,
    url: &str,
    body: Value,
) -> Result<String, AuthError> {
    let response = fetcher
        .post_json(url, body)
        .await
        .map_err(|e| AuthError::Network(e.to_string()))?;
    match response.status {
        200 => serde_json::from_str::<TokenResponse>(&response.body)
            .map(|t| t.token)
            .map_err(|e| AuthError::InvalidResponse(e.to_string())),
        401 | 403 => Err(AuthError::Forbidden(response.status)),
        status => Err(AuthError::Status(status)),
    }
}

/// Extract the actor claim from the token's payload segment.
pub(crate) fn parse_token(raw: &str) -> Result<SessionToken, AuthError> {
    let parts: Vec<&str> = raw.split('.').collect();
    if parts.len() != 3 {
        return Err(AuthError::MalformedToken(
            "token must have 3 segments".into(),
        ));
    }
    let payload = URL_SAFE_NO_PAD
        .decode(parts[1])
        .map_err(|e| AuthError::MalformedToken(format!("base64 decode failed: {e}")))?;
    let claims: Value = serde_json::from_slice(&payload)
        .map_err(|e| AuthError::MalformedToken(format!("JSON parse failed: {e}")))?;
    let actor = claims
        .get("actor")
        .and_then(Value::as_u64)
        .and_then(|a| ActorId::try_from(a).ok())
        .ok_or_else(|| AuthError::MalformedToken("missing or invalid actor claim".into()))?;
    Ok(SessionToken {
        raw: raw.to_string(),
        actor,
    })
}

#[cfg(test)]
pub(crate) fn make_test_token(actor: ActorId) -> String {
    let header = URL_SAFE_NO_PAD.encode(b"{\"alg\":\"none\",\"typ\":\"JWT\"}");
    let payload = URL_SAFE_NO_PAD.encode(
        serde_json::to_vec(&json!({ "actor": actor, "room": "test" })).expect("payload encodes"),
    );
    let signature = URL_SAFE_NO_PAD.encode(b"sig");
    format!("{header}.{payload}.{signature}")
}
