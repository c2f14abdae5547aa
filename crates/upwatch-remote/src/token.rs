//! ---
//! upw_section: "05-networking-external-interfaces"
//! upw_subsection: "module"
//! upw_type: "source"
//! upw_scope: "code"
//! upw_description: "Id token exchange and caching for the remote store."
//! upw_version: "v0.0.0-prealpha"
//! upw_owner: "tbd"
//! ---
//! Exchange of the device refresh token for short-lived id tokens.

use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DisplayFromStr, PickFirst};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};
use url::Url;

use crate::error::{RemoteError, Result};

const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// A bearer token plus the user that owns the device record.
#[derive(Debug, Clone)]
pub struct IdToken {
    /// Bearer token for the document API.
    pub token: String,
    /// User id the record lives under.
    pub user_id: String,
    refresh_at: Instant,
}

impl IdToken {
    fn is_fresh(&self) -> bool {
        Instant::now() < self.refresh_at
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RefreshRequest<'a> {
    grant_type: &'static str,
    refresh_token: &'a str,
}

#[serde_as]
#[derive(Deserialize)]
struct RefreshResponse {
    id_token: String,
    user_id: String,
    #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
    expires_in: u64,
}

/// Lazily refreshed id token cache.
#[derive(Debug)]
pub struct TokenProvider {
    http: Client,
    endpoint: Url,
    refresh_token: String,
    max_lifetime: Duration,
    cached: Mutex<Option<IdToken>>,
}

impl TokenProvider {
    /// Provider talking to `{token_url}/v1/token?key={api_key}`. Tokens are
    /// reused for at most `max_lifetime`.
    pub fn new(
        http: Client,
        token_url: &str,
        api_key: &str,
        refresh_token: impl Into<String>,
        max_lifetime: Duration,
    ) -> Result<Self> {
        let mut endpoint = Url::parse(&format!("{}/v1/token", token_url.trim_end_matches('/')))?;
        endpoint.query_pairs_mut().append_pair("key", api_key);
        Ok(Self {
            http,
            endpoint,
            refresh_token: refresh_token.into(),
            max_lifetime,
            cached: Mutex::new(None),
        })
    }

    /// A valid token, refreshing it when the cached one is close to expiry.
    pub async fn id_token(&self) -> Result<IdToken> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref().filter(|token| token.is_fresh()) {
            return Ok(token.clone());
        }
        let token = self.refresh().await?;
        *cached = Some(token.clone());
        Ok(token)
    }

    /// Drop the cached token so the next call refreshes.
    pub async fn invalidate(&self) {
        if self.cached.lock().await.take().is_some() {
            debug!("cached id token invalidated");
        }
    }

    async fn refresh(&self) -> Result<IdToken> {
        let response = self
            .http
            .post(self.endpoint.clone())
            .json(&RefreshRequest {
                grant_type: "refresh_token",
                refresh_token: &self.refresh_token,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
                RemoteError::Unreachable(format!("token endpoint returned {status}"))
            } else {
                RemoteError::Auth(format!("token refresh refused ({status}): {body}"))
            });
        }

        let payload: RefreshResponse = response
            .json()
            .await
            .map_err(|err| RemoteError::Decode(format!("token response: {err}")))?;
        let lifetime = Duration::from_secs(payload.expires_in)
            .min(self.max_lifetime)
            .saturating_sub(EXPIRY_MARGIN);
        info!(
            user_id = %payload.user_id,
            valid_for_secs = lifetime.as_secs(),
            "id token refreshed"
        );
        Ok(IdToken {
            token: payload.id_token,
            user_id: payload.user_id,
            refresh_at: Instant::now() + lifetime,
        })
    }
}
