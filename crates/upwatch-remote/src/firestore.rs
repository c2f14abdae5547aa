//! ---
//! upw_section: "05-networking-external-interfaces"
//! upw_subsection: "module"
//! upw_type: "source"
//! upw_scope: "code"
//! upw_description: "Firestore REST implementation of the remote state store."
//! upw_version: "v0.0.0-prealpha"
//! upw_owner: "tbd"
//! ---
//! Device record stored as a Firestore document, accessed over the REST API.

use std::collections::BTreeMap;

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};
use upwatch_common::{DeviceIdentity, RemoteConfig, ServiceDiff, UpdatableServicesMap};
use url::Url;

use crate::error::{RemoteError, Result};
use crate::store::RemoteStateStore;
use crate::token::TokenProvider;

const FIELD: &str = "updatable_services";

/// Quote one field path segment with backticks, escaping `` ` `` and `\`.
pub fn quote_field_path(segment: &str) -> String {
    let mut quoted = String::with_capacity(segment.len() + 2);
    quoted.push('`');
    for ch in segment.chars() {
        if ch == '`' || ch == '\\' {
            quoted.push('\\');
        }
        quoted.push(ch);
    }
    quoted.push('`');
    quoted
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct Value {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    string_value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    map_value: Option<MapValue>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct MapValue {
    #[serde(default)]
    fields: BTreeMap<String, Value>,
}

#[derive(Debug, Default, Deserialize)]
struct Document {
    #[serde(default)]
    fields: BTreeMap<String, Value>,
}

fn decode_map(document: Document) -> UpdatableServicesMap {
    let Some(entries) = document
        .fields
        .into_iter()
        .find(|(name, _)| name == FIELD)
        .and_then(|(_, value)| value.map_value)
    else {
        return UpdatableServicesMap::new();
    };
    entries
        .fields
        .into_iter()
        .filter_map(|(service, value)| match value.string_value {
            Some(version) => Some((service, version)),
            None => {
                warn!(service = %service, "ignoring non-string updatable_services entry");
                None
            }
        })
        .collect()
}

fn encode_entries<'a>(entries: impl Iterator<Item = (&'a str, &'a str)>) -> serde_json::Value {
    let fields: serde_json::Map<String, serde_json::Value> = entries
        .map(|(service, version)| (service.to_owned(), json!({ "stringValue": version })))
        .collect();
    json!({ "fields": { FIELD: { "mapValue": { "fields": fields } } } })
}

/// [`RemoteStateStore`] for `users/{uid}/devices/{device_id}` in Firestore.
#[derive(Debug)]
pub struct FirestoreRemote {
    http: Client,
    base_url: Url,
    project_id: String,
    device_id: String,
    tokens: TokenProvider,
}

impl FirestoreRemote {
    /// Build a store for the device described by `identity`.
    pub fn new(config: &RemoteConfig, identity: &DeviceIdentity) -> Result<Self> {
        let http = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|err| RemoteError::Unreachable(format!("http client: {err}")))?;
        let tokens = TokenProvider::new(
            http.clone(),
            &config.token_url,
            &identity.api_key,
            identity.refresh_token.clone(),
            config.token_refresh,
        )?;
        Ok(Self {
            http,
            base_url: Url::parse(&config.firestore_url)?,
            project_id: identity.project_id.clone(),
            device_id: identity.device_id.clone(),
            tokens,
        })
    }

    /// Document path relative to the database root.
    pub fn document_path(&self, user_id: &str) -> String {
        format!(
            "projects/{}/databases/(default)/documents/users/{}/devices/{}",
            self.project_id, user_id, self.device_id
        )
    }

    /// Each id becomes its own escaped path segment.
    fn document_url(&self, user_id: &str) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| {
                RemoteError::Unreachable(format!("firestore_url {} cannot carry a path", self.base_url))
            })?
            .pop_if_empty()
            .extend(["v1", "projects", self.project_id.as_str()])
            .extend(["databases", "(default)", "documents"])
            .extend(["users", user_id, "devices", self.device_id.as_str()]);
        Ok(url)
    }

    async fn check_auth(&self, response: &Response) -> Result<()> {
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            self.tokens.invalidate().await;
            return Err(RemoteError::Auth(format!("document api returned {status}")));
        }
        Ok(())
    }

    async fn patch(&self, mask: Vec<String>, body: serde_json::Value) -> Result<()> {
        let token = self.tokens.id_token().await?;
        let mut url = self.document_url(&token.user_id)?;
        {
            let mut query = url.query_pairs_mut();
            for path in &mask {
                query.append_pair("updateMask.fieldPaths", path);
            }
        }
        let response = self
            .http
            .patch(url)
            .bearer_auth(&token.token)
            .json(&body)
            .send()
            .await?;
        self.check_auth(&response).await?;

        let status = response.status();
        if status.is_success() {
            debug!(fields = mask.len(), "device record patched");
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(RemoteError::Unreachable(format!("document api returned {status}")));
        }
        Err(RemoteError::WriteRejected {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl RemoteStateStore for FirestoreRemote {
    async fn read_updatable_services(&self) -> Result<UpdatableServicesMap> {
        let token = self.tokens.id_token().await?;
        let mut url = self.document_url(&token.user_id)?;
        url.query_pairs_mut().append_pair("mask.fieldPaths", FIELD);
        let response = self
            .http
            .get(url)
            .bearer_auth(&token.token)
            .send()
            .await?;
        self.check_auth(&response).await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(RemoteError::RecordNotFound(
                self.document_path(&token.user_id),
            ));
        }
        if !status.is_success() {
            return Err(RemoteError::Unreachable(format!(
                "document api returned {status}"
            )));
        }
        let document: Document = response
            .json()
            .await
            .map_err(|err| RemoteError::Decode(format!("device record: {err}")))?;
        Ok(decode_map(document))
    }

    async fn write_updatable_services(&self, diff: &ServiceDiff) -> Result<()> {
        if diff.is_empty() {
            return Ok(());
        }
        let mask = diff
            .keys()
            .map(|service| format!("{}.{}", FIELD, quote_field_path(service)))
            .collect();
        self.patch(mask, encode_entries(diff.upserts())).await
    }

    async fn replace_updatable_services(&self, map: &UpdatableServicesMap) -> Result<()> {
        let entries = map.iter().map(|(k, v)| (k.as_str(), v.as_str()));
        self.patch(vec![FIELD.to_owned()], encode_entries(entries))
            .await
    }
}
