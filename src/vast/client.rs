use anyhow::Context;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{Value, json};
use std::time::Duration;

use super::models::{CreateInstance, Instance, Offer};
use super::query::OfferQuery;
use crate::config::VastConfig;
use crate::errors::VastError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// The VastAI operations media-sync relies on. `VastClient` talks to the
/// real API; tests substitute an in-memory fake.
#[async_trait]
pub trait VastApi: Send + Sync {
    async fn list_instances(&self) -> Result<Vec<Instance>, VastError>;
    async fn show_instance(&self, id: u64) -> Result<Instance, VastError>;
    async fn search_offers(&self, query: &OfferQuery) -> Result<Vec<Offer>, VastError>;
    /// Returns the new instance (contract) id.
    async fn create_instance(&self, offer_id: u64, request: &CreateInstance)
    -> Result<u64, VastError>;
    async fn destroy_instance(&self, id: u64) -> Result<(), VastError>;
    async fn attach_ssh_key(&self, id: u64, public_key: &str) -> Result<(), VastError>;
}

/// Authenticated REST client for `console.vast.ai`.
#[derive(Clone)]
pub struct VastClient {
    base_url: String,
    api_key: String,
    http: reqwest::Client,
}

impl VastClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self, VastError> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(VastError::MissingApiKey);
        }
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("media-sync/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            http,
        })
    }

    pub fn from_config(config: &VastConfig, api_key: Option<&str>) -> Result<Self, VastError> {
        let key = api_key.ok_or(VastError::MissingApiKey)?;
        Self::new(config.base_url.clone(), key)
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<Value, VastError> {
        let resp = request
            .bearer_auth(&self.api_key)
            .header("Accept", "application/json")
            .send()
            .await
            .context("Failed to reach the VastAI API")?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .context("Failed to read VastAI API response")?;
        check_response(status.as_u16(), &body)
    }
}

/// Turn a raw response into JSON, surfacing both HTTP errors and the
/// `{"success": false, "msg": ...}` bodies the API returns with a 200.
pub fn check_response(status: u16, body: &str) -> Result<Value, VastError> {
    if !(200..300).contains(&status) {
        return Err(VastError::Http {
            status,
            body: truncate(body, 500),
        });
    }
    if body.trim().is_empty() {
        return Ok(Value::Null);
    }
    let value: Value =
        serde_json::from_str(body).context("VastAI API returned invalid JSON")?;
    if value.get("success") == Some(&Value::Bool(false)) {
        let msg = ["msg", "error", "message"]
            .iter()
            .find_map(|key| value.get(*key).and_then(Value::as_str))
            .unwrap_or("request failed")
            .to_string();
        return Err(VastError::Rejected(msg));
    }
    Ok(value)
}

fn truncate(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

fn field<T: DeserializeOwned>(value: &Value, key: &str) -> Result<T, VastError> {
    let inner = value
        .get(key)
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("VastAI response is missing '{}'", key))?;
    serde_json::from_value(inner)
        .with_context(|| format!("Failed to parse '{}' from VastAI response", key))
        .map_err(VastError::from)
}

pub fn parse_instances(value: &Value) -> Result<Vec<Instance>, VastError> {
    field(value, "instances")
}

/// `GET /instances/{id}/` wraps the record as `{"instances": {...}}`.
pub fn parse_instance(value: &Value, id: u64) -> Result<Instance, VastError> {
    match value.get("instances") {
        Some(Value::Null) | None => Err(VastError::Rejected(format!("instance {} not found", id))),
        Some(Value::Array(items)) => items
            .first()
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .context("Failed to parse instance")?
            .ok_or_else(|| VastError::Rejected(format!("instance {} not found", id))),
        Some(_) => field(value, "instances"),
    }
}

/// Offers sorted cheapest first; missing prices sort last.
pub fn parse_offers(value: &Value) -> Result<Vec<Offer>, VastError> {
    let mut offers: Vec<Offer> = field(value, "offers")?;
    offers.sort_by(|a, b| {
        let a = a.dph_total.unwrap_or(f64::MAX);
        let b = b.dph_total.unwrap_or(f64::MAX);
        a.total_cmp(&b)
    });
    Ok(offers)
}

#[derive(Deserialize)]
struct NewContract {
    new_contract: u64,
}

pub fn parse_new_contract(value: &Value) -> Result<u64, VastError> {
    let contract: NewContract = serde_json::from_value(value.clone())
        .context("VastAI response is missing 'new_contract'")?;
    Ok(contract.new_contract)
}

#[async_trait]
impl VastApi for VastClient {
    async fn list_instances(&self) -> Result<Vec<Instance>, VastError> {
        let value = self
            .send(self.http.get(self.url("instances/")).query(&[("owner", "me")]))
            .await?;
        parse_instances(&value)
    }

    async fn show_instance(&self, id: u64) -> Result<Instance, VastError> {
        let value = self
            .send(
                self.http
                    .get(self.url(&format!("instances/{}/", id)))
                    .query(&[("owner", "me")]),
            )
            .await?;
        parse_instance(&value, id)
    }

    async fn search_offers(&self, query: &OfferQuery) -> Result<Vec<Offer>, VastError> {
        let value = self
            .send(self.http.post(self.url("bundles/")).json(&query.to_json()))
            .await?;
        parse_offers(&value)
    }

    async fn create_instance(
        &self,
        offer_id: u64,
        request: &CreateInstance,
    ) -> Result<u64, VastError> {
        let value = self
            .send(
                self.http
                    .put(self.url(&format!("asks/{}/", offer_id)))
                    .json(request),
            )
            .await?;
        let id = parse_new_contract(&value)?;
        tracing::info!(offer_id, instance_id = id, image = %request.image, "VastAI instance created");
        Ok(id)
    }

    async fn destroy_instance(&self, id: u64) -> Result<(), VastError> {
        self.send(self.http.delete(self.url(&format!("instances/{}/", id))))
            .await?;
        tracing::info!(instance_id = id, "VastAI instance destroyed");
        Ok(())
    }

    async fn attach_ssh_key(&self, id: u64, public_key: &str) -> Result<(), VastError> {
        self.send(
            self.http
                .post(self.url(&format!("instances/{}/ssh/", id)))
                .json(&json!({ "ssh_key": public_key.trim() })),
        )
        .await?;
        tracing::info!(instance_id = id, "SSH key attached to VastAI instance");
        Ok(())
    }
}
