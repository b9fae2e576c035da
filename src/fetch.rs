//! `fetch()` for render modules, limited to an origin allowlist.
//!
//! - Only URLs whose origin is allowlisted can be fetched
//! - Redirects are followed manually and must stay on the same origin
//! - An empty allowlist disables fetch entirely

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use anyhow::anyhow;
use deno_core::{op2, OpState};
use reqwest::{Client, Method};
use serde::{Deserialize, Serialize};
use url::Url;

const MAX_REDIRECTS: usize = 5;

/// Fetch allowlist plus the shared HTTP client; lives in `OpState`.
#[derive(Debug, Clone)]
pub struct FetchPolicy {
    /// Origins as scheme + host + port, e.g. `https://api.example.com`.
    allowed_origins: Vec<String>,
    client: Client,
}

impl FetchPolicy {
    pub fn new(allowed_origins: Vec<String>) -> Result<Self, anyhow::Error> {
        let client = Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| anyhow!("Failed to create HTTP client: {}", e))?;

        Ok(Self {
            allowed_origins: allowed_origins
                .into_iter()
                .map(|origin| origin.trim_end_matches('/').to_string())
                .collect(),
            client,
        })
    }

    pub fn is_origin_allowed(&self, url: &Url) -> bool {
        let origin = url.origin().ascii_serialization();
        self.allowed_origins.iter().any(|allowed| origin == *allowed)
    }
}

#[derive(Debug, Deserialize)]
pub struct FetchRequest {
    pub url: String,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub headers: Option<HashMap<String, String>>,
    #[serde(default)]
    pub body: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchResponse {
    pub ok: bool,
    pub status: u16,
    pub status_text: String,
    pub headers: HashMap<String, String>,
    pub url: String,
    pub body: String,
}

#[op2(async)]
#[serde]
pub async fn op_fetch(
    state: Rc<RefCell<OpState>>,
    #[serde] request: FetchRequest,
) -> Result<FetchResponse, deno_core::error::AnyError> {
    let policy = {
        let state_ref = state.borrow();
        state_ref.borrow::<FetchPolicy>().clone()
    };
    fetch(request, &policy).await
}

async fn fetch(mut request: FetchRequest, policy: &FetchPolicy) -> Result<FetchResponse, anyhow::Error> {
    let origin = Url::parse(&request.url)
        .map_err(|e| anyhow!("Invalid URL '{}': {}", request.url, e))?
        .origin();

    for _ in 0..=MAX_REDIRECTS {
        let url = Url::parse(&request.url)
            .map_err(|e| anyhow!("Invalid URL '{}': {}", request.url, e))?;

        if url.origin() != origin {
            return Err(anyhow!(
                "Fetch blocked: redirect to different origin '{}' (original: '{}')",
                url.origin().ascii_serialization(),
                origin.ascii_serialization()
            ));
        }
        if !policy.is_origin_allowed(&url) {
            return Err(anyhow!(
                "Fetch blocked: origin '{}' is not in the allowlist",
                url.origin().ascii_serialization()
            ));
        }

        let method_name = request.method.as_deref().unwrap_or("GET").to_uppercase();
        let method = Method::from_bytes(method_name.as_bytes())
            .map_err(|_| anyhow!("Unsupported HTTP method: {}", method_name))?;

        let mut builder = policy.client.request(method, url.clone());
        if let Some(headers) = &request.headers {
            for (key, value) in headers {
                builder = builder.header(key, value);
            }
        }
        if let Some(body) = request.body.take() {
            builder = builder.body(body);
        }

        tracing::debug!(url = %url, "render module fetch");
        let response = builder.send().await.map_err(|e| anyhow!("Fetch failed: {}", e))?;
        let status = response.status();
        let final_url = response.url().clone();

        if status.is_redirection() {
            if let Some(location) = response.headers().get("location") {
                let location = location
                    .to_str()
                    .map_err(|_| anyhow!("Invalid redirect location"))?;
                let next = final_url
                    .join(location)
                    .map_err(|e| anyhow!("Invalid redirect URL: {}", e))?;

                // Redirects become body-less GETs.
                request = FetchRequest {
                    url: next.to_string(),
                    method: Some("GET".to_string()),
                    headers: request.headers,
                    body: None,
                };
                continue;
            }
        }

        let headers = response
            .headers()
            .iter()
            .filter_map(|(key, value)| Some((key.to_string(), value.to_str().ok()?.to_string())))
            .collect();
        let body = response
            .text()
            .await
            .map_err(|e| anyhow!("Failed to read response body: {}", e))?;

        return Ok(FetchResponse {
            ok: status.is_success(),
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or("Unknown").to_string(),
            headers,
            url: final_url.to_string(),
            body,
        });
    }

    Err(anyhow!("Fetch failed: more than {} redirects", MAX_REDIRECTS))
}
