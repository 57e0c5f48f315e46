//! Public address discovery for NAT 1:1 candidates

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use reqwest::Client;
use serde::Deserialize;

const LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Response of an ip-api.com style lookup service
#[derive(Debug, Deserialize)]
struct LookupResponse {
    query: Option<String>,
}

/// Ask `lookup_url` for this host's public IP
pub async fn lookup_public_ip(lookup_url: &str) -> Result<String> {
    let client = Client::builder()
        .connect_timeout(LOOKUP_TIMEOUT)
        .timeout(LOOKUP_TIMEOUT)
        .build()
        .context("Failed to build HTTP client")?;

    let body = client
        .get(lookup_url)
        .send()
        .await
        .and_then(reqwest::Response::error_for_status)
        .with_context(|| format!("Public IP lookup against {lookup_url} failed"))?
        .text()
        .await?;

    parse_lookup_response(&body)
}

fn parse_lookup_response(body: &str) -> Result<String> {
    let response: LookupResponse =
        serde_json::from_str(body).context("Public IP lookup returned invalid JSON")?;

    response
        .query
        .map(|ip| ip.trim().to_string())
        .filter(|ip| !ip.is_empty())
        .ok_or_else(|| anyhow!("Public IP lookup response has no query field"))
}
