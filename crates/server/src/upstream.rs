use std::time::Duration;

use meter_core::UsageReport;
use tracing::error;

use crate::error::PassError;

const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Adapter around the proxy's management endpoint; its only job is to turn
/// an HTTP exchange into a `UsageReport` or a typed error.
pub struct UpstreamClient {
    client: reqwest::Client,
    usage_url: String,
    management_key: Option<String>,
}

impl UpstreamClient {
    pub fn new(base_url: &str, management_key: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(FETCH_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            client,
            usage_url: format!("{}/v0/management/usage", base_url.trim_end_matches('/')),
            management_key,
        }
    }

    /// One fetch per tick; a failure is reported and retried next tick,
    /// never inside the same pass.
    pub async fn fetch_usage(&self) -> Result<UsageReport, PassError> {
        let mut request = self.client.get(&self.usage_url);
        if let Some(key) = &self.management_key {
            request = request.bearer_auth(key);
        }
        let response = request
            .send()
            .await
            .map_err(|err| PassError::TransientUpstream(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(PassError::TransientUpstream(format!(
                "{} returned {}",
                self.usage_url, status
            )));
        }
        let body = response
            .text()
            .await
            .map_err(|err| PassError::TransientUpstream(err.to_string()))?;
        serde_json::from_str(&body).map_err(|err| {
            error!(payload = body.as_str(), "upstream usage body did not parse");
            PassError::Parse(err.to_string())
        })
    }
}
