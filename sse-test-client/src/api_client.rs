use anyhow::{Context, Result};
use reqwest::Client;
use serde_json::{json, Value};

pub struct ApiClient {
    client: Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(client: Client, base_url: String) -> Self {
        Self { client, base_url }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn health(&self) -> Result<()> {
        let url = format!("{}/health", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .context("Failed to reach health endpoint")?;

        if !response.status().is_success() {
            anyhow::bail!("Health check failed: {}", response.status());
        }
        Ok(())
    }

    pub async fn broadcast(&self, event: &str, data: Value, id: Option<&str>) -> Result<()> {
        let url = format!("{}/events", self.base_url);
        self.post_event(&url, event, data, id).await
    }

    pub async fn publish_to(
        &self,
        client_id: &str,
        event: &str,
        data: Value,
        id: Option<&str>,
    ) -> Result<()> {
        let url = format!("{}/events/{}", self.base_url, client_id);
        self.post_event(&url, event, data, id).await
    }

    pub async fn connection_count(&self) -> Result<u64> {
        let url = format!("{}/connections/count", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .context("Failed to get connection count")?;

        if !response.status().is_success() {
            anyhow::bail!("Failed to get connection count: {}", response.status());
        }

        let body: Value = response.json().await?;
        body["data"]["count"]
            .as_u64()
            .context("No count in response")
    }

    async fn post_event(&self, url: &str, event: &str, data: Value, id: Option<&str>) -> Result<()> {
        let mut body = json!({ "event": event, "data": data });
        if let Some(id) = id {
            body["id"] = json!(id);
        }

        let response = self
            .client
            .post(url)
            .json(&body)
            .send()
            .await
            .context("Failed to publish event")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read response body".to_string());
            anyhow::bail!("Failed to publish event: {} - Response: {}", status, body);
        }
        Ok(())
    }
}
