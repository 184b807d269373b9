//! HTTP delivery to the dashboard hub.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use std::time::Duration;

use super::{Event, EventSink};

/// POSTs each event as JSON to `<url>/events`.
pub struct HttpSink {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpSink {
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            endpoint: format!("{}/events", url.trim_end_matches('/')),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl EventSink for HttpSink {
    async fn deliver(&self, event: &Event) -> Result<()> {
        let resp = self
            .client
            .post(&self.endpoint)
            .json(event)
            .send()
            .await
            .with_context(|| format!("Failed to reach {}", self.endpoint))?;
        if !resp.status().is_success() {
            bail!("Hub returned {} for {:?} event", resp.status(), event.kind);
        }
        Ok(())
    }
}
