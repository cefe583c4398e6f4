use crate::config::HealthSettings;
use crate::error::StewardError;
use reqwest::{redirect, Client, StatusCode};
use serde::Serialize;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ProbeResult {
    pub success: bool,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PollReport {
    pub success: bool,
    pub attempt: u32,
    pub result: ProbeResult,
}

pub struct HealthPoller {
    client: Client,
    attempts: u32,
    delay: Duration,
}

impl HealthPoller {
    pub fn new(settings: &HealthSettings) -> Result<Self, StewardError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_sec.max(1)))
            .redirect(redirect::Policy::none())
            .no_proxy()
            .build()?;
        Ok(Self {
            client,
            attempts: settings.attempts.max(1),
            delay: Duration::from_millis(settings.delay_ms),
        })
    }

    /// Single GET; every transport error is folded into an unhealthy result.
    pub async fn probe(&self, url: &str) -> ProbeResult {
        match self.client.get(url).send().await {
            Ok(response) => {
                let status = response.status();
                ProbeResult {
                    success: status == StatusCode::OK,
                    url: url.to_string(),
                    status: Some(status.as_u16()),
                    error: (status != StatusCode::OK).then(|| format!("unexpected status {status}")),
                }
            }
            Err(err) => ProbeResult {
                success: false,
                url: url.to_string(),
                status: err.status().map(|s| s.as_u16()),
                error: Some(err.to_string()),
            },
        }
    }

    pub async fn wait_until_healthy(&self, url: &str) -> PollReport {
        let mut last = None;
        for attempt in 1..=self.attempts {
            let result = self.probe(url).await;
            if result.success {
                info!(url, attempt, "service healthy");
                return PollReport {
                    success: true,
                    attempt,
                    result,
                };
            }
            debug!(url, attempt, error = result.error.as_deref().unwrap_or(""), "health probe failed");
            last = Some(result);
            if attempt < self.attempts {
                sleep(self.delay).await;
            }
        }
        warn!(url, attempts = self.attempts, "service never became healthy");
        PollReport {
            success: false,
            attempt: self.attempts,
            result: last.unwrap_or_else(|| ProbeResult {
                success: false,
                url: url.to_string(),
                status: None,
                error: Some("health check did not run".to_string()),
            }),
        }
    }
}
