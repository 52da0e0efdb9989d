//! Ships metric batches to `POST /updates/`.

use std::{io::Write, sync::Arc, time::Duration};

use {
    flate2::{Compression, write::GzEncoder},
    reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE},
    tracing::debug,
};

use {
    tally_common::{HASH_HEADER, SigningKey},
    tally_config::AgentConfig,
    tally_storage::{
        Metric,
        retry::{ErrorClass, RetryError, RetryPolicy, Sleep, TokioSleep, retry},
    },
};

use crate::{Error, Result};

fn gzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

/// Connection failures and non-2xx answers are worth another try; a batch
/// that cannot be encoded is not.
fn classify(error: &Error) -> ErrorClass {
    match error {
        Error::Request(_) | Error::Status { .. } => ErrorClass::Transient,
        Error::Encode(_) | Error::Compress(_) | Error::Exhausted { .. } => ErrorClass::Terminal,
    }
}

/// HTTP client for the batch endpoint.
pub struct Sender {
    client: reqwest::Client,
    url: String,
    key: Option<SigningKey>,
    policy: RetryPolicy,
    sleeper: Arc<dyn Sleep>,
}

impl Sender {
    pub fn new(config: &AgentConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            url: format!("{}/updates/", config.base_url()),
            key: SigningKey::from_optional(config.key.as_ref()),
            policy: RetryPolicy::from(&config.retry),
            sleeper: Arc::new(TokioSleep),
        })
    }

    #[must_use]
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleep>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Send one batch as signed, gzip-compressed JSON, retrying per policy.
    pub async fn send(&self, metrics: &[Metric]) -> Result<()> {
        let json = serde_json::to_vec(metrics)?;
        let signature = self.key.as_ref().map(|key| key.sign(&json));
        let body = gzip(&json)?;

        retry(&self.policy, self.sleeper.as_ref(), classify, || {
            self.post(body.clone(), signature.as_deref())
        })
        .await
        .map_err(|e| match e {
            RetryError::Exhausted { attempts, source } => Error::Exhausted {
                attempts,
                source: Box::new(source),
            },
            RetryError::Terminal(source) => source,
        })?;

        debug!(url = %self.url, count = metrics.len(), "metric batch delivered");
        Ok(())
    }

    async fn post(&self, body: Vec<u8>, signature: Option<&str>) -> Result<()> {
        let mut request = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, "application/json")
            .header(CONTENT_ENCODING, "gzip")
            .body(body);
        if let Some(signature) = signature {
            request = request.header(HASH_HEADER, signature);
        }

        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(Error::Status { status, body })
    }
}
