//! EmbeddingClient (spec.md §4.3): batches text into fixed-dimension vectors
//! via a pluggable provider capability, with retry/backoff and a
//! short-circuit when no credential is configured.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

pub const DEFAULT_BATCH_SIZE: usize = 32;
const MAX_RETRY_ATTEMPTS: u32 = 3;
const MIN_INTER_CALL_SPACING: Duration = Duration::from_millis(50);

/// The `EmbeddingProvider` capability from spec.md §6: `(model_id, api_key,
/// [text]) → [vector]` with a fixed `dims` per model. Object-safe so the
/// Coordinator can hold `Arc<dyn EmbeddingProvider>` and swap implementations
/// (HTTP-backed in production, a fixed-vector fake in tests).
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(
        &self,
        model_id: &str,
        api_key: Option<&str>,
        texts: &[String],
    ) -> EngineResult<Vec<Vec<f32>>>;

    fn dims_for_model(&self, model_id: &str) -> Option<usize>;
}

/// An HTTP-backed provider speaking a simple `{model, input: [..]} ->
/// {embeddings: [[..]]}` JSON contract, in the idiom the rest of the pack
/// uses for LLM/embedding HTTP clients (`reqwest` + `serde_json`).
pub struct HttpEmbeddingProvider {
    client: reqwest::Client,
    endpoint: String,
    known_dims: dashmap::DashMap<String, usize>,
}

impl HttpEmbeddingProvider {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            known_dims: dashmap::DashMap::new(),
        }
    }
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddingProvider {
    async fn embed(
        &self,
        model_id: &str,
        api_key: Option<&str>,
        texts: &[String],
    ) -> EngineResult<Vec<Vec<f32>>> {
        let mut request = self
            .client
            .post(&self.endpoint)
            .json(&EmbedRequest { model: model_id, input: texts });
        if let Some(key) = api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| EngineError::Internal(anyhow::anyhow!("embedding provider request failed: {e}")))?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED
            || response.status() == reqwest::StatusCode::NOT_FOUND
        {
            return Err(EngineError::EmbeddingUnavailable(format!(
                "provider returned {}",
                response.status()
            )));
        }
        if !response.status().is_success() {
            return Err(EngineError::Internal(anyhow::anyhow!(
                "embedding provider returned {}",
                response.status()
            )));
        }

        let parsed: EmbedResponse = response
            .json()
            .await
            .map_err(|e| EngineError::Internal(anyhow::anyhow!("malformed embedding response: {e}")))?;

        if let Some(first) = parsed.embeddings.first() {
            self.known_dims.insert(model_id.to_string(), first.len());
        }

        Ok(parsed.embeddings)
    }

    fn dims_for_model(&self, model_id: &str) -> Option<usize> {
        self.known_dims.get(model_id).map(|d| *d)
    }
}

/// Wraps an [`EmbeddingProvider`] with batching, the unavailable
/// short-circuit, and exponential-backoff retry on transient failures
/// (spec.md §4.3 Failure modes).
pub struct EmbeddingClient {
    provider: std::sync::Arc<dyn EmbeddingProvider>,
    batch_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EmbedOutcome {
    Vectors(Vec<Vec<f32>>),
    Unavailable(String),
}

impl EmbeddingClient {
    pub fn new(provider: std::sync::Arc<dyn EmbeddingProvider>) -> Self {
        Self {
            provider,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Embeds `texts` under `model_id`. Returns `Unavailable` without a
    /// network call when `api_key` is absent or `model_id` is empty — the
    /// indexing pipeline then proceeds lexically only (spec.md §4.3).
    pub async fn embed_batched(
        &self,
        model_id: &str,
        api_key: Option<&str>,
        texts: &[String],
    ) -> EngineResult<EmbedOutcome> {
        if model_id.is_empty() || api_key.is_none() {
            return Ok(EmbedOutcome::Unavailable(
                "no api_key or model_identifier configured".to_string(),
            ));
        }
        if texts.is_empty() {
            return Ok(EmbedOutcome::Vectors(Vec::new()));
        }

        let mut all = Vec::with_capacity(texts.len());
        for (i, batch) in texts.chunks(self.batch_size).enumerate() {
            if i > 0 {
                tokio::time::sleep(MIN_INTER_CALL_SPACING).await;
            }
            match self.embed_with_retry(model_id, api_key, batch).await {
                Ok(vectors) => all.extend(vectors),
                Err(EngineError::EmbeddingUnavailable(reason)) => {
                    return Ok(EmbedOutcome::Unavailable(reason));
                }
                Err(e) => return Err(e),
            }
        }
        Ok(EmbedOutcome::Vectors(all))
    }

    async fn embed_with_retry(
        &self,
        model_id: &str,
        api_key: Option<&str>,
        batch: &[String],
    ) -> EngineResult<Vec<Vec<f32>>> {
        let mut attempt = 0;
        loop {
            match self.provider.embed(model_id, api_key, batch).await {
                Ok(v) => return Ok(v),
                Err(EngineError::EmbeddingUnavailable(reason)) => {
                    return Err(EngineError::EmbeddingUnavailable(reason));
                }
                Err(e) if attempt < MAX_RETRY_ATTEMPTS => {
                    attempt += 1;
                    let backoff = Duration::from_millis(200 * 2u64.pow(attempt));
                    tracing::warn!(
                        "embedding call failed (attempt {}/{}): {} — retrying in {:?}",
                        attempt,
                        MAX_RETRY_ATTEMPTS,
                        e,
                        backoff
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct FakeProvider {
        dims: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EmbeddingProvider for FakeProvider {
        async fn embed(
            &self,
            _model_id: &str,
            _api_key: Option<&str>,
            texts: &[String],
        ) -> EngineResult<Vec<Vec<f32>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(texts.iter().map(|_| vec![0.1; self.dims]).collect())
        }

        fn dims_for_model(&self, _model_id: &str) -> Option<usize> {
            Some(self.dims)
        }
    }

    #[tokio::test]
    async fn short_circuits_without_api_key() {
        let client = EmbeddingClient::new(Arc::new(FakeProvider {
            dims: 4,
            calls: AtomicUsize::new(0),
        }));
        let outcome = client
            .embed_batched("model", None, &["hello".to_string()])
            .await
            .unwrap();
        assert!(matches!(outcome, EmbedOutcome::Unavailable(_)));
    }

    #[tokio::test]
    async fn batches_across_multiple_calls() {
        let provider = Arc::new(FakeProvider {
            dims: 4,
            calls: AtomicUsize::new(0),
        });
        let client = EmbeddingClient::new(provider.clone()).with_batch_size(2);
        let texts: Vec<String> = (0..5).map(|i| format!("text-{i}")).collect();
        let outcome = client.embed_batched("model", Some("key"), &texts).await.unwrap();
        match outcome {
            EmbedOutcome::Vectors(v) => assert_eq!(v.len(), 5),
            _ => panic!("expected vectors"),
        }
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    }
}
