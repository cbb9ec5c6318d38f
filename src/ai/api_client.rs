//! HTTP client for the out-of-core external model-call subsystem (§6):
//! `enhanceQuery`, `summarizeResults`, `searchWithLLM`, `callLLM`, and the
//! query-embedding call `search`'s Shape C path makes through
//! [`crate::engine::search::QueryEmbedder`] when a host enables embedding.
//!
//! None of this is exercised by the engine's own tests: the crate builds
//! and the hybrid search executor runs with no LLM configured at all. A
//! host opts in by constructing an `LlmClient` and passing it to
//! `Engine::search`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::engine::error::EngineError;
use crate::engine::search::QueryEmbedder;
use crate::Result;

/// Bounded retry count for transient failures (timeouts, 5xx, connection
/// resets). Not applied to 4xx responses, which are request bugs, not
/// transient conditions a retry would fix.
const MAX_RETRIES: u32 = 2;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(200);

#[derive(Debug, Clone)]
pub struct LlmClientConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub chat_model: String,
    pub embedding_model: String,
    pub request_timeout: Duration,
}

impl Default for LlmClientConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_key: None,
            chat_model: "gpt-4o-mini".to_string(),
            embedding_model: "text-embedding-3-small".to_string(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: String,
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
}

pub struct LlmClient {
    http: reqwest::Client,
    config: LlmClientConfig,
}

impl LlmClient {
    pub fn new(config: LlmClientConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self { http, config })
    }

    fn chat_endpoint(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }

    fn embeddings_endpoint(&self) -> String {
        format!("{}/embeddings", self.config.base_url.trim_end_matches('/'))
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    /// Retries a request up to [`MAX_RETRIES`] times on a timeout, a
    /// connection error, or a 5xx response, with a short linear backoff.
    /// A 4xx response is a request bug, not a transient condition, and is
    /// returned on the first attempt without retrying.
    async fn send_with_retry(&self, builder: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let mut attempt = 0;
        loop {
            let request = builder
                .try_clone()
                .ok_or("request body is not cloneable for retry")?;
            match request.send().await {
                Ok(response) if response.status().is_server_error() && attempt < MAX_RETRIES => {
                    attempt += 1;
                    tokio::time::sleep(RETRY_BASE_DELAY * attempt).await;
                }
                Ok(response) => return Ok(response.error_for_status()?),
                Err(e) if attempt < MAX_RETRIES && (e.is_timeout() || e.is_connect()) => {
                    attempt += 1;
                    tokio::time::sleep(RETRY_BASE_DELAY * attempt).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// `callLLM(prompt)` — the generic chat completion used by the other
    /// three named methods.
    pub async fn call_llm(&self, prompt: &str) -> Result<String> {
        let body = ChatRequest {
            model: &self.config.chat_model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
        };
        let request = self.authorized(self.http.post(self.chat_endpoint()).json(&body));
        let response: ChatResponse = self.send_with_retry(request).await?.json().await?;
        Ok(response
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .unwrap_or_default())
    }

    /// `enhanceQuery(query)` — rewrite a terse user query into a fuller
    /// retrieval query before it reaches `search`.
    pub async fn enhance_query(&self, query: &str) -> Result<String> {
        self.call_llm(&format!(
            "Rewrite this search query to be more specific and complete, \
             returning only the rewritten query: {query}"
        ))
        .await
    }

    /// `summarizeResults(results)` — condense a batch of search result
    /// content strings into a short synthesis.
    pub async fn summarize_results(&self, results: &[String]) -> Result<String> {
        let joined = results.join("\n---\n");
        self.call_llm(&format!(
            "Summarize the following search results in a few sentences:\n{joined}"
        ))
        .await
    }

    /// `searchWithLLM(query)` — enhance the query, run it, and summarize;
    /// `run_search` is supplied by the caller since only the dispatcher
    /// knows how to reach the locked `Engine`.
    pub async fn search_with_llm<F, Fut>(&self, query: &str, run_search: F) -> Result<String>
    where
        F: FnOnce(String) -> Fut,
        Fut: std::future::Future<Output = Result<Vec<String>>>,
    {
        let enhanced = self.enhance_query(query).await?;
        let results = run_search(enhanced).await?;
        self.summarize_results(&results).await
    }

    async fn embed_text(&self, text: &str) -> Result<Vec<f32>> {
        let body = EmbeddingRequest {
            model: &self.config.embedding_model,
            input: text,
        };
        let request = self.authorized(self.http.post(self.embeddings_endpoint()).json(&body));
        let response: EmbeddingResponse = self.send_with_retry(request).await?.json().await?;
        Ok(response
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .unwrap_or_default())
    }
}

/// Bridges the async `LlmClient` to the synchronous [`QueryEmbedder`] seam
/// Shape C's search path calls into. `Engine::search` is itself
/// synchronous (§4.1), so embedding here blocks on a short-lived runtime
/// rather than widening `Engine`'s API with async.
impl QueryEmbedder for LlmClient {
    fn embed(&self, text: &str) -> std::result::Result<Vec<f32>, EngineError> {
        tokio::task::block_in_place(|| {
            tokio::runtime::Handle::current()
                .block_on(self.embed_text(text))
                .map_err(|e| EngineError::Internal(e.to_string()))
        })
    }
}
