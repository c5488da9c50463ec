//! Schema-enforced reasoning pipeline for flowsheet.
//!
//! Two pipelines, both linear:
//!
//! ```text
//!  entity graph ──► producer ──► auditor ──► corrected table  (extraction)
//!  final table markdown ──► generator ──► process description (narrative)
//! ```
//!
//! Every stage calls an external reasoning service with a strict output
//! contract: the response must conform exactly to the stage's JSON schema or
//! the stage fails with a schema violation, never a silent partial result.
//! The pipeline itself imposes no retry or caching; retries belong to the
//! run orchestrator.

pub mod prompts;
pub mod providers;
pub mod stages;

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::info;

// ============================================================================
// Messages
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: &str) -> Self {
        Self {
            role: Role::System,
            content: content.to_string(),
        }
    }

    pub fn user(content: &str) -> Self {
        Self {
            role: Role::User,
            content: content.to_string(),
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("API error: {0}")]
    Api(String),
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },
    #[error("network error: {0}")]
    Network(String),
    /// The reasoning service returned a response that does not conform to
    /// the stage's output contract. Retryable, since non-conformance may be
    /// transient.
    #[error("schema violation: {0}")]
    SchemaViolation(String),
    #[error("no model configured for stage {0}")]
    UnconfiguredStage(String),
}

// ============================================================================
// Provider interface
// ============================================================================

/// A chat-completion backend constrained to structured output.
///
/// `response_schema` is the JSON Schema the response body must satisfy;
/// implementations pass it to the provider's structured-output mechanism and
/// return the raw JSON text of the response.
#[async_trait::async_trait]
pub trait ChatModel: Send + Sync {
    async fn complete(
        &self,
        messages: &[Message],
        response_schema: &Value,
    ) -> Result<String, LlmError>;

    fn model_name(&self) -> &str;
}

/// Typed wrapper over a [`ChatModel`]: one stage's structured completion.
///
/// `invoke` parses the raw response into `T` and fails loudly with
/// [`LlmError::SchemaViolation`] on any deviation.
pub struct StructuredAgent<T> {
    model: Arc<dyn ChatModel>,
    schema: Value,
    _response: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> StructuredAgent<T> {
    pub fn new(model: Arc<dyn ChatModel>, schema: Value) -> Self {
        Self {
            model,
            schema,
            _response: PhantomData,
        }
    }

    pub async fn invoke(&self, messages: &[Message]) -> Result<T, LlmError> {
        let raw = self.model.complete(messages, &self.schema).await?;
        serde_json::from_str(&raw).map_err(|e| {
            LlmError::SchemaViolation(format!(
                "response does not conform to the stage contract: {e}"
            ))
        })
    }
}

// ============================================================================
// Stage registry
// ============================================================================

/// The reasoning stages, each backed by one agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageName {
    Producer,
    Auditor,
    Generator,
}

impl StageName {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageName::Producer => "producer",
            StageName::Auditor => "auditor",
            StageName::Generator => "generator",
        }
    }
}

type ModelFactory = Box<dyn Fn(StageName) -> Result<Arc<dyn ChatModel>, LlmError> + Send + Sync>;

/// Process-wide registry of stage agents.
///
/// Constructing a provider client is expensive, so each stage's model is
/// built lazily exactly once and shared. The registry is explicit state
/// injected into the orchestrator, not an ambient global.
pub struct AgentRegistry {
    factory: ModelFactory,
    cache: RwLock<HashMap<StageName, Arc<dyn ChatModel>>>,
}

impl AgentRegistry {
    pub fn new(
        factory: impl Fn(StageName) -> Result<Arc<dyn ChatModel>, LlmError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            factory: Box::new(factory),
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Registry serving the same model for every stage (tests, mock runs).
    pub fn uniform(model: Arc<dyn ChatModel>) -> Self {
        Self::new(move |_| Ok(model.clone()))
    }

    pub fn model_for(&self, stage: StageName) -> Result<Arc<dyn ChatModel>, LlmError> {
        if let Some(model) = self.cache.read().get(&stage) {
            return Ok(model.clone());
        }
        let model = (self.factory)(stage)?;
        let mut cache = self.cache.write();
        let entry = cache.entry(stage).or_insert_with(|| model.clone());
        info!(stage = stage.as_str(), model = entry.model_name(), "constructed stage agent");
        Ok(entry.clone())
    }
}

// ============================================================================
// Tests
// ============================================================================
