//! MockProvider — deterministic LLM responses for testing
//!
//! A scripted sequence of responses, consumed in call order. Exhausting the
//! sequence yields the default response. Used by gate tests here and by the
//! engine's end-to-end scenario tests.

use crate::provider::{ChatRequest, LlmError, LlmProvider, LlmResult};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Debug)]
pub enum MockResponse {
    Text(String),
    Error(String),
}

impl MockResponse {
    pub fn text(s: impl Into<String>) -> Self {
        Self::Text(s.into())
    }
}

pub struct MockProvider {
    responses: Mutex<Vec<MockResponse>>,
    default_response: MockResponse,
    calls: Mutex<Vec<ChatRequest>>,
}

impl MockProvider {
    /// Always return the same response.
    pub fn constant(response: MockResponse) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(Vec::new()),
            default_response: response,
            calls: Mutex::new(Vec::new()),
        })
    }

    /// Return the scripted responses in order, then the default text.
    pub fn sequence(responses: Vec<MockResponse>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses),
            default_response: MockResponse::Text("(mock: sequence exhausted)".into()),
            calls: Mutex::new(Vec::new()),
        })
    }

    /// Always fail, for transport-fault paths.
    pub fn failing(message: impl Into<String>) -> Arc<Self> {
        Self::constant(MockResponse::Error(message.into()))
    }

    pub async fn call_count(&self) -> usize {
        self.calls.lock().await.len()
    }

    /// Prompts seen so far, for asserting on catalog summaries etc.
    pub async fn prompts(&self) -> Vec<String> {
        self.calls.lock().await.iter().map(|c| c.prompt.clone()).collect()
    }
}

#[async_trait::async_trait]
impl LlmProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn complete(
        &self,
        request: ChatRequest,
        cancel: Option<CancellationToken>,
    ) -> LlmResult<String> {
        if let Some(token) = &cancel {
            if token.is_cancelled() {
                return Err(LlmError::Cancelled);
            }
        }
        self.calls.lock().await.push(request);

        let mut responses = self.responses.lock().await;
        let next = if responses.is_empty() {
            self.default_response.clone()
        } else {
            responses.remove(0)
        };

        match next {
            MockResponse::Text(text) => Ok(text),
            MockResponse::Error(message) => Err(LlmError::RequestFailed(message)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::{LlmGate, SafetyVerdict};

    #[tokio::test]
    async fn sequence_is_consumed_in_order() {
        let provider = MockProvider::sequence(vec![
            MockResponse::text("first"),
            MockResponse::text("second"),
        ]);
        let req = ChatRequest::default();
        assert_eq!(provider.complete(req.clone(), None).await.unwrap(), "first");
        assert_eq!(provider.complete(req.clone(), None).await.unwrap(), "second");
        assert!(provider
            .complete(req, None)
            .await
            .unwrap()
            .contains("exhausted"));
    }

    #[tokio::test]
    async fn gate_retries_transport_faults() {
        let provider = MockProvider::sequence(vec![
            MockResponse::Error("connection reset".into()),
            MockResponse::text("SAFE - fine"),
        ]);
        let gate = LlmGate::new(provider.clone(), "mock-model");
        let verdict = gate.validate_source_safety("print('hi')", None).await.unwrap();
        assert_eq!(verdict, SafetyVerdict::Safe);
        assert_eq!(provider.call_count().await, 2);
    }

    #[tokio::test]
    async fn gate_gives_up_after_budget() {
        let provider = MockProvider::failing("down");
        let gate = LlmGate::new(provider.clone(), "mock-model");
        let err = gate.classify_task_type("anything", None).await.unwrap_err();
        assert!(matches!(err, LlmError::RequestFailed(_)));
        assert_eq!(provider.call_count().await, 3);
    }

    #[tokio::test]
    async fn unclear_safety_verdict() {
        let provider = MockProvider::constant(MockResponse::text("I am not sure about this one"));
        let gate = LlmGate::new(provider, "mock-model");
        let verdict = gate.validate_source_safety("code", None).await.unwrap();
        assert_eq!(verdict, SafetyVerdict::Unclear);
        assert!(!verdict.is_safe());
    }

    #[tokio::test]
    async fn empty_classification_defaults_to_general() {
        let provider = MockProvider::constant(MockResponse::text("   "));
        let gate = LlmGate::new(provider, "mock-model");
        assert_eq!(gate.classify_task_type("task", None).await.unwrap(), "general");
    }

    #[tokio::test]
    async fn classification_is_lowercased_single_word() {
        let provider = MockProvider::constant(MockResponse::text("Time\n"));
        let gate = LlmGate::new(provider, "mock-model");
        assert_eq!(gate.classify_task_type("task", None).await.unwrap(), "time");
    }

    #[tokio::test]
    async fn unparseable_plan_falls_back_to_code() {
        let provider = MockProvider::constant(MockResponse::text("I cannot plan this"));
        let gate = LlmGate::new(provider, "mock-model");
        let plan = gate
            .generate_plan("list files", "- terminal: run commands", None, None)
            .await
            .unwrap();
        assert_eq!(plan.steps.len(), 1);
        assert_eq!(plan.steps[0].tool, "code");
    }

    #[tokio::test]
    async fn plan_parses_fenced_json() {
        let provider = MockProvider::constant(MockResponse::text(
            "```json\n{\"description\": \"list\", \"steps\": [{\"tool\": \"terminal\", \"args\": {\"command\": \"ls\"}, \"reason\": \"listing\"}]}\n```",
        ));
        let gate = LlmGate::new(provider, "mock-model");
        let plan = gate
            .generate_plan("list files", "- terminal", None, None)
            .await
            .unwrap();
        assert_eq!(plan.steps[0].tool, "terminal");
        assert_eq!(plan.steps[0].args["command"], "ls");
    }

    #[tokio::test]
    async fn quality_score_parses_and_clamps() {
        let provider = MockProvider::sequence(vec![
            MockResponse::text("0.9"),
            MockResponse::text("7"),
        ]);
        let gate = LlmGate::new(provider, "mock-model");
        assert_eq!(gate.score_quality("a result", None).await.unwrap(), 0.9);
        assert_eq!(gate.score_quality("a result", None).await.unwrap(), 1.0);
    }
}
