//! Scriptable endpoint for tests.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use super::{Choice, CompletionEndpoint, EndpointError, Flavor, ResponseRecord, Usage};
use crate::JsonMap;

type Handler = Box<dyn Fn(&JsonMap, Flavor) -> Result<ResponseRecord, EndpointError> + Send + Sync>;

/// A completion endpoint whose replies are scripted or computed from the
/// request. Every call is recorded for assertions.
pub struct MockEndpoint {
    handler: Option<Handler>,
    script: Mutex<VecDeque<Result<ResponseRecord, EndpointError>>>,
    calls: Mutex<Vec<(JsonMap, Flavor)>>,
    engine_param: bool,
}

impl MockEndpoint {
    /// Replies computed by `handler` from each request.
    pub fn new(
        handler: impl Fn(&JsonMap, Flavor) -> Result<ResponseRecord, EndpointError>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        Self {
            handler: Some(Box::new(handler)),
            script: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
            engine_param: false,
        }
    }

    /// Replies played back in order; exhausting the script is an error.
    pub fn scripted(replies: Vec<Result<ResponseRecord, EndpointError>>) -> Self {
        Self {
            handler: None,
            script: Mutex::new(replies.into()),
            calls: Mutex::new(Vec::new()),
            engine_param: false,
        }
    }

    /// Every call succeeds with a clone of `record`.
    pub fn fixed(record: ResponseRecord) -> Self {
        Self::new(move |_, _| Ok(record.clone()))
    }

    /// Replies sized from the request: the requested `n` (or `best_of`)
    /// choices, each costing `tokens_per_completion` output tokens.
    pub fn per_completion(prompt_tokens: u64, tokens_per_completion: u64) -> Self {
        Self::new(move |params, flavor| {
            let n = params
                .get("n")
                .or_else(|| params.get("best_of"))
                .and_then(Value::as_u64)
                .unwrap_or(1);
            let choices = (0..n)
                .map(|i| match flavor {
                    Flavor::Plain => Choice::text(format!("completion {i}")),
                    Flavor::Chat => Choice::chat(format!("completion {i}")),
                })
                .collect();
            Ok(ResponseRecord::new(
                choices,
                Usage {
                    prompt_tokens,
                    completion_tokens: tokens_per_completion * n,
                },
            ))
        })
    }

    /// Mark this endpoint as an `engine`-parameter deployment.
    pub fn with_engine_param(mut self) -> Self {
        self.engine_param = true;
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Recorded request bodies, in call order.
    pub fn calls(&self) -> Vec<(JsonMap, Flavor)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl CompletionEndpoint for MockEndpoint {
    async fn complete(
        &self,
        params: &JsonMap,
        flavor: Flavor,
    ) -> Result<ResponseRecord, EndpointError> {
        self.calls.lock().unwrap().push((params.clone(), flavor));
        if let Some(handler) = &self.handler {
            return handler(params, flavor);
        }
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(EndpointError::InvalidResponse("mock script exhausted".into())))
    }

    fn requires_engine_param(&self) -> bool {
        self.engine_param
    }
}

impl std::fmt::Debug for MockEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockEndpoint")
            .field("calls", &self.call_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(n: u64) -> JsonMap {
        let mut map = JsonMap::new();
        map.insert("model".to_string(), json!("text-ada-001"));
        map.insert("n".to_string(), json!(n));
        map
    }

    #[tokio::test]
    async fn test_per_completion_sizing() {
        let mock = MockEndpoint::per_completion(5, 10);
        let record = mock.complete(&params(3), Flavor::Plain).await.unwrap();
        assert_eq!(record.choices.len(), 3);
        assert_eq!(record.usage.prompt_tokens, 5);
        assert_eq!(record.usage.completion_tokens, 30);
    }

    #[tokio::test]
    async fn test_per_completion_chat_shape() {
        let mock = MockEndpoint::per_completion(5, 10);
        let record = mock.complete(&params(1), Flavor::Chat).await.unwrap();
        assert!(record.choices[0].message.is_some());
        assert!(record.choices[0].text.is_none());
    }

    #[tokio::test]
    async fn test_scripted_replies_in_order() {
        let mock = MockEndpoint::scripted(vec![
            Err(EndpointError::RateLimited("slow down".into())),
            Ok(ResponseRecord::new(vec![Choice::text("ok")], Usage::default())),
        ]);
        assert!(mock.complete(&params(1), Flavor::Plain).await.is_err());
        assert!(mock.complete(&params(1), Flavor::Plain).await.is_ok());
        // script exhausted
        assert!(mock.complete(&params(1), Flavor::Plain).await.is_err());
    }

    #[tokio::test]
    async fn test_records_calls() {
        let mock = MockEndpoint::per_completion(1, 1);
        mock.complete(&params(1), Flavor::Plain).await.unwrap();
        mock.complete(&params(2), Flavor::Chat).await.unwrap();
        let calls = mock.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].0.get("n"), Some(&json!(2)));
        assert_eq!(calls[1].1, Flavor::Chat);
    }
}
