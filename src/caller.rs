//! Remote-call management: caching, retries, poisoning.
//!
//! Every call is first looked up in the response cache by fingerprint.
//! Misses go to the endpoint under a retry policy: transient errors retry on
//! a fixed interval, rate limits and timeouts retry within a wall-clock
//! window, and a definitive failure during tuning is recorded as a poisoned
//! cache entry so later trials do not spend budget re-attempting it. A
//! serving caller (`eval_only`) ignores stale poison and keeps retrying.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, warn};

use crate::cache::{CacheValue, CallCache};
use crate::endpoint::{CompletionEndpoint, EndpointError, Flavor, ResponseRecord};
use crate::error::{Result, TuneError};
use crate::key::fingerprint;
use crate::JsonMap;

/// Retry behaviour of the caller.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Interval between retries.
    pub retry_time: Duration,
    /// Wall-clock window for rate-limit/timeout retries.
    pub retry_timeout: Duration,
    /// Cap on transient-error retries. `None` retries indefinitely.
    pub max_transient_retries: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retry_time: Duration::from_secs(10),
            retry_timeout: Duration::from_secs(60),
            max_transient_retries: None,
        }
    }
}

/// Outcome of a managed remote call.
#[derive(Debug, Clone, PartialEq)]
pub enum CallOutcome {
    Response(ResponseRecord),
    /// The call failed definitively within this or an earlier run.
    Poisoned,
}

/// Cached, retrying front-end to a completion endpoint.
pub struct RemoteCaller {
    endpoint: Arc<dyn CompletionEndpoint>,
    retry: RetryPolicy,
    chat_models: Arc<HashSet<String>>,
}

impl RemoteCaller {
    pub fn new(
        endpoint: Arc<dyn CompletionEndpoint>,
        retry: RetryPolicy,
        chat_models: Arc<HashSet<String>>,
    ) -> Self {
        Self { endpoint, retry, chat_models }
    }

    /// Whether `model` uses the chat request shape.
    pub fn is_chat(&self, model: &str) -> bool {
        self.chat_models.contains(model)
    }

    /// Request flavour for `model`.
    pub fn flavor(&self, model: &str) -> Flavor {
        if self.is_chat(model) { Flavor::Chat } else { Flavor::Plain }
    }

    /// Resolve one request, consulting the cache first.
    ///
    /// `eval_only` marks serving-style calls: they may return past a
    /// poisoned entry and never give up on rate limits.
    pub async fn get_response(
        &self,
        cache: &mut CallCache,
        params: &JsonMap,
        eval_only: bool,
    ) -> Result<CallOutcome> {
        let key = fingerprint(params);
        match cache.get(&key)? {
            Some(CacheValue::Response(record)) => {
                debug!(key = %key, "cache hit");
                return Ok(CallOutcome::Response(record));
            }
            Some(CacheValue::Poisoned) if !eval_only => return Ok(CallOutcome::Poisoned),
            Some(CacheValue::Poisoned) | None => {}
        }

        let model = params.get("model").and_then(Value::as_str).unwrap_or_default();
        let flavor = self.flavor(model);
        let started = Instant::now();
        let mut request = params.clone();
        let mut transient_retries = 0u32;
        loop {
            match self.endpoint.complete(&request, flavor).await {
                Ok(record) => {
                    cache.set(&key, &CacheValue::Response(record.clone()))?;
                    return Ok(CallOutcome::Response(record));
                }
                Err(err) if err.is_transient() => {
                    if let Some(max) = self.retry.max_transient_retries {
                        transient_retries += 1;
                        if transient_retries > max {
                            return Err(TuneError::Endpoint(err));
                        }
                    }
                    warn!(error = %err, "retrying in {}s", self.retry.retry_time.as_secs());
                    tokio::time::sleep(self.retry.retry_time).await;
                }
                Err(err) if err.is_throttle() => {
                    if started.elapsed() + self.retry.retry_time < self.retry.retry_timeout {
                        debug!(error = %err, "retrying in {}s", self.retry.retry_time.as_secs());
                    } else if !eval_only {
                        break;
                    }
                    tokio::time::sleep(self.retry.retry_time).await;
                }
                Err(EndpointError::InvalidRequest(message)) => {
                    // some deployments address the model by "engine"
                    if self.endpoint.requires_engine_param() && request.contains_key("model") {
                        let model = request.remove("model").unwrap_or(Value::Null);
                        request.insert("engine".to_string(), model);
                    } else {
                        return Err(TuneError::Endpoint(EndpointError::InvalidRequest(message)));
                    }
                }
                Err(err) => return Err(TuneError::Endpoint(err)),
            }
        }
        warn!(
            "no response after rate limit or timeout for {}s, poisoning entry",
            self.retry.retry_timeout.as_secs()
        );
        cache.set(&key, &CacheValue::Poisoned)?;
        Ok(CallOutcome::Poisoned)
    }
}

impl std::fmt::Debug for RemoteCaller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteCaller").field("retry", &self.retry).finish()
    }
}
