//! Failover router: drive the retrying invoker across an ordered set of
//! providers until one answers.
//!
//! Candidate order for a task:
//! 1. the task's preferred provider (from the [`TaskRouter`])
//! 2. the global primary, then the global fallback order
//! 3. every other enabled provider by ascending priority
//!
//! Disabled and unknown identities are skipped and duplicates dropped.

use std::collections::HashSet;

use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::provider::{ProviderError, TextRequest};
use crate::registry::{RegisteredProvider, SharedProviderRegistry};
use crate::retry::RetryingInvoker;
use crate::router::{RouteDecision, SharedTaskRouter};

/// Every candidate failed for a task.
#[derive(Debug, Clone, Error)]
pub enum FailoverError {
    #[error(
        "all providers exhausted for task '{task_type}' (tried: {}){}",
        .tried.join(", "),
        .last_error.as_ref().map(|e| format!(": {e}")).unwrap_or_default()
    )]
    AllProvidersExhausted {
        task_type: String,
        tried: Vec<String>,
        last_error: Option<ProviderError>,
    },
}

/// Text produced by one provider.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderReply {
    pub text: String,
    pub provider: String,
    pub model: String,
    pub attempts: u32,
}

/// Result of a failover pass, without exceptions for control flow.
#[derive(Debug, Clone)]
pub enum FailoverOutcome {
    Success(ProviderReply),
    Exhausted {
        tried: Vec<String>,
        last_error: Option<ProviderError>,
    },
}

impl FailoverOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    pub fn into_result(self, task_type: &str) -> Result<ProviderReply, FailoverError> {
        match self {
            Self::Success(reply) => Ok(reply),
            Self::Exhausted { tried, last_error } => Err(FailoverError::AllProvidersExhausted {
                task_type: task_type.to_string(),
                tried,
                last_error,
            }),
        }
    }
}

/// A provider paired with the model it should be asked to use.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub provider: RegisteredProvider,
    pub model: String,
}

impl Candidate {
    pub fn id(&self) -> &str {
        self.provider.id()
    }

    /// Per-attempt timeout for this provider/model pair.
    pub fn timeout(&self) -> std::time::Duration {
        self.provider.config.call_timeout(&self.model)
    }
}

pub struct FailoverRouter {
    registry: SharedProviderRegistry,
    router: SharedTaskRouter,
    invoker: RetryingInvoker,
}

impl FailoverRouter {
    pub fn new(
        registry: SharedProviderRegistry,
        router: SharedTaskRouter,
        invoker: RetryingInvoker,
    ) -> Self {
        Self {
            registry,
            router,
            invoker,
        }
    }

    pub fn registry(&self) -> &SharedProviderRegistry {
        &self.registry
    }

    pub fn router(&self) -> &SharedTaskRouter {
        &self.router
    }

    /// Resolve the route for `task_type` and the ordered candidates for it.
    pub fn plan(&self, task_type: &str) -> (RouteDecision, Vec<Candidate>) {
        let route = self.router.resolve(task_type);
        let global = self.router.global();

        let declared = std::iter::once(route.provider.clone())
            .chain(std::iter::once(global.primary_provider.clone()))
            .chain(global.fallback_order.iter().cloned())
            .chain(self.registry.enabled_ids());

        let mut seen = HashSet::new();
        let mut candidates = Vec::new();
        for id in declared {
            if !seen.insert(id.clone()) {
                continue;
            }
            let Some(provider) = self.registry.enabled(&id) else {
                continue;
            };
            let model = if id == route.provider && !route.model.is_empty() {
                route.model.clone()
            } else {
                provider.config.model.clone()
            };
            candidates.push(Candidate { provider, model });
        }
        (route, candidates)
    }

    /// Identities in candidate order for `task_type`.
    pub fn candidate_ids(&self, task_type: &str) -> Vec<String> {
        self.plan(task_type)
            .1
            .iter()
            .map(|c| c.id().to_string())
            .collect()
    }

    /// Call candidates in order; first success wins.
    pub async fn call(
        &self,
        task_type: &str,
        request: &TextRequest,
    ) -> Result<ProviderReply, FailoverError> {
        self.try_call(task_type, request).await.into_result(task_type)
    }

    pub async fn try_call(&self, task_type: &str, request: &TextRequest) -> FailoverOutcome {
        let (route, candidates) = self.plan(task_type);
        self.call_candidates(&route, &candidates, request).await
    }

    /// Drive the invoker over `candidates`, stopping at the first success.
    pub async fn call_candidates(
        &self,
        route: &RouteDecision,
        candidates: &[Candidate],
        request: &TextRequest,
    ) -> FailoverOutcome {
        let invoker = self.attempt_budget();
        let mut tried = Vec::with_capacity(candidates.len());
        let mut last_error = None;

        for candidate in candidates {
            tried.push(candidate.id().to_string());
            match self.invoke(&invoker, candidate, route, request).await {
                Ok(reply) => {
                    if tried.len() > 1 {
                        info!(
                            task_type = %route.task_type,
                            provider = %reply.provider,
                            position = tried.len(),
                            "Failover succeeded"
                        );
                    }
                    return FailoverOutcome::Success(reply);
                }
                Err(err) => {
                    warn!(
                        task_type = %route.task_type,
                        provider = candidate.id(),
                        "Provider exhausted, advancing: {}",
                        err
                    );
                    last_error = Some(err);
                }
            }
        }

        warn!(task_type = %route.task_type, tried = ?tried, "All providers exhausted");
        FailoverOutcome::Exhausted { tried, last_error }
    }

    /// Call one specific provider (with retries) under the task's parameters.
    pub async fn call_provider(
        &self,
        provider_id: &str,
        task_type: &str,
        request: &TextRequest,
    ) -> Result<ProviderReply, ProviderError> {
        let route = self.router.resolve(task_type);
        let provider = self.registry.enabled(provider_id).ok_or_else(|| {
            ProviderError::Rejected {
                provider: provider_id.to_string(),
                status: 0,
                message: "provider is not registered or disabled".to_string(),
            }
        })?;
        let model = if provider_id == route.provider && !route.model.is_empty() {
            route.model.clone()
        } else {
            provider.config.model.clone()
        };
        self.call_candidate(&route, &Candidate { provider, model }, request)
            .await
    }

    /// Call a single planned candidate with the configured retry budget.
    pub async fn call_candidate(
        &self,
        route: &RouteDecision,
        candidate: &Candidate,
        request: &TextRequest,
    ) -> Result<ProviderReply, ProviderError> {
        let invoker = self.attempt_budget();
        self.invoke(&invoker, candidate, route, request).await
    }

    /// The retry policy and the routing record each cap attempts; the
    /// smaller limit wins.
    fn attempt_budget(&self) -> RetryingInvoker {
        let from_policy = self.invoker.policy().max_attempts;
        let from_routing = self.router.global().max_retries;
        self.invoker.with_max_attempts(from_policy.min(from_routing).max(1))
    }

    async fn invoke(
        &self,
        invoker: &RetryingInvoker,
        candidate: &Candidate,
        route: &RouteDecision,
        request: &TextRequest,
    ) -> Result<ProviderReply, ProviderError> {
        let generation = request.for_model(&candidate.model, &route.params, candidate.timeout());
        let (result, state) = invoker.invoke_traced(&candidate.provider, &generation).await;
        result.map(|text| ProviderReply {
            text,
            provider: candidate.id().to_string(),
            model: candidate.model.clone(),
            attempts: state.attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{MockTextGenerationProvider, WireProtocol};
    use crate::registry::ProviderConfig;
    use crate::router::{GlobalRouting, RoutingConfig, TaskAssignment, TaskRouter};
    use crate::retry::RetryPolicy;
    use crate::testing::{registry_with, ScriptedProvider};
    use std::sync::Arc;

    fn routing(primary: &str, fallback: &[&str], max_retries: u32) -> RoutingConfig {
        RoutingConfig {
            global: GlobalRouting {
                primary_provider: primary.to_string(),
                fallback_order: fallback.iter().map(|s| s.to_string()).collect(),
                max_retries,
                ..GlobalRouting::default()
            },
            task_overrides: Default::default(),
        }
    }

    fn failover(
        registry: crate::registry::ProviderRegistry,
        config: RoutingConfig,
    ) -> FailoverRouter {
        let registry = registry.shared();
        let router = TaskRouter::with_config(config, registry.clone()).shared();
        FailoverRouter::new(registry, router, RetryingInvoker::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_success_stops_the_walk() {
        let a = ScriptedProvider::sequence(
            "a",
            vec![Err(ProviderError::from_status("a", 401, "", None))],
        );
        let b = ScriptedProvider::always("b", "from b");
        let registry = registry_with(&[("a", 0, a.clone()), ("b", 1, b.clone())]);

        let mut untouched = MockTextGenerationProvider::new();
        untouched.expect_generate().times(0);
        registry
            .register_with(
                ProviderConfig::new("c", WireProtocol::OpenAi, "c-model", "http://fake")
                    .with_api_key("k")
                    .with_priority(2),
                Arc::new(untouched),
            )
            .unwrap();

        let router = failover(registry, routing("a", &["b", "c"], 3));
        let reply = router.call("x", &TextRequest::prompt("q")).await.unwrap();

        assert_eq!(reply.text, "from b");
        assert_eq!(reply.provider, "b");
        assert_eq!(a.calls(), 1);
        assert_eq!(b.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhaust_before_advancing() {
        let a = ScriptedProvider::failing("a", "503 unavailable");
        let b = ScriptedProvider::always("b", "ok");
        let registry = registry_with(&[("a", 0, a.clone()), ("b", 1, b.clone())]);
        let router = failover(registry, routing("a", &["b"], 2));

        let reply = router.call("x", &TextRequest::prompt("q")).await.unwrap();
        assert_eq!(reply.provider, "b");
        assert_eq!(a.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_policy_limit_caps_routing_retries() {
        let a = ScriptedProvider::failing("a", "503 unavailable");
        let registry = registry_with(&[("a", 0, a.clone())]).shared();
        let router = TaskRouter::with_config(routing("a", &[], 3), registry.clone()).shared();
        let failover = FailoverRouter::new(
            registry,
            router,
            RetryingInvoker::new(RetryPolicy::default().with_max_attempts(1)),
        );

        let outcome = failover.try_call("x", &TextRequest::prompt("q")).await;
        assert!(!outcome.is_success());
        assert_eq!(a.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_routing_retries_cap_a_larger_policy() {
        let a = ScriptedProvider::failing("a", "503 unavailable");
        let registry = registry_with(&[("a", 0, a.clone())]).shared();
        let router = TaskRouter::with_config(routing("a", &[], 2), registry.clone()).shared();
        let failover = FailoverRouter::new(
            registry,
            router,
            RetryingInvoker::new(RetryPolicy::default().with_max_attempts(5)),
        );

        let err = failover
            .call_provider("a", "x", &TextRequest::prompt("q"))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(a.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_fail_reports_last_error() {
        let a = ScriptedProvider::failing("a", "invalid request");
        let b = ScriptedProvider::failing("b", "forbidden model");
        let registry = registry_with(&[("a", 0, a), ("b", 1, b)]);
        let router = failover(registry, routing("a", &["b"], 1));

        let err = router.call("x", &TextRequest::prompt("q")).await.unwrap_err();
        let FailoverError::AllProvidersExhausted {
            tried, last_error, ..
        } = err;
        assert_eq!(tried, vec!["a", "b"]);
        assert_eq!(last_error.unwrap().provider(), "b");
    }

    #[tokio::test]
    async fn test_no_candidates_is_exhausted_without_error() {
        let router = failover(registry_with(&[]), routing("a", &[], 1));
        let outcome = router.try_call("x", &TextRequest::prompt("q")).await;
        assert!(matches!(
            outcome,
            FailoverOutcome::Exhausted { ref tried, last_error: None } if tried.is_empty()
        ));
    }

    #[test]
    fn test_candidate_order_preferred_then_declared_then_priority() {
        let registry = registry_with(&[
            ("a", 0, ScriptedProvider::always("a", "")),
            ("b", 5, ScriptedProvider::always("b", "")),
            ("c", 1, ScriptedProvider::always("c", "")),
            ("d", 2, ScriptedProvider::always("d", "")),
        ]);
        let mut config = routing("b", &["ghost", "d", "b"], 1);
        config
            .task_overrides
            .insert("x".to_string(), TaskAssignment::provider("c"));
        let router = failover(registry, config);

        assert_eq!(router.candidate_ids("x"), vec!["c", "b", "d", "a"]);
        assert_eq!(router.candidate_ids("other"), vec!["b", "d", "a", "c"]);
    }

    #[tokio::test]
    async fn test_preferred_candidate_uses_route_model() {
        let a = ScriptedProvider::failing("a", "bad request");
        let b = ScriptedProvider::always("b", "ok");
        let registry = registry_with(&[("a", 0, a.clone()), ("b", 1, b.clone())]);
        let mut config = routing("a", &["b"], 1);
        config.task_overrides.insert(
            "x".to_string(),
            TaskAssignment::provider("a").model("special"),
        );
        let router = failover(registry, config);

        let reply = router.call("x", &TextRequest::prompt("q")).await.unwrap();
        assert_eq!(a.seen_models(), vec!["special"]);
        assert_eq!(b.seen_models(), vec!["b-model"]);
        assert_eq!(reply.model, "b-model");
    }

    #[tokio::test]
    async fn test_call_provider_rejects_unknown() {
        let router = failover(registry_with(&[]), routing("a", &[], 1));
        let err = router
            .call_provider("zzz", "x", &TextRequest::prompt("q"))
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
    }
}
