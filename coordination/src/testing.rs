//! Scripted fakes shared by unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::provider::{
    GenerationRequest, ProviderError, TextGenerationProvider, WireProtocol,
};
use crate::registry::{ProviderConfig, ProviderRegistry};

/// Provider that replays a fixed script of outcomes; the last step repeats.
pub(crate) struct ScriptedProvider {
    id: String,
    script: Mutex<VecDeque<Result<String, ProviderError>>>,
    last: Mutex<Option<Result<String, ProviderError>>>,
    delay: Option<Duration>,
    calls: AtomicUsize,
    seen_models: Mutex<Vec<String>>,
}

impl ScriptedProvider {
    pub(crate) fn sequence(id: &str, steps: Vec<Result<String, ProviderError>>) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            script: Mutex::new(steps.into()),
            last: Mutex::new(None),
            delay: None,
            calls: AtomicUsize::new(0),
            seen_models: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn always(id: &str, text: &str) -> Arc<Self> {
        Self::sequence(id, vec![Ok(text.to_string())])
    }

    pub(crate) fn failing(id: &str, message: &str) -> Arc<Self> {
        Self::sequence(id, vec![Err(ProviderError::from_message(id, message))])
    }

    /// Replies with `text` after sleeping `delay`.
    pub(crate) fn slow(id: &str, text: &str, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            script: Mutex::new(vec![Ok(text.to_string())].into()),
            last: Mutex::new(None),
            delay: Some(delay),
            calls: AtomicUsize::new(0),
            seen_models: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn seen_models(&self) -> Vec<String> {
        self.seen_models.lock().unwrap().clone()
    }

    fn next_step(&self) -> Result<String, ProviderError> {
        let mut script = self.script.lock().unwrap();
        let mut last = self.last.lock().unwrap();
        match script.pop_front() {
            Some(step) => {
                *last = Some(step.clone());
                step
            }
            None => last
                .clone()
                .unwrap_or_else(|| Err(ProviderError::malformed(&self.id, "empty script"))),
        }
    }
}

#[async_trait]
impl TextGenerationProvider for ScriptedProvider {
    fn protocol(&self) -> WireProtocol {
        WireProtocol::OpenAi
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<String, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen_models.lock().unwrap().push(request.model.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.next_step()
    }
}

/// Registry with one enabled entry per `(id, priority, provider)`.
pub(crate) fn registry_with(entries: &[(&str, u32, Arc<ScriptedProvider>)]) -> ProviderRegistry {
    let registry = ProviderRegistry::new();
    for (id, priority, provider) in entries {
        let config = ProviderConfig::new(id, WireProtocol::OpenAi, &format!("{id}-model"), "http://fake")
            .with_api_key("test")
            .with_priority(*priority)
            .with_timeout_ms(10_000);
        registry.register_with(config, provider.clone()).unwrap();
    }
    registry
}
