use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use confab_core::errors::GenerationError;
use confab_core::provider::{
    ContextSource, DelegationRequest, GeneratedReply, GenerationRequest, ReplyGenerator,
};

/// Pre-programmed replies for deterministic testing without API calls.
#[derive(Clone, Debug)]
pub enum MockReply {
    Text(String),
    /// Ask for a specialist; `text` is whatever the agent said before the
    /// directive.
    Delegate {
        text: String,
        specialist_key: String,
        query: String,
    },
    Error(GenerationError),
    /// Wait a duration, then resolve the inner reply.
    Delay(Duration, Box<MockReply>),
}

impl MockReply {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    pub fn delegate(specialist_key: impl Into<String>, query: impl Into<String>) -> Self {
        Self::Delegate {
            text: String::new(),
            specialist_key: specialist_key.into(),
            query: query.into(),
        }
    }

    pub fn delayed(delay: Duration, inner: MockReply) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// What to do when an agent has no scripted reply left.
#[derive(Clone, Debug)]
enum Fallback {
    /// Repeat the query, folding in any specialist answers.
    Echo,
    Fail,
}

/// Generator that answers from per-agent scripts keyed by agent name.
pub struct MockGenerator {
    scripts: Mutex<HashMap<String, VecDeque<MockReply>>>,
    fallback: Fallback,
    calls: Mutex<Vec<GenerationRequest>>,
    call_count: AtomicUsize,
}

impl MockGenerator {
    /// Unscripted agents fail with `InvalidRequest`.
    pub fn new() -> Self {
        Self::with_fallback(Fallback::Fail)
    }

    /// Unscripted agents echo the query back.
    pub fn echo() -> Self {
        Self::with_fallback(Fallback::Echo)
    }

    fn with_fallback(fallback: Fallback) -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            fallback,
            calls: Mutex::new(Vec::new()),
            call_count: AtomicUsize::new(0),
        }
    }

    /// Builder form of [`push`](Self::push) for a whole script.
    pub fn script(self, agent_name: &str, replies: Vec<MockReply>) -> Self {
        self.scripts
            .lock()
            .entry(agent_name.to_string())
            .or_default()
            .extend(replies);
        self
    }

    pub fn push(&self, agent_name: &str, reply: MockReply) {
        self.scripts
            .lock()
            .entry(agent_name.to_string())
            .or_default()
            .push_back(reply);
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }

    /// Every request received so far, in arrival order.
    pub fn calls(&self) -> Vec<GenerationRequest> {
        self.calls.lock().clone()
    }

    pub fn calls_for(&self, agent_name: &str) -> Vec<GenerationRequest> {
        self.calls
            .lock()
            .iter()
            .filter(|r| r.agent_name == agent_name)
            .cloned()
            .collect()
    }

    fn next_reply(&self, agent_name: &str) -> Option<MockReply> {
        self.scripts
            .lock()
            .get_mut(agent_name)
            .and_then(VecDeque::pop_front)
    }
}

impl Default for MockGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ReplyGenerator for MockGenerator {
    fn name(&self) -> &str {
        "mock"
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<GeneratedReply, GenerationError> {
        let _ = self.call_count.fetch_add(1, Ordering::Relaxed);
        self.calls.lock().push(request.clone());
        let started = Instant::now();

        let reply = match self.next_reply(&request.agent_name) {
            Some(reply) => reply,
            None => match self.fallback {
                Fallback::Echo => MockReply::Text(echo_text(request)),
                Fallback::Fail => {
                    return Err(GenerationError::InvalidRequest(format!(
                        "MockGenerator: no reply scripted for {}",
                        request.agent_name
                    )))
                }
            },
        };

        let mut current = reply;
        loop {
            match current {
                MockReply::Delay(duration, inner) => {
                    tokio::time::sleep(duration).await;
                    current = *inner;
                }
                MockReply::Error(e) => return Err(e),
                MockReply::Text(text) => {
                    return Ok(finish(text, None, started));
                }
                MockReply::Delegate {
                    text,
                    specialist_key,
                    query,
                } => {
                    return Ok(finish(
                        text,
                        Some(DelegationRequest::new(specialist_key, query)),
                        started,
                    ));
                }
            }
        }
    }
}

fn finish(text: String, delegation: Option<DelegationRequest>, started: Instant) -> GeneratedReply {
    GeneratedReply {
        tokens: text.split_whitespace().count() as u64,
        latency_ms: started.elapsed().as_millis() as u64,
        cost: 0.0,
        text,
        delegation,
    }
}

fn echo_text(request: &GenerationRequest) -> String {
    let mut text = format!("{} heard: {}", request.agent_name, request.query);
    for block in &request.context {
        if let ContextSource::Specialist { specialist_key } = &block.source {
            let answer = block.data.as_str().unwrap_or_default();
            text.push_str(&format!(" ({specialist_key} says: {answer})"));
        }
    }
    text
}
