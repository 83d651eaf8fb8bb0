use std::collections::{BTreeMap, VecDeque};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use chrono::Utc;
use clap::ValueEnum;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use serde_toon::to_string_pretty;
use thiserror::Error;
use tracing::{debug, warn};

use crate::modules::action::ActionKind;
use crate::modules::observe::Observation;
use crate::modules::world::AgentId;

pub const DEFAULT_AGENT_GOAL: &str = "Evolve, survive, build machines, form territories, and develop civilizations inside a voxel-based, blockchain-synchronized environment.";

/// Cycle used by the loop brain when no actions are given on the command line.
pub const DEFAULT_LOOP_ACTIONS: &[&str] = &[
    "scan",
    "harvest_qi_ore",
    "move:1,0,0",
    "build:basic",
    "move:0,1,0",
    "idle",
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrainError {
    #[error("llm request failed: {0}")]
    Http(String),
    #[error("brain gave no answer within {0:?}")]
    Timeout(Duration),
    #[error("could not read an action from reply: {0}")]
    Unparseable(String),
    #[error("brain misconfigured: {0}")]
    Config(String),
    #[error("brain is still working on an earlier request")]
    Busy,
    #[error("brain thread failed: {0}")]
    Crashed(String),
}

/// Decision boundary. Implementations return one action token; the engine
/// treats errors, late replies and unparseable tokens as `idle`. The engine
/// calls `decide` on a helper thread and stops waiting after `timeout`.
pub trait Brain: Send + 'static {
    fn decide(&mut self, observation: &Observation, timeout: Duration) -> Result<String, BrainError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum BrainMode {
    /// Deterministic loop over the given (or default) action tokens
    Loop,
    /// Ask an LLM for every decision
    Llm,
    /// Replay a per-agent script file
    Script,
}

/// Walks a fixed token cycle independently for every agent.
#[derive(Debug, Clone)]
pub struct LoopBrain {
    cycle: Vec<String>,
    cursor: BTreeMap<AgentId, usize>,
}

impl LoopBrain {
    pub fn new(cycle: Vec<String>) -> Self {
        let cycle = if cycle.is_empty() {
            DEFAULT_LOOP_ACTIONS.iter().map(|s| s.to_string()).collect()
        } else {
            cycle
        };
        Self {
            cycle,
            cursor: BTreeMap::new(),
        }
    }
}

impl Brain for LoopBrain {
    fn decide(&mut self, observation: &Observation, _timeout: Duration) -> Result<String, BrainError> {
        let slot = self.cursor.entry(observation.agent_id).or_default();
        let token = self.cycle[*slot % self.cycle.len()].clone();
        *slot += 1;
        Ok(token)
    }
}

/// Replays queued tokens per agent, then idles.
#[derive(Debug, Clone, Default)]
pub struct ScriptedBrain {
    scripts: BTreeMap<AgentId, VecDeque<String>>,
}

impl ScriptedBrain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, agent_id: AgentId, token: impl Into<String>) -> &mut Self {
        self.scripts.entry(agent_id).or_default().push_back(token.into());
        self
    }

    /// Parse a script: one `<agent_id> <token>` per line, `#` starts a comment.
    pub fn parse(text: &str) -> Result<Self, BrainError> {
        let mut brain = Self::new();
        for (idx, raw) in text.lines().enumerate() {
            let line = raw.split('#').next().unwrap_or_default().trim();
            if line.is_empty() {
                continue;
            }
            let (id, token) = line
                .split_once(char::is_whitespace)
                .ok_or_else(|| BrainError::Config(format!("script line {}: expected `<agent_id> <action>`", idx + 1)))?;
            let agent_id: AgentId = id
                .parse()
                .map_err(|_| BrainError::Config(format!("script line {}: bad agent id '{}'", idx + 1, id)))?;
            brain.push(agent_id, token.trim());
        }
        Ok(brain)
    }

    pub fn remaining(&self, agent_id: AgentId) -> usize {
        self.scripts.get(&agent_id).map_or(0, VecDeque::len)
    }
}

impl Brain for ScriptedBrain {
    fn decide(&mut self, observation: &Observation, _timeout: Duration) -> Result<String, BrainError> {
        Ok(self
            .scripts
            .get_mut(&observation.agent_id)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| "idle".to_string()))
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    Ollama,
    #[default]
    Openai,
}

#[derive(Debug, Clone)]
pub struct LlmClient {
    host: String,
    model: String,
    provider: LlmProvider,
    api_key: Option<String>,
    http: Client,
}

impl LlmClient {
    pub fn new(
        host: impl Into<String>,
        model: impl Into<String>,
        provider: LlmProvider,
        api_key: Option<String>,
    ) -> Result<Self, BrainError> {
        if provider == LlmProvider::Openai && api_key.is_none() {
            return Err(BrainError::Config(
                "missing LLM API key; set --llm-api-key or LLM_API_KEY".into(),
            ));
        }
        let http = Client::builder()
            .build()
            .map_err(|e| BrainError::Config(e.to_string()))?;
        Ok(Self {
            host: host.into(),
            model: model.into(),
            provider,
            api_key,
            http,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

/// LLM-backed brain. Every exchange is appended to the llm log.
#[derive(Debug)]
pub struct LlmBrain {
    client: LlmClient,
    log_path: PathBuf,
    max_attempts: u32,
}

impl LlmBrain {
    pub fn new(client: LlmClient, log_path: PathBuf) -> Self {
        Self {
            client,
            log_path,
            max_attempts: 3,
        }
    }

    fn log_exchange(&self, request_json: &str, response_json: &str) {
        let content = format!(
            "[{}] provider={:?} model={}\nrequest:\n{}\nresponse:\n{}\n\n",
            Utc::now().to_rfc3339(),
            self.client.provider,
            self.client.model,
            request_json,
            response_json
        );
        let result = self
            .log_path
            .parent()
            .map_or(Ok(()), fs::create_dir_all)
            .and_then(|_| OpenOptions::new().create(true).append(true).open(&self.log_path))
            .and_then(|mut f| f.write_all(content.as_bytes()));
        if let Err(err) = result {
            warn!(path = %self.log_path.display(), error = %err, "failed to write llm log");
        }
    }
}

impl Brain for LlmBrain {
    fn decide(&mut self, observation: &Observation, timeout: Duration) -> Result<String, BrainError> {
        let prompt = build_prompt(observation);
        let deadline = Instant::now() + timeout;
        let mut last_err = BrainError::Timeout(timeout);

        for attempt in 1..=self.max_attempts {
            if attempt > 1 {
                let jitter = Duration::from_millis(50 + rand::random::<u64>() % 100);
                if Instant::now() + jitter >= deadline {
                    break;
                }
                std::thread::sleep(jitter);
            }
            let budget = deadline.saturating_duration_since(Instant::now());
            if budget.is_zero() {
                break;
            }
            let exchange = match self.client.provider {
                LlmProvider::Ollama => call_ollama(&self.client, &prompt, budget),
                LlmProvider::Openai => call_openai(&self.client, &prompt, budget),
            };
            match exchange {
                Ok(exchange) => {
                    self.log_exchange(&exchange.request_json, &exchange.response_json);
                    debug!(agent_id = observation.agent_id, reply = %truncate(&exchange.reply, 120), "llm replied");
                    return parse_reply(&exchange.reply)
                        .map(|kind| kind.token())
                        .ok_or_else(|| BrainError::Unparseable(truncate(&exchange.reply, 120)));
                }
                Err(err) => {
                    debug!(agent_id = observation.agent_id, attempt, error = %err, "llm attempt failed");
                    last_err = err;
                }
            }
        }
        Err(last_err)
    }
}

const ACTION_GRAMMAR: &[&str] = &[
    "scan",
    "idle",
    "inspect:<agent|structure|ore_node|recharge_node|zone>:<id>",
    "move:<dx>,<dy>,<dz>",
    "mine:<node_id>",
    "harvest_qi_ore",
    "build:<basic|block|programmable>",
    "place_block:<dx>,<dy>,<dz>",
    "write_program:<hex>",
    "claim_zone:<radius>",
    "join_zone:<zone_id>",
    "leave_zone:<zone_id>",
    "expand_zone:<zone_id>,<by>",
    "reproduce",
];

fn build_prompt(observation: &Observation) -> String {
    let payload = json!({
        "goal": DEFAULT_AGENT_GOAL,
        "observation": observation,
        "actions": ACTION_GRAMMAR,
        "costs": { "scan": 0, "inspect": 0, "idle": 0, "other": 1 },
        "reply": { "action": "one_of(actions)" }
    });
    let toon = to_string_pretty(&payload).unwrap_or_else(|_| payload.to_string());
    format!(
        "Choose exactly one action from `actions`, fill in its parameters, and reply ONLY in TOON with `action: <token>`. Input:\n{toon}"
    )
}

fn system_prompt() -> String {
    format!(
        "You are an autonomous agent inside a voxel world where every write action costs Qi. Act to advance this goal: {}. Respond ONLY in TOON with `action: <token>`.",
        DEFAULT_AGENT_GOAL
    )
}

fn chat_messages(user_prompt: &str) -> Vec<Message> {
    vec![
        Message {
            role: "system".into(),
            content: system_prompt(),
        },
        Message {
            role: "user".into(),
            content: user_prompt.into(),
        },
    ]
}

struct Exchange {
    request_json: String,
    response_json: String,
    reply: String,
}

fn send<T: Serialize>(
    client: &LlmClient,
    url: &str,
    body: &T,
    budget: Duration,
) -> Result<(String, String), BrainError> {
    let request_json =
        serde_json::to_string_pretty(body).map_err(|e| BrainError::Http(format!("encode request: {}", e)))?;
    let mut request = client.http.post(url).timeout(budget).json(body);
    if let Some(key) = &client.api_key {
        request = request.bearer_auth(key);
    }
    let resp = request.send().map_err(|e| {
        if e.is_timeout() {
            BrainError::Timeout(budget)
        } else {
            BrainError::Http(e.to_string())
        }
    })?;
    let status = resp.status();
    let raw = resp
        .text()
        .map_err(|e| BrainError::Http(format!("read body: {}", e)))?;
    if !status.is_success() {
        return Err(BrainError::Http(format!("status={} body={}", status, truncate(&raw, 200))));
    }
    Ok((request_json, raw))
}

fn call_ollama(client: &LlmClient, prompt: &str, budget: Duration) -> Result<Exchange, BrainError> {
    let url = format!("{}/api/chat", client.host.trim_end_matches('/'));
    let body = ChatRequest {
        model: client.model.clone(),
        stream: false,
        messages: chat_messages(prompt),
    };
    let (request_json, raw) = send(client, &url, &body, budget)?;
    let parsed: ChatResponse =
        serde_json::from_str(&raw).map_err(|e| BrainError::Http(format!("decode: {}", e)))?;
    Ok(Exchange {
        request_json,
        response_json: raw,
        reply: parsed.message.content,
    })
}

fn call_openai(client: &LlmClient, prompt: &str, budget: Duration) -> Result<Exchange, BrainError> {
    let trimmed = client.host.trim_end_matches('/');
    let url = if trimmed.ends_with("/v1/chat/completions") {
        trimmed.to_string()
    } else {
        format!("{}/v1/chat/completions", trimmed)
    };
    let body = OpenAiChatRequest {
        model: client.model.clone(),
        stream: false,
        temperature: None,
        messages: chat_messages(prompt),
    };
    let (request_json, raw) = send(client, &url, &body, budget)?;
    let parsed: OpenAiChatResponse =
        serde_json::from_str(&raw).map_err(|e| BrainError::Http(format!("decode: {}", e)))?;
    let reply = parsed
        .choices
        .into_iter()
        .next()
        .map(|c| c.message.content)
        .unwrap_or_default();
    Ok(Exchange {
        request_json,
        response_json: raw,
        reply,
    })
}

/// Byte offset of an ASCII `needle` in `haystack`, ignoring ASCII case.
/// Offsets always fall on char boundaries.
fn find_ignore_ascii_case(haystack: &str, needle: &str) -> Option<usize> {
    let bytes = haystack.as_bytes();
    haystack.char_indices().map(|(i, _)| i).find(|&i| {
        bytes
            .get(i..i + needle.len())
            .is_some_and(|window| window.eq_ignore_ascii_case(needle.as_bytes()))
    })
}

/// Pull an action out of a model reply. Accepts `{"action": ...}`,
/// `action=<token>`, an `action: <token>` line, or a bare token.
pub fn parse_reply(text: &str) -> Option<ActionKind> {
    let text = text.trim().trim_matches('`').trim();

    if let Ok(value) = serde_json::from_str::<serde_json::Value>(text) {
        if let Some(kind) = value
            .get("action")
            .and_then(|v| v.as_str())
            .and_then(|s| s.trim().parse().ok())
        {
            return Some(kind);
        }
    }

    if let Some(idx) = find_ignore_ascii_case(text, "action=") {
        let slice = text[idx + "action=".len()..]
            .trim_start_matches(|c: char| c.is_whitespace() || matches!(c, '{' | '[' | '(' | '"'));
        let end = slice
            .find(|c: char| c.is_whitespace() || matches!(c, '}' | ']' | ')' | '"'))
            .unwrap_or(slice.len());
        if let Ok(kind) = slice[..end].parse() {
            return Some(kind);
        }
    }

    for line in text.lines() {
        if let Some(rest) = line.trim().strip_prefix("action:") {
            if let Ok(kind) = rest.trim().trim_matches('"').parse() {
                return Some(kind);
            }
        }
    }

    text.parse().ok()
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<Message>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct OpenAiChatRequest {
    model: String,
    messages: Vec<Message>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Serialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct OpenAiChatResponse {
    choices: Vec<OpenAiChoice>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: ChatMessage,
}

pub fn truncate(text: &str, max: usize) -> String {
    // Cut on a char boundary.
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::observe;
    use crate::modules::testkit::Sandbox;
    use crate::modules::world::Position;

    fn observation(agent_id: AgentId) -> Observation {
        let mut sb = Sandbox::new();
        let id = sb.spawn(1, Position::origin());
        let mut obs = observe::observe(&sb.world, id).unwrap();
        obs.agent_id = agent_id;
        obs
    }

    #[test]
    fn loop_brain_cycles_per_agent() {
        let mut brain = LoopBrain::new(vec!["scan".into(), "idle".into()]);
        let t = Duration::from_millis(10);
        let a = observation(1);
        let b = observation(2);
        assert_eq!(brain.decide(&a, t).unwrap(), "scan");
        assert_eq!(brain.decide(&a, t).unwrap(), "idle");
        assert_eq!(brain.decide(&b, t).unwrap(), "scan");
        assert_eq!(brain.decide(&a, t).unwrap(), "scan");
    }

    #[test]
    fn scripted_brain_idles_when_exhausted() {
        let mut brain = ScriptedBrain::parse("# demo\n1 move:1,0,0\n1 scan\n2 reproduce\n").unwrap();
        let t = Duration::from_millis(10);
        let one = observation(1);
        assert_eq!(brain.decide(&one, t).unwrap(), "move:1,0,0");
        assert_eq!(brain.decide(&one, t).unwrap(), "scan");
        assert_eq!(brain.decide(&one, t).unwrap(), "idle");
        assert_eq!(brain.remaining(2), 1);
        assert!(ScriptedBrain::parse("x scan").is_err());
    }

    #[test]
    fn reply_parsing_accepts_common_shapes() {
        let mv = ActionKind::Move { dx: 1, dy: 0, dz: 0 };
        assert_eq!(parse_reply(r#"{"action": "move:1,0,0"}"#), Some(mv.clone()));
        assert_eq!(parse_reply("TOON{action=move:1,0,0}"), Some(mv.clone()));
        assert_eq!(parse_reply("thinking...\naction: move:1,0,0"), Some(mv));
        assert_eq!(parse_reply("scan"), Some(ActionKind::Scan));
        assert_eq!(parse_reply("I would like to dance"), None);
    }

    #[test]
    fn non_ascii_replies_never_panic() {
        assert_eq!(parse_reply("İİİİİİİİ action=scan"), Some(ActionKind::Scan));
        assert_eq!(parse_reply("ÀCTION=scan ACTION=idle"), Some(ActionKind::Idle));
        assert_eq!(parse_reply("İ action=é"), None);
        assert_eq!(parse_reply("ßßß"), None);
        assert_eq!(parse_reply("action=move:-2147483648,0,0"), None);
    }

    #[test]
    fn openai_client_needs_a_key() {
        assert!(LlmClient::new("http://localhost", "m", LlmProvider::Openai, None).is_err());
        assert!(LlmClient::new("http://localhost", "m", LlmProvider::Ollama, None).is_ok());
    }
}
