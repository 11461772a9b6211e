use serde::{Deserialize, Serialize};
use std::sync::Arc;

use anyhow::Result;

use crate::config::AppConfig;
use crate::cycle::CycleEngine;
use crate::gateway::{AiSettings, ChatApi, ChatRequest, Message};
use crate::memory::context::ContextEngine;
use crate::memory::{ShortTermEntry, SummaryOutcome};
use crate::prompt::{
    build_role_messages, moment_comment_prompt, moment_post_prompt, DEFAULT_PROACTIVE_PROMPT,
};
use crate::rng::RandomSource;
use crate::roles::{RoleProfile, RoleStore};

/// Emotion labels the classifier may answer with. Anything else is treated
/// as "no emotion detected".
const EMOTION_LABELS: [&str; 8] = [
    "happy",
    "sad",
    "angry",
    "surprised",
    "love",
    "confused",
    "excited",
    "tired",
];

const EMOTION_SAMPLE_RATE: f64 = 0.25;
const COMMENT_SKIP_RATE: f64 = 0.5;

const IMAGE_EXTENSIONS: [&str; 5] = ["png", "jpg", "jpeg", "gif", "webp"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AiEventType {
    Chat,
    Proactive,
    Task,
    #[serde(alias = "moment")]
    MomentPost,
    #[serde(alias = "comment")]
    MomentComment,
    MemorySummarization,
}

/// One unit of work for the dispatcher, whether it arrived over HTTP or
/// from the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiEvent {
    pub role_id: String,
    pub event_type: AiEventType,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub context: serde_json::Map<String, serde_json::Value>,
}

impl AiEvent {
    pub fn new(role_id: impl Into<String>, event_type: AiEventType) -> Self {
        Self {
            role_id: role_id.into(),
            event_type,
            content: String::new(),
            context: serde_json::Map::new(),
        }
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = content.into();
        self
    }

    pub fn with_context_value(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    fn context_str(&self, key: &str) -> Option<&str> {
        self.context.get(key).and_then(|value| value.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AiResponse {
    pub success: bool,
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl AiResponse {
    pub fn ok(action: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            success: true,
            action: action.into(),
            content: Some(content.into()),
            error: None,
            metadata: serde_json::Map::new(),
        }
    }

    /// Failures always carry action "ignore" so callers can drop them
    /// uniformly.
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            action: "ignore".to_string(),
            content: None,
            error: Some(error.into()),
            metadata: serde_json::Map::new(),
        }
    }

    /// Deliberate no-op (a probabilistic gate stayed closed).
    pub fn ignored() -> Self {
        Self {
            success: true,
            action: "ignore".to_string(),
            content: None,
            error: None,
            metadata: serde_json::Map::new(),
        }
    }
}

/// Outcome of dispatching one event. An unknown role is surfaced separately
/// so the HTTP layer can answer 404 instead of a generic failure.
#[derive(Debug)]
pub enum DispatchResult {
    Handled(AiResponse),
    RoleNotFound,
}

/// Routes events to their handlers. Every handler resolves the role first
/// and reports AI failures inside the response instead of erroring out.
pub struct EventDispatcher {
    context: ContextEngine,
    cycle: Arc<CycleEngine>,
    roles: Arc<RoleStore>,
    gateway: Arc<dyn ChatApi>,
    config: Arc<AppConfig>,
    rng: Arc<dyn RandomSource>,
}

impl EventDispatcher {
    pub fn new(
        context: ContextEngine,
        cycle: Arc<CycleEngine>,
        roles: Arc<RoleStore>,
        gateway: Arc<dyn ChatApi>,
        config: Arc<AppConfig>,
        rng: Arc<dyn RandomSource>,
    ) -> Self {
        Self {
            context,
            cycle,
            roles,
            gateway,
            config,
            rng,
        }
    }

    pub async fn dispatch(&self, event: AiEvent) -> Result<DispatchResult> {
        let Some(mut role) = self.roles.load(&event.role_id)? else {
            tracing::warn!("Event for unknown role '{}'", event.role_id);
            return Ok(DispatchResult::RoleNotFound);
        };

        let response = match event.event_type {
            AiEventType::Chat => self.handle_chat(&mut role, &event.content).await,
            AiEventType::Proactive => self.handle_proactive(&mut role, &event.content).await,
            AiEventType::Task => self.handle_task(&mut role, &event).await,
            AiEventType::MomentPost => self.handle_moment_post(&role).await,
            AiEventType::MomentComment => self.handle_moment_comment(&role, &event).await,
            AiEventType::MemorySummarization => self.handle_memory_summarization(&role).await,
        };
        Ok(DispatchResult::Handled(response))
    }

    /// Everything the system prompt should carry besides the persona: core
    /// memory, rolling block notes, cycle state, attached records.
    fn assemble_extra_context(&self, role: &mut RoleProfile) -> Option<String> {
        let mut parts = Vec::new();

        match self.context.store().get_core_memory(&role.id) {
            Ok(core) if !core.is_empty() => {
                parts.push(format!("What you remember about the user:\n{}", core));
            }
            Ok(_) => {}
            Err(error) => tracing::warn!("Core memory read failed for '{}': {}", role.id, error),
        }

        match self.context.recent_block_notes(&role.id) {
            Ok(notes) if !notes.is_empty() => {
                let rendered = notes
                    .iter()
                    .map(|note| format!("- {}", note))
                    .collect::<Vec<_>>()
                    .join("\n");
                parts.push(format!(
                    "Notes from earlier in this conversation:\n{}",
                    rendered
                ));
            }
            Ok(_) => {}
            Err(error) => tracing::warn!("Block notes read failed for '{}': {}", role.id, error),
        }

        match self.cycle.status(role) {
            Ok(Some(status)) => parts.push(status.context_sentence()),
            Ok(None) => {}
            Err(error) => tracing::warn!("Cycle status failed for '{}': {}", role.id, error),
        }

        if let Some(record) = role.metadata_str("attached_record") {
            parts.push(format!("Attached record:\n{}", record));
        }

        if parts.is_empty() {
            None
        } else {
            Some(parts.join("\n\n"))
        }
    }

    fn history_messages(entries: &[ShortTermEntry]) -> Vec<Message> {
        entries
            .iter()
            .map(|entry| Message {
                role: entry.role.clone(),
                content: entry.content.clone(),
            })
            .collect()
    }

    async fn handle_chat(&self, role: &mut RoleProfile, content: &str) -> AiResponse {
        // Weave the offline-gap narrative in first so it lands in the
        // history served below.
        match self.context.generate_bridge_memory(role, content).await {
            SummaryOutcome::Updated(_) => {
                tracing::debug!("Bridge narrative added for role '{}'", role.id)
            }
            SummaryOutcome::NoNeed => {}
            SummaryOutcome::Failed => {
                tracing::warn!("Bridge narrative failed for role '{}'", role.id)
            }
        }

        let history = match self.context.get_context(&role.id).await {
            Ok(entries) => entries,
            Err(error) => {
                tracing::error!("Context read failed for '{}': {}", role.id, error);
                return AiResponse::failure(format!("Memory unavailable: {}", error));
            }
        };

        let extra = self.assemble_extra_context(role);
        let messages = build_role_messages(
            role,
            content,
            &Self::history_messages(&history),
            extra.as_deref(),
        );
        // The persisted user turn keeps the literal time stamp.
        let stamped_user = messages
            .last()
            .map(|m| m.content.clone())
            .unwrap_or_else(|| content.to_string());

        let settings = AiSettings::resolve(Some(role), &self.config);
        let outcome = self
            .gateway
            .chat(ChatRequest::generation(settings, messages))
            .await;
        let Some(reply) = outcome.content.filter(|_| outcome.success) else {
            let error = outcome.error.unwrap_or_else(|| "no content".to_string());
            tracing::warn!("Chat generation failed for '{}': {}", role.id, error);
            return AiResponse::failure(error);
        };

        let store = self.context.store();
        if let Err(error) = store
            .append_short_term(&role.id, "user", &stamped_user)
            .and_then(|_| store.append_short_term(&role.id, "assistant", &reply))
        {
            tracing::error!("Failed to persist chat turns for '{}': {}", role.id, error);
            return AiResponse::failure(format!("Memory write failed: {}", error));
        }

        match self.context.trigger_memory_summary(role).await {
            SummaryOutcome::Updated(_) => {
                tracing::debug!("Core memory refreshed for role '{}'", role.id)
            }
            SummaryOutcome::NoNeed => {}
            SummaryOutcome::Failed => {
                tracing::warn!("Core-memory pass failed for role '{}'", role.id)
            }
        }

        let mut response = AiResponse::ok("reply", reply.clone());
        response
            .metadata
            .insert("role_name".to_string(), serde_json::json!(role.name));
        if let Some(emotion) = self.maybe_detect_emotion(role, &reply).await {
            response.content = Some(format!("{} [{}]", reply, emotion));
            response
                .metadata
                .insert("emotion".to_string(), serde_json::json!(emotion));
        }
        response
    }

    /// Generate an unprompted outreach message. The trigger instruction is
    /// not a user turn, so only the generated reply is persisted.
    async fn handle_proactive(&self, role: &mut RoleProfile, content: &str) -> AiResponse {
        let trigger = if !content.is_empty() {
            content.to_string()
        } else if !role.proactive_config.trigger_prompt.is_empty() {
            role.proactive_config.trigger_prompt.clone()
        } else {
            DEFAULT_PROACTIVE_PROMPT.to_string()
        };
        self.generate_outreach(role, "proactive", &trigger).await
    }

    /// Deliver a scheduled one-shot task. The task id from the event
    /// context is echoed in the response metadata so the caller can tell
    /// which firing produced the message.
    async fn handle_task(&self, role: &mut RoleProfile, event: &AiEvent) -> AiResponse {
        if event.content.is_empty() {
            return AiResponse::failure("Task carries no prompt");
        }
        let trigger = format!(
            "A scheduled reminder is due. Deliver it to the user in your own voice: {}",
            event.content
        );
        let mut response = self.generate_outreach(role, "task", &trigger).await;
        if let Some(task_id) = event.context_str("task_id") {
            response
                .metadata
                .insert("task_id".to_string(), serde_json::json!(task_id));
        }
        response
    }

    async fn generate_outreach(
        &self,
        role: &mut RoleProfile,
        action: &str,
        trigger: &str,
    ) -> AiResponse {
        let history = match self.context.get_context(&role.id).await {
            Ok(entries) => entries,
            Err(error) => {
                tracing::error!("Context read failed for '{}': {}", role.id, error);
                return AiResponse::failure(format!("Memory unavailable: {}", error));
            }
        };
        let extra = self.assemble_extra_context(role);
        let messages = build_role_messages(
            role,
            trigger,
            &Self::history_messages(&history),
            extra.as_deref(),
        );

        let settings = AiSettings::resolve(Some(role), &self.config);
        let outcome = self
            .gateway
            .chat(ChatRequest::generation(settings, messages))
            .await;
        let Some(reply) = outcome.content.filter(|_| outcome.success) else {
            let error = outcome.error.unwrap_or_else(|| "no content".to_string());
            tracing::warn!("{} generation failed for '{}': {}", action, role.id, error);
            return AiResponse::failure(error);
        };

        if let Err(error) = self
            .context
            .store()
            .append_short_term(&role.id, "assistant", &reply)
        {
            tracing::error!("Failed to persist {} turn for '{}': {}", action, role.id, error);
            return AiResponse::failure(format!("Memory write failed: {}", error));
        }

        AiResponse::ok(action, reply)
    }

    async fn handle_moment_post(&self, role: &RoleProfile) -> AiResponse {
        let mood = role.metadata_str("mood").map(str::to_string);
        let prompt = moment_post_prompt(role, mood.as_deref());
        let settings = AiSettings::resolve(Some(role), &self.config);
        let outcome = self
            .gateway
            .chat(
                ChatRequest::generation(settings, vec![Message::user(prompt)])
                    .with_temperature(0.9),
            )
            .await;
        match outcome.content.filter(|_| outcome.success) {
            Some(post) => AiResponse::ok("post", post.trim().to_string()),
            None => AiResponse::failure(
                outcome.error.unwrap_or_else(|| "no content".to_string()),
            ),
        }
    }

    /// Comment on someone's post, or stay silent half the time so the role
    /// does not feel compelled to react to everything.
    async fn handle_moment_comment(&self, role: &RoleProfile, event: &AiEvent) -> AiResponse {
        if self.rng.chance(COMMENT_SKIP_RATE) {
            tracing::debug!("Role '{}' chose not to comment", role.id);
            return AiResponse::ignored();
        }

        let post_content = event.context_str("post_content").unwrap_or(&event.content);
        let post_author = event.context_str("post_author").unwrap_or("someone");
        let reply_to = event.context_str("reply_to");

        let prompt = moment_comment_prompt(role, post_content, post_author, reply_to);
        let settings = AiSettings::resolve(Some(role), &self.config);
        let outcome = self
            .gateway
            .chat(
                ChatRequest::generation(settings, vec![Message::user(prompt)])
                    .with_temperature(0.8),
            )
            .await;
        match outcome.content.filter(|_| outcome.success) {
            Some(comment) => AiResponse::ok("comment", comment.trim().to_string()),
            None => AiResponse::failure(
                outcome.error.unwrap_or_else(|| "no content".to_string()),
            ),
        }
    }

    async fn handle_memory_summarization(&self, role: &RoleProfile) -> AiResponse {
        match self.context.trigger_memory_summary(role).await {
            SummaryOutcome::Updated(summary) => AiResponse::ok("memory", summary),
            SummaryOutcome::NoNeed => AiResponse::ok("ignore", "noneed"),
            SummaryOutcome::Failed => AiResponse::failure("Summarization failed"),
        }
    }

    /// Occasionally classify the reply's dominant emotion so the frontend
    /// can pick a matching emoji sticker. Only fires when the role actually
    /// has images for the detected label.
    async fn maybe_detect_emotion(&self, role: &RoleProfile, reply: &str) -> Option<String> {
        if !self.rng.chance(EMOTION_SAMPLE_RATE) {
            return None;
        }

        let prompt = format!(
            "Classify the dominant emotion of this message. Answer with exactly one word from: \
{}. If none fits, answer: neutral.\n\nMessage: {}",
            EMOTION_LABELS.join(", "),
            reply
        );
        let worker = self
            .roles
            .load(&self.config.workers.classifier_role_id)
            .ok()
            .flatten();
        let settings = AiSettings::resolve(worker.as_ref(), &self.config);
        let outcome = self
            .gateway
            .chat(ChatRequest::classification(
                settings,
                vec![Message::user(prompt)],
            ))
            .await;

        let label = outcome
            .content
            .filter(|_| outcome.success)?
            .trim()
            .to_lowercase();
        if !EMOTION_LABELS.contains(&label.as_str()) {
            return None;
        }
        if !self.has_emoji_for(role, &label) {
            tracing::debug!("Role '{}' has no emoji assets for '{}'", role.id, label);
            return None;
        }
        Some(label)
    }

    fn has_emoji_for(&self, role: &RoleProfile, emotion: &str) -> bool {
        let dir = self.roles.emoji_dir(&role.id, emotion);
        let Ok(entries) = std::fs::read_dir(dir) else {
            return false;
        };
        entries.flatten().any(|entry| {
            entry
                .path()
                .extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
                .unwrap_or(false)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::testing::StubChat;
    use crate::gateway::ChatOutcome;
    use crate::memory::store::MemoryStore;
    use crate::rng::testing::ScriptedRandom;
    use std::path::PathBuf;

    fn temp_db_path(name: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!(
            "companion_dispatch_{}_{}.db",
            name,
            uuid::Uuid::new_v4()
        ));
        path
    }

    struct Fixture {
        dispatcher: EventDispatcher,
        roles: Arc<RoleStore>,
        store: Arc<MemoryStore>,
        stub: Arc<StubChat>,
        rng: Arc<ScriptedRandom>,
        _roles_dir: tempfile::TempDir,
    }

    fn fixture(name: &str) -> Fixture {
        let roles_dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(
            MemoryStore::new(temp_db_path(name), roles_dir.path().to_path_buf()).expect("store"),
        );
        let roles = Arc::new(RoleStore::new(roles_dir.path().to_path_buf()));
        let stub = Arc::new(StubChat::new());
        let rng = Arc::new(ScriptedRandom::new());

        let mut config = AppConfig::default();
        config.ai_api_url = "https://api.example".to_string();
        config.ai_api_key = Some("key".to_string());
        let config = Arc::new(config);

        let gateway = stub.clone() as Arc<dyn ChatApi>;
        let context = ContextEngine::new(
            Arc::clone(&store),
            Arc::clone(&roles),
            Arc::clone(&gateway),
            Arc::clone(&config),
        );
        let cycle = Arc::new(CycleEngine::new(
            Arc::clone(&store),
            Arc::clone(&roles),
            Arc::clone(&config),
            rng.clone() as Arc<dyn RandomSource>,
        ));
        let dispatcher = EventDispatcher::new(
            context,
            cycle,
            Arc::clone(&roles),
            gateway,
            config,
            rng.clone() as Arc<dyn RandomSource>,
        );
        Fixture {
            dispatcher,
            roles,
            store,
            stub,
            rng,
            _roles_dir: roles_dir,
        }
    }

    fn seed_role(f: &Fixture, id: &str) -> RoleProfile {
        let mut role = RoleProfile::new(id, "Mia");
        role.persona = "warm and playful".to_string();
        f.roles.save(&role).expect("save role");
        role
    }

    fn handled(result: DispatchResult) -> AiResponse {
        match result {
            DispatchResult::Handled(response) => response,
            DispatchResult::RoleNotFound => panic!("expected a handled response"),
        }
    }

    #[tokio::test]
    async fn unknown_role_is_reported_as_not_found() {
        let f = fixture("unknown");
        let result = f
            .dispatcher
            .dispatch(AiEvent::new("ghost", AiEventType::Chat).with_content("hi"))
            .await
            .expect("dispatch");
        assert!(matches!(result, DispatchResult::RoleNotFound));
        assert_eq!(f.stub.call_count(), 0);
    }

    #[tokio::test]
    async fn chat_persists_stamped_turn_pair() {
        let f = fixture("chat");
        seed_role(&f, "r1");
        f.stub.push(ChatOutcome::ok("none")); // fresh role: bridge pass runs first
        f.stub.push(ChatOutcome::ok("hello there!"));
        f.rng.push_chance(false); // no emotion sampling

        let response = handled(
            f.dispatcher
                .dispatch(AiEvent::new("r1", AiEventType::Chat).with_content("good morning"))
                .await
                .expect("dispatch"),
        );
        assert!(response.success);
        assert_eq!(response.action, "reply");
        assert_eq!(response.content.as_deref(), Some("hello there!"));
        assert_eq!(
            response.metadata.get("role_name"),
            Some(&serde_json::json!("Mia"))
        );

        let record = f.store.load("r1").expect("load");
        assert_eq!(record.short_term.len(), 2);
        assert_eq!(record.short_term[0].role, "user");
        assert!(record.short_term[0].content.starts_with("good morning"));
        assert!(record.short_term[0].content.contains("(current time: "));
        assert_eq!(record.short_term[1].content, "hello there!");
    }

    #[tokio::test]
    async fn chat_failure_leaves_memory_untouched() {
        let f = fixture("chat_fail");
        seed_role(&f, "r1");
        f.stub.push(ChatOutcome::ok("none")); // bridge pass
        f.stub.push(ChatOutcome::failure("upstream 500"));

        let response = handled(
            f.dispatcher
                .dispatch(AiEvent::new("r1", AiEventType::Chat).with_content("hi"))
                .await
                .expect("dispatch"),
        );
        assert!(!response.success);
        assert_eq!(response.action, "ignore");
        assert_eq!(response.error.as_deref(), Some("upstream 500"));
        assert_eq!(f.store.short_term_len("r1").expect("len"), 0);
    }

    #[tokio::test]
    async fn emotion_tag_requires_sampling_and_assets() {
        let f = fixture("emotion");
        let role = seed_role(&f, "r1");
        let emoji_dir = f.roles.emoji_dir(&role.id, "happy");
        std::fs::create_dir_all(&emoji_dir).expect("mkdir");
        std::fs::write(emoji_dir.join("smile.png"), b"png").expect("write");

        f.stub.push(ChatOutcome::ok("none")); // bridge pass
        f.stub.push(ChatOutcome::ok("so glad to see you"));
        f.stub.push(ChatOutcome::ok("happy"));
        f.rng.push_chance(true); // sample this reply

        let response = handled(
            f.dispatcher
                .dispatch(AiEvent::new("r1", AiEventType::Chat).with_content("hey"))
                .await
                .expect("dispatch"),
        );
        assert_eq!(
            response.content.as_deref(),
            Some("so glad to see you [happy]")
        );
        assert_eq!(
            response.metadata.get("emotion"),
            Some(&serde_json::json!("happy"))
        );

        // The stored assistant turn stays untagged.
        let record = f.store.load("r1").expect("load");
        assert_eq!(record.short_term[1].content, "so glad to see you");
    }

    #[tokio::test]
    async fn emotion_without_assets_is_dropped() {
        let f = fixture("emotion_no_assets");
        seed_role(&f, "r1");
        f.stub.push(ChatOutcome::ok("none")); // bridge pass
        f.stub.push(ChatOutcome::ok("so glad to see you"));
        f.stub.push(ChatOutcome::ok("happy"));
        f.rng.push_chance(true);

        let response = handled(
            f.dispatcher
                .dispatch(AiEvent::new("r1", AiEventType::Chat).with_content("hey"))
                .await
                .expect("dispatch"),
        );
        assert_eq!(response.content.as_deref(), Some("so glad to see you"));
        assert!(response.metadata.get("emotion").is_none());
    }

    #[tokio::test]
    async fn proactive_without_content_uses_default_trigger() {
        let f = fixture("proactive");
        seed_role(&f, "r1");
        f.stub.push(ChatOutcome::ok("thinking of you!"));

        let response = handled(
            f.dispatcher
                .dispatch(AiEvent::new("r1", AiEventType::Proactive))
                .await
                .expect("dispatch"),
        );
        assert!(response.success);
        assert_eq!(response.action, "proactive");

        let requests = f.stub.requests.lock().unwrap();
        let last_message = requests[0].messages.last().expect("messages");
        assert!(last_message.content.starts_with(DEFAULT_PROACTIVE_PROMPT));
        drop(requests);

        // Only the generated outreach lands in memory.
        let record = f.store.load("r1").expect("load");
        assert_eq!(record.short_term.len(), 1);
        assert_eq!(record.short_term[0].role, "assistant");
    }

    #[tokio::test]
    async fn task_echoes_task_id_in_metadata() {
        let f = fixture("task_id");
        seed_role(&f, "r1");
        f.stub.push(ChatOutcome::ok("your meeting starts soon"));

        let event = AiEvent::new("r1", AiEventType::Task)
            .with_content("remind about the 3pm meeting")
            .with_context_value("task_id", serde_json::json!("t-42"));
        let response = handled(f.dispatcher.dispatch(event).await.expect("dispatch"));
        assert!(response.success);
        assert_eq!(response.action, "task");
        assert_eq!(
            response.metadata.get("task_id"),
            Some(&serde_json::json!("t-42"))
        );
    }

    #[tokio::test]
    async fn comment_skip_gate_avoids_the_ai_entirely() {
        let f = fixture("comment_skip");
        seed_role(&f, "r1");
        f.rng.push_chance(true); // skip

        let event = AiEvent::new("r1", AiEventType::MomentComment).with_content("nice weather");
        let response = handled(f.dispatcher.dispatch(event).await.expect("dispatch"));
        assert!(response.success);
        assert_eq!(response.action, "ignore");
        assert!(response.content.is_none());
        assert_eq!(f.stub.call_count(), 0);
    }

    #[tokio::test]
    async fn comment_uses_post_context_when_present() {
        let f = fixture("comment");
        seed_role(&f, "r1");
        f.rng.push_chance(false); // do comment
        f.stub.push(ChatOutcome::ok("love this!"));

        let mut event = AiEvent::new("r1", AiEventType::MomentComment);
        event
            .context
            .insert("post_content".to_string(), serde_json::json!("went hiking"));
        event
            .context
            .insert("post_author".to_string(), serde_json::json!("Alex"));

        let response = handled(f.dispatcher.dispatch(event).await.expect("dispatch"));
        assert_eq!(response.content.as_deref(), Some("love this!"));

        let requests = f.stub.requests.lock().unwrap();
        let prompt = &requests[0].messages[0].content;
        assert!(prompt.contains("went hiking"));
        assert!(prompt.contains("Alex"));
    }

    #[tokio::test]
    async fn summarization_event_maps_noneed() {
        let f = fixture("summarize_noneed");
        seed_role(&f, "r1");

        let response = handled(
            f.dispatcher
                .dispatch(AiEvent::new("r1", AiEventType::MemorySummarization))
                .await
                .expect("dispatch"),
        );
        assert!(response.success);
        assert_eq!(response.action, "ignore");
        assert_eq!(response.content.as_deref(), Some("noneed"));
        assert_eq!(f.stub.call_count(), 0);
    }

    #[test]
    fn event_type_wire_names_parse() {
        let event: AiEvent = serde_json::from_str(
            r#"{"role_id":"r1","event_type":"moment_post"}"#,
        )
        .expect("parse");
        assert_eq!(event.event_type, AiEventType::MomentPost);
        assert_eq!(event.content, "");

        // legacy clients still send the short names
        let event: AiEvent = serde_json::from_str(
            r#"{"role_id":"r1","event_type":"moment"}"#,
        )
        .expect("parse");
        assert_eq!(event.event_type, AiEventType::MomentPost);

        let event: AiEvent = serde_json::from_str(
            r#"{"role_id":"r1","event_type":"comment"}"#,
        )
        .expect("parse");
        assert_eq!(event.event_type, AiEventType::MomentComment);

        let event: AiEvent = serde_json::from_str(
            r#"{"role_id":"r1","event_type":"memory_summarization"}"#,
        )
        .expect("parse");
        assert_eq!(event.event_type, AiEventType::MemorySummarization);
    }
}
