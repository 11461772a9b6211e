use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;

use crate::config::AppConfig;
use crate::gateway::{AiSettings, ChatApi, ChatRequest, Message};
use crate::memory::store::MemoryStore;
use crate::memory::{ShortTermEntry, SummaryOutcome};
use crate::prompt::render_transcript;
use crate::roles::{RoleProfile, RoleStore};

/// Marker prefixed to the synthetic user-side entry of a bridge pair so the
/// model (and anyone reading the log) can tell it from a real user turn.
pub const MEMORY_EVENT_TAG: &str = "[memory event]";

const BRIDGE_NOTE_LIMIT: usize = 3;

/// Context windowing plus the two summarization passes that keep long
/// conversations coherent: core-memory distillation and offline bridge
/// narratives. All AI failures here are logged and absorbed; a broken
/// summarizer must never break chat.
#[derive(Clone)]
pub struct ContextEngine {
    store: Arc<MemoryStore>,
    roles: Arc<RoleStore>,
    gateway: Arc<dyn ChatApi>,
    config: Arc<AppConfig>,
}

/// Boundaries of the block a conversation of `total` messages currently sits
/// in: the window restarts every `limit` messages, so the served context
/// shrinks to a fresh block instead of sliding.
pub fn context_block(total: usize, limit: usize) -> (usize, usize) {
    if total == 0 || limit == 0 {
        return (0, total);
    }
    let start = ((total - 1) / limit) * limit;
    (start, total)
}

impl ContextEngine {
    pub fn new(
        store: Arc<MemoryStore>,
        roles: Arc<RoleStore>,
        gateway: Arc<dyn ChatApi>,
        config: Arc<AppConfig>,
    ) -> Self {
        Self {
            store,
            roles,
            gateway,
            config,
        }
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    /// The short-term entries to feed the next generation call: the current
    /// block only. Detects block transitions and kicks off closed-block
    /// summarization in the background.
    pub async fn get_context(&self, role_id: &str) -> Result<Vec<ShortTermEntry>> {
        let total = self.store.short_term_len(role_id)?;
        let (start, end) = context_block(total, self.config.memory.context_window);

        let previous_start = self.store.last_context_block_start(role_id)?;
        if start != previous_start {
            self.store.set_last_context_block_start(role_id, start)?;
            if start > previous_start {
                let engine = self.clone();
                let role_id = role_id.to_string();
                tokio::spawn(async move {
                    engine
                        .summarize_closed_block(&role_id, previous_start, start)
                        .await;
                });
            }
        }

        self.store.short_term_slice(role_id, start, end)
    }

    /// Condense a closed block into one rolling note. Fire-and-forget from
    /// `get_context`; failures are logged and dropped.
    pub async fn summarize_closed_block(&self, role_id: &str, start: usize, end: usize) {
        let entries = match self.store.short_term_slice(role_id, start, end) {
            Ok(entries) if !entries.is_empty() => entries,
            Ok(_) => return,
            Err(error) => {
                tracing::warn!("Closed-block read failed for '{}': {}", role_id, error);
                return;
            }
        };

        let role = self.roles.load(role_id).ok().flatten();
        let settings = AiSettings::resolve(role.as_ref(), &self.config);
        let prompt = format!(
            "The following conversation segment is about to leave the active context. \
Condense it into one short note (at most 50 words) capturing facts, plans and emotional \
beats worth carrying forward. Output only the note.\n\n{}",
            render_transcript(&entries)
        );
        let request = ChatRequest::generation(settings, vec![Message::user(prompt)])
            .with_temperature(0.3)
            .with_max_tokens(200);

        let outcome = self.gateway.chat(request).await;
        match outcome.content.filter(|_| outcome.success) {
            Some(note) => {
                let note = note.trim().to_string();
                if let Err(error) = self.store.append_bridge_note(role_id, &note, start) {
                    tracing::warn!("Failed to persist block note for '{}': {}", role_id, error);
                } else {
                    tracing::info!(
                        "Summarized closed block [{}, {}) for role '{}'",
                        start,
                        end,
                        role_id
                    );
                }
            }
            None => {
                tracing::warn!(
                    "Closed-block summarization failed for '{}': {}",
                    role_id,
                    outcome.error.as_deref().unwrap_or("no content")
                );
            }
        }
    }

    /// Rolling notes from previously closed blocks, oldest first.
    pub fn recent_block_notes(&self, role_id: &str) -> Result<Vec<String>> {
        self.store.recent_bridge_notes(role_id, BRIDGE_NOTE_LIMIT)
    }

    /// Whether enough messages have accumulated since the last core-memory
    /// distillation.
    pub fn should_summarize(&self, role_id: &str) -> Result<bool> {
        let count = self.store.message_count_since_summary(role_id)?;
        Ok(count >= self.config.memory.summary_threshold)
    }

    /// Distill the recent conversation into updated core memory. Returns
    /// `NoNeed` when the threshold is not reached, `Failed` on any AI or
    /// store error.
    pub async fn trigger_memory_summary(&self, role: &RoleProfile) -> SummaryOutcome {
        match self.should_summarize(&role.id) {
            Ok(true) => {}
            Ok(false) => return SummaryOutcome::NoNeed,
            Err(error) => {
                tracing::warn!("Summary gate check failed for '{}': {}", role.id, error);
                return SummaryOutcome::Failed;
            }
        }

        let window = self.config.memory.summary_threshold as usize;
        let entries = match self.store.short_term_tail(&role.id, window) {
            Ok(entries) => entries,
            Err(error) => {
                tracing::warn!("Summary read failed for '{}': {}", role.id, error);
                return SummaryOutcome::Failed;
            }
        };
        let existing = self.store.get_core_memory(&role.id).unwrap_or_default();

        let mut prompt = String::from(
            "You maintain the long-term memory of an AI companion. Merge the existing core \
memory with the recent conversation into an updated core memory: stable facts about the user, \
ongoing plans, relationship state. At most 100 words. Output only the memory text.\n",
        );
        if !existing.is_empty() {
            prompt.push_str(&format!("\nExisting core memory:\n{}\n", existing));
        }
        prompt.push_str(&format!(
            "\nRecent conversation:\n{}",
            render_transcript(&entries)
        ));

        let settings = AiSettings::resolve(Some(role), &self.config);
        let request = ChatRequest::generation(settings, vec![Message::user(prompt)])
            .with_temperature(0.3)
            .with_max_tokens(300);

        let outcome = self.gateway.chat(request).await;
        let Some(summary) = outcome.content.filter(|_| outcome.success) else {
            tracing::warn!(
                "Core-memory summarization failed for '{}': {}",
                role.id,
                outcome.error.as_deref().unwrap_or("no content")
            );
            return SummaryOutcome::Failed;
        };

        let summary = summary.trim().to_string();
        match self.store.update_core_memory(&role.id, &summary) {
            Ok(()) => {
                tracing::info!("Core memory updated for role '{}'", role.id);
                SummaryOutcome::Updated(summary)
            }
            Err(error) => {
                tracing::warn!("Failed to persist core memory for '{}': {}", role.id, error);
                SummaryOutcome::Failed
            }
        }
    }

    /// Whether the role has been silent long enough that an offline bridge
    /// narrative should cover the gap. A role that has never spoken counts
    /// as an unbounded gap.
    pub fn should_generate_bridge(&self, role_id: &str) -> Result<bool> {
        let Some(updated_at) = self.store.updated_at(role_id)? else {
            return Ok(true);
        };
        let gap = Utc::now().signed_duration_since(updated_at);
        Ok(gap.num_seconds() >= self.config.memory.bridge_gap_secs)
    }

    /// Have the character narrate what it did while the user was away, and
    /// weave the narrative into the short-term log as a tagged exchange.
    /// The model may answer "none" to skip uneventful gaps.
    pub async fn generate_bridge_memory(
        &self,
        role: &RoleProfile,
        incoming_message: &str,
    ) -> SummaryOutcome {
        match self.should_generate_bridge(&role.id) {
            Ok(true) => {}
            Ok(false) => return SummaryOutcome::NoNeed,
            Err(error) => {
                tracing::warn!("Bridge gate check failed for '{}': {}", role.id, error);
                return SummaryOutcome::Failed;
            }
        }

        let gap_minutes = match self.store.updated_at(&role.id) {
            Ok(Some(updated_at)) => Utc::now().signed_duration_since(updated_at).num_minutes(),
            _ => 0,
        };
        let recent = self.store.short_term_tail(&role.id, 10).unwrap_or_default();

        let prompt = format!(
            "You are {}. Your persona: {}\n\nAbout {} minutes have passed since the last \
exchange. The user is now saying: \"{}\"\n\nRecent conversation:\n{}\n\nWrite one short \
first-person narrative (at most 60 words) of something you plausibly did or felt during the \
gap, consistent with your persona and the conversation. If the gap needs no narrative, answer \
exactly: none",
            role.name,
            role.persona,
            gap_minutes.max(1),
            incoming_message,
            render_transcript(&recent)
        );

        let worker = self
            .roles
            .load(&self.config.workers.bridge_role_id)
            .ok()
            .flatten();
        let settings = AiSettings::resolve(worker.as_ref(), &self.config);
        let request = ChatRequest::generation(settings, vec![Message::user(prompt)])
            .with_temperature(0.7)
            .with_max_tokens(200);

        let outcome = self.gateway.chat(request).await;
        let Some(narrative) = outcome.content.filter(|_| outcome.success) else {
            tracing::warn!(
                "Bridge generation failed for '{}': {}",
                role.id,
                outcome.error.as_deref().unwrap_or("no content")
            );
            return SummaryOutcome::Failed;
        };

        let narrative = narrative.trim().to_string();
        if narrative.eq_ignore_ascii_case("none") {
            return SummaryOutcome::NoNeed;
        }

        let cue = format!(
            "{} {} minutes passed without messages. What were you up to?",
            MEMORY_EVENT_TAG,
            gap_minutes.max(1)
        );
        let persisted = self
            .store
            .append_short_term(&role.id, "user", &cue)
            .and_then(|_| self.store.append_short_term(&role.id, "assistant", &narrative));
        match persisted {
            Ok(()) => {
                tracing::info!("Bridge narrative woven for role '{}'", role.id);
                SummaryOutcome::Updated(narrative)
            }
            Err(error) => {
                tracing::warn!("Failed to persist bridge pair for '{}': {}", role.id, error);
                SummaryOutcome::Failed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::testing::StubChat;
    use crate::gateway::ChatOutcome;
    use chrono::Duration;
    use std::path::PathBuf;

    fn temp_db_path(name: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("companion_ctx_{}_{}.db", name, uuid::Uuid::new_v4()));
        path
    }

    struct Fixture {
        engine: ContextEngine,
        store: Arc<MemoryStore>,
        stub: Arc<StubChat>,
        _roles_dir: tempfile::TempDir,
    }

    fn fixture(name: &str, tune: impl FnOnce(&mut AppConfig)) -> Fixture {
        let roles_dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(
            MemoryStore::new(temp_db_path(name), roles_dir.path().to_path_buf()).expect("store"),
        );
        let roles = Arc::new(RoleStore::new(roles_dir.path().to_path_buf()));
        let stub = Arc::new(StubChat::new());
        let mut config = AppConfig::default();
        config.ai_api_url = "https://api.example".to_string();
        config.ai_api_key = Some("key".to_string());
        tune(&mut config);
        let engine = ContextEngine::new(
            Arc::clone(&store),
            roles,
            stub.clone() as Arc<dyn ChatApi>,
            Arc::new(config),
        );
        Fixture {
            engine,
            store,
            stub,
            _roles_dir: roles_dir,
        }
    }

    fn fill(store: &MemoryStore, role_id: &str, count: usize) {
        for i in 0..count {
            let speaker = if i % 2 == 0 { "user" } else { "assistant" };
            store
                .append_short_term(role_id, speaker, &format!("msg {}", i))
                .expect("append");
        }
    }

    #[test]
    fn block_math_restarts_every_limit_messages() {
        assert_eq!(context_block(0, 60), (0, 0));
        assert_eq!(context_block(1, 60), (0, 1));
        assert_eq!(context_block(60, 60), (0, 60));
        assert_eq!(context_block(61, 60), (60, 61));
        assert_eq!(context_block(120, 60), (60, 120));
        assert_eq!(context_block(121, 60), (120, 121));
    }

    #[tokio::test]
    async fn context_serves_only_the_current_block() {
        let f = fixture("window", |c| c.memory.context_window = 10);
        fill(&f.store, "r1", 23);

        let context = f.engine.get_context("r1").await.expect("context");
        assert_eq!(context.len(), 3);
        assert_eq!(context[0].content, "msg 20");
        assert_eq!(f.store.last_context_block_start("r1").expect("start"), 20);
    }

    #[tokio::test]
    async fn full_block_stays_served_until_exceeded() {
        let f = fixture("boundary", |c| c.memory.context_window = 10);
        fill(&f.store, "r1", 10);

        let context = f.engine.get_context("r1").await.expect("context");
        assert_eq!(context.len(), 10);
        assert_eq!(f.store.last_context_block_start("r1").expect("start"), 0);
    }

    #[tokio::test]
    async fn closed_block_note_is_recorded() {
        let f = fixture("note", |c| c.memory.context_window = 10);
        fill(&f.store, "r1", 12);
        f.stub.push(ChatOutcome::ok("they planned a picnic"));

        f.engine.summarize_closed_block("r1", 0, 10).await;

        let notes = f.engine.recent_block_notes("r1").expect("notes");
        assert_eq!(notes, vec!["they planned a picnic".to_string()]);
        assert_eq!(f.stub.call_count(), 1);
    }

    #[tokio::test]
    async fn closed_block_failure_leaves_no_note() {
        let f = fixture("note_fail", |c| c.memory.context_window = 10);
        fill(&f.store, "r1", 12);
        f.stub.push(ChatOutcome::failure("boom"));

        f.engine.summarize_closed_block("r1", 0, 10).await;

        assert!(f.engine.recent_block_notes("r1").expect("notes").is_empty());
    }

    #[tokio::test]
    async fn summary_below_threshold_is_noneed_without_ai_call() {
        let f = fixture("gate", |c| c.memory.summary_threshold = 5);
        fill(&f.store, "r1", 3);

        let role = RoleProfile::new("r1", "Mia");
        let outcome = f.engine.trigger_memory_summary(&role).await;
        assert_eq!(outcome, SummaryOutcome::NoNeed);
        assert_eq!(f.stub.call_count(), 0);
    }

    #[tokio::test]
    async fn summary_at_threshold_updates_core_and_resets_counter() {
        let f = fixture("summary", |c| c.memory.summary_threshold = 4);
        fill(&f.store, "r1", 4);
        f.stub.push(ChatOutcome::ok("User likes rainy mornings."));

        let role = RoleProfile::new("r1", "Mia");
        let outcome = f.engine.trigger_memory_summary(&role).await;
        assert_eq!(
            outcome,
            SummaryOutcome::Updated("User likes rainy mornings.".to_string())
        );
        assert_eq!(
            f.store.get_core_memory("r1").expect("core"),
            "User likes rainy mornings."
        );
        assert_eq!(f.store.message_count_since_summary("r1").expect("count"), 0);
    }

    #[tokio::test]
    async fn summary_ai_failure_leaves_state_untouched() {
        let f = fixture("summary_fail", |c| c.memory.summary_threshold = 4);
        fill(&f.store, "r1", 4);
        f.stub.push(ChatOutcome::failure("timeout"));

        let role = RoleProfile::new("r1", "Mia");
        let outcome = f.engine.trigger_memory_summary(&role).await;
        assert_eq!(outcome, SummaryOutcome::Failed);
        assert_eq!(f.store.get_core_memory("r1").expect("core"), "");
        assert_eq!(f.store.message_count_since_summary("r1").expect("count"), 4);
    }

    #[tokio::test]
    async fn bridge_gate_opens_on_gap_or_missing_history() {
        let f = fixture("bridge_gate", |c| c.memory.bridge_gap_secs = 600);

        // Never spoken: unbounded gap.
        assert!(f.engine.should_generate_bridge("r1").expect("gate"));

        // An append closes the gate immediately.
        f.store.append_short_term("r1", "user", "hi").expect("append");
        assert!(!f.engine.should_generate_bridge("r1").expect("gate"));

        // Backdate the last activity past the gap.
        let mut record = f.store.load("r1").expect("load");
        record.updated_at = Some(Utc::now() - Duration::seconds(900));
        f.store.save("r1", &record).expect("save");
        assert!(f.engine.should_generate_bridge("r1").expect("gate"));
    }

    #[tokio::test]
    async fn bridge_none_answer_appends_nothing() {
        let f = fixture("bridge_none", |c| c.memory.bridge_gap_secs = 600);
        f.store.append_short_term("r1", "user", "hi").expect("append");
        let mut record = f.store.load("r1").expect("load");
        record.updated_at = Some(Utc::now() - Duration::seconds(900));
        f.store.save("r1", &record).expect("save");

        f.stub.push(ChatOutcome::ok("None"));

        let role = RoleProfile::new("r1", "Mia");
        let outcome = f.engine.generate_bridge_memory(&role, "back!").await;
        assert_eq!(outcome, SummaryOutcome::NoNeed);
        assert_eq!(f.store.short_term_len("r1").expect("len"), 1);
    }

    #[tokio::test]
    async fn bridge_narrative_is_woven_as_tagged_pair() {
        let f = fixture("bridge_pair", |c| c.memory.bridge_gap_secs = 600);
        f.store.append_short_term("r1", "user", "hi").expect("append");
        let mut record = f.store.load("r1").expect("load");
        record.updated_at = Some(Utc::now() - Duration::seconds(900));
        f.store.save("r1", &record).expect("save");

        f.stub
            .push(ChatOutcome::ok("I reread our old messages and smiled."));

        let role = RoleProfile::new("r1", "Mia");
        let outcome = f.engine.generate_bridge_memory(&role, "back!").await;
        assert_eq!(
            outcome,
            SummaryOutcome::Updated("I reread our old messages and smiled.".to_string())
        );

        let record = f.store.load("r1").expect("load");
        assert_eq!(record.short_term.len(), 3);
        assert_eq!(record.short_term[1].role, "user");
        assert!(record.short_term[1].content.starts_with(MEMORY_EVENT_TAG));
        assert_eq!(record.short_term[2].role, "assistant");
        assert_eq!(
            record.short_term[2].content,
            "I reread our old messages and smiled."
        );
    }

    #[tokio::test]
    async fn bridge_below_gap_skips_without_ai_call() {
        let f = fixture("bridge_skip", |c| c.memory.bridge_gap_secs = 600);
        f.store.append_short_term("r1", "user", "hi").expect("append");

        let role = RoleProfile::new("r1", "Mia");
        let outcome = f.engine.generate_bridge_memory(&role, "hello").await;
        assert_eq!(outcome, SummaryOutcome::NoNeed);
        assert_eq!(f.stub.call_count(), 0);
    }
}
