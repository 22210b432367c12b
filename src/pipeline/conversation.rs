//! Per-user conversation state.

use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use crate::llm::ChatMessage;

/// One exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn {
    /// What the user said (wake phrase removed).
    pub input: String,
    /// What was answered.
    pub response: String,
    /// When the turn completed.
    pub at: DateTime<Utc>,
}

/// History and timing for one user's session.
#[derive(Debug, Clone)]
pub struct ConversationContext {
    session_id: Uuid,
    created_at: DateTime<Utc>,
    last_active: DateTime<Utc>,
    turns: Vec<Turn>,
}

impl ConversationContext {
    /// A fresh session starting at `now`.
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            created_at: now,
            last_active: now,
            turns: Vec::new(),
        }
    }

    /// Session identifier.
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// When the session started.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Last activity.
    pub fn last_active(&self) -> DateTime<Utc> {
        self.last_active
    }

    /// Recorded turns, oldest first.
    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    /// Whether `now` is still inside the session window.
    pub fn is_open(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        let idle = now.signed_duration_since(self.last_active);
        idle.to_std().map_or(true, |idle| idle < timeout)
    }

    /// Mark activity at `now`.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        if now > self.last_active {
            self.last_active = now;
        }
    }

    /// Start over when the window has lapsed. Returns `true` if it did.
    pub fn renew_if_expired(&mut self, now: DateTime<Utc>, timeout: Duration) -> bool {
        if self.is_open(now, timeout) {
            return false;
        }
        *self = Self::new(now);
        true
    }

    /// Append a turn, keeping at most `max_turns` (0 keeps everything).
    pub fn record(&mut self, turn: Turn, max_turns: usize) {
        self.touch(turn.at);
        self.turns.push(turn);
        if max_turns > 0 && self.turns.len() > max_turns {
            let excess = self.turns.len() - max_turns;
            self.turns.drain(..excess);
        }
    }

    /// Messages for the next request: system prompt, history, then `input`.
    pub fn messages(&self, system_prompt: &str, input: &str) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(self.turns.len() * 2 + 2);
        if !system_prompt.trim().is_empty() {
            messages.push(ChatMessage::system(system_prompt));
        }
        for turn in &self.turns {
            messages.push(ChatMessage::user(turn.input.clone()));
            messages.push(ChatMessage::assistant(turn.response.clone()));
        }
        messages.push(ChatMessage::user(input));
        messages
    }
}

/// Conversations for every user.
///
/// Entries are only touched inside short synchronous sections; a turn takes a
/// snapshot with [`ConversationStore::begin_turn`], talks to the backend with
/// no lock held, then appends with [`ConversationStore::record`].
#[derive(Debug)]
pub struct ConversationStore {
    contexts: DashMap<String, ConversationContext>,
    timeout: Duration,
    max_turns: usize,
}

impl ConversationStore {
    /// Store with the given open window and history limit.
    pub fn new(timeout: Duration, max_turns: usize) -> Self {
        Self {
            contexts: DashMap::new(),
            timeout,
            max_turns,
        }
    }

    /// Open window.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// History limit.
    pub fn max_turns(&self) -> usize {
        self.max_turns
    }

    /// Copy of the context for `user_id`, if one exists.
    pub fn snapshot(&self, user_id: &str) -> Option<ConversationContext> {
        self.contexts.get(user_id).map(|c| c.value().clone())
    }

    /// Whether `user_id` has an open conversation at `now`.
    pub fn is_open(&self, user_id: &str, now: DateTime<Utc>) -> bool {
        self.contexts
            .get(user_id)
            .is_some_and(|c| c.is_open(now, self.timeout))
    }

    /// Open (or extend) the conversation for `user_id`.
    pub fn open(&self, user_id: &str, now: DateTime<Utc>) -> Uuid {
        let mut ctx = self.entry(user_id, now);
        ctx.renew_if_expired(now, self.timeout);
        ctx.touch(now);
        ctx.session_id()
    }

    /// Start a turn: renew a lapsed session, mark activity and build the
    /// request messages from the current history.
    pub fn begin_turn(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
        system_prompt: &str,
        input: &str,
    ) -> (Uuid, Vec<ChatMessage>) {
        let mut ctx = self.entry(user_id, now);
        if ctx.renew_if_expired(now, self.timeout) {
            tracing::debug!(session = %ctx.session_id(), "new conversation session");
        }
        ctx.touch(now);
        (ctx.session_id(), ctx.messages(system_prompt, input))
    }

    /// Append `turn` to `session`. Returns the history length, or `None` when
    /// the user has moved on to another session since the turn began.
    pub fn record(&self, user_id: &str, session: Uuid, turn: Turn) -> Option<usize> {
        let mut ctx = self.contexts.get_mut(user_id)?;
        if ctx.session_id() != session {
            return None;
        }
        ctx.record(turn, self.max_turns);
        Some(ctx.turns().len())
    }

    /// Number of users with a context.
    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    /// Whether no context exists.
    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    fn entry(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> dashmap::mapref::one::RefMut<'_, String, ConversationContext> {
        self.contexts
            .entry(user_id.to_owned())
            .or_insert_with(|| ConversationContext::new(now))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::llm::Role;

    fn turn(n: usize, at: DateTime<Utc>) -> Turn {
        Turn {
            input: format!("q{n}"),
            response: format!("a{n}"),
            at,
        }
    }

    #[test]
    fn history_trims_oldest_first() {
        let now = Utc::now();
        let mut ctx = ConversationContext::new(now);
        for n in 0..5 {
            ctx.record(turn(n, now), 3);
        }
        let inputs: Vec<_> = ctx.turns().iter().map(|t| t.input.as_str()).collect();
        assert_eq!(inputs, vec!["q2", "q3", "q4"]);
    }

    #[test]
    fn messages_interleave_history() {
        let now = Utc::now();
        let mut ctx = ConversationContext::new(now);
        ctx.record(turn(1, now), 0);
        let msgs = ctx.messages("be brief", "next");
        let roles: Vec<_> = msgs.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::System, Role::User, Role::Assistant, Role::User]);
        assert_eq!(msgs[3].content.as_deref(), Some("next"));
        assert_eq!(ctx.messages("", "x").len(), 3);
    }

    #[test]
    fn window_expires_and_renews() {
        let start = Utc::now();
        let timeout = Duration::from_secs(30);
        let mut ctx = ConversationContext::new(start);
        let first = ctx.session_id();
        assert!(ctx.is_open(start + chrono::Duration::seconds(29), timeout));
        assert!(!ctx.is_open(start + chrono::Duration::seconds(30), timeout));

        assert!(!ctx.renew_if_expired(start + chrono::Duration::seconds(10), timeout));
        assert!(ctx.renew_if_expired(start + chrono::Duration::seconds(90), timeout));
        assert_ne!(ctx.session_id(), first);
    }

    #[test]
    fn store_tracks_open_conversations() {
        let store = ConversationStore::new(Duration::from_secs(60), 4);
        let now = Utc::now();
        assert!(!store.is_open("42", now));
        let id = store.open("42", now);
        assert!(store.is_open("42", now));
        assert_eq!(store.open("42", now), id);
        assert!(!store.is_open("42", now + chrono::Duration::seconds(61)));
    }

    #[test]
    fn turn_is_recorded_against_its_session() {
        let store = ConversationStore::new(Duration::from_secs(60), 2);
        let now = Utc::now();
        let (session, messages) = store.begin_turn("42", now, "sys", "first");
        assert_eq!(messages.len(), 2);
        assert!(store.is_open("42", now), "begin_turn marks activity");

        assert_eq!(store.record("42", session, turn(1, now)), Some(1));
        let (_, messages) = store.begin_turn("42", now, "sys", "second");
        assert_eq!(messages.len(), 4, "history is replayed");
    }

    #[test]
    fn turn_from_a_lapsed_session_is_not_recorded() {
        let store = ConversationStore::new(Duration::from_secs(60), 0);
        let now = Utc::now();
        let (stale, _) = store.begin_turn("42", now, "", "hello");
        let later = now + chrono::Duration::seconds(120);
        let fresh = store.open("42", later);
        assert_ne!(fresh, stale);

        assert_eq!(store.record("42", stale, turn(1, later)), None);
        assert!(store.snapshot("42").unwrap().turns().is_empty());
        assert_eq!(store.record("nobody", fresh, turn(2, later)), None);
    }
}
