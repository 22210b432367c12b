//! The voice processor.
//!
//! Frames arrive tagged by source (SSRC). Each source gets a worker task that
//! owns its segmenter; frames reach it through a bounded queue so ingestion
//! never waits. Closed segments are transcribed on their own tasks, gated on
//! the wake phrase, and answered through the reasoning backend, optionally
//! looping through tool calls, before the reply is synthesized and played.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::artifacts::{ArtifactRecord, ArtifactStore};
use crate::audio;
use crate::config::{BridgeConfig, VadConfig};
use crate::identity::IdentityResolver;
use crate::llm::{ChatMessage, ReasoningBackend, ReasoningRequest, ToolDefinition};
use crate::pipeline::conversation::{ConversationStore, Turn};
use crate::pipeline::messages::{SegmentJob, SynthesizedAudio};
use crate::pipeline::registry::{Frame, NewStream, SpeakerRegistry};
use crate::stt::Transcriber;
use crate::tools::ToolSessionPool;
use crate::transport::{AudioSink, VoiceEvent, VoiceEventHandler};
use crate::tts::Synthesizer;
use crate::vad::Segmenter;
use crate::wake::{GateDecision, WakeGate};

/// External collaborators of the processor.
pub struct ProcessorDeps {
    /// Shared identity cache.
    pub identity: Arc<IdentityResolver>,
    /// Speech-to-text.
    pub transcriber: Arc<dyn Transcriber>,
    /// Reasoning backend.
    pub reasoning: Arc<dyn ReasoningBackend>,
    /// Text-to-speech; `None` replies in text only (logged).
    pub synthesizer: Option<Arc<dyn Synthesizer>>,
    /// Playback.
    pub sink: Arc<dyn AudioSink>,
    /// Connected tool sessions, if any.
    pub tools: Option<Arc<ToolSessionPool>>,
    /// Segment persistence, if enabled.
    pub artifacts: Option<ArtifactStore>,
}

#[derive(Debug, Clone, Default)]
struct ChannelInfo {
    guild_id: String,
    channel_id: String,
}

struct Inner {
    identity: Arc<IdentityResolver>,
    transcriber: Arc<dyn Transcriber>,
    reasoning: Arc<dyn ReasoningBackend>,
    synthesizer: Option<Arc<dyn Synthesizer>>,
    sink: Arc<dyn AudioSink>,
    tools: Option<Arc<ToolSessionPool>>,
    artifacts: Option<ArtifactStore>,

    registry: SpeakerRegistry,
    conversations: ConversationStore,
    wake: WakeGate,
    allowed: HashSet<String>,
    channel: RwLock<ChannelInfo>,

    vad: VadConfig,
    sample_rate: u32,
    channels: u16,
    queue_capacity: usize,
    idle_flush: Duration,
    system_prompt: String,
    max_tool_rounds: usize,

    cancel: CancellationToken,
    tracker: TaskTracker,
}

/// Central state machine from frames to spoken replies.
#[derive(Clone)]
pub struct VoiceProcessor {
    inner: Arc<Inner>,
}

impl VoiceProcessor {
    /// Build a processor. Work stops when `cancel` fires.
    pub fn new(config: &BridgeConfig, deps: ProcessorDeps, cancel: CancellationToken) -> Self {
        let allowed = config
            .discord
            .allowed_user_ids
            .iter()
            .map(|id| id.trim().to_owned())
            .filter(|id| !id.is_empty())
            .collect();

        let inner = Inner {
            identity: deps.identity,
            transcriber: deps.transcriber,
            reasoning: deps.reasoning,
            synthesizer: deps.synthesizer,
            sink: deps.sink,
            tools: deps.tools,
            artifacts: deps.artifacts,
            registry: SpeakerRegistry::new(),
            conversations: ConversationStore::new(
                Duration::from_secs(config.wake.session_timeout_secs),
                config.llm.max_history_turns,
            ),
            wake: WakeGate::new(&config.wake),
            allowed,
            channel: RwLock::new(ChannelInfo {
                guild_id: config.discord.guild_id.clone(),
                channel_id: config.discord.voice_channel_id.clone(),
            }),
            vad: config.vad.clone(),
            sample_rate: config.audio.sample_rate,
            channels: config.audio.channels,
            queue_capacity: config.runtime.frame_queue_capacity,
            idle_flush: Duration::from_millis(u64::from(config.vad.idle_flush_ms.max(1))),
            system_prompt: config.llm.system_prompt.clone(),
            max_tool_rounds: config.llm.max_tool_rounds,
            cancel,
            tracker: TaskTracker::new(),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Whether `user_id` passes the allow-list. An empty list permits everyone.
    pub fn permits(&self, user_id: &str) -> bool {
        self.inner.permits(user_id)
    }

    /// Number of live speaker streams.
    pub fn active_speakers(&self) -> usize {
        self.inner.registry.len()
    }

    /// Conversation state, for inspection.
    pub fn conversations(&self) -> &ConversationStore {
        &self.inner.conversations
    }

    /// Apply an identity or session-state event. Unknown or repeated
    /// mappings are tolerated.
    pub fn handle_identity_event(&self, event: VoiceEvent) {
        let inner = &self.inner;
        match event {
            VoiceEvent::Ready {
                guild_id,
                channel_id,
            } => {
                info!(guild = %guild_id, channel = %channel_id, "voice transport ready");
                let mut channel = inner
                    .channel
                    .write()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                if !guild_id.is_empty() {
                    channel.guild_id = guild_id;
                }
                if !channel_id.is_empty() {
                    channel.channel_id = channel_id;
                }
            }
            VoiceEvent::Speaking { ssrc, user_id } => {
                if inner.identity.upsert_speaker(ssrc, &user_id) {
                    debug!(ssrc, user = %user_id, "speaker mapped");
                }
            }
            VoiceEvent::ClientDisconnect { user_id } => {
                let tags = inner.identity.forget_user(&user_id);
                for ssrc in &tags {
                    inner.registry.remove(*ssrc);
                }
                debug!(user = %user_id, streams = tags.len(), "client disconnected");
            }
            VoiceEvent::Members { members } => {
                debug!(count = members.len(), "membership seeded");
                inner.identity.seed_from_membership(&members);
            }
            VoiceEvent::GuildName { id, name } => inner.identity.set_guild_name(&id, &name),
            VoiceEvent::ChannelName { id, name } => inner.identity.set_channel_name(&id, &name),
            VoiceEvent::Frame { ssrc, pcm } => {
                self.process_frame(ssrc, pcm);
            }
        }
    }

    /// Queue one frame for its speaker. Never blocks.
    ///
    /// Returns `false` when the frame was discarded: shutdown in progress,
    /// the resolved user is outside the allow-list, or the speaker's queue
    /// is full.
    pub fn process_frame(&self, ssrc: u32, pcm: Frame) -> bool {
        let inner = &self.inner;
        if inner.cancel.is_cancelled() {
            return false;
        }
        if let Some(user) = inner.identity.resolve_user(ssrc)
            && !inner.permits(&user)
        {
            debug!(ssrc, user = %user, "frame from user outside allow-list; discarded");
            return false;
        }

        let mut pcm = pcm;
        // A worker that just went idle closes its queue; one retry creates
        // the replacement stream.
        for _ in 0..2 {
            let (tx, created) = inner.registry.sender_or_insert(ssrc, inner.queue_capacity);
            if let Some(stream) = created {
                self.spawn_speaker(ssrc, stream);
            }
            match tx.try_send(pcm) {
                Ok(()) => return true,
                Err(TrySendError::Full(_)) => {
                    debug!(ssrc, "speaker queue full; frame dropped");
                    return false;
                }
                Err(TrySendError::Closed(returned)) => pcm = returned,
            }
        }
        debug!(ssrc, "speaker stream unavailable; frame dropped");
        false
    }

    fn spawn_speaker(&self, ssrc: u32, stream: NewStream) {
        let inner = Arc::clone(&self.inner);
        let span = info_span!("speaker", ssrc, generation = stream.generation);
        debug!(ssrc, "speaker stream created");
        self.inner
            .tracker
            .spawn(run_speaker(inner, ssrc, stream).instrument(span));
    }

    /// Answer `text` for `user_id`: reason (with tool rounds), record the
    /// turn, then synthesize and play the reply.
    ///
    /// Returns the reply text, or `None` when the turn failed or produced
    /// nothing.
    pub async fn run_turn(&self, user_id: &str, text: &str) -> Option<String> {
        Arc::clone(&self.inner).run_turn(user_id, text).await
    }

    /// Stop accepting frames and wait up to `grace` for in-flight work.
    ///
    /// Returns `false` when the grace period ran out first.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        let inner = &self.inner;
        inner.cancel.cancel();
        inner.registry.clear();
        inner.tracker.close();
        match tokio::time::timeout(grace, inner.tracker.wait()).await {
            Ok(()) => {
                info!("voice processor drained");
                true
            }
            Err(_) => {
                warn!(
                    pending = inner.tracker.len(),
                    grace_ms = grace.as_millis() as u64,
                    "drain exceeded grace period; proceeding"
                );
                false
            }
        }
    }
}

impl VoiceEventHandler for VoiceProcessor {
    fn handle_event(&self, event: VoiceEvent) {
        self.handle_identity_event(event);
    }
}

/// Per-speaker worker: owns the segmenter until idle, teardown or shutdown.
async fn run_speaker(inner: Arc<Inner>, ssrc: u32, stream: NewStream) {
    let NewStream { generation, mut rx } = stream;
    let mut state = SpeakerState {
        segmenter: Segmenter::new(&inner.vad, inner.sample_rate),
        started_at: Utc::now(),
        user: inner.identity.resolve_user(ssrc),
    };

    loop {
        let next = tokio::select! {
            () = inner.cancel.cancelled() => {
                debug!("shutdown; abandoning in-flight segment");
                return;
            }
            next = tokio::time::timeout(inner.idle_flush, rx.recv()) => next,
        };
        match next {
            Ok(Some(pcm)) => inner.feed(ssrc, &mut state, &pcm),
            // Removed from the registry.
            Ok(None) => break,
            Err(_) => {
                if inner.registry.evict(ssrc, generation) {
                    debug!("speaker idle; evicted");
                }
                break;
            }
        }
    }

    rx.close();
    while let Ok(pcm) = rx.try_recv() {
        inner.feed(ssrc, &mut state, &pcm);
    }
    if let Some(segment) = state.segmenter.flush() {
        let job = state.job(ssrc, &inner, segment);
        inner.dispatch(job);
    }
    debug!("speaker stream closed");
}

struct SpeakerState {
    segmenter: Segmenter,
    started_at: DateTime<Utc>,
    /// Provisional identity; refreshed from the resolver on every frame.
    user: Option<String>,
}

impl SpeakerState {
    fn job(
        &self,
        ssrc: u32,
        inner: &Inner,
        segment: crate::pipeline::messages::SpeechSegment,
    ) -> SegmentJob {
        let started_at = chrono::Duration::from_std(segment.start_offset)
            .map_or(self.started_at, |offset| self.started_at + offset);
        SegmentJob {
            ssrc,
            user_id: inner.identity.resolve_user(ssrc).or_else(|| self.user.clone()),
            started_at,
            segment,
        }
    }
}

impl Inner {
    fn permits(&self, user_id: &str) -> bool {
        self.allowed.is_empty() || self.allowed.contains(user_id)
    }

    fn feed(self: &Arc<Self>, ssrc: u32, state: &mut SpeakerState, pcm: &[i16]) {
        if let Some(user) = self.identity.resolve_user(ssrc) {
            state.user = Some(user);
        }
        if let Some(user) = &state.user
            && !self.permits(user)
        {
            return;
        }
        let mono = audio::downmix_to_mono(pcm, self.channels);
        for segment in state.segmenter.process(&mono) {
            let job = state.job(ssrc, self, segment);
            self.dispatch(job);
        }
    }

    fn dispatch(self: &Arc<Self>, job: SegmentJob) {
        debug!(
            ssrc = job.ssrc,
            duration_ms = job.segment.duration().as_millis() as u64,
            end = ?job.segment.end,
            "segment closed"
        );
        let inner = Arc::clone(self);
        let span = info_span!("segment", ssrc = job.ssrc);
        self.tracker
            .spawn(async move { inner.handle_segment(job).await }.instrument(span));
    }

    async fn handle_segment(self: Arc<Self>, job: SegmentJob) {
        let Some(user) = job
            .user_id
            .clone()
            .or_else(|| self.identity.resolve_user(job.ssrc))
        else {
            debug!("segment from unresolved source; dropped");
            return;
        };
        if !self.permits(&user) {
            debug!(user = %user, "segment from user outside allow-list; dropped");
            return;
        }

        let text = match self.transcriber.transcribe(&job.segment).await {
            Ok(text) => text,
            Err(e) => {
                warn!(user = %user, error = %e, "transcription failed; segment skipped");
                return;
            }
        };
        self.persist(&user, &text, &job).await;
        if text.is_empty() {
            debug!(user = %user, "empty transcript");
            return;
        }

        let now = Utc::now();
        let open = self.conversations.is_open(&user, now);
        match self.wake.evaluate(&text, open) {
            GateDecision::Drop => {}
            GateDecision::Wake { text, score } if text.is_empty() => {
                let session = self.conversations.open(&user, now);
                info!(user = %user, score, session = %session, "conversation opened");
            }
            GateDecision::Wake { text, .. } | GateDecision::Continue { text } => {
                self.run_turn(&user, &text).await;
            }
        }
    }

    async fn persist(&self, user: &str, transcript: &str, job: &SegmentJob) {
        let Some(store) = self.artifacts.clone() else {
            return;
        };
        let (guild_id, channel_id) = {
            let channel = self
                .channel
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            (channel.guild_id.clone(), channel.channel_id.clone())
        };
        let record = ArtifactRecord {
            user_id: user.to_owned(),
            guild_id,
            channel_id,
            transcript: transcript.to_owned(),
            started_at: job.started_at,
            duration_ms: job.segment.duration().as_millis() as u64,
            sample_rate: job.segment.sample_rate,
            audio_path: None,
        };
        let samples = job.segment.samples.clone();
        match tokio::task::spawn_blocking(move || store.save(record, &samples)).await {
            Ok(Ok(saved)) => debug!(path = %saved.sidecar.display(), "segment persisted"),
            Ok(Err(e)) => warn!(error = %e, "failed to persist segment"),
            Err(e) => warn!(error = %e, "persist task failed"),
        }
    }

    async fn run_turn(self: Arc<Self>, user: &str, text: &str) -> Option<String> {
        if self.cancel.is_cancelled() {
            return None;
        }
        let span = info_span!("turn", user = %user);
        let reply = self.reason(user, text).instrument(span.clone()).await?;
        self.speak(user, &reply).instrument(span).await;
        Some(reply)
    }

    async fn reason(&self, user: &str, text: &str) -> Option<String> {
        let (session, mut messages) =
            self.conversations.begin_turn(user, Utc::now(), &self.system_prompt, text);
        let tools = self.tool_definitions().await;
        let mut rounds = 0usize;

        let reply = loop {
            let mut request = ReasoningRequest::new(messages.clone());
            request.tools = tools.clone();
            let response = match self.reasoning.complete(request).await {
                Ok(response) => response,
                Err(e) => {
                    warn!(
                        kind = ?e.kind,
                        code = e.code,
                        error = %e,
                        "reasoning failed; turn dropped"
                    );
                    return None;
                }
            };
            if response.used_fallback {
                info!(model = %response.model, "answered by fallback model");
            }

            let pool = match &self.tools {
                Some(pool) if !response.tool_calls.is_empty() => pool,
                _ => break response.content,
            };
            if rounds >= self.max_tool_rounds {
                warn!(rounds, "tool round limit reached");
                break response.content;
            }
            rounds += 1;

            let content = (!response.content.is_empty()).then(|| response.content.clone());
            messages.push(ChatMessage::assistant_tool_calls(
                content,
                response.tool_calls.clone(),
            ));
            for call in response.tool_calls {
                let output = match pool.call(&call.name, &call.arguments).await {
                    Ok(out) if out.is_error => format!("tool error: {}", out.text),
                    Ok(out) => out.text,
                    Err(e) => {
                        warn!(tool = %call.name, error = %e, "tool call failed");
                        format!("tool error: {e}")
                    }
                };
                debug!(tool = %call.name, round = rounds, "tool call completed");
                messages.push(ChatMessage::tool_result(call.id, output));
            }
        };

        let reply = reply.trim().to_owned();
        if reply.is_empty() {
            debug!("empty reply");
            return None;
        }
        let turn = Turn {
            input: text.to_owned(),
            response: reply.clone(),
            at: Utc::now(),
        };
        match self.conversations.record(user, session, turn) {
            Some(turns) => info!(session = %session, turns, "turn complete"),
            None => debug!(session = %session, "session lapsed during turn; not recorded"),
        }
        Some(reply)
    }

    async fn tool_definitions(&self) -> Vec<ToolDefinition> {
        match &self.tools {
            Some(pool) if !pool.is_empty() => pool.tool_definitions().await,
            _ => Vec::new(),
        }
    }

    async fn speak(&self, user: &str, reply: &str) {
        let Some(synthesizer) = &self.synthesizer else {
            info!(reply = %reply, "no synthesizer configured; reply not spoken");
            return;
        };
        let audio = match synthesizer.synthesize(reply).await {
            Ok(bytes) => SynthesizedAudio {
                bytes,
                user_id: user.to_owned(),
            },
            Err(e) => {
                warn!(error = %e, "synthesis failed; no audio");
                return;
            }
        };
        if let Err(e) = self.sink.play(audio.bytes).await {
            warn!(user = %audio.user_id, error = %e, "playback failed");
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::error::{BridgeError, Result};
    use crate::llm::{ReasoningError, ReasoningResponse, Role, ToolCall};
    use crate::pipeline::messages::SpeechSegment;
    use crate::tools::session::tests::{FakeConnector, FakeServer, server_config, settings};
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct FixedTranscriber(String);

    #[async_trait]
    impl Transcriber for FixedTranscriber {
        async fn transcribe(&self, _segment: &SpeechSegment) -> Result<String> {
            Ok(self.0.clone())
        }
    }

    #[derive(Default)]
    struct ScriptedReasoning {
        replies: Mutex<Vec<ReasoningResponse>>,
        requests: Mutex<Vec<ReasoningRequest>>,
    }

    impl ScriptedReasoning {
        fn new(mut replies: Vec<ReasoningResponse>) -> Self {
            replies.reverse();
            Self {
                replies: Mutex::new(replies),
                requests: Mutex::default(),
            }
        }
    }

    #[async_trait]
    impl ReasoningBackend for ScriptedReasoning {
        async fn complete(
            &self,
            request: ReasoningRequest,
        ) -> std::result::Result<ReasoningResponse, ReasoningError> {
            self.requests.lock().unwrap().push(request);
            self.replies
                .lock()
                .unwrap()
                .pop()
                .ok_or_else(|| ReasoningError::from_status(500, "script exhausted"))
        }
    }

    struct EchoSynth;

    #[async_trait]
    impl Synthesizer for EchoSynth {
        async fn synthesize(&self, text: &str) -> Result<Vec<u8>> {
            Ok(text.as_bytes().to_vec())
        }
    }

    struct FailingSynth;

    #[async_trait]
    impl Synthesizer for FailingSynth {
        async fn synthesize(&self, _text: &str) -> Result<Vec<u8>> {
            Err(BridgeError::Tts("down".into()))
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        played: Mutex<Vec<Vec<u8>>>,
    }

    #[async_trait]
    impl AudioSink for RecordingSink {
        async fn play(&self, audio: Vec<u8>) -> Result<()> {
            self.played.lock().unwrap().push(audio);
            Ok(())
        }
    }

    fn reply(content: &str) -> ReasoningResponse {
        ReasoningResponse {
            id: "r".into(),
            model: "m".into(),
            content: content.into(),
            tool_calls: Vec::new(),
            used_fallback: false,
        }
    }

    fn config() -> BridgeConfig {
        let mut config = BridgeConfig::default();
        config.discord.guild_id = "g".into();
        config.discord.voice_channel_id = "c".into();
        config.audio.channels = 1;
        config.audio.sample_rate = 16_000;
        config.vad.hang_ms = 200;
        config.vad.min_speech_ms = 100;
        config.vad.idle_flush_ms = 5_000;
        config.llm.system_prompt = "be brief".into();
        config
    }

    struct Harness {
        processor: VoiceProcessor,
        identity: Arc<IdentityResolver>,
        reasoning: Arc<ScriptedReasoning>,
        sink: Arc<RecordingSink>,
    }

    fn harness(
        config: &BridgeConfig,
        transcript: &str,
        replies: Vec<ReasoningResponse>,
        synthesizer: Option<Arc<dyn Synthesizer>>,
        tools: Option<Arc<ToolSessionPool>>,
    ) -> Harness {
        let identity = Arc::new(IdentityResolver::new());
        let reasoning = Arc::new(ScriptedReasoning::new(replies));
        let sink = Arc::new(RecordingSink::default());
        let processor = VoiceProcessor::new(
            config,
            ProcessorDeps {
                identity: Arc::clone(&identity),
                transcriber: Arc::new(FixedTranscriber(transcript.into())),
                reasoning: Arc::clone(&reasoning) as Arc<dyn ReasoningBackend>,
                synthesizer,
                sink: Arc::clone(&sink) as Arc<dyn AudioSink>,
                tools,
                artifacts: None,
            },
            CancellationToken::new(),
        );
        Harness {
            processor,
            identity,
            reasoning,
            sink,
        }
    }

    /// 20 ms of mono audio at 16 kHz.
    fn frame(amplitude: i16) -> Vec<i16> {
        vec![amplitude; 320]
    }

    fn speak_then_pause(h: &Harness, ssrc: u32) {
        for _ in 0..25 {
            assert!(h.processor.process_frame(ssrc, frame(8_000)));
        }
        for _ in 0..15 {
            h.processor.process_frame(ssrc, frame(0));
        }
    }

    async fn wait_for_playback(sink: &RecordingSink) -> Vec<Vec<u8>> {
        for _ in 0..200 {
            let played = sink.played.lock().unwrap().clone();
            if !played.is_empty() {
                return played;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        Vec::new()
    }

    #[tokio::test]
    async fn frames_from_disallowed_user_are_discarded_before_segmentation() {
        let mut cfg = config();
        cfg.discord.allowed_user_ids = vec!["42".into()];
        let h = harness(&cfg, "hey atlas hi", vec![], None, None);
        h.identity.upsert_speaker(5, "99");

        assert!(!h.processor.process_frame(5, frame(8_000)));
        assert_eq!(h.processor.active_speakers(), 0);

        h.identity.upsert_speaker(6, "42");
        assert!(h.processor.process_frame(6, frame(8_000)));
        assert_eq!(h.processor.active_speakers(), 1);
        h.processor.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn wake_phrase_turn_reaches_playback() {
        let h = harness(
            &config(),
            "hey atlas what's the weather",
            vec![reply("sunny")],
            Some(Arc::new(EchoSynth)),
            None,
        );
        h.processor.handle_event(VoiceEvent::Speaking {
            ssrc: 1,
            user_id: "42".into(),
        });
        speak_then_pause(&h, 1);

        let played = wait_for_playback(&h.sink).await;
        assert_eq!(played, vec![b"sunny".to_vec()]);

        let requests = h.reasoning.requests.lock().unwrap();
        let last = requests[0].messages.last().unwrap();
        assert_eq!(last.role, Role::User);
        assert_eq!(last.content.as_deref(), Some("what's the weather"));
        drop(requests);
        assert!(h.processor.conversations().is_open("42", Utc::now()));
        h.processor.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn transcript_without_wake_phrase_is_dropped() {
        let h = harness(
            &config(),
            "hello alice",
            vec![reply("x")],
            Some(Arc::new(EchoSynth)),
            None,
        );
        h.identity.upsert_speaker(1, "42");
        speak_then_pause(&h, 1);
        assert!(h.processor.shutdown(Duration::from_secs(2)).await);
        assert!(h.reasoning.requests.lock().unwrap().is_empty());
        assert!(h.sink.played.lock().unwrap().is_empty());
    }

    struct SlowReasoning {
        in_flight: std::sync::atomic::AtomicUsize,
        peak: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl ReasoningBackend for SlowReasoning {
        async fn complete(
            &self,
            _request: ReasoningRequest,
        ) -> std::result::Result<ReasoningResponse, ReasoningError> {
            use std::sync::atomic::Ordering;
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(200)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(reply("ok"))
        }
    }

    #[tokio::test]
    async fn same_user_turns_do_not_hold_history_across_backend_calls() {
        let reasoning = Arc::new(SlowReasoning {
            in_flight: Default::default(),
            peak: Default::default(),
        });
        let processor = VoiceProcessor::new(
            &config(),
            ProcessorDeps {
                identity: Arc::new(IdentityResolver::new()),
                transcriber: Arc::new(FixedTranscriber(String::new())),
                reasoning: Arc::clone(&reasoning) as Arc<dyn ReasoningBackend>,
                synthesizer: None,
                sink: Arc::new(RecordingSink::default()),
                tools: None,
                artifacts: None,
            },
            CancellationToken::new(),
        );

        let (a, b) = tokio::join!(processor.run_turn("42", "one"), processor.run_turn("42", "two"));
        assert_eq!(a.as_deref(), Some("ok"));
        assert_eq!(b.as_deref(), Some("ok"));
        assert_eq!(reasoning.peak.load(std::sync::atomic::Ordering::SeqCst), 2);
        assert!(processor.conversations().is_open("42", Utc::now()));

        let history = processor.conversations().snapshot("42").unwrap();
        assert_eq!(history.turns().len(), 2, "both turns recorded");
    }

    #[tokio::test]
    async fn turn_records_history_and_survives_synthesis_failure() {
        let h = harness(
            &config(),
            "",
            vec![reply("first"), reply("second")],
            Some(Arc::new(FailingSynth)),
            None,
        );
        assert_eq!(h.processor.run_turn("42", "one").await.as_deref(), Some("first"));
        assert_eq!(h.processor.run_turn("42", "two").await.as_deref(), Some("second"));
        assert!(h.sink.played.lock().unwrap().is_empty());

        let requests = h.reasoning.requests.lock().unwrap();
        let roles: Vec<_> = requests[1].messages.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![Role::System, Role::User, Role::Assistant, Role::User]
        );
    }

    #[tokio::test]
    async fn reasoning_failure_drops_the_turn() {
        let h = harness(&config(), "", vec![], Some(Arc::new(EchoSynth)), None);
        assert!(h.processor.run_turn("42", "anyone there").await.is_none());
        assert!(h.sink.played.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn tool_calls_loop_back_into_the_conversation() {
        let server = Arc::new(FakeServer::default());
        let pool = ToolSessionPool::connect_all(
            &[server_config("files")],
            settings(),
            Arc::new(FakeConnector {
                server: Arc::clone(&server),
                refuse: Vec::new(),
            }),
            &CancellationToken::new(),
        )
        .await;
        let pool = Arc::new(pool);

        let mut with_call = reply("");
        with_call.tool_calls = vec![ToolCall {
            id: "call_1".into(),
            name: "files__read".into(),
            arguments: r#"{"path":"notes"}"#.into(),
        }];
        let h = harness(
            &config(),
            "",
            vec![with_call, reply("done")],
            Some(Arc::new(EchoSynth)),
            Some(Arc::clone(&pool)),
        );

        assert_eq!(h.processor.run_turn("42", "read my notes").await.as_deref(), Some("done"));
        let requests = h.reasoning.requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        assert!(!requests[0].tools.is_empty());
        let tool_msg = requests[1].messages.last().unwrap();
        assert_eq!(tool_msg.role, Role::Tool);
        assert_eq!(tool_msg.content.as_deref(), Some("ran read"));
        drop(requests);
        pool.close_all().await;
    }

    #[tokio::test]
    async fn tool_rounds_are_bounded() {
        let server = Arc::new(FakeServer::default());
        let pool = Arc::new(
            ToolSessionPool::connect_all(
                &[server_config("files")],
                settings(),
                Arc::new(FakeConnector {
                    server,
                    refuse: Vec::new(),
                }),
                &CancellationToken::new(),
            )
            .await,
        );
        let mut cfg = config();
        cfg.llm.max_tool_rounds = 1;
        let mut looping = reply("partial");
        looping.tool_calls = vec![ToolCall {
            id: "c".into(),
            name: "files__read".into(),
            arguments: "{}".into(),
        }];
        let h = harness(
            &cfg,
            "",
            vec![looping.clone(), looping],
            None,
            Some(Arc::clone(&pool)),
        );
        assert_eq!(h.processor.run_turn("42", "loop").await.as_deref(), Some("partial"));
        assert_eq!(h.reasoning.requests.lock().unwrap().len(), 2);
        pool.close_all().await;
    }

    #[tokio::test]
    async fn disconnect_tears_down_streams_and_shutdown_refuses_frames() {
        let h = harness(&config(), "", vec![], None, None);
        h.identity.upsert_speaker(3, "42");
        assert!(h.processor.process_frame(3, frame(0)));
        assert_eq!(h.processor.active_speakers(), 1);

        h.processor.handle_event(VoiceEvent::ClientDisconnect {
            user_id: "42".into(),
        });
        assert_eq!(h.processor.active_speakers(), 0);
        assert!(h.identity.resolve_user(3).is_none());

        assert!(h.processor.shutdown(Duration::from_secs(1)).await);
        assert!(!h.processor.process_frame(3, frame(8_000)));
    }
}
