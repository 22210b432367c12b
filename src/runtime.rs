//! Process supervisor.
//!
//! Builds every subsystem from configuration, runs the transport reader
//! until the sidecar closes its pipe or shutdown is requested, then tears
//! down in order: cancel, bounded drain, close tool sessions, release the
//! transport.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncRead;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::artifacts::ArtifactStore;
use crate::config::BridgeConfig;
use crate::error::Result;
use crate::identity::IdentityResolver;
use crate::llm::ReasoningClient;
use crate::pipeline::{ProcessorDeps, VoiceProcessor};
use crate::retention::RetentionSweeper;
use crate::stt::HttpTranscriber;
use crate::tools::{
    DefaultConnector, ManifestLoader, ManifestSources, SessionSettings, ToolSessionPool,
    TransportConnector,
};
use crate::transport::stdio::{ReaderExit, run_event_reader};
use crate::transport::{AudioSink, VoiceEventHandler};
use crate::tts::{HttpSynthesizer, Synthesizer};

/// Owns the shared cancellation token and the subsystem lifecycle.
pub struct Supervisor {
    config: BridgeConfig,
    cancel: CancellationToken,
    connector: Arc<dyn TransportConnector>,
}

impl Supervisor {
    /// Supervisor for `config` using the real tool transports.
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            config,
            cancel: CancellationToken::new(),
            connector: Arc::new(DefaultConnector::default()),
        }
    }

    /// Replace how tool-server transports are opened.
    pub fn with_connector(mut self, connector: Arc<dyn TransportConnector>) -> Self {
        self.connector = connector;
        self
    }

    /// Token that stops everything when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run until `input` ends or the token is cancelled.
    ///
    /// # Errors
    ///
    /// Returns an error when the mandatory identifiers are missing or the
    /// transport input cannot be read. Shutdown still runs in the latter case.
    pub async fn run<R>(self, input: R, sink: Arc<dyn AudioSink>) -> Result<ReaderExit>
    where
        R: AsyncRead + Unpin,
    {
        let config = self.config;
        config.validate_required()?;
        let cancel = self.cancel;

        let tools = connect_tools(&config, self.connector, &cancel).await;

        let (artifacts, sweeper) = if config.recordings.enabled {
            let sweeper = RetentionSweeper::from_config(&config.recordings);
            let handle = tokio::spawn(sweeper.run(cancel.child_token()));
            (Some(ArtifactStore::new(config.recordings.dir.clone())), Some(handle))
        } else {
            (None, None)
        };

        let synthesizer = HttpSynthesizer::from_config(&config.tts)
            .map(|s| Arc::new(s) as Arc<dyn Synthesizer>);
        if synthesizer.is_none() {
            info!("no synthesis endpoint configured; replies will not be spoken");
        }

        let processor = VoiceProcessor::new(
            &config,
            ProcessorDeps {
                identity: Arc::new(IdentityResolver::new()),
                transcriber: Arc::new(HttpTranscriber::new(&config.stt)),
                reasoning: Arc::new(ReasoningClient::new(config.llm.clone())),
                synthesizer,
                sink: Arc::clone(&sink),
                tools: tools.clone(),
                artifacts,
            },
            cancel.child_token(),
        );

        info!(
            guild = %config.discord.guild_id,
            channel = %config.discord.voice_channel_id,
            tool_servers = tools.as_ref().map_or(0, |p| p.len()),
            "voxbridge running"
        );
        let handler: Arc<dyn VoiceEventHandler> = Arc::new(processor.clone());
        let outcome = run_event_reader(input, handler, cancel.child_token()).await;

        shutdown(
            &cancel,
            &processor,
            tools.as_deref(),
            sweeper,
            Duration::from_millis(config.runtime.shutdown_grace_ms),
        )
        .await;
        drop(sink);
        info!("transport released");

        outcome
    }
}

async fn connect_tools(
    config: &BridgeConfig,
    connector: Arc<dyn TransportConnector>,
    cancel: &CancellationToken,
) -> Option<Arc<ToolSessionPool>> {
    if !config.tools.enabled {
        return None;
    }
    let servers = ManifestLoader::new(ManifestSources::from_config(&config.tools)).load();
    if servers.is_empty() {
        info!("no tool servers configured");
        return None;
    }
    let pool = ToolSessionPool::connect_all(
        &servers,
        SessionSettings::from(&config.tools),
        connector,
        cancel,
    )
    .await;
    (!pool.is_empty()).then(|| Arc::new(pool))
}

async fn shutdown(
    cancel: &CancellationToken,
    processor: &VoiceProcessor,
    tools: Option<&ToolSessionPool>,
    sweeper: Option<JoinHandle<()>>,
    grace: Duration,
) {
    info!("shutting down");
    cancel.cancel();
    processor.shutdown(grace).await;

    if let Some(pool) = tools {
        pool.close_all().await;
        info!(sessions = pool.len(), "tool sessions closed");
    }
    if let Some(handle) = sweeper
        && let Err(e) = handle.await
    {
        warn!(error = %e, "retention sweeper task failed");
    }
}
