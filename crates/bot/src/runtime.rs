use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use perch_core::config::Config;
use perch_core::event::{
    BroadcastEventBus, Channel, Event, EventBus, EventPayload, EventSource, TransportEvent,
};
use perch_ingest::{BotContext, ChangeFeed, GroupMetadataFetcher, IngestError, IngestPipeline};
use perch_settings::{MetaStore, SettingsStore, Table};
use perch_storage::{open_database, NativeDatabase};
use perch_store::EntityStore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

const COMPONENT: &str = "perch-bot";
const REPLAY_TIMEOUT: Duration = Duration::from_secs(30);
const POLL_INTERVAL: Duration = Duration::from_millis(2);

pub const LAST_REPLAY_KEY: &str = "replay.last_at";
pub const REPLAYED_EVENTS_KEY: &str = "replay.events";

/// What a replay left behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplaySummary {
    pub applied: u64,
    pub chats: usize,
    pub muted: usize,
}

/// The wired-up bot: durable settings, the in-memory projection and the
/// background tasks feeding it.
pub struct Bot {
    bus: Arc<BroadcastEventBus>,
    ctx: Arc<BotContext>,
    pipeline: Arc<IngestPipeline>,
    feed: Arc<ChangeFeed>,
    settings: SettingsStore<NativeDatabase>,
    meta: MetaStore<NativeDatabase>,
    tasks: JoinSet<Result<(), IngestError>>,
}

impl Bot {
    pub async fn start(
        config: &Config,
        database: &Path,
        fetcher: Arc<dyn GroupMetadataFetcher>,
    ) -> Result<Self> {
        let db = Arc::new(
            open_database(database)
                .await
                .with_context(|| format!("failed to open database {}", database.display()))?,
        );
        info!(path = %database.display(), "storage initialized");

        let settings = SettingsStore::open(db.clone()).await?;
        let meta = MetaStore::new(db);

        let bus = Arc::new(BroadcastEventBus::new(config.event_bus.channel_capacity));
        let store = Arc::new(EntityStore::from_config(&config.queue));
        let ctx = Arc::new(BotContext::new(
            config,
            store.clone(),
            bus.clone(),
            fetcher,
        ));
        let pipeline = Arc::new(IngestPipeline::new(ctx.clone()));
        let feed = Arc::new(ChangeFeed::new(store, bus.clone()));

        // Subscribe before spawning so nothing published after start is missed.
        let subscription = pipeline.subscribe()?;
        let mut tasks = JoinSet::new();
        tasks.spawn(pipeline.clone().consume(subscription));
        tasks.spawn(feed.clone().run());

        publish(
            bus.as_ref(),
            "system.startup",
            EventPayload::StartupComplete,
        )?;
        info!("bot started");

        Ok(Self {
            bus,
            ctx,
            pipeline,
            feed,
            settings,
            meta,
            tasks,
        })
    }

    pub fn context(&self) -> &Arc<BotContext> {
        &self.ctx
    }

    pub fn store(&self) -> &Arc<EntityStore> {
        self.ctx.store()
    }

    pub fn settings(&self) -> &SettingsStore<NativeDatabase> {
        &self.settings
    }

    pub fn meta(&self) -> &MetaStore<NativeDatabase> {
        &self.meta
    }

    /// Publish recorded transport events through the bus and wait until the
    /// pipeline, enrichment and the batcher have all settled.
    pub async fn replay(&self, events: Vec<TransportEvent>) -> Result<ReplaySummary> {
        let baseline = self.pipeline.applied();
        let chunk = (self.bus.capacity() / 2).max(1);
        let total = events.len() as u64;
        let mut published = 0u64;

        let mut events = events.into_iter().peekable();
        while events.peek().is_some() {
            for event in events.by_ref().take(chunk) {
                self.bus.publish(Event::transport(event))?;
                published += 1;
            }
            self.wait_applied(baseline + published).await?;
            debug!(published, total, "replay progress");
        }

        self.ctx.enricher().settle().await;
        self.ctx.batcher().idle().await;
        let flushed = self.feed.publish_pending()?;
        debug!(flushed, "flushed store changes");

        let muted = self.sync_chat_settings().await?;
        self.meta
            .set(LAST_REPLAY_KEY, chrono::Utc::now().to_rfc3339())
            .await?;
        self.meta.set(REPLAYED_EVENTS_KEY, total as i64).await?;

        Ok(ReplaySummary {
            applied: self.pipeline.applied() - baseline,
            chats: self.store().all_chats().len(),
            muted,
        })
    }

    async fn wait_applied(&self, target: u64) -> Result<()> {
        tokio::time::timeout(REPLAY_TIMEOUT, async {
            while self.pipeline.applied() < target {
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        })
        .await
        .map_err(|_| {
            anyhow!(
                "pipeline applied {} of {target} events before timing out",
                self.pipeline.applied()
            )
        })
    }

    /// Make sure every known chat has a flag row and count the muted ones.
    pub async fn sync_chat_settings(&self) -> Result<usize> {
        let mut muted = 0;
        for chat in self.store().all_chats() {
            let row = self.settings.get_row(Table::Chats, &chat.id).await?;
            if row.flag("mute") {
                muted += 1;
            }
        }
        Ok(muted)
    }

    pub fn write_snapshot(&self, path: &Path) -> Result<()> {
        let json = self.store().snapshot_json()?;
        std::fs::write(path, json)
            .with_context(|| format!("failed to write snapshot to {}", path.display()))
    }

    pub async fn shutdown(mut self, reason: &str) {
        if let Err(error) = publish(
            self.bus.as_ref(),
            "system.shutdown",
            EventPayload::ShutdownRequested {
                reason: reason.to_string(),
            },
        ) {
            warn!(error = %error, "failed to announce shutdown");
        }

        self.ctx.enricher().settle().await;
        self.ctx.batcher().idle().await;
        if let Err(error) = self.feed.publish_pending() {
            warn!(error = %error, "failed to flush store changes");
        }

        self.tasks.abort_all();
        while let Some(result) = self.tasks.join_next().await {
            match result {
                Ok(Err(error)) => warn!(error = %error, "background task failed"),
                Err(error) if !error.is_cancelled() => {
                    warn!(error = %error, "background task panicked")
                }
                _ => {}
            }
        }

        let stats = self.store().stats();
        info!(
            aliases = stats.aliases,
            blocklisted = stats.blocklisted,
            batches_completed = self.ctx.batcher().completed(),
            batches_failed = self.ctx.batcher().failed(),
            reason,
            "bot stopped"
        );
    }
}

fn publish(bus: &dyn EventBus, channel: &str, payload: EventPayload) -> Result<()> {
    let event = Event::new(
        Channel::new(channel)?,
        EventSource::System(COMPONENT.to_string()),
        payload,
    );
    bus.publish(event)?;
    Ok(())
}

/// Read transport events stored one JSON object per line. Blank lines are
/// skipped.
pub fn read_events(path: &Path) -> Result<Vec<TransportEvent>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    parse_events(&contents).with_context(|| format!("invalid replay file {}", path.display()))
}

fn parse_events(contents: &str) -> Result<Vec<TransportEvent>> {
    contents
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(index, line)| {
            serde_json::from_str(line).with_context(|| format!("line {}", index + 1))
        })
        .collect()
}
