use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use perch_core::event::{Event, EventPayload, EventSubscription, TransportEvent};
use perch_core::EventBusError;
use tracing::{debug, error, trace, warn};

use crate::context::BotContext;
use crate::error::IngestError;
use crate::handlers;

/// Feeds transport events from the bus into the handlers.
pub struct IngestPipeline {
    ctx: Arc<BotContext>,
    applied: AtomicU64,
}

impl IngestPipeline {
    pub const SUBSCRIPTION: &'static str = "transport.**";

    pub fn new(ctx: Arc<BotContext>) -> Self {
        Self {
            ctx,
            applied: AtomicU64::new(0),
        }
    }

    pub fn context(&self) -> &Arc<BotContext> {
        &self.ctx
    }

    /// Transport events applied so far.
    pub fn applied(&self) -> u64 {
        self.applied.load(Ordering::Acquire)
    }

    pub fn handle_event(&self, event: &Event) {
        match &event.payload {
            EventPayload::Transport(transport) => self.apply(transport),
            _ => trace!(channel = %event.channel, "ignoring non-transport event"),
        }
    }

    pub fn apply(&self, event: &TransportEvent) {
        debug!(channel = event.channel_name(), "applying transport event");
        handlers::dispatch(&self.ctx, event);
        self.applied.fetch_add(1, Ordering::Release);
    }

    /// Subscribe to transport events. Events published after this returns are
    /// seen by [`consume`](Self::consume).
    pub fn subscribe(&self) -> Result<EventSubscription, IngestError> {
        Ok(self.ctx.bus().subscribe(Self::SUBSCRIPTION)?)
    }

    pub async fn run(self: Arc<Self>) -> Result<(), IngestError> {
        let sub = self.subscribe()?;
        self.consume(sub).await
    }

    pub async fn consume(self: Arc<Self>, mut sub: EventSubscription) -> Result<(), IngestError> {
        loop {
            match sub.recv().await {
                Ok(event) => {
                    self.handle_event(&event);
                }
                Err(EventBusError::ChannelClosed) => {
                    debug!("event bus closed, ingest pipeline stopping");
                    return Ok(());
                }
                Err(EventBusError::Lagged(count)) => {
                    warn!(count, "ingest pipeline lagged, some events dropped");
                }
                Err(e) => {
                    error!(error = %e, "ingest pipeline subscription error");
                    return Err(IngestError::EventBus(e));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enrich::StaticGroupFetcher;
    use assert_matches::assert_matches;
    use perch_core::config::load_config_from_str;
    use perch_core::event::{BroadcastEventBus, ConnectionState, EventBus, EventSource};
    use perch_core::model::{CallStatus, Chat};
    use perch_core::Tier;
    use perch_store::EntityStore;
    use perch_test_support::{builders, fixtures};
    use std::time::Duration;
    use tracing::Instrument;
    use tracing_test::traced_test;

    const ALICE: &str = "15550000001@s.whatsapp.net";
    const BOB: &str = "15550000002@s.whatsapp.net";
    const GROUP: &str = "120363000000001@g.us";

    fn pipeline(bus: Arc<BroadcastEventBus>) -> (Arc<IngestPipeline>, Arc<StaticGroupFetcher>) {
        let config = load_config_from_str(&fixtures::config("minimal-config.toml")).unwrap();
        let fetcher = Arc::new(StaticGroupFetcher::new(fixtures::groups("groups.json")));
        let ctx = BotContext::new(
            &config,
            Arc::new(EntityStore::from_config(&config.queue)),
            bus,
            fetcher.clone(),
        );
        (Arc::new(IngestPipeline::new(Arc::new(ctx))), fetcher)
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn session_replay_builds_projection() {
        let (pipeline, fetcher) = pipeline(Arc::new(BroadcastEventBus::default()));
        for event in fixtures::transport_events("session.jsonl") {
            pipeline.handle_event(&Event::transport(event));
        }
        let ctx = pipeline.context();
        ctx.enricher().settle().await;
        ctx.batcher().idle().await;
        let store = ctx.store();

        assert_eq!(ctx.connection_state(), ConnectionState::Open);
        assert!(ctx.is_self("15559990000@s.whatsapp.net"));

        let chat = store.chat(ALICE).unwrap();
        assert_eq!(chat.messages, vec!["M1"]);
        assert_eq!(chat.unread_count, Some(1));
        assert!(chat.quoted.is_empty());

        let reply = store.message(ALICE, "M2").unwrap();
        assert!(reply.key.from_me);
        assert_eq!(reply.reactions.len(), 1);

        let group = store.chat(GROUP).unwrap();
        assert!(!group.is_pending_metadata());
        assert_eq!(fetcher.calls(), 1);

        assert_eq!(store.presence(BOB).unwrap().chat_id, GROUP);
        assert_eq!(store.blocklist(), vec!["15550000008@s.whatsapp.net"]);
        assert_eq!(store.call("C1").unwrap().status, CallStatus::Reject);
        assert_eq!(store.resolve_alias("90000000001@lid").as_deref(), Some(ALICE));
        assert_eq!(ctx.batcher().completed(), 1);
        assert_eq!(pipeline.applied(), 14);
        assert!(store.queue().len_for(Tier::Core) > 0);
    }

    #[tokio::test]
    async fn run_consumes_bus_events() {
        let bus = Arc::new(BroadcastEventBus::default());
        let (pipeline, _) = pipeline(bus.clone());
        let mut received = bus.subscribe("plugin.message.received").unwrap();

        let handle = tokio::spawn(pipeline.clone().run());
        tokio::task::yield_now().await;

        bus.publish(Event::transport(builders::upsert(vec![builders::text_message(
            ALICE, "m1", "!help",
        )])))
        .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(1), received.recv())
            .await
            .expect("timed out")
            .expect("should receive event");
        assert_matches!(
            event.payload,
            EventPayload::MessageReceived { ref message } if message.key.id == "m1"
        );
        assert!(pipeline.context().store().message(ALICE, "m1").is_some());
        handle.abort();
    }

    #[tokio::test]
    async fn non_transport_events_are_ignored() {
        let (pipeline, _) = pipeline(Arc::new(BroadcastEventBus::default()));
        let event = Event::new(
            perch_core::event::Channel::new("system.startup").unwrap(),
            EventSource::System("test".into()),
            EventPayload::StartupComplete,
        );
        pipeline.handle_event(&event);
        assert!(pipeline.context().store().is_empty());
        assert_eq!(pipeline.applied(), 0);
    }

    #[traced_test]
    #[tokio::test]
    async fn lagging_subscription_keeps_running() {
        let bus = Arc::new(BroadcastEventBus::new(1));
        let (pipeline, _) = pipeline(bus.clone());
        let sub = pipeline.subscribe().unwrap();
        let handle = tokio::spawn(pipeline.clone().consume(sub).in_current_span());

        for id in ["15550000005", "15550000006", "15550000007"] {
            let chats = vec![Chat::new(id)];
            bus.publish(Event::transport(TransportEvent::ChatsUpsert { chats }))
                .unwrap();
        }

        let store = pipeline.context().store().clone();
        wait_for(|| store.chat("15550000007").is_some()).await;
        assert!(store.chat("15550000005").is_none());
        assert!(logs_contain("lagged"));

        bus.publish(Event::transport(TransportEvent::ChatsUpsert {
            chats: vec![Chat::new("15550000008")],
        }))
        .unwrap();
        wait_for(|| store.chat("15550000008").is_some()).await;
        assert!(!handle.is_finished());
        handle.abort();
    }
}
