use perch_core::event::ConnectionState;
use perch_core::jid;
use perch_core::model::OwnIdentity;
use perch_core::{StoreChange, WriteKind};
use tracing::info;

use super::require;
use crate::context::BotContext;
use crate::error::IngestError;

pub(crate) const CONNECTION_KEY: &str = "connection";
pub(crate) const CREDENTIALS_KEY: &str = "credentials";

/// Record the new state. On open, request metadata for every group chat still
/// pending, since fetches can only succeed while connected.
pub fn connection_update(ctx: &BotContext, state: ConnectionState, last_disconnect: Option<&str>) {
    if !ctx.set_connection_state(state) {
        return;
    }
    info!(state = ?state, reason = ?last_disconnect, "connection state changed");
    ctx.store()
        .queue()
        .push(StoreChange::set(CONNECTION_KEY, WriteKind::Connection));

    if state == ConnectionState::Open {
        let requested = ctx
            .store()
            .all_chats()
            .iter()
            .filter(|chat| chat.is_pending_metadata())
            .filter(|chat| ctx.enricher().request(&chat.id))
            .count();
        if requested > 0 {
            info!(requested, "requested metadata for pending groups");
        }
    }
}

/// Record the bot's own identity in both forms and the alias between them.
pub fn credentials_update(ctx: &BotContext, me: &OwnIdentity) -> Result<(), IngestError> {
    require(&me.id, "credentials", "id")?;
    let identity = OwnIdentity {
        id: jid::normalize(&me.id),
        lid: jid::normalize_opt(me.lid.as_deref()),
        name: me.name.clone(),
    };
    if let Some(lid) = identity.lid.as_deref() {
        ctx.store().record_alias(&identity.id, lid);
    }
    ctx.set_own_identity(identity);
    ctx.store()
        .queue()
        .push(StoreChange::set(CREDENTIALS_KEY, WriteKind::Credentials));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::testing::{harness, harness_with_groups, ALICE, GROUP, ME};
    use assert_matches::assert_matches;
    use perch_core::Tier;
    use perch_test_support::builders;

    #[tokio::test]
    async fn state_changes_are_recorded_once() {
        let h = harness();
        connection_update(&h.ctx, ConnectionState::Connecting, None);
        connection_update(&h.ctx, ConnectionState::Connecting, None);

        assert_eq!(h.ctx.connection_state(), ConnectionState::Connecting);
        let changes = h.store().queue().drain(10);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].key, CONNECTION_KEY);
        assert_eq!(changes[0].tier(), Tier::Core);
    }

    #[tokio::test]
    async fn open_enriches_pending_groups() {
        let h = harness_with_groups(vec![builders::group_metadata(GROUP, "Crew", &[])]);
        h.store().set_chat(builders::chat(GROUP));
        h.store().set_chat(builders::chat(ALICE));

        connection_update(&h.ctx, ConnectionState::Open, None);
        h.ctx.enricher().settle().await;

        assert_eq!(h.fetcher.calls(), 1);
        assert!(!h.store().chat(GROUP).unwrap().is_pending_metadata());
    }

    #[tokio::test]
    async fn credentials_set_identity_and_alias() {
        let h = harness();
        let me = OwnIdentity {
            id: "15550000009:12@s.whatsapp.net".into(),
            lid: Some("4242:12@lid".into()),
            name: Some("Perch".into()),
        };
        credentials_update(&h.ctx, &me).unwrap();

        assert!(h.ctx.is_self("15550000009"));
        assert!(h.ctx.is_self("4242@lid"));
        assert!(!h.ctx.is_self(ME));
        assert_eq!(
            h.store().resolve_alias("4242@lid").as_deref(),
            Some("15550000009@s.whatsapp.net")
        );
    }

    #[tokio::test]
    async fn credentials_without_id_are_rejected() {
        let h = harness();
        let result = credentials_update(&h.ctx, &OwnIdentity::default());
        assert_matches!(result, Err(IngestError::MissingField { field: "id", .. }));
        assert!(h.ctx.is_self(ME));
    }
}
