use perch_core::jid;
use perch_core::model::{CallOffer, Merge};
use perch_core::WriteKind;
use perch_store::{keys, Entity};
use tracing::debug;

use super::{require, skip_item};
use crate::context::BotContext;
use crate::error::IngestError;

pub fn calls(ctx: &BotContext, calls: &[CallOffer]) {
    for call in calls {
        skip_item("call", record_call(ctx, call));
    }
}

/// Write the offer under `call:<id>`, merging status updates into the
/// original offer.
fn record_call(ctx: &BotContext, call: &CallOffer) -> Result<(), IngestError> {
    require(&call.id, "call", "id")?;
    let mut incoming = call.clone();
    incoming.chat_id = jid::normalize(&incoming.chat_id);
    incoming.from = jid::normalize(&incoming.from);
    incoming.group_jid = jid::normalize_opt(incoming.group_jid.as_deref());

    let status = incoming.status;
    ctx.store()
        .update(&keys::call(&call.id), WriteKind::Call, |current| {
            let next = match current {
                Some(Entity::Call(mut existing)) => {
                    existing.merge(incoming);
                    existing
                }
                _ => incoming,
            };
            Some(Entity::Call(next))
        });
    debug!(call = %call.id, status = ?status, "call recorded");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::testing::{harness, ALICE};
    use perch_core::model::CallStatus;
    use perch_test_support::builders;

    fn offer(status: CallStatus, offline: bool) -> CallOffer {
        CallOffer {
            id: "call-1".into(),
            chat_id: "15550000001:1".into(),
            from: "15550000001".into(),
            status,
            is_video: true,
            is_group: false,
            group_jid: None,
            date: builders::base_time(),
            offline,
        }
    }

    #[tokio::test]
    async fn status_updates_merge_into_offer() {
        let h = harness();
        calls(&h.ctx, &[offer(CallStatus::Offer, false)]);
        let mut reject = offer(CallStatus::Reject, true);
        reject.is_video = false;
        reject.date = builders::base_time() + chrono::Duration::seconds(30);
        calls(&h.ctx, &[reject]);

        let call = h.store().call("call-1").unwrap();
        assert_eq!(call.status, CallStatus::Reject);
        assert!(call.offline);
        assert!(call.is_video);
        assert_eq!(call.date, builders::base_time());
        assert_eq!(call.chat_id, ALICE);
    }
}
