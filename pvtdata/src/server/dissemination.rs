use futures::future::join_all;

use crate::shared::pvt_repr::{CollectionDefinition, PrivateRecord, PvtKey, Version};
use crate::shared::request::PeerMessage;

use super::membership::is_member;
use super::storage::{TransientEntry, TransientOrigin};
use super::withp2p::NodeContext;
use super::{PvtDataError, PvtResult};

/// A payload this node endorsed and has just committed, to be handed to
/// other members.
pub(crate) struct PushJob {
    pub tx_id: String,
    pub def: CollectionDefinition,
    pub record: PrivateRecord,
}

/// Best-effort push to up to `max_peer_count` member peers. Unreached
/// members catch up through reconciliation.
pub(crate) async fn disseminate(ctx: NodeContext, job: PushJob) {
    let targets: Vec<String> = ctx
        .directory
        .member_peers(&job.def, &ctx.name)
        .into_iter()
        .take(job.def.max_peer_count as usize)
        .map(|p| p.name)
        .collect();

    let acks = join_all(targets.iter().map(|t| push_to(&ctx, t, &job)))
        .await
        .into_iter()
        .filter(|ok| *ok)
        .count();

    if (acks as u32) < job.def.required_peer_count {
        tracing::warn!(
            peer = %ctx.name,
            key = %job.record.key,
            acks,
            required = job.def.required_peer_count,
            "private data reached fewer peers than required"
        );
    } else {
        tracing::debug!(peer = %ctx.name, key = %job.record.key, acks, "private data disseminated");
    }
}

async fn push_to(ctx: &NodeContext, target: &str, job: &PushJob) -> bool {
    let retry = &ctx.config.dissemination.retry;
    let timeout = ctx.config.dissemination.ack_timeout();
    for attempt in 1..=retry.max_attempts.max(1) {
        let reply = ctx
            .request(
                target,
                |request_id| PeerMessage::Push {
                    request_id,
                    tx_id: job.tx_id.clone(),
                    key: job.record.key.clone(),
                    version: job.record.version,
                    payload: job.record.value.clone(),
                },
                timeout,
            )
            .await;
        if let Some(PeerMessage::PushAck { .. }) = reply {
            return true;
        }
        if attempt < retry.max_attempts {
            tokio::time::sleep(retry.delay_for_attempt(attempt)).await;
        }
    }
    tracing::debug!(peer = %ctx.name, target, key = %job.record.key, "push gave up");
    false
}

/// Handles an incoming push. Returns whether to acknowledge it.
///
/// A payload for a version already committed here is checked against its
/// commitment and merged. One for a block not yet committed waits in the
/// transient store for the committer.
pub(crate) fn receive_push(
    ctx: &NodeContext,
    sender: &str,
    tx_id: &str,
    key: &PvtKey,
    version: Version,
    payload: Vec<u8>,
) -> PvtResult<bool> {
    let def = match ctx.registry.resolve(&key.namespace, &key.collection, ctx.org()) {
        Ok(d) => d,
        Err(PvtDataError::Configuration(_)) => return Ok(false),
        Err(e) => return Err(e),
    };
    if def.is_local() || !is_member(ctx.org(), &def) {
        tracing::debug!(peer = %ctx.name, from = sender, "ignored push");
        return Ok(false);
    }

    if ctx.storage.commitments.at_version(key, version)?.is_some() {
        return match admit(ctx, &def, key, version, payload) {
            Ok(()) => Ok(true),
            Err(PvtDataError::IntegrityMismatch { .. }) => {
                tracing::warn!(peer = %ctx.name, from = sender, %key, %version, "pushed payload does not match commitment");
                Ok(false)
            }
            Err(e) => Err(e),
        };
    }

    let height = ctx.height();
    if version.block_num < height {
        // that transaction did not write this key
        return Ok(false);
    }
    ctx.storage.transient.put(
        tx_id,
        key,
        &TransientEntry {
            payload,
            origin: TransientOrigin::Pushed,
            received_at_height: height,
        },
    )?;
    Ok(true)
}

/// Verifies a payload against the commitment for `version` and stores it.
pub(crate) fn admit(
    ctx: &NodeContext,
    def: &CollectionDefinition,
    key: &PvtKey,
    version: Version,
    payload: Vec<u8>,
) -> PvtResult<()> {
    if !ctx.storage.commitments.verify(key, version, &payload)? {
        return Err(PvtDataError::IntegrityMismatch {
            collection: key.collection.clone(),
            key: key.key.clone(),
        });
    }
    let record = PrivateRecord {
        key: key.clone(),
        value: payload,
        version,
        expiry_block: def.expiry_block(version),
    };
    ctx.storage.private.put(def, ctx.org(), &record)?;
    ctx.storage.missing.remove(key, version)?;
    Ok(())
}
