//! Reconciliation: members pull private payloads they are entitled to but
//! never received, from peers that are likely to hold them.

use futures::future::join_all;

use crate::shared::pvt_repr::{PvtKey, Version};
use crate::shared::request::PeerMessage;

use super::dissemination::admit;
use super::membership::is_member;
use super::storage::MissingEntry;
use super::withp2p::NodeContext;
use super::{PvtDataError, PvtResult};

/// Announces this node and runs one reconciliation round per tick.
pub(crate) async fn run(ctx: NodeContext) {
    let mut ticker = tokio::time::interval(ctx.config.reconcile.interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if let Err(e) = ctx.announce() {
            tracing::debug!(peer = %ctx.name, "alive not sent: {}", e);
        }
        if let Err(e) = reconcile_round(&ctx).await {
            tracing::error!(peer = %ctx.name, "reconciliation round failed: {}", e);
        }
    }
}

pub(crate) async fn reconcile_round(ctx: &NodeContext) -> PvtResult<()> {
    let entries = round_batch(ctx.storage.missing.list(usize::MAX, false)?, ctx.config.reconcile.batch_size);
    if entries.is_empty() {
        return Ok(());
    }
    tracing::debug!(peer = %ctx.name, missing = entries.len(), "reconciling");
    let results = join_all(entries.iter().map(|e| reconcile_entry(ctx, e))).await;
    for r in results {
        r?;
    }
    Ok(())
}

/// Entries with the fewest failed rounds go first, so a few hopeless ones
/// cannot hold the whole batch.
fn round_batch(mut entries: Vec<MissingEntry>, batch_size: usize) -> Vec<MissingEntry> {
    entries.sort_by_key(|e| e.failed_rounds);
    entries.truncate(batch_size);
    entries
}

/// Whether the entry no longer needs fetching: its version is held, or a
/// later write to the key replaced it. Nobody serves superseded versions.
fn settled(ctx: &NodeContext, entry: &MissingEntry) -> PvtResult<bool> {
    let (key, version) = (&entry.key, entry.version);
    if let Some(held) = ctx.storage.private.get(key)? {
        if held.version >= version {
            return Ok(true);
        }
    }
    Ok(matches!(ctx.storage.commitments.latest(key)?, Some(c) if c.version > version))
}

async fn reconcile_entry(ctx: &NodeContext, entry: &MissingEntry) -> PvtResult<()> {
    let (key, version) = (&entry.key, entry.version);
    if settled(ctx, entry)? {
        tracing::debug!(peer = %ctx.name, %key, %version, "missing entry settled");
        return ctx.storage.missing.remove(key, version);
    }
    let def = match ctx.registry.resolve(&key.namespace, &key.collection, ctx.org()) {
        Ok(d) => d,
        Err(PvtDataError::Configuration(_)) => return Ok(()),
        Err(e) => return Err(e),
    };

    // pushed after the committer looked
    if let Some(t) = ctx.storage.transient.get(&entry.tx_id, key)? {
        if admit(ctx, &def, key, version, t.payload).is_ok() {
            return Ok(());
        }
    }

    let retry = &ctx.config.reconcile.retry;
    let candidates: Vec<String> = ctx
        .directory
        .member_peers(&def, &ctx.name)
        .into_iter()
        .filter(|p| p.height > version.block_num)
        .take(retry.max_attempts.max(1) as usize)
        .map(|p| p.name)
        .collect();

    for (i, peer) in candidates.iter().enumerate() {
        if i > 0 {
            tokio::time::sleep(retry.delay_for_attempt(i as u32)).await;
        }
        let reply = ctx
            .request(
                peer,
                |request_id| PeerMessage::PullRequest {
                    request_id,
                    key: key.clone(),
                    version,
                },
                ctx.config.reconcile.pull_timeout(),
            )
            .await;
        let payload = match reply {
            Some(PeerMessage::PullResponse {
                payload: Some(p), ..
            }) => p,
            _ => continue,
        };
        match admit(ctx, &def, key, version, payload) {
            Ok(()) => {
                tracing::info!(peer = %ctx.name, from = %peer, %key, %version, "reconciled private data");
                return Ok(());
            }
            Err(PvtDataError::IntegrityMismatch { .. }) => {
                tracing::warn!(peer = %ctx.name, from = %peer, %key, %version, "pulled payload does not match commitment");
            }
            Err(e) => return Err(e),
        }
    }

    let max = ctx.config.reconcile.max_failed_rounds;
    if let Some(updated) = ctx.storage.missing.record_failure(key, version, max)? {
        if updated.abandoned {
            tracing::warn!(peer = %ctx.name, %key, %version, rounds = updated.failed_rounds, "giving up on private data");
        }
    }
    Ok(())
}

/// Answer to a pull: the payload, only if the requester's organisation is a
/// member of a disseminated collection and this node holds that exact
/// version.
pub(crate) fn serve_pull(ctx: &NodeContext, requester: &str, key: &PvtKey, version: Version) -> Option<Vec<u8>> {
    let org = ctx.directory.org_of(requester)?;
    let def = ctx.registry.resolve(&key.namespace, &key.collection, &org).ok()?;
    if def.is_local() || !is_member(&org, &def) || !is_member(ctx.org(), &def) {
        return None;
    }
    match ctx.storage.private.get(key) {
        Ok(Some(r)) if r.version == version => Some(r.value),
        _ => None,
    }
}
