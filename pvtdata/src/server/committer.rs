use std::sync::Arc;

use tokio::sync::mpsc;

use crate::shared::crypto::hash_data;
use crate::shared::policy::SignaturePolicyEnvelope;
use crate::shared::pvt_repr::{
    Block, BlockData, PrivateRecord, PublicCommitment, PvtKey, Transaction, TxEvent, TxValidationCode, Version,
};

use super::dissemination::{self, PushJob};
use super::membership::is_member;
use super::storage::{MissingEntry, TransientOrigin};
use super::withp2p::NodeContext;
use super::PvtResult;

/// Applies delivered blocks strictly in order. Pushing payloads to other
/// members runs in separate tasks so it never holds up the next block.
pub(crate) async fn run(ctx: NodeContext, mut blocks: mpsc::UnboundedReceiver<Arc<Block>>) {
    while let Some(block) = blocks.recv().await {
        match commit_block(&ctx, &block) {
            Ok((events, jobs)) => {
                for ev in events {
                    let _ = ctx.events.send(ev);
                }
                for job in jobs {
                    tokio::spawn(dissemination::disseminate(ctx.clone(), job));
                }
            }
            Err(e) => {
                tracing::error!(peer = %ctx.name, block = block.number, "commit failed, stopping: {}", e);
                return;
            }
        }
    }
    tracing::info!(peer = %ctx.name, "block stream ended");
}

pub(crate) fn commit_block(ctx: &NodeContext, block: &Block) -> PvtResult<(Vec<TxEvent>, Vec<PushJob>)> {
    let height = ctx.storage.meta.height()?;
    if block.number < height {
        tracing::debug!(peer = %ctx.name, block = block.number, "already committed");
        return Ok((Vec::new(), Vec::new()));
    }
    if block.number > height {
        tracing::warn!(peer = %ctx.name, block = block.number, height, "block ahead of ledger");
    }

    let mut events = Vec::new();
    let mut jobs = Vec::new();
    match &block.data {
        BlockData::Config(cfg) => match ctx.registry.apply_config(cfg) {
            Ok(()) => ctx.storage.meta.set_channel_config(cfg)?,
            Err(e) => tracing::error!(peer = %ctx.name, block = block.number, "rejected channel configuration: {}", e),
        },
        BlockData::Transactions(txs) => {
            for (tx_num, tx) in txs.iter().enumerate() {
                let version = Version::new(block.number, tx_num as u64);
                let code = commit_tx(ctx, tx, version, &mut jobs)?;
                events.push(TxEvent {
                    tx_id: tx.tx_id.clone(),
                    block_num: block.number,
                    code,
                });
            }
        }
    }

    let purged = ctx.storage.private.purge_expired(block.number)?;
    ctx.storage.missing.purge_expired(block.number)?;
    let retention = ctx.config.transient_retention_blocks;
    ctx.storage
        .transient
        .purge_older_than(block.number.saturating_sub(retention))?;
    if purged > 0 {
        tracing::debug!(peer = %ctx.name, block = block.number, purged, "purged expired private data");
    }

    ctx.storage.meta.set_height(block.number + 1)?;
    tracing::info!(peer = %ctx.name, block = block.number, "committed block");
    Ok((events, jobs))
}

fn commit_tx(ctx: &NodeContext, tx: &Transaction, version: Version, jobs: &mut Vec<PushJob>) -> PvtResult<TxValidationCode> {
    let code = if tx.channel != ctx.config.channel {
        TxValidationCode::InvalidCollection
    } else {
        ctx.engine.validate(tx)?
    };
    if code != TxValidationCode::Valid {
        tracing::info!(peer = %ctx.name, tx_id = %tx.tx_id, %code, "transaction invalidated");
        ctx.storage.transient.remove_tx(&tx.tx_id)?;
        return Ok(code);
    }

    let ns = &tx.rwset.namespace;
    let my_org = ctx.org();
    for w in &tx.rwset.pvt_writes {
        let key = PvtKey::new(ns, &w.collection, &w.key);
        ctx.storage.commitments.commit(&PublicCommitment {
            key: key.clone(),
            value_hash: w.value_hash,
            version,
        })?;

        // eligibility is decided now, against the definition in force
        let def = ctx.registry.resolve(ns, &w.collection, my_org)?;
        if !is_member(my_org, &def) {
            continue;
        }
        let expiry_block = def.expiry_block(version);
        match ctx.storage.transient.get(&tx.tx_id, &key)? {
            Some(entry) if hash_data(&entry.payload) == w.value_hash => {
                let push = entry.origin == TransientOrigin::Endorsed && !def.is_local() && def.max_peer_count > 0;
                let record = PrivateRecord {
                    key: key.clone(),
                    value: entry.payload,
                    version,
                    expiry_block,
                };
                ctx.storage.private.put(&def, my_org, &record)?;
                ctx.storage.missing.remove(&key, version)?;
                if push {
                    jobs.push(PushJob {
                        tx_id: tx.tx_id.clone(),
                        def: def.clone(),
                        record,
                    });
                }
            }
            other => {
                if other.is_some() {
                    tracing::warn!(peer = %ctx.name, %key, "transient payload does not match commitment");
                }
                // a +local payload lives only where it was simulated
                if !def.is_local() && !ctx.storage.private.has_version(&key, version)? {
                    ctx.storage
                        .missing
                        .insert(&MissingEntry::new(key, version, &tx.tx_id, expiry_block))?;
                }
            }
        }
    }

    for pw in &tx.rwset.policy_writes {
        let policy = SignaturePolicyEnvelope::from_bytes(&pw.policy)?;
        ctx.engine.set_policy(&PvtKey::new(ns, &pw.collection, &pw.key), &policy)?;
    }
    ctx.storage.transient.remove_tx(&tx.tx_id)?;
    Ok(code)
}
