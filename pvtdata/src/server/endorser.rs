use crate::chaincode::ChaincodeStub;
use crate::shared::crypto::{hash_data, sign};
use crate::shared::pvt_repr::{Endorsement, PvtKey, PvtWriteHash, TxRwSet};
use crate::shared::request::{Proposal, ProposalResponse};

use super::membership::is_member;
use super::storage::{TransientEntry, TransientOrigin};
use super::withp2p::NodeContext;
use super::{PvtDataError, PvtResult};

fn check_proposal(ctx: &NodeContext, proposal: &Proposal) -> PvtResult<()> {
    if proposal.channel != ctx.config.channel {
        return Err(PvtDataError::Configuration(format!(
            "peer {} is not on channel {}",
            ctx.name, proposal.channel
        )));
    }
    if !ctx.registry.has_chaincode(&proposal.chaincode) {
        return Err(PvtDataError::Configuration(format!(
            "chaincode {} is not defined",
            proposal.chaincode
        )));
    }
    Ok(())
}

/// Simulates the proposal, keeps private payloads aside until commit and
/// signs the public write set. Nothing is signed when a collection does not
/// resolve.
pub(crate) fn endorse(ctx: &NodeContext, proposal: &Proposal) -> PvtResult<ProposalResponse> {
    check_proposal(ctx, proposal)?;
    let chaincode = ctx
        .chaincode(&proposal.chaincode)
        .ok_or_else(|| PvtDataError::Configuration(format!("chaincode {} is not installed", proposal.chaincode)))?;

    let mut stub = ChaincodeStub::new(
        &proposal.chaincode,
        &proposal.args,
        ctx.org(),
        &proposal.creator_org,
        &ctx.registry,
        &ctx.storage,
        &ctx.engine,
    );
    let payload = chaincode.invoke(&mut stub)?;
    let (writes, policy_writes) = stub.into_writes();

    let height = ctx.height();
    let mut pvt_writes = Vec::with_capacity(writes.len());
    for w in writes {
        if is_member(ctx.org(), &w.def) {
            let key = PvtKey::new(&proposal.chaincode, &w.def.name, &w.key);
            let entry = TransientEntry {
                payload: w.value.clone(),
                origin: TransientOrigin::Endorsed,
                received_at_height: height,
            };
            ctx.storage.transient.put(&proposal.tx_id, &key, &entry)?;
        }
        pvt_writes.push(PvtWriteHash {
            collection: w.def.name,
            key: w.key,
            value_hash: hash_data(&w.value),
        });
    }

    let rwset = TxRwSet {
        namespace: proposal.chaincode.clone(),
        pvt_writes,
        policy_writes,
    };
    let signature = sign(&rwset.digest(&proposal.tx_id)?, &ctx.signing_key)?;
    tracing::debug!(peer = %ctx.name, tx_id = %proposal.tx_id, "endorsed");
    Ok(ProposalResponse {
        tx_id: proposal.tx_id.clone(),
        rwset,
        endorsement: Endorsement {
            endorser: ctx.identity.clone(),
            signature,
        },
        payload,
    })
}

/// Read-only simulation; whatever the chaincode wrote is discarded.
pub(crate) fn query(ctx: &NodeContext, proposal: &Proposal) -> PvtResult<Vec<u8>> {
    check_proposal(ctx, proposal)?;
    let chaincode = ctx
        .chaincode(&proposal.chaincode)
        .ok_or_else(|| PvtDataError::Configuration(format!("chaincode {} is not installed", proposal.chaincode)))?;
    let mut stub = ChaincodeStub::new(
        &proposal.chaincode,
        &proposal.args,
        ctx.org(),
        &proposal.creator_org,
        &ctx.registry,
        &ctx.storage,
        &ctx.engine,
    );
    chaincode.invoke(&mut stub)
}
