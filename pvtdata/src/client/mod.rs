use std::time::Duration;

use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;

use crate::ordering::SoloOrderer;
use crate::server::withp2p::PeerNode;
use crate::shared::crypto::random_id;
use crate::shared::pvt_repr::{Transaction, TxEvent, TxValidationCode};
use crate::shared::request::Proposal;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("endorsement failed: {0}")]
    Endorsement(String),
    #[error("endorsers returned different results")]
    MismatchedResponses,
    #[error("transaction {tx_id} committed with status ({code})")]
    CommittedWithStatus { tx_id: String, code: TxValidationCode },
    #[error("timed out waiting for commit")]
    Timeout,
    #[error("query failed: {0}")]
    Query(String),
}

/// Submits transactions on behalf of a client of `client_org`.
pub struct Invoker<'a> {
    orderer: &'a SoloOrderer,
    client_org: String,
    commit_timeout: Duration,
}

impl<'a> Invoker<'a> {
    pub fn new(orderer: &'a SoloOrderer, client_org: &str) -> Self {
        Self {
            orderer,
            client_org: client_org.into(),
            commit_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_commit_timeout(mut self, timeout: Duration) -> Self {
        self.commit_timeout = timeout;
        self
    }

    fn proposal(&self, chaincode: &str, args: &[&str]) -> Result<Proposal, ClientError> {
        Ok(Proposal {
            tx_id: random_id().map_err(|e| ClientError::Endorsement(e.to_string()))?,
            channel: self.orderer.channel().into(),
            chaincode: chaincode.into(),
            args: args.iter().map(|s| s.to_string()).collect(),
            creator_org: self.client_org.clone(),
        })
    }

    /// Collects endorsements from every peer in `endorsers`, orders the
    /// transaction and waits until `observer` reports its fate.
    pub async fn invoke(
        &self,
        endorsers: &[&PeerNode],
        observer: &PeerNode,
        chaincode: &str,
        args: &[&str],
    ) -> Result<TxEvent, ClientError> {
        if endorsers.is_empty() {
            return Err(ClientError::Endorsement("no endorsers given".into()));
        }
        let proposal = self.proposal(chaincode, args)?;

        let mut responses = Vec::with_capacity(endorsers.len());
        for peer in endorsers {
            let r = peer
                .endorse(&proposal)
                .map_err(|e| ClientError::Endorsement(format!("{}: {}", peer.name(), e)))?;
            responses.push(r);
        }
        let first = &responses[0];
        if responses
            .iter()
            .any(|r| r.rwset != first.rwset || r.payload != first.payload)
        {
            return Err(ClientError::MismatchedResponses);
        }

        let tx = Transaction {
            tx_id: proposal.tx_id.clone(),
            channel: proposal.channel.clone(),
            rwset: first.rwset.clone(),
            endorsements: responses.iter().map(|r| r.endorsement.clone()).collect(),
        };

        // subscribe first so the event cannot slip past
        let mut events = observer.subscribe_events();
        self.orderer.broadcast(tx);

        let wait = async {
            loop {
                match events.recv().await {
                    Ok(ev) if ev.tx_id == proposal.tx_id => return Ok(ev),
                    Ok(_) | Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => return Err(ClientError::Timeout),
                }
            }
        };
        let ev = tokio::time::timeout(self.commit_timeout, wait)
            .await
            .map_err(|_| ClientError::Timeout)??;
        if ev.code != TxValidationCode::Valid {
            return Err(ClientError::CommittedWithStatus {
                tx_id: ev.tx_id,
                code: ev.code,
            });
        }
        Ok(ev)
    }

    pub fn query(&self, peer: &PeerNode, chaincode: &str, args: &[&str]) -> Result<Vec<u8>, ClientError> {
        let proposal = self.proposal(chaincode, args)?;
        peer.query(&proposal).map_err(|e| ClientError::Query(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_text_names_the_code() {
        let e = ClientError::CommittedWithStatus {
            tx_id: "abc".into(),
            code: TxValidationCode::EndorsementPolicyFailure,
        };
        assert_eq!(e.to_string(), "transaction abc committed with status (ENDORSEMENT_POLICY_FAILURE)");
    }
}
