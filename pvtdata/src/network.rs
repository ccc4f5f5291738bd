//! In-process channel: a `SoloOrderer`, a `LocalNet` message hub and any
//! number of peers. Used by the demo binary and the integration tests.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use fakep2p::LocalNet;

use crate::chaincode::Chaincode;
use crate::client::{ClientError, Invoker};
use crate::ordering::SoloOrderer;
use crate::server::withp2p::PeerNode;
use crate::server::{PvtDataError, PvtResult};
use crate::shared::config::{DisseminationConfig, PeerConfig, ReconcileConfig, RetryPolicy};
use crate::shared::crypto::generate_key;
use crate::shared::policy::SignaturePolicyEnvelope;
use crate::shared::pvt_repr::{ChaincodeDefinition, ChannelConfig, CollectionDefinition, TxEvent};

pub struct LocalNetwork {
    channel: String,
    net: LocalNet,
    orderer: Arc<SoloOrderer>,
    peers: BTreeMap<String, PeerNode>,
    config: ChannelConfig,
    chaincodes: Vec<(String, Arc<dyn Chaincode>)>,
    dissemination: DisseminationConfig,
    reconcile: ReconcileConfig,
}

impl LocalNetwork {
    /// A channel tuned for quick convergence: short ticks and timeouts.
    pub fn new(channel: &str) -> Self {
        let fast = RetryPolicy {
            max_attempts: 3,
            initial_delay_ms: 20,
            max_delay_ms: 200,
            multiplier: 2.0,
        };
        Self {
            channel: channel.into(),
            net: LocalNet::new(),
            orderer: Arc::new(SoloOrderer::new(channel)),
            peers: BTreeMap::new(),
            config: ChannelConfig {
                channel: channel.into(),
                chaincodes: Vec::new(),
            },
            chaincodes: Vec::new(),
            dissemination: DisseminationConfig {
                retry: fast.clone(),
                ack_timeout_ms: 200,
            },
            reconcile: ReconcileConfig {
                interval_ms: 50,
                pull_timeout_ms: 200,
                retry: fast,
                batch_size: 100,
                max_failed_rounds: None,
            },
        }
    }

    /// Settings for peers added from now on.
    pub fn set_peer_defaults(&mut self, dissemination: DisseminationConfig, reconcile: ReconcileConfig) {
        self.dissemination = dissemination;
        self.reconcile = reconcile;
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn orderer(&self) -> &SoloOrderer {
        &self.orderer
    }

    pub fn net(&self) -> &LocalNet {
        &self.net
    }

    pub fn add_peer(&mut self, name: &str, org: &str) -> PvtResult<&PeerNode> {
        let mut cfg = PeerConfig::new(name, org, &self.channel);
        cfg.dissemination = self.dissemination.clone();
        cfg.reconcile = self.reconcile.clone();
        self.add_peer_with(cfg)
    }

    /// Joins a peer; it catches up from the first block.
    pub fn add_peer_with(&mut self, config: PeerConfig) -> PvtResult<&PeerNode> {
        if self.peers.contains_key(&config.name) {
            return Err(PvtDataError::Other(format!("peer {} already exists", config.name)));
        }
        let name = config.name.clone();
        let (sender, receiver) = self.net.join(&name, &[&self.channel]);
        let node = PeerNode::start(config, generate_key()?, sender, receiver, self.orderer.deliver(0))?;
        for (cc_name, cc) in &self.chaincodes {
            node.install_chaincode(cc_name, cc.clone());
        }
        node.announce()?;
        self.peers.insert(name.clone(), node);
        self.peer(&name)
    }

    pub fn remove_peer(&mut self, name: &str) {
        if let Some(p) = self.peers.remove(name) {
            p.shutdown();
        }
        self.net.leave(name);
    }

    pub fn peer(&self, name: &str) -> PvtResult<&PeerNode> {
        self.peers
            .get(name)
            .ok_or_else(|| PvtDataError::Other(format!("unknown peer {name}")))
    }

    pub fn peers(&self) -> impl Iterator<Item = &PeerNode> {
        self.peers.values()
    }

    /// Installs `chaincode` on every peer, current and future, and defines it
    /// on the channel through a configuration block.
    pub fn deploy(
        &mut self,
        name: &str,
        chaincode: Arc<dyn Chaincode>,
        endorsement_policy: SignaturePolicyEnvelope,
        collections: Vec<CollectionDefinition>,
    ) -> u64 {
        for p in self.peers.values() {
            p.install_chaincode(name, chaincode.clone());
        }
        self.chaincodes.retain(|(n, _)| n != name);
        self.chaincodes.push((name.to_string(), chaincode));
        self.config.chaincodes.retain(|cc| cc.name != name);
        self.config.chaincodes.push(ChaincodeDefinition {
            name: name.into(),
            endorsement_policy,
            collections,
        });
        let block = self.orderer.submit_config(self.config.clone());
        tracing::info!(chaincode = name, block, "deployed chaincode");
        block
    }

    /// Invokes through `endorsers` as a client of the first endorser's org
    /// and waits for the first endorser to commit.
    pub async fn invoke(&self, endorsers: &[&str], chaincode: &str, args: &[&str]) -> Result<TxEvent, ClientError> {
        let first = endorsers
            .first()
            .ok_or_else(|| ClientError::Endorsement("no endorsers given".into()))?;
        let org = self.peer(first).map_err(|e| ClientError::Endorsement(e.to_string()))?.org().to_string();
        self.invoke_as(&org, endorsers, chaincode, args).await
    }

    pub async fn invoke_as(
        &self,
        client_org: &str,
        endorsers: &[&str],
        chaincode: &str,
        args: &[&str],
    ) -> Result<TxEvent, ClientError> {
        let mut nodes = Vec::with_capacity(endorsers.len());
        for e in endorsers {
            nodes.push(self.peer(e).map_err(|e| ClientError::Endorsement(e.to_string()))?);
        }
        let observer = *nodes
            .first()
            .ok_or_else(|| ClientError::Endorsement("no endorsers given".into()))?;
        Invoker::new(&self.orderer, client_org)
            .invoke(&nodes, observer, chaincode, args)
            .await
    }

    /// Queries `peer` as a client of the peer's own organisation.
    pub fn query(&self, peer: &str, chaincode: &str, args: &[&str]) -> Result<Vec<u8>, ClientError> {
        let node = self.peer(peer).map_err(|e| ClientError::Query(e.to_string()))?;
        Invoker::new(&self.orderer, node.org()).query(node, chaincode, args)
    }

    /// Waits until every peer has committed everything ordered so far.
    pub async fn wait_for_equal_heights(&self, timeout: Duration) -> bool {
        let target = self.orderer.height();
        eventually(timeout, || self.peers.values().all(|p| p.ledger_height() >= target)).await
    }
}

/// Polls `check` until it holds or `timeout` passes.
pub async fn eventually(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
