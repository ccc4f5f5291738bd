use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use fakep2p::{P2PMessageBody, P2PReceiver, P2PSender};
use postcard::{from_bytes, to_stdvec};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::chaincode::Chaincode;
use crate::shared::config::{PeerConfig, EVENT_BUFFER};
use crate::shared::crypto::{public_part, serialize_pubkey, PrivateKey};
use crate::shared::policy::MspRole;
use crate::shared::pvt_repr::{Block, Identity, PvtKey, TxEvent};
use crate::shared::request::{PeerMessage, PeerMeta, Proposal, ProposalResponse};

use super::endorsement::EndorsementEngine;
use super::membership::{PeerDirectory, PeerInfo};
use super::registry::CollectionRegistry;
use super::storage::{MissingEntry, PeerStorage};
use super::{anti_entropy, committer, dissemination, endorser, PvtResult};

type Waiting = HashMap<(String, u64), oneshot::Sender<PeerMessage>>;

/// Replies we are waiting for, keyed by the peer asked and the request id.
/// Only that peer can answer.
#[derive(Default)]
pub(crate) struct PendingReplies {
    next_id: AtomicU64,
    waiting: Mutex<Waiting>,
}

impl PendingReplies {
    fn waiting(&self) -> std::sync::MutexGuard<'_, Waiting> {
        match self.waiting.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn register(&self, dest: &str) -> (u64, oneshot::Receiver<PeerMessage>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (s, r) = oneshot::channel();
        self.waiting().insert((dest.to_string(), id), s);
        (id, r)
    }

    /// Hands a reply from `sender` to its waiter. Late, unknown or
    /// misdirected replies are dropped.
    fn resolve(&self, sender: &str, msg: PeerMessage) {
        let id = match msg.reply_to() {
            Some(id) => id,
            None => return,
        };
        if let Some(s) = self.waiting().remove(&(sender.to_string(), id)) {
            let _ = s.send(msg);
        }
    }

    fn cancel(&self, dest: &str, id: u64) {
        self.waiting().remove(&(dest.to_string(), id));
    }
}

#[derive(Clone)]
pub(crate) struct NodeContext {
    pub name: String,
    pub config: Arc<PeerConfig>,
    pub identity: Identity,
    pub signing_key: PrivateKey,
    pub registry: Arc<CollectionRegistry>,
    pub storage: PeerStorage,
    pub engine: Arc<EndorsementEngine>,
    pub directory: Arc<PeerDirectory>,
    pub chaincodes: Arc<RwLock<HashMap<String, Arc<dyn Chaincode>>>>,
    pub events: broadcast::Sender<TxEvent>,
    sender: P2PSender,
    pending: Arc<PendingReplies>,
}

impl NodeContext {
    pub fn org(&self) -> &str {
        &self.config.org
    }

    pub fn height(&self) -> u64 {
        self.storage.meta.height().unwrap_or(0)
    }

    pub fn chaincode(&self, name: &str) -> Option<Arc<dyn Chaincode>> {
        let ccs = match self.chaincodes.read() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        ccs.get(name).cloned()
    }

    fn envelope(&self, dest: &str, msg: &PeerMessage) -> PvtResult<P2PMessageBody> {
        let meta = PeerMeta {
            org: self.config.org.clone(),
            height: self.height(),
        };
        Ok(P2PMessageBody {
            dest: dest.into(),
            sender: self.name.clone(),
            content: to_stdvec(msg)?,
            metadata: to_stdvec(&meta)?,
        })
    }

    pub fn send(&self, dest: &str, msg: &PeerMessage) -> PvtResult<()> {
        self.sender.send_one(self.envelope(dest, msg)?)?;
        Ok(())
    }

    /// Tells the channel who we are and how far our ledger got.
    pub fn announce(&self) -> PvtResult<()> {
        let alive = PeerMessage::Alive {
            org: self.config.org.clone(),
            height: self.height(),
        };
        self.sender.send_multi(self.envelope(&self.config.channel, &alive)?)?;
        Ok(())
    }

    /// Sends a request built around a fresh request id and waits up to
    /// `timeout` for the matching reply.
    pub async fn request(
        &self,
        dest: &str,
        build: impl FnOnce(u64) -> PeerMessage,
        timeout: Duration,
    ) -> Option<PeerMessage> {
        let (id, rx) = self.pending.register(dest);
        if let Err(e) = self.send(dest, &build(id)) {
            tracing::debug!(dest, "request not sent: {}", e);
            self.pending.cancel(dest, id);
            return None;
        }
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Some(reply),
            _ => {
                self.pending.cancel(dest, id);
                None
            }
        }
    }
}

async fn receive_loop(ctx: NodeContext, mut rcv: P2PReceiver) {
    loop {
        let m = match rcv.receive().await {
            Some(Ok(m)) => m,
            Some(Err(e)) => {
                tracing::error!(peer = %ctx.name, "receive failed: {:?}", e);
                return;
            }
            None => {
                tracing::info!(peer = %ctx.name, "message stream ended");
                return;
            }
        };
        if let Ok(meta) = from_bytes::<PeerMeta>(&m.metadata) {
            ctx.directory.update(&m.sender, &meta.org, meta.height);
        }
        let msg: PeerMessage = match from_bytes(&m.content) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!(from = %m.sender, "could not decode: {:?}", e);
                continue;
            }
        };
        if msg.reply_to().is_some() {
            ctx.pending.resolve(&m.sender, msg);
            continue;
        }
        match msg {
            PeerMessage::Alive { org, height } => ctx.directory.update(&m.sender, &org, height),
            PeerMessage::Push {
                request_id,
                tx_id,
                key,
                version,
                payload,
            } => match dissemination::receive_push(&ctx, &m.sender, &tx_id, &key, version, payload) {
                Ok(true) => {
                    if let Err(e) = ctx.send(&m.sender, &PeerMessage::PushAck { request_id }) {
                        tracing::debug!("ack not sent: {}", e);
                    }
                }
                Ok(false) => {}
                Err(e) => tracing::error!(peer = %ctx.name, "handling push failed: {}", e),
            },
            PeerMessage::PullRequest {
                request_id,
                key,
                version,
            } => {
                let payload = anti_entropy::serve_pull(&ctx, &m.sender, &key, version);
                let reply = PeerMessage::PullResponse { request_id, payload };
                if let Err(e) = ctx.send(&m.sender, &reply) {
                    tracing::debug!("pull response not sent: {}", e);
                }
            }
            _ => {}
        }
    }
}

/// One peer of the channel: it endorses, commits delivered blocks, pushes
/// and pulls private payloads. Background tasks stop when it is dropped.
pub struct PeerNode {
    ctx: NodeContext,
    tasks: Vec<JoinHandle<()>>,
}

impl PeerNode {
    /// Starts the node's tasks on the current tokio runtime. `blocks` is the
    /// ordered block stream for the node's channel.
    pub fn start(
        config: PeerConfig,
        signing_key: PrivateKey,
        sender: P2PSender,
        receiver: P2PReceiver,
        blocks: mpsc::UnboundedReceiver<Arc<Block>>,
    ) -> PvtResult<Self> {
        let db = match &config.db_path {
            Some(path) => sled::open(path)?,
            None => sled::Config::new().temporary(true).open()?,
        };
        let storage = PeerStorage::open(&db)?;
        let registry = Arc::new(CollectionRegistry::new());
        if let Some(cfg) = storage.meta.channel_config()? {
            registry.apply_config(&cfg)?;
        }
        let engine = Arc::new(EndorsementEngine::new(registry.clone(), storage.key_policies.clone()));
        let identity = Identity {
            msp_id: config.org.clone(),
            role: MspRole::Peer,
            public_key: serialize_pubkey(&public_part(&signing_key)?)?,
        };
        let (events, _) = broadcast::channel(EVENT_BUFFER);

        let ctx = NodeContext {
            name: config.name.clone(),
            config: Arc::new(config),
            identity,
            signing_key,
            registry,
            storage,
            engine,
            directory: Arc::new(PeerDirectory::new()),
            chaincodes: Arc::new(RwLock::new(HashMap::new())),
            events,
            sender,
            pending: Arc::new(PendingReplies::default()),
        };

        let tasks = vec![
            tokio::spawn(committer::run(ctx.clone(), blocks)),
            tokio::spawn(receive_loop(ctx.clone(), receiver)),
            tokio::spawn(anti_entropy::run(ctx.clone())),
        ];
        tracing::info!(peer = %ctx.name, org = %ctx.org(), "peer started");
        Ok(Self { ctx, tasks })
    }

    pub fn name(&self) -> &str {
        &self.ctx.name
    }

    pub fn org(&self) -> &str {
        self.ctx.org()
    }

    pub fn identity(&self) -> &Identity {
        &self.ctx.identity
    }

    pub fn install_chaincode(&self, name: &str, chaincode: Arc<dyn Chaincode>) {
        let mut ccs = match self.ctx.chaincodes.write() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        ccs.insert(name.to_string(), chaincode);
    }

    pub fn endorse(&self, proposal: &Proposal) -> PvtResult<ProposalResponse> {
        endorser::endorse(&self.ctx, proposal)
    }

    pub fn query(&self, proposal: &Proposal) -> PvtResult<Vec<u8>> {
        endorser::query(&self.ctx, proposal)
    }

    /// Commit outcomes of every transaction from now on.
    pub fn subscribe_events(&self) -> broadcast::Receiver<TxEvent> {
        self.ctx.events.subscribe()
    }

    pub fn ledger_height(&self) -> u64 {
        self.ctx.height()
    }

    /// Node-local read, without any client-side membership check.
    pub fn get_private(&self, namespace: &str, collection: &str, key: &str) -> PvtResult<Option<Vec<u8>>> {
        self.ctx.storage.read_private(&PvtKey::new(namespace, collection, key))
    }

    pub fn get_key_policy(&self, namespace: &str, collection: &str, key: &str) -> PvtResult<Vec<u8>> {
        self.ctx.engine.get_policy_bytes(&PvtKey::new(namespace, collection, key))
    }

    /// Payloads this node is entitled to but does not hold, abandoned ones
    /// included.
    pub fn missing_private_data(&self) -> PvtResult<Vec<MissingEntry>> {
        self.ctx.storage.missing.list(usize::MAX, true)
    }

    pub fn private_record_count(&self) -> usize {
        self.ctx.storage.private.len()
    }

    pub fn known_peers(&self) -> Vec<PeerInfo> {
        self.ctx.directory.all()
    }

    pub fn announce(&self) -> PvtResult<()> {
        self.ctx.announce()
    }

    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        for t in self.tasks.drain(..) {
            t.abort();
        }
        tracing::info!(peer = %self.ctx.name, "peer stopped");
    }
}

impl Drop for PeerNode {
    fn drop(&mut self) {
        if !self.tasks.is_empty() {
            self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn replies_reach_their_waiter_once() {
        let p = PendingReplies::default();
        let (a, ra) = p.register("peer0.org1");
        let (b, rb) = p.register("peer0.org2");
        assert_ne!(a, b);
        p.resolve("peer0.org2", PeerMessage::PushAck { request_id: b });
        // duplicate is ignored
        p.resolve("peer0.org2", PeerMessage::PushAck { request_id: b });
        assert_eq!(rb.await.unwrap(), PeerMessage::PushAck { request_id: b });
        p.cancel("peer0.org1", a);
        assert!(ra.await.is_err());
    }

    #[tokio::test]
    async fn only_the_asked_peer_can_reply() {
        let p = PendingReplies::default();
        let (id, mut rx) = p.register("peer0.org2");
        p.resolve("mallory", PeerMessage::PushAck { request_id: id });
        assert!(rx.try_recv().is_err());
        p.resolve("peer0.org2", PeerMessage::PushAck { request_id: id });
        assert_eq!(rx.await.unwrap(), PeerMessage::PushAck { request_id: id });
    }
}
