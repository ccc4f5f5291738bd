use postcard::{from_bytes, to_stdvec};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sled::{Db, Tree};

use crate::server::membership::is_member;
use crate::server::{PvtDataError, PvtResult};
use crate::shared::crypto::hash_data;
use crate::shared::pvt_repr::{ChannelConfig, CollectionDefinition, PrivateRecord, PublicCommitment, PvtKey, Version};

fn decode<T: DeserializeOwned>(d: Option<sled::IVec>) -> Option<T> {
    d.and_then(|d| from_bytes(&d).ok())
}

/// Every tree a node keeps, opened from one sled database.
#[derive(Clone)]
pub struct PeerStorage {
    pub private: PrivateDataStorage,
    pub commitments: CommitmentStorage,
    pub key_policies: KeyPolicyStorage,
    pub missing: MissingDataStorage,
    pub transient: TransientStorage,
    pub meta: LedgerMeta,
}

impl PeerStorage {
    pub fn open(db: &Db) -> Result<Self, sled::Error> {
        Ok(Self {
            private: PrivateDataStorage(db.open_tree(b"P")?),
            commitments: CommitmentStorage {
                history: db.open_tree(b"C")?,
                latest: db.open_tree(b"L")?,
            },
            key_policies: KeyPolicyStorage(db.open_tree(b"K")?),
            missing: MissingDataStorage(db.open_tree(b"X")?),
            transient: TransientStorage(db.open_tree(b"T")?),
            meta: LedgerMeta(db.open_tree(b"H")?),
        })
    }

    /// Read path for private data. `Ok(None)` when the key was never
    /// committed. When a commitment exists but the matching payload is not
    /// held here, for whatever reason, the answer is `Unavailable`.
    pub fn read_private(&self, key: &PvtKey) -> PvtResult<Option<Vec<u8>>> {
        let commitment = match self.commitments.latest(key)? {
            Some(c) => c,
            None => return Ok(None),
        };
        match self.private.get(key)? {
            Some(r) if r.version == commitment.version && hash_data(&r.value) == commitment.value_hash => {
                Ok(Some(r.value))
            }
            _ => {
                tracing::debug!(%key, version = %commitment.version, "private read unavailable");
                Err(PvtDataError::Unavailable)
            }
        }
    }
}

// key: PvtKey
// value: PrivateRecord, always the highest version seen
#[derive(Clone)]
pub struct PrivateDataStorage(Tree);
impl PrivateDataStorage {
    /// Stores `record` if `org` is a member of `def`; otherwise does nothing
    /// and returns false. Merges by version: an older or equal version never
    /// replaces what is stored, so repeated or reordered deliveries converge.
    pub fn put(&self, def: &CollectionDefinition, org: &str, record: &PrivateRecord) -> PvtResult<bool> {
        if !is_member(org, def) {
            return Ok(false);
        }
        let k = to_stdvec(&record.key)?;
        let encoded = to_stdvec(record)?;
        let new_version = record.version;
        self.0.fetch_and_update(k, |old: Option<&[u8]>| -> Option<Vec<u8>> {
            if let Some(d) = old {
                if let Ok(o) = from_bytes::<PrivateRecord>(d) {
                    if o.version >= new_version {
                        return Some(d.to_vec());
                    }
                }
            }
            Some(encoded.clone())
        })?;
        Ok(true)
    }

    pub fn get(&self, key: &PvtKey) -> PvtResult<Option<PrivateRecord>> {
        Ok(decode(self.0.get(to_stdvec(key)?)?))
    }

    pub fn has_version(&self, key: &PvtKey, version: Version) -> PvtResult<bool> {
        Ok(self.get(key)?.map(|r| r.version == version).unwrap_or(false))
    }

    /// Removes records whose expiry block has been reached. A record replaced
    /// concurrently by a newer write is left alone.
    pub fn purge_expired(&self, current_block: u64) -> PvtResult<usize> {
        let mut purged = 0;
        for item in self.0.iter() {
            let (k, v) = item?;
            let record: PrivateRecord = match from_bytes(&v) {
                Ok(r) => r,
                Err(_) => continue,
            };
            if matches!(record.expiry_block, Some(e) if e <= current_block)
                && self.0.compare_and_swap(&k, Some(&v), None as Option<&[u8]>)?.is_ok()
            {
                purged += 1;
            }
        }
        Ok(purged)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// history key: (PvtKey, Version), value: PublicCommitment, append-only
// latest key: PvtKey, value: highest-version PublicCommitment
#[derive(Clone)]
pub struct CommitmentStorage {
    history: Tree,
    latest: Tree,
}
impl CommitmentStorage {
    /// Appends a commitment. Replaying the same (key, version) is a no-op and
    /// returns false.
    pub fn commit(&self, c: &PublicCommitment) -> PvtResult<bool> {
        let hk = to_stdvec(&(&c.key, c.version))?;
        let encoded = to_stdvec(c)?;
        let fresh = self
            .history
            .compare_and_swap(hk, None as Option<&[u8]>, Some(encoded.clone()))?
            .is_ok();

        let version = c.version;
        self.latest
            .fetch_and_update(to_stdvec(&c.key)?, |old: Option<&[u8]>| -> Option<Vec<u8>> {
                if let Some(d) = old {
                    if let Ok(o) = from_bytes::<PublicCommitment>(d) {
                        if o.version >= version {
                            return Some(d.to_vec());
                        }
                    }
                }
                Some(encoded.clone())
            })?;
        Ok(fresh)
    }

    pub fn latest(&self, key: &PvtKey) -> PvtResult<Option<PublicCommitment>> {
        Ok(decode(self.latest.get(to_stdvec(key)?)?))
    }

    pub fn at_version(&self, key: &PvtKey, version: Version) -> PvtResult<Option<PublicCommitment>> {
        Ok(decode(self.history.get(to_stdvec(&(key, version))?)?))
    }

    /// Whether `value` hashes to the commitment recorded for `version`.
    /// False when nothing was committed at that version.
    pub fn verify(&self, key: &PvtKey, version: Version, value: &[u8]) -> PvtResult<bool> {
        Ok(self
            .at_version(key, version)?
            .map(|c| c.value_hash == hash_data(value))
            .unwrap_or(false))
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }
}

// key: PvtKey
// value: serialized SignaturePolicyEnvelope
#[derive(Clone)]
pub struct KeyPolicyStorage(Tree);
impl KeyPolicyStorage {
    pub fn set(&self, key: &PvtKey, policy: &[u8]) -> PvtResult<()> {
        self.0.insert(to_stdvec(key)?, policy)?;
        Ok(())
    }

    pub fn get(&self, key: &PvtKey) -> PvtResult<Option<Vec<u8>>> {
        Ok(self.0.get(to_stdvec(key)?)?.map(|d| d.to_vec()))
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct MissingEntry {
    pub key: PvtKey,
    pub version: Version,
    pub tx_id: String,
    pub failed_rounds: u32,
    pub abandoned: bool,
    pub expiry_block: Option<u64>,
}

impl MissingEntry {
    pub fn new(key: PvtKey, version: Version, tx_id: &str, expiry_block: Option<u64>) -> Self {
        Self {
            key,
            version,
            tx_id: tx_id.to_string(),
            failed_rounds: 0,
            abandoned: false,
            expiry_block,
        }
    }
}

// key: (PvtKey, Version)
// value: MissingEntry for payloads this node was eligible for at commit but
// does not hold
#[derive(Clone)]
pub struct MissingDataStorage(Tree);
impl MissingDataStorage {
    pub fn insert(&self, entry: &MissingEntry) -> PvtResult<()> {
        let k = to_stdvec(&(&entry.key, entry.version))?;
        // an existing entry keeps its failure count
        let _ = self
            .0
            .compare_and_swap(k, None as Option<&[u8]>, Some(to_stdvec(entry)?))?;
        Ok(())
    }

    pub fn remove(&self, key: &PvtKey, version: Version) -> PvtResult<()> {
        self.0.remove(to_stdvec(&(key, version))?)?;
        Ok(())
    }

    pub fn contains(&self, key: &PvtKey, version: Version) -> PvtResult<bool> {
        Ok(self.0.contains_key(to_stdvec(&(key, version))?)?)
    }

    pub fn list(&self, limit: usize, include_abandoned: bool) -> PvtResult<Vec<MissingEntry>> {
        let mut res = Vec::new();
        for v in self.0.iter().values() {
            if res.len() >= limit {
                break;
            }
            if let Ok(e) = from_bytes::<MissingEntry>(&v?) {
                if include_abandoned || !e.abandoned {
                    res.push(e);
                }
            }
        }
        Ok(res)
    }

    /// Counts one more failed round; past `max_failed_rounds` the entry is
    /// marked abandoned. Returns the updated entry, or None if it is gone.
    pub fn record_failure(
        &self,
        key: &PvtKey,
        version: Version,
        max_failed_rounds: Option<u32>,
    ) -> PvtResult<Option<MissingEntry>> {
        let r = self
            .0
            .update_and_fetch(to_stdvec(&(key, version))?, |old: Option<&[u8]>| -> Option<Vec<u8>> {
                let mut e: MissingEntry = from_bytes(old?).ok()?;
                e.failed_rounds = e.failed_rounds.saturating_add(1);
                if let Some(max) = max_failed_rounds {
                    e.abandoned = e.failed_rounds >= max;
                }
                to_stdvec(&e).ok()
            })?;
        Ok(decode(r))
    }

    pub fn purge_expired(&self, current_block: u64) -> PvtResult<usize> {
        let mut purged = 0;
        for item in self.0.iter() {
            let (k, v) = item?;
            if let Ok(e) = from_bytes::<MissingEntry>(&v) {
                if matches!(e.expiry_block, Some(x) if x <= current_block) {
                    self.0.remove(k)?;
                    purged += 1;
                }
            }
        }
        Ok(purged)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransientOrigin {
    /// Produced by this node's own simulation; it will push it on commit.
    Endorsed,
    /// Received from another node before the block reached us.
    Pushed,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TransientEntry {
    pub payload: Vec<u8>,
    pub origin: TransientOrigin,
    pub received_at_height: u64,
}

// key: (tx_id, PvtKey)
// value: TransientEntry, payloads waiting for their transaction to commit
#[derive(Clone)]
pub struct TransientStorage(Tree);
impl TransientStorage {
    pub fn put(&self, tx_id: &str, key: &PvtKey, entry: &TransientEntry) -> PvtResult<()> {
        let encoded = to_stdvec(entry)?;
        self.0
            .fetch_and_update(to_stdvec(&(tx_id, key))?, |old: Option<&[u8]>| -> Option<Vec<u8>> {
                if let Some(d) = old {
                    // never demote our own endorsement to a pushed copy
                    if let Ok(o) = from_bytes::<TransientEntry>(d) {
                        if o.origin == TransientOrigin::Endorsed {
                            return Some(d.to_vec());
                        }
                    }
                }
                Some(encoded.clone())
            })?;
        Ok(())
    }

    pub fn get(&self, tx_id: &str, key: &PvtKey) -> PvtResult<Option<TransientEntry>> {
        Ok(decode(self.0.get(to_stdvec(&(tx_id, key))?)?))
    }

    pub fn remove_tx(&self, tx_id: &str) -> PvtResult<()> {
        // (tx_id, key) serializes as tx_id's encoding followed by key's
        for k in self.0.scan_prefix(to_stdvec(tx_id)?).keys() {
            self.0.remove(k?)?;
        }
        Ok(())
    }

    pub fn purge_older_than(&self, height: u64) -> PvtResult<usize> {
        let mut purged = 0;
        for item in self.0.iter() {
            let (k, v) = item?;
            if let Ok(e) = from_bytes::<TransientEntry>(&v) {
                if e.received_at_height < height {
                    self.0.remove(k)?;
                    purged += 1;
                }
            }
        }
        Ok(purged)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// key: "HEIGHT", value: number of committed blocks, big endian
// key: "CONFIG", value: last applied ChannelConfig
#[derive(Clone)]
pub struct LedgerMeta(Tree);
impl LedgerMeta {
    pub fn channel_config(&self) -> PvtResult<Option<ChannelConfig>> {
        Ok(decode(self.0.get("CONFIG")?))
    }

    pub fn set_channel_config(&self, config: &ChannelConfig) -> PvtResult<()> {
        self.0.insert("CONFIG", to_stdvec(config)?)?;
        Ok(())
    }

    pub fn height(&self) -> PvtResult<u64> {
        Ok(match self.0.get("HEIGHT")? {
            Some(d) if d.len() == 8 => {
                let mut b = [0u8; 8];
                b.copy_from_slice(&d);
                u64::from_be_bytes(b)
            }
            _ => 0,
        })
    }

    pub fn set_height(&self, height: u64) -> PvtResult<()> {
        self.0.insert("HEIGHT", &height.to_be_bytes())?;
        Ok(())
    }
}
