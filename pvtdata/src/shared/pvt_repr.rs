use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::shared::config::LOCAL_COLLECTION;
use crate::shared::crypto::{hash_parts, Hash, Signature};
use crate::shared::policy::{MspRole, PolicySpec, SignaturePolicyEnvelope};

/// Position of a committed write: (block number, transaction number).
/// Later writes always compare greater.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    pub block_num: u64,
    pub tx_num: u64,
}

impl Version {
    pub fn new(block_num: u64, tx_num: u64) -> Self {
        Self { block_num, tx_num }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.block_num, self.tx_num)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CollectionDefinition {
    pub name: String,
    pub member_orgs: BTreeSet<String>,
    pub required_peer_count: u32,
    pub max_peer_count: u32,
    // 0 = keep forever
    pub block_to_live: u64,
    pub member_only_read: bool,
    pub endorsement_policy: Option<SignaturePolicyEnvelope>,
}

impl CollectionDefinition {
    /// The implicit collection `+local` as seen by `org`: only `org`, never
    /// disseminated, owner-only policy.
    pub fn local_for(org: &str) -> Self {
        Self {
            name: LOCAL_COLLECTION.into(),
            member_orgs: BTreeSet::from([org.to_string()]),
            required_peer_count: 0,
            max_peer_count: 0,
            block_to_live: 0,
            member_only_read: true,
            endorsement_policy: Some(SignaturePolicyEnvelope::signed_by_org(org)),
        }
    }

    pub fn is_local(&self) -> bool {
        self.name == LOCAL_COLLECTION
    }

    /// First block at which a record committed at `version` is gone. It
    /// stays readable for `block_to_live` blocks after its own.
    pub fn expiry_block(&self, version: Version) -> Option<u64> {
        if self.block_to_live == 0 {
            None
        } else {
            Some(version.block_num.saturating_add(self.block_to_live).saturating_add(1))
        }
    }
}

/// One entry of a collection configuration file.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CollectionConfig {
    pub name: String,
    pub member_orgs: Vec<String>,
    #[serde(default)]
    pub required_peer_count: u32,
    #[serde(default = "default_max_peer_count")]
    pub max_peer_count: u32,
    #[serde(default)]
    pub block_to_live: u64,
    #[serde(default)]
    pub member_only_read: bool,
    #[serde(default)]
    pub endorsement_policy: Option<PolicySpec>,
}

fn default_max_peer_count() -> u32 {
    1
}

impl CollectionConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.name.is_empty() {
            return Err("collection name is empty".into());
        }
        if self.name == LOCAL_COLLECTION {
            return Err(format!("collection name {LOCAL_COLLECTION} is reserved"));
        }
        if self.member_orgs.is_empty() {
            return Err(format!("collection {} has no member organizations", self.name));
        }
        if self.required_peer_count > self.max_peer_count {
            return Err(format!(
                "collection {}: required_peer_count {} exceeds max_peer_count {}",
                self.name, self.required_peer_count, self.max_peer_count
            ));
        }
        if let Some(spec) = &self.endorsement_policy {
            spec.to_envelope()
                .check()
                .map_err(|e| format!("collection {}: {e}", self.name))?;
        }
        Ok(())
    }

    pub fn to_definition(&self) -> CollectionDefinition {
        CollectionDefinition {
            name: self.name.clone(),
            member_orgs: self.member_orgs.iter().cloned().collect(),
            required_peer_count: self.required_peer_count,
            max_peer_count: self.max_peer_count,
            block_to_live: self.block_to_live,
            member_only_read: self.member_only_read,
            endorsement_policy: self.endorsement_policy.as_ref().map(PolicySpec::to_envelope),
        }
    }
}

pub fn parse_collections_config(json: &str) -> Result<Vec<CollectionConfig>, String> {
    let configs: Vec<CollectionConfig> = serde_json::from_str(json).map_err(|e| e.to_string())?;
    let mut seen = BTreeSet::new();
    for c in &configs {
        c.validate()?;
        if !seen.insert(c.name.clone()) {
            return Err(format!("duplicate collection name {}", c.name));
        }
    }
    Ok(configs)
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ChaincodeDefinition {
    pub name: String,
    pub endorsement_policy: SignaturePolicyEnvelope,
    pub collections: Vec<CollectionDefinition>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct ChannelConfig {
    pub channel: String,
    pub chaincodes: Vec<ChaincodeDefinition>,
}

/// Identifies one private key slot: chaincode namespace, collection, key.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PvtKey {
    pub namespace: String,
    pub collection: String,
    pub key: String,
}

impl PvtKey {
    pub fn new(namespace: &str, collection: &str, key: &str) -> Self {
        Self {
            namespace: namespace.into(),
            collection: collection.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for PvtKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.collection, self.key)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PrivateRecord {
    pub key: PvtKey,
    pub value: Vec<u8>,
    pub version: Version,
    pub expiry_block: Option<u64>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PublicCommitment {
    pub key: PvtKey,
    pub value_hash: Hash,
    pub version: Version,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity {
    pub msp_id: String,
    pub role: MspRole,
    pub public_key: Vec<u8>, // DER
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Endorsement {
    pub endorser: Identity,
    pub signature: Signature,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PvtWriteHash {
    pub collection: String,
    pub key: String,
    pub value_hash: Hash,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PolicyWrite {
    pub collection: String,
    pub key: String,
    pub policy: Vec<u8>, // serialized SignaturePolicyEnvelope
}

/// The public half of a simulated transaction. Private values never appear
/// here, only their hashes.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct TxRwSet {
    pub namespace: String,
    pub pvt_writes: Vec<PvtWriteHash>,
    pub policy_writes: Vec<PolicyWrite>,
}

impl TxRwSet {
    pub fn digest(&self, tx_id: &str) -> Result<Hash, openssl::error::ErrorStack> {
        let mut parts: Vec<&[u8]> = vec![tx_id.as_bytes(), self.namespace.as_bytes()];
        for w in &self.pvt_writes {
            parts.extend([w.collection.as_bytes(), w.key.as_bytes(), &w.value_hash[..]]);
        }
        for w in &self.policy_writes {
            parts.extend([w.collection.as_bytes(), w.key.as_bytes(), &w.policy[..]]);
        }
        hash_parts(parts)
    }

    /// Every (collection, key) this transaction touches, in write order,
    /// without repeats.
    pub fn touched_keys(&self) -> Vec<(String, String)> {
        let mut out: Vec<(String, String)> = Vec::new();
        let all = self
            .pvt_writes
            .iter()
            .map(|w| (&w.collection, &w.key))
            .chain(self.policy_writes.iter().map(|w| (&w.collection, &w.key)));
        for (c, k) in all {
            if !out.iter().any(|(oc, ok)| oc == c && ok == k) {
                out.push((c.clone(), k.clone()));
            }
        }
        out
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub tx_id: String,
    pub channel: String,
    pub rwset: TxRwSet,
    pub endorsements: Vec<Endorsement>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum BlockData {
    Config(ChannelConfig),
    Transactions(Vec<Transaction>),
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub number: u64,
    pub data: BlockData,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxValidationCode {
    Valid,
    EndorsementPolicyFailure,
    InvalidCollection,
    BadSignature,
}

impl fmt::Display for TxValidationCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TxValidationCode::Valid => "VALID",
            TxValidationCode::EndorsementPolicyFailure => "ENDORSEMENT_POLICY_FAILURE",
            TxValidationCode::InvalidCollection => "INVALID_COLLECTION",
            TxValidationCode::BadSignature => "BAD_SIGNATURE",
        };
        f.write_str(s)
    }
}

/// Emitted by a peer once a transaction's fate is fixed in its ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxEvent {
    pub tx_id: String,
    pub block_num: u64,
    pub code: TxValidationCode,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn versions_order_by_block_then_tx() {
        assert!(Version::new(3, 9) < Version::new(4, 0));
        assert!(Version::new(4, 0) < Version::new(4, 1));
    }

    #[test]
    fn local_definition_is_owner_only() {
        let d = CollectionDefinition::local_for("Org2MSP");
        assert!(d.is_local());
        assert_eq!(d.member_orgs.len(), 1);
        assert!(d.member_orgs.contains("Org2MSP"));
        assert_eq!(d.max_peer_count, 0);
        assert!(d.member_only_read);
        assert_eq!(d.expiry_block(Version::new(10, 0)), None);
    }

    #[test]
    fn block_to_live_sets_expiry() {
        let mut d = CollectionDefinition::local_for("Org1MSP");
        d.block_to_live = 5;
        // readable through block 15, gone from 16
        assert_eq!(d.expiry_block(Version::new(10, 2)), Some(16));
    }

    #[test]
    fn collections_config_validation() {
        let ok = r#"[{"name":"collectionMarbles","member_orgs":["Org1MSP","Org2MSP"],
                      "required_peer_count":1,"max_peer_count":3,"member_only_read":true,
                      "endorsement_policy":{"any_of":["Org1MSP"]}}]"#;
        let parsed = parse_collections_config(ok).unwrap();
        assert_eq!(parsed[0].to_definition().member_orgs.len(), 2);
        assert!(parsed[0].to_definition().endorsement_policy.is_some());

        let reserved = r#"[{"name":"+local","member_orgs":["Org1MSP"]}]"#;
        assert!(parse_collections_config(reserved).is_err());

        let empty = r#"[{"name":"c","member_orgs":[]}]"#;
        assert!(parse_collections_config(empty).is_err());

        let counts = r#"[{"name":"c","member_orgs":["A"],"required_peer_count":3,"max_peer_count":2}]"#;
        assert!(parse_collections_config(counts).is_err());

        let dup = r#"[{"name":"c","member_orgs":["A"]},{"name":"c","member_orgs":["B"]}]"#;
        assert!(parse_collections_config(dup).is_err());

        let nobody = r#"[{"name":"c","member_orgs":["A"],"endorsement_policy":{"any_of":[]}}]"#;
        assert!(parse_collections_config(nobody).is_err());
        let too_many = r#"[{"name":"c","member_orgs":["A"],"endorsement_policy":{"n_of":{"n":3,"orgs":["A","B"]}}}]"#;
        assert!(parse_collections_config(too_many).is_err());
    }

    #[test]
    fn digest_covers_policy_writes() {
        let mut rw = TxRwSet {
            namespace: "cc".into(),
            ..Default::default()
        };
        let before = rw.digest("tx1").unwrap();
        rw.policy_writes.push(PolicyWrite {
            collection: "+local".into(),
            key: "foo".into(),
            policy: vec![1, 2, 3],
        });
        assert_ne!(before, rw.digest("tx1").unwrap());
        assert_ne!(rw.digest("tx1").unwrap(), rw.digest("tx2").unwrap());
    }

    #[test]
    fn touched_keys_dedupes() {
        let rw = TxRwSet {
            namespace: "cc".into(),
            pvt_writes: vec![PvtWriteHash {
                collection: "+local".into(),
                key: "foo".into(),
                value_hash: [0; 32],
            }],
            policy_writes: vec![PolicyWrite {
                collection: "+local".into(),
                key: "foo".into(),
                policy: vec![],
            }],
        };
        assert_eq!(rw.touched_keys(), vec![("+local".to_string(), "foo".to_string())]);
    }
}
