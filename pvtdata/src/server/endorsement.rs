//! State-based endorsement: key-level policy overrides and the commit-time
//! check of collected endorsements against whichever policy is in force.

use std::collections::HashSet;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use quick_cache::sync::Cache;

use crate::server::registry::CollectionRegistry;
use crate::server::storage::KeyPolicyStorage;
use crate::server::{PvtDataError, PvtResult};
use crate::shared::config;
use crate::shared::crypto::{deserialize_pubkey, verify_signature};
use crate::shared::policy::SignaturePolicyEnvelope;
use crate::shared::pvt_repr::{CollectionDefinition, Endorsement, Identity, PvtKey, Transaction, TxValidationCode};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyPolicy {
    Override(SignaturePolicyEnvelope),
    Default,
}

pub struct EndorsementEngine {
    registry: Arc<CollectionRegistry>,
    policies: KeyPolicyStorage,
    // None caches "no override"
    cache: Cache<PvtKey, Option<SignaturePolicyEnvelope>>,
    // orders cache fills after a miss against replacements
    fill: RwLock<()>,
}

impl EndorsementEngine {
    pub fn new(registry: Arc<CollectionRegistry>, policies: KeyPolicyStorage) -> Self {
        Self {
            registry,
            policies,
            cache: Cache::new(config::CACHE_SIZE),
            fill: RwLock::new(()),
        }
    }

    fn filling(&self) -> RwLockReadGuard<'_, ()> {
        self.fill.read().unwrap_or_else(|e| e.into_inner())
    }

    fn replacing(&self) -> RwLockWriteGuard<'_, ()> {
        self.fill.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Replaces the key's policy in one step. Callers only get here after
    /// the writing transaction passed validation under the previous policy.
    pub fn set_policy(&self, key: &PvtKey, policy: &SignaturePolicyEnvelope) -> PvtResult<()> {
        let bytes = policy.to_bytes()?;
        let _g = self.replacing();
        self.policies.set(key, &bytes)?;
        self.cache.insert(key.clone(), Some(policy.clone()));
        tracing::debug!(%key, "key endorsement policy replaced");
        Ok(())
    }

    pub fn get_policy(&self, key: &PvtKey) -> PvtResult<KeyPolicy> {
        if let Some(cached) = self.cache.get(key) {
            return Ok(cached.map_or(KeyPolicy::Default, KeyPolicy::Override));
        }
        // a fill may not land after a newer set_policy
        let _g = self.filling();
        let stored = match self.policies.get(key)? {
            Some(bytes) => Some(SignaturePolicyEnvelope::from_bytes(&bytes)?),
            None => None,
        };
        self.cache.insert(key.clone(), stored.clone());
        Ok(stored.map_or(KeyPolicy::Default, KeyPolicy::Override))
    }

    /// Serialized override, as handed back to chaincode. Empty when the key
    /// has none.
    pub fn get_policy_bytes(&self, key: &PvtKey) -> PvtResult<Vec<u8>> {
        match self.get_policy(key)? {
            KeyPolicy::Override(p) => Ok(p.to_bytes()?),
            KeyPolicy::Default => Ok(Vec::new()),
        }
    }

    /// Override if present, else the collection's own policy, else the
    /// chaincode's. `+local` never contributes a policy of its own here: its
    /// owner-only rule depends on who resolves it.
    pub fn effective_policy(
        &self,
        key: &PvtKey,
        def: &CollectionDefinition,
        chaincode_policy: &SignaturePolicyEnvelope,
    ) -> PvtResult<SignaturePolicyEnvelope> {
        if let KeyPolicy::Override(p) = self.get_policy(key)? {
            return Ok(p);
        }
        match &def.endorsement_policy {
            Some(p) if !def.is_local() => Ok(p.clone()),
            _ => Ok(chaincode_policy.clone()),
        }
    }

    /// Pass/fail for one key given a set of already verified signers.
    pub fn validate_endorsements(
        &self,
        chaincode: &str,
        collection: &str,
        key: &str,
        signers: &[Identity],
    ) -> PvtResult<bool> {
        let cc_policy = self.registry.chaincode_policy(chaincode)?;
        // org only matters for the synthetic +local definition, whose
        // policy is not consulted
        let def = self.registry.resolve(chaincode, collection, "")?;
        let policy = self.effective_policy(&PvtKey::new(chaincode, collection, key), &def, &cc_policy)?;
        Ok(policy.evaluate(signers))
    }

    /// Commit-time validation of one transaction. The outcome is a code, not
    /// an error: an invalid transaction still occupies its slot in the block.
    pub fn validate(&self, tx: &Transaction) -> PvtResult<TxValidationCode> {
        let digest = tx.rwset.digest(&tx.tx_id)?;
        let signers = verified_signers(&tx.endorsements, &digest);
        if signers.is_empty() {
            return Ok(TxValidationCode::BadSignature);
        }

        let ns = &tx.rwset.namespace;
        let cc_policy = match self.registry.chaincode_policy(ns) {
            Ok(p) => p,
            Err(PvtDataError::Configuration(_)) => return Ok(TxValidationCode::InvalidCollection),
            Err(e) => return Err(e),
        };

        for w in &tx.rwset.policy_writes {
            if SignaturePolicyEnvelope::from_bytes(&w.policy).is_err() {
                return Ok(TxValidationCode::EndorsementPolicyFailure);
            }
        }

        let touched = tx.rwset.touched_keys();
        if touched.is_empty() {
            return Ok(if cc_policy.evaluate(&signers) {
                TxValidationCode::Valid
            } else {
                TxValidationCode::EndorsementPolicyFailure
            });
        }
        for (collection, key) in touched {
            let def = match self.registry.resolve(ns, &collection, "") {
                Ok(d) => d,
                Err(PvtDataError::Configuration(_)) => return Ok(TxValidationCode::InvalidCollection),
                Err(e) => return Err(e),
            };
            let pkey = PvtKey::new(ns, &collection, &key);
            let policy = self.effective_policy(&pkey, &def, &cc_policy)?;
            if !policy.evaluate(&signers) {
                tracing::info!(tx_id = %tx.tx_id, key = %pkey, "endorsement policy not satisfied");
                return Ok(TxValidationCode::EndorsementPolicyFailure);
            }
        }
        Ok(TxValidationCode::Valid)
    }
}

/// Identities whose signature over `digest` checks out, each public key
/// counted once.
pub fn verified_signers(endorsements: &[Endorsement], digest: &[u8; 32]) -> Vec<Identity> {
    let mut seen = HashSet::new();
    let mut res = Vec::new();
    for e in endorsements {
        let pk = match deserialize_pubkey(&e.endorser.public_key) {
            Ok(pk) => pk,
            Err(_) => continue,
        };
        if verify_signature(&e.signature, digest, &pk) && seen.insert(e.endorser.public_key.clone()) {
            res.push(e.endorser.clone());
        }
    }
    res
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::server::storage::PeerStorage;
    use crate::shared::crypto::{generate_key, public_part, serialize_pubkey, sign, PrivateKey};
    use crate::shared::policy::MspRole;
    use crate::shared::pvt_repr::{ChaincodeDefinition, ChannelConfig, PolicyWrite, PvtWriteHash, TxRwSet};

    struct Signer {
        key: PrivateKey,
        identity: Identity,
    }

    fn signer(org: &str) -> Signer {
        let key = generate_key().unwrap();
        let der = serialize_pubkey(&public_part(&key).unwrap()).unwrap();
        Signer {
            key,
            identity: Identity {
                msp_id: org.into(),
                role: MspRole::Peer,
                public_key: der,
            },
        }
    }

    fn engine() -> EndorsementEngine {
        let registry = Arc::new(CollectionRegistry::new());
        registry
            .apply_config(&ChannelConfig {
                channel: "testchannel".into(),
                chaincodes: vec![ChaincodeDefinition {
                    name: "cc".into(),
                    endorsement_policy: SignaturePolicyEnvelope::any_of_orgs(&["Org1MSP", "Org2MSP", "Org3MSP"]),
                    collections: vec![CollectionDefinition {
                        name: "marbles".into(),
                        member_orgs: BTreeSet::from(["Org1MSP".to_string(), "Org2MSP".to_string()]),
                        required_peer_count: 0,
                        max_peer_count: 1,
                        block_to_live: 0,
                        member_only_read: true,
                        endorsement_policy: Some(SignaturePolicyEnvelope::all_of_orgs(&["Org1MSP", "Org2MSP"])),
                    }],
                }],
            })
            .unwrap();
        let db = sled::Config::new().temporary(true).open().unwrap();
        let storage = PeerStorage::open(&db).unwrap();
        EndorsementEngine::new(registry, storage.key_policies)
    }

    fn tx(collection: &str, key: &str, signers: &[&Signer]) -> Transaction {
        let rwset = TxRwSet {
            namespace: "cc".into(),
            pvt_writes: vec![PvtWriteHash {
                collection: collection.into(),
                key: key.into(),
                value_hash: [7; 32],
            }],
            policy_writes: vec![],
        };
        let digest = rwset.digest("tx1").unwrap();
        Transaction {
            tx_id: "tx1".into(),
            channel: "testchannel".into(),
            endorsements: signers
                .iter()
                .map(|s| Endorsement {
                    endorser: s.identity.clone(),
                    signature: sign(&digest, &s.key).unwrap(),
                })
                .collect(),
            rwset,
        }
    }

    #[test]
    fn override_round_trips() {
        let e = engine();
        let key = PvtKey::new("cc", "+local", "foo");
        assert_eq!(e.get_policy(&key).unwrap(), KeyPolicy::Default);
        assert!(e.get_policy_bytes(&key).unwrap().is_empty());

        let p = SignaturePolicyEnvelope::signed_by_org("Org1MSP");
        e.set_policy(&key, &p).unwrap();
        assert_eq!(e.get_policy(&key).unwrap(), KeyPolicy::Override(p.clone()));
        assert_eq!(e.get_policy_bytes(&key).unwrap(), p.to_bytes().unwrap());
    }

    #[test]
    fn override_survives_concurrent_cache_fills() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let e = engine();
        let p = SignaturePolicyEnvelope::signed_by_org("Org1MSP");
        for i in 0..300 {
            let key = PvtKey::new("cc", "+local", &format!("k{i}"));
            let done = AtomicBool::new(false);
            std::thread::scope(|s| {
                s.spawn(|| {
                    while !done.load(Ordering::Acquire) {
                        // evicted entries are refilled from storage
                        let _ = e.cache.remove(&key);
                        e.get_policy(&key).unwrap();
                    }
                });
                e.set_policy(&key, &p).unwrap();
                done.store(true, Ordering::Release);
            });
            assert_eq!(e.get_policy(&key).unwrap(), KeyPolicy::Override(p.clone()), "key {key}");
        }
    }

    #[test]
    fn local_keys_fall_back_to_chaincode_policy() {
        let e = engine();
        let org2 = signer("Org2MSP");
        assert_eq!(e.validate(&tx("+local", "foo", &[&org2])).unwrap(), TxValidationCode::Valid);

        e.set_policy(&PvtKey::new("cc", "+local", "foo"), &SignaturePolicyEnvelope::signed_by_org("Org1MSP"))
            .unwrap();
        assert_eq!(
            e.validate(&tx("+local", "foo", &[&org2])).unwrap(),
            TxValidationCode::EndorsementPolicyFailure
        );
        let org1 = signer("Org1MSP");
        assert_eq!(e.validate(&tx("+local", "foo", &[&org2, &org1])).unwrap(), TxValidationCode::Valid);
        // other keys are unaffected
        assert_eq!(e.validate(&tx("+local", "bar", &[&org2])).unwrap(), TxValidationCode::Valid);
    }

    #[test]
    fn collection_policy_applies_without_override() {
        let e = engine();
        let org1 = signer("Org1MSP");
        let org2 = signer("Org2MSP");
        assert_eq!(
            e.validate(&tx("marbles", "m1", &[&org1])).unwrap(),
            TxValidationCode::EndorsementPolicyFailure
        );
        assert_eq!(e.validate(&tx("marbles", "m1", &[&org1, &org2])).unwrap(), TxValidationCode::Valid);
        assert!(!e.validate_endorsements("cc", "marbles", "m1", &[org1.identity.clone()]).unwrap());
        assert!(e
            .validate_endorsements("cc", "marbles", "m1", &[org1.identity.clone(), org2.identity.clone()])
            .unwrap());
    }

    #[test]
    fn forged_and_unknown_are_rejected() {
        let e = engine();
        let org1 = signer("Org1MSP");
        let mut forged = tx("+local", "foo", &[&org1]);
        forged.endorsements[0].signature = b"nope".to_vec();
        assert_eq!(e.validate(&forged).unwrap(), TxValidationCode::BadSignature);

        // tampering with the write set invalidates the signature
        let mut tampered = tx("+local", "foo", &[&org1]);
        tampered.rwset.pvt_writes[0].value_hash = [8; 32];
        assert_eq!(e.validate(&tampered).unwrap(), TxValidationCode::BadSignature);

        assert_eq!(
            e.validate(&tx("unknown", "foo", &[&org1])).unwrap(),
            TxValidationCode::InvalidCollection
        );
    }

    #[test]
    fn duplicate_endorsements_count_once() {
        let e = engine();
        let org1 = signer("Org1MSP");
        e.set_policy(
            &PvtKey::new("cc", "+local", "foo"),
            &SignaturePolicyEnvelope::all_of_orgs(&["Org1MSP", "Org1MSP"]),
        )
        .unwrap();
        assert_eq!(
            e.validate(&tx("+local", "foo", &[&org1, &org1])).unwrap(),
            TxValidationCode::EndorsementPolicyFailure
        );
    }

    #[test]
    fn malformed_policy_write_fails() {
        let e = engine();
        let org1 = signer("Org1MSP");
        let rwset = TxRwSet {
            namespace: "cc".into(),
            pvt_writes: vec![],
            policy_writes: vec![PolicyWrite {
                collection: "+local".into(),
                key: "foo".into(),
                policy: vec![0xff, 0xff, 0xff],
            }],
        };
        let digest = rwset.digest("tx9").unwrap();
        let t = Transaction {
            tx_id: "tx9".into(),
            channel: "testchannel".into(),
            endorsements: vec![Endorsement {
                endorser: org1.identity.clone(),
                signature: sign(&digest, &org1.key).unwrap(),
            }],
            rwset,
        };
        assert_eq!(e.validate(&t).unwrap(), TxValidationCode::EndorsementPolicyFailure);
    }
}
