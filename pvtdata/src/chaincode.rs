use crate::server::endorsement::EndorsementEngine;
use crate::server::membership::is_member;
use crate::server::registry::CollectionRegistry;
use crate::server::storage::PeerStorage;
use crate::server::{PvtDataError, PvtResult};
use crate::shared::policy::SignaturePolicyEnvelope;
use crate::shared::pvt_repr::{CollectionDefinition, PolicyWrite, PvtKey};

/// Contract code run during endorsement and queries. It only sees the
/// ledger through its stub.
pub trait Chaincode: Send + Sync {
    fn invoke(&self, stub: &mut ChaincodeStub<'_>) -> PvtResult<Vec<u8>>;
}

pub(crate) struct PendingWrite {
    pub def: CollectionDefinition,
    pub key: String,
    pub value: Vec<u8>,
}

/// One simulation. Writes are collected here and only reach the ledger once
/// the resulting transaction commits.
pub struct ChaincodeStub<'a> {
    namespace: String,
    args: Vec<String>,
    node_org: String,
    client_org: String,
    registry: &'a CollectionRegistry,
    storage: &'a PeerStorage,
    engine: &'a EndorsementEngine,
    pvt_writes: Vec<PendingWrite>,
    policy_writes: Vec<PolicyWrite>,
}

impl<'a> ChaincodeStub<'a> {
    pub(crate) fn new(
        namespace: &str,
        args: &[String],
        node_org: &str,
        client_org: &str,
        registry: &'a CollectionRegistry,
        storage: &'a PeerStorage,
        engine: &'a EndorsementEngine,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            args: args.to_vec(),
            node_org: node_org.into(),
            client_org: client_org.into(),
            registry,
            storage,
            engine,
            pvt_writes: Vec::new(),
            policy_writes: Vec::new(),
        }
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    fn resolve(&self, collection: &str) -> PvtResult<CollectionDefinition> {
        self.registry.resolve(&self.namespace, collection, &self.node_org)
    }

    pub fn put_private(&mut self, collection: &str, key: &str, value: &[u8]) -> PvtResult<()> {
        let def = self.resolve(collection)?;
        self.pvt_writes.retain(|w| !(w.def.name == def.name && w.key == key));
        self.pvt_writes.push(PendingWrite {
            def,
            key: key.into(),
            value: value.to_vec(),
        });
        Ok(())
    }

    /// Committed value only; writes of this same simulation are not visible.
    pub fn get_private(&self, collection: &str, key: &str) -> PvtResult<Option<Vec<u8>>> {
        let def = self.resolve(collection)?;
        if def.member_only_read && !is_member(&self.client_org, &def) {
            return Err(PvtDataError::Unavailable);
        }
        self.storage.read_private(&PvtKey::new(&self.namespace, collection, key))
    }

    pub fn set_key_policy(&mut self, collection: &str, key: &str, policy: &SignaturePolicyEnvelope) -> PvtResult<()> {
        self.resolve(collection)?;
        let policy = policy.to_bytes()?;
        self.policy_writes.retain(|w| !(w.collection == collection && w.key == key));
        self.policy_writes.push(PolicyWrite {
            collection: collection.into(),
            key: key.into(),
            policy,
        });
        Ok(())
    }

    /// Serialized override, empty when the key follows the default.
    pub fn get_key_policy(&self, collection: &str, key: &str) -> PvtResult<Vec<u8>> {
        self.resolve(collection)?;
        self.engine.get_policy_bytes(&PvtKey::new(&self.namespace, collection, key))
    }

    pub(crate) fn into_writes(self) -> (Vec<PendingWrite>, Vec<PolicyWrite>) {
        (self.pvt_writes, self.policy_writes)
    }
}

/// Private data chaincode used by the demo and the tests.
///
/// - `put <coll> <key> <value> [<coll> <key> <value>]...`
/// - `get <coll> <key>`
/// - `metaset <coll> <key> <org>...` requires a signature from every org
/// - `metaget <coll> <key>`
/// - `putandset <coll> <key> <value> <org>...`
pub struct SimplePvtData;

fn bad_args(f: &str) -> PvtDataError {
    PvtDataError::Chaincode(format!("wrong number of arguments for {f}"))
}

impl Chaincode for SimplePvtData {
    fn invoke(&self, stub: &mut ChaincodeStub<'_>) -> PvtResult<Vec<u8>> {
        let args = stub.args().to_vec();
        let (f, rest) = match args.split_first() {
            Some((f, rest)) => (f.as_str(), rest),
            None => return Err(PvtDataError::Chaincode("no function given".into())),
        };
        match f {
            "put" => {
                if rest.is_empty() || rest.len() % 3 != 0 {
                    return Err(bad_args(f));
                }
                for w in rest.chunks(3) {
                    stub.put_private(&w[0], &w[1], w[2].as_bytes())?;
                }
                Ok(Vec::new())
            }
            "get" => {
                if rest.len() != 2 {
                    return Err(bad_args(f));
                }
                Ok(stub.get_private(&rest[0], &rest[1])?.unwrap_or_default())
            }
            "metaset" => {
                if rest.len() < 3 {
                    return Err(bad_args(f));
                }
                let orgs: Vec<&str> = rest[2..].iter().map(String::as_str).collect();
                stub.set_key_policy(&rest[0], &rest[1], &SignaturePolicyEnvelope::all_of_orgs(&orgs))?;
                Ok(Vec::new())
            }
            "metaget" => {
                if rest.len() != 2 {
                    return Err(bad_args(f));
                }
                stub.get_key_policy(&rest[0], &rest[1])
            }
            "putandset" => {
                if rest.len() < 4 {
                    return Err(bad_args(f));
                }
                let orgs: Vec<&str> = rest[3..].iter().map(String::as_str).collect();
                stub.put_private(&rest[0], &rest[1], rest[2].as_bytes())?;
                stub.set_key_policy(&rest[0], &rest[1], &SignaturePolicyEnvelope::all_of_orgs(&orgs))?;
                Ok(Vec::new())
            }
            other => Err(PvtDataError::Chaincode(format!("unknown function {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::shared::pvt_repr::{ChaincodeDefinition, ChannelConfig};

    struct Fixture {
        registry: Arc<CollectionRegistry>,
        storage: PeerStorage,
        engine: EndorsementEngine,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(CollectionRegistry::new());
        registry
            .apply_config(&ChannelConfig {
                channel: "testchannel".into(),
                chaincodes: vec![ChaincodeDefinition {
                    name: "pvtdatacc".into(),
                    endorsement_policy: SignaturePolicyEnvelope::any_of_orgs(&["Org1MSP", "Org2MSP"]),
                    collections: vec![],
                }],
            })
            .unwrap();
        let db = sled::Config::new().temporary(true).open().unwrap();
        let storage = PeerStorage::open(&db).unwrap();
        let engine = EndorsementEngine::new(registry.clone(), storage.key_policies.clone());
        Fixture {
            registry,
            storage,
            engine,
        }
    }

    fn run(fx: &Fixture, args: &[&str]) -> (PvtResult<Vec<u8>>, Vec<PendingWrite>, Vec<PolicyWrite>) {
        let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        let mut stub = ChaincodeStub::new(
            "pvtdatacc",
            &args,
            "Org1MSP",
            "Org1MSP",
            &fx.registry,
            &fx.storage,
            &fx.engine,
        );
        let res = SimplePvtData.invoke(&mut stub);
        let (w, p) = stub.into_writes();
        (res, w, p)
    }

    #[test]
    fn put_takes_triples() {
        let fx = fixture();
        let (res, writes, _) = run(&fx, &["put", "+local", "foo", "bar6", "+local", "baz", "x"]);
        assert!(res.is_ok());
        assert_eq!(writes.len(), 2);
        assert!(writes[0].def.is_local());
        assert_eq!(writes[1].value, b"x");

        let (res, _, _) = run(&fx, &["put", "+local", "foo"]);
        assert!(matches!(res, Err(PvtDataError::Chaincode(_))));
    }

    #[test]
    fn unknown_collection_is_a_configuration_error() {
        let fx = fixture();
        let (res, _, _) = run(&fx, &["put", "collectionMarbles", "foo", "bar"]);
        assert!(matches!(res, Err(PvtDataError::Configuration(_))));
    }

    #[test]
    fn putandset_writes_both() {
        let fx = fixture();
        let (res, writes, policies) = run(&fx, &["putandset", "+local", "foo1", "bar3", "Org1MSP"]);
        assert!(res.is_ok());
        assert_eq!(writes.len(), 1);
        assert_eq!(
            policies[0].policy,
            SignaturePolicyEnvelope::signed_by_org("Org1MSP").to_bytes().unwrap()
        );
    }

    #[test]
    fn reads_of_absent_keys_are_empty() {
        let fx = fixture();
        let (res, _, _) = run(&fx, &["get", "+local", "nothing"]);
        assert_eq!(res.unwrap(), Vec::<u8>::new());
        let (res, _, _) = run(&fx, &["metaget", "+local", "nothing"]);
        assert_eq!(res.unwrap(), Vec::<u8>::new());
        let (res, _, _) = run(&fx, &["frobnicate"]);
        assert!(res.is_err());
    }
}
