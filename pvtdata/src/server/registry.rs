use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::server::{PvtDataError, PvtResult};
use crate::shared::config::LOCAL_COLLECTION;
use crate::shared::policy::SignaturePolicyEnvelope;
use crate::shared::pvt_repr::{ChaincodeDefinition, ChannelConfig, CollectionDefinition};

struct ChaincodeEntry {
    endorsement_policy: SignaturePolicyEnvelope,
    collections: HashMap<String, CollectionDefinition>,
}

#[derive(Default)]
struct ChannelState {
    channel: String,
    chaincodes: HashMap<String, ChaincodeEntry>,
}

/// Collection definitions of one channel. A configuration block replaces the
/// whole state at once, so a reader sees either the old or the new snapshot.
#[derive(Default)]
pub struct CollectionRegistry {
    state: RwLock<Arc<ChannelState>>,
}

impl CollectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn snapshot(&self) -> Arc<ChannelState> {
        match self.state.read() {
            Ok(g) => g.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn apply_config(&self, config: &ChannelConfig) -> PvtResult<()> {
        let mut chaincodes = HashMap::new();
        for cc in &config.chaincodes {
            chaincodes.insert(cc.name.clone(), build_entry(cc)?);
        }
        let next = Arc::new(ChannelState {
            channel: config.channel.clone(),
            chaincodes,
        });
        match self.state.write() {
            Ok(mut g) => *g = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
        tracing::info!(channel = %config.channel, chaincodes = config.chaincodes.len(), "applied channel configuration");
        Ok(())
    }

    pub fn channel(&self) -> String {
        self.snapshot().channel.clone()
    }

    pub fn has_chaincode(&self, chaincode: &str) -> bool {
        self.snapshot().chaincodes.contains_key(chaincode)
    }

    /// Resolves `name` for a caller in `requester_org`. `+local` is built on
    /// the spot from the requester's organisation and never stored.
    pub fn resolve(&self, chaincode: &str, name: &str, requester_org: &str) -> PvtResult<CollectionDefinition> {
        let state = self.snapshot();
        let cc = state
            .chaincodes
            .get(chaincode)
            .ok_or_else(|| PvtDataError::Configuration(format!("chaincode {chaincode} is not defined")))?;
        if name == LOCAL_COLLECTION {
            return Ok(CollectionDefinition::local_for(requester_org));
        }
        cc.collections.get(name).cloned().ok_or_else(|| {
            PvtDataError::Configuration(format!("collection {name} is not defined for chaincode {chaincode}"))
        })
    }

    pub fn chaincode_policy(&self, chaincode: &str) -> PvtResult<SignaturePolicyEnvelope> {
        self.snapshot()
            .chaincodes
            .get(chaincode)
            .map(|cc| cc.endorsement_policy.clone())
            .ok_or_else(|| PvtDataError::Configuration(format!("chaincode {chaincode} is not defined")))
    }
}

fn build_entry(cc: &ChaincodeDefinition) -> PvtResult<ChaincodeEntry> {
    let mut collections = HashMap::new();
    for c in &cc.collections {
        if c.name.is_empty() || c.name == LOCAL_COLLECTION {
            return Err(PvtDataError::Configuration(format!(
                "chaincode {}: invalid collection name {:?}",
                cc.name, c.name
            )));
        }
        if c.member_orgs.is_empty() {
            return Err(PvtDataError::Configuration(format!(
                "chaincode {}: collection {} has no members",
                cc.name, c.name
            )));
        }
        if let Some(policy) = &c.endorsement_policy {
            policy.check().map_err(|e| {
                PvtDataError::Configuration(format!("chaincode {}: collection {}: {e}", cc.name, c.name))
            })?;
        }
        if collections.insert(c.name.clone(), c.clone()).is_some() {
            return Err(PvtDataError::Configuration(format!(
                "chaincode {}: duplicate collection {}",
                cc.name, c.name
            )));
        }
    }
    Ok(ChaincodeEntry {
        endorsement_policy: cc.endorsement_policy.clone(),
        collections,
    })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;

    fn collection(name: &str, orgs: &[&str]) -> CollectionDefinition {
        CollectionDefinition {
            name: name.into(),
            member_orgs: orgs.iter().map(|o| o.to_string()).collect::<BTreeSet<_>>(),
            required_peer_count: 0,
            max_peer_count: 1,
            block_to_live: 0,
            member_only_read: true,
            endorsement_policy: None,
        }
    }

    fn config(collections: Vec<CollectionDefinition>) -> ChannelConfig {
        ChannelConfig {
            channel: "testchannel".into(),
            chaincodes: vec![ChaincodeDefinition {
                name: "simplepvtdata".into(),
                endorsement_policy: SignaturePolicyEnvelope::any_of_orgs(&["Org1MSP", "Org2MSP"]),
                collections,
            }],
        }
    }

    #[test]
    fn resolves_configured_and_local() {
        let r = CollectionRegistry::new();
        r.apply_config(&config(vec![collection("marbles", &["Org1MSP", "Org2MSP"])]))
            .unwrap();

        let m = r.resolve("simplepvtdata", "marbles", "Org3MSP").unwrap();
        assert_eq!(m.member_orgs.len(), 2);

        let l = r.resolve("simplepvtdata", "+local", "Org3MSP").unwrap();
        assert!(l.member_orgs.contains("Org3MSP"));
        assert_eq!(l.member_orgs.len(), 1);

        assert!(matches!(
            r.resolve("simplepvtdata", "nope", "Org1MSP"),
            Err(PvtDataError::Configuration(_))
        ));
        assert!(matches!(
            r.resolve("other", "+local", "Org1MSP"),
            Err(PvtDataError::Configuration(_))
        ));
    }

    #[test]
    fn bad_config_keeps_previous_state() {
        let r = CollectionRegistry::new();
        r.apply_config(&config(vec![collection("marbles", &["Org1MSP"])])).unwrap();
        let bad = config(vec![collection("a", &["Org1MSP"]), collection("a", &["Org2MSP"])]);
        assert!(r.apply_config(&bad).is_err());
        assert!(r.resolve("simplepvtdata", "marbles", "Org1MSP").is_ok());

        let reserved = config(vec![collection("+local", &["Org1MSP"])]);
        assert!(r.apply_config(&reserved).is_err());

        let mut unsatisfiable = collection("a", &["Org1MSP"]);
        unsatisfiable.endorsement_policy = Some(SignaturePolicyEnvelope::n_of_orgs(2, &["Org1MSP"]));
        assert!(matches!(
            r.apply_config(&config(vec![unsatisfiable])),
            Err(PvtDataError::Configuration(_))
        ));
        let mut open = collection("a", &["Org1MSP"]);
        open.endorsement_policy = Some(SignaturePolicyEnvelope::all_of_orgs(&[]));
        assert!(r.apply_config(&config(vec![open])).is_err());
        assert!(r.resolve("simplepvtdata", "marbles", "Org1MSP").is_ok());
    }

    #[test]
    fn new_config_replaces_everything() {
        let r = CollectionRegistry::new();
        r.apply_config(&config(vec![collection("marbles", &["Org1MSP"])])).unwrap();
        r.apply_config(&config(vec![collection("details", &["Org2MSP"])])).unwrap();
        assert!(r.resolve("simplepvtdata", "marbles", "Org1MSP").is_err());
        assert!(r.resolve("simplepvtdata", "details", "Org1MSP").is_ok());
        assert_eq!(r.channel(), "testchannel");
    }
}
