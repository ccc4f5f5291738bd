use std::collections::HashMap;
use std::sync::RwLock;

use crate::shared::pvt_repr::CollectionDefinition;

pub fn is_member(org: &str, def: &CollectionDefinition) -> bool {
    def.member_orgs.contains(org)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub name: String,
    pub org: String,
    pub height: u64,
}

/// Peers of the channel as learned from alive announcements and message
/// metadata.
#[derive(Default)]
pub struct PeerDirectory {
    peers: RwLock<HashMap<String, PeerInfo>>,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, name: &str, org: &str, height: u64) {
        let mut peers = match self.peers.write() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        let e = peers.entry(name.to_string()).or_insert_with(|| PeerInfo {
            name: name.to_string(),
            org: org.to_string(),
            height,
        });
        e.org = org.to_string();
        e.height = e.height.max(height);
    }

    /// Records a height seen in message metadata for a peer already known.
    pub fn set_height(&self, name: &str, height: u64) {
        let mut peers = match self.peers.write() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(e) = peers.get_mut(name) {
            e.height = e.height.max(height);
        }
    }

    pub fn org_of(&self, name: &str) -> Option<String> {
        let peers = match self.peers.read() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        peers.get(name).map(|p| p.org.clone())
    }

    /// Known peers whose organisation is a member of `def`, highest ledger
    /// first, ties broken by name.
    pub fn member_peers(&self, def: &CollectionDefinition, exclude: &str) -> Vec<PeerInfo> {
        let peers = match self.peers.read() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut res: Vec<PeerInfo> = peers
            .values()
            .filter(|p| p.name != exclude && is_member(&p.org, def))
            .cloned()
            .collect();
        res.sort_by(|a, b| b.height.cmp(&a.height).then_with(|| a.name.cmp(&b.name)));
        res
    }

    pub fn all(&self) -> Vec<PeerInfo> {
        let peers = match self.peers.read() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        peers.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::pvt_repr::CollectionDefinition;

    fn def(orgs: &[&str]) -> CollectionDefinition {
        let mut d = CollectionDefinition::local_for(orgs[0]);
        d.name = "c".into();
        d.member_orgs = orgs.iter().map(|s| s.to_string()).collect();
        d
    }

    #[test]
    fn membership_is_the_org_set() {
        let d = def(&["Org1MSP", "Org3MSP"]);
        assert!(is_member("Org1MSP", &d));
        assert!(!is_member("Org2MSP", &d));
    }

    #[test]
    fn members_sorted_by_height() {
        let dir = PeerDirectory::new();
        dir.update("p1", "Org1MSP", 3);
        dir.update("p2", "Org2MSP", 9);
        dir.update("p3", "Org3MSP", 7);
        dir.update("p4", "Org4MSP", 20);
        dir.set_height("p1", 8);
        // heights never go backwards
        dir.set_height("p3", 1);
        dir.set_height("unknown", 100);

        let names: Vec<String> = dir
            .member_peers(&def(&["Org1MSP", "Org2MSP", "Org3MSP"]), "p2")
            .into_iter()
            .map(|p| p.name)
            .collect();
        assert_eq!(names, vec!["p1", "p3"]);
        assert_eq!(dir.org_of("p4").as_deref(), Some("Org4MSP"));
        assert_eq!(dir.org_of("unknown"), None);
    }
}
