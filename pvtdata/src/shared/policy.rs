//! Signature policies over organisation principals.
//!
//! A policy is a tree of `NOutOf` gates whose leaves point at principals by
//! index. Evaluation consumes each signer at most once, so `2 of [Org1, Org1]`
//! needs two distinct Org1 signers.

use postcard::{from_bytes, to_stdvec};
use serde::{Deserialize, Serialize};

use super::pvt_repr::Identity;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MspRole {
    Member,
    Peer,
    Client,
    Admin,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct MspPrincipal {
    pub msp_identifier: String,
    pub role: MspRole,
}

impl MspPrincipal {
    pub fn member(msp_id: &str) -> Self {
        Self {
            msp_identifier: msp_id.into(),
            role: MspRole::Member,
        }
    }

    /// `Member` accepts any role of the organisation; other roles must match.
    pub fn matches(&self, identity: &Identity) -> bool {
        identity.msp_id == self.msp_identifier
            && (self.role == MspRole::Member || self.role == identity.role)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub enum SignaturePolicy {
    SignedBy(u32),
    NOutOf { n: u32, rules: Vec<SignaturePolicy> },
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct SignaturePolicyEnvelope {
    pub version: u32,
    pub rule: SignaturePolicy,
    pub identities: Vec<MspPrincipal>,
}

impl SignaturePolicyEnvelope {
    /// `n` distinct signatures, each from a different listed organisation.
    pub fn n_of_orgs(n: u32, orgs: &[&str]) -> Self {
        let identities = orgs.iter().map(|o| MspPrincipal::member(o)).collect();
        let rules = (0..orgs.len() as u32).map(SignaturePolicy::SignedBy).collect();
        Self {
            version: 0,
            rule: SignaturePolicy::NOutOf { n, rules },
            identities,
        }
    }

    pub fn all_of_orgs(orgs: &[&str]) -> Self {
        Self::n_of_orgs(orgs.len() as u32, orgs)
    }

    pub fn any_of_orgs(orgs: &[&str]) -> Self {
        Self::n_of_orgs(1, orgs)
    }

    pub fn signed_by_org(org: &str) -> Self {
        Self::all_of_orgs(&[org])
    }

    pub fn evaluate(&self, signers: &[Identity]) -> bool {
        let mut used = vec![false; signers.len()];
        satisfied(&self.rule, &self.identities, signers, &mut used)
    }

    /// Rejects policies that are met by nobody signing, or by no signer set
    /// at all: an `n` of 0, `n` above the rule count, or a principal index
    /// out of range.
    pub fn check(&self) -> Result<(), String> {
        check_rule(&self.rule, self.identities.len())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, postcard::Error> {
        to_stdvec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, postcard::Error> {
        from_bytes(bytes)
    }
}

fn check_rule(rule: &SignaturePolicy, principals: usize) -> Result<(), String> {
    match rule {
        SignaturePolicy::SignedBy(idx) if (*idx as usize) < principals => Ok(()),
        SignaturePolicy::SignedBy(idx) => Err(format!("policy refers to unknown principal {idx}")),
        SignaturePolicy::NOutOf { n: 0, .. } => Err("policy requires no signatures".into()),
        SignaturePolicy::NOutOf { n, rules } if *n as usize > rules.len() => {
            Err(format!("policy requires {n} of only {} rules", rules.len()))
        }
        SignaturePolicy::NOutOf { rules, .. } => rules.iter().try_for_each(|r| check_rule(r, principals)),
    }
}

// greedy: each sub-rule claims signers on a scratch copy and keeps them only
// when it is satisfied
fn satisfied(
    rule: &SignaturePolicy,
    principals: &[MspPrincipal],
    signers: &[Identity],
    used: &mut Vec<bool>,
) -> bool {
    match rule {
        SignaturePolicy::SignedBy(idx) => {
            let principal = match principals.get(*idx as usize) {
                Some(p) => p,
                None => return false,
            };
            for (i, signer) in signers.iter().enumerate() {
                if !used[i] && principal.matches(signer) {
                    used[i] = true;
                    return true;
                }
            }
            false
        }
        SignaturePolicy::NOutOf { n, rules } => {
            let mut count = 0;
            for r in rules {
                let mut scratch = used.clone();
                if satisfied(r, principals, signers, &mut scratch) {
                    *used = scratch;
                    count += 1;
                }
            }
            count >= *n
        }
    }
}

/// Human-writable policy form used by collection configuration files.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PolicySpec {
    AllOf(Vec<String>),
    AnyOf(Vec<String>),
    NOf { n: u32, orgs: Vec<String> },
}

impl PolicySpec {
    pub fn to_envelope(&self) -> SignaturePolicyEnvelope {
        match self {
            PolicySpec::AllOf(orgs) => SignaturePolicyEnvelope::all_of_orgs(&as_strs(orgs)),
            PolicySpec::AnyOf(orgs) => SignaturePolicyEnvelope::any_of_orgs(&as_strs(orgs)),
            PolicySpec::NOf { n, orgs } => SignaturePolicyEnvelope::n_of_orgs(*n, &as_strs(orgs)),
        }
    }
}

fn as_strs(v: &[String]) -> Vec<&str> {
    v.iter().map(String::as_str).collect()
}
