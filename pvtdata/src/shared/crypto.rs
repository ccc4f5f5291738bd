use openssl::{
    ec::{EcGroup, EcKey},
    ecdsa::EcdsaSig,
    error::ErrorStack,
    hash::{Hasher, MessageDigest},
    nid::Nid,
    pkey::{Private, Public},
    rand::rand_bytes,
};

// ECDSA signatures
// NIST P-256 (secp256r1) elliptic curve
pub type PublicKey = EcKey<Public>;
pub type PrivateKey = EcKey<Private>;

// SHA-256 hash
pub type Hash = [u8; 32];

pub type Signature = Vec<u8>;

fn p256() -> Result<EcGroup, ErrorStack> {
    EcGroup::from_curve_name(Nid::X9_62_PRIME256V1)
}

pub fn generate_key() -> Result<PrivateKey, ErrorStack> {
    let group = p256()?;
    EcKey::generate(&group)
}

pub fn public_part(key: &PrivateKey) -> Result<PublicKey, ErrorStack> {
    let group = p256()?;
    EcKey::from_public_key(&group, key.public_key())
}

pub fn serialize_pubkey(key: &PublicKey) -> Result<Vec<u8>, ErrorStack> {
    key.public_key_to_der()
}

pub fn deserialize_pubkey(key: &[u8]) -> Result<PublicKey, ErrorStack> {
    EcKey::<Public>::public_key_from_der(key)
}

pub fn deserialize_private_key_from_pem(pem: &[u8]) -> Result<PrivateKey, ErrorStack> {
    EcKey::<Private>::private_key_from_pem(pem)
}

/// Hash of a private value, as recorded in its public commitment.
pub fn hash_data(data: &[u8]) -> Hash {
    openssl::sha::sha256(data)
}

/// Hashes a sequence of length-prefixed parts, so ("ab","c") and ("a","bc")
/// never collide.
pub fn hash_parts<'a>(parts: impl IntoIterator<Item = &'a [u8]>) -> Result<Hash, ErrorStack> {
    let mut hasher = Hasher::new(MessageDigest::sha256())?;
    for part in parts {
        hasher.update(&(part.len() as u64).to_le_bytes())?;
        hasher.update(part)?;
    }
    let res = hasher.finish()?;
    let mut out = [0u8; 32];
    out.copy_from_slice(&res);
    Ok(out)
}

pub fn sign(hash: &Hash, key: &PrivateKey) -> Result<Signature, ErrorStack> {
    EcdsaSig::sign(hash, key)?.to_der()
}

/// A malformed signature is reported as invalid, not as an error.
pub fn verify_signature(signature: &[u8], hash: &Hash, key: &PublicKey) -> bool {
    match EcdsaSig::from_der(signature) {
        Ok(sig) => sig.verify(hash, key).unwrap_or(false),
        Err(_) => false,
    }
}

pub fn random_id() -> Result<String, ErrorStack> {
    let mut buf = [0u8; 16];
    rand_bytes(&mut buf)?;
    Ok(to_hex(&buf))
}

pub fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signatures_verify_only_under_the_signing_key() {
        let key = generate_key().unwrap();
        let other = generate_key().unwrap();
        let digest = hash_data(b"rwset");
        let sig = sign(&digest, &key).unwrap();

        assert!(verify_signature(&sig, &digest, &public_part(&key).unwrap()));
        assert!(!verify_signature(&sig, &digest, &public_part(&other).unwrap()));
        assert!(!verify_signature(&sig, &hash_data(b"other"), &public_part(&key).unwrap()));
        assert!(!verify_signature(b"garbage", &digest, &public_part(&key).unwrap()));
    }

    #[test]
    fn public_keys_survive_der() {
        let key = generate_key().unwrap();
        let der = serialize_pubkey(&public_part(&key).unwrap()).unwrap();
        let back = deserialize_pubkey(&der).unwrap();
        let digest = hash_data(b"x");
        assert!(verify_signature(&sign(&digest, &key).unwrap(), &digest, &back));
    }

    #[test]
    fn part_hashing_is_boundary_sensitive() {
        let a = hash_parts([b"ab".as_slice(), b"c".as_slice()]).unwrap();
        let b = hash_parts([b"a".as_slice(), b"bc".as_slice()]).unwrap();
        assert_ne!(a, b);
    }
}
