use std::collections::BTreeSet;

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use pvtdata::server::storage::PeerStorage;
use pvtdata::shared::crypto::{generate_key, hash_data, public_part, serialize_pubkey, sign, verify_signature};
use pvtdata::shared::policy::{MspRole, SignaturePolicyEnvelope};
use pvtdata::shared::pvt_repr::{CollectionDefinition, Identity, PrivateRecord, PublicCommitment, PvtKey, Version};

fn marbles() -> CollectionDefinition {
    CollectionDefinition {
        name: "collectionMarbles".into(),
        member_orgs: BTreeSet::from(["Org1MSP".to_string(), "Org2MSP".to_string()]),
        required_peer_count: 1,
        max_peer_count: 3,
        block_to_live: 0,
        member_only_read: true,
        endorsement_policy: None,
    }
}

fn hashing(c: &mut Criterion) {
    let value = vec![7u8; 1024];
    c.bench_function("hash 1KiB payload", |b| b.iter(|| hash_data(black_box(&value))));

    let key = generate_key().unwrap();
    let pk = public_part(&key).unwrap();
    let digest = hash_data(b"rwset");
    let sig = sign(&digest, &key).unwrap();
    c.bench_function("sign digest", |b| b.iter(|| sign(black_box(&digest), &key).unwrap()));
    c.bench_function("verify endorsement", |b| {
        b.iter(|| verify_signature(black_box(&sig), &digest, &pk))
    });
}

fn policies(c: &mut Criterion) {
    let orgs: Vec<String> = (0..10).map(|i| format!("Org{i}MSP")).collect();
    let names: Vec<&str> = orgs.iter().map(String::as_str).collect();
    let policy = SignaturePolicyEnvelope::n_of_orgs(5, &names);
    let der = serialize_pubkey(&public_part(&generate_key().unwrap()).unwrap()).unwrap();
    let signers: Vec<Identity> = names
        .iter()
        .rev()
        .map(|o| Identity {
            msp_id: o.to_string(),
            role: MspRole::Peer,
            public_key: der.clone(),
        })
        .collect();
    c.bench_function("evaluate 5 of 10", |b| b.iter(|| policy.evaluate(black_box(&signers))));
}

fn storage(c: &mut Criterion) {
    let db = sled::Config::new().temporary(true).open().unwrap();
    let s = PeerStorage::open(&db).unwrap();
    let def = marbles();
    let mut block = 0u64;
    c.bench_function("commit and store one write", |b| {
        b.iter_batched(
            || {
                block += 1;
                let key = PvtKey::new("pvtdatacc", "collectionMarbles", &format!("k{}", block % 100));
                let value = block.to_be_bytes().to_vec();
                (key, value, Version::new(block, 0))
            },
            |(key, value, version)| {
                s.commitments
                    .commit(&PublicCommitment {
                        key: key.clone(),
                        value_hash: hash_data(&value),
                        version,
                    })
                    .unwrap();
                s.private
                    .put(
                        &def,
                        "Org1MSP",
                        &PrivateRecord {
                            key,
                            value,
                            version,
                            expiry_block: None,
                        },
                    )
                    .unwrap();
            },
            BatchSize::SmallInput,
        )
    });

    let key = PvtKey::new("pvtdatacc", "collectionMarbles", "k1");
    c.bench_function("read private", |b| b.iter(|| s.read_private(black_box(&key)).unwrap()));
}

criterion_group!(benches, hashing, policies, storage);
criterion_main!(benches);
