use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use pvtdata::chaincode::SimplePvtData;
use pvtdata::network::{eventually, LocalNetwork};
use pvtdata::shared::policy::SignaturePolicyEnvelope;
use pvtdata::shared::pvt_repr::{parse_collections_config, CollectionConfig};
use tokio::{fs::File, io::AsyncReadExt};
use tracing::Level;

const CHAINCODE: &str = "pvtdatacc";

async fn read_file(folder: &str, name: &str) -> Result<Vec<u8>, std::io::Error> {
    let path = format!("{folder}/{name}");
    tracing::info!("reading {path}");
    let mut f = File::open(path).await?;
    let mut res = Vec::new();
    f.read_to_end(&mut res).await?;
    Ok(res)
}

fn show(step: &str, res: Result<Vec<u8>, pvtdata::client::ClientError>) {
    match res {
        Ok(v) => tracing::info!("{step}: {:?}", String::from_utf8_lossy(&v)),
        Err(e) => tracing::info!("{step}: error: {e}"),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    use tracing_subscriber::{fmt::format::FmtSpan, EnvFilter};
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .with_span_events(FmtSpan::FULL)
        .init();

    let folder = std::env::args().nth(1).unwrap_or_else(|| "env".into());
    let raw = String::from_utf8(read_file(&folder, "collections_config.json").await?)?;
    let collections: Vec<CollectionConfig> = parse_collections_config(&raw)?;

    let mut net = LocalNetwork::new("testchannel");
    for (name, org) in [
        ("peer0.org1", "Org1MSP"),
        ("peer0.org2", "Org2MSP"),
        ("peer0.org3", "Org3MSP"),
    ] {
        net.add_peer(name, org)?;
    }
    net.deploy(
        CHAINCODE,
        Arc::new(SimplePvtData),
        SignaturePolicyEnvelope::any_of_orgs(&["Org1MSP", "Org2MSP", "Org3MSP"]),
        collections.iter().map(CollectionConfig::to_definition).collect(),
    );
    if !net.wait_for_equal_heights(Duration::from_secs(5)).await {
        return Err("peers did not pick up the chaincode definition".into());
    }

    tracing::info!("org2 writes +local foo=bar1");
    net.invoke(&["peer0.org2"], CHAINCODE, &["put", "+local", "foo", "bar1"]).await?;
    for p in ["peer0.org1", "peer0.org2", "peer0.org3"] {
        show(&format!("{p} get +local foo"), net.query(p, CHAINCODE, &["get", "+local", "foo"]));
    }

    if let Some(c) = collections.first() {
        tracing::info!("org1 writes {} foo=bar7", c.name);
        net.invoke(&["peer0.org1"], CHAINCODE, &["put", c.name.as_str(), "foo", "bar7"]).await?;
        // let dissemination and reconciliation run
        let def = c.to_definition();
        let members: Vec<&str> = ["peer0.org1", "peer0.org2", "peer0.org3"]
            .into_iter()
            .filter(|p| net.peer(p).map(|n| def.member_orgs.contains(n.org())).unwrap_or(false))
            .collect();
        let spread = eventually(Duration::from_secs(5), || {
            members
                .iter()
                .all(|p| net.query(p, CHAINCODE, &["get", c.name.as_str(), "foo"]).is_ok())
        })
        .await;
        tracing::info!(spread, "members converged");
        for p in ["peer0.org1", "peer0.org2", "peer0.org3"] {
            show(&format!("{p} get {} foo", c.name), net.query(p, CHAINCODE, &["get", c.name.as_str(), "foo"]));
        }
    }

    tracing::info!("org2 guards +local foo with Org1MSP");
    net.invoke(&["peer0.org2"], CHAINCODE, &["metaset", "+local", "foo", "Org1MSP"]).await?;
    match net.invoke(&["peer0.org2"], CHAINCODE, &["put", "+local", "foo", "bar2"]).await {
        Ok(_) => tracing::info!("org2 write went through"),
        Err(e) => tracing::info!("org2 write rejected: {e}"),
    }
    net.invoke(&["peer0.org1"], CHAINCODE, &["put", "+local", "foo", "bar2"]).await?;
    show("peer0.org1 get +local foo", net.query("peer0.org1", CHAINCODE, &["get", "+local", "foo"]));
    show("peer0.org2 get +local foo", net.query("peer0.org2", CHAINCODE, &["get", "+local", "foo"]));

    for p in net.peers() {
        tracing::info!(peer = p.name(), height = p.ledger_height(), records = p.private_record_count(), "final state");
    }
    Ok(())
}
