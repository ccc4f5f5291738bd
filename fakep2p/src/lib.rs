use std::{
    collections::{HashMap, HashSet},
    io,
    pin::Pin,
    sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard},
    time::Duration,
};

use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

mod local;
mod tcp;

pub use local::LocalNet;
pub use tcp::{P2PComm, P2PConfig};

pub type Name = String; // in actuality, should be a hash, but oh well

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct P2PMessageBody {
    pub dest: Name,
    pub sender: Name,
    pub content: Vec<u8>,
    pub metadata: Vec<u8>,
}

pub(crate) fn io_err<T>(s: &str) -> Result<T, io::Error> {
    Err(io::Error::new(io::ErrorKind::Other, s))
}

// a poisoned table is still a usable table: routes are replaced wholesale
fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

/// Delivery faults applied by the sending side. Only the in-process hub ever
/// sets these; a TCP table always has the empty set.
#[derive(Debug, Default, Clone)]
pub(crate) struct Faults {
    offline: HashSet<Name>,
    cut_links: HashSet<(Name, Name)>,
    delay: Duration,
}

impl Faults {
    fn blocks(&self, from: &str, to: &str) -> bool {
        self.offline.contains(from)
            || self.offline.contains(to)
            || self.cut_links.contains(&(from.to_string(), to.to_string()))
    }
}

/// Outgoing queues keyed by peer name, plus multicast groups.
#[derive(Default)]
pub(crate) struct RouteTable {
    queues: RwLock<HashMap<Name, mpsc::UnboundedSender<P2PMessageBody>>>,
    mcast_groups: RwLock<HashMap<Name, Vec<Name>>>,
    faults: RwLock<Faults>,
}

impl RouteTable {
    pub(crate) fn register(&self, name: Name, queue: mpsc::UnboundedSender<P2PMessageBody>) {
        write(&self.queues).insert(name, queue);
    }

    pub(crate) fn unregister(&self, name: &str) {
        write(&self.queues).remove(name);
        for members in write(&self.mcast_groups).values_mut() {
            members.retain(|m| m != name);
        }
    }

    pub(crate) fn add_to_group(&self, group: &str, name: &str) {
        let mut groups = write(&self.mcast_groups);
        let members = groups.entry(group.to_string()).or_default();
        if !members.iter().any(|m| m == name) {
            members.push(name.to_string());
        }
    }

    pub(crate) fn update_faults(&self, f: impl FnOnce(&mut Faults)) {
        f(&mut write(&self.faults));
    }

    fn queue(&self, name: &str) -> Option<mpsc::UnboundedSender<P2PMessageBody>> {
        read(&self.queues).get(name).cloned()
    }

    fn group(&self, name: &str) -> Option<Vec<Name>> {
        read(&self.mcast_groups).get(name).cloned()
    }

    fn faults(&self) -> Faults {
        read(&self.faults).clone()
    }
}

#[derive(Clone)]
pub struct P2PSender {
    name: Name,
    table: Arc<RouteTable>,
}

impl P2PSender {
    pub(crate) fn new(name: Name, table: Arc<RouteTable>) -> Self {
        Self { name, table }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sends a message into the network, to one peer.
    /// Messages to unknown or unreachable peers are silently lost, the same
    /// way they would be on a real network.
    pub fn send_one(&self, msg: P2PMessageBody) -> Result<(), io::Error> {
        let queue = match self.table.queue(&msg.dest) {
            Some(q) => q,
            None => return Ok(()),
        };
        let faults = self.table.faults();
        if faults.blocks(&self.name, &msg.dest) {
            return Ok(());
        }
        if faults.delay.is_zero() {
            if queue.send(msg).is_err() {
                return io_err("mpsc");
            }
        } else {
            let delay = faults.delay;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = queue.send(msg);
            });
        }
        Ok(())
    }

    /// Sends a message into the network, to a group of peers (never back to
    /// ourselves). `msg.dest` names the group.
    pub fn send_multi(&self, msg: P2PMessageBody) -> Result<(), io::Error> {
        let group = match self.table.group(&msg.dest) {
            Some(g) => g,
            None => return io_err("unknown multicast group"),
        };
        for n in group {
            if n == self.name {
                continue;
            }
            let mut m = msg.clone();
            m.dest = n;
            self.send_one(m)?;
        }
        Ok(())
    }
}

pub struct P2PReceiver {
    stream: Pin<Box<dyn Stream<Item = Result<P2PMessageBody, io::Error>> + Send>>,
}

impl P2PReceiver {
    pub(crate) fn new<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<P2PMessageBody, io::Error>> + Send + 'static,
    {
        Self {
            stream: Box::pin(stream),
        }
    }

    /// Receives a message from the network
    pub async fn receive(&mut self) -> Option<Result<P2PMessageBody, io::Error>> {
        self.stream.next().await
    }
}
