use std::{sync::Arc, time::Duration};

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::{P2PReceiver, P2PSender, RouteTable};

/// An in-process network. Every joined node gets its own inbox; senders share
/// one route table, so nodes joining later are reachable by everyone.
///
/// Faults are injected on the sending side: offline nodes neither send nor
/// receive, cut links drop one direction, and a uniform delay postpones every
/// delivery.
#[derive(Clone, Default)]
pub struct LocalNet {
    table: Arc<RouteTable>,
}

impl LocalNet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn join(&self, name: &str, groups: &[&str]) -> (P2PSender, P2PReceiver) {
        let (s, r) = mpsc::unbounded_channel();
        self.table.register(name.to_string(), s);
        for g in groups {
            self.table.add_to_group(g, name);
        }
        let receiver = P2PReceiver::new(UnboundedReceiverStream::new(r).map(Ok));
        (P2PSender::new(name.to_string(), self.table.clone()), receiver)
    }

    pub fn leave(&self, name: &str) {
        self.table.unregister(name);
    }

    pub fn set_offline(&self, name: &str, offline: bool) {
        self.table.update_faults(|f| {
            if offline {
                f.offline.insert(name.to_string());
            } else {
                f.offline.remove(name);
            }
        });
    }

    pub fn cut_link(&self, from: &str, to: &str) {
        self.table.update_faults(|f| {
            f.cut_links.insert((from.to_string(), to.to_string()));
        });
    }

    pub fn heal_link(&self, from: &str, to: &str) {
        self.table.update_faults(|f| {
            f.cut_links.remove(&(from.to_string(), to.to_string()));
        });
    }

    pub fn set_delay(&self, delay: Duration) {
        self.table.update_faults(|f| f.delay = delay);
    }
}
