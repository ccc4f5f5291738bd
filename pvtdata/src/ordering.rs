use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;

use crate::shared::pvt_repr::{Block, BlockData, ChannelConfig, Transaction};

struct OrdererState {
    blocks: Vec<Arc<Block>>,
    subscribers: Vec<mpsc::UnboundedSender<Arc<Block>>>,
}

/// Single-node ordering service for one channel. Cuts one block per
/// submission and keeps them all, so any subscriber can start from any
/// height.
pub struct SoloOrderer {
    channel: String,
    state: Mutex<OrdererState>,
}

impl SoloOrderer {
    pub fn new(channel: &str) -> Self {
        Self {
            channel: channel.into(),
            state: Mutex::new(OrdererState {
                blocks: Vec::new(),
                subscribers: Vec::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, OrdererState> {
        match self.state.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn height(&self) -> u64 {
        self.state().blocks.len() as u64
    }

    fn cut(&self, data: BlockData) -> u64 {
        let mut state = self.state();
        let number = state.blocks.len() as u64;
        let block = Arc::new(Block { number, data });
        state.blocks.push(block.clone());
        // subscribers that went away are forgotten
        state.subscribers.retain(|s| s.send(block.clone()).is_ok());
        tracing::debug!(channel = %self.channel, block = number, "cut block");
        number
    }

    /// Orders a transaction; returns the number of the block holding it.
    pub fn broadcast(&self, tx: Transaction) -> u64 {
        self.cut(BlockData::Transactions(vec![tx]))
    }

    pub fn submit_config(&self, config: ChannelConfig) -> u64 {
        self.cut(BlockData::Config(config))
    }

    /// Every block from `from` on, then each new block as it is cut.
    pub fn deliver(&self, from: u64) -> mpsc::UnboundedReceiver<Arc<Block>> {
        let (s, r) = mpsc::unbounded_channel();
        let mut state = self.state();
        for b in state.blocks.iter().skip(from as usize) {
            let _ = s.send(b.clone());
        }
        state.subscribers.push(s);
        r
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::pvt_repr::TxRwSet;

    fn tx(id: &str) -> Transaction {
        Transaction {
            tx_id: id.into(),
            channel: "testchannel".into(),
            rwset: TxRwSet::default(),
            endorsements: vec![],
        }
    }

    #[tokio::test]
    async fn late_subscribers_replay_then_follow() {
        let o = SoloOrderer::new("testchannel");
        let mut early = o.deliver(0);
        assert_eq!(o.submit_config(ChannelConfig::default()), 0);
        assert_eq!(o.broadcast(tx("a")), 1);

        let mut late = o.deliver(0);
        let mut from_one = o.deliver(1);
        assert_eq!(o.broadcast(tx("b")), 2);

        for expected in 0..3 {
            assert_eq!(early.recv().await.unwrap().number, expected);
            assert_eq!(late.recv().await.unwrap().number, expected);
        }
        assert_eq!(from_one.recv().await.unwrap().number, 1);
        assert_eq!(from_one.recv().await.unwrap().number, 2);
        assert_eq!(o.height(), 3);
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let o = SoloOrderer::new("testchannel");
        drop(o.deliver(0));
        o.broadcast(tx("a"));
        assert!(o.state().subscribers.is_empty());
    }
}
