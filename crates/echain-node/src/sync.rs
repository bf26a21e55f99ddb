//! Block catch-up after an `inv`.
//!
//! The advertised hashes we lack are split into `getdata` batches. One
//! worker per block-storing peer pulls batches from a shared queue and
//! fetches them request/response. Fetched blocks are stored without
//! validation; the tip only moves if the newest advertised block links back
//! to genesis, and the UTXO index is rebuilt with it.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use echain_core::error::{EchainError, NetworkError};
use echain_core::types::{Block, Hash256};
use echain_network::protocol::{GetdataMessage, InvMessage};
use echain_network::{Message, NetworkConfig, request};

use crate::full::FullNode;

/// Split `hashes` into `getdata` requests of at most `batch_size` hashes,
/// numbered from zero.
pub fn plan_batches(hashes: &[Hash256], batch_size: usize, addr_from: &str) -> Vec<GetdataMessage> {
    hashes
        .chunks(batch_size.max(1))
        .enumerate()
        .map(|(batch, chunk)| GetdataMessage {
            batch: batch as u32,
            hashes: chunk.to_vec(),
            addr_from: addr_from.to_string(),
        })
        .collect()
}

/// Outcome of one catch-up round.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub requested: usize,
    pub fetched: usize,
    /// The new tip, if the round moved it.
    pub adopted: Option<Hash256>,
}

async fn fetch_batch(peer: &str, batch: &GetdataMessage, config: &NetworkConfig) -> Result<Vec<Block>, NetworkError> {
    match request(peer, &Message::Getdata(batch.clone()), config).await? {
        Message::Blockdata(data) => Ok(data.blocks),
        other => Err(NetworkError::UnexpectedReply(other.command().to_string())),
    }
}

/// Keep the blocks of `reply` that `batch` asked for. Returns them with a
/// batch of the hashes still missing, if any.
fn split_reply(batch: &GetdataMessage, reply: Vec<Block>) -> (Vec<Block>, Option<GetdataMessage>) {
    let mut wanted: HashSet<Hash256> = batch.hashes.iter().copied().collect();
    let blocks: Vec<Block> = reply.into_iter().filter(|block| wanted.remove(&block.hash())).collect();
    if wanted.is_empty() {
        return (blocks, None);
    }
    let shortfall = GetdataMessage {
        batch: batch.batch,
        hashes: batch.hashes.iter().filter(|hash| wanted.contains(hash)).copied().collect(),
        addr_from: batch.addr_from.clone(),
    };
    (blocks, Some(shortfall))
}

/// Fetch every batch using one worker per peer. A peer that fails or
/// answers without some of the blocks puts the missing hashes back and
/// leaves the round; the others keep pulling until the queue is empty or
/// no peer is left.
pub async fn fetch_blocks(batches: Vec<GetdataMessage>, peers: Vec<String>, config: &NetworkConfig) -> Vec<Block> {
    let queue = Arc::new(Mutex::new(VecDeque::from(batches)));
    let mut pool = peers;
    let mut blocks = Vec::new();

    while !pool.is_empty() && !queue.lock().is_empty() {
        let mut tasks = JoinSet::new();
        for peer in pool.drain(..) {
            let queue = Arc::clone(&queue);
            let config = config.clone();
            tasks.spawn(async move {
                let mut fetched = Vec::new();
                loop {
                    let next = queue.lock().pop_front();
                    let Some(batch) = next else {
                        return (peer, fetched, true);
                    };
                    match fetch_batch(&peer, &batch, &config).await {
                        Ok(reply) => {
                            let (got, shortfall) = split_reply(&batch, reply);
                            debug!(%peer, batch = batch.batch, count = got.len(), "fetched batch");
                            fetched.extend(got);
                            if let Some(shortfall) = shortfall {
                                debug!(%peer, missing = shortfall.hashes.len(), "peer lacks requested blocks");
                                queue.lock().push_back(shortfall);
                                return (peer, fetched, false);
                            }
                        }
                        Err(e) => {
                            debug!(%peer, batch = batch.batch, "getdata failed: {e}");
                            queue.lock().push_back(batch);
                            return (peer, fetched, false);
                        }
                    }
                }
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((peer, fetched, healthy)) => {
                    blocks.extend(fetched);
                    if healthy {
                        pool.push(peer);
                    }
                }
                Err(e) => warn!("sync worker failed: {e}"),
            }
        }
    }

    let left = queue.lock().len();
    if left > 0 {
        warn!(batches = left, "catch-up round left batches unfetched");
    }
    blocks
}

/// `peers` with `source` moved to the front, added if absent.
fn source_first(mut peers: Vec<String>, source: &str) -> Vec<String> {
    peers.retain(|peer| peer != source);
    peers.insert(0, source.to_string());
    peers
}

impl FullNode {
    /// Run a catch-up round for the advertised hashes. Dropped if a round
    /// is already in progress.
    pub(crate) async fn handle_inv(&self, inv: InvMessage) -> Result<(), EchainError> {
        let Ok(_round) = self.sync_round.try_lock() else {
            debug!(peer = %inv.addr_from, "catch-up already running; dropping inv");
            return Ok(());
        };
        let report = self.catch_up(&inv.hashes, &inv.addr_from).await?;
        if report.requested > 0 {
            info!(
                peer = %inv.addr_from,
                requested = report.requested,
                fetched = report.fetched,
                adopted = report.adopted.is_some(),
                "catch-up round finished"
            );
        }
        self.request_blocks_from_peers().await
    }

    /// Fetch the blocks we lack among `hashes` (oldest first) and adopt the
    /// newest if it connects. `source` advertised the hashes and is asked
    /// first.
    pub async fn catch_up(&self, hashes: &[Hash256], source: &str) -> Result<SyncReport, EchainError> {
        let missing: Vec<Hash256> = {
            let chain = self.chain().read();
            let mut missing = Vec::with_capacity(hashes.len());
            for hash in hashes {
                if !chain.contains(hash)? {
                    missing.push(*hash);
                }
            }
            missing
        };
        let mut report = SyncReport {
            requested: missing.len(),
            ..SyncReport::default()
        };

        if !missing.is_empty() {
            let network = self.base().network();
            let batches = plan_batches(&missing, network.max_blocks_in_transit, self.base().address());
            let peers = source_first(self.base().block_peers(), source);
            let blocks = fetch_blocks(batches, peers, network).await;
            report.fetched = blocks.len();
            let chain = self.chain().read();
            for block in &blocks {
                chain.put(block)?;
            }
        }

        if let Some(newest) = hashes.last() {
            let known = self.chain().read().contains(newest)?;
            if known && self.adopt_tip(*newest)? {
                report.adopted = Some(*newest);
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batches_are_numbered_and_capped() {
        let hashes: Vec<Hash256> = (0..25u8).map(|i| Hash256([i; 32])).collect();
        let batches = plan_batches(&hashes, 10, "me:1");
        assert_eq!(batches.len(), 3);
        assert_eq!(batches.iter().map(|b| b.batch).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert_eq!(batches[2].hashes.len(), 5);
        assert_eq!(batches[0].hashes[0], hashes[0]);
        assert!(batches.iter().all(|b| b.addr_from == "me:1"));
    }

    #[test]
    fn no_hashes_no_batches() {
        assert!(plan_batches(&[], 10, "me:1").is_empty());
    }

    #[tokio::test]
    async fn fetch_without_peers_returns_nothing() {
        let batches = plan_batches(&[Hash256([1; 32])], 10, "me:1");
        let blocks = fetch_blocks(batches, Vec::new(), &NetworkConfig::local()).await;
        assert!(blocks.is_empty());
    }

    #[tokio::test]
    async fn unreachable_peer_leaves_batch_unfetched() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let batches = plan_batches(&[Hash256([1; 32])], 10, "me:1");
        let blocks = fetch_blocks(batches, vec![addr], &NetworkConfig::local()).await;
        assert!(blocks.is_empty());
    }

    // --- Peers lacking blocks ---

    fn block(n: u64) -> Block {
        let cb = echain_core::types::Transaction::coinbase(echain_core::types::PubkeyHash([n as u8; 20]), n).unwrap();
        Block::new(Hash256([n as u8; 32]), vec![cb], n).unwrap()
    }

    /// Answers every `getdata` with `blocks`, whatever was asked.
    async fn serving(blocks: Vec<Block>) -> String {
        use echain_network::protocol::{BlockOrigin, BlockdataMessage};
        use echain_network::transport::{read_message, write_message};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let reply = Message::Blockdata(BlockdataMessage {
            origin: BlockOrigin::Batch { index: 0, total: 1 },
            blocks,
            addr_from: addr.clone(),
        });
        tokio::spawn(async move {
            loop {
                let (mut stream, _) = listener.accept().await.unwrap();
                let reply = reply.clone();
                tokio::spawn(async move {
                    let _ = read_message(&mut stream, 1 << 20).await;
                    let _ = write_message(&mut stream, &reply).await;
                });
            }
        });
        addr
    }

    fn hashes(blocks: &[Block]) -> HashSet<Hash256> {
        blocks.iter().map(Block::hash).collect()
    }

    #[tokio::test]
    async fn empty_reply_falls_back_to_next_peer() {
        let wanted = vec![block(1), block(2)];
        let lacking = serving(Vec::new()).await;
        let holding = serving(wanted.clone()).await;

        let batches = plan_batches(&[wanted[0].hash(), wanted[1].hash()], 10, "me:1");
        let blocks = fetch_blocks(batches, vec![lacking, holding], &NetworkConfig::local()).await;
        assert_eq!(hashes(&blocks), hashes(&wanted));
    }

    #[tokio::test]
    async fn partial_reply_requeues_only_the_shortfall() {
        let wanted = vec![block(1), block(2)];
        let partial = serving(vec![wanted[0].clone()]).await;
        let holding = serving(wanted.clone()).await;

        let batches = plan_batches(&[wanted[0].hash(), wanted[1].hash()], 10, "me:1");
        let blocks = fetch_blocks(batches, vec![partial, holding], &NetworkConfig::local()).await;
        assert_eq!(blocks.len(), 2);
        assert_eq!(hashes(&blocks), hashes(&wanted));
    }

    #[tokio::test]
    async fn only_lacking_peers_leave_round_empty() {
        let lacking = serving(Vec::new()).await;
        let batches = plan_batches(&[block(1).hash()], 10, "me:1");
        let blocks = fetch_blocks(batches, vec![lacking], &NetworkConfig::local()).await;
        assert!(blocks.is_empty());
    }

    #[test]
    fn unrequested_blocks_are_dropped_from_reply() {
        let batch = plan_batches(&[block(1).hash()], 10, "me:1").remove(0);
        let (got, shortfall) = split_reply(&batch, vec![block(2), block(1)]);
        assert_eq!(got, vec![block(1)]);
        assert!(shortfall.is_none());
    }

    #[test]
    fn source_is_asked_first() {
        let peers = vec!["a:1".to_string(), "b:1".to_string()];
        assert_eq!(source_first(peers.clone(), "b:1"), vec!["b:1", "a:1"]);
        assert_eq!(source_first(peers, "c:1"), vec!["c:1", "a:1", "b:1"]);
    }
}
