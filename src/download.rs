//! The state of a single piece's download.
//!
//! A piece is downloaded as a sequence of 16 KiB blocks, each requested from
//! some peer. [`PieceDownload`] tracks the state of every block slot and the
//! peers that have requested them. Outside endgame a block is reserved by at
//! most one peer; in endgame several peers may race for the same block, and
//! the first arrival wins while the losers are told to cancel.
//!
//! Downloads are owned by the torrent and shared among its peer sessions,
//! so that a piece started through one peer can be finished through another.

use std::net::SocketAddr;

use crate::{block_count, block_len, BlockInfo, PieceIndex, BLOCK_LEN};

#[derive(Clone, Debug, PartialEq)]
enum BlockState {
    /// The block hasn't been requested from anyone.
    Free,
    /// The block has been requested from the contained peers. Outside
    /// endgame this holds a single peer.
    Requested(Vec<SocketAddr>),
    /// The block has arrived and was passed on to the disk task.
    Received,
}

pub(crate) struct PieceDownload {
    /// The piece being downloaded.
    index: PieceIndex,
    /// The piece's length, in bytes.
    len: u32,
    /// The block slots, in piece offset order.
    blocks: Vec<BlockState>,
    /// Peers that delivered at least one of the received blocks. Needed to
    /// know whom to penalize if the completed piece fails its hash check.
    contributors: Vec<SocketAddr>,
}

impl PieceDownload {
    pub fn new(index: PieceIndex, len: u32) -> Self {
        Self {
            index,
            len,
            blocks: vec![BlockState::Free; block_count(len)],
            contributors: Vec::new(),
        }
    }

    pub fn piece_index(&self) -> PieceIndex {
        self.index
    }

    /// Picks at most `count` blocks for the peer to request and appends them
    /// to `blocks`, reserving them for the peer.
    ///
    /// Free blocks are handed out first. In endgame, blocks already
    /// requested from other peers are handed out too, least contended
    /// first, so the tail of the download races across peers.
    pub fn pick_blocks(
        &mut self,
        count: usize,
        peer: SocketAddr,
        in_endgame: bool,
        blocks: &mut Vec<BlockInfo>,
    ) {
        let mut remaining = count;
        let (piece_index, piece_len) = (self.index, self.len);

        for (index, state) in self.blocks.iter_mut().enumerate() {
            if remaining == 0 {
                return;
            }
            if *state == BlockState::Free {
                *state = BlockState::Requested(vec![peer]);
                blocks.push(BlockInfo {
                    piece_index,
                    offset: index as u32 * BLOCK_LEN,
                    len: block_len(piece_len, index),
                });
                remaining -= 1;
            }
        }

        if !in_endgame || remaining == 0 {
            return;
        }

        // endgame: double up on already requested blocks this peer isn't
        // part of yet, least duplicated first
        let mut candidates: Vec<_> = self
            .blocks
            .iter()
            .enumerate()
            .filter_map(|(index, state)| match state {
                BlockState::Requested(peers) if !peers.contains(&peer) => {
                    Some((peers.len(), index))
                }
                _ => None,
            })
            .collect();
        candidates.sort_unstable();

        for (_, index) in candidates.into_iter().take(remaining) {
            if let BlockState::Requested(peers) = &mut self.blocks[index] {
                peers.push(peer);
            }
            blocks.push(self.block_info(index));
        }
    }

    /// Records the arrival of a block from the given peer.
    ///
    /// Returns `None` if the block was already received through another peer
    /// (the caller should drop the data without writing it), and otherwise
    /// the list of other peers that still have the block requested, so
    /// cancels can be sent to them.
    pub fn received_block(
        &mut self,
        block: &BlockInfo,
        from: SocketAddr,
    ) -> Option<Vec<SocketAddr>> {
        debug_assert_eq!(block.piece_index, self.index);
        debug_assert_eq!(block.offset % BLOCK_LEN, 0);

        let index = block.index_in_piece();
        debug_assert_eq!(block.len, block_len(self.len, index));

        match std::mem::replace(&mut self.blocks[index], BlockState::Received)
        {
            BlockState::Received => {
                // the race was lost, keep the slot received
                None
            }
            BlockState::Free => {
                // receiving a block we never requested from anyone is the
                // session's bug; sessions drop unrequested blocks themselves
                debug_assert!(false, "received block was never requested");
                None
            }
            BlockState::Requested(peers) => {
                if !self.contributors.contains(&from) {
                    self.contributors.push(from);
                }
                Some(peers.into_iter().filter(|p| *p != from).collect())
            }
        }
    }

    /// Releases all of the peer's outstanding reservations, e.g. when it
    /// choked us or disconnected. Received blocks are left alone: partial
    /// progress through a peer survives the peer.
    pub fn free_peer_blocks(&mut self, peer: SocketAddr) {
        for state in self.blocks.iter_mut() {
            if let BlockState::Requested(peers) = state {
                peers.retain(|p| *p != peer);
                if peers.is_empty() {
                    *state = BlockState::Free;
                }
            }
        }
    }

    /// Resets every block slot after the piece failed its hash check, so
    /// the piece is downloaded from scratch.
    pub fn redo(&mut self) {
        for state in self.blocks.iter_mut() {
            *state = BlockState::Free;
        }
        self.contributors.clear();
    }

    /// The number of blocks that haven't been received yet.
    pub fn count_missing(&self) -> usize {
        self.blocks
            .iter()
            .filter(|state| **state != BlockState::Received)
            .count()
    }

    pub fn is_complete(&self) -> bool {
        self.count_missing() == 0
    }

    /// Whether any block is currently reserved by any peer.
    pub fn has_active_requests(&self) -> bool {
        self.blocks
            .iter()
            .any(|state| matches!(state, BlockState::Requested(_)))
    }

    pub fn contributors(&self) -> &[SocketAddr] {
        &self.contributors
    }

    fn block_info(&self, index: usize) -> BlockInfo {
        BlockInfo {
            piece_index: self.index,
            offset: index as u32 * BLOCK_LEN,
            len: block_len(self.len, index),
        }
    }
}
