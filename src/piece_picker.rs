//! Piece selection.
//!
//! The piece picker is shared by all peer sessions of a torrent and decides
//! which piece a session should start downloading next. Selection is rarest
//! first: among the pieces a peer can provide that we don't have and aren't
//! already downloading, the one held by the fewest connected peers wins,
//! with ties broken by the lower piece index. Pieces belonging exclusively
//! to skipped files are never picked.
//!
//! In endgame the "aren't already downloading" restriction is lifted so
//! that the last few pieces can be fetched from several peers at once.

use crate::{content::FilePriority, error::*, Bitfield, PieceIndex};

#[derive(Clone, Copy, Debug)]
struct Piece {
    /// The number of connected peers that have this piece.
    frequency: usize,
    /// The piece's download priority, derived from the priorities of the
    /// files it overlaps.
    priority: FilePriority,
    /// Whether some session is currently downloading this piece.
    is_pending: bool,
}

impl Default for Piece {
    fn default() -> Self {
        Self {
            frequency: 0,
            priority: FilePriority::Normal,
            is_pending: false,
        }
    }
}

pub(crate) struct PiecePicker {
    /// The pieces we have (verified and on disk).
    own_pieces: Bitfield,
    /// Per piece availability and selection state.
    pieces: Vec<Piece>,
}

impl PiecePicker {
    /// Creates a picker for a torrent where we already have the pieces set
    /// in the given bitfield.
    pub fn new(own_pieces: Bitfield) -> Self {
        let pieces = vec![Piece::default(); own_pieces.len()];
        Self { own_pieces, pieces }
    }

    pub fn own_pieces(&self) -> &Bitfield {
        &self.own_pieces
    }

    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    /// Registers a freshly connected peer's full piece availability.
    /// Returns true if the peer has a piece we want, that is, whether we
    /// became interested in the peer.
    pub fn register_availability(
        &mut self,
        pieces: &Bitfield,
    ) -> Result<bool> {
        if pieces.len() != self.pieces.len() {
            return Err(Error::ProtocolViolation(
                "bitfield length doesn't match piece count",
            ));
        }
        let mut interested = false;
        for (index, has) in pieces.iter().enumerate() {
            if *has {
                self.pieces[index].frequency += 1;
                interested = interested || self.is_wanted(index);
            }
        }
        Ok(interested)
    }

    /// Removes a disconnected peer's pieces from the availability counts.
    pub fn unregister_availability(&mut self, pieces: &Bitfield) {
        debug_assert_eq!(pieces.len(), self.pieces.len());
        for (index, has) in pieces.iter().enumerate() {
            if *has {
                debug_assert!(self.pieces[index].frequency > 0);
                self.pieces[index].frequency -= 1;
            }
        }
    }

    /// Registers that a peer announced a new piece via a have message.
    /// Returns true if the piece is one we want.
    pub fn register_have(&mut self, index: PieceIndex) -> Result<bool> {
        let piece = self
            .pieces
            .get_mut(index)
            .ok_or(Error::InvalidPieceIndex)?;
        piece.frequency += 1;
        Ok(self.is_wanted(index))
    }

    /// Picks the rarest piece the peer has that we want and aren't already
    /// downloading, and marks it as pending. In endgame, pieces already
    /// being downloaded may be picked again, though fresh pieces still come
    /// first.
    pub fn pick_piece(
        &mut self,
        peer_pieces: &Bitfield,
        in_endgame: bool,
    ) -> Option<PieceIndex> {
        debug_assert_eq!(peer_pieces.len(), self.pieces.len());

        let mut best: Option<(usize, PieceIndex)> = None;
        let mut best_pending: Option<(usize, PieceIndex)> = None;
        for (index, piece) in self.pieces.iter().enumerate() {
            if self.own_pieces[index]
                || !peer_pieces[index]
                || piece.priority == FilePriority::Skip
            {
                continue;
            }
            let candidate = (piece.frequency, index);
            let slot = if piece.is_pending {
                &mut best_pending
            } else {
                &mut best
            };
            // lower frequency wins, then the lower index
            if slot.map(|cur| candidate < cur).unwrap_or(true) {
                *slot = Some(candidate);
            }
        }

        let picked = match (best, in_endgame) {
            (Some((_, index)), _) => Some(index),
            (None, true) => best_pending.map(|(_, index)| index),
            (None, false) => None,
        };
        if let Some(index) = picked {
            self.pieces[index].is_pending = true;
        }
        picked
    }

    /// Registers that the piece was downloaded and verified.
    pub fn received_piece(&mut self, index: PieceIndex) {
        debug_assert!(!self.own_pieces[index]);
        self.own_pieces.set(index, true);
        self.pieces[index].is_pending = false;
    }

    /// Reverts the piece to pickable after its download failed the hash
    /// check.
    pub fn redo_piece(&mut self, index: PieceIndex) {
        debug_assert!(!self.own_pieces[index]);
        self.pieces[index].is_pending = false;
    }

    /// Reverts the piece to pickable after its last downloading session
    /// disconnected.
    pub fn release_piece(&mut self, index: PieceIndex) {
        self.pieces[index].is_pending = false;
    }

    /// Sets the priority of a contiguous piece range. Where file priority
    /// ranges overlap on a boundary piece the higher priority wins, so
    /// ranges must be applied in ascending priority order.
    pub fn set_priority(
        &mut self,
        range: std::ops::Range<PieceIndex>,
        priority: FilePriority,
    ) {
        for piece in &mut self.pieces[range] {
            piece.priority = piece.priority.max(priority);
        }
    }

    /// Clears all piece priorities to the given value. Used before
    /// reapplying file priorities from scratch.
    pub fn reset_priorities(&mut self, priority: FilePriority) {
        for piece in &mut self.pieces {
            piece.priority = priority;
        }
    }

    /// Returns true if the peer has any piece that we want.
    pub fn is_interested_in(&self, peer_pieces: &Bitfield) -> bool {
        debug_assert_eq!(peer_pieces.len(), self.pieces.len());
        peer_pieces
            .iter()
            .enumerate()
            .any(|(index, has)| *has && self.is_wanted(index))
    }

    fn is_wanted(&self, index: PieceIndex) -> bool {
        !self.own_pieces[index]
            && self.pieces[index].priority != FilePriority::Skip
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_picker(piece_count: usize) -> PiecePicker {
        PiecePicker::new(Bitfield::repeat(false, piece_count))
    }

    fn seed_bitfield(piece_count: usize) -> Bitfield {
        Bitfield::repeat(true, piece_count)
    }

    #[test]
    fn test_rarest_piece_is_picked_first() {
        let mut picker = empty_picker(4);

        // two peers have every piece and a third all but piece 2, leaving
        // piece 2 the rarest
        picker.register_availability(&seed_bitfield(4)).unwrap();
        picker.register_availability(&seed_bitfield(4)).unwrap();
        let mut partial = seed_bitfield(4);
        partial.set(2, false);
        picker.register_availability(&partial).unwrap();

        let seed = seed_bitfield(4);
        assert_eq!(picker.pick_piece(&seed, false), Some(2));
        // then ties are broken by the lower index
        assert_eq!(picker.pick_piece(&seed, false), Some(0));
        assert_eq!(picker.pick_piece(&seed, false), Some(1));
        assert_eq!(picker.pick_piece(&seed, false), Some(3));
        // everything is pending now
        assert_eq!(picker.pick_piece(&seed, false), None);
    }

    #[test]
    fn test_only_picks_pieces_the_peer_has() {
        let mut picker = empty_picker(3);
        let mut peer_pieces = Bitfield::repeat(false, 3);
        peer_pieces.set(1, true);
        picker.register_availability(&peer_pieces).unwrap();

        assert_eq!(picker.pick_piece(&peer_pieces, false), Some(1));
        assert_eq!(picker.pick_piece(&peer_pieces, false), None);
    }

    #[test]
    fn test_own_pieces_are_not_picked() {
        let mut own = Bitfield::repeat(false, 3);
        own.set(0, true);
        own.set(2, true);
        let mut picker = PiecePicker::new(own);
        picker.register_availability(&seed_bitfield(3)).unwrap();

        assert_eq!(picker.pick_piece(&seed_bitfield(3), false), Some(1));
        assert_eq!(picker.pick_piece(&seed_bitfield(3), false), None);
    }

    #[test]
    fn test_skipped_pieces_are_not_picked() {
        let mut picker = empty_picker(3);
        picker.register_availability(&seed_bitfield(3)).unwrap();
        picker.set_priority(1..3, FilePriority::Skip);
        // set_priority keeps the higher value, so reset and apply skip low
        picker.reset_priorities(FilePriority::Skip);
        picker.set_priority(0..1, FilePriority::Normal);

        assert_eq!(picker.pick_piece(&seed_bitfield(3), false), Some(0));
        assert_eq!(picker.pick_piece(&seed_bitfield(3), false), None);
    }

    #[test]
    fn test_endgame_allows_repicking_pending_pieces() {
        let mut picker = empty_picker(2);
        picker.register_availability(&seed_bitfield(2)).unwrap();

        assert_eq!(picker.pick_piece(&seed_bitfield(2), false), Some(0));
        assert_eq!(picker.pick_piece(&seed_bitfield(2), false), Some(1));
        // outside endgame pending pieces aren't handed out again
        assert_eq!(picker.pick_piece(&seed_bitfield(2), false), None);
        // in endgame they are, rarest first
        assert_eq!(picker.pick_piece(&seed_bitfield(2), true), Some(0));
    }

    #[test]
    fn test_redo_makes_piece_pickable_again() {
        let mut picker = empty_picker(1);
        picker.register_availability(&seed_bitfield(1)).unwrap();

        assert_eq!(picker.pick_piece(&seed_bitfield(1), false), Some(0));
        assert_eq!(picker.pick_piece(&seed_bitfield(1), false), None);

        picker.redo_piece(0);
        assert_eq!(picker.pick_piece(&seed_bitfield(1), false), Some(0));
    }

    #[test]
    fn test_received_piece_is_never_picked_again() {
        let mut picker = empty_picker(1);
        picker.register_availability(&seed_bitfield(1)).unwrap();
        picker.pick_piece(&seed_bitfield(1), false);

        picker.received_piece(0);
        assert_eq!(picker.pick_piece(&seed_bitfield(1), false), None);
        assert_eq!(picker.pick_piece(&seed_bitfield(1), true), None);
        assert!(picker.own_pieces()[0]);
    }

    #[test]
    fn test_interest_tracking() {
        let mut picker = empty_picker(2);
        let interested =
            picker.register_availability(&seed_bitfield(2)).unwrap();
        assert!(interested);

        picker.received_piece(0);
        assert!(picker.is_interested_in(&seed_bitfield(2)));
        picker.received_piece(1);
        // nothing left to want from the peer
        assert!(!picker.is_interested_in(&seed_bitfield(2)));
    }

    #[test]
    fn test_have_updates_frequency_and_interest() {
        let mut picker = empty_picker(2);
        let mut none = Bitfield::repeat(false, 2);
        assert!(!picker.register_availability(&none).unwrap());

        // the peer announcing a piece we lack makes it interesting
        assert!(picker.register_have(1).unwrap());
        none.set(1, true);
        assert_eq!(picker.pick_piece(&none, false), Some(1));
    }

    #[test]
    fn test_bitfield_length_mismatch_is_an_error() {
        let mut picker = empty_picker(3);
        assert!(picker
            .register_availability(&Bitfield::repeat(true, 5))
            .is_err());
    }
}
