//! Choke scheduling.
//!
//! Every choke cycle the torrent ranks its interested peers by transfer rate
//! and unchokes the best few, reserving one slot for a randomly picked
//! "optimistic" peer so that newcomers and slow peers get a chance to prove
//! themselves. The optimistic pick is held for two cycles. Between full
//! cycles, [`ChokeManager::balance`] trims or fills the unchoked set to the
//! configured cap without re-ranking.
//!
//! The manager itself is pure bookkeeping: it receives a snapshot of the
//! connected peers and returns which of them to choke and unchoke, and the
//! torrent turns those into peer session commands.

use std::net::SocketAddr;

use rand::Rng;

/// How many cycles an optimistically unchoked peer keeps its slot.
const OPTIMISTIC_HOLD_CYCLES: u32 = 2;

/// A snapshot of a connected peer, the input to a choke round.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Candidate {
    pub addr: SocketAddr,
    /// Whether the peer wants data from us. Uninterested peers are never
    /// unchoked: they wouldn't request anything anyway.
    pub is_interested: bool,
    /// Whether we are currently not choking the peer.
    pub is_unchoked: bool,
    /// Snubbed peers stopped serving our requests; they are excluded from
    /// the ranked slots and can only re-enter through the optimistic slot.
    pub is_snubbed: bool,
    /// The peer's recent download rate while we're leeching, or our upload
    /// rate to the peer while we're seeding, in bytes per second.
    pub rate: u64,
}

/// The choke and unchoke commands resulting from a round. Only transitions
/// are listed: peers already in the right state don't appear.
#[derive(Debug, Default, PartialEq)]
pub(crate) struct Transitions {
    pub unchoke: Vec<SocketAddr>,
    pub choke: Vec<SocketAddr>,
}

pub(crate) struct ChokeManager {
    max_uploads: usize,
    /// The peer currently holding the optimistic slot and for how many
    /// cycles it has held it.
    optimistic: Option<SocketAddr>,
    optimistic_age: u32,
}

impl ChokeManager {
    pub fn new(max_uploads: usize) -> Self {
        Self {
            max_uploads,
            optimistic: None,
            optimistic_age: 0,
        }
    }

    /// Runs a full choke round: re-ranks peers by rate and rotates the
    /// optimistic slot if it's due.
    pub fn cycle(&mut self, peers: &[Candidate]) -> Transitions {
        self.cycle_with(&mut rand::thread_rng(), peers)
    }

    pub fn cycle_with<R: Rng>(
        &mut self,
        rng: &mut R,
        peers: &[Candidate],
    ) -> Transitions {
        if self.max_uploads == 0 {
            self.optimistic = None;
            return choke_all(peers);
        }

        // rank interested, non-snubbed peers by rate; the top slots minus
        // the optimistic one are unchoked
        let mut ranked: Vec<&Candidate> = peers
            .iter()
            .filter(|p| p.is_interested && !p.is_snubbed)
            .collect();
        ranked.sort_unstable_by(|a, b| b.rate.cmp(&a.rate));
        let mut desired: Vec<SocketAddr> = ranked
            .iter()
            .take(self.max_uploads - 1)
            .map(|p| p.addr)
            .collect();

        self.rotate_optimistic(rng, peers, &desired);
        if let Some(optimistic) = self.optimistic {
            desired.push(optimistic);
        }

        transitions(peers, &desired)
    }

    /// Enforces the unchoke cap between full cycles without re-ranking:
    /// chokes the slowest extras when over the cap and unchokes arbitrary
    /// interested peers when under it.
    pub fn balance(&self, peers: &[Candidate]) -> Transitions {
        let mut unchoked: Vec<&Candidate> =
            peers.iter().filter(|p| p.is_unchoked).collect();

        if unchoked.len() > self.max_uploads {
            // choke the slowest extras, sparing the optimistic slot
            unchoked.sort_unstable_by_key(|p| p.rate);
            let excess = unchoked.len() - self.max_uploads;
            Transitions {
                unchoke: Vec::new(),
                choke: unchoked
                    .iter()
                    .filter(|p| Some(p.addr) != self.optimistic)
                    .take(excess)
                    .map(|p| p.addr)
                    .collect(),
            }
        } else {
            let free = self.max_uploads - unchoked.len();
            Transitions {
                unchoke: peers
                    .iter()
                    .filter(|p| {
                        p.is_interested && !p.is_unchoked && !p.is_snubbed
                    })
                    .take(free)
                    .map(|p| p.addr)
                    .collect(),
                choke: Vec::new(),
            }
        }
    }

    /// Ages the optimistic slot and picks a new holder if the current one
    /// is gone, lost interest, earned a ranked slot, or held the slot long
    /// enough.
    fn rotate_optimistic<R: Rng>(
        &mut self,
        rng: &mut R,
        peers: &[Candidate],
        ranked: &[SocketAddr],
    ) {
        let holder_is_valid = self.optimistic.map_or(false, |addr| {
            peers
                .iter()
                .any(|p| p.addr == addr && p.is_interested)
                && !ranked.contains(&addr)
        });

        if holder_is_valid && self.optimistic_age < OPTIMISTIC_HOLD_CYCLES {
            self.optimistic_age += 1;
            return;
        }

        // candidates: interested peers that are currently choked and didn't
        // just earn a ranked slot; snubbed peers are deliberately eligible
        let candidates: Vec<SocketAddr> = peers
            .iter()
            .filter(|p| {
                p.is_interested
                    && !p.is_unchoked
                    && !ranked.contains(&p.addr)
            })
            .map(|p| p.addr)
            .collect();

        self.optimistic = if candidates.is_empty() {
            // keep a still-valid holder rather than leaving the slot empty
            self.optimistic.filter(|_| holder_is_valid)
        } else {
            Some(candidates[rng.gen_range(0..candidates.len())])
        };
        self.optimistic_age = 0;
    }
}

fn choke_all(peers: &[Candidate]) -> Transitions {
    Transitions {
        unchoke: Vec::new(),
        choke: peers
            .iter()
            .filter(|p| p.is_unchoked)
            .map(|p| p.addr)
            .collect(),
    }
}

/// Computes the session commands that turn the current unchoke state into
/// the desired one.
fn transitions(peers: &[Candidate], desired: &[SocketAddr]) -> Transitions {
    let mut result = Transitions::default();
    for peer in peers.iter() {
        let should_be_unchoked = desired.contains(&peer.addr);
        if should_be_unchoked && !peer.is_unchoked {
            result.unchoke.push(peer.addr);
        } else if !should_be_unchoked && peer.is_unchoked {
            result.choke.push(peer.addr);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use rand::rngs::mock::StepRng;

    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    /// Ten interested peers with rates growing with their port number.
    fn ten_peers() -> Vec<Candidate> {
        (0..10)
            .map(|index| Candidate {
                addr: addr(7000 + index),
                is_interested: true,
                is_unchoked: false,
                is_snubbed: false,
                rate: index as u64 * 1000,
            })
            .collect()
    }

    fn apply(peers: &mut Vec<Candidate>, transitions: &Transitions) {
        for peer in peers.iter_mut() {
            if transitions.unchoke.contains(&peer.addr) {
                peer.is_unchoked = true;
            }
            if transitions.choke.contains(&peer.addr) {
                peer.is_unchoked = false;
            }
        }
    }

    #[test]
    fn test_cycle_unchokes_top_peers_and_one_optimistic() {
        let mut choker = ChokeManager::new(4);
        let mut rng = StepRng::new(0, 1);
        let mut peers = ten_peers();

        let transitions = choker.cycle_with(&mut rng, &peers);
        apply(&mut peers, &transitions);

        let unchoked: Vec<_> =
            peers.iter().filter(|p| p.is_unchoked).collect();
        assert_eq!(unchoked.len(), 4);

        // the top three by rate hold ranked slots
        for port in [7009, 7008, 7007].iter() {
            assert!(unchoked.iter().any(|p| p.addr == addr(*port)));
        }
        // the fourth is the optimistic pick, from outside the top three
        let optimistic = choker.optimistic.unwrap();
        assert!(![7009, 7008, 7007]
            .iter()
            .any(|port| addr(*port) == optimistic));
    }

    #[test]
    fn test_optimistic_slot_rotates_after_two_cycles() {
        let mut choker = ChokeManager::new(4);
        let mut rng = StepRng::new(0, 1);
        let mut peers = ten_peers();

        let transitions = choker.cycle_with(&mut rng, &peers);
        apply(&mut peers, &transitions);
        let first = choker.optimistic.unwrap();

        // held through the next two cycles
        let transitions = choker.cycle_with(&mut rng, &peers);
        apply(&mut peers, &transitions);
        assert_eq!(choker.optimistic.unwrap(), first);
        let transitions = choker.cycle_with(&mut rng, &peers);
        apply(&mut peers, &transitions);
        assert_eq!(choker.optimistic.unwrap(), first);

        // the third cycle picks a new holder, and the old one gets choked
        let transitions = choker.cycle_with(&mut rng, &peers);
        let rotated = choker.optimistic.unwrap();
        assert_ne!(rotated, first);
        assert!(transitions.choke.contains(&first));
        assert!(transitions.unchoke.contains(&rotated));
    }

    #[test]
    fn test_only_transitions_are_emitted() {
        let mut choker = ChokeManager::new(4);
        let mut rng = StepRng::new(0, 1);
        let mut peers = ten_peers();

        let transitions = choker.cycle_with(&mut rng, &peers);
        apply(&mut peers, &transitions);
        // an immediate re-cycle changes nothing: same ranking, the
        // optimistic holder is retained
        let transitions = choker.cycle_with(&mut rng, &peers);
        assert_eq!(transitions, Transitions::default());
    }

    #[test]
    fn test_snubbed_peers_are_not_ranked() {
        let mut choker = ChokeManager::new(3);
        let mut rng = StepRng::new(0, 1);
        let mut peers = ten_peers();
        // snub the two fastest
        peers[9].is_snubbed = true;
        peers[8].is_snubbed = true;

        let transitions = choker.cycle_with(&mut rng, &peers);
        apply(&mut peers, &transitions);

        // the ranked slots fall to the next fastest peers
        assert!(peers[7].is_unchoked);
        assert!(peers[6].is_unchoked);
        assert!(!peers[9].is_unchoked || choker.optimistic == Some(addr(7009)));
        assert!(!peers[8].is_unchoked || choker.optimistic == Some(addr(7008)));
    }

    #[test]
    fn test_uninterested_peers_are_never_unchoked() {
        let mut choker = ChokeManager::new(4);
        let mut rng = StepRng::new(0, 1);
        let mut peers = ten_peers();
        for peer in peers.iter_mut() {
            peer.is_interested = false;
        }

        let transitions = choker.cycle_with(&mut rng, &peers);
        assert!(transitions.unchoke.is_empty());
        assert!(choker.optimistic.is_none());
    }

    #[test]
    fn test_balance_chokes_excess_without_reranking() {
        let choker = ChokeManager::new(2);
        let mut peers = ten_peers();
        // four unchoked peers, two over the cap
        for index in [1, 3, 5, 7].iter() {
            peers[*index].is_unchoked = true;
        }

        let transitions = choker.balance(&peers);
        // the two slowest unchoked peers get choked
        assert_eq!(transitions.choke.len(), 2);
        assert!(transitions.choke.contains(&addr(7001)));
        assert!(transitions.choke.contains(&addr(7003)));
        assert!(transitions.unchoke.is_empty());
    }

    #[test]
    fn test_balance_fills_free_slots() {
        let choker = ChokeManager::new(3);
        let mut peers = ten_peers();
        peers[0].is_unchoked = true;

        let transitions = choker.balance(&peers);
        assert_eq!(transitions.unchoke.len(), 2);
        assert!(transitions.choke.is_empty());
    }

    #[test]
    fn test_zero_upload_slots_chokes_everyone() {
        let mut choker = ChokeManager::new(0);
        let mut rng = StepRng::new(0, 1);
        let mut peers = ten_peers();
        peers[2].is_unchoked = true;

        let transitions = choker.cycle_with(&mut rng, &peers);
        assert_eq!(transitions.choke, vec![addr(7002)]);
        assert!(transitions.unchoke.is_empty());
    }
}
