use std::{collections::HashMap, net::SocketAddr};

use crate::{Bitfield, PieceIndex};

/// Keeps track of which pieces each peer has and how many peers have each
/// piece, and picks the rarest piece among a set of candidates.
pub(crate) struct PiecePicker {
    /// The availability of each known peer's pieces.
    ///
    /// Each bitfield has exactly as many bits as there are pieces in the
    /// torrent. A peer's bitfield never shrinks: bits are only ever set.
    peers: HashMap<SocketAddr, Bitfield>,
    /// The frequency of each piece in the swarm, i.e. how many known peers
    /// have the piece.
    ///
    /// The vector is pre-allocated to the number of pieces in the torrent and
    /// is kept in sync with `peers` on every registration and update.
    frequencies: Vec<usize>,
}

impl PiecePicker {
    /// Creates a new piece picker for the given number of pieces, with no
    /// peers known.
    pub fn new(piece_count: usize) -> Self {
        Self {
            peers: HashMap::new(),
            frequencies: vec![0; piece_count],
        }
    }

    /// Returns the number of pieces in the torrent.
    pub fn piece_count(&self) -> usize {
        self.frequencies.len()
    }

    /// Registers the availability of a peer's pieces, as announced in its
    /// bitfield message.
    ///
    /// Trailing padding bits in the bitfield are ignored, and a short bitfield
    /// is treated as the peer not having the pieces it doesn't cover.
    /// Registering the same peer again only adds the pieces not yet known, so
    /// the call is idempotent.
    pub fn register_peer(&mut self, addr: SocketAddr, pieces: &Bitfield) {
        let piece_count = self.piece_count();
        if pieces.len() < piece_count {
            log::warn!(
                "Peer {} bitfield has {} bits for {} pieces",
                addr,
                pieces.len(),
                piece_count
            );
        }

        let Self { peers, frequencies } = self;
        let availability = peers
            .entry(addr)
            .or_insert_with(|| Bitfield::repeat(false, piece_count));
        for (index, has_piece) in pieces.iter().take(piece_count).enumerate() {
            if *has_piece && !availability[index] {
                availability.set(index, true);
                frequencies[index] += 1;
            }
        }

        log::trace!(
            "Registered peer {} with {} piece(s)",
            addr,
            availability.count_ones()
        );
    }

    /// Registers that the peer has the piece, as announced in a have message,
    /// and returns whether the peer's availability changed.
    ///
    /// It's a no-op if the peer is unknown, the piece index is invalid, or if
    /// the peer was already known to have the piece.
    pub fn update_peer(&mut self, addr: &SocketAddr, index: PieceIndex) -> bool {
        if index >= self.piece_count() {
            log::warn!("Peer {} has invalid piece {}", addr, index);
            return false;
        }
        let availability = match self.peers.get_mut(addr) {
            Some(availability) => availability,
            None => {
                log::debug!("Have piece {} from unregistered peer {}", index, addr);
                return false;
            }
        };
        if availability[index] {
            return false;
        }
        availability.set(index, true);
        self.frequencies[index] += 1;
        true
    }

    /// Returns whether we know the peer to have the piece.
    pub fn has_piece(&self, addr: &SocketAddr, index: PieceIndex) -> bool {
        self.peers
            .get(addr)
            .and_then(|availability| availability.get(index).map(|b| *b))
            .unwrap_or(false)
    }

    /// Returns the number of known peers that have the piece.
    pub fn frequency(&self, index: PieceIndex) -> usize {
        self.frequencies.get(index).copied().unwrap_or(0)
    }

    /// Picks, among the candidate pieces that the peer has, the one with the
    /// lowest frequency in the swarm. Ties are broken in favor of the piece
    /// that comes first among the candidates.
    pub fn pick_rarest(
        &self,
        addr: &SocketAddr,
        candidates: impl IntoIterator<Item = PieceIndex>,
    ) -> Option<PieceIndex> {
        let availability = self.peers.get(addr)?;
        let mut rarest: Option<(PieceIndex, usize)> = None;
        for index in candidates {
            if !availability.get(index).map(|b| *b).unwrap_or(false) {
                continue;
            }
            let frequency = self.frequencies[index];
            match rarest {
                Some((_, min)) if min <= frequency => {}
                _ => rarest = Some((index, frequency)),
            }
        }

        if let Some((index, frequency)) = rarest {
            log::trace!(
                "Picked piece {} (frequency {}) for peer {}",
                index,
                frequency,
                addr
            );
        }
        rarest.map(|(index, _)| index)
    }
}
