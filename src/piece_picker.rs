//! The piece picking policy: rarest first with a uniform random tie-break.
//!
//! The picker is a pure function over the piece table and one peer's
//! bitfield; all its inputs are read under the transfer mutex. Randomness
//! comes from the transfer's own seeded generator so that tests are
//! deterministic.

use rand::{rngs::StdRng, Rng};

use crate::{piece::Piece, Bitfield, PeerId, PieceIndex};

/// Picks the piece the peer should download next, or `None` if the peer has
/// nothing we currently want.
///
/// A piece is a candidate if the peer advertises it, we don't have it, it is
/// not queued for verification, and this peer isn't already working on it
/// (a peer works one piece at a time until it finishes it or the piece is
/// stolen back). Among candidates the rarest (lowest availability) wins;
/// ties are broken uniformly at random.
pub(crate) fn pick_piece(
    pieces: &[Piece],
    own_pieces: &Bitfield,
    peer_pieces: &Bitfield,
    peer_id: &PeerId,
    rng: &mut StdRng,
) -> Option<PieceIndex> {
    debug_assert_eq!(pieces.len(), own_pieces.len());
    debug_assert_eq!(pieces.len(), peer_pieces.len());

    let mut min_availability = usize::MAX;
    let mut rarest: Vec<PieceIndex> = Vec::new();

    for index in peer_pieces.iter_ones() {
        if own_pieces[index] {
            continue;
        }
        let piece = &pieces[index];
        if piece.queued || piece.requested_from.contains_key(peer_id) {
            continue;
        }

        if piece.availability < min_availability {
            min_availability = piece.availability;
            rarest.clear();
            rarest.push(index);
        } else if piece.availability == min_availability {
            rarest.push(index);
        }
    }

    if rarest.is_empty() {
        None
    } else {
        Some(rarest[rng.gen_range(0..rarest.len())])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitvec::prelude::{bitvec, Msb0};
    use rand::SeedableRng;

    fn pieces_with_availabilities(availabilities: &[usize]) -> Vec<Piece> {
        availabilities
            .iter()
            .enumerate()
            .map(|(index, availability)| {
                let mut piece = Piece::new(index, crate::BLOCK_LEN, [0; 20]);
                piece.availability = *availability;
                piece
            })
            .collect()
    }

    fn none_bitfield(len: usize) -> Bitfield {
        bitvec![u8, Msb0; 0; len]
    }

    fn all_bitfield(len: usize) -> Bitfield {
        bitvec![u8, Msb0; 1; len]
    }

    #[test]
    fn test_empty_candidates_returns_none() {
        let pieces = pieces_with_availabilities(&[1, 1, 1]);
        let own = none_bitfield(3);
        // the peer has nothing
        let peer_pieces = none_bitfield(3);
        let mut rng = StdRng::seed_from_u64(0);
        assert_eq!(
            pick_piece(&pieces, &own, &peer_pieces, &[0; 20], &mut rng),
            None
        );

        // the peer only has what we already have
        let mut own = none_bitfield(3);
        own.set(1, true);
        let mut peer_pieces = none_bitfield(3);
        peer_pieces.set(1, true);
        assert_eq!(
            pick_piece(&pieces, &own, &peer_pieces, &[0; 20], &mut rng),
            None
        );
    }

    #[test]
    fn test_tie_break_is_roughly_uniform() {
        let pieces = pieces_with_availabilities(&[3, 1, 1, 2, 1]);
        let own = none_bitfield(5);
        let peer_pieces = all_bitfield(5);
        let peer_id = [1; 20];
        let mut rng = StdRng::seed_from_u64(42);

        const TRIALS: usize = 3000;
        let mut counts = [0usize; 5];
        for _ in 0..TRIALS {
            let index =
                pick_piece(&pieces, &own, &peer_pieces, &peer_id, &mut rng)
                    .unwrap();
            counts[index] += 1;
        }

        // only the availability-1 pieces may ever be picked
        assert_eq!(counts[0], 0);
        assert_eq!(counts[3], 0);
        // and the three of them roughly uniformly
        for &index in &[1, 2, 4] {
            assert!(
                counts[index] > TRIALS / 3 - TRIALS / 10
                    && counts[index] < TRIALS / 3 + TRIALS / 10,
                "piece {} picked {} times out of {}",
                index,
                counts[index],
                TRIALS
            );
        }
    }

    #[test]
    fn test_marked_piece_is_excluded_for_that_peer() {
        let mut pieces = pieces_with_availabilities(&[1, 1, 1]);
        let own = none_bitfield(3);
        let peer_pieces = all_bitfield(3);
        let peer_id = [1; 20];
        let other_peer_id = [2; 20];
        let mut rng = StdRng::seed_from_u64(7);

        pieces[2].mark_selected(peer_id);

        for _ in 0..100 {
            let index =
                pick_piece(&pieces, &own, &peer_pieces, &peer_id, &mut rng)
                    .unwrap();
            assert_ne!(index, 2);
        }

        // but another peer may still pick piece 2
        let picked: Vec<_> = (0..100)
            .filter_map(|_| {
                pick_piece(
                    &pieces,
                    &own,
                    &peer_pieces,
                    &other_peer_id,
                    &mut rng,
                )
            })
            .collect();
        assert!(picked.contains(&2));
    }

    #[test]
    fn test_queued_piece_is_excluded() {
        let mut pieces = pieces_with_availabilities(&[1, 5]);
        let own = none_bitfield(2);
        let peer_pieces = all_bitfield(2);
        let mut rng = StdRng::seed_from_u64(3);

        pieces[0].queued = true;
        assert_eq!(
            pick_piece(&pieces, &own, &peer_pieces, &[0; 20], &mut rng),
            Some(1)
        );
    }

    #[test]
    fn test_rarest_piece_wins() {
        // one piece everyone has, one piece a single peer has
        let mut availabilities = vec![100; 100];
        availabilities[99] = 1;
        let pieces = pieces_with_availabilities(&availabilities);
        let own = none_bitfield(100);
        let peer_pieces = all_bitfield(100);
        let mut rng = StdRng::seed_from_u64(11);

        let mut rare_picks = 0;
        const TRIALS: usize = 1000;
        for _ in 0..TRIALS {
            if pick_piece(&pieces, &own, &peer_pieces, &[0; 20], &mut rng)
                == Some(99)
            {
                rare_picks += 1;
            }
        }
        assert!(
            rare_picks * 100 >= TRIALS * 95,
            "rarest piece picked only {} times out of {}",
            rare_picks,
            TRIALS
        );
    }
}
