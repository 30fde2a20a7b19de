use std::fmt;
use std::sync::atomic::{AtomicU16, Ordering};

use caissa_chess::Move;

use crate::atomics::AtomicF32;

// ---------------------------------------------------------------------------
// Compressed prior codec
// ---------------------------------------------------------------------------
//
// Policy priors live in [0, 1] and cluster near zero, so a float32 prior is
// stored in 16 bits by dropping the sign bit, the exponent sign bit and the
// two high exponent bits (assumed set for any magnitude >= 2^-31), keeping
// bits 27..12. The arithmetic below folds round-to-nearest and the
// assumed-bits subtraction into a single add; inputs too small to represent
// underflow to zero. Raw ordering of the stored u16 equals ordering of the
// decoded float, so edges can be sorted without decoding.

const ASSUMED_EXPONENT_BITS: i32 = 3 << 28;
const ROUNDINGS: i32 = (1 << 11) - ASSUMED_EXPONENT_BITS;

pub(crate) fn compress_prior(p: f32) -> u16 {
    debug_assert!((0.0..=1.0).contains(&p), "prior out of range: {p}");
    let tmp = (p.to_bits() as i32).wrapping_add(ROUNDINGS);
    if tmp < 0 {
        0
    } else {
        (tmp >> 12) as u16
    }
}

pub(crate) fn decompress_prior(raw: u16) -> f32 {
    if raw == 0 {
        return 0.0;
    }
    f32::from_bits(((raw as u32) << 12) | ASSUMED_EXPONENT_BITS as u32)
}

// ---------------------------------------------------------------------------
// Edge
// ---------------------------------------------------------------------------

/// A legal move out of a node, with its compressed network prior and the
/// policy value the RENTS blend assigns to it. The owning child node, if
/// any, lives in the parent's child container under this edge's index.
///
/// The prior is atomic because a proven losing child clears it while
/// other workers may be reading; everything else about an edge is fixed
/// at expansion time.
pub struct Edge {
    mov: Move,
    p: AtomicU16,
    policy: AtomicF32,
}

impl Edge {
    fn new(mov: Move) -> Self {
        Edge {
            mov,
            p: AtomicU16::new(0),
            policy: AtomicF32::new(0.0),
        }
    }

    /// Build the edge array for a freshly expanded node.
    pub fn from_moves(moves: &[Move]) -> Box<[Edge]> {
        moves.iter().map(|&m| Edge::new(m)).collect()
    }

    pub fn get_move(&self, as_opponent: bool) -> Move {
        if as_opponent {
            self.mov.mirror()
        } else {
            self.mov
        }
    }

    pub fn get_p(&self) -> f32 {
        decompress_prior(self.p.load(Ordering::Relaxed))
    }

    pub fn set_p(&self, p: f32) {
        self.p.store(compress_prior(p), Ordering::Relaxed);
    }

    pub(crate) fn raw_p(&self) -> u16 {
        self.p.load(Ordering::Relaxed)
    }

    pub fn get_policy(&self) -> f32 {
        self.policy.load()
    }

    pub fn set_policy(&self, value: f32) {
        self.policy.store(value);
    }
}

impl fmt::Debug for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Edge {{ move: {}, p_raw: {}, p: {} }}",
            self.mov,
            self.raw_p(),
            self.get_p()
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};

    fn mv(s: &str) -> Move {
        Move::from_uci(s).unwrap()
    }

    // ---- codec scenarios ----

    #[test]
    fn codec_zero_is_exact() {
        assert_eq!(decompress_prior(compress_prior(0.0)), 0.0);
    }

    #[test]
    fn codec_one_within_rounding() {
        let p = decompress_prior(compress_prior(1.0));
        let tol = (2.0f32).powi(-11);
        assert!((1.0 - tol..=1.0 + tol).contains(&p), "got {p}");
    }

    #[test]
    fn codec_tiny_underflows_to_zero() {
        assert_eq!(decompress_prior(compress_prior(1e-10)), 0.0);
    }

    // ---- codec properties ----

    #[test]
    fn codec_round_trip_error_bound() {
        let mut rng = SmallRng::seed_from_u64(17);
        for _ in 0..20_000 {
            let p: f32 = rng.gen_range(0.0..=1.0);
            let back = decompress_prior(compress_prior(p));
            let bound = (2.0f32).powi(-11) * p.max((2.0f32).powi(-20));
            assert!(
                (back - p).abs() <= bound,
                "p={p} back={back} bound={bound}"
            );
        }
    }

    #[test]
    fn codec_ordering_preserved() {
        let mut rng = SmallRng::seed_from_u64(18);
        for _ in 0..20_000 {
            let a: f32 = rng.gen_range(0.0..=1.0);
            let b: f32 = rng.gen_range(0.0..=1.0);
            let (lo, hi) = if a < b { (a, b) } else { (b, a) };
            assert!(compress_prior(lo) <= compress_prior(hi));
        }
    }

    #[test]
    fn codec_decode_monotone_in_raw() {
        let mut prev = decompress_prior(0);
        for raw in 1..=u16::MAX {
            let cur = decompress_prior(raw);
            assert!(cur > prev, "raw {raw} decoded {cur} <= {prev}");
            prev = cur;
        }
    }

    // ---- edge ----

    #[test]
    fn from_moves_sets_moves_in_order() {
        let edges = Edge::from_moves(&[mv("e2e4"), mv("d2d4"), mv("g1f3")]);
        assert_eq!(edges.len(), 3);
        assert_eq!(edges[0].get_move(false), mv("e2e4"));
        assert_eq!(edges[2].get_move(false), mv("g1f3"));
        // Fresh edges carry zero prior.
        assert_eq!(edges[1].get_p(), 0.0);
    }

    #[test]
    fn get_move_as_opponent_mirrors() {
        let edges = Edge::from_moves(&[mv("e2e4")]);
        assert_eq!(edges[0].get_move(true), mv("e7e5"));
    }

    #[test]
    fn set_p_get_p_round_trip() {
        let edges = Edge::from_moves(&[mv("e2e4")]);
        edges[0].set_p(0.375);
        assert!((edges[0].get_p() - 0.375).abs() < 3e-4);
    }

    #[test]
    fn policy_round_trip() {
        let edges = Edge::from_moves(&[mv("e2e4")]);
        edges[0].set_policy(0.625);
        assert_eq!(edges[0].get_policy(), 0.625);
    }
}
