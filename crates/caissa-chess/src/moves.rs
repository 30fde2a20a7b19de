use std::fmt;
use std::ops::Neg;
use std::str::FromStr;

use chess::{ChessMove, File, Piece, Rank, Square};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Policy index space
// ---------------------------------------------------------------------------

/// Size of the flat policy vector: 64*64 from/to pairs (queen promotions
/// included) plus an underpromotion block of 8 files * 3 directions * 3 pieces.
pub const POLICY_SIZE: usize = 64 * 64 + 8 * 3 * 3;

const UNDERPROMOTION_BASE: usize = 64 * 64;

/// Transform bit 0 mirrors the board horizontally (file flip).
pub const TRANSFORM_MIRROR: u8 = 1;

// ---------------------------------------------------------------------------
// Move — side-to-move relative move
// ---------------------------------------------------------------------------

/// A chess move as stored in the search tree.
///
/// The tree always sees positions from the side to move's perspective, so
/// moves for black are stored rank-mirrored. `mirror` converts between the
/// two frames; callers that hold an absolute-coordinate move mirror it
/// before handing it to the tree when black is to move.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Move(ChessMove);

#[derive(Debug, Error)]
#[error("cannot parse move {0:?}")]
pub struct MoveParseError(String);

impl Move {
    pub fn new(from: Square, to: Square, promotion: Option<Piece>) -> Self {
        Move(ChessMove::new(from, to, promotion))
    }

    pub fn from_uci(s: &str) -> Result<Self, MoveParseError> {
        ChessMove::from_str(s)
            .map(Move)
            .map_err(|_| MoveParseError(s.to_string()))
    }

    pub fn inner(self) -> ChessMove {
        self.0
    }

    pub fn from_square(self) -> Square {
        self.0.get_source()
    }

    pub fn to_square(self) -> Square {
        self.0.get_dest()
    }

    pub fn promotion(self) -> Option<Piece> {
        self.0.get_promotion()
    }

    /// Vertical flip of both squares. Promotion piece is unchanged.
    pub fn mirror(self) -> Self {
        Move(ChessMove::new(
            mirror_rank(self.0.get_source()),
            mirror_rank(self.0.get_dest()),
            self.0.get_promotion(),
        ))
    }

    pub fn as_uci(self) -> String {
        self.0.to_string()
    }

    /// Index into the flat policy vector.
    ///
    /// Normal moves and queen promotions map to `from * 64 + to`;
    /// underpromotions get a dedicated block indexed by the source file,
    /// the capture direction and the promoted piece. `transform` applies
    /// the board symmetry the encoder selected for this position.
    pub fn as_nn_index(self, transform: u8) -> usize {
        let (from, to) = if transform & TRANSFORM_MIRROR != 0 {
            (mirror_file(self.0.get_source()), mirror_file(self.0.get_dest()))
        } else {
            (self.0.get_source(), self.0.get_dest())
        };
        match self.0.get_promotion() {
            Some(piece) if piece != Piece::Queen => {
                let dir =
                    to.get_file().to_index() as isize - from.get_file().to_index() as isize;
                debug_assert!((-1..=1).contains(&dir), "promotion moves at most one file");
                let piece_idx = match piece {
                    Piece::Knight => 0,
                    Piece::Bishop => 1,
                    Piece::Rook => 2,
                    _ => unreachable!("queen promotions use the from/to block"),
                };
                UNDERPROMOTION_BASE
                    + from.get_file().to_index() * 9
                    + (dir + 1) as usize * 3
                    + piece_idx
            }
            _ => from.to_index() * 64 + to.to_index(),
        }
    }
}

impl fmt::Display for Move {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for Move {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Move({})", self.0)
    }
}

fn mirror_rank(sq: Square) -> Square {
    Square::make_square(
        Rank::from_index(7 - sq.get_rank().to_index()),
        sq.get_file(),
    )
}

fn mirror_file(sq: Square) -> Square {
    Square::make_square(
        sq.get_rank(),
        File::from_index(7 - sq.get_file().to_index()),
    )
}

// ---------------------------------------------------------------------------
// GameResult
// ---------------------------------------------------------------------------

/// Game outcome from white's perspective, ordered BlackWon < Draw < WhiteWon
/// so that terminal bounds can be folded with `max`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(i8)]
pub enum GameResult {
    BlackWon = -1,
    Draw = 0,
    WhiteWon = 1,
}

impl GameResult {
    pub fn to_i8(self) -> i8 {
        self as i8
    }

    pub fn from_i8(v: i8) -> Self {
        match v {
            -1 => GameResult::BlackWon,
            0 => GameResult::Draw,
            1 => GameResult::WhiteWon,
            _ => panic!("invalid game result encoding: {v}"),
        }
    }
}

impl Neg for GameResult {
    type Output = GameResult;

    fn neg(self) -> GameResult {
        match self {
            GameResult::BlackWon => GameResult::WhiteWon,
            GameResult::Draw => GameResult::Draw,
            GameResult::WhiteWon => GameResult::BlackWon,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    // ---- mirror ----

    #[test]
    fn mirror_flips_ranks_only() {
        let m = Move::from_uci("e2e4").unwrap();
        assert_eq!(m.mirror().as_uci(), "e7e5");
        // Files untouched.
        let m = Move::from_uci("a1h8").unwrap();
        assert_eq!(m.mirror().as_uci(), "a8h1");
    }

    #[test]
    fn mirror_is_involution() {
        for uci in ["e2e4", "g1f3", "e7e8q", "b7b8n"] {
            let m = Move::from_uci(uci).unwrap();
            assert_eq!(m.mirror().mirror(), m);
        }
    }

    #[test]
    fn mirror_keeps_promotion_piece() {
        let m = Move::from_uci("e7e8n").unwrap();
        let mirrored = m.mirror();
        assert_eq!(mirrored.promotion(), Some(Piece::Knight));
        assert_eq!(mirrored.as_uci(), "e2e1n");
    }

    // ---- nn index ----

    #[test]
    fn nn_index_normal_move() {
        let m = Move::from_uci("e2e4").unwrap();
        // e2 = 12, e4 = 28
        assert_eq!(m.as_nn_index(0), 12 * 64 + 28);
    }

    #[test]
    fn nn_index_queen_promotion_uses_from_to_block() {
        let m = Move::from_uci("e7e8q").unwrap();
        assert!(m.as_nn_index(0) < UNDERPROMOTION_BASE);
    }

    #[test]
    fn nn_index_underpromotions_distinct() {
        let mut seen = std::collections::HashSet::new();
        for uci in ["e7e8n", "e7e8b", "e7e8r", "e7d8n", "e7f8r", "a7a8n"] {
            let idx = Move::from_uci(uci).unwrap().as_nn_index(0);
            assert!(idx >= UNDERPROMOTION_BASE);
            assert!(idx < POLICY_SIZE);
            assert!(seen.insert(idx), "duplicate index for {uci}");
        }
    }

    #[test]
    fn nn_index_mirror_transform() {
        let m = Move::from_uci("a2a3").unwrap();
        let h = Move::from_uci("h2h3").unwrap();
        assert_eq!(m.as_nn_index(TRANSFORM_MIRROR), h.as_nn_index(0));
    }

    #[test]
    fn nn_index_in_range() {
        for uci in ["a1a2", "h8h7", "e7e8q", "h7g8r", "a2b1n"] {
            let idx = Move::from_uci(uci).unwrap().as_nn_index(0);
            assert!(idx < POLICY_SIZE, "{uci} maps to {idx}");
        }
    }

    // ---- GameResult ----

    #[test]
    fn game_result_negation() {
        assert_eq!(-GameResult::WhiteWon, GameResult::BlackWon);
        assert_eq!(-GameResult::BlackWon, GameResult::WhiteWon);
        assert_eq!(-GameResult::Draw, GameResult::Draw);
    }

    #[test]
    fn game_result_ordering() {
        assert!(GameResult::BlackWon < GameResult::Draw);
        assert!(GameResult::Draw < GameResult::WhiteWon);
        assert_eq!(
            GameResult::BlackWon.max(GameResult::WhiteWon),
            GameResult::WhiteWon
        );
    }

    #[test]
    fn game_result_i8_round_trip() {
        for r in [GameResult::BlackWon, GameResult::Draw, GameResult::WhiteWon] {
            assert_eq!(GameResult::from_i8(r.to_i8()), r);
        }
    }

    // ---- parsing ----

    #[test]
    fn from_uci_rejects_garbage() {
        assert!(Move::from_uci("not a move").is_err());
    }
}
