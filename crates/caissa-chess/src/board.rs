use std::str::FromStr;

use chess::{Board, ChessMove, Color, MoveGen, Piece, Square};
use thiserror::Error;

use crate::moves::Move;

#[derive(Debug, Error)]
pub enum FenError {
    #[error("FEN has too few fields: {0:?}")]
    TooFewFields(String),
    #[error("invalid FEN board: {0}")]
    InvalidBoard(String),
    #[error("invalid FEN counter: {0:?}")]
    InvalidCounter(String),
}

// ---------------------------------------------------------------------------
// ChessBoard
// ---------------------------------------------------------------------------

/// Absolute-coordinate board with the move-frame conversions the search
/// tree needs. Legal move generation and make-move come from the `chess`
/// crate; this wrapper translates between absolute moves and the tree's
/// side-to-move relative frame, and resolves castling aliases.
#[derive(Clone, PartialEq)]
pub struct ChessBoard {
    inner: Board,
}

impl ChessBoard {
    pub fn starting() -> Self {
        ChessBoard {
            inner: Board::default(),
        }
    }

    pub(crate) fn from_inner(inner: Board) -> Self {
        ChessBoard { inner }
    }

    pub(crate) fn inner(&self) -> &Board {
        &self.inner
    }

    /// Parse a FEN string. Returns the board together with the halfmove
    /// (rule-50) and fullmove counters; both counters default when absent.
    pub fn from_fen(fen: &str) -> Result<(Self, u32, u32), FenError> {
        let fields: Vec<&str> = fen.split_whitespace().collect();
        if fields.len() < 4 {
            return Err(FenError::TooFewFields(fen.to_string()));
        }
        let base = format!(
            "{} {} {} {} 0 1",
            fields[0], fields[1], fields[2], fields[3]
        );
        let inner =
            Board::from_str(&base).map_err(|e| FenError::InvalidBoard(e.to_string()))?;
        let rule50 = match fields.get(4) {
            Some(s) => s
                .parse()
                .map_err(|_| FenError::InvalidCounter(s.to_string()))?,
            None => 0,
        };
        let fullmove = match fields.get(5) {
            Some(s) => s
                .parse()
                .map_err(|_| FenError::InvalidCounter(s.to_string()))?,
            None => 1,
        };
        Ok((ChessBoard { inner }, rule50, fullmove))
    }

    pub fn is_black_to_move(&self) -> bool {
        self.inner.side_to_move() == Color::Black
    }

    /// Legal moves in the tree's frame (rank-mirrored when black to move).
    pub fn legal_moves(&self) -> Vec<Move> {
        let flip = self.is_black_to_move();
        MoveGen::new_legal(&self.inner)
            .map(|m| {
                let m = Move::new(m.get_source(), m.get_dest(), m.get_promotion());
                if flip {
                    m.mirror()
                } else {
                    m
                }
            })
            .collect()
    }

    pub(crate) fn to_absolute(&self, m: Move) -> ChessMove {
        if self.is_black_to_move() {
            m.mirror().inner()
        } else {
            m.inner()
        }
    }

    /// Apply a relative move. Returns `None` if the move is not legal here.
    pub fn make_move(&self, m: Move) -> Option<ChessBoard> {
        let abs = self.to_absolute(m);
        if !self.inner.legal(abs) {
            return None;
        }
        Some(ChessBoard {
            inner: self.inner.make_move_new(abs),
        })
    }

    /// Move identity in the relative frame, treating the two castling
    /// encodings (king-to-castled-square and king-onto-rook) as the same
    /// move. Relative coordinates put the own king's home square on e1
    /// for both colors.
    pub fn is_same_move(&self, a: Move, b: Move) -> bool {
        if a == b {
            return true;
        }
        if a.from_square() != b.from_square() || a.promotion() != b.promotion() {
            return false;
        }
        if a.from_square() != Square::E1 || !self.own_king_on_home_square() {
            return false;
        }
        let kingside = [Square::G1, Square::H1];
        let queenside = [Square::C1, Square::A1];
        (kingside.contains(&a.to_square()) && kingside.contains(&b.to_square()))
            || (queenside.contains(&a.to_square()) && queenside.contains(&b.to_square()))
    }

    /// Normalize a move (possibly in an alias encoding) to the canonical
    /// form produced by `legal_moves`.
    pub fn modern_move(&self, m: Move) -> Move {
        for legal in self.legal_moves() {
            if self.is_same_move(legal, m) {
                return legal;
            }
        }
        m
    }

    fn own_king_on_home_square(&self) -> bool {
        let us = self.inner.side_to_move();
        let home = if us == Color::White {
            Square::E1
        } else {
            Square::E8
        };
        self.inner.piece_on(home) == Some(Piece::King)
            && self.inner.color_on(home) == Some(us)
    }

    // ---- castling rights ----

    pub fn we_can_oo(&self) -> bool {
        self.inner
            .castle_rights(self.inner.side_to_move())
            .has_kingside()
    }

    pub fn we_can_ooo(&self) -> bool {
        self.inner
            .castle_rights(self.inner.side_to_move())
            .has_queenside()
    }

    pub fn they_can_oo(&self) -> bool {
        self.inner
            .castle_rights(!self.inner.side_to_move())
            .has_kingside()
    }

    pub fn they_can_ooo(&self) -> bool {
        self.inner
            .castle_rights(!self.inner.side_to_move())
            .has_queenside()
    }

    /// File of the en-passant capture opportunity, if any.
    pub fn en_passant_file(&self) -> Option<usize> {
        self.inner.en_passant().map(|sq| sq.get_file().to_index())
    }

    pub fn hash(&self) -> u64 {
        self.inner.get_hash()
    }

    /// Occupancy mask of one piece kind for one color, in absolute
    /// coordinates (a1 = bit 0).
    pub fn piece_mask(&self, color: Color, piece: Piece) -> u64 {
        (*self.inner.pieces(piece) & *self.inner.color_combined(color)).0
    }
}

impl std::fmt::Debug for ChessBoard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ChessBoard({})", self.inner)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const START_FEN: &str = "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1";

    fn mv(s: &str) -> Move {
        Move::from_uci(s).unwrap()
    }

    // ---- FEN ----

    #[test]
    fn from_fen_start_position() {
        let (board, rule50, fullmove) = ChessBoard::from_fen(START_FEN).unwrap();
        assert_eq!(board, ChessBoard::starting());
        assert_eq!(rule50, 0);
        assert_eq!(fullmove, 1);
        assert!(!board.is_black_to_move());
    }

    #[test]
    fn from_fen_counters() {
        let fen = "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 37 42";
        let (_, rule50, fullmove) = ChessBoard::from_fen(fen).unwrap();
        assert_eq!(rule50, 37);
        assert_eq!(fullmove, 42);
    }

    #[test]
    fn from_fen_counters_default_when_missing() {
        let fen = "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq -";
        let (_, rule50, fullmove) = ChessBoard::from_fen(fen).unwrap();
        assert_eq!(rule50, 0);
        assert_eq!(fullmove, 1);
    }

    #[test]
    fn from_fen_rejects_garbage() {
        assert!(ChessBoard::from_fen("not a fen").is_err());
        assert!(ChessBoard::from_fen("x/y w - -").is_err());
    }

    // ---- relative move frame ----

    #[test]
    fn white_legal_moves_are_absolute() {
        let board = ChessBoard::starting();
        let moves = board.legal_moves();
        assert_eq!(moves.len(), 20);
        assert!(moves.contains(&mv("e2e4")));
    }

    #[test]
    fn black_legal_moves_are_mirrored() {
        let board = ChessBoard::starting().make_move(mv("e2e4")).unwrap();
        assert!(board.is_black_to_move());
        let moves = board.legal_moves();
        assert_eq!(moves.len(), 20);
        // Black's e7e5 appears in the mirrored frame as e2e4.
        assert!(moves.contains(&mv("e2e4")));
        assert!(!moves.contains(&mv("e7e5")));
    }

    #[test]
    fn make_move_round_trip_through_black_frame() {
        let board = ChessBoard::starting().make_move(mv("e2e4")).unwrap();
        // Relative e2e4 for black is the absolute reply e7e5.
        let board = board.make_move(mv("e2e4")).unwrap();
        assert!(!board.is_black_to_move());
        // Knight out; the absolute position is the open game.
        assert!(board.legal_moves().contains(&mv("g1f3")));
    }

    #[test]
    fn make_move_rejects_illegal() {
        let board = ChessBoard::starting();
        assert!(board.make_move(mv("e2e5")).is_none());
    }

    // ---- castling identity ----

    #[test]
    fn is_same_move_castling_aliases() {
        // White king ready to castle kingside.
        let fen = "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQK2R w KQkq - 0 1";
        let (board, _, _) = ChessBoard::from_fen(fen).unwrap();
        assert!(board.is_same_move(mv("e1g1"), mv("e1h1")));
        assert!(board.is_same_move(mv("e1h1"), mv("e1g1")));
        assert!(!board.is_same_move(mv("e1g1"), mv("e1c1")));
    }

    #[test]
    fn is_same_move_plain_moves() {
        let board = ChessBoard::starting();
        assert!(board.is_same_move(mv("e2e4"), mv("e2e4")));
        assert!(!board.is_same_move(mv("e2e4"), mv("e2e3")));
    }

    #[test]
    fn is_same_move_requires_king_on_home_square() {
        // Queen on e1: e1g1 and e1h1 are distinct queen moves.
        let fen = "4k3/8/8/8/8/8/8/4QK2 w - - 0 1";
        let (board, _, _) = ChessBoard::from_fen(fen).unwrap();
        assert!(!board.is_same_move(mv("e1g1"), mv("e1h1")));
    }

    #[test]
    fn modern_move_normalizes_castling() {
        let fen = "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQK2R w KQkq - 0 1";
        let (board, _, _) = ChessBoard::from_fen(fen).unwrap();
        assert_eq!(board.modern_move(mv("e1h1")), mv("e1g1"));
        // Canonical moves pass through.
        assert_eq!(board.modern_move(mv("e2e4")), mv("e2e4"));
    }

    // ---- accessors ----

    #[test]
    fn castling_rights_track_side_to_move() {
        let fen = "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR b Kq - 0 1";
        let (board, _, _) = ChessBoard::from_fen(fen).unwrap();
        // Black to move: "we" is black.
        assert!(!board.we_can_oo());
        assert!(board.we_can_ooo());
        assert!(board.they_can_oo());
        assert!(!board.they_can_ooo());
    }

    #[test]
    fn en_passant_file_after_double_push() {
        let board = ChessBoard::starting().make_move(mv("e2e4")).unwrap();
        assert_eq!(board.en_passant_file(), Some(4));
        let board = ChessBoard::starting();
        assert_eq!(board.en_passant_file(), None);
    }

    #[test]
    fn hash_differs_between_positions() {
        let a = ChessBoard::starting();
        let b = a.make_move(mv("e2e4")).unwrap();
        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn piece_mask_start_pawns() {
        let board = ChessBoard::starting();
        assert_eq!(board.piece_mask(Color::White, Piece::Pawn), 0xFF00);
        assert_eq!(
            board.piece_mask(Color::Black, Piece::Pawn),
            0x00FF_0000_0000_0000
        );
    }
}
