use crate::board::ChessBoard;
use crate::moves::Move;

// ---------------------------------------------------------------------------
// Position
// ---------------------------------------------------------------------------

/// One reached position: board plus the counters the tree and the encoder
/// care about.
#[derive(Clone, Debug)]
pub struct Position {
    board: ChessBoard,
    rule50_ply: u32,
    game_ply: u32,
    repetitions: u32,
}

impl Position {
    fn new(board: ChessBoard, rule50_ply: u32, game_ply: u32) -> Self {
        Position {
            board,
            rule50_ply,
            game_ply,
            repetitions: 0,
        }
    }

    pub fn board(&self) -> &ChessBoard {
        &self.board
    }

    pub fn is_black_to_move(&self) -> bool {
        self.board.is_black_to_move()
    }

    pub fn rule50_ply(&self) -> u32 {
        self.rule50_ply
    }

    pub fn game_ply(&self) -> u32 {
        self.game_ply
    }

    /// How many earlier positions in the reversible window were identical.
    pub fn repetitions(&self) -> u32 {
        self.repetitions
    }
}

// ---------------------------------------------------------------------------
// PositionHistory
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Default)]
pub struct PositionHistory {
    positions: Vec<Position>,
}

impl PositionHistory {
    pub fn new() -> Self {
        PositionHistory::default()
    }

    pub fn reset(&mut self, board: ChessBoard, rule50_ply: u32, game_ply: u32) {
        self.positions.clear();
        self.positions
            .push(Position::new(board, rule50_ply, game_ply));
    }

    /// Apply a relative move to the last position and push the result.
    /// The move must be legal; feeding an illegal move is a programmer
    /// error.
    pub fn append(&mut self, m: Move) {
        let last = self.last();
        let next_board = match last.board().make_move(m) {
            Some(b) => b,
            None => panic!("illegal move {m} appended to history"),
        };
        let abs = last.board().to_absolute(m);
        let inner = last.board().inner();
        let is_pawn = inner.piece_on(abs.get_source()) == Some(chess::Piece::Pawn);
        let dest_bit = 1u64 << abs.get_dest().to_index();
        let is_capture = inner.combined().0 & dest_bit != 0
            || (is_pawn && abs.get_source().get_file() != abs.get_dest().get_file());
        let rule50_ply = if is_pawn || is_capture {
            0
        } else {
            last.rule50_ply() + 1
        };
        let game_ply = last.game_ply() + 1;
        let mut pos = Position::new(next_board, rule50_ply, game_ply);
        pos.repetitions = self.count_repetitions(&pos);
        self.positions.push(pos);
    }

    fn count_repetitions(&self, pos: &Position) -> u32 {
        let hash = pos.board().hash();
        self.positions
            .iter()
            .rev()
            .take(pos.rule50_ply() as usize)
            .filter(|p| p.board().hash() == hash)
            .count() as u32
    }

    pub fn starting(&self) -> &Position {
        self.positions.first().expect("position history is empty")
    }

    pub fn last(&self) -> &Position {
        self.positions.last().expect("position history is empty")
    }

    pub fn positions(&self) -> &[Position] {
        &self.positions
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
