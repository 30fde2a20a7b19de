use caissa_chess::{
    encode_position_for_nn, FillEmptyHistory, GameResult, PositionHistory, POLICY_SIZE,
};
use thiserror::Error;

use crate::node::Node;

// ---------------------------------------------------------------------------
// Training record extraction
// ---------------------------------------------------------------------------

pub const TRAINING_VERSION: u32 = 5;

/// Classic 112-plane input format.
pub const INPUT_FORMAT_CLASSIC: u32 = 1;

const HISTORY_PLANES: usize = 104;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TrainingDataError {
    /// Zero child visits with more than one legal move means the search
    /// never ran here; the sample must be discarded.
    #[error("search produced no child visits for a multi-move position")]
    NoVisits,
}

/// One self-play training sample. The byte-level chunk format is owned by
/// the writer; this struct carries everything it serializes.
#[derive(Clone, Debug)]
pub struct TrainingRecord {
    pub version: u32,
    pub input_format: u32,
    /// Visit fractions indexed by policy index; illegal moves hold -1.
    pub probabilities: Vec<f32>,
    /// Piece and repetition masks for the eight history steps.
    pub planes: [u64; HISTORY_PLANES],
    pub castling_us_ooo: u8,
    pub castling_us_oo: u8,
    pub castling_them_ooo: u8,
    pub castling_them_oo: u8,
    pub side_to_move: u8,
    pub rule50_count: u8,
    pub invariance_info: u8,
    pub result: i8,
    pub root_q: f32,
    pub best_q: f32,
    pub root_d: f32,
    pub best_d: f32,
    pub root_m: f32,
    pub best_m: f32,
    pub plies_left: f32,
}

impl Node {
    /// Snapshot this node into a training record for the position at the
    /// end of `history`. Probabilities are each child's share of the total
    /// child visits; a sole legal move records probability one even
    /// unvisited (smart pruning can skip it).
    pub fn training_record(
        &self,
        game_result: GameResult,
        history: &PositionHistory,
        fill_empty: FillEmptyHistory,
        best_q: f32,
        best_d: f32,
        best_m: f32,
    ) -> Result<TrainingRecord, TrainingDataError> {
        let total = self.children_visits();
        if total == 0 && self.num_edges() != 1 {
            return Err(TrainingDataError::NoVisits);
        }

        let (planes, transform) = encode_position_for_nn(history, fill_empty);
        let mut history_planes = [0u64; HISTORY_PLANES];
        for (slot, plane) in history_planes.iter_mut().zip(&planes) {
            *slot = plane.mask;
        }

        let mut probabilities = vec![-1.0f32; POLICY_SIZE];
        for child in self.edges() {
            let idx = child.get_move(false).as_nn_index(transform);
            probabilities[idx] = if total > 0 {
                child.n() as f32 / total as f32
            } else {
                1.0
            };
        }

        let position = history.last();
        let board = position.board();
        let black = position.is_black_to_move();
        let result = match game_result {
            GameResult::WhiteWon => {
                if black {
                    -1
                } else {
                    1
                }
            }
            GameResult::BlackWon => {
                if black {
                    1
                } else {
                    -1
                }
            }
            GameResult::Draw => 0,
        };

        Ok(TrainingRecord {
            version: TRAINING_VERSION,
            input_format: INPUT_FORMAT_CLASSIC,
            probabilities,
            planes: history_planes,
            castling_us_ooo: board.we_can_ooo() as u8,
            castling_us_oo: board.we_can_oo() as u8,
            castling_them_ooo: board.they_can_ooo() as u8,
            castling_them_oo: board.they_can_oo() as u8,
            side_to_move: black as u8,
            rule50_count: position.rule50_ply().min(255) as u8,
            invariance_info: transform,
            result,
            root_q: -self.wl() as f32,
            best_q,
            root_d: self.d(),
            best_d,
            root_m: self.m(),
            best_m,
            // Filled in once the whole game has been collected.
            plies_left: 0.0,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
