//! Chess collaborators for the caissa search core: the side-to-move
//! relative move frame, a board adapter over the `chess` crate, position
//! history with repetition counting, and the neural-net input encoder.

pub mod board;
pub mod encoder;
pub mod moves;
pub mod position;

pub use board::{ChessBoard, FenError};
pub use encoder::{
    encode_position_for_nn, FillEmptyHistory, InputPlane, INPUT_PLANES,
};
pub use moves::{GameResult, Move, MoveParseError, POLICY_SIZE, TRANSFORM_MIRROR};
pub use position::{Position, PositionHistory};
