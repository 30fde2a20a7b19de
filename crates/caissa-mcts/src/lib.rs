//! The in-memory search tree of a chess MCTS engine.
//!
//! The tree stays consistent under concurrent selection, expansion, and
//! backup by many workers: the visit protocol
//! ([`Node::try_start_score_update`] / [`Node::cancel_score_update`] /
//! [`Node::finalize_score_update`]) runs on shared references over atomic
//! fields, while structural mutation (expansion, solidification,
//! re-rooting, trimming) requires exclusive access and is the search
//! driver's responsibility to serialize. Detached subtrees are disposed
//! of asynchronously by [`NodeReclaimer`].
//!
//! On top of the vanilla visit counts the tree keeps beta-weighted
//! statistics: a per-child relevance factor derived from a Beta posterior
//! on winrate re-weights each child's contribution during re-backup, and
//! feeds the RENTS policy blend and the LCB used for move ordering.

pub mod edge;
pub mod fastmath;
pub mod gc;
pub mod node;
pub mod params;
pub mod training;
pub mod tree;

mod atomics;

pub use edge::Edge;
pub use gc::NodeReclaimer;
pub use node::{EdgeAndNode, EdgeIter, Node, Terminal};
pub use params::Params;
pub use training::{
    TrainingDataError, TrainingRecord, INPUT_FORMAT_CLASSIC, TRAINING_VERSION,
};
pub use tree::NodeTree;
