use std::ptr::NonNull;
use std::sync::Arc;

use caissa_chess::{ChessBoard, FenError, Move, Position, PositionHistory};

use crate::gc::NodeReclaimer;
use crate::node::Node;

// ---------------------------------------------------------------------------
// NodeTree
// ---------------------------------------------------------------------------

/// Owner of the search tree: the game-begin node, the current head the
/// search runs from, and the position history that mirrors the path from
/// game begin to head.
///
/// All methods here are structural and must not race with search workers;
/// they take `&mut self` accordingly. Detached subtrees go to the owned
/// reclaimer instead of being dropped inline.
pub struct NodeTree {
    gamebegin_node: Option<Box<Node>>,
    current_head: Option<NonNull<Node>>,
    history: PositionHistory,
    gc: Arc<NodeReclaimer>,
}

// The raw head pointer targets a node owned by `gamebegin_node`, so the
// tree can migrate between driver threads.
unsafe impl Send for NodeTree {}

impl NodeTree {
    pub fn new() -> Self {
        NodeTree::with_reclaimer(Arc::new(NodeReclaimer::new()))
    }

    /// Share one reclaimer between several trees.
    pub fn with_reclaimer(gc: Arc<NodeReclaimer>) -> Self {
        NodeTree {
            gamebegin_node: None,
            current_head: None,
            history: PositionHistory::new(),
            gc,
        }
    }

    pub fn current_head(&self) -> Option<&Node> {
        self.current_head.map(|p| unsafe { &*p.as_ptr() })
    }

    pub fn current_head_mut(&mut self) -> Option<&mut Node> {
        self.current_head.map(|p| unsafe { &mut *p.as_ptr() })
    }

    pub fn game_begin_node(&self) -> Option<&Node> {
        self.gamebegin_node.as_deref()
    }

    pub fn history(&self) -> &PositionHistory {
        &self.history
    }

    pub fn head_position(&self) -> &Position {
        self.history.last()
    }

    pub fn reclaimer(&self) -> &Arc<NodeReclaimer> {
        &self.gc
    }

    /// Advance the head along `mov` (given in absolute coordinates),
    /// reusing the existing child subtree when there is one.
    ///
    /// Outside analyse mode every sibling subtree is released, so the
    /// played line is the only one that survives. In analyse mode the
    /// head is expanded on demand and siblings are kept for inspection.
    /// A move the tree has never considered gets a node created on the
    /// fly.
    pub fn make_move(&mut self, mut mov: Move, analyse_mode: bool) {
        if self.head_position().is_black_to_move() {
            mov = mov.mirror();
        }
        let board = self.head_position().board().clone();
        let head = unsafe {
            self.current_head
                .expect("make_move before reset_to_position")
                .as_mut()
        };
        if analyse_mode && !head.has_edges() {
            head.create_edges(&board.legal_moves());
        }

        let mut matched = None;
        for edge in head.edges() {
            if board.is_same_move(edge.get_move(false), mov) {
                matched = Some(edge.index());
                break;
            }
        }
        let mut new_head: Option<NonNull<Node>> = None;
        if let Some(idx) = matched {
            let child = head.get_or_spawn_node(idx);
            // Keep the head searchable: terminal adjudications (twofolds,
            // tablebase hits) must not stop analysis of a played line.
            if child.is_terminal() {
                child.make_not_terminal();
            }
            new_head = Some(NonNull::from(child));
        }
        let mov = board.modern_move(mov);
        if !analyse_mode {
            // Releasing can relocate the kept child, so re-derive the
            // pointer from the survivor.
            new_head = head
                .release_children_except_one(matched, &self.gc)
                .map(NonNull::from);
        }
        self.current_head = Some(match new_head {
            Some(p) => p,
            None => NonNull::from(head.create_single_child_node(mov)),
        });
        self.history.append(mov);
    }

    /// Throw away everything under the head and re-initialize it in
    /// place, preserving its link into the surrounding tree.
    pub fn trim_tree_at_head(&mut self) {
        let gc = Arc::clone(&self.gc);
        let head = unsafe {
            self.current_head
                .expect("trim_tree_at_head before reset_to_position")
                .as_mut()
        };
        // The sibling chain belongs to the parent, not to this subtree.
        let sibling = head.take_sibling();
        head.release_children(&gc);
        *head = Node::new(head.parent_ptr(), head.index());
        head.set_sibling(sibling);
    }

    /// Point the tree at the position given by `fen` plus `moves`.
    ///
    /// Returns whether the previous head was encountered along the walk,
    /// meaning its accumulated statistics are still valid. A changed
    /// starting position deallocates the whole tree first; a stale head
    /// outside analyse mode is trimmed.
    pub fn reset_to_position(
        &mut self,
        fen: &str,
        moves: &[Move],
        analyse_mode: bool,
    ) -> Result<bool, FenError> {
        let (starting_board, rule50, fullmoves) = ChessBoard::from_fen(fen)?;
        if self.gamebegin_node.is_some() {
            let start = self.history.starting();
            if start.board() != &starting_board || start.rule50_ply() != rule50 {
                // Completely different game.
                self.deallocate_tree();
            }
        }
        if self.gamebegin_node.is_none() {
            self.gamebegin_node = Some(Node::new_root());
        }

        let game_ply =
            (fullmoves * 2).saturating_sub(if starting_board.is_black_to_move() { 1 } else { 2 });
        self.history.reset(starting_board, rule50, game_ply);

        let old_head = self.current_head;
        self.current_head = self
            .gamebegin_node
            .as_mut()
            .map(|root| NonNull::from(&mut **root));
        let mut seen_old_head = self.current_head == old_head;
        for &mov in moves {
            self.make_move(mov, analyse_mode);
            if self.current_head == old_head {
                seen_old_head = true;
            }
        }

        // If the old head was not on the walk, the new head may carry
        // statistics from a deeper search of a position this one is an
        // ancestor of. Analyse mode keeps the data for inspection anyway.
        if !seen_old_head && !analyse_mode {
            self.trim_tree_at_head();
        }
        Ok(seen_old_head)
    }

    /// Hand the whole tree to the reclaimer.
    pub fn deallocate_tree(&mut self) {
        if let Some(root) = self.gamebegin_node.take() {
            self.gc.enqueue_root(root);
        }
        self.current_head = None;
    }
}

impl Default for NodeTree {
    fn default() -> Self {
        NodeTree::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    const START_FEN: &str = "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1";

    fn mv(s: &str) -> Move {
        Move::from_uci(s).unwrap()
    }

    fn fresh_tree() -> NodeTree {
        let mut tree = NodeTree::new();
        assert!(!tree.reset_to_position(START_FEN, &[], false).unwrap());
        tree
    }

    /// Expand the head with its legal moves and give the first few
    /// children one visit each.
    fn expand_head(tree: &mut NodeTree, visited_children: usize) {
        let legal = tree.head_position().board().legal_moves();
        let head = tree.current_head_mut().unwrap();
        head.create_edges(&legal);
        for i in 0..visited_children {
            let child = head.get_or_spawn_node(i as u16);
            assert!(child.try_start_score_update());
            child.finalize_score_update(0.1, 0.3, 10.0, 1, 1.0, false, false);
        }
    }

    fn wait_drained(tree: &NodeTree) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while tree.reclaimer().pending() > 0 {
            assert!(Instant::now() < deadline, "reclaimer did not drain");
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    // ---- construction ----

    #[test]
    fn reset_builds_root_and_history() {
        let tree = fresh_tree();
        assert!(tree.game_begin_node().is_some());
        assert!(tree.current_head().is_some());
        assert_eq!(tree.history().len(), 1);
        assert!(!tree.head_position().is_black_to_move());
    }

    #[test]
    fn reset_rejects_bad_fen() {
        let mut tree = NodeTree::new();
        assert!(tree.reset_to_position("garbage", &[], false).is_err());
    }

    // ---- make_move ----

    #[test]
    fn make_move_reuses_existing_child() {
        let mut tree = fresh_tree();
        expand_head(&mut tree, 3);
        // Find the index that got a visit and matches e2e4.
        let before_n = {
            let head = tree.current_head().unwrap();
            head.edges()
                .find(|e| e.get_move(false) == mv("e2e4"))
                .map(|e| e.n())
        };
        tree.make_move(mv("e2e4"), false);
        let head = tree.current_head().unwrap();
        // Head is now the child; its stats survived the re-root.
        assert_eq!(Some(head.n()), before_n);
        assert!(tree.head_position().is_black_to_move());
        assert_eq!(tree.history().len(), 2);
    }

    #[test]
    fn make_move_releases_siblings_outside_analyse() {
        let mut tree = fresh_tree();
        expand_head(&mut tree, 5);
        tree.make_move(mv("e2e4"), false);
        let root = tree.game_begin_node().unwrap();
        assert_eq!(root.edges().filter(|e| e.has_node()).count(), 1);
        wait_drained(&tree);
    }

    #[test]
    fn make_move_keeps_siblings_in_analyse() {
        let mut tree = fresh_tree();
        expand_head(&mut tree, 5);
        tree.make_move(mv("e2e4"), true);
        let root = tree.game_begin_node().unwrap();
        assert_eq!(root.num_edges(), 20);
        assert!(root.edges().filter(|e| e.has_node()).count() >= 5);
    }

    #[test]
    fn make_move_expands_head_in_analyse() {
        let mut tree = fresh_tree();
        assert!(!tree.current_head().unwrap().has_edges());
        tree.make_move(mv("e2e4"), true);
        let root = tree.game_begin_node().unwrap();
        assert_eq!(root.num_edges(), 20);
    }

    #[test]
    fn make_move_unseen_move_creates_single_child() {
        let mut tree = fresh_tree();
        tree.make_move(mv("e2e4"), false);
        let root = tree.game_begin_node().unwrap();
        assert_eq!(root.num_edges(), 1);
        let head = tree.current_head().unwrap();
        assert_eq!(head.index(), 0);
        assert!(std::ptr::eq(head.parent().unwrap(), root));
    }

    #[test]
    fn make_move_revives_terminal_child() {
        use crate::node::Terminal;
        use caissa_chess::GameResult;

        let mut tree = fresh_tree();
        expand_head(&mut tree, 1);
        {
            let head = tree.current_head_mut().unwrap();
            let idx = head
                .edges()
                .find(|e| e.get_move(false) == mv("e2e4"))
                .unwrap()
                .index();
            let child = head.get_or_spawn_node(idx);
            child.make_terminal(GameResult::Draw, 0.0, Terminal::TwoFold, false);
        }
        tree.make_move(mv("e2e4"), false);
        assert!(!tree.current_head().unwrap().is_terminal());
    }

    #[test]
    fn make_move_mirrors_for_black() {
        let mut tree = fresh_tree();
        tree.make_move(mv("e2e4"), false);
        // Black replies e7e5 in absolute coordinates.
        tree.make_move(mv("e7e5"), false);
        assert!(!tree.head_position().is_black_to_move());
        assert_eq!(tree.history().len(), 3);
        // The stored edge is in the relative frame.
        let parent = tree.current_head().unwrap().parent().unwrap();
        let edge = parent.edges().next().unwrap();
        assert_eq!(edge.get_move(false), mv("e2e4"));
        assert_eq!(edge.get_move(true), mv("e7e5"));
    }

    // ---- S6: re-root preserves subtree ----

    #[test]
    fn s6_reroot_preserves_played_subtree() {
        let mut tree = fresh_tree();
        expand_head(&mut tree, 4);
        // Two plies under the e2e4 child.
        {
            let head = tree.current_head_mut().unwrap();
            let idx = head
                .edges()
                .find(|e| e.get_move(false) == mv("e2e4"))
                .unwrap()
                .index();
            let child = head.get_or_spawn_node(idx);
            if child.n() == 0 {
                assert!(child.try_start_score_update());
                child.finalize_score_update(0.2, 0.3, 9.0, 1, 1.0, false, false);
            }
            child.create_edges(&[mv("e2e4"), mv("d2d4")]);
            let grandchild = child.get_or_spawn_node(0);
            assert!(grandchild.try_start_score_update());
            grandchild.finalize_score_update(-0.2, 0.3, 8.0, 1, 1.0, false, false);
        }
        tree.make_move(mv("e2e4"), false);
        let head_n = tree.current_head().unwrap().n();
        assert!(head_n > 0);

        let seen = tree
            .reset_to_position(START_FEN, &[mv("e2e4")], false)
            .unwrap();
        assert!(seen, "previous head must be found along the walk");
        assert_eq!(tree.current_head().unwrap().n(), head_n);
        // The grandchild subtree survived both operations.
        assert!(tree.current_head().unwrap().find_child(0).is_some());
        wait_drained(&tree);
    }

    // ---- trim ----

    #[test]
    fn trim_tree_at_head_resets_in_place() {
        let mut tree = fresh_tree();
        tree.make_move(mv("e2e4"), false);
        expand_head(&mut tree, 2);
        {
            let head = tree.current_head_mut().unwrap();
            assert!(head.try_start_score_update());
            head.finalize_score_update(0.4, 0.2, 10.0, 1, 1.0, false, false);
        }
        tree.trim_tree_at_head();
        let head = tree.current_head().unwrap();
        assert_eq!(head.n(), 0);
        assert!(!head.has_edges());
        assert_eq!(head.index(), 0);
        // Still wired into the tree.
        let root = tree.game_begin_node().unwrap();
        assert!(std::ptr::eq(head.parent().unwrap(), root));
        wait_drained(&tree);
    }

    // ---- reset_to_position ----

    #[test]
    fn reset_same_game_returns_seen() {
        let mut tree = fresh_tree();
        tree.make_move(mv("e2e4"), false);
        let seen = tree
            .reset_to_position(START_FEN, &[mv("e2e4")], false)
            .unwrap();
        assert!(seen);
    }

    #[test]
    fn reset_to_ancestor_trims_stale_head() {
        let mut tree = fresh_tree();
        tree.make_move(mv("e2e4"), false);
        {
            let head = tree.current_head_mut().unwrap();
            assert!(head.try_start_score_update());
            head.finalize_score_update(0.4, 0.2, 10.0, 1, 1.0, false, false);
        }
        // Going back to the start: head was not seen, data is stale.
        let seen = tree.reset_to_position(START_FEN, &[], false).unwrap();
        assert!(!seen);
        assert_eq!(tree.current_head().unwrap().n(), 0);
        assert!(!tree.current_head().unwrap().has_edges());
    }

    #[test]
    fn reset_to_ancestor_in_analyse_keeps_tree() {
        let mut tree = fresh_tree();
        tree.make_move(mv("e2e4"), true);
        let seen = tree.reset_to_position(START_FEN, &[], true).unwrap();
        assert!(!seen);
        // Analyse mode preserves the head's subtree for inspection.
        assert!(tree.current_head().unwrap().has_edges());
    }

    #[test]
    fn reset_different_start_deallocates() {
        let mut tree = fresh_tree();
        tree.make_move(mv("e2e4"), false);
        let other = "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 3 1";
        let seen = tree.reset_to_position(other, &[], false).unwrap();
        assert!(!seen);
        assert_eq!(tree.history().starting().rule50_ply(), 3);
        wait_drained(&tree);
    }

    #[test]
    fn deallocate_tree_clears_everything() {
        let mut tree = fresh_tree();
        expand_head(&mut tree, 3);
        tree.deallocate_tree();
        assert!(tree.game_begin_node().is_none());
        assert!(tree.current_head().is_none());
        wait_drained(&tree);
    }

    #[test]
    fn black_to_move_fen_game_ply() {
        let fen = "rnbqkbnr/pppppppp/8/8/4P3/8/PPPP1PPP/RNBQKBNR b KQkq - 0 3";
        let mut tree = NodeTree::new();
        tree.reset_to_position(fen, &[], false).unwrap();
        assert_eq!(tree.head_position().game_ply(), 5);
        assert!(tree.head_position().is_black_to_move());
    }
}
