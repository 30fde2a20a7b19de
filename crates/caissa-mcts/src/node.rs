use std::fmt;
use std::mem;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, AtomicU32, AtomicU8, Ordering};

use caissa_chess::{GameResult, Move};
use tracing::debug;

use crate::atomics::{AtomicF32, AtomicF64};
use crate::edge::Edge;
use crate::fastmath::{erf_logistic, fast_exp, fast_pow};
use crate::gc::NodeReclaimer;

// ---------------------------------------------------------------------------
// Terminal state
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Terminal {
    NonTerminal = 0,
    EndOfGame = 1,
    Tablebase = 2,
    TwoFold = 3,
}

impl Terminal {
    fn from_u8(v: u8) -> Terminal {
        match v {
            0 => Terminal::NonTerminal,
            1 => Terminal::EndOfGame,
            2 => Terminal::Tablebase,
            3 => Terminal::TwoFold,
            _ => unreachable!("invalid terminal encoding: {v}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Child container
// ---------------------------------------------------------------------------

/// Physical layout of a node's children. The linked list is cheap while
/// few edges are expanded; `make_solid` converts hot nodes to one
/// contiguous slab with a slot per edge.
pub(crate) enum Children {
    Linked(Option<Box<Node>>),
    Solid(Box<[Node]>),
}

impl Children {
    fn is_empty(&self) -> bool {
        matches!(self, Children::Linked(None))
    }

    fn take(&mut self) -> Children {
        mem::replace(self, Children::Linked(None))
    }
}

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

/// A position reached by one move from its parent.
///
/// Fields split into two groups. The visit-update fields (`n`,
/// `n_in_flight`, the running means, the beta statistics, terminal state
/// and the best-child cache) are atomics and may be touched through `&self`
/// by concurrent workers. Structure (edges, the child container, parent
/// links) is plain data behind `&mut self`; the search driver quiesces
/// workers around structural mutations, and the borrow checker enforces
/// exactly that split.
///
/// Parent back-references are non-owning raw pointers. A parent outlives
/// its children because it owns them through the child container, and every
/// operation that relocates a node repairs the children's back-pointers
/// before the old storage is released.
pub struct Node {
    parent: Option<NonNull<Node>>,
    index: u16,
    num_edges: u16,
    edges: Option<Box<[Edge]>>,
    children: Children,
    sibling: Option<Box<Node>>,

    n: AtomicU32,
    n_in_flight: AtomicU32,
    wl: AtomicF64,
    d: AtomicF32,
    m: AtomicF32,
    visited_policy: AtomicF32,
    q_betamcts: AtomicF32,
    n_betamcts: AtomicF32,
    r_betamcts: AtomicF32,
    terminal_type: AtomicU8,
    lower_bound: AtomicU8,
    upper_bound: AtomicU8,
    best_child_cached: AtomicPtr<Node>,
    best_child_cache_in_flight_limit: AtomicU32,
}

// Raw parent pointers keep Node from deriving these. Sharing is sound
// because all shared-reference mutation goes through atomics and the
// parent-outlives-children invariant holds for every dereference.
unsafe impl Send for Node {}
unsafe impl Sync for Node {}

impl Node {
    pub(crate) fn new(parent: Option<NonNull<Node>>, index: u16) -> Self {
        Node {
            parent,
            index,
            num_edges: 0,
            edges: None,
            children: Children::Linked(None),
            sibling: None,
            n: AtomicU32::new(0),
            n_in_flight: AtomicU32::new(0),
            wl: AtomicF64::new(0.0),
            d: AtomicF32::new(1.0),
            m: AtomicF32::new(0.0),
            visited_policy: AtomicF32::new(0.0),
            q_betamcts: AtomicF32::new(0.0),
            n_betamcts: AtomicF32::new(0.0),
            r_betamcts: AtomicF32::new(1.0),
            terminal_type: AtomicU8::new(Terminal::NonTerminal as u8),
            lower_bound: AtomicU8::new(GameResult::BlackWon.to_i8() as u8),
            upper_bound: AtomicU8::new(GameResult::WhiteWon.to_i8() as u8),
            best_child_cached: AtomicPtr::new(ptr::null_mut()),
            best_child_cache_in_flight_limit: AtomicU32::new(0),
        }
    }

    pub(crate) fn new_root() -> Box<Node> {
        Box::new(Node::new(None, 0))
    }

    // ---- accessors ----

    pub fn n(&self) -> u32 {
        self.n.load(Ordering::SeqCst)
    }

    pub fn n_in_flight(&self) -> u32 {
        self.n_in_flight.load(Ordering::SeqCst)
    }

    pub fn wl(&self) -> f64 {
        self.wl.load()
    }

    pub fn d(&self) -> f32 {
        self.d.load()
    }

    pub fn m(&self) -> f32 {
        self.m.load()
    }

    pub fn visited_policy(&self) -> f32 {
        self.visited_policy.load()
    }

    pub fn q_betamcts(&self) -> f32 {
        self.q_betamcts.load()
    }

    pub fn n_betamcts(&self) -> f32 {
        self.n_betamcts.load()
    }

    pub fn r_betamcts(&self) -> f32 {
        self.r_betamcts.load()
    }

    pub fn set_r_betamcts(&self, r: f32) {
        self.r_betamcts.store(r);
    }

    pub fn index(&self) -> u16 {
        self.index
    }

    pub fn num_edges(&self) -> u16 {
        self.num_edges
    }

    pub fn has_edges(&self) -> bool {
        self.edges.is_some()
    }

    pub fn is_solid(&self) -> bool {
        matches!(self.children, Children::Solid(_))
    }

    pub fn terminal_type(&self) -> Terminal {
        Terminal::from_u8(self.terminal_type.load(Ordering::Relaxed))
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal_type() != Terminal::NonTerminal
    }

    pub fn is_tb_terminal(&self) -> bool {
        self.terminal_type() == Terminal::Tablebase
    }

    pub fn bounds(&self) -> (GameResult, GameResult) {
        (
            GameResult::from_i8(self.lower_bound.load(Ordering::Relaxed) as i8),
            GameResult::from_i8(self.upper_bound.load(Ordering::Relaxed) as i8),
        )
    }

    pub fn set_bounds(&self, lower: GameResult, upper: GameResult) {
        self.lower_bound
            .store(lower.to_i8() as u8, Ordering::Relaxed);
        self.upper_bound
            .store(upper.to_i8() as u8, Ordering::Relaxed);
    }

    pub fn parent(&self) -> Option<&Node> {
        // Sound per the parent-outlives-children invariant.
        self.parent.map(|p| unsafe { &*p.as_ptr() })
    }

    pub(crate) fn parent_ptr(&self) -> Option<NonNull<Node>> {
        self.parent
    }

    pub(crate) fn take_sibling(&mut self) -> Option<Box<Node>> {
        self.sibling.take()
    }

    pub(crate) fn set_sibling(&mut self, sibling: Option<Box<Node>>) {
        self.sibling = sibling;
    }

    /// The parent's edge leading to `node`, which must be a child of self.
    pub fn edge_to_node(&self, node: &Node) -> &Edge {
        debug_assert!(
            node.parent.is_some_and(|p| ptr::eq(p.as_ptr(), self)),
            "edge_to_node called with a non-child"
        );
        debug_assert!(node.index < self.num_edges);
        &self.edges.as_ref().expect("parent node has no edges")[node.index as usize]
    }

    /// The edge in the parent that leads here. `None` at the root.
    pub fn own_edge(&self) -> Option<&Edge> {
        self.parent().map(|p| p.edge_to_node(self))
    }

    /// Sum of completed visits over all children.
    pub fn children_visits(&self) -> u32 {
        self.edges().map(|child| child.n()).sum()
    }

    // ---- expansion ----

    /// Install the edge array for this node. Must not already be expanded.
    pub fn create_edges(&mut self, moves: &[Move]) {
        debug_assert!(self.edges.is_none(), "node already has edges");
        debug_assert!(self.children.is_empty(), "node already has children");
        self.edges = Some(Edge::from_moves(moves));
        self.num_edges = moves.len() as u16;
    }

    /// Expand with a single move and materialize its child. Used when the
    /// game continues with a move the tree has never considered.
    pub fn create_single_child_node(&mut self, mov: Move) -> &mut Node {
        debug_assert!(self.edges.is_none(), "node already has edges");
        debug_assert!(self.children.is_empty(), "node already has children");
        self.edges = Some(Edge::from_moves(&[mov]));
        self.num_edges = 1;
        let this = NonNull::new(self as *mut Node);
        self.children = Children::Linked(Some(Box::new(Node::new(this, 0))));
        match &mut self.children {
            Children::Linked(Some(child)) => &mut **child,
            _ => unreachable!(),
        }
    }

    /// Sort edges by descending prior. Sorting on the raw compressed value
    /// equals sorting on the decoded prior, and is noticeably faster.
    /// Forbidden once any child exists, since children address edges by
    /// index.
    pub fn sort_edges(&mut self) {
        debug_assert!(self.edges.is_some(), "no edges to sort");
        debug_assert!(
            self.children.is_empty(),
            "sorting edges would invalidate child indices"
        );
        if let Some(edges) = &mut self.edges {
            edges.sort_unstable_by(|a, b| b.raw_p().cmp(&a.raw_p()));
        }
    }

    // ---- iteration ----

    /// Iterate over all edges, pairing each with its child node when one
    /// exists. Edge order is preserved in both layouts.
    pub fn edges(&self) -> EdgeIter<'_> {
        EdgeIter {
            parent: self,
            edges: self.edges.as_deref().unwrap_or(&[]),
            idx: 0,
        }
    }

    /// The child at `index`, if it has been materialized. In solid layout
    /// every slot exists.
    pub fn find_child(&self, index: u16) -> Option<&Node> {
        match &self.children {
            Children::Linked(head) => {
                let mut cur = head.as_deref();
                while let Some(node) = cur {
                    if node.index == index {
                        return Some(node);
                    }
                    cur = node.sibling.as_deref();
                }
                None
            }
            Children::Solid(slab) => slab.get(index as usize),
        }
    }

    /// The child at `index`, materializing it in linked layout by pushing
    /// a fresh node at the head of the sibling list.
    pub fn get_or_spawn_node(&mut self, index: u16) -> &mut Node {
        debug_assert!(index < self.num_edges, "spawn index out of range");
        let this = self as *mut Node;
        match &mut self.children {
            Children::Solid(slab) => &mut slab[index as usize],
            Children::Linked(head) => {
                let mut found: Option<*mut Node> = None;
                let mut cur = head.as_deref_mut();
                while let Some(node) = cur {
                    if node.index == index {
                        found = Some(node as *mut Node);
                        break;
                    }
                    cur = node.sibling.as_deref_mut();
                }
                if let Some(p) = found {
                    // The traversal borrows ended at the break above.
                    return unsafe { &mut *p };
                }
                let mut fresh = Box::new(Node::new(NonNull::new(this), index));
                fresh.sibling = head.take();
                *head = Some(fresh);
                match head {
                    Some(child) => &mut **child,
                    None => unreachable!(),
                }
            }
        }
    }

    // ---- visit update protocol ----

    /// Claim a visit. Fails when another worker already claimed the first
    /// visit of this still-unvisited node, so only one worker expands a
    /// leaf. The check-and-increment is a CAS loop and is linearizable per
    /// node.
    pub fn try_start_score_update(&self) -> bool {
        let mut in_flight = self.n_in_flight.load(Ordering::SeqCst);
        loop {
            if self.n.load(Ordering::SeqCst) == 0 && in_flight > 0 {
                return false;
            }
            match self.n_in_flight.compare_exchange_weak(
                in_flight,
                in_flight + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(seen) => in_flight = seen,
            }
        }
    }

    /// Release a claim without recording a result (collision or abandoned
    /// rollout).
    pub fn cancel_score_update(&self, multivisit: u32) {
        self.n_in_flight.fetch_sub(multivisit, Ordering::SeqCst);
        self.best_child_cached
            .store(ptr::null_mut(), Ordering::Relaxed);
    }

    /// Record a finished evaluation of `multivisit` rollouts with value
    /// `v`, draw probability `d` and remaining-plies estimate `m`, plus
    /// `multivisit_eff` effective visits for the beta statistics.
    #[allow(clippy::too_many_arguments)]
    pub fn finalize_score_update(
        &self,
        v: f32,
        d: f32,
        m: f32,
        multivisit: u32,
        multivisit_eff: f32,
        inflate_terminals: bool,
        full_beta_update: bool,
    ) {
        // Proven terminals carry inflated effective mass so their certainty
        // dominates the beta aggregation.
        if self.is_terminal() {
            let add = if inflate_terminals {
                (multivisit * 10) as f32
            } else {
                multivisit as f32
            };
            self.n_betamcts.store(self.n_betamcts.load() + add);
        }

        let n = self.n.load(Ordering::SeqCst);
        let mv = multivisit as f64;
        let wl = self.wl.load();
        self.wl.store(wl + mv * (v as f64 - wl) / (n as f64 + mv));
        let old_d = self.d.load();
        self.d
            .store(old_d + multivisit as f32 * (d - old_d) / (n + multivisit) as f32);
        let old_m = self.m.load();
        self.m
            .store(old_m + multivisit as f32 * (m - old_m) / (n + multivisit) as f32);

        let q = self.q_betamcts.load();
        self.q_betamcts
            .store(q + multivisit_eff * (v - q) / (n as f32 + multivisit_eff));
        self.n_betamcts
            .store(self.n_betamcts.load() + multivisit_eff);

        // First completed visit: tell the parent this edge is now live and
        // seed the beta statistics from the raw evaluation.
        if n == 0 {
            if let Some(parent) = self.parent() {
                parent
                    .visited_policy
                    .fetch_add(parent.edges.as_ref().expect("parent has no edges")
                        [self.index as usize]
                        .get_p());
                self.q_betamcts.store(v);
                self.n_betamcts.store(multivisit as f32);
            }
        }

        self.n.fetch_add(multivisit, Ordering::SeqCst);
        self.n_in_flight.fetch_sub(multivisit, Ordering::SeqCst);

        if full_beta_update && self.edges.is_some() {
            self.recalculate_score_betamcts();
        }
        self.best_child_cached
            .store(ptr::null_mut(), Ordering::Relaxed);
    }

    /// Delta correction applied right after a finalize when a descendant's
    /// terminal proof changed its effective value.
    pub fn adjust_for_terminal(&self, v: f32, d: f32, m: f32, multivisit: u32) {
        let n = self.n.load(Ordering::SeqCst);
        debug_assert!(n > 0, "adjust_for_terminal on an unvisited node");
        self.wl
            .store(self.wl.load() + multivisit as f64 * v as f64 / n as f64);
        self.d
            .store(self.d.load() + multivisit as f32 * d / n as f32);
        self.m
            .store(self.m.load() + multivisit as f32 * m / n as f32);
        self.best_child_cached
            .store(ptr::null_mut(), Ordering::Relaxed);
    }

    /// Back out `multivisit` visits worth of a no-longer-valid terminal
    /// value. Dropping to zero visits resets the node to its first-visit
    /// state and withdraws it from the parent's visited-policy sum.
    pub fn revert_terminal_visits(&self, v: f32, d: f32, m: f32, multivisit: u32) {
        let n_new = self.n.load(Ordering::SeqCst) as i64 - multivisit as i64;
        if n_new <= 0 {
            if let Some(parent) = self.parent() {
                let p = parent.edges.as_ref().expect("parent has no edges")
                    [self.index as usize]
                    .get_p();
                parent.visited_policy.fetch_add(-p);
            }
            self.wl.store(0.0);
            self.d.store(1.0);
            self.m.store(0.0);
            self.n.store(0, Ordering::SeqCst);
            self.n_betamcts.store(0.0);
            self.q_betamcts.store(0.0);
            self.r_betamcts.store(1.0);
        } else {
            let n_new = n_new as f64;
            let wl = self.wl.load();
            self.wl
                .store(wl - multivisit as f64 * (v as f64 - wl) / n_new);
            let old_d = self.d.load();
            self.d
                .store(old_d - multivisit as f32 * (d - old_d) / n_new as f32);
            let old_m = self.m.load();
            self.m
                .store(old_m - multivisit as f32 * (m - old_m) / n_new as f32);
            self.n.fetch_sub(multivisit, Ordering::SeqCst);
            self.recalculate_score_betamcts();
        }
        self.best_child_cached
            .store(ptr::null_mut(), Ordering::Relaxed);
    }

    // ---- terminal management ----

    pub fn make_terminal(
        &self,
        result: GameResult,
        plies_left: f32,
        terminal_type: Terminal,
        inflate_terminals: bool,
    ) {
        if terminal_type != Terminal::TwoFold {
            self.set_bounds(result, result);
        }
        self.terminal_type
            .store(terminal_type as u8, Ordering::Relaxed);
        self.m.store(plies_left);
        match result {
            GameResult::Draw => {
                self.wl.store(0.0);
                self.q_betamcts.store(0.0);
                self.d.store(1.0);
            }
            GameResult::WhiteWon => {
                self.wl.store(1.0);
                self.q_betamcts.store(1.0);
                self.d.store(0.0);
            }
            GameResult::BlackWon => {
                self.wl.store(-1.0);
                self.q_betamcts.store(-1.0);
                self.d.store(0.0);
                // A proven loss has no uncertainty and no claim on further
                // exploration. Clearing the prior removes it from the
                // parent's policy mass.
                if let Some(edge) = self.own_edge() {
                    edge.set_p(0.0);
                }
            }
        }
        if inflate_terminals {
            self.n_betamcts.store(10.0);
            self.set_r_betamcts(0.1);
        }
    }

    /// Undo a terminal marking so search can pass through this node again.
    /// Rolls `wl` and `d` back together from the children, with the node's
    /// current values standing in for its own single visit.
    pub fn make_not_terminal(&mut self) {
        self.terminal_type
            .store(Terminal::NonTerminal as u8, Ordering::Relaxed);
        self.n.store(0, Ordering::SeqCst);

        if self.edges.is_some() {
            let mut n: u32 = 1;
            let mut wl = self.wl.load();
            let mut d = self.d.load();
            for child in self.edges() {
                let cn = child.n();
                if cn > 0 {
                    n += cn;
                    // Flip Q for the opponent.
                    wl += -child.wl(0.0) as f64 * cn as f64;
                    d += child.d(0.0) * cn as f32;
                }
            }
            self.n.store(n, Ordering::SeqCst);
            self.wl.store(wl / n as f64);
            self.d.store(d / n as f32);
        }
    }

    // ---- beta-weighted re-backup ----

    /// Derive every visited child's relevance weight from the standardized
    /// logit gap between the child's Beta posterior and this node's.
    pub fn calculate_relevance_betamcts(&self, trust: f32, prior: f32) {
        let winrate = (1.0 - self.q_betamcts()) / 2.0;
        let visits = self.n_betamcts() * trust + prior;

        let alpha = 1.0 + winrate * visits;
        let beta = 1.0 + (1.0 - winrate) * visits;
        let logit_eval_parent = (alpha / beta).ln();
        let logit_var_parent = 1.0 / alpha + 1.0 / beta;

        for child in self.edges() {
            if child.n() == 0 {
                continue;
            }
            let Some(node) = child.node() else { continue };
            // Child Q values are from the opponent's perspective.
            let winrate_child = (1.0 + node.q_betamcts()) / 2.0;
            let visits_child = child.n_betamcts() * trust + prior;

            if visits == 0.0 && visits_child == 0.0 {
                child.set_r_betamcts(1.0);
            } else {
                let alpha_child = 1.0 + winrate_child * visits_child;
                let beta_child = 1.0 + (1.0 - winrate_child) * visits_child;
                let logit_eval_child = (alpha_child / beta_child).ln();
                let logit_var_child = 1.0 / alpha_child + 1.0 / beta_child;

                let relevance = if winrate_child == 0.0 {
                    0.0
                } else {
                    1.0 + erf_logistic(
                        (logit_eval_child - logit_eval_parent)
                            / (2.0 * (logit_var_child + logit_var_parent)).sqrt(),
                    )
                };
                child.set_r_betamcts(relevance);
            }
        }
    }

    /// Re-derive the beta statistics (and `d`, `m`) from the children,
    /// weighting each child by relevance times effective visits, and fold
    /// the children's terminal bounds. Proven equal decisive bounds
    /// promote this node to terminal with the negated result.
    pub fn recalculate_score_betamcts(&self) {
        let mut q_temp: f64 = 0.0;
        let mut n_temp: f64 = 0.0;
        let mut d_temp: f64 = 0.0;
        let mut m_temp: f64 = 0.0;

        let mut n_vanilla: u32 = 1;

        let mut losing_m: f32 = 0.0;
        let mut winning_m: f32 = 1_000_000.0;
        let mut prefer_tb = false;
        let mut lower = GameResult::BlackWon;
        let mut upper = GameResult::BlackWon;
        for child in self.edges() {
            let (edge_lower, edge_upper) = child.bounds();
            lower = lower.max(edge_lower);
            upper = upper.max(edge_upper);
            let is_tb = child.is_tb_terminal();
            if edge_lower == GameResult::WhiteWon && !is_tb {
                // Track the shortest win.
                winning_m = winning_m.min(child.m(0.0));
            } else if edge_upper == GameResult::BlackWon {
                // Track the longest loss.
                losing_m = losing_m.max(child.m(0.0));
            }
            prefer_tb = prefer_tb || is_tb;

            n_vanilla += child.n();
            let n = child.n_betamcts() as f64;
            let r = child.r_betamcts() as f64;
            if n > 0.0 {
                let visits_eff = r * n;
                n_temp += visits_eff;
                // Flip Q for the opponent.
                q_temp += -child.node().map_or(0.0, |c| c.q_betamcts()) as f64 * visits_eff;
                d_temp += child.d(0.0) as f64 * visits_eff;
                m_temp += child.m(0.0) as f64 * visits_eff;
            }
        }
        m_temp = if n_temp > 0.0 { m_temp / n_temp } else { 0.0 };
        // A direct forced win beats any tablebase line.
        if winning_m < 1000.0 {
            prefer_tb = false;
        }
        if lower == upper && n_vanilla > 1 {
            let terminal_type = if prefer_tb {
                Terminal::Tablebase
            } else {
                Terminal::EndOfGame
            };
            if upper == GameResult::BlackWon {
                self.make_terminal(-upper, losing_m + 1.0, terminal_type, true);
            } else if upper == GameResult::WhiteWon {
                self.make_terminal(-upper, winning_m + 1.0, terminal_type, true);
            }
        } else if n_temp > 0.0 {
            self.q_betamcts.store((q_temp / n_temp) as f32);
            self.n_betamcts.store(n_temp as f32);
            self.d.store((d_temp / n_temp) as f32);
            self.m.store(m_temp as f32 + 1.0);
        }
        // Otherwise every child is a proven loss with zero effective mass
        // and the statistics are left untouched. Known to interact poorly
        // with one-step beta updates.

        // Recorded visits can drift from the children's sum after analyse
        // re-expansion; resync the count and the visited-policy sum.
        let n = self.n.load(Ordering::SeqCst);
        if n_vanilla != n && n > 0 {
            self.n.store(n_vanilla, Ordering::SeqCst);
            let mut visited_policy = 0.0;
            for child in self.edges() {
                if child.n() > 0 {
                    visited_policy += child.p();
                }
            }
            self.visited_policy.store(visited_policy);
        }
    }

    /// Iterate relevance and re-backup until the beta score settles or the
    /// step ceiling is hit. Convergence is not guaranteed, so the ceiling
    /// protects liveness.
    pub fn stabilize_score_betamcts(
        &self,
        trust: f32,
        prior: f32,
        max_steps: u32,
        threshold: f32,
    ) {
        let mut q_init = 10.0f32; // anything outside [-1, 1]
        let mut q_new = self.q_betamcts();
        let mut steps = 0;
        while steps < max_steps && (q_new - q_init).abs() > threshold {
            if steps == 50 {
                debug!(
                    n_eff = self.n_betamcts(),
                    q = self.q_betamcts(),
                    "beta score update slow to converge"
                );
                for child in self.edges() {
                    debug!(
                        q = child.q_betamcts(0.0),
                        n_eff = child.n_betamcts(),
                        r = child.r_betamcts(),
                        "child stats"
                    );
                }
            }
            if steps > 50 {
                debug!(steps, q_old = q_init, q_new, diff = q_new - q_init, "still iterating");
            }
            self.calculate_relevance_betamcts(trust, prior);
            self.recalculate_score_betamcts();
            q_init = q_new;
            q_new = self.q_betamcts();
            steps += 1;
        }
    }

    /// Lower-tail quantile of the logit-normal winrate posterior, used for
    /// move ordering at the root.
    pub fn lcb_betamcts(&self, trust: f32, prior: f32, percentile: f32) -> f32 {
        if percentile >= 1.0 {
            return 1.0;
        }
        if percentile <= 0.0 {
            return -1.0;
        }
        let winrate = (1.0 + self.q_betamcts()) / 2.0;
        let visits = self.n_betamcts() * trust + prior;

        let alpha = 1.0 + winrate * visits;
        let beta = 1.0 + (1.0 - winrate) * visits;
        let logit_var = 1.0 / alpha + 1.0 / beta;

        -1.0 + 2.0 * winrate
            / (winrate
                + (1.0 - winrate)
                    * fast_pow(
                        (1.0 - percentile) / percentile,
                        (2.0 * logit_var).sqrt(),
                    ))
    }

    // ---- RENTS policy ----

    /// Re-derive each edge's stored policy as a blend of an exp(Q/temp)
    /// Boltzmann term and the raw prior, restricted to edges passing the
    /// prior cutoff.
    pub fn set_policies_rents(&self, temp: f32, lambda: f32, cutoff_factor: f32, fpu: f32) {
        debug_assert!(self.num_edges as usize <= 256, "policy buffer too small");
        let mut intermediate = [0.0f32; 256];
        let mut counter = 0usize;
        let mut total = 0.0f32;
        let mut policy_total = 0.0f32;
        let mut policy_threshold = 0.0f32;
        let parent_q = -self.q_betamcts();
        // Edges are sorted by prior, so the first edge normally sets the
        // threshold. A cleared first prior (proven loss) pushes the
        // threshold onto the next edge instead.
        for edge in self.edges() {
            if counter == 0 {
                policy_threshold =
                    cutoff_factor * edge.p() / ((self.n() as f32 + 1.0).sqrt());
            }
            if edge.p() > policy_threshold {
                let val = fast_exp((edge.q_betamcts(fpu) - parent_q) / temp);
                intermediate[counter] = val;
                counter += 1;
                total += val;
                policy_total += edge.p();
            }
        }
        let n_children = counter;
        let mut counter = 0usize;
        let scale = if total > 0.0 { 1.0 / total } else { 1.0 };
        let scale_p = if policy_total > 0.0 {
            1.0 / policy_total
        } else {
            1.0
        };
        let lambda = if policy_total == 0.0 { 0.0 } else { lambda };
        let default_policy = if policy_total == 0.0 && total == 0.0 {
            1.0 / n_children as f32
        } else {
            0.0
        };
        for edge in self.edges() {
            if edge.p() > policy_threshold {
                edge.edge().set_policy(
                    intermediate[counter] * scale * (1.0 - lambda)
                        + edge.p() * scale_p * lambda,
                );
                counter += 1;
            } else {
                edge.edge().set_policy(default_policy);
            }
        }
    }

    // ---- best-child cache ----

    /// Remember the selected child together with the in-flight ceiling at
    /// which the selection stops being valid. Unvisited children are never
    /// cached because their start-update exclusivity makes a stale pointer
    /// unsafe to revisit.
    pub fn update_best_child(&self, best: &EdgeAndNode<'_>, visits_allowed: u32) {
        let ptr = match best.node() {
            Some(node) if node.n() > 0 => node as *const Node as *mut Node,
            _ => ptr::null_mut(),
        };
        self.best_child_cached.store(ptr, Ordering::Relaxed);
        self.best_child_cache_in_flight_limit.store(
            visits_allowed + self.n_in_flight.load(Ordering::SeqCst),
            Ordering::Relaxed,
        );
    }

    /// The cached best child, unless an update invalidated it or in-flight
    /// visits reached the recorded ceiling.
    pub fn cached_best_child(&self) -> Option<&Node> {
        let p = self.best_child_cached.load(Ordering::Relaxed);
        if p.is_null() {
            return None;
        }
        let limit = self.best_child_cache_in_flight_limit.load(Ordering::Relaxed);
        if self.n_in_flight.load(Ordering::SeqCst) >= limit {
            return None;
        }
        Some(unsafe { &*p })
    }

    // ---- structure maintenance ----

    /// Repair the children's parent back-pointers after this node moved.
    pub fn update_children_parents(&mut self) {
        let this = NonNull::new(self as *mut Node);
        match &mut self.children {
            Children::Linked(head) => {
                let mut cur = head.as_deref_mut();
                while let Some(node) = cur {
                    node.parent = this;
                    cur = node.sibling.as_deref_mut();
                }
            }
            Children::Solid(slab) => {
                for node in slab.iter_mut() {
                    node.parent = this;
                }
            }
        }
    }

    /// Convert the linked child list into a contiguous slab with one slot
    /// per edge. Fails (leaving the node untouched) while any immediate
    /// leaf or terminal child has in-flight visits, or while collision
    /// visits that bypass child counters are outstanding.
    pub fn make_solid(&mut self) -> bool {
        if self.is_solid() || self.num_edges == 0 || self.is_terminal() {
            return false;
        }
        {
            let Children::Linked(head) = &self.children else {
                unreachable!()
            };
            let mut total_in_flight: u32 = 0;
            let mut cur = head.as_deref();
            while let Some(child) = cur {
                // The search holds references to leaf nodes across locks.
                if child.n() <= 1 && child.n_in_flight() > 0 {
                    return false;
                }
                if child.is_terminal() && child.n_in_flight() > 0 {
                    return false;
                }
                total_in_flight += child.n_in_flight();
                cur = child.sibling.as_deref();
            }
            // A mismatch means collisions against immediate children are in
            // flight; those do not touch the child counters and would be
            // orphaned by the relocation.
            if total_in_flight != self.n_in_flight() {
                return false;
            }
        }
        let this = NonNull::new(self as *mut Node);
        let mut slab: Box<[Node]> = (0..self.num_edges)
            .map(|i| Node::new(this, i))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let Children::Linked(mut head) = self.children.take() else {
            unreachable!()
        };
        while let Some(mut child) = head.take() {
            head = child.sibling.take();
            let idx = child.index as usize;
            slab[idx] = *child;
        }
        // Grandchildren still point at the old heap nodes; repair them now
        // that every child sits in its final slot.
        for node in slab.iter_mut() {
            node.update_children_parents();
        }
        self.children = Children::Solid(slab);
        self.best_child_cached
            .store(ptr::null_mut(), Ordering::Relaxed);
        true
    }

    /// Detach all children onto the reclaimer queue.
    pub fn release_children(&mut self, gc: &NodeReclaimer) {
        self.best_child_cached
            .store(ptr::null_mut(), Ordering::Relaxed);
        gc.enqueue(self.children.take());
    }

    /// Detach all children except the one at `keep`, which becomes the
    /// sole (linked) child. `None`, or an index with no materialized
    /// child, releases everything and clears the edges. Returns the
    /// surviving child.
    pub fn release_children_except_one(
        &mut self,
        keep: Option<u16>,
        gc: &NodeReclaimer,
    ) -> Option<&mut Node> {
        self.best_child_cached
            .store(ptr::null_mut(), Ordering::Relaxed);
        let this = NonNull::new(self as *mut Node);
        match self.children.take() {
            Children::Solid(mut slab) => {
                let saved = keep.map(|idx| {
                    let node =
                        mem::replace(&mut slab[idx as usize], Node::new(this, idx));
                    let mut boxed = Box::new(node);
                    boxed.update_children_parents();
                    boxed
                });
                gc.enqueue(Children::Solid(slab));
                self.children = Children::Linked(saved);
            }
            Children::Linked(mut head) => {
                let mut saved: Option<Box<Node>> = None;
                if let Some(idx) = keep {
                    // Locate the kept child, then split the chain around it.
                    let mut pos = None;
                    let mut i = 0usize;
                    let mut cur = head.as_deref();
                    while let Some(node) = cur {
                        if node.index == idx {
                            pos = Some(i);
                            break;
                        }
                        i += 1;
                        cur = node.sibling.as_deref();
                    }
                    if let Some(pos) = pos {
                        let mut slot = &mut head;
                        for _ in 0..pos {
                            slot = &mut slot.as_mut().expect("chain shorter than scanned").sibling;
                        }
                        let mut node = slot.take().expect("chain shorter than scanned");
                        gc.enqueue(Children::Linked(node.sibling.take()));
                        saved = Some(node);
                    }
                }
                gc.enqueue(Children::Linked(head));
                self.children = Children::Linked(saved);
            }
        }
        if self.children.is_empty() {
            self.num_edges = 0;
            self.edges = None;
            return None;
        }
        match &mut self.children {
            Children::Linked(Some(child)) => Some(&mut **child),
            _ => unreachable!(),
        }
    }
}

// Teardown is iterative: a detached subtree can be thousands of plies deep
// and naive recursive drops of the child and sibling chains would overflow
// the stack.
impl Drop for Node {
    fn drop(&mut self) {
        if self.children.is_empty() && self.sibling.is_none() {
            return;
        }
        let mut stack: Vec<Children> = Vec::new();
        push_nonempty(&mut stack, self.children.take());
        push_chain(&mut stack, self.sibling.take());
        while let Some(item) = stack.pop() {
            match item {
                Children::Linked(mut head) => {
                    while let Some(mut node) = head {
                        push_nonempty(&mut stack, node.children.take());
                        head = node.sibling.take();
                        // `node` drops here with nothing left to cascade.
                    }
                }
                Children::Solid(mut slab) => {
                    for node in slab.iter_mut() {
                        push_nonempty(&mut stack, node.children.take());
                        push_chain(&mut stack, node.sibling.take());
                    }
                }
            }
        }
    }
}

fn push_nonempty(stack: &mut Vec<Children>, children: Children) {
    if !children.is_empty() {
        stack.push(children);
    }
}

fn push_chain(stack: &mut Vec<Children>, chain: Option<Box<Node>>) {
    if chain.is_some() {
        stack.push(Children::Linked(chain));
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (lower, upper) = self.bounds();
        write!(
            f,
            "Node {{ term: {:?}, index: {}, edges: {}, n: {}, n_in_flight: {}, \
             wl: {:.4}, d: {:.4}, m: {:.1}, bounds: ({:?}, {:?}), solid: {} }}",
            self.terminal_type(),
            self.index,
            self.num_edges,
            self.n(),
            self.n_in_flight(),
            self.wl(),
            self.d(),
            self.m(),
            lower,
            upper,
            self.is_solid(),
        )
    }
}

// ---------------------------------------------------------------------------
// EdgeAndNode + iterator
// ---------------------------------------------------------------------------

/// Cursor over one (edge, optional child) pair with fused accessors that
/// fall back to defaults while the child is unexpanded.
#[derive(Clone, Copy)]
pub struct EdgeAndNode<'a> {
    edge: &'a Edge,
    node: Option<&'a Node>,
    index: u16,
}

impl<'a> EdgeAndNode<'a> {
    pub fn edge(&self) -> &'a Edge {
        self.edge
    }

    pub fn node(&self) -> Option<&'a Node> {
        self.node
    }

    pub fn has_node(&self) -> bool {
        self.node.is_some()
    }

    pub fn index(&self) -> u16 {
        self.index
    }

    pub fn get_move(&self, as_opponent: bool) -> Move {
        self.edge.get_move(as_opponent)
    }

    pub fn p(&self) -> f32 {
        self.edge.get_p()
    }

    pub fn n(&self) -> u32 {
        self.node.map_or(0, Node::n)
    }

    pub fn n_in_flight(&self) -> u32 {
        self.node.map_or(0, Node::n_in_flight)
    }

    pub fn wl(&self, default: f32) -> f32 {
        self.node.map_or(default, |n| n.wl() as f32)
    }

    pub fn d(&self, default: f32) -> f32 {
        self.node.map_or(default, Node::d)
    }

    pub fn m(&self, default: f32) -> f32 {
        self.node.map_or(default, Node::m)
    }

    /// The child's beta score from this node's perspective (sign flipped),
    /// or `default` while unvisited.
    pub fn q_betamcts(&self, default: f32) -> f32 {
        match self.node {
            Some(node) if node.n() > 0 => -node.q_betamcts(),
            _ => default,
        }
    }

    pub fn n_betamcts(&self) -> f32 {
        self.node.map_or(0.0, Node::n_betamcts)
    }

    pub fn r_betamcts(&self) -> f32 {
        self.node.map_or(1.0, Node::r_betamcts)
    }

    pub fn set_r_betamcts(&self, r: f32) {
        if let Some(node) = self.node {
            node.set_r_betamcts(r);
        }
    }

    /// Terminal bounds, or the full unproven range for an unexpanded edge.
    pub fn bounds(&self) -> (GameResult, GameResult) {
        self.node
            .map_or((GameResult::BlackWon, GameResult::WhiteWon), Node::bounds)
    }

    pub fn is_terminal(&self) -> bool {
        self.node.is_some_and(Node::is_terminal)
    }

    pub fn is_tb_terminal(&self) -> bool {
        self.node.is_some_and(Node::is_tb_terminal)
    }
}

impl fmt::Debug for EdgeAndNode<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.node {
            Some(node) => write!(f, "{:?} -> {:?}", self.edge, node),
            None => write!(f, "{:?} -> (no node)", self.edge),
        }
    }
}

/// Iterator over a node's edges in edge order, uniform across both child
/// layouts.
pub struct EdgeIter<'a> {
    parent: &'a Node,
    edges: &'a [Edge],
    idx: u16,
}

impl<'a> Iterator for EdgeIter<'a> {
    type Item = EdgeAndNode<'a>;

    fn next(&mut self) -> Option<EdgeAndNode<'a>> {
        let edge = self.edges.get(self.idx as usize)?;
        let index = self.idx;
        self.idx += 1;
        Some(EdgeAndNode {
            edge,
            node: self.parent.find_child(index),
            index,
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.edges.len() - self.idx as usize;
        (left, Some(left))
    }
}

impl ExactSizeIterator for EdgeIter<'_> {}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
