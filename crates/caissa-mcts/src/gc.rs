use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use crate::node::Children;

/// How often the worker drains the queue.
const RECLAIM_INTERVAL: Duration = Duration::from_millis(100);

// ---------------------------------------------------------------------------
// NodeReclaimer
// ---------------------------------------------------------------------------

/// Background disposal of detached subtrees.
///
/// Destroying a deep subtree on the search thread causes latency spikes,
/// so re-rooting and trimming push detached child containers onto this
/// queue instead and a worker drops them between passes. The queue mutex
/// is held only to push or pop; the actual teardown happens unlocked.
///
/// One reclaimer can serve any number of trees; share it with `Arc`. Its
/// lifetime must cover every node it may receive, which holds naturally
/// because enqueued subtrees are owned by the queue itself.
pub struct NodeReclaimer {
    inner: Arc<Inner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

struct Inner {
    queue: Mutex<Vec<Children>>,
    stop: AtomicBool,
}

impl NodeReclaimer {
    pub fn new() -> Self {
        let inner = Arc::new(Inner {
            queue: Mutex::new(Vec::new()),
            stop: AtomicBool::new(false),
        });
        let worker_inner = Arc::clone(&inner);
        let worker = thread::Builder::new()
            .name("node-reclaimer".to_string())
            .spawn(move || worker_loop(&worker_inner))
            .expect("failed to spawn reclaimer thread");
        NodeReclaimer {
            inner,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Take ownership of a detached child container for deferred disposal.
    pub(crate) fn enqueue(&self, children: Children) {
        if matches!(children, Children::Linked(None)) {
            return;
        }
        self.inner.queue.lock().push(children);
    }

    /// Take ownership of a whole detached tree.
    pub(crate) fn enqueue_root(&self, root: Box<crate::node::Node>) {
        self.inner.queue.lock().push(Children::Linked(Some(root)));
    }

    /// Subtrees waiting for disposal. Primarily useful for tests and
    /// diagnostics; the count is stale the moment it is read.
    pub fn pending(&self) -> usize {
        self.inner.queue.lock().len()
    }
}

impl Default for NodeReclaimer {
    fn default() -> Self {
        NodeReclaimer::new()
    }
}

impl Drop for NodeReclaimer {
    fn drop(&mut self) {
        self.inner.stop.store(true, Ordering::SeqCst);
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
        // Whatever is still queued is dropped synchronously with `inner`.
    }
}

fn worker_loop(inner: &Inner) {
    debug!("node reclaimer started");
    while !inner.stop.load(Ordering::SeqCst) {
        thread::sleep(RECLAIM_INTERVAL);
        collect(inner);
    }
    debug!("node reclaimer stopped");
}

fn collect(inner: &Inner) {
    while !inner.stop.load(Ordering::SeqCst) {
        // Pop under the lock, drop outside it.
        let subtree = {
            let mut queue = inner.queue.lock();
            match queue.pop() {
                Some(s) => s,
                None => return,
            }
        };
        drop(subtree);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Node;
    use std::time::Instant;

    fn chain(depth: usize) -> Children {
        // Build a parent-child chain of the given depth.
        let mv = caissa_chess::Move::from_uci("e2e4").unwrap();
        let mut root = Node::new_root();
        root.create_edges(std::slice::from_ref(&mv));
        let mut cur = root.get_or_spawn_node(0);
        for _ in 1..depth {
            cur.create_edges(std::slice::from_ref(&mv));
            cur = { cur }.get_or_spawn_node(0);
        }
        Children::Linked(Some(root))
    }

    fn wait_drained(gc: &NodeReclaimer) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while gc.pending() > 0 {
            assert!(Instant::now() < deadline, "reclaimer did not drain in time");
            thread::sleep(Duration::from_millis(20));
        }
    }

    #[test]
    fn drains_enqueued_subtrees() {
        let gc = NodeReclaimer::new();
        gc.enqueue(chain(50));
        gc.enqueue(chain(10));
        assert!(gc.pending() >= 1);
        wait_drained(&gc);
    }

    #[test]
    fn empty_containers_are_not_queued() {
        let gc = NodeReclaimer::new();
        gc.enqueue(Children::Linked(None));
        assert_eq!(gc.pending(), 0);
    }

    #[test]
    fn drop_with_pending_work_is_clean() {
        let gc = NodeReclaimer::new();
        gc.enqueue(chain(100));
        drop(gc);
    }

    #[test]
    fn deep_chain_does_not_overflow_stack() {
        // Exercises the iterative Node teardown.
        let gc = NodeReclaimer::new();
        gc.enqueue(chain(200_000));
        wait_drained(&gc);
    }
}
