use std::cmp::Ordering as CmpOrdering;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

use ahash::RandomState;

struct Node {
    link: [AtomicPtr<Node>; 2],
    hash: u64,
    data: Box<[u8]>,
}

/// Lock-free deduplication of byte strings.
///
/// The unifier is a binary search tree with a composite key: the 64-bit
/// hash of the bytes first, then the bytes themselves in lexicographic
/// order. Colliding hashes are handled by the secondary comparator, so a
/// weak spot in the hash function cannot compromise correctness, only
/// balance.
///
/// Contract:
/// - keys are only ever added; there is no deletion and no rebalancing
/// - new nodes are published as leaves with a single compare-and-swap on a
///   null child pointer
/// - a failed CAS retries from the same insertion point: the grow-only
///   invariant keeps every previously observed path prefix valid
/// - under a well-distributed hash the expected height is O(log n), which
///   is what makes rotations unnecessary
///
/// Nodes are freed only when the unifier itself is dropped, so readers
/// never observe a dangling child pointer.
pub struct Unifier {
    root: AtomicPtr<Node>,
    state: RandomState,
}

unsafe impl Send for Unifier {}
unsafe impl Sync for Unifier {}

impl Default for Unifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Unifier {
    /// Create an empty unifier.
    pub fn new() -> Self {
        Self {
            root: AtomicPtr::new(ptr::null_mut()),
            state: RandomState::new(),
        }
    }

    /// Insert `data` if it has not been seen before.
    ///
    /// Returns `true` exactly once per distinct byte string, for the call
    /// that inserted it; every later call with equal bytes returns `false`.
    /// Safe to call concurrently from any number of threads.
    pub fn unify(&self, data: &[u8]) -> bool {
        let h = self.state.hash_one(data);
        // defer the copy until an empty insertion point is actually found
        let mut fresh: Option<Box<Node>> = None;
        let mut ip = &self.root;
        loop {
            let q = ip.load(Ordering::Acquire);
            if let Some(node) = unsafe { q.as_ref() } {
                if node.hash == h {
                    match data.cmp(&node.data) {
                        CmpOrdering::Equal => return false,
                        ord => ip = &node.link[(ord == CmpOrdering::Greater) as usize],
                    }
                } else {
                    ip = &node.link[(h > node.hash) as usize];
                }
                continue;
            }
            let boxed = fresh.take().unwrap_or_else(|| {
                Box::new(Node {
                    link: [AtomicPtr::new(ptr::null_mut()), AtomicPtr::new(ptr::null_mut())],
                    hash: h,
                    data: data.to_vec().into_boxed_slice(),
                })
            });
            let raw = Box::into_raw(boxed);
            match ip.compare_exchange(ptr::null_mut(), raw, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return true,
                Err(_) => {
                    // either ip is no longer null or a spurious failure;
                    // the path walked so far is still valid, so retry here
                    fresh = Some(unsafe { Box::from_raw(raw) });
                    std::hint::spin_loop();
                }
            }
        }
    }
}

impl Drop for Unifier {
    fn drop(&mut self) {
        let mut stack = vec![self.root.swap(ptr::null_mut(), Ordering::Relaxed)];
        while let Some(p) = stack.pop() {
            if p.is_null() {
                continue;
            }
            let node = unsafe { Box::from_raw(p) };
            stack.push(node.link[0].load(Ordering::Relaxed));
            stack.push(node.link[1].load(Ordering::Relaxed));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Unifier;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn unify_returns_true_once() {
        let u = Unifier::new();
        assert!(u.unify(b"alpha"));
        assert!(u.unify(b"beta"));
        assert!(!u.unify(b"alpha"));
        assert!(!u.unify(b"beta"));
        assert!(u.unify(b""));
        assert!(!u.unify(b""));
    }

    #[test]
    fn concurrent_inserts_converge_to_set_union() {
        const THREADS: usize = 8;
        const KEYS: usize = 2000;

        let u = Arc::new(Unifier::new());
        let mut handles = Vec::new();
        for t in 0..THREADS {
            let u = Arc::clone(&u);
            handles.push(thread::spawn(move || {
                let mut won = Vec::new();
                // overlapping key ranges: every thread covers a shifted window
                for i in 0..KEYS {
                    let key = format!("key-{}", (i + t * KEYS / 2) % KEYS);
                    if u.unify(key.as_bytes()) {
                        won.push(key);
                    }
                }
                won
            }));
        }

        let mut all: Vec<String> = Vec::new();
        for h in handles {
            all.extend(h.join().unwrap());
        }
        // each key was won by exactly one thread
        let distinct: HashSet<&str> = all.iter().map(String::as_str).collect();
        assert_eq!(distinct.len(), all.len());
        assert_eq!(distinct.len(), KEYS);
        // and the winner claimed it exactly once; re-inserts all lose now
        for i in 0..KEYS {
            assert!(!u.unify(format!("key-{i}").as_bytes()));
        }
    }
}
