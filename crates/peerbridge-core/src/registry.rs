//! Concurrent session registry.
//!
//! Maps a [`PeerKey`] to the canonical `Arc` of a session. All mutation goes
//! through [`SessionRegistry::upsert`], which runs the caller's closure under
//! the registry lock so that fetch, decide and store happen atomically.
//!
//! The lock is held only for the closure. Calling back into the same
//! registry from inside the closure is a programming error and panics
//! instead of deadlocking.

use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::ops::ControlFlow;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

/// Namespace for deriving peer keys from identifiers
const PEER_KEY_NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_2a8e_4b7d_5e93_a1c0_3d58_e2f4_9b17);

/// Registry key: UUID v5 of the peer identifier.
///
/// Both roles and both managers derive the same key for one identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerKey(Uuid);

impl PeerKey {
    /// Derive the key for `identifier`
    pub fn from_identifier(identifier: &str) -> Self {
        Self(Uuid::new_v5(&PEER_KEY_NAMESPACE, identifier.as_bytes()))
    }

    /// Underlying UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for PeerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

thread_local! {
    /// Registries whose lock is held by the current thread
    static HELD: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
}

/// Marks a registry as locked on this thread for the guard's lifetime
struct HeldMarker(usize);

impl HeldMarker {
    fn acquire(id: usize) -> Self {
        HELD.with(|held| {
            let mut held = held.borrow_mut();
            if held.contains(&id) {
                drop(held);
                panic!("re-entrant access to session registry from inside upsert");
            }
            held.push(id);
        });
        Self(id)
    }
}

impl Drop for HeldMarker {
    fn drop(&mut self) {
        // try_with: may run during thread teardown
        let _ = HELD.try_with(|held| {
            if let Ok(mut held) = held.try_borrow_mut() {
                held.retain(|id| *id != self.0);
            }
        });
    }
}

/// Thread-safe map from peer key to session
pub struct SessionRegistry<S> {
    entries: Mutex<HashMap<PeerKey, Arc<S>>>,
}

impl<S> Default for SessionRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> SessionRegistry<S> {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn id(&self) -> usize {
        self as *const Self as usize
    }

    fn lock(&self) -> (HeldMarker, MutexGuard<'_, HashMap<PeerKey, Arc<S>>>) {
        let marker = HeldMarker::acquire(self.id());
        let guard = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        (marker, guard)
    }

    /// Atomically replace the entry for `key`.
    ///
    /// `mutate` receives the current session (if any) and returns the session
    /// to store, or `None` to delete the entry. Returns the previous entry.
    ///
    /// # Panics
    /// Panics if `mutate` accesses this registry.
    pub fn upsert<F>(&self, key: PeerKey, mutate: F) -> Option<Arc<S>>
    where
        F: FnOnce(Option<Arc<S>>) -> Option<Arc<S>>,
    {
        let (_marker, mut entries) = self.lock();
        let previous = entries.get(&key).cloned();
        match mutate(previous.clone()) {
            Some(session) => {
                entries.insert(key, session);
            }
            None => {
                entries.remove(&key);
            }
        }
        previous
    }

    /// Current session for `key`
    pub fn get(&self, key: &PeerKey) -> Option<Arc<S>> {
        let (_marker, entries) = self.lock();
        entries.get(key).cloned()
    }

    /// Remove and return the session for `key`
    pub fn remove(&self, key: &PeerKey) -> Option<Arc<S>> {
        let (_marker, mut entries) = self.lock();
        entries.remove(key)
    }

    /// Remove the entry for `key` only if it is still `session`
    pub fn remove_if_same(&self, key: &PeerKey, session: &Arc<S>) -> bool {
        let (_marker, mut entries) = self.lock();
        match entries.get(key) {
            Some(current) if Arc::ptr_eq(current, session) => {
                entries.remove(key);
                true
            }
            _ => false,
        }
    }

    /// Number of sessions
    pub fn len(&self) -> usize {
        let (_marker, entries) = self.lock();
        entries.len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of every entry, taken under the lock
    pub fn snapshot(&self) -> Vec<(PeerKey, Arc<S>)> {
        let (_marker, entries) = self.lock();
        entries.iter().map(|(k, s)| (*k, Arc::clone(s))).collect()
    }

    /// Remove every entry, returning them
    pub fn drain(&self) -> Vec<(PeerKey, Arc<S>)> {
        let (_marker, mut entries) = self.lock();
        entries.drain().collect()
    }

    /// Apply `action` to each entry passing `filter`, over a consistent
    /// snapshot.
    ///
    /// Runs outside the lock, so `action` may use the registry. Stops at the
    /// first `ControlFlow::Break`, whose value is returned.
    pub fn for_each<B, P, A>(&self, mut filter: P, mut action: A) -> Option<B>
    where
        P: FnMut(&PeerKey, &S) -> bool,
        A: FnMut(&PeerKey, &Arc<S>) -> ControlFlow<B>,
    {
        for (key, session) in self.snapshot() {
            if !filter(&key, &session) {
                continue;
            }
            if let ControlFlow::Break(value) = action(&key, &session) {
                return Some(value);
            }
        }
        None
    }

    /// First session matching `predicate`
    pub fn find<P>(&self, mut predicate: P) -> Option<Arc<S>>
    where
        P: FnMut(&S) -> bool,
    {
        self.for_each(
            |_, session| predicate(session),
            |_, session| ControlFlow::Break(Arc::clone(session)),
        )
    }
}

impl<S> fmt::Debug for SessionRegistry<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("SessionRegistry")
            .field("len", &entries.len())
            .finish()
    }
}
