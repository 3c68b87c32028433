//! The Resource Pool (§4.1): a FIFO set of deferred releases owned by one
//! execution context. Scripts routinely leak native-side handles — sockets,
//! file descriptors, HTTP response bodies — that a script-language garbage
//! collector has no visibility into. Every I/O factory that hands such a
//! handle to a script also inserts a release function here, so that tearing
//! down the owning execution context guarantees the handle is released
//! exactly once, even if the script never called `close`.

use futures::future::BoxFuture;
use mesh_common::MeshResult;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex;

pub type ReleaseFn = Box<dyn FnOnce() -> BoxFuture<'static, MeshResult<()>> + Send>;

struct Link {
    prev: Option<u64>,
    next: Option<u64>,
    entry: Arc<ResourceEntry>,
}

struct Inner {
    links: HashMap<u64, Link>,
    head: Option<u64>,
    tail: Option<u64>,
    closed: bool,
}

struct ResourceEntry {
    id: u64,
    name: String,
    released: AtomicBool,
    release_fn: StdMutex<Option<ReleaseFn>>,
}

/// A handle to one entry in a [`ResourcePool`]. Cheap to clone; every clone
/// refers to the same underlying release function.
#[derive(Clone)]
pub struct Resource {
    entry: Arc<ResourceEntry>,
    pool: Arc<Mutex<Inner>>,
}

impl Resource {
    pub fn name(&self) -> &str {
        &self.entry.name
    }

    /// Splices this resource out of its pool without invoking `release_fn`.
    /// Used by a factory's `close` wrapper once the caller has released the
    /// handle itself, so the pool doesn't double-release it at teardown.
    pub async fn cancel(&self) {
        let mut inner = self.pool.lock().await;
        unlink(&mut inner, self.entry.id);
    }

    /// Idempotent: invokes `release_fn` exactly once. Does not unlink the
    /// entry from the pool (a released-but-still-linked entry is a correct,
    /// inert state — `Close` skips it because `released` is already set).
    pub async fn release(&self) -> MeshResult<()> {
        if self.entry.released.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let release_fn = {
            let mut slot = self.entry.release_fn.lock().unwrap();
            slot.take()
        };
        match release_fn {
            Some(f) => f().await,
            None => Ok(()),
        }
    }

    pub fn is_released(&self) -> bool {
        self.entry.released.load(Ordering::Acquire)
    }
}

fn unlink(inner: &mut Inner, id: u64) {
    let Some(link) = inner.links.remove(&id) else {
        return;
    };
    match link.prev {
        Some(prev) => inner.links.get_mut(&prev).unwrap().next = link.next,
        None => inner.head = link.next,
    }
    match link.next {
        Some(next) => inner.links.get_mut(&next).unwrap().prev = link.prev,
        None => inner.tail = link.prev,
    }
}

/// A doubly-linked FIFO set of resources. All mutating operations are
/// serialised through a single-slot mutex, matching the "single-slot
/// exclusion channel" arbitration called for by §4.1.
pub struct ResourcePool {
    inner: Arc<Mutex<Inner>>,
    next_id: AtomicU64,
}

impl Default for ResourcePool {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourcePool {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                links: HashMap::new(),
                head: None,
                tail: None,
                closed: false,
            })),
            next_id: AtomicU64::new(1),
        }
    }

    /// Inserts a new resource at the tail and stamps it with a pool-scoped
    /// id. Returns the handle the caller should hand back to the script's
    /// `close` method.
    pub async fn insert(&self, name: impl Into<String>, release_fn: ReleaseFn) -> Resource {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let entry = Arc::new(ResourceEntry {
            id,
            name: name.into(),
            released: AtomicBool::new(false),
            release_fn: StdMutex::new(Some(release_fn)),
        });

        let mut inner = self.inner.lock().await;
        if inner.closed {
            // The pool already tore down; the caller still gets a handle,
            // but it starts pre-released so a later `release()` is a no-op.
            entry.released.store(true, Ordering::Release);
            drop(inner);
            return Resource {
                entry,
                pool: self.inner.clone(),
            };
        }

        let prev_tail = inner.tail;
        inner.links.insert(
            id,
            Link {
                prev: prev_tail,
                next: None,
                entry: entry.clone(),
            },
        );
        match prev_tail {
            Some(tail) => inner.links.get_mut(&tail).unwrap().next = Some(id),
            None => inner.head = Some(id),
        }
        inner.tail = Some(id);

        Resource {
            entry,
            pool: self.inner.clone(),
        }
    }

    /// Releases every still-linked resource, in FIFO order, and marks the
    /// pool closed. Subsequent `insert` calls return pre-released handles;
    /// subsequent `close` calls are no-ops.
    pub async fn close(&self) {
        let drained: Vec<Arc<ResourceEntry>> = {
            let mut inner = self.inner.lock().await;
            if inner.closed {
                return;
            }
            inner.closed = true;
            let mut ids = Vec::new();
            let mut cursor = inner.head;
            while let Some(id) = cursor {
                cursor = inner.links.get(&id).unwrap().next;
                ids.push(id);
            }
            let drained = ids
                .iter()
                .map(|id| inner.links.get(id).unwrap().entry.clone())
                .collect();
            inner.links.clear();
            inner.head = None;
            inner.tail = None;
            drained
        };

        for entry in drained {
            if entry.released.swap(true, Ordering::AcqRel) {
                continue;
            }
            let release_fn = entry.release_fn.lock().unwrap().take();
            if let Some(f) = release_fn {
                if let Err(err) = f().await {
                    tracing::warn!(resource = %entry.name, error = %err, "resource release failed during pool close");
                }
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.links.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn release_counter(counter: Arc<AtomicUsize>) -> ReleaseFn {
        Box::new(move || {
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        })
    }

    #[tokio::test]
    async fn close_releases_every_still_linked_resource_exactly_once() {
        let pool = ResourcePool::new();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            pool.insert("handle", release_counter(counter.clone())).await;
        }
        pool.close().await;
        assert_eq!(counter.load(Ordering::SeqCst), 5);
        assert_eq!(pool.len().await, 0);
    }

    #[tokio::test]
    async fn cancel_then_close_never_invokes_release() {
        let pool = ResourcePool::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let r = pool.insert("handle", release_counter(counter.clone())).await;
        r.cancel().await;
        pool.close().await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let pool = ResourcePool::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let r = pool.insert("handle", release_counter(counter.clone())).await;
        r.release().await.unwrap();
        r.release().await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        // Close afterwards must not double-release.
        pool.close().await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
