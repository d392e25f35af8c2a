//! Bounded cache of open native dataset handles.
//!
//! Handles are borrowed through [DatasetHandle], which pins the entry until it is dropped.
//! When the cache is full, the least recently used unpinned entry is closed to make room;
//! if every entry is pinned the cache grows instead.

use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;

use crate::container::{Container, NativeId};

/// Default number of distinct datasets kept open.
pub const DEFAULT_CAPACITY: usize = 48;

#[derive(Debug)]
struct Entry {
    id: NativeId,
    refcount: usize,
}

#[derive(Debug)]
struct CacheState {
    entries: LruCache<String, Entry>,
    transfer: Option<NativeId>,
    closed: bool,
}

#[derive(Debug)]
pub struct HandleCache<C: Container> {
    container: Arc<C>,
    capacity: usize,
    state: Mutex<CacheState>,
}

impl<C: Container> HandleCache<C> {
    /// Create a cache, allocating the shared transfer property list.
    pub fn new(container: Arc<C>, capacity: usize) -> crate::Result<Self> {
        let transfer = container.create_transfer_properties()?;
        Ok(Self {
            container,
            capacity: capacity.max(1),
            state: Mutex::new(CacheState {
                entries: LruCache::unbounded(),
                transfer: Some(transfer),
                closed: false,
            }),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of cached datasets.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of live borrows of a cached dataset.
    pub fn refcount(&self, path: &str) -> Option<usize> {
        self.state.lock().entries.peek(path).map(|e| e.refcount)
    }

    /// Borrow an open handle to the dataset at `path`, opening it if needed.
    pub fn acquire(&self, path: &str) -> crate::Result<DatasetHandle<'_, C>> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(crate::Error::Closed);
        }
        let transfer = state.transfer.ok_or(crate::Error::Closed)?;

        if let Some(entry) = state.entries.get_mut(path) {
            entry.refcount += 1;
            return Ok(DatasetHandle {
                cache: self,
                path: path.to_string(),
                id: entry.id,
                transfer,
            });
        }

        if !self.container.is_dataset(path)? {
            return Err(crate::Error::not_found(path));
        }
        if state.entries.len() >= self.capacity {
            self.evict_one(&mut state)?;
        }
        let id = self.container.open_dataset(path)?;
        log::debug!("opened dataset {path} as {id}");
        state
            .entries
            .put(path.to_string(), Entry { id, refcount: 1 });
        Ok(DatasetHandle {
            cache: self,
            path: path.to_string(),
            id,
            transfer,
        })
    }

    fn evict_one(&self, state: &mut CacheState) -> crate::Result<()> {
        let victim = state
            .entries
            .iter()
            .rev()
            .find(|(_, e)| e.refcount == 0)
            .map(|(k, _)| k.clone());
        match victim.and_then(|k| state.entries.pop(&k).map(|e| (k, e))) {
            Some((path, entry)) => {
                log::debug!("evicting dataset {path} ({})", entry.id);
                self.container.close_dataset(entry.id)
            }
            None => {
                log::warn!(
                    "all {} cached datasets are in use; growing past capacity {}",
                    state.entries.len(),
                    self.capacity
                );
                Ok(())
            }
        }
    }

    fn release(&self, path: &str, id: NativeId) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        match state.entries.peek_mut(path) {
            Some(entry) if entry.id == id && entry.refcount > 0 => entry.refcount -= 1,
            _ => log::warn!("released handle {id} for {path} does not match a cached dataset"),
        }
    }

    /// Close and forget the handles of `path` and every dataset below it, borrowed or not.
    pub fn invalidate(&self, path: &str) -> crate::Result<()> {
        let mut state = self.state.lock();
        let prefix = if path.ends_with('/') {
            path.to_string()
        } else {
            format!("{path}/")
        };
        let doomed: Vec<String> = state
            .entries
            .iter()
            .map(|(k, _)| k)
            .filter(|k| k.as_str() == path || k.starts_with(&prefix))
            .cloned()
            .collect();
        for key in doomed {
            if let Some(entry) = state.entries.pop(&key) {
                if entry.refcount > 0 {
                    log::debug!("closing dataset {key} with {} live borrows", entry.refcount);
                }
                log::debug!("closing dataset {key} ({})", entry.id);
                self.container.close_dataset(entry.id)?;
            }
        }
        Ok(())
    }

    /// Close every cached handle and the transfer property list.
    ///
    /// Only the first call does anything. Every handle is closed even if an earlier one fails;
    /// the first failure is returned.
    pub fn shutdown(&self) -> crate::Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Ok(());
        }
        state.closed = true;
        let mut result = Ok(());
        while let Some((path, entry)) = state.entries.pop_lru() {
            log::debug!("closing dataset {path} ({})", entry.id);
            if let Err(e) = self.container.close_dataset(entry.id) {
                result = result.and(Err(e));
            }
        }
        if let Some(transfer) = state.transfer.take() {
            if let Err(e) = self.container.close_transfer_properties(transfer) {
                result = result.and(Err(e));
            }
        }
        result
    }
}

/// A borrowed dataset handle; releases its cache entry when dropped.
#[derive(Debug)]
pub struct DatasetHandle<'a, C: Container> {
    cache: &'a HandleCache<C>,
    path: String,
    id: NativeId,
    transfer: NativeId,
}

impl<C: Container> DatasetHandle<'_, C> {
    pub fn id(&self) -> NativeId {
        self.id
    }

    /// The shared transfer property list.
    pub fn transfer(&self) -> NativeId {
        self.transfer
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl<C: Container> Drop for DatasetHandle<'_, C> {
    fn drop(&mut self) {
        self.cache.release(&self.path, self.id);
    }
}
