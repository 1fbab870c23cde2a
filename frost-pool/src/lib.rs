//! Reference counted storage pool.
//!
//! Every live buffer is a slot with a reference count and a caller supplied metadata
//! value. Releasing the last reference parks the storage in a free list keyed by its
//! exact length, so the next allocation of the same size reuses it instead of going
//! back to the system allocator. Handles carry a generation, so a handle that outlived
//! its buffer is detected rather than silently aliasing whatever reuses the slot.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

/// Shared word storage of one buffer.
pub type Storage = Arc<RwLock<Vec<u32>>>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("buffer {0:?} released while its reference count is already zero")]
    DoubleFree(Handle),
    #[error("buffer {0:?} used after its last reference was released")]
    UseAfterRelease(Handle),
}

/// Opaque buffer handle, cheap to copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle {
    slot: u32,
    gen: u32,
}

impl Handle {
    // slot number, stable while the buffer is alive
    pub fn index(&self) -> usize { self.slot as usize }
}

struct Slot<M> {
    // bumped whenever the slot is vacated
    gen: u32,
    refs: usize,
    meta: Option<M>,
    data: Option<Storage>,
}

struct State<M> {
    slots: Vec<Slot<M>>,
    // vacated slot numbers
    vacant: Vec<u32>,
    // recycled storage by exact word count
    free: BTreeMap<usize, Vec<Vec<u32>>>,
    live_words: usize,
    pooled_words: usize,
}

/// Pool statistics in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Usage {
    pub live: usize,
    pub pooled: usize,
    pub buffers: usize,
}

pub struct Pool<M> {
    state: Mutex<State<M>>,
}

impl<M: Clone> Default for Pool<M> {
    fn default() -> Self { Self::new() }
}

impl<M: Clone> Pool<M> {
    pub fn new() -> Self {
        Pool { state: Mutex::new(State {
            slots: vec![], vacant: vec![], free: BTreeMap::new(),
            live_words: 0, pooled_words: 0,
        }) }
    }

    fn lock(&self) -> MutexGuard<'_, State<M>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate a zeroed buffer of `words` words with reference count one.
    pub fn allocate(&self, words: usize, meta: M) -> Handle {
        let mut state = self.lock();
        let recycled = state.free.get_mut(&words).and_then(|list| list.pop());
        let data = match recycled {
            Some(mut recycled) => {
                state.pooled_words -= words;
                recycled.iter_mut().for_each(|w| *w = 0);
                log::trace!("pool: reusing {words} words");
                recycled
            }
            None => vec![0u32; words],
        };
        state.live_words += words;
        let data = Some(Arc::new(RwLock::new(data)));
        match state.vacant.pop() {
            Some(slot) => {
                let entry = &mut state.slots[slot as usize];
                entry.refs = 1;
                entry.meta = Some(meta);
                entry.data = data;
                Handle { slot, gen: entry.gen }
            }
            None => {
                state.slots.push(Slot { gen: 0, refs: 1, meta: Some(meta), data });
                Handle { slot: (state.slots.len() - 1) as u32, gen: 0 }
            }
        }
    }

    fn live<'s>(state: &'s mut State<M>, handle: Handle) -> Option<&'s mut Slot<M>> {
        state.slots.get_mut(handle.slot as usize)
            .filter(|slot| slot.gen == handle.gen && slot.refs > 0)
    }

    pub fn retain(&self, handle: Handle) -> Result<(), PoolError> {
        let mut state = self.lock();
        let slot = Self::live(&mut state, handle).ok_or(PoolError::UseAfterRelease(handle))?;
        slot.refs += 1;
        Ok(())
    }

    /// Drop one reference. Returns true when this was the last one and the storage
    /// went back to the free list.
    pub fn release(&self, handle: Handle) -> Result<bool, PoolError> {
        let mut state = self.lock();
        let slot = Self::live(&mut state, handle).ok_or(PoolError::DoubleFree(handle))?;
        slot.refs -= 1;
        if slot.refs > 0 { return Ok(false) }
        slot.gen = slot.gen.wrapping_add(1);
        slot.meta = None;
        let data = slot.data.take();
        state.vacant.push(handle.slot);
        if let Some(data) = data {
            match Arc::try_unwrap(data) {
                Ok(lock) => {
                    let words = lock.into_inner().unwrap_or_else(PoisonError::into_inner);
                    let len = words.len();
                    state.live_words -= len;
                    state.pooled_words += len;
                    state.free.entry(len).or_default().push(words);
                }
                Err(shared) => {
                    // still borrowed by a reader, let the last Arc free it
                    let len = shared.read().unwrap_or_else(PoisonError::into_inner).len();
                    state.live_words -= len;
                    log::warn!("pool: storage of {handle:?} still shared at release");
                }
            }
        }
        Ok(true)
    }

    pub fn refs(&self, handle: Handle) -> Result<usize, PoolError> {
        let mut state = self.lock();
        Self::live(&mut state, handle).map(|slot| slot.refs).ok_or(PoolError::UseAfterRelease(handle))
    }

    pub fn meta(&self, handle: Handle) -> Result<M, PoolError> {
        let mut state = self.lock();
        Self::live(&mut state, handle).and_then(|slot| slot.meta.clone())
            .ok_or(PoolError::UseAfterRelease(handle))
    }

    pub fn storage(&self, handle: Handle) -> Result<Storage, PoolError> {
        let mut state = self.lock();
        Self::live(&mut state, handle).and_then(|slot| slot.data.clone())
            .ok_or(PoolError::UseAfterRelease(handle))
    }

    pub fn usage(&self) -> Usage {
        let state = self.lock();
        Usage {
            live: state.live_words * 4,
            pooled: state.pooled_words * 4,
            buffers: state.slots.iter().filter(|s| s.refs > 0).count(),
        }
    }

    /// Return all pooled storage to the system allocator.
    pub fn trim(&self) {
        let mut state = self.lock();
        state.free.clear();
        state.pooled_words = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn release_recycles_exact_size() {
        let pool = Pool::<&str>::new();
        let a = pool.allocate(16, "a");
        assert_eq!(pool.usage().live, 64);
        assert!(pool.release(a).unwrap());
        assert_eq!(pool.usage(), Usage { live: 0, pooled: 64, buffers: 0 });
        let b = pool.allocate(8, "b");
        assert_eq!(pool.usage().pooled, 64);
        let c = pool.allocate(16, "c");
        assert_eq!(pool.usage(), Usage { live: 96, pooled: 0, buffers: 2 });
        assert_eq!(pool.meta(c).unwrap(), "c");
        assert_eq!(pool.meta(b).unwrap(), "b");
    }

    #[test]
    fn recycled_storage_is_zeroed() {
        let pool = Pool::<()>::new();
        let a = pool.allocate(4, ());
        pool.storage(a).unwrap().write().unwrap().copy_from_slice(&[1, 2, 3, 4]);
        pool.release(a).unwrap();
        let b = pool.allocate(4, ());
        assert_eq!(*pool.storage(b).unwrap().read().unwrap(), vec![0; 4]);
    }

    #[test]
    fn double_free_is_detected() {
        let pool = Pool::<()>::new();
        let a = pool.allocate(4, ());
        pool.retain(a).unwrap();
        assert!(!pool.release(a).unwrap());
        assert!(pool.release(a).unwrap());
        assert_eq!(pool.release(a), Err(PoolError::DoubleFree(a)));
        assert_eq!(pool.usage().pooled, 16);
        // a stale handle never reaches the slot's next tenant
        let b = pool.allocate(4, ());
        assert_eq!(a.index(), b.index());
        assert_eq!(pool.retain(a), Err(PoolError::UseAfterRelease(a)));
        assert_eq!(pool.refs(b), Ok(1));
    }

    #[test]
    fn random_churn_keeps_accounting() {
        let pool = Pool::<usize>::new();
        let mut live = vec![];
        for _ in 0..2000 {
            if rand::random::<bool>() || live.is_empty() {
                let words = rand::random::<usize>() % 8;
                live.push((pool.allocate(words, words), words));
            } else {
                let at = rand::random::<usize>() % live.len();
                let (h, _) = live.swap_remove(at);
                assert!(pool.release(h).unwrap());
            }
            let expect: usize = live.iter().map(|(_, w)| w * 4).sum();
            assert_eq!(pool.usage().live, expect);
        }
        for (h, words) in live { assert_eq!(pool.meta(h).unwrap(), words); }
    }
}
