//! A lock-free open-addressed hash table keyed by byte strings. This is the table behind the
//! global symbol map, the comdat-group map and the per-merged-section fragment maps, so it's on
//! the hot path of symbol interning and string merging.
//!
//! Slots move through three states: empty, inserting and present. An inserter claims an empty slot
//! by CASing its state to inserting, writes the key and constructs the value in place, then
//! publishes with a release-store of present. Readers that observe an inserting slot spin until
//! the slot is published. Probing is confined to the shard that the initial hash lands in, which
//! keeps competing threads on disjoint cache lines for unrelated keys.
//!
//! The table never grows. Callers size it up front via `with_capacity` before the parallel phase
//! starts, so a full shard means the capacity estimate was wrong and we treat it as a bug.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering;

pub(crate) const MIN_NBUCKETS: usize = 2048;
pub(crate) const NUM_SHARDS: usize = 16;
const MAX_RETRY: usize = 128;

const EMPTY: u8 = 0;
const INSERTING: u8 = 1;
const PRESENT: u8 = 2;

pub(crate) struct ConcurrentMap<'data, T> {
    states: Box<[AtomicU8]>,
    keys: Box<[UnsafeCell<&'data [u8]>]>,
    values: Box<[UnsafeCell<MaybeUninit<T>>]>,
    nbuckets: usize,
}

// Safety: all cross-thread access to `keys` and `values` is ordered by the acquire/release
// protocol on `states`. A slot's key and value are written exactly once, before the release-store
// of PRESENT, and are never written again.
unsafe impl<T: Send + Sync> Sync for ConcurrentMap<'_, T> {}
unsafe impl<T: Send> Send for ConcurrentMap<'_, T> {}

impl<'data, T> ConcurrentMap<'data, T> {
    /// Creates a map able to hold roughly `estimate` keys. The bucket count is rounded up to a
    /// power of two so that shard-local probing can use masks.
    pub(crate) fn with_capacity(estimate: usize) -> Self {
        let nbuckets = estimate.next_power_of_two().max(MIN_NBUCKETS);
        let mut states = Vec::with_capacity(nbuckets);
        states.resize_with(nbuckets, || AtomicU8::new(EMPTY));
        let mut keys = Vec::with_capacity(nbuckets);
        keys.resize_with(nbuckets, || UnsafeCell::new(&[] as &[u8]));
        let mut values = Vec::with_capacity(nbuckets);
        values.resize_with(nbuckets, || UnsafeCell::new(MaybeUninit::uninit()));
        Self {
            states: states.into_boxed_slice(),
            keys: keys.into_boxed_slice(),
            values: values.into_boxed_slice(),
            nbuckets,
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.nbuckets
    }

    /// Returns the value for `key`, constructing it with `init` if no other thread has yet
    /// inserted it. At most one `init` call happens per key across all threads. The returned slot
    /// index is a stable handle: values never move.
    pub(crate) fn intern(
        &self,
        key: &'data [u8],
        hash: u64,
        init: impl FnOnce() -> T,
    ) -> (u32, &T) {
        let mut init = Some(init);
        let shard_mask = self.nbuckets / NUM_SHARDS - 1;
        let mut idx = (hash as usize) & (self.nbuckets - 1);
        let mut retry = 0;

        while retry < MAX_RETRY {
            match self.states[idx].load(Ordering::Acquire) {
                PRESENT => {
                    if self.key_at(idx) == key {
                        return (idx as u32, self.value_at(idx));
                    }
                    idx = (idx & !shard_mask) | ((idx + 1) & shard_mask);
                    retry += 1;
                }
                INSERTING => std::hint::spin_loop(),
                _ => {
                    if self.states[idx]
                        .compare_exchange_weak(
                            EMPTY,
                            INSERTING,
                            Ordering::Acquire,
                            Ordering::Relaxed,
                        )
                        .is_ok()
                    {
                        // Safety: we hold the slot in the inserting state, so we're the only
                        // writer and no reader dereferences until we publish.
                        unsafe {
                            *self.keys[idx].get() = key;
                            (*self.values[idx].get()).write(init.take().unwrap()());
                        }
                        self.states[idx].store(PRESENT, Ordering::Release);
                        return (idx as u32, self.value_at(idx));
                    }
                }
            }
        }

        panic!(
            "concurrent map shard overflowed after {MAX_RETRY} probes; \
             capacity estimate was too small ({} buckets)",
            self.nbuckets
        );
    }

    pub(crate) fn get(&self, key: &[u8], hash: u64) -> Option<(u32, &T)> {
        let shard_mask = self.nbuckets / NUM_SHARDS - 1;
        let mut idx = (hash as usize) & (self.nbuckets - 1);
        let mut retry = 0;

        while retry < MAX_RETRY {
            match self.states[idx].load(Ordering::Acquire) {
                PRESENT => {
                    if self.key_at(idx) == key {
                        return Some((idx as u32, self.value_at(idx)));
                    }
                    idx = (idx & !shard_mask) | ((idx + 1) & shard_mask);
                    retry += 1;
                }
                INSERTING => std::hint::spin_loop(),
                _ => return None,
            }
        }
        None
    }

    /// Returns the value in `slot`. The slot must have been returned by `intern` on this map.
    pub(crate) fn value(&self, slot: u32) -> &T {
        debug_assert_eq!(self.states[slot as usize].load(Ordering::Acquire), PRESENT);
        self.value_at(slot as usize)
    }

    pub(crate) fn key(&self, slot: u32) -> &'data [u8] {
        debug_assert_eq!(self.states[slot as usize].load(Ordering::Acquire), PRESENT);
        self.key_at(slot as usize)
    }

    /// Visits every occupied slot. Only sound to rely on for completeness once all inserting
    /// threads have reached a barrier.
    pub(crate) fn for_each(&self, mut f: impl FnMut(u32, &'data [u8], &T)) {
        for idx in 0..self.nbuckets {
            if self.states[idx].load(Ordering::Acquire) == PRESENT {
                f(idx as u32, self.key_at(idx), self.value_at(idx));
            }
        }
    }

    fn key_at(&self, idx: usize) -> &'data [u8] {
        // Safety: PRESENT was observed with acquire ordering, so the write of the key
        // happened-before this read and no further writes occur.
        unsafe { *self.keys[idx].get() }
    }

    fn value_at(&self, idx: usize) -> &T {
        // Safety: as for `key_at`.
        unsafe { (*self.values[idx].get()).assume_init_ref() }
    }
}

impl<T> Drop for ConcurrentMap<'_, T> {
    fn drop(&mut self) {
        if !std::mem::needs_drop::<T>() {
            return;
        }
        for idx in 0..self.nbuckets {
            if *self.states[idx].get_mut() == PRESENT {
                // Safety: slot is initialized and we have exclusive access.
                unsafe { (*self.values[idx].get()).assume_init_drop() };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::hash_bytes;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn insert_then_get() {
        let map: ConcurrentMap<u32> = ConcurrentMap::with_capacity(16);
        assert_eq!(map.capacity(), MIN_NBUCKETS);

        let (slot, value) = map.intern(b"foo", hash_bytes(b"foo"), || 42);
        assert_eq!(*value, 42);
        assert_eq!(*map.value(slot), 42);
        assert_eq!(map.key(slot), b"foo");

        let (slot2, value2) = map.intern(b"foo", hash_bytes(b"foo"), || 99);
        assert_eq!(slot, slot2);
        assert_eq!(*value2, 42);

        assert!(map.get(b"bar", hash_bytes(b"bar")).is_none());
    }

    #[test]
    fn at_most_one_insertion_per_key() {
        let keys: Vec<String> = (0..1000).map(|i| format!("sym_{i}")).collect();
        let map: ConcurrentMap<u32> = ConcurrentMap::with_capacity(keys.len() * 2);
        let init_count = AtomicUsize::new(0);

        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    for (i, key) in keys.iter().enumerate() {
                        let (_, value) = map.intern(key.as_bytes(), hash_bytes(key.as_bytes()), || {
                            init_count.fetch_add(1, Ordering::Relaxed);
                            i as u32
                        });
                        assert_eq!(*value, i as u32);
                    }
                });
            }
        });

        assert_eq!(init_count.load(Ordering::Relaxed), keys.len());

        let mut seen = 0;
        map.for_each(|_, _, _| seen += 1);
        assert_eq!(seen, keys.len());
    }

    #[test]
    fn colliding_keys_stay_in_shard() {
        let map: ConcurrentMap<usize> = ConcurrentMap::with_capacity(0);
        // Same hash, different keys: both must be stored and found.
        let hash = 0x1234_5678_9abc_def0;
        let (a, _) = map.intern(b"first", hash, || 1);
        let (b, _) = map.intern(b"second", hash, || 2);
        assert_ne!(a, b);
        let shard_size = (map.capacity() / NUM_SHARDS) as u32;
        assert_eq!(a / shard_size, b / shard_size);
        assert_eq!(*map.get(b"second", hash).unwrap().1, 2);
    }
}
