//! Compiled-program cache shared by all slots of one guest language.
//!
//! Entries expire after a TTL and are evicted in insertion order once the
//! cache grows past its bound. An empty id never touches the cache.

use std::collections::{HashMap, VecDeque};
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, Instant};

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);
pub const DEFAULT_MAX_ENTRIES: usize = 100;

struct CacheEntry<P> {
    program: P,
    inserted_at: Instant,
}

struct CacheState<P> {
    entries: HashMap<String, CacheEntry<P>>,
    order: VecDeque<String>,
}

impl<P> CacheState<P> {
    fn remove(&mut self, id: &str) -> bool {
        if self.entries.remove(id).is_none() {
            return false;
        }
        if let Some(pos) = self.order.iter().position(|key| key == id) {
            self.order.remove(pos);
        }
        true
    }
}

pub struct ProgramCache<P> {
    ttl: Duration,
    max_entries: usize,
    state: RwLock<CacheState<P>>,
}

impl<P: Clone> ProgramCache<P> {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            ttl,
            max_entries: max_entries.max(1),
            state: RwLock::new(CacheState {
                entries: HashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }

    /// Return the cached program for `id`, compiling and inserting it on a
    /// miss or after expiry. Compile errors are returned and never cached.
    pub fn get_or_compile<E, F>(&self, id: &str, compile: F) -> Result<P, E>
    where
        F: FnOnce() -> Result<P, E>,
    {
        self.get_or_compile_at(id, Instant::now(), compile)
    }

    fn get_or_compile_at<E, F>(&self, id: &str, now: Instant, compile: F) -> Result<P, E>
    where
        F: FnOnce() -> Result<P, E>,
    {
        if id.is_empty() {
            return compile();
        }

        let stale = {
            let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
            match state.entries.get(id) {
                Some(entry) if now.saturating_duration_since(entry.inserted_at) <= self.ttl => {
                    return Ok(entry.program.clone());
                }
                Some(_) => true,
                None => false,
            }
        };
        if stale {
            log::debug!("compiled program {} expired", id);
            self.clear(id);
        }

        let program = compile()?;
        self.insert(id, program.clone(), now);
        Ok(program)
    }

    fn insert(&self, id: &str, program: P, now: Instant) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        // a concurrent caller may have compiled the same id
        state.remove(id);
        state.entries.insert(
            id.to_string(),
            CacheEntry {
                program,
                inserted_at: now,
            },
        );
        state.order.push_back(id.to_string());

        while state.order.len() > self.max_entries {
            if let Some(oldest) = state.order.pop_front() {
                state.entries.remove(&oldest);
                log::debug!("compiled program {} evicted", oldest);
            }
        }
    }

    /// Drop `id` regardless of its age. Returns whether an entry existed.
    pub fn clear(&self, id: &str) -> bool {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.remove(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::sync::Arc;

    fn compile_counting(counter: &Cell<u32>, value: &str) -> Result<String, String> {
        counter.set(counter.get() + 1);
        Ok(value.to_string())
    }

    #[test]
    fn hit_within_ttl_reuses_program() {
        let cache = ProgramCache::new(Duration::from_secs(60), 10);
        let compiles = Cell::new(0);
        let t0 = Instant::now();

        let first = cache
            .get_or_compile_at("id", t0, || compile_counting(&compiles, "v1"))
            .unwrap();
        let second = cache
            .get_or_compile_at("id", t0 + Duration::from_secs(59), || {
                compile_counting(&compiles, "v2")
            })
            .unwrap();

        assert_eq!(first, "v1");
        assert_eq!(second, "v1");
        assert_eq!(compiles.get(), 1);
    }

    #[test]
    fn expired_entry_is_recompiled_with_new_source() {
        let cache = ProgramCache::new(Duration::from_secs(60), 10);
        let compiles = Cell::new(0);
        let t0 = Instant::now();

        cache
            .get_or_compile_at("id", t0, || compile_counting(&compiles, "old"))
            .unwrap();
        let fresh = cache
            .get_or_compile_at("id", t0 + Duration::from_secs(61), || {
                compile_counting(&compiles, "new")
            })
            .unwrap();

        assert_eq!(fresh, "new");
        assert_eq!(compiles.get(), 2);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn empty_id_is_never_cached() {
        let cache = ProgramCache::new(Duration::from_secs(60), 10);
        let compiles = Cell::new(0);
        for _ in 0..3 {
            cache
                .get_or_compile("", || compile_counting(&compiles, "x"))
                .unwrap();
        }
        assert_eq!(compiles.get(), 3);
        assert!(cache.is_empty());
    }

    #[test]
    fn overflow_evicts_oldest_inserted_entry() {
        let cache = ProgramCache::new(Duration::from_secs(60), 3);
        let compiles = Cell::new(0);
        for id in ["a", "b", "c"] {
            cache
                .get_or_compile(id, || compile_counting(&compiles, id))
                .unwrap();
        }
        // reading "a" does not refresh its position
        cache
            .get_or_compile("a", || compile_counting(&compiles, "a"))
            .unwrap();
        assert_eq!(compiles.get(), 3);

        cache
            .get_or_compile("d", || compile_counting(&compiles, "d"))
            .unwrap();
        assert_eq!(cache.len(), 3);
        assert!(!cache.contains("a"));
        assert!(cache.contains("b"));

        cache
            .get_or_compile("a", || compile_counting(&compiles, "a"))
            .unwrap();
        assert_eq!(compiles.get(), 5);
        assert!(!cache.contains("b"));
    }

    #[test]
    fn compile_errors_are_not_cached() {
        let cache: ProgramCache<String> = ProgramCache::new(Duration::from_secs(60), 10);
        let err = cache
            .get_or_compile("bad", || Err::<String, _>("syntax error".to_string()))
            .unwrap_err();
        assert_eq!(err, "syntax error");
        assert!(!cache.contains("bad"));
    }

    #[test]
    fn clear_removes_entry_immediately() {
        let cache = ProgramCache::new(Duration::from_secs(60), 10);
        cache.get_or_compile("id", || Ok::<_, ()>(1)).unwrap();
        assert!(cache.clear("id"));
        assert!(!cache.clear("id"));
        assert!(cache.is_empty());
    }

    #[test]
    fn concurrent_access_keeps_bound() {
        let cache = Arc::new(ProgramCache::new(Duration::from_secs(60), 16));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    for i in 0..200 {
                        let id = format!("{}", (i * 7 + t) % 40);
                        let value = cache.get_or_compile(&id, || Ok::<_, ()>(id.clone())).unwrap();
                        assert_eq!(value, id);
                        assert!(cache.len() <= 16);
                        if i % 13 == 0 {
                            cache.clear(&id);
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(cache.len() <= 16);
    }
}
