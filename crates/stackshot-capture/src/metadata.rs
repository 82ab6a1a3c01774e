use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};

use stackshot_types::{NativeThreadId, ThreadMetadata};

use crate::config::SamplerConfig;
use crate::thread::ThreadHandle;

/// Looks up identity for a thread. Called only outside the suspend window,
/// so implementations are free to allocate, lock or read files.
pub trait MetadataResolver {
    /// [`ThreadMetadata::unresolved`] when the thread cannot be identified.
    fn resolve(&self, thread: NativeThreadId) -> ThreadMetadata;
}

impl<F> MetadataResolver for F
where
    F: Fn(NativeThreadId) -> ThreadMetadata,
{
    fn resolve(&self, thread: NativeThreadId) -> ThreadMetadata {
        self(thread)
    }
}

#[derive(Debug, Clone)]
struct CachedMetadata {
    metadata: ThreadMetadata,
    resolved_at: Instant,
}

/// Memoized thread identity, keyed by native thread id.
///
/// Threads whose name starts with one of the ignored prefixes are cached with
/// the zero-id sentinel so they are skipped on every pass. Failed lookups are
/// not cached and are retried on the next pass.
pub struct ThreadMetadataCache<R> {
    resolver: R,
    entries: HashMap<NativeThreadId, CachedMetadata>,
    refresh_interval: Option<Duration>,
    ignored_name_prefixes: Vec<String>,
}

impl<R: MetadataResolver> ThreadMetadataCache<R> {
    pub fn new(resolver: R) -> Self {
        Self {
            resolver,
            entries: HashMap::new(),
            refresh_interval: None,
            ignored_name_prefixes: Vec::new(),
        }
    }

    pub fn from_config(resolver: R, config: &SamplerConfig) -> Self {
        Self::new(resolver)
            .with_refresh_interval(config.metadata_refresh)
            .with_ignored_name_prefixes(config.ignored_thread_prefixes.iter().cloned())
    }

    /// Re-resolve entries older than `interval`. `None` keeps entries until
    /// their thread goes away.
    pub fn with_refresh_interval(mut self, interval: Option<Duration>) -> Self {
        self.refresh_interval = interval;
        self
    }

    pub fn with_ignored_name_prefixes<I, S>(mut self, prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ignored_name_prefixes = prefixes.into_iter().map(Into::into).collect();
        self
    }

    pub fn metadata_for_thread<T: ThreadHandle>(&mut self, thread: &T) -> ThreadMetadata {
        self.metadata_for_id(thread.native_id())
    }

    pub fn metadata_for_id(&mut self, thread: NativeThreadId) -> ThreadMetadata {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(&thread) {
            let stale = self
                .refresh_interval
                .is_some_and(|interval| now.duration_since(entry.resolved_at) >= interval);
            if !stale {
                return entry.metadata.clone();
            }
        }

        let resolved = self.resolver.resolve(thread);
        if !resolved.is_resolved() {
            self.entries.remove(&thread);
            return resolved;
        }

        let metadata = if self.is_ignored(&resolved.name) {
            ThreadMetadata::unresolved()
        } else {
            resolved
        };
        self.entries.insert(
            thread,
            CachedMetadata {
                metadata: metadata.clone(),
                resolved_at: now,
            },
        );
        metadata
    }

    /// Drops entries for threads not in `live`.
    pub fn retain_threads(&mut self, live: &[NativeThreadId]) {
        let live: BTreeSet<_> = live.iter().copied().collect();
        self.entries.retain(|thread, _| live.contains(thread));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn resolver(&self) -> &R {
        &self.resolver
    }

    fn is_ignored(&self, name: &str) -> bool {
        self.ignored_name_prefixes
            .iter()
            .any(|prefix| name.starts_with(prefix.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn counting_resolver(calls: &Cell<usize>) -> impl Fn(NativeThreadId) -> ThreadMetadata + '_ {
        move |thread| {
            calls.set(calls.get() + 1);
            match thread.get() {
                0 => ThreadMetadata::unresolved(),
                9 => ThreadMetadata::new(9, "stackshot-sampler", 0),
                id => ThreadMetadata::new(id, format!("worker-{id}"), 10),
            }
        }
    }

    #[test]
    fn resolves_once_and_serves_from_cache() {
        let calls = Cell::new(0);
        let mut cache = ThreadMetadataCache::new(counting_resolver(&calls));

        let first = cache.metadata_for_id(NativeThreadId::from_raw(3));
        let second = cache.metadata_for_id(NativeThreadId::from_raw(3));

        assert_eq!(first, ThreadMetadata::new(3, "worker-3", 10));
        assert_eq!(first, second);
        assert_eq!(calls.get(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn unresolved_lookups_are_retried() {
        let calls = Cell::new(0);
        let mut cache = ThreadMetadataCache::new(counting_resolver(&calls));

        assert!(!cache.metadata_for_id(NativeThreadId::from_raw(0)).is_resolved());
        assert!(!cache.metadata_for_id(NativeThreadId::from_raw(0)).is_resolved());

        assert_eq!(calls.get(), 2);
        assert!(cache.is_empty());
    }

    #[test]
    fn ignored_names_are_cached_as_the_sentinel() {
        let calls = Cell::new(0);
        let mut cache = ThreadMetadataCache::new(counting_resolver(&calls))
            .with_ignored_name_prefixes(["stackshot-"]);

        let first = cache.metadata_for_id(NativeThreadId::from_raw(9));
        let second = cache.metadata_for_id(NativeThreadId::from_raw(9));

        assert_eq!(first.thread_id, 0);
        assert_eq!(second.thread_id, 0);
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn zero_refresh_interval_resolves_every_time() {
        let calls = Cell::new(0);
        let mut cache = ThreadMetadataCache::new(counting_resolver(&calls))
            .with_refresh_interval(Some(Duration::ZERO));

        cache.metadata_for_id(NativeThreadId::from_raw(4));
        cache.metadata_for_id(NativeThreadId::from_raw(4));

        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn retain_threads_prunes_exited_threads() {
        let calls = Cell::new(0);
        let mut cache = ThreadMetadataCache::new(counting_resolver(&calls));
        for id in 1..=3 {
            cache.metadata_for_id(NativeThreadId::from_raw(id));
        }

        cache.retain_threads(&[NativeThreadId::from_raw(2)]);

        assert_eq!(cache.len(), 1);
        cache.metadata_for_id(NativeThreadId::from_raw(2));
        assert_eq!(calls.get(), 3);
    }
}
