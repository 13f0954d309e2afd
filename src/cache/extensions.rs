//! Pluggable extension points and the registry that instantiates them.
//!
//! Caches refer to extensions by name plus a property bag
//! ([`ExtensionRef`]). The embedding application registers one factory per
//! name on an [`ExtensionRegistry`]; every node resolves the same names to its
//! own instances, which is how executables and filters travel with
//! scatter-gather requests.

use crate::cache::entry::CacheEntry;
use crate::clock::{Clock, Time};
use crate::config::{CacheConfig, ExtensionRef, WriteMode};
use crate::error::{ConfigError, Result};
use crate::executor::{CountEntries, EntryFilter, Executable, KeyPrefixFilter};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Entry as seen by a [`CacheInvalidator`].
pub struct InvalidatorElement<'a> {
    key: &'a [u8],
    value: &'a Bytes,
    created: Time,
    expiration: Option<Time>,
    invalid: bool,
}

impl<'a> InvalidatorElement<'a> {
    pub(crate) fn new(key: &'a [u8], entry: &'a CacheEntry) -> Self {
        Self {
            key,
            value: &entry.value,
            created: entry.created,
            expiration: entry.expiration,
            invalid: entry.invalid,
        }
    }

    pub fn key(&self) -> &[u8] {
        self.key
    }

    pub fn value(&self) -> &Bytes {
        self.value
    }

    pub fn created(&self) -> Time {
        self.created
    }

    pub fn expiration(&self) -> Option<Time> {
        self.expiration
    }

    /// Drop the entry; the access that triggered the check sees a miss.
    pub fn invalidate(&mut self) {
        self.invalid = true;
    }

    pub fn is_invalid(&self) -> bool {
        self.invalid
    }
}

/// Decides on every access whether an entry is still valid.
///
/// Runs inline on the store processor: no blocking, no I/O.
pub trait CacheInvalidator: Send + Sync + 'static {
    fn process(&self, element: &mut InvalidatorElement<'_>);
}

/// Entry handed to a [`DataStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Storable {
    pub key: Bytes,
    pub value: Bytes,
    pub created: Time,
    pub expiration: Option<Time>,
}

/// Write-through target, called after the in-memory write commits.
#[async_trait]
pub trait DataStore: Send + Sync + 'static {
    async fn store(&self, entries: &[Storable]) -> Result<()>;

    async fn remove(&self, _keys: &[Bytes]) -> Result<()> {
        Ok(())
    }
}

/// Read-through source consulted on a miss.
#[async_trait]
pub trait DataSource: Send + Sync + 'static {
    async fn get(&self, key: &[u8]) -> Result<Option<Bytes>>;
}

/// Collects entries produced by a [`CacheLoader`].
#[derive(Debug, Default)]
pub struct Loadable {
    entries: Vec<(Bytes, Bytes, Option<Duration>)>,
}

impl Loadable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(&mut self, key: impl Into<Bytes>, value: impl Into<Bytes>) {
        self.entries.push((key.into(), value.into(), None));
    }

    pub fn load_with_ttl(&mut self, key: impl Into<Bytes>, value: impl Into<Bytes>, ttl: Duration) {
        self.entries.push((key.into(), value.into(), Some(ttl)));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn into_entries(self) -> Vec<(Bytes, Bytes, Option<Duration>)> {
        self.entries
    }
}

/// Bulk-populates a cache once, when its group is first created.
#[async_trait]
pub trait CacheLoader: Send + Sync + 'static {
    async fn load(&self, sink: &mut Loadable) -> Result<()>;
}

/// What a factory gets before building an extension.
#[derive(Clone)]
pub struct ExtensionContext {
    pub cache_name: String,
    pub properties: BTreeMap<String, String>,
    pub clock: Arc<Clock>,
}

impl ExtensionContext {
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// A property that must be present.
    pub fn required(&self, extension: &str, key: &str) -> std::result::Result<&str, ConfigError> {
        self.property(key).ok_or_else(|| ConfigError::Property {
            name: extension.to_string(),
            reason: format!("missing property `{key}`"),
        })
    }
}

impl fmt::Debug for ExtensionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtensionContext")
            .field("cache_name", &self.cache_name)
            .field("properties", &self.properties)
            .finish()
    }
}

type Factory<T> = Arc<dyn Fn(&ExtensionContext) -> Result<Arc<T>> + Send + Sync>;

struct Factories<T: ?Sized> {
    kind: &'static str,
    map: RwLock<HashMap<String, Factory<T>>>,
}

impl<T: ?Sized> Factories<T> {
    fn new(kind: &'static str) -> Self {
        Self {
            kind,
            map: RwLock::new(HashMap::new()),
        }
    }

    fn register(&self, name: String, factory: Factory<T>) {
        self.map.write().insert(name, factory);
    }

    fn contains(&self, name: &str) -> bool {
        self.map.read().contains_key(name)
    }

    fn resolve(&self, reference: &ExtensionRef, ctx: &ExtensionContext) -> Result<Arc<T>> {
        let factory = self
            .map
            .read()
            .get(&reference.name)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownExtension {
                kind: self.kind,
                name: reference.name.clone(),
            })?;
        factory(ctx)
    }
}

/// Extensions resolved for one cache.
#[derive(Clone, Default)]
pub struct CacheExtensions {
    pub invalidator: Option<Arc<dyn CacheInvalidator>>,
    pub data_store: Option<(Arc<dyn DataStore>, WriteMode)>,
    pub data_source: Option<Arc<dyn DataSource>>,
    pub loader: Option<Arc<dyn CacheLoader>>,
}

/// Name-to-factory tables for every extension kind.
pub struct ExtensionRegistry {
    invalidators: Factories<dyn CacheInvalidator>,
    data_stores: Factories<dyn DataStore>,
    data_sources: Factories<dyn DataSource>,
    loaders: Factories<dyn CacheLoader>,
    executables: Factories<dyn Executable>,
    filters: Factories<dyn EntryFilter>,
}

impl Default for ExtensionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ExtensionRegistry {
    /// Registry with the built-in `count` executable and `key-prefix` filter.
    pub fn new() -> Self {
        let registry = Self::empty();
        registry.register_executable(CountEntries::NAME, |_| Ok(Arc::new(CountEntries)));
        registry.register_filter(KeyPrefixFilter::NAME, |ctx| {
            let prefix = ctx.required(KeyPrefixFilter::NAME, "prefix")?;
            Ok(Arc::new(KeyPrefixFilter::new(prefix)))
        });
        registry
    }

    pub fn empty() -> Self {
        Self {
            invalidators: Factories::new("invalidator"),
            data_stores: Factories::new("data store"),
            data_sources: Factories::new("data source"),
            loaders: Factories::new("loader"),
            executables: Factories::new("executable"),
            filters: Factories::new("filter"),
        }
    }

    pub fn register_invalidator<F>(&self, name: impl Into<String>, factory: F)
    where
        F: Fn(&ExtensionContext) -> Result<Arc<dyn CacheInvalidator>> + Send + Sync + 'static,
    {
        self.invalidators.register(name.into(), Arc::new(factory));
    }

    pub fn register_data_store<F>(&self, name: impl Into<String>, factory: F)
    where
        F: Fn(&ExtensionContext) -> Result<Arc<dyn DataStore>> + Send + Sync + 'static,
    {
        self.data_stores.register(name.into(), Arc::new(factory));
    }

    pub fn register_data_source<F>(&self, name: impl Into<String>, factory: F)
    where
        F: Fn(&ExtensionContext) -> Result<Arc<dyn DataSource>> + Send + Sync + 'static,
    {
        self.data_sources.register(name.into(), Arc::new(factory));
    }

    pub fn register_loader<F>(&self, name: impl Into<String>, factory: F)
    where
        F: Fn(&ExtensionContext) -> Result<Arc<dyn CacheLoader>> + Send + Sync + 'static,
    {
        self.loaders.register(name.into(), Arc::new(factory));
    }

    pub fn register_executable<F>(&self, name: impl Into<String>, factory: F)
    where
        F: Fn(&ExtensionContext) -> Result<Arc<dyn Executable>> + Send + Sync + 'static,
    {
        self.executables.register(name.into(), Arc::new(factory));
    }

    pub fn register_filter<F>(&self, name: impl Into<String>, factory: F)
    where
        F: Fn(&ExtensionContext) -> Result<Arc<dyn EntryFilter>> + Send + Sync + 'static,
    {
        self.filters.register(name.into(), Arc::new(factory));
    }

    pub fn has_executable(&self, name: &str) -> bool {
        self.executables.contains(name)
    }

    pub fn has_filter(&self, name: &str) -> bool {
        self.filters.contains(name)
    }

    pub fn executable(
        &self,
        reference: &ExtensionRef,
        cache_name: &str,
        clock: &Arc<Clock>,
    ) -> Result<Arc<dyn Executable>> {
        self.executables
            .resolve(reference, &context(reference, cache_name, clock))
    }

    pub fn filter(
        &self,
        reference: &ExtensionRef,
        cache_name: &str,
        clock: &Arc<Clock>,
    ) -> Result<Arc<dyn EntryFilter>> {
        self.filters
            .resolve(reference, &context(reference, cache_name, clock))
    }

    /// Instantiate every extension a cache configuration names.
    pub fn resolve_cache(&self, config: &CacheConfig, clock: &Arc<Clock>) -> Result<CacheExtensions> {
        let name = config.name.as_str();
        let mut resolved = CacheExtensions::default();

        if let Some(reference) = &config.invalidator {
            let ctx = context(reference, name, clock);
            resolved.invalidator = Some(self.invalidators.resolve(reference, &ctx)?);
        }
        if let Some(store) = &config.data_store {
            let ctx = context(&store.extension, name, clock);
            let instance = self.data_stores.resolve(&store.extension, &ctx)?;
            resolved.data_store = Some((instance, store.mode));
        }
        if let Some(reference) = &config.data_source {
            let ctx = context(reference, name, clock);
            resolved.data_source = Some(self.data_sources.resolve(reference, &ctx)?);
        }
        if let Some(reference) = &config.loader {
            let ctx = context(reference, name, clock);
            resolved.loader = Some(self.loaders.resolve(reference, &ctx)?);
        }
        Ok(resolved)
    }
}

fn context(reference: &ExtensionRef, cache_name: &str, clock: &Arc<Clock>) -> ExtensionContext {
    ExtensionContext {
        cache_name: cache_name.to_string(),
        properties: reference.properties.clone(),
        clock: clock.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    struct NeverInvalid;

    impl CacheInvalidator for NeverInvalid {
        fn process(&self, _element: &mut InvalidatorElement<'_>) {}
    }

    struct StaticSource(Bytes);

    #[async_trait]
    impl DataSource for StaticSource {
        async fn get(&self, _key: &[u8]) -> Result<Option<Bytes>> {
            Ok(Some(self.0.clone()))
        }
    }

    #[tokio::test]
    async fn test_resolve_cache_extensions() {
        let registry = ExtensionRegistry::new();
        registry.register_invalidator("never", |_| Ok(Arc::new(NeverInvalid)));
        registry.register_data_source("static", |ctx| {
            let value = ctx.required("static", "value")?.to_string();
            Ok(Arc::new(StaticSource(Bytes::from(value))))
        });

        let config = CacheConfig::new("users")
            .with_invalidator(ExtensionRef::new("never"))
            .with_data_source(ExtensionRef::new("static").with_property("value", "hello"));
        let clock = Arc::new(Clock::system());

        let resolved = registry.resolve_cache(&config, &clock).unwrap();
        assert!(resolved.invalidator.is_some());
        assert!(resolved.data_store.is_none());
        let source = resolved.data_source.unwrap();
        assert_eq!(source.get(b"any").await.unwrap(), Some(Bytes::from("hello")));
    }

    #[test]
    fn test_unknown_extension_is_config_error() {
        let registry = ExtensionRegistry::new();
        let config = CacheConfig::new("users").with_loader(ExtensionRef::new("missing"));
        let clock = Arc::new(Clock::system());

        let err = registry.resolve_cache(&config, &clock).err().unwrap();
        assert!(matches!(
            err,
            Error::Config(ConfigError::UnknownExtension { kind: "loader", .. })
        ));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_missing_property_is_config_error() {
        let registry = ExtensionRegistry::new();
        let clock = Arc::new(Clock::system());
        let err = registry
            .filter(&ExtensionRef::new(KeyPrefixFilter::NAME), "c", &clock)
            .err()
            .unwrap();
        assert!(matches!(err, Error::Config(ConfigError::Property { .. })));

        assert!(registry.has_executable(CountEntries::NAME));
        assert!(registry.has_filter(KeyPrefixFilter::NAME));
        assert!(!ExtensionRegistry::empty().has_executable(CountEntries::NAME));
    }

    #[test]
    fn test_loadable_sink() {
        let mut sink = Loadable::new();
        sink.load("a", "1");
        sink.load_with_ttl("b", "2", Duration::from_secs(1));
        assert_eq!(sink.len(), 2);
        let entries = sink.into_entries();
        assert_eq!(entries[1].2, Some(Duration::from_secs(1)));
    }
}
