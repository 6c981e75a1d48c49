use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use alyx_core::types::EventType;
use alyx_store::{Hook, HookMode, HookUpdate, NewHook, Store};
use tracing::{debug, warn};

use crate::error::{HookError, Result};

/// Cached view of the hooks table.
///
/// The store is the source of truth; the cache is authoritative for reads
/// and rebuilt wholesale on every write. Lookups take the read lock;
/// dispatch is hot, registry writes (API CRUD, manifest reload) are rare.
pub struct HookRegistry {
    store: Arc<Store>,
    by_type: RwLock<HashMap<EventType, Vec<Hook>>>,
    /// Bumped on every cache rebuild; lets callers detect staleness cheaply.
    generation: AtomicU64,
}

impl HookRegistry {
    /// Build the registry and warm the cache from the store.
    pub fn new(store: Arc<Store>) -> Result<Self> {
        let registry = Self {
            store,
            by_type: RwLock::new(HashMap::new()),
            generation: AtomicU64::new(0),
        };
        registry.invalidate()?;
        Ok(registry)
    }

    /// Rebuild the cache from the enabled rows in the store.
    pub fn invalidate(&self) -> Result<()> {
        let hooks = self.store.enabled_hooks()?;
        let mut map: HashMap<EventType, Vec<Hook>> = HashMap::new();
        for hook in hooks {
            map.entry(hook.event_type).or_default().push(hook);
        }
        // Priority descending, id ascending; the dispatch order.
        for list in map.values_mut() {
            list.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));
        }

        let mut cache = self.by_type.write().expect("hook cache poisoned");
        *cache = map;
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(generation, "hook cache rebuilt");
        Ok(())
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Relaxed)
    }

    /// All enabled hooks matching the triple, sorted by descending priority.
    pub fn find_matches(&self, event_type: EventType, source: &str, action: &str) -> Vec<Hook> {
        let cache = self.by_type.read().expect("hook cache poisoned");
        cache
            .get(&event_type)
            .map(|hooks| {
                hooks
                    .iter()
                    .filter(|h| h.matches(event_type, source, action))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Matches partitioned into `(sync, async)` lists, each already in
    /// dispatch order.
    pub fn find_matches_split(
        &self,
        event_type: EventType,
        source: &str,
        action: &str,
    ) -> (Vec<Hook>, Vec<Hook>) {
        self.find_matches(event_type, source, action)
            .into_iter()
            .partition(|h| h.mode == HookMode::Sync)
    }

    pub fn register(&self, new: NewHook) -> Result<Hook> {
        if new.name.trim().is_empty() {
            return Err(HookError::Invalid("hook name must not be empty".into()));
        }
        if new.function_id.trim().is_empty() {
            return Err(HookError::Invalid(
                "hook function_id must not be empty".into(),
            ));
        }
        let hook = self.store.insert_hook(new)?;
        self.invalidate()?;
        Ok(hook)
    }

    pub fn update(&self, id: &str, update: HookUpdate) -> Result<Hook> {
        let hook = self.store.update_hook(id, update)?;
        self.invalidate()?;
        Ok(hook)
    }

    pub fn unregister(&self, id: &str) -> Result<bool> {
        let removed = self.store.delete_hook(id)?;
        if removed {
            self.invalidate()?;
        } else {
            warn!(id, "unregister of unknown hook");
        }
        Ok(removed)
    }

    pub fn get(&self, id: &str) -> Result<Hook> {
        Ok(self.store.get_hook(id)?)
    }

    pub fn list(&self) -> Result<Vec<Hook>> {
        Ok(self.store.list_hooks()?)
    }

    pub fn list_by_function(&self, function_id: &str) -> Result<Vec<Hook>> {
        Ok(self.store.hooks_by_function(function_id)?)
    }

    /// Manifest reload path: drop loader-owned hooks of one function and
    /// insert the replacement set in a single cache rebuild.
    pub fn replace_manifest_hooks(
        &self,
        function_id: &str,
        hooks: Vec<NewHook>,
    ) -> Result<Vec<Hook>> {
        self.store.delete_manifest_hooks(function_id)?;
        let mut created = Vec::with_capacity(hooks.len());
        for mut hook in hooks {
            hook.managed_by = alyx_store::MANAGED_BY_MANIFEST.to_string();
            created.push(self.store.insert_hook(hook)?);
        }
        self.invalidate()?;
        Ok(created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alyx_store::HookConfig;

    fn registry() -> HookRegistry {
        HookRegistry::new(Arc::new(Store::open_in_memory().unwrap())).unwrap()
    }

    fn hook(name: &str, source: &str, action: &str, priority: i64) -> NewHook {
        let mut h = NewHook::new(name, name, EventType::Database);
        h.event_source = source.into();
        h.event_action = action.into();
        h.priority = priority;
        h
    }

    #[test]
    fn matches_sorted_by_priority_desc() {
        let r = registry();
        r.register(hook("low", "users", "insert", 1)).unwrap();
        r.register(hook("high", "*", "insert", 10)).unwrap();
        r.register(hook("mid", "users", "*", 5)).unwrap();

        let matches = r.find_matches(EventType::Database, "users", "insert");
        let names: Vec<&str> = matches.iter().map(|h| h.name.as_str()).collect();
        assert_eq!(names, vec!["high", "mid", "low"]);
    }

    #[test]
    fn wildcard_closure() {
        // The match set for a concrete triple equals the union of every
        // pattern that covers it.
        let r = registry();
        r.register(hook("exact", "users", "insert", 0)).unwrap();
        r.register(hook("any-source", "*", "insert", 0)).unwrap();
        r.register(hook("any-action", "users", "*", 0)).unwrap();
        r.register(hook("any-both", "*", "*", 0)).unwrap();
        r.register(hook("other", "orders", "insert", 0)).unwrap();

        let matches = r.find_matches(EventType::Database, "users", "insert");
        let mut names: Vec<&str> = matches.iter().map(|h| h.name.as_str()).collect();
        names.sort();
        assert_eq!(names, vec!["any-action", "any-both", "any-source", "exact"]);
    }

    #[test]
    fn disabled_hooks_are_invisible() {
        let r = registry();
        let created = r.register(hook("h", "*", "*", 0)).unwrap();
        assert_eq!(r.find_matches(EventType::Database, "u", "insert").len(), 1);

        r.update(
            &created.id,
            HookUpdate {
                enabled: Some(false),
                ..Default::default()
            },
        )
        .unwrap();
        assert!(r.find_matches(EventType::Database, "u", "insert").is_empty());
    }

    #[test]
    fn split_partitions_by_mode() {
        let r = registry();
        let mut sync = hook("s", "*", "*", 5);
        sync.mode = HookMode::Sync;
        r.register(sync).unwrap();
        r.register(hook("a", "*", "*", 1)).unwrap();

        let (sync_hooks, async_hooks) =
            r.find_matches_split(EventType::Database, "users", "insert");
        assert_eq!(sync_hooks.len(), 1);
        assert_eq!(sync_hooks[0].name, "s");
        assert_eq!(async_hooks.len(), 1);
        assert_eq!(async_hooks[0].name, "a");
    }

    #[test]
    fn generation_bumps_on_write() {
        let r = registry();
        let g0 = r.generation();
        r.register(hook("h", "*", "*", 0)).unwrap();
        assert!(r.generation() > g0);
    }

    #[test]
    fn manifest_replace_spares_api_hooks() {
        let r = registry();
        r.register(hook("api-owned", "*", "*", 0)).unwrap();

        let mut m = hook("manifest-owned", "*", "*", 0);
        m.function_id = "api-owned".into();
        r.replace_manifest_hooks("api-owned", vec![m]).unwrap();
        assert_eq!(r.list_by_function("api-owned").unwrap().len(), 2);

        // a second replace with an empty set removes only the loader's row
        r.replace_manifest_hooks("api-owned", vec![]).unwrap();
        let remaining = r.list_by_function("api-owned").unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].name, "api-owned");
    }

    #[test]
    fn empty_names_rejected() {
        let r = registry();
        let err = r.register(hook("", "*", "*", 0)).unwrap_err();
        assert_eq!(err.code(), "VALIDATION");
    }

    #[test]
    fn config_defaults_reject_on_failure() {
        assert_eq!(HookConfig::default().on_failure, crate::OnFailure::Reject);
    }
}
