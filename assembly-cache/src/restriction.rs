//! Per-user visibility of elements.
//!
//! Each collection maps to a [`RestrictionStrategy`]; collections without an
//! entry use [`RestrictionStrategy::Unrestricted`]. Results are cached per
//! `(user, element)` and tagged with:
//! - the cache change id read *before* the element data was read, and
//! - the user's permission version.
//!
//! An entry is used only if the element has not changed after its tag and
//! the permission version is unchanged. Writers call [`RestrictionEngine::invalidate`]
//! after every committed batch, which drops stale entries and records the
//! element's new change id so late inserts computed from older data are
//! ignored.
//!
//! All locks here are std locks held for short, non-suspending sections.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};

use serde_json::Value;

use crate::element::{Element, ElementId};

/// Id of a viewing user. `0` is the anonymous user.
pub type UserId = u64;

pub const ANONYMOUS_USER: UserId = 0;

/// Opaque permission check supplied by the application.
pub trait PermissionPredicate: Send + Sync {
    fn has_perm(&self, user_id: UserId, permission: &str) -> bool;
}

impl<F> PermissionPredicate for F
where
    F: Fn(UserId, &str) -> bool + Send + Sync,
{
    fn has_perm(&self, user_id: UserId, permission: &str) -> bool {
        self(user_id, permission)
    }
}

/// Custom restriction for collections the built-in strategies don't cover.
pub trait Restrict: Send + Sync {
    fn restrict(
        &self,
        element: &Element,
        user_id: UserId,
        permissions: &dyn PermissionPredicate,
    ) -> Option<Element>;
}

/// How a collection is restricted.
#[derive(Clone)]
pub enum RestrictionStrategy {
    /// Visible unchanged to every user allowed to see anything.
    Unrestricted,
    /// Visible only with the permission.
    Permission(String),
    /// Whole element with the permission, otherwise only `fields`.
    PermissionOrFields {
        permission: String,
        fields: Vec<String>,
    },
    /// Visible to the user stored in `owner_field` or with the permission.
    OwnerOrPermission {
        owner_field: String,
        permission: String,
    },
    Custom(Arc<dyn Restrict>),
}

impl fmt::Debug for RestrictionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unrestricted => write!(f, "Unrestricted"),
            Self::Permission(p) => f.debug_tuple("Permission").field(p).finish(),
            Self::PermissionOrFields { permission, fields } => f
                .debug_struct("PermissionOrFields")
                .field("permission", permission)
                .field("fields", fields)
                .finish(),
            Self::OwnerOrPermission {
                owner_field,
                permission,
            } => f
                .debug_struct("OwnerOrPermission")
                .field("owner_field", owner_field)
                .field("permission", permission)
                .finish(),
            Self::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

impl RestrictionStrategy {
    fn apply(
        &self,
        element: &Element,
        user_id: UserId,
        permissions: &dyn PermissionPredicate,
    ) -> Option<Element> {
        match self {
            Self::Unrestricted => Some(element.clone()),
            Self::Permission(permission) => permissions
                .has_perm(user_id, permission)
                .then(|| element.clone()),
            Self::PermissionOrFields { permission, fields } => {
                if permissions.has_perm(user_id, permission) {
                    Some(element.clone())
                } else {
                    Some(
                        element
                            .iter()
                            .filter(|(key, _)| fields.iter().any(|f| f == *key))
                            .map(|(key, value)| (key.clone(), value.clone()))
                            .collect(),
                    )
                }
            }
            Self::OwnerOrPermission {
                owner_field,
                permission,
            } => {
                let is_owner = user_id != ANONYMOUS_USER
                    && element.get(owner_field).and_then(Value::as_u64) == Some(user_id);
                (is_owner || permissions.has_perm(user_id, permission)).then(|| element.clone())
            }
            Self::Custom(restrict) => restrict.restrict(element, user_id, permissions),
        }
    }
}

/// Registry of strategies by collection name.
#[derive(Debug, Clone, Default)]
pub struct RestrictionRegistry {
    strategies: HashMap<String, RestrictionStrategy>,
}

impl RestrictionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, collection: impl Into<String>, strategy: RestrictionStrategy) -> Self {
        self.strategies.insert(collection.into(), strategy);
        self
    }

    pub fn strategy(&self, collection: &str) -> &RestrictionStrategy {
        self.strategies
            .get(collection)
            .unwrap_or(&RestrictionStrategy::Unrestricted)
    }
}

#[derive(Debug, Clone)]
struct CachedRestriction {
    computed_at: u64,
    permission_version: u64,
    result: Option<Element>,
}

/// Restriction statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestrictionStats {
    pub cached_results: usize,
    pub hits: u64,
    pub misses: u64,
}

#[derive(Debug, Default)]
struct ResultCache {
    /// element → user → cached result
    entries: HashMap<ElementId, HashMap<UserId, CachedRestriction>>,
    /// Change id of the last batch touching each element.
    element_versions: HashMap<ElementId, u64>,
    hits: u64,
    misses: u64,
}

/// Applies strategies and caches their results.
pub struct RestrictionEngine {
    registry: RestrictionRegistry,
    permissions: Arc<dyn PermissionPredicate>,
    anonymous_enabled: bool,
    permission_versions: RwLock<HashMap<UserId, u64>>,
    /// Bumped for changes that affect every user (group edits).
    global_permission_version: RwLock<u64>,
    cache: Mutex<ResultCache>,
}

impl RestrictionEngine {
    pub fn new(registry: RestrictionRegistry, permissions: Arc<dyn PermissionPredicate>) -> Self {
        Self {
            registry,
            permissions,
            anonymous_enabled: false,
            permission_versions: RwLock::new(HashMap::new()),
            global_permission_version: RwLock::new(0),
            cache: Mutex::new(ResultCache::default()),
        }
    }

    /// Engine where every user has every permission.
    pub fn permissive(registry: RestrictionRegistry) -> Self {
        Self::new(registry, Arc::new(|_: UserId, _: &str| true))
    }

    pub fn with_anonymous(mut self, enabled: bool) -> Self {
        self.anonymous_enabled = enabled;
        self
    }

    pub fn anonymous_enabled(&self) -> bool {
        self.anonymous_enabled
    }

    pub fn registry(&self) -> &RestrictionRegistry {
        &self.registry
    }

    /// Whether the user may see anything at all.
    pub fn can_see_anything(&self, user_id: UserId) -> bool {
        user_id != ANONYMOUS_USER || self.anonymous_enabled
    }

    /// Current permission version of a user.
    pub fn permission_version(&self, user_id: UserId) -> u64 {
        let global = *self
            .global_permission_version
            .read()
            .unwrap_or_else(|e| e.into_inner());
        let user = self
            .permission_versions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&user_id)
            .copied()
            .unwrap_or(0);
        global + user
    }

    /// Call after the user's groups or permissions changed.
    pub fn bump_permission_version(&self, user_id: UserId) {
        let mut versions = self
            .permission_versions
            .write()
            .unwrap_or_else(|e| e.into_inner());
        *versions.entry(user_id).or_insert(0) += 1;
        log::debug!("Permission version bumped for user {user_id}");
    }

    /// Call after a group's permissions changed.
    pub fn bump_all_permission_versions(&self) {
        *self
            .global_permission_version
            .write()
            .unwrap_or_else(|e| e.into_inner()) += 1;
        log::debug!("Permission version bumped for all users");
    }

    /// Restrict one element for a user.
    ///
    /// `computed_at` is the cache change id observed before `element` was read.
    pub fn restrict(
        &self,
        element_id: &ElementId,
        element: &Element,
        user_id: UserId,
        computed_at: u64,
    ) -> Option<Element> {
        if !self.can_see_anything(user_id) {
            return None;
        }

        let permission_version = self.permission_version(user_id);
        {
            let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(result) = Self::lookup(&cache, element_id, user_id, permission_version) {
                cache.hits += 1;
                return result;
            }
            cache.misses += 1;
        }

        let result = self
            .registry
            .strategy(element_id.collection())
            .apply(element, user_id, self.permissions.as_ref());

        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        let element_version = cache.element_versions.get(element_id).copied().unwrap_or(0);
        if computed_at >= element_version {
            cache.entries.entry(element_id.clone()).or_default().insert(
                user_id,
                CachedRestriction {
                    computed_at,
                    permission_version,
                    result: result.clone(),
                },
            );
        }
        result
    }

    fn lookup(
        cache: &ResultCache,
        element_id: &ElementId,
        user_id: UserId,
        permission_version: u64,
    ) -> Option<Option<Element>> {
        let entry = cache.entries.get(element_id)?.get(&user_id)?;
        let element_version = cache.element_versions.get(element_id).copied().unwrap_or(0);
        (entry.computed_at >= element_version && entry.permission_version == permission_version)
            .then(|| entry.result.clone())
    }

    /// Drop cached results of elements changed by batch `change_id`.
    pub fn invalidate<'a>(&self, element_ids: impl IntoIterator<Item = &'a ElementId>, change_id: u64) {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        for element_id in element_ids {
            cache.entries.remove(element_id);
            cache.element_versions.insert(element_id.clone(), change_id);
        }
    }

    /// Drop every cached result.
    pub fn clear(&self) {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.entries.clear();
        cache.element_versions.clear();
    }

    pub fn stats(&self) -> RestrictionStats {
        let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        RestrictionStats {
            cached_results: cache.entries.values().map(HashMap::len).sum(),
            hits: cache.hits,
            misses: cache.misses,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn element(value: Value) -> Element {
        value.as_object().unwrap().clone()
    }

    fn engine_with(registry: RestrictionRegistry) -> RestrictionEngine {
        // user 1 is a manager, everybody else has no permissions
        RestrictionEngine::new(registry, Arc::new(|user: UserId, _: &str| user == 1))
    }

    #[test]
    fn test_unrestricted_hides_from_anonymous_unless_enabled() {
        let id = ElementId::new("core/tag", 1).unwrap();
        let tag = element(json!({ "id": 1, "name": "Important" }));

        let engine = engine_with(RestrictionRegistry::new());
        assert_eq!(engine.restrict(&id, &tag, 2, 0), Some(tag.clone()));
        assert_eq!(engine.restrict(&id, &tag, ANONYMOUS_USER, 0), None);

        let engine = engine_with(RestrictionRegistry::new()).with_anonymous(true);
        assert_eq!(engine.restrict(&id, &tag, ANONYMOUS_USER, 0), Some(tag));
    }

    #[test]
    fn test_permission_strategies() {
        let registry = RestrictionRegistry::new()
            .register("core/countdown", RestrictionStrategy::Permission("core.can_see_countdowns".into()))
            .register(
                "users/user",
                RestrictionStrategy::PermissionOrFields {
                    permission: "users.can_see_extra_data".into(),
                    fields: vec!["id".into(), "username".into()],
                },
            )
            .register(
                "users/personal-note",
                RestrictionStrategy::OwnerOrPermission {
                    owner_field: "user_id".into(),
                    permission: "users.can_manage".into(),
                },
            );
        let engine = engine_with(registry);

        let countdown_id = ElementId::new("core/countdown", 1).unwrap();
        let countdown = element(json!({ "id": 1, "running": true }));
        assert!(engine.restrict(&countdown_id, &countdown, 1, 0).is_some());
        assert!(engine.restrict(&countdown_id, &countdown, 2, 0).is_none());

        let user_id = ElementId::new("users/user", 3).unwrap();
        let user = element(json!({ "id": 3, "username": "max", "email": "max@example.com" }));
        assert_eq!(engine.restrict(&user_id, &user, 1, 0), Some(user.clone()));
        let limited = engine.restrict(&user_id, &user, 2, 0).unwrap();
        assert_eq!(limited, element(json!({ "id": 3, "username": "max" })));

        let note_id = ElementId::new("users/personal-note", 4).unwrap();
        let note = element(json!({ "id": 4, "user_id": 5, "notes": {} }));
        assert!(engine.restrict(&note_id, &note, 5, 0).is_some());
        assert!(engine.restrict(&note_id, &note, 6, 0).is_none());
        assert!(engine.restrict(&note_id, &note, 1, 0).is_some());
    }

    struct HideArchived;

    impl Restrict for HideArchived {
        fn restrict(&self, element: &Element, _: UserId, _: &dyn PermissionPredicate) -> Option<Element> {
            (element.get("archived") != Some(&Value::Bool(true))).then(|| element.clone())
        }
    }

    #[test]
    fn test_custom_strategy() {
        let registry = RestrictionRegistry::new()
            .register("topics/topic", RestrictionStrategy::Custom(Arc::new(HideArchived)));
        let engine = engine_with(registry);
        let id = ElementId::new("topics/topic", 1).unwrap();
        assert!(engine.restrict(&id, &element(json!({ "id": 1 })), 2, 0).is_some());
        let archived = ElementId::new("topics/topic", 2).unwrap();
        assert!(engine
            .restrict(&archived, &element(json!({ "id": 2, "archived": true })), 2, 0)
            .is_none());
    }

    #[test]
    fn test_results_are_cached_until_invalidated() {
        let engine = engine_with(RestrictionRegistry::new());
        let id = ElementId::new("core/tag", 1).unwrap();
        let old = element(json!({ "id": 1, "name": "old" }));
        let new = element(json!({ "id": 1, "name": "new" }));

        assert_eq!(engine.restrict(&id, &old, 2, 1), Some(old.clone()));
        // Served from cache: data argument is not looked at again.
        assert_eq!(engine.restrict(&id, &new, 2, 1), Some(old.clone()));
        assert_eq!(engine.stats().hits, 1);

        engine.invalidate([&id], 2);
        assert_eq!(engine.restrict(&id, &new, 2, 2), Some(new));
    }

    #[test]
    fn test_invalidate_drops_only_touched_elements() {
        let engine = engine_with(RestrictionRegistry::new());
        let ids: Vec<ElementId> = (1..=2_000)
            .map(|id| ElementId::new("core/tag", id).unwrap())
            .collect();
        let tag = element(json!({ "name": "x" }));
        for user in 1..=10 {
            for id in &ids {
                engine.restrict(id, &tag, user, 1);
            }
        }
        assert_eq!(engine.stats().cached_results, 20_000);

        // Half of the elements in one batch.
        engine.invalidate(ids.iter().step_by(2), 2);
        assert_eq!(engine.stats().cached_results, 10_000);

        let hits = engine.stats().hits;
        engine.restrict(&ids[1], &tag, 3, 2);
        assert_eq!(engine.stats().hits, hits + 1);
        engine.restrict(&ids[0], &tag, 3, 2);
        assert_eq!(engine.stats().hits, hits + 1);
    }

    #[test]
    fn test_stale_insert_is_ignored() {
        let engine = engine_with(RestrictionRegistry::new());
        let id = ElementId::new("core/tag", 1).unwrap();
        let old = element(json!({ "id": 1, "name": "old" }));
        let new = element(json!({ "id": 1, "name": "new" }));

        engine.invalidate([&id], 5);
        // Computed from a read that started at change id 4: not cached.
        engine.restrict(&id, &old, 2, 4);
        assert_eq!(engine.stats().cached_results, 0);
        assert_eq!(engine.restrict(&id, &new, 2, 5), Some(new));
        assert_eq!(engine.stats().cached_results, 1);
    }

    #[test]
    fn test_permission_version_bump_recomputes() {
        let granted = Arc::new(AtomicBool::new(false));
        let flag = granted.clone();
        let registry = RestrictionRegistry::new()
            .register("core/countdown", RestrictionStrategy::Permission("core.can_see".into()));
        let engine = RestrictionEngine::new(
            registry,
            Arc::new(move |_: UserId, _: &str| flag.load(Ordering::SeqCst)),
        );
        let id = ElementId::new("core/countdown", 1).unwrap();
        let countdown = element(json!({ "id": 1 }));

        assert!(engine.restrict(&id, &countdown, 7, 1).is_none());
        granted.store(true, Ordering::SeqCst);
        // Still the cached denial until the permission version moves.
        assert!(engine.restrict(&id, &countdown, 7, 1).is_none());

        engine.bump_permission_version(7);
        assert!(engine.restrict(&id, &countdown, 7, 1).is_some());

        granted.store(false, Ordering::SeqCst);
        engine.bump_all_permission_versions();
        assert!(engine.restrict(&id, &countdown, 7, 1).is_none());
    }

    #[test]
    fn test_clear_drops_everything() {
        let engine = engine_with(RestrictionRegistry::new());
        let id = ElementId::new("core/tag", 1).unwrap();
        engine.restrict(&id, &element(json!({ "id": 1 })), 2, 0);
        assert_eq!(engine.stats().cached_results, 1);
        engine.clear();
        assert_eq!(engine.stats().cached_results, 0);
    }
}
