//! Versioned copy-on-write store of resource group configs.
//!
//! Every commit builds a fresh [`RegistrySnapshot`] (an id-keyed arena of
//! `Arc<GroupConfig>` plus a name index) and publishes it by swapping one
//! `Arc`. Readers clone the current snapshot pointer and never observe a
//! half-applied statement. Writers serialize on a commit lock.
//!
//! Configs untouched by a commit keep their `Arc` identity across versions,
//! so downstream caches can detect changes with [`Arc::ptr_eq`].

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};

use crate::error::GroupError;
use crate::group::{DEFAULT_GROUP_ID, GroupConfig, normalize_group_name};
use crate::options::{AlterOption, apply_options};

// =============================================================================
// Dependency checks
// =============================================================================

/// Reports user objects that still reference a group. Backed by the external
/// privilege catalog.
pub trait DependencyChecker: Send + Sync {
    /// Names of users bound to `group`. Empty when the group can be dropped.
    fn dependents(&self, group: &str) -> Vec<String>;
}

/// Checker for deployments without user bindings.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDependencies;

impl DependencyChecker for NoDependencies {
    fn dependents(&self, _group: &str) -> Vec<String> {
        Vec::new()
    }
}

/// Static user → group bindings, handy for embedding and tests.
#[derive(Debug, Default)]
pub struct StaticBindings {
    bindings: RwLock<HashMap<String, String>>,
}

impl StaticBindings {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `user` to `group`, replacing any previous binding.
    pub fn bind(&self, user: &str, group: &str) {
        self.bindings
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(user.to_string(), group.trim().to_lowercase());
    }

    pub fn unbind(&self, user: &str) {
        self.bindings
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(user);
    }
}

impl DependencyChecker for StaticBindings {
    fn dependents(&self, group: &str) -> Vec<String> {
        let guard = self.bindings.read().unwrap_or_else(|e| e.into_inner());
        let mut users: Vec<String> = guard
            .iter()
            .filter(|(_, g)| g.as_str() == group)
            .map(|(u, _)| u.clone())
            .collect();
        users.sort();
        users
    }
}

// =============================================================================
// Snapshot
// =============================================================================

/// One committed registry version.
#[derive(Debug, Clone)]
pub struct RegistrySnapshot {
    version: u64,
    groups: BTreeMap<u64, Arc<GroupConfig>>,
    by_name: HashMap<String, u64>,
}

impl RegistrySnapshot {
    fn initial() -> Self {
        let default = Arc::new(GroupConfig::default_group());
        let mut groups = BTreeMap::new();
        groups.insert(DEFAULT_GROUP_ID, default);
        let mut snapshot = Self {
            version: 1,
            groups,
            by_name: HashMap::new(),
        };
        snapshot.reindex();
        snapshot
    }

    fn reindex(&mut self) {
        self.by_name = self
            .groups
            .iter()
            .map(|(id, cfg)| (cfg.name.clone(), *id))
            .collect();
    }

    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Case-insensitive lookup.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<GroupConfig>> {
        let key = name.trim().to_lowercase();
        self.by_name
            .get(&key)
            .and_then(|id| self.groups.get(id))
            .cloned()
    }

    #[must_use]
    pub fn get_by_id(&self, id: u64) -> Option<Arc<GroupConfig>> {
        self.groups.get(&id).cloned()
    }

    /// All groups ordered by name.
    #[must_use]
    pub fn list(&self) -> Vec<Arc<GroupConfig>> {
        let mut groups: Vec<_> = self.groups.values().cloned().collect();
        groups.sort_by(|a, b| a.name.cmp(&b.name));
        groups
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

// =============================================================================
// DDL outcome
// =============================================================================

/// Result of a successful DDL call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DdlOutcome {
    /// A new or altered config was committed.
    Committed { group: Arc<GroupConfig>, version: u64 },
    /// The group was removed.
    Dropped { name: String, version: u64 },
    /// Nothing changed; `IF [NOT] EXISTS` turned an error into this warning.
    Skipped { warning: String },
}

impl DdlOutcome {
    #[must_use]
    pub fn warning(&self) -> Option<&str> {
        match self {
            Self::Skipped { warning } => Some(warning),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped { .. })
    }
}

// =============================================================================
// GroupRegistry
// =============================================================================

/// Owner of every [`GroupConfig`]. Always contains the default group.
pub struct GroupRegistry {
    current: RwLock<Arc<RegistrySnapshot>>,
    /// Serializes writers; holds the next id to assign.
    commit: Mutex<u64>,
    dependencies: Arc<dyn DependencyChecker>,
}

impl std::fmt::Debug for GroupRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupRegistry")
            .field("version", &self.version())
            .finish()
    }
}

impl Default for GroupRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl GroupRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::with_dependency_checker(Arc::new(NoDependencies))
    }

    #[must_use]
    pub fn with_dependency_checker(dependencies: Arc<dyn DependencyChecker>) -> Self {
        Self {
            current: RwLock::new(Arc::new(RegistrySnapshot::initial())),
            commit: Mutex::new(DEFAULT_GROUP_ID + 1),
            dependencies,
        }
    }

    /// Latest committed snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        Arc::clone(&self.current.read().unwrap_or_else(|e| e.into_inner()))
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<GroupConfig>> {
        self.snapshot().get(name)
    }

    #[must_use]
    pub fn list(&self) -> Vec<Arc<GroupConfig>> {
        self.snapshot().list()
    }

    #[must_use]
    pub fn version(&self) -> u64 {
        self.snapshot().version()
    }

    fn publish(&self, next: RegistrySnapshot) -> u64 {
        let version = next.version;
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(next);
        version
    }

    /// Create a group from a fully built config. The config's `id` is ignored
    /// and assigned here.
    pub fn create(&self, config: GroupConfig, if_not_exists: bool) -> Result<DdlOutcome, GroupError> {
        let mut next_id = self.commit.lock().unwrap_or_else(|e| e.into_inner());
        let base = self.snapshot();

        if base.get(&config.name).is_some() {
            let err = GroupError::AlreadyExists(config.name.clone());
            if if_not_exists {
                tracing::warn!(group = %config.name, "create skipped: group already exists");
                return Ok(DdlOutcome::Skipped {
                    warning: err.to_string(),
                });
            }
            return Err(err);
        }
        config.validate()?;

        let mut config = config;
        config.id = *next_id;
        *next_id += 1;
        let group = Arc::new(config);

        let mut next = (*base).clone();
        next.version += 1;
        next.groups.insert(group.id, Arc::clone(&group));
        next.reindex();
        let version = self.publish(next);

        tracing::info!(
            group = %group.name,
            id = group.id,
            version,
            ru_per_sec = %group.ru_rate,
            "resource group created"
        );
        Ok(DdlOutcome::Committed { group, version })
    }

    /// `CREATE RESOURCE GROUP [IF NOT EXISTS] name options...`
    pub fn create_with_options(
        &self,
        name: &str,
        options: &[AlterOption],
        if_not_exists: bool,
    ) -> Result<DdlOutcome, GroupError> {
        let normalized = normalize_group_name(name)?;
        if if_not_exists && self.get(&normalized).is_some() {
            tracing::warn!(group = %normalized, "create skipped: group already exists");
            return Ok(DdlOutcome::Skipped {
                warning: GroupError::AlreadyExists(normalized).to_string(),
            });
        }
        let config = GroupConfig::from_options(&normalized, options)?;
        self.create(config, if_not_exists)
    }

    /// `ALTER RESOURCE GROUP [IF EXISTS] name options...`
    ///
    /// The whole option list is validated before anything is applied.
    pub fn alter(
        &self,
        name: &str,
        options: &[AlterOption],
        if_exists: bool,
    ) -> Result<DdlOutcome, GroupError> {
        let _guard = self.commit.lock().unwrap_or_else(|e| e.into_inner());
        let base = self.snapshot();
        let key = name.trim().to_lowercase();

        let Some(current) = base.get(&key) else {
            let err = GroupError::NotExists(key);
            if if_exists {
                tracing::warn!(group = %name, "alter skipped: group does not exist");
                return Ok(DdlOutcome::Skipped {
                    warning: err.to_string(),
                });
            }
            return Err(err);
        };

        let altered = apply_options(&current, options)?;
        if altered == *current {
            tracing::debug!(group = %key, "alter is a no-op");
            return Ok(DdlOutcome::Committed {
                group: current,
                version: base.version,
            });
        }

        let group = Arc::new(altered);
        let mut next = (*base).clone();
        next.version += 1;
        next.groups.insert(group.id, Arc::clone(&group));
        let version = self.publish(next);

        tracing::info!(group = %group.name, version, "resource group altered");
        Ok(DdlOutcome::Committed { group, version })
    }

    /// `DROP RESOURCE GROUP [IF EXISTS] name`
    pub fn drop_group(&self, name: &str, if_exists: bool) -> Result<DdlOutcome, GroupError> {
        let _guard = self.commit.lock().unwrap_or_else(|e| e.into_inner());
        let base = self.snapshot();
        let key = name.trim().to_lowercase();

        let Some(current) = base.get(&key) else {
            let err = GroupError::NotExists(key);
            if if_exists {
                tracing::warn!(group = %name, "drop skipped: group does not exist");
                return Ok(DdlOutcome::Skipped {
                    warning: err.to_string(),
                });
            }
            return Err(err);
        };
        if current.is_default() {
            return Err(GroupError::UnsupportedOperation(
                "can't drop reserved resource group".to_string(),
            ));
        }
        let dependents = self.dependencies.dependents(&current.name);
        if !dependents.is_empty() {
            return Err(GroupError::DependentObjectExists {
                group: current.name.clone(),
                dependents,
            });
        }

        let mut next = (*base).clone();
        next.version += 1;
        next.groups.remove(&current.id);
        next.reindex();
        let version = self.publish(next);

        tracing::info!(group = %current.name, version, "resource group dropped");
        Ok(DdlOutcome::Dropped {
            name: current.name.clone(),
            version,
        })
    }
}
