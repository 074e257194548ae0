//! JSON fixture standing in for the primary store.
//!
//! ```json
//! {
//!   "data": { "core/tag": [{ "id": 1, "name": "Important" }] },
//!   "tokens": { "s3cret": 1 },
//!   "permissions": { "1": ["motions.can_see"] },
//!   "restrictions": {
//!     "motions/motion": { "type": "permission", "permission": "motions.can_see" }
//!   }
//! }
//! ```

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

use assembly_cache::{
    AuthError, Authenticate, Element, PermissionPredicate, Populate, PopulateError,
    RestrictionRegistry, RestrictionStrategy, UserId,
};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RestrictionRule {
    Unrestricted,
    Permission {
        permission: String,
    },
    PermissionOrFields {
        permission: String,
        fields: Vec<String>,
    },
    OwnerOrPermission {
        owner_field: String,
        permission: String,
    },
}

impl From<RestrictionRule> for RestrictionStrategy {
    fn from(rule: RestrictionRule) -> Self {
        match rule {
            RestrictionRule::Unrestricted => RestrictionStrategy::Unrestricted,
            RestrictionRule::Permission { permission } => RestrictionStrategy::Permission(permission),
            RestrictionRule::PermissionOrFields { permission, fields } => {
                RestrictionStrategy::PermissionOrFields { permission, fields }
            }
            RestrictionRule::OwnerOrPermission {
                owner_field,
                permission,
            } => RestrictionStrategy::OwnerOrPermission {
                owner_field,
                permission,
            },
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct Fixture {
    #[serde(default)]
    pub data: BTreeMap<String, Vec<Element>>,
    /// session token → user id
    #[serde(default)]
    pub tokens: HashMap<String, UserId>,
    /// user id → granted permissions
    #[serde(default)]
    pub permissions: HashMap<UserId, HashSet<String>>,
    #[serde(default)]
    pub restrictions: BTreeMap<String, RestrictionRule>,
}

impl Fixture {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read fixture {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("parse fixture {}", path.display()))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn registry(&self) -> RestrictionRegistry {
        self.restrictions
            .iter()
            .fold(RestrictionRegistry::new(), |registry, (collection, rule)| {
                registry.register(collection.clone(), rule.clone().into())
            })
    }

    pub fn element_count(&self) -> usize {
        self.data.values().map(Vec::len).sum()
    }
}

impl PermissionPredicate for Fixture {
    fn has_perm(&self, user_id: UserId, permission: &str) -> bool {
        self.permissions
            .get(&user_id)
            .is_some_and(|granted| granted.contains(permission))
    }
}

impl Authenticate for Fixture {
    fn authenticate(&self, token: Option<&str>) -> Result<UserId, AuthError> {
        self.tokens.authenticate(token)
    }
}

#[async_trait]
impl Populate for Fixture {
    async fn full_data(&self) -> Result<BTreeMap<String, Vec<Element>>, PopulateError> {
        Ok(self.data.clone())
    }
}
