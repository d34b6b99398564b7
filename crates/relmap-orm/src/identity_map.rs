//! Entity map: one live instance per (role, primary key) within a session.
//!
//! A map is created by the caller for one loading session and dropped with
//! it. Two maps never share instances, so loading the same row through two
//! sessions yields two distinct entities.
//!
//! # Example
//!
//! ```ignore
//! let mut map = orm.entity_map();
//!
//! let a = orm.select("user")?.find_by_pk(&cx, &mut map, 1_i64).await;
//! let b = orm.select("user")?.find_by_pk(&cx, &mut map, 1_i64).await;
//!
//! // Both references point to the same entity
//! assert!(a.unwrap().ptr_eq(&b.unwrap()));
//! ```

use crate::entity::EntityRef;
use relmap_core::{CacheError, Error, Result, Value};
use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Hash a slice of values for use as a key.
///
/// Integer widths hash alike so that `Int(1)` and `BigInt(1)` address the
/// same entry, matching [`Value::loosely_eq`].
pub(crate) fn hash_values(values: &[Value]) -> u64 {
    let mut hasher = DefaultHasher::new();
    for v in values {
        hash_single_value(v, &mut hasher);
    }
    hasher.finish()
}

fn hash_single_value(v: &Value, hasher: &mut impl Hasher) {
    match v {
        Value::Null => 0u8.hash(hasher),
        Value::Bool(b) => (1u8, b).hash(hasher),
        Value::Int(_) | Value::BigInt(_) => (2u8, v.as_i64()).hash(hasher),
        Value::Double(f) => (3u8, f.to_bits()).hash(hasher),
        Value::Text(s) => (4u8, s).hash(hasher),
        Value::Bytes(b) => (5u8, b).hash(hasher),
        Value::Json(j) => (6u8, j.to_string()).hash(hasher),
    }
}

fn same_key(a: &[Value], b: &[Value]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.loosely_eq(y))
}

struct MapEntry {
    entity: EntityRef,
    pk_values: Vec<Value>,
}

/// Session-scoped identity map keyed by (role, primary key).
pub struct EntityMap {
    entries: HashMap<(String, u64), MapEntry>,
    limit: Option<usize>,
}

impl Default for EntityMap {
    fn default() -> Self {
        Self::new(None)
    }
}

impl std::fmt::Debug for EntityMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityMap")
            .field("len", &self.entries.len())
            .field("limit", &self.limit)
            .finish()
    }
}

impl EntityMap {
    /// Create an empty map, optionally bounded.
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            entries: HashMap::new(),
            limit,
        }
    }

    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    /// Remember `entity` under `(role, pk)`.
    ///
    /// Replacing an existing entry never counts against the limit. A new
    /// entry past the limit is a cache error unless `ignore_limit` is set.
    #[allow(clippy::result_large_err)]
    pub fn remember(
        &mut self,
        role: &str,
        pk: &[Value],
        entity: EntityRef,
        ignore_limit: bool,
    ) -> Result<()> {
        let key = (role.to_string(), hash_values(pk));
        if !self.entries.contains_key(&key) {
            if let Some(limit) = self.limit {
                if self.entries.len() >= limit && !ignore_limit {
                    return Err(Error::Cache(CacheError {
                        limit,
                        message: format!(
                            "entity cache limit of {} reached while remembering '{}'",
                            limit, role
                        ),
                    }));
                }
            }
        }
        tracing::trace!(role, "remembering entity");
        self.entries.insert(
            key,
            MapEntry {
                entity,
                pk_values: pk.to_vec(),
            },
        );
        Ok(())
    }

    /// Get the live instance for `(role, pk)`.
    pub fn get(&self, role: &str, pk: &[Value]) -> Option<EntityRef> {
        self.entries
            .get(&(role.to_string(), hash_values(pk)))
            .filter(|entry| same_key(&entry.pk_values, pk))
            .map(|entry| entry.entity.clone())
    }

    pub fn has(&self, role: &str, pk: &[Value]) -> bool {
        self.get(role, pk).is_some()
    }

    /// Forget `(role, pk)`, returning the instance if it was present.
    pub fn forget(&mut self, role: &str, pk: &[Value]) -> Option<EntityRef> {
        let key = (role.to_string(), hash_values(pk));
        match self.entries.get(&key) {
            Some(entry) if same_key(&entry.pk_values, pk) => {
                self.entries.remove(&key).map(|entry| entry.entity)
            }
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every remembered instance.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
