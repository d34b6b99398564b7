//! Has-one: the single target holds the foreign key.

use super::ensure_accepts;
use crate::command::Command;
use crate::entity::{EntityRef, QueueScope, StoreMode};
use crate::schema::RelationSchema;
use relmap_core::{Result, Value};

#[derive(Debug)]
pub struct HasOne {
    name: String,
    schema: RelationSchema,
    loaded: bool,
    instance: Option<EntityRef>,
    /// Instance replaced since the last save.
    previous: Option<EntityRef>,
}

impl HasOne {
    pub(crate) fn new(name: String, schema: RelationSchema) -> Self {
        Self {
            name,
            schema,
            loaded: false,
            instance: None,
            previous: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schema(&self) -> &RelationSchema {
        &self.schema
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn get(&self) -> Option<EntityRef> {
        self.instance.clone()
    }

    #[allow(clippy::result_large_err)]
    pub fn set(&mut self, entity: Option<EntityRef>) -> Result<()> {
        if let Some(entity) = &entity {
            ensure_accepts(&self.name, &self.schema, entity)?;
        }
        let current = self.instance.take();
        match (&current, &entity) {
            (Some(a), Some(b)) if a.ptr_eq(b) => {}
            (Some(old), _) => {
                if self.previous.is_none() {
                    self.previous = Some(old.clone());
                }
            }
            (None, _) => {}
        }
        if let (Some(previous), Some(new)) = (&self.previous, &entity) {
            if previous.ptr_eq(new) {
                self.previous = None;
            }
        }
        self.instance = entity;
        self.loaded = true;
        Ok(())
    }

    pub(crate) fn install(&mut self, entity: Option<EntityRef>) {
        if !self.loaded {
            self.instance = entity;
            self.loaded = true;
        }
    }
}

/// Detach the replaced target, then store the new target after the owner,
/// keyed by the owner.
#[allow(clippy::result_large_err)]
pub(crate) fn queue(
    owner: &EntityRef,
    index: usize,
    command: &mut Command,
    scope: &mut QueueScope,
) -> Result<()> {
    let Some((schema, instance, previous)) = owner.relation_at(index, |relation| match relation {
        super::Relation::HasOne(r) => Some((r.schema.clone(), r.instance.clone(), r.previous.take())),
        _ => None,
    }) else {
        return Ok(());
    };

    if let Some(previous) = previous.clone() {
        let owner = owner.clone();
        command.on_rollback(move |_| {
            owner.relation_at(index, |relation| {
                if let super::Relation::HasOne(r) = relation {
                    r.previous.get_or_insert(previous);
                }
            });
        });
    }

    // The replaced target lets go of the owner before the new one claims it.
    if let Some(previous) = previous {
        if previous.state().is_loaded() {
            let detach = if schema.nullable {
                let mut detach =
                    previous.queue_store_scoped(StoreMode::contextual(false), scope)?;
                detach.add_context(schema.outer_key.clone(), Value::Null);
                detach
            } else {
                previous.queue_delete()?
            };
            command.push_after(detach);
        }
    }

    let owner_key = owner.key_bind(&schema.inner_key);
    if let Some(child) = &instance {
        let needs = !child.holds(&schema.outer_key, &owner_key);
        let mut child_command = child.queue_store_scoped(
            StoreMode {
                with_relations: true,
                force_context: needs,
            },
            scope,
        )?;
        if needs {
            child_command.add_context(schema.outer_key.clone(), owner_key.clone());
        }
        command.push_after(child_command);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::entity::{EntityRef, EntityState};
    use crate::graph::CommandGraph;
    use crate::schema::{EntitySchema, RelationSchema};
    use crate::test_support::{MockConnection, unwrap_outcome};
    use asupersync::Cx;
    use asupersync::runtime::RuntimeBuilder;
    use relmap_core::Value;
    use std::sync::Arc;

    fn schemas(nullable: bool) -> (Arc<EntitySchema>, Arc<EntitySchema>) {
        let user = EntitySchema::builder("user")
            .table("users")
            .primary_key("id")
            .column("name")
            .relation(
                "profile",
                RelationSchema::has_one("profile", "id", "user_id").nullable(nullable),
            )
            .build()
            .unwrap();
        let profile = EntitySchema::builder("profile")
            .table("profiles")
            .primary_key("id")
            .column("bio")
            .column("user_id")
            .build()
            .unwrap();
        (Arc::new(user), Arc::new(profile))
    }

    #[test]
    fn test_child_receives_generated_owner_id() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let conn = MockConnection::new();
        conn.set_next_insert_id(5);

        let (user_schema, profile_schema) = schemas(true);
        let user = EntityRef::new(user_schema);
        user.set("name", "Ann").unwrap();
        let profile = EntityRef::new(profile_schema);
        profile.set("bio", "hi").unwrap();
        user.set_related("profile", Some(profile.clone())).unwrap();

        let mut graph = CommandGraph::new();
        graph.store(&user, true).unwrap();
        assert_eq!(graph.labels(), ["insert into users", "insert into profiles"]);
        unwrap_outcome(rt.block_on(graph.run(&cx, &conn)));

        let writes = conn.writes();
        assert_eq!(
            writes[1].0,
            r#"INSERT INTO "profiles" ("bio", "user_id") VALUES ($1, $2) RETURNING "id""#
        );
        assert_eq!(writes[1].1, vec![Value::from("hi"), Value::BigInt(5)]);
        assert_eq!(profile.get("user_id"), Some(Value::BigInt(5)));
        assert_eq!(profile.state(), EntityState::Loaded);
    }

    #[test]
    fn test_replaced_child_is_detached() {
        let (user_schema, profile_schema) = schemas(true);
        let user = EntityRef::loaded(user_schema, &[("id".to_string(), Value::BigInt(1))]);
        let old = EntityRef::loaded(
            Arc::clone(&profile_schema),
            &[
                ("id".to_string(), Value::BigInt(7)),
                ("user_id".to_string(), Value::BigInt(1)),
            ],
        );
        user.set_related("profile", Some(old.clone())).unwrap();
        let new = EntityRef::new(profile_schema);
        user.set_related("profile", Some(new)).unwrap();

        let command = user.queue_store(true).unwrap();
        assert_eq!(
            command.labels(),
            ["noop users", "update profiles", "insert into profiles"]
        );
    }

    #[test]
    fn test_replaced_child_lets_go_before_the_new_child_is_written() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let conn = MockConnection::new();
        conn.set_next_insert_id(8);

        let (user_schema, profile_schema) = schemas(true);
        let user = EntityRef::loaded(user_schema, &[("id".to_string(), Value::BigInt(1))]);
        let old = EntityRef::loaded(
            Arc::clone(&profile_schema),
            &[
                ("id".to_string(), Value::BigInt(7)),
                ("user_id".to_string(), Value::BigInt(1)),
            ],
        );
        user.set_related("profile", Some(old.clone())).unwrap();
        let new = EntityRef::new(profile_schema);
        user.set_related("profile", Some(new.clone())).unwrap();

        let mut graph = CommandGraph::new();
        graph.store(&user, true).unwrap();
        unwrap_outcome(rt.block_on(graph.run(&cx, &conn)));

        let writes = conn.writes();
        assert_eq!(writes.len(), 2);
        assert_eq!(
            writes[0].0,
            r#"UPDATE "profiles" SET "user_id" = $1 WHERE "id" = $2"#
        );
        assert_eq!(writes[0].1, vec![Value::Null, Value::BigInt(7)]);
        assert_eq!(
            writes[1].0,
            r#"INSERT INTO "profiles" ("bio", "user_id") VALUES ($1, $2) RETURNING "id""#
        );
        assert_eq!(writes[1].1, vec![Value::Null, Value::BigInt(1)]);
        assert_eq!(old.get("user_id"), Some(Value::Null));
        assert_eq!(new.primary_key(), Some(Value::BigInt(8)));
    }

    #[test]
    fn test_replaced_child_is_deleted_when_not_nullable() {
        let (user_schema, profile_schema) = schemas(false);
        let user = EntityRef::loaded(user_schema, &[("id".to_string(), Value::BigInt(1))]);
        let old = EntityRef::loaded(
            Arc::clone(&profile_schema),
            &[
                ("id".to_string(), Value::BigInt(7)),
                ("user_id".to_string(), Value::BigInt(1)),
            ],
        );
        user.set_related("profile", Some(old.clone())).unwrap();
        user.set_related("profile", None).unwrap();

        let command = user.queue_store(true).unwrap();
        assert_eq!(command.labels(), ["noop users", "delete from profiles"]);
        assert_eq!(old.state(), EntityState::ScheduledDelete);
    }
}
