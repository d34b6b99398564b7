//! Has-many: every member holds the foreign key.

use super::{contains, ensure_accepts, take_out};
use crate::command::Command;
use crate::entity::{EntityRef, QueueScope, StoreMode};
use crate::schema::RelationSchema;
use relmap_core::{Error, Result, Value};

#[derive(Debug)]
pub struct HasMany {
    name: String,
    schema: RelationSchema,
    loaded: bool,
    instances: Vec<EntityRef>,
    added: Vec<EntityRef>,
    removed: Vec<EntityRef>,
}

impl HasMany {
    pub(crate) fn new(name: String, schema: RelationSchema) -> Self {
        Self {
            name,
            schema,
            loaded: false,
            instances: Vec::new(),
            added: Vec::new(),
            removed: Vec::new(),
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

    pub fn instances(&self) -> &[EntityRef] {
        &self.instances
    }

    pub fn iter(&self) -> impl Iterator<Item = &EntityRef> {
        self.instances.iter()
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Attach `entity`; attaching a current member is a no-op.
    #[allow(clippy::result_large_err)]
    pub fn add(&mut self, entity: EntityRef) -> Result<()> {
        ensure_accepts(&self.name, &self.schema, &entity)?;
        if contains(&self.instances, &entity) {
            return Ok(());
        }
        if !take_out(&mut self.removed, &entity) {
            self.added.push(entity.clone());
        }
        self.instances.push(entity);
        Ok(())
    }

    /// Detach a current member.
    #[allow(clippy::result_large_err)]
    pub fn delete(&mut self, entity: &EntityRef) -> Result<()> {
        if !take_out(&mut self.instances, entity) {
            return Err(Error::relation(
                self.name.clone(),
                "entity is not a member of the relation",
            ));
        }
        if !take_out(&mut self.added, entity) {
            self.removed.push(entity.clone());
        }
        Ok(())
    }

    /// Install fetched members, keeping local additions and removals.
    pub(crate) fn install(&mut self, entities: Vec<EntityRef>) {
        if self.loaded {
            return;
        }
        let mut instances: Vec<EntityRef> = entities
            .into_iter()
            .filter(|e| !contains(&self.removed, e))
            .collect();
        for added in &self.added {
            if !contains(&instances, added) {
                instances.push(added.clone());
            }
        }
        self.instances = instances;
        self.loaded = true;
    }

    fn restore(&mut self, added: Vec<EntityRef>, removed: Vec<EntityRef>) {
        for entity in added {
            if !contains(&self.added, &entity) && contains(&self.instances, &entity) {
                self.added.push(entity);
            }
        }
        for entity in removed {
            if !contains(&self.removed, &entity) && !contains(&self.instances, &entity) {
                self.removed.push(entity);
            }
        }
    }
}

/// Store every member after the owner and detach removed members.
#[allow(clippy::result_large_err)]
pub(crate) fn queue(
    owner: &EntityRef,
    index: usize,
    command: &mut Command,
    scope: &mut QueueScope,
) -> Result<()> {
    let Some((schema, instances, added, removed)) =
        owner.relation_at(index, |relation| match relation {
            super::Relation::HasMany(r) => Some((
                r.schema.clone(),
                r.instances.clone(),
                std::mem::take(&mut r.added),
                std::mem::take(&mut r.removed),
            )),
            _ => None,
        })
    else {
        return Ok(());
    };

    if !added.is_empty() || !removed.is_empty() {
        let owner = owner.clone();
        let (added, removed) = (added.clone(), removed.clone());
        command.on_rollback(move |_| {
            owner.relation_at(index, |relation| {
                if let super::Relation::HasMany(r) = relation {
                    r.restore(added, removed);
                }
            });
        });
    }

    let owner_key = owner.key_bind(&schema.inner_key);
    for member in &instances {
        let attached = contains(&added, member);
        let needs = attached || !member.holds(&schema.outer_key, &owner_key);
        let mut member_command = member.queue_store_scoped(
            StoreMode {
                with_relations: true,
                force_context: needs,
            },
            scope,
        )?;
        if needs {
            member_command.add_context(schema.outer_key.clone(), owner_key.clone());
            if attached {
                for (column, value) in &schema.where_eq {
                    member_command.add_context(column.clone(), value.clone());
                }
            }
        }
        command.push_after(member_command);
    }

    for member in removed {
        if !member.state().is_loaded() {
            continue;
        }
        let detach = if schema.nullable {
            let mut detach = member.queue_store_scoped(StoreMode::contextual(false), scope)?;
            detach.add_context(schema.outer_key.clone(), Value::Null);
            detach
        } else {
            member.queue_delete()?
        };
        command.push_after(detach);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::entity::{EntityRef, EntityState};
    use crate::graph::CommandGraph;
    use crate::relation::Criteria;
    use crate::schema::{EntitySchema, RelationSchema};
    use crate::test_support::{MockConnection, unwrap_outcome};
    use asupersync::Cx;
    use asupersync::runtime::RuntimeBuilder;
    use relmap_core::{Error, Value};
    use std::sync::Arc;

    fn schemas(nullable: bool) -> (Arc<EntitySchema>, Arc<EntitySchema>) {
        let user = EntitySchema::builder("user")
            .table("users")
            .primary_key("id")
            .column("name")
            .relation(
                "posts",
                RelationSchema::has_many("post", "id", "user_id")
                    .nullable(nullable)
                    .where_eq("published", true),
            )
            .build()
            .unwrap();
        let post = EntitySchema::builder("post")
            .table("posts")
            .primary_key("id")
            .column("title")
            .column("user_id")
            .column_default("published", false)
            .build()
            .unwrap();
        (Arc::new(user), Arc::new(post))
    }

    fn post(schema: &Arc<EntitySchema>, id: i64, user_id: i64) -> EntityRef {
        EntityRef::loaded(
            Arc::clone(schema),
            &[
                ("id".to_string(), Value::BigInt(id)),
                ("title".to_string(), Value::from(format!("post {id}"))),
                ("user_id".to_string(), Value::BigInt(user_id)),
            ],
        )
    }

    #[test]
    fn test_members_are_inserted_after_the_owner() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let conn = MockConnection::new();
        conn.set_next_insert_id(1);

        let (user_schema, post_schema) = schemas(true);
        let user = EntityRef::new(user_schema);
        user.set("name", "Ann").unwrap();
        for title in ["a", "b"] {
            let post = EntityRef::new(Arc::clone(&post_schema));
            post.set("title", title).unwrap();
            user.add("posts", post).unwrap();
        }

        let mut graph = CommandGraph::new();
        graph.store(&user, true).unwrap();
        assert_eq!(
            graph.labels(),
            ["insert into users", "insert into posts", "insert into posts"]
        );
        unwrap_outcome(rt.block_on(graph.run(&cx, &conn)));

        let writes = conn.writes();
        assert_eq!(
            writes[1].0,
            r#"INSERT INTO "posts" ("title", "user_id", "published") VALUES ($1, $2, $3) RETURNING "id""#
        );
        assert_eq!(
            writes[1].1,
            vec![Value::from("a"), Value::BigInt(1), Value::Bool(true)]
        );
        for member in user.related_many("posts").unwrap() {
            assert_eq!(member.get("user_id"), Some(Value::BigInt(1)));
            assert_eq!(member.state(), EntityState::Loaded);
        }
    }

    #[test]
    fn test_removed_member_is_nulled_and_retained_member_untouched() {
        let (user_schema, post_schema) = schemas(true);
        let user = EntityRef::loaded(user_schema, &[("id".to_string(), Value::BigInt(1))]);
        let keep = post(&post_schema, 1, 1);
        let gone = post(&post_schema, 2, 1);
        user.with_relation("posts", |r| {
            r.install(crate::relation::Loaded::Many(vec![keep.clone(), gone.clone()]));
            Ok(())
        })
        .unwrap();

        user.remove("posts", &gone).unwrap();
        assert_eq!(user.related_many("posts").unwrap().len(), 1);

        let command = user.queue_store(true).unwrap();
        assert_eq!(command.labels(), ["noop users", "noop posts", "update posts"]);
    }

    #[test]
    fn test_removed_member_is_deleted_when_not_nullable() {
        let (user_schema, post_schema) = schemas(false);
        let user = EntityRef::loaded(user_schema, &[("id".to_string(), Value::BigInt(1))]);
        let gone = post(&post_schema, 2, 1);
        user.with_relation("posts", |r| {
            r.install(crate::relation::Loaded::Many(vec![gone.clone()]));
            Ok(())
        })
        .unwrap();
        user.remove("posts", &gone).unwrap();

        let mut graph = CommandGraph::new();
        graph.store(&user, true).unwrap();
        assert_eq!(graph.labels(), ["noop users", "delete from posts"]);
        assert_eq!(gone.state(), EntityState::ScheduledDelete);

        // Discarding the graph restores both the member and the pending removal.
        graph.rollback();
        assert_eq!(gone.state(), EntityState::Loaded);
        assert_eq!(
            user.queue_store(true).unwrap().labels(),
            ["noop users", "delete from posts"]
        );
    }

    #[test]
    fn test_matching_and_membership() {
        let (user_schema, post_schema) = schemas(true);
        let user = EntityRef::loaded(user_schema, &[("id".to_string(), Value::BigInt(1))]);
        let first = post(&post_schema, 1, 1);
        let second = post(&post_schema, 2, 1);
        user.add("posts", first.clone()).unwrap();
        user.add("posts", second.clone()).unwrap();
        user.add("posts", first.clone()).unwrap();
        assert_eq!(user.related_many("posts").unwrap().len(), 2);

        assert!(user.has("posts", &Criteria::Entity(second.clone())).unwrap());
        let found = user
            .match_one("posts", &Criteria::PrimaryKey(Value::Int(2)))
            .unwrap()
            .unwrap();
        assert!(found.ptr_eq(&second));
        assert_eq!(
            user.match_multiple("posts", &Criteria::field("user_id", 1_i64))
                .unwrap()
                .len(),
            2
        );

        let stranger = post(&post_schema, 3, 9);
        assert!(matches!(
            user.remove("posts", &stranger),
            Err(Error::Relation(_))
        ));
    }
}
