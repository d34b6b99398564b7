//! Parsed records to live entities.

use crate::entity::EntityRef;
use crate::identity_map::EntityMap;
use crate::node::{ParsedRecord, ParsedRelation};
use crate::relation::Loaded;
use crate::schema::{RelationSchema, SchemaRegistry};
use relmap_core::{Error, Result, Value};

/// Turns [`ParsedRecord`] trees into entities through one [`EntityMap`].
///
/// A record whose primary key is already mapped reuses the mapped instance;
/// only its relations that are not loaded yet are hydrated from the record.
pub struct Materializer<'a> {
    registry: &'a SchemaRegistry,
    map: &'a mut EntityMap,
    ignore_limit: bool,
}

impl<'a> Materializer<'a> {
    pub fn new(registry: &'a SchemaRegistry, map: &'a mut EntityMap, ignore_limit: bool) -> Self {
        Self {
            registry,
            map,
            ignore_limit,
        }
    }

    #[allow(clippy::result_large_err)]
    pub fn all(&mut self, role: &str, records: &[ParsedRecord]) -> Result<Vec<EntityRef>> {
        records.iter().map(|r| self.entity(role, r)).collect()
    }

    /// The entity for one record.
    #[allow(clippy::result_large_err)]
    pub fn entity(&mut self, role: &str, record: &ParsedRecord) -> Result<EntityRef> {
        let schema = self.registry.get(role)?;
        let pk: Vec<Value> = schema
            .primary_key()
            .iter()
            .map(|c| record.get(c).cloned().unwrap_or(Value::Null))
            .collect();
        let cacheable = !pk.is_empty() && !pk.iter().any(Value::is_null);

        if cacheable {
            if let Some(existing) = self.map.get(role, &pk) {
                tracing::trace!(role, "entity map hit");
                self.hydrate(&existing, record)?;
                return Ok(existing);
            }
        }

        let entity = EntityRef::loaded(schema, &record.values);
        if cacheable {
            self.map
                .remember(role, &pk, entity.clone(), self.ignore_limit)?;
        }
        self.hydrate(&entity, record)?;
        Ok(entity)
    }

    /// Install the record's relations into proxies not loaded yet.
    #[allow(clippy::result_large_err)]
    pub(crate) fn hydrate(&mut self, entity: &EntityRef, record: &ParsedRecord) -> Result<()> {
        let schema = std::sync::Arc::clone(entity.schema());
        for (name, parsed) in &record.relations {
            let Some(relation) = schema.relation(name) else {
                return Err(Error::record(
                    schema.role(),
                    format!("unknown relation '{}'", name),
                ));
            };
            if entity.is_relation_loaded(name)? {
                continue;
            }
            let data = self.relation(relation, parsed)?;
            entity.with_relation(name, |r| {
                r.install(data);
                Ok(())
            })?;
        }
        Ok(())
    }

    /// Entities for a parsed relation, in row order.
    #[allow(clippy::result_large_err)]
    pub(crate) fn relation(
        &mut self,
        relation: &RelationSchema,
        parsed: &ParsedRelation,
    ) -> Result<Loaded> {
        let target = relation.target();
        Ok(match parsed {
            ParsedRelation::Single(record) => Loaded::Single(
                record
                    .as_deref()
                    .map(|r| self.entity(target, r))
                    .transpose()?,
            ),
            ParsedRelation::Many(records) => Loaded::Many(self.all(target, records)?),
            ParsedRelation::Pivoted(links) => {
                let keys: Vec<&str> = relation
                    .pivot
                    .as_ref()
                    .map(|p| vec![p.inner_key.as_str(), p.outer_key.as_str()])
                    .unwrap_or_default();
                let mut entities = Vec::with_capacity(links.len());
                for link in links {
                    let entity = self.entity(target, &link.record)?;
                    let pivot = link
                        .pivot
                        .iter()
                        .filter(|(c, _)| !keys.contains(&c.as_str()))
                        .cloned()
                        .collect();
                    entities.push((entity, pivot));
                }
                Loaded::Pivoted(entities)
            }
        })
    }
}

impl Loaded {
    /// The related entities, without pivot data.
    pub(crate) fn entities(&self) -> Vec<EntityRef> {
        match self {
            Loaded::Single(entity) => entity.iter().cloned().collect(),
            Loaded::Many(entities) => entities.clone(),
            Loaded::Pivoted(links) => links.iter().map(|(e, _)| e.clone()).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::PivotedRecord;
    use crate::schema::{EntitySchema, PivotSchema};

    fn registry() -> SchemaRegistry {
        SchemaRegistry::new()
            .with(
                EntitySchema::builder("post")
                    .table("posts")
                    .primary_key("id")
                    .column("title")
                    .relation(
                        "tags",
                        RelationSchema::many_to_many(
                            "tag",
                            "id",
                            "id",
                            PivotSchema::new("post_tags", "post_id", "tag_id").column("weight"),
                        ),
                    )
                    .build()
                    .unwrap(),
            )
            .unwrap()
            .with(
                EntitySchema::builder("tag")
                    .table("tags")
                    .primary_key("id")
                    .column("name")
                    .build()
                    .unwrap(),
            )
            .unwrap()
    }

    fn record(values: Vec<(&str, Value)>) -> ParsedRecord {
        ParsedRecord {
            values: values
                .into_iter()
                .map(|(c, v)| (c.to_string(), v))
                .collect(),
            relations: Vec::new(),
        }
    }

    fn post_with_tag(post: i64, weight: i64) -> ParsedRecord {
        let mut post_record = record(vec![("id", Value::BigInt(post)), ("title", Value::from("t"))]);
        post_record.relations.push((
            "tags".to_string(),
            ParsedRelation::Pivoted(vec![PivotedRecord {
                pivot: vec![
                    ("post_id".to_string(), Value::BigInt(post)),
                    ("tag_id".to_string(), Value::BigInt(7)),
                    ("weight".to_string(), Value::BigInt(weight)),
                ],
                record: record(vec![("id", Value::BigInt(7)), ("name", Value::from("rust"))]),
            }]),
        ));
        post_record
    }

    #[test]
    fn test_shared_target_is_materialized_once() {
        let registry = registry();
        let mut map = EntityMap::new(None);
        let mut materializer = Materializer::new(&registry, &mut map, false);
        let posts = materializer
            .all("post", &[post_with_tag(1, 2), post_with_tag(2, 9)])
            .unwrap();

        let first = posts[0].related_many("tags").unwrap();
        let second = posts[1].related_many("tags").unwrap();
        assert!(first[0].ptr_eq(&second[0]));
        assert_eq!(
            posts[1].get_pivot("tags", &second[0]).unwrap(),
            vec![("weight".to_string(), Value::BigInt(9))]
        );
        assert_eq!(map.len(), 3);
    }

    #[test]
    fn test_mapped_instance_keeps_loaded_relations() {
        let registry = registry();
        let mut map = EntityMap::new(None);
        let first = Materializer::new(&registry, &mut map, false)
            .entity("post", &post_with_tag(1, 2))
            .unwrap();
        first.set("title", "local edit").unwrap();

        let again = Materializer::new(&registry, &mut map, false)
            .entity("post", &post_with_tag(1, 5))
            .unwrap();
        assert!(again.ptr_eq(&first));
        assert_eq!(again.get("title"), Some(Value::from("local edit")));
        let tag = again.related_many("tags").unwrap().remove(0);
        assert_eq!(
            again.get_pivot("tags", &tag).unwrap(),
            vec![("weight".to_string(), Value::BigInt(2))]
        );
    }

    #[test]
    fn test_records_without_key_are_not_cached() {
        let registry = registry();
        let mut map = EntityMap::new(Some(1));
        let mut materializer = Materializer::new(&registry, &mut map, false);
        let a = materializer
            .entity("tag", &record(vec![("name", Value::from("a"))]))
            .unwrap();
        let b = materializer
            .entity("tag", &record(vec![("name", Value::from("a"))]))
            .unwrap();
        assert!(!a.ptr_eq(&b));

        materializer
            .entity("tag", &record(vec![("id", Value::BigInt(1))]))
            .unwrap();
        let err = materializer
            .entity("tag", &record(vec![("id", Value::BigInt(2))]))
            .unwrap_err();
        assert!(matches!(err, Error::Cache(_)));
        assert_eq!(map.len(), 1);
    }
}
