//! Row parser tree.
//!
//! A [`NodeTree`] mirrors the loader tree: one node per loader, stored in an
//! arena and addressed by [`NodeId`]. Rows are parsed positionally. Each
//! node owns a fixed slice of the row (pivot columns first for pivoted
//! nodes), followed by the slices of its joined children.
//!
//! Parsed data lives in *branches*. A branch is created once per distinct
//! value of the node's duplicate criteria and is mounted into every parent
//! branch whose reference key matches the branch's local key, so join
//! fan-out never produces duplicates and a deferred query can feed any
//! number of parents.

use crate::identity_map::hash_values;
use relmap_core::{Error, Result, Row, Value};
use std::collections::HashMap;

/// Index of a node in its tree.
pub type NodeId = usize;

type BranchId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Root,
    /// At most one branch per parent.
    Singular,
    /// Ordered, deduplicated branches per parent.
    Array,
    /// Like `Array`, each branch carrying its pivot row.
    Pivoted,
}

/// Shape of one node.
#[derive(Debug, Clone)]
pub struct NodeSpec {
    pub kind: NodeKind,
    /// Relation name in the parent; `None` for the root.
    pub relation: Option<String>,
    pub columns: Vec<String>,
    /// Pivot columns preceding `columns` in the row (pivoted nodes only).
    pub pivot_columns: Vec<String>,
    /// Column holding the key that matches the parent.
    pub local_key: Option<String>,
    /// Parent column the branch mounts under.
    pub reference_key: Option<String>,
    pub duplicate_criteria: Vec<String>,
    /// Columns arrive in the parent's rows.
    pub joined: bool,
}

impl NodeSpec {
    pub fn root(columns: Vec<String>, primary_key: Vec<String>) -> Self {
        Self {
            kind: NodeKind::Root,
            relation: None,
            columns,
            pivot_columns: Vec::new(),
            local_key: None,
            reference_key: None,
            duplicate_criteria: primary_key,
            joined: false,
        }
    }
}

#[derive(Debug)]
enum Slot {
    Single(Option<BranchId>),
    Many(Vec<BranchId>),
}

#[derive(Debug)]
struct Branch {
    values: Vec<(String, Value)>,
    pivot: Vec<(String, Value)>,
    slots: Vec<(NodeId, Slot)>,
}

impl Branch {
    /// Column of the branch's own row.
    fn value(&self, column: &str) -> Option<&Value> {
        find(&self.values, column)
    }

    /// Column used for keys and criteria; pivoted branches read their pivot
    /// row first.
    fn key_value(&self, kind: NodeKind, column: &str) -> Option<&Value> {
        keyed(kind, &self.values, &self.pivot, column)
    }
}

fn find<'a>(values: &'a [(String, Value)], column: &str) -> Option<&'a Value> {
    values.iter().find(|(c, _)| c == column).map(|(_, v)| v)
}

fn keyed<'a>(
    kind: NodeKind,
    values: &'a [(String, Value)],
    pivot: &'a [(String, Value)],
    column: &str,
) -> Option<&'a Value> {
    if kind == NodeKind::Pivoted {
        find(pivot, column).or_else(|| find(values, column))
    } else {
        find(values, column)
    }
}

/// Branches of one node indexed by the value of one column.
#[derive(Debug)]
struct Tracked {
    column: String,
    index: HashMap<u64, Vec<BranchId>>,
    order: Vec<Value>,
}

#[derive(Debug)]
struct Node {
    spec: NodeSpec,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    tracked: Vec<Tracked>,
    duplicates: HashMap<u64, Vec<BranchId>>,
}

/// One parsed row group with its relations.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedRecord {
    pub values: Vec<(String, Value)>,
    pub relations: Vec<(String, ParsedRelation)>,
}

impl ParsedRecord {
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.values
            .iter()
            .find(|(c, _)| c == column)
            .map(|(_, v)| v)
    }

    pub fn relation(&self, name: &str) -> Option<&ParsedRelation> {
        self.relations
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, r)| r)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParsedRelation {
    Single(Option<Box<ParsedRecord>>),
    Many(Vec<ParsedRecord>),
    Pivoted(Vec<PivotedRecord>),
}

impl ParsedRelation {
    pub fn len(&self) -> usize {
        match self {
            ParsedRelation::Single(record) => usize::from(record.is_some()),
            ParsedRelation::Many(records) => records.len(),
            ParsedRelation::Pivoted(records) => records.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PivotedRecord {
    pub pivot: Vec<(String, Value)>,
    pub record: ParsedRecord,
}

/// Arena of nodes plus the branches parsed into them.
#[derive(Debug)]
pub struct NodeTree {
    nodes: Vec<Node>,
    branches: Vec<Branch>,
    roots: Vec<BranchId>,
}

impl NodeTree {
    pub const ROOT: NodeId = 0;

    pub fn new(root: NodeSpec) -> Self {
        Self {
            nodes: vec![Node {
                spec: root,
                parent: None,
                children: Vec::new(),
                tracked: Vec::new(),
                duplicates: HashMap::new(),
            }],
            branches: Vec::new(),
            roots: Vec::new(),
        }
    }

    /// Attach a child node.
    #[allow(clippy::result_large_err)]
    pub fn add_child(&mut self, parent: NodeId, spec: NodeSpec) -> Result<NodeId> {
        let Some(parent_node) = self.nodes.get(parent) else {
            return Err(Error::loader(format!("unknown parent node {}", parent)));
        };
        if spec.kind == NodeKind::Root || spec.relation.is_none() {
            return Err(Error::loader("child node needs a relation name"));
        }
        let (Some(local_key), Some(reference_key)) = (&spec.local_key, &spec.reference_key)
        else {
            return Err(Error::loader(format!(
                "node for '{}' needs both a local and a reference key",
                spec.relation.as_deref().unwrap_or_default()
            )));
        };
        let searched = if spec.kind == NodeKind::Pivoted {
            &spec.pivot_columns
        } else {
            &spec.columns
        };
        if !searched.contains(local_key) {
            return Err(Error::loader(format!(
                "local key '{}' is not selected by node '{}'",
                local_key,
                spec.relation.as_deref().unwrap_or_default()
            )));
        }
        if !parent_node.spec.columns.contains(reference_key) {
            return Err(Error::loader(format!(
                "reference key '{}' is not selected by the parent node",
                reference_key
            )));
        }
        if !self.branches.is_empty() {
            return Err(Error::loader("cannot add nodes after parsing started"));
        }

        let reference_key = reference_key.clone();
        let id = self.nodes.len();
        self.nodes.push(Node {
            spec,
            parent: Some(parent),
            children: Vec::new(),
            tracked: Vec::new(),
            duplicates: HashMap::new(),
        });
        let parent_node = &mut self.nodes[parent];
        parent_node.children.push(id);
        if !parent_node.tracked.iter().any(|t| t.column == reference_key) {
            parent_node.tracked.push(Tracked {
                column: reference_key,
                index: HashMap::new(),
                order: Vec::new(),
            });
        }
        Ok(id)
    }

    pub fn spec(&self, node: NodeId) -> &NodeSpec {
        &self.nodes[node].spec
    }

    pub fn children(&self, node: NodeId) -> &[NodeId] {
        &self.nodes[node].children
    }

    /// Columns a node and its joined descendants occupy in a row.
    pub fn width(&self, node: NodeId) -> usize {
        let n = &self.nodes[node];
        n.spec.pivot_columns.len()
            + n.spec.columns.len()
            + n.children
                .iter()
                .filter(|&&c| self.nodes[c].spec.joined)
                .map(|&c| self.width(c))
                .sum::<usize>()
    }

    /// Parse one row of the root statement.
    #[allow(clippy::result_large_err)]
    pub fn parse_row(&mut self, row: &Row) -> Result<()> {
        self.parse_row_at(Self::ROOT, 0, row).map(|_| ())
    }

    /// Parse the slice of `row` starting at `offset` into `node`; returns
    /// the offset following the node and its joined descendants.
    #[allow(clippy::result_large_err)]
    pub fn parse_row_at(&mut self, node: NodeId, offset: usize, row: &Row) -> Result<usize> {
        let spec = &self.nodes[node].spec;
        let pivot_len = spec.pivot_columns.len();
        let own = row.slice(offset, pivot_len + spec.columns.len())?;
        let (pivot_values, values) = own.split_at(pivot_len);
        let pivot: Vec<(String, Value)> = spec
            .pivot_columns
            .iter()
            .cloned()
            .zip(pivot_values.iter().cloned())
            .collect();
        let values: Vec<(String, Value)> = spec
            .columns
            .iter()
            .cloned()
            .zip(values.iter().cloned())
            .collect();
        let kind = spec.kind;
        let lookup = |column: &str| {
            keyed(kind, &values, &pivot, column)
                .cloned()
                .unwrap_or(Value::Null)
        };

        let local = spec.local_key.as_deref().map(&lookup);
        if local.as_ref().is_some_and(Value::is_null) {
            return Ok(offset + self.width(node));
        }
        let criteria: Vec<Value> = spec
            .duplicate_criteria
            .iter()
            .map(|c| lookup(c.as_str()))
            .collect();
        let next = offset + own.len();

        let branch = match self.find_duplicate(node, &criteria) {
            Some(existing) => existing,
            None => self.create_branch(node, values, pivot, &criteria),
        };

        match (self.nodes[node].parent, local) {
            (Some(parent), Some(local)) => self.mount(parent, node, branch, &local)?,
            _ => {
                if !self.roots.contains(&branch) {
                    self.roots.push(branch);
                }
            }
        }

        let mut cursor = next;
        for child in self.nodes[node].children.clone() {
            if self.nodes[child].spec.joined {
                cursor = self.parse_row_at(child, cursor, row)?;
            }
        }
        Ok(cursor)
    }

    fn find_duplicate(&self, node: NodeId, criteria: &[Value]) -> Option<BranchId> {
        if criteria.is_empty() || criteria.iter().any(Value::is_null) {
            return None;
        }
        let spec = &self.nodes[node].spec;
        self.nodes[node]
            .duplicates
            .get(&hash_values(criteria))?
            .iter()
            .copied()
            .find(|&b| {
                spec.duplicate_criteria.iter().zip(criteria).all(|(c, v)| {
                    self.branches[b]
                        .key_value(spec.kind, c)
                        .is_some_and(|x| x.loosely_eq(v))
                })
            })
    }

    fn create_branch(
        &mut self,
        node: NodeId,
        values: Vec<(String, Value)>,
        pivot: Vec<(String, Value)>,
        criteria: &[Value],
    ) -> BranchId {
        let id = self.branches.len();
        let slots = self.nodes[node]
            .children
            .iter()
            .map(|&child| {
                let slot = match self.nodes[child].spec.kind {
                    NodeKind::Singular => Slot::Single(None),
                    _ => Slot::Many(Vec::new()),
                };
                (child, slot)
            })
            .collect();
        let branch = Branch {
            values,
            pivot,
            slots,
        };

        let n = &mut self.nodes[node];
        for tracked in &mut n.tracked {
            let Some(value) = branch.value(&tracked.column).filter(|v| !v.is_null()) else {
                continue;
            };
            let entry = tracked
                .index
                .entry(hash_values(std::slice::from_ref(value)))
                .or_default();
            let known = entry.iter().any(|&b| {
                self.branches
                    .get(b)
                    .and_then(|other| other.value(&tracked.column))
                    .is_some_and(|v| v.loosely_eq(value))
            });
            if !known {
                tracked.order.push(value.clone());
            }
            entry.push(id);
        }
        if !criteria.is_empty() && !criteria.iter().any(Value::is_null) {
            n.duplicates.entry(hash_values(criteria)).or_default().push(id);
        }
        tracing::trace!(node, branch = id, "branch created");
        self.branches.push(branch);
        id
    }

    #[allow(clippy::result_large_err)]
    fn mount(&mut self, parent: NodeId, node: NodeId, branch: BranchId, local: &Value) -> Result<()> {
        let reference_key = self.nodes[node].spec.reference_key.clone().unwrap_or_default();
        let targets: Vec<BranchId> = self.nodes[parent]
            .tracked
            .iter()
            .find(|t| t.column == reference_key)
            .and_then(|t| t.index.get(&hash_values(std::slice::from_ref(local))))
            .map(|candidates| {
                candidates
                    .iter()
                    .copied()
                    .filter(|&b| {
                        self.branches[b]
                            .value(&reference_key)
                            .is_some_and(|v| v.loosely_eq(local))
                    })
                    .collect()
            })
            .unwrap_or_default();
        if targets.is_empty() {
            return Err(Error::loader(format!(
                "parent is missing for '{}' with {} = {:?}",
                self.nodes[node].spec.relation.as_deref().unwrap_or_default(),
                reference_key,
                local
            )));
        }
        for target in targets {
            let Some((_, slot)) = self.branches[target]
                .slots
                .iter_mut()
                .find(|(child, _)| *child == node)
            else {
                continue;
            };
            match slot {
                Slot::Single(current) => {
                    if current.is_none() {
                        *current = Some(branch);
                    }
                }
                Slot::Many(list) => {
                    if !list.contains(&branch) {
                        list.push(branch);
                    }
                }
            }
        }
        Ok(())
    }

    /// Distinct non-null values of `column` across the node's branches, in
    /// first-seen order.
    pub fn references(&self, node: NodeId, column: &str) -> Vec<Value> {
        self.nodes[node]
            .tracked
            .iter()
            .find(|t| t.column == column)
            .map(|t| t.order.clone())
            .unwrap_or_default()
    }

    /// Install a root branch from known data instead of a fetched row.
    pub fn seed(&mut self, known: &[(String, Value)]) {
        let spec = &self.nodes[Self::ROOT].spec;
        let values: Vec<(String, Value)> = spec
            .columns
            .iter()
            .map(|c| (c.clone(), find(known, c).cloned().unwrap_or(Value::Null)))
            .collect();
        let criteria: Vec<Value> = spec
            .duplicate_criteria
            .iter()
            .map(|c| find(&values, c).cloned().unwrap_or(Value::Null))
            .collect();
        let branch = match self.find_duplicate(Self::ROOT, &criteria) {
            Some(existing) => existing,
            None => self.create_branch(Self::ROOT, values, Vec::new(), &criteria),
        };
        if !self.roots.contains(&branch) {
            self.roots.push(branch);
        }
    }

    /// Number of top-level records parsed so far.
    pub fn len(&self) -> usize {
        self.roots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    /// Nested records in root row order.
    pub fn result(&self) -> Vec<ParsedRecord> {
        self.roots.iter().map(|&b| self.render(b)).collect()
    }

    fn render(&self, branch: BranchId) -> ParsedRecord {
        let b = &self.branches[branch];
        let relations = b
            .slots
            .iter()
            .map(|(child, slot)| {
                let spec = &self.nodes[*child].spec;
                let name = spec.relation.clone().unwrap_or_default();
                let relation = match (spec.kind, slot) {
                    (_, Slot::Single(target)) => {
                        ParsedRelation::Single(target.map(|t| Box::new(self.render(t))))
                    }
                    (NodeKind::Pivoted, Slot::Many(list)) => ParsedRelation::Pivoted(
                        list.iter()
                            .map(|&t| PivotedRecord {
                                pivot: self.branches[t].pivot.clone(),
                                record: self.render(t),
                            })
                            .collect(),
                    ),
                    (_, Slot::Many(list)) => {
                        ParsedRelation::Many(list.iter().map(|&t| self.render(t)).collect())
                    }
                };
                (name, relation)
            })
            .collect();
        ParsedRecord {
            values: b.values.clone(),
            relations,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| (*s).to_string()).collect()
    }

    fn row(values: Vec<Value>) -> Row {
        Row::positional(values)
    }

    fn child(
        kind: NodeKind,
        relation: &str,
        columns: &[&str],
        local: &str,
        reference: &str,
        joined: bool,
    ) -> NodeSpec {
        NodeSpec {
            kind,
            relation: Some(relation.to_string()),
            columns: strings(columns),
            pivot_columns: Vec::new(),
            local_key: Some(local.to_string()),
            reference_key: Some(reference.to_string()),
            duplicate_criteria: strings(&["id"]),
            joined,
        }
    }

    #[test]
    fn test_join_fan_out_yields_one_parent_with_three_children() {
        let mut tree = NodeTree::new(NodeSpec::root(strings(&["id", "name"]), strings(&["id"])));
        tree.add_child(
            NodeTree::ROOT,
            child(NodeKind::Array, "posts", &["id", "user_id", "title"], "user_id", "id", true),
        )
        .unwrap();

        for (post_id, title) in [(10, "a"), (11, "b"), (12, "c")] {
            tree.parse_row(&row(vec![
                Value::BigInt(1),
                Value::from("Ann"),
                Value::BigInt(post_id),
                Value::BigInt(1),
                Value::from(title),
            ]))
            .unwrap();
        }
        // A repeated row changes nothing.
        tree.parse_row(&row(vec![
            Value::BigInt(1),
            Value::from("Ann"),
            Value::BigInt(11),
            Value::BigInt(1),
            Value::from("b"),
        ]))
        .unwrap();

        let result = tree.result();
        assert_eq!(result.len(), 1);
        let Some(ParsedRelation::Many(posts)) = result[0].relation("posts") else {
            panic!("expected posts");
        };
        let titles: Vec<_> = posts.iter().map(|p| p.get("title").cloned()).collect();
        assert_eq!(
            titles,
            vec![
                Some(Value::from("a")),
                Some(Value::from("b")),
                Some(Value::from("c"))
            ]
        );
    }

    #[test]
    fn test_null_local_key_skips_the_relation_and_its_children() {
        let mut tree = NodeTree::new(NodeSpec::root(strings(&["id", "user_id"]), strings(&["id"])));
        let author = tree
            .add_child(
                NodeTree::ROOT,
                child(NodeKind::Singular, "author", &["id", "name"], "id", "user_id", true),
            )
            .unwrap();
        tree.add_child(
            author,
            child(NodeKind::Singular, "avatar", &["id", "user_id"], "user_id", "id", true),
        )
        .unwrap();
        assert_eq!(tree.width(NodeTree::ROOT), 6);

        tree.parse_row(&row(vec![
            Value::BigInt(1),
            Value::Null,
            Value::Null,
            Value::Null,
            Value::Null,
            Value::Null,
        ]))
        .unwrap();
        tree.parse_row(&row(vec![
            Value::BigInt(2),
            Value::BigInt(7),
            Value::BigInt(7),
            Value::from("Bo"),
            Value::BigInt(3),
            Value::BigInt(7),
        ]))
        .unwrap();

        let result = tree.result();
        assert_eq!(result[0].relation("author"), Some(&ParsedRelation::Single(None)));
        let Some(ParsedRelation::Single(Some(author))) = result[1].relation("author") else {
            panic!("expected author");
        };
        assert_eq!(author.get("name"), Some(&Value::from("Bo")));
        assert_eq!(author.relation("avatar").map(ParsedRelation::len), Some(1));
    }

    #[test]
    fn test_deferred_rows_mount_into_every_matching_parent() {
        let mut tree = NodeTree::new(NodeSpec::root(strings(&["id", "user_id"]), strings(&["id"])));
        let author = tree
            .add_child(
                NodeTree::ROOT,
                child(NodeKind::Singular, "author", &["id", "name"], "id", "user_id", false),
            )
            .unwrap();
        for (id, user) in [(1, 5), (2, 5), (3, 6)] {
            tree.parse_row(&row(vec![Value::BigInt(id), Value::BigInt(user)]))
                .unwrap();
        }
        assert_eq!(
            tree.references(NodeTree::ROOT, "user_id"),
            vec![Value::BigInt(5), Value::BigInt(6)]
        );

        tree.parse_row_at(author, 0, &row(vec![Value::BigInt(5), Value::from("Ann")]))
            .unwrap();
        let result = tree.result();
        assert_eq!(result[0].relation("author").map(ParsedRelation::len), Some(1));
        assert_eq!(result[1].relation("author").map(ParsedRelation::len), Some(1));
        assert_eq!(result[2].relation("author").map(ParsedRelation::len), Some(0));

        let err = tree
            .parse_row_at(author, 0, &row(vec![Value::BigInt(9), Value::from("Zed")]))
            .unwrap_err();
        assert!(matches!(err, Error::Loader(_)));
    }

    #[test]
    fn test_pivoted_branches_carry_their_pivot_row() {
        let mut tree = NodeTree::new(NodeSpec::root(strings(&["id"]), strings(&["id"])));
        tree.add_child(
            NodeTree::ROOT,
            NodeSpec {
                kind: NodeKind::Pivoted,
                relation: Some("tags".to_string()),
                columns: strings(&["id", "name"]),
                pivot_columns: strings(&["post_id", "tag_id", "weight"]),
                local_key: Some("post_id".to_string()),
                reference_key: Some("id".to_string()),
                duplicate_criteria: strings(&["post_id", "tag_id"]),
                joined: true,
            },
        )
        .unwrap();

        for (post, tag, weight) in [(1, 7, 2), (2, 7, 9)] {
            tree.parse_row(&row(vec![
                Value::BigInt(post),
                Value::BigInt(post),
                Value::BigInt(tag),
                Value::BigInt(weight),
                Value::BigInt(tag),
                Value::from("rust"),
            ]))
            .unwrap();
        }

        let result = tree.result();
        let Some(ParsedRelation::Pivoted(links)) = result[1].relation("tags") else {
            panic!("expected tags");
        };
        assert_eq!(links.len(), 1);
        assert_eq!(
            links[0].pivot.last(),
            Some(&("weight".to_string(), Value::BigInt(9)))
        );
        assert_eq!(links[0].record.get("name"), Some(&Value::from("rust")));
    }

    #[test]
    fn test_invalid_child_specs_are_loader_errors() {
        let mut tree = NodeTree::new(NodeSpec::root(strings(&["id"]), strings(&["id"])));
        let err = tree
            .add_child(
                NodeTree::ROOT,
                child(NodeKind::Array, "posts", &["id"], "user_id", "id", true),
            )
            .unwrap_err();
        assert!(matches!(err, Error::Loader(_)));

        let err = tree
            .add_child(
                NodeTree::ROOT,
                child(NodeKind::Array, "posts", &["id", "user_id"], "user_id", "uid", true),
            )
            .unwrap_err();
        assert!(matches!(err, Error::Loader(_)));
    }
}
