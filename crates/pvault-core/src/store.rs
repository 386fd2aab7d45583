//! Document store: tables of JSON documents with path-indexed queries.
//!
//! `DocStore` is the seam the vault engine talks to. `JsonStore` is the
//! bundled backend: everything lives in memory and, when opened on a path, is
//! flushed atomically (write temp file, then rename) as a single JSON file.
//!
//! Paths are dotted (`origin.seqnr`). Indexes are declared per table and path
//! and accelerate equality clauses; range clauses and unindexed paths scan.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use crate::error::{VaultError, VaultResult};

/// A single predicate clause on a dotted JSON path.
#[derive(Debug, Clone, PartialEq)]
pub enum Clause {
    Eq(String, Value),
    Gt(String, Value),
    Ge(String, Value),
    Lt(String, Value),
    Le(String, Value),
}

impl Clause {
    fn path(&self) -> &str {
        match self {
            Clause::Eq(p, _) | Clause::Gt(p, _) | Clause::Ge(p, _) | Clause::Lt(p, _) | Clause::Le(p, _) => p,
        }
    }

    fn matches(&self, doc: &Value) -> bool {
        let Some(actual) = lookup(doc, self.path()) else {
            return false;
        };
        match self {
            Clause::Eq(_, want) => compare(actual, want) == Some(Ordering::Equal),
            Clause::Gt(_, want) => compare(actual, want) == Some(Ordering::Greater),
            Clause::Ge(_, want) => matches!(compare(actual, want), Some(Ordering::Greater | Ordering::Equal)),
            Clause::Lt(_, want) => compare(actual, want) == Some(Ordering::Less),
            Clause::Le(_, want) => matches!(compare(actual, want), Some(Ordering::Less | Ordering::Equal)),
        }
    }
}

/// Conjunction of clauses. An empty query matches every document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    pub clauses: Vec<Clause>,
}

impl Query {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn eq(mut self, path: &str, value: impl Serialize) -> Self {
        self.clauses.push(Clause::Eq(path.into(), to_value(value)));
        self
    }

    pub fn gt(mut self, path: &str, value: impl Serialize) -> Self {
        self.clauses.push(Clause::Gt(path.into(), to_value(value)));
        self
    }

    pub fn ge(mut self, path: &str, value: impl Serialize) -> Self {
        self.clauses.push(Clause::Ge(path.into(), to_value(value)));
        self
    }

    pub fn lt(mut self, path: &str, value: impl Serialize) -> Self {
        self.clauses.push(Clause::Lt(path.into(), to_value(value)));
        self
    }

    pub fn le(mut self, path: &str, value: impl Serialize) -> Self {
        self.clauses.push(Clause::Le(path.into(), to_value(value)));
        self
    }

    pub fn matches(&self, doc: &Value) -> bool {
        self.clauses.iter().all(|c| c.matches(doc))
    }
}

fn to_value(value: impl Serialize) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

/// Sort order for `find_all`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sort {
    pub path: String,
    pub descending: bool,
}

impl Sort {
    pub fn asc(path: &str) -> Self {
        Self {
            path: path.into(),
            descending: false,
        }
    }

    pub fn desc(path: &str) -> Self {
        Self {
            path: path.into(),
            descending: true,
        }
    }
}

/// Table-oriented JSON document store.
pub trait DocStore: Send {
    /// Declare an index on `path` for `table`. Idempotent.
    fn create_index(&mut self, table: &str, path: &str) -> VaultResult<()>;
    fn insert(&mut self, table: &str, doc: Value) -> VaultResult<()>;
    fn insert_many(&mut self, table: &str, docs: Vec<Value>) -> VaultResult<()>;
    /// Replace every matching document with `doc`. Returns the match count.
    fn update(&mut self, table: &str, query: &Query, doc: Value) -> VaultResult<usize>;
    fn delete(&mut self, table: &str, query: &Query) -> VaultResult<usize>;
    fn find_all(&self, table: &str, query: &Query, sort: Option<&Sort>) -> VaultResult<Vec<Value>>;
    fn find_one(&self, table: &str, query: &Query) -> VaultResult<Option<Value>>;
    /// Persist pending changes, if the backend has durable storage.
    fn flush(&mut self) -> VaultResult<()>;
}

/// Resolve a dotted path inside a document.
pub fn lookup<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(doc, |node, key| node.get(key))
}

/// Total-ish order across comparable JSON scalars. Mixed types are unordered.
pub fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_u64(), y.as_u64()) {
            (Some(x), Some(y)) => Some(x.cmp(&y)),
            _ => x.as_f64()?.partial_cmp(&y.as_f64()?),
        },
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ if a == b => Some(Ordering::Equal),
        _ => None,
    }
}

fn index_key(value: &Value) -> String {
    value.to_string()
}

// ── JSON backend ──────────────────────────────────────────────────────────────

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    tables: BTreeMap<String, Vec<Value>>,
    #[serde(default)]
    indexes: Vec<(String, String)>,
}

#[derive(Debug, Default)]
struct Table {
    next_row: u64,
    rows: BTreeMap<u64, Value>,
    /// path → index key → row ids
    indexes: HashMap<String, HashMap<String, BTreeSet<u64>>>,
}

impl Table {
    fn add_index(&mut self, path: &str) {
        if self.indexes.contains_key(path) {
            return;
        }
        let mut index: HashMap<String, BTreeSet<u64>> = HashMap::new();
        for (row, doc) in &self.rows {
            if let Some(value) = lookup(doc, path) {
                index.entry(index_key(value)).or_default().insert(*row);
            }
        }
        self.indexes.insert(path.to_string(), index);
    }

    fn insert(&mut self, doc: Value) {
        let row = self.next_row;
        self.next_row += 1;
        for (path, index) in &mut self.indexes {
            if let Some(value) = lookup(&doc, path) {
                index.entry(index_key(value)).or_default().insert(row);
            }
        }
        self.rows.insert(row, doc);
    }

    fn remove(&mut self, row: u64) -> Option<Value> {
        let doc = self.rows.remove(&row)?;
        for (path, index) in &mut self.indexes {
            if let Some(value) = lookup(&doc, path) {
                let key = index_key(value);
                if let Some(rows) = index.get_mut(&key) {
                    rows.remove(&row);
                    if rows.is_empty() {
                        index.remove(&key);
                    }
                }
            }
        }
        Some(doc)
    }

    /// Row ids matching `query`, narrowed through the first indexed equality clause.
    fn matching_rows(&self, query: &Query) -> Vec<u64> {
        let indexed = query.clauses.iter().find_map(|clause| match clause {
            Clause::Eq(path, value) => self
                .indexes
                .get(path)
                .map(|index| index.get(&index_key(value))),
            _ => None,
        });

        let candidates: Box<dyn Iterator<Item = u64> + '_> = match indexed {
            Some(Some(rows)) => Box::new(rows.iter().copied()),
            Some(None) => return Vec::new(),
            None => Box::new(self.rows.keys().copied()),
        };

        candidates
            .filter(|row| self.rows.get(row).is_some_and(|doc| query.matches(doc)))
            .collect()
    }
}

/// In-memory document store with optional single-file persistence.
#[derive(Debug)]
pub struct JsonStore {
    path: Option<PathBuf>,
    tables: HashMap<String, Table>,
    dirty: bool,
}

impl JsonStore {
    /// A store that never touches disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            tables: HashMap::new(),
            dirty: false,
        }
    }

    /// Load or create a store persisted at `path`.
    pub fn open(path: &Path) -> VaultResult<Self> {
        let snapshot: Snapshot = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            serde_json::from_str(&content).map_err(|e| {
                VaultError::Platform(format!("parsing store {}: {e}", path.display()))
            })?
        } else {
            Snapshot::default()
        };

        let mut store = Self {
            path: Some(path.to_path_buf()),
            tables: HashMap::new(),
            dirty: false,
        };
        for (name, docs) in snapshot.tables {
            let table = store.tables.entry(name).or_default();
            for doc in docs {
                table.insert(doc);
            }
        }
        for (table, index_path) in snapshot.indexes {
            store.tables.entry(table).or_default().add_index(&index_path);
        }
        tracing::debug!(path = %path.display(), tables = store.tables.len(), "document store opened");
        Ok(store)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Number of documents in `table`.
    pub fn count(&self, table: &str) -> usize {
        self.tables.get(table).map_or(0, |t| t.rows.len())
    }

    fn snapshot(&self) -> Snapshot {
        let mut snapshot = Snapshot::default();
        for (name, table) in &self.tables {
            snapshot
                .tables
                .insert(name.clone(), table.rows.values().cloned().collect());
            for path in table.indexes.keys() {
                snapshot.indexes.push((name.clone(), path.clone()));
            }
        }
        snapshot.indexes.sort();
        snapshot
    }
}

impl DocStore for JsonStore {
    fn create_index(&mut self, table: &str, path: &str) -> VaultResult<()> {
        if path.is_empty() {
            return Err(VaultError::InvalidArgument("index path must not be empty".into()));
        }
        self.tables.entry(table.to_string()).or_default().add_index(path);
        self.dirty = true;
        Ok(())
    }

    fn insert(&mut self, table: &str, doc: Value) -> VaultResult<()> {
        if !doc.is_object() {
            return Err(VaultError::InvalidArgument(format!(
                "documents must be JSON objects (table {table})"
            )));
        }
        self.tables.entry(table.to_string()).or_default().insert(doc);
        self.dirty = true;
        Ok(())
    }

    fn insert_many(&mut self, table: &str, docs: Vec<Value>) -> VaultResult<()> {
        if let Some(bad) = docs.iter().position(|d| !d.is_object()) {
            return Err(VaultError::InvalidArgument(format!(
                "document {bad} is not a JSON object (table {table})"
            )));
        }
        let t = self.tables.entry(table.to_string()).or_default();
        for doc in docs {
            t.insert(doc);
        }
        self.dirty = true;
        Ok(())
    }

    fn update(&mut self, table: &str, query: &Query, doc: Value) -> VaultResult<usize> {
        let Some(t) = self.tables.get_mut(table) else {
            return Ok(0);
        };
        let rows = t.matching_rows(query);
        for row in &rows {
            t.remove(*row);
            t.insert(doc.clone());
        }
        if !rows.is_empty() {
            self.dirty = true;
        }
        Ok(rows.len())
    }

    fn delete(&mut self, table: &str, query: &Query) -> VaultResult<usize> {
        let Some(t) = self.tables.get_mut(table) else {
            return Ok(0);
        };
        let rows = t.matching_rows(query);
        for row in &rows {
            t.remove(*row);
        }
        if !rows.is_empty() {
            self.dirty = true;
        }
        Ok(rows.len())
    }

    fn find_all(&self, table: &str, query: &Query, sort: Option<&Sort>) -> VaultResult<Vec<Value>> {
        let Some(t) = self.tables.get(table) else {
            return Ok(Vec::new());
        };
        let mut docs: Vec<Value> = t
            .matching_rows(query)
            .into_iter()
            .filter_map(|row| t.rows.get(&row).cloned())
            .collect();
        if let Some(sort) = sort {
            docs.sort_by(|a, b| {
                let ord = match (lookup(a, &sort.path), lookup(b, &sort.path)) {
                    (Some(x), Some(y)) => compare(x, y).unwrap_or(Ordering::Equal),
                    (Some(_), None) => Ordering::Greater,
                    (None, Some(_)) => Ordering::Less,
                    (None, None) => Ordering::Equal,
                };
                if sort.descending {
                    ord.reverse()
                } else {
                    ord
                }
            });
        }
        Ok(docs)
    }

    fn find_one(&self, table: &str, query: &Query) -> VaultResult<Option<Value>> {
        let Some(t) = self.tables.get(table) else {
            return Ok(None);
        };
        Ok(t
            .matching_rows(query)
            .first()
            .and_then(|row| t.rows.get(row).cloned()))
    }

    fn flush(&mut self) -> VaultResult<()> {
        let Some(path) = self.path.clone() else {
            self.dirty = false;
            return Ok(());
        };
        if !self.dirty {
            return Ok(());
        }

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let json = serde_json::to_string(&self.snapshot())
            .map_err(|e| VaultError::Platform(format!("serializing store: {e}")))?;

        // Atomic write: write to temp file, then rename
        let tmp_path = path.with_extension("tmp");
        std::fs::write(&tmp_path, json)?;
        std::fs::rename(&tmp_path, &path)?;

        self.dirty = false;
        Ok(())
    }
}

impl Drop for JsonStore {
    fn drop(&mut self) {
        if self.dirty && self.path.is_some() {
            if let Err(e) = self.flush() {
                tracing::warn!("failed to flush document store on drop: {e}");
            }
        }
    }
}
