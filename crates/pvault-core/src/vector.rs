//! Sync vectors: the highest item sequence number seen from each node.
//!
//! A vector is the anti-entropy cursor of a replica. A peer that sends its
//! vector gets back every item with `seqnr > vector[node]`, and nothing else.
//! On the wire it is a compact header string: `node:seqnr,node:seqnr,...`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::VaultError;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Vector {
    pub entries: BTreeMap<Uuid, u64>,
}

impl Vector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest seqnr seen from `node` (0 if the node is unknown).
    pub fn get(&self, node: &Uuid) -> u64 {
        self.entries.get(node).copied().unwrap_or(0)
    }

    pub fn contains(&self, node: &Uuid) -> bool {
        self.entries.contains_key(node)
    }

    /// Record that `seqnr` from `node` has been seen. Never moves backwards.
    pub fn observe(&mut self, node: Uuid, seqnr: u64) {
        let entry = self.entries.entry(node).or_insert(0);
        *entry = (*entry).max(seqnr);
    }

    /// Whether an item `(node, seqnr)` is newer than this vector.
    pub fn is_newer(&self, node: &Uuid, seqnr: u64) -> bool {
        match self.entries.get(node) {
            Some(&seen) => seqnr > seen,
            None => true,
        }
    }

    /// Pointwise max.
    pub fn merge(&mut self, other: &Vector) {
        for (node, &seqnr) in &other.entries {
            self.observe(*node, seqnr);
        }
    }

    /// Encode as the `X-Vector` header value.
    pub fn to_header(&self) -> String {
        self.to_string()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Display for Vector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (node, seqnr) in &self.entries {
            if !first {
                f.write_str(",")?;
            }
            write!(f, "{node}:{seqnr}")?;
            first = false;
        }
        Ok(())
    }
}

impl FromStr for Vector {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut vector = Vector::new();
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (node, seqnr) = part
                .rsplit_once(':')
                .ok_or_else(|| VaultError::InvalidArgument(format!("bad vector entry: {part}")))?;
            let node = Uuid::parse_str(node.trim())
                .map_err(|e| VaultError::InvalidArgument(format!("bad vector node {node}: {e}")))?;
            let seqnr = seqnr
                .trim()
                .parse::<u64>()
                .map_err(|e| VaultError::InvalidArgument(format!("bad vector seqnr {seqnr}: {e}")))?;
            vector.observe(node, seqnr);
        }
        Ok(vector)
    }
}
