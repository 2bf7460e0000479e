//! Secondary index engine
//!
//! Each index is a sorted set named after the indexed field. Members are
//! `"<encodedValue>::<resourceID>"` (see [`IndexValue`]); numeric values are
//! scored by value, everything else scores 0 and is found by pattern.
//!
//! Scans follow the server cursor until it returns to 0, skip the
//! placeholder member `"0"`, and return either raw members or just the
//! resource id.

use crate::conn_pool::{ConnPool, DATA_RETRIEVAL_ERR, DELETE_ERR, WRITE_ERR};
use fleetstore_core::{
    member_id, parse_list_value, split_member, Condition, DriverResult, IndexValue, StoreError,
    StoreResult,
};
use fleetstore_storage::{PooledConnection, StoreConnection, WriteOp};
use serde_json::{Map, Value as JsonValue};
use std::collections::{BTreeMap, HashSet};
use tracing::debug;

/// Members visited per `ZSCAN` page
pub const INDEX_PAGE_SIZE: usize = 1000;

/// Placeholder member some indexes carry; never returned by scans
pub const PLACEHOLDER_MEMBER: &str = "0";

/// Field name to value, in index-name order
pub type IndexFields = BTreeMap<String, IndexValue>;

/// Convert a JSON object into index fields.
///
/// Fails with "unsupported value type" on the first value that is not a
/// number, string, or non-empty homogeneous array of strings or numbers.
pub fn fields_from_json(object: &Map<String, JsonValue>) -> StoreResult<IndexFields> {
    object
        .iter()
        .map(|(name, value)| IndexValue::try_from(value).map(|v| (name.clone(), v)))
        .collect()
}

/// Every member of `index` matching `pattern`, following the cursor from
/// `cursor` until it returns to 0
pub(crate) fn zscan_all(
    conn: &mut dyn StoreConnection,
    index: &str,
    cursor: u64,
    pattern: &str,
) -> DriverResult<Vec<String>> {
    let mut cursor = cursor;
    let mut members = Vec::new();
    loop {
        let (next, page) = conn.zscan(index, cursor, pattern, INDEX_PAGE_SIZE)?;
        members.extend(
            page.into_iter()
                .map(|(member, _)| member)
                .filter(|m| m != PLACEHOLDER_MEMBER),
        );
        if next == 0 {
            break;
        }
        cursor = next;
    }
    Ok(members)
}

fn ids_of(members: Vec<String>, raw: bool) -> Vec<String> {
    if raw {
        return members;
    }
    members
        .iter()
        .filter_map(|m| {
            let id = member_id(m);
            if id.is_none() {
                debug!(target: "fleetstore::index", member = %m, "member has no resource id");
            }
            id.map(str::to_string)
        })
        .collect()
}

fn escape_glob(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        if matches!(ch, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

impl ConnPool {
    /// Add one member per field to the index named after the field.
    ///
    /// All inserts go over one write connection; they are not atomic.
    pub fn create_index(&self, fields: &IndexFields, resource_id: &str) -> StoreResult<()> {
        let mut conn = self.write_conn()?;
        for (index, value) in fields {
            let entry = value.encode(resource_id);
            conn.run(|c| c.zadd(index, entry.score, &entry.member))
                .map_err(|e| self.write_error(e, "error while saving index: "))?;
        }
        Ok(())
    }

    /// Members of `index` matching `glob` (lowercased), as ids unless `raw`.
    ///
    /// An index with no matching member yields an empty list.
    pub fn scan_by_glob(&self, index: &str, cursor: u64, glob: &str, raw: bool) -> StoreResult<Vec<String>> {
        let pattern = glob.to_lowercase();
        let mut conn = self.read_conn()?;
        let members = conn
            .run(|c| zscan_all(c, index, cursor, &pattern))
            .map_err(|e| StoreError::from_driver(e, DATA_RETRIEVAL_ERR))?;
        Ok(ids_of(members, raw))
    }

    /// Ids of list members with at least one element satisfying
    /// `element <condition> match_value`, deduplicated in first-seen order.
    ///
    /// With `raw` every member is returned unfiltered. A member whose value
    /// is not a bracketed list of numbers fails the call.
    pub fn scan_list_members(
        &self,
        index: &str,
        cursor: u64,
        match_value: f64,
        condition: Condition,
        raw: bool,
    ) -> StoreResult<Vec<String>> {
        let mut conn = self.read_conn()?;
        let members = conn
            .run(|c| zscan_all(c, index, cursor, "*"))
            .map_err(|e| StoreError::from_driver(e, DATA_RETRIEVAL_ERR))?;
        if raw {
            return Ok(members);
        }

        let mut seen = HashSet::new();
        let mut ids = Vec::new();
        for member in &members {
            let (encoded, id) = split_member(member).ok_or_else(|| {
                StoreError::undefined(format!("index member '{}' has no resource id", member))
            })?;
            let values = parse_list_value(encoded)?;
            if values.iter().any(|v| condition.eval(*v, match_value)) && seen.insert(id) {
                ids.push(id.to_string());
            }
        }
        Ok(ids)
    }

    /// Members scored within `[min, max]`, as ids unless `raw`
    pub fn range_by_score(&self, index: &str, min: f64, max: f64, raw: bool) -> StoreResult<Vec<String>> {
        let mut conn = self.read_conn()?;
        let members = conn
            .run(|c| c.zrangebyscore(index, min, max))
            .map_err(|e| StoreError::from_driver(e, DATA_RETRIEVAL_ERR))?;
        Ok(ids_of(members, raw))
    }

    /// Raw members by rank; negative ranks count from the end
    pub fn range_by_rank(&self, index: &str, start: i64, end: i64) -> StoreResult<Vec<String>> {
        let mut conn = self.read_conn()?;
        conn.run(|c| c.zrange(index, start, end))
            .map_err(|e| StoreError::from_driver(e, DATA_RETRIEVAL_ERR))
    }

    /// Remove every member of `index` ending with `id_suffix`.
    ///
    /// Fails with `KeyNotFound` when nothing matches.
    pub fn remove_by_id_suffix(&self, index: &str, id_suffix: &str) -> StoreResult<()> {
        let pattern = format!("*{}", id_suffix);
        let members = {
            let mut conn = self.read_conn()?;
            conn.run(|c| zscan_all(c, index, 0, &pattern))
                .map_err(|e| StoreError::from_driver(e, DATA_RETRIEVAL_ERR))?
        };
        if members.is_empty() {
            return Err(StoreError::KeyNotFound("no data with ID found".to_string()));
        }
        let mut conn = self.write_conn()?;
        conn.run(|c| c.zrem(index, &members))
            .map(|_| ())
            .map_err(|e| self.write_error(e, DELETE_ERR))
    }

    /// Atomically replace `resource_id`'s members in every index named in
    /// `fields`.
    ///
    /// The index names are watched while the old members are collected; the
    /// removals and inserts then commit as one batch. If another client
    /// changes one of the indexes in between, nothing is applied and the
    /// call fails with `UndefinedErrorType`.
    pub fn replace_index(&self, fields: &IndexFields, resource_id: &str) -> StoreResult<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut conn = self.write_conn()?;
        let result = self.replace_index_on(&mut conn, fields, resource_id);
        if result.is_err() {
            let _ = conn.run(|c| c.unwatch());
        }
        result
    }

    fn replace_index_on(
        &self,
        conn: &mut PooledConnection,
        fields: &IndexFields,
        resource_id: &str,
    ) -> StoreResult<()> {
        let names: Vec<String> = fields.keys().cloned().collect();
        conn.run(|c| c.watch(&names))
            .map_err(|e| self.write_error(e, "error while updating index: "))?;

        let pattern = format!("*::{}", escape_glob(resource_id));
        let mut ops = Vec::with_capacity(fields.len() * 2);
        for (index, value) in fields {
            let stale = conn
                .run(|c| zscan_all(c, index, 0, &pattern))
                .map_err(|e| self.write_error(e, "error while updating index: "))?;
            if !stale.is_empty() {
                ops.push(WriteOp::zrem(index.clone(), stale));
            }
            let entry = value.encode(resource_id);
            ops.push(WriteOp::zadd(index.clone(), entry.score, entry.member));
        }

        let committed = conn
            .run(|c| c.exec(&ops))
            .map_err(|e| self.write_error(e, "error while updating index: "))?;
        if committed {
            Ok(())
        } else {
            Err(StoreError::undefined(format!(
                "error while updating index: concurrent modification of {:?} for {}",
                names, resource_id
            )))
        }
    }

    /// Add `member` to `index` with `score` as-is
    pub fn create_task_index(&self, index: &str, score: i64, member: &str) -> StoreResult<()> {
        let mut conn = self.write_conn()?;
        conn.run(|c| c.zadd(index, score as f64, member))
            .map(|_| ())
            .map_err(|e| self.write_error(e, WRITE_ERR))
    }

    /// Every member of `index`
    pub fn get_all_data_by_index(&self, index: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.read_conn()?;
        conn.run(|c| zscan_all(c, index, 0, "*"))
            .map_err(|e| StoreError::from_driver(e, &format!("error while fetching data for {}: ", index)))
    }
}
