//! Prepared statements and the per-wire statement cache.
//!
//! Statements are cached by the exact formatted query text. A statement's
//! parse+describe result is memoized through an async once-cell: concurrent
//! users await a single Parse/Describe exchange, and a failed attempt leaves
//! the cell empty so the next use retries.

use std::collections::HashMap;
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use lru::LruCache;
use tokio::sync::OnceCell;

use crate::error::Result;
use crate::protocol::FieldDescription;
use crate::types::Oid;

// ============================================================================
// Row template
// ============================================================================

/// One result column: name plus declared type.
#[derive(Debug, Clone)]
pub struct Column {
    pub name: String,
    pub type_oid: Oid,
}

/// Shared description of a result row shape, built from a `RowDescription`.
/// Name lookups resolve duplicates last-wins.
#[derive(Debug)]
pub struct RowTemplate {
    columns: Vec<Column>,
    by_name: HashMap<String, usize>,
}

impl RowTemplate {
    pub fn new(fields: &[FieldDescription]) -> Self {
        let columns: Vec<Column> = fields
            .iter()
            .map(|f| Column {
                name: f.name.clone(),
                type_oid: f.type_oid,
            })
            .collect();
        let mut by_name = HashMap::with_capacity(columns.len());
        for (i, col) in columns.iter().enumerate() {
            by_name.insert(col.name.clone(), i);
        }
        Self { columns, by_name }
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }
}

// ============================================================================
// Statement
// ============================================================================

/// Parse+describe result for a statement.
#[derive(Debug, Clone)]
pub struct StatementInfo {
    /// Parameter OIDs from `ParameterDescription`.
    pub param_types: Vec<Oid>,
    /// Result shape from `RowDescription`, absent for row-less statements.
    pub template: Option<Arc<RowTemplate>>,
}

/// A server-side prepared statement owned by one wire.
#[derive(Debug)]
pub struct Statement {
    /// Server-side name (`__st<N>`).
    pub name: String,
    /// The exact query text this statement was parsed from.
    pub query: String,
    info: OnceCell<StatementInfo>,
    next_portal: AtomicU64,
}

impl Statement {
    pub fn new(name: String, query: String) -> Self {
        Self {
            name,
            query,
            info: OnceCell::new(),
            next_portal: AtomicU64::new(0),
        }
    }

    /// The memoized describe result, running `prepare` at most once at a
    /// time. A failed `prepare` leaves the cell empty so a later call can
    /// retry.
    pub async fn ensure<F, Fut>(&self, prepare: F) -> Result<&StatementInfo>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<StatementInfo>>,
    {
        self.info.get_or_try_init(prepare).await
    }

    /// Next portal name for this statement: `"<stmt>_<k>"`.
    pub fn next_portal(&self) -> String {
        let k = self.next_portal.fetch_add(1, Ordering::Relaxed);
        format!("{}_{}", self.name, k)
    }
}

// ============================================================================
// Statement cache
// ============================================================================

/// LRU cache of prepared statements keyed by query text.
pub struct StatementCache {
    cache: LruCache<String, Arc<Statement>>,
    next_id: u64,
}

impl StatementCache {
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity.max(1)).unwrap();
        Self {
            cache: LruCache::new(cap),
            next_id: 0,
        }
    }

    /// Cached statement for a query text, or a fresh one with the next
    /// `__st<N>` name. Returns the name of any statement evicted to make
    /// room, so the caller can close it on the server.
    pub fn get_or_insert(&mut self, query: &str) -> (Arc<Statement>, Option<String>) {
        if let Some(stmt) = self.cache.get(query) {
            return (Arc::clone(stmt), None);
        }
        let name = format!("__st{}", self.next_id);
        self.next_id += 1;
        let stmt = Arc::new(Statement::new(name, query.to_string()));

        let evicted = (self.cache.len() >= self.cache.cap().get())
            .then(|| self.cache.peek_lru().map(|(_, s)| s.name.clone()))
            .flatten();
        self.cache.put(query.to_string(), Arc::clone(&stmt));
        (stmt, evicted)
    }

    /// Drop a statement whose server-side parse failed.
    pub fn remove(&mut self, query: &str) -> Option<Arc<Statement>> {
        self.cache.pop(query)
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// Forget everything and restart the name counter. Used on disconnect:
    /// server-side statements die with the session.
    pub fn clear(&mut self) {
        self.cache.clear();
        self.next_id = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(names: &[&str]) -> Vec<FieldDescription> {
        names
            .iter()
            .map(|n| FieldDescription {
                name: n.to_string(),
                table_oid: 0,
                column_attr: 0,
                type_oid: Oid::TEXT,
                type_size: -1,
                type_modifier: -1,
                format: 0,
            })
            .collect()
    }

    #[test]
    fn cache_reuses_statements_by_text() {
        let mut cache = StatementCache::new(10);
        let (a, _) = cache.get_or_insert("SELECT 1");
        let (b, _) = cache.get_or_insert("SELECT 1");
        let (c, _) = cache.get_or_insert("SELECT 2");

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.name, "__st0");
        assert_eq!(c.name, "__st1");
    }

    #[test]
    fn cache_reports_eviction() {
        let mut cache = StatementCache::new(2);
        cache.get_or_insert("q1");
        cache.get_or_insert("q2");
        // Touch q1 so q2 becomes least recently used.
        cache.get_or_insert("q1");
        let (_, evicted) = cache.get_or_insert("q3");
        assert_eq!(evicted, Some("__st1".to_string()));
    }

    #[test]
    fn clear_resets_the_name_counter() {
        let mut cache = StatementCache::new(10);
        cache.get_or_insert("q1");
        cache.get_or_insert("q2");
        cache.clear();
        let (stmt, _) = cache.get_or_insert("q3");
        assert_eq!(stmt.name, "__st0");
    }

    #[test]
    fn portal_names_count_per_statement() {
        let stmt = Statement::new("__st4".to_string(), "SELECT 1".to_string());
        assert_eq!(stmt.next_portal(), "__st4_0");
        assert_eq!(stmt.next_portal(), "__st4_1");
    }

    #[tokio::test]
    async fn ensure_retries_after_failure() {
        let stmt = Statement::new("__st0".to_string(), "SELECT 1".to_string());

        let err = stmt
            .ensure(|| async { Err(crate::error::Error::ConnectionClosed) })
            .await
            .unwrap_err();
        assert!(matches!(err, crate::error::Error::ConnectionClosed));

        let info = stmt
            .ensure(|| async {
                Ok(StatementInfo {
                    param_types: vec![Oid::INT4],
                    template: Some(Arc::new(RowTemplate::new(&fields(&["a"])))),
                })
            })
            .await
            .unwrap();
        assert_eq!(info.param_types, vec![Oid::INT4]);
    }

    #[test]
    fn duplicate_column_names_resolve_last() {
        let template = RowTemplate::new(&fields(&["a", "b", "a"]));
        assert_eq!(template.position("a"), Some(2));
        assert_eq!(template.position("b"), Some(1));
    }
}
