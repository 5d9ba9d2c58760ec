//! Lazy queries, rows, and streaming result consumption.
//!
//! A [`Query`] owns everything needed to run: the wire handle, formatted
//! text, parameter values, and options. Nothing touches the socket until a
//! terminal method or [`Query::fetch`] drives it. Results arrive as row
//! chunks; the stream ends with the command tag.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use crate::connection::{CopySink, CopySource, WireInner};
use crate::error::{Error, Result};
use crate::statement::{Column, RowTemplate, Statement};
use crate::types::{Codecs, Oid, Value};

// ============================================================================
// Rows
// ============================================================================

/// One result row: decoded values plus the shared column template.
///
/// Values are reachable by column name (duplicates resolve to the last
/// column of that name) and by position.
#[derive(Debug, Clone)]
pub struct Row {
    template: Arc<RowTemplate>,
    values: Vec<Value>,
}

impl Row {
    pub(crate) fn from_wire(
        template: Arc<RowTemplate>,
        columns: Vec<Option<Bytes>>,
        codecs: &Codecs,
    ) -> Result<Row> {
        let mut values = Vec::with_capacity(columns.len());
        for (i, column) in columns.into_iter().enumerate() {
            let value = match column {
                None => Value::Null,
                Some(bytes) => {
                    let text = std::str::from_utf8(&bytes)
                        .map_err(|e| Error::Type(format!("invalid UTF-8 in column {i}: {e}")))?;
                    let oid = template
                        .columns()
                        .get(i)
                        .map(|c| c.type_oid)
                        .unwrap_or(Oid::UNKNOWN);
                    codecs.parse(oid, text)?
                }
            };
            values.push(value);
        }
        Ok(Row { template, values })
    }

    /// Value of the named column; duplicate names resolve last-wins.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.template
            .position(name)
            .and_then(|i| self.values.get(i))
    }

    /// Value at a position.
    pub fn index(&self, i: usize) -> Option<&Value> {
        self.values.get(i)
    }

    pub fn columns(&self) -> &[Column] {
        self.template.columns()
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Value> {
        self.values.iter()
    }
}

impl<'a> IntoIterator for &'a Row {
    type Item = &'a Value;
    type IntoIter = std::slice::Iter<'a, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.values.iter()
    }
}

// ============================================================================
// Query
// ============================================================================

type Transform<T> = Arc<dyn Fn(Row, usize) -> Result<Option<T>> + Send + Sync>;

/// A lazy query handle.
///
/// Builder combinators overlay options; terminal methods (or [`fetch`])
/// drive one pipeline slot on the shared wire per execution round.
///
/// [`fetch`]: Query::fetch
pub struct Query<T = Row> {
    wire: Arc<WireInner>,
    text: String,
    params: Vec<Value>,
    simple: bool,
    chunk_size: i32,
    stdin: Option<CopySource>,
    stdout: Option<CopySink>,
    transform: Transform<T>,
}

impl Query<Row> {
    pub(crate) fn new(wire: Arc<WireInner>, text: String, params: Vec<Value>) -> Self {
        Query {
            wire,
            text,
            params,
            simple: false,
            chunk_size: 0,
            stdin: None,
            stdout: None,
            transform: Arc::new(|row, _| Ok(Some(row))),
        }
    }
}

impl<T: Send + 'static> Query<T> {
    /// Run via the simple (multi-statement) protocol. Parameters are
    /// rejected by the server in this mode; compose values only into
    /// single-statement extended queries.
    pub fn simple(mut self) -> Self {
        self.simple = true;
        self
    }

    /// Stream results in chunks of at most `chunk_size` rows, one Execute
    /// round per chunk. Portals outside an explicit transaction do not
    /// survive the Sync between rounds, so chunked iteration belongs inside
    /// one.
    pub fn chunked(mut self, chunk_size: u32) -> Self {
        self.chunk_size = chunk_size.max(1) as i32;
        self
    }

    /// Byte source for `COPY ... FROM STDIN`.
    pub fn stdin(mut self, source: impl AsyncRead + Send + Unpin + 'static) -> Self {
        self.stdin = Some(Box::new(source));
        self
    }

    /// In-memory `COPY ... FROM STDIN` payload.
    pub fn stdin_bytes(self, data: impl Into<Vec<u8>>) -> Self {
        self.stdin(std::io::Cursor::new(data.into()))
    }

    /// Byte sink for `COPY ... TO STDOUT`.
    pub fn stdout(mut self, sink: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        self.stdout = Some(Box::new(sink));
        self
    }

    /// Transform every row, preserving chunk structure and the global row
    /// index.
    pub fn map<U: Send + 'static>(
        self,
        f: impl Fn(T) -> U + Send + Sync + 'static,
    ) -> Query<U> {
        let (query, prev) = self.split_transform();
        query.with_transform(Arc::new(move |row, idx| Ok(prev(row, idx)?.map(&f))))
    }

    /// Fallible row transform; errors surface at the chunk that contains
    /// the offending row.
    pub fn try_map<U: Send + 'static>(
        self,
        f: impl Fn(T) -> Result<U> + Send + Sync + 'static,
    ) -> Query<U> {
        let (query, prev) = self.split_transform();
        query.with_transform(Arc::new(move |row, idx| match prev(row, idx)? {
            Some(v) => f(v).map(Some),
            None => Ok(None),
        }))
    }

    /// Keep only rows matching the predicate.
    pub fn filter(self, f: impl Fn(&T) -> bool + Send + Sync + 'static) -> Query<T> {
        let (query, prev) = self.split_transform();
        query.with_transform(Arc::new(move |row, idx| {
            Ok(prev(row, idx)?.filter(|v| f(v)))
        }))
    }

    fn split_transform(self) -> (Query<()>, Transform<T>) {
        let Query {
            wire,
            text,
            params,
            simple,
            chunk_size,
            stdin,
            stdout,
            transform,
        } = self;
        let query = Query {
            wire,
            text,
            params,
            simple,
            chunk_size,
            stdin,
            stdout,
            transform: Arc::new(|_, _| Ok(None)),
        };
        (query, transform)
    }

    fn with_transform<U>(self, transform: Transform<U>) -> Query<U> {
        let Query {
            wire,
            text,
            params,
            simple,
            chunk_size,
            stdin,
            stdout,
            transform: _,
        } = self;
        Query {
            wire,
            text,
            params,
            simple,
            chunk_size,
            stdin,
            stdout,
            transform,
        }
    }

    /// Turn the query into a chunk stream. No I/O happens until the first
    /// [`RowStream::next_chunk`].
    pub fn fetch(self) -> RowStream<T> {
        RowStream {
            wire: self.wire,
            transform: self.transform,
            row_index: 0,
            tag: None,
            stdout: self.stdout,
            state: State::Init {
                text: self.text,
                params: self.params,
                simple: self.simple,
                chunk_size: self.chunk_size,
                stdin: self.stdin,
            },
        }
    }

    /// All rows plus the command tag.
    pub async fn collect(self) -> Result<(Vec<T>, String)> {
        let mut stream = self.fetch();
        let mut rows = Vec::new();
        while let Some(chunk) = stream.next_chunk().await? {
            rows.extend(chunk);
        }
        Ok((rows, stream.take_tag()))
    }

    /// Up to `limit` rows; stops consuming (and reclaims the portal) once
    /// the limit is reached.
    pub async fn collect_n(self, limit: usize) -> Result<(Vec<T>, String)> {
        let mut stream = self.fetch();
        let mut rows = Vec::new();
        while rows.len() < limit {
            match stream.next_chunk().await? {
                Some(chunk) => {
                    for v in chunk {
                        if rows.len() < limit {
                            rows.push(v);
                        }
                    }
                }
                None => break,
            }
        }
        stream.cancel().await;
        Ok((rows, stream.take_tag()))
    }

    /// Drain the query and return the command tag.
    pub async fn execute(self) -> Result<String> {
        let mut stream = self.fetch();
        while stream.next_chunk().await?.is_some() {}
        Ok(stream.take_tag())
    }

    /// Number of rows the query produces (after any filter).
    pub async fn count(self) -> Result<u64> {
        let mut stream = self.fetch();
        let mut n = 0u64;
        while let Some(chunk) = stream.next_chunk().await? {
            n += chunk.len() as u64;
        }
        Ok(n)
    }

    /// First row, or `None` on an empty result.
    pub async fn first_opt(self) -> Result<Option<T>> {
        let mut stream = self.fetch();
        loop {
            match stream.next_chunk().await? {
                Some(chunk) => {
                    if let Some(v) = chunk.into_iter().next() {
                        stream.cancel().await;
                        return Ok(Some(v));
                    }
                }
                None => return Ok(None),
            }
        }
    }

    /// First row; an empty result is a type error.
    pub async fn first(self) -> Result<T> {
        self.first_opt()
            .await?
            .ok_or_else(|| Error::Type("expected one row, got none".into()))
    }

    /// First row, or the default on an empty result.
    pub async fn first_or(self, default: T) -> Result<T> {
        Ok(self.first_opt().await?.unwrap_or(default))
    }
}

impl<T> std::fmt::Debug for Query<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Query")
            .field("text", &self.text)
            .field("params", &self.params.len())
            .field("simple", &self.simple)
            .field("chunk_size", &self.chunk_size)
            .finish()
    }
}

// ============================================================================
// Row stream
// ============================================================================

enum State {
    Init {
        text: String,
        params: Vec<Value>,
        simple: bool,
        chunk_size: i32,
        stdin: Option<CopySource>,
    },
    Suspended {
        stmt: Arc<Statement>,
        portal: String,
        template: Option<Arc<RowTemplate>>,
        chunk_size: i32,
    },
    Buffered {
        chunks: VecDeque<Vec<Row>>,
    },
    Done,
}

/// An async sequence of row chunks ending with a command tag.
pub struct RowStream<T> {
    wire: Arc<WireInner>,
    transform: Transform<T>,
    row_index: usize,
    tag: Option<String>,
    stdout: Option<CopySink>,
    state: State,
}

impl<T> RowStream<T> {
    /// The next chunk, or `None` once the stream is exhausted. After `None`
    /// the command tag is available from [`tag`](Self::tag).
    pub async fn next_chunk(&mut self) -> Result<Option<Vec<T>>> {
        match self.next_raw().await? {
            Some(rows) => {
                let mut out = Vec::with_capacity(rows.len());
                for row in rows {
                    let idx = self.row_index;
                    self.row_index += 1;
                    if let Some(v) = (self.transform)(row, idx)? {
                        out.push(v);
                    }
                }
                Ok(Some(out))
            }
            None => Ok(None),
        }
    }

    /// The command tag, once the stream has completed.
    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    fn take_tag(&mut self) -> String {
        self.tag.take().unwrap_or_default()
    }

    /// Stop consuming. An open portal is closed right away.
    pub async fn cancel(&mut self) {
        if let State::Suspended { portal, .. } = std::mem::replace(&mut self.state, State::Done) {
            self.close_portal_quiet(&portal).await;
        }
    }

    async fn next_raw(&mut self) -> Result<Option<Vec<Row>>> {
        loop {
            match std::mem::replace(&mut self.state, State::Done) {
                State::Init {
                    text,
                    params,
                    simple,
                    chunk_size,
                    stdin,
                } => {
                    if simple {
                        let (chunks, tag) =
                            self.wire.run_simple(&text, stdin, &mut self.stdout).await?;
                        self.tag = Some(tag);
                        self.state = State::Buffered {
                            chunks: chunks.into(),
                        };
                        continue;
                    }

                    let stmt = self.wire.statement_for(&text);
                    let info = stmt.ensure(|| self.wire.run_parse(&stmt)).await?.clone();
                    let serialized =
                        serialize_params(self.wire.codecs(), &info.param_types, &params)?;
                    let portal = stmt.next_portal();

                    if chunk_size <= 0 {
                        // Fast path: Bind/Execute/Close in one pipeline.
                        match self
                            .wire
                            .run_bind_execute(
                                &stmt,
                                &portal,
                                &serialized,
                                0,
                                true,
                                stdin,
                                info.template.as_ref(),
                                &mut self.stdout,
                            )
                            .await
                        {
                            Ok(outcome) => {
                                self.tag = Some(outcome.tag);
                                let mut chunks = VecDeque::new();
                                if !outcome.rows.is_empty() {
                                    chunks.push_back(outcome.rows);
                                }
                                self.state = State::Buffered { chunks };
                                continue;
                            }
                            Err(e) => {
                                self.close_portal_quiet(&portal).await;
                                return Err(e);
                            }
                        }
                    }

                    match self
                        .wire
                        .run_bind_execute(
                            &stmt,
                            &portal,
                            &serialized,
                            chunk_size,
                            false,
                            stdin,
                            info.template.as_ref(),
                            &mut self.stdout,
                        )
                        .await
                    {
                        Ok(outcome) => {
                            if outcome.done {
                                self.tag = Some(outcome.tag);
                                self.close_portal_quiet(&portal).await;
                                if outcome.rows.is_empty() {
                                    return Ok(None);
                                }
                                return Ok(Some(outcome.rows));
                            }
                            let template = info.template.clone();
                            self.state = State::Suspended {
                                stmt,
                                portal,
                                template,
                                chunk_size,
                            };
                            return Ok(Some(outcome.rows));
                        }
                        Err(e) => {
                            self.close_portal_quiet(&portal).await;
                            return Err(e);
                        }
                    }
                }
                State::Suspended {
                    stmt,
                    portal,
                    template,
                    chunk_size,
                } => {
                    match self
                        .wire
                        .run_execute_more(&portal, chunk_size, template.as_ref(), &mut self.stdout)
                        .await
                    {
                        Ok(outcome) => {
                            if outcome.done {
                                self.tag = Some(outcome.tag);
                                self.close_portal_quiet(&portal).await;
                                if outcome.rows.is_empty() {
                                    return Ok(None);
                                }
                                return Ok(Some(outcome.rows));
                            }
                            self.state = State::Suspended {
                                stmt,
                                portal,
                                template,
                                chunk_size,
                            };
                            return Ok(Some(outcome.rows));
                        }
                        Err(e) => {
                            self.close_portal_quiet(&portal).await;
                            return Err(e);
                        }
                    }
                }
                State::Buffered { mut chunks } => match chunks.pop_front() {
                    Some(rows) => {
                        self.state = State::Buffered { chunks };
                        return Ok(Some(rows));
                    }
                    None => return Ok(None),
                },
                State::Done => return Ok(None),
            }
        }
    }

    async fn close_portal_quiet(&self, portal: &str) {
        if let Err(e) = self.wire.run_close_portal(portal).await {
            debug!(portal, error = %e, "portal close failed");
        }
    }
}

impl<T> Drop for RowStream<T> {
    fn drop(&mut self) {
        if let State::Suspended { portal, .. } = std::mem::replace(&mut self.state, State::Done) {
            let wire = Arc::clone(&self.wire);
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    if let Err(e) = wire.run_close_portal(&portal).await {
                        debug!(portal = %portal, error = %e, "portal close on drop failed");
                    }
                });
            }
        }
    }
}

fn serialize_params(
    codecs: &Codecs,
    param_types: &[Oid],
    params: &[Value],
) -> Result<Vec<Option<String>>> {
    params
        .iter()
        .enumerate()
        .map(|(i, value)| {
            let oid = param_types.get(i).copied().unwrap_or(Oid::UNKNOWN);
            codecs.format(oid, value)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::FieldDescription;

    fn template(names_oids: &[(&str, Oid)]) -> Arc<RowTemplate> {
        let fields: Vec<FieldDescription> = names_oids
            .iter()
            .map(|(n, oid)| FieldDescription {
                name: n.to_string(),
                table_oid: 0,
                column_attr: 0,
                type_oid: *oid,
                type_size: -1,
                type_modifier: -1,
                format: 0,
            })
            .collect();
        Arc::new(RowTemplate::new(&fields))
    }

    #[test]
    fn row_decodes_by_declared_type() {
        let codecs = Codecs::builtin();
        let row = Row::from_wire(
            template(&[("id", Oid::INT4), ("name", Oid::TEXT), ("ok", Oid::BOOL)]),
            vec![
                Some(Bytes::from_static(b"42")),
                Some(Bytes::from_static(b"alice")),
                None,
            ],
            &codecs,
        )
        .unwrap();

        assert_eq!(row.get("id"), Some(&Value::Int4(42)));
        assert_eq!(row.get("name"), Some(&Value::Text("alice".to_string())));
        assert_eq!(row.get("ok"), Some(&Value::Null));
        assert_eq!(row.get("missing"), None);
        assert_eq!(row.index(0), Some(&Value::Int4(42)));
    }

    #[test]
    fn row_iterates_in_declared_order() {
        let codecs = Codecs::builtin();
        let row = Row::from_wire(
            template(&[("a", Oid::INT4), ("b", Oid::INT4)]),
            vec![Some(Bytes::from_static(b"1")), Some(Bytes::from_static(b"2"))],
            &codecs,
        )
        .unwrap();
        let values: Vec<&Value> = row.iter().collect();
        assert_eq!(values, vec![&Value::Int4(1), &Value::Int4(2)]);
    }

    #[test]
    fn duplicate_column_names_read_last() {
        let codecs = Codecs::builtin();
        let row = Row::from_wire(
            template(&[("x", Oid::INT4), ("x", Oid::INT4)]),
            vec![Some(Bytes::from_static(b"1")), Some(Bytes::from_static(b"2"))],
            &codecs,
        )
        .unwrap();
        assert_eq!(row.get("x"), Some(&Value::Int4(2)));
    }

    #[test]
    fn serialize_params_uses_declared_oids() {
        let codecs = Codecs::builtin();
        let out = serialize_params(
            &codecs,
            &[Oid::INT2, Oid::BOOL],
            &[Value::Int4(256), Value::Text("n".into())],
        )
        .unwrap();
        assert_eq!(out, vec![Some("256".to_string()), Some("f".to_string())]);
    }

    #[test]
    fn serialize_params_falls_back_to_text() {
        let codecs = Codecs::builtin();
        let out = serialize_params(&codecs, &[], &[Value::Int4(7), Value::Null]).unwrap();
        assert_eq!(out, vec![Some("7".to_string()), None]);
    }

    #[test]
    fn serialize_params_surfaces_range_errors() {
        let codecs = Codecs::builtin();
        let err = serialize_params(&codecs, &[Oid::INT2], &[Value::Int4(100_000)]).unwrap_err();
        assert!(matches!(err, Error::Type(_)));
    }
}
