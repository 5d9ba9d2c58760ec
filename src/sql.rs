//! SQL fragment composition.
//!
//! A [`SqlFragment`] is a tree of raw text, quoted identifiers, bound values,
//! and joined sub-fragments. Formatting flattens the tree into query text
//! with `$N` placeholders plus the parameter list, so user values never end
//! up inside the statement text.

use crate::types::Value;

/// Double-quote an identifier, doubling embedded quotes.
pub fn quote_ident(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 2);
    out.push('"');
    for c in name.chars() {
        if c == '"' {
            out.push('"');
        }
        out.push(c);
    }
    out.push('"');
    out
}

#[derive(Debug, Clone)]
enum Part {
    Raw(String),
    Ident(String),
    Param(Value),
    Group { sep: String, items: Vec<SqlFragment> },
}

/// A composable piece of SQL.
#[derive(Debug, Clone, Default)]
pub struct SqlFragment {
    parts: Vec<Part>,
}

/// Start a fragment from trusted SQL text.
pub fn sql(text: impl Into<String>) -> SqlFragment {
    SqlFragment::default().raw(text)
}

/// A fragment holding a single bound value.
pub fn param(value: impl Into<Value>) -> SqlFragment {
    SqlFragment::default().bind(value)
}

/// A fragment holding a single quoted identifier.
pub fn ident(name: impl Into<String>) -> SqlFragment {
    SqlFragment::default().ident(name)
}

impl SqlFragment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append trusted SQL text verbatim.
    pub fn raw(mut self, text: impl Into<String>) -> Self {
        self.parts.push(Part::Raw(text.into()));
        self
    }

    /// Append a quoted identifier.
    pub fn ident(mut self, name: impl Into<String>) -> Self {
        self.parts.push(Part::Ident(name.into()));
        self
    }

    /// Append a bound value rendered as a `$N` placeholder.
    pub fn bind(mut self, value: impl Into<Value>) -> Self {
        self.parts.push(Part::Param(value.into()));
        self
    }

    /// Append sub-fragments joined by a separator.
    pub fn join(
        mut self,
        sep: impl Into<String>,
        items: impl IntoIterator<Item = SqlFragment>,
    ) -> Self {
        self.parts.push(Part::Group {
            sep: sep.into(),
            items: items.into_iter().collect(),
        });
        self
    }

    /// Append another fragment in place.
    pub fn append(mut self, other: SqlFragment) -> Self {
        self.parts.extend(other.parts);
        self
    }

    /// Flatten to `(text, params)` with placeholders numbered in traversal
    /// order.
    pub fn format(&self) -> (String, Vec<Value>) {
        let mut text = String::new();
        let mut params = Vec::new();
        self.write(&mut text, &mut params);
        (text, params)
    }

    fn write(&self, text: &mut String, params: &mut Vec<Value>) {
        for part in &self.parts {
            match part {
                Part::Raw(s) => text.push_str(s),
                Part::Ident(name) => text.push_str(&quote_ident(name)),
                Part::Param(value) => {
                    params.push(value.clone());
                    text.push('$');
                    text.push_str(&params.len().to_string());
                }
                Part::Group { sep, items } => {
                    for (i, item) in items.iter().enumerate() {
                        if i > 0 {
                            text.push_str(sep);
                        }
                        item.write(text, params);
                    }
                }
            }
        }
    }
}

impl From<&str> for SqlFragment {
    fn from(text: &str) -> Self {
        sql(text)
    }
}

impl From<String> for SqlFragment {
    fn from(text: String) -> Self {
        sql(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholders_number_in_order() {
        let frag = sql("SELECT ").bind(1i32).raw(", ").bind("two").raw(", ").bind(3i64);
        let (text, params) = frag.format();
        assert_eq!(text, "SELECT $1, $2, $3");
        assert_eq!(params.len(), 3);
        assert_eq!(params[1], Value::Text("two".to_string()));
    }

    #[test]
    fn identifiers_are_quoted() {
        let frag = sql("SELECT ").ident("weird \"name\"").raw(" FROM ").ident("t");
        let (text, _) = frag.format();
        assert_eq!(text, r#"SELECT "weird ""name""" FROM "t""#);
    }

    #[test]
    fn join_numbers_across_items() {
        let frag = sql("INSERT INTO t (a, b) VALUES (")
            .join(", ", [param(1i32), param(2i32)])
            .raw(")");
        let (text, params) = frag.format();
        assert_eq!(text, "INSERT INTO t (a, b) VALUES ($1, $2)");
        assert_eq!(params.len(), 2);
    }

    #[test]
    fn values_never_reach_the_text() {
        let input = "injection'); drop table users; --";
        let frag = sql("INSERT INTO users (name) VALUES (").bind(input).raw(")");
        let (text, params) = frag.format();
        assert_eq!(text, "INSERT INTO users (name) VALUES ($1)");
        assert!(!text.contains("drop table"));
        assert_eq!(params[0], Value::Text(input.to_string()));
    }

    #[test]
    fn nested_fragments_compose() {
        let cond = sql("id = ").bind(7i32);
        let frag = sql("SELECT * FROM t WHERE ").append(cond).raw(" AND active = ").bind(true);
        let (text, params) = frag.format();
        assert_eq!(text, "SELECT * FROM t WHERE id = $1 AND active = $2");
        assert_eq!(params.len(), 2);
    }
}
