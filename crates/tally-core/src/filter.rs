// Copyright (C) 2025 Tally Billing contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! AND-composed filter expressions and paging for store queries.
//!
//! Column names are `&'static str` chosen by code, never by input; values are
//! always bound as parameters.

use std::fmt::Write as _;

/// A bindable scalar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// Text value.
    Text(String),
    /// Integer value.
    Int(i64),
    /// SQL NULL.
    Null,
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Value::Null)
    }
}

/// One predicate of a filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Clause {
    /// `column = value`
    Eq(&'static str, Value),
    /// `column <> value`
    NotEq(&'static str, Value),
    /// `column IN (values)`; an empty list matches nothing.
    In(&'static str, Vec<Value>),
    /// `column NOT IN (values)`; an empty list matches everything.
    NotIn(&'static str, Vec<Value>),
    /// `column IS NULL`
    IsNull(&'static str),
    /// `column IS NOT NULL`
    IsNotNull(&'static str),
}

/// Conjunction of clauses. An empty filter matches every row.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter {
    clauses: Vec<Clause>,
}

/// Placeholder dialect of the backing database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placeholder {
    /// `?` (SQLite).
    Question,
    /// `$1, $2, ...` (PostgreSQL).
    Dollar,
}

/// Rendered SQL fragment with its bind values in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedSql {
    /// SQL text.
    pub sql: String,
    /// Values to bind, in placeholder order.
    pub values: Vec<Value>,
}

impl Filter {
    /// Empty filter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `column = value`.
    pub fn eq(mut self, column: &'static str, value: impl Into<Value>) -> Self {
        self.clauses.push(Clause::Eq(column, value.into()));
        self
    }

    /// Add `column <> value`.
    pub fn not_eq(mut self, column: &'static str, value: impl Into<Value>) -> Self {
        self.clauses.push(Clause::NotEq(column, value.into()));
        self
    }

    /// Add `column IN (values)`.
    pub fn is_in<V: Into<Value>>(
        mut self,
        column: &'static str,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        self.clauses.push(Clause::In(
            column,
            values.into_iter().map(Into::into).collect(),
        ));
        self
    }

    /// Add `column NOT IN (values)`.
    pub fn not_in<V: Into<Value>>(
        mut self,
        column: &'static str,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        self.clauses.push(Clause::NotIn(
            column,
            values.into_iter().map(Into::into).collect(),
        ));
        self
    }

    /// Add `column IS NULL`.
    pub fn is_null(mut self, column: &'static str) -> Self {
        self.clauses.push(Clause::IsNull(column));
        self
    }

    /// Add `column IS NOT NULL`.
    pub fn is_not_null(mut self, column: &'static str) -> Self {
        self.clauses.push(Clause::IsNotNull(column));
        self
    }

    /// Clauses in insertion order.
    pub fn clauses(&self) -> &[Clause] {
        &self.clauses
    }

    /// Render as a `WHERE ...` clause (or an empty string).
    ///
    /// `first_param` is the index of the first placeholder for the dollar
    /// dialect, so the fragment can follow other bound parameters.
    pub fn render_where(&self, style: Placeholder, first_param: usize) -> RenderedSql {
        let mut sql = String::new();
        let mut values = Vec::new();
        let mut next = first_param;

        let mut placeholder = |sql: &mut String| {
            match style {
                Placeholder::Question => sql.push('?'),
                Placeholder::Dollar => {
                    let _ = write!(sql, "${}", next);
                }
            }
            next += 1;
        };

        for (i, clause) in self.clauses.iter().enumerate() {
            sql.push_str(if i == 0 { " WHERE " } else { " AND " });
            match clause {
                Clause::Eq(column, value) => {
                    let _ = write!(sql, "{} = ", column);
                    placeholder(&mut sql);
                    values.push(value.clone());
                }
                Clause::NotEq(column, value) => {
                    let _ = write!(sql, "{} <> ", column);
                    placeholder(&mut sql);
                    values.push(value.clone());
                }
                Clause::In(_, list) if list.is_empty() => sql.push_str("1 = 0"),
                Clause::NotIn(_, list) if list.is_empty() => sql.push_str("1 = 1"),
                Clause::In(column, list) | Clause::NotIn(column, list) => {
                    let op = if matches!(clause, Clause::In(..)) {
                        "IN"
                    } else {
                        "NOT IN"
                    };
                    let _ = write!(sql, "{} {} (", column, op);
                    for (j, value) in list.iter().enumerate() {
                        if j > 0 {
                            sql.push_str(", ");
                        }
                        placeholder(&mut sql);
                        values.push(value.clone());
                    }
                    sql.push(')');
                }
                Clause::IsNull(column) => {
                    let _ = write!(sql, "{} IS NULL", column);
                }
                Clause::IsNotNull(column) => {
                    let _ = write!(sql, "{} IS NOT NULL", column);
                }
            }
        }

        RenderedSql { sql, values }
    }
}

/// Page selection for list queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Page {
    /// Every matching row.
    #[default]
    All,
    /// `LIMIT limit OFFSET offset`.
    Range {
        /// Rows to skip.
        offset: i64,
        /// Maximum rows returned.
        limit: i64,
    },
}

impl Page {
    /// First `limit` rows.
    pub fn first(limit: i64) -> Self {
        Page::Range { offset: 0, limit }
    }

    /// Render as a `LIMIT ... OFFSET ...` suffix.
    pub fn render(&self) -> String {
        match self {
            Page::All => String::new(),
            Page::Range { offset, limit } => {
                format!(" LIMIT {} OFFSET {}", (*limit).max(0), (*offset).max(0))
            }
        }
    }
}

/// A set of `column = value` assignments for an update.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Patch {
    assignments: Vec<(&'static str, Value)>,
}

impl Patch {
    /// Empty patch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `column = value`.
    pub fn set(mut self, column: &'static str, value: impl Into<Value>) -> Self {
        self.assignments.push((column, value.into()));
        self
    }

    /// Whether the patch has no assignments.
    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty()
    }

    /// Render as `SET a = ?, b = ?`.
    pub fn render_set(&self, style: Placeholder, first_param: usize) -> RenderedSql {
        let mut sql = String::from(" SET ");
        let mut values = Vec::with_capacity(self.assignments.len());
        for (i, (column, value)) in self.assignments.iter().enumerate() {
            if i > 0 {
                sql.push_str(", ");
            }
            match style {
                Placeholder::Question => {
                    let _ = write!(sql, "{} = ?", column);
                }
                Placeholder::Dollar => {
                    let _ = write!(sql, "{} = ${}", column, first_param + i);
                }
            }
            values.push(value.clone());
        }
        RenderedSql { sql, values }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_filter_renders_nothing() {
        let rendered = Filter::new().render_where(Placeholder::Question, 1);
        assert_eq!(rendered.sql, "");
        assert!(rendered.values.is_empty());
    }

    #[test]
    fn test_filter_question_style() {
        let rendered = Filter::new()
            .eq("ticket_id", 7i64)
            .eq("status", "auditing")
            .is_in("id", [1i64, 2, 3])
            .is_null("itsm_ticket_sn")
            .render_where(Placeholder::Question, 1);

        assert_eq!(
            rendered.sql,
            " WHERE ticket_id = ? AND status = ? AND id IN (?, ?, ?) AND itsm_ticket_sn IS NULL"
        );
        assert_eq!(
            rendered.values,
            vec![
                Value::Int(7),
                Value::from("auditing"),
                Value::Int(1),
                Value::Int(2),
                Value::Int(3)
            ]
        );
    }

    #[test]
    fn test_filter_dollar_style_continues_numbering() {
        let rendered = Filter::new()
            .not_eq("state", "synced")
            .not_in("vendor", ["gcp", "azure"])
            .render_where(Placeholder::Dollar, 3);
        assert_eq!(
            rendered.sql,
            " WHERE state <> $3 AND vendor NOT IN ($4, $5)"
        );
        assert_eq!(rendered.values.len(), 3);
    }

    #[test]
    fn test_empty_set_membership() {
        let rendered = Filter::new()
            .is_in::<i64>("id", [])
            .not_in::<i64>("id", [])
            .render_where(Placeholder::Question, 1);
        assert_eq!(rendered.sql, " WHERE 1 = 0 AND 1 = 1");
        assert!(rendered.values.is_empty());
    }

    #[test]
    fn test_patch_and_page() {
        let patch = Patch::new().set("status", "done").set("message", None::<String>);
        let rendered = patch.render_set(Placeholder::Dollar, 1);
        assert_eq!(rendered.sql, " SET status = $1, message = $2");
        assert_eq!(rendered.values[1], Value::Null);

        assert_eq!(Page::All.render(), "");
        assert_eq!(Page::first(10).render(), " LIMIT 10 OFFSET 0");
    }
}
