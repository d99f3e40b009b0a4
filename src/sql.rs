//! Parameterized statement building.
//!
//! Schema and table names are trusted [`Identifier`]s, validated and quoted
//! on render. Values travel separately as bound [`SqlValue`] parameters, or
//! as escaped literals where the statement form has no bind support (COPY).

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SqlError {
    #[error("invalid identifier: {0:?}")]
    InvalidIdentifier(String),
    #[error("invalid column type for {column}: {ty:?}")]
    InvalidColumnType { column: String, ty: String },
}

/// A validated, optionally schema-qualified table or column name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Identifier {
    parts: Vec<String>,
}

impl Identifier {
    pub fn parse(raw: &str) -> Result<Self, SqlError> {
        let parts: Vec<String> = raw.split('.').map(str::to_string).collect();
        if parts.len() > 2 || !parts.iter().all(|p| is_valid_part(p)) {
            return Err(SqlError::InvalidIdentifier(raw.to_string()));
        }
        Ok(Self { parts })
    }

    /// Unquoted dotted name, used as the lookup key for a table.
    pub fn name(&self) -> String {
        self.parts.join(".")
    }

    pub fn quoted(&self) -> String {
        self.parts
            .iter()
            .map(|p| format!("\"{p}\""))
            .collect::<Vec<_>>()
            .join(".")
    }
}

fn is_valid_part(part: &str) -> bool {
    let mut chars = part.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

impl TryFrom<String> for Identifier {
    type Error = SqlError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Identifier> for String {
    fn from(value: Identifier) -> Self {
        value.name()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl SqlValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            Self::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

/// Column list for a table, rendered as `CREATE TABLE IF NOT EXISTS` so
/// that creation is always a no-op against an existing table.
#[derive(Debug, Clone, PartialEq)]
pub struct TableDefinition {
    pub name: Identifier,
    pub columns: Vec<(Identifier, String)>,
}

impl TableDefinition {
    pub fn new(name: Identifier) -> Self {
        Self {
            name,
            columns: Vec::new(),
        }
    }

    /// Adds a column. `ty` is trusted schema text such as `INT SORTKEY`;
    /// it may not contain statement terminators or quotes.
    pub fn column(mut self, name: &str, ty: &str) -> Result<Self, SqlError> {
        let ident = Identifier::parse(name)?;
        let forbidden = |c: char| matches!(c, ';' | '\'' | '"' | '-');
        if ty.trim().is_empty() || ty.contains(forbidden) {
            return Err(SqlError::InvalidColumnType {
                column: name.to_string(),
                ty: ty.to_string(),
            });
        }
        self.columns.push((ident, ty.trim().to_string()));
        Ok(self)
    }
}

/// A trusted SELECT over already-staged tables with bound parameters
/// (`$1`, `$2`, ...).
#[derive(Debug, Clone, PartialEq)]
pub struct SelectStatement {
    pub sql: String,
    pub params: Vec<SqlValue>,
    pub sources: Vec<Identifier>,
}

impl SelectStatement {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
            sources: Vec::new(),
        }
    }

    pub fn bind(mut self, value: SqlValue) -> Self {
        self.params.push(value);
        self
    }

    pub fn from_table(mut self, table: Identifier) -> Self {
        self.sources.push(table);
        self
    }
}

/// Bulk-load formatting options for delimited files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatOptions {
    pub delimiter: char,
    pub ignore_header: usize,
    pub date_format: String,
    pub time_format: String,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            delimiter: ',',
            ignore_header: 1,
            date_format: "YYYY-MM-DD".to_string(),
            time_format: "auto".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StatementKind {
    CreateTable(TableDefinition),
    Truncate(Identifier),
    InsertSelect {
        table: Identifier,
        select: SelectStatement,
    },
    CountRows(Identifier),
    Select(SelectStatement),
    Copy {
        table: Identifier,
        source: String,
        format: FormatOptions,
    },
}

/// A rendered statement together with its structured form.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub kind: StatementKind,
    pub sql: String,
    pub params: Vec<SqlValue>,
}

impl Statement {
    pub fn create_table(def: &TableDefinition) -> Self {
        let columns = def
            .columns
            .iter()
            .map(|(name, ty)| format!("{} {}", name.quoted(), ty))
            .collect::<Vec<_>>()
            .join(", ");
        Self {
            sql: format!("CREATE TABLE IF NOT EXISTS {} ({columns});", def.name.quoted()),
            kind: StatementKind::CreateTable(def.clone()),
            params: Vec::new(),
        }
    }

    pub fn truncate(table: &Identifier) -> Self {
        Self {
            sql: format!("TRUNCATE {};", table.quoted()),
            kind: StatementKind::Truncate(table.clone()),
            params: Vec::new(),
        }
    }

    pub fn insert_select(table: &Identifier, select: &SelectStatement) -> Self {
        Self {
            sql: format!("INSERT INTO {} ({});", table.quoted(), select.sql.trim()),
            params: select.params.clone(),
            kind: StatementKind::InsertSelect {
                table: table.clone(),
                select: select.clone(),
            },
        }
    }

    pub fn count_rows(table: &Identifier) -> Self {
        Self {
            sql: format!("SELECT COUNT(*) FROM {};", table.quoted()),
            kind: StatementKind::CountRows(table.clone()),
            params: Vec::new(),
        }
    }

    /// A row-returning SELECT, issued through `Warehouse::query`.
    pub fn select(select: &SelectStatement) -> Self {
        Self {
            sql: format!("{};", select.sql.trim().trim_end_matches(';')),
            params: select.params.clone(),
            kind: StatementKind::Select(select.clone()),
        }
    }

    /// COPY from object storage. Access credentials are attached by the
    /// warehouse client and never appear in the statement text.
    pub fn copy_from(
        table: &Identifier,
        source: &str,
        region: &str,
        format: &FormatOptions,
    ) -> Self {
        let sql = format!(
            "COPY {} FROM {} REGION {} CSV DELIMITER {} IGNOREHEADER {} DATEFORMAT {} TIMEFORMAT {} ACCEPTINVCHARS;",
            table.quoted(),
            quote_literal(source),
            quote_literal(region),
            quote_literal(&format.delimiter.to_string()),
            format.ignore_header,
            quote_literal(&format.date_format),
            quote_literal(&format.time_format),
        );
        Self {
            sql,
            kind: StatementKind::Copy {
                table: table.clone(),
                source: source.to_string(),
                format: format.clone(),
            },
            params: Vec::new(),
        }
    }
}

/// Single-quoted string literal with embedded quotes and backslashes escaped.
pub fn quote_literal(value: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace('\'', "''");
    format!("'{escaped}'")
}
