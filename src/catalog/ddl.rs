//! DDL statement recognition
//!
//! Identifies schema-changing statements in QUERY events and extracts the
//! database and table they touch, so DDL can be filtered like row events.

use serde::{Deserialize, Serialize};

/// Kind of DDL statement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DdlKind {
    CreateTable,
    AlterTable,
    DropTable,
    RenameTable,
    TruncateTable,
    CreateIndex,
    DropIndex,
    CreateDatabase,
    AlterDatabase,
    DropDatabase,
    CreateView,
    DropView,
    Other,
}

/// A recognised DDL statement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DdlStatement {
    pub kind: DdlKind,
    /// Qualifier from the statement, else the event's default database
    pub database: String,
    /// Empty for database-level statements
    pub table: String,
}

const DDL_KEYWORDS: [&str; 5] = ["CREATE", "ALTER", "DROP", "RENAME", "TRUNCATE"];

/// Strip leading whitespace and `/* ... */` or `-- ...` comments
pub fn strip_leading_comments(sql: &str) -> &str {
    let mut rest = sql.trim_start();
    loop {
        if let Some(after) = rest.strip_prefix("/*") {
            match after.find("*/") {
                Some(end) => rest = after[end + 2..].trim_start(),
                None => return "",
            }
        } else if rest.starts_with("--") || rest.starts_with('#') {
            match rest.find('\n') {
                Some(end) => rest = rest[end + 1..].trim_start(),
                None => return "",
            }
        } else {
            return rest;
        }
    }
}

fn first_keyword(sql: &str) -> String {
    sql.split(|c: char| c.is_whitespace() || c == '(' || c == ';')
        .next()
        .unwrap_or_default()
        .to_ascii_uppercase()
}

/// Check if a statement changes schema
pub fn is_ddl(sql: &str) -> bool {
    let keyword = first_keyword(strip_leading_comments(sql));
    DDL_KEYWORDS.contains(&keyword.as_str())
}

/// Recognise a DDL statement; `default_db` is the event's current database
pub fn parse_ddl(sql: &str, default_db: &str) -> Option<DdlStatement> {
    let body = strip_leading_comments(sql);
    if !is_ddl(body) {
        return None;
    }

    // ASCII upper-casing keeps byte offsets valid for slicing `body`
    let upper = body.to_ascii_uppercase();
    let words: Vec<&str> = upper.split_whitespace().take(4).collect();

    let (kind, anchor) = match words.as_slice() {
        ["CREATE", "TABLE", ..] | ["CREATE", "TEMPORARY", "TABLE", ..] => {
            (DdlKind::CreateTable, "TABLE")
        }
        ["ALTER", "TABLE", ..] | ["ALTER", "IGNORE", "TABLE", ..] => (DdlKind::AlterTable, "TABLE"),
        ["DROP", "TABLE", ..] | ["DROP", "TEMPORARY", "TABLE", ..] => (DdlKind::DropTable, "TABLE"),
        ["RENAME", "TABLE", ..] => (DdlKind::RenameTable, "TABLE"),
        ["TRUNCATE", "TABLE", ..] => (DdlKind::TruncateTable, "TABLE"),
        ["TRUNCATE", ..] => (DdlKind::TruncateTable, "TRUNCATE"),
        ["CREATE", "DATABASE", ..] | ["CREATE", "SCHEMA", ..] => {
            (DdlKind::CreateDatabase, words[1])
        }
        ["ALTER", "DATABASE", ..] | ["ALTER", "SCHEMA", ..] => (DdlKind::AlterDatabase, words[1]),
        ["DROP", "DATABASE", ..] | ["DROP", "SCHEMA", ..] => (DdlKind::DropDatabase, words[1]),
        ["DROP", "INDEX", ..] => (DdlKind::DropIndex, " ON "),
        ["CREATE", "VIEW", ..] | ["CREATE", "OR", ..] => (DdlKind::CreateView, "VIEW"),
        ["DROP", "VIEW", ..] => (DdlKind::DropView, "VIEW"),
        _ if upper.contains(" INDEX ") && upper.starts_with("CREATE") => {
            (DdlKind::CreateIndex, " ON ")
        }
        _ => (DdlKind::Other, ""),
    };

    let name = if anchor.is_empty() {
        None
    } else {
        object_name_after(body, &upper, anchor)
    };

    let (database, table) = match (kind, name) {
        (DdlKind::CreateDatabase | DdlKind::AlterDatabase | DdlKind::DropDatabase, Some(name)) => {
            (name, String::new())
        }
        (_, Some(name)) => match name.split_once('.') {
            Some((db, table)) => (unquote(db), unquote(table)),
            None => (default_db.to_string(), name),
        },
        (_, None) => (default_db.to_string(), String::new()),
    };

    Some(DdlStatement {
        kind,
        database,
        table: unquote(&table),
    })
}

/// Object name following `anchor`, skipping `IF [NOT] EXISTS`
fn object_name_after(body: &str, upper: &str, anchor: &str) -> Option<String> {
    let mut pos = upper.find(anchor)? + anchor.len();

    if upper[pos..].trim_start().starts_with("IF ") {
        pos += upper[pos..].find("EXISTS")? + "EXISTS".len();
    }

    let rest = body[pos..].trim_start();
    let end = rest
        .find(|c: char| c.is_whitespace() || c == '(' || c == ';' || c == ',')
        .unwrap_or(rest.len());
    let name = &rest[..end];
    if name.is_empty() {
        return None;
    }

    Some(unquote_qualified(name))
}

fn unquote(name: &str) -> String {
    name.trim_matches('`').trim_matches('"').to_string()
}

/// Unquote each part of `db`.`table`, keeping the dot
fn unquote_qualified(name: &str) -> String {
    name.split('.').map(unquote).collect::<Vec<_>>().join(".")
}
