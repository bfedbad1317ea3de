//! Static read-only check for generated SQL.
//!
//! `validate` is a pure function of the SQL text and the session schema. The
//! only way to obtain a [`ValidatedQuery`] is through it, and the table store
//! only executes `ValidatedQuery` values, so unvalidated text never reaches
//! the engine.

pub mod lexer;

use std::collections::{HashMap, HashSet};
use std::fmt;

use lexer::{Token, TokenKind};

use crate::store::TableSchema;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("empty statement")]
    Empty,

    #[error("could not parse statement: {0}")]
    Syntax(String),

    #[error("only a single statement is allowed")]
    MultipleStatements,

    #[error("only SELECT queries are allowed, found {0}")]
    NotSelect(String),

    #[error("forbidden keyword: {0}")]
    ForbiddenKeyword(String),

    #[error("forbidden function: {0}")]
    ForbiddenFunction(String),

    #[error("access to system table {0} is not allowed")]
    SystemTable(String),

    #[error("unknown table: {0}")]
    UnknownTable(String),

    #[error("unknown column: {0}")]
    UnknownColumn(String),

    #[error("query parameters are not supported")]
    Parameters,
}

/// SQL text that passed [`validate`]. Trailing semicolons and comments are
/// stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedQuery {
    sql: String,
}

impl ValidatedQuery {
    pub fn as_str(&self) -> &str {
        &self.sql
    }
}

impl fmt::Display for ValidatedQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.sql)
    }
}

/// Verbs that never appear in a read-only statement.
const FORBIDDEN: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "DROP", "CREATE", "ALTER", "ATTACH", "DETACH", "PRAGMA", "VACUUM",
    "REPLACE", "REINDEX", "TRUNCATE", "RETURNING", "UPSERT",
];

/// Statement verbs from other dialects or transaction control. Also legal
/// column names (`SYS_STATUS.load`), so a known column wins.
const FORBIDDEN_UNLESS_COLUMN: &[&str] = &[
    "ANALYZE", "EXPLAIN", "BEGIN", "COMMIT", "ROLLBACK", "SAVEPOINT", "RELEASE", "GRANT", "REVOKE", "COPY",
    "EXPORT", "IMPORT", "INSTALL", "LOAD", "CALL", "SET",
];

const FORBIDDEN_FUNCTIONS: &[&str] = &[
    "load_extension",
    "readfile",
    "writefile",
    "edit",
    "fts3_tokenizer",
    "zipfile",
    "sqlar_compress",
    "sqlar_uncompress",
];

const SYSTEM_PREFIXES: &[&str] = &["sqlite_", "pragma_", "information_schema", "duckdb_"];

/// Rowid aliases every ordinary table has.
const PSEUDO_COLUMNS: &[&str] = &["rowid", "oid", "_rowid_"];

const KEYWORDS: &[&str] = &[
    "ALL", "AND", "AS", "ASC", "BETWEEN", "BIGINT", "BINARY", "BLOB", "BOOLEAN", "BY", "CASE", "CAST",
    "COLLATE", "CROSS", "CURRENT", "CURRENT_DATE", "CURRENT_TIME", "CURRENT_TIMESTAMP", "DESC", "DISTINCT",
    "DOUBLE", "ELSE", "END", "ESCAPE", "EXCEPT", "EXCLUDE", "EXISTS", "FALSE", "FILTER", "FIRST", "FLOAT",
    "FOLLOWING", "FROM", "FULL", "GLOB", "GROUP", "GROUPS", "HAVING", "IN", "INDEXED", "INNER", "INT",
    "INTEGER", "INTERSECT", "IS", "ISNULL", "JOIN", "LAST", "LEFT", "LIKE", "LIMIT", "MATCH", "MATERIALIZED",
    "NATURAL", "NO", "NOCASE", "NOT", "NOTNULL", "NULL", "NULLS", "NUMERIC", "OFFSET", "ON", "OR", "ORDER",
    "OTHERS", "OUTER", "OVER", "PARTITION", "PRECEDING", "RANGE", "REAL", "RECURSIVE", "REGEXP", "RIGHT",
    "ROW", "ROWS", "RTRIM", "SELECT", "TEXT", "THEN", "TIES", "TRUE", "UNBOUNDED", "UNION", "USING",
    "VALUES", "VARCHAR", "WHEN", "WHERE", "WINDOW", "WITH",
];

/// Keywords that end a FROM list at the current nesting level.
const CLAUSE_KEYWORDS: &[&str] = &[
    "WHERE", "GROUP", "ORDER", "HAVING", "LIMIT", "UNION", "EXCEPT", "INTERSECT", "WINDOW", "ON", "USING",
];

fn is_keyword(word: &str) -> bool {
    KEYWORDS.iter().any(|k| k.eq_ignore_ascii_case(word))
}

fn contains_ci(list: &[&str], word: &str) -> bool {
    list.iter().any(|k| k.eq_ignore_ascii_case(word))
}

fn is_identifier(token: &Token) -> bool {
    match token.kind {
        TokenKind::QuotedIdent => true,
        TokenKind::Word => !is_keyword(&token.text),
        _ => false,
    }
}

fn is_system_table(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    SYSTEM_PREFIXES.iter().any(|p| lower.starts_with(p))
}

/// Names introduced by the statement itself.
#[derive(Default)]
struct Scope {
    /// CTE and named-window names.
    ctes: HashSet<String>,
    /// Alias -> underlying schema table, `None` for derived tables, CTEs and
    /// select-list aliases.
    aliases: HashMap<String, Option<String>>,
    /// Token positions that define a name and are not column references.
    definitions: HashSet<usize>,
}

impl Scope {
    fn is_cte(&self, name: &str) -> bool {
        self.ctes.contains(&name.to_ascii_lowercase())
    }

    fn add_alias(&mut self, name: &str, table: Option<String>) {
        self.aliases.entry(name.to_ascii_lowercase()).or_insert(table);
    }

    fn alias(&self, name: &str) -> Option<&Option<String>> {
        self.aliases.get(&name.to_ascii_lowercase())
    }
}

/// Check that `sql` is a single read-only selection over the session's
/// tables and columns.
pub fn validate(sql: &str, schema: &TableSchema) -> Result<ValidatedQuery, ValidationError> {
    let mut tokens = lexer::tokenize(sql)?;

    while tokens.last().is_some_and(|t| t.is_punct(";")) {
        tokens.pop();
    }
    if tokens.iter().any(|t| t.is_punct(";")) {
        return Err(ValidationError::MultipleStatements);
    }

    let first = tokens.first().ok_or(ValidationError::Empty)?;
    if !(first.is_word("SELECT") || first.is_word("WITH")) {
        return Err(ValidationError::NotSelect(first.text.to_ascii_uppercase()));
    }

    check_balanced(&tokens)?;
    check_forbidden(&tokens, schema)?;

    let scope = collect_scope(&tokens, schema)?;
    check_columns(&tokens, schema, &scope)?;

    let start = tokens[0].start;
    let end = tokens[tokens.len() - 1].end;
    Ok(ValidatedQuery {
        sql: sql[start..end].to_string(),
    })
}

fn check_balanced(tokens: &[Token]) -> Result<(), ValidationError> {
    let mut depth: i32 = 0;
    for token in tokens {
        if token.is_punct("(") {
            depth += 1;
        } else if token.is_punct(")") {
            depth -= 1;
            if depth < 0 {
                return Err(ValidationError::Syntax("unbalanced parentheses".to_string()));
            }
        }
    }
    if depth != 0 {
        return Err(ValidationError::Syntax("unbalanced parentheses".to_string()));
    }
    Ok(())
}

fn check_forbidden(tokens: &[Token], schema: &TableSchema) -> Result<(), ValidationError> {
    for (i, token) in tokens.iter().enumerate() {
        let next_is_call = tokens.get(i + 1).is_some_and(|t| t.is_punct("("));
        match token.kind {
            TokenKind::Param => return Err(ValidationError::Parameters),
            TokenKind::Word => {
                let word = token.text.as_str();
                if next_is_call && contains_ci(FORBIDDEN_FUNCTIONS, word) {
                    return Err(ValidationError::ForbiddenFunction(word.to_ascii_lowercase()));
                }
                // replace(x, y, z) is a string function
                if word.eq_ignore_ascii_case("REPLACE") && next_is_call {
                    continue;
                }
                if contains_ci(FORBIDDEN, word) {
                    return Err(ValidationError::ForbiddenKeyword(word.to_ascii_uppercase()));
                }
                if contains_ci(FORBIDDEN_UNLESS_COLUMN, word) && !schema.has_column_anywhere(word) {
                    return Err(ValidationError::ForbiddenKeyword(word.to_ascii_uppercase()));
                }
            }
            _ => {}
        }
    }
    Ok(())
}

/// Index of the `)` matching the `(` at `open`.
fn matching_paren(tokens: &[Token], open: usize) -> Option<usize> {
    let mut depth = 0;
    for (i, token) in tokens.iter().enumerate().skip(open) {
        if token.is_punct("(") {
            depth += 1;
        } else if token.is_punct(")") {
            depth -= 1;
            if depth == 0 {
                return Some(i);
            }
        }
    }
    None
}

fn collect_scope(tokens: &[Token], schema: &TableSchema) -> Result<Scope, ValidationError> {
    let mut scope = Scope::default();

    // CTEs and named windows: `name [(cols)] AS (` after WITH, RECURSIVE,
    // WINDOW or a comma.
    for i in 0..tokens.len() {
        if !is_identifier(&tokens[i]) || i == 0 {
            continue;
        }
        let prev = &tokens[i - 1];
        let opens_definition =
            prev.is_word("WITH") || prev.is_word("RECURSIVE") || prev.is_word("WINDOW") || prev.is_punct(",");
        if !opens_definition {
            continue;
        }
        let mut j = i + 1;
        let mut column_list = None;
        if tokens.get(j).is_some_and(|t| t.is_punct("(")) {
            match matching_paren(tokens, j) {
                Some(close) => {
                    column_list = Some((j + 1, close));
                    j = close + 1;
                }
                None => continue,
            }
        }
        let is_definition = tokens.get(j).is_some_and(|t| t.is_word("AS"))
            && (tokens.get(j + 1).is_some_and(|t| t.is_punct("("))
                || (tokens.get(j + 1).is_some_and(|t| t.is_word("NOT") || t.is_word("MATERIALIZED"))));
        if !is_definition {
            continue;
        }
        scope.ctes.insert(tokens[i].text.to_ascii_lowercase());
        scope.definitions.insert(i);
        if let Some((from, to)) = column_list {
            for k in from..to {
                if is_identifier(&tokens[k]) {
                    scope.add_alias(&tokens[k].text, None);
                    scope.definitions.insert(k);
                }
            }
        }
    }

    // Table references and their aliases.
    let mut from_levels: Vec<bool> = vec![false];
    let mut i = 0;
    while i < tokens.len() {
        let token = &tokens[i];
        if token.is_punct("(") {
            from_levels.push(false);
        } else if token.is_punct(")") {
            from_levels.pop();
            if from_levels.is_empty() {
                from_levels.push(false);
            }
        } else if token.kind == TokenKind::Word && contains_ci(CLAUSE_KEYWORDS, &token.text) {
            if let Some(level) = from_levels.last_mut() {
                *level = false;
            }
        }

        let in_from_list = token.is_punct(",") && from_levels.last().copied().unwrap_or(false);
        let starts_table_ref = token.is_word("FROM") || token.is_word("JOIN") || in_from_list;
        if token.is_word("FROM") {
            if let Some(level) = from_levels.last_mut() {
                *level = true;
            }
        }

        if starts_table_ref {
            if let Some(next) = tokens.get(i + 1) {
                if is_identifier(next) {
                    i = table_reference(tokens, i + 1, schema, &mut scope)?;
                    continue;
                }
            }
        }
        i += 1;
    }

    // Select-list and other aliases: `AS name`, or a name directly after an
    // expression.
    for i in 1..tokens.len() {
        let token = &tokens[i];
        if !is_identifier(token) || scope.definitions.contains(&i) {
            continue;
        }
        if tokens.get(i + 1).is_some_and(|t| t.is_punct("(") || t.is_punct(".")) {
            continue;
        }
        let prev = &tokens[i - 1];
        let after_expression = is_identifier(prev)
            || prev.is_punct(")")
            || matches!(prev.kind, TokenKind::Number | TokenKind::String)
            || prev.is_word("END")
            || prev.is_word("AS")
            || prev.is_word("OVER");
        if after_expression {
            scope.add_alias(&token.text, None);
            scope.definitions.insert(i);
        }
    }

    Ok(scope)
}

/// Validate one table reference starting at `at` and register its alias.
/// Returns the position after the reference.
fn table_reference(
    tokens: &[Token],
    at: usize,
    schema: &TableSchema,
    scope: &mut Scope,
) -> Result<usize, ValidationError> {
    let name = &tokens[at];
    if tokens.get(at + 1).is_some_and(|t| t.is_punct(".")) {
        // schema-qualified names reach other databases
        let target = tokens.get(at + 2).map(|t| t.text.as_str()).unwrap_or("");
        return Err(ValidationError::SystemTable(format!("{}.{}", name.text, target)));
    }
    if is_system_table(&name.text) {
        return Err(ValidationError::SystemTable(name.text.clone()));
    }
    if tokens.get(at + 1).is_some_and(|t| t.is_punct("(")) {
        return Err(ValidationError::ForbiddenFunction(name.text.to_ascii_lowercase()));
    }

    let table = if scope.is_cte(&name.text) {
        None
    } else {
        match schema.table(&name.text) {
            Some(info) => Some(info.name.clone()),
            None => return Err(ValidationError::UnknownTable(name.text.clone())),
        }
    };
    scope.definitions.insert(at);

    let mut next = at + 1;
    if tokens.get(next).is_some_and(|t| t.is_word("AS")) {
        next += 1;
    }
    if let Some(alias) = tokens.get(next).filter(|t| is_identifier(t)) {
        scope.add_alias(&alias.text, table);
        scope.definitions.insert(next);
        next += 1;
    }
    Ok(next)
}

fn check_columns(tokens: &[Token], schema: &TableSchema, scope: &Scope) -> Result<(), ValidationError> {
    let mut i = 0;
    while i < tokens.len() {
        let token = &tokens[i];
        if !is_identifier(token) || scope.definitions.contains(&i) {
            i += 1;
            continue;
        }

        // function call
        if tokens.get(i + 1).is_some_and(|t| t.is_punct("(")) {
            i += 1;
            continue;
        }

        // qualifier.column
        if tokens.get(i + 1).is_some_and(|t| t.is_punct(".")) {
            let column = tokens.get(i + 2);
            check_qualified(&token.text, column, schema, scope)?;
            i += 3;
            continue;
        }

        let name = token.text.as_str();
        let known = schema.has_column_anywhere(name)
            || contains_ci(PSEUDO_COLUMNS, name)
            || scope.alias(name).is_some()
            || scope.is_cte(name)
            || schema.table(name).is_some();
        if !known {
            return Err(ValidationError::UnknownColumn(name.to_string()));
        }
        i += 1;
    }
    Ok(())
}

fn check_qualified(
    qualifier: &str,
    column: Option<&Token>,
    schema: &TableSchema,
    scope: &Scope,
) -> Result<(), ValidationError> {
    let table = match scope.alias(qualifier) {
        Some(Some(table)) => schema.table(table),
        Some(None) => return Ok(()),
        None if scope.is_cte(qualifier) => return Ok(()),
        None => match schema.table(qualifier) {
            Some(info) => Some(info),
            None => return Err(ValidationError::UnknownTable(qualifier.to_string())),
        },
    };

    let Some(column) = column else {
        return Err(ValidationError::Syntax(format!("dangling qualifier {qualifier}")));
    };
    if column.is_punct("*") {
        return Ok(());
    }
    match table {
        Some(info) if info.has_column(&column.text) || contains_ci(PSEUDO_COLUMNS, &column.text) => Ok(()),
        Some(info) => Err(ValidationError::UnknownColumn(format!("{}.{}", info.name, column.text))),
        None => Ok(()),
    }
}
