//! Lightweight statement analysis.
//!
//! This is not a SQL parser. It tokenizes just enough to classify a statement,
//! find the tables it touches, and tell which column each `?` placeholder is
//! bound to in the common `INSERT ... VALUES`, `col = ?` and `col IN (?, ...)`
//! shapes.

mod dialect;
mod paging;
mod remap;

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;

pub use dialect::{translate_for_local, NOOP_READ};
pub use paging::{marker_run, take_trailing_run};
pub use remap::{bound_keys, remap_ids, remap_local_ids};

static IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,63}$").expect("valid regex"));

/// Whether `name` can be interpolated into SQL as a table or column name.
pub fn is_safe_identifier(name: &str) -> bool {
    IDENTIFIER.is_match(name)
}

/// Double-quote an identifier that already passed [`is_safe_identifier`].
pub fn quote_ident(name: &str) -> String {
    format!("\"{name}\"")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationKind {
    Insert,
    Update,
    Delete,
    Replace,
}

impl MutationKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Replace => "replace",
        }
    }

    pub const fn creates_rows(self) -> bool {
        matches!(self, Self::Insert | Self::Replace)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    Read,
    Mutation(MutationKind),
    /// Session or administrative statement (`SET`, `USE`, `SHOW`, ...).
    Session,
    /// DDL (`CREATE`, `ALTER`, `DROP`, `TRUNCATE`).
    Schema,
}

/// Classification plus the tables a statement references, in order of
/// appearance. For mutations the first table is the write target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatementInfo {
    pub kind: StatementKind,
    pub tables: Vec<String>,
}

impl StatementInfo {
    pub fn target(&self) -> Option<&str> {
        self.tables.first().map(String::as_str)
    }

    pub const fn mutation(&self) -> Option<MutationKind> {
        match self.kind {
            StatementKind::Mutation(kind) => Some(kind),
            _ => None,
        }
    }
}

pub fn analyze(sql: &str) -> StatementInfo {
    let tokens = tokenize(sql);
    StatementInfo {
        kind: classify_tokens(&tokens),
        tables: referenced_tables(&tokens),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    /// Unquoted word: keyword or identifier.
    Word(String),
    /// Backtick, double-quote or bracket quoted identifier.
    Quoted(String),
    Str,
    Number,
    Placeholder,
    Punct(char),
}

impl Token {
    fn is_keyword(&self, keyword: &str) -> bool {
        matches!(self, Self::Word(word) if word.eq_ignore_ascii_case(keyword))
    }

    fn ident(&self) -> Option<&str> {
        match self {
            Self::Word(word) | Self::Quoted(word) => Some(word),
            _ => None,
        }
    }

    fn is_punct(&self, c: char) -> bool {
        matches!(self, Self::Punct(p) if *p == c)
    }
}

fn tokenize(sql: &str) -> Vec<Token> {
    let chars: Vec<char> = sql.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
        } else if c == '-' && chars.get(i + 1) == Some(&'-') {
            while i < chars.len() && chars[i] != '\n' {
                i += 1;
            }
        } else if c == '/' && chars.get(i + 1) == Some(&'*') {
            i += 2;
            while i < chars.len() && !(chars[i] == '*' && chars.get(i + 1) == Some(&'/')) {
                i += 1;
            }
            i += 2;
        } else if c == '\'' {
            i = skip_quoted(&chars, i, '\'');
            tokens.push(Token::Str);
        } else if c == '"' || c == '`' || c == '[' {
            let close = if c == '[' { ']' } else { c };
            let end = skip_quoted(&chars, i, close);
            let inner: String = chars[i + 1..end.saturating_sub(1).max(i + 1)].iter().collect();
            tokens.push(Token::Quoted(inner));
            i = end;
        } else if c.is_ascii_digit() {
            while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '.') {
                i += 1;
            }
            tokens.push(Token::Number);
        } else if c.is_alphanumeric() || c == '_' || c == '$' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '$')
            {
                i += 1;
            }
            tokens.push(Token::Word(chars[start..i].iter().collect()));
        } else if c == '?' {
            tokens.push(Token::Placeholder);
            i += 1;
        } else {
            tokens.push(Token::Punct(c));
            i += 1;
        }
    }

    tokens
}

/// Returns the index just past the closing quote. Doubled quotes escape.
fn skip_quoted(chars: &[char], start: usize, close: char) -> usize {
    let mut i = start + 1;
    while i < chars.len() {
        if chars[i] == close {
            if close != ']' && chars.get(i + 1) == Some(&close) {
                i += 2;
                continue;
            }
            return i + 1;
        }
        i += 1;
    }
    chars.len()
}

fn classify_tokens(tokens: &[Token]) -> StatementKind {
    let first = tokens.iter().find_map(|token| match token {
        Token::Word(word) => Some(word.to_ascii_uppercase()),
        _ => None,
    });

    match first.as_deref() {
        Some("INSERT") => StatementKind::Mutation(MutationKind::Insert),
        Some("REPLACE") => StatementKind::Mutation(MutationKind::Replace),
        Some("UPDATE") => StatementKind::Mutation(MutationKind::Update),
        Some("DELETE") => StatementKind::Mutation(MutationKind::Delete),
        Some("CREATE" | "ALTER" | "DROP" | "TRUNCATE" | "RENAME") => StatementKind::Schema,
        Some(
            "SET" | "USE" | "SHOW" | "DESCRIBE" | "DESC" | "LOCK" | "UNLOCK" | "FLUSH" | "KILL"
            | "GRANT" | "REVOKE" | "START" | "BEGIN" | "COMMIT" | "ROLLBACK" | "SAVEPOINT"
            | "RELEASE",
        ) => StatementKind::Session,
        _ => StatementKind::Read,
    }
}

fn referenced_tables(tokens: &[Token]) -> Vec<String> {
    let mut tables: Vec<String> = Vec::new();
    let mut push = |name: &str| {
        if !tables.iter().any(|table| table.eq_ignore_ascii_case(name)) {
            tables.push(name.to_string());
        }
    };

    let mut i = 0;
    while i < tokens.len() {
        let introduces_table = ["FROM", "JOIN", "INTO", "UPDATE", "TABLE"]
            .iter()
            .any(|keyword| tokens[i].is_keyword(keyword));
        if !introduces_table {
            i += 1;
            continue;
        }

        let is_from = tokens[i].is_keyword("FROM");
        i += 1;
        loop {
            i = skip_table_modifiers(tokens, i);
            let Some((name, next)) = qualified_name(tokens, i) else {
                break;
            };
            push(&name);
            i = next;
            if !is_from {
                break;
            }
            // Comma joins: FROM a x, b y
            while i < tokens.len() && tokens[i].ident().is_some() && !is_clause_keyword(&tokens[i])
            {
                i += 1;
            }
            if i < tokens.len() && tokens[i].is_punct(',') {
                i += 1;
            } else {
                break;
            }
        }
    }

    tables
}

fn skip_table_modifiers(tokens: &[Token], mut i: usize) -> usize {
    while i < tokens.len()
        && ["IF", "NOT", "EXISTS", "ONLY", "IGNORE", "LOW_PRIORITY", "TEMPORARY"]
            .iter()
            .any(|keyword| tokens[i].is_keyword(keyword))
    {
        i += 1;
    }
    i
}

/// `name` or `schema.name`; returns the last segment.
fn qualified_name(tokens: &[Token], i: usize) -> Option<(String, usize)> {
    let mut name = tokens.get(i)?.ident()?.to_string();
    if is_clause_keyword(&tokens[i]) {
        return None;
    }
    let mut next = i + 1;
    while next + 1 < tokens.len() && tokens[next].is_punct('.') {
        let Some(segment) = tokens[next + 1].ident() else {
            break;
        };
        name = segment.to_string();
        next += 2;
    }
    Some((name, next))
}

fn is_clause_keyword(token: &Token) -> bool {
    const CLAUSES: [&str; 22] = [
        "SELECT", "WHERE", "SET", "VALUES", "JOIN", "LEFT", "RIGHT", "INNER", "OUTER", "CROSS",
        "ON", "GROUP", "ORDER", "LIMIT", "HAVING", "UNION", "USING", "DEFAULT", "RETURNING",
        "NATURAL", "FULL", "WINDOW",
    ];
    matches!(token, Token::Word(word) if CLAUSES.iter().any(|clause| word.eq_ignore_ascii_case(clause)))
}

/// For each `?` placeholder in order, the column it binds to when the shape
/// makes that unambiguous.
pub fn placeholder_columns(sql: &str) -> Vec<Option<String>> {
    let tokens = tokenize(sql);
    let mut bound: HashMap<usize, String> = HashMap::new();
    bind_insert_values(&tokens, &mut bound);
    bind_in_lists(&tokens, &mut bound);

    tokens
        .iter()
        .enumerate()
        .filter(|(_, token)| **token == Token::Placeholder)
        .map(|(index, _)| {
            bound.get(&index).cloned().or_else(|| {
                let eq = index.checked_sub(1).map(|at| &tokens[at])?;
                if !eq.is_punct('=') {
                    return None;
                }
                let column = index.checked_sub(2).map(|at| &tokens[at])?;
                column.ident().map(str::to_string)
            })
        })
        .collect()
}

/// `INSERT INTO t (a, b) VALUES (?, ?), (?, ?)`
fn bind_insert_values(tokens: &[Token], bound: &mut HashMap<usize, String>) {
    let Some(into) = tokens.iter().position(|token| token.is_keyword("INTO")) else {
        return;
    };
    let Some((_, mut i)) = qualified_name(tokens, into + 1) else {
        return;
    };
    if !tokens.get(i).is_some_and(|token| token.is_punct('(')) {
        return;
    }

    let mut columns = Vec::new();
    i += 1;
    while i < tokens.len() && !tokens[i].is_punct(')') {
        if let Some(name) = tokens[i].ident() {
            columns.push(name.to_string());
        }
        i += 1;
    }

    while i < tokens.len() && !tokens[i].is_keyword("VALUES") {
        i += 1;
    }
    i += 1;

    while i < tokens.len() && tokens[i].is_punct('(') {
        let mut depth = 0usize;
        let mut position = 0usize;
        loop {
            let Some(token) = tokens.get(i) else {
                return;
            };
            match token {
                Token::Punct('(') => depth += 1,
                Token::Punct(')') => {
                    depth -= 1;
                    if depth == 0 {
                        i += 1;
                        break;
                    }
                }
                Token::Punct(',') if depth == 1 => position += 1,
                Token::Placeholder if depth == 1 => {
                    let whole_item = (tokens[i - 1].is_punct('(') || tokens[i - 1].is_punct(','))
                        && tokens
                            .get(i + 1)
                            .is_some_and(|next| next.is_punct(',') || next.is_punct(')'));
                    if whole_item {
                        if let Some(column) = columns.get(position) {
                            bound.insert(i, column.clone());
                        }
                    }
                }
                _ => {}
            }
            i += 1;
        }
        if tokens.get(i).is_some_and(|token| token.is_punct(',')) {
            i += 1;
        }
    }
}

/// `col IN (?, ?)` and `col NOT IN (?, ?)`
fn bind_in_lists(tokens: &[Token], bound: &mut HashMap<usize, String>) {
    for (index, token) in tokens.iter().enumerate() {
        if !token.is_keyword("IN") || !tokens.get(index + 1).is_some_and(|t| t.is_punct('(')) {
            continue;
        }
        let mut column_at = index.checked_sub(1);
        if column_at.is_some_and(|at| tokens[at].is_keyword("NOT")) {
            column_at = index.checked_sub(2);
        }
        let Some(column) = column_at.and_then(|at| tokens[at].ident()) else {
            continue;
        };

        let mut depth = 0usize;
        for (offset, inner) in tokens[index + 1..].iter().enumerate() {
            match inner {
                Token::Punct('(') => depth += 1,
                Token::Punct(')') => {
                    depth -= 1;
                    if depth == 0 {
                        break;
                    }
                }
                Token::Placeholder if depth == 1 => {
                    bound.insert(index + 1 + offset, column.to_string());
                }
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn cols(values: &[Option<&str>]) -> Vec<Option<String>> {
        values.iter().map(|value| value.map(str::to_string)).collect()
    }

    #[test]
    fn classifies_statement_kinds() {
        assert_eq!(analyze("  select * from patients").kind, StatementKind::Read);
        assert_eq!(
            analyze("INSERT INTO payments (amount) VALUES (?)").kind,
            StatementKind::Mutation(MutationKind::Insert)
        );
        assert_eq!(
            analyze("/* audit */ UPDATE patients SET name = ?").kind,
            StatementKind::Mutation(MutationKind::Update)
        );
        assert_eq!(analyze("SET NAMES utf8mb4").kind, StatementKind::Session);
        assert_eq!(analyze("DROP TABLE tmp").kind, StatementKind::Schema);
        assert_eq!(
            analyze("REPLACE INTO settings VALUES (1)").kind,
            StatementKind::Mutation(MutationKind::Replace)
        );
    }

    #[test]
    fn finds_referenced_tables() {
        let info = analyze(
            "SELECT r.*, p.amount FROM registrations r \
             LEFT JOIN payments p ON p.registration_id = r.registration_id \
             WHERE r.branch_id IN (SELECT branch_id FROM branches)",
        );
        assert_eq!(info.tables, vec!["registrations", "payments", "branches"]);

        let info = analyze("SELECT * FROM `clinic`.`patients` a, tests b WHERE a.x = b.y");
        assert_eq!(info.tables, vec!["patients", "tests"]);

        let info = analyze("DELETE FROM attendance WHERE attendance_id = ?");
        assert_eq!(info.target(), Some("attendance"));

        let info = analyze("INSERT IGNORE INTO \"notifications\" (body) VALUES ('from x')");
        assert_eq!(info.tables, vec!["notifications"]);
    }

    #[test]
    fn string_literals_do_not_leak_table_names() {
        let info = analyze("SELECT 'select * from users' AS note FROM patients");
        assert_eq!(info.tables, vec!["patients"]);
    }

    #[test]
    fn binds_insert_placeholders_by_position() {
        let columns = placeholder_columns(
            "INSERT INTO patients (patient_name, registration_id, created_at) \
             VALUES (?, ?, NOW()), (?, COALESCE(?, 0), ?)",
        );
        assert_eq!(
            columns,
            cols(&[
                Some("patient_name"),
                Some("registration_id"),
                Some("patient_name"),
                None,
                Some("created_at"),
            ])
        );
    }

    #[test]
    fn binds_equality_and_in_list_placeholders() {
        let columns = placeholder_columns(
            "UPDATE payments SET amount = ?, note = 'a = ?' \
             WHERE p.registration_id = ? AND created_at >= ? AND test_id NOT IN (?, ?)",
        );
        assert_eq!(
            columns,
            cols(&[
                Some("amount"),
                Some("registration_id"),
                None,
                Some("test_id"),
                Some("test_id"),
            ])
        );
    }

    #[test]
    fn identifier_pattern_is_strict() {
        assert!(is_safe_identifier("registration_id"));
        assert!(is_safe_identifier("_tmp2"));
        assert!(!is_safe_identifier("2fast"));
        assert!(!is_safe_identifier("name; DROP TABLE users"));
        assert!(!is_safe_identifier("a-b"));
        assert!(!is_safe_identifier(""));
        assert!(!is_safe_identifier(&"x".repeat(65)));
    }
}
