//! Rewrites server-dialect statements into something the local SQLite engine
//! accepts.

use std::sync::LazyLock;

use regex::{Captures, Regex};

use super::{analyze, skip_quoted, StatementKind};

/// Statement run locally in place of session statements. Returns no rows.
pub const NOOP_READ: &str = "SELECT 1 WHERE 0";

static INSERT_IGNORE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bINSERT\s+IGNORE\b").expect("valid regex"));

static INTERVAL_ARG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)^INTERVAL\s+(.+?)\s+([A-Za-z_]+)$").expect("valid regex")
});

static INFIX_INTERVAL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)([A-Za-z_][A-Za-z0-9_.]*(?:\([^()]*\))?|'[^']*'|\?)\s*([+-])\s*INTERVAL\s+(-?\d+|\?)\s+([A-Za-z]+)\b",
    )
    .expect("valid regex")
});

static CAST_ARG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)^(.*)\s+AS\s+([A-Za-z]+(?:\s+[A-Za-z]+)?)\s*(?:\([^()]*\))?\s*$")
        .expect("valid regex")
});

/// Translate one statement for the local engine.
///
/// Session statements become [`NOOP_READ`]. Everything else keeps its
/// meaning with date arithmetic, string concatenation, conditionals,
/// numeric casts and quoting rewritten. String literals are never touched.
pub fn translate_for_local(sql: &str) -> String {
    if analyze(sql).kind == StatementKind::Session {
        return NOOP_READ.to_string();
    }

    let rewritten = rewrite_calls(sql);
    let rewritten = INFIX_INTERVAL.replace_all(&rewritten, |caps: &Captures<'_>| {
        let negate = &caps[2] == "-";
        interval_modifier(&caps[3], &caps[4], negate).map_or_else(
            || caps[0].to_string(),
            |modifier| format!("datetime({}, {modifier})", &caps[1]),
        )
    });
    INSERT_IGNORE
        .replace(&rewritten, "INSERT OR IGNORE")
        .into_owned()
}

fn rewrite_calls(sql: &str) -> String {
    let chars: Vec<char> = sql.chars().collect();
    let mut out = String::with_capacity(sql.len());
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c == '\'' || c == '"' {
            let end = skip_quoted(&chars, i, c);
            out.extend(&chars[i..end]);
            i = end;
        } else if c == '`' {
            let end = skip_quoted(&chars, i, '`');
            let inner: String = chars[i + 1..end.saturating_sub(1).max(i + 1)]
                .iter()
                .collect();
            out.push('"');
            out.push_str(&inner.replace("``", "`").replace('"', "\"\""));
            out.push('"');
            i = end;
        } else if c.is_ascii_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            let word: String = chars[start..i].iter().collect();

            let mut open = i;
            while open < chars.len() && chars[open].is_whitespace() {
                open += 1;
            }
            let qualified = start > 0 && chars[start - 1] == '.';
            if !qualified && chars.get(open) == Some(&'(') {
                if let Some(close) = matching_paren(&chars, open) {
                    let inner: String = chars[open + 1..close].iter().collect();
                    if let Some(replacement) = rewrite_call(&word, &inner) {
                        out.push_str(&replacement);
                        i = close + 1;
                        continue;
                    }
                }
            }
            out.push_str(&word);
        } else {
            out.push(c);
            i += 1;
        }
    }

    out
}

fn matching_paren(chars: &[char], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut i = open;
    while i < chars.len() {
        match chars[i] {
            '\'' | '"' | '`' => {
                i = skip_quoted(chars, i, chars[i]);
                continue;
            }
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
        i += 1;
    }
    None
}

fn split_args(inner: &str) -> Vec<String> {
    let chars: Vec<char> = inner.chars().collect();
    let mut args = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '\'' | '"' | '`' => {
                i = skip_quoted(&chars, i, chars[i]);
                continue;
            }
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                args.push(chars[start..i].iter().collect::<String>().trim().to_string());
                start = i + 1;
            }
            _ => {}
        }
        i += 1;
    }
    let last: String = chars[start..].iter().collect();
    if !last.trim().is_empty() || !args.is_empty() {
        args.push(last.trim().to_string());
    }
    args
}

fn rewrite_call(name: &str, inner: &str) -> Option<String> {
    let upper = name.to_ascii_uppercase();
    let no_args = inner.trim().is_empty();
    let args = || {
        split_args(inner)
            .iter()
            .map(|arg| rewrite_calls(arg))
            .collect::<Vec<_>>()
    };

    match upper.as_str() {
        "NOW" | "SYSDATE" | "CURRENT_TIMESTAMP" | "LOCALTIME" | "LOCALTIMESTAMP" if no_args => {
            Some("datetime('now')".to_string())
        }
        "CURDATE" | "CURRENT_DATE" if no_args => Some("date('now')".to_string()),
        "CURTIME" | "CURRENT_TIME" if no_args => Some("time('now')".to_string()),
        "LAST_INSERT_ID" if no_args => Some("last_insert_rowid()".to_string()),
        "UNIX_TIMESTAMP" => {
            let source = if no_args {
                "'now'".to_string()
            } else {
                args().join(", ")
            };
            Some(format!("CAST(strftime('%s', {source}) AS INTEGER)"))
        }
        "CONCAT" if !no_args => Some(format!("({})", args().join(" || "))),
        "IF" => match args().as_slice() {
            [condition, then, otherwise] => Some(format!(
                "CASE WHEN {condition} THEN {then} ELSE {otherwise} END"
            )),
            _ => None,
        },
        "GREATEST" if !no_args => Some(format!("MAX({})", args().join(", "))),
        "LEAST" if !no_args => Some(format!("MIN({})", args().join(", "))),
        "DATE_ADD" | "ADDDATE" | "DATE_SUB" | "SUBDATE" => {
            let args = args();
            let [base, interval] = args.as_slice() else {
                return None;
            };
            let caps = INTERVAL_ARG.captures(interval)?;
            let negate = upper == "DATE_SUB" || upper == "SUBDATE";
            let modifier = interval_modifier(caps[1].trim(), &caps[2], negate)?;
            Some(format!("datetime({base}, {modifier})"))
        }
        "DATE_FORMAT" => {
            let args = args();
            let [value, format] = args.as_slice() else {
                return None;
            };
            let format = format.strip_prefix('\'')?.strip_suffix('\'')?;
            Some(format!("strftime('{}', {value})", strftime_format(format)?))
        }
        "CAST" => rewrite_cast(inner),
        _ => None,
    }
}

/// SQLite date modifier for `INTERVAL <amount> <unit>`.
fn interval_modifier(amount: &str, unit: &str, negate: bool) -> Option<String> {
    let (multiplier, unit) = match unit.to_ascii_uppercase().as_str() {
        "SECOND" => (1, "seconds"),
        "MINUTE" => (1, "minutes"),
        "HOUR" => (1, "hours"),
        "DAY" => (1, "days"),
        "WEEK" => (7, "days"),
        "MONTH" => (1, "months"),
        "QUARTER" => (3, "months"),
        "YEAR" => (1, "years"),
        _ => return None,
    };

    let literal = amount.trim_matches('\'');
    if let Ok(count) = literal.parse::<i64>() {
        let count = count.checked_mul(multiplier)?;
        let count = if negate { -count } else { count };
        return Some(format!("'{count:+} {unit}'"));
    }

    let sign = if negate { "-" } else { "" };
    Some(format!(
        "printf('%+d {unit}', {sign}(CAST({amount} AS INTEGER) * {multiplier}))"
    ))
}

fn rewrite_cast(inner: &str) -> Option<String> {
    let caps = CAST_ARG.captures(inner)?;
    let expression = rewrite_calls(caps[1].trim());
    let target = caps[2].split_whitespace().collect::<Vec<_>>().join(" ");

    let mapped = match target.to_ascii_uppercase().as_str() {
        "DECIMAL" | "NUMERIC" | "DOUBLE" | "FLOAT" | "REAL" => "REAL",
        "SIGNED" | "UNSIGNED" | "SIGNED INTEGER" | "UNSIGNED INTEGER" | "INT" | "INTEGER"
        | "BIGINT" => "INTEGER",
        "CHAR" | "VARCHAR" | "TEXT" | "NCHAR" => "TEXT",
        "DATE" => return Some(format!("date({expression})")),
        "DATETIME" => return Some(format!("datetime({expression})")),
        _ => return None,
    };
    Some(format!("CAST({expression} AS {mapped})"))
}

fn strftime_format(format: &str) -> Option<String> {
    let mut out = String::with_capacity(format.len());
    let mut chars = format.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        let converted = match chars.next()? {
            'Y' => "%Y",
            'm' => "%m",
            'd' => "%d",
            'H' => "%H",
            'i' => "%M",
            's' | 'S' => "%S",
            'T' => "%H:%M:%S",
            'j' => "%j",
            'w' => "%w",
            '%' => "%%",
            _ => return None,
        };
        out.push_str(converted);
    }
    Some(out)
}
