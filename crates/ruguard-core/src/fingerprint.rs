//! Query fingerprints used by the watch list and the event recorder.
//!
//! Three granularities exist, one per [`WatchType`](crate::group::WatchType):
//!
//! - **Exact**: the SQL text with surrounding whitespace trimmed.
//! - **Similar**: SHA-256 of the normalized SQL, where literals become `?`,
//!   value lists collapse to `(...)`, keywords are lower-cased and whitespace
//!   is squeezed. Queries differing only in literals share a digest.
//! - **Plan**: SHA-256 of the physical plan text supplied by the executor.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Fingerprint of one query, computed once when the query is bound.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueryFingerprint {
    /// Trimmed SQL text (exact key).
    pub sql_text: String,
    /// Digest of the normalized SQL (similar key).
    pub sql_digest: String,
    /// Digest of the physical plan (plan key), when the executor knows it.
    pub plan_digest: Option<String>,
}

impl QueryFingerprint {
    #[must_use]
    pub fn new(sql: &str) -> Self {
        Self {
            sql_text: sql.trim().to_string(),
            sql_digest: sql_digest(sql),
            plan_digest: None,
        }
    }

    /// Attach the digest of `plan_text`.
    #[must_use]
    pub fn with_plan(mut self, plan_text: &str) -> Self {
        self.plan_digest = Some(plan_digest(plan_text));
        self
    }
}

/// SHA-256 hex digest of `data`.
#[must_use]
pub fn digest_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Digest of the normalized form of `sql`.
#[must_use]
pub fn sql_digest(sql: &str) -> String {
    digest_hex(normalize_sql(sql).as_bytes())
}

/// Digest of a plan, whitespace-insensitive.
#[must_use]
pub fn plan_digest(plan_text: &str) -> String {
    let squeezed: Vec<&str> = plan_text.split_whitespace().collect();
    digest_hex(squeezed.join(" ").as_bytes())
}

/// Normalize SQL so that statements differing only in literals compare equal.
///
/// ```
/// use ruguard_core::fingerprint::normalize_sql;
/// assert_eq!(
///     normalize_sql("SELECT * FROM t WHERE a = 'x' AND b IN (1, 2,3)"),
///     "select * from t where a = ? and b in (...)"
/// );
/// ```
#[must_use]
pub fn normalize_sql(sql: &str) -> String {
    let tokens = tokenize(sql);
    let mut out: Vec<String> = Vec::with_capacity(tokens.len());
    let mut i = 0;
    while i < tokens.len() {
        // `( ? , ? , ... )` collapses into a single `(...)` token.
        if tokens[i] == "(" {
            if let Some(end) = literal_list_end(&tokens, i) {
                out.push("(...)".to_string());
                i = end + 1;
                continue;
            }
        }
        out.push(tokens[i].clone());
        i += 1;
    }
    render(&out)
}

/// If `tokens[start]` opens a list made only of `?` and commas, the index of
/// its closing paren.
fn literal_list_end(tokens: &[String], start: usize) -> Option<usize> {
    let mut expect_literal = true;
    let mut saw_literal = false;
    for (offset, tok) in tokens[start + 1..].iter().enumerate() {
        match (tok.as_str(), expect_literal) {
            ("?", true) => {
                saw_literal = true;
                expect_literal = false;
            }
            (",", false) => expect_literal = true,
            (")", false) if saw_literal => return Some(start + 1 + offset),
            _ => return None,
        }
    }
    None
}

fn render(tokens: &[String]) -> String {
    let mut out = String::new();
    for (idx, tok) in tokens.iter().enumerate() {
        if idx > 0 {
            let prev = tokens[idx - 1].as_str();
            let tight = tok == "," || tok == ")" || tok == "." || prev == "(" || prev == ".";
            if !tight {
                out.push(' ');
            }
        }
        out.push_str(tok);
    }
    out
}

fn tokenize(sql: &str) -> Vec<String> {
    let chars: Vec<char> = sql.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
        } else if c == '\'' || c == '"' {
            i = skip_quoted(&chars, i, c);
            tokens.push("?".to_string());
        } else if c == '`' {
            let end = skip_quoted(&chars, i, '`');
            tokens.push(chars[i..end].iter().collect::<String>().to_lowercase());
            i = end;
        } else if c.is_ascii_digit()
            || (c == '.' && chars.get(i + 1).is_some_and(char::is_ascii_digit))
        {
            while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '.') {
                i += 1;
            }
            tokens.push("?".to_string());
        } else if c.is_alphanumeric() || c == '_' || c == '$' || c == '@' {
            let start = i;
            while i < chars.len()
                && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '$' || chars[i] == '@')
            {
                i += 1;
            }
            tokens.push(chars[start..i].iter().collect::<String>().to_lowercase());
        } else {
            // Multi-char comparison operators stay together.
            let two: String = chars[i..chars.len().min(i + 2)].iter().collect();
            if matches!(two.as_str(), "<=" | ">=" | "<>" | "!=" | "||" | "&&") {
                tokens.push(two);
                i += 2;
            } else {
                tokens.push(c.to_string());
                i += 1;
            }
        }
    }
    tokens
}

/// Index just past the closing `quote`, honoring backslash and doubled-quote
/// escapes. An unterminated literal runs to the end of input.
fn skip_quoted(chars: &[char], start: usize, quote: char) -> usize {
    let mut i = start + 1;
    while i < chars.len() {
        if chars[i] == '\\' && quote != '`' {
            i += 2;
            continue;
        }
        if chars[i] == quote {
            if chars.get(i + 1) == Some(&quote) {
                i += 2;
                continue;
            }
            return i + 1;
        }
        i += 1;
    }
    chars.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literals_become_placeholders() {
        assert_eq!(
            normalize_sql("select * from t where a = 1 and b = 'abc'"),
            "select * from t where a = ? and b = ?"
        );
        assert_eq!(
            normalize_sql("SELECT  *\n FROM t WHERE c >= 3.14"),
            "select * from t where c >= ?"
        );
    }

    #[test]
    fn value_lists_collapse() {
        assert_eq!(
            normalize_sql("select 1 from t where a in (1,2,3)"),
            normalize_sql("select 2 from t where a in (4)")
        );
        // A subquery is not a literal list.
        assert_eq!(
            normalize_sql("select * from t where a in (select b from u)"),
            "select * from t where a in (select b from u)"
        );
    }

    #[test]
    fn escaped_quotes_stay_inside_literal() {
        assert_eq!(
            normalize_sql(r"select * from t where a = 'it''s' and b = 'x\'y'"),
            "select * from t where a = ? and b = ?"
        );
    }

    #[test]
    fn quoted_identifiers_are_kept() {
        assert_eq!(
            normalize_sql("select `Col` from `db`.`T`"),
            "select `col` from `db`.`t`"
        );
    }

    #[test]
    fn similar_queries_share_digest() {
        let a = QueryFingerprint::new("select * from t where id = 1");
        let b = QueryFingerprint::new("select * from t where id = 42");
        let c = QueryFingerprint::new("select * from u where id = 1");
        assert_eq!(a.sql_digest, b.sql_digest);
        assert_ne!(a.sql_digest, c.sql_digest);
        assert_ne!(a.sql_text, b.sql_text);
        assert_eq!(a.sql_digest.len(), 64);
    }

    #[test]
    fn plan_digest_ignores_whitespace() {
        let a = QueryFingerprint::new("select 1").with_plan("TableReader\n  TableFullScan");
        assert_eq!(a.plan_digest, Some(plan_digest("TableReader TableFullScan")));
    }

    #[test]
    fn exact_key_is_trimmed_text() {
        let f = QueryFingerprint::new("  select 1  ");
        assert_eq!(f.sql_text, "select 1");
    }
}
