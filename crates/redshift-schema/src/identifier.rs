//! Safe identifier rules (§3 invariant c, §4.1).
//!
//! `safe_column_name` and `safe_table_name` apply the same
//! normalization: uppercase, replace anything outside `[A-Z0-9_]`
//! with `_`, prefix a leading digit with `_`, and truncate anything
//! over 127 characters to `119` chars plus an 8-hex-char stable hash
//! of the full original name so two long names that share a 119-char
//! prefix still collide (correctly, per §3 invariant b) instead of
//! silently colliding.

use sha2::{Digest, Sha256};

const MAX_IDENTIFIER_LEN: usize = 127;
const HASH_SUFFIX_LEN: usize = 8;

/// A representative subset of Redshift's reserved words, enough to
/// cover what taps commonly emit as column/table names. Quoting a
/// non-reserved identifier is harmless, so this list errs toward
/// completeness over precision without attempting to be exhaustive.
const RESERVED_WORDS: &[&str] = &[
    "SELECT", "TABLE", "USER", "ORDER", "GROUP", "WHERE", "FROM", "UNION", "CASE", "COLUMN",
    "DEFAULT", "PRIMARY", "FOREIGN", "CHECK", "INDEX", "VIEW", "GRANT", "ROLE", "ALL", "AND",
    "AS", "BETWEEN", "BY", "CAST", "CREATE", "CROSS", "CURRENT_DATE", "CURRENT_TIME",
    "CURRENT_TIMESTAMP", "CURRENT_USER", "DISTINCT", "DROP", "ELSE", "END", "EXISTS", "FALSE",
    "FOR", "FULL", "HAVING", "IN", "INNER", "INSERT", "INTO", "IS", "JOIN", "LEFT", "LIKE",
    "LIMIT", "NOT", "NULL", "ON", "OR", "OUTER", "RIGHT", "SET", "SOME", "THEN", "TO", "TRUE",
    "WHEN", "WITH",
];

/// Uppercase, replace non-`[A-Z0-9_]` with `_`, prefix a leading digit
/// with `_`, and truncate with a stable hash suffix if too long.
pub fn safe_column_name(raw: &str) -> String {
    normalize(raw)
}

/// Applies the same normalization rule to the right-hand component of
/// a compound (catalog-schema-table) stream name.
pub fn safe_table_name(raw_stream: &str, separator: char) -> String {
    let table_part = raw_stream
        .rsplit(separator)
        .next()
        .unwrap_or(raw_stream);
    normalize(table_part)
}

fn normalize(raw: &str) -> String {
    let mut out: String = raw
        .chars()
        .map(|c| {
            let upper = c.to_ascii_uppercase();
            if upper.is_ascii_alphanumeric() || upper == '_' {
                upper
            } else {
                '_'
            }
        })
        .collect();

    if out.chars().next().map(|c| c.is_ascii_digit()).unwrap_or(false) {
        out.insert(0, '_');
    }

    if out.len() > MAX_IDENTIFIER_LEN {
        let keep = MAX_IDENTIFIER_LEN - HASH_SUFFIX_LEN - 1; // reserve "_" + hash
        let mut hasher = Sha256::new();
        hasher.update(raw.as_bytes());
        let digest = hasher.finalize();
        let suffix: String = digest.iter().take(4).map(|b| format!("{:02X}", b)).collect();
        out = format!("{}_{}", &out[..keep], &suffix[..HASH_SUFFIX_LEN]);
    }

    out
}

/// Returns `true` if `identifier` needs double-quoting to be used
/// safely in DDL/DML (it's a reserved word).
pub fn is_reserved(identifier: &str) -> bool {
    RESERVED_WORDS.contains(&identifier.to_ascii_uppercase().as_str())
}

/// Render an identifier for use in a SQL statement, double-quoting it
/// if it collides with a reserved word.
pub fn quote_identifier(identifier: &str) -> String {
    if is_reserved(identifier) {
        format!("\"{}\"", identifier)
    } else {
        identifier.to_string()
    }
}

/// Unconditionally double-quote an identifier. The warehouse sync
/// layer uses this for every identifier it emits rather than
/// `quote_identifier`'s reserved-word-only rule: Redshift (like
/// Postgres) folds unquoted identifiers to lowercase, which would
/// throw away the uppercase canonical form `safe_column_name`
/// produces. Quoting always preserves it, and `safe_column_name`'s
/// output never itself contains a `"`, so this can't be escaped
/// incorrectly.
pub fn quote_always(identifier: &str) -> String {
    format!("\"{}\"", identifier)
}

/// The safe column name a nested key path would be flattened to,
/// mirroring `flatten::visit`'s `parent__child` joining convention.
/// Used to resolve `key_properties` (which may name a dotted path)
/// and primary-key column references in emitted DDL/DML.
pub fn key_column_name(path: &str) -> String {
    let joined = path.split('.').collect::<Vec<_>>().join("__");
    safe_column_name(&joined)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uppercases_and_replaces_invalid_chars() {
        assert_eq!(safe_column_name("user-name"), "USER_NAME");
        assert_eq!(safe_column_name("a.b.c"), "A_B_C");
    }

    #[test]
    fn prefixes_leading_digit() {
        assert_eq!(safe_column_name("123abc"), "_123ABC");
    }

    #[test]
    fn idempotent() {
        let once = safe_column_name("weird-Name 1");
        let twice = safe_column_name(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn idempotent_for_truncated_long_identifiers() {
        let long_name = "a".repeat(200);
        let once = safe_column_name(&long_name);
        let twice = safe_column_name(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn truncates_long_identifiers_with_stable_hash_suffix() {
        let long_name = "a".repeat(200);
        let result = safe_column_name(&long_name);
        assert_eq!(result.len(), MAX_IDENTIFIER_LEN);
        // Stable: same input always yields the same suffix.
        assert_eq!(result, safe_column_name(&long_name));
    }

    #[test]
    fn distinct_long_names_with_shared_prefix_do_not_collide() {
        let a = format!("{}{}", "x".repeat(130), "a");
        let b = format!("{}{}", "x".repeat(130), "b");
        assert_ne!(safe_column_name(&a), safe_column_name(&b));
    }

    #[test]
    fn table_name_takes_rightmost_compound_component() {
        assert_eq!(safe_table_name("public-order", '-'), "ORDER");
        assert_eq!(safe_table_name("no_separator_here", '-'), "NO_SEPARATOR_HERE");
    }

    #[test]
    fn reserved_words_get_quoted() {
        assert_eq!(quote_identifier("select"), "\"select\"");
        assert_eq!(quote_identifier("ORDER"), "\"ORDER\"");
        assert_eq!(quote_identifier("customer_id"), "customer_id");
    }

    #[test]
    fn key_column_name_joins_dotted_paths_like_flattening_does() {
        assert_eq!(key_column_name("id"), "ID");
        assert_eq!(key_column_name("a.b"), "A__B");
    }
}
