//! SQL identifier hygiene.
//!
//! Table, column, and index names arrive from configuration and catalog
//! introspection, so they are interpolated into DDL/DML text rather than
//! bound as parameters. Everything interpolated goes through [`quote_ident`].

use steward_core::MAX_IDENTIFIER_LENGTH;

/// Quote a single SQL identifier, doubling embedded quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote a schema-qualified name.
pub fn quote_qualified(schema: &str, name: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(name))
}

/// Derive a related identifier by suffixing, truncating the base so the
/// result fits PostgreSQL's 63-byte identifier limit.
pub fn derived_name(base: &str, suffix: &str) -> String {
    let max_base = MAX_IDENTIFIER_LENGTH.saturating_sub(suffix.len());
    let mut base = base.to_string();
    while base.len() > max_base {
        base.pop();
    }
    format!("{base}{suffix}")
}
