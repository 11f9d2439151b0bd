//! SQLite implementations of the storage capabilities: queue tables, the delayed-message
//! table and the subscription table.

use crate::address::QueueAddress;

pub mod delayed;
pub mod queue;
pub mod schema;
pub mod subscription;

/// Quotes an identifier for SQLite, doubling any embedded quote.
pub(crate) fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Renders `schema.table` for use in SQL text. The catalog has no SQLite counterpart.
pub(crate) fn qualified_table(address: &QueueAddress) -> String {
    match address.schema() {
        Some(schema) => format!(
            "{}.{}",
            quote_identifier(schema),
            quote_identifier(address.table())
        ),
        None => quote_identifier(address.table()),
    }
}

/// Renders a schema-qualified name for an object derived from the table name, such as an index.
pub(crate) fn qualified_object(address: &QueueAddress, suffix: &str) -> String {
    let name = quote_identifier(&format!("{}_{suffix}", address.table()));
    match address.schema() {
        Some(schema) => format!("{}.{name}", quote_identifier(schema)),
        None => name,
    }
}

/// The `sqlite_master` table of the schema the address lives in.
pub(crate) fn schema_master(address: &QueueAddress) -> String {
    match address.schema() {
        Some(schema) => format!("{}.sqlite_master", quote_identifier(schema)),
        None => "sqlite_master".to_owned(),
    }
}

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Adds a duration to a unix-millisecond timestamp without overflowing.
pub(crate) fn add_millis(base: i64, duration: std::time::Duration) -> i64 {
    base.saturating_add(i64::try_from(duration.as_millis()).unwrap_or(i64::MAX))
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quoting() {
        assert_eq!(quote_identifier("orders"), "\"orders\"");
        assert_eq!(quote_identifier("a\"b"), "\"a\"\"b\"");

        let addr = QueueAddress::new("orders").with_schema("main");
        assert_eq!(qualified_table(&addr), "\"main\".\"orders\"");
        assert_eq!(qualified_object(&addr, "Expires"), "\"main\".\"orders_Expires\"");
        assert_eq!(schema_master(&addr), "\"main\".sqlite_master");

        let addr = QueueAddress::new("orders").with_catalog("ignored");
        assert_eq!(qualified_table(&addr), "\"orders\"");
    }

    #[test]
    fn test_add_millis_saturates() {
        assert_eq!(add_millis(10, std::time::Duration::from_millis(5)), 15);
        assert_eq!(add_millis(i64::MAX - 1, std::time::Duration::from_secs(10)), i64::MAX);
    }
}
