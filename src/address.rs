//! Logical queue addresses.
//!
//! A queue is addressed by its table name plus an optional schema and catalog. The textual
//! form is `table@schema@catalog`, where every segment may be wrapped in brackets so that it
//! can contain the `@` separator or the bracket characters themselves. Inside brackets a
//! closing bracket is escaped by doubling it (`]]`).
//!
//! An unquoted empty segment means "not specified" while a quoted empty segment (`[]`) means
//! an explicitly empty name, so `orders@@sales` has no schema and the `sales` catalog.

use std::{fmt, str::FromStr};

use pom::utf8::{end, none_of, seq, sym, Parser};
use serde::{Deserialize, Serialize};

use crate::error::Error;

const SEPARATOR: char = '@';

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct QueueAddress {
    table: String,
    schema: Option<String>,
    catalog: Option<String>,
}

enum Segment<'a> {
    Quoted(String),
    Unquoted(&'a str),
}

impl Segment<'_> {
    fn into_name(self) -> Option<String> {
        match self {
            Segment::Quoted(name) => Some(name),
            Segment::Unquoted("") => None,
            Segment::Unquoted(name) => Some(name.to_owned()),
        }
    }
}

fn quoted<'a>() -> Parser<'a, Segment<'a>> {
    let escaped = seq("]]").map(|_| ']');
    let plain = none_of("]");

    (sym('[') * (escaped | plain).repeat(0..) - sym(']'))
        .map(|chars| Segment::Quoted(chars.into_iter().collect()))
        .name("quoted segment")
}

fn unquoted<'a>() -> Parser<'a, Segment<'a>> {
    none_of("@")
        .repeat(0..)
        .collect()
        .map(Segment::Unquoted)
        .name("segment")
}

fn segment<'a>() -> Parser<'a, Segment<'a>> {
    quoted() | unquoted()
}

fn address<'a>() -> Parser<'a, (Segment<'a>, Vec<Segment<'a>>)> {
    (segment() + (sym(SEPARATOR) * segment()).repeat(0..3) - end()).name("queue address")
}

fn needs_quoting(name: &str) -> bool {
    name.is_empty() || name.contains([SEPARATOR, '[', ']'])
}

fn write_segment(f: &mut fmt::Formatter<'_>, name: &str) -> fmt::Result {
    if needs_quoting(name) {
        write!(f, "[{}]", name.replace(']', "]]"))
    } else {
        f.write_str(name)
    }
}

impl QueueAddress {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            schema: None,
            catalog: None,
        }
    }

    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    pub fn with_catalog(mut self, catalog: impl Into<String>) -> Self {
        self.catalog = Some(catalog.into());
        self
    }

    pub fn parse(input: &str) -> Result<Self, Error> {
        let (table, rest) = address()
            .parse_str(input)
            .map_err(|e| Error::invalid_address(format!("{input}: {e}")))?;

        let table = table
            .into_name()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| Error::invalid_address(format!("{input}: missing table name")))?;

        let mut rest = rest.into_iter().map(Segment::into_name);

        Ok(Self {
            table,
            schema: rest.next().flatten(),
            catalog: rest.next().flatten(),
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn schema(&self) -> Option<&str> {
        self.schema.as_deref()
    }

    pub fn catalog(&self) -> Option<&str> {
        self.catalog.as_deref()
    }
}

impl fmt::Display for QueueAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_segment(f, &self.table)?;

        match (&self.schema, &self.catalog) {
            (None, None) => Ok(()),
            (Some(schema), None) => {
                write!(f, "{SEPARATOR}")?;
                write_segment(f, schema)
            }
            (schema, Some(catalog)) => {
                write!(f, "{SEPARATOR}")?;
                if let Some(schema) = schema {
                    write_segment(f, schema)?;
                }
                write!(f, "{SEPARATOR}")?;
                write_segment(f, catalog)
            }
        }
    }
}

impl FromStr for QueueAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for QueueAddress {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<QueueAddress> for String {
    fn from(address: QueueAddress) -> Self {
        address.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_table_only() {
        let addr = QueueAddress::parse("orders").unwrap();
        assert_eq!(addr.table(), "orders");
        assert_eq!(addr.schema(), None);
        assert_eq!(addr.catalog(), None);
    }

    #[test]
    fn test_parse_all_segments() {
        let addr = QueueAddress::parse("orders@dbo@sales").unwrap();
        assert_eq!(addr, QueueAddress::new("orders").with_schema("dbo").with_catalog("sales"));
    }

    #[test]
    fn test_unquoted_empty_schema_is_unspecified() {
        let addr = QueueAddress::parse("orders@@sales").unwrap();
        assert_eq!(addr.schema(), None);
        assert_eq!(addr.catalog(), Some("sales"));
        assert_eq!(addr.to_string(), "orders@@sales");
    }

    #[test]
    fn test_quoted_empty_schema_is_explicit() {
        let addr = QueueAddress::parse("orders@[]").unwrap();
        assert_eq!(addr.schema(), Some(""));
        assert_eq!(addr.to_string(), "orders@[]");
    }

    #[test]
    fn test_quoted_segments_with_reserved_characters() {
        let addr = QueueAddress::parse("[my@queue]@[sch]]ema]@[[cat]]]").unwrap();
        assert_eq!(addr.table(), "my@queue");
        assert_eq!(addr.schema(), Some("sch]ema"));
        assert_eq!(addr.catalog(), Some("[cat]"));
    }

    #[test]
    fn test_format_quotes_when_required() {
        let addr = QueueAddress::new("a@b").with_schema("x]y");
        assert_eq!(addr.to_string(), "[a@b]@[x]]y]");
    }

    #[test]
    fn test_round_trip() {
        let cases = [
            QueueAddress::new("orders"),
            QueueAddress::new("orders").with_schema("dbo"),
            QueueAddress::new("orders").with_catalog("sales"),
            QueueAddress::new("orders").with_schema("dbo").with_catalog("sales"),
            QueueAddress::new("or]ders").with_schema("d]]bo"),
            QueueAddress::new("[weird@name]").with_schema(""),
        ];

        for addr in cases {
            let text = addr.to_string();
            assert_eq!(QueueAddress::parse(&text).unwrap(), addr, "{text}");
        }
    }

    #[test]
    fn test_invalid_addresses() {
        assert!(QueueAddress::parse("").is_err());
        assert!(QueueAddress::parse("@dbo").is_err());
        assert!(QueueAddress::parse("[]").is_err());
        assert!(QueueAddress::parse("a@b@c@d").is_err());
        assert!(QueueAddress::parse("[a]b@dbo").is_err());
    }

    #[test]
    fn test_serde_as_string() {
        let addr: QueueAddress = serde_json::from_str("\"orders@dbo\"").unwrap();
        assert_eq!(addr, QueueAddress::new("orders").with_schema("dbo"));
        assert_eq!(serde_json::to_string(&addr).unwrap(), "\"orders@dbo\"");
    }
}
