use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;

use crate::error::StoreError;

/// Deserialize a JSON text column into `T`.
pub fn parse_json<T: DeserializeOwned>(
    raw: &str,
    table: &'static str,
    column: &'static str,
) -> Result<T, StoreError> {
    serde_json::from_str(raw).map_err(|e| StoreError::CorruptRow {
        table,
        column,
        detail: format!("invalid JSON: {e}"),
    })
}

/// Parse a string into an enum, returning CorruptRow on failure.
pub fn parse_enum<T: std::str::FromStr>(
    raw: &str,
    table: &'static str,
    column: &'static str,
) -> Result<T, StoreError> {
    raw.parse().map_err(|_| StoreError::CorruptRow {
        table,
        column,
        detail: format!("unknown variant: {raw}"),
    })
}

/// Parse an RFC 3339 timestamp column.
pub fn parse_time(
    raw: &str,
    table: &'static str,
    column: &'static str,
) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::CorruptRow {
            table,
            column,
            detail: format!("invalid timestamp {raw}: {e}"),
        })
}

pub fn parse_time_opt(
    raw: Option<String>,
    table: &'static str,
    column: &'static str,
) -> Result<Option<DateTime<Utc>>, StoreError> {
    raw.map(|r| parse_time(&r, table, column)).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use confab_core::conversation::ConversationMode;

    #[test]
    fn parse_enum_reports_column() {
        let err = parse_enum::<ConversationMode>("chaotic", "conversations", "mode").unwrap_err();
        assert!(matches!(
            err,
            StoreError::CorruptRow {
                table: "conversations",
                column: "mode",
                ..
            }
        ));
    }

    #[test]
    fn parse_time_round_trip() {
        let now = Utc::now();
        let parsed = parse_time(&now.to_rfc3339(), "messages", "created_at").unwrap();
        assert_eq!(parsed, now);
        assert!(parse_time("yesterday", "messages", "created_at").is_err());
        assert_eq!(parse_time_opt(None, "t", "c").unwrap(), None);
    }

    #[test]
    fn parse_json_typed() {
        let ids: Vec<String> = parse_json(r#"["a","b"]"#, "messages", "mentions").unwrap();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(parse_json::<Vec<String>>("{", "messages", "mentions").is_err());
    }
}
