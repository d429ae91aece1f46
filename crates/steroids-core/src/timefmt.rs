//! RFC3339 timestamp helpers shared by the sqlite stores.

use chrono::{DateTime, Utc};

use crate::{Error, Result};

/// Current instant in the persisted string form.
#[must_use]
pub fn now_str() -> String {
    Utc::now().to_rfc3339()
}

/// Parse a persisted RFC3339 timestamp.
pub fn parse_utc(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Parse(format!("invalid timestamp '{s}': {e}")))
}

/// Parse an optional persisted timestamp.
pub fn parse_utc_opt(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.map(|s| parse_utc(&s)).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() -> Result<()> {
        let now = now_str();
        let parsed = parse_utc(&now)?;
        assert_eq!(parsed.to_rfc3339(), now);
        Ok(())
    }

    #[test]
    fn test_invalid_timestamp_rejected() {
        assert!(parse_utc("not-a-time").is_err());
    }
}
