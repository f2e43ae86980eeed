//! Saved-link records and the update-wins merge.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use time::format_description::well_known::{Iso8601, Rfc3339};
use time::{Date, Month, OffsetDateTime, PrimitiveDateTime, Time};

/// One saved link, kept as the exact JSON value a client sent.
///
/// Only `id` and `updated_at` mean anything here; every other field belongs
/// to the clients and is carried through untouched. Entries that are not
/// objects or have no usable `id` are still preserved as stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SavedLinkRecord(Value);

impl SavedLinkRecord {
    pub fn new(id: impl Into<Value>, updated_at: impl Into<String>) -> Self {
        let mut fields = Map::new();
        fields.insert("id".to_string(), id.into());
        fields.insert("updated_at".to_string(), Value::String(updated_at.into()));
        Self(Value::Object(fields))
    }

    /// Set a client field. Ignored on entries that are not objects.
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        if let Value::Object(fields) = &mut self.0 {
            fields.insert(name.into(), value.into());
        }
        self
    }

    /// `id` in canonical string form: strings as they are, numbers and
    /// booleans as printed. `None` when missing, null or not a scalar.
    pub fn id(&self) -> Option<String> {
        match self.0.get("id")? {
            Value::String(id) => Some(id.clone()),
            Value::Number(id) => Some(id.to_string()),
            Value::Bool(id) => Some(id.to_string()),
            _ => None,
        }
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }

    /// `updated_at` as a point in time, if it can be read as one. Strings are
    /// parsed with [`parse_timestamp`], numbers are epoch milliseconds.
    pub fn updated_at(&self) -> Option<OffsetDateTime> {
        match self.0.get("updated_at")? {
            Value::String(timestamp) => parse_timestamp(timestamp),
            Value::Number(millis) => millis
                .as_i64()
                .and_then(|millis| OffsetDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000).ok()),
            _ => None,
        }
    }

    /// Whether this record changed strictly after `since`. A record without a
    /// readable timestamp never qualifies.
    pub fn updated_after(&self, since: OffsetDateTime) -> bool {
        self.updated_at().is_some_and(|updated_at| updated_at > since)
    }
}

impl From<Value> for SavedLinkRecord {
    fn from(value: Value) -> Self {
        Self(value)
    }
}

/// Read a timestamp the way browsers do for the formats clients send:
/// RFC 3339, ISO 8601 with an offset, or a bare `YYYY-MM-DD` (midnight UTC).
pub fn parse_timestamp(input: &str) -> Option<OffsetDateTime> {
    let input = input.trim();
    OffsetDateTime::parse(input, &Rfc3339)
        .or_else(|_| OffsetDateTime::parse(input, &Iso8601::DEFAULT))
        .ok()
        .or_else(|| parse_date(input))
}

fn parse_date(input: &str) -> Option<OffsetDateTime> {
    let mut parts = input.splitn(3, '-');
    let (year, month, day) = (parts.next()?, parts.next()?, parts.next()?);
    if year.len() != 4 || month.len() != 2 || day.len() != 2 {
        return None;
    }
    let month = Month::try_from(month.parse::<u8>().ok()?).ok()?;
    let date = Date::from_calendar_date(year.parse().ok()?, month, day.parse().ok()?).ok()?;
    Some(PrimitiveDateTime::new(date, Time::MIDNIGHT).assume_utc())
}

/// Combine the stored collection with records submitted by a client.
///
/// The result holds one record per `id`. A client record replaces the stored
/// one only when its `updated_at` is strictly later; ties and unreadable
/// timestamps keep the stored record. Stored records keep their position and
/// new ids are appended in the order they were submitted.
///
/// Stored entries without a usable `id` stay where they are. Submitted ones
/// are dropped, since they could never be matched on a later sync.
pub fn merge(stored: Vec<SavedLinkRecord>, incoming: Vec<SavedLinkRecord>) -> Vec<SavedLinkRecord> {
    let mut merged: Vec<SavedLinkRecord> = Vec::with_capacity(stored.len() + incoming.len());
    let mut positions: HashMap<String, usize> = HashMap::with_capacity(merged.capacity());
    for record in stored {
        match record.id() {
            Some(id) => upsert(&mut merged, &mut positions, id, record, |_, _| true),
            None => merged.push(record),
        }
    }
    for record in incoming {
        let Some(id) = record.id() else {
            tracing::debug!("Dropping submitted saved link without an id");
            continue;
        };
        upsert(&mut merged, &mut positions, id, record, |existing, candidate| {
            match (existing.updated_at(), candidate.updated_at()) {
                (Some(existing), Some(candidate)) => candidate > existing,
                _ => false,
            }
        });
    }
    merged
}

fn upsert(
    merged: &mut Vec<SavedLinkRecord>,
    positions: &mut HashMap<String, usize>,
    id: String,
    record: SavedLinkRecord,
    replaces: impl Fn(&SavedLinkRecord, &SavedLinkRecord) -> bool,
) {
    match positions.get(&id) {
        Some(&index) => {
            if replaces(&merged[index], &record) {
                merged[index] = record;
            }
        },
        None => {
            positions.insert(id, merged.len());
            merged.push(record);
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;
    use time::macros::datetime;

    fn ids(records: &[SavedLinkRecord]) -> Vec<String> {
        records.iter().map(|record| record.id().unwrap_or_default()).collect()
    }

    #[rstest]
    #[case("2025-03-01T10:00:00Z", Some(datetime!(2025-03-01 10:00:00 UTC)))]
    #[case("2025-03-01T10:00:00.123Z", Some(datetime!(2025-03-01 10:00:00.123 UTC)))]
    #[case("2025-03-01T12:00:00+02:00", Some(datetime!(2025-03-01 10:00:00 UTC)))]
    #[case(" 2025-03-01T10:00:00Z ", Some(datetime!(2025-03-01 10:00:00 UTC)))]
    #[case("2025-03-01", Some(datetime!(2025-03-01 00:00:00 UTC)))]
    #[case("2025-02-30", None)]
    #[case("yesterday", None)]
    #[case("", None)]
    fn test_parse_timestamp(#[case] input: &str, #[case] expected: Option<OffsetDateTime>) {
        assert_eq!(parse_timestamp(input), expected);
    }

    #[test]
    fn test_epoch_millis() {
        let record: SavedLinkRecord = serde_json::from_value(json!({"id": "a", "updated_at": 1_740_823_200_000_i64})).unwrap();
        assert_eq!(record.updated_at(), Some(datetime!(2025-03-01 10:00:00 UTC)));
    }

    #[test]
    fn test_unknown_fields_round_trip() {
        let input = json!({"id": "a", "url": "https://x.example", "updated_at": "2025-03-01T10:00:00Z", "tags": ["x"], "deleted": false});
        let record: SavedLinkRecord = serde_json::from_value(input.clone()).unwrap();
        assert_eq!(record.field("url"), Some(&json!("https://x.example")));
        assert_eq!(serde_json::to_value(&record).unwrap(), input);

        let missing: SavedLinkRecord = serde_json::from_value(json!({"id": "b"})).unwrap();
        assert_eq!(missing.updated_at(), None);
        assert_eq!(serde_json::to_value(&missing).unwrap(), json!({"id": "b"}));
    }

    #[test]
    fn test_merge_update_wins() {
        let stored = vec![
            SavedLinkRecord::new("a", "2025-03-01T10:00:00Z").with_field("title", "stored a"),
            SavedLinkRecord::new("b", "2025-03-01T10:00:00Z").with_field("title", "stored b"),
            SavedLinkRecord::new("c", "2025-03-01T10:00:00Z").with_field("title", "stored c"),
        ];
        let incoming = vec![
            SavedLinkRecord::new("d", "2025-03-01T09:00:00Z").with_field("title", "new d"),
            SavedLinkRecord::new("a", "2025-03-01T10:00:01Z").with_field("title", "newer a"),
            SavedLinkRecord::new("b", "2025-03-01T09:59:59Z").with_field("title", "older b"),
            SavedLinkRecord::new("c", "2025-03-01T10:00:00Z").with_field("title", "tied c"),
        ];

        let merged = merge(stored, incoming);

        assert_eq!(ids(&merged), ["a", "b", "c", "d"]);
        let titles: Vec<_> = merged.iter().map(|record| record.field("title").and_then(Value::as_str).unwrap()).collect();
        assert_eq!(titles, ["newer a", "stored b", "stored c", "new d"]);
    }

    #[test]
    fn test_merge_unreadable_timestamps_never_win() {
        let stored = vec![SavedLinkRecord::new("a", "garbage"), SavedLinkRecord::new("b", "2025-03-01T10:00:00Z")];
        let incoming = vec![
            SavedLinkRecord::new("a", "2025-03-01T10:00:00Z").with_field("client", true),
            SavedLinkRecord::new("b", "not a date").with_field("client", true),
        ];

        let merged = merge(stored, incoming);

        assert!(merged.iter().all(|record| record.field("client").is_none()));
    }

    #[test]
    fn test_merge_duplicate_ids() {
        let stored = vec![
            SavedLinkRecord::new("a", "2025-03-01T10:00:00Z").with_field("n", 1),
            SavedLinkRecord::new("a", "2025-03-01T08:00:00Z").with_field("n", 2),
        ];
        let incoming = vec![
            SavedLinkRecord::new("b", "2025-03-01T10:00:00Z").with_field("n", 3),
            SavedLinkRecord::new("b", "2025-03-01T11:00:00Z").with_field("n", 4),
        ];

        let merged = merge(stored, incoming);

        assert_eq!(ids(&merged), ["a", "b"]);
        // Later stored duplicates overwrite earlier ones in place.
        assert_eq!(merged[0].field("n"), Some(&json!(2)));
        assert_eq!(merged[1].field("n"), Some(&json!(4)));
    }

    #[rstest]
    #[case(json!({"id": "a"}), Some("a"))]
    #[case(json!({"id": 17}), Some("17"))]
    #[case(json!({"id": 1.5}), Some("1.5"))]
    #[case(json!({"id": true}), Some("true"))]
    #[case(json!({"id": null}), None)]
    #[case(json!({"id": ["a"]}), None)]
    #[case(json!({"url": "https://x.example"}), None)]
    #[case(json!("just a string"), None)]
    fn test_canonical_id(#[case] input: Value, #[case] expected: Option<&str>) {
        let record: SavedLinkRecord = serde_json::from_value(input.clone()).unwrap();
        assert_eq!(record.id().as_deref(), expected);
        assert_eq!(serde_json::to_value(&record).unwrap(), input);
    }

    #[test]
    fn test_merge_keeps_entries_without_id() {
        let stored: Vec<SavedLinkRecord> = serde_json::from_value(json!([
            {"id": 1, "updated_at": "2025-03-01T10:00:00Z", "url": "https://keep.example/1"},
            {"url": "https://keep.example/orphan"},
            "legacy entry",
            {"id": "b", "updated_at": "2025-03-01T10:00:00Z"},
        ]))
        .unwrap();
        let incoming = vec![
            SavedLinkRecord::new("1", "2025-03-01T11:00:00Z").with_field("url", "https://keep.example/1-edited"),
            SavedLinkRecord::from(json!({"url": "https://drop.example"})),
            SavedLinkRecord::new("c", "2025-03-01T11:00:00Z"),
        ];

        let merged = merge(stored.clone(), incoming);

        assert_eq!(merged.len(), 5);
        // Numeric and string ids compare by their canonical form.
        assert_eq!(merged[0].field("url"), Some(&json!("https://keep.example/1-edited")));
        assert_eq!(merged[1], stored[1]);
        assert_eq!(merged[2], stored[2]);
        assert_eq!(ids(&merged[3..]), ["b", "c"]);
    }

    #[test]
    fn test_updated_after() {
        let since = datetime!(2025-03-01 10:00:00 UTC);
        assert!(SavedLinkRecord::new("a", "2025-03-01T10:00:01Z").updated_after(since));
        assert!(!SavedLinkRecord::new("a", "2025-03-01T10:00:00Z").updated_after(since));
        assert!(!SavedLinkRecord::new("a", "soon").updated_after(since));
    }
}
