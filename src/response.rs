//! Normalized response shapes: the flat record and the page envelope shared by every listing.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Flat mapping from field name to value. Always carries `id` once normalized.
pub type Record = Map<String, Value>;

/// Page envelope returned by every listing operation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page {
    pub data: Vec<Record>,
    pub page: u64,
    pub per_page: u64,
    pub total: u64,
    pub page_count: u64,
}

impl Page {
    pub fn new(data: Vec<Record>, page: u64, per_page: u64, total: u64) -> Self {
        Page {
            data,
            page,
            per_page,
            total,
            page_count: page_count(total, per_page),
        }
    }
}

/// ceil(total / per_page); zero when there is nothing to page.
pub fn page_count(total: u64, per_page: u64) -> u64 {
    if per_page == 0 {
        return 0;
    }
    total.div_ceil(per_page)
}

/// Re-key a backend-native identifier (e.g. `_id`) to `id`.
pub fn rekey_id(mut record: Record, native_key: &str) -> Record {
    if native_key != "id" {
        if let Some(id) = record.remove(native_key) {
            record.insert("id".into(), id);
        }
    }
    record
}

/// Storage ids are integers; string forms such as `"5"` (e.g. from a URL path) are accepted.
pub fn normalize_id(id: &Value) -> Value {
    match id {
        Value::String(s) => s.parse::<i64>().map(Value::from).unwrap_or_else(|_| id.clone()),
        other => other.clone(),
    }
}

/// Keep only the requested fields (plus `id`). An empty selection keeps everything.
pub fn select_fields(record: Record, fields: Option<&[String]>) -> Record {
    match fields {
        Some(fields) if !fields.is_empty() => record
            .into_iter()
            .filter(|(k, _)| k == "id" || fields.iter().any(|f| f == k))
            .collect(),
        _ => record,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn page_count_rounds_up() {
        assert_eq!(page_count(23, 10), 3);
        assert_eq!(page_count(20, 10), 2);
        assert_eq!(page_count(0, 10), 0);
        assert_eq!(page_count(5, 0), 0);
    }

    #[test]
    fn page_serializes_in_camel_case() {
        let page = Page::new(vec![], 1, 10, 23);
        assert_eq!(
            serde_json::to_value(&page).unwrap(),
            json!({"data": [], "page": 1, "perPage": 10, "total": 23, "pageCount": 3})
        );
    }

    #[test]
    fn rekey_and_select() {
        let mut r = Record::new();
        r.insert("_id".into(), json!(7));
        r.insert("title".into(), json!("Hello"));
        r.insert("body".into(), json!("..."));
        let r = rekey_id(r, "_id");
        assert_eq!(r.get("id"), Some(&json!(7)));
        assert!(!r.contains_key("_id"));
        let r = select_fields(r, Some(&["title".to_string()]));
        assert_eq!(r.len(), 2);
        assert!(r.contains_key("title"));
    }

    #[test]
    fn string_ids_are_normalized() {
        assert_eq!(normalize_id(&json!("5")), json!(5));
        assert_eq!(normalize_id(&json!(5)), json!(5));
        assert_eq!(normalize_id(&json!("abc")), json!("abc"));
    }
}
