//! Dot-notation lookup into JSON payloads.

/// Resolves a dot-notation path against a JSON value.
///
/// Segments index into objects by key; a segment that parses as an integer
/// also indexes into arrays. Returns `None` for any miss — callers treat
/// that as a rule failure, not an error.
pub fn lookup<'a>(payload: &'a serde_json::Value, path: &str) -> Option<&'a serde_json::Value> {
    let mut current = payload;
    for segment in path.split('.') {
        current = match current {
            serde_json::Value::Object(map) => map.get(segment)?,
            serde_json::Value::Array(items) => {
                let index: usize = segment.parse().ok()?;
                items.get(index)?
            }
            _ => return None,
        };
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn top_level_key() {
        let payload = json!({"creditScore": 550});
        assert_eq!(lookup(&payload, "creditScore"), Some(&json!(550)));
    }

    #[test]
    fn nested_path() {
        let payload = json!({"customer": {"address": {"country": "DE"}}});
        assert_eq!(
            lookup(&payload, "customer.address.country"),
            Some(&json!("DE"))
        );
    }

    #[test]
    fn array_index_segment() {
        let payload = json!({"items": [{"sku": "A"}, {"sku": "B"}]});
        assert_eq!(lookup(&payload, "items.1.sku"), Some(&json!("B")));
    }

    #[test]
    fn missing_key_is_none() {
        let payload = json!({"a": 1});
        assert_eq!(lookup(&payload, "b"), None);
        assert_eq!(lookup(&payload, "a.b"), None);
    }

    #[test]
    fn scalar_midway_is_none() {
        let payload = json!({"a": 42});
        assert_eq!(lookup(&payload, "a.b.c"), None);
    }

    #[test]
    fn out_of_bounds_index_is_none() {
        let payload = json!({"items": [1]});
        assert_eq!(lookup(&payload, "items.5"), None);
    }
}
