// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use serde_json::Value;

/// Sorts every named list inside a check result map by each item's `name`
/// field, for stable, presentation-friendly ordering. Items missing a `name`
/// sort before named ones rather than panicking or being dropped.
pub fn order(mut result: Value) -> Value {
    if let Value::Object(ref mut map) = result {
        for value in map.values_mut() {
            if let Value::Array(items) = value {
                items.sort_by(|a, b| item_name(a).cmp(item_name(b)));
            }
        }
    }
    result
}

fn item_name(item: &Value) -> &str {
    item.get("name").and_then(Value::as_str).unwrap_or("")
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn sorts_named_lists_by_name() {
        let result = json!({
            "disks": [
                { "name": "sdb", "size": 1 },
                { "name": "sda", "size": 2 },
            ],
            "note": "unaffected",
        });

        let ordered = order(result);
        assert_eq!(ordered["disks"][0]["name"], "sda");
        assert_eq!(ordered["disks"][1]["name"], "sdb");
        assert_eq!(ordered["note"], "unaffected");
    }

    #[test]
    fn non_object_result_passes_through_unchanged() {
        let result = json!([1, 2, 3]);
        assert_eq!(order(result.clone()), result);
    }

    #[test]
    fn items_without_name_sort_first() {
        let result = json!({
            "items": [
                { "name": "b" },
                { "value": 1 },
                { "name": "a" },
            ],
        });
        let ordered = order(result);
        assert_eq!(ordered["items"][0]["value"], 1);
        assert_eq!(ordered["items"][1]["name"], "a");
        assert_eq!(ordered["items"][2]["name"], "b");
    }
}
