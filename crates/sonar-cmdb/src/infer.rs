//! Configuration-item type inference.
//!
//! A storage-tagging hint only: classification never affects read
//! semantics. Heuristics look at which fields are present in the blob.

use serde_json::Value;

/// Classify a CI blob for the `ci_type` row column.
///
/// Checks run from most to least specific so a blob carrying both
/// `nodes` and `ip` tags as a cluster, not a host.
#[must_use]
pub fn infer_ci_type(value: &Value) -> &'static str {
    let Some(object) = value.as_object() else {
        return "general";
    };
    let has = |field: &str| object.contains_key(field);

    if has("cidr") || has("subnet") {
        "network"
    } else if has("nodes") {
        "cluster"
    } else if has("capacity") || has("mount") {
        "storage"
    } else if has("port") || has("protocol") {
        "service"
    } else if has("ip") || has("hostname") || has("os") {
        "host"
    } else {
        "general"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn classifies_by_present_fields() {
        assert_eq!(infer_ci_type(&json!({"ip": "10.0.0.1", "os": "linux"})), "host");
        assert_eq!(infer_ci_type(&json!({"nodes": ["a", "b"]})), "cluster");
        assert_eq!(infer_ci_type(&json!({"port": 161, "protocol": "udp"})), "service");
        assert_eq!(infer_ci_type(&json!({"cidr": "10.0.0.0/24"})), "network");
        assert_eq!(infer_ci_type(&json!({"mount": "/srv", "capacity": 1024})), "storage");
        assert_eq!(infer_ci_type(&json!({"label": "misc"})), "general");
        assert_eq!(infer_ci_type(&json!("not an object")), "general");
    }

    #[test]
    fn more_specific_fields_win() {
        // A cluster record often carries host-ish fields too.
        assert_eq!(
            infer_ci_type(&json!({"nodes": ["n1"], "ip": "10.0.0.1"})),
            "cluster"
        );
    }
}
