//! Stable keys for idempotency records and cached results.

use crate::tool::ToolContext;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Hex SHA-256 over (tool, user, tenant, canonical arguments).
///
/// Every field is length-prefixed and an absent user or tenant hashes
/// differently from any present value. Object keys are sorted at every
/// depth, and `null` arguments hash the same as `{}`. The trace id is not
/// part of the key.
pub fn fingerprint(tool: &str, args: &Value, context: &ToolContext) -> String {
    let mut hasher = Sha256::new();
    write_field(&mut hasher, Some(tool));
    write_field(&mut hasher, context.user_id.as_deref());
    write_field(&mut hasher, context.tenant_id.as_deref());
    write_field(&mut hasher, Some(&canonical_json(args)));
    format!("{:x}", hasher.finalize())
}

fn write_field(hasher: &mut Sha256, field: Option<&str>) {
    match field {
        None => hasher.update([0u8]),
        Some(text) => {
            hasher.update([1u8]);
            hasher.update((text.len() as u64).to_be_bytes());
            hasher.update(text.as_bytes());
        }
    }
}

/// JSON text with object keys sorted recursively.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    match value {
        Value::Null => out.push_str("{}"),
        other => write_canonical(other, &mut out),
    }
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_order_does_not_matter() {
        let a = json!({"b": 1, "a": {"y": [1, {"d": 2, "c": 3}], "x": null}});
        let b = json!({"a": {"x": null, "y": [1, {"c": 3, "d": 2}]}, "b": 1});
        assert_eq!(canonical_json(&a), canonical_json(&b));
        assert_eq!(canonical_json(&a), r#"{"a":{"x":null,"y":[1,{"c":3,"d":2}]},"b":1}"#);
    }

    #[test]
    fn null_matches_empty_object() {
        let ctx = ToolContext::new("u1", "t1");
        assert_eq!(
            fingerprint("projects.list", &Value::Null, &ctx),
            fingerprint("projects.list", &json!({}), &ctx)
        );
    }

    #[test]
    fn identity_and_tool_are_part_of_the_key() {
        let args = json!({"id": 7});
        let u1 = ToolContext::new("u1", "t1");
        let u2 = ToolContext::new("u2", "t1");
        assert_ne!(fingerprint("a.b", &args, &u1), fingerprint("a.b", &args, &u2));
        assert_ne!(fingerprint("a.b", &args, &u1), fingerprint("a.c", &args, &u1));
        // same caller in a different run
        let u1_again = ToolContext::new("u1", "t1");
        assert_eq!(fingerprint("a.b", &args, &u1), fingerprint("a.b", &args, &u1_again));
    }

    #[test]
    fn separators_inside_ids_do_not_collide() {
        let args = json!({});
        let a = ToolContext::new("a@b", "c");
        let b = ToolContext::new("a", "b@c");
        assert_ne!(fingerprint("a.b", &args, &a), fingerprint("a.b", &args, &b));
    }

    #[test]
    fn absent_ids_differ_from_placeholder_strings() {
        let args = json!({});
        let mut anonymous = ToolContext::anonymous();
        let dashed = ToolContext::new("-", "-");
        assert_ne!(fingerprint("a.b", &args, &anonymous), fingerprint("a.b", &args, &dashed));

        anonymous.user_id = Some(String::new());
        let mut no_user = ToolContext::anonymous();
        no_user.tenant_id = Some(String::new());
        assert_ne!(fingerprint("a.b", &args, &anonymous), fingerprint("a.b", &args, &no_user));
    }
}
