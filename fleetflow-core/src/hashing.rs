//! Stable fingerprints for flow launches.

use std::collections::BTreeMap;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Renders JSON with object keys sorted so equal values always produce the
/// same bytes regardless of insertion order.
pub fn to_canonical_json(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => Value::String(s.clone()).to_string(),
        Value::Array(items) => {
            let rendered: Vec<String> =
                items.iter().map(to_canonical_json).collect();
            format!("[{}]", rendered.join(","))
        }
        Value::Object(map) => {
            let sorted: BTreeMap<&String, String> = map
                .iter()
                .map(|(k, v)| (k, to_canonical_json(v)))
                .collect();
            let rendered: Vec<String> = sorted
                .into_iter()
                .map(|(k, v)| {
                    format!("{}:{}", Value::String(k.clone()), v)
                })
                .collect();
            format!("{{{}}}", rendered.join(","))
        }
    }
}

/// Fingerprint of a flow type plus its normalized arguments.
pub fn flow_fingerprint(flow_name: &str, args: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(flow_name.as_bytes());
    hasher.update([0u8]);
    hasher.update(to_canonical_json(args).as_bytes());
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_json_sorts_nested_keys() {
        let value = json!({"b": [1, {"z": true, "a": null}], "a": "x\"y"});
        assert_eq!(
            to_canonical_json(&value),
            r#"{"a":"x\"y","b":[1,{"a":null,"z":true}]}"#
        );
    }

    #[test]
    fn fingerprint_depends_on_name_and_args() {
        let args = json!({"path": "/etc"});
        let a = flow_fingerprint("ListDirectory", &args);
        assert_eq!(a, flow_fingerprint("ListDirectory", &args));
        assert_ne!(a, flow_fingerprint("GetFile", &args));
        assert_ne!(a, flow_fingerprint("ListDirectory", &json!({"path": "/"})));
        assert!(!a.contains('/'));
    }
}
