use serde_json::Value;

const SENSITIVE: &[&str] = &[
    "password",
    "secret",
    "token",
    "apikey",
    "api_key",
    "cvv",
    "pin",
    "authorization",
    "signature",
];

pub const REDACTED: &str = "[REDACTED]";

fn is_sensitive(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    SENSITIVE.iter().any(|s| key.contains(s))
}

/// Copy of `value` with sensitive keys masked at any depth.
pub fn redact(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| {
                    let v = if is_sensitive(k) {
                        Value::String(REDACTED.to_string())
                    } else {
                        redact(v)
                    };
                    (k.clone(), v)
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(redact).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_masks_nested_keys_case_insensitively() {
        let raw = json!({
            "event": "charge.success",
            "data": {
                "customer": {"email": "a@b.c", "Password": "hunter2"},
                "authorization": {"authorization_code": "AUTH_x"},
                "items": [{"cardPin": "1234", "sku": "x"}],
                "apiKey": "sk_live"
            }
        });

        let out = redact(&raw);

        assert_eq!(out["event"], "charge.success");
        assert_eq!(out["data"]["customer"]["email"], "a@b.c");
        assert_eq!(out["data"]["customer"]["Password"], REDACTED);
        assert_eq!(out["data"]["authorization"], REDACTED);
        assert_eq!(out["data"]["items"][0]["cardPin"], REDACTED);
        assert_eq!(out["data"]["items"][0]["sku"], "x");
        assert_eq!(out["data"]["apiKey"], REDACTED);
    }

    #[test]
    fn test_scalars_pass_through() {
        assert_eq!(redact(&json!(42)), json!(42));
        assert_eq!(redact(&json!("token")), json!("token"));
    }
}
