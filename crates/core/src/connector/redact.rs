use serde_json::Value;

/// Replaces values under sensitive keys and short strings.
pub const REDACTED: &str = "***redacted***";

const SENSITIVE_KEY_PARTS: [&str; 4] = ["token", "secret", "key", "password"];

/// Scrub a JSON value before it is embedded in an error or log line.
///
/// Strings longer than 10 characters keep their first four characters,
/// shorter strings are replaced entirely. Object keys containing
/// `token`, `secret`, `key` or `password` (any case) are masked whatever
/// their value.
pub fn redact_secrets(value: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(redact_str(s)),
        Value::Array(items) => Value::Array(items.iter().map(redact_secrets).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| {
                    let redacted = if is_sensitive_key(k) {
                        Value::String(REDACTED.to_string())
                    } else {
                        redact_secrets(v)
                    };
                    (k.clone(), redacted)
                })
                .collect(),
        ),
        other => other.clone(),
    }
}

fn redact_str(s: &str) -> String {
    if s.chars().count() > 10 {
        let prefix: String = s.chars().take(4).collect();
        format!("{prefix}…redacted")
    } else {
        REDACTED.to_string()
    }
}

fn is_sensitive_key(key: &str) -> bool {
    let lower = key.to_ascii_lowercase();
    SENSITIVE_KEY_PARTS.iter().any(|part| lower.contains(part))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sensitive_key_masked() {
        assert_eq!(
            redact_secrets(&json!({"token": "abcdefghijklmnop"})),
            json!({"token": REDACTED})
        );
        assert_eq!(
            redact_secrets(&json!({"X-Api-KEY": 42, "Password": null})),
            json!({"X-Api-KEY": REDACTED, "Password": REDACTED})
        );
    }

    #[test]
    fn test_long_string_keeps_prefix() {
        assert_eq!(redact_secrets(&json!("abcdefghijklmnop")), json!("abcd…redacted"));
        assert_eq!(redact_secrets(&json!("abcdefghijk")), json!("abcd…redacted"));
    }

    #[test]
    fn test_short_string_fully_masked() {
        assert_eq!(redact_secrets(&json!("abcdefghij")), json!(REDACTED));
        assert_eq!(redact_secrets(&json!("")), json!(REDACTED));
    }

    #[test]
    fn test_nested_structures() {
        let value = json!({
            "status": 401,
            "ok": false,
            "items": ["short", "a much longer string"],
            "auth": {"client_secret": "x", "user": "someone@example.com"}
        });

        assert_eq!(
            redact_secrets(&value),
            json!({
                "status": 401,
                "ok": false,
                "items": [REDACTED, "a mu…redacted"],
                "auth": {"client_secret": REDACTED, "user": "some…redacted"}
            })
        );
    }

    #[test]
    fn test_multibyte_prefix() {
        assert_eq!(redact_secrets(&json!("ééééééééééé")), json!("éééé…redacted"));
    }
}
