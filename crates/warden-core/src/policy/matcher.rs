use regex::Regex;
use serde_json::Value as JsonValue;
use warden_common::PolicyOperator;

/// Follows a dot-separated path through objects; numeric segments index arrays.
/// An empty path addresses the value itself.
pub fn resolve_path<'a>(value: &'a JsonValue, path: &str) -> Option<&'a JsonValue> {
    let path = path.trim();
    if path.is_empty() {
        return Some(value);
    }
    path.split('.').try_fold(value, |current, segment| match current {
        JsonValue::Object(map) => map.get(segment),
        JsonValue::Array(items) => segment.parse::<usize>().ok().and_then(|idx| items.get(idx)),
        _ => None,
    })
}

fn as_comparable(value: &JsonValue) -> String {
    match value {
        JsonValue::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Whether the value at `path` satisfies `operator expected`. A missing path never matches.
pub fn matches(value: &JsonValue, path: &str, operator: PolicyOperator, expected: &str) -> bool {
    let Some(found) = resolve_path(value, path) else {
        return false;
    };
    let actual = as_comparable(found);
    match operator {
        PolicyOperator::Equal => actual == expected,
        PolicyOperator::NotEqual => actual != expected,
        PolicyOperator::Contains => actual.contains(expected),
        PolicyOperator::NotContains => !actual.contains(expected),
        PolicyOperator::StartsWith => actual.starts_with(expected),
        PolicyOperator::EndsWith => actual.ends_with(expected),
        PolicyOperator::Regex => match Regex::new(expected) {
            Ok(re) => re.is_match(&actual),
            Err(err) => {
                tracing::warn!(pattern = expected, error = %err, "invalid policy regex never matches");
                false
            }
        },
    }
}

/// `*` applies a policy to every tool.
pub fn tool_name_matches(pattern: &str, tool_name: &str) -> bool {
    pattern == "*" || pattern == tool_name
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn resolves_nested_and_indexed_paths() {
        let value = json!({"options": {"paths": ["/tmp/a", "/etc/passwd"]}});
        assert_eq!(
            resolve_path(&value, "options.paths.1"),
            Some(&json!("/etc/passwd"))
        );
        assert_eq!(resolve_path(&value, "options.missing"), None);
        assert_eq!(resolve_path(&value, ""), Some(&value));
    }

    #[test]
    fn operators() {
        let value = json!({"cmd": "rm -rf /", "count": 3});
        assert!(matches(&value, "cmd", PolicyOperator::StartsWith, "rm"));
        assert!(matches(&value, "cmd", PolicyOperator::EndsWith, "/"));
        assert!(matches(&value, "cmd", PolicyOperator::Contains, "-rf"));
        assert!(!matches(&value, "cmd", PolicyOperator::NotContains, "-rf"));
        assert!(matches(&value, "count", PolicyOperator::Equal, "3"));
        assert!(matches(&value, "count", PolicyOperator::NotEqual, "4"));
        assert!(matches(&value, "cmd", PolicyOperator::Regex, r"^rm\s+-rf"));
    }

    #[test]
    fn missing_path_and_bad_regex_do_not_match() {
        let value = json!({"a": 1});
        assert!(!matches(&value, "b", PolicyOperator::NotEqual, "x"));
        assert!(!matches(&value, "a", PolicyOperator::Regex, "("));
    }

    #[test]
    fn wildcard_tool_name() {
        assert!(tool_name_matches("*", "anything"));
        assert!(tool_name_matches("read_file", "read_file"));
        assert!(!tool_name_matches("read_file", "write_file"));
    }
}
