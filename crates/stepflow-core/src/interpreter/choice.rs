//! Choice rule evaluation over a state's input data.
//!
//! Variables are JSON paths of the form `$`, `$.a.b` or `$.items[2].name`.
//! A path that does not resolve makes every comparison on it false (only
//! `isPresent` can observe the difference).

use serde_json::Value;
use stepflow_types::definition::{ChoiceState, Condition};

/// Resolve a `$`-rooted path against `data`.
pub fn resolve_path<'a>(data: &'a Value, path: &str) -> Option<&'a Value> {
    let rest = path.strip_prefix('$')?;
    let mut current = data;
    let mut chars = rest.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '.' => {
                let mut key = String::new();
                while let Some(&next) = chars.peek() {
                    if next == '.' || next == '[' {
                        break;
                    }
                    key.push(next);
                    chars.next();
                }
                if key.is_empty() {
                    return None;
                }
                current = current.as_object()?.get(&key)?;
            }
            '[' => {
                let mut digits = String::new();
                for next in chars.by_ref() {
                    if next == ']' {
                        break;
                    }
                    digits.push(next);
                }
                let index: usize = digits.trim().parse().ok()?;
                current = current.as_array()?.get(index)?;
            }
            _ => return None,
        }
    }
    Some(current)
}

/// Evaluate a condition against `data`.
pub fn evaluate(condition: &Condition, data: &Value) -> bool {
    match condition {
        Condition::StringEquals(c) => {
            resolve_path(data, &c.variable).and_then(Value::as_str) == Some(c.value.as_str())
        }
        Condition::NumericEquals(c) => numeric(data, &c.variable).is_some_and(|v| v == c.value),
        Condition::NumericLessThan(c) => numeric(data, &c.variable).is_some_and(|v| v < c.value),
        Condition::NumericLessThanEquals(c) => numeric(data, &c.variable).is_some_and(|v| v <= c.value),
        Condition::NumericGreaterThan(c) => numeric(data, &c.variable).is_some_and(|v| v > c.value),
        Condition::NumericGreaterThanEquals(c) => numeric(data, &c.variable).is_some_and(|v| v >= c.value),
        Condition::BooleanEquals(c) => {
            resolve_path(data, &c.variable).and_then(Value::as_bool) == Some(c.value)
        }
        Condition::IsPresent(c) => resolve_path(data, &c.variable).is_some() == c.value,
        Condition::And(conditions) => conditions.iter().all(|c| evaluate(c, data)),
        Condition::Or(conditions) => conditions.iter().any(|c| evaluate(c, data)),
        Condition::Not(inner) => !evaluate(inner, data),
    }
}

fn numeric(data: &Value, path: &str) -> Option<f64> {
    resolve_path(data, path).and_then(Value::as_f64)
}

/// Target of the first rule that holds, falling back to the default.
pub fn choose<'a>(choice: &'a ChoiceState, data: &Value) -> Option<&'a str> {
    choice
        .choices
        .iter()
        .find(|rule| evaluate(&rule.condition, data))
        .map(|rule| rule.next.as_str())
        .or(choice.default.as_deref())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use stepflow_types::definition::Comparison;

    fn cmp<T>(variable: &str, value: T) -> Comparison<T> {
        Comparison {
            variable: variable.to_string(),
            value,
        }
    }

    #[test]
    fn test_resolve_path() {
        let data = json!({"a": {"b": [10, {"c": "deep"}]}, "flag": true});
        assert_eq!(resolve_path(&data, "$"), Some(&data));
        assert_eq!(resolve_path(&data, "$.flag"), Some(&json!(true)));
        assert_eq!(resolve_path(&data, "$.a.b[0]"), Some(&json!(10)));
        assert_eq!(resolve_path(&data, "$.a.b[1].c"), Some(&json!("deep")));
        assert_eq!(resolve_path(&data, "$.a.b[5]"), None);
        assert_eq!(resolve_path(&data, "$.missing"), None);
        assert_eq!(resolve_path(&data, "a.b"), None);
        assert_eq!(resolve_path(&data, "$."), None);
    }

    #[test]
    fn test_comparisons() {
        let data = json!({"kind": "csv", "rows": 42, "done": false});
        assert!(evaluate(&Condition::StringEquals(cmp("$.kind", "csv".to_string())), &data));
        assert!(!evaluate(&Condition::StringEquals(cmp("$.rows", "42".to_string())), &data));
        assert!(evaluate(&Condition::NumericEquals(cmp("$.rows", 42.0)), &data));
        assert!(evaluate(&Condition::NumericGreaterThan(cmp("$.rows", 41.5)), &data));
        assert!(evaluate(&Condition::NumericLessThanEquals(cmp("$.rows", 42.0)), &data));
        assert!(!evaluate(&Condition::NumericLessThan(cmp("$.rows", 42.0)), &data));
        assert!(evaluate(&Condition::BooleanEquals(cmp("$.done", false)), &data));
        assert!(evaluate(&Condition::IsPresent(cmp("$.missing", false)), &data));
        assert!(!evaluate(&Condition::NumericGreaterThanEquals(cmp("$.missing", 0.0)), &data));
    }

    #[test]
    fn test_combinators() {
        let data = json!({"n": 5});
        let gt = Condition::NumericGreaterThan(cmp("$.n", 1.0));
        let lt = Condition::NumericLessThan(cmp("$.n", 3.0));
        assert!(!evaluate(&Condition::And(vec![gt.clone(), lt.clone()]), &data));
        assert!(evaluate(&Condition::Or(vec![gt, lt.clone()]), &data));
        assert!(evaluate(&Condition::Not(Box::new(lt)), &data));
        assert!(evaluate(&Condition::And(vec![]), &data));
    }

    #[test]
    fn test_choose_first_match_then_default() {
        let choice: ChoiceState = serde_json::from_value(json!({
            "choices": [
                {"numericGreaterThan": {"variable": "$.n", "value": 10}, "next": "big"},
                {"numericGreaterThan": {"variable": "$.n", "value": 0}, "next": "small"}
            ],
            "default": "zero"
        }))
        .unwrap();
        assert_eq!(choose(&choice, &json!({"n": 20})), Some("big"));
        assert_eq!(choose(&choice, &json!({"n": 3})), Some("small"));
        assert_eq!(choose(&choice, &json!({"n": -1})), Some("zero"));

        let no_default = ChoiceState {
            default: None,
            ..choice
        };
        assert_eq!(choose(&no_default, &json!({})), None);
    }
}
