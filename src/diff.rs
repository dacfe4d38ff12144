//! Structural change detection over JSON-shaped records.
//!
//! `diff` is the decision procedure behind item-update notifications: the
//! orchestrator compares a re-fetched item against the stored copy and only
//! fires an event when something actually differs. The reported descriptor is
//! deliberately one level deep — each differing key carries the whole old and
//! new value at that key, even though nested records are compared recursively
//! to decide whether the key differs at all.

use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Per-key report of `(old, new)` pairs for differing fields. `None` marks a
/// key absent on that side.
pub type Descriptor = BTreeMap<String, (Option<Value>, Option<Value>)>;

/// Result of comparing two values.
#[derive(Debug, Clone, PartialEq)]
pub enum Diff {
    /// Deeply equal by value.
    Equal,
    /// Different, but in nothing describable: mismatched kinds, or two
    /// unequal non-composite values (strings included).
    Distinct,
    /// Both composite; the descriptor lists every differing key.
    Changed(Descriptor),
}

impl Diff {
    /// True unless the values were equal.
    pub fn is_changed(&self) -> bool {
        !matches!(self, Diff::Equal)
    }

    /// The descriptor, when one was produced.
    pub fn into_descriptor(self) -> Option<Descriptor> {
        match self {
            Diff::Changed(d) => Some(d),
            _ => None,
        }
    }
}

/// Compare `a` and `b`. Pure; neither argument is modified.
pub fn diff(a: &Value, b: &Value) -> Diff {
    if values_equal(a, b) {
        return Diff::Equal;
    }

    match (a, b) {
        (Value::Object(a), Value::Object(b)) => Diff::Changed(object_descriptor(a, b)),
        (Value::Array(a), Value::Array(b)) => Diff::Changed(array_descriptor(a, b)),
        _ => Diff::Distinct,
    }
}

/// Deep equality with numbers compared numerically, so `1` and `1.0` are the
/// same value regardless of how serde_json parsed them.
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(a), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(a), Some(b)) => a == b,
            _ => a == b,
        },
        (Value::Array(a), Value::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(a, b)| values_equal(a, b))
        }
        (Value::Object(a), Value::Object(b)) => {
            a.len() == b.len()
                && a.iter()
                    .all(|(k, av)| b.get(k).is_some_and(|bv| values_equal(av, bv)))
        }
        _ => a == b,
    }
}

fn object_descriptor(a: &Map<String, Value>, b: &Map<String, Value>) -> Descriptor {
    let mut descr = Descriptor::new();
    for (key, av) in a {
        match b.get(key) {
            None => {
                descr.insert(key.clone(), (Some(av.clone()), None));
            }
            // The sub-diff only decides membership; the descriptor stores the
            // whole values at this key, not a nested delta.
            Some(bv) if diff(av, bv).is_changed() => {
                descr.insert(key.clone(), (Some(av.clone()), Some(bv.clone())));
            }
            Some(_) => {}
        }
    }
    for (key, bv) in b {
        if !a.contains_key(key) {
            descr.insert(key.clone(), (None, Some(bv.clone())));
        }
    }
    descr
}

/// Arrays are composite too; keys are decimal indices.
fn array_descriptor(a: &[Value], b: &[Value]) -> Descriptor {
    let mut descr = Descriptor::new();
    for (i, av) in a.iter().enumerate() {
        match b.get(i) {
            None => {
                descr.insert(i.to_string(), (Some(av.clone()), None));
            }
            Some(bv) if diff(av, bv).is_changed() => {
                descr.insert(i.to_string(), (Some(av.clone()), Some(bv.clone())));
            }
            Some(_) => {}
        }
    }
    for (i, bv) in b.iter().enumerate().skip(a.len()) {
        descr.insert(i.to_string(), (None, Some(bv.clone())));
    }
    descr
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn changed(pairs: &[(&str, (Option<Value>, Option<Value>))]) -> Diff {
        Diff::Changed(
            pairs
                .iter()
                .map(|(k, pair)| (k.to_string(), pair.clone()))
                .collect(),
        )
    }

    #[test]
    fn truth_values_are_distinguished() {
        assert_eq!(diff(&json!(false), &json!(false)), Diff::Equal);
        assert_eq!(diff(&json!(true), &json!(true)), Diff::Equal);

        assert_eq!(diff(&json!(false), &json!(true)), Diff::Distinct);
        assert_eq!(diff(&json!(true), &json!(false)), Diff::Distinct);

        assert_eq!(diff(&json!(true), &json!(1)), Diff::Distinct);
        assert_eq!(diff(&json!(false), &json!(1)), Diff::Distinct);
    }

    #[test]
    fn numbers_are_distinguished() {
        assert_eq!(diff(&json!(1), &json!(1)), Diff::Equal);
        assert_eq!(diff(&json!(1.0), &json!(1.0)), Diff::Equal);
        assert_eq!(diff(&json!(1), &json!(1.0)), Diff::Equal);

        assert_eq!(diff(&json!(1), &json!(2)), Diff::Distinct);
        assert_eq!(diff(&json!(2.0), &json!(1)), Diff::Distinct);
    }

    #[test]
    fn strings_are_distinguished() {
        assert_eq!(diff(&json!("a test"), &json!("a test")), Diff::Equal);
        assert_eq!(diff(&json!(""), &json!("")), Diff::Equal);
        assert_eq!(diff(&json!(""), &json!("a test")), Diff::Distinct);
        assert_eq!(diff(&json!("a test 1"), &json!("a test")), Diff::Distinct);
    }

    #[test]
    fn reflexive_on_nested_records() {
        let v = json!({"a": 1, "b": [true, {"c": "deep"}], "d": {"e": null}});
        assert_eq!(diff(&v, &v), Diff::Equal);
    }

    #[test]
    fn returns_new_elements() {
        let a = json!({"a": 1, "b": true, "c": "string"});
        let b = json!({"a": 1, "b": true, "c": "string", "e": "simple"});
        assert_eq!(
            diff(&a, &b),
            changed(&[("e", (None, Some(json!("simple"))))])
        );
    }

    #[test]
    fn returns_removed_elements() {
        let a = json!({"a": 1, "b": true, "c": "string"});
        let b = json!({"b": true, "c": "string"});
        assert_eq!(diff(&a, &b), changed(&[("a", (Some(json!(1)), None))]));
    }

    #[test]
    fn returns_changed_elements() {
        let a = json!({"a": 1, "b": true, "c": "string"});
        let b = json!({"a": 1, "b": false, "c": "new string"});
        assert_eq!(
            diff(&a, &b),
            changed(&[
                ("b", (Some(json!(true)), Some(json!(false)))),
                ("c", (Some(json!("string")), Some(json!("new string")))),
            ])
        );
    }

    #[test]
    fn descriptor_is_one_level_deep() {
        // The nested object differs two levels down, but the descriptor
        // reports the whole old and new value at the top-level key.
        let a = json!({"meta": {"tags": ["x"], "n": 1}, "same": "s"});
        let b = json!({"meta": {"tags": ["y"], "n": 1}, "same": "s"});
        assert_eq!(
            diff(&a, &b),
            changed(&[(
                "meta",
                (
                    Some(json!({"tags": ["x"], "n": 1})),
                    Some(json!({"tags": ["y"], "n": 1})),
                ),
            )])
        );
    }

    #[test]
    fn arrays_diff_by_index() {
        let a = json!([1, 2, 3]);
        let b = json!([1, 9]);
        assert_eq!(
            diff(&a, &b),
            changed(&[
                ("1", (Some(json!(2)), Some(json!(9)))),
                ("2", (Some(json!(3)), None)),
            ])
        );
    }

    #[test]
    fn mismatched_kinds_are_distinct() {
        assert_eq!(diff(&json!({"a": 1}), &json!([1])), Diff::Distinct);
        assert_eq!(diff(&json!("1"), &json!(1)), Diff::Distinct);
        assert_eq!(diff(&json!(null), &json!(0)), Diff::Distinct);
    }
}
