use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use serde_with::skip_serializing_none;

use crate::controller::error::RelayError;

pub const SCRATCH_FIELD: &str = "__NewAPIInternal";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OverrideMode {
    Delete,
    #[default]
    Set,
    Move,
    Prepend,
    Append,
    Block,
    Pass,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConditionMode {
    #[default]
    Full,
    Prefix,
    Suffix,
    Contains,
    Gt,
    Gte,
    Lt,
    Lte,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Logic {
    #[serde(alias = "and", alias = "And")]
    #[serde(rename = "AND")]
    And,
    #[default]
    #[serde(alias = "or", alias = "Or")]
    #[serde(rename = "OR")]
    Or,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OverrideCondition {
    pub path: String,
    pub mode: ConditionMode,
    pub value: Value,
    pub invert: bool,
    pub pass_missing_key: bool,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OverrideOperation {
    pub path: String,
    pub mode: OverrideMode,
    pub value: Option<Value>,
    pub keep_origin: bool,
    pub from: Option<String>,
    pub to: Option<String>,
    pub conditions: Vec<OverrideCondition>,
    pub logic: Logic,
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Key(String),
    Index(i64),
}

fn parse_path(path: &str) -> Vec<Segment> {
    path.split('.')
        .filter(|s| !s.is_empty())
        .map(|s| match s.parse::<i64>() {
            Ok(i) => Segment::Index(i),
            Err(_) => Segment::Key(s.to_string()),
        })
        .collect()
}

fn resolve_index(index: i64, len: usize) -> Option<usize> {
    let resolved = if index < 0 { len as i64 + index } else { index };
    (resolved >= 0 && (resolved as usize) < len).then_some(resolved as usize)
}

fn get_path<'a>(doc: &'a Value, path: &[Segment]) -> Option<&'a Value> {
    let mut current = doc;
    for segment in path {
        current = match (segment, current) {
            (Segment::Key(key), Value::Object(map)) => map.get(key)?,
            (Segment::Index(i), Value::Array(items)) => items.get(resolve_index(*i, items.len())?)?,
            (Segment::Index(i), Value::Object(map)) => map.get(&i.to_string())?,
            _ => return None,
        };
    }
    Some(current)
}

/// Walks to the parent of the last segment, creating objects on the way.
fn parent_mut<'a>(doc: &'a mut Value, path: &[Segment]) -> Option<&'a mut Value> {
    let mut current = doc;
    for segment in path {
        current = match segment {
            Segment::Key(key) => {
                if current.is_null() {
                    *current = Value::Object(Map::new());
                }
                current.as_object_mut()?.entry(key.clone()).or_insert(Value::Null)
            }
            Segment::Index(i) => {
                let items = current.as_array_mut()?;
                let idx = resolve_index(*i, items.len())?;
                &mut items[idx]
            }
        };
    }
    Some(current)
}

/// Whether [`set_path`] can place a value at `path`. Checked up front so a
/// failed set creates nothing on the way.
fn settable(doc: &Value, path: &[Segment]) -> bool {
    let Some((last, parents)) = path.split_last() else {
        return true;
    };
    let mut current = Some(doc);
    for segment in parents {
        current = match (segment, current) {
            (Segment::Key(_), None | Some(Value::Null)) => None,
            (Segment::Key(key), Some(Value::Object(map))) => map.get(key),
            (Segment::Index(i), Some(Value::Array(items))) => match resolve_index(*i, items.len()) {
                Some(idx) => Some(&items[idx]),
                None => return false,
            },
            _ => return false,
        };
    }
    match (last, current) {
        (_, None | Some(Value::Null) | Some(Value::Object(_))) => true,
        (Segment::Index(i), Some(Value::Array(items))) => {
            resolve_index(*i, items.len()).is_some() || *i as usize == items.len()
        }
        _ => false,
    }
}

fn set_path(doc: &mut Value, path: &[Segment], value: Value) -> bool {
    let Some((last, parents)) = path.split_last() else {
        *doc = value;
        return true;
    };
    if !settable(doc, path) {
        return false;
    }
    let Some(parent) = parent_mut(doc, parents) else {
        return false;
    };
    if parent.is_null() {
        *parent = Value::Object(Map::new());
    }
    match (last, parent) {
        (Segment::Key(key), Value::Object(map)) => {
            map.insert(key.clone(), value);
            true
        }
        (Segment::Index(i), Value::Array(items)) => match resolve_index(*i, items.len()) {
            Some(idx) => {
                items[idx] = value;
                true
            }
            None if *i as usize == items.len() => {
                items.push(value);
                true
            }
            None => false,
        },
        (Segment::Index(i), Value::Object(map)) => {
            map.insert(i.to_string(), value);
            true
        }
        _ => false,
    }
}

fn delete_path(doc: &mut Value, path: &[Segment]) -> Option<Value> {
    let (last, parents) = path.split_last()?;
    let mut current = doc;
    for segment in parents {
        current = match (segment, current) {
            (Segment::Key(key), Value::Object(map)) => map.get_mut(key)?,
            (Segment::Index(i), Value::Array(items)) => {
                let idx = resolve_index(*i, items.len())?;
                &mut items[idx]
            }
            _ => return None,
        };
    }
    match (last, current) {
        (Segment::Key(key), Value::Object(map)) => map.remove(key),
        (Segment::Index(i), Value::Array(items)) => {
            let idx = resolve_index(*i, items.len())?;
            Some(items.remove(idx))
        }
        _ => None,
    }
}

fn as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

fn condition_holds(doc: &Value, cond: &OverrideCondition) -> bool {
    let Some(actual) = get_path(doc, &parse_path(&cond.path)) else {
        return cond.pass_missing_key;
    };
    let expected = &cond.value;
    let matched = match cond.mode {
        ConditionMode::Full => actual == expected || as_text(actual) == as_text(expected),
        ConditionMode::Prefix => as_text(actual).starts_with(&as_text(expected)),
        ConditionMode::Suffix => as_text(actual).ends_with(&as_text(expected)),
        ConditionMode::Contains => match actual {
            Value::Array(items) => items.iter().any(|item| item == expected || as_text(item).contains(&as_text(expected))),
            _ => as_text(actual).contains(&as_text(expected)),
        },
        ConditionMode::Gt | ConditionMode::Gte | ConditionMode::Lt | ConditionMode::Lte => {
            match (as_number(actual), as_number(expected)) {
                (Some(a), Some(b)) => match cond.mode {
                    ConditionMode::Gt => a > b,
                    ConditionMode::Gte => a >= b,
                    ConditionMode::Lt => a < b,
                    _ => a <= b,
                },
                _ => false,
            }
        }
    };
    matched != cond.invert
}

fn conditions_hold(doc: &Value, op: &OverrideOperation) -> bool {
    if op.conditions.is_empty() {
        return true;
    }
    match op.logic {
        Logic::And => op.conditions.iter().all(|c| condition_holds(doc, c)),
        Logic::Or => op.conditions.iter().any(|c| condition_holds(doc, c)),
    }
}

/// Objects merge key by key; with `keep_origin` existing keys win.
fn deep_merge(target: &mut Map<String, Value>, source: &Map<String, Value>, keep_origin: bool) {
    for (key, value) in source {
        match (target.get_mut(key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => deep_merge(existing, incoming, keep_origin),
            (Some(existing), _) if keep_origin && !existing.is_null() => {}
            _ => {
                target.insert(key.clone(), value.clone());
            }
        }
    }
}

fn splice(doc: &mut Value, path: &[Segment], value: Value, keep_origin: bool, prepend: bool) {
    let target = get_path(doc, path).cloned();
    let merged = match (target, value) {
        (None | Some(Value::Null), value) => value,
        (Some(Value::Array(mut items)), value) => {
            let incoming = match value {
                Value::Array(values) => values,
                other => vec![other],
            };
            if prepend {
                let mut combined = incoming;
                combined.extend(items);
                Value::Array(combined)
            } else {
                items.extend(incoming);
                Value::Array(items)
            }
        }
        (Some(Value::String(s)), value) => {
            let text = as_text(&value);
            Value::String(if prepend { text + &s } else { s + &text })
        }
        (Some(Value::Object(mut map)), Value::Object(incoming)) => {
            if prepend {
                let mut base = incoming;
                deep_merge(&mut base, &map, !keep_origin);
                Value::Object(base)
            } else {
                deep_merge(&mut map, &incoming, keep_origin);
                Value::Object(map)
            }
        }
        (Some(existing), _) => existing,
    };
    set_path(doc, path, merged);
}

/// Applies `ops` in order. `prompt_tokens` is visible to conditions under
/// `__NewAPIInternal.PromptTokens` and removed afterwards.
pub fn apply_param_override(doc: &mut Value, ops: &[OverrideOperation], prompt_tokens: i64) -> Result<(), RelayError> {
    if ops.is_empty() {
        return Ok(());
    }
    let scratch = doc.as_object_mut().map(|map| {
        map.insert(SCRATCH_FIELD.to_string(), json!({ "PromptTokens": prompt_tokens }));
    });
    let result = run_ops(doc, ops);
    if scratch.is_some() {
        if let Some(map) = doc.as_object_mut() {
            map.remove(SCRATCH_FIELD);
        }
    }
    result
}

fn run_ops(doc: &mut Value, ops: &[OverrideOperation]) -> Result<(), RelayError> {
    for op in ops {
        if !conditions_hold(doc, op) {
            continue;
        }
        let path = parse_path(&op.path);
        match op.mode {
            OverrideMode::Block => return Err(RelayError::blocked_by_policy()),
            OverrideMode::Pass => return Ok(()),
            OverrideMode::Delete => {
                delete_path(doc, &path);
            }
            OverrideMode::Set => {
                let exists = get_path(doc, &path).is_some_and(|v| !v.is_null());
                if !(op.keep_origin && exists) {
                    set_path(doc, &path, op.value.clone().unwrap_or(Value::Null));
                }
            }
            OverrideMode::Move => {
                let from = parse_path(op.from.as_deref().unwrap_or_default());
                let to = parse_path(op.to.as_deref().unwrap_or(&op.path));
                if let Some(value) = get_path(doc, &from).cloned() {
                    if set_path(doc, &to, value) {
                        delete_path(doc, &from);
                    }
                }
            }
            OverrideMode::Prepend | OverrideMode::Append => {
                let value = op.value.clone().unwrap_or(Value::Null);
                splice(doc, &path, value, op.keep_origin, op.mode == OverrideMode::Prepend);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ops(value: Value) -> Vec<OverrideOperation> {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn empty_list_is_identity() {
        let mut doc = json!({"model": "m", "messages": []});
        let before = doc.clone();
        apply_param_override(&mut doc, &[], 10).unwrap();
        assert_eq!(doc, before);
    }

    #[test]
    fn set_after_delete_equals_set_on_missing_path() {
        let doc = json!({"model": "m"});
        let mut a = doc.clone();
        apply_param_override(&mut a, &ops(json!([{"path": "temperature", "mode": "delete"}])), 0).unwrap();
        apply_param_override(&mut a, &ops(json!([{"path": "temperature", "mode": "set", "value": 0.2}])), 0).unwrap();
        let mut b = doc.clone();
        apply_param_override(&mut b, &ops(json!([{"path": "temperature", "mode": "set", "value": 0.2}])), 0).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn keep_origin_skips_existing() {
        let mut doc = json!({"temperature": 1.0, "top_p": null});
        let list = ops(json!([
            {"path": "temperature", "mode": "set", "value": 0.1, "keep_origin": true},
            {"path": "top_p", "mode": "set", "value": 0.5, "keep_origin": true},
            {"path": "a.b.c", "mode": "set", "value": 1}
        ]));
        apply_param_override(&mut doc, &list, 0).unwrap();
        assert_eq!(doc, json!({"temperature": 1.0, "top_p": 0.5, "a": {"b": {"c": 1}}}));
    }

    #[test]
    fn block_with_and_conditions() {
        let list = ops(json!([{
            "mode": "block",
            "conditions": [{"path": "messages.0.content", "mode": "contains", "value": "forbidden"}],
            "logic": "AND"
        }]));
        let mut doc = json!({"messages": [{"role": "user", "content": "this is forbidden"}]});
        assert_eq!(apply_param_override(&mut doc, &list, 0).unwrap_err().code, "blocked_by_policy");
        let mut doc = json!({"messages": [{"role": "user", "content": "fine"}]});
        assert!(apply_param_override(&mut doc, &list, 0).is_ok());
    }

    #[test]
    fn pass_short_circuits() {
        let list = ops(json!([
            {"mode": "pass", "conditions": [{"path": "model", "mode": "prefix", "value": "gpt"}]},
            {"path": "touched", "mode": "set", "value": true}
        ]));
        let mut doc = json!({"model": "gpt-4o"});
        apply_param_override(&mut doc, &list, 0).unwrap();
        assert!(doc.get("touched").is_none());
        let mut doc = json!({"model": "claude"});
        apply_param_override(&mut doc, &list, 0).unwrap();
        assert_eq!(doc["touched"], json!(true));
    }

    #[test]
    fn move_and_negative_indices() {
        let mut doc = json!({"max_tokens": 100, "messages": [{"content": "a"}, {"content": "b"}]});
        let list = ops(json!([
            {"mode": "move", "from": "max_tokens", "to": "max_completion_tokens"},
            {"path": "messages.-1.content", "mode": "append", "value": "!"},
            {"path": "messages", "mode": "prepend", "value": {"role": "system", "content": "s"}}
        ]));
        apply_param_override(&mut doc, &list, 0).unwrap();
        assert_eq!(doc["max_completion_tokens"], 100);
        assert!(doc.get("max_tokens").is_none());
        assert_eq!(doc["messages"][2]["content"], "b!");
        assert_eq!(doc["messages"][0]["role"], "system");
    }

    #[test]
    fn prompt_tokens_scratch_field() {
        let list = ops(json!([{
            "path": "max_tokens", "mode": "set", "value": 10,
            "conditions": [{"path": "__NewAPIInternal.PromptTokens", "mode": "gt", "value": 1000}]
        }]));
        let mut doc = json!({"model": "m"});
        apply_param_override(&mut doc, &list, 5000).unwrap();
        assert_eq!(doc, json!({"model": "m", "max_tokens": 10}));
        let mut doc = json!({"model": "m"});
        apply_param_override(&mut doc, &list, 10).unwrap();
        assert_eq!(doc, json!({"model": "m"}));
    }

    #[test]
    fn missing_keys_and_invert() {
        let cond = |pass_missing: bool, invert: bool| OverrideCondition {
            path: "nope".into(),
            mode: ConditionMode::Full,
            value: json!(1),
            invert,
            pass_missing_key: pass_missing,
        };
        let doc = json!({"x": 1});
        assert!(!condition_holds(&doc, &cond(false, false)));
        assert!(condition_holds(&doc, &cond(true, false)));
        let present = OverrideCondition { path: "x".into(), value: json!(1), invert: true, ..Default::default() };
        assert!(!condition_holds(&doc, &present));
        let lt = OverrideCondition { path: "x".into(), mode: ConditionMode::Lt, value: json!("abc"), ..Default::default() };
        assert!(!condition_holds(&doc, &lt));
    }

    #[test]
    fn object_merge_respects_keep_origin() {
        let mut doc = json!({"metadata": {"a": 1, "nested": {"x": 1}}});
        let list = ops(json!([
            {"path": "metadata", "mode": "append", "value": {"a": 2, "b": 3, "nested": {"y": 2}}, "keep_origin": true}
        ]));
        apply_param_override(&mut doc, &list, 0).unwrap();
        assert_eq!(doc["metadata"], json!({"a": 1, "b": 3, "nested": {"x": 1, "y": 2}}));
    }

    #[test]
    fn failed_set_leaves_the_document_alone() {
        let mut doc = json!({"model": "m", "messages": []});
        let before = serde_json::to_string(&doc).unwrap();
        let list = ops(json!([
            {"path": "x.0.y", "mode": "set", "value": 1},
            {"path": "messages.3.content", "mode": "set", "value": "c"},
            {"path": "model.name", "mode": "set", "value": "n"},
            {"mode": "move", "from": "model", "to": "messages.1"}
        ]));
        apply_param_override(&mut doc, &list, 0).unwrap();
        assert_eq!(serde_json::to_string(&doc).unwrap(), before);
    }

    #[test]
    fn numeric_comparisons_ignore_numeric_strings() {
        let list = ops(json!([{
            "path": "temperature", "mode": "set", "value": 0.5,
            "conditions": [{"path": "n", "mode": "gt", "value": 1}]
        }]));
        let mut doc = json!({"n": "5"});
        apply_param_override(&mut doc, &list, 0).unwrap();
        assert!(doc.get("temperature").is_none());

        let mut doc = json!({"n": 5});
        apply_param_override(&mut doc, &list, 0).unwrap();
        assert_eq!(doc["temperature"], 0.5);
    }
}
