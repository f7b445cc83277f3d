use std::collections::{BTreeMap, HashSet};

use crate::controller::error::RelayError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum MatchKind {
    Exact,
    Prefix,
    Suffix,
    Contains,
}

fn classify(pattern: &str) -> (MatchKind, &str) {
    let starts = pattern.starts_with('*');
    let ends = pattern.ends_with('*') && pattern.len() > 1;
    match (starts, ends) {
        (true, true) => (MatchKind::Contains, &pattern[1..pattern.len() - 1]),
        (false, true) => (MatchKind::Prefix, &pattern[..pattern.len() - 1]),
        (true, false) => (MatchKind::Suffix, &pattern[1..]),
        (false, false) => (MatchKind::Exact, pattern),
    }
}

/// Finds the best rule for `model` and returns the rewritten name.
fn map_once(mapping: &BTreeMap<String, String>, model: &str) -> Option<String> {
    let mut best: Option<(MatchKind, usize, &str, String)> = None;
    for (pattern, target) in mapping {
        let (kind, literal) = classify(pattern);
        let capture = match kind {
            MatchKind::Exact if model == literal => Some(String::new()),
            MatchKind::Prefix => model.strip_prefix(literal).map(str::to_string),
            MatchKind::Suffix => model.strip_suffix(literal).map(str::to_string),
            MatchKind::Contains if !literal.is_empty() && model.contains(literal) => Some(model.to_string()),
            _ => None,
        };
        let Some(capture) = capture else { continue };
        // Stronger kind first, then the longer literal. BTreeMap order breaks ties.
        let better = match &best {
            None => true,
            Some((best_kind, best_len, _, _)) => (kind, std::cmp::Reverse(literal.len())) < (*best_kind, std::cmp::Reverse(*best_len)),
        };
        if better {
            best = Some((kind, literal.len(), target.as_str(), capture));
        }
    }
    best.map(|(kind, _, target, capture)| {
        if kind == MatchKind::Exact || !target.contains('*') {
            target.to_string()
        } else {
            target.replacen('*', &capture, 1)
        }
    })
}

/// Resolves the upstream model name through a possibly chained mapping.
pub fn apply_model_mapping(mapping: &BTreeMap<String, String>, origin_model: &str) -> Result<String, RelayError> {
    if mapping.is_empty() {
        return Ok(origin_model.to_string());
    }
    let mut visited = HashSet::new();
    let mut current = origin_model.to_string();
    visited.insert(current.clone());
    while let Some(next) = map_once(mapping, &current) {
        if next == current {
            break;
        }
        if !visited.insert(next.clone()) {
            return Err(RelayError::mapping_cycle(origin_model));
        }
        current = next;
    }
    Ok(current)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn wildcard_target_takes_capture() {
        let m = mapping(&[("Pro/*", "*")]);
        assert_eq!(apply_model_mapping(&m, "Pro/deepseek-ai/DeepSeek-R1").unwrap(), "deepseek-ai/DeepSeek-R1");
        assert_eq!(apply_model_mapping(&m, "deepseek-chat").unwrap(), "deepseek-chat");
    }

    #[test]
    fn precedence_exact_prefix_suffix_contains() {
        let m = mapping(&[
            ("gpt-4o", "exact"),
            ("gpt-*", "prefix"),
            ("*-4o", "suffix"),
            ("*pt*", "contains"),
        ]);
        assert_eq!(apply_model_mapping(&m, "gpt-4o").unwrap(), "exact");
        assert_eq!(apply_model_mapping(&m, "gpt-5").unwrap(), "prefix");
        assert_eq!(apply_model_mapping(&m, "chat-4o").unwrap(), "suffix");
        assert_eq!(apply_model_mapping(&m, "opt-x").unwrap(), "contains");
    }

    #[test]
    fn suffix_capture_and_chains() {
        let m = mapping(&[("*-latest", "*-2025"), ("claude-2025", "claude-sonnet-4-5")]);
        assert_eq!(apply_model_mapping(&m, "claude-latest").unwrap(), "claude-sonnet-4-5");
    }

    #[test]
    fn cycles_are_rejected_and_self_maps_terminate() {
        let m = mapping(&[("a", "b"), ("b", "a")]);
        assert_eq!(apply_model_mapping(&m, "a").unwrap_err().code, "model_mapping_cycle");
        let m = mapping(&[("a", "a")]);
        assert_eq!(apply_model_mapping(&m, "a").unwrap(), "a");
    }

    #[test]
    fn mapping_is_deterministic() {
        let m = mapping(&[("gpt-*", "x-*"), ("gpt-4*", "y-*")]);
        for _ in 0..10 {
            assert_eq!(apply_model_mapping(&m, "gpt-4o").unwrap(), "y-o");
        }
    }
}
