//! Reading rule declarations from JSON.
//!
//! A rule file holds either an array of rules or an object with a `rules`
//! array. A directory is read file by file, `*.json` only, sorted by name.

use std::path::Path;

use conduit_types::{ConduitError, Result};

use crate::rule::RuleDefinition;

pub fn load_rules_from_str(json: &str) -> Result<Vec<RuleDefinition>> {
    load_rules_from_str_named(json, "<inline>")
}

/// Load a rule file, or every rule file in a directory.
pub fn load_rules_from_path(path: impl AsRef<Path>) -> Result<Vec<RuleDefinition>> {
    let path = path.as_ref();
    if path.is_dir() {
        return load_rules_from_dir(path);
    }
    let text = std::fs::read_to_string(path)?;
    load_rules_from_str_named(&text, &path.display().to_string())
}

pub fn load_rules_from_dir(dir: impl AsRef<Path>) -> Result<Vec<RuleDefinition>> {
    let mut files: Vec<_> = std::fs::read_dir(dir.as_ref())?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == "json"))
        .collect();
    files.sort();

    let mut rules = Vec::new();
    for file in files {
        let loaded = load_rules_from_path(&file)?;
        tracing::debug!(file = %file.display(), count = loaded.len(), "Loaded rule file");
        rules.extend(loaded);
    }
    Ok(rules)
}

fn load_rules_from_str_named(json: &str, source: &str) -> Result<Vec<RuleDefinition>> {
    let invalid = |message: String| ConduitError::Rule {
        rule: source.to_string(),
        message,
    };

    let document: serde_json::Value = serde_json::from_str(json).map_err(|e| invalid(e.to_string()))?;
    let list = match document {
        serde_json::Value::Array(_) => document,
        serde_json::Value::Object(mut map) => map
            .remove("rules")
            .ok_or_else(|| invalid("expected an array of rules or an object with 'rules'".into()))?,
        _ => return Err(invalid("expected an array of rules or an object with 'rules'".into())),
    };

    let rules: Vec<RuleDefinition> = serde_json::from_value(list).map_err(|e| invalid(e.to_string()))?;
    if let Some(index) = rules.iter().position(|r| r.uuid.trim().is_empty()) {
        return Err(invalid(format!("rule #{index} has an empty uuid")));
    }
    Ok(rules)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::EntityScope;

    const RULES: &str = r#"[
        {"uuid": "a", "entity": "stage", "conditions": ["true"], "message": {"summary": "A"}},
        {"uuid": "b", "entity": "rest", "message": {"summary": "B", "description": "d"}}
    ]"#;

    #[test]
    fn loads_array_form() {
        let rules = load_rules_from_str(RULES).unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[1].entity, EntityScope::Rest);
    }

    #[test]
    fn loads_object_form() {
        let rules = load_rules_from_str(&format!(r#"{{"rules": {RULES}}}"#)).unwrap();
        assert_eq!(rules[0].conditions, vec!["true"]);
    }

    #[test]
    fn rejects_malformed_documents() {
        assert!(matches!(load_rules_from_str("42"), Err(ConduitError::Rule { .. })));
        assert!(matches!(load_rules_from_str("{\"other\": []}"), Err(ConduitError::Rule { .. })));
        let err = load_rules_from_str(r#"[{"uuid": " ", "entity": "stage", "message": {"summary": "s"}}]"#)
            .unwrap_err();
        assert!(err.to_string().contains("empty uuid"));
    }

    #[test]
    fn directory_files_load_sorted_by_name() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("b.json"),
            r#"[{"uuid": "second", "entity": "stage", "message": {"summary": "2"}}]"#,
        )
        .unwrap();
        std::fs::write(
            dir.path().join("a.json"),
            r#"{"rules": [{"uuid": "first", "entity": "stage", "message": {"summary": "1"}}]}"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let rules = load_rules_from_path(dir.path()).unwrap();
        let ids: Vec<&str> = rules.iter().map(|r| r.uuid.as_str()).collect();
        assert_eq!(ids, vec!["first", "second"]);
    }
}
