use std::collections::BTreeMap;

use crate::value::Value;

/// Variable bindings visible to one evaluation.
///
/// Named values are seeded up front. The free-variable bucket holds values
/// written by expressions themselves (`var:set`) and is cleared with
/// [`Variables::reset_free`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Variables {
    values: BTreeMap<String, Value>,
    free: BTreeMap<String, Value>,
}

impl Variables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn set_free(&mut self, name: impl Into<String>, value: Value) {
        self.free.insert(name.into(), value);
    }

    pub fn get_free(&self, name: &str) -> Option<&Value> {
        self.free.get(name)
    }

    pub fn has_free(&self, name: &str) -> bool {
        self.free.contains_key(name)
    }

    pub fn reset_free(&mut self) {
        self.free.clear();
    }

    /// Resolve a dotted path. The longest bound prefix wins and the
    /// remaining segments descend into map members.
    ///
    /// With `stage.config` bound to `{table: "t"}`, the path
    /// `stage.config.table` resolves to `"t"`.
    pub fn resolve(&self, path: &[String]) -> Option<Value> {
        for split in (1..=path.len()).rev() {
            let key = path[..split].join(".");
            if let Some(root) = self.values.get(&key) {
                let mut current = root;
                for segment in &path[split..] {
                    current = current.member(segment)?;
                }
                return Some(current.clone());
            }
        }
        None
    }
}

/// Explicit seeding of evaluation variables.
///
/// ```
/// use conduit_el::{ContextBuilder, Value};
///
/// let vars = ContextBuilder::new()
///     .with("build.version", "1.2.0")
///     .with_json("stage.config", &serde_json::json!({"table": "orders"}))
///     .build();
/// assert_eq!(vars.get("build.version"), Some(&Value::from("1.2.0")));
/// ```
#[derive(Debug, Clone, Default)]
pub struct ContextBuilder {
    vars: Variables,
}

impl ContextBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing set of variables.
    pub fn from_variables(vars: Variables) -> Self {
        Self { vars }
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.vars.set(name, value);
        self
    }

    pub fn with_json(self, name: impl Into<String>, value: &serde_json::Value) -> Self {
        self.with(name, Value::from(value))
    }

    /// Bind `name` to a map built from string pairs.
    pub fn with_map<K, V>(mut self, name: impl Into<String>, entries: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
    {
        let map: BTreeMap<String, Value> = entries
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        self.vars.set(name, Value::Map(map));
        self
    }

    pub fn build(self) -> Variables {
        self.vars
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn path(p: &str) -> Vec<String> {
        p.split('.').map(str::to_string).collect()
    }

    #[test]
    fn resolve_flat_dotted_name() {
        let vars = ContextBuilder::new().with("build.version", "2.0").build();
        assert_eq!(vars.resolve(&path("build.version")), Some(Value::from("2.0")));
        assert_eq!(vars.resolve(&path("build")), None);
    }

    #[test]
    fn resolve_descends_into_maps() {
        let vars = ContextBuilder::new()
            .with_json("stage.config", &json!({"table": "orders", "nested": {"x": 1}}))
            .build();
        assert_eq!(
            vars.resolve(&path("stage.config.table")),
            Some(Value::from("orders"))
        );
        assert_eq!(
            vars.resolve(&path("stage.config.nested.x")),
            Some(Value::Int(1))
        );
        assert_eq!(vars.resolve(&path("stage.config.missing")), None);
    }

    #[test]
    fn longest_prefix_wins() {
        let vars = ContextBuilder::new()
            .with_map("env", [("HOME", "/root")])
            .with("env.HOME", "/override")
            .build();
        assert_eq!(vars.resolve(&path("env.HOME")), Some(Value::from("/override")));
    }

    #[test]
    fn free_bucket_resets_independently() {
        let mut vars = ContextBuilder::new().with("a", 1i64).build();
        vars.set_free("x", Value::Bool(true));
        assert!(vars.has_free("x"));

        vars.reset_free();
        assert!(!vars.has_free("x"));
        assert!(vars.contains("a"));
    }
}
