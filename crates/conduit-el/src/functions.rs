//! Built-in `ns:name(...)` functions.

use std::cmp::Ordering;
use std::collections::HashMap;

use crate::value::Value;
use crate::variables::Variables;

/// A callable function. Errors are plain messages; the evaluator wraps
/// them with the failing expression.
pub type ElFunction = fn(&[Value], &mut Variables) -> Result<Value, String>;

/// Function table keyed by `namespace:name`.
#[derive(Clone)]
pub struct FunctionTable {
    functions: HashMap<String, ElFunction>,
}

impl std::fmt::Debug for FunctionTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.functions.keys().collect();
        names.sort();
        f.debug_struct("FunctionTable").field("functions", &names).finish()
    }
}

impl Default for FunctionTable {
    fn default() -> Self {
        Self::builtin()
    }
}

impl FunctionTable {
    pub fn empty() -> Self {
        Self {
            functions: HashMap::new(),
        }
    }

    /// The standard library: `str`, `list`, `var`, `version` and `math`.
    pub fn builtin() -> Self {
        let mut table = Self::empty();
        table.register("str:contains", str_contains);
        table.register("str:startsWith", str_starts_with);
        table.register("str:endsWith", str_ends_with);
        table.register("str:matches", str_matches);
        table.register("str:toLower", str_to_lower);
        table.register("str:toUpper", str_to_upper);
        table.register("str:trim", str_trim);
        table.register("str:length", str_length);
        table.register("str:concat", str_concat);
        table.register("list:contains", list_contains);
        table.register("list:size", list_size);
        table.register("var:set", var_set);
        table.register("var:get", var_get);
        table.register("var:has", var_has);
        table.register("version:compare", version_compare);
        table.register("version:isAtLeast", version_is_at_least);
        table.register("math:max", math_max);
        table.register("math:min", math_min);
        table
    }

    pub fn register(&mut self, qualified_name: impl Into<String>, function: ElFunction) {
        self.functions.insert(qualified_name.into(), function);
    }

    pub fn get(&self, namespace: &str, name: &str) -> Option<ElFunction> {
        self.functions.get(&format!("{namespace}:{name}")).copied()
    }

    pub fn has(&self, qualified_name: &str) -> bool {
        self.functions.contains_key(qualified_name)
    }
}

// ---------------------------------------------------------------------------
// Argument helpers
// ---------------------------------------------------------------------------

fn arity(args: &[Value], expected: usize) -> Result<(), String> {
    if args.len() == expected {
        Ok(())
    } else {
        Err(format!(
            "expected {expected} argument(s), got {}",
            args.len()
        ))
    }
}

/// String view of an argument. `null` reads as the empty string.
fn text(value: &Value) -> String {
    value.to_string()
}

fn string_arg(args: &[Value], index: usize) -> Result<&str, String> {
    match &args[index] {
        Value::String(s) => Ok(s),
        other => Err(format!(
            "argument {} must be a string, got {}",
            index + 1,
            other.type_name()
        )),
    }
}

// ---------------------------------------------------------------------------
// str:
// ---------------------------------------------------------------------------

fn str_contains(args: &[Value], _: &mut Variables) -> Result<Value, String> {
    arity(args, 2)?;
    Ok(Value::Bool(text(&args[0]).contains(&text(&args[1]))))
}

fn str_starts_with(args: &[Value], _: &mut Variables) -> Result<Value, String> {
    arity(args, 2)?;
    Ok(Value::Bool(text(&args[0]).starts_with(&text(&args[1]))))
}

fn str_ends_with(args: &[Value], _: &mut Variables) -> Result<Value, String> {
    arity(args, 2)?;
    Ok(Value::Bool(text(&args[0]).ends_with(&text(&args[1]))))
}

fn str_matches(args: &[Value], _: &mut Variables) -> Result<Value, String> {
    arity(args, 2)?;
    let pattern = string_arg(args, 1)?;
    let re = regex::Regex::new(pattern).map_err(|e| format!("invalid regex '{pattern}': {e}"))?;
    Ok(Value::Bool(re.is_match(&text(&args[0]))))
}

fn str_to_lower(args: &[Value], _: &mut Variables) -> Result<Value, String> {
    arity(args, 1)?;
    Ok(Value::String(text(&args[0]).to_lowercase()))
}

fn str_to_upper(args: &[Value], _: &mut Variables) -> Result<Value, String> {
    arity(args, 1)?;
    Ok(Value::String(text(&args[0]).to_uppercase()))
}

fn str_trim(args: &[Value], _: &mut Variables) -> Result<Value, String> {
    arity(args, 1)?;
    Ok(Value::String(text(&args[0]).trim().to_string()))
}

fn str_length(args: &[Value], _: &mut Variables) -> Result<Value, String> {
    arity(args, 1)?;
    Ok(Value::Int(text(&args[0]).chars().count() as i64))
}

fn str_concat(args: &[Value], _: &mut Variables) -> Result<Value, String> {
    Ok(Value::String(args.iter().map(text).collect()))
}

// ---------------------------------------------------------------------------
// list:
// ---------------------------------------------------------------------------

fn list_contains(args: &[Value], _: &mut Variables) -> Result<Value, String> {
    arity(args, 2)?;
    match &args[0] {
        Value::List(items) => Ok(Value::Bool(items.iter().any(|i| i.loose_eq(&args[1])))),
        Value::Map(map) => Ok(Value::Bool(map.contains_key(&text(&args[1])))),
        Value::Null => Ok(Value::Bool(false)),
        other => Err(format!("expected a list, got {}", other.type_name())),
    }
}

fn list_size(args: &[Value], _: &mut Variables) -> Result<Value, String> {
    arity(args, 1)?;
    let size = match &args[0] {
        Value::List(items) => items.len(),
        Value::Map(map) => map.len(),
        Value::String(s) => s.chars().count(),
        Value::Null => 0,
        other => return Err(format!("size of {} is undefined", other.type_name())),
    };
    Ok(Value::Int(size as i64))
}

// ---------------------------------------------------------------------------
// var: free variables scoped to one rule evaluation
// ---------------------------------------------------------------------------

fn var_set(args: &[Value], vars: &mut Variables) -> Result<Value, String> {
    arity(args, 2)?;
    let name = string_arg(args, 0)?;
    vars.set_free(name, args[1].clone());
    Ok(args[1].clone())
}

fn var_get(args: &[Value], vars: &mut Variables) -> Result<Value, String> {
    arity(args, 1)?;
    let name = string_arg(args, 0)?;
    Ok(vars.get_free(name).cloned().unwrap_or_default())
}

fn var_has(args: &[Value], vars: &mut Variables) -> Result<Value, String> {
    arity(args, 1)?;
    let name = string_arg(args, 0)?;
    Ok(Value::Bool(vars.has_free(name)))
}

// ---------------------------------------------------------------------------
// version:
// ---------------------------------------------------------------------------

/// Compare dotted versions segment by segment. Numeric segments compare
/// numerically, others lexically; missing segments count as zero.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let split = |v: &str| -> Vec<String> {
        v.split(['.', '-'])
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    };
    let left = split(a);
    let right = split(b);
    for i in 0..left.len().max(right.len()) {
        let l = left.get(i).map(String::as_str).unwrap_or("0");
        let r = right.get(i).map(String::as_str).unwrap_or("0");
        let ord = match (l.parse::<u64>(), r.parse::<u64>()) {
            (Ok(x), Ok(y)) => x.cmp(&y),
            _ => l.cmp(r),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

fn version_compare(args: &[Value], _: &mut Variables) -> Result<Value, String> {
    arity(args, 2)?;
    let ord = compare_versions(&text(&args[0]), &text(&args[1]));
    Ok(Value::Int(match ord {
        Ordering::Less => -1,
        Ordering::Equal => 0,
        Ordering::Greater => 1,
    }))
}

fn version_is_at_least(args: &[Value], _: &mut Variables) -> Result<Value, String> {
    arity(args, 2)?;
    let ord = compare_versions(&text(&args[0]), &text(&args[1]));
    Ok(Value::Bool(ord != Ordering::Less))
}

// ---------------------------------------------------------------------------
// math:
// ---------------------------------------------------------------------------

fn numeric_fold(args: &[Value], pick: Ordering) -> Result<Value, String> {
    let mut best: Option<&Value> = None;
    for (i, arg) in args.iter().enumerate() {
        if !arg.is_number() {
            return Err(format!(
                "argument {} must be a number, got {}",
                i + 1,
                arg.type_name()
            ));
        }
        best = match best {
            Some(current) if current.loose_cmp(arg) != Some(pick.reverse()) => Some(current),
            _ => Some(arg),
        };
    }
    best.cloned()
        .ok_or_else(|| "expected at least one argument".to_string())
}

fn math_max(args: &[Value], _: &mut Variables) -> Result<Value, String> {
    numeric_fold(args, Ordering::Greater)
}

fn math_min(args: &[Value], _: &mut Variables) -> Result<Value, String> {
    numeric_fold(args, Ordering::Less)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(name: &str, args: &[Value]) -> Result<Value, String> {
        let (ns, n) = name.split_once(':').unwrap();
        let f = FunctionTable::builtin().get(ns, n).unwrap();
        f(args, &mut Variables::new())
    }

    #[test]
    fn string_functions() {
        assert_eq!(
            call("str:contains", &["connection timeout".into(), "timeout".into()]),
            Ok(Value::Bool(true))
        );
        assert_eq!(
            call("str:startsWith", &["JDBC_06".into(), "JDBC".into()]),
            Ok(Value::Bool(true))
        );
        assert_eq!(call("str:toUpper", &["abc".into()]), Ok("ABC".into()));
        assert_eq!(call("str:trim", &["  x ".into()]), Ok("x".into()));
        assert_eq!(call("str:length", &["héllo".into()]), Ok(Value::Int(5)));
        assert_eq!(
            call("str:concat", &["a".into(), Value::Int(1), Value::Null]),
            Ok("a1".into())
        );
    }

    #[test]
    fn regex_match_and_bad_pattern() {
        assert_eq!(
            call("str:matches", &["ORA-00942".into(), "^ORA-\\d+$".into()]),
            Ok(Value::Bool(true))
        );
        assert!(call("str:matches", &["x".into(), "(".into()]).is_err());
    }

    #[test]
    fn arity_is_checked() {
        let err = call("str:contains", &["only one".into()]).unwrap_err();
        assert!(err.contains("expected 2"));
    }

    #[test]
    fn list_functions() {
        let list = Value::from(vec!["a", "b"]);
        assert_eq!(
            call("list:contains", &[list.clone(), "b".into()]),
            Ok(Value::Bool(true))
        );
        assert_eq!(call("list:size", &[list]), Ok(Value::Int(2)));
        assert_eq!(call("list:size", &[Value::Null]), Ok(Value::Int(0)));
    }

    #[test]
    fn free_variables_round_trip() {
        let table = FunctionTable::builtin();
        let mut vars = Variables::new();
        let set = table.get("var", "set").unwrap();
        let get = table.get("var", "get").unwrap();
        let has = table.get("var", "has").unwrap();

        set(&["k".into(), Value::Int(3)], &mut vars).unwrap();
        assert_eq!(has(&["k".into()], &mut vars), Ok(Value::Bool(true)));
        assert_eq!(get(&["k".into()], &mut vars), Ok(Value::Int(3)));
        assert_eq!(get(&["missing".into()], &mut vars), Ok(Value::Null));
    }

    #[test]
    fn version_ordering() {
        assert_eq!(compare_versions("3.10.0", "3.9.1"), Ordering::Greater);
        assert_eq!(compare_versions("3.9", "3.9.0"), Ordering::Equal);
        assert_eq!(compare_versions("2.0", "10.0"), Ordering::Less);
        assert_eq!(
            call("version:isAtLeast", &["3.4.0".into(), "3.4".into()]),
            Ok(Value::Bool(true))
        );
        assert_eq!(
            call("version:compare", &["1.2".into(), "1.10".into()]),
            Ok(Value::Int(-1))
        );
    }

    #[test]
    fn math_extremes() {
        assert_eq!(
            call("math:max", &[Value::Int(1), Value::Float(2.5), Value::Int(2)]),
            Ok(Value::Float(2.5))
        );
        assert_eq!(
            call("math:min", &[Value::Int(4), Value::Int(-1)]),
            Ok(Value::Int(-1))
        );
        assert!(call("math:max", &[]).is_err());
        assert!(call("math:max", &["x".into()]).is_err());
    }
}
