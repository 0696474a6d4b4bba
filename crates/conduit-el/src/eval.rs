use conduit_types::{ConduitError, Result};

use crate::ast::{BinaryOp, Expr, Template, TemplatePart, UnaryOp};
use crate::functions::{ElFunction, FunctionTable};
use crate::parser::{parse_expression, parse_template};
use crate::value::Value;
use crate::variables::Variables;

/// The expression evaluation seam used by the pipeline and the doctor.
pub trait Evaluator: Send + Sync {
    /// Evaluate a bare expression (or a fully wrapped `${expr}`) to a value.
    fn eval_value(&self, expression: &str, vars: &mut Variables) -> Result<Value>;

    /// Evaluate a predicate. Accepts a bare expression or `${expr}`.
    fn eval_bool(&self, expression: &str, vars: &mut Variables) -> Result<bool>;

    /// Render text with `${...}` interpolations. Plain text renders as itself.
    fn eval_template(&self, template: &str, vars: &mut Variables) -> Result<String>;

    /// Check that text containing `${...}` parses, without evaluating it.
    fn check_template(&self, template: &str) -> Result<()>;
}

/// Default evaluator backed by the built-in parser and function table.
#[derive(Debug, Clone, Default)]
pub struct ElEvaluator {
    functions: FunctionTable,
}

impl ElEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_functions(functions: FunctionTable) -> Self {
        Self { functions }
    }

    /// Add or replace a function, e.g. `record:value`.
    pub fn with_function(mut self, qualified_name: &str, function: ElFunction) -> Self {
        self.functions.register(qualified_name, function);
        self
    }

    pub fn functions(&self) -> &FunctionTable {
        &self.functions
    }

    /// Parse `expression` in predicate mode: bare, or a template holding
    /// exactly one `${...}`.
    fn parse_predicate(expression: &str) -> Result<Expr> {
        let trimmed = expression.trim();
        if trimmed.starts_with("${") {
            let template = parse_template(trimmed)?;
            if let Some(expr) = template.single_expr() {
                return Ok(expr.clone());
            }
        }
        parse_expression(trimmed)
    }

    pub fn evaluate(&self, expr: &Expr, vars: &mut Variables) -> std::result::Result<Value, String> {
        match expr {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Variable(path) => Ok(vars.resolve(path).unwrap_or_default()),
            Expr::Index(target, index) => {
                let target = self.evaluate(target, vars)?;
                let index = self.evaluate(index, vars)?;
                Ok(index_value(&target, &index))
            }
            Expr::Member(target, name) => {
                let target = self.evaluate(target, vars)?;
                Ok(target.member(name).cloned().unwrap_or_default())
            }
            Expr::Unary(op, operand) => {
                let value = self.evaluate(operand, vars)?;
                unary(*op, value)
            }
            Expr::Binary(BinaryOp::And, lhs, rhs) => {
                if !truthy(&self.evaluate(lhs, vars)?)? {
                    return Ok(Value::Bool(false));
                }
                Ok(Value::Bool(truthy(&self.evaluate(rhs, vars)?)?))
            }
            Expr::Binary(BinaryOp::Or, lhs, rhs) => {
                if truthy(&self.evaluate(lhs, vars)?)? {
                    return Ok(Value::Bool(true));
                }
                Ok(Value::Bool(truthy(&self.evaluate(rhs, vars)?)?))
            }
            Expr::Binary(op, lhs, rhs) => {
                let l = self.evaluate(lhs, vars)?;
                let r = self.evaluate(rhs, vars)?;
                binary(*op, &l, &r)
            }
            Expr::Ternary(cond, then, otherwise) => {
                if truthy(&self.evaluate(cond, vars)?)? {
                    self.evaluate(then, vars)
                } else {
                    self.evaluate(otherwise, vars)
                }
            }
            Expr::Call {
                namespace,
                name,
                args,
            } => {
                let function = self
                    .functions
                    .get(namespace, name)
                    .ok_or_else(|| format!("unknown function '{namespace}:{name}'"))?;
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(self.evaluate(arg, vars)?);
                }
                function(&values, vars).map_err(|e| format!("{namespace}:{name}: {e}"))
            }
        }
    }

    fn render(&self, template: &Template, vars: &mut Variables) -> std::result::Result<String, String> {
        let mut out = String::new();
        for part in &template.parts {
            match part {
                TemplatePart::Text(text) => out.push_str(text),
                TemplatePart::Expr(expr) => out.push_str(&self.evaluate(expr, vars)?.to_string()),
            }
        }
        Ok(out)
    }
}

fn expression_error(expression: &str, message: String) -> ConduitError {
    ConduitError::Expression {
        expression: expression.to_string(),
        message,
    }
}

impl Evaluator for ElEvaluator {
    fn eval_value(&self, expression: &str, vars: &mut Variables) -> Result<Value> {
        let expr = Self::parse_predicate(expression)?;
        let value = self
            .evaluate(&expr, vars)
            .map_err(|m| expression_error(expression, m))?;
        tracing::trace!(expression, %value, "evaluated expression");
        Ok(value)
    }

    fn eval_bool(&self, expression: &str, vars: &mut Variables) -> Result<bool> {
        let value = self.eval_value(expression, vars)?;
        truthy(&value).map_err(|m| expression_error(expression, m))
    }

    fn eval_template(&self, template: &str, vars: &mut Variables) -> Result<String> {
        let parsed = parse_template(template)?;
        let rendered = self
            .render(&parsed, vars)
            .map_err(|m| expression_error(template, m))?;
        tracing::trace!(template, rendered = %rendered, "rendered template");
        Ok(rendered)
    }

    fn check_template(&self, template: &str) -> Result<()> {
        parse_template(template).map(|_| ())
    }
}

// ---------------------------------------------------------------------------
// Operators
// ---------------------------------------------------------------------------

/// Boolean coercion. `null` is false and `"true"`/`"false"` strings coerce.
fn truthy(value: &Value) -> std::result::Result<bool, String> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::Null => Ok(false),
        Value::String(s) if s.eq_ignore_ascii_case("true") => Ok(true),
        Value::String(s) if s.eq_ignore_ascii_case("false") || s.is_empty() => Ok(false),
        other => Err(format!("cannot use {} '{other}' as a boolean", other.type_name())),
    }
}

fn index_value(target: &Value, index: &Value) -> Value {
    match (target, index) {
        (Value::List(items), Value::Int(i)) => usize::try_from(*i)
            .ok()
            .and_then(|i| items.get(i))
            .cloned()
            .unwrap_or_default(),
        (Value::Map(map), key) => map.get(&key.to_string()).cloned().unwrap_or_default(),
        _ => Value::Null,
    }
}

fn unary(op: UnaryOp, value: Value) -> std::result::Result<Value, String> {
    match op {
        UnaryOp::Not => Ok(Value::Bool(!truthy(&value)?)),
        UnaryOp::Empty => Ok(Value::Bool(value.is_empty())),
        UnaryOp::Neg => match value {
            Value::Int(i) => i
                .checked_neg()
                .map(Value::Int)
                .ok_or_else(|| "integer overflow".to_string()),
            Value::Float(x) => Ok(Value::Float(-x)),
            other => Err(format!("cannot negate {}", other.type_name())),
        },
    }
}

fn binary(op: BinaryOp, l: &Value, r: &Value) -> std::result::Result<Value, String> {
    match op {
        BinaryOp::Eq => Ok(Value::Bool(l.loose_eq(r))),
        BinaryOp::Ne => Ok(Value::Bool(!l.loose_eq(r))),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let ord = l.loose_cmp(r).ok_or_else(|| {
                format!(
                    "cannot compare {} with {} using '{}'",
                    l.type_name(),
                    r.type_name(),
                    op.symbol()
                )
            })?;
            Ok(Value::Bool(match op {
                BinaryOp::Lt => ord.is_lt(),
                BinaryOp::Le => ord.is_le(),
                BinaryOp::Gt => ord.is_gt(),
                _ => ord.is_ge(),
            }))
        }
        BinaryOp::Add if matches!(l, Value::String(_)) || matches!(r, Value::String(_)) => {
            Ok(Value::String(format!("{l}{r}")))
        }
        BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod => {
            arithmetic(op, l, r)
        }
        // short-circuited by the evaluator
        BinaryOp::And | BinaryOp::Or => Ok(Value::Bool(truthy(l)? && truthy(r)?)),
    }
}

fn arithmetic(op: BinaryOp, l: &Value, r: &Value) -> std::result::Result<Value, String> {
    let overflow = || "integer overflow".to_string();
    match (l, r) {
        (Value::Int(a), Value::Int(b)) => match op {
            BinaryOp::Add => a.checked_add(*b).map(Value::Int).ok_or_else(overflow),
            BinaryOp::Sub => a.checked_sub(*b).map(Value::Int).ok_or_else(overflow),
            BinaryOp::Mul => a.checked_mul(*b).map(Value::Int).ok_or_else(overflow),
            BinaryOp::Div if *b == 0 => Err("division by zero".to_string()),
            BinaryOp::Div => Ok(Value::Float(*a as f64 / *b as f64)),
            BinaryOp::Mod if *b == 0 => Err("division by zero".to_string()),
            _ => a.checked_rem(*b).map(Value::Int).ok_or_else(overflow),
        },
        (a, b) if a.is_number() && b.is_number() => {
            let (x, y) = (a.as_f64().unwrap_or_default(), b.as_f64().unwrap_or_default());
            match op {
                BinaryOp::Add => Ok(Value::Float(x + y)),
                BinaryOp::Sub => Ok(Value::Float(x - y)),
                BinaryOp::Mul => Ok(Value::Float(x * y)),
                _ if y == 0.0 => Err("division by zero".to_string()),
                BinaryOp::Div => Ok(Value::Float(x / y)),
                _ => Ok(Value::Float(x % y)),
            }
        }
        _ => Err(format!(
            "cannot apply '{}' to {} and {}",
            op.symbol(),
            l.type_name(),
            r.type_name()
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variables::ContextBuilder;
    use serde_json::json;

    fn eval(expr: &str) -> Result<Value> {
        ElEvaluator::new().eval_value(expr, &mut Variables::new())
    }

    fn eval_bool_with(expr: &str, vars: &mut Variables) -> Result<bool> {
        ElEvaluator::new().eval_bool(expr, vars)
    }

    #[test]
    fn constant_predicates() {
        let mut vars = Variables::new();
        assert!(eval_bool_with("1==1", &mut vars).unwrap());
        assert!(!eval_bool_with("false", &mut vars).unwrap());
        assert!(eval_bool_with("${1 == 1}", &mut vars).unwrap());
        assert!(eval_bool_with("  true  ", &mut vars).unwrap());
    }

    #[test]
    fn arithmetic_and_strings() {
        assert_eq!(eval("1 + 2 * 3").unwrap(), Value::Int(7));
        assert_eq!(eval("7 / 2").unwrap(), Value::Float(3.5));
        assert_eq!(eval("7 % 4").unwrap(), Value::Int(3));
        assert_eq!(eval("1 + 0.5").unwrap(), Value::Float(1.5));
        assert_eq!(eval("'a' + 1").unwrap(), Value::from("a1"));
        assert_eq!(eval("-(2 + 3)").unwrap(), Value::Int(-5));
    }

    #[test]
    fn division_by_zero_is_an_error() {
        let err = eval("1 / 0").unwrap_err();
        assert!(matches!(err, ConduitError::Expression { .. }));
        assert!(err.to_string().contains("division by zero"));
    }

    #[test]
    fn remainder_overflow_is_an_error() {
        let err = eval("(-9223372036854775807 - 1) % -1").unwrap_err();
        assert!(matches!(err, ConduitError::Expression { .. }));
        assert!(err.to_string().contains("integer overflow"));
        assert_eq!(eval("-7 % 3").unwrap(), Value::Int(-1));
    }

    #[test]
    fn undefined_variable_is_null() {
        assert_eq!(eval("nope.nothing").unwrap(), Value::Null);
        assert!(eval("empty nope").unwrap() == Value::Bool(true));
        assert!(!eval_bool_with("nope", &mut Variables::new()).unwrap());
    }

    #[test]
    fn short_circuit_skips_errors() {
        assert_eq!(eval("false && 1 / 0 > 1").unwrap(), Value::Bool(false));
        assert_eq!(eval("true || undefined:fn()").unwrap(), Value::Bool(true));
    }

    #[test]
    fn unknown_function_is_an_error() {
        let err = eval("nope:fn(1)").unwrap_err();
        assert!(err.to_string().contains("unknown function 'nope:fn'"));
    }

    #[test]
    fn non_boolean_predicate_is_an_error() {
        let err = eval_bool_with("42", &mut Variables::new()).unwrap_err();
        assert!(err.to_string().contains("as a boolean"));
    }

    #[test]
    fn variables_and_functions() {
        let mut vars = ContextBuilder::new()
            .with("issue.message", "ORA-00942: table or view does not exist")
            .with_json("stage.config", &json!({"table": "orders", "ports": [80, 443]}))
            .build();
        let el = ElEvaluator::new();
        assert!(el
            .eval_bool("str:startsWith(issue.message, 'ORA-00942')", &mut vars)
            .unwrap());
        assert!(el
            .eval_bool("stage.config.table == 'orders' and stage.config.ports[1] eq 443", &mut vars)
            .unwrap());
        assert!(el
            .eval_bool("list:contains(stage.config.ports, 80)", &mut vars)
            .unwrap());
    }

    #[test]
    fn ternary_picks_branch() {
        assert_eq!(eval("1 > 2 ? 'a' : 'b'").unwrap(), Value::from("b"));
    }

    #[test]
    fn templates_render_text_and_values() {
        let mut vars = ContextBuilder::new().with("stage.config.table", "orders").build();
        let el = ElEvaluator::new();
        assert_eq!(
            el.eval_template("Always matches", &mut vars).unwrap(),
            "Always matches"
        );
        assert_eq!(
            el.eval_template("Table '${stage.config.table}' not found", &mut vars)
                .unwrap(),
            "Table 'orders' not found"
        );
        assert_eq!(el.eval_template("${missing}", &mut vars).unwrap(), "");
    }

    #[test]
    fn template_errors_surface() {
        let el = ElEvaluator::new();
        let mut vars = Variables::new();
        assert!(matches!(
            el.eval_template("${1 +}", &mut vars),
            Err(ConduitError::Parse { .. })
        ));
        assert!(matches!(
            el.eval_template("${x:y()}", &mut vars),
            Err(ConduitError::Expression { .. })
        ));
    }

    #[test]
    fn free_variables_visible_across_expressions() {
        let el = ElEvaluator::new();
        let mut vars = Variables::new();
        assert!(el.eval_bool("var:set('seen', true)", &mut vars).unwrap());
        assert!(el.eval_bool("var:get('seen')", &mut vars).unwrap());
        vars.reset_free();
        assert!(!el.eval_bool("var:has('seen')", &mut vars).unwrap());
    }

    #[test]
    fn custom_function_registration() {
        fn answer(_: &[Value], _: &mut Variables) -> std::result::Result<Value, String> {
            Ok(Value::Int(42))
        }
        let el = ElEvaluator::new().with_function("test:answer", answer);
        assert_eq!(
            el.eval_value("test:answer()", &mut Variables::new()).unwrap(),
            Value::Int(42)
        );
    }

    #[test]
    fn check_template_validates_syntax_only() {
        let el = ElEvaluator::new();
        assert!(el.check_template("plain").is_ok());
        assert!(el.check_template("${unknown:fn()}").is_ok());
        assert!(el.check_template("${(}").is_err());
    }
}
