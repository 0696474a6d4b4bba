//! Inputs the doctor evaluates rules against: build and environment
//! information at load time, stage and failure details at match time.

use std::collections::BTreeMap;
use std::error::Error;

use conduit_el::{ContextBuilder, Value, Variables};
use conduit_types::{Issue, StageConfiguration, StageDefinition};

// ---------------------------------------------------------------------------
// DoctorContext (load time)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildInfo {
    pub version: String,
    pub git_sha: Option<String>,
    pub built_by: String,
    pub built_date: String,
}

impl BuildInfo {
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            git_sha: None,
            built_by: String::new(),
            built_date: String::new(),
        }
    }

    /// Build information of this binary.
    pub fn current() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            git_sha: option_env!("CONDUIT_GIT_SHA").map(str::to_string),
            built_by: option_env!("CONDUIT_BUILT_BY").unwrap_or_default().to_string(),
            built_date: option_env!("CONDUIT_BUILT_DATE").unwrap_or_default().to_string(),
        }
    }

    pub fn with_git_sha(mut self, sha: impl Into<String>) -> Self {
        self.git_sha = Some(sha.into());
        self
    }
}

/// What rule preconditions can see: the build, the runtime platform and a
/// snapshot of environment variables.
#[derive(Debug, Clone)]
pub struct DoctorContext {
    build: BuildInfo,
    env: BTreeMap<String, String>,
}

impl DoctorContext {
    pub fn new(build: BuildInfo) -> Self {
        Self {
            build,
            env: BTreeMap::new(),
        }
    }

    /// Current build plus the process environment.
    pub fn from_env() -> Self {
        Self {
            build: BuildInfo::current(),
            env: std::env::vars().collect(),
        }
    }

    pub fn with_env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(name.into(), value.into());
        self
    }

    pub fn build(&self) -> &BuildInfo {
        &self.build
    }

    /// Fresh variables for evaluating one rule's preconditions.
    pub fn variables(&self) -> Variables {
        ContextBuilder::new()
            .with("build.version", self.build.version.as_str())
            .with("build.git_sha", self.build.git_sha.clone())
            .with("build.built_by", self.build.built_by.as_str())
            .with("build.built_date", self.build.built_date.as_str())
            .with("runtime.os", std::env::consts::OS)
            .with("runtime.arch", std::env::consts::ARCH)
            .with_map("env", self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .build()
    }
}

impl Default for DoctorContext {
    fn default() -> Self {
        Self::new(BuildInfo::current())
    }
}

// ---------------------------------------------------------------------------
// StageContext (match time)
// ---------------------------------------------------------------------------

/// The stage a failure originated from.
#[derive(Debug, Clone, Copy)]
pub struct StageContext<'a> {
    pub definition: &'a StageDefinition,
    pub configuration: &'a StageConfiguration,
}

impl<'a> StageContext<'a> {
    pub fn new(definition: &'a StageDefinition, configuration: &'a StageConfiguration) -> Self {
        Self {
            definition,
            configuration,
        }
    }

    /// Bind `stage.config` and `stage.definition`.
    pub(crate) fn seed(&self, builder: ContextBuilder) -> ContextBuilder {
        let config: BTreeMap<String, Value> = self
            .configuration
            .configuration
            .iter()
            .map(|entry| (entry.name.clone(), Value::from(&entry.value)))
            .collect();
        let definition = self.definition;
        builder
            .with("stage.config", Value::Map(config))
            .with("stage.instance_name", self.configuration.instance_name.as_str())
            .with_map(
                "stage.definition",
                [
                    ("library", definition.library.clone()),
                    ("name", definition.name.clone()),
                    ("version", definition.version.clone()),
                    ("label", definition.label.clone()),
                    ("kind", definition.kind.to_string()),
                    ("description", definition.description.clone()),
                ],
            )
    }
}

// ---------------------------------------------------------------------------
// Failure descriptions
// ---------------------------------------------------------------------------

/// An error code with a message template using `{}` placeholders.
pub trait ErrorCode {
    fn code(&self) -> &str;

    fn message(&self) -> &str;

    /// The message with each `{}` replaced by the next argument.
    fn format_message(&self, args: &[Value]) -> String {
        let mut args = args.iter();
        let mut out = String::new();
        let mut rest = self.message();
        while let Some(pos) = rest.find("{}") {
            out.push_str(&rest[..pos]);
            match args.next() {
                Some(arg) => out.push_str(&arg.to_string()),
                None => out.push_str("{}"),
            }
            rest = &rest[pos + 2..];
        }
        out.push_str(rest);
        out
    }
}

impl ErrorCode for Issue {
    fn code(&self) -> &str {
        &self.code
    }

    fn message(&self) -> &str {
        &self.message
    }
}

/// The failure being diagnosed, as seen by rule expressions under `issue`.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct FailureDescription {
    kind: &'static str,
    message: String,
    error_code: Option<String>,
    args: Vec<Value>,
    chain: Vec<String>,
}

impl FailureDescription {
    pub(crate) fn from_error(error: &(dyn Error + 'static)) -> Self {
        let mut chain = Vec::new();
        let mut source = error.source();
        while let Some(cause) = source {
            chain.push(cause.to_string());
            source = cause.source();
        }
        Self {
            kind: "error",
            message: error.to_string(),
            error_code: None,
            args: Vec::new(),
            chain,
        }
    }

    pub(crate) fn from_code(code: &dyn ErrorCode, args: &[Value]) -> Self {
        Self {
            kind: "error_code",
            message: code.format_message(args),
            error_code: Some(code.code().to_string()),
            args: args.to_vec(),
            chain: Vec::new(),
        }
    }

    pub(crate) fn from_message(message: &str) -> Self {
        Self {
            kind: "message",
            message: message.to_string(),
            error_code: None,
            args: Vec::new(),
            chain: Vec::new(),
        }
    }

    pub(crate) fn seed(&self, builder: ContextBuilder) -> ContextBuilder {
        let mut issue = BTreeMap::new();
        issue.insert("kind".to_string(), Value::from(self.kind));
        issue.insert("message".to_string(), Value::from(self.message.as_str()));
        issue.insert("error_code".to_string(), Value::from(self.error_code.clone()));
        issue.insert("args".to_string(), Value::List(self.args.clone()));
        issue.insert("chain".to_string(), Value::from(self.chain.clone()));
        builder.with("issue", Value::Map(issue))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_types::{ConduitError, StageKind};
    use serde_json::json;

    #[test]
    fn doctor_context_exposes_build_and_env() {
        let ctx = DoctorContext::new(BuildInfo::new("5.1.0").with_git_sha("abc123"))
            .with_env("JAVA_HOME", "/opt/java");
        let vars = ctx.variables();
        assert_eq!(vars.get("build.version"), Some(&Value::from("5.1.0")));
        assert_eq!(vars.get("build.git_sha"), Some(&Value::from("abc123")));
        assert_eq!(
            vars.resolve(&["env".to_string(), "JAVA_HOME".to_string()]),
            Some(Value::from("/opt/java"))
        );
        assert!(vars.contains("runtime.os"));
    }

    #[test]
    fn error_code_formats_arguments_in_order() {
        let issue = Issue::pipeline("JDBC_00", "Cannot connect to {} as {}");
        assert_eq!(
            issue.format_message(&[Value::from("db"), Value::from("admin")]),
            "Cannot connect to db as admin"
        );
        assert_eq!(issue.format_message(&[]), "Cannot connect to {} as {}");
    }

    #[test]
    fn failure_from_error_keeps_source_chain() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "no such table");
        let err = ConduitError::from(io);
        let failure = FailureDescription::from_error(&err);
        assert_eq!(failure.kind, "error");
        assert_eq!(failure.chain, vec!["no such table".to_string()]);
    }

    #[test]
    fn stage_context_binds_config_and_definition() {
        let definition = StageDefinition::new("jdbc", "query", "3", StageKind::Source);
        let configuration = StageConfiguration::new("q1", "jdbc", "query", "3")
            .with_config("table", json!("orders"));
        let vars = StageContext::new(&definition, &configuration)
            .seed(ContextBuilder::new())
            .build();
        let path = |p: &str| p.split('.').map(str::to_string).collect::<Vec<_>>();
        assert_eq!(vars.resolve(&path("stage.config.table")), Some(Value::from("orders")));
        assert_eq!(vars.resolve(&path("stage.definition.kind")), Some(Value::from("source")));
    }
}
