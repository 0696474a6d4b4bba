//! Pipeline configuration documents and stage descriptors.

use std::fmt;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::de::IgnoredAny;
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use uuid::Uuid;

use crate::{ConduitError, Issues, Result};

/// Newest document schema this build understands.
pub const CURRENT_SCHEMA_VERSION: i32 = 5;

/// Reserved stage configuration names carrying system-level settings.
pub const ON_RECORD_ERROR_CONFIG: &str = "stageOnRecordError";
pub const REQUIRED_FIELDS_CONFIG: &str = "stageRequiredFields";
pub const RECORD_PRECONDITIONS_CONFIG: &str = "stageRecordPreconditions";

pub type JsonMap = serde_json::Map<String, serde_json::Value>;

// ---------------------------------------------------------------------------
// ConfigEntry
// ---------------------------------------------------------------------------

/// One named configuration value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigEntry {
    pub name: String,
    #[serde(default)]
    pub value: serde_json::Value,
}

impl ConfigEntry {
    pub fn new(name: impl Into<String>, value: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

impl fmt::Display for ConfigEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.name, self.value)
    }
}

fn find_entry<'a>(entries: &'a [ConfigEntry], name: &str) -> Option<&'a serde_json::Value> {
    entries.iter().find(|e| e.name == name).map(|e| &e.value)
}

// ---------------------------------------------------------------------------
// Stage definition (what a plugin declares about itself)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageKind {
    Source,
    Processor,
    Target,
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageKind::Source => write!(f, "source"),
            StageKind::Processor => write!(f, "processor"),
            StageKind::Target => write!(f, "target"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigDefinition {
    pub name: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<serde_json::Value>,
    #[serde(default)]
    pub description: String,
}

impl ConfigDefinition {
    pub fn required(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            label: name.clone(),
            name,
            required: true,
            default_value: None,
            description: String::new(),
        }
    }

    pub fn optional(name: impl Into<String>, default_value: serde_json::Value) -> Self {
        Self {
            required: false,
            default_value: Some(default_value),
            ..Self::required(name)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageDefinition {
    pub library: String,
    pub name: String,
    pub version: String,
    pub label: String,
    pub kind: StageKind,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub config_definitions: Vec<ConfigDefinition>,
    #[serde(default)]
    pub error_stage_capable: bool,
    #[serde(default)]
    pub preconditions_capable: bool,
}

impl StageDefinition {
    pub fn new(
        library: impl Into<String>,
        name: impl Into<String>,
        version: impl Into<String>,
        kind: StageKind,
    ) -> Self {
        let name = name.into();
        Self {
            library: library.into(),
            label: name.clone(),
            name,
            version: version.into(),
            kind,
            description: String::new(),
            config_definitions: Vec::new(),
            error_stage_capable: false,
            preconditions_capable: kind != StageKind::Source,
        }
    }

    pub fn with_config(mut self, def: ConfigDefinition) -> Self {
        self.config_definitions.push(def);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn error_stage_capable(mut self) -> Self {
        self.error_stage_capable = true;
        self
    }

    pub fn config_definition(&self, name: &str) -> Option<&ConfigDefinition> {
        self.config_definitions.iter().find(|d| d.name == name)
    }

    /// `library::name@version`
    pub fn qualified_name(&self) -> String {
        format!("{}::{}@{}", self.library, self.name, self.version)
    }
}

// ---------------------------------------------------------------------------
// Stage configuration (one instance inside a pipeline document)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageConfiguration {
    pub instance_name: String,
    pub library: String,
    pub stage_name: String,
    pub stage_version: String,
    #[serde(default)]
    pub configuration: Vec<ConfigEntry>,
    #[serde(default)]
    pub ui_info: JsonMap,
    #[serde(default)]
    pub input_lanes: Vec<String>,
    #[serde(default)]
    pub output_lanes: Vec<String>,
}

impl StageConfiguration {
    pub fn new(
        instance_name: impl Into<String>,
        library: impl Into<String>,
        stage_name: impl Into<String>,
        stage_version: impl Into<String>,
    ) -> Self {
        Self {
            instance_name: instance_name.into(),
            library: library.into(),
            stage_name: stage_name.into(),
            stage_version: stage_version.into(),
            configuration: Vec::new(),
            ui_info: JsonMap::new(),
            input_lanes: Vec::new(),
            output_lanes: Vec::new(),
        }
    }

    pub fn with_config(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.configuration.push(ConfigEntry::new(name, value));
        self
    }

    pub fn config(&self, name: &str) -> Option<&serde_json::Value> {
        find_entry(&self.configuration, name)
    }

    /// Plugin-facing entries, excluding the reserved system entries.
    pub fn user_configs(&self) -> impl Iterator<Item = &ConfigEntry> {
        self.configuration
            .iter()
            .filter(|e| !StageSystemConfig::is_reserved(&e.name))
    }

    /// Parse the reserved system entries of this stage.
    pub fn system_config(&self) -> Result<StageSystemConfig> {
        StageSystemConfig::from_entries(&self.instance_name, &self.configuration)
    }
}

// ---------------------------------------------------------------------------
// StageSystemConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OnRecordError {
    Discard,
    #[default]
    ToError,
    StopPipeline,
}

/// Framework-level settings attached to every stage instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageSystemConfig {
    pub on_record_error: OnRecordError,
    pub required_fields: Vec<String>,
    pub record_preconditions: Vec<String>,
}

impl StageSystemConfig {
    pub fn is_reserved(name: &str) -> bool {
        matches!(
            name,
            ON_RECORD_ERROR_CONFIG | REQUIRED_FIELDS_CONFIG | RECORD_PRECONDITIONS_CONFIG
        )
    }

    pub fn from_entries(instance_name: &str, entries: &[ConfigEntry]) -> Result<Self> {
        let mut system = Self::default();
        let invalid = |name: &str, err: serde_json::Error| {
            ConduitError::Validation(format!(
                "stage '{instance_name}': invalid value for '{name}': {err}"
            ))
        };

        if let Some(value) = find_entry(entries, ON_RECORD_ERROR_CONFIG) {
            if !value.is_null() {
                system.on_record_error = serde_json::from_value(value.clone())
                    .map_err(|e| invalid(ON_RECORD_ERROR_CONFIG, e))?;
            }
        }
        if let Some(value) = find_entry(entries, REQUIRED_FIELDS_CONFIG) {
            if !value.is_null() {
                system.required_fields = serde_json::from_value(value.clone())
                    .map_err(|e| invalid(REQUIRED_FIELDS_CONFIG, e))?;
            }
        }
        if let Some(value) = find_entry(entries, RECORD_PRECONDITIONS_CONFIG) {
            if !value.is_null() {
                system.record_preconditions = serde_json::from_value(value.clone())
                    .map_err(|e| invalid(RECORD_PRECONDITIONS_CONFIG, e))?;
            }
        }
        Ok(system)
    }
}

// ---------------------------------------------------------------------------
// PipelineInfo: runtime metadata attached by the owner, never persisted
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineInfo {
    pub pipeline_id: String,
    pub title: String,
    pub creator: String,
    pub created: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
}

impl PipelineInfo {
    pub fn new(pipeline_id: impl Into<String>, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            pipeline_id: pipeline_id.into(),
            title: title.into(),
            creator: String::new(),
            created: now,
            last_modified: now,
        }
    }
}

// ---------------------------------------------------------------------------
// PipelineConfiguration
// ---------------------------------------------------------------------------

/// A complete pipeline document: ordered stages, optional error stage and
/// the validation state computed for it.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(from = "PipelineDocument")]
pub struct PipelineConfiguration {
    schema_version: i32,
    uuid: Uuid,
    description: String,
    configuration: Vec<ConfigEntry>,
    ui_info: JsonMap,
    stages: Vec<StageConfiguration>,
    error_stage: Option<StageConfiguration>,
    constants: JsonMap,
    info: Option<PipelineInfo>,
    issues: Option<Issues>,
    previewable: bool,
}

/// On-disk shape. The compatibility fields are accepted and dropped.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PipelineDocument {
    #[serde(default = "default_schema_version")]
    schema_version: i32,
    uuid: Uuid,
    #[serde(default)]
    description: String,
    #[serde(default)]
    configuration: Vec<ConfigEntry>,
    #[serde(default)]
    ui_info: JsonMap,
    #[serde(default)]
    stages: Vec<StageConfiguration>,
    #[serde(default)]
    error_stage: Option<StageConfiguration>,
    #[serde(default)]
    constants: JsonMap,
    #[serde(flatten)]
    _compat: DocumentCompat,
}

#[derive(Deserialize, Default)]
struct DocumentCompat {
    #[serde(default)]
    #[allow(dead_code)]
    info: Option<IgnoredAny>,
    #[serde(default)]
    #[allow(dead_code)]
    issues: Option<IgnoredAny>,
    #[serde(default)]
    #[allow(dead_code)]
    valid: Option<IgnoredAny>,
    #[serde(default)]
    #[allow(dead_code)]
    previewable: Option<IgnoredAny>,
}

fn default_schema_version() -> i32 {
    CURRENT_SCHEMA_VERSION
}

impl From<PipelineDocument> for PipelineConfiguration {
    fn from(doc: PipelineDocument) -> Self {
        Self {
            schema_version: doc.schema_version,
            uuid: doc.uuid,
            description: doc.description,
            configuration: doc.configuration,
            ui_info: doc.ui_info,
            stages: doc.stages,
            error_stage: doc.error_stage,
            constants: doc.constants,
            info: None,
            issues: None,
            previewable: false,
        }
    }
}

impl Serialize for PipelineConfiguration {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("PipelineConfiguration", 11)?;
        s.serialize_field("schemaVersion", &self.schema_version)?;
        s.serialize_field("uuid", &self.uuid)?;
        s.serialize_field("description", &self.description)?;
        s.serialize_field("configuration", &self.configuration)?;
        s.serialize_field("uiInfo", &self.ui_info)?;
        s.serialize_field("stages", &self.stages)?;
        s.serialize_field("errorStage", &self.error_stage)?;
        s.serialize_field("constants", &self.constants)?;
        s.serialize_field("issues", &self.issues)?;
        s.serialize_field("valid", &self.is_valid())?;
        s.serialize_field("previewable", &self.is_previewable())?;
        s.end()
    }
}

impl PipelineConfiguration {
    pub fn new(uuid: Uuid, stages: Vec<StageConfiguration>) -> Self {
        Self {
            schema_version: CURRENT_SCHEMA_VERSION,
            uuid,
            description: String::new(),
            configuration: Vec::new(),
            ui_info: JsonMap::new(),
            stages,
            error_stage: None,
            constants: JsonMap::new(),
            info: None,
            issues: None,
            previewable: false,
        }
    }

    // --- Loading / storing ---

    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn to_json_string_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    // --- Builders ---

    pub fn with_error_stage(mut self, stage: StageConfiguration) -> Self {
        self.error_stage = Some(stage);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_config(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.configuration.push(ConfigEntry::new(name, value));
        self
    }

    pub fn with_constant(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.constants.insert(name.into(), value);
        self
    }

    pub fn with_schema_version(mut self, version: i32) -> Self {
        self.schema_version = version;
        self
    }

    // --- Accessors ---

    pub fn schema_version(&self) -> i32 {
        self.schema_version
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn set_uuid(&mut self, uuid: Uuid) {
        self.uuid = uuid;
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn configuration(&self) -> &[ConfigEntry] {
        &self.configuration
    }

    pub fn config(&self, name: &str) -> Option<&serde_json::Value> {
        find_entry(&self.configuration, name)
    }

    pub fn ui_info(&self) -> &JsonMap {
        &self.ui_info
    }

    pub fn stages(&self) -> &[StageConfiguration] {
        &self.stages
    }

    pub fn stage(&self, instance_name: &str) -> Option<&StageConfiguration> {
        self.stages
            .iter()
            .chain(self.error_stage.iter())
            .find(|s| s.instance_name == instance_name)
    }

    pub fn error_stage(&self) -> Option<&StageConfiguration> {
        self.error_stage.as_ref()
    }

    pub fn constants(&self) -> &JsonMap {
        &self.constants
    }

    pub fn info(&self) -> Option<&PipelineInfo> {
        self.info.as_ref()
    }

    /// Attach runtime metadata. Never persisted.
    pub fn attach_info(&mut self, info: PipelineInfo) {
        self.info = Some(info);
    }

    // --- Validation state ---

    /// Replace the validation outcome. The only way issues are set.
    pub fn set_validation(&mut self, issues: Issues, previewable: bool) {
        self.issues = Some(issues);
        self.previewable = previewable;
    }

    pub fn issues(&self) -> Option<&Issues> {
        self.issues.as_ref()
    }

    pub fn is_valid(&self) -> bool {
        self.issues.as_ref().is_some_and(|i| !i.has_errors())
    }

    pub fn is_previewable(&self) -> bool {
        self.issues.is_some() && self.previewable
    }
}

impl fmt::Display for PipelineConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let configuration: Vec<String> =
            self.configuration.iter().map(ToString::to_string).collect();
        write!(
            f,
            "PipelineConfiguration[uuid='{}' valid='{}' previewable='{}' configuration='[{}]']",
            self.uuid,
            self.is_valid(),
            self.is_previewable(),
            configuration.join(", ")
        )
    }
}
