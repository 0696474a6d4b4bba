//! Built-in development stages (`dev` library).

mod processors;
mod sources;
mod targets;

use conduit_types::{ConfigDefinition, StageDefinition, StageKind};
use serde_json::json;

use crate::library::StageLibrary;

pub use processors::{ExpressionFilter, FieldRenamer, Identity};
pub use sources::RawSource;
pub use targets::{ToError, Trash};

pub const DEV_LIBRARY: &str = "dev";
pub const DEV_VERSION: &str = "1";

fn dev(name: &str, kind: StageKind) -> StageDefinition {
    StageDefinition::new(DEV_LIBRARY, name, DEV_VERSION, kind)
}

/// Library holding every `dev` stage.
pub fn dev_library() -> StageLibrary {
    let mut library = StageLibrary::new();
    register_dev_stages(&mut library);
    library
}

pub fn register_dev_stages(library: &mut StageLibrary) {
    library.register(
        dev("raw_source", StageKind::Source)
            .with_description("Emits the JSON records listed in its configuration")
            .with_config(ConfigDefinition::required("records")),
        |_| Ok(Box::new(RawSource::default())),
    );
    library.register(
        dev("identity", StageKind::Processor).with_description("Passes records through"),
        |_| Ok(Box::new(Identity)),
    );
    library.register(
        dev("expression_filter", StageKind::Processor)
            .with_description("Keeps records matching a condition; others become error records")
            .with_config(ConfigDefinition::required("condition")),
        |_| Ok(Box::new(ExpressionFilter::default())),
    );
    library.register(
        dev("field_renamer", StageKind::Processor)
            .with_description("Renames top-level record fields")
            .with_config(ConfigDefinition::optional("renames", json!({}))),
        |_| Ok(Box::new(FieldRenamer::default())),
    );
    library.register(
        dev("trash", StageKind::Target).with_description("Discards every record"),
        |_| Ok(Box::new(Trash)),
    );
    library.register(
        dev("to_error", StageKind::Target)
            .with_description("Collects error records")
            .error_stage_capable(),
        |_| Ok(Box::new(ToError)),
    );
}
