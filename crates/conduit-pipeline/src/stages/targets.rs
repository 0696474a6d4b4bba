use conduit_types::{Issue, Result};

use crate::stage::{Batch, BatchOutput, InitContext, Stage};

/// Target discarding every record.
#[derive(Debug, Default)]
pub struct Trash;

impl Stage for Trash {
    fn init(&mut self, _ctx: &InitContext<'_>) -> Vec<Issue> {
        vec![]
    }

    fn process(&mut self, _batch: Batch) -> Result<BatchOutput> {
        Ok(BatchOutput::default())
    }
}

/// Error stage: reports the error records it receives as its output.
#[derive(Debug, Default)]
pub struct ToError;

impl Stage for ToError {
    fn init(&mut self, _ctx: &InitContext<'_>) -> Vec<Issue> {
        vec![]
    }

    fn process(&mut self, batch: Batch) -> Result<BatchOutput> {
        tracing::debug!(count = batch.records.len(), "Collected error records");
        Ok(BatchOutput::records(batch.records))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_types::Record;

    #[test]
    fn trash_discards_and_to_error_collects() {
        let batch = Batch::new(
            vec![Record::new("s::0", "s", serde_json::json!({}))],
            0,
        );
        assert!(Trash.process(batch.clone()).unwrap().records.is_empty());
        assert_eq!(ToError.process(batch).unwrap().records.len(), 1);
    }
}
