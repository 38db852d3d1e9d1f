// ABOUTME: Row extractor - runs the source query and materializes a batch
// ABOUTME: Column names and order are kept exactly as the source reports them

use super::error::SyncError;
use super::record::Batch;
use super::store::SourceStore;

/// Reads one batch of execution records from the source store.
pub struct Extractor<'a, S> {
    source: &'a mut S,
}

impl<'a, S: SourceStore> Extractor<'a, S> {
    pub fn new(source: &'a mut S) -> Self {
        Self { source }
    }

    /// Run `query` and return every row it produces.
    ///
    /// A malformed query or an unusable connection fails with
    /// [`SyncError::Extraction`].
    pub async fn extract(&mut self, query: &str) -> Result<Batch, SyncError> {
        let batch = self
            .source
            .fetch(query)
            .await
            .map_err(SyncError::Extraction)?;

        tracing::info!(
            "Extracted {} records ({} columns) from source",
            batch.len(),
            batch.columns().len()
        );

        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::testing::{execution, MemorySource};

    #[tokio::test]
    async fn test_extract_returns_source_batch() {
        let mut source = MemorySource::with_records(vec![execution(1, "running"), execution(2, "done")]);

        let batch = Extractor::new(&mut source)
            .extract("SELECT * FROM executions")
            .await
            .unwrap();

        assert_eq!(batch.len(), 2);
        assert_eq!(batch.columns(), &["reference_id".to_string(), "status".to_string()]);
        assert_eq!(source.state().fetches, 1);
    }

    #[tokio::test]
    async fn test_extract_failure_is_extraction_error() {
        let mut source = MemorySource::default();
        source.state().fail_fetch = true;

        let err = Extractor::new(&mut source)
            .extract("SELEC * FROM executions")
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::Extraction(_)));
    }
}
