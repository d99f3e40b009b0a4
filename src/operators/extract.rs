use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::{ObjectLocation, ObjectStore, Operator, OperatorContext, OperatorError};

/// Pure transformation from a raw object to the artifact that gets written.
pub type Transform = Arc<dyn Fn(&[u8]) -> Result<Vec<u8>, OperatorError> + Send + Sync>;

/// Reads a raw object, transforms it and writes the artifact back with
/// overwrite semantics, so a retry replaces rather than appends.
pub struct ExtractOperator {
    store: Arc<dyn ObjectStore>,
    source: ObjectLocation,
    destination: ObjectLocation,
    transform: Transform,
}

impl ExtractOperator {
    pub fn new<F>(
        store: Arc<dyn ObjectStore>,
        source: ObjectLocation,
        destination: ObjectLocation,
        transform: F,
    ) -> Self
    where
        F: Fn(&[u8]) -> Result<Vec<u8>, OperatorError> + Send + Sync + 'static,
    {
        Self {
            store,
            source,
            destination,
            transform: Arc::new(transform),
        }
    }
}

#[async_trait]
impl Operator for ExtractOperator {
    fn kind(&self) -> &'static str {
        "extract"
    }

    async fn execute(&self, ctx: &OperatorContext) -> Result<(), OperatorError> {
        info!(node = %ctx.node_id, source = %self.source, "downloading source object");
        let raw = self
            .store
            .read(&self.source.bucket, &self.source.key)
            .await?;

        let artifact = (self.transform)(&raw)?;

        info!(
            node = %ctx.node_id,
            destination = %self.destination,
            bytes = artifact.len(),
            "uploading transformed artifact"
        );
        self.store
            .write(&self.destination.bucket, &self.destination.key, artifact, true)
            .await?;
        Ok(())
    }
}
