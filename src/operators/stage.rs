use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use super::{TableDescriptor, TableSource, prepare_table};
use crate::sql::FormatOptions;
use crate::{ObjectLocation, Operator, OperatorContext, OperatorError, Warehouse};

/// Bulk-loads a delimited object into a staging table.
pub struct StageOperator {
    warehouse: Arc<dyn Warehouse>,
    table: TableDescriptor,
    location: ObjectLocation,
    format: FormatOptions,
}

impl StageOperator {
    /// Fails if the descriptor's source is not an object location.
    pub fn new(
        warehouse: Arc<dyn Warehouse>,
        table: TableDescriptor,
        format: FormatOptions,
    ) -> Result<Self, OperatorError> {
        let location = match &table.source {
            TableSource::Object(location) => location.clone(),
            TableSource::Select(_) => {
                return Err(OperatorError::InvalidStatement(format!(
                    "stage table {} needs an object source",
                    table.definition.name
                )));
            }
        };
        Ok(Self {
            warehouse,
            table,
            location,
            format,
        })
    }

    pub fn table(&self) -> &TableDescriptor {
        &self.table
    }
}

#[async_trait]
impl Operator for StageOperator {
    fn kind(&self) -> &'static str {
        "stage"
    }

    async fn execute(&self, ctx: &OperatorContext) -> Result<(), OperatorError> {
        prepare_table(self.warehouse.as_ref(), &self.table, ctx).await?;

        let name = &self.table.definition.name;
        info!(node = %ctx.node_id, table = %name, source = %self.location, "copying staged data");
        self.warehouse
            .bulk_load(name, &self.location, &self.format, &ctx.credentials)
            .await?;

        info!(node = %ctx.node_id, table = %name, "staging complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operators::test_support::{ctx, table};
    use crate::sql::SelectStatement;
    use crate::{MemoryObjectStore, MemoryWarehouse, WarehouseError};

    async fn fixture() -> (Arc<MemoryWarehouse>, StageOperator) {
        let store = Arc::new(MemoryObjectStore::new());
        let loc = ObjectLocation::new("dend-capstone-bucket", "Production_Crops_E_Flags.csv");
        store
            .put(&loc, "Flag,Flags\nA,Aggregate\nF,FAO estimate\nM,Missing value\n")
            .await;
        let wh = Arc::new(MemoryWarehouse::new().with_object_store(store));
        let op = StageOperator::new(
            wh.clone(),
            TableDescriptor::new(
                table("stage_flag", &["flag_code", "flag_description"]),
                TableSource::Object(loc),
            ),
            FormatOptions::default(),
        )
        .unwrap();
        (wh, op)
    }

    #[tokio::test]
    async fn stages_rows() {
        let (wh, op) = fixture().await;
        op.execute(&ctx("stage_flag")).await.unwrap();
        assert_eq!(wh.table("stage_flag").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn second_run_yields_same_contents() {
        let (wh, op) = fixture().await;
        op.execute(&ctx("stage_flag")).await.unwrap();
        let once = wh.table("stage_flag").await.unwrap();
        op.execute(&ctx("stage_flag")).await.unwrap();
        assert_eq!(wh.table("stage_flag").await.unwrap(), once);
    }

    #[tokio::test]
    async fn retry_after_failed_copy_converges() {
        let (wh, op) = fixture().await;
        op.execute(&ctx("stage_flag")).await.unwrap();
        let expected = wh.table("stage_flag").await.unwrap();

        // create and truncate go through, the copy fails
        wh.fail_nth(3, WarehouseError::Connection("reset".into())).await;
        let err = op.execute(&ctx("stage_flag")).await.unwrap_err();
        assert_eq!(err, OperatorError::WarehouseConnection("reset".into()));
        assert!(wh.table("stage_flag").await.unwrap().is_empty());

        op.execute(&ctx("stage_flag")).await.unwrap();
        assert_eq!(wh.table("stage_flag").await.unwrap(), expected);
    }

    #[test]
    fn rejects_select_source() {
        let res = StageOperator::new(
            Arc::new(MemoryWarehouse::new()),
            TableDescriptor::new(
                table("stage_flag", &["flag_code"]),
                TableSource::Select(SelectStatement::new("SELECT 1")),
            ),
            FormatOptions::default(),
        );
        assert!(matches!(res, Err(OperatorError::InvalidStatement(_))));
    }
}
