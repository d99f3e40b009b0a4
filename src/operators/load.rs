use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use super::{TableDescriptor, TableSource, prepare_table};
use crate::sql::{SelectStatement, Statement};
use crate::{Operator, OperatorContext, OperatorError, Warehouse};

/// Fills a fact or dimension table from a SELECT over staged tables.
///
/// With `truncate` set, every attempt starts from an empty table, which is
/// what makes a retry after a partial insert converge.
pub struct LoadOperator {
    warehouse: Arc<dyn Warehouse>,
    table: TableDescriptor,
    select: SelectStatement,
}

impl LoadOperator {
    pub fn new(
        warehouse: Arc<dyn Warehouse>,
        table: TableDescriptor,
    ) -> Result<Self, OperatorError> {
        let select = match &table.source {
            TableSource::Select(select) => select.clone(),
            TableSource::Object(_) => {
                return Err(OperatorError::InvalidStatement(format!(
                    "load table {} needs a select source",
                    table.definition.name
                )));
            }
        };
        Ok(Self {
            warehouse,
            table,
            select,
        })
    }
}

#[async_trait]
impl Operator for LoadOperator {
    fn kind(&self) -> &'static str {
        "load"
    }

    async fn execute(&self, ctx: &OperatorContext) -> Result<(), OperatorError> {
        prepare_table(self.warehouse.as_ref(), &self.table, ctx).await?;

        let name = &self.table.definition.name;
        info!(node = %ctx.node_id, table = %name, "loading table");
        self.warehouse
            .execute(&Statement::insert_select(name, &self.select))
            .await?;

        info!(node = %ctx.node_id, table = %name, "load complete");
        Ok(())
    }
}
