//! Built-in pipeline operators.
//!
//! Every operator here is idempotent: table creation is create-if-absent,
//! truncation is safe on empty tables, and object writes overwrite.

mod extract;
mod load;
mod quality;
mod stage;

pub use extract::{ExtractOperator, Transform};
pub use load::LoadOperator;
pub use quality::{DataQualityGate, QualityCheck};
pub use stage::StageOperator;

use async_trait::async_trait;
use tracing::info;

use crate::sql::{SelectStatement, Statement, TableDefinition};
use crate::{ObjectLocation, Operator, OperatorContext, OperatorError, Warehouse};

/// Where a table's rows come from.
#[derive(Debug, Clone, PartialEq)]
pub enum TableSource {
    Object(ObjectLocation),
    Select(SelectStatement),
}

/// Desired end state of one warehouse table.
#[derive(Debug, Clone, PartialEq)]
pub struct TableDescriptor {
    pub definition: TableDefinition,
    pub truncate: bool,
    pub source: TableSource,
}

impl TableDescriptor {
    pub fn new(definition: TableDefinition, source: TableSource) -> Self {
        Self {
            definition,
            truncate: true,
            source,
        }
    }

    /// Keep existing rows; repeated runs then append.
    pub fn append(mut self) -> Self {
        self.truncate = false;
        self
    }
}

/// Creates the table if absent, then truncates it when requested.
async fn prepare_table(
    warehouse: &dyn Warehouse,
    table: &TableDescriptor,
    ctx: &OperatorContext,
) -> Result<(), OperatorError> {
    let name = &table.definition.name;
    info!(node = %ctx.node_id, table = %name, "creating table if not exists");
    warehouse
        .execute(&Statement::create_table(&table.definition))
        .await?;

    if table.truncate {
        info!(node = %ctx.node_id, table = %name, "truncating table");
        warehouse.execute(&Statement::truncate(name)).await?;
    }
    Ok(())
}

/// Does nothing. Marks the start or end of a pipeline.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopOperator;

#[async_trait]
impl Operator for NoopOperator {
    fn kind(&self) -> &'static str {
        "noop"
    }

    async fn execute(&self, _ctx: &OperatorContext) -> Result<(), OperatorError> {
        Ok(())
    }
}
