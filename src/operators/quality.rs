use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::sql::{Identifier, SelectStatement, SqlError, SqlValue, Statement};
use crate::{Operator, OperatorContext, OperatorError, Row, Warehouse};

type QueryBuilder = Arc<dyn Fn(&Identifier) -> Statement + Send + Sync>;
type Measure = Arc<dyn Fn(&[Row]) -> Option<i64> + Send + Sync>;
type Predicate = Arc<dyn Fn(i64) -> bool + Send + Sync>;

/// An assertion over a value measured from each gated table.
///
/// The check builds a statement per table, reduces the returned rows to a
/// single measurement and tests it against a predicate. By default the
/// measurement is the first column of the first row.
#[derive(Clone)]
pub struct QualityCheck {
    description: String,
    query: QueryBuilder,
    measure: Measure,
    predicate: Predicate,
}

impl QualityCheck {
    pub fn new<Q, P>(description: impl Into<String>, query: Q, predicate: P) -> Self
    where
        Q: Fn(&Identifier) -> Statement + Send + Sync + 'static,
        P: Fn(i64) -> bool + Send + Sync + 'static,
    {
        Self {
            description: description.into(),
            query: Arc::new(query),
            measure: Arc::new(first_cell),
            predicate: Arc::new(predicate),
        }
    }

    /// Replaces how the returned rows are reduced to a measurement.
    pub fn with_measure<M>(mut self, measure: M) -> Self
    where
        M: Fn(&[Row]) -> Option<i64> + Send + Sync + 'static,
    {
        self.measure = Arc::new(measure);
        self
    }

    /// A predicate over `COUNT(*)` of the table.
    pub fn row_count<P>(description: impl Into<String>, predicate: P) -> Self
    where
        P: Fn(i64) -> bool + Send + Sync + 'static,
    {
        Self::new(description, Statement::count_rows, predicate)
    }

    pub fn row_count_greater_than(min: i64) -> Self {
        Self::row_count(format!("row count > {min}"), move |count| count > min)
    }

    /// Fails when any row has a NULL in `column`.
    pub fn no_nulls_in(column: &str) -> Result<Self, SqlError> {
        let column = Identifier::parse(column)?;
        let description = format!("no NULL {column}");
        Ok(Self::new(
            description,
            move |table| {
                let select = SelectStatement::new(format!(
                    "SELECT COUNT(*) FROM {} WHERE {} IS NULL",
                    table.quoted(),
                    column.quoted()
                ))
                .from_table(table.clone());
                Statement::select(&select)
            },
            |nulls| nulls == 0,
        ))
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn statement(&self, table: &Identifier) -> Statement {
        (self.query)(table)
    }

    pub fn measure(&self, rows: &[Row]) -> Option<i64> {
        (self.measure)(rows)
    }

    pub fn holds(&self, measured: i64) -> bool {
        (self.predicate)(measured)
    }
}

fn first_cell(rows: &[Row]) -> Option<i64> {
    rows.first()
        .and_then(|row| row.first())
        .and_then(SqlValue::as_i64)
}

impl Default for QualityCheck {
    fn default() -> Self {
        Self::row_count_greater_than(0)
    }
}

impl fmt::Debug for QualityCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("QualityCheck").field(&self.description).finish()
    }
}

/// Blocks downstream work until every table passes `check`.
///
/// A failing check surfaces as [`OperatorError::DataQuality`], which is never
/// retried.
pub struct DataQualityGate {
    warehouse: Arc<dyn Warehouse>,
    tables: Vec<Identifier>,
    check: QualityCheck,
}

impl DataQualityGate {
    pub fn new(warehouse: Arc<dyn Warehouse>, tables: Vec<Identifier>) -> Self {
        Self {
            warehouse,
            tables,
            check: QualityCheck::default(),
        }
    }

    pub fn with_check(mut self, check: QualityCheck) -> Self {
        self.check = check;
        self
    }
}

#[async_trait]
impl Operator for DataQualityGate {
    fn kind(&self) -> &'static str {
        "quality_gate"
    }

    async fn execute(&self, ctx: &OperatorContext) -> Result<(), OperatorError> {
        for table in &self.tables {
            let rows = self.warehouse.query(&self.check.statement(table)).await?;
            let measured = self.check.measure(&rows);

            match measured {
                Some(value) if self.check.holds(value) => {
                    info!(
                        node = %ctx.node_id,
                        table = %table,
                        measured = value,
                        check = self.check.description(),
                        "data quality check passed"
                    );
                }
                _ => {
                    warn!(
                        node = %ctx.node_id,
                        table = %table,
                        ?measured,
                        check = self.check.description(),
                        "data quality check failed"
                    );
                    return Err(OperatorError::DataQuality {
                        table: table.name(),
                        measured,
                        check: self.check.description().to_string(),
                    });
                }
            }
        }
        Ok(())
    }
}
