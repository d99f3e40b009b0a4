use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use crate::sql::{FormatOptions, Identifier, SelectStatement, SqlValue, Statement, StatementKind};
use crate::{Credentials, ObjectLocation, ObjectStore, WarehouseError};

pub type Row = Vec<SqlValue>;

/// Evaluates a registered SELECT against the current tables and its bound
/// parameters.
pub type SelectResolver = Arc<
    dyn Fn(&HashMap<String, Vec<Row>>, &[SqlValue]) -> Result<Vec<Row>, WarehouseError>
        + Send
        + Sync,
>;

/// Relational warehouse collaborator.
#[async_trait]
pub trait Warehouse: Send + Sync {
    async fn execute(&self, statement: &Statement) -> Result<(), WarehouseError>;

    async fn query(&self, statement: &Statement) -> Result<Vec<Row>, WarehouseError>;

    /// Loads a delimited object into `table`. Treated as atomic: either all
    /// rows are appended or none are.
    async fn bulk_load(
        &self,
        table: &Identifier,
        location: &ObjectLocation,
        format: &FormatOptions,
        credentials: &Credentials,
    ) -> Result<(), WarehouseError>;
}

#[derive(Default)]
struct State {
    tables: HashMap<String, Vec<Row>>,
    faults: VecDeque<Option<WarehouseError>>,
    log: Vec<String>,
}

/// In-process warehouse that interprets structured [`Statement`]s.
///
/// SELECTs, standalone or inside INSERT ... SELECT, are evaluated by
/// resolvers registered per SELECT text.
pub struct MemoryWarehouse {
    state: Mutex<State>,
    objects: Option<Arc<dyn ObjectStore>>,
    selects: HashMap<String, SelectResolver>,
}

impl Default for MemoryWarehouse {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            objects: None,
            selects: HashMap::new(),
        }
    }

    /// Object store that bulk loads read from.
    pub fn with_object_store(mut self, store: Arc<dyn ObjectStore>) -> Self {
        self.objects = Some(store);
        self
    }

    pub fn with_select<F>(mut self, sql: &str, resolver: F) -> Self
    where
        F: Fn(&HashMap<String, Vec<Row>>, &[SqlValue]) -> Result<Vec<Row>, WarehouseError>
            + Send
            + Sync
            + 'static,
    {
        let sql = sql.trim().trim_end_matches(';');
        self.selects.insert(sql.to_string(), Arc::new(resolver));
        self
    }

    /// Makes the next collaborator call fail with `err`. Faults queue up.
    pub async fn fail_next(&self, err: WarehouseError) {
        self.fail_nth(1, err).await;
    }

    /// Lets `n - 1` calls through, then fails the `n`th with `err`,
    /// counting from the end of any already queued faults.
    pub async fn fail_nth(&self, n: usize, err: WarehouseError) {
        let mut state = self.state.lock().await;
        for _ in 1..n {
            state.faults.push_back(None);
        }
        state.faults.push_back(Some(err));
    }

    pub async fn insert_rows(&self, table: &str, rows: Vec<Row>) {
        self.state
            .lock()
            .await
            .tables
            .entry(table.to_string())
            .or_default()
            .extend(rows);
    }

    pub async fn table(&self, table: &str) -> Option<Vec<Row>> {
        self.state.lock().await.tables.get(table).cloned()
    }

    /// Rendered SQL of every statement that reached the warehouse, in order.
    pub async fn statements(&self) -> Vec<String> {
        self.state.lock().await.log.clone()
    }

    fn apply(&self, state: &mut State, statement: &Statement) -> Result<(), WarehouseError> {
        match &statement.kind {
            StatementKind::CreateTable(def) => {
                state.tables.entry(def.name.name()).or_default();
                Ok(())
            }
            StatementKind::Truncate(table) => {
                existing_mut(&mut state.tables, table)?.clear();
                Ok(())
            }
            StatementKind::InsertSelect { table, select } => {
                existing_mut(&mut state.tables, table)?;
                let rows = self.resolve(state, select)?;
                existing_mut(&mut state.tables, table)?.extend(rows);
                Ok(())
            }
            StatementKind::CountRows(_) | StatementKind::Select(_) => Err(WarehouseError::Statement(
                "SELECT must be issued through query".to_string(),
            )),
            StatementKind::Copy { .. } => Err(WarehouseError::Statement(
                "COPY must be issued through bulk_load".to_string(),
            )),
        }
    }

    fn resolve(
        &self,
        state: &mut State,
        select: &SelectStatement,
    ) -> Result<Vec<Row>, WarehouseError> {
        for source in &select.sources {
            existing_mut(&mut state.tables, source)?;
        }
        let sql = select.sql.trim().trim_end_matches(';');
        let resolver = self
            .selects
            .get(sql)
            .ok_or_else(|| WarehouseError::Statement(format!("unsupported select: {sql}")))?;
        resolver(&state.tables, &select.params)
    }
}

fn existing_mut<'a>(
    tables: &'a mut HashMap<String, Vec<Row>>,
    table: &Identifier,
) -> Result<&'a mut Vec<Row>, WarehouseError> {
    tables
        .get_mut(&table.name())
        .ok_or_else(|| WarehouseError::Statement(format!("relation {table} does not exist")))
}

fn parse_delimited(bytes: &[u8], format: &FormatOptions) -> Result<Vec<Row>, WarehouseError> {
    let delimiter = u8::try_from(format.delimiter).map_err(|_| {
        WarehouseError::Statement(format!("delimiter {:?} is not a single byte", format.delimiter))
    })?;
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(false)
        .flexible(true)
        .from_reader(bytes);

    let mut rows = Vec::new();
    for record in reader.records().skip(format.ignore_header) {
        let record = record
            .map_err(|e| WarehouseError::Statement(format!("malformed load source: {e}")))?;
        if record.iter().all(|field| field.trim().is_empty()) {
            continue;
        }
        rows.push(
            record
                .iter()
                .map(|field| {
                    if field.is_empty() {
                        SqlValue::Null
                    } else {
                        SqlValue::Text(field.to_string())
                    }
                })
                .collect(),
        );
    }
    Ok(rows)
}

#[async_trait]
impl Warehouse for MemoryWarehouse {
    async fn execute(&self, statement: &Statement) -> Result<(), WarehouseError> {
        let mut state = self.state.lock().await;
        if let Some(Some(err)) = state.faults.pop_front() {
            return Err(err);
        }
        state.log.push(statement.sql.clone());
        debug!(sql = %statement.sql, "executing statement");
        self.apply(&mut state, statement)
    }

    async fn query(&self, statement: &Statement) -> Result<Vec<Row>, WarehouseError> {
        let mut state = self.state.lock().await;
        if let Some(Some(err)) = state.faults.pop_front() {
            return Err(err);
        }
        state.log.push(statement.sql.clone());
        match &statement.kind {
            StatementKind::CountRows(table) => {
                let count = existing_mut(&mut state.tables, table)?.len();
                Ok(vec![vec![SqlValue::Int(count as i64)]])
            }
            StatementKind::Select(select) => self.resolve(&mut state, select),
            _ => Err(WarehouseError::Statement(format!(
                "statement returns no rows: {}",
                statement.sql
            ))),
        }
    }

    async fn bulk_load(
        &self,
        table: &Identifier,
        location: &ObjectLocation,
        format: &FormatOptions,
        credentials: &Credentials,
    ) -> Result<(), WarehouseError> {
        {
            let mut state = self.state.lock().await;
            if let Some(Some(err)) = state.faults.pop_front() {
                return Err(err);
            }
            existing_mut(&mut state.tables, table)?;
        }

        let store = self
            .objects
            .as_ref()
            .ok_or_else(|| WarehouseError::Connection("no object store attached".to_string()))?;
        let bytes = store
            .read(&location.bucket, &location.key)
            .await
            .map_err(|e| WarehouseError::Statement(format!("load source unavailable: {e}")))?;
        let rows = parse_delimited(&bytes, format)?;

        let copy = Statement::copy_from(table, &location.to_string(), credentials.region(), format);
        let mut state = self.state.lock().await;
        state.log.push(copy.sql);
        existing_mut(&mut state.tables, table)?.extend(rows);
        Ok(())
    }
}
