use dagpipe::*;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

const BUCKET: &str = "dend-capstone-bucket";
const CHEM_SERIES: &str = "Agricultural Chemicals Production Index, Annual";

const SCHEDULER_TOML: &str = r#"
max_workers = 4
default_timeout_secs = 60

[default_retry]
max_retries = 3
backoff_secs = 1
"#;

const TEMPERATURE_SELECT: &str =
    "SELECT dt, average_temperature, country FROM stage_temperature WHERE country = $1";
const CHEM_SELECT: &str = "SELECT year, value FROM stage_agri_chemical";
const ITEM_SELECT: &str = "SELECT DISTINCT item_code, item FROM stage_crop_production";
const ELEMENT_SELECT: &str = "SELECT DISTINCT element_code, element FROM stage_crop_production";
const FLAG_SELECT: &str = "SELECT flag_code, flag_description FROM stage_flag";
const CROP_SELECT: &str =
    "SELECT item_code, element_code, year, value FROM stage_crop_production";

// Explodes the chemicals production series from the JSON-lines STEO dump
// into a `year,value` CSV.
fn chem_index_csv(raw: &[u8]) -> Result<Vec<u8>, OperatorError> {
    let text = std::str::from_utf8(raw).map_err(|e| OperatorError::Transform(e.to_string()))?;
    let mut csv = String::from("year,value\n");
    for line in text.lines().filter(|l| !l.trim().is_empty()) {
        let record: serde_json::Value =
            serde_json::from_str(line).map_err(|e| OperatorError::Transform(e.to_string()))?;
        if record["name"] != CHEM_SERIES {
            continue;
        }
        let points = record["data"]
            .as_array()
            .ok_or_else(|| OperatorError::Transform("series without data".into()))?;
        for point in points {
            let year = point[0].as_str().unwrap_or_default();
            csv.push_str(&format!("{year},{}\n", point[1]));
        }
    }
    Ok(csv.into_bytes())
}

fn ident(name: &str) -> Result<Identifier, BoxError> {
    Ok(Identifier::parse(name)?)
}

type BoxError = Box<dyn std::error::Error>;

fn table(name: &str, columns: &[(&str, &str)]) -> Result<TableDefinition, BoxError> {
    let mut def = TableDefinition::new(ident(name)?);
    for (column, ty) in columns {
        def = def.column(column, ty)?;
    }
    Ok(def)
}

async fn seed(store: &MemoryObjectStore) {
    let objects = [
        (
            "GlobalLandTemperaturesByCountry.csv",
            "dt,AverageTemperature,AverageTemperatureUncertainty,Country\n\
             2012-01-01,26.1,0.4,Thailand\n\
             2012-02-01,27.3,0.3,Thailand\n\
             2012-01-01,3.2,0.2,Japan\n",
        ),
        (
            "Production_Crops_E_All_Data.csv",
            "Item Code,Item,Element Code,Element,Year,Value\n\
             15,Wheat,5510,Production,2012,12.5\n\
             15,Wheat,5510,Production,2013,13.1\n\
             27,Rice,5312,Area harvested,2013,40.2\n",
        ),
        ("Flags.csv", "Flag,Flags\nA,Aggregate\nF,FAO estimate\n"),
        (
            "STEO.txt",
            "{\"name\":\"Agricultural Chemicals Production Index, Annual\",\"data\":[[\"2012\",101.5],[\"2013\",99.2]]}\n\
             {\"name\":\"Brent Crude Oil Spot Price\",\"data\":[[\"2012\",111.6]]}\n",
        ),
    ];
    for (key, body) in objects {
        store.put(&ObjectLocation::new(BUCKET, key), body).await;
    }
}

fn warehouse(store: Arc<MemoryObjectStore>) -> MemoryWarehouse {
    fn rows(
        tables: &std::collections::HashMap<String, Vec<Row>>,
        name: &str,
        picks: &[usize],
    ) -> Result<Vec<Row>, WarehouseError> {
        let source = tables
            .get(name)
            .ok_or_else(|| WarehouseError::Statement(format!("relation {name} does not exist")))?;
        Ok(source
            .iter()
            .map(|row| picks.iter().map(|i| row[*i].clone()).collect())
            .collect())
    }

    fn distinct(rows: Vec<Row>) -> Vec<Row> {
        rows.into_iter().fold(Vec::new(), |mut seen, row| {
            if !seen.contains(&row) {
                seen.push(row);
            }
            seen
        })
    }

    MemoryWarehouse::new()
        .with_object_store(store)
        .with_select(TEMPERATURE_SELECT, |t, params| {
            Ok(rows(t, "stage_temperature", &[0, 1, 3])?
                .into_iter()
                .filter(|row| params.first() == Some(&row[2]))
                .collect())
        })
        .with_select(CHEM_SELECT, |t, _| rows(t, "stage_agri_chemical", &[0, 1]))
        .with_select(ITEM_SELECT, |t, _| {
            Ok(distinct(rows(t, "stage_crop_production", &[0, 1])?))
        })
        .with_select(ELEMENT_SELECT, |t, _| {
            Ok(distinct(rows(t, "stage_crop_production", &[2, 3])?))
        })
        .with_select(FLAG_SELECT, |t, _| rows(t, "stage_flag", &[0, 1]))
        .with_select(CROP_SELECT, |t, _| rows(t, "stage_crop_production", &[0, 2, 4, 5]))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("dagpipe=info")),
        )
        .init();

    let store = Arc::new(MemoryObjectStore::new());
    seed(&store).await;
    let wh = Arc::new(warehouse(store.clone()));

    let stage = |name: &str, key: &str, cols: &[(&str, &str)]| -> Result<BoxOperator, BoxError> {
        let source = TableSource::Object(ObjectLocation::new(BUCKET, key));
        let op = StageOperator::new(
            wh.clone(),
            TableDescriptor::new(table(name, cols)?, source),
            FormatOptions::default(),
        )?;
        Ok(Arc::new(op))
    };
    let load = |name: &str,
                cols: &[(&str, &str)],
                select: SelectStatement|
     -> Result<BoxOperator, BoxError> {
        let op = LoadOperator::new(
            wh.clone(),
            TableDescriptor::new(table(name, cols)?, TableSource::Select(select)),
        )?;
        Ok(Arc::new(op))
    };
    let gate = |tables: &[&str]| -> Result<BoxOperator, BoxError> {
        let tables = tables.iter().map(|t| ident(t)).collect::<Result<Vec<_>, _>>()?;
        Ok(Arc::new(DataQualityGate::new(wh.clone(), tables)))
    };

    let mut graph = TaskGraph::new("dend_capstone");
    let none: [&str; 0] = [];
    graph.add_node("Begin_execution", Arc::new(NoopOperator), none, None)?;
    graph.add_node(
        "Extract_agri_chemical_index",
        Arc::new(ExtractOperator::new(
            store.clone(),
            ObjectLocation::new(BUCKET, "STEO.txt"),
            ObjectLocation::new(BUCKET, "agri_chem_prod_index.csv"),
            chem_index_csv,
        )),
        ["Begin_execution"],
        None,
    )?;
    graph.add_node(
        "Stage_agri_chemical",
        stage(
            "stage_agri_chemical",
            "agri_chem_prod_index.csv",
            &[("year", "INT"), ("value", "FLOAT")],
        )?,
        ["Extract_agri_chemical_index"],
        None,
    )?;
    graph.add_node(
        "Stage_temperature",
        stage(
            "stage_temperature",
            "GlobalLandTemperaturesByCountry.csv",
            &[
                ("dt", "DATE"),
                ("average_temperature", "FLOAT"),
                ("average_temperature_uncertainty", "FLOAT"),
                ("country", "VARCHAR(256)"),
            ],
        )?,
        ["Begin_execution"],
        None,
    )?;
    graph.add_node(
        "Stage_crop_production",
        stage(
            "stage_crop_production",
            "Production_Crops_E_All_Data.csv",
            &[
                ("item_code", "INT"),
                ("item", "VARCHAR(256)"),
                ("element_code", "INT"),
                ("element", "VARCHAR(256)"),
                ("year", "INT"),
                ("value", "FLOAT"),
            ],
        )?,
        ["Begin_execution"],
        None,
    )?;
    graph.add_node(
        "Stage_flag",
        stage(
            "stage_flag",
            "Flags.csv",
            &[("flag_code", "VARCHAR(8)"), ("flag_description", "VARCHAR(256)")],
        )?,
        ["Begin_execution"],
        None,
    )?;
    graph.add_node(
        "Run_data_quality_checks_stage",
        gate(&["stage_agri_chemical", "stage_temperature", "stage_crop_production", "stage_flag"])?,
        ["Stage_agri_chemical", "Stage_temperature", "Stage_crop_production", "Stage_flag"],
        None,
    )?;
    graph.add_node(
        "Load_temperature_table",
        load(
            "temperature",
            &[("dt", "DATE"), ("average_temperature", "FLOAT"), ("country", "VARCHAR(256)")],
            SelectStatement::new(TEMPERATURE_SELECT)
                .bind(SqlValue::Text("Thailand".into()))
                .from_table(ident("stage_temperature")?),
        )?,
        ["Run_data_quality_checks_stage"],
        None,
    )?;
    graph.add_node(
        "Load_chemical_production_index_table",
        load(
            "agri_chem_prod_index",
            &[("year", "INT"), ("value", "FLOAT")],
            SelectStatement::new(CHEM_SELECT).from_table(ident("stage_agri_chemical")?),
        )?,
        ["Run_data_quality_checks_stage"],
        None,
    )?;
    graph.add_node(
        "Load_item_table",
        load(
            "item",
            &[("item_code", "INT"), ("item", "VARCHAR(256)")],
            SelectStatement::new(ITEM_SELECT).from_table(ident("stage_crop_production")?),
        )?,
        ["Run_data_quality_checks_stage"],
        None,
    )?;
    graph.add_node(
        "Load_element_table",
        load(
            "element",
            &[("element_code", "INT"), ("element", "VARCHAR(256)")],
            SelectStatement::new(ELEMENT_SELECT).from_table(ident("stage_crop_production")?),
        )?,
        ["Run_data_quality_checks_stage"],
        None,
    )?;
    graph.add_node(
        "Load_flag_table",
        load(
            "flag",
            &[("flag_code", "VARCHAR(8)"), ("flag_description", "VARCHAR(256)")],
            SelectStatement::new(FLAG_SELECT).from_table(ident("stage_flag")?),
        )?,
        ["Run_data_quality_checks_stage"],
        None,
    )?;
    graph.add_node(
        "Run_data_quality_checks_dims",
        gate(&["temperature", "agri_chem_prod_index", "item", "element", "flag"])?,
        [
            "Load_temperature_table",
            "Load_chemical_production_index_table",
            "Load_item_table",
            "Load_element_table",
            "Load_flag_table",
        ],
        None,
    )?;
    graph.add_node(
        "Load_crop_production_table",
        load(
            "crop_production",
            &[("item_code", "INT"), ("element_code", "INT"), ("year", "INT"), ("value", "FLOAT")],
            SelectStatement::new(CROP_SELECT).from_table(ident("stage_crop_production")?),
        )?,
        ["Run_data_quality_checks_dims"],
        None,
    )?;
    graph.add_node(
        "Run_data_quality_checks_facts",
        gate(&["crop_production"])?,
        ["Load_crop_production_table"],
        None,
    )?;
    graph.add_node(
        "Stop_execution",
        Arc::new(NoopOperator),
        ["Run_data_quality_checks_facts"],
        None,
    )?;

    println!("=== pipeline ===");
    print!("{}", graph.render_tree());

    // one transient failure, absorbed by the retry policy
    wh.fail_nth(5, WarehouseError::Connection("connection reset by peer".into()))
        .await;

    let config = SchedulerConfig::from_toml_str(SCHEDULER_TOML)?;
    let state = Arc::new(MemoryStateStore::new());
    let scheduler = Scheduler::new(config)?.with_state_store(state.clone());

    println!("=== running ===");
    let credentials = Credentials::new("AKIAEXAMPLE", "example-secret", "us-west-2");
    let result = scheduler
        .run(&mut graph, credentials, CancellationToken::new())
        .await;

    println!("=== finished ===");
    let elapsed = (result.finished_at - result.started_at)
        .to_std()
        .unwrap_or(Duration::ZERO);
    println!("elapsed: {elapsed:?}");
    println!("{}", result.summary());
    println!("completion order: {}", result.completion_order.join(" -> "));
    let tables = [
        "temperature",
        "agri_chem_prod_index",
        "item",
        "element",
        "flag",
        "crop_production",
    ];
    for name in tables {
        let rows = wh.table(name).await.unwrap_or_default();
        println!("{name}: {} rows", rows.len());
    }
    println!(
        "persisted: {}",
        serde_json::to_string_pretty(&state.export_json(graph.graph_id(), result.run_id).await)?
    );

    Ok(())
}
