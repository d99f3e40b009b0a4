use std::collections::{BTreeMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dagpipe::*;
use proptest::prelude::*;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Event {
    Start(String),
    End(String),
}

type EventLog = Arc<Mutex<Vec<Event>>>;

/// Test operator that records its start and end, optionally sleeping and
/// optionally failing every attempt.
struct Scripted {
    log: EventLog,
    delay: Duration,
    fail: bool,
}

#[async_trait]
impl Operator for Scripted {
    fn kind(&self) -> &'static str {
        "scripted"
    }

    async fn execute(&self, ctx: &OperatorContext) -> Result<(), OperatorError> {
        self.log.lock().unwrap().push(Event::Start(ctx.node_id.clone()));
        tokio::time::sleep(self.delay).await;
        self.log.lock().unwrap().push(Event::End(ctx.node_id.clone()));
        if self.fail {
            Err(OperatorError::WarehouseConnection(format!("{} unavailable", ctx.node_id)))
        } else {
            Ok(())
        }
    }
}

struct Builder {
    graph: TaskGraph,
    log: EventLog,
}

impl Builder {
    fn new(id: &str) -> Self {
        Self {
            graph: TaskGraph::new(id),
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn node(&mut self, id: &str, deps: &[&str]) -> &mut Self {
        self.node_with(id, deps, Duration::from_millis(1), false)
    }

    fn node_with(&mut self, id: &str, deps: &[&str], delay: Duration, fail: bool) -> &mut Self {
        let op = Scripted {
            log: self.log.clone(),
            delay,
            fail,
        };
        self.graph
            .add_node(
                id,
                Arc::new(op),
                deps.iter().copied(),
                Some(RetryPolicy::fixed(1, Duration::from_millis(1))),
            )
            .unwrap();
        self
    }
}

async fn run(graph: &mut TaskGraph, workers: usize) -> RunResult {
    let config = SchedulerConfig {
        max_workers: workers,
        ..Default::default()
    };
    Scheduler::new(config)
        .unwrap()
        .run(graph, Credentials::default(), CancellationToken::new())
        .await
}

fn position(log: &[Event], event: &Event) -> usize {
    log.iter()
        .position(|e| e == event)
        .unwrap_or_else(|| panic!("missing {event:?}"))
}

/// The capstone warehouse pipeline shape.
fn capstone(failing: Option<&str>) -> Builder {
    let mut b = Builder::new("capstone");
    let mut add = |id: &str, deps: &[&str]| {
        let fail = failing == Some(id);
        b.node_with(id, deps, Duration::from_millis(2), fail);
    };
    add("Extract", &[]);
    add("StageChem", &["Extract"]);
    add("StageTemp", &[]);
    add("StageCrop", &[]);
    add("StageFlag", &[]);
    add("QualityGate1", &["StageChem", "StageTemp", "StageCrop", "StageFlag"]);
    add("LoadTemperature", &["QualityGate1"]);
    add("LoadItem", &["QualityGate1"]);
    add("LoadFlag", &["QualityGate1"]);
    add("QualityGate2", &["LoadTemperature", "LoadItem", "LoadFlag"]);
    add("LoadCropProduction", &["QualityGate2"]);
    add("QualityGate3", &["LoadCropProduction"]);
    b
}

#[tokio::test]
async fn capstone_all_succeed() {
    let mut b = capstone(None);
    let result = run(&mut b.graph, 4).await;

    assert_eq!(result.overall, RunStatus::Succeeded);
    assert_eq!(result.outcomes.len(), 12);
    assert!(result.states().values().all(|s| *s == TaskState::Succeeded));
    assert_eq!(result.completion_order.len(), 12);
}

#[tokio::test]
async fn capstone_stage_crop_fails() {
    let mut b = capstone(Some("StageCrop"));
    let result = run(&mut b.graph, 4).await;

    assert_eq!(result.overall, RunStatus::Failed);
    assert_eq!(result.state("StageCrop"), Some(TaskState::Failed));
    assert_eq!(result.outcomes["StageCrop"].attempts, 2);
    for id in ["Extract", "StageChem", "StageTemp", "StageFlag"] {
        assert_eq!(result.state(id), Some(TaskState::Succeeded), "{id}");
    }
    for id in [
        "QualityGate1",
        "LoadTemperature",
        "LoadItem",
        "LoadFlag",
        "QualityGate2",
        "LoadCropProduction",
        "QualityGate3",
    ] {
        assert_eq!(result.state(id), Some(TaskState::Skipped), "{id}");
    }

    let log = b.log.lock().unwrap().clone();
    assert!(!log.contains(&Event::Start("QualityGate1".into())));

    let summary = result.summary();
    assert!(summary.contains("StageCrop [WarehouseConnectionError]"));
    assert!(summary.contains("QualityGate1"));
}

#[tokio::test]
async fn fan_in_waits_for_every_dependency() {
    let delays = [(1, 30), (30, 1), (10, 10), (0, 5), (5, 0)];
    for workers in [1, 2, 8] {
        for (a_ms, b_ms) in delays {
            let mut b = Builder::new("fan-in");
            b.node_with("A", &[], Duration::from_millis(a_ms), false)
                .node_with("B", &[], Duration::from_millis(b_ms), false)
                .node("C", &["A", "B"]);

            let result = run(&mut b.graph, workers).await;
            assert!(result.is_success());

            let log = b.log.lock().unwrap().clone();
            let start_c = position(&log, &Event::Start("C".into()));
            assert!(position(&log, &Event::End("A".into())) < start_c);
            assert!(position(&log, &Event::End("B".into())) < start_c);
        }
    }
}

#[tokio::test]
async fn independent_branches_run_concurrently() {
    let mut b = Builder::new("parallel");
    for id in ["a", "b", "c", "d"] {
        b.node_with(id, &[], Duration::from_millis(200), false);
    }

    let started = std::time::Instant::now();
    let result = run(&mut b.graph, 4).await;
    assert!(result.is_success());
    assert!(started.elapsed() < Duration::from_millis(600));
}

#[tokio::test]
async fn worker_pool_bounds_parallelism() {
    let mut b = Builder::new("bounded");
    for id in ["a", "b", "c", "d", "e", "f"] {
        b.node_with(id, &[], Duration::from_millis(5), false);
    }
    let result = run(&mut b.graph, 2).await;
    assert!(result.is_success());

    let log = b.log.lock().unwrap().clone();
    let mut running = 0i32;
    let mut peak = 0;
    for event in &log {
        match event {
            Event::Start(_) => running += 1,
            Event::End(_) => running -= 1,
        }
        peak = peak.max(running);
    }
    assert!(peak <= 2, "peak concurrency {peak}");
}

#[tokio::test]
async fn data_quality_gate_blocks_downstream() {
    let warehouse = Arc::new(MemoryWarehouse::new());
    warehouse
        .insert_rows("t1", (0..5).map(|i| vec![SqlValue::Int(i)]).collect())
        .await;
    warehouse.insert_rows("t2", Vec::new()).await;

    let log: EventLog = Arc::new(Mutex::new(Vec::new()));
    let gate = DataQualityGate::new(
        warehouse,
        vec![Identifier::parse("t1").unwrap(), Identifier::parse("t2").unwrap()],
    );

    let mut graph = TaskGraph::new("gate");
    graph
        .add_node(
            "gate",
            Arc::new(gate),
            Vec::<String>::new(),
            Some(RetryPolicy::fixed(3, Duration::from_millis(1))),
        )
        .unwrap();
    for (id, deps) in [("load", vec!["gate"]), ("final", vec!["load"])] {
        let op = Scripted {
            log: log.clone(),
            delay: Duration::ZERO,
            fail: false,
        };
        graph.add_node(id, Arc::new(op), deps, None).unwrap();
    }

    let result = run(&mut graph, 4).await;
    let gate_outcome = &result.outcomes["gate"];
    assert_eq!(gate_outcome.state, TaskState::Failed);
    assert_eq!(gate_outcome.attempts, 1);
    match &gate_outcome.error {
        Some(OperatorError::DataQuality { table, measured, .. }) => {
            assert_eq!(table, "t2");
            assert_eq!(*measured, Some(0));
        }
        other => panic!("expected data quality error, got {other:?}"),
    }
    assert_eq!(result.state("load"), Some(TaskState::Skipped));
    assert_eq!(result.state("final"), Some(TaskState::Skipped));
    assert!(log.lock().unwrap().is_empty());
}

#[tokio::test]
async fn duplicate_task_ids_rejected_at_build_time() {
    // two loads registered under one id
    let mut b = Builder::new("dup");
    b.node("Load_item_table", &[]);
    let err = b
        .graph
        .add_node("Load_item_table", Arc::new(NoopOperator), Vec::<String>::new(), None)
        .unwrap_err();
    assert_eq!(err, GraphError::DuplicateId("Load_item_table".into()));
}

fn block_on<F: Future>(future: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(future)
}

/// Graphs of 2..10 nodes where node `i` depends on a subset of `0..i`.
fn dag() -> impl Strategy<Value = Vec<Vec<usize>>> {
    (2usize..10).prop_flat_map(|size| {
        (0..size)
            .map(|i| prop::sample::subsequence((0..i).collect::<Vec<_>>(), 0..=i))
            .collect::<Vec<_>>()
    })
}

fn dag_with_failing_node() -> impl Strategy<Value = (Vec<Vec<usize>>, usize)> {
    dag().prop_flat_map(|edges| {
        let size = edges.len();
        (Just(edges), 0..size)
    })
}

fn names(deps: &[usize]) -> Vec<String> {
    deps.iter().map(|d| format!("n{d}")).collect()
}

/// Nodes reachable from `from` along dependency edges, excluding `from`.
fn reachable(edges: &[Vec<usize>], from: usize) -> HashSet<usize> {
    let mut seen = HashSet::new();
    let mut queue = VecDeque::from([from]);
    while let Some(current) = queue.pop_front() {
        for (i, deps) in edges.iter().enumerate() {
            if deps.contains(&current) && seen.insert(i) {
                queue.push_back(i);
            }
        }
    }
    seen
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn failure_isolation_holds_for_any_dag((edges, failing) in dag_with_failing_node()) {
        let mut b = Builder::new("random");
        for (i, deps) in edges.iter().enumerate() {
            let ids = names(deps);
            let refs: Vec<&str> = ids.iter().map(String::as_str).collect();
            b.node_with(&format!("n{i}"), &refs, Duration::ZERO, i == failing);
        }

        let result = block_on(run(&mut b.graph, 3));
        let downstream = reachable(&edges, failing);
        let expected: BTreeMap<String, TaskState> = (0..edges.len())
            .map(|i| {
                let state = if i == failing {
                    TaskState::Failed
                } else if downstream.contains(&i) {
                    TaskState::Skipped
                } else {
                    TaskState::Succeeded
                };
                (format!("n{i}"), state)
            })
            .collect();

        prop_assert_eq!(result.overall, RunStatus::Failed);
        prop_assert_eq!(result.states(), expected);
    }

    #[test]
    fn acyclic_graphs_validate(edges in dag()) {
        let mut graph = TaskGraph::new("acyclic");
        for (i, deps) in edges.iter().enumerate() {
            graph.add_node(format!("n{i}"), Arc::new(NoopOperator), names(deps), None).unwrap();
        }
        let order = graph.validate().unwrap();
        prop_assert_eq!(order.len(), edges.len());

        let position = |id: &str| order.iter().position(|n| n == id);
        for (i, deps) in edges.iter().enumerate() {
            for dep in names(deps) {
                let node = format!("n{i}");
                prop_assert!(position(&dep) < position(&node));
            }
        }
    }

    #[test]
    fn closed_chains_are_rejected(edges in dag()) {
        // a chain n0 <- n1 <- ... <- last plus extra edges, closed by n0
        // depending on last
        let last = edges.len() - 1;
        let mut graph = TaskGraph::new("cyclic");
        for (i, deps) in edges.iter().enumerate() {
            let mut ids = names(deps);
            if i == 0 {
                ids.push(format!("n{last}"));
            } else {
                ids.push(format!("n{}", i - 1));
            }
            graph.add_node(format!("n{i}"), Arc::new(NoopOperator), ids, None).unwrap();
        }

        match graph.validate() {
            Err(GraphError::Cycle { cycle }) => {
                prop_assert!(cycle.len() >= 3);
                prop_assert_eq!(cycle.first(), cycle.last());
            }
            other => prop_assert!(false, "expected a cycle, got {:?}", other),
        }
    }
}
