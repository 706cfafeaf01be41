//! End-to-end runs of stage graphs on loopback workers

use async_trait::async_trait;
use query_core::{DataType, Field, Row, Schema, Value};
use query_distributed::{
    ClusterConfig, Coordinator, DistributedError, HeartbeatConfig, JobKind, JobTag,
    OperatorRegistry, PlanNode, PlanNodeKind, QueryStatus, RuntimeConfig, ScanNode, SortKey,
    StageContext, StageGraph, StageOperator, Worker, WorkerInfo,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::timeout;

/// Emits one row per file, the file name parsed as an integer
struct NumberScan;

#[async_trait]
impl StageOperator for NumberScan {
    async fn execute(&self, ctx: &mut StageContext) -> query_distributed::Result<()> {
        let files = match &ctx.job.kind {
            JobKind::Scan { files, .. } => files.clone(),
            other => {
                return Err(DistributedError::TaskExecutionFailed(format!(
                    "not a scan: {:?}",
                    other
                )))
            }
        };
        for file in files {
            match file.as_str() {
                "hang" => std::future::pending::<()>().await,
                "bad" => {
                    return Err(DistributedError::TaskExecutionFailed(
                        "unreadable file bad".to_string(),
                    ))
                }
                _ => {}
            }
            let n: i64 = file
                .parse()
                .map_err(|_| DistributedError::TaskExecutionFailed(format!("bad number {}", file)))?;
            ctx.outputs[0].write_row(Row::new(vec![Value::Int64(n)])).await?;
        }
        Ok(())
    }
}

/// Equi-join of one left and one right input, emitting `[left.., right..]`
struct InMemoryHashJoin;

#[async_trait]
impl StageOperator for InMemoryHashJoin {
    async fn execute(&self, ctx: &mut StageContext) -> query_distributed::Result<()> {
        let (left_inputs, left_keys, right_keys) = match &ctx.job.kind {
            JobKind::HashJoin {
                left_inputs,
                left_keys,
                right_keys,
            } => (*left_inputs, left_keys.clone(), right_keys.clone()),
            other => {
                return Err(DistributedError::TaskExecutionFailed(format!(
                    "not a hash join: {:?}",
                    other
                )))
            }
        };

        let mut table: HashMap<Vec<Value>, Vec<Row>> = HashMap::new();
        for input in &mut ctx.inputs[..left_inputs] {
            for row in input.read_all().await? {
                let key = left_keys.iter().map(|&k| row.vals[k].clone()).collect();
                table.entry(key).or_default().push(row);
            }
        }
        let mut right_rows = Vec::new();
        for input in &mut ctx.inputs[left_inputs..] {
            right_rows.extend(input.read_all().await?);
        }

        for right in right_rows {
            let key: Vec<Value> = right_keys.iter().map(|&k| right.vals[k].clone()).collect();
            if let Some(matches) = table.get(&key) {
                for left in matches {
                    let mut vals = left.vals.clone();
                    vals.extend(right.vals.iter().cloned());
                    ctx.outputs[0].write_row(Row::new(vals)).await?;
                }
            }
        }
        Ok(())
    }
}

fn registry() -> OperatorRegistry {
    let mut registry = OperatorRegistry::with_builtins();
    registry.register(JobTag::Scan, Arc::new(NumberScan));
    registry.register(JobTag::HashJoin, Arc::new(InMemoryHashJoin));
    registry
}

fn number_schema(name: &str) -> Schema {
    Schema::new(vec![Field::new(name, DataType::Int64, false)])
}

fn scan(table: &str, files: &[&str]) -> PlanNode {
    PlanNode::scan(
        ScanNode::new(table).with_files(files.iter().map(|f| f.to_string()).collect()),
        number_schema("n"),
    )
}

fn ints(rows: &[Row]) -> Vec<i64> {
    rows.iter()
        .map(|r| match r.vals[0] {
            Value::Int64(n) => n,
            ref other => panic!("unexpected value {:?}", other),
        })
        .collect()
}

struct TestCluster {
    coordinator: Arc<Coordinator>,
    workers: Vec<Arc<Worker>>,
    heartbeat_addr: String,
    shutdown: watch::Sender<bool>,
}

impl TestCluster {
    async fn start(workers: usize) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let coordinator = Arc::new(Coordinator::new(ClusterConfig {
            heartbeat_timeout_ms: 5000,
            default_parallelism: 2,
            status_poll_interval_ms: 20,
        }));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let heartbeat_addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(Arc::clone(&coordinator).serve_heartbeats(listener, shutdown_rx.clone()));

        let mut hosted = Vec::with_capacity(workers);
        for i in 0..workers {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let port = listener.local_addr().unwrap().port();
            let info = WorkerInfo::new(format!("worker{}", i), "127.0.0.1", port, 0);
            let worker = Arc::new(Worker::new(info.clone(), registry()));
            tokio::spawn(Arc::clone(&worker).serve(listener, shutdown_rx.clone()));
            coordinator.register_worker(info).unwrap();
            hosted.push(worker);
        }

        Self {
            coordinator,
            workers: hosted,
            heartbeat_addr,
            shutdown,
        }
    }

    fn runtime_config(&self) -> RuntimeConfig {
        RuntimeConfig {
            flush_threshold: 2,
            coordinator: Some(self.heartbeat_addr.clone()),
            heartbeat: HeartbeatConfig {
                fast_interval_ms: 10,
                interval_ms: 200,
                retry_backoff_ms: 50,
            },
            ..RuntimeConfig::default()
        }
    }

    async fn run(&self, graph: &StageGraph) -> query_distributed::Result<Vec<Row>> {
        let config = self.runtime_config();
        self.coordinator.dispatch(graph, &config).await?;
        timeout(Duration::from_secs(20), self.coordinator.fetch_results(graph, &config))
            .await
            .expect("query timed out")
    }

    async fn wait_for_status(&self, graph: &StageGraph, expected: fn(&QueryStatus) -> bool) {
        for _ in 0..500 {
            if expected(&self.coordinator.query_status(graph)) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("status stuck at {:?}", self.coordinator.query_status(graph));
    }

    fn stop(self) {
        self.shutdown.send_replace(true);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_scan_results_reach_the_sink() {
    let cluster = TestCluster::start(2).await;
    let files: Vec<String> = (1..=10).map(|n| n.to_string()).collect();
    let file_refs: Vec<&str> = files.iter().map(String::as_str).collect();

    let graph = cluster.coordinator.plan(&scan("t", &file_refs), Some(3)).unwrap();
    assert_eq!(graph.len(), 4);
    assert_eq!(graph.sink().inputs.len(), 3);

    let rows = cluster.run(&graph).await.unwrap();
    let mut values = ints(&rows);
    values.sort();
    assert_eq!(values, (1..=10).collect::<Vec<_>>());

    cluster
        .wait_for_status(&graph, |s| *s == QueryStatus::Completed)
        .await;
    cluster.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_order_by_merges_four_sorted_streams() {
    let cluster = TestCluster::start(3).await;
    let plan = PlanNode::unary(
        PlanNodeKind::OrderBy {
            keys: vec![SortKey::desc(0)],
        },
        scan("t", &["7", "3", "42", "-1", "15", "8", "0", "23", "4", "16", "9"]),
    );

    let graph = cluster.coordinator.plan(&plan, Some(4)).unwrap();
    let local = graph
        .jobs()
        .iter()
        .filter(|j| j.tag() == JobTag::OrderByLocal)
        .count();
    let global = graph
        .jobs()
        .iter()
        .filter(|j| j.tag() == JobTag::OrderByGlobal)
        .count();
    assert_eq!((local, global), (4, 1));

    let rows = cluster.run(&graph).await.unwrap();
    assert_eq!(ints(&rows), vec![42, 23, 16, 15, 9, 8, 7, 4, 3, 0, -1]);
    cluster.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_hash_join_over_shuffled_inputs() {
    let cluster = TestCluster::start(3).await;
    let plan = PlanNode::new(
        PlanNodeKind::HashJoin {
            left_keys: vec![0],
            right_keys: vec![0],
        },
        vec![
            scan("left", &["1", "2", "3", "4", "5", "6"]),
            scan("right", &["2", "4", "6", "8", "4"]),
        ],
        Schema::new(vec![
            Field::new("l", DataType::Int64, false),
            Field::new("r", DataType::Int64, false),
        ]),
    );

    let graph = cluster.coordinator.plan(&plan, Some(3)).unwrap();
    let shuffles = graph.jobs().iter().filter(|j| j.tag() == JobTag::Shuffle).count();
    assert_eq!(shuffles, 6);

    let rows = cluster.run(&graph).await.unwrap();
    let mut pairs: Vec<(i64, i64)> = rows
        .iter()
        .map(|r| match (&r.vals[0], &r.vals[1]) {
            (Value::Int64(l), Value::Int64(r)) => (*l, *r),
            other => panic!("unexpected row {:?}", other),
        })
        .collect();
    pairs.sort();
    assert_eq!(pairs, vec![(2, 2), (4, 4), (4, 4), (6, 6)]);
    cluster.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_limit_and_distinct_pipeline() {
    let cluster = TestCluster::start(2).await;
    let distinct = PlanNode::unary(
        PlanNodeKind::DistinctGlobal,
        PlanNode::unary(
            PlanNodeKind::DistinctLocal,
            scan("t", &["5", "5", "1", "1", "2", "5", "2"]),
        ),
    );
    let graph = cluster.coordinator.plan(&distinct, Some(2)).unwrap();
    let mut values = ints(&cluster.run(&graph).await.unwrap());
    values.sort();
    assert_eq!(values, vec![1, 2, 5]);

    let limited = PlanNode::unary(
        PlanNodeKind::Limit { count: 3 },
        scan("t", &["1", "2", "3", "4", "5", "6", "7", "8"]),
    );
    let graph = cluster.coordinator.plan(&limited, Some(2)).unwrap();
    assert_eq!(cluster.run(&graph).await.unwrap().len(), 3);
    cluster.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failed_job_fails_the_query() {
    let cluster = TestCluster::start(2).await;
    // the sink drains the hanging scan first, so only failure detection can end the query
    let graph = cluster.coordinator.plan(&scan("t", &["hang", "bad"]), Some(2)).unwrap();

    match cluster.run(&graph).await {
        Err(DistributedError::QueryFailed(reason)) => assert!(reason.contains("failed")),
        other => panic!("expected a failed query, got {:?}", other.map(|r| r.len())),
    }

    let failed = graph
        .jobs()
        .iter()
        .filter_map(|j| cluster.coordinator.job_report(&j.location.name))
        .filter(|r| r.status == query_distributed::JobStatus::Error)
        .count();
    assert_eq!(failed, 1);
    assert!(cluster.workers.iter().map(|w| w.executor_count()).sum::<usize>() > 0);
    cluster.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unknown_operator_rejected_at_dispatch() {
    let cluster = TestCluster::start(1).await;
    let plan = PlanNode::unary(PlanNodeKind::Filter, scan("t", &["1"]));
    let graph = cluster.coordinator.plan(&plan, Some(1)).unwrap();

    let result = cluster.coordinator.dispatch(&graph, &cluster.runtime_config()).await;
    match result {
        Err(DistributedError::Remote(message)) => assert!(message.contains("filter")),
        other => panic!("expected a remote rejection, got {:?}", other),
    }
    cluster.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_queries_in_flight() {
    let cluster = TestCluster::start(2).await;
    let first = cluster.coordinator.plan(&scan("t", &["1", "2", "3"]), Some(2)).unwrap();
    let second = cluster.coordinator.plan(&scan("u", &["10", "20"]), Some(2)).unwrap();

    let config = cluster.runtime_config();
    cluster.coordinator.dispatch(&first, &config).await.unwrap();
    cluster.coordinator.dispatch(&second, &config).await.unwrap();

    let (a, b) = timeout(Duration::from_secs(20), async {
        tokio::join!(
            cluster.coordinator.fetch_results(&first, &config),
            cluster.coordinator.fetch_results(&second, &config)
        )
    })
    .await
    .expect("queries timed out");

    let mut a = ints(&a.unwrap());
    let mut b = ints(&b.unwrap());
    a.sort();
    b.sort();
    assert_eq!(a, vec![1, 2, 3]);
    assert_eq!(b, vec![10, 20]);
    cluster.stop();
}
