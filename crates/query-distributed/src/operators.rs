//! Stage operators and the registry that maps job kinds to them
//!
//! The runtime owns the data movement kinds (duplicate, balance, shuffle,
//! union, aggregate sink, limit, order-by and distinct). Kinds whose work
//! depends on expression evaluation or storage (scan, select, filter, joins,
//! group-by, aggregate functions, show, insert) are registered by the
//! embedding application.

use crate::error::{DistributedError, Result};
use crate::executor::SharedState;
use crate::job::{JobKind, JobTag, SortKey, StageJob};
use crate::row_buffer::{RowsReader, RowsWriter};
use crate::types::LogLevel;
use async_trait::async_trait;
use query_core::{Row, Value};
use std::cmp::{Ordering, Reverse};
use std::collections::hash_map::DefaultHasher;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

/// Operator side of an input channel
pub type InputStream = RowsReader<Box<dyn AsyncRead + Send + Unpin>>;

/// Operator side of an output channel
pub type OutputStream = RowsWriter<Box<dyn AsyncWrite + Send + Unpin>>;

/// Everything an operator sees while it runs
pub struct StageContext {
    pub job: StageJob,
    /// One reader per job input, in input order
    pub inputs: Vec<InputStream>,
    /// One writer per job output, in output order
    pub outputs: Vec<OutputStream>,
    state: SharedState,
}

impl StageContext {
    pub fn new(job: StageJob, inputs: Vec<InputStream>, outputs: Vec<OutputStream>, state: SharedState) -> Self {
        Self {
            job,
            inputs,
            outputs,
            state,
        }
    }

    /// Append a message to the executor log
    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.state.lock().log(level, message);
    }

    /// Give the output writers back to the runtime
    pub fn into_outputs(self) -> Vec<OutputStream> {
        self.outputs
    }

    fn output(&mut self, index: usize) -> Result<&mut OutputStream> {
        let count = self.outputs.len();
        self.outputs.get_mut(index).ok_or_else(|| {
            DistributedError::TaskExecutionFailed(format!(
                "output {} requested, job has {}",
                index, count
            ))
        })
    }
}

/// Work done by one stage job.
///
/// Operators read every input to its end of stream and write rows to their
/// outputs. Closing the outputs is left to the runtime.
#[async_trait]
pub trait StageOperator: Send + Sync {
    async fn execute(&self, ctx: &mut StageContext) -> Result<()>;
}

/// Maps job tags to operators
#[derive(Default, Clone)]
pub struct OperatorRegistry {
    operators: HashMap<JobTag, Arc<dyn StageOperator>>,
}

impl OperatorRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every runtime-owned operator
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(JobTag::Duplicate, Arc::new(DuplicateOperator));
        registry.register(JobTag::Balance, Arc::new(BalanceOperator));
        registry.register(JobTag::Shuffle, Arc::new(ShuffleOperator));
        registry.register(JobTag::Union, Arc::new(ConcatOperator));
        registry.register(JobTag::Aggregate, Arc::new(ConcatOperator));
        registry.register(JobTag::Limit, Arc::new(LimitOperator));
        registry.register(JobTag::OrderByLocal, Arc::new(SortOperator));
        registry.register(JobTag::OrderByGlobal, Arc::new(MergeOperator));
        registry.register(JobTag::DistinctLocal, Arc::new(DistinctOperator));
        registry.register(JobTag::DistinctGlobal, Arc::new(DistinctOperator));
        registry
    }

    /// Register or replace the operator for `tag`
    pub fn register(&mut self, tag: JobTag, operator: Arc<dyn StageOperator>) {
        self.operators.insert(tag, operator);
    }

    pub fn get(&self, tag: JobTag) -> Option<Arc<dyn StageOperator>> {
        self.operators.get(&tag).cloned()
    }

    pub fn contains(&self, tag: JobTag) -> bool {
        self.operators.contains_key(&tag)
    }
}

/// Copies every input row to every output
pub struct DuplicateOperator;

#[async_trait]
impl StageOperator for DuplicateOperator {
    async fn execute(&self, ctx: &mut StageContext) -> Result<()> {
        for i in 0..ctx.inputs.len() {
            while let Some(row) = ctx.inputs[i].read_row().await? {
                for output in ctx.outputs.iter_mut() {
                    output.write_row(row.clone()).await?;
                }
            }
        }
        Ok(())
    }
}

/// Deals rows round-robin across outputs
pub struct BalanceOperator;

#[async_trait]
impl StageOperator for BalanceOperator {
    async fn execute(&self, ctx: &mut StageContext) -> Result<()> {
        let mut next = 0usize;
        let outputs = ctx.outputs.len();
        for i in 0..ctx.inputs.len() {
            while let Some(row) = ctx.inputs[i].read_row().await? {
                ctx.output(next)?.write_row(row).await?;
                next = (next + 1) % outputs;
            }
        }
        Ok(())
    }
}

/// Routes each row to `hash(key values) % outputs`
pub struct ShuffleOperator;

impl ShuffleOperator {
    /// Output channel for a row; both join sides agree when their key values do
    pub fn route(row: &Row, key_columns: &[usize], outputs: usize) -> usize {
        let mut hasher = DefaultHasher::new();
        for &col in key_columns {
            row.vals.get(col).unwrap_or(&Value::Null).hash(&mut hasher);
        }
        (hasher.finish() as usize) % outputs.max(1)
    }
}

#[async_trait]
impl StageOperator for ShuffleOperator {
    async fn execute(&self, ctx: &mut StageContext) -> Result<()> {
        let key_columns = match &ctx.job.kind {
            JobKind::Shuffle { key_columns } => key_columns.clone(),
            other => return Err(wrong_kind("shuffle", other)),
        };
        let outputs = ctx.outputs.len();
        for i in 0..ctx.inputs.len() {
            while let Some(row) = ctx.inputs[i].read_row().await? {
                let target = Self::route(&row, &key_columns, outputs);
                ctx.output(target)?.write_row(row).await?;
            }
        }
        Ok(())
    }
}

/// Concatenates inputs in input order onto output 0
pub struct ConcatOperator;

#[async_trait]
impl StageOperator for ConcatOperator {
    async fn execute(&self, ctx: &mut StageContext) -> Result<()> {
        for i in 0..ctx.inputs.len() {
            while let Some(group) = ctx.inputs[i].read_group().await? {
                ctx.output(0)?.write_rows_group(group).await?;
            }
        }
        Ok(())
    }
}

/// Emits at most `count` rows, still draining every input
pub struct LimitOperator;

#[async_trait]
impl StageOperator for LimitOperator {
    async fn execute(&self, ctx: &mut StageContext) -> Result<()> {
        let count = match &ctx.job.kind {
            JobKind::Limit { count } => *count,
            other => return Err(wrong_kind("limit", other)),
        };
        let mut emitted = 0usize;
        for i in 0..ctx.inputs.len() {
            while let Some(row) = ctx.inputs[i].read_row().await? {
                if emitted < count {
                    ctx.output(0)?.write_row(row).await?;
                    emitted += 1;
                }
            }
        }
        Ok(())
    }
}

/// Compare two rows on `keys`; a missing column compares as null.
/// Sort keys index value columns; `row.keys` never takes part.
pub fn compare_rows(a: &Row, b: &Row, keys: &[SortKey]) -> Ordering {
    for key in keys {
        let left = a.vals.get(key.column).unwrap_or(&Value::Null);
        let right = b.vals.get(key.column).unwrap_or(&Value::Null);
        let ord = left.total_cmp(right);
        let ord = if key.ascending { ord } else { ord.reverse() };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

fn sort_keys(kind: &JobKind) -> Result<Vec<SortKey>> {
    match kind {
        JobKind::OrderByLocal { keys } | JobKind::OrderByGlobal { keys } => Ok(keys.clone()),
        other => Err(wrong_kind("order-by", other)),
    }
}

/// Stable sort of everything the job reads
pub struct SortOperator;

#[async_trait]
impl StageOperator for SortOperator {
    async fn execute(&self, ctx: &mut StageContext) -> Result<()> {
        let keys = sort_keys(&ctx.job.kind)?;
        let mut rows = Vec::new();
        for i in 0..ctx.inputs.len() {
            rows.extend(ctx.inputs[i].read_all().await?);
        }
        rows.sort_by(|a, b| compare_rows(a, b, &keys));
        let output = ctx.output(0)?;
        for row in rows {
            output.write_row(row).await?;
        }
        Ok(())
    }
}

/// Current head of one merge input
struct MergeEntry {
    row: Row,
    input: usize,
    keys: Arc<[SortKey]>,
}

impl PartialEq for MergeEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for MergeEntry {}

impl PartialOrd for MergeEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MergeEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_rows(&self.row, &other.row, &self.keys).then(self.input.cmp(&other.input))
    }
}

/// Streaming k-way merge of sorted inputs.
///
/// Holds one head row per live input and always emits the smallest; ties go
/// to the lower input index. An input is read again only after its head has
/// been emitted.
pub struct MergeOperator;

#[async_trait]
impl StageOperator for MergeOperator {
    async fn execute(&self, ctx: &mut StageContext) -> Result<()> {
        let keys: Arc<[SortKey]> = sort_keys(&ctx.job.kind)?.into();
        let mut heap = BinaryHeap::with_capacity(ctx.inputs.len());
        for input in 0..ctx.inputs.len() {
            if let Some(row) = ctx.inputs[input].read_row().await? {
                heap.push(Reverse(MergeEntry {
                    row,
                    input,
                    keys: keys.clone(),
                }));
            }
        }

        while let Some(Reverse(entry)) = heap.pop() {
            let input = entry.input;
            ctx.output(0)?.write_row(entry.row).await?;
            if let Some(row) = ctx.inputs[input].read_row().await? {
                heap.push(Reverse(MergeEntry {
                    row,
                    input,
                    keys: keys.clone(),
                }));
            }
        }
        Ok(())
    }
}

/// Emits the first occurrence of every distinct row, key columns included
pub struct DistinctOperator;

#[async_trait]
impl StageOperator for DistinctOperator {
    async fn execute(&self, ctx: &mut StageContext) -> Result<()> {
        let mut seen: HashSet<(Vec<Value>, Vec<Value>)> = HashSet::new();
        let mut duplicates = 0usize;
        for i in 0..ctx.inputs.len() {
            while let Some(row) = ctx.inputs[i].read_row().await? {
                if seen.insert((row.vals.clone(), row.keys.clone())) {
                    ctx.output(0)?.write_row(row).await?;
                } else {
                    duplicates += 1;
                }
            }
        }
        ctx.log(
            LogLevel::Info,
            format!("distinct kept {} rows, dropped {}", seen.len(), duplicates),
        );
        Ok(())
    }
}

fn wrong_kind(expected: &str, found: &JobKind) -> DistributedError {
    DistributedError::InvalidJob(format!(
        "{} operator cannot run a {} job",
        expected,
        found.tag()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ExecutorState;
    use crate::types::{Location, TaskId};
    use query_core::{DataType, Field, Schema};
    use tokio::io::DuplexStream;

    fn schema() -> Schema {
        Schema::new(vec![
            Field::new("k", DataType::Int64, false),
            Field::new("tag", DataType::Utf8, true),
        ])
    }

    fn row(k: i64, tag: &str) -> Row {
        Row::new(vec![Value::Int64(k), Value::Utf8(tag.to_string())])
    }

    async fn encoded(schema: &Schema, rows: &[Row]) -> Vec<u8> {
        let mut writer = RowsWriter::new(Vec::new(), schema.clone(), 2);
        for r in rows {
            writer.write_row(r.clone()).await.unwrap();
        }
        writer.close().await.unwrap();
        writer.into_inner()
    }

    /// Run `operator` over in-memory inputs and collect each output
    async fn run(operator: &dyn StageOperator, kind: JobKind, inputs: Vec<Vec<Row>>, outputs: usize) -> Vec<Vec<Row>> {
        run_with(schema(), operator, kind, inputs, outputs).await
    }

    async fn run_with(
        schema: Schema,
        operator: &dyn StageOperator,
        kind: JobKind,
        inputs: Vec<Vec<Row>>,
        outputs: usize,
    ) -> Vec<Vec<Row>> {
        let location = Location::new("w0-0", "127.0.0.1", 7000, 0);
        let job = StageJob {
            task_id: TaskId::new(),
            outputs: (0..outputs).map(|i| location.with_channel(i)).collect(),
            location,
            kind,
            inputs: vec![],
            schema: schema.clone(),
            payload: vec![],
        };

        let mut readers = Vec::new();
        for rows in &inputs {
            let bytes = encoded(&schema, rows).await;
            let source: Box<dyn AsyncRead + Send + Unpin> = Box::new(std::io::Cursor::new(bytes));
            readers.push(RowsReader::new(source, None));
        }

        let mut writers = Vec::new();
        let mut sinks: Vec<DuplexStream> = Vec::new();
        for _ in 0..outputs {
            let (near, far) = tokio::io::duplex(1 << 20);
            let sink: Box<dyn AsyncWrite + Send + Unpin> = Box::new(near);
            writers.push(RowsWriter::new(sink, schema.clone(), 3));
            sinks.push(far);
        }

        let mut ctx = StageContext::new(job, readers, writers, ExecutorState::shared());
        operator.execute(&mut ctx).await.unwrap();
        for writer in ctx.outputs.iter_mut() {
            writer.close().await.unwrap();
        }

        let mut results = Vec::new();
        for far in sinks {
            let mut reader = RowsReader::new(far, Some(schema.clone()));
            results.push(reader.read_all().await.unwrap());
        }
        results
    }

    #[tokio::test]
    async fn test_duplicate_copies_to_every_output() {
        let rows = vec![row(1, "a"), row(2, "b")];
        let out = run(&DuplicateOperator, JobKind::Duplicate, vec![rows.clone()], 3).await;
        assert_eq!(out.len(), 3);
        for o in out {
            assert_eq!(o, rows);
        }
    }

    #[tokio::test]
    async fn test_balance_round_robin() {
        let rows: Vec<Row> = (0..5).map(|k| row(k, "x")).collect();
        let out = run(&BalanceOperator, JobKind::Balance, vec![rows], 2).await;
        assert_eq!(out[0].len(), 3);
        assert_eq!(out[1].len(), 2);
    }

    #[tokio::test]
    async fn test_shuffle_routes_equal_keys_together() {
        let rows: Vec<Row> = (0..40).map(|k| row(k % 7, "x")).collect();
        let kind = JobKind::Shuffle { key_columns: vec![0] };
        let out = run(&ShuffleOperator, kind, vec![rows], 3).await;
        assert_eq!(out.iter().map(|o| o.len()).sum::<usize>(), 40);
        for (channel, rows) in out.iter().enumerate() {
            for r in rows {
                assert_eq!(ShuffleOperator::route(r, &[0], 3), channel);
            }
        }
    }

    #[tokio::test]
    async fn test_concat_keeps_input_order() {
        let out = run(
            &ConcatOperator,
            JobKind::Aggregate,
            vec![vec![row(2, "a")], vec![], vec![row(1, "b"), row(3, "c")]],
            1,
        )
        .await;
        assert_eq!(out[0], vec![row(2, "a"), row(1, "b"), row(3, "c")]);
    }

    #[tokio::test]
    async fn test_limit_caps_rows() {
        let out = run(
            &LimitOperator,
            JobKind::Limit { count: 3 },
            vec![vec![row(1, "a"), row(2, "b")], vec![row(3, "c"), row(4, "d")]],
            1,
        )
        .await;
        assert_eq!(out[0], vec![row(1, "a"), row(2, "b"), row(3, "c")]);
    }

    #[tokio::test]
    async fn test_sort_is_stable() {
        let kind = JobKind::OrderByLocal {
            keys: vec![SortKey::asc(0)],
        };
        let input = vec![row(2, "first"), row(1, "x"), row(2, "second"), row(0, "y")];
        let out = run(&SortOperator, kind, vec![input], 1).await;
        assert_eq!(
            out[0],
            vec![row(0, "y"), row(1, "x"), row(2, "first"), row(2, "second")]
        );
    }

    #[tokio::test]
    async fn test_merge_orders_across_inputs_with_ties_by_input() {
        let kind = JobKind::OrderByGlobal {
            keys: vec![SortKey::desc(0)],
        };
        let inputs = vec![
            vec![row(9, "a"), row(5, "a"), row(1, "a")],
            vec![row(8, "b"), row(5, "b")],
            vec![],
            vec![row(10, "d"), row(5, "d"), row(0, "d")],
        ];
        let out = run(&MergeOperator, kind, inputs, 1).await;
        let keys: Vec<i64> = out[0]
            .iter()
            .map(|r| match r.vals[0] {
                Value::Int64(k) => k,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(keys, vec![10, 9, 8, 5, 5, 5, 1, 0]);
        let tie_tags: Vec<&Value> = out[0][3..6].iter().map(|r| &r.vals[1]).collect();
        assert_eq!(
            tie_tags,
            vec![
                &Value::Utf8("a".to_string()),
                &Value::Utf8("b".to_string()),
                &Value::Utf8("d".to_string())
            ]
        );
    }

    #[tokio::test]
    async fn test_distinct_drops_repeats() {
        let out = run(
            &DistinctOperator,
            JobKind::DistinctGlobal,
            vec![vec![row(1, "a"), row(1, "a")], vec![row(1, "a"), row(2, "a")]],
            1,
        )
        .await;
        assert_eq!(out[0], vec![row(1, "a"), row(2, "a")]);
    }

    #[tokio::test]
    async fn test_distinct_compares_key_columns() {
        let keyed = Schema::with_keys(
            vec![Field::new("k", DataType::Int64, false)],
            vec![Field::new("part", DataType::Int64, false)],
        );
        let keyed_row = |k: i64, part: i64| Row::with_keys(vec![Value::Int64(k)], vec![Value::Int64(part)]);
        let out = run_with(
            keyed,
            &DistinctOperator,
            JobKind::DistinctGlobal,
            vec![vec![keyed_row(1, 10), keyed_row(1, 20), keyed_row(1, 10)]],
            1,
        )
        .await;
        assert_eq!(out[0], vec![keyed_row(1, 10), keyed_row(1, 20)]);
    }

    #[tokio::test]
    async fn test_sort_ignores_key_columns() {
        let keyed = Schema::with_keys(
            vec![Field::new("k", DataType::Int64, false)],
            vec![Field::new("part", DataType::Int64, false)],
        );
        let keyed_row = |k: i64, part: i64| Row::with_keys(vec![Value::Int64(k)], vec![Value::Int64(part)]);
        let out = run_with(
            keyed,
            &SortOperator,
            JobKind::OrderByLocal {
                keys: vec![SortKey::asc(0)],
            },
            vec![vec![keyed_row(2, 1), keyed_row(1, 9), keyed_row(1, 3)]],
            1,
        )
        .await;
        assert_eq!(out[0], vec![keyed_row(1, 9), keyed_row(1, 3), keyed_row(2, 1)]);
    }

    #[test]
    fn test_registry_builtins() {
        let registry = OperatorRegistry::with_builtins();
        assert!(registry.contains(JobTag::OrderByGlobal));
        assert!(registry.contains(JobTag::Aggregate));
        assert!(!registry.contains(JobTag::Scan));
        assert!(registry.get(JobTag::HashJoin).is_none());
    }
}
