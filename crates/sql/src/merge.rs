//! Merge-operator interpreter for cross-partition results.
//!
//! The executor feeds per-partition pages in with [`Merger::provide`] and
//! pulls merged rows out with [`Merger::next`]. When the merger cannot make
//! progress it names the streams it is waiting on.

use crate::ast::{AggregateKind, SortOrder};
use crate::json::{canonical, canonical_key, compare, number_value};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::sync::Arc;

/// Field names of the rewritten ORDER BY projection.
pub const ORDER_BY_ITEMS: &str = "orderByItems";
pub const PAYLOAD: &str = "payload";

/// Where a grouped output field comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputField {
    Key(usize),
    Aggregate(usize),
}

#[derive(Debug, Clone, PartialEq)]
pub enum GroupOutput {
    /// `SELECT VALUE <field>`
    Value(OutputField),
    /// Named fields, in projection order.
    Object(Vec<(String, OutputField)>),
}

/// Partial rows look like `{"g0": .., "a0": ..}`; AVG partials are
/// `{"sum": .., "count": ..}`.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupSpec {
    pub keys: usize,
    pub aggregates: Vec<AggregateKind>,
    pub output: GroupOutput,
}

pub fn group_key_field(i: usize) -> String {
    format!("g{}", i)
}

pub fn aggregate_field(i: usize) -> String {
    format!("a{}", i)
}

#[derive(Debug, Clone, PartialEq)]
pub enum MergeOp {
    /// k-way merge of per-partition sorted streams. Rows carry
    /// `orderByItems` and `payload`; the payload is emitted.
    SortedMerge { orders: Vec<SortOrder> },
    GroupFold(GroupSpec),
    DistinctFold,
    OffsetLimit { offset: u64, limit: Option<u64> },
}

#[derive(Debug, Clone, PartialEq)]
pub enum MergeStep {
    Row(Value),
    /// No row can be produced until these streams receive data.
    Pending(Vec<usize>),
    Done,
}

#[derive(Debug)]
struct Entry {
    key: Vec<Option<Value>>,
    row: Value,
}

#[derive(Debug, Default)]
struct Stream {
    buffer: VecDeque<Entry>,
    exhausted: bool,
    /// The stream's current head sits in the merge heap.
    staged: bool,
}

/// Head of one sorted stream. The heap pops the smallest key first and
/// breaks ties by the lower stream index.
#[derive(Debug)]
struct Head {
    entry: Entry,
    stream: usize,
    orders: Arc<[SortOrder]>,
}

impl Ord for Head {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_keys(&other.entry.key, &self.entry.key, &self.orders)
            .then_with(|| other.stream.cmp(&self.stream))
    }
}

impl PartialOrd for Head {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Head {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Head {}

#[derive(Debug, Clone)]
enum Accumulator {
    Count(f64),
    Sum { total: f64, valid: bool },
    Min(Option<Value>),
    Max(Option<Value>),
    Avg { sum: f64, count: f64 },
}

impl Accumulator {
    fn new(kind: AggregateKind) -> Self {
        match kind {
            AggregateKind::Count => Self::Count(0.0),
            AggregateKind::Sum => Self::Sum {
                total: 0.0,
                valid: true,
            },
            AggregateKind::Min => Self::Min(None),
            AggregateKind::Max => Self::Max(None),
            AggregateKind::Avg => Self::Avg {
                sum: 0.0,
                count: 0.0,
            },
        }
    }

    fn fold(&mut self, partial: Option<&Value>) {
        match self {
            Self::Count(total) => {
                if let Some(n) = partial.and_then(Value::as_f64) {
                    *total += n;
                }
            }
            Self::Sum { total, valid } => match partial {
                Some(Value::Number(n)) => *total += n.as_f64().unwrap_or(0.0),
                Some(_) => *valid = false,
                None => {}
            },
            Self::Min(current) => {
                if let Some(v) = partial {
                    if current
                        .as_ref()
                        .map_or(true, |c| compare(Some(v), Some(c)) == Ordering::Less)
                    {
                        *current = Some(v.clone());
                    }
                }
            }
            Self::Max(current) => {
                if let Some(v) = partial {
                    if current
                        .as_ref()
                        .map_or(true, |c| compare(Some(v), Some(c)) == Ordering::Greater)
                    {
                        *current = Some(v.clone());
                    }
                }
            }
            Self::Avg { sum, count } => {
                let s = partial.and_then(|p| p.get("sum")).and_then(Value::as_f64);
                let c = partial.and_then(|p| p.get("count")).and_then(Value::as_f64);
                if let (Some(s), Some(c)) = (s, c) {
                    *sum += s;
                    *count += c;
                }
            }
        }
    }

    fn finish(&self) -> Option<Value> {
        match self {
            Self::Count(total) => number_value(*total),
            Self::Sum { total, valid } => valid.then(|| number_value(*total)).flatten(),
            Self::Min(v) | Self::Max(v) => v.clone(),
            Self::Avg { sum, count } => {
                if *count > 0.0 {
                    number_value(sum / count)
                } else {
                    None
                }
            }
        }
    }
}

#[derive(Debug)]
struct GroupState {
    spec: GroupSpec,
    groups: Vec<(Vec<Option<Value>>, Vec<Accumulator>)>,
    index: HashMap<String, usize>,
}

impl GroupState {
    fn new(spec: GroupSpec) -> Self {
        Self {
            spec,
            groups: Vec::new(),
            index: HashMap::new(),
        }
    }

    fn fold(&mut self, row: &Value) {
        let keys: Vec<Option<Value>> = (0..self.spec.keys)
            .map(|i| row.get(group_key_field(i)).cloned())
            .collect();
        let id = keys
            .iter()
            .map(|k| canonical_key(k.as_ref()))
            .collect::<Vec<_>>()
            .join("\u{1f}");
        let slot = match self.index.get(&id) {
            Some(&slot) => slot,
            None => {
                let accs = self.spec.aggregates.iter().map(|k| Accumulator::new(*k)).collect();
                self.groups.push((keys, accs));
                self.index.insert(id, self.groups.len() - 1);
                self.groups.len() - 1
            }
        };
        let accs = &mut self.groups[slot].1;
        for (j, acc) in accs.iter_mut().enumerate() {
            acc.fold(row.get(aggregate_field(j)));
        }
    }

    fn finish(mut self) -> VecDeque<Value> {
        // A query with no GROUP BY yields one row even over empty input.
        if self.spec.keys == 0 && self.groups.is_empty() {
            let accs = self.spec.aggregates.iter().map(|k| Accumulator::new(*k)).collect();
            self.groups.push((Vec::new(), accs));
        }
        let field = |keys: &[Option<Value>], accs: &[Accumulator], f: OutputField| match f {
            OutputField::Key(i) => keys.get(i).cloned().flatten(),
            OutputField::Aggregate(j) => accs.get(j).and_then(Accumulator::finish),
        };
        let mut out = VecDeque::with_capacity(self.groups.len());
        for (keys, accs) in &self.groups {
            match &self.spec.output {
                GroupOutput::Value(f) => {
                    if let Some(v) = field(keys.as_slice(), accs.as_slice(), *f) {
                        out.push_back(v);
                    }
                }
                GroupOutput::Object(fields) => {
                    let mut map = Map::new();
                    for (name, f) in fields {
                        if let Some(v) = field(keys.as_slice(), accs.as_slice(), *f) {
                            map.insert(name.clone(), v);
                        }
                    }
                    out.push_back(Value::Object(map));
                }
            }
        }
        out
    }
}

/// Interpreter state for one query.
#[derive(Debug)]
pub struct Merger {
    streams: Vec<Stream>,
    orders: Option<Arc<[SortOrder]>>,
    heads: BinaryHeap<Head>,
    group: Option<GroupState>,
    grouped: Option<VecDeque<Value>>,
    distinct: Option<HashSet<String>>,
    skip: u64,
    remaining: Option<u64>,
    cursor: usize,
    done: bool,
}

impl Merger {
    pub fn new(ops: Vec<MergeOp>, streams: usize) -> Self {
        let mut merger = Self {
            streams: (0..streams).map(|_| Stream::default()).collect(),
            orders: None,
            heads: BinaryHeap::new(),
            group: None,
            grouped: None,
            distinct: None,
            skip: 0,
            remaining: None,
            cursor: 0,
            done: false,
        };
        for op in ops {
            match op {
                MergeOp::SortedMerge { orders } => merger.orders = Some(orders.into()),
                MergeOp::GroupFold(spec) => merger.group = Some(GroupState::new(spec)),
                MergeOp::DistinctFold => merger.distinct = Some(HashSet::new()),
                MergeOp::OffsetLimit { offset, limit } => {
                    merger.skip = offset;
                    merger.remaining = limit;
                }
            }
        }
        merger
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// Register a new input, e.g. a child range after a split.
    pub fn add_stream(&mut self) -> usize {
        self.streams.push(Stream::default());
        self.streams.len() - 1
    }

    /// Append a page of rows to `stream`.
    pub fn provide(&mut self, stream: usize, rows: Vec<Value>, exhausted: bool) {
        let orders = self.orders.as_ref().map(|o| o.len());
        let Some(s) = self.streams.get_mut(stream) else {
            return;
        };
        for row in rows {
            let key = match orders {
                Some(n) => sort_key(&row, n),
                None => Vec::new(),
            };
            s.buffer.push_back(Entry { key, row });
        }
        s.exhausted |= exhausted;
    }

    /// Stop expecting input from `stream`; rows already buffered are still merged.
    pub fn retire(&mut self, stream: usize) {
        if let Some(s) = self.streams.get_mut(stream) {
            s.exhausted = true;
        }
    }

    pub fn buffered(&self, stream: usize) -> usize {
        self.streams
            .get(stream)
            .map_or(0, |s| s.buffer.len() + usize::from(s.staged))
    }

    pub fn is_exhausted(&self, stream: usize) -> bool {
        self.streams.get(stream).map_or(true, |s| s.exhausted)
    }

    /// True once no further rows will be produced.
    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn next(&mut self) -> MergeStep {
        loop {
            if self.done {
                return MergeStep::Done;
            }
            if self.remaining == Some(0) {
                self.done = true;
                return MergeStep::Done;
            }

            let row = match self.pull() {
                MergeStep::Row(row) => row,
                MergeStep::Done => {
                    self.done = true;
                    return MergeStep::Done;
                }
                pending => return pending,
            };

            if let Some(seen) = self.distinct.as_mut() {
                if !seen.insert(canonical(&row)) {
                    continue;
                }
            }
            if self.skip > 0 {
                self.skip -= 1;
                continue;
            }
            if let Some(r) = self.remaining.as_mut() {
                *r -= 1;
            }
            return MergeStep::Row(row);
        }
    }

    fn pull(&mut self) -> MergeStep {
        if self.group.is_some() || self.grouped.is_some() {
            return self.pull_grouped();
        }
        if self.orders.is_some() {
            return self.pull_sorted();
        }
        self.pull_unordered()
    }

    fn starved(&self) -> Vec<usize> {
        self.streams
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.exhausted && !s.staged && s.buffer.is_empty())
            .map(|(i, _)| i)
            .collect()
    }

    fn pull_grouped(&mut self) -> MergeStep {
        if let Some(out) = self.grouped.as_mut() {
            return out.pop_front().map_or(MergeStep::Done, MergeStep::Row);
        }
        if let Some(group) = self.group.as_mut() {
            for s in &mut self.streams {
                for entry in s.buffer.drain(..) {
                    group.fold(&entry.row);
                }
            }
        }
        let starved = self.starved();
        if !starved.is_empty() {
            return MergeStep::Pending(starved);
        }
        if let Some(group) = self.group.take() {
            self.grouped = Some(group.finish());
        }
        self.pull_grouped()
    }

    /// Move the front row of every stream without a staged head into the heap.
    fn stage_heads(&mut self) {
        let Some(orders) = self.orders.clone() else {
            return;
        };
        for (i, s) in self.streams.iter_mut().enumerate() {
            if s.staged {
                continue;
            }
            if let Some(entry) = s.buffer.pop_front() {
                s.staged = true;
                self.heads.push(Head {
                    entry,
                    stream: i,
                    orders: orders.clone(),
                });
            }
        }
    }

    fn pull_sorted(&mut self) -> MergeStep {
        loop {
            self.stage_heads();
            let starved = self.starved();
            if !starved.is_empty() {
                return MergeStep::Pending(starved);
            }
            let Some(head) = self.heads.pop() else {
                return MergeStep::Done;
            };
            if let Some(s) = self.streams.get_mut(head.stream) {
                s.staged = false;
            }
            // A VALUE projection that evaluated to undefined has no payload.
            if let Value::Object(mut row) = head.entry.row {
                if let Some(payload) = row.remove(PAYLOAD) {
                    return MergeStep::Row(payload);
                }
            }
        }
    }

    fn pull_unordered(&mut self) -> MergeStep {
        let n = self.streams.len();
        for step in 0..n {
            let i = (self.cursor + step) % n;
            if let Some(entry) = self.streams[i].buffer.pop_front() {
                self.cursor = (i + 1) % n;
                return MergeStep::Row(entry.row);
            }
        }
        let starved = self.starved();
        if starved.is_empty() {
            MergeStep::Done
        } else {
            MergeStep::Pending(starved)
        }
    }
}

fn sort_key(row: &Value, n: usize) -> Vec<Option<Value>> {
    let items = row.get(ORDER_BY_ITEMS).and_then(Value::as_array);
    (0..n)
        .map(|i| {
            items
                .and_then(|items| items.get(i))
                .and_then(|item| item.get("item"))
                .cloned()
        })
        .collect()
}

fn compare_keys(a: &[Option<Value>], b: &[Option<Value>], orders: &[SortOrder]) -> Ordering {
    for (i, (l, r)) in a.iter().zip(b).enumerate() {
        let ord = compare(l.as_ref(), r.as_ref());
        let ord = match orders.get(i) {
            Some(SortOrder::Descending) => ord.reverse(),
            _ => ord,
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}
