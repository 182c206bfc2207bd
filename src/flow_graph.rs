//! A thin DAG façade over [`Scheduler`](crate::scheduler::Scheduler):
//! nodes are bags of reusable tasks, edges mean "run after", and a single
//! `start` dispatches roots and lets completions cascade through the
//! topology automatically.
//!
//! Node tasks are stored as `Fn(&TaskContext)` rather than the one-shot
//! [`WorkItem`](crate::work_item::WorkItem) used elsewhere, because a
//! graph's topology and task list survive across repeated `start` calls —
//! each run wraps every stored task in a fresh `WorkItem`.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tracing::trace;

use crate::sync::Semaphore;
use crate::task_context::TaskContext;
use crate::work_item::WorkItem;

pub type NodeId = u32;
pub type TaskId = u32;

type NodeTask = Arc<dyn Fn(&TaskContext) + Send + Sync>;

struct Node {
    tasks: Mutex<Vec<Option<NodeTask>>>,
    out_edges: Mutex<Vec<NodeId>>,
    /// Static in-degree, derived from `connect` calls; does not change
    /// across runs.
    in_degree: AtomicUsize,
    /// Per-run countdown of not-yet-completed predecessor nodes.
    pending_predecessors: AtomicUsize,
    /// Per-run countdown of this node's own not-yet-completed tasks.
    pending_tasks: AtomicUsize,
}

impl Node {
    fn new() -> Self {
        Self {
            tasks: Mutex::new(Vec::new()),
            out_edges: Mutex::new(Vec::new()),
            in_degree: AtomicUsize::new(0),
            pending_predecessors: AtomicUsize::new(0),
            pending_tasks: AtomicUsize::new(0),
        }
    }
}

struct Inner {
    group: u32,
    nodes: Mutex<Vec<Node>>,
    /// Tasks remaining across the whole graph for the current run.
    outstanding: AtomicI64,
    /// Guards against releasing `done` more than once per run.
    finished: AtomicBool,
    done: Semaphore,
}

/// A reusable DAG of task bags. See the module docs.
#[derive(Clone)]
pub struct FlowGraph {
    inner: Arc<Inner>,
}

impl FlowGraph {
    /// Build an empty graph whose tasks will be submitted into `group`.
    pub fn new(group: u32) -> Self {
        Self {
            inner: Arc::new(Inner {
                group,
                nodes: Mutex::new(Vec::new()),
                outstanding: AtomicI64::new(0),
                finished: AtomicBool::new(true),
                done: Semaphore::new(0),
            }),
        }
    }

    /// Declare a new, initially empty node; returns its id.
    pub fn create_node(&self) -> NodeId {
        let mut nodes = self.inner.nodes.lock().unwrap();
        nodes.push(Node::new());
        (nodes.len() - 1) as NodeId
    }

    /// Add a task to `node`, returning a [`TaskId`] that can later be
    /// passed to [`FlowGraph::remove`]. `work` is called once per `start`,
    /// not consumed across runs.
    pub fn add<F>(&self, node: NodeId, work: F) -> TaskId
    where
        F: Fn(&TaskContext) + Send + Sync + 'static,
    {
        let nodes = self.inner.nodes.lock().unwrap();
        let n = &nodes[node as usize];
        let mut tasks = n.tasks.lock().unwrap();
        let slot: NodeTask = Arc::new(work);
        if let Some((idx, free)) = tasks.iter_mut().enumerate().find(|(_, t)| t.is_none()) {
            *free = Some(slot);
            idx as TaskId
        } else {
            tasks.push(Some(slot));
            (tasks.len() - 1) as TaskId
        }
    }

    /// Free `task`'s slot in `node` for reuse by a future `add`. A no-op if
    /// the slot is already empty.
    pub fn remove(&self, node: NodeId, task: TaskId) {
        let nodes = self.inner.nodes.lock().unwrap();
        let n = &nodes[node as usize];
        let mut tasks = n.tasks.lock().unwrap();
        if let Some(slot) = tasks.get_mut(task as usize) {
            *slot = None;
        }
    }

    /// Add an edge meaning "`to` may not start until every task in `from`
    /// has completed".
    pub fn connect(&self, from: NodeId, to: NodeId) {
        let nodes = self.inner.nodes.lock().unwrap();
        nodes[from as usize].out_edges.lock().unwrap().push(to);
        nodes[to as usize].in_degree.fetch_add(1, Ordering::Relaxed);
    }

    /// Reset per-run counters and submit every root node's (zero
    /// in-degree) tasks. Completions cascade through the topology
    /// automatically; call [`FlowGraph::wait`] or
    /// [`FlowGraph::cooperative_wait`] to block until the whole graph has
    /// finished.
    pub fn start(&self, ctx: &TaskContext) {
        let nodes = self.inner.nodes.lock().unwrap();

        let total: i64 = nodes
            .iter()
            .map(|n| n.tasks.lock().unwrap().iter().filter(|t| t.is_some()).count() as i64)
            .sum();
        self.inner.outstanding.store(total, Ordering::Release);
        self.inner.finished.store(false, Ordering::Release);

        for node in nodes.iter() {
            node.pending_predecessors
                .store(node.in_degree.load(Ordering::Relaxed), Ordering::Release);
        }

        let roots: Vec<NodeId> = nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.pending_predecessors.load(Ordering::Acquire) == 0)
            .map(|(i, _)| i as NodeId)
            .collect();
        drop(nodes);

        for root in roots {
            submit_node(&self.inner, root, ctx);
        }
        maybe_finish(&self.inner);
    }

    /// Block the calling thread until the current run has completed.
    pub fn wait(&self) {
        self.inner.done.acquire();
    }

    /// Like [`FlowGraph::wait`], but steals and executes other tasks while
    /// waiting instead of blocking the OS thread.
    pub fn cooperative_wait(&self, ctx: &TaskContext) {
        ctx.busy_wait(&self.inner.done);
    }
}

fn submit_node(inner: &Arc<Inner>, node_id: NodeId, ctx: &TaskContext) {
    let nodes = inner.nodes.lock().unwrap();
    let node_tasks: Vec<NodeTask> = nodes[node_id as usize]
        .tasks
        .lock()
        .unwrap()
        .iter()
        .filter_map(|t| t.clone())
        .collect();
    nodes[node_id as usize]
        .pending_tasks
        .store(node_tasks.len(), Ordering::Release);
    drop(nodes);

    trace!(node_id, task_count = node_tasks.len(), "flow graph node starting");

    if node_tasks.is_empty() {
        on_node_complete(inner, node_id, ctx);
        return;
    }

    for task in node_tasks {
        let inner2 = Arc::clone(inner);
        let work = WorkItem::new(move |inner_ctx| {
            task.as_ref()(inner_ctx);
            on_task_complete(&inner2, node_id, inner_ctx);
        });
        let _ = ctx.submit(inner.group, work);
    }
}

fn on_task_complete(inner: &Arc<Inner>, node_id: NodeId, ctx: &TaskContext) {
    let nodes = inner.nodes.lock().unwrap();
    let node_done = nodes[node_id as usize]
        .pending_tasks
        .fetch_sub(1, Ordering::AcqRel)
        == 1;
    drop(nodes);

    if node_done {
        on_node_complete(inner, node_id, ctx);
    }
    inner.outstanding.fetch_sub(1, Ordering::Release);
    maybe_finish(inner);
}

fn on_node_complete(inner: &Arc<Inner>, node_id: NodeId, ctx: &TaskContext) {
    let nodes = inner.nodes.lock().unwrap();
    let successors = nodes[node_id as usize].out_edges.lock().unwrap().clone();
    let ready: Vec<NodeId> = successors
        .into_iter()
        .filter(|&succ| {
            nodes[succ as usize]
                .pending_predecessors
                .fetch_sub(1, Ordering::AcqRel)
                == 1
        })
        .collect();
    drop(nodes);
    for succ in ready {
        submit_node(inner, succ, ctx);
    }
}

fn maybe_finish(inner: &Arc<Inner>) {
    if inner.outstanding.load(Ordering::Acquire) <= 0
        && !inner.finished.swap(true, Ordering::AcqRel)
    {
        inner.done.release();
    }
}
