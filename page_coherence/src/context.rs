//! Who is calling, and in what cluster state.
//!
//! [`WorkerContext`] is the per-worker state that is passed explicitly through
//! every call: which buffer this worker has an IO claim on, and where its
//! client-visible output goes. [`NodeState`] is the shared view of this
//! instance's role in the cluster. [`ContextBuilder`] combines the two into the
//! [`RequestContext`] sent with each directory call.

use std::sync::atomic::{AtomicBool, Ordering};

use atomic_enum::atomic_enum;
use zerocopy::IntoBytes;

use crate::types::{BufferId, BufferTag, PAGEID_SIZE};

/// Identity of a worker, unique within this instance. Equal to its session id.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct WorkerId(pub u32);

/// What a worker thread is doing. Redo, startup and reform workers run on
/// behalf of recovery; the directory gives their requests priority.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WorkerKind {
    Backend,
    PageRedo,
    Startup,
    ReformProc,
    Auxiliary,
}

impl WorkerKind {
    pub fn is_recovery(self) -> bool {
        matches!(
            self,
            WorkerKind::PageRedo | WorkerKind::Startup | WorkerKind::ReformProc
        )
    }
}

/// Where client-visible messages of the current worker go.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OutputDest {
    None,
    Remote,
}

pub struct WorkerContext {
    pub kind: WorkerKind,
    /// Logical thread id of the worker's proc. Workers without a proc use
    /// `logical_tid` instead.
    pub proc_logical_tid: Option<u32>,
    pub logical_tid: u32,
    /// Buffer on which this worker currently holds the IO claim.
    pub in_progress_buf: Option<BufferId>,
    pub is_for_input: bool,
    pub output: OutputDest,
}

impl WorkerContext {
    pub fn backend(proc_logical_tid: u32) -> Self {
        WorkerContext {
            kind: WorkerKind::Backend,
            proc_logical_tid: Some(proc_logical_tid),
            logical_tid: proc_logical_tid,
            in_progress_buf: None,
            is_for_input: false,
            output: OutputDest::Remote,
        }
    }

    pub fn new(kind: WorkerKind, logical_tid: u32, proc_logical_tid: Option<u32>) -> Self {
        WorkerContext {
            kind,
            proc_logical_tid,
            logical_tid,
            in_progress_buf: None,
            is_for_input: false,
            output: OutputDest::None,
        }
    }

    /// Proc threads get ids `[0, total_procs)`; threads without a proc are
    /// placed above that range.
    pub fn session_id(&self, total_procs: u32) -> u32 {
        match self.proc_logical_tid {
            Some(tid) => tid,
            None => self.logical_tid + total_procs,
        }
    }
}

#[atomic_enum]
#[derive(Eq, PartialEq)]
pub enum InstanceRole {
    Primary,
    Standby,
}

/// This instance's view of the cluster.
pub struct NodeState {
    role: AtomicInstanceRole,
    in_reform: AtomicBool,
    failover_triggered: AtomicBool,
    in_failover: AtomicBool,
    recovery_in_progress: AtomicBool,
}

impl NodeState {
    pub fn new(role: InstanceRole) -> Self {
        NodeState {
            role: AtomicInstanceRole::new(role),
            in_reform: AtomicBool::new(false),
            failover_triggered: AtomicBool::new(false),
            in_failover: AtomicBool::new(false),
            recovery_in_progress: AtomicBool::new(false),
        }
    }

    pub fn role(&self) -> InstanceRole {
        self.role.load(Ordering::Acquire)
    }

    pub fn set_role(&self, role: InstanceRole) {
        self.role.store(role, Ordering::Release);
    }

    pub fn set_in_reform(&self, v: bool) {
        self.in_reform.store(v, Ordering::Release);
    }

    pub fn set_failover_triggered(&self, v: bool) {
        self.failover_triggered.store(v, Ordering::Release);
    }

    pub fn set_in_failover(&self, v: bool) {
        self.in_failover.store(v, Ordering::Release);
    }

    pub fn set_recovery_in_progress(&self, v: bool) {
        self.recovery_in_progress.store(v, Ordering::Release);
    }

    pub fn is_primary(&self) -> bool {
        self.role() == InstanceRole::Primary
    }

    /// Primary that is not in the middle of a reform.
    pub fn is_normal_primary(&self) -> bool {
        self.is_primary() && !self.in_reform.load(Ordering::Acquire)
    }

    pub fn failover_triggered(&self) -> bool {
        self.failover_triggered.load(Ordering::Acquire)
    }

    pub fn in_failover(&self) -> bool {
        self.in_failover.load(Ordering::Acquire)
    }

    pub fn recovery_in_progress(&self) -> bool {
        self.recovery_in_progress.load(Ordering::Acquire)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ResourceType {
    Page,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ResourceId {
    pub kind: ResourceType,
    pub bytes: [u8; PAGEID_SIZE],
}

impl ResourceId {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Context of a single directory call. Built fresh for each call.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RequestContext {
    pub inst_id: u8,
    pub sess_id: u32,
    /// Handle of the calling proc, if it has one.
    pub db_handle: Option<u32>,
    pub sess_rcy: bool,
    pub is_try: bool,
    pub resource: Option<ResourceId>,
}

#[derive(Clone, Copy, Debug)]
pub struct ContextBuilder {
    pub instance_id: u8,
    pub total_procs: u32,
}

impl ContextBuilder {
    pub fn new(instance_id: u8, total_procs: u32) -> Self {
        ContextBuilder {
            instance_id,
            total_procs,
        }
    }

    pub fn build(&self, worker: &WorkerContext) -> RequestContext {
        RequestContext {
            inst_id: self.instance_id,
            sess_id: worker.session_id(self.total_procs),
            db_handle: worker.proc_logical_tid,
            sess_rcy: worker.kind.is_recovery(),
            is_try: false,
            resource: None,
        }
    }

    pub fn build_for_page(&self, worker: &WorkerContext, tag: &BufferTag) -> RequestContext {
        let mut bytes = [0u8; PAGEID_SIZE];
        bytes.copy_from_slice(tag.as_bytes());
        RequestContext {
            resource: Some(ResourceId {
                kind: ResourceType::Page,
                bytes,
            }),
            ..self.build(worker)
        }
    }
}
