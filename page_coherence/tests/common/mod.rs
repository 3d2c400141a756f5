#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::process::Command;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use page_coherence::buffer_io::BufferCoherence;
use page_coherence::context::{InstanceRole, NodeState, RequestContext, WorkerContext};
use page_coherence::control_table::{BufferCtrl, ControlTable};
use page_coherence::directory::{Directory, DirectoryError, LockRequestKind, PageGrant};
use page_coherence::lock_mode::BufLockMode;
use page_coherence::logging::{self, LogFormat, Output};
use page_coherence::page::Page;
use page_coherence::storage::{LocalStorage, ReadTarget, StorageError};
use page_coherence::types::{BufferId, BufferTag, Lsn, ReadBufferMode, SegPageLocation};
use page_coherence::CoherenceConf;
use parking_lot::Mutex;

pub const SPC_OID: u32 = 1663;
pub const DB_OID: u32 = 5;
pub const REL_OID: u32 = 16384;

const FATAL_CHILD_ENV: &str = "PAGE_COHERENCE_FATAL_CHILD";

/// Run `body` in a child copy of this test binary and assert that it aborts
/// after logging `expected`.
///
/// `test_name` must be the name of the calling test, so the child runs only
/// that test. In the child, the helper installs a subscriber on stderr and
/// runs `body`, which must not return.
pub fn assert_aborts(test_name: &str, expected: &str, body: impl FnOnce()) {
    if std::env::var_os(FATAL_CHILD_ENV).is_some() {
        logging::init(LogFormat::Plain, Output::Stderr).unwrap();
        body();
        panic!("{test_name} returned instead of aborting");
    }

    let output = Command::new(std::env::current_exe().unwrap())
        .args([test_name, "--exact", "--nocapture", "--test-threads=1"])
        .env(FATAL_CHILD_ENV, "1")
        .output()
        .unwrap();
    let stderr = String::from_utf8_lossy(&output.stderr);

    assert!(!output.status.success(), "{test_name} succeeded: {stderr}");
    // a panic exits with 101, an abort is killed by SIGABRT
    assert_eq!(output.status.code(), None, "{test_name} did not abort: {stderr}");
    assert!(stderr.contains("Fatal consistency error"), "{stderr}");
    assert!(stderr.contains(expected), "{stderr}");
}

pub fn rel_tag(block_number: u32) -> BufferTag {
    BufferTag {
        spc_oid: SPC_OID,
        db_oid: DB_OID,
        rel_number: REL_OID,
        bucket_node: -1,
        fork_number: 0,
        block_number,
    }
}

pub fn seg_tag(block_number: u32) -> BufferTag {
    BufferTag {
        bucket_node: 0,
        ..rel_tag(block_number)
    }
}

/// Ownership directory that answers from scripted queues.
///
/// Page requests, releases and rebuilds are recorded. An empty queue answers
/// with success.
#[derive(Default)]
pub struct FakeDirectory {
    pub grants: Mutex<VecDeque<Result<PageGrant, DirectoryError>>>,
    pub releases: Mutex<VecDeque<Result<bool, DirectoryError>>>,
    pub rebuild_result: Mutex<Option<DirectoryError>>,
    /// How long each page request blocks.
    pub request_delay: Mutex<Duration>,

    pub requests: Mutex<Vec<(RequestContext, BufferCtrl, BufLockMode)>>,
    pub released: Mutex<Vec<BufferCtrl>>,
    pub rebuilds: Mutex<Vec<(BufferCtrl, Lsn, bool)>>,
}

impl FakeDirectory {
    pub fn push_grant(&self, grant: Result<PageGrant, DirectoryError>) {
        self.grants.lock().push_back(grant);
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }
}

impl Directory for FakeDirectory {
    fn request_page(
        &self,
        ctx: &RequestContext,
        ctrl: &BufferCtrl,
        mode: BufLockMode,
    ) -> Result<PageGrant, DirectoryError> {
        self.requests.lock().push((ctx.clone(), *ctrl, mode));
        let delay = *self.request_delay.lock();
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        self.grants
            .lock()
            .pop_front()
            .unwrap_or(Ok(PageGrant::default()))
    }

    fn release_ownership(
        &self,
        _ctx: &RequestContext,
        ctrl: &BufferCtrl,
    ) -> Result<bool, DirectoryError> {
        self.released.lock().push(*ctrl);
        self.releases.lock().pop_front().unwrap_or(Ok(true))
    }

    fn rebuild_ownership(
        &self,
        _ctx: &RequestContext,
        ctrl: &BufferCtrl,
        lsn: Lsn,
        is_dirty: bool,
    ) -> Result<(), DirectoryError> {
        self.rebuilds.lock().push((*ctrl, lsn, is_dirty));
        match *self.rebuild_result.lock() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn broadcast(
        &self,
        _ctx: &RequestContext,
        _payload: &[u8],
        _flush: bool,
        _timeout: Duration,
        _kind: LockRequestKind,
    ) -> Result<(), DirectoryError> {
        Ok(())
    }
}

/// In-memory buffer pool backed by an in-memory "disk" of page LSNs.
pub struct FakeStorage {
    tags: Vec<BufferTag>,
    pages: Vec<Mutex<Page>>,
    /// LSN of the on-disk copy of each page. Missing pages read as new.
    pub disk: Mutex<HashMap<BufferTag, Lsn>>,
    pub nblocks: Mutex<u32>,
    pub seg_locations: Mutex<HashMap<BufferTag, SegPageLocation>>,
    pub fail_reads: AtomicBool,

    pub reads: Mutex<Vec<(BufferId, ReadBufferMode, ReadTarget)>>,
    pub verification_reads: Mutex<usize>,
    /// (logical thread id, buffer) pairs holding the content lock.
    pub content_locks: Mutex<HashSet<(u32, BufferId)>>,
    pub lock_calls: Mutex<usize>,
    pub invalidated: Mutex<Vec<BufferId>>,
}

impl FakeStorage {
    pub fn new(tags: Vec<BufferTag>) -> Self {
        let pages = tags.iter().map(|_| Mutex::new(Page::default())).collect();
        FakeStorage {
            tags,
            pages,
            disk: Mutex::new(HashMap::new()),
            nblocks: Mutex::new(0),
            seg_locations: Mutex::new(HashMap::new()),
            fail_reads: AtomicBool::new(false),
            reads: Mutex::new(Vec::new()),
            verification_reads: Mutex::new(0),
            content_locks: Mutex::new(HashSet::new()),
            lock_calls: Mutex::new(0),
            invalidated: Mutex::new(Vec::new()),
        }
    }

    /// Put an initialized page with `lsn` into the buffer, as a transfer from
    /// another instance would.
    pub fn put_page(&self, buf: BufferId, lsn: Lsn) {
        self.pages[buf.index()].lock().init(lsn);
    }

    pub fn set_disk_lsn(&self, buf: BufferId, lsn: Lsn) {
        self.disk.lock().insert(self.tags[buf.index()], lsn);
    }

    fn disk_page(&self, tag: &BufferTag, dst: &mut Page) {
        match self.disk.lock().get(tag) {
            Some(&lsn) => dst.init(lsn),
            None => dst.zero(),
        }
    }
}

impl LocalStorage for FakeStorage {
    fn buffer_tag(&self, buf: BufferId) -> BufferTag {
        self.tags[buf.index()]
    }

    fn page(&self, buf: BufferId) -> &Mutex<Page> {
        &self.pages[buf.index()]
    }

    fn read_page(
        &self,
        buf: BufferId,
        tag: &BufferTag,
        mode: ReadBufferMode,
        target: ReadTarget,
    ) -> Result<(), StorageError> {
        self.reads.lock().push((buf, mode, target));
        if self.fail_reads.load(Ordering::Relaxed) {
            return Err(StorageError::InvalidPage(*tag));
        }
        self.disk_page(tag, &mut self.pages[buf.index()].lock());
        Ok(())
    }

    fn read_page_for_verification(
        &self,
        tag: &BufferTag,
        _target: ReadTarget,
        dst: &mut Page,
    ) -> Result<(), StorageError> {
        *self.verification_reads.lock() += 1;
        self.disk_page(tag, dst);
        Ok(())
    }

    fn relation_nblocks(&self, _tag: &BufferTag) -> u32 {
        *self.nblocks.lock()
    }

    fn segment_location(&self, tag: &BufferTag) -> Option<SegPageLocation> {
        self.seg_locations.lock().get(tag).copied()
    }

    fn invalidate_buffer(&self, buf: BufferId) {
        self.pages[buf.index()].lock().zero();
        self.invalidated.lock().push(buf);
    }

    fn content_lock_held(&self, worker: &WorkerContext, buf: BufferId) -> bool {
        self.content_locks
            .lock()
            .contains(&(worker.logical_tid, buf))
    }

    fn lock_content_exclusive(&self, worker: &WorkerContext, buf: BufferId) {
        *self.lock_calls.lock() += 1;
        self.content_locks.lock().insert((worker.logical_tid, buf));
    }
}

/// A control table, a primary node, and fakes for both collaborators.
pub struct Harness {
    pub conf: CoherenceConf,
    pub table: ControlTable,
    pub node: Arc<NodeState>,
    pub directory: Arc<FakeDirectory>,
    pub storage: Arc<FakeStorage>,
}

impl Harness {
    pub fn new(tags: Vec<BufferTag>) -> Self {
        let conf = CoherenceConf {
            buffer_count: tags.len(),
            verify_page_lsn: true,
            ..Default::default()
        };
        Harness {
            table: ControlTable::new(conf.buffer_count),
            conf,
            node: Arc::new(NodeState::new(InstanceRole::Primary)),
            directory: Arc::new(FakeDirectory::default()),
            storage: Arc::new(FakeStorage::new(tags)),
        }
    }

    /// One relation buffer per block number `0..n`.
    pub fn with_relation_buffers(n: u32) -> Self {
        Self::new((0..n).map(rel_tag).collect())
    }

    pub fn coherence(&self) -> BufferCoherence<'_, FakeDirectory, FakeStorage> {
        BufferCoherence::new(
            &self.conf,
            &self.table,
            Arc::clone(&self.node),
            Arc::clone(&self.directory),
            Arc::clone(&self.storage),
        )
    }
}
