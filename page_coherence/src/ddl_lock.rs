//! Cluster-wide DDL locks.
//!
//! A DDL lock taken on one instance is broadcast to every other instance, which
//! takes the same lock locally. Acquisition is retried a few times; releases
//! are sent once and never block progress, since a stale lock entry is
//! reconciled by a later release-all or reform.
//!
//! Client-visible output of the calling worker is suppressed while a broadcast
//! is in flight: the remote side may report errors that must not reach the
//! client of this session.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bincode::Options;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::{CoherenceConf, DdlLockConf};
use crate::context::{ContextBuilder, OutputDest, RequestContext, WorkerContext};
use crate::directory::{Directory, DirectoryError, LockRequestKind};
use crate::lock_table::{LockMode, LockTable, LockTag};
use crate::metrics::{DDL_BROADCASTS, outcome};

/// Body of a lock-carrying broadcast.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct DdlLockPayload {
    pub locktag: LockTag,
    pub lockmode: LockMode,
    pub session_lock: bool,
    pub dont_wait: bool,
}

/// Broadcast message. `ReleaseAll` is command-only and carries no lock.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize, strum_macros::IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum DdlBroadcastMessage {
    Acquire(DdlLockPayload),
    Release(DdlLockPayload),
    ReleaseAll,
}

/// Little-endian, fixed-width integers. Trailing bytes are an error.
fn coder() -> impl Options {
    bincode::DefaultOptions::new()
        .with_little_endian()
        .with_fixint_encoding()
        .reject_trailing_bytes()
}

impl DdlBroadcastMessage {
    pub fn encode(&self) -> Vec<u8> {
        coder()
            .serialize(self)
            .expect("DDL broadcast message is always serializable")
    }

    pub fn decode(buf: &[u8]) -> Result<Self, bincode::Error> {
        coder().deserialize(buf)
    }
}

/// Result of reasserting DDL locks after a reform.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ReacquireSummary {
    pub reacquired: usize,
    pub failed: usize,
}

pub struct DdlLockBroadcaster<D: Directory + ?Sized> {
    directory: Arc<D>,
    contexts: ContextBuilder,
    conf: DdlLockConf,
}

impl<D: Directory + ?Sized> DdlLockBroadcaster<D> {
    pub fn new(directory: Arc<D>, contexts: ContextBuilder, conf: DdlLockConf) -> Self {
        DdlLockBroadcaster {
            directory,
            contexts,
            conf,
        }
    }

    pub fn from_conf(directory: Arc<D>, conf: &CoherenceConf) -> Self {
        Self::new(
            directory,
            ContextBuilder::new(conf.instance_id, conf.total_procs),
            conf.ddl_lock.clone(),
        )
    }

    fn send(
        &self,
        ctx: &RequestContext,
        msg: &DdlBroadcastMessage,
        payload: &[u8],
        timeout: Duration,
        kind: LockRequestKind,
    ) -> Result<(), DirectoryError> {
        let res = self.directory.broadcast(ctx, payload, false, timeout, kind);
        let kind_label: &'static str = msg.into();
        DDL_BROADCASTS
            .with_label_values(&[kind_label, outcome(&res)])
            .inc();
        res
    }

    /// Take `tag` in `mode` on every other instance.
    ///
    /// With `dont_wait`, exactly one attempt is made with a near-zero timeout.
    /// Otherwise up to `retry_count` attempts are made, `retry_interval` apart,
    /// and the last error is returned if none succeeds.
    pub fn acquire(
        &self,
        worker: &mut WorkerContext,
        tag: &LockTag,
        mode: LockMode,
        session_lock: bool,
        dont_wait: bool,
        kind: LockRequestKind,
    ) -> Result<(), DirectoryError> {
        let ctx = self.contexts.build(worker);
        let msg = DdlBroadcastMessage::Acquire(DdlLockPayload {
            locktag: *tag,
            lockmode: mode,
            session_lock,
            dont_wait,
        });
        let payload = msg.encode();

        let saved = worker.output;
        worker.output = OutputDest::None;
        let _restore = scopeguard::guard(worker, move |w| w.output = saved);

        if dont_wait {
            return self.send(&ctx, &msg, &payload, self.conf.nowait_timeout, kind);
        }

        let mut res = Err(DirectoryError::Failed);
        for attempt in 0..self.conf.retry_count {
            if attempt > 0 {
                thread::sleep(self.conf.retry_interval);
            }
            res = self.send(&ctx, &msg, &payload, self.conf.wait_timeout, kind);
            if res.is_ok() {
                break;
            }
            debug!(
                "broadcast of DDL lock {tag} failed on attempt {} of {}",
                attempt + 1,
                self.conf.retry_count
            );
        }
        res
    }

    /// Release `tag` on every other instance. Sent once, never retried.
    pub fn release(
        &self,
        worker: &mut WorkerContext,
        tag: &LockTag,
        mode: LockMode,
        session_lock: bool,
    ) -> Result<(), DirectoryError> {
        let ctx = self.contexts.build(worker);
        let msg = DdlBroadcastMessage::Release(DdlLockPayload {
            locktag: *tag,
            lockmode: mode,
            session_lock,
            dont_wait: false,
        });
        let payload = msg.encode();

        let saved = worker.output;
        worker.output = OutputDest::None;
        let _restore = scopeguard::guard(worker, move |w| w.output = saved);

        let res = self.send(
            &ctx,
            &msg,
            &payload,
            self.conf.wait_timeout,
            LockRequestKind::Normal,
        );
        if let Err(e) = &res {
            warn!("broadcast of DDL lock release failed: {e}");
        }
        res
    }

    /// Ask every other instance to drop all DDL locks taken on our behalf.
    /// Best effort.
    pub fn release_all(&self, worker: &mut WorkerContext) {
        let ctx = self.contexts.build(worker);
        let msg = DdlBroadcastMessage::ReleaseAll;
        let payload = msg.encode();

        let saved = worker.output;
        worker.output = OutputDest::None;
        let _restore = scopeguard::guard(worker, move |w| w.output = saved);

        let res = self.send(
            &ctx,
            &msg,
            &payload,
            self.conf.wait_timeout,
            LockRequestKind::ReleaseSelf,
        );
        if let Err(e) = res {
            debug!("broadcast of DDL lock release-all failed: {e}");
        }
    }

    /// Reassert, after a reform, every access-exclusive cluster-wide lock
    /// held locally. All lock-table partitions stay latched for the scan;
    /// failures are logged and do not stop it.
    pub fn reacquire_all(
        &self,
        worker: &mut WorkerContext,
        locks: &LockTable,
    ) -> ReacquireSummary {
        let mut summary = ReacquireSummary::default();

        let partitions = locks.latch_all_shared();
        for proc_lock in partitions.proc_locks() {
            if !proc_lock.tag.is_cluster_wide()
                || !proc_lock.hold_mask.contains(LockMode::AccessExclusive)
            {
                continue;
            }
            match self.acquire(
                worker,
                &proc_lock.tag,
                LockMode::AccessExclusive,
                false,
                false,
                LockRequestKind::Reacquire,
            ) {
                Ok(()) => summary.reacquired += 1,
                Err(e) => {
                    summary.failed += 1;
                    warn!(
                        "broadcast of DDL lock {} reacquire after reform failed: {e}",
                        proc_lock.tag
                    );
                }
            }
        }
        drop(partitions);

        summary
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::time::Instant;

    use parking_lot::Mutex;
    use tracing_test::traced_test;

    use super::*;
    use crate::control_table::BufferCtrl;
    use crate::directory::PageGrant;
    use crate::lock_mode::BufLockMode;
    use crate::types::Lsn;

    struct Call {
        msg: DdlBroadcastMessage,
        timeout: Duration,
        kind: LockRequestKind,
        at: Instant,
    }

    /// Answers broadcasts from a script, then with `fallback`.
    struct RecordingDirectory {
        script: Mutex<VecDeque<Result<(), DirectoryError>>>,
        fallback: Result<(), DirectoryError>,
        calls: Mutex<Vec<Call>>,
    }

    impl RecordingDirectory {
        fn new(
            script: impl IntoIterator<Item = Result<(), DirectoryError>>,
            fallback: Result<(), DirectoryError>,
        ) -> Arc<Self> {
            Arc::new(RecordingDirectory {
                script: Mutex::new(script.into_iter().collect()),
                fallback,
                calls: Mutex::new(Vec::new()),
            })
        }
    }

    impl Directory for RecordingDirectory {
        fn request_page(
            &self,
            _ctx: &RequestContext,
            _ctrl: &BufferCtrl,
            _mode: BufLockMode,
        ) -> Result<PageGrant, DirectoryError> {
            unimplemented!()
        }

        fn release_ownership(
            &self,
            _ctx: &RequestContext,
            _ctrl: &BufferCtrl,
        ) -> Result<bool, DirectoryError> {
            unimplemented!()
        }

        fn rebuild_ownership(
            &self,
            _ctx: &RequestContext,
            _ctrl: &BufferCtrl,
            _lsn: Lsn,
            _is_dirty: bool,
        ) -> Result<(), DirectoryError> {
            unimplemented!()
        }

        fn broadcast(
            &self,
            _ctx: &RequestContext,
            payload: &[u8],
            _flush: bool,
            timeout: Duration,
            kind: LockRequestKind,
        ) -> Result<(), DirectoryError> {
            self.calls.lock().push(Call {
                msg: DdlBroadcastMessage::decode(payload).unwrap(),
                timeout,
                kind,
                at: Instant::now(),
            });
            self.script.lock().pop_front().unwrap_or(self.fallback)
        }
    }

    fn broadcaster(dir: &Arc<RecordingDirectory>) -> DdlLockBroadcaster<RecordingDirectory> {
        DdlLockBroadcaster::from_conf(Arc::clone(dir), &CoherenceConf::default())
    }

    fn acquire(
        b: &DdlLockBroadcaster<RecordingDirectory>,
        worker: &mut WorkerContext,
        dont_wait: bool,
    ) -> Result<(), DirectoryError> {
        b.acquire(
            worker,
            &LockTag::relation(5, 16384),
            LockMode::AccessExclusive,
            false,
            dont_wait,
            LockRequestKind::Normal,
        )
    }

    #[test]
    fn dont_wait_makes_exactly_one_attempt() {
        let dir = RecordingDirectory::new([Err(DirectoryError::Busy)], Ok(()));
        let mut worker = WorkerContext::backend(3);

        let res = acquire(&broadcaster(&dir), &mut worker, true);
        assert_eq!(res, Err(DirectoryError::Busy));

        let calls = dir.calls.lock();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].timeout, Duration::from_micros(5));
        assert_eq!(worker.output, OutputDest::Remote);
    }

    #[test]
    fn waiting_acquire_retries_until_success() {
        let dir = RecordingDirectory::new(
            [Err(DirectoryError::Timeout), Err(DirectoryError::Timeout)],
            Ok(()),
        );
        let mut worker = WorkerContext::backend(3);

        assert_eq!(acquire(&broadcaster(&dir), &mut worker, false), Ok(()));

        let calls = dir.calls.lock();
        assert_eq!(calls.len(), 3);
        for pair in calls.windows(2) {
            assert!(pair[1].at.duration_since(pair[0].at) >= Duration::from_millis(5));
        }
        for call in calls.iter() {
            assert_eq!(call.timeout, Duration::from_secs(5));
            assert_eq!(call.kind, LockRequestKind::Normal);
            assert!(matches!(
                call.msg,
                DdlBroadcastMessage::Acquire(DdlLockPayload {
                    lockmode: LockMode::AccessExclusive,
                    dont_wait: false,
                    ..
                })
            ));
        }
        assert_eq!(worker.output, OutputDest::Remote);
    }

    #[test]
    #[traced_test]
    fn waiting_acquire_returns_last_error() {
        let dir = RecordingDirectory::new(
            [Err(DirectoryError::Busy), Err(DirectoryError::Busy)],
            Err(DirectoryError::Timeout),
        );
        let mut worker = WorkerContext::backend(3);

        let res = acquire(&broadcaster(&dir), &mut worker, false);
        assert_eq!(res, Err(DirectoryError::Timeout));
        assert_eq!(dir.calls.lock().len(), 3);
        assert_eq!(worker.output, OutputDest::Remote);
        assert!(logs_contain("failed on attempt 1 of 3"));
        assert!(logs_contain("failed on attempt 3 of 3"));
        assert!(!logs_contain("failed on attempt 0 of 3"));
    }

    #[test]
    fn first_success_stops_retrying() {
        let dir = RecordingDirectory::new([], Ok(()));
        let mut worker = WorkerContext::backend(3);
        assert_eq!(acquire(&broadcaster(&dir), &mut worker, false), Ok(()));
        assert_eq!(dir.calls.lock().len(), 1);
    }

    #[test]
    #[traced_test]
    fn failed_release_is_reported() {
        let dir = RecordingDirectory::new([], Err(DirectoryError::Failed));
        let mut worker = WorkerContext::backend(3);
        let tag = LockTag::relation(5, 16384);

        let res = broadcaster(&dir).release(&mut worker, &tag, LockMode::AccessExclusive, true);
        assert_eq!(res, Err(DirectoryError::Failed));
        assert!(logs_contain("broadcast of DDL lock release failed"));

        let calls = dir.calls.lock();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].kind, LockRequestKind::Normal);
        assert_eq!(
            calls[0].msg,
            DdlBroadcastMessage::Release(DdlLockPayload {
                locktag: tag,
                lockmode: LockMode::AccessExclusive,
                session_lock: true,
                dont_wait: false,
            })
        );
        assert_eq!(worker.output, OutputDest::Remote);
    }

    #[test]
    fn release_all_is_best_effort() {
        let dir = RecordingDirectory::new([], Err(DirectoryError::ReformInProgress));
        let mut worker = WorkerContext::backend(3);

        broadcaster(&dir).release_all(&mut worker);

        let calls = dir.calls.lock();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].msg, DdlBroadcastMessage::ReleaseAll);
        assert_eq!(calls[0].kind, LockRequestKind::ReleaseSelf);
        assert_eq!(worker.output, OutputDest::Remote);
    }

    fn populated_lock_table() -> LockTable {
        let locks = LockTable::new();
        locks.grant(LockTag::relation(5, 100), 1, LockMode::AccessExclusive);
        locks.grant(LockTag::object(5, 1259, 42, 0), 2, LockMode::AccessExclusive);
        // not cluster-wide
        locks.grant(LockTag::page(5, 100, 7), 1, LockMode::AccessExclusive);
        // not access-exclusive
        locks.grant(LockTag::relation(5, 200), 3, LockMode::RowExclusive);
        locks
    }

    #[test]
    fn reacquire_reasserts_cluster_wide_exclusive_locks() {
        let dir = RecordingDirectory::new([], Ok(()));
        let mut worker = WorkerContext::backend(0);
        let locks = populated_lock_table();

        let summary = broadcaster(&dir).reacquire_all(&mut worker, &locks);
        assert_eq!(
            summary,
            ReacquireSummary {
                reacquired: 2,
                failed: 0
            }
        );

        let calls = dir.calls.lock();
        assert_eq!(calls.len(), 2);
        let mut tags = Vec::new();
        for call in calls.iter() {
            assert_eq!(call.kind, LockRequestKind::Reacquire);
            let DdlBroadcastMessage::Acquire(payload) = call.msg else {
                panic!("unexpected message {:?}", call.msg);
            };
            assert_eq!(payload.lockmode, LockMode::AccessExclusive);
            assert!(!payload.session_lock);
            assert!(!payload.dont_wait);
            tags.push(payload.locktag);
        }
        assert!(tags.contains(&LockTag::relation(5, 100)));
        assert!(tags.contains(&LockTag::object(5, 1259, 42, 0)));
    }

    #[test]
    fn reacquire_failures_do_not_stop_the_scan() {
        let dir = RecordingDirectory::new([], Err(DirectoryError::Timeout));
        let mut worker = WorkerContext::backend(0);
        let locks = populated_lock_table();

        let summary = broadcaster(&dir).reacquire_all(&mut worker, &locks);
        assert_eq!(
            summary,
            ReacquireSummary {
                reacquired: 0,
                failed: 2
            }
        );
        // each lock is retried in full
        assert_eq!(dir.calls.lock().len(), 6);

        for idx in 0..locks.num_partitions() {
            assert!(locks.partition_latch(idx).try_write().is_some());
        }
        assert_eq!(worker.output, OutputDest::Remote);
    }

    #[test]
    fn message_encoding() {
        let msg = DdlBroadcastMessage::Acquire(DdlLockPayload {
            locktag: LockTag::relation(5, 16384),
            lockmode: LockMode::AccessExclusive,
            session_lock: true,
            dont_wait: false,
        });
        let bytes = msg.encode();
        // variant index, five fields, type, method, mode, two flags
        assert_eq!(bytes.len(), 4 + 5 * 4 + 4 + 1 + 4 + 1 + 1);
        assert_eq!(&bytes[0..4], &0u32.to_le_bytes());
        assert_eq!(DdlBroadcastMessage::decode(&bytes).unwrap(), msg);

        let release_all = DdlBroadcastMessage::ReleaseAll.encode();
        assert_eq!(release_all, 2u32.to_le_bytes());
        assert_eq!(
            DdlBroadcastMessage::decode(&release_all).unwrap(),
            DdlBroadcastMessage::ReleaseAll
        );
    }

    #[test]
    fn reject_garbage() {
        assert!(DdlBroadcastMessage::decode(&[9, 0, 0, 0]).is_err());
        let mut bytes = DdlBroadcastMessage::ReleaseAll.encode();
        bytes.push(0);
        assert!(DdlBroadcastMessage::decode(&bytes).is_err());
    }
}
