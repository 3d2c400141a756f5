//! Configuration of the coherence bridge.
//!
//! Every field has a default, so an empty TOML document is a valid config.
//! Durations use humantime syntax, e.g. `retry_interval = "5ms"`.

use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use crate::defaults::*;
use crate::logging::LogFormat;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CoherenceConf {
    pub instance_id: u8,
    pub total_procs: u32,
    pub buffer_count: usize,
    /// Compare every upgraded page with its on-disk copy and abort if the disk
    /// is newer. Costs an extra read per upgrade.
    pub verify_page_lsn: bool,
    pub log_format: LogFormat,
    pub ddl_lock: DdlLockConf,
}

impl Default for CoherenceConf {
    fn default() -> Self {
        CoherenceConf {
            instance_id: DEFAULT_INSTANCE_ID,
            total_procs: DEFAULT_TOTAL_PROCS,
            buffer_count: DEFAULT_BUFFER_COUNT,
            verify_page_lsn: cfg!(debug_assertions),
            log_format: LogFormat::default(),
            ddl_lock: DdlLockConf::default(),
        }
    }
}

impl CoherenceConf {
    pub fn parse_toml(s: &str) -> anyhow::Result<CoherenceConf> {
        let conf: CoherenceConf = toml::from_str(s).context("failed to parse coherence config")?;
        anyhow::ensure!(conf.buffer_count > 0, "buffer_count must be positive");
        anyhow::ensure!(
            conf.ddl_lock.retry_count > 0,
            "ddl_lock.retry_count must be positive"
        );
        Ok(conf)
    }
}

/// Retry policy of DDL lock acquisition.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DdlLockConf {
    /// Attempts made by a waiting acquire.
    pub retry_count: u32,
    #[serde(with = "humantime_serde")]
    pub retry_interval: Duration,
    /// Per-attempt timeout of waiting acquires and of releases.
    #[serde(with = "humantime_serde")]
    pub wait_timeout: Duration,
    /// Per-attempt timeout of a no-wait acquire.
    #[serde(with = "humantime_serde")]
    pub nowait_timeout: Duration,
}

impl Default for DdlLockConf {
    fn default() -> Self {
        DdlLockConf {
            retry_count: DEFAULT_DDL_LOCK_RETRY_COUNT,
            retry_interval: DEFAULT_DDL_LOCK_RETRY_INTERVAL,
            wait_timeout: DEFAULT_DDL_LOCK_WAIT_TIMEOUT,
            nowait_timeout: DEFAULT_DDL_LOCK_NOWAIT_TIMEOUT,
        }
    }
}
