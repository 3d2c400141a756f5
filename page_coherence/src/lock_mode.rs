//! Buffer ownership modes and the local compatibility shortcut.

use serde::{Deserialize, Serialize};

/// Strength at which this instance owns a page in the directory.
///
/// The ordering matters: a stronger mode compares greater, and a cached mode
/// only moves up through a successful remote grant.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    Serialize,
    Deserialize,
    strum_macros::IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
#[repr(u8)]
pub enum BufLockMode {
    #[default]
    Null = 0,
    Share = 1,
    Exclusive = 2,
}

/// Does the cached ownership `cached` already permit access in `requested`
/// mode, so that no remote round trip is needed?
///
/// Only `Share` and `Exclusive` may be requested.
pub fn lock_mode_compatible(cached: BufLockMode, requested: BufLockMode) -> bool {
    match requested {
        BufLockMode::Share => matches!(cached, BufLockMode::Share | BufLockMode::Exclusive),
        BufLockMode::Exclusive => cached == BufLockMode::Exclusive,
        BufLockMode::Null => {
            debug_assert!(false, "lock mode value is wrong");
            false
        }
    }
}
