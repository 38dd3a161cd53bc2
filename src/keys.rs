//! Redis key construction.
//!
//! Two key families live in the cache:
//!
//! - `like:user:{user_id}` - per-user marker hash, field = item id, value =
//!   expiry epoch millis. Existence of an unexpired field means "liked".
//! - `like:pending:{HH:MM:S0}` - per-10-second-slice provisional counter
//!   hash, field = `"{user_id}:{item_id}"`, value = small signed integer.
//!   Written by the atomic scripts, never read on a correctness path.

/// Prefix of per-user marker hashes.
pub const USER_MARKER_PREFIX: &str = "like:user:";

/// Prefix of time-sliced provisional counter hashes.
pub const PENDING_PREFIX: &str = "like:pending:";

/// Marker hash key for one user.
#[must_use]
pub fn user_marker_key(user_id: i64) -> String {
    format!("{USER_MARKER_PREFIX}{user_id}")
}

/// Provisional counter key for a time slice.
#[must_use]
pub fn pending_key(slice: &str) -> String {
    format!("{PENDING_PREFIX}{slice}")
}

/// Recover the user id from a marker key produced by [`user_marker_key`].
#[must_use]
pub fn user_id_from_marker_key(key: &str) -> Option<i64> {
    key.strip_prefix(USER_MARKER_PREFIX)?.parse().ok()
}

/// Wall-clock 10-second bucket, `HH:MM:S0` in UTC.
///
/// Provisional counters are grouped per slice so stale slices age out of
/// interest naturally; 11:20:23 lands in `11:20:20`.
#[must_use]
pub fn time_slice(now_millis: i64) -> String {
    let secs_of_day = (now_millis / 1000).rem_euclid(86_400);
    let hours = secs_of_day / 3600;
    let minutes = (secs_of_day % 3600) / 60;
    let seconds = (secs_of_day % 60) / 10 * 10;
    format!("{hours:02}:{minutes:02}:{seconds:02}")
}
