//! Bit-exact naming conventions and tuning constants (spec §6).

/// Group's initial cursor position: new messages only.
pub const GROUP_START_ID: &str = "$";

/// Minimum number of consumers allowed in a group.
pub const MIN_CONSUMERS: usize = 1;

/// Maximum number of consumers allowed in a group.
pub const MAX_CONSUMERS: usize = 100;

/// Retry cap while searching for a free consumer name slot.
pub const UNIQUE_NAME_RETRY_CAP: usize = 200;

/// Cap on removal attempts during a single reconciliation pass.
pub const REMOVAL_ATTEMPT_CAP: usize = 10_000;

/// Default idle threshold, in milliseconds, before a pending entry is reclaimable.
pub const DEFAULT_MIN_IDLE_MILLISECONDS: usize = 2_000;

/// Default reclaim-loop poll period, in seconds.
pub const DEFAULT_RECLAIM_POLL_SECONDS: u64 = 5;

/// Default per-attempt deadline for the online read loop, in seconds.
pub const DEFAULT_ONLINE_DEADLINE_SECONDS: u64 = 5;

/// Default batch size for new-message reads and pending scans.
pub const DEFAULT_BATCH_SIZE: usize = 10;

/// An idle consumer is removable only once it has been idle longer than this.
pub const MIN_REMOVABLE_IDLE_MILLISECONDS: i64 = 1_000;

/// Sentinel `inactive` value reported by the log service for a consumer that has
/// never successfully processed a message.
pub const NEVER_PROCESSED_INACTIVE_MILLISECONDS: i64 = -1;

/// Build the stream name for a given message key: `stream:<msgKey>`.
pub fn stream_name(msg_key: &str) -> String {
    format!("stream:{msg_key}")
}

/// Build the group name for a given group key: `group:<groupKey>`.
pub fn group_name(group_key: &str) -> String {
    format!("group:{group_key}")
}

/// Build the `index`-th consumer name for a given message key:
/// `consumer:<msgKey>NNNN`, zero-padded to four digits. The fleet manager's
/// slot numbering is 1-based: the first worker it creates in a group is
/// `index == 1`.
pub fn consumer_name(msg_key: &str, index: usize) -> String {
    format!("consumer:{msg_key}{index:04}")
}
