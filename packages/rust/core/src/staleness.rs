//! Decides whether a course needs to be dumped again.

use chrono::{DateTime, Utc};
use tracing::debug;

use aspects_shared::{Result, format_warehouse_timestamp, parse_warehouse_timestamp};

pub const REASON_NOT_IN_WAREHOUSE: &str = "course is not present in the warehouse yet";
pub const REASON_NO_MODIFIED: &str = "no modification timestamp available";
pub const REASON_FORCED: &str = "force is set";

/// Outcome of a staleness check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpDecision {
    pub should_dump: bool,
    /// Human-readable justification, logged and reported to the operator.
    pub reason: String,
}

impl DumpDecision {
    pub fn dump(reason: impl Into<String>) -> Self {
        Self {
            should_dump: true,
            reason: reason.into(),
        }
    }

    pub fn skip(reason: impl Into<String>) -> Self {
        Self {
            should_dump: false,
            reason: reason.into(),
        }
    }

    pub fn forced() -> Self {
        Self::dump(REASON_FORCED)
    }
}

/// Staleness check on warehouse-format timestamp strings.
///
/// A string that does not match the warehouse layout exactly is a `Parse`
/// error, never a silent yes or no.
pub fn should_dump(last_dump: Option<&str>, last_modified: Option<&str>) -> Result<DumpDecision> {
    let Some(last_dump) = last_dump else {
        return Ok(DumpDecision::dump(REASON_NOT_IN_WAREHOUSE));
    };
    let Some(last_modified) = last_modified else {
        return Ok(DumpDecision::skip(REASON_NO_MODIFIED));
    };

    let last_dump = parse_warehouse_timestamp(last_dump)?;
    let last_modified = parse_warehouse_timestamp(last_modified)?;
    Ok(should_dump_at(Some(last_dump), Some(last_modified)))
}

/// Staleness check on already-parsed timestamps.
pub fn should_dump_at(
    last_dump: Option<DateTime<Utc>>,
    last_modified: Option<DateTime<Utc>>,
) -> DumpDecision {
    let Some(last_dump) = last_dump else {
        return DumpDecision::dump(REASON_NOT_IN_WAREHOUSE);
    };
    let Some(last_modified) = last_modified else {
        return DumpDecision::skip(REASON_NO_MODIFIED);
    };

    let dumped = format_warehouse_timestamp(&last_dump);
    let modified = format_warehouse_timestamp(&last_modified);
    let decision = if last_dump < last_modified {
        DumpDecision::dump(format!(
            "course was modified since the last dump: last dumped {dumped} < last modified {modified}"
        ))
    } else {
        DumpDecision::skip(format!(
            "course was not modified since the last dump: last dumped {dumped} >= last modified {modified}"
        ))
    };
    debug!(should_dump = decision.should_dump, %dumped, %modified, "staleness checked");
    decision
}
