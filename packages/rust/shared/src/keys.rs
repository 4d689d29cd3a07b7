//! Opaque course and block keys.
//!
//! Course keys look like `course-v1:edX+DemoX+Demo_Course`; block locations
//! look like `block-v1:edX+DemoX+Demo_Course+type@chapter+block@intro`. Both may
//! carry `branch@` / `version@` qualifiers from the content store, which are
//! stripped before anything reaches the warehouse.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{AspectsError, Result};

const COURSE_PREFIX: &str = "course-v1";
const BLOCK_PREFIX: &str = "block-v1";

static COURSE_KEY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^course-v1:(?P<org>[^+@/\s]+)\+(?P<course>[^+@/\s]+)\+(?P<run>[^+@/\s]+)(?:\+branch@(?P<branch>[^+@/\s]+))?(?:\+version@(?P<version>[^+@/\s]+))?$",
    )
    .expect("valid regex")
});

static USAGE_KEY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^block-v1:(?P<org>[^+@/\s]+)\+(?P<course>[^+@/\s]+)\+(?P<run>[^+@/\s]+)(?:\+branch@(?P<branch>[^+@/\s]+))?(?:\+version@(?P<version>[^+@/\s]+))?\+type@(?P<block_type>[^+@/\s]+)\+block@(?P<block_id>[^+@/\s]+)$",
    )
    .expect("valid regex")
});

// ---------------------------------------------------------------------------
// CourseKey
// ---------------------------------------------------------------------------

/// Identifies a course run: `course-v1:{org}+{course}+{run}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CourseKey {
    pub org: String,
    pub course: String,
    pub run: String,
    pub branch: Option<String>,
    pub version: Option<String>,
}

impl CourseKey {
    /// Build a course key without branch or version qualifiers.
    pub fn new(org: impl Into<String>, course: impl Into<String>, run: impl Into<String>) -> Self {
        Self {
            org: org.into(),
            course: course.into(),
            run: run.into(),
            branch: None,
            version: None,
        }
    }

    /// The same course with branch and version qualifiers removed.
    pub fn for_branch_none(&self) -> Self {
        Self::new(self.org.clone(), self.course.clone(), self.run.clone())
    }

    /// Location of the course's root block.
    pub fn root_location(&self) -> UsageKey {
        UsageKey {
            course_key: self.for_branch_none(),
            block_type: crate::types::block_types::COURSE.to_string(),
            block_id: crate::types::block_types::COURSE.to_string(),
        }
    }

    fn write_body(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}+{}+{}", self.org, self.course, self.run)?;
        if let Some(branch) = &self.branch {
            write!(f, "+branch@{branch}")?;
        }
        if let Some(version) = &self.version {
            write!(f, "+version@{version}")?;
        }
        Ok(())
    }
}

impl fmt::Display for CourseKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{COURSE_PREFIX}:")?;
        self.write_body(f)
    }
}

impl FromStr for CourseKey {
    type Err = AspectsError;

    fn from_str(s: &str) -> Result<Self> {
        let caps = COURSE_KEY_RE
            .captures(s.trim())
            .ok_or_else(|| AspectsError::parse(format!("invalid course key: {s:?}")))?;
        Ok(Self {
            org: caps["org"].to_string(),
            course: caps["course"].to_string(),
            run: caps["run"].to_string(),
            branch: caps.name("branch").map(|m| m.as_str().to_string()),
            version: caps.name("version").map(|m| m.as_str().to_string()),
        })
    }
}

// ---------------------------------------------------------------------------
// UsageKey
// ---------------------------------------------------------------------------

/// Location of a single content block inside a course.
///
/// Branch and version qualifiers live on the embedded [`CourseKey`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UsageKey {
    pub course_key: CourseKey,
    pub block_type: String,
    pub block_id: String,
}

impl UsageKey {
    /// Build a location inside `course_key`.
    pub fn new(
        course_key: CourseKey,
        block_type: impl Into<String>,
        block_id: impl Into<String>,
    ) -> Self {
        Self {
            course_key,
            block_type: block_type.into(),
            block_id: block_id.into(),
        }
    }

    /// Remove branch and version information. Idempotent.
    pub fn strip_branch_and_version(&self) -> Self {
        Self {
            course_key: self.course_key.for_branch_none(),
            block_type: self.block_type.clone(),
            block_id: self.block_id.clone(),
        }
    }
}

impl fmt::Display for UsageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{BLOCK_PREFIX}:")?;
        self.course_key.write_body(f)?;
        write!(f, "+type@{}+block@{}", self.block_type, self.block_id)
    }
}

impl FromStr for UsageKey {
    type Err = AspectsError;

    fn from_str(s: &str) -> Result<Self> {
        let caps = USAGE_KEY_RE
            .captures(s.trim())
            .ok_or_else(|| AspectsError::parse(format!("invalid block location: {s:?}")))?;
        Ok(Self {
            course_key: CourseKey {
                org: caps["org"].to_string(),
                course: caps["course"].to_string(),
                run: caps["run"].to_string(),
                branch: caps.name("branch").map(|m| m.as_str().to_string()),
                version: caps.name("version").map(|m| m.as_str().to_string()),
            },
            block_type: caps["block_type"].to_string(),
            block_id: caps["block_id"].to_string(),
        })
    }
}

// Keys travel as their string form in snapshots and events.

impl Serialize for CourseKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for CourseKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

impl Serialize for UsageKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for UsageKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
