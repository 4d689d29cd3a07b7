//! Host lifecycle events and their routing into the task queue.
//!
//! Events arrive as JSON objects tagged by `event`, one per line:
//!
//! ```json
//! {"event": "course_published", "course_key": "course-v1:edX+DemoX+Demo"}
//! {"event": "external_id_created", "id": 42}
//! {"event": "user_retired", "user_id": 7}
//! ```

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use aspects_shared::{AspectsError, CourseKey, Result, config::sink_names};

use crate::dispatch::{Dispatcher, Task};

/// A lifecycle event emitted by the host platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    CoursePublished { course_key: CourseKey },
    ExternalIdCreated { id: i64 },
    UserRetired { user_id: i64 },
}

impl Event {
    /// The task this event schedules.
    pub fn to_task(&self) -> Task {
        match self {
            Event::CoursePublished { course_key } => Task::DumpCourse {
                course_key: course_key.clone(),
                force: false,
            },
            Event::ExternalIdCreated { id } => Task::DumpModel {
                sink: sink_names::EXTERNAL_ID.to_string(),
                object_id: id.to_string(),
            },
            Event::UserRetired { user_id } => Task::DumpModel {
                sink: sink_names::USER_RETIREMENT.to_string(),
                object_id: user_id.to_string(),
            },
        }
    }
}

/// Parse one JSON-lines event. Blank lines yield `None`.
pub fn parse_event_line(line: &str) -> Result<Option<Event>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    serde_json::from_str(line)
        .map(Some)
        .map_err(|e| AspectsError::validation(format!("invalid event {line:?}: {e}")))
}

/// Queue the task for `event`. Returns `false` if an identical task was
/// already pending.
#[instrument(skip_all, fields(event = ?event))]
pub async fn handle_event(dispatcher: &Dispatcher, event: &Event) -> Result<bool> {
    let queued = dispatcher.submit(event.to_task()).await?;
    debug!(queued, "event handled");
    Ok(queued)
}
