use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// List responses
// ---------------------------------------------------------------------------

/// One page of a limit/offset paginated list endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub count: u64,
    #[serde(default)]
    pub next: Option<String>,
    pub results: Vec<T>,
}

// ---------------------------------------------------------------------------
// Request bodies
// ---------------------------------------------------------------------------

/// Body of a file instance create request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewFileInstance {
    pub file_resource: i64,
    pub storage: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filepath: Option<String>,
}

/// Body of a catalog-side transfer job create request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewFileTransfer {
    pub name: String,
    pub tag_name: String,
    pub from_storage: i64,
    pub to_storage: i64,
}

// ---------------------------------------------------------------------------
// Background jobs
// ---------------------------------------------------------------------------

/// Status of a catalog background job.
///
/// The catalog does not distinguish pending from running reliably, so only
/// the `finished`/`success` pair is authoritative.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStatus {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub running: bool,
    #[serde(default)]
    pub finished: bool,
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub state: String,
}

impl TaskStatus {
    pub fn failed(&self) -> bool {
        self.finished && !self.success
    }
}

/// A catalog-side transfer job, executed by a catalog worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileTransferJob {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub tag_name: String,
    pub from_storage: i64,
    pub to_storage: i64,
    #[serde(default)]
    pub running: bool,
    #[serde(default)]
    pub finished: bool,
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub state: String,
}

impl FileTransferJob {
    pub fn status(&self) -> TaskStatus {
        TaskStatus {
            id: self.id,
            running: self.running,
            finished: self.finished,
            success: self.success,
            state: self.state.clone(),
        }
    }

    /// Finished without success and nobody is working on it.
    pub fn needs_restart(&self) -> bool {
        !self.running && self.finished && !self.success
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Storage;

    #[test]
    fn page_parses_last_page() {
        let json = r#"{"count":1,"next":null,"previous":null,"results":[{"id":1,"name":"s","storage_type":"blob"}]}"#;
        let page: Page<Storage> = serde_json::from_str(json).unwrap();
        assert_eq!(page.count, 1);
        assert!(page.next.is_none());
        assert_eq!(page.results[0].name, "s");
    }

    #[test]
    fn new_file_instance_omits_empty_filepath() {
        let req = NewFileInstance {
            file_resource: 4,
            storage: 2,
            filepath: None,
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(!json.contains("filepath"));
    }

    #[test]
    fn task_status_defaults_to_unfinished() {
        let status: TaskStatus = serde_json::from_str(r#"{"id":5}"#).unwrap();
        assert!(!status.finished);
        assert!(!status.failed());
    }

    #[test]
    fn job_needs_restart_only_when_idle_and_failed() {
        let mut job = FileTransferJob {
            id: 1,
            name: "run42-to-blob".into(),
            tag_name: "run42".into(),
            from_storage: 1,
            to_storage: 2,
            running: false,
            finished: true,
            success: false,
            state: "disk full".into(),
        };
        assert!(job.needs_restart());
        assert!(job.status().failed());

        job.running = true;
        assert!(!job.needs_restart());
    }
}
