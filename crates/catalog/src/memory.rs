//! In-memory catalog for tests and dry runs.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use seqxfer_protocol::{
    FileInstance, FileResource, FileTransferJob, NewFileTransfer, Storage, TaskStatus,
};

use crate::{Catalog, CatalogError, CatalogFuture, JobCatalog, reconcile_instance};

#[derive(Default)]
struct Inner {
    storages: Vec<Storage>,
    resources: Vec<FileResource>,
    tags: HashMap<String, Vec<i64>>,
    instances: Vec<FileInstance>,
    jobs: Vec<FileTransferJob>,
    job_polls: HashMap<i64, u32>,
    job_outcome: Option<(u32, bool, String)>,
    tasks: HashMap<i64, TaskStatus>,
    next_id: i64,
    created_instances: usize,
}

impl Inner {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Catalog held in memory.
#[derive(Default)]
pub struct MemoryCatalog {
    inner: Mutex<Inner>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_storage(&self, storage: Storage) {
        self.lock().storages.push(storage);
    }

    /// Adds a resource and tags it. Adding the same resource under a
    /// second tag only adds the tag.
    pub fn add_resource(&self, tag: &str, resource: FileResource) {
        let mut inner = self.lock();
        let id = resource.id;
        if !inner.resources.iter().any(|r| r.id == id) {
            inner.resources.push(resource);
        }
        inner.tags.entry(tag.to_string()).or_default().push(id);
    }

    /// Records an instance of `resource` on `storage`.
    pub fn add_instance(&self, resource: &FileResource, storage: &Storage, filepath: Option<&str>) {
        let mut inner = self.lock();
        let id = inner.next_id();
        inner.instances.push(FileInstance {
            id,
            file_resource: resource.id,
            storage: storage.id,
            storage_name: storage.name.clone(),
            filepath: filepath.map(String::from),
        });
    }

    pub fn instances(&self) -> Vec<FileInstance> {
        self.lock().instances.clone()
    }

    /// Instances created through [`Catalog::get_or_create_file_instance`].
    pub fn created_instances(&self) -> usize {
        self.lock().created_instances
    }

    /// Outcome of transfer jobs created from now on: how many status
    /// reads report them running, then whether they succeed.
    pub fn set_job_outcome(&self, polls: u32, success: bool, state: &str) {
        self.lock().job_outcome = Some((polls, success, state.to_string()));
    }

    pub fn insert_job(&self, job: FileTransferJob) {
        self.lock().jobs.push(job);
    }

    pub fn jobs(&self) -> Vec<FileTransferJob> {
        self.lock().jobs.clone()
    }

    pub fn insert_task(&self, task: TaskStatus) {
        self.lock().tasks.insert(task.id, task);
    }
}

impl Catalog for MemoryCatalog {
    fn get_storage<'a>(&'a self, name: &'a str) -> CatalogFuture<'a, Storage> {
        Box::pin(async move {
            self.lock()
                .storages
                .iter()
                .find(|s| s.name == name)
                .cloned()
                .ok_or_else(|| CatalogError::NotFound {
                    kind: "storage",
                    key: name.to_string(),
                })
        })
    }

    fn list_resources_for_tag<'a>(&'a self, tag: &'a str) -> CatalogFuture<'a, Vec<FileResource>> {
        Box::pin(async move {
            let inner = self.lock();
            let ids = inner.tags.get(tag).cloned().unwrap_or_default();
            Ok(ids
                .iter()
                .filter_map(|id| inner.resources.iter().find(|r| r.id == *id).cloned())
                .collect())
        })
    }

    fn list_file_instances<'a>(
        &'a self,
        resource: &'a FileResource,
    ) -> CatalogFuture<'a, Vec<FileInstance>> {
        Box::pin(async move {
            Ok(self
                .lock()
                .instances
                .iter()
                .filter(|i| i.file_resource == resource.id)
                .cloned()
                .collect())
        })
    }

    fn get_or_create_file_instance<'a>(
        &'a self,
        resource: &'a FileResource,
        storage: &'a Storage,
        filepath: Option<&'a str>,
    ) -> CatalogFuture<'a, FileInstance> {
        Box::pin(async move {
            let mut inner = self.lock();
            let existing = inner
                .instances
                .iter()
                .find(|i| i.file_resource == resource.id && i.storage == storage.id)
                .cloned();
            if let Some(existing) = existing {
                return reconcile_instance(existing, filepath);
            }
            let instance = FileInstance {
                id: inner.next_id(),
                file_resource: resource.id,
                storage: storage.id,
                storage_name: storage.name.clone(),
                filepath: filepath.map(String::from),
            };
            inner.instances.push(instance.clone());
            inner.created_instances += 1;
            Ok(instance)
        })
    }
}

impl JobCatalog for MemoryCatalog {
    fn find_transfer_job<'a>(&'a self, name: &'a str) -> CatalogFuture<'a, Option<FileTransferJob>> {
        Box::pin(async move { Ok(self.lock().jobs.iter().find(|j| j.name == name).cloned()) })
    }

    fn create_transfer_job<'a>(
        &'a self,
        job: &'a NewFileTransfer,
    ) -> CatalogFuture<'a, FileTransferJob> {
        Box::pin(async move {
            let mut inner = self.lock();
            let id = inner.next_id();
            let created = FileTransferJob {
                id,
                name: job.name.clone(),
                tag_name: job.tag_name.clone(),
                from_storage: job.from_storage,
                to_storage: job.to_storage,
                running: true,
                finished: false,
                success: false,
                state: "queued".into(),
            };
            let polls = inner.job_outcome.as_ref().map_or(0, |(polls, _, _)| *polls);
            inner.job_polls.insert(id, polls);
            inner.jobs.push(created.clone());
            Ok(created)
        })
    }

    fn transfer_job(&self, id: i64) -> CatalogFuture<'_, FileTransferJob> {
        Box::pin(async move {
            let mut inner = self.lock();
            let outcome = inner.job_outcome.clone();
            let remaining = inner.job_polls.get(&id).copied();
            let finish = match remaining {
                Some(0) => true,
                Some(n) => {
                    inner.job_polls.insert(id, n - 1);
                    false
                }
                None => false,
            };
            let job = inner
                .jobs
                .iter_mut()
                .find(|j| j.id == id)
                .ok_or_else(|| CatalogError::NotFound {
                    kind: "transfer job",
                    key: id.to_string(),
                })?;
            if finish && !job.finished {
                let (success, state) = outcome
                    .map(|(_, success, state)| (success, state))
                    .unwrap_or((true, "success".into()));
                job.running = false;
                job.finished = true;
                job.success = success;
                job.state = state;
            }
            Ok(job.clone())
        })
    }

    fn simple_task(&self, id: i64) -> CatalogFuture<'_, TaskStatus> {
        Box::pin(async move {
            self.lock()
                .tasks
                .get(&id)
                .cloned()
                .ok_or_else(|| CatalogError::NotFound {
                    kind: "task",
                    key: id.to_string(),
                })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resource(id: i64, name: &str) -> FileResource {
        FileResource {
            id,
            filename: name.into(),
            size: 10,
            created: None,
            is_folder: false,
        }
    }

    #[tokio::test]
    async fn resources_listed_per_tag() {
        let catalog = MemoryCatalog::new();
        catalog.add_resource("run42", resource(1, "a.bam"));
        catalog.add_resource("run42", resource(2, "b.bam"));
        catalog.add_resource("other", resource(1, "a.bam"));

        let run42 = catalog.list_resources_for_tag("run42").await.unwrap();
        assert_eq!(run42.len(), 2);
        let other = catalog.list_resources_for_tag("other").await.unwrap();
        assert_eq!(other[0].id, 1);
        assert!(catalog.list_resources_for_tag("none").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn get_or_create_is_idempotent() {
        let catalog = MemoryCatalog::new();
        let storage = Storage::server(1, "shahlab", "/archive");
        let r = resource(1, "a.bam");

        let first = catalog
            .get_or_create_file_instance(&r, &storage, Some("a.bam"))
            .await
            .unwrap();
        let second = catalog
            .get_or_create_file_instance(&r, &storage, Some("a.bam"))
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(catalog.created_instances(), 1);

        let err = catalog
            .get_or_create_file_instance(&r, &storage, Some("elsewhere/a.bam"))
            .await
            .unwrap_err();
        assert!(matches!(err, CatalogError::Conflict(_)));
    }

    #[tokio::test]
    async fn unknown_storage_is_not_found() {
        let catalog = MemoryCatalog::new();
        assert!(matches!(
            catalog.get_storage("x").await,
            Err(CatalogError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn jobs_finish_after_configured_polls() {
        let catalog = MemoryCatalog::new();
        catalog.set_job_outcome(1, false, "disk full");
        let job = catalog
            .create_transfer_job(&NewFileTransfer {
                name: "t".into(),
                tag_name: "run42".into(),
                from_storage: 1,
                to_storage: 2,
            })
            .await
            .unwrap();

        assert!(!catalog.transfer_job(job.id).await.unwrap().finished);
        let done = catalog.transfer_job(job.id).await.unwrap();
        assert!(done.finished);
        assert!(!done.success);
        assert_eq!(done.state, "disk full");
    }
}
