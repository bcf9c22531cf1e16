//! Catalog-side transfer jobs and task waiting.
//!
//! A remote transfer is executed by a catalog worker rather than by this
//! process; the client only creates the job (or finds it by name) and then
//! waits for it with a [`TaskPoller`].

use seqxfer_protocol::{FileTransferJob, NewFileTransfer, TaskStatus};
use seqxfer_task_poller::{PollError, StatusFuture, TaskPoller, TaskStatusSource};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{CatalogError, JobCatalog};

/// Transfer job status as a pollable task.
pub struct TransferJobStatus<'c, C: ?Sized>(pub &'c C);

impl<C: JobCatalog + ?Sized> TaskStatusSource for TransferJobStatus<'_, C> {
    type TaskId = i64;

    fn task_status<'a>(&'a self, task: &'a i64) -> StatusFuture<'a> {
        Box::pin(async move {
            self.0
                .transfer_job(*task)
                .await
                .map(|job| job.status())
                .map_err(|e| lookup_error(*task, e))
        })
    }
}

/// Generic catalog task status as a pollable task.
pub struct SimpleTaskStatus<'c, C: ?Sized>(pub &'c C);

impl<C: JobCatalog + ?Sized> TaskStatusSource for SimpleTaskStatus<'_, C> {
    type TaskId = i64;

    fn task_status<'a>(&'a self, task: &'a i64) -> StatusFuture<'a> {
        Box::pin(async move {
            self.0
                .simple_task(*task)
                .await
                .map_err(|e| lookup_error(*task, e))
        })
    }
}

fn lookup_error(task: i64, e: CatalogError) -> PollError {
    PollError::Lookup {
        task: task.to_string(),
        message: e.to_string(),
    }
}

/// Finds the transfer job called `name` or creates it.
///
/// An existing job that finished unsuccessfully and is not running must be
/// restarted by an operator; it is reported as [`CatalogError::JobFailed`].
pub async fn start_remote_transfer<C: JobCatalog + ?Sized>(
    catalog: &C,
    source: &str,
    destination: &str,
    tag: &str,
    name: &str,
) -> Result<FileTransferJob, CatalogError> {
    let from = catalog.get_storage(source).await?;
    let to = catalog.get_storage(destination).await?;

    if let Some(job) = catalog.find_transfer_job(name).await? {
        if job.needs_restart() {
            return Err(CatalogError::JobFailed {
                id: job.id,
                name: job.name,
                state: job.state,
            });
        }
        warn!(
            job = job.id,
            name,
            "transfer job already exists; make sure every dataset was transferred"
        );
        return Ok(job);
    }

    let job = catalog
        .create_transfer_job(&NewFileTransfer {
            name: name.to_string(),
            tag_name: tag.to_string(),
            from_storage: from.id,
            to_storage: to.id,
        })
        .await?;
    info!(job = job.id, name, tag, from = source, to = destination, "created transfer job");
    Ok(job)
}

/// Starts (or joins) a remote transfer and waits for it to finish.
pub async fn run_remote_transfer<C: JobCatalog + ?Sized>(
    catalog: &C,
    poller: &TaskPoller,
    source: &str,
    destination: &str,
    tag: &str,
    name: &str,
    cancel: &CancellationToken,
) -> Result<FileTransferJob, CatalogError> {
    let job = start_remote_transfer(catalog, source, destination, tag, name).await?;
    match poller
        .await_completion(&TransferJobStatus(catalog), &job.id, cancel)
        .await
    {
        Ok(_) => catalog.transfer_job(job.id).await,
        Err(PollError::TaskFailed { state, .. }) => Err(CatalogError::JobFailed {
            id: job.id,
            name: job.name,
            state,
        }),
        Err(e) => Err(e.into()),
    }
}

/// Waits for several catalog tasks, in order.
pub async fn wait_for_tasks<C: JobCatalog + ?Sized>(
    catalog: &C,
    poller: &TaskPoller,
    tasks: &[i64],
    cancel: &CancellationToken,
) -> Result<Vec<TaskStatus>, CatalogError> {
    Ok(poller
        .await_all(&SimpleTaskStatus(catalog), tasks, cancel)
        .await?)
}
