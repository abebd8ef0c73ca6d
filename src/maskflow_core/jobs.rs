use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{error, info};

use crate::maskflow_core::error::EngineError;
use crate::sync_ext::{CondvarExt, MutexExt};

pub const JOB_TYPE_PROPAGATE: &str = "propagate_masks";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// A background job record. Once terminal, no field mutates; results are
/// sanitized before storage so the record stays small (§ result contract:
/// per-frame pixel data lives in the session, never here).
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub job_id: String,
    pub job_type: String,
    pub status: JobStatus,
    /// Percentage in [0, 100].
    pub progress: f64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub params: Value,
}

/// The work a job runs. The context exposes progress publishing and the
/// cooperative cancellation flag.
pub type JobTask = Box<dyn FnOnce(&JobContext) -> Result<Value, EngineError> + Send + 'static>;

struct JobTable {
    jobs: HashMap<String, Job>,
    queue: VecDeque<(String, JobTask)>,
    cancel_requests: HashSet<String>,
    shutting_down: bool,
}

struct JobsInner {
    state: Mutex<JobTable>,
    cv: Condvar,
}

/// Handed to a running task so it can publish progress and observe
/// cancellation between frames.
pub struct JobContext {
    job_id: String,
    inner: Arc<JobsInner>,
}

impl JobContext {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn update_progress(&self, progress: f64) {
        let mut state = self.inner.state.lock_unpoisoned();
        if let Some(job) = state.jobs.get_mut(&self.job_id)
            && !job.status.is_terminal()
        {
            job.progress = progress.clamp(0.0, 100.0);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner
            .state
            .lock_unpoisoned()
            .cancel_requests
            .contains(&self.job_id)
    }
}

/// Bounded worker pool executing submitted tasks. `submit` returns
/// immediately; with every worker busy the job simply stays `pending`
/// until one frees up.
#[derive(Clone)]
pub struct JobManager {
    inner: Arc<JobsInner>,
    workers: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

// Any object-shaped result loses its `frames` key before storage: that is
// where per-frame blobs accumulate, and job records must stay small.
fn sanitize_result(mut value: Value) -> Value {
    if let Value::Object(ref mut map) = value {
        map.remove("frames");
    }
    value
}

fn worker_loop(inner: Arc<JobsInner>) {
    loop {
        let (job_id, task) = {
            let mut state = inner.state.lock_unpoisoned();
            let next = loop {
                if let Some(next) = state.queue.pop_front() {
                    break next;
                }
                if state.shutting_down {
                    return;
                }
                state = inner.cv.wait_unpoisoned(state);
            };
            // Transition under the same lock as the pop so a concurrent
            // cancel can never observe a popped-but-still-pending job.
            if let Some(job) = state.jobs.get_mut(&next.0) {
                job.status = JobStatus::Running;
                job.started_at = Some(Utc::now());
            }
            next
        };
        info!(job_id, "job started");

        let context = JobContext {
            job_id: job_id.clone(),
            inner: inner.clone(),
        };
        let outcome = task(&context);

        let mut state = inner.state.lock_unpoisoned();
        state.cancel_requests.remove(&job_id);
        if let Some(job) = state.jobs.get_mut(&job_id) {
            job.completed_at = Some(Utc::now());
            match outcome {
                Ok(result) => {
                    job.status = JobStatus::Completed;
                    job.progress = 100.0;
                    job.result = Some(sanitize_result(result));
                    info!(job_id, "job completed");
                }
                Err(err) => {
                    job.status = JobStatus::Failed;
                    job.error = Some(err.to_string());
                    error!(job_id, error = %err, "job failed");
                }
            }
        }
    }
}

impl JobManager {
    pub fn new(max_workers: usize) -> Self {
        let inner = Arc::new(JobsInner {
            state: Mutex::new(JobTable {
                jobs: HashMap::new(),
                queue: VecDeque::new(),
                cancel_requests: HashSet::new(),
                shutting_down: false,
            }),
            cv: Condvar::new(),
        });

        let mut handles = Vec::with_capacity(max_workers.max(1));
        for index in 0..max_workers.max(1) {
            let inner_clone = inner.clone();
            let handle = thread::Builder::new()
                .name(format!("maskflow-job-worker-{index}"))
                .spawn(move || worker_loop(inner_clone))
                .expect("failed to spawn job worker thread");
            handles.push(handle);
        }

        Self {
            inner,
            workers: Arc::new(Mutex::new(handles)),
        }
    }

    pub fn submit(
        &self,
        job_type: &str,
        params: Value,
        task: JobTask,
    ) -> Result<String, EngineError> {
        let job_id = uuid::Uuid::new_v4().to_string();
        {
            let mut state = self.inner.state.lock_unpoisoned();
            if state.shutting_down {
                return Err(EngineError::ShuttingDown);
            }
            state.jobs.insert(
                job_id.clone(),
                Job {
                    job_id: job_id.clone(),
                    job_type: job_type.to_string(),
                    status: JobStatus::Pending,
                    progress: 0.0,
                    created_at: Utc::now(),
                    started_at: None,
                    completed_at: None,
                    result: None,
                    error: None,
                    params,
                },
            );
            state.queue.push_back((job_id.clone(), task));
        }
        self.inner.cv.notify_one();
        info!(job_id, job_type, "job submitted");
        Ok(job_id)
    }

    pub fn get(&self, job_id: &str) -> Option<Job> {
        self.inner.state.lock_unpoisoned().jobs.get(job_id).cloned()
    }

    /// Request cancellation. A pending job fails immediately without ever
    /// running; a running job observes the request at its next frame
    /// boundary. Terminal jobs are left untouched.
    pub fn cancel(&self, job_id: &str) -> Option<Job> {
        let mut state = self.inner.state.lock_unpoisoned();
        let status = state.jobs.get(job_id)?.status;
        match status {
            JobStatus::Pending => {
                state.queue.retain(|(queued_id, _)| queued_id != job_id);
                if let Some(job) = state.jobs.get_mut(job_id) {
                    job.status = JobStatus::Failed;
                    job.error = Some("cancelled".to_string());
                    job.completed_at = Some(Utc::now());
                }
            }
            JobStatus::Running => {
                state.cancel_requests.insert(job_id.to_string());
            }
            JobStatus::Completed | JobStatus::Failed => {}
        }
        state.jobs.get(job_id).cloned()
    }

    /// Remove terminal jobs older than the retention window.
    pub fn cleanup_old_jobs(&self, retention: Duration) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(retention).unwrap_or_else(|_| chrono::Duration::zero());
        let mut state = self.inner.state.lock_unpoisoned();
        let stale: Vec<String> = state
            .jobs
            .values()
            .filter(|job| {
                job.status.is_terminal()
                    && job.completed_at.is_some_and(|completed| completed < cutoff)
            })
            .map(|job| job.job_id.clone())
            .collect();
        for job_id in &stale {
            state.jobs.remove(job_id);
        }
        if !stale.is_empty() {
            info!(count = stale.len(), "reaped old jobs");
        }
        stale.len()
    }

    /// Stop accepting work, drain the queue, and wait for the workers.
    pub fn shutdown(&self) {
        {
            let mut state = self.inner.state.lock_unpoisoned();
            state.shutting_down = true;
        }
        self.inner.cv.notify_all();
        let handles: Vec<JoinHandle<()>> = self.workers.lock_unpoisoned().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Instant;

    fn wait_for_status(manager: &JobManager, job_id: &str, status: JobStatus) -> Job {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let job = manager.get(job_id).expect("job exists");
            if job.status == status {
                return job;
            }
            assert!(Instant::now() < deadline, "timed out waiting for {status:?}");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn completed_job_reaches_full_progress_with_sanitized_result() {
        let manager = JobManager::new(1);
        let job_id = manager
            .submit(
                JOB_TYPE_PROPAGATE,
                serde_json::json!({"session_id": "s"}),
                Box::new(|_ctx| {
                    Ok(serde_json::json!({
                        "session_id": "s",
                        "frames": {"0": [1]},
                        "frames_covered": 1,
                    }))
                }),
            )
            .unwrap();

        let job = wait_for_status(&manager, &job_id, JobStatus::Completed);
        assert_eq!(job.progress, 100.0);
        let result = job.result.expect("result stored");
        assert!(result.get("frames").is_none(), "frames key must be stripped");
        assert_eq!(result.get("frames_covered").and_then(Value::as_u64), Some(1));
        assert!(job.started_at.unwrap() >= job.created_at);
        assert!(job.completed_at.unwrap() >= job.started_at.unwrap());
        manager.shutdown();
    }

    #[test]
    fn failed_job_records_the_error() {
        let manager = JobManager::new(1);
        let job_id = manager
            .submit(
                "doomed",
                Value::Null,
                Box::new(|_ctx| Err(EngineError::SessionNotFound("nope".to_string()))),
            )
            .unwrap();

        let job = wait_for_status(&manager, &job_id, JobStatus::Failed);
        assert!(job.error.unwrap().contains("nope"));
        manager.shutdown();
    }

    #[test]
    fn jobs_queue_as_pending_while_the_pool_is_full() {
        let manager = JobManager::new(1);
        let release = Arc::new(AtomicBool::new(false));

        let gate = release.clone();
        let blocker = manager
            .submit(
                "blocker",
                Value::Null,
                Box::new(move |_ctx| {
                    while !gate.load(Ordering::Relaxed) {
                        thread::sleep(Duration::from_millis(2));
                    }
                    Ok(Value::Null)
                }),
            )
            .unwrap();
        let queued = manager
            .submit("queued", Value::Null, Box::new(|_ctx| Ok(Value::Null)))
            .unwrap();

        wait_for_status(&manager, &blocker, JobStatus::Running);
        assert_eq!(manager.get(&queued).unwrap().status, JobStatus::Pending);

        release.store(true, Ordering::Relaxed);
        wait_for_status(&manager, &queued, JobStatus::Completed);
        manager.shutdown();
    }

    #[test]
    fn cancelling_a_pending_job_fails_it_without_running() {
        let manager = JobManager::new(1);
        let release = Arc::new(AtomicBool::new(false));
        let gate = release.clone();
        let blocker = manager
            .submit(
                "blocker",
                Value::Null,
                Box::new(move |_ctx| {
                    while !gate.load(Ordering::Relaxed) {
                        thread::sleep(Duration::from_millis(2));
                    }
                    Ok(Value::Null)
                }),
            )
            .unwrap();
        let ran = Arc::new(AtomicBool::new(false));
        let ran_flag = ran.clone();
        let queued = manager
            .submit(
                "queued",
                Value::Null,
                Box::new(move |_ctx| {
                    ran_flag.store(true, Ordering::Relaxed);
                    Ok(Value::Null)
                }),
            )
            .unwrap();

        wait_for_status(&manager, &blocker, JobStatus::Running);
        let cancelled = manager.cancel(&queued).unwrap();
        assert_eq!(cancelled.status, JobStatus::Failed);
        assert_eq!(cancelled.error.as_deref(), Some("cancelled"));

        release.store(true, Ordering::Relaxed);
        wait_for_status(&manager, &blocker, JobStatus::Completed);
        assert!(!ran.load(Ordering::Relaxed));
        manager.shutdown();
    }

    #[test]
    fn cancelling_a_running_job_is_cooperative() {
        let manager = JobManager::new(1);
        let job_id = manager
            .submit(
                "loop",
                Value::Null,
                Box::new(|ctx| {
                    loop {
                        if ctx.is_cancelled() {
                            return Err(EngineError::Cancelled);
                        }
                        thread::sleep(Duration::from_millis(2));
                    }
                }),
            )
            .unwrap();

        wait_for_status(&manager, &job_id, JobStatus::Running);
        manager.cancel(&job_id);
        let job = wait_for_status(&manager, &job_id, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some("cancelled"));
        manager.shutdown();
    }

    #[test]
    fn terminal_jobs_do_not_mutate_on_progress_or_cancel() {
        let manager = JobManager::new(1);
        let job_id = manager
            .submit("quick", Value::Null, Box::new(|_ctx| Ok(Value::Null)))
            .unwrap();
        let done = wait_for_status(&manager, &job_id, JobStatus::Completed);

        let after_cancel = manager.cancel(&job_id).unwrap();
        assert_eq!(after_cancel.status, JobStatus::Completed);
        assert_eq!(after_cancel.completed_at, done.completed_at);

        let context = JobContext {
            job_id: job_id.clone(),
            inner: manager.inner.clone(),
        };
        context.update_progress(3.0);
        assert_eq!(manager.get(&job_id).unwrap().progress, 100.0);
        manager.shutdown();
    }

    #[test]
    fn cleanup_reaps_only_old_terminal_jobs() {
        let manager = JobManager::new(1);
        let job_id = manager
            .submit("quick", Value::Null, Box::new(|_ctx| Ok(Value::Null)))
            .unwrap();
        wait_for_status(&manager, &job_id, JobStatus::Completed);

        assert_eq!(manager.cleanup_old_jobs(Duration::from_secs(3600)), 0);
        assert!(manager.get(&job_id).is_some());
        thread::sleep(Duration::from_millis(10));
        assert_eq!(manager.cleanup_old_jobs(Duration::from_millis(1)), 1);
        assert!(manager.get(&job_id).is_none());
        manager.shutdown();
    }

    #[test]
    fn shutdown_drains_queued_work_before_returning() {
        let manager = JobManager::new(1);
        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(
                manager
                    .submit(
                        "drain",
                        Value::Null,
                        Box::new(|_ctx| {
                            thread::sleep(Duration::from_millis(10));
                            Ok(Value::Null)
                        }),
                    )
                    .unwrap(),
            );
        }
        manager.shutdown();
        for job_id in ids {
            assert_eq!(manager.get(&job_id).unwrap().status, JobStatus::Completed);
        }
        assert!(manager.submit("late", Value::Null, Box::new(|_ctx| Ok(Value::Null))).is_err());
    }
}
