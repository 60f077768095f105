//! Host seam: the viewer's command executor and state queries, and the
//! execution contexts that decide which thread touches the viewer.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex, OnceLock, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};

use serde_json::{Map, Value};

use crate::error::{HostError, RuntimeError};
use crate::{lock_unpoisoned, panic_message};

/// Result of one scripting command on the viewer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostCommandOutcome {
    pub ok: bool,
    pub feedback_lines: Vec<String>,
    pub error: Option<String>,
}

impl HostCommandOutcome {
    #[must_use]
    pub fn success(feedback_lines: Vec<String>) -> Self {
        Self {
            ok: true,
            feedback_lines,
            error: None,
        }
    }

    #[must_use]
    pub fn failure(error: impl Into<String>, feedback_lines: Vec<String>) -> Self {
        Self {
            ok: false,
            feedback_lines,
            error: Some(error.into()),
        }
    }
}

/// The molecular viewer as seen by the agent.
///
/// Implementations are only ever called from the thread their
/// [`HostContext`] chooses.
pub trait ViewerHost: Send {
    fn execute(&mut self, command: &str) -> HostCommandOutcome;

    fn object_names(&mut self, enabled_only: bool) -> Result<Vec<String>, HostError>;

    fn selection_names(&mut self) -> Result<Vec<String>, HostError>;

    fn count_atoms(&mut self, selection: &str) -> Result<i64, HostError>;

    /// `model/chain/segi/resi/resn/name/index` identifiers of the atoms in
    /// `selection`.
    fn selection_atom_ids(&mut self, _selection: &str) -> Result<Vec<String>, HostError> {
        Ok(Vec::new())
    }

    /// Representation visibility per object.
    fn visibility(&mut self) -> Result<Value, HostError> {
        Ok(Value::Object(Map::new()))
    }

    /// The 18-value view matrix.
    fn view(&mut self) -> Result<Vec<f64>, HostError> {
        Ok(Vec::new())
    }

    fn viewport(&mut self) -> Result<Option<(u32, u32)>, HostError> {
        Ok(None)
    }

    /// Molecular objects in load order.
    fn object_list(&mut self) -> Result<Vec<String>, HostError> {
        self.object_names(false)
    }

    /// PNG bytes of the current framebuffer. Must not resize the viewport.
    fn capture_png(&mut self) -> Result<Vec<u8>, HostError>;

    /// Writes the host document to `path`.
    fn save_session(&mut self, path: &Path) -> Result<(), HostError>;
}

/// Unit of work executed against the viewer.
pub type HostJob = Box<dyn FnOnce(&mut dyn ViewerHost) + Send>;

/// Decides where host jobs run.
pub trait HostContext: Send + Sync {
    fn dispatch(&self, job: HostJob) -> Result<(), RuntimeError>;
}

/// Runs `call` on the host context and waits for its result.
///
/// A job that panics on a [`HostThread`] is reported as
/// [`RuntimeError::HostUnavailable`].
pub fn run_on_host<R, F>(context: &dyn HostContext, call: F) -> Result<R, RuntimeError>
where
    R: Send + 'static,
    F: FnOnce(&mut dyn ViewerHost) -> R + Send + 'static,
{
    let (sender, receiver) = mpsc::channel();
    context.dispatch(Box::new(move |host| {
        let _ = sender.send(call(host));
    }))?;
    receiver.recv().map_err(|_| RuntimeError::HostUnavailable)
}

/// Runs every job on the calling thread under a mutex.
pub struct InlineHostContext {
    host: Mutex<Box<dyn ViewerHost>>,
}

impl InlineHostContext {
    #[must_use]
    pub fn new(host: impl ViewerHost + 'static) -> Self {
        Self {
            host: Mutex::new(Box::new(host)),
        }
    }
}

impl HostContext for InlineHostContext {
    fn dispatch(&self, job: HostJob) -> Result<(), RuntimeError> {
        let mut host = lock_unpoisoned(&self.host);
        catch_unwind(AssertUnwindSafe(|| job(host.as_mut()))).map_err(|payload| {
            RuntimeError::HostPanicked {
                message: panic_message(payload.as_ref()),
            }
        })
    }
}

#[derive(Default)]
struct JobQueue {
    jobs: VecDeque<HostJob>,
    closed: bool,
}

struct HostThreadShared {
    host: Mutex<Box<dyn ViewerHost>>,
    queue: Mutex<JobQueue>,
    ready: Condvar,
    owner: OnceLock<ThreadId>,
}

impl HostThreadShared {
    fn is_owner(&self) -> bool {
        self.owner.get() == Some(&thread::current().id())
    }

    fn run_job(&self, job: HostJob) {
        let mut host = lock_unpoisoned(&self.host);
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| job(host.as_mut()))) {
            tracing::error!(
                target: "mol_agent",
                panic = %panic_message(payload.as_ref()),
                "host job panicked"
            );
        }
    }

    fn next_job(&self, block: bool) -> Option<HostJob> {
        let mut queue = lock_unpoisoned(&self.queue);
        loop {
            if let Some(job) = queue.jobs.pop_front() {
                return Some(job);
            }
            if queue.closed || !block {
                return None;
            }
            queue = self
                .ready
                .wait(queue)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn serve(&self) {
        while let Some(job) = self.next_job(true) {
            self.run_job(job);
        }
    }
}

/// Marshals host jobs onto one owner thread.
///
/// Jobs dispatched from the owner thread run in place. Other threads queue
/// the job and block in [`run_on_host`] until the owner runs it.
pub struct HostThread {
    shared: Arc<HostThreadShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl HostThread {
    /// Starts a dedicated thread that owns `host`.
    pub fn spawn(host: impl ViewerHost + 'static) -> Result<Self, RuntimeError> {
        let shared = Self::shared(Box::new(host));
        let serving = Arc::clone(&shared);
        let name = "mol-agent-host";
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let _ = serving.owner.set(thread::current().id());
                serving.serve();
            })
            .map_err(|source| RuntimeError::spawn(name, source))?;

        Ok(Self {
            shared,
            worker: Mutex::new(Some(handle)),
        })
    }

    /// Makes the calling thread the owner. That thread must call
    /// [`HostThread::run_pending`] from its event loop.
    #[must_use]
    pub fn adopt_current(host: impl ViewerHost + 'static) -> Self {
        let shared = Self::shared(Box::new(host));
        let _ = shared.owner.set(thread::current().id());
        Self {
            shared,
            worker: Mutex::new(None),
        }
    }

    fn shared(host: Box<dyn ViewerHost>) -> Arc<HostThreadShared> {
        Arc::new(HostThreadShared {
            host: Mutex::new(host),
            queue: Mutex::new(JobQueue::default()),
            ready: Condvar::new(),
            owner: OnceLock::new(),
        })
    }

    /// Runs queued jobs on the owner thread. Returns how many ran; always
    /// zero off the owner thread.
    pub fn run_pending(&self) -> usize {
        if !self.shared.is_owner() {
            return 0;
        }
        let mut ran = 0usize;
        while let Some(job) = self.shared.next_job(false) {
            self.shared.run_job(job);
            ran += 1;
        }
        ran
    }

    /// Stops accepting jobs and joins the dedicated thread, if any. Jobs
    /// still queued are dropped.
    pub fn shutdown(&self) {
        {
            let mut queue = lock_unpoisoned(&self.shared.queue);
            queue.closed = true;
            queue.jobs.clear();
        }
        self.shared.ready.notify_all();
        if let Some(handle) = lock_unpoisoned(&self.worker).take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl HostContext for HostThread {
    fn dispatch(&self, job: HostJob) -> Result<(), RuntimeError> {
        if self.shared.is_owner() {
            self.shared.run_job(job);
            return Ok(());
        }

        let mut queue = lock_unpoisoned(&self.shared.queue);
        if queue.closed {
            return Err(RuntimeError::HostUnavailable);
        }
        queue.jobs.push_back(job);
        drop(queue);
        self.shared.ready.notify_one();
        Ok(())
    }
}

impl Drop for HostThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::demo::DemoViewer;

    #[test]
    fn inline_context_runs_jobs_in_place() {
        let context = InlineHostContext::new(DemoViewer::new());

        let outcome = run_on_host(&context, |host| host.execute("fetch 1ubq"))
            .expect("inline dispatch should succeed");

        assert!(outcome.ok);
    }

    #[test]
    fn inline_context_reports_panicking_jobs() {
        let context = InlineHostContext::new(DemoViewer::new());

        let error = run_on_host(&context, |_host| -> usize { panic!("viewer crashed") })
            .expect_err("panic should surface as an error");

        assert!(matches!(error, RuntimeError::HostPanicked { ref message } if message == "viewer crashed"));
    }

    #[test]
    fn dedicated_thread_serves_other_threads() {
        let viewer = DemoViewer::new();
        let context = Arc::new(HostThread::spawn(viewer.clone()).expect("host thread should spawn"));

        let remote = Arc::clone(&context);
        let thread_name = thread::spawn(move || {
            run_on_host(remote.as_ref(), |_host| {
                thread::current().name().map(str::to_string)
            })
        })
        .join()
        .expect("caller thread should finish")
        .expect("dispatch should succeed");

        assert_eq!(thread_name.as_deref(), Some("mol-agent-host"));
        context.shutdown();
        assert!(matches!(
            run_on_host(context.as_ref(), |host| host.execute("zoom")),
            Err(RuntimeError::HostUnavailable)
        ));
    }

    #[test]
    fn adopted_thread_runs_queued_jobs_when_pumped() {
        let context = Arc::new(HostThread::adopt_current(DemoViewer::new()));
        let remote = Arc::clone(&context);
        let caller = thread::spawn(move || {
            run_on_host(remote.as_ref(), |host| host.execute("fetch 1crn").ok)
        });

        let mut ran = 0;
        for _ in 0..200 {
            ran += context.run_pending();
            if ran > 0 {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }

        assert_eq!(ran, 1);
        assert_eq!(
            caller.join().expect("caller thread should finish").ok(),
            Some(true)
        );
        assert!(
            run_on_host(context.as_ref(), |host| host.execute("zoom").ok)
                .expect("owner-thread dispatch runs in place")
        );
    }
}
