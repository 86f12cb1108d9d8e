use std::collections::HashMap;
use std::fmt;
use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_queue::SegQueue;
use flume::Sender;

use pledge_api::errors::TaskError;
use pledge_api::sync::lock;
use pledge_api::task::{Request, Response, Value, WorkItem};
use tracing::{debug, warn};

use crate::config::ProcessPoolConfig;
use crate::log_error;

type Reply = Sender<Result<Value, TaskError>>;
type Pending = Arc<Mutex<HashMap<u64, Reply>>>;

const EXIT_GRACE: Duration = Duration::from_secs(2);
const EXIT_POLL: Duration = Duration::from_millis(10);

/// One child process serving task requests, plus the thread reading its
/// responses.
pub(crate) struct ProcessWorker {
    /// Slot number in the pool
    slot: usize,

    /// OS process id of the child
    pid: u32,

    child: Mutex<Child>,

    /// Request stream; taken on shutdown to signal EOF
    stdin: Mutex<Option<ChildStdin>>,

    /// Reply channels of requests still waiting for a response
    pending: Pending,

    /// Cleared by the reader thread once the response stream ends
    alive: Arc<AtomicBool>,

    /// Set on deliberate shutdown so the exit is not reported as an error
    closing: Arc<AtomicBool>,

    reader: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for ProcessWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessWorker")
            .field("slot", &self.slot)
            .field("pid", &self.pid)
            .field("alive", &self.alive.load(Ordering::SeqCst))
            .field("pending", &lock(&self.pending).len())
            .finish()
    }
}

impl ProcessWorker {
    pub(crate) fn spawn(
        slot: usize,
        config: &ProcessPoolConfig,
        errors: Arc<SegQueue<TaskError>>,
    ) -> Result<Self, TaskError> {
        let mut child = Command::new(&config.program)
            .args(&config.args)
            .envs(config.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| {
                TaskError::transport(format!(
                    "failed to spawn worker {}: {e}",
                    config.program.display()
                ))
            })?;

        let pid = child.id();
        let (stdin, stdout) = match (child.stdin.take(), child.stdout.take()) {
            (Some(stdin), Some(stdout)) => (stdin, stdout),
            _ => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(TaskError::transport("worker pipes were not captured"));
            }
        };

        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let alive = Arc::new(AtomicBool::new(true));
        let closing = Arc::new(AtomicBool::new(false));

        let reader = {
            let pending = Arc::clone(&pending);
            let alive = Arc::clone(&alive);
            let closing = Arc::clone(&closing);
            thread::Builder::new()
                .name(format!("pledge-process-{slot}"))
                .spawn(move || read_responses(slot, stdout, pending, alive, closing, errors))
        };
        let reader = match reader {
            Ok(handle) => handle,
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(TaskError::transport(format!(
                    "failed to spawn reader thread: {e}"
                )));
            }
        };

        debug!(slot, pid, "Worker process started");
        Ok(Self {
            slot,
            pid,
            child: Mutex::new(child),
            stdin: Mutex::new(Some(stdin)),
            pending,
            alive,
            closing,
            reader: Mutex::new(Some(reader)),
        })
    }

    pub(crate) fn pid(&self) -> u32 {
        self.pid
    }

    pub(crate) fn is_alive(&self) -> bool {
        if !self.alive.load(Ordering::SeqCst) {
            return false;
        }
        matches!(lock(&self.child).try_wait(), Ok(None))
    }

    /// Number of requests sent and not answered yet.
    pub(crate) fn in_flight(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Send one request; the response arrives on the returned channel.
    pub(crate) fn send(
        &self,
        id: u64,
        item: WorkItem,
    ) -> Result<flume::Receiver<Result<Value, TaskError>>, TaskError> {
        let (tx, rx) = flume::bounded(1);

        // Checked under the pending lock: the reader clears `alive` under it
        // before failing everything still pending.
        {
            let mut pending = lock(&self.pending);
            if !self.alive.load(Ordering::SeqCst) {
                return Err(self.exited("response stream closed"));
            }
            pending.insert(id, tx);
        }

        let request = Request { id, item };
        if let Err(e) = self.write(&request) {
            lock(&self.pending).remove(&id);
            return Err(self.exited(&e));
        }
        Ok(rx)
    }

    fn write(&self, request: &Request) -> Result<(), String> {
        let mut guard = lock(&self.stdin);
        let stdin = guard.as_mut().ok_or_else(|| "stdin closed".to_string())?;

        serde_json::to_writer(&mut *stdin, request).map_err(|e| e.to_string())?;
        stdin.write_all(b"\n").map_err(|e| e.to_string())?;
        stdin.flush().map_err(|e| e.to_string())
    }

    fn exited(&self, reason: &str) -> TaskError {
        TaskError::WorkerExited {
            worker: self.slot,
            reason: reason.to_string(),
        }
    }

    /// Close the request stream, give the child a grace period to exit, then
    /// kill it. Requests still in flight fail with `WorkerExited`; the exit is
    /// not reported as an error.
    pub(crate) fn shutdown(&self) {
        self.closing.store(true, Ordering::SeqCst);
        self.reap();
    }

    /// Collect a worker whose exit is still reported to the pool's errors.
    pub(crate) fn reap(&self) {
        drop(lock(&self.stdin).take());

        {
            let mut child = lock(&self.child);
            let deadline = Instant::now() + EXIT_GRACE;
            loop {
                match child.try_wait() {
                    Ok(Some(status)) => {
                        debug!(slot = self.slot, pid = self.pid, %status, "Worker process exited");
                        break;
                    }
                    Ok(None) if Instant::now() < deadline => thread::sleep(EXIT_POLL),
                    Ok(None) => {
                        warn!(slot = self.slot, pid = self.pid, "Killing unresponsive worker");
                        let _ = child.kill();
                        let _ = child.wait();
                        break;
                    }
                    Err(e) => {
                        log_error!(e, slot = self.slot, pid = self.pid);
                        let _ = child.kill();
                        break;
                    }
                }
            }
        }

        if let Some(reader) = lock(&self.reader).take() {
            if reader.join().is_err() {
                warn!(slot = self.slot, "Response reader thread panicked");
            }
        }
    }
}

impl Drop for ProcessWorker {
    fn drop(&mut self) {
        if lock(&self.reader).is_some() {
            self.shutdown();
        }
    }
}

fn read_responses(
    slot: usize,
    stdout: ChildStdout,
    pending: Pending,
    alive: Arc<AtomicBool>,
    closing: Arc<AtomicBool>,
    errors: Arc<SegQueue<TaskError>>,
) {
    let mut reason = "stdout closed".to_string();

    for line in BufReader::new(stdout).lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                reason = format!("stdout read failed: {e}");
                break;
            }
        };

        match serde_json::from_str::<Response>(&line) {
            Ok(response) => match lock(&pending).remove(&response.id) {
                Some(reply) => {
                    let _ = reply.send(response.outcome.into());
                }
                None => warn!(slot, id = response.id, "Response for unknown request"),
            },
            Err(e) => warn!(slot, error = %e, "Discarding malformed response"),
        }
    }

    let error = TaskError::WorkerExited {
        worker: slot,
        reason,
    };
    let orphaned: Vec<Reply> = {
        let mut pending = lock(&pending);
        alive.store(false, Ordering::SeqCst);
        pending.drain().map(|(_, reply)| reply).collect()
    };
    for reply in orphaned {
        let _ = reply.send(Err(error.clone()));
    }

    if !closing.load(Ordering::SeqCst) {
        log_error!(error, slot);
        errors.push(error);
    }
}
