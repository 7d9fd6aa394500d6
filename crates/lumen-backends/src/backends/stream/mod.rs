//! Stream engine: an asynchronous, queue-driven device
//!
//! A dedicated worker thread drains a FIFO command queue, so submissions
//! return immediately and complete in submission order. Each command carries
//! the event of the previous stream tail as its dependency and publishes its
//! own completion event as the new tail.
//!
//! ```text
//! submitter ──send──▶ [ copy ][ kernel ][ host fn ] ──▶ worker thread
//!     │                                                      │
//!     └── tail: Event ◀──────────── complete / fail ─────────┘
//! ```
//!
//! A failed command invalidates the engine: everything queued behind it is
//! discarded, `wait` reports `DeviceError`, and later submissions are refused.

mod event;

pub use event::Event;

use crate::backend::{BufferHandle, DeviceCaps, Engine, EngineConfig, HostFunc, Kernel, Storage};
use crate::backends::common::MemoryManager;
use crate::error::{BackendError, Result};
use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

enum Command {
    Copy {
        dst: BufferHandle,
        src: BufferHandle,
        byte_size: usize,
    },
    HostFunc(HostFunc),
    Barrier,
    Kernel(Kernel),
}

impl Command {
    fn label(&self) -> &'static str {
        match self {
            Command::Copy { .. } => "copy",
            Command::HostFunc(_) => "host_func",
            Command::Barrier => "barrier",
            Command::Kernel(_) => "kernel",
        }
    }
}

struct Submission {
    command: Command,
    depends_on: Option<Event>,
    done: Event,
}

/// First failure observed on the stream
type FailureSlot = Arc<Mutex<Option<String>>>;

/// Asynchronous engine backed by a worker thread
pub struct StreamEngine {
    caps: DeviceCaps,
    memory: Arc<MemoryManager>,
    sender: Mutex<Option<mpsc::Sender<Submission>>>,
    tail: Mutex<Option<Event>>,
    failure: FailureSlot,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl StreamEngine {
    pub fn new() -> Result<Self> {
        Self::with_config(EngineConfig::default())
    }

    #[tracing::instrument(skip(config), fields(capacity = ?config.capacity))]
    pub fn with_config(config: EngineConfig) -> Result<Self> {
        let caps = config.caps.unwrap_or_else(DeviceCaps::stream);
        let supported = Storage::ALL
            .into_iter()
            .filter(|&storage| caps.supports_storage(storage))
            .collect();
        let memory = Arc::new(MemoryManager::new("stream", supported, config.capacity));
        let failure: FailureSlot = Arc::new(Mutex::new(None));

        let (sender, receiver) = mpsc::channel();
        let worker_memory = Arc::clone(&memory);
        let worker_failure = Arc::clone(&failure);
        let worker = thread::Builder::new()
            .name("lumen-stream".to_string())
            .spawn(move || run_worker(receiver, worker_memory, worker_failure))
            .map_err(|err| BackendError::DeviceError(format!("failed to start stream worker: {err}")))?;

        tracing::debug!(arch = ?caps.arch, max_work_group_size = caps.max_work_group_size, "stream_engine_created");
        Ok(Self {
            caps,
            memory,
            sender: Mutex::new(Some(sender)),
            tail: Mutex::new(None),
            failure,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn memory(&self) -> &MemoryManager {
        &self.memory
    }

    /// Whether the most recent submission is still outstanding
    pub fn has_pending_work(&self) -> bool {
        self.tail.lock().as_ref().is_some_and(Event::is_pending)
    }

    /// Whether an earlier command failed
    pub fn is_invalidated(&self) -> bool {
        self.failure.lock().is_some()
    }

    fn submit(&self, command: Command) -> Result<()> {
        if let Some(reason) = self.failure.lock().clone() {
            return Err(BackendError::EngineInvalidated(reason));
        }

        let mut tail = self.tail.lock();
        let done = Event::new();
        let label = command.label();
        let submission = Submission {
            command,
            depends_on: tail.clone(),
            done: done.clone(),
        };

        let sender = self.sender.lock();
        sender
            .as_ref()
            .ok_or_else(|| BackendError::DeviceError("stream is closed".to_string()))?
            .send(submission)
            .map_err(|_| BackendError::DeviceError("stream worker has exited".to_string()))?;

        tracing::trace!(command = label, "stream_submit");
        *tail = Some(done);
        Ok(())
    }
}

fn run_worker(receiver: mpsc::Receiver<Submission>, memory: Arc<MemoryManager>, failure: FailureSlot) {
    for Submission {
        command,
        depends_on,
        done,
    } in receiver
    {
        if let Some(Err(reason)) = depends_on.as_ref().map(Event::wait) {
            done.fail(reason);
            continue;
        }
        if let Some(reason) = failure.lock().clone() {
            done.fail(reason);
            continue;
        }

        let label = command.label();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| match command {
            Command::Copy { dst, src, byte_size } => memory.copy(dst, src, byte_size),
            Command::HostFunc(func) => func(),
            Command::Barrier => Ok(()),
            Command::Kernel(kernel) => kernel(&memory),
        }));

        let result = match outcome {
            Ok(result) => result.map_err(|err| err.to_string()),
            Err(_) => Err(format!("{label} command panicked")),
        };

        match result {
            Ok(()) => done.complete(),
            Err(reason) => {
                tracing::error!(command = label, %reason, "stream_command_failed");
                *failure.lock() = Some(reason.clone());
                done.fail(reason);
            }
        }
    }
}

impl std::fmt::Debug for StreamEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamEngine")
            .field("caps", &self.caps)
            .field("invalidated", &self.is_invalidated())
            .finish_non_exhaustive()
    }
}

impl Engine for StreamEngine {
    fn name(&self) -> &str {
        "stream"
    }

    fn caps(&self) -> &DeviceCaps {
        &self.caps
    }

    fn is_synchronous(&self) -> bool {
        false
    }

    fn allocate(&self, byte_size: usize, storage: Storage) -> Result<BufferHandle> {
        let start = std::time::Instant::now();
        let handle = self.memory.allocate(byte_size, storage)?;
        lumen_tracing::performance::record_allocation(byte_size, storage.as_str(), start.elapsed().as_micros() as u64);
        Ok(handle)
    }

    fn free(&self, handle: BufferHandle, storage: Storage) -> Result<()> {
        self.memory.free(handle, storage)
    }

    fn buffer_size(&self, handle: BufferHandle) -> Result<usize> {
        self.memory.size(handle)
    }

    fn submit_copy(&self, dst: BufferHandle, src: BufferHandle, byte_size: usize) -> Result<()> {
        self.submit(Command::Copy { dst, src, byte_size })
    }

    fn submit_host_func(&self, func: HostFunc) -> Result<()> {
        self.submit(Command::HostFunc(func))
    }

    fn submit_barrier(&self) -> Result<()> {
        self.submit(Command::Barrier)
    }

    fn submit_kernel(&self, kernel: Kernel) -> Result<()> {
        self.submit(Command::Kernel(kernel))
    }

    fn wait(&self) -> Result<()> {
        let tail = self.tail.lock().take();
        if let Some(event) = tail {
            event.wait().map_err(BackendError::DeviceError)?;
        }
        match self.failure.lock().clone() {
            Some(reason) => Err(BackendError::DeviceError(reason)),
            None => Ok(()),
        }
    }

    fn write_host(&self, handle: BufferHandle, offset: usize, data: &[u8]) -> Result<()> {
        self.memory.write_host(handle, offset, data)
    }

    fn read_host(&self, handle: BufferHandle, offset: usize, out: &mut [u8]) -> Result<()> {
        self.memory.read_host(handle, offset, out)
    }
}

impl Drop for StreamEngine {
    fn drop(&mut self) {
        // Closing the channel lets the worker drain the queue and exit.
        self.sender.lock().take();
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                tracing::warn!("stream worker terminated abnormally");
            }
        }
    }
}
