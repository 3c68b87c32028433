//! The Execution Context (§4.2): the core concurrency primitive of one
//! worker. An EC owns a single interpreter handle, a bounded channel of
//! interpreter tasks consumed by one dedicated thread, a bounded channel of
//! native tasks consumed by a fixed pool of threads, and a [`ResourcePool`]
//! for deferred releases. Interpreter tasks never suspend; native tasks may
//! block indefinitely. The only path for a native task to resume script
//! execution is to enqueue a fresh interpreter task — the callback bridge
//! described in §4.2.

mod task;

pub use task::{InterpreterFn, InterpreterTask, NativeFn, NativeTask};

use mesh_common::MeshError;
use mesh_resource::ResourcePool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub type ErrorSink = Arc<dyn Fn(MeshError) + Send + Sync>;

#[derive(Clone, Debug)]
pub struct ExecutionContextConfig {
    pub interpreter_queue_capacity: usize,
    pub native_queue_capacity: usize,
    /// `GoCallConcurrency` in §4.2: number of threads consuming native tasks.
    pub native_concurrency: usize,
}

impl Default for ExecutionContextConfig {
    fn default() -> Self {
        Self {
            interpreter_queue_capacity: 256,
            native_queue_capacity: 256,
            native_concurrency: 8,
        }
    }
}

struct Shared<H> {
    interpreter_tx: mpsc::Sender<InterpreterTask<H>>,
    native_tx: mpsc::Sender<NativeTask>,
    resources: ResourcePool,
    exit: CancellationToken,
}

/// The scheduler. Generic over the interpreter handle type `H` so the
/// scheduling machinery stays independent of any one embedded language
/// (§9 "Script-language interop").
pub struct ExecutionContext<H> {
    shared: Arc<Shared<H>>,
    handles: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl<H: Send + 'static> ExecutionContext<H> {
    /// Builds an EC and immediately starts its consumer threads/tasks
    /// (`Start()` in §4.2 is folded into construction here; there is no
    /// useful state between "created" and "started").
    pub fn start(config: ExecutionContextConfig, interpreter: H, error_sink: ErrorSink) -> Self {
        let (interpreter_tx, interpreter_rx) = mpsc::channel(config.interpreter_queue_capacity);
        let (native_tx, native_rx) = mpsc::channel(config.native_queue_capacity);
        let exit = CancellationToken::new();
        let resources = ResourcePool::new();

        let shared = Arc::new(Shared {
            interpreter_tx,
            native_tx,
            resources,
            exit: exit.clone(),
        });

        let mut handles = Vec::with_capacity(1 + config.native_concurrency);

        // The one dedicated interpreter thread. A std::thread (not a tokio
        // task) because `H` is typically !Send across await points and must
        // never be touched from more than one thread at a time.
        let interp_handle = spawn_interpreter_thread(interpreter, interpreter_rx, exit.clone(), error_sink.clone());
        handles.push(interp_handle);

        let native_rx = Arc::new(tokio::sync::Mutex::new(native_rx));
        for _ in 0..config.native_concurrency {
            let native_rx = native_rx.clone();
            let exit = exit.clone();
            let error_sink = error_sink.clone();
            handles.push(tokio::spawn(native_worker_loop(native_rx, exit, error_sink)));
        }

        Self {
            shared,
            handles: std::sync::Mutex::new(handles),
        }
    }

    /// Enqueues an interpreter task. Blocks the submitter once the channel is
    /// full — the only back-pressure mechanism (§5).
    pub async fn call_interpreter(&self, task: InterpreterTask<H>) -> Result<(), MeshError> {
        self.shared
            .interpreter_tx
            .send(task)
            .await
            .map_err(|_| MeshError::Transient("execution context is closed".into()))
    }

    /// Enqueues a native task. A native task MUST NOT call script APIs
    /// directly; to resume script execution it enqueues a fresh interpreter
    /// task from within its own body.
    pub async fn call_native(&self, task: NativeTask) -> Result<(), MeshError> {
        self.shared
            .native_tx
            .send(task)
            .await
            .map_err(|_| MeshError::Transient("execution context is closed".into()))
    }

    /// Non-blocking enqueue, for use from inside a synchronous interpreter
    /// task: the interpreter thread must never suspend, so a script-bound
    /// native function enqueues via `try_call_native` and returns to the
    /// script immediately. The actual work, and the callback that resumes
    /// the script, happen later on the native pool (§4.2 callback bridge).
    pub fn try_call_native(&self, task: NativeTask) -> Result<(), MeshError> {
        self.shared
            .native_tx
            .try_send(task)
            .map_err(|err| match err {
                mpsc::error::TrySendError::Full(_) => {
                    MeshError::Transient("native task queue is full".into())
                }
                mpsc::error::TrySendError::Closed(_) => {
                    MeshError::Transient("execution context is closed".into())
                }
            })
    }

    pub fn resources(&self) -> &ResourcePool {
        &self.shared.resources
    }

    pub fn exit_signal(&self) -> CancellationToken {
        self.shared.exit.clone()
    }

    /// Signals every consumer to exit, then drains the resource pool. Order
    /// matters: consumers stop touching resources before they're released.
    pub async fn close(&self) {
        self.shared.exit.cancel();
        let handles = std::mem::take(&mut *self.handles.lock().unwrap());
        for handle in handles {
            let _ = handle.await;
        }
        self.shared.resources.close().await;
    }
}

fn spawn_interpreter_thread<H: Send + 'static>(
    interpreter: H,
    mut rx: mpsc::Receiver<InterpreterTask<H>>,
    exit: CancellationToken,
    error_sink: ErrorSink,
) -> JoinHandle<()> {
    let (done_tx, done_rx) = tokio::sync::oneshot::channel();
    std::thread::Builder::new()
        .name("mesh-interpreter".to_string())
        .spawn(move || {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("failed to build interpreter-thread runtime");
            rt.block_on(async {
                loop {
                    tokio::select! {
                        _ = exit.cancelled() => break,
                        task = rx.recv() => {
                            match task {
                                Some(task) => {
                                    if let Some((err, handler)) = task.run(&interpreter) {
                                        match handler {
                                            Some(handler) => handler(err),
                                            None => error_sink(err),
                                        }
                                    }
                                }
                                None => break,
                            }
                        }
                    }
                }
            });
            let _ = done_tx.send(());
        })
        .expect("failed to spawn interpreter thread");

    // Wrap the OS thread's completion in a JoinHandle-shaped future so
    // `close()` can await every consumer uniformly.
    tokio::spawn(async move {
        let _ = done_rx.await;
    })
}

async fn native_worker_loop(
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<NativeTask>>>,
    exit: CancellationToken,
    error_sink: ErrorSink,
) {
    loop {
        let task = {
            let mut rx = rx.lock().await;
            tokio::select! {
                _ = exit.cancelled() => None,
                task = rx.recv() => task,
            }
        };
        let Some(task) = task else { break };
        let token = CancellationToken::new();
        let result = match task.timeout {
            Some(timeout) => run_with_timeout(task.run, token.clone(), timeout).await,
            None => (task.run)(token.clone()).await,
        };
        if let Err(err) = result {
            match task.on_error {
                Some(handler) => handler(err),
                None => error_sink(err),
            }
        }
    }
}

async fn run_with_timeout(
    run: NativeFn,
    token: CancellationToken,
    timeout: Duration,
) -> Result<(), MeshError> {
    let fut = run(token.clone());
    tokio::select! {
        result = fut => result,
        _ = tokio::time::sleep(timeout) => {
            token.cancel();
            Err(MeshError::Timeout(timeout))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn interpreter_tasks_run_serially_on_one_thread() {
        let counter = Arc::new(AtomicUsize::new(0));
        let sink: ErrorSink = Arc::new(|_| {});
        let ec = ExecutionContext::start(ExecutionContextConfig::default(), (), sink);

        for _ in 0..50 {
            let counter = counter.clone();
            ec.call_interpreter(InterpreterTask::Scoped(Box::new(move |_: &()| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })))
            .await
            .unwrap();
        }

        // Give the interpreter thread a chance to drain.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 50);
        ec.close().await;
    }

    #[tokio::test]
    async fn protected_call_error_goes_to_handler_not_sink() {
        let sink_hits = Arc::new(AtomicUsize::new(0));
        let sink_hits_clone = sink_hits.clone();
        let sink: ErrorSink = Arc::new(move |_| {
            sink_hits_clone.fetch_add(1, Ordering::SeqCst);
        });
        let ec = ExecutionContext::start(ExecutionContextConfig::default(), (), sink);

        let handler_hits = Arc::new(AtomicUsize::new(0));
        let handler_hits_clone = handler_hits.clone();
        ec.call_interpreter(InterpreterTask::Protected(
            Box::new(|_: &()| Err(MeshError::ScriptFault("boom".into()))),
            Box::new(move |_| {
                handler_hits_clone.fetch_add(1, Ordering::SeqCst);
            }),
        ))
        .await
        .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handler_hits.load(Ordering::SeqCst), 1);
        assert_eq!(sink_hits.load(Ordering::SeqCst), 0);
        ec.close().await;
    }

    #[tokio::test]
    async fn native_task_timeout_cancels_token_and_reports_timeout() {
        let sink: ErrorSink = Arc::new(|_| {});
        let ec = ExecutionContext::start(ExecutionContextConfig::default(), (), sink);

        let observed = Arc::new(AtomicUsize::new(0));
        let observed_clone = observed.clone();
        ec.call_native(
            NativeTask::new(Box::new(move |token: CancellationToken| {
                let observed = observed_clone.clone();
                Box::pin(async move {
                    token.cancelled().await;
                    observed.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            }))
            .with_timeout(Duration::from_millis(20)),
        )
        .await
        .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(observed.load(Ordering::SeqCst), 1);
        ec.close().await;
    }
}
