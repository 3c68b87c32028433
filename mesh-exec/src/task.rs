use futures::future::BoxFuture;
use mesh_common::MeshError;

/// A callable that runs on the dedicated interpreter thread. Interpreter
/// tasks never suspend (§4.2): they run to completion against the
/// interpreter handle `H` before the thread picks up its next task.
pub type InterpreterFn<H> = Box<dyn FnOnce(&H) -> Result<(), MeshError> + Send>;

/// One unit of work destined for the interpreter thread. The three variants
/// differ only in how an error returned by the callable is routed.
pub enum InterpreterTask<H> {
    /// An ad-hoc code block. Errors escalate to the EC's error sink.
    Scoped(InterpreterFn<H>),
    /// Invoke a script function with arguments. Errors escalate to the EC's
    /// error sink.
    Call(InterpreterFn<H>),
    /// Identical to `Call`, but the error is delivered to `handler` instead
    /// of the EC's error sink.
    Protected(InterpreterFn<H>, Box<dyn FnOnce(MeshError) + Send>),
}

impl<H> InterpreterTask<H> {
    pub(crate) fn run(self, handle: &H) -> Option<(MeshError, Option<Box<dyn FnOnce(MeshError) + Send>>)> {
        let (f, handler) = match self {
            InterpreterTask::Scoped(f) => (f, None),
            InterpreterTask::Call(f) => (f, None),
            InterpreterTask::Protected(f, handler) => (f, Some(handler)),
        };
        match f(handle) {
            Ok(()) => None,
            Err(err) => Some((err, handler)),
        }
    }
}

/// A callable that runs on one of the native task pool threads. Native tasks
/// may block indefinitely, subject to the optional per-task timeout; they
/// observe `token` cancelled when that timeout elapses.
pub type NativeFn =
    Box<dyn FnOnce(tokio_util::sync::CancellationToken) -> BoxFuture<'static, Result<(), MeshError>> + Send>;

pub struct NativeTask {
    pub(crate) run: NativeFn,
    pub(crate) timeout: Option<std::time::Duration>,
    pub(crate) on_error: Option<Box<dyn FnOnce(MeshError) + Send>>,
}

impl NativeTask {
    pub fn new(run: NativeFn) -> Self {
        Self {
            run,
            timeout: None,
            on_error: None,
        }
    }

    pub fn with_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_error_handler(mut self, handler: impl FnOnce(MeshError) + Send + 'static) -> Self {
        self.on_error = Some(Box::new(handler));
        self
    }
}
