//! Execution interpreter.
//!
//! [`machine`] is the pure core that advances a Job by one signal.
//! [`shell`] persists its results and performs the effects it asks for, and
//! [`engine`] drives the shell from worker completions and wake timers.

pub mod choice;
pub mod clock;
pub mod dispatcher;
pub mod engine;
pub mod machine;
pub mod retry;
pub mod scheduler;
pub mod shell;

pub use clock::{Clock, SystemClock, TokioClock};
pub use dispatcher::{
    completion_channel, AttemptHandle, AttemptStatus, Completion, CompletionReceiver, CompletionSender, DispatchError,
    DispatchRequest, WorkerDispatcher,
};
pub use engine::{Engine, EngineError};
pub use machine::{apply, apply_guarded, Applied, Effect, InterpreterError, Signal, StepContext};
pub use shell::Interpreter;
