//! Callback gateway: the only path through which the controller talks to its caller
//!
//! Log messages are delivered synchronously on the calling thread, so a slow log handler delays
//! the operation that logs; handlers should return quickly and hand off anything expensive. A log
//! handler can never make an operation fail. A confirmation handler that fails or panics counts as
//! "no".

use std::error;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Mutex, PoisonError};

use log::Level;

use crate::device::{Error, Result};

/// Error a confirmation handler may return
pub type HandlerError = Box<dyn error::Error + Send + Sync>;

/// Message class, numbered like the integer priorities the callbacks receive
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Debug = 0,
    Info = 1,
    Warning = 2,
    Error = 3,
    Fatal = 4,
}

impl Priority {
    pub fn as_int(self) -> i32 {
        self as i32
    }

    /// Out-of-range values clamp to the nearest priority
    pub fn from_int(value: i32) -> Priority {
        match value {
            i32::MIN..=0 => Priority::Debug,
            1 => Priority::Info,
            2 => Priority::Warning,
            3 => Priority::Error,
            _ => Priority::Fatal,
        }
    }

    pub fn level(self) -> Level {
        match self {
            Priority::Debug => Level::Debug,
            Priority::Info => Level::Info,
            Priority::Warning => Level::Warn,
            Priority::Error | Priority::Fatal => Level::Error,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Priority::Debug => "debug",
            Priority::Info => "info",
            Priority::Warning => "warning",
            Priority::Error => "error",
            Priority::Fatal => "fatal",
        };
        f.write_str(name)
    }
}

pub trait Logger: Send + Sync {
    fn log(&self, priority: Priority, message: &str);
}

impl<F> Logger for F
where
    F: Fn(Priority, &str) + Send + Sync,
{
    fn log(&self, priority: Priority, message: &str) {
        self(priority, message)
    }
}

pub trait Confirm: Send + Sync {
    fn confirm(&self, prompt: &str) -> std::result::Result<bool, HandlerError>;
}

impl<F> Confirm for F
where
    F: Fn(&str) -> std::result::Result<bool, HandlerError> + Send + Sync,
{
    fn confirm(&self, prompt: &str) -> std::result::Result<bool, HandlerError> {
        self(prompt)
    }
}

/// Forwards to the `log` facade
#[derive(Debug, Default, Clone, Copy)]
pub struct LogForwarder;

impl Logger for LogForwarder {
    fn log(&self, priority: Priority, message: &str) {
        log!(target: "cryptsetup", priority.level(), "{}", message);
    }
}

/// Answers every prompt the same way, e.g. for batch mode
#[derive(Debug, Clone, Copy)]
pub struct FixedAnswer(pub bool);

impl Confirm for FixedAnswer {
    fn confirm(&self, _prompt: &str) -> std::result::Result<bool, HandlerError> {
        Ok(self.0)
    }
}

pub struct CallbackGateway {
    logger: Box<dyn Logger>,
    confirm: Box<dyn Confirm>,
    prompt_lock: Mutex<()>,
}

impl CallbackGateway {
    pub fn new<L, C>(logger: L, confirm: C) -> CallbackGateway
    where
        L: Logger + 'static,
        C: Confirm + 'static,
    {
        CallbackGateway {
            logger: Box::new(logger),
            confirm: Box::new(confirm),
            prompt_lock: Mutex::new(()),
        }
    }

    /// Deliver `message` to the log handler before returning; a panic in the handler is contained
    pub fn log(&self, priority: Priority, message: &str) {
        let delivered = catch_unwind(AssertUnwindSafe(|| self.logger.log(priority, message)));
        if delivered.is_err() {
            warn!("log handler panicked while reporting a {} message", priority);
        }
    }

    /// Ask the confirmation handler, surfacing its failure as `CallbackError`
    pub fn try_confirm(&self, prompt: &str) -> Result<bool> {
        let _serialized = self.prompt_lock.lock().unwrap_or_else(PoisonError::into_inner);
        match catch_unwind(AssertUnwindSafe(|| self.confirm.confirm(prompt))) {
            Ok(Ok(answer)) => Ok(answer),
            Ok(Err(e)) => Err(Error::CallbackError(e.to_string())),
            Err(_) => Err(Error::CallbackError("confirmation handler panicked".to_string())),
        }
    }

    /// Like `try_confirm`, with any handler failure read as denial
    pub fn confirm(&self, prompt: &str) -> bool {
        match self.try_confirm(prompt) {
            Ok(answer) => answer,
            Err(e) => {
                warn!("{}; treating as denial", e);
                false
            }
        }
    }
}

impl fmt::Debug for CallbackGateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackGateway").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn recorder() -> (Arc<Mutex<Vec<(Priority, String)>>>, impl Logger) {
        let records = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&records);
        let logger =
            move |priority: Priority, message: &str| sink.lock().unwrap().push((priority, message.to_string()));
        (records, logger)
    }

    #[test]
    fn test_log_is_delivered_in_order() {
        let (records, logger) = recorder();
        let gateway = CallbackGateway::new(logger, FixedAnswer(true));
        gateway.log(Priority::Info, "first");
        gateway.log(Priority::Error, "second");
        let records = records.lock().unwrap();
        assert_eq!(
            *records,
            vec![(Priority::Info, "first".to_string()), (Priority::Error, "second".to_string())]
        );
    }

    #[test]
    fn test_panicking_logger_is_contained() {
        let logger = |_: Priority, _: &str| panic!("logger blew up");
        let gateway = CallbackGateway::new(logger, FixedAnswer(true));
        gateway.log(Priority::Fatal, "nobody hears this");
    }

    #[test]
    fn test_confirm_failures_are_denial() {
        let failing = |_: &str| -> std::result::Result<bool, HandlerError> { Err("no terminal".into()) };
        let gateway = CallbackGateway::new(LogForwarder, failing);
        assert!(matches!(gateway.try_confirm("wipe?"), Err(Error::CallbackError(_))));
        assert!(!gateway.confirm("wipe?"));

        let panicking = |_: &str| -> std::result::Result<bool, HandlerError> { panic!("dialog crashed") };
        let gateway = CallbackGateway::new(LogForwarder, panicking);
        assert!(!gateway.confirm("wipe?"));
    }

    #[test]
    fn test_prompts_are_serialized() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let overlap = Arc::new(AtomicUsize::new(0));
        let (f, o) = (Arc::clone(&in_flight), Arc::clone(&overlap));
        let confirm = move |_: &str| -> std::result::Result<bool, HandlerError> {
            if f.fetch_add(1, Ordering::SeqCst) > 0 {
                o.fetch_add(1, Ordering::SeqCst);
            }
            thread::sleep(Duration::from_millis(5));
            f.fetch_sub(1, Ordering::SeqCst);
            Ok(true)
        };
        let gateway = CallbackGateway::new(LogForwarder, confirm);
        thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| assert!(gateway.confirm("continue?")));
            }
        });
        assert_eq!(overlap.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_priority_numbering() {
        assert_eq!(Priority::Warning.as_int(), 2);
        assert_eq!(Priority::from_int(5), Priority::Fatal);
        assert_eq!(Priority::from_int(-1), Priority::Debug);
        assert_eq!(Priority::Fatal.level(), Level::Error);
    }
}
