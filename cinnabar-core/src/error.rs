use std::{convert::Infallible, fmt::Display};

/// One failed group reported by the compilation driver.
#[derive(Debug)]
pub struct GroupFailure {
    pub group_index: usize,
    pub fn_name: String,
    pub error: Error,
}

impl Display for GroupFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "group #{} ({}): {}",
            self.group_index, self.fn_name, self.error
        )
    }
}

fn join_failures(failures: &[GroupFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A device backend (driver, runtime compiler) reported an error.
    #[error(transparent)]
    Backend(Box<dyn std::error::Error + Send + Sync>),

    #[error("Message: {0}")]
    Msg(String),

    #[error("{inner}\n{backtrace}")]
    WithBacktrace {
        inner: Box<Self>,
        backtrace: Box<std::backtrace::Backtrace>,
    },

    #[error("IO error: {0}")]
    IoError(String),

    /// Arbitrary errors wrapping.
    #[error(transparent)]
    Wrapped(Box<dyn std::error::Error + Send + Sync>),

    /// Arbitrary errors wrapping with context.
    #[error("{context}: {wrapped}")]
    WrappedContext {
        wrapped: Box<dyn std::error::Error + Send + Sync>,
        context: String,
    },

    /// An internal invariant of the IR or of a pass was broken.
    #[error("invariant violation: {what}")]
    InvariantViolation { what: String },

    /// A construct outside the compiler's vocabulary.
    #[error("unsupported: {construct}")]
    Unsupported { construct: String },

    /// The fusion policy refused a merge the caller required.
    #[error("fusion policy rejected merging `{upstream}` into `{downstream}`")]
    PolicyRejected { upstream: String, downstream: String },

    /// Source emission or device compilation failed for one group.
    #[error("codegen failed for group #{group}: {message}")]
    CodegenFailure { group: usize, message: String },

    /// The cooperative cancel token was observed.
    #[error("compilation of group #{group} was cancelled")]
    Cancelled { group: usize },

    #[error("{} group(s) failed to compile:\n{}", .failures.len(), join_failures(.failures))]
    CompilationFailed { failures: Vec<GroupFailure> },

    /// A bucket predicate could not be evaluated at launch time.
    #[error("cannot evaluate predicate `{predicate}`: {reason}")]
    Predicate { predicate: String, reason: String },

    #[error("runtime error: {message}")]
    Runtime { message: String },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a new error based on a printable error message.
    ///
    /// If the message implements `std::error::Error`, prefer using [`Error::wrap`] instead.
    pub fn msg<M: Display>(msg: M) -> Self {
        Self::Msg(msg.to_string()).bt()
    }

    pub fn wrap(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Wrapped(Box::new(err)).bt()
    }

    pub fn invariant<M: Display>(what: M) -> Self {
        Self::InvariantViolation {
            what: what.to_string(),
        }
        .bt()
    }

    pub fn unsupported<M: Display>(construct: M) -> Self {
        Self::Unsupported {
            construct: construct.to_string(),
        }
        .bt()
    }

    pub fn runtime<M: Display>(message: M) -> Self {
        Self::Runtime {
            message: message.to_string(),
        }
    }

    pub fn bt(self) -> Self {
        let backtrace = std::backtrace::Backtrace::capture();
        match backtrace.status() {
            std::backtrace::BacktraceStatus::Disabled
            | std::backtrace::BacktraceStatus::Unsupported => self,
            _ => Self::WithBacktrace {
                inner: Box::new(self),
                backtrace: Box::new(backtrace),
            },
        }
    }

    /// Strip backtrace wrappers and any context attached to a crate error.
    pub fn root(&self) -> &Self {
        match self {
            Self::WithBacktrace { inner, .. } => inner.root(),
            Self::WrappedContext { wrapped, .. } => {
                wrapped.downcast_ref::<Self>().map_or(self, Self::root)
            }
            other => other,
        }
    }

    /// Whether this is a cancellation, or an aggregate made only of them.
    pub fn is_cancelled(&self) -> bool {
        match self.root() {
            Self::Cancelled { .. } => true,
            Self::CompilationFailed { failures } => {
                !failures.is_empty() && failures.iter().all(|f| f.error.is_cancelled())
            }
            _ => false,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Error::IoError(value.to_string())
    }
}

impl From<std::fmt::Error> for Error {
    fn from(value: std::fmt::Error) -> Self {
        Error::Msg(format!("formatting error: {value}"))
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(value: std::sync::PoisonError<T>) -> Self {
        Error::Msg(format!("lock poisoned: {value}"))
    }
}

#[macro_export]
macro_rules! bail {
    ($msg:literal $(,)?) => {
        return Err($crate::Error::Msg(format!($msg).into()).bt())
    };
    ($err:expr $(,)?) => {
        return Err($crate::Error::Msg(format!($err).into()).bt())
    };
    ($fmt:expr, $($arg:tt)*) => {
        return Err($crate::Error::Msg(format!($fmt, $($arg)*).into()).bt())
    };
}

pub(crate) mod private {
    pub trait Sealed {}

    impl<T, E> Sealed for std::result::Result<T, E> where E: std::error::Error {}
    impl<T> Sealed for Option<T> {}
}

/// Attach more context to an error.
///
/// Inspired by [`anyhow::Context`].
pub trait Context<T, E>: private::Sealed {
    /// Wrap the error value with additional context.
    fn context<C>(self, context: C) -> std::result::Result<T, Error>
    where
        C: Display + Send + Sync + 'static;

    /// Wrap the error value with additional context that is evaluated lazily
    /// only once an error does occur.
    fn with_context<C, F>(self, f: F) -> std::result::Result<T, Error>
    where
        C: Display + Send + Sync + 'static,
        F: FnOnce() -> C;
}

impl<T, E> Context<T, E> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn context<C>(self, context: C) -> std::result::Result<T, Error>
    where
        C: Display + Send + Sync + 'static,
    {
        match self {
            Ok(ok) => Ok(ok),
            Err(error) => Err(Error::WrappedContext {
                wrapped: Box::new(error),
                context: context.to_string(),
            }),
        }
    }

    fn with_context<C, F>(self, context: F) -> std::result::Result<T, Error>
    where
        C: Display + Send + Sync + 'static,
        F: FnOnce() -> C,
    {
        match self {
            Ok(ok) => Ok(ok),
            Err(error) => Err(Error::WrappedContext {
                wrapped: Box::new(error),
                context: context().to_string(),
            }),
        }
    }
}

impl<T> Context<T, Infallible> for Option<T> {
    fn context<C>(self, context: C) -> std::result::Result<T, Error>
    where
        C: Display + Send + Sync + 'static,
    {
        match self {
            Some(ok) => Ok(ok),
            None => Err(Error::msg(context)),
        }
    }

    fn with_context<C, F>(self, context: F) -> std::result::Result<T, Error>
    where
        C: Display + Send + Sync + 'static,
        F: FnOnce() -> C,
    {
        match self {
            Some(ok) => Ok(ok),
            None => Err(Error::msg(context())),
        }
    }
}
