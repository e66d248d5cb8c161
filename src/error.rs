//! Error types.

use backtrace::Backtrace;
use std::error::Error;
use std::fmt::{Debug, Display, Formatter};

use crate::meta::ColumnSet;

/// The error type used by the optimizer and its components.
#[derive(Debug)]
pub enum OptimizerError {
    /// This error indicates that a function of the optimizer or its components has been called
    /// with an invalid argument.
    Argument(ArgumentError),
    /// This error indicates that one of internal invariants of the optimizer or its components
    /// has been violated.
    Internal(InternalError),
    /// A memo can be optimized at most once.
    AlreadyOptimized,
    /// The fully optimized root expression still references columns produced outside of it.
    DanglingOuterColumns(ColumnSet),
    /// The expression factory finished optimization with a non-zero constructor stack depth.
    UnbalancedFactory(usize),
}

impl OptimizerError {
    /// Creates an [argument error](OptimizerError::Argument).
    /// This method is a shorthand for `OptimizerError::Argument(ArgumentError::new(message))`.
    pub fn argument<T>(message: T) -> OptimizerError
    where
        T: Into<String>,
    {
        OptimizerError::Argument(ArgumentError::new(message))
    }

    /// Creates an [internal error](OptimizerError::Internal).
    /// This method is a shorthand for `OptimizerError::Internal(InternalError::new(message, None))`.
    pub fn internal<T>(message: T) -> OptimizerError
    where
        T: Into<String>,
    {
        OptimizerError::Internal(InternalError::new(message, None))
    }
}

impl Display for OptimizerError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            OptimizerError::Argument(err) => write!(f, "Argument error: {}", err),
            OptimizerError::Internal(err) => write!(f, "Internal error: {}", err),
            OptimizerError::AlreadyOptimized => write!(f, "Memo has already been optimized"),
            OptimizerError::DanglingOuterColumns(cols) => {
                write!(f, "Root expression cannot have outer columns: {}", cols)
            }
            OptimizerError::UnbalancedFactory(depth) => {
                write!(f, "Factory constructor stack depth is not zero: {}", depth)
            }
        }
    }
}

impl Error for OptimizerError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            OptimizerError::Internal(InternalError { cause: Some(error), .. }) => Some(error),
            _ => None,
        }
    }
}

impl From<ArgumentError> for OptimizerError {
    fn from(err: ArgumentError) -> Self {
        OptimizerError::Argument(err)
    }
}

impl From<InternalError> for OptimizerError {
    fn from(err: InternalError) -> Self {
        OptimizerError::Internal(err)
    }
}

/// Argument error. See [OptimizerError::Argument].
#[derive(Debug)]
pub struct ArgumentError {
    message: String,
    backtrace: Backtrace,
}

impl ArgumentError {
    /// Creates a new instance of an [ArgumentError].
    pub fn new<T>(message: T) -> Self
    where
        T: Into<String>,
    {
        ArgumentError {
            message: message.into(),
            backtrace: Backtrace::new(),
        }
    }

    /// Returns the backtrace captured when this error was created.
    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }
}

impl Display for ArgumentError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.message)
    }
}

/// Internal error. See [OptimizerError::Internal].
#[derive(Debug)]
pub struct InternalError {
    message: String,
    cause: Option<Box<OptimizerError>>,
    backtrace: Backtrace,
}

impl InternalError {
    /// Creates an instance of an [InternalError] with the given message and an optional cause.
    /// This method captures a backtrace.
    pub fn new<T>(message: T, cause: Option<OptimizerError>) -> Self
    where
        T: Into<String>,
    {
        InternalError {
            message: message.into(),
            cause: cause.map(Box::new),
            backtrace: Backtrace::new(),
        }
    }

    /// Returns the backtrace captured when this error was created.
    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }
}

impl From<&str> for InternalError {
    fn from(message: &str) -> Self {
        InternalError::new(message, None)
    }
}

impl From<String> for InternalError {
    fn from(message: String) -> Self {
        InternalError::new(message, None)
    }
}

impl Display for InternalError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(cause) = self.cause.as_ref() {
            write!(f, " caused by: {}", cause)?
        }
        Ok(())
    }
}
