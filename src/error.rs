//! Error types for the virtual machine

use crate::object::{ObjectKind, PropertyKey};
use crate::value::{JsString, Value};
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

// ═══════════════════════════════════════════════════════════════════════════════
// Host errors
// ═══════════════════════════════════════════════════════════════════════════════

/// A foreign error crossing the embedding boundary.
///
/// Host errors are kept as-is inside the error objects scripts observe, so the
/// embedder can get the original error back with [`HostError::downcast_ref`].
#[derive(Clone)]
pub struct HostError(Arc<dyn std::error::Error + Send + Sync + 'static>);

#[derive(Debug, Error)]
#[error("{0}")]
struct MessageError(String);

impl HostError {
    pub fn new<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        HostError(Arc::new(error))
    }

    /// A host error that only carries a message
    pub fn msg(message: impl Into<String>) -> Self {
        HostError(Arc::new(MessageError(message.into())))
    }

    pub fn downcast_ref<E: std::error::Error + 'static>(&self) -> Option<&E> {
        self.0.downcast_ref::<E>()
    }

    pub fn ptr_eq(&self, other: &HostError) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for HostError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for HostError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl std::error::Error for HostError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error objects
// ═══════════════════════════════════════════════════════════════════════════════

/// The kind recorded on error objects created by the VM
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Error,
    Type,
    Reference,
    /// A let/const binding used before initialisation. Scripts see a ReferenceError.
    Uninitialized,
    Range,
    Syntax,
    /// Wraps a [`HostError`]
    Host,
}

impl ErrorKind {
    /// Constructor name visible to scripts
    pub fn name(self) -> &'static str {
        match self {
            ErrorKind::Error | ErrorKind::Host => "Error",
            ErrorKind::Type => "TypeError",
            ErrorKind::Reference | ErrorKind::Uninitialized => "ReferenceError",
            ErrorKind::Range => "RangeError",
            ErrorKind::Syntax => "SyntaxError",
        }
    }
}

/// Internal slot of an error object
#[derive(Debug, Clone)]
pub struct ErrorData {
    pub kind: ErrorKind,
    pub wrapped: Option<HostError>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Stack traces
// ═══════════════════════════════════════════════════════════════════════════════

/// Stack frame for error traces
#[derive(Debug, Clone, PartialEq)]
pub struct StackFrame {
    pub function_name: Option<String>,
    pub file: Option<String>,
    pub line: u32,
    pub column: u32,
    /// Frame of a native function; it has no source position
    pub native: bool,
}

impl fmt::Display for StackFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self.function_name.as_deref().unwrap_or("<anonymous>");
        if self.native {
            return write!(f, "    at {} (native)", name);
        }
        match &self.file {
            Some(file) => write!(f, "    at {} ({}:{}:{})", name, file, self.line, self.column),
            None => write!(f, "    at {} (<eval>:{}:{})", name, self.line, self.column),
        }
    }
}

fn format_stack(stack: &[StackFrame]) -> String {
    stack
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("\n")
}

// ═══════════════════════════════════════════════════════════════════════════════
// Exceptions
// ═══════════════════════════════════════════════════════════════════════════════

/// What kind of value an exception carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionKind {
    /// An error object created by the VM or by `new Error(...)`-style natives
    Error(ErrorKind),
    /// Any other thrown value
    Value,
}

/// A thrown script value together with the stack captured when it was raised
#[derive(Debug, Clone)]
pub struct Exception {
    value: Value,
    stack: Vec<StackFrame>,
}

impl Exception {
    pub fn new(value: Value) -> Self {
        Exception {
            value,
            stack: Vec::new(),
        }
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn into_value(self) -> Value {
        self.value
    }

    pub fn stack(&self) -> &[StackFrame] {
        &self.stack
    }

    pub(crate) fn set_stack(&mut self, stack: Vec<StackFrame>) {
        self.stack = stack;
    }

    fn error_data(&self) -> Option<ErrorData> {
        let obj = self.value.as_object()?;
        let obj = obj.borrow();
        match &obj.kind {
            ObjectKind::Error(data) => Some(data.clone()),
            _ => None,
        }
    }

    pub fn kind(&self) -> ExceptionKind {
        match self.error_data() {
            Some(data) => ExceptionKind::Error(data.kind),
            None => ExceptionKind::Value,
        }
    }

    /// The `message` of an error object, or the thrown value rendered as a string
    pub fn message(&self) -> String {
        match &self.value {
            Value::Object(obj) if self.error_data().is_some() => obj
                .get(&PropertyKey::from("message"))
                .map(|m| m.to_string())
                .unwrap_or_default(),
            other => other.to_string(),
        }
    }

    /// The host error wrapped by this exception's error object, if any
    pub fn native_error(&self) -> Option<HostError> {
        self.error_data().and_then(|data| data.wrapped)
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind() {
            ExceptionKind::Error(kind) => write!(f, "{}: {}", kind.name(), self.message())?,
            ExceptionKind::Value => write!(f, "Uncaught {}", self.message())?,
        }
        if !self.stack.is_empty() {
            write!(f, "\n{}", format_stack(&self.stack))?;
        }
        Ok(())
    }
}

impl std::error::Error for Exception {}

// ═══════════════════════════════════════════════════════════════════════════════
// Uncatchable conditions
// ═══════════════════════════════════════════════════════════════════════════════

/// Why an interrupt halted the dispatch loop
pub enum InterruptReason {
    /// The interrupt carried a host error
    Error(HostError),
    /// The interrupt carried arbitrary host data
    Data(Box<dyn Any + Send>),
}

impl fmt::Debug for InterruptReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InterruptReason::Error(e) => f.debug_tuple("Error").field(e).finish(),
            InterruptReason::Data(_) => f.write_str("Data(..)"),
        }
    }
}

impl fmt::Display for InterruptReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InterruptReason::Error(e) => write!(f, ": {}", e),
            InterruptReason::Data(data) => match data.downcast_ref::<&'static str>() {
                Some(s) => write!(f, ": {}", s),
                None => match data.downcast_ref::<String>() {
                    Some(s) => write!(f, ": {}", s),
                    None => Ok(()),
                },
            },
        }
    }
}

/// A condition no script-level catch can observe
#[derive(Debug, Error)]
pub enum UncatchableError {
    /// Too many nested dispatch loops
    #[error("RangeError: Maximum native call depth exceeded")]
    NativeStackOverflow { stack: Vec<StackFrame> },

    #[error("Interrupted{reason}")]
    Interrupted {
        reason: InterruptReason,
        stack: Vec<StackFrame>,
    },

    #[error("Interrupt callback failed: {error}")]
    InterruptCallbackFailed {
        error: HostError,
        stack: Vec<StackFrame>,
    },

    /// Malformed bytecode or a broken VM invariant
    #[error("Internal error: {message}")]
    Internal {
        message: String,
        stack: Vec<StackFrame>,
    },
}

impl UncatchableError {
    pub fn stack(&self) -> &[StackFrame] {
        match self {
            UncatchableError::NativeStackOverflow { stack }
            | UncatchableError::Interrupted { stack, .. }
            | UncatchableError::InterruptCallbackFailed { stack, .. }
            | UncatchableError::Internal { stack, .. } => stack,
        }
    }

    pub(crate) fn stack_mut(&mut self) -> &mut Vec<StackFrame> {
        match self {
            UncatchableError::NativeStackOverflow { stack }
            | UncatchableError::Interrupted { stack, .. }
            | UncatchableError::InterruptCallbackFailed { stack, .. }
            | UncatchableError::Internal { stack, .. } => stack,
        }
    }

    /// The host error an interrupt carried, or the callback's failure
    pub fn native_error(&self) -> Option<&HostError> {
        match self {
            UncatchableError::Interrupted {
                reason: InterruptReason::Error(e),
                ..
            } => Some(e),
            UncatchableError::InterruptCallbackFailed { error, .. } => Some(error),
            _ => None,
        }
    }

    /// The data an interrupt carried
    pub fn payload(&self) -> Option<&(dyn Any + Send)> {
        match self {
            UncatchableError::Interrupted {
                reason: InterruptReason::Data(data),
                ..
            } => Some(data.as_ref()),
            _ => None,
        }
    }

    pub fn is_interrupt(&self) -> bool {
        matches!(
            self,
            UncatchableError::Interrupted { .. } | UncatchableError::InterruptCallbackFailed { .. }
        )
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Errors raised inside the VM
// ═══════════════════════════════════════════════════════════════════════════════

fn binding_name(name: &Option<JsString>) -> String {
    match name {
        Some(name) => format!("'{}'", name),
        None => "binding".to_string(),
    }
}

/// An abrupt completion propagating through the VM.
///
/// Every variant except `Uncatchable` is catchable by script code; the
/// non-`Thrown` ones are turned into error objects at the catch point.
#[derive(Debug, Error)]
pub enum VmError {
    #[error("ReferenceError: {name} is not defined")]
    Unresolved { name: JsString },

    #[error("ReferenceError: Cannot access {} before initialization", binding_name(.name))]
    Uninitialized { name: Option<JsString> },

    #[error("TypeError: {0}")]
    Type(String),

    #[error("RangeError: {0}")]
    Range(String),

    #[error("SyntaxError: {0}")]
    Syntax(String),

    #[error("{0}")]
    Host(HostError),

    #[error("{0}")]
    Thrown(Box<Exception>),

    #[error("{0}")]
    Uncatchable(Box<UncatchableError>),
}

impl VmError {
    pub fn type_error(message: impl Into<String>) -> Self {
        VmError::Type(message.into())
    }

    pub fn range_error(message: impl Into<String>) -> Self {
        VmError::Range(message.into())
    }

    pub fn syntax_error(message: impl Into<String>) -> Self {
        VmError::Syntax(message.into())
    }

    pub fn reference_error(name: impl Into<JsString>) -> Self {
        VmError::Unresolved { name: name.into() }
    }

    pub fn uninitialized(name: Option<JsString>) -> Self {
        VmError::Uninitialized { name }
    }

    /// Throw an arbitrary script value
    pub fn throw(value: Value) -> Self {
        VmError::Thrown(Box::new(Exception::new(value)))
    }

    pub fn host(error: HostError) -> Self {
        VmError::Host(error)
    }

    /// Malformed bytecode. Surfaces at the embedding boundary.
    pub fn internal(message: impl Into<String>) -> Self {
        VmError::Uncatchable(Box::new(UncatchableError::Internal {
            message: message.into(),
            stack: Vec::new(),
        }))
    }

    pub fn is_uncatchable(&self) -> bool {
        matches!(self, VmError::Uncatchable(_))
    }
}

impl From<UncatchableError> for VmError {
    fn from(e: UncatchableError) -> Self {
        VmError::Uncatchable(Box::new(e))
    }
}

impl From<HostError> for VmError {
    fn from(e: HostError) -> Self {
        VmError::Host(e)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Errors returned to the embedder
// ═══════════════════════════════════════════════════════════════════════════════

/// Outcome of a failed `run_program` or `call_function`
#[derive(Debug, Error)]
pub enum RunError {
    #[error("{0}")]
    Exception(Box<Exception>),

    #[error("{0}")]
    Uncatchable(Box<UncatchableError>),
}

impl RunError {
    pub fn exception(&self) -> Option<&Exception> {
        match self {
            RunError::Exception(ex) => Some(ex),
            RunError::Uncatchable(_) => None,
        }
    }

    pub fn uncatchable(&self) -> Option<&UncatchableError> {
        match self {
            RunError::Uncatchable(u) => Some(u),
            RunError::Exception(_) => None,
        }
    }

    /// The host error behind this failure, caught or not
    pub fn native_error(&self) -> Option<HostError> {
        match self {
            RunError::Exception(ex) => ex.native_error(),
            RunError::Uncatchable(u) => u.native_error().cloned(),
        }
    }
}
