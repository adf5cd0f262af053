use crate::value::Value;

pub type Result<T> = std::result::Result<T, EvalError>;

/// Runtime failure taxonomy. Every failure that can surface to a program,
/// a JSON-RPC caller, or a peer carries one of these variants; `tag()` is
/// the machine-readable form used on the wire and in `error.data`.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum EvalError {
    #[error("parse error: {0}")]
    Parse(String),

    #[error("undefined: {0}")]
    Undefined(String),

    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    #[error("arity mismatch: expected {expected} arguments, got {got}")]
    Arity { expected: usize, got: usize },

    #[error("index {index} out of range for length {len}")]
    Index { index: i64, len: usize },

    #[error("arithmetic error: {0}")]
    Arithmetic(String),

    #[error("queue full: {0}")]
    Backpressure(String),

    #[error("timed out waiting for {0}")]
    Timeout(String),

    #[error("routing hop budget exhausted for {0}")]
    TtlExceeded(String),

    #[error("no local or remote target named {0}")]
    UnknownTarget(String),

    #[error("server {0} has stopped")]
    ServerGone(String),

    #[error("remote node reported {tag}: {message}")]
    RemoteError { tag: String, message: String },

    #[error("uncaught throw: {0}")]
    Thrown(String),

    #[error("synchronous self-send inside server {0}")]
    Deadlock(String),
}

impl EvalError {
    pub fn tag(&self) -> &'static str {
        match self {
            EvalError::Parse(_) => "Parse",
            EvalError::Undefined(_) => "Undefined",
            EvalError::TypeMismatch(_) => "TypeMismatch",
            EvalError::Arity { .. } => "Arity",
            EvalError::Index { .. } => "Index",
            EvalError::Arithmetic(_) => "Arithmetic",
            EvalError::Backpressure(_) => "Backpressure",
            EvalError::Timeout(_) => "Timeout",
            EvalError::TtlExceeded(_) => "TTLExceeded",
            EvalError::UnknownTarget(_) => "UnknownTarget",
            EvalError::ServerGone(_) => "ServerGone",
            EvalError::RemoteError { .. } => "RemoteError",
            EvalError::Thrown(_) => "Thrown",
            EvalError::Deadlock(_) => "Deadlock",
        }
    }

    /// Reconstructs a failure from a wire tag, used when a peer reports an
    /// error for a relayed call. Unknown tags collapse to `RemoteError`.
    pub fn from_remote(tag: &str, message: String) -> EvalError {
        match tag {
            "Timeout" => EvalError::Timeout(message),
            "TTLExceeded" => EvalError::TtlExceeded(message),
            "UnknownTarget" => EvalError::UnknownTarget(message),
            "ServerGone" => EvalError::ServerGone(message),
            "Backpressure" => EvalError::Backpressure(message),
            _ => EvalError::RemoteError {
                tag: tag.to_string(),
                message,
            },
        }
    }
}

/// Out-of-band control flow inside the evaluator. `Return` unwinds until the
/// nearest function-call frame consumes it; `Fail` bubbles all the way out.
#[derive(Debug, Clone)]
pub enum Signal {
    Return(Value),
    Fail(EvalError),
}

impl From<EvalError> for Signal {
    fn from(e: EvalError) -> Self {
        Signal::Fail(e)
    }
}

pub(crate) type Eval<T> = std::result::Result<T, Signal>;
