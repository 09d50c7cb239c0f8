use std::fmt;

pub type Result<T, E = GroupExecError> = std::result::Result<T, E>;

/// Coarse error classification.
///
/// Callers that need to react to a class of failure (permission denied,
/// cooperative cancel) match on this instead of parsing messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Invalid plan, flags, or aggregate configuration detected at init.
    Configuration,
    /// EXECUTE denied on an aggregate or one of its component functions.
    PermissionDenied,
    /// Failure reading or writing spill storage.
    Io,
    /// Cooperative cancellation tripped.
    Cancelled,
    /// An aggregate transition/final/serialize/deserialize function failed.
    UserFunction,
    /// Everything else. Bugs land here.
    Internal,
}

#[derive(Debug)]
pub struct GroupExecError {
    /// Message intended to be displayed to the user.
    pub msg: String,

    pub kind: ErrorKind,

    /// Source of the error, if any.
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl GroupExecError {
    pub fn new(msg: impl Into<String>) -> Self {
        GroupExecError {
            msg: msg.into(),
            kind: ErrorKind::Internal,
            source: None,
        }
    }

    pub fn with_kind(msg: impl Into<String>, kind: ErrorKind) -> Self {
        GroupExecError {
            msg: msg.into(),
            kind,
            source: None,
        }
    }

    pub fn with_source(
        msg: impl Into<String>,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        GroupExecError {
            msg: msg.into(),
            kind: ErrorKind::Internal,
            source: Some(source),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

impl fmt::Display for GroupExecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.msg)?;
        if let Some(source) = &self.source {
            write!(f, ": {source}")?;
        }
        Ok(())
    }
}

impl std::error::Error for GroupExecError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

impl From<std::io::Error> for GroupExecError {
    fn from(value: std::io::Error) -> Self {
        GroupExecError {
            msg: "IO error".to_string(),
            kind: ErrorKind::Io,
            source: Some(Box::new(value)),
        }
    }
}

impl From<std::fmt::Error> for GroupExecError {
    fn from(value: std::fmt::Error) -> Self {
        GroupExecError::with_source("Format error", Box::new(value))
    }
}

/// An extension trait for converting `Option` misses into reasonable errors.
pub trait OptionExt<T> {
    /// Return an internal error if the value is missing.
    fn required(self, operation: &'static str) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn required(self, operation: &'static str) -> Result<T> {
        match self {
            Some(v) => Ok(v),
            None => Err(GroupExecError::new(format!(
                "Missing value for operation: {operation}"
            ))),
        }
    }
}

#[macro_export]
macro_rules! not_implemented {
    ($($t:tt)*) => {{
        let msg = format!($($t)*);
        return Err($crate::GroupExecError::new(format!("Not implemented: {msg}")));
    }};
}
