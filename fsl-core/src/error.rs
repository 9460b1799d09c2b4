use crate::ast::SourceLoc;
use crate::target::Target;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CompilerError {
    #[error("{file}:{line}: syntax error: {message}")]
    Syntax { file: String, line: u32, message: String },

    #[error("semantic error in '{scope}': {message}")]
    Semantic { scope: String, message: String },

    #[error("{target}: unsupported operation '{operation}': {message}")]
    UnsupportedOperation {
        target: Target,
        operation: String,
        message: String,
    },

    #[error("{target} compiler failed on {file}:\n{output}")]
    Compiler {
        file: String,
        target: Target,
        output: String,
    },

    #[error("{target} toolchain unavailable: {message}")]
    Environment { target: Target, message: String },

    #[error("no matching variant for {target} with flags [{flags}]")]
    NoMatchingVariant { target: Target, flags: String },

    #[error("variant container error: {0}")]
    Container(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("reload error: {0}")]
    Reload(String),

    #[error("build cancelled")]
    Cancelled,

    #[error("IO error on {path}: {source}")]
    PathIo {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("formatting error")]
    Fmt(#[from] std::fmt::Error),
}

impl CompilerError {
    pub fn syntax(loc: &SourceLoc, message: impl Into<String>) -> Self {
        CompilerError::Syntax {
            file: loc.file.to_string(),
            line: loc.line,
            message: message.into(),
        }
    }

    pub fn semantic(scope: impl Into<String>, message: impl Into<String>) -> Self {
        CompilerError::Semantic {
            scope: scope.into(),
            message: message.into(),
        }
    }

    pub fn unsupported(target: Target, operation: impl Into<String>, message: impl Into<String>) -> Self {
        CompilerError::UnsupportedOperation {
            target,
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn path_io(path: &std::path::Path, source: std::io::Error) -> Self {
        CompilerError::PathIo {
            path: path.display().to_string(),
            source,
        }
    }

    /// The target this error is confined to, if any.
    pub fn target(&self) -> Option<Target> {
        match self {
            Self::UnsupportedOperation { target, .. }
            | Self::Compiler { target, .. }
            | Self::Environment { target, .. }
            | Self::NoMatchingVariant { target, .. } => Some(*target),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, CompilerError>;

#[macro_export]
macro_rules! bail_syntax_at {
    ($loc:expr, $($arg:tt)*) => {
        return Err($crate::error::CompilerError::syntax(&$loc, format!($($arg)*)))
    };
}

#[macro_export]
macro_rules! bail_semantic {
    ($scope:expr, $($arg:tt)*) => {
        return Err($crate::error::CompilerError::semantic($scope, format!($($arg)*)))
    };
}

#[macro_export]
macro_rules! bail_unsupported {
    ($target:expr, $op:expr, $($arg:tt)*) => {
        return Err($crate::error::CompilerError::unsupported($target, $op, format!($($arg)*)))
    };
}

#[macro_export]
macro_rules! err_semantic {
    ($scope:expr, $($arg:tt)*) => {
        $crate::error::CompilerError::semantic($scope, format!($($arg)*))
    };
}

#[macro_export]
macro_rules! err_container {
    ($($arg:tt)*) => {
        $crate::error::CompilerError::Container(format!($($arg)*))
    };
}
