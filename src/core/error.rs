//! Error handling for depcache
//!
//! The error system follows two rules:
//! 1. **Strongly-typed errors** so the orchestration layer can tell a user mistake
//!    from a system fault without string matching
//! 2. **User-friendly messages** with actionable suggestions for CLI users
//!
//! # Architecture
//!
//! - [`DepcacheError`] - enumerated failure classes for every layer
//! - [`ErrorOrigin`] - whether a failure was caused by the client or the server
//! - [`ErrorContext`] - wrapper adding suggestions and details for display
//!
//! # Classification
//!
//! Each variant carries an origin and a type tag. When a pipeline step fails,
//! the request records `state_reason` from the error message and, for classified
//! failures, `error_origin` / `error_type` from these accessors:
//!
//! ```rust,no_run
//! use depcache::core::{DepcacheError, ErrorOrigin};
//!
//! let err = DepcacheError::UnsupportedFeature {
//!     reason: "Go workspaces are not supported".to_string(),
//! };
//! assert_eq!(err.origin(), Some(ErrorOrigin::Client));
//! assert_eq!(err.error_type(), Some("UnsupportedFeature"));
//! ```

use colored::Colorize;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Who is responsible for a failed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorOrigin {
    /// The request input or repository content is at fault.
    Client,
    /// Infrastructure, tooling or network is at fault.
    Server,
}

impl fmt::Display for ErrorOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Client => f.write_str("client"),
            Self::Server => f.write_str("server"),
        }
    }
}

/// The main error type for depcache operations
///
/// # Error Categories
///
/// ## Request input
/// - [`Validation`](DepcacheError::Validation) - malformed or contradictory request input
/// - [`InvalidRequestData`](DepcacheError::InvalidRequestData) - input that only proves
///   invalid once the sources are inspected
/// - [`InvalidStateTransition`](DepcacheError::InvalidStateTransition) /
///   [`UnknownState`](DepcacheError::UnknownState) - state machine violations
///
/// ## Source control and tooling
/// - [`RepositoryAccess`](DepcacheError::RepositoryAccess) - clone/fetch/checkout failed
/// - [`SubprocessCall`](DepcacheError::SubprocessCall) - an external tool exited non-zero
/// - [`FileAccess`](DepcacheError::FileAccess) - an artifact is missing or unreadable
/// - [`Network`](DepcacheError::Network) / [`Timeout`](DepcacheError::Timeout)
///
/// ## Repository content
/// - [`UnsupportedFeature`](DepcacheError::UnsupportedFeature)
/// - [`InvalidFileFormat`](DepcacheError::InvalidFileFormat)
/// - [`InvalidRepoStructure`](DepcacheError::InvalidRepoStructure)
/// - [`ReplacementsDontApply`](DepcacheError::ReplacementsDontApply)
#[derive(Error, Debug)]
pub enum DepcacheError {
    /// Request input failed validation before any pipeline step ran
    #[error("{reason}")]
    Validation {
        /// Human-readable validation failure
        reason: String,
    },

    /// The requested state is not one of the known states
    #[error("The state \"{state}\" is invalid. It must be one of: {valid}.")]
    UnknownState {
        /// The rejected state name
        state: String,
        /// Comma separated list of valid states
        valid: String,
    },

    /// The transition table does not allow moving between these states
    #[error("A request cannot transition from the \"{from}\" state to the \"{to}\" state")]
    InvalidStateTransition {
        /// Current state
        from: String,
        /// Requested state
        to: String,
    },

    /// No request exists with this id
    #[error("Request {id} was not found")]
    RequestNotFound {
        /// The missing request id
        id: u64,
    },

    /// Cloning, fetching or checking out the repository failed
    #[error("{reason}")]
    RepositoryAccess {
        /// Repository URL
        url: String,
        /// What went wrong
        reason: String,
    },

    /// An artifact could not be found, read or verified
    #[error("{reason}")]
    FileAccess {
        /// Path of the artifact
        path: String,
        /// What went wrong
        reason: String,
    },

    /// An external command exited unsuccessfully
    #[error("{message}")]
    SubprocessCall {
        /// The command line that failed
        command: String,
        /// User-facing summary
        message: String,
        /// Captured standard error
        stderr: String,
        /// Exit code, if the process exited normally
        code: Option<i32>,
    },

    /// A network operation failed
    #[error("Network error during {operation}: {reason}")]
    Network {
        /// The operation that failed
        operation: String,
        /// Failure details
        reason: String,
    },

    /// A bounded wait elapsed
    #[error("Timed out after {seconds} seconds while {operation}")]
    Timeout {
        /// What was being waited for
        operation: String,
        /// The bound that elapsed
        seconds: u64,
    },

    /// The repository uses something that cannot be processed
    #[error("{reason}")]
    UnsupportedFeature {
        /// What is unsupported
        reason: String,
    },

    /// A lock file or metadata file could not be parsed
    #[error("Invalid format in {file}: {reason}")]
    InvalidFileFormat {
        /// The offending file, relative to the source root
        file: String,
        /// Parse failure details
        reason: String,
    },

    /// The repository layout cannot be processed
    #[error("{reason}")]
    InvalidRepoStructure {
        /// Layout problem description
        reason: String,
    },

    /// Request data conflicts with what was found in the repository
    #[error("{reason}")]
    InvalidRequestData {
        /// Conflict description
        reason: String,
    },

    /// Some dependency replacements did not match any resolved dependency
    #[error("The following {package_manager} dependency replacements don't apply: {}", names.join(", "))]
    ReplacementsDontApply {
        /// Package manager the replacements were meant for
        package_manager: String,
        /// Names that matched nothing, sorted
        names: Vec<String>,
    },

    /// Two bundle entries would occupy the same path
    #[error("Duplicate path in bundle: {path}")]
    DuplicatePath {
        /// The colliding archive path
        path: String,
    },

    /// A content manifest could not be generated
    #[error("Content manifest error: {reason}")]
    ContentManifest {
        /// Generation failure details
        reason: String,
    },

    /// Configuration file problem
    #[error("Configuration error: {message}")]
    ConfigError {
        /// Description of the configuration error
        message: String,
    },

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    /// Other error
    #[error("{message}")]
    Other {
        /// Generic error message
        message: String,
    },
}

impl DepcacheError {
    /// Shorthand for a validation failure.
    pub fn validation(reason: impl Into<String>) -> Self {
        Self::Validation {
            reason: reason.into(),
        }
    }

    /// Whether the client or the server is responsible for this failure.
    ///
    /// Returns `None` for unclassified errors; the failure callback then records
    /// only the reason.
    #[must_use]
    pub const fn origin(&self) -> Option<ErrorOrigin> {
        match self {
            Self::Validation {
                ..
            }
            | Self::UnsupportedFeature {
                ..
            }
            | Self::InvalidFileFormat {
                ..
            }
            | Self::InvalidRepoStructure {
                ..
            }
            | Self::InvalidRequestData {
                ..
            }
            | Self::ReplacementsDontApply {
                ..
            } => Some(ErrorOrigin::Client),
            Self::RepositoryAccess {
                ..
            }
            | Self::FileAccess {
                ..
            }
            | Self::SubprocessCall {
                ..
            }
            | Self::Network {
                ..
            }
            | Self::Timeout {
                ..
            } => Some(ErrorOrigin::Server),
            _ => None,
        }
    }

    /// The failure class tag attached to failed requests.
    #[must_use]
    pub const fn error_type(&self) -> Option<&'static str> {
        match self {
            Self::Validation {
                ..
            } => Some("ValidationError"),
            Self::RepositoryAccess {
                ..
            } => Some("RepositoryAccessError"),
            Self::FileAccess {
                ..
            } => Some("FileAccessError"),
            Self::SubprocessCall {
                ..
            } => Some("SubprocessCallError"),
            Self::Network {
                ..
            } => Some("NetworkError"),
            Self::Timeout {
                ..
            } => Some("TimeoutError"),
            Self::UnsupportedFeature {
                ..
            } => Some("UnsupportedFeature"),
            Self::InvalidFileFormat {
                ..
            } => Some("InvalidFileFormat"),
            Self::InvalidRepoStructure {
                ..
            } => Some("InvalidRepoStructure"),
            Self::InvalidRequestData {
                ..
            }
            | Self::ReplacementsDontApply {
                ..
            } => Some("InvalidRequestData"),
            _ => None,
        }
    }

    /// Whether retrying the step that produced this error may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::RepositoryAccess { .. }
                | Self::FileAccess { .. }
                | Self::SubprocessCall { .. }
                | Self::Network { .. }
        )
    }
}

/// Error context wrapper that provides user-friendly error information
///
/// When displayed, errors show the message in red, optional details in yellow and
/// an optional suggestion in green.
///
/// ```rust,no_run
/// use depcache::core::{DepcacheError, ErrorContext};
///
/// let context = ErrorContext::new(DepcacheError::RequestNotFound { id: 7 })
///     .with_suggestion("List known requests with 'depcache show'")
///     .with_details("The state file may have been reset");
/// context.display();
/// ```
#[derive(Debug)]
pub struct ErrorContext {
    /// The underlying error
    pub error: DepcacheError,
    /// Optional suggestion for resolving the error
    pub suggestion: Option<String>,
    /// Optional additional details about the error
    pub details: Option<String>,
}

impl ErrorContext {
    /// Create a new error context with no suggestion or details.
    #[must_use]
    pub const fn new(error: DepcacheError) -> Self {
        Self {
            error,
            suggestion: None,
            details: None,
        }
    }

    /// Add a suggestion for resolving the error.
    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    /// Add details explaining the error.
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    /// Print the error, details and suggestion to stderr with colors.
    pub fn display(&self) {
        eprintln!("{}: {}", "error".red().bold(), self.error);

        if let Some(details) = &self.details {
            eprintln!("{}: {}", "details".yellow(), details);
        }

        if let Some(suggestion) = &self.suggestion {
            eprintln!("{}: {}", "suggestion".green(), suggestion);
        }
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)?;

        if let Some(details) = &self.details {
            write!(f, "\nDetails: {details}")?;
        }

        if let Some(suggestion) = &self.suggestion {
            write!(f, "\nSuggestion: {suggestion}")?;
        }

        Ok(())
    }
}

impl std::error::Error for ErrorContext {}

/// Find the typed error anywhere in an `anyhow` chain.
///
/// Context layers added with `.context()` wrap the original error, so a plain
/// `downcast_ref` on the outer error misses it.
#[must_use]
pub fn find_depcache_error(error: &anyhow::Error) -> Option<&DepcacheError> {
    error.chain().find_map(|cause| cause.downcast_ref::<DepcacheError>())
}

/// Convert any error into an [`ErrorContext`] with actionable suggestions.
#[must_use]
pub fn user_friendly_error(error: anyhow::Error) -> ErrorContext {
    if let Some(typed) = find_depcache_error(&error) {
        let message = typed.to_string();
        let context = ErrorContext::new(DepcacheError::Other {
            message,
        });
        return match typed {
            DepcacheError::Validation {
                ..
            } => context.with_suggestion("Fix the request payload and submit it again"),
            DepcacheError::RepositoryAccess {
                url,
                ..
            } => context
                .with_details(format!("Repository: {url}"))
                .with_suggestion("Check that the repository URL is reachable and the ref exists"),
            DepcacheError::SubprocessCall {
                command,
                stderr,
                ..
            } => {
                let ctx = context.with_details(format!("Command: {command}"));
                if stderr.trim().is_empty() {
                    ctx
                } else {
                    ctx.with_suggestion(stderr.trim().to_string())
                }
            }
            DepcacheError::RequestNotFound {
                ..
            } => context.with_suggestion("Check the request id; ids are listed by 'depcache show'"),
            DepcacheError::Timeout {
                ..
            } => context.with_suggestion("Retry later or raise the timeout in the configuration"),
            _ => context,
        };
    }

    if let Some(io_error) = error.downcast_ref::<std::io::Error>() {
        let base = ErrorContext::new(DepcacheError::Other {
            message: error.to_string(),
        });
        return match io_error.kind() {
            std::io::ErrorKind::PermissionDenied => base
                .with_suggestion("Check ownership of the depcache directories")
                .with_details("depcache could not read or write a file it needs"),
            std::io::ErrorKind::NotFound => {
                base.with_suggestion("Check that the file or directory exists")
            }
            _ => base,
        };
    }

    let mut message = error.to_string();
    let causes: Vec<String> = error.chain().skip(1).map(ToString::to_string).collect();
    if !causes.is_empty() {
        message = format!("{message}: {}", causes.join(": "));
    }
    ErrorContext::new(DepcacheError::Other {
        message,
    })
}
