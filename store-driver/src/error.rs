use std::backtrace::Backtrace;
use std::error::Error as StdError;
use std::fmt;

use tracing_error::SpanTrace;

/// Categorizes store errors by their semantic meaning, independent of
/// the backend which produced them.
///
/// Callers branch on the kind to decide how to respond; the API layer maps
/// each kind to a distinct response status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreErrorKind {
    /// No record matched the requested name (and version).
    ///
    /// **Recoverable:** Yes - an expected outcome of lookups.
    NotFound,

    /// A record with the same `(name, version)` already exists.
    ///
    /// **Recoverable:** Yes - the version was already published.
    AlreadyExists,

    /// I/O, serialization, or backend-specific failure.
    ///
    /// **Recoverable:** Maybe - inspect the underlying source.
    /// **Caller action:** Abort the current transaction and report.
    StorageFailure,

    /// The store was configured in an unsupported way, e.g. an empty file
    /// path or a malformed database URL.
    ///
    /// **Recoverable:** No - fix the configuration and restart.
    Configuration,
}

impl StoreErrorKind {
    /// Returns whether this kind is an expected business outcome rather than a fault.
    pub fn is_expected(&self) -> bool {
        matches!(self, StoreErrorKind::NotFound | StoreErrorKind::AlreadyExists)
    }
}

impl fmt::Display for StoreErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreErrorKind::NotFound => write!(f, "not found"),
            StoreErrorKind::AlreadyExists => write!(f, "already exists"),
            StoreErrorKind::StorageFailure => write!(f, "storage failure"),
            StoreErrorKind::Configuration => write!(f, "configuration error"),
        }
    }
}

#[derive(Debug)]
struct ErrorTrace {
    /// Backtrace capture is controlled by RUST_BACKTRACE.
    backtrace: Backtrace,

    /// Span context at the point where the error was created.
    span_trace: SpanTrace,
}

impl ErrorTrace {
    #[track_caller]
    fn capture() -> Self {
        ErrorTrace {
            backtrace: Backtrace::capture(),
            span_trace: SpanTrace::capture(),
        }
    }
}

/// Store error with kind, record context and diagnostic traces.
///
/// # Example
///
/// ```rust
/// use store_driver::{StoreError, StoreErrorKind};
///
/// let error = StoreError::builder(
///     "json-file",
///     StoreErrorKind::NotFound,
///     "no such server version",
/// )
/// .name("io.example/foo")
/// .version("1.0.0")
/// .build();
///
/// assert_eq!(error.kind(), StoreErrorKind::NotFound);
/// assert_eq!(error.name(), Some("io.example/foo"));
/// ```
#[derive(Debug)]
pub struct StoreError {
    kind: StoreErrorKind,

    /// The name of the backend that produced this error.
    engine: &'static str,

    name: Option<String>,

    version: Option<String>,

    context: Option<String>,

    source: Box<dyn StdError + Send + Sync + 'static>,

    traces: Box<ErrorTrace>,
}

impl StdError for StoreError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(self.source.as_ref())
    }
}

impl StoreError {
    /// Create a new store error with the minimum required information.
    pub fn new<E>(engine: &'static str, kind: StoreErrorKind, error: E) -> Self
    where
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        Self {
            kind,
            engine,
            name: None,
            version: None,
            context: None,
            source: error.into(),
            traces: Box::new(ErrorTrace::capture()),
        }
    }

    /// Create a builder for an error carrying record context.
    pub fn builder<E>(engine: &'static str, kind: StoreErrorKind, error: E) -> StoreErrorBuilder
    where
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        StoreErrorBuilder {
            engine,
            kind,
            source: error.into(),
            name: None,
            version: None,
            context: None,
        }
    }

    /// A `NotFound` error for the given server name and optional version.
    pub fn not_found(engine: &'static str, name: &str, version: Option<&str>) -> Self {
        let message = match version {
            Some(version) => format!("server {name}@{version} not found"),
            None => format!("server {name} not found"),
        };
        let mut builder = StoreError::builder(engine, StoreErrorKind::NotFound, message).name(name);
        if let Some(version) = version {
            builder = builder.version(version);
        }
        builder.build()
    }

    /// An `AlreadyExists` error for the given server version.
    pub fn already_exists(engine: &'static str, name: &str, version: &str) -> Self {
        StoreError::builder(
            engine,
            StoreErrorKind::AlreadyExists,
            format!("server {name}@{version} already exists"),
        )
        .name(name)
        .version(version)
        .build()
    }

    /// A `Configuration` error with a human-readable reason.
    pub fn configuration(engine: &'static str, reason: impl Into<String>) -> Self {
        StoreError::new(engine, StoreErrorKind::Configuration, reason.into())
    }

    /// Returns a boxed closure that wraps a downstream error as a storage failure.
    ///
    /// ```rust
    /// use store_driver::StoreError;
    ///
    /// fn operation() -> Result<(), StoreError> {
    ///     std::fs::File::open("registry.json").map_err(StoreError::with("json-file"))?;
    ///     Ok(())
    /// }
    /// ```
    pub fn with<E>(engine: &'static str) -> Box<dyn FnOnce(E) -> StoreError + Send + Sync>
    where
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        Box::new(move |error: E| StoreError::new(engine, StoreErrorKind::StorageFailure, error))
    }

    /// Returns the error kind.
    pub fn kind(&self) -> StoreErrorKind {
        self.kind
    }

    /// Returns the backend name.
    pub fn engine(&self) -> &'static str {
        self.engine
    }

    /// Returns the server name, if available.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Returns the server version, if available.
    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    /// Returns additional context, if available.
    pub fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }

    /// Whether the record was missing.
    pub fn is_not_found(&self) -> bool {
        self.kind == StoreErrorKind::NotFound
    }

    /// Whether the record already existed.
    pub fn is_already_exists(&self) -> bool {
        self.kind == StoreErrorKind::AlreadyExists
    }

    /// Returns a reference to the captured backtrace.
    pub fn backtrace(&self) -> &Backtrace {
        &self.traces.backtrace
    }

    /// Returns the tracing span context captured when this error was created.
    pub fn span_trace(&self) -> &SpanTrace {
        &self.traces.span_trace
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Store error [{}] from {}", self.kind, self.engine)?;

        match (&self.name, &self.version) {
            (Some(name), Some(version)) => write!(f, " (server: {name}@{version})")?,
            (Some(name), None) => write!(f, " (server: {name})")?,
            _ => {}
        }

        if let Some(context) = &self.context {
            write!(f, " ({})", context)?;
        }

        write!(f, ": {}", self.source)
    }
}

/// Builder for a `StoreError` with optional record context.
#[derive(Debug)]
pub struct StoreErrorBuilder {
    kind: StoreErrorKind,
    engine: &'static str,
    source: Box<dyn StdError + Send + Sync + 'static>,
    name: Option<String>,
    version: Option<String>,
    context: Option<String>,
}

impl StoreErrorBuilder {
    /// Set the server name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the server version.
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Set additional context.
    pub fn context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Finish the error, capturing the backtrace and span trace.
    pub fn build(self) -> StoreError {
        StoreError {
            kind: self.kind,
            engine: self.engine,
            name: self.name,
            version: self.version,
            context: self.context,
            source: self.source,
            traces: Box::new(ErrorTrace::capture()),
        }
    }
}
