use thiserror::Error;

use crate::trial::TrialId;

/// Main error type for the Tunewell system
#[derive(Error, Debug)]
pub enum TuneError {
    #[error("Search space error: {0}")]
    Space(#[from] SpaceError),

    #[error("Evaluation error: {0}")]
    Evaluation(#[from] EvaluationError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Meta-optimizer error: {0}")]
    Meta(#[from] MetaError),

    #[error("Run cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TuneError {
    /// Stable taxonomy name, used in run reports and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Space(e) => e.kind(),
            Self::Evaluation(e) => e.kind(),
            Self::Store(e) => e.kind(),
            Self::Meta(e) => e.kind(),
            Self::Cancelled => "Cancelled",
            Self::Config(_) => "ConfigError",
            Self::Io(_) => "IoError",
            Self::Serialization(_) => "SerializationError",
            Self::Internal(_) => "InternalError",
        }
    }

    /// Whether the error must end a run. Parameter- and strategy-level
    /// failures are recovered as failed trials instead.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Space(_) | Self::Evaluation(_))
    }
}

/// Search-space errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SpaceError {
    #[error("Value for {parameter} is out of domain: {message}")]
    DomainViolation { parameter: String, message: String },

    #[error("Unknown parameter: {parameter}")]
    UnknownParameter { parameter: String },

    #[error("Missing parameter: {parameter}")]
    MissingParameter { parameter: String },

    #[error("Constraint violated: {constraint}")]
    ConstraintViolation { constraint: String },

    #[error("No assignment satisfying all constraints found after {attempts} attempts")]
    ConstraintUnsatisfiable { attempts: usize },

    #[error("Invalid parameter spec {parameter}: {message}")]
    InvalidSpec { parameter: String, message: String },

    #[error("Duplicate parameter: {parameter}")]
    DuplicateParameter { parameter: String },

    #[error("Grid exhausted after {points} points")]
    GridExhausted { points: usize },
}

impl SpaceError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::DomainViolation { .. }
            | Self::UnknownParameter { .. }
            | Self::MissingParameter { .. } => "DomainViolation",
            Self::ConstraintViolation { .. } => "ConstraintViolation",
            Self::ConstraintUnsatisfiable { .. } => "ConstraintUnsatisfiable",
            Self::InvalidSpec { .. } | Self::DuplicateParameter { .. } => "InvalidSearchSpace",
            Self::GridExhausted { .. } => "GridExhausted",
        }
    }
}

/// Errors surfaced by an objective evaluator.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvaluationError {
    #[error("Evaluation timed out after {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },

    #[error("Evaluation crashed: {message}")]
    Crash { message: String },
}

impl EvaluationError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Timeout { .. } => "EvaluationTimeout",
            Self::Crash { .. } => "EvaluationCrash",
        }
    }
}

/// Trial store errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("Invalid transition for trial {trial_id}: {from} -> {to}")]
    InvalidTransition {
        trial_id: TrialId,
        from: String,
        to: String,
    },

    #[error("Trial not found: {trial_id}")]
    NotFound { trial_id: TrialId },

    #[error("Trial store write failed: {message}")]
    WriteError { message: String },

    #[error("Trial store read failed: {message}")]
    ReadError { message: String },

    #[error("Trial store corruption detected: {message}")]
    Corruption { message: String },
}

impl StoreError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidTransition { .. } => "InvalidTransition",
            Self::NotFound { .. } => "TrialNotFound",
            Self::WriteError { .. } => "StoreWriteError",
            Self::ReadError { .. } => "StoreReadError",
            Self::Corruption { .. } => "StoreCorruption",
        }
    }
}

/// Meta-optimizer errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MetaError {
    #[error("Strategy pool is empty")]
    EmptyStrategyPool,

    #[error("No strategy produced a valid candidate in {steps} consecutive scheduling steps")]
    NoViableStrategy { steps: usize },

    #[error("Duplicate strategy id: {strategy_id}")]
    DuplicateStrategy { strategy_id: String },
}

impl MetaError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::EmptyStrategyPool => "EmptyStrategyPool",
            Self::NoViableStrategy { .. } => "NoViableStrategy",
            Self::DuplicateStrategy { .. } => "DuplicateStrategy",
        }
    }
}

/// Result type alias for Tunewell operations
pub type TuneResult<T> = Result<T, TuneError>;

/// Macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::TuneError::Config(format!($($arg)*))
    };
}

/// Macro for creating internal errors
#[macro_export]
macro_rules! internal_error {
    ($($arg:tt)*) => {
        $crate::TuneError::Internal(format!($($arg)*))
    };
}
