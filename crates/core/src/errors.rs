//! Error types and handling
//!
//! Domain-specific error enums for the dev container engine. Each subsystem
//! owns its own `thiserror` enum; the top-level [`GantryError`] unifies them
//! so callers can bubble everything through the [`Result`] alias with `?`.

use thiserror::Error;

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    NotFound { path: String },

    /// Configuration file parsing error
    #[error("Failed to parse configuration file: {message}")]
    Parse { message: String },

    /// Configuration validation error
    #[error("Configuration validation error: {message}")]
    Validation { message: String },

    /// Configuration file I/O error
    #[error("Failed to read configuration file: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

/// Dockerfile parsing and resolution errors
#[derive(Error, Debug)]
pub enum DockerfileError {
    /// Structural parse failure
    #[error("Failed to parse Dockerfile: {message}")]
    Parse { message: String },

    /// The Dockerfile has no FROM instruction or a malformed final FROM
    #[error("Dockerfile has no usable final stage: {message}")]
    NoFinalStage { message: String },
}

/// Feature resolution errors
#[derive(Error, Debug)]
pub enum FeatureError {
    /// Declared feature id has no published metadata
    #[error("Feature not found: {id}")]
    NotFound { id: String },

    /// installsAfter relations form a cycle
    #[error("Feature dependency cycle involving: {chain}")]
    Cycle { chain: String },

    /// Two contributors requested incompatible versions of the same feature
    #[error("Version conflict for feature '{id}': {first} requires {first_version}, {second} requires {second_version}")]
    VersionConflict {
        id: String,
        first: String,
        first_version: String,
        second: String,
        second_version: String,
    },

    /// Feature metadata failed validation
    #[error("Feature validation error: {message}")]
    Validation { message: String },

    /// Feature metadata I/O error
    #[error("Failed to read feature metadata: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

/// Container driver errors (docker / compose / remote)
#[derive(Error, Debug)]
pub enum DriverError {
    /// The driver binary is not installed or not on PATH
    #[error("Container runtime not installed")]
    NotInstalled,

    /// A driver CLI invocation failed
    #[error("Container runtime error: {0}")]
    CliError(String),

    /// The requested container does not exist
    #[error("Container not found: {id}")]
    ContainerNotFound { id: String },

    /// Driver output could not be interpreted
    #[error("Unexpected container runtime output: {message}")]
    UnexpectedOutput { message: String },
}

/// Build planner errors
#[derive(Error, Debug)]
pub enum BuildError {
    /// A remote build precondition failed; reported before any work starts
    #[error("Remote build precondition failed: {message}")]
    Precondition { message: String },

    /// The registry denied pushing to the target repository
    #[error("Push denied for {reference}: {message}")]
    PushDenied { reference: String, message: String },

    /// The referenced image does not exist locally or remotely
    #[error("Image not found: {reference}")]
    ImageNotFound { reference: String },

    /// Build execution failed
    #[error("Build failed: {message}")]
    Failed { message: String },

    /// Build staging I/O error
    #[error("Build I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

/// Agent tunnel errors
#[derive(Error, Debug, Clone)]
pub enum TunnelError {
    /// The underlying byte stream failed
    #[error("Tunnel transport error: {message}")]
    Transport { message: String },

    /// A frame violated the tunnel protocol
    #[error("Tunnel protocol error: {message}")]
    Protocol { message: String },

    /// The transport closed while RPCs were in flight
    #[error("Tunnel disconnected")]
    Disconnected,

    /// The RPC was cancelled by its caller
    #[error("Cancelled")]
    Cancelled,

    /// The remote side reported an error status
    #[error("Remote error: {message}")]
    Remote { message: String },

    /// An RPC deadline elapsed
    #[error("Tunnel deadline exceeded: {operation}")]
    DeadlineExceeded { operation: String },
}

/// In-container agent errors
#[derive(Error, Debug)]
pub enum AgentError {
    /// Injecting the agent binary did not finish within its deadline
    #[error("Agent inject timed out after {seconds}s")]
    InjectTimeout { seconds: u64 },

    /// A remote process exited non-zero; the code is propagated to the CLI
    #[error("Remote process exited with code {code}")]
    RemoteExit { code: i32 },

    /// The injected binary failed its verification run
    #[error("Agent verification failed: {message}")]
    VerifyFailed { message: String },

    /// In-container setup failed
    #[error("Container setup failed: {message}")]
    SetupFailed { message: String },
}

/// Workspace lock errors
#[derive(Error, Debug)]
pub enum LockError {
    /// Another process holds the workspace lock
    #[error("Workspace '{workspace_id}' is locked by another process (pid {holder_pid})")]
    AlreadyLocked { workspace_id: String, holder_pid: u32 },

    /// Lock file I/O error
    #[error("Lock I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

/// Top-level error for the dev container engine
#[derive(Error, Debug)]
pub enum GantryError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Dockerfile(#[from] DockerfileError),

    #[error(transparent)]
    Feature(#[from] FeatureError),

    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Tunnel(#[from] TunnelError),

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error(transparent)]
    Lock(#[from] LockError),

    /// Uncategorized internal error
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl From<std::io::Error> for GantryError {
    fn from(source: std::io::Error) -> Self {
        GantryError::Internal {
            message: source.to_string(),
        }
    }
}

/// Convenience type alias for Results with GantryError
pub type Result<T> = std::result::Result<T, GantryError>;
