use camino::Utf8PathBuf;
use thiserror::Error;

/// Errors raised while loading and validating a task description, before any
/// graph compilation happens.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("couldn't read {path}: {source}")]
    Read {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid YAML in {path}: {source}")]
    Yaml {
        path: Utf8PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("`extends` chain contains a cycle through {path}")]
    ExtendsCycle { path: Utf8PathBuf },

    #[error("{field}: unknown key `{key}`")]
    UnknownKey { field: String, key: String },

    #[error("{field}: missing required key `{key}`")]
    MissingKey { field: String, key: String },

    #[error("{field}: unknown tag `!{tag}`")]
    UnknownTag { field: String, tag: String },

    #[error("{field}: {reason}")]
    Invalid { field: String, reason: String },
}

/// Errors raised while compiling the configuration tree into a build graph.
/// These fail the run before any node executes.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("{field}: file {path} does not exist")]
    MissingFile { field: String, path: Utf8PathBuf },

    #[error("{field}: invalid glob pattern `{pattern}`: {source}")]
    BadPattern {
        field: String,
        pattern: String,
        #[source]
        source: glob::PatternError,
    },

    #[error("{field}: glob `{pattern}` matched no files")]
    EmptyGlob { field: String, pattern: String },

    #[error("{field}: input glob matched {inputs} files but output glob matched {outputs}")]
    GlobMismatch {
        field: String,
        inputs: usize,
        outputs: usize,
    },

    #[error("{field}: {reason}")]
    Invalid { field: String, reason: String },
}

/// Failure of a single build action at execution time.
#[derive(Debug, Error)]
pub enum ActionError {
    #[error("couldn't spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{program}` exited with {status}\n{stderr}")]
    ExitStatus {
        program: String,
        status: std::process::ExitStatus,
        stderr: String,
    },

    #[error("input file {path} is missing")]
    MissingInput { path: Utf8PathBuf },

    #[error("`{program}` did not produce {path}")]
    NoArtifact {
        program: String,
        path: Utf8PathBuf,
    },

    #[error("archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// One failed node of a run, keyed by its human-readable label.
#[derive(Debug)]
pub struct NodeFailure {
    pub node: String,
    pub error: ActionError,
}

/// Aggregated failures of a single run. Nodes that never ran because a
/// dependency failed are not listed; only root causes are.
#[derive(Debug)]
pub struct BuildFailed {
    pub failures: Vec<NodeFailure>,
}

impl std::fmt::Display for BuildFailed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{} build step(s) failed:", self.failures.len())?;
        for failure in &self.failures {
            writeln!(f, "  {}: {}", failure.node, failure.error)?;
        }
        Ok(())
    }
}

impl std::error::Error for BuildFailed {}

/// Errors raised while talking to the contest-management service. The result
/// tree and cache stay valid, so retrying `upload` is always safe.
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("no contest service configured (set TASKMILL_SERVICE or pass --service)")]
    NotConfigured,

    #[error("couldn't spawn service command `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("service command exited with {status}\n{stderr}")]
    ServiceExit {
        status: std::process::ExitStatus,
        stderr: String,
    },

    #[error("malformed service reply: {0}")]
    Protocol(#[from] serde_json::Error),

    #[error("service rejected {op}: {message}")]
    Rejected { op: &'static str, message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Top-level error, tagged with the task it belongs to so that multi-task
/// invocations stay readable.
#[derive(Debug, Error)]
pub enum TaskmillError {
    #[error("task {task}: {source}")]
    Config {
        task: String,
        #[source]
        source: ConfigError,
    },

    #[error("task {task}: {source}")]
    Graph {
        task: String,
        #[source]
        source: GraphError,
    },

    #[error("task {task}: {source}")]
    Build {
        task: String,
        #[source]
        source: BuildFailed,
    },

    #[error("task {task}: {source}")]
    Upload {
        task: String,
        #[source]
        source: UploadError,
    },

    #[error("task {task}: {source}")]
    Io {
        task: String,
        #[source]
        source: std::io::Error,
    },
}
