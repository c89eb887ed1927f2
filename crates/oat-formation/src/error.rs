use std::path::PathBuf;

/// Problems with the formation definition itself. Raised before any remote
/// call is made.
#[derive(Debug, thiserror::Error)]
pub enum SpecValidationError {
    #[error("formation source is not valid: {0}")]
    Syntax(#[from] serde_json::Error),

    #[error("{owner}: missing required key `{key}`")]
    MissingKey { owner: String, key: &'static str },

    #[error("private key file does not exist: {}", .0.display())]
    PemFileMissing(PathBuf),

    #[error("security groups must be a non-empty list")]
    EmptySecurityGroups,

    #[error("{owner}: count must be at least 1")]
    InvalidCount { owner: String },

    #[error("{owner}: unsupported bootstrap step type `{kind}`")]
    UnknownBootstrapStep { owner: String, kind: String },

    #[error("{owner}: unknown bootstrap sequence `{name}`")]
    UnknownSequence { owner: String, name: String },

    #[error("bootstrap sequence includes itself: {0}")]
    SequenceCycle(String),

    #[error("{owner}: unknown pool type `{kind}`")]
    UnknownPoolType { owner: String, kind: String },

    #[error("{owner}: pool declares no services")]
    NoServices { owner: String },

    #[error("duplicate {what} name: {name}")]
    DuplicateName { what: &'static str, name: String },
}

/// Failures scoped to a single server component. They stop that
/// component's progress and never its siblings'.
#[derive(Debug, thiserror::Error)]
pub enum ComponentError {
    #[error("{server}: could not find image `{image}`")]
    ImageNotFound { server: String, image: String },

    #[error("{server}: could not find flavor `{flavor}`")]
    FlavorNotFound { server: String, flavor: String },

    #[error("{server}: ssh keypair does not exist: {keypair}")]
    KeypairNotFound { server: String, keypair: String },

    #[error("{server}: private key file does not exist: {}", .path.display())]
    PemFileMissing { server: String, path: PathBuf },

    #[error("{server}: bootstrap url must begin with git://: {url}")]
    InvalidBootstrapUrl { server: String, url: String },

    #[error(
        "{server}: security group mismatch: requested group(s) = {}, found group(s) = {}",
        .requested.join(", "),
        .found.join(", ")
    )]
    SecurityGroupMismatch {
        server: String,
        requested: Vec<String>,
        found: Vec<String>,
    },

    #[error("{server}: server name already exists on the provider")]
    DuplicateServerName { server: String },

    #[error("{server}: server did not become active after {attempts} checks (last status: {status})")]
    ServerActivationTimeout {
        server: String,
        attempts: u32,
        status: String,
    },

    #[error("{server}: ssh connection failed after {attempts} attempts: {reason}")]
    ConnectivityTimeout {
        server: String,
        attempts: u32,
        reason: String,
    },

    #[error("{server}: command failed after {attempts} attempts (exit {exit_code}): {command}")]
    CommandFailed {
        server: String,
        command: String,
        attempts: u32,
        exit_code: i32,
    },

    #[error("{server}: {stage} requires an earlier stage to have completed")]
    OutOfOrder { server: String, stage: &'static str },

    #[error("{server}: provider reported no address")]
    NoAddress { server: String },

    #[error("{server}: provider error: {source}")]
    Provider {
        server: String,
        #[source]
        source: oat_infra::Error,
    },

    #[error("{server}: log sink error: {source}")]
    Sink {
        server: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{server}: local file error: {source}")]
    LocalIo {
        server: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{server}: task aborted: {reason}")]
    Aborted { server: String, reason: String },
}

/// The load-balancer configuration cannot be rendered.
#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    #[error("no resolved address for {server_name}; refusing to render a partial config")]
    MissingAddress { server_name: String },
}
