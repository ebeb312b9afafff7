use std::path::PathBuf;

use thiserror::Error;

/// Failure taxonomy for a launch attempt.
///
/// Configuration variants are all detected during spec resolution, before any
/// engine or network call is made. Acquisition and engine variants abort the
/// launch; there are no retries.
#[derive(Error, Debug)]
pub enum Error {
    // -- configuration --
    #[error("config file {path}: image must not be empty")]
    NoConfigImage { path: PathBuf },

    #[error("nothing to deploy: no packages, custom packages, or custom paths given")]
    NoPackages,

    #[error("no profile named {name:?} in config")]
    NoSuchProfile { name: String },

    #[error("--dev conflicts with profile {profile:?} (profile sets dev = {profile_value})")]
    ConflictingDevFlag { profile: String, profile_value: bool },

    #[error("--only conflicts with profile {profile:?} (profile sets only = {profile_value})")]
    ConflictingOnlyFlag { profile: String, profile_value: bool },

    #[error("profile {profile:?} declares packages not defined anywhere: {packages}")]
    UndefinedProfilePackages { profile: String, packages: String },

    #[error("unknown package {name:?}: not in the catalog or custom packages")]
    UndefinedPackage { name: String },

    #[error("cannot read config file {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("cannot parse config file {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("cannot read env file {path}: {message}")]
    EnvFile { path: PathBuf, message: String },

    // -- acquisition --
    #[error("git clone of {url} failed: {stderr}")]
    GitClone { url: String, stderr: String },

    #[error("GET {url} returned status {status}")]
    HttpStatus { url: String, status: u16 },

    #[error("GET {url} failed: {source}")]
    Http {
        url: String,
        source: reqwest::Error,
    },

    #[error("{url}: cannot tell archive kind from URL (expected .zip or .tar)")]
    UnknownArchiveKind { url: String },

    #[error("archive entry {entry:?} escapes the staging directory")]
    ZipSlip { entry: String },

    #[error("malformed archive from {url}: {message}")]
    MalformedArchive { url: String, message: String },

    #[error("local package path {path} does not exist or is not a directory")]
    BadLocalPath { path: PathBuf },

    #[error("while {context}: {source}")]
    Io {
        context: String,
        source: std::io::Error,
    },

    // -- engine --
    #[error("engine: {context}: {source}")]
    Engine {
        context: String,
        source: bollard::errors::Error,
    },

    #[error("deployment container exited with status {status}")]
    ContainerFailed { status: i64 },

    #[error("launch deadline of {0:?} exceeded")]
    DeadlineExceeded(std::time::Duration),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Error::Io {
            context: context.into(),
            source,
        }
    }

    pub fn engine(context: impl Into<String>, source: bollard::errors::Error) -> Self {
        Error::Engine {
            context: context.into(),
            source,
        }
    }
}
