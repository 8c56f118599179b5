use crate::{
    client::{Kind, ObjectRef},
    scenario::{Phase, PolicyScope},
};
use std::time::Duration;
use thiserror::Error;

/// A control-plane operation failed. Fatal to the scenario that issued it.
#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("{0} already exists")]
    Conflict(ObjectRef),

    #[error("{target} is invalid: {message}")]
    Invalid { target: ObjectRef, message: String },

    #[error("{0} not found")]
    NotFound(ObjectRef),

    #[error("{target}: {source}")]
    Api {
        target: ObjectRef,
        #[source]
        source: kube::Error,
    },

    #[error("{target} has a malformed status: {source}")]
    Decode {
        target: ObjectRef,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("failed to read {origin}: {source}")]
    Read {
        origin: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {origin}: {source}")]
    Parse {
        origin: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("{origin}: expected kind {expected}, found {found:?}")]
    Kind {
        origin: String,
        expected: Kind,
        found: Option<String>,
    },

    #[error("{origin}: metadata.name must be set")]
    MissingName { origin: String },

    #[error("{origin} does not match the {kind} schema: {source}")]
    Schema {
        origin: String,
        kind: Kind,
        #[source]
        source: serde_json::Error,
    },

    #[error("{origin}: ingressClassName {found:?} does not describe a {scope} policy")]
    Scope {
        origin: String,
        scope: PolicyScope,
        found: Option<String>,
    },

    #[error("{origin} does not reference policy {policy}")]
    Reference { origin: String, policy: String },

    #[error("{origin} is not a usable baseline: {reason}")]
    Baseline { origin: String, reason: String },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("request timeout {timeout:?} must be shorter than the sample window {window:?}")]
    RequestTimeout { timeout: Duration, window: Duration },

    #[error("a {window:?} sample window admits more than {max_successes} success(es) at 1 request per second")]
    WindowTooLong {
        window: Duration,
        max_successes: usize,
    },

    #[error("at least one success must be tolerated in the sample window")]
    NoSuccessesAllowed,

    #[error("{0} must be set")]
    MissingEnv(&'static str),

    #[error("{var} is not a valid URL: {source}")]
    InvalidUri {
        var: &'static str,
        #[source]
        source: hyper::http::uri::InvalidUri,
    },
}

/// The harness could not be assembled from its inputs.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Template(#[from] TemplateError),
}

/// A scenario stopped before reaching its assertions.
///
/// Cleanup still ran; any errors it hit are kept alongside the failure that
/// aborted the scenario.
#[derive(Debug, Error)]
#[error("{scope} scenario aborted after {phase}: {source}")]
pub struct ScenarioError {
    pub scope: PolicyScope,
    pub phase: Phase,
    #[source]
    pub source: ResourceError,
    pub cleanup: Vec<ResourceError>,
}

// === impl ResourceError ===

impl ResourceError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn target(&self) -> &ObjectRef {
        match self {
            Self::Conflict(target) | Self::NotFound(target) => target,
            Self::Invalid { target, .. }
            | Self::Api { target, .. }
            | Self::Decode { target, .. } => target,
        }
    }
}
