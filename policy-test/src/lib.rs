#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Verifies that NGINX Ingress `Policy` resources are enforced only by the
//! controller whose ingress class they name.

pub mod client;
pub mod config;
pub mod converge;
mod error;
pub mod sampler;
pub mod scenario;
pub mod template;

pub use self::{
    client::{Kind, KubeResources, ObjectRef, ResourceClient},
    config::{Config, Fixture},
    converge::{Backoff, Convergence},
    error::{ConfigError, ResourceError, ScenarioError, SetupError, TemplateError},
    sampler::{Probe, Samples, TrafficSampler},
    scenario::{Expectation, Failure, Harness, Phase, PolicyScope, ScenarioReport},
    template::{Template, Templates},
};
pub use ingress_policy_k8s_api as k8s;

use std::path::PathBuf;
use tracing::Instrument;

/// Overrides the directory templates are loaded from.
pub const ENV_TEMPLATES: &str = "INGRESS_POLICY_TEST_TEMPLATES";

/// The templates shipped with this crate.
pub fn testdata_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("testdata/policy-ingress-class")
}

/// Runs a test against the fixture described by the environment.
///
/// The baseline virtual server is restored before the test runs so that a
/// previously interrupted run does not leak a policy reference into it.
pub async fn with_harness<F, Fut>(test: F)
where
    F: FnOnce(Harness<KubeResources>) -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    let _tracing = init_tracing();

    let fixture = Fixture::from_env().expect("failed to read fixture from environment");
    let templates = std::env::var_os(ENV_TEMPLATES)
        .map(PathBuf::from)
        .unwrap_or_else(testdata_dir);
    let templates = Templates::load(&templates).expect("failed to load templates");

    tracing::debug!("initializing client");
    let client = kube::Client::try_default()
        .await
        .expect("failed to initialize k8s client");

    let namespace = fixture.namespace.clone();
    let harness = Harness::new(
        KubeResources::new(client),
        &Config::default(),
        fixture,
        templates,
    )
    .expect("invalid harness configuration");

    tracing::debug!(%namespace, "restoring baseline");
    harness
        .restore_baseline()
        .await
        .expect("failed to restore baseline");

    test(harness)
        .instrument(tracing::info_span!("test", %namespace))
        .await;
}

pub fn init_tracing() -> tracing::subscriber::DefaultGuard {
    tracing::subscriber::set_default(
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                    tracing_subscriber::EnvFilter::new("ingress_policy=trace,debug")
                }),
            )
            .finish(),
    )
}
