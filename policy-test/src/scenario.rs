//! Runs one create/observe/assert/restore cycle per policy scope.

use crate::{
    client::{Kind, ObjectRef, ResourceClient},
    config::{Config, Fixture},
    converge::Convergence,
    sampler::{Probe, Samples, TrafficSampler},
    template::Templates,
    ResourceError, ScenarioError, SetupError,
};
use ingress_policy_k8s_api::PolicyStatus;
use std::{fmt, str::FromStr};
use tracing::Instrument;

/// How a scenario's policy is scoped relative to the controller's ingress
/// class.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum PolicyScope {
    /// No ingress class; every controller handles the policy.
    Unscoped,
    /// Scoped to the controller's own class.
    MatchingClass,
    /// Scoped to a class the controller does not serve.
    OtherClass,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("unknown policy scope {0:?}; expected one of unscoped, matching-class, other-class")]
pub struct InvalidScope(String);

/// What a scope implies about the controller's handling of the policy.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Expectation {
    /// Accepted, reported as valid, and rate limiting is observable.
    Enforced,
    /// Out of the controller's scope; no status is ever written.
    Ignored,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Idle,
    PolicyCreated,
    VirtualServerPatched,
    Converged,
    Sampled,
    Asserted,
    Restored,
}

/// An observation that contradicts the scenario's expectation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Failure {
    StatusMismatch {
        expected: Expectation,
        observed: Option<PolicyStatus>,
    },
    WarmupRejected(Probe),
    TooManySuccesses {
        observed: usize,
        limit: usize,
    },
    ProbeTransport {
        failures: usize,
        first: Probe,
    },
}

#[derive(Debug)]
pub struct ScenarioReport {
    pub scope: PolicyScope,
    pub policy: String,
    /// The last phase the scenario completed.
    pub phase: Phase,
    pub status: Option<PolicyStatus>,
    pub warmup: Option<Probe>,
    /// Absent when the scope does not sample traffic or the warm-up failed.
    pub samples: Option<Samples>,
    pub failures: Vec<Failure>,
    /// Errors hit while restoring the baseline. These never replace the
    /// scenario's own outcome.
    pub cleanup: Vec<ResourceError>,
}

/// Runs policy-scope scenarios against a fixture.
///
/// Scenarios share the fixture's namespace and virtual server, so they must
/// run one at a time; each restores the baseline before returning.
pub struct Harness<C> {
    client: C,
    fixture: Fixture,
    templates: Templates,
    convergence: Convergence,
    sampler: TrafficSampler,
    max_successes: usize,
}

// === impl PolicyScope ===

impl PolicyScope {
    pub const ALL: [Self; 3] = [Self::Unscoped, Self::MatchingClass, Self::OtherClass];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unscoped => "unscoped",
            Self::MatchingClass => "matching-class",
            Self::OtherClass => "other-class",
        }
    }

    pub fn expectation(&self) -> Expectation {
        match self {
            Self::Unscoped | Self::MatchingClass => Expectation::Enforced,
            Self::OtherClass => Expectation::Ignored,
        }
    }
}

impl fmt::Display for PolicyScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PolicyScope {
    type Err = InvalidScope;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|scope| scope.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| InvalidScope(s.to_string()))
    }
}

// === impl Expectation ===

impl Expectation {
    pub fn holds(&self, status: Option<&PolicyStatus>) -> bool {
        match self {
            Self::Enforced => status.is_some_and(PolicyStatus::is_accepted),
            Self::Ignored => status.is_none(),
        }
    }
}

impl fmt::Display for Expectation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Enforced => write!(
                f,
                "status {}/{}",
                PolicyStatus::STATE_VALID,
                PolicyStatus::REASON_ADDED_OR_UPDATED
            ),
            Self::Ignored => f.write_str("no status"),
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// === impl Failure ===

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StatusMismatch {
                expected,
                observed: None,
            } => write!(f, "status mismatch: expected {expected}, observed no status"),
            Self::StatusMismatch {
                expected,
                observed: Some(status),
            } => write!(
                f,
                "status mismatch: expected {expected}, observed {}/{}",
                status.state, status.reason
            ),
            Self::WarmupRejected(probe) => write!(f, "warm-up probe was not forwarded: {probe}"),
            Self::TooManySuccesses { observed, limit } => write!(
                f,
                "traffic mismatch: {observed} requests forwarded while rate limited (at most {limit})"
            ),
            Self::ProbeTransport { failures, first } => {
                write!(f, "{failures} probe(s) failed in transport; first: {first}")
            }
        }
    }
}

/// Applies the enforced-scope traffic assertions to a sampled window.
pub fn traffic_failures(samples: &Samples, limit: usize) -> Vec<Failure> {
    let mut failures = Vec::new();

    let mut transport = samples.transport_failures();
    if let Some(first) = transport.next() {
        failures.push(Failure::ProbeTransport {
            failures: 1 + transport.count(),
            first: first.clone(),
        });
    }

    let observed = samples.successes();
    if observed > limit {
        failures.push(Failure::TooManySuccesses { observed, limit });
    }

    failures
}

// === impl ScenarioReport ===

impl ScenarioReport {
    fn new(scope: PolicyScope, policy: &str) -> Self {
        Self {
            scope,
            policy: policy.to_string(),
            phase: Phase::Idle,
            status: None,
            warmup: None,
            samples: None,
            failures: Vec::new(),
            cleanup: Vec::new(),
        }
    }

    fn advance(&mut self, phase: Phase) {
        tracing::debug!(from = %self.phase, to = %phase, "Scenario phase");
        self.phase = phase;
    }

    /// True if every assertion held.
    pub fn passed(&self) -> bool {
        self.failures.is_empty()
    }

    /// True if the baseline was restored without errors.
    pub fn restored(&self) -> bool {
        self.phase == Phase::Restored
    }
}

impl fmt::Display for ScenarioReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.scope, self.policy)?;
        if self.passed() {
            f.write_str(": passed")?;
        } else {
            f.write_str(": failed")?;
            for (i, failure) in self.failures.iter().enumerate() {
                f.write_str(if i == 0 { ": " } else { "; " })?;
                fmt::Display::fmt(failure, f)?;
            }
        }
        for error in &self.cleanup {
            write!(f, "; cleanup: {error}")?;
        }
        Ok(())
    }
}

// === impl Harness ===

impl<C: ResourceClient> Harness<C> {
    pub fn new(
        client: C,
        config: &Config,
        fixture: Fixture,
        templates: Templates,
    ) -> Result<Self, SetupError> {
        config.validate()?;
        templates.check(&fixture)?;
        Ok(Self {
            sampler: fixture.sampler(config),
            convergence: config.convergence(),
            max_successes: config.max_successes,
            client,
            fixture,
            templates,
        })
    }

    /// Runs the scenario for `scope`.
    ///
    /// Assertion failures are collected in the report. Control-plane errors
    /// abort the scenario. Either way, once the policy exists it is deleted and
    /// the baseline virtual server is restored before this returns.
    pub async fn run(&self, scope: PolicyScope) -> Result<ScenarioReport, ScenarioError> {
        let template = self.templates.policy(scope);
        let span = tracing::info_span!("scenario", %scope, policy = %template.name());
        async move {
            let ns = &self.fixture.namespace;
            let mut report = ScenarioReport::new(scope, template.name());

            tracing::info!("Creating policy");
            let policy = self
                .client
                .create(Kind::Policy, template, ns)
                .await
                .map_err(|source| ScenarioError {
                    scope,
                    phase: Phase::Idle,
                    source,
                    cleanup: Vec::new(),
                })?;
            report.policy = policy.clone();
            report.advance(Phase::PolicyCreated);

            let observed = self.observe(scope, &policy, &mut report).await;

            report.cleanup = self.release(&policy).await;
            if report.cleanup.is_empty() && observed.is_ok() {
                report.advance(Phase::Restored);
            }

            if let Err(source) = observed {
                tracing::error!(error = %source, phase = %report.phase, "Scenario aborted");
                return Err(ScenarioError {
                    scope,
                    phase: report.phase,
                    source,
                    cleanup: report.cleanup,
                });
            }

            if report.passed() {
                tracing::info!("Scenario passed");
            } else {
                tracing::warn!(%report, "Scenario failed");
            }
            Ok(report)
        }
        .instrument(span)
        .await
    }

    /// Runs each scope in turn. A failed or aborted scenario does not prevent
    /// the following ones from running.
    pub async fn run_all(
        &self,
        scopes: &[PolicyScope],
    ) -> Vec<Result<ScenarioReport, ScenarioError>> {
        let mut results = Vec::with_capacity(scopes.len());
        for &scope in scopes {
            results.push(self.run(scope).await);
        }
        results
    }

    /// Deletes the virtual server and recreates it from the baseline template,
    /// then waits for convergence.
    pub async fn restore_baseline(&self) -> Result<(), ResourceError> {
        let ns = &self.fixture.namespace;
        let vs = &self.fixture.virtual_server;
        tracing::debug!(%vs, "Restoring baseline");
        match self.client.delete(Kind::VirtualServer, vs, ns).await {
            Ok(()) => {}
            Err(error) if error.is_not_found() => {
                tracing::debug!(%error, "Virtual server already deleted");
            }
            Err(error) => return Err(error),
        }
        self.client
            .create(Kind::VirtualServer, &self.templates.virtual_server, ns)
            .await?;
        self.convergence.pause().await;
        Ok(())
    }

    // Steps 2 through 5: attach, converge, observe, assert.
    async fn observe(
        &self,
        scope: PolicyScope,
        policy: &str,
        report: &mut ScenarioReport,
    ) -> Result<(), ResourceError> {
        let ns = &self.fixture.namespace;
        let expected = scope.expectation();

        self.client
            .patch(
                Kind::VirtualServer,
                &self.fixture.virtual_server,
                &self.templates.virtual_server_policy,
                ns,
            )
            .await?;
        report.advance(Phase::VirtualServerPatched);

        self.convergence.pause().await;
        report.advance(Phase::Converged);

        report.status = self.policy_status(policy, expected).await?;
        tracing::debug!(status = ?report.status, "Read policy status");
        if !expected.holds(report.status.as_ref()) {
            report.failures.push(Failure::StatusMismatch {
                expected,
                observed: report.status.clone(),
            });
        }

        let warmup = self.sampler.warm_up().await;
        if !warmup.is_ok() {
            report.failures.push(Failure::WarmupRejected(warmup.clone()));
        } else if expected == Expectation::Enforced {
            report.samples = Some(self.sampler.sample().await);
        }
        report.warmup = Some(warmup);
        report.advance(Phase::Sampled);

        if let Some(samples) = &report.samples {
            let failures = traffic_failures(samples, self.max_successes);
            report.failures.extend(failures);
        }
        report.advance(Phase::Asserted);

        Ok(())
    }

    async fn policy_status(
        &self,
        name: &str,
        expected: Expectation,
    ) -> Result<Option<PolicyStatus>, ResourceError> {
        match expected {
            // Absence holds before the controller reconciles too, so there is
            // nothing to poll for.
            Expectation::Ignored => self.read_policy_status(name).await,
            Expectation::Enforced => {
                let polled = self
                    .convergence
                    .poll_until(
                        || self.read_policy_status(name),
                        |status: &Option<PolicyStatus>| expected.holds(status.as_ref()),
                    )
                    .await?;
                Ok(polled.value)
            }
        }
    }

    async fn read_policy_status(&self, name: &str) -> Result<Option<PolicyStatus>, ResourceError> {
        let ns = &self.fixture.namespace;
        let Some(status) = self.client.read_status(Kind::Policy, ns, name).await? else {
            return Ok(None);
        };
        serde_json::from_value(status)
            .map(Some)
            .map_err(|source| ResourceError::Decode {
                target: ObjectRef::new(Kind::Policy, ns, name),
                source,
            })
    }

    // Step 6. Runs on every exit path once the policy exists.
    async fn release(&self, policy: &str) -> Vec<ResourceError> {
        let ns = &self.fixture.namespace;
        let mut errors = Vec::new();

        match self.client.delete(Kind::Policy, policy, ns).await {
            Ok(()) => {}
            Err(error) if error.is_not_found() => {
                tracing::debug!(%error, "Policy already deleted");
            }
            Err(error) => {
                tracing::warn!(%error, "Failed to delete policy");
                errors.push(error);
            }
        }

        if let Err(error) = self.restore_baseline().await {
            tracing::warn!(%error, "Failed to restore baseline");
            errors.push(error);
        }

        errors
    }
}
