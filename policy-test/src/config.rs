use crate::{
    converge::{Backoff, Convergence},
    sampler::TrafficSampler,
    ConfigError,
};
use hyper::Uri;
use std::time::Duration;

/// Timing and tolerance settings for a scenario run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// Pause after each mutating control-plane call.
    pub convergence_delay: Duration,

    /// When set, the enforcing scenarios poll the policy status instead of
    /// relying on `convergence_delay` alone.
    pub poll: Option<Backoff>,

    /// The observation window for traffic sampling.
    pub sample_window: Duration,

    /// Bounds each probe. Must be shorter than `sample_window`.
    pub request_timeout: Duration,

    /// The number of forwarded requests tolerated in the window while a
    /// policy is enforced.
    pub max_successes: usize,
}

/// Describes the externally provisioned environment a scenario set runs
/// against.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Fixture {
    pub namespace: String,
    pub virtual_server: String,
    /// The virtual host sent on every probe.
    pub host: String,
    pub backend_url: Uri,
    /// The class the controller under test was started with.
    pub ingress_class: String,
}

// === impl Config ===

impl Config {
    /// The period of the 1 request-per-second limit every policy template
    /// declares.
    const POLICY_PERIOD: Duration = Duration::from_secs(1);

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_successes == 0 {
            return Err(ConfigError::NoSuccessesAllowed);
        }
        if self.request_timeout >= self.sample_window {
            return Err(ConfigError::RequestTimeout {
                timeout: self.request_timeout,
                window: self.sample_window,
            });
        }
        let max_successes = u32::try_from(self.max_successes).unwrap_or(u32::MAX);
        if self.sample_window > Self::POLICY_PERIOD.saturating_mul(max_successes) {
            return Err(ConfigError::WindowTooLong {
                window: self.sample_window,
                max_successes: self.max_successes,
            });
        }
        Ok(())
    }

    pub fn convergence(&self) -> Convergence {
        Convergence::new(self.convergence_delay, self.poll.clone())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            convergence_delay: Duration::from_secs(1),
            poll: None,
            sample_window: Duration::from_secs(1),
            request_timeout: Duration::from_millis(500),
            max_successes: 1,
        }
    }
}

// === impl Fixture ===

impl Fixture {
    pub const ENV_NAMESPACE: &'static str = "INGRESS_POLICY_TEST_NAMESPACE";
    pub const ENV_VIRTUAL_SERVER: &'static str = "INGRESS_POLICY_TEST_VIRTUAL_SERVER";
    pub const ENV_HOST: &'static str = "INGRESS_POLICY_TEST_HOST";
    pub const ENV_BACKEND_URL: &'static str = "INGRESS_POLICY_TEST_BACKEND_URL";
    pub const ENV_INGRESS_CLASS: &'static str = "INGRESS_POLICY_TEST_INGRESS_CLASS";

    pub const DEFAULT_VIRTUAL_SERVER: &'static str = "virtual-server";
    pub const DEFAULT_HOST: &'static str = "virtual-server.example.com";
    pub const DEFAULT_INGRESS_CLASS: &'static str = "nginx";

    /// Reads the fixture from `INGRESS_POLICY_TEST_*` environment variables.
    ///
    /// The namespace and backend URL are required; the rest default to the
    /// values the shipped templates use.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let required = |var: &'static str| {
            get(var)
                .filter(|v| !v.is_empty())
                .ok_or(ConfigError::MissingEnv(var))
        };
        let or_default = |var: &'static str, default: &str| {
            get(var)
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| default.to_string())
        };

        let namespace = required(Self::ENV_NAMESPACE)?;
        let backend_url = required(Self::ENV_BACKEND_URL)?
            .parse::<Uri>()
            .map_err(|source| ConfigError::InvalidUri {
                var: Self::ENV_BACKEND_URL,
                source,
            })?;
        Ok(Self {
            namespace,
            virtual_server: or_default(Self::ENV_VIRTUAL_SERVER, Self::DEFAULT_VIRTUAL_SERVER),
            host: or_default(Self::ENV_HOST, Self::DEFAULT_HOST),
            backend_url,
            ingress_class: or_default(Self::ENV_INGRESS_CLASS, Self::DEFAULT_INGRESS_CLASS),
        })
    }

    pub fn sampler(&self, config: &Config) -> TrafficSampler {
        TrafficSampler::new(
            self.backend_url.clone(),
            &self.host,
            config.sample_window,
            config.request_timeout,
        )
    }
}
