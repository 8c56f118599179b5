use anyhow::{bail, Result};
use clap::Parser;
use hyper::Uri;
use ingress_policy_test::{
    Backoff, Config, Fixture, Harness, KubeResources, PolicyScope, Templates,
};
use std::{path::PathBuf, time::Duration};
use tracing::{error, info, warn};

/// Verify that ingress-class scoped rate-limit policies are enforced only by
/// the matching controller
#[derive(Debug, Parser)]
#[clap(version, about)]
struct Args {
    #[clap(
        long,
        env = "INGRESS_POLICY_TEST_LOG_LEVEL",
        default_value = "ingress_policy=info,warn"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, env = "INGRESS_POLICY_TEST_LOG_FORMAT", default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    /// Namespace holding the virtual server and its backends
    #[clap(long, short = 'n', env = Fixture::ENV_NAMESPACE)]
    namespace: String,

    #[clap(
        long,
        env = Fixture::ENV_VIRTUAL_SERVER,
        default_value = Fixture::DEFAULT_VIRTUAL_SERVER
    )]
    virtual_server: String,

    /// Virtual host sent with every probe
    #[clap(long, env = Fixture::ENV_HOST, default_value = Fixture::DEFAULT_HOST)]
    host: String,

    /// URL of the ingress data plane, e.g. http://10.0.0.1:80/backend1
    #[clap(long, env = Fixture::ENV_BACKEND_URL)]
    backend_url: Uri,

    /// Ingress class the controller under test was started with
    #[clap(
        long,
        env = Fixture::ENV_INGRESS_CLASS,
        default_value = Fixture::DEFAULT_INGRESS_CLASS
    )]
    ingress_class: String,

    /// Directory containing the resource templates
    #[clap(long, env = ingress_policy_test::ENV_TEMPLATES)]
    templates: Option<PathBuf>,

    #[clap(long, default_value = "1000")]
    convergence_delay_ms: u64,

    /// Poll the policy status for up to this long instead of relying on the
    /// convergence delay alone
    #[clap(long)]
    poll_timeout_ms: Option<u64>,

    #[clap(long, default_value = "1000")]
    sample_window_ms: u64,

    #[clap(long, default_value = "500")]
    request_timeout_ms: u64,

    /// Requests tolerated in the sample window while a policy is enforced
    #[clap(long, default_value = "1")]
    max_successes: usize,

    /// Scenarios to run; all of them by default
    #[clap(long = "scope", value_delimiter = ',')]
    scopes: Vec<PolicyScope>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let Args {
        log_level,
        log_format,
        client,
        namespace,
        virtual_server,
        host,
        backend_url,
        ingress_class,
        templates,
        convergence_delay_ms,
        poll_timeout_ms,
        sample_window_ms,
        request_timeout_ms,
        max_successes,
        scopes,
    } = Args::parse();

    log_format.try_init(log_level)?;

    let config = Config {
        convergence_delay: Duration::from_millis(convergence_delay_ms),
        poll: poll_timeout_ms.map(|ms| Backoff::with_timeout(Duration::from_millis(ms))),
        sample_window: Duration::from_millis(sample_window_ms),
        request_timeout: Duration::from_millis(request_timeout_ms),
        max_successes,
    };
    let fixture = Fixture {
        namespace,
        virtual_server,
        host,
        backend_url,
        ingress_class,
    };
    let templates = Templates::load(templates.unwrap_or_else(ingress_policy_test::testdata_dir))?;
    let client = client.try_client().await?;
    let harness = Harness::new(KubeResources::new(client), &config, fixture, templates)?;

    let scopes = if scopes.is_empty() {
        PolicyScope::ALL.to_vec()
    } else {
        scopes
    };
    info!(?scopes, ?config, "Running scenarios");

    let mut failed = 0;
    for result in harness.run_all(&scopes).await {
        match result {
            Ok(report) if report.passed() && report.cleanup.is_empty() => info!(%report),
            Ok(report) => {
                failed += 1;
                warn!(%report);
            }
            Err(error) => {
                failed += 1;
                error!(%error);
                for cleanup in &error.cleanup {
                    error!(object = %cleanup.target(), %cleanup, "Cleanup failed");
                }
            }
        }
    }

    if failed > 0 {
        bail!("{failed} of {} scenarios failed", scopes.len());
    }
    info!("All scenarios passed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixture_flags_default_to_shipped_templates() {
        let args = Args::try_parse_from([
            "ingress-policy-verify",
            "--namespace=ns1",
            "--backend-url=http://127.0.0.1:30080/backend1",
            "--scope=matching-class,other-class",
        ])
        .expect("args must parse");
        assert_eq!(args.virtual_server, Fixture::DEFAULT_VIRTUAL_SERVER);
        assert_eq!(args.host, Fixture::DEFAULT_HOST);
        assert_eq!(args.ingress_class, Fixture::DEFAULT_INGRESS_CLASS);
        assert_eq!(args.max_successes, 1);
        assert_eq!(
            args.scopes,
            vec![PolicyScope::MatchingClass, PolicyScope::OtherClass]
        );
    }
}
