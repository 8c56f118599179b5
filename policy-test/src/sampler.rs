//! Drives HTTP probes at a virtual host through the ingress data plane.

use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::{header, Request, StatusCode, Uri};
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use std::{fmt, time::Duration};
use tokio::time;

/// The outcome of a single probe.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Probe {
    /// The data plane answered.
    Status(StatusCode),

    /// The request never produced a response.
    Failed(String),

    /// No response arrived within the per-request timeout.
    TimedOut,
}

/// Probe outcomes from one observation window, in arrival order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Samples(Vec<Probe>);

#[derive(Clone, Debug)]
pub struct TrafficSampler {
    client: Client<HttpConnector, Empty<Bytes>>,
    target: Uri,
    host: String,
    window: Duration,
    request_timeout: Duration,
}

// === impl Probe ===

impl Probe {
    /// Returns true if the request was forwarded to the backend.
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Status(status) if *status == StatusCode::OK)
    }

    pub fn is_transport_failure(&self) -> bool {
        matches!(self, Self::Failed(_) | Self::TimedOut)
    }
}

impl fmt::Display for Probe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Status(status) => fmt::Display::fmt(status, f),
            Self::Failed(error) => write!(f, "transport error: {error}"),
            Self::TimedOut => f.write_str("timed out"),
        }
    }
}

// === impl Samples ===

impl Samples {
    pub fn probes(&self) -> &[Probe] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Counts the probes that were forwarded.
    pub fn successes(&self) -> usize {
        self.0.iter().filter(|p| p.is_ok()).count()
    }

    pub fn transport_failures(&self) -> impl Iterator<Item = &Probe> {
        self.0.iter().filter(|p| p.is_transport_failure())
    }
}

impl FromIterator<Probe> for Samples {
    fn from_iter<T: IntoIterator<Item = Probe>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

// === impl TrafficSampler ===

impl TrafficSampler {
    pub fn new(
        target: Uri,
        host: impl ToString,
        window: Duration,
        request_timeout: Duration,
    ) -> Self {
        Self {
            client: Client::builder(TokioExecutor::new()).build_http(),
            target,
            host: host.to_string(),
            window,
            request_timeout,
        }
    }

    /// Issues one GET for the target with the virtual host's `Host` header.
    pub async fn probe(&self) -> Probe {
        let req = match Request::get(self.target.clone())
            .header(header::HOST, self.host.as_str())
            .body(Empty::new())
        {
            Ok(req) => req,
            Err(error) => return Probe::Failed(error.to_string()),
        };

        match time::timeout(self.request_timeout, self.send(req)).await {
            Ok(Ok(status)) => Probe::Status(status),
            Ok(Err(error)) => Probe::Failed(error),
            Err(_) => Probe::TimedOut,
        }
    }

    /// The unconditional probe that precedes the observation window. It is not
    /// part of the sampled sequence.
    pub async fn warm_up(&self) -> Probe {
        let probe = self.probe().await;
        tracing::debug!(%probe, "Warm-up");
        probe
    }

    /// Probes back-to-back until the observation window elapses.
    ///
    /// The number of probes depends on response latency; a probe started
    /// before the window closes is always recorded.
    pub async fn sample(&self) -> Samples {
        let deadline = time::Instant::now() + self.window;
        let mut probes = Vec::new();
        while time::Instant::now() < deadline {
            let probe = self.probe().await;
            tracing::trace!(%probe);
            probes.push(probe);
        }

        let samples = Samples(probes);
        tracing::debug!(
            probes = samples.len(),
            successes = samples.successes(),
            window = ?self.window,
            "Sampled"
        );
        samples
    }

    async fn send(&self, req: Request<Empty<Bytes>>) -> Result<StatusCode, String> {
        let rsp = self
            .client
            .request(req)
            .await
            .map_err(|error| error_chain(&error))?;
        let status = rsp.status();
        // Drain the body so the connection can be reused.
        rsp.into_body()
            .collect()
            .await
            .map_err(|error| error_chain(&error))?;
        Ok(status)
    }
}

fn error_chain(error: &(dyn std::error::Error + 'static)) -> String {
    let mut msg = error.to_string();
    let mut source = error.source();
    while let Some(error) = source {
        msg.push_str(": ");
        msg.push_str(&error.to_string());
        source = error.source();
    }
    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::Full;
    use hyper::{body::Incoming, server::conn::http1, service::service_fn, Response};
    use hyper_util::rt::TokioIo;
    use std::{
        net::SocketAddr,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
    };
    use tokio::net::TcpListener;

    const HOST: &str = "test.example.com";

    async fn serve<F>(respond: F) -> SocketAddr
    where
        F: Fn(&Request<Incoming>) -> StatusCode + Clone + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((io, _)) = listener.accept().await {
                let respond = respond.clone();
                tokio::spawn(async move {
                    let svc = service_fn(move |req: Request<Incoming>| {
                        let status = respond(&req);
                        async move {
                            Response::builder()
                                .status(status)
                                .body(Full::new(Bytes::from_static(b"ok")))
                        }
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(io), svc)
                        .await;
                });
            }
        });
        addr
    }

    fn sampler(addr: SocketAddr, host: &str) -> TrafficSampler {
        TrafficSampler::new(
            format!("http://{addr}/backend1").parse().unwrap(),
            host,
            Duration::from_millis(200),
            Duration::from_millis(100),
        )
    }

    #[tokio::test(flavor = "current_thread")]
    async fn records_status_codes_in_order() {
        let requests = Arc::new(AtomicUsize::new(0));
        let addr = serve({
            let requests = requests.clone();
            move |_| {
                if requests.fetch_add(1, Ordering::SeqCst) == 0 {
                    StatusCode::OK
                } else {
                    StatusCode::SERVICE_UNAVAILABLE
                }
            }
        })
        .await;
        let sampler = sampler(addr, HOST);

        assert_eq!(sampler.warm_up().await, Probe::Status(StatusCode::OK));
        let samples = sampler.sample().await;
        assert!(!samples.is_empty());
        assert_eq!(samples.successes(), 0);
        assert!(samples
            .probes()
            .iter()
            .all(|p| *p == Probe::Status(StatusCode::SERVICE_UNAVAILABLE)));
        assert_eq!(samples.transport_failures().count(), 0);
        assert_eq!(requests.load(Ordering::SeqCst), samples.len() + 1);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn sends_virtual_host() {
        let addr = serve(|req| {
            let host = req.headers().get(header::HOST).and_then(|h| h.to_str().ok());
            if host == Some(HOST) && req.uri().path() == "/backend1" {
                StatusCode::OK
            } else {
                StatusCode::NOT_FOUND
            }
        })
        .await;

        assert!(sampler(addr, HOST).probe().await.is_ok());
        assert_eq!(
            sampler(addr, "other.example.com").probe().await,
            Probe::Status(StatusCode::NOT_FOUND)
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn refused_connections_are_transport_failures() {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };

        let probe = sampler(addr, HOST).probe().await;
        assert!(matches!(probe, Probe::Failed(_)), "{probe}");
        assert!(probe.is_transport_failure());
        assert!(!probe.is_ok());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn unresponsive_backends_time_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((io, _)) = listener.accept().await {
                held.push(io);
            }
        });

        let probe = sampler(addr, HOST).probe().await;
        assert_eq!(probe, Probe::TimedOut);
        assert!(probe.is_transport_failure());
    }

    #[test]
    fn counts_successes() {
        let samples = [
            Probe::Status(StatusCode::OK),
            Probe::Status(StatusCode::TOO_MANY_REQUESTS),
            Probe::TimedOut,
            Probe::Status(StatusCode::OK),
        ]
        .into_iter()
        .collect::<Samples>();
        assert_eq!(samples.len(), 4);
        assert_eq!(samples.successes(), 2);
        assert_eq!(samples.transport_failures().count(), 1);
    }
}
