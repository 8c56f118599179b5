#![allow(dead_code)]

//! An in-memory control plane and data plane that behave like an ingress
//! controller started with a single ingress class.

use bytes::Bytes;
use http_body_util::Full;
use hyper::{
    body::Incoming, header, server::conn::http1, service::service_fn, Request, Response,
    StatusCode, Uri,
};
use hyper_util::rt::TokioIo;
use ingress_policy_test::{
    k8s::PolicyStatus, Kind, ObjectRef, ResourceClient, ResourceError, Template,
};
use parking_lot::Mutex;
use serde_json::Value;
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tokio::{net::TcpListener, time::Instant};

/// The rate every fake policy enforces: one request per period.
const RATE_PERIOD: Duration = Duration::from_secs(1);

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    Create(Kind, String),
    Patch(Kind, String),
    Delete(Kind, String),
    ReadStatus(Kind, String),
}

#[derive(Clone)]
pub struct FakeControlPlane {
    state: Arc<Mutex<State>>,
}

struct State {
    ingress_class: String,
    objects: BTreeMap<(Kind, String, String), Stored>,
    calls: Vec<Call>,
    /// When false, policies are reported as accepted but never limit traffic.
    enforce: bool,
    fail_patch: bool,
    fail_delete: Option<Kind>,
    /// Answers every data-plane request with this status when set.
    reject_traffic: Option<StatusCode>,
    /// How long after creation a policy's status becomes visible.
    status_delay: Duration,
    last_forwarded: Option<Instant>,
}

struct Stored {
    value: Value,
    created_at: Instant,
}

// === impl FakeControlPlane ===

impl FakeControlPlane {
    pub fn new(ingress_class: &str) -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                ingress_class: ingress_class.to_string(),
                objects: BTreeMap::new(),
                calls: Vec::new(),
                enforce: true,
                fail_patch: false,
                fail_delete: None,
                reject_traffic: None,
                status_delay: Duration::ZERO,
                last_forwarded: None,
            })),
        }
    }

    /// Accepts policies without ever limiting traffic.
    pub fn without_enforcement(self) -> Self {
        self.state.lock().enforce = false;
        self
    }

    /// Rejects every patch as invalid.
    pub fn failing_patch(self) -> Self {
        self.state.lock().fail_patch = true;
        self
    }

    /// Rejects deletes of `kind`, leaving the object in place.
    pub fn failing_delete(self, kind: Kind) -> Self {
        self.state.lock().fail_delete = Some(kind);
        self
    }

    /// Answers every request on the data plane with `status`.
    pub fn rejecting_traffic(self, status: StatusCode) -> Self {
        self.state.lock().reject_traffic = Some(status);
        self
    }

    pub fn with_status_delay(self, delay: Duration) -> Self {
        self.state.lock().status_delay = delay;
        self
    }

    /// Stores an object without recording a call.
    pub fn seed(&self, ns: &str, template: &Template) {
        self.state.lock().objects.insert(
            (template.kind(), ns.to_string(), template.name().to_string()),
            Stored {
                value: template.value().clone(),
                created_at: Instant::now(),
            },
        );
    }

    /// Removes an object without recording a call.
    pub fn remove(&self, kind: Kind, ns: &str, name: &str) {
        self.state
            .lock()
            .objects
            .remove(&(kind, ns.to_string(), name.to_string()));
    }

    pub fn object(&self, kind: Kind, ns: &str, name: &str) -> Option<Value> {
        self.state
            .lock()
            .objects
            .get(&(kind, ns.to_string(), name.to_string()))
            .map(|stored| stored.value.clone())
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Serves the data plane for virtual servers in `ns`, returning the URL of
    /// the first route.
    pub async fn spawn_backend(&self, ns: &str) -> Uri {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = self.state.clone();
        let ns = ns.to_string();
        tokio::spawn(async move {
            while let Ok((io, _)) = listener.accept().await {
                let state = state.clone();
                let ns = ns.clone();
                tokio::spawn(async move {
                    let svc = service_fn(move |req: Request<Incoming>| {
                        let status = state.lock().route(&ns, &req);
                        async move {
                            Response::builder()
                                .status(status)
                                .body(Full::new(Bytes::from_static(b"")))
                        }
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(io), svc)
                        .await;
                });
            }
        });
        format!("http://{addr}/backend1").parse().unwrap()
    }
}

impl ResourceClient for FakeControlPlane {
    async fn create(
        &self,
        kind: Kind,
        template: &Template,
        ns: &str,
    ) -> Result<String, ResourceError> {
        let mut state = self.state.lock();
        let name = template.name().to_string();
        state.calls.push(Call::Create(kind, name.clone()));

        let key = (kind, ns.to_string(), name.clone());
        if state.objects.contains_key(&key) {
            return Err(ResourceError::Conflict(ObjectRef::new(kind, ns, &name)));
        }
        let now = Instant::now();
        state.objects.insert(
            key,
            Stored {
                value: template.value().clone(),
                created_at: now,
            },
        );
        if kind == Kind::Policy {
            state.last_forwarded = None;
        }
        Ok(name)
    }

    async fn patch(
        &self,
        kind: Kind,
        name: &str,
        template: &Template,
        ns: &str,
    ) -> Result<(), ResourceError> {
        let mut state = self.state.lock();
        state.calls.push(Call::Patch(kind, name.to_string()));

        let target = ObjectRef::new(kind, ns, name);
        if state.fail_patch {
            return Err(ResourceError::Invalid {
                target,
                message: "admission webhook denied the request".to_string(),
            });
        }
        let stored = state
            .objects
            .get_mut(&(kind, ns.to_string(), name.to_string()))
            .ok_or(ResourceError::NotFound(target))?;
        merge(&mut stored.value, template.value());
        Ok(())
    }

    async fn delete(&self, kind: Kind, name: &str, ns: &str) -> Result<(), ResourceError> {
        let mut state = self.state.lock();
        state.calls.push(Call::Delete(kind, name.to_string()));
        if state.fail_delete == Some(kind) {
            return Err(ResourceError::Invalid {
                target: ObjectRef::new(kind, ns, name),
                message: "deletion is forbidden".to_string(),
            });
        }
        state
            .objects
            .remove(&(kind, ns.to_string(), name.to_string()))
            .map(|_| ())
            .ok_or_else(|| ResourceError::NotFound(ObjectRef::new(kind, ns, name)))
    }

    async fn read_status(
        &self,
        kind: Kind,
        ns: &str,
        name: &str,
    ) -> Result<Option<Value>, ResourceError> {
        let mut state = self.state.lock();
        state.calls.push(Call::ReadStatus(kind, name.to_string()));
        let stored = state
            .objects
            .get(&(kind, ns.to_string(), name.to_string()))
            .ok_or_else(|| ResourceError::NotFound(ObjectRef::new(kind, ns, name)))?;
        if kind != Kind::Policy || !state.accepts(stored) {
            return Ok(None);
        }
        Ok(Some(
            serde_json::to_value(PolicyStatus::accepted()).expect("status must serialize"),
        ))
    }
}

// === impl State ===

impl State {
    /// Whether the controller has accepted the policy by now.
    fn accepts(&self, policy: &Stored) -> bool {
        let class = policy
            .value
            .pointer("/spec/ingressClassName")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let in_scope = class.is_empty() || class == self.ingress_class;
        in_scope && policy.created_at.elapsed() >= self.status_delay
    }

    fn route(&mut self, ns: &str, req: &Request<Incoming>) -> StatusCode {
        if let Some(status) = self.reject_traffic {
            return status;
        }
        let host = req
            .headers()
            .get(header::HOST)
            .and_then(|h| h.to_str().ok())
            .unwrap_or_default();
        let Some(vs) = self.objects.iter().find_map(|((kind, vs_ns, _), stored)| {
            let matches = *kind == Kind::VirtualServer
                && vs_ns == ns
                && stored.value.pointer("/spec/host").and_then(Value::as_str) == Some(host);
            matches.then_some(&stored.value)
        }) else {
            return StatusCode::NOT_FOUND;
        };

        let limited = self.enforce
            && vs
                .pointer("/spec/policies")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
                .filter_map(|r| r.get("name").and_then(Value::as_str))
                .any(|name| {
                    self.objects
                        .get(&(Kind::Policy, ns.to_string(), name.to_string()))
                        .is_some_and(|policy| self.accepts(policy))
                });
        if limited {
            let now = Instant::now();
            if self
                .last_forwarded
                .is_some_and(|last| now.duration_since(last) < RATE_PERIOD)
            {
                return StatusCode::SERVICE_UNAVAILABLE;
            }
            self.last_forwarded = Some(now);
        }
        StatusCode::OK
    }
}

/// Applies a JSON merge patch.
fn merge(target: &mut Value, patch: &Value) {
    let Value::Object(patch) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Default::default());
    }
    let Value::Object(target) = target else {
        return;
    };
    for (key, value) in patch {
        if value.is_null() {
            target.remove(key);
        } else {
            merge(target.entry(key.clone()).or_insert(Value::Null), value);
        }
    }
}
