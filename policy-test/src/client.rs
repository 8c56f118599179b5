//! Control-plane access for the custom resources a scenario manipulates.
//!
//! Resources are addressed by [`Kind`], namespace and name, and written from
//! [`Template`]s, so the same orchestration runs against a live cluster
//! ([`KubeResources`]) or an in-memory control plane.

use crate::{template::Template, ResourceError};
use ingress_policy_k8s_api as k8s;
use kube::api::{
    Api, ApiResource, DeleteParams, DynamicObject, Patch, PatchParams, PostParams, ResourceExt,
};
use std::fmt;

/// The custom resource kinds the harness manages.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Kind {
    Policy,
    VirtualServer,
}

/// Identifies a namespaced object for diagnostics.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectRef {
    pub kind: Kind,
    pub namespace: String,
    pub name: String,
}

/// Typed CRUD over the policy and virtual-server resources.
///
/// Writes are not transactional and reads are eventually consistent: a write
/// is not guaranteed to be visible to a subsequent read without an
/// intervening convergence pause.
#[allow(async_fn_in_trait)]
pub trait ResourceClient {
    /// Creates an object from `template` and returns its name.
    async fn create(&self, kind: Kind, template: &Template, ns: &str)
        -> Result<String, ResourceError>;

    /// Merges the fields of `template` into an existing object.
    async fn patch(
        &self,
        kind: Kind,
        name: &str,
        template: &Template,
        ns: &str,
    ) -> Result<(), ResourceError>;

    async fn delete(&self, kind: Kind, name: &str, ns: &str) -> Result<(), ResourceError>;

    /// Returns the object's `status`, or `None` if the controller has not
    /// written one. An empty status object is returned as `Some`.
    async fn read_status(
        &self,
        kind: Kind,
        ns: &str,
        name: &str,
    ) -> Result<Option<serde_json::Value>, ResourceError>;
}

/// A [`ResourceClient`] backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubeResources {
    client: kube::Client,
}

const FIELD_MANAGER: &str = "ingress-policy-test";

// === impl Kind ===

impl Kind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Policy => "Policy",
            Self::VirtualServer => "VirtualServer",
        }
    }

    fn api_resource(&self) -> ApiResource {
        match self {
            Self::Policy => ApiResource::erase::<k8s::Policy>(&()),
            Self::VirtualServer => ApiResource::erase::<k8s::VirtualServer>(&()),
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// === impl ObjectRef ===

impl ObjectRef {
    pub fn new(kind: Kind, ns: impl ToString, name: impl ToString) -> Self {
        Self {
            kind,
            namespace: ns.to_string(),
            name: name.to_string(),
        }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{}", self.kind, self.namespace, self.name)
    }
}

// === impl KubeResources ===

impl KubeResources {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }

    fn api(&self, kind: Kind, ns: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), ns, &kind.api_resource())
    }
}

impl ResourceClient for KubeResources {
    async fn create(
        &self,
        kind: Kind,
        template: &Template,
        ns: &str,
    ) -> Result<String, ResourceError> {
        let target = ObjectRef::new(kind, ns, template.name());
        let obj = serde_json::from_value::<DynamicObject>(template.value().clone()).map_err(
            |error| ResourceError::Invalid {
                target: target.clone(),
                message: error.to_string(),
            },
        )?;

        tracing::debug!(%target, template = %template.origin(), "Creating");
        let params = PostParams {
            dry_run: false,
            field_manager: Some(FIELD_MANAGER.to_string()),
        };
        let created = self
            .api(kind, ns)
            .create(&params, &obj)
            .await
            .map_err(|error| classify(target, error))?;
        Ok(created.name_any())
    }

    async fn patch(
        &self,
        kind: Kind,
        name: &str,
        template: &Template,
        ns: &str,
    ) -> Result<(), ResourceError> {
        let target = ObjectRef::new(kind, ns, name);
        tracing::debug!(%target, template = %template.origin(), "Patching");
        let params = PatchParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        self.api(kind, ns)
            .patch(name, &params, &Patch::Merge(template.value()))
            .await
            .map_err(|error| classify(target, error))?;
        Ok(())
    }

    async fn delete(&self, kind: Kind, name: &str, ns: &str) -> Result<(), ResourceError> {
        let target = ObjectRef::new(kind, ns, name);
        tracing::debug!(%target, "Deleting");
        self.api(kind, ns)
            .delete(name, &DeleteParams::background())
            .await
            .map_err(|error| classify(target, error))?;
        Ok(())
    }

    async fn read_status(
        &self,
        kind: Kind,
        ns: &str,
        name: &str,
    ) -> Result<Option<serde_json::Value>, ResourceError> {
        let obj = self
            .api(kind, ns)
            .get(name)
            .await
            .map_err(|error| classify(ObjectRef::new(kind, ns, name), error))?;
        Ok(status_of(&obj))
    }
}

fn status_of(obj: &DynamicObject) -> Option<serde_json::Value> {
    match obj.data.get("status") {
        None | Some(serde_json::Value::Null) => None,
        Some(status) => Some(status.clone()),
    }
}

fn classify(target: ObjectRef, error: kube::Error) -> ResourceError {
    match error {
        kube::Error::Api(rsp) if rsp.code == 409 => ResourceError::Conflict(target),
        kube::Error::Api(rsp) if rsp.code == 404 => ResourceError::NotFound(target),
        kube::Error::Api(rsp) if rsp.code == 400 || rsp.code == 422 => ResourceError::Invalid {
            target,
            message: rsp.message,
        },
        source => ResourceError::Api { target, source },
    }
}
