use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Routes requests for a host to a set of upstreams, optionally applying
/// policies to every route.
#[derive(Clone, Debug, Default, PartialEq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "k8s.nginx.org",
    version = "v1",
    kind = "VirtualServer",
    shortname = "vs",
    status = "VirtualServerStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualServerSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress_class_name: Option<String>,
    pub host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policies: Option<Vec<PolicyReference>>,
    #[serde(default)]
    pub upstreams: Vec<Upstream>,
    #[serde(default)]
    pub routes: Vec<Route>,
}

/// References a `Policy` by name. The namespace defaults to the referencing
/// resource's namespace.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct PolicyReference {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct Upstream {
    pub name: String,
    pub service: String,
    pub port: u16,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct Route {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<Action>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policies: Option<Vec<PolicyReference>>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct Action {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pass: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VirtualServerStatus {
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_endpoints: Option<Vec<serde_json::Value>>,
}

// === impl VirtualServerSpec ===

impl VirtualServerSpec {
    /// Iterates over every policy reference, at the server and route level.
    pub fn policy_refs(&self) -> impl Iterator<Item = &PolicyReference> {
        self.policies
            .iter()
            .flatten()
            .chain(self.routes.iter().flat_map(|r| r.policies.iter().flatten()))
    }

    /// Returns true if the server references the named policy, resolving an
    /// omitted reference namespace to `default_ns`.
    pub fn references_policy(&self, name: &str, ns: &str, default_ns: &str) -> bool {
        self.policy_refs().any(|r| {
            r.name == name && r.namespace.as_deref().unwrap_or(default_ns) == ns
        })
    }
}
