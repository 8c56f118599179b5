use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A cross-cutting traffic rule that a `VirtualServer` may reference.
///
/// Only the rate-limiting rule is modeled; the controller rejects a policy that
/// sets more than one rule, so the other kinds are irrelevant here.
#[derive(Clone, Debug, Default, PartialEq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "k8s.nginx.org",
    version = "v1",
    kind = "Policy",
    shortname = "pol",
    status = "PolicyStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct PolicySpec {
    /// Selects the controller that handles this policy. When unset, every
    /// controller handles it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress_class_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimit>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RateLimit {
    /// e.g. `1r/s` or `30r/m`.
    pub rate: String,
    pub key: String,
    pub zone_size: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub no_delay: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub burst: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dry_run: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reject_code: Option<u16>,
}

/// Reported by the controller once it has processed a policy.
///
/// A controller that ignores the policy (e.g. because of a different ingress
/// class) never writes a status, so `Policy::status` stays `None`. An empty
/// status object deserializes to `Some` with empty fields.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct PolicyStatus {
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
}

// === impl PolicySpec ===

impl PolicySpec {
    /// Returns true if a controller running with `ingress_class` handles this
    /// policy.
    pub fn applies_to(&self, ingress_class: &str) -> bool {
        match self.ingress_class_name.as_deref() {
            None | Some("") => true,
            Some(class) => class == ingress_class,
        }
    }
}

// === impl PolicyStatus ===

impl PolicyStatus {
    pub const STATE_VALID: &'static str = "Valid";
    pub const STATE_WARNING: &'static str = "Warning";
    pub const STATE_INVALID: &'static str = "Invalid";

    pub const REASON_ADDED_OR_UPDATED: &'static str = "AddedOrUpdated";
    pub const REASON_REJECTED: &'static str = "Rejected";

    /// The status a controller reports after accepting and configuring a
    /// policy.
    pub fn accepted() -> Self {
        Self {
            state: Self::STATE_VALID.to_string(),
            reason: Self::REASON_ADDED_OR_UPDATED.to_string(),
            message: String::new(),
        }
    }

    pub fn is_accepted(&self) -> bool {
        self.state == Self::STATE_VALID && self.reason == Self::REASON_ADDED_OR_UPDATED
    }
}
