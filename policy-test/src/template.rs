//! Resource definitions loaded from YAML files.

use crate::{
    client::Kind,
    config::Fixture,
    scenario::{Expectation, PolicyScope},
    TemplateError,
};
use ingress_policy_k8s_api as k8s;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::path::Path;

/// A resource definition that can be submitted to the control plane.
#[derive(Clone, Debug, PartialEq)]
pub struct Template {
    origin: String,
    kind: Kind,
    name: String,
    value: Value,
}

/// The definitions a scenario set needs: one policy per scope variant, the
/// baseline virtual server, and the patch that attaches a policy to it.
#[derive(Clone, Debug, PartialEq)]
pub struct Templates {
    pub virtual_server: Template,
    pub virtual_server_policy: Template,
    pub policy: Template,
    pub policy_ingress_class: Template,
    pub policy_other_ingress_class: Template,
}

// === impl Template ===

impl Template {
    pub fn load(kind: Kind, path: impl AsRef<Path>) -> Result<Self, TemplateError> {
        let path = path.as_ref();
        let origin = path.display().to_string();
        let bytes = std::fs::read(path).map_err(|source| TemplateError::Read {
            origin: origin.clone(),
            source,
        })?;
        let value =
            serde_yaml::from_slice::<Value>(&bytes).map_err(|source| TemplateError::Parse {
                origin: origin.clone(),
                source,
            })?;
        Self::from_value(kind, origin, value)
    }

    /// Builds a template from an in-memory definition. `origin` names the
    /// definition in diagnostics.
    pub fn from_value(
        kind: Kind,
        origin: impl ToString,
        value: Value,
    ) -> Result<Self, TemplateError> {
        let origin = origin.to_string();

        let found = value.get("kind").and_then(Value::as_str);
        if found != Some(kind.as_str()) {
            return Err(TemplateError::Kind {
                found: found.map(String::from),
                origin,
                expected: kind,
            });
        }

        let name = match value.pointer("/metadata/name").and_then(Value::as_str) {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => return Err(TemplateError::MissingName { origin }),
        };

        Ok(Self {
            origin,
            kind,
            name,
            value,
        })
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Decodes the definition as a typed resource.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, TemplateError> {
        serde_json::from_value(self.value.clone()).map_err(|source| TemplateError::Schema {
            origin: self.origin.clone(),
            kind: self.kind,
            source,
        })
    }
}

// === impl Templates ===

impl Templates {
    pub const VIRTUAL_SERVER: &'static str = "virtual-server.yaml";
    pub const VIRTUAL_SERVER_POLICY: &'static str = "virtual-server-policy.yaml";
    pub const POLICY: &'static str = "policy.yaml";
    pub const POLICY_INGRESS_CLASS: &'static str = "policy-ingress-class.yaml";
    pub const POLICY_OTHER_INGRESS_CLASS: &'static str = "policy-other-ingress-class.yaml";

    /// Loads the template set from a directory using the conventional file
    /// names.
    pub fn load(dir: impl AsRef<Path>) -> Result<Self, TemplateError> {
        let dir = dir.as_ref();
        Ok(Self {
            virtual_server: Template::load(Kind::VirtualServer, dir.join(Self::VIRTUAL_SERVER))?,
            virtual_server_policy: Template::load(
                Kind::VirtualServer,
                dir.join(Self::VIRTUAL_SERVER_POLICY),
            )?,
            policy: Template::load(Kind::Policy, dir.join(Self::POLICY))?,
            policy_ingress_class: Template::load(
                Kind::Policy,
                dir.join(Self::POLICY_INGRESS_CLASS),
            )?,
            policy_other_ingress_class: Template::load(
                Kind::Policy,
                dir.join(Self::POLICY_OTHER_INGRESS_CLASS),
            )?,
        })
    }

    pub fn policy(&self, scope: PolicyScope) -> &Template {
        match scope {
            PolicyScope::Unscoped => &self.policy,
            PolicyScope::MatchingClass => &self.policy_ingress_class,
            PolicyScope::OtherClass => &self.policy_other_ingress_class,
        }
    }

    /// Checks that the set describes the scenarios it is used for against
    /// `fixture`.
    pub fn check(&self, fixture: &Fixture) -> Result<(), TemplateError> {
        let baseline = self.virtual_server.decode::<k8s::VirtualServer>()?;
        self.check_virtual_server(&self.virtual_server, &baseline, fixture)?;
        if baseline.spec.policy_refs().next().is_some() {
            return Err(TemplateError::Baseline {
                origin: self.virtual_server.origin.clone(),
                reason: "it references policies".to_string(),
            });
        }

        let patched = self.virtual_server_policy.decode::<k8s::VirtualServer>()?;
        self.check_virtual_server(&self.virtual_server_policy, &patched, fixture)?;
        if patched.spec.policy_refs().count() != 1 {
            return Err(TemplateError::Baseline {
                origin: self.virtual_server_policy.origin.clone(),
                reason: "it must reference exactly one policy".to_string(),
            });
        }

        for scope in PolicyScope::ALL {
            let template = self.policy(scope);
            let policy = template.decode::<k8s::Policy>()?;
            let class = policy.spec.ingress_class_name.clone();
            let scoped_as_declared = match scope {
                PolicyScope::Unscoped => class.as_deref().unwrap_or_default().is_empty(),
                PolicyScope::MatchingClass | PolicyScope::OtherClass => {
                    let applies = policy.spec.applies_to(&fixture.ingress_class);
                    class.is_some() && applies == (scope.expectation() == Expectation::Enforced)
                }
            };
            if !scoped_as_declared {
                return Err(TemplateError::Scope {
                    origin: template.origin.clone(),
                    scope,
                    found: class,
                });
            }

            if !patched
                .spec
                .references_policy(&template.name, &fixture.namespace, &fixture.namespace)
            {
                return Err(TemplateError::Reference {
                    origin: self.virtual_server_policy.origin.clone(),
                    policy: template.name.clone(),
                });
            }
        }

        Ok(())
    }

    fn check_virtual_server(
        &self,
        template: &Template,
        vs: &k8s::VirtualServer,
        fixture: &Fixture,
    ) -> Result<(), TemplateError> {
        if template.name != fixture.virtual_server {
            return Err(TemplateError::Baseline {
                origin: template.origin.clone(),
                reason: format!("it does not describe {}", fixture.virtual_server),
            });
        }
        if vs.spec.host != fixture.host {
            return Err(TemplateError::Baseline {
                origin: template.origin.clone(),
                reason: format!("it routes {}, not {}", vs.spec.host, fixture.host),
            });
        }
        Ok(())
    }
}
