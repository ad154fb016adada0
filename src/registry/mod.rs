//! Provider registry
//!
//! An immutable catalog of provider specifications and their operation
//! handlers. Built once at startup and shared by `Arc`; a misconfigured
//! registry is a startup error, never a request-time one.

use crate::config::Config;
use crate::model::{
    CredentialPayload, OperationDescriptor, OperationResult, ProviderSpec, ProviderSummary,
};
use crate::{BrokerError, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Inputs available to an operation handler
pub struct OperationContext<'a> {
    pub org_id: &'a str,
    pub provider: &'a ProviderSpec,
    pub operation: &'a OperationDescriptor,
    /// Minted credential; `None` only for operations that do not require one
    pub credential: Option<&'a CredentialPayload>,
    pub config: &'a Value,
}

/// Executes one named provider operation
///
/// Errors returned here are reported to callers as an `OperationResult` with
/// status `Error`, not as a hard failure.
#[async_trait]
pub trait OperationHandler: Send + Sync {
    async fn execute(&self, ctx: OperationContext<'_>) -> Result<OperationResult>;
}

/// A provider specification together with the handlers for its operations
pub struct ProviderDefinition {
    pub spec: ProviderSpec,
    pub handlers: HashMap<String, Arc<dyn OperationHandler>>,
}

impl ProviderDefinition {
    pub fn new(spec: ProviderSpec) -> Self {
        Self {
            spec,
            handlers: HashMap::new(),
        }
    }

    pub fn handler(mut self, operation: &str, handler: Arc<dyn OperationHandler>) -> Self {
        self.handlers.insert(operation.to_string(), handler);
        self
    }
}

struct RegisteredProvider {
    spec: ProviderSpec,
    handlers: HashMap<String, Arc<dyn OperationHandler>>,
}

pub struct ProviderRegistry {
    providers: HashMap<String, RegisteredProvider>,
    order: Vec<String>,
}

impl ProviderRegistry {
    /// Build a registry, failing on duplicate names or unbacked operations
    pub fn new(definitions: Vec<ProviderDefinition>) -> Result<Self> {
        let mut providers = HashMap::with_capacity(definitions.len());
        let mut order = Vec::with_capacity(definitions.len());

        for definition in definitions {
            let ProviderDefinition { spec, handlers } = definition;
            let name = spec.name.clone();

            if name.trim().is_empty() {
                return Err(BrokerError::config("Provider name must not be empty"));
            }
            if providers.contains_key(&name) {
                return Err(BrokerError::config(format!(
                    "Provider '{}' is registered more than once",
                    name
                )));
            }
            if spec.active && spec.auth_type.is_oauth() && spec.oauth.is_none() {
                return Err(BrokerError::config(format!(
                    "Provider '{}' uses {} but has no OAuth configuration",
                    name, spec.auth_type
                )));
            }

            let mut declared = HashSet::new();
            for op in &spec.operations {
                if !declared.insert(op.name.as_str()) {
                    return Err(BrokerError::config(format!(
                        "Provider '{}' declares operation '{}' more than once",
                        name, op.name
                    )));
                }
                if !handlers.contains_key(&op.name) {
                    return Err(BrokerError::config(format!(
                        "Provider '{}' declares operation '{}' without a handler",
                        name, op.name
                    )));
                }
            }
            if let Some(extra) = handlers.keys().find(|h| !declared.contains(h.as_str())) {
                return Err(BrokerError::config(format!(
                    "Provider '{}' has a handler for undeclared operation '{}'",
                    name, extra
                )));
            }

            order.push(name.clone());
            providers.insert(name, RegisteredProvider { spec, handlers });
        }

        Ok(Self { providers, order })
    }

    /// Registry of the built-in providers, configured from `config.providers`
    pub fn builtin(config: &Config) -> Result<Self> {
        Self::new(crate::providers::builtin_definitions(config)?)
    }

    pub fn config(&self, provider: &str) -> Option<&ProviderSpec> {
        self.providers.get(provider).map(|p| &p.spec)
    }

    pub fn operation_descriptors(&self, provider: &str) -> &[OperationDescriptor] {
        self.providers
            .get(provider)
            .map(|p| p.spec.operations.as_slice())
            .unwrap_or(&[])
    }

    /// Descriptor and handler for a declared operation
    pub fn operation(
        &self,
        provider: &str,
        operation: &str,
    ) -> Option<(&OperationDescriptor, Arc<dyn OperationHandler>)> {
        let registered = self.providers.get(provider)?;
        let descriptor = registered
            .spec
            .operations
            .iter()
            .find(|op| op.name == operation)?;
        let handler = registered.handlers.get(operation)?.clone();
        Some((descriptor, handler))
    }

    /// Non-secret metadata for every provider, in registration order
    pub fn list(&self) -> Vec<ProviderSummary> {
        self.order
            .iter()
            .filter_map(|name| self.providers.get(name))
            .map(|p| ProviderSummary::from(&p.spec))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.order)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AuthType;
    use serde_json::json;
    use std::time::Duration;

    struct Noop;

    #[async_trait]
    impl OperationHandler for Noop {
        async fn execute(&self, _ctx: OperationContext<'_>) -> Result<OperationResult> {
            Ok(OperationResult::ok("noop"))
        }
    }

    fn static_spec(name: &str, ops: &[&str]) -> ProviderSpec {
        ProviderSpec {
            name: name.to_string(),
            display_name: name.to_uppercase(),
            description: String::new(),
            auth_type: AuthType::Static,
            credential_schema: json!({"required": ["api_key"]}),
            oauth: None,
            operations: ops
                .iter()
                .map(|op| OperationDescriptor::new(*op, Duration::from_secs(5)))
                .collect(),
            active: true,
            webhook_secret: None,
            api_base_url: None,
        }
    }

    fn definition(name: &str, ops: &[&str]) -> ProviderDefinition {
        ops.iter().fold(
            ProviderDefinition::new(static_spec(name, ops)),
            |def, op| def.handler(op, Arc::new(Noop)),
        )
    }

    #[test]
    fn test_lookup_and_descriptors() {
        let registry = ProviderRegistry::new(vec![
            definition("alpha", &["health.default", "scan"]),
            definition("beta", &[]),
        ])
        .unwrap();

        assert_eq!(registry.len(), 2);
        assert!(registry.config("alpha").is_some());
        assert!(registry.config("gamma").is_none());
        assert_eq!(registry.operation_descriptors("alpha").len(), 2);
        assert!(registry.operation_descriptors("gamma").is_empty());
        assert!(registry.operation("alpha", "scan").is_some());
        assert!(registry.operation("beta", "scan").is_none());
    }

    #[test]
    fn test_duplicate_provider_rejected() {
        let err = ProviderRegistry::new(vec![definition("alpha", &[]), definition("alpha", &[])])
            .unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn test_operation_without_handler_rejected() {
        let def = ProviderDefinition::new(static_spec("alpha", &["scan"]));
        let err = ProviderRegistry::new(vec![def]).unwrap_err();
        assert!(err.to_string().contains("without a handler"));
    }

    #[test]
    fn test_handler_for_undeclared_operation_rejected() {
        let def = definition("alpha", &[]).handler("ghost", Arc::new(Noop));
        let err = ProviderRegistry::new(vec![def]).unwrap_err();
        assert!(err.to_string().contains("undeclared"));
    }

    #[test]
    fn test_active_oauth_provider_requires_oauth_block() {
        let mut spec = static_spec("alpha", &[]);
        spec.auth_type = AuthType::OAuth2;
        let err = ProviderRegistry::new(vec![ProviderDefinition::new(spec)]).unwrap_err();
        assert!(matches!(err, BrokerError::Config(_)));
    }

    #[test]
    fn test_list_preserves_registration_order() {
        let registry = ProviderRegistry::new(vec![
            definition("zeta", &[]),
            definition("alpha", &["scan"]),
        ])
        .unwrap();

        let names: Vec<_> = registry.list().into_iter().map(|p| p.name).collect();
        assert_eq!(names, vec!["zeta", "alpha"]);
    }
}
