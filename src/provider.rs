//! Providers and adapter dispatch. A provider is a named configuration
//! namespace binding api_classes to adapter implementations; the dispatch
//! table is built once from site config and held immutable for the life of
//! the executor.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use crate::adapter::{Adapter, AdapterError};
use crate::config::{ConfigError, SiteConfig};

type AdapterFactory =
    Arc<dyn Fn(&Value, &Value) -> Result<Arc<dyn Adapter>, AdapterError> + Send + Sync>;

/// Maps adapter implementation names (the `adapter:` field of a binding) to
/// their factories. Sites register custom adapters here before building the
/// dispatch table.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    factories: HashMap<String, AdapterFactory>,
}

impl AdapterRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All stock adapters under their canonical names.
    #[must_use]
    pub fn builtin() -> Self {
        use crate::adapters;
        let mut registry = Self::new();
        registry.register::<adapters::constant::Constant>("constant");
        registry.register::<adapters::greetme::GreetMe>("greetme");
        registry.register::<adapters::signal_client::SignalClient>("signal_client");
        registry.register::<adapters::send_message::SendMessage>("send_message");
        registry.register::<adapters::await_message::AwaitMessage>("await_message");
        registry.register::<adapters::zip2::Zip2>("zip2");
        registry.register::<adapters::sleepy::Sleepy>("sleepy");
        registry.register::<adapters::emit_series::EmitSeries>("emit_series");
        registry.register::<adapters::square::Square>("square");
        registry.register::<adapters::load_model_data::LoadModelData>("load_model_data");
        registry
    }

    /// Registers an adapter implementation under a name bindings can use.
    pub fn register<A: Adapter>(&mut self, name: &str) {
        self.factories.insert(
            name.to_string(),
            Arc::new(|config, params| {
                A::configure(config, params).map(|adapter| Arc::new(adapter) as Arc<dyn Adapter>)
            }),
        );
    }

    /// Registers a factory directly; the escape hatch tests use to wrap an
    /// adapter with counters or other instrumentation.
    pub fn register_factory(
        &mut self,
        name: &str,
        factory: impl Fn(&Value, &Value) -> Result<Arc<dyn Adapter>, AdapterError>
            + Send
            + Sync
            + 'static,
    ) {
        self.factories.insert(name.to_string(), Arc::new(factory));
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    fn get(&self, name: &str) -> Option<&AdapterFactory> {
        self.factories.get(name)
    }
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("adapters", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Runtime view of one configured provider.
#[derive(Debug)]
pub struct ProviderHandle {
    pub name: String,
    pub description: String,
    /// Where this provider's adapters materialize large outputs.
    pub cache_dir: Option<PathBuf>,
}

#[derive(Clone)]
struct Binding {
    adapter: String,
    config: Value,
}

/// A resolved `(provider, api_class)` pair: the instantiated adapter plus
/// the provider it runs under.
pub struct ResolvedAdapter {
    pub adapter: Arc<dyn Adapter>,
    pub provider: Arc<ProviderHandle>,
}

/// Entry in the discovery enumeration returned to clients.
#[derive(Debug, Clone, Serialize)]
pub struct DiscoveredProvider {
    pub name: String,
    pub description: String,
    pub apis: Vec<String>,
}

/// Immutable two-level dispatch map, `(provider, api_class)` to adapter
/// binding, built once at startup.
pub struct Dispatch {
    providers: BTreeMap<String, Arc<ProviderHandle>>,
    bindings: HashMap<(String, String), Binding>,
    registry: AdapterRegistry,
}

impl Dispatch {
    /// Validates every binding against the registry and freezes the table.
    pub fn new(site: &SiteConfig, registry: AdapterRegistry) -> Result<Self, ConfigError> {
        let mut providers = BTreeMap::new();
        let mut bindings = HashMap::new();
        for (name, provider_config) in &site.providers {
            providers.insert(
                name.clone(),
                Arc::new(ProviderHandle {
                    name: name.clone(),
                    description: provider_config
                        .description
                        .clone()
                        .unwrap_or_default(),
                    cache_dir: provider_config.cache_dir.clone(),
                }),
            );
            for (api_class, binding) in &provider_config.interface {
                if !registry.contains(&binding.adapter) {
                    return Err(ConfigError::UnknownAdapter {
                        provider: name.clone(),
                        api_class: api_class.clone(),
                        adapter: binding.adapter.clone(),
                    });
                }
                bindings.insert(
                    (name.clone(), api_class.clone()),
                    Binding {
                        adapter: binding.adapter.clone(),
                        config: binding.config.clone(),
                    },
                );
            }
        }
        Ok(Dispatch {
            providers,
            bindings,
            registry,
        })
    }

    #[must_use]
    pub fn provider(&self, name: &str) -> Option<Arc<ProviderHandle>> {
        self.providers.get(name).cloned()
    }

    #[must_use]
    pub fn offers(&self, provider: &str, api_class: &str) -> bool {
        self.bindings
            .contains_key(&(provider.to_string(), api_class.to_string()))
    }

    /// Instantiates a fresh adapter for one node execution.
    pub fn resolve(
        &self,
        provider: &str,
        api_class: &str,
        params: &Value,
    ) -> Result<ResolvedAdapter, AdapterError> {
        let binding = self
            .bindings
            .get(&(provider.to_string(), api_class.to_string()))
            .ok_or_else(|| {
                AdapterError::Internal(format!(
                    "no binding for {api_class} under provider {provider}"
                ))
            })?;
        let factory = self.registry.get(&binding.adapter).ok_or_else(|| {
            AdapterError::Internal(format!("adapter {} vanished from registry", binding.adapter))
        })?;
        let adapter = factory(&binding.config, params)?;
        let provider = self
            .provider(provider)
            .ok_or_else(|| AdapterError::Internal(format!("provider {provider} vanished")))?;
        Ok(ResolvedAdapter { adapter, provider })
    }

    /// The provider enumeration served by `/discover`.
    #[must_use]
    pub fn discover(&self) -> Vec<DiscoveredProvider> {
        self.providers
            .values()
            .map(|provider| {
                let mut apis: Vec<String> = self
                    .bindings
                    .keys()
                    .filter(|(p, _)| *p == provider.name)
                    .map(|(_, api)| api.clone())
                    .collect();
                apis.sort();
                DiscoveredProvider {
                    name: provider.name.clone(),
                    description: provider.description.clone(),
                    apis,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn builtin_dispatch_resolves_constant() {
        let site = SiteConfig::builtin("test");
        let dispatch = Dispatch::new(&site, AdapterRegistry::builtin()).unwrap();
        assert!(dispatch.offers("dfm", crate::api::CONSTANT_API));
        let resolved = dispatch
            .resolve("dfm", crate::api::CONSTANT_API, &json!({"value": 1}))
            .unwrap();
        assert_eq!(resolved.provider.name, "dfm");
    }

    #[test]
    fn unknown_adapter_binding_is_a_config_error() {
        let yaml = r#"
site: test
providers:
  dfm:
    interface:
      dfm.api.dfm.Constant: {adapter: does_not_exist}
"#;
        let site = SiteConfig::from_yaml(yaml).unwrap();
        assert!(matches!(
            Dispatch::new(&site, AdapterRegistry::builtin()),
            Err(ConfigError::UnknownAdapter { .. })
        ));
    }

    #[test]
    fn discover_lists_apis_per_provider() {
        let site = SiteConfig::builtin("test");
        let dispatch = Dispatch::new(&site, AdapterRegistry::builtin()).unwrap();
        let discovered = dispatch.discover();
        assert_eq!(discovered.len(), 1);
        assert_eq!(discovered[0].name, "dfm");
        assert!(discovered[0]
            .apis
            .contains(&crate::api::CONSTANT_API.to_string()));
    }
}
