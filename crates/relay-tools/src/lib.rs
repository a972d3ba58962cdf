use async_trait::async_trait;
use relay_core::{RelayError, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// A tool the agent loop can invoke: built-in or bridged from a provider.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn schema(&self) -> Value;
    async fn execute(&self, args: Value) -> Result<Value>;
}

/// Flat registry of every invocable tool, keyed by globally-unique name.
pub struct ToolRegistry {
    tools: Arc<RwLock<HashMap<String, Arc<dyn Tool>>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn register(&self, tool: impl Tool + 'static) -> Result<()> {
        self.register_arc(Arc::new(tool))
    }

    /// Register a tool. A name that is already taken is rejected rather than
    /// silently overwritten.
    pub fn register_arc(&self, tool: Arc<dyn Tool>) -> Result<()> {
        let mut tools = self.tools.write().unwrap();
        let name = tool.name().to_string();
        if tools.contains_key(&name) {
            return Err(RelayError::Config(format!(
                "tool '{name}' is already registered"
            )));
        }
        tools.insert(name, tool);
        Ok(())
    }

    pub fn unregister(&self, name: &str) {
        self.tools.write().unwrap().remove(name);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.read().unwrap().contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.read().unwrap().get(name).cloned()
    }

    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.read().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn get_all(&self) -> Vec<Arc<dyn Tool>> {
        self.tools.read().unwrap().values().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.read().unwrap().is_empty()
    }

    pub fn len(&self) -> usize {
        self.tools.read().unwrap().len()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct StubTool {
        name: String,
    }

    #[async_trait]
    impl Tool for StubTool {
        fn name(&self) -> &str {
            &self.name
        }

        fn description(&self) -> &str {
            "a stub tool"
        }

        fn schema(&self) -> Value {
            json!({"type": "object", "properties": {}})
        }

        async fn execute(&self, _args: Value) -> Result<Value> {
            Ok(json!({"result": "ok"}))
        }
    }

    #[test]
    fn register_and_lookup() {
        let registry = ToolRegistry::new();
        registry
            .register(StubTool {
                name: "stub".into(),
            })
            .unwrap();

        assert!(registry.contains("stub"));
        assert_eq!(registry.list(), vec!["stub".to_string()]);
        assert!(registry.get("missing").is_none());

        registry.unregister("stub");
        assert!(registry.is_empty());
    }

    #[test]
    fn duplicate_name_is_rejected() {
        let registry = ToolRegistry::new();
        registry
            .register(StubTool {
                name: "stub".into(),
            })
            .unwrap();

        let err = registry
            .register(StubTool {
                name: "stub".into(),
            })
            .unwrap_err();
        assert!(matches!(err, RelayError::Config(_)));
        assert_eq!(registry.len(), 1);
    }
}
