use crate::tool::{Tool, ToolDefinition};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info};

/// Manages available tools, their schemas, and lookup.
///
/// Tools are registered directly or through named modules that stay in a
/// catalog until a caller loads them. Re-registering a name replaces the
/// previous tool (last write wins), which is what hot reload relies on.
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<dyn Tool>>>,
    modules: RwLock<HashMap<String, Vec<Arc<dyn Tool>>>>,
    loaded: RwLock<BTreeSet<String>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
            modules: RwLock::new(HashMap::new()),
            loaded: RwLock::new(BTreeSet::new()),
        }
    }

    fn tools_read(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<dyn Tool>>> {
        self.tools.read().unwrap_or_else(|e| e.into_inner())
    }

    fn tools_write(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<dyn Tool>>> {
        self.tools.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a tool, replacing any tool with the same canonical name.
    /// Returns the replaced tool, if there was one.
    pub fn register(&self, tool: Arc<dyn Tool>) -> Option<Arc<dyn Tool>> {
        let name = tool.definition().name;
        let previous = self.tools_write().insert(name.clone(), tool);
        if previous.is_some() {
            debug!(tool = %name, "Replaced registered tool");
        } else {
            debug!(tool = %name, "Registered tool");
        }
        previous
    }

    /// Look up a tool by canonical name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools_read().get(name).cloned()
    }

    pub fn has(&self, name: &str) -> bool {
        self.tools_read().contains_key(name)
    }

    pub fn definition(&self, name: &str) -> Option<ToolDefinition> {
        self.get(name).map(|t| t.definition())
    }

    /// Snapshot of every registered tool.
    pub fn all(&self) -> Vec<Arc<dyn Tool>> {
        self.tools_read().values().cloned().collect()
    }

    /// Snapshot of registered definitions, sorted by name.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<_> = self.tools_read().values().map(|t| t.definition()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Registered canonical names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.tools_read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of registered tools.
    pub fn len(&self) -> usize {
        self.tools_read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools_read().is_empty()
    }

    /// Make a module available for loading without registering its tools.
    /// Adding a module under an existing name replaces its tool list.
    pub fn add_module(&self, module: impl Into<String>, tools: Vec<Arc<dyn Tool>>) {
        let module = module.into();
        debug!(module = %module, count = tools.len(), "Module added to catalog");
        self.modules
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(module, tools);
    }

    /// Register every tool of `module` that is not registered yet and return
    /// only the newly added definitions, so callers can announce the delta.
    pub fn load_module(&self, module: &str) -> Result<Vec<ToolDefinition>, RegistryError> {
        let tools = self
            .modules
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(module)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownModule(module.to_string()))?;

        let mut added = Vec::new();
        {
            let mut registered = self.tools_write();
            for tool in tools {
                let def = tool.definition();
                if registered.contains_key(&def.name) {
                    continue;
                }
                registered.insert(def.name.clone(), tool);
                added.push(def);
            }
        }
        self.loaded
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(module.to_string());

        info!(module, added = added.len(), "Loaded tool module");
        Ok(added)
    }

    /// Names of every module in the catalog, sorted.
    pub fn available_modules(&self) -> Vec<String> {
        let mut names: Vec<_> = self
            .modules
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn loaded_modules(&self) -> Vec<String> {
        self.loaded
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    /// Case-insensitive search over catalog tools by name and description.
    /// Returns `(module, definition)` pairs sorted by tool name.
    pub fn search(&self, query: &str) -> Vec<(String, ToolDefinition)> {
        let needle = query.to_lowercase();
        let modules = self.modules.read().unwrap_or_else(|e| e.into_inner());
        let mut hits: Vec<_> = modules
            .iter()
            .flat_map(|(module, tools)| {
                tools.iter().map(move |t| (module.clone(), t.definition()))
            })
            .filter(|(module, def)| {
                needle.is_empty()
                    || module.to_lowercase().contains(&needle)
                    || def.name.to_lowercase().contains(&needle)
                    || def.description.to_lowercase().contains(&needle)
            })
            .collect();
        hits.sort_by(|a, b| a.1.name.cmp(&b.1.name));
        hits
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Unknown tool module '{0}'")]
    UnknownModule(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::{ToolContext, ToolError, ToolResult};
    use crate::tools::EchoTool;
    use async_trait::async_trait;
    use serde_json::{json, Value};

    struct Named(&'static str, &'static str);

    #[async_trait]
    impl Tool for Named {
        fn definition(&self) -> ToolDefinition {
            ToolDefinition::new(self.0, self.1, json!({"type": "object"}))
        }

        async fn execute(&self, _input: Value, _ctx: &ToolContext) -> Result<ToolResult, ToolError> {
            Ok(ToolResult::ok(json!(self.1)))
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool));

        assert_eq!(registry.len(), 1);
        assert!(registry.has("echo"));
        assert!(registry.get("echo").is_some());
        assert!(registry.get("nonexistent").is_none());
    }

    #[test]
    fn test_duplicate_registration_overwrites() {
        let registry = ToolRegistry::new();
        assert!(registry.register(Arc::new(Named("projects.list", "v1"))).is_none());
        let previous = registry.register(Arc::new(Named("projects.list", "v2")));

        assert!(previous.is_some());
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.definition("projects.list").unwrap().description, "v2");
    }

    #[test]
    fn test_list_definitions() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(Named("b.two", "")));
        registry.register(Arc::new(Named("a.one", "")));

        let defs = registry.definitions();
        assert_eq!(defs.len(), 2);
        assert_eq!(defs[0].name, "a.one");
        assert_eq!(registry.all().len(), 2);
    }

    #[test]
    fn test_load_module_returns_delta() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(Named("projects.list", "already here")));
        registry.add_module(
            "projects",
            vec![
                Arc::new(Named("projects.list", "catalog copy")),
                Arc::new(Named("projects.create", "")),
            ],
        );

        let added = registry.load_module("projects").unwrap();
        assert_eq!(added.len(), 1);
        assert_eq!(added[0].name, "projects.create");
        // the directly registered tool is kept
        assert_eq!(registry.definition("projects.list").unwrap().description, "already here");

        let again = registry.load_module("projects").unwrap();
        assert!(again.is_empty());
        assert_eq!(registry.loaded_modules(), vec!["projects".to_string()]);
    }

    #[test]
    fn test_load_unknown_module() {
        let registry = ToolRegistry::new();
        assert!(matches!(
            registry.load_module("nope"),
            Err(RegistryError::UnknownModule(m)) if m == "nope"
        ));
    }

    #[test]
    fn test_search_catalog() {
        let registry = ToolRegistry::new();
        registry.add_module("crm", vec![Arc::new(Named("crm.contacts.find", "Find a contact"))]);
        registry.add_module("tasks", vec![Arc::new(Named("tasks.create", "Create a task"))]);

        let hits = registry.search("CONTACT");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, "crm");
        assert_eq!(registry.search("").len(), 2);
        assert_eq!(registry.available_modules(), vec!["crm".to_string(), "tasks".to_string()]);
    }
}
