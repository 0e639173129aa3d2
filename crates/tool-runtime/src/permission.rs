use crate::tool::{module_of, scope_of, NameScope, ToolContext, ToolDefinition};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// External authorization collaborator: may this caller use this module?
#[async_trait]
pub trait AuthorizationOracle: Send + Sync {
    async fn is_allowed(&self, context: &ToolContext, module: &str) -> bool;
}

/// Result of checking permissions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PermissionDecision {
    Approved,
    Denied { module: String },
}

impl PermissionDecision {
    pub fn is_approved(&self) -> bool {
        matches!(self, PermissionDecision::Approved)
    }
}

/// Gates tools by their owning module. Names without a namespace segment
/// (core/utility tools) are always allowed; dotted names with an empty
/// segment are always refused.
#[derive(Clone)]
pub struct PermissionFilter {
    oracle: Arc<dyn AuthorizationOracle>,
}

impl PermissionFilter {
    pub fn new(oracle: Arc<dyn AuthorizationOracle>) -> Self {
        Self { oracle }
    }

    /// Filter that approves every module.
    pub fn allow_all() -> Self {
        Self::new(Arc::new(PolicyOracle::new(ModulePolicy::allow_all())))
    }

    pub fn owning_module(tool_name: &str) -> Option<&str> {
        module_of(tool_name)
    }

    pub async fn check(&self, tool_name: &str, context: &ToolContext) -> PermissionDecision {
        let module = match scope_of(tool_name) {
            NameScope::Unscoped => return PermissionDecision::Approved,
            NameScope::Malformed => {
                info!(tool = tool_name, "Refusing tool with an empty name segment");
                return PermissionDecision::Denied {
                    module: tool_name.to_string(),
                };
            }
            NameScope::Module(module) => module,
        };
        if self.oracle.is_allowed(context, module).await {
            PermissionDecision::Approved
        } else {
            info!(
                tool = tool_name,
                module,
                user = context.user_id.as_deref().unwrap_or("-"),
                tenant = context.tenant_id.as_deref().unwrap_or("-"),
                "Tool access denied"
            );
            PermissionDecision::Denied {
                module: module.to_string(),
            }
        }
    }

    /// Keep only the definitions the caller may use. Each module is asked once.
    pub async fn filter(&self, definitions: Vec<ToolDefinition>, context: &ToolContext) -> Vec<ToolDefinition> {
        let mut verdicts: HashMap<String, bool> = HashMap::new();
        let mut allowed = Vec::with_capacity(definitions.len());
        for def in definitions {
            let ok = match scope_of(&def.name) {
                NameScope::Unscoped => true,
                NameScope::Malformed => false,
                NameScope::Module(module) => match verdicts.get(module) {
                    Some(&v) => v,
                    None => {
                        let v = self.oracle.is_allowed(context, module).await;
                        verdicts.insert(module.to_string(), v);
                        v
                    }
                },
            };
            if ok {
                allowed.push(def);
            }
        }
        allowed
    }
}

/// Access level for a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionLevel {
    Allow,
    Deny,
}

/// Static module rules, optionally scoped per tenant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModulePolicy {
    /// Rules for every tenant, keyed by module name or `prefix*` glob
    #[serde(default)]
    pub rules: HashMap<String, PermissionLevel>,
    /// Tenant-specific rules, checked before `rules`
    #[serde(default)]
    pub tenants: HashMap<String, HashMap<String, PermissionLevel>>,
    /// Level for modules no rule matches
    pub default: PermissionLevel,
}

impl ModulePolicy {
    pub fn new() -> Self {
        Self {
            rules: HashMap::new(),
            tenants: HashMap::new(),
            default: PermissionLevel::Deny,
        }
    }

    pub fn allow_all() -> Self {
        Self {
            default: PermissionLevel::Allow,
            ..Self::new()
        }
    }

    /// Get the level for a module.
    /// Checks tenant rules, then global rules; exact match before glob, then default.
    pub fn level_for(&self, tenant: Option<&str>, module: &str) -> PermissionLevel {
        if let Some(level) = tenant
            .and_then(|t| self.tenants.get(t))
            .and_then(|rules| match_rules(rules, module))
        {
            return level;
        }
        match_rules(&self.rules, module).unwrap_or(self.default)
    }
}

impl Default for ModulePolicy {
    fn default() -> Self {
        Self::new()
    }
}

fn match_rules(rules: &HashMap<String, PermissionLevel>, module: &str) -> Option<PermissionLevel> {
    if let Some(&level) = rules.get(module) {
        return Some(level);
    }
    // Longest matching glob wins so results do not depend on map order
    rules
        .iter()
        .filter_map(|(pattern, &level)| {
            let prefix = pattern.strip_suffix('*')?;
            module.starts_with(prefix).then_some((prefix.len(), level))
        })
        .max_by_key(|(len, _)| *len)
        .map(|(_, level)| level)
}

/// A policy-backed oracle (no external lookups).
pub struct PolicyOracle {
    policy: ModulePolicy,
}

impl PolicyOracle {
    pub fn new(policy: ModulePolicy) -> Self {
        Self { policy }
    }
}

#[async_trait]
impl AuthorizationOracle for PolicyOracle {
    async fn is_allowed(&self, context: &ToolContext, module: &str) -> bool {
        self.policy.level_for(context.tenant_id.as_deref(), module) == PermissionLevel::Allow
    }
}
