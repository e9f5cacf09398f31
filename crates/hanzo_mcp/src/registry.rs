//! Tool Registry - Startup Linkage and Dispatch Table
//!
//! Tool packages are linked at compile time: each tool module exports a
//! manifest of descriptors plus handler references, and the registry folds
//! them into one dispatch table before the transport accepts traffic.
//! Duplicate names abort startup naming the collision. The registry never
//! changes afterwards.

use crate::schema::ParamSchema;
use crate::tools::ToolHandler;
use anyhow::bail;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Registry class, used for CLI-level filtering of tool families.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolClass {
    FilesystemRead,
    FilesystemWrite,
    Search,
    Shell,
    Process,
}

impl ToolClass {
    /// Wire category tag.
    pub fn category(self) -> &'static str {
        match self {
            Self::FilesystemRead | Self::FilesystemWrite => "filesystem",
            Self::Search => "search",
            Self::Shell => "shell",
            Self::Process => "process",
        }
    }
}

/// Immutable description of one tool.
#[derive(Debug, Clone)]
pub struct ToolDescriptor {
    pub name: &'static str,
    pub description: &'static str,
    pub schema: ParamSchema,
    pub class: ToolClass,
}

/// One tool package's contribution to the registry.
pub struct ToolManifest {
    pub package: &'static str,
    pub tools: Vec<(ToolDescriptor, Arc<dyn ToolHandler>)>,
}

/// A linked, dispatchable tool.
pub struct RegisteredTool {
    pub descriptor: ToolDescriptor,
    pub handler: Arc<dyn ToolHandler>,
    pub package: &'static str,
}

/// The dispatch table. Sorted by name so `tools/list` is deterministic.
pub struct ToolRegistry {
    table: BTreeMap<&'static str, RegisteredTool>,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.table.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Which tool classes to withhold from the table.
#[derive(Debug, Clone, Copy, Default)]
pub struct RegistryFilter {
    pub disable_write_tools: bool,
    pub disable_search_tools: bool,
}

impl RegistryFilter {
    fn keeps(&self, class: ToolClass) -> bool {
        match class {
            ToolClass::FilesystemWrite => !self.disable_write_tools,
            ToolClass::Search => !self.disable_search_tools,
            _ => true,
        }
    }
}

impl ToolRegistry {
    /// Link manifests into the dispatch table. A name collision is a
    /// startup error, not a warning.
    pub fn build(manifests: Vec<ToolManifest>, filter: RegistryFilter) -> anyhow::Result<Self> {
        let mut table: BTreeMap<&'static str, RegisteredTool> = BTreeMap::new();

        for manifest in manifests {
            for (descriptor, handler) in manifest.tools {
                if !filter.keeps(descriptor.class) {
                    debug!(tool = descriptor.name, "withheld by registry filter");
                    continue;
                }
                let name = descriptor.name;
                if let Some(existing) = table.get(name) {
                    bail!(
                        "tool name collision: `{}` provided by both `{}` and `{}`",
                        name,
                        existing.package,
                        manifest.package
                    );
                }
                debug!(tool = name, package = manifest.package, "registered tool");
                table.insert(
                    name,
                    RegisteredTool {
                        descriptor,
                        handler,
                        package: manifest.package,
                    },
                );
            }
        }

        Ok(Self { table })
    }

    /// Snapshot for `tools/list`.
    pub fn list(&self) -> Vec<crate::protocol::ToolDefinition> {
        self.table
            .values()
            .map(|tool| crate::protocol::ToolDefinition {
                name: tool.descriptor.name.to_string(),
                description: tool.descriptor.description.to_string(),
                input_schema: tool.descriptor.schema.to_json_schema(),
                category: tool.descriptor.class.category().to_string(),
            })
            .collect()
    }

    /// Dispatch lookup.
    pub fn resolve(&self, name: &str) -> Option<&RegisteredTool> {
        self.table.get(name)
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

/// The built-in tool packages shipped with the server.
pub fn builtin_manifests() -> Vec<ToolManifest> {
    vec![
        crate::tools::fs::manifest(),
        crate::tools::search::manifest(),
        crate::tools::shell::manifest(),
        crate::tools::process::manifest(),
    ]
}
