//! Tool discovery with a TTL-bounded catalog cache.
//!
//! Catalogs are cached per handle id. Tool names are qualified as
//! `<handleId>.<rawName>` so the same raw name on two servers stays
//! distinct in the catalog shown to the LLM.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, warn};

use super::handle::McpHandle;
use super::transport::RawTool;

/// Longest qualified tool name most LLM backends accept.
pub const MAX_TOOL_NAME_LEN: usize = 64;

/// A discovered tool, qualified and bound to its handle.
#[derive(Debug, Clone)]
pub struct ToolDefinition {
    /// Qualified `<handleId>.<tool>` name.
    pub name: String,
    /// Tool description shown to the LLM.
    pub description: String,
    /// JSON-schema of the tool arguments.
    pub parameters: Value,
    /// The handle the tool lives on.
    pub handle: McpHandle,
}

impl ToolDefinition {
    /// The raw tool name, with the handle prefix stripped.
    #[must_use]
    pub fn raw_name(&self) -> &str {
        self.name
            .strip_prefix(&format!("{}.", self.handle.id))
            .unwrap_or(&self.name)
    }
}

/// Qualify raw tools for one handle.
#[must_use]
pub fn qualify(handle: &McpHandle, raw: Vec<RawTool>) -> Vec<ToolDefinition> {
    raw.into_iter()
        .map(|tool| {
            let name = format!("{}.{}", handle.id, tool.name);
            if name.len() > MAX_TOOL_NAME_LEN {
                // Raw names long enough to blow the budget are the
                // server's responsibility; surface it early.
                warn!(tool = %name, len = name.len(), "qualified tool name exceeds length budget");
            }
            ToolDefinition {
                name,
                description: tool.description.unwrap_or_default(),
                parameters: tool
                    .input_schema
                    .unwrap_or_else(|| serde_json::json!({"type": "object"})),
                handle: handle.clone(),
            }
        })
        .collect()
}

struct CachedCatalog {
    tools: Vec<ToolDefinition>,
    cached_at: Instant,
}

/// TTL-bounded cache of qualified tool catalogs, keyed by handle id.
pub struct DiscoveryCache {
    entries: Mutex<HashMap<String, CachedCatalog>>,
    ttl: Duration,
}

impl std::fmt::Debug for DiscoveryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoveryCache")
            .field("entries", &self.entries.lock().len())
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl Default for DiscoveryCache {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

impl DiscoveryCache {
    /// Create a cache with the given TTL.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// A fresh catalog for the handle, when one is cached.
    #[must_use]
    pub fn get(&self, handle_id: &str) -> Option<Vec<ToolDefinition>> {
        let entries = self.entries.lock();
        let cached = entries.get(handle_id)?;
        if cached.cached_at.elapsed() < self.ttl {
            debug!(handle = %handle_id, "discovery cache hit");
            Some(cached.tools.clone())
        } else {
            None
        }
    }

    /// Store a freshly discovered catalog.
    pub fn put(&self, handle_id: &str, tools: Vec<ToolDefinition>) {
        self.entries.lock().insert(
            handle_id.to_string(),
            CachedCatalog {
                tools,
                cached_at: Instant::now(),
            },
        );
    }

    /// Drop the catalog for a handle, forcing re-discovery.
    pub fn invalidate(&self, handle_id: &str) {
        self.entries.lock().remove(handle_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::handle;

    fn raw(name: &str) -> RawTool {
        RawTool {
            name: name.to_string(),
            description: Some(format!("{name} tool")),
            input_schema: None,
        }
    }

    #[test]
    fn qualification_prefixes_handle_id() {
        let handle = handle::http("http://a/mcp");
        let tools = qualify(&handle, vec![raw("add"), raw("sub")]);
        assert_eq!(tools[0].name, format!("{}.add", handle.id));
        assert_eq!(tools[0].raw_name(), "add");
        assert!(tools.iter().all(|t| t.name.len() <= MAX_TOOL_NAME_LEN));
    }

    #[test]
    fn same_raw_name_on_two_servers_stays_distinct() {
        let a = handle::http("http://a/mcp");
        let b = handle::http("http://b/mcp");
        let qa = qualify(&a, vec![raw("add")]);
        let qb = qualify(&b, vec![raw("add")]);
        assert_ne!(qa[0].name, qb[0].name);
    }

    #[test]
    fn cache_expires_after_ttl() {
        let cache = DiscoveryCache::new(Duration::from_millis(20));
        let handle = handle::http("http://a/mcp");
        cache.put(&handle.id, qualify(&handle, vec![raw("add")]));

        assert!(cache.get(&handle.id).is_some());
        std::thread::sleep(Duration::from_millis(30));
        assert!(cache.get(&handle.id).is_none());
    }

    #[test]
    fn invalidate_clears_one_handle() {
        let cache = DiscoveryCache::new(Duration::from_secs(60));
        let a = handle::http("http://a/mcp");
        let b = handle::http("http://b/mcp");
        cache.put(&a.id, qualify(&a, vec![raw("add")]));
        cache.put(&b.id, qualify(&b, vec![raw("add")]));

        cache.invalidate(&a.id);
        assert!(cache.get(&a.id).is_none());
        assert!(cache.get(&b.id).is_some());
    }
}
