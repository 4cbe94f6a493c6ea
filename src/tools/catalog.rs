//! Tool catalog: the repository seam and an in-memory implementation.
//!
//! The engine reads tools and groups, writes back status/error and calling
//! logs, and routes group and dependency updates so live gates and cached
//! certifications follow them. Everything else (create, snapshot loading) lives on
//! `MemoryCatalog`, which enforces catalog invariants at write time: unique
//! names, existing group and dependency references, `max_concurrency >= 1`,
//! duplicate-free dependency sets.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::model::{CallingLog, ConcurrencyGroup, Dependency, Tool, ToolStatus};
use crate::types::{CallLogId, DependencyId, Error, GroupId, Result, ToolId};

// =============================================================================
// Repository trait
// =============================================================================

/// Durable store of catalog records, as seen by the engine.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ToolRepository: Send + Sync {
    async fn get_tool(&self, id: ToolId) -> Result<Tool>;

    async fn get_tool_by_name(&self, name: &str) -> Result<Tool>;

    async fn list_tools(&self) -> Result<Vec<Tool>>;

    /// Overwrite a tool's status and error. A healthy status with a
    /// non-empty error is rejected.
    async fn update_status(&self, id: ToolId, status: ToolStatus, error: &str) -> Result<()>;

    async fn get_concurrency_group(&self, id: GroupId) -> Result<ConcurrencyGroup>;

    /// Replace a concurrency group record.
    async fn update_group(&self, group: ConcurrencyGroup) -> Result<ConcurrencyGroup>;

    /// Replace a dependency record.
    async fn update_dependency(&self, dep: Dependency) -> Result<Arc<Dependency>>;

    async fn record_call(&self, log: CallingLog) -> Result<CallLogId>;

    /// Delete calling logs of `callee` created before `older_than`. Returns the count removed.
    async fn prune_calls(&self, callee: ToolId, older_than: DateTime<Utc>) -> Result<usize>;
}

// =============================================================================
// Snapshot format
// =============================================================================

/// A tool entry in a snapshot; references are by name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    #[serde(flatten)]
    pub tool: Tool,
    /// Name of the concurrency group.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    /// Names of dependencies (command-line tools only).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
}

/// JSON document describing a whole catalog.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogSnapshot {
    #[serde(default)]
    pub groups: Vec<ConcurrencyGroup>,
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
    #[serde(default)]
    pub tools: Vec<ToolSpec>,
}

// =============================================================================
// In-memory catalog
// =============================================================================

#[derive(Debug, Clone)]
struct StoredTool {
    /// Stored with `dependencies` emptied; resolved from `dependency_ids` on read.
    tool: Tool,
    dependency_ids: Vec<DependencyId>,
}

#[derive(Debug, Default)]
struct CatalogState {
    tools: BTreeMap<ToolId, StoredTool>,
    dependencies: BTreeMap<DependencyId, Arc<Dependency>>,
    groups: BTreeMap<GroupId, ConcurrencyGroup>,
    calls: BTreeMap<CallLogId, CallingLog>,
    last_id: u64,
    last_timestamp: Option<DateTime<Utc>>,
}

impl CatalogState {
    fn next_id(&mut self) -> u64 {
        self.last_id += 1;
        self.last_id
    }

    /// Strictly increasing timestamps, even when the wall clock is not.
    fn tick(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let ts = match self.last_timestamp {
            Some(last) if now <= last => last + chrono::Duration::microseconds(1),
            _ => now,
        };
        self.last_timestamp = Some(ts);
        ts
    }

    fn resolve(&self, stored: &StoredTool) -> Tool {
        let mut tool = stored.tool.clone();
        if let Tool::CommandLine(cmd) = &mut tool {
            cmd.dependencies = stored
                .dependency_ids
                .iter()
                .filter_map(|id| self.dependencies.get(id).cloned())
                .collect();
        }
        tool
    }

    fn tool_name_taken(&self, name: &str, except: Option<ToolId>) -> bool {
        self.tools
            .values()
            .any(|t| t.tool.name() == name && Some(t.tool.id()) != except)
    }

    /// Validate a tool write and split out its dependency ids.
    fn check_tool(&self, tool: &Tool, except: Option<ToolId>) -> Result<Vec<DependencyId>> {
        let name = tool.name().trim();
        if name.is_empty() {
            return Err(Error::validation("tool name cannot be empty"));
        }
        if self.tool_name_taken(name, except) {
            return Err(Error::validation(format!("tool name '{}' already exists", name)));
        }
        if let Some(group) = tool.concurrency_group_id() {
            if !self.groups.contains_key(&group) {
                return Err(Error::validation(format!(
                    "tool '{}' references unknown concurrency group {}",
                    name, group
                )));
            }
        }

        match tool {
            Tool::CommandLine(cmd) => {
                if cmd.cmd.first().is_none_or(|p| p.is_empty()) {
                    return Err(Error::validation(format!("tool '{}' has an empty command", name)));
                }
                let mut seen = HashSet::new();
                let mut ids = Vec::with_capacity(cmd.dependencies.len());
                for dep in &cmd.dependencies {
                    if !self.dependencies.contains_key(&dep.id) {
                        return Err(Error::validation(format!(
                            "tool '{}' references unknown dependency '{}' ({})",
                            name, dep.name, dep.id
                        )));
                    }
                    if !seen.insert(dep.id) {
                        return Err(Error::validation(format!(
                            "tool '{}' lists dependency '{}' more than once",
                            name, dep.name
                        )));
                    }
                    ids.push(dep.id);
                }
                Ok(ids)
            }
            Tool::Service(svc) => {
                if svc.start_cmd.trim().is_empty() {
                    return Err(Error::validation(format!(
                        "service '{}' has an empty start command",
                        name
                    )));
                }
                Ok(Vec::new())
            }
        }
    }

    fn check_group(&self, group: &ConcurrencyGroup, except: Option<GroupId>) -> Result<()> {
        if group.name.trim().is_empty() {
            return Err(Error::validation("group name cannot be empty"));
        }
        if group.max_concurrency < 1 {
            return Err(Error::validation(format!(
                "group '{}' must allow at least one concurrent invocation",
                group.name
            )));
        }
        let taken = self
            .groups
            .values()
            .any(|g| g.name == group.name && Some(g.id) != except);
        if taken {
            return Err(Error::validation(format!(
                "group name '{}' already exists",
                group.name
            )));
        }
        Ok(())
    }

    fn check_dependency(&self, dep: &Dependency, except: Option<DependencyId>) -> Result<()> {
        if dep.name.trim().is_empty() {
            return Err(Error::validation("dependency name cannot be empty"));
        }
        let taken = self
            .dependencies
            .values()
            .any(|d| d.name == dep.name && Some(d.id) != except);
        if taken {
            return Err(Error::validation(format!(
                "dependency name '{}' already exists",
                dep.name
            )));
        }
        if dep.testcases.iter().any(|tc| tc.cmd.is_empty()) {
            return Err(Error::validation(format!(
                "dependency '{}' has a testcase with an empty command",
                dep.name
            )));
        }
        Ok(())
    }
}

/// Catalog held in process memory.
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    state: RwLock<CatalogState>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, CatalogState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, CatalogState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    // -------------------------------------------------------------------------
    // Groups
    // -------------------------------------------------------------------------

    pub fn create_group(&self, mut group: ConcurrencyGroup) -> Result<ConcurrencyGroup> {
        let mut state = self.write();
        state.check_group(&group, None)?;
        group.id = GroupId::new(state.next_id());
        group.created_at = state.tick();
        group.updated_at = group.created_at;
        state.groups.insert(group.id, group.clone());
        Ok(group)
    }

    pub fn update_group(&self, mut group: ConcurrencyGroup) -> Result<ConcurrencyGroup> {
        let mut state = self.write();
        let created_at = state
            .groups
            .get(&group.id)
            .map(|g| g.created_at)
            .ok_or_else(|| Error::not_found(format!("concurrency group {}", group.id)))?;
        state.check_group(&group, Some(group.id))?;
        group.created_at = created_at;
        group.updated_at = state.tick();
        state.groups.insert(group.id, group.clone());
        Ok(group)
    }

    pub fn list_groups(&self) -> Vec<ConcurrencyGroup> {
        self.read().groups.values().cloned().collect()
    }

    // -------------------------------------------------------------------------
    // Dependencies
    // -------------------------------------------------------------------------

    pub fn create_dependency(&self, mut dep: Dependency) -> Result<Arc<Dependency>> {
        let mut state = self.write();
        state.check_dependency(&dep, None)?;
        dep.id = DependencyId::new(state.next_id());
        dep.created_at = state.tick();
        dep.updated_at = dep.created_at;
        let dep = Arc::new(dep);
        state.dependencies.insert(dep.id, dep.clone());
        Ok(dep)
    }

    /// Replace a dependency; every tool referencing it sees the new record.
    pub fn update_dependency(&self, mut dep: Dependency) -> Result<Arc<Dependency>> {
        let mut state = self.write();
        let created_at = state
            .dependencies
            .get(&dep.id)
            .map(|d| d.created_at)
            .ok_or_else(|| Error::not_found(format!("dependency {}", dep.id)))?;
        state.check_dependency(&dep, Some(dep.id))?;
        dep.created_at = created_at;
        dep.updated_at = state.tick();
        let dep = Arc::new(dep);
        state.dependencies.insert(dep.id, dep.clone());
        Ok(dep)
    }

    pub fn get_dependency(&self, id: DependencyId) -> Result<Arc<Dependency>> {
        self.read()
            .dependencies
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("dependency {}", id)))
    }

    pub fn list_dependencies(&self) -> Vec<Arc<Dependency>> {
        self.read().dependencies.values().cloned().collect()
    }

    // -------------------------------------------------------------------------
    // Tools
    // -------------------------------------------------------------------------

    pub fn create_tool(&self, mut tool: Tool) -> Result<Tool> {
        let mut state = self.write();
        let dependency_ids = state.check_tool(&tool, None)?;
        let id = ToolId::new(state.next_id());
        let now = state.tick();
        let meta = tool.meta_mut();
        meta.id = id;
        meta.created_at = now;
        meta.updated_at = now;
        if let Tool::CommandLine(cmd) = &mut tool {
            cmd.dependencies.clear();
        }
        let stored = StoredTool {
            tool,
            dependency_ids,
        };
        let resolved = state.resolve(&stored);
        state.tools.insert(id, stored);
        Ok(resolved)
    }

    /// Replace a tool definition. Status and error are kept; only the engine writes them.
    pub fn update_tool(&self, mut tool: Tool) -> Result<Tool> {
        let mut state = self.write();
        let id = tool.id();
        let previous = state
            .tools
            .get(&id)
            .map(|t| t.tool.clone())
            .ok_or_else(|| Error::not_found(format!("tool {}", id)))?;
        if previous.kind() != tool.kind() {
            return Err(Error::validation(format!(
                "tool '{}' cannot change type from {} to {}",
                previous.name(),
                previous.kind().as_str(),
                tool.kind().as_str()
            )));
        }
        let dependency_ids = state.check_tool(&tool, Some(id))?;
        let now = state.tick();
        let meta = tool.meta_mut();
        meta.created_at = previous.meta().created_at;
        meta.updated_at = now;
        tool.set_status(previous.status(), previous.error().to_string());
        if let Tool::CommandLine(cmd) = &mut tool {
            cmd.dependencies.clear();
        }
        let stored = StoredTool {
            tool,
            dependency_ids,
        };
        let resolved = state.resolve(&stored);
        state.tools.insert(id, stored);
        Ok(resolved)
    }

    /// Remove a tool and its calling logs.
    pub fn delete_tool(&self, id: ToolId) -> Result<()> {
        let mut state = self.write();
        state
            .tools
            .remove(&id)
            .ok_or_else(|| Error::not_found(format!("tool {}", id)))?;
        state.calls.retain(|_, log| log.callee_id != id);
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Calling logs
    // -------------------------------------------------------------------------

    /// Calling logs, oldest first, optionally only those of one callee.
    pub fn list_calls(&self, callee: Option<ToolId>) -> Vec<CallingLog> {
        self.read()
            .calls
            .values()
            .filter(|log| callee.is_none_or(|id| log.callee_id == id))
            .cloned()
            .collect()
    }

    // -------------------------------------------------------------------------
    // Snapshots
    // -------------------------------------------------------------------------

    /// Build a catalog from a snapshot, resolving name references.
    pub fn from_snapshot(snapshot: CatalogSnapshot) -> Result<Self> {
        let catalog = Self::new();
        let mut groups = BTreeMap::new();
        for group in snapshot.groups {
            let group = catalog.create_group(group)?;
            groups.insert(group.name.clone(), group.id);
        }
        let mut dependencies = BTreeMap::new();
        for dep in snapshot.dependencies {
            let dep = catalog.create_dependency(dep)?;
            dependencies.insert(dep.name.clone(), dep);
        }
        for spec in snapshot.tools {
            let mut tool = spec.tool;
            let group = spec
                .group
                .map(|name| {
                    groups.get(&name).copied().ok_or_else(|| {
                        Error::configuration(format!(
                            "tool '{}' references unknown group '{}'",
                            tool.name(),
                            name
                        ))
                    })
                })
                .transpose()?;
            let deps = spec
                .depends_on
                .iter()
                .map(|name| {
                    dependencies.get(name).cloned().ok_or_else(|| {
                        Error::configuration(format!(
                            "tool '{}' references unknown dependency '{}'",
                            tool.name(),
                            name
                        ))
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            match &mut tool {
                Tool::CommandLine(cmd) => {
                    cmd.concurrency_group_id = group;
                    cmd.dependencies = deps;
                }
                Tool::Service(svc) => {
                    if !deps.is_empty() {
                        return Err(Error::configuration(format!(
                            "service '{}' cannot declare dependencies",
                            svc.meta.name
                        )));
                    }
                    svc.concurrency_group_id = group;
                }
            }
            catalog.create_tool(tool)?;
        }
        tracing::info!(
            tools = catalog.read().tools.len(),
            groups = groups.len(),
            dependencies = dependencies.len(),
            "catalog loaded"
        );
        Ok(catalog)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::configuration(format!("cannot read catalog {}: {}", path.display(), e))
        })?;
        let snapshot: CatalogSnapshot = serde_json::from_str(&raw)?;
        Self::from_snapshot(snapshot)
    }
}

#[async_trait]
impl ToolRepository for MemoryCatalog {
    async fn get_tool(&self, id: ToolId) -> Result<Tool> {
        let state = self.read();
        state
            .tools
            .get(&id)
            .map(|stored| state.resolve(stored))
            .ok_or_else(|| Error::not_found(format!("tool {}", id)))
    }

    async fn get_tool_by_name(&self, name: &str) -> Result<Tool> {
        let state = self.read();
        state
            .tools
            .values()
            .find(|stored| stored.tool.name() == name)
            .map(|stored| state.resolve(stored))
            .ok_or_else(|| Error::not_found(format!("tool '{}'", name)))
    }

    async fn list_tools(&self) -> Result<Vec<Tool>> {
        let state = self.read();
        Ok(state.tools.values().map(|t| state.resolve(t)).collect())
    }

    async fn update_status(&self, id: ToolId, status: ToolStatus, error: &str) -> Result<()> {
        if status.is_healthy() && !error.is_empty() {
            return Err(Error::validation(format!(
                "status {:?} cannot carry an error",
                status
            )));
        }
        let mut state = self.write();
        let now = state.tick();
        let stored = state
            .tools
            .get_mut(&id)
            .ok_or_else(|| Error::not_found(format!("tool {}", id)))?;
        stored.tool.set_status(status, error.to_string());
        stored.tool.meta_mut().updated_at = now;
        Ok(())
    }

    async fn get_concurrency_group(&self, id: GroupId) -> Result<ConcurrencyGroup> {
        self.read()
            .groups
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("concurrency group {}", id)))
    }

    async fn update_group(&self, group: ConcurrencyGroup) -> Result<ConcurrencyGroup> {
        MemoryCatalog::update_group(self, group)
    }

    async fn update_dependency(&self, dep: Dependency) -> Result<Arc<Dependency>> {
        MemoryCatalog::update_dependency(self, dep)
    }

    async fn record_call(&self, mut log: CallingLog) -> Result<CallLogId> {
        let mut state = self.write();
        log.id = CallLogId::new(state.next_id());
        state.calls.insert(log.id, log.clone());
        Ok(log.id)
    }

    async fn prune_calls(&self, callee: ToolId, older_than: DateTime<Utc>) -> Result<usize> {
        let mut state = self.write();
        let before = state.calls.len();
        state
            .calls
            .retain(|_, log| log.callee_id != callee || log.created_at >= older_than);
        Ok(before - state.calls.len())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::model::{CommandLineTool, ServiceTool, ToolKind};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn cmd_tool(name: &str) -> CommandLineTool {
        CommandLineTool::new(name, vec!["echo".to_string(), "$message".to_string()])
    }

    fn call(callee: ToolId, created_at: DateTime<Utc>) -> CallingLog {
        CallingLog {
            id: CallLogId::default(),
            created_at,
            caller_id: None,
            caller_type: None,
            callee_id: callee,
            callee_type: ToolKind::CommandLine,
            input: "{}".to_string(),
            output: String::new(),
            error: String::new(),
            duration: Duration::from_millis(5),
        }
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let catalog = MemoryCatalog::new();
        let created = catalog.create_tool(Tool::CommandLine(cmd_tool("echo"))).unwrap();

        assert_ne!(created.id(), ToolId::default());
        assert_eq!(catalog.get_tool(created.id()).await.unwrap(), created);
        assert_eq!(catalog.get_tool_by_name("echo").await.unwrap().id(), created.id());
        assert!(matches!(
            catalog.get_tool(ToolId::new(999)).await,
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let catalog = MemoryCatalog::new();
        catalog.create_tool(Tool::CommandLine(cmd_tool("echo"))).unwrap();
        let err = catalog
            .create_tool(Tool::Service(ServiceTool::new("echo", "sleep 100")))
            .unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[test]
    fn test_dangling_group_rejected() {
        let catalog = MemoryCatalog::new();
        let mut tool = cmd_tool("echo");
        tool.concurrency_group_id = Some(GroupId::new(42));
        let err = catalog.create_tool(Tool::CommandLine(tool)).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let catalog = MemoryCatalog::new();
        let err = catalog
            .create_group(ConcurrencyGroup::new("gpu", 0))
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_dependency_set_rules() {
        let catalog = MemoryCatalog::new();
        let python = catalog
            .create_dependency(Dependency::new("python", "brew install python"))
            .unwrap();

        let mut tool = cmd_tool("script");
        tool.dependencies = vec![python.clone(), python.clone()];
        let err = catalog.create_tool(Tool::CommandLine(tool)).unwrap_err();
        assert!(err.to_string().contains("more than once"));

        let mut tool = cmd_tool("script");
        tool.dependencies = vec![Arc::new(Dependency::new("node", "brew install node"))];
        let err = catalog.create_tool(Tool::CommandLine(tool)).unwrap_err();
        assert!(err.to_string().contains("unknown dependency"));
    }

    #[tokio::test]
    async fn test_dependency_update_is_shared() {
        let catalog = MemoryCatalog::new();
        let python = catalog
            .create_dependency(Dependency::new("python", "brew install python"))
            .unwrap();
        for name in ["a", "b"] {
            let mut tool = cmd_tool(name);
            tool.dependencies = vec![python.clone()];
            catalog.create_tool(Tool::CommandLine(tool)).unwrap();
        }

        let mut changed = (*python).clone();
        changed.install_cmd = "apt-get install -y python3".to_string();
        catalog.update_dependency(changed).unwrap();

        for tool in catalog.list_tools().await.unwrap() {
            match tool {
                Tool::CommandLine(t) => {
                    assert_eq!(t.dependencies[0].install_cmd, "apt-get install -y python3")
                }
                Tool::Service(_) => panic!("unexpected service"),
            }
        }
    }

    #[tokio::test]
    async fn test_update_status_rules() {
        let catalog = MemoryCatalog::new();
        let tool = catalog.create_tool(Tool::CommandLine(cmd_tool("echo"))).unwrap();

        let err = catalog
            .update_status(tool.id(), ToolStatus::Ready, "boom")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        catalog
            .update_status(tool.id(), ToolStatus::Error, "testcase 1 failed")
            .await
            .unwrap();
        let stored = catalog.get_tool(tool.id()).await.unwrap();
        assert_eq!(stored.status(), ToolStatus::Error);
        assert_eq!(stored.error(), "testcase 1 failed");
        assert!(stored.meta().updated_at > tool.meta().updated_at);
    }

    #[tokio::test]
    async fn test_update_tool_keeps_status() {
        let catalog = MemoryCatalog::new();
        let tool = catalog.create_tool(Tool::CommandLine(cmd_tool("echo"))).unwrap();
        catalog
            .update_status(tool.id(), ToolStatus::Ready, "")
            .await
            .unwrap();

        let mut edited = tool.clone();
        edited.meta_mut().description = "prints things".to_string();
        let updated = catalog.update_tool(edited).unwrap();
        assert_eq!(updated.status(), ToolStatus::Ready);
        assert_eq!(updated.meta().created_at, tool.meta().created_at);

        let service = Tool::Service(ServiceTool {
            meta: tool.meta().clone(),
            ..ServiceTool::new("echo", "sleep 1")
        });
        assert!(catalog.update_tool(service).is_err());
    }

    #[test]
    fn test_timestamps_are_monotonic() {
        let catalog = MemoryCatalog::new();
        let stamps: Vec<_> = (0..50)
            .map(|i| {
                catalog
                    .create_group(ConcurrencyGroup::new(format!("g{}", i), 1))
                    .unwrap()
                    .created_at
            })
            .collect();
        assert!(stamps.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn test_calls_recorded_and_pruned() {
        let catalog = MemoryCatalog::new();
        let a = catalog.create_tool(Tool::CommandLine(cmd_tool("a"))).unwrap();
        let b = catalog.create_tool(Tool::CommandLine(cmd_tool("b"))).unwrap();
        let now = Utc::now();
        let old = now - chrono::Duration::days(10);

        catalog.record_call(call(a.id(), old)).await.unwrap();
        catalog.record_call(call(a.id(), now)).await.unwrap();
        catalog.record_call(call(b.id(), old)).await.unwrap();

        let cutoff = now - chrono::Duration::days(1);
        assert_eq!(catalog.prune_calls(a.id(), cutoff).await.unwrap(), 1);
        assert_eq!(catalog.list_calls(Some(a.id())).len(), 1);
        assert_eq!(catalog.list_calls(Some(b.id())).len(), 1);
        assert_eq!(catalog.list_calls(None).len(), 2);
    }

    #[tokio::test]
    async fn test_snapshot_resolves_names() {
        let json = serde_json::json!({
            "groups": [{"name": "gpu", "max_concurrency": 1}],
            "dependencies": [{
                "name": "python",
                "install_cmd": "true",
                "testcases": [{"cmd": ["python3", "--version"], "expect": "Python 3", "match_type": "contains"}]
            }],
            "tools": [
                {
                    "type": "command_line",
                    "name": "train",
                    "cmd": ["python3", "train.py", "$epochs"],
                    "timeout": "10m",
                    "group": "gpu",
                    "depends_on": ["python"]
                },
                {"type": "service", "name": "redis", "start_cmd": "redis-server", "group": "gpu"}
            ]
        });
        let snapshot: CatalogSnapshot = serde_json::from_value(json).unwrap();
        let catalog = MemoryCatalog::from_snapshot(snapshot).unwrap();
        let gpu = catalog.list_groups()[0].id;

        match catalog.get_tool_by_name("train").await.unwrap() {
            Tool::CommandLine(t) => {
                assert_eq!(t.concurrency_group_id, Some(gpu));
                assert_eq!(t.dependencies[0].name, "python");
                assert_eq!(t.timeout, Some(Duration::from_secs(600)));
            }
            Tool::Service(_) => panic!("expected command-line tool"),
        }
        let redis = catalog.get_tool_by_name("redis").await.unwrap();
        assert_eq!(redis.concurrency_group_id(), Some(gpu));
        assert_eq!(redis.status(), ToolStatus::Stopped);
    }

    #[test]
    fn test_snapshot_unknown_reference() {
        let json = serde_json::json!({
            "tools": [{"type": "command_line", "name": "x", "cmd": ["true"], "group": "missing"}]
        });
        let snapshot: CatalogSnapshot = serde_json::from_value(json).unwrap();
        let err = MemoryCatalog::from_snapshot(snapshot).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.json");
        std::fs::write(
            &path,
            r#"{"tools": [{"type": "command_line", "name": "hello", "cmd": ["echo", "hi"]}]}"#,
        )
        .unwrap();
        let catalog = MemoryCatalog::from_file(&path).unwrap();
        assert_eq!(catalog.read().tools.len(), 1);
        assert!(MemoryCatalog::from_file(dir.path().join("nope.json")).is_err());
    }
}
