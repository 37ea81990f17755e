//! Scope isolation between concurrently running phases.

use std::fmt;
use std::path::{Component, Path};

use serde::{Deserialize, Serialize};

use crate::phase::Phase;

/// Isolation layer of the execution environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLayer {
    Process,
    Workspace,
    Filesystem,
    Network,
}

impl IsolationLayer {
    pub const ALL: [IsolationLayer; 4] = [
        IsolationLayer::Process,
        IsolationLayer::Workspace,
        IsolationLayer::Filesystem,
        IsolationLayer::Network,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            IsolationLayer::Process => "process",
            IsolationLayer::Workspace => "workspace",
            IsolationLayer::Filesystem => "filesystem",
            IsolationLayer::Network => "network",
        }
    }
}

impl fmt::Display for IsolationLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Concurrency ceiling per isolation layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IsolationPolicy {
    pub process: usize,
    pub workspace: usize,
    pub filesystem: usize,
    pub network: usize,
}

impl Default for IsolationPolicy {
    fn default() -> Self {
        Self::uniform(4)
    }
}

impl IsolationPolicy {
    /// Same ceiling on every layer.
    pub fn uniform(ceiling: usize) -> Self {
        Self {
            process: ceiling,
            workspace: ceiling,
            filesystem: ceiling,
            network: ceiling,
        }
    }

    pub fn with_ceiling(mut self, layer: IsolationLayer, ceiling: usize) -> Self {
        match layer {
            IsolationLayer::Process => self.process = ceiling,
            IsolationLayer::Workspace => self.workspace = ceiling,
            IsolationLayer::Filesystem => self.filesystem = ceiling,
            IsolationLayer::Network => self.network = ceiling,
        }
        self
    }

    pub fn ceiling(&self, layer: IsolationLayer) -> usize {
        match layer {
            IsolationLayer::Process => self.process,
            IsolationLayer::Workspace => self.workspace,
            IsolationLayer::Filesystem => self.filesystem,
            IsolationLayer::Network => self.network,
        }
    }

    /// First layer whose ceiling is below `concurrency`.
    pub fn limiting_layer(&self, concurrency: usize) -> Option<IsolationLayer> {
        IsolationLayer::ALL
            .into_iter()
            .find(|layer| self.ceiling(*layer) < concurrency)
    }

    /// Whether every layer allows `concurrency` phases at once.
    pub fn permits(&self, concurrency: usize) -> bool {
        self.limiting_layer(concurrency).is_none()
    }
}

/// Decides whether two phases may run at the same time.
pub trait IsolationChecker: Send + Sync {
    fn is_isolated(&self, a: &Phase, b: &Phase, concurrency: usize) -> bool;
}

/// Checker based on declared scopes and the run's isolation policy.
#[derive(Debug, Clone, Default)]
pub struct ScopeIsolationChecker {
    policy: IsolationPolicy,
}

impl ScopeIsolationChecker {
    pub fn new(policy: IsolationPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &IsolationPolicy {
        &self.policy
    }
}

impl IsolationChecker for ScopeIsolationChecker {
    fn is_isolated(&self, a: &Phase, b: &Phase, concurrency: usize) -> bool {
        self.policy.permits(concurrency) && !scopes_overlap(&a.scope, &b.scope)
    }
}

fn components(prefix: &str) -> Vec<Component<'_>> {
    Path::new(prefix)
        .components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect()
}

/// Whether two path prefixes cover any common path.
///
/// Comparison is per path component: `src/a` and `src/ab` are disjoint.
/// An empty prefix covers the whole repository.
pub fn prefixes_overlap(a: &str, b: &str) -> bool {
    let a = components(a);
    let b = components(b);
    let shared = a.len().min(b.len());
    a[..shared] == b[..shared]
}

/// Whether two scopes overlap. An empty scope overlaps everything.
pub fn scopes_overlap(a: &[String], b: &[String]) -> bool {
    if a.is_empty() || b.is_empty() {
        return true;
    }
    a.iter()
        .any(|x| b.iter().any(|y| prefixes_overlap(x, y)))
}
