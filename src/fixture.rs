//! Typed, memoized dependency graph of fixtures.
//!
//! Every node has a unique name, a [`Scope`], the names of the nodes it
//! depends on and an async build function. The whole graph is validated when
//! [`FixtureGraphBuilder::build`] runs: duplicate names, unknown
//! dependencies, session nodes leaning on module nodes and cycles are all
//! rejected before a single build function executes. A topological order is
//! computed once and resolution walks it, so no recursion is involved.
//!
//! Values are cached per scope. Session values live as long as the graph;
//! module values are dropped by [`FixtureGraph::enter_module`].

use std::any::{Any, type_name};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use futures_util::FutureExt as _;
use futures_util::future::BoxFuture;
use tracing::{debug, info};

type BoxedValue = Arc<dyn Any + Send + Sync>;

type BuildFn<C> =
    Arc<dyn Fn(Resolved, Arc<C>) -> BoxFuture<'static, anyhow::Result<BoxedValue>> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    /// Built once and reused for the whole run.
    Session,
    /// Built once per scenario module.
    Module,
}

/// Name of a fixture together with the type of value it produces.
pub struct FixtureKey<T> {
    name: Arc<str>,
    _value: PhantomData<fn() -> T>,
}

impl<T> FixtureKey<T> {
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self {
            name: name.into(),
            _value: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<T> Clone for FixtureKey<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            _value: PhantomData,
        }
    }
}

impl<T> fmt::Debug for FixtureKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("FixtureKey").field(&self.name).finish()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FixtureError {
    #[error("fixture `{0}` is declared twice")]
    Duplicate(String),
    #[error("fixture `{node}` depends on undeclared fixture `{dependency}`")]
    UnknownDependency { node: String, dependency: String },
    #[error("session fixture `{node}` cannot depend on module fixture `{dependency}`")]
    ScopeMismatch { node: String, dependency: String },
    #[error("fixture dependency cycle: {}", .0.join(" -> "))]
    Cycle(Vec<String>),
    #[error("no fixture named `{0}`")]
    Unknown(String),
    #[error("fixture `{node}` does not hold a value of type {expected}")]
    TypeMismatch {
        node: String,
        expected: &'static str,
    },
    #[error("failed to build fixture `{node}`: {source:#}")]
    Build {
        node: String,
        source: anyhow::Error,
    },
}

/// The already-built direct dependencies handed to a build function.
pub struct Resolved {
    node: Arc<str>,
    values: HashMap<Arc<str>, BoxedValue>,
}

impl Resolved {
    /// Fetches a declared dependency.
    pub fn get<T: Clone + 'static>(&self, key: &FixtureKey<T>) -> anyhow::Result<T> {
        let value = self.values.get(key.name()).ok_or_else(|| {
            anyhow::anyhow!(
                "fixture `{}` did not declare a dependency on `{}`",
                self.node,
                key.name()
            )
        })?;

        value.downcast_ref::<T>().cloned().ok_or_else(|| {
            anyhow::anyhow!(
                "dependency `{}` of `{}` is not a {}",
                key.name(),
                self.node,
                type_name::<T>()
            )
        })
    }
}

struct Node<C> {
    name: Arc<str>,
    scope: Scope,
    dependencies: Vec<Arc<str>>,
    build: BuildFn<C>,
}

pub struct FixtureGraphBuilder<C> {
    nodes: Vec<Node<C>>,
}

impl<C> Default for FixtureGraphBuilder<C> {
    fn default() -> Self {
        Self { nodes: Vec::new() }
    }
}

impl<C: Send + Sync + 'static> FixtureGraphBuilder<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a node. Nothing is checked until [`build`](Self::build).
    pub fn register<T, F, Fut>(
        &mut self,
        key: &FixtureKey<T>,
        scope: Scope,
        dependencies: &[&str],
        build: F,
    ) -> &mut Self
    where
        T: Send + Sync + 'static,
        F: Fn(Resolved, Arc<C>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let build: BuildFn<C> = Arc::new(move |resolved, ctx| {
            let value = build(resolved, ctx);
            async move { value.await.map(|value| Arc::new(value) as BoxedValue) }.boxed()
        });

        self.nodes.push(Node {
            name: key.name.clone(),
            scope,
            dependencies: dependencies.iter().map(|name| Arc::from(*name)).collect(),
            build,
        });
        self
    }

    pub fn build(self) -> Result<FixtureGraph<C>, FixtureError> {
        let mut index = HashMap::with_capacity(self.nodes.len());
        for (position, node) in self.nodes.iter().enumerate() {
            if index.insert(node.name.clone(), position).is_some() {
                return Err(FixtureError::Duplicate(node.name.to_string()));
            }
        }

        for node in &self.nodes {
            for dependency in &node.dependencies {
                let Some(&position) = index.get(dependency) else {
                    return Err(FixtureError::UnknownDependency {
                        node: node.name.to_string(),
                        dependency: dependency.to_string(),
                    });
                };

                if node.scope == Scope::Session && self.nodes[position].scope == Scope::Module {
                    return Err(FixtureError::ScopeMismatch {
                        node: node.name.to_string(),
                        dependency: dependency.to_string(),
                    });
                }
            }
        }

        let order = topological_order(&self.nodes, &index)?;
        let rank = order
            .iter()
            .enumerate()
            .map(|(rank, &position)| (self.nodes[position].name.clone(), rank))
            .collect();

        let nodes = self
            .nodes
            .into_iter()
            .map(|node| (node.name.clone(), node))
            .collect();

        Ok(FixtureGraph {
            nodes,
            rank,
            session: HashMap::new(),
            module: HashMap::new(),
            module_name: None,
        })
    }
}

/// Depth-first post-order over the declaration list. Reports the first cycle
/// found as the full path, closing back on its first node.
fn topological_order<C>(
    nodes: &[Node<C>],
    index: &HashMap<Arc<str>, usize>,
) -> Result<Vec<usize>, FixtureError> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unvisited,
        InProgress,
        Done,
    }

    let mut marks = vec![Mark::Unvisited; nodes.len()];
    let mut order = Vec::with_capacity(nodes.len());

    for root in 0..nodes.len() {
        if marks[root] != Mark::Unvisited {
            continue;
        }

        // (node, next dependency to visit)
        let mut stack = vec![(root, 0_usize)];
        marks[root] = Mark::InProgress;

        while let Some((current, next)) = stack.last_mut() {
            let current = *current;
            let Some(dependency) = nodes[current].dependencies.get(*next) else {
                marks[current] = Mark::Done;
                order.push(current);
                stack.pop();
                continue;
            };
            *next += 1;

            let target = index[dependency];
            match marks[target] {
                Mark::Done => {}
                Mark::Unvisited => {
                    marks[target] = Mark::InProgress;
                    stack.push((target, 0));
                }
                Mark::InProgress => {
                    let start = stack
                        .iter()
                        .position(|(position, _)| *position == target)
                        .unwrap_or(0);
                    let mut cycle: Vec<String> = stack[start..]
                        .iter()
                        .map(|(position, _)| nodes[*position].name.to_string())
                        .collect();
                    cycle.push(nodes[target].name.to_string());
                    return Err(FixtureError::Cycle(cycle));
                }
            }
        }
    }

    Ok(order)
}

/// A validated fixture graph with its per-scope caches.
pub struct FixtureGraph<C> {
    nodes: HashMap<Arc<str>, Node<C>>,
    /// Position of every node in the topological order.
    rank: HashMap<Arc<str>, usize>,
    session: HashMap<Arc<str>, BoxedValue>,
    module: HashMap<Arc<str>, BoxedValue>,
    module_name: Option<String>,
}

impl<C: Send + Sync + 'static> FixtureGraph<C> {
    /// Starts a new module: every module-scoped value is dropped and will be
    /// rebuilt on next use. Session values are kept.
    pub fn enter_module(&mut self, name: &str) {
        info!(
            module = name,
            dropped = self.module.len(),
            "Entering fixture module"
        );
        self.module.clear();
        self.module_name = Some(name.to_owned());
    }

    pub fn current_module(&self) -> Option<&str> {
        self.module_name.as_deref()
    }

    pub fn is_built(&self, name: &str) -> bool {
        self.session.contains_key(name) || self.module.contains_key(name)
    }

    /// Resolves `key`, building it and any missing transitive dependency in
    /// topological order. Cached values are returned without rebuilding.
    pub async fn resolve<T>(&mut self, key: &FixtureKey<T>, ctx: &Arc<C>) -> Result<T, FixtureError>
    where
        T: Clone + Send + Sync + 'static,
    {
        for name in self.plan(key.name())? {
            if self.is_built(&name) {
                continue;
            }
            self.build_node(&name, ctx).await?;
        }

        self.cached(key)
    }

    /// Builds every session node that is not cached yet, in topological
    /// order. Returns how many were built.
    ///
    /// Session values outlive module snapshots, so whatever chain state they
    /// set up has to be created outside of them.
    pub async fn resolve_session(&mut self, ctx: &Arc<C>) -> Result<usize, FixtureError> {
        let mut pending: Vec<Arc<str>> = self
            .nodes
            .values()
            .filter(|node| node.scope == Scope::Session && !self.is_built(&node.name))
            .map(|node| node.name.clone())
            .collect();
        pending.sort_by_key(|name| self.rank[name]);

        for name in &pending {
            self.build_node(name, ctx).await?;
        }

        if !pending.is_empty() {
            info!(built = pending.len(), "Session fixtures ready");
        }
        Ok(pending.len())
    }

    /// The transitive closure of `name`, ordered so dependencies come first.
    fn plan(&self, name: &str) -> Result<Vec<Arc<str>>, FixtureError> {
        let root = self
            .nodes
            .get(name)
            .ok_or_else(|| FixtureError::Unknown(name.to_owned()))?;

        let mut seen: HashSet<Arc<str>> = HashSet::new();
        let mut pending = vec![root.name.clone()];
        while let Some(current) = pending.pop() {
            if !seen.insert(current.clone()) {
                continue;
            }
            pending.extend(self.nodes[&current].dependencies.iter().cloned());
        }

        let mut plan: Vec<Arc<str>> = seen.into_iter().collect();
        plan.sort_by_key(|name| self.rank[name]);
        Ok(plan)
    }

    async fn build_node(&mut self, name: &Arc<str>, ctx: &Arc<C>) -> Result<(), FixtureError> {
        let node = &self.nodes[name];
        let values = node
            .dependencies
            .iter()
            .filter_map(|dependency| {
                self.session
                    .get(dependency)
                    .or_else(|| self.module.get(dependency))
                    .map(|value| (dependency.clone(), value.clone()))
            })
            .collect();

        let resolved = Resolved {
            node: name.clone(),
            values,
        };

        debug!(fixture = %name, scope = ?node.scope, "Building fixture");
        let build = node.build.clone();
        let scope = node.scope;

        let value = build(resolved, ctx.clone())
            .await
            .map_err(|source| FixtureError::Build {
                node: name.to_string(),
                source,
            })?;

        match scope {
            Scope::Session => self.session.insert(name.clone(), value),
            Scope::Module => self.module.insert(name.clone(), value),
        };
        Ok(())
    }

    fn cached<T: Clone + 'static>(&self, key: &FixtureKey<T>) -> Result<T, FixtureError> {
        let value = self
            .session
            .get(key.name())
            .or_else(|| self.module.get(key.name()))
            .ok_or_else(|| FixtureError::Unknown(key.name().to_owned()))?;

        value
            .downcast_ref::<T>()
            .cloned()
            .ok_or_else(|| FixtureError::TypeMismatch {
                node: key.name().to_owned(),
                expected: type_name::<T>(),
            })
    }
}
