//! # Routing Snapshot
//!
//! An immutable routing table published through an atomic pointer, and the batch
//! protocol that replaces it.
//!
//! ## Invariants
//! - Readers never lock and always see one whole generation.
//! - Commits are linearized by one writer lock.
//! - An invoker is torn down at most once, and only after the generation that no longer
//!   contains it is live.
//! - Per application, entries are ordered by load (lower first), then by NodeId.
//! - Re-adding a node keeps its invoker unless `Cleanup::is_live` rejects it, in which
//!   case the supplier builds a replacement and the old invoker becomes an orphan.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwap;
use futures::future::BoxFuture;
use tokio::sync::Mutex;
use tracing::debug;
use tracing::warn;

use elwire::ApplicationId;
use elwire::InstanceId;
use elwire::NodeId;

use crate::error::ClusterError;
use crate::error::Result;

/// One routable node.
pub struct Entry<I> {
    pub node: NodeId,
    pub load: f64,
    pub invoker: Arc<I>,
}

impl<I> Clone for Entry<I> {
    fn clone(&self) -> Self {
        Self { node: self.node, load: self.load, invoker: self.invoker.clone() }
    }
}

impl<I> fmt::Debug for Entry<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry").field("node", &self.node).field("load", &self.load).finish()
    }
}

fn priority<I>(a: &Entry<I>, b: &Entry<I>) -> Ordering {
    a.load.total_cmp(&b.load).then_with(|| a.node.cmp(&b.node))
}

/// One committed generation of the routing table.
pub struct Table<I> {
    generation: u64,
    by_node: HashMap<NodeId, Entry<I>>,
    by_application: HashMap<ApplicationId, Vec<Entry<I>>>,
}

impl<I> Table<I> {
    fn empty() -> Self {
        Self { generation: 0, by_node: HashMap::new(), by_application: HashMap::new() }
    }

    fn build(generation: u64, by_node: HashMap<NodeId, Entry<I>>) -> Self {
        let mut by_application: HashMap<ApplicationId, Vec<Entry<I>>> = HashMap::new();
        for entry in by_node.values() {
            by_application.entry(entry.node.application_id()).or_default().push(entry.clone());
        }
        for entries in by_application.values_mut() {
            entries.sort_by(priority);
        }
        Self { generation, by_node, by_application }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.by_node.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_node.is_empty()
    }

    pub fn entry(&self, node: &NodeId) -> Option<&Entry<I>> {
        self.by_node.get(node)
    }

    /// Every entry, ordered by application then priority.
    pub fn entries(&self) -> Vec<Entry<I>> {
        let mut apps: Vec<&ApplicationId> = self.by_application.keys().collect();
        apps.sort();
        apps.into_iter()
            .flat_map(|app| self.by_application[app].iter().cloned())
            .collect()
    }
}

/// Produces the invoker for a newly added node. Only called when the node is not
/// already in the table.
pub type Supplier<I> = Box<dyn FnOnce() -> BoxFuture<'static, Result<Arc<I>>> + Send>;

/// Tears down invokers that left the table.
#[async_trait::async_trait]
pub trait Cleanup<I>: Send + Sync
where
    I: Send + Sync + 'static,
{
    async fn teardown(&self, node: NodeId, invoker: Arc<I>) -> Result<()>;

    /// Whether an invoker already in the table can keep serving its node.
    fn is_live(&self, _invoker: &I) -> bool {
        true
    }

    /// Receives teardown failures. They never reach the committer.
    fn report(&self, node: NodeId, error: ClusterError) {
        warn!(node = %node, error = %error, "Invoker teardown failed.");
    }
}

/// Discards orphans without further action.
pub struct NoCleanup;

#[async_trait::async_trait]
impl<I> Cleanup<I> for NoCleanup
where
    I: Send + Sync + 'static,
{
    async fn teardown(&self, _node: NodeId, _invoker: Arc<I>) -> Result<()> {
        Ok(())
    }
}

enum Op<I> {
    Add { node: NodeId, load: f64, supplier: Supplier<I> },
    RemoveNode(NodeId),
    RemoveInstance(InstanceId),
    RetainInstance(InstanceId),
}

/// What one commit changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitSummary {
    pub generation: u64,
    pub added: usize,
    pub removed: usize,
    pub skipped: usize,
}

/// A staged set of changes. Nothing is visible until `commit`.
#[must_use = "a batch does nothing until committed"]
pub struct Batch<'a, I> {
    snapshot: &'a Snapshot<I>,
    ops: Vec<Op<I>>,
    prune: bool,
}

impl<'a, I> Batch<'a, I>
where
    I: Send + Sync + 'static,
{
    /// Adds `node` with `load`. An existing node keeps a live invoker and only moves.
    pub fn add<F>(&mut self, node: NodeId, load: f64, supplier: F) -> &mut Self
    where
        F: FnOnce() -> BoxFuture<'static, Result<Arc<I>>> + Send + 'static,
    {
        self.ops.push(Op::Add { node, load, supplier: Box::new(supplier) });
        self
    }

    pub fn remove_node(&mut self, node: NodeId) -> &mut Self {
        self.ops.push(Op::RemoveNode(node));
        self
    }

    pub fn remove_instance(&mut self, instance: InstanceId) -> &mut Self {
        self.ops.push(Op::RemoveInstance(instance));
        self
    }

    /// Marks every current node of `instance` as kept for `prune`.
    pub fn retain_instance(&mut self, instance: InstanceId) -> &mut Self {
        self.ops.push(Op::RetainInstance(instance));
        self
    }

    /// Removes every node that this batch did not add or retain.
    pub fn prune(&mut self) -> &mut Self {
        self.prune = true;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty() && !self.prune
    }

    /// Applies the batch, publishes the new generation, then tears down orphans.
    pub async fn commit(self, cleanup: &dyn Cleanup<I>) -> CommitSummary {
        let snapshot = self.snapshot;
        let guard = snapshot.writer.lock().await;

        let current = snapshot.live.load_full();
        let mut by_node = current.by_node.clone();
        let mut touched: HashSet<NodeId> = HashSet::new();
        let mut summary = CommitSummary::default();

        for op in self.ops {
            match op {
                Op::Add { node, load, supplier } => {
                    let live = by_node.get(&node).map(|entry| cleanup.is_live(&entry.invoker));
                    if live == Some(true) {
                        if let Some(entry) = by_node.get_mut(&node) {
                            entry.load = load;
                        }
                    } else {
                        if live == Some(false) {
                            debug!(node = %node, "Replacing dead invoker.");
                        }
                        match supplier().await {
                            Ok(invoker) => {
                                by_node.insert(node, Entry { node, load, invoker });
                                summary.added += 1;
                            }
                            Err(e) => {
                                warn!(node = %node, error = %e, "Could not create invoker. Skipping node.");
                                summary.skipped += 1;
                                continue;
                            }
                        }
                    }
                    touched.insert(node);
                }
                Op::RemoveNode(node) => {
                    by_node.remove(&node);
                    touched.remove(&node);
                }
                Op::RemoveInstance(instance) => {
                    by_node.retain(|node, _| node.instance_id() != instance);
                    touched.retain(|node| node.instance_id() != instance);
                }
                Op::RetainInstance(instance) => {
                    touched.extend(by_node.keys().filter(|node| node.instance_id() == instance).copied());
                }
            }
        }

        if self.prune {
            by_node.retain(|node, _| touched.contains(node));
        }

        let orphans: Vec<Entry<I>> = current
            .by_node
            .values()
            .filter(|old| match by_node.get(&old.node) {
                Some(new) => !Arc::ptr_eq(&new.invoker, &old.invoker),
                None => true,
            })
            .cloned()
            .collect();
        summary.removed = orphans.len();

        let next = Table::build(current.generation + 1, by_node);
        summary.generation = next.generation;
        snapshot.live.store(Arc::new(next));
        drop(current);
        drop(guard);

        debug!(
            generation = summary.generation,
            added = summary.added,
            removed = summary.removed,
            skipped = summary.skipped,
            "Committed routing table."
        );

        for orphan in orphans {
            if let Err(e) = cleanup.teardown(orphan.node, orphan.invoker).await {
                cleanup.report(orphan.node, e);
            }
        }
        summary
    }
}

/// The live routing table.
pub struct Snapshot<I> {
    live: ArcSwap<Table<I>>,
    writer: Mutex<()>,
}

impl<I> Default for Snapshot<I> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I> Snapshot<I> {
    pub fn new() -> Self {
        Self {
            live: ArcSwap::from_pointee(Table::empty()),
            writer: Mutex::new(()),
        }
    }

    /// The current generation, whole.
    pub fn table(&self) -> Arc<Table<I>> {
        self.live.load_full()
    }

    pub fn generation(&self) -> u64 {
        self.live.load().generation
    }

    pub fn len(&self) -> usize {
        self.live.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.load().is_empty()
    }

    pub fn remote_invoker(&self, node: &NodeId) -> Result<Arc<I>> {
        self.live
            .load()
            .by_node
            .get(node)
            .map(|entry| entry.invoker.clone())
            .ok_or_else(|| ClusterError::not_found(node))
    }

    /// The lowest-load invoker for `application`; ties go to the lower NodeId.
    pub fn best_invoker_for_application(&self, application: ApplicationId) -> Result<Arc<I>> {
        self.live
            .load()
            .by_application
            .get(&application)
            .and_then(|entries| entries.first())
            .map(|entry| entry.invoker.clone())
            .ok_or_else(|| ClusterError::not_found(application))
    }

    /// Every invoker for `application`, best first. Empty when unknown.
    pub fn all_invokers_for_application(&self, application: ApplicationId) -> Vec<Arc<I>> {
        self.live
            .load()
            .by_application
            .get(&application)
            .map(|entries| entries.iter().map(|e| e.invoker.clone()).collect())
            .unwrap_or_default()
    }

    pub fn all_invokers(&self) -> Vec<Arc<I>> {
        self.live.load().entries().into_iter().map(|e| e.invoker).collect()
    }
}

impl<I> Snapshot<I>
where
    I: Send + Sync + 'static,
{
    pub fn begin(&self) -> Batch<'_, I> {
        Batch { snapshot: self, ops: Vec::new(), prune: false }
    }

    /// Removes every entry.
    pub async fn clear(&self, cleanup: &dyn Cleanup<I>) -> CommitSummary {
        let mut batch = self.begin();
        batch.prune();
        batch.commit(cleanup).await
    }
}
