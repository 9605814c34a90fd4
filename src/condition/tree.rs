//! Condition trees.
//!
//! A tree is an arena of leaf / AND / OR nodes. Children are owned top-down by
//! index; the upward `parent` index is a plain back-link used only to propagate
//! state changes. Only the leaves touch metric nodes, through [`ThresholdHost`].
//!
//! Activation is minimal: an AND node keeps only its cheaper child active until
//! that child holds, and an OR node parks the sibling of whichever child holds.
//! Propagation is edge-triggered: a node notifies its parent only when its own
//! state flips.

use tracing::{debug, warn};

use crate::error::{MetronResult, ValidationError};
use crate::metric::MetricId;
use crate::monitor::{LeafSignal, MonitorId, WatchKey};
use crate::time::Millis;
use crate::value::Threshold;

use super::expr::Expression;

/// Index of a node inside its tree.
pub type NodeIdx = usize;

/// Where leaves register and unregister their threshold watches.
pub trait ThresholdHost: Send + Sync {
    /// Adds a watch on `metric` for the leaf identified by `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the metric cannot be monitored.
    fn insert_threshold(
        &self,
        metric: &MetricId,
        key: WatchKey,
        threshold: Threshold,
        period: Millis,
        is_max: bool,
    ) -> MetronResult<()>;

    /// Drops the leaf's watch; unknown keys are ignored.
    fn remove_threshold(&self, metric: &MetricId, key: &WatchKey, is_max: bool);
}

/// A threshold leaf as built from an expression.
#[derive(Debug, Clone, PartialEq)]
pub struct LeafSpec {
    pub metric: MetricId,
    pub threshold: Threshold,
    pub period: Millis,
    pub is_max: bool,
    /// Anti-condition: holds while the threshold is *not* exceeded.
    pub negated: bool,
}

#[derive(Debug, Clone)]
enum NodeKind {
    Leaf { spec: LeafSpec, epoch: u64 },
    /// `first` is the cheaper child and is evaluated alone until it holds.
    And { first: NodeIdx, second: NodeIdx },
    Or { left: NodeIdx, right: NodeIdx },
}

#[derive(Debug, Clone)]
struct Node {
    kind: NodeKind,
    parent: Option<NodeIdx>,
    active: bool,
    state: bool,
    cost: u64,
}

/// Read-only view of one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeStatus {
    pub active: bool,
    pub state: bool,
    pub cost: u64,
}

/// Arena-backed boolean expression tree for one condition monitor.
#[derive(Debug)]
pub struct ConditionTree {
    id: MonitorId,
    nodes: Vec<Node>,
    root: Option<NodeIdx>,
    transitions: Vec<bool>,
}

impl ConditionTree {
    /// Builds a tree, pricing each leaf with `cost_of`.
    ///
    /// Costs are fixed here: a leaf costs what its metric costs, an AND costs its
    /// cheaper child, an OR the sum of both.
    ///
    /// # Errors
    ///
    /// Returns the expression's validation error, or whatever `cost_of` reports
    /// for an unusable metric.
    pub fn build<F>(id: MonitorId, expr: &Expression, default_period: Millis, cost_of: F) -> Result<Self, ValidationError>
    where
        F: Fn(&MetricId) -> Result<u32, ValidationError>,
    {
        expr.validate()?;
        let mut tree = Self {
            id,
            nodes: Vec::with_capacity(expr.leaf_count() * 2),
            root: None,
            transitions: Vec::new(),
        };
        let root = tree.build_node(expr, default_period.max(1), &cost_of)?;
        tree.root = Some(root);
        Ok(tree)
    }

    fn build_node<F>(&mut self, expr: &Expression, default_period: Millis, cost_of: &F) -> Result<NodeIdx, ValidationError>
    where
        F: Fn(&MetricId) -> Result<u32, ValidationError>,
    {
        let (kind, cost, children) = match expr {
            Expression::Threshold {
                metric,
                threshold,
                is_max,
                period_ms,
                negated,
            } => {
                let cost = u64::from(cost_of(metric)?);
                let spec = LeafSpec {
                    metric: metric.clone(),
                    threshold: *threshold,
                    period: period_ms.unwrap_or(default_period),
                    is_max: *is_max,
                    negated: *negated,
                };
                (NodeKind::Leaf { spec, epoch: 0 }, cost, None)
            }
            Expression::And { left, right } => {
                let l = self.build_node(left, default_period, cost_of)?;
                let r = self.build_node(right, default_period, cost_of)?;
                let (first, second) = if self.nodes[r].cost < self.nodes[l].cost {
                    (r, l)
                } else {
                    (l, r)
                };
                let cost = self.nodes[first].cost;
                (NodeKind::And { first, second }, cost, Some((first, second)))
            }
            Expression::Or { left, right } => {
                let l = self.build_node(left, default_period, cost_of)?;
                let r = self.build_node(right, default_period, cost_of)?;
                let cost = self.nodes[l].cost.saturating_add(self.nodes[r].cost);
                (NodeKind::Or { left: l, right: r }, cost, Some((l, r)))
            }
        };

        let idx = self.nodes.len();
        self.nodes.push(Node {
            kind,
            parent: None,
            active: false,
            state: false,
            cost,
        });
        if let Some((a, b)) = children {
            self.nodes[a].parent = Some(idx);
            self.nodes[b].parent = Some(idx);
        }
        Ok(idx)
    }

    #[must_use]
    pub const fn id(&self) -> MonitorId {
        self.id
    }

    /// Root index; `None` once the tree is cleared.
    #[must_use]
    pub const fn root(&self) -> Option<NodeIdx> {
        self.root
    }

    /// Whether the whole condition currently holds.
    #[must_use]
    pub fn is_triggered(&self) -> bool {
        self.root.is_some_and(|r| self.nodes[r].state)
    }

    #[must_use]
    pub fn status(&self, idx: NodeIdx) -> Option<NodeStatus> {
        self.nodes.get(idx).map(|n| NodeStatus {
            active: n.active,
            state: n.state,
            cost: n.cost,
        })
    }

    /// Children of an interior node, evaluation-first child first for AND.
    #[must_use]
    pub fn children(&self, idx: NodeIdx) -> Option<(NodeIdx, NodeIdx)> {
        match self.nodes.get(idx)?.kind {
            NodeKind::And { first, second } => Some((first, second)),
            NodeKind::Or { left, right } => Some((left, right)),
            NodeKind::Leaf { .. } => None,
        }
    }

    #[must_use]
    pub fn parent(&self, idx: NodeIdx) -> Option<NodeIdx> {
        self.nodes.get(idx)?.parent
    }

    #[must_use]
    pub fn leaf(&self, idx: NodeIdx) -> Option<&LeafSpec> {
        match &self.nodes.get(idx)?.kind {
            NodeKind::Leaf { spec, .. } => Some(spec),
            _ => None,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Root state changes since the last call, oldest first.
    pub fn take_transitions(&mut self) -> Vec<bool> {
        std::mem::take(&mut self.transitions)
    }

    /// Activates the tree from the root.
    ///
    /// # Errors
    ///
    /// Propagates a host failure while registering a leaf.
    pub fn activate(&mut self, host: &dyn ThresholdHost) -> MetronResult<()> {
        match self.root {
            Some(root) => self.activate_node(root, host),
            None => Ok(()),
        }
    }

    /// Deactivates every node and drops every watch.
    pub fn deactivate(&mut self, host: &dyn ThresholdHost) {
        if let Some(root) = self.root {
            self.deactivate_node(root, host);
        }
    }

    /// Deactivates and releases all nodes. The tree is inert afterwards.
    pub fn clear(&mut self, host: &dyn ThresholdHost) {
        self.deactivate(host);
        self.nodes.clear();
        self.root = None;
        self.transitions.clear();
    }

    /// Applies an exceeded/cleared edge reported for one of this tree's leaves.
    ///
    /// Signals for another tree, an inactive leaf or an older activation are
    /// ignored.
    ///
    /// # Errors
    ///
    /// Propagates a host failure while activating nodes in response.
    pub fn on_signal(&mut self, signal: LeafSignal, host: &dyn ThresholdHost) -> MetronResult<()> {
        let idx = signal.key.node;
        if signal.key.tree != self.id {
            return Ok(());
        }
        let Some(node) = self.nodes.get_mut(idx) else {
            return Ok(());
        };
        let NodeKind::Leaf { spec, epoch } = &node.kind else {
            return Ok(());
        };
        if !node.active || *epoch != signal.key.epoch {
            debug!(tree = %self.id, leaf = idx, "stale leaf signal ignored");
            return Ok(());
        }

        let holds = signal.exceeded != spec.negated;
        if holds == node.state {
            return Ok(());
        }
        node.state = holds;
        self.notify_parent(idx, holds, host)
    }

    fn activate_node(&mut self, idx: NodeIdx, host: &dyn ThresholdHost) -> MetronResult<()> {
        if self.nodes[idx].active {
            return Ok(());
        }
        let id = self.id;
        let node = &mut self.nodes[idx];
        node.active = true;
        node.state = false;

        match &mut node.kind {
            NodeKind::Leaf { spec, epoch } => {
                *epoch += 1;
                let key = WatchKey {
                    tree: id,
                    node: idx,
                    epoch: *epoch,
                };
                let spec = spec.clone();
                if let Err(e) = host.insert_threshold(&spec.metric, key, spec.threshold, spec.period, spec.is_max) {
                    self.nodes[idx].active = false;
                    return Err(e);
                }
                Ok(())
            }
            NodeKind::And { first, .. } => {
                let first = *first;
                self.activate_node(first, host)
            }
            NodeKind::Or { left, right } => {
                let (left, right) = (*left, *right);
                self.activate_node(left, host)?;
                self.activate_node(right, host)
            }
        }
    }

    fn deactivate_node(&mut self, idx: NodeIdx, host: &dyn ThresholdHost) {
        let node = &mut self.nodes[idx];
        let was_active = node.active;
        node.active = false;
        node.state = false;

        match &node.kind {
            NodeKind::Leaf { spec, epoch } => {
                if was_active {
                    let key = WatchKey {
                        tree: self.id,
                        node: idx,
                        epoch: *epoch,
                    };
                    host.remove_threshold(&spec.metric, &key, spec.is_max);
                }
            }
            NodeKind::And { first: a, second: b } | NodeKind::Or { left: a, right: b } => {
                let (a, b) = (*a, *b);
                self.deactivate_node(a, host);
                self.deactivate_node(b, host);
            }
        }
    }

    fn notify_parent(&mut self, child: NodeIdx, holds: bool, host: &dyn ThresholdHost) -> MetronResult<()> {
        match self.nodes[child].parent {
            None => {
                debug!(tree = %self.id, triggered = holds, "condition root changed");
                self.transitions.push(holds);
                Ok(())
            }
            Some(parent) if holds => self.child_triggered(parent, child, host),
            Some(parent) => self.child_untriggered(parent, child, host),
        }
    }

    fn child_triggered(&mut self, idx: NodeIdx, child: NodeIdx, host: &dyn ThresholdHost) -> MetronResult<()> {
        let node = &self.nodes[idx];
        if !node.active {
            return Ok(());
        }
        match node.kind {
            NodeKind::And { first, second } => {
                if child == first {
                    self.activate_node(second, host)?;
                    // The costlier side may already hold from an earlier activation.
                    if self.nodes[second].state && !self.nodes[idx].state {
                        self.nodes[idx].state = true;
                        return self.notify_parent(idx, true, host);
                    }
                    Ok(())
                } else if self.nodes[first].state && !self.nodes[idx].state {
                    self.nodes[idx].state = true;
                    self.notify_parent(idx, true, host)
                } else {
                    Ok(())
                }
            }
            NodeKind::Or { left, right } => {
                if node.state {
                    return Ok(());
                }
                let other = if child == left { right } else { left };
                self.nodes[idx].state = true;
                self.deactivate_node(other, host);
                self.notify_parent(idx, true, host)
            }
            NodeKind::Leaf { .. } => {
                warn!(tree = %self.id, node = idx, "leaf cannot have children");
                Ok(())
            }
        }
    }

    fn child_untriggered(&mut self, idx: NodeIdx, child: NodeIdx, host: &dyn ThresholdHost) -> MetronResult<()> {
        let node = &self.nodes[idx];
        if !node.active {
            return Ok(());
        }
        match node.kind {
            NodeKind::And { first, second } => {
                if child == first {
                    self.deactivate_node(second, host);
                }
                if self.nodes[idx].state {
                    self.nodes[idx].state = false;
                    return self.notify_parent(idx, false, host);
                }
                Ok(())
            }
            NodeKind::Or { left, right } => {
                if !node.state {
                    return Ok(());
                }
                let other = if child == left { right } else { left };
                self.nodes[idx].state = false;
                let activated = self.activate_node(other, host);
                self.notify_parent(idx, false, host)?;
                activated
            }
            NodeKind::Leaf { .. } => {
                warn!(tree = %self.id, node = idx, "leaf cannot have children");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    use super::*;
    use crate::error::MetronError;

    /// Records live watches per metric.
    #[derive(Default)]
    pub(crate) struct RecordingHost {
        watches: Mutex<HashMap<(MetricId, NodeIdx), WatchKey>>,
        refuse: AtomicBool,
    }

    impl RecordingHost {
        fn is_watching(&self, metric: &str, node: NodeIdx) -> bool {
            self.watches.lock().unwrap().contains_key(&(MetricId::new(metric), node))
        }

        fn key(&self, metric: &str, node: NodeIdx) -> WatchKey {
            self.watches.lock().unwrap()[&(MetricId::new(metric), node)]
        }

        fn count(&self) -> usize {
            self.watches.lock().unwrap().len()
        }
    }

    impl ThresholdHost for RecordingHost {
        fn insert_threshold(
            &self,
            metric: &MetricId,
            key: WatchKey,
            _threshold: Threshold,
            _period: Millis,
            _is_max: bool,
        ) -> MetronResult<()> {
            if self.refuse.load(Ordering::SeqCst) {
                return Err(MetronError::internal(format!("watch on {metric} refused")));
            }
            self.watches.lock().unwrap().insert((metric.clone(), key.node), key);
            Ok(())
        }

        fn remove_threshold(&self, metric: &MetricId, key: &WatchKey, _is_max: bool) {
            self.watches.lock().unwrap().remove(&(metric.clone(), key.node));
        }
    }

    fn costs(metric: &MetricId) -> Result<u32, ValidationError> {
        match metric.as_str() {
            "cheap" => Ok(10),
            "pricey" => Ok(50),
            "a" | "b" => Ok(20),
            _ => Err(ValidationError::UnknownMetric { metric: metric.clone() }),
        }
    }

    fn leaf(metric: &str) -> Expression {
        Expression::above(metric, Threshold::Int { value: 0 })
    }

    fn build(expr: &Expression) -> ConditionTree {
        ConditionTree::build(MonitorId::new(), expr, 1000, costs).unwrap()
    }

    fn signal(tree: &mut ConditionTree, host: &RecordingHost, metric: &str, node: NodeIdx, exceeded: bool) {
        let key = host.key(metric, node);
        tree.on_signal(LeafSignal { key, exceeded }, host).unwrap();
    }

    fn index_of(tree: &ConditionTree, metric: &str) -> NodeIdx {
        (0..tree.len())
            .find(|&i| tree.leaf(i).is_some_and(|l| l.metric.as_str() == metric))
            .unwrap()
    }

    #[test]
    fn and_stores_cheaper_child_first_and_costs_the_minimum() {
        let tree = build(&leaf("pricey").and(leaf("cheap")));
        let root = tree.root().unwrap();
        let (first, second) = tree.children(root).unwrap();
        assert_eq!(tree.leaf(first).unwrap().metric.as_str(), "cheap");
        assert_eq!(tree.leaf(second).unwrap().metric.as_str(), "pricey");
        assert_eq!(tree.status(root).unwrap().cost, 10);
        assert_eq!(tree.parent(first), Some(root));
        assert_eq!(tree.parent(root), None);
    }

    #[test]
    fn or_costs_the_sum() {
        let tree = build(&leaf("cheap").or(leaf("pricey")));
        assert_eq!(tree.status(tree.root().unwrap()).unwrap().cost, 60);
    }

    #[test]
    fn unknown_metric_fails_build() {
        let err = ConditionTree::build(MonitorId::new(), &leaf("gyro"), 1000, costs).unwrap_err();
        assert!(matches!(err, ValidationError::UnknownMetric { .. }));
    }

    #[test]
    fn and_activates_costlier_child_only_after_cheaper_triggers() {
        let host = RecordingHost::default();
        let mut tree = build(&leaf("cheap").and(leaf("pricey")));
        let cheap = index_of(&tree, "cheap");
        let pricey = index_of(&tree, "pricey");

        tree.activate(&host).unwrap();
        assert!(host.is_watching("cheap", cheap));
        assert!(!host.is_watching("pricey", pricey));

        signal(&mut tree, &host, "cheap", cheap, true);
        assert!(host.is_watching("pricey", pricey));
        assert!(!tree.is_triggered());

        signal(&mut tree, &host, "pricey", pricey, true);
        assert!(tree.is_triggered());
        assert_eq!(tree.take_transitions(), vec![true]);

        signal(&mut tree, &host, "cheap", cheap, false);
        assert!(!host.is_watching("pricey", pricey));
        assert!(!tree.is_triggered());
        assert_eq!(tree.take_transitions(), vec![false]);
    }

    #[test]
    fn and_ignores_duplicate_trigger_from_true_child() {
        let host = RecordingHost::default();
        let mut tree = build(&leaf("cheap").and(leaf("pricey")));
        let root = tree.root().unwrap();
        let (first, second) = tree.children(root).unwrap();

        tree.activate(&host).unwrap();
        signal(&mut tree, &host, "cheap", first, true);
        signal(&mut tree, &host, "pricey", second, true);
        assert_eq!(tree.take_transitions(), vec![true]);

        tree.child_triggered(root, second, &host).unwrap();
        tree.child_triggered(root, first, &host).unwrap();
        assert!(tree.take_transitions().is_empty());
        assert!(tree.is_triggered());
    }

    #[test]
    fn or_parks_sibling_while_one_child_holds() {
        let host = RecordingHost::default();
        let mut tree = build(&leaf("a").or(leaf("b")));
        let a = index_of(&tree, "a");
        let b = index_of(&tree, "b");

        tree.activate(&host).unwrap();
        assert!(host.is_watching("a", a) && host.is_watching("b", b));

        signal(&mut tree, &host, "a", a, true);
        assert!(!host.is_watching("b", b));
        assert_eq!(tree.take_transitions(), vec![true]);

        signal(&mut tree, &host, "a", a, false);
        assert!(host.is_watching("b", b));
        assert_eq!(tree.take_transitions(), vec![false]);
    }

    #[test]
    fn or_reports_untrigger_even_when_sibling_cannot_rearm() {
        let mut tree = build(&leaf("a").or(leaf("b")));
        let host = RecordingHost::default();
        tree.activate(&host).unwrap();
        let a = index_of(&tree, "a");
        let b = index_of(&tree, "b");

        signal(&mut tree, &host, "a", a, true);
        assert_eq!(tree.take_transitions(), vec![true]);
        assert!(!host.is_watching("b", b));

        host.refuse.store(true, Ordering::SeqCst);
        let key = host.key("a", a);
        let err = tree.on_signal(LeafSignal { key, exceeded: false }, &host).unwrap_err();
        assert!(matches!(err, MetronError::Internal { .. }));
        assert_eq!(tree.take_transitions(), vec![false]);
        assert!(!tree.is_triggered());
    }

    #[test]
    fn negated_leaf_holds_while_threshold_is_clear() {
        let host = RecordingHost::default();
        let mut tree = build(&leaf("a").negate());
        let a = tree.root().unwrap();
        tree.activate(&host).unwrap();

        signal(&mut tree, &host, "a", a, false);
        assert_eq!(tree.take_transitions(), vec![true]);
        signal(&mut tree, &host, "a", a, true);
        assert_eq!(tree.take_transitions(), vec![false]);
    }

    #[test]
    fn stale_epoch_signal_is_ignored() {
        let host = RecordingHost::default();
        let mut tree = build(&leaf("a"));
        let a = tree.root().unwrap();
        tree.activate(&host).unwrap();
        let old = host.key("a", a);

        tree.deactivate(&host);
        tree.activate(&host).unwrap();
        tree.on_signal(LeafSignal { key: old, exceeded: true }, &host).unwrap();
        assert!(!tree.is_triggered());

        signal(&mut tree, &host, "a", a, true);
        assert!(tree.is_triggered());
    }

    #[test]
    fn activate_then_deactivate_restores_everything() {
        let host = RecordingHost::default();
        let expr = leaf("cheap").and(leaf("pricey")).or(leaf("a").and(leaf("b")));
        let mut tree = build(&expr);

        tree.activate(&host).unwrap();
        assert!(host.count() > 0);
        tree.deactivate(&host);

        assert_eq!(host.count(), 0);
        for idx in 0..tree.len() {
            let s = tree.status(idx).unwrap();
            assert!(!s.active && !s.state, "node {idx} left {s:?}");
        }
    }

    #[test]
    fn clear_releases_nodes_and_watches() {
        let host = RecordingHost::default();
        let mut tree = build(&leaf("a").or(leaf("b")));
        tree.activate(&host).unwrap();
        let key = host.key("a", index_of(&tree, "a"));

        tree.clear(&host);
        assert_eq!(host.count(), 0);
        assert!(tree.is_empty());
        assert_eq!(tree.root(), None);
        tree.on_signal(LeafSignal { key, exceeded: true }, &host).unwrap();
        assert!(!tree.is_triggered());
    }
}
