//! Bind-relation graph.
//!
//! Routes are edges `src → dst` between endpoints; a destination may be a
//! group. Every edge is kept in both directions (`src → {dst}` and
//! `dst → {src}`), once in the live views and once, when quarantined, in the
//! abnormal views. An edge is never in both.
//!
//! Mutations go to a private working graph. [`BindRelation::order`]
//! publishes it as the committed snapshot that scheduler passes read
//! through an [`ArcSwap`], so a pass never observes a half-applied
//! configuration and never blocks on the config path.
//!
//! Removals are staged the same way. An unbound route or deleted group keeps
//! its entities, subscriptions and in-flight messages until the commit that
//! drops it from the snapshot.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use arc_swap::ArcSwap;
use dgw_entity::{
    Direction, EndpointId, EntityInfo, EntityKey, EntityType, RouterError, RouterResult,
    RoutePolicy,
};
use dgw_wire::layout::RouteStatus;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::driver::{Drivers, SubscribeKind};
use crate::fsm::FsmState;
use crate::registry::EntityRegistry;

/// Most relations the graph holds.
pub const RELATION_UPPER_BOUND: usize = 65536;

type Adjacency = BTreeMap<EndpointId, BTreeSet<EndpointId>>;

fn link(adj: &mut Adjacency, from: EndpointId, to: EndpointId) {
    adj.entry(from).or_default().insert(to);
}

fn unlink(adj: &mut Adjacency, from: EndpointId, to: EndpointId) -> bool {
    let Some(set) = adj.get_mut(&from) else {
        return false;
    };
    let removed = set.remove(&to);
    if set.is_empty() {
        adj.remove(&from);
    }
    removed
}

fn contains(adj: &Adjacency, from: EndpointId, to: EndpointId) -> bool {
    adj.get(&from).is_some_and(|set| set.contains(&to))
}

fn edge_count(adj: &Adjacency) -> usize {
    adj.values().map(BTreeSet::len).sum()
}

/// A load-balanced set of destinations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    pub id: u32,
    /// Graph node of the group itself.
    pub endpoint: EndpointId,
    pub policy: RoutePolicy,
    pub members: Vec<EntityInfo>,
    /// Faulted members excluded from selection.
    pub quarantined: BTreeSet<EndpointId>,
}

impl Group {
    /// Members eligible for selection, in declaration order.
    #[must_use]
    pub fn healthy(&self) -> Vec<&EntityInfo> {
        self.members
            .iter()
            .filter(|m| !self.quarantined.contains(&m.endpoint))
            .collect()
    }

    #[must_use]
    pub fn contains(&self, endpoint: EndpointId) -> bool {
        self.members.iter().any(|m| m.endpoint == endpoint)
    }

    /// The group as a route destination.
    #[must_use]
    pub fn info(&self) -> EntityInfo {
        EntityInfo::group(self.endpoint.resource_index, self.id, self.policy)
    }
}

/// One consistent configuration of routes and groups.
#[derive(Debug, Clone, Default)]
pub struct RelationGraph {
    src_to_dst: Adjacency,
    dst_to_src: Adjacency,
    abnormal_src_to_dst: Adjacency,
    abnormal_dst_to_src: Adjacency,
    infos: BTreeMap<EndpointId, EntityInfo>,
    groups: BTreeMap<u32, Group>,
    ordered_sources: Vec<EndpointId>,
}

impl RelationGraph {
    /// Live destinations of `src`.
    pub fn dsts_of(&self, src: EndpointId) -> impl Iterator<Item = EndpointId> + '_ {
        self.src_to_dst.get(&src).into_iter().flatten().copied()
    }

    /// Live sources of `dst`.
    pub fn srcs_of(&self, dst: EndpointId) -> impl Iterator<Item = EndpointId> + '_ {
        self.dst_to_src.get(&dst).into_iter().flatten().copied()
    }

    #[must_use]
    pub fn is_bound(&self, src: EndpointId, dst: EndpointId) -> bool {
        contains(&self.src_to_dst, src, dst)
    }

    #[must_use]
    pub fn is_abnormal(&self, src: EndpointId, dst: EndpointId) -> bool {
        contains(&self.abnormal_src_to_dst, src, dst)
    }

    fn is_source(&self, ep: EndpointId) -> bool {
        self.src_to_dst.contains_key(&ep) || self.abnormal_src_to_dst.contains_key(&ep)
    }

    fn is_destination(&self, ep: EndpointId) -> bool {
        self.dst_to_src.contains_key(&ep) || self.abnormal_dst_to_src.contains_key(&ep)
    }

    #[must_use]
    pub fn group(&self, id: u32) -> Option<&Group> {
        self.groups.get(&id)
    }

    pub fn groups(&self) -> impl Iterator<Item = &Group> {
        self.groups.values()
    }

    /// Groups that list `member`.
    pub fn groups_of(&self, member: EndpointId) -> impl Iterator<Item = &Group> {
        self.groups.values().filter(move |g| g.contains(member))
    }

    #[must_use]
    pub fn info(&self, ep: EndpointId) -> Option<&EntityInfo> {
        self.infos.get(&ep)
    }

    /// Sources in scheduling order.
    #[must_use]
    pub fn ordered_sources(&self) -> &[EndpointId] {
        &self.ordered_sources
    }

    /// Scheduling-ordered sources living on resource index `shard`.
    pub fn sources_in(&self, shard: u32) -> impl Iterator<Item = EndpointId> + '_ {
        self.ordered_sources
            .iter()
            .copied()
            .filter(move |src| src.resource_index == shard)
    }

    #[must_use]
    pub fn count_binds(&self) -> usize {
        edge_count(&self.src_to_dst)
    }

    /// Quarantined routes plus quarantined group members.
    #[must_use]
    pub fn count_abnormal(&self) -> usize {
        edge_count(&self.abnormal_src_to_dst)
    }

    /// Every route with its status, live first, each in key order. Group
    /// member quarantines are not routes and are left out.
    #[must_use]
    pub fn routes(&self) -> Vec<(EndpointId, EndpointId, RouteStatus)> {
        let expand = |adj: &Adjacency, status: RouteStatus| {
            adj.iter()
                .filter(|(src, _)| !src.is_group())
                .flat_map(move |(src, dsts)| dsts.iter().map(move |dst| (*src, *dst, status)))
                .collect::<Vec<_>>()
        };
        let mut routes = expand(&self.src_to_dst, RouteStatus::Active);
        routes.extend(expand(&self.abnormal_src_to_dst, RouteStatus::Abnormal));
        routes
    }

    /// Both views of each pair mirror each other, and no edge is live and
    /// abnormal at once.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        let mirrors = |forward: &Adjacency, backward: &Adjacency| {
            forward
                .iter()
                .all(|(a, bs)| bs.iter().all(|b| contains(backward, *b, *a)))
                && edge_count(forward) == edge_count(backward)
        };
        let disjoint = self
            .src_to_dst
            .iter()
            .all(|(a, bs)| bs.iter().all(|b| !contains(&self.abnormal_src_to_dst, *a, *b)));
        mirrors(&self.src_to_dst, &self.dst_to_src)
            && mirrors(&self.abnormal_src_to_dst, &self.abnormal_dst_to_src)
            && disjoint
    }

    fn insert(&mut self, src: &EntityInfo, dst: &EntityInfo) {
        link(&mut self.src_to_dst, src.endpoint, dst.endpoint);
        link(&mut self.dst_to_src, dst.endpoint, src.endpoint);
        self.infos.insert(src.endpoint, src.clone());
        self.infos.insert(dst.endpoint, dst.clone());
    }

    /// Removes the edge from whichever view holds it.
    fn remove(&mut self, src: EndpointId, dst: EndpointId) -> bool {
        let live = unlink(&mut self.src_to_dst, src, dst);
        unlink(&mut self.dst_to_src, dst, src);
        let abnormal = unlink(&mut self.abnormal_src_to_dst, src, dst);
        unlink(&mut self.abnormal_dst_to_src, dst, src);
        self.prune_info(src);
        self.prune_info(dst);
        live || abnormal
    }

    fn quarantine(&mut self, src: EndpointId, dst: EndpointId) -> bool {
        if !unlink(&mut self.src_to_dst, src, dst) {
            return false;
        }
        unlink(&mut self.dst_to_src, dst, src);
        link(&mut self.abnormal_src_to_dst, src, dst);
        link(&mut self.abnormal_dst_to_src, dst, src);
        true
    }

    fn quarantine_member(&mut self, group_id: u32, member: EndpointId) -> bool {
        let Some(group) = self.groups.get_mut(&group_id) else {
            return false;
        };
        if !group.contains(member) || !group.quarantined.insert(member) {
            return false;
        }
        let group_ep = group.endpoint;
        link(&mut self.abnormal_src_to_dst, group_ep, member);
        link(&mut self.abnormal_dst_to_src, member, group_ep);
        true
    }

    /// Moves every abnormal edge touching `ep` back to the live views.
    fn restore(&mut self, ep: EndpointId) -> usize {
        let mut edges: Vec<(EndpointId, EndpointId)> = Vec::new();
        if let Some(dsts) = self.abnormal_src_to_dst.get(&ep) {
            edges.extend(dsts.iter().map(|dst| (ep, *dst)));
        }
        if let Some(srcs) = self.abnormal_dst_to_src.get(&ep) {
            edges.extend(srcs.iter().map(|src| (*src, ep)));
        }
        for &(src, dst) in &edges {
            unlink(&mut self.abnormal_src_to_dst, src, dst);
            unlink(&mut self.abnormal_dst_to_src, dst, src);
            if src.is_group() {
                if let Some(group) = self.groups.get_mut(&src.id) {
                    group.quarantined.remove(&dst);
                }
            } else {
                link(&mut self.src_to_dst, src, dst);
                link(&mut self.dst_to_src, dst, src);
            }
        }
        edges.len()
    }

    fn prune_info(&mut self, ep: EndpointId) {
        if !self.is_source(ep) && !self.is_destination(ep) {
            self.infos.remove(&ep);
        }
    }

    /// Kahn's algorithm over the live edges, group destinations expanded to
    /// their members. Ties break in key order; a cycle falls back to plain
    /// key order.
    fn topo_order(&self) -> Vec<EndpointId> {
        let mut succ: Adjacency = BTreeMap::new();
        let mut indegree: BTreeMap<EndpointId, usize> = BTreeMap::new();
        for (src, dsts) in &self.src_to_dst {
            indegree.entry(*src).or_insert(0);
            for dst in dsts {
                let targets: Vec<EndpointId> = match self.groups.get(&dst.id) {
                    Some(group) if dst.is_group() => {
                        group.members.iter().map(|m| m.endpoint).collect()
                    }
                    _ => vec![*dst],
                };
                for target in targets {
                    if succ.entry(*src).or_default().insert(target) {
                        *indegree.entry(target).or_insert(0) += 1;
                    }
                }
            }
        }
        let mut ready: BTreeSet<EndpointId> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(ep, _)| *ep)
            .collect();
        let mut order = Vec::with_capacity(indegree.len());
        while let Some(ep) = ready.pop_first() {
            order.push(ep);
            for next in succ.get(&ep).into_iter().flatten() {
                if let Some(d) = indegree.get_mut(next) {
                    *d -= 1;
                    if *d == 0 {
                        ready.insert(*next);
                    }
                }
            }
        }
        if order.len() != indegree.len() {
            warn!("relation graph has a cycle, scheduling in key order");
            return self.src_to_dst.keys().copied().collect();
        }
        order
            .into_iter()
            .filter(|ep| self.src_to_dst.contains_key(ep))
            .collect()
    }
}

/// Outcome of validating a bind against the working graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BindCheck {
    New,
    /// Already live or quarantined; nothing to do.
    Exists,
}

fn validate_channel(info: &EntityInfo) -> RouterResult<()> {
    if info.endpoint.entity_type != EntityType::Channel {
        return Ok(());
    }
    info.channel
        .ok_or(RouterError::ParamInvalid)?
        .validate(true)
}

fn check_bind(graph: &RelationGraph, src: &EntityInfo, dst: &EntityInfo) -> RouterResult<BindCheck> {
    let (s, d) = (src.endpoint, dst.endpoint);
    if s == d {
        return Err(RouterError::ParamInvalid);
    }
    if s.is_group() {
        return Err(RouterError::EndpointTypeNotSupported);
    }
    validate_channel(src)?;
    validate_channel(dst)?;
    if graph.is_bound(s, d) || graph.is_abnormal(s, d) {
        return Ok(BindCheck::Exists);
    }
    if graph.groups_of(s).next().is_some() || graph.groups_of(d).next().is_some() {
        return Err(RouterError::ParamInvalid);
    }
    if let Some(group) = graph.groups.get(&d.id).filter(|_| d.is_group())
        && group
            .members
            .iter()
            .any(|m| graph.is_source(m.endpoint) || graph.is_destination(m.endpoint))
    {
        return Err(RouterError::ParamInvalid);
    }
    if graph.is_destination(s) || graph.is_source(d) {
        return Err(RouterError::ParamInvalid);
    }
    if graph.count_binds() + graph.count_abnormal() >= RELATION_UPPER_BOUND {
        return Err(RouterError::InnerError);
    }
    Ok(BindCheck::New)
}

/// Linearizes commits: only one holder publishes at a time.
pub(crate) struct CommitGuard<'a>(&'a AtomicBool);

impl<'a> CommitGuard<'a> {
    fn try_begin(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for CommitGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// A removal waiting for the commit that publishes it.
#[derive(Debug)]
enum Retired {
    Route {
        src: EndpointId,
        dst: EndpointId,
        group: Option<Group>,
    },
    Group(Group),
}

/// Staged route configuration with a committed, lock-free snapshot.
pub struct BindRelation {
    working: Mutex<RelationGraph>,
    /// Locked only while `working` is held.
    retired: Mutex<Vec<Retired>>,
    committed: ArcSwap<RelationGraph>,
    committing: AtomicBool,
    next_group_id: AtomicU32,
    registry: Arc<EntityRegistry>,
    drivers: Drivers,
}

impl std::fmt::Debug for BindRelation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let committed = self.committed.load();
        f.debug_struct("BindRelation")
            .field("binds", &committed.count_binds())
            .field("abnormal", &committed.count_abnormal())
            .field("groups", &committed.groups.len())
            .finish_non_exhaustive()
    }
}

impl BindRelation {
    #[must_use]
    pub fn new(registry: Arc<EntityRegistry>, drivers: Drivers) -> Self {
        Self {
            working: Mutex::new(RelationGraph::default()),
            retired: Mutex::new(Vec::new()),
            committed: ArcSwap::from_pointee(RelationGraph::default()),
            committing: AtomicBool::new(false),
            next_group_id: AtomicU32::new(1),
            registry,
            drivers,
        }
    }

    /// The last committed graph.
    #[must_use]
    pub fn committed(&self) -> Arc<RelationGraph> {
        self.committed.load_full()
    }

    #[must_use]
    pub fn count_binds(&self) -> usize {
        self.committed.load().count_binds()
    }

    #[must_use]
    pub fn count_abnormal(&self) -> usize {
        self.committed.load().count_abnormal()
    }

    /// Resolves a group destination to its canonical description.
    fn canonical_dst(graph: &RelationGraph, dst: &EntityInfo) -> RouterResult<EntityInfo> {
        if !dst.is_group() {
            return Ok(dst.clone());
        }
        graph
            .group(dst.endpoint.id)
            .map(Group::info)
            .ok_or(RouterError::GroupNotExist)
    }

    /// Stages a route. Binding an existing route is a no-op.
    ///
    /// # Errors
    ///
    /// Returns the first rule the route breaks; nothing is staged then.
    pub fn bind(&self, src: &EntityInfo, dst: &EntityInfo) -> RouterResult<()> {
        let mut graph = self.working.lock();
        let dst = Self::canonical_dst(&graph, dst)?;
        if check_bind(&graph, src, &dst)? == BindCheck::Exists {
            debug!(src = %src.endpoint, dst = %dst.endpoint, "route already bound");
            return Ok(());
        }
        self.acquire(src, Direction::Send)?;
        if let Err(err) = self.acquire(&dst, Direction::Recv) {
            self.release(src.key(Direction::Send));
            return Err(err);
        }
        graph.insert(src, &dst);
        info!(src = %src.endpoint, dst = %dst.endpoint, "route bound");
        Ok(())
    }

    /// Stages the removal of a live or quarantined route. Messages in flight
    /// to the destination are aborted when the removal is committed.
    /// Unbinding a route whose removal is already staged is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::ParamInvalid`] for an unknown route and
    /// [`RouterError::GroupNotExist`] for an unknown group.
    pub fn unbind(&self, src: &EntityInfo, dst: &EntityInfo) -> RouterResult<()> {
        let mut graph = self.working.lock();
        let dst = Self::canonical_dst(&graph, dst)?.endpoint;
        self.unbind_locked(&mut graph, src.endpoint, dst)
    }

    fn unbind_locked(&self, graph: &mut RelationGraph, src: EndpointId, dst: EndpointId) -> RouterResult<()> {
        let group = graph.group(dst.id).filter(|_| dst.is_group()).cloned();
        if !graph.remove(src, dst) {
            let committed = self.committed.load();
            if committed.is_bound(src, dst) || committed.is_abnormal(src, dst) {
                debug!(%src, %dst, "route removal already staged");
                return Ok(());
            }
            return Err(RouterError::ParamInvalid);
        }
        self.retired.lock().push(Retired::Route { src, dst, group });
        info!(%src, %dst, "route unbound");
        Ok(())
    }

    /// Unbinds every route from `src`. Returns how many were removed.
    pub fn unbind_by_src(&self, src: EndpointId) -> usize {
        let mut graph = self.working.lock();
        let dsts: Vec<EndpointId> = graph
            .src_to_dst
            .get(&src)
            .into_iter()
            .chain(graph.abnormal_src_to_dst.get(&src))
            .flatten()
            .copied()
            .collect();
        dsts.into_iter()
            .filter(|dst| self.unbind_locked(&mut graph, src, *dst).is_ok())
            .count()
    }

    /// Unbinds every route into `dst`. Returns how many were removed.
    pub fn unbind_by_dst(&self, dst: EndpointId) -> usize {
        let mut graph = self.working.lock();
        let srcs: Vec<EndpointId> = graph
            .dst_to_src
            .get(&dst)
            .into_iter()
            .chain(graph.abnormal_dst_to_src.get(&dst))
            .flatten()
            .copied()
            .filter(|src| !src.is_group())
            .collect();
        srcs.into_iter()
            .filter(|src| self.unbind_locked(&mut graph, *src, dst).is_ok())
            .count()
    }

    /// Stages a group and returns its id. Ids start at 1.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::ParamInvalid`] for an empty list, a duplicate
    /// or nested member, an invalid channel, or a member already in a group.
    pub fn create_group(&self, members: &[EntityInfo], policy: RoutePolicy) -> RouterResult<u32> {
        let Some(first) = members.first() else {
            return Err(RouterError::ParamInvalid);
        };
        let mut seen = BTreeSet::new();
        for member in members {
            if member.is_group() || !seen.insert(member.endpoint) {
                return Err(RouterError::ParamInvalid);
            }
            validate_channel(member)?;
        }
        let mut graph = self.working.lock();
        if members.iter().any(|m| graph.groups_of(m.endpoint).next().is_some()) {
            return Err(RouterError::ParamInvalid);
        }
        for (done, member) in members.iter().enumerate() {
            if let Err(err) = self.acquire(member, Direction::Recv) {
                for acquired in &members[..done] {
                    self.release(acquired.key(Direction::Recv));
                }
                return Err(err);
            }
        }
        let id = self.next_group_id.fetch_add(1, Ordering::AcqRel);
        let group = Group {
            id,
            endpoint: EndpointId::group(first.endpoint.resource_index, id),
            policy,
            members: members.to_vec(),
            quarantined: BTreeSet::new(),
        };
        info!(group_id = id, members = members.len(), ?policy, "group created");
        graph.groups.insert(id, group);
        Ok(id)
    }

    /// Stages the removal of an unrouted group.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::GroupNotExist`] or
    /// [`RouterError::GroupExistInRoute`].
    pub fn delete_group(&self, id: u32) -> RouterResult<()> {
        let mut graph = self.working.lock();
        let group = graph.group(id).ok_or(RouterError::GroupNotExist)?;
        let group_ep = group.endpoint;
        if graph.is_destination(group_ep) {
            return Err(RouterError::GroupExistInRoute);
        }
        let Some(group) = graph.groups.remove(&id) else {
            return Err(RouterError::GroupNotExist);
        };
        for member in &group.quarantined {
            unlink(&mut graph.abnormal_src_to_dst, group_ep, *member);
            unlink(&mut graph.abnormal_dst_to_src, *member, group_ep);
        }
        self.retired.lock().push(Retired::Group(group));
        info!(group_id = id, "group deleted");
        Ok(())
    }

    /// Publishes the working graph, then releases what the staged removals
    /// no longer reference.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::Retry`] when another commit is in progress;
    /// nothing is published then.
    pub fn order(&self) -> RouterResult<()> {
        let Some(_guard) = CommitGuard::try_begin(&self.committing) else {
            debug!("commit in progress, caller must retry");
            return Err(RouterError::Retry);
        };
        let mut graph = self.working.lock();
        graph.ordered_sources = graph.topo_order();
        self.committed.store(Arc::new(graph.clone()));
        let retired = std::mem::take(&mut *self.retired.lock());
        debug!(
            binds = graph.count_binds(),
            abnormal = graph.count_abnormal(),
            sources = graph.ordered_sources.len(),
            retired = retired.len(),
            "relation committed"
        );
        for removal in retired {
            self.retire(&graph, removal);
        }
        Ok(())
    }

    /// Drops the references a committed removal held. In-flight recipients
    /// are aborted unless the route was bound again before the commit.
    fn retire(&self, graph: &RelationGraph, removal: Retired) {
        match removal {
            Retired::Route { src, dst, group } => {
                if !graph.is_bound(src, dst) && !graph.is_abnormal(src, dst) {
                    let mut targets: BTreeSet<EndpointId> = BTreeSet::from([dst]);
                    if let Some(group) = &group {
                        targets.extend(group.members.iter().map(|m| m.endpoint));
                    }
                    self.abort_recipients(
                        src.with_direction(Direction::Send),
                        &targets,
                        group.map(|g| g.id),
                    );
                }
                self.release(src.with_direction(Direction::Send));
                self.release(dst.with_direction(Direction::Recv));
            }
            Retired::Group(group) => {
                for member in &group.members {
                    self.release(member.key(Direction::Recv));
                }
            }
        }
    }

    /// Holds the commit slot as a concurrent commit would.
    #[cfg(test)]
    pub(crate) fn hold_commit(&self) -> Option<CommitGuard<'_>> {
        CommitGuard::try_begin(&self.committing)
    }

    /// Quarantines every committed relation touching a faulted entity of
    /// `shard`, and faulted members of groups. Returns how many moved; `0`
    /// also when another commit holds the graph.
    pub fn update_relation(&self, shard: u32) -> usize {
        let Some(_guard) = CommitGuard::try_begin(&self.committing) else {
            return 0;
        };
        let committed = self.committed.load_full();
        let faulted = |key: EntityKey| {
            self.registry
                .get(&key)
                .is_some_and(|slot| slot.lock().cur_state() == FsmState::Error)
        };
        let mut edges = Vec::new();
        for (src, dsts) in &committed.src_to_dst {
            for dst in dsts {
                if src.resource_index != shard && dst.resource_index != shard {
                    continue;
                }
                let src_bad = src.resource_index == shard && faulted(src.with_direction(Direction::Send));
                let dst_bad = !dst.is_group()
                    && dst.resource_index == shard
                    && faulted(dst.with_direction(Direction::Recv));
                if src_bad || dst_bad {
                    edges.push((*src, *dst));
                }
            }
        }
        let mut members = Vec::new();
        let groups = self.registry.has_groups().then_some(&committed.groups);
        for group in groups.into_iter().flat_map(BTreeMap::values) {
            for member in group.healthy() {
                let ep = member.endpoint;
                if ep.resource_index == shard && faulted(ep.with_direction(Direction::Recv)) {
                    members.push((group.id, ep));
                }
            }
        }
        if edges.is_empty() && members.is_empty() {
            return 0;
        }

        let mut next = (*committed).clone();
        let mut working = self.working.lock();
        let mut moved = 0;
        for &(src, dst) in &edges {
            working.quarantine(src, dst);
            if next.quarantine(src, dst) {
                moved += 1;
            }
        }
        for &(group_id, member) in &members {
            working.quarantine_member(group_id, member);
            if next.quarantine_member(group_id, member) {
                moved += 1;
            }
        }
        working.ordered_sources = working.topo_order();
        next.ordered_sources = next.topo_order();
        self.committed.store(Arc::new(next));
        warn!(shard, quarantined = moved, "faulted relations quarantined");
        moved
    }

    /// Stages the return of every quarantined relation touching `ep`.
    /// Returns how many were restored.
    pub fn restore(&self, ep: EndpointId) -> usize {
        let restored = self.working.lock().restore(ep);
        if restored > 0 {
            info!(endpoint = %ep, restored, "relations restored");
        }
        restored
    }

    fn acquire(&self, info: &EntityInfo, direction: Direction) -> RouterResult<()> {
        let slot = self.registry.get_or_create(info, direction)?;
        if slot.refs() > 1 || info.endpoint.entity_type != EntityType::Queue {
            return Ok(());
        }
        let kind = match direction {
            Direction::Send => SubscribeKind::Enqueue,
            Direction::Recv => SubscribeKind::FullToNotFull,
        };
        if let Err(err) = self.drivers.queues.subscribe(info.endpoint, kind) {
            warn!(entity = %slot.key(), %err, "queue subscribe failed");
            self.release(slot.key());
            return Err(err.into());
        }
        Ok(())
    }

    fn release(&self, key: EntityKey) {
        match self.registry.release(&key) {
            Ok(Some(slot)) => {
                if key.endpoint.entity_type == EntityType::Queue {
                    let kind = match key.direction {
                        Direction::Send => SubscribeKind::Enqueue,
                        Direction::Recv => SubscribeKind::FullToNotFull,
                    };
                    if let Err(err) = self.drivers.queues.unsubscribe(key.endpoint, kind) {
                        debug!(entity = %key, %err, "queue unsubscribe failed");
                    }
                }
                let aborted = slot.lock().abort_in_flight(&self.drivers);
                if aborted > 0 {
                    info!(entity = %key, aborted, "in-flight messages aborted");
                }
            }
            Ok(None) => {}
            Err(err) => warn!(entity = %key, %err, "release of unknown entity"),
        }
    }

    fn abort_recipients(&self, src: EntityKey, targets: &BTreeSet<EndpointId>, group: Option<u32>) {
        let Some(slot) = self.registry.get(&src) else {
            return;
        };
        let mut entity = slot.lock();
        let mut aborted = 0;
        for obj in &mut entity.send_list {
            aborted += obj.abort_where(|key| targets.contains(&key.endpoint));
            if let Some(group_id) = group {
                obj.abandon_decision(group_id);
            }
        }
        entity.send_list.retain(|obj| !obj.is_complete());
        if aborted > 0 {
            debug!(entity = %src, aborted, "in-flight recipients aborted");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimDrivers;
    use dgw_entity::ChannelDesc;
    use proptest::prelude::*;

    fn setup() -> (SimDrivers, Arc<EntityRegistry>, BindRelation) {
        let sim = SimDrivers::new(2);
        for id in 0..16 {
            sim.queues.create_queue(EndpointId::queue(0, id), 8);
            sim.queues.create_queue(EndpointId::queue(1, id), 8);
        }
        let registry = Arc::new(EntityRegistry::new(2));
        let relation = BindRelation::new(Arc::clone(&registry), sim.drivers());
        (sim, registry, relation)
    }

    fn q(id: u32) -> EntityInfo {
        EntityInfo::queue(0, id)
    }

    #[test]
    fn test_bind_is_invisible_until_order() {
        let (_sim, _registry, relation) = setup();
        relation.bind(&q(1), &q(2)).unwrap();
        assert_eq!(relation.count_binds(), 0);
        relation.order().unwrap();
        let graph = relation.committed();
        assert!(graph.is_bound(q(1).endpoint, q(2).endpoint));
        assert_eq!(graph.ordered_sources(), &[q(1).endpoint]);
    }

    #[test]
    fn test_bind_then_unbind_restores_views() {
        let (sim, registry, relation) = setup();
        relation.bind(&q(1), &q(2)).unwrap();
        relation.order().unwrap();
        assert!(sim.queues.is_subscribed(q(1).endpoint, SubscribeKind::Enqueue));
        assert!(sim.queues.is_subscribed(q(2).endpoint, SubscribeKind::FullToNotFull));
        relation.unbind(&q(1), &q(2)).unwrap();
        relation.order().unwrap();
        let graph = relation.committed();
        assert_eq!(graph.count_binds(), 0);
        assert!(graph.routes().is_empty());
        assert!(graph.is_consistent());
        assert!(registry.is_empty());
        assert!(!sim.queues.is_subscribed(q(1).endpoint, SubscribeKind::Enqueue));
    }

    #[test]
    fn test_rebind_is_noop() {
        let (_sim, registry, relation) = setup();
        relation.bind(&q(1), &q(2)).unwrap();
        relation.bind(&q(1), &q(2)).unwrap();
        let slot = registry.get(&q(1).key(Direction::Send)).unwrap();
        assert_eq!(slot.refs(), 1);
    }

    #[test]
    fn test_bind_rules() {
        let (_sim, _registry, relation) = setup();
        assert_eq!(relation.bind(&q(1), &q(1)), Err(RouterError::ParamInvalid));
        relation.bind(&q(1), &q(2)).unwrap();
        // Multi-layer in both directions.
        assert_eq!(relation.bind(&q(2), &q(3)), Err(RouterError::ParamInvalid));
        assert_eq!(relation.bind(&q(0), &q(1)), Err(RouterError::ParamInvalid));
        let group = EntityInfo::group(0, 99, RoutePolicy::Hash);
        assert_eq!(relation.bind(&q(4), &group), Err(RouterError::GroupNotExist));
        let id = relation.create_group(&[q(5), q(6)], RoutePolicy::Hash).unwrap();
        let group = EntityInfo::group(0, id, RoutePolicy::Hash);
        assert_eq!(
            relation.bind(&group, &q(7)),
            Err(RouterError::EndpointTypeNotSupported)
        );
        // A member cannot also be routed on its own.
        assert_eq!(relation.bind(&q(8), &q(5)), Err(RouterError::ParamInvalid));
        relation.bind(&q(8), &group).unwrap();
    }

    #[test]
    fn test_group_with_standalone_member_rejected() {
        let (_sim, _registry, relation) = setup();
        relation.bind(&q(1), &q(2)).unwrap();
        let id = relation.create_group(&[q(2), q(3)], RoutePolicy::Broadcast);
        // Creating is allowed, binding the group is not.
        let id = id.unwrap();
        let group = EntityInfo::group(0, id, RoutePolicy::Broadcast);
        assert_eq!(relation.bind(&q(4), &group), Err(RouterError::ParamInvalid));
    }

    #[test]
    fn test_invalid_channel_rejected() {
        let (_sim, _registry, relation) = setup();
        let desc = ChannelDesc {
            comm_handle: 1,
            local_tag_id: 1,
            peer_tag_id: 2,
            local_rank_id: 0,
            peer_rank_id: 1,
            local_tag_depth: 2,
            peer_tag_depth: 2,
        };
        let chan = EntityInfo::channel(0, 3, desc);
        assert_eq!(relation.bind(&q(1), &chan), Err(RouterError::ParamInvalid));
        assert!(relation.working.lock().src_to_dst.is_empty());
    }

    #[test]
    fn test_unbind_is_invisible_until_order() {
        let (sim, registry, relation) = setup();
        relation.bind(&q(1), &q(2)).unwrap();
        relation.order().unwrap();
        relation.unbind(&q(1), &q(2)).unwrap();
        assert!(relation.committed().is_bound(q(1).endpoint, q(2).endpoint));
        assert!(registry.get(&q(2).key(Direction::Recv)).is_some());
        assert!(sim.queues.is_subscribed(q(1).endpoint, SubscribeKind::Enqueue));

        // Unbinding again before the commit is a no-op.
        assert_eq!(relation.unbind(&q(1), &q(2)), Ok(()));
        relation.order().unwrap();
        assert_eq!(relation.count_binds(), 0);
        assert!(registry.is_empty());
        assert!(!sim.queues.is_subscribed(q(1).endpoint, SubscribeKind::Enqueue));
        assert_eq!(relation.unbind(&q(1), &q(2)), Err(RouterError::ParamInvalid));
    }

    #[test]
    fn test_rebind_before_order_keeps_entities() {
        let (_sim, registry, relation) = setup();
        relation.bind(&q(1), &q(2)).unwrap();
        relation.order().unwrap();
        relation.unbind(&q(1), &q(2)).unwrap();
        relation.bind(&q(1), &q(2)).unwrap();
        relation.order().unwrap();
        assert!(relation.committed().is_bound(q(1).endpoint, q(2).endpoint));
        let slot = registry.get(&q(1).key(Direction::Send)).unwrap();
        assert_eq!(slot.refs(), 1);
    }

    #[test]
    fn test_unknown_unbind_rejected() {
        let (_sim, _registry, relation) = setup();
        assert_eq!(relation.unbind(&q(1), &q(2)), Err(RouterError::ParamInvalid));
    }

    #[test]
    fn test_create_group_rules() {
        let (_sim, _registry, relation) = setup();
        assert_eq!(
            relation.create_group(&[], RoutePolicy::Hash),
            Err(RouterError::ParamInvalid)
        );
        assert_eq!(
            relation.create_group(&[q(1), q(1)], RoutePolicy::Hash),
            Err(RouterError::ParamInvalid)
        );
        let nested = EntityInfo::group(0, 1, RoutePolicy::Hash);
        assert_eq!(
            relation.create_group(&[q(1), nested], RoutePolicy::Hash),
            Err(RouterError::ParamInvalid)
        );
        assert_eq!(relation.create_group(&[q(1)], RoutePolicy::Hash), Ok(1));
        assert_eq!(relation.create_group(&[q(2)], RoutePolicy::Hash), Ok(2));
    }

    #[test]
    fn test_delete_group_rules() {
        let (_sim, registry, relation) = setup();
        assert_eq!(relation.delete_group(4), Err(RouterError::GroupNotExist));
        let id = relation.create_group(&[q(2), q(3)], RoutePolicy::Hash).unwrap();
        let group = EntityInfo::group(0, id, RoutePolicy::Hash);
        relation.bind(&q(1), &group).unwrap();
        assert_eq!(relation.delete_group(id), Err(RouterError::GroupExistInRoute));
        relation.unbind(&q(1), &group).unwrap();
        relation.delete_group(id).unwrap();
        assert!(!registry.is_empty());
        relation.order().unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_order_retries_during_commit() {
        let (_sim, _registry, relation) = setup();
        relation.bind(&q(1), &q(2)).unwrap();
        let guard = CommitGuard::try_begin(&relation.committing).unwrap();
        assert_eq!(relation.order(), Err(RouterError::Retry));
        assert_eq!(relation.count_binds(), 0);
        drop(guard);
        relation.order().unwrap();
        assert_eq!(relation.count_binds(), 1);
    }

    #[test]
    fn test_faulted_destination_quarantined_and_restored() {
        let (_sim, registry, relation) = setup();
        relation.bind(&q(1), &q(2)).unwrap();
        relation.order().unwrap();
        let dst = registry.get(&q(2).key(Direction::Recv)).unwrap();
        dst.lock().set_state(FsmState::Error);
        assert_eq!(relation.update_relation(0), 1);
        let graph = relation.committed();
        assert!(graph.is_abnormal(q(1).endpoint, q(2).endpoint));
        assert!(!graph.is_bound(q(1).endpoint, q(2).endpoint));
        assert!(graph.ordered_sources().is_empty());
        assert!(graph.is_consistent());

        // A quarantined relation is not rebound.
        relation.bind(&q(1), &q(2)).unwrap();
        assert_eq!(relation.restore(q(2).endpoint), 1);
        relation.order().unwrap();
        assert!(relation.committed().is_bound(q(1).endpoint, q(2).endpoint));
    }

    #[test]
    fn test_update_relation_keeps_staged_binds_private() {
        let (_sim, registry, relation) = setup();
        relation.bind(&q(1), &q(2)).unwrap();
        relation.order().unwrap();
        relation.bind(&q(3), &q(4)).unwrap();
        registry
            .get(&q(1).key(Direction::Send))
            .unwrap()
            .lock()
            .set_state(FsmState::Error);
        assert_eq!(relation.update_relation(0), 1);
        assert!(!relation.committed().is_bound(q(3).endpoint, q(4).endpoint));
        relation.order().unwrap();
        let graph = relation.committed();
        assert!(graph.is_bound(q(3).endpoint, q(4).endpoint));
        assert!(graph.is_abnormal(q(1).endpoint, q(2).endpoint));
    }

    #[test]
    fn test_faulted_group_member_quarantined() {
        let (_sim, registry, relation) = setup();
        let id = relation.create_group(&[q(2), q(3)], RoutePolicy::Hash).unwrap();
        let group = EntityInfo::group(0, id, RoutePolicy::Hash);
        relation.bind(&q(1), &group).unwrap();
        relation.order().unwrap();
        registry
            .get(&q(3).key(Direction::Recv))
            .unwrap()
            .lock()
            .set_state(FsmState::Error);
        assert_eq!(relation.update_relation(0), 1);
        let graph = relation.committed();
        let group = graph.group(id).unwrap();
        assert_eq!(group.healthy().len(), 1);
        assert!(graph.is_bound(q(1).endpoint, group.endpoint));
        assert_eq!(graph.count_abnormal(), 1);
        assert!(graph.routes().iter().all(|(_, _, s)| *s == RouteStatus::Active));
    }

    #[test]
    fn test_unbind_by_src_and_dst() {
        let (_sim, _registry, relation) = setup();
        relation.bind(&q(1), &q(2)).unwrap();
        relation.bind(&q(1), &q(3)).unwrap();
        relation.bind(&q(4), &q(3)).unwrap();
        assert_eq!(relation.unbind_by_dst(q(3).endpoint), 2);
        assert_eq!(relation.unbind_by_src(q(1).endpoint), 1);
        relation.order().unwrap();
        assert_eq!(relation.count_binds(), 0);
    }

    #[test]
    fn test_topological_order_is_key_order_for_flat_routes() {
        let (_sim, _registry, relation) = setup();
        relation.bind(&EntityInfo::queue(1, 1), &q(9)).unwrap();
        relation.bind(&q(5), &q(10)).unwrap();
        relation.bind(&q(3), &q(11)).unwrap();
        relation.order().unwrap();
        let graph = relation.committed();
        assert_eq!(
            graph.ordered_sources(),
            &[q(3).endpoint, q(5).endpoint, EndpointId::queue(1, 1)]
        );
        assert_eq!(graph.sources_in(1).collect::<Vec<_>>(), vec![EndpointId::queue(1, 1)]);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Bind(u32, u32),
        Unbind(u32, u32),
        Group(Vec<u32>),
        BindGroup(u32),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u32..8, 0u32..8).prop_map(|(a, b)| Op::Bind(a, b)),
            (0u32..8, 0u32..8).prop_map(|(a, b)| Op::Unbind(a, b)),
            prop::collection::vec(0u32..8, 1..4).prop_map(Op::Group),
            (0u32..8).prop_map(Op::BindGroup),
        ]
    }

    proptest! {
        #[test]
        fn test_views_stay_consistent(ops in prop::collection::vec(op(), 1..40)) {
            let (_sim, _registry, relation) = setup();
            let mut groups = Vec::new();
            for op in ops {
                match op {
                    Op::Bind(a, b) => { let _ = relation.bind(&q(a), &q(b)); }
                    Op::Unbind(a, b) => { let _ = relation.unbind(&q(a), &q(b)); }
                    Op::Group(members) => {
                        let infos: Vec<EntityInfo> = members.into_iter().map(q).collect();
                        if let Ok(id) = relation.create_group(&infos, RoutePolicy::Hash) {
                            groups.push(id);
                        }
                    }
                    Op::BindGroup(src) => {
                        if let Some(id) = groups.last() {
                            let _ = relation.bind(&q(src), &EntityInfo::group(0, *id, RoutePolicy::Hash));
                        }
                    }
                }
                relation.order().unwrap();
                prop_assert!(relation.committed().is_consistent());
            }
        }
    }
}
