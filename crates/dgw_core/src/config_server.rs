//! Config server.
//!
//! Applies config-protocol requests to a [`RouterContext`]. A request is
//! decoded in full before anything is touched, so a malformed buffer never
//! mutates the graph. Results are written back into the caller's buffer and
//! the overall status is returned as a wire code.

use std::sync::Arc;

use dgw_entity::{
    Direction, EndpointId, EntityInfo, RoutePolicy, RouterError, RouterResult, STATUS_OK,
};
use dgw_wire::layout::{DynamicSchedConfig, RouteStatus};
use dgw_wire::{ConfigFrame, ConfigRequest, RoutePair, RouteQuery, WireError};
use tracing::{debug, info, warn};

use crate::bind_relation::RelationGraph;
use crate::context::RouterContext;

/// Serves config requests for one router instance.
#[derive(Debug, Clone)]
pub struct ConfigServer {
    ctx: Arc<RouterContext>,
}

impl ConfigServer {
    #[must_use]
    pub fn new(ctx: Arc<RouterContext>) -> Self {
        Self { ctx }
    }

    /// Handles one request of `sub_event` held in `buf` and returns its
    /// status code.
    pub fn handle(&self, sub_event: u32, buf: &mut [u8]) -> i32 {
        let mut frame = match ConfigFrame::parse(sub_event, buf) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(sub_event, %err, "config request rejected");
                return RouterError::from(err).code();
            }
        };
        debug!(sub_event, request = ?frame.request(), "config request");
        match self.apply(&mut frame) {
            Ok(code) => code,
            Err(err) => {
                warn!(sub_event, %err, "config result write-back failed");
                RouterError::from(err).code()
            }
        }
    }

    fn apply(&self, frame: &mut ConfigFrame<'_>) -> Result<i32, WireError> {
        let request = frame.request().clone();
        match request {
            ConfigRequest::BindRoutes(routes) => {
                let codes = self.bind_routes(&routes);
                self.finish_routes(frame, codes)
            }
            ConfigRequest::UnbindRoutes(routes) => {
                let codes = self.unbind_routes(&routes);
                self.finish_routes(frame, codes)
            }
            ConfigRequest::AddGroup { policy, members } => {
                match self.add_group(policy, &members) {
                    Ok(id) => {
                        frame.write_group_id(id)?;
                        let code = commit_status(self.ctx.relation().order());
                        frame.write_status(code)?;
                        Ok(code)
                    }
                    Err(err) => write_single(frame, Err(err)),
                }
            }
            ConfigRequest::DelGroup { group_id } => {
                let result = self
                    .ctx
                    .relation()
                    .delete_group(group_id)
                    .and_then(|()| self.ctx.relation().order());
                if result.is_ok() {
                    info!(group_id, "group deleted");
                }
                write_single(frame, result)
            }
            ConfigRequest::InitDynamicSchedule(cfg) => {
                write_single(frame, self.init_dynamic(cfg))
            }
            ConfigRequest::StopSchedule(keys) => {
                self.ctx.dynamic().stop(&keys);
                write_single(frame, Ok(()))
            }
            ConfigRequest::RestartSchedule(keys) => {
                let dropped = self.ctx.dynamic().restart(&keys);
                info!(?keys, dropped, "dynamic schedule restarted");
                write_single(frame, Ok(()))
            }
            ConfigRequest::QueryCount(query) => {
                let graph = self.ctx.relation().committed();
                let count = match query {
                    RouteQuery::Group(id) => graph.group(id).map(|g| g.members.len()),
                    ref query => Some(matching_routes(&graph, query).len()),
                };
                match count {
                    Some(count) => {
                        frame.write_query_count(count)?;
                        write_single(frame, Ok(()))
                    }
                    None => write_single(frame, Err(RouterError::GroupNotExist)),
                }
            }
            ConfigRequest::Query { query, .. } => {
                let graph = self.ctx.relation().committed();
                let written = match query {
                    RouteQuery::Group(id) => match graph.group(id) {
                        Some(group) => frame.write_query_endpoints(&group.members),
                        None => return write_single(frame, Err(RouterError::GroupNotExist)),
                    },
                    ref query => frame.write_query_routes(&matching_routes(&graph, query)),
                };
                match written {
                    Ok(()) => write_single(frame, Ok(())),
                    Err(err @ WireError::LengthMismatch { .. }) => {
                        debug!(%err, "query reserved the wrong number of entries");
                        write_single(frame, Err(RouterError::ParamInvalid))
                    }
                    Err(err) => Err(err),
                }
            }
            ConfigRequest::CreateCommHandle { rank_id, name } => {
                match self.ctx.comm_handles().create(rank_id, &name) {
                    Ok(handle) => {
                        frame.write_comm_handle(handle)?;
                        write_single(frame, Ok(()))
                    }
                    Err(err) => write_single(frame, Err(err)),
                }
            }
            ConfigRequest::DestroyCommHandle { handle } => {
                write_single(frame, self.destroy_comm_handle(handle))
            }
            ConfigRequest::QueryLinkStatus => write_single(frame, self.link_status()),
        }
    }

    // ── Routes ──────────────────────────────────────────────────────────────

    fn bind_routes(&self, routes: &[RoutePair]) -> Vec<i32> {
        routes
            .iter()
            .map(|route| {
                let result = self
                    .check_handles(&route.src)
                    .and_then(|()| self.check_handles(&route.dst))
                    .and_then(|()| self.ctx.relation().bind(&route.src, &route.dst));
                route_code(route, "bind", result)
            })
            .collect()
    }

    fn unbind_routes(&self, routes: &[RoutePair]) -> Vec<i32> {
        routes
            .iter()
            .map(|route| {
                let result = self.ctx.relation().unbind(&route.src, &route.dst);
                route_code(route, "unbind", result)
            })
            .collect()
    }

    /// Commits the staged routes and writes one result per route. Routes
    /// that were staged but could not be published report RETRY.
    fn finish_routes(&self, frame: &mut ConfigFrame<'_>, mut codes: Vec<i32>) -> Result<i32, WireError> {
        let commit = commit_status(self.ctx.relation().order());
        if commit != STATUS_OK {
            for code in codes.iter_mut().filter(|c| **c == STATUS_OK) {
                *code = commit;
            }
        }
        frame.write_results(&codes)?;
        Ok(codes
            .iter()
            .copied()
            .find(|c| *c != STATUS_OK)
            .unwrap_or(STATUS_OK))
    }

    /// A channel endpoint must name a live communication handle.
    fn check_handles(&self, info: &EntityInfo) -> RouterResult<()> {
        match info.channel {
            Some(desc) if !self.ctx.comm_handles().contains(desc.comm_handle) => {
                debug!(endpoint = %info.endpoint, handle = desc.comm_handle, "unknown communication handle");
                Err(RouterError::ParamInvalid)
            }
            _ => Ok(()),
        }
    }

    // ── Groups and schedules ────────────────────────────────────────────────

    fn add_group(&self, policy: RoutePolicy, members: &[EntityInfo]) -> RouterResult<u32> {
        for member in members {
            self.check_handles(member)?;
        }
        self.ctx.relation().create_group(members, policy)
    }

    fn init_dynamic(&self, cfg: DynamicSchedConfig) -> RouterResult<()> {
        let shards = self.ctx.config().shard_count;
        let in_range = |ep: EndpointId| (ep.resource_index as usize) < shards;
        if !in_range(cfg.request_queue()) || !in_range(cfg.response_queue()) {
            return Err(RouterError::ParamInvalid);
        }
        self.ctx.dynamic().init(cfg)
    }

    // ── Communication handles ───────────────────────────────────────────────

    fn destroy_comm_handle(&self, handle: u64) -> RouterResult<()> {
        let graph = self.ctx.relation().committed();
        if handle_in_use(&graph, handle) {
            warn!(handle, "communication handle still used by a route");
            return Err(RouterError::ParamInvalid);
        }
        let destroyed = self.ctx.comm_handles().destroy(handle)?;
        info!(handle, rank_id = destroyed.rank_id, name = %destroyed.name, "communication handle destroyed");
        Ok(())
    }

    /// Every channel endpoint has completed its link exchange.
    fn link_status(&self) -> RouterResult<()> {
        let registry = self.ctx.registry();
        for shard in 0..registry.shard_count() {
            for direction in [Direction::Send, Direction::Recv] {
                for slot in registry.channels(shard, direction) {
                    let connected = slot.lock().channel().is_some_and(|c| c.is_connected());
                    if !connected {
                        debug!(entity = %slot.key(), "link not connected");
                        return Err(RouterError::Failed);
                    }
                }
            }
        }
        Ok(())
    }
}

fn route_code(route: &RoutePair, op: &str, result: RouterResult<()>) -> i32 {
    match result {
        Ok(()) => STATUS_OK,
        Err(err) => {
            warn!(src = %route.src.endpoint, dst = %route.dst.endpoint, op, %err, "route rejected");
            err.code()
        }
    }
}

fn commit_status(result: RouterResult<()>) -> i32 {
    match result {
        Ok(()) => STATUS_OK,
        Err(err) => {
            debug!(%err, "relation not committed");
            err.code()
        }
    }
}

fn write_single(frame: &mut ConfigFrame<'_>, result: RouterResult<()>) -> Result<i32, WireError> {
    let code = match result {
        Ok(()) => STATUS_OK,
        Err(err) => err.code(),
    };
    frame.write_status(code)?;
    Ok(code)
}

/// The stored description of `ep`, or a bare one if the graph has none.
fn info_of(graph: &RelationGraph, ep: EndpointId) -> EntityInfo {
    if let Some(info) = graph.info(ep) {
        return info.clone();
    }
    if ep.is_group()
        && let Some(group) = graph.group(ep.id)
    {
        return group.info();
    }
    EntityInfo {
        endpoint: ep,
        policy: RoutePolicy::default(),
        channel: None,
        sched_key: None,
        global_id: None,
    }
}

fn matching_routes(graph: &RelationGraph, query: &RouteQuery) -> Vec<(RoutePair, RouteStatus)> {
    let keep = |src: EndpointId, dst: EndpointId| match query {
        RouteQuery::BySrc(s) => src == s.endpoint,
        RouteQuery::ByDst(d) => dst == d.endpoint,
        RouteQuery::BySrcDst(s, d) => src == s.endpoint && dst == d.endpoint,
        RouteQuery::All => true,
        RouteQuery::Group(_) => false,
    };
    graph
        .routes()
        .into_iter()
        .filter(|(src, dst, _)| keep(*src, *dst))
        .map(|(src, dst, status)| {
            (
                RoutePair::new(info_of(graph, src), info_of(graph, dst)),
                status,
            )
        })
        .collect()
}

fn handle_in_use(graph: &RelationGraph, handle: u64) -> bool {
    let uses = |info: &EntityInfo| info.channel.is_some_and(|c| c.comm_handle == handle);
    graph
        .routes()
        .into_iter()
        .any(|(src, dst, _)| uses(&info_of(graph, src)) || uses(&info_of(graph, dst)))
        || graph.groups().any(|g| g.members.iter().any(uses))
}
