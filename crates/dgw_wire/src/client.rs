//! Caller side of the config protocol.
//!
//! Builders size a buffer from the entries they are given and fill in every
//! record except the results; readers pull results back out once the router
//! has handled the buffer.

use dgw_entity::{EntityInfo, RoutePolicy};

use crate::error::WireError;
use crate::frame::{RoutePair, RouteQuery, count_u32, entries_header};
use crate::layout::{
    self, CfgRetInfo, CommHandleInfo, ConfigInfo, ConfigQuery, DynamicSchedConfig, Reader,
    RouteStatus, WireEndpoint, WireRoute, Writer,
};
use crate::sub_events::ConfigCmd;

// ── Update requests ─────────────────────────────────────────────────────────

/// # Errors
///
/// Returns [`WireError::CountOutOfRange`] if the route count overflows the
/// header.
pub fn bind_routes(routes: &[RoutePair]) -> Result<Vec<u8>, WireError> {
    routes_request(ConfigCmd::BindRoute, routes)
}

/// # Errors
///
/// Returns [`WireError::CountOutOfRange`] if the route count overflows the
/// header.
pub fn unbind_routes(routes: &[RoutePair]) -> Result<Vec<u8>, WireError> {
    routes_request(ConfigCmd::UnbindRoute, routes)
}

fn routes_request(cmd: ConfigCmd, routes: &[RoutePair]) -> Result<Vec<u8>, WireError> {
    let mut buf = vec![0u8; layout::routes_len(routes.len())];
    let mut w = Writer::at(&mut buf, 0);
    ConfigInfo {
        cmd: cmd.code(),
        num: count_u32(routes.len())?,
        ..ConfigInfo::default()
    }
    .write(&mut w)?;
    for pair in routes {
        WireRoute {
            src: WireEndpoint::from_info(&pair.src),
            dst: WireEndpoint::from_info(&pair.dst),
            status: 0,
        }
        .write(&mut w)?;
    }
    Ok(buf)
}

/// # Errors
///
/// Returns [`WireError::CountOutOfRange`] if the member count overflows the
/// header.
pub fn add_group(policy: RoutePolicy, members: &[EntityInfo]) -> Result<Vec<u8>, WireError> {
    let mut buf = vec![0u8; layout::add_group_len(members.len())];
    let mut w = Writer::at(&mut buf, 0);
    ConfigInfo {
        cmd: ConfigCmd::AddGroup.code(),
        num: count_u32(members.len())?,
        group_id: 0,
        aux: policy.code(),
    }
    .write(&mut w)?;
    for member in members {
        WireEndpoint::from_info(member).write(&mut w)?;
    }
    Ok(buf)
}

/// # Errors
///
/// Returns [`WireError::InvalidField`] if the id does not fit the header.
pub fn del_group(group_id: u32) -> Result<Vec<u8>, WireError> {
    let mut buf = vec![0u8; layout::DEL_GROUP_LEN];
    ConfigInfo {
        cmd: ConfigCmd::DelGroup.code(),
        group_id: i32::try_from(group_id).map_err(|_| WireError::InvalidField {
            field: "group_id",
            value: i64::from(group_id),
        })?,
        ..ConfigInfo::default()
    }
    .write(&mut Writer::at(&mut buf, 0))?;
    Ok(buf)
}

/// # Errors
///
/// Never fails for a well-formed config; the `Result` mirrors the other
/// builders.
pub fn init_dynamic_schedule(cfg: &DynamicSchedConfig) -> Result<Vec<u8>, WireError> {
    let mut buf = vec![0u8; layout::INIT_DYNAMIC_LEN];
    let mut w = Writer::at(&mut buf, 0);
    ConfigInfo {
        cmd: ConfigCmd::InitDynamicSchedule.code(),
        num: 1,
        ..ConfigInfo::default()
    }
    .write(&mut w)?;
    cfg.write(&mut w)?;
    Ok(buf)
}

/// # Errors
///
/// Returns [`WireError::CountOutOfRange`] if the key count overflows the
/// header.
pub fn stop_schedule(keys: &[u32]) -> Result<Vec<u8>, WireError> {
    sched_keys_request(ConfigCmd::StopSchedule, keys)
}

/// # Errors
///
/// Returns [`WireError::CountOutOfRange`] if the key count overflows the
/// header.
pub fn restart_schedule(keys: &[u32]) -> Result<Vec<u8>, WireError> {
    sched_keys_request(ConfigCmd::RestartSchedule, keys)
}

fn sched_keys_request(cmd: ConfigCmd, keys: &[u32]) -> Result<Vec<u8>, WireError> {
    let mut buf = vec![0u8; layout::sched_keys_len(keys.len())];
    let mut w = Writer::at(&mut buf, 0);
    ConfigInfo {
        cmd: cmd.code(),
        num: count_u32(keys.len())?,
        ..ConfigInfo::default()
    }
    .write(&mut w)?;
    for &key in keys {
        w.u32(key)?;
    }
    Ok(buf)
}

// ── Queries ─────────────────────────────────────────────────────────────────

/// # Errors
///
/// Returns [`WireError::InvalidField`] for a group id that does not fit.
pub fn query_count_request(query: &RouteQuery) -> Result<Vec<u8>, WireError> {
    let mut buf = vec![0u8; layout::QUERY_COUNT_LEN];
    query.to_record(0)?.write(&mut Writer::at(&mut buf, 0))?;
    Ok(buf)
}

/// Builds a query with room for exactly `expected` entries.
///
/// # Errors
///
/// Returns [`WireError::InvalidField`] for a group id that does not fit.
pub fn query_request(query: &RouteQuery, expected: usize) -> Result<Vec<u8>, WireError> {
    let len = match query {
        RouteQuery::Group(_) => layout::query_group_len(expected),
        _ => layout::query_routes_len(expected),
    };
    let mut buf = vec![0u8; len];
    let mut w = Writer::at(&mut buf, 0);
    query.to_record(expected)?.write(&mut w)?;
    entries_header(expected)?.write(&mut w)?;
    Ok(buf)
}

// ── Communication handles ───────────────────────────────────────────────────

/// # Errors
///
/// Returns [`WireError::CountOutOfRange`] if the name length overflows the
/// header.
pub fn create_comm_handle(rank_id: u32, name: &str) -> Result<Vec<u8>, WireError> {
    let mut buf = vec![0u8; layout::create_handle_len(name.len())];
    let mut w = Writer::at(&mut buf, 0);
    CommHandleInfo {
        handle: 0,
        rank_id,
        name_len: count_u32(name.len())?,
    }
    .write(&mut w)?;
    w.put(name.as_bytes())?;
    Ok(buf)
}

/// # Errors
///
/// Never fails; the `Result` mirrors the other builders.
pub fn destroy_comm_handle(handle: u64) -> Result<Vec<u8>, WireError> {
    let mut buf = vec![0u8; layout::DESTROY_HANDLE_LEN];
    CommHandleInfo {
        handle,
        ..CommHandleInfo::default()
    }
    .write(&mut Writer::at(&mut buf, 0))?;
    Ok(buf)
}

#[must_use]
pub fn link_status_request() -> Vec<u8> {
    vec![0u8; layout::LINK_STATUS_LEN]
}

// ── Result readers ──────────────────────────────────────────────────────────

/// Reads the trailing `n` result records.
///
/// # Errors
///
/// Returns [`WireError::Truncated`] if the buffer holds fewer records.
pub fn read_results(buf: &[u8], n: usize) -> Result<Vec<i32>, WireError> {
    let start = buf
        .len()
        .checked_sub(n * CfgRetInfo::SIZE)
        .ok_or(WireError::Truncated {
            needed: n * CfgRetInfo::SIZE,
            actual: buf.len(),
        })?;
    let mut r = Reader::at(buf, start);
    (0..n).map(|_| CfgRetInfo::read(&mut r)).collect()
}

/// Reads the single result record of a non-route request.
///
/// # Errors
///
/// Returns [`WireError::Truncated`] if the buffer is shorter than a record.
pub fn read_result(buf: &[u8]) -> Result<i32, WireError> {
    let start = buf
        .len()
        .checked_sub(CfgRetInfo::SIZE)
        .ok_or(WireError::Truncated {
            needed: CfgRetInfo::SIZE,
            actual: buf.len(),
        })?;
    CfgRetInfo::read(&mut Reader::at(buf, start))
}

/// Reads the group id assigned by an add-group request.
///
/// # Errors
///
/// Returns [`WireError::InvalidField`] if no id was assigned.
pub fn read_group_id(buf: &[u8]) -> Result<u32, WireError> {
    let raw = ConfigInfo::read(&mut Reader::at(buf, 0))?.group_id;
    u32::try_from(raw).map_err(|_| WireError::InvalidField {
        field: "group_id",
        value: i64::from(raw),
    })
}

/// # Errors
///
/// Returns [`WireError::Truncated`] if the buffer is not a query.
pub fn read_query_count(buf: &[u8]) -> Result<usize, WireError> {
    Ok(ConfigQuery::read(&mut Reader::at(buf, 0))?.num as usize)
}

/// # Errors
///
/// Returns a [`WireError`] if the buffer does not hold the routes it claims.
pub fn read_query_routes(buf: &[u8]) -> Result<Vec<(RoutePair, RouteStatus)>, WireError> {
    let mut r = Reader::at(buf, ConfigQuery::SIZE);
    let n = ConfigInfo::read(&mut r)?.num as usize;
    (0..n)
        .map(|_| {
            let route = WireRoute::read(&mut r)?;
            let status = RouteStatus::from_code(route.status).ok_or(WireError::InvalidField {
                field: "status",
                value: i64::from(route.status),
            })?;
            Ok((
                RoutePair::new(route.src.to_info()?, route.dst.to_info()?),
                status,
            ))
        })
        .collect()
}

/// # Errors
///
/// Returns a [`WireError`] if the buffer does not hold the members it claims.
pub fn read_query_endpoints(buf: &[u8]) -> Result<Vec<EntityInfo>, WireError> {
    let mut r = Reader::at(buf, ConfigQuery::SIZE);
    let n = ConfigInfo::read(&mut r)?.num as usize;
    (0..n)
        .map(|_| WireEndpoint::read(&mut r)?.to_info())
        .collect()
}

/// # Errors
///
/// Returns [`WireError::Truncated`] if the buffer is not a handle request.
pub fn read_comm_handle(buf: &[u8]) -> Result<u64, WireError> {
    Ok(CommHandleInfo::read(&mut Reader::at(buf, 0))?.handle)
}
