//! Server-side view of a config buffer.
//!
//! [`ConfigFrame::parse`] validates the whole buffer against the counts it
//! declares before anything acts on it, so a malformed request never reaches
//! the bind graph. The frame then keeps the buffer to write results back in
//! place.

use dgw_entity::{EntityInfo, RoutePolicy};

use crate::error::WireError;
use crate::layout::{
    self, CfgRetInfo, CommHandleInfo, ConfigInfo, ConfigQuery, DynamicSchedConfig, Reader,
    RouteStatus, WireEndpoint, WireRoute, Writer,
};
use crate::sub_events::{
    ConfigCmd, MAX_COMM_NAME_LEN, MAX_GROUP_MEMBERS, MAX_ROUTES_NUM, QueryMode, SubEvent,
};

/// One route of a bind, unbind or query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutePair {
    pub src: EntityInfo,
    pub dst: EntityInfo,
}

impl RoutePair {
    #[must_use]
    pub const fn new(src: EntityInfo, dst: EntityInfo) -> Self {
        Self { src, dst }
    }
}

/// Selection of a route query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteQuery {
    BySrc(EntityInfo),
    ByDst(EntityInfo),
    BySrcDst(EntityInfo, EntityInfo),
    All,
    /// Members of the group with this id.
    Group(u32),
}

impl RouteQuery {
    #[must_use]
    pub const fn mode(&self) -> QueryMode {
        match self {
            Self::BySrc(_) => QueryMode::BySrc,
            Self::ByDst(_) => QueryMode::ByDst,
            Self::BySrcDst(..) => QueryMode::BySrcDst,
            Self::All => QueryMode::All,
            Self::Group(_) => QueryMode::Group,
        }
    }

    fn from_record(query: &ConfigQuery) -> Result<Self, WireError> {
        Ok(match QueryMode::from_code(query.mode)? {
            QueryMode::BySrc => Self::BySrc(query.src.to_info()?),
            QueryMode::ByDst => Self::ByDst(query.dst.to_info()?),
            QueryMode::BySrcDst => Self::BySrcDst(query.src.to_info()?, query.dst.to_info()?),
            QueryMode::All => Self::All,
            QueryMode::Group => Self::Group(group_id(query.group_id)?),
        })
    }

    pub(crate) fn to_record(&self, num: usize) -> Result<ConfigQuery, WireError> {
        let mut record = ConfigQuery {
            mode: self.mode().code(),
            num: count_u32(num)?,
            ..ConfigQuery::default()
        };
        match self {
            Self::BySrc(src) => record.src = WireEndpoint::from_info(src),
            Self::ByDst(dst) => record.dst = WireEndpoint::from_info(dst),
            Self::BySrcDst(src, dst) => {
                record.src = WireEndpoint::from_info(src);
                record.dst = WireEndpoint::from_info(dst);
            }
            Self::All => {}
            Self::Group(id) => record.group_id = group_id_i32(*id)?,
        }
        Ok(record)
    }
}

/// A decoded config request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigRequest {
    BindRoutes(Vec<RoutePair>),
    UnbindRoutes(Vec<RoutePair>),
    AddGroup {
        policy: RoutePolicy,
        members: Vec<EntityInfo>,
    },
    DelGroup {
        group_id: u32,
    },
    InitDynamicSchedule(DynamicSchedConfig),
    StopSchedule(Vec<u32>),
    RestartSchedule(Vec<u32>),
    QueryCount(RouteQuery),
    /// `expected` is the number of entries the caller reserved room for.
    Query {
        query: RouteQuery,
        expected: usize,
    },
    CreateCommHandle {
        rank_id: u32,
        name: String,
    },
    DestroyCommHandle {
        handle: u64,
    },
    QueryLinkStatus,
}

/// A validated config buffer with its result slots.
#[derive(Debug)]
pub struct ConfigFrame<'a> {
    buf: &'a mut [u8],
    request: ConfigRequest,
    results: usize,
}

impl<'a> ConfigFrame<'a> {
    /// Decodes `buf` as a request of `sub_event`.
    ///
    /// # Errors
    ///
    /// Returns a [`WireError`] when the code is unknown, a count is out of
    /// range, the length disagrees with the counts, or a field is invalid.
    pub fn parse(sub_event: u32, buf: &'a mut [u8]) -> Result<Self, WireError> {
        let data: &[u8] = buf;
        let (request, results) = match SubEvent::from_code(sub_event)? {
            SubEvent::UpdateConfig => parse_update(data)?,
            SubEvent::QueryConfigNum => {
                expect_len(data, layout::QUERY_COUNT_LEN)?;
                let record = ConfigQuery::read(&mut Reader::at(data, 0))?;
                (ConfigRequest::QueryCount(RouteQuery::from_record(&record)?), 1)
            }
            SubEvent::QueryConfig => {
                let record = ConfigQuery::read(&mut Reader::at(data, 0))?;
                let query = RouteQuery::from_record(&record)?;
                let expected = record.num as usize;
                let len = match query {
                    RouteQuery::Group(_) => layout::query_group_len(expected),
                    _ => layout::query_routes_len(expected),
                };
                expect_len(data, len)?;
                (ConfigRequest::Query { query, expected }, 1)
            }
            SubEvent::CreateCommHandle => {
                let mut r = Reader::at(data, 0);
                let info = CommHandleInfo::read(&mut r)?;
                let name_len = info.name_len as usize;
                if name_len == 0 || name_len > MAX_COMM_NAME_LEN {
                    return Err(WireError::InvalidField {
                        field: "name_len",
                        value: i64::from(info.name_len),
                    });
                }
                expect_len(data, layout::create_handle_len(name_len))?;
                let name = std::str::from_utf8(r.bytes(name_len)?)
                    .map_err(|_| WireError::InvalidField {
                        field: "name",
                        value: i64::from(info.name_len),
                    })?
                    .to_owned();
                let request = ConfigRequest::CreateCommHandle {
                    rank_id: info.rank_id,
                    name,
                };
                (request, 1)
            }
            SubEvent::DestroyCommHandle => {
                expect_len(data, layout::DESTROY_HANDLE_LEN)?;
                let info = CommHandleInfo::read(&mut Reader::at(data, 0))?;
                (ConfigRequest::DestroyCommHandle { handle: info.handle }, 1)
            }
            SubEvent::QueryLinkStatus => {
                expect_len(data, layout::LINK_STATUS_LEN)?;
                (ConfigRequest::QueryLinkStatus, 1)
            }
        };
        Ok(Self {
            buf,
            request,
            results,
        })
    }

    #[must_use]
    pub fn request(&self) -> &ConfigRequest {
        &self.request
    }

    /// Number of result records: one per route for bind and unbind, one
    /// otherwise.
    #[must_use]
    pub fn result_count(&self) -> usize {
        self.results
    }

    /// Writes one status per result record.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::LengthMismatch`] if `codes` does not provide
    /// exactly [`result_count`](Self::result_count) statuses.
    pub fn write_results(&mut self, codes: &[i32]) -> Result<(), WireError> {
        if codes.len() != self.results {
            return Err(WireError::LengthMismatch {
                expected: self.results,
                actual: codes.len(),
            });
        }
        let offset = self.buf.len() - self.results * CfgRetInfo::SIZE;
        let mut w = Writer::at(self.buf, offset);
        for &code in codes {
            CfgRetInfo::write(code, &mut w)?;
        }
        Ok(())
    }

    /// Writes the same status into every result record.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::Truncated`] only if the frame was corrupted.
    pub fn write_status(&mut self, code: i32) -> Result<(), WireError> {
        let codes = vec![code; self.results];
        self.write_results(&codes)
    }

    /// Writes an assigned group id back into the update header.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::InvalidField`] if the id does not fit the field.
    pub fn write_group_id(&mut self, id: u32) -> Result<(), WireError> {
        Writer::at(self.buf, 8).i32(group_id_i32(id)?)
    }

    /// Writes a match count back into the query header.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::CountOutOfRange`] if the count does not fit.
    pub fn write_query_count(&mut self, count: usize) -> Result<(), WireError> {
        Writer::at(self.buf, 4).u32(count_u32(count)?)
    }

    /// Writes the matching routes of a route query.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::LengthMismatch`] if the caller reserved room for a
    /// different number of routes.
    pub fn write_query_routes(&mut self, routes: &[(RoutePair, RouteStatus)]) -> Result<(), WireError> {
        self.expect_entries(routes.len())?;
        let mut w = Writer::at(self.buf, ConfigQuery::SIZE);
        entries_header(routes.len())?.write(&mut w)?;
        for (pair, status) in routes {
            WireRoute {
                src: WireEndpoint::from_info(&pair.src),
                dst: WireEndpoint::from_info(&pair.dst),
                status: status.code(),
            }
            .write(&mut w)?;
        }
        Ok(())
    }

    /// Writes the members of a group query.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::LengthMismatch`] if the caller reserved room for a
    /// different number of members.
    pub fn write_query_endpoints(&mut self, members: &[EntityInfo]) -> Result<(), WireError> {
        self.expect_entries(members.len())?;
        let mut w = Writer::at(self.buf, ConfigQuery::SIZE);
        entries_header(members.len())?.write(&mut w)?;
        for member in members {
            WireEndpoint::from_info(member).write(&mut w)?;
        }
        Ok(())
    }

    /// Writes a created communication handle back into the request header.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::Truncated`] only if the frame was corrupted.
    pub fn write_comm_handle(&mut self, handle: u64) -> Result<(), WireError> {
        Writer::at(self.buf, 0).u64(handle)
    }

    fn expect_entries(&self, actual: usize) -> Result<(), WireError> {
        match self.request {
            ConfigRequest::Query { expected, .. } if expected == actual => Ok(()),
            ConfigRequest::Query { expected, .. } => {
                Err(WireError::LengthMismatch { expected, actual })
            }
            _ => Err(WireError::LengthMismatch {
                expected: 0,
                actual,
            }),
        }
    }
}

fn parse_update(buf: &[u8]) -> Result<(ConfigRequest, usize), WireError> {
    let mut r = Reader::at(buf, 0);
    let info = ConfigInfo::read(&mut r)?;
    let n = info.num as usize;
    let cmd = ConfigCmd::from_code(info.cmd)?;
    match cmd {
        ConfigCmd::BindRoute | ConfigCmd::UnbindRoute => {
            check_count(n, MAX_ROUTES_NUM)?;
            expect_len(buf, layout::routes_len(n))?;
            let routes = (0..n)
                .map(|_| {
                    let route = WireRoute::read(&mut r)?;
                    Ok(RoutePair::new(route.src.to_info()?, route.dst.to_info()?))
                })
                .collect::<Result<Vec<_>, WireError>>()?;
            let request = if cmd == ConfigCmd::BindRoute {
                ConfigRequest::BindRoutes(routes)
            } else {
                ConfigRequest::UnbindRoutes(routes)
            };
            Ok((request, n))
        }
        ConfigCmd::AddGroup => {
            check_count(n, MAX_GROUP_MEMBERS)?;
            expect_len(buf, layout::add_group_len(n))?;
            let policy = RoutePolicy::from_code(info.aux).ok_or(WireError::InvalidField {
                field: "policy",
                value: i64::from(info.aux),
            })?;
            let members = (0..n)
                .map(|_| WireEndpoint::read(&mut r)?.to_info())
                .collect::<Result<Vec<_>, WireError>>()?;
            Ok((ConfigRequest::AddGroup { policy, members }, 1))
        }
        ConfigCmd::DelGroup => {
            expect_len(buf, layout::DEL_GROUP_LEN)?;
            let group_id = group_id(info.group_id)?;
            Ok((ConfigRequest::DelGroup { group_id }, 1))
        }
        ConfigCmd::InitDynamicSchedule => {
            expect_len(buf, layout::INIT_DYNAMIC_LEN)?;
            let cfg = DynamicSchedConfig::read(&mut r)?;
            Ok((ConfigRequest::InitDynamicSchedule(cfg), 1))
        }
        ConfigCmd::StopSchedule | ConfigCmd::RestartSchedule => {
            check_count(n, MAX_ROUTES_NUM)?;
            expect_len(buf, layout::sched_keys_len(n))?;
            let keys = (0..n).map(|_| r.u32()).collect::<Result<Vec<_>, _>>()?;
            let request = if cmd == ConfigCmd::StopSchedule {
                ConfigRequest::StopSchedule(keys)
            } else {
                ConfigRequest::RestartSchedule(keys)
            };
            Ok((request, 1))
        }
    }
}

fn expect_len(buf: &[u8], expected: usize) -> Result<(), WireError> {
    if buf.len() == expected {
        Ok(())
    } else {
        Err(WireError::LengthMismatch {
            expected,
            actual: buf.len(),
        })
    }
}

fn check_count(count: usize, max: usize) -> Result<(), WireError> {
    if count == 0 || count > max {
        return Err(WireError::CountOutOfRange { count, max });
    }
    Ok(())
}

fn group_id(raw: i32) -> Result<u32, WireError> {
    u32::try_from(raw)
        .ok()
        .filter(|id| *id != 0)
        .ok_or(WireError::InvalidField {
            field: "group_id",
            value: i64::from(raw),
        })
}

fn group_id_i32(id: u32) -> Result<i32, WireError> {
    i32::try_from(id).map_err(|_| WireError::InvalidField {
        field: "group_id",
        value: i64::from(id),
    })
}

pub(crate) fn count_u32(count: usize) -> Result<u32, WireError> {
    u32::try_from(count).map_err(|_| WireError::CountOutOfRange {
        count,
        max: u32::MAX as usize,
    })
}

pub(crate) fn entries_header(count: usize) -> Result<ConfigInfo, WireError> {
    Ok(ConfigInfo {
        num: count_u32(count)?,
        ..ConfigInfo::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client;
    use crate::sub_events::{QUERY_CONFIG, QUERY_CONFIG_NUM, UPDATE_CONFIG};

    fn route(src: u32, dst: u32) -> RoutePair {
        RoutePair::new(EntityInfo::queue(0, src), EntityInfo::queue(0, dst))
    }

    #[test]
    fn test_bind_request_decodes_every_route() {
        let mut buf = client::bind_routes(&[route(1, 2), route(3, 4)]).unwrap();
        let frame = ConfigFrame::parse(UPDATE_CONFIG, &mut buf).unwrap();
        assert_eq!(frame.result_count(), 2);
        match frame.request() {
            ConfigRequest::BindRoutes(routes) => {
                assert_eq!(routes[1], route(3, 4));
            }
            other => panic!("unexpected request {other:?}"),
        }
    }

    #[test]
    fn test_count_length_mismatch_rejected() {
        let mut buf = client::bind_routes(&[route(1, 2), route(3, 4)]).unwrap();
        // Claim three routes in a two-route buffer.
        buf[4] = 3;
        assert!(matches!(
            ConfigFrame::parse(UPDATE_CONFIG, &mut buf),
            Err(WireError::LengthMismatch { .. })
        ));
        buf[4] = 0;
        assert!(matches!(
            ConfigFrame::parse(UPDATE_CONFIG, &mut buf),
            Err(WireError::CountOutOfRange { count: 0, .. })
        ));
    }

    #[test]
    fn test_short_buffer_rejected() {
        let mut buf = vec![0u8; 10];
        assert!(matches!(
            ConfigFrame::parse(UPDATE_CONFIG, &mut buf),
            Err(WireError::Truncated { .. })
        ));
        assert!(matches!(
            ConfigFrame::parse(QUERY_CONFIG, &mut buf),
            Err(WireError::Truncated { .. })
        ));
    }

    #[test]
    fn test_results_written_in_place() {
        let mut buf = client::unbind_routes(&[route(1, 2), route(3, 4)]).unwrap();
        {
            let mut frame = ConfigFrame::parse(UPDATE_CONFIG, &mut buf).unwrap();
            assert!(frame.write_results(&[0]).is_err());
            frame.write_results(&[0, 6]).unwrap();
        }
        assert_eq!(client::read_results(&buf, 2).unwrap(), vec![0, 6]);
    }

    #[test]
    fn test_add_group_policy_and_id_writeback() {
        let members = [EntityInfo::queue(0, 5), EntityInfo::queue(0, 6)];
        let mut buf = client::add_group(RoutePolicy::Broadcast, &members).unwrap();
        {
            let mut frame = ConfigFrame::parse(UPDATE_CONFIG, &mut buf).unwrap();
            assert!(matches!(
                frame.request(),
                ConfigRequest::AddGroup { policy: RoutePolicy::Broadcast, members } if members.len() == 2
            ));
            frame.write_group_id(7).unwrap();
            frame.write_status(0).unwrap();
        }
        assert_eq!(client::read_group_id(&buf).unwrap(), 7);
        assert_eq!(client::read_result(&buf).unwrap(), 0);
    }

    #[test]
    fn test_delete_group_zero_id_rejected() {
        let mut buf = client::del_group(1).unwrap();
        buf[8..12].copy_from_slice(&0i32.to_le_bytes());
        assert!(matches!(
            ConfigFrame::parse(UPDATE_CONFIG, &mut buf),
            Err(WireError::InvalidField {
                field: "group_id",
                ..
            })
        ));
    }

    #[test]
    fn test_query_routes_written_back() {
        let query = RouteQuery::BySrc(EntityInfo::queue(0, 1));
        let mut buf = client::query_request(&query, 1).unwrap();
        {
            let mut frame = ConfigFrame::parse(QUERY_CONFIG, &mut buf).unwrap();
            assert!(frame.write_query_routes(&[]).is_err());
            frame
                .write_query_routes(&[(route(1, 2), RouteStatus::Abnormal)])
                .unwrap();
            frame.write_status(0).unwrap();
        }
        let routes = client::read_query_routes(&buf).unwrap();
        assert_eq!(routes, vec![(route(1, 2), RouteStatus::Abnormal)]);
    }

    #[test]
    fn test_query_count_written_back() {
        let mut buf = client::query_count_request(&RouteQuery::All).unwrap();
        {
            let mut frame = ConfigFrame::parse(QUERY_CONFIG_NUM, &mut buf).unwrap();
            assert_eq!(frame.request(), &ConfigRequest::QueryCount(RouteQuery::All));
            frame.write_query_count(12).unwrap();
        }
        assert_eq!(client::read_query_count(&buf).unwrap(), 12);
    }

    #[test]
    fn test_comm_handle_name_decoded() {
        let mut buf = client::create_comm_handle(3, "hccl-world").unwrap();
        let frame = ConfigFrame::parse(crate::sub_events::CREATE_COMM_HANDLE, &mut buf).unwrap();
        assert_eq!(
            frame.request(),
            &ConfigRequest::CreateCommHandle {
                rank_id: 3,
                name: "hccl-world".to_string()
            }
        );
    }

    #[test]
    fn test_unknown_sub_event_rejected() {
        let mut buf = vec![0u8; 8];
        assert!(matches!(
            ConfigFrame::parse(42, &mut buf),
            Err(WireError::UnknownSubEvent(42))
        ));
    }
}
