//! Fixed-size records of the config protocol.
//!
//! All integers are little-endian. A payload of `n` records is exactly
//! `n * SIZE` bytes with no delimiters, so every request layout is fully
//! determined by the counts in its header. The `*_len` functions give the
//! total buffer length of each request shape; the result record is always
//! last.

use dgw_entity::{ChannelDesc, EndpointId, EntityInfo, EntityType, RoutePolicy};

use crate::error::WireError;

/// Sentinel for an absent optional `u32` field.
pub const ABSENT: u32 = u32::MAX;

// ── Cursors ─────────────────────────────────────────────────────────────────

pub(crate) struct Reader<'b> {
    buf: &'b [u8],
    pos: usize,
}

impl<'b> Reader<'b> {
    pub(crate) const fn at(buf: &'b [u8], pos: usize) -> Self {
        Self { buf, pos }
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N], WireError> {
        let end = self.pos + N;
        let bytes = self.buf.get(self.pos..end).ok_or(WireError::Truncated {
            needed: end,
            actual: self.buf.len(),
        })?;
        let mut raw = [0u8; N];
        raw.copy_from_slice(bytes);
        self.pos = end;
        Ok(raw)
    }

    pub(crate) fn u32(&mut self) -> Result<u32, WireError> {
        self.take::<4>().map(u32::from_le_bytes)
    }

    pub(crate) fn i32(&mut self) -> Result<i32, WireError> {
        self.take::<4>().map(i32::from_le_bytes)
    }

    pub(crate) fn u64(&mut self) -> Result<u64, WireError> {
        self.take::<8>().map(u64::from_le_bytes)
    }

    pub(crate) fn bytes(&mut self, len: usize) -> Result<&'b [u8], WireError> {
        let end = self.pos + len;
        let bytes = self.buf.get(self.pos..end).ok_or(WireError::Truncated {
            needed: end,
            actual: self.buf.len(),
        })?;
        self.pos = end;
        Ok(bytes)
    }
}

pub(crate) struct Writer<'b> {
    buf: &'b mut [u8],
    pos: usize,
}

impl<'b> Writer<'b> {
    pub(crate) fn at(buf: &'b mut [u8], pos: usize) -> Self {
        Self { buf, pos }
    }

    pub(crate) fn put(&mut self, bytes: &[u8]) -> Result<(), WireError> {
        let end = self.pos + bytes.len();
        let actual = self.buf.len();
        let slot = self
            .buf
            .get_mut(self.pos..end)
            .ok_or(WireError::Truncated { needed: end, actual })?;
        slot.copy_from_slice(bytes);
        self.pos = end;
        Ok(())
    }

    pub(crate) fn u32(&mut self, value: u32) -> Result<(), WireError> {
        self.put(&value.to_le_bytes())
    }

    pub(crate) fn i32(&mut self, value: i32) -> Result<(), WireError> {
        self.put(&value.to_le_bytes())
    }

    pub(crate) fn u64(&mut self, value: u64) -> Result<(), WireError> {
        self.put(&value.to_le_bytes())
    }
}

// ── Records ─────────────────────────────────────────────────────────────────

/// Header of every update request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConfigInfo {
    pub cmd: u32,
    pub num: u32,
    pub group_id: i32,
    /// Group policy of an add-group request.
    pub aux: u32,
}

impl ConfigInfo {
    pub const SIZE: usize = 16;

    pub(crate) fn read(r: &mut Reader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            cmd: r.u32()?,
            num: r.u32()?,
            group_id: r.i32()?,
            aux: r.u32()?,
        })
    }

    pub(crate) fn write(&self, w: &mut Writer<'_>) -> Result<(), WireError> {
        w.u32(self.cmd)?;
        w.u32(self.num)?;
        w.i32(self.group_id)?;
        w.u32(self.aux)
    }
}

/// Wire form of an [`EntityInfo`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WireEndpoint {
    pub entity_type: u32,
    pub id: u32,
    pub resource_index: u32,
    pub global_id: u32,
    pub policy: u32,
    pub sched_key: u32,
    pub local_tag_id: u32,
    pub peer_tag_id: u32,
    pub local_rank_id: u32,
    pub peer_rank_id: u32,
    pub local_tag_depth: u32,
    pub peer_tag_depth: u32,
    pub comm_handle: u64,
}

impl WireEndpoint {
    pub const SIZE: usize = 56;

    pub(crate) fn read(r: &mut Reader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            entity_type: r.u32()?,
            id: r.u32()?,
            resource_index: r.u32()?,
            global_id: r.u32()?,
            policy: r.u32()?,
            sched_key: r.u32()?,
            local_tag_id: r.u32()?,
            peer_tag_id: r.u32()?,
            local_rank_id: r.u32()?,
            peer_rank_id: r.u32()?,
            local_tag_depth: r.u32()?,
            peer_tag_depth: r.u32()?,
            comm_handle: r.u64()?,
        })
    }

    pub(crate) fn write(&self, w: &mut Writer<'_>) -> Result<(), WireError> {
        for value in [
            self.entity_type,
            self.id,
            self.resource_index,
            self.global_id,
            self.policy,
            self.sched_key,
            self.local_tag_id,
            self.peer_tag_id,
            self.local_rank_id,
            self.peer_rank_id,
            self.local_tag_depth,
            self.peer_tag_depth,
        ] {
            w.u32(value)?;
        }
        w.u64(self.comm_handle)
    }

    #[must_use]
    pub fn from_info(info: &EntityInfo) -> Self {
        let channel = info.channel.unwrap_or_default();
        Self {
            entity_type: info.endpoint.entity_type.code(),
            id: info.endpoint.id,
            resource_index: info.endpoint.resource_index,
            global_id: info.global_id.unwrap_or(ABSENT),
            policy: info.policy.code(),
            sched_key: info.sched_key.unwrap_or(ABSENT),
            local_tag_id: channel.local_tag_id,
            peer_tag_id: channel.peer_tag_id,
            local_rank_id: channel.local_rank_id,
            peer_rank_id: channel.peer_rank_id,
            local_tag_depth: channel.local_tag_depth,
            peer_tag_depth: channel.peer_tag_depth,
            comm_handle: channel.comm_handle,
        }
    }

    /// Converts to an [`EntityInfo`]. Channel attributes are kept only for
    /// channel endpoints; they are not validated here.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::InvalidField`] for an unknown type or policy code.
    pub fn to_info(&self) -> Result<EntityInfo, WireError> {
        let entity_type =
            EntityType::from_code(self.entity_type).ok_or(WireError::InvalidField {
                field: "entity_type",
                value: i64::from(self.entity_type),
            })?;
        let policy = RoutePolicy::from_code(self.policy).ok_or(WireError::InvalidField {
            field: "policy",
            value: i64::from(self.policy),
        })?;
        let channel = matches!(entity_type, EntityType::Channel).then_some(ChannelDesc {
            comm_handle: self.comm_handle,
            local_tag_id: self.local_tag_id,
            peer_tag_id: self.peer_tag_id,
            local_rank_id: self.local_rank_id,
            peer_rank_id: self.peer_rank_id,
            local_tag_depth: self.local_tag_depth,
            peer_tag_depth: self.peer_tag_depth,
        });
        Ok(EntityInfo {
            endpoint: EndpointId::new(self.resource_index, entity_type, self.id),
            policy,
            channel,
            sched_key: present(self.sched_key),
            global_id: present(self.global_id),
        })
    }
}

const fn present(value: u32) -> Option<u32> {
    if value == ABSENT { None } else { Some(value) }
}

/// Whether a queried route is scheduled or quarantined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteStatus {
    Active,
    Abnormal,
}

impl RouteStatus {
    #[must_use]
    pub const fn code(self) -> u32 {
        match self {
            Self::Active => 1,
            Self::Abnormal => 2,
        }
    }

    #[must_use]
    pub const fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(Self::Active),
            2 => Some(Self::Abnormal),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WireRoute {
    pub src: WireEndpoint,
    pub dst: WireEndpoint,
    pub status: u32,
}

impl WireRoute {
    pub const SIZE: usize = 2 * WireEndpoint::SIZE + 8;

    pub(crate) fn read(r: &mut Reader<'_>) -> Result<Self, WireError> {
        let src = WireEndpoint::read(r)?;
        let dst = WireEndpoint::read(r)?;
        let status = r.u32()?;
        r.u32()?;
        Ok(Self { src, dst, status })
    }

    pub(crate) fn write(&self, w: &mut Writer<'_>) -> Result<(), WireError> {
        self.src.write(w)?;
        self.dst.write(w)?;
        w.u32(self.status)?;
        w.u32(0)
    }
}

/// Result record: one status code.
pub struct CfgRetInfo;

impl CfgRetInfo {
    pub const SIZE: usize = 8;

    pub(crate) fn read(r: &mut Reader<'_>) -> Result<i32, WireError> {
        let code = r.i32()?;
        r.u32()?;
        Ok(code)
    }

    pub(crate) fn write(code: i32, w: &mut Writer<'_>) -> Result<(), WireError> {
        w.i32(code)?;
        w.u32(0)
    }
}

/// Header of every query request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConfigQuery {
    pub mode: u32,
    pub num: u32,
    pub group_id: i32,
    pub src: WireEndpoint,
    pub dst: WireEndpoint,
}

impl ConfigQuery {
    pub const SIZE: usize = 16 + 2 * WireEndpoint::SIZE;

    pub(crate) fn read(r: &mut Reader<'_>) -> Result<Self, WireError> {
        let mode = r.u32()?;
        let num = r.u32()?;
        let group_id = r.i32()?;
        r.u32()?;
        Ok(Self {
            mode,
            num,
            group_id,
            src: WireEndpoint::read(r)?,
            dst: WireEndpoint::read(r)?,
        })
    }

    pub(crate) fn write(&self, w: &mut Writer<'_>) -> Result<(), WireError> {
        w.u32(self.mode)?;
        w.u32(self.num)?;
        w.i32(self.group_id)?;
        w.u32(0)?;
        self.src.write(w)?;
        self.dst.write(w)
    }
}

/// Request and response queues of one dynamic-schedule key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DynamicSchedConfig {
    pub sched_key: u32,
    pub request_queue_id: u32,
    pub request_resource: u32,
    pub response_queue_id: u32,
    pub response_resource: u32,
}

impl DynamicSchedConfig {
    pub const SIZE: usize = 24;

    #[must_use]
    pub const fn request_queue(&self) -> EndpointId {
        EndpointId::queue(self.request_resource, self.request_queue_id)
    }

    #[must_use]
    pub const fn response_queue(&self) -> EndpointId {
        EndpointId::queue(self.response_resource, self.response_queue_id)
    }

    pub(crate) fn read(r: &mut Reader<'_>) -> Result<Self, WireError> {
        let cfg = Self {
            sched_key: r.u32()?,
            request_queue_id: r.u32()?,
            request_resource: r.u32()?,
            response_queue_id: r.u32()?,
            response_resource: r.u32()?,
        };
        r.u32()?;
        Ok(cfg)
    }

    pub(crate) fn write(&self, w: &mut Writer<'_>) -> Result<(), WireError> {
        w.u32(self.sched_key)?;
        w.u32(self.request_queue_id)?;
        w.u32(self.request_resource)?;
        w.u32(self.response_queue_id)?;
        w.u32(self.response_resource)?;
        w.u32(0)
    }
}

/// Header of the communication-handle requests. The name bytes follow it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CommHandleInfo {
    pub handle: u64,
    pub rank_id: u32,
    pub name_len: u32,
}

impl CommHandleInfo {
    pub const SIZE: usize = 16;

    pub(crate) fn read(r: &mut Reader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            handle: r.u64()?,
            rank_id: r.u32()?,
            name_len: r.u32()?,
        })
    }

    pub(crate) fn write(&self, w: &mut Writer<'_>) -> Result<(), WireError> {
        w.u64(self.handle)?;
        w.u32(self.rank_id)?;
        w.u32(self.name_len)
    }
}

// ── Request lengths ─────────────────────────────────────────────────────────

#[must_use]
pub const fn routes_len(n: usize) -> usize {
    ConfigInfo::SIZE + n * (WireRoute::SIZE + CfgRetInfo::SIZE)
}

#[must_use]
pub const fn add_group_len(n: usize) -> usize {
    ConfigInfo::SIZE + n * WireEndpoint::SIZE + CfgRetInfo::SIZE
}

pub const DEL_GROUP_LEN: usize = ConfigInfo::SIZE + CfgRetInfo::SIZE;

pub const INIT_DYNAMIC_LEN: usize =
    ConfigInfo::SIZE + DynamicSchedConfig::SIZE + CfgRetInfo::SIZE;

#[must_use]
pub const fn sched_keys_len(n: usize) -> usize {
    ConfigInfo::SIZE + n * 4 + CfgRetInfo::SIZE
}

pub const QUERY_COUNT_LEN: usize = ConfigQuery::SIZE + CfgRetInfo::SIZE;

#[must_use]
pub const fn query_routes_len(n: usize) -> usize {
    ConfigQuery::SIZE + ConfigInfo::SIZE + n * WireRoute::SIZE + CfgRetInfo::SIZE
}

#[must_use]
pub const fn query_group_len(n: usize) -> usize {
    ConfigQuery::SIZE + ConfigInfo::SIZE + n * WireEndpoint::SIZE + CfgRetInfo::SIZE
}

#[must_use]
pub const fn create_handle_len(name_len: usize) -> usize {
    CommHandleInfo::SIZE + name_len + CfgRetInfo::SIZE
}

pub const DESTROY_HANDLE_LEN: usize = CommHandleInfo::SIZE + CfgRetInfo::SIZE;

pub const LINK_STATUS_LEN: usize = CfgRetInfo::SIZE;
