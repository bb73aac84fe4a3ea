//! Message buffers.
//!
//! An mbuf is `[private header | data]`. The header is a fixed 64-byte
//! region holding the transaction id, a route label and the data length, all
//! little-endian. Buffers live in a [`BufferPool`]; the router only holds
//! [`Mbuf`] handles, and freeing consumes the handle.

use crate::driver::DriverError;

/// Size of the private header region.
pub const PRIVATE_HEADER_SIZE: usize = 64;

/// Owned handle to a pooled buffer. Not `Clone`: a second reference is a
/// separate handle obtained from [`BufferPool::copy_ref`].
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct Mbuf(u64);

impl Mbuf {
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn raw(&self) -> u64 {
        self.0
    }
}

/// Decoded private header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MbufHeader {
    pub trans_id: u64,
    pub route_label: u32,
    pub data_len: u32,
}

impl MbufHeader {
    #[must_use]
    pub fn encode(&self) -> [u8; PRIVATE_HEADER_SIZE] {
        let mut raw = [0u8; PRIVATE_HEADER_SIZE];
        raw[..8].copy_from_slice(&self.trans_id.to_le_bytes());
        raw[8..12].copy_from_slice(&self.route_label.to_le_bytes());
        raw[12..16].copy_from_slice(&self.data_len.to_le_bytes());
        raw
    }

    #[must_use]
    pub fn decode(raw: &[u8]) -> Option<Self> {
        let field = |range: std::ops::Range<usize>| raw.get(range);
        let trans_id = u64::from_le_bytes(field(0..8)?.try_into().ok()?);
        let route_label = u32::from_le_bytes(field(8..12)?.try_into().ok()?);
        let data_len = u32::from_le_bytes(field(12..16)?.try_into().ok()?);
        Some(Self {
            trans_id,
            route_label,
            data_len,
        })
    }
}

/// Reference-counted buffer memory.
pub trait BufferPool: Send + Sync {
    /// # Errors
    ///
    /// Returns [`DriverError::NoMemory`] when the pool is exhausted.
    fn alloc(&self, len: usize) -> Result<Mbuf, DriverError>;

    /// A new handle to the same memory.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::InvalidBuffer`] for a dead handle.
    fn copy_ref(&self, mbuf: &Mbuf) -> Result<Mbuf, DriverError>;

    /// Drops one reference. The memory is reclaimed with its last handle.
    fn free(&self, mbuf: Mbuf);

    /// # Errors
    ///
    /// Returns [`DriverError::InvalidBuffer`] for a dead handle or a range
    /// past the end.
    fn write(&self, mbuf: &Mbuf, offset: usize, bytes: &[u8]) -> Result<(), DriverError>;

    /// # Errors
    ///
    /// Returns [`DriverError::InvalidBuffer`] for a dead handle or a range
    /// past the end.
    fn read(&self, mbuf: &Mbuf, offset: usize, len: usize) -> Result<Vec<u8>, DriverError>;

    /// # Errors
    ///
    /// Returns [`DriverError::InvalidBuffer`] for a dead handle.
    fn len(&self, mbuf: &Mbuf) -> Result<usize, DriverError>;
}

/// Allocates a buffer holding `header` and `data`. The buffer is freed again
/// if filling it fails.
///
/// # Errors
///
/// Returns [`DriverError`] from the pool.
pub fn alloc_message(
    pool: &dyn BufferPool,
    trans_id: u64,
    data: &[u8],
) -> Result<Mbuf, DriverError> {
    let header = MbufHeader {
        trans_id,
        route_label: 0,
        data_len: u32::try_from(data.len()).map_err(|_| DriverError::NoMemory)?,
    };
    let mbuf = pool.alloc(PRIVATE_HEADER_SIZE + data.len())?;
    let filled = pool
        .write(&mbuf, 0, &header.encode())
        .and_then(|()| pool.write(&mbuf, PRIVATE_HEADER_SIZE, data));
    match filled {
        Ok(()) => Ok(mbuf),
        Err(err) => {
            pool.free(mbuf);
            Err(err)
        }
    }
}

/// # Errors
///
/// Returns [`DriverError::InvalidBuffer`] if the header cannot be read.
pub fn read_header(pool: &dyn BufferPool, mbuf: &Mbuf) -> Result<MbufHeader, DriverError> {
    let raw = pool.read(mbuf, 0, PRIVATE_HEADER_SIZE)?;
    MbufHeader::decode(&raw).ok_or(DriverError::InvalidBuffer)
}

/// # Errors
///
/// Returns [`DriverError::InvalidBuffer`] if the data region cannot be read.
pub fn read_data(pool: &dyn BufferPool, mbuf: &Mbuf) -> Result<Vec<u8>, DriverError> {
    let header = read_header(pool, mbuf)?;
    pool.read(mbuf, PRIVATE_HEADER_SIZE, header.data_len as usize)
}
