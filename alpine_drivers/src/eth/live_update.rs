//! Live-update state persistence.
//!
//! A reserved memory region carries link-manager state across a kernel
//! re-exec so the link does not flap: a region header followed by one
//! record per port, each guarded by magic, type, version, length and a
//! CRC32 computed with the CRC field itself zeroed. Validation fails
//! closed; anything that does not check out is treated as absent state.

use alloc::vec::Vec;

use crc::{Crc, CRC_32_ISO_HDLC};

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

pub const REGION_MAGIC: u32 = 0x6c75_7064; // "lupd"
pub const PORT_MAGIC: u32 = 0x6c75_7074; // "lupt"

pub const RECORD_TYPE_REGION: u16 = 1;
pub const RECORD_TYPE_PORT: u16 = 2;

/// Highest record version this build understands. Newer records are
/// rejected; older ones are accepted.
pub const RECORD_VERSION: u16 = 1;

// magic(4) type(2) version(2) length(4) crc(4) port_count(4)
const REGION_HDR_LEN: usize = 20;
// magic(4) type(2) version(2) length(4) crc(4)
const PORT_HDR_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistError {
    RegionTooSmall,
}

impl core::fmt::Display for PersistError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::RegionTooSmall => write!(f, "reserved region too small"),
        }
    }
}

fn put_u32(buf: &mut [u8], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

fn put_u16(buf: &mut [u8], off: usize, v: u16) {
    buf[off..off + 2].copy_from_slice(&v.to_le_bytes());
}

fn get_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

fn get_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([buf[off], buf[off + 1]])
}

/// CRC32 over `record` with the CRC field at `crc_off` read as zero.
fn record_crc(record: &[u8], crc_off: usize) -> u32 {
    let mut digest = CRC32.digest();
    digest.update(&record[..crc_off]);
    digest.update(&[0, 0, 0, 0]);
    digest.update(&record[crc_off + 4..]);
    digest.finalize()
}

/// Serialized size of a region holding the given port blobs.
pub fn region_size(ports: &[&[u8]]) -> usize {
    REGION_HDR_LEN + ports.iter().map(|p| PORT_HDR_LEN + p.len()).sum::<usize>()
}

/// Write one region with a record per port into `buf`. Returns the number
/// of bytes used.
pub fn save_region(buf: &mut [u8], ports: &[&[u8]]) -> Result<usize, PersistError> {
    let total = region_size(ports);
    if buf.len() < total {
        return Err(PersistError::RegionTooSmall);
    }

    let mut off = REGION_HDR_LEN;
    for port in ports {
        let rec_len = PORT_HDR_LEN + port.len();
        let rec = &mut buf[off..off + rec_len];

        put_u32(rec, 0, PORT_MAGIC);
        put_u16(rec, 4, RECORD_TYPE_PORT);
        put_u16(rec, 6, RECORD_VERSION);
        put_u32(rec, 8, rec_len as u32);
        put_u32(rec, 12, 0);
        rec[PORT_HDR_LEN..].copy_from_slice(port);

        let crc = record_crc(rec, 12);
        put_u32(rec, 12, crc);

        off += rec_len;
    }

    let region = &mut buf[..total];
    put_u32(region, 0, REGION_MAGIC);
    put_u16(region, 4, RECORD_TYPE_REGION);
    put_u16(region, 6, RECORD_VERSION);
    put_u32(region, 8, total as u32);
    put_u32(region, 12, 0);
    put_u32(region, 16, ports.len() as u32);

    let crc = record_crc(region, 12);
    put_u32(region, 12, crc);

    Ok(total)
}

/// Validate and read back a region written by [`save_region`].
///
/// Returns `None` when the region as a whole does not validate. A port
/// record that fails its own checks comes back as `None` in the vector:
/// its state is absent, the rest of the region is still usable.
pub fn load_region(buf: &[u8]) -> Option<Vec<Option<Vec<u8>>>> {
    if buf.len() < REGION_HDR_LEN {
        return None;
    }

    if get_u32(buf, 0) != REGION_MAGIC || get_u16(buf, 4) != RECORD_TYPE_REGION {
        return None;
    }

    if get_u16(buf, 6) > RECORD_VERSION {
        return None;
    }

    let total = get_u32(buf, 8) as usize;
    if total < REGION_HDR_LEN || total > buf.len() {
        return None;
    }

    let region = &buf[..total];
    if get_u32(region, 12) != record_crc(region, 12) {
        return None;
    }

    let port_count = get_u32(region, 16) as usize;

    let mut ports = Vec::new();
    let mut off = REGION_HDR_LEN;

    for _ in 0..port_count {
        if off + PORT_HDR_LEN > total {
            return None;
        }

        let rec_len = get_u32(region, off + 8) as usize;
        if rec_len < PORT_HDR_LEN || off + rec_len > total {
            return None;
        }

        let rec = &region[off..off + rec_len];
        off += rec_len;

        let valid = get_u32(rec, 0) == PORT_MAGIC
            && get_u16(rec, 4) == RECORD_TYPE_PORT
            && get_u16(rec, 6) <= RECORD_VERSION
            && get_u32(rec, 12) == record_crc(rec, 12);

        if valid {
            ports.push(Some(rec[PORT_HDR_LEN..].to_vec()));
        } else {
            ports.push(None);
        }
    }

    Some(ports)
}
