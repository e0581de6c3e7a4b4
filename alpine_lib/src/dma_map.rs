//! Device-visibility mapping for packet buffers.
//!
//! Allocating memory and making it reachable by the device are separate
//! steps that fail separately: a buffer can be obtained from the heap or
//! the DMA pool and still be rejected here because it violates the
//! device's addressing constraints. Callers are expected to account the
//! two failure classes independently.

use crate::{
    addr::{phy_addr::PhyAddr, virt_addr::VirtAddr, Addr},
    paging,
};

/// Addressing constraints of a DMA engine.
#[derive(Debug, Clone, Copy)]
pub struct DmaTag {
    /// Highest device-reachable address.
    pub boundary: u64,
    /// Maximum size of a single mapping.
    pub maxsize: usize,
    /// Required alignment of the mapped buffer, a power of two.
    pub alignment: usize,
}

impl DmaTag {
    pub fn new_32bit() -> Self {
        Self {
            boundary: 0xFFFF_FFFF,
            maxsize: 0xFFFF_FFFF,
            alignment: 1,
        }
    }

    pub fn new_64bit() -> Self {
        Self {
            boundary: u64::MAX,
            maxsize: usize::MAX,
            alignment: 1,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DmaSegment {
    pub ds_addr: PhyAddr,
    pub ds_len: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaMapError {
    AddressTooHigh,
    SizeTooLarge,
    BadAlignment,
    NotLoaded,
}

impl core::fmt::Display for DmaMapError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::AddressTooHigh => write!(f, "address exceeds the device's DMA boundary"),
            Self::SizeTooLarge => write!(f, "size exceeds the maximum mapping size"),
            Self::BadAlignment => write!(f, "buffer does not meet alignment requirements"),
            Self::NotLoaded => write!(f, "map is not loaded"),
        }
    }
}

#[derive(Debug)]
pub struct DmaMap {
    tag: DmaTag,
    segment: Option<DmaSegment>,
}

impl DmaMap {
    pub fn new(tag: DmaTag) -> Self {
        Self { tag, segment: None }
    }

    /// Make `size` bytes at `vaddr` visible to the device.
    pub fn load(&mut self, vaddr: VirtAddr, size: usize) -> Result<(), DmaMapError> {
        if size > self.tag.maxsize {
            return Err(DmaMapError::SizeTooLarge);
        }

        if self.tag.alignment > 1 && vaddr.as_usize() & (self.tag.alignment - 1) != 0 {
            return Err(DmaMapError::BadAlignment);
        }

        let paddr = paging::vm_to_phy(vaddr).ok_or(DmaMapError::AddressTooHigh)?;

        let end = paddr.as_usize() as u64 + size as u64 - 1;
        if end > self.tag.boundary {
            return Err(DmaMapError::AddressTooHigh);
        }

        self.segment = Some(DmaSegment {
            ds_addr: paddr,
            ds_len: size,
        });

        Ok(())
    }

    pub fn unload(&mut self) {
        self.segment = None;
    }

    pub fn is_loaded(&self) -> bool {
        self.segment.is_some()
    }

    pub fn segment(&self) -> Result<DmaSegment, DmaMapError> {
        self.segment.ok_or(DmaMapError::NotLoaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_unload() {
        let buf = [0u8; 64];
        let vaddr = VirtAddr::new(buf.as_ptr() as usize);

        let mut map = DmaMap::new(DmaTag::new_64bit());
        assert!(!map.is_loaded());

        map.load(vaddr, buf.len()).unwrap();
        let seg = map.segment().unwrap();
        assert_eq!(seg.ds_len, buf.len());

        map.unload();
        assert_eq!(map.segment().unwrap_err(), DmaMapError::NotLoaded);
    }

    #[test]
    fn test_mapping_failure_is_not_oom() {
        let buf = [0u8; 64];
        let vaddr = VirtAddr::new(buf.as_ptr() as usize);

        // A tag with a tiny maxsize rejects the mapping even though the
        // allocation itself succeeded.
        let tag = DmaTag {
            boundary: u64::MAX,
            maxsize: 16,
            alignment: 1,
        };
        let mut map = DmaMap::new(tag);
        assert_eq!(map.load(vaddr, buf.len()), Err(DmaMapError::SizeTooLarge));
    }
}
