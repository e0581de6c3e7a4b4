use crate::addr::{phy_addr::PhyAddr, virt_addr::VirtAddr, Addr};

pub const PAGESIZE: usize = 4096;

/// Translate a virtual address to the address the device sees.
///
/// The driver only ever hands the device memory obtained from the DMA pool,
/// which the platform maps one-to-one, so the translation is the identity.
/// Platforms with an IOMMU interpose at the DMA-map layer instead.
#[inline(always)]
pub fn vm_to_phy(virt_addr: VirtAddr) -> Option<PhyAddr> {
    Some(PhyAddr::new(virt_addr.as_usize()))
}
