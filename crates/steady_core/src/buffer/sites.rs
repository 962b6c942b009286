//! Host locations that mirror the buffer's base, end or capacity

use std::mem;
use std::ptr;
use steady_env::{MemoryProtector, ProtectError, Region};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SiteKind {
    /// Holds the storage base address (pointer-width).
    Base,
    /// Holds one-past-the-last-slot address (pointer-width).
    End,
    /// Holds the slot capacity (32-bit).
    Capacity,
}

/// One location to rewrite after every relocation.
///
/// Sites usually sit inside instruction encodings, so they are read and
/// written unaligned. `displacement` is added to the value written, for code
/// that addresses a field inside the array or compares against `capacity - 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DependentSite {
    pub kind: SiteKind,
    pub address: usize,
    pub displacement: isize,
}

impl DependentSite {
    pub fn new(kind: SiteKind, address: usize) -> Self {
        Self {
            kind,
            address,
            displacement: 0,
        }
    }

    pub fn base(address: usize) -> Self {
        Self::new(SiteKind::Base, address)
    }

    pub fn end(address: usize) -> Self {
        Self::new(SiteKind::End, address)
    }

    pub fn capacity(address: usize) -> Self {
        Self::new(SiteKind::Capacity, address)
    }

    pub fn with_displacement(mut self, displacement: isize) -> Self {
        self.displacement = displacement;
        self
    }

    #[inline]
    pub fn width(&self) -> usize {
        match self.kind {
            SiteKind::Base | SiteKind::End => mem::size_of::<usize>(),
            SiteKind::Capacity => mem::size_of::<u32>(),
        }
    }

    #[inline]
    pub fn region(&self) -> Region {
        Region::new(self.address, self.width())
    }

    /// Value this site must hold for storage at `base` with `capacity` slots.
    pub fn expected(&self, base: usize, capacity: usize, stride: usize) -> usize {
        let raw = match self.kind {
            SiteKind::Base => base,
            SiteKind::End => base + capacity * stride,
            SiteKind::Capacity => capacity,
        };
        let value = raw.wrapping_add_signed(self.displacement);
        match self.kind {
            SiteKind::Capacity => value as u32 as usize,
            _ => value,
        }
    }

    /// # Safety
    ///
    /// `address` must be readable for `width()` bytes.
    pub unsafe fn read(&self) -> usize {
        match self.kind {
            SiteKind::Base | SiteKind::End => ptr::read_unaligned(self.address as *const usize),
            SiteKind::Capacity => ptr::read_unaligned(self.address as *const u32) as usize,
        }
    }

    /// # Safety
    ///
    /// `address` must be writable for `width()` bytes.
    unsafe fn write(&self, value: usize) {
        match self.kind {
            SiteKind::Base | SiteKind::End => {
                ptr::write_unaligned(self.address as *mut usize, value)
            }
            SiteKind::Capacity => ptr::write_unaligned(self.address as *mut u32, value as u32),
        }
    }
}

/// Every dependent site, fixed at install time.
#[derive(Debug, Default, Clone)]
pub struct SiteRegistry {
    sites: Vec<DependentSite>,
}

impl SiteRegistry {
    pub fn new() -> Self {
        Self { sites: Vec::new() }
    }

    pub(crate) fn len(&self) -> usize {
        self.sites.len()
    }

    /// First site whose current value disagrees with the given storage.
    ///
    /// # Safety
    ///
    /// Every site must be readable.
    pub unsafe fn find_stale(
        &self,
        base: usize,
        capacity: usize,
        stride: usize,
    ) -> Option<(DependentSite, usize)> {
        self.sites.iter().find_map(|site| {
            let found = site.read();
            (found != site.expected(base, capacity, stride)).then_some((*site, found))
        })
    }

    /// Lift protection on every page holding a site.
    ///
    /// A page shared by several sites is unprotected once, so its guard
    /// records the page's real protection. Either all guards are returned or
    /// none are held.
    pub fn unlock<P: MemoryProtector>(&self, protector: &P) -> Result<Vec<P::Guard>, ProtectError> {
        self.pages(protector.page_size())
            .into_iter()
            .map(|page| protector.unprotect(page))
            .collect()
    }

    /// Distinct pages touched by any site, in address order.
    fn pages(&self, page_size: usize) -> Vec<Region> {
        let mut starts: Vec<usize> = self
            .sites
            .iter()
            .flat_map(|site| {
                let span = site.region().page_span(page_size);
                (span.address..span.end()).step_by(page_size)
            })
            .collect();
        starts.sort_unstable();
        starts.dedup();
        starts
            .into_iter()
            .map(|address| Region::new(address, page_size))
            .collect()
    }

    /// Point every site at the given storage.
    ///
    /// # Safety
    ///
    /// Every site must currently be writable (see [`SiteRegistry::unlock`]).
    pub unsafe fn write_all(&self, base: usize, capacity: usize, stride: usize) {
        for site in &self.sites {
            site.write(site.expected(base, capacity, stride));
        }
    }
}

impl FromIterator<DependentSite> for SiteRegistry {
    fn from_iter<I: IntoIterator<Item = DependentSite>>(iter: I) -> Self {
        Self {
            sites: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use steady_env::NoProtection;

    /// Records every region it is asked to unprotect.
    #[derive(Default)]
    struct RecordingProtector {
        unprotected: RefCell<Vec<Region>>,
    }

    impl MemoryProtector for RecordingProtector {
        type Guard = ();

        fn page_size(&self) -> usize {
            0x1000
        }

        fn unprotect(&self, region: Region) -> Result<(), ProtectError> {
            self.unprotected.borrow_mut().push(region);
            Ok(())
        }
    }

    #[test]
    fn sites_sharing_a_page_unlock_it_once() {
        let registry: SiteRegistry = [
            DependentSite::capacity(0x1010),
            DependentSite::base(0x1000),
            DependentSite::end(0x1800),
            // Straddles into the next page.
            DependentSite::base(0x2ffe),
        ]
        .into_iter()
        .collect();

        let protector = RecordingProtector::default();
        let guards = registry.unlock(&protector).unwrap();
        assert_eq!(guards.len(), 3);
        assert_eq!(
            *protector.unprotected.borrow(),
            vec![
                Region::new(0x1000, 0x1000),
                Region::new(0x2000, 0x1000),
                Region::new(0x3000, 0x1000),
            ]
        );
    }

    #[test]
    fn expected_values_per_kind() {
        let base = 0x1000;
        assert_eq!(DependentSite::base(0).expected(base, 8, 16), 0x1000);
        assert_eq!(DependentSite::end(0).expected(base, 8, 16), 0x1080);
        assert_eq!(DependentSite::capacity(0).expected(base, 8, 16), 8);
    }

    #[test]
    fn displacement_is_applied() {
        let field = DependentSite::base(0).with_displacement(4);
        assert_eq!(field.expected(0x1000, 8, 16), 0x1004);
        let last_index = DependentSite::capacity(0).with_displacement(-1);
        assert_eq!(last_index.expected(0x1000, 8, 16), 7);
    }

    #[test]
    fn writes_land_unaligned_inside_code_bytes() {
        // Simulated instruction stream with immediates at odd offsets.
        let mut code = [0xCCu8; 32];
        let at = code.as_mut_ptr() as usize;
        let base_at = at + 1;
        let cap_at = at + 3 + mem::size_of::<usize>();
        let registry: SiteRegistry =
            [DependentSite::base(base_at), DependentSite::capacity(cap_at)].into_iter().collect();

        let _guards = registry.unlock(&NoProtection).unwrap();
        unsafe { registry.write_all(0xDEAD_0000, 2048, 4) };

        assert_eq!(code[0], 0xCC);
        assert_eq!(unsafe { DependentSite::base(base_at).read() }, 0xDEAD_0000);
        assert_eq!(unsafe { DependentSite::capacity(cap_at).read() }, 2048);
        assert!(unsafe { registry.find_stale(0xDEAD_0000, 2048, 4) }.is_none());
        assert_eq!(
            unsafe { registry.find_stale(0xBEEF_0000, 2048, 4) }.map(|(s, _)| s.kind),
            Some(SiteKind::Base)
        );
    }
}
