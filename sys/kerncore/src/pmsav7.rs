// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! ARMv7-M PMSAv7 MPU region encoding.
//!
//! The MPU has a handful of regions, each covering a naturally-aligned
//! power-of-two span with eight subregion-disable bits. A page directory of
//! up to eight leaf entries compresses into one region: the directory's base
//! and total order become the region base and size, each absent page sets
//! its subregion-disable bits, and the directory's uniform page flags become
//! the region attributes.
//!
//! The region table distinguishes *static* regions (pinned; the pages behind
//! them must always be resident in hardware) from *dynamic* ones (fault-
//! driven; evictable). Two slots are always held in reserve for dynamic use,
//! because LDRD/STRD may touch two regions in one instruction. Eviction
//! among dynamic regions is random, driven by a small LFSR.

/// Number of MPU regions on the supported parts. Parts with 16 regions work
/// too; we simply leave the rest unused.
pub const REGIONS: usize = 8;

/// Dynamic slots held in reserve when inserting a static region.
pub const DYNAMIC_RESERVE: usize = 2;

/// RBAR.VALID: the region field of this write is to be honored.
pub const RBAR_VALID: u32 = 1 << 4;

const RBAR_ADDR_MASK: u32 = !0x1F;

/// RASR.ENABLE.
pub const RASR_ENABLE: u32 = 1;

const RASR_SIZE_SHIFT: u32 = 1;
const RASR_SIZE_MASK: u32 = 0x1F << RASR_SIZE_SHIFT;
const RASR_SRD_SHIFT: u32 = 8;
const RASR_SRD_MASK: u32 = 0xFF << RASR_SRD_SHIFT;

/// Access permission encodings chosen such that privileged code (i.e. us)
/// always keeps access to the memory.
const RASR_AP_RW: u32 = 0b011 << 24;
const RASR_AP_RO: u32 = 0b010 << 24;
const RASR_XN: u32 = 1 << 28;
const RASR_C: u32 = 1 << 17;
const RASR_B: u32 = 1 << 16;

/// Page attributes relevant to the hardware encoding, pre-chewed so this
/// module needs no kernel types.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct PagePerm {
    pub write: bool,
    pub execute: bool,
    pub cacheable: bool,
    pub bufferable: bool,
}

/// One precomputed MPU region, in register image form. `repr(C)` and field
/// order match the RBAR/RASR register pair, so the whole table can be fed to
/// the alias registers with a block copy.
#[derive(Copy, Clone, Debug)]
#[repr(C)]
pub struct Region {
    pub rbar: u32,
    pub rasr: u32,
}

/// The auxiliary MPU state carried by a top-level page table.
#[derive(Clone, Debug)]
#[repr(C)]
pub struct RegionTable {
    /// Bit `i` set means region `i` is static.
    pub static_mask: u32,
    pub regions: [Region; REGIONS],
}

/// 32-bit Galois LFSR used for the random replacement policy. Cheap, local,
/// and plenty random for eviction purposes.
#[derive(Debug)]
pub struct Lfsr(u32);

impl Lfsr {
    pub const fn new() -> Self {
        Self(0xACE1_ACE1)
    }

    /// Rehydrates the generator from a previously captured state. A zero
    /// state would lock the generator; it is replaced by the seed.
    pub const fn from_state(state: u32) -> Self {
        if state == 0 {
            Self::new()
        } else {
            Self(state)
        }
    }

    pub const fn state(&self) -> u32 {
        self.0
    }

    pub fn next(&mut self) -> u32 {
        if self.0 & 1 != 0 {
            self.0 >>= 1;
            self.0 ^= 0xB400_B400;
        } else {
            self.0 >>= 1;
        }
        self.0
    }
}

impl Default for Lfsr {
    fn default() -> Self {
        Self::new()
    }
}

/// Computes the RASR image for a page directory.
///
/// `present` has one entry per directory slot (at most eight) and is true
/// where a leaf page is mapped. Returns 0 if no page is present — the
/// directory then has no hardware representation and should be cleared from
/// the region table instead.
///
/// `size_order` is the per-page order; together with `present.len()` it
/// determines the region size. The total order must fit the RASR size field
/// (32 bytes through 4 GiB).
pub fn gen_rasr(present: &[bool], perm: PagePerm, size_order: u32) -> u32 {
    assert!(present.len() <= 8 && present.len().is_power_of_two());
    let num_order = present.len().trailing_zeros();
    // Each directory slot spans this many of the eight subregions.
    let span: u32 = match num_order {
        0 => 0xFF,
        1 => 0x0F,
        2 => 0x03,
        3 => 0x01,
        _ => unreachable!(),
    };

    let mut sub = 0u32;
    for (i, p) in present.iter().enumerate() {
        if *p {
            sub |= span << (i as u32 * (1 << (3 - num_order)));
        }
    }
    if sub == 0 {
        return 0;
    }

    // Present subregions were accumulated as set bits; the hardware wants
    // disable bits for the absent ones.
    let mut rasr = RASR_SRD_MASK & !(sub << RASR_SRD_SHIFT);
    rasr |= RASR_ENABLE;
    if perm.write {
        rasr |= RASR_AP_RW;
    } else {
        // We do not care whether the read bit is set; the region is always
        // at least readable once it is enabled.
        rasr |= RASR_AP_RO;
    }
    if !perm.execute {
        rasr |= RASR_XN;
    }
    if perm.cacheable {
        rasr |= RASR_C;
    }
    if perm.bufferable {
        rasr |= RASR_B;
    }

    let total_order = size_order + num_order;
    debug_assert!((5..=32).contains(&total_order));
    rasr |= (total_order - 1) << RASR_SIZE_SHIFT;

    rasr
}

/// Extracts the total size order encoded in a RASR image.
pub fn rasr_order(rasr: u32) -> u32 {
    ((rasr & RASR_SIZE_MASK) >> RASR_SIZE_SHIFT) + 1
}

/// Extracts the base address of an RBAR image.
pub fn rbar_base(rbar: u32) -> u32 {
    rbar & RBAR_ADDR_MASK
}

impl RegionTable {
    /// Resets every region to disabled-but-numbered, so the whole table can
    /// be block-written to the hardware at any time.
    pub fn reset(&mut self) {
        self.static_mask = 0;
        for (i, r) in self.regions.iter_mut().enumerate() {
            r.rbar = RBAR_VALID | i as u32;
            r.rasr = 0;
        }
    }

    fn matches(&self, i: usize, base: u32, total_order: u32) -> bool {
        self.regions[i].rasr & RASR_ENABLE != 0
            && rbar_base(self.regions[i].rbar) == base
            && rasr_order(self.regions[i].rasr) == total_order
    }

    /// Removes the region covering `{base, total_order}`, if present. A miss
    /// is not an error; the directory may simply never have been resident.
    pub fn clear(&mut self, base: u32, total_order: u32) {
        for i in 0..REGIONS {
            if self.matches(i, base, total_order) {
                self.regions[i].rbar = RBAR_VALID | i as u32;
                self.regions[i].rasr = 0;
                self.static_mask &= !(1 << i);
                return;
            }
        }
    }

    /// Installs (or refreshes) the region for `{base, total_order}`.
    ///
    /// If a region with the same base and size is already resident it is
    /// updated in place, including its static marking. Otherwise an empty
    /// slot is preferred; failing that, a randomly chosen dynamic region is
    /// evicted. A static insert keeps `DYNAMIC_RESERVE` slots available for
    /// dynamic use and fails rather than eat into them; a dynamic insert
    /// fails only if there is neither an empty slot nor a dynamic victim.
    pub fn insert(
        &mut self,
        base: u32,
        total_order: u32,
        rasr: u32,
        is_static: bool,
        lfsr: &mut Lfsr,
    ) -> Result<(), ()> {
        let mut empty = [0usize; REGIONS];
        let mut empty_cnt = 0;
        let mut dynamic = [0usize; REGIONS];
        let mut dynamic_cnt = 0;

        for i in 0..REGIONS {
            if self.regions[i].rasr & RASR_ENABLE != 0 {
                if self.static_mask & (1 << i) == 0 {
                    dynamic[dynamic_cnt] = i;
                    dynamic_cnt += 1;
                }
                if self.matches(i, base, total_order) {
                    self.regions[i].rasr = rasr;
                    if is_static {
                        self.static_mask |= 1 << i;
                    } else {
                        self.static_mask &= !(1 << i);
                    }
                    return Ok(());
                }
            } else {
                empty[empty_cnt] = i;
                empty_cnt += 1;
            }
        }

        if is_static {
            if empty_cnt + dynamic_cnt < DYNAMIC_RESERVE + 1 {
                return Err(());
            }
        } else if empty_cnt + dynamic_cnt == 0 {
            return Err(());
        }

        let slot = if empty_cnt != 0 {
            empty[0]
        } else {
            dynamic[lfsr.next() as usize % dynamic_cnt]
        };

        self.regions[slot].rbar = (base & RBAR_ADDR_MASK) | RBAR_VALID | slot as u32;
        self.regions[slot].rasr = rasr;
        if is_static {
            self.static_mask |= 1 << slot;
        } else {
            self.static_mask &= !(1 << slot);
        }

        Ok(())
    }

    /// Counts enabled regions, for diagnostics and tests.
    pub fn resident(&self) -> usize {
        self.regions
            .iter()
            .filter(|r| r.rasr & RASR_ENABLE != 0)
            .count()
    }
}
