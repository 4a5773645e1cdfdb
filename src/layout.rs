//! Turning a flash layout into the blocks we ask the boot ROM for.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::Error;

/// `count` consecutive blocks of `size` bytes each.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Region {
    pub size: u32,
    pub count: u32,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Layout {
    /// Address of the first block.
    #[serde(default)]
    pub base: u32,
    pub regions: Vec<Region>,
}

/// An inclusive address range.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MemoryBlock {
    pub start: u32,
    pub end: u32,
}

impl MemoryBlock {
    pub fn len(&self) -> u64 {
        u64::from(self.end - self.start) + 1
    }
}

impl fmt::Display for MemoryBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}..={:#010x}", self.start, self.end)
    }
}

impl Layout {
    /// Total number of bytes covered.
    pub fn total_size(&self) -> u64 {
        self.regions
            .iter()
            .map(|r| u64::from(r.size) * u64::from(r.count))
            .sum()
    }

    /// The blocks in ascending address order. They abut, starting at `base`.
    pub fn blocks(&self) -> Result<Vec<MemoryBlock>, Error> {
        if self.regions.is_empty() {
            return Err(Error::Profile("memory layout has no regions".into()));
        }

        let mut blocks = vec![];
        let mut addr = u64::from(self.base);
        for region in &self.regions {
            if region.size == 0 || region.count == 0 {
                return Err(Error::Profile(
                    format!("empty region in layout: {region:?}").into(),
                ));
            }
            for _ in 0..region.count {
                let end = addr + u64::from(region.size) - 1;
                let (Ok(start), Ok(end)) = (u32::try_from(addr), u32::try_from(end)) else {
                    return Err(Error::Profile(
                        format!("layout runs past the 32-bit address space at {addr:#x}").into(),
                    ));
                };
                blocks.push(MemoryBlock { start, end });
                addr += u64::from(region.size);
            }
        }
        Ok(blocks)
    }
}
