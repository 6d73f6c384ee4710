// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::descriptor::{
    BlockSize, FlashLayout, Region, RegionKind, VolumeDescriptor,
};
use crate::FvError;

/// Finds the block map for a volume.
///
/// Block sizes declared on the volume win. Otherwise we look for the flash
/// region that holds this volume and inherit the part of its flash device's
/// block map that covers the region.
///
/// `UnresolvedBlockSize` is a degraded outcome rather than a hard failure:
/// the control-file writer falls back to a 1-byte block, which the packer
/// accepts but which is almost never what a platform wants.
pub fn resolve(
    desc: &VolumeDescriptor,
    layout: &FlashLayout,
) -> Result<Vec<BlockSize>, FvError> {
    if !desc.block_sizes.is_empty() {
        return Ok(desc.block_sizes.clone());
    }

    for fd in &layout.devices {
        let regions = fd.regions.iter().filter(|r| r.kind == RegionKind::Fv);
        for region in regions {
            if !region.data.iter().any(|d| d.eq_ignore_ascii_case(&desc.name))
            {
                continue;
            }
            let blocks = region_blocks(region, &fd.block_sizes);
            if !blocks.is_empty() {
                log::debug!(
                    "FV {} inherits {} block group(s) from FD {}",
                    desc.name,
                    blocks.len(),
                    fd.name
                );
                return Ok(blocks);
            }
        }
    }

    Err(FvError::UnresolvedBlockSize {
        volume: desc.name.clone(),
    })
}

/// Carves the blocks covering `region` out of a flash device's block map.
///
/// A region that starts part-way through a group of blocks only gets the
/// whole blocks remaining in that group; the group in which the region ends
/// is rounded up so the region is fully covered.
pub fn region_blocks(
    region: &Region,
    fd_blocks: &[(u32, u32)],
) -> Vec<BlockSize> {
    let mut out = vec![];
    let mut start = 0u64;
    let mut remaining = region.size;
    let region_end = region.offset + region.size;

    for &(size, count) in fd_blocks {
        if size == 0 {
            continue;
        }
        let block = u64::from(size);
        let end = start + block * u64::from(count);

        if region.offset >= end {
            // region has not started yet
            start = end;
            continue;
        }

        if region_end <= end {
            out.push(BlockSize {
                size: Some(size),
                count: Some(remaining.div_ceil(block) as u32),
            });
            break;
        }

        let used = if region.offset <= start {
            u64::from(count)
        } else {
            (end - region.offset) / block
        };
        out.push(BlockSize {
            size: Some(size),
            count: Some(used as u32),
        });
        remaining = remaining.saturating_sub(block * used);
        start = end;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::FlashDevice;

    fn blocks(pairs: &[(u32, u32)]) -> Vec<BlockSize> {
        pairs
            .iter()
            .map(|&(s, c)| BlockSize {
                size: Some(s),
                count: Some(c),
            })
            .collect()
    }

    fn layout(fd_blocks: &[(u32, u32)], offset: u64, size: u64) -> FlashLayout {
        FlashLayout {
            devices: vec![FlashDevice {
                name: "OVMF".to_string(),
                block_sizes: fd_blocks.to_vec(),
                regions: vec![
                    Region {
                        offset: 0,
                        size: offset,
                        kind: RegionKind::Data,
                        data: vec!["FVMAIN".to_string()],
                    },
                    Region {
                        offset,
                        size,
                        kind: RegionKind::Fv,
                        data: vec!["FvMain".to_string()],
                    },
                ],
            }],
        }
    }

    #[test]
    fn inherits_from_enclosing_region() {
        let desc = VolumeDescriptor::new("FVMAIN");
        let layout = layout(&[(0x1000, 0x100)], 0x4000, 0xA000);
        assert_eq!(resolve(&desc, &layout).unwrap(), blocks(&[(0x1000, 10)]));
    }

    #[test]
    fn declared_blocks_win() {
        let mut desc = VolumeDescriptor::new("FVMAIN");
        desc.block_sizes = vec![BlockSize {
            size: Some(0x10000),
            count: None,
        }];
        let layout = layout(&[(0x1000, 0x100)], 0, 0xA000);
        assert_eq!(resolve(&desc, &layout).unwrap(), desc.block_sizes);
    }

    #[test]
    fn region_spanning_block_groups() {
        let region = Region {
            offset: 0x2000,
            size: 0x22000,
            kind: RegionKind::Fv,
            data: vec![],
        };
        assert_eq!(
            region_blocks(&region, &[(0x1000, 4), (0x10000, 4)]),
            blocks(&[(0x1000, 2), (0x10000, 2)])
        );
    }

    #[test]
    fn partial_last_block_rounds_up() {
        let region = Region {
            offset: 0,
            size: 0x1800,
            kind: RegionKind::Fv,
            data: vec![],
        };
        assert_eq!(
            region_blocks(&region, &[(0x1000, 8)]),
            blocks(&[(0x1000, 2)])
        );
    }

    #[test]
    fn unresolved() {
        let desc = VolumeDescriptor::new("FVRECOVERY");
        let layout = layout(&[(0x1000, 0x100)], 0, 0xA000);
        assert!(matches!(
            resolve(&desc, &layout),
            Err(FvError::UnresolvedBlockSize { volume }) if volume == "FVRECOVERY"
        ));
    }
}
