// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::fmt;
use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};
use zerocopy::byteorder::little_endian::{U16, U32, U64};
use zerocopy::FromBytes;

use crate::FvError;

/// Size of `EFI_FIRMWARE_VOLUME_HEADER` with a single block map entry
pub const FV_HEADER_LEN: usize = std::mem::size_of::<FvHeader>();

pub const FV_SIGNATURE: [u8; 4] = *b"_FVH";

/// Bits 16-20 of the attributes hold log2 of the volume alignment
const ALIGNMENT_SHIFT: u32 = 16;

/// `EFI_FIRMWARE_VOLUME_HEADER`, followed by one block map entry and the
/// zero entry that terminates the map.
#[derive(
    Copy,
    Clone,
    Debug,
    zerocopy_derive::FromBytes,
    zerocopy_derive::IntoBytes,
    zerocopy_derive::Immutable,
    zerocopy_derive::KnownLayout,
)]
#[repr(C)]
pub struct FvHeader {
    pub zero_vector: [u8; 16],
    pub file_system_guid: [u8; 16],
    pub fv_length: U64,
    pub signature: [u8; 4],
    pub attributes: U32,
    pub header_length: U16,
    pub checksum: U16,
    pub ext_header_offset: U16,
    pub reserved: u8,
    pub revision: u8,
    pub block_map: [BlockMapEntry; 2],
}

#[derive(
    Copy,
    Clone,
    Debug,
    zerocopy_derive::FromBytes,
    zerocopy_derive::IntoBytes,
    zerocopy_derive::Immutable,
    zerocopy_derive::KnownLayout,
)]
#[repr(C)]
pub struct BlockMapEntry {
    pub num_blocks: U32,
    pub length: U32,
}

impl FvHeader {
    pub fn alignment(&self) -> FvAlignment {
        let shift = (self.attributes.get() >> ALIGNMENT_SHIFT) & 0x1F;
        FvAlignment::from_bytes(1u32 << shift)
    }
}

/// Largest alignment an FFS file can express
const MAX_ALIGNMENT: u32 = 1 << 24;

/// Alignment of a packed volume, rendered the way control files and FFS
/// section attributes spell it (`64`, `4K`, `2M`, ...).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FvAlignment(u32);

impl FvAlignment {
    pub fn from_bytes(n: u32) -> Self {
        Self(n.min(MAX_ALIGNMENT))
    }

    pub fn bytes(self) -> u32 {
        self.0
    }
}

impl fmt::Display for FvAlignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            n if n >= MAX_ALIGNMENT => write!(f, "16M"),
            n if n >= 0x10_0000 => write!(f, "{}M", n / 0x10_0000),
            n if n >= 0x400 => write!(f, "{}K", n / 0x400),
            n => write!(f, "{n}"),
        }
    }
}

/// Reads and checks the header of a packed volume, returning its alignment.
pub fn read_alignment(path: &Path) -> Result<FvAlignment> {
    let mut header = Vec::with_capacity(FV_HEADER_LEN);
    std::fs::File::open(path)
        .and_then(|f| f.take(FV_HEADER_LEN as u64).read_to_end(&mut header))
        .with_context(|| format!("could not read {}", path.display()))?;
    Ok(check_header(path, &header)?)
}

fn check_header(path: &Path, header: &[u8]) -> Result<FvAlignment, FvError> {
    let bad = |reason: String| FvError::MalformedImage {
        path: path.to_path_buf(),
        reason,
    };
    let Ok((fvh, _)) = FvHeader::read_from_prefix(header) else {
        return Err(bad(format!(
            "only {:#x} bytes, shorter than a volume header",
            header.len()
        )));
    };
    if fvh.signature != FV_SIGNATURE {
        return Err(bad(format!("bad signature {:02x?}", fvh.signature)));
    }
    Ok(fvh.alignment())
}
