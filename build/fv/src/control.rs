// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The INI-style control file read by `GenFv`.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::descriptor::{BlockSize, VolumeDescriptor, USED_SIZE_ATTRIBUTE};
use crate::image::FvAlignment;

/// Contents of one control file. Rendered with `Display`.
#[derive(Clone, Debug)]
pub struct ControlFile<'a> {
    pub desc: &'a VolumeDescriptor,
    /// Base address after applying the volume's own override
    pub base_address: Option<u64>,
    /// Resolved block map. When empty, the packer is told to use 1-byte
    /// blocks.
    pub blocks: &'a [BlockSize],
    /// Known once the volume has been packed at least once
    pub alignment: Option<FvAlignment>,
    pub ext_header: Option<&'a Path>,
    pub vtf: Option<&'a Path>,
    pub files: &'a [PathBuf],
}

impl fmt::Display for ControlFile<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let desc = self.desc;

        writeln!(f, "[options]")?;
        if let Some(base) = self.base_address {
            writeln!(f, "EFI_BASE_ADDRESS = {}", hex(base))?;
        }
        if self.blocks.is_empty() {
            writeln!(f, "EFI_BLOCK_SIZE = 0x1")?;
        }
        for block in self.blocks {
            if let Some(size) = block.size {
                writeln!(f, "EFI_BLOCK_SIZE = {}", hex(size.into()))?;
            }
            if let Some(count) = block.count {
                writeln!(f, "EFI_NUM_BLOCKS = {}", hex(count.into()))?;
            }
        }
        if let Some(bs) = desc.bs_base_address {
            writeln!(f, "EFI_BOOT_DRIVER_BASE_ADDRESS = {}", hex(bs))?;
        }
        if let Some(rt) = desc.rt_base_address {
            writeln!(f, "EFI_RUNTIME_DRIVER_BASE_ADDRESS = {}", hex(rt))?;
        }

        writeln!(f, "[attributes]")?;
        writeln!(f, "EFI_ERASE_POLARITY = {}", desc.erase_polarity)?;
        for (name, value) in &desc.attributes {
            if name == USED_SIZE_ATTRIBUTE {
                continue;
            }
            writeln!(f, "EFI_{name} = {value}")?;
        }
        if let Some(align) = self.alignment {
            writeln!(f, "EFI_FVB2_ALIGNMENT_{align} = TRUE")?;
        }
        if let Some(ext) = self.ext_header {
            writeln!(f, "EFI_FV_EXT_HEADER_FILE_NAME = {}", ext.display())?;
        }

        writeln!(f, "[files]")?;
        if let Some(vtf) = self.vtf {
            writeln!(f, "EFI_FILE_NAME = {}", vtf.display())?;
        }
        for file in self.files {
            writeln!(f, "EFI_FILE_NAME = {}", file.display())?;
        }
        Ok(())
    }
}

/// `0x` followed by upper-case hex digits
fn hex(n: u64) -> String {
    format!("0x{n:X}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    #[test]
    fn inherited_blocks_one_module() {
        let desc = VolumeDescriptor::new("FVMAIN");
        let blocks = [BlockSize {
            size: Some(0x1000),
            count: Some(10),
        }];
        let files = [PathBuf::from("Ffs/PeiCore.ffs")];
        let control = ControlFile {
            desc: &desc,
            base_address: None,
            blocks: &blocks,
            alignment: None,
            ext_header: None,
            vtf: None,
            files: &files,
        };
        assert_eq!(
            control.to_string(),
            indoc! {"
                [options]
                EFI_BLOCK_SIZE = 0x1000
                EFI_NUM_BLOCKS = 0xA
                [attributes]
                EFI_ERASE_POLARITY = 1
                [files]
                EFI_FILE_NAME = Ffs/PeiCore.ffs
            "}
        );
    }

    #[test]
    fn everything() {
        let mut desc = VolumeDescriptor::new("DXEFV");
        desc.bs_base_address = Some(0x80_0000);
        desc.rt_base_address = Some(0x90_0000);
        desc.erase_polarity = 0;
        for (k, v) in [
            ("FVB2_ALIGNMENT_16", "TRUE"),
            (USED_SIZE_ATTRIBUTE, "TRUE"),
            ("LOCK_CAP", "TRUE"),
        ] {
            desc.attributes.insert(k.to_string(), v.to_string());
        }
        let blocks = [
            BlockSize {
                size: Some(0x10000),
                count: None,
            },
            BlockSize {
                size: None,
                count: Some(0x20),
            },
        ];
        let files = [PathBuf::from("a.ffs"), PathBuf::from("b.ffs")];
        let control = ControlFile {
            desc: &desc,
            base_address: Some(0xFFF0_0000),
            blocks: &blocks,
            alignment: Some(FvAlignment::from_bytes(0x10000)),
            ext_header: Some(Path::new("FV/DXEFV.ext")),
            vtf: Some(Path::new("Vtf.ffs")),
            files: &files,
        };
        assert_eq!(
            control.to_string(),
            indoc! {"
                [options]
                EFI_BASE_ADDRESS = 0xFFF00000
                EFI_BLOCK_SIZE = 0x10000
                EFI_NUM_BLOCKS = 0x20
                EFI_BOOT_DRIVER_BASE_ADDRESS = 0x800000
                EFI_RUNTIME_DRIVER_BASE_ADDRESS = 0x900000
                [attributes]
                EFI_ERASE_POLARITY = 0
                EFI_FVB2_ALIGNMENT_16 = TRUE
                EFI_LOCK_CAP = TRUE
                EFI_FVB2_ALIGNMENT_64K = TRUE
                EFI_FV_EXT_HEADER_FILE_NAME = FV/DXEFV.ext
                [files]
                EFI_FILE_NAME = Vtf.ffs
                EFI_FILE_NAME = a.ffs
                EFI_FILE_NAME = b.ffs
            "}
        );
    }

    #[test]
    fn unresolved_blocks_default_to_one_byte() {
        let desc = VolumeDescriptor::new("FVMAIN");
        let control = ControlFile {
            desc: &desc,
            base_address: None,
            blocks: &[],
            alignment: None,
            ext_header: None,
            vtf: None,
            files: &[],
        };
        assert!(control
            .to_string()
            .starts_with("[options]\nEFI_BLOCK_SIZE = 0x1\n"));
    }
}
