// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Firmware volume extension header (`EFI_FIRMWARE_VOLUME_EXT_HEADER`).
//!
//! Layout:
//!
//! ```text
//! +----------------+-----------------+---------+---------+-----
//! | FvName (GUID)  | ExtHeaderSize   | entry 0 | entry 1 | ...
//! | 16 bytes       | u32, LE         |         |         |
//! +----------------+-----------------+---------+---------+-----
//! ```
//!
//! and every entry is `{ u16 size; u16 type; body }` where `size` counts the
//! four header bytes as well as the body.

use std::path::Path;

use anyhow::{Context, Result};
use zerocopy::byteorder::little_endian::{U16, U32};
use zerocopy::IntoBytes;

use crate::descriptor::{ExtPayload, VolumeDescriptor};
use crate::guid::{Guid, FV_UI_EXT_ENTRY_GUID};
use crate::FvError;

pub const EXT_TYPE_OEM: u16 = 0x0001;
pub const EXT_TYPE_GUID: u16 = 0x0002;
pub const EXT_TYPE_USED_SIZE: u16 = 0x0003;

/// Name GUID plus the 32-bit total size
pub const EXT_HEADER_PREFIX_LEN: u32 =
    std::mem::size_of::<ExtHeaderPrefix>() as u32;

const ENTRY_HEADER_LEN: usize = std::mem::size_of::<EntryHeader>();

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
pub struct ExtHeaderPrefix {
    pub fv_name: [u8; 16],
    pub ext_header_size: U32,
}

/// `EFI_FIRMWARE_VOLUME_EXT_ENTRY`; `size` includes these four bytes.
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
pub struct EntryHeader {
    pub size: U16,
    pub ty: U16,
}

/// File and data entries must be smaller than this
const MAX_ENTRY_BODY: usize = 0x10000;

/// Returned by [`ExtHeader::push`] with the offending body length
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct EntryTooLarge(pub usize);

/// Length-prefixed record builder for the extension header.
///
/// Entries can only be added through [`ExtHeader::push`], which keeps the
/// running total in step with the encoded entries, so
/// `total_size() == 20 + sum(entry sizes)` always holds.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExtHeader {
    name: Guid,
    entries: Vec<u8>,
    count: usize,
}

impl ExtHeader {
    pub fn new(name: Guid) -> Self {
        Self {
            name,
            entries: Vec::new(),
            count: 0,
        }
    }

    pub fn push(&mut self, ty: u16, body: &[u8]) -> Result<(), EntryTooLarge> {
        let size = u16::try_from(body.len() + ENTRY_HEADER_LEN)
            .map_err(|_| EntryTooLarge(body.len()))?;
        let entry = EntryHeader {
            size: U16::new(size),
            ty: U16::new(ty),
        };
        self.entries.extend_from_slice(entry.as_bytes());
        self.entries.extend_from_slice(body);
        self.count += 1;
        Ok(())
    }

    pub fn name(&self) -> Guid {
        self.name
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn total_size(&self) -> u32 {
        // Each entry is at most 0xFFFF bytes, so overflowing a u32 would
        // take more than 65536 entries.
        EXT_HEADER_PREFIX_LEN + self.entries.len() as u32
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let total = self.total_size();
        let mut out = Vec::with_capacity(total as usize);
        let prefix = ExtHeaderPrefix {
            fv_name: self.name.to_bytes(),
            ext_header_size: U32::new(total),
        };
        out.extend_from_slice(prefix.as_bytes());
        out.extend_from_slice(&self.entries);
        out
    }
}

/// Builds the extension header requested by `desc`.
///
/// Returns `None` when the volume asks for no extension content at all, in
/// which case no `.ext` file should exist or be referenced.
pub fn build(
    desc: &VolumeDescriptor,
    workspace: &Path,
) -> Result<Option<ExtHeader>> {
    let used_size = desc.used_size_enabled();

    let Some(name_guid) = desc.name_guid else {
        if !desc.ext_entries.is_empty() || used_size {
            return Err(FvError::MissingNameGuid {
                volume: desc.name.clone(),
            }
            .into());
        }
        return Ok(None);
    };

    let too_large =
        |what: String, size: usize| FvError::ExtensionEntryTooLarge {
            volume: desc.name.clone(),
            what,
            size,
        };

    let mut header = ExtHeader::new(name_guid);

    if used_size {
        // The used size itself is patched in once the volume is complete.
        header
            .push(EXT_TYPE_USED_SIZE, U32::new(0).as_bytes())
            .map_err(|e| too_large("used size".into(), e.0))?;
    }

    if desc.name_string {
        let mut body = FV_UI_EXT_ENTRY_GUID.to_bytes().to_vec();
        body.extend_from_slice(desc.name.as_bytes());
        header
            .push(EXT_TYPE_GUID, &body)
            .map_err(|e| too_large("UI name".into(), e.0))?;
    }

    for entry in &desc.ext_entries {
        match &entry.payload {
            ExtPayload::File(p) => {
                let path = if p.is_absolute() {
                    p.clone()
                } else {
                    workspace.join(p)
                };
                if !path.is_file() {
                    return Err(FvError::MissingExtensionFile {
                        volume: desc.name.clone(),
                        path,
                    }
                    .into());
                }
                let data = std::fs::read(&path).with_context(|| {
                    format!("could not read {}", path.display())
                })?;
                let what = format!("file {}", path.display());
                if data.len() >= MAX_ENTRY_BODY {
                    return Err(too_large(what, data.len()).into());
                }
                header
                    .push(entry.type_value, &data)
                    .map_err(|e| too_large(what, e.0))?;
            }
            ExtPayload::Data(list) => {
                let what = format!("data '{}'", list);
                let count = list.split(',').count();
                if count >= MAX_ENTRY_BODY {
                    return Err(too_large(what, count).into());
                }
                let data = parse_byte_list(&desc.name, list)?;
                header
                    .push(entry.type_value, &data)
                    .map_err(|e| too_large(what, e.0))?;
            }
        }
    }

    Ok(if header.is_empty() { None } else { Some(header) })
}

/// Parses `"0x01, 0x02, ff"` into bytes.
fn parse_byte_list(volume: &str, list: &str) -> Result<Vec<u8>, FvError> {
    list.split(',')
        .map(|item| {
            let t = item.trim();
            let digits = t
                .strip_prefix("0x")
                .or_else(|| t.strip_prefix("0X"))
                .unwrap_or(t);
            u8::from_str_radix(digits, 16).map_err(|_| {
                FvError::MalformedExtensionData {
                    volume: volume.to_string(),
                    item: t.to_string(),
                }
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::ExtEntry;
    use zerocopy::FromBytes;

    const NAME: &str = "7CB8BDC9-F8EB-4F34-AAEA-3EE4AF6516A1";

    /// Walks the encoded entries, returning `(size, type)` for each.
    fn entries(bytes: &[u8]) -> Vec<(u16, u16)> {
        let mut out = vec![];
        let mut pos = EXT_HEADER_PREFIX_LEN as usize;
        while pos < bytes.len() {
            let (entry, _) = EntryHeader::read_from_prefix(&bytes[pos..])
                .expect("truncated entry header");
            out.push((entry.size.get(), entry.ty.get()));
            pos += entry.size.get() as usize;
        }
        assert_eq!(pos, bytes.len(), "entries overran the header");
        out
    }

    #[track_caller]
    fn check_size_invariant(header: &ExtHeader) {
        let bytes = header.to_bytes();
        let (prefix, _) = ExtHeaderPrefix::read_from_prefix(&bytes).unwrap();
        assert_eq!(prefix.fv_name, header.name().to_bytes());
        let total = prefix.ext_header_size.get();
        assert_eq!(total, header.total_size());
        assert_eq!(bytes.len(), total as usize);
        let sum: u32 = entries(&bytes).iter().map(|(s, _)| *s as u32).sum();
        assert_eq!(total, 16 + 4 + sum);
    }

    fn volume(name: &str) -> VolumeDescriptor {
        let mut desc = VolumeDescriptor::new(name);
        desc.name_guid = Some(NAME.parse().unwrap());
        desc
    }

    #[test]
    fn ui_name_only() {
        let mut desc = volume("MYFV");
        desc.name_string = true;
        let header = build(&desc, Path::new(".")).unwrap().unwrap();
        check_size_invariant(&header);

        let bytes = header.to_bytes();
        assert_eq!(header.total_size(), 20 + 4 + 16 + 4);
        assert_eq!(entries(&bytes), vec![(4 + 16 + 4, EXT_TYPE_GUID)]);
        assert_eq!(&bytes[..16], &desc.name_guid.unwrap().to_bytes());
        assert_eq!(&bytes[24..40], &FV_UI_EXT_ENTRY_GUID.to_bytes());
        assert_eq!(&bytes[40..], b"MYFV");
    }

    #[test]
    fn every_kind_of_entry() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("oem.bin"), [0xAA; 10]).unwrap();

        let mut desc = volume("FVMAIN");
        desc.attributes
            .insert("FvUsedSizeEnable".to_string(), "true".to_string());
        desc.name_string = true;
        desc.ext_entries = vec![
            ExtEntry {
                type_value: EXT_TYPE_OEM,
                payload: ExtPayload::File("oem.bin".into()),
            },
            ExtEntry {
                type_value: 0x1234,
                payload: ExtPayload::Data("0x01, 0x02,ff".to_string()),
            },
        ];

        let header = build(&desc, dir.path()).unwrap().unwrap();
        check_size_invariant(&header);
        assert_eq!(
            entries(&header.to_bytes()),
            vec![
                (8, EXT_TYPE_USED_SIZE),
                (4 + 16 + 6, EXT_TYPE_GUID),
                (14, EXT_TYPE_OEM),
                (7, 0x1234),
            ]
        );
        let bytes = header.to_bytes();
        assert_eq!(&bytes[bytes.len() - 3..], &[0x01, 0x02, 0xFF]);
    }

    #[test]
    fn nothing_requested_means_no_header() {
        let desc = volume("FVMAIN");
        assert!(build(&desc, Path::new(".")).unwrap().is_none());

        // Without a name GUID, a UI name alone is quietly dropped
        let mut desc = VolumeDescriptor::new("FVMAIN");
        desc.name_string = true;
        assert!(build(&desc, Path::new(".")).unwrap().is_none());
    }

    #[test]
    fn entries_need_a_name_guid() {
        let mut desc = VolumeDescriptor::new("FVMAIN");
        desc.attributes
            .insert("FvUsedSizeEnable".to_string(), "1".to_string());
        let err = build(&desc, Path::new(".")).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<FvError>(),
            Some(FvError::MissingNameGuid { .. })
        ));
    }

    #[test]
    fn missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut desc = volume("FVMAIN");
        desc.ext_entries = vec![ExtEntry {
            type_value: EXT_TYPE_OEM,
            payload: ExtPayload::File("nope.bin".into()),
        }];
        let err = build(&desc, dir.path()).unwrap_err();
        match err.downcast_ref::<FvError>() {
            Some(FvError::MissingExtensionFile { path, .. }) => {
                assert_eq!(path, &dir.path().join("nope.bin"))
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn oversized_file() {
        let dir = tempfile::tempdir().unwrap();
        let big = dir.path().join("big.bin");
        std::fs::write(&big, vec![0u8; 0x10000]).unwrap();

        let mut desc = volume("FVMAIN");
        desc.ext_entries = vec![ExtEntry {
            type_value: EXT_TYPE_OEM,
            payload: ExtPayload::File(big),
        }];
        let err = build(&desc, dir.path()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<FvError>(),
            Some(FvError::ExtensionEntryTooLarge { size: 0x10000, .. })
        ));
    }

    #[test]
    fn body_that_overflows_the_size_field() {
        let mut header = ExtHeader::new(NAME.parse().unwrap());
        assert_eq!(
            header.push(EXT_TYPE_OEM, &[0u8; 0xFFFC]),
            Err(EntryTooLarge(0xFFFC))
        );
        assert!(header.is_empty());
        header.push(EXT_TYPE_OEM, &[0u8; 0xFFFB]).unwrap();
        assert_eq!(header.total_size(), 20 + 0xFFFF);
    }

    #[test]
    fn bad_data_byte() {
        let mut desc = volume("FVMAIN");
        desc.ext_entries = vec![ExtEntry {
            type_value: EXT_TYPE_OEM,
            payload: ExtPayload::Data("0x01, 0x100".to_string()),
        }];
        let err = build(&desc, Path::new(".")).unwrap_err();
        match err.downcast_ref::<FvError>() {
            Some(FvError::MalformedExtensionData { item, .. }) => {
                assert_eq!(item, "0x100")
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
