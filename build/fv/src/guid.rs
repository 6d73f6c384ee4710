// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! GUIDs in registry form (`8C8CE578-8A3D-4F1C-9935-896185C32DD3`) and in
//! their 16-byte `EFI_GUID` wire form.
//!
//! On the wire, the first three groups are stored little-endian and the last
//! eight bytes are stored in the order they are written; this is
//! `uuid::Uuid::to_bytes_le`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::FvError;

/// Number of hex digits in each hyphen-separated group
const GROUP_LENGTHS: [usize; 5] = [8, 4, 4, 4, 12];

/// GUID naming the UI-name extension entry
pub const FV_UI_EXT_ENTRY_GUID: Guid = Guid::from_fields(
    0xA67D_F1FA,
    0x8DE8,
    0x4E98,
    [0xAF, 0x09, 0x4B, 0xDF, 0x2E, 0xFF, 0xBC, 0x7C],
);

/// File name of the PEI apriori file
pub const PEI_APRIORI_GUID: Guid = Guid::from_fields(
    0x1B45_CC0A,
    0x156A,
    0x428A,
    [0xAF, 0x62, 0x49, 0x86, 0x4D, 0xA0, 0xE6, 0xE6],
);

/// File name of the DXE apriori file
pub const DXE_APRIORI_GUID: Guid = Guid::from_fields(
    0xFC51_0EE7,
    0xFFDC,
    0x11D4,
    [0xBD, 0x41, 0x00, 0x80, 0xC7, 0x3C, 0x88, 0x81],
);

/// `EFI_FIRMWARE_FILE_SYSTEM3_GUID`, required once a volume holds a file
/// of 16 MiB or more.
pub const FIRMWARE_FILE_SYSTEM3_GUID: Guid = Guid::from_fields(
    0x5473_C07A,
    0x3DCB,
    0x4DCA,
    [0xBD, 0x6F, 0x1E, 0x96, 0x89, 0xE7, 0x34, 0x9A],
);

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Guid(uuid::Uuid);

impl Guid {
    pub const fn from_fields(
        data1: u32,
        data2: u16,
        data3: u16,
        data4: [u8; 8],
    ) -> Self {
        Self(uuid::Uuid::from_fields(data1, data2, data3, &data4))
    }

    pub fn from_uuid(uuid: uuid::Uuid) -> Self {
        Self(uuid)
    }

    /// Packs the GUID into its `EFI_GUID` byte layout.
    pub fn to_bytes(&self) -> [u8; 16] {
        self.0.to_bytes_le()
    }

    pub fn from_bytes(bytes: &[u8; 16]) -> Self {
        Self(uuid::Uuid::from_bytes_le(*bytes))
    }
}

impl FromStr for Guid {
    type Err = FvError;

    /// Only the hyphenated registry form is accepted; `uuid` on its own
    /// would also take braced, URN and unhyphenated spellings.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || FvError::MalformedGuid(s.to_string());

        let groups: Vec<&str> = s.split('-').collect();
        if groups.len() != GROUP_LENGTHS.len() {
            return Err(bad());
        }
        for (group, len) in groups.iter().zip(GROUP_LENGTHS) {
            if group.len() != len
                || !group.bytes().all(|b| b.is_ascii_hexdigit())
            {
                return Err(bad());
            }
        }

        uuid::Uuid::try_parse(s).map(Self).map_err(|_| bad())
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}", self.0.hyphenated())
    }
}

impl<'de> Deserialize<'de> for Guid {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

impl Serialize for Guid {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FFS2: &str = "8C8CE578-8A3D-4F1C-9935-896185C32DD3";

    #[test]
    fn wire_layout() {
        let guid: Guid = FFS2.parse().unwrap();
        assert_eq!(
            guid.to_bytes(),
            [
                0x78, 0xE5, 0x8C, 0x8C, 0x3D, 0x8A, 0x1C, 0x4F, 0x99, 0x35,
                0x89, 0x61, 0x85, 0xC3, 0x2D, 0xD3
            ]
        );
        assert_eq!(Guid::from_bytes(&guid.to_bytes()), guid);
    }

    #[test]
    fn round_trip() {
        for s in [
            FFS2,
            "A67DF1FA-8DE8-4E98-AF09-4BDF2EFFBC7C",
            "00000000-0000-0000-0000-000000000000",
            "FFFFFFFF-FFFF-FFFF-FFFF-FFFFFFFFFFFF",
        ] {
            let guid: Guid = s.parse().unwrap();
            assert_eq!(guid.to_string(), s);
        }
    }

    #[test]
    fn lower_case_is_accepted() {
        let guid: Guid =
            "fc510ee7-ffdc-11d4-bd41-0080c73c8881".parse().unwrap();
        assert_eq!(guid, DXE_APRIORI_GUID);
        assert_eq!(guid.to_string(), "FC510EE7-FFDC-11D4-BD41-0080C73C8881");
    }

    #[test]
    fn constants_match_their_strings() {
        assert_eq!(
            FV_UI_EXT_ENTRY_GUID.to_string(),
            "A67DF1FA-8DE8-4E98-AF09-4BDF2EFFBC7C"
        );
        assert_eq!(
            PEI_APRIORI_GUID.to_string(),
            "1B45CC0A-156A-428A-AF62-49864DA0E6E6"
        );
        assert_eq!(
            FIRMWARE_FILE_SYSTEM3_GUID.to_string(),
            "5473C07A-3DCB-4DCA-BD6F-1E9689E7349A"
        );
    }

    #[track_caller]
    fn check_malformed(s: &str) {
        match s.parse::<Guid>() {
            Err(FvError::MalformedGuid(m)) => assert_eq!(m, s),
            other => panic!("expected MalformedGuid for {s:?}, got {other:?}"),
        }
    }

    #[test]
    fn malformed() {
        // wrong group lengths
        check_malformed("8C8CE57-8A3D-4F1C-9935-896185C32DD3");
        check_malformed("8C8CE578-8A3D4-F1C-9935-896185C32DD3");
        check_malformed("8C8CE578-8A3D-4F1C-99358-96185C32DD3");
        check_malformed("8C8CE578-8A3D-4F1C-9935-896185C32DD");
        // wrong group count
        check_malformed("8C8CE578-8A3D-4F1C-9935896185C32DD3");
        check_malformed("8C8CE578-8A3D-4F1C-9935-8961-85C32DD3");
        // not hex
        check_malformed("8C8CE578-8A3D-4F1C-9935-896185C32DDG");
        check_malformed("+C8CE578-8A3D-4F1C-9935-896185C32DD3");
        check_malformed("");
    }

    #[test]
    fn from_uuid_keeps_field_order() {
        let uuid = uuid::Uuid::parse_str(FFS2).unwrap();
        assert_eq!(Guid::from_uuid(uuid).to_string(), FFS2);
    }
}
