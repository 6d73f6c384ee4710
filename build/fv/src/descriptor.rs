// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Already-parsed inputs to volume assembly.
//!
//! Nothing in here changes while a volume is being built; state that only
//! lives for one assembly pass is kept in `assemble::AssemblyState`.

use std::path::PathBuf;

use indexmap::IndexMap;

use crate::guid::{Guid, DXE_APRIORI_GUID, PEI_APRIORI_GUID};

/// Attribute key that turns on the used-size extension entry. It is consumed
/// here and never forwarded to the packer.
pub const USED_SIZE_ATTRIBUTE: &str = "FvUsedSizeEnable";

#[derive(Clone, Debug)]
pub struct VolumeDescriptor {
    pub name: String,
    pub name_guid: Option<Guid>,
    pub base_address: Option<u64>,
    pub bs_base_address: Option<u64>,
    pub rt_base_address: Option<u64>,
    pub block_sizes: Vec<BlockSize>,
    pub erase_polarity: u8,
    pub attributes: IndexMap<String, String>,
    /// Emit the UI-name extension entry
    pub name_string: bool,
    pub ext_entries: Vec<ExtEntry>,
    pub apriori: Vec<AprioriList>,
    /// Emission order into the control file, and therefore byte order in
    /// the final image.
    pub modules: Vec<ModuleRef>,
    /// Capsule that also references this volume, if any
    pub capsule_name: Option<String>,
    pub force_rebase: Option<bool>,
    /// Overrides the default `<fv-dir>/<name>.Fv` output path
    pub create_file: Option<PathBuf>,
}

impl VolumeDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            name_guid: None,
            base_address: None,
            bs_base_address: None,
            rt_base_address: None,
            block_sizes: Vec::new(),
            erase_polarity: 1,
            attributes: IndexMap::new(),
            name_string: false,
            ext_entries: Vec::new(),
            apriori: Vec::new(),
            modules: Vec::new(),
            capsule_name: None,
            force_rebase: None,
            create_file: None,
        }
    }

    pub fn used_size_enabled(&self) -> bool {
        self.attributes
            .get(USED_SIZE_ATTRIBUTE)
            .map(|v| v.eq_ignore_ascii_case("TRUE") || v == "1")
            .unwrap_or(false)
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct BlockSize {
    pub size: Option<u32>,
    pub count: Option<u32>,
}

#[derive(Clone, Debug)]
pub struct ExtEntry {
    pub type_value: u16,
    pub payload: ExtPayload,
}

#[derive(Clone, Debug)]
pub enum ExtPayload {
    /// Path to a file whose bytes form the entry body
    File(PathBuf),
    /// Comma-separated hex bytes, e.g. `"0x01, 0x02, 0xFF"`
    Data(String),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AprioriKind {
    Pei,
    Dxe,
}

impl AprioriKind {
    pub fn file_guid(self) -> Guid {
        match self {
            AprioriKind::Pei => PEI_APRIORI_GUID,
            AprioriKind::Dxe => DXE_APRIORI_GUID,
        }
    }
}

#[derive(Clone, Debug)]
pub struct AprioriList {
    pub kind: AprioriKind,
    /// Module names, INF paths or literal GUIDs, in dispatch order
    pub modules: Vec<String>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ModuleKind {
    /// Built from an INF; contributes to the as-built manifest
    Inf,
    /// Pre-built FFS file statement
    File,
}

#[derive(Clone, Debug)]
pub enum ModuleSource {
    /// The FFS file already exists at this path
    Prebuilt(PathBuf),
    /// Running `program args...` produces the FFS at `output`
    Command {
        program: String,
        args: Vec<String>,
        output: PathBuf,
    },
    /// Another firmware volume, wrapped into an FFS file
    Volume(String),
}

#[derive(Clone, Debug)]
pub struct ModuleRef {
    pub name: String,
    pub guid: Guid,
    pub inf: PathBuf,
    pub arch: String,
    pub kind: ModuleKind,
    pub source: ModuleSource,
    /// The module's own as-built INF, read by the manifest emitter
    pub as_built: Option<PathBuf>,
}

/// Flash devices and capsules surrounding the volumes being built
#[derive(Clone, Debug, Default)]
pub struct FlashLayout {
    pub devices: Vec<FlashDevice>,
}

#[derive(Clone, Debug)]
pub struct FlashDevice {
    pub name: String,
    /// `(block size, block count)` pairs, lowest address first
    pub block_sizes: Vec<(u32, u32)>,
    pub regions: Vec<Region>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RegionKind {
    Fv,
    File,
    Data,
    Capsule,
    None,
}

#[derive(Clone, Debug)]
pub struct Region {
    pub offset: u64,
    pub size: u64,
    pub kind: RegionKind,
    /// For FV regions, the volume names (or `.fv` file names) placed here
    pub data: Vec<String>,
}
