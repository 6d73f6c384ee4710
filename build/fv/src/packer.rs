// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The boundary with the external volume packer, and the two files it
//! leaves behind that we read back: the offset map and the address file.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use indexmap::IndexMap;

use crate::{FvError, Guid};

/// Load offset of every file in a packed volume, in map-file order
pub type OffsetMap = IndexMap<Guid, u64>;

/// Section of the address file listing base addresses of nested volumes
const CHILD_ADDRESS_SECTION: &str = "[FV_BASE_ADDRESS]";

/// One invocation of the packer.
#[derive(Clone, Debug)]
pub struct PackRequest<'a> {
    pub volume: &'a str,
    pub output: &'a Path,
    pub control_file: &'a Path,
    pub address_file: &'a Path,
    pub ffs_files: &'a [PathBuf],
    pub force_rebase: Option<bool>,
    /// File system GUID to stamp into the header, when not the default
    pub fs_guid: Option<Guid>,
}

impl PackRequest<'_> {
    /// Command-line arguments for `GenFv`.
    pub fn args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "-o".into(),
            self.output.into(),
            "-i".into(),
            self.control_file.into(),
            "-a".into(),
            self.address_file.into(),
        ];
        if let Some(f) = self.force_rebase {
            args.push("-F".into());
            args.push(if f { "TRUE" } else { "FALSE" }.into());
        }
        if let Some(g) = self.fs_guid {
            args.push("-g".into());
            args.push(g.to_string().into());
        }
        for ffs in self.ffs_files {
            args.push("-f".into());
            args.push(ffs.into());
        }
        args
    }
}

/// Something that turns a control file and a list of FFS files into a
/// volume image.
///
/// Implementations must leave the image at `req.output` and its map file
/// next to it (see [`map_path`]) before returning `Ok`.
pub trait Packer: Sync {
    fn pack(&self, req: &PackRequest<'_>) -> Result<(), FvError>;
}

/// `FVMAIN.Fv` is described by `FVMAIN.Fv.map`
pub fn map_path(image: &Path) -> PathBuf {
    let mut s = image.as_os_str().to_owned();
    s.push(".map");
    PathBuf::from(s)
}

/// Reads the offset map the packer wrote alongside `image`.
pub fn read_offset_map(image: &Path) -> Result<OffsetMap> {
    let path = map_path(image);
    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("could not read {}", path.display()))?;
    Ok(parse_offset_map(&path, &text)?)
}

/// Parses the `(GUID=<guid> OFFSET=<hex>)` lines of a map file. All other
/// lines are ignored.
pub fn parse_offset_map(path: &Path, text: &str) -> Result<OffsetMap, FvError> {
    let mut map = OffsetMap::new();
    for (i, line) in text.lines().enumerate() {
        let line = line.trim();
        if !line.starts_with("(GUID=") {
            continue;
        }
        let bad = |reason: &str| FvError::MalformedMap {
            path: path.to_path_buf(),
            line: i + 1,
            reason: reason.to_string(),
        };

        let inner = line
            .strip_prefix('(')
            .and_then(|l| l.strip_suffix(')'))
            .ok_or_else(|| bad("unterminated entry"))?;
        let mut fields = inner.split_whitespace();
        let guid = fields
            .next()
            .and_then(|f| f.strip_prefix("GUID="))
            .ok_or_else(|| bad("missing GUID"))?;
        let offset = fields
            .next()
            .and_then(|f| f.strip_prefix("OFFSET="))
            .ok_or_else(|| bad("missing OFFSET"))?;

        let guid: Guid = guid.parse().map_err(|_| bad("bad GUID"))?;
        let digits = offset
            .strip_prefix("0x")
            .or_else(|| offset.strip_prefix("0X"))
            .unwrap_or(offset);
        let offset =
            u64::from_str_radix(digits, 16).map_err(|_| bad("bad OFFSET"))?;
        map.insert(guid, offset);
    }
    Ok(map)
}

/// Returns the lines following `[FV_BASE_ADDRESS]` in an address file.
///
/// These are handed to module generation verbatim so that nested volumes
/// can be rebuilt at the addresses the outer volume placed them at.
pub fn child_addresses(address_file: &str) -> Vec<String> {
    address_file
        .lines()
        .skip_while(|l| !l.contains(CHILD_ADDRESS_SECTION))
        .skip(1)
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}
