// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::io::Write;
use std::path::Path;

use anyhow::{bail, Result};

use build_fv::context::BuildContext;
use build_fv::descriptor::{AprioriKind, VolumeDescriptor};
use build_fv::{image, packer, Guid};

use crate::config::Config;

/// Prints where each file landed in an already-built volume.
pub fn run(cfg: &Path, volume: &str) -> Result<()> {
    let toml = Config::from_file(cfg)?;
    let Some(desc) = toml
        .volumes
        .values()
        .find(|v| v.name.eq_ignore_ascii_case(volume))
    else {
        bail!("{}", toml.volume_name_suggestion(volume));
    };

    let ctx = BuildContext::new(&toml.workspace, &toml.output);
    let path = ctx.output_image(desc);
    let alignment = image::read_alignment(&path)?;
    let offsets = packer::read_offset_map(&path)?;

    let mut out = std::io::stdout().lock();
    writeln!(
        out,
        "{} ({}, aligned to {})",
        desc.name,
        path.display(),
        alignment
    )?;
    for (guid, offset) in &offsets {
        let name = module_name(desc, guid);
        writeln!(out, "  {:#010x}  {}  {}", offset, guid, name)?;
    }
    Ok(())
}

fn module_name<'a>(desc: &'a VolumeDescriptor, guid: &Guid) -> &'a str {
    if let Some(a) = desc.apriori.iter().find(|a| a.kind.file_guid() == *guid) {
        return match a.kind {
            AprioriKind::Pei => "(PEI apriori)",
            AprioriKind::Dxe => "(DXE apriori)",
        };
    }
    desc.modules
        .iter()
        .find(|m| m.guid == *guid)
        .map(|m| m.name.as_str())
        .unwrap_or("?")
}
