// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Decides which FFS files go into a volume, and in which order.
//!
//! Apriori files always come first, in declaration order, followed by the
//! volume's modules in declaration order. The resulting list is
//! append-only; its order is the byte order of the packed image.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::assemble::FfsGenerator;
use crate::context::BuildContext;
use crate::descriptor::{AprioriList, ModuleKind, ModuleRef, VolumeDescriptor};
use crate::{FvError, Guid};

/// FFS files emitted for one pass, in image order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Emission {
    pub files: Vec<PathBuf>,
    /// Some file needs the FFS3 file system
    pub large_file: bool,
}

/// Modules that take part in this build, paired with whether they are
/// (re)generated or merely listed at their predicted path.
pub fn planned<'a>(
    ctx: &'a BuildContext,
    desc: &'a VolumeDescriptor,
) -> impl Iterator<Item = (&'a ModuleRef, bool)> + 'a {
    desc.modules
        .iter()
        .filter(|m| !(ctx.makefile && m.kind == ModuleKind::File))
        .map(|m| (m, ctx.selects(m)))
}

/// Generates every apriori file and module of `desc`, in image order.
pub fn emit(
    ctx: &BuildContext,
    desc: &VolumeDescriptor,
    gen: &dyn FfsGenerator,
) -> Result<Emission> {
    let mut out = Emission::default();

    for list in &desc.apriori {
        let payload = apriori_payload(desc, list)?;
        let ffs = gen
            .generate_apriori(ctx, desc, list.kind, &payload)
            .with_context(|| {
                format!(
                    "FV {}: could not generate {:?} apriori file",
                    desc.name, list.kind
                )
            })?;
        out.large_file |= ffs.large_file;
        out.files.push(ffs.path);
    }

    for (module, selected) in planned(ctx, desc) {
        if selected {
            let ffs = gen.generate(ctx, desc, module, &[]).with_context(|| {
                format!("FV {}: could not generate {}", desc.name, module.name)
            })?;
            out.large_file |= ffs.large_file;
            out.files.push(ffs.path);
        } else {
            log::debug!("{}: {} is filtered out", desc.name, module.name);
            out.files.push(gen.predict(ctx, desc, module));
        }
    }

    Ok(out)
}

/// Regenerates modules once the packer has told us where nested volumes
/// will live. Returns whether any file needs the FFS3 file system.
///
/// The files keep the paths they were given by [`emit`], so the file list
/// from the first pass is still valid.
pub fn regenerate(
    ctx: &BuildContext,
    desc: &VolumeDescriptor,
    gen: &dyn FfsGenerator,
    child_addresses: &[String],
) -> Result<bool> {
    let mut large_file = false;
    for (module, _) in planned(ctx, desc).filter(|(_, selected)| *selected) {
        let ffs = gen
            .generate(ctx, desc, module, child_addresses)
            .with_context(|| {
                format!(
                    "FV {}: could not regenerate {}",
                    desc.name, module.name
                )
            })?;
        large_file |= ffs.large_file;
    }
    Ok(large_file)
}

/// Packs the file GUIDs named by an apriori list, in dispatch order.
pub fn apriori_payload(
    desc: &VolumeDescriptor,
    list: &AprioriList,
) -> Result<Vec<u8>, FvError> {
    let mut payload = Vec::with_capacity(list.modules.len() * 16);
    for entry in &list.modules {
        let guid = resolve_apriori_entry(desc, entry).ok_or_else(|| {
            FvError::UnknownAprioriModule {
                volume: desc.name.clone(),
                entry: entry.clone(),
            }
        })?;
        payload.extend_from_slice(&guid.to_bytes());
    }
    Ok(payload)
}

/// An apriori entry names a module, the INF it was built from, or a file
/// GUID outright.
fn resolve_apriori_entry(desc: &VolumeDescriptor, entry: &str) -> Option<Guid> {
    let entry = entry.trim();
    desc.modules
        .iter()
        .find(|m| m.name.eq_ignore_ascii_case(entry) || same_inf(&m.inf, entry))
        .map(|m| m.guid)
        .or_else(|| entry.parse().ok())
}

fn same_inf(inf: &Path, entry: &str) -> bool {
    inf.to_string_lossy().replace('\\', "/") == entry.replace('\\', "/")
}
