// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! As-built INF for a packed volume.
//!
//! The manifest gathers the dependency sections of every module that ended
//! up in the image, so that a later build can consume the volume as a
//! binary. Patchable PCD offsets are rebased to where each module landed.

use std::fmt;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use indexmap::IndexMap;

use crate::context::BuildContext;
use crate::descriptor::{ModuleKind, ModuleRef, VolumeDescriptor};
use crate::packer::OffsetMap;
use crate::{file, FvError, Guid};

const INF_VERSION: &str = "0x00010017";

/// GUID-like names, each with every usage annotation seen for it
type UsageMap = IndexMap<String, Vec<String>>;

#[derive(Clone, Debug, Default)]
pub struct Manifest {
    /// Arch of the first module that contributed
    arch: Option<String>,
    packages: Vec<String>,
    patch_pcds: Vec<String>,
    protocols: UsageMap,
    ppis: UsageMap,
    guids: UsageMap,
    pcd_ex: UsageMap,
}

impl Manifest {
    /// Folds the as-built INF of one module, loaded at `load_offset` in the
    /// volume, into the manifest.
    pub fn add_module(
        &mut self,
        volume: &str,
        arch: &str,
        inf: &str,
        load_offset: u64,
    ) -> Result<()> {
        let sections = InfSections::parse(inf);
        if self.arch.is_none() {
            self.arch = Some(arch.to_string());
        }

        for line in sections.get("Packages", arch) {
            if !self.packages.iter().any(|p| p == line) {
                self.packages.push(line.to_string());
            }
        }
        merge_usage(&mut self.ppis, sections.get("Ppis", arch));
        merge_usage(&mut self.guids, sections.get("Guids", arch));
        merge_usage(&mut self.protocols, sections.get("Protocols", arch));
        for line in sections.get("PatchPcd", arch) {
            let line = if line.starts_with('g') {
                patch_pcd(volume, line, load_offset)?
            } else {
                line.to_string()
            };
            self.patch_pcds.push(line);
        }
        merge_usage(&mut self.pcd_ex, sections.get("PcdEx", arch));
        Ok(())
    }

    /// The INF text for this manifest, published as volume `name`.
    pub fn file<'a>(
        &'a self,
        name: &'a str,
        file_guid: Guid,
    ) -> ManifestFile<'a> {
        ManifestFile {
            manifest: self,
            name,
            file_guid,
        }
    }
}

pub struct ManifestFile<'a> {
    manifest: &'a Manifest,
    name: &'a str,
    file_guid: Guid,
}

impl fmt::Display for ManifestFile<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = self.manifest;
        let name = self.name;
        let arch = m.arch.as_deref().unwrap_or("Common");

        writeln!(f, "[Defines]")?;
        for (key, value) in [
            ("INF_VERSION", INF_VERSION.to_string()),
            ("BASE_NAME", name.to_string()),
            ("FILE_GUID", self.file_guid.to_string()),
            ("MODULE_TYPE", "USER_DEFINED".to_string()),
            ("VERSION_STRING", "1.0".to_string()),
        ] {
            writeln!(f, "  {key:<27}= {value}")?;
        }

        let binaries = [format!("FV|{name}.Fv")];
        let sections: [(&str, Vec<&str>); 7] = [
            ("Packages", m.packages.iter().map(String::as_str).collect()),
            ("Binaries", binaries.iter().map(String::as_str).collect()),
            ("PatchPcd", m.patch_pcds.iter().map(String::as_str).collect()),
            ("Protocols", flatten(&m.protocols)),
            ("Ppis", flatten(&m.ppis)),
            ("Guids", flatten(&m.guids)),
            ("PcdEx", flatten(&m.pcd_ex)),
        ];
        for (section, items) in sections {
            writeln!(f)?;
            writeln!(f, "[{section}.{arch}]")?;
            for item in items {
                writeln!(f, "  {item}")?;
            }
        }
        Ok(())
    }
}

/// Lists each name preceded by its usage annotations.
fn flatten(map: &UsageMap) -> Vec<&str> {
    map.iter()
        .flat_map(|(name, usages)| {
            usages
                .iter()
                .map(String::as_str)
                .chain(std::iter::once(name.as_str()))
        })
        .collect()
}

/// Merges one section's lines into `map`.
///
/// A `##` line is held until the next name line, which it then annotates.
/// A name line may also carry its own trailing comment.
fn merge_usage<'a>(
    map: &mut UsageMap,
    lines: impl IntoIterator<Item = &'a str>,
) {
    let mut pending = vec![];
    for line in lines {
        if line.starts_with("##") {
            pending.push(line.to_string());
        } else if line.starts_with('g') {
            let name = match line.find('#') {
                Some(i) => {
                    pending.push(line[i..].trim().to_string());
                    line[..i].trim()
                }
                None => line,
            };
            let usages = map.entry(name.to_string()).or_default();
            for usage in pending.drain(..) {
                if !usages.contains(&usage) {
                    usages.push(usage);
                }
            }
        }
    }
}

/// Rewrites the offset after the last `|` of a PatchPcd line so that it is
/// relative to the volume rather than to the module.
fn patch_pcd(volume: &str, line: &str, load_offset: u64) -> Result<String> {
    let Some(bar) = line.rfind('|') else {
        return Ok(line.to_string());
    };
    let value = line[bar + 1..].split('#').next().unwrap_or("").trim();
    let digits = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value);
    let Ok(offset) = u64::from_str_radix(digits, 16) else {
        bail!("FV {volume}: bad PatchPcd offset '{value}' in '{line}'");
    };

    let (patched, wrapped) = offset.overflowing_add(load_offset);
    if wrapped {
        log::warn!(
            "{}",
            FvError::OffsetWraparound {
                volume: volume.to_string(),
                base: offset,
                load: load_offset,
                wrapped: patched,
            }
        );
    }
    Ok(format!("{}0x{patched:X}", &line[..=bar]))
}

/// The sections of an INF file, just enough to pull out lines by section
/// name and arch.
struct InfSections<'a> {
    /// `(name, arch)` headers of each section, and its lines
    sections: Vec<(Vec<(String, Option<String>)>, Vec<&'a str>)>,
}

impl<'a> InfSections<'a> {
    fn parse(text: &'a str) -> Self {
        let mut sections: Vec<(Vec<(String, Option<String>)>, Vec<&'a str>)> =
            vec![];
        for line in text.lines().map(str::trim) {
            if line.is_empty() {
                continue;
            }
            if let Some(header) =
                line.strip_prefix('[').and_then(|l| l.strip_suffix(']'))
            {
                let names = header
                    .split(',')
                    .map(|h| {
                        let mut parts = h.trim().split('.');
                        let name = parts.next().unwrap_or("").to_string();
                        let arch = parts.next().map(str::to_string);
                        (name, arch)
                    })
                    .collect();
                sections.push((names, vec![]));
            } else if let Some((_, lines)) = sections.last_mut() {
                lines.push(line);
            }
        }
        Self { sections }
    }

    /// Lines of every `name` section that applies to `arch`: tagged with it,
    /// tagged `common`, or not tagged at all.
    fn get(&self, name: &str, arch: &str) -> Vec<&'a str> {
        self.sections
            .iter()
            .filter(|(headers, _)| {
                headers.iter().any(|(n, a)| {
                    n.eq_ignore_ascii_case(name)
                        && a.as_deref().map_or(true, |a| {
                            a.eq_ignore_ascii_case(arch)
                                || a.eq_ignore_ascii_case("common")
                        })
                })
            })
            .flat_map(|(_, lines)| lines.iter().copied())
            .collect()
    }
}

/// The GUID written as the manifest's `FILE_GUID`.
///
/// Volumes without a name GUID get one derived from their name, so the
/// manifest does not change from build to build.
pub fn file_guid(desc: &VolumeDescriptor) -> Guid {
    desc.name_guid.unwrap_or_else(|| {
        Guid::from_uuid(uuid::Uuid::new_v5(
            &uuid::Uuid::NAMESPACE_OID,
            desc.name.as_bytes(),
        ))
    })
}

/// Writes `AsBuild<name>.inf` for a packed volume. Volumes without modules
/// get no manifest.
pub fn emit(
    ctx: &BuildContext,
    desc: &VolumeDescriptor,
    offsets: &OffsetMap,
) -> Result<Option<PathBuf>> {
    if desc.modules.is_empty() {
        return Ok(None);
    }

    let mut manifest = Manifest::default();
    for module in desc.modules.iter().filter(|m| m.kind == ModuleKind::Inf) {
        let Some(&load) = offsets.get(&module.guid) else {
            continue;
        };
        let Some(inf) = as_built_text(ctx, module)? else {
            continue;
        };
        manifest
            .add_module(&desc.name, &module.arch, &inf, load)
            .with_context(|| {
                format!("FV {}: could not merge {}", desc.name, module.name)
            })?;
    }

    let path = ctx.manifest_file(&desc.name);
    let text = manifest.file(&desc.name, file_guid(desc)).to_string();
    file::write_if_changed(&path, text.as_bytes())?;
    Ok(Some(path))
}

fn as_built_text(
    ctx: &BuildContext,
    module: &ModuleRef,
) -> Result<Option<String>> {
    let Some(p) = &module.as_built else {
        return Ok(None);
    };
    let path = ctx.resolve(p);
    let text = std::fs::read_to_string(&path).with_context(|| {
        format!(
            "could not read as-built INF {} for {}",
            path.display(),
            module.name
        )
    })?;
    Ok(Some(text))
}
