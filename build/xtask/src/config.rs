// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use indexmap::IndexMap;
use serde::Deserialize;

use build_fv::descriptor::{
    AprioriKind, AprioriList, BlockSize, ExtEntry, ExtPayload, FlashDevice,
    FlashLayout, ModuleKind, ModuleRef, ModuleSource, Region, RegionKind,
    VolumeDescriptor,
};
use build_fv::tools::Tools;
use build_fv::Guid;

/// A `RawConfig` represents an `fds.toml` file that has been deserialized,
/// but may not be ready for use. Paths are still relative to the file, and
/// module sources have not been checked.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct RawConfig {
    #[serde(default)]
    workspace: Option<PathBuf>,
    output: PathBuf,
    address_file: Option<PathBuf>,
    #[serde(default)]
    tools: Tools,
    #[serde(default)]
    fd: IndexMap<String, Fd>,
    #[serde(default)]
    capsule: IndexMap<String, Capsule>,
    #[serde(default)]
    vtf: IndexMap<String, PathBuf>,
    fv: IndexMap<String, Fv>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct Fd {
    /// `[size, count]` pairs
    block_sizes: Vec<(u32, u32)>,
    #[serde(default)]
    regions: Vec<RawRegion>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct RawRegion {
    offset: u64,
    size: u64,
    #[serde(default = "RawRegion::default_kind")]
    kind: RawRegionKind,
    #[serde(default)]
    data: Vec<String>,
}

impl RawRegion {
    fn default_kind() -> RawRegionKind {
        RawRegionKind::None
    }
}

#[derive(Copy, Clone, Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum RawRegionKind {
    Fv,
    File,
    Data,
    Capsule,
    None,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct Capsule {
    volumes: Vec<String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct Fv {
    name_guid: Option<Guid>,
    base_address: Option<u64>,
    bs_base_address: Option<u64>,
    rt_base_address: Option<u64>,
    #[serde(default)]
    block_sizes: Vec<RawBlockSize>,
    #[serde(default = "Fv::default_erase_polarity")]
    erase_polarity: u8,
    #[serde(default)]
    attributes: IndexMap<String, String>,
    #[serde(default)]
    name_string: bool,
    force_rebase: Option<bool>,
    create_file: Option<PathBuf>,
    #[serde(default)]
    ext_entries: Vec<RawExtEntry>,
    #[serde(default)]
    apriori: Vec<RawApriori>,
    #[serde(default)]
    modules: Vec<RawModule>,
}

impl Fv {
    fn default_erase_polarity() -> u8 {
        1
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct RawBlockSize {
    size: Option<u32>,
    count: Option<u32>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct RawExtEntry {
    #[serde(rename = "type")]
    type_value: u16,
    file: Option<PathBuf>,
    data: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct RawApriori {
    kind: RawAprioriKind,
    modules: Vec<String>,
}

#[derive(Copy, Clone, Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum RawAprioriKind {
    Pei,
    Dxe,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct RawModule {
    name: String,
    guid: Guid,
    #[serde(default)]
    inf: PathBuf,
    #[serde(default = "RawModule::default_arch")]
    arch: String,
    /// A pre-built FFS file statement rather than an INF module
    #[serde(default)]
    file: bool,
    ffs: Option<PathBuf>,
    #[serde(default)]
    command: Vec<String>,
    output: Option<PathBuf>,
    volume: Option<String>,
    as_built: Option<PathBuf>,
}

impl RawModule {
    fn default_arch() -> String {
        "Common".to_string()
    }
}

/// A validated `fds.toml`, ready to drive volume assembly.
#[derive(Clone, Debug)]
pub struct Config {
    pub workspace: PathBuf,
    pub output: PathBuf,
    pub address_file: Option<PathBuf>,
    pub tools: Tools,
    pub layout: FlashLayout,
    pub vtf: IndexMap<String, PathBuf>,
    pub volumes: IndexMap<String, VolumeDescriptor>,
}

impl Config {
    pub fn from_file(cfg: &Path) -> Result<Self> {
        let cfg_contents = std::fs::read_to_string(cfg)
            .with_context(|| format!("could not read {}", cfg.display()))?;
        let dir = cfg.parent().unwrap_or_else(|| Path::new("."));
        Self::parse(&cfg_contents, dir)
            .with_context(|| format!("in {}", cfg.display()))
    }

    /// Parses a config; relative `workspace` and `output` paths are taken
    /// relative to `dir`.
    pub fn parse(cfg_contents: &str, dir: &Path) -> Result<Self> {
        let toml: RawConfig = toml::from_str(cfg_contents)?;

        let workspace = dir.join(toml.workspace.unwrap_or_default());
        let output = workspace.join(toml.output);
        let address_file = toml.address_file.map(|p| workspace.join(p));

        let layout = FlashLayout {
            devices: toml
                .fd
                .into_iter()
                .map(|(name, fd)| FlashDevice {
                    name,
                    block_sizes: fd.block_sizes,
                    regions: fd.regions.into_iter().map(Region::from).collect(),
                })
                .collect(),
        };

        let mut volumes = IndexMap::new();
        for (name, fv) in toml.fv {
            let desc = fv.into_descriptor(&name)?;
            volumes.insert(name, desc);
        }

        // Bare tool names are looked up in PATH
        let mut tools = toml.tools;
        for tool in [&mut tools.genfv, &mut tools.gensec, &mut tools.genffs] {
            if tool.components().count() > 1 {
                *tool = workspace.join(&*tool);
            }
        }

        let vtf = toml
            .vtf
            .into_iter()
            .map(|(name, path)| (name, workspace.join(path)))
            .collect();

        let mut config = Config {
            workspace,
            output,
            address_file,
            tools,
            layout,
            vtf,
            volumes,
        };

        for (capsule, c) in &toml.capsule {
            for v in &c.volumes {
                if !config.volumes.contains_key(v) {
                    bail!(
                        "capsule {}: {}",
                        capsule,
                        config.volume_name_suggestion(v)
                    );
                }
                if let Some(desc) = config.volumes.get_mut(v) {
                    desc.capsule_name = Some(capsule.clone());
                }
            }
        }

        for desc in config.volumes.values() {
            for nested in desc.modules.iter().filter_map(|m| match &m.source {
                ModuleSource::Volume(v) => Some(v),
                _ => None,
            }) {
                if !config.volumes.contains_key(nested) {
                    bail!(
                        "FV {}: {}",
                        desc.name,
                        config.volume_name_suggestion(nested)
                    );
                }
            }
        }

        Ok(config)
    }

    pub fn volume_name_suggestion(&self, name: &str) -> String {
        // Suggest only for very small differences
        // High number can result in inaccurate suggestions for short queries
        const MAX_DISTANCE: usize = 3;

        let mut scored: Vec<_> = self
            .volumes
            .keys()
            .filter_map(|s| {
                let distance = strsim::damerau_levenshtein(name, s);
                if distance <= MAX_DISTANCE {
                    Some((distance, s))
                } else {
                    None
                }
            })
            .collect();
        scored.sort();
        let mut out = format!("'{}' is not a valid FV name.", name);
        if let Some((_, s)) = scored.first() {
            out.push_str(&format!(" Did you mean '{}'?", s));
        }
        out
    }
}

impl From<RawRegion> for Region {
    fn from(r: RawRegion) -> Self {
        Region {
            offset: r.offset,
            size: r.size,
            kind: match r.kind {
                RawRegionKind::Fv => RegionKind::Fv,
                RawRegionKind::File => RegionKind::File,
                RawRegionKind::Data => RegionKind::Data,
                RawRegionKind::Capsule => RegionKind::Capsule,
                RawRegionKind::None => RegionKind::None,
            },
            data: r.data,
        }
    }
}

impl Fv {
    fn into_descriptor(self, name: &str) -> Result<VolumeDescriptor> {
        if self.erase_polarity > 1 {
            bail!(
                "FV {}: erase-polarity must be 0 or 1, not {}",
                name,
                self.erase_polarity
            );
        }

        let ext_entries = self
            .ext_entries
            .into_iter()
            .map(|e| {
                let payload = match (e.file, e.data) {
                    (Some(f), None) => ExtPayload::File(f),
                    (None, Some(d)) => ExtPayload::Data(d),
                    _ => bail!(
                        "FV {}: ext entry of type {:#x} needs exactly one of \
                         `file` or `data`",
                        name,
                        e.type_value
                    ),
                };
                Ok(ExtEntry {
                    type_value: e.type_value,
                    payload,
                })
            })
            .collect::<Result<_>>()?;

        let modules = self
            .modules
            .into_iter()
            .map(|m| m.into_module_ref(name))
            .collect::<Result<_>>()?;

        let mut desc = VolumeDescriptor::new(name);
        desc.name_guid = self.name_guid;
        desc.base_address = self.base_address;
        desc.bs_base_address = self.bs_base_address;
        desc.rt_base_address = self.rt_base_address;
        desc.block_sizes = self
            .block_sizes
            .into_iter()
            .map(|b| BlockSize {
                size: b.size,
                count: b.count,
            })
            .collect();
        desc.erase_polarity = self.erase_polarity;
        desc.attributes = self.attributes;
        desc.name_string = self.name_string;
        desc.force_rebase = self.force_rebase;
        desc.create_file = self.create_file;
        desc.ext_entries = ext_entries;
        desc.apriori = self
            .apriori
            .into_iter()
            .map(|a| AprioriList {
                kind: match a.kind {
                    RawAprioriKind::Pei => AprioriKind::Pei,
                    RawAprioriKind::Dxe => AprioriKind::Dxe,
                },
                modules: a.modules,
            })
            .collect();
        desc.modules = modules;
        Ok(desc)
    }
}

impl RawModule {
    fn into_module_ref(self, volume: &str) -> Result<ModuleRef> {
        let source = match (self.ffs, self.command.split_first(), self.volume) {
            (Some(ffs), None, None) => ModuleSource::Prebuilt(ffs),
            (None, Some((program, args)), None) => {
                let Some(output) = self.output else {
                    bail!(
                        "FV {}: module {} has a command but no `output`",
                        volume,
                        self.name
                    );
                };
                ModuleSource::Command {
                    program: program.clone(),
                    args: args.to_vec(),
                    output,
                }
            }
            (None, None, Some(v)) => ModuleSource::Volume(v),
            _ => bail!(
                "FV {}: module {} needs exactly one of `ffs`, `command` or \
                 `volume`",
                volume,
                self.name
            ),
        };
        Ok(ModuleRef {
            name: self.name,
            guid: self.guid,
            inf: self.inf,
            arch: self.arch,
            kind: if self.file {
                ModuleKind::File
            } else {
                ModuleKind::Inf
            },
            source,
            as_built: self.as_built,
        })
    }
}
