// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Two-pass volume assembly.
//!
//! Where a volume contains nested volumes, the addresses those nested
//! volumes will run at are only known once the outer volume has been packed
//! once. The packer reports them through the address file; when they show
//! up, every module is regenerated with the new addresses and the volume is
//! packed a second (and last) time.
//!
//! ```text
//! Init -> FirstPack -> ReconcileOffsets -+-> Done
//!                                        |
//!                                        +-> SecondPack -> Done
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};

use crate::blocks;
use crate::context::BuildContext;
use crate::control::ControlFile;
use crate::descriptor::{
    AprioriKind, BlockSize, ModuleRef, RegionKind, VolumeDescriptor,
};
use crate::ext_header;
use crate::file;
use crate::guid::FIRMWARE_FILE_SYSTEM3_GUID;
use crate::image::{self, FvAlignment};
use crate::order;
use crate::packer::{self, OffsetMap, PackRequest, Packer};
use crate::{asbuilt, FvError};

/// Most packer invocations a single volume may take
pub const MAX_PASSES: u8 = 2;

/// An FFS file produced for a volume.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GeneratedFfs {
    pub path: PathBuf,
    /// The file is 16 MiB or larger, so the volume needs the FFS3 file
    /// system
    pub large_file: bool,
}

/// Produces the FFS files that go into a volume.
pub trait FfsGenerator: Sync {
    /// Generates the FFS file for `module`. `child_addresses` is empty on
    /// the first pass, and holds the `[FV_BASE_ADDRESS]` lines reported by
    /// the packer when regenerating.
    fn generate(
        &self,
        ctx: &BuildContext,
        desc: &VolumeDescriptor,
        module: &ModuleRef,
        child_addresses: &[String],
    ) -> Result<GeneratedFfs>;

    /// Where `generate` would put the FFS file for `module`, without
    /// producing it.
    fn predict(
        &self,
        ctx: &BuildContext,
        desc: &VolumeDescriptor,
        module: &ModuleRef,
    ) -> PathBuf;

    /// Wraps an apriori payload (packed file GUIDs) into a freeform FFS
    /// file named by `kind.file_guid()`.
    fn generate_apriori(
        &self,
        ctx: &BuildContext,
        desc: &VolumeDescriptor,
        kind: AprioriKind,
        payload: &[u8],
    ) -> Result<GeneratedFfs>;
}

/// Where the caller is placing the volume, e.g. a flash region.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Placement {
    /// Overridden by the volume's own base address, if it has one
    pub base_address: Option<u64>,
    /// Takes precedence over declared and inherited block sizes
    pub block_size: Option<u32>,
    pub block_count: Option<u32>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AssembledVolume {
    pub image: PathBuf,
    /// `None` when no image was packed by this call
    pub alignment: Option<FvAlignment>,
    pub offsets: OffsetMap,
    /// Packer invocations made; zero for cached and dry-run results
    pub passes: u8,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Phase {
    Init,
    FirstPack,
    ReconcileOffsets,
    SecondPack,
    Done,
}

/// Everything that only lives for one assembly of one volume.
#[derive(Debug)]
pub struct AssemblyState {
    pub phase: Phase,
    pub image: PathBuf,
    pub control_file: PathBuf,
    pub address_file: PathBuf,
    /// Address file contents handed to the first pass
    pub address_before: Option<String>,
    pub ext_header: Option<PathBuf>,
    pub blocks: Vec<BlockSize>,
    pub base_address: Option<u64>,
    pub ffs_files: Vec<PathBuf>,
    pub large_file: bool,
    pub alignment: Option<FvAlignment>,
    pub passes: u8,
    pub offsets: OffsetMap,
}

impl AssemblyState {
    fn new(
        ctx: &BuildContext,
        desc: &VolumeDescriptor,
        placement: &Placement,
    ) -> Self {
        Self {
            phase: Phase::Init,
            image: ctx.output_image(desc),
            control_file: ctx.control_file(&desc.name),
            address_file: ctx.volume_address_file(&desc.name),
            address_before: None,
            ext_header: None,
            blocks: vec![],
            base_address: desc.base_address.or(placement.base_address),
            ffs_files: vec![],
            large_file: false,
            alignment: None,
            passes: 0,
            offsets: OffsetMap::new(),
        }
    }

    fn finish(self) -> AssembledVolume {
        AssembledVolume {
            image: self.image,
            alignment: self.alignment,
            offsets: self.offsets,
            passes: self.passes,
        }
    }
}

pub struct Assembler<'a> {
    ctx: &'a BuildContext,
    packer: &'a dyn Packer,
    gen: &'a dyn FfsGenerator,
}

impl<'a> Assembler<'a> {
    pub fn new(
        ctx: &'a BuildContext,
        packer: &'a dyn Packer,
        gen: &'a dyn FfsGenerator,
    ) -> Self {
        Self { ctx, packer, gen }
    }

    /// Builds one volume, returning where its image ended up.
    pub fn assemble(
        &self,
        desc: &VolumeDescriptor,
        placement: &Placement,
    ) -> Result<AssembledVolume> {
        let ctx = self.ctx;
        if placement.base_address.is_none() {
            if let Some(image) = ctx.image(&desc.name) {
                log::debug!(
                    "FV {} already built at {}",
                    desc.name,
                    image.display()
                );
                return Ok(AssembledVolume {
                    image,
                    alignment: None,
                    offsets: OffsetMap::new(),
                    passes: 0,
                });
            }
        }

        let mut state = AssemblyState::new(ctx, desc, placement);
        loop {
            state.phase = match state.phase {
                Phase::Init => self.init(desc, placement, &mut state)?,
                Phase::FirstPack => self.first_pack(desc, &mut state)?,
                Phase::ReconcileOffsets => self.reconcile(desc, &mut state)?,
                Phase::SecondPack => self.second_pack(desc, &mut state)?,
                Phase::Done => break,
            };
        }
        Ok(state.finish())
    }

    fn init(
        &self,
        desc: &VolumeDescriptor,
        placement: &Placement,
        state: &mut AssemblyState,
    ) -> Result<Phase> {
        check_region_conflict(self.ctx, desc)?;
        if !self.ctx.makefile {
            log::info!("generating FV {}", desc.name);
        }

        state.blocks = match placement.block_size {
            Some(size) => vec![BlockSize {
                size: Some(size),
                count: placement.block_count,
            }],
            None => blocks::resolve(desc, &self.ctx.layout).unwrap_or_else(|e| {
                log::warn!("{e}");
                vec![]
            }),
        };
        Ok(Phase::FirstPack)
    }

    fn first_pack(
        &self,
        desc: &VolumeDescriptor,
        state: &mut AssemblyState,
    ) -> Result<Phase> {
        let ctx = self.ctx;
        if !ctx.makefile {
            state.ext_header = self.write_ext_header(desc, state)?;
        }

        let emission = order::emit(ctx, desc, self.gen)?;
        state.ffs_files = emission.files;
        state.large_file = emission.large_file;

        if ctx.makefile {
            ctx.record_image(&desc.name, state.image.clone());
            return Ok(Phase::Done);
        }

        self.write_control(desc, state)?;

        if ctx.module_filter.is_some() {
            log::info!("FV {}: module filter set, not packing", desc.name);
            return Ok(Phase::Done);
        }

        if let Some(seed) = &ctx.address_file {
            if let Some(dir) = state.address_file.parent() {
                std::fs::create_dir_all(dir).with_context(|| {
                    format!("could not create {}", dir.display())
                })?;
            }
            std::fs::copy(seed, &state.address_file).with_context(|| {
                format!(
                    "could not copy {} to {}",
                    seed.display(),
                    state.address_file.display()
                )
            })?;
        } else {
            // A file left by an earlier build would match what this pack
            // reports and skip the second pass.
            file::remove_if_exists(&state.address_file)?;
        }

        state.address_before =
            std::fs::read_to_string(&state.address_file).ok();
        self.pack(desc, state)?;
        Ok(Phase::ReconcileOffsets)
    }

    fn reconcile(
        &self,
        desc: &VolumeDescriptor,
        state: &mut AssemblyState,
    ) -> Result<Phase> {
        let after = std::fs::read_to_string(&state.address_file).ok();
        let children = match &after {
            Some(s) if after != state.address_before => {
                packer::child_addresses(s)
            }
            _ => vec![],
        };

        if state.passes < MAX_PASSES && !children.is_empty() {
            log::debug!(
                "FV {}: {} nested volume address(es) reported, regenerating",
                desc.name,
                children.len()
            );
            state.large_file |=
                order::regenerate(self.ctx, desc, self.gen, &children)?;
            return Ok(Phase::SecondPack);
        }

        self.done(desc, state)
    }

    fn second_pack(
        &self,
        desc: &VolumeDescriptor,
        state: &mut AssemblyState,
    ) -> Result<Phase> {
        self.write_control(desc, state)?;
        self.pack(desc, state)?;
        self.done(desc, state)
    }

    fn done(
        &self,
        desc: &VolumeDescriptor,
        state: &mut AssemblyState,
    ) -> Result<Phase> {
        self.ctx.record_image(&desc.name, state.image.clone());
        asbuilt::emit(self.ctx, desc, &state.offsets)?;
        log::debug!(
            "FV {} done after {} pass(es), aligned to {}",
            desc.name,
            state.passes,
            state.alignment.map(|a| a.to_string()).unwrap_or_default()
        );
        Ok(Phase::Done)
    }

    /// Writes `<name>.ext`, or removes a stale one when the volume has no
    /// extension header. A changed header invalidates the control file.
    fn write_ext_header(
        &self,
        desc: &VolumeDescriptor,
        state: &AssemblyState,
    ) -> Result<Option<PathBuf>> {
        let path = self.ctx.ext_file(&desc.name);
        let Some(header) = ext_header::build(desc, &self.ctx.workspace)? else {
            file::remove_if_exists(&path)?;
            return Ok(None);
        };
        if file::write_if_changed(&path, &header.to_bytes())? {
            file::remove_if_exists(&state.control_file)?;
        }
        Ok(Some(path))
    }

    fn write_control(
        &self,
        desc: &VolumeDescriptor,
        state: &AssemblyState,
    ) -> Result<()> {
        let control = ControlFile {
            desc,
            base_address: state.base_address,
            blocks: &state.blocks,
            alignment: state.alignment,
            ext_header: state.ext_header.as_deref(),
            vtf: self.ctx.vtf_for(&desc.name),
            files: &state.ffs_files,
        };
        let text = control.to_string();
        file::write_if_changed(&state.control_file, text.as_bytes())?;
        Ok(())
    }

    /// Runs the packer once, then reads back what it produced.
    fn pack(
        &self,
        desc: &VolumeDescriptor,
        state: &mut AssemblyState,
    ) -> Result<()> {
        let req = PackRequest {
            volume: &desc.name,
            output: &state.image,
            control_file: &state.control_file,
            address_file: &state.address_file,
            ffs_files: &state.ffs_files,
            force_rebase: desc.force_rebase,
            fs_guid: state.large_file.then_some(FIRMWARE_FILE_SYSTEM3_GUID),
        };
        self.packer.pack(&req)?;
        state.passes += 1;

        if !state.image.is_file() {
            return Err(FvError::PackerInvocationFailed {
                volume: desc.name.clone(),
                reason: format!("no image at {}", state.image.display()),
            }
            .into());
        }
        state.offsets = packer::read_offset_map(&state.image)?;
        state.alignment = Some(image::read_alignment(&state.image)?);
        Ok(())
    }
}

/// A volume can't be both inside a capsule and placed in a flash region.
fn check_region_conflict(
    ctx: &BuildContext,
    desc: &VolumeDescriptor,
) -> Result<(), FvError> {
    let Some(capsule) = &desc.capsule_name else {
        return Ok(());
    };
    for fd in &ctx.layout.devices {
        let regions = fd.regions.iter().filter(|r| r.kind == RegionKind::Fv);
        for data in regions.flat_map(|r| r.data.iter()) {
            if data.ends_with(".fv") || ctx.image(data).is_some() {
                continue;
            }
            if data.eq_ignore_ascii_case(&desc.name) {
                return Err(FvError::RegionConflict {
                    capsule: capsule.clone(),
                    volume: desc.name.to_uppercase(),
                    fd: fd.name.clone(),
                });
            }
        }
    }
    Ok(())
}
