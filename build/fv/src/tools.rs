// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! EDK2 BaseTools wrappers: `GenFv` as the packer, and `GenSec`/`GenFfs`
//! for wrapping apriori payloads and nested volume images into FFS files.

use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{anyhow, bail, Context, Result};
use indexmap::IndexMap;
use serde::Deserialize;

use crate::assemble::{Assembler, FfsGenerator, GeneratedFfs, Placement};
use crate::context::BuildContext;
use crate::descriptor::{AprioriKind, ModuleRef, ModuleSource, VolumeDescriptor};
use crate::file;
use crate::packer::{PackRequest, Packer};
use crate::FvError;

/// Files at least this big need the FFS3 file system
pub const MAX_FFS2_FILE_SIZE: u64 = 0x100_0000;

/// Where to find the external tools.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Tools {
    #[serde(default = "Tools::default_genfv")]
    pub genfv: PathBuf,
    #[serde(default = "Tools::default_gensec")]
    pub gensec: PathBuf,
    #[serde(default = "Tools::default_genffs")]
    pub genffs: PathBuf,
}

impl Tools {
    fn default_genfv() -> PathBuf {
        "GenFv".into()
    }
    fn default_gensec() -> PathBuf {
        "GenSec".into()
    }
    fn default_genffs() -> PathBuf {
        "GenFfs".into()
    }
}

impl Default for Tools {
    fn default() -> Self {
        Self {
            genfv: Self::default_genfv(),
            gensec: Self::default_gensec(),
            genffs: Self::default_genffs(),
        }
    }
}

/// The `GenFv` packer.
#[derive(Clone, Debug)]
pub struct GenFv {
    program: PathBuf,
}

impl GenFv {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Packer for GenFv {
    fn pack(&self, req: &PackRequest<'_>) -> Result<(), FvError> {
        let failed = |reason: String| FvError::PackerInvocationFailed {
            volume: req.volume.to_string(),
            reason,
        };

        let mut cmd = Command::new(&self.program);
        cmd.args(req.args());
        log::debug!("{:?}", cmd);

        let status = cmd
            .status()
            .map_err(|e| failed(format!("failed to run {:?}: {e}", cmd)))?;
        if !status.success() {
            return Err(failed(format!("{:?} exited with {status}", cmd)));
        }
        Ok(())
    }
}

/// Produces FFS files by running the commands and tools a descriptor names.
///
/// Nested volumes are built through the same assembler, so they land in the
/// image cache and are only rebuilt when the outer volume moves them.
pub struct ToolGenerator<'a> {
    tools: &'a Tools,
    volumes: &'a IndexMap<String, VolumeDescriptor>,
}

impl<'a> ToolGenerator<'a> {
    pub fn new(
        tools: &'a Tools,
        volumes: &'a IndexMap<String, VolumeDescriptor>,
    ) -> Self {
        Self { tools, volumes }
    }

    fn volume(&self, name: &str) -> Option<&'a VolumeDescriptor> {
        self.volumes
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }

    fn build_nested(
        &self,
        ctx: &BuildContext,
        desc: &VolumeDescriptor,
        name: &str,
        child_addresses: &[String],
    ) -> Result<PathBuf> {
        let nested = self.volume(name).ok_or_else(|| {
            anyhow!("FV {}: nested FV {} is not defined", desc.name, name)
        })?;
        let placement = Placement {
            base_address: child_base(child_addresses, &nested.name),
            ..Default::default()
        };
        let packer = GenFv::new(&self.tools.genfv);
        let built = Assembler::new(ctx, &packer, self)
            .assemble(nested, &placement)
            .with_context(|| {
                format!("FV {}: could not build {}", desc.name, name)
            })?;
        Ok(built.image)
    }

    /// Wraps `input` in one section and then in an FFS file at `output`.
    fn wrap(
        &self,
        input: &Path,
        section_type: &str,
        file_type: &str,
        name: &str,
        output: &Path,
    ) -> Result<()> {
        if let Some(dir) = output.parent() {
            std::fs::create_dir_all(dir).with_context(|| {
                format!("could not create {}", dir.display())
            })?;
        }
        let section = output.with_extension("sec");
        let mut cmd = Command::new(&self.tools.gensec);
        cmd.arg("-s").arg(section_type).arg("-o").arg(&section).arg(input);
        run(&mut cmd, "GenSec")?;

        let mut cmd = Command::new(&self.tools.genffs);
        cmd.arg("-t")
            .arg(file_type)
            .arg("-g")
            .arg(name)
            .arg("-o")
            .arg(output)
            .arg("-i")
            .arg(&section);
        run(&mut cmd, "GenFfs")
    }
}

impl FfsGenerator for ToolGenerator<'_> {
    fn generate(
        &self,
        ctx: &BuildContext,
        desc: &VolumeDescriptor,
        module: &ModuleRef,
        child_addresses: &[String],
    ) -> Result<GeneratedFfs> {
        let path = self.predict(ctx, desc, module);
        if ctx.makefile {
            return Ok(GeneratedFfs {
                path,
                large_file: false,
            });
        }

        match &module.source {
            ModuleSource::Prebuilt(_) => {}
            ModuleSource::Command { program, args, .. } => {
                let mut cmd = Command::new(program);
                cmd.args(args).current_dir(&ctx.workspace);
                run(&mut cmd, program)?;
            }
            ModuleSource::Volume(name) => {
                let image =
                    self.build_nested(ctx, desc, name, child_addresses)?;
                self.wrap(
                    &image,
                    "EFI_SECTION_FIRMWARE_VOLUME_IMAGE",
                    "EFI_FV_FILETYPE_FIRMWARE_VOLUME_IMAGE",
                    &module.guid.to_string(),
                    &path,
                )?;
            }
        }

        let len = std::fs::metadata(&path)
            .with_context(|| {
                format!("{}: no FFS file at {}", module.name, path.display())
            })?
            .len();
        Ok(GeneratedFfs {
            path,
            large_file: len >= MAX_FFS2_FILE_SIZE,
        })
    }

    fn predict(
        &self,
        ctx: &BuildContext,
        desc: &VolumeDescriptor,
        module: &ModuleRef,
    ) -> PathBuf {
        match &module.source {
            ModuleSource::Prebuilt(p) => ctx.resolve(p),
            ModuleSource::Command { output, .. } => ctx.resolve(output),
            ModuleSource::Volume(_) => ctx
                .ffs_dir
                .join(&desc.name)
                .join(format!("{}.ffs", module.guid)),
        }
    }

    fn generate_apriori(
        &self,
        ctx: &BuildContext,
        desc: &VolumeDescriptor,
        kind: AprioriKind,
        payload: &[u8],
    ) -> Result<GeneratedFfs> {
        let name = kind.file_guid().to_string();
        let dir = ctx.ffs_dir.join(&desc.name);
        let path = dir.join(format!("{name}.ffs"));
        if ctx.makefile {
            return Ok(GeneratedFfs {
                path,
                large_file: false,
            });
        }

        let raw = dir.join(format!("{name}.raw"));
        file::write_if_changed(&raw, payload)?;
        self.wrap(
            &raw,
            "EFI_SECTION_RAW",
            "EFI_FV_FILETYPE_FREEFORM",
            &name,
            &path,
        )?;
        Ok(GeneratedFfs {
            path,
            large_file: false,
        })
    }
}

/// Picks the base address reported for `volume` out of the
/// `[FV_BASE_ADDRESS]` lines, which read `<name> = <hex address>`.
pub fn child_base(child_addresses: &[String], volume: &str) -> Option<u64> {
    child_addresses.iter().find_map(|line| {
        let (name, value) = line.split_once('=')?;
        if !name.trim().eq_ignore_ascii_case(volume) {
            return None;
        }
        let value = value.trim();
        let digits = value
            .strip_prefix("0x")
            .or_else(|| value.strip_prefix("0X"))
            .unwrap_or(value);
        u64::from_str_radix(digits, 16).ok()
    })
}

fn run(cmd: &mut Command, what: &str) -> Result<()> {
    log::debug!("{:?}", cmd);
    let status = cmd
        .status()
        .context(format!("failed to run {} ({:?})", what, cmd))?;
    if !status.success() {
        bail!("{} failed ({:?}), see output for details", what, cmd);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::ModuleKind;

    fn module(source: ModuleSource) -> ModuleRef {
        ModuleRef {
            name: "Shell".to_string(),
            guid: "7C04A583-9E3E-4F1C-AD65-E05268D0B4D1".parse().unwrap(),
            inf: "ShellPkg/Application/Shell/Shell.inf".into(),
            arch: "X64".to_string(),
            kind: ModuleKind::Inf,
            source,
            as_built: None,
        }
    }

    #[test]
    fn child_base_addresses() {
        let lines = vec![
            "FVMAIN_COMPACT = 0xFFC84000".to_string(),
            "dxefv = 900000".to_string(),
            "garbage".to_string(),
        ];
        assert_eq!(child_base(&lines, "DXEFV"), Some(0x90_0000));
        assert_eq!(child_base(&lines, "FVMAIN_COMPACT"), Some(0xFFC8_4000));
        assert_eq!(child_base(&lines, "PEIFV"), None);
    }

    #[test]
    fn prebuilt_files() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = BuildContext::new(dir.path(), &dir.path().join("Build"));
        let tools = Tools::default();
        let volumes = IndexMap::new();
        let gen = ToolGenerator::new(&tools, &volumes);
        let desc = VolumeDescriptor::new("DXEFV");

        let small = module(ModuleSource::Prebuilt("Shell.ffs".into()));
        std::fs::write(dir.path().join("Shell.ffs"), b"ffs").unwrap();
        let out = gen.generate(&ctx, &desc, &small, &[]).unwrap();
        assert_eq!(out.path, dir.path().join("Shell.ffs"));
        assert!(!out.large_file);

        let big = module(ModuleSource::Prebuilt("Big.ffs".into()));
        std::fs::File::create(dir.path().join("Big.ffs"))
            .unwrap()
            .set_len(MAX_FFS2_FILE_SIZE)
            .unwrap();
        assert!(gen.generate(&ctx, &desc, &big, &[]).unwrap().large_file);

        let missing = module(ModuleSource::Prebuilt("Gone.ffs".into()));
        assert!(gen.generate(&ctx, &desc, &missing, &[]).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn command_output() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = BuildContext::new(dir.path(), &dir.path().join("Build"));
        let tools = Tools::default();
        let volumes = IndexMap::new();
        let gen = ToolGenerator::new(&tools, &volumes);
        let desc = VolumeDescriptor::new("DXEFV");

        let m = module(ModuleSource::Command {
            program: "sh".to_string(),
            args: vec![
                "-c".to_string(),
                "printf shell > Shell.ffs".to_string(),
            ],
            output: "Shell.ffs".into(),
        });
        let out = gen.generate(&ctx, &desc, &m, &[]).unwrap();
        assert_eq!(std::fs::read(out.path).unwrap(), b"shell");

        let failing = module(ModuleSource::Command {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), "exit 3".to_string()],
            output: "Never.ffs".into(),
        });
        assert!(gen.generate(&ctx, &desc, &failing, &[]).is_err());
    }

    #[test]
    fn makefile_mode_runs_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = BuildContext::new(dir.path(), &dir.path().join("Build"));
        ctx.makefile = true;
        let tools = Tools {
            genfv: "/nonexistent/GenFv".into(),
            gensec: "/nonexistent/GenSec".into(),
            genffs: "/nonexistent/GenFfs".into(),
        };
        let volumes = IndexMap::new();
        let gen = ToolGenerator::new(&tools, &volumes);
        let desc = VolumeDescriptor::new("FVMAIN");

        let nested = module(ModuleSource::Volume("DXEFV".to_string()));
        let out = gen.generate(&ctx, &desc, &nested, &[]).unwrap();
        assert_eq!(
            out.path,
            ctx.ffs_dir
                .join("FVMAIN")
                .join("7C04A583-9E3E-4F1C-AD65-E05268D0B4D1.ffs")
        );

        let apriori = gen
            .generate_apriori(&ctx, &desc, AprioriKind::Dxe, &[0; 16])
            .unwrap();
        assert_eq!(
            apriori.path,
            ctx.ffs_dir
                .join("FVMAIN")
                .join("FC510EE7-FFDC-11D4-BD41-0080C73C8881.ffs")
        );
    }

    #[test]
    fn missing_packer() {
        let ffs: Vec<PathBuf> = vec![];
        let req = PackRequest {
            volume: "FVMAIN",
            output: Path::new("FVMAIN.Fv"),
            control_file: Path::new("FVMAIN.inf"),
            address_file: Path::new("FVMAIN.addr"),
            ffs_files: &ffs,
            force_rebase: None,
            fs_guid: None,
        };
        match GenFv::new("/nonexistent/GenFv").pack(&req) {
            Err(FvError::PackerInvocationFailed { volume, .. }) => {
                assert_eq!(volume, "FVMAIN")
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn undefined_nested_volume() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = BuildContext::new(dir.path(), &dir.path().join("Build"));
        let tools = Tools::default();
        let volumes = IndexMap::new();
        let gen = ToolGenerator::new(&tools, &volumes);
        let desc = VolumeDescriptor::new("FVMAIN");
        let nested = module(ModuleSource::Volume("DXEFV".to_string()));
        let err = gen.generate(&ctx, &desc, &nested, &[]).unwrap_err();
        assert!(err.to_string().contains("nested FV DXEFV is not defined"));
    }
}
