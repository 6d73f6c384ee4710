// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use indexmap::IndexMap;

use crate::descriptor::{FlashLayout, ModuleRef, VolumeDescriptor};

/// Everything about the surrounding build that volume assembly needs to
/// know, passed explicitly to every volume being built.
///
/// A single `BuildContext` is shared by all worker threads; only the image
/// cache is mutable.
#[derive(Debug)]
pub struct BuildContext {
    /// Relative paths in descriptors are resolved against this
    pub workspace: PathBuf,
    /// Control files, extension headers, images and manifests land here
    pub fv_dir: PathBuf,
    /// Per-volume address files land here
    pub ffs_dir: PathBuf,
    /// Address file copied in as the starting point for every volume
    pub address_file: Option<PathBuf>,
    /// Dry run: predict output paths without writing control files or
    /// running the packer
    pub makefile: bool,
    /// Only regenerate modules whose INF path is contained in this path
    pub module_filter: Option<PathBuf>,
    /// VTF FFS file to place first in a volume, keyed by volume name
    /// (case-insensitive)
    pub vtf: IndexMap<String, PathBuf>,
    pub layout: FlashLayout,
    images: Mutex<HashMap<String, PathBuf>>,
}

impl BuildContext {
    /// Creates a context that writes into `<output>/FV` and `<output>/FV/Ffs`.
    pub fn new(workspace: impl Into<PathBuf>, output: &Path) -> Self {
        let fv_dir = output.join("FV");
        let ffs_dir = fv_dir.join("Ffs");
        Self {
            workspace: workspace.into(),
            fv_dir,
            ffs_dir,
            address_file: None,
            makefile: false,
            module_filter: None,
            vtf: IndexMap::new(),
            layout: FlashLayout::default(),
            images: Mutex::new(HashMap::new()),
        }
    }

    /// Resolves `p` against the workspace unless it is already absolute.
    pub fn resolve(&self, p: &Path) -> PathBuf {
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.workspace.join(p)
        }
    }

    pub fn control_file(&self, volume: &str) -> PathBuf {
        self.fv_dir.join(format!("{volume}.inf"))
    }

    pub fn ext_file(&self, volume: &str) -> PathBuf {
        self.fv_dir.join(format!("{volume}.ext"))
    }

    pub fn volume_address_file(&self, volume: &str) -> PathBuf {
        self.ffs_dir.join(format!("{volume}.inf"))
    }

    pub fn manifest_file(&self, volume: &str) -> PathBuf {
        self.fv_dir.join(format!("AsBuild{volume}.inf"))
    }

    pub fn output_image(&self, desc: &VolumeDescriptor) -> PathBuf {
        match &desc.create_file {
            Some(p) => self.resolve(p),
            None => self.fv_dir.join(format!("{}.Fv", desc.name)),
        }
    }

    pub fn vtf_for(&self, volume: &str) -> Option<&Path> {
        self.vtf
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(volume))
            .map(|(_, v)| v.as_path())
    }

    /// Checks `module` against the single-module filter, if any.
    pub fn selects(&self, module: &ModuleRef) -> bool {
        let Some(filter) = &self.module_filter else {
            return true;
        };
        let filter = normalize(&filter.to_string_lossy());
        filter.contains(&normalize(&module.inf.to_string_lossy()))
    }

    /// Returns the image already built for `volume` during this build.
    pub fn image(&self, volume: &str) -> Option<PathBuf> {
        self.images
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&volume.to_uppercase())
            .cloned()
    }

    pub fn record_image(&self, volume: &str, path: PathBuf) {
        self.images
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(volume.to_uppercase(), path);
    }
}

fn normalize(p: &str) -> String {
    p.replace('\\', "/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{ModuleKind, ModuleSource};

    fn module(inf: &str) -> ModuleRef {
        ModuleRef {
            name: "PlatformPei".to_string(),
            guid: "222C386D-5ABC-4FB4-B124-FBB82488ACF4".parse().unwrap(),
            inf: inf.into(),
            arch: "IA32".to_string(),
            kind: ModuleKind::Inf,
            source: ModuleSource::Prebuilt("x.ffs".into()),
            as_built: None,
        }
    }

    #[test]
    fn paths() {
        let ctx = BuildContext::new("/ws", Path::new("/ws/Build"));
        assert_eq!(
            ctx.control_file("FVMAIN"),
            Path::new("/ws/Build/FV/FVMAIN.inf")
        );
        assert_eq!(
            ctx.volume_address_file("FVMAIN"),
            Path::new("/ws/Build/FV/Ffs/FVMAIN.inf")
        );
        assert_eq!(
            ctx.manifest_file("FVMAIN"),
            Path::new("/ws/Build/FV/AsBuildFVMAIN.inf")
        );

        let mut desc = VolumeDescriptor::new("FVMAIN");
        assert_eq!(
            ctx.output_image(&desc),
            Path::new("/ws/Build/FV/FVMAIN.Fv")
        );
        desc.create_file = Some("out/main.fv".into());
        assert_eq!(ctx.output_image(&desc), Path::new("/ws/out/main.fv"));
    }

    #[test]
    fn image_cache_ignores_case() {
        let ctx = BuildContext::new("/ws", Path::new("/ws/Build"));
        assert_eq!(ctx.image("FvMain"), None);
        ctx.record_image("FvMain", "/ws/Build/FV/FVMAIN.Fv".into());
        assert_eq!(
            ctx.image("FVMAIN"),
            Some(PathBuf::from("/ws/Build/FV/FVMAIN.Fv"))
        );
    }

    #[test]
    fn module_filter() {
        let mut ctx = BuildContext::new("/ws", Path::new("/ws/Build"));
        let m = module("OvmfPkg/PlatformPei/PlatformPei.inf");
        assert!(ctx.selects(&m));

        ctx.module_filter =
            Some("/ws\\OvmfPkg\\PlatformPei\\PlatformPei.inf".into());
        assert!(ctx.selects(&m));
        assert!(!ctx.selects(&module("MdeModulePkg/Core/Pei/PeiMain.inf")));
    }
}
