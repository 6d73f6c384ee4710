// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use anyhow::{bail, Result};
use indexmap::{IndexMap, IndexSet};
use termcolor::{Color, ColorSpec, WriteColor};

use build_fv::assemble::{Assembler, Placement};
use build_fv::context::BuildContext;
use build_fv::descriptor::{ModuleSource, VolumeDescriptor};
use build_fv::tools::{GenFv, ToolGenerator};

use crate::config::Config;

pub struct BuildArgs {
    pub volumes: Vec<String>,
    pub jobs: usize,
    pub makefile: bool,
    pub module: Option<PathBuf>,
}

pub fn package(cfg: &Path, args: &BuildArgs) -> Result<()> {
    let toml = Config::from_file(cfg)?;

    let mut selected = Vec::new();
    for name in &args.volumes {
        match toml
            .volumes
            .keys()
            .find(|k| k.eq_ignore_ascii_case(name))
        {
            Some(k) => selected.push(k.clone()),
            None => bail!("{}", toml.volume_name_suggestion(name)),
        }
    }
    if selected.is_empty() {
        selected = toml.volumes.keys().cloned().collect();
    }

    let waves = build_waves(&toml.volumes, &selected)?;

    let mut ctx = BuildContext::new(&toml.workspace, &toml.output);
    ctx.address_file = toml.address_file.clone();
    ctx.makefile = args.makefile;
    ctx.module_filter = args.module.clone();
    ctx.vtf = toml.vtf.clone();
    ctx.layout = toml.layout.clone();

    let mut failures = Vec::new();
    for wave in &waves {
        failures.extend(build_wave(&ctx, &toml, wave, args.jobs));
        if !failures.is_empty() {
            break;
        }
    }

    if !failures.is_empty() {
        report_failures(&failures)?;
        bail!("{} FV(s) failed to build", failures.len());
    }
    Ok(())
}

/// Orders `selected` (and the volumes nested inside them) into waves, such
/// that every volume's nested volumes are built in an earlier wave.
pub fn build_waves(
    volumes: &IndexMap<String, VolumeDescriptor>,
    selected: &[String],
) -> Result<Vec<Vec<String>>> {
    let mut depth: IndexMap<String, usize> = IndexMap::new();
    for name in selected {
        volume_depth(volumes, name, &mut IndexSet::new(), &mut depth)?;
    }

    // Each parent rebuilds its nested volumes at its own addresses, so a
    // volume shared by two parents would be written by both at once.
    let mut parents: IndexMap<&str, &str> = IndexMap::new();
    for name in depth.keys() {
        for m in &volumes[name].modules {
            let ModuleSource::Volume(nested) = &m.source else {
                continue;
            };
            let Some(key) =
                volumes.keys().find(|k| k.eq_ignore_ascii_case(nested))
            else {
                continue;
            };
            match parents.insert(key, name) {
                Some(other) if other != name.as_str() => bail!(
                    "FV {} is nested in both {} and {}",
                    key,
                    other,
                    name
                ),
                _ => (),
            }
        }
    }

    let count = depth.values().map(|d| d + 1).max().unwrap_or(0);
    let mut waves = vec![vec![]; count];
    for (name, d) in depth {
        waves[d].push(name);
    }
    Ok(waves)
}

fn volume_depth(
    volumes: &IndexMap<String, VolumeDescriptor>,
    name: &str,
    stack: &mut IndexSet<String>,
    depth: &mut IndexMap<String, usize>,
) -> Result<usize> {
    let Some((key, desc)) = volumes
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
    else {
        bail!("nested FV {} is not defined", name);
    };
    if let Some(d) = depth.get(key) {
        return Ok(*d);
    }
    if !stack.insert(key.clone()) {
        let chain: Vec<_> = stack.iter().map(String::as_str).collect();
        bail!(
            "FV {} contains itself ({} -> {})",
            key,
            chain.join(" -> "),
            key
        );
    }

    let mut d = 0;
    for m in &desc.modules {
        if let ModuleSource::Volume(nested) = &m.source {
            d = d.max(volume_depth(volumes, nested, stack, depth)? + 1);
        }
    }

    stack.pop();
    depth.insert(key.clone(), d);
    Ok(d)
}

/// Builds one wave on up to `jobs` threads, returning each failure.
fn build_wave(
    ctx: &BuildContext,
    toml: &Config,
    wave: &[String],
    jobs: usize,
) -> Vec<(String, anyhow::Error)> {
    let next = AtomicUsize::new(0);
    let failures = Mutex::new(Vec::new());
    let packer = GenFv::new(&toml.tools.genfv);
    let gen = ToolGenerator::new(&toml.tools, &toml.volumes);

    std::thread::scope(|s| {
        for _ in 0..jobs.clamp(1, wave.len().max(1)) {
            s.spawn(|| loop {
                let i = next.fetch_add(1, Ordering::Relaxed);
                let Some(name) = wave.get(i) else {
                    break;
                };
                let desc = &toml.volumes[name];
                let assembler = Assembler::new(ctx, &packer, &gen);
                match assembler.assemble(desc, &Placement::default()) {
                    Ok(built) => log::info!(
                        "FV {} -> {} ({} pass{})",
                        name,
                        built.image.display(),
                        built.passes,
                        if built.passes == 1 { "" } else { "es" },
                    ),
                    Err(e) => failures
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .push((name.clone(), e)),
                }
            });
        }
    });

    failures.into_inner().unwrap_or_else(|e| e.into_inner())
}

fn report_failures(failures: &[(String, anyhow::Error)]) -> Result<()> {
    let color_choice = if atty::is(atty::Stream::Stderr) {
        termcolor::ColorChoice::Auto
    } else {
        termcolor::ColorChoice::Never
    };
    let mut out_stream = termcolor::StandardStream::stderr(color_choice);
    let out = &mut out_stream;

    for (name, e) in failures {
        let mut color = ColorSpec::new();
        color.set_fg(Some(Color::Red)).set_bold(true);
        out.set_color(&color)?;
        write!(out, "error: ")?;
        out.reset()?;
        writeln!(out, "FV {} failed: {:#}", name, e)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use build_fv::descriptor::{ModuleKind, ModuleRef};

    fn volumes(
        nesting: &[(&str, &[&str])],
    ) -> IndexMap<String, VolumeDescriptor> {
        nesting
            .iter()
            .map(|(name, inner)| {
                let mut desc = VolumeDescriptor::new(*name);
                desc.modules = inner
                    .iter()
                    .map(|n| ModuleRef {
                        name: n.to_string(),
                        guid: "9E21FD93-9C72-4C15-8C4B-E77F1DB2D792"
                            .parse()
                            .unwrap(),
                        inf: PathBuf::new(),
                        arch: "Common".to_string(),
                        kind: ModuleKind::File,
                        source: ModuleSource::Volume(n.to_string()),
                        as_built: None,
                    })
                    .collect();
                (name.to_string(), desc)
            })
            .collect()
    }

    #[test]
    fn nested_volumes_go_first() {
        let v = volumes(&[
            ("FVMAIN_COMPACT", &["PEIFV", "DXEFV"]),
            ("DXEFV", &["NETFV"]),
            ("PEIFV", &[]),
            ("NETFV", &[]),
        ]);
        let waves = build_waves(&v, &["FVMAIN_COMPACT".to_string()]).unwrap();
        assert_eq!(
            waves,
            vec![
                vec!["PEIFV".to_string(), "NETFV".to_string()],
                vec!["DXEFV".to_string()],
                vec!["FVMAIN_COMPACT".to_string()],
            ]
        );
    }

    #[test]
    fn only_what_was_asked_for() {
        let v = volumes(&[
            ("FVMAIN", &["DXEFV"]),
            ("DXEFV", &[]),
            ("PEIFV", &[]),
        ]);
        let waves = build_waves(&v, &["PEIFV".to_string()]).unwrap();
        assert_eq!(waves, vec![vec!["PEIFV".to_string()]]);
        assert!(build_waves(&v, &[]).unwrap().is_empty());
    }

    #[test]
    fn shared_nested_volume() {
        let v = volumes(&[
            ("FVMAIN", &["DXEFV"]),
            ("FVRECOVERY", &["dxefv"]),
            ("DXEFV", &[]),
        ]);
        assert!(build_waves(&v, &["FVMAIN".to_string()]).is_ok());

        let selected = ["FVMAIN".to_string(), "FVRECOVERY".to_string()];
        let err = build_waves(&v, &selected).unwrap_err();
        assert_eq!(
            err.to_string(),
            "FV DXEFV is nested in both FVMAIN and FVRECOVERY"
        );

        // the same parent may include a volume twice
        let v = volumes(&[("FVMAIN", &["DXEFV", "DXEFV"]), ("DXEFV", &[])]);
        assert!(build_waves(&v, &["FVMAIN".to_string()]).is_ok());
    }

    #[test]
    fn self_containing_volume() {
        let v = volumes(&[("A", &["B"]), ("B", &["A"])]);
        let err = build_waves(&v, &["A".to_string()]).unwrap_err();
        assert_eq!(err.to_string(), "FV A contains itself (A -> B -> A)");
    }
}
