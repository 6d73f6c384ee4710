// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

mod config;
mod dist;
mod map;

#[derive(Debug, Parser)]
#[clap(
    max_term_width = 80,
    about = "extra tasks to help you build firmware volumes"
)]
enum Xtask {
    /// Assembles firmware volumes from their modules, running the packer
    /// twice for volumes whose nested volumes move.
    Fv {
        /// Log every tool invocation.
        #[clap(short)]
        verbose: bool,
        /// Number of volumes to build at once.
        #[clap(short, long, default_value_t = 1)]
        jobs: usize,
        /// Only work out output paths; write no control files and run no
        /// tools.
        #[clap(long)]
        makefile: bool,
        /// Only regenerate modules whose INF path is part of this path.
        #[clap(long)]
        module: Option<PathBuf>,
        /// Path to the flash description.
        #[clap(parse(from_os_str))]
        cfg: PathBuf,
        /// Volumes to build; all of them if none are given.
        volumes: Vec<String>,
    },

    /// Prints the offset of every file in a built volume.
    Map {
        /// Path to the flash description.
        #[clap(parse(from_os_str))]
        cfg: PathBuf,
        volume: String,
    },
}

fn main() -> Result<()> {
    let xtask = Xtask::parse();

    let default_filter = match &xtask {
        Xtask::Fv { verbose: true, .. } => "debug",
        _ => "info",
    };
    let env = env_logger::Env::default().filter_or("RUST_LOG", default_filter);
    env_logger::init_from_env(env);

    match xtask {
        Xtask::Fv {
            verbose: _,
            jobs,
            makefile,
            module,
            cfg,
            volumes,
        } => {
            let args = dist::BuildArgs {
                volumes,
                jobs,
                makefile,
                module,
            };
            dist::package(&cfg, &args)?;
        }
        Xtask::Map { cfg, volume } => {
            map::run(&cfg, &volume)?;
        }
    }

    Ok(())
}
