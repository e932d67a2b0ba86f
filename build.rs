//! Build script for voxclient
//!
//! Renders man pages for the binary and each subcommand from the clap
//! definitions in src/cli.rs.

use clap::CommandFactory;
use clap_mangen::Man;
use std::env;
use std::fs::{self, File};
use std::io::Error;
use std::path::{Path, PathBuf};

// Include the CLI module
include!("src/cli.rs");

fn render(command: clap::Command, path: &Path) -> Result<(), Error> {
    let mut file = File::create(path)?;
    Man::new(command).render(&mut file)
}

fn main() -> Result<(), Error> {
    println!("cargo:rerun-if-changed=src/cli.rs");
    println!("cargo:rerun-if-env-changed=VOXCLIENT_GEN_MANPAGES");

    // Release builds always get man pages; other profiles on request
    let release = env::var("PROFILE").map_or(false, |p| p == "release");
    if !release && env::var_os("VOXCLIENT_GEN_MANPAGES").is_none() {
        return Ok(());
    }

    let man_dir = env::var_os("OUT_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("target"))
        .join("man");
    fs::create_dir_all(&man_dir)?;

    let cli = Cli::command();
    render(cli.clone(), &man_dir.join("voxclient.1"))?;

    for sub in cli.get_subcommands().filter(|s| s.get_name() != "help") {
        let page = man_dir.join(format!("voxclient-{}.1", sub.get_name()));
        render(sub.clone(), &page)?;
    }

    println!("cargo:warning=Man pages generated in: {}", man_dir.display());
    Ok(())
}
