//! Build script rendering the `alcib(1)` man page.
//!
//! The page documents the three selectors an operator passes to every run
//! (`--backend`, `--stage`, `--arch`) together with their accepted values,
//! all taken from the clap definition in `src/cli/mod.rs`. It is written to
//! `OUT_DIR/alcib.1` for packaging.

use std::env;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use clap::CommandFactory;
use clap_mangen::Man;

#[path = "src/cli/mod.rs"]
mod cli;

use cli::Cli;

const MAN_PAGE: &str = "alcib.1";

fn render_man_page(out_dir: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let mut page = BufWriter::new(File::create(out_dir.join(MAN_PAGE))?);
    Man::new(Cli::command()).section("1").render(&mut page)?;
    page.flush()?;
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut stdout = std::io::stdout();
    for watched in ["build.rs", "src/cli/mod.rs"] {
        writeln!(stdout, "cargo:rerun-if-changed={watched}")?;
    }

    let out_dir = env::var_os("OUT_DIR").map(PathBuf::from).ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::NotFound, "OUT_DIR was not set")
    })?;
    render_man_page(&out_dir)
}
