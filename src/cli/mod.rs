use std::env;
use std::path::Path;

use anyhow::{bail, Context, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presentation {
    Console { pause: bool },
    Popup,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CliAction {
    PrintVersion,
    InitConfig,
    Show(Presentation),
}

pub fn parse_args() -> CliAction {
    parse_args_from(env::args().skip(1))
}

pub fn parse_args_from<I, S>(args: I) -> CliAction
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut version_flag = false;
    let mut init_config = false;
    let mut popup = false;
    let mut pause = true;
    for arg in args {
        match arg.as_ref() {
            "--version" | "-V" | "-version" => version_flag = true,
            "--init-config" => init_config = true,
            "--popup" => popup = true,
            "--no-pause" => pause = false,
            _ => {}
        }
    }
    if version_flag {
        return CliAction::PrintVersion;
    }
    if init_config {
        return CliAction::InitConfig;
    }
    if popup {
        return CliAction::Show(Presentation::Popup);
    }
    CliAction::Show(Presentation::Console { pause })
}

pub fn print_version() {
    println!("ohmygpu v{}", env!("CARGO_PKG_VERSION"));
}

pub fn init_config_file() {
    let target = Path::new(crate::config::CONFIG_PATHS[0]);
    match write_config_template(target) {
        Ok(()) => println!("Created {}", target.display()),
        Err(e) => eprintln!("{e:#}"),
    }
}

fn write_config_template(target: &Path) -> Result<()> {
    if target.exists() {
        bail!("{} already exists; aborting --init-config", target.display());
    }
    std::fs::write(target, crate::config::DEFAULT_CONFIG_TEMPLATE)
        .with_context(|| format!("Failed to write {}", target.display()))
}
