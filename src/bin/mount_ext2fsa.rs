// src/bin/mount_ext2fsa.rs
use std::env;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use ext2fsa::{Ext2Fuse, MountConfig};
use tracing_subscriber::EnvFilter;

const USAGE: &str = "Uso: mount_ext2fsa imagen.img mountpoint/ [--allow-other] [--no-auto-unmount] [--name NOMBRE]";

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    // 1. Leer argumentos: imagen, punto de montaje y banderas opcionales
    let mut args = env::args().skip(1);
    let mut positional: Vec<PathBuf> = Vec::new();
    let mut config = MountConfig::default();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--allow-other" => config.allow_other = true,
            "--no-auto-unmount" => config.auto_unmount = false,
            "--name" => config.fs_name = args.next().context(USAGE)?,
            flag if flag.starts_with("--") => bail!("Opción desconocida {flag}\n{USAGE}"),
            _ => positional.push(PathBuf::from(arg)),
        }
    }

    let mut positional = positional.into_iter();
    let image = positional.next().context(USAGE)?;
    let mountpoint = positional.next().context(USAGE)?;

    // 2. Abrir la imagen (superblock + descriptores)
    let fs = Ext2Fuse::open(&image).context("Error al abrir la imagen ext2")?;

    // 3. Montar en solo lectura
    fs.run(&mountpoint, &config)
}
