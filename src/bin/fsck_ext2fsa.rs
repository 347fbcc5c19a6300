use std::env;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use colored::*;
use ext2fsa::{run_check, Ext2Image};
use tracing_subscriber::EnvFilter;

fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let path = env::args()
        .nth(1)
        .map(PathBuf::from)
        .context("Uso: fsck.ext2fsa imagen.img")?;

    let image = Ext2Image::open_path(&path)
        .with_context(|| format!("No se pudo abrir la imagen {:?}", path))?;

    let rep = run_check(&image);
    let sb = image.superblock();

    println!("\n{}", " EXT2 FILESYSTEM CHECK ".on_blue().bold());
    println!("{}", "──────────────────────────────────────────".blue());
    println!(
        "  {} bloques de {} bytes, {} grupos, volumen {:?}",
        sb.blocks_count, sb.block_size, sb.group_count, sb.volume_name
    );

    // ——————————————————————————————————————————
    //       SUPERBLOCK
    // ——————————————————————————————————————————
    println!("\n{}", "Superblock".bold().underline());

    if rep.superblock_ok {
        println!("  {} Superblock OK", "✓".green());
    } else {
        println!("  {} Errores en el superblock", "✗".red());
    }

    // ——————————————————————————————————————————
    //       GRUPOS
    // ——————————————————————————————————————————
    println!("\n{}", "Grupos".bold().underline());

    if rep.groups_ok {
        println!("  {} Descriptores OK", "✓".green());
    } else {
        println!("  {} Errores en descriptores de grupo", "✗".red());
    }

    // ——————————————————————————————————————————
    //       ÁRBOL
    // ——————————————————————————————————————————
    println!("\n{}", "Árbol de directorios".bold().underline());

    if rep.tree_ok {
        println!(
            "  {} Árbol OK ({} directorios, {} archivos)",
            "✓".green(),
            rep.directories,
            rep.files
        );
    } else {
        println!("  {} Errores en el árbol", "✗".red());
    }

    // ——————————————————————————————————————————
    //       ERRORES DETALLADOS
    // ——————————————————————————————————————————
    println!("\n{}", "Errores detectados".bold().underline());

    if rep.errors.is_empty() {
        println!("  {} No se encontraron errores", "✓".green());
    } else {
        for err in &rep.errors {
            println!("  {} {}", "•".red(), err.red());
        }
    }

    println!("\n{}", "Resumen".bold().underline());

    if rep.is_clean() {
        println!("{} Sistema de archivos limpio.\n", "✓ OK".green().bold());
        Ok(ExitCode::SUCCESS)
    } else {
        println!(
            "{} {} errores encontrados.\n",
            "✗ Revisión completada con errores:".red().bold(),
            rep.errors.len().to_string().yellow()
        );
        Ok(ExitCode::from(1))
    }
}
