// src/bin/ext2fsa.rs
//
// Analizador de imágenes ext2: info, root, traverse, file.
use std::env;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use ext2fsa::group::read_group_descriptors;
use ext2fsa::layout::ROOT_INO;
use ext2fsa::superblock::read_superblock;
use ext2fsa::{
    DirectoryEntry, Ext2Image, GroupDescriptor, Superblock, TraversalEvent, TraversalOptions,
};

const USAGE: &str = "Uso: ext2fsa imagen.img <info|root|traverse|file INODO|/camino> \
[-o salida|-] [--json] [--raw] [--all] [--detect-cycles] [--max-depth N]";

#[derive(Debug, PartialEq)]
enum FileTarget {
    Inode(u32),
    Path(String),
}

#[derive(Debug, PartialEq)]
enum Command {
    Info,
    Root,
    Traverse,
    File(FileTarget),
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Command::Info => "info",
            Command::Root => "root",
            Command::Traverse => "traverse",
            Command::File(_) => "file",
        }
    }
}

#[derive(Debug)]
struct Args {
    image: PathBuf,
    command: Command,
    /// `None` es stdout.
    output: Option<PathBuf>,
    json: bool,
    raw: bool,
    traversal: TraversalOptions,
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Result<Args> {
    let mut positional = Vec::new();
    let mut output: Option<String> = None;
    let mut json = false;
    let mut raw = false;
    let mut traversal = TraversalOptions::default();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-o" | "--output" => output = Some(args.next().context(USAGE)?),
            "--json" => json = true,
            "--raw" => raw = true,
            "--all" => traversal.include_dot_entries = true,
            "--detect-cycles" => traversal.detect_cycles = true,
            "--max-depth" => {
                let n = args.next().context(USAGE)?;
                traversal.max_depth = Some(
                    n.parse()
                        .with_context(|| format!("--max-depth espera un número, no {n:?}"))?,
                );
            }
            flag if flag.starts_with("--") => bail!("Opción desconocida {flag}\n{USAGE}"),
            _ => positional.push(arg),
        }
    }

    let mut positional = positional.into_iter();
    let image = positional.next().map(PathBuf::from).context(USAGE)?;
    let command = match positional.next().context(USAGE)?.as_str() {
        "info" => Command::Info,
        "root" => Command::Root,
        "traverse" => Command::Traverse,
        "file" => {
            let target = positional.next().context(USAGE)?;
            if target.starts_with('/') {
                Command::File(FileTarget::Path(target))
            } else {
                let ino = target
                    .parse()
                    .with_context(|| format!("Inodo inválido {target:?}"))?;
                Command::File(FileTarget::Inode(ino))
            }
        }
        other => bail!("Comando desconocido {other:?}\n{USAGE}"),
    };
    if let Some(extra) = positional.next() {
        bail!("Argumento inesperado {extra:?}\n{USAGE}");
    }

    // Sin -o se escribe <comando>_output.txt; "-o -" es stdout.
    let output = match output.as_deref() {
        Some("-") => None,
        Some(path) => Some(PathBuf::from(path)),
        None => Some(PathBuf::from(format!("{}_output.txt", command.name()))),
    };

    Ok(Args {
        image,
        command,
        output,
        json,
        raw,
        traversal,
    })
}

fn open_output(output: &Option<PathBuf>) -> Result<Box<dyn Write>> {
    Ok(match output {
        Some(path) => Box::new(BufWriter::new(
            File::create(path).with_context(|| format!("No se pudo crear {:?}", path))?,
        )),
        None => Box::new(BufWriter::new(io::stdout().lock())),
    })
}

// -----------------------------------------------------------------------------
// info
// -----------------------------------------------------------------------------

#[derive(Serialize)]
struct InfoRecord<'a> {
    superblock: &'a Superblock,
    groups: &'a [GroupDescriptor],
    error: Option<String>,
}

fn write_superblock(out: &mut dyn Write, sb: &Superblock) -> io::Result<()> {
    writeln!(out, "Tamaño de bloque: {}", sb.block_size)?;
    writeln!(out, "Bloques totales: {}", sb.blocks_count)?;
    writeln!(out, "Tamaño del disco: {} bytes", sb.disk_size())?;
    writeln!(out, "Bloques libres: {}", sb.free_blocks_count)?;
    writeln!(out, "Inodos totales: {}", sb.inodes_count)?;
    writeln!(out, "Inodos libres: {}", sb.free_inodes_count)?;
    writeln!(out, "Bloques por grupo: {}", sb.blocks_per_group)?;
    writeln!(out, "Tamaño de inodo: {}", sb.inode_size)?;
    writeln!(out, "Inodos por grupo: {}", sb.inodes_per_group)?;
    writeln!(out, "Bloques de tabla de inodos por grupo: {}", sb.inode_table_blocks_per_group())?;
    writeln!(out, "Cantidad de grupos: {}", sb.group_count)?;
    writeln!(out, "Revisión: {} (primer inodo libre {})", sb.rev_level, sb.first_ino)?;
    writeln!(out, "Volumen: {:?}  UUID: {}", sb.volume_name, sb.uuid_string())?;
    writeln!(out, "Montado: {}  Escrito: {}", sb.mtime, sb.wtime)
}

fn write_group(out: &mut dyn Write, index: usize, gd: &GroupDescriptor) -> io::Result<()> {
    writeln!(out)?;
    writeln!(out, "Grupo {index}")?;
    writeln!(out, "  Bitmap de bloques: {}", gd.block_bitmap)?;
    writeln!(out, "  Bitmap de inodos: {}", gd.inode_bitmap)?;
    writeln!(out, "  Tabla de inodos: {}", gd.inode_table)?;
    writeln!(out, "  Bloques libres: {}", gd.free_blocks_count)?;
    writeln!(out, "  Inodos libres: {}", gd.free_inodes_count)?;
    writeln!(out, "  Directorios: {}", gd.used_dirs_count)
}

fn run_info(args: &Args, out: &mut dyn Write) -> Result<()> {
    // No se usa Ext2Image::open: una tabla truncada igual se muestra.
    let file = File::open(&args.image)
        .with_context(|| format!("No se pudo abrir la imagen {:?}", args.image))?;
    let sb = read_superblock(&file).context("Superblock inválido")?;
    let (groups, error) = match read_group_descriptors(&file, &sb) {
        Ok(groups) => (groups, None),
        Err(e) => (e.read, Some(e.source)),
    };

    if args.json {
        let record = InfoRecord {
            superblock: &sb,
            groups: &groups,
            error: error.as_ref().map(|e| e.to_string()),
        };
        serde_json::to_writer_pretty(&mut *out, &record)?;
        writeln!(out)?;
    } else {
        write_superblock(out, &sb)?;
        for (i, gd) in groups.iter().enumerate() {
            write_group(out, i, gd)?;
        }
    }
    out.flush()?;

    match error {
        Some(e) => Err(e).with_context(|| {
            format!("Tabla de descriptores incompleta ({} de {} grupos)", groups.len(), sb.group_count)
        }),
        None => Ok(()),
    }
}

// -----------------------------------------------------------------------------
// root
// -----------------------------------------------------------------------------

fn write_entry(out: &mut dyn Write, e: &DirectoryEntry) -> io::Result<()> {
    writeln!(
        out,
        "inodo {:>6}  rec_len {:>4}  name_len {:>3}  tipo {:>2}  {}",
        e.inode,
        e.rec_len,
        e.name_len,
        e.file_type.raw(),
        e.name_str()
    )
}

fn run_root(args: &Args, out: &mut dyn Write) -> Result<()> {
    let image = open_image(args)?;
    let listing = image
        .list_directory(ROOT_INO)
        .context("No se pudo leer el directorio raíz")?;

    if args.json {
        serde_json::to_writer_pretty(&mut *out, &listing.entries)?;
        writeln!(out)?;
    } else {
        for e in &listing.entries {
            write_entry(out, e)?;
        }
        for e in &listing.errors {
            writeln!(out, "! bloque {}: {}", e.block, e.error)?;
        }
    }
    out.flush()?;
    Ok(())
}

// -----------------------------------------------------------------------------
// traverse
// -----------------------------------------------------------------------------

fn run_traverse(args: &Args, out: &mut dyn Write) -> Result<()> {
    let image = open_image(args)?;

    if args.json {
        let traversal = image.walk(args.traversal.clone());
        serde_json::to_writer_pretty(&mut *out, &traversal)?;
        writeln!(out)?;
    } else {
        // Los caminos salen a medida que se visitan; los diagnósticos al final.
        let mut diagnostics = Vec::new();
        for event in image.traverse(args.traversal.clone()) {
            match event {
                TraversalEvent::Entry(v) => writeln!(out, "{}", v.path)?,
                TraversalEvent::Diagnostic(d) => diagnostics.push(d),
            }
        }
        if !diagnostics.is_empty() {
            writeln!(out)?;
            writeln!(out, "Diagnósticos:")?;
            for d in &diagnostics {
                match d.block {
                    Some(block) => writeln!(out, "  {} (inodo {}, bloque {}): {}", d.path, d.inode, block, d.kind)?,
                    None => writeln!(out, "  {} (inodo {}): {}", d.path, d.inode, d.kind)?,
                }
            }
        }
    }
    out.flush()?;
    Ok(())
}

// -----------------------------------------------------------------------------
// file
// -----------------------------------------------------------------------------

fn run_file(args: &Args, target: &FileTarget, out: &mut dyn Write) -> Result<()> {
    let image = open_image(args)?;
    let ino = match target {
        FileTarget::Inode(ino) => *ino,
        FileTarget::Path(path) => image
            .resolve_path(path)
            .with_context(|| format!("No se pudo resolver {path:?}"))?
            .with_context(|| format!("{path:?} no existe"))?,
    };
    let inode = image
        .inode(ino)
        .with_context(|| format!("No se pudo leer el inodo {ino}"))?;

    if args.json {
        serde_json::to_writer_pretty(&mut *out, &inode)?;
        writeln!(out)?;
        out.flush()?;
        return Ok(());
    }

    // Se escribe lo leído aunque un bloque falle a mitad de camino.
    let mut content = Vec::new();
    let mut failure = None;
    for block in image.file_blocks(&inode) {
        match block {
            Ok(data) => content.extend_from_slice(&data),
            Err(e) => failure = Some(e),
        }
    }
    if !args.raw {
        content.truncate(inode.size as usize);
    }
    out.write_all(&content)?;
    out.flush()?;

    match failure {
        Some(e) => Err(e).with_context(|| format!("Contenido del inodo {ino} incompleto")),
        None => Ok(()),
    }
}

fn open_image(args: &Args) -> Result<Ext2Image<File>> {
    Ext2Image::open_path(&args.image)
        .with_context(|| format!("No se pudo abrir la imagen {:?}", args.image))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(io::stderr)
        .init();

    let args = parse_args(env::args().skip(1))?;
    let mut out = open_output(&args.output)?;

    match &args.command {
        Command::Info => run_info(&args, &mut *out),
        Command::Root => run_root(&args, &mut *out),
        Command::Traverse => run_traverse(&args, &mut *out),
        Command::File(target) => run_file(&args, target, &mut *out),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(line: &str) -> Result<Args> {
        parse_args(line.split_whitespace().map(String::from))
    }

    #[test]
    fn default_output_is_named_after_the_command() {
        let args = parse("disco.img traverse").unwrap();
        assert_eq!(args.command, Command::Traverse);
        assert_eq!(args.output, Some(PathBuf::from("traverse_output.txt")));

        let args = parse("disco.img info -o -").unwrap();
        assert_eq!(args.output, None);
    }

    #[test]
    fn file_accepts_inode_or_path() {
        let args = parse("disco.img file 12 --raw").unwrap();
        assert_eq!(args.command, Command::File(FileTarget::Inode(12)));
        assert!(args.raw);

        let args = parse("disco.img file /sub/nota.txt --output nota.bin").unwrap();
        assert_eq!(args.command, Command::File(FileTarget::Path("/sub/nota.txt".into())));
        assert_eq!(args.output, Some(PathBuf::from("nota.bin")));
    }

    #[test]
    fn traversal_flags() {
        let args = parse("disco.img traverse --detect-cycles --max-depth 3 --all").unwrap();
        assert!(args.traversal.detect_cycles);
        assert!(args.traversal.include_dot_entries);
        assert_eq!(args.traversal.max_depth, Some(3));
    }

    #[test]
    fn rejects_bad_input() {
        assert!(parse("disco.img").is_err());
        assert!(parse("disco.img borrar").is_err());
        assert!(parse("disco.img file abc").is_err());
        assert!(parse("disco.img root extra").is_err());
        assert!(parse("disco.img root --nope").is_err());
    }
}
