/* Revisión de consistencia de solo lectura. Recorre superblock, descriptores
de grupo y el árbol de directorios juntando errores en un reporte; nunca
repara nada. */

use serde::Serialize;

use crate::dir::FileTypeTag;
use crate::error::DecodeError;
use crate::image::Ext2Image;
use crate::inode::InodeKind;
use crate::layout::{superblock_block, DIRECT_BLOCKS, EXT2_FT_UNKNOWN};
use crate::source::ByteSource;
use crate::traverse::{DiagnosticKind, TraversalEvent, TraversalOptions};

#[derive(Debug, Serialize)]
pub struct CheckReport {
    pub superblock_ok: bool,
    pub groups_ok: bool,
    pub tree_ok: bool,
    pub directories: u32,
    pub files: u32,
    pub errors: Vec<String>,
}

impl CheckReport {
    pub fn new() -> Self {
        Self {
            superblock_ok: true,
            groups_ok: true,
            tree_ok: true,
            directories: 0,
            files: 0,
            errors: Vec::new(),
        }
    }

    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

impl Default for CheckReport {
    fn default() -> Self {
        Self::new()
    }
}

fn check_superblock<S: ByteSource>(image: &Ext2Image<S>, report: &mut CheckReport) {
    let sb = image.superblock();
    let mut problems = Vec::new();

    // 1. Cantidad de inodos vs grupos
    let expected = u64::from(sb.inodes_per_group) * u64::from(sb.group_count);
    if u64::from(sb.inodes_count) != expected {
        problems.push(format!(
            "Superblock: inodes_count = {}, pero {} grupos x {} inodos = {}",
            sb.inodes_count, sb.group_count, sb.inodes_per_group, expected
        ));
    }

    // 2. Primer bloque de datos según el tamaño de bloque
    if sb.first_data_block != superblock_block(sb.block_size) {
        problems.push(format!(
            "Superblock: first_data_block = {} no corresponde a bloques de {} bytes",
            sb.first_data_block, sb.block_size
        ));
    }

    // 3. Contadores libres y reservados
    if sb.free_blocks_count > sb.blocks_count {
        problems.push(format!(
            "Superblock: free_blocks_count ({}) mayor que blocks_count ({})",
            sb.free_blocks_count, sb.blocks_count
        ));
    }
    if sb.free_inodes_count > sb.inodes_count {
        problems.push(format!(
            "Superblock: free_inodes_count ({}) mayor que inodes_count ({})",
            sb.free_inodes_count, sb.inodes_count
        ));
    }
    if sb.r_blocks_count > sb.blocks_count {
        problems.push(format!(
            "Superblock: r_blocks_count ({}) mayor que blocks_count ({})",
            sb.r_blocks_count, sb.blocks_count
        ));
    }

    if !problems.is_empty() {
        report.superblock_ok = false;
        report.errors.extend(problems);
    }
}

fn check_groups<S: ByteSource>(image: &Ext2Image<S>, report: &mut CheckReport) {
    let sb = image.superblock();
    let table_blocks = u64::from(sb.inode_table_blocks_per_group());

    for (g, gd) in image.groups().iter().enumerate() {
        if gd.inode_table == 0 {
            report
                .errors
                .push(format!("Grupo {}: bg_inode_table = 0 (sin tabla de inodos)", g));
            report.groups_ok = false;
        } else if u64::from(gd.inode_table) + table_blocks > u64::from(sb.blocks_count) {
            report.errors.push(format!(
                "Grupo {}: la tabla de inodos ({}..{}) pasa el fin del disco ({} bloques)",
                g,
                gd.inode_table,
                u64::from(gd.inode_table) + table_blocks,
                sb.blocks_count
            ));
            report.groups_ok = false;
        }

        for (what, block) in [("block_bitmap", gd.block_bitmap), ("inode_bitmap", gd.inode_bitmap)] {
            if block == 0 || block >= sb.blocks_count {
                report
                    .errors
                    .push(format!("Grupo {}: {} fuera de rango ({})", g, what, block));
                report.groups_ok = false;
            }
        }

        if u32::from(gd.free_inodes_count) > sb.inodes_per_group {
            report.errors.push(format!(
                "Grupo {}: free_inodes_count ({}) mayor que inodos por grupo ({})",
                g, gd.free_inodes_count, sb.inodes_per_group
            ));
            report.groups_ok = false;
        }
    }
}

fn check_tree<S: ByteSource>(image: &Ext2Image<S>, report: &mut CheckReport) {
    let sb = image.superblock();
    let options = TraversalOptions {
        detect_cycles: true,
        ..Default::default()
    };

    match image.root() {
        Ok(root) if root.is_dir() => report.directories += 1,
        Ok(_) => {
            report.errors.push("Inodo raíz no es un directorio".into());
            report.tree_ok = false;
            return;
        }
        Err(e) => {
            report.errors.push(format!("Inodo raíz ilegible: {e}"));
            report.tree_ok = false;
            return;
        }
    }

    for event in image.traverse(options) {
        let visit = match event {
            TraversalEvent::Entry(v) => v,
            TraversalEvent::Diagnostic(d) => {
                let msg = match (&d.kind, d.block) {
                    (DiagnosticKind::CycleSkipped, _) => format!(
                        "{}: directorio {} alcanzado dos veces (ciclo o enlace duro)",
                        d.path, d.inode
                    ),
                    (kind, Some(block)) => format!("{} (bloque {}): {}", d.path, block, kind),
                    (kind, None) => format!("{}: {}", d.path, kind),
                };
                report.errors.push(msg);
                report.tree_ok = false;
                continue;
            }
        };

        let entry = &visit.entry;
        if entry.inode > sb.inodes_count {
            report.errors.push(format!(
                "{}: apunta a inodo inexistente ({})",
                visit.path, entry.inode
            ));
            report.tree_ok = false;
            continue; // no leer un inodo inválido
        }

        let inode = match image.inode(entry.inode) {
            Ok(i) => i,
            Err(DecodeError::ZeroInodeTable { .. }) => continue, // ya reportado por grupo
            Err(e) => {
                report.errors.push(format!("{}: {}", visit.path, e));
                report.tree_ok = false;
                continue;
            }
        };

        // Tipo en la entrada vs modo del inodo
        let kind = inode.kind();
        let mismatch = match entry.file_type {
            FileTypeTag::Directory => kind != InodeKind::Directory,
            FileTypeTag::RegularFile => kind != InodeKind::RegularFile,
            // sin INCOMPAT_FILETYPE todas las entradas traen 0
            FileTypeTag::Other(EXT2_FT_UNKNOWN) => false,
            FileTypeTag::Other(_) => matches!(kind, InodeKind::Directory | InodeKind::RegularFile),
        };
        if mismatch {
            report.errors.push(format!(
                "{}: la entrada declara {:?} pero el inodo {} es {:?}",
                visit.path, entry.file_type, entry.inode, kind
            ));
            report.tree_ok = false;
        }

        match kind {
            InodeKind::Directory => report.directories += 1,
            InodeKind::RegularFile => report.files += 1,
            _ => {}
        }

        // Punteros directos dentro del disco
        for (i, &blk) in inode.block[..DIRECT_BLOCKS].iter().enumerate() {
            if blk != 0 && blk >= sb.blocks_count {
                report.errors.push(format!(
                    "{}: bloque directo {} fuera de rango ({})",
                    visit.path, i, blk
                ));
                report.tree_ok = false;
            }
        }
    }
}

/// Corre todas las revisiones sobre una imagen ya abierta.
pub fn run_check<S: ByteSource>(image: &Ext2Image<S>) -> CheckReport {
    let mut report = CheckReport::new();

    // --- Paso 1: superblock ---
    check_superblock(image, &mut report);

    // --- Paso 2: descriptores de grupo ---
    check_groups(image, &mut report);

    // --- Paso 3: árbol de directorios ---
    check_tree(image, &mut report);

    report
}
