// src/superblock.rs
use serde::Serialize;
use tracing::debug;

use crate::error::DecodeError;
use crate::layout::{
    block_size_from_log, read_fixed, read_le_u16, read_le_u32, EXT2_MAGIC, GOOD_OLD_INODE_SIZE,
    GOOD_OLD_REV, SUPERBLOCK_OFFSET, SUPERBLOCK_SIZE,
};
use crate::source::{read_exact_at, ByteSource};

/// Superblock decodificado, con las constantes derivadas ya calculadas.
///
/// Se lee una sola vez al abrir la imagen y no cambia después. `block_size`
/// y `group_count` viajan aquí para que ningún componente los recalcule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Superblock {
    pub inodes_count: u32,
    pub blocks_count: u32,
    pub r_blocks_count: u32,
    pub free_blocks_count: u32,
    pub free_inodes_count: u32,
    pub first_data_block: u32,
    pub log_block_size: u32,
    pub blocks_per_group: u32,
    pub inodes_per_group: u32,
    pub mtime: u32,
    pub wtime: u32,
    pub magic: u16,
    pub state: u16,
    pub rev_level: u32,
    pub first_ino: u32,
    pub inode_size: u16,
    pub uuid: [u8; 16],
    pub volume_name: String,

    // Derivados
    pub block_size: u32,
    pub group_count: u32,
}

impl Superblock {
    /// Decodifica el registro de 1024 bytes (ya leído desde el offset 1024).
    pub fn parse(buf: &[u8]) -> Result<Self, DecodeError> {
        if buf.len() < SUPERBLOCK_SIZE {
            return Err(DecodeError::TruncatedRead {
                offset: SUPERBLOCK_OFFSET,
                needed: SUPERBLOCK_SIZE,
                got: buf.len(),
            });
        }

        let magic = read_le_u16(buf, 0x38)?;
        if magic != EXT2_MAGIC {
            return Err(DecodeError::BadMagic { found: magic });
        }

        let blocks_count = read_le_u32(buf, 0x04)?;
        let log_block_size = read_le_u32(buf, 0x18)?;
        let blocks_per_group = read_le_u32(buf, 0x20)?;
        let inodes_per_group = read_le_u32(buf, 0x28)?;
        let rev_level = read_le_u32(buf, 0x4C)?;

        let block_size = block_size_from_log(log_block_size).ok_or(DecodeError::BadGeometry {
            field: "s_log_block_size",
        })?;
        if blocks_per_group == 0 {
            return Err(DecodeError::BadGeometry { field: "s_blocks_per_group" });
        }
        if inodes_per_group == 0 {
            return Err(DecodeError::BadGeometry { field: "s_inodes_per_group" });
        }

        let (first_ino, inode_size) = if rev_level == GOOD_OLD_REV {
            (11, GOOD_OLD_INODE_SIZE)
        } else {
            (read_le_u32(buf, 0x54)?, read_le_u16(buf, 0x58)?)
        };
        // Un inodo no puede ser menor que el registro clásico ni cruzar bloques.
        if inode_size < GOOD_OLD_INODE_SIZE
            || !inode_size.is_power_of_two()
            || u32::from(inode_size) > block_size
        {
            return Err(DecodeError::BadGeometry { field: "s_inode_size" });
        }

        let volume_raw: [u8; 16] = read_fixed(buf, 0x78)?;
        let name_end = volume_raw.iter().position(|&b| b == 0).unwrap_or(volume_raw.len());

        Ok(Self {
            inodes_count: read_le_u32(buf, 0x00)?,
            blocks_count,
            r_blocks_count: read_le_u32(buf, 0x08)?,
            free_blocks_count: read_le_u32(buf, 0x0C)?,
            free_inodes_count: read_le_u32(buf, 0x10)?,
            first_data_block: read_le_u32(buf, 0x14)?,
            log_block_size,
            blocks_per_group,
            inodes_per_group,
            mtime: read_le_u32(buf, 0x2C)?,
            wtime: read_le_u32(buf, 0x30)?,
            magic,
            state: read_le_u16(buf, 0x3A)?,
            rev_level,
            first_ino,
            inode_size,
            uuid: read_fixed(buf, 0x68)?,
            volume_name: String::from_utf8_lossy(&volume_raw[..name_end]).into_owned(),
            block_size,
            group_count: blocks_count.div_ceil(blocks_per_group),
        })
    }

    /// Tamaño total de la imagen según el superblock.
    pub fn disk_size(&self) -> u64 {
        u64::from(self.blocks_count) * u64::from(self.block_size)
    }

    /// Bloques que ocupa la tabla de inodos de cada grupo.
    pub fn inode_table_blocks_per_group(&self) -> u32 {
        let bytes = u64::from(self.inodes_per_group) * u64::from(self.inode_size);
        (bytes / u64::from(self.block_size)) as u32
    }

    pub fn uuid_string(&self) -> String {
        let u = &self.uuid;
        format!(
            "{:02x}{:02x}{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
            u[0], u[1], u[2], u[3], u[4], u[5], u[6], u[7],
            u[8], u[9], u[10], u[11], u[12], u[13], u[14], u[15]
        )
    }
}

/// Lee y valida el superblock de `source`.
pub fn read_superblock<S: ByteSource + ?Sized>(source: &S) -> Result<Superblock, DecodeError> {
    let buf = read_exact_at(source, SUPERBLOCK_OFFSET, SUPERBLOCK_SIZE)?;
    let sb = Superblock::parse(&buf)?;
    debug!(
        block_size = sb.block_size,
        groups = sb.group_count,
        inodes = sb.inodes_count,
        inode_size = sb.inode_size,
        "superblock leído"
    );
    Ok(sb)
}
