// src/layout.rs
//
// Constantes del formato ext2 en disco y la aritmética de offsets.
// Todo cálculo "bloque -> byte" del crate pasa por `block_offset`.

use crate::error::DecodeError;

// -----------------------------------------------------------------------------
// Constantes del formato
// -----------------------------------------------------------------------------

/// Offset absoluto del superblock dentro de la imagen.
pub const SUPERBLOCK_OFFSET: u64 = 1024;
/// Bytes que ocupa el registro del superblock.
pub const SUPERBLOCK_SIZE: usize = 1024;
pub const EXT2_MAGIC: u16 = 0xEF53;

/// Unidad base del tamaño de bloque (`1024 << s_log_block_size`).
pub const MIN_BLOCK_SIZE: u32 = 1024;
/// ext2 no define bloques mayores a 64 KiB.
pub const MAX_LOG_BLOCK_SIZE: u32 = 6;

pub const GROUP_DESC_SIZE: usize = 32;

pub const ROOT_INO: u32 = 2;
pub const GOOD_OLD_INODE_SIZE: u16 = 128;
pub const GOOD_OLD_REV: u32 = 0;

/// Punteros directos de `i_block`; los slots 12..15 son indirectos.
pub const DIRECT_BLOCKS: usize = 12;
pub const BLOCK_POINTERS: usize = 15;

/// Cabecera fija de una entrada de directorio: inode, rec_len, name_len, file_type.
pub const DIR_ENTRY_HEADER: usize = 8;
pub const DIR_ENTRY_ALIGN: usize = 4;

pub const EXT2_FT_UNKNOWN: u8 = 0;
pub const EXT2_FT_REG_FILE: u8 = 1;
pub const EXT2_FT_DIR: u8 = 2;

pub const S_IFMT: u16 = 0o170_000;
pub const S_IFREG: u16 = 0o100_000;
pub const S_IFDIR: u16 = 0o040_000;
pub const S_IFLNK: u16 = 0o120_000;

// -----------------------------------------------------------------------------
// Lectores little-endian con chequeo de límites
// -----------------------------------------------------------------------------

pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], DecodeError> {
    let end = offset.checked_add(len).ok_or(DecodeError::TruncatedRead {
        offset: offset as u64,
        needed: len,
        got: 0,
    })?;

    if end > data.len() {
        return Err(DecodeError::TruncatedRead {
            offset: offset as u64,
            needed: len,
            got: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn read_u8(data: &[u8], offset: usize) -> Result<u8, DecodeError> {
    Ok(ensure_slice(data, offset, 1)?[0])
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, DecodeError> {
    let b = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([b[0], b[1]]))
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, DecodeError> {
    let b = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], DecodeError> {
    let b = ensure_slice(data, offset, N)?;
    let mut out = [0u8; N];
    out.copy_from_slice(b);
    Ok(out)
}

// -----------------------------------------------------------------------------
// Aritmética de offsets (única definición)
// -----------------------------------------------------------------------------

/// Tamaño de bloque a partir de `s_log_block_size`.
pub fn block_size_from_log(log_block_size: u32) -> Option<u32> {
    if log_block_size > MAX_LOG_BLOCK_SIZE {
        return None;
    }
    Some(MIN_BLOCK_SIZE << log_block_size)
}

/// Offset absoluto en bytes del bloque `block_id`.
///
/// Los bloques se numeran desde el byte 0 de la imagen (el bloque 0 existe
/// siempre, aunque con bloques de 1 KiB sólo contiene el sector de arranque).
#[inline]
pub fn block_offset(block_size: u32, block_id: u32) -> u64 {
    u64::from(block_id) * u64::from(block_size)
}

/// Bloque que contiene al superblock.
///
/// Con bloques de 1 KiB el superblock (byte 1024) cae en el bloque 1; con
/// bloques mayores comparte el bloque 0 con el relleno de arranque.
pub fn superblock_block(block_size: u32) -> u32 {
    if block_size == MIN_BLOCK_SIZE {
        1
    } else {
        0
    }
}

/// Primer bloque de la tabla de descriptores de grupo: el bloque que sigue
/// inmediatamente al del superblock.
pub fn group_table_block(block_size: u32) -> u32 {
    superblock_block(block_size) + 1
}

/// Largo mínimo de una entrada con `name_len` bytes de nombre, alineado a 4.
pub fn dir_entry_min_len(name_len: usize) -> usize {
    (DIR_ENTRY_HEADER + name_len + DIR_ENTRY_ALIGN - 1) & !(DIR_ENTRY_ALIGN - 1)
}
