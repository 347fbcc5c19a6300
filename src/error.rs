// src/error.rs
use std::io;

use libc::{EINVAL, EIO, ENOENT, ENOTDIR};
use thiserror::Error;

use crate::group::GroupDescriptor;

/// Errores de decodificación de la imagen.
///
/// Todos se devuelven como valores al llamador inmediato; ninguno se reintenta.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Había menos bytes de los pedidos (imagen truncada o registro corto).
    #[error("lectura truncada en offset {offset}: se pedían {needed} bytes, se obtuvieron {got}")]
    TruncatedRead { offset: u64, needed: usize, got: usize },

    /// La firma del superblock no es la de ext2. Fatal para la sesión.
    #[error("magic del superblock inválido (esperado = {expected:#06X}, leído = {found:#06X})", expected = crate::layout::EXT2_MAGIC)]
    BadMagic { found: u16 },

    /// Campos del superblock que no describen una geometría válida.
    #[error("geometría inválida en el superblock: {field}")]
    BadGeometry { field: &'static str },

    #[error("inodo fuera de rango: {inode}")]
    InvalidInode { inode: u32 },

    /// El flujo de entradas de un bloque de directorio viola sus invariantes.
    /// `offset` es relativo al inicio del bloque.
    #[error("entrada de directorio corrupta en offset {offset}: {reason}")]
    CorruptEntry { offset: usize, reason: &'static str },

    #[error("el inodo {inode} no es un directorio")]
    NotADirectory { inode: u32 },

    #[error("el grupo {group} no tiene tabla de inodos (bg_inode_table = 0)")]
    ZeroInodeTable { group: u32 },

    /// Error del read subyacente distinto de fin de archivo.
    #[error("error de E/S: {0}")]
    Io(#[from] io::Error),
}

impl DecodeError {
    pub fn as_errno(&self) -> i32 {
        match self {
            DecodeError::TruncatedRead { .. } => EIO,
            DecodeError::BadMagic { .. } => EINVAL,
            DecodeError::BadGeometry { .. } => EINVAL,
            DecodeError::InvalidInode { .. } => ENOENT,
            DecodeError::CorruptEntry { .. } => EIO,
            DecodeError::NotADirectory { .. } => ENOTDIR,
            DecodeError::ZeroInodeTable { .. } => EIO,
            DecodeError::Io(e) => e.raw_os_error().unwrap_or(EIO),
        }
    }

    /// Errores que invalidan toda la sesión (no sólo una rama o un bloque).
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DecodeError::BadMagic { .. } | DecodeError::BadGeometry { .. } | DecodeError::Io(_)
        )
    }
}

/// La tabla de descriptores se cortó antes de tiempo: se devuelven los
/// descriptores leídos junto con la causa.
#[derive(Debug, Error)]
#[error("tabla de descriptores incompleta ({} de {expected} grupos): {source}", .read.len())]
pub struct GroupTableError {
    pub read: Vec<GroupDescriptor>,
    pub expected: u32,
    #[source]
    pub source: DecodeError,
}
