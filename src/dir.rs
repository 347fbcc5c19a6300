// src/dir.rs
use serde::{Serialize, Serializer};
use tracing::warn;

use crate::error::DecodeError;
use crate::group::GroupDescriptor;
use crate::inode::{resolve_inode, Inode};
use crate::layout::{
    dir_entry_min_len, read_le_u16, read_le_u32, read_u8, DIR_ENTRY_ALIGN, DIR_ENTRY_HEADER,
    EXT2_FT_DIR, EXT2_FT_REG_FILE,
};
use crate::source::{read_block, ByteSource};
use crate::superblock::Superblock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FileTypeTag {
    RegularFile,
    Directory,
    Other(u8),
}

impl FileTypeTag {
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            EXT2_FT_REG_FILE => FileTypeTag::RegularFile,
            EXT2_FT_DIR => FileTypeTag::Directory,
            other => FileTypeTag::Other(other),
        }
    }

    pub fn raw(self) -> u8 {
        match self {
            FileTypeTag::RegularFile => EXT2_FT_REG_FILE,
            FileTypeTag::Directory => EXT2_FT_DIR,
            FileTypeTag::Other(raw) => raw,
        }
    }
}

/// Entrada de directorio (`ext2_dir_entry_2`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirectoryEntry {
    /// 0 marca una entrada borrada o sin uso.
    pub inode: u32,
    pub rec_len: u16,
    pub name_len: u8,
    pub file_type: FileTypeTag,
    #[serde(serialize_with = "lossy_name")]
    pub name: Vec<u8>,
}

fn lossy_name<S: Serializer>(name: &[u8], s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&String::from_utf8_lossy(name))
}

impl DirectoryEntry {
    pub fn name_str(&self) -> String {
        String::from_utf8_lossy(&self.name).into_owned()
    }

    pub fn is_used(&self) -> bool {
        self.inode != 0
    }

    /// `.` o `..`: nunca disparan recursión.
    pub fn is_dot(&self) -> bool {
        self.name == b"." || self.name == b".."
    }
}

// -----------------------------------------------------------------------------
// Decodificador del flujo de entradas de un bloque
// -----------------------------------------------------------------------------

/// Iterador perezoso sobre las entradas de un bloque de directorio.
///
/// Entrega también las entradas sin uso (inode 0). Ante una violación de
/// invariantes entrega un único `CorruptEntry` con el offset donde se detectó
/// y termina. Clonar el iterador (o llamar otra vez a `decode_entries`)
/// reinicia el recorrido.
#[derive(Debug, Clone)]
pub struct DirEntries<'a> {
    block: &'a [u8],
    offset: usize,
    done: bool,
}

pub fn decode_entries(block: &[u8]) -> DirEntries<'_> {
    DirEntries {
        block,
        offset: 0,
        done: false,
    }
}

impl DirEntries<'_> {
    /// Offset del cursor dentro del bloque.
    pub fn offset(&self) -> usize {
        self.offset
    }

    fn corrupt(&mut self, reason: &'static str) -> Option<Result<DirectoryEntry, DecodeError>> {
        self.done = true;
        Some(Err(DecodeError::CorruptEntry {
            offset: self.offset,
            reason,
        }))
    }
}

impl Iterator for DirEntries<'_> {
    type Item = Result<DirectoryEntry, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.offset == self.block.len() {
            return None;
        }

        let at = self.offset;
        if self.block.len() - at < DIR_ENTRY_HEADER {
            return self.corrupt("cabecera cortada por el fin del bloque");
        }

        // La cabecera cabe: estas lecturas no pueden fallar.
        let (inode, rec_len, name_len, file_type) = match (
            read_le_u32(self.block, at),
            read_le_u16(self.block, at + 4),
            read_u8(self.block, at + 6),
            read_u8(self.block, at + 7),
        ) {
            (Ok(i), Ok(r), Ok(n), Ok(t)) => (i, r, n, t),
            _ => return self.corrupt("cabecera ilegible"),
        };

        let len = usize::from(rec_len);
        if len == 0 {
            return self.corrupt("rec_len = 0");
        }
        if len < DIR_ENTRY_HEADER || len % DIR_ENTRY_ALIGN != 0 {
            return self.corrupt("rec_len no alineado a 4 o menor que la cabecera");
        }
        if at + len > self.block.len() {
            return self.corrupt("rec_len pasa el fin del bloque");
        }
        if inode != 0 && len < dir_entry_min_len(usize::from(name_len)) {
            return self.corrupt("nombre más largo que rec_len");
        }

        // En entradas sin uso el name_len puede ser basura; se recorta al registro.
        let name_end = (at + DIR_ENTRY_HEADER + usize::from(name_len)).min(at + len);
        let name = self.block[at + DIR_ENTRY_HEADER..name_end].to_vec();

        self.offset = at + len;
        Some(Ok(DirectoryEntry {
            inode,
            rec_len,
            name_len,
            file_type: FileTypeTag::from_raw(file_type),
            name,
        }))
    }
}

// -----------------------------------------------------------------------------
// Listado y búsqueda sobre los bloques directos de un directorio
// -----------------------------------------------------------------------------

/// Error local a un bloque de directorio.
#[derive(Debug)]
pub struct BlockError {
    pub block: u32,
    pub error: DecodeError,
}

/// Todas las entradas (usadas o no) de los bloques directos de un directorio.
#[derive(Debug)]
pub struct DirectoryListing {
    pub inode: Inode,
    pub entries: Vec<DirectoryEntry>,
    pub errors: Vec<BlockError>,
}

/// Resuelve `ino` y falla con `NotADirectory` si no es un directorio.
pub fn resolve_directory<S: ByteSource + ?Sized>(
    source: &S,
    sb: &Superblock,
    groups: &[GroupDescriptor],
    ino: u32,
) -> Result<Inode, DecodeError> {
    let inode = resolve_inode(source, sb, groups, ino)?;
    if !inode.is_dir() {
        return Err(DecodeError::NotADirectory { inode: ino });
    }
    Ok(inode)
}

/// Decodifica los bloques directos de un directorio en orden.
///
/// Un bloque corrupto o corto se registra en `errors` y no impide leer los
/// bloques siguientes; las entradas previas a la corrupción se conservan.
pub fn list_directory<S: ByteSource + ?Sized>(
    source: &S,
    sb: &Superblock,
    groups: &[GroupDescriptor],
    ino: u32,
) -> Result<DirectoryListing, DecodeError> {
    let inode = resolve_directory(source, sb, groups, ino)?;
    let mut entries = Vec::new();
    let mut errors = Vec::new();

    for block in inode.direct_blocks() {
        let data = match read_block(source, sb.block_size, block) {
            Ok(d) => d,
            Err(error) => {
                errors.push(BlockError { block, error });
                continue;
            }
        };

        for entry in decode_entries(&data) {
            match entry {
                Ok(e) => entries.push(e),
                Err(error) => {
                    warn!(dir = ino, block, error = %error, "bloque de directorio corrupto");
                    errors.push(BlockError { block, error });
                }
            }
        }
    }

    Ok(DirectoryListing {
        inode,
        entries,
        errors,
    })
}

/// Busca `name` entre las entradas usadas del directorio `dir`.
///
/// Los bloques corruptos se saltan; si el nombre no aparece en ningún bloque
/// legible se devuelve `None`.
pub fn find_entry<S: ByteSource + ?Sized>(
    source: &S,
    sb: &Superblock,
    groups: &[GroupDescriptor],
    dir: u32,
    name: &[u8],
) -> Result<Option<DirectoryEntry>, DecodeError> {
    let listing = list_directory(source, sb, groups, dir)?;
    Ok(listing
        .entries
        .into_iter()
        .find(|e| e.is_used() && e.name == name))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Arma un bloque con entradas (inode, rec_len, tipo, nombre).
    fn block(size: usize, entries: &[(u32, u16, u8, &str)]) -> Vec<u8> {
        let mut b = vec![0u8; size];
        let mut off = 0;
        for &(ino, rec_len, ft, name) in entries {
            b[off..off + 4].copy_from_slice(&ino.to_le_bytes());
            b[off + 4..off + 6].copy_from_slice(&rec_len.to_le_bytes());
            b[off + 6] = name.len() as u8;
            b[off + 7] = ft;
            b[off + 8..off + 8 + name.len()].copy_from_slice(name.as_bytes());
            off += usize::from(rec_len);
        }
        b
    }

    #[test]
    fn well_formed_block_consumes_exactly_its_length() {
        let b = block(
            1024,
            &[
                (2, 12, 2, "."),
                (2, 12, 2, ".."),
                (12, 20, 1, "hello.txt"),
                (13, 980, 2, "sub"),
            ],
        );
        let entries: Vec<_> = decode_entries(&b).collect::<Result<_, _>>().unwrap();
        assert_eq!(entries.len(), 4);
        let total: usize = entries.iter().map(|e| usize::from(e.rec_len)).sum();
        assert_eq!(total, 1024);
        assert_eq!(entries[2].name_str(), "hello.txt");
        assert_eq!(entries[2].file_type, FileTypeTag::RegularFile);
        assert_eq!(entries[3].file_type, FileTypeTag::Directory);
        assert!(entries[0].is_dot() && entries[1].is_dot());
    }

    #[test]
    fn unused_entries_are_yielded_not_terminal() {
        let b = block(1024, &[(0, 12, 1, "old"), (14, 1012, 1, "vivo")]);
        let entries: Vec<_> = decode_entries(&b).collect::<Result<_, _>>().unwrap();
        assert_eq!(entries.len(), 2);
        assert!(!entries[0].is_used());
        assert!(entries[1].is_used());
        assert_eq!(entries[1].name_str(), "vivo");
    }

    #[test]
    fn zero_rec_len_stops_at_its_offset() {
        let b = block(1024, &[(2, 12, 2, "."), (2, 12, 2, ".."), (15, 0, 1, "x")]);
        let items: Vec<_> = decode_entries(&b).collect();
        assert_eq!(items.len(), 3);
        assert!(items[0].is_ok() && items[1].is_ok());
        assert!(matches!(
            items[2],
            Err(DecodeError::CorruptEntry { offset: 24, .. })
        ));
    }

    #[test]
    fn rec_len_past_block_end_is_corrupt() {
        let b = block(1024, &[(2, 12, 2, "."), (2, 1016, 2, "..")]);
        let items: Vec<_> = decode_entries(&b).collect();
        assert!(matches!(
            items.last(),
            Some(Err(DecodeError::CorruptEntry { offset: 12, .. }))
        ));
    }

    #[test]
    fn name_longer_than_record_is_corrupt() {
        let mut b = block(1024, &[(2, 12, 2, "."), (2, 1012, 2, "..")]);
        b[6] = 20; // name_len de "." mayor que su rec_len
        let first = decode_entries(&b).next().unwrap();
        assert!(matches!(first, Err(DecodeError::CorruptEntry { offset: 0, .. })));
    }

    #[test]
    fn misaligned_rec_len_is_corrupt() {
        let b = block(1024, &[(2, 13, 2, ".")]);
        assert!(matches!(
            decode_entries(&b).next(),
            Some(Err(DecodeError::CorruptEntry { offset: 0, .. }))
        ));
    }

    #[test]
    fn decoding_restarts_from_a_clone() {
        let b = block(1024, &[(2, 12, 2, "."), (2, 1012, 2, "..")]);
        let mut it = decode_entries(&b);
        let fresh = it.clone();
        it.next();
        assert_eq!(it.offset(), 12);
        assert_eq!(fresh.count(), 2);
        assert_eq!(it.count(), 1);
    }

    #[test]
    fn all_zero_block_is_corrupt_at_offset_zero() {
        let b = vec![0u8; 1024];
        let items: Vec<_> = decode_entries(&b).collect();
        assert_eq!(items.len(), 1);
        assert!(matches!(
            items[0],
            Err(DecodeError::CorruptEntry { offset: 0, .. })
        ));
    }

    #[test]
    fn file_type_tags_round_trip_raw() {
        assert_eq!(FileTypeTag::from_raw(7), FileTypeTag::Other(7));
        assert_eq!(FileTypeTag::from_raw(2).raw(), 2);
    }

    #[test]
    fn listing_keeps_blocks_after_a_corrupt_one() {
        use crate::group::read_group_descriptors;
        use crate::layout::{block_offset, ROOT_INO};
        use crate::mkimage::ImageBuilder;
        use crate::superblock::read_superblock;

        let mut b = ImageBuilder::new(1024);
        for i in 0..12 {
            b.add_file(ROOT_INO, &format!("{i:02}-{}", "y".repeat(200)), b"");
        }
        let mut img = b.build();
        let sb = read_superblock(&img).unwrap();
        let groups = read_group_descriptors(&img, &sb).unwrap();
        let first = resolve_inode(&img, &sb, &groups, ROOT_INO).unwrap().block[0];

        let off = block_offset(1024, first) as usize;
        img[off + 4..off + 6].copy_from_slice(&0u16.to_le_bytes());

        let listing = list_directory(&img, &sb, &groups, ROOT_INO).unwrap();
        assert_eq!(listing.errors.len(), 1);
        assert_eq!(listing.errors[0].block, first);
        assert!(matches!(
            listing.errors[0].error,
            DecodeError::CorruptEntry { offset: 0, .. }
        ));
        assert_eq!(listing.entries.len(), 8);
        assert!(listing.entries[0].name_str().starts_with("04-"));

        let found = find_entry(&img, &sb, &groups, ROOT_INO, format!("11-{}", "y".repeat(200)).as_bytes());
        assert!(found.unwrap().is_some());
    }
}
