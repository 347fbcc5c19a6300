// src/inode.rs
use serde::Serialize;

use crate::error::DecodeError;
use crate::group::GroupDescriptor;
use crate::layout::{
    block_offset, read_le_u16, read_le_u32, BLOCK_POINTERS, DIRECT_BLOCKS, S_IFDIR, S_IFLNK,
    S_IFMT, S_IFREG,
};
use crate::source::{read_exact_at, ByteSource};
use crate::superblock::Superblock;

/// Bytes del inodo que se decodifican; el resto del registro (hasta
/// `inode_size`) se ignora.
const INODE_DECODED_LEN: usize = 112;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum InodeKind {
    RegularFile,
    Directory,
    Symlink,
    Other,
}

/// Inodo decodificado (`ext2_inode`).
///
/// `block[0..12]` son los punteros directos; `block[12..15]` se conservan
/// crudos y nunca se desreferencian.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Inode {
    pub ino: u32,
    pub mode: u16,
    pub uid: u16,
    pub gid: u16,
    pub size: u32,
    pub atime: u32,
    pub ctime: u32,
    pub mtime: u32,
    pub dtime: u32,
    pub links_count: u16,
    /// Sectores de 512 bytes reservados (`i_blocks`).
    pub blocks: u32,
    pub flags: u32,
    pub block: [u32; BLOCK_POINTERS],
}

impl Inode {
    pub fn parse(ino: u32, buf: &[u8]) -> Result<Self, DecodeError> {
        let mut block = [0u32; BLOCK_POINTERS];
        for (i, slot) in block.iter_mut().enumerate() {
            *slot = read_le_u32(buf, 40 + i * 4)?;
        }

        Ok(Self {
            ino,
            mode: read_le_u16(buf, 0)?,
            uid: read_le_u16(buf, 2)?,
            size: read_le_u32(buf, 4)?,
            atime: read_le_u32(buf, 8)?,
            ctime: read_le_u32(buf, 12)?,
            mtime: read_le_u32(buf, 16)?,
            dtime: read_le_u32(buf, 20)?,
            gid: read_le_u16(buf, 24)?,
            links_count: read_le_u16(buf, 26)?,
            blocks: read_le_u32(buf, 28)?,
            flags: read_le_u32(buf, 32)?,
            block,
        })
    }

    pub fn kind(&self) -> InodeKind {
        match self.mode & S_IFMT {
            S_IFREG => InodeKind::RegularFile,
            S_IFDIR => InodeKind::Directory,
            S_IFLNK => InodeKind::Symlink,
            _ => InodeKind::Other,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind() == InodeKind::Directory
    }

    pub fn permissions(&self) -> u16 {
        self.mode & 0o7777
    }

    /// Punteros directos asignados, en orden, hasta el primer 0.
    pub fn direct_blocks(&self) -> impl Iterator<Item = u32> + '_ {
        self.block[..DIRECT_BLOCKS]
            .iter()
            .copied()
            .take_while(|&b| b != 0)
    }
}

/// Offset absoluto del registro del inodo `ino`.
///
/// Los números de inodo empiezan en 1. El grupo de un inodo sin tabla de
/// inodos devuelve `ZeroInodeTable` sin calcular ningún offset.
pub fn inode_offset(
    sb: &Superblock,
    groups: &[GroupDescriptor],
    ino: u32,
) -> Result<u64, DecodeError> {
    if ino < 1 {
        return Err(DecodeError::InvalidInode { inode: ino });
    }

    let group = (ino - 1) / sb.inodes_per_group;
    let index = (ino - 1) % sb.inodes_per_group;
    if group >= sb.group_count {
        return Err(DecodeError::InvalidInode { inode: ino });
    }

    // Tabla de descriptores truncada: el grupo existe pero no se pudo leer.
    let gd = groups
        .get(group as usize)
        .ok_or(DecodeError::InvalidInode { inode: ino })?;
    let table = gd.checked_inode_table(group)?;

    Ok(block_offset(sb.block_size, table) + u64::from(index) * u64::from(sb.inode_size))
}

/// Resuelve y decodifica el inodo `ino`. Cada llamada vuelve a leer la fuente.
pub fn resolve_inode<S: ByteSource + ?Sized>(
    source: &S,
    sb: &Superblock,
    groups: &[GroupDescriptor],
    ino: u32,
) -> Result<Inode, DecodeError> {
    let offset = inode_offset(sb, groups, ino)?;
    let len = usize::from(sb.inode_size).min(INODE_DECODED_LEN);
    let buf = read_exact_at(source, offset, len)?;
    Inode::parse(ino, &buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::read_group_descriptors;
    use crate::layout::ROOT_INO;
    use crate::mkimage::ImageBuilder;
    use crate::superblock::read_superblock;

    fn open(img: &[u8]) -> (Superblock, Vec<GroupDescriptor>) {
        let sb = read_superblock(img).unwrap();
        let groups = read_group_descriptors(img, &sb).unwrap();
        (sb, groups)
    }

    #[test]
    fn every_inode_lands_inside_its_group_table() {
        for (bs, isz) in [(1024, 128), (4096, 256), (2048, 128)] {
            let img = ImageBuilder::new(bs).inode_size(isz).groups(3).build();
            let (sb, groups) = open(&img);

            let table_len = u64::from(sb.inodes_per_group) * u64::from(sb.inode_size);
            for n in 1..=sb.inodes_count {
                let g = ((n - 1) / sb.inodes_per_group) as usize;
                let start = block_offset(sb.block_size, groups[g].inode_table);
                let off = inode_offset(&sb, &groups, n).unwrap();
                assert!(off >= start && off + u64::from(sb.inode_size) <= start + table_len);
            }
        }
    }

    #[test]
    fn out_of_range_inodes() {
        let img = ImageBuilder::new(1024).build();
        let (sb, groups) = open(&img);

        assert!(matches!(
            resolve_inode(&img, &sb, &groups, 0),
            Err(DecodeError::InvalidInode { inode: 0 })
        ));
        let past = sb.inodes_per_group * sb.group_count + 1;
        assert!(matches!(
            resolve_inode(&img, &sb, &groups, past),
            Err(DecodeError::InvalidInode { .. })
        ));
    }

    #[test]
    fn root_is_a_directory() {
        let img = ImageBuilder::new(1024).build();
        let (sb, groups) = open(&img);
        let root = resolve_inode(&img, &sb, &groups, ROOT_INO).unwrap();
        assert_eq!(root.kind(), InodeKind::Directory);
        assert_eq!(root.permissions(), 0o755);
        assert_eq!(root.direct_blocks().count(), 1);
    }

    #[test]
    fn zero_inode_table_is_not_dereferenced() {
        let img = ImageBuilder::new(1024).groups(2).zero_inode_table(1).build();
        let (sb, groups) = open(&img);

        // Grupo 0 sigue respondiendo.
        assert!(resolve_inode(&img, &sb, &groups, ROOT_INO).is_ok());

        let in_group_1 = sb.inodes_per_group + 1;
        assert!(matches!(
            inode_offset(&sb, &groups, in_group_1),
            Err(DecodeError::ZeroInodeTable { group: 1 })
        ));
    }

    #[test]
    fn file_inode_fields() {
        let mut b = ImageBuilder::new(1024);
        let ino = b.add_file(ROOT_INO, "a.txt", b"hola");
        let img = b.build();
        let (sb, groups) = open(&img);

        let inode = resolve_inode(&img, &sb, &groups, ino).unwrap();
        assert_eq!(inode.ino, ino);
        assert_eq!(inode.kind(), InodeKind::RegularFile);
        assert_eq!(inode.size, 4);
        assert_eq!(inode.links_count, 1);
        assert_eq!(inode.blocks, 2);
        assert_eq!(inode.direct_blocks().count(), 1);
    }

    #[test]
    fn direct_blocks_stop_at_first_zero() {
        let mut inode = Inode::parse(12, &[0u8; INODE_DECODED_LEN]).unwrap();
        inode.block[0] = 40;
        inode.block[1] = 41;
        inode.block[3] = 43;
        assert_eq!(inode.direct_blocks().collect::<Vec<_>>(), vec![40, 41]);
    }
}
