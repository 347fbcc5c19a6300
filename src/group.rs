// src/group.rs
use serde::Serialize;
use tracing::warn;

use crate::error::{DecodeError, GroupTableError};
use crate::layout::{block_offset, group_table_block, read_le_u16, read_le_u32, GROUP_DESC_SIZE};
use crate::source::{read_exact_at, ByteSource};
use crate::superblock::Superblock;

/// Descriptor de un grupo de bloques (`ext2_group_desc`, 32 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GroupDescriptor {
    pub block_bitmap: u32,
    pub inode_bitmap: u32,
    pub inode_table: u32,
    pub free_blocks_count: u16,
    pub free_inodes_count: u16,
    pub used_dirs_count: u16,
}

impl GroupDescriptor {
    pub fn parse(buf: &[u8]) -> Result<Self, DecodeError> {
        Ok(Self {
            block_bitmap: read_le_u32(buf, 0)?,
            inode_bitmap: read_le_u32(buf, 4)?,
            inode_table: read_le_u32(buf, 8)?,
            free_blocks_count: read_le_u16(buf, 12)?,
            free_inodes_count: read_le_u16(buf, 14)?,
            used_dirs_count: read_le_u16(buf, 16)?,
        })
    }

    /// Bloque de la tabla de inodos; 0 indica una imagen corrupta o no
    /// soportada y nunca se desreferencia.
    pub fn checked_inode_table(&self, group: u32) -> Result<u32, DecodeError> {
        if self.inode_table == 0 {
            warn!(group, "descriptor de grupo sin tabla de inodos");
            return Err(DecodeError::ZeroInodeTable { group });
        }
        Ok(self.inode_table)
    }
}

/// Offset absoluto del primer descriptor.
pub fn group_table_offset(sb: &Superblock) -> u64 {
    block_offset(sb.block_size, group_table_block(sb.block_size))
}

/// Lee los `group_count` descriptores contiguos que siguen al bloque del
/// superblock.
///
/// Si algún registro queda corto se corta el recorrido y el error lleva los
/// descriptores leídos hasta ese punto.
pub fn read_group_descriptors<S: ByteSource + ?Sized>(
    source: &S,
    sb: &Superblock,
) -> Result<Vec<GroupDescriptor>, GroupTableError> {
    let start = group_table_offset(sb);
    let mut groups = Vec::with_capacity(sb.group_count as usize);

    for i in 0..sb.group_count {
        let offset = start + u64::from(i) * GROUP_DESC_SIZE as u64;
        let parsed = read_exact_at(source, offset, GROUP_DESC_SIZE)
            .and_then(|buf| GroupDescriptor::parse(&buf));

        match parsed {
            Ok(gd) => groups.push(gd),
            Err(source) => {
                warn!(group = i, read = groups.len(), error = %source, "tabla de descriptores truncada");
                return Err(GroupTableError {
                    read: groups,
                    expected: sb.group_count,
                    source,
                });
            }
        }
    }

    Ok(groups)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mkimage::ImageBuilder;
    use crate::superblock::read_superblock;

    #[test]
    fn table_after_superblock_with_1k_blocks() {
        let img = ImageBuilder::new(1024).build();
        let sb = read_superblock(&img).unwrap();
        assert_eq!(group_table_offset(&sb), 2048);

        let groups = read_group_descriptors(&img, &sb).unwrap();
        assert_eq!(groups.len(), 1);
        assert_ne!(groups[0].inode_table, 0);
        assert_eq!(groups[0].used_dirs_count, 1);
    }

    #[test]
    fn table_after_superblock_with_4k_blocks() {
        let img = ImageBuilder::new(4096).build();
        let sb = read_superblock(&img).unwrap();
        assert_eq!(group_table_offset(&sb), 4096);

        let groups = read_group_descriptors(&img, &sb).unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(
            groups[0].inode_table,
            ImageBuilder::new(4096).layout().inode_table
        );
    }

    #[test]
    fn truncated_table_returns_partial_sequence() {
        let img = ImageBuilder::new(1024).groups(3).build();
        let sb = read_superblock(&img).unwrap();
        assert_eq!(sb.group_count, 3);

        // Cortar la imagen en mitad del segundo descriptor.
        let cut = (2048 + GROUP_DESC_SIZE + 10) as usize;
        let short = img[..cut].to_vec();
        let err = read_group_descriptors(&short, &sb).unwrap_err();
        assert_eq!(err.read.len(), 1);
        assert_eq!(err.expected, 3);
        assert!(matches!(
            err.source,
            DecodeError::TruncatedRead { got: 10, .. }
        ));
    }

    #[test]
    fn zero_inode_table_is_reported() {
        let gd = GroupDescriptor {
            block_bitmap: 3,
            inode_bitmap: 4,
            inode_table: 0,
            free_blocks_count: 0,
            free_inodes_count: 0,
            used_dirs_count: 0,
        };
        assert!(matches!(
            gd.checked_inode_table(7),
            Err(DecodeError::ZeroInodeTable { group: 7 })
        ));
    }
}
