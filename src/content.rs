// src/content.rs
use crate::error::DecodeError;
use crate::inode::Inode;
use crate::layout::DIRECT_BLOCKS;
use crate::source::{read_block, ByteSource};
use crate::superblock::Superblock;

/// Bloques de datos de un inodo, en orden de punteros directos.
///
/// Termina en el primer puntero 0 o tras 12 bloques. Una lectura corta entrega
/// un `TruncatedRead` y corta la secuencia: lo entregado antes queda válido.
/// Los punteros indirectos nunca se siguen, así que un archivo de más de 12
/// bloques sale truncado.
pub struct FileBlocks<'a, S: ?Sized> {
    source: &'a S,
    block_size: u32,
    pointers: [u32; DIRECT_BLOCKS],
    next: usize,
    failed: bool,
}

pub fn read_file_content<'a, S: ByteSource + ?Sized>(
    source: &'a S,
    sb: &Superblock,
    inode: &Inode,
) -> FileBlocks<'a, S> {
    let mut pointers = [0u32; DIRECT_BLOCKS];
    pointers.copy_from_slice(&inode.block[..DIRECT_BLOCKS]);
    FileBlocks {
        source,
        block_size: sb.block_size,
        pointers,
        next: 0,
        failed: false,
    }
}

impl<S: ByteSource + ?Sized> Iterator for FileBlocks<'_, S> {
    type Item = Result<Vec<u8>, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.next >= DIRECT_BLOCKS {
            return None;
        }
        let ptr = self.pointers[self.next];
        if ptr == 0 {
            return None;
        }
        self.next += 1;

        let block = read_block(self.source, self.block_size, ptr);
        if block.is_err() {
            self.failed = true;
        }
        Some(block)
    }
}

/// Contenido del archivo recortado a `i_size`.
///
/// Si algún bloque falla se devuelve el error; los bytes leídos hasta ahí se
/// pierden (usar `read_file_content` para conservarlos).
pub fn read_file<S: ByteSource + ?Sized>(
    source: &S,
    sb: &Superblock,
    inode: &Inode,
) -> Result<Vec<u8>, DecodeError> {
    let limit = DIRECT_BLOCKS * sb.block_size as usize;
    let mut out = Vec::with_capacity((inode.size as usize).min(limit));
    for block in read_file_content(source, sb, inode) {
        out.extend_from_slice(&block?);
    }
    out.truncate(inode.size as usize);
    Ok(out)
}

/// Lee `size` bytes desde `offset` dentro del archivo, sin pasar de `i_size`
/// ni de los bloques directos.
///
/// Sólo se leen los bloques que cubren el rango. Un puntero 0 antes del final
/// corta la lectura; un bloque ilegible devuelve el error.
pub fn read_range<S: ByteSource + ?Sized>(
    source: &S,
    sb: &Superblock,
    inode: &Inode,
    offset: u64,
    size: u32,
) -> Result<Vec<u8>, DecodeError> {
    let bs = u64::from(sb.block_size);
    let file_size = u64::from(inode.size).min(DIRECT_BLOCKS as u64 * bs);
    if offset >= file_size || size == 0 {
        return Ok(Vec::new());
    }
    let end = (offset + u64::from(size)).min(file_size);

    let first = (offset / bs) as usize;
    let last = ((end - 1) / bs) as usize;

    let mut out = Vec::with_capacity((end - offset) as usize);
    for (i, &ptr) in inode.block[first..=last].iter().enumerate() {
        if ptr == 0 {
            break;
        }
        let block = read_block(source, sb.block_size, ptr)?;
        let block_start = (first + i) as u64 * bs;
        let from = offset.saturating_sub(block_start) as usize;
        let to = ((end - block_start) as usize).min(block.len());
        if from < to {
            out.extend_from_slice(&block[from..to]);
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::read_group_descriptors;
    use crate::inode::resolve_inode;
    use crate::layout::ROOT_INO;
    use crate::mkimage::ImageBuilder;
    use crate::superblock::read_superblock;

    fn file_image(bs: u32, content: &[u8]) -> (Vec<u8>, u32) {
        let mut b = ImageBuilder::new(bs);
        let ino = b.add_file(ROOT_INO, "datos.bin", content);
        (b.build(), ino)
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 251) as u8).collect()
    }

    #[test]
    fn small_file_round_trip() {
        let (img, ino) = file_image(1024, b"hello, ext2\n");
        let sb = read_superblock(&img).unwrap();
        let groups = read_group_descriptors(&img, &sb).unwrap();
        let inode = resolve_inode(&img, &sb, &groups, ino).unwrap();

        let blocks: Vec<_> = read_file_content(&img, &sb, &inode)
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].len(), 1024);
        assert!(blocks[0].starts_with(b"hello, ext2\n"));
        assert_eq!(read_file(&img, &sb, &inode).unwrap(), b"hello, ext2\n");
    }

    #[test]
    fn at_most_twelve_blocks_even_with_indirect() {
        let content = pattern(1024 * 14 + 100);
        let (img, ino) = file_image(1024, &content);
        let sb = read_superblock(&img).unwrap();
        let groups = read_group_descriptors(&img, &sb).unwrap();
        let inode = resolve_inode(&img, &sb, &groups, ino).unwrap();
        assert_ne!(inode.block[12], 0);

        let blocks: Vec<_> = read_file_content(&img, &sb, &inode)
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(blocks.len(), DIRECT_BLOCKS);
        assert_eq!(blocks.concat(), content[..1024 * 12]);
        assert_eq!(read_file(&img, &sb, &inode).unwrap(), content[..1024 * 12]);
    }

    #[test]
    fn stops_at_first_zero_pointer() {
        let (img, ino) = file_image(1024, &pattern(3000));
        let sb = read_superblock(&img).unwrap();
        let groups = read_group_descriptors(&img, &sb).unwrap();
        let mut inode = resolve_inode(&img, &sb, &groups, ino).unwrap();
        inode.block[1] = 0;

        assert_eq!(read_file_content(&img, &sb, &inode).count(), 1);
    }

    #[test]
    fn short_read_ends_sequence_after_partial_output() {
        let (img, ino) = file_image(1024, &pattern(3000));
        let sb = read_superblock(&img).unwrap();
        let groups = read_group_descriptors(&img, &sb).unwrap();
        let mut inode = resolve_inode(&img, &sb, &groups, ino).unwrap();
        inode.block[1] = sb.blocks_count + 10;

        let items: Vec<_> = read_file_content(&img, &sb, &inode).collect();
        assert_eq!(items.len(), 2);
        assert!(items[0].is_ok());
        assert!(matches!(items[1], Err(DecodeError::TruncatedRead { .. })));
    }

    #[test]
    fn ranged_reads_cross_block_boundaries() {
        let content = pattern(5000);
        let (img, ino) = file_image(2048, &content);
        let sb = read_superblock(&img).unwrap();
        let groups = read_group_descriptors(&img, &sb).unwrap();
        let inode = resolve_inode(&img, &sb, &groups, ino).unwrap();

        assert_eq!(read_range(&img, &sb, &inode, 2000, 100).unwrap(), content[2000..2100]);
        assert_eq!(read_range(&img, &sb, &inode, 4990, 100).unwrap(), content[4990..]);
        assert!(read_range(&img, &sb, &inode, 5000, 10).unwrap().is_empty());
        assert_eq!(read_range(&img, &sb, &inode, 0, 5000).unwrap(), content);
    }

    #[test]
    fn ranged_read_reports_unreadable_leading_block() {
        let (img, ino) = file_image(1024, &pattern(3000));
        let sb = read_superblock(&img).unwrap();
        let groups = read_group_descriptors(&img, &sb).unwrap();
        let mut inode = resolve_inode(&img, &sb, &groups, ino).unwrap();
        inode.block[0] = sb.blocks_count + 10;

        assert!(matches!(
            read_range(&img, &sb, &inode, 1500, 100),
            Err(DecodeError::TruncatedRead { .. })
        ));
        assert!(read_range(&img, &sb, &inode, 0, 10).is_err());
    }

    #[test]
    fn ranged_read_ignores_oversized_i_size() {
        let content = pattern(1024 * 14);
        let (img, ino) = file_image(1024, &content);
        let sb = read_superblock(&img).unwrap();
        let groups = read_group_descriptors(&img, &sb).unwrap();
        let mut inode = resolve_inode(&img, &sb, &groups, ino).unwrap();
        inode.size = u32::MAX;

        assert!(read_range(&img, &sb, &inode, 1024 * 12, 10).unwrap().is_empty());
        assert_eq!(
            read_range(&img, &sb, &inode, 1024 * 12 - 4, 10).unwrap(),
            content[1024 * 12 - 4..1024 * 12]
        );
        assert_eq!(read_file(&img, &sb, &inode).unwrap(), content[..1024 * 12]);
    }
}
