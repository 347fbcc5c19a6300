// src/mkimage.rs
//
// Constructor en memoria de imágenes ext2 pequeñas (revisión 1, sin
// características opcionales). Sirve para pruebas y demostraciones: el
// núcleo del crate es de solo lectura y nunca modifica una imagen existente.
//
// Layout de cada grupo (bloques de `BLOCKS_PER_GROUP`):
//   grupo 0: superblock, tabla de descriptores (1 bloque), bitmap de bloques,
//            bitmap de inodos, tabla de inodos, datos
//   grupo n: bitmap de bloques, bitmap de inodos, tabla de inodos, datos

use std::collections::BTreeMap;

use crate::layout::{
    block_offset, dir_entry_min_len, group_table_block, superblock_block, BLOCK_POINTERS,
    DIRECT_BLOCKS, DIR_ENTRY_HEADER, EXT2_FT_DIR, EXT2_FT_REG_FILE, EXT2_MAGIC, GROUP_DESC_SIZE,
    MIN_BLOCK_SIZE, ROOT_INO, SUPERBLOCK_OFFSET, S_IFDIR, S_IFREG,
};

pub const BLOCKS_PER_GROUP: u32 = 64;
pub const INODES_PER_GROUP: u32 = 32;
pub const FIRST_INO: u32 = 11;
const FIXED_TIME: u32 = 1_700_000_000;
const MAX_NAME_LEN: usize = 255;

/// Posiciones (en bloques) de las estructuras de un grupo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupLayout {
    pub start: u32,
    pub block_bitmap: u32,
    pub inode_bitmap: u32,
    pub inode_table: u32,
    pub inode_table_blocks: u32,
    pub first_data: u32,
    /// Primer bloque que ya no pertenece al grupo.
    pub end: u32,
}

#[derive(Debug, Clone)]
struct RawEntry {
    name: Vec<u8>,
    inode: u32,
    file_type: u8,
}

#[derive(Debug, Clone)]
enum NodeKind {
    Dir(Vec<RawEntry>),
    File(Vec<u8>),
}

#[derive(Debug, Clone)]
struct Node {
    kind: NodeKind,
    links: u16,
}

#[derive(Debug, Clone)]
pub struct ImageBuilder {
    block_size: u32,
    log_block_size: u32,
    inode_size: u16,
    min_groups: u32,
    zero_tables: Vec<u32>,
    volume_name: String,
    nodes: BTreeMap<u32, Node>,
    next_ino: u32,
}

impl ImageBuilder {
    /// `block_size` se normaliza a una potencia de dos entre 1 KiB y 64 KiB.
    pub fn new(block_size: u32) -> Self {
        let log_block_size = (block_size.clamp(MIN_BLOCK_SIZE, 65536).ilog2()) - 10;
        let mut nodes = BTreeMap::new();
        nodes.insert(
            ROOT_INO,
            Node {
                kind: NodeKind::Dir(vec![
                    raw(".", ROOT_INO, EXT2_FT_DIR),
                    raw("..", ROOT_INO, EXT2_FT_DIR),
                ]),
                links: 2,
            },
        );

        Self {
            block_size: MIN_BLOCK_SIZE << log_block_size,
            log_block_size,
            inode_size: 128,
            min_groups: 1,
            zero_tables: Vec::new(),
            volume_name: "ext2fsa".to_string(),
            nodes,
            next_ino: FIRST_INO,
        }
    }

    /// Cantidad mínima de grupos; se agregan más si el contenido no cabe.
    pub fn groups(mut self, n: u32) -> Self {
        self.min_groups = n.max(1);
        self
    }

    pub fn inode_size(mut self, size: u16) -> Self {
        self.inode_size = size.max(128);
        self
    }

    pub fn volume_name(mut self, name: &str) -> Self {
        self.volume_name = name.to_string();
        self
    }

    /// Escribe `bg_inode_table = 0` en el descriptor del grupo indicado.
    pub fn zero_inode_table(mut self, group: u32) -> Self {
        self.zero_tables.push(group);
        self
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn add_dir(&mut self, parent: u32, name: &str) -> u32 {
        let ino = self.alloc_ino();
        self.nodes.insert(
            ino,
            Node {
                kind: NodeKind::Dir(vec![
                    raw(".", ino, EXT2_FT_DIR),
                    raw("..", parent, EXT2_FT_DIR),
                ]),
                links: 2,
            },
        );
        self.link(parent, name, ino, EXT2_FT_DIR);
        if let Some(p) = self.nodes.get_mut(&parent) {
            p.links += 1;
        }
        ino
    }

    pub fn add_file(&mut self, parent: u32, name: &str, content: &[u8]) -> u32 {
        let ino = self.alloc_ino();
        self.nodes.insert(
            ino,
            Node {
                kind: NodeKind::File(content.to_vec()),
                links: 0,
            },
        );
        self.link(parent, name, ino, EXT2_FT_REG_FILE);
        ino
    }

    /// Agrega una entrada cruda en `parent` apuntando a `ino`, sin validar
    /// nada (sirve para armar enlaces duros, tipos mal etiquetados o ciclos).
    pub fn add_entry(&mut self, parent: u32, name: &str, ino: u32, file_type: u8) {
        self.link(parent, name, ino, file_type);
    }

    fn alloc_ino(&mut self) -> u32 {
        let ino = self.next_ino;
        self.next_ino += 1;
        ino
    }

    fn link(&mut self, parent: u32, name: &str, ino: u32, file_type: u8) {
        if let Some(Node {
            kind: NodeKind::Dir(entries),
            ..
        }) = self.nodes.get_mut(&parent)
        {
            entries.push(raw(name, ino, file_type));
        }
        if let Some(target) = self.nodes.get_mut(&ino) {
            if let NodeKind::File(_) = target.kind {
                target.links += 1;
            }
        }
    }

    // -------------------------------------------------------------------------
    // Layout
    // -------------------------------------------------------------------------

    fn first_data_block(&self) -> u32 {
        superblock_block(self.block_size)
    }

    pub fn layout(&self) -> GroupLayout {
        self.group_layout(0)
    }

    pub fn group_layout(&self, group: u32) -> GroupLayout {
        let start = self.first_data_block() + group * BLOCKS_PER_GROUP;
        let table_bytes = INODES_PER_GROUP * u32::from(self.inode_size);
        let inode_table_blocks = table_bytes.div_ceil(self.block_size);

        let block_bitmap = if group == 0 {
            // superblock + un bloque de descriptores
            group_table_block(self.block_size) + 1
        } else {
            start
        };
        let inode_bitmap = block_bitmap + 1;
        let inode_table = inode_bitmap + 1;

        GroupLayout {
            start,
            block_bitmap,
            inode_bitmap,
            inode_table,
            inode_table_blocks,
            first_data: inode_table + inode_table_blocks,
            end: start + BLOCKS_PER_GROUP,
        }
    }

    fn blocks_count(groups: u32) -> u32 {
        groups * BLOCKS_PER_GROUP
    }

    fn data_blocks(&self, groups: u32) -> Vec<u32> {
        let total = Self::blocks_count(groups);
        (0..groups)
            .flat_map(|g| {
                let l = self.group_layout(g);
                l.first_data..l.end.min(total)
            })
            .collect()
    }

    /// Bloques que necesita cada nodo (incluido el bloque indirecto).
    fn blocks_for(&self, node: &Node) -> usize {
        match &node.kind {
            NodeKind::Dir(entries) => pack_dir(entries, self.block_size).len(),
            NodeKind::File(content) => {
                let data = file_block_count(content.len(), self.block_size);
                if data > DIRECT_BLOCKS {
                    data + 1
                } else {
                    data
                }
            }
        }
    }

    fn group_count(&self) -> u32 {
        let max_ino = self.next_ino - 1;
        let mut groups = self.min_groups.max(max_ino.div_ceil(INODES_PER_GROUP));
        let needed: usize = self.nodes.values().map(|n| self.blocks_for(n)).sum();
        while self.data_blocks(groups).len() < needed {
            groups += 1;
        }
        groups
    }

    // -------------------------------------------------------------------------
    // Construcción
    // -------------------------------------------------------------------------

    pub fn build(&self) -> Vec<u8> {
        let bs = self.block_size as usize;
        let groups = self.group_count();
        let blocks_count = Self::blocks_count(groups);
        let mut img = vec![0u8; blocks_count as usize * bs];

        let mut free = self.data_blocks(groups).into_iter();
        let mut used_blocks: Vec<u32> = Vec::new();
        let mut dirs_per_group = vec![0u16; groups as usize];

        for (&ino, node) in &self.nodes {
            let mut pointers = [0u32; BLOCK_POINTERS];
            let mut allocated = 0u32;

            let (mode, size) = match &node.kind {
                NodeKind::Dir(entries) => {
                    let blocks = pack_dir(entries, self.block_size);
                    for (i, data) in blocks.iter().enumerate().take(DIRECT_BLOCKS) {
                        let Some(b) = free.next() else { break };
                        write_block(&mut img, self.block_size, b, data);
                        pointers[i] = b;
                        used_blocks.push(b);
                        allocated += 1;
                    }
                    dirs_per_group[((ino - 1) / INODES_PER_GROUP) as usize] += 1;
                    (S_IFDIR | 0o755, allocated * self.block_size)
                }
                NodeKind::File(content) => {
                    let per_indirect = bs / 4;
                    let max_blocks = DIRECT_BLOCKS + per_indirect;
                    let chunks: Vec<&[u8]> = content.chunks(bs).take(max_blocks).collect();
                    let mut indirect: Vec<u32> = Vec::new();

                    if chunks.len() > DIRECT_BLOCKS {
                        if let Some(b) = free.next() {
                            pointers[DIRECT_BLOCKS] = b;
                            used_blocks.push(b);
                            allocated += 1;
                        }
                    }
                    for (i, chunk) in chunks.iter().enumerate() {
                        let Some(b) = free.next() else { break };
                        write_block(&mut img, self.block_size, b, chunk);
                        used_blocks.push(b);
                        allocated += 1;
                        if i < DIRECT_BLOCKS {
                            pointers[i] = b;
                        } else {
                            indirect.push(b);
                        }
                    }
                    if pointers[DIRECT_BLOCKS] != 0 {
                        let raw: Vec<u8> = indirect.iter().flat_map(|b| b.to_le_bytes()).collect();
                        write_block(&mut img, self.block_size, pointers[DIRECT_BLOCKS], &raw);
                    }
                    let size = content.len().min(max_blocks * bs) as u32;
                    (S_IFREG | 0o644, size)
                }
            };

            let record = inode_record(
                self.inode_size,
                mode,
                size,
                node.links,
                allocated * (self.block_size / 512),
                &pointers,
            );
            let off = self.inode_offset(ino) as usize;
            img[off..off + record.len()].copy_from_slice(&record);
        }

        let used_inodes: Vec<u32> = (1..FIRST_INO)
            .chain(self.nodes.keys().copied().filter(|&i| i >= FIRST_INO))
            .collect();
        self.write_bitmaps(&mut img, groups, &used_blocks, &used_inodes);
        let free_blocks =
            self.write_group_table(&mut img, groups, &used_blocks, &used_inodes, &dirs_per_group);
        let free_inodes = groups * INODES_PER_GROUP - used_inodes.len() as u32;
        self.write_superblock(&mut img, groups, free_blocks, free_inodes);

        img
    }

    fn inode_offset(&self, ino: u32) -> u64 {
        let group = (ino - 1) / INODES_PER_GROUP;
        let index = (ino - 1) % INODES_PER_GROUP;
        block_offset(self.block_size, self.group_layout(group).inode_table)
            + u64::from(index) * u64::from(self.inode_size)
    }

    fn write_bitmaps(&self, img: &mut [u8], groups: u32, used_blocks: &[u32], used_inodes: &[u32]) {
        let bs = self.block_size;
        for g in 0..groups {
            let l = self.group_layout(g);
            let bb = block_offset(bs, l.block_bitmap) as usize;
            let ib = block_offset(bs, l.inode_bitmap) as usize;

            for b in l.start..l.first_data {
                set_bit(&mut img[bb..bb + bs as usize], (b - l.start) as usize);
            }
            for &b in used_blocks.iter().filter(|&&b| b >= l.start && b < l.end) {
                set_bit(&mut img[bb..bb + bs as usize], (b - l.start) as usize);
            }
            for &i in used_inodes.iter().filter(|&&i| (i - 1) / INODES_PER_GROUP == g) {
                set_bit(&mut img[ib..ib + bs as usize], ((i - 1) % INODES_PER_GROUP) as usize);
            }
        }
    }

    /// Escribe los descriptores y devuelve el total de bloques libres.
    fn write_group_table(
        &self,
        img: &mut [u8],
        groups: u32,
        used_blocks: &[u32],
        used_inodes: &[u32],
        dirs_per_group: &[u16],
    ) -> u32 {
        let blocks_count = Self::blocks_count(groups);
        let table = block_offset(self.block_size, group_table_block(self.block_size)) as usize;
        let mut total_free = 0u32;

        for g in 0..groups {
            let l = self.group_layout(g);
            let end = l.end.min(blocks_count);
            let used_data = used_blocks.iter().filter(|&&b| b >= l.start && b < end).count() as u32;
            let free_blocks = end.saturating_sub(l.first_data) - used_data;
            let used_in_group = used_inodes
                .iter()
                .filter(|&&i| (i - 1) / INODES_PER_GROUP == g)
                .count() as u32;
            total_free += free_blocks;

            let inode_table = if self.zero_tables.contains(&g) { 0 } else { l.inode_table };
            let off = table + g as usize * GROUP_DESC_SIZE;
            let d = &mut img[off..off + GROUP_DESC_SIZE];
            put_u32(d, 0, l.block_bitmap);
            put_u32(d, 4, l.inode_bitmap);
            put_u32(d, 8, inode_table);
            put_u16(d, 12, free_blocks as u16);
            put_u16(d, 14, (INODES_PER_GROUP - used_in_group) as u16);
            put_u16(d, 16, dirs_per_group[g as usize]);
        }

        total_free
    }

    fn write_superblock(&self, img: &mut [u8], groups: u32, free_blocks: u32, free_inodes: u32) {
        let off = SUPERBLOCK_OFFSET as usize;
        let sb = &mut img[off..off + 1024];

        put_u32(sb, 0x00, groups * INODES_PER_GROUP);
        put_u32(sb, 0x04, Self::blocks_count(groups));
        put_u32(sb, 0x08, 0);
        put_u32(sb, 0x0C, free_blocks);
        put_u32(sb, 0x10, free_inodes);
        put_u32(sb, 0x14, self.first_data_block());
        put_u32(sb, 0x18, self.log_block_size);
        put_u32(sb, 0x1C, self.log_block_size);
        put_u32(sb, 0x20, BLOCKS_PER_GROUP);
        put_u32(sb, 0x24, BLOCKS_PER_GROUP);
        put_u32(sb, 0x28, INODES_PER_GROUP);
        put_u32(sb, 0x2C, FIXED_TIME);
        put_u32(sb, 0x30, FIXED_TIME);
        put_u16(sb, 0x36, 20);
        put_u16(sb, 0x38, EXT2_MAGIC);
        put_u16(sb, 0x3A, 1); // limpio
        put_u16(sb, 0x3C, 1);
        put_u32(sb, 0x4C, 1);
        put_u32(sb, 0x54, FIRST_INO);
        put_u16(sb, 0x58, self.inode_size);
        put_u32(sb, 0x60, 0x0002); // INCOMPAT_FILETYPE

        for (i, b) in sb[0x68..0x78].iter_mut().enumerate() {
            *b = 0xE2 ^ (i as u8 * 17);
        }
        let name = self.volume_name.as_bytes();
        let n = name.len().min(16);
        sb[0x78..0x78 + n].copy_from_slice(&name[..n]);
    }
}

// -----------------------------------------------------------------------------
// Helpers de serialización
// -----------------------------------------------------------------------------

fn raw(name: &str, inode: u32, file_type: u8) -> RawEntry {
    let bytes = name.as_bytes();
    RawEntry {
        name: bytes[..bytes.len().min(MAX_NAME_LEN)].to_vec(),
        inode,
        file_type,
    }
}

fn file_block_count(len: usize, block_size: u32) -> usize {
    len.div_ceil(block_size as usize)
}

/// Reparte las entradas en bloques; la última de cada bloque se estira hasta
/// el final para que la suma de `rec_len` sea exactamente el tamaño de bloque.
fn pack_dir(entries: &[RawEntry], block_size: u32) -> Vec<Vec<u8>> {
    let bs = block_size as usize;
    let mut blocks = Vec::new();
    let mut cur = vec![0u8; bs];
    let mut off = 0usize;
    let mut last: Option<usize> = None;

    for e in entries {
        let len = dir_entry_min_len(e.name.len());
        if off + len > bs {
            if let Some(l) = last {
                put_u16(&mut cur, l + 4, (bs - l) as u16);
            }
            blocks.push(std::mem::replace(&mut cur, vec![0u8; bs]));
            off = 0;
        }
        put_u32(&mut cur, off, e.inode);
        put_u16(&mut cur, off + 4, len as u16);
        cur[off + 6] = e.name.len() as u8;
        cur[off + 7] = e.file_type;
        cur[off + DIR_ENTRY_HEADER..off + DIR_ENTRY_HEADER + e.name.len()].copy_from_slice(&e.name);
        last = Some(off);
        off += len;
    }

    if let Some(l) = last {
        put_u16(&mut cur, l + 4, (bs - l) as u16);
        blocks.push(cur);
    }
    blocks
}

fn inode_record(
    inode_size: u16,
    mode: u16,
    size: u32,
    links: u16,
    sectors: u32,
    pointers: &[u32; BLOCK_POINTERS],
) -> Vec<u8> {
    let mut r = vec![0u8; usize::from(inode_size)];
    put_u16(&mut r, 0, mode);
    put_u32(&mut r, 4, size);
    put_u32(&mut r, 8, FIXED_TIME);
    put_u32(&mut r, 12, FIXED_TIME);
    put_u32(&mut r, 16, FIXED_TIME);
    put_u16(&mut r, 26, links);
    put_u32(&mut r, 28, sectors);
    for (i, p) in pointers.iter().enumerate() {
        put_u32(&mut r, 40 + i * 4, *p);
    }
    r
}

/// Escribe `data` al comienzo del bloque; el resto queda en cero.
fn write_block(img: &mut [u8], block_size: u32, block: u32, data: &[u8]) {
    let off = block_offset(block_size, block) as usize;
    let n = data.len().min(block_size as usize);
    img[off..off + n].copy_from_slice(&data[..n]);
}

fn set_bit(bitmap: &mut [u8], idx: usize) {
    bitmap[idx / 8] |= 1 << (idx % 8);
}

fn put_u16(buf: &mut [u8], off: usize, v: u16) {
    buf[off..off + 2].copy_from_slice(&v.to_le_bytes());
}

fn put_u32(buf: &mut [u8], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
}
