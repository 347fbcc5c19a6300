// src/image.rs
use std::fs::File;
use std::path::Path;

use tracing::{debug, warn};

use crate::content::{read_file, read_file_content, read_range, FileBlocks};
use crate::dir::{find_entry, list_directory, DirectoryEntry, DirectoryListing};
use crate::error::DecodeError;
use crate::group::{read_group_descriptors, GroupDescriptor};
use crate::inode::{resolve_inode, Inode};
use crate::layout::ROOT_INO;
use crate::source::ByteSource;
use crate::superblock::{read_superblock, Superblock};
use crate::traverse::{walk, Traversal, TraversalOptions, Traverser};

/// Sesión sobre una imagen abierta.
///
/// Es dueña de la fuente, del superblock y de la tabla de descriptores
/// durante toda su vida; lo que devuelve son valores sin referencia de vuelta
/// a la sesión. No hay caché: cada consulta vuelve a leer la fuente. El uso
/// concurrente de una misma sesión debe serializarlo el llamador.
#[derive(Debug)]
pub struct Ext2Image<S> {
    source: S,
    superblock: Superblock,
    groups: Vec<GroupDescriptor>,
}

impl Ext2Image<File> {
    /// Abre una imagen en disco en modo solo lectura.
    pub fn open_path(path: &Path) -> Result<Self, DecodeError> {
        Self::open(File::open(path)?)
    }
}

impl<S: ByteSource> Ext2Image<S> {
    /// Lee el superblock y la tabla de descriptores completa.
    ///
    /// Una tabla truncada hace fallar la apertura (la lista parcial queda en
    /// el log); para inspeccionar una tabla incompleta usar
    /// `group::read_group_descriptors` directamente.
    pub fn open(source: S) -> Result<Self, DecodeError> {
        let superblock = read_superblock(&source)?;
        let groups = match read_group_descriptors(&source, &superblock) {
            Ok(groups) => groups,
            Err(e) => {
                warn!(read = e.read.len(), expected = e.expected, "no se pudo leer la tabla de descriptores");
                return Err(e.source);
            }
        };

        for (i, gd) in groups.iter().enumerate() {
            if gd.inode_table == 0 {
                warn!(group = i, "grupo sin tabla de inodos; sus inodos no serán accesibles");
            }
        }

        debug!(
            block_size = superblock.block_size,
            groups = groups.len(),
            volume = %superblock.volume_name,
            "imagen abierta"
        );
        Ok(Self {
            source,
            superblock,
            groups,
        })
    }

    pub fn superblock(&self) -> &Superblock {
        &self.superblock
    }

    pub fn groups(&self) -> &[GroupDescriptor] {
        &self.groups
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn block_size(&self) -> u32 {
        self.superblock.block_size
    }

    pub fn into_source(self) -> S {
        self.source
    }

    pub fn inode(&self, ino: u32) -> Result<Inode, DecodeError> {
        resolve_inode(&self.source, &self.superblock, &self.groups, ino)
    }

    pub fn root(&self) -> Result<Inode, DecodeError> {
        self.inode(ROOT_INO)
    }

    pub fn list_directory(&self, ino: u32) -> Result<DirectoryListing, DecodeError> {
        list_directory(&self.source, &self.superblock, &self.groups, ino)
    }

    /// Entrada `name` del directorio `dir`, si existe.
    pub fn lookup(&self, dir: u32, name: &[u8]) -> Result<Option<DirectoryEntry>, DecodeError> {
        find_entry(&self.source, &self.superblock, &self.groups, dir, name)
    }

    /// Resuelve un camino absoluto ("/a/b") a un número de inodo.
    ///
    /// `Ok(None)` si algún componente no existe; `NotADirectory` si un
    /// componente intermedio no es un directorio. `.` y `..` se siguen tal
    /// como están en disco.
    pub fn resolve_path(&self, path: &str) -> Result<Option<u32>, DecodeError> {
        let mut current = ROOT_INO;
        for component in path.split('/').filter(|c| !c.is_empty()) {
            match self.lookup(current, component.as_bytes())? {
                Some(entry) => current = entry.inode,
                None => return Ok(None),
            }
        }
        Ok(Some(current))
    }

    pub fn traverse(&self, options: TraversalOptions) -> Traverser<'_, S> {
        Traverser::new(&self.source, &self.superblock, &self.groups, options)
    }

    pub fn walk(&self, options: TraversalOptions) -> Traversal {
        walk(&self.source, &self.superblock, &self.groups, options)
    }

    pub fn file_blocks<'a>(&'a self, inode: &Inode) -> FileBlocks<'a, S> {
        read_file_content(&self.source, &self.superblock, inode)
    }

    pub fn read_file(&self, inode: &Inode) -> Result<Vec<u8>, DecodeError> {
        read_file(&self.source, &self.superblock, inode)
    }

    pub fn read_range(&self, inode: &Inode, offset: u64, size: u32) -> Result<Vec<u8>, DecodeError> {
        read_range(&self.source, &self.superblock, inode, offset, size)
    }
}
