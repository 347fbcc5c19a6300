use std::ffi::OsStr;
use std::fs::File;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use fuser::{
    FileAttr, FileType, Filesystem, MountOption, ReplyAttr, ReplyData, ReplyDirectory, ReplyEntry,
    ReplyOpen, ReplyStatfs, Request,
};
use tracing::{trace, warn};

use crate::dir::FileTypeTag;
use crate::error::DecodeError;
use crate::image::Ext2Image;
use crate::inode::Inode;
use crate::layout::{ROOT_INO, S_IFDIR, S_IFLNK, S_IFMT};
use crate::source::ByteSource;

/// Inodo raíz según FUSE.
pub const FUSE_ROOT_INO: u64 = 1;

const TTL: Duration = Duration::from_secs(1);
const NAME_LEN: u32 = 255;

// Tipos de `i_mode` que ext2 comparte con POSIX.
const S_IFCHR: u16 = 0o020000;
const S_IFBLK: u16 = 0o060000;
const S_IFIFO: u16 = 0o010000;
const S_IFSOCK: u16 = 0o140000;

/// Opciones de montaje. El montaje siempre es de solo lectura.
#[derive(Debug, Clone)]
pub struct MountConfig {
    pub fs_name: String,
    pub allow_other: bool,
    pub auto_unmount: bool,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            fs_name: "ext2fsa".to_string(),
            allow_other: false,
            auto_unmount: true,
        }
    }
}

impl MountConfig {
    pub fn options(&self) -> Vec<MountOption> {
        let mut options = vec![
            MountOption::FSName(self.fs_name.clone()),
            MountOption::RO,
            MountOption::DefaultPermissions,
        ];
        if self.auto_unmount {
            options.push(MountOption::AutoUnmount);
        }
        if self.allow_other {
            options.push(MountOption::AllowOther);
        }
        options
    }
}

// -----------------------------------------------------------------------------
// Traducción de números de inodo
// -----------------------------------------------------------------------------
//
// FUSE exige que la raíz sea el inodo 1, en ext2 es el 2. Se intercambian los
// dos números; el resto pasa igual.

pub fn to_fuse_ino(ext2: u32) -> u64 {
    match ext2 {
        ROOT_INO => FUSE_ROOT_INO,
        1 => u64::from(ROOT_INO),
        n => u64::from(n),
    }
}

pub fn to_ext2_ino(fuse: u64) -> Option<u32> {
    match fuse {
        FUSE_ROOT_INO => Some(ROOT_INO),
        2 => Some(1),
        n => u32::try_from(n).ok(),
    }
}

// -----------------------------------------------------------------------------
// Conversión de Inode a FileAttr de FUSE
// -----------------------------------------------------------------------------

fn to_system_time(secs: u32) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(u64::from(secs))
}

pub fn file_type_from_mode(mode: u16) -> FileType {
    match mode & S_IFMT {
        S_IFDIR => FileType::Directory,
        S_IFLNK => FileType::Symlink,
        S_IFCHR => FileType::CharDevice,
        S_IFBLK => FileType::BlockDevice,
        S_IFIFO => FileType::NamedPipe,
        S_IFSOCK => FileType::Socket,
        _ => FileType::RegularFile,
    }
}

/// Tipo según la etiqueta de la entrada (1..=7 en ext2).
pub fn file_type_from_tag(tag: FileTypeTag) -> FileType {
    match tag {
        FileTypeTag::Directory => FileType::Directory,
        FileTypeTag::RegularFile => FileType::RegularFile,
        FileTypeTag::Other(3) => FileType::CharDevice,
        FileTypeTag::Other(4) => FileType::BlockDevice,
        FileTypeTag::Other(5) => FileType::NamedPipe,
        FileTypeTag::Other(6) => FileType::Socket,
        FileTypeTag::Other(7) => FileType::Symlink,
        FileTypeTag::Other(_) => FileType::RegularFile,
    }
}

pub fn inode_to_attr(inode: &Inode, block_size: u32) -> FileAttr {
    let ctime = to_system_time(inode.ctime);
    FileAttr {
        ino: to_fuse_ino(inode.ino),
        size: u64::from(inode.size),
        // i_blocks cuenta sectores de 512 bytes, igual que st_blocks
        blocks: u64::from(inode.blocks),
        atime: to_system_time(inode.atime),
        mtime: to_system_time(inode.mtime),
        ctime,
        crtime: ctime,
        kind: file_type_from_mode(inode.mode),
        perm: inode.permissions(),
        nlink: u32::from(inode.links_count),
        uid: u32::from(inode.uid),
        gid: u32::from(inode.gid),
        rdev: 0,
        blksize: block_size,
        flags: 0,
    }
}

// -----------------------------------------------------------------------------
// Sistema de archivos
// -----------------------------------------------------------------------------

pub struct Ext2Fuse<S = File> {
    image: Ext2Image<S>,
}

impl Ext2Fuse<File> {
    pub fn open(path: &Path) -> Result<Self> {
        let image = Ext2Image::open_path(path)
            .with_context(|| format!("No se pudo abrir la imagen {:?}", path))?;
        Ok(Self::new(image))
    }
}

impl<S: ByteSource> Ext2Fuse<S> {
    pub fn new(image: Ext2Image<S>) -> Self {
        Self { image }
    }

    pub fn image(&self) -> &Ext2Image<S> {
        &self.image
    }

    fn inode(&self, fuse_ino: u64) -> Result<Inode, DecodeError> {
        let ino = to_ext2_ino(fuse_ino).ok_or(DecodeError::InvalidInode { inode: u32::MAX })?;
        self.image.inode(ino)
    }

    fn attr(&self, fuse_ino: u64) -> Result<FileAttr, DecodeError> {
        let inode = self.inode(fuse_ino)?;
        Ok(inode_to_attr(&inode, self.image.block_size()))
    }

    /// Entradas del directorio como (inodo FUSE, tipo, nombre), incluidas
    /// `.` y `..` tal como están en disco.
    fn entries(&self, fuse_ino: u64) -> Result<Vec<(u64, FileType, Vec<u8>)>, DecodeError> {
        let ino = to_ext2_ino(fuse_ino).ok_or(DecodeError::InvalidInode { inode: u32::MAX })?;
        let listing = self.image.list_directory(ino)?;
        for e in &listing.errors {
            warn!(dir = ino, block = e.block, error = %e.error, "bloque de directorio omitido");
        }
        Ok(listing
            .entries
            .into_iter()
            .filter(|e| e.is_used())
            .map(|e| (to_fuse_ino(e.inode), file_type_from_tag(e.file_type), e.name))
            .collect())
    }

    /// Monta en `mountpoint` y bloquea hasta que se desmonte.
    pub fn run(self, mountpoint: &Path, config: &MountConfig) -> Result<()> {
        fuser::mount2(self, mountpoint, &config.options())
            .with_context(|| format!("No se pudo montar en {:?}", mountpoint))?;
        Ok(())
    }
}

impl<S: ByteSource> Filesystem for Ext2Fuse<S> {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        trace!(parent, name = ?name, "lookup");
        let Some(dir) = to_ext2_ino(parent) else {
            reply.error(libc::ENOENT);
            return;
        };

        let entry = match self.image.lookup(dir, name.as_bytes()) {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                reply.error(libc::ENOENT);
                return;
            }
            Err(e) => {
                reply.error(e.as_errno());
                return;
            }
        };

        match self.attr(to_fuse_ino(entry.inode)) {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(e) => reply.error(e.as_errno()),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        trace!(ino, "getattr");
        match self.attr(ino) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(e) => reply.error(e.as_errno()),
        }
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        trace!(ino, "opendir");
        match self.inode(ino) {
            Ok(inode) if inode.is_dir() => reply.opened(ino, 0),
            Ok(_) => reply.error(libc::ENOTDIR),
            Err(e) => reply.error(e.as_errno()),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        trace!(ino, offset, "readdir");
        let entries = match self.entries(ino) {
            Ok(entries) => entries,
            Err(e) => {
                reply.error(e.as_errno());
                return;
            }
        };

        // El offset de cada entrada es la posición de la siguiente.
        let skip = usize::try_from(offset).unwrap_or(0);
        for (i, (child, kind, name)) in entries.iter().enumerate().skip(skip) {
            if reply.add(*child, (i + 1) as i64, *kind, OsStr::from_bytes(name)) {
                break;
            }
        }
        reply.ok();
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        trace!(ino, flags, "open");
        if flags & libc::O_ACCMODE != libc::O_RDONLY {
            reply.error(libc::EROFS);
            return;
        }
        match self.inode(ino) {
            Ok(inode) if inode.is_dir() => reply.error(libc::EISDIR),
            Ok(_) => reply.opened(ino, 0),
            Err(e) => reply.error(e.as_errno()),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        trace!(ino, offset, size, "read");
        let Ok(offset) = u64::try_from(offset) else {
            reply.error(libc::EINVAL);
            return;
        };

        let inode = match self.inode(ino) {
            Ok(inode) if inode.is_dir() => {
                reply.error(libc::EISDIR);
                return;
            }
            Ok(inode) => inode,
            Err(e) => {
                reply.error(e.as_errno());
                return;
            }
        };

        match self.image.read_range(&inode, offset, size) {
            Ok(data) => reply.data(&data),
            Err(e) => {
                warn!(ino, offset, error = %e, "lectura fallida");
                reply.error(e.as_errno());
            }
        }
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        let sb = self.image.superblock();

        let blocks = u64::from(sb.blocks_count);
        let bfree = u64::from(sb.free_blocks_count);
        let bavail = bfree.saturating_sub(u64::from(sb.r_blocks_count));
        let files = u64::from(sb.inodes_count);
        let ffree = u64::from(sb.free_inodes_count);

        reply.statfs(
            blocks,
            bfree,
            bavail,
            files,
            ffree,
            sb.block_size,
            NAME_LEN,
            sb.block_size,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::S_IFREG;
    use crate::mkimage::ImageBuilder;

    #[test]
    fn root_swaps_with_inode_one() {
        assert_eq!(to_fuse_ino(ROOT_INO), FUSE_ROOT_INO);
        assert_eq!(to_fuse_ino(1), 2);
        assert_eq!(to_fuse_ino(12), 12);
        for ino in [1u32, 2, 3, 11, 500] {
            assert_eq!(to_ext2_ino(to_fuse_ino(ino)), Some(ino));
        }
        assert_eq!(to_ext2_ino(u64::MAX), None);
    }

    #[test]
    fn attributes_come_from_the_inode() {
        let mut b = ImageBuilder::new(1024);
        let f = b.add_file(ROOT_INO, "a.txt", &vec![b'x'; 1500]);
        let img = Ext2Image::open(b.build()).unwrap();

        let attr = inode_to_attr(&img.inode(f).unwrap(), img.block_size());
        assert_eq!(attr.ino, u64::from(f));
        assert_eq!(attr.size, 1500);
        assert_eq!(attr.kind, FileType::RegularFile);
        assert_eq!(attr.perm, 0o644);
        assert_eq!(attr.nlink, 1);
        assert_eq!(attr.blocks, 4);
        assert_eq!(attr.blksize, 1024);
        assert_eq!(attr.mtime, UNIX_EPOCH + Duration::from_secs(1_700_000_000));

        let root = inode_to_attr(&img.root().unwrap(), img.block_size());
        assert_eq!(root.ino, FUSE_ROOT_INO);
        assert_eq!(root.kind, FileType::Directory);
    }

    #[test]
    fn directory_entries_use_fuse_numbers() {
        let mut b = ImageBuilder::new(1024);
        let sub = b.add_dir(ROOT_INO, "sub");
        let fs = Ext2Fuse::new(Ext2Image::open(b.build()).unwrap());

        let root = fs.entries(FUSE_ROOT_INO).unwrap();
        let names: Vec<_> = root.iter().map(|(_, _, n)| n.as_slice()).collect();
        assert_eq!(names, vec![&b"."[..], b"..", b"sub"]);
        assert_eq!(root[0].0, FUSE_ROOT_INO);
        assert_eq!(root[2], (u64::from(sub), FileType::Directory, b"sub".to_vec()));

        let inner = fs.entries(u64::from(sub)).unwrap();
        assert_eq!(inner[1].0, FUSE_ROOT_INO);
    }

    #[test]
    fn tags_and_modes_map_to_fuse_types() {
        assert_eq!(file_type_from_tag(FileTypeTag::Other(7)), FileType::Symlink);
        assert_eq!(file_type_from_tag(FileTypeTag::Other(0)), FileType::RegularFile);
        assert_eq!(file_type_from_mode(S_IFLNK | 0o777), FileType::Symlink);
        assert_eq!(file_type_from_mode(S_IFREG | 0o644), FileType::RegularFile);
    }

    #[test]
    fn mount_options_are_read_only() {
        let config = MountConfig {
            allow_other: true,
            ..Default::default()
        };
        let opts = config.options();
        assert!(opts.contains(&MountOption::RO));
        assert!(opts.contains(&MountOption::AllowOther));
        assert!(opts.contains(&MountOption::AutoUnmount));
    }
}
