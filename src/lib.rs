pub mod check;
pub mod content;
pub mod dir;
pub mod error;
pub mod fuse;
pub mod group;
pub mod image;
pub mod inode;
pub mod layout;
#[cfg(any(test, feature = "testing"))]
pub mod mkimage;
pub mod source;
pub mod superblock;
pub mod traverse;

pub use crate::check::{run_check, CheckReport};
pub use crate::dir::{decode_entries, DirectoryEntry, FileTypeTag};
pub use crate::error::{DecodeError, GroupTableError};
pub use crate::fuse::{Ext2Fuse, MountConfig};
pub use crate::group::GroupDescriptor;
pub use crate::image::Ext2Image;
pub use crate::inode::{Inode, InodeKind};
pub use crate::source::ByteSource;
pub use crate::superblock::Superblock;
pub use crate::traverse::{Traversal, TraversalEvent, TraversalOptions};
