//! Open-file handle state

use alloc::string::String;

use super::constants::ATTR_READ_ONLY;
use crate::filesys::OpenMode;

/// One open file. Position and cluster bookkeeping live here; the actual
/// I/O runs on the driver, which owns the device and the scratch buffer.
///
/// `current_cluster` is the cluster containing the byte at `position`;
/// while `position` sits exactly on a cluster boundary it still refers to
/// the preceding cluster, and the next read/write advances it lazily.
pub struct FileHandle {
    /// Whether this handle is open.
    pub(crate) valid: bool,

    /// First data cluster, 0 while no storage is allocated.
    pub(crate) first_cluster: u32,

    /// Cluster currently positioned on.
    pub(crate) current_cluster: u32,

    /// Byte position of the cursor.
    pub(crate) position: u64,

    /// Logical file size in bytes.
    pub(crate) size: u64,

    /// Attribute bits from the File entry.
    pub(crate) attributes: u16,

    /// Stream flags from the Stream entry (NoFatChain etc.).
    pub(crate) stream_flags: u8,

    /// Directory cluster holding this file's entry set.
    pub(crate) dir_cluster: u32,

    /// Flat index of the File entry within that cluster.
    pub(crate) entry_index: u32,

    /// Open mode flags.
    pub(crate) mode: OpenMode,

    /// Filename, as given at open.
    pub(crate) name: String,
}

impl FileHandle {
    /// Placeholder for a released fd slot.
    pub(crate) fn closed() -> Self {
        FileHandle {
            valid: false,
            first_cluster: 0,
            current_cluster: 0,
            position: 0,
            size: 0,
            attributes: 0,
            stream_flags: 0,
            dir_cluster: 0,
            entry_index: 0,
            mode: OpenMode {
                read: false,
                write: false,
                append: false,
                must_exist: false,
                truncate: false,
            },
            name: String::new(),
        }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn is_read_only(&self) -> bool {
        self.attributes & ATTR_READ_ONLY != 0
    }
}
