//! exFAT on-disk constants

/// Filesystem name stored at byte offset 3 of the boot sector.
pub const FS_NAME: [u8; 8] = *b"EXFAT   ";

/// Byte offset of the filesystem name within the boot sector.
pub const FS_NAME_OFFSET: usize = 3;

/// Boot signature bytes stored at offset 510 (0xAA55 little-endian).
pub const BOOT_SIGNATURE: [u8; 2] = [0x55, 0xAA];

/// Size of one directory entry in bytes.
pub const DIR_ENTRY_SIZE: usize = 32;

/// First valid data cluster number; clusters 0 and 1 are reserved.
pub const FIRST_CLUSTER: u32 = 2;

/// FAT value of a free cluster.
pub const FAT_FREE: u32 = 0x0000_0000;

/// FAT value marking the end of a cluster chain.
pub const FAT_EOC: u32 = 0xFFFF_FFFF;

/// FAT entry 0, the media descriptor.
pub const FAT_MEDIA: u32 = 0xFFFF_FFF8;

/// Directory entry type: unused slot / end of directory.
pub const ENTRY_END: u8 = 0x00;

/// Directory entry type: allocation bitmap descriptor.
pub const ENTRY_BITMAP: u8 = 0x81;

/// Directory entry type: primary file/directory entry.
pub const ENTRY_FILE: u8 = 0x85;

/// Directory entry type: stream extension.
pub const ENTRY_STREAM: u8 = 0xC0;

/// Directory entry type: filename.
pub const ENTRY_FILENAME: u8 = 0xC1;

/// In-use bit of the entry type byte; cleared when an entry is released.
pub const ENTRY_IN_USE: u8 = 0x80;

/// Stream flag: cluster allocation is possible for this stream.
pub const STREAM_ALLOC_POSSIBLE: u8 = 0x01;

/// Stream flag: data is contiguous and carries no FAT chain.
pub const STREAM_NO_FAT_CHAIN: u8 = 0x02;

/// File attribute: read-only.
pub const ATTR_READ_ONLY: u16 = 0x0001;

/// File attribute: directory.
pub const ATTR_DIRECTORY: u16 = 0x0010;

/// File attribute: archive.
pub const ATTR_ARCHIVE: u16 = 0x0020;

/// UTF-16 code units held by one filename entry.
pub const NAME_UNITS_PER_ENTRY: usize = 15;

/// Maximum filename length in UTF-16 code units.
pub const MAX_NAME_LENGTH: usize = 255;

/// Upper bound on simultaneously open files.
pub const MAX_OPEN_FILES: usize = 32;
