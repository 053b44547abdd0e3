use core::result::Result;

pub mod block;
pub mod exfat;

/// Internal result vocabulary used throughout the driver.
///
/// These map onto the POSIX-style [`Errno`] codes exactly once, at the
/// service boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    NotFound,
    AlreadyExists,
    InvalidParameter,
    IOError,
    DiskFull,
    OutOfMemory,
    TooManyOpenFiles,
    InvalidFilesystem,
    NotEmpty,
    ReadOnly,
    InvalidOffset,
    NotADirectory,
    IsADirectory,
    BadHandle,
}

/// POSIX-style error codes crossing the public boundary, as negative values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Errno {
    NotFound = -2,
    IoError = -5,
    BadFileNumber = -9,
    OutOfMemory = -12,
    PermissionDenied = -13,
    Busy = -16,
    Exists = -17,
    NotADirectory = -20,
    IsADirectory = -21,
    InvalidArgument = -22,
    OutOfSpace = -28,
    NotEmpty = -39,
    Overflow = -75,
}

impl Errno {
    /// The raw negative code carried in response messages.
    pub fn code(self) -> i32 {
        self as i32
    }
}

/// The single boundary mapping between the two error vocabularies.
impl From<FsError> for Errno {
    fn from(err: FsError) -> Self {
        match err {
            FsError::NotFound => Errno::NotFound,
            FsError::AlreadyExists => Errno::Exists,
            FsError::InvalidParameter => Errno::InvalidArgument,
            FsError::IOError => Errno::IoError,
            FsError::DiskFull => Errno::OutOfSpace,
            FsError::OutOfMemory => Errno::OutOfMemory,
            FsError::TooManyOpenFiles => Errno::Busy,
            FsError::InvalidFilesystem => Errno::IoError,
            FsError::NotEmpty => Errno::NotEmpty,
            FsError::ReadOnly => Errno::PermissionDenied,
            FsError::InvalidOffset => Errno::Overflow,
            FsError::NotADirectory => Errno::NotADirectory,
            FsError::IsADirectory => Errno::IsADirectory,
            FsError::BadHandle => Errno::BadFileNumber,
        }
    }
}

/// Represents a block device that can be read from and written to.
///
/// The driver always transfers exactly one block per call, addressed by an
/// absolute LBA (the volume start offset is added by the driver).
pub trait BlockDevice {
    fn read_block(&mut self, lba: u64, buf: &mut [u8]) -> Result<(), FsError>;
    fn write_block(&mut self, lba: u64, buf: &[u8]) -> Result<(), FsError>;
    fn block_size(&self) -> usize;
    fn total_blocks(&self) -> u64;
}

/// Seek positions for file operations.
#[derive(Debug, Clone, Copy)]
pub enum SeekFrom {
    Start(u64),
    Current(i64),
    End(i64),
}

/// Flags parsed from a `fopen`-style mode string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenMode {
    pub read: bool,
    pub write: bool,
    pub append: bool,
    pub must_exist: bool,
    pub truncate: bool,
}

impl OpenMode {
    /// Parses `r`, `r+`, `w`, `w+`, `a` and `a+`. Anything else is rejected.
    pub fn parse(mode: &str) -> Result<Self, FsError> {
        let mode = match mode {
            "r" => OpenMode {
                read: true,
                write: false,
                append: false,
                must_exist: true,
                truncate: false,
            },
            "r+" => OpenMode {
                read: true,
                write: true,
                append: false,
                must_exist: true,
                truncate: false,
            },
            "w" => OpenMode {
                read: false,
                write: true,
                append: false,
                must_exist: false,
                truncate: true,
            },
            "w+" => OpenMode {
                read: true,
                write: true,
                append: false,
                must_exist: false,
                truncate: true,
            },
            "a" => OpenMode {
                read: false,
                write: true,
                append: true,
                must_exist: false,
                truncate: false,
            },
            "a+" => OpenMode {
                read: true,
                write: true,
                append: true,
                must_exist: false,
                truncate: false,
            },
            _ => return Err(FsError::InvalidParameter),
        };
        Ok(mode)
    }
}
