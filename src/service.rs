//! Typed request/response boundary for the filesystem task
//!
//! The embedding OS delivers requests from its message queue one at a time;
//! each becomes one `FsService::handle` call, processed to completion before
//! the next. Errors cross this boundary as negative POSIX-style codes
//! (`Errno`), never as the driver's internal vocabulary.

use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;

use crate::filesys::exfat::{DirEntryInfo, ExFat};
use crate::filesys::{Errno, FsError, SeekFrom};

/// Seek origin as carried in request messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Set,
    Cur,
    End,
}

/// Requests served by the filesystem task.
#[derive(Debug, Clone)]
pub enum FsRequest {
    Open { path: String, mode: String },
    Close { handle: usize },
    Read { handle: usize, len: usize },
    Write { handle: usize, data: Vec<u8> },
    Seek { handle: usize, offset: i64, whence: Whence },
    Remove { path: String },
    Mkdir { path: String },
    List { path: String },
}

/// Responses returned to the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsResponse {
    Handle(usize),
    Done,
    Data(Vec<u8>),
    Written(usize),
    Position(u64),
    Entries(Vec<DirEntryInfo>),
    Error(Errno),
}

/// The filesystem task's serving half: one mounted volume, one request at a
/// time.
pub struct FsService<'a> {
    fs: ExFat<'a>,
}

impl<'a> FsService<'a> {
    pub fn new(fs: ExFat<'a>) -> Self {
        FsService { fs }
    }

    /// Handles one request to completion.
    pub fn handle(&mut self, request: FsRequest) -> FsResponse {
        match request {
            FsRequest::Open { path, mode } => {
                reply(self.fs.open_file(&path, &mode).map(FsResponse::Handle))
            }
            FsRequest::Close { handle } => {
                reply(self.fs.close_file(handle).map(|()| FsResponse::Done))
            }
            FsRequest::Read { handle, len } => {
                let mut buf = vec![0u8; len];
                reply(self.fs.read_file(handle, &mut buf).map(|n| {
                    buf.truncate(n);
                    FsResponse::Data(buf)
                }))
            }
            FsRequest::Write { handle, data } => {
                reply(self.fs.write_file(handle, &data).map(FsResponse::Written))
            }
            FsRequest::Seek {
                handle,
                offset,
                whence,
            } => {
                let pos = match whence {
                    Whence::Set if offset < 0 => {
                        return FsResponse::Error(Errno::InvalidArgument);
                    }
                    Whence::Set => SeekFrom::Start(offset as u64),
                    Whence::Cur => SeekFrom::Current(offset),
                    Whence::End => SeekFrom::End(offset),
                };
                reply(self.fs.seek_file(handle, pos).map(FsResponse::Position))
            }
            FsRequest::Remove { path } => reply(self.fs.remove(&path).map(|()| FsResponse::Done)),
            FsRequest::Mkdir { path } => reply(self.fs.mkdir(&path).map(|()| FsResponse::Done)),
            FsRequest::List { path } => {
                reply(self.fs.list_dir(&path).map(FsResponse::Entries))
            }
        }
    }
}

fn reply(result: Result<FsResponse, FsError>) -> FsResponse {
    result.unwrap_or_else(|err| FsResponse::Error(Errno::from(err)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filesys::block::memory::MemoryBlockDevice;
    use crate::filesys::exfat::FormatOptions;
    use alloc::boxed::Box;
    use alloc::string::ToString;

    fn service() -> FsService<'static> {
        let device = MemoryBlockDevice::new(4096, 512);
        let fs = ExFat::format(
            Box::new(device),
            FormatOptions {
                sectors_per_cluster: 4,
                volume_start: 0,
            },
        )
        .unwrap();
        FsService::new(fs)
    }

    fn open(svc: &mut FsService<'_>, path: &str, mode: &str) -> usize {
        match svc.handle(FsRequest::Open {
            path: path.to_string(),
            mode: mode.to_string(),
        }) {
            FsResponse::Handle(fd) => fd,
            other => panic!("open failed: {:?}", other),
        }
    }

    #[test]
    fn write_then_read_through_service() {
        let mut svc = service();
        let fd = open(&mut svc, "/greeting.txt", "w");
        let resp = svc.handle(FsRequest::Write {
            handle: fd,
            data: b"hello service".to_vec(),
        });
        assert_eq!(resp, FsResponse::Written(13));
        assert_eq!(svc.handle(FsRequest::Close { handle: fd }), FsResponse::Done);

        let fd = open(&mut svc, "/greeting.txt", "r");
        let resp = svc.handle(FsRequest::Read { handle: fd, len: 64 });
        assert_eq!(resp, FsResponse::Data(b"hello service".to_vec()));
    }

    #[test]
    fn errors_cross_as_negative_codes() {
        let mut svc = service();
        match svc.handle(FsRequest::Remove {
            path: "/missing".to_string(),
        }) {
            FsResponse::Error(errno) => assert_eq!(errno.code(), -2),
            other => panic!("expected error, got {:?}", other),
        }
        match svc.handle(FsRequest::Open {
            path: "/missing".to_string(),
            mode: "r".to_string(),
        }) {
            FsResponse::Error(errno) => assert_eq!(errno, Errno::NotFound),
            other => panic!("expected error, got {:?}", other),
        }
    }

    #[test]
    fn seek_rejects_negative_set_offset() {
        let mut svc = service();
        let fd = open(&mut svc, "/s.bin", "w");
        let resp = svc.handle(FsRequest::Seek {
            handle: fd,
            offset: -1,
            whence: Whence::Set,
        });
        assert_eq!(resp, FsResponse::Error(Errno::InvalidArgument));
    }

    #[test]
    fn seek_whence_variants() {
        let mut svc = service();
        let fd = open(&mut svc, "/s.bin", "w+");
        svc.handle(FsRequest::Write {
            handle: fd,
            data: vec![7u8; 100],
        });
        assert_eq!(
            svc.handle(FsRequest::Seek {
                handle: fd,
                offset: 10,
                whence: Whence::Set
            }),
            FsResponse::Position(10)
        );
        assert_eq!(
            svc.handle(FsRequest::Seek {
                handle: fd,
                offset: 5,
                whence: Whence::Cur
            }),
            FsResponse::Position(15)
        );
        assert_eq!(
            svc.handle(FsRequest::Seek {
                handle: fd,
                offset: -20,
                whence: Whence::End
            }),
            FsResponse::Position(80)
        );
    }

    #[test]
    fn mkdir_and_list() {
        let mut svc = service();
        assert_eq!(
            svc.handle(FsRequest::Mkdir {
                path: "/sub".to_string()
            }),
            FsResponse::Done
        );
        let fd = open(&mut svc, "/sub/inner.txt", "w");
        svc.handle(FsRequest::Write {
            handle: fd,
            data: b"x".to_vec(),
        });
        svc.handle(FsRequest::Close { handle: fd });

        match svc.handle(FsRequest::List {
            path: "/sub".to_string(),
        }) {
            FsResponse::Entries(entries) => {
                assert_eq!(entries.len(), 1);
                assert_eq!(entries[0].name, "inner.txt");
                assert_eq!(entries[0].size, 1);
                assert!(!entries[0].is_dir);
            }
            other => panic!("expected entries, got {:?}", other),
        }
    }

    #[test]
    fn close_invalid_handle_is_ebadf() {
        let mut svc = service();
        match svc.handle(FsRequest::Close { handle: 42 }) {
            FsResponse::Error(errno) => assert_eq!(errno.code(), -9),
            other => panic!("expected error, got {:?}", other),
        }
    }
}
