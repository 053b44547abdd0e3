//! exFAT filesystem driver
//!
//! One `ExFat` instance owns a mounted volume: the geometry derived from the
//! boot sector, the boxed block device, a single sector-sized scratch buffer
//! every sector transfer goes through, and the table of open files. The
//! owning task processes one request at a time, so no operation ever holds
//! scratch contents across an unrelated sector access.

use alloc::boxed::Box;
use alloc::collections::BinaryHeap;
use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;
use core::cmp::min;

use super::{BlockDevice, FsError, OpenMode, SeekFrom};

mod boot_sector;
mod constants;
mod dir;
mod dir_entry;
mod fat;
mod file;

pub use boot_sector::BootSector;
use constants::*;
use dir::{find_free_run, DirMatch};
use dir_entry::{
    build_entry_set, entry_set_checksum, entry_set_len, name_to_utf16, read_u32, write_u16,
    write_u32, write_u64, FileEntry, StreamEntry, DEFAULT_TIMESTAMP,
};
pub use file::FileHandle;

/// Layout parameters for a fresh volume.
#[derive(Debug, Clone, Copy)]
pub struct FormatOptions {
    pub sectors_per_cluster: u32,
    pub volume_start: u64,
}

impl Default for FormatOptions {
    fn default() -> Self {
        FormatOptions {
            sectors_per_cluster: 8,
            volume_start: 0,
        }
    }
}

/// One entry of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntryInfo {
    pub name: String,
    pub size: u64,
    pub is_dir: bool,
    pub read_only: bool,
}

/// exFAT driver state, one per mounted volume.
pub struct ExFat<'a> {
    /// Underlying block device.
    device: Box<dyn BlockDevice + 'a>,
    /// First LBA of the volume on the device.
    volume_start: u64,
    bytes_per_sector: u32,
    sectors_per_cluster: u32,
    bytes_per_cluster: u32,
    /// First sector of the FAT region, relative to the volume start.
    fat_start: u64,
    /// First sector of the cluster heap, relative to the volume start.
    cluster_heap_start: u64,
    root_cluster: u32,
    cluster_count: u32,
    /// First cluster of the allocation bitmap, located at mount time.
    bitmap_cluster: u32,
    /// The shared sector buffer. All sector I/O goes through here.
    scratch: Vec<u8>,
    /// Next never-used file descriptor.
    fd_counter: usize,
    /// Pool of reusable file descriptors.
    reuse_fds: BinaryHeap<usize>,
    /// Table of open files.
    fd_table: Vec<FileHandle>,
}

impl<'a> ExFat<'a> {
    /// Mounts the volume found at `volume_start` on `device`.
    pub fn mount(device: Box<dyn BlockDevice + 'a>, volume_start: u64) -> Result<Self, FsError> {
        let block_size = device.block_size();
        let mut fs = ExFat {
            device,
            volume_start,
            bytes_per_sector: 0,
            sectors_per_cluster: 0,
            bytes_per_cluster: 0,
            fat_start: 0,
            cluster_heap_start: 0,
            root_cluster: 0,
            cluster_count: 0,
            bitmap_cluster: 0,
            scratch: vec![0u8; block_size],
            fd_counter: 0,
            reuse_fds: BinaryHeap::new(),
            fd_table: Vec::new(),
        };

        fs.read_sector(0)?;
        let boot = BootSector::parse(&fs.scratch)?;
        if boot.bytes_per_sector() as usize != block_size {
            return Err(FsError::InvalidFilesystem);
        }

        fs.bytes_per_sector = boot.bytes_per_sector();
        fs.sectors_per_cluster = boot.sectors_per_cluster();
        fs.bytes_per_cluster = fs.bytes_per_sector * fs.sectors_per_cluster;
        fs.fat_start = boot.fat_offset as u64;
        fs.cluster_heap_start = boot.cluster_heap_offset as u64;
        fs.root_cluster = boot.root_cluster;
        fs.cluster_count = boot.cluster_count;
        fs.locate_bitmap()?;

        log::info!(
            "exfat: mounted {} clusters of {} bytes, root at cluster {}, bitmap at cluster {}",
            fs.cluster_count,
            fs.bytes_per_cluster,
            fs.root_cluster,
            fs.bitmap_cluster
        );
        Ok(fs)
    }

    /// Lays out an empty volume and mounts it: boot sector, zeroed FAT with
    /// the reserved entries, allocation bitmap (cluster 2 onwards) and an
    /// empty root directory holding the bitmap descriptor.
    pub fn format(
        mut device: Box<dyn BlockDevice + 'a>,
        options: FormatOptions,
    ) -> Result<Self, FsError> {
        fn set_fat(
            device: &mut (dyn BlockDevice + '_),
            buf: &mut [u8],
            fat_lba: u64,
            bytes_per_sector: u32,
            cluster: u32,
            value: u32,
        ) -> Result<(), FsError> {
            let offset = cluster as u64 * 4;
            let lba = fat_lba + offset / bytes_per_sector as u64;
            device.read_block(lba, buf)?;
            write_u32(buf, (offset % bytes_per_sector as u64) as usize, value);
            device.write_block(lba, buf)
        }

        let block_size = device.block_size();
        if !block_size.is_power_of_two() || !(512..=4096).contains(&block_size) {
            return Err(FsError::InvalidParameter);
        }
        let spc = options.sectors_per_cluster;
        if spc == 0 || !spc.is_power_of_two() || spc.trailing_zeros() + block_size.trailing_zeros() > 25 {
            return Err(FsError::InvalidParameter);
        }

        let bps = block_size as u32;
        let total = device.total_blocks().saturating_sub(options.volume_start);
        let fat_offset: u32 = 24;

        // First pass estimates the cluster count, the second accounts for
        // the FAT the first pass implies.
        let estimate = (total.saturating_sub(fat_offset as u64) / spc as u64) as u32;
        let fat_length = ((estimate as u64 + 2) * 4).div_ceil(bps as u64) as u32;
        let cluster_heap_offset = fat_offset + fat_length;
        let cluster_count = (total.saturating_sub(cluster_heap_offset as u64) / spc as u64) as u32;

        let bytes_per_cluster = bps as u64 * spc as u64;
        let bitmap_bytes = (cluster_count as u64).div_ceil(8);
        let bitmap_clusters = bitmap_bytes.div_ceil(bytes_per_cluster).max(1) as u32;
        if cluster_count < bitmap_clusters + 1 {
            return Err(FsError::DiskFull);
        }
        let bitmap_cluster = FIRST_CLUSTER;
        let root_cluster = FIRST_CLUSTER + bitmap_clusters;

        let boot = BootSector {
            volume_length: total,
            fat_offset,
            fat_length,
            cluster_heap_offset,
            cluster_count,
            root_cluster,
            bytes_per_sector_shift: bps.trailing_zeros() as u8,
            sectors_per_cluster_shift: spc.trailing_zeros() as u8,
        };

        let mut buf = vec![0u8; block_size];
        boot.encode(&mut buf);
        device.write_block(options.volume_start, &buf)?;

        // Zero the FAT region, then fill in the reserved entries and the
        // chains of the two metadata files.
        buf.fill(0);
        let fat_lba = options.volume_start + fat_offset as u64;
        for s in 0..fat_length as u64 {
            device.write_block(fat_lba + s, &buf)?;
        }
        set_fat(&mut *device, &mut buf, fat_lba, bps, 0, FAT_MEDIA)?;
        set_fat(&mut *device, &mut buf, fat_lba, bps, 1, FAT_EOC)?;
        for i in 0..bitmap_clusters {
            let cluster = bitmap_cluster + i;
            let value = if i + 1 == bitmap_clusters {
                FAT_EOC
            } else {
                cluster + 1
            };
            set_fat(&mut *device, &mut buf, fat_lba, bps, cluster, value)?;
        }
        set_fat(&mut *device, &mut buf, fat_lba, bps, root_cluster, FAT_EOC)?;

        // Bitmap data: only the metadata clusters start out allocated.
        let heap_lba = options.volume_start + cluster_heap_offset as u64;
        buf.fill(0);
        for s in 1..(bitmap_clusters * spc) as u64 {
            device.write_block(heap_lba + s, &buf)?;
        }
        for bit in 0..(bitmap_clusters + 1) as usize {
            buf[bit / 8] |= 1 << (bit % 8);
        }
        device.write_block(heap_lba, &buf)?;

        // Root directory: one cluster, bitmap descriptor first.
        let root_lba = heap_lba + (root_cluster - FIRST_CLUSTER) as u64 * spc as u64;
        buf.fill(0);
        for s in 1..spc as u64 {
            device.write_block(root_lba + s, &buf)?;
        }
        buf[0] = ENTRY_BITMAP;
        write_u32(&mut buf, 20, bitmap_cluster);
        write_u64(&mut buf, 24, bitmap_bytes);
        device.write_block(root_lba, &buf)?;

        log::debug!(
            "exfat: formatted {} clusters of {} bytes",
            cluster_count,
            bytes_per_cluster
        );
        Self::mount(device, options.volume_start)
    }
}

impl ExFat<'_> {
    pub fn bytes_per_cluster(&self) -> u32 {
        self.bytes_per_cluster
    }

    pub fn cluster_count(&self) -> u32 {
        self.cluster_count
    }

    pub fn root_cluster(&self) -> u32 {
        self.root_cluster
    }

    /// Reads one sector into the scratch buffer.
    pub(crate) fn read_sector(&mut self, sector: u64) -> Result<(), FsError> {
        self.device
            .read_block(self.volume_start + sector, &mut self.scratch)
    }

    /// Writes the scratch buffer to one sector.
    pub(crate) fn write_sector(&mut self, sector: u64) -> Result<(), FsError> {
        self.device
            .write_block(self.volume_start + sector, &self.scratch)
    }

    fn zero_cluster(&mut self, cluster: u32) -> Result<(), FsError> {
        let base = self.cluster_to_sector(cluster).ok_or(FsError::IOError)?;
        self.scratch.fill(0);
        for s in 0..self.sectors_per_cluster as u64 {
            self.write_sector(base + s)?;
        }
        Ok(())
    }

    /// Scans the root directory for the allocation bitmap descriptor.
    fn locate_bitmap(&mut self) -> Result<(), FsError> {
        let per_sector = self.entries_per_sector();
        let mut cluster = self.root_cluster;
        loop {
            let base = self
                .cluster_to_sector(cluster)
                .ok_or(FsError::InvalidFilesystem)?;
            for s in 0..self.sectors_per_cluster as u64 {
                self.read_sector(base + s)?;
                for i in 0..per_sector {
                    let off = i * DIR_ENTRY_SIZE;
                    match self.scratch[off] {
                        ENTRY_END => return Err(FsError::InvalidFilesystem),
                        ENTRY_BITMAP => {
                            let first = read_u32(&self.scratch, off + 20);
                            if self.cluster_to_sector(first).is_none() {
                                return Err(FsError::InvalidFilesystem);
                            }
                            self.bitmap_cluster = first;
                            return Ok(());
                        }
                        _ => {}
                    }
                }
            }
            match self.next_in_chain(cluster)? {
                Some(next) => cluster = next,
                None => return Err(FsError::InvalidFilesystem),
            }
        }
    }

    // ------------------------------------------------------------------
    // fd table
    // ------------------------------------------------------------------

    fn take_handle(&mut self, fd: usize) -> Result<FileHandle, FsError> {
        let slot = self.fd_table.get_mut(fd).ok_or(FsError::BadHandle)?;
        if !slot.valid {
            return Err(FsError::BadHandle);
        }
        Ok(core::mem::replace(slot, FileHandle::closed()))
    }

    fn install_handle(&mut self, handle: FileHandle) -> Result<usize, FsError> {
        if let Some(fd) = self.reuse_fds.pop() {
            self.fd_table[fd] = handle;
            return Ok(fd);
        }
        if self.fd_table.len() >= MAX_OPEN_FILES {
            return Err(FsError::TooManyOpenFiles);
        }
        let fd = self.fd_counter;
        self.fd_table.push(handle);
        self.fd_counter += 1;
        Ok(fd)
    }

    // ------------------------------------------------------------------
    // open / create / close
    // ------------------------------------------------------------------

    /// Opens `path` with a `fopen`-style mode string, creating the file
    /// when the mode allows it. Returns a file descriptor.
    pub fn open_file(&mut self, path: &str, mode: &str) -> Result<usize, FsError> {
        let mode = OpenMode::parse(mode)?;
        let (dir_cluster, leaf) = self.resolve_path(path)?;
        if leaf.is_empty() {
            return Err(FsError::IsADirectory);
        }
        let name = name_to_utf16(leaf)?;

        let matched = match self.search_directory(dir_cluster, &name)? {
            Some(found) => {
                if found.file.is_directory() {
                    return Err(FsError::IsADirectory);
                }
                found
            }
            None => {
                if mode.must_exist {
                    return Err(FsError::NotFound);
                }
                self.create_entry_set(dir_cluster, &name, ATTR_ARCHIVE, STREAM_ALLOC_POSSIBLE, 0, 0)?
            }
        };

        if mode.write && matched.file.is_read_only() {
            return Err(FsError::ReadOnly);
        }

        let mut handle = FileHandle {
            valid: true,
            first_cluster: matched.stream.first_cluster,
            current_cluster: matched.stream.first_cluster,
            position: 0,
            size: matched.stream.data_length,
            attributes: matched.file.attributes,
            stream_flags: matched.stream.flags,
            dir_cluster: matched.cluster,
            entry_index: matched.index,
            mode,
            name: String::from(leaf),
        };

        if mode.truncate && (handle.size > 0 || handle.first_cluster >= FIRST_CLUSTER) {
            // Eager truncation: release the old storage and persist the
            // empty stream right away, so nothing leaks if the handle is
            // never written.
            if handle.first_cluster >= FIRST_CLUSTER {
                if handle.stream_flags & STREAM_NO_FAT_CHAIN != 0 {
                    self.free_cluster_span(handle.first_cluster, matched.stream.data_length)?;
                } else {
                    self.free_cluster_chain(handle.first_cluster)?;
                }
            }
            handle.first_cluster = 0;
            handle.current_cluster = 0;
            handle.size = 0;
            handle.stream_flags = STREAM_ALLOC_POSSIBLE;
            self.flush_metadata(&handle)?;
        }

        if mode.append && handle.size > 0 {
            let steps = (handle.size - 1) / self.bytes_per_cluster as u64;
            handle.current_cluster = self.walk_chain(&handle, steps)?;
            handle.position = handle.size;
        }

        self.install_handle(handle)
    }

    /// Closes a file descriptor. A failed metadata flush is logged and
    /// swallowed: releasing the handle always succeeds.
    pub fn close_file(&mut self, fd: usize) -> Result<(), FsError> {
        let handle = self.take_handle(fd)?;
        if handle.mode.write {
            if let Err(err) = self.flush_metadata(&handle) {
                log::warn!(
                    "close: metadata flush failed for {}: {:?}",
                    handle.name,
                    err
                );
            }
        }
        self.reuse_fds.push(fd);
        Ok(())
    }

    /// Builds a fresh entry set in the first sufficient run of unused
    /// entries. The whole set must fit within one sector; directories are
    /// not grown when no sector has room.
    fn create_entry_set(
        &mut self,
        dir_cluster: u32,
        name: &[u16],
        attributes: u16,
        stream_flags: u8,
        first_cluster: u32,
        data_length: u64,
    ) -> Result<DirMatch, FsError> {
        let needed = entry_set_len(name.len());
        let per_sector = self.entries_per_sector();
        if needed > per_sector {
            return Err(FsError::InvalidParameter);
        }

        let mut cluster = dir_cluster;
        loop {
            let base = self.cluster_to_sector(cluster).ok_or(FsError::DiskFull)?;
            for s in 0..self.sectors_per_cluster as u64 {
                self.read_sector(base + s)?;
                if let Some(slot) = find_free_run(&self.scratch, needed) {
                    let set =
                        build_entry_set(name, attributes, stream_flags, first_cluster, data_length);
                    let off = slot * DIR_ENTRY_SIZE;
                    self.scratch[off..off + set.len()].copy_from_slice(&set);
                    self.write_sector(base + s)?;
                    return Ok(DirMatch {
                        file: FileEntry::parse(&set[..DIR_ENTRY_SIZE]),
                        stream: StreamEntry::parse(&set[DIR_ENTRY_SIZE..2 * DIR_ENTRY_SIZE]),
                        cluster,
                        index: (s as usize * per_sector + slot) as u32,
                    });
                }
            }
            match self.next_in_chain(cluster)? {
                Some(next) => cluster = next,
                None => return Err(FsError::DiskFull),
            }
        }
    }

    /// Rewrites a file's stream metadata (size, first cluster, flags) and
    /// timestamp, recomputing the entry-set checksum.
    fn flush_metadata(&mut self, handle: &FileHandle) -> Result<(), FsError> {
        let raw = self.read_dir_entry(handle.dir_cluster, handle.entry_index as usize)?;
        if raw[0] != ENTRY_FILE {
            return Err(FsError::IOError);
        }
        let mut file = FileEntry::parse(&raw);
        let total = file.secondary_count as usize + 1;

        let mut set = vec![0u8; total * DIR_ENTRY_SIZE];
        set[..DIR_ENTRY_SIZE].copy_from_slice(&raw);
        for i in 1..total {
            let entry = self.read_dir_entry(handle.dir_cluster, handle.entry_index as usize + i)?;
            set[i * DIR_ENTRY_SIZE..(i + 1) * DIR_ENTRY_SIZE].copy_from_slice(&entry);
        }
        if set[DIR_ENTRY_SIZE] != ENTRY_STREAM {
            return Err(FsError::IOError);
        }

        let mut stream = StreamEntry::parse(&set[DIR_ENTRY_SIZE..2 * DIR_ENTRY_SIZE]);
        file.modify_time = DEFAULT_TIMESTAMP;
        stream.flags = handle.stream_flags;
        stream.first_cluster = handle.first_cluster;
        stream.valid_data_length = handle.size;
        stream.data_length = handle.size;
        file.encode(&mut set[..DIR_ENTRY_SIZE]);
        stream.encode(&mut set[DIR_ENTRY_SIZE..2 * DIR_ENTRY_SIZE]);

        let checksum = entry_set_checksum(&set);
        write_u16(&mut set, 2, checksum);

        self.write_dir_entries(
            handle.dir_cluster,
            handle.entry_index as usize,
            &set[..2 * DIR_ENTRY_SIZE],
        )
    }

    // ------------------------------------------------------------------
    // read / write / seek
    // ------------------------------------------------------------------

    /// Reads up to `buf.len()` bytes from the cursor, bounded by the file
    /// size. A chain or device failure mid-read returns the bytes copied so
    /// far; only a failure before the first byte is an error.
    pub fn read_file(&mut self, fd: usize, buf: &mut [u8]) -> Result<usize, FsError> {
        let mut handle = self.take_handle(fd)?;
        let result = self.read_into(&mut handle, buf);
        self.fd_table[fd] = handle;
        result
    }

    /// Writes `data` at the cursor, allocating clusters lazily. Runs out of
    /// space mid-write return the bytes already on disk.
    pub fn write_file(&mut self, fd: usize, data: &[u8]) -> Result<usize, FsError> {
        let mut handle = self.take_handle(fd)?;
        let result = self.write_into(&mut handle, data);
        self.fd_table[fd] = handle;
        result
    }

    /// Moves the cursor. Seeking past end-of-file on a writable handle
    /// eagerly allocates zero-filled clusters up to the target.
    pub fn seek_file(&mut self, fd: usize, pos: SeekFrom) -> Result<u64, FsError> {
        let mut handle = self.take_handle(fd)?;
        let result = self.seek_handle(&mut handle, pos);
        self.fd_table[fd] = handle;
        result
    }

    fn read_into(&mut self, handle: &mut FileHandle, buf: &mut [u8]) -> Result<usize, FsError> {
        if !handle.mode.read {
            return Err(FsError::BadHandle);
        }
        if handle.position >= handle.size || buf.is_empty() {
            return Ok(0);
        }
        let bps = self.bytes_per_sector as usize;
        let bpc = self.bytes_per_cluster as u64;
        let to_read = min(buf.len() as u64, handle.size - handle.position) as usize;
        let mut done = 0;

        while done < to_read {
            if handle.position > 0 && handle.position % bpc == 0 {
                match self.next_data_cluster(handle) {
                    Ok(Some(next)) => handle.current_cluster = next,
                    Ok(None) => break,
                    Err(err) => {
                        if done == 0 {
                            return Err(err);
                        }
                        break;
                    }
                }
            }
            let in_cluster = (handle.position % bpc) as usize;
            let offset = in_cluster % bps;
            let sector = match self.cluster_to_sector(handle.current_cluster) {
                Some(base) => base + (in_cluster / bps) as u64,
                None => {
                    if done == 0 {
                        return Err(FsError::IOError);
                    }
                    break;
                }
            };
            let chunk = min(bps - offset, to_read - done);
            if let Err(err) = self.read_sector(sector) {
                if done == 0 {
                    return Err(err);
                }
                break;
            }
            buf[done..done + chunk].copy_from_slice(&self.scratch[offset..offset + chunk]);
            done += chunk;
            handle.position += chunk as u64;
        }
        Ok(done)
    }

    fn write_into(&mut self, handle: &mut FileHandle, data: &[u8]) -> Result<usize, FsError> {
        if !handle.mode.write {
            return Err(FsError::BadHandle);
        }
        if data.is_empty() {
            return Ok(0);
        }
        self.materialize_chain(handle)?;

        if handle.first_cluster < FIRST_CLUSTER {
            let cluster = self.allocate_cluster()?;
            handle.first_cluster = cluster;
            handle.current_cluster = cluster;
        }

        let bps = self.bytes_per_sector as usize;
        let bpc = self.bytes_per_cluster as u64;
        let mut done = 0;
        let mut failure = None;

        while done < data.len() {
            if handle.position > 0 && handle.position % bpc == 0 {
                match self.next_or_grow(handle.current_cluster) {
                    Ok(next) => handle.current_cluster = next,
                    Err(err) => {
                        failure = Some(err);
                        break;
                    }
                }
            }
            let in_cluster = (handle.position % bpc) as usize;
            let offset = in_cluster % bps;
            let sector = match self.cluster_to_sector(handle.current_cluster) {
                Some(base) => base + (in_cluster / bps) as u64,
                None => {
                    failure = Some(FsError::IOError);
                    break;
                }
            };
            let chunk = min(bps - offset, data.len() - done);
            if chunk < bps {
                // Partial sector: read-modify-write.
                if let Err(err) = self.read_sector(sector) {
                    failure = Some(err);
                    break;
                }
            }
            self.scratch[offset..offset + chunk].copy_from_slice(&data[done..done + chunk]);
            if let Err(err) = self.write_sector(sector) {
                failure = Some(err);
                break;
            }
            done += chunk;
            handle.position += chunk as u64;
            if handle.position > handle.size {
                handle.size = handle.position;
            }
        }

        if done == 0 {
            return Err(failure.unwrap_or(FsError::IOError));
        }
        // Whatever landed on disk stays reported; the entry keeps up.
        if let Err(err) = self.flush_metadata(handle) {
            log::warn!("write: metadata flush failed for {}: {:?}", handle.name, err);
        }
        Ok(done)
    }

    fn seek_handle(&mut self, handle: &mut FileHandle, pos: SeekFrom) -> Result<u64, FsError> {
        let target = match pos {
            SeekFrom::Start(offset) => offset,
            SeekFrom::End(offset) => {
                if offset < 0 {
                    handle
                        .size
                        .checked_sub(offset.unsigned_abs())
                        .ok_or(FsError::InvalidOffset)?
                } else {
                    handle
                        .size
                        .checked_add(offset as u64)
                        .ok_or(FsError::InvalidOffset)?
                }
            }
            SeekFrom::Current(offset) => {
                if offset < 0 {
                    handle
                        .position
                        .checked_sub(offset.unsigned_abs())
                        .ok_or(FsError::InvalidOffset)?
                } else {
                    handle
                        .position
                        .checked_add(offset as u64)
                        .ok_or(FsError::InvalidOffset)?
                }
            }
        };

        if target > handle.size && !handle.mode.write {
            return Err(FsError::InvalidOffset);
        }

        if target > 0 {
            if handle.mode.write {
                self.ensure_clusters(handle, target)?;
            } else {
                let steps = (target - 1) / self.bytes_per_cluster as u64;
                handle.current_cluster = self.walk_chain(handle, steps)?;
            }
        } else {
            handle.current_cluster = handle.first_cluster;
        }

        if target > handle.size {
            handle.size = target;
        }
        handle.position = target;
        Ok(target)
    }

    /// Cluster at chain index `steps`, following either the FAT or, for a
    /// NoFatChain stream, plain contiguity.
    fn walk_chain(&mut self, handle: &FileHandle, steps: u64) -> Result<u32, FsError> {
        let mut cluster = handle.first_cluster;
        if self.cluster_to_sector(cluster).is_none() {
            return Err(FsError::IOError);
        }
        for _ in 0..steps {
            cluster = if handle.stream_flags & STREAM_NO_FAT_CHAIN != 0 {
                cluster + 1
            } else {
                self.next_in_chain(cluster)?.ok_or(FsError::IOError)?
            };
            if self.cluster_to_sector(cluster).is_none() {
                return Err(FsError::IOError);
            }
        }
        Ok(cluster)
    }

    /// Walks to the cluster just before `target`, allocating and
    /// zero-filling every missing cluster on the way.
    fn ensure_clusters(&mut self, handle: &mut FileHandle, target: u64) -> Result<(), FsError> {
        self.materialize_chain(handle)?;
        if handle.first_cluster < FIRST_CLUSTER {
            let cluster = self.allocate_cluster()?;
            self.zero_cluster(cluster)?;
            handle.first_cluster = cluster;
            handle.current_cluster = cluster;
        }
        let steps = (target - 1) / self.bytes_per_cluster as u64;
        let mut cluster = handle.first_cluster;
        for _ in 0..steps {
            cluster = match self.next_in_chain(cluster)? {
                Some(next) => next,
                None => {
                    let next = self.allocate_cluster()?;
                    self.zero_cluster(next)?;
                    self.write_fat_entry(cluster, next)?;
                    next
                }
            };
        }
        handle.current_cluster = cluster;
        Ok(())
    }

    fn next_data_cluster(&mut self, handle: &FileHandle) -> Result<Option<u32>, FsError> {
        if handle.stream_flags & STREAM_NO_FAT_CHAIN != 0 {
            let next = handle.current_cluster + 1;
            return Ok(self.cluster_to_sector(next).map(|_| next));
        }
        self.next_in_chain(handle.current_cluster)
    }

    fn next_or_grow(&mut self, cluster: u32) -> Result<u32, FsError> {
        if let Some(next) = self.next_in_chain(cluster)? {
            return Ok(next);
        }
        let next = self.allocate_cluster()?;
        self.write_fat_entry(cluster, next)?;
        Ok(next)
    }

    /// Converts a NoFatChain stream into an ordinary FAT-chained one by
    /// writing the links its contiguity implied. Writes may fragment the
    /// file afterwards, so the flag cannot stay.
    fn materialize_chain(&mut self, handle: &mut FileHandle) -> Result<(), FsError> {
        if handle.stream_flags & STREAM_NO_FAT_CHAIN == 0 {
            return Ok(());
        }
        if handle.first_cluster >= FIRST_CLUSTER {
            let span = handle
                .size
                .div_ceil(self.bytes_per_cluster as u64)
                .max(1) as u32;
            for i in 0..span {
                let cluster = handle.first_cluster + i;
                let value = if i + 1 == span { FAT_EOC } else { cluster + 1 };
                self.write_fat_entry(cluster, value)?;
            }
        }
        handle.stream_flags &= !STREAM_NO_FAT_CHAIN;
        Ok(())
    }

    // ------------------------------------------------------------------
    // remove / mkdir / list
    // ------------------------------------------------------------------

    /// Removes a file or an empty directory, freeing its clusters and
    /// releasing every entry of its set. Freed slots are not compacted.
    pub fn remove(&mut self, path: &str) -> Result<(), FsError> {
        let (dir_cluster, leaf) = self.resolve_path(path)?;
        if leaf.is_empty() {
            return Err(FsError::InvalidParameter);
        }
        let name = name_to_utf16(leaf)?;
        let matched = self
            .search_directory(dir_cluster, &name)?
            .ok_or(FsError::NotFound)?;

        if matched.file.is_directory()
            && matched.stream.first_cluster >= FIRST_CLUSTER
            && !self.directory_is_empty(matched.stream.first_cluster)?
        {
            return Err(FsError::NotEmpty);
        }

        if matched.stream.first_cluster >= FIRST_CLUSTER {
            if matched.stream.no_fat_chain() {
                self.free_cluster_span(matched.stream.first_cluster, matched.stream.data_length)?;
            } else {
                self.free_cluster_chain(matched.stream.first_cluster)?;
            }
        }
        self.release_entry_set(
            matched.cluster,
            matched.index as usize,
            matched.file.secondary_count as usize + 1,
        )
    }

    /// Creates a directory with one allocated, zeroed cluster.
    pub fn mkdir(&mut self, path: &str) -> Result<(), FsError> {
        let (dir_cluster, leaf) = self.resolve_path(path)?;
        if leaf.is_empty() {
            return Err(FsError::AlreadyExists);
        }
        let name = name_to_utf16(leaf)?;
        if self.search_directory(dir_cluster, &name)?.is_some() {
            return Err(FsError::AlreadyExists);
        }
        let cluster = self.allocate_cluster()?;
        self.zero_cluster(cluster)?;
        self.create_entry_set(
            dir_cluster,
            &name,
            ATTR_DIRECTORY,
            STREAM_ALLOC_POSSIBLE,
            cluster,
            self.bytes_per_cluster as u64,
        )?;
        Ok(())
    }

    /// Lists the live entry sets of a directory.
    pub fn list_dir(&mut self, path: &str) -> Result<Vec<DirEntryInfo>, FsError> {
        let (parent, leaf) = self.resolve_path(path)?;
        let dir_cluster = if leaf.is_empty() {
            parent
        } else {
            let name = name_to_utf16(leaf)?;
            let matched = self
                .search_directory(parent, &name)?
                .ok_or(FsError::NotFound)?;
            if !matched.file.is_directory() {
                return Err(FsError::NotADirectory);
            }
            matched.stream.first_cluster
        };

        let mut entries = Vec::new();
        if dir_cluster < FIRST_CLUSTER {
            return Ok(entries);
        }
        let per_cluster = self.entries_per_cluster();
        let mut cluster = dir_cluster;
        loop {
            let mut index = 0;
            while index < per_cluster {
                let raw = self.read_dir_entry(cluster, index)?;
                if raw[0] == ENTRY_END {
                    return Ok(entries);
                }
                if raw[0] != ENTRY_FILE {
                    index += 1;
                    continue;
                }
                let file = FileEntry::parse(&raw);
                let count = file.secondary_count as usize;
                let skip = count + 1;
                if count < 2 || index + count >= per_cluster {
                    index += skip;
                    continue;
                }
                let sraw = self.read_dir_entry(cluster, index + 1)?;
                if sraw[0] != ENTRY_STREAM {
                    index += skip;
                    continue;
                }
                let stream = StreamEntry::parse(&sraw);
                if let Some(name) =
                    self.collect_entry_name(cluster, index, count, stream.name_length as usize)?
                {
                    entries.push(DirEntryInfo {
                        name: name
                            .iter()
                            .map(|&u| if u < 0x80 { u as u8 as char } else { '?' })
                            .collect(),
                        size: stream.data_length,
                        is_dir: file.is_directory(),
                        read_only: file.is_read_only(),
                    });
                }
                index += skip;
            }
            match self.next_in_chain(cluster)? {
                Some(next) => cluster = next,
                None => return Ok(entries),
            }
        }
    }

    /// True when a directory chain holds no live File entries. exFAT
    /// directories carry no dot entries, so empty means literally empty.
    fn directory_is_empty(&mut self, dir_cluster: u32) -> Result<bool, FsError> {
        let per_sector = self.entries_per_sector();
        let mut cluster = dir_cluster;
        loop {
            let base = match self.cluster_to_sector(cluster) {
                Some(sector) => sector,
                None => return Ok(true),
            };
            for s in 0..self.sectors_per_cluster as u64 {
                self.read_sector(base + s)?;
                for i in 0..per_sector {
                    match self.scratch[i * DIR_ENTRY_SIZE] {
                        ENTRY_END => return Ok(true),
                        ENTRY_FILE => return Ok(false),
                        _ => {}
                    }
                }
            }
            match self.next_in_chain(cluster)? {
                Some(next) => cluster = next,
                None => return Ok(true),
            }
        }
    }

    /// Clears the in-use bit of `count` consecutive entries, grouping the
    /// read-modify-write cycles by sector.
    fn release_entry_set(&mut self, cluster: u32, index: usize, count: usize) -> Result<(), FsError> {
        let per_sector = self.entries_per_sector();
        let base = self.cluster_to_sector(cluster).ok_or(FsError::IOError)?;
        let mut i = 0;
        while i < count {
            let sector = base + ((index + i) / per_sector) as u64;
            self.read_sector(sector)?;
            while i < count && base + ((index + i) / per_sector) as u64 == sector {
                let off = ((index + i) % per_sector) * DIR_ENTRY_SIZE;
                self.scratch[off] &= !ENTRY_IN_USE;
                i += 1;
            }
            self.write_sector(sector)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filesys::block::memory::MemoryBlockDevice;

    /// 2 MiB volume: 512-byte sectors, 4 sectors per cluster, FAT at 24,
    /// heap at 32, 1016 clusters, bitmap at cluster 2, root at cluster 3.
    fn fresh_volume() -> ExFat<'static> {
        let device = MemoryBlockDevice::new(4096, 512);
        ExFat::format(
            Box::new(device),
            FormatOptions {
                sectors_per_cluster: 4,
                volume_start: 0,
            },
        )
        .unwrap()
    }

    fn write_whole_file(fs: &mut ExFat<'_>, path: &str, data: &[u8]) {
        let fd = fs.open_file(path, "w").unwrap();
        assert_eq!(fs.write_file(fd, data).unwrap(), data.len());
        fs.close_file(fd).unwrap();
    }

    fn read_whole_file(fs: &mut ExFat<'_>, path: &str) -> Vec<u8> {
        let fd = fs.open_file(path, "r").unwrap();
        let mut buf = vec![0u8; 64 * 1024];
        let n = fs.read_file(fd, &mut buf).unwrap();
        fs.close_file(fd).unwrap();
        buf.truncate(n);
        buf
    }

    fn find(fs: &mut ExFat<'_>, dir: u32, name: &str) -> Option<DirMatch> {
        let units = name_to_utf16(name).unwrap();
        fs.search_directory(dir, &units).unwrap()
    }

    fn chain_len(fs: &mut ExFat<'_>, first: u32) -> usize {
        let mut cluster = first;
        let mut len = 1;
        while let Some(next) = fs.next_in_chain(cluster).unwrap() {
            cluster = next;
            len += 1;
        }
        len
    }

    #[test]
    fn format_reports_expected_geometry() {
        let fs = fresh_volume();
        assert_eq!(fs.bytes_per_cluster(), 2048);
        assert_eq!(fs.root_cluster(), 3);
        assert_eq!(fs.cluster_count(), 1016);
    }

    #[test]
    fn mount_rejects_blank_device() {
        let device = MemoryBlockDevice::new(64, 512);
        assert!(ExFat::mount(Box::new(device), 0).is_err());
    }

    #[test]
    fn volume_start_offset_roundtrip() {
        let device = MemoryBlockDevice::new(4196, 512);
        let mut fs = ExFat::format(
            Box::new(device),
            FormatOptions {
                sectors_per_cluster: 4,
                volume_start: 100,
            },
        )
        .unwrap();
        write_whole_file(&mut fs, "/off.bin", b"offset volume");
        assert_eq!(read_whole_file(&mut fs, "/off.bin"), b"offset volume");
    }

    #[test]
    fn first_free_cluster_passes_all_three_checks() {
        let mut fs = fresh_volume();
        let free = fs.find_free_cluster().unwrap();
        assert_eq!(free, 4); // clusters 2 and 3 hold the bitmap and root
        assert_eq!(fs.read_fat_entry(free).unwrap(), FAT_FREE);
        assert!(!fs.bitmap_bit(free).unwrap());
    }

    #[test]
    fn allocation_marks_fat_and_bitmap() {
        let mut fs = fresh_volume();
        let cluster = fs.allocate_cluster().unwrap();
        assert_eq!(fs.read_fat_entry(cluster).unwrap(), FAT_EOC);
        assert!(fs.bitmap_bit(cluster).unwrap());
        assert_ne!(fs.find_free_cluster().unwrap(), cluster);
    }

    #[test]
    fn create_write_close_reopen_read_roundtrip() {
        let mut fs = fresh_volume();
        write_whole_file(&mut fs, "/a.txt", b"written bytes");
        assert_eq!(read_whole_file(&mut fs, "/a.txt"), b"written bytes");
    }

    #[test]
    fn five_thousand_bytes_occupy_three_clusters() {
        let mut fs = fresh_volume();
        let data = vec![0xAA; 5000];
        write_whole_file(&mut fs, "/a.txt", &data);

        let root = fs.root_cluster();
        let matched = find(&mut fs, root, "a.txt").unwrap();
        assert_eq!(matched.stream.data_length, 5000);
        assert_eq!(chain_len(&mut fs, matched.stream.first_cluster), 3);

        let back = read_whole_file(&mut fs, "/a.txt");
        assert_eq!(back.len(), 5000);
        assert!(back.iter().all(|&b| b == 0xAA));
    }

    #[test]
    fn flushed_entry_set_checksum_verifies() {
        let mut fs = fresh_volume();
        write_whole_file(&mut fs, "/sum.bin", &[1u8; 300]);
        let root = fs.root_cluster();
        let matched = find(&mut fs, root, "sum.bin").unwrap();
        let total = matched.file.secondary_count as usize + 1;
        let mut set = vec![0u8; total * DIR_ENTRY_SIZE];
        for i in 0..total {
            let raw = fs
                .read_dir_entry(matched.cluster, matched.index as usize + i)
                .unwrap();
            set[i * DIR_ENTRY_SIZE..(i + 1) * DIR_ENTRY_SIZE].copy_from_slice(&raw);
        }
        assert_eq!(dir_entry::read_u16(&set, 2), entry_set_checksum(&set));
    }

    #[test]
    fn names_are_case_insensitive() {
        let mut fs = fresh_volume();
        write_whole_file(&mut fs, "/HELLO.TXT", b"upper");
        assert_eq!(read_whole_file(&mut fs, "/hello.txt"), b"upper");
        // creating again with different case routes to the same entry
        write_whole_file(&mut fs, "/hello.txt", b"lower");
        assert_eq!(read_whole_file(&mut fs, "/HeLLo.TxT"), b"lower");
        assert_eq!(fs.list_dir("/").unwrap().len(), 1);
    }

    #[test]
    fn append_preserves_existing_bytes() {
        let mut fs = fresh_volume();
        write_whole_file(&mut fs, "/log.txt", b"first line;");
        let fd = fs.open_file("/log.txt", "a").unwrap();
        assert_eq!(fs.write_file(fd, b"second line").unwrap(), 11);
        fs.close_file(fd).unwrap();
        assert_eq!(read_whole_file(&mut fs, "/log.txt"), b"first line;second line");
    }

    #[test]
    fn append_grows_across_the_cluster_boundary() {
        let mut fs = fresh_volume();
        write_whole_file(&mut fs, "/b.bin", &vec![3u8; 2048]);
        let root = fs.root_cluster();
        let first = find(&mut fs, root, "b.bin").unwrap().stream.first_cluster;
        assert_eq!(chain_len(&mut fs, first), 1);

        let fd = fs.open_file("/b.bin", "a").unwrap();
        assert_eq!(fs.write_file(fd, &[4u8; 10]).unwrap(), 10);
        fs.close_file(fd).unwrap();

        let back = read_whole_file(&mut fs, "/b.bin");
        assert_eq!(back.len(), 2058);
        assert!(back[..2048].iter().all(|&b| b == 3));
        assert!(back[2048..].iter().all(|&b| b == 4));
    }

    #[test]
    fn seek_rejects_negative_positions() {
        let mut fs = fresh_volume();
        write_whole_file(&mut fs, "/s.bin", b"12345");
        let fd = fs.open_file("/s.bin", "r").unwrap();
        assert_eq!(
            fs.seek_file(fd, SeekFrom::Current(-1)),
            Err(FsError::InvalidOffset)
        );
        assert_eq!(
            fs.seek_file(fd, SeekFrom::End(-6)),
            Err(FsError::InvalidOffset)
        );
        assert_eq!(fs.seek_file(fd, SeekFrom::End(-5)).unwrap(), 0);
    }

    #[test]
    fn seek_past_eof_read_only_rejected() {
        let mut fs = fresh_volume();
        write_whole_file(&mut fs, "/s.bin", b"12345");
        let fd = fs.open_file("/s.bin", "r").unwrap();
        assert_eq!(
            fs.seek_file(fd, SeekFrom::Start(6)),
            Err(FsError::InvalidOffset)
        );
        // the end itself is reachable; reads there return nothing
        assert_eq!(fs.seek_file(fd, SeekFrom::Start(5)).unwrap(), 5);
        let mut buf = [0u8; 8];
        assert_eq!(fs.read_file(fd, &mut buf).unwrap(), 0);
    }

    #[test]
    fn seek_past_eof_zero_extends_writable_files() {
        let mut fs = fresh_volume();
        let fd = fs.open_file("/sparse.bin", "w+").unwrap();
        assert_eq!(fs.write_file(fd, b"go").unwrap(), 2);
        assert_eq!(fs.seek_file(fd, SeekFrom::Start(5000)).unwrap(), 5000);
        assert_eq!(fs.write_file(fd, b"end").unwrap(), 3);
        fs.close_file(fd).unwrap();

        let back = read_whole_file(&mut fs, "/sparse.bin");
        assert_eq!(back.len(), 5003);
        assert_eq!(&back[..2], b"go");
        assert!(back[2..5000].iter().all(|&b| b == 0));
        assert_eq!(&back[5000..], b"end");

        let root = fs.root_cluster();
        let matched = find(&mut fs, root, "sparse.bin").unwrap();
        assert_eq!(chain_len(&mut fs, matched.stream.first_cluster), 3);
    }

    #[test]
    fn seek_alone_raises_file_size() {
        let mut fs = fresh_volume();
        let fd = fs.open_file("/grown.bin", "w").unwrap();
        assert_eq!(fs.seek_file(fd, SeekFrom::Start(3000)).unwrap(), 3000);
        fs.close_file(fd).unwrap();

        let back = read_whole_file(&mut fs, "/grown.bin");
        assert_eq!(back.len(), 3000);
        assert!(back.iter().all(|&b| b == 0));
    }

    #[test]
    fn remove_missing_path_is_not_found() {
        let mut fs = fresh_volume();
        assert_eq!(fs.remove("/nope.txt"), Err(FsError::NotFound));
    }

    #[test]
    fn remove_non_empty_directory_rejected() {
        let mut fs = fresh_volume();
        fs.mkdir("/d").unwrap();
        write_whole_file(&mut fs, "/d/f.txt", b"x");
        assert_eq!(fs.remove("/d"), Err(FsError::NotEmpty));
        fs.remove("/d/f.txt").unwrap();
        fs.remove("/d").unwrap();
        assert_eq!(fs.open_file("/d/f.txt", "r"), Err(FsError::NotFound));
    }

    #[test]
    fn removed_file_clusters_become_free() {
        let mut fs = fresh_volume();
        write_whole_file(&mut fs, "/big.bin", &vec![9u8; 5000]);
        let root = fs.root_cluster();
        let first = find(&mut fs, root, "big.bin").unwrap().stream.first_cluster;

        fs.remove("/big.bin").unwrap();
        assert_eq!(fs.read_fat_entry(first).unwrap(), FAT_FREE);
        assert!(!fs.bitmap_bit(first).unwrap());
        assert_eq!(fs.find_free_cluster().unwrap(), first);
        assert!(find(&mut fs, root, "big.bin").is_none());
    }

    #[test]
    fn released_slots_are_reused_by_later_creates() {
        let mut fs = fresh_volume();
        write_whole_file(&mut fs, "/one.txt", b"1");
        let root = fs.root_cluster();
        let index = find(&mut fs, root, "one.txt").unwrap().index;
        fs.remove("/one.txt").unwrap();
        write_whole_file(&mut fs, "/two.txt", b"2");
        assert_eq!(find(&mut fs, root, "two.txt").unwrap().index, index);
    }

    #[test]
    fn no_fat_chain_ranges_block_free_search() {
        let mut fs = fresh_volume();
        let root = fs.root_cluster();
        let name = name_to_utf16("span.bin").unwrap();
        fs.create_entry_set(
            root,
            &name,
            ATTR_ARCHIVE,
            STREAM_ALLOC_POSSIBLE | STREAM_NO_FAT_CHAIN,
            4,
            4096,
        )
        .unwrap();
        // clusters 4 and 5 read as free in both FAT and bitmap, yet are owned
        assert_eq!(fs.read_fat_entry(4).unwrap(), FAT_FREE);
        assert!(!fs.bitmap_bit(4).unwrap());
        assert_eq!(fs.find_free_cluster().unwrap(), 6);
    }

    #[test]
    fn no_fat_chain_file_reads_contiguously() {
        let mut fs = fresh_volume();
        let root = fs.root_cluster();
        let name = name_to_utf16("span.bin").unwrap();
        fs.create_entry_set(
            root,
            &name,
            ATTR_ARCHIVE,
            STREAM_ALLOC_POSSIBLE | STREAM_NO_FAT_CHAIN,
            4,
            3000,
        )
        .unwrap();
        // lay the contiguous payload down directly
        for (i, cluster) in (4u32..6).enumerate() {
            let base = fs.cluster_to_sector(cluster).unwrap();
            fs.scratch.fill(0x40 + i as u8);
            for s in 0..4 {
                fs.write_sector(base + s).unwrap();
            }
        }
        let back = read_whole_file(&mut fs, "/span.bin");
        assert_eq!(back.len(), 3000);
        assert!(back[..2048].iter().all(|&b| b == 0x40));
        assert!(back[2048..].iter().all(|&b| b == 0x41));
    }

    #[test]
    fn remove_no_fat_chain_file_frees_its_span() {
        let mut fs = fresh_volume();
        let root = fs.root_cluster();
        let name = name_to_utf16("span.bin").unwrap();
        fs.create_entry_set(
            root,
            &name,
            ATTR_ARCHIVE,
            STREAM_ALLOC_POSSIBLE | STREAM_NO_FAT_CHAIN,
            4,
            4096,
        )
        .unwrap();
        fs.set_bitmap_bit(4, true).unwrap();
        fs.set_bitmap_bit(5, true).unwrap();

        fs.remove("/span.bin").unwrap();
        assert!(!fs.bitmap_bit(4).unwrap());
        assert!(!fs.bitmap_bit(5).unwrap());
        assert_eq!(fs.find_free_cluster().unwrap(), 4);
    }

    #[test]
    fn truncating_open_frees_the_old_chain() {
        let mut fs = fresh_volume();
        write_whole_file(&mut fs, "/t.bin", &vec![7u8; 5000]);
        let root = fs.root_cluster();
        let first = find(&mut fs, root, "t.bin").unwrap().stream.first_cluster;

        let fd = fs.open_file("/t.bin", "w").unwrap();
        // old storage is released and the empty stream persisted at open time
        assert_eq!(fs.read_fat_entry(first).unwrap(), FAT_FREE);
        assert!(!fs.bitmap_bit(first).unwrap());
        let matched = find(&mut fs, root, "t.bin").unwrap();
        assert_eq!(matched.stream.data_length, 0);
        assert_eq!(matched.stream.first_cluster, 0);
        fs.close_file(fd).unwrap();
        assert_eq!(read_whole_file(&mut fs, "/t.bin"), b"");
    }

    #[test]
    fn nested_directories_resolve() {
        let mut fs = fresh_volume();
        fs.mkdir("/usr").unwrap();
        fs.mkdir("/usr/share").unwrap();
        write_whole_file(&mut fs, "/usr/share/readme.md", b"nested");
        assert_eq!(read_whole_file(&mut fs, "/usr/share/readme.md"), b"nested");

        assert_eq!(fs.mkdir("/usr"), Err(FsError::AlreadyExists));
        assert_eq!(fs.open_file("/usr", "r"), Err(FsError::IsADirectory));
        assert_eq!(
            fs.open_file("/usr/share/readme.md/x", "r"),
            Err(FsError::NotADirectory)
        );

        let entries = fs.list_dir("/usr").unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].is_dir);
        assert_eq!(entries[0].name, "share");
    }

    #[test]
    fn read_only_attribute_blocks_writable_open() {
        let mut fs = fresh_volume();
        let root = fs.root_cluster();
        let name = name_to_utf16("locked.txt").unwrap();
        fs.create_entry_set(
            root,
            &name,
            ATTR_ARCHIVE | ATTR_READ_ONLY,
            STREAM_ALLOC_POSSIBLE,
            0,
            0,
        )
        .unwrap();
        assert_eq!(fs.open_file("/locked.txt", "w"), Err(FsError::ReadOnly));
        assert_eq!(fs.open_file("/locked.txt", "a"), Err(FsError::ReadOnly));
        assert!(fs.open_file("/locked.txt", "r").is_ok());
    }

    #[test]
    fn handle_mode_is_enforced() {
        let mut fs = fresh_volume();
        write_whole_file(&mut fs, "/m.txt", b"data");
        let fd = fs.open_file("/m.txt", "r").unwrap();
        assert_eq!(fs.write_file(fd, b"x"), Err(FsError::BadHandle));
        fs.close_file(fd).unwrap();

        let fd = fs.open_file("/m.txt", "a").unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(fs.read_file(fd, &mut buf), Err(FsError::BadHandle));
        fs.close_file(fd).unwrap();
    }

    #[test]
    fn descriptors_are_reused_and_bounded() {
        let mut fs = fresh_volume();
        write_whole_file(&mut fs, "/fd.txt", b"x");
        let mut fds = Vec::new();
        for _ in 0..MAX_OPEN_FILES {
            fds.push(fs.open_file("/fd.txt", "r").unwrap());
        }
        assert_eq!(
            fs.open_file("/fd.txt", "r"),
            Err(FsError::TooManyOpenFiles)
        );
        fs.close_file(fds[7]).unwrap();
        assert_eq!(fs.open_file("/fd.txt", "r").unwrap(), fds[7]);
        assert_eq!(fs.read_file(12345, &mut [0u8; 1]), Err(FsError::BadHandle));
    }

    #[test]
    fn double_close_is_rejected() {
        let mut fs = fresh_volume();
        write_whole_file(&mut fs, "/c.txt", b"x");
        let fd = fs.open_file("/c.txt", "r").unwrap();
        fs.close_file(fd).unwrap();
        assert_eq!(fs.close_file(fd), Err(FsError::BadHandle));
    }

    #[test]
    fn read_is_bounded_by_file_size() {
        let mut fs = fresh_volume();
        write_whole_file(&mut fs, "/small.txt", b"tiny");
        let fd = fs.open_file("/small.txt", "r").unwrap();
        let mut buf = [0u8; 100];
        assert_eq!(fs.read_file(fd, &mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], b"tiny");
        assert_eq!(fs.read_file(fd, &mut buf).unwrap(), 0);
    }

    #[test]
    fn read_write_mode_overwrites_in_place() {
        let mut fs = fresh_volume();
        write_whole_file(&mut fs, "/rw.bin", &vec![0x11u8; 600]);
        let fd = fs.open_file("/rw.bin", "r+").unwrap();
        fs.seek_file(fd, SeekFrom::Start(510)).unwrap();
        assert_eq!(fs.write_file(fd, &[0x22; 4]).unwrap(), 4);
        fs.close_file(fd).unwrap();

        let back = read_whole_file(&mut fs, "/rw.bin");
        assert_eq!(back.len(), 600);
        assert!(back[..510].iter().all(|&b| b == 0x11));
        assert_eq!(&back[510..514], &[0x22; 4]);
        assert!(back[514..].iter().all(|&b| b == 0x11));
    }

    #[test]
    fn long_names_span_multiple_filename_entries() {
        let mut fs = fresh_volume();
        let name = "a-rather-long-file-name-spanning-entries.data";
        let path = format!("/{}", name);
        write_whole_file(&mut fs, &path, b"long");
        assert_eq!(read_whole_file(&mut fs, &path), b"long");
        let entries = fs.list_dir("/").unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, name);
    }

    #[test]
    fn directory_spills_into_later_sectors() {
        let mut fs = fresh_volume();
        for i in 0..8 {
            write_whole_file(&mut fs, &format!("/file-{}.txt", i), &[i as u8]);
        }
        assert_eq!(fs.list_dir("/").unwrap().len(), 8);
        assert_eq!(read_whole_file(&mut fs, "/file-7.txt"), &[7u8]);
    }

    #[test]
    fn create_never_splits_a_set_across_sectors() {
        let mut fs = fresh_volume();
        // bitmap descriptor + three 3-entry sets + one 4-entry set = 14 slots
        for name in ["/aa.txt", "/bb.txt", "/cc.txt"] {
            write_whole_file(&mut fs, name, b"x");
        }
        write_whole_file(&mut fs, "/a-name-of-twenty-chr", b"y");
        // a 3-entry set no longer fits in sector 0; it must not straddle
        write_whole_file(&mut fs, "/dd.txt", b"z");
        let root = fs.root_cluster();
        assert_eq!(find(&mut fs, root, "dd.txt").unwrap().index, 16);
    }

    #[test]
    fn search_handles_sets_written_across_sector_boundaries() {
        let mut fs = fresh_volume();
        for name in ["/aa.txt", "/bb.txt", "/cc.txt"] {
            write_whole_file(&mut fs, name, b"x");
        }
        write_whole_file(&mut fs, "/a-name-of-twenty-chr", b"y");
        write_whole_file(&mut fs, "/dd.txt", b"z");
        let root = fs.root_cluster();

        // a foreign implementation may straddle sectors; write such a set
        // over slots 14-16 (clobbering dd.txt's primary entry)
        let name = name_to_utf16("straddle.bin").unwrap();
        let set = build_entry_set(&name, ATTR_ARCHIVE, STREAM_ALLOC_POSSIBLE, 0, 0);
        fs.write_dir_entries(root, 14, &set).unwrap();

        let matched = find(&mut fs, root, "straddle.bin").unwrap();
        assert_eq!(matched.index, 14);
        // the clobbered candidate is skipped, not treated as a search error
        assert!(find(&mut fs, root, "dd.txt").is_none());
        assert_eq!(read_whole_file(&mut fs, "/straddle.bin"), b"");
    }

    #[test]
    fn broken_chain_yields_partial_read() {
        let mut fs = fresh_volume();
        write_whole_file(&mut fs, "/p.bin", &vec![5u8; 5000]);
        let root = fs.root_cluster();
        let first = find(&mut fs, root, "p.bin").unwrap().stream.first_cluster;
        // sever the chain after the first cluster
        fs.write_fat_entry(first, FAT_FREE).unwrap();

        let fd = fs.open_file("/p.bin", "r").unwrap();
        let mut buf = vec![0u8; 5000];
        assert_eq!(fs.read_file(fd, &mut buf).unwrap(), 2048);
        assert!(buf[..2048].iter().all(|&b| b == 5));
    }

    #[test]
    fn open_of_root_or_directories_fails() {
        let mut fs = fresh_volume();
        assert_eq!(fs.open_file("/", "r"), Err(FsError::IsADirectory));
        assert_eq!(fs.open_file("", "r"), Err(FsError::IsADirectory));
        assert_eq!(fs.remove("/"), Err(FsError::InvalidParameter));
    }

    #[test]
    fn open_missing_file_read_only_fails() {
        let mut fs = fresh_volume();
        assert_eq!(fs.open_file("/ghost", "r"), Err(FsError::NotFound));
        assert_eq!(fs.open_file("/ghost", "r+"), Err(FsError::NotFound));
    }
}
