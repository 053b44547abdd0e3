//! Directory search and path resolution
//!
//! Directories are walked by a flat entry index per cluster so that the
//! secondary entries of a set can be located even when they sit in a
//! different sector of the same cluster; the owning sector is re-read on
//! demand through the shared scratch buffer. A candidate that fails to
//! parse is skipped by its declared secondary count, never surfaced as a
//! search failure.

use super::constants::*;
use super::dir_entry::{names_equal, FileEntry, NameBuf, StreamEntry};
use super::ExFat;
use crate::filesys::FsError;

/// A located directory entry set.
#[derive(Debug, Clone, Copy)]
pub(crate) struct DirMatch {
    pub file: FileEntry,
    pub stream: StreamEntry,
    /// Cluster of the directory holding the set.
    pub cluster: u32,
    /// Flat entry index of the File entry within that cluster.
    pub index: u32,
}

/// Finds a run of `needed` unused entries inside one sector, returning the
/// entry index of the run start. A run may combine released entries and the
/// end-of-directory tail.
pub(crate) fn find_free_run(sector: &[u8], needed: usize) -> Option<usize> {
    let entries = sector.len() / DIR_ENTRY_SIZE;
    let mut run_start = 0;
    let mut run_len = 0;

    for i in 0..entries {
        let etype = sector[i * DIR_ENTRY_SIZE];
        if etype == ENTRY_END {
            // Everything from the end marker on is free.
            if run_len == 0 {
                run_start = i;
            }
            return (entries - run_start >= needed).then_some(run_start);
        }
        if etype & ENTRY_IN_USE == 0 {
            if run_len == 0 {
                run_start = i;
            }
            run_len += 1;
            if run_len == needed {
                return Some(run_start);
            }
        } else {
            run_len = 0;
        }
    }
    None
}

impl ExFat<'_> {
    pub(crate) fn entries_per_sector(&self) -> usize {
        self.bytes_per_sector as usize / DIR_ENTRY_SIZE
    }

    pub(crate) fn entries_per_cluster(&self) -> usize {
        self.entries_per_sector() * self.sectors_per_cluster as usize
    }

    /// Copies one raw directory entry, re-reading its sector on demand.
    pub(crate) fn read_dir_entry(
        &mut self,
        cluster: u32,
        index: usize,
    ) -> Result<[u8; DIR_ENTRY_SIZE], FsError> {
        let per_sector = self.entries_per_sector();
        let base = self.cluster_to_sector(cluster).ok_or(FsError::IOError)?;
        self.read_sector(base + (index / per_sector) as u64)?;
        let off = (index % per_sector) * DIR_ENTRY_SIZE;
        let mut raw = [0u8; DIR_ENTRY_SIZE];
        raw.copy_from_slice(&self.scratch[off..off + DIR_ENTRY_SIZE]);
        Ok(raw)
    }

    /// Writes a span of consecutive directory entries back, grouping the
    /// read-modify-write cycles by sector.
    pub(crate) fn write_dir_entries(
        &mut self,
        cluster: u32,
        index: usize,
        bytes: &[u8],
    ) -> Result<(), FsError> {
        let per_sector = self.entries_per_sector();
        let base = self.cluster_to_sector(cluster).ok_or(FsError::IOError)?;
        let count = bytes.len() / DIR_ENTRY_SIZE;
        let mut i = 0;
        while i < count {
            let sector = base + ((index + i) / per_sector) as u64;
            self.read_sector(sector)?;
            while i < count && base + ((index + i) / per_sector) as u64 == sector {
                let off = ((index + i) % per_sector) * DIR_ENTRY_SIZE;
                self.scratch[off..off + DIR_ENTRY_SIZE]
                    .copy_from_slice(&bytes[i * DIR_ENTRY_SIZE..(i + 1) * DIR_ENTRY_SIZE]);
                i += 1;
            }
            self.write_sector(sector)?;
        }
        Ok(())
    }

    /// Gathers the UTF-16 name of a set whose File entry sits at `index`.
    /// Returns `None` when the filename entries are missing or short.
    pub(crate) fn collect_entry_name(
        &mut self,
        cluster: u32,
        index: usize,
        secondary_count: usize,
        name_length: usize,
    ) -> Result<Option<NameBuf>, FsError> {
        if name_length == 0 || name_length > MAX_NAME_LENGTH {
            return Ok(None);
        }
        let mut name = NameBuf::new();
        let mut entry = 2; // filename entries follow File + Stream
        while name.len() < name_length {
            if entry > secondary_count {
                return Ok(None);
            }
            let raw = self.read_dir_entry(cluster, index + entry)?;
            if raw[0] != ENTRY_FILENAME {
                return Ok(None);
            }
            for j in 0..NAME_UNITS_PER_ENTRY {
                if name.len() == name_length {
                    break;
                }
                let unit = u16::from_le_bytes([raw[2 + j * 2], raw[3 + j * 2]]);
                if name.try_push(unit).is_err() {
                    return Ok(None);
                }
            }
            entry += 1;
        }
        Ok(Some(name))
    }

    /// Walks a directory's cluster chain looking for `name`.
    ///
    /// Malformed candidates (missing stream entry, short filename entries,
    /// sets extending past the cluster end) are skipped by their secondary
    /// count. Terminates on the end-of-directory marker or the end of the
    /// chain with `Ok(None)`.
    pub(crate) fn search_directory(
        &mut self,
        dir_cluster: u32,
        name: &[u16],
    ) -> Result<Option<DirMatch>, FsError> {
        if dir_cluster < FIRST_CLUSTER {
            return Ok(None);
        }
        let per_cluster = self.entries_per_cluster();
        let mut cluster = dir_cluster;

        loop {
            let mut index = 0;
            while index < per_cluster {
                let raw = self.read_dir_entry(cluster, index)?;
                let etype = raw[0];
                if etype == ENTRY_END {
                    return Ok(None);
                }
                if etype != ENTRY_FILE {
                    index += 1;
                    continue;
                }

                let file = FileEntry::parse(&raw);
                let count = file.secondary_count as usize;
                let skip = count + 1;
                if count < 2 || index + count >= per_cluster {
                    // Set is truncated or would cross the cluster end.
                    index += skip;
                    continue;
                }

                let sraw = self.read_dir_entry(cluster, index + 1)?;
                if sraw[0] != ENTRY_STREAM {
                    index += skip;
                    continue;
                }
                let stream = StreamEntry::parse(&sraw);

                match self.collect_entry_name(cluster, index, count, stream.name_length as usize)? {
                    Some(entry_name) if names_equal(&entry_name, name) => {
                        return Ok(Some(DirMatch {
                            file,
                            stream,
                            cluster,
                            index: index as u32,
                        }));
                    }
                    _ => {}
                }
                index += skip;
            }
            match self.next_in_chain(cluster)? {
                Some(next) => cluster = next,
                None => return Ok(None),
            }
        }
    }

    /// Resolves every component of `path` except the last, returning the
    /// terminal directory cluster and the leaf name. An empty path resolves
    /// to the root directory with an empty leaf.
    pub(crate) fn resolve_path<'p>(&mut self, path: &'p str) -> Result<(u32, &'p str), FsError> {
        let mut current = self.root_cluster;
        let mut leaf = "";

        let mut components = path.split('/').filter(|c| !c.is_empty()).peekable();
        while let Some(component) = components.next() {
            if components.peek().is_none() {
                leaf = component;
                break;
            }
            let name = super::dir_entry::name_to_utf16(component)?;
            let found = self
                .search_directory(current, &name)?
                .ok_or(FsError::NotFound)?;
            if !found.file.is_directory() {
                return Err(FsError::NotADirectory);
            }
            current = found.stream.first_cluster;
        }
        Ok((current, leaf))
    }
}
