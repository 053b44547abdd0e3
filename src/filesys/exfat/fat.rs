//! FAT chain, allocation bitmap and free-cluster search
//!
//! Allocation state lives in three overlapping structures: the FAT (chain
//! links), the allocation bitmap (one bit per cluster) and NoFatChain
//! extents, whose clusters read as free in the FAT despite being in use.
//! Free-cluster search must clear all three.

use alloc::vec::Vec;

use super::constants::*;
use super::dir_entry::{read_u32, write_u32, StreamEntry};
use super::ExFat;
use crate::filesys::FsError;

/// Inclusive cluster interval owned by a NoFatChain stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ClusterRange {
    pub start: u32,
    pub end: u32,
}

impl ClusterRange {
    pub(crate) fn contains(&self, cluster: u32) -> bool {
        (self.start..=self.end).contains(&cluster)
    }
}

impl ExFat<'_> {
    /// First sector of a cluster, or `None` for an out-of-range cluster
    /// number. Every caller must handle `None` before touching the disk.
    pub(crate) fn cluster_to_sector(&self, cluster: u32) -> Option<u64> {
        if cluster < FIRST_CLUSTER || cluster >= FIRST_CLUSTER + self.cluster_count {
            return None;
        }
        Some(
            self.cluster_heap_start
                + (cluster - FIRST_CLUSTER) as u64 * self.sectors_per_cluster as u64,
        )
    }

    /// Reads the 4-byte chain link of `cluster`.
    pub(crate) fn read_fat_entry(&mut self, cluster: u32) -> Result<u32, FsError> {
        let offset = cluster as u64 * 4;
        let sector = self.fat_start + offset / self.bytes_per_sector as u64;
        let off = (offset % self.bytes_per_sector as u64) as usize;
        self.read_sector(sector)?;
        Ok(read_u32(&self.scratch, off))
    }

    /// Read-modify-writes the chain link of `cluster`.
    pub(crate) fn write_fat_entry(&mut self, cluster: u32, value: u32) -> Result<(), FsError> {
        let offset = cluster as u64 * 4;
        let sector = self.fat_start + offset / self.bytes_per_sector as u64;
        let off = (offset % self.bytes_per_sector as u64) as usize;
        self.read_sector(sector)?;
        write_u32(&mut self.scratch, off, value);
        self.write_sector(sector)
    }

    /// Sector/byte/bit address of a cluster's bitmap bit. The bitmap is laid
    /// out contiguously from its first cluster.
    fn bitmap_location(&self, cluster: u32) -> Option<(u64, usize, u8)> {
        if cluster < FIRST_CLUSTER || cluster >= FIRST_CLUSTER + self.cluster_count {
            return None;
        }
        let bit = (cluster - FIRST_CLUSTER) as u64;
        let byte = bit / 8;
        let first = self.cluster_to_sector(self.bitmap_cluster)?;
        let sector = first + byte / self.bytes_per_sector as u64;
        let offset = (byte % self.bytes_per_sector as u64) as usize;
        Some((sector, offset, 1 << (bit % 8)))
    }

    /// Whether `cluster` is marked allocated in the bitmap.
    pub(crate) fn bitmap_bit(&mut self, cluster: u32) -> Result<bool, FsError> {
        let (sector, offset, mask) = self
            .bitmap_location(cluster)
            .ok_or(FsError::InvalidParameter)?;
        self.read_sector(sector)?;
        Ok(self.scratch[offset] & mask != 0)
    }

    /// Flips one bitmap bit on disk.
    pub(crate) fn set_bitmap_bit(&mut self, cluster: u32, allocated: bool) -> Result<(), FsError> {
        let (sector, offset, mask) = self
            .bitmap_location(cluster)
            .ok_or(FsError::InvalidParameter)?;
        self.read_sector(sector)?;
        if allocated {
            self.scratch[offset] |= mask;
        } else {
            self.scratch[offset] &= !mask;
        }
        self.write_sector(sector)
    }

    /// Collects the cluster spans of every NoFatChain stream in the root
    /// directory. These clusters read as free in the FAT and must be
    /// excluded from free-cluster search.
    pub(crate) fn collect_no_fat_chain_ranges(&mut self) -> Result<Vec<ClusterRange>, FsError> {
        let mut ranges = Vec::new();
        let entries_per_sector = self.entries_per_sector();
        let mut cluster = self.root_cluster;

        'chain: loop {
            let first_sector = match self.cluster_to_sector(cluster) {
                Some(s) => s,
                None => break,
            };
            for s in 0..self.sectors_per_cluster as u64 {
                self.read_sector(first_sector + s)?;
                for i in 0..entries_per_sector {
                    let off = i * DIR_ENTRY_SIZE;
                    let etype = self.scratch[off];
                    if etype == ENTRY_END {
                        break 'chain;
                    }
                    if etype != ENTRY_STREAM {
                        continue;
                    }
                    let stream = StreamEntry::parse(&self.scratch[off..off + DIR_ENTRY_SIZE]);
                    if !stream.no_fat_chain() || stream.first_cluster < FIRST_CLUSTER {
                        continue;
                    }
                    let span = stream.cluster_span(self.bytes_per_cluster);
                    ranges.push(ClusterRange {
                        start: stream.first_cluster,
                        end: stream.first_cluster + span - 1,
                    });
                }
            }
            match self.next_in_chain(cluster)? {
                Some(next) => cluster = next,
                None => break,
            }
        }
        Ok(ranges)
    }

    /// Linear scan for a cluster that is free in the FAT, clear in the
    /// bitmap and outside every NoFatChain range.
    pub(crate) fn find_free_cluster(&mut self) -> Result<u32, FsError> {
        let reserved = self.collect_no_fat_chain_ranges()?;
        for cluster in FIRST_CLUSTER..FIRST_CLUSTER + self.cluster_count {
            if reserved.iter().any(|range| range.contains(cluster)) {
                continue;
            }
            if self.bitmap_bit(cluster)? {
                continue;
            }
            if self.read_fat_entry(cluster)? != FAT_FREE {
                continue;
            }
            return Ok(cluster);
        }
        Err(FsError::DiskFull)
    }

    /// Claims one free cluster: end-of-chain in the FAT, allocated in the
    /// bitmap. Both writes must succeed.
    pub(crate) fn allocate_cluster(&mut self) -> Result<u32, FsError> {
        let cluster = self.find_free_cluster()?;
        self.write_fat_entry(cluster, FAT_EOC)?;
        self.set_bitmap_bit(cluster, true)?;
        Ok(cluster)
    }

    /// Releases a FAT-linked chain starting at `first`. Each node's
    /// successor is captured before the node is cleared; the walk stops at
    /// end-of-chain or any out-of-range link.
    pub(crate) fn free_cluster_chain(&mut self, first: u32) -> Result<(), FsError> {
        let mut cluster = first;
        while self.cluster_to_sector(cluster).is_some() {
            let next = self.read_fat_entry(cluster)?;
            self.write_fat_entry(cluster, FAT_FREE)?;
            self.set_bitmap_bit(cluster, false)?;
            if next == FAT_EOC {
                break;
            }
            cluster = next;
        }
        Ok(())
    }

    /// Releases the contiguous span of a NoFatChain stream. The FAT already
    /// reads free for these clusters; clearing it anyway keeps the two
    /// structures in agreement.
    pub(crate) fn free_cluster_span(&mut self, start: u32, data_length: u64) -> Result<(), FsError> {
        let span = data_length.div_ceil(self.bytes_per_cluster as u64).max(1) as u32;
        for cluster in start..start.saturating_add(span) {
            if self.cluster_to_sector(cluster).is_none() {
                break;
            }
            self.write_fat_entry(cluster, FAT_FREE)?;
            self.set_bitmap_bit(cluster, false)?;
        }
        Ok(())
    }

    /// Follows one FAT link while walking a directory or file chain.
    /// Free (broken chain), end-of-chain and out-of-range links all
    /// terminate the walk.
    pub(crate) fn next_in_chain(&mut self, cluster: u32) -> Result<Option<u32>, FsError> {
        let value = self.read_fat_entry(cluster)?;
        if value == FAT_FREE || value == FAT_EOC {
            return Ok(None);
        }
        if self.cluster_to_sector(value).is_none() {
            return Ok(None);
        }
        Ok(Some(value))
    }
}
