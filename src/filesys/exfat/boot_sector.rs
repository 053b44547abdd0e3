//! exFAT boot sector

use super::constants::*;
use super::dir_entry::{read_u32, read_u64, write_u32, write_u64};
use crate::filesys::FsError;

/// Volume geometry parsed from the boot sector.
///
/// All offsets are in sectors relative to the volume start; the byte layout
/// is fixed by the on-disk format (name at 3, FAT offset at 80, cluster heap
/// offset at 88, cluster count at 92, root cluster at 96, size shifts at
/// 108/109, signature at 510).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootSector {
    /// Total size of the volume in sectors.
    pub volume_length: u64,

    /// First sector of the FAT region.
    pub fat_offset: u32,

    /// Length of the FAT region in sectors.
    pub fat_length: u32,

    /// First sector of the cluster heap.
    pub cluster_heap_offset: u32,

    /// Number of data clusters on the volume.
    pub cluster_count: u32,

    /// First cluster of the root directory.
    pub root_cluster: u32,

    /// log2 of the sector size in bytes.
    pub bytes_per_sector_shift: u8,

    /// log2 of the cluster size in sectors.
    pub sectors_per_cluster_shift: u8,
}

impl BootSector {
    /// Parses and validates a raw boot sector.
    pub fn parse(buf: &[u8]) -> Result<Self, FsError> {
        if buf.len() < 512 {
            return Err(FsError::InvalidFilesystem);
        }
        if buf[FS_NAME_OFFSET..FS_NAME_OFFSET + 8] != FS_NAME {
            return Err(FsError::InvalidFilesystem);
        }
        if buf[510..512] != BOOT_SIGNATURE {
            return Err(FsError::InvalidFilesystem);
        }

        let bs = BootSector {
            volume_length: read_u64(buf, 72),
            fat_offset: read_u32(buf, 80),
            fat_length: read_u32(buf, 84),
            cluster_heap_offset: read_u32(buf, 88),
            cluster_count: read_u32(buf, 92),
            root_cluster: read_u32(buf, 96),
            bytes_per_sector_shift: buf[108],
            sectors_per_cluster_shift: buf[109],
        };

        // 512-byte to 4 KiB sectors, clusters capped at 32 MiB.
        if !(9..=12).contains(&bs.bytes_per_sector_shift) {
            return Err(FsError::InvalidFilesystem);
        }
        if bs.bytes_per_sector_shift + bs.sectors_per_cluster_shift > 25 {
            return Err(FsError::InvalidFilesystem);
        }
        if bs.cluster_count == 0 || bs.fat_offset == 0 || bs.cluster_heap_offset == 0 {
            return Err(FsError::InvalidFilesystem);
        }
        if bs.root_cluster < FIRST_CLUSTER
            || bs.root_cluster >= FIRST_CLUSTER + bs.cluster_count
        {
            return Err(FsError::InvalidFilesystem);
        }

        Ok(bs)
    }

    /// Encodes the boot sector into `buf` (one full sector, pre-zeroed).
    pub fn encode(&self, buf: &mut [u8]) {
        buf[0] = 0xEB; // jump over the BPB, as real boot sectors do
        buf[1] = 0x76;
        buf[2] = 0x90;
        buf[FS_NAME_OFFSET..FS_NAME_OFFSET + 8].copy_from_slice(&FS_NAME);
        write_u64(buf, 72, self.volume_length);
        write_u32(buf, 80, self.fat_offset);
        write_u32(buf, 84, self.fat_length);
        write_u32(buf, 88, self.cluster_heap_offset);
        write_u32(buf, 92, self.cluster_count);
        write_u32(buf, 96, self.root_cluster);
        buf[104] = 0x00; // filesystem revision 1.00
        buf[105] = 0x01;
        buf[108] = self.bytes_per_sector_shift;
        buf[109] = self.sectors_per_cluster_shift;
        buf[110] = 1; // one FAT
        buf[111] = 0x80; // drive select
        buf[510..512].copy_from_slice(&BOOT_SIGNATURE);
    }

    pub fn bytes_per_sector(&self) -> u32 {
        1 << self.bytes_per_sector_shift
    }

    pub fn sectors_per_cluster(&self) -> u32 {
        1 << self.sectors_per_cluster_shift
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    fn sample() -> BootSector {
        BootSector {
            volume_length: 4096,
            fat_offset: 24,
            fat_length: 8,
            cluster_heap_offset: 32,
            cluster_count: 1016,
            root_cluster: 3,
            bytes_per_sector_shift: 9,
            sectors_per_cluster_shift: 2,
        }
    }

    #[test]
    fn encode_then_parse() {
        let mut buf = vec![0u8; 512];
        sample().encode(&mut buf);
        let parsed = BootSector::parse(&buf).unwrap();
        assert_eq!(parsed.fat_offset, 24);
        assert_eq!(parsed.cluster_heap_offset, 32);
        assert_eq!(parsed.cluster_count, 1016);
        assert_eq!(parsed.root_cluster, 3);
        assert_eq!(parsed.bytes_per_sector(), 512);
        assert_eq!(parsed.sectors_per_cluster(), 4);
    }

    #[test]
    fn rejects_bad_signature() {
        let mut buf = vec![0u8; 512];
        sample().encode(&mut buf);
        buf[510] = 0;
        assert_eq!(BootSector::parse(&buf), Err(FsError::InvalidFilesystem));
    }

    #[test]
    fn rejects_wrong_name() {
        let mut buf = vec![0u8; 512];
        sample().encode(&mut buf);
        buf[3..11].copy_from_slice(b"NTFS    ");
        assert_eq!(BootSector::parse(&buf), Err(FsError::InvalidFilesystem));
    }

    #[test]
    fn rejects_out_of_range_root() {
        let mut bs = sample();
        bs.root_cluster = bs.cluster_count + FIRST_CLUSTER;
        let mut buf = vec![0u8; 512];
        bs.encode(&mut buf);
        assert_eq!(BootSector::parse(&buf), Err(FsError::InvalidFilesystem));
    }

    #[test]
    fn rejects_blank_sector() {
        let buf = vec![0u8; 512];
        assert_eq!(BootSector::parse(&buf), Err(FsError::InvalidFilesystem));
    }
}
