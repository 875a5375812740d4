use crate::error::{ProgError, Result};

/// Value used to pad the contiguous image buffer where the hex file left
/// gaps. All-`0xFF` chunks are recognized and skipped by the pipeline.
pub const PAD_BYTE: u8 = 0xFF;

/// One flash erase unit: `(start_address, size_bytes)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Sector {
    pub start: u32,
    pub size: u32,
}

impl Sector {
    pub const fn end(&self) -> u32 {
        self.start + self.size - 1
    }

    fn contains(&self, addr: u32) -> bool {
        addr >= self.start && addr <= self.end()
    }

    fn intersects(&self, min_addr: u32, max_addr: u32) -> bool {
        self.start <= max_addr && min_addr <= self.end()
    }
}

/// Fixed flash geometry for the supported device family: four 16 KiB
/// sectors, one 64 KiB sector, then seven 128 KiB sectors.
pub const FLASH_SECTORS: [Sector; 12] = {
    const fn sector(start: u32, size: u32) -> Sector {
        Sector { start, size }
    }
    [
        sector(0x0800_0000, 16 * 1024),
        sector(0x0800_4000, 16 * 1024),
        sector(0x0800_8000, 16 * 1024),
        sector(0x0800_C000, 16 * 1024),
        sector(0x0801_0000, 64 * 1024),
        sector(0x0802_0000, 128 * 1024),
        sector(0x0804_0000, 128 * 1024),
        sector(0x0806_0000, 128 * 1024),
        sector(0x0808_0000, 128 * 1024),
        sector(0x080A_0000, 128 * 1024),
        sector(0x080C_0000, 128 * 1024),
        sector(0x080E_0000, 128 * 1024),
    ]
};

/// Returns the index of the sector containing `addr`, if any.
pub fn sector_for_address(addr: u32) -> Option<usize> {
    FLASH_SECTORS.iter().position(|s| s.contains(addr))
}

/// An immutable, session-wide firmware image: a contiguous, `0xFF`-padded
/// byte buffer plus the address range it occupies and the sectors it maps
/// to. Shared read-only across all targets in a session.
pub struct FirmwareImage {
    pub data: Vec<u8>,
    pub min_addr: u32,
    pub max_addr: u32,
    pub used_sectors: Vec<usize>,
}

impl FirmwareImage {
    /// Builds an image from a contiguous byte buffer already padded with
    /// [`PAD_BYTE`] and its address range, rejecting it (P1) if it starts
    /// before flash or would run past the end of the last flash sector.
    pub fn new(data: Vec<u8>, min_addr: u32, max_addr: u32) -> Result<Self> {
        if data.is_empty() {
            return Err(ProgError::Config("hex file is empty or invalid".into()));
        }
        if min_addr > max_addr {
            return Err(ProgError::Config("min_addr must not exceed max_addr".into()));
        }
        let first_sector_start = FLASH_SECTORS.first().expect("flash geometry is non-empty").start;
        if min_addr < first_sector_start {
            return Err(ProgError::Config(format!(
                "image start address 0x{min_addr:08X} precedes flash boundary 0x{first_sector_start:08X}"
            )));
        }
        let last_sector_end = FLASH_SECTORS.last().expect("flash geometry is non-empty").end();
        if max_addr > last_sector_end {
            return Err(ProgError::Config(format!(
                "image end address 0x{max_addr:08X} exceeds flash boundary 0x{last_sector_end:08X}"
            )));
        }

        let used_sectors = used_sectors(min_addr, max_addr);
        if used_sectors.is_empty() {
            return Err(ProgError::Config("hex file doesn't map to any flash sector".into()));
        }

        Ok(Self {
            data,
            min_addr,
            max_addr,
            used_sectors,
        })
    }

    /// Carves out the 256-byte-or-shorter chunk starting at `addr`. A
    /// sector's last chunk commonly runs past `max_addr` (the backing
    /// buffer is sized to the image, not padded to the sector boundary);
    /// any byte outside `[min_addr, max_addr]` reads back as [`PAD_BYTE`]
    /// instead of indexing past the buffer, mirroring the reference
    /// implementation's short/empty slice on an out-of-range read.
    pub fn chunk(&self, addr: u32, len: usize) -> Vec<u8> {
        (0..len as u32)
            .map(|i| {
                let byte_addr = addr + i;
                if byte_addr >= self.min_addr && byte_addr <= self.max_addr {
                    self.data[(byte_addr - self.min_addr) as usize]
                } else {
                    PAD_BYTE
                }
            })
            .collect()
    }
}

/// `used_sectors = {i : sector_i ∩ [min_addr, max_addr] ≠ ∅}`, ascending,
/// deduplicated (P2).
fn used_sectors(min_addr: u32, max_addr: u32) -> Vec<usize> {
    FLASH_SECTORS
        .iter()
        .enumerate()
        .filter(|(_, s)| s.intersects(min_addr, max_addr))
        .map(|(i, _)| i)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_image_past_flash_boundary() {
        let last_end = FLASH_SECTORS.last().unwrap().end();
        let data = vec![0u8; 16];
        let err = FirmwareImage::new(data, last_end - 15, last_end + 1);
        assert!(err.is_err());
    }

    #[test]
    fn accepts_image_at_flash_boundary() {
        let last_end = FLASH_SECTORS.last().unwrap().end();
        let data = vec![0u8; 16];
        let img = FirmwareImage::new(data, last_end - 15, last_end).unwrap();
        assert_eq!(*img.used_sectors.last().unwrap(), FLASH_SECTORS.len() - 1);
    }

    #[test]
    fn used_sectors_covers_exactly_the_intersecting_sectors() {
        // [0x08000000, 0x08000FFF] sits entirely within sector 0.
        let sectors = used_sectors(0x0800_0000, 0x0800_0FFF);
        assert_eq!(sectors, vec![0]);
    }

    #[test]
    fn used_sectors_spans_multiple_sectors_when_the_range_crosses_a_boundary() {
        // Crosses from sector 3 (16K) into sector 4 (64K).
        let sectors = used_sectors(0x0800_C000, 0x0801_1000);
        assert_eq!(sectors, vec![3, 4]);
    }

    #[test]
    fn used_sectors_is_sorted_ascending_with_no_duplicates() {
        let sectors = used_sectors(0x0800_0000, 0x0804_0000);
        let mut sorted = sectors.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sectors, sorted);
    }

    #[test]
    fn sector_for_address_finds_the_containing_sector() {
        assert_eq!(sector_for_address(0x0800_0000), Some(0));
        assert_eq!(sector_for_address(0x0801_0000), Some(4));
        assert_eq!(sector_for_address(0x080E_FFFF), Some(11));
        assert_eq!(sector_for_address(0x080F_0000), None);
    }

    #[test]
    fn chunk_reads_from_the_correct_offset() {
        let data: Vec<u8> = (0..=255u8).collect();
        let img = FirmwareImage::new(data, 0x0800_0000, 0x0800_00FF).unwrap();
        let chunk = img.chunk(0x0800_0010, 4);
        assert_eq!(chunk, vec![0x10, 0x11, 0x12, 0x13]);
    }

    #[test]
    fn chunk_pads_bytes_past_max_addr_instead_of_panicking() {
        // Image is 4 bytes but sits in a sector whose last chunk runs well
        // past max_addr; this is the ordinary case, not an edge case.
        let data = vec![0xAAu8, 0xBB, 0xCC, 0xDD];
        let img = FirmwareImage::new(data, 0x0800_0000, 0x0800_0003).unwrap();
        let chunk = img.chunk(0x0800_0000, 8);
        assert_eq!(chunk, vec![0xAA, 0xBB, 0xCC, 0xDD, PAD_BYTE, PAD_BYTE, PAD_BYTE, PAD_BYTE]);
    }

    #[test]
    fn rejects_image_starting_before_flash() {
        let first_start = FLASH_SECTORS.first().unwrap().start;
        let data = vec![0u8; 16];
        let err = FirmwareImage::new(data, first_start - 16, first_start + 15);
        assert!(err.is_err());
    }
}
