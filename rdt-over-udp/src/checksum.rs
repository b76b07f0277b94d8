//! CRC-32 over transferred data, used to verify end-to-end integrity.
//!
//! The receiver reports the checksum of everything it delivered in its
//! FIN-ACK; the sender side compares that against [`crc32`] of the buffer it
//! handed to `send`.

use crc::{Crc, Digest, CRC_32_ISO_HDLC};

/// Standard CRC-32 (reflected polynomial `0xEDB88320`).
pub static CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// One-shot checksum of `data`.
pub fn crc32(data: &[u8]) -> u32 {
    CRC32.checksum(data)
}

/// Incremental checksum fed one packet at a time.
pub struct Checksum {
    digest: Digest<'static, u32>,
}

impl Default for Checksum {
    fn default() -> Self {
        Self {
            digest: CRC32.digest(),
        }
    }
}

impl Checksum {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.digest.update(data);
    }

    pub fn finalize(self) -> u32 {
        self.digest.finalize()
    }
}
