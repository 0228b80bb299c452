use crc::{Algorithm, Crc};

pub const CRC_64_ECMA: Algorithm<u64> = crc::CRC_64_ECMA_182;

static CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA);

/// One-shot CRC64 of a byte slice.
pub fn checksum(data: &[u8]) -> u64 {
    CRC64.checksum(data)
}

/// Streaming CRC64 digest. Equivalent to [`checksum`] over the concatenation
/// of all updates.
pub struct Hasher {
    digest: crc::Digest<'static, u64>,
}

impl Hasher {
    pub fn new() -> Self {
        Self {
            digest: CRC64.digest(),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.digest.update(data);
    }

    pub fn finalize(self) -> u64 {
        self.digest.finalize()
    }
}

impl Default for Hasher {
    fn default() -> Self {
        Self::new()
    }
}
