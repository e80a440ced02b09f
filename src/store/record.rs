//! Durable record page layout.
//!
//! ```text
//! offset  size  field
//! 0       4     magic "HWDR" (u32 LE)
//! 4       1     format version
//! 5       1     reserved (0)
//! 6       2     payload length (u16 LE)
//! 8       244   payload, zero padded
//! 252     4     CRC-32/IEEE over bytes 0..252 (u32 LE)
//! ```
//!
//! An erased page or one that fails validation decodes to the empty record.

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::flash::PAGE_SIZE;
use crate::error::{HomewireError, Result};

pub const RECORD_MAGIC: u32 = u32::from_le_bytes(*b"HWDR");
pub const RECORD_VERSION: u8 = 1;
pub const HEADER_LEN: usize = 8;
pub const CRC_LEN: usize = 4;
pub const CRC_OFFSET: usize = PAGE_SIZE - CRC_LEN;

/// Largest payload a record can hold.
pub const MAX_PAYLOAD: usize = CRC_OFFSET - HEADER_LEN;

/// Why a stored page was not accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageError {
    Blank,
    BadMagic(u32),
    UnsupportedVersion(u8),
    BadLength(usize),
    CrcMismatch { stored: u32, computed: u32 },
}

/// The single persisted state blob. Opaque bytes to the store; the domain
/// service chooses the encoding (JSON through the helpers below).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DurableRecord {
    payload: Vec<u8>,
}

impl DurableRecord {
    pub fn new(payload: Vec<u8>) -> Result<Self> {
        if payload.len() > MAX_PAYLOAD {
            return Err(HomewireError::Flash(format!(
                "record payload of {} bytes exceeds {MAX_PAYLOAD}",
                payload.len()
            )));
        }
        Ok(Self { payload })
    }

    /// Serialize `value` as JSON into a record.
    pub fn from_value<T: Serialize>(value: &T) -> Result<Self> {
        Self::new(serde_json::to_vec(value)?)
    }

    /// Deserialize the payload; `None` when empty.
    pub fn to_value<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        if self.payload.is_empty() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_slice(&self.payload)?))
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Encode into a full flash page.
    pub fn to_page(&self) -> [u8; PAGE_SIZE] {
        let mut page = [0u8; PAGE_SIZE];
        page[0..4].copy_from_slice(&RECORD_MAGIC.to_le_bytes());
        page[4] = RECORD_VERSION;
        page[5] = 0;
        page[6..8].copy_from_slice(&(self.payload.len() as u16).to_le_bytes());
        page[HEADER_LEN..HEADER_LEN + self.payload.len()].copy_from_slice(&self.payload);

        let crc = crc32_ieee(&page[..CRC_OFFSET]);
        page[CRC_OFFSET..].copy_from_slice(&crc.to_le_bytes());
        page
    }

    /// Decode and validate a flash page.
    pub fn from_page(page: &[u8; PAGE_SIZE]) -> std::result::Result<Self, PageError> {
        if page.iter().all(|&b| b == super::flash::ERASED) {
            return Err(PageError::Blank);
        }

        let magic = u32::from_le_bytes([page[0], page[1], page[2], page[3]]);
        if magic != RECORD_MAGIC {
            return Err(PageError::BadMagic(magic));
        }
        if page[4] != RECORD_VERSION {
            return Err(PageError::UnsupportedVersion(page[4]));
        }

        let len = u16::from_le_bytes([page[6], page[7]]) as usize;
        if len > MAX_PAYLOAD {
            return Err(PageError::BadLength(len));
        }

        let stored = u32::from_le_bytes([
            page[CRC_OFFSET],
            page[CRC_OFFSET + 1],
            page[CRC_OFFSET + 2],
            page[CRC_OFFSET + 3],
        ]);
        let computed = crc32_ieee(&page[..CRC_OFFSET]);
        if stored != computed {
            return Err(PageError::CrcMismatch { stored, computed });
        }

        Ok(Self {
            payload: page[HEADER_LEN..HEADER_LEN + len].to_vec(),
        })
    }
}

/// CRC-32/IEEE (reflected, poly 0xEDB88320, init/xorout 0xFFFFFFFF).
pub fn crc32_ieee(bytes: &[u8]) -> u32 {
    let mut crc = 0xFFFF_FFFFu32;
    for &b in bytes {
        crc ^= b as u32;
        for _ in 0..8 {
            let mask = 0u32.wrapping_sub(crc & 1);
            crc = (crc >> 1) ^ (0xEDB8_8320u32 & mask);
        }
    }
    !crc
}
