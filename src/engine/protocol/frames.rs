//! Wire frames. All multi-byte integers are little-endian.
//!
//! | Frame        | Direction     | Layout                              |
//! |--------------|---------------|-------------------------------------|
//! | UpdateHeader | peer → device | u32 size, 32-byte SHA-256           |
//! | FirmwareAck  | device → peer | 4-byte marker                       |
//! | OtaAck       | device → peer | u32 bytes_written, u16 status code  |

use crate::engine::error::FrameError;
use crate::engine::updater::{ImageDigest, DIGEST_LEN};

pub const SIZE_FIELD_LEN: usize = 4;
pub const HEADER_LEN: usize = SIZE_FIELD_LEN + DIGEST_LEN;

pub const FIRMWARE_ACK_MARKER: [u8; 4] = [0xA3, 0x5F, 0x1C, 0xE7];
pub const FIRMWARE_ACK_LEN: usize = FIRMWARE_ACK_MARKER.len();

pub const OTA_ACK_LEN: usize = 6;

/// Announces an incoming image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateHeader {
    pub firmware_size: u32,
    pub expected_digest: ImageDigest,
}

impl UpdateHeader {
    pub fn new(firmware_size: u32, expected_digest: ImageDigest) -> Self {
        Self {
            firmware_size,
            expected_digest,
        }
    }

    /// Parse a header; the frame must be exactly `HEADER_LEN` bytes
    pub fn parse(frame: &[u8]) -> Result<Self, FrameError> {
        if frame.len() != HEADER_LEN {
            return Err(FrameError::Length {
                expected: HEADER_LEN,
                actual: frame.len(),
            });
        }

        let (size, digest) = frame.split_at(SIZE_FIELD_LEN);
        let mut size_bytes = [0u8; SIZE_FIELD_LEN];
        size_bytes.copy_from_slice(size);
        let mut expected_digest = [0u8; DIGEST_LEN];
        expected_digest.copy_from_slice(digest);

        Ok(Self {
            firmware_size: u32::from_le_bytes(size_bytes),
            expected_digest,
        })
    }

    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut frame = [0u8; HEADER_LEN];
        frame[..SIZE_FIELD_LEN].copy_from_slice(&self.firmware_size.to_le_bytes());
        frame[SIZE_FIELD_LEN..].copy_from_slice(&self.expected_digest);
        frame
    }
}

/// Per-chunk receipt acknowledgement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FirmwareAck;

impl FirmwareAck {
    pub fn to_bytes(&self) -> [u8; FIRMWARE_ACK_LEN] {
        FIRMWARE_ACK_MARKER
    }

    pub fn parse(frame: &[u8]) -> Result<Self, FrameError> {
        let bytes: [u8; FIRMWARE_ACK_LEN] = frame.try_into().map_err(|_| FrameError::Length {
            expected: FIRMWARE_ACK_LEN,
            actual: frame.len(),
        })?;
        if bytes != FIRMWARE_ACK_MARKER {
            return Err(FrameError::Marker(bytes));
        }
        Ok(FirmwareAck)
    }
}

/// Terminal outcome reported to the peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum AckStatus {
    Success = 100,
    Failure = 200,
}

impl AckStatus {
    pub fn code(self) -> u16 {
        self as u16
    }
}

impl TryFrom<u16> for AckStatus {
    type Error = FrameError;

    fn try_from(code: u16) -> Result<Self, Self::Error> {
        match code {
            100 => Ok(AckStatus::Success),
            200 => Ok(AckStatus::Failure),
            other => Err(FrameError::StatusCode(other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OtaAck {
    pub bytes_written: u32,
    pub status: AckStatus,
}

impl OtaAck {
    pub fn to_bytes(&self) -> [u8; OTA_ACK_LEN] {
        let mut frame = [0u8; OTA_ACK_LEN];
        frame[..4].copy_from_slice(&self.bytes_written.to_le_bytes());
        frame[4..].copy_from_slice(&self.status.code().to_le_bytes());
        frame
    }

    pub fn parse(frame: &[u8]) -> Result<Self, FrameError> {
        if frame.len() != OTA_ACK_LEN {
            return Err(FrameError::Length {
                expected: OTA_ACK_LEN,
                actual: frame.len(),
            });
        }
        let bytes_written = u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]);
        let status = AckStatus::try_from(u16::from_le_bytes([frame[4], frame[5]]))?;
        Ok(Self {
            bytes_written,
            status,
        })
    }

    pub fn is_success(&self) -> bool {
        self.status == AckStatus::Success
    }
}
