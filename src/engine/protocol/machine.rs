//! Protocol State Machine
//!
//! Turns the ordered chunk stream of one connection into Update Manager
//! calls. The first 36-byte chunk is the header; every later chunk is image
//! data until the manager reports a terminal outcome.

use tracing::{debug, error, info, warn};

use super::frames::{AckStatus, OtaAck, UpdateHeader, HEADER_LEN};
use crate::engine::error::ErrorCode;
use crate::engine::storage::FirmwareStorage;
use crate::engine::updater::{Progress, UpdateManager};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProtocolState {
    #[default]
    ReadHeader,
    /// Header accepted; the manager is opened by the next chunk
    StartUpdate(UpdateHeader),
    WriteFirmware,
}

/// Outcome of one `ingest` call. Only terminal outcomes carry a byte count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestResult {
    InProgress,
    Complete { bytes_written: u32 },
    Failed { bytes_written: u32 },
}

impl IngestResult {
    pub fn status(&self) -> ErrorCode {
        match self {
            IngestResult::InProgress => ErrorCode::InProgress,
            IngestResult::Complete { .. } => ErrorCode::Ok,
            IngestResult::Failed { .. } => ErrorCode::Fail,
        }
    }

    pub fn bytes_written(&self) -> Option<u32> {
        match *self {
            IngestResult::InProgress => None,
            IngestResult::Complete { bytes_written } | IngestResult::Failed { bytes_written } => {
                Some(bytes_written)
            }
        }
    }

    /// Terminal acknowledgement for the peer, if this outcome needs one
    pub fn ota_ack(&self) -> Option<OtaAck> {
        match *self {
            IngestResult::InProgress => None,
            IngestResult::Complete { bytes_written } => Some(OtaAck {
                bytes_written,
                status: AckStatus::Success,
            }),
            IngestResult::Failed { bytes_written } => Some(OtaAck {
                bytes_written,
                status: AckStatus::Failure,
            }),
        }
    }
}

/// Result of a single transition
enum Step {
    Yield(IngestResult),
    /// Reprocess the same chunk in the new state
    Continue,
}

#[derive(Debug, Default)]
pub struct ProtocolStateMachine {
    state: ProtocolState,
    bytes_written: u64,
}

impl ProtocolStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ProtocolState {
        self.state
    }

    /// Bytes received for the current image
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Back to `ReadHeader` with all counters cleared
    pub fn reset(&mut self) {
        self.state = ProtocolState::ReadHeader;
        self.bytes_written = 0;
    }

    pub fn ingest<S: FirmwareStorage>(
        &mut self,
        manager: &mut UpdateManager<S>,
        chunk: &[u8],
    ) -> IngestResult {
        loop {
            match self.step(manager, chunk) {
                Step::Yield(result) => return result,
                Step::Continue => continue,
            }
        }
    }

    fn step<S: FirmwareStorage>(&mut self, manager: &mut UpdateManager<S>, chunk: &[u8]) -> Step {
        match self.state {
            ProtocolState::ReadHeader => Step::Yield(self.read_header(chunk)),
            ProtocolState::StartUpdate(header) => {
                match manager.begin_or_recover(header.firmware_size, header.expected_digest) {
                    Ok(()) => {
                        self.state = ProtocolState::WriteFirmware;
                        Step::Continue
                    }
                    Err(e) => {
                        error!("Could not start update: {}", e);
                        Step::Yield(self.finish(manager, false))
                    }
                }
            }
            ProtocolState::WriteFirmware => {
                self.bytes_written += chunk.len() as u64;
                match manager.write(chunk) {
                    Ok(Progress::InProgress) => Step::Yield(IngestResult::InProgress),
                    Ok(Progress::Verified) => Step::Yield(self.finish(manager, true)),
                    Err(e) => {
                        warn!(received = self.bytes_written, "Firmware write failed: {}", e);
                        Step::Yield(self.finish(manager, false))
                    }
                }
            }
        }
    }

    fn read_header(&mut self, chunk: &[u8]) -> IngestResult {
        if chunk.len() != HEADER_LEN {
            debug!(len = chunk.len(), "Ignoring non-header chunk");
            return IngestResult::InProgress;
        }
        let header = match UpdateHeader::parse(chunk) {
            Ok(header) => header,
            Err(e) => {
                debug!("Ignoring chunk: {}", e);
                return IngestResult::InProgress;
            }
        };

        if header.firmware_size == 0 {
            warn!("Header announces an empty image");
            self.reset();
            return IngestResult::Failed { bytes_written: 0 };
        }

        info!(
            size = header.firmware_size,
            digest = %hex::encode(header.expected_digest),
            "Update header received"
        );
        self.state = ProtocolState::StartUpdate(header);
        IngestResult::InProgress
    }

    /// Commit or discard, then rearm for the next header
    fn finish<S: FirmwareStorage>(
        &mut self,
        manager: &mut UpdateManager<S>,
        verified: bool,
    ) -> IngestResult {
        let bytes_written = u32::try_from(self.bytes_written).unwrap_or(u32::MAX);
        let committed = match manager.commit(verified) {
            Ok(()) => true,
            Err(e) => {
                if verified {
                    error!("Commit failed: {}", e);
                }
                false
            }
        };
        self.reset();

        if committed {
            IngestResult::Complete { bytes_written }
        } else {
            IngestResult::Failed { bytes_written }
        }
    }
}
