//! Update wire protocol: frame codecs and the chunk state machine.

pub mod frames;
pub mod machine;

pub use frames::{AckStatus, FirmwareAck, OtaAck, UpdateHeader, FIRMWARE_ACK_LEN, HEADER_LEN, OTA_ACK_LEN};
pub use machine::{IngestResult, ProtocolState, ProtocolStateMachine};
