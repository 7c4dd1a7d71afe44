//! Peer-side push routine.
//!
//! Mirrors the device server: answer the challenge, announce the image,
//! stream it chunk by chunk and wait for the final OtaAck.
//!
//! Every device read is answered with a FirmwareAck, so a chunk split by the
//! network can produce more acks than chunks. The client waits for one ack
//! per chunk and skips any surplus before the verdict. An OtaAck is told
//! apart from a FirmwareAck by its first four bytes, which is unambiguous as
//! long as `bytes_written` never encodes to the marker; `header_for` refuses
//! images that large.

use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info};

use crate::engine::auth::{respond, NONCE_LEN};
use crate::engine::error::{FrameError, TransportError};
use crate::engine::protocol::frames::FIRMWARE_ACK_MARKER;
use crate::engine::protocol::{FirmwareAck, OtaAck, UpdateHeader, FIRMWARE_ACK_LEN, OTA_ACK_LEN};

/// Largest image whose byte counts can never be mistaken for the ack marker
pub const MAX_IMAGE_LEN: usize = u32::from_le_bytes(FIRMWARE_ACK_MARKER) as usize - 1;

fn image_size(len: usize) -> Result<u32, TransportError> {
    if len > MAX_IMAGE_LEN {
        return Err(TransportError::ImageTooLarge(len));
    }
    u32::try_from(len).map_err(|_| TransportError::ImageTooLarge(len))
}

/// Header announcing `image`
pub fn header_for(image: &[u8]) -> Result<UpdateHeader, TransportError> {
    let size = image_size(image.len())?;
    Ok(UpdateHeader::new(size, Sha256::digest(image).into()))
}

/// Reply that followed a data chunk
enum ChunkReply {
    Ack,
    /// The device ended the update
    Finished(OtaAck),
}

/// Push `image` to a device and return its verdict.
///
/// The device only recognises a header received in a single read, so its
/// receive buffer must hold at least `HEADER_LEN` bytes.
pub async fn push_firmware<T>(
    stream: &mut T,
    secret: &[u8],
    image: &[u8],
    chunk_len: usize,
) -> Result<OtaAck, TransportError>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    if chunk_len == 0 {
        return Err(TransportError::InvalidRequest("chunk length must be non-zero"));
    }
    let header = header_for(image)?;

    let mut nonce = [0u8; NONCE_LEN];
    stream.read_exact(&mut nonce).await?;
    stream.write_all(&respond(secret, &nonce)).await?;
    debug!("Challenge answered");

    stream.write_all(&header.to_bytes()).await?;
    stream.flush().await?;
    if let ChunkReply::Finished(ack) = read_chunk_reply(stream).await? {
        return Ok(ack);
    }
    info!(
        size = header.firmware_size,
        digest = %hex::encode(header.expected_digest),
        "Pushing firmware"
    );

    for chunk in image.chunks(chunk_len) {
        stream.write_all(chunk).await?;
        stream.flush().await?;
        if let ChunkReply::Finished(ack) = read_chunk_reply(stream).await? {
            return Ok(ack);
        }
    }

    read_verdict(stream).await
}

/// Read the next device frame: a FirmwareAck, or the start of an OtaAck
async fn read_chunk_reply<T>(stream: &mut T) -> Result<ChunkReply, TransportError>
where
    T: AsyncRead + Unpin,
{
    let mut frame = [0u8; OTA_ACK_LEN];
    stream.read_exact(&mut frame[..FIRMWARE_ACK_LEN]).await?;
    match FirmwareAck::parse(&frame[..FIRMWARE_ACK_LEN]) {
        Ok(FirmwareAck) => Ok(ChunkReply::Ack),
        Err(FrameError::Marker(_)) => {
            stream.read_exact(&mut frame[FIRMWARE_ACK_LEN..]).await?;
            Ok(ChunkReply::Finished(OtaAck::parse(&frame)?))
        }
        Err(e) => Err(e.into()),
    }
}

/// Skip surplus FirmwareAcks until the OtaAck arrives
async fn read_verdict<T>(stream: &mut T) -> Result<OtaAck, TransportError>
where
    T: AsyncRead + Unpin,
{
    loop {
        if let ChunkReply::Finished(ack) = read_chunk_reply(stream).await? {
            info!(bytes_written = ack.bytes_written, status = ack.status.code(), "Device replied");
            return Ok(ack);
        }
        debug!("Skipping surplus chunk acknowledgement");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::protocol::{AckStatus, FirmwareAck};

    #[test]
    fn test_header_for() {
        let header = header_for(b"abc").unwrap();
        assert_eq!(header.firmware_size, 3);
        assert_eq!(
            hex::encode(header.expected_digest),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_image_size_limit() {
        assert_eq!(MAX_IMAGE_LEN as u32, 0xE71C_5FA2);
        assert!(image_size(MAX_IMAGE_LEN).is_ok());
        assert!(matches!(
            image_size(MAX_IMAGE_LEN + 1),
            Err(TransportError::ImageTooLarge(_))
        ));
    }

    #[tokio::test]
    async fn test_zero_chunk_len_rejected() {
        let (mut peer, _device) = tokio::io::duplex(64);
        let err = push_firmware(&mut peer, b"s", b"img", 0).await.unwrap_err();
        assert!(matches!(err, TransportError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_early_failure_ack_detected() {
        let (mut peer, mut device) = tokio::io::duplex(4096);
        let image = vec![1u8; 30];

        let device_task = tokio::spawn(async move {
            device.write_all(&[0u8; NONCE_LEN]).await.unwrap();
            let mut response = [0u8; 32];
            device.read_exact(&mut response).await.unwrap();

            let mut header = [0u8; 36];
            device.read_exact(&mut header).await.unwrap();
            device.write_all(&FirmwareAck.to_bytes()).await.unwrap();

            // First chunk fails on the device side
            let mut chunk = [0u8; 10];
            device.read_exact(&mut chunk).await.unwrap();
            device.write_all(&FirmwareAck.to_bytes()).await.unwrap();
            let failed = OtaAck {
                bytes_written: 10,
                status: AckStatus::Failure,
            };
            device.write_all(&failed.to_bytes()).await.unwrap();

            // Second chunk is ignored by the reset state machine
            device.read_exact(&mut chunk).await.unwrap();
            device.write_all(&FirmwareAck.to_bytes()).await.unwrap();
            device
        });

        let ack = push_firmware(&mut peer, b"secret", &image, 10).await.unwrap();
        assert_eq!(ack.bytes_written, 10);
        assert!(!ack.is_success());
        drop(device_task.await.unwrap());
    }

    #[tokio::test]
    async fn test_split_chunk_acks_are_skipped() {
        let (mut peer, mut device) = tokio::io::duplex(4096);
        let image = vec![7u8; 10];

        let device_task = tokio::spawn(async move {
            device.write_all(&[0u8; NONCE_LEN]).await.unwrap();
            let mut response = [0u8; 32];
            device.read_exact(&mut response).await.unwrap();

            let mut header = [0u8; 36];
            device.read_exact(&mut header).await.unwrap();
            device.write_all(&FirmwareAck.to_bytes()).await.unwrap();

            // The single chunk arrives in two reads
            let mut half = [0u8; 5];
            for _ in 0..2 {
                device.read_exact(&mut half).await.unwrap();
                device.write_all(&FirmwareAck.to_bytes()).await.unwrap();
            }
            let done = OtaAck {
                bytes_written: 10,
                status: AckStatus::Success,
            };
            device.write_all(&done.to_bytes()).await.unwrap();
            device
        });

        let ack = push_firmware(&mut peer, b"secret", &image, 10).await.unwrap();
        assert!(ack.is_success());
        assert_eq!(ack.bytes_written, 10);
        drop(device_task.await.unwrap());
    }
}
