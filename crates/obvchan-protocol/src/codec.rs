use bytes::{Buf, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::WireError;
use crate::messages::ChannelMessage;

/// Maximum frame size: 1 MiB.
pub const MAX_FRAME_SIZE: u32 = 1_048_576;

/// Encode the plaintext of an envelope (no length prefix).
pub fn encode_channel_message(msg: &ChannelMessage) -> Result<Vec<u8>, WireError> {
    Ok(postcard::to_allocvec(msg)?)
}

/// Decode the plaintext of an envelope (no length prefix).
pub fn decode_channel_message(payload: &[u8]) -> Result<ChannelMessage, WireError> {
    Ok(postcard::from_bytes(payload)?)
}

/// Encode any serializable value into a length-prefixed frame.
pub fn encode_frame<T: Serialize>(msg: &T) -> Result<Vec<u8>, WireError> {
    let payload = postcard::to_allocvec(msg)?;
    if payload.len() > MAX_FRAME_SIZE as usize {
        return Err(WireError::MessageTooLarge(payload.len()));
    }
    let mut buf = Vec::with_capacity(4 + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Decode a frame payload (without its length prefix).
pub fn decode_frame_payload<T: DeserializeOwned>(payload: &[u8]) -> Result<T, WireError> {
    Ok(postcard::from_bytes(payload)?)
}

/// Attempt to extract one complete length-prefixed frame from a byte buffer.
///
/// Returns `Ok(Some(payload))` if a complete frame is available,
/// `Ok(None)` if more data is needed, or `Err` if the frame is too large.
///
/// Advances the buffer past the consumed frame.
pub fn try_decode_frame(buf: &mut BytesMut) -> Result<Option<Vec<u8>>, WireError> {
    if buf.len() < 4 {
        return Ok(None);
    }

    let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

    if length > MAX_FRAME_SIZE as usize {
        return Err(WireError::MessageTooLarge(length));
    }

    if buf.len() < 4 + length {
        return Ok(None);
    }

    buf.advance(4);
    let payload = buf.split_to(length).to_vec();
    Ok(Some(payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{Envelope, ProtocolMessage};
    use crate::types::{InstanceId, ProtocolKind, Uid, UID_LEN};

    fn envelope(tag: u8) -> Envelope {
        Envelope {
            to_device: Uid([tag; UID_LEN]),
            wrapped_key: vec![tag; 40],
            encrypted_content: vec![tag; 10],
            upload_timestamp: 1,
            download_timestamp: 2,
            known_attachment_count: 0,
            has_extended_payload: false,
        }
    }

    #[test]
    fn channel_message_roundtrip() {
        let instance_id = InstanceId::random();
        let msg = ChannelMessage::Protocol(ProtocolMessage {
            protocol: ProtocolKind::ChannelCreationWithContactDevice,
            instance_id,
            body: vec![1, 2, 3],
        });
        let bytes = encode_channel_message(&msg).unwrap();
        match decode_channel_message(&bytes).unwrap() {
            ChannelMessage::Protocol(p) => {
                assert_eq!(p.instance_id, instance_id);
                assert_eq!(p.body, vec![1, 2, 3]);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn garbage_does_not_decode() {
        assert!(decode_channel_message(&[0xff, 0xff, 0xff]).is_err());
    }

    #[test]
    fn frame_decoding() {
        let encoded = encode_frame(&envelope(7)).unwrap();
        let mut buf = BytesMut::new();

        // Partial data, should return None
        buf.extend_from_slice(&encoded[..3]);
        assert!(try_decode_frame(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&encoded[3..]);
        let payload = try_decode_frame(&mut buf).unwrap().unwrap();
        let decoded: Envelope = decode_frame_payload(&payload).unwrap();
        assert_eq!(decoded, envelope(7));
        assert!(buf.is_empty());
    }

    #[test]
    fn frame_multiple_messages() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encode_frame(&envelope(1)).unwrap());
        buf.extend_from_slice(&encode_frame(&envelope(2)).unwrap());

        let first: Envelope =
            decode_frame_payload(&try_decode_frame(&mut buf).unwrap().unwrap()).unwrap();
        let second: Envelope =
            decode_frame_payload(&try_decode_frame(&mut buf).unwrap().unwrap()).unwrap();
        assert_eq!(first.to_device, Uid([1; UID_LEN]));
        assert_eq!(second.to_device, Uid([2; UID_LEN]));
        assert!(buf.is_empty());
    }

    #[test]
    fn frame_too_large() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&(MAX_FRAME_SIZE + 1).to_be_bytes());
        buf.extend_from_slice(&[0u8; 16]);
        assert!(matches!(
            try_decode_frame(&mut buf),
            Err(WireError::MessageTooLarge(_))
        ));
    }

    #[test]
    fn frame_partial_length() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0, 0]);
        assert!(try_decode_frame(&mut buf).unwrap().is_none());
    }
}
