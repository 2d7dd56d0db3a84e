//! Protocol Module
//!
//! Wire messages of the appointment exchange and their framing. A frame is a
//! 4-byte little-endian length followed by that many bytes of JSON; byte
//! fields are hex encoded inside the JSON.

use serde::{Deserialize, Serialize};

use crate::encryption::SealedPayload;
use crate::error::{HealthPkiError, Result};

const LENGTH_PREFIX_SIZE: usize = 4;

/// Patient → clinician: the sealed appointment request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppointmentEnvelope {
    /// Session key encrypted to the clinician with RSA-OAEP.
    #[serde(with = "hex")]
    pub wrapped_session_key: Vec<u8>,
    pub sealed: SealedPayload,
    /// Patient's signature over the plaintext request.
    #[serde(with = "hex")]
    pub signature: Vec<u8>,
    /// Patient's certificate, PEM.
    pub sender_certificate: String,
}

/// Clinician → patient: the sealed appointment identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmationEnvelope {
    pub sealed: SealedPayload,
    /// Clinician's signature over the plaintext identifier.
    #[serde(with = "hex")]
    pub signature: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    AppointmentRequest(AppointmentEnvelope),
    AppointmentConfirmation(ConfirmationEnvelope),
}

/// Serialize a Message to a length-prefixed frame
///
/// # Example
/// ```no_run
/// use health_center_pki::protocol::{decode_message, encode_message, Message};
/// # fn example(message: Message) -> health_center_pki::error::Result<()> {
/// let frame = encode_message(&message)?;
/// // frame = [4-byte length] + [JSON data]
/// assert_eq!(decode_message(&frame)?, message);
/// # Ok(())
/// # }
/// ```
pub fn encode_message(message: &Message) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(message)?;
    let length = u32::try_from(json.len())
        .map_err(|_| HealthPkiError::InvalidRequest("message too large to frame".to_string()))?;

    let mut buffer = Vec::with_capacity(LENGTH_PREFIX_SIZE + json.len());
    buffer.extend_from_slice(&length.to_le_bytes());
    buffer.extend_from_slice(&json);
    Ok(buffer)
}

/// Deserialize one length-prefixed frame
///
/// # Errors
/// `InvalidRequest` if the frame is truncated or carries trailing bytes.
pub fn decode_message(frame: &[u8]) -> Result<Message> {
    if frame.len() < LENGTH_PREFIX_SIZE {
        return Err(HealthPkiError::InvalidRequest(
            "frame too short to contain length prefix".to_string(),
        ));
    }
    let (prefix, body) = frame.split_at(LENGTH_PREFIX_SIZE);
    let mut length = [0u8; LENGTH_PREFIX_SIZE];
    length.copy_from_slice(prefix);
    let length = u32::from_le_bytes(length) as usize;

    if body.len() != length {
        return Err(HealthPkiError::InvalidRequest(format!(
            "frame declares {} bytes but carries {}",
            length,
            body.len()
        )));
    }
    Ok(serde_json::from_slice(body)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn confirmation() -> Message {
        Message::AppointmentConfirmation(ConfirmationEnvelope {
            sealed: SealedPayload {
                nonce: vec![1; 12],
                tag: vec![2; 16],
                ciphertext: vec![3, 4, 5],
            },
            signature: vec![0xde, 0xad],
        })
    }

    #[test]
    fn test_encode_message() {
        let bytes = encode_message(&confirmation()).unwrap();
        let length = u32::from_le_bytes(bytes[..4].try_into().unwrap());
        assert!(length > 0);
        assert_eq!(bytes.len(), (length + 4) as usize);

        let json: serde_json::Value = serde_json::from_slice(&bytes[4..]).unwrap();
        assert_eq!(json["type"], "AppointmentConfirmation");
        assert_eq!(json["signature"], "dead");
    }

    #[test]
    fn test_decode_message() {
        let bytes = encode_message(&confirmation()).unwrap();
        assert_eq!(decode_message(&bytes).unwrap(), confirmation());
    }

    #[test]
    fn test_decode_rejects_bad_frames() {
        let bytes = encode_message(&confirmation()).unwrap();
        assert!(matches!(
            decode_message(&bytes[..bytes.len() - 1]),
            Err(HealthPkiError::InvalidRequest(_))
        ));
        assert!(matches!(
            decode_message(&bytes[..2]),
            Err(HealthPkiError::InvalidRequest(_))
        ));

        let garbage = b"nope";
        let mut frame = (garbage.len() as u32).to_le_bytes().to_vec();
        frame.extend_from_slice(garbage);
        assert!(matches!(
            decode_message(&frame),
            Err(HealthPkiError::Serialization(_))
        ));
    }
}
