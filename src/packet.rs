use crate::error::MqttError;
use bytes::{BufMut, BytesMut};

/// Largest value the four-byte remaining length can carry (2^28 - 1).
pub const MAX_REMAINING_LENGTH: usize = 128 * 128 * 128 * 128 - 1;

/// Appends `len` as an MQTT variable byte integer, always in its shortest form.
pub fn encode_remaining_length(len: usize, out: &mut BytesMut) -> Result<(), MqttError> {
    if len > MAX_REMAINING_LENGTH {
        return Err(MqttError::IllegalLength(len));
    }

    let mut len = len;
    loop {
        let mut byte = (len & 0x7F) as u8;
        len >>= 7;
        if len > 0 {
            byte |= 0x80;
        }
        out.put_u8(byte);
        if len == 0 {
            break;
        }
    }
    Ok(())
}

/// Decodes a variable byte integer starting at `offset`.
///
/// Returns the value and the number of bytes it occupied. Running out of
/// input yields `IncompletePacket`; four bytes that all carry the
/// continuation bit yield `MalformedRemainingLength`.
pub fn decode_remaining_length(data: &[u8], offset: usize) -> Result<(u32, usize), MqttError> {
    let mut remaining_length = 0u32;
    let mut multiplier = 1u32;

    for i in 0..4 {
        let byte = match data.get(offset + i) {
            Some(byte) => *byte,
            None => return Err(MqttError::IncompletePacket),
        };
        remaining_length += ((byte & 0x7F) as u32) * multiplier;
        if byte & 0x80 == 0 {
            return Ok((remaining_length, i + 1));
        }
        multiplier *= 128;
    }

    Err(MqttError::MalformedRemainingLength)
}

/// Rejects text MQTT forbids in UTF-8 encoded strings.
///
/// `&str` already guarantees well-formed UTF-8 without surrogate code
/// points, so only the embedded NUL remains to be checked here.
pub fn check_string_encoding(value: &str) -> Result<(), MqttError> {
    if value.contains('\u{0}') {
        return Err(MqttError::InvalidEncoding(
            "Invalid character, all payload strings must be valid UTF-8 strings".to_string(),
        ));
    }
    Ok(())
}

/// Appends a two-byte big-endian length followed by the raw bytes.
pub fn encode_bytes(value: &[u8], out: &mut BytesMut) -> Result<(), MqttError> {
    if value.len() > u16::MAX as usize {
        return Err(MqttError::InvalidEncoding(format!(
            "field of {} bytes exceeds the 65535 byte limit",
            value.len()
        )));
    }
    out.put_u16(value.len() as u16);
    out.put_slice(value);
    Ok(())
}

/// Appends a length-prefixed UTF-8 string after validating its content.
pub fn encode_string(value: &str, out: &mut BytesMut) -> Result<(), MqttError> {
    check_string_encoding(value)?;
    encode_bytes(value.as_bytes(), out)
}

/// Reads a length-prefixed UTF-8 string at `offset`, advancing it past the string.
pub fn parse_mqtt_string(data: &[u8], offset: &mut usize) -> Result<String, MqttError> {
    if *offset + 2 > data.len() {
        return Err(MqttError::Protocol("Invalid string length".to_string()));
    }
    let len = ((data[*offset] as usize) << 8) | (data[*offset + 1] as usize);
    *offset += 2;
    if *offset + len > data.len() {
        return Err(MqttError::Protocol("Invalid string data".to_string()));
    }
    let s = std::str::from_utf8(&data[*offset..*offset + len])
        .map_err(|_| {
            MqttError::InvalidEncoding(
                "Invalid encoding, all payload strings must be valid UTF-8 strings".to_string(),
            )
        })?
        .to_string();
    check_string_encoding(&s)?;
    *offset += len;
    Ok(s)
}

/// Reads a big-endian packet identifier at `offset`.
pub fn parse_packet_id(data: &[u8], offset: usize) -> Result<u16, MqttError> {
    match data.get(offset..offset + 2) {
        Some(id) => Ok(u16::from_be_bytes([id[0], id[1]])),
        None => Err(MqttError::Protocol("Missing packet identifier".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(len: usize) -> Vec<u8> {
        let mut out = BytesMut::new();
        encode_remaining_length(len, &mut out).unwrap();
        out.to_vec()
    }

    #[test]
    fn remaining_length_uses_minimal_bytes() {
        assert_eq!(encoded(0), vec![0x00]);
        assert_eq!(encoded(127), vec![0x7F]);
        assert_eq!(encoded(128), vec![0x80, 0x01]);
        assert_eq!(encoded(16_383), vec![0xFF, 0x7F]);
        assert_eq!(encoded(16_384), vec![0x80, 0x80, 0x01]);
        assert_eq!(encoded(2_097_151), vec![0xFF, 0xFF, 0x7F]);
        assert_eq!(encoded(2_097_152), vec![0x80, 0x80, 0x80, 0x01]);
        assert_eq!(encoded(MAX_REMAINING_LENGTH), vec![0xFF, 0xFF, 0xFF, 0x7F]);
    }

    #[test]
    fn remaining_length_round_trips_across_range() {
        let mut n = 0usize;
        while n <= MAX_REMAINING_LENGTH {
            let bytes = encoded(n);
            let expected_len = match n {
                0..=127 => 1,
                128..=16_383 => 2,
                16_384..=2_097_151 => 3,
                _ => 4,
            };
            assert_eq!(bytes.len(), expected_len, "value {}", n);
            assert_eq!(decode_remaining_length(&bytes, 0).unwrap(), (n as u32, expected_len));
            n = n * 3 + 1;
        }
    }

    #[test]
    fn remaining_length_rejects_oversized_values() {
        let mut out = BytesMut::new();
        assert!(matches!(
            encode_remaining_length(MAX_REMAINING_LENGTH + 1, &mut out),
            Err(MqttError::IllegalLength(_))
        ));
        assert!(out.is_empty());
    }

    #[test]
    fn decode_distinguishes_incomplete_from_malformed() {
        assert!(matches!(
            decode_remaining_length(&[0x30, 0x80, 0x80], 1),
            Err(MqttError::IncompletePacket)
        ));
        assert!(matches!(
            decode_remaining_length(&[0x30, 0xFF, 0xFF, 0xFF, 0xFF, 0x01], 1),
            Err(MqttError::MalformedRemainingLength)
        ));
        assert_eq!(decode_remaining_length(&[0x30, 0xC1, 0x02], 1).unwrap(), (321, 2));
    }

    #[test]
    fn strings_are_length_prefixed_and_validated() {
        let mut out = BytesMut::new();
        encode_string("MQTT", &mut out).unwrap();
        assert_eq!(&out[..], &[0x00, 0x04, b'M', b'Q', b'T', b'T']);

        let mut offset = 0;
        assert_eq!(parse_mqtt_string(&out, &mut offset).unwrap(), "MQTT");
        assert_eq!(offset, 6);

        assert!(matches!(
            encode_string("a\u{0}b", &mut BytesMut::new()),
            Err(MqttError::InvalidEncoding(_))
        ));
    }

    #[test]
    fn parse_rejects_invalid_utf8_and_surrogates() {
        // 0xED 0xA0 0x80 is the CESU-style encoding of U+D800
        let surrogate = [0x00, 0x03, 0xED, 0xA0, 0x80];
        assert!(matches!(
            parse_mqtt_string(&surrogate, &mut 0),
            Err(MqttError::InvalidEncoding(_))
        ));
        let nul = [0x00, 0x01, 0x00];
        assert!(matches!(parse_mqtt_string(&nul, &mut 0), Err(MqttError::InvalidEncoding(_))));
        let short = [0x00, 0x05, b'a'];
        assert!(matches!(parse_mqtt_string(&short, &mut 0), Err(MqttError::Protocol(_))));
    }

    #[test]
    fn bytes_skip_text_validation() {
        let mut out = BytesMut::new();
        encode_bytes(&[0x00, 0xFF], &mut out).unwrap();
        assert_eq!(&out[..], &[0x00, 0x02, 0x00, 0xFF]);
    }
}
