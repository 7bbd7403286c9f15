use crate::error::MqttError;
use crate::options::Will;
use crate::packet::{
    encode_bytes, encode_remaining_length, encode_string, parse_mqtt_string, parse_packet_id,
};
use crate::protocol::{ControlPacketType, ProtocolVersion, QoS};
use bytes::{BufMut, Bytes, BytesMut};

/// CONNECT request, built by [`ProtocolVersion::connect`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    pub client_id: String,
    pub clean_session: bool,
    pub keep_alive: u16,
    pub will: Option<Will>,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Connect {
    fn flags(&self) -> u8 {
        let mut flags = 0u8;
        if self.clean_session {
            flags |= 0x02;
        }
        if let Some(will) = &self.will {
            flags |= 0x04;
            flags |= (will.qos as u8) << 3;
            if will.retain {
                flags |= 0x20;
            }
        }
        if self.username.is_some() {
            flags |= 0x80;
            if self.password.is_some() {
                flags |= 0x40;
            }
        }
        flags
    }

    fn serialize_body(&self, body: &mut BytesMut) -> Result<(), MqttError> {
        encode_string(ProtocolVersion::PROTOCOL_NAME, body)?;
        body.put_u8(ProtocolVersion::PROTOCOL_LEVEL);
        body.put_u8(self.flags());
        body.put_u16(self.keep_alive);
        encode_string(&self.client_id, body)?;
        if let Some(will) = &self.will {
            encode_string(&will.topic, body)?;
            encode_string(&will.message, body)?;
        }
        if let Some(username) = &self.username {
            encode_string(username, body)?;
            if let Some(password) = &self.password {
                encode_bytes(password.as_bytes(), body)?;
            }
        }
        Ok(())
    }
}

/// CONNACK answer to a CONNECT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectAck {
    pub session_present: bool,
    pub status_code: u8,
}

impl ConnectAck {
    pub const CONNECTION_SUCCESS: u8 = 0;
    pub const UNACCEPTABLE_PROTOCOL_VERSION: u8 = 1;
    pub const IDENTIFIER_REJECTED: u8 = 2;
    pub const SERVER_UNAVAILABLE: u8 = 3;
    pub const BAD_CREDENTIALS: u8 = 4;
    pub const NOT_AUTHORIZED: u8 = 5;

    pub fn parse(raw: &[u8]) -> Result<ConnectAck, MqttError> {
        if raw.len() < 4 {
            return Err(MqttError::Protocol("CONNACK too short".to_string()));
        }
        Ok(ConnectAck {
            session_present: raw[2] & 0x01 != 0,
            status_code: raw[3],
        })
    }

    pub fn connected(&self) -> bool {
        self.status_code == Self::CONNECTION_SUCCESS
    }

    pub fn reason(&self) -> &'static str {
        match self.status_code {
            Self::CONNECTION_SUCCESS => "",
            Self::UNACCEPTABLE_PROTOCOL_VERSION => "Unacceptable protocol version",
            Self::IDENTIFIER_REJECTED => "Identifier rejected",
            Self::SERVER_UNAVAILABLE => "The server is currently unavailable",
            Self::BAD_CREDENTIALS => "Bad credentials, authentication failed",
            Self::NOT_AUTHORIZED => "Authentication failed",
            _ => "Unknown error",
        }
    }
}

/// PUBLISH in either direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub topic: String,
    /// Present only when `qos` is above `AtMostOnce`.
    pub packet_id: Option<u16>,
    pub qos: QoS,
    pub dup: bool,
    pub retain: bool,
    pub payload: Bytes,
}

impl Publish {
    fn flags(&self) -> u8 {
        ((self.dup as u8) << 3) | ((self.qos as u8) << 1) | self.retain as u8
    }

    /// Parses a complete raw PUBLISH whose fixed header is `header_len` bytes.
    pub fn parse(raw: &[u8], header_len: usize) -> Result<Publish, MqttError> {
        let flags = raw
            .first()
            .map(|b| b & 0x0F)
            .ok_or(MqttError::IncompletePacket)?;
        let qos = QoS::try_from((flags >> 1) & 0x03)?;

        let mut offset = header_len;
        let topic = parse_mqtt_string(raw, &mut offset)?;
        let packet_id = match qos {
            QoS::AtMostOnce => None,
            _ => {
                let id = parse_packet_id(raw, offset)?;
                offset += 2;
                Some(id)
            }
        };

        Ok(Publish {
            topic,
            packet_id,
            qos,
            dup: flags & 0x08 != 0,
            retain: flags & 0x01 != 0,
            payload: Bytes::copy_from_slice(&raw[offset..]),
        })
    }

    fn serialize_body(&self, body: &mut BytesMut) -> Result<(), MqttError> {
        encode_string(&self.topic, body)?;
        if self.qos != QoS::AtMostOnce {
            let packet_id = self
                .packet_id
                .ok_or_else(|| MqttError::Protocol("Missing packet ID in PUBLISH packet".to_string()))?;
            body.put_u16(packet_id);
        }
        body.put_slice(&self.payload);
        Ok(())
    }
}

/// SUBSCRIBE to a single topic filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe {
    pub packet_id: u16,
    pub topic: String,
    pub qos: QoS,
}

/// SUBACK for a single topic filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscribeAck {
    pub packet_id: u16,
    pub return_code: u8,
}

impl SubscribeAck {
    pub const FAILURE: u8 = 0x80;

    pub fn parse(raw: &[u8], header_len: usize) -> Result<SubscribeAck, MqttError> {
        let packet_id = parse_packet_id(raw, header_len)?;
        let return_code = *raw
            .get(header_len + 2)
            .ok_or_else(|| MqttError::Protocol("Missing return code in SUBACK packet".to_string()))?;
        Ok(SubscribeAck {
            packet_id,
            return_code,
        })
    }

    /// The QoS granted by the server, `None` when the subscription failed.
    pub fn granted_qos(&self) -> Option<QoS> {
        QoS::try_from(self.return_code).ok()
    }
}

/// UNSUBSCRIBE from a single topic filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsubscribe {
    pub packet_id: u16,
    pub topic: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlPacket {
    Connect(Connect),
    ConnectAck(ConnectAck),
    Publish(Publish),
    PublishAck { packet_id: u16 },
    PublishReceived { packet_id: u16 },
    PublishRelease { packet_id: u16 },
    PublishComplete { packet_id: u16 },
    Subscribe(Subscribe),
    SubscribeAck(SubscribeAck),
    Unsubscribe(Unsubscribe),
    UnsubscribeAck { packet_id: u16 },
    PingRequest,
    PingResponse,
    Disconnect,
}

impl ControlPacket {
    pub fn kind(&self) -> ControlPacketType {
        match self {
            ControlPacket::Connect(_) => ControlPacketType::Connect,
            ControlPacket::ConnectAck(_) => ControlPacketType::Connack,
            ControlPacket::Publish(_) => ControlPacketType::Publish,
            ControlPacket::PublishAck { .. } => ControlPacketType::Puback,
            ControlPacket::PublishReceived { .. } => ControlPacketType::Pubrec,
            ControlPacket::PublishRelease { .. } => ControlPacketType::Pubrel,
            ControlPacket::PublishComplete { .. } => ControlPacketType::Pubcomp,
            ControlPacket::Subscribe(_) => ControlPacketType::Subscribe,
            ControlPacket::SubscribeAck(_) => ControlPacketType::Suback,
            ControlPacket::Unsubscribe(_) => ControlPacketType::Unsubscribe,
            ControlPacket::UnsubscribeAck { .. } => ControlPacketType::Unsuback,
            ControlPacket::PingRequest => ControlPacketType::Pingreq,
            ControlPacket::PingResponse => ControlPacketType::Pingresp,
            ControlPacket::Disconnect => ControlPacketType::Disconnect,
        }
    }

    /// First byte of the fixed header: type nibble plus flag bits.
    pub fn packet_type(&self) -> u8 {
        let header = self.kind().header();
        match self {
            ControlPacket::Publish(publish) => header | publish.flags(),
            ControlPacket::PublishRelease { .. }
            | ControlPacket::Subscribe(_)
            | ControlPacket::Unsubscribe(_) => header | 0x02,
            _ => header,
        }
    }

    /// Packet identifier, for the kinds that carry one.
    pub fn packet_id(&self) -> Option<u16> {
        match self {
            ControlPacket::Publish(publish) => publish.packet_id,
            ControlPacket::PublishAck { packet_id }
            | ControlPacket::PublishReceived { packet_id }
            | ControlPacket::PublishRelease { packet_id }
            | ControlPacket::PublishComplete { packet_id }
            | ControlPacket::UnsubscribeAck { packet_id } => Some(*packet_id),
            ControlPacket::Subscribe(subscribe) => Some(subscribe.packet_id),
            ControlPacket::SubscribeAck(ack) => Some(ack.packet_id),
            ControlPacket::Unsubscribe(unsubscribe) => Some(unsubscribe.packet_id),
            _ => None,
        }
    }

    /// Variable header and payload, everything after the fixed header.
    pub fn serialize_body(&self) -> Result<BytesMut, MqttError> {
        let mut body = BytesMut::new();
        match self {
            ControlPacket::Connect(connect) => connect.serialize_body(&mut body)?,
            ControlPacket::ConnectAck(ack) => {
                body.put_u8(ack.session_present as u8);
                body.put_u8(ack.status_code);
            }
            ControlPacket::Publish(publish) => publish.serialize_body(&mut body)?,
            ControlPacket::PublishAck { packet_id }
            | ControlPacket::PublishReceived { packet_id }
            | ControlPacket::PublishRelease { packet_id }
            | ControlPacket::PublishComplete { packet_id }
            | ControlPacket::UnsubscribeAck { packet_id } => body.put_u16(*packet_id),
            ControlPacket::Subscribe(subscribe) => {
                body.put_u16(subscribe.packet_id);
                encode_string(&subscribe.topic, &mut body)?;
                body.put_u8(subscribe.qos as u8);
            }
            ControlPacket::SubscribeAck(ack) => {
                body.put_u16(ack.packet_id);
                body.put_u8(ack.return_code);
            }
            ControlPacket::Unsubscribe(unsubscribe) => {
                body.put_u16(unsubscribe.packet_id);
                encode_string(&unsubscribe.topic, &mut body)?;
            }
            ControlPacket::PingRequest | ControlPacket::PingResponse | ControlPacket::Disconnect => {}
        }
        Ok(body)
    }

    /// Complete wire form: type byte, remaining length, body.
    pub fn build_packet(&self) -> Result<Bytes, MqttError> {
        let body = self.serialize_body()?;
        let mut packet = BytesMut::with_capacity(body.len() + 5);
        packet.put_u8(self.packet_type());
        encode_remaining_length(body.len(), &mut packet)?;
        packet.extend_from_slice(&body);
        Ok(packet.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::decode_packet;

    fn reparse(packet: &ControlPacket) -> ControlPacket {
        let bytes = packet.build_packet().unwrap();
        let (_, len_bytes) = crate::packet::decode_remaining_length(&bytes, 1).unwrap();
        decode_packet(&bytes, 1 + len_bytes).unwrap()
    }

    #[test]
    fn publish_qos0_round_trip() {
        let packet = ControlPacket::Publish(Publish {
            topic: "t".to_string(),
            packet_id: None,
            qos: QoS::AtMostOnce,
            dup: false,
            retain: false,
            payload: Bytes::from_static(b"hello"),
        });
        let bytes = packet.build_packet().unwrap();
        assert_eq!(&bytes[..], &[0x30, 0x08, 0x00, 0x01, b't', b'h', b'e', b'l', b'l', b'o']);

        match reparse(&packet) {
            ControlPacket::Publish(publish) => {
                assert_eq!(publish.topic, "t");
                assert_eq!(publish.qos, QoS::AtMostOnce);
                assert_eq!(publish.packet_id, None);
                assert_eq!(&publish.payload[..], b"hello");
            }
            other => panic!("unexpected packet {:?}", other),
        }
    }

    #[test]
    fn publish_flags_and_packet_id_survive_a_long_payload() {
        let packet = ControlPacket::Publish(Publish {
            topic: "sensors/temp".to_string(),
            packet_id: Some(0xBEEF),
            qos: QoS::ExactlyOnce,
            dup: true,
            retain: true,
            payload: Bytes::from(vec![7u8; 300]),
        });
        assert_eq!(packet.packet_type(), 0x3D);
        assert_eq!(reparse(&packet), packet);
    }

    #[test]
    fn publish_above_qos0_requires_a_packet_id() {
        let packet = ControlPacket::Publish(Publish {
            topic: "t".to_string(),
            packet_id: None,
            qos: QoS::AtLeastOnce,
            dup: false,
            retain: false,
            payload: Bytes::new(),
        });
        assert!(matches!(packet.build_packet(), Err(MqttError::Protocol(_))));
        assert!(matches!(
            Publish::parse(&[0x32, 0x03, 0x00, 0x01, b't'], 2),
            Err(MqttError::Protocol(_))
        ));
    }

    #[test]
    fn subscribe_and_unsubscribe_set_reserved_bits() {
        let subscribe = ControlPacket::Subscribe(Subscribe {
            packet_id: 10,
            topic: "a/b".to_string(),
            qos: QoS::AtLeastOnce,
        });
        assert_eq!(
            &subscribe.build_packet().unwrap()[..],
            &[0x82, 0x08, 0x00, 0x0A, 0x00, 0x03, b'a', b'/', b'b', 0x01]
        );

        let unsubscribe = ControlPacket::Unsubscribe(Unsubscribe {
            packet_id: 11,
            topic: "a/b".to_string(),
        });
        assert_eq!(
            &unsubscribe.build_packet().unwrap()[..],
            &[0xA2, 0x07, 0x00, 0x0B, 0x00, 0x03, b'a', b'/', b'b']
        );
    }

    #[test]
    fn fixed_size_packets() {
        let cases = [
            (ControlPacket::PublishRelease { packet_id: 0x0102 }, vec![0x62, 0x02, 0x01, 0x02]),
            (ControlPacket::PublishAck { packet_id: 3 }, vec![0x40, 0x02, 0x00, 0x03]),
            (ControlPacket::PublishReceived { packet_id: 4 }, vec![0x50, 0x02, 0x00, 0x04]),
            (ControlPacket::PublishComplete { packet_id: 5 }, vec![0x70, 0x02, 0x00, 0x05]),
            (ControlPacket::PingRequest, vec![0xC0, 0x00]),
            (ControlPacket::PingResponse, vec![0xD0, 0x00]),
            (ControlPacket::Disconnect, vec![0xE0, 0x00]),
        ];
        for (packet, expected) in cases {
            assert_eq!(packet.build_packet().unwrap().to_vec(), expected, "{:?}", packet.kind());
        }
    }

    #[test]
    fn connect_ack_status_codes() {
        let ack = ConnectAck::parse(&[0x20, 0x02, 0x01, 0x00]).unwrap();
        assert!(ack.connected());
        assert!(ack.session_present);
        assert_eq!(ack.reason(), "");

        let reasons = [
            (1, "Unacceptable protocol version"),
            (2, "Identifier rejected"),
            (3, "The server is currently unavailable"),
            (4, "Bad credentials, authentication failed"),
            (5, "Authentication failed"),
            (6, "Unknown error"),
            (0xFF, "Unknown error"),
        ];
        for (code, reason) in reasons {
            let ack = ConnectAck::parse(&[0x20, 0x02, 0x00, code]).unwrap();
            assert!(!ack.connected());
            assert_eq!(ack.status_code, code);
            assert_eq!(ack.reason(), reason);
        }

        assert!(ConnectAck::parse(&[0x20, 0x01, 0x00]).is_err());
    }

    #[test]
    fn subscribe_ack_reads_first_return_code() {
        let ack = SubscribeAck::parse(&[0x90, 0x04, 0x00, 0x2A, 0x01, 0x02], 2).unwrap();
        assert_eq!(ack.packet_id, 42);
        assert_eq!(ack.granted_qos(), Some(QoS::AtLeastOnce));

        let refused = SubscribeAck::parse(&[0x90, 0x03, 0x00, 0x2A, 0x80], 2).unwrap();
        assert_eq!(refused.granted_qos(), None);
    }
}
