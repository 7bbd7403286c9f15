use crate::control::{
    Connect, ConnectAck, ControlPacket, Publish, Subscribe, SubscribeAck, Unsubscribe,
};
use crate::error::MqttError;
use crate::options::ConnectionOptions;
use crate::packet::parse_packet_id;
use bytes::Bytes;
use rand::distributions::Alphanumeric;
use rand::Rng;

/// Control packet types, as found in the high nibble of the first byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ControlPacketType {
    Connect = 1,
    Connack = 2,
    Publish = 3,
    Puback = 4,
    Pubrec = 5,
    Pubrel = 6,
    Pubcomp = 7,
    Subscribe = 8,
    Suback = 9,
    Unsubscribe = 10,
    Unsuback = 11,
    Pingreq = 12,
    Pingresp = 13,
    Disconnect = 14,
}

impl ControlPacketType {
    /// The type nibble shifted into place, without any flag bits.
    pub const fn header(self) -> u8 {
        (self as u8) << 4
    }
}

/// Delivery guarantee of a PUBLISH or requested for a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
#[repr(u8)]
pub enum QoS {
    #[default]
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl TryFrom<u8> for QoS {
    type Error = MqttError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(MqttError::Protocol(format!("Invalid QoS level {}", other))),
        }
    }
}

/// Produces client identifiers for connections that do not supply one.
pub trait ClientIdGenerator: Send + Sync {
    fn generate_id(&mut self) -> String;
}

/// Generates identifiers every compliant server must accept: 1 to 23
/// characters from `0-9a-zA-Z`.
#[derive(Debug, Default, Clone)]
pub struct StrictClientIdGenerator;

impl ClientIdGenerator for StrictClientIdGenerator {
    fn generate_id(&mut self) -> String {
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(17)
            .map(char::from)
            .collect();
        format!("rustie{}", suffix)
    }
}

/// Configurable generator: a prefix padded with random characters drawn from
/// `character_set` up to `length` characters.
#[derive(Debug, Clone)]
pub struct RandomClientIdGenerator {
    prefix: String,
    length: usize,
    character_set: Vec<char>,
}

impl Default for RandomClientIdGenerator {
    fn default() -> Self {
        RandomClientIdGenerator {
            prefix: String::new(),
            length: 20,
            character_set: ('a'..='z').chain('A'..='Z').chain('0'..='9').collect(),
        }
    }
}

impl RandomClientIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_length(mut self, length: usize) -> Self {
        self.length = length;
        self
    }

    /// Replaces the allowed characters. An empty set keeps the previous one.
    pub fn with_character_set(mut self, characters: &str) -> Self {
        let set: Vec<char> = characters.chars().collect();
        if !set.is_empty() {
            self.character_set = set;
        }
        self
    }
}

impl ClientIdGenerator for RandomClientIdGenerator {
    fn generate_id(&mut self) -> String {
        let mut rng = rand::thread_rng();
        let mut id: String = self.prefix.chars().take(self.length).collect();
        let missing = self.length.saturating_sub(id.chars().count());
        for _ in 0..missing {
            id.push(self.character_set[rng.gen_range(0..self.character_set.len())]);
        }
        id
    }
}

/// Per-connection MQTT 3.1.1 service: owns the packet identifier counter and
/// the client-id generator, and builds outbound packets.
pub struct ProtocolVersion {
    packet_id: u16,
    generator: Box<dyn ClientIdGenerator>,
}

impl ProtocolVersion {
    pub const PROTOCOL_NAME: &'static str = "MQTT";
    pub const PROTOCOL_LEVEL: u8 = 0x04;

    pub fn new(generator: Box<dyn ClientIdGenerator>) -> Self {
        ProtocolVersion {
            packet_id: Self::seed(),
            generator,
        }
    }

    // random multiple of 100 in 100..=10000
    fn seed() -> u16 {
        rand::thread_rng().gen_range(1..=100u16) * 100
    }

    /// Reseeds the packet identifier counter for a new session.
    pub fn reset(&mut self) {
        self.packet_id = Self::seed();
    }

    pub fn protocol_identifier(&self) -> &'static str {
        Self::PROTOCOL_NAME
    }

    pub fn protocol_level(&self) -> u8 {
        Self::PROTOCOL_LEVEL
    }

    /// Increments and returns the packet identifier, wrapping at 65536.
    /// Zero is not a legal identifier and is skipped.
    pub fn next_packet_id(&mut self) -> u16 {
        self.packet_id = self.packet_id.wrapping_add(1);
        if self.packet_id == 0 {
            self.packet_id = 1;
        }
        self.packet_id
    }

    pub fn generate_client_id(&mut self) -> String {
        self.generator.generate_id()
    }

    /// Builds a CONNECT from the options. A missing or empty client id is
    /// replaced by a generated one, which also forces a clean session.
    pub fn connect(&mut self, options: &ConnectionOptions) -> Connect {
        let (client_id, clean_session) = match options.client_id.as_deref() {
            Some(id) if !id.is_empty() => (id.to_string(), options.clean_session),
            _ => (self.generate_client_id(), true),
        };
        Connect {
            client_id,
            clean_session,
            keep_alive: options.keep_alive,
            will: options.will.clone(),
            username: options.username.clone(),
            password: options.password.clone(),
        }
    }

    pub fn publish(
        &mut self,
        topic: impl Into<String>,
        payload: Bytes,
        qos: QoS,
        dup: bool,
        retain: bool,
    ) -> Publish {
        let packet_id = match qos {
            QoS::AtMostOnce => None,
            _ => Some(self.next_packet_id()),
        };
        Publish {
            topic: topic.into(),
            packet_id,
            qos,
            dup,
            retain,
            payload,
        }
    }

    pub fn subscribe(&mut self, topic: impl Into<String>, qos: QoS) -> Subscribe {
        Subscribe {
            packet_id: self.next_packet_id(),
            topic: topic.into(),
            qos,
        }
    }

    pub fn unsubscribe(&mut self, topic: impl Into<String>) -> Unsubscribe {
        Unsubscribe {
            packet_id: self.next_packet_id(),
            topic: topic.into(),
        }
    }
}

/// Decodes one complete raw packet by dispatching on its first byte.
///
/// `header_len` is the size of the fixed header (type byte plus remaining
/// length bytes). Only server-to-client packet types are accepted.
pub fn decode_packet(raw: &[u8], header_len: usize) -> Result<ControlPacket, MqttError> {
    let type_byte = raw.first().copied().ok_or(MqttError::IncompletePacket)?;

    match type_byte {
        0x20 => Ok(ControlPacket::ConnectAck(ConnectAck::parse(raw)?)),
        0xD0 => Ok(ControlPacket::PingResponse),
        0x90 => Ok(ControlPacket::SubscribeAck(SubscribeAck::parse(raw, header_len)?)),
        0xB0 => Ok(ControlPacket::UnsubscribeAck {
            packet_id: parse_packet_id(raw, header_len)?,
        }),
        0x30..=0x3F if (type_byte >> 1) & 0x03 != 0x03 => {
            Ok(ControlPacket::Publish(Publish::parse(raw, header_len)?))
        }
        0x40 => Ok(ControlPacket::PublishAck {
            packet_id: parse_packet_id(raw, header_len)?,
        }),
        0x50 => Ok(ControlPacket::PublishReceived {
            packet_id: parse_packet_id(raw, header_len)?,
        }),
        0x62 => Ok(ControlPacket::PublishRelease {
            packet_id: parse_packet_id(raw, header_len)?,
        }),
        0x70 => Ok(ControlPacket::PublishComplete {
            packet_id: parse_packet_id(raw, header_len)?,
        }),
        other => Err(MqttError::UnknownPacketType(other)),
    }
}
