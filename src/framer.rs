use crate::control::ControlPacket;
use crate::error::MqttError;
use crate::packet::decode_remaining_length;
use crate::protocol::decode_packet;
use bytes::BytesMut;

/// Accumulates raw transport bytes and cuts them into control packets.
#[derive(Debug, Default)]
pub struct StreamFramer {
    buffer: BytesMut,
}

impl StreamFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends bytes read from the transport. Nothing is decoded yet.
    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Drops everything buffered, at the start of each connection.
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Lazily yields every complete packet currently buffered.
    ///
    /// The iterator stops when the buffer holds no complete packet, or right
    /// after yielding a protocol violation. Bytes not consumed stay buffered
    /// for the next call.
    ///
    /// A malformed remaining length is never consumed, so every later call
    /// reports it again; the caller is expected to disconnect.
    pub fn drain(&mut self) -> Drain<'_> {
        Drain {
            framer: self,
            failed: false,
        }
    }

    fn next_packet(&mut self) -> Option<Result<ControlPacket, MqttError>> {
        // a lone two-byte packet stays buffered until more data arrives
        if self.buffer.len() <= 2 {
            return None;
        }

        let (remaining_length, length_bytes) = match decode_remaining_length(&self.buffer, 1) {
            Ok(decoded) => decoded,
            Err(MqttError::IncompletePacket) => return None,
            Err(e) => return Some(Err(e)),
        };

        let header_len = 1 + length_bytes;
        let packet_len = header_len + remaining_length as usize;
        if self.buffer.len() < packet_len {
            return None;
        }

        let raw = self.buffer.split_to(packet_len);
        Some(decode_packet(&raw, header_len))
    }
}

/// Iterator returned by [`StreamFramer::drain`].
pub struct Drain<'a> {
    framer: &'a mut StreamFramer,
    failed: bool,
}

impl Iterator for Drain<'_> {
    type Item = Result<ControlPacket, MqttError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let next = self.framer.next_packet();
        if matches!(next, Some(Err(_))) {
            self.failed = true;
        }
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::{ConnectAck, Publish, SubscribeAck};
    use crate::protocol::QoS;
    use bytes::Bytes;

    fn stream() -> Vec<u8> {
        let packets = [
            ControlPacket::ConnectAck(ConnectAck {
                session_present: false,
                status_code: 0,
            }),
            ControlPacket::SubscribeAck(SubscribeAck {
                packet_id: 301,
                return_code: 1,
            }),
            ControlPacket::Publish(Publish {
                topic: "a/b".to_string(),
                packet_id: Some(9),
                qos: QoS::AtLeastOnce,
                dup: false,
                retain: true,
                payload: Bytes::from(vec![0xAB; 200]),
            }),
            ControlPacket::PingResponse,
            ControlPacket::PublishComplete { packet_id: 302 },
            ControlPacket::Publish(Publish {
                topic: "x".to_string(),
                packet_id: None,
                qos: QoS::AtMostOnce,
                dup: false,
                retain: false,
                payload: Bytes::from_static(b"z"),
            }),
        ];
        packets
            .iter()
            .flat_map(|p| p.build_packet().unwrap().to_vec())
            .collect()
    }

    fn collect(framer: &mut StreamFramer) -> Vec<ControlPacket> {
        framer.drain().map(|p| p.unwrap()).collect()
    }

    #[test]
    fn whole_stream_decodes_in_order() {
        let mut framer = StreamFramer::new();
        framer.push(&stream());
        let packets = collect(&mut framer);
        assert_eq!(packets.len(), 6);
        assert!(matches!(packets[0], ControlPacket::ConnectAck(_)));
        assert!(matches!(packets[3], ControlPacket::PingResponse));
        assert_eq!(framer.buffered(), 0);
    }

    #[test]
    fn chunk_size_does_not_change_the_result() {
        let bytes = stream();
        let mut whole = StreamFramer::new();
        whole.push(&bytes);
        let expected = collect(&mut whole);

        for chunk_size in [1, 2, 3, 5, 7, 64, 199] {
            let mut framer = StreamFramer::new();
            let mut packets = Vec::new();
            for chunk in bytes.chunks(chunk_size) {
                framer.push(chunk);
                packets.extend(collect(&mut framer));
            }
            assert_eq!(packets, expected, "chunk size {}", chunk_size);
            assert_eq!(framer.buffered(), 0);
        }
    }

    #[test]
    fn two_byte_packet_waits_for_more_data() {
        let mut framer = StreamFramer::new();
        framer.push(&[0xD0, 0x00]);
        assert_eq!(framer.drain().count(), 0);
        assert_eq!(framer.buffered(), 2);

        framer.push(&[0x40, 0x02, 0x00, 0x01]);
        let packets = collect(&mut framer);
        assert_eq!(
            packets,
            vec![ControlPacket::PingResponse, ControlPacket::PublishAck { packet_id: 1 }]
        );
    }

    #[test]
    fn unknown_type_stops_the_drain_and_keeps_the_rest() {
        let mut framer = StreamFramer::new();
        framer.push(&[0x40, 0x02, 0x00, 0x01, 0xF0, 0x00, 0x50, 0x02, 0x00, 0x02]);

        let mut drain = framer.drain();
        assert!(matches!(drain.next(), Some(Ok(ControlPacket::PublishAck { packet_id: 1 }))));
        match drain.next() {
            Some(Err(e)) => {
                assert!(e.is_protocol_violation());
                assert!(matches!(e, MqttError::UnknownPacketType(0xF0)));
            }
            _ => panic!("expected an unknown packet type"),
        }
        assert!(drain.next().is_none());
        assert_eq!(framer.buffered(), 4);

        assert_eq!(collect(&mut framer), vec![ControlPacket::PublishReceived { packet_id: 2 }]);
    }

    #[test]
    fn malformed_length_is_reported_without_consuming() {
        let mut framer = StreamFramer::new();
        framer.push(&[0x30, 0xFF, 0xFF, 0xFF, 0xFF, 0x01]);
        let results: Vec<_> = framer.drain().collect();
        assert_eq!(results.len(), 1);
        assert!(matches!(results[0], Err(MqttError::MalformedRemainingLength)));
        assert_eq!(framer.buffered(), 6);

        match framer.drain().next() {
            Some(Err(e)) => assert!(e.is_protocol_violation()),
            _ => panic!("expected the same violation again"),
        }
    }

    #[test]
    fn reset_discards_partial_packets() {
        let mut framer = StreamFramer::new();
        framer.push(&[0x30, 0x10, 0x00]);
        assert_eq!(framer.drain().count(), 0);
        framer.reset();
        assert_eq!(framer.buffered(), 0);
    }
}
