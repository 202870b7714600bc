//! MQTT packet decoder

use std::sync::Arc;

use bytes::Bytes;

use super::{read_binary, read_string, read_u16, read_variable_int, MAX_REMAINING_LENGTH};
use crate::protocol::{
    ConnAck, Connect, ConnectReturnCode, DecodeError, Packet, Publish, QoS, SubAck, Subscribe,
    SubscribeReturnCode, Subscription, Unsubscribe, Will, PROTOCOL_LEVEL_V31, PROTOCOL_LEVEL_V311,
};

/// MQTT 3.1.1 packet decoder
pub struct Decoder {
    /// Maximum remaining length accepted
    max_packet_size: usize,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            max_packet_size: MAX_REMAINING_LENGTH,
        }
    }

    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size.min(MAX_REMAINING_LENGTH);
        self
    }

    /// Decode a packet from the buffer
    ///
    /// Returns `Ok(None)` while the buffer holds less than one complete
    /// packet, otherwise the packet and the number of bytes it occupied.
    pub fn decode(&mut self, buf: &[u8]) -> Result<Option<(Packet, usize)>, DecodeError> {
        if buf.len() < 2 {
            return Ok(None);
        }

        let first_byte = buf[0];
        let packet_type = first_byte >> 4;
        let flags = first_byte & 0x0F;

        let (remaining_length, len_bytes) = match read_variable_int(&buf[1..]) {
            Ok(r) => r,
            Err(DecodeError::InsufficientData) => return Ok(None),
            Err(e) => return Err(e),
        };

        if remaining_length as usize > self.max_packet_size {
            return Err(DecodeError::PacketTooLarge);
        }

        let total_len = 1 + len_bytes + remaining_length as usize;
        if buf.len() < total_len {
            return Ok(None);
        }

        let payload = &buf[1 + len_bytes..total_len];

        let packet = match packet_type {
            1 => self.decode_connect(flags, payload)?,
            2 => self.decode_connack(flags, payload)?,
            3 => self.decode_publish(flags, payload)?,
            4 => Packet::PubAck(decode_ack(flags, 0x00, payload)?),
            5 => Packet::PubRec(decode_ack(flags, 0x00, payload)?),
            6 => Packet::PubRel(decode_ack(flags, 0x02, payload)?),
            7 => Packet::PubComp(decode_ack(flags, 0x00, payload)?),
            8 => self.decode_subscribe(flags, payload)?,
            9 => self.decode_suback(flags, payload)?,
            10 => self.decode_unsubscribe(flags, payload)?,
            11 => Packet::UnsubAck(decode_ack(flags, 0x00, payload)?),
            12 => {
                expect_empty(flags, payload)?;
                Packet::PingReq
            }
            13 => {
                expect_empty(flags, payload)?;
                Packet::PingResp
            }
            14 => {
                expect_empty(flags, payload)?;
                Packet::Disconnect
            }
            _ => return Err(DecodeError::InvalidPacketType(packet_type)),
        };

        Ok(Some((packet, total_len)))
    }

    fn decode_connect(&self, flags: u8, payload: &[u8]) -> Result<Packet, DecodeError> {
        if flags != 0 {
            return Err(DecodeError::InvalidFlags);
        }

        let mut pos = 0;

        let (protocol_name, len) = read_string(payload)?;
        pos += len;

        let protocol_level = *payload.get(pos).ok_or(DecodeError::InsufficientData)?;
        pos += 1;

        match (protocol_name, protocol_level) {
            ("MQTT", PROTOCOL_LEVEL_V311) | ("MQIsdp", PROTOCOL_LEVEL_V31) => {}
            ("MQTT", level) | ("MQIsdp", level) => {
                return Err(DecodeError::InvalidProtocolVersion(level))
            }
            _ => return Err(DecodeError::InvalidProtocolName),
        }

        let connect_flags = *payload.get(pos).ok_or(DecodeError::InsufficientData)?;
        pos += 1;

        // Reserved bit must be 0
        if (connect_flags & 0x01) != 0 {
            return Err(DecodeError::InvalidFlags);
        }

        let clean_session = (connect_flags & 0x02) != 0;
        let will_flag = (connect_flags & 0x04) != 0;
        let will_qos_bits = (connect_flags >> 3) & 0x03;
        let will_retain = (connect_flags & 0x20) != 0;
        let password_flag = (connect_flags & 0x40) != 0;
        let username_flag = (connect_flags & 0x80) != 0;

        // [MQTT-3.1.2-22] If username flag is 0, password flag must be 0
        if !username_flag && password_flag {
            return Err(DecodeError::InvalidFlags);
        }

        let will_qos = QoS::from_u8(will_qos_bits).ok_or(DecodeError::InvalidQoS(will_qos_bits))?;

        if !will_flag && (will_qos != QoS::AtMostOnce || will_retain) {
            return Err(DecodeError::InvalidFlags);
        }

        let keep_alive = read_u16(&payload[pos..])?;
        pos += 2;

        let (client_id, len) = read_string(&payload[pos..])?;
        pos += len;

        let will = if will_flag {
            let (topic, len) = read_string(&payload[pos..])?;
            pos += len;

            let (will_payload, len) = read_binary(&payload[pos..])?;
            pos += len;

            Some(Will {
                topic: topic.to_string(),
                payload: Bytes::copy_from_slice(will_payload),
                qos: will_qos,
                retain: will_retain,
            })
        } else {
            None
        };

        let username = if username_flag {
            let (s, len) = read_string(&payload[pos..])?;
            pos += len;
            Some(s.to_string())
        } else {
            None
        };

        let password = if password_flag {
            let (data, _) = read_binary(&payload[pos..])?;
            Some(Bytes::copy_from_slice(data))
        } else {
            None
        };

        Ok(Packet::Connect(Box::new(Connect {
            protocol_level,
            client_id: client_id.to_string(),
            clean_session,
            keep_alive,
            username,
            password,
            will,
        })))
    }

    fn decode_connack(&self, flags: u8, payload: &[u8]) -> Result<Packet, DecodeError> {
        if flags != 0 {
            return Err(DecodeError::InvalidFlags);
        }

        if payload.len() != 2 {
            return Err(DecodeError::MalformedPacket("CONNACK must be 2 bytes"));
        }

        // Only bit 0 (session present) may be set
        if (payload[0] & 0xFE) != 0 {
            return Err(DecodeError::InvalidFlags);
        }

        let return_code = ConnectReturnCode::from_u8(payload[1])
            .ok_or(DecodeError::InvalidReturnCode(payload[1]))?;

        Ok(Packet::ConnAck(ConnAck {
            session_present: (payload[0] & 0x01) != 0,
            return_code,
        }))
    }

    fn decode_publish(&self, flags: u8, payload: &[u8]) -> Result<Packet, DecodeError> {
        let dup = (flags & 0x08) != 0;
        let qos_bits = (flags >> 1) & 0x03;
        let retain = (flags & 0x01) != 0;

        let qos = QoS::from_u8(qos_bits).ok_or(DecodeError::InvalidQoS(qos_bits))?;

        if qos == QoS::AtMostOnce && dup {
            return Err(DecodeError::MalformedPacket("DUP must be 0 for QoS 0"));
        }

        let (topic, mut pos) = read_string(payload)?;

        if topic.is_empty() {
            return Err(DecodeError::MalformedPacket("topic name cannot be empty"));
        }
        if topic.contains('+') || topic.contains('#') {
            return Err(DecodeError::MalformedPacket("topic contains wildcard"));
        }

        let packet_id = if qos != QoS::AtMostOnce {
            let id = read_u16(&payload[pos..])?;
            if id == 0 {
                return Err(DecodeError::MalformedPacket("packet id cannot be 0"));
            }
            pos += 2;
            Some(id)
        } else {
            None
        };

        Ok(Packet::Publish(Publish {
            dup,
            qos,
            retain,
            topic: Arc::from(topic),
            packet_id,
            payload: Bytes::copy_from_slice(&payload[pos..]),
        }))
    }

    fn decode_subscribe(&self, flags: u8, payload: &[u8]) -> Result<Packet, DecodeError> {
        if flags != 0x02 {
            return Err(DecodeError::InvalidFlags);
        }

        let packet_id = read_nonzero_id(payload)?;
        let mut pos = 2;

        let mut subscriptions = Vec::new();
        while pos < payload.len() {
            let (filter, len) = read_string(&payload[pos..])?;
            pos += len;

            // [MQTT-4.7.0-1] Topic filter cannot be empty
            if filter.is_empty() {
                return Err(DecodeError::MalformedPacket("topic filter cannot be empty"));
            }

            let options = *payload.get(pos).ok_or(DecodeError::InsufficientData)?;
            pos += 1;

            // Upper six bits are reserved in 3.1.1
            if (options & 0xFC) != 0 {
                return Err(DecodeError::InvalidFlags);
            }
            let qos = QoS::from_u8(options).ok_or(DecodeError::InvalidQoS(options))?;

            subscriptions.push(Subscription {
                filter: filter.to_string(),
                qos,
            });
        }

        if subscriptions.is_empty() {
            return Err(DecodeError::MalformedPacket(
                "SUBSCRIBE must have at least one topic",
            ));
        }

        Ok(Packet::Subscribe(Subscribe {
            packet_id,
            subscriptions,
        }))
    }

    fn decode_suback(&self, flags: u8, payload: &[u8]) -> Result<Packet, DecodeError> {
        if flags != 0 {
            return Err(DecodeError::InvalidFlags);
        }

        if payload.len() < 3 {
            return Err(DecodeError::InsufficientData);
        }

        let packet_id = read_u16(payload)?;
        let return_codes = payload[2..]
            .iter()
            .map(|&code| {
                SubscribeReturnCode::from_u8(code).ok_or(DecodeError::InvalidReturnCode(code))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Packet::SubAck(SubAck {
            packet_id,
            return_codes,
        }))
    }

    fn decode_unsubscribe(&self, flags: u8, payload: &[u8]) -> Result<Packet, DecodeError> {
        if flags != 0x02 {
            return Err(DecodeError::InvalidFlags);
        }

        let packet_id = read_nonzero_id(payload)?;
        let mut pos = 2;

        let mut filters = Vec::new();
        while pos < payload.len() {
            let (filter, len) = read_string(&payload[pos..])?;
            pos += len;

            if filter.is_empty() {
                return Err(DecodeError::MalformedPacket("topic filter cannot be empty"));
            }

            filters.push(filter.to_string());
        }

        if filters.is_empty() {
            return Err(DecodeError::MalformedPacket(
                "UNSUBSCRIBE must have at least one topic",
            ));
        }

        Ok(Packet::Unsubscribe(Unsubscribe { packet_id, filters }))
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

/// PUBACK, PUBREC, PUBREL, PUBCOMP and UNSUBACK share one layout
fn decode_ack(flags: u8, expected_flags: u8, payload: &[u8]) -> Result<u16, DecodeError> {
    if flags != expected_flags {
        return Err(DecodeError::InvalidFlags);
    }
    if payload.len() != 2 {
        return Err(DecodeError::MalformedPacket("acknowledgment must be 2 bytes"));
    }
    read_u16(payload)
}

fn read_nonzero_id(payload: &[u8]) -> Result<u16, DecodeError> {
    let id = read_u16(payload)?;
    if id == 0 {
        return Err(DecodeError::MalformedPacket("packet id cannot be 0"));
    }
    Ok(id)
}

fn expect_empty(flags: u8, payload: &[u8]) -> Result<(), DecodeError> {
    if flags != 0 {
        return Err(DecodeError::InvalidFlags);
    }
    if !payload.is_empty() {
        return Err(DecodeError::MalformedPacket("packet has no payload"));
    }
    Ok(())
}
