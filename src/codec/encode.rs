//! MQTT packet encoder

use bytes::{BufMut, BytesMut};

use super::{write_binary, write_string, write_variable_int};
use crate::protocol::{
    ConnAck, Connect, EncodeError, Packet, Publish, QoS, SubAck, Subscribe, Unsubscribe,
    PROTOCOL_LEVEL_V31,
};

/// MQTT 3.1.1 packet encoder
#[derive(Debug, Default, Clone, Copy)]
pub struct Encoder;

impl Encoder {
    pub fn new() -> Self {
        Self
    }

    /// Encode a packet to the buffer
    pub fn encode(&self, packet: &Packet, buf: &mut BytesMut) -> Result<(), EncodeError> {
        match packet {
            Packet::Connect(p) => self.encode_connect(p, buf),
            Packet::ConnAck(p) => self.encode_connack(p, buf),
            Packet::Publish(p) => self.encode_publish(p, buf),
            Packet::PubAck(id) => encode_ack(0x40, *id, buf),
            Packet::PubRec(id) => encode_ack(0x50, *id, buf),
            Packet::PubRel(id) => encode_ack(0x62, *id, buf),
            Packet::PubComp(id) => encode_ack(0x70, *id, buf),
            Packet::Subscribe(p) => self.encode_subscribe(p, buf),
            Packet::SubAck(p) => self.encode_suback(p, buf),
            Packet::Unsubscribe(p) => self.encode_unsubscribe(p, buf),
            Packet::UnsubAck(id) => encode_ack(0xB0, *id, buf),
            Packet::PingReq => {
                buf.put_slice(&[0xC0, 0x00]);
                Ok(())
            }
            Packet::PingResp => {
                buf.put_slice(&[0xD0, 0x00]);
                Ok(())
            }
            Packet::Disconnect => {
                buf.put_slice(&[0xE0, 0x00]);
                Ok(())
            }
        }
    }

    fn encode_connect(&self, packet: &Connect, buf: &mut BytesMut) -> Result<(), EncodeError> {
        let protocol_name = if packet.protocol_level == PROTOCOL_LEVEL_V31 {
            "MQIsdp"
        } else {
            "MQTT"
        };

        // Protocol name, level, flags, keep alive
        let mut remaining_length = 2 + protocol_name.len() + 1 + 1 + 2;
        remaining_length += 2 + packet.client_id.len();
        if let Some(ref will) = packet.will {
            remaining_length += 2 + will.topic.len();
            remaining_length += 2 + will.payload.len();
        }
        if let Some(ref username) = packet.username {
            remaining_length += 2 + username.len();
        }
        if let Some(ref password) = packet.password {
            remaining_length += 2 + password.len();
        }

        buf.put_u8(0x10);
        write_variable_int(buf, remaining_length as u32)?;

        write_string(buf, protocol_name)?;
        buf.put_u8(packet.protocol_level);

        let mut connect_flags: u8 = 0;
        if packet.clean_session {
            connect_flags |= 0x02;
        }
        if let Some(ref will) = packet.will {
            connect_flags |= 0x04;
            connect_flags |= (will.qos as u8) << 3;
            if will.retain {
                connect_flags |= 0x20;
            }
        }
        if packet.password.is_some() {
            connect_flags |= 0x40;
        }
        if packet.username.is_some() {
            connect_flags |= 0x80;
        }
        buf.put_u8(connect_flags);
        buf.put_u16(packet.keep_alive);

        write_string(buf, &packet.client_id)?;

        if let Some(ref will) = packet.will {
            write_string(buf, &will.topic)?;
            write_binary(buf, &will.payload)?;
        }
        if let Some(ref username) = packet.username {
            write_string(buf, username)?;
        }
        if let Some(ref password) = packet.password {
            write_binary(buf, password)?;
        }

        Ok(())
    }

    fn encode_connack(&self, packet: &ConnAck, buf: &mut BytesMut) -> Result<(), EncodeError> {
        buf.put_u8(0x20);
        buf.put_u8(0x02);
        buf.put_u8(packet.session_present as u8);
        buf.put_u8(packet.return_code as u8);
        Ok(())
    }

    fn encode_publish(&self, packet: &Publish, buf: &mut BytesMut) -> Result<(), EncodeError> {
        if packet.topic.is_empty() || packet.topic.contains(['+', '#']) {
            return Err(EncodeError::InvalidTopicName);
        }

        let mut remaining_length = 2 + packet.topic.len() + packet.payload.len();
        let packet_id = match packet.qos {
            QoS::AtMostOnce => None,
            _ => {
                remaining_length += 2;
                Some(packet.packet_id.ok_or(EncodeError::MissingPacketId)?)
            }
        };

        let mut flags = (packet.qos as u8) << 1;
        if packet.dup && packet.qos != QoS::AtMostOnce {
            flags |= 0x08;
        }
        if packet.retain {
            flags |= 0x01;
        }

        buf.put_u8(0x30 | flags);
        write_variable_int(buf, remaining_length as u32)?;
        write_string(buf, &packet.topic)?;
        if let Some(id) = packet_id {
            buf.put_u16(id);
        }
        buf.put_slice(&packet.payload);

        Ok(())
    }

    fn encode_subscribe(&self, packet: &Subscribe, buf: &mut BytesMut) -> Result<(), EncodeError> {
        if packet.subscriptions.is_empty() {
            return Err(EncodeError::EmptyTopicList);
        }

        let remaining_length: usize = 2 + packet
            .subscriptions
            .iter()
            .map(|s| 2 + s.filter.len() + 1)
            .sum::<usize>();

        buf.put_u8(0x82);
        write_variable_int(buf, remaining_length as u32)?;
        buf.put_u16(packet.packet_id);
        for sub in &packet.subscriptions {
            write_string(buf, &sub.filter)?;
            buf.put_u8(sub.qos as u8);
        }

        Ok(())
    }

    fn encode_suback(&self, packet: &SubAck, buf: &mut BytesMut) -> Result<(), EncodeError> {
        let remaining_length = 2 + packet.return_codes.len();

        buf.put_u8(0x90);
        write_variable_int(buf, remaining_length as u32)?;
        buf.put_u16(packet.packet_id);
        for code in &packet.return_codes {
            buf.put_u8(code.to_u8());
        }

        Ok(())
    }

    fn encode_unsubscribe(
        &self,
        packet: &Unsubscribe,
        buf: &mut BytesMut,
    ) -> Result<(), EncodeError> {
        if packet.filters.is_empty() {
            return Err(EncodeError::EmptyTopicList);
        }

        let remaining_length: usize =
            2 + packet.filters.iter().map(|f| 2 + f.len()).sum::<usize>();

        buf.put_u8(0xA2);
        write_variable_int(buf, remaining_length as u32)?;
        buf.put_u16(packet.packet_id);
        for filter in &packet.filters {
            write_string(buf, filter)?;
        }

        Ok(())
    }
}

fn encode_ack(header: u8, packet_id: u16, buf: &mut BytesMut) -> Result<(), EncodeError> {
    buf.put_u8(header);
    buf.put_u8(0x02);
    buf.put_u16(packet_id);
    Ok(())
}
