//! MQTT 3.1.1 packet types and codec.
//!
//! Every control packet starts with one fixed-header byte (high nibble =
//! type, low nibble = type-specific flags) followed by a variable-length
//! Remaining Length field of 1 to 4 bytes. `decode_packet` is incremental:
//! it returns `Ok(None)` until the buffer holds a complete frame, so callers
//! can feed it a growing read buffer.

use bytes::Bytes;

use crate::error::{ProtocolError, Result};
use crate::topic;

/// Maximum value encodable in the Remaining Length field.
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// Maximum client identifier length in bytes (MQTT-3.1.3-5).
pub const MAX_CLIENT_ID_LEN: usize = 23;

/// SUBACK return code indicating a rejected topic filter.
pub const SUBACK_FAILURE: u8 = 0x80;

/// MQTT control packet types (high nibble of the fixed header).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
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

impl TryFrom<u8> for PacketType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(PacketType::Connect),
            2 => Ok(PacketType::Connack),
            3 => Ok(PacketType::Publish),
            4 => Ok(PacketType::Puback),
            5 => Ok(PacketType::Pubrec),
            6 => Ok(PacketType::Pubrel),
            7 => Ok(PacketType::Pubcomp),
            8 => Ok(PacketType::Subscribe),
            9 => Ok(PacketType::Suback),
            10 => Ok(PacketType::Unsubscribe),
            11 => Ok(PacketType::Unsuback),
            12 => Ok(PacketType::Pingreq),
            13 => Ok(PacketType::Pingresp),
            14 => Ok(PacketType::Disconnect),
            _ => Err(ProtocolError::InvalidPacketType(value)),
        }
    }
}

/// Quality of Service levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
#[repr(u8)]
pub enum QoS {
    #[default]
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl TryFrom<u8> for QoS {
    type Error = ProtocolError;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            _ => Err(ProtocolError::InvalidQos(value)),
        }
    }
}

/// CONNACK return codes (MQTT 3.1.1, table 3.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnackCode {
    Accepted = 0,
    UnacceptableProtocolVersion = 1,
    IdentifierRejected = 2,
    ServerUnavailable = 3,
    BadUsernamePassword = 4,
    NotAuthorized = 5,
}

impl TryFrom<u8> for ConnackCode {
    type Error = ProtocolError;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(ConnackCode::Accepted),
            1 => Ok(ConnackCode::UnacceptableProtocolVersion),
            2 => Ok(ConnackCode::IdentifierRejected),
            3 => Ok(ConnackCode::ServerUnavailable),
            4 => Ok(ConnackCode::BadUsernamePassword),
            5 => Ok(ConnackCode::NotAuthorized),
            _ => Err(ProtocolError::InvalidConnackCode(value)),
        }
    }
}

/// MQTT packets, fully decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect(Connect),
    Connack(Connack),
    Publish(Publish),
    Puback { packet_id: u16 },
    Pubrec { packet_id: u16 },
    Pubrel { packet_id: u16 },
    Pubcomp { packet_id: u16 },
    Subscribe(Subscribe),
    Suback(Suback),
    Unsubscribe(Unsubscribe),
    Unsuback { packet_id: u16 },
    Pingreq,
    Pingresp,
    Disconnect,
}

impl Packet {
    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Packet::Connect(_) => "CONNECT",
            Packet::Connack(_) => "CONNACK",
            Packet::Publish(_) => "PUBLISH",
            Packet::Puback { .. } => "PUBACK",
            Packet::Pubrec { .. } => "PUBREC",
            Packet::Pubrel { .. } => "PUBREL",
            Packet::Pubcomp { .. } => "PUBCOMP",
            Packet::Subscribe(_) => "SUBSCRIBE",
            Packet::Suback(_) => "SUBACK",
            Packet::Unsubscribe(_) => "UNSUBSCRIBE",
            Packet::Unsuback { .. } => "UNSUBACK",
            Packet::Pingreq => "PINGREQ",
            Packet::Pingresp => "PINGRESP",
            Packet::Disconnect => "DISCONNECT",
        }
    }
}

/// CONNECT packet data. The protocol name and level are validated during
/// decode (`MQTT`, level 4) and not stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    pub clean_session: bool,
    pub keep_alive: u16,
    /// May be empty when `clean_session` is set; the broker assigns an
    /// identifier in that case.
    pub client_id: String,
    pub will: Option<Will>,
    pub username: Option<String>,
    pub password: Option<Vec<u8>>,
}

/// Will message captured from CONNECT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Will {
    pub topic: String,
    pub message: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

/// CONNACK packet data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connack {
    pub session_present: bool,
    pub code: ConnackCode,
}

/// PUBLISH packet data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub dup: bool,
    pub qos: QoS,
    pub retain: bool,
    pub topic: String,
    /// Present iff `qos > 0`; never zero.
    pub packet_id: Option<u16>,
    pub payload: Bytes,
}

/// SUBSCRIBE packet data: requested filters with their maximum QoS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe {
    pub packet_id: u16,
    pub filters: Vec<(String, QoS)>,
}

/// SUBACK packet data: one return code per requested filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Suback {
    pub packet_id: u16,
    pub return_codes: Vec<u8>,
}

/// UNSUBSCRIBE packet data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsubscribe {
    pub packet_id: u16,
    pub filters: Vec<String>,
}

/// Cursor over a packet body.
struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn read_u8(&mut self) -> Result<u8> {
        if self.pos >= self.buf.len() {
            return Err(ProtocolError::IncompletePacket { needed: 1, have: 0 });
        }
        let b = self.buf[self.pos];
        self.pos += 1;
        Ok(b)
    }

    fn read_u16(&mut self) -> Result<u16> {
        if self.remaining() < 2 {
            return Err(ProtocolError::IncompletePacket {
                needed: 2,
                have: self.remaining(),
            });
        }
        let val = u16::from_be_bytes([self.buf[self.pos], self.buf[self.pos + 1]]);
        self.pos += 2;
        Ok(val)
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(ProtocolError::IncompletePacket {
                needed: len,
                have: self.remaining(),
            });
        }
        let bytes = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    /// Read a u16-length-prefixed UTF-8 string.
    ///
    /// MQTT-1.5.3-2: the string must not contain U+0000.
    fn read_string(&mut self) -> Result<String> {
        let len = self.read_u16()? as usize;
        let bytes = self.read_bytes(len)?;
        if bytes.contains(&0u8) {
            return Err(ProtocolError::MalformedPacket(
                "UTF-8 string must not contain null character".into(),
            ));
        }
        String::from_utf8(bytes.to_vec()).map_err(|_| ProtocolError::InvalidUtf8)
    }

    /// Read u16-length-prefixed binary data.
    fn read_binary(&mut self) -> Result<Vec<u8>> {
        let len = self.read_u16()? as usize;
        Ok(self.read_bytes(len)?.to_vec())
    }

    fn read_packet_id(&mut self) -> Result<u16> {
        let id = self.read_u16()?;
        if id == 0 {
            return Err(ProtocolError::ZeroPacketId);
        }
        Ok(id)
    }
}

/// Decode the Remaining Length field (1-4 bytes, 7 bits per byte plus a
/// continuation bit). Returns `(length, bytes_consumed)`, or `None` if the
/// buffer ends mid-field. A fifth continuation byte is malformed.
pub fn decode_remaining_length(buf: &[u8]) -> Result<Option<(usize, usize)>> {
    let mut multiplier = 1usize;
    let mut value = 0usize;

    for (i, &byte) in buf.iter().enumerate() {
        if i >= 4 {
            return Err(ProtocolError::InvalidRemainingLength);
        }

        value += ((byte & 0x7F) as usize) * multiplier;

        if (byte & 0x80) == 0 {
            return Ok(Some((value, i + 1)));
        }

        multiplier *= 128;
    }

    // Need more bytes
    Ok(None)
}

/// Encode a Remaining Length value into the buffer. Returns bytes written.
pub fn encode_remaining_length(mut len: usize, buf: &mut Vec<u8>) -> usize {
    let start = buf.len();
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if len == 0 {
            break;
        }
    }
    buf.len() - start
}

/// Expected fixed-header flags per packet type. PUBLISH is the only type
/// whose low nibble carries data; PUBREL/SUBSCRIBE/UNSUBSCRIBE require
/// 0b0010, everything else requires zero.
fn check_fixed_flags(packet_type: PacketType, flags: u8) -> Result<()> {
    let (name, expected) = match packet_type {
        PacketType::Publish => return Ok(()),
        PacketType::Pubrel => ("PUBREL", 0x02),
        PacketType::Subscribe => ("SUBSCRIBE", 0x02),
        PacketType::Unsubscribe => ("UNSUBSCRIBE", 0x02),
        PacketType::Connect => ("CONNECT", 0x00),
        PacketType::Connack => ("CONNACK", 0x00),
        PacketType::Puback => ("PUBACK", 0x00),
        PacketType::Pubrec => ("PUBREC", 0x00),
        PacketType::Pubcomp => ("PUBCOMP", 0x00),
        PacketType::Suback => ("SUBACK", 0x00),
        PacketType::Unsuback => ("UNSUBACK", 0x00),
        PacketType::Pingreq => ("PINGREQ", 0x00),
        PacketType::Pingresp => ("PINGRESP", 0x00),
        PacketType::Disconnect => ("DISCONNECT", 0x00),
    };
    if flags != expected {
        return Err(ProtocolError::InvalidFixedHeaderFlags { packet: name, flags });
    }
    Ok(())
}

/// Try to decode one complete packet from the front of `buf`.
///
/// Returns `Ok(Some((packet, bytes_consumed)))` on success and `Ok(None)`
/// when the buffer does not yet hold a full frame. Never consumes a partial
/// frame: the caller advances its buffer by exactly `bytes_consumed`.
pub fn decode_packet(buf: &[u8]) -> Result<Option<(Packet, usize)>> {
    if buf.is_empty() {
        return Ok(None);
    }

    let fixed_header = buf[0];
    let packet_type_raw = fixed_header >> 4;
    let flags = fixed_header & 0x0F;

    let Some((remaining_len, len_bytes)) = decode_remaining_length(&buf[1..])? else {
        return Ok(None);
    };

    let header_len = 1 + len_bytes;
    let total_len = header_len + remaining_len;

    if buf.len() < total_len {
        return Ok(None);
    }

    let packet_type = PacketType::try_from(packet_type_raw)?;
    check_fixed_flags(packet_type, flags)?;

    let body = &buf[header_len..total_len];

    let packet = match packet_type {
        PacketType::Connect => decode_connect(body)?,
        PacketType::Connack => decode_connack(body)?,
        PacketType::Publish => decode_publish(flags, body)?,
        PacketType::Puback => Packet::Puback {
            packet_id: decode_ack_body(body)?,
        },
        PacketType::Pubrec => Packet::Pubrec {
            packet_id: decode_ack_body(body)?,
        },
        PacketType::Pubrel => Packet::Pubrel {
            packet_id: decode_ack_body(body)?,
        },
        PacketType::Pubcomp => Packet::Pubcomp {
            packet_id: decode_ack_body(body)?,
        },
        PacketType::Subscribe => decode_subscribe(body)?,
        PacketType::Suback => decode_suback(body)?,
        PacketType::Unsubscribe => decode_unsubscribe(body)?,
        PacketType::Unsuback => Packet::Unsuback {
            packet_id: decode_ack_body(body)?,
        },
        PacketType::Pingreq => decode_empty(body, Packet::Pingreq)?,
        PacketType::Pingresp => decode_empty(body, Packet::Pingresp)?,
        PacketType::Disconnect => decode_empty(body, Packet::Disconnect)?,
    };

    Ok(Some((packet, total_len)))
}

fn decode_connect(body: &[u8]) -> Result<Packet> {
    let mut dec = Decoder::new(body);

    // Protocol name: strict, case-sensitive "MQTT"
    let protocol_name = dec.read_string()?;
    if protocol_name != "MQTT" {
        return Err(ProtocolError::InvalidProtocolName(protocol_name));
    }

    // Protocol level: 4 = MQTT 3.1.1
    let protocol_level = dec.read_u8()?;
    if protocol_level != 4 {
        return Err(ProtocolError::UnsupportedProtocolLevel(protocol_level));
    }

    // Connect flags
    let flags = dec.read_u8()?;
    let username_flag = (flags & 0x80) != 0;
    let password_flag = (flags & 0x40) != 0;
    let will_retain = (flags & 0x20) != 0;
    let will_qos_raw = (flags >> 3) & 0x03;
    let will_flag = (flags & 0x04) != 0;
    let clean_session = (flags & 0x02) != 0;

    // MQTT-3.1.2-3: reserved bit must be 0
    if (flags & 0x01) != 0 {
        return Err(ProtocolError::InvalidConnectFlags(flags));
    }

    let will_qos = QoS::try_from(will_qos_raw).map_err(|_| ProtocolError::InvalidWillQos(will_qos_raw))?;

    // MQTT-3.1.2-13: if Will Flag is 0, Will QoS must be 0
    if !will_flag && will_qos != QoS::AtMostOnce {
        return Err(ProtocolError::InvalidWillQos(will_qos_raw));
    }

    // MQTT-3.1.2-15: if Will Flag is 0, Will Retain must be 0
    if !will_flag && will_retain {
        return Err(ProtocolError::InvalidConnectFlags(flags));
    }

    // MQTT-3.1.2-22: password requires username
    if !username_flag && password_flag {
        return Err(ProtocolError::PasswordWithoutUsername);
    }

    let keep_alive = dec.read_u16()?;

    let client_id = dec.read_string()?;
    validate_client_id(&client_id, clean_session)?;

    let will = if will_flag {
        let topic = dec.read_string()?;
        let message = dec.read_binary()?;
        Some(Will {
            topic,
            message: Bytes::from(message),
            qos: will_qos,
            retain: will_retain,
        })
    } else {
        None
    };

    let username = if username_flag {
        Some(dec.read_string().map_err(|_| ProtocolError::MalformedUsername)?)
    } else {
        None
    };

    let password = if password_flag {
        Some(dec.read_binary().map_err(|_| ProtocolError::MalformedPassword)?)
    } else {
        None
    };

    Ok(Packet::Connect(Connect {
        clean_session,
        keep_alive,
        client_id,
        will,
        username,
        password,
    }))
}

/// MQTT-3.1.3-5/-7/-8: 1-23 bytes of `[0-9A-Za-z]`; empty is allowed only
/// with clean session set (the broker then assigns an identifier).
fn validate_client_id(client_id: &str, clean_session: bool) -> Result<()> {
    if client_id.is_empty() {
        if !clean_session {
            return Err(ProtocolError::EmptyClientIdWithoutCleanSession);
        }
        return Ok(());
    }
    if client_id.len() > MAX_CLIENT_ID_LEN {
        return Err(ProtocolError::ClientIdTooLong(client_id.len()));
    }
    if !client_id.bytes().all(|b| b.is_ascii_alphanumeric()) {
        return Err(ProtocolError::ClientIdInvalidChars);
    }
    Ok(())
}

fn decode_connack(body: &[u8]) -> Result<Packet> {
    if body.len() != 2 {
        return Err(ProtocolError::MalformedPacket(
            "CONNACK remaining length must be 2".into(),
        ));
    }
    // Acknowledge flags: only bit 0 (session present) may be set
    if body[0] & 0xFE != 0 {
        return Err(ProtocolError::MalformedPacket(
            "CONNACK acknowledge flags must be 0".into(),
        ));
    }
    Ok(Packet::Connack(Connack {
        session_present: body[0] & 0x01 != 0,
        code: ConnackCode::try_from(body[1])?,
    }))
}

fn decode_publish(flags: u8, body: &[u8]) -> Result<Packet> {
    let dup = (flags & 0x08) != 0;
    let qos = QoS::try_from((flags >> 1) & 0x03)?;
    let retain = (flags & 0x01) != 0;

    // MQTT-3.3.1-2: DUP must be 0 for QoS 0 messages
    if dup && qos == QoS::AtMostOnce {
        return Err(ProtocolError::DupWithoutQos);
    }

    let mut dec = Decoder::new(body);

    let topic = dec.read_string()?;
    // MQTT-3.3.2-2: topic names must not contain wildcards
    topic::validate_name(&topic)?;

    let packet_id = if qos != QoS::AtMostOnce {
        Some(dec.read_packet_id()?)
    } else {
        None
    };

    let payload = dec.read_bytes(dec.remaining())?;

    Ok(Packet::Publish(Publish {
        dup,
        qos,
        retain,
        topic,
        packet_id,
        payload: Bytes::copy_from_slice(payload),
    }))
}

/// Shared body of the fixed-shape acknowledgments: exactly a packet id.
fn decode_ack_body(body: &[u8]) -> Result<u16> {
    if body.len() != 2 {
        return Err(ProtocolError::MalformedPacket(
            "acknowledgment remaining length must be 2".into(),
        ));
    }
    let mut dec = Decoder::new(body);
    dec.read_packet_id()
}

fn decode_subscribe(body: &[u8]) -> Result<Packet> {
    let mut dec = Decoder::new(body);
    let packet_id = dec.read_packet_id()?;

    let mut filters = Vec::new();
    while dec.remaining() > 0 {
        let filter = dec.read_string()?;
        let qos_byte = dec.read_u8()?;
        // MQTT-3.8.3-4: upper 6 bits of the requested QoS byte are reserved
        if qos_byte & 0xFC != 0 {
            return Err(ProtocolError::MalformedPacket(format!(
                "reserved bits set in SUBSCRIBE QoS byte: {:#04x}",
                qos_byte
            )));
        }
        let qos = QoS::try_from(qos_byte)?;
        filters.push((filter, qos));
    }

    // MQTT-3.8.3-3: at least one filter
    if filters.is_empty() {
        return Err(ProtocolError::MalformedPacket("SUBSCRIBE with no topic filters".into()));
    }

    Ok(Packet::Subscribe(Subscribe { packet_id, filters }))
}

fn decode_suback(body: &[u8]) -> Result<Packet> {
    let mut dec = Decoder::new(body);
    let packet_id = dec.read_packet_id()?;

    let codes = dec.read_bytes(dec.remaining())?;
    if codes.is_empty() {
        return Err(ProtocolError::MalformedPacket("SUBACK with no return codes".into()));
    }
    for &code in codes {
        if code > 2 && code != SUBACK_FAILURE {
            return Err(ProtocolError::MalformedPacket(format!(
                "invalid SUBACK return code: {:#04x}",
                code
            )));
        }
    }

    Ok(Packet::Suback(Suback {
        packet_id,
        return_codes: codes.to_vec(),
    }))
}

fn decode_unsubscribe(body: &[u8]) -> Result<Packet> {
    let mut dec = Decoder::new(body);
    let packet_id = dec.read_packet_id()?;

    let mut filters = Vec::new();
    while dec.remaining() > 0 {
        filters.push(dec.read_string()?);
    }

    // MQTT-3.10.3-2: at least one filter
    if filters.is_empty() {
        return Err(ProtocolError::MalformedPacket(
            "UNSUBSCRIBE with no topic filters".into(),
        ));
    }

    Ok(Packet::Unsubscribe(Unsubscribe { packet_id, filters }))
}

/// PINGREQ / PINGRESP / DISCONNECT carry no body at all.
fn decode_empty(body: &[u8], packet: Packet) -> Result<Packet> {
    if !body.is_empty() {
        return Err(ProtocolError::MalformedPacket(format!(
            "{} remaining length must be 0",
            packet.name()
        )));
    }
    Ok(packet)
}

/// Encode a packet into the buffer.
pub fn encode_packet(packet: &Packet, buf: &mut Vec<u8>) {
    match packet {
        Packet::Connect(connect) => encode_connect(connect, buf),
        Packet::Connack(connack) => encode_connack(connack, buf),
        Packet::Publish(publish) => encode_publish(publish, buf),
        Packet::Puback { packet_id } => encode_simple_ack(PacketType::Puback, 0, *packet_id, buf),
        Packet::Pubrec { packet_id } => encode_simple_ack(PacketType::Pubrec, 0, *packet_id, buf),
        Packet::Pubrel { packet_id } => encode_simple_ack(PacketType::Pubrel, 0x02, *packet_id, buf),
        Packet::Pubcomp { packet_id } => encode_simple_ack(PacketType::Pubcomp, 0, *packet_id, buf),
        Packet::Subscribe(subscribe) => encode_subscribe(subscribe, buf),
        Packet::Suback(suback) => encode_suback(suback, buf),
        Packet::Unsubscribe(unsubscribe) => encode_unsubscribe(unsubscribe, buf),
        Packet::Unsuback { packet_id } => encode_simple_ack(PacketType::Unsuback, 0, *packet_id, buf),
        Packet::Pingreq => encode_empty(PacketType::Pingreq, buf),
        Packet::Pingresp => encode_empty(PacketType::Pingresp, buf),
        Packet::Disconnect => encode_empty(PacketType::Disconnect, buf),
    }
}

fn encode_connect(connect: &Connect, buf: &mut Vec<u8>) {
    let mut body = Vec::new();

    // Protocol name + level
    body.extend_from_slice(&4u16.to_be_bytes());
    body.extend_from_slice(b"MQTT");
    body.push(4);

    // Connect flags
    let mut flags = 0u8;
    if connect.clean_session {
        flags |= 0x02;
    }
    if let Some(ref will) = connect.will {
        flags |= 0x04;
        flags |= (will.qos as u8) << 3;
        if will.retain {
            flags |= 0x20;
        }
    }
    if connect.password.is_some() {
        flags |= 0x40;
    }
    if connect.username.is_some() {
        flags |= 0x80;
    }
    body.push(flags);

    body.extend_from_slice(&connect.keep_alive.to_be_bytes());

    write_string(&connect.client_id, &mut body);

    if let Some(ref will) = connect.will {
        write_string(&will.topic, &mut body);
        body.extend_from_slice(&(will.message.len() as u16).to_be_bytes());
        body.extend_from_slice(&will.message);
    }

    if let Some(ref username) = connect.username {
        write_string(username, &mut body);
    }

    if let Some(ref password) = connect.password {
        body.extend_from_slice(&(password.len() as u16).to_be_bytes());
        body.extend_from_slice(password);
    }

    buf.push((PacketType::Connect as u8) << 4);
    encode_remaining_length(body.len(), buf);
    buf.extend_from_slice(&body);
}

fn encode_connack(connack: &Connack, buf: &mut Vec<u8>) {
    buf.push((PacketType::Connack as u8) << 4);
    buf.push(2);
    buf.push(u8::from(connack.session_present));
    buf.push(connack.code as u8);
}

pub fn encode_publish(publish: &Publish, buf: &mut Vec<u8>) {
    let mut fixed_header = (PacketType::Publish as u8) << 4;
    if publish.dup {
        fixed_header |= 0x08;
    }
    fixed_header |= (publish.qos as u8) << 1;
    if publish.retain {
        fixed_header |= 0x01;
    }
    buf.push(fixed_header);

    let packet_id_len = if publish.qos != QoS::AtMostOnce { 2 } else { 0 };
    let remaining = 2 + publish.topic.len() + packet_id_len + publish.payload.len();
    encode_remaining_length(remaining, buf);

    write_string(&publish.topic, buf);

    if publish.qos != QoS::AtMostOnce {
        if let Some(id) = publish.packet_id {
            buf.extend_from_slice(&id.to_be_bytes());
        }
    }

    buf.extend_from_slice(&publish.payload);
}

fn encode_simple_ack(packet_type: PacketType, flags: u8, packet_id: u16, buf: &mut Vec<u8>) {
    buf.push(((packet_type as u8) << 4) | flags);
    buf.push(2);
    buf.extend_from_slice(&packet_id.to_be_bytes());
}

fn encode_subscribe(subscribe: &Subscribe, buf: &mut Vec<u8>) {
    let mut body = Vec::new();
    body.extend_from_slice(&subscribe.packet_id.to_be_bytes());
    for (filter, qos) in &subscribe.filters {
        write_string(filter, &mut body);
        body.push(*qos as u8);
    }

    buf.push(((PacketType::Subscribe as u8) << 4) | 0x02);
    encode_remaining_length(body.len(), buf);
    buf.extend_from_slice(&body);
}

fn encode_suback(suback: &Suback, buf: &mut Vec<u8>) {
    buf.push((PacketType::Suback as u8) << 4);
    encode_remaining_length(2 + suback.return_codes.len(), buf);
    buf.extend_from_slice(&suback.packet_id.to_be_bytes());
    buf.extend_from_slice(&suback.return_codes);
}

fn encode_unsubscribe(unsubscribe: &Unsubscribe, buf: &mut Vec<u8>) {
    let mut body = Vec::new();
    body.extend_from_slice(&unsubscribe.packet_id.to_be_bytes());
    for filter in &unsubscribe.filters {
        write_string(filter, &mut body);
    }

    buf.push(((PacketType::Unsubscribe as u8) << 4) | 0x02);
    encode_remaining_length(body.len(), buf);
    buf.extend_from_slice(&body);
}

fn encode_empty(packet_type: PacketType, buf: &mut Vec<u8>) {
    buf.push((packet_type as u8) << 4);
    buf.push(0);
}

fn write_string(s: &str, buf: &mut Vec<u8>) {
    buf.extend_from_slice(&(s.len() as u16).to_be_bytes());
    buf.extend_from_slice(s.as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_one(bytes: &[u8]) -> Packet {
        let (packet, consumed) = decode_packet(bytes).unwrap().unwrap();
        assert_eq!(consumed, bytes.len());
        packet
    }

    fn round_trip(packet: Packet) {
        let mut buf = Vec::new();
        encode_packet(&packet, &mut buf);
        let (decoded, consumed) = decode_packet(&buf).unwrap().unwrap();
        assert_eq!(consumed, buf.len());
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_remaining_length_byte_widths() {
        // Boundaries of the 1/2/3/4-byte encodings
        for (value, width) in [
            (0usize, 1usize),
            (127, 1),
            (128, 2),
            (16_383, 2),
            (16_384, 3),
            (2_097_151, 3),
            (2_097_152, 4),
            (MAX_REMAINING_LENGTH, 4),
        ] {
            let mut buf = Vec::new();
            let written = encode_remaining_length(value, &mut buf);
            assert_eq!(written, width, "width for {}", value);
            let (decoded, consumed) = decode_remaining_length(&buf).unwrap().unwrap();
            assert_eq!(decoded, value);
            assert_eq!(consumed, width);
        }
    }

    #[test]
    fn test_remaining_length_incomplete() {
        assert!(decode_remaining_length(&[0x80]).unwrap().is_none());
        assert!(decode_remaining_length(&[0xFF, 0xFF, 0xFF]).unwrap().is_none());
    }

    #[test]
    fn test_remaining_length_fifth_byte_rejected() {
        let err = decode_remaining_length(&[0xFF, 0xFF, 0xFF, 0xFF, 0x01]).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidRemainingLength));
    }

    #[test]
    fn test_decode_partial_packet() {
        let bytes = [
            0x10, 0x0C, 0x00, 0x04, b'M', b'Q', b'T', b'T', 0x04, 0x02, 0x00, 0x3C, 0x00, 0x00,
        ];
        for end in 0..bytes.len() {
            assert!(decode_packet(&bytes[..end]).unwrap().is_none(), "prefix {}", end);
        }
        assert!(decode_packet(&bytes).unwrap().is_some());
    }

    #[test]
    fn test_decode_connect_empty_client_id() {
        // MQTT 3.1.1, clean_session=1, keep_alive=60, empty client ID
        let packet = decode_one(&[
            0x10, 0x0C, 0x00, 0x04, 0x4D, 0x51, 0x54, 0x54, 0x04, 0x02, 0x00, 0x3C, 0x00, 0x00,
        ]);
        let Packet::Connect(connect) = packet else {
            panic!("expected CONNECT")
        };
        assert!(connect.clean_session);
        assert_eq!(connect.keep_alive, 60);
        assert!(connect.client_id.is_empty());
        assert!(connect.will.is_none());
        assert!(connect.username.is_none());
        assert!(connect.password.is_none());
    }

    #[test]
    fn test_decode_connect_wrong_protocol_name() {
        let err = decode_packet(&[
            0x10, 0x0C, 0x00, 0x04, 0x4D, 0x51, 0x49, 0x73, 0x04, 0x02, 0x00, 0x3C, 0x00, 0x00,
        ])
        .unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidProtocolName(_)));
    }

    #[test]
    fn test_decode_connect_wrong_protocol_level() {
        let err = decode_packet(&[
            0x10, 0x0C, 0x00, 0x04, b'M', b'Q', b'T', b'T', 0x05, 0x02, 0x00, 0x3C, 0x00, 0x00,
        ])
        .unwrap_err();
        assert!(matches!(err, ProtocolError::UnsupportedProtocolLevel(5)));
    }

    #[test]
    fn test_decode_connect_reserved_flag_bit() {
        let err = decode_packet(&[
            0x10, 0x0C, 0x00, 0x04, b'M', b'Q', b'T', b'T', 0x04, 0x03, 0x00, 0x3C, 0x00, 0x00,
        ])
        .unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidConnectFlags(_)));
    }

    #[test]
    fn test_decode_connect_empty_client_id_without_clean_session() {
        let err = decode_packet(&[
            0x10, 0x0C, 0x00, 0x04, b'M', b'Q', b'T', b'T', 0x04, 0x00, 0x00, 0x3C, 0x00, 0x00,
        ])
        .unwrap_err();
        assert!(matches!(err, ProtocolError::EmptyClientIdWithoutCleanSession));
    }

    #[test]
    fn test_decode_connect_password_without_username() {
        // flags = 0x42: password set, username unset
        let err = decode_packet(&[
            0x10, 0x0C, 0x00, 0x04, b'M', b'Q', b'T', b'T', 0x04, 0x42, 0x00, 0x3C, 0x00, 0x00,
        ])
        .unwrap_err();
        assert!(matches!(err, ProtocolError::PasswordWithoutUsername));
    }

    #[test]
    fn test_decode_connect_client_id_rules() {
        // 24-byte client id
        let mut bytes = vec![0x00, 0x04];
        bytes.extend_from_slice(b"MQTT");
        bytes.extend_from_slice(&[0x04, 0x02, 0x00, 0x3C]);
        bytes.extend_from_slice(&24u16.to_be_bytes());
        bytes.extend_from_slice(&[b'a'; 24]);
        let mut framed = vec![0x10];
        encode_remaining_length(bytes.len(), &mut framed);
        framed.extend_from_slice(&bytes);
        assert!(matches!(
            decode_packet(&framed).unwrap_err(),
            ProtocolError::ClientIdTooLong(24)
        ));

        // Invalid character
        let mut bytes = vec![0x00, 0x04];
        bytes.extend_from_slice(b"MQTT");
        bytes.extend_from_slice(&[0x04, 0x02, 0x00, 0x3C]);
        bytes.extend_from_slice(&3u16.to_be_bytes());
        bytes.extend_from_slice(b"a-b");
        let mut framed = vec![0x10];
        encode_remaining_length(bytes.len(), &mut framed);
        framed.extend_from_slice(&bytes);
        assert!(matches!(
            decode_packet(&framed).unwrap_err(),
            ProtocolError::ClientIdInvalidChars
        ));
    }

    #[test]
    fn test_decode_connect_with_will_and_credentials() {
        let connect = Connect {
            clean_session: true,
            keep_alive: 30,
            client_id: "dev1".into(),
            will: Some(Will {
                topic: "state/dev1".into(),
                message: Bytes::from_static(b"offline"),
                qos: QoS::AtLeastOnce,
                retain: true,
            }),
            username: Some("alice".into()),
            password: Some(b"secret".to_vec()),
        };
        round_trip(Packet::Connect(connect));
    }

    #[test]
    fn test_decode_publish_qos1() {
        // PUBLISH QoS 1, packet id 10, topic "a/b", payload "hi"
        let packet = decode_one(&[
            0x32, 0x09, 0x00, 0x03, 0x61, 0x2F, 0x62, 0x00, 0x0A, 0x68, 0x69,
        ]);
        let Packet::Publish(publish) = packet else {
            panic!("expected PUBLISH")
        };
        assert!(!publish.dup);
        assert!(!publish.retain);
        assert_eq!(publish.qos, QoS::AtLeastOnce);
        assert_eq!(publish.topic, "a/b");
        assert_eq!(publish.packet_id, Some(10));
        assert_eq!(&publish.payload[..], b"hi");
    }

    #[test]
    fn test_decode_publish_qos2() {
        // PUBLISH QoS 2, packet id 7, topic "x", payload "p"
        let packet = decode_one(&[0x34, 0x06, 0x00, 0x01, 0x78, 0x00, 0x07, 0x70]);
        let Packet::Publish(publish) = packet else {
            panic!("expected PUBLISH")
        };
        assert_eq!(publish.qos, QoS::ExactlyOnce);
        assert_eq!(publish.topic, "x");
        assert_eq!(publish.packet_id, Some(7));
        assert_eq!(&publish.payload[..], b"p");
    }

    #[test]
    fn test_encode_retained_publish() {
        // retain=1, topic "s/t", payload "ON"
        let publish = Publish {
            dup: false,
            qos: QoS::AtMostOnce,
            retain: true,
            topic: "s/t".into(),
            packet_id: None,
            payload: Bytes::from_static(b"ON"),
        };
        let mut buf = Vec::new();
        encode_publish(&publish, &mut buf);
        assert_eq!(buf, [0x30, 0x07, 0x00, 0x03, 0x73, 0x2F, 0x74, 0x4F, 0x4E]);
    }

    #[test]
    fn test_decode_publish_rejects_dup_on_qos0() {
        let err = decode_packet(&[0x38, 0x04, 0x00, 0x01, 0x78, 0x70]).unwrap_err();
        assert!(matches!(err, ProtocolError::DupWithoutQos));
    }

    #[test]
    fn test_decode_publish_rejects_zero_packet_id() {
        let err = decode_packet(&[0x32, 0x06, 0x00, 0x01, 0x78, 0x00, 0x00, 0x70]).unwrap_err();
        assert!(matches!(err, ProtocolError::ZeroPacketId));
    }

    #[test]
    fn test_decode_publish_rejects_wildcard_topic() {
        // topic "a/+"
        let err = decode_packet(&[0x30, 0x06, 0x00, 0x03, 0x61, 0x2F, 0x2B, 0x70]).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidTopic(_)));
    }

    #[test]
    fn test_decode_subscribe() {
        // packet id 1, filter "s/+" at QoS 0
        let packet = decode_one(&[0x82, 0x08, 0x00, 0x01, 0x00, 0x03, 0x73, 0x2F, 0x2B, 0x00]);
        let Packet::Subscribe(subscribe) = packet else {
            panic!("expected SUBSCRIBE")
        };
        assert_eq!(subscribe.packet_id, 1);
        assert_eq!(subscribe.filters, vec![("s/+".to_string(), QoS::AtMostOnce)]);
    }

    #[test]
    fn test_decode_subscribe_bad_fixed_flags() {
        let err = decode_packet(&[0x80, 0x08, 0x00, 0x01, 0x00, 0x03, 0x73, 0x2F, 0x2B, 0x00]).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidFixedHeaderFlags { .. }));
    }

    #[test]
    fn test_decode_subscribe_reserved_qos_bits() {
        let err = decode_packet(&[0x82, 0x08, 0x00, 0x01, 0x00, 0x03, 0x73, 0x2F, 0x2B, 0x04]).unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedPacket(_)));
    }

    #[test]
    fn test_decode_subscribe_no_filters() {
        let err = decode_packet(&[0x82, 0x02, 0x00, 0x01]).unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedPacket(_)));
    }

    #[test]
    fn test_encode_suback() {
        let mut buf = Vec::new();
        encode_packet(
            &Packet::Suback(Suback {
                packet_id: 1,
                return_codes: vec![0x00],
            }),
            &mut buf,
        );
        assert_eq!(buf, [0x90, 0x03, 0x00, 0x01, 0x00]);
    }

    #[test]
    fn test_encode_connack() {
        let mut buf = Vec::new();
        encode_packet(
            &Packet::Connack(Connack {
                session_present: false,
                code: ConnackCode::Accepted,
            }),
            &mut buf,
        );
        assert_eq!(buf, [0x20, 0x02, 0x00, 0x00]);

        buf.clear();
        encode_packet(
            &Packet::Connack(Connack {
                session_present: true,
                code: ConnackCode::BadUsernamePassword,
            }),
            &mut buf,
        );
        assert_eq!(buf, [0x20, 0x02, 0x01, 0x04]);
    }

    #[test]
    fn test_fixed_shape_acks() {
        let mut buf = Vec::new();
        encode_packet(&Packet::Puback { packet_id: 10 }, &mut buf);
        assert_eq!(buf, [0x40, 0x02, 0x00, 0x0A]);

        buf.clear();
        encode_packet(&Packet::Pubrec { packet_id: 7 }, &mut buf);
        assert_eq!(buf, [0x50, 0x02, 0x00, 0x07]);

        buf.clear();
        encode_packet(&Packet::Pubrel { packet_id: 7 }, &mut buf);
        assert_eq!(buf, [0x62, 0x02, 0x00, 0x07]);

        buf.clear();
        encode_packet(&Packet::Pubcomp { packet_id: 7 }, &mut buf);
        assert_eq!(buf, [0x70, 0x02, 0x00, 0x07]);
    }

    #[test]
    fn test_decode_pubrel_requires_flag_bits() {
        assert!(decode_packet(&[0x62, 0x02, 0x00, 0x07]).unwrap().is_some());
        let err = decode_packet(&[0x60, 0x02, 0x00, 0x07]).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidFixedHeaderFlags { .. }));
    }

    #[test]
    fn test_decode_empty_packets() {
        assert_eq!(decode_one(&[0xC0, 0x00]), Packet::Pingreq);
        assert_eq!(decode_one(&[0xD0, 0x00]), Packet::Pingresp);
        assert_eq!(decode_one(&[0xE0, 0x00]), Packet::Disconnect);

        // Non-zero remaining length is malformed
        let err = decode_packet(&[0xC0, 0x01, 0x00]).unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedPacket(_)));
        // Non-zero flags are malformed
        let err = decode_packet(&[0xC1, 0x00]).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidFixedHeaderFlags { .. }));
    }

    #[test]
    fn test_decode_invalid_packet_type() {
        let err = decode_packet(&[0x00, 0x00]).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidPacketType(0)));
        let err = decode_packet(&[0xF0, 0x00]).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidPacketType(15)));
    }

    #[test]
    fn test_round_trip_all_packet_types() {
        round_trip(Packet::Connect(Connect {
            clean_session: true,
            keep_alive: 60,
            client_id: String::new(),
            will: None,
            username: None,
            password: None,
        }));
        round_trip(Packet::Connack(Connack {
            session_present: true,
            code: ConnackCode::Accepted,
        }));
        round_trip(Packet::Publish(Publish {
            dup: true,
            qos: QoS::ExactlyOnce,
            retain: false,
            topic: "a/b/c".into(),
            packet_id: Some(42),
            payload: Bytes::from_static(b"payload"),
        }));
        round_trip(Packet::Publish(Publish {
            dup: false,
            qos: QoS::AtMostOnce,
            retain: true,
            topic: "t".into(),
            packet_id: None,
            payload: Bytes::new(),
        }));
        round_trip(Packet::Puback { packet_id: 1 });
        round_trip(Packet::Pubrec { packet_id: 2 });
        round_trip(Packet::Pubrel { packet_id: 3 });
        round_trip(Packet::Pubcomp { packet_id: 4 });
        round_trip(Packet::Subscribe(Subscribe {
            packet_id: 5,
            filters: vec![("a/+".into(), QoS::AtLeastOnce), ("b/#".into(), QoS::ExactlyOnce)],
        }));
        round_trip(Packet::Suback(Suback {
            packet_id: 5,
            return_codes: vec![1, 2, SUBACK_FAILURE],
        }));
        round_trip(Packet::Unsubscribe(Unsubscribe {
            packet_id: 6,
            filters: vec!["a/+".into()],
        }));
        round_trip(Packet::Unsuback { packet_id: 6 });
        round_trip(Packet::Pingreq);
        round_trip(Packet::Pingresp);
        round_trip(Packet::Disconnect);
    }

    #[test]
    fn test_decode_consumes_single_frame() {
        // Two PINGREQs back to back: decode consumes exactly one
        let bytes = [0xC0, 0x00, 0xC0, 0x00];
        let (packet, consumed) = decode_packet(&bytes).unwrap().unwrap();
        assert_eq!(packet, Packet::Pingreq);
        assert_eq!(consumed, 2);
    }

    #[test]
    fn test_read_string_rejects_null_and_bad_utf8() {
        // SUBSCRIBE with a filter containing a null byte
        let err = decode_packet(&[0x82, 0x07, 0x00, 0x01, 0x00, 0x02, b'a', 0x00, 0x00]).unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedPacket(_)));

        // PUBLISH with invalid UTF-8 in the topic
        let err = decode_packet(&[0x30, 0x04, 0x00, 0x02, 0xC3, 0x28]).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidUtf8));
    }
}
