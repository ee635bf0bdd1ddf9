// MIT License - Copyright (c) 2026 initialed85

//! Pure wire codec for the Broadlink UDP protocol: checksums, AES-128-CBC
//! framing, payload builders and reply parsers. No I/O and no state; the
//! transport and device layers drive everything here.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes::Aes128;
use chrono::{DateTime, Datelike, Local, Offset, Timelike};

use crate::constants::*;
use crate::error::{BridgeError, FirmwareErrorCode, Result};

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

const AES_BLOCK: usize = 16;

/// A 6-byte hardware (MAC) address.
///
/// On the wire the bytes travel reversed; [`HardwareAddr::from_wire`] and
/// [`HardwareAddr::to_wire`] handle that so the in-memory form always reads
/// the way it prints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HardwareAddr(pub [u8; 6]);

impl HardwareAddr {
    /// Parse the byte-reversed on-wire form.
    pub fn from_wire(raw: &[u8; 6]) -> Self {
        let mut bytes = *raw;
        bytes.reverse();
        Self(bytes)
    }

    /// The byte-reversed form written into frames.
    pub fn to_wire(&self) -> [u8; 6] {
        let mut bytes = self.0;
        bytes.reverse();
        bytes
    }
}

impl fmt::Display for HardwareAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl FromStr for HardwareAddr {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 6 {
            return Err(BridgeError::InvalidHardwareAddr(s.to_string()));
        }
        let mut bytes = [0u8; 6];
        for (i, part) in parts.iter().enumerate() {
            bytes[i] = u8::from_str_radix(part, 16)
                .map_err(|_| BridgeError::InvalidHardwareAddr(s.to_string()))?;
        }
        Ok(Self(bytes))
    }
}

/// Running-sum checksum used on both plaintext and encrypted payloads.
///
/// Seeded with 0xBEAF; whenever the running sum exceeds 0xFFFF it wraps by
/// subtracting 0xFFFF. That is not the same as masking with 0xFFFF and must
/// stay this way for wire compatibility.
pub fn checksum(payload: &[u8]) -> u16 {
    let mut sum: u32 = CHECKSUM_SEED as u32;
    for &byte in payload {
        sum += byte as u32;
        if sum > 0xffff {
            sum -= 0xffff;
        }
    }
    sum as u16
}

fn cipher_key(key: &[u8]) -> Result<&GenericArray<u8, aes::cipher::consts::U16>> {
    if key.len() != AES_BLOCK {
        return Err(BridgeError::InvalidKey { len: key.len() });
    }
    Ok(GenericArray::from_slice(key))
}

/// AES-128-CBC encrypt with the fixed protocol IV.
///
/// The plaintext is zero-padded up to the next block boundary first; the
/// receiver knows the real length from the payload's own length field.
pub fn encrypt(plain: &[u8], key: &[u8]) -> Result<Vec<u8>> {
    let key = cipher_key(key)?;

    let mut buf = plain.to_vec();
    while buf.len() % AES_BLOCK != 0 {
        buf.push(0x00);
    }

    let mut enc = Aes128CbcEnc::new(key, GenericArray::from_slice(&PROTOCOL_IV));
    for block in buf.chunks_exact_mut(AES_BLOCK) {
        enc.encrypt_block_mut(GenericArray::from_mut_slice(block));
    }

    Ok(buf)
}

/// AES-128-CBC decrypt with the fixed protocol IV.
///
/// Network peers are untrusted: anything shorter than one block is an error,
/// and a trailing partial block is dropped rather than indexed into.
pub fn decrypt(cipher: &[u8], key: &[u8]) -> Result<Vec<u8>> {
    let key = cipher_key(key)?;

    if cipher.len() < AES_BLOCK {
        return Err(BridgeError::ShortCiphertext(cipher.len()));
    }

    let whole = cipher.len() - (cipher.len() % AES_BLOCK);
    let mut buf = cipher[..whole].to_vec();

    let mut dec = Aes128CbcDec::new(key, GenericArray::from_slice(&PROTOCOL_IV));
    for block in buf.chunks_exact_mut(AES_BLOCK) {
        dec.decrypt_block_mut(GenericArray::from_mut_slice(block));
    }

    Ok(buf)
}

/// Encrypt a fixed pattern with a freshly issued session key.
///
/// A corrupt or short key from a garbled auth reply fails here instead of
/// surfacing later as undecryptable traffic.
pub fn self_test_key(key: &[u8]) -> Result<()> {
    let mut pattern = vec![0u8; 128];
    pattern[64..].fill(0x69);
    encrypt(&pattern, key).map_err(|_| BridgeError::KeySelfTest)?;
    Ok(())
}

/// Command payloads, decided at the point of construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandPayload {
    /// Authentication exchange (sent under the default key)
    Auth,
    /// Read the temperature/humidity sensors
    ReadSensors,
    /// Put the device into IR learn mode
    EnterLearn,
    /// Fetch the last learned IR code
    LastCode,
    /// Transmit an IR code
    SendIr(Vec<u8>),
}

impl CommandPayload {
    /// The command code this payload travels under.
    pub fn command_code(&self) -> u16 {
        match self {
            Self::Auth => CMD_AUTH,
            _ => CMD_PASSTHROUGH,
        }
    }

    /// Build the plaintext payload bytes.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::Auth => {
                let mut payload = vec![0u8; 0x50];
                payload[0x14..0x24].fill(0x31);
                payload[0x1e] = 0x01;
                payload[0x2d] = 0x01;
                payload[0x30..0x37].copy_from_slice(b"Test 1\x00");
                payload
            }
            Self::ReadSensors => opcode_payload(OP_READ_SENSORS, &[]),
            Self::EnterLearn => opcode_payload(OP_ENTER_LEARN, &[]),
            Self::LastCode => opcode_payload(OP_LAST_CODE, &[]),
            Self::SendIr(data) => opcode_payload(OP_SEND_IR, data),
        }
    }
}

/// Length-prefixed opcode payload: LE u16 length (4 + data), LE u32 opcode,
/// then raw command bytes.
fn opcode_payload(opcode: u32, data: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(6 + data.len());
    payload.extend_from_slice(&(4u16 + data.len() as u16).to_le_bytes());
    payload.extend_from_slice(&opcode.to_le_bytes());
    payload.extend_from_slice(data);
    payload
}

/// Build a full command frame: 0x38-byte header followed by the encrypted
/// command payload.
///
/// The plaintext checksum lands in the header before encryption; the
/// checksum of the encrypted payload is written afterwards.
pub fn build_command_frame(
    device_type: u16,
    sequence_number: u16,
    mac: HardwareAddr,
    device_id: u32,
    payload: &CommandPayload,
    key: &[u8],
) -> Result<Vec<u8>> {
    let plain = payload.encode();

    let mut frame = vec![0u8; HEADER_LEN];
    frame[0x00..0x08].copy_from_slice(&FRAME_MAGIC);
    frame[OFF_DEVICE_TYPE..OFF_DEVICE_TYPE + 2].copy_from_slice(&device_type.to_le_bytes());
    frame[OFF_COMMAND_CODE..OFF_COMMAND_CODE + 2]
        .copy_from_slice(&payload.command_code().to_le_bytes());
    frame[OFF_SEQUENCE..OFF_SEQUENCE + 2].copy_from_slice(&sequence_number.to_le_bytes());
    frame[OFF_MAC..OFF_MAC + 6].copy_from_slice(&mac.to_wire());
    frame[OFF_DEVICE_ID..OFF_DEVICE_ID + 4].copy_from_slice(&device_id.to_le_bytes());
    frame[OFF_PAYLOAD_CHECKSUM..OFF_PAYLOAD_CHECKSUM + 2]
        .copy_from_slice(&checksum(&plain).to_le_bytes());

    let encrypted = encrypt(&plain, key)?;
    let encrypted_checksum = checksum(&encrypted);
    frame.extend_from_slice(&encrypted);
    frame[OFF_FRAME_CHECKSUM..OFF_FRAME_CHECKSUM + 2]
        .copy_from_slice(&encrypted_checksum.to_le_bytes());

    Ok(frame)
}

/// Build a 0x30-byte discovery request.
///
/// Carries the requester's local wall clock, IPv4 address and UDP port so
/// the device can address its unicast reply.
pub fn build_discovery_request(
    now: DateTime<Local>,
    local_ip: Ipv4Addr,
    local_port: u16,
    sequence_number: u16,
) -> Vec<u8> {
    let mut frame = vec![0u8; DISCOVERY_REQUEST_LEN];

    let offset_hours = now.offset().fix().local_minus_utc() / 3600;
    frame[0x08..0x0c].copy_from_slice(&(offset_hours as u32).to_le_bytes());
    frame[0x0c..0x0e].copy_from_slice(&(now.year() as u16).to_le_bytes());
    frame[0x0e] = now.minute() as u8;
    frame[0x0f] = now.hour() as u8;
    frame[0x10] = (now.year() - 2000) as u8;
    frame[0x11] = now.weekday().num_days_from_sunday() as u8;
    frame[0x12] = now.day() as u8;
    frame[0x13] = now.month() as u8;

    frame[0x18..0x1c].copy_from_slice(&local_ip.octets());
    frame[0x1c..0x1e].copy_from_slice(&local_port.to_le_bytes());
    frame[0x26] = 0x06;
    frame[OFF_SEQUENCE..OFF_SEQUENCE + 2].copy_from_slice(&sequence_number.to_le_bytes());

    frame
}

/// Extract the sequence number from any reply frame.
pub fn reply_sequence_number(payload: &[u8]) -> Result<u16> {
    if payload.len() < MIN_REPLY_LEN {
        return Err(BridgeError::ShortReply {
            need: MIN_REPLY_LEN,
            got: payload.len(),
        });
    }
    Ok(u16::from_le_bytes([
        payload[OFF_SEQUENCE],
        payload[OFF_SEQUENCE + 1],
    ]))
}

/// Extract the firmware error code from a reply frame. `Ok(None)` means the
/// device reported success.
pub fn reply_firmware_error(payload: &[u8]) -> Result<Option<FirmwareErrorCode>> {
    if payload.len() < OFF_ERROR_CODE + 2 {
        return Err(BridgeError::ShortReply {
            need: OFF_ERROR_CODE + 2,
            got: payload.len(),
        });
    }
    let code = i16::from_le_bytes([payload[OFF_ERROR_CODE], payload[OFF_ERROR_CODE + 1]]);
    if code == 0 {
        Ok(None)
    } else {
        Ok(Some(FirmwareErrorCode::from_code(code)))
    }
}

/// Fields parsed from a discovery reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryReply {
    pub name: String,
    pub device_type: u16,
    pub mac: HardwareAddr,
}

/// Parse a discovery reply frame: device type at 0x34, byte-reversed MAC at
/// 0x3a, NUL-terminated name from 0x40.
pub fn parse_discovery_reply(payload: &[u8]) -> Result<DiscoveryReply> {
    if payload.len() < DISCOVERY_REPLY_MIN_LEN {
        return Err(BridgeError::ShortReply {
            need: DISCOVERY_REPLY_MIN_LEN,
            got: payload.len(),
        });
    }

    let device_type = u16::from_le_bytes([
        payload[OFF_REPLY_DEVICE_TYPE],
        payload[OFF_REPLY_DEVICE_TYPE + 1],
    ]);

    let mut raw_mac = [0u8; 6];
    raw_mac.copy_from_slice(&payload[OFF_REPLY_MAC..OFF_REPLY_MAC + 6]);
    let mac = HardwareAddr::from_wire(&raw_mac);

    let name_bytes = &payload[OFF_REPLY_NAME..];
    let name_end = name_bytes
        .iter()
        .position(|&b| b == 0x00)
        .unwrap_or(name_bytes.len());
    let name = String::from_utf8_lossy(&name_bytes[..name_end]).to_string();

    Ok(DiscoveryReply {
        name,
        device_type,
        mac,
    })
}

/// Split a command reply frame into (header, encrypted payload).
pub fn split_command_reply(payload: &[u8]) -> Result<(&[u8], &[u8])> {
    if payload.len() <= HEADER_LEN {
        return Err(BridgeError::ShortReply {
            need: HEADER_LEN + 1,
            got: payload.len(),
        });
    }
    Ok((&payload[..HEADER_LEN], &payload[HEADER_LEN..]))
}

/// Parse a decrypted auth reply: numeric device ID then the 16-byte session
/// key the device just issued.
pub fn parse_auth_reply(plain: &[u8]) -> Result<(u32, [u8; 16])> {
    if plain.len() < 0x14 {
        return Err(BridgeError::ShortReply {
            need: 0x14,
            got: plain.len(),
        });
    }

    let device_id = u32::from_le_bytes([plain[0], plain[1], plain[2], plain[3]]);
    let mut key = [0u8; 16];
    key.copy_from_slice(&plain[0x04..0x14]);

    Ok((device_id, key))
}

/// Parse a decrypted command reply: LE u16 length at 0..2, command data from
/// 0x06. Returns (data length, data).
pub fn parse_command_reply(plain: &[u8]) -> Result<(u16, &[u8])> {
    if plain.len() < 0x06 {
        return Err(BridgeError::ShortReply {
            need: 0x06,
            got: plain.len(),
        });
    }

    let length = u16::from_le_bytes([plain[0], plain[1]]);
    Ok((length.saturating_sub(0x06), &plain[0x06..]))
}

/// Temperature/humidity reading from an RM-family device.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorData {
    /// Degrees Celsius, fixed point: integer byte + fractional byte / 100
    pub temperature: f64,
    /// Relative humidity percent, same fixed-point scheme
    pub humidity: f64,
}

/// Decode sensor data from command reply data bytes.
pub fn parse_sensor_data(data: &[u8]) -> Result<SensorData> {
    if data.len() < 4 {
        return Err(BridgeError::ShortReply {
            need: 4,
            got: data.len(),
        });
    }

    Ok(SensorData {
        temperature: (data[0] as i8) as f64 + (data[1] as i8) as f64 / 100.0,
        humidity: data[2] as f64 + data[3] as f64 / 100.0,
    })
}
