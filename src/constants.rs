// MIT License - Copyright (c) 2026 initialed85

//! Protocol constants reverse-engineered from Broadlink firmware.

/// AES-128 key used for the authentication exchange only. Every device ships
/// knowing this key; a successful auth replaces it with a per-device session
/// key for all further traffic.
pub const DEFAULT_KEY: [u8; 16] = [
    0x09, 0x76, 0x28, 0x34, 0x3f, 0xe9, 0x9e, 0x23, 0x76, 0x5c, 0x15, 0x13, 0xac, 0xcf, 0x8b, 0x02,
];

/// Fixed CBC initialization vector shared by every frame. This is a protocol
/// constant baked into the firmware, not a security practice.
pub const PROTOCOL_IV: [u8; 16] = [
    0x56, 0x2e, 0x17, 0x99, 0x6d, 0x09, 0x3d, 0x28, 0xdd, 0xb3, 0xba, 0x69, 0x5a, 0x2e, 0x6f, 0x58,
];

/// Magic bytes opening every command frame.
pub const FRAME_MAGIC: [u8; 8] = [0x5a, 0xa5, 0xaa, 0x55, 0x5a, 0xa5, 0xaa, 0x55];

/// Seed value for the running-sum checksum.
pub const CHECKSUM_SEED: u16 = 0xbeaf;

/// Command frame header length.
pub const HEADER_LEN: usize = 0x38;

/// Discovery request frame length.
pub const DISCOVERY_REQUEST_LEN: usize = 0x30;

/// Minimum discovery reply length (device type, MAC and name start all fall
/// inside the first 0x40 bytes).
pub const DISCOVERY_REPLY_MIN_LEN: usize = 0x40;

/// Devices listen for discovery broadcasts on this UDP port.
pub const DISCOVERY_PORT: u16 = 80;

// Command frame header offsets.
pub const OFF_FRAME_CHECKSUM: usize = 0x20;
pub const OFF_ERROR_CODE: usize = 0x22;
pub const OFF_DEVICE_TYPE: usize = 0x24;
pub const OFF_COMMAND_CODE: usize = 0x26;
pub const OFF_SEQUENCE: usize = 0x28;
pub const OFF_MAC: usize = 0x2a;
pub const OFF_DEVICE_ID: usize = 0x30;
pub const OFF_PAYLOAD_CHECKSUM: usize = 0x34;

// Discovery reply offsets.
pub const OFF_REPLY_DEVICE_TYPE: usize = 0x34;
pub const OFF_REPLY_MAC: usize = 0x3a;
pub const OFF_REPLY_NAME: usize = 0x40;

/// Command code for the authentication exchange.
pub const CMD_AUTH: u16 = 0x65;

/// Command code for every post-auth command (the opcode inside the encrypted
/// payload selects the actual operation).
pub const CMD_PASSTHROUGH: u16 = 0x6a;

// Opcodes carried inside the encrypted command payload.
pub const OP_SEND_IR: u32 = 0x02;
pub const OP_ENTER_LEARN: u32 = 0x03;
pub const OP_LAST_CODE: u32 = 0x04;
pub const OP_READ_SENSORS: u32 = 0x24;

/// A reply shorter than this cannot carry a sequence number and is dropped.
pub const MIN_REPLY_LEN: usize = 0x2a;
