// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: User-visible message envelope and its little-endian wire layout
//! OWNERS: @kernel-team
//! PUBLIC API: Message, MessageClass, MessageFlags, ARGS_COUNT, ENVELOPE_SIZE
//! INVARIANTS: Layout is ABI (see offsets below); top 4 bits of `id` are the class
//!
//! ```text
//! offset size field
//!   0     4   id        class << 28 | user id
//!   4     4   size      payload byte count, 0 if no data
//!   8    48   args      six u64 inline argument words
//!  56     4   flags     MessageFlags
//!  60     4   reserved  zero
//!  64     8   serial    per-direction serial
//! ```

use core::convert::TryInto;

use bitflags::bitflags;

/// Number of inline argument words.
pub const ARGS_COUNT: usize = 6;

/// Size of the encoded envelope.
pub const ENVELOPE_SIZE: usize = 72;

/// Bit position of the class within `id`.
pub const CLASS_SHIFT: u32 = 28;

/// Mask of the user portion of `id`.
pub const USER_ID_MASK: u32 = (1 << CLASS_SHIFT) - 1;

/// Semantic class carried in the top bits of the message ID.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageClass {
    /// One-way notification.
    Signal = 0,
    /// Expects a reply carrying the same serial.
    Request = 1,
    /// Answer to a request.
    Reply = 2,
    /// Reserved encoding.
    Reserved = 3,
}

impl MessageClass {
    fn from_bits(bits: u32) -> Self {
        match bits {
            0 => Self::Signal,
            1 => Self::Request,
            2 => Self::Reply,
            _ => Self::Reserved,
        }
    }
}

bitflags! {
    /// Envelope flag bits.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct MessageFlags: u32 {
        /// A handle travels with the message.
        const HANDLE_ATTACHED = 1 << 0;
        /// A data blob of `size` bytes travels with the message.
        const DATA_ATTACHED = 1 << 1;
        /// The sender's security snapshot travels with the message.
        const SECURITY_ATTACHED = 1 << 2;
        /// Set by the kernel on messages returned from receive.
        const VALID = 1 << 3;
    }
}

/// Message envelope exchanged with the kernel.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Message {
    /// Class and user ID.
    pub id: u32,
    /// Payload byte count.
    pub size: u32,
    /// Inline argument words.
    pub args: [u64; ARGS_COUNT],
    /// Attachment and validity flags.
    pub flags: MessageFlags,
    /// Request/reply correlation serial.
    pub serial: u64,
}

impl Message {
    /// Creates an envelope of `class` with the low 28 bits of `user_id`.
    pub const fn new(class: MessageClass, user_id: u32) -> Self {
        Self {
            id: ((class as u32) << CLASS_SHIFT) | (user_id & USER_ID_MASK),
            size: 0,
            args: [0; ARGS_COUNT],
            flags: MessageFlags::empty(),
            serial: 0,
        }
    }

    /// Class encoded in the top bits of `id`.
    pub fn class(&self) -> MessageClass {
        MessageClass::from_bits(self.id >> CLASS_SHIFT)
    }

    /// User portion of `id`.
    pub const fn user_id(&self) -> u32 {
        self.id & USER_ID_MASK
    }

    /// Serialises to the little-endian layout documented at module level.
    pub fn to_le_bytes(&self) -> [u8; ENVELOPE_SIZE] {
        let mut bytes = [0u8; ENVELOPE_SIZE];
        bytes[0..4].copy_from_slice(&self.id.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.size.to_le_bytes());
        for (index, arg) in self.args.iter().enumerate() {
            let offset = 8 + index * 8;
            bytes[offset..offset + 8].copy_from_slice(&arg.to_le_bytes());
        }
        bytes[56..60].copy_from_slice(&self.flags.bits().to_le_bytes());
        bytes[64..72].copy_from_slice(&self.serial.to_le_bytes());
        bytes
    }

    /// Deserialises the little-endian layout. Unknown flag bits are discarded.
    pub fn from_le_bytes(bytes: &[u8; ENVELOPE_SIZE]) -> Self {
        let mut args = [0u64; ARGS_COUNT];
        for (index, arg) in args.iter_mut().enumerate() {
            let offset = 8 + index * 8;
            *arg = u64_at(bytes, offset);
        }
        Self {
            id: u32_at(bytes, 0),
            size: u32_at(bytes, 4),
            args,
            flags: MessageFlags::from_bits_truncate(u32_at(bytes, 56)),
            serial: u64_at(bytes, 64),
        }
    }
}

fn u32_at(bytes: &[u8; ENVELOPE_SIZE], offset: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_le_bytes(raw)
}

fn u64_at(bytes: &[u8; ENVELOPE_SIZE], offset: usize) -> u64 {
    bytes[offset..offset + 8].try_into().map(u64::from_le_bytes).unwrap_or_default()
}

static_assertions::const_assert_eq!(8 + ARGS_COUNT * 8, 56);
static_assertions::const_assert_eq!(ENVELOPE_SIZE, 64 + 8);
