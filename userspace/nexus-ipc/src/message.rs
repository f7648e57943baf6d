// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Core message representation and its mapping onto the kernel envelope
//! OWNERS: @runtime
//! PUBLIC API: CoreMessage, AttachedHandle, MessageFlags, INLINE_CAPACITY
//! INVARIANTS:
//!   - args[0] carries the total payload length
//!   - Payloads of at most INLINE_CAPACITY bytes travel in args[1..]; larger ones as the data blob
//!   - A blob whose length differs from args[0] is malformed
//! TEST_COVERAGE: unit tests below, tests_prop.rs

use bitflags::bitflags;
use neuron_ipc::{HandleId, IpcFlags, Message, MessageClass, Outgoing, SecurityContext, ARGS_COUNT, USER_ID_MASK};

use crate::{IpcError, Result};

const WORD: usize = core::mem::size_of::<u64>();

/// Largest payload that travels inline in the argument words.
pub const INLINE_CAPACITY: usize = (ARGS_COUNT - 1) * WORD;

bitflags! {
    /// Send options carried by a [`CoreMessage`].
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct MessageFlags: u32 {
        /// Attach the sender's security snapshot.
        const SEND_SECURITY = 1 << 0;
    }
}

/// Handle travelling with a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AttachedHandle {
    /// Handle in the holder's table.
    pub handle: HandleId,
    /// When set, the sender gives the handle up on transfer; otherwise it keeps a copy.
    pub own: bool,
}

/// Message exchanged over a [`crate::Connection`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CoreMessage {
    class: MessageClass,
    id: u32,
    serial: u64,
    /// Payload bytes.
    pub data: Vec<u8>,
    /// Attached handle, if any.
    pub handle: Option<AttachedHandle>,
    /// Send options.
    pub flags: MessageFlags,
    /// Sender snapshot, present on received messages when the connection asked for it.
    pub security: Option<SecurityContext>,
    /// Kernel enqueue time of a received message.
    pub timestamp_ns: u64,
}

impl CoreMessage {
    fn new(class: MessageClass, id: u32, data: Vec<u8>) -> Self {
        Self {
            class,
            id: id & USER_ID_MASK,
            serial: 0,
            data,
            handle: None,
            flags: MessageFlags::empty(),
            security: None,
            timestamp_ns: 0,
        }
    }

    /// Signal: no reply expected.
    pub fn new_signal(id: u32, data: impl Into<Vec<u8>>) -> Self {
        Self::new(MessageClass::Signal, id, data.into())
    }

    /// Request: the peer answers with a reply carrying the same serial.
    pub fn new_request(id: u32, data: impl Into<Vec<u8>>) -> Self {
        Self::new(MessageClass::Request, id, data.into())
    }

    /// Reply to `request`, copying its ID and serial.
    pub fn new_reply(request: &CoreMessage, data: impl Into<Vec<u8>>) -> Self {
        let mut reply = Self::new(MessageClass::Reply, request.id, data.into());
        reply.serial = request.serial;
        reply
    }

    /// Attaches `handle`; see [`AttachedHandle::own`].
    pub fn with_handle(mut self, handle: HandleId, own: bool) -> Self {
        self.handle = Some(AttachedHandle { handle, own });
        self
    }

    /// Adds send options.
    pub fn with_flags(mut self, flags: MessageFlags) -> Self {
        self.flags |= flags;
        self
    }

    /// Message class.
    pub fn class(&self) -> MessageClass {
        self.class
    }

    /// 28-bit user ID.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Kernel-assigned serial; zero until sent or received.
    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub(crate) fn set_serial(&mut self, serial: u64) {
        self.serial = serial;
    }

    /// Kernel envelope and attachments for sending this message.
    pub(crate) fn encode(&self) -> (Outgoing<'_>, IpcFlags) {
        let mut header = Message::new(self.class, self.id);
        header.serial = self.serial;
        let mut args = [0u64; ARGS_COUNT];
        args[0] = self.data.len() as u64;
        let inline = self.data.len() <= INLINE_CAPACITY;
        if inline {
            pack_inline(&self.data, &mut args[1..]);
        }
        let mut out = Outgoing::new(header).args(args);
        if !inline {
            out = out.data(&self.data);
        }
        let mut flags = IpcFlags::empty();
        if let Some(attached) = self.handle {
            out = out.handle(attached.handle);
            if !attached.own {
                flags |= IpcFlags::COPY_HANDLE;
            }
        }
        if self.flags.contains(MessageFlags::SEND_SECURITY) {
            out = out.security();
        }
        (out, flags)
    }

    /// Rebuilds a message from a received envelope and its optional data blob.
    pub(crate) fn decode(header: &Message, blob: Option<Vec<u8>>) -> Result<Self> {
        let len = usize::try_from(header.args[0]).map_err(|_| IpcError::Malformed)?;
        let data = match blob {
            Some(blob) if blob.len() == len => blob,
            Some(_) => return Err(IpcError::Malformed),
            None if len <= INLINE_CAPACITY => unpack_inline(&header.args[1..], len),
            None => return Err(IpcError::Malformed),
        };
        let mut message = Self::new(header.class(), header.user_id(), data);
        message.serial = header.serial;
        Ok(message)
    }
}

fn pack_inline(data: &[u8], words: &mut [u64]) {
    for (word, chunk) in words.iter_mut().zip(data.chunks(WORD)) {
        let mut bytes = [0u8; WORD];
        bytes[..chunk.len()].copy_from_slice(chunk);
        *word = u64::from_le_bytes(bytes);
    }
}

fn unpack_inline(words: &[u64], len: usize) -> Vec<u8> {
    let mut data: Vec<u8> = words.iter().flat_map(|word| word.to_le_bytes()).collect();
    data.truncate(len);
    data
}
