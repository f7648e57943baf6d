// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Kernel message envelope with optional data, handle and security snapshot
//! OWNERS: @kernel-team
//! PUBLIC API: KMessage, MessageQuota
//! INVARIANTS:
//!   - HANDLE_ATTACHED set iff a handle is attached
//!   - size > 0 iff a data buffer is attached (DATA_ATTACHED mirrors it)
//!   - Buffer bytes stay charged to the sending process until the last reference drops

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::object::KernelObject;
use crate::security::SecurityContext;
use crate::status::{Result, Status};
use crate::wire::{Message, MessageClass, MessageFlags};

/// Byte budget for live message buffers charged to one process.
#[derive(Debug)]
pub struct MessageQuota {
    limit: usize,
    used: AtomicUsize,
}

impl MessageQuota {
    /// Creates a quota of `limit` bytes.
    pub fn new(limit: usize) -> Arc<Self> {
        Arc::new(Self { limit, used: AtomicUsize::new(0) })
    }

    /// Bytes currently charged.
    pub fn used(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    fn charge(self: &Arc<Self>, bytes: usize) -> Result<Charge> {
        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(bytes).filter(|total| *total <= self.limit)
            })
            .map_err(|_| Status::NoMemory)?;
        Ok(Charge { quota: Arc::clone(self), bytes })
    }
}

#[derive(Debug)]
struct Charge {
    quota: Arc<MessageQuota>,
    bytes: usize,
}

impl Drop for Charge {
    fn drop(&mut self) {
        self.quota.used.fetch_sub(self.bytes, Ordering::AcqRel);
    }
}

/// Message as held by the kernel. Shared as `Arc<KMessage>` once sent.
#[derive(Debug)]
pub struct KMessage {
    header: Message,
    data: Option<Box<[u8]>>,
    handle: Option<KernelObject>,
    security: Option<SecurityContext>,
    timestamp_ns: u64,
    charge: Option<Charge>,
}

impl KMessage {
    fn with_header(header: Message, size: usize) -> Self {
        let mut msg = Self {
            header,
            data: None,
            handle: None,
            security: None,
            timestamp_ns: 0,
            charge: None,
        };
        msg.header.flags = MessageFlags::empty();
        if size > 0 {
            msg.install_data(vec![0u8; size].into_boxed_slice());
        } else {
            msg.header.size = 0;
        }
        msg
    }

    /// Signal with a zeroed data buffer of `size` bytes.
    pub fn new_signal(id: u32, size: usize) -> Self {
        Self::with_header(Message::new(MessageClass::Signal, id), size)
    }

    /// Request with a zeroed data buffer of `size` bytes.
    pub fn new_request(id: u32, size: usize) -> Self {
        Self::with_header(Message::new(MessageClass::Request, id), size)
    }

    /// Reply to `request`, carrying its user ID and serial.
    pub fn new_reply(request: &Message, size: usize) -> Self {
        let mut header = Message::new(MessageClass::Reply, request.user_id());
        header.serial = request.serial;
        Self::with_header(header, size)
    }

    /// Wraps a user envelope. Attachment flags are recomputed from the attachments.
    pub(crate) fn from_user(header: Message) -> Self {
        let mut header = header;
        header.size = 0;
        Self::with_header(header, 0)
    }

    /// Replaces the data buffer with a copy of `buf`.
    pub fn set_data(&mut self, buf: &[u8]) {
        if buf.is_empty() {
            self.data = None;
            self.header.size = 0;
            self.header.flags.remove(MessageFlags::DATA_ATTACHED);
        } else {
            self.install_data(buf.into());
        }
        self.charge = None;
    }

    fn install_data(&mut self, data: Box<[u8]>) {
        self.header.size = data.len() as u32;
        self.header.flags.insert(MessageFlags::DATA_ATTACHED);
        self.data = Some(data);
    }

    /// Mutable access to the data buffer.
    pub fn data_mut(&mut self) -> Option<&mut [u8]> {
        self.data.as_deref_mut()
    }

    /// Attaches or removes a handle.
    pub fn set_handle(&mut self, handle: Option<KernelObject>) {
        self.header.flags.set(MessageFlags::HANDLE_ATTACHED, handle.is_some());
        self.handle = handle;
    }

    /// Attaches the sender's security snapshot.
    pub fn set_security(&mut self, security: SecurityContext) {
        self.header.flags.insert(MessageFlags::SECURITY_ATTACHED);
        self.security = Some(security);
    }

    /// Mutable access to the inline argument words.
    pub fn args_mut(&mut self) -> &mut [u64; crate::wire::ARGS_COUNT] {
        &mut self.header.args
    }

    /// Charges the data buffer against `quota`.
    pub(crate) fn charge_to(&mut self, quota: &Arc<MessageQuota>) -> Result<()> {
        let bytes = self.data.as_ref().map_or(0, |data| data.len());
        if bytes > 0 {
            self.charge = Some(quota.charge(bytes)?);
        }
        Ok(())
    }

    pub(crate) fn set_serial(&mut self, serial: u64) {
        self.header.serial = serial;
    }

    pub(crate) fn set_timestamp(&mut self, timestamp_ns: u64) {
        self.timestamp_ns = timestamp_ns;
    }

    /// Envelope.
    pub fn header(&self) -> &Message {
        &self.header
    }

    /// Attached data.
    pub fn data(&self) -> Option<&[u8]> {
        self.data.as_deref()
    }

    /// Attached handle.
    pub fn handle(&self) -> Option<&KernelObject> {
        self.handle.as_ref()
    }

    /// Attached security snapshot.
    pub fn security(&self) -> Option<&SecurityContext> {
        self.security.as_ref()
    }

    /// Monotonic send time in nanoseconds since kernel start.
    pub fn timestamp_ns(&self) -> u64 {
        self.timestamp_ns
    }

    /// Whether data or a handle is attached.
    pub fn has_attachment(&self) -> bool {
        self.data.is_some() || self.handle.is_some()
    }
}
