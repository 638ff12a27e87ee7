//! Messages exchanged between atomic models, plus the identity and flag
//! machinery the optimistic engine uses to pair originals with antimessages.
//! A message and its antimessage carry the same identity fields; annihilation
//! is a value comparison, never a pointer chase across threads.

use std::cmp::Ordering;
use std::fmt;

use crate::time::Timestamp;

/// Identity of an atomic model inside a running simulation: the owning core
/// and the index in that core's model table. Assigned during allocation.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct ModelUuid {
    pub core: usize,
    pub local: usize,
}

impl ModelUuid {
    pub const fn new(core: usize, local: usize) -> Self {
        Self { core, local }
    }
}

/// Index of a port in a model's declared (direction specific) port list.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct PortId(pub u32);

/// Mattern message color. Messages are painted with the sender's color at the
/// moment they leave the core, under the sender's color lock.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
pub enum Color {
    #[default]
    White,
    Red,
}

/// Per-message status bits mirrored from the optimistic receive protocol.
#[derive(Copy, Clone, PartialEq, Eq, Default)]
pub struct MsgFlags(u8);

impl MsgFlags {
    pub const ANTI: u8 = 1;
    pub const HEAPED: u8 = 1 << 1;
    pub const PROCESSED: u8 = 1 << 2;
    pub const ERASE: u8 = 1 << 3;
    pub const DELETE: u8 = 1 << 4;
    pub const KILL: u8 = 1 << 5;

    pub fn set(&mut self, bit: u8) {
        self.0 |= bit;
    }

    pub fn clear(&mut self, bit: u8) {
        self.0 &= !bit;
    }

    pub fn is_set(&self, bit: u8) -> bool {
        self.0 & bit != 0
    }
}

impl fmt::Debug for MsgFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        for (bit, name) in [
            (Self::ANTI, "ANTI"),
            (Self::HEAPED, "HEAPED"),
            (Self::PROCESSED, "PROCESSED"),
            (Self::ERASE, "ERASE"),
            (Self::DELETE, "DELETE"),
            (Self::KILL, "KILL"),
        ] {
            if self.is_set(bit) {
                names.push(name);
            }
        }
        write!(f, "[{}]", names.join("|"))
    }
}

/// The identity fields of a message. A message and its antimessage share the
/// same `MsgId`; the annihilation bookkeeping keys on this value.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct MsgId {
    pub src: ModelUuid,
    pub src_port: PortId,
    pub dst: ModelUuid,
    pub dst_port: PortId,
    pub timestamp: Timestamp,
}

/// An addressed event between two atomic model instances.
#[derive(Clone)]
pub struct Message<P> {
    pub src: ModelUuid,
    pub src_port: PortId,
    pub dst: ModelUuid,
    pub dst_port: PortId,
    pub timestamp: Timestamp,
    pub color: Color,
    pub flags: MsgFlags,
    pub payload: P,
}

impl<P> Message<P> {
    pub fn id(&self) -> MsgId {
        MsgId {
            src: self.src,
            src_port: self.src_port,
            dst: self.dst,
            dst_port: self.dst_port,
            timestamp: self.timestamp,
        }
    }

    pub fn is_anti(&self) -> bool {
        self.flags.is_set(MsgFlags::ANTI)
    }

    /// True when `other` denotes the same event (or its antimessage).
    pub fn annihilates(&self, other: &Message<P>) -> bool {
        self.id() == other.id()
    }
}

impl<P: Clone> Message<P> {
    /// The cancelling twin of this message: same identity, ANTI flag set.
    pub fn to_anti(&self) -> Message<P> {
        let mut anti = self.clone();
        anti.flags = MsgFlags::default();
        anti.flags.set(MsgFlags::ANTI);
        anti
    }
}

impl<P> PartialEq for Message<P> {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl<P> Eq for Message<P> {}

impl<P> Ord for Message<P> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then_with(|| self.dst.cmp(&other.dst))
            .then_with(|| self.dst_port.cmp(&other.dst_port))
            .then_with(|| self.src.cmp(&other.src))
            .then_with(|| self.src_port.cmp(&other.src_port))
    }
}

impl<P> PartialOrd for Message<P> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<P> fmt::Debug for Message<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Message{{{:?} ({},{})#{} -> ({},{})#{} {:?}{}}}",
            self.timestamp,
            self.src.core,
            self.src.local,
            self.src_port.0,
            self.dst.core,
            self.dst.local,
            self.dst_port.0,
            self.color,
            if self.is_anti() { " ANTI" } else { "" },
        )
    }
}
