//! CAN frame object and its serialized form
//!
//! The character-device byte stream carries frames as a packed little-endian
//! header followed by the payload. The payload length is never stored: it is
//! derived from the DLC field and the link MTU, so a frame occupies
//! `HEADER_LEN + Dlc::byte_count` bytes on the stream.

use embedded_can::{ExtendedId, Id, StandardId};

/// Serialized header length in bytes: a 32-bit identifier field plus one
/// flags byte (DLC, RTR, error, extended-id).
pub const HEADER_LEN: usize = 5;

/// Largest payload the frame storage accommodates (CAN FD).
pub const MAX_DATA_LEN: usize = 64;

const DLC_MASK: u8 = 0x0f;
const RTR_FLAG: u8 = 1 << 4;
const ERROR_FLAG: u8 = 1 << 5;
const EXTID_FLAG: u8 = 1 << 6;

/// A link-layer maximum transmission unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Mtu {
    Classic,
    Fd,
}

impl Mtu {
    /// Largest payload a single frame can carry on this link.
    pub const fn data_capacity(self) -> usize {
        match self {
            Mtu::Classic => 8,
            Mtu::Fd => MAX_DATA_LEN,
        }
    }
}

impl From<Mtu> for usize {
    fn from(value: Mtu) -> Self {
        value.data_capacity()
    }
}

/// 4-bit data length code
///
/// Codes 0 to 8 encode their own byte count on both link flavors. On a
/// classic link the codes 9 to 15 all encode 8 bytes; CAN FD remaps them to
/// the 12..=64 byte steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Dlc(u8);

impl Dlc {
    pub const ZERO: Self = Self(0);
    pub const MAX: Self = Self(15);

    pub const fn new(code: u8) -> Option<Self> {
        if code <= Self::MAX.0 { Some(Self(code)) } else { None }
    }

    pub const fn from_truncating(code: u8) -> Self {
        Self(code & DLC_MASK)
    }

    pub const fn into_bits(self) -> u8 {
        self.0
    }

    /// Payload byte count this code stands for on the given link.
    pub const fn byte_count(self, mtu: Mtu) -> usize {
        match mtu {
            Mtu::Classic => {
                if self.0 > 8 { 8 } else { self.0 as usize }
            }
            Mtu::Fd => match self.0 {
                0..=8 => self.0 as usize,
                9 => 12,
                10 => 16,
                11 => 20,
                12 => 24,
                13 => 32,
                14 => 48,
                _ => 64,
            },
        }
    }

    /// Smallest code whose byte count covers `len`, `None` if `len` exceeds
    /// the link MTU.
    pub const fn for_length(len: usize, mtu: Mtu) -> Option<Self> {
        match mtu {
            Mtu::Classic => {
                if len <= 8 { Some(Self(len as u8)) } else { None }
            }
            Mtu::Fd => match len {
                0..=8 => Some(Self(len as u8)),
                9..=12 => Some(Self(9)),
                13..=16 => Some(Self(10)),
                17..=20 => Some(Self(11)),
                21..=24 => Some(Self(12)),
                25..=32 => Some(Self(13)),
                33..=48 => Some(Self(14)),
                49..=64 => Some(Self(15)),
                _ => None,
            },
        }
    }
}

/// Serialized length of a frame carrying `dlc` on the given link.
pub const fn frame_len(dlc: Dlc, mtu: Mtu) -> usize {
    HEADER_LEN + dlc.byte_count(mtu)
}

/// Decoded frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub id: Id,
    pub dlc: Dlc,
    /// Remote transmission request.
    pub rtr: bool,
    /// The frame reports a bus or driver error instead of payload data.
    pub error: bool,
}

impl Header {
    /// Identifier bits as transmitted in the 32-bit header field.
    pub fn raw_id(&self) -> u32 {
        match self.id {
            Id::Standard(id) => id.as_raw() as u32,
            Id::Extended(id) => id.as_raw(),
        }
    }

    pub const fn is_extended(&self) -> bool {
        matches!(self.id, Id::Extended(_))
    }
}

/// A single CAN frame, header plus owned payload storage
///
/// The storage always spans the FD maximum; the meaningful prefix is bounded
/// by the DLC and the link MTU. Unused storage is kept zeroed so whole-frame
/// comparison stays meaningful.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    header: Header,
    data: [u8; MAX_DATA_LEN],
}

impl Frame {
    /// Builds a frame from a decoded header and payload bytes.
    ///
    /// The payload is truncated to the storage size and zero-padded; the
    /// meaningful length is governed by `header.dlc`.
    pub fn new(header: Header, data: &[u8]) -> Self {
        let mut bytes = [0; MAX_DATA_LEN];
        let n = data.len().min(MAX_DATA_LEN);
        bytes[..n].copy_from_slice(&data[..n]);
        Self { header, data: bytes }
    }

    pub const fn empty() -> Self {
        Self {
            header: Header {
                id: Id::Standard(StandardId::ZERO),
                dlc: Dlc::ZERO,
                rtr: false,
                error: false,
            },
            data: [0; MAX_DATA_LEN],
        }
    }

    /// Builds a data frame, rounding the DLC up to the smallest code covering
    /// `data`. Returns `None` if `data` exceeds the link MTU.
    pub fn data_frame(id: impl Into<Id>, data: &[u8], mtu: Mtu) -> Option<Self> {
        let dlc = Dlc::for_length(data.len(), mtu)?;
        Some(Self::new(
            Header {
                id: id.into(),
                dlc,
                rtr: false,
                error: false,
            },
            data,
        ))
    }

    /// Builds a remote transmission request for `dlc` payload bytes.
    pub fn remote_frame(id: impl Into<Id>, dlc: Dlc) -> Self {
        Self::new(
            Header {
                id: id.into(),
                dlc,
                rtr: true,
                error: false,
            },
            &[],
        )
    }

    pub const fn header(&self) -> &Header {
        &self.header
    }

    /// Payload bytes, bounded by the DLC on the given link.
    pub fn data(&self, mtu: Mtu) -> &[u8] {
        &self.data[..self.header.dlc.byte_count(mtu)]
    }

    /// Serialized length on the character-device stream.
    pub const fn wire_len(&self, mtu: Mtu) -> usize {
        frame_len(self.header.dlc, mtu)
    }

    /// Decodes one frame from the front of `bytes`.
    ///
    /// Returns the frame and its serialized length, or `None` if `bytes` is
    /// shorter than the frame the header announces.
    pub fn parse(bytes: &[u8], mtu: Mtu) -> Option<(Self, usize)> {
        if bytes.len() < HEADER_LEN {
            return None;
        }

        let raw = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let flags = bytes[4];
        let dlc = Dlc::from_truncating(flags);
        let id = if flags & EXTID_FLAG != 0 {
            Id::Extended(unwrap!(ExtendedId::new(raw & ExtendedId::MAX.as_raw())))
        } else {
            Id::Standard(unwrap!(StandardId::new(raw as u16 & StandardId::MAX.as_raw())))
        };

        let total = frame_len(dlc, mtu);
        if bytes.len() < total {
            return None;
        }

        let header = Header {
            id,
            dlc,
            rtr: flags & RTR_FLAG != 0,
            error: flags & ERROR_FLAG != 0,
        };
        Some((Self::new(header, &bytes[HEADER_LEN..total]), total))
    }

    /// Encodes the frame at the front of `buf`.
    ///
    /// Returns the serialized length, or `None` if `buf` cannot hold the
    /// whole frame.
    pub fn emit(&self, buf: &mut [u8], mtu: Mtu) -> Option<usize> {
        let total = self.wire_len(mtu);
        if buf.len() < total {
            return None;
        }

        buf[..4].copy_from_slice(&self.header.raw_id().to_le_bytes());
        let mut flags = self.header.dlc.into_bits();
        if self.header.rtr {
            flags |= RTR_FLAG;
        }
        if self.header.error {
            flags |= ERROR_FLAG;
        }
        if self.header.is_extended() {
            flags |= EXTID_FLAG;
        }
        buf[4] = flags;
        buf[HEADER_LEN..total].copy_from_slice(&self.data[..total - HEADER_LEN]);
        Some(total)
    }
}
