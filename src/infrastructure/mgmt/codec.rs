//! Management Protocol Codec
//!
//! Frames exchanged over the management socket share a fixed header
//! followed by a variable body:
//!
//! ```text
//! [0-1] : opcode (u16 big-endian)
//! [2-3] : controller index (u16 big-endian, 0xFFFF = none)
//! [4-5] : body length (u16 big-endian)
//! [6..] : body
//! ```
//!
//! Multi-byte body fields are big-endian as well; device addresses travel
//! least significant byte first.

use crate::domain::models::{BdAddr, ScanMode};
use crate::domain::registry::ControllerSnapshot;
use thiserror::Error;

pub const HEADER_SIZE: usize = 6;

/// Command opcodes.
pub mod opcode {
    pub const READ_VERSION: u16 = 0x0001;
    pub const READ_INDEX_LIST: u16 = 0x0003;
    pub const READ_INFO: u16 = 0x0004;
    pub const SET_POWERED: u16 = 0x0005;
    pub const SET_DISCOVERABLE: u16 = 0x0006;
    pub const SET_CONNECTABLE: u16 = 0x0007;
    pub const SET_PAIRABLE: u16 = 0x0008;
    pub const SET_DEV_CLASS: u16 = 0x000B;
    pub const WRITE_SCAN_ENABLE: u16 = 0x000D;
    pub const SET_LOCAL_NAME: u16 = 0x000F;
    pub const START_DISCOVERY: u16 = 0x0010;
    pub const STOP_DISCOVERY: u16 = 0x0011;
}

/// Event opcodes.
pub mod event {
    pub const COMMAND_COMPLETE: u16 = 0x0001;
    pub const COMMAND_STATUS: u16 = 0x0002;
    pub const CONTROLLER_ERROR: u16 = 0x0003;
    pub const INDEX_ADDED: u16 = 0x0004;
    pub const INDEX_REMOVED: u16 = 0x0005;
    pub const POWERED: u16 = 0x0006;
    pub const DISCOVERABLE: u16 = 0x0007;
    pub const CONNECTABLE: u16 = 0x0008;
    pub const PAIRABLE: u16 = 0x0009;
    pub const CLASS_CHANGED: u16 = 0x000A;
    pub const CONNECTED: u16 = 0x000B;
    pub const DISCONNECTED: u16 = 0x000C;
    pub const DEVICE_FOUND: u16 = 0x0012;
    pub const REMOTE_NAME: u16 = 0x0013;
    pub const DISCOVERING: u16 = 0x0014;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("frame of {0} bytes is shorter than the header")]
    FrameTooShort(usize),
    #[error("header declares {declared} body bytes but {actual} arrived")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("truncated {0}")]
    Truncated(&'static str),
    #[error("body of {0} bytes does not fit a frame")]
    BodyTooLong(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub opcode: u16,
    pub index: u16,
    pub body: Vec<u8>,
}

pub fn encode(opcode: u16, index: u16, body: &[u8]) -> Result<Vec<u8>, CodecError> {
    let len = u16::try_from(body.len()).map_err(|_| CodecError::BodyTooLong(body.len()))?;
    let mut frame = Vec::with_capacity(HEADER_SIZE + body.len());
    frame.extend_from_slice(&opcode.to_be_bytes());
    frame.extend_from_slice(&index.to_be_bytes());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(body);
    Ok(frame)
}

pub fn decode(bytes: &[u8]) -> Result<Frame, CodecError> {
    if bytes.len() < HEADER_SIZE {
        return Err(CodecError::FrameTooShort(bytes.len()));
    }

    let opcode = u16::from_be_bytes([bytes[0], bytes[1]]);
    let index = u16::from_be_bytes([bytes[2], bytes[3]]);
    let declared = u16::from_be_bytes([bytes[4], bytes[5]]) as usize;
    let body = &bytes[HEADER_SIZE..];

    if body.len() != declared {
        return Err(CodecError::LengthMismatch {
            declared,
            actual: body.len(),
        });
    }

    Ok(Frame {
        opcode,
        index,
        body: body.to_vec(),
    })
}

/// Cursor over a frame body.
struct Reader<'a> {
    buf: &'a [u8],
    what: &'static str,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8], what: &'static str) -> Self {
        Self { buf, what }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.buf.len() < n {
            return Err(CodecError::Truncated(self.what));
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    fn bool(&mut self) -> Result<bool, CodecError> {
        Ok(self.u8()? != 0)
    }

    fn i8(&mut self) -> Result<i8, CodecError> {
        Ok(self.u8()? as i8)
    }

    fn u16(&mut self) -> Result<u16, CodecError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn addr(&mut self) -> Result<BdAddr, CodecError> {
        Ok(BdAddr(self.array::<6>()?))
    }

    fn rest(&mut self) -> &'a [u8] {
        std::mem::take(&mut self.buf)
    }

    fn remaining(&self) -> usize {
        self.buf.len()
    }
}

/// NUL-terminated (or unterminated) UTF-8 name, `None` when empty.
fn name_from(bytes: &[u8]) -> Option<String> {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    if end == 0 {
        return None;
    }
    Some(String::from_utf8_lossy(&bytes[..end]).into_owned())
}

/// Commands the daemon issues.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    ReadVersion,
    ReadIndexList,
    ReadInfo,
    SetPowered(bool),
    SetDiscoverable(bool),
    SetConnectable(bool),
    SetPairable(bool),
    SetDevClass([u8; 3]),
    WriteScanEnable(ScanMode),
    SetLocalName(String),
    StartDiscovery { lap: [u8; 3], length: u8 },
    StopDiscovery,
}

impl Command {
    pub fn opcode(&self) -> u16 {
        match self {
            Self::ReadVersion => opcode::READ_VERSION,
            Self::ReadIndexList => opcode::READ_INDEX_LIST,
            Self::ReadInfo => opcode::READ_INFO,
            Self::SetPowered(_) => opcode::SET_POWERED,
            Self::SetDiscoverable(_) => opcode::SET_DISCOVERABLE,
            Self::SetConnectable(_) => opcode::SET_CONNECTABLE,
            Self::SetPairable(_) => opcode::SET_PAIRABLE,
            Self::SetDevClass(_) => opcode::SET_DEV_CLASS,
            Self::WriteScanEnable(_) => opcode::WRITE_SCAN_ENABLE,
            Self::SetLocalName(_) => opcode::SET_LOCAL_NAME,
            Self::StartDiscovery { .. } => opcode::START_DISCOVERY,
            Self::StopDiscovery => opcode::STOP_DISCOVERY,
        }
    }

    pub fn body(&self) -> Vec<u8> {
        match self {
            Self::ReadVersion | Self::ReadIndexList | Self::ReadInfo | Self::StopDiscovery => {
                Vec::new()
            }
            Self::SetPowered(on)
            | Self::SetDiscoverable(on)
            | Self::SetConnectable(on)
            | Self::SetPairable(on) => vec![*on as u8],
            Self::SetDevClass(class) => class.to_vec(),
            Self::WriteScanEnable(scan) => vec![scan.0],
            Self::SetLocalName(name) => {
                let mut body = name.as_bytes().to_vec();
                body.push(0);
                body
            }
            Self::StartDiscovery { lap, length } => {
                let mut body = lap.to_vec();
                body.push(*length);
                body
            }
        }
    }

    pub fn encode(&self, index: u16) -> Result<Vec<u8>, CodecError> {
        encode(self.opcode(), index, &self.body())
    }
}

/// A decoded event body. The controller index stays on the [`Frame`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    CommandComplete {
        opcode: u16,
        status: u8,
        data: Vec<u8>,
    },
    CommandStatus {
        opcode: u16,
        status: u8,
    },
    ControllerError(u8),
    IndexAdded,
    IndexRemoved,
    Powered(bool),
    Discoverable(bool),
    Connectable(bool),
    Pairable(bool),
    ClassChanged([u8; 3]),
    Connected(BdAddr),
    Disconnected(BdAddr),
    DeviceFound {
        address: BdAddr,
        class: [u8; 3],
        rssi: i8,
        name: Option<String>,
    },
    RemoteName {
        address: BdAddr,
        status: u8,
        name: Option<String>,
    },
    Discovering(bool),
    Unknown(u16),
}

pub fn parse_event(frame: &Frame) -> Result<Event, CodecError> {
    let mut r = Reader::new(&frame.body, "event");

    let event = match frame.opcode {
        event::COMMAND_COMPLETE => {
            let mut r = Reader::new(&frame.body, "command complete");
            Event::CommandComplete {
                opcode: r.u16()?,
                status: r.u8()?,
                data: r.rest().to_vec(),
            }
        }
        event::COMMAND_STATUS => {
            let mut r = Reader::new(&frame.body, "command status");
            let status = r.u8()?;
            Event::CommandStatus {
                status,
                opcode: r.u16()?,
            }
        }
        event::CONTROLLER_ERROR => Event::ControllerError(r.u8()?),
        event::INDEX_ADDED => Event::IndexAdded,
        event::INDEX_REMOVED => Event::IndexRemoved,
        event::POWERED => Event::Powered(r.bool()?),
        event::DISCOVERABLE => Event::Discoverable(r.bool()?),
        event::CONNECTABLE => Event::Connectable(r.bool()?),
        event::PAIRABLE => Event::Pairable(r.bool()?),
        event::CLASS_CHANGED => Event::ClassChanged(r.array::<3>()?),
        event::CONNECTED => Event::Connected(r.addr()?),
        event::DISCONNECTED => Event::Disconnected(r.addr()?),
        event::DEVICE_FOUND => {
            let mut r = Reader::new(&frame.body, "device found");
            Event::DeviceFound {
                address: r.addr()?,
                class: r.array::<3>()?,
                rssi: r.i8()?,
                name: name_from(r.rest()),
            }
        }
        event::REMOTE_NAME => {
            let mut r = Reader::new(&frame.body, "remote name");
            Event::RemoteName {
                address: r.addr()?,
                status: r.u8()?,
                name: name_from(r.rest()),
            }
        }
        event::DISCOVERING => Event::Discovering(r.bool()?),
        other => Event::Unknown(other),
    };
    Ok(event)
}

/// ReadVersion reply: (version, revision).
pub fn parse_version(data: &[u8]) -> Result<(u8, u16), CodecError> {
    let mut r = Reader::new(data, "version reply");
    Ok((r.u8()?, r.u16()?))
}

/// ReadIndexList reply. The body must hold exactly `count` indices.
pub fn parse_index_list(data: &[u8]) -> Result<Vec<u16>, CodecError> {
    let mut r = Reader::new(data, "index list reply");
    let count = r.u16()? as usize;

    if r.remaining() != count * 2 {
        return Err(CodecError::LengthMismatch {
            declared: count * 2,
            actual: r.remaining(),
        });
    }

    (0..count).map(|_| r.u16()).collect()
}

/// ReadInfo reply.
pub fn parse_info(data: &[u8]) -> Result<ControllerSnapshot, CodecError> {
    let mut r = Reader::new(data, "info reply");
    Ok(ControllerSnapshot {
        controller_type: r.u8()?,
        powered: r.bool()?,
        connectable: r.bool()?,
        discoverable: r.bool()?,
        pairable: r.bool()?,
        sec_mode: r.u8()?,
        address: r.addr()?,
        class: r.array::<3>()?,
        features: r.array::<8>()?,
        manufacturer: r.u16()?,
        hci_ver: r.u8()?,
        hci_rev: r.u16()?,
    })
}

/// Inverse of [`parse_info`], used to script replies in tests.
#[cfg(test)]
pub fn encode_info(info: &ControllerSnapshot) -> Vec<u8> {
    let mut out = vec![
        info.controller_type,
        info.powered as u8,
        info.connectable as u8,
        info.discoverable as u8,
        info.pairable as u8,
        info.sec_mode,
    ];
    out.extend_from_slice(&info.address.0);
    out.extend_from_slice(&info.class);
    out.extend_from_slice(&info.features);
    out.extend_from_slice(&info.manufacturer.to_be_bytes());
    out.push(info.hci_ver);
    out.extend_from_slice(&info.hci_rev.to_be_bytes());
    out
}

/// Build a CommandComplete event frame, used to script replies in tests.
#[cfg(test)]
pub fn command_complete(index: u16, command: u16, status: u8, data: &[u8]) -> Vec<u8> {
    let mut body = command.to_be_bytes().to_vec();
    body.push(status);
    body.extend_from_slice(data);
    encode(event::COMMAND_COMPLETE, index, &body).unwrap()
}
