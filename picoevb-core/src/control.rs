// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Control request wire format and dispatch
//!
//! A request frame is a native-endian `u32` operation code followed by the
//! operation's fixed-size structure. The response is the same structure with
//! its output fields filled in.

use crate::buffer::Operand;
use crate::completion::CancelToken;
use crate::device::{Device, TransferOutcome};
use crate::error::{Error, Result};
use crate::session::Session;

/// Buffer-to-buffer: source is a peer memory handle
pub const H2C2H_FLAG_SRC_IS_DEVICE: u64 = 1 << 0;
/// Buffer-to-buffer: destination is a peer memory handle
pub const H2C2H_FLAG_DST_IS_DEVICE: u64 = 1 << 1;
/// Host to card: source is a peer memory handle
pub const H2C_FLAG_SRC_IS_DEVICE: u64 = 1 << 0;
/// Card to host: destination is a peer memory handle
pub const C2H_FLAG_DST_IS_DEVICE: u64 = 1 << 0;

const H2C2H_VALID_FLAGS: u64 = H2C2H_FLAG_SRC_IS_DEVICE | H2C2H_FLAG_DST_IS_DEVICE;
const H2C_VALID_FLAGS: u64 = H2C_FLAG_SRC_IS_DEVICE;
const C2H_VALID_FLAGS: u64 = C2H_FLAG_DST_IS_DEVICE;

/// Operation codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Op {
    Led = 0,
    PinDevice = 1,
    UnpinDevice = 2,
    H2c2hDma = 3,
    CardInfo = 4,
    H2cDma = 5,
    C2hDma = 6,
}

impl Op {
    pub const OP_SIZE: usize = 4;

    pub fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            0 => Op::Led,
            1 => Op::PinDevice,
            2 => Op::UnpinDevice,
            3 => Op::H2c2hDma,
            4 => Op::CardInfo,
            5 => Op::H2cDma,
            6 => Op::C2hDma,
            _ => return None,
        })
    }

    /// Operation code of a frame, if it has one
    pub fn peek(frame: &[u8]) -> Option<Self> {
        let code = frame.get(..Self::OP_SIZE)?;
        Self::from_code(u32::from_ne_bytes([code[0], code[1], code[2], code[3]]))
    }

    pub fn name(self) -> &'static str {
        match self {
            Op::Led => "led",
            Op::PinDevice => "pin",
            Op::UnpinDevice => "unpin",
            Op::H2c2hDma => "h2c2h",
            Op::CardInfo => "card_info",
            Op::H2cDma => "h2c",
            Op::C2hDma => "c2h",
        }
    }

    /// Size of the structure following the operation code
    pub fn payload_size(self) -> usize {
        match self {
            Op::Led => LedRequest::SIZE,
            Op::PinDevice => PinRequest::SIZE,
            Op::UnpinDevice => UnpinRequest::SIZE,
            Op::H2c2hDma | Op::H2cDma | Op::C2hDma => DmaRequest::SIZE,
            Op::CardInfo => CardInfo::SIZE,
        }
    }
}

/// Sequential native-endian field reader
struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn bytes<const N: usize>(&mut self) -> Result<[u8; N]> {
        let (head, rest) = self.buf.split_at_checked(N).ok_or(Error::Fault)?;
        self.buf = rest;
        let mut out = [0u8; N];
        out.copy_from_slice(head);
        Ok(out)
    }

    fn u32(&mut self) -> Result<u32> {
        self.bytes().map(u32::from_ne_bytes)
    }

    fn u64(&mut self) -> Result<u64> {
        self.bytes().map(u64::from_ne_bytes)
    }
}

/// Set the card's GPIO output (LEDs on the PicoEVB)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LedRequest {
    pub value: u32,
}

impl LedRequest {
    pub const SIZE: usize = 4;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        self.value.to_ne_bytes()
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let mut r = Reader::new(buf);
        Ok(Self { value: r.u32()? })
    }
}

/// Pin peer device memory; `handle` is filled in on return
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PinRequest {
    pub va: u64,
    pub size: u64,
    pub handle: u32,
    pub pad: u32,
}

impl PinRequest {
    pub const SIZE: usize = 24;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..8].copy_from_slice(&self.va.to_ne_bytes());
        buf[8..16].copy_from_slice(&self.size.to_ne_bytes());
        buf[16..20].copy_from_slice(&self.handle.to_ne_bytes());
        buf[20..24].copy_from_slice(&self.pad.to_ne_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let mut r = Reader::new(buf);
        Ok(Self {
            va: r.u64()?,
            size: r.u64()?,
            handle: r.u32()?,
            pad: r.u32()?,
        })
    }
}

/// Release a handle returned by a pin request
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnpinRequest {
    pub handle: u32,
}

impl UnpinRequest {
    pub const SIZE: usize = 4;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        self.handle.to_ne_bytes()
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let mut r = Reader::new(buf);
        Ok(Self { handle: r.u32()? })
    }
}

/// Parameters shared by the three DMA operations; `dma_time_ns` is output
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DmaRequest {
    pub src: u64,
    pub dst: u64,
    pub len: u64,
    pub flags: u64,
    pub dma_time_ns: u64,
}

impl DmaRequest {
    pub const SIZE: usize = 40;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..8].copy_from_slice(&self.src.to_ne_bytes());
        buf[8..16].copy_from_slice(&self.dst.to_ne_bytes());
        buf[16..24].copy_from_slice(&self.len.to_ne_bytes());
        buf[24..32].copy_from_slice(&self.flags.to_ne_bytes());
        buf[32..40].copy_from_slice(&self.dma_time_ns.to_ne_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let mut r = Reader::new(buf);
        Ok(Self {
            src: r.u64()?,
            dst: r.u64()?,
            len: r.u64()?,
            flags: r.u64()?,
            dma_time_ns: r.u64()?,
        })
    }

    fn check_flags(&self, valid: u64) -> Result<()> {
        if self.flags & !valid != 0 {
            return Err(Error::InvalidArgument("unknown flags"));
        }
        Ok(())
    }
}

/// Staging RAM size of the card
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CardInfo {
    pub fpga_ram_size: u64,
}

impl CardInfo {
    pub const SIZE: usize = 8;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        self.fpga_ram_size.to_ne_bytes()
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let mut r = Reader::new(buf);
        Ok(Self {
            fpga_ram_size: r.u64()?,
        })
    }
}

/// Build a request frame
pub fn frame(op: Op, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(Op::OP_SIZE + payload.len());
    buf.extend_from_slice(&(op as u32).to_ne_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Result of a dispatched request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub op: Op,
    /// Response structure
    pub data: Vec<u8>,
    /// Set for the DMA operations
    pub transfer: Option<TransferOutcome>,
}

impl Response {
    fn new(op: Op, data: &[u8]) -> Self {
        Self {
            op,
            data: data.to_vec(),
            transfer: None,
        }
    }
}

fn dma_response(op: Op, mut req: DmaRequest, outcome: TransferOutcome) -> Response {
    req.dma_time_ns = u64::try_from(outcome.elapsed.as_nanos()).unwrap_or(u64::MAX);
    Response {
        op,
        data: req.to_bytes().to_vec(),
        transfer: Some(outcome),
    }
}

/// Decode and execute one request frame on behalf of `session`
pub fn dispatch(device: &Device, session: &Session, frame: &[u8], cancel: &CancelToken) -> Result<Response> {
    let (code, payload) = frame.split_at_checked(Op::OP_SIZE).ok_or(Error::Fault)?;
    let code = u32::from_ne_bytes([code[0], code[1], code[2], code[3]]);
    let op = Op::from_code(code).ok_or(Error::InvalidArgument("unknown operation"))?;

    match op {
        Op::Led => {
            let req = LedRequest::from_bytes(payload)?;
            device.set_led(req.value);
            Ok(Response::new(op, &req.to_bytes()))
        }
        Op::PinDevice => {
            let mut req = PinRequest::from_bytes(payload)?;
            req.handle = device.pin_device_memory(session, req.va, req.size)?;
            Ok(Response::new(op, &req.to_bytes()))
        }
        Op::UnpinDevice => {
            let req = UnpinRequest::from_bytes(payload)?;
            device.unpin_device_memory(session, u64::from(req.handle))?;
            Ok(Response::new(op, &req.to_bytes()))
        }
        Op::CardInfo => {
            let info = CardInfo {
                fpga_ram_size: device.card_info(),
            };
            Ok(Response::new(op, &info.to_bytes()))
        }
        Op::H2c2hDma => {
            let req = DmaRequest::from_bytes(payload)?;
            req.check_flags(H2C2H_VALID_FLAGS)?;
            let src = Operand::new(req.src, req.flags & H2C2H_FLAG_SRC_IS_DEVICE != 0);
            let dst = Operand::new(req.dst, req.flags & H2C2H_FLAG_DST_IS_DEVICE != 0);
            let outcome = device.h2c2h_dma(session, src, dst, req.len, cancel)?;
            Ok(dma_response(op, req, outcome))
        }
        Op::H2cDma => {
            let req = DmaRequest::from_bytes(payload)?;
            req.check_flags(H2C_VALID_FLAGS)?;
            let src = Operand::new(req.src, req.flags & H2C_FLAG_SRC_IS_DEVICE != 0);
            let outcome = device.h2c_dma(session, src, req.dst, req.len, cancel)?;
            Ok(dma_response(op, req, outcome))
        }
        Op::C2hDma => {
            let req = DmaRequest::from_bytes(payload)?;
            req.check_flags(C2H_VALID_FLAGS)?;
            let dst = Operand::new(req.dst, req.flags & C2H_FLAG_DST_IS_DEVICE != 0);
            let outcome = device.c2h_dma(session, req.src, dst, req.len, cancel)?;
            Ok(dma_response(op, req, outcome))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_op_codes() {
        assert_eq!(Op::from_code(3), Some(Op::H2c2hDma));
        assert_eq!(Op::from_code(6), Some(Op::C2hDma));
        assert_eq!(Op::from_code(7), None);
        assert_eq!(Op::peek(&frame(Op::CardInfo, &[])), Some(Op::CardInfo));
        assert_eq!(Op::peek(&[0, 0]), None);
    }

    #[test]
    fn test_pin_request_layout() {
        let req = PinRequest {
            va: 0x7f00_0001_0000,
            size: 0x2_0000,
            handle: 7,
            pad: 0,
        };
        let bytes = req.to_bytes();
        assert_eq!(&bytes[0..8], &0x7f00_0001_0000u64.to_ne_bytes());
        assert_eq!(&bytes[16..20], &7u32.to_ne_bytes());
        assert_eq!(PinRequest::from_bytes(&bytes).unwrap(), req);
    }

    #[test]
    fn test_truncated_payload_is_fault() {
        let req = DmaRequest {
            len: 16,
            ..Default::default()
        };
        let bytes = req.to_bytes();
        assert_eq!(DmaRequest::from_bytes(&bytes[..39]), Err(Error::Fault));
        assert_eq!(CardInfo::from_bytes(&[]), Err(Error::Fault));
    }

    #[test]
    fn test_flag_check() {
        let mut req = DmaRequest::default();
        req.flags = H2C2H_FLAG_SRC_IS_DEVICE | H2C2H_FLAG_DST_IS_DEVICE;
        assert!(req.check_flags(H2C2H_VALID_FLAGS).is_ok());
        assert!(req.check_flags(H2C_VALID_FLAGS).is_err());
        req.flags = 1 << 63;
        assert_eq!(
            req.check_flags(H2C2H_VALID_FLAGS),
            Err(Error::InvalidArgument("unknown flags"))
        );
    }
}
