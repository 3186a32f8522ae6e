// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Client-facing scheme handler
//!
//! Each open of the root path is one client with its own session. A client
//! writes a request frame and reads back the response structure; errors are
//! reported on the write. The `stats` path is a read-only text report.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use log::{debug, info};
use parking_lot::{Mutex, RwLock};
use picoevb::control::{self, Op};
use picoevb::{CancelToken, Device, Session};

use crate::stats::{Direction, DmaStats};

pub const ENOENT: i32 = 2;
pub const EBADF: i32 = 9;
pub const EINVAL: i32 = 22;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SchemeError {
    #[error("bad handle {0}")]
    BadHandle(usize),
    #[error("no such path")]
    NotFound,
    #[error("handle is read-only")]
    ReadOnly,
    #[error(transparent)]
    Dma(#[from] picoevb::Error),
}

impl SchemeError {
    pub fn errno(&self) -> i32 {
        match self {
            SchemeError::BadHandle(_) => EBADF,
            SchemeError::NotFound => ENOENT,
            SchemeError::ReadOnly => EINVAL,
            SchemeError::Dma(err) => err.errno(),
        }
    }
}

pub type Result<T> = std::result::Result<T, SchemeError>;

struct Client {
    session: Session,
    response: Mutex<Option<Vec<u8>>>,
    inflight: Mutex<Option<CancelToken>>,
}

#[derive(Clone)]
enum Handle {
    Control(Arc<Client>),
    Stats,
}

pub struct PicoEvbScheme {
    device: Arc<Device>,
    stats: Arc<DmaStats>,
    next_id: AtomicUsize,
    handles: RwLock<BTreeMap<usize, Handle>>,
}

impl PicoEvbScheme {
    pub fn new(device: Arc<Device>, stats: Arc<DmaStats>) -> Self {
        Self {
            device,
            stats,
            next_id: AtomicUsize::new(1),
            handles: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn open(&self, path: &str) -> Result<usize> {
        let handle = match path.trim_matches('/') {
            "" => Handle::Control(Arc::new(Client {
                session: self.device.open_session(),
                response: Mutex::new(None),
                inflight: Mutex::new(None),
            })),
            "stats" => Handle::Stats,
            _ => return Err(SchemeError::NotFound),
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handles.write().insert(id, handle);
        debug!("opened '{}' as {}", path, id);
        Ok(id)
    }

    fn handle(&self, id: usize) -> Result<Handle> {
        self.handles
            .read()
            .get(&id)
            .cloned()
            .ok_or(SchemeError::BadHandle(id))
    }

    /// Execute one request frame. Blocks for the whole transfer.
    pub fn write(&self, id: usize, frame: &[u8]) -> Result<usize> {
        let Handle::Control(client) = self.handle(id)? else {
            return Err(SchemeError::ReadOnly);
        };

        let cancel = CancelToken::new();
        *client.inflight.lock() = Some(cancel.clone());
        let result = control::dispatch(&self.device, &client.session, frame, &cancel);
        *client.inflight.lock() = None;

        match result {
            Ok(resp) => {
                if let (Some(direction), Some(outcome)) = (Direction::from_op(resp.op), &resp.transfer) {
                    self.stats.record_transfer(direction, outcome);
                }
                debug!("{}: {} done", id, resp.op.name());
                *client.response.lock() = Some(resp.data);
                Ok(frame.len())
            }
            Err(err) => {
                self.stats.record_error(&err);
                debug!(
                    "{}: {} failed: {}",
                    id,
                    Op::peek(frame).map_or("unknown", Op::name),
                    err
                );
                *client.response.lock() = None;
                Err(err.into())
            }
        }
    }

    /// Response of the last successful request, consumed by the read.
    /// The stats handle reads like a file at `offset`.
    pub fn read(&self, id: usize, buf: &mut [u8], offset: u64) -> Result<usize> {
        match self.handle(id)? {
            Handle::Control(client) => {
                let Some(data) = client.response.lock().take() else {
                    return Ok(0);
                };
                let n = buf.len().min(data.len());
                buf[..n].copy_from_slice(&data[..n]);
                Ok(n)
            }
            Handle::Stats => {
                let text = self.stats.snapshot().to_string().into_bytes();
                let start = usize::try_from(offset).unwrap_or(usize::MAX).min(text.len());
                let n = buf.len().min(text.len() - start);
                buf[..n].copy_from_slice(&text[start..start + n]);
                Ok(n)
            }
        }
    }

    /// Cancel the request in flight on `id`, if any
    pub fn cancel(&self, id: usize) -> Result<bool> {
        match self.handle(id)? {
            Handle::Control(client) => Ok(client
                .inflight
                .lock()
                .as_ref()
                .map(CancelToken::cancel)
                .is_some()),
            Handle::Stats => Ok(false),
        }
    }

    /// Drop a handle. The session's pinned regions are released once no
    /// request is using it.
    pub fn close(&self, id: usize) -> Result<()> {
        let handle = self
            .handles
            .write()
            .remove(&id)
            .ok_or(SchemeError::BadHandle(id))?;
        if let Handle::Control(client) = handle {
            if let Some(cancel) = client.inflight.lock().as_ref() {
                info!("{}: closed with a request in flight", id);
                cancel.cancel();
            }
        }
        debug!("closed {}", id);
        Ok(())
    }

    pub fn path(&self, id: usize) -> Result<&'static str> {
        match self.handle(id)? {
            Handle::Control(_) => Ok(""),
            Handle::Stats => Ok("stats"),
        }
    }

    pub fn handle_count(&self) -> usize {
        self.handles.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use picoevb::control::{CardInfo, DmaRequest, PinRequest};
    use picoevb::sim::{SimCard, SimConfig};
    use picoevb::DeviceVariant;

    fn scheme() -> (SimCard, PicoEvbScheme) {
        let card = SimCard::new(SimConfig::new(&DeviceVariant::PICOEVB));
        let device = card.attach().unwrap();
        (card, PicoEvbScheme::new(device, Arc::new(DmaStats::new())))
    }

    #[test]
    fn test_open_paths() {
        let (_card, scheme) = scheme();
        let control = scheme.open("/").unwrap();
        let stats = scheme.open("stats").unwrap();
        assert_ne!(control, stats);
        assert_eq!(scheme.path(stats), Ok("stats"));
        assert_eq!(scheme.open("nope").unwrap_err().errno(), ENOENT);

        scheme.close(control).unwrap();
        assert_eq!(scheme.close(control).unwrap_err().errno(), EBADF);
        assert_eq!(scheme.handle_count(), 1);
    }

    #[test]
    fn test_request_response() {
        let (_card, scheme) = scheme();
        let id = scheme.open("").unwrap();

        let frame = control::frame(Op::CardInfo, &[0; CardInfo::SIZE]);
        assert_eq!(scheme.write(id, &frame), Ok(frame.len()));

        let mut buf = [0u8; 64];
        let n = scheme.read(id, &mut buf, 0).unwrap();
        assert_eq!(n, CardInfo::SIZE);
        assert_eq!(CardInfo::from_bytes(&buf[..n]).unwrap().fpga_ram_size, 65536);

        // Consumed by the first read
        assert_eq!(scheme.read(id, &mut buf, 0), Ok(0));
    }

    #[test]
    fn test_errors_map_to_errno() {
        let (card, scheme) = scheme();
        let id = scheme.open("").unwrap();

        let err = scheme.write(id, &9u32.to_ne_bytes()).unwrap_err();
        assert_eq!(err.errno(), EINVAL);

        let end = picoevb::sim::HOST_VA_BASE + (64 << 20);
        let req = DmaRequest {
            src: end,
            dst: 0,
            len: 16,
            flags: 0,
            dma_time_ns: 0,
        };
        let err = scheme
            .write(id, &control::frame(Op::H2cDma, &req.to_bytes()))
            .unwrap_err();
        assert_eq!(err.errno(), picoevb::error::errno::EFAULT);
        assert_eq!(card.register_writes(), 0);

        let report = scheme.stats.snapshot();
        assert_eq!(report.invalid, 1);
        assert_eq!(report.faults, 1);

        let stats = scheme.open("stats").unwrap();
        assert_eq!(scheme.write(stats, &[0; 8]), Err(SchemeError::ReadOnly));
        assert_eq!(scheme.write(1234, &[0; 8]), Err(SchemeError::BadHandle(1234)));
    }

    #[test]
    fn test_transfer_recorded_in_stats() {
        let (card, scheme) = scheme();
        let id = scheme.open("").unwrap();
        let src = card.host().alloc(0x3000).unwrap();
        let dst = card.host().alloc(0x3000).unwrap();
        card.host().write(src, &[0x5a; 0x3000]).unwrap();

        let req = DmaRequest {
            src,
            dst,
            len: 0x3000,
            flags: 0,
            dma_time_ns: 0,
        };
        scheme
            .write(id, &control::frame(Op::H2c2hDma, &req.to_bytes()))
            .unwrap();
        let mut buf = [0u8; DmaRequest::SIZE];
        scheme.read(id, &mut buf, 0).unwrap();
        assert!(DmaRequest::from_bytes(&buf).unwrap().dma_time_ns > 0);
        assert_eq!(card.host().read(dst, 0x3000).unwrap(), vec![0x5a; 0x3000]);

        let report = scheme.stats.snapshot();
        let h2c2h = report.direction(Direction::H2c2h).unwrap();
        assert_eq!(h2c2h.ops, 1);
        assert_eq!(h2c2h.bytes, 0x3000);

        let stats = scheme.open("stats").unwrap();
        let mut text = vec![0u8; 4096];
        let n = scheme.read(stats, &mut text, 0).unwrap();
        let text = String::from_utf8(text[..n].to_vec()).unwrap();
        assert!(text.contains("h2c2h"));
        assert!(text.contains("12288"));
    }

    #[test]
    fn test_close_releases_pins() {
        let (card, scheme) = scheme();
        let gpu = card.gpu().unwrap().clone();
        let va = gpu.alloc(1 << 16).unwrap();
        let id = scheme.open("").unwrap();

        let req = PinRequest {
            va,
            size: 0x1000,
            handle: 0,
            pad: 0,
        };
        scheme
            .write(id, &control::frame(Op::PinDevice, &req.to_bytes()))
            .unwrap();
        assert_eq!(gpu.live_pins(), 1);

        assert_eq!(scheme.cancel(id), Ok(false));
        scheme.close(id).unwrap();
        assert_eq!(gpu.live_pins(), 0);
        assert_eq!(gpu.puts(), 1);
    }
}
