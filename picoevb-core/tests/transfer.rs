// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use picoevb::control::{self, DmaRequest, Op, H2C2H_FLAG_DST_IS_DEVICE, H2C_FLAG_SRC_IS_DEVICE};
use picoevb::descriptor::DESC_LEN_MAX_WORD_ALIGNED;
use picoevb::regs::{
    target, xdma_reg, Channel, RegisterIo, CHAN_CTRL, CHAN_INT_EN, IRQ_CH_INT_EN, SGDMA_CTRL,
};
use picoevb::segment::SegmentList;
use picoevb::sim::{SimCard, SimConfig, SimEvent, HOST_BUS_BASE};
use picoevb::transfer;
use picoevb::{CancelToken, Device, DeviceVariant, Error, Operand};

fn attach(config: SimConfig) -> (SimCard, Arc<Device>) {
    let card = SimCard::new(config);
    let device = card.attach().expect("failed to attach sim card");
    (card, device)
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}

fn image_1024() -> Vec<u8> {
    let mut bytes = Vec::with_capacity(1024 * 1024 * 4);
    for y in 0u32..1024 {
        for x in 0u32..1024 {
            let word = ((y & 0xffff) << 16) | (x & 0xffff);
            bytes.extend_from_slice(&word.to_ne_bytes());
        }
    }
    bytes
}

/// Interrupts off, channel stopped, no descriptor fetch halted
fn assert_torn_down(card: &SimCard, channel: Channel) {
    let dma = card.resources().dma;
    assert_eq!(dma.read32(xdma_reg(target::IRQ, 0, IRQ_CH_INT_EN)), 0);
    assert_eq!(dma.read32(channel.reg(CHAN_INT_EN)), 0);
    assert_eq!(dma.read32(channel.reg(CHAN_CTRL)), 0);
    assert_eq!(dma.read32(xdma_reg(target::SGDMA_COMMON, 0, SGDMA_CTRL)), 0);
}

#[test]
fn test_capacity_per_variant() {
    for (variant, expected) in [
        (&DeviceVariant::PICOEVB, 65536u64),
        (&DeviceVariant::HTG_K800, 2147483648u64),
    ] {
        let (_card, device) = attach(SimConfig::new(variant).host_size(1 << 20));
        assert_eq!(device.card_info(), expected);

        let session = device.open_session();
        let resp = control::dispatch(
            &device,
            &session,
            &control::frame(Op::CardInfo, &[0; 8]),
            &CancelToken::new(),
        )
        .expect("card info failed");
        let info = control::CardInfo::from_bytes(&resp.data).expect("short card info");
        assert_eq!(info.fpga_ram_size, expected);
    }
}

#[test]
fn test_round_trip_through_staging() {
    let (card, device) = attach(SimConfig::new(&DeviceVariant::PICOEVB));
    let session = device.open_session();
    let cancel = CancelToken::new();
    let cap = device.card_info();

    for len in [0, 1, cap - 1, cap] {
        let src = card.host().alloc(cap + 0x1000).expect("alloc src") + 0x10;
        let dst = card.host().alloc(cap + 0x1000).expect("alloc dst") + 0x24;
        let data = pattern(len as usize, len as u8);
        card.host().write(src, &data).expect("write src");

        device
            .h2c_dma(&session, Operand::Host(src), 0, len, &cancel)
            .expect("h2c failed");
        assert_eq!(card.read_staging(0, len as usize), data);

        device
            .c2h_dma(&session, 0, Operand::Host(dst), len, &cancel)
            .expect("c2h failed");
        assert_eq!(card.host().read(dst, len as usize).expect("read dst"), data);

        assert_eq!(card.host().pinned_pages(), 0);
        assert_eq!(card.host().mapped_pages(), 0);
    }
}

#[test]
fn test_card_offset_transfers() {
    let (card, device) = attach(SimConfig::new(&DeviceVariant::PICOEVB));
    let session = device.open_session();
    let cancel = CancelToken::new();

    let src = card.host().alloc(0x3000).expect("alloc");
    let data = pattern(0x2100, 7);
    card.host().write(src, &data).expect("write");

    device
        .h2c_dma(&session, Operand::Host(src), 0x8000, 0x2100, &cancel)
        .expect("h2c failed");
    assert_eq!(card.read_staging(0x8000, 0x2100), data);
    assert_eq!(card.read_staging(0x7ff0, 0x10), vec![0; 0x10]);

    let dst = card.host().alloc(0x1000).expect("alloc");
    device
        .c2h_dma(&session, 0x8100, Operand::Host(dst), 0x80, &cancel)
        .expect("c2h failed");
    assert_eq!(
        card.host().read(dst, 0x80).expect("read"),
        &data[0x100..0x180]
    );
}

#[test]
fn test_h2c2h_chunks_by_staging_size() {
    let (card, device) = attach(SimConfig::new(&DeviceVariant::PICOEVB).fragmented_host(false));
    let session = device.open_session();
    let image = image_1024();
    let len = image.len() as u64;

    let src = card.host().alloc(len).expect("alloc src");
    let dst = card.host().alloc(len).expect("alloc dst");
    card.host().write(src, &image).expect("write src");

    let outcome = device
        .h2c2h_dma(
            &session,
            Operand::Host(src),
            Operand::Host(dst),
            len,
            &CancelToken::new(),
        )
        .expect("h2c2h failed");

    let bound = device.card_info().min(DESC_LEN_MAX_WORD_ALIGNED);
    assert_eq!(outcome.report.chunks, len.div_ceil(bound));
    assert_eq!(outcome.report.bytes, len);
    assert_eq!(card.runs(), 2 * outcome.report.chunks);
    assert!(outcome.elapsed > Duration::ZERO);
    assert_eq!(card.host().read(dst, image.len()).expect("read dst"), image);
}

#[test]
fn test_h2c2h_fragmented_and_misaligned() {
    let (card, device) = attach(SimConfig::new(&DeviceVariant::PICOEVB));
    let session = device.open_session();
    let len = 300 * 1024 + 17;

    let src = card.host().alloc(len + 0x2000).expect("alloc src") + 0xff8;
    let dst = card.host().alloc(len + 0x2000).expect("alloc dst") + 0x3;
    let data = pattern(len as usize, 99);
    card.host().write(src, &data).expect("write src");

    let outcome = device
        .h2c2h_dma(
            &session,
            Operand::Host(src),
            Operand::Host(dst),
            len,
            &CancelToken::new(),
        )
        .expect("h2c2h failed");

    // Scattered pages bind tighter than the staging size
    assert!(outcome.report.chunks > len.div_ceil(device.card_info()));
    assert_eq!(card.host().read(dst, len as usize).expect("read dst"), data);
}

#[test]
fn test_dma_time_reported() {
    let (card, device) = attach(SimConfig::new(&DeviceVariant::PICOEVB));
    let session = device.open_session();

    let src = card.host().alloc(0x4000).expect("alloc src");
    let dst = card.host().alloc(0x4000).expect("alloc dst");
    card.host().write(src, &pattern(0x4000, 1)).expect("write");

    let req = DmaRequest {
        src,
        dst,
        len: 0x4000,
        flags: 0,
        dma_time_ns: 0,
    };
    let resp = control::dispatch(
        &device,
        &session,
        &control::frame(Op::H2c2hDma, &req.to_bytes()),
        &CancelToken::new(),
    )
    .expect("h2c2h failed");

    let out = DmaRequest::from_bytes(&resp.data).expect("short response");
    assert!(out.dma_time_ns > 0);
    assert_eq!(out.len, req.len);
    assert!(resp.transfer.is_some());
}

#[test]
fn test_unknown_flags_touch_no_registers() {
    let (card, device) = attach(SimConfig::new(&DeviceVariant::PICOEVB));
    let session = device.open_session();
    let cancel = CancelToken::new();
    let src = card.host().alloc(0x1000).expect("alloc");

    for (op, flags) in [
        (Op::H2c2hDma, 1 << 2),
        (Op::H2cDma, 1 << 1),
        (Op::C2hDma, 1 << 1),
        (Op::H2cDma, u64::MAX),
    ] {
        let req = DmaRequest {
            src,
            dst: src,
            len: 0x100,
            flags,
            dma_time_ns: 0,
        };
        let err = control::dispatch(&device, &session, &control::frame(op, &req.to_bytes()), &cancel)
            .expect_err("flags accepted");
        assert!(matches!(err, Error::InvalidArgument(_)));
    }
    assert_eq!(card.register_writes(), 0);
}

#[test]
fn test_card_range_checked_before_pinning() {
    let (card, device) = attach(SimConfig::new(&DeviceVariant::PICOEVB));
    let session = device.open_session();
    let cancel = CancelToken::new();
    let cap = device.card_info();
    let buf = card.host().alloc(0x1000).expect("alloc");

    assert!(matches!(
        device.h2c_dma(&session, Operand::Host(buf), cap - 1, 2, &cancel),
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        device.c2h_dma(&session, u64::MAX, Operand::Host(buf), 2, &cancel),
        Err(Error::InvalidArgument(_))
    ));
    assert_eq!(card.register_writes(), 0);
    assert_eq!(card.host().pinned_pages(), 0);
}

#[test]
fn test_malformed_frames() {
    let (_card, device) = attach(SimConfig::new(&DeviceVariant::PICOEVB));
    let session = device.open_session();
    let cancel = CancelToken::new();

    let unknown = 42u32.to_ne_bytes();
    assert!(matches!(
        control::dispatch(&device, &session, &unknown, &cancel),
        Err(Error::InvalidArgument(_))
    ));
    assert_eq!(
        control::dispatch(&device, &session, &[3, 0], &cancel),
        Err(Error::Fault)
    );
    assert_eq!(
        control::dispatch(&device, &session, &control::frame(Op::H2cDma, &[0; 12]), &cancel),
        Err(Error::Fault)
    );
}

#[test]
fn test_unpinnable_host_range_faults() {
    let (card, device) = attach(SimConfig::new(&DeviceVariant::PICOEVB).host_size(64 * 1024));
    let session = device.open_session();
    let end = picoevb::sim::HOST_VA_BASE + 64 * 1024;

    assert_eq!(
        device.h2c_dma(&session, Operand::Host(end - 0x10), 0, 0x100, &CancelToken::new()),
        Err(Error::Fault)
    );
    assert_eq!(card.register_writes(), 0);
    assert_eq!(card.host().pinned_pages(), 0);
}

#[test]
fn test_partial_failure_keeps_earlier_chunks() {
    let (card, device) = attach(SimConfig::new(&DeviceVariant::PICOEVB).fragmented_host(false));
    let session = device.open_session();
    let cap = device.card_info();
    let len = 4 * cap;

    let src = card.host().alloc(len).expect("alloc src");
    let dst = card.host().alloc(len).expect("alloc dst");
    let data = pattern(len as usize, 5);
    card.host().write(src, &data).expect("write src");

    // Two runs per chunk: chunk 2's H2C run fails
    card.fail_after(4);
    let err = device
        .h2c2h_dma(
            &session,
            Operand::Host(src),
            Operand::Host(dst),
            len,
            &CancelToken::new(),
        )
        .expect_err("injected failure not reported");
    assert!(matches!(err, Error::Hardware { channel: Channel::H2c, .. }));
    assert_eq!(err.errno(), picoevb::error::errno::EIO);

    let out = card.host().read(dst, len as usize).expect("read dst");
    let split = 2 * cap as usize;
    assert_eq!(&out[..split], &data[..split]);
    assert!(out[split..].iter().all(|&b| b == 0));
    assert_eq!(card.host().pinned_pages(), 0);

    // The engine is usable again
    device
        .h2c2h_dma(
            &session,
            Operand::Host(src),
            Operand::Host(dst),
            len,
            &CancelToken::new(),
        )
        .expect("retry failed");
    assert_eq!(card.host().read(dst, len as usize).expect("read dst"), data);
}

#[test]
fn test_concurrent_requests_never_interleave() {
    let (card, device) = attach(SimConfig::new(&DeviceVariant::PICOEVB));
    let len = 100 * 1024u64;

    let buffers: Vec<(u64, u64, Vec<u8>)> = (0..4)
        .map(|i| {
            let src = card.host().alloc(len).expect("alloc src");
            let dst = card.host().alloc(len).expect("alloc dst");
            let data = pattern(len as usize, i as u8);
            card.host().write(src, &data).expect("write src");
            (src, dst, data)
        })
        .collect();

    thread::scope(|s| {
        for (src, dst, _) in &buffers {
            let device = Arc::clone(&device);
            s.spawn(move || {
                let session = device.open_session();
                for _ in 0..5 {
                    device
                        .h2c2h_dma(
                            &session,
                            Operand::Host(*src),
                            Operand::Host(*dst),
                            len,
                            &CancelToken::new(),
                        )
                        .expect("h2c2h failed");
                }
            });
        }
    });

    let events = card.events();
    assert!(!events.is_empty());
    assert_eq!(events.len() % 2, 0);
    for pair in events.chunks(2) {
        match pair {
            [SimEvent::Start(a), SimEvent::Stop(b)] => assert_eq!(a, b),
            other => panic!("interleaved channel activity: {:?}", other),
        }
    }
    for (_, dst, data) in &buffers {
        assert_eq!(&card.host().read(*dst, len as usize).expect("read"), data);
    }
}

#[test]
fn test_cancelled_wait_aborts_transfer() {
    let (card, device) = attach(SimConfig::new(&DeviceVariant::PICOEVB));
    let session = device.open_session();
    let src = card.host().alloc(0x1000).expect("alloc");

    card.stall(true);
    let cancel = CancelToken::new();
    let canceller = cancel.clone();
    let handle = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        canceller.cancel();
    });
    let err = device
        .h2c_dma(&session, Operand::Host(src), 0, 0x1000, &cancel)
        .expect_err("stalled transfer completed");
    handle.join().expect("canceller panicked");

    assert_eq!(err, Error::Cancelled(Channel::H2c));
    assert!(!err.is_retryable());
    assert!(!device.engine().is_busy());
    assert_eq!(
        card.events(),
        vec![SimEvent::Start(Channel::H2c), SimEvent::Stop(Channel::H2c)]
    );

    card.stall(false);
    device
        .h2c_dma(&session, Operand::Host(src), 0, 0x1000, &CancelToken::new())
        .expect("transfer after cancel failed");
}

#[test]
fn test_teardown_after_hardware_error_and_cancel() {
    let (card, device) = attach(SimConfig::new(&DeviceVariant::PICOEVB));
    let session = device.open_session();
    let buf = card.host().alloc(0x1000).expect("alloc");
    card.host().write(buf, &pattern(0x1000, 9)).expect("write");

    card.fail_after(0);
    let err = device
        .h2c_dma(&session, Operand::Host(buf), 0, 0x1000, &CancelToken::new())
        .expect_err("injected failure not reported");
    assert!(matches!(err, Error::Hardware { channel: Channel::H2c, .. }));
    assert_torn_down(&card, Channel::H2c);

    card.stall(true);
    let cancel = CancelToken::new();
    let canceller = cancel.clone();
    let handle = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        canceller.cancel();
    });
    let err = device
        .c2h_dma(&session, 0, Operand::Host(buf), 0x1000, &cancel)
        .expect_err("stalled transfer completed");
    handle.join().expect("canceller panicked");
    assert_eq!(err, Error::Cancelled(Channel::C2h));
    assert_torn_down(&card, Channel::C2h);
    assert_eq!(card.host().pinned_pages(), 0);

    card.stall(false);
    device
        .h2c_dma(&session, Operand::Host(buf), 0, 0x1000, &CancelToken::new())
        .expect("transfer after teardown failed");
    assert_eq!(card.read_staging(0, 0x1000), pattern(0x1000, 9));
    assert_torn_down(&card, Channel::H2c);
}

#[test]
fn test_exhausted_segment_list_stops_transfer() {
    let (card, device) = attach(SimConfig::new(&DeviceVariant::PICOEVB).fragmented_host(false));
    let src_va = card.host().alloc(0x1000).expect("alloc src");
    card.host().write(src_va, &pattern(0x1000, 21)).expect("write");
    let dst_va = card.host().alloc(0x2000).expect("alloc dst");

    // Contiguous host memory: bus addresses follow the virtual layout
    let mut src = SegmentList::new();
    src.push(HOST_BUS_BASE + (src_va - picoevb::sim::HOST_VA_BASE), 0x1000)
        .expect("push src");
    let mut dst = SegmentList::new();
    dst.push(HOST_BUS_BASE + (dst_va - picoevb::sim::HOST_VA_BASE), 0x2000)
        .expect("push dst");

    let cancel = CancelToken::new();
    let engine = device.engine().acquire(&cancel).expect("acquire");
    let err = transfer::h2c2h(&engine, &src, &dst, 0x2000, device.card_info(), &cancel)
        .expect_err("short source list accepted");
    drop(engine);

    assert!(matches!(err, Error::InvalidArgument(_)));
    assert_eq!(card.runs(), 2);
    let out = card.host().read(dst_va, 0x2000).expect("read dst");
    assert_eq!(&out[..0x1000], &pattern(0x1000, 21)[..]);
    assert!(out[0x1000..].iter().all(|&b| b == 0));
}

#[test]
fn test_dma_time_includes_engine_wait() {
    let (card, device) = attach(SimConfig::new(&DeviceVariant::PICOEVB));
    let session = device.open_session();
    let src = card.host().alloc(0x1000).expect("alloc");
    let held = Duration::from_millis(50);
    let barrier = Barrier::new(2);

    let outcome = thread::scope(|s| {
        s.spawn(|| {
            let engine = device.engine().acquire(&CancelToken::new()).expect("acquire");
            barrier.wait();
            thread::sleep(held);
            drop(engine);
        });
        barrier.wait();
        device
            .h2c_dma(&session, Operand::Host(src), 0, 0x1000, &CancelToken::new())
            .expect("h2c failed")
    });
    assert!(outcome.elapsed >= held);
}

#[test]
fn test_cancelled_acquisition_is_retryable() {
    let (card, device) = attach(SimConfig::new(&DeviceVariant::PICOEVB));
    let session = device.open_session();
    let src = card.host().alloc(0x1000).expect("alloc");

    let cancel = CancelToken::new();
    cancel.cancel();
    let err = device
        .h2c_dma(&session, Operand::Host(src), 0, 0x1000, &cancel)
        .expect_err("cancelled request ran");
    assert_eq!(err, Error::Interrupted);
    assert!(err.is_retryable());
    assert_eq!(card.register_writes(), 0);
}

#[test]
fn test_device_operand_without_provider() {
    let (card, device) = attach(SimConfig::new(&DeviceVariant::PICOEVB).gpu(None, 16));
    let session = device.open_session();
    let dst = card.host().alloc(0x1000).expect("alloc");

    let req = DmaRequest {
        src: 0,
        dst,
        len: 0x100,
        flags: H2C_FLAG_SRC_IS_DEVICE,
        dma_time_ns: 0,
    };
    assert!(matches!(
        control::dispatch(
            &device,
            &session,
            &control::frame(Op::H2cDma, &req.to_bytes()),
            &CancelToken::new()
        ),
        Err(Error::InvalidArgument(_))
    ));

    let req = DmaRequest {
        src: dst,
        dst: 0,
        len: 0x100,
        flags: H2C2H_FLAG_DST_IS_DEVICE,
        dma_time_ns: 0,
    };
    assert!(matches!(
        control::dispatch(
            &device,
            &session,
            &control::frame(Op::H2c2hDma, &req.to_bytes()),
            &CancelToken::new()
        ),
        Err(Error::InvalidArgument(_))
    ));
    assert_eq!(card.register_writes(), 0);
}

#[test]
fn test_led_write() {
    let (card, device) = attach(SimConfig::new(&DeviceVariant::PICOEVB));
    let session = device.open_session();
    control::dispatch(
        &device,
        &session,
        &control::frame(Op::Led, &control::LedRequest { value: 0b101 }.to_bytes()),
        &CancelToken::new(),
    )
    .expect("led failed");
    assert_eq!(card.led(), 0b101);
}
