// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

use std::sync::Arc;

use qdma::ring::IndexRing;
use qdma::{
    DevConf, Device, Error, Generation, HwQueue, LoopbackQueue, OpFlags, Portal, ProtocolError,
    Resource, SgBuf, VchanConf, VchanOptions,
};

fn device_with(queues: Vec<Arc<LoopbackQueue>>) -> Device {
    let dyn_queues = queues
        .iter()
        .map(|q| q.clone() as Arc<dyn HwQueue>)
        .collect();
    Device::open(0, "dpdmai.0", Generation::Lx2160, dyn_queues).expect("open failed")
}

fn copying_queue(id: u32, depth: usize) -> Arc<LoopbackQueue> {
    // SAFETY: every test keeps its buffers alive until the copies are submitted
    Arc::new(unsafe { LoopbackQueue::new(id, depth).with_memory_copy() })
}

fn vchan(nb_desc: usize, short_fd: bool) -> VchanConf {
    VchanConf {
        nb_desc,
        options: VchanOptions {
            short_fd,
            ..Default::default()
        },
        ..Default::default()
    }
}

fn start(dev: &mut Device, conf: DevConf, vchans: &[VchanConf]) {
    dev.configure(conf).expect("configure failed");
    for (i, vconf) in vchans.iter().enumerate() {
        dev.vchan_setup(i as u16, *vconf).expect("vchan setup failed");
    }
    dev.start().expect("start failed");
}

/// Poll until `want` completions arrived on `vchan`
fn collect(dev: &mut Device, portal: &mut Portal, vchan: u16, want: usize) -> Vec<u16> {
    let mut got = Vec::new();
    let mut out = [0u16; 64];
    for _ in 0..1000 {
        if got.len() >= want {
            break;
        }
        let n = dev.completed(portal, vchan, &mut out).expect("completed failed");
        got.extend_from_slice(&out[..n]);
    }
    got
}

#[test]
fn test_64_short_copies_complete_in_order() {
    const LEN: usize = 4096;
    let hw = copying_queue(0, 256);
    let mut dev = device_with(vec![hw.clone()]);
    let mut portal = Portal::new(0);
    start(&mut dev, DevConf::default(), &[vchan(64, true)]);

    let src: Vec<u8> = (0..64 * LEN).map(|i| (i % 251) as u8).collect();
    let mut dst = vec![0u8; 64 * LEN];

    for i in 0..64 {
        let idx = dev
            .copy(
                &mut portal,
                0,
                src[i * LEN..].as_ptr() as u64,
                dst[i * LEN..].as_mut_ptr() as u64,
                LEN as u32,
                OpFlags::SUBMIT,
            )
            .expect("copy failed");
        assert_eq!(idx, i as u16);
    }

    let got = collect(&mut dev, &mut portal, 0, 64);
    assert_eq!(got, (0..64).collect::<Vec<u16>>());
    assert_eq!(src, dst);

    let stats = dev.stats(Some(0)).unwrap();
    assert_eq!(stats.submitted, 64);
    assert_eq!(stats.completed, 64);
    assert_eq!(stats.in_flight(), 0);
}

#[test]
fn test_sg_over_max_rejected() {
    let mut dev = device_with(vec![Arc::new(LoopbackQueue::new(0, 64))]);
    let mut portal = Portal::new(0);
    let conf = DevConf {
        max_sg: 32,
        ..Default::default()
    };
    start(&mut dev, conf, &[vchan(128, false)]);

    let bufs = vec![SgBuf::new(0x1000, 64); 33];
    let err = dev
        .copy_sg(&mut portal, 0, &bufs, &bufs, None, OpFlags::SUBMIT)
        .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
    assert_eq!(err.errno(), -22);
    assert_eq!(dev.stats(Some(0)).unwrap().submitted, 0);

    // 32 entries fit
    dev.copy_sg(&mut portal, 0, &bufs[..32], &bufs[..32], None, OpFlags::SUBMIT)
        .expect("copy_sg failed");
    assert_eq!(dev.stats(Some(0)).unwrap().submitted, 32);
}

#[test]
fn test_sg_over_descriptor_budget_rejected() {
    let mut dev = device_with(vec![Arc::new(LoopbackQueue::new(0, 64))]);
    let mut portal = Portal::new(0);
    start(&mut dev, DevConf::default(), &[vchan(8, false)]);

    let bufs = vec![SgBuf::new(0x1000, 64); 16];
    let err = dev
        .copy_sg(&mut portal, 0, &bufs, &bufs, None, OpFlags::SUBMIT)
        .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
    assert!(!err.is_retryable());
    assert_eq!(dev.stats(Some(0)).unwrap().submitted, 0);
    assert_eq!(dev.burst_capacity(0).unwrap(), 8);
}

#[test]
fn test_sg_count_mismatch_not_supported() {
    let mut dev = device_with(vec![Arc::new(LoopbackQueue::new(0, 64))]);
    let mut portal = Portal::new(0);
    start(&mut dev, DevConf::default(), &[vchan(16, false)]);

    let buf = SgBuf::new(0x1000, 64);
    let err = dev
        .copy_sg(&mut portal, 0, &[buf, buf, buf], &[buf, buf], None, OpFlags::empty())
        .unwrap_err();
    assert!(matches!(err, Error::NotSupported(_)));
    assert_eq!(err.errno(), -95);
    assert_eq!(dev.stats(Some(0)).unwrap().submitted, 0);
}

#[test]
fn test_sg_total_length_and_data() {
    let hw = copying_queue(0, 64);
    let mut dev = device_with(vec![hw.clone()]);
    let mut portal = Portal::new(0);
    start(&mut dev, DevConf::default(), &[vchan(16, false)]);

    let lens = [100usize, 1, 4000, 37];
    let src: Vec<Vec<u8>> = lens
        .iter()
        .enumerate()
        .map(|(i, &len)| vec![i as u8 + 1; len])
        .collect();
    let mut dst: Vec<Vec<u8>> = lens.iter().map(|&len| vec![0u8; len]).collect();

    let src_sg: Vec<SgBuf> = src
        .iter()
        .map(|b| SgBuf::new(b.as_ptr() as u64, b.len() as u32))
        .collect();
    let dst_sg: Vec<SgBuf> = dst
        .iter_mut()
        .map(|b| SgBuf::new(b.as_mut_ptr() as u64, b.len() as u32))
        .collect();

    let last = dev
        .copy_sg(&mut portal, 0, &src_sg, &dst_sg, Some(&[10, 11, 12, 13]), OpFlags::SUBMIT)
        .expect("copy_sg failed");
    assert_eq!(last, 13);

    assert_eq!(collect(&mut dev, &mut portal, 0, 4), vec![10, 11, 12, 13]);
    assert_eq!(src, dst);
}

#[test]
fn test_long_format_moves_data() {
    let hw = copying_queue(0, 64);
    let mut dev = device_with(vec![hw.clone()]);
    let mut portal = Portal::new(0);
    let conf = VchanConf {
        options: VchanOptions {
            pre_populate: true,
            ..Default::default()
        },
        ..vchan(8, false)
    };
    start(&mut dev, DevConf::default(), &[conf]);

    let src: Vec<u8> = (0..=255).collect();
    for round in 0..20 {
        let mut dst = vec![0u8; 256];
        dev.copy(
            &mut portal,
            0,
            src.as_ptr() as u64,
            dst.as_mut_ptr() as u64,
            256,
            OpFlags::SUBMIT,
        )
        .expect("copy failed");
        assert_eq!(src, dst, "round {}", round);
        assert_eq!(collect(&mut dev, &mut portal, 0, 1), vec![round as u16]);
    }
}

#[test]
fn test_ring_fill_and_reject() {
    let mut ring = IndexRing::for_channel(64).expect("ring");
    assert_eq!(ring.usable(), 64);
    for i in 0..64u16 {
        ring.enqueue(&[i]).expect("enqueue below capacity");
    }
    assert_eq!(ring.free_space(), 0);
    assert_eq!(
        ring.enqueue(&[999]),
        Err(Error::ResourceExhausted(Resource::IndexRing))
    );

    let mut out = [0u16; 1];
    assert_eq!(ring.dequeue(&mut out), 1);
    assert_eq!(out[0], 0);
    ring.enqueue(&[999]).expect("space freed by dequeue");
}

#[test]
fn test_close_twice_is_noop() {
    let mut dev = device_with(vec![Arc::new(LoopbackQueue::new(0, 64))]);
    start(&mut dev, DevConf::default(), &[vchan(8, true)]);
    dev.stop().unwrap();

    dev.close_vchan(0).unwrap();
    dev.close_vchan(0).unwrap();
    dev.close().unwrap();
    dev.close().unwrap();
}

#[test]
fn test_descriptor_budget_then_recover() {
    let mut dev = device_with(vec![Arc::new(LoopbackQueue::new(0, 64))]);
    let mut portal = Portal::new(0);
    start(&mut dev, DevConf::default(), &[vchan(4, false)]);

    for _ in 0..4 {
        dev.copy(&mut portal, 0, 0, 0, 8, OpFlags::empty()).unwrap();
    }
    let err = dev
        .copy(&mut portal, 0, 0, 0, 8, OpFlags::empty())
        .unwrap_err();
    assert_eq!(err, Error::ResourceExhausted(Resource::Descriptors));
    assert!(err.is_retryable());
    assert_eq!(dev.burst_capacity(0), Ok(0));

    dev.submit(&mut portal, 0).unwrap();
    assert_eq!(collect(&mut dev, &mut portal, 0, 4), vec![0, 1, 2, 3]);
    assert_eq!(dev.copy(&mut portal, 0, 0, 0, 8, OpFlags::empty()), Ok(4));
}

#[test]
fn test_shared_queue_interleaved_channels() {
    let hw = Arc::new(LoopbackQueue::new(0, 512));
    let mut dev = device_with(vec![hw.clone()]);
    let mut portal = Portal::new(0);
    let conf = DevConf {
        nb_vchans: 3,
        max_sg: 4,
        ..Default::default()
    };
    start(
        &mut dev,
        conf,
        &[vchan(16, true), vchan(16, false), vchan(16, false)],
    );

    let buf = [SgBuf::new(0x4000, 16); 3];
    let mut expected: [Vec<u16>; 3] = Default::default();
    let mut got: [Vec<u16>; 3] = Default::default();
    let mut out = [0u16; 16];

    for round in 0..200u32 {
        let vchan = (round % 3) as u16;
        let result = if vchan == 2 {
            dev.copy_sg(&mut portal, vchan, &buf, &buf, None, OpFlags::SUBMIT)
        } else {
            dev.copy(&mut portal, vchan, 0, 0, 8, OpFlags::SUBMIT)
        };

        match result {
            Ok(last) => {
                let n = if vchan == 2 { 3 } else { 1 };
                let first = last + 1 - n;
                expected[usize::from(vchan)].extend(first..=last);
            }
            Err(err) => assert!(err.is_retryable(), "{}", err),
        }

        // Drain a different channel than the one just fed
        let poll = ((round + 1) % 3) as u16;
        let n = dev.completed(&mut portal, poll, &mut out).unwrap();
        got[usize::from(poll)].extend_from_slice(&out[..n]);
    }

    // Each channel finishes on its own polls, whichever pull carried its frames
    for vchan in 0..3u16 {
        let v = usize::from(vchan);
        let missing = expected[v].len() - got[v].len();
        got[v].extend(collect(&mut dev, &mut portal, vchan, missing));
    }

    assert_eq!(got, expected);
    assert_eq!(dev.stats(None).unwrap().in_flight(), 0);
}

#[test]
fn test_busy_hardware_retry_and_resubmit() {
    let hw = Arc::new(LoopbackQueue::new(0, 64));
    let mut dev = device_with(vec![hw.clone()]);
    let mut portal = Portal::new(0);
    let conf = DevConf {
        busy_retry_limit: 4,
        ..Default::default()
    };
    start(&mut dev, conf, &[vchan(32, true)]);

    for _ in 0..10 {
        dev.copy(&mut portal, 0, 0, 0, 1, OpFlags::empty()).unwrap();
    }

    // Within the retry limit the busy signal is absorbed
    hw.set_busy(3);
    hw.set_accept_limit(Some(4));
    dev.submit(&mut portal, 0).expect("submit within retry limit");
    assert_eq!(hw.accepted(), 10);

    for _ in 0..5 {
        dev.copy(&mut portal, 0, 0, 0, 1, OpFlags::empty()).unwrap();
    }
    hw.set_busy(100);
    assert_eq!(
        dev.submit(&mut portal, 0),
        Err(Error::HardwareBusy { pending: 5 })
    );
    hw.set_busy(0);
    dev.submit(&mut portal, 0).expect("resubmit");

    assert_eq!(collect(&mut dev, &mut portal, 0, 15), (0..15).collect::<Vec<u16>>());
    assert_eq!(dev.stats(Some(0)).unwrap().enqueued, 15);
}

#[test]
fn test_protocol_error_isolated() {
    let bad_queue = Arc::new(LoopbackQueue::new(0, 64));
    let good_queue = Arc::new(LoopbackQueue::new(1, 64));
    let mut dev = device_with(vec![bad_queue.clone(), good_queue.clone()]);
    let mut portal = Portal::new(0);
    let conf = DevConf {
        nb_vchans: 2,
        ..Default::default()
    };
    let second = VchanConf {
        queue: 1,
        ..vchan(8, false)
    };
    start(&mut dev, conf, &[vchan(8, false), second]);

    dev.copy(&mut portal, 1, 0, 0, 4, OpFlags::SUBMIT).unwrap();
    dev.copy(&mut portal, 0, 0, 0, 4, OpFlags::SUBMIT).unwrap();

    let mut bogus = qdma::FrameDesc::short(0, 0, 4, 0, true, 0);
    bogus.set_attribute(7 << 13, true);
    bad_queue.inject_frame(bogus);

    // The good frame ahead of the bad one is kept
    let mut out = [0u16; 8];
    assert_eq!(
        dev.completed(&mut portal, 0, &mut out),
        Err(Error::Protocol(ProtocolError::UnknownFormat(7)))
    );
    assert_eq!(dev.completed(&mut portal, 0, &mut out), Ok(1));
    assert_eq!(out[0], 0);
    assert_eq!(dev.stats(Some(0)).unwrap().errors, 1);

    assert_eq!(collect(&mut dev, &mut portal, 1, 1), vec![0]);
    assert_eq!(dev.stats(Some(1)).unwrap().errors, 0);
}

#[test]
fn test_bad_frame_does_not_strand_sibling() {
    let hw = Arc::new(LoopbackQueue::new(0, 64));
    let mut dev = device_with(vec![hw.clone()]);
    let mut portal = Portal::new(0);
    let conf = DevConf {
        nb_vchans: 2,
        ..Default::default()
    };
    start(&mut dev, conf, &[vchan(8, true), vchan(8, false)]);

    let mut bogus = qdma::FrameDesc::short(0, 0, 4, 0, true, 0);
    bogus.set_attribute(6 << 13, true);
    hw.inject_frame(bogus);
    dev.copy(&mut portal, 1, 0, 0, 4, OpFlags::SUBMIT).unwrap();

    let mut out = [0u16; 8];
    assert_eq!(
        dev.completed(&mut portal, 0, &mut out),
        Err(Error::Protocol(ProtocolError::UnknownFormat(6)))
    );
    assert_eq!(collect(&mut dev, &mut portal, 1, 1), vec![0]);
    assert_eq!(dev.stats(Some(1)).unwrap().in_flight(), 0);
    assert_eq!(dev.stats(Some(1)).unwrap().errors, 0);
    assert_eq!(dev.stats(Some(0)).unwrap().errors, 1);

    dev.stop().unwrap();
    dev.close_vchan(1).expect("sibling still holds work");
    dev.close_vchan(0).unwrap();
}

#[test]
fn test_idle_channel_does_not_strand_sibling() {
    let hw = Arc::new(LoopbackQueue::new(0, 128));
    let mut dev = device_with(vec![hw.clone()]);
    let mut portal = Portal::new(0);
    let conf = DevConf {
        nb_vchans: 2,
        ..Default::default()
    };
    start(&mut dev, conf, &[vchan(64, true), vchan(8, true)]);

    // More than one pull's worth, harvested in a single call
    for _ in 0..40 {
        dev.copy(&mut portal, 0, 0, 0, 8, OpFlags::SUBMIT).unwrap();
    }
    let mut out = [0u16; 64];
    assert_eq!(dev.completed(&mut portal, 0, &mut out), Ok(40));

    // Channel 0 is never polled again
    dev.copy(&mut portal, 1, 0, 0, 8, OpFlags::SUBMIT).unwrap();
    assert_eq!(collect(&mut dev, &mut portal, 1, 1), vec![0]);
    assert_eq!(dev.stats(Some(1)).unwrap().in_flight(), 0);
    assert_eq!(dev.stats(None).unwrap().in_flight(), 0);
}

#[test]
fn test_silent_mode_moves_data() {
    let hw = copying_queue(0, 64);
    let mut dev = device_with(vec![hw.clone()]);
    let mut portal = Portal::new(0);
    let conf = DevConf {
        enable_silent: true,
        ..Default::default()
    };
    start(&mut dev, conf, &[vchan(2, false)]);

    let src = vec![0x5Au8; 1024];
    let mut dst = vec![vec![0u8; 1024]; 10];
    for buf in dst.iter_mut() {
        dev.copy(
            &mut portal,
            0,
            src.as_ptr() as u64,
            buf.as_mut_ptr() as u64,
            1024,
            OpFlags::empty().with_caller_index(4000),
        )
        .expect("silent copy");
    }
    dev.submit(&mut portal, 0).unwrap();

    assert!(dst.iter().all(|buf| *buf == src));
    assert_eq!(hw.returned(), 0);
    assert_eq!(dev.stats(Some(0)).unwrap().submitted, 10);
    dev.stop().unwrap();
    dev.close().unwrap();
}

#[test]
fn test_route_by_port_channel() {
    use qdma::{Direction, Port, PortParam};

    let mut dev = device_with(vec![Arc::new(LoopbackQueue::new(0, 64))]);
    let mut portal = Portal::new(0);
    let conf = VchanConf {
        direction: Direction::DevToMem,
        src_port: Port::Pcie(PortParam {
            port_id: 2,
            pf_id: 1,
            vf_enable: false,
            vf_id: 0,
        }),
        options: VchanOptions::parse("short_fd=1,desc_debug=1").unwrap(),
        ..vchan(8, true)
    };
    start(&mut dev, DevConf::default(), &[conf]);

    let vq = dev.vchan(0).unwrap();
    assert!(vq.route().rbp);
    assert!(vq.route().src_sdd.route_by_port());
    assert_eq!(vq.route().src_sdd.port_id(), 2);
    assert_eq!(vq.route().src_sdd.pf_id(), 1);

    dev.copy(&mut portal, 0, 0x1000, 0x2000, 64, OpFlags::SUBMIT)
        .unwrap();
    assert_eq!(collect(&mut dev, &mut portal, 0, 1), vec![0]);
}
