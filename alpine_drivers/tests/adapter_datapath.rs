//! Packet data path: RX completion and refill, TX posting and reclaim,
//! offload metadata, budget semantics, moderation and the watchdog.

mod common;

use std::sync::Arc;

use alpine_drivers::eth::hal::RingDirection;
use alpine_drivers::eth::moderation::CoalescingMode;
use alpine_drivers::eth::ring::{TXD_L4_CSUM, TXD_VLAN};
use alpine_drivers::eth::{attach, AdapterState};
use alpine_lib::net::net_device::{
    EtherFrameRef, NetDevError, NetDevice, PacketHeaderFlags,
};

use common::{seed_dma_pool, test_config, udp_frame, SimHal};

#[test]
fn test_rx_inject_poll_recv() {
    seed_dma_pool();

    let hal = Arc::new(SimHal::new(4));
    let eth = attach(hal.clone(), &test_config(4)).unwrap();
    eth.up().unwrap();

    let frame = udp_frame(53, 32);
    assert!(hal.inject_rx(1, &frame, None, Some(0xfeed_cafe), true));
    assert!(hal.inject_rx(1, &frame, Some(7), None, false));

    let processed = eth.poll(1, 64).unwrap();
    assert_eq!(processed, 2);

    let first = eth.recv(1).unwrap().expect("first frame");
    assert_eq!(first.data, frame);
    assert_eq!(first.rx_hash, Some(0xfeed_cafe));
    assert!(first.csum_flags.contains(PacketHeaderFlags::UDP_CSUM_IN_OK));
    assert!(first
        .csum_flags
        .contains(PacketHeaderFlags::IPV4_CSUM_IN_OK));
    assert!(first.vlan.is_none());

    let second = eth.recv(1).unwrap().expect("second frame");
    assert_eq!(second.vlan, Some(7));
    assert!(second.rx_hash.is_none());
    assert!(!second
        .csum_flags
        .contains(PacketHeaderFlags::UDP_CSUM_IN_OK));

    assert!(eth.recv(1).unwrap().is_none());

    // Every consumed slot was refilled and republished to the device.
    assert_eq!(hal.pending_rx_slots(1), 64);

    let (rx_stats, _) = eth.queue_stats(1).unwrap();
    assert_eq!(rx_stats.packets, 2);
    assert_eq!(rx_stats.bytes, 2 * frame.len() as u64);
}

#[test]
fn test_rx_budget_exhaustion_and_continuation() {
    seed_dma_pool();

    let hal = Arc::new(SimHal::new(2));
    let eth = attach(hal.clone(), &test_config(2)).unwrap();
    eth.up().unwrap();

    let frame = udp_frame(1000, 16);
    for _ in 0..10 {
        assert!(hal.inject_rx(0, &frame, None, None, true));
    }

    // Exhausted budget: the caller is expected to poll again.
    assert_eq!(eth.poll(0, 4).unwrap(), 4);
    assert_eq!(eth.poll(0, 4).unwrap(), 4);
    assert_eq!(eth.poll(0, 4).unwrap(), 2);
    assert_eq!(eth.poll(0, 4).unwrap(), 0);
}

#[test]
fn test_tx_send_complete_recycle() {
    seed_dma_pool();

    let hal = Arc::new(SimHal::new(2));
    let eth = attach(hal.clone(), &test_config(2)).unwrap();
    eth.up().unwrap();

    let frame = udp_frame(4000, 64);
    eth.send(
        EtherFrameRef {
            data: &frame,
            vlan: None,
            csum_flags: PacketHeaderFlags::empty(),
        },
        1,
    )
    .unwrap();

    // The device sees exactly the posted payload.
    assert_eq!(hal.last_tx_frame(1).unwrap(), frame);

    assert_eq!(hal.complete_tx(1, 1), 1);
    eth.poll(1, 64).unwrap();

    let (_, tx_stats) = eth.queue_stats(1).unwrap();
    assert_eq!(tx_stats.packets, 1);
    assert_eq!(tx_stats.bytes, frame.len() as u64);

    // The completed TX buffer went back through the recycle cache, so a
    // follow-up send reuses it instead of allocating.
    eth.send(
        EtherFrameRef {
            data: &frame,
            vlan: None,
            csum_flags: PacketHeaderFlags::empty(),
        },
        1,
    )
    .unwrap();
    assert!(eth.pool_stats(1).unwrap().recycled >= 1);
}

#[test]
fn test_tx_ring_full_is_soft_busy() {
    seed_dma_pool();

    let hal = Arc::new(SimHal::new(2));
    let eth = attach(hal.clone(), &test_config(2)).unwrap();
    eth.up().unwrap();

    let frame = udp_frame(4000, 16);
    let frame_ref = EtherFrameRef {
        data: &frame,
        vlan: None,
        csum_flags: PacketHeaderFlags::empty(),
    };

    for _ in 0..64 {
        eth.send(frame_ref.clone(), 0).unwrap();
    }

    assert_eq!(eth.send(frame_ref.clone(), 0).unwrap_err(), NetDevError::Busy);
    let (_, tx_stats) = eth.queue_stats(0).unwrap();
    assert!(tx_stats.ring_full >= 1);

    // Completions free slots and sending resumes.
    hal.complete_tx(0, 8);
    eth.poll(0, 64).unwrap();
    eth.send(frame_ref, 0).unwrap();
}

#[test]
fn test_tx_checksum_offload_metadata() {
    seed_dma_pool();

    let hal = Arc::new(SimHal::new(2));
    let eth = attach(hal.clone(), &test_config(2)).unwrap();
    eth.up().unwrap();

    let frame = udp_frame(4000, 32);
    eth.send(
        EtherFrameRef {
            data: &frame,
            vlan: Some(42),
            csum_flags: PacketHeaderFlags::UDP_CSUM_OUT | PacketHeaderFlags::IPV4_CSUM_OUT,
        },
        0,
    )
    .unwrap();

    let desc = hal.last_tx_desc(0).unwrap();
    assert!(desc.len_flags & TXD_L4_CSUM != 0);
    assert!(desc.len_flags & TXD_VLAN != 0);
    assert_eq!(desc.meta & 0xffff, 42);
    // L3 header starts after the Ethernet header; the UDP checksum field
    // sits 6 bytes into the L4 header (14 + 20 + 6 = 40).
    assert_eq!((desc.meta >> 16) & 0xff, 14);
    assert_eq!((desc.meta >> 24) & 0xff, 40);
}

#[test]
fn test_adaptive_moderation_reprograms_interval() {
    seed_dma_pool();

    let hal = Arc::new(SimHal::new(2));
    let eth = attach(hal.clone(), &test_config(2)).unwrap();
    eth.up().unwrap();

    // Lowest level programs interval 0 at bring-up.
    assert_eq!(hal.coalescing(RingDirection::Rx, 0), 0);

    let frame = udp_frame(1000, 16);
    for _ in 0..40 {
        assert!(hal.inject_rx(0, &frame, None, None, true));
    }
    eth.poll(0, 64).unwrap();

    // 40 packets in one decision interval pushes the queue off the
    // lowest level, and the smoothed interval lands on the device.
    assert!(hal.coalescing(RingDirection::Rx, 0) > 0);
}

#[test]
fn test_fixed_coalescing_bypasses_adaptive() {
    seed_dma_pool();

    let hal = Arc::new(SimHal::new(2));
    let eth = attach(hal.clone(), &test_config(2)).unwrap();
    eth.up().unwrap();

    eth.set_coalescing_mode(RingDirection::Rx, CoalescingMode::Fixed(99))
        .unwrap();
    assert_eq!(hal.coalescing(RingDirection::Rx, 0), 99);
    assert_eq!(hal.coalescing(RingDirection::Rx, 1), 99);

    let frame = udp_frame(1000, 16);
    for _ in 0..40 {
        assert!(hal.inject_rx(0, &frame, None, None, true));
    }
    eth.poll(0, 64).unwrap();

    // Traffic no longer moves the programmed interval.
    assert_eq!(hal.coalescing(RingDirection::Rx, 0), 99);
}

#[test]
fn test_tx_watchdog_escalates_to_deferred_reset() {
    seed_dma_pool();

    let hal = Arc::new(SimHal::new(2));
    let eth = attach(hal.clone(), &test_config(2)).unwrap();
    eth.up().unwrap();

    let flrs = hal.flr_count();

    // Post a frame the device never completes.
    let frame = udp_frame(4000, 16);
    eth.send(
        EtherFrameRef {
            data: &frame,
            vlan: None,
            csum_flags: PacketHeaderFlags::empty(),
        },
        0,
    )
    .unwrap();

    // The stall is detected after the timeout ticks, and the reset runs
    // on a later tick, never in the detecting one.
    for _ in 0..5 {
        eth.tick().unwrap();
        assert_eq!(hal.flr_count(), flrs);
    }
    eth.tick().unwrap();

    assert!(hal.flr_count() > flrs, "deferred reset should have run");
    assert_eq!(eth.adapter_state(), AdapterState::Up);
}

#[test]
fn test_device_stats_aggregate() {
    seed_dma_pool();

    let hal = Arc::new(SimHal::new(2));
    let eth = attach(hal.clone(), &test_config(2)).unwrap();
    eth.up().unwrap();

    let frame = udp_frame(1234, 16);
    for _ in 0..3 {
        assert!(hal.inject_rx(0, &frame, None, None, true));
    }
    eth.poll(0, 64).unwrap();

    eth.send(
        EtherFrameRef {
            data: &frame,
            vlan: None,
            csum_flags: PacketHeaderFlags::empty(),
        },
        1,
    )
    .unwrap();
    hal.complete_tx(1, 1);
    eth.poll(1, 64).unwrap();

    let stats = eth.device_stats();
    assert_eq!(stats.rx_pkts, 3);
    assert_eq!(stats.tx_pkts, 1);
    assert_eq!(stats.mac_rx_frames, 3);
    assert_eq!(stats.mac_tx_frames, 1);
}
