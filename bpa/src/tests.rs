/*!
End-to-end scenarios driving a whole agent core: storage flushing on link
restoration, custody transfer and acknowledgement, lifetime expiry, and
the agent's public blocking surface.
*/

use crate::clock::ManualClock;
use crate::config::Config;
use crate::core::Core;
use crate::dataservice::SocketParams;
use crate::route::INTF_AVAILABLE_FLAGS;
use crate::status::Status;
use crate::{BpAgent, intf_flags};
use tern_bpv7::{
    BlockType, BundleFlags, CanonicalBlock, CreationTimestamp, CrcType, CustodyAcceptPayload,
    DtnTime, Eid, ExtensionData, PrimaryBlock,
};
use tern_mpool::{DeliveryPolicy, Handle};

const START_MS: u64 = 1_000_000;

struct Rig {
    core: Core,
    clock: ManualClock,
    cla: Handle,
}

/// Node 100 with a storage cache at service 64, one CLA carrying nodes
/// 200 and 50 (initially DOWN), and a wildcard route steering
/// storage-bound traffic into the base interface.
fn setup() -> Rig {
    let clock = ManualClock::new(START_MS);
    let mut core = Core::new(&Config::default(), Box::new(clock.handle()));

    let base = core.add_base_intf(100).unwrap();
    core.route_add(100, u64::MAX, base).unwrap();
    core.route_add(0, 0, base).unwrap();

    let cache_intf = core.attach_cache((100, 64)).unwrap();

    let cla = core.create_cla_intf().unwrap();
    core.route_add(200, u64::MAX, cla).unwrap();
    core.route_add(50, u64::MAX, cla).unwrap();

    core.intf_set_flags(base, INTF_AVAILABLE_FLAGS).unwrap();
    core.intf_set_flags(cache_intf, INTF_AVAILABLE_FLAGS).unwrap();

    Rig { core, clock, cla }
}

fn ipn(node: u64, service: u64) -> Eid {
    Eid::Ipn { node, service }
}

/// Assembles a wire bundle out of a primary block and canonical blocks.
fn assemble(primary: &PrimaryBlock, canonicals: &[(CanonicalBlock, Vec<u8>)]) -> Vec<u8> {
    let mut wire = vec![0x9F];
    let (pbytes, _) = primary.emit();
    wire.extend_from_slice(&pbytes);
    for (block, content) in canonicals {
        let (cbytes, _, _) = block.emit_with_content(content);
        wire.extend_from_slice(&cbytes);
    }
    wire.push(0xFF);
    wire
}

fn build_dacs_wire(
    dest: Eid,
    source: Eid,
    flow_source: Eid,
    seqs: &[u64],
    now: u64,
) -> Vec<u8> {
    let primary = PrimaryBlock {
        flags: BundleFlags {
            is_admin_record: true,
            must_not_fragment: true,
            ..Default::default()
        },
        crc_type: CrcType::Crc16X25,
        destination: dest,
        source,
        report_to: source,
        timestamp: CreationTimestamp {
            time: DtnTime::new(now),
            sequence_number: 7,
        },
        lifetime: 86_400_000,
        ..Default::default()
    };
    let payload = CustodyAcceptPayload {
        flow_source_eid: flow_source,
        sequence_nums: seqs.iter().copied().collect(),
    };
    let content = ExtensionData::CustodyAccept(payload).emit_content().unwrap();
    let block = CanonicalBlock {
        block_type: BlockType::CustodyAcceptPayload,
        block_num: 1,
        crc_type: CrcType::Crc16X25,
        ..Default::default()
    };
    assemble(&primary, &[(block, content)])
}

fn build_custody_bundle_wire(
    dest: Eid,
    source: Eid,
    custodian: Eid,
    seq: u64,
    now: u64,
) -> Vec<u8> {
    let primary = PrimaryBlock {
        flags: BundleFlags {
            must_not_fragment: true,
            ..Default::default()
        },
        crc_type: CrcType::Crc16X25,
        destination: dest,
        source,
        report_to: source,
        timestamp: CreationTimestamp {
            time: DtnTime::new(now),
            sequence_number: seq,
        },
        lifetime: 3_600_000,
        ..Default::default()
    };
    let payload_block = CanonicalBlock {
        block_type: BlockType::Payload,
        block_num: 1,
        crc_type: CrcType::Crc16X25,
        ..Default::default()
    };
    let custody_block = CanonicalBlock {
        block_type: BlockType::CustodyTracking,
        block_num: 2,
        crc_type: CrcType::Crc16X25,
        ..Default::default()
    };
    let custody_content = ExtensionData::CustodyTracking(custodian)
        .emit_content()
        .unwrap();
    assemble(
        &primary,
        &[
            (payload_block, b"observation data".to_vec()),
            (custody_block, custody_content),
        ],
    )
}

/// Ten bundles sent while the CLA is down all land in storage and appear
/// in the destination index; bringing the CLA up flushes all ten to its
/// egress in insertion order.
#[test]
fn stored_bundles_flush_when_cla_comes_up() {
    let mut rig = setup();
    let sock = rig.core.create_socket(SocketParams::default());
    rig.core.socket_bind(sock, (100, 5)).unwrap();
    rig.core.socket_connect(sock, (200, 1)).unwrap();

    for i in 0..10 {
        rig.core
            .socket_send_once(sock, format!("frame {i}").as_bytes())
            .unwrap();
    }
    rig.core.do_maintenance();

    let cache = rig.core.cache_state(0);
    assert_eq!(cache.live_entry_count(), 10);
    assert_eq!(cache.dest_index_count(200), 10);

    // nothing reaches the CLA while it is down
    let mut buf = vec![0u8; 4096];
    assert!(rig.core.cla_egress_once(rig.cla, &mut buf).unwrap().is_none());

    rig.core.intf_set_flags(rig.cla, INTF_AVAILABLE_FLAGS).unwrap();
    rig.core.do_maintenance();

    for expected_seq in 0..10u64 {
        let n = rig
            .core
            .cla_egress_once(rig.cla, &mut buf)
            .unwrap()
            .expect("bundle waiting for CLA");
        assert_eq!(buf[n - 1], 0xFF);
        let (pri, _) = PrimaryBlock::parse(&buf[1..n]).unwrap();
        assert_eq!(pri.timestamp.sequence_number, expected_seq);
        assert_eq!(pri.destination, ipn(200, 1));
    }
    assert!(rig.core.cla_egress_once(rig.cla, &mut buf).unwrap().is_none());
}

/// A custody-tracked bundle stays in storage until the matching custody
/// acknowledgement arrives; the ack clears the awaiting-custody flag and
/// the next evaluation removes the entry.
#[test]
fn custody_ack_releases_stored_bundle() {
    let mut rig = setup();
    let sock = rig.core.create_socket(SocketParams {
        delivery_policy: DeliveryPolicy::CustodyTracking,
        ..Default::default()
    });
    rig.core.socket_bind(sock, (100, 5)).unwrap();
    rig.core.socket_connect(sock, (200, 1)).unwrap();

    rig.core.socket_send_once(sock, b"custody cargo").unwrap();
    rig.core.do_maintenance();
    assert_eq!(rig.core.cache_state(0).live_entry_count(), 1);

    // let the bundle egress; custody keeps the entry retained
    rig.core.intf_set_flags(rig.cla, INTF_AVAILABLE_FLAGS).unwrap();
    rig.core.do_maintenance();
    let mut buf = vec![0u8; 4096];
    let n = rig
        .core
        .cla_egress_once(rig.cla, &mut buf)
        .unwrap()
        .expect("custody bundle egressed");
    rig.core.do_maintenance();
    assert_eq!(rig.core.cache_state(0).live_entry_count(), 1);

    // the egressed form carries the custody block naming this node
    let (pri, plen) = PrimaryBlock::parse(&buf[1..n]).unwrap();
    assert_eq!(pri.source, ipn(100, 5));
    let mut pos = 1 + plen;
    let mut custodian = None;
    while buf[pos] != 0xFF {
        let (block, ext, _, len) = CanonicalBlock::parse(&buf[pos..n], false).unwrap();
        if let ExtensionData::CustodyTracking(eid) = ext {
            assert_eq!(block.block_type, BlockType::CustodyTracking);
            custodian = Some(eid);
        }
        pos += len;
    }
    assert_eq!(custodian, Some(ipn(100, 64)));

    // downstream custodian acknowledges sequence 0 of source 100.5
    let wire = build_dacs_wire(ipn(100, 64), ipn(200, 64), ipn(100, 5), &[0], START_MS);
    rig.core.cla_ingress_once(rig.cla, &wire).unwrap().unwrap();
    rig.core.do_maintenance();
    rig.core.do_maintenance();
    assert_eq!(rig.core.cache_state(0).live_entry_count(), 0);
}

/// Custody-marked bundles relayed through this node coalesce into one
/// DACS per previous-custodian/source pair, carrying exactly the received
/// sequence numbers in order of receipt.
#[test]
fn dacs_accumulates_acknowledgements_in_order() {
    let mut rig = setup();
    rig.core.intf_set_flags(rig.cla, INTF_AVAILABLE_FLAGS).unwrap();

    for seq in [11u64, 12] {
        let wire =
            build_custody_bundle_wire(ipn(100, 5), ipn(50, 5), ipn(50, 64), seq, START_MS);
        rig.core.cla_ingress_once(rig.cla, &wire).unwrap().unwrap();
    }
    rig.core.do_maintenance();

    // two retained bundles plus the open DACS collector
    assert_eq!(rig.core.cache_state(0).live_entry_count(), 3);

    // the collection window closes (allowing for time-bucket rounding)
    // and the DACS routes out
    rig.clock.advance(4_000);
    rig.core.do_maintenance();
    rig.core.do_maintenance();

    let mut buf = vec![0u8; 4096];
    let n = rig
        .core
        .cla_egress_once(rig.cla, &mut buf)
        .unwrap()
        .expect("DACS egressed");
    let (pri, plen) = PrimaryBlock::parse(&buf[1..n]).unwrap();
    assert!(pri.flags.is_admin_record);
    assert_eq!(pri.destination, ipn(50, 64));
    assert_eq!(pri.source, ipn(100, 64));

    let (block, ext, _, _) = CanonicalBlock::parse(&buf[1 + plen..n - 1], true).unwrap();
    assert_eq!(block.block_type, BlockType::CustodyAcceptPayload);
    match ext {
        ExtensionData::CustodyAccept(payload) => {
            assert_eq!(payload.flow_source_eid, ipn(50, 5));
            assert_eq!(payload.sequence_nums.as_slice(), &[11, 12]);
        }
        other => panic!("expected custody acceptance, got {other:?}"),
    }
}

/// A DACS that reaches its sequence capacity closes immediately, without
/// waiting for the collection window to lapse.
#[test]
fn full_dacs_closes_before_window_expires() {
    let mut rig = setup();
    rig.core.intf_set_flags(rig.cla, INTF_AVAILABLE_FLAGS).unwrap();

    for seq in 0..64u64 {
        let wire =
            build_custody_bundle_wire(ipn(100, 5), ipn(50, 5), ipn(50, 64), seq, START_MS);
        rig.core.cla_ingress_once(rig.cla, &wire).unwrap().unwrap();
    }
    // note: the clock never advances past the 2.5 s open window
    rig.core.do_maintenance();
    rig.core.do_maintenance();

    let mut buf = vec![0u8; 4096];
    let n = rig
        .core
        .cla_egress_once(rig.cla, &mut buf)
        .unwrap()
        .expect("full DACS egressed early");
    let (pri, plen) = PrimaryBlock::parse(&buf[1..n]).unwrap();
    assert!(pri.flags.is_admin_record);
    let (_, ext, _, _) = CanonicalBlock::parse(&buf[1 + plen..n - 1], true).unwrap();
    match ext {
        ExtensionData::CustodyAccept(payload) => {
            assert_eq!(payload.sequence_nums.len(), 64);
            let expected: Vec<u64> = (0..64).collect();
            assert_eq!(payload.sequence_nums.as_slice(), expected.as_slice());
        }
        other => panic!("expected custody acceptance, got {other:?}"),
    }
}

/// An expired bundle leaves the idle list, transits the expired list, is
/// removed from every index, and its pool memory is reclaimed.
#[test]
fn lifetime_expiry_releases_entry_and_memory() {
    let mut rig = setup();
    let sock = rig.core.create_socket(SocketParams {
        lifetime: 1_000,
        ..Default::default()
    });
    rig.core.socket_bind(sock, (100, 5)).unwrap();
    rig.core.socket_connect(sock, (200, 1)).unwrap();
    let baseline = rig.core.pool.counts();

    rig.core.socket_send_once(sock, b"short-lived").unwrap();
    rig.core.do_maintenance();
    {
        let cache = rig.core.cache_state(0);
        assert_eq!(cache.live_entry_count(), 1);
        assert!(!cache.time_index_is_empty());
    }

    rig.clock.advance(5_000);
    rig.core.do_maintenance();
    {
        let cache = rig.core.cache_state(0);
        assert_eq!(cache.live_entry_count(), 0);
        assert_eq!(cache.dest_index_count(200), 0);
        assert!(cache.time_index_is_empty());
    }

    // any still-queued copies drain and the pool returns to baseline
    for _ in 0..4 {
        rig.core.do_maintenance();
    }
    rig.core.pool.maintain_to_empty();
    assert_eq!(rig.core.pool.counts(), baseline);
}

/// Local loopback: a bundle to another service on the same node passes
/// through storage and lands on the destination socket's egress.
#[test]
fn local_loopback_delivery() {
    let mut rig = setup();
    let tx = rig.core.create_socket(SocketParams::default());
    rig.core.socket_bind(tx, (100, 5)).unwrap();
    rig.core.socket_connect(tx, (100, 9)).unwrap();
    let rx = rig.core.create_socket(SocketParams::default());
    rig.core.socket_bind(rx, (100, 9)).unwrap();

    rig.core.socket_send_once(tx, b"hello neighbour").unwrap();
    rig.core.do_maintenance();
    rig.core.do_maintenance();

    let mut buf = [0u8; 64];
    let n = rig
        .core
        .socket_recv_once(rx, &mut buf)
        .unwrap()
        .expect("payload delivered");
    assert_eq!(&buf[..n], b"hello neighbour");

    // delivery completed the journey; storage lets go of the entry
    rig.core.do_maintenance();
    rig.core.do_maintenance();
    assert_eq!(rig.core.cache_state(0).live_entry_count(), 0);
}

/// A send with no matching route at all fails immediately.
#[test]
fn unroutable_send_reports_error() {
    let clock = ManualClock::new(START_MS);
    let mut core = Core::new(&Config::default(), Box::new(clock.handle()));
    let base = core.add_base_intf(100).unwrap();
    core.route_add(100, u64::MAX, base).unwrap();
    core.intf_set_flags(base, INTF_AVAILABLE_FLAGS).unwrap();

    let sock = core.create_socket(SocketParams::default());
    core.socket_bind(sock, (100, 5)).unwrap();
    core.socket_connect(sock, (999, 1)).unwrap();
    assert_eq!(
        core.socket_send_once(sock, b"nowhere").unwrap_err(),
        Status::Unroutable
    );
}

/// Detaching the cache breaks its deliberate self-reference cycle so the
/// flow block's refcount can reach zero.
#[test]
fn detach_breaks_cache_self_reference() {
    let mut rig = setup();
    let flow_block = rig.core.cache_state(0).flow_block;
    assert!(rig.core.pool.refcount(flow_block) >= 2);

    rig.core.detach_cache((100, 64)).unwrap();
    rig.core.pool.maintain_to_empty();
    assert_eq!(rig.core.pool.refcount(flow_block), 0);
}

/// The public blocking surface: transfer against a DOWN CLA reports the
/// timeout outcome without touching agent state.
#[test]
fn cla_transfer_times_out_when_interface_down() {
    let agent = BpAgent::new(Config::default());
    let cla = agent.create_cla_intf().unwrap();

    let wire = [0x9F, 0xFF];
    assert_eq!(
        agent.cla_ingress(cla, &wire, 0).unwrap_err(),
        Status::Timeout
    );
    let mut buf = [0u8; 64];
    assert_eq!(
        agent.cla_egress(cla, &mut buf, 0).unwrap_err(),
        Status::Timeout
    );

    // bringing the interface up opens the queues
    agent
        .intf_set_flags(cla, intf_flags::ADMIN_UP | intf_flags::OPER_UP)
        .unwrap();
    assert_eq!(
        agent.cla_ingress(cla, &wire, 0).unwrap_err(),
        Status::FormatError
    );
}

/// The public socket surface end to end over a manually driven clock.
#[test]
fn agent_send_recv_roundtrip() {
    let clock = ManualClock::new(START_MS);
    let agent = BpAgent::with_clock(Config::default(), Box::new(clock.handle()));

    let base = agent.add_base_intf(100).unwrap();
    agent.route_add(100, u64::MAX, base).unwrap();
    agent.route_add(0, 0, base).unwrap();
    let cache = agent.attach_cache(100, 64).unwrap();
    agent
        .intf_set_flags(base, intf_flags::ADMIN_UP | intf_flags::OPER_UP)
        .unwrap();
    agent
        .intf_set_flags(cache, intf_flags::ADMIN_UP | intf_flags::OPER_UP)
        .unwrap();

    let tx = agent.create_socket(SocketParams::default());
    agent.bind(tx, 100, 5).unwrap();
    agent.connect(tx, 100, 9).unwrap();
    let rx = agent.create_socket(SocketParams::default());
    agent.bind(rx, 100, 9).unwrap();

    agent.send(tx, b"over the lock", 100).unwrap();
    agent.do_maintenance();
    agent.do_maintenance();

    let mut buf = [0u8; 64];
    let n = agent.recv(rx, &mut buf, 100).unwrap();
    assert_eq!(&buf[..n], b"over the lock");

    // an empty queue with a zero timeout reports the timeout outcome
    assert_eq!(agent.recv(rx, &mut buf, 0).unwrap_err(), Status::Timeout);
}
