use missionlink::agent::RoverAgent;
use missionlink::config::RoverConfig;
use missionlink::fragment::fragment_mission;
use missionlink::protocol::*;
use missionlink::session::LifecycleState;
use missionlink::transport::{send_datagram, ChannelSink, DatagramTransport, MemoryTransport};
use std::net::SocketAddr;
use std::time::Duration;

const ROVER_ID: u32 = 4;
const MOTHERSHIP_ID: u32 = 1;

fn rover_config() -> RoverConfig {
    let mut config = RoverConfig {
        rover_id: ROVER_ID,
        mothership_id: MOTHERSHIP_ID,
        receive_timeout_ms: 50,
        completion_grace_ms: 10,
        telemetry_poll_ms: 10,
        ..RoverConfig::default()
    };
    config.session.tick_period_ms = 10;
    config
}

fn addrs() -> (SocketAddr, SocketAddr) {
    (SocketAddr::from(([127, 0, 0, 1], 6004)), SocketAddr::from(([127, 0, 0, 1], 5000)))
}

fn mission_in_three(id: u32, duration_s: u64) -> (Mission, Vec<MissionFragment>) {
    let task = "x".repeat(MAX_TASK_LEN);
    let mission = Mission::new(id, Area { x1: 1.0, y1: 1.0, x2: 3.0, y2: 3.0 }, &task, duration_s).unwrap();
    let len = mission.to_bytes().unwrap().len();
    let fragments = fragment_mission(&mission, len.div_ceil(3)).unwrap();
    assert_eq!(fragments.len(), 3);
    (mission, fragments)
}

fn three_fragment_mission() -> (Mission, Vec<MissionFragment>) {
    mission_in_three(77, 30)
}

/// Next acknowledgment from the rover, skipping keepalives.
async fn next_ack(mothership: &MemoryTransport) -> Acknowledgment {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        let (len, _) = mothership
            .recv_from(&mut buf, Duration::from_secs(2))
            .await
            .unwrap()
            .expect("rover went quiet");
        let datagram = Datagram::decode(&buf[..len]).unwrap();
        if let DatagramPayload::Ack(ack) = datagram.payload {
            assert_eq!(datagram.envelope.sender_id, ROVER_ID);
            return ack;
        }
    }
}

/// Next mission report from the rover with its envelope kind.
async fn next_report(mothership: &MemoryTransport) -> (MessageKind, MissionReport) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        let (len, _) = mothership
            .recv_from(&mut buf, Duration::from_secs(2))
            .await
            .unwrap()
            .expect("rover went quiet");
        let datagram = Datagram::decode(&buf[..len]).unwrap();
        if let DatagramPayload::Report(report) = datagram.payload {
            return (datagram.envelope.kind, report);
        }
    }
}

/// Every datagram the rover sends within `window`.
async fn collect_for(mothership: &MemoryTransport, window: Duration) -> Vec<Datagram> {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    let deadline = tokio::time::Instant::now() + window;
    let mut seen = Vec::new();
    loop {
        let left = deadline.saturating_duration_since(tokio::time::Instant::now());
        if left.is_zero() {
            return seen;
        }
        if let Some((len, _)) = mothership.recv_from(&mut buf, left).await.unwrap() {
            seen.push(Datagram::decode(&buf[..len]).unwrap());
        }
    }
}

async fn deliver(mothership: &MemoryTransport, rover: SocketAddr, fragments: &[MissionFragment]) {
    for fragment in fragments {
        send_fragment(mothership, rover, fragment).await;
    }
    let ack = loop {
        let ack = next_ack(mothership).await;
        if ack.is_complete() {
            break ack;
        }
    };
    assert_eq!(ack.mission_id, fragments[0].mission_id);
}

async fn send_fragment(mothership: &MemoryTransport, rover: SocketAddr, fragment: &MissionFragment) {
    send_datagram(mothership, &Datagram::fragment(MOTHERSHIP_ID, ROVER_ID, fragment.clone()), rover)
        .await
        .unwrap();
}

async fn wait_for_state(agent: &RoverAgent, state: LifecycleState) {
    for _ in 0..200 {
        if agent.state().await == state {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("rover never reached {:?}", state);
}

#[tokio::test]
async fn test_hello_sent_on_start() {
    let (rover_addr, mother_addr) = addrs();
    let (rover_end, mothership) = MemoryTransport::pair(rover_addr, mother_addr);
    let (sink, _records) = ChannelSink::channel();
    let agent = RoverAgent::spawn(&rover_config(), rover_end, sink);

    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    let (len, from) = mothership.recv_from(&mut buf, Duration::from_secs(2)).await.unwrap().unwrap();
    let hello = Datagram::decode(&buf[..len]).unwrap();
    assert_eq!(from, rover_addr);
    assert_eq!(hello.envelope.kind, MessageKind::Hello);
    assert_eq!(hello.envelope.sender_id, ROVER_ID);

    send_datagram(&mothership, &Datagram::response(MOTHERSHIP_ID, ROVER_ID), rover_addr)
        .await
        .unwrap();
    wait_for_state(&agent, LifecycleState::Available).await;
    for _ in 0..200 {
        if agent.session().lock().await.is_registered() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(agent.session().lock().await.is_registered());

    agent.shutdown();
    agent.join().await.unwrap();
}

#[tokio::test]
async fn test_gap_reported_then_mission_started() {
    let (rover_addr, mother_addr) = addrs();
    let (rover_end, mothership) = MemoryTransport::pair(rover_addr, mother_addr);
    let (sink, mut records) = ChannelSink::channel();
    let agent = RoverAgent::spawn(&rover_config(), rover_end, sink);
    wait_for_state(&agent, LifecycleState::Available).await;

    let (mission, fragments) = three_fragment_mission();
    send_fragment(&mothership, rover_addr, &fragments[0]).await;
    send_fragment(&mothership, rover_addr, &fragments[2]).await;

    let ack = next_ack(&mothership).await;
    assert_eq!(ack.mission_id, mission.id);
    assert_eq!(ack.status, AckStatus::Incomplete);
    assert_eq!(ack.missing.as_slice(), &[1]);
    assert_eq!(agent.state().await, LifecycleState::ReceivingMission);

    send_fragment(&mothership, rover_addr, &fragments[1]).await;
    let ack = loop {
        let ack = next_ack(&mothership).await;
        if ack.is_complete() {
            break ack;
        }
    };
    assert_eq!(ack.total_fragments, 3);

    wait_for_state(&agent, LifecycleState::InMission).await;
    assert_eq!(agent.mission_id().await, Some(mission.id));

    let in_mission = loop {
        let line = tokio::time::timeout(Duration::from_secs(2), records.recv())
            .await
            .unwrap()
            .unwrap();
        let record = TelemetryRecord::decode_line(std::str::from_utf8(&line).unwrap()).unwrap();
        if record.payload.status == OperationalStatus::InMission {
            break record;
        }
    };
    assert_eq!(in_mission.envelope.sender_id, ROVER_ID);
    assert_eq!(in_mission.envelope.mission_id, mission.id);

    agent.shutdown();
    agent.join().await.unwrap();
}

#[tokio::test]
async fn test_duplicate_after_completion_is_reacknowledged() {
    let (rover_addr, mother_addr) = addrs();
    let (rover_end, mothership) = MemoryTransport::pair(rover_addr, mother_addr);
    let (sink, _records) = ChannelSink::channel();
    let agent = RoverAgent::spawn(&rover_config(), rover_end, sink);
    wait_for_state(&agent, LifecycleState::Available).await;

    let (mission, fragments) = three_fragment_mission();
    for fragment in &fragments {
        send_fragment(&mothership, rover_addr, fragment).await;
    }
    assert!(next_ack(&mothership).await.is_complete());
    wait_for_state(&agent, LifecycleState::InMission).await;

    send_fragment(&mothership, rover_addr, &fragments[1]).await;
    let ack = next_ack(&mothership).await;
    assert!(ack.is_complete());
    assert_eq!(ack.mission_id, mission.id);
    assert_eq!(agent.state().await, LifecycleState::InMission);

    let stats = agent.link_stats();
    assert_eq!(stats.duplicates, 1);
    assert!(stats.received >= 4);

    agent.shutdown();
    agent.join().await.unwrap();
}

#[tokio::test]
async fn test_corrupted_fragment_dropped() {
    let (rover_addr, mother_addr) = addrs();
    let (rover_end, mothership) = MemoryTransport::pair(rover_addr, mother_addr);
    let (sink, _records) = ChannelSink::channel();
    let agent = RoverAgent::spawn(&rover_config(), rover_end, sink);
    wait_for_state(&agent, LifecycleState::Available).await;

    let (_, fragments) = three_fragment_mission();
    let mut corrupted = fragments[1].clone();
    corrupted.payload[0] ^= 0x01;
    send_fragment(&mothership, rover_addr, &fragments[0]).await;
    send_fragment(&mothership, rover_addr, &corrupted).await;
    send_fragment(&mothership, rover_addr, &fragments[2]).await;

    let ack = next_ack(&mothership).await;
    assert_eq!(ack.status, AckStatus::Incomplete);
    assert_eq!(ack.missing.as_slice(), &[1]);

    agent.shutdown();
    agent.join().await.unwrap();
}

#[tokio::test]
async fn test_closed_link_ends_receive_loop_only() {
    let (rover_addr, mother_addr) = addrs();
    let (rover_end, mothership) = MemoryTransport::pair(rover_addr, mother_addr);
    let (sink, _records) = ChannelSink::channel();
    let agent = RoverAgent::spawn(&rover_config(), rover_end, sink);
    wait_for_state(&agent, LifecycleState::Available).await;

    drop(mothership);
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Tick loop still owns the session
    assert!(agent.is_active());
    assert_eq!(agent.state().await, LifecycleState::Available);

    agent.shutdown();
    assert!(agent.join().await.is_err());
}

#[tokio::test]
async fn test_stalled_reassembly_returns_to_available() {
    let (rover_addr, mother_addr) = addrs();
    let (rover_end, mothership) = MemoryTransport::pair(rover_addr, mother_addr);
    let (sink, _records) = ChannelSink::channel();
    let config = RoverConfig { reassembly_timeout_ms: 300, ..rover_config() };
    let agent = RoverAgent::spawn(&config, rover_end, sink);
    wait_for_state(&agent, LifecycleState::Available).await;

    let (_, fragments) = three_fragment_mission();
    send_fragment(&mothership, rover_addr, &fragments[0]).await;
    let ack = next_ack(&mothership).await;
    assert_eq!(ack.missing.as_slice(), &[1, 2]);
    assert_eq!(agent.state().await, LifecycleState::ReceivingMission);

    wait_for_state(&agent, LifecycleState::Available).await;
    assert_eq!(agent.session().lock().await.receiving_mission_id(), None);
    assert_eq!(agent.link_stats().lost, 2);

    // Gap reports stop with the abandoned mission
    collect_for(&mothership, Duration::from_millis(50)).await;
    let later = collect_for(&mothership, Duration::from_millis(300)).await;
    assert!(later.iter().all(|d| !matches!(d.payload, DatagramPayload::Ack(_))));

    agent.shutdown();
    agent.join().await.unwrap();
}

#[tokio::test]
async fn test_mission_refused_in_failure_is_not_acknowledged() {
    let (rover_addr, mother_addr) = addrs();
    let (rover_end, mothership) = MemoryTransport::pair(rover_addr, mother_addr);
    let (sink, _records) = ChannelSink::channel();
    let agent = RoverAgent::spawn(&rover_config(), rover_end, sink);
    wait_for_state(&agent, LifecycleState::Available).await;

    let now = agent.clock().now_ms();
    agent.session().lock().await.enter_failure("wheel jammed", now);

    let (_, fragments) = three_fragment_mission();
    for fragment in &fragments {
        send_fragment(&mothership, rover_addr, fragment).await;
    }
    let replies = collect_for(&mothership, Duration::from_millis(300)).await;
    assert!(replies.iter().all(|d| !matches!(d.payload, DatagramPayload::Ack(_))));
    assert_eq!(agent.state().await, LifecycleState::Failure);
    assert_eq!(agent.mission_id().await, None);

    // A resend is refused again rather than re-acknowledged
    send_fragment(&mothership, rover_addr, &fragments[1]).await;
    let replies = collect_for(&mothership, Duration::from_millis(100)).await;
    assert!(replies.iter().all(|d| !matches!(&d.payload, DatagramPayload::Ack(ack) if ack.is_complete())));

    agent.shutdown();
    agent.join().await.unwrap();
}

#[tokio::test]
async fn test_other_mission_clears_completed_id() {
    let (rover_addr, mother_addr) = addrs();
    let (rover_end, mothership) = MemoryTransport::pair(rover_addr, mother_addr);
    let (sink, _records) = ChannelSink::channel();
    let agent = RoverAgent::spawn(&rover_config(), rover_end, sink);
    wait_for_state(&agent, LifecycleState::Available).await;

    let (first, fragments) = three_fragment_mission();
    deliver(&mothership, rover_addr, &fragments).await;

    let (_, other) = mission_in_three(78, 30);
    send_fragment(&mothership, rover_addr, &other[0]).await;
    send_fragment(&mothership, rover_addr, &fragments[1]).await;

    let ack = loop {
        let ack = next_ack(&mothership).await;
        if ack.mission_id == first.id {
            break ack;
        }
    };
    assert_eq!(ack.status, AckStatus::Incomplete);
    assert_eq!(ack.missing.as_slice(), &[0, 2]);

    agent.shutdown();
    agent.join().await.unwrap();
}

#[tokio::test]
async fn test_completed_id_ages_out() {
    let (rover_addr, mother_addr) = addrs();
    let (rover_end, mothership) = MemoryTransport::pair(rover_addr, mother_addr);
    let (sink, _records) = ChannelSink::channel();
    let config = RoverConfig { reassembly_timeout_ms: 200, ..rover_config() };
    let agent = RoverAgent::spawn(&config, rover_end, sink);
    wait_for_state(&agent, LifecycleState::Available).await;

    let (mission, fragments) = three_fragment_mission();
    deliver(&mothership, rover_addr, &fragments).await;
    tokio::time::sleep(Duration::from_millis(400)).await;

    send_fragment(&mothership, rover_addr, &fragments[2]).await;
    let ack = next_ack(&mothership).await;
    assert_eq!(ack.mission_id, mission.id);
    assert_eq!(ack.status, AckStatus::Incomplete);
    assert_eq!(ack.missing.as_slice(), &[0, 1]);

    agent.shutdown();
    agent.join().await.unwrap();
}

#[tokio::test]
async fn test_final_report_retransmitted_until_acknowledged() {
    let (rover_addr, mother_addr) = addrs();
    let (rover_end, mothership) = MemoryTransport::pair(rover_addr, mother_addr);
    let (sink, _records) = ChannelSink::channel();
    let mut config = rover_config();
    config.session.report_retry_ms = 100;
    let agent = RoverAgent::spawn(&config, rover_end, sink);
    wait_for_state(&agent, LifecycleState::Available).await;

    let (mission, fragments) = mission_in_three(90, 1);
    deliver(&mothership, rover_addr, &fragments).await;

    let (kind, first) = loop {
        let (kind, report) = next_report(&mothership).await;
        assert_eq!(report.mission_id, mission.id);
        if report.is_final() {
            break (kind, report);
        }
        assert_eq!(kind, MessageKind::Progress);
    };
    assert_eq!(kind, MessageKind::Completed);
    assert_eq!(first.outcome, Some(MissionOutcome::Succeeded));
    assert_eq!(first.progress, 100.0);

    let (_, again) = next_report(&mothership).await;
    assert_eq!(again, first);
    assert!(agent.link_stats().retransmitted >= 1);

    let ack = ReportAck { mission_id: mission.id, sequence: first.sequence, final_ack: true };
    send_datagram(&mothership, &Datagram::report_ack(MOTHERSHIP_ID, ROVER_ID, ack), rover_addr)
        .await
        .unwrap();

    // One retransmission may already be in flight
    tokio::time::sleep(Duration::from_millis(50)).await;
    let later = collect_for(&mothership, Duration::from_millis(400)).await;
    assert!(later.iter().all(|d| !matches!(d.payload, DatagramPayload::Report(_))));
    assert!(agent.session().lock().await.pending_final_report().is_none());

    agent.shutdown();
    agent.join().await.unwrap();
}
