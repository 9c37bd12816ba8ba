use crate::config::RoverConfig;
use crate::metrics::{LinkMetrics, LinkStats};
use crate::protocol::{
    Acknowledgment, Datagram, DatagramPayload, MessageKind, MissionFragment, ProtocolError, ReportAck,
    TelemetryPayload, TelemetryRecord, MAX_DATAGRAM_SIZE,
};
use crate::reassembly::{FragmentReassemblyBuffer, ReassemblyError, SubmitOutcome};
use crate::report::ReportDue;
use crate::session::{LifecycleState, RoverSession, SessionSnapshot};
use crate::transport::{send_datagram, send_telemetry, DatagramTransport, TelemetrySink, TransportError};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Transport failure: {0}")]
    Transport(#[from] TransportError),
    #[error("Loop task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Milliseconds since the agent started, shared by all loops.
#[derive(Debug, Clone, Copy)]
pub struct MissionClock {
    origin: Instant,
}

impl MissionClock {
    pub fn start() -> Self {
        Self { origin: Instant::now() }
    }

    pub fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}

type LoopHandle = JoinHandle<Result<(), TransportError>>;

/// Runs one rover: a tick loop, a datagram receive loop and a telemetry
/// loop, all sharing one [`RoverSession`] behind a single lock.
///
/// No loop holds the lock across network I/O. The telemetry loop also sends
/// mission reports, so it shares the datagram transport with the receive loop.
pub struct RoverAgent {
    session: Arc<Mutex<RoverSession>>,
    active: Arc<AtomicBool>,
    clock: MissionClock,
    metrics: Arc<LinkMetrics>,
    handles: alloc::vec::Vec<(&'static str, LoopHandle)>,
}

impl RoverAgent {
    pub fn spawn<T, S>(config: &RoverConfig, transport: T, sink: S) -> Self
    where
        T: DatagramTransport + 'static,
        S: TelemetrySink + Sync + 'static,
    {
        let session = RoverSession::new(
            config.rover_id,
            config.mothership_id,
            config.start_x,
            config.start_y,
            config.session.clone(),
        );
        let session = Arc::new(Mutex::new(session));
        let active = Arc::new(AtomicBool::new(true));
        let clock = MissionClock::start();
        let metrics = Arc::new(LinkMetrics::new());
        let transport = Arc::new(transport);

        let tick = tokio::spawn(tick_loop(
            Arc::clone(&session),
            Arc::clone(&active),
            clock,
            Duration::from_millis(config.session.tick_period_ms),
        ));

        let receiver = ReceiveLoop {
            session: Arc::clone(&session),
            active: Arc::clone(&active),
            clock,
            transport: Arc::clone(&transport),
            metrics: Arc::clone(&metrics),
            buffer: FragmentReassemblyBuffer::new(),
            rover_id: config.rover_id,
            mothership_id: config.mothership_id,
            mothership: config.mothership_udp,
            receive_timeout: Duration::from_millis(config.receive_timeout_ms),
            completion_grace: Duration::from_millis(config.completion_grace_ms),
            reassembly_timeout_ms: config.reassembly_timeout_ms,
            last_completed: None,
        };
        let receive = tokio::spawn(receiver.run());

        let telemetry = TelemetryLoop {
            session: Arc::clone(&session),
            active: Arc::clone(&active),
            clock,
            sink,
            transport,
            metrics: Arc::clone(&metrics),
            mothership: config.mothership_udp,
            poll: Duration::from_millis(config.telemetry_poll_ms),
        };
        let telemetry = tokio::spawn(telemetry.run());

        info!("🚀 Rover {} agent started", config.rover_id);

        Self {
            session,
            active,
            clock,
            metrics,
            handles: alloc::vec![("tick", tick), ("receive", receive), ("telemetry", telemetry)],
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Ask every loop to stop at its next suspension point.
    pub fn shutdown(&self) {
        if self.active.swap(false, Ordering::AcqRel) {
            info!("🛑 Rover agent shutting down");
        }
    }

    /// Wait for all loops and report the first failure.
    pub async fn join(mut self) -> Result<(), AgentError> {
        let mut first_error = None;
        for (name, handle) in self.handles.drain(..) {
            let result = match handle.await {
                Ok(result) => result.map_err(AgentError::from),
                Err(e) => Err(AgentError::from(e)),
            };
            if let Err(e) = result {
                error!("❌ {} loop ended with error: {}", name, e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub fn clock(&self) -> MissionClock {
        self.clock
    }

    /// Counters for the rover's datagram endpoint.
    pub fn link_stats(&self) -> LinkStats {
        self.metrics.snapshot()
    }

    pub fn session(&self) -> Arc<Mutex<RoverSession>> {
        Arc::clone(&self.session)
    }

    pub async fn state(&self) -> LifecycleState {
        self.session.lock().await.state()
    }

    pub async fn mission_id(&self) -> Option<u32> {
        self.session.lock().await.mission_id()
    }

    pub async fn progress(&self) -> f32 {
        self.session.lock().await.progress()
    }

    pub async fn telemetry(&self) -> TelemetryPayload {
        self.session.lock().await.telemetry()
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        self.session.lock().await.snapshot()
    }
}

impl Drop for RoverAgent {
    fn drop(&mut self) {
        self.active.store(false, Ordering::Release);
    }
}

async fn tick_loop(
    session: Arc<Mutex<RoverSession>>,
    active: Arc<AtomicBool>,
    clock: MissionClock,
    period: Duration,
) -> Result<(), TransportError> {
    let mut interval = tokio::time::interval(period);
    while active.load(Ordering::Acquire) {
        interval.tick().await;
        session.lock().await.tick(clock.now_ms());
    }
    Ok(())
}

struct TelemetryLoop<T, S> {
    session: Arc<Mutex<RoverSession>>,
    active: Arc<AtomicBool>,
    clock: MissionClock,
    sink: S,
    transport: Arc<T>,
    metrics: Arc<LinkMetrics>,
    mothership: SocketAddr,
    poll: Duration,
}

impl<T: DatagramTransport, S: TelemetrySink> TelemetryLoop<T, S> {
    async fn run(mut self) -> Result<(), TransportError> {
        let mut interval = tokio::time::interval(self.poll);
        while self.active.load(Ordering::Acquire) {
            interval.tick().await;
            let now = self.clock.now_ms();

            let (snapshot, report) = {
                let mut session = self.session.lock().await;
                let snapshot = session.should_send_telemetry(now).then(|| session.snapshot());
                (snapshot, session.next_report(now))
            };

            if let Some(snapshot) = snapshot {
                let record =
                    TelemetryRecord::new(snapshot.rover_id, snapshot.mother_id, snapshot.mission_id, snapshot.telemetry);
                send_telemetry(&mut self.sink, &record).await?;
                debug!(
                    "📡 Telemetry sent: {} ({:?}, {:.1}%)",
                    snapshot.telemetry.status, snapshot.last_event, snapshot.progress
                );
                self.session.lock().await.telemetry_sent(now);
            }

            if let Some(due) = report {
                self.send_report(due).await?;
            }
        }
        Ok(())
    }

    async fn send_report(&self, due: ReportDue) -> Result<(), TransportError> {
        let (rover_id, mothership_id) = {
            let session = self.session.lock().await;
            (session.rover_id(), session.mother_id())
        };
        let report = due.report();
        send_datagram(self.transport.as_ref(), &Datagram::report(rover_id, mothership_id, report), self.mothership)
            .await?;
        match due {
            ReportDue::Fresh(_) => self.metrics.record_sent(1),
            ReportDue::Retransmit(_) => {
                debug!("🔁 Retransmitting final report {} for mission {}", report.sequence, report.mission_id);
                self.metrics.record_retransmitted(1);
            }
        }
        if let Some(outcome) = report.outcome {
            info!("📨 Mission {} reported {:?} at {:.1}%", report.mission_id, outcome, report.progress);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct CompletedMission {
    mission_id: u32,
    total: u16,
    at_ms: u64,
}

struct ReceiveLoop<T> {
    session: Arc<Mutex<RoverSession>>,
    active: Arc<AtomicBool>,
    clock: MissionClock,
    transport: Arc<T>,
    metrics: Arc<LinkMetrics>,
    buffer: FragmentReassemblyBuffer,
    rover_id: u32,
    mothership_id: u32,
    mothership: SocketAddr,
    receive_timeout: Duration,
    completion_grace: Duration,
    reassembly_timeout_ms: u64,
    /// Last mission handed to the session, re-acknowledged on repeats.
    last_completed: Option<CompletedMission>,
}

impl<T: DatagramTransport> ReceiveLoop<T> {
    async fn run(mut self) -> Result<(), TransportError> {
        let mut buf = alloc::vec![0u8; MAX_DATAGRAM_SIZE];

        while self.active.load(Ordering::Acquire) {
            let now = self.clock.now_ms();
            let hello_due = self.session.lock().await.device_hello_due(now);
            if hello_due {
                self.send(&Datagram::hello(self.rover_id, self.mothership_id), self.mothership).await?;
                debug!("👋 Hello sent to mothership {}", self.mothership_id);
            }
            self.expire_stalled(now).await;

            match self.transport.recv_from(&mut buf, self.receive_timeout).await {
                Ok(Some((len, from))) => {
                    self.metrics.record_received();
                    self.on_datagram(&buf[..len], from).await?;
                }
                Ok(None) => self.on_timeout().await?,
                Err(e) => {
                    error!("❌ Datagram receive failed: {}", e);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    async fn send(&self, datagram: &Datagram, peer: SocketAddr) -> Result<(), TransportError> {
        send_datagram(self.transport.as_ref(), datagram, peer).await?;
        self.metrics.record_sent(1);
        Ok(())
    }

    async fn expire_stalled(&mut self, now: u64) {
        if let Some((mission_id, missing)) = self.buffer.expire(now, self.reassembly_timeout_ms) {
            self.metrics.record_lost(u64::from(missing));
            self.session.lock().await.abandon_receiving(mission_id);
        }
        if let Some(done) = self.last_completed {
            if now.saturating_sub(done.at_ms) >= self.reassembly_timeout_ms {
                self.last_completed = None;
            }
        }
    }

    async fn on_datagram(&mut self, bytes: &[u8], from: SocketAddr) -> Result<(), TransportError> {
        let datagram = match Datagram::decode(bytes) {
            Ok(datagram) => datagram,
            Err(e) => {
                warn!("Dropping datagram from {}: {}", from, e);
                return Ok(());
            }
        };

        match datagram.payload {
            DatagramPayload::Fragment(fragment) => self.on_fragment(&fragment, from).await,
            DatagramPayload::Empty => {
                if datagram.envelope.kind == MessageKind::Response {
                    let now = self.clock.now_ms();
                    self.session.lock().await.handle_mission_ack(now);
                }
                Ok(())
            }
            DatagramPayload::ReportAck(ack) => {
                self.on_report_ack(&ack).await;
                Ok(())
            }
            DatagramPayload::Ack(_) | DatagramPayload::Report(_) => {
                debug!("Ignoring {:?} addressed to a rover", datagram.envelope.kind);
                Ok(())
            }
        }
    }

    async fn on_report_ack(&self, ack: &ReportAck) {
        if !ack.final_ack {
            return;
        }
        if self.session.lock().await.report_acknowledged(ack) {
            info!("✅ Mothership confirmed the end of mission {}", ack.mission_id);
        } else {
            self.metrics.record_duplicate();
        }
    }

    async fn on_fragment(&mut self, fragment: &MissionFragment, from: SocketAddr) -> Result<(), TransportError> {
        let mission_id = fragment.mission_id;

        if let Some(done) = self.last_completed {
            if done.mission_id == mission_id {
                debug!("Fragment {} of completed mission {}, re-acknowledging", fragment.sequence, mission_id);
                self.metrics.record_duplicate();
                return self.send_ack(Acknowledgment::complete(mission_id, done.total), from).await;
            }
            // A new mission may reuse the id later
            self.last_completed = None;
        }

        let new_mission = self.buffer.mission_id() != Some(mission_id);
        match self.buffer.submit_fragment(fragment, self.clock.now_ms()) {
            Ok(SubmitOutcome::Accepted) => {
                debug!(
                    "Fragment {}/{} of mission {} accepted",
                    fragment.sequence + 1,
                    fragment.total_fragments,
                    mission_id
                );
            }
            Ok(SubmitOutcome::Duplicate) => {
                self.metrics.record_duplicate();
                return Ok(());
            }
            Err(e) => {
                warn!("⚠️  Fragment {} of mission {} rejected: {}", fragment.sequence, mission_id, e);
                return Ok(());
            }
        }

        if new_mission {
            if let Err(e) = self.session.lock().await.begin_receiving(mission_id) {
                debug!("Receiving mission {} while busy: {}", mission_id, e);
            }
        }

        if self.buffer.is_complete() {
            self.on_complete(from).await?;
        }
        Ok(())
    }

    async fn on_complete(&mut self, from: SocketAddr) -> Result<(), TransportError> {
        tokio::time::sleep(self.completion_grace).await;

        let total = self.buffer.expected_total();
        let mission = match self.buffer.reassemble() {
            Ok(mission) => mission,
            Err(e) => {
                // Not acknowledged, the mothership resends from scratch
                error!("❌ Reassembled mission could not be decoded: {}", e);
                return Ok(());
            }
        };
        let mission_id = mission.id;
        info!("📦 Mission {} reassembled from {} fragments", mission_id, total);

        let now = self.clock.now_ms();
        if let Err(e) = self.session.lock().await.mission_received(mission, now) {
            // Unacknowledged, so the mothership keeps the mission
            warn!("⚠️  Mission {} refused: {}", mission_id, e);
            return Ok(());
        }

        self.last_completed = Some(CompletedMission { mission_id, total, at_ms: now });
        self.send_ack(Acknowledgment::complete(mission_id, total), from).await
    }

    async fn on_timeout(&mut self) -> Result<(), TransportError> {
        if self.buffer.mission_id().is_none() || self.buffer.is_complete() {
            return Ok(());
        }

        let ack = match self.buffer.build_acknowledgment() {
            Ok(ack) => ack,
            Err(ReassemblyError::Protocol(ProtocolError::MissingListOverflow { missing, max })) => {
                warn!("⚠️  {} fragments missing, only {} fit in one acknowledgment", missing, max);
                match self.buffer.build_partial_acknowledgment() {
                    Ok(ack) => ack,
                    Err(_) => return Ok(()),
                }
            }
            Err(e) => {
                warn!("Cannot build acknowledgment: {}", e);
                return Ok(());
            }
        };

        info!(
            "🔁 Mission {} incomplete: {}/{} fragments, missing {:?}",
            ack.mission_id, self.buffer.received_count(), ack.total_fragments, ack.missing
        );
        let peer = self.mothership;
        self.send_ack(ack, peer).await
    }

    async fn send_ack(&self, ack: Acknowledgment, peer: SocketAddr) -> Result<(), TransportError> {
        self.send(&Datagram::ack(self.rover_id, self.mothership_id, ack), peer).await
    }
}
