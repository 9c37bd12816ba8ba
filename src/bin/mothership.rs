use clap::{App, Arg};
use colored::*;
use missionlink::config::{load_from_file, MothershipConfig};
use missionlink::metrics::LinkMetrics;
use missionlink::mothership::{
    handle_telemetry_stream, ConnectionTable, DispatchAction, MissionDispatch, ReportDisposition,
};
use missionlink::protocol::{
    unix_millis, Datagram, DatagramPayload, Mission, MissionOutcome, MissionReport, OperationalStatus, ReportAck,
    TelemetryRecord, MAX_DATAGRAM_SIZE,
};
use missionlink::transport::{send_datagram, DatagramTransport, UdpTransport};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

const POLL_INTERVAL_MS: u64 = 250;

struct InFlight {
    dispatch: MissionDispatch,
    addr: SocketAddr,
    last_sent_ms: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    let matches = App::new("mothership")
        .version("0.1.0")
        .about("🛸 MissionLink mothership - dispatches missions and collects rover telemetry")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("JSON configuration file (missions are listed there)")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("udp")
                .long("udp")
                .value_name("ADDR")
                .help("UDP listen address (host:port)")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("tcp")
                .long("tcp")
                .value_name("ADDR")
                .help("TCP telemetry listen address (host:port)")
                .takes_value(true),
        )
        .get_matches();

    let mut config: MothershipConfig = match matches.value_of("config") {
        Some(path) => load_from_file(path)?,
        None => MothershipConfig::default(),
    };
    if let Some(addr) = matches.value_of("udp") {
        config.udp_listen = addr.parse()?;
    }
    if let Some(addr) = matches.value_of("tcp") {
        config.tcp_listen = addr.parse()?;
    }
    config.validate()?;

    println!("🛸 MissionLink Mothership {}", config.mothership_id);
    println!("================================");

    let table = ConnectionTable::new();

    let listener = TcpListener::bind(config.tcp_listen).await?;
    info!("🌐 Telemetry listening on {}", config.tcp_listen);
    let tcp_table = table.clone();
    let tcp_server = tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    info!("🔗 Telemetry stream from {}", addr);
                    let table = tcp_table.clone();
                    tokio::spawn(async move {
                        match handle_telemetry_stream(stream, &table, print_telemetry).await {
                            Ok(count) => info!("🔌 {} closed after {} records", addr, count),
                            Err(e) => warn!("Telemetry stream {} error: {}", addr, e),
                        }
                    });
                }
                Err(e) => error!("Failed to accept connection: {}", e),
            }
        }
    });

    let transport = UdpTransport::bind(config.udp_listen).await?;
    info!("📡 Missions served from {}", transport.local_addr()?);

    let mut queue: VecDeque<Mission> = config.missions.iter().cloned().collect();
    if queue.is_empty() {
        warn!("No missions configured, only answering keepalives");
    }

    let metrics = Arc::new(LinkMetrics::new());

    tokio::select! {
        result = serve_missions(&config, &transport, &table, &metrics, &mut queue) => {
            if let Err(e) = result {
                error!("❌ Mission service failed: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {}
    }

    tcp_server.abort();
    println!("📊 Link: {}", metrics.snapshot());
    println!("🛑 Mothership stopped");
    Ok(())
}

async fn serve_missions(
    config: &MothershipConfig,
    transport: &UdpTransport,
    table: &ConnectionTable,
    metrics: &Arc<LinkMetrics>,
    queue: &mut VecDeque<Mission>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    let mut in_flight: HashMap<u32, InFlight> = HashMap::new();
    // Rovers keep reporting idle for a moment after accepting a mission
    let mut cooldown: HashMap<u32, u64> = HashMap::new();

    loop {
        if let Some((len, from)) = transport
            .recv_from(&mut buf, Duration::from_millis(POLL_INTERVAL_MS))
            .await?
        {
            let datagram = match Datagram::decode(&buf[..len]) {
                Ok(datagram) => datagram,
                Err(e) => {
                    warn!("Dropping datagram from {}: {}", from, e);
                    continue;
                }
            };
            let rover_id = datagram.envelope.sender_id;
            let now = unix_millis();

            match datagram.payload {
                DatagramPayload::Empty => {
                    metrics.record_received();
                    table.register_hello(rover_id, from, now).await;
                    send_datagram(transport, &Datagram::response(config.mothership_id, rover_id), from).await?;
                    metrics.record_sent(1);
                }
                DatagramPayload::Report(report) => {
                    metrics.record_received();
                    match table.record_report(rover_id, &report, now).await {
                        ReportDisposition::Recorded { lost } => {
                            metrics.record_lost(u64::from(lost));
                            print_report(rover_id, &report);
                        }
                        ReportDisposition::Duplicate => metrics.record_duplicate(),
                    }
                    let ack = ReportAck {
                        mission_id: report.mission_id,
                        sequence: report.sequence,
                        final_ack: report.is_final(),
                    };
                    send_datagram(transport, &Datagram::report_ack(config.mothership_id, rover_id, ack), from).await?;
                    metrics.record_sent(1);
                }
                DatagramPayload::Ack(ack) => {
                    let Some(flight) = in_flight.get_mut(&rover_id) else {
                        continue;
                    };
                    match flight.dispatch.on_ack(&ack) {
                        DispatchAction::Resend(datagrams) => {
                            for datagram in &datagrams {
                                send_datagram(transport, datagram, flight.addr).await?;
                            }
                            flight.last_sent_ms = now;
                        }
                        DispatchAction::Delivered => {
                            in_flight.remove(&rover_id);
                            cooldown.insert(rover_id, now);
                        }
                        DispatchAction::GiveUp => {
                            if let Some(flight) = in_flight.remove(&rover_id) {
                                warn!("Mission {} could not be delivered to rover {}", flight.dispatch.mission_id(), rover_id);
                            }
                        }
                        DispatchAction::Ignored => {}
                    }
                }
                DatagramPayload::Fragment(_) | DatagramPayload::ReportAck(_) => {
                    warn!("Unexpected {:?} from {}", datagram.envelope.kind, from);
                }
            }
        }

        let now = unix_millis();

        let mut abandoned = Vec::new();
        for (rover_id, flight) in in_flight.iter_mut() {
            if now.saturating_sub(flight.last_sent_ms) < config.ack_timeout_ms {
                continue;
            }
            match flight.dispatch.on_timeout() {
                DispatchAction::Resend(datagrams) => {
                    for datagram in &datagrams {
                        send_datagram(transport, datagram, flight.addr).await?;
                    }
                    flight.last_sent_ms = now;
                }
                _ => abandoned.push(*rover_id),
            }
        }
        for rover_id in abandoned {
            in_flight.remove(&rover_id);
        }

        cooldown.retain(|_, since| now.saturating_sub(*since) < config.ack_timeout_ms);

        for (rover_id, addr) in table.idle_rovers().await {
            if in_flight.contains_key(&rover_id) || cooldown.contains_key(&rover_id) {
                continue;
            }
            let Some(mission) = queue.pop_front() else {
                break;
            };
            let dispatch = match MissionDispatch::new(
                config.mothership_id,
                rover_id,
                &mission,
                config.fragment_size,
                config.max_retries,
            ) {
                Ok(dispatch) => dispatch.with_metrics(Arc::clone(metrics)),
                Err(e) => {
                    error!("❌ Mission {} cannot be fragmented: {}", mission.id, e);
                    continue;
                }
            };
            info!(
                "🚀 Assigning mission {} ({}) to rover {} in {} fragments",
                mission.id,
                mission.task,
                rover_id,
                dispatch.fragment_count()
            );
            for datagram in dispatch.initial_datagrams() {
                send_datagram(transport, &datagram, addr).await?;
            }
            in_flight.insert(rover_id, InFlight { dispatch, addr, last_sent_ms: now });
        }
    }
}

fn print_report(rover_id: u32, report: &MissionReport) {
    let label = match report.outcome {
        None => format!("{:5.1}%", report.progress).cyan(),
        Some(MissionOutcome::Succeeded) => "COMPLETED".bright_green().bold(),
        Some(MissionOutcome::Failed(code)) => format!("FAILED ({code:?})").red().bold(),
    };
    println!(
        "{} {:>3} mission {} {} after {} s, battery {:.1}%",
        "📨 Rover".bold(),
        rover_id,
        report.mission_id,
        label,
        report.elapsed_s,
        report.battery
    );
}

fn print_telemetry(record: &TelemetryRecord) {
    let payload = &record.payload;
    let status = match payload.status {
        OperationalStatus::Active => payload.status.as_str().green(),
        OperationalStatus::InMission => payload.status.as_str().cyan(),
        OperationalStatus::Success => payload.status.as_str().bright_green().bold(),
        OperationalStatus::Failure => payload.status.as_str().red().bold(),
        OperationalStatus::Initial => payload.status.as_str().normal(),
    };
    let battery = format!("{:5.1}%", payload.battery);
    let battery = if payload.battery < 20.0 { battery.red() } else { battery.normal() };
    println!(
        "{} {:>3} {:<10} pos ({:7.2}, {:7.2}) battery {} speed {:.1} m/s mission {}",
        "📡 Rover".bold(),
        record.envelope.sender_id,
        status,
        payload.x,
        payload.y,
        battery,
        payload.speed,
        record.envelope.mission_id
    );
}
