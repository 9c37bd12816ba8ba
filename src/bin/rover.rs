use clap::{App, Arg};
use missionlink::agent::RoverAgent;
use missionlink::config::{load_from_file, RoverConfig};
use missionlink::transport::{TcpTelemetrySink, UdpTransport};
use std::net::SocketAddr;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    let matches = App::new("rover")
        .version("0.1.0")
        .about("🤖 MissionLink rover - receives missions over UDP, reports telemetry over TCP")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("JSON configuration file")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("id")
                .short("i")
                .long("id")
                .value_name("ID")
                .help("Rover id")
                .takes_value(true)
                .validator(|v| v.parse::<u32>().map(|_| ()).map_err(|_| "Rover id must be a number".into())),
        )
        .arg(
            Arg::with_name("udp")
                .long("udp")
                .value_name("ADDR")
                .help("Mothership UDP address (host:port)")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("tcp")
                .long("tcp")
                .value_name("ADDR")
                .help("Mothership TCP telemetry address (host:port)")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("x")
                .short("x")
                .value_name("X")
                .help("Starting x position in metres")
                .takes_value(true)
                .allow_hyphen_values(true),
        )
        .arg(
            Arg::with_name("y")
                .short("y")
                .value_name("Y")
                .help("Starting y position in metres")
                .takes_value(true)
                .allow_hyphen_values(true),
        )
        .get_matches();

    let mut config: RoverConfig = match matches.value_of("config") {
        Some(path) => load_from_file(path)?,
        None => RoverConfig::default(),
    };
    if let Some(id) = matches.value_of("id") {
        config.rover_id = id.parse()?;
    }
    if let Some(addr) = matches.value_of("udp") {
        config.mothership_udp = addr.parse::<SocketAddr>()?;
    }
    if let Some(addr) = matches.value_of("tcp") {
        config.mothership_tcp = addr.parse::<SocketAddr>()?;
    }
    if let Some(x) = matches.value_of("x") {
        config.start_x = x.parse()?;
    }
    if let Some(y) = matches.value_of("y") {
        config.start_y = y.parse()?;
    }
    config.validate()?;

    println!("🤖 MissionLink Rover {}", config.rover_id);
    println!("================================");

    let transport = UdpTransport::bind(config.local_udp).await?;
    info!("📡 UDP bound to {}", transport.local_addr()?);
    let sink = TcpTelemetrySink::connect(config.mothership_tcp).await?;
    info!("🔗 Telemetry connected to {}", config.mothership_tcp);

    let agent = RoverAgent::spawn(&config, transport, sink);

    tokio::signal::ctrl_c().await?;
    agent.shutdown();
    if let Err(e) = agent.join().await {
        error!("❌ Rover stopped with error: {}", e);
        return Err(e.into());
    }

    println!("🛑 Rover {} stopped", config.rover_id);
    Ok(())
}
