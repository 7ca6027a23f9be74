//! Command-line front end for the WiseFido BLE provisioning core
//!
//! `scan` lists nearby radars on the real Bluetooth adapter. `bench` drives a
//! full scan/connect/configure/query cycle against simulated devices so the
//! provisioning flow can be exercised without hardware.

use clap::{Parser, Subcommand, ValueEnum};
use futures::StreamExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use wisefido_ble_lib::ble_common::{collect_advertisements, BtleplugCentral};
use wisefido_ble_lib::logging::{default_log_dir, init_file_logging};
use wisefido_ble_lib::sim::{SimBlufiClient, SimCentral, SimSleepaceClient};
use wisefido_ble_lib::{
    AdapterFamily, ConfigStorage, ConfigureRequest, DeviceRecord, DiscoveryFilter, ErrorKind,
    FilterType, Orchestrator, ProvisionerConfig, RadarAdapter, ServerProtocol, SessionEvent,
    SleepaceAdapter,
};

#[derive(Parser)]
#[command(name = "wisefido-cli")]
#[command(about = "BLE provisioning tool for WiseFido radars and Sleepace boards")]
struct Cli {
    /// Config file (defaults to the platform config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Also write logs to the default log directory
    #[arg(long)]
    log_file: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum FilterArg {
    Name,
    Mac,
    Uuid,
}

impl From<FilterArg> for FilterType {
    fn from(arg: FilterArg) -> Self {
        match arg {
            FilterArg::Name => FilterType::DeviceName,
            FilterArg::Mac => FilterType::Mac,
            FilterArg::Uuid => FilterType::Uuid,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Scan for radars with the host Bluetooth adapter
    Scan {
        /// Scan duration in seconds (defaults to the configured scan timeout)
        #[arg(short, long)]
        duration: Option<u64>,
        /// Filter kind
        #[arg(short = 't', long, value_enum)]
        filter_type: Option<FilterArg>,
        /// Filter value; defaults to the remembered radar name
        #[arg(short, long)]
        filter: Option<String>,
        /// Show every advertisement, ignoring the filter
        #[arg(short, long)]
        all: bool,
    },
    /// Run a provisioning cycle against simulated devices
    Bench {
        /// WiFi SSID to send
        #[arg(long, default_value = "bench-wifi")]
        ssid: String,
        /// WiFi password
        #[arg(long)]
        password: Option<String>,
        /// Server address to send to the radar
        #[arg(long, default_value = "192.168.1.10")]
        server: String,
        /// Server port
        #[arg(long, default_value = "8080")]
        port: i32,
        /// Use UDP instead of TCP
        #[arg(long)]
        udp: bool,
        /// Record the configuration in the history store
        #[arg(long)]
        remember: bool,
    },
    /// Print remembered WiFi networks and server endpoints
    History,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = match cli.config.clone().or_else(ProvisionerConfig::default_path) {
        Some(path) => ProvisionerConfig::load(&path)?,
        None => ProvisionerConfig::default(),
    };

    if cli.log_file {
        let dir = config.log_dir.clone().or_else(default_log_dir).ok_or("No log directory available")?;
        init_file_logging(&dir)?;
    }

    match cli.command {
        Commands::Scan {
            duration,
            filter_type,
            filter,
            all,
        } => {
            scan_devices(&config, duration, filter_type, filter, all).await?;
        }
        Commands::Bench {
            ssid,
            password,
            server,
            port,
            udp,
            remember,
        } => {
            let protocol = if udp { ServerProtocol::Udp } else { ServerProtocol::Tcp };
            let request = ConfigureRequest::wifi(ssid, password.as_deref()).with_server(server, port, Some(protocol));
            run_bench(&config, &request, remember).await?;
        }
        Commands::History => {
            print_history(&config)?;
        }
    }

    Ok(())
}

fn open_storage(config: &ProvisionerConfig) -> Result<ConfigStorage, Box<dyn std::error::Error>> {
    let path = config.resolved_storage_path().ok_or("No storage location available")?;
    Ok(ConfigStorage::open(path)?)
}

async fn scan_devices(
    config: &ProvisionerConfig,
    duration: Option<u64>,
    filter_type: Option<FilterArg>,
    filter: Option<String>,
    all: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let storage = open_storage(config).ok();
    let filter = if all {
        None
    } else {
        let filter_type = filter_type
            .map(FilterType::from)
            .or_else(|| storage.as_ref().map(|s| s.filter_type()))
            .unwrap_or_default();
        let value = filter
            .or_else(|| storage.as_ref().map(|s| s.radar_device_name()))
            .unwrap_or_else(|| config.radar_name_filter.clone());
        DiscoveryFilter::from_input(filter_type, Some(&value))
    };

    let window = duration
        .map(Duration::from_secs)
        .unwrap_or_else(|| config.timeouts().scan);
    println!("Scanning for radars ({} seconds)...", window.as_secs());

    let central = BtleplugCentral::new().await?;
    let found = collect_advertisements(&central, window).await?;

    let mut shown = 0;
    for adv in found.iter().filter(|a| filter.as_ref().map_or(true, |f| f.matches(a))) {
        let name = adv.local_name.as_deref().unwrap_or("Unknown");
        let addr = adv.address.as_deref().unwrap_or(&adv.peripheral_id);
        let rssi = adv.rssi.map(|r| format!("{r} dBm")).unwrap_or_else(|| "N/A".to_string());
        let marker = if name.starts_with("BLUFI") { " [ESP]" } else { "" };
        println!("  {name} ({addr}) RSSI: {rssi}{marker}");
        shown += 1;
    }
    println!("\nFound {shown} devices ({} advertisements total)", found.len());
    Ok(())
}

/// First record the scan yields, or an error once the scan ends empty.
async fn first_device(
    orchestrator: &Orchestrator,
    family: AdapterFamily,
    filter: Option<DiscoveryFilter>,
) -> Result<DeviceRecord, Box<dyn std::error::Error>> {
    let mut stream = orchestrator.start_scan(family, None, filter).await?;
    let device = stream.next().await.ok_or_else(|| format!("No {family} device found"))?;
    drop(stream);
    orchestrator.stop_scan(family).await;
    Ok(device)
}

async fn run_bench(
    config: &ProvisionerConfig,
    request: &ConfigureRequest,
    remember: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let timeouts = config.timeouts();

    let central = Arc::new(SimCentral::new());
    let blufi = Arc::new(SimBlufiClient::new());
    let radar_name = format!("{}-0001", config.radar_name_filter);
    central.advertise("radar-0001", Some(&radar_name), -48);
    blufi.add_radar("radar-0001", "1.4.2", "A4:C1:38:00:10:01");
    let sleepace = Arc::new(SimSleepaceClient::new());
    sleepace.add_board("board-0001", "BM8701-0001", -62);

    let radar = Arc::new(RadarAdapter::new(central, blufi, timeouts));
    let board = Arc::new(SleepaceAdapter::new(sleepace, timeouts));
    let mut orchestrator = Orchestrator::new(radar, board)?;
    if remember {
        orchestrator = orchestrator.with_storage(Arc::new(open_storage(config)?));
    }

    orchestrator.set_error_callback(Arc::new(|kind: ErrorKind, message: &str| {
        eprintln!("  ! {kind}: {message}");
    }));
    orchestrator.set_completion_callback(Arc::new(|event: &SessionEvent| {
        if let Ok(json) = serde_json::to_string(event) {
            println!("  > {json}");
        }
    }));

    let radar_filter = DiscoveryFilter::name_prefix(config.radar_name_filter.clone());
    for (family, filter) in [(AdapterFamily::Radar, Some(radar_filter)), (AdapterFamily::Sleepace, None)] {
        println!("\n[{family}]");
        let device = first_device(&orchestrator, family, filter).await?;
        println!("  found {} ({})", device.name, device.device_id());

        let device = orchestrator.connect(&device).await?;
        println!("  connected, version {}", device.version.as_deref().unwrap_or("unknown"));

        let report = orchestrator.configure(&device, request).await?;
        println!("  configure: {} (code {})", report.message, report.status_code);

        let device = orchestrator.query_status(&device).await?;
        println!(
            "  wifi: {} connected={} signal={}",
            device.wifi_ssid().unwrap_or("-"),
            device.wifi_connected(),
            device
                .wifi_signal()
                .dbm()
                .map(|d| format!("{d} dBm"))
                .unwrap_or_else(|| "N/A".to_string())
        );

        orchestrator.disconnect(family).await;
    }

    Ok(())
}

fn print_history(config: &ProvisionerConfig) -> Result<(), Box<dyn std::error::Error>> {
    let storage = open_storage(config)?;
    println!("Storage: {}", storage.path().display());
    println!("Radar name filter: {} ({:?})", storage.radar_device_name(), storage.filter_type());

    println!("\nWiFi networks:");
    for entry in storage.wifi_configs() {
        let secured = if entry.password.is_some() { "secured" } else { "open" };
        println!("  {} ({secured})", entry.ssid);
    }
    println!("\nServers:");
    for entry in storage.server_configs() {
        println!("  {}:{} {}", entry.address, entry.port, entry.protocol);
    }
    Ok(())
}
