use anyhow::{anyhow, bail, Context, Result};
use ble_hrm::domain::registry::{self, format_device_table, Registry};
use ble_hrm::domain::settings::{Settings, SettingsService};
use ble_hrm::infrastructure::bluetooth::central::{BtleplugCentral, BtleplugPeripheral};
use ble_hrm::infrastructure::bluetooth::{spawn_mock_sensor, SimulatedPeripheral};
use ble_hrm::infrastructure::logging::init_logger;
use ble_hrm::{Peripheral, SampleCallback, StreamKind, StreamingSession};
use std::time::Duration;
use tracing::{info, warn};

const USAGE: &str = "usage: ble-hrm [scan | stream [ibi|ecg|acc] [address] | demo [ibi|acc]]";

#[tokio::main]
async fn main() -> Result<()> {
    let settings_service = SettingsService::new()?;
    let settings = settings_service.get().clone();
    let _log_guard = init_logger(&settings.log_settings)?;
    info!("Starting ble-hrm (settings: {})", settings_service.path().display());

    let registry = registry::global();
    info!("Registered sensors: {:?}", registry.registered_types());

    let args: Vec<String> = std::env::args().skip(1).collect();
    let kind = match args.get(1) {
        Some(kind) => kind.parse()?,
        None => settings.default_stream,
    };

    match args.first().map(String::as_str).unwrap_or("scan") {
        "scan" => {
            let peripherals = scan(&settings).await?;
            let supported = registry.list_supported(peripherals.iter().map(|p| p.identity()));
            println!("{}", format_device_table(&supported));
            Ok(())
        }
        "stream" => {
            let address = args.get(2).cloned().or(settings.preferred_address.clone());
            let peripheral = scan(&settings)
                .await?
                .into_iter()
                .filter(|p| registry.match_device(p.identity()).is_some())
                .find(|p| {
                    address
                        .as_deref()
                        .map_or(true, |a| p.identity().address.eq_ignore_ascii_case(a))
                })
                .ok_or_else(|| anyhow!("No supported device found"))?;
            stream(registry, Box::new(peripheral), kind).await
        }
        "demo" => {
            let peripheral = SimulatedPeripheral::mock_sensor("MOCK001");
            let generator = spawn_mock_sensor(peripheral.clone());
            stream(registry, Box::new(peripheral), kind).await?;
            generator.await?;
            Ok(())
        }
        other => bail!("Unknown command {other:?}\n{USAGE}"),
    }
}

async fn scan(settings: &Settings) -> Result<Vec<BtleplugPeripheral>> {
    let central = BtleplugCentral::new()
        .await
        .context("Bluetooth is not available")?;
    Ok(central
        .scan(Duration::from_millis(settings.scan_timeout_ms))
        .await?)
}

/// Connect, print device info and samples until Ctrl+C, then disconnect.
async fn stream(
    registry: &Registry,
    peripheral: Box<dyn Peripheral>,
    kind: StreamKind,
) -> Result<()> {
    let mut session: StreamingSession = registry.create_session(peripheral)?;
    session.connect().await?;

    match session.device_info().await {
        Ok(info) => println!("{info}"),
        Err(e) => warn!("Could not read device info: {}", e),
    }

    session
        .start_stream(kind, SampleCallback::from_fn(|sample| println!("{sample}")))
        .await?;

    println!(
        "Streaming {kind} from {}. Press Ctrl+C to stop.",
        session.identity().display_name()
    );
    tokio::signal::ctrl_c().await?;

    session.stop_stream(kind).await?;
    session.disconnect().await?;
    println!("\nStream stopped by user.");
    Ok(())
}
