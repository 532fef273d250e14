// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! bplink command line tool

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use bplink::bluetooth::ble_constants::config::DEFAULT_MTU;
use bplink::config::Config;
use bplink::protocol::codec_for;
use bplink::sim::{sample_records, SimulatedDevice, SimulatorProfile};
use bplink::{
    events, share_controller, sync_offline, DeviceCapabilities, DeviceFamily, DeviceHandle,
    DeviceIdentifier, DeviceRegistry, MemoryGroup, SyncOptions, SyncReport,
};

/// Retrieve offline measurements from a blood-pressure monitor.
#[derive(Parser, Debug)]
#[command(name = "bplink", version, about)]
struct Args {
    /// Device family: kd5811bt or kn550lt.
    #[arg(long, default_value = "kd5811bt")]
    family: DeviceFamily,

    /// Device MAC address.
    #[arg(long)]
    device: Option<String>,

    /// Memory group: 1, 2 or all.
    #[arg(long, default_value = "1")]
    group: MemoryGroup,

    /// Erase the group after a complete transfer.
    #[arg(long)]
    delete: bool,

    /// Talk to a built-in simulated device instead of Bluetooth.
    #[arg(long)]
    simulate: bool,

    /// Records stored per group on the simulated device.
    #[arg(long, default_value_t = 5)]
    simulate_records: usize,

    /// Configuration file instead of the default location.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Serialize)]
struct Output {
    capabilities: DeviceCapabilities,
    sync: SyncReport,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.logging.filter))
        .context("invalid logging filter")?;
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    info!("Starting bplink v{}...", env!("CARGO_PKG_VERSION"));

    let registry = share_controller(args.family);
    registry.set_session_config(config.family(args.family).session_config());
    tokio::spawn(events::log_events(registry.subscribe()));

    // The simulator handle keeps the simulated device alive for the whole run.
    let (handle, _simulator) = if args.simulate {
        let (handle, device) = attach_simulator(registry, &args);
        (handle, Some(device))
    } else {
        let id = args
            .device
            .clone()
            .context("--device is required unless --simulate is given")?;
        let handle = connect_bluetooth(registry, &config, DeviceIdentifier::new(id)).await?;
        (handle, None)
    };

    let result = run(&handle, &args).await;
    registry.clear().await;

    let output = result?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn run(handle: &DeviceHandle, args: &Args) -> Result<Output> {
    let session = handle.session()?;

    session.synchronize_time().await?;
    let capabilities = session.query_function().await?;
    info!(
        "Firmware {}, {} of {} records in use",
        capabilities.firmware_version,
        session.get_memory_count(args.group).await?,
        capabilities.max_memory_capacity
    );

    let options = SyncOptions {
        delete_after_transfer: args.delete,
    };
    let sync = sync_offline(&session, args.group, options).await?;

    Ok(Output { capabilities, sync })
}

fn attach_simulator(registry: &DeviceRegistry, args: &Args) -> (DeviceHandle, SimulatedDevice) {
    let mut profile = SimulatorProfile {
        group1: sample_records(args.simulate_records, 1),
        ..Default::default()
    };
    if args.family == DeviceFamily::Kd5811bt {
        profile.group2 = sample_records(args.simulate_records, 2);
    }

    let (link, device) = SimulatedDevice::spawn(codec_for(args.family), profile, DEFAULT_MTU);
    let id = DeviceIdentifier::new(args.device.clone().unwrap_or_else(|| "SIMULATED".to_string()));
    (registry.get_or_create_session(id, link), device)
}

#[cfg(feature = "bluez")]
async fn connect_bluetooth(
    registry: &DeviceRegistry,
    config: &Config,
    id: DeviceIdentifier,
) -> Result<DeviceHandle> {
    use bplink::bluetooth::{BluezConnector, Connector};

    let profile = codec_for(registry.family()).descriptor().gatt;
    let connector = BluezConnector::new(
        config.bluetooth.adapter.as_deref(),
        profile,
        config.bluetooth.connect_timeout(),
        config.bluetooth.fallback_mtu,
    )
    .await?;
    let link = connector.connect(&id).await?;
    Ok(registry.get_or_create_session(id, link))
}

#[cfg(not(feature = "bluez"))]
async fn connect_bluetooth(
    _registry: &DeviceRegistry,
    _config: &Config,
    _id: DeviceIdentifier,
) -> Result<DeviceHandle> {
    anyhow::bail!("built without Bluetooth support; use --simulate")
}
