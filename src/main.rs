//! gattq demonstration
//!
//! Runs a scripted session against an auto-responding mock radio and prints
//! every published event as JSON.

use std::time::Duration;

use gattq::ble::{uuid_from_u16, GattCharacteristic};
use gattq::{
    CharacteristicId, GattClient, GattConfig, GattEvent, GattService, OperationId, OperationStatus,
    WriteType,
};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    let config = GattConfig::load(std::env::var("GATTQ_CONFIG").ok().as_deref().map(std::path::Path::new))?;
    gattq::util::logging::init(config.log_level.as_deref());

    info!("🚀 Starting gattq demonstration...");

    let heart_rate = uuid_from_u16(0x180d);
    let measurement = CharacteristicId::new(heart_rate, uuid_from_u16(0x2a37));
    let control_point = CharacteristicId::new(heart_rate, uuid_from_u16(0x2a39));

    let (client, radio) = GattClient::with_mock(config)?;
    let radio = radio.with_services(vec![GattService {
        uuid: heart_rate,
        primary: true,
        characteristics: vec![
            GattCharacteristic {
                id: measurement,
                properties: 0x10,
                descriptors: vec![gattq::ble::CCCD_UUID],
            },
            GattCharacteristic {
                id: control_point,
                properties: 0x08,
                descriptors: vec![],
            },
        ],
    }]);
    radio.set_value(measurement, vec![0x00, 0x48]);

    let (_, mut events) = client.subscribe_channel();

    let handle = client.connect("AA:BB:CC:DD:EE:FF").await?;
    info!("📡 Connecting {}", handle);

    // Fired back to back; the queue serializes them
    client.discover_services(&handle).await?;
    client.request_mtu(&handle, 517).await?;
    client.read_characteristic(&handle, measurement).await?;
    client
        .write_characteristic(&handle, control_point, vec![0x01], WriteType::WithResponse)
        .await?;
    let subscribed = client.enable_notifications(&handle, measurement, true, false).await?;
    print_until(&mut events, subscribed).await?;

    // Close jumps ahead of anything still queued, so only issue it once idle
    let close = client.close(&handle).await?;
    if let Some(status) = print_until(&mut events, close).await? {
        info!("🔒 Close finished with {:?}", status);
    }

    info!("📊 {} radio calls issued", radio.calls().len());
    client.shutdown().await?;
    info!("✅ Demonstration complete");
    Ok(())
}

/// Print events as JSON until `operation` resolves; None if the stream goes quiet
async fn print_until(
    events: &mut UnboundedReceiver<GattEvent>,
    operation: OperationId,
) -> anyhow::Result<Option<OperationStatus>> {
    loop {
        let Ok(Some(event)) = tokio::time::timeout(Duration::from_secs(2), events.recv()).await else {
            warn!("⚠️ No outcome for {}", operation);
            return Ok(None);
        };
        println!("{}", event.to_json()?);
        if event.operation_id() == Some(operation) {
            return Ok(event.status());
        }
    }
}
