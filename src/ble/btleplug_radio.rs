//! Desktop radio binding over btleplug
//!
//! btleplug exposes async calls; each `NativeRadio` method spawns the call
//! on the runtime and reports the result through the event sink, so the
//! queue sees the same issue-then-callback shape as on mobile stacks.

use btleplug::api::{
    Central, CentralEvent, Characteristic, Descriptor, Manager as _, Peripheral as _, ScanFilter,
    WriteType as BtWriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use tokio::runtime::Handle;

use super::events::{GattCallback, NativeConnectionState, NativeEvent};
use super::radio::{NativeRadio, RadioError};
use super::types::{
    CharacteristicId, ConnectionHandle, DescriptorId, DiscoveredDevice, GattCharacteristic,
    GattService, WriteType,
};
use super::{CCCD_UUID, GATT_FAILURE, GATT_REQUEST_NOT_SUPPORTED, GATT_SUCCESS};
use crate::client::NativeEventSink;

type PeripheralMap = Arc<Mutex<HashMap<ConnectionHandle, Peripheral>>>;
type HandleSet = Arc<Mutex<HashSet<ConnectionHandle>>>;

/// btleplug-backed radio using the first available adapter
pub struct BtleplugRadio {
    adapter: Adapter,
    runtime: Handle,
    sink: NativeEventSink,
    peripherals: PeripheralMap,
    /// Connect attempts still running; closing a handle removes it here
    connecting: HandleSet,
}

impl BtleplugRadio {
    /// Open the first adapter and start forwarding adapter events.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn new(sink: NativeEventSink) -> Result<Self, RadioError> {
        let manager = Manager::new().await?;
        let adapters = manager.adapters().await?;
        let adapter = adapters
            .into_iter()
            .next()
            .ok_or_else(|| RadioError::Platform("no BLE adapter found".to_string()))?;

        let radio = Self {
            adapter,
            runtime: Handle::current(),
            sink,
            peripherals: Arc::new(Mutex::new(HashMap::new())),
            connecting: Arc::new(Mutex::new(HashSet::new())),
        };
        radio.forward_adapter_events().await?;
        tracing::info!("✅ btleplug radio ready");
        Ok(radio)
    }

    /// Start scanning; found devices arrive as `DeviceFound` events
    pub async fn start_scan(&self) -> Result<(), RadioError> {
        let result = self.adapter.start_scan(ScanFilter::default()).await;
        self.sink.deliver(NativeEvent::ScanStarted {
            success: result.is_ok(),
        });
        Ok(result?)
    }

    pub async fn stop_scan(&self) -> Result<(), RadioError> {
        self.adapter.stop_scan().await?;
        self.sink.deliver(NativeEvent::ScanCompleted);
        Ok(())
    }

    async fn forward_adapter_events(&self) -> Result<(), RadioError> {
        let mut events = self.adapter.events().await?;
        let adapter = self.adapter.clone();
        let sink = self.sink.clone();
        let peripherals = self.peripherals.clone();

        self.runtime.spawn(async move {
            while let Some(event) = events.next().await {
                match event {
                    CentralEvent::DeviceDiscovered(id) => {
                        let Ok(peripheral) = adapter.peripheral(&id).await else {
                            continue;
                        };
                        if let Ok(Some(props)) = peripheral.properties().await {
                            sink.deliver(NativeEvent::DeviceFound(DiscoveredDevice {
                                address: props.address.to_string(),
                                name: props.local_name,
                                rssi: props.rssi,
                                manufacturer_data: props
                                    .manufacturer_data
                                    .into_values()
                                    .next()
                                    .unwrap_or_default(),
                            }));
                        }
                    }
                    CentralEvent::DeviceDisconnected(id) => {
                        let handles: Vec<_> = {
                            let mut map = peripherals.lock();
                            let handles: Vec<_> = map
                                .iter()
                                .filter(|(_, p)| p.id() == id)
                                .map(|(h, _)| h.clone())
                                .collect();
                            for handle in &handles {
                                map.remove(handle);
                            }
                            handles
                        };
                        for handle in handles {
                            sink.deliver(NativeEvent::Gatt(
                                handle,
                                GattCallback::ConnectionStateChanged {
                                    status: GATT_SUCCESS,
                                    new_state: NativeConnectionState::Disconnected,
                                },
                            ));
                        }
                    }
                    _ => {}
                }
            }
            tracing::debug!("Adapter event stream ended");
        });
        Ok(())
    }

    fn peripheral(&self, handle: &ConnectionHandle) -> Result<Peripheral, RadioError> {
        self.peripherals
            .lock()
            .get(handle)
            .cloned()
            .ok_or(RadioError::NotConnected)
    }

    fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.runtime.spawn(task);
    }
}

async fn find_by_address(adapter: &Adapter, address: &str) -> Result<Peripheral, RadioError> {
    for peripheral in adapter.peripherals().await? {
        if peripheral.id().to_string() == address {
            return Ok(peripheral);
        }
        if let Ok(Some(props)) = peripheral.properties().await {
            if props.address.to_string().eq_ignore_ascii_case(address) {
                return Ok(peripheral);
            }
        }
    }
    Err(RadioError::AttributeNotFound(address.to_string()))
}

fn find_characteristic(peripheral: &Peripheral, id: &CharacteristicId) -> Option<Characteristic> {
    peripheral
        .characteristics()
        .into_iter()
        .find(|c| c.uuid == id.uuid && c.service_uuid == id.service)
}

fn find_descriptor(peripheral: &Peripheral, id: &DescriptorId) -> Option<Descriptor> {
    find_characteristic(peripheral, &id.characteristic)?
        .descriptors
        .into_iter()
        .find(|d| d.uuid == id.uuid)
}

fn status_of<T, E>(result: &Result<T, E>) -> i32 {
    if result.is_ok() {
        GATT_SUCCESS
    } else {
        GATT_FAILURE
    }
}

fn convert_services(peripheral: &Peripheral) -> Vec<GattService> {
    peripheral
        .services()
        .into_iter()
        .map(|service| GattService {
            uuid: service.uuid,
            primary: service.primary,
            characteristics: service
                .characteristics
                .into_iter()
                .map(|c| GattCharacteristic {
                    id: CharacteristicId::new(c.service_uuid, c.uuid),
                    properties: c.properties.bits(),
                    descriptors: c.descriptors.into_iter().map(|d| d.uuid).collect(),
                })
                .collect(),
        })
        .collect()
}

impl NativeRadio for BtleplugRadio {
    fn connect(&mut self, handle: &ConnectionHandle) -> Result<(), RadioError> {
        let adapter = self.adapter.clone();
        let sink = self.sink.clone();
        let peripherals = self.peripherals.clone();
        let connecting = self.connecting.clone();
        let handle = handle.clone();
        connecting.lock().insert(handle.clone());

        self.spawn(async move {
            let connected = async {
                let peripheral = find_by_address(&adapter, &handle.address).await?;
                peripheral.connect().await?;
                Ok::<_, RadioError>(peripheral)
            }
            .await;

            let still_wanted = connecting.lock().remove(&handle);
            let (status, new_state) = match connected {
                Ok(peripheral) if !still_wanted => {
                    tracing::debug!("Dropping late link to {}, handle already closed", handle);
                    let _ = peripheral.disconnect().await;
                    return;
                }
                Ok(peripheral) => {
                    peripherals.lock().insert(handle.clone(), peripheral.clone());
                    if let Ok(mut values) = peripheral.notifications().await {
                        let sink = sink.clone();
                        let handle = handle.clone();
                        tokio::spawn(async move {
                            while let Some(n) = values.next().await {
                                sink.deliver(NativeEvent::Gatt(
                                    handle.clone(),
                                    GattCallback::CharacteristicChanged {
                                        id: CharacteristicId::new(n.service_uuid, n.uuid),
                                        value: n.value,
                                    },
                                ));
                            }
                        });
                    }
                    (GATT_SUCCESS, NativeConnectionState::Connected)
                }
                Err(e) => {
                    tracing::warn!("⚠️ Connect to {} failed: {}", handle, e);
                    (GATT_FAILURE, NativeConnectionState::Disconnected)
                }
            };
            sink.deliver(NativeEvent::Gatt(
                handle,
                GattCallback::ConnectionStateChanged { status, new_state },
            ));
        });
        Ok(())
    }

    fn discover_services(&mut self, handle: &ConnectionHandle) -> Result<(), RadioError> {
        let peripheral = self.peripheral(handle)?;
        let sink = self.sink.clone();
        let handle = handle.clone();

        self.spawn(async move {
            let result = peripheral.discover_services().await;
            let services = if result.is_ok() {
                convert_services(&peripheral)
            } else {
                Vec::new()
            };
            sink.deliver(NativeEvent::Gatt(
                handle,
                GattCallback::ServicesDiscovered {
                    status: status_of(&result),
                    services,
                },
            ));
        });
        Ok(())
    }

    fn read_characteristic(
        &mut self,
        handle: &ConnectionHandle,
        id: &CharacteristicId,
    ) -> Result<(), RadioError> {
        let peripheral = self.peripheral(handle)?;
        let characteristic = find_characteristic(&peripheral, id)
            .ok_or_else(|| RadioError::AttributeNotFound(id.to_string()))?;
        let sink = self.sink.clone();
        let handle = handle.clone();
        let id = *id;

        self.spawn(async move {
            let result = peripheral.read(&characteristic).await;
            let status = status_of(&result);
            sink.deliver(NativeEvent::Gatt(
                handle,
                GattCallback::CharacteristicRead {
                    id,
                    status,
                    value: result.unwrap_or_default(),
                },
            ));
        });
        Ok(())
    }

    fn write_characteristic(
        &mut self,
        handle: &ConnectionHandle,
        id: &CharacteristicId,
        value: &[u8],
        write_type: WriteType,
    ) -> Result<(), RadioError> {
        let peripheral = self.peripheral(handle)?;
        let characteristic = find_characteristic(&peripheral, id)
            .ok_or_else(|| RadioError::AttributeNotFound(id.to_string()))?;
        let sink = self.sink.clone();
        let handle = handle.clone();
        let id = *id;
        let value = value.to_vec();
        let write_type = match write_type {
            WriteType::WithResponse => BtWriteType::WithResponse,
            WriteType::WithoutResponse => BtWriteType::WithoutResponse,
        };

        self.spawn(async move {
            let result = peripheral.write(&characteristic, &value, write_type).await;
            sink.deliver(NativeEvent::Gatt(
                handle,
                GattCallback::CharacteristicWrite {
                    id,
                    status: status_of(&result),
                },
            ));
        });
        Ok(())
    }

    fn read_descriptor(
        &mut self,
        handle: &ConnectionHandle,
        id: &DescriptorId,
    ) -> Result<(), RadioError> {
        let peripheral = self.peripheral(handle)?;
        let descriptor = find_descriptor(&peripheral, id)
            .ok_or_else(|| RadioError::AttributeNotFound(id.to_string()))?;
        let sink = self.sink.clone();
        let handle = handle.clone();
        let id = *id;

        self.spawn(async move {
            let result = peripheral.read_descriptor(&descriptor).await;
            let status = status_of(&result);
            sink.deliver(NativeEvent::Gatt(
                handle,
                GattCallback::DescriptorRead {
                    id,
                    status,
                    value: result.unwrap_or_default(),
                },
            ));
        });
        Ok(())
    }

    fn write_descriptor(
        &mut self,
        handle: &ConnectionHandle,
        id: &DescriptorId,
        value: &[u8],
    ) -> Result<(), RadioError> {
        let peripheral = self.peripheral(handle)?;
        let sink = self.sink.clone();
        let handle = handle.clone();
        let id = *id;
        let value = value.to_vec();

        // btleplug owns the CCCD: map the write onto subscribe/unsubscribe
        if id.uuid == CCCD_UUID {
            let characteristic = find_characteristic(&peripheral, &id.characteristic)
                .ok_or_else(|| RadioError::AttributeNotFound(id.characteristic.to_string()))?;
            self.spawn(async move {
                let result = if value.iter().any(|b| *b != 0) {
                    peripheral.subscribe(&characteristic).await
                } else {
                    peripheral.unsubscribe(&characteristic).await
                };
                sink.deliver(NativeEvent::Gatt(
                    handle,
                    GattCallback::DescriptorWrite {
                        id,
                        status: status_of(&result),
                    },
                ));
            });
            return Ok(());
        }

        let descriptor = find_descriptor(&peripheral, &id)
            .ok_or_else(|| RadioError::AttributeNotFound(id.to_string()))?;
        self.spawn(async move {
            let result = peripheral.write_descriptor(&descriptor, &value).await;
            sink.deliver(NativeEvent::Gatt(
                handle,
                GattCallback::DescriptorWrite {
                    id,
                    status: status_of(&result),
                },
            ));
        });
        Ok(())
    }

    fn request_mtu(&mut self, handle: &ConnectionHandle, mtu: u16) -> Result<(), RadioError> {
        self.peripheral(handle)?;
        // MTU negotiation is done by the OS; report the request as unsupported
        self.sink.deliver(NativeEvent::Gatt(
            handle.clone(),
            GattCallback::MtuChanged {
                mtu,
                status: GATT_REQUEST_NOT_SUPPORTED,
            },
        ));
        Ok(())
    }

    fn set_characteristic_notification(
        &mut self,
        handle: &ConnectionHandle,
        _id: &CharacteristicId,
        _enable: bool,
    ) -> Result<(), RadioError> {
        // Routing is always on; the CCCD write does the real work
        self.peripheral(handle).map(|_| ())
    }

    fn disconnect(&mut self, handle: &ConnectionHandle) -> Result<(), RadioError> {
        let peripheral = self.peripheral(handle)?;
        let sink = self.sink.clone();
        let peripherals = self.peripherals.clone();
        let handle = handle.clone();

        self.spawn(async move {
            if let Err(e) = peripheral.disconnect().await {
                tracing::warn!("⚠️ Disconnect of {} failed: {}", handle, e);
            }
            peripherals.lock().remove(&handle);
            // The adapter event stream may report this too; a second
            // Disconnected is a no-op for the state machine.
            sink.deliver(NativeEvent::Gatt(
                handle,
                GattCallback::ConnectionStateChanged {
                    status: GATT_SUCCESS,
                    new_state: NativeConnectionState::Disconnected,
                },
            ));
        });
        Ok(())
    }

    fn close(&mut self, handle: &ConnectionHandle) -> Result<(), RadioError> {
        self.connecting.lock().remove(handle);
        if let Some(peripheral) = self.peripherals.lock().remove(handle) {
            self.spawn(async move {
                let _ = peripheral.disconnect().await;
            });
        }
        Ok(())
    }
}
