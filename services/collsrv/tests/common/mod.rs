//! Shared helpers for collsrv integration tests

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use collsrv::codec::{ByteOrder, DisplayFormat, Encoding, FunctionCode};
use collsrv::error::{CollectorError, Result};
use collsrv::model::{
    AlarmSpec, Device, DeviceAssignment, DeviceId, DeviceSpec, Machine, MachineId, MachineSpec, Sensor,
    SensorId, SensorSpec,
};
use collsrv::store::{CycleWriter, ReadingStore, RosterStore};

/// Register and coil image served by [`MockModbusServer`]
#[derive(Default)]
pub struct RegisterBank {
    pub registers: HashMap<u16, u16>,
    pub coils: HashMap<u16, bool>,
}

/// Minimal Modbus TCP slave answering FC01-FC04 from a shared bank
pub struct MockModbusServer {
    pub addr: SocketAddr,
    pub bank: Arc<Mutex<RegisterBank>>,
}

impl MockModbusServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let bank = Arc::new(Mutex::new(RegisterBank::default()));

        let shared = bank.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve_connection(stream, shared.clone()));
            }
        });
        Self { addr, bank }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn set_register(&self, address: u16, value: u16) {
        self.bank.lock().registers.insert(address, value);
    }

    pub fn set_coil(&self, address: u16, value: bool) {
        self.bank.lock().coils.insert(address, value);
    }
}

async fn serve_connection(mut stream: TcpStream, bank: Arc<Mutex<RegisterBank>>) {
    loop {
        let mut header = [0u8; 7];
        if stream.read_exact(&mut header).await.is_err() {
            return;
        }
        let length = usize::from(u16::from_be_bytes([header[4], header[5]]));
        let mut pdu = vec![0u8; length.saturating_sub(1)];
        if stream.read_exact(&mut pdu).await.is_err() {
            return;
        }

        let function = pdu[0];
        let address = u16::from_be_bytes([pdu[1], pdu[2]]);
        let count = u16::from_be_bytes([pdu[3], pdu[4]]);

        let mut body = vec![function];
        {
            let bank = bank.lock();
            match function {
                0x01 | 0x02 => {
                    let mut bytes = vec![0u8; usize::from(count).div_ceil(8)];
                    for i in 0..count {
                        if bank.coils.get(&(address + i)).copied().unwrap_or(false) {
                            bytes[usize::from(i / 8)] |= 1 << (i % 8);
                        }
                    }
                    body.push(bytes.len() as u8);
                    body.extend(bytes);
                },
                0x03 | 0x04 => {
                    body.push((count * 2) as u8);
                    for i in 0..count {
                        let word = bank.registers.get(&(address + i)).copied().unwrap_or(0);
                        body.extend(word.to_be_bytes());
                    }
                },
                _ => {
                    body = vec![function | 0x80, 0x01];
                },
            }
        }

        let mut frame = Vec::with_capacity(7 + body.len());
        frame.extend_from_slice(&header[0..4]);
        frame.extend(((body.len() + 1) as u16).to_be_bytes());
        frame.push(header[6]);
        frame.extend(body);
        if stream.write_all(&frame).await.is_err() {
            return;
        }
    }
}

/// A port with nothing listening
pub async fn closed_port() -> u16 {
    closed_ports(1).await[0]
}

/// `n` distinct ports with nothing listening
pub async fn closed_ports(n: usize) -> Vec<u16> {
    let mut listeners = Vec::with_capacity(n);
    for _ in 0..n {
        listeners.push(TcpListener::bind("127.0.0.1:0").await.unwrap());
    }
    listeners
        .iter()
        .map(|l| l.local_addr().unwrap().port())
        .collect()
}

pub fn register_sensor(code: &str, address: u16) -> SensorSpec {
    SensorSpec {
        code: code.to_string(),
        name: code.to_string(),
        kind: "analog".to_string(),
        unit: "".to_string(),
        address,
        function: FunctionCode::ReadHoldingRegisters,
        encoding: Encoding::Int16,
        byte_order: ByteOrder::BigEndian,
        scale_factor: 1.0,
        offset: 0.0,
        precision: Some(2),
        display: DisplayFormat::Raw,
        value_map: BTreeMap::new(),
        alarm: None,
    }
}

pub fn alarm_sensor(code: &str, address: u16) -> SensorSpec {
    SensorSpec {
        function: FunctionCode::ReadCoils,
        display: DisplayFormat::Boolean,
        alarm: Some(AlarmSpec::default()),
        ..register_sensor(code, address)
    }
}

/// Machine definition file text for one PLC
pub fn machine_yaml(machine: &str, plc: &str, port: u16, poll_s: u64, sensors: &[(&str, u16)]) -> String {
    let mut text = format!(
        "machine:\n  code: {machine}\n  name: {machine}\nplc:\n  code: {plc}\n  name: {plc}\n  \
         protocol: modbus\n  ip_address: 127.0.0.1\n  port: {port}\n  poll_interval_s: {poll_s}\nsensors:\n"
    );
    for (code, address) in sensors {
        text.push_str(&format!(
            "  - code: {code}\n    name: {code}\n    address: {address}\n"
        ));
    }
    text
}

/// Reading store whose cycles can be made to fail on demand
pub struct FlakyStore<S> {
    pub inner: Arc<S>,
    pub fail_cycles: AtomicBool,
}

impl<S> FlakyStore<S> {
    pub fn new(inner: Arc<S>) -> Self {
        Self {
            inner,
            fail_cycles: AtomicBool::new(false),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail_cycles.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl<S: ReadingStore> ReadingStore for FlakyStore<S> {
    async fn sensors_for_device(&self, device_id: DeviceId) -> Result<Vec<Sensor>> {
        self.inner.sensors_for_device(device_id).await
    }

    async fn begin_cycle(&self) -> Result<Box<dyn CycleWriter>> {
        if self.fail_cycles.load(Ordering::SeqCst) {
            return Err(CollectorError::storage("database is locked"));
        }
        self.inner.begin_cycle().await
    }
}

/// Roster store whose sensor inserts can be made to fail on demand
pub struct FlakyRoster<S> {
    pub inner: Arc<S>,
    pub fail_inserts: AtomicBool,
}

impl<S> FlakyRoster<S> {
    pub fn new(inner: Arc<S>) -> Self {
        Self {
            inner,
            fail_inserts: AtomicBool::new(false),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail_inserts.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl<S: RosterStore> RosterStore for FlakyRoster<S> {
    async fn machines(&self) -> Result<Vec<Machine>> {
        self.inner.machines().await
    }

    async fn devices(&self) -> Result<Vec<Device>> {
        self.inner.devices().await
    }

    async fn sensors(&self) -> Result<Vec<Sensor>> {
        self.inner.sensors().await
    }

    async fn insert_machine(&self, spec: &MachineSpec) -> Result<MachineId> {
        self.inner.insert_machine(spec).await
    }

    async fn update_machine(&self, id: MachineId, spec: &MachineSpec) -> Result<()> {
        self.inner.update_machine(id, spec).await
    }

    async fn delete_machine(&self, id: MachineId) -> Result<()> {
        self.inner.delete_machine(id).await
    }

    async fn insert_device(&self, machine_id: MachineId, spec: &DeviceSpec) -> Result<DeviceId> {
        self.inner.insert_device(machine_id, spec).await
    }

    async fn update_device(&self, id: DeviceId, spec: &DeviceSpec) -> Result<()> {
        self.inner.update_device(id, spec).await
    }

    async fn set_device_enabled(&self, id: DeviceId, enabled: bool) -> Result<()> {
        self.inner.set_device_enabled(id, enabled).await
    }

    async fn delete_device(&self, id: DeviceId) -> Result<()> {
        self.inner.delete_device(id).await
    }

    async fn insert_sensor(&self, device_id: DeviceId, spec: &SensorSpec) -> Result<SensorId> {
        if self.fail_inserts.load(Ordering::SeqCst) {
            return Err(CollectorError::storage("database is locked"));
        }
        self.inner.insert_sensor(device_id, spec).await
    }

    async fn update_sensor(&self, id: SensorId, spec: &SensorSpec) -> Result<()> {
        self.inner.update_sensor(id, spec).await
    }

    async fn delete_sensor(&self, id: SensorId) -> Result<()> {
        self.inner.delete_sensor(id).await
    }

    async fn enabled_assignments(&self) -> Result<Vec<DeviceAssignment>> {
        self.inner.enabled_assignments().await
    }
}
