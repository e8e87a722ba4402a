//! Control-socket IPC: a narrow, out-of-core surface for listing known
//! devices, inspecting one, and replaying uevents. Rule evaluation and
//! node management happen in the event path, not here — this module
//! only ever reads the shared device table or writes to a `uevent` file
//! to trigger a fresh kernel event.

use crate::device::{Device, DeviceDatabase, DeviceFilter};
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::RwLock;
use tracing::{debug, error, info};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum IpcRequest {
    ListDevices { subsystem: Option<String> },
    GetDevice { path: String },
    Trigger { subsystem: Option<String>, action: String },
    Settle,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum IpcResponse {
    Success { message: String },
    Devices(Vec<DeviceInfo>),
    Device(DeviceInfo),
    Error { message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub syspath: String,
    pub devpath: String,
    pub subsystem: Option<String>,
    pub devtype: Option<String>,
    pub devnode: Option<String>,
    pub driver: Option<String>,
    pub sysname: String,
    pub properties: HashMap<String, String>,
}

impl From<&Device> for DeviceInfo {
    fn from(device: &Device) -> Self {
        Self {
            syspath: device.syspath.clone(),
            devpath: device.devpath.clone(),
            subsystem: device.subsystem.clone(),
            devtype: device.devtype.clone(),
            devnode: device.devnode.clone(),
            driver: device.driver.clone(),
            sysname: device.sysname.clone(),
            properties: device.properties.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        }
    }
}

pub struct PhantomServer {
    socket_path: PathBuf,
    devices: Arc<RwLock<DeviceDatabase>>,
}

impl PhantomServer {
    pub fn new(socket_path: PathBuf, devices: Arc<RwLock<DeviceDatabase>>) -> Self {
        Self { socket_path, devices }
    }

    pub async fn run(&self) -> Result<()> {
        let _ = std::fs::remove_file(&self.socket_path);

        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(&self.socket_path)?;
        info!("control socket listening on {:?}", self.socket_path);

        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let devices = self.devices.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_client(stream, devices).await {
                            error!("client error: {}", e);
                        }
                    });
                }
                Err(e) => error!("accept error: {}", e),
            }
        }
    }
}

async fn handle_client(stream: UnixStream, devices: Arc<RwLock<DeviceDatabase>>) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    while reader.read_line(&mut line).await? > 0 {
        let response = match serde_json::from_str::<IpcRequest>(&line) {
            Ok(request) => process_request(request, &devices).await,
            Err(e) => IpcResponse::Error { message: e.to_string() },
        };

        let json = serde_json::to_string(&response)?;
        writer.write_all(json.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;

        line.clear();
    }

    Ok(())
}

async fn process_request(request: IpcRequest, devices: &RwLock<DeviceDatabase>) -> IpcResponse {
    match request {
        IpcRequest::ListDevices { subsystem } => {
            let db = devices.read().await;
            let filter = DeviceFilter { subsystem, devtype: None, driver: None };
            let list: Vec<DeviceInfo> = db.find(&filter).into_iter().map(DeviceInfo::from).collect();
            IpcResponse::Devices(list)
        }

        IpcRequest::GetDevice { path } => {
            let db = devices.read().await;
            match db.get(&path) {
                Some(device) => IpcResponse::Device(DeviceInfo::from(device)),
                None => IpcResponse::Error { message: format!("device not found: {}", path) },
            }
        }

        IpcRequest::Trigger { subsystem, action } => {
            let Some(subsystem) = subsystem else {
                return IpcResponse::Error { message: "trigger requires --subsystem".to_string() };
            };
            match crate::netlink_monitor::trigger_subsystem(&subsystem, &action) {
                Ok(()) => IpcResponse::Success { message: format!("triggered {} for {}", action, subsystem) },
                Err(e) => IpcResponse::Error { message: e.to_string() },
            }
        }

        IpcRequest::Settle => {
            tokio::time::sleep(std::time::Duration::from_millis(500)).await;
            IpcResponse::Success { message: "settled".to_string() }
        }
    }
}

pub struct PhantomClient {
    socket_path: PathBuf,
}

impl PhantomClient {
    pub fn new(socket_path: PathBuf) -> Self {
        Self { socket_path }
    }

    async fn send(&self, request: IpcRequest) -> Result<IpcResponse> {
        let mut stream = UnixStream::connect(&self.socket_path).await?;

        let json = serde_json::to_string(&request)?;
        stream.write_all(json.as_bytes()).await?;
        stream.write_all(b"\n").await?;
        stream.flush().await?;

        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        reader.read_line(&mut line).await?;

        Ok(serde_json::from_str(&line)?)
    }

    pub async fn list_devices(&self, subsystem: Option<&str>) -> Result<Vec<DeviceInfo>> {
        match self.send(IpcRequest::ListDevices { subsystem: subsystem.map(String::from) }).await? {
            IpcResponse::Devices(devices) => Ok(devices),
            IpcResponse::Error { message } => Err(anyhow!(message)),
            _ => Err(anyhow!("unexpected response")),
        }
    }

    pub async fn get_device(&self, path: &str) -> Result<DeviceInfo> {
        match self.send(IpcRequest::GetDevice { path: path.to_string() }).await? {
            IpcResponse::Device(device) => Ok(device),
            IpcResponse::Error { message } => Err(anyhow!(message)),
            _ => Err(anyhow!("unexpected response")),
        }
    }

    pub async fn trigger(&self, subsystem: Option<&str>, action: &str) -> Result<()> {
        match self
            .send(IpcRequest::Trigger { subsystem: subsystem.map(String::from), action: action.to_string() })
            .await?
        {
            IpcResponse::Success { .. } => Ok(()),
            IpcResponse::Error { message } => Err(anyhow!(message)),
            _ => Err(anyhow!("unexpected response")),
        }
    }

    pub async fn settle(&self) -> Result<()> {
        match self.send(IpcRequest::Settle).await? {
            IpcResponse::Success { .. } => Ok(()),
            IpcResponse::Error { message } => Err(anyhow!(message)),
            _ => Err(anyhow!("unexpected response")),
        }
    }
}
