//! Kernel uevent receiver, generalizing the prior raw-socket monitor to
//! hand the orchestrator a ready-to-use [`Device`] instead of a loose
//! bag of strings: every `KEY=VALUE` line is folded into the device's
//! properties and the well-known keys (`SUBSYSTEM`, `DEVTYPE`,
//! `DEVNAME`, `MAJOR`/`MINOR`, `SEQNUM`) are additionally parsed out.

use crate::device::{Action, Device};
use anyhow::{anyhow, Result};
use tracing::{debug, error};

const NETLINK_KOBJECT_UEVENT: i32 = 15;
const UDEV_MONITOR_KERNEL: u32 = 1;

pub struct NetlinkMonitor {
    socket: i32,
    buffer: Vec<u8>,
}

impl NetlinkMonitor {
    pub fn new() -> Result<Self> {
        let socket = unsafe {
            libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_DGRAM | libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
                NETLINK_KOBJECT_UEVENT,
            )
        };
        if socket < 0 {
            return Err(anyhow!("failed to create netlink socket"));
        }

        let mut addr: libc::sockaddr_nl = unsafe { std::mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as u16;
        addr.nl_groups = UDEV_MONITOR_KERNEL;

        let result = unsafe {
            libc::bind(
                socket,
                &addr as *const _ as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if result < 0 {
            unsafe { libc::close(socket) };
            return Err(anyhow!("failed to bind netlink socket"));
        }

        Ok(Self { socket, buffer: vec![0u8; 8192] })
    }

    /// Block (off the async executor thread) until the next uevent
    /// arrives, then parse it into a [`Device`]. Returns `Ok(None)` on a
    /// malformed datagram, logging the reason, so the caller's loop can
    /// simply continue.
    pub async fn recv_device(&mut self) -> Result<Option<Device>> {
        let fd = self.socket;
        let mut buf = std::mem::take(&mut self.buffer);

        let (len, buf) = tokio::task::spawn_blocking(move || {
            let len = unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) };
            (len, buf)
        })
        .await?;

        self.buffer = buf;

        if len <= 0 {
            return Ok(None);
        }

        let data = &self.buffer[..len as usize];
        match parse_uevent(data) {
            Ok(pair) => Ok(Some(pair)),
            Err(e) => {
                error!("malformed uevent datagram: {}", e);
                Ok(None)
            }
        }
    }
}

impl Drop for NetlinkMonitor {
    fn drop(&mut self) {
        unsafe { libc::close(self.socket) };
    }
}

fn parse_uevent(data: &[u8]) -> Result<Device> {
    let mut parts = data.split(|&b| b == 0);

    let header = parts
        .next()
        .and_then(|h| std::str::from_utf8(h).ok())
        .ok_or_else(|| anyhow!("invalid uevent header"))?;

    let (action_str, devpath_suffix) = header.split_once('@').ok_or_else(|| anyhow!("invalid uevent format"))?;
    let action: Action = action_str.parse()?;
    let devpath = format!("/sys{}", devpath_suffix);
    let sysname = devpath.rsplit('/').next().unwrap_or("").to_string();

    let mut dev = Device::new(&devpath, &sysname, action);

    for part in parts {
        if part.is_empty() {
            continue;
        }
        let Ok(s) = std::str::from_utf8(part) else { continue };
        let Some((key, value)) = s.split_once('=') else { continue };

        match key {
            "SUBSYSTEM" => dev.subsystem = Some(value.to_string()),
            "DEVTYPE" => dev.devtype = Some(value.to_string()),
            "DEVNAME" => dev.devnode = Some(format!("/dev/{}", value)),
            "MAJOR" => dev.major = value.parse().ok(),
            "MINOR" => dev.minor = value.parse().ok(),
            "IFINDEX" => dev.ifindex = value.parse().ok(),
            "DRIVER" => dev.driver = Some(value.to_string()),
            _ => dev.properties.insert(key, value),
        }
    }

    debug!("parsed uevent: {} {} {:?}", dev.action, dev.devpath, dev.subsystem);
    Ok(dev)
}

/// Write-to-`uevent`-file trigger, used by the `trigger` control command
/// to replay add/change events for already-present devices.
pub fn trigger_event(action: &str, syspath: &str) -> Result<()> {
    let uevent_path = format!("{}/uevent", syspath);
    std::fs::write(&uevent_path, action)?;
    Ok(())
}

pub fn trigger_subsystem(subsystem: &str, action: &str) -> Result<()> {
    let class_path = format!("/sys/class/{}", subsystem);
    if !std::path::Path::new(&class_path).exists() {
        return Err(anyhow!("subsystem not found: {}", subsystem));
    }

    for entry in std::fs::read_dir(&class_path)? {
        let entry = entry?;
        let uevent_path = entry.path().join("uevent");
        if uevent_path.exists() {
            let _ = std::fs::write(&uevent_path, action);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_header_and_well_known_keys() {
        let mut data = b"add@/devices/virtual/block/loop0".to_vec();
        data.push(0);
        data.extend_from_slice(b"SUBSYSTEM=block");
        data.push(0);
        data.extend_from_slice(b"DEVNAME=loop0");
        data.push(0);
        data.extend_from_slice(b"MAJOR=7");
        data.push(0);
        data.extend_from_slice(b"MINOR=0");
        data.push(0);

        let dev = parse_uevent(&data).unwrap();
        assert_eq!(dev.action, Action::Add);
        assert_eq!(dev.subsystem.as_deref(), Some("block"));
        assert_eq!(dev.major, Some(7));
        assert_eq!(dev.minor, Some(0));
    }

    #[test]
    fn unknown_keys_become_properties() {
        let mut data = b"change@/devices/virtual/net/eth0".to_vec();
        data.push(0);
        data.extend_from_slice(b"ID_NET_DRIVER=e1000e");
        data.push(0);

        let dev = parse_uevent(&data).unwrap();
        assert_eq!(dev.property("ID_NET_DRIVER"), Some("e1000e"));
    }

    #[test]
    fn missing_at_sign_is_rejected() {
        let data = b"add-devices-virtual".to_vec();
        assert!(parse_uevent(&data).is_err());
    }
}
