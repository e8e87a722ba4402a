//! Network interface renamer (C6): `RTM_SETLINK` with `IFLA_IFNAME` over a
//! raw `rtnetlink` socket.
//!
//! `libc` does not expose the route-netlink wire structs, so they are
//! hand-rolled here as `repr(C)` types, following the same raw
//! `AF_NETLINK` socket idiom the crate already uses for uevent monitoring
//! in `netlink_monitor.rs` — just a different netlink family and message
//! type.

use anyhow::{anyhow, Result};
use std::mem::size_of;
use thiserror::Error;
use tracing::debug;

const NETLINK_ROUTE: i32 = 0;
const RTM_SETLINK: u16 = 19;
const NLM_F_REQUEST: u16 = 0x01;
const NLM_F_ACK: u16 = 0x04;
const IFLA_IFNAME: u16 = 3;
const IFNAMSIZ: usize = 16;
const NLMSG_ALIGNTO: usize = 4;

#[derive(Debug, Error)]
pub enum RenameError {
    #[error("interface name '{0}' is too long (max {IFNAMSIZ} bytes including NUL)")]
    NameTooLong(String),
    #[error("netlink socket error: {0}")]
    Socket(String),
    #[error("kernel rejected rename: {0}")]
    Rejected(String),
}

#[repr(C)]
#[derive(Clone, Copy)]
struct NlMsgHdr {
    len: u32,
    msg_type: u16,
    flags: u16,
    seq: u32,
    pid: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct IfInfoMsg {
    family: u8,
    _pad: u8,
    if_type: u16,
    index: i32,
    flags: u32,
    change: u32,
}

fn align(len: usize) -> usize {
    (len + NLMSG_ALIGNTO - 1) & !(NLMSG_ALIGNTO - 1)
}

fn push_struct<T: Copy>(buf: &mut Vec<u8>, value: &T) {
    let size = size_of::<T>();
    let ptr = value as *const T as *const u8;
    let bytes = unsafe { std::slice::from_raw_parts(ptr, size) };
    buf.extend_from_slice(bytes);
    buf.resize(align(buf.len()), 0);
}

fn push_attr(buf: &mut Vec<u8>, attr_type: u16, payload: &[u8]) {
    let attr_len = 4 + payload.len();
    buf.extend_from_slice(&(attr_len as u16).to_ne_bytes());
    buf.extend_from_slice(&attr_type.to_ne_bytes());
    buf.extend_from_slice(payload);
    buf.resize(align(buf.len()), 0);
}

fn build_setlink_message(seq: u32, ifindex: i32, new_name: &str) -> Vec<u8> {
    let mut body = Vec::new();

    let ifinfo = IfInfoMsg {
        family: libc::AF_UNSPEC as u8,
        _pad: 0,
        if_type: 0,
        index: ifindex,
        flags: 0,
        change: 0,
    };
    push_struct(&mut body, &ifinfo);

    let mut name_bytes = new_name.as_bytes().to_vec();
    name_bytes.push(0);
    push_attr(&mut body, IFLA_IFNAME, &name_bytes);

    let mut msg = Vec::new();
    let total_len = align(size_of::<NlMsgHdr>()) + body.len();
    let hdr = NlMsgHdr {
        len: total_len as u32,
        msg_type: RTM_SETLINK,
        flags: NLM_F_REQUEST | NLM_F_ACK,
        seq,
        pid: 0,
    };
    push_struct(&mut msg, &hdr);
    msg.extend_from_slice(&body);

    msg
}

/// Lazily-created rtnetlink handle, reused within one event.
pub struct RtnlHandle {
    socket: i32,
    seq: u32,
}

impl RtnlHandle {
    pub fn new() -> Result<Self> {
        let socket = unsafe {
            libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC,
                NETLINK_ROUTE,
            )
        };
        if socket < 0 {
            return Err(RenameError::Socket(std::io::Error::last_os_error().to_string()).into());
        }

        let mut addr: libc::sockaddr_nl = unsafe { std::mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as u16;

        let result = unsafe {
            libc::bind(
                socket,
                &addr as *const _ as *const libc::sockaddr,
                size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if result < 0 {
            let err = std::io::Error::last_os_error();
            unsafe { libc::close(socket) };
            return Err(RenameError::Socket(err.to_string()).into());
        }

        Ok(Self { socket, seq: 1 })
    }

    /// Send `RTM_SETLINK` renaming `ifindex` to `new_name`, and wait for
    /// the kernel's ack/error reply.
    pub fn set_link_name(&mut self, ifindex: i32, new_name: &str) -> Result<()> {
        if new_name.len() >= IFNAMSIZ {
            return Err(RenameError::NameTooLong(new_name.to_string()).into());
        }

        let seq = self.seq;
        self.seq = self.seq.wrapping_add(1);

        let msg = build_setlink_message(seq, ifindex, new_name);

        let sent = unsafe { libc::send(self.socket, msg.as_ptr() as *const libc::c_void, msg.len(), 0) };
        if sent < 0 {
            return Err(RenameError::Socket(std::io::Error::last_os_error().to_string()).into());
        }

        let mut buf = vec![0u8; 4096];
        let received = unsafe {
            libc::recv(self.socket, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0)
        };
        if received < 0 {
            return Err(RenameError::Socket(std::io::Error::last_os_error().to_string()).into());
        }

        parse_ack(&buf[..received as usize])
    }
}

impl Drop for RtnlHandle {
    fn drop(&mut self) {
        unsafe { libc::close(self.socket) };
    }
}

/// An ack carries an embedded `errno` (0 on success) after the nlmsghdr.
fn parse_ack(data: &[u8]) -> Result<()> {
    if data.len() < size_of::<NlMsgHdr>() + 4 {
        return Err(anyhow!("short netlink ack"));
    }

    let errno = i32::from_ne_bytes(
        data[size_of::<NlMsgHdr>()..size_of::<NlMsgHdr>() + 4]
            .try_into()
            .unwrap(),
    );

    if errno == 0 {
        Ok(())
    } else {
        let err = std::io::Error::from_raw_os_error(-errno);
        Err(RenameError::Rejected(err.to_string()).into())
    }
}

/// Renames `ifindex` from `old_name` to `new_name`, reusing `rtnl` if
/// already initialized, lazily creating it otherwise.
pub fn rename_netif(rtnl: &mut Option<RtnlHandle>, ifindex: i32, old_name: &str, new_name: &str) -> Result<()> {
    if rtnl.is_none() {
        *rtnl = Some(RtnlHandle::new()?);
    }
    let handle = rtnl.as_mut().unwrap();

    handle.set_link_name(ifindex, new_name)?;
    debug!("renamed network interface '{}' to '{}'", old_name, new_name);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_too_long_is_rejected_before_any_syscall() {
        let mut rtnl = None;
        let err = rename_netif(&mut rtnl, 4, "eth0", "this-name-is-way-too-long-for-ifnamsiz");
        assert!(err.is_err());
    }

    #[test]
    fn message_layout_is_nlmsg_aligned() {
        let msg = build_setlink_message(1, 4, "wan0");
        assert_eq!(msg.len() % NLMSG_ALIGNTO, 0);
        let hdr_len = u32::from_ne_bytes(msg[0..4].try_into().unwrap());
        assert_eq!(hdr_len as usize, msg.len());
    }
}
