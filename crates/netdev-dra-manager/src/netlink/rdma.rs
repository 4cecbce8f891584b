//! Minimal RDMA netlink (nldev) client. rtnetlink has no RDMA surface, so
//! the two operations the driver needs are spoken raw: resolving an RDMA
//! device index by name, and moving the device into another network
//! namespace by fd. All calls are synchronous and meant to run on a blocking
//! thread.

use netlink_sys::{Socket, SocketAddr};
use std::{io, os::unix::io::RawFd};
use thiserror::Error;

const NETLINK_RDMA: isize = 20;

/// rdma_netlink.h client id and nldev commands.
const RDMA_NL_NLDEV: u16 = 5;
const RDMA_NLDEV_CMD_GET: u16 = 1;
const RDMA_NLDEV_CMD_SET: u16 = 2;

/// nldev attributes.
const RDMA_NLDEV_ATTR_DEV_INDEX: u16 = 2;
const RDMA_NLDEV_ATTR_DEV_NAME: u16 = 3;
const RDMA_NLDEV_NET_NS_FD: u16 = 68;

const NLM_F_REQUEST: u16 = 0x01;
const NLM_F_ACK: u16 = 0x04;
const NLM_F_DUMP: u16 = 0x100 | 0x200;

const NLMSG_ERROR: u16 = 0x02;
const NLMSG_DONE: u16 = 0x03;

const NLMSG_HEADER_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum RdmaError {
  #[error("RDMA netlink socket error")]
  Socket(#[from] io::Error),

  #[error("Kernel rejected RDMA netlink request: errno {0}")]
  Kernel(i32),

  #[error("No RDMA device named {0:?}")]
  DeviceNotFound(String),

  #[error("Truncated RDMA netlink message")]
  Truncated,
}

pub struct RdmaNetlink {
  socket: Socket,
  sequence: u32,
}

impl RdmaNetlink {
  /// Opens an nldev socket in the current network namespace. The socket
  /// observes (and mutates) RDMA devices of the namespace it was created in.
  pub fn new() -> Result<Self, RdmaError> {
    let mut socket = Socket::new(NETLINK_RDMA)?;
    socket.bind_auto()?;
    socket.connect(&SocketAddr::new(0, 0))?;

    Ok(Self {
      socket,
      sequence: 1,
    })
  }

  pub fn link_index_by_name(&mut self, name: &str) -> Result<Option<u32>, RdmaError> {
    let request = self.encode(RDMA_NLDEV_CMD_GET, NLM_F_REQUEST | NLM_F_DUMP, &[]);
    self.socket.send(&request, 0)?;

    let mut found = None;
    'recv: loop {
      let (buffer, _) = self.socket.recv_from_full()?;
      for (kind, payload) in Messages::new(&buffer) {
        match kind {
          NLMSG_DONE => break 'recv,
          NLMSG_ERROR => {
            let code = error_code(payload)?;
            if code != 0 {
              return Err(RdmaError::Kernel(-code));
            }
          }
          _ => {
            let mut index = None;
            let mut device_name = None;
            for (attribute, value) in Attributes::new(payload) {
              match attribute {
                RDMA_NLDEV_ATTR_DEV_INDEX => index = read_u32(value),
                RDMA_NLDEV_ATTR_DEV_NAME => device_name = read_string(value),
                _ => {}
              }
            }

            if device_name.as_deref() == Some(name) {
              found = found.or(index);
            }
          }
        }
      }
    }

    Ok(found)
  }

  /// `RDMA_NLDEV_CMD_SET` with a namespace fd: the kernel re-homes the whole
  /// RDMA device (and its uverbs chardevs) into the namespace behind `fd`.
  pub fn set_netns_fd(&mut self, index: u32, ns_fd: RawFd) -> Result<(), RdmaError> {
    let mut attributes = Vec::new();
    put_attr(
      &mut attributes,
      RDMA_NLDEV_ATTR_DEV_INDEX,
      &index.to_ne_bytes(),
    );
    put_attr(
      &mut attributes,
      RDMA_NLDEV_NET_NS_FD,
      &(ns_fd as u32).to_ne_bytes(),
    );

    let request = self.encode(RDMA_NLDEV_CMD_SET, NLM_F_REQUEST | NLM_F_ACK, &attributes);
    self.socket.send(&request, 0)?;

    let (buffer, _) = self.socket.recv_from_full()?;
    for (kind, payload) in Messages::new(&buffer) {
      if kind == NLMSG_ERROR {
        let code = error_code(payload)?;
        if code != 0 {
          return Err(RdmaError::Kernel(-code));
        }
      }
    }

    Ok(())
  }

  fn encode(&mut self, command: u16, flags: u16, attributes: &[u8]) -> Vec<u8> {
    let length = NLMSG_HEADER_LEN + attributes.len();
    let mut buffer = Vec::with_capacity(length);
    buffer.extend_from_slice(&(length as u32).to_ne_bytes());
    buffer.extend_from_slice(&((RDMA_NL_NLDEV << 10) | command).to_ne_bytes());
    buffer.extend_from_slice(&flags.to_ne_bytes());
    buffer.extend_from_slice(&self.sequence.to_ne_bytes());
    buffer.extend_from_slice(&0u32.to_ne_bytes());
    buffer.extend_from_slice(attributes);

    self.sequence = self.sequence.wrapping_add(1);
    buffer
  }
}

/// Resolve an RDMA device by name in the current namespace and move it into
/// the namespace behind `ns_fd`.
pub fn move_device_to_netns(name: &str, ns_fd: RawFd) -> Result<(), RdmaError> {
  let mut client = RdmaNetlink::new()?;
  let index = client
    .link_index_by_name(name)?
    .ok_or_else(|| RdmaError::DeviceNotFound(name.to_string()))?;

  client.set_netns_fd(index, ns_fd)
}

/// Whether an RDMA device with this name is visible in the current
/// namespace.
pub fn device_exists(name: &str) -> Result<bool, RdmaError> {
  let mut client = RdmaNetlink::new()?;
  Ok(client.link_index_by_name(name)?.is_some())
}

fn put_attr(buffer: &mut Vec<u8>, kind: u16, value: &[u8]) {
  let length = 4 + value.len();
  buffer.extend_from_slice(&(length as u16).to_ne_bytes());
  buffer.extend_from_slice(&kind.to_ne_bytes());
  buffer.extend_from_slice(value);
  buffer.resize(align4(buffer.len()), 0);
}

struct Messages<'a> {
  buffer: &'a [u8],
  offset: usize,
}

impl<'a> Messages<'a> {
  fn new(buffer: &'a [u8]) -> Self {
    Self { buffer, offset: 0 }
  }
}

impl<'a> Iterator for Messages<'a> {
  /// (nlmsg_type, payload)
  type Item = (u16, &'a [u8]);

  fn next(&mut self) -> Option<Self::Item> {
    if self.offset + NLMSG_HEADER_LEN > self.buffer.len() {
      return None;
    }

    let header = &self.buffer[self.offset..];
    let length = u32::from_ne_bytes([header[0], header[1], header[2], header[3]]) as usize;
    let kind = u16::from_ne_bytes([header[4], header[5]]);
    if length < NLMSG_HEADER_LEN || self.offset + length > self.buffer.len() {
      return None;
    }

    let payload = &self.buffer[self.offset + NLMSG_HEADER_LEN..self.offset + length];
    self.offset += align4(length);
    Some((kind, payload))
  }
}

struct Attributes<'a> {
  buffer: &'a [u8],
  offset: usize,
}

impl<'a> Attributes<'a> {
  fn new(buffer: &'a [u8]) -> Self {
    Self { buffer, offset: 0 }
  }
}

impl<'a> Iterator for Attributes<'a> {
  /// (nla_type, value)
  type Item = (u16, &'a [u8]);

  fn next(&mut self) -> Option<Self::Item> {
    if self.offset + 4 > self.buffer.len() {
      return None;
    }

    let header = &self.buffer[self.offset..];
    let length = u16::from_ne_bytes([header[0], header[1]]) as usize;
    let kind = u16::from_ne_bytes([header[2], header[3]]) & 0x3fff;
    if length < 4 || self.offset + length > self.buffer.len() {
      return None;
    }

    let value = &self.buffer[self.offset + 4..self.offset + length];
    self.offset += align4(length);
    Some((kind, value))
  }
}

fn align4(value: usize) -> usize {
  (value + 3) & !3
}

fn error_code(payload: &[u8]) -> Result<i32, RdmaError> {
  if payload.len() < 4 {
    return Err(RdmaError::Truncated);
  }

  Ok(i32::from_ne_bytes([
    payload[0], payload[1], payload[2], payload[3],
  ]))
}

fn read_u32(value: &[u8]) -> Option<u32> {
  if value.len() < 4 {
    return None;
  }

  Some(u32::from_ne_bytes([value[0], value[1], value[2], value[3]]))
}

fn read_string(value: &[u8]) -> Option<String> {
  let end = value.iter().position(|b| *b == 0).unwrap_or(value.len());
  String::from_utf8(value[..end].to_vec()).ok()
}

#[cfg(test)]
mod tests {
  use super::*;

  fn message(kind: u16, payload: &[u8]) -> Vec<u8> {
    let length = NLMSG_HEADER_LEN + payload.len();
    let mut buffer = Vec::new();
    buffer.extend_from_slice(&(length as u32).to_ne_bytes());
    buffer.extend_from_slice(&kind.to_ne_bytes());
    buffer.extend_from_slice(&0u16.to_ne_bytes());
    buffer.extend_from_slice(&0u32.to_ne_bytes());
    buffer.extend_from_slice(&0u32.to_ne_bytes());
    buffer.extend_from_slice(payload);
    buffer.resize(align4(buffer.len()), 0);
    buffer
  }

  #[test]
  fn attributes_round_trip() {
    let mut payload = Vec::new();
    put_attr(&mut payload, RDMA_NLDEV_ATTR_DEV_INDEX, &7u32.to_ne_bytes());
    put_attr(&mut payload, RDMA_NLDEV_ATTR_DEV_NAME, b"mlx5_0\0");

    let parsed: Vec<_> = Attributes::new(&payload).collect();
    assert_eq!(parsed.len(), 2);
    assert_eq!(parsed[0].0, RDMA_NLDEV_ATTR_DEV_INDEX);
    assert_eq!(read_u32(parsed[0].1), Some(7));
    assert_eq!(parsed[1].0, RDMA_NLDEV_ATTR_DEV_NAME);
    assert_eq!(read_string(parsed[1].1).as_deref(), Some("mlx5_0"));
  }

  #[test]
  fn messages_walk_multipart_buffers() {
    let mut buffer = message(RDMA_NL_NLDEV << 10 | RDMA_NLDEV_CMD_GET, b"abcd");
    buffer.extend_from_slice(&message(NLMSG_DONE, &[]));

    let parsed: Vec<_> = Messages::new(&buffer).collect();
    assert_eq!(parsed.len(), 2);
    assert_eq!(parsed[0].0, RDMA_NL_NLDEV << 10 | RDMA_NLDEV_CMD_GET);
    assert_eq!(parsed[0].1, b"abcd");
    assert_eq!(parsed[1].0, NLMSG_DONE);
  }

  #[test]
  fn truncated_error_payload_is_detected() {
    assert!(matches!(error_code(&[0, 0]), Err(RdmaError::Truncated)));
    assert_eq!(error_code(&(-17i32).to_ne_bytes()).unwrap(), -17);
  }
}
