//! Ethtool feature toggles over the classic SIOCETHTOOL ioctl. The socket is
//! created in the calling thread's network namespace, so callers run this
//! inside the pod namespace window.

use std::{collections::BTreeMap, io, os::unix::io::RawFd};
use thiserror::Error;

const SIOCETHTOOL: libc::c_ulong = 0x8946;

const ETHTOOL_GSSET_INFO: u32 = 0x0000_0037;
const ETHTOOL_GSTRINGS: u32 = 0x0000_001b;
const ETHTOOL_SFEATURES: u32 = 0x0000_003b;

const ETH_SS_FEATURES: u64 = 4;
const ETH_GSTRING_LEN: usize = 32;
const IFNAMSIZ: usize = 16;

#[derive(Debug, Error)]
pub enum EthtoolError {
  #[error("Interface name {0:?} is too long")]
  InterfaceName(String),

  #[error("ethtool ioctl failed: {0}")]
  Ioctl(#[source] io::Error),

  #[error("Failed to create ethtool socket: {0}")]
  Socket(#[source] io::Error),
}

/// Outcome of a feature-set call: features we could not resolve by name are
/// reported back instead of failing the attach.
#[derive(Debug, Default, PartialEq)]
pub struct FeatureOutcome {
  pub applied: usize,
  pub unknown: Vec<String>,
}

#[repr(C)]
struct IfReq {
  ifr_name: [u8; IFNAMSIZ],
  ifr_data: *mut libc::c_void,
}

#[repr(C)]
struct SsetInfo {
  cmd: u32,
  reserved: u32,
  sset_mask: u64,
  data: u32,
}

#[repr(C)]
struct SetFeaturesBlock {
  valid: u32,
  requested: u32,
}

struct EthtoolSocket(RawFd);

impl EthtoolSocket {
  fn new() -> Result<Self, EthtoolError> {
    // safe: plain socket syscall, fd ownership kept by the wrapper
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
    if fd < 0 {
      return Err(EthtoolError::Socket(io::Error::last_os_error()));
    }

    Ok(Self(fd))
  }

  fn ioctl(&self, interface: &str, data: *mut libc::c_void) -> Result<(), EthtoolError> {
    let mut request = IfReq {
      ifr_name: [0; IFNAMSIZ],
      ifr_data: data,
    };

    let name = interface.as_bytes();
    if name.len() >= IFNAMSIZ {
      return Err(EthtoolError::InterfaceName(interface.to_string()));
    }
    request.ifr_name[..name.len()].copy_from_slice(name);

    // safe: request and its data buffer outlive the call
    let rc = unsafe { libc::ioctl(self.0, SIOCETHTOOL, &mut request) };
    if rc < 0 {
      return Err(EthtoolError::Ioctl(io::Error::last_os_error()));
    }

    Ok(())
  }
}

impl Drop for EthtoolSocket {
  fn drop(&mut self) {
    // safe: fd is owned by this wrapper
    unsafe { libc::close(self.0) };
  }
}

/// Names of all netdev features, in kernel bit order.
fn feature_names(socket: &EthtoolSocket, interface: &str) -> Result<Vec<String>, EthtoolError> {
  let mut sset_info = SsetInfo {
    cmd: ETHTOOL_GSSET_INFO,
    reserved: 0,
    sset_mask: 1 << ETH_SS_FEATURES,
    data: 0,
  };
  socket.ioctl(interface, &mut sset_info as *mut SsetInfo as *mut libc::c_void)?;

  let count = sset_info.data as usize;
  if count == 0 {
    return Ok(Vec::new());
  }

  // ethtool_gstrings header (cmd, string_set, len) followed by the strings
  let mut buffer = vec![0u8; 12 + count * ETH_GSTRING_LEN];
  buffer[0..4].copy_from_slice(&ETHTOOL_GSTRINGS.to_ne_bytes());
  buffer[4..8].copy_from_slice(&(ETH_SS_FEATURES as u32).to_ne_bytes());
  buffer[8..12].copy_from_slice(&(count as u32).to_ne_bytes());
  socket.ioctl(interface, buffer.as_mut_ptr() as *mut libc::c_void)?;

  let mut names = Vec::with_capacity(count);
  for i in 0..count {
    let start = 12 + i * ETH_GSTRING_LEN;
    let raw = &buffer[start..start + ETH_GSTRING_LEN];
    let end = raw.iter().position(|b| *b == 0).unwrap_or(ETH_GSTRING_LEN);
    names.push(String::from_utf8_lossy(&raw[..end]).into_owned());
  }

  Ok(names)
}

/// Toggle netdev features by name, resolving names through the kernel's
/// feature string set. Unknown names are collected, not fatal.
pub fn set_features(
  interface: &str,
  features: &BTreeMap<String, bool>,
) -> Result<FeatureOutcome, EthtoolError> {
  if features.is_empty() {
    return Ok(FeatureOutcome::default());
  }

  let socket = EthtoolSocket::new()?;
  let names = feature_names(&socket, interface)?;

  let mut outcome = FeatureOutcome::default();
  let block_count = (names.len() + 31) / 32;
  let mut blocks: Vec<SetFeaturesBlock> = (0..block_count)
    .map(|_| SetFeaturesBlock {
      valid: 0,
      requested: 0,
    })
    .collect();

  for (feature, enable) in features {
    match names.iter().position(|name| name == feature) {
      Some(bit) => {
        let block = &mut blocks[bit / 32];
        let mask = 1u32 << (bit % 32);
        block.valid |= mask;
        if *enable {
          block.requested |= mask;
        }
        outcome.applied += 1;
      }
      None => outcome.unknown.push(feature.clone()),
    }
  }

  if outcome.applied == 0 {
    return Ok(outcome);
  }

  // ethtool_sfeatures header (cmd, size) followed by the blocks
  let mut buffer = vec![0u8; 8 + block_count * 8];
  buffer[0..4].copy_from_slice(&ETHTOOL_SFEATURES.to_ne_bytes());
  buffer[4..8].copy_from_slice(&(block_count as u32).to_ne_bytes());
  for (i, block) in blocks.iter().enumerate() {
    let start = 8 + i * 8;
    buffer[start..start + 4].copy_from_slice(&block.valid.to_ne_bytes());
    buffer[start + 4..start + 8].copy_from_slice(&block.requested.to_ne_bytes());
  }
  socket.ioctl(interface, buffer.as_mut_ptr() as *mut libc::c_void)?;

  Ok(outcome)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn empty_feature_map_is_a_noop() {
    let outcome = set_features("eth0", &BTreeMap::new()).unwrap();
    assert_eq!(outcome, FeatureOutcome::default());
  }

  #[test]
  fn over_long_interface_names_are_rejected() {
    let socket = EthtoolSocket::new().unwrap();
    let error = socket
      .ioctl("interface-name-way-too-long", std::ptr::null_mut())
      .unwrap_err();
    assert!(matches!(error, EthtoolError::InterfaceName(_)));
  }
}
