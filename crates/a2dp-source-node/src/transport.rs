//! Transport: the external collaborator that owns the BlueZ-acquired
//! socket. The node never talks to BlueZ or D-Bus itself — it only consumes
//! whatever [`Transport`] the host handed it and reacts to its lifecycle.

use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex};

use crate::codec::Codec;
use crate::error::{NodeError, Result};

/// Mirrors the transport state machine the host's BlueZ integration drives;
/// the node only ever reacts to it, never sets it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Idle,
    Pending,
    Active,
}

/// Device-level metadata the node surfaces in its info dict (`media.name`)
/// but never originates.
#[derive(Debug, Clone, Default)]
pub struct DeviceInfo {
    pub name: Option<String>,
}

/// The socket-owning collaborator acquired from BlueZ. `acquire`/`release`
/// bracket the lifetime of `fd`; everything else is static for the life of
/// one acquisition.
pub trait Transport: Send + Sync {
    /// Negotiated codec for this transport's A2DP role.
    fn a2dp_codec(&self) -> Arc<dyn Codec>;

    /// Raw codec configuration blob (A2DP capabilities payload), passed to
    /// `Codec::init`.
    fn configuration(&self) -> &[u8];

    fn read_mtu(&self) -> u32;
    fn write_mtu(&self) -> u32;

    fn state(&self) -> TransportState;

    fn device(&self) -> DeviceInfo;

    /// Acquire the socket, returning its raw fd. Idempotent: acquiring an
    /// already-acquired transport returns the same fd.
    fn acquire(&self) -> Result<RawFd>;

    /// Release the socket. Safe to call even if never acquired.
    fn release(&self);
}

/// In-process loopback transport for tests and the demo binary: backed by a
/// `socketpair()` instead of a real BlueZ-acquired L2CAP/RFCOMM socket, so
/// `acquire` can hand back a genuine pollable fd.
pub struct LoopbackTransport {
    codec: Arc<dyn Codec>,
    configuration: Vec<u8>,
    read_mtu: u32,
    write_mtu: u32,
    state: Mutex<TransportState>,
    fds: Mutex<Option<(RawFd, RawFd)>>,
}

impl LoopbackTransport {
    pub fn new(codec: Arc<dyn Codec>, read_mtu: u32, write_mtu: u32) -> Self {
        LoopbackTransport {
            codec,
            configuration: Vec::new(),
            read_mtu,
            write_mtu,
            state: Mutex::new(TransportState::Pending),
            fds: Mutex::new(None),
        }
    }

    /// The peer fd, for a test harness to write packets into.
    pub fn peer_fd(&self) -> Option<RawFd> {
        self.fds.lock().unwrap().map(|(_, peer)| peer)
    }
}

impl Transport for LoopbackTransport {
    fn a2dp_codec(&self) -> Arc<dyn Codec> {
        self.codec.clone()
    }

    fn configuration(&self) -> &[u8] {
        &self.configuration
    }

    fn read_mtu(&self) -> u32 {
        self.read_mtu
    }

    fn write_mtu(&self) -> u32 {
        self.write_mtu
    }

    fn state(&self) -> TransportState {
        *self.state.lock().unwrap()
    }

    fn device(&self) -> DeviceInfo {
        DeviceInfo {
            name: Some("loopback".into()),
        }
    }

    fn acquire(&self) -> Result<RawFd> {
        let mut fds = self.fds.lock().unwrap();
        if let Some((ours, _)) = *fds {
            return Ok(ours);
        }
        let mut pair = [0i32; 2];
        // SAFETY: `socketpair` with a stack-allocated 2-element out array is
        // the documented contract; we check the return value below.
        let rc = unsafe {
            libc::socketpair(libc::AF_UNIX, libc::SOCK_SEQPACKET, 0, pair.as_mut_ptr())
        };
        if rc != 0 {
            return Err(NodeError::TransportFailure(format!(
                "socketpair failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        *fds = Some((pair[0], pair[1]));
        *self.state.lock().unwrap() = TransportState::Active;
        Ok(pair[0])
    }

    fn release(&self) {
        let mut fds = self.fds.lock().unwrap();
        if let Some((ours, peer)) = fds.take() {
            unsafe {
                libc::close(ours);
                libc::close(peer);
            }
        }
        *self.state.lock().unwrap() = TransportState::Idle;
    }
}

impl Drop for LoopbackTransport {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::RawPcmCodec;

    #[test]
    fn acquire_is_idempotent() {
        let t = LoopbackTransport::new(Arc::new(RawPcmCodec::new()), 672, 672);
        let fd1 = t.acquire().unwrap();
        let fd2 = t.acquire().unwrap();
        assert_eq!(fd1, fd2);
        assert_eq!(t.state(), TransportState::Active);
    }

    #[test]
    fn release_without_acquire_is_safe() {
        let t = LoopbackTransport::new(Arc::new(RawPcmCodec::new()), 672, 672);
        t.release();
        assert_eq!(t.state(), TransportState::Idle);
    }

    #[test]
    fn release_resets_state_to_idle() {
        let t = LoopbackTransport::new(Arc::new(RawPcmCodec::new()), 672, 672);
        t.acquire().unwrap();
        t.release();
        assert_eq!(t.state(), TransportState::Idle);
        assert!(t.peer_fd().is_none());
    }
}
