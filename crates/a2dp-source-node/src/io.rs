//! Shared IO windows: the small, host-owned structs the node reads/writes
//! every graph cycle instead of passing data through a channel.
//!
//! The host maps these regions once (at `set_io`/`port_set_io` time) and
//! keeps the mapping alive as long as the node needs it; the node never
//! owns this memory, only borrows it for the lifetime of the session. We
//! model that borrow as a plain `Option` holding a value rather than a raw
//! pointer, since nothing here is actually shared-memory-mapped in this
//! crate's scope (no real host process boundary to cross).

/// Graph clock snapshot, identifying which node is driving timing.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClockIo {
    pub id: u64,
    pub nsec: u64,
    pub rate_num: u32,
    pub rate_denom: u32,
}

/// Graph position, naming which clock id is authoritative this cycle.
#[derive(Debug, Clone, Copy, Default)]
pub struct PositionIo {
    pub clock_id: u64,
    pub offset: i64,
}

/// Rate-match window: the downstream's requested resample ratio and
/// whether the upstream should even bother applying it.
#[derive(Debug, Clone, Copy, Default)]
pub struct RateMatchIo {
    pub rate: f64,
    pub size: u32,
    pub active: bool,
}

/// The single-slot buffer handoff window port I/O uses to pass a buffer id
/// from the node to the graph and get the (possibly reused) id back.
#[derive(Debug, Clone, Copy, Default)]
pub struct PortBuffersIo {
    pub status: IoStatus,
    pub buffer_id: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IoStatus {
    #[default]
    Empty,
    Have,
}

/// Per-port and per-node IO window state, settable independently via
/// `set_io` (node-scoped: Clock/Position) and `port_set_io` (port-scoped:
/// Buffers/RateMatch).
#[derive(Default)]
pub struct IoState {
    pub clock: Option<ClockIo>,
    pub position: Option<PositionIo>,
    pub buffers: Option<PortBuffersIo>,
    pub rate_match: Option<RateMatchIo>,
}

impl IoState {
    pub fn new() -> Self {
        IoState::default()
    }

    /// A node is "following" when the graph position names a clock id that
    /// isn't this node's own — i.e. some other node is the timing master.
    pub fn is_following(&self) -> bool {
        match (&self.position, &self.clock) {
            (Some(position), Some(clock)) => position.clock_id != clock.id,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_following_without_both_windows() {
        let io = IoState::new();
        assert!(!io.is_following());
    }

    #[test]
    fn following_when_position_names_other_clock() {
        let mut io = IoState::new();
        io.clock = Some(ClockIo {
            id: 1,
            ..Default::default()
        });
        io.position = Some(PositionIo {
            clock_id: 2,
            offset: 0,
        });
        assert!(io.is_following());
    }

    #[test]
    fn not_following_when_position_names_own_clock() {
        let mut io = IoState::new();
        io.clock = Some(ClockIo {
            id: 1,
            ..Default::default()
        });
        io.position = Some(PositionIo {
            clock_id: 1,
            offset: 0,
        });
        assert!(!io.is_following());
    }
}
