//! Node state machine: negotiation (format/params/IO/buffers) and command
//! handling (Start/Pause/Suspend) for the A2DP source's single output port.
//!
//! There is exactly one port, always output, always id 0 — the original
//! rejects `add_port`/`remove_port` outright and so do we; a fixed port
//! count is one of this node's defining simplifications versus a general
//! SPA node.

use std::collections::HashMap;
use std::sync::Arc;

use crate::buffer::{BufferPool, DecodeBuffer, MappedMemory};
use crate::codec::{Codec, CodecSession};
use crate::error::{NodeError, Result};
use crate::events::{EventHub, NodeListener};
use crate::format::AudioFormat;
use crate::io::{ClockIo, IoState, PortBuffersIo, PositionIo, RateMatchIo};
use crate::transport::Transport;

/// Parameter ids a caller can enumerate or set on the port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamId {
    EnumFormat,
    Format,
    Buffers,
    Io,
    Latency,
    PropInfo,
    Props,
}

/// One candidate/current value returned from [`Node::enum_params`]. Stands
/// in for the original's POD-serialized param objects; callers that need
/// the negotiated format read [`Node::current_format`] directly instead of
/// re-parsing this.
#[derive(Debug, Clone)]
pub enum ParamValue {
    Format(AudioFormat),
    BufferRange { min: u32, max: u32, size_hint: u32 },
    IoSize { id: &'static str, size: u32 },
    ClockName(String),
}

/// Node-level properties a controller can set via `set_param(Props, ...)`.
///
/// Scoped deliberately to just `clock_name`: every other property the
/// original's `props` struct carries belongs to the codec's own
/// `enum_props`/`set_props`, not the node.
#[derive(Debug, Clone, Default)]
pub struct NodeProps {
    pub clock_name: String,
}

/// A command sent to [`Node::send_command`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Start,
    Pause,
    Suspend,
}

/// The node's single output port: format/buffer negotiation state.
#[derive(Default)]
pub struct Port {
    pub have_format: bool,
    pub current_format: Option<AudioFormat>,
    pub pool: BufferPool,
}

/// The A2DP source node: one port, one transport, one codec session.
pub struct Node {
    port: Port,
    io: IoState,
    props: NodeProps,
    started: bool,
    following: bool,
    transport: Option<Arc<dyn Transport>>,
    transport_acquired: bool,
    codec: Option<Arc<dyn Codec>>,
    codec_session: Option<Box<dyn CodecSession>>,
    /// Codec props staged via `set_param_props` before a session exists;
    /// applied (on top of `codec.init_props()`) the next time `do_start`
    /// creates one.
    pending_codec_props: HashMap<String, String>,
    decode_buffer: DecodeBuffer,
    quantum_limit_min: u32,
    quantum_limit_max: u32,
    events: EventHub,
}

impl Node {
    pub fn new(quantum_limit_min: u32, quantum_limit_max: u32) -> Self {
        let mut node = Node {
            port: Port::default(),
            io: IoState::new(),
            props: NodeProps::default(),
            started: false,
            following: false,
            transport: None,
            transport_acquired: false,
            codec: None,
            codec_session: None,
            pending_codec_props: HashMap::new(),
            decode_buffer: DecodeBuffer::new(),
            quantum_limit_min,
            quantum_limit_max,
            events: EventHub::new(),
        };

        // Populated before any listener can register, so `add_listener`'s
        // full-snapshot emission (events.rs) already carries these — no
        // separate emit call is needed for the initial values.
        {
            let info = node.events.node_info_mut();
            info.max_input_ports = 0;
            info.max_output_ports = 1;
            info.n_ports = 1;
            info.props.insert("device.api".into(), "bluez5".into());
            info.props.insert("media.class".into(), "Audio/Source".into());
            info.props.insert("node.driver".into(), "true".into());
        }
        {
            let port_info = node.events.port_info_mut();
            port_info.direction_output = true;
            port_info.live = true;
            port_info.terminal = true;
        }
        node
    }

    pub fn add_listener(&mut self, listener: Box<dyn NodeListener>) {
        self.events.add_listener(listener);
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn is_following(&self) -> bool {
        self.following
    }

    pub fn current_format(&self) -> Option<AudioFormat> {
        self.port.current_format
    }

    pub fn decode_buffer_mut(&mut self) -> &mut DecodeBuffer {
        &mut self.decode_buffer
    }

    /// Current drift correction coefficient, for callers (the realtime
    /// engine's rate-match setup) that only need a read.
    pub fn corr(&self) -> f64 {
        self.decode_buffer.corr()
    }

    pub fn pool_mut(&mut self) -> &mut BufferPool {
        &mut self.port.pool
    }

    /// Install the transport this node will capture from. Must happen
    /// before `send_command(Start)`.
    pub fn set_transport(&mut self, transport: Arc<dyn Transport>) {
        let codec = transport.a2dp_codec();
        let device_name = transport
            .device()
            .name
            .unwrap_or_else(|| "a2dp-source".to_string());
        self.events
            .node_info_mut()
            .props
            .insert("media.name".into(), device_name);
        self.events.emit_node_info();
        self.transport = Some(transport);
        self.codec = Some(codec);
    }

    /// Drop the transport (mirrors the transport destroy listener): the
    /// node stays alive but refuses data-path work until a new one arrives.
    pub fn clear_transport(&mut self) {
        if let (Some(codec), Some(session)) = (&self.codec, self.codec_session.take()) {
            codec.deinit(session);
        }
        self.transport = None;
        self.transport_acquired = false;
        self.codec = None;
    }

    /// Set a node-scoped IO window (`Clock` or `Position`).
    pub fn set_io_clock(&mut self, clock: Option<ClockIo>) {
        self.io.clock = clock;
        self.reconcile_following();
    }

    pub fn set_io_position(&mut self, position: Option<PositionIo>) {
        self.io.position = position;
        self.reconcile_following();
    }

    /// Recompute `following` and, if it changed while started, recover the
    /// decode buffer's drift state (mirrors the original's
    /// `follower_changed` handling on a position/clock IO update).
    fn reconcile_following(&mut self) {
        let now_following = self.io.is_following();
        if self.started && now_following != self.following {
            self.decode_buffer.recover();
        }
        self.following = now_following;
    }

    /// Set a port-scoped IO window (`Buffers` or `RateMatch`).
    pub fn port_set_io_rate_match(&mut self, rate_match: Option<RateMatchIo>) {
        self.io.rate_match = rate_match;
    }

    pub fn port_set_io_buffers(&mut self, buffers: Option<PortBuffersIo>) {
        self.io.buffers = buffers;
    }

    /// Current contents of the port's buffer handoff window, for the
    /// realtime engine's `process()` to read each cycle.
    pub fn io_buffers(&self) -> Option<PortBuffersIo> {
        self.io.buffers
    }

    /// Publish a new value into the port's buffer handoff window (the id
    /// `process()` just dequeued, or a cleared/idle window).
    pub fn set_io_buffers(&mut self, buffers: PortBuffersIo) {
        self.io.buffers = Some(buffers);
    }

    /// Negotiate the output format. Requires a transport and codec to
    /// already be set (mirrors `SPA_PARAM_EnumFormat` needing
    /// `this->codec != NULL`).
    pub fn port_set_param_format(&mut self, format: AudioFormat) -> Result<()> {
        if self.transport.is_none() || self.codec.is_none() {
            return Err(NodeError::IoState(
                "format requires a transport and codec".into(),
            ));
        }
        self.port.current_format = Some(format);
        self.port.have_format = true;
        self.decode_buffer.init(
            format.frame_size,
            format.rate,
            self.quantum_limit_min,
            self.quantum_limit_max,
        )?;
        self.events.port_info_mut().format = Some(format);
        let latency = format!(
            "{}/{}",
            self.quantum_limit_min, format.rate
        );
        self.events
            .node_info_mut()
            .props
            .insert("node.latency".into(), latency);
        self.events.emit_port_info();
        self.events.emit_node_info();
        Ok(())
    }

    /// Clear a previously negotiated format (e.g. on transport loss). If the
    /// node was started, this first tears it down: `started` implies
    /// `have_format`, so the two must go together.
    pub fn port_clear_format(&mut self) -> Result<()> {
        if self.started {
            self.do_stop()?;
        }
        self.port.current_format = None;
        self.port.have_format = false;
        self.port.pool.clear();
        self.events.port_info_mut().format = None;
        self.events.emit_port_info();
        Ok(())
    }

    /// Install downstream-owned buffers. Requires a negotiated format.
    pub fn port_use_buffers(
        &mut self,
        memories: Vec<Box<dyn MappedMemory>>,
        has_header: bool,
    ) -> Result<()> {
        if !self.port.have_format {
            return Err(NodeError::IoState(
                "port_use_buffers requires a negotiated format".into(),
            ));
        }
        self.port.pool.use_buffers(memories, has_header)
    }

    /// Set node/codec properties from a `set_param(Props, ...)` call. The
    /// `clock_name` key, if present, updates the node-owned field directly;
    /// everything else is forwarded to `codec.set_props` (immediately if a
    /// session already exists, staged in `pending_codec_props` otherwise —
    /// applied via `codec.init_props()`-seeded `set_props`/`update_props`
    /// the next time `do_start` creates a session).
    pub fn set_param_props(&mut self, props: HashMap<String, String>) -> Result<()> {
        if let Some(clock_name) = props.get("clock_name") {
            self.props.clock_name = clock_name.clone();
        }
        self.pending_codec_props.extend(props.clone());

        if let (Some(codec), Some(session)) = (&self.codec, self.codec_session.as_mut()) {
            codec.set_props(session.as_mut(), &props)?;
        }
        self.events.emit_node_info();
        Ok(())
    }

    pub fn props(&self) -> &NodeProps {
        &self.props
    }

    /// Enumerate the param values a controller would see for `id`. A
    /// simplified stand-in for the original's POD-serialized
    /// `port_enum_params`: enough structure to negotiate against in tests
    /// without a wire-format builder this node has no peer to decode it.
    pub fn enum_params(&self, id: ParamId) -> Result<Vec<ParamValue>> {
        match id {
            ParamId::EnumFormat => {
                let codec = self
                    .codec
                    .as_ref()
                    .ok_or_else(|| NodeError::IoState("no codec negotiated".into()))?;
                let transport = self
                    .transport
                    .as_ref()
                    .ok_or_else(|| NodeError::IoState("no transport".into()))?;
                Ok(codec
                    .enum_config(transport.configuration())?
                    .into_iter()
                    .map(ParamValue::Format)
                    .collect())
            }
            ParamId::Format => {
                if !self.port.have_format {
                    return Err(NodeError::IoState("no format negotiated yet".into()));
                }
                Ok(vec![ParamValue::Format(self.port.current_format.unwrap())])
            }
            ParamId::Buffers => {
                if !self.port.have_format {
                    return Err(NodeError::IoState("no format negotiated yet".into()));
                }
                let frame_size = self.port.current_format.unwrap().frame_size;
                Ok(vec![ParamValue::BufferRange {
                    min: 2,
                    max: crate::buffer::MAX_BUFFERS as u32,
                    size_hint: self.quantum_limit_min * frame_size,
                }])
            }
            ParamId::Io => Ok(vec![
                ParamValue::IoSize {
                    id: "Buffers",
                    size: 8,
                },
                ParamValue::IoSize {
                    id: "RateMatch",
                    size: 16,
                },
            ]),
            ParamId::Latency => Ok(Vec::new()),
            ParamId::PropInfo | ParamId::Props => {
                Ok(vec![ParamValue::ClockName(self.props.clock_name.clone())])
            }
        }
    }

    /// Handle `Start`/`Pause`/`Suspend`. `Start` requires a negotiated
    /// format and at least one buffer; `Pause`/`Suspend` are equivalent for
    /// this node (no distinct "keep warm but idle" state).
    pub fn send_command(&mut self, command: Command) -> Result<()> {
        match command {
            Command::Start => {
                if !self.port.have_format {
                    return Err(NodeError::IoState("Start requires have_format".into()));
                }
                if self.port.pool.n_buffers() == 0 {
                    return Err(NodeError::IoState("Start requires n_buffers > 0".into()));
                }
                self.do_start()
            }
            Command::Pause | Command::Suspend => self.do_stop(),
        }
    }

    fn do_start(&mut self) -> Result<()> {
        if self.started {
            return Ok(());
        }
        self.following = self.io.is_following();

        let transport = self
            .transport
            .clone()
            .ok_or_else(|| NodeError::TransportFailure("no transport set".into()))?;
        transport.acquire()?;
        self.transport_acquired = true;

        let codec = self.codec.clone().expect("codec set alongside transport");
        let mut session = codec.init(transport.configuration())?;

        let mut props = codec.init_props();
        props.extend(self.pending_codec_props.clone());
        codec.set_props(session.as_mut(), &props)?;
        codec.update_props(session.as_mut())?;
        self.codec_session = Some(session);

        self.started = true;
        Ok(())
    }

    fn do_stop(&mut self) -> Result<()> {
        if !self.started {
            return Ok(());
        }
        if let (Some(transport), true) = (&self.transport, self.transport_acquired) {
            transport.release();
        }
        self.transport_acquired = false;
        if let (Some(codec), Some(session)) = (&self.codec, self.codec_session.take()) {
            codec.deinit(session);
        }
        self.decode_buffer.clear();
        self.started = false;
        Ok(())
    }
}
