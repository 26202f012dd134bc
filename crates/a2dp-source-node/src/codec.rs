//! Pluggable codec adapter contract.
//!
//! The node never implements SBC/AAC/aptX/etc. itself; it decodes through
//! whatever `Codec` the transport negotiated. This trait is the Rust
//! reshaping of the codec vtable: construction/teardown (`init`/`deinit`),
//! the two-stage decode split (`start_decode` peels off any per-packet
//! header before the payload loop), format enumeration (`enum_config`), and
//! the property surface a UI would use to expose codec-specific knobs
//! (`enum_props`/`init_props`/`set_props`/`update_props`/`clear_props`).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::error::Result;
use crate::format::{AudioFormat, SampleFormat};

/// Per-stream state a codec keeps between `init` and `deinit`. Codecs that
/// are stateless (like [`RawPcmCodec`]) can use `()`.
pub trait CodecSession: Send {}
impl CodecSession for () {}

/// A pluggable audio codec adapter.
///
/// `decode` may be called zero or more times per packet (a single RTP frame
/// can carry several codec frames); callers keep looping while
/// `start_decode` or `decode` still report unconsumed input.
pub trait Codec: Send + Sync {
    /// Human-readable name, used in logs and negotiation error messages.
    fn description(&self) -> &str;

    /// Build per-stream decode state from the transport's negotiated
    /// configuration blob (the A2DP codec capabilities payload).
    fn init(&self, config: &[u8]) -> Result<Box<dyn CodecSession>>;

    /// Tear down per-stream decode state. Default just drops it; codecs
    /// that hold external resources (hardware decode contexts, scratch
    /// allocations) override this to release them explicitly.
    fn deinit(&self, _session: Box<dyn CodecSession>) {}

    /// Peel off any leading per-packet header (e.g. an RTP header) that
    /// isn't part of the codec bitstream itself. Returns the number of
    /// bytes consumed from `src`.
    fn start_decode(&self, session: &mut dyn CodecSession, src: &[u8]) -> Result<usize>;

    /// Decode one codec frame from `src` into `dst`. Returns
    /// `(bytes_consumed, bytes_written)`.
    fn decode(
        &self,
        session: &mut dyn CodecSession,
        src: &[u8],
        dst: &mut [u8],
    ) -> Result<(usize, usize)>;

    /// Candidate output formats this codec can produce from the transport's
    /// raw configuration blob, for `Node::enum_params(EnumFormat)`.
    fn enum_config(&self, _config: &[u8]) -> Result<Vec<AudioFormat>> {
        Ok(Vec::new())
    }

    /// Names of the properties this codec exposes for `enum_props`.
    fn enum_props(&self) -> Vec<String> {
        Vec::new()
    }

    /// Default property values, applied at `init` before any `set_props`.
    fn init_props(&self) -> HashMap<String, String> {
        HashMap::new()
    }

    /// Stage a batch of property updates. Implementations that can't apply
    /// a change immediately (e.g. it requires re-arming hardware) should
    /// mark themselves dirty and apply on the next `update_props`.
    fn set_props(&self, _session: &mut dyn CodecSession, _props: &HashMap<String, String>) -> Result<()> {
        Ok(())
    }

    /// Whether a `set_props` call is still pending application.
    fn props_dirty(&self) -> bool {
        false
    }

    /// Apply any staged property changes. Called by the realtime engine
    /// before decoding if `props_dirty()` was true.
    fn update_props(&self, _session: &mut dyn CodecSession) -> Result<()> {
        Ok(())
    }

    /// Reset properties back to `init_props()` defaults.
    fn clear_props(&self, _session: &mut dyn CodecSession) -> Result<()> {
        Ok(())
    }

    /// Whether this codec's kernel socket needs the duplex poll-loss
    /// workaround timer (see the realtime engine's duplex timer). Codecs
    /// that don't share a transport with a sink role should return `false`.
    fn needs_poll_workaround(&self) -> bool {
        false
    }

    /// A paired codec instance used when capturing the duplex (sink-role)
    /// side of a bidirectional transport, if this codec supports duplex.
    fn duplex_codec(&self) -> Option<&dyn Codec> {
        None
    }
}

/// Identity codec used for loopback testing and the demo binary: strips a
/// fixed 1-byte framing header (standing in for an RTP header) and passes
/// the remaining bytes through unchanged.
///
/// Property state lives on the codec itself (behind a `Mutex`/`AtomicBool`)
/// rather than on the session, since `Codec` methods take `&self` — the
/// same interior-mutability shape `LoopbackTransport` uses for its state.
pub struct RawPcmCodec {
    header_len: usize,
    props: Mutex<HashMap<String, String>>,
    dirty: AtomicBool,
}

impl RawPcmCodec {
    pub fn new() -> Self {
        RawPcmCodec {
            header_len: 1,
            props: Mutex::new(HashMap::new()),
            dirty: AtomicBool::new(false),
        }
    }
}

impl Default for RawPcmCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Codec for RawPcmCodec {
    fn description(&self) -> &str {
        "raw-pcm (identity, test/demo only)"
    }

    fn init(&self, _config: &[u8]) -> Result<Box<dyn CodecSession>> {
        Ok(Box::new(()))
    }

    fn start_decode(&self, _session: &mut dyn CodecSession, src: &[u8]) -> Result<usize> {
        Ok(self.header_len.min(src.len()))
    }

    fn decode(
        &self,
        _session: &mut dyn CodecSession,
        src: &[u8],
        dst: &mut [u8],
    ) -> Result<(usize, usize)> {
        let n = src.len().min(dst.len());
        dst[..n].copy_from_slice(&src[..n]);
        Ok((n, n))
    }

    fn enum_config(&self, _config: &[u8]) -> Result<Vec<AudioFormat>> {
        Ok(vec![
            AudioFormat::new(SampleFormat::S16, 2, 44100)?,
            AudioFormat::new(SampleFormat::S16, 2, 48000)?,
        ])
    }

    fn enum_props(&self) -> Vec<String> {
        vec!["header_len".to_string()]
    }

    fn init_props(&self) -> HashMap<String, String> {
        let mut defaults = HashMap::new();
        defaults.insert("header_len".to_string(), self.header_len.to_string());
        defaults
    }

    fn set_props(&self, _session: &mut dyn CodecSession, props: &HashMap<String, String>) -> Result<()> {
        self.props.lock().unwrap().extend(props.clone());
        self.dirty.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn props_dirty(&self) -> bool {
        self.dirty.load(Ordering::Relaxed)
    }

    fn update_props(&self, _session: &mut dyn CodecSession) -> Result<()> {
        self.dirty.store(false, Ordering::Relaxed);
        Ok(())
    }

    fn clear_props(&self, _session: &mut dyn CodecSession) -> Result<()> {
        self.props.lock().unwrap().clear();
        self.dirty.store(false, Ordering::Relaxed);
        Ok(())
    }
}

/// A [`RawPcmCodec`] that additionally declares itself duplex-capable, for
/// exercising the duplex poll-workaround and duplex-codec-selection paths
/// in tests without depending on a real AAC/aptX adapter.
pub struct DuplexProbeCodec {
    forward: RawPcmCodec,
    duplex: RawPcmCodec,
}

impl DuplexProbeCodec {
    pub fn new() -> Self {
        DuplexProbeCodec {
            forward: RawPcmCodec::new(),
            duplex: RawPcmCodec::new(),
        }
    }
}

impl Default for DuplexProbeCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Codec for DuplexProbeCodec {
    fn description(&self) -> &str {
        "raw-pcm-duplex-probe (test only)"
    }

    fn init(&self, config: &[u8]) -> Result<Box<dyn CodecSession>> {
        self.forward.init(config)
    }

    fn deinit(&self, session: Box<dyn CodecSession>) {
        self.forward.deinit(session);
    }

    fn start_decode(&self, session: &mut dyn CodecSession, src: &[u8]) -> Result<usize> {
        self.forward.start_decode(session, src)
    }

    fn decode(
        &self,
        session: &mut dyn CodecSession,
        src: &[u8],
        dst: &mut [u8],
    ) -> Result<(usize, usize)> {
        self.forward.decode(session, src, dst)
    }

    fn enum_config(&self, config: &[u8]) -> Result<Vec<AudioFormat>> {
        self.forward.enum_config(config)
    }

    fn enum_props(&self) -> Vec<String> {
        self.forward.enum_props()
    }

    fn init_props(&self) -> HashMap<String, String> {
        self.forward.init_props()
    }

    fn set_props(&self, session: &mut dyn CodecSession, props: &HashMap<String, String>) -> Result<()> {
        self.forward.set_props(session, props)
    }

    fn props_dirty(&self) -> bool {
        self.forward.props_dirty()
    }

    fn update_props(&self, session: &mut dyn CodecSession) -> Result<()> {
        self.forward.update_props(session)
    }

    fn clear_props(&self, session: &mut dyn CodecSession) -> Result<()> {
        self.forward.clear_props(session)
    }

    fn needs_poll_workaround(&self) -> bool {
        true
    }

    fn duplex_codec(&self) -> Option<&dyn Codec> {
        Some(&self.duplex)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_pcm_strips_header_and_passes_through() {
        let codec = RawPcmCodec::new();
        let mut session = codec.init(&[]).unwrap();
        let packet = [0xFFu8, 1, 2, 3, 4];

        let consumed = codec.start_decode(session.as_mut(), &packet).unwrap();
        assert_eq!(consumed, 1);

        let mut dst = [0u8; 16];
        let (read, written) = codec
            .decode(session.as_mut(), &packet[consumed..], &mut dst)
            .unwrap();
        assert_eq!(read, 4);
        assert_eq!(written, 4);
        assert_eq!(&dst[..written], &[1, 2, 3, 4]);
    }

    #[test]
    fn duplex_probe_exposes_paired_codec_and_needs_workaround() {
        let codec = DuplexProbeCodec::new();
        assert!(codec.needs_poll_workaround());
        assert!(codec.duplex_codec().is_some());
    }

    #[test]
    fn raw_pcm_has_no_duplex_pairing() {
        let codec = RawPcmCodec::new();
        assert!(!codec.needs_poll_workaround());
        assert!(codec.duplex_codec().is_none());
    }

    #[test]
    fn set_props_marks_dirty_until_update_props_applies() {
        let codec = RawPcmCodec::new();
        let mut session = codec.init(&[]).unwrap();
        assert!(!codec.props_dirty());

        let mut props = HashMap::new();
        props.insert("header_len".to_string(), "2".to_string());
        codec.set_props(session.as_mut(), &props).unwrap();
        assert!(codec.props_dirty());

        codec.update_props(session.as_mut()).unwrap();
        assert!(!codec.props_dirty());
    }

    #[test]
    fn clear_props_resets_and_clears_dirty_flag() {
        let codec = RawPcmCodec::new();
        let mut session = codec.init(&[]).unwrap();
        let mut props = HashMap::new();
        props.insert("header_len".to_string(), "2".to_string());
        codec.set_props(session.as_mut(), &props).unwrap();

        codec.clear_props(session.as_mut()).unwrap();
        assert!(!codec.props_dirty());
    }

    #[test]
    fn enum_config_reports_candidate_formats() {
        let codec = RawPcmCodec::new();
        let formats = codec.enum_config(&[]).unwrap();
        assert!(!formats.is_empty());
    }
}
