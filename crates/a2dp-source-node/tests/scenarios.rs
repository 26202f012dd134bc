//! End-to-end scenarios against the node/engine pair with a loopback
//! transport and the reference raw-PCM codec: nominal capture, underrun
//! recovery, format renegotiation, follower switch, duplex mode, and
//! transport loss.

use std::sync::Arc;

use a2dp_source_node::buffer::{HeapMemory, MappedMemory};
use a2dp_source_node::codec::{DuplexProbeCodec, RawPcmCodec};
use a2dp_source_node::engine::{ProcessStatus, RealtimeEngine};
use a2dp_source_node::format::{AudioFormat, SampleFormat};
use a2dp_source_node::io::{ClockIo, PositionIo};
use a2dp_source_node::node::{Command, Node};
use a2dp_source_node::transport::LoopbackTransport;

fn heap_buffers(n: usize) -> Vec<Box<dyn MappedMemory>> {
    (0..n).map(|_| Box::new(HeapMemory::new(4096)) as _).collect()
}

fn started_node(transport: Arc<LoopbackTransport>) -> Node {
    let mut node = Node::new(256, 8192);
    node.set_transport(transport);
    node.port_set_param_format(AudioFormat::new(SampleFormat::S16, 2, 48000).unwrap())
        .unwrap();
    node.port_use_buffers(heap_buffers(4), false).unwrap();
    node.send_command(Command::Start).unwrap();
    node
}

#[test]
fn nominal_capture_produces_ready_buffers() {
    let transport = Arc::new(LoopbackTransport::new(Arc::new(RawPcmCodec::new()), 672, 672));
    let mut node = started_node(transport.clone());
    let mut engine = RealtimeEngine::new(transport);

    {
        let decode_buffer = node.decode_buffer_mut();
        let region = decode_buffer.get_write(256);
        region.fill(0x7F);
        decode_buffer.write_packet(256);
    }

    let status = engine.process(&mut node, 4);
    assert_eq!(status, ProcessStatus::HaveData);
}

#[test]
fn underrun_recovery_resets_without_losing_buffered_data() {
    let transport = Arc::new(LoopbackTransport::new(Arc::new(RawPcmCodec::new()), 672, 672));
    let mut node = started_node(transport);

    {
        let decode_buffer = node.decode_buffer_mut();
        let region = decode_buffer.get_write(16);
        region.copy_from_slice(&[9u8; 16]);
        decode_buffer.write_packet(16);
    }

    // Simulate a burst of empty reads (consumer starved) driving corr away
    // from neutral, then a recovery event (e.g. a follower reassignment).
    for _ in 0..16 {
        node.decode_buffer_mut().process(1024, 256);
    }
    assert_ne!(node.decode_buffer_mut().corr(), 1.0);

    node.decode_buffer_mut().recover();
    assert_eq!(node.decode_buffer_mut().corr(), 1.0);
    assert_eq!(node.decode_buffer_mut().get_read().len(), 16);
}

#[test]
fn format_renegotiation_reinitializes_decode_buffer() {
    let transport = Arc::new(LoopbackTransport::new(Arc::new(RawPcmCodec::new()), 672, 672));
    let mut node = Node::new(256, 8192);
    node.set_transport(transport);

    node.port_set_param_format(AudioFormat::new(SampleFormat::S16, 2, 44100).unwrap())
        .unwrap();
    assert_eq!(node.current_format().unwrap().rate, 44100);

    node.port_set_param_format(AudioFormat::new(SampleFormat::F32, 2, 48000).unwrap())
        .unwrap();
    let fmt = node.current_format().unwrap();
    assert_eq!(fmt.rate, 48000);
    assert_eq!(fmt.frame_size, 8);
    // Renegotiating resets drift state to neutral.
    assert_eq!(node.corr(), 1.0);
}

#[test]
fn follower_switch_triggers_recover_while_started() {
    let transport = Arc::new(LoopbackTransport::new(Arc::new(RawPcmCodec::new()), 672, 672));
    let mut node = started_node(transport);

    for _ in 0..16 {
        node.decode_buffer_mut().process(1024, 256);
    }
    assert_ne!(node.corr(), 1.0);
    assert!(!node.is_following());

    node.set_io_clock(Some(ClockIo {
        id: 1,
        ..Default::default()
    }));
    node.set_io_position(Some(PositionIo {
        clock_id: 2,
        offset: 0,
    }));

    assert!(node.is_following());
    assert_eq!(node.corr(), 1.0, "switching follower role re-centers drift");
}

#[tokio::test]
async fn duplex_mode_exercises_poll_workaround_codec() {
    let codec = Arc::new(DuplexProbeCodec::new());
    assert!(codec.needs_poll_workaround());

    let transport = Arc::new(LoopbackTransport::new(codec, 672, 672));
    let mut node = started_node(transport.clone());
    let mut engine = RealtimeEngine::new(transport.clone());
    engine.transport_start(&mut node).unwrap();

    let peer = transport.peer_fd().unwrap();
    let packet = [0u8, 1, 2, 3, 4];
    unsafe {
        libc::send(peer, packet.as_ptr() as *const libc::c_void, packet.len(), 0);
    }

    engine.on_duplex_timeout(&mut node).unwrap();
    assert_eq!(node.decode_buffer_mut().get_read().len(), 4);
}

#[test]
fn transport_lost_blocks_data_path_until_new_transport_set() {
    let transport = Arc::new(LoopbackTransport::new(Arc::new(RawPcmCodec::new()), 672, 672));
    let mut node = started_node(transport);

    node.clear_transport();
    node.port_clear_format().unwrap();
    assert!(!node.is_started(), "clearing format must stop a started node");

    assert!(matches!(
        node.port_set_param_format(AudioFormat::new(SampleFormat::S16, 2, 48000).unwrap()),
        Err(a2dp_source_node::NodeError::IoState(_))
    ));

    let new_transport = Arc::new(LoopbackTransport::new(Arc::new(RawPcmCodec::new()), 672, 672));
    node.set_transport(new_transport);
    node.port_set_param_format(AudioFormat::new(SampleFormat::S16, 2, 48000).unwrap())
        .unwrap();
    assert!(node.current_format().is_some());
}

#[test]
fn start_with_zero_buffers_is_io_state() {
    let transport = Arc::new(LoopbackTransport::new(Arc::new(RawPcmCodec::new()), 672, 672));
    let mut node = Node::new(256, 8192);
    node.set_transport(transport);
    node.port_set_param_format(AudioFormat::new(SampleFormat::S16, 2, 48000).unwrap())
        .unwrap();

    assert!(matches!(
        node.send_command(Command::Start),
        Err(a2dp_source_node::NodeError::IoState(_))
    ));
}

#[test]
fn start_without_format_is_io_state() {
    let transport = Arc::new(LoopbackTransport::new(Arc::new(RawPcmCodec::new()), 672, 672));
    let mut node = Node::new(256, 8192);
    node.set_transport(transport);

    assert!(matches!(
        node.send_command(Command::Start),
        Err(a2dp_source_node::NodeError::IoState(_))
    ));
}
