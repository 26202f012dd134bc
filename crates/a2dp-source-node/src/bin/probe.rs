//! Demo binary: wires the node against a loopback transport, feeds it
//! synthetic packets, and prints drift-controller convergence.
//!
//! Not part of the library surface — a development aid for watching `corr`
//! settle, the way `tune_buffers` lets you watch ring-buffer health.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use a2dp_source_node::buffer::HeapMemory;
use a2dp_source_node::codec::RawPcmCodec;
use a2dp_source_node::config::Config;
use a2dp_source_node::format::{AudioFormat, SampleFormat};
use a2dp_source_node::node::{Command, Node};
use a2dp_source_node::transport::LoopbackTransport;
use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(about = "Feed synthetic packets through the A2DP source node and print drift stats")]
struct Args {
    /// Path to a TOML config file; built-in defaults are used if omitted.
    #[arg(long)]
    config: Option<String>,

    /// Number of simulated graph ticks to run.
    #[arg(long, default_value_t = 40)]
    ticks: u32,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer())
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => Config::load(path).await?,
        None => Config::defaults(),
    };

    let mut node = Node::new(config.quantum_limit_min, config.quantum_limit_max);
    let transport = Arc::new(LoopbackTransport::new(Arc::new(RawPcmCodec::new()), 672, 672));
    node.set_transport(transport.clone());
    let mut props = HashMap::new();
    props.insert("clock_name".to_string(), config.clock_name.clone());
    node.set_param_props(props)?;
    node.port_set_param_format(AudioFormat::new(SampleFormat::S16, 2, 48000)?)?;

    let mems: Vec<Box<dyn a2dp_source_node::buffer::MappedMemory>> =
        (0..4).map(|_| Box::new(HeapMemory::new(4096)) as _).collect();
    node.port_use_buffers(mems, false)?;
    node.send_command(Command::Start)?;

    tracing::info!("node started, corr={:.6}", node.corr());

    for tick in 0..args.ticks {
        {
            let decode_buffer = node.decode_buffer_mut();
            let region = decode_buffer.get_write(256);
            region.fill(0);
            decode_buffer.write_packet(256);
        }
        node.decode_buffer_mut().process(256, 256);
        tracing::info!(tick, corr = node.corr(), "tick");
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    node.send_command(Command::Pause)?;
    tracing::info!("node stopped, final corr={:.6}", node.corr());
    Ok(())
}
