use anyhow::{bail, Context, Result};
use sharenear::core::connection::TransportFactory;
use sharenear::utils::atomic_write::save_received;
use sharenear::utils::sos::SignalOfStop;
use sharenear::workers::args::{Args, TransportOption};
use sharenear::workers::peer::PeerNode;
use sharenear::workers::relay::LocalRelay;
use sharenear::{MemoryNetwork, OutgoingFile, WebRtcFactory};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::info;
use tracing_subscriber::EnvFilter;

const SENDER: &str = "alice";
const RECEIVER: &str = "bob";

/// ICE over loopback usually settles in well under a second.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const TRANSFER_TIMEOUT: Duration = Duration::from_secs(600);

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::load()?;

    // webrtc_ice logs "unknown TransactionID" warnings for late STUN
    // responses and webrtc_sctp is chatty at debug; both are normal.
    let filter = match args.verbose {
        0 => "warn,sharenear=info,webrtc_ice::agent=error",
        1 => "info,webrtc_ice::agent=error,webrtc_sctp=warn",
        2 => "debug,webrtc_ice::agent=error,webrtc_sctp=info",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_target(false)
        .init();

    let sos = SignalOfStop::new();

    // Ctrl+C handler
    let sos_clone = sos.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        sos_clone.cancel();
    });

    match sos.select(run(args)).await {
        Some(result) => result,
        None => bail!("interrupted"),
    }
}

async fn run(args: Args) -> Result<()> {
    let config = args.transfer_config()?;
    let file = OutgoingFile::from_path(&args.file)
        .await
        .with_context(|| format!("opening {}", args.file.display()))?;

    let (sender_factory, receiver_factory): (Arc<dyn TransportFactory>, Arc<dyn TransportFactory>) =
        match args.transport() {
            TransportOption::Memory => {
                let net = MemoryNetwork::new();
                (
                    Arc::new(net.factory(SENDER)),
                    Arc::new(net.factory(RECEIVER)),
                )
            }
            TransportOption::Webrtc => {
                let factory = Arc::new(WebRtcFactory::new(&config).with_loopback(true));
                (factory.clone(), factory)
            }
        };

    info!(
        event = "demo_start",
        transport = %args.transport(),
        wire_format = %config.wire_format,
        chunk_size = config.chunk_size,
        file = %file.name(),
        size = file.size(),
        "Sending {} from {SENDER} to {RECEIVER}",
        file.name()
    );

    let relay = LocalRelay::new();
    let mut sender = PeerNode::start(SENDER, config.clone(), sender_factory, &relay).await?;
    let mut receiver = PeerNode::start(RECEIVER, config, receiver_factory, &relay).await?;

    let result = transfer(&mut sender, &mut receiver, file, &args).await;

    sender.shutdown().await;
    receiver.shutdown().await;
    result
}

async fn transfer(
    sender: &mut PeerNode,
    receiver: &mut PeerNode,
    file: OutgoingFile,
    args: &Args,
) -> Result<()> {
    sender
        .session
        .create_offer(RECEIVER)
        .await
        .context("creating offer")?;
    timeout(CONNECT_TIMEOUT, sender.wait_channel_open(RECEIVER))
        .await
        .context("timed out waiting for the data channel")??;

    let started = std::time::Instant::now();
    let file_id = sender
        .session
        .send_file(RECEIVER, file)
        .await
        .context("sending file")?;

    let received = timeout(TRANSFER_TIMEOUT, receiver.wait_file(SENDER, &file_id))
        .await
        .context("timed out waiting for the file")??;

    let path = save_received(&args.out_dir(), &received.file_name, &received.data)
        .context("saving received file")?;

    info!(
        event = "demo_done",
        file_id = %file_id,
        bytes = received.data.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        path = %path.display(),
        "Received {} into {}",
        received.file_name,
        path.display()
    );
    Ok(())
}
