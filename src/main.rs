use anyhow::{bail, Context};
use dropline::core::config::PEER_WAIT_TIMEOUT;
use dropline::core::events::Subscription;
use dropline::core::orchestrator::Orchestrator;
use dropline::core::rendezvous::RendezvousEvent;
use dropline::core::session::PeerEvent;
use dropline::core::transfer::{OutgoingFile, ReceiverEvent, SenderEvent};
use dropline::utils::sos::SignalOfStop;
use dropline::workers::args::{Args, Command};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::load()?;

    // webrtc_ice reports late STUN responses as warnings; they are harmless.
    let filter = match args.verbose {
        0 => "warn,dropline=info,webrtc_ice::agent=error",
        1 => "info,webrtc_ice::agent=error",
        2 => "debug,webrtc_ice::agent=error",
        _ => "trace",
    };
    tracing_subscriber::registry()
        .with(EnvFilter::new(filter))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let sos = SignalOfStop::new();

    // Ctrl+C handler
    let sos_clone = sos.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        sos_clone.cancel();
    });

    let orchestrator = Orchestrator::connect_websocket(args.rendezvous_url(), &args.engine_config())
        .context("building transport stack")?;
    let rendezvous = orchestrator.rendezvous_events();
    let peers = orchestrator.peer_events();
    let log_task = tokio::spawn(log_rendezvous(orchestrator.clone(), rendezvous));

    info!(event = "starting", rendezvous = %args.rendezvous_url(), room = ?args.room);
    orchestrator.connect(args.room.clone()).await;

    let result = match &args.command {
        Command::Send { files } => run_send(&orchestrator, peers, files, &sos).await,
        Command::Receive => run_receive(&orchestrator, peers, &args.out_dir(), &sos).await,
    };

    orchestrator.close_rendezvous();
    orchestrator.disconnect().await;
    log_task.abort();
    result
}

/// Surfaces relay activity and says `ready` once we join an occupied room.
async fn log_rendezvous(orchestrator: Orchestrator, mut rx: Subscription<RendezvousEvent>) {
    while let Some(ev) = rx.recv().await {
        match ev {
            RendezvousEvent::Created { client_id } => {
                info!(event = "room_created", %client_id, "Waiting for a peer to join");
            }
            RendezvousEvent::Joined { client_id, peer_id } => {
                info!(event = "room_joined", %client_id, peer = ?peer_id);
                orchestrator.ready();
            }
            RendezvousEvent::Error(e) => warn!(event = "rendezvous_error", error = %e),
            RendezvousEvent::Disconnected => info!(event = "rendezvous_closed"),
            _ => {}
        }
    }
}

async fn wait_for_stream(
    mut peers: Subscription<PeerEvent>,
    sos: &SignalOfStop,
) -> anyhow::Result<(String, Subscription<PeerEvent>)> {
    let wait = async move {
        while let Some(ev) = peers.recv().await {
            if let PeerEvent::DataStreamOpen(peer_id) = ev {
                return Some((peer_id, peers));
            }
        }
        None
    };
    tokio::select! {
        _ = sos.wait() => bail!("interrupted"),
        res = tokio::time::timeout(PEER_WAIT_TIMEOUT, wait) => match res {
            Ok(Some(found)) => Ok(found),
            Ok(None) => bail!("event stream ended before a peer connected"),
            Err(_) => bail!("no peer within {}s", PEER_WAIT_TIMEOUT.as_secs()),
        },
    }
}

async fn run_send(
    orchestrator: &Orchestrator,
    peers: Subscription<PeerEvent>,
    files: &[PathBuf],
    sos: &SignalOfStop,
) -> anyhow::Result<()> {
    let progress = tokio::spawn(log_sender(orchestrator.sender_events()));
    let (peer_id, _peers) = wait_for_stream(peers, sos).await?;
    info!(event = "peer_ready", peer = %peer_id, files = files.len());

    for path in files {
        let file = OutgoingFile::open(path).await?;
        let transfer = orchestrator.send_file(&peer_id, file);
        tokio::select! {
            _ = sos.wait() => {
                if let Some(sender) = orchestrator.sender(&peer_id) {
                    sender.stop();
                }
                progress.abort();
                bail!("interrupted");
            }
            res = transfer => {
                res.with_context(|| format!("sending {}", path.display()))?;
            }
        }
    }
    tokio::select! {
        _ = sos.wait() => {}
        _ = orchestrator.drained(&peer_id) => {}
    }
    progress.abort();
    Ok(())
}

async fn log_sender(mut rx: Subscription<SenderEvent>) {
    let mut last = 0u8;
    while let Some(ev) = rx.recv().await {
        match ev {
            SenderEvent::Start { file_id, metadata, .. } => {
                last = 0;
                info!(event = "send_start", file_id, name = %metadata.name, size = metadata.size);
            }
            SenderEvent::Progress { file_id, progress, .. } if progress >= last.saturating_add(10) => {
                last = progress;
                info!(event = "send_progress", file_id, progress);
            }
            SenderEvent::Complete { file_id, name, .. } => {
                info!(event = "send_complete", file_id, %name);
            }
            SenderEvent::Error { file_id, error, .. } => {
                error!(event = "send_error", file_id, error = %error);
            }
            _ => {}
        }
    }
}

async fn run_receive(
    orchestrator: &Orchestrator,
    peers: Subscription<PeerEvent>,
    out: &Path,
    sos: &SignalOfStop,
) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(out)
        .await
        .with_context(|| format!("creating {}", out.display()))?;
    let mut received = orchestrator.receiver_events();
    let (peer_id, mut peers) = wait_for_stream(peers, sos).await?;
    info!(event = "peer_ready", peer = %peer_id, out = %out.display());

    loop {
        // Completed files queued before the peer left are still saved.
        tokio::select! {
            biased;
            _ = sos.wait() => return Ok(()),
            ev = received.recv() => match ev {
                Some(ReceiverEvent::Start { file_id, metadata, .. }) => {
                    info!(event = "receive_start", file_id, name = %metadata.name, size = metadata.size);
                }
                Some(ReceiverEvent::Complete { file_id, file, .. }) => {
                    let path = file.save_into(out)?;
                    info!(event = "receive_saved", file_id, path = %path.display());
                }
                Some(ReceiverEvent::Error { file_id, error, .. }) => {
                    error!(event = "receive_error", file_id, error = %error);
                }
                Some(_) => {}
                None => return Ok(()),
            },
            ev = peers.recv() => match ev {
                Some(PeerEvent::PeerDisconnected(p)) | Some(PeerEvent::DataStreamClose(p)) if p == peer_id => {
                    info!(event = "peer_gone", peer = %p);
                    return Ok(());
                }
                None => return Ok(()),
                _ => {}
            },
        }
    }
}
