//! `popub-relay`: accepts authenticated control sessions from Local peers
//! and public clients from the world, and pairs them up (spec.md §4.4,
//! §4.6).

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, timeout, timeout_at, Instant, MissedTickBehavior};
use tracing_subscriber::EnvFilter;

use popub_core::{
    opcode, passphrase_to_psk, perform_relay_handshake, proxy_v2, Backoff, Session, SessionReader,
    SessionWriter, Timeouts,
};

#[derive(Parser, Debug)]
#[command(name = "popub-relay", about = "Reverse-tunnel port forwarder: Relay endpoint")]
struct RelayArgs {
    /// Address the authenticated control channel listens on.
    relay_addr: String,
    /// Address public clients connect to.
    public_addr: String,
    /// Shared passphrase, stretched into the session PSK.
    passphrase: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = match RelayArgs::try_parse() {
        Ok(args) => args,
        Err(err) => {
            print!("{err}");
            return ExitCode::SUCCESS;
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .init();

    if let Err(err) = run(args).await {
        tracing::error!("popub-relay exiting: {err:#}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

async fn run(args: RelayArgs) -> Result<()> {
    let psk = passphrase_to_psk(&args.passphrase);

    let public_listener = TcpListener::bind(&args.public_addr)
        .await
        .with_context(|| format!("failed to bind public address {}", args.public_addr))?;
    let relay_listener = TcpListener::bind(&args.relay_addr)
        .await
        .with_context(|| format!("failed to bind relay address {}", args.relay_addr))?;

    tracing::info!(public = %args.public_addr, relay = %args.relay_addr, "listening");

    // The public listener and every authenticated session race to dequeue
    // the single slot this dispatcher arbitrates (spec.md §3 "Public
    // connection queue", §9 "single-slot public-connection rendezvous").
    let (public_tx, public_rx) = mpsc::channel::<TcpStream>(1);
    let (want_tx, want_rx) = mpsc::unbounded_channel::<oneshot::Sender<TcpStream>>();
    tokio::spawn(run_dispatcher(public_rx, want_rx));

    let public_task = tokio::spawn(run_public_listener(public_listener, public_tx.clone()));
    let relay_task = tokio::spawn(run_relay_listener(relay_listener, want_tx, public_tx, psk));

    tokio::try_join!(
        async { public_task.await.context("public listener task panicked")? },
        async { relay_task.await.context("relay listener task panicked")? },
    )?;
    Ok(())
}

/// Matches arrivals from `run_public_listener` against requests from
/// sessions in FIFO order, parking at most one of either kind at a time —
/// the actual single-slot rendezvous. A oneshot whose session vanished
/// before it fired is treated as a lost request, not a lost connection:
/// the connection is re-offered to the next waiter.
async fn run_dispatcher(
    mut arrivals: mpsc::Receiver<TcpStream>,
    mut wants: mpsc::UnboundedReceiver<oneshot::Sender<TcpStream>>,
) {
    let mut waiting: VecDeque<oneshot::Sender<TcpStream>> = VecDeque::new();
    let mut parked: Option<TcpStream> = None;

    loop {
        tokio::select! {
            maybe_stream = arrivals.recv() => {
                let Some(mut stream) = maybe_stream else { return };
                loop {
                    match waiting.pop_front() {
                        Some(responder) => match responder.send(stream) {
                            Ok(()) => break,
                            Err(returned) => stream = returned,
                        },
                        None => {
                            parked = Some(stream);
                            break;
                        }
                    }
                }
            }
            maybe_want = wants.recv() => {
                let Some(responder) = maybe_want else { return };
                match parked.take() {
                    Some(stream) => { let _ = responder.send(stream); }
                    None => waiting.push_back(responder),
                }
            }
        }
    }
}

/// Accepts public clients and forwards each into the dispatcher. Uses its
/// own backoff instance and never touches the relay-control listener
/// (spec.md §4.6).
async fn run_public_listener(listener: TcpListener, tx: mpsc::Sender<TcpStream>) -> Result<()> {
    let mut backoff = Backoff::new();
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                backoff.record_success();
                tracing::debug!(%addr, "public client accepted");
                if tx.send(stream).await.is_err() {
                    bail!("public connection dispatcher is gone");
                }
            }
            Err(err) => {
                tracing::warn!("public accept failed: {err}");
                backoff.record_failure().await;
            }
        }
    }
}

/// Accepts control connections and spawns one `handle_session` per peer
/// (spec.md §4.4). Its own backoff drives the accept loop, symmetric with
/// the public listener's.
async fn run_relay_listener(
    listener: TcpListener,
    want_tx: mpsc::UnboundedSender<oneshot::Sender<TcpStream>>,
    public_tx: mpsc::Sender<TcpStream>,
    psk: [u8; 32],
) -> Result<()> {
    let mut backoff = Backoff::new();
    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                backoff.record_success();
                let want_tx = want_tx.clone();
                let public_tx = public_tx.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_session(stream, peer_addr, want_tx, public_tx, psk).await {
                        tracing::warn!(%peer_addr, "session ended: {err:#}");
                    }
                });
            }
            Err(err) => {
                tracing::warn!("relay accept failed: {err}");
                backoff.record_failure().await;
            }
        }
    }
}

/// What the recv task hands back to `handle_session` over the event
/// channel: either a ping notification (the session keeps running), or the
/// first non-ping body along with exclusive ownership of the read half and
/// `SessionReader` (spec.md §9: "Recv task exits after a non-ping packet is
/// forwarded — at that point the pipe stage takes over raw stream
/// ownership").
enum RecvEvent {
    Ping,
    Other(Vec<u8>, OwnedReadHalf, SessionReader),
}

/// Owns the read half of the control socket exclusively for as long as it
/// runs, so a `select!` elsewhere never has to cancel a `read_packet` call
/// mid-frame (spec.md §4.4 step 2, §9 "Task pair sharing a receive
/// channel"). `read_packet` performs two sequential reads and advances
/// `recv_nonce` between them; dropping it partway through would strand
/// already-consumed ciphertext on the stream and desynchronize the nonce,
/// so it must always run to completion rather than race against other
/// events in the same `select!`.
async fn run_recv_task(
    mut read_half: OwnedReadHalf,
    mut reader: SessionReader,
    tx: mpsc::Sender<RecvEvent>,
) {
    let mut buf = Vec::new();
    loop {
        let body = match reader.read_packet(&mut read_half, &mut buf).await {
            Ok(body) => body,
            Err(err) => {
                tracing::warn!("control read failed: {err}");
                return;
            }
        };
        if body.first() == Some(&opcode::PING) {
            if tx.send(RecvEvent::Ping).await.is_err() {
                return;
            }
        } else {
            let body = body.to_vec();
            let _ = tx.send(RecvEvent::Other(body, read_half, reader)).await;
            return;
        }
    }
}

/// One authenticated control session: handshake, ping loop while waiting
/// for a public connection, CONN handoff, pipe (spec.md §4.4 steps 1-5).
async fn handle_session(
    mut transport: TcpStream,
    peer_addr: SocketAddr,
    want_tx: mpsc::UnboundedSender<oneshot::Sender<TcpStream>>,
    public_tx: mpsc::Sender<TcpStream>,
    psk: [u8; 32],
) -> Result<()> {
    let timeouts = Timeouts::default();

    let session = timeout(timeouts.network, perform_relay_handshake(&mut transport, &psk))
        .await
        .context("handshake timed out")?
        .context("handshake failed")?;
    tracing::info!(%peer_addr, "session authenticated");

    let (want_responder, want_response) = oneshot::channel();
    want_tx
        .send(want_responder)
        .map_err(|_| anyhow::anyhow!("public connection dispatcher is gone"))?;
    tokio::pin!(want_response);

    let (read_half, mut write_half) = transport.into_split();
    let (session_reader, mut session_writer) = session.into_halves();
    let (event_tx, mut event_rx) = mpsc::channel(1);
    tokio::spawn(run_recv_task(read_half, session_reader, event_tx));

    let mut pending_pings: u32 = 0;
    let mut ticker = interval(timeouts.ping_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    let public_stream = loop {
        tokio::select! {
            _ = ticker.tick() => {
                if pending_pings > 1 {
                    bail!("connection timed out waiting for ping reply");
                }
                session_writer
                    .write_packet(&mut write_half, &control_body(opcode::PING))
                    .await
                    .context("ping send failed")?;
                pending_pings += 1;
            }
            event = event_rx.recv() => {
                match event.context("control read failed")? {
                    RecvEvent::Ping => {
                        pending_pings = pending_pings.saturating_sub(1);
                    }
                    RecvEvent::Other(body, ..) => {
                        let opcode = body.first().copied().unwrap_or_default();
                        bail!("unexpected opcode {opcode:#04x} before handoff");
                    }
                }
            }
            stream = &mut want_response => {
                match stream {
                    Ok(stream) => break stream,
                    Err(_) => bail!("public connection dispatcher shut down"),
                }
            }
        }
    };
    tracing::debug!(%peer_addr, "public connection dequeued");

    let handoff = send_conn_and_await_ack(
        &mut write_half,
        &mut session_writer,
        &mut event_rx,
        &public_stream,
        timeouts.network,
    )
    .await;
    let (read_half, session_reader) = match handoff {
        Ok(halves) => halves,
        Err(err) => {
            // The public connection was never handed off; give another
            // session a chance at it instead of dropping it on the floor
            // (spec.md §4.4 step 5).
            let _ = public_tx.send(public_stream).await;
            return Err(err);
        }
    };

    let transport = read_half
        .reunite(write_half)
        .context("control socket halves no longer belong to the same connection")?;
    let session = Session::from_halves(session_reader, session_writer);
    popub_core::run_pipe(public_stream, transport, session);
    Ok(())
}

/// Sends the CONN frame and waits for the Local's ack, relayed through the
/// recv task's event channel rather than reading `transport` directly (the
/// recv task still owns the read half at this point). Any ping events that
/// arrive while waiting are drained and ignored; the ack is the first
/// non-ping body. Returns the read half and `SessionReader` the recv task
/// hands back once it exits, so the caller can reunite the full socket and
/// `Session` for the pipe stage.
async fn send_conn_and_await_ack(
    write_half: &mut OwnedWriteHalf,
    session_writer: &mut SessionWriter,
    event_rx: &mut mpsc::Receiver<RecvEvent>,
    public_stream: &TcpStream,
    ack_timeout: std::time::Duration,
) -> Result<(OwnedReadHalf, SessionReader)> {
    let public_local = public_stream.local_addr().context("public local_addr failed")?;
    let public_remote = public_stream.peer_addr().context("public peer_addr failed")?;

    let header = proxy_v2::encode(public_local, public_remote);
    let mut body = [0u8; opcode::CONTROL_BODY_LEN];
    body[0] = opcode::CONN;
    body[1..].copy_from_slice(&header);

    session_writer
        .write_packet(write_half, &body)
        .await
        .context("CONN send failed")?;

    let deadline = Instant::now() + ack_timeout;
    loop {
        let event = timeout_at(deadline, event_rx.recv())
            .await
            .context("CONN ack timed out")?
            .context("CONN ack read failed")?;
        match event {
            RecvEvent::Ping => continue,
            RecvEvent::Other(body, read_half, session_reader) => {
                if body.first() != Some(&opcode::CONN) {
                    bail!("peer did not acknowledge CONN handoff");
                }
                return Ok((read_half, session_reader));
            }
        }
    }
}

fn control_body(op: u8) -> [u8; opcode::CONTROL_BODY_LEN] {
    let mut body = [0u8; opcode::CONTROL_BODY_LEN];
    body[0] = op;
    body
}
