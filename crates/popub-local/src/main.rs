//! `popub-local`: dials the Relay, authenticates, answers keepalive pings,
//! and on a CONN handoff dials the upstream service and repurposes the
//! control connection as a data pipe (spec.md §4.5).

use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing_subscriber::EnvFilter;

use popub_core::{opcode, passphrase_to_psk, perform_local_handshake, proxy_v2, Session, Timeouts};

#[derive(Parser, Debug)]
#[command(name = "popub-local", about = "Reverse-tunnel port forwarder: Local endpoint")]
struct LocalArgs {
    /// Address of the private upstream service to dial on handoff.
    local_addr: String,
    /// Address of the public-facing Relay to dial.
    relay_addr: String,
    /// Shared passphrase, stretched into the session PSK.
    passphrase: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = match LocalArgs::try_parse() {
        Ok(args) => args,
        Err(err) => {
            // Both positional arities are fixed; any parse failure here is
            // the CLI-usage case spec.md §6 wants exit code 0 for.
            print!("{err}");
            return ExitCode::SUCCESS;
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .init();

    if let Err(err) = run(args).await {
        tracing::error!("popub-local exiting: {err:#}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

/// Outer dial/reconnect loop (spec.md §4.5 step 1, §4.9). Local has no
/// listener to bind, so short of a bug this never returns — it either
/// serves one public client and immediately reconnects for the next, or
/// backs off and retries.
async fn run(args: LocalArgs) -> Result<()> {
    let psk = passphrase_to_psk(&args.passphrase);
    let timeouts = Timeouts::default();
    let mut backoff = popub_core::Backoff::new();

    loop {
        match run_one_session(&args.local_addr, &args.relay_addr, &psk, &timeouts).await {
            Ok(()) => {
                tracing::info!("handoff complete, reconnecting for the next client");
                backoff.record_success();
            }
            Err(err) => {
                tracing::warn!("session ended: {err:#}");
                backoff.record_failure().await;
            }
        }
    }
}

/// Dial, handshake, and run the control loop until a CONN handoff succeeds
/// or the session errors out. `Ok(())` means the connection was handed to
/// the pipe stage; the caller should not count it against backoff.
async fn run_one_session(
    local_addr: &str,
    relay_addr: &str,
    psk: &[u8; 32],
    timeouts: &Timeouts,
) -> Result<()> {
    let mut relay = timeout(timeouts.network, TcpStream::connect(relay_addr))
        .await
        .context("dial timed out")?
        .context("dial failed")?;

    let mut session = timeout(timeouts.network, perform_local_handshake(&mut relay, psk))
        .await
        .context("handshake timed out")?
        .context("handshake failed")?;

    timeout(
        timeouts.network,
        session.write_packet(&mut relay, &control_body(opcode::PING)),
    )
    .await
    .context("ready signal timed out")?
    .context("failed to send ready signal")?;

    control_loop(relay, session, local_addr, timeouts).await
}

/// Read loop under `ExtendedNetworkTimeout`: answers pings, and on CONN
/// dials the upstream and hands both sockets to the pipe stage (spec.md
/// §4.5 step 4).
async fn control_loop(
    mut relay: TcpStream,
    mut session: Session,
    local_addr: &str,
    timeouts: &Timeouts,
) -> Result<()> {
    let mut buf = Vec::new();
    loop {
        let body = timeout(
            timeouts.extended_network,
            session.read_packet(&mut relay, &mut buf),
        )
        .await
        .context("control read timed out")?
        .context("control read failed")?;

        if body.is_empty() {
            bail!("empty control body");
        }

        match body[0] {
            opcode::PING => {
                session
                    .write_packet(&mut relay, &control_body(opcode::PING))
                    .await
                    .context("ping reply failed")?;
            }
            opcode::CONN => {
                let (public_local, public_remote) = proxy_v2::decode(&body[1..])
                    .context("malformed CONN header")?;
                tracing::info!(%public_local, %public_remote, "public client arrived");

                session
                    .write_packet(&mut relay, &control_body(opcode::CONN))
                    .await
                    .context("CONN ack failed")?;

                // The ack just told the Relay the handoff succeeded
                // (spec.md §7: "the tunnel is considered to have
                // succeeded"), so the upstream dial must happen inside the
                // spawned pipe stage, decoupled from this function's return
                // — a slow or failing dial must not count against the
                // outer loop's backoff, nor block dialing a fresh Relay
                // connection for the next client (spec.md §4.5 step 4/5,
                // §9; mirrors the original's fire-and-forget
                // `go acceptConn(...)`).
                let upstream_addr = local_addr.to_string();
                tokio::spawn(async move {
                    match TcpStream::connect(&upstream_addr).await {
                        Ok(upstream) => {
                            popub_core::run_pipe(upstream, relay, session);
                        }
                        Err(err) => {
                            tracing::warn!(
                                "failed to dial upstream service {upstream_addr}: {err}"
                            );
                        }
                    }
                });
                return Ok(());
            }
            other => bail!("unexpected control opcode {other:#04x}"),
        }
    }
}

fn control_body(op: u8) -> [u8; opcode::CONTROL_BODY_LEN] {
    let mut body = [0u8; opcode::CONTROL_BODY_LEN];
    body[0] = op;
    body
}
