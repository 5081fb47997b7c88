//! Interactive client: connect to a running relay, stream the microphone,
//! and print transcripts until Ctrl-C.

use anyhow::{Context, Result};
use clap::Parser;
use voice_relay_rs::session::{SessionClient, SessionEvent};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Relay WebSocket address
    #[arg(long, default_value = "ws://127.0.0.1:8787")]
    relay: String,

    /// Give up if the session is not established within this many seconds
    #[arg(long, default_value_t = 30)]
    connect_timeout: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let args = Args::parse();
    log::info!("🚀 Connecting to relay at {}", args.relay);

    // connect() itself never times out; bound it here.
    let connecting = SessionClient::new(args.relay.as_str()).connect();
    let mut session = tokio::time::timeout(
        std::time::Duration::from_secs(args.connect_timeout),
        connecting,
    )
    .await
    .context("Timed out waiting for the session")?
    .context("Failed to establish a session")?;

    log::info!("🎤 Session established, speak into the microphone (Ctrl-C to stop)");

    loop {
        tokio::select! {
            event = session.next_event() => match event {
                Some(SessionEvent::Transcript(transcript)) => {
                    if transcript.is_final {
                        println!("<< {}", transcript.text);
                    } else {
                        print!("{}", transcript.text);
                        use std::io::Write;
                        std::io::stdout().flush().ok();
                    }
                }
                Some(SessionEvent::UpstreamError { message }) => {
                    log::warn!("⚠️  Assistant error: {}", message);
                }
                Some(SessionEvent::Disconnected) | None => {
                    log::info!("🔚 Session ended");
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                log::info!("🛑 Shutting down");
                session.disconnect().await;
                break;
            }
        }
    }

    Ok(())
}
