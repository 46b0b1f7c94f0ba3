//! Stream a camera to an analysis peer and print what comes back
//!
//! Start a peer with `cargo run -p framelink-peer`, then:
//!
//! ```text
//! cargo run -p framelink --example stream_demo -- ws://127.0.0.1:8000/ws
//! ```

use framelink::{CaptureController, MessageKind, SessionConfig, SessionEvent, DEFAULT_ENDPOINT};
use tokio::sync::broadcast::error::RecvError;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    framelink::init_logging("info")?;

    let endpoint = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string());
    let controller =
        CaptureController::with_defaults(SessionConfig::analysis().with_endpoint(endpoint.clone()))?;

    controller.on_message(MessageKind::Analysis, |result| {
        println!(
            "📊 frame {}: {}",
            result.frame_number.unwrap_or_default(),
            result.message.as_deref().unwrap_or("-")
        );
    });
    controller.on_message(MessageKind::Error, |result| {
        eprintln!("❌ peer error: {}", result.message.as_deref().unwrap_or("-"));
    });

    let mut events = controller.events();
    controller.start().await?;
    controller.connect(&endpoint).await?;
    println!("✅ streaming to {} (Ctrl+C to stop)", endpoint);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(SessionEvent::Disconnected { code, reason }) => {
                    println!("⚠️  disconnected ({}): {}", code, reason);
                }
                Ok(SessionEvent::Reconnected { attempts }) => {
                    println!("🔄 reconnected after {} attempt(s)", attempts);
                }
                Ok(SessionEvent::ReconnectExhausted { attempts }) => {
                    eprintln!("❌ gave up after {} attempts", attempts);
                    break;
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            },
        }
    }

    if let Some(stats) = controller.stats() {
        println!(
            "📈 {} frames sent, {} skipped, {:.2} fps",
            stats.frames_sent, stats.frames_skipped, stats.average_fps
        );
    }
    let report = controller.stop().await;
    println!("🛑 stopped: {:?}", report.steps);
    Ok(())
}
