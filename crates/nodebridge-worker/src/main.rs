//! Stand-in runtime that speaks the stdio channel protocol. Used by the
//! integration tests in place of a real Node.js binary.

use anyhow::{bail, Context as _, Result};
use nodebridge_core::channel::{self, ChannelName, PAUSE_EVENT, READY_EVENT, RESUME_EVENT};
use nodebridge_core::engine::{ENV_DATA_DIR, ENV_NODE_PATH, ENV_TMP_DIR};
use nodebridge_core::transport::TransportFrame;
use serde_json::{json, Map, Value};
use std::io::{self, BufRead, Write};
use std::path::Path;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "NODEBRIDGE_LOG";

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();

    let mut argv = std::env::args().skip(1);
    let Some(main_script) = argv.next() else {
        bail!("missing main script argument");
    };
    if !Path::new(&main_script).is_file() {
        bail!("main script not found: {main_script}");
    }
    let script_args = argv.collect::<Vec<_>>();
    info!(main = %main_script, args = script_args.len(), "worker started");

    let ready_delay_ms = std::env::var("NODEBRIDGE_WORKER_READY_DELAY_MS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0);
    let skip_ready = std::env::var("NODEBRIDGE_WORKER_SKIP_READY")
        .ok()
        .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
        .unwrap_or(false);

    let mut stdout = io::stdout();
    if !skip_ready {
        if ready_delay_ms > 0 {
            thread::sleep(Duration::from_millis(ready_delay_ms));
        }
        emit(&mut stdout, ChannelName::App, READY_EVENT, &[])?;
    }

    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = line.context("read stdin")?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let frame = match serde_json::from_str::<TransportFrame>(trimmed) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(reason = %err, "ignoring malformed frame");
                continue;
            }
        };
        let message = match channel::decode(&frame.channel, &frame.message) {
            Ok(message) => message,
            Err(err) => {
                warn!(channel = %frame.channel, reason = %err, "ignoring undecodable message");
                continue;
            }
        };

        match ChannelName::from_wire(&message.channel) {
            Some(ChannelName::App) => {
                if message.event_name == PAUSE_EVENT || message.event_name == RESUME_EVENT {
                    emit(
                        &mut stdout,
                        ChannelName::Event,
                        "lifecycle",
                        &[json!(message.event_name)],
                    )?;
                }
            }
            Some(ChannelName::Event) => match message.event_name.as_str() {
                "exit" => break,
                "env" => {
                    let env = [ENV_DATA_DIR, ENV_NODE_PATH, ENV_TMP_DIR]
                        .into_iter()
                        .map(|key| (key.to_string(), json!(std::env::var(key).ok())))
                        .collect::<Map<String, Value>>();
                    emit(&mut stdout, ChannelName::Event, "env", &[Value::Object(env)])?;
                }
                "argv" => {
                    let args = script_args.iter().map(|arg| json!(arg)).collect::<Vec<_>>();
                    emit(&mut stdout, ChannelName::Event, "argv", &args)?;
                }
                "noise" => {
                    write_line(&mut stdout, "this is not a frame")?;
                    write_frame(
                        &mut stdout,
                        &TransportFrame {
                            channel: "UNKNOWN_CHANNEL".to_string(),
                            message: channel::encode(ChannelName::Event, "noise", &[]).payload,
                        },
                    )?;
                    write_frame(
                        &mut stdout,
                        &TransportFrame {
                            channel: ChannelName::Event.as_wire().to_string(),
                            message: "{\"eventMessage\":\"[]\"}".to_string(),
                        },
                    )?;
                    emit(&mut stdout, ChannelName::Event, "after-noise", &[])?;
                }
                other => {
                    let echoed = vec![json!(other), Value::Array(message.args.clone())];
                    emit(&mut stdout, ChannelName::Event, "echo", &echoed)?;
                }
            },
            None => debug!(channel = %message.channel, "ignoring unknown channel"),
        }
    }

    info!("worker exiting");
    Ok(())
}

fn emit(
    stdout: &mut impl Write,
    channel: ChannelName,
    event_name: &str,
    args: &[Value],
) -> Result<()> {
    let envelope = channel::encode(channel, event_name, args);
    write_frame(
        stdout,
        &TransportFrame {
            channel: envelope.channel.as_wire().to_string(),
            message: envelope.payload,
        },
    )
}

fn write_frame(stdout: &mut impl Write, frame: &TransportFrame) -> Result<()> {
    let payload = serde_json::to_string(frame)?;
    write_line(stdout, &payload)
}

fn write_line(stdout: &mut impl Write, line: &str) -> Result<()> {
    stdout.write_all(line.as_bytes())?;
    stdout.write_all(b"\n")?;
    stdout.flush()?;
    Ok(())
}
