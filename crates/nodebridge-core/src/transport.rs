use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::process::{ChildStdin, Command, Stdio};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;
use tracing::{debug, info, warn};

pub const RUNTIME_BIN_ENV: &str = "NODEBRIDGE_RUNTIME_BIN";

/// One channel message as carried over the runtime's stdio, one JSON object
/// per line.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransportFrame {
    pub channel: String,
    pub message: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RuntimeExit {
    pub code: Option<i32>,
}

/// The embedded runtime together with its bidirectional channel.
pub trait NodeProcess: Send + Sync + 'static {
    /// Runs the runtime to completion. Inbound frames are handed to `inbound`
    /// on the calling thread in the order the runtime wrote them.
    fn start(
        &self,
        arguments: &[String],
        env: &HashMap<String, String>,
        inbound: &mut dyn FnMut(TransportFrame),
    ) -> Result<RuntimeExit, String>;

    /// Safe to call concurrently with `start` and with other senders.
    fn send_to_channel(&self, channel: &str, message: &str) -> Result<(), String>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcessRuntimeConfig {
    pub command: String,
    pub args: Vec<String>,
    pub extra_env: HashMap<String, String>,
}

impl Default for ProcessRuntimeConfig {
    fn default() -> Self {
        let command = std::env::var(RUNTIME_BIN_ENV)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| "node".to_string());

        Self {
            command,
            args: Vec::new(),
            extra_env: HashMap::new(),
        }
    }
}

impl ProcessRuntimeConfig {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            ..Self::default()
        }
    }
}

/// Runs the runtime as a child process and multiplexes channels over its
/// stdin/stdout. `arguments[0]` names the runtime and is not forwarded; the
/// configured command stands in for it.
pub struct StdioNodeProcess {
    config: ProcessRuntimeConfig,
    stdin: Mutex<Option<ChildStdin>>,
}

impl StdioNodeProcess {
    pub fn new(config: ProcessRuntimeConfig) -> Self {
        Self {
            config,
            stdin: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ProcessRuntimeConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.lock_stdin().is_some()
    }

    fn lock_stdin(&self) -> MutexGuard<'_, Option<ChildStdin>> {
        self.stdin.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl NodeProcess for StdioNodeProcess {
    fn start(
        &self,
        arguments: &[String],
        env: &HashMap<String, String>,
        inbound: &mut dyn FnMut(TransportFrame),
    ) -> Result<RuntimeExit, String> {
        if self.config.command.trim().is_empty() {
            return Err("runtime command is empty".to_string());
        }

        let mut command = Command::new(&self.config.command);
        command
            .args(&self.config.args)
            .args(arguments.iter().skip(1))
            .envs(&self.config.extra_env)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());

        let mut child = command
            .spawn()
            .map_err(|err| format!("spawn runtime process failed: {err}"))?;

        let Some(stdout) = child.stdout.take() else {
            let _ = child.kill();
            let _ = child.wait();
            return Err("runtime stdout is not piped".to_string());
        };
        let Some(stdin) = child.stdin.take() else {
            let _ = child.kill();
            let _ = child.wait();
            return Err("runtime stdin is not piped".to_string());
        };
        *self.lock_stdin() = Some(stdin);
        info!(command = %self.config.command, pid = child.id(), "runtime process started");

        let rx = spawn_reader_thread(stdout);
        for frame in rx {
            match frame {
                Ok(frame) => inbound(frame),
                Err(err) => warn!(reason = %err, "dropping runtime output line"),
            }
        }

        self.lock_stdin().take();
        let status = child
            .wait()
            .map_err(|err| format!("wait for runtime process failed: {err}"))?;
        info!(code = ?status.code(), "runtime process exited");
        Ok(RuntimeExit {
            code: status.code(),
        })
    }

    fn send_to_channel(&self, channel: &str, message: &str) -> Result<(), String> {
        let payload = serde_json::to_string(&TransportFrame {
            channel: channel.to_string(),
            message: message.to_string(),
        })
        .map_err(|err| format!("serialize runtime frame failed: {err}"))?;

        let mut guard = self.lock_stdin();
        let Some(stdin) = guard.as_mut() else {
            return Err("runtime is not running".to_string());
        };

        stdin
            .write_all(payload.as_bytes())
            .map_err(|err| format!("write runtime stdin failed: {err}"))?;
        stdin
            .write_all(b"\n")
            .map_err(|err| format!("write runtime newline failed: {err}"))?;
        stdin
            .flush()
            .map_err(|err| format!("flush runtime stdin failed: {err}"))
    }
}

fn spawn_reader_thread(
    stdout: impl std::io::Read + Send + 'static,
) -> Receiver<Result<TransportFrame, String>> {
    let (tx, rx) = mpsc::channel();
    let spawned = thread::Builder::new()
        .name("nodejs-stdout".to_string())
        .spawn(move || {
            let mut reader = BufReader::new(stdout);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf) {
                    Ok(0) => break,
                    Ok(_) => {}
                    Err(err) => {
                        let _ = tx.send(Err(format!("read runtime stdout failed: {err}")));
                        return;
                    }
                }

                let Some(parsed) = parse_frame_line(&buf) else {
                    continue;
                };
                if tx.send(parsed).is_err() {
                    return;
                }
            }
            debug!("runtime stdout closed");
        });
    if let Err(err) = spawned {
        warn!(reason = %err, "failed to spawn runtime stdout reader");
    }
    rx
}

/// `None` for blank lines. Invalid UTF-8 only poisons its own line.
fn parse_frame_line(raw: &[u8]) -> Option<Result<TransportFrame, String>> {
    let line = match std::str::from_utf8(raw) {
        Ok(line) => line,
        Err(err) => return Some(Err(format!("runtime output is not utf-8: {err}"))),
    };
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(
        serde_json::from_str::<TransportFrame>(trimmed)
            .map_err(|err| format!("invalid runtime frame: {err}")),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn frame_serializes_as_single_json_line() {
        let frame = TransportFrame {
            channel: "EVENT_CHANNEL".to_string(),
            message: r#"{"eventName":"a","eventMessage":"[1]"}"#.to_string(),
        };
        let line = serde_json::to_string(&frame).expect("serialize frame");
        assert!(!line.contains('\n'));

        let parsed: TransportFrame = serde_json::from_str(&line).expect("parse frame");
        assert_eq!(parsed, frame);
    }

    #[test]
    fn reader_thread_preserves_order_and_reports_bad_lines() {
        let input = concat!(
            "{\"channel\":\"APP_CHANNEL\",\"message\":\"first\"}\n",
            "\n",
            "garbage\n",
            "{\"channel\":\"EVENT_CHANNEL\",\"message\":\"second\"}\n",
        );
        let rx = spawn_reader_thread(Cursor::new(input.as_bytes().to_vec()));
        let frames = rx.into_iter().collect::<Vec<_>>();

        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].as_ref().expect("first frame").message, "first");
        assert!(frames[1].is_err());
        assert_eq!(frames[2].as_ref().expect("second frame").channel, "EVENT_CHANNEL");
    }

    #[test]
    fn reader_thread_survives_invalid_utf8_line() {
        let mut input = b"{\"channel\":\"APP_CHANNEL\",\"message\":\"first\"}\n".to_vec();
        input.extend_from_slice(b"\xff\xfe garbage\n");
        input.extend_from_slice(b"{\"channel\":\"EVENT_CHANNEL\",\"message\":\"after\"}");
        let rx = spawn_reader_thread(Cursor::new(input));
        let frames = rx.into_iter().collect::<Vec<_>>();

        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].as_ref().expect("first frame").message, "first");
        assert!(frames[1]
            .as_ref()
            .expect_err("invalid utf-8 line")
            .contains("utf-8"));
        assert_eq!(frames[2].as_ref().expect("frame after bad bytes").message, "after");
    }

    #[test]
    fn send_without_running_process_fails() {
        let process = StdioNodeProcess::new(ProcessRuntimeConfig::new("node", Vec::new()));
        assert!(!process.is_running());
        let err = process
            .send_to_channel("EVENT_CHANNEL", "{}")
            .expect_err("no runtime");
        assert!(err.contains("not running"));
    }

    #[test]
    fn spawn_failure_is_reported() {
        let process = StdioNodeProcess::new(ProcessRuntimeConfig::new(
            "nodebridge-non-existent-runtime-command",
            Vec::new(),
        ));
        let mut frames = Vec::new();
        let err = process
            .start(
                &["node".to_string(), "index.js".to_string()],
                &HashMap::new(),
                &mut |frame| frames.push(frame),
            )
            .expect_err("spawn should fail");
        assert!(err.contains("spawn runtime process failed"));
        assert!(frames.is_empty());
        assert!(!process.is_running());
    }
}
