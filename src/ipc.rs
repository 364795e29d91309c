// JSON-lines command surface of the privileged writer process
//
// The controller sends one command per line on the input and receives one
// message per line on the output. A session handles a single `write`; a
// `cancel` (or the controller closing the input) aborts it.

use crate::config::EngineConfig;
use crate::disk::DeviceHost;
use crate::error::{ErrorReport, FlashError};
use crate::flash::Flasher;
use crate::flash::state::{AggregateState, FlashEvent, FlashResults};
use crate::pipeline::block_map::BlockMap;
use crate::source::SourceImage;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::PathBuf;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, Lines};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "lowercase")]
pub enum Command {
    Write(WriteRequest),
    Cancel,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteRequest {
    pub image_path: PathBuf,
    pub destinations: Vec<String>,
    /// Overrides `EngineConfig::verify`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verify: Option<bool>,
    /// Overrides `EngineConfig::unmount_on_success`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unmount_on_success: Option<bool>,
    /// A bmap file describing the used blocks of the image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_map_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Message {
    Ready,
    Log { message: String },
    State(AggregateState),
    Fail { device: String, error: ErrorReport },
    Error { error: ErrorReport },
    Done { results: FlashResults },
    Abort,
}

impl From<FlashEvent> for Message {
    fn from(event: FlashEvent) -> Self {
        match event {
            FlashEvent::State(state) => Message::State(state),
            FlashEvent::Fail { device, error } => Message::Fail { device, error },
            FlashEvent::Error(error) => Message::Error { error },
            FlashEvent::Done(results) => Message::Done { results },
            FlashEvent::Abort => Message::Abort,
        }
    }
}

/// Serve one flashing session
///
/// Returns once the write has finished, or once the input closes before a
/// write was requested. Only failures of the channel itself are errors; the
/// outcome of the write is reported to the controller.
pub async fn serve<H, R, W>(host: H, config: EngineConfig, input: R, mut output: W) -> Result<()>
where
    H: DeviceHost,
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = input.lines();
    send(&mut output, &Message::Ready).await?;

    let request = loop {
        let Some(line) = lines.next_line().await.context("Failed to read command")? else {
            info!("Controller closed the channel before requesting a write");
            return Ok(());
        };
        match parse_command(&line) {
            Some(Command::Write(request)) => break request,
            Some(Command::Cancel) => debug!("Nothing to cancel yet"),
            None => {}
        }
    };

    run_write(host, config, request, &mut lines, &mut output).await
}

async fn run_write<H, R, W>(
    host: H,
    mut config: EngineConfig,
    request: WriteRequest,
    lines: &mut Lines<R>,
    output: &mut W,
) -> Result<()>
where
    H: DeviceHost,
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    if let Some(verify) = request.verify {
        config.verify = verify;
    }
    if let Some(unmount) = request.unmount_on_success {
        config.unmount_on_success = unmount;
    }

    let source = match load_source(&request).await {
        Ok(source) => source,
        Err(e) => {
            error!("Failed to load image: {}", e);
            send(output, &Message::Error { error: e.report(None) }).await?;
            return Ok(());
        }
    };

    send(
        output,
        &Message::Log {
            message: format!(
                "Flashing {} to {}",
                request.image_path.display(),
                request.destinations.join(", ")
            ),
        },
    )
    .await?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let flasher = Flasher::new(host, config, tx);
    let flash = flasher.flash(source, &request.destinations);
    tokio::pin!(flash);

    let mut listening = true;
    let result = loop {
        tokio::select! {
            result = &mut flash => break result,
            Some(event) = rx.recv() => send(output, &Message::from(event)).await?,
            line = lines.next_line(), if listening => match line {
                Ok(Some(line)) => match parse_command(&line) {
                    Some(Command::Cancel) => flasher.abort(),
                    Some(Command::Write(_)) => warn!("A write is already running, ignoring"),
                    None => {}
                },
                Ok(None) => {
                    warn!("Controller closed the channel, aborting");
                    listening = false;
                    flasher.abort();
                }
                Err(e) => {
                    warn!("Failed to read from the controller, aborting: {}", e);
                    listening = false;
                    flasher.abort();
                }
            },
        }
    };

    // Every event is queued before the flash future resolves
    while let Ok(event) = rx.try_recv() {
        send(output, &Message::from(event)).await?;
    }

    match result {
        Ok(results) => info!(
            "Session finished: {} succeeded, {} failed",
            results.devices.successful, results.devices.failed
        ),
        Err(e) => info!("Session ended: {}", e),
    }
    Ok(())
}

async fn load_source(request: &WriteRequest) -> Result<SourceImage, FlashError> {
    let source = SourceImage::open(&request.image_path)
        .await
        .map_err(|e| FlashError::Source(io::Error::other(format!("{e:#}"))))?;

    let Some(path) = &request.block_map_path else {
        return Ok(source);
    };
    let xml = tokio::fs::read_to_string(path).await.map_err(|e| {
        FlashError::BlockMap(format!("Failed to read {}: {}", path.display(), e))
    })?;
    let map = BlockMap::parse_bmap(&xml)?;
    debug!(
        "Loaded block map {}: {} of {} bytes mapped",
        path.display(),
        map.mapped_bytes(),
        map.image_size()
    );
    Ok(source.with_block_map(map))
}

fn parse_command(line: &str) -> Option<Command> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    match serde_json::from_str(line) {
        Ok(command) => Some(command),
        Err(e) => {
            warn!("Ignoring malformed command {:?}: {}", line, e);
            None
        }
    }
}

async fn send<W: AsyncWrite + Unpin>(output: &mut W, message: &Message) -> Result<()> {
    let mut line = serde_json::to_vec(message).context("Failed to serialize message")?;
    line.push(b'\n');
    output
        .write_all(&line)
        .await
        .context("Failed to write message")?;
    output.flush().await.context("Failed to flush message")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::memory::MemoryHost;
    use crate::error::ErrorCode;
    use crate::flash::state::FlashPhase;
    use serde_json::Value;
    use std::io::Write;
    use tokio::io::BufReader;

    fn config() -> EngineConfig {
        EngineConfig {
            chunk_size: 4096,
            deferred_region: 4096,
            retry_base_delay_ms: 1,
            progress_interval_ms: 5,
            unmount_delay_ms: 0,
            ..Default::default()
        }
    }

    fn messages(output: &[u8]) -> Vec<Value> {
        output
            .split(|&b| b == b'\n')
            .filter(|line| !line.is_empty())
            .map(|line| serde_json::from_slice(line).unwrap())
            .collect()
    }

    #[test]
    fn parses_commands() {
        let write = parse_command(
            r#"{"command":"write","imagePath":"/tmp/os.img","destinations":["/dev/sda"],"verify":false}"#,
        );
        assert_eq!(
            write,
            Some(Command::Write(WriteRequest {
                image_path: PathBuf::from("/tmp/os.img"),
                destinations: vec!["/dev/sda".into()],
                verify: Some(false),
                unmount_on_success: None,
                block_map_path: None,
            }))
        );
        assert_eq!(parse_command(r#" {"command":"cancel"} "#), Some(Command::Cancel));
        assert_eq!(parse_command("not json"), None);
        assert_eq!(parse_command(""), None);
    }

    #[test]
    fn messages_are_tagged_by_type() {
        let state = serde_json::to_value(Message::State(AggregateState {
            phase: FlashPhase::Verifying,
            ..Default::default()
        }))
        .unwrap();
        assert_eq!(state["type"], "state");
        assert_eq!(state["phase"], "verifying");

        let fail = serde_json::to_value(Message::from(FlashEvent::Fail {
            device: "/dev/sdb".into(),
            error: FlashError::Cancelled.report(Some("/dev/sdb")),
        }))
        .unwrap();
        assert_eq!(fail["type"], "fail");
        assert_eq!(fail["device"], "/dev/sdb");
        assert_eq!(fail["error"]["code"], "ECANCELLED");

        assert_eq!(serde_json::to_value(Message::Abort).unwrap()["type"], "abort");
    }

    #[tokio::test]
    async fn serves_a_write_session() {
        let host = MemoryHost::new();
        let sda = host.add("/dev/sda", 1 << 20);
        let mut image = tempfile::NamedTempFile::new().unwrap();
        image.write_all(&[7u8; 10_000]).unwrap();

        let command = serde_json::to_string(&Command::Write(WriteRequest {
            image_path: image.path().to_path_buf(),
            destinations: vec!["/dev/sda".into()],
            verify: None,
            unmount_on_success: Some(false),
            block_map_path: None,
        }))
        .unwrap();

        // Keep the controller side open for the whole session
        let (mut controller, input) = tokio::io::duplex(4096);
        controller.write_all(command.as_bytes()).await.unwrap();
        controller.write_all(b"\n").await.unwrap();

        let mut output = Vec::new();
        serve(host, config(), BufReader::new(input), &mut output)
            .await
            .unwrap();

        let messages = messages(&output);
        assert_eq!(messages[0]["type"], "ready");
        assert_eq!(messages[1]["type"], "log");
        let done = messages.last().unwrap();
        assert_eq!(done["type"], "done");
        assert_eq!(done["results"]["devices"]["successful"], 1);
        assert_eq!(done["results"]["bytesRead"], 10_000);
        assert!(messages.iter().all(|m| m["type"] != "fail"));
        assert!(sda.contents()[..10_000].iter().all(|&b| b == 7));
    }

    #[tokio::test]
    async fn missing_image_is_reported() {
        let host = MemoryHost::new();
        host.add("/dev/sda", 1 << 20);
        let input: &[u8] =
            br#"{"command":"write","imagePath":"/nonexistent/os.img","destinations":["/dev/sda"]}
"#;

        let mut output = Vec::new();
        serve(host, config(), input, &mut output).await.unwrap();

        let messages = messages(&output);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1]["type"], "error");
        assert_eq!(messages[1]["error"]["code"], ErrorCode::Source.as_str());
    }

    #[tokio::test]
    async fn closed_input_without_write_ends_the_session() {
        let input: &[u8] = b"{\"command\":\"cancel\"}\n";
        let mut output = Vec::new();
        serve(MemoryHost::new(), config(), input, &mut output)
            .await
            .unwrap();

        let messages = messages(&output);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["type"], "ready");
    }
}
