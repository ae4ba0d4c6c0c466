//! `critest exec` command: run a command in a running container.
//!
//! `--sync` uses a single ExecSync call. Otherwise the Exec streaming URL is
//! dialed and local stdio is bridged to the session. With `-t` the local
//! terminal is put into raw mode and window-size changes are forwarded.

use std::io::Read;
use std::time::Duration;

use clap::Args;
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;

use a3s_critest_core::stream::TerminalSize;
use a3s_critest_core::{CriTestConfig, ExecSession};

use crate::streaming::{run_session, StreamTarget};

/// Buffer between the stdin thread and the session.
const STDIN_BUFFER: usize = 64 * 1024;

#[derive(Args)]
pub struct ExecArgs {
    /// Container ID
    pub container: String,

    /// Run with ExecSync and print the captured output
    #[arg(long)]
    pub sync: bool,

    /// ExecSync timeout in seconds (0 uses the configured default)
    #[arg(long, default_value = "0")]
    pub timeout: u64,

    /// Keep STDIN open (forward stdin to the command)
    #[arg(short = 'i', long = "interactive")]
    pub interactive: bool,

    /// Allocate a pseudo-TTY
    #[arg(short = 't', long = "tty")]
    pub tty: bool,

    /// Command and arguments to execute
    #[arg(last = true, required = true)]
    pub cmd: Vec<String>,
}

pub async fn execute(args: ExecArgs, config: CriTestConfig) -> Result<(), Box<dyn std::error::Error>> {
    let timeout = if args.timeout == 0 {
        config.exec_sync_timeout()
    } else {
        Duration::from_secs(args.timeout)
    };
    let target = StreamTarget::from_config(&config)?;
    let fw = super::connect_framework(config).await?;

    if args.sync {
        let output = fw.exec_sync(&args.container, args.cmd, timeout).await?;
        if !output.stdout.is_empty() {
            print!("{}", String::from_utf8_lossy(&output.stdout));
        }
        if !output.stderr.is_empty() {
            eprint!("{}", String::from_utf8_lossy(&output.stderr));
        }
        if output.exit_code != 0 {
            std::process::exit(output.exit_code);
        }
        return Ok(());
    }

    let session = ExecSession::exec(&args.container, args.cmd)
        .with_tty(args.tty)
        .with_stdin(args.interactive);
    let stdin = args
        .interactive
        .then(|| detached_reader(std::io::stdin()));

    let outcome = if args.tty {
        let (tx, rx) = mpsc::channel(4);
        if let Ok((width, height)) = crossterm::terminal::size() {
            let _ = tx.try_send(TerminalSize { width, height });
        }
        let watcher = tokio::spawn(forward_window_changes(tx));

        let _raw = RawModeGuard::enable()?;
        let result = run_session(
            fw.runtime().as_ref(),
            &target,
            &session,
            stdin,
            tokio::io::stdout(),
            tokio::io::stderr(),
            Some(rx),
        )
        .await;
        watcher.abort();
        result?
    } else {
        run_session(
            fw.runtime().as_ref(),
            &target,
            &session,
            stdin,
            tokio::io::stdout(),
            tokio::io::stderr(),
            None,
        )
        .await?
    };

    tracing::debug!(protocol = %outcome.protocol, exit_code = outcome.exit_code, "Session finished");
    if outcome.exit_code != 0 {
        std::process::exit(outcome.exit_code);
    }
    Ok(())
}

/// Read `source` on a detached thread and expose it as an async stream.
///
/// The thread is never joined: a read still blocked when the session ends
/// must not keep the runtime from shutting down.
fn detached_reader<R: Read + Send + 'static>(mut source: R) -> DuplexStream {
    let (mut writer, reader) = tokio::io::duplex(STDIN_BUFFER);
    let handle = tokio::runtime::Handle::current();
    std::thread::spawn(move || {
        let mut buf = [0u8; 8192];
        loop {
            let n = match source.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::debug!(error = %e, "stdin read failed");
                    break;
                }
            };
            if handle.block_on(writer.write_all(&buf[..n])).is_err() {
                break;
            }
        }
        // Dropping the writer signals EOF to the session.
    });
    reader
}

/// Send the terminal size on every SIGWINCH until the receiver goes away.
async fn forward_window_changes(tx: mpsc::Sender<TerminalSize>) {
    use tokio::signal::unix::{signal, SignalKind};

    let Ok(mut sigwinch) = signal(SignalKind::window_change()) else {
        return;
    };
    while sigwinch.recv().await.is_some() {
        if let Ok((width, height)) = crossterm::terminal::size() {
            if tx.send(TerminalSize { width, height }).await.is_err() {
                break;
            }
        }
    }
}

/// Restores cooked mode when dropped, including on error paths.
struct RawModeGuard;

impl RawModeGuard {
    fn enable() -> std::io::Result<Self> {
        crossterm::terminal::enable_raw_mode()?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = crossterm::terminal::disable_raw_mode();
    }
}
