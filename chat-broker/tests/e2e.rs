use std::{
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use anyhow::{Context, Result, anyhow, ensure};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{Child, ChildStdin, ChildStdout, Command},
    time::timeout,
};

const READ_TIMEOUT: Duration = Duration::from_secs(3);

#[tokio::test]
async fn cli_chat_end_to_end() -> Result<()> {
    let binary = assert_cmd::cargo::cargo_bin("chat_broker");

    let mut broker = BrokerProcess::spawn(&binary).await?;
    let addr = broker.listen_addr().await?;
    let broker_logs = broker.drain_logs();

    let mut alice = Participant::join(&binary, "alice", &addr).await?;
    let mut bob = Participant::join(&binary, "bob", &addr).await?;

    // A broadcast reaches both participants, sender included.
    alice.type_line("Hello from Alice").await?;
    bob.expect_line("<alice> Hello from Alice").await?;
    alice.expect_line("<alice> Hello from Alice").await?;

    // A whisper reaches only its recipient.
    bob.type_line("/msg alice just between us").await?;
    alice.expect_line("[private] <bob> just between us").await?;

    // Bob's next line proves he never saw his own whisper.
    bob.type_line("Bye!").await?;
    bob.expect_line("<bob> Bye!").await?;
    alice.expect_line("<bob> Bye!").await?;

    alice.type_line("/quit").await?;
    alice.expect_line("*** leaving chat").await?;
    bob.type_line("/quit").await?;
    bob.expect_line("*** leaving chat").await?;

    alice.finish().await?;
    bob.finish().await?;

    // The broker runs until interrupted; stop it by hand.
    let _ = broker.child.kill().await;
    let _ = broker.child.wait().await;
    let _ = broker_logs.await;

    Ok(())
}

struct BrokerProcess {
    child: Child,
    stdout: Option<BufReader<ChildStdout>>,
}

impl BrokerProcess {
    async fn spawn(binary: &Path) -> Result<Self> {
        let mut child = Command::new(binary)
            .args(["broker", "--listen", "127.0.0.1:0"])
            .env("RUST_LOG", "info")
            .env("NO_COLOR", "1")
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .context("failed to spawn broker")?;
        let stdout = child.stdout.take().context("broker stdout missing")?;

        Ok(Self {
            child,
            stdout: Some(BufReader::new(stdout)),
        })
    }

    /// Reads the startup banner, whose last word is the bound address.
    async fn listen_addr(&mut self) -> Result<String> {
        let stdout = self.stdout.as_mut().context("broker logs already taken")?;
        let banner = next_line(stdout, "broker banner").await?;
        let addr = banner
            .split_whitespace()
            .last()
            .context("empty broker banner")?;
        ensure!(addr.contains(':'), "broker banner missing socket: {banner}");
        Ok(addr.to_string())
    }

    /// Keeps reading broker logs in the background so the pipe never fills.
    fn drain_logs(&mut self) -> tokio::task::JoinHandle<()> {
        let stdout = self.stdout.take();
        tokio::spawn(async move {
            let Some(mut stdout) = stdout else { return };
            let mut sink = String::new();
            while let Ok(bytes) = stdout.read_line(&mut sink).await {
                if bytes == 0 {
                    break;
                }
                sink.clear();
            }
        })
    }
}

struct Participant {
    id: String,
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl Participant {
    async fn join(binary: &PathBuf, id: &str, addr: &str) -> Result<Self> {
        let mut child = Command::new(binary)
            .args(["client", "--id", id, "--server", addr])
            .env("RUST_LOG", "warn")
            .env("NO_COLOR", "1")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn client {id}"))?;

        let stdin = child.stdin.take().context("client stdin missing")?;
        let stdout = child.stdout.take().context("client stdout missing")?;

        let mut participant = Self {
            id: id.to_string(),
            child,
            stdin,
            stdout: BufReader::new(stdout),
        };
        participant
            .expect_line(&format!("*** connected as {id}"))
            .await?;
        Ok(participant)
    }

    async fn type_line(&mut self, line: &str) -> Result<()> {
        self.stdin
            .write_all(format!("{line}\n").as_bytes())
            .await
            .with_context(|| format!("{} failed to type '{line}'", self.id))?;
        self.stdin.flush().await?;
        Ok(())
    }

    async fn expect_line(&mut self, expected: &str) -> Result<()> {
        let what = format!("{} waiting for '{expected}'", self.id);
        let line = next_line(&mut self.stdout, &what).await?;
        ensure!(line == expected, "{what}: got '{line}'");
        Ok(())
    }

    async fn finish(mut self) -> Result<()> {
        let status = timeout(READ_TIMEOUT, self.child.wait())
            .await
            .with_context(|| format!("{} did not exit", self.id))??;
        ensure!(status.success(), "{} exited with status {status}", self.id);
        Ok(())
    }
}

async fn next_line(reader: &mut BufReader<ChildStdout>, what: &str) -> Result<String> {
    let mut line = String::new();
    let bytes = timeout(READ_TIMEOUT, reader.read_line(&mut line))
        .await
        .map_err(|_| anyhow!("{what}: timed out"))?
        .with_context(|| format!("{what}: failed to read line"))?;
    ensure!(bytes > 0, "{what}: stream closed");
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}
