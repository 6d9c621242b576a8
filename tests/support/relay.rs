use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::Duration;

use tempfile::TempDir;

use super::logs::{Logs, buf_contains};

const STARTUP_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// RelayTest: builder that configures the environment and spawns the binary
// ---------------------------------------------------------------------------

pub struct RelayTest {
    env: Vec<(String, String)>,
}

impl RelayTest {
    pub fn new() -> Self {
        static INIT: std::sync::Once = std::sync::Once::new();
        INIT.call_once(|| {
            rustls::crypto::ring::default_provider()
                .install_default()
                .expect("failed to install rustls ring provider");
        });

        Self {
            env: vec![
                ("CLICKHOUSE_BULK_LOG_LEVEL".into(), "debug".into()),
                ("CLICKHOUSE_BULK_SEND_TIMEOUT_MS".into(), "2000".into()),
            ],
        }
    }

    /// Backend addresses, in failover order.
    pub fn servers(self, servers: &[&str]) -> Self {
        self.env("CLICKHOUSE_BULK_SERVERS", &servers.join(","))
    }

    /// Set an environment variable, replacing any earlier value.
    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.env.retain(|(k, _)| k != key);
        self.env.push((key.into(), value.into()));
        self
    }

    /// Spawn the relay without waiting for it to come up.
    pub fn spawn(self) -> Relay {
        let dir = tempfile::tempdir().unwrap();
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let stdout_path = dir.path().join("stdout.log");
        let stderr_path = dir.path().join("stderr.log");

        let mut cmd = Command::new(env!("CARGO_BIN_EXE_clickhouse-bulk-relay"));
        cmd.env_clear()
            .env("CLICKHOUSE_BULK_LISTENER_PORT", port.to_string())
            .env("CLICKHOUSE_BULK_DUMP_DIR", dir.path().join("dumps"))
            .stdin(Stdio::null())
            .stdout(File::create(&stdout_path).unwrap())
            .stderr(File::create(&stderr_path).unwrap());
        for (key, val) in &self.env {
            cmd.env(key, val);
        }
        let child = cmd.spawn().expect("failed to spawn relay binary");

        Relay {
            child,
            port,
            dir,
            stdout_path,
            stderr_path,
        }
    }

    /// Spawn the relay and wait until its listener is up.
    pub async fn start(self) -> Relay {
        let relay = self.spawn();
        relay.wait_for_log("relay started", STARTUP_TIMEOUT).await;
        relay
    }
}

// ---------------------------------------------------------------------------
// Relay: a running relay process
// ---------------------------------------------------------------------------

pub struct Relay {
    child: Child,
    port: u16,
    dir: TempDir,
    stdout_path: PathBuf,
    stderr_path: PathBuf,
}

impl Relay {
    pub fn url(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}{path}", self.port)
    }

    pub fn dump_dir(&self) -> PathBuf {
        self.dir.path().join("dumps")
    }

    /// `*.dmp` files currently in the spill directory.
    pub fn dump_files(&self) -> Vec<PathBuf> {
        let Ok(entries) = std::fs::read_dir(self.dump_dir()) else {
            return Vec::new();
        };
        let mut files: Vec<_> = entries
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "dmp"))
            .collect();
        files.sort();
        files
    }

    /// POST `body` under the given insert statement; returns the HTTP status.
    pub async fn insert(&self, query: &str, body: &str) -> u16 {
        let mut url = url::Url::parse(&self.url("/")).unwrap();
        url.query_pairs_mut().append_pair("query", query);
        reqwest::Client::new()
            .post(url)
            .body(body.to_owned())
            .send()
            .await
            .expect("insert request failed")
            .status()
            .as_u16()
    }

    pub async fn get(&self, path: &str) -> (u16, String) {
        let resp = reqwest::get(self.url(path)).await.expect("request failed");
        let status = resp.status().as_u16();
        (status, resp.text().await.unwrap_or_default())
    }

    pub fn logs(&self) -> Logs {
        Logs {
            stdout: read_lossy(&self.stdout_path),
            stderr: read_lossy(&self.stderr_path),
        }
    }

    /// Poll the captured logs until `target` appears.
    pub async fn wait_for_log(&self, target: &str, timeout: Duration) -> Logs {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let logs = self.logs();
            if buf_contains(&logs.stderr, target) || buf_contains(&logs.stdout, target) {
                return logs;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!(
                    "Timed out waiting for {target:?} after {timeout:?}.\nLogs:\n{}{}",
                    logs.stdout, logs.stderr
                );
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    /// Send SIGTERM and wait for the process to exit.
    pub async fn terminate(&mut self, timeout: Duration) -> (ExitStatus, Logs) {
        let status = Command::new("kill")
            .args(["-TERM", &self.child.id().to_string()])
            .status()
            .expect("failed to run kill");
        assert!(status.success(), "kill -TERM failed");
        let status = self.wait(timeout).await;
        (status, self.logs())
    }

    /// Wait for the process to exit on its own.
    pub async fn wait(&mut self, timeout: Duration) -> ExitStatus {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(status) = self.child.try_wait().unwrap() {
                return status;
            }
            if tokio::time::Instant::now() >= deadline {
                let logs = self.logs();
                panic!(
                    "relay did not exit within {timeout:?}.\nLogs:\n{}{}",
                    logs.stdout, logs.stderr
                );
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }
}

impl Drop for Relay {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

fn read_lossy(path: &Path) -> String {
    std::fs::read(path)
        .map(|b| String::from_utf8_lossy(&b).into_owned())
        .unwrap_or_default()
}
