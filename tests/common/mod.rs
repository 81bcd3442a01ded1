use ahm_control::{AhmClient, DeviceConfig, DeviceModel, MemoryNameStore};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};

enum Action {
    Push(Vec<u8>),
    Hangup,
}

/// In-process stand-in for the mixer: records what it receives and plays
/// back whatever the test pushes
pub struct MockDevice {
    pub port: u16,
    received: Arc<Mutex<Vec<u8>>>,
    accepted: Arc<AtomicUsize>,
    actions: mpsc::UnboundedSender<Action>,
    task: JoinHandle<()>,
}

impl MockDevice {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let received = Arc::new(Mutex::new(Vec::new()));
        let accepted = Arc::new(AtomicUsize::new(0));
        let (actions, mut rx) = mpsc::unbounded_channel();

        let task = {
            let received = received.clone();
            let accepted = accepted.clone();
            tokio::spawn(async move {
                loop {
                    let Ok((mut socket, _)) = listener.accept().await else {
                        return;
                    };
                    accepted.fetch_add(1, Ordering::SeqCst);
                    let mut buf = [0u8; 512];
                    loop {
                        tokio::select! {
                            read = socket.read(&mut buf) => match read {
                                Ok(0) | Err(_) => break,
                                Ok(n) => received.lock().extend_from_slice(&buf[..n]),
                            },
                            action = rx.recv() => match action {
                                Some(Action::Push(bytes)) => {
                                    if socket.write_all(&bytes).await.is_err() {
                                        break;
                                    }
                                }
                                Some(Action::Hangup) => break,
                                None => return,
                            },
                        }
                    }
                }
            })
        };

        Self {
            port,
            received,
            accepted,
            actions,
            task,
        }
    }

    pub fn push(&self, bytes: &[u8]) {
        let _ = self.actions.send(Action::Push(bytes.to_vec()));
    }

    /// Close the current connection; the device keeps accepting new ones
    pub fn hang_up(&self) {
        let _ = self.actions.send(Action::Hangup);
    }

    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// How many times `frame` appears in everything received so far
    pub fn count(&self, frame: &[u8]) -> usize {
        let received = self.received.lock();
        received
            .windows(frame.len())
            .filter(|window| *window == frame)
            .count()
    }

    pub async fn wait_for_frame(&self, frame: &[u8]) {
        let found = wait_until(Duration::from_secs(3), || self.count(frame) > 0).await;
        assert!(found, "device never received {:02X?}", frame);
    }
}

impl Drop for MockDevice {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub async fn wait_until(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    condition()
}

pub fn config(port: u16) -> DeviceConfig {
    let mut config = DeviceConfig::new("127.0.0.1", DeviceModel::Ahm16);
    config.port = port;
    config.inputs = vec![1];
    config.zones = vec![1];
    config.request_timeout_ms = 300;
    config.initial_wait_ms = 300;
    config
}

pub fn client(config: DeviceConfig) -> AhmClient {
    AhmClient::new(config, Arc::new(MemoryNameStore::new())).unwrap()
}

/// SysEx frame with the device header
pub fn sysex(payload: &[u8]) -> Vec<u8> {
    let mut out = ahm_control::SYSEX_HEADER.to_vec();
    out.extend_from_slice(payload);
    out.push(0xF7);
    out
}
