//! Cross-process broadcast bus.
//!
//! [`Broadcaster`] is the seam for the host's "deliver to every live process
//! of this app" mechanism. Publishing reaches every subscriber, the publishing
//! process included; each subscription yields messages in publish order.
//!
//! - [`LocalBroadcaster`]: in-process channels. Several monitors sharing one
//!   instance behave like several processes on one bus.
//! - [`SocketBroadcaster`] (Unix): one listening domain socket per subscribing
//!   process under `{data_dir}/bus/`, named `{pid}-{seq}.sock`. Publishing
//!   connects to every socket in the directory and writes one
//!   newline-terminated JSON [`BusMessage`].
//!
//! A bus with no subscribers is not an error: publish reports zero deliveries.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Mutex;

use appfocus_protocol::BusMessage;

use crate::error::Result;

pub trait Broadcaster: Send + Sync {
    /// Delivers `message` to every current subscriber and returns how many
    /// were reached.
    fn publish(&self, message: &BusMessage) -> Result<usize>;

    /// Opens a new subscription for this process.
    fn subscribe(&self) -> Result<Receiver<BusMessage>>;
}

#[derive(Debug, Default)]
pub struct LocalBroadcaster {
    subscribers: Mutex<Vec<Sender<BusMessage>>>,
}

impl LocalBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Broadcaster for LocalBroadcaster {
    fn publish(&self, message: &BusMessage) -> Result<usize> {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        subscribers.retain(|tx| tx.send(message.clone()).is_ok());
        Ok(subscribers.len())
    }

    fn subscribe(&self) -> Result<Receiver<BusMessage>> {
        let (tx, rx) = mpsc::channel();
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(tx);
        Ok(rx)
    }
}

#[cfg(unix)]
pub use socket::SocketBroadcaster;

#[cfg(unix)]
mod socket {
    use std::io::{Read, Write};
    use std::os::unix::net::{UnixListener, UnixStream};
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::mpsc::{self, Receiver, Sender};
    use std::sync::{Arc, Mutex};
    use std::thread;
    use std::time::Duration;

    use appfocus_protocol::{parse_message, BusMessage, MAX_MESSAGE_BYTES};
    use fs_err as fs;
    use tracing::{debug, trace, warn};

    use super::Broadcaster;
    use crate::error::{FocusError, Result};

    const SOCKET_EXTENSION: &str = "sock";
    const READ_TIMEOUT_MS: u64 = 500;
    const WRITE_TIMEOUT_MS: u64 = 500;
    const READ_CHUNK_SIZE: usize = 4096;
    const RETRY_DELAY_MS: u64 = 50;

    // Process-wide so several broadcasters in one process never share a name.
    static NEXT_SEQ: AtomicU64 = AtomicU64::new(0);

    struct Subscription {
        path: PathBuf,
        closed: Arc<AtomicBool>,
    }

    pub struct SocketBroadcaster {
        bus_dir: PathBuf,
        subscriptions: Mutex<Vec<Subscription>>,
    }

    impl SocketBroadcaster {
        pub fn new(bus_dir: impl Into<PathBuf>) -> Self {
            Self {
                bus_dir: bus_dir.into(),
                subscriptions: Mutex::new(Vec::new()),
            }
        }

        pub fn bus_dir(&self) -> &Path {
            &self.bus_dir
        }

        /// Removes sockets left behind by processes that no longer exist.
        pub fn prune_stale(&self) -> usize {
            let Ok(entries) = fs::read_dir(&self.bus_dir) else {
                return 0;
            };

            let mut pruned = 0;
            for entry in entries.flatten() {
                let path = entry.path();
                if !is_socket_file(&path) {
                    continue;
                }
                if let Some(pid) = owner_pid(&path) {
                    if !is_pid_alive(pid) && fs::remove_file(&path).is_ok() {
                        debug!(path = %path.display(), pid, "Pruned stale bus socket");
                        pruned += 1;
                    }
                }
            }
            pruned
        }

        fn deliver_with_retry(&self, path: &Path, frame: &[u8]) -> std::io::Result<()> {
            match deliver(path, frame) {
                Ok(()) => Ok(()),
                Err(err) if is_dead_socket(&err) => Err(err),
                Err(err) => {
                    warn!(error = %err, path = %path.display(), "Bus delivery failed; retrying");
                    thread::sleep(Duration::from_millis(RETRY_DELAY_MS));
                    deliver(path, frame)
                }
            }
        }
    }

    impl Broadcaster for SocketBroadcaster {
        fn publish(&self, message: &BusMessage) -> Result<usize> {
            let mut frame = serde_json::to_vec(message).map_err(|err| FocusError::BusProtocol {
                code: "serialization_error".to_string(),
                message: err.to_string(),
            })?;
            frame.push(b'\n');

            let entries = match fs::read_dir(&self.bus_dir) {
                Ok(entries) => entries,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
                Err(source) => {
                    return Err(FocusError::Bus {
                        context: "Failed to list bus subscribers".to_string(),
                        source,
                    });
                }
            };

            let mut paths: Vec<PathBuf> = entries
                .flatten()
                .map(|entry| entry.path())
                .filter(|path| is_socket_file(path))
                .collect();
            paths.sort();

            let mut delivered = 0;
            for path in paths {
                match self.deliver_with_retry(&path, &frame) {
                    Ok(()) => delivered += 1,
                    Err(err) if is_dead_socket(&err) => {
                        // Nobody is listening there any more.
                        let _ = fs::remove_file(&path);
                        debug!(path = %path.display(), "Removed dead bus socket");
                    }
                    Err(err) => {
                        warn!(error = %err, path = %path.display(), "Bus delivery failed");
                    }
                }
            }

            trace!(delivered, event_id = %message.event_id, "Published bus message");
            Ok(delivered)
        }

        fn subscribe(&self) -> Result<Receiver<BusMessage>> {
            let bus_io = |context: &str, source: std::io::Error| FocusError::Bus {
                context: context.to_string(),
                source,
            };

            fs::create_dir_all(&self.bus_dir)
                .map_err(|err| bus_io("Failed to create bus directory", err))?;
            self.prune_stale();

            let seq = NEXT_SEQ.fetch_add(1, Ordering::Relaxed);
            let path = self
                .bus_dir
                .join(format!("{}-{}.{}", std::process::id(), seq, SOCKET_EXTENSION));
            if path.exists() {
                fs::remove_file(&path)
                    .map_err(|err| bus_io("Failed to remove leftover bus socket", err))?;
            }

            let listener = UnixListener::bind(&path).map_err(|source| FocusError::Bus {
                context: format!("Failed to bind bus socket {}", path.display()),
                source,
            })?;

            let (tx, rx) = mpsc::channel();
            let closed = Arc::new(AtomicBool::new(false));
            let accept_path = path.clone();
            let accept_closed = Arc::clone(&closed);
            thread::Builder::new()
                .name("appfocus-bus".to_string())
                .spawn(move || accept_loop(listener, tx, &accept_path, &accept_closed))
                .map_err(|source| FocusError::WorkerSpawn {
                    name: "bus receiver".to_string(),
                    source,
                })?;

            debug!(path = %path.display(), "Subscribed to bus");
            self.subscriptions
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .push(Subscription { path, closed });
            Ok(rx)
        }
    }

    impl Drop for SocketBroadcaster {
        fn drop(&mut self) {
            let subscriptions = self
                .subscriptions
                .get_mut()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            for subscription in subscriptions.drain(..) {
                subscription.closed.store(true, Ordering::SeqCst);
                // Wake the accept loop so it observes the flag.
                let _ = UnixStream::connect(&subscription.path);
                let _ = fs::remove_file(&subscription.path);
            }
        }
    }

    // Connections are handled one at a time, in accept order, which keeps
    // messages in publish order.
    fn accept_loop(
        listener: UnixListener,
        tx: Sender<BusMessage>,
        path: &Path,
        closed: &AtomicBool,
    ) {
        for stream in listener.incoming() {
            if closed.load(Ordering::SeqCst) {
                break;
            }
            let mut stream = match stream {
                Ok(stream) => stream,
                Err(err) => {
                    warn!(error = %err, "Failed to accept bus connection");
                    continue;
                }
            };

            let message = match read_frame(&mut stream) {
                Ok(message) => message,
                Err(err) => {
                    warn!(error = %err, "Dropping invalid bus message");
                    continue;
                }
            };

            if tx.send(message).is_err() {
                debug!(path = %path.display(), "Bus subscription dropped; closing socket");
                let _ = fs::remove_file(path);
                break;
            }
        }
    }

    fn read_frame(stream: &mut UnixStream) -> Result<BusMessage> {
        let _ = stream.set_read_timeout(Some(Duration::from_millis(READ_TIMEOUT_MS)));

        let mut buffer = Vec::new();
        let mut chunk = [0u8; READ_CHUNK_SIZE];

        loop {
            match stream.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    buffer.extend_from_slice(&chunk[..n]);
                    if buffer.len() > MAX_MESSAGE_BYTES {
                        return Err(FocusError::BusProtocol {
                            code: "message_too_large".to_string(),
                            message: "message exceeded maximum size".to_string(),
                        });
                    }
                    if chunk[..n].contains(&b'\n') {
                        break;
                    }
                }
                Err(err)
                    if err.kind() == std::io::ErrorKind::WouldBlock
                        || err.kind() == std::io::ErrorKind::TimedOut =>
                {
                    return Err(FocusError::BusProtocol {
                        code: "read_timeout".to_string(),
                        message: "message timed out".to_string(),
                    });
                }
                Err(source) => {
                    return Err(FocusError::Bus {
                        context: "Failed to read bus message".to_string(),
                        source,
                    });
                }
            }
        }

        let frame = match buffer.iter().position(|b| *b == b'\n') {
            Some(index) => &buffer[..index],
            None => buffer.as_slice(),
        };
        Ok(parse_message(frame)?)
    }

    fn deliver(path: &Path, frame: &[u8]) -> std::io::Result<()> {
        let mut stream = UnixStream::connect(path)?;
        let _ = stream.set_write_timeout(Some(Duration::from_millis(WRITE_TIMEOUT_MS)));
        stream.write_all(frame)?;
        stream.flush()
    }

    fn is_dead_socket(err: &std::io::Error) -> bool {
        matches!(
            err.kind(),
            std::io::ErrorKind::ConnectionRefused | std::io::ErrorKind::NotFound
        )
    }

    fn is_socket_file(path: &Path) -> bool {
        path.extension().is_some_and(|ext| ext == SOCKET_EXTENSION)
    }

    fn owner_pid(path: &Path) -> Option<u32> {
        path.file_stem()?
            .to_str()?
            .split('-')
            .next()?
            .parse()
            .ok()
    }

    // EPERM means the process exists but belongs to another user.
    fn is_pid_alive(pid: u32) -> bool {
        if unsafe { libc::kill(pid as i32, 0) } == 0 {
            return true;
        }
        std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use appfocus_protocol::{EventKind, BROADCAST_ACTION, PROTOCOL_VERSION};

    fn message(event_id: &str) -> BusMessage {
        BusMessage {
            protocol_version: PROTOCOL_VERSION,
            action: BROADCAST_ACTION.to_string(),
            event_id: event_id.to_string(),
            recorded_at: "2026-01-30T12:00:00Z".to_string(),
            event_kind: EventKind::AppForeground,
            screen_id: "Home@1".to_string(),
            origin_process: None,
            origin_pid: None,
        }
    }

    #[test]
    fn local_publish_fans_out_to_every_subscriber() {
        let bus = LocalBroadcaster::new();
        let first = bus.subscribe().unwrap();
        let second = bus.subscribe().unwrap();

        assert_eq!(bus.publish(&message("e1")).unwrap(), 2);
        assert_eq!(first.try_recv().unwrap().event_id, "e1");
        assert_eq!(second.try_recv().unwrap().event_id, "e1");
    }

    #[test]
    fn local_publish_forgets_dropped_subscribers() {
        let bus = LocalBroadcaster::new();
        let kept = bus.subscribe().unwrap();
        drop(bus.subscribe().unwrap());

        assert_eq!(bus.publish(&message("e1")).unwrap(), 1);
        assert!(kept.try_recv().is_ok());
    }
}
