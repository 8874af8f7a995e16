//! The byte-stream abstraction a `Device` reads and writes. Production
//! code talks to a
//! real `/dev/cdc-wdm*` character device; tests talk to an in-memory
//! loopback that records writes and is fed canned response bytes.

use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;

use tokio::io::unix::AsyncFd;
use tokio::io::Interest;

/// Non-blocking duplex byte stream. `Device` only ever calls `read` from
/// its single reactor task and `write_all` from its single writer path,
/// so this trait does not need to be `Sync`.
#[async_trait::async_trait]
pub trait Transport: Send {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    async fn write_all(&mut self, buf: &[u8]) -> io::Result<()>;
}

/// Production transport: a real character device opened with a flag
/// combination that is load-bearing — `O_EXCL` keeps a second instance
/// from opening the same device.
pub struct CharDeviceTransport {
    fd: AsyncFd<OwnedDeviceFd>,
}

struct OwnedDeviceFd(std::fs::File);

impl AsRawFd for OwnedDeviceFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

impl CharDeviceTransport {
    pub fn open(path: &Path) -> io::Result<Self> {
        use nix::fcntl::{open, OFlag};
        use nix::sys::stat::Mode;
        use std::os::unix::io::FromRawFd;

        let raw = open(
            path,
            OFlag::O_RDWR | OFlag::O_EXCL | OFlag::O_NONBLOCK | OFlag::O_NOCTTY,
            Mode::empty(),
        )
        .map_err(|e| io::Error::from_raw_os_error(e as i32))?;
        // SAFETY: `open` returned a freshly-opened, uniquely-owned fd.
        let file = unsafe { std::fs::File::from_raw_fd(raw) };
        let fd = AsyncFd::new(OwnedDeviceFd(file))?;
        Ok(CharDeviceTransport { fd })
    }
}

#[async_trait::async_trait]
impl Transport for CharDeviceTransport {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.fd.readable_mut().await?;
            match guard.try_io(|inner| {
                use std::io::Read;
                inner.get_mut().0.read(buf)
            }) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        let mut written = 0;
        while written < buf.len() {
            let mut guard = self.fd.writable_mut().await?;
            match guard.try_io(|inner| {
                use std::io::Write;
                inner.get_mut().0.write(&buf[written..])
            }) {
                Ok(Ok(n)) => written += n,
                Ok(Err(e)) => return Err(e),
                Err(_would_block) => continue,
            }
        }
        Ok(())
    }
}

impl CharDeviceTransport {
    /// Registers interest explicitly; used only to document that both
    /// readable and writable edges are driven by the same reactor slot.
    #[allow(dead_code)]
    fn interest() -> Interest {
        Interest::READABLE | Interest::WRITABLE
    }
}

/// In-memory transport for the seed-scenario integration tests
/// writes are recorded for assertions,
/// reads are served from a queue the test script feeds.
#[cfg(any(test, feature = "test-util"))]
pub mod loopback {
    use super::*;
    use std::collections::VecDeque;
    use tokio::sync::Mutex;

    #[derive(Default, Clone)]
    pub struct LoopbackTransport {
        pub writes: std::sync::Arc<Mutex<Vec<Vec<u8>>>>,
        inbound: std::sync::Arc<Mutex<VecDeque<u8>>>,
        notify: std::sync::Arc<tokio::sync::Notify>,
        write_notify: std::sync::Arc<tokio::sync::Notify>,
    }

    impl LoopbackTransport {
        pub fn new() -> Self {
            LoopbackTransport::default()
        }

        /// Queues bytes for the next `read` call(s) to return.
        pub async fn push_inbound(&self, bytes: &[u8]) {
            let mut guard = self.inbound.lock().await;
            guard.extend(bytes.iter().copied());
            self.notify.notify_waiters();
        }

        pub async fn recorded_writes(&self) -> Vec<Vec<u8>> {
            self.writes.lock().await.clone()
        }

        /// Blocks until the write at index `after` (0-based) has been
        /// recorded, then returns it. Lets a test-driven stub responder
        /// answer each outgoing message as it is written, independent of
        /// which concurrent FSM produced it.
        pub async fn wait_for_write(&self, after: usize) -> Vec<u8> {
            loop {
                {
                    let writes = self.writes.lock().await;
                    if writes.len() > after {
                        return writes[after].clone();
                    }
                }
                self.write_notify.notified().await;
            }
        }
    }

    #[async_trait::async_trait]
    impl Transport for LoopbackTransport {
        async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            loop {
                {
                    let mut guard = self.inbound.lock().await;
                    if !guard.is_empty() {
                        let n = guard.len().min(buf.len());
                        for slot in buf.iter_mut().take(n) {
                            *slot = guard.pop_front().unwrap();
                        }
                        return Ok(n);
                    }
                }
                self.notify.notified().await;
            }
        }

        async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
            self.writes.lock().await.push(buf.to_vec());
            self.write_notify.notify_waiters();
            Ok(())
        }
    }
}
