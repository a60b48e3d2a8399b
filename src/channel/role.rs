//! Process role and the upstream send capability of a child.
//!
//! The role is resolved once, when the shell or a script boots, and handed
//! to every bus through its [`ChannelRouter`](super::ChannelRouter).

use std::fmt;
use std::io::Write;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Result, ShellError};
use crate::protocol::{write_envelope, Envelope};

/// Set by the process registry on every script it spawns
pub const IPC_ENV_VAR: &str = "SCRIPT_SHELL_IPC";

/// The single ordered send primitive a child has towards its parent.
///
/// Sends are fire-and-forget: returning `Ok` means the envelope was handed
/// to the transport, not that the parent handled it.
pub trait Upstream: Send + Sync {
    fn send(&self, envelope: &Envelope) -> Result<()>;
}

/// JSONL over the child's stdout, the transport the registry listens on
pub struct StdoutUpstream {
    out: Mutex<Box<dyn Write + Send>>,
}

impl StdoutUpstream {
    pub fn new() -> Self {
        Self::from_writer(std::io::stdout())
    }

    pub fn from_writer<W: Write + Send + 'static>(writer: W) -> Self {
        StdoutUpstream {
            out: Mutex::new(Box::new(writer)),
        }
    }
}

impl Default for StdoutUpstream {
    fn default() -> Self {
        Self::new()
    }
}

impl Upstream for StdoutUpstream {
    fn send(&self, envelope: &Envelope) -> Result<()> {
        // One lock per envelope keeps lines from interleaving across threads
        let mut out = self.out.lock();
        write_envelope(&mut *out, envelope).map_err(|e| ShellError::Upstream(e.to_string()))
    }
}

/// In-process upstream, used when parent and "child" share an address space
/// (embedding, tests).
impl Upstream for async_channel::Sender<Envelope> {
    fn send(&self, envelope: &Envelope) -> Result<()> {
        self.send_blocking(envelope.clone())
            .map_err(|_| ShellError::Upstream("upstream receiver dropped".to_string()))
    }
}

/// Whether this process executes channel calls or forwards them
#[derive(Clone)]
pub enum Role {
    /// Owns the registry, disk writes and UI
    Parent,
    /// Proxies every bus call through its upstream
    Child(Arc<dyn Upstream>),
}

impl Role {
    /// Resolve the role of the current process from its environment.
    ///
    /// Children spawned by the registry see `SCRIPT_SHELL_IPC=1` and talk to
    /// the parent over stdout; anything else is a parent.
    pub fn from_env() -> Self {
        match std::env::var(IPC_ENV_VAR) {
            Ok(value) if value == "1" => Role::Child(Arc::new(StdoutUpstream::new())),
            _ => Role::Parent,
        }
    }

    pub fn child(upstream: impl Upstream + 'static) -> Self {
        Role::Child(Arc::new(upstream))
    }

    pub fn is_parent(&self) -> bool {
        matches!(self, Role::Parent)
    }
}

impl fmt::Debug for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Parent => write!(f, "Parent"),
            Role::Child(_) => write!(f, "Child"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ChannelMessage;

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_stdout_upstream_writes_jsonl() {
        let buf = SharedBuf::default();
        let upstream = StdoutUpstream::from_writer(buf.clone());
        upstream
            .send(&Envelope::new("A", ChannelMessage::call("f")))
            .unwrap();
        upstream
            .send(&Envelope::new("B", ChannelMessage::call("g")))
            .unwrap();

        let text = String::from_utf8(buf.0.lock().clone()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("\"channel\":\"A\""));
        assert!(lines[1].contains("\"channel\":\"B\""));
    }

    #[test]
    fn test_channel_upstream_reports_dropped_receiver() {
        let (tx, rx) = async_channel::unbounded::<Envelope>();
        drop(rx);
        let err = Upstream::send(&tx, &Envelope::new("A", ChannelMessage::call("f"))).unwrap_err();
        assert!(matches!(err, ShellError::Upstream(_)));
    }

    #[test]
    fn test_role_predicates() {
        assert!(Role::Parent.is_parent());
        let (tx, _rx) = async_channel::unbounded::<Envelope>();
        let role = Role::child(tx);
        assert!(!role.is_parent());
        assert_eq!(format!("{:?}", role), "Child");
    }
}
