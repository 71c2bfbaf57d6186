use std::path::PathBuf;

use tokio::{net::UnixDatagram, runtime::Handle, task::JoinHandle};
use tracing::{error, trace};

use crate::error::Error;

/// Flow-tag updates from the flow-inspection peer arrive here.
pub const FLOW_TAGS_ENDPOINT: &str = "ipc:///tmp/ctstats_flow_tags";

const RECV_BUF_LEN: usize = 65536;

pub type RecvHandler = Box<dyn FnMut(&[u8]) + Send>;

/// Optional IPC transport. A missing backend disables the sink
/// silently; a backend that fails to start is an init error.
pub trait IpcBackend: Send {
    fn init_server(
        &self,
        endpoint: &str,
        handle: &Handle,
        recv: RecvHandler,
    ) -> Result<IpcServer, Error>;
}

/// A running flow-tag receiver, torn down at plugin close.
pub struct IpcServer {
    path: PathBuf,
    task: JoinHandle<()>,
}

impl IpcServer {
    #[cfg(test)]
    pub(crate) fn stub(path: PathBuf, task: JoinHandle<()>) -> IpcServer {
        IpcServer { path, task }
    }

    pub fn terminate(self) {
        self.task.abort();
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Pull-style datagram endpoint: one datagram per encoded update, no
/// schema enforced here.
pub struct UnixPullBackend;

impl IpcBackend for UnixPullBackend {
    fn init_server(
        &self,
        endpoint: &str,
        handle: &Handle,
        mut recv: RecvHandler,
    ) -> Result<IpcServer, Error> {
        let path = PathBuf::from(endpoint.strip_prefix("ipc://").unwrap_or(endpoint));
        // A stale socket file from a previous run would fail the bind.
        let _ = std::fs::remove_file(&path);
        let socket = {
            let _guard = handle.enter();
            UnixDatagram::bind(&path).map_err(Error::Ipc)?
        };
        let task = handle.spawn(async move {
            let mut buf = vec![0u8; RECV_BUF_LEN];
            loop {
                match socket.recv(&mut buf).await {
                    Ok(len) => {
                        trace!(len, "received flow-tag update");
                        recv(&buf[..len]);
                    }
                    Err(e) => {
                        error!(error = %e, "flow-tag receive failed");
                        break;
                    }
                }
            }
        });
        Ok(IpcServer { path, task })
    }
}
