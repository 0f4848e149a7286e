#![forbid(unsafe_code)]

use crate::{AgentGrant, MethodSurface};
use cd_core::select::SelectionPolicy;
use cd_storage::SqliteStore;
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

/// Serves line-delimited JSON-RPC until the reader closes. The stdio binary
/// and the socket transport both end up here.
pub fn serve_lines<R: BufRead, W: Write>(
    surface: &mut MethodSurface,
    reader: R,
    writer: &mut W,
) -> std::io::Result<()> {
    for line in reader.lines() {
        let line = match line {
            Ok(v) => v,
            Err(_) => break,
        };
        if let Some(response) = surface.handle_line(&line) {
            let encoded = serde_json::to_string(&response).unwrap_or_else(|_| "{}".to_string());
            writeln!(writer, "{encoded}")?;
            writer.flush()?;
        }
    }
    Ok(())
}

/// The engine-hosted socket transport: the same line protocol on a local TCP
/// port, served from a dedicated thread with its own store connection.
pub struct SurfaceServer {
    addr: SocketAddr,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl SurfaceServer {
    /// Binds `127.0.0.1:port` (0 picks an ephemeral port) and starts serving.
    pub fn spawn(
        db_path: PathBuf,
        grant: AgentGrant,
        policy: SelectionPolicy,
        plan_file: Option<PathBuf>,
        deadline_ms: Option<i64>,
        port: u16,
    ) -> Result<Self, String> {
        let listener = TcpListener::bind(("127.0.0.1", port))
            .map_err(|e| format!("failed to bind method surface port {port}: {e}"))?;
        let addr = listener
            .local_addr()
            .map_err(|e| format!("failed to resolve method surface address: {e}"))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| format!("failed to configure method surface listener: {e}"))?;

        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let handle = std::thread::spawn(move || {
            serve_listener(
                listener, stop_flag, db_path, grant, policy, plan_file, deadline_ms,
            );
        });

        Ok(Self {
            addr,
            stop,
            handle: Some(handle),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for SurfaceServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[allow(clippy::too_many_arguments)]
fn serve_listener(
    listener: TcpListener,
    stop: Arc<AtomicBool>,
    db_path: PathBuf,
    grant: AgentGrant,
    policy: SelectionPolicy,
    plan_file: Option<PathBuf>,
    deadline_ms: Option<i64>,
) {
    let store = match SqliteStore::open(&db_path) {
        Ok(store) => store,
        Err(e) => {
            eprintln!("method surface failed to open store: {e}");
            return;
        }
    };
    let mut surface = MethodSurface::new(store, grant, policy, plan_file, deadline_ms);

    // One connection at a time. The runner speaks sequentially, and follow-up
    // invocations reconnect; there is no concurrent-client contract here.
    loop {
        if stop.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, _peer)) => serve_connection(&mut surface, stream, &stop),
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(25));
            }
            Err(_) => break,
        }
    }
}

fn serve_connection(surface: &mut MethodSurface, stream: TcpStream, stop: &Arc<AtomicBool>) {
    let Ok(read_half) = stream.try_clone() else {
        return;
    };
    // A short read timeout keeps the stop flag responsive while a client
    // holds the connection open without sending.
    let _ = read_half.set_read_timeout(Some(Duration::from_millis(250)));
    let mut reader = BufReader::new(read_half);
    let mut writer = stream;

    let mut line = String::new();
    loop {
        if stop.load(Ordering::SeqCst) {
            return;
        }
        // `read_line` keeps any partial bytes in `line` on timeout, so a
        // retry continues the same line instead of corrupting the stream.
        match reader.read_line(&mut line) {
            Ok(0) => return,
            Ok(_) => {
                if let Some(response) = surface.handle_line(&line) {
                    let encoded =
                        serde_json::to_string(&response).unwrap_or_else(|_| "{}".to_string());
                    if writeln!(writer, "{encoded}").is_err() || writer.flush().is_err() {
                        return;
                    }
                }
                line.clear();
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {}
            Err(_) => return,
        }
    }
}
