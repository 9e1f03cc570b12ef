//! hostlink daemon entry point.
//!
//! Runs the guest side of the command channel: one listener carries the
//! host's queue pair (framed command/response records over a stream), a
//! second listener exposes the control endpoint to local consumers. One
//! host connection is served at a time; each connection gets a fresh
//! channel instance with empty rings.

use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use hostlink::bridge::BridgeRing;
use hostlink::transport::StreamBackend;
use hostlink::{Channel, ChannelConfig, ControlFile, Error, Result};

/// Control request opcodes, mirroring the four control-file operations.
const OP_WRITE: u8 = 1;
const OP_READ: u8 = 2;
const OP_SET_MSG: u8 = 3;
const OP_GET_MSG: u8 = 4;

/// Status bytes on control responses.
const STATUS_OK: u8 = 0;
const STATUS_ERR: u8 = 1;

/// Cap on a single control request body.
const MAX_CONTROL_LEN: usize = hostlink::bridge::BRIDGE_RECORD_LEN;

fn main() {
    init_logging();

    let config = ChannelConfig::from_env();
    info!(
        version = hostlink::VERSION,
        queue_socket = %config.queue_socket.display(),
        control_socket = %config.control_socket.display(),
        "starting hostlink agent"
    );

    if let Err(e) = run(&config) {
        error!(error = %e, "agent failed");
        std::process::exit(1);
    }
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("hostlink=info".parse().expect("valid directive")),
        )
        .init();
}

fn run(config: &ChannelConfig) -> Result<()> {
    let queue_listener = bind(&config.queue_socket)?;
    let control_listener = bind(&config.control_socket)?;

    // Control connections always talk to the currently attached channel's
    // bridge; between host connections there is nothing to talk to.
    let current_bridge: Arc<Mutex<Option<Arc<BridgeRing>>>> = Arc::new(Mutex::new(None));
    let control_bridge = Arc::clone(&current_bridge);
    std::thread::spawn(move || control_accept_loop(control_listener, control_bridge));

    info!("entering queue accept loop");
    loop {
        let stream = match queue_listener.accept() {
            Ok((stream, _)) => stream,
            Err(e) => {
                warn!(error = %e, "queue accept failed");
                continue;
            }
        };
        info!("host connected");

        let reader = match stream.try_clone() {
            Ok(reader) => reader,
            Err(e) => {
                warn!(error = %e, "stream clone failed, dropping connection");
                continue;
            }
        };
        let backend = StreamBackend::spawn(reader, stream);
        let channel = Channel::attach_production(config, Arc::clone(&backend) as _);
        *current_bridge.lock() = Some(channel.bridge());

        backend.wait_until_closed();
        *current_bridge.lock() = None;
        channel.detach();
        info!("host disconnected");
    }
}

fn bind(path: &std::path::Path) -> Result<UnixListener> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| Error::Attach(format!("socket dir create failed: {e}")))?;
    }
    // A previous run may have left its socket behind.
    let _ = std::fs::remove_file(path);
    UnixListener::bind(path)
        .map_err(|e| Error::Attach(format!("bind {} failed: {e}", path.display())))
}

fn control_accept_loop(listener: UnixListener, bridge: Arc<Mutex<Option<Arc<BridgeRing>>>>) {
    loop {
        match listener.accept() {
            Ok((stream, _)) => {
                let bridge = Arc::clone(&bridge);
                std::thread::spawn(move || {
                    if let Err(e) = serve_control(stream, &bridge) {
                        debug!(error = %e, "control connection ended");
                    }
                });
            }
            Err(e) => warn!(error = %e, "control accept failed"),
        }
    }
}

/// Serve one control connection: an exclusive open of the endpoint for the
/// connection's lifetime, then request/response frames for the four
/// control operations.
fn serve_control(
    mut stream: UnixStream,
    bridge: &Mutex<Option<Arc<BridgeRing>>>,
) -> std::io::Result<()> {
    let Some(bridge) = bridge.lock().clone() else {
        return send_control_error(&mut stream, "no channel attached");
    };
    let mut handle = match ControlFile::new(bridge).open() {
        Ok(handle) => handle,
        Err(e) => return send_control_error(&mut stream, &e.to_string()),
    };
    debug!("control consumer connected");

    loop {
        let mut header = [0u8; 5];
        match stream.read_exact(&mut header) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e),
        }
        let opcode = header[0];
        let len = u32::from_le_bytes(header[1..5].try_into().expect("4-byte slice")) as usize;
        if len > MAX_CONTROL_LEN {
            send_control_error(&mut stream, "request too large")?;
            continue;
        }
        // Write-style requests carry a body of `len` bytes; read-style
        // requests use `len` as the requested length.
        let mut body = Vec::new();
        if matches!(opcode, OP_WRITE | OP_SET_MSG) {
            body = vec![0u8; len];
            stream.read_exact(&mut body)?;
        }

        match opcode {
            OP_WRITE => match handle.write(&body) {
                Ok(_) => send_control_ok(&mut stream, &[])?,
                Err(e) => send_control_error(&mut stream, &e.to_string())?,
            },
            OP_READ => {
                let mut buf = vec![0u8; len];
                let n = handle.read(&mut buf);
                send_control_ok(&mut stream, &buf[..n])?;
            }
            OP_SET_MSG => {
                let mut record = [0u8; hostlink::bridge::BRIDGE_RECORD_LEN];
                let n = body.len().min(record.len());
                record[..n].copy_from_slice(&body[..n]);
                match handle.set_msg(&record) {
                    Ok(_) => send_control_ok(&mut stream, &[])?,
                    Err(e) => send_control_error(&mut stream, &e.to_string())?,
                }
            }
            OP_GET_MSG => {
                let mut record = [0u8; hostlink::bridge::BRIDGE_RECORD_LEN];
                let n = handle.get_msg(&mut record);
                send_control_ok(&mut stream, &record[..n])?;
            }
            other => {
                warn!(opcode = other, "unknown control opcode");
                send_control_error(&mut stream, "unknown opcode")?;
            }
        }
    }
}

fn send_control_ok(stream: &mut UnixStream, payload: &[u8]) -> std::io::Result<()> {
    send_control_frame(stream, STATUS_OK, payload)
}

fn send_control_error(stream: &mut UnixStream, message: &str) -> std::io::Result<()> {
    send_control_frame(stream, STATUS_ERR, message.as_bytes())
}

fn send_control_frame(stream: &mut UnixStream, status: u8, payload: &[u8]) -> std::io::Result<()> {
    stream.write_all(&[status])?;
    stream.write_all(&(payload.len() as u32).to_le_bytes())?;
    stream.write_all(payload)?;
    stream.flush()
}
