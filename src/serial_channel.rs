//! Serial device access
//!
//! `SerialChannel` is the seam between the session engine and the OS. The
//! native implementation owns the port, and a reader thread per open handle
//! forwards whatever bytes arrive to the `Inbound` channel. The reader never
//! touches the engine; whoever drives the engine drains the channel and
//! calls `SessionEngine::on_data_arrived`.

use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Local};
use crossbeam_channel::Sender;
use log::{debug, info, warn};

use crate::error::ChannelError;
use crate::line_config::LineConfig;

/// Read timeout for the reader thread; also bounds how long close() waits for it.
pub const READ_POLL: Duration = Duration::from_millis(50);
const READ_CHUNK: usize = 256;

/// Notifications produced by the reader side of an open channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Bytes currently buffered by the device, no framing implied.
    /// `received_at` is taken right after the read returned.
    Data { bytes: Vec<u8>, received_at: DateTime<Local> },
    /// Reader stopped on an I/O error; the handle is still open until closed
    Closed(String),
}

pub trait SerialChannel {
    type Handle;

    fn open(&mut self, device: &str, config: &LineConfig) -> Result<Self::Handle, ChannelError>;

    /// Returns the number of bytes accepted by the device.
    fn write(&mut self, handle: &mut Self::Handle, bytes: &[u8]) -> Result<usize, ChannelError>;

    /// Release the device. Taking the handle by value makes a second close impossible.
    fn close(&mut self, handle: Self::Handle);
}

/// `SerialChannel` backed by the `serialport` crate.
pub struct NativeSerialChannel {
    inbound: Sender<Inbound>,
}

pub struct NativeHandle {
    device: String,
    port: Box<dyn serialport::SerialPort>,
    stop: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
}

impl NativeSerialChannel {
    pub fn new(inbound: Sender<Inbound>) -> Self {
        Self { inbound }
    }
}

impl SerialChannel for NativeSerialChannel {
    type Handle = NativeHandle;

    fn open(&mut self, device: &str, config: &LineConfig) -> Result<NativeHandle, ChannelError> {
        info!(target: "serial_channel", "Opening {} @{} 8N1", device, config.baud());
        let port = serialport::new(device, config.baud())
            .data_bits(config.data_bits())
            .parity(config.parity())
            .stop_bits(config.stop_bits())
            .flow_control(config.flow_control())
            .timeout(READ_POLL)
            .open()?;
        let reader_port = port.try_clone()?;

        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let inbound = self.inbound.clone();
        let name = device.to_string();
        let reader = thread::Builder::new()
            .name(format!("serial-rx {}", device))
            .spawn(move || pump_inbound(reader_port, &stop_flag, &inbound, &name))?;

        Ok(NativeHandle {
            device: device.to_string(),
            port,
            stop,
            reader: Some(reader),
        })
    }

    fn write(&mut self, handle: &mut NativeHandle, bytes: &[u8]) -> Result<usize, ChannelError> {
        let written = handle.port.write(bytes)?;
        handle.port.flush()?;
        debug!(target: "serial_channel", "{}: wrote {}/{} bytes", handle.device, written, bytes.len());
        Ok(written)
    }

    fn close(&mut self, mut handle: NativeHandle) {
        handle.stop.store(true, Ordering::SeqCst);
        if let Some(reader) = handle.reader.take() {
            if reader.join().is_err() {
                warn!(target: "serial_channel", "{}: reader thread panicked", handle.device);
            }
        }
        info!(target: "serial_channel", "Closed {}", handle.device);
        // port is released when the handle drops here
    }
}

impl Drop for NativeHandle {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

/// Reader loop: forward every non-empty read until stopped or the receiver goes away.
///
/// Read timeouts are idle ticks used to re-check `stop`. Any other error ends
/// the loop and is reported as `Inbound::Closed`.
pub fn pump_inbound<R: Read>(mut port: R, stop: &AtomicBool, inbound: &Sender<Inbound>, device: &str) {
    let mut chunk = [0u8; READ_CHUNK];
    while !stop.load(Ordering::SeqCst) {
        match port.read(&mut chunk) {
            Ok(0) => continue,
            Ok(n) => {
                let data = Inbound::Data { bytes: chunk[..n].to_vec(), received_at: Local::now() };
                if inbound.send(data).is_err() {
                    debug!(target: "serial_channel", "{}: inbound receiver dropped", device);
                    return;
                }
            }
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted) => {
                continue;
            }
            Err(e) => {
                warn!(target: "serial_channel", "{}: read error: {}", device, e);
                let _ = inbound.send(Inbound::Closed(e.to_string()));
                return;
            }
        }
    }
}
