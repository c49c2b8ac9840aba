//! Serial session engine
//!
//! Owns the connection state machine and is the only authority on which
//! operator actions are valid. Front ends query `available_actions()` to
//! enable their controls and call the actions below; every outcome comes back
//! either as a `SessionError` or through the `SessionSink`.
//!
//! All actions, including `on_data_available`, must come from one control
//! context; the engine does no locking or threading of its own.

use chrono::{DateTime, Local};
use log::{debug, info, warn};

use crate::command_encoder::{self, MoveCommand, WireFrame};
use crate::error::{SessionError, SessionResult};
use crate::line_config::LineConfig;
use crate::log_record::LogRecord;
use crate::serial_channel::SerialChannel;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
}

/// Receives everything the engine reports to the operator.
pub trait SessionSink {
    fn record(&mut self, record: LogRecord);

    /// `device` is the port that was opened or closed.
    fn state_changed(&mut self, state: ConnectionState, device: &str);
}

/// Which operator controls should be enabled right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AvailableActions {
    pub connect: bool,
    pub disconnect: bool,
    /// Covers raw send, move and stop
    pub send: bool,
}

struct Link<H> {
    device: String,
    config: LineConfig,
    handle: H,
}

pub struct SessionEngine<C: SerialChannel, S: SessionSink> {
    channel: C,
    sink: S,
    // Some while Connected; the state is derived from this and nothing else
    link: Option<Link<C::Handle>>,
}

impl<C: SerialChannel, S: SessionSink> SessionEngine<C, S> {
    pub fn new(channel: C, sink: S) -> Self {
        Self { channel, sink, link: None }
    }

    pub fn state(&self) -> ConnectionState {
        if self.link.is_some() {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_some()
    }

    pub fn device(&self) -> Option<&str> {
        self.link.as_ref().map(|l| l.device.as_str())
    }

    pub fn line_config(&self) -> Option<LineConfig> {
        self.link.as_ref().map(|l| l.config)
    }

    pub fn available_actions(&self) -> AvailableActions {
        let connected = self.is_connected();
        AvailableActions {
            connect: !connected,
            disconnect: connected,
            send: connected,
        }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    pub fn connect(&mut self, device: &str, baud: u32) -> SessionResult<()> {
        if let Some(link) = &self.link {
            return Err(SessionError::AlreadyConnected { device: link.device.clone() });
        }
        let device = device.trim();
        if device.is_empty() {
            return Err(SessionError::NoDeviceSelected);
        }
        let config = LineConfig::new(baud).map_err(|e| {
            warn!(target: "session", "Rejected line config for {}: {}", device, e);
            e
        })?;

        let handle = self.channel.open(device, &config).map_err(|e| {
            warn!(target: "session", "Open {} failed: {}", device, e);
            SessionError::Open { device: device.to_string(), cause: e.to_string() }
        })?;

        info!(target: "session", "Connected to {} @{}", device, config.baud());
        self.link = Some(Link { device: device.to_string(), config, handle });
        self.sink.state_changed(ConnectionState::Connected, device);
        Ok(())
    }

    /// Close the port if one is open. Calling it while Disconnected does nothing.
    pub fn disconnect(&mut self) {
        let Some(link) = self.link.take() else {
            debug!(target: "session", "disconnect: not connected");
            return;
        };
        self.channel.close(link.handle);
        info!(target: "session", "Disconnected from {}", link.device);
        self.sink.state_changed(ConnectionState::Disconnected, &link.device);
    }

    pub fn send_raw(&mut self, text: &str) -> SessionResult<()> {
        self.require_connected()?;
        let frame = command_encoder::encode_raw(text)?;
        self.transmit(frame)
    }

    pub fn send_move(&mut self, cmd: &MoveCommand) -> SessionResult<()> {
        self.require_connected()?;
        let frame = command_encoder::encode_move(cmd).map_err(|e| {
            warn!(target: "session", "Rejected move: {}", e);
            e
        })?;
        debug!(
            target: "session",
            "move {:?} res={} distance={}mm -> {}",
            cmd.direction,
            cmd.resolution.index(),
            cmd.distance_mm,
            frame
        );
        self.transmit(frame)
    }

    pub fn send_stop(&mut self) -> SessionResult<()> {
        self.require_connected()?;
        self.transmit(command_encoder::encode_stop())
    }

    /// Log bytes that arrived from the device, one character per byte.
    ///
    /// Chunks carry no framing; each call becomes exactly one Received record.
    pub fn on_data_available(&mut self, bytes: &[u8]) {
        self.on_data_arrived(bytes, Local::now());
    }

    /// Same as `on_data_available`, stamping the record with the time the
    /// reader pulled the bytes off the port rather than the time they are handled.
    pub fn on_data_arrived(&mut self, bytes: &[u8], received_at: DateTime<Local>) {
        if bytes.is_empty() {
            return;
        }
        self.sink.record(LogRecord::received_at(decode_inbound(bytes), received_at));
    }

    fn require_connected(&self) -> SessionResult<()> {
        if self.link.is_none() {
            return Err(SessionError::NotConnected);
        }
        Ok(())
    }

    fn transmit(&mut self, frame: WireFrame) -> SessionResult<()> {
        let link = self.link.as_mut().ok_or(SessionError::NotConnected)?;
        let written = self
            .channel
            .write(&mut link.handle, frame.as_bytes())
            .map_err(|e| {
                warn!(target: "session", "{}: write failed: {}", link.device, e);
                SessionError::Write { cause: e.to_string() }
            })?;
        if written < frame.len() {
            let err = SessionError::Write {
                cause: format!("short write: {} of {} bytes accepted", written, frame.len()),
            };
            warn!(target: "session", "{}: {}", link.device, err);
            return Err(err);
        }
        self.sink.record(LogRecord::sent(frame.as_text()));
        Ok(())
    }
}

impl<C: SerialChannel, S: SessionSink> Drop for SessionEngine<C, S> {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Latin-1 decode: every byte maps to the code point of the same value, so it
/// never fails and never drops a byte.
pub fn decode_inbound(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| char::from(b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command_encoder::{Direction, StepResolution};
    use crate::error::ChannelError;
    use crate::log_record::RecordDirection;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Default)]
    struct MockState {
        opened: Vec<(String, u32)>,
        writes: Vec<Vec<u8>>,
        closed: Vec<u32>,
        fail_open: Option<String>,
        fail_write: Option<String>,
        accept_limit: Option<usize>,
        next_handle: u32,
    }

    #[derive(Clone, Default)]
    struct MockChannel(Rc<RefCell<MockState>>);

    impl SerialChannel for MockChannel {
        type Handle = u32;

        fn open(&mut self, device: &str, config: &LineConfig) -> Result<u32, ChannelError> {
            let mut s = self.0.borrow_mut();
            if let Some(cause) = &s.fail_open {
                return Err(ChannelError::new(cause.clone()));
            }
            s.opened.push((device.to_string(), config.baud()));
            s.next_handle += 1;
            Ok(s.next_handle)
        }

        fn write(&mut self, _handle: &mut u32, bytes: &[u8]) -> Result<usize, ChannelError> {
            let mut s = self.0.borrow_mut();
            if let Some(cause) = &s.fail_write {
                return Err(ChannelError::new(cause.clone()));
            }
            let n = s.accept_limit.map_or(bytes.len(), |limit| limit.min(bytes.len()));
            s.writes.push(bytes[..n].to_vec());
            Ok(n)
        }

        fn close(&mut self, handle: u32) {
            self.0.borrow_mut().closed.push(handle);
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        records: Vec<LogRecord>,
        states: Vec<(ConnectionState, String)>,
    }

    impl SessionSink for RecordingSink {
        fn record(&mut self, record: LogRecord) {
            self.records.push(record);
        }

        fn state_changed(&mut self, state: ConnectionState, device: &str) {
            self.states.push((state, device.to_string()));
        }
    }

    fn engine() -> (SessionEngine<MockChannel, RecordingSink>, MockChannel) {
        let channel = MockChannel::default();
        (SessionEngine::new(channel.clone(), RecordingSink::default()), channel)
    }

    fn connected() -> (SessionEngine<MockChannel, RecordingSink>, MockChannel) {
        let (mut engine, channel) = engine();
        engine.connect("/dev/ttyUSB0", 115200).unwrap();
        (engine, channel)
    }

    fn payloads(engine: &SessionEngine<MockChannel, RecordingSink>) -> Vec<(RecordDirection, String)> {
        engine
            .sink()
            .records
            .iter()
            .map(|r| (r.direction, r.payload.clone()))
            .collect()
    }

    #[test]
    fn test_connect_opens_with_selected_baud() {
        let (engine, channel) = connected();
        assert_eq!(engine.state(), ConnectionState::Connected);
        assert_eq!(engine.device(), Some("/dev/ttyUSB0"));
        assert_eq!(engine.line_config().map(|c| c.baud()), Some(115200));
        assert_eq!(channel.0.borrow().opened, vec![("/dev/ttyUSB0".to_string(), 115200)]);
        assert_eq!(
            engine.sink().states,
            vec![(ConnectionState::Connected, "/dev/ttyUSB0".to_string())]
        );
    }

    #[test]
    fn test_invalid_baud_stays_disconnected() {
        for baud in [0, 1200, 14400, 230400] {
            let (mut engine, channel) = engine();
            assert_eq!(
                engine.connect("/dev/ttyUSB0", baud),
                Err(SessionError::InvalidConfig { baud })
            );
            assert_eq!(engine.state(), ConnectionState::Disconnected);
            assert!(channel.0.borrow().opened.is_empty());
        }
    }

    #[test]
    fn test_empty_device_rejected() {
        let (mut engine, channel) = engine();
        assert_eq!(engine.connect("", 9600), Err(SessionError::NoDeviceSelected));
        assert_eq!(engine.connect("   ", 9600), Err(SessionError::NoDeviceSelected));
        assert!(channel.0.borrow().opened.is_empty());
    }

    #[test]
    fn test_failed_open_stays_disconnected() {
        let (mut engine, channel) = engine();
        channel.0.borrow_mut().fail_open = Some("Permission denied".to_string());
        let err = engine.connect("/dev/ttyACM0", 9600).unwrap_err();
        assert_eq!(
            err,
            SessionError::Open {
                device: "/dev/ttyACM0".to_string(),
                cause: "Permission denied".to_string()
            }
        );
        assert_eq!(engine.state(), ConnectionState::Disconnected);
        assert!(engine.sink().states.is_empty());

        channel.0.borrow_mut().fail_open = None;
        engine.connect("/dev/ttyACM0", 9600).unwrap();
        assert!(engine.is_connected());
    }

    #[test]
    fn test_connect_twice_is_rejected() {
        let (mut engine, channel) = connected();
        assert_eq!(
            engine.connect("/dev/ttyUSB1", 9600),
            Err(SessionError::AlreadyConnected { device: "/dev/ttyUSB0".to_string() })
        );
        assert_eq!(engine.device(), Some("/dev/ttyUSB0"));
        assert_eq!(channel.0.borrow().opened.len(), 1);
    }

    #[test]
    fn test_disconnect_twice_closes_once() {
        let (mut engine, channel) = connected();
        engine.disconnect();
        engine.disconnect();
        assert_eq!(engine.state(), ConnectionState::Disconnected);
        assert_eq!(channel.0.borrow().closed, vec![1]);
        assert_eq!(
            engine.sink().states.last(),
            Some(&(ConnectionState::Disconnected, "/dev/ttyUSB0".to_string()))
        );
        assert_eq!(engine.sink().states.len(), 2);
    }

    #[test]
    fn test_disconnect_without_connect_is_noop() {
        let (mut engine, channel) = engine();
        engine.disconnect();
        assert!(channel.0.borrow().closed.is_empty());
        assert!(engine.sink().states.is_empty());
    }

    #[test]
    fn test_drop_while_connected_closes_once() {
        let (engine, channel) = connected();
        drop(engine);
        assert_eq!(channel.0.borrow().closed, vec![1]);
    }

    #[test]
    fn test_drop_after_disconnect_does_not_close_again() {
        let (mut engine, channel) = connected();
        engine.disconnect();
        drop(engine);
        assert_eq!(channel.0.borrow().closed.len(), 1);
    }

    #[test]
    fn test_sends_rejected_while_disconnected() {
        let (mut engine, channel) = engine();
        let cmd = MoveCommand::new(Direction::Extend, StepResolution::FULL, 1.0);
        assert_eq!(engine.send_raw("hello"), Err(SessionError::NotConnected));
        assert_eq!(engine.send_raw(""), Err(SessionError::NotConnected));
        assert_eq!(engine.send_move(&cmd), Err(SessionError::NotConnected));
        assert_eq!(engine.send_stop(), Err(SessionError::NotConnected));
        assert!(channel.0.borrow().writes.is_empty());
        assert!(engine.sink().records.is_empty());
    }

    #[test]
    fn test_sends_write_wire_frames_and_log_them() {
        let (mut engine, channel) = connected();
        engine.send_raw("hello").unwrap();
        engine
            .send_move(&MoveCommand::new(Direction::Extend, StepResolution::SIXTEENTH, 10.0))
            .unwrap();
        engine
            .send_move(&MoveCommand::new(Direction::Retract, StepResolution::FULL, 1.0))
            .unwrap();
        engine.send_stop().unwrap();

        assert_eq!(
            channel.0.borrow().writes,
            vec![b"hello".to_vec(), b"c0032000e".to_vec(), b"c14200e".to_vec(), b"s".to_vec()]
        );
        assert_eq!(
            payloads(&engine),
            vec![
                (RecordDirection::Sent, "hello".to_string()),
                (RecordDirection::Sent, "c0032000e".to_string()),
                (RecordDirection::Sent, "c14200e".to_string()),
                (RecordDirection::Sent, "s".to_string()),
            ]
        );
    }

    #[test]
    fn test_empty_raw_payload_not_written() {
        let (mut engine, channel) = connected();
        assert_eq!(engine.send_raw(""), Err(SessionError::EmptyPayload));
        assert!(channel.0.borrow().writes.is_empty());
        assert!(engine.sink().records.is_empty());
    }

    #[test]
    fn test_write_failure_keeps_connection_and_skips_record() {
        let (mut engine, channel) = connected();
        channel.0.borrow_mut().fail_write = Some("Input/output error".to_string());
        assert_eq!(
            engine.send_stop(),
            Err(SessionError::Write { cause: "Input/output error".to_string() })
        );
        assert!(engine.is_connected());
        assert!(engine.sink().records.is_empty());

        channel.0.borrow_mut().fail_write = None;
        engine.send_stop().unwrap();
        assert_eq!(payloads(&engine), vec![(RecordDirection::Sent, "s".to_string())]);
    }

    #[test]
    fn test_short_write_is_a_failure() {
        let (mut engine, channel) = connected();
        channel.0.borrow_mut().accept_limit = Some(3);
        let err = engine.send_raw("abcdef").unwrap_err();
        assert!(matches!(err, SessionError::Write { .. }), "{:?}", err);
        assert!(err.to_string().contains("3 of 6"));
        assert!(engine.is_connected());
        assert!(engine.sink().records.is_empty());
    }

    #[test]
    fn test_inbound_logged_in_order_with_sends() {
        let (mut engine, _channel) = connected();
        engine.send_raw("?").unwrap();
        engine.on_data_available(b"pos");
        engine.on_data_available(b"=12\r\n");
        engine.send_stop().unwrap();
        engine.on_data_available(b"ok");

        assert_eq!(
            payloads(&engine),
            vec![
                (RecordDirection::Sent, "?".to_string()),
                (RecordDirection::Received, "pos".to_string()),
                (RecordDirection::Received, "=12\r\n".to_string()),
                (RecordDirection::Sent, "s".to_string()),
                (RecordDirection::Received, "ok".to_string()),
            ]
        );
        let stamps: Vec<_> = engine.sink().records.iter().map(|r| r.timestamp).collect();
        assert!(stamps.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_unrepresentable_move_not_written() {
        let (mut engine, channel) = connected();
        for distance_mm in [f64::NAN, f64::INFINITY, 1e16] {
            let cmd = MoveCommand::new(Direction::Extend, StepResolution::SIXTEENTH, distance_mm);
            assert!(matches!(engine.send_move(&cmd), Err(SessionError::InvalidDistance { .. })));
        }
        assert!(engine.is_connected());
        assert!(channel.0.borrow().writes.is_empty());
        assert!(engine.sink().records.is_empty());
    }

    #[test]
    fn test_inbound_record_keeps_arrival_time() {
        let (mut engine, _channel) = connected();
        let arrived = Local::now() - chrono::Duration::milliseconds(750);
        engine.on_data_arrived(b"pos=3", arrived);
        engine.on_data_arrived(b"", arrived);
        let records = &engine.sink().records;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].timestamp, arrived);
        assert_eq!(records[0].direction, RecordDirection::Received);
    }

    #[test]
    fn test_same_inbound_bytes_give_identical_payloads() {
        let (mut engine, _channel) = connected();
        let bytes = [b'o', b'k', 0xE9, 0xFF, b'\n'];
        engine.on_data_available(&bytes);
        engine.on_data_available(&bytes);
        let records = &engine.sink().records;
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].payload, records[1].payload);
        assert_eq!(records[0].payload, "ok\u{e9}\u{ff}\n");
    }

    #[test]
    fn test_inbound_while_disconnected_still_logged() {
        let (mut engine, _channel) = engine();
        engine.on_data_available(b"late");
        engine.on_data_available(b"");
        assert_eq!(payloads(&engine), vec![(RecordDirection::Received, "late".to_string())]);
    }

    #[test]
    fn test_available_actions_follow_state() {
        let (mut engine, _channel) = engine();
        assert_eq!(
            engine.available_actions(),
            AvailableActions { connect: true, disconnect: false, send: false }
        );
        engine.connect("COM3", 57600).unwrap();
        assert_eq!(
            engine.available_actions(),
            AvailableActions { connect: false, disconnect: true, send: true }
        );
        engine.disconnect();
        assert!(engine.available_actions().connect);
    }

    #[test]
    fn test_decode_inbound_maps_each_byte() {
        let all: Vec<u8> = (0..=255).collect();
        let text = decode_inbound(&all);
        assert_eq!(text.chars().count(), 256);
        assert!(text.chars().zip(0u32..).all(|(c, b)| c as u32 == b));
    }
}
