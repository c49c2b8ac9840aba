//! Line-oriented operator console for the actuator.
//!
//! Operator input and inbound serial chunks are multiplexed on one thread so
//! the session engine only ever sees calls from a single context.

use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::thread;

use actuator_driver::command_encoder::{Direction, MoveCommand, StepResolution};
use actuator_driver::config_loader::{self, HostSettings};
use actuator_driver::log_record::{format_line, LogRecord};
use actuator_driver::serial_channel::{Inbound, NativeSerialChannel};
use actuator_driver::{ConnectionState, SessionEngine, SessionSink};
use anyhow::{anyhow, Context, Result};
use clap::Parser;
use crossbeam_channel::{select, unbounded};
use gethostname::gethostname;

/// Serial console for the stepper actuator
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Serial device, e.g. /dev/ttyUSB0 or COM3
    #[arg(long)]
    port: Option<String>,
    /// One of 9600, 19200, 38400, 57600, 115200
    #[arg(long)]
    baud: Option<u32>,
    /// Settings YAML (defaults to actuator.yaml next to Cargo.toml)
    #[arg(long)]
    config: Option<PathBuf>,
    /// Also append every TX/RX line to this file
    #[arg(long)]
    transcript: Option<PathBuf>,
    /// Connect at startup with the resolved port and baud rate
    #[arg(long, default_value_t = false)]
    connect: bool,
    #[arg(long)]
    debug: bool,
}

const HELP: &str = "\
Commands:
  connect [port] [baud]               open the serial port
  disconnect                          close it
  send <text>                         write text verbatim
  move <extend|retract> <0-4> <mm>    move; resolution 0 = 1/16 step, 4 = full step
  stop                                stop the motor
  status                              show connection state
  help
  quit";

struct ConsoleSink {
    transcript: Option<File>,
}

impl ConsoleSink {
    fn emit(&mut self, line: &str) {
        println!("{}", line);
        if let Some(f) = self.transcript.as_mut() {
            if let Err(e) = writeln!(f, "{}", line) {
                log::warn!(target: "console", "Transcript write failed, disabling it: {}", e);
                self.transcript = None;
            }
        }
    }
}

impl SessionSink for ConsoleSink {
    fn record(&mut self, record: LogRecord) {
        self.emit(&format_line(&record));
    }

    fn state_changed(&mut self, state: ConnectionState, device: &str) {
        let note = match state {
            ConnectionState::Connected => format!("Connected to {}", device),
            ConnectionState::Disconnected => "Disconnected".to_string(),
        };
        self.emit(&format_line(&LogRecord::sent(note)));
    }
}

#[derive(Debug, PartialEq)]
enum Command {
    Connect { port: Option<String>, baud: Option<u32> },
    Disconnect,
    Send(String),
    Move(MoveCommand),
    Stop,
    Status,
    Help,
    Quit,
}

enum Input {
    Line(String),
    Eof,
    Interrupt,
}

fn parse_direction(word: &str) -> Result<Direction> {
    match word.to_ascii_lowercase().as_str() {
        "extend" | "e" | "0" => Ok(Direction::Extend),
        "retract" | "r" | "1" => Ok(Direction::Retract),
        other => Err(anyhow!("Unknown direction '{}' (use extend or retract)", other)),
    }
}

fn parse_move(args: &[&str]) -> Result<MoveCommand> {
    let [dir, res, mm] = args else {
        return Err(anyhow!("Usage: move <extend|retract> <0-4> <mm>"));
    };
    let direction = parse_direction(dir)?;
    let resolution = res
        .parse::<u8>()
        .ok()
        .and_then(StepResolution::new)
        .ok_or_else(|| anyhow!("Step resolution must be 0-4, got '{}'", res))?;
    let distance_mm = mm.parse::<f64>().with_context(|| format!("Invalid distance '{}'", mm))?;
    if !distance_mm.is_finite() {
        return Err(anyhow!("Distance must be a finite number of millimeters"));
    }
    Ok(MoveCommand::new(direction, resolution, distance_mm))
}

/// Blank lines parse to `None`.
fn parse_command(line: &str) -> Result<Option<Command>> {
    let trimmed = line.trim_end_matches(['\r', '\n']);
    let mut words = trimmed.split_whitespace();
    let Some(verb) = words.next() else {
        return Ok(None);
    };
    let rest: Vec<&str> = words.collect();
    let cmd = match verb {
        "connect" => {
            let baud = match rest.get(1) {
                Some(b) => Some(b.parse::<u32>().with_context(|| format!("Invalid baud rate '{}'", b))?),
                None => None,
            };
            Command::Connect { port: rest.first().map(|p| p.to_string()), baud }
        }
        "disconnect" => Command::Disconnect,
        "send" => {
            // Everything after the first separator goes out untouched
            let payload = trimmed
                .trim_start()
                .strip_prefix("send")
                .map(|p| p.strip_prefix(' ').unwrap_or(p))
                .unwrap_or_default();
            Command::Send(payload.to_string())
        }
        "move" => Command::Move(parse_move(&rest)?),
        "stop" => Command::Stop,
        "status" => Command::Status,
        "help" => Command::Help,
        "quit" | "exit" => Command::Quit,
        other => return Err(anyhow!("Unknown command '{}'; type help", other)),
    };
    Ok(Some(cmd))
}

fn run_command<S: SessionSink>(
    engine: &mut SessionEngine<NativeSerialChannel, S>,
    selection: &mut HostSettings,
    cmd: Command,
) -> Result<()> {
    match cmd {
        Command::Connect { port, baud } => {
            if port.is_some() {
                selection.port = port;
            }
            if baud.is_some() {
                selection.baud_rate = baud;
            }
            let device = selection.port.clone().unwrap_or_default();
            engine.connect(&device, selection.baud_or_default())?;
        }
        Command::Disconnect => engine.disconnect(),
        Command::Send(text) => engine.send_raw(&text)?,
        Command::Move(mv) => engine.send_move(&mv)?,
        Command::Stop => engine.send_stop()?,
        Command::Status => {
            let actions = engine.available_actions();
            match (engine.device(), engine.line_config()) {
                (Some(device), Some(line)) => println!("{:?}: {} @{} 8N1", engine.state(), device, line.baud()),
                _ => println!(
                    "{:?} (selected port: {}, baud: {})",
                    engine.state(),
                    selection.port.as_deref().unwrap_or("none"),
                    selection.baud_or_default()
                ),
            }
            println!(
                "connect: {}  disconnect: {}  send/move/stop: {}",
                actions.connect, actions.disconnect, actions.send
            );
        }
        Command::Help => println!("{}", HELP),
        Command::Quit => {}
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    let filter = if args.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter)).init();

    let hostname = gethostname().to_string_lossy().to_string();
    let config_path = args.config.clone().unwrap_or_else(config_loader::default_config_path);
    let from_config = config_loader::resolve_settings(&config_path, &hostname)?;
    let mut selection = HostSettings {
        port: args.port.clone(),
        baud_rate: args.baud,
        transcript: args.transcript.clone(),
    }
    .over(from_config);

    let transcript = match selection.transcript.as_ref() {
        Some(path) => Some(
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open transcript {:?}", path))?,
        ),
        None => None,
    };

    let (inbound_tx, inbound_rx) = unbounded::<Inbound>();
    let (input_tx, input_rx) = unbounded::<Input>();

    {
        let tx = input_tx.clone();
        ctrlc::set_handler(move || {
            let _ = tx.send(Input::Interrupt);
        })
        .context("Failed to install Ctrl-C handler")?;
    }

    thread::spawn(move || {
        for line in io::stdin().lock().lines() {
            match line {
                Ok(line) => {
                    if input_tx.send(Input::Line(line)).is_err() {
                        return;
                    }
                }
                Err(e) => {
                    log::warn!(target: "console", "stdin read failed: {}", e);
                    break;
                }
            }
        }
        let _ = input_tx.send(Input::Eof);
    });

    let mut engine = SessionEngine::new(NativeSerialChannel::new(inbound_tx), ConsoleSink { transcript });

    println!("{}", HELP);
    if args.connect {
        if let Err(e) = run_command(&mut engine, &mut selection, Command::Connect { port: None, baud: None }) {
            eprintln!("Error: {}", e);
        }
    }

    loop {
        select! {
            recv(input_rx) -> msg => match msg {
                Ok(Input::Line(line)) => match parse_command(&line) {
                    Ok(Some(Command::Quit)) => break,
                    Ok(Some(cmd)) => {
                        if let Err(e) = run_command(&mut engine, &mut selection, cmd) {
                            eprintln!("Error: {}", e);
                        }
                    }
                    Ok(None) => {}
                    Err(e) => eprintln!("Error: {}", e),
                },
                Ok(Input::Eof) | Ok(Input::Interrupt) | Err(_) => break,
            },
            recv(inbound_rx) -> msg => match msg {
                Ok(Inbound::Data { bytes, received_at }) => engine.on_data_arrived(&bytes, received_at),
                Ok(Inbound::Closed(cause)) => {
                    eprintln!("Error: serial read stopped ({}); disconnect and reconnect", cause);
                }
                Err(_) => break,
            },
        }
    }

    engine.disconnect();
    io::stdout().flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_move() {
        let cmd = parse_command("move retract 4 1").unwrap();
        assert_eq!(
            cmd,
            Some(Command::Move(MoveCommand::new(Direction::Retract, StepResolution::FULL, 1.0)))
        );
        assert!(parse_command("move extend 5 1").is_err());
        assert!(parse_command("move sideways 0 1").is_err());
        assert!(parse_command("move extend 0 inf").is_err());
        assert!(parse_command("move extend 0").is_err());
    }

    #[test]
    fn test_send_keeps_payload_spacing() {
        assert_eq!(parse_command("send  a  b").unwrap(), Some(Command::Send(" a  b".to_string())));
        assert_eq!(parse_command("send").unwrap(), Some(Command::Send(String::new())));
    }

    #[test]
    fn test_parse_connect_and_blank() {
        assert_eq!(
            parse_command("connect COM3 57600").unwrap(),
            Some(Command::Connect { port: Some("COM3".to_string()), baud: Some(57600) })
        );
        assert_eq!(parse_command("connect").unwrap(), Some(Command::Connect { port: None, baud: None }));
        assert!(parse_command("connect COM3 fast").is_err());
        assert_eq!(parse_command("   ").unwrap(), None);
        assert!(parse_command("jog").is_err());
    }
}
