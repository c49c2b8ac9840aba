//! Serial line parameters
//!
//! Only the baud rate is selectable. Data bits, parity, stop bits and flow
//! control are fixed at 8N1 with no flow control.

use serialport::{DataBits, FlowControl, Parity, StopBits};

use crate::error::{SessionError, SessionResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BaudRate {
    B9600,
    B19200,
    B38400,
    B57600,
    B115200,
}

impl BaudRate {
    /// Picklist order
    pub const ALL: [BaudRate; 5] = [
        BaudRate::B9600,
        BaudRate::B19200,
        BaudRate::B38400,
        BaudRate::B57600,
        BaudRate::B115200,
    ];

    pub fn as_u32(self) -> u32 {
        match self {
            BaudRate::B9600 => 9600,
            BaudRate::B19200 => 19200,
            BaudRate::B38400 => 38400,
            BaudRate::B57600 => 57600,
            BaudRate::B115200 => 115200,
        }
    }

    /// Map a picklist index to a rate. Anything past the last entry selects 115200.
    pub fn from_index(index: usize) -> Self {
        Self::ALL.get(index).copied().unwrap_or(BaudRate::B115200)
    }
}

impl TryFrom<u32> for BaudRate {
    type Error = SessionError;

    fn try_from(baud: u32) -> SessionResult<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|b| b.as_u32() == baud)
            .ok_or(SessionError::InvalidConfig { baud })
    }
}

impl std::fmt::Display for BaudRate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_u32())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineConfig {
    pub baud_rate: BaudRate,
}

impl LineConfig {
    pub const DATA_BITS: DataBits = DataBits::Eight;
    pub const PARITY: Parity = Parity::None;
    pub const STOP_BITS: StopBits = StopBits::One;
    pub const FLOW_CONTROL: FlowControl = FlowControl::None;

    /// Validate a raw baud rate and build the 8N1 configuration for it.
    pub fn new(baud: u32) -> SessionResult<Self> {
        Ok(Self { baud_rate: BaudRate::try_from(baud)? })
    }

    pub fn baud(&self) -> u32 {
        self.baud_rate.as_u32()
    }

    pub fn data_bits(&self) -> DataBits {
        Self::DATA_BITS
    }

    pub fn parity(&self) -> Parity {
        Self::PARITY
    }

    pub fn stop_bits(&self) -> StopBits {
        Self::STOP_BITS
    }

    pub fn flow_control(&self) -> FlowControl {
        Self::FLOW_CONTROL
    }
}

impl From<BaudRate> for LineConfig {
    fn from(baud_rate: BaudRate) -> Self {
        Self { baud_rate }
    }
}
