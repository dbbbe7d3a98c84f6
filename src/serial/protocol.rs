//! Firmata wire format: the subset needed to detect a board and stream analog
//! samples. Multi-byte values travel as two 7-bit data bytes, LSB first.

pub const ANALOG_MESSAGE: u8 = 0xE0;
pub const DIGITAL_MESSAGE: u8 = 0x90;
pub const REPORT_ANALOG: u8 = 0xC0;
pub const START_SYSEX: u8 = 0xF0;
pub const END_SYSEX: u8 = 0xF7;
pub const REPORT_VERSION: u8 = 0xF9;

pub const REPORT_FIRMWARE: u8 = 0x79;
pub const SAMPLING_INTERVAL: u8 = 0x7A;

const MAX_SYSEX_LEN: usize = 1024;

/// A complete message decoded from the board
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FirmataMessage {
    Version { major: u8, minor: u8 },
    Analog { pin: u8, value: u16 },
    Digital { port: u8, mask: u16 },
    Sysex { command: u8, data: Vec<u8> },
}

impl FirmataMessage {
    /// Firmware name carried by a REPORT_FIRMWARE sysex reply
    pub fn firmware_name(&self) -> Option<String> {
        match self {
            FirmataMessage::Sysex { command: REPORT_FIRMWARE, data } if data.len() >= 2 => {
                let chars: Vec<u16> = data[2..]
                    .chunks(2)
                    .map(|pair| join7(pair[0], pair.get(1).copied().unwrap_or(0)))
                    .collect();
                Some(String::from_utf16_lossy(&chars))
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pending {
    Analog(u8),
    Digital(u8),
    Version,
}

/// Incremental decoder. Bytes may arrive split at arbitrary boundaries.
#[derive(Debug, Default)]
pub struct FirmataParser {
    pending: Option<Pending>,
    data: Vec<u8>,
    in_sysex: bool,
}

impl FirmataParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, bytes: &[u8]) -> Vec<FirmataMessage> {
        bytes.iter().filter_map(|b| self.push(*b)).collect()
    }

    pub fn push(&mut self, byte: u8) -> Option<FirmataMessage> {
        if self.in_sysex {
            return self.push_sysex(byte);
        }

        if byte & 0x80 != 0 {
            self.data.clear();
            self.pending = match byte {
                START_SYSEX => {
                    self.in_sysex = true;
                    None
                }
                REPORT_VERSION => Some(Pending::Version),
                b if b & 0xF0 == ANALOG_MESSAGE => Some(Pending::Analog(b & 0x0F)),
                b if b & 0xF0 == DIGITAL_MESSAGE => Some(Pending::Digital(b & 0x0F)),
                _ => None,
            };
            return None;
        }

        let pending = self.pending?;
        self.data.push(byte);
        if self.data.len() < 2 {
            return None;
        }
        let (first, second) = (self.data[0], self.data[1]);
        self.data.clear();
        // Analog and digital messages stay armed for running status; the version
        // report is one-shot.
        match pending {
            Pending::Analog(pin) => Some(FirmataMessage::Analog {
                pin,
                value: join7(first, second),
            }),
            Pending::Digital(port) => Some(FirmataMessage::Digital {
                port,
                mask: join7(first, second),
            }),
            Pending::Version => {
                self.pending = None;
                Some(FirmataMessage::Version {
                    major: first,
                    minor: second,
                })
            }
        }
    }

    fn push_sysex(&mut self, byte: u8) -> Option<FirmataMessage> {
        if byte == END_SYSEX {
            self.in_sysex = false;
            let mut data = std::mem::take(&mut self.data);
            if data.is_empty() {
                return None;
            }
            let command = data.remove(0);
            return Some(FirmataMessage::Sysex { command, data });
        }
        if byte & 0x80 != 0 {
            // A command byte inside a sysex means we lost the terminator.
            self.in_sysex = false;
            self.data.clear();
            return self.push(byte);
        }
        if self.data.len() < MAX_SYSEX_LEN {
            self.data.push(byte);
        }
        None
    }
}

fn join7(lsb: u8, msb: u8) -> u16 {
    (lsb as u16 & 0x7F) | ((msb as u16 & 0x7F) << 7)
}

fn split7(value: u16) -> [u8; 2] {
    [(value & 0x7F) as u8, ((value >> 7) & 0x7F) as u8]
}

pub fn request_version() -> [u8; 1] {
    [REPORT_VERSION]
}

pub fn request_firmware() -> [u8; 3] {
    [START_SYSEX, REPORT_FIRMWARE, END_SYSEX]
}

/// Enable or disable continuous reporting of analog pin `pin`
pub fn report_analog(pin: u8, enable: bool) -> [u8; 2] {
    [REPORT_ANALOG | (pin & 0x0F), enable as u8]
}

pub fn sampling_interval(interval_ms: u16) -> [u8; 5] {
    let [lsb, msb] = split7(interval_ms);
    [START_SYSEX, SAMPLING_INTERVAL, lsb, msb, END_SYSEX]
}
