//! ISO 7816-4 short command/response encoding.

use std::fmt;

use crate::TokenError;

/// Bytes in the mandatory command header `CLA INS P1 P2`.
pub const HEADER_BYTES: usize = 4;
/// Largest body a short command can carry.
pub const MAX_SHORT_DATA: usize = 255;

/// Two-byte status trailer of a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StatusWord(pub u16);

impl StatusWord {
    pub const SUCCESS: StatusWord = StatusWord(0x9000);
    pub const WRONG_LENGTH: StatusWord = StatusWord(0x6700);
    pub const CONDITIONS_NOT_SATISFIED: StatusWord = StatusWord(0x6985);
    pub const WRONG_DATA: StatusWord = StatusWord(0x6A80);
    pub const INS_NOT_SUPPORTED: StatusWord = StatusWord(0x6D00);
    pub const CLA_NOT_SUPPORTED: StatusWord = StatusWord(0x6E00);
    pub const UNKNOWN: StatusWord = StatusWord(0x6F00);

    pub fn from_bytes(sw1: u8, sw2: u8) -> Self {
        Self(u16::from_be_bytes([sw1, sw2]))
    }

    pub fn to_bytes(self) -> [u8; 2] {
        self.0.to_be_bytes()
    }

    pub fn is_success(self) -> bool {
        self == Self::SUCCESS
    }
}

impl From<&TokenError> for StatusWord {
    fn from(err: &TokenError) -> Self {
        match err {
            TokenError::UnsupportedClass { .. } => StatusWord::CLA_NOT_SUPPORTED,
            TokenError::UnsupportedInstruction { .. } => StatusWord::INS_NOT_SUPPORTED,
            TokenError::WrongLength { .. }
            | TokenError::MalformedCommand(_)
            | TokenError::MalformedResponse(_) => StatusWord::WRONG_LENGTH,
            TokenError::PreconditionNotMet => StatusWord::CONDITIONS_NOT_SATISFIED,
            TokenError::ProvisioningDataTooShort { .. } => StatusWord::WRONG_DATA,
            TokenError::EntropySourceUnavailable | TokenError::Config(_) => StatusWord::UNKNOWN,
        }
    }
}

impl fmt::Display for StatusWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04X}", self.0)
    }
}

/// Short command APDU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandApdu {
    pub cla: u8,
    pub ins: u8,
    pub p1: u8,
    pub p2: u8,
    pub data: Vec<u8>,
    /// Expected response length; `Some(256)` encodes as `Le = 00`.
    pub le: Option<u16>,
}

impl CommandApdu {
    pub fn new(cla: u8, ins: u8, p1: u8, p2: u8, data: impl Into<Vec<u8>>) -> Self {
        Self {
            cla,
            ins,
            p1,
            p2,
            data: data.into(),
            le: None,
        }
    }

    pub fn with_le(mut self, le: u16) -> Self {
        self.le = Some(le);
        self
    }

    /// Parse a short command (cases 1 to 4).
    pub fn parse(bytes: &[u8]) -> Result<Self, TokenError> {
        if bytes.len() < HEADER_BYTES {
            return Err(TokenError::MalformedCommand("command header truncated"));
        }
        let (header, body) = bytes.split_at(HEADER_BYTES);
        let (data, le) = match body {
            [] => (Vec::new(), None),
            [le] => (Vec::new(), Some(decode_le(*le))),
            [lc, rest @ ..] => {
                let lc = *lc as usize;
                if lc == 0 {
                    return Err(TokenError::MalformedCommand(
                        "extended length not supported",
                    ));
                }
                if rest.len() == lc {
                    (rest.to_vec(), None)
                } else if rest.len() == lc + 1 {
                    (rest[..lc].to_vec(), Some(decode_le(rest[lc])))
                } else {
                    return Err(TokenError::MalformedCommand("Lc does not match body"));
                }
            }
        };
        Ok(Self {
            cla: header[0],
            ins: header[1],
            p1: header[2],
            p2: header[3],
            data,
            le,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, TokenError> {
        if self.data.len() > MAX_SHORT_DATA {
            return Err(TokenError::MalformedCommand("data exceeds short APDU"));
        }
        let mut out = Vec::with_capacity(HEADER_BYTES + 2 + self.data.len());
        out.extend_from_slice(&[self.cla, self.ins, self.p1, self.p2]);
        if !self.data.is_empty() {
            out.push(self.data.len() as u8);
            out.extend_from_slice(&self.data);
        }
        if let Some(le) = self.le {
            if le == 0 || le > 256 {
                return Err(TokenError::MalformedCommand("Le out of range"));
            }
            out.push(if le == 256 { 0 } else { le as u8 });
        }
        Ok(out)
    }
}

fn decode_le(byte: u8) -> u16 {
    if byte == 0 {
        256
    } else {
        u16::from(byte)
    }
}

/// Response APDU: body followed by the status word.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseApdu {
    pub data: Vec<u8>,
    pub status: StatusWord,
}

impl ResponseApdu {
    pub fn success(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            status: StatusWord::SUCCESS,
        }
    }

    pub fn error(status: StatusWord) -> Self {
        Self {
            data: Vec::new(),
            status,
        }
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, TokenError> {
        if bytes.len() < 2 {
            return Err(TokenError::MalformedResponse("shorter than status word"));
        }
        let (data, trailer) = bytes.split_at(bytes.len() - 2);
        Ok(Self {
            data: data.to_vec(),
            status: StatusWord::from_bytes(trailer[0], trailer[1]),
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.data.len() + 2);
        out.extend_from_slice(&self.data);
        out.extend_from_slice(&self.status.to_bytes());
        out
    }
}

impl From<&TokenError> for ResponseApdu {
    fn from(err: &TokenError) -> Self {
        ResponseApdu::error(StatusWord::from(err))
    }
}
