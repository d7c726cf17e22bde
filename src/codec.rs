//! Binary codec for the gateway wire protocol.
//!
//! Every frame is a 4-byte header, `size: u16` (total frame length,
//! header included) then `message_type: u16`, followed by a fixed-size
//! payload. All integers and floats are little-endian and written field by
//! field, so the wire layout is independent of compiler padding. String
//! fields occupy fixed-width buffers, null-padded, and are truncated at the
//! buffer width on overflow.

use thiserror::Error;

use crate::core::SymbolId;


/// Length of the frame header in bytes.
pub const HEADER_LEN: usize = 4;

/// Wire protocol version carried in a logon request.
pub const PROTOCOL_VERSION: u32 = 8;

pub const USERNAME_LEN: usize = 32;
pub const PASSWORD_LEN: usize = 32;
pub const GENERAL_TEXT_LEN: usize = 64;
pub const RESULT_TEXT_LEN: usize = 96;
pub const SYMBOL_LEN: usize = 16;

const LOGON_REQUEST_LEN: usize = HEADER_LEN + 4 + USERNAME_LEN + PASSWORD_LEN + GENERAL_TEXT_LEN;
const LOGON_RESPONSE_LEN: usize = HEADER_LEN + 4 + RESULT_TEXT_LEN;
const HEARTBEAT_LEN: usize = HEADER_LEN;
const MARKET_DATA_REQUEST_LEN: usize = HEADER_LEN + 4 + 4 + SYMBOL_LEN;
const TRADE_UPDATE_LEN: usize = HEADER_LEN + 4 + 8 + 8 + 8;
const BID_ASK_UPDATE_LEN: usize = HEADER_LEN + 4 + 8 + 8 + 8 + 8 + 8;

/// Largest frame any known message type can produce. A header declaring more
/// than this is corrupt framing, not a big message.
pub const MAX_FRAME_LEN: usize = LOGON_REQUEST_LEN;


/// The closed set of wire opcodes. Anything else is rejected by `decode`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum MessageType {
    LogonRequest,
    LogonResponse,
    Heartbeat,
    MarketDataRequest,
    MarketDataUpdateTrade,
    MarketDataUpdateBidAsk,
}

impl MessageType {
    pub fn opcode(self) -> u16 {
        match self {
            MessageType::LogonRequest => 1,
            MessageType::LogonResponse => 2,
            MessageType::Heartbeat => 3,
            MessageType::MarketDataRequest => 101,
            MessageType::MarketDataUpdateTrade => 107,
            MessageType::MarketDataUpdateBidAsk => 108,
        }
    }

    pub fn from_opcode(opcode: u16) -> Option<MessageType> {
        match opcode {
            1 => Some(MessageType::LogonRequest),
            2 => Some(MessageType::LogonResponse),
            3 => Some(MessageType::Heartbeat),
            101 => Some(MessageType::MarketDataRequest),
            107 => Some(MessageType::MarketDataUpdateTrade),
            108 => Some(MessageType::MarketDataUpdateBidAsk),
            _ => None,
        }
    }

    /// Exact encoded length of a frame of this type, header included.
    pub fn frame_len(self) -> usize {
        match self {
            MessageType::LogonRequest => LOGON_REQUEST_LEN,
            MessageType::LogonResponse => LOGON_RESPONSE_LEN,
            MessageType::Heartbeat => HEARTBEAT_LEN,
            MessageType::MarketDataRequest => MARKET_DATA_REQUEST_LEN,
            MessageType::MarketDataUpdateTrade => TRADE_UPDATE_LEN,
            MessageType::MarketDataUpdateBidAsk => BID_ASK_UPDATE_LEN,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum LogonStatus {
    Failure,
    Success,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SubscriptionAction {
    Subscribe,
    Unsubscribe,
}

#[derive(Clone, PartialEq, Debug)]
pub struct LogonRequest {
    pub protocol_version: u32,
    pub username: String,
    pub password: String,
    pub general_text: String,
}

#[derive(Clone, PartialEq, Debug)]
pub struct LogonResponse {
    pub result: LogonStatus,
    pub result_text: String,
}

#[derive(Clone, PartialEq, Debug)]
pub struct MarketDataRequest {
    pub action: SubscriptionAction,
    pub symbol_id: SymbolId,
    pub symbol: String,
}

#[derive(Clone, PartialEq, Debug)]
pub struct MarketDataUpdateTrade {
    pub symbol_id: SymbolId,
    pub price: f64,
    pub volume: f64,
    pub timestamp: u64,
}

#[derive(Clone, PartialEq, Debug)]
pub struct MarketDataUpdateBidAsk {
    pub symbol_id: SymbolId,
    pub bid_price: f64,
    pub bid_quantity: f64,
    pub ask_price: f64,
    pub ask_quantity: f64,
    pub timestamp: u64,
}

/// One wire message, the payload of exactly one frame.
#[derive(Clone, PartialEq, Debug)]
pub enum Message {
    LogonRequest(LogonRequest),
    LogonResponse(LogonResponse),
    Heartbeat,
    MarketDataRequest(MarketDataRequest),
    MarketDataUpdateTrade(MarketDataUpdateTrade),
    MarketDataUpdateBidAsk(MarketDataUpdateBidAsk),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("truncated header: need {HEADER_LEN} bytes, got {got}")]
    TruncatedHeader { got: usize },
    #[error("size mismatch: header declares {declared} bytes, frame has {actual}")]
    SizeMismatch { declared: usize, actual: usize },
    #[error("unknown message type {opcode}")]
    UnknownType { opcode: u16 },
    #[error("truncated payload for opcode {opcode}: need {need} bytes, got {got}")]
    TruncatedPayload {
        opcode: u16,
        need: usize,
        got: usize,
    },
    #[error("oversized frame for opcode {opcode}: at most {max} bytes, got {got}")]
    Oversized {
        opcode: u16,
        max: usize,
        got: usize,
    },
    #[error("invalid value {value} for field {field}")]
    InvalidField { field: &'static str, value: u32 },
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::LogonRequest(_) => MessageType::LogonRequest,
            Message::LogonResponse(_) => MessageType::LogonResponse,
            Message::Heartbeat => MessageType::Heartbeat,
            Message::MarketDataRequest(_) => MessageType::MarketDataRequest,
            Message::MarketDataUpdateTrade(_) => MessageType::MarketDataUpdateTrade,
            Message::MarketDataUpdateBidAsk(_) => MessageType::MarketDataUpdateBidAsk,
        }
    }

    /// Encode this message into a single complete frame.
    pub fn encode(&self) -> Vec<u8> {
        let mut writer = FrameWriter::new(self.message_type());
        match self {
            Message::LogonRequest(request) => {
                writer.put_u32(request.protocol_version);
                writer.put_str(&request.username, USERNAME_LEN);
                writer.put_str(&request.password, PASSWORD_LEN);
                writer.put_str(&request.general_text, GENERAL_TEXT_LEN);
            }
            Message::LogonResponse(response) => {
                writer.put_u32(match response.result {
                    LogonStatus::Failure => 0,
                    LogonStatus::Success => 1,
                });
                writer.put_str(&response.result_text, RESULT_TEXT_LEN);
            }
            Message::Heartbeat => {}
            Message::MarketDataRequest(request) => {
                writer.put_u32(match request.action {
                    SubscriptionAction::Subscribe => 1,
                    SubscriptionAction::Unsubscribe => 2,
                });
                writer.put_u32(request.symbol_id);
                writer.put_str(&request.symbol, SYMBOL_LEN);
            }
            Message::MarketDataUpdateTrade(update) => {
                writer.put_u32(update.symbol_id);
                writer.put_f64(update.price);
                writer.put_f64(update.volume);
                writer.put_u64(update.timestamp);
            }
            Message::MarketDataUpdateBidAsk(update) => {
                writer.put_u32(update.symbol_id);
                writer.put_f64(update.bid_price);
                writer.put_f64(update.bid_quantity);
                writer.put_f64(update.ask_price);
                writer.put_f64(update.ask_quantity);
                writer.put_u64(update.timestamp);
            }
        }
        writer.finish()
    }

    /// Decode one complete frame. All-or-nothing: no partial result and no
    /// state is touched on failure.
    pub fn decode(frame: &[u8]) -> Result<Message, DecodeError> {
        if frame.len() < HEADER_LEN {
            return Err(DecodeError::TruncatedHeader { got: frame.len() });
        }
        let declared = u16::from_le_bytes([frame[0], frame[1]]) as usize;
        let opcode = u16::from_le_bytes([frame[2], frame[3]]);
        if declared != frame.len() {
            return Err(DecodeError::SizeMismatch {
                declared,
                actual: frame.len(),
            });
        }
        let message_type =
            MessageType::from_opcode(opcode).ok_or(DecodeError::UnknownType { opcode })?;
        let expected = message_type.frame_len();
        if frame.len() < expected {
            return Err(DecodeError::TruncatedPayload {
                opcode,
                need: expected,
                got: frame.len(),
            });
        }
        if frame.len() > expected {
            return Err(DecodeError::Oversized {
                opcode,
                max: expected,
                got: frame.len(),
            });
        }

        let mut reader = FrameReader::new(frame);
        let message = match message_type {
            MessageType::LogonRequest => Message::LogonRequest(LogonRequest {
                protocol_version: reader.u32(),
                username: reader.str(USERNAME_LEN),
                password: reader.str(PASSWORD_LEN),
                general_text: reader.str(GENERAL_TEXT_LEN),
            }),
            MessageType::LogonResponse => Message::LogonResponse(LogonResponse {
                result: match reader.u32() {
                    1 => LogonStatus::Success,
                    _ => LogonStatus::Failure,
                },
                result_text: reader.str(RESULT_TEXT_LEN),
            }),
            MessageType::Heartbeat => Message::Heartbeat,
            MessageType::MarketDataRequest => {
                let action = match reader.u32() {
                    1 => SubscriptionAction::Subscribe,
                    2 => SubscriptionAction::Unsubscribe,
                    value => {
                        return Err(DecodeError::InvalidField {
                            field: "action",
                            value,
                        })
                    }
                };
                Message::MarketDataRequest(MarketDataRequest {
                    action,
                    symbol_id: reader.u32(),
                    symbol: reader.str(SYMBOL_LEN),
                })
            }
            MessageType::MarketDataUpdateTrade => {
                Message::MarketDataUpdateTrade(MarketDataUpdateTrade {
                    symbol_id: reader.u32(),
                    price: reader.f64(),
                    volume: reader.f64(),
                    timestamp: reader.u64(),
                })
            }
            MessageType::MarketDataUpdateBidAsk => {
                Message::MarketDataUpdateBidAsk(MarketDataUpdateBidAsk {
                    symbol_id: reader.u32(),
                    bid_price: reader.f64(),
                    bid_quantity: reader.f64(),
                    ask_price: reader.f64(),
                    ask_quantity: reader.f64(),
                    timestamp: reader.u64(),
                })
            }
        };
        Ok(message)
    }
}

/// Frame length declared by a buffered header, once enough bytes have
/// accumulated to read one. Used by connection read loops to decide how many
/// bytes make up the next frame.
pub fn peek_frame_len(buffer: &[u8]) -> Option<usize> {
    if buffer.len() < HEADER_LEN {
        return None;
    }
    Some(u16::from_le_bytes([buffer[0], buffer[1]]) as usize)
}


struct FrameWriter {
    buffer: Vec<u8>,
    frame_len: usize,
}

impl FrameWriter {
    fn new(message_type: MessageType) -> FrameWriter {
        let frame_len = message_type.frame_len();
        let mut buffer = Vec::with_capacity(frame_len);
        buffer.extend_from_slice(&(frame_len as u16).to_le_bytes());
        buffer.extend_from_slice(&message_type.opcode().to_le_bytes());
        FrameWriter { buffer, frame_len }
    }

    fn put_u32(&mut self, value: u32) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    fn put_u64(&mut self, value: u64) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    fn put_f64(&mut self, value: f64) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    /// Write `value` into a fixed-width null-padded field, truncating at
    /// `width` bytes.
    fn put_str(&mut self, value: &str, width: usize) {
        let bytes = value.as_bytes();
        let used = bytes.len().min(width);
        self.buffer.extend_from_slice(&bytes[..used]);
        self.buffer.resize(self.buffer.len() + (width - used), 0);
    }

    fn finish(self) -> Vec<u8> {
        debug_assert_eq!(self.buffer.len(), self.frame_len);
        self.buffer
    }
}

/// Payload reader over a frame whose length has already been validated
/// against the type's fixed layout, so field reads cannot run out of bytes.
struct FrameReader<'a> {
    frame: &'a [u8],
    position: usize,
}

impl<'a> FrameReader<'a> {
    fn new(frame: &'a [u8]) -> FrameReader<'a> {
        FrameReader {
            frame,
            position: HEADER_LEN,
        }
    }

    fn take<const N: usize>(&mut self) -> [u8; N] {
        let mut bytes = [0u8; N];
        bytes.copy_from_slice(&self.frame[self.position..self.position + N]);
        self.position += N;
        bytes
    }

    fn u32(&mut self) -> u32 {
        u32::from_le_bytes(self.take::<4>())
    }

    fn u64(&mut self) -> u64 {
        u64::from_le_bytes(self.take::<8>())
    }

    fn f64(&mut self) -> f64 {
        f64::from_le_bytes(self.take::<8>())
    }

    /// Read a fixed-width string field up to its first null byte.
    fn str(&mut self, width: usize) -> String {
        let field = &self.frame[self.position..self.position + width];
        self.position += width;
        let end = field.iter().position(|&b| b == 0).unwrap_or(width);
        String::from_utf8_lossy(&field[..end]).into_owned()
    }
}
