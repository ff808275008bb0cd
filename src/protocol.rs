//! Fixture wire protocol
//!
//! Every message on a connection is a frame: one length byte `L` followed by
//! `L` payload bytes. `L == 0` is a stream reset and tells the server to drop
//! everything it has buffered for that connection.
//!
//! Request payloads start with a kind tag:
//!
//! | tag    | body                                                       |
//! |--------|------------------------------------------------------------|
//! | `0x01` | selector: `0x01` system state, `0x02` system info          |
//! | `0x02` | output id, red, green, blue, cold white, warm white, brightness, on |
//!
//! Response payloads start with `0x81` (system state), `0x82` (system info) or
//! `0x83` (command result). Multi-byte fields are little-endian.

use crate::config::OUTPUT_COUNT;
use crate::read_buffer::ReadBuffer;
use crate::write_buffer::WriteBuffer;
use heapless::{String, Vec};

/// Largest payload a frame can carry
pub const MAX_PAYLOAD_SIZE: usize = 254;

/// Scratch size used while encoding; one past the limit so oversize is detectable
const ENCODE_CAPACITY: usize = MAX_PAYLOAD_SIZE + 2;

const REQUEST_READ: u8 = 0x01;
const REQUEST_WRITE_OUTPUT: u8 = 0x02;

const SELECTOR_SYSTEM_STATE: u8 = 0x01;
const SELECTOR_SYSTEM_INFO: u8 = 0x02;

const RESPONSE_SYSTEM_STATE: u8 = 0x81;
const RESPONSE_SYSTEM_INFO: u8 = 0x82;
const RESPONSE_COMMAND_RESULT: u8 = 0x83;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RgbcwColor {
    pub red: u8,
    pub green: u8,
    pub blue: u8,
    pub cold_white: u8,
    pub warm_white: u8,
}

impl RgbcwColor {
    pub const fn new(red: u8, green: u8, blue: u8, cold_white: u8, warm_white: u8) -> Self {
        Self {
            red,
            green,
            blue,
            cold_white,
            warm_white,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OutputId {
    A = 1,
    B = 2,
}

impl OutputId {
    /// Position of this output in the state snapshot
    pub fn index(self) -> usize {
        self as usize - 1
    }
}

impl TryFrom<u8> for OutputId {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(OutputId::A),
            2 => Ok(OutputId::B),
            _ => Err(DecodeError::InvalidValue),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataKind {
    SystemState,
    SystemInfo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOutput {
    pub output_id: OutputId,
    pub color: RgbcwColor,
    pub brightness: u8,
    pub on: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    GetData(DataKind),
    WriteOutput(WriteOutput),
    /// Well-formed frame of a kind this firmware does not serve; carries the kind tag
    Unsupported(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OutputState {
    pub color: RgbcwColor,
    pub brightness: u8,
    pub on: bool,
    /// Measured output current in milliamps
    pub current: u16,
}

impl OutputState {
    /// Take over the requested color, brightness and power state
    pub fn apply(&mut self, write: &WriteOutput) {
        self.color = write.color;
        self.brightness = write.brightness;
        self.on = write.on;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FanState {
    pub rpm: u16,
    pub output_per_thou: u16,
}

/// Temperatures in hundredths of a degree Celsius
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Temperatures {
    pub driver: i16,
    /// Absent when no power supply sensor is fitted
    pub power_supply: Option<i16>,
    pub outputs: [Option<i16>; OUTPUT_COUNT],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SystemState {
    pub outputs: [OutputState; OUTPUT_COUNT],
    pub fan: FanState,
    pub temperatures: Temperatures,
}

impl SystemState {
    pub fn output(&self, id: OutputId) -> &OutputState {
        &self.outputs[id.index()]
    }

    pub fn output_mut(&mut self, id: OutputId) -> &mut OutputState {
        &mut self.outputs[id.index()]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl From<(u32, u32, u32)> for Version {
    fn from((major, minor, patch): (u32, u32, u32)) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SystemInfo {
    pub hardware_id: String<16>,
    pub model: String<32>,
    pub manufacturer: String<32>,
    pub firmware_version: Version,
    pub hardware_version: Version,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandResult {
    Ok,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    SystemState(SystemState),
    SystemInfo(SystemInfo),
    CommandResult(CommandResult),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// Payload had no kind tag
    Empty,
    /// Payload ended inside a field
    Truncated,
    /// Bytes left over after the message body
    TrailingBytes,
    /// A field held a value outside its range
    InvalidValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyError {
    /// Serialized reply does not fit in a single frame
    TooLarge,
    /// Not enough room left in the outbound buffer
    InsufficientSpace,
}

/// Outcome of looking for the next frame in a session's read buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    /// The next frame has not fully arrived yet
    Incomplete,
    /// A zero length byte: the caller should drop all buffered input
    Resync,
    /// The frame payload was consumed but could not be decoded
    Invalid(DecodeError),
    /// A request and the total number of bytes its frame occupied
    Request(Request, usize),
}

/// Take the next complete frame out of `buffer` and decode it.
///
/// Nothing is consumed for `Incomplete` and `Resync`. For `Invalid` the frame
/// bytes are gone but anything after them is left in place; the stream is
/// desynchronized at that point so callers clear the whole buffer.
pub fn try_decode_frame<const N: usize>(buffer: &mut ReadBuffer<N>) -> FrameStatus {
    let Some(length) = buffer.peek() else {
        return FrameStatus::Incomplete;
    };
    let length = length as usize;
    if length == 0 {
        return FrameStatus::Resync;
    }
    if buffer.size() < length + 1 {
        return FrameStatus::Incomplete;
    }

    let mut payload = [0u8; MAX_PAYLOAD_SIZE + 1];
    let payload = &mut payload[..length];
    if !buffer.advance(1) || !buffer.read_into(payload) {
        return FrameStatus::Incomplete;
    }

    match Request::decode(payload) {
        Ok(request) => FrameStatus::Request(request, length + 1),
        Err(error) => FrameStatus::Invalid(error),
    }
}

/// Queue `response` as one frame. Nothing is written on failure.
pub fn encode_reply<const N: usize>(
    buffer: &mut WriteBuffer<N>,
    response: &Response,
) -> Result<usize, ReplyError> {
    let mut payload = Vec::<u8, ENCODE_CAPACITY>::new();
    response.encode(&mut payload)?;
    push_frame(buffer, &payload)
}

/// Build a complete request frame, as a client would send it
pub fn encode_request_frame(request: &Request) -> Result<Vec<u8, ENCODE_CAPACITY>, ReplyError> {
    let mut payload = Vec::<u8, ENCODE_CAPACITY>::new();
    request.encode(&mut payload)?;
    let mut frame = Vec::new();
    frame
        .push(payload.len() as u8)
        .map_err(|_| ReplyError::TooLarge)?;
    frame
        .extend_from_slice(&payload)
        .map_err(|_| ReplyError::TooLarge)?;
    Ok(frame)
}

fn push_frame<const N: usize>(buffer: &mut WriteBuffer<N>, payload: &[u8]) -> Result<usize, ReplyError> {
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(ReplyError::TooLarge);
    }
    if buffer.available_size() < payload.len() + 1 {
        return Err(ReplyError::InsufficientSpace);
    }
    if !buffer.push(payload.len() as u8) || !buffer.push_slice(payload) {
        return Err(ReplyError::InsufficientSpace);
    }
    Ok(payload.len() + 1)
}

impl Request {
    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let mut reader = Reader::new(payload);
        let tag = reader.u8().map_err(|_| DecodeError::Empty)?;
        let request = match tag {
            REQUEST_READ => match reader.u8()? {
                SELECTOR_SYSTEM_STATE => Request::GetData(DataKind::SystemState),
                SELECTOR_SYSTEM_INFO => Request::GetData(DataKind::SystemInfo),
                _ => Request::Unsupported(tag),
            },
            REQUEST_WRITE_OUTPUT => Request::WriteOutput(WriteOutput {
                output_id: OutputId::try_from(reader.u8()?)?,
                color: reader.color()?,
                brightness: reader.u8()?,
                on: reader.bool()?,
            }),
            _ => return Ok(Request::Unsupported(tag)),
        };
        reader.finish()?;
        Ok(request)
    }

    pub fn encode<const C: usize>(&self, out: &mut Vec<u8, C>) -> Result<(), ReplyError> {
        let mut writer = Writer(out);
        match self {
            Request::GetData(kind) => {
                writer.u8(REQUEST_READ)?;
                writer.u8(match kind {
                    DataKind::SystemState => SELECTOR_SYSTEM_STATE,
                    DataKind::SystemInfo => SELECTOR_SYSTEM_INFO,
                })
            }
            Request::WriteOutput(write) => {
                writer.u8(REQUEST_WRITE_OUTPUT)?;
                writer.u8(write.output_id as u8)?;
                writer.color(&write.color)?;
                writer.u8(write.brightness)?;
                writer.u8(write.on as u8)
            }
            Request::Unsupported(tag) => writer.u8(*tag),
        }
    }
}

impl Response {
    pub fn encode<const C: usize>(&self, out: &mut Vec<u8, C>) -> Result<(), ReplyError> {
        let mut writer = Writer(out);
        match self {
            Response::SystemState(state) => {
                writer.u8(RESPONSE_SYSTEM_STATE)?;
                writer.u8(state.outputs.len() as u8)?;
                for output in &state.outputs {
                    writer.color(&output.color)?;
                    writer.u8(output.brightness)?;
                    writer.u8(output.on as u8)?;
                    writer.u16(output.current)?;
                }
                writer.u16(state.fan.rpm)?;
                writer.u16(state.fan.output_per_thou)?;
                writer.i16(state.temperatures.driver)?;
                writer.optional_i16(state.temperatures.power_supply)?;
                for temperature in &state.temperatures.outputs {
                    writer.optional_i16(*temperature)?;
                }
                Ok(())
            }
            Response::SystemInfo(info) => {
                writer.u8(RESPONSE_SYSTEM_INFO)?;
                writer.str(&info.hardware_id)?;
                writer.str(&info.model)?;
                writer.str(&info.manufacturer)?;
                writer.version(&info.firmware_version)?;
                writer.version(&info.hardware_version)
            }
            Response::CommandResult(result) => {
                writer.u8(RESPONSE_COMMAND_RESULT)?;
                writer.u8(match result {
                    CommandResult::Ok => 0,
                    CommandResult::Error => 1,
                })
            }
        }
    }

    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let mut reader = Reader::new(payload);
        let response = match reader.u8().map_err(|_| DecodeError::Empty)? {
            RESPONSE_SYSTEM_STATE => {
                if reader.u8()? as usize != OUTPUT_COUNT {
                    return Err(DecodeError::InvalidValue);
                }
                let mut state = SystemState::default();
                for output in state.outputs.iter_mut() {
                    output.color = reader.color()?;
                    output.brightness = reader.u8()?;
                    output.on = reader.bool()?;
                    output.current = reader.u16()?;
                }
                state.fan.rpm = reader.u16()?;
                state.fan.output_per_thou = reader.u16()?;
                state.temperatures.driver = reader.i16()?;
                state.temperatures.power_supply = reader.optional_i16()?;
                for temperature in state.temperatures.outputs.iter_mut() {
                    *temperature = reader.optional_i16()?;
                }
                Response::SystemState(state)
            }
            RESPONSE_SYSTEM_INFO => Response::SystemInfo(SystemInfo {
                hardware_id: reader.str()?,
                model: reader.str()?,
                manufacturer: reader.str()?,
                firmware_version: reader.version()?,
                hardware_version: reader.version()?,
            }),
            RESPONSE_COMMAND_RESULT => Response::CommandResult(match reader.u8()? {
                0 => CommandResult::Ok,
                1 => CommandResult::Error,
                _ => return Err(DecodeError::InvalidValue),
            }),
            _ => return Err(DecodeError::InvalidValue),
        };
        reader.finish()?;
        Ok(response)
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take<const W: usize>(&mut self) -> Result<[u8; W], DecodeError> {
        let end = self.pos + W;
        let field = self
            .bytes
            .get(self.pos..end)
            .ok_or(DecodeError::Truncated)?;
        self.pos = end;
        let mut out = [0u8; W];
        out.copy_from_slice(field);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take::<1>()?[0])
    }

    fn bool(&mut self) -> Result<bool, DecodeError> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(DecodeError::InvalidValue),
        }
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_le_bytes(self.take()?))
    }

    fn i16(&mut self) -> Result<i16, DecodeError> {
        Ok(i16::from_le_bytes(self.take()?))
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_le_bytes(self.take()?))
    }

    fn optional_i16(&mut self) -> Result<Option<i16>, DecodeError> {
        if self.bool()? {
            Ok(Some(self.i16()?))
        } else {
            Ok(None)
        }
    }

    fn color(&mut self) -> Result<RgbcwColor, DecodeError> {
        let [red, green, blue, cold_white, warm_white] = self.take::<5>()?;
        Ok(RgbcwColor::new(red, green, blue, cold_white, warm_white))
    }

    fn version(&mut self) -> Result<Version, DecodeError> {
        Ok(Version {
            major: self.u32()?,
            minor: self.u32()?,
            patch: self.u32()?,
        })
    }

    fn str<const S: usize>(&mut self) -> Result<String<S>, DecodeError> {
        let length = self.u8()? as usize;
        let end = self.pos + length;
        let raw = self
            .bytes
            .get(self.pos..end)
            .ok_or(DecodeError::Truncated)?;
        self.pos = end;
        let text = core::str::from_utf8(raw).map_err(|_| DecodeError::InvalidValue)?;
        String::try_from(text).map_err(|_| DecodeError::InvalidValue)
    }

    fn finish(&self) -> Result<(), DecodeError> {
        if self.pos == self.bytes.len() {
            Ok(())
        } else {
            Err(DecodeError::TrailingBytes)
        }
    }
}

struct Writer<'a, const C: usize>(&'a mut Vec<u8, C>);

impl<const C: usize> Writer<'_, C> {
    fn bytes(&mut self, bytes: &[u8]) -> Result<(), ReplyError> {
        self.0
            .extend_from_slice(bytes)
            .map_err(|_| ReplyError::TooLarge)
    }

    fn u8(&mut self, value: u8) -> Result<(), ReplyError> {
        self.bytes(&[value])
    }

    fn u16(&mut self, value: u16) -> Result<(), ReplyError> {
        self.bytes(&value.to_le_bytes())
    }

    fn i16(&mut self, value: i16) -> Result<(), ReplyError> {
        self.bytes(&value.to_le_bytes())
    }

    fn optional_i16(&mut self, value: Option<i16>) -> Result<(), ReplyError> {
        match value {
            Some(value) => {
                self.u8(1)?;
                self.i16(value)
            }
            None => self.u8(0),
        }
    }

    fn color(&mut self, color: &RgbcwColor) -> Result<(), ReplyError> {
        self.bytes(&[
            color.red,
            color.green,
            color.blue,
            color.cold_white,
            color.warm_white,
        ])
    }

    fn version(&mut self, version: &Version) -> Result<(), ReplyError> {
        self.bytes(&version.major.to_le_bytes())?;
        self.bytes(&version.minor.to_le_bytes())?;
        self.bytes(&version.patch.to_le_bytes())
    }

    fn str(&mut self, text: &str) -> Result<(), ReplyError> {
        let length = u8::try_from(text.len()).map_err(|_| ReplyError::TooLarge)?;
        self.u8(length)?;
        self.bytes(text.as_bytes())
    }
}
