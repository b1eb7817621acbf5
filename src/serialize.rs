use nom::{
    IResult,
    bytes::complete::{tag, take},
    number::complete::{le_i32, le_u8, le_u32, le_u64},
};

pub const STREAM_MAGIC: &[u8; 4] = b"ovni";
pub const STREAM_VERSION: u32 = 1;
pub const STREAM_HEADER_SIZE: usize = 8;

pub const EVENT_HEADER_SIZE: usize = 12;
pub const EV_JUMBO: u8 = 0x10;
pub const MAX_INLINE_PAYLOAD: usize = 16;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct EventHeader {
    // top 4 bits: jumbo marker, bottom 4 bits: inline payload size
    pub flags: u8,
    pub model: u8,
    pub category: u8,
    pub value: u8,
    pub clock: u64,
}

impl EventHeader {
    pub fn is_jumbo(&self) -> bool {
        self.flags & EV_JUMBO != 0
    }

    /// Inline payload size. The minimum payload is 2 bytes, so the 4 bits
    /// store `size - 1` and can encode up to 16 bytes.
    pub fn inline_payload_size(&self) -> usize {
        match self.flags & 0x0f {
            0 => 0,
            n => n as usize + 1,
        }
    }

    pub fn mcv(&self) -> String {
        [self.model, self.category, self.value]
            .iter()
            .map(|&c| c as char)
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Inline { len: u8, data: [u8; MAX_INLINE_PAYLOAD] },
    Jumbo(Vec<u8>),
}

/// An event decoded out of a stream buffer. The inline payload is copied so
/// the event can outlive the borrow of the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub header: EventHeader,
    pub payload: Payload,
}

impl Event {
    pub fn payload(&self) -> &[u8] {
        match &self.payload {
            Payload::Inline { len, data } => &data[..*len as usize],
            Payload::Jumbo(data) => data,
        }
    }

    /// Size of the event in the stream, header included.
    pub fn size(&self) -> usize {
        match &self.payload {
            Payload::Inline { len, .. } => EVENT_HEADER_SIZE + *len as usize,
            Payload::Jumbo(data) => EVENT_HEADER_SIZE + 4 + data.len(),
        }
    }

    pub fn mcv(&self) -> String {
        self.header.mcv()
    }

    /// Reads the `index`-th little-endian i32 of the payload.
    pub fn i32_arg(&self, index: usize) -> Option<i32> {
        let start = index * 4;
        let (_, v) = le_i32::<_, nom::error::Error<&[u8]>>(self.payload().get(start..)?).ok()?;
        Some(v)
    }

    pub fn u32_arg(&self, index: usize) -> Option<u32> {
        self.i32_arg(index).map(|v| v as u32)
    }
}

///
/// Binary parser utilities
///

pub fn parse_stream_header(input: &[u8]) -> IResult<&[u8], u32> {
    let (input, _) = tag(&STREAM_MAGIC[..])(input)?;
    let (input, version) = le_u32(input)?;
    Ok((input, version))
}

fn parse_event_header(input: &[u8]) -> IResult<&[u8], EventHeader> {
    let (input, flags) = le_u8(input)?;
    let (input, model) = le_u8(input)?;
    let (input, category) = le_u8(input)?;
    let (input, value) = le_u8(input)?;
    let (input, clock) = le_u64(input)?;
    Ok((
        input,
        EventHeader {
            flags,
            model,
            category,
            value,
            clock,
        },
    ))
}

pub fn parse_event(input: &[u8]) -> IResult<&[u8], Event> {
    let (input, header) = parse_event_header(input)?;
    if header.is_jumbo() {
        let (input, size) = le_u32(input)?;
        let (input, data) = take(size)(input)?;
        Ok((
            input,
            Event {
                header,
                payload: Payload::Jumbo(data.to_vec()),
            },
        ))
    } else {
        let len = header.inline_payload_size();
        let (input, bytes) = take(len)(input)?;
        let mut data = [0u8; MAX_INLINE_PAYLOAD];
        data[..len].copy_from_slice(bytes);
        Ok((
            input,
            Event {
                header,
                payload: Payload::Inline {
                    len: len as u8,
                    data,
                },
            },
        ))
    }
}

/// Size that the event at the start of `input` declares, without decoding
/// it. Returns `None` when the header itself (or the jumbo size prefix) is
/// truncated.
pub fn event_size(input: &[u8]) -> Option<usize> {
    let (rest, header) = parse_event_header(input).ok()?;
    if header.is_jumbo() {
        let (_, size) = le_u32::<_, nom::error::Error<&[u8]>>(rest).ok()?;
        Some(EVENT_HEADER_SIZE + 4 + size as usize)
    } else {
        Some(EVENT_HEADER_SIZE + header.inline_payload_size())
    }
}

///
/// Encoders, used to build streams in tests and tools
///

pub fn encode_stream_header(buf: &mut Vec<u8>) {
    buf.extend_from_slice(STREAM_MAGIC);
    buf.extend_from_slice(&STREAM_VERSION.to_le_bytes());
}

/// Appends an event with an inline payload.
///
/// # Panics
///
/// Panics if the payload is 1 byte or longer than 16 bytes, as these sizes
/// cannot be encoded in the header.
pub fn encode_event(buf: &mut Vec<u8>, mcv: &[u8; 3], clock: u64, payload: &[u8]) {
    assert!(payload.len() != 1 && payload.len() <= MAX_INLINE_PAYLOAD);
    let flags = if payload.is_empty() {
        0
    } else {
        (payload.len() - 1) as u8
    };
    buf.push(flags);
    buf.extend_from_slice(mcv);
    buf.extend_from_slice(&clock.to_le_bytes());
    buf.extend_from_slice(payload);
}

pub fn encode_jumbo_event(buf: &mut Vec<u8>, mcv: &[u8; 3], clock: u64, data: &[u8]) {
    // The size prefix counts as a 4 byte inline payload
    buf.push(EV_JUMBO | 3);
    buf.extend_from_slice(mcv);
    buf.extend_from_slice(&clock.to_le_bytes());
    buf.extend_from_slice(&(data.len() as u32).to_le_bytes());
    buf.extend_from_slice(data);
}

/// Encodes a list of i32 arguments as an inline payload.
pub fn i32_payload(args: &[i32]) -> Vec<u8> {
    args.iter().flat_map(|a| a.to_le_bytes()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_header() {
        let mut buf = Vec::new();
        encode_stream_header(&mut buf);
        let (rest, version) = parse_stream_header(&buf).unwrap();
        assert_eq!(version, STREAM_VERSION);
        assert!(rest.is_empty());
    }

    #[test]
    fn test_bad_magic() {
        let buf = b"ovnx\x01\x00\x00\x00";
        assert!(parse_stream_header(buf).is_err());
    }

    #[test]
    fn test_event_no_payload() {
        let mut buf = Vec::new();
        encode_event(&mut buf, b"OHp", 1234, &[]);
        assert_eq!(buf.len(), EVENT_HEADER_SIZE);
        assert_eq!(event_size(&buf), Some(EVENT_HEADER_SIZE));
        let (rest, ev) = parse_event(&buf).unwrap();
        assert!(rest.is_empty());
        assert_eq!(ev.mcv(), "OHp");
        assert_eq!(ev.header.clock, 1234);
        assert!(ev.payload().is_empty());
    }

    #[test]
    fn test_event_inline_payload() {
        let mut buf = Vec::new();
        encode_event(&mut buf, b"OHx", 7, &i32_payload(&[3, -1]));
        assert_eq!(event_size(&buf), Some(EVENT_HEADER_SIZE + 8));
        let (_, ev) = parse_event(&buf).unwrap();
        assert_eq!(ev.header.inline_payload_size(), 8);
        assert_eq!(ev.i32_arg(0), Some(3));
        assert_eq!(ev.i32_arg(1), Some(-1));
        assert_eq!(ev.i32_arg(2), None);
        assert_eq!(ev.size(), buf.len());
    }

    #[test]
    fn test_event_full_inline_payload() {
        let mut buf = Vec::new();
        encode_event(&mut buf, b"VTc", 7, &[0xaa; 16]);
        let (_, ev) = parse_event(&buf).unwrap();
        assert_eq!(ev.payload(), &[0xaa; 16]);
        assert_eq!(ev.header.flags, 0x0f);
    }

    #[test]
    fn test_jumbo_event() {
        let mut data = 7u32.to_le_bytes().to_vec();
        data.extend_from_slice(b"compute\0");
        let mut buf = Vec::new();
        encode_jumbo_event(&mut buf, b"VYc", 99, &data);
        assert_eq!(event_size(&buf), Some(EVENT_HEADER_SIZE + 4 + data.len()));
        let (rest, ev) = parse_event(&buf).unwrap();
        assert!(rest.is_empty());
        assert!(ev.header.is_jumbo());
        assert_eq!(ev.payload(), &data[..]);
        assert_eq!(ev.u32_arg(0), Some(7));
        assert_eq!(ev.size(), buf.len());
    }

    #[test]
    fn test_truncated_event() {
        let mut buf = Vec::new();
        encode_event(&mut buf, b"OHx", 7, &i32_payload(&[3]));
        assert!(parse_event(&buf[..buf.len() - 1]).is_err());
        assert_eq!(event_size(&buf[..EVENT_HEADER_SIZE - 1]), None);
    }
}
