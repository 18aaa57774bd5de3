//! `Frame` and the basic/advanced wire codecs (§4.A, §4.B, §6).

use crate::fcs;
use crate::ringbuf::RingBuffer;

/// Maximum information-field length honored by [`Frame::new`]; the
/// default `N1` from the spec. Individual links may configure a
/// different `N1` and validate against that instead.
pub const DEFAULT_N1: usize = 64;

pub const FLAG: u8 = fcs::FLAG;
pub const PF: u8 = 0x10;
pub const CR: u8 = 0x02;
pub const EA: u8 = 0x01;

/// Control-field frame types, P/F bit masked off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Sabm,
    Ua,
    Dm,
    Disc,
    Uih,
    Ui,
}

impl FrameType {
    const SABM: u8 = 0x2F;
    const UA: u8 = 0x63;
    const DM: u8 = 0x0F;
    const DISC: u8 = 0x43;
    const UIH: u8 = 0xEF;
    const UI: u8 = 0x03;

    pub fn from_control(control: u8) -> Option<Self> {
        match control & !PF {
            Self::SABM => Some(Self::Sabm),
            Self::UA => Some(Self::Ua),
            Self::DM => Some(Self::Dm),
            Self::DISC => Some(Self::Disc),
            Self::UIH => Some(Self::Uih),
            Self::UI => Some(Self::Ui),
            _ => None,
        }
    }

    pub fn to_control(self, poll_final: bool) -> u8 {
        let base = match self {
            Self::Sabm => Self::SABM,
            Self::Ua => Self::UA,
            Self::Dm => Self::DM,
            Self::Disc => Self::DISC,
            Self::Uih => Self::UIH,
            Self::Ui => Self::UI,
        };
        if poll_final {
            base | PF
        } else {
            base
        }
    }

    /// `true` for frames whose FCS additionally covers the payload.
    pub fn fcs_covers_payload(self) -> bool {
        matches!(self, Self::Ui | Self::Sabm | Self::Ua | Self::Dm | Self::Disc)
    }
}

/// A decoded (or about-to-be-encoded) 07.10 frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub channel: u8,
    /// Raw control byte, P/F bit included.
    pub control: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(channel: u8, control: u8, payload: Vec<u8>) -> Self {
        debug_assert!(channel <= 0x3F);
        Self {
            channel,
            control,
            payload,
        }
    }

    pub fn frame_type(&self) -> Option<FrameType> {
        FrameType::from_control(self.control)
    }

    pub fn poll_final(&self) -> bool {
        self.control & PF != 0
    }

    fn address_byte(&self, command: bool) -> u8 {
        (self.channel << 2) | (if command { CR } else { 0 }) | EA
    }
}

/// Outcome of one decode attempt against a [`RingBuffer`].
#[derive(Debug, PartialEq, Eq)]
pub enum Decoded {
    /// A complete, FCS-valid frame was extracted.
    Frame(Frame),
    /// Not enough bytes buffered yet; try again after the next read.
    NeedMore,
    /// A malformed frame was found and discarded; the ring has been
    /// resynchronized to the next flag. Caller should keep decoding —
    /// another frame may already be buffered.
    Dropped,
}

/// Whether a frame was sent as a command or a response, needed only to
/// set the address byte's C/R bit on encode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Command,
    Response,
}

pub trait FrameCodec {
    /// Attempts to extract one frame from the front of `buf`.
    fn decode(&mut self, buf: &mut RingBuffer) -> Decoded;

    /// Encodes `frame` (sent in the given `role`) onto the end of `out`.
    fn encode(&self, frame: &Frame, role: Role, out: &mut Vec<u8>);
}

fn covered_len(frame_type: FrameType, header_len: usize, payload_len: usize) -> usize {
    if frame_type.fcs_covers_payload() {
        header_len + payload_len
    } else {
        header_len
    }
}

/// Basic (flag-delimited, length-prefixed) mode codec.
#[derive(Debug, Default)]
pub struct BasicCodec;

impl FrameCodec for BasicCodec {
    fn decode(&mut self, buf: &mut RingBuffer) -> Decoded {
        // Step 1+2: find an opening flag, skipping any run of extra flags
        // (empty inter-frame padding). `flag_seen` lets a call that ran out
        // of bytes mid-header resume here without re-scanning for a flag
        // that was already consumed.
        if !buf.flag_seen {
            loop {
                match buf.pop() {
                    Some(FLAG) => {
                        buf.flag_seen = true;
                        break;
                    }
                    Some(_) => continue,
                    None => return Decoded::NeedMore,
                }
            }
        }
        while buf.len() > 0 && buf.peek(0) == FLAG {
            buf.pop();
        }

        if buf.len() < 3 {
            return Decoded::NeedMore;
        }
        let address = buf.peek(0);
        let control = buf.peek(1);
        let length_byte = buf.peek(2);

        if length_byte & EA == 0 {
            // Two-byte length field: unsupported, per spec.md §4.B/§9.
            buf.advance(3);
            buf.flag_seen = false;
            return Decoded::Dropped;
        }
        let len = ((length_byte >> 1) & 0x7F) as usize;

        if buf.len() < 3 + len {
            return Decoded::NeedMore;
        }
        if buf.len() < 3 + len + 2 {
            return Decoded::NeedMore;
        }

        let channel = (address >> 2) & 0x3F;
        let frame_type = match FrameType::from_control(control) {
            Some(ft) => ft,
            None => {
                buf.advance(3 + len + 2);
                buf.flag_seen = false;
                return Decoded::Dropped;
            }
        };

        let header: Vec<u8> = (0..3).map(|i| buf.peek(i)).collect();
        let payload = buf.copy_out(3 + len)[3..].to_vec();
        let received_fcs = buf.peek(3 + len);
        let trailing_flag = buf.peek(3 + len + 1);

        let cover_len = covered_len(frame_type, header.len(), payload.len());
        let mut covered = header.clone();
        if frame_type.fcs_covers_payload() {
            covered.extend_from_slice(&payload);
        }
        debug_assert_eq!(covered.len(), cover_len);

        if trailing_flag != FLAG || !fcs::verify(&covered, received_fcs) {
            buf.advance(3 + len + 2);
            buf.flag_seen = false;
            return Decoded::Dropped;
        }

        buf.advance(3 + len + 2);
        buf.flag_seen = false;
        Decoded::Frame(Frame::new(channel, control, payload))
    }

    fn encode(&self, frame: &Frame, role: Role, out: &mut Vec<u8>) {
        let address = frame.address_byte(role == Role::Command);
        let len = frame.payload.len() as u8;
        let length_byte = (len << 1) | EA;
        let header = [address, frame.control, length_byte];

        let mut covered = header.to_vec();
        let frame_type = frame
            .frame_type()
            .expect("encoding a frame requires a recognized control byte");
        if frame_type.fcs_covers_payload() {
            covered.extend_from_slice(&frame.payload);
        }
        let fcs = fcs::compute(&covered);

        out.push(FLAG);
        out.extend_from_slice(&header);
        out.extend_from_slice(&frame.payload);
        out.push(fcs);
        out.push(FLAG);
    }
}

/// Advanced (byte-stuffed, HDLC-like) mode codec.
#[derive(Debug, Default)]
pub struct AdvancedCodec;

/// Frames at or above this unstuffed length are rejected as over-long,
/// mirroring the ring buffer's own capacity.
const MAX_ADVANCED_FRAME: usize = crate::ringbuf::CAPACITY;

impl FrameCodec for AdvancedCodec {
    fn decode(&mut self, buf: &mut RingBuffer) -> Decoded {
        // Unlike basic mode, an advanced frame's total length is only
        // known once the closing flag shows up, and a heavily-escaped
        // frame can outgrow one ring refill. So the partially-unstuffed
        // bytes and the escape state live in the ring itself
        // (`adv_buf`/`adv_unstuffer`) and survive a `NeedMore` return.
        if !buf.flag_seen {
            loop {
                match buf.pop() {
                    Some(FLAG) => {
                        buf.flag_seen = true;
                        buf.adv_buf.clear();
                        buf.adv_unstuffer = fcs::Unstuffer::new();
                        break;
                    }
                    Some(_) => continue,
                    None => return Decoded::NeedMore,
                }
            }
            while buf.len() > 0 && buf.peek(0) == FLAG {
                buf.pop();
            }
        }

        loop {
            let raw = match buf.pop() {
                Some(b) => b,
                None => return Decoded::NeedMore,
            };
            if raw == FLAG && !buf.adv_unstuffer.esc_pending() {
                break;
            }
            if let Some(b) = buf.adv_unstuffer.feed(raw) {
                buf.adv_buf.push(b);
            }
            if buf.adv_buf.len() >= MAX_ADVANCED_FRAME {
                buf.adv_buf.clear();
                buf.flag_seen = false;
                return Decoded::Dropped;
            }
        }

        let unstuffed = std::mem::take(&mut buf.adv_buf);
        buf.flag_seen = false;

        if unstuffed.len() < 3 {
            return Decoded::Dropped;
        }

        let address = unstuffed[0];
        let control = unstuffed[1];
        let channel = (address >> 2) & 0x3F;
        let frame_type = match FrameType::from_control(control) {
            Some(ft) => ft,
            None => return Decoded::Dropped,
        };

        let fcs_idx = unstuffed.len() - 1;
        let received_fcs = unstuffed[fcs_idx];
        let body = &unstuffed[2..fcs_idx];

        let covered: &[u8] = if frame_type.fcs_covers_payload() {
            &unstuffed[..fcs_idx]
        } else {
            &unstuffed[..2]
        };

        if !fcs::verify(covered, received_fcs) {
            return Decoded::Dropped;
        }

        Decoded::Frame(Frame::new(channel, control, body.to_vec()))
    }

    fn encode(&self, frame: &Frame, role: Role, out: &mut Vec<u8>) {
        let address = frame.address_byte(role == Role::Command);
        let frame_type = frame
            .frame_type()
            .expect("encoding a frame requires a recognized control byte");

        let mut covered = vec![address, frame.control];
        if frame_type.fcs_covers_payload() {
            covered.extend_from_slice(&frame.payload);
        }
        let fcs = fcs::compute(&covered);

        out.push(FLAG);
        fcs::stuff(&[address, frame.control], out);
        fcs::stuff(&frame.payload, out);
        fcs::stuff(&[fcs], out);
        out.push(FLAG);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(buf: &mut RingBuffer, bytes: &[u8]) {
        let n = buf.write(bytes);
        assert_eq!(n, bytes.len());
    }

    /// Scenario 1: basic-mode UIH round-trip on DLCI 3, payload "AT\r".
    #[test]
    fn scenario_basic_uih_round_trip() {
        let frame = Frame::new(3, FrameType::Uih.to_control(false), b"AT\r".to_vec());
        let mut wire = Vec::new();
        BasicCodec.encode(&frame, Role::Command, &mut wire);
        assert_eq!(
            wire,
            vec![0x7E, 0x0F, 0xEF, 0x07, b'A', b'T', b'\r', wire[wire.len() - 2], 0x7E]
        );

        let mut buf = RingBuffer::new();
        feed(&mut buf, &wire);
        match BasicCodec.decode(&mut buf) {
            Decoded::Frame(f) => {
                assert_eq!(f.channel, 3);
                assert_eq!(f.control, 0xEF);
                assert_eq!(f.payload, b"AT\r");
            }
            other => panic!("expected frame, got {other:?}"),
        }
    }

    /// Round-trip invariant for arbitrary payloads up to N1, both modes.
    #[test]
    fn round_trip_arbitrary_payloads_both_modes() {
        for len in [0, 1, 7, 63, 64] {
            let payload: Vec<u8> = (0..len).map(|i| (i * 37 + 5) as u8).collect();
            for (control, name) in [
                (FrameType::Uih.to_control(false), "uih"),
                (FrameType::Ui.to_control(true), "ui"),
            ] {
                let frame = Frame::new(5, control, payload.clone());

                let mut wire = Vec::new();
                BasicCodec.encode(&frame, Role::Command, &mut wire);
                let mut buf = RingBuffer::new();
                feed(&mut buf, &wire);
                match BasicCodec.decode(&mut buf) {
                    Decoded::Frame(f) => assert_eq!(f.payload, payload, "basic/{name}"),
                    other => panic!("basic/{name}: expected frame, got {other:?}"),
                }

                let mut wire = Vec::new();
                AdvancedCodec.encode(&frame, Role::Command, &mut wire);
                let mut buf = RingBuffer::new();
                feed(&mut buf, &wire);
                match AdvancedCodec.decode(&mut buf) {
                    Decoded::Frame(f) => assert_eq!(f.payload, payload, "advanced/{name}"),
                    other => panic!("advanced/{name}: expected frame, got {other:?}"),
                }
            }
        }
    }

    /// Scenario 2: advanced-mode escape of a literal 0x7E payload byte.
    #[test]
    fn scenario_advanced_escape() {
        let frame = Frame::new(1, FrameType::Uih.to_control(false), vec![0x7E]);
        let mut wire = Vec::new();
        AdvancedCodec.encode(&frame, Role::Command, &mut wire);
        // Opening flag, stuffed address, stuffed control, stuffed payload
        // (7D 5E in place of the raw 7E byte), stuffed fcs, closing flag.
        assert!(wire.windows(2).any(|w| w == [0x7D, 0x5E]));

        let mut buf = RingBuffer::new();
        feed(&mut buf, &wire);
        match AdvancedCodec.decode(&mut buf) {
            Decoded::Frame(f) => assert_eq!(f.payload, vec![0x7E]),
            other => panic!("expected frame, got {other:?}"),
        }
    }

    /// Scenario 3: FCS rejection increments nothing by itself but reports
    /// `Dropped`, and the caller's `dropped_count` increments by one.
    #[test]
    fn scenario_fcs_rejection() {
        let frame = Frame::new(3, FrameType::Uih.to_control(false), b"AT\r".to_vec());
        let mut wire = Vec::new();
        BasicCodec.encode(&frame, Role::Command, &mut wire);
        let fcs_index = wire.len() - 2;
        wire[fcs_index] ^= 0x01;

        let mut buf = RingBuffer::new();
        feed(&mut buf, &wire);
        assert_eq!(BasicCodec.decode(&mut buf), Decoded::Dropped);
    }

    #[test]
    fn basic_two_byte_length_is_dropped() {
        let mut buf = RingBuffer::new();
        // address, control, length-byte with EA=0 (two-byte length, unsupported).
        feed(&mut buf, &[0x7E, 0x0F, 0xEF, 0x06, 0x00, 0x00, 0x7E]);
        assert_eq!(BasicCodec.decode(&mut buf), Decoded::Dropped);
    }

    #[test]
    fn advanced_over_long_frame_is_dropped() {
        // Larger than the ring can hold at once, so it has to be trickled
        // in across several decode() calls — exercising the adv_buf/
        // adv_unstuffer scratch that survives a `NeedMore`.
        let mut buf = RingBuffer::new();
        let mut wire = vec![FLAG, 0x0F, 0xEF];
        wire.extend(std::iter::repeat(0x41).take(MAX_ADVANCED_FRAME + 10));
        wire.push(FLAG);

        let mut codec = AdvancedCodec;
        let mut offset = 0;
        let result = loop {
            let n = buf.write(&wire[offset..]);
            offset += n;
            match codec.decode(&mut buf) {
                Decoded::NeedMore => {
                    assert!(offset < wire.len(), "ran out of input without resyncing");
                    continue;
                }
                other => break other,
            }
        };
        assert_eq!(result, Decoded::Dropped);
    }

    #[test]
    fn incomplete_frame_requests_more() {
        let mut buf = RingBuffer::new();
        feed(&mut buf, &[0x7E, 0x0F, 0xEF]);
        assert_eq!(BasicCodec.decode(&mut buf), Decoded::NeedMore);
    }

    #[test]
    fn back_to_back_flags_are_skipped() {
        let frame = Frame::new(3, FrameType::Uih.to_control(false), b"AT\r".to_vec());
        let mut wire = vec![FLAG, FLAG, FLAG];
        BasicCodec.encode(&frame, Role::Command, &mut wire);
        let mut buf = RingBuffer::new();
        feed(&mut buf, &wire);
        assert!(matches!(BasicCodec.decode(&mut buf), Decoded::Frame(_)));
    }
}
