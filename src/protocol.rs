use crate::types::Intrinsics;

// -- USB identifiers --
pub const VID_MICROSOFT: u16 = 0x045E;
pub const PID_NUI_CAMERA: u16 = 0x02AE;
pub const PID_NUI_MOTOR: u16 = 0x02B0;
pub const CAMERA_INTERFACE: u8 = 0;
pub const MOTOR_INTERFACE: u8 = 0;
pub const DEPTH_ENDPOINT: u8 = 0x82;

// -- Isochronous geometry --
pub const NUM_XFERS: usize = 16;
pub const PKTS_PER_XFER: usize = 16;
pub const DEPTH_PKTBUF: usize = 1920;

// -- Depth image --
pub const DEPTH_WIDTH: usize = 640;
pub const DEPTH_HEIGHT: usize = 480;
pub const DEPTH_BITS: usize = 11;
/// Raw value the sensor reports for "no reading".
pub const DEPTH_NO_READING: u16 = 2047;

// -- Depth packets --
pub const PKT_HEADER_SIZE: usize = 12;
pub const DEPTH_PKTSIZE: usize = 1760;
pub const DEPTH_PKT_PAYLOAD: usize = DEPTH_PKTSIZE - PKT_HEADER_SIZE;
pub const DEPTH_FRAME_BYTES: usize = DEPTH_WIDTH * DEPTH_HEIGHT * DEPTH_BITS / 8;
pub const DEPTH_PKTS_PER_FRAME: usize = DEPTH_FRAME_BYTES.div_ceil(DEPTH_PKT_PAYLOAD);
pub const PKT_MAGIC: [u8; 2] = *b"RB";
pub const DEPTH_FLAG_BASE: u8 = 0x70;
pub const FLAG_SOF: u8 = 0x01;
pub const FLAG_MOF: u8 = 0x02;
pub const FLAG_EOF: u8 = 0x05;

// -- Calibration defaults (zero-plane info of a stock sensor) --
pub const DEFAULT_REF_PIXEL_SIZE: f64 = 0.1042;
pub const DEFAULT_REF_DISTANCE: f64 = 120.0;

/// Disparity-to-depth coefficients: depth_m = 1 / (raw * A + B).
pub const DEPTH_COEFF_A: f64 = -0.003_071_101_6;
pub const DEPTH_COEFF_B: f64 = 3.330_949_516_1;

// -- Camera command channel --
pub const CMD_MAGIC: [u8; 2] = *b"GM";
pub const REPLY_MAGIC: [u8; 2] = *b"RB";
pub const CMD_HEADER_SIZE: usize = 8;
pub const CMD_WRITE_REGISTER: u16 = 0x0003;
pub const CMD_GET_FIXED_PARAMS: u16 = 0x0004;
/// Request body of `CMD_GET_FIXED_PARAMS`: five zero words.
pub const FIXED_PARAMS_REQUEST: [u8; 10] = [0; 10];
pub const CTRL_OUT: u8 = 0x40;
pub const CTRL_IN: u8 = 0xC0;
pub const CTRL_REPLY_LEN: usize = 0x200;

// -- Fixed-parameter reply: zero-plane info block, f32 LE fields --
pub const ZPI_OFFSET: usize = 94;
pub const ZPI_REF_DISTANCE: usize = ZPI_OFFSET + 8;
pub const ZPI_REF_PIXEL_SIZE: usize = ZPI_OFFSET + 12;

// -- Camera registers --
pub const REG_PROJECTOR_CYCLE: u16 = 0x0105;
pub const REG_DEPTH_STREAM: u16 = 0x0006;
pub const REG_DEPTH_FORMAT: u16 = 0x0012;
pub const REG_DEPTH_RESOLUTION: u16 = 0x0013;
pub const REG_DEPTH_FPS: u16 = 0x0014;
pub const REG_DEPTH_HFLIP: u16 = 0x0017;
pub const DEPTH_STREAM_OFF: u16 = 0x00;
pub const DEPTH_STREAM_ON: u16 = 0x02;
pub const DEPTH_FORMAT_11BIT: u16 = 0x03;
pub const DEPTH_RESOLUTION_640X480: u16 = 0x01;
pub const DEPTH_FPS_30: u16 = 0x1E;

/// Build a camera command frame.
/// Format: ["GM", len_words LE, cmd LE, tag LE, payload...]
pub fn build_command(cmd: u16, tag: u16, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(CMD_HEADER_SIZE + payload.len());
    buf.extend_from_slice(&CMD_MAGIC);
    buf.extend_from_slice(&((payload.len() / 2) as u16).to_le_bytes());
    buf.extend_from_slice(&cmd.to_le_bytes());
    buf.extend_from_slice(&tag.to_le_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Build the payload of a register write: [register LE, value LE].
pub fn build_write_register(register: u16, value: u16) -> [u8; 4] {
    let r = register.to_le_bytes();
    let v = value.to_le_bytes();
    [r[0], r[1], v[0], v[1]]
}

/// Validate a command reply and return its payload.
pub fn parse_reply(reply: &[u8], cmd: u16, tag: u16) -> crate::Result<&[u8]> {
    let fail = |reason: String| crate::CubicError::Command { cmd, reason };

    if reply.len() < CMD_HEADER_SIZE {
        return Err(fail(format!("reply too short ({} bytes)", reply.len())));
    }
    if reply[0..2] != REPLY_MAGIC {
        return Err(fail(format!(
            "bad reply magic {:02x}{:02x}",
            reply[0], reply[1]
        )));
    }
    let words = u16::from_le_bytes([reply[2], reply[3]]) as usize;
    let echo_cmd = u16::from_le_bytes([reply[4], reply[5]]);
    let echo_tag = u16::from_le_bytes([reply[6], reply[7]]);
    if echo_cmd != cmd || echo_tag != tag {
        return Err(fail(format!(
            "reply echo mismatch: cmd=0x{:04x} tag={}",
            echo_cmd, echo_tag
        )));
    }
    let end = CMD_HEADER_SIZE + words * 2;
    if end > reply.len() {
        return Err(fail(format!(
            "reply declares {} payload bytes, got {}",
            words * 2,
            reply.len() - CMD_HEADER_SIZE
        )));
    }
    Ok(&reply[CMD_HEADER_SIZE..end])
}

/// Extract the zero-plane calibration from a fixed-parameter reply payload.
///
/// Returns `None` when the payload is too short or either value is not a
/// positive finite number.
pub fn parse_zero_plane_info(payload: &[u8]) -> Option<Intrinsics> {
    let read = |at: usize| -> Option<f64> {
        let bytes: [u8; 4] = payload.get(at..at + 4)?.try_into().ok()?;
        let v = f32::from_le_bytes(bytes) as f64;
        (v.is_finite() && v > 0.0).then_some(v)
    };
    Some(Intrinsics {
        reference_distance: read(ZPI_REF_DISTANCE)?,
        reference_pixel_size: read(ZPI_REF_PIXEL_SIZE)?,
    })
}

/// Header carried by every isochronous camera packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub flag: u8,
    pub seq: u8,
    pub timestamp: u32,
}

impl PacketHeader {
    /// Parse a 12-byte packet header.
    ///
    /// Layout:
    /// - `[0..2]`: "RB"
    /// - `[3]`: flag (stream base | SOF/MOF/EOF)
    /// - `[5]`: sequence number
    /// - `[8..12]`: uint32 LE timestamp
    pub fn parse(data: &[u8]) -> Option<PacketHeader> {
        if data.len() < PKT_HEADER_SIZE || data[0..2] != PKT_MAGIC {
            return None;
        }
        Some(PacketHeader {
            flag: data[3],
            seq: data[5],
            timestamp: u32::from_le_bytes([data[8], data[9], data[10], data[11]]),
        })
    }
}

/// Unpack big-endian bit-packed samples of `bits` width into `out`.
///
/// Stops early when `packed` runs out; remaining outputs are left untouched.
pub fn unpack_bits(packed: &[u8], bits: usize, out: &mut [u16]) {
    let mask = (1u32 << bits) - 1;
    let mut buffer: u32 = 0;
    let mut bits_in = 0usize;
    let mut src = packed.iter();

    for sample in out.iter_mut() {
        while bits_in < bits {
            match src.next() {
                Some(&b) => {
                    buffer = (buffer << 8) | b as u32;
                    bits_in += 8;
                }
                None => return,
            }
        }
        bits_in -= bits;
        *sample = ((buffer >> bits_in) & mask) as u16;
    }
}

/// Convert a raw 11-bit disparity value to millimetres. 0 means no reading.
pub fn raw_to_mm(raw: u16) -> u16 {
    if raw >= DEPTH_NO_READING {
        return 0;
    }
    let denom = raw as f64 * DEPTH_COEFF_A + DEPTH_COEFF_B;
    if denom <= 0.0 {
        return 0;
    }
    (1000.0 / denom).round().min(u16::MAX as f64) as u16
}

/// Lookup table covering every 11-bit raw value.
pub fn depth_mm_table() -> Vec<u16> {
    (0..1u16 << DEPTH_BITS).map(raw_to_mm).collect()
}
