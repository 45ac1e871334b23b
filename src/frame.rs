//! Reassembly of depth frames from isochronous packets.
//!
//! Every packet starts with a 12-byte header (see
//! [`PacketHeader`](crate::protocol::PacketHeader)). A frame is one
//! start-of-frame packet, middle packets and one end-of-frame packet, each
//! carrying up to 1748 bytes of 11-bit packed disparity. Sequence numbers
//! increase by one per packet; a gap drops the partial frame and the
//! assembler waits for the next start-of-frame.

use crate::protocol::{
    self, PacketHeader, DEPTH_BITS, DEPTH_FLAG_BASE, DEPTH_FRAME_BYTES, DEPTH_HEIGHT,
    DEPTH_PKTS_PER_FRAME, DEPTH_PKT_PAYLOAD, DEPTH_WIDTH, FLAG_EOF, FLAG_MOF, FLAG_SOF,
    PKT_HEADER_SIZE,
};

const SOF: u8 = DEPTH_FLAG_BASE | FLAG_SOF;
const MOF: u8 = DEPTH_FLAG_BASE | FLAG_MOF;
const EOF: u8 = DEPTH_FLAG_BASE | FLAG_EOF;

pub struct DepthAssembler {
    raw: Vec<u8>,
    samples: Vec<u16>,
    frame: Vec<u16>,
    mm_table: Vec<u16>,
    synced: bool,
    seq: u8,
    got_pkts: usize,
    timestamp: u32,
    dropped: u64,
}

impl Default for DepthAssembler {
    fn default() -> Self {
        Self::new()
    }
}

impl DepthAssembler {
    pub fn new() -> DepthAssembler {
        DepthAssembler {
            raw: vec![0; DEPTH_FRAME_BYTES],
            samples: vec![0; DEPTH_WIDTH * DEPTH_HEIGHT],
            frame: vec![0; DEPTH_WIDTH * DEPTH_HEIGHT],
            mm_table: protocol::depth_mm_table(),
            synced: false,
            seq: 0,
            got_pkts: 0,
            timestamp: 0,
            dropped: 0,
        }
    }

    /// Feed one isochronous packet. Returns the finished frame, in
    /// millimetres (0 = no reading), when this packet completes one.
    pub fn push(&mut self, pkt: &[u8]) -> Option<&[u16]> {
        // Empty and foreign packets are normal on an isochronous pipe.
        let hdr = PacketHeader::parse(pkt)?;
        if hdr.flag & 0xF0 != DEPTH_FLAG_BASE {
            return None;
        }

        if self.synced && hdr.seq != self.seq {
            log::debug!(
                "Lost {} depth packets (expected seq {}, got {})",
                hdr.seq.wrapping_sub(self.seq),
                self.seq,
                hdr.seq
            );
            self.drop_partial();
            self.synced = false;
        }

        if !self.synced {
            if hdr.flag != SOF {
                return None;
            }
            self.synced = true;
            self.got_pkts = 0;
        }
        self.seq = hdr.seq.wrapping_add(1);

        match hdr.flag {
            SOF if self.got_pkts != 0 => {
                log::debug!("Unexpected start of frame after {} packets", self.got_pkts);
                self.drop_partial();
            }
            MOF | EOF if self.got_pkts == 0 => {
                self.synced = false;
                return None;
            }
            SOF | MOF | EOF => {}
            other => {
                log::trace!("Ignoring depth packet with flag 0x{:02x}", other);
                return None;
            }
        }

        if self.got_pkts >= DEPTH_PKTS_PER_FRAME {
            log::debug!("Depth frame overran {} packets", DEPTH_PKTS_PER_FRAME);
            self.drop_partial();
            self.synced = false;
            return None;
        }

        let payload = &pkt[PKT_HEADER_SIZE..];
        let offset = self.got_pkts * DEPTH_PKT_PAYLOAD;
        let len = payload
            .len()
            .min(DEPTH_PKT_PAYLOAD)
            .min(self.raw.len() - offset);
        self.raw[offset..offset + len].copy_from_slice(&payload[..len]);
        self.got_pkts += 1;

        if hdr.flag != EOF {
            return None;
        }

        let got = std::mem::take(&mut self.got_pkts);
        if got != DEPTH_PKTS_PER_FRAME {
            log::debug!("Short depth frame: {} of {} packets", got, DEPTH_PKTS_PER_FRAME);
            self.dropped += 1;
            return None;
        }

        self.timestamp = hdr.timestamp;
        protocol::unpack_bits(&self.raw, DEPTH_BITS, &mut self.samples);
        for (mm, &raw) in self.frame.iter_mut().zip(&self.samples) {
            *mm = self.mm_table[raw as usize & 0x7FF];
        }
        Some(&self.frame)
    }

    fn drop_partial(&mut self) {
        if self.got_pkts > 0 {
            self.dropped += 1;
        }
        self.got_pkts = 0;
    }

    /// Last completed frame, in millimetres.
    pub fn frame(&self) -> &[u16] {
        &self.frame
    }

    /// Timestamp of the last completed frame.
    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    /// Partial frames discarded so far.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}
