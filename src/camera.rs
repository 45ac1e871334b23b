use crate::protocol::{self, CTRL_IN, CTRL_OUT, CTRL_REPLY_LEN};
use crate::session::DeviceSession;
use crate::types::Intrinsics;
use crate::{CubicError, Result};
use std::time::Duration;

const REPLY_POLL_ATTEMPTS: usize = 200;
const REPLY_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// One command round-trip over a control channel.
///
/// `io(request_type, buf)` performs a single control transfer and returns the
/// bytes moved. The device answers asynchronously, so the reply side is
/// polled until a non-empty response arrives.
fn run_command<F>(cmd: u16, tag: u16, payload: &[u8], mut io: F) -> Result<Vec<u8>>
where
    F: FnMut(u8, &mut [u8]) -> Result<usize>,
{
    let mut frame = protocol::build_command(cmd, tag, payload);
    io(CTRL_OUT, &mut frame)?;

    let mut reply = vec![0u8; CTRL_REPLY_LEN];
    for _ in 0..REPLY_POLL_ATTEMPTS {
        let len = io(CTRL_IN, &mut reply)?;
        if len == 0 {
            std::thread::sleep(REPLY_POLL_INTERVAL);
            continue;
        }
        let body = protocol::parse_reply(&reply[..len.min(reply.len())], cmd, tag)?;
        return Ok(body.to_vec());
    }

    Err(CubicError::Command {
        cmd,
        reason: format!("no reply after {} polls", REPLY_POLL_ATTEMPTS),
    })
}

/// A register write is acknowledged with a leading zero word.
fn check_write_ack(register: u16, reply: &[u8]) -> Result<()> {
    match reply {
        [0, 0, ..] => Ok(()),
        other => Err(CubicError::Command {
            cmd: protocol::CMD_WRITE_REGISTER,
            reason: format!("register 0x{:04x} write rejected: {:02x?}", register, other),
        }),
    }
}

impl DeviceSession {
    /// Send a camera command and wait for its reply payload.
    pub fn send_command(&mut self, cmd: u16, payload: &[u8]) -> Result<Vec<u8>> {
        let tag = self.take_tag();
        run_command(cmd, tag, payload, |request_type, buf| {
            self.control(request_type, 0, 0, 0, buf)
        })
    }

    /// Write a 16-bit camera register.
    pub fn write_register(&mut self, register: u16, value: u16) -> Result<()> {
        log::trace!("Write register 0x{:04x} <= 0x{:02x}", register, value);
        let payload = protocol::build_write_register(register, value);
        let reply = self.send_command(protocol::CMD_WRITE_REGISTER, &payload)?;
        check_write_ack(register, &reply)
    }

    /// Read the sensor's zero-plane calibration.
    pub fn fetch_intrinsics(&mut self) -> Result<Intrinsics> {
        let reply = self.send_command(
            protocol::CMD_GET_FIXED_PARAMS,
            &protocol::FIXED_PARAMS_REQUEST,
        )?;
        let intrinsics =
            protocol::parse_zero_plane_info(&reply).ok_or_else(|| CubicError::Command {
                cmd: protocol::CMD_GET_FIXED_PARAMS,
                reason: format!("no zero-plane info in {}-byte reply", reply.len()),
            })?;
        log::debug!(
            "Sensor #{} zero plane: distance={} mm pixel={} mm",
            self.index(),
            intrinsics.reference_distance,
            intrinsics.reference_pixel_size
        );
        Ok(intrinsics)
    }

    /// Put the camera into 640x480 11-bit depth streaming at 30 fps.
    pub fn start_depth(&mut self) -> Result<()> {
        use protocol::*;

        // Projector auto-cycle is only present on some firmware; ignore failure.
        if let Err(e) = self.write_register(REG_PROJECTOR_CYCLE, 0x00) {
            log::debug!("Projector cycle register not supported: {}", e);
        }
        self.write_register(REG_DEPTH_STREAM, DEPTH_STREAM_OFF)?;
        self.write_register(REG_DEPTH_FORMAT, DEPTH_FORMAT_11BIT)?;
        self.write_register(REG_DEPTH_RESOLUTION, DEPTH_RESOLUTION_640X480)?;
        self.write_register(REG_DEPTH_FPS, DEPTH_FPS_30)?;
        self.write_register(REG_DEPTH_STREAM, DEPTH_STREAM_ON)?;
        self.write_register(REG_DEPTH_HFLIP, 0x00)?;

        log::info!("Depth stream enabled on sensor #{}", self.index());
        Ok(())
    }

    /// Turn the depth stream off.
    pub fn stop_depth(&mut self) -> Result<()> {
        self.write_register(protocol::REG_DEPTH_STREAM, protocol::DEPTH_STREAM_OFF)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    type Sent = Rc<RefCell<Vec<Vec<u8>>>>;

    fn reply_frame(cmd: u16, tag: u16, payload: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&REPLY_MAGIC);
        buf.extend_from_slice(&((payload.len() / 2) as u16).to_le_bytes());
        buf.extend_from_slice(&cmd.to_le_bytes());
        buf.extend_from_slice(&tag.to_le_bytes());
        buf.extend_from_slice(payload);
        buf
    }

    /// Control channel that answers after `empty_polls` empty reads.
    fn fake_device(
        reply: Vec<u8>,
        empty_polls: usize,
    ) -> (impl FnMut(u8, &mut [u8]) -> Result<usize>, Sent) {
        let sent: Sent = Rc::new(RefCell::new(Vec::new()));
        let log = sent.clone();
        let mut polls = 0;
        let io = move |request_type: u8, buf: &mut [u8]| -> Result<usize> {
            if request_type == CTRL_OUT {
                log.borrow_mut().push(buf.to_vec());
                return Ok(buf.len());
            }
            polls += 1;
            if polls <= empty_polls {
                return Ok(0);
            }
            buf[..reply.len()].copy_from_slice(&reply);
            Ok(reply.len())
        };
        (io, sent)
    }

    #[test]
    fn test_command_waits_for_reply() {
        let (io, sent) = fake_device(reply_frame(CMD_WRITE_REGISTER, 3, &[0, 0]), 4);
        let payload = build_write_register(REG_DEPTH_FPS, DEPTH_FPS_30);
        let body = run_command(CMD_WRITE_REGISTER, 3, &payload, io).unwrap();

        assert_eq!(body, vec![0, 0]);
        let sent = sent.borrow();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0], build_command(CMD_WRITE_REGISTER, 3, &payload));
    }

    #[test]
    fn test_command_without_reply_times_out() {
        let (io, _) = fake_device(Vec::new(), usize::MAX);
        let err = run_command(CMD_WRITE_REGISTER, 0, &[], io).unwrap_err();
        assert!(matches!(err, CubicError::Command { cmd: CMD_WRITE_REGISTER, .. }));
    }

    #[test]
    fn test_reply_for_other_tag_is_rejected() {
        let (io, _) = fake_device(reply_frame(CMD_WRITE_REGISTER, 9, &[0, 0]), 0);
        assert!(run_command(CMD_WRITE_REGISTER, 3, &[], io).is_err());
    }

    #[test]
    fn test_transfer_error_aborts_command() {
        let io = |_: u8, _: &mut [u8]| -> Result<usize> { Err(CubicError::DeviceGone) };
        let err = run_command(CMD_WRITE_REGISTER, 0, &[], io).unwrap_err();
        assert!(matches!(err, CubicError::DeviceGone));
    }

    #[test]
    fn test_write_ack() {
        assert!(check_write_ack(REG_DEPTH_STREAM, &[0, 0]).is_ok());
        assert!(check_write_ack(REG_DEPTH_STREAM, &[0, 0, 0x12, 0x34]).is_ok());

        let err = check_write_ack(REG_DEPTH_STREAM, &[1, 0]).unwrap_err();
        match err {
            CubicError::Command { cmd, reason } => {
                assert_eq!(cmd, CMD_WRITE_REGISTER);
                assert!(reason.contains("0x0006"));
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert!(check_write_ack(REG_DEPTH_STREAM, &[]).is_err());
    }

    #[test]
    fn test_fixed_params_round_trip() {
        let mut zpi = vec![0u8; 322];
        zpi[ZPI_REF_DISTANCE..ZPI_REF_DISTANCE + 4].copy_from_slice(&118.5f32.to_le_bytes());
        zpi[ZPI_REF_PIXEL_SIZE..ZPI_REF_PIXEL_SIZE + 4].copy_from_slice(&0.25f32.to_le_bytes());
        let (io, sent) = fake_device(reply_frame(CMD_GET_FIXED_PARAMS, 1, &zpi), 1);

        let body = run_command(CMD_GET_FIXED_PARAMS, 1, &FIXED_PARAMS_REQUEST, io).unwrap();
        let intrinsics = parse_zero_plane_info(&body).unwrap();
        assert_eq!(intrinsics.reference_distance, 118.5);
        assert_eq!(intrinsics.reference_pixel_size, 0.25);
        // Request carries five zero words.
        assert_eq!(sent.borrow()[0][2..4], [5, 0]);
    }
}
