//! Isochronous stream engine.
//!
//! A stream keeps a fixed pool of isochronous transfers in flight on one
//! endpoint. Each completion is classified into a [`TransferStatus`] and fed
//! to a [`SlotLedger`], which decides whether the slot delivers its packets
//! and is resubmitted, or is retired. The libusb callback only carries out
//! that decision.
//!
//! Completions run on whichever thread is handling USB events (normally the
//! [`EventPump`](crate::pump::EventPump)).

use crate::context::UsbContext;
use crate::session::DeviceSession;
use crate::types::StreamGeometry;
use crate::{CubicError, Result};
use rusb::ffi::{self, constants::*};
use rusb::UsbContext as _;
use std::ffi::{c_int, c_uint, c_void};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// How long each drain iteration of [`IsoStream::stop`] waits for events.
const DRAIN_POLL: Duration = Duration::from_millis(100);

/// Final status of one transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Completed,
    NoDevice,
    Cancelled,
    /// Anything else (timeouts, stalls, overflows, ...). Treated as transient.
    Error(i32),
}

impl TransferStatus {
    fn from_raw(status: c_int) -> TransferStatus {
        if status == LIBUSB_TRANSFER_COMPLETED as c_int {
            TransferStatus::Completed
        } else if status == LIBUSB_TRANSFER_NO_DEVICE as c_int {
            TransferStatus::NoDevice
        } else if status == LIBUSB_TRANSFER_CANCELLED as c_int {
            TransferStatus::Cancelled
        } else {
            TransferStatus::Error(status as i32)
        }
    }
}

/// Why a (re)submission was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitFailure {
    NoDevice,
    Other(i32),
}

impl SubmitFailure {
    fn from_code(code: c_int) -> SubmitFailure {
        if code == LIBUSB_ERROR_NO_DEVICE as c_int {
            SubmitFailure::NoDevice
        } else {
            SubmitFailure::Other(code as i32)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Allocated, not yet handed to libusb.
    Idle,
    /// Owned by libusb, waiting for completion.
    Submitted,
    /// Completed; packets are being delivered or a resubmit is pending.
    InCallback,
    /// Reached terminal status; counted in `dead_xfers`.
    Retired,
}

/// What the completion handler must do next with a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Hand every packet to the sink, then resubmit.
    Deliver,
    /// Resubmit without delivering.
    Resubmit,
    /// Slot is finished.
    Retire,
}

/// Per-slot bookkeeping for one stream.
///
/// While the stream is live, slots not yet retired are in flight; teardown
/// is complete once every slot is retired.
#[derive(Debug)]
pub struct SlotLedger {
    endpoint: u8,
    slots: Vec<SlotState>,
    stopping: bool,
    dead_xfers: usize,
}

impl SlotLedger {
    pub fn new(endpoint: u8, transfers: usize) -> SlotLedger {
        SlotLedger {
            endpoint,
            slots: vec![SlotState::Idle; transfers],
            stopping: false,
            dead_xfers: 0,
        }
    }

    /// Record the outcome of a slot's first submission.
    pub fn started(&mut self, slot: usize, result: std::result::Result<(), SubmitFailure>) {
        match result {
            Ok(()) => self.slots[slot] = SlotState::Submitted,
            Err(failure) => {
                log::warn!(
                    "Failed to submit isochronous transfer {} on EP {:02x}: {:?}",
                    slot,
                    self.endpoint,
                    failure
                );
                self.retire(slot);
            }
        }
    }

    /// Classify a completion.
    pub fn complete(
        &mut self,
        slot: usize,
        status: TransferStatus,
        device_dead: &AtomicBool,
    ) -> Disposition {
        if self.stopping {
            self.retire(slot);
            log::trace!(
                "EP {:02x} transfer {} finished ({:?}), {} left",
                self.endpoint,
                slot,
                status,
                self.in_flight()
            );
            return Disposition::Retire;
        }

        match status {
            TransferStatus::Error(_) if device_dead.load(Ordering::Acquire) => {
                log::debug!(
                    "EP {:02x} transfer {} not resubmitted, device is gone",
                    self.endpoint,
                    slot
                );
                self.retire(slot);
                Disposition::Retire
            }
            // Packets that made it are still delivered once the device is
            // gone; `resubmit_allowed` retires the slot afterwards.
            TransferStatus::Completed => {
                self.slots[slot] = SlotState::InCallback;
                Disposition::Deliver
            }
            TransferStatus::NoDevice => {
                if !device_dead.swap(true, Ordering::AcqRel) {
                    log::error!(
                        "USB device disappeared, cancelling stream {:02x}",
                        self.endpoint
                    );
                }
                self.retire(slot);
                Disposition::Retire
            }
            TransferStatus::Cancelled => {
                // Some platforms report a vanished device as cancellation.
                if !device_dead.swap(true, Ordering::AcqRel) {
                    log::error!(
                        "Got cancelled transfer on EP {:02x} without requesting it, device disconnected?",
                        self.endpoint
                    );
                }
                self.retire(slot);
                Disposition::Retire
            }
            TransferStatus::Error(code) => {
                log::warn!(
                    "Isochronous transfer error on EP {:02x}: {}",
                    self.endpoint,
                    code
                );
                self.slots[slot] = SlotState::InCallback;
                Disposition::Resubmit
            }
        }
    }

    /// Check that a slot may go back to libusb; retires it otherwise.
    pub fn resubmit_allowed(&mut self, slot: usize, device_dead: &AtomicBool) -> bool {
        if self.stopping || device_dead.load(Ordering::Acquire) {
            self.retire(slot);
            return false;
        }
        true
    }

    /// Record the outcome of a resubmission.
    pub fn resubmitted(
        &mut self,
        slot: usize,
        result: std::result::Result<(), SubmitFailure>,
        device_dead: &AtomicBool,
    ) {
        match result {
            Ok(()) => self.slots[slot] = SlotState::Submitted,
            Err(failure) => {
                log::error!(
                    "Failed to resubmit transfer {} on EP {:02x}: {:?}",
                    slot,
                    self.endpoint,
                    failure
                );
                if failure == SubmitFailure::NoDevice {
                    device_dead.store(true, Ordering::Release);
                }
                self.retire(slot);
            }
        }
    }

    /// Mark the stream as stopping and return the slots that need cancelling.
    pub fn begin_stop(&mut self) -> Vec<usize> {
        self.stopping = true;
        for slot in 0..self.slots.len() {
            if self.slots[slot] == SlotState::Idle {
                self.retire(slot);
            }
        }
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, state)| **state == SlotState::Submitted)
            .map(|(slot, _)| slot)
            .collect()
    }

    fn retire(&mut self, slot: usize) {
        if self.slots[slot] != SlotState::Retired {
            self.slots[slot] = SlotState::Retired;
            self.dead_xfers += 1;
        }
    }

    pub fn state(&self, slot: usize) -> SlotState {
        self.slots[slot]
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping
    }

    pub fn dead_xfers(&self) -> usize {
        self.dead_xfers
    }

    pub fn in_flight(&self) -> usize {
        self.slots.len() - self.dead_xfers
    }

    pub fn is_drained(&self) -> bool {
        self.dead_xfers == self.slots.len()
    }
}

/// Split a transfer buffer into its packets, truncated to their actual length.
pub(crate) fn packets<'a, I>(
    buffer: &'a [u8],
    packet_len: usize,
    actual_lengths: I,
) -> impl Iterator<Item = &'a [u8]> + 'a
where
    I: IntoIterator<Item = usize>,
    I::IntoIter: 'a,
{
    actual_lengths
        .into_iter()
        .enumerate()
        .filter_map(move |(i, actual)| {
            let start = i * packet_len;
            let end = start + actual.min(packet_len);
            buffer.get(start..end)
        })
}

type PacketSink = Box<dyn FnMut(&[u8]) + Send>;

/// Hands a filled transfer to libusb.
type SubmitFn = unsafe fn(*mut ffi::libusb_transfer) -> std::result::Result<(), SubmitFailure>;

struct TransferPtr(NonNull<ffi::libusb_transfer>);

// SAFETY: a transfer is only touched by libusb, by the completion callback
// (serialized through the ledger lock) and by `stop` after draining.
unsafe impl Send for TransferPtr {}
unsafe impl Sync for TransferPtr {}

/// Heap buffer shared with libusb for the lifetime of a stream.
struct RawBuffer {
    ptr: NonNull<[u8]>,
}

// SAFETY: the buffer is only accessed through raw pointers by libusb and the
// completion callback; Rust never holds a reference across submissions.
unsafe impl Send for RawBuffer {}

impl RawBuffer {
    fn new(len: usize) -> RawBuffer {
        let boxed: Box<[u8]> = vec![0u8; len].into_boxed_slice();
        RawBuffer {
            ptr: NonNull::from(Box::leak(boxed)),
        }
    }

    fn base(&self) -> *mut u8 {
        self.ptr.as_ptr() as *mut u8
    }
}

impl Drop for RawBuffer {
    fn drop(&mut self) {
        // SAFETY: ptr came from Box::leak in `new` and is dropped exactly once.
        unsafe { drop(Box::from_raw(self.ptr.as_ptr())) };
    }
}

struct StreamShared {
    endpoint: u8,
    geometry: StreamGeometry,
    ledger: Mutex<SlotLedger>,
    sink: Mutex<PacketSink>,
    device_dead: Arc<AtomicBool>,
    transfers: Vec<TransferPtr>,
    submit: SubmitFn,
}

impl Drop for StreamShared {
    fn drop(&mut self) {
        for t in &self.transfers {
            // SAFETY: dropped only once every slot is retired (or was never
            // submitted), so libusb no longer references the transfer.
            unsafe { ffi::libusb_free_transfer(t.0.as_ptr()) };
        }
    }
}

impl StreamShared {
    fn ledger(&self) -> MutexGuard<'_, SlotLedger> {
        self.ledger.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn slot_of(&self, xfer: *mut ffi::libusb_transfer) -> Option<usize> {
        self.transfers.iter().position(|t| t.0.as_ptr() == xfer)
    }

    fn on_transfer(&self, xfer: *mut ffi::libusb_transfer) {
        let Some(slot) = self.slot_of(xfer) else {
            log::error!("Completion for unknown transfer on EP {:02x}", self.endpoint);
            return;
        };
        // SAFETY: libusb hands back a transfer we allocated.
        let status = TransferStatus::from_raw(unsafe { (*xfer).status });

        let disposition = self.ledger().complete(slot, status, &self.device_dead);
        match disposition {
            Disposition::Deliver => {
                // A panicking sink must not strand the slot in InCallback.
                let delivered = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    self.deliver(xfer);
                }));
                if delivered.is_err() {
                    log::error!(
                        "Packet sink panicked on EP {:02x} transfer {}",
                        self.endpoint,
                        slot
                    );
                }
                self.resubmit(slot, xfer);
            }
            Disposition::Resubmit => self.resubmit(slot, xfer),
            Disposition::Retire => {}
        }
    }

    fn deliver(&self, xfer: *mut ffi::libusb_transfer) {
        let pkts = self.geometry.packets_per_transfer;
        // SAFETY: the transfer covers transfer_len() bytes of the stream
        // buffer and libusb has finished writing them.
        let data = unsafe {
            std::slice::from_raw_parts((*xfer).buffer as *const u8, self.geometry.transfer_len())
        };
        // SAFETY: the transfer was allocated with `pkts` packet descriptors.
        let lengths = (0..pkts).map(|i| unsafe { (*iso_desc(xfer, i)).actual_length as usize });

        let mut sink = self.sink.lock().unwrap_or_else(|e| e.into_inner());
        for packet in packets(data, self.geometry.packet_len, lengths) {
            sink(packet);
        }
    }

    fn resubmit(&self, slot: usize, xfer: *mut ffi::libusb_transfer) {
        let mut ledger = self.ledger();
        if !ledger.resubmit_allowed(slot, &self.device_dead) {
            return;
        }
        // SAFETY: the slot is InCallback, so libusb does not own the transfer.
        let result = unsafe { (self.submit)(xfer) };
        ledger.resubmitted(slot, result, &self.device_dead);
    }
}

/// Pointer to the `i`-th packet descriptor trailing a transfer.
unsafe fn iso_desc(
    xfer: *mut ffi::libusb_transfer,
    i: usize,
) -> *mut ffi::libusb_iso_packet_descriptor {
    std::ptr::addr_of_mut!((*xfer).iso_packet_desc)
        .cast::<ffi::libusb_iso_packet_descriptor>()
        .add(i)
}

unsafe fn submit(xfer: *mut ffi::libusb_transfer) -> std::result::Result<(), SubmitFailure> {
    match ffi::libusb_submit_transfer(xfer) {
        0 => Ok(()),
        code => Err(SubmitFailure::from_code(code)),
    }
}

unsafe fn fill_iso_transfer(
    xfer: *mut ffi::libusb_transfer,
    handle: *mut ffi::libusb_device_handle,
    endpoint: u8,
    buffer: *mut u8,
    geometry: &StreamGeometry,
    user_data: *mut c_void,
) {
    (*xfer).dev_handle = handle;
    (*xfer).endpoint = endpoint;
    (*xfer).transfer_type = LIBUSB_TRANSFER_TYPE_ISOCHRONOUS as _;
    (*xfer).timeout = 0;
    (*xfer).buffer = buffer;
    (*xfer).length = geometry.transfer_len() as c_int;
    (*xfer).num_iso_packets = geometry.packets_per_transfer as c_int;
    (*xfer).callback = iso_callback;
    (*xfer).user_data = user_data;
    for i in 0..geometry.packets_per_transfer {
        (*iso_desc(xfer, i)).length = geometry.packet_len as c_uint;
    }
}

extern "system" fn iso_callback(xfer: *mut ffi::libusb_transfer) {
    // SAFETY: user_data points at the stream's shared state, which is freed
    // only after every transfer has reported terminal status.
    let shared = unsafe { &*((*xfer).user_data as *const StreamShared) };
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        shared.on_transfer(xfer);
    }));
    if let Err(e) = result {
        log::error!("Panic in isochronous completion handler: {:?}", e);
    }
}

/// A running isochronous stream.
///
/// Every transfer points at the session's camera handle, so the session
/// must stay open until the stream is stopped.
pub(crate) struct IsoStream {
    shared: Option<Box<StreamShared>>,
    buffer: Option<RawBuffer>,
    ctx: rusb::Context,
}

impl IsoStream {
    /// Allocate the transfer pool and submit every slot.
    ///
    /// A slot whose submission fails is retired; the others keep running.
    /// `sink` receives each packet's bytes in order, on the event thread.
    pub(crate) fn start<F>(
        ctx: &UsbContext,
        session: &DeviceSession,
        endpoint: u8,
        geometry: StreamGeometry,
        sink: F,
    ) -> Result<IsoStream>
    where
        F: FnMut(&[u8]) + Send + 'static,
    {
        if geometry.transfers == 0 || geometry.packets_per_transfer == 0 || geometry.packet_len == 0
        {
            return Err(CubicError::InvalidParams(format!(
                "empty stream geometry {:?}",
                geometry
            )));
        }
        let handle = session.camera_raw().ok_or(CubicError::SessionClosed)?;

        let mut transfers = Vec::with_capacity(geometry.transfers);
        for _ in 0..geometry.transfers {
            // SAFETY: plain allocation; freed below or in `stop`.
            let raw = unsafe { ffi::libusb_alloc_transfer(geometry.packets_per_transfer as c_int) };
            match NonNull::new(raw) {
                Some(ptr) => transfers.push(TransferPtr(ptr)),
                None => {
                    for t in &transfers {
                        // SAFETY: never submitted.
                        unsafe { ffi::libusb_free_transfer(t.0.as_ptr()) };
                    }
                    return Err(CubicError::Usb(rusb::Error::NoMem));
                }
            }
        }

        let buffer = RawBuffer::new(geometry.buffer_len());
        let shared = Box::new(StreamShared {
            endpoint,
            geometry,
            ledger: Mutex::new(SlotLedger::new(endpoint, geometry.transfers)),
            sink: Mutex::new(Box::new(sink)),
            device_dead: session.dead_flag(),
            transfers,
            submit,
        });
        let user_data = &*shared as *const StreamShared as *mut c_void;

        {
            // Completions cannot be classified until every slot is recorded.
            let mut ledger = shared.ledger();
            for (slot, t) in shared.transfers.iter().enumerate() {
                log::trace!("Creating EP {:02x} transfer #{}", endpoint, slot);
                // SAFETY: the buffer region is slot-exclusive and outlives the transfer.
                let result = unsafe {
                    let region = buffer.base().add(slot * geometry.transfer_len());
                    fill_iso_transfer(t.0.as_ptr(), handle, endpoint, region, &geometry, user_data);
                    (shared.submit)(t.0.as_ptr())
                };
                ledger.started(slot, result);
            }
            log::info!(
                "Started isochronous stream on EP {:02x}: {}/{} transfers in flight",
                endpoint,
                ledger.in_flight(),
                geometry.transfers
            );
        }

        Ok(IsoStream {
            shared: Some(shared),
            buffer: Some(buffer),
            ctx: ctx.raw().clone(),
        })
    }

    /// Cancel every transfer, wait until each slot has reported terminal
    /// status, then free the pool. Returns the number of retired slots.
    ///
    /// Blocks while driving USB events. Must not be called from a packet
    /// sink, which runs inside event handling.
    pub fn stop(&mut self) -> usize {
        let Some(shared) = self.shared.take() else {
            return 0;
        };
        log::trace!("Stopping isochronous stream on EP {:02x}", shared.endpoint);

        {
            let mut ledger = shared.ledger();
            for slot in ledger.begin_stop() {
                // SAFETY: the slot is Submitted, so the transfer is live.
                let rc = unsafe { ffi::libusb_cancel_transfer(shared.transfers[slot].0.as_ptr()) };
                if rc != 0 {
                    log::trace!("Cancel of transfer {} returned {}", slot, rc);
                }
            }
        }

        loop {
            let (drained, left) = {
                let ledger = shared.ledger();
                (ledger.is_drained(), ledger.in_flight())
            };
            if drained {
                break;
            }
            log::trace!("Draining EP {:02x}: {} transfers left", shared.endpoint, left);
            match self.ctx.handle_events(Some(DRAIN_POLL)) {
                Ok(()) | Err(rusb::Error::Interrupted) => {}
                Err(e) => log::debug!("Event handling while draining: {}", e),
            }
        }

        let retired = shared.ledger().dead_xfers();
        // Frees the transfers; the buffer goes after them.
        drop(shared);
        self.buffer = None;

        log::debug!("Isochronous stream stopped, {} transfers retired", retired);
        retired
    }

    /// Transfers still owned by libusb or being handled.
    pub fn in_flight(&self) -> usize {
        self.shared
            .as_ref()
            .map(|s| s.ledger().in_flight())
            .unwrap_or(0)
    }

    /// True once the stream was stopped or every slot has died.
    pub fn is_dead(&self) -> bool {
        self.shared
            .as_ref()
            .map(|s| {
                let ledger = s.ledger();
                ledger.is_stopping() || ledger.is_drained()
            })
            .unwrap_or(true)
    }
}

impl Drop for IsoStream {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn running(n: usize) -> SlotLedger {
        let mut ledger = SlotLedger::new(0x82, n);
        for slot in 0..n {
            ledger.started(slot, Ok(()));
        }
        ledger
    }

    #[test]
    fn test_completed_slot_delivers_and_resubmits() {
        let dead = AtomicBool::new(false);
        let mut ledger = running(4);

        assert_eq!(
            ledger.complete(2, TransferStatus::Completed, &dead),
            Disposition::Deliver
        );
        assert_eq!(ledger.state(2), SlotState::InCallback);
        assert!(ledger.resubmit_allowed(2, &dead));
        ledger.resubmitted(2, Ok(()), &dead);

        assert_eq!(ledger.state(2), SlotState::Submitted);
        assert_eq!(ledger.in_flight(), 4);
        assert!(!dead.load(Ordering::Acquire));
    }

    #[test]
    fn test_failed_initial_submit_retires_only_that_slot() {
        let mut ledger = SlotLedger::new(0x82, 3);
        ledger.started(0, Ok(()));
        ledger.started(1, Err(SubmitFailure::Other(-6)));
        ledger.started(2, Ok(()));

        assert_eq!(ledger.dead_xfers(), 1);
        assert_eq!(ledger.in_flight(), 2);
        assert_eq!(ledger.state(1), SlotState::Retired);
        assert_eq!(ledger.state(2), SlotState::Submitted);
    }

    #[test]
    fn test_no_device_kills_session_and_stops_resubmission() {
        let dead = AtomicBool::new(false);
        let mut ledger = running(4);

        assert_eq!(
            ledger.complete(1, TransferStatus::NoDevice, &dead),
            Disposition::Retire
        );
        assert!(dead.load(Ordering::Acquire));

        // Completed slots still deliver, but none goes back to libusb.
        for slot in [0, 3] {
            assert_eq!(
                ledger.complete(slot, TransferStatus::Completed, &dead),
                Disposition::Deliver
            );
            assert!(!ledger.resubmit_allowed(slot, &dead));
        }
        assert_eq!(
            ledger.complete(2, TransferStatus::Error(1), &dead),
            Disposition::Retire
        );
        assert!(ledger.is_drained());
        assert_eq!(ledger.dead_xfers(), 4);
    }

    #[test]
    fn test_unrequested_cancel_is_treated_as_disconnect() {
        let dead = AtomicBool::new(false);
        let mut ledger = running(2);

        assert_eq!(
            ledger.complete(0, TransferStatus::Cancelled, &dead),
            Disposition::Retire
        );
        assert!(dead.load(Ordering::Acquire));
    }

    #[test]
    fn test_transient_error_resubmits() {
        let dead = AtomicBool::new(false);
        let mut ledger = running(2);

        assert_eq!(
            ledger.complete(0, TransferStatus::Error(1), &dead),
            Disposition::Resubmit
        );
        assert!(ledger.resubmit_allowed(0, &dead));
        ledger.resubmitted(0, Ok(()), &dead);
        assert_eq!(ledger.in_flight(), 2);

        // A resubmission refused with "no device" kills the session.
        ledger.complete(1, TransferStatus::Error(1), &dead);
        ledger.resubmitted(1, Err(SubmitFailure::NoDevice), &dead);
        assert!(dead.load(Ordering::Acquire));
        assert_eq!(ledger.state(1), SlotState::Retired);
    }

    #[test]
    fn test_resubmit_failure_without_device_loss() {
        let dead = AtomicBool::new(false);
        let mut ledger = running(2);

        ledger.complete(0, TransferStatus::Completed, &dead);
        ledger.resubmitted(0, Err(SubmitFailure::Other(-1)), &dead);
        assert!(!dead.load(Ordering::Acquire));
        assert_eq!(ledger.dead_xfers(), 1);
    }

    #[test]
    fn test_stop_drains_every_slot() {
        let dead = AtomicBool::new(false);
        let mut ledger = running(4);

        // Slot 3 is mid-callback when the stop arrives.
        ledger.complete(3, TransferStatus::Completed, &dead);

        let to_cancel = ledger.begin_stop();
        assert_eq!(to_cancel, vec![0, 1, 2]);
        assert!(!ledger.is_drained());

        // The in-callback slot must not go back to libusb.
        assert!(!ledger.resubmit_allowed(3, &dead));

        for slot in to_cancel {
            assert_eq!(
                ledger.complete(slot, TransferStatus::Cancelled, &dead),
                Disposition::Retire
            );
        }
        assert!(ledger.is_drained());
        assert_eq!(ledger.dead_xfers(), 4);
        // Requested cancellation is not a disconnect.
        assert!(!dead.load(Ordering::Acquire));
    }

    #[test]
    fn test_stop_retires_never_submitted_slots() {
        let mut ledger = SlotLedger::new(0x82, 2);
        ledger.started(0, Ok(()));

        let to_cancel = ledger.begin_stop();
        assert_eq!(to_cancel, vec![0]);
        assert_eq!(ledger.dead_xfers(), 1);
    }

    #[test]
    fn test_retire_is_counted_once() {
        let dead = AtomicBool::new(false);
        let mut ledger = running(1);
        ledger.complete(0, TransferStatus::NoDevice, &dead);
        ledger.begin_stop();
        assert_eq!(ledger.dead_xfers(), 1);
    }

    #[test]
    fn test_packets_truncate_to_actual_length() {
        let buffer: Vec<u8> = (0..12).collect();
        let lengths = [4usize, 0, 9];
        let out: Vec<&[u8]> = packets(&buffer, 4, lengths).collect();
        assert_eq!(out.len(), 3);
        assert_eq!(out[0], &[0, 1, 2, 3]);
        assert!(out[1].is_empty());
        assert_eq!(out[2], &[8, 9, 10, 11]);
    }

    #[test]
    fn test_status_from_raw() {
        assert_eq!(
            TransferStatus::from_raw(LIBUSB_TRANSFER_COMPLETED as c_int),
            TransferStatus::Completed
        );
        assert_eq!(
            TransferStatus::from_raw(LIBUSB_TRANSFER_NO_DEVICE as c_int),
            TransferStatus::NoDevice
        );
        assert_eq!(
            TransferStatus::from_raw(LIBUSB_TRANSFER_CANCELLED as c_int),
            TransferStatus::Cancelled
        );
        assert!(matches!(
            TransferStatus::from_raw(LIBUSB_TRANSFER_STALL as c_int),
            TransferStatus::Error(_)
        ));
        assert_eq!(
            SubmitFailure::from_code(LIBUSB_ERROR_NO_DEVICE as c_int),
            SubmitFailure::NoDevice
        );
    }

    // -- completion dispatch over real libusb transfer structs --

    type Received = Arc<Mutex<Vec<Vec<u8>>>>;

    unsafe fn accept_submit(
        _xfer: *mut ffi::libusb_transfer,
    ) -> std::result::Result<(), SubmitFailure> {
        Ok(())
    }

    unsafe fn refuse_submit(
        _xfer: *mut ffi::libusb_transfer,
    ) -> std::result::Result<(), SubmitFailure> {
        Err(SubmitFailure::Other(-99))
    }

    /// Shared state with allocated (never submitted) transfers, every slot
    /// recorded as in flight.
    fn fake_stream(
        geometry: StreamGeometry,
        submit: SubmitFn,
        sink: impl FnMut(&[u8]) + Send + 'static,
    ) -> (Box<StreamShared>, RawBuffer) {
        let buffer = RawBuffer::new(geometry.buffer_len());
        let transfers = (0..geometry.transfers)
            .map(|_| {
                let raw =
                    unsafe { ffi::libusb_alloc_transfer(geometry.packets_per_transfer as c_int) };
                TransferPtr(NonNull::new(raw).unwrap())
            })
            .collect();
        let shared = Box::new(StreamShared {
            endpoint: 0x82,
            geometry,
            ledger: Mutex::new(SlotLedger::new(0x82, geometry.transfers)),
            sink: Mutex::new(Box::new(sink)),
            device_dead: Arc::new(AtomicBool::new(false)),
            transfers,
            submit,
        });
        let user_data = &*shared as *const StreamShared as *mut c_void;
        for (slot, t) in shared.transfers.iter().enumerate() {
            unsafe {
                let region = buffer.base().add(slot * geometry.transfer_len());
                fill_iso_transfer(
                    t.0.as_ptr(),
                    std::ptr::null_mut(),
                    0x82,
                    region,
                    &geometry,
                    user_data,
                );
            }
            shared.ledger().started(slot, Ok(()));
        }
        (shared, buffer)
    }

    /// Make libusb's view of `slot` look finished with `status`.
    fn finish(
        shared: &StreamShared,
        slot: usize,
        status: c_int,
        lengths: &[usize],
    ) -> *mut ffi::libusb_transfer {
        let xfer = shared.transfers[slot].0.as_ptr();
        unsafe {
            (*xfer).status = status;
            for (i, &len) in lengths.iter().enumerate() {
                (*iso_desc(xfer, i)).actual_length = len as c_uint;
            }
        }
        xfer
    }

    fn recorder() -> (Received, impl FnMut(&[u8]) + Send + 'static) {
        let received: Received = Arc::new(Mutex::new(Vec::new()));
        let sink_side = received.clone();
        (received, move |pkt: &[u8]| sink_side.lock().unwrap().push(pkt.to_vec()))
    }

    const SMALL: StreamGeometry = StreamGeometry {
        transfers: 2,
        packets_per_transfer: 3,
        packet_len: 4,
    };

    #[test]
    fn test_completed_transfer_delivers_packets_in_order() {
        let (received, sink) = recorder();
        let (shared, buffer) = fake_stream(SMALL, accept_submit, sink);
        // Slot 1 owns bytes 12..24 of the stream buffer.
        unsafe {
            for i in 0..SMALL.transfer_len() {
                *buffer.base().add(SMALL.transfer_len() + i) = i as u8;
            }
        }

        let xfer = finish(&shared, 1, LIBUSB_TRANSFER_COMPLETED as c_int, &[4, 0, 2]);
        shared.on_transfer(xfer);

        let got = received.lock().unwrap().clone();
        assert_eq!(got, vec![vec![0, 1, 2, 3], vec![], vec![8, 9]]);
        assert_eq!(shared.ledger().state(1), SlotState::Submitted);
        assert_eq!(shared.ledger().in_flight(), 2);
    }

    #[test]
    fn test_panicking_sink_does_not_strand_slot() {
        let (shared, _buffer) = fake_stream(SMALL, accept_submit, |_: &[u8]| {
            panic!("sink failure");
        });

        let xfer = finish(&shared, 0, LIBUSB_TRANSFER_COMPLETED as c_int, &[4, 4, 4]);
        shared.on_transfer(xfer);
        assert_eq!(shared.ledger().state(0), SlotState::Submitted);

        // Stop can cancel it and drain.
        let to_cancel = shared.ledger().begin_stop();
        assert_eq!(to_cancel, vec![0, 1]);
        for slot in to_cancel {
            let xfer = finish(&shared, slot, LIBUSB_TRANSFER_CANCELLED as c_int, &[]);
            shared.on_transfer(xfer);
        }
        assert!(shared.ledger().is_drained());
    }

    #[test]
    fn test_no_packets_reach_sink_once_stopping() {
        let (received, sink) = recorder();
        let (shared, _buffer) = fake_stream(SMALL, accept_submit, sink);

        shared.ledger().begin_stop();
        // A transfer may still complete normally after its cancel request.
        let xfer = finish(&shared, 0, LIBUSB_TRANSFER_COMPLETED as c_int, &[4, 4, 4]);
        shared.on_transfer(xfer);
        let xfer = finish(&shared, 1, LIBUSB_TRANSFER_CANCELLED as c_int, &[]);
        shared.on_transfer(xfer);

        assert!(received.lock().unwrap().is_empty());
        assert!(shared.ledger().is_drained());
        assert!(!shared.device_dead.load(Ordering::Acquire));
    }

    #[test]
    fn test_device_lost_during_delivery_retires_slot() {
        let dead = Arc::new(AtomicBool::new(false));
        let dead_in_sink = dead.clone();
        let (mut shared, _buffer) = fake_stream(SMALL, accept_submit, move |_: &[u8]| {
            dead_in_sink.store(true, Ordering::Release);
        });
        shared.device_dead = dead;

        let xfer = finish(&shared, 0, LIBUSB_TRANSFER_COMPLETED as c_int, &[1, 0, 0]);
        shared.on_transfer(xfer);
        // Delivered, then InCallback went straight to Retired.
        assert_eq!(shared.ledger().state(0), SlotState::Retired);
        assert_eq!(shared.ledger().state(1), SlotState::Submitted);
    }

    #[test]
    fn test_completion_on_dead_session_still_delivers() {
        let (received, sink) = recorder();
        let (shared, _buffer) = fake_stream(SMALL, accept_submit, sink);
        shared.device_dead.store(true, Ordering::Release);

        let xfer = finish(&shared, 0, LIBUSB_TRANSFER_COMPLETED as c_int, &[2, 0, 0]);
        shared.on_transfer(xfer);

        assert_eq!(received.lock().unwrap().len(), 3);
        assert_eq!(shared.ledger().state(0), SlotState::Retired);
    }

    #[test]
    fn test_refused_resubmit_retires_slot() {
        let (shared, _buffer) = fake_stream(SMALL, refuse_submit, |_: &[u8]| {});

        let xfer = finish(&shared, 1, LIBUSB_TRANSFER_COMPLETED as c_int, &[0, 0, 0]);
        shared.on_transfer(xfer);
        assert_eq!(shared.ledger().state(1), SlotState::Retired);
        assert_eq!(shared.ledger().dead_xfers(), 1);
        assert!(!shared.device_dead.load(Ordering::Acquire));
    }
}
