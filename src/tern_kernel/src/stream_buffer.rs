//! Stream buffers: byte streams (or length-prefixed message streams) with a
//! receive trigger level.
use core::{fmt, marker::PhantomData, ptr};

use crate::{
    error::{BadIdError, CreateSyncError, ReceiveStreamError, SendStreamError, TimeoutError},
    klock, state, task,
    utils::Init,
    wait::{WaitPayload, WaitQueue},
    Id, KernelTraits, PortThreading, Region, Ticks, NO_WAIT, WAIT_FOREVER,
};

/// The length-prefix header size in message mode.
const MSG_HEADER: usize = core::mem::size_of::<u32>();

/// A circular byte buffer over an application-provided storage region.
#[derive(Clone, Copy)]
pub(crate) struct ByteRing {
    base: *mut u8,
    cap: usize,
    /// Read position.
    head: usize,
    /// Bytes currently stored.
    len: usize,
}

// Safety: the base pointer is only dereferenced under CPU Lock, and the
// region's provider promised exclusivity.
unsafe impl Send for ByteRing {}

impl Init for ByteRing {
    const INIT: Self = Self {
        base: ptr::null_mut(),
        cap: 0,
        head: 0,
        len: 0,
    };
}

impl ByteRing {
    fn new(region: Region) -> Self {
        Self {
            base: region.base(),
            cap: region.len(),
            head: 0,
            len: 0,
        }
    }

    #[inline]
    fn available(&self) -> usize {
        self.len
    }

    #[inline]
    fn space(&self) -> usize {
        self.cap - self.len
    }

    /// Append as much of `src` as fits. Returns the number of bytes copied.
    fn write(&mut self, src: *const u8, len: usize) -> usize {
        let n = len.min(self.space());
        let tail = (self.head + self.len) % self.cap;

        let first = n.min(self.cap - tail);
        // Safety: both spans are in bounds; the ring never aliases `src`
        unsafe {
            ptr::copy_nonoverlapping(src, self.base.add(tail), first);
            ptr::copy_nonoverlapping(src.add(first), self.base, n - first);
        }
        self.len += n;
        n
    }

    /// Remove up to `len` bytes into `dst`. Returns the number of bytes
    /// copied.
    fn read(&mut self, dst: *mut u8, len: usize) -> usize {
        let n = len.min(self.len);

        let first = n.min(self.cap - self.head);
        // Safety: both spans are in bounds; the ring never aliases `dst`
        unsafe {
            ptr::copy_nonoverlapping(self.base.add(self.head), dst, first);
            ptr::copy_nonoverlapping(self.base, dst.add(first), n - first);
        }
        self.head = (self.head + n) % self.cap;
        self.len -= n;
        n
    }

    /// Read the message header at the current head without consuming it.
    /// Only meaningful in message mode, where writes are all-or-nothing.
    fn peek_header(&self) -> Option<usize> {
        if self.len < MSG_HEADER {
            return None;
        }
        let mut header = [0u8; MSG_HEADER];
        let mut pos = self.head;
        for byte in header.iter_mut() {
            // Safety: `pos` stays in bounds
            *byte = unsafe { self.base.add(pos).read() };
            pos = (pos + 1) % self.cap;
        }
        Some(u32::from_le_bytes(header) as usize)
    }

    /// Discard `len` bytes.
    fn skip(&mut self, len: usize) {
        let n = len.min(self.len);
        self.head = (self.head + n) % self.cap;
        self.len -= n;
    }
}

/// *Stream buffer control block* - the state data of a stream buffer.
#[doc(hidden)]
pub struct StreamBufferCb<Traits: PortThreading> {
    pub(super) live: klock::CpuLockCell<Traits, bool>,

    pub(super) ring: klock::CpuLockCell<Traits, ByteRing>,

    /// A receiver unblocks once this many bytes are available.
    pub(super) trigger: klock::CpuLockCell<Traits, usize>,

    /// Message mode: sends are framed with a length prefix and receives
    /// return whole messages.
    pub(super) message_mode: klock::CpuLockCell<Traits, bool>,

    pub(super) send_wait: WaitQueue<Traits>,
    pub(super) recv_wait: WaitQueue<Traits>,

    pub(super) ops: klock::CpuLockCell<Traits, u32>,
    pub(super) timeouts: klock::CpuLockCell<Traits, u32>,
}

impl<Traits: PortThreading> Init for StreamBufferCb<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        live: Init::INIT,
        ring: Init::INIT,
        trigger: Init::INIT,
        message_mode: Init::INIT,
        send_wait: Init::INIT,
        recv_wait: Init::INIT,
        ops: Init::INIT,
        timeouts: Init::INIT,
    };
}

impl<Traits: KernelTraits> fmt::Debug for StreamBufferCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("StreamBufferCb")
            .field("self", &(self as *const _))
            .field("trigger", &self.trigger)
            .finish_non_exhaustive()
    }
}

/// An owned handle to a stream buffer.
pub struct StreamBuffer<Traits> {
    id: Id,
    _phantom: PhantomData<Traits>,
}

impl<Traits> Clone for StreamBuffer<Traits> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<Traits> Copy for StreamBuffer<Traits> {}

impl<Traits> fmt::Debug for StreamBuffer<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("StreamBuffer").field(&self.id).finish()
    }
}

impl<Traits: KernelTraits> StreamBuffer<Traits> {
    pub const fn from_id(id: Id) -> Self {
        Self {
            id,
            _phantom: PhantomData,
        }
    }

    pub const fn id(&self) -> Id {
        self.id
    }

    /// Create a byte-stream buffer over `storage`. A receive completes once
    /// `trigger_level` bytes are available (or its timeout fires).
    pub fn create(storage: Region, trigger_level: usize) -> Result<Self, CreateSyncError> {
        create::<Traits>(storage, trigger_level, false)
    }

    /// Create a message-mode buffer: every send is framed with a length
    /// prefix and every receive returns one whole message.
    pub fn create_message_mode(storage: Region) -> Result<Self, CreateSyncError> {
        create::<Traits>(storage, 1, true)
    }

    /// Send bytes, blocking while no space at all is free. Returns the
    /// number of bytes accepted, which can fall short of `data.len()` on
    /// timeout.
    pub fn send(&self, data: &[u8], timeout: Ticks) -> Result<usize, SendStreamError> {
        send::<Traits>(self.id, data, timeout)
    }

    /// An interrupt-safe, never-blocking [`Self::send`].
    pub fn send_isr(&self, data: &[u8]) -> Result<usize, SendStreamError> {
        send::<Traits>(self.id, data, NO_WAIT)
    }

    /// Receive bytes (or one whole message in message mode), blocking until
    /// the trigger level is reached or the timeout fires. Returns the
    /// number of bytes delivered.
    pub fn receive(&self, buffer: &mut [u8], timeout: Ticks) -> Result<usize, ReceiveStreamError> {
        receive::<Traits>(self.id, buffer, timeout)
    }

    /// Bytes currently stored.
    pub fn bytes_available(&self) -> Result<usize, BadIdError> {
        let mut lock = klock::lock_cpu::<Traits>().map_err(|_| BadIdError::BadId)?;
        let cb = stream_buffer_cb::<Traits>(self.id, lock.borrow_mut())?;
        Ok(cb.ring.read(&*lock).available())
    }
}

fn stream_buffer_cb<Traits: KernelTraits>(
    id: Id,
    lock: klock::CpuLockTokenRefMut<'_, Traits>,
) -> Result<&'static StreamBufferCb<Traits>, BadIdError> {
    Traits::get_stream_buffer_cb(id.get() - 1)
        .filter(|cb| cb.live.get(&*lock))
        .ok_or_else(crate::bad_id::<Traits>)
}

fn create<Traits: KernelTraits>(
    storage: Region,
    trigger_level: usize,
    message_mode: bool,
) -> Result<StreamBuffer<Traits>, CreateSyncError> {
    if storage.is_null() || storage.len() == 0 {
        return Err(CreateSyncError::BadParam);
    }
    if trigger_level == 0 || trigger_level > storage.len() {
        return Err(CreateSyncError::BadParam);
    }

    let mut lock = klock::lock_cpu::<Traits>()?;

    let (i, cb) = Traits::stream_buffer_cb_pool()
        .iter()
        .enumerate()
        .find(|(_, cb)| !cb.live.get(&*lock))
        .ok_or(CreateSyncError::PoolExhausted)?;

    cb.ring.replace(&mut *lock, ByteRing::new(storage));
    cb.trigger.replace(&mut *lock, trigger_level);
    cb.message_mode.replace(&mut *lock, message_mode);
    cb.ops.replace(&mut *lock, 0);
    cb.timeouts.replace(&mut *lock, 0);
    cb.live.replace(&mut *lock, true);

    Ok(StreamBuffer::from_id(Id::new(i + 1).unwrap()))
}

/// Whether a parked receiver can complete right now.
fn receive_ready<Traits: KernelTraits>(
    cb: &StreamBufferCb<Traits>,
    lock: klock::CpuLockTokenRefMut<'_, Traits>,
) -> bool {
    let ring = cb.ring.read(&*lock);
    if cb.message_mode.get(&*lock) {
        ring.peek_header().is_some()
    } else {
        ring.available() >= cb.trigger.get(&*lock)
    }
}

/// Deliver buffered bytes to parked receivers, most urgent first, while
/// their conditions hold.
fn service_receivers<Traits: KernelTraits>(
    cb: &'static StreamBufferCb<Traits>,
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
) -> bool {
    let mut woke_any = false;

    while receive_ready(cb, lock.borrow_mut()) {
        let Some(receiver) = cb.recv_wait.first_waiting_task(lock.borrow_mut()) else {
            break;
        };
        let WaitPayload::StreamReceive { dst, cap, .. } = receiver.wait.payload.get(&*lock)
        else {
            unreachable!()
        };

        let got = copy_out(cb, lock.borrow_mut(), dst, cap);

        receiver
            .wait
            .payload
            .replace(&mut *lock, WaitPayload::StreamReceive { dst, cap, got });
        let woke = cb.recv_wait.wake_up_one(lock.borrow_mut());
        debug_assert!(woke);
        woke_any = true;
    }

    woke_any
}

/// Move bytes from parked senders into freed ring space, most urgent
/// sender first. A sender is only completed once its whole request has been
/// accepted; a partially-drained sender stays parked at the head.
fn service_senders<Traits: KernelTraits>(
    cb: &'static StreamBufferCb<Traits>,
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
) -> bool {
    let mut woke_any = false;

    loop {
        if cb.ring.read(&*lock).space() == 0 {
            break;
        }
        let Some(sender) = cb.send_wait.first_waiting_task(lock.borrow_mut()) else {
            break;
        };
        let WaitPayload::StreamSend { src, len, written } = sender.wait.payload.get(&*lock)
        else {
            unreachable!()
        };

        let remaining = len - written;
        let accepted = if cb.message_mode.get(&*lock) {
            // Message mode is all-or-nothing: wait for room for the whole
            // frame
            if cb.ring.read(&*lock).space() < MSG_HEADER + remaining {
                break;
            }
            write_framed(cb, lock.borrow_mut(), src, remaining);
            remaining
        } else {
            let ring = cb.ring.write(&mut *lock);
            // Safety: `src + written` stays within the parked sender's live
            // buffer
            unsafe { ring.write(src.add(written), remaining) }
        };

        sender.wait.payload.replace(
            &mut *lock,
            WaitPayload::StreamSend {
                src,
                len,
                written: written + accepted,
            },
        );

        if written + accepted == len {
            let woke = cb.send_wait.wake_up_one(lock.borrow_mut());
            debug_assert!(woke);
            woke_any = true;
        }
    }

    woke_any
}

/// Copy out one receive's worth of data: up to `cap` bytes, or one whole
/// message in message mode.
fn copy_out<Traits: KernelTraits>(
    cb: &StreamBufferCb<Traits>,
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    dst: *mut u8,
    cap: usize,
) -> usize {
    if cb.message_mode.get(&*lock) {
        let ring = cb.ring.write(&mut *lock);
        let Some(msg_len) = ring.peek_header() else {
            return 0;
        };
        if msg_len > cap {
            // The receiver's buffer can't hold the message; leave it queued
            return 0;
        }
        ring.skip(MSG_HEADER);
        ring.read(dst, msg_len)
    } else {
        cb.ring.write(&mut *lock).read(dst, cap)
    }
}

fn write_framed<Traits: KernelTraits>(
    cb: &StreamBufferCb<Traits>,
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    src: *const u8,
    len: usize,
) {
    let header = (len as u32).to_le_bytes();
    let ring = cb.ring.write(&mut *lock);
    debug_assert!(ring.space() >= MSG_HEADER + len);
    ring.write(header.as_ptr(), MSG_HEADER);
    ring.write(src, len);
}

fn send<Traits: KernelTraits>(
    id: Id,
    data: &[u8],
    timeout: Ticks,
) -> Result<usize, SendStreamError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    if timeout != NO_WAIT {
        lock = state::expect_waitable_context::<Traits>(lock)?;
    }
    let cb = stream_buffer_cb::<Traits>(id, lock.borrow_mut())?;

    cb.ops.replace_with(&mut *lock, |x| x.wrapping_add(1));

    let message_mode = cb.message_mode.get(&*lock);
    if message_mode && MSG_HEADER + data.len() > cb.ring.read(&*lock).cap {
        return Err(SendStreamError::MessageTooLarge);
    }

    // Accept what fits, letting parked receivers drain the ring between
    // attempts (delivering to a receiver frees space for more of `data`)
    let mut written = 0;
    let mut woke_any = false;
    loop {
        let accepted = if message_mode {
            if written == 0 && cb.ring.read(&*lock).space() >= MSG_HEADER + data.len() {
                write_framed(cb, lock.borrow_mut(), data.as_ptr(), data.len());
                data.len()
            } else {
                0
            }
        } else {
            // Safety: `data.as_ptr() + written` stays within `data`
            let src = unsafe { data.as_ptr().add(written) };
            cb.ring.write(&mut *lock).write(src, data.len() - written)
        };
        written += accepted;

        woke_any |= service_receivers(cb, lock.borrow_mut());
        if accepted == 0 || written == data.len() {
            break;
        }
    }

    if written == data.len() || timeout == NO_WAIT {
        if woke_any {
            task::unlock_cpu_and_check_preemption(lock);
        }
        return Ok(written);
    }

    // Park until the rest has been accepted. Receivers drain the ring and
    // move our remaining bytes in as space appears.
    let payload = WaitPayload::StreamSend {
        src: data.as_ptr(),
        len: data.len(),
        written,
    };
    let result = if timeout == WAIT_FOREVER {
        Ok(cb.send_wait.wait(lock.borrow_mut(), payload))
    } else {
        cb.send_wait.wait_timeout(lock.borrow_mut(), payload, timeout)
    };

    match result {
        Ok(WaitPayload::StreamSend { written, .. }) => Ok(written),
        Ok(_) => unreachable!(),
        Err(TimeoutError::Timeout) => {
            cb.timeouts.replace_with(&mut *lock, |x| x.wrapping_add(1));
            let WaitPayload::StreamSend { written, .. } =
                task::running_task_on_current_core::<Traits>(lock.borrow_mut())
                    .unwrap()
                    .wait
                    .payload
                    .get(&*lock)
            else {
                unreachable!()
            };
            if written > 0 {
                Ok(written)
            } else {
                Err(SendStreamError::Timeout)
            }
        }
    }
}

fn receive<Traits: KernelTraits>(
    id: Id,
    buffer: &mut [u8],
    timeout: Ticks,
) -> Result<usize, ReceiveStreamError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    if timeout != NO_WAIT {
        lock = state::expect_waitable_context::<Traits>(lock)?;
    }
    let cb = stream_buffer_cb::<Traits>(id, lock.borrow_mut())?;

    cb.ops.replace_with(&mut *lock, |x| x.wrapping_add(1));

    let message_mode = cb.message_mode.get(&*lock);

    if message_mode {
        if let Some(msg_len) = cb.ring.read(&*lock).peek_header() {
            if msg_len > buffer.len() {
                return Err(ReceiveStreamError::BadParam);
            }
        }
    }

    if receive_ready(cb, lock.borrow_mut()) {
        let got = copy_out(cb, lock.borrow_mut(), buffer.as_mut_ptr(), buffer.len());
        if service_senders(cb, lock.borrow_mut()) {
            task::unlock_cpu_and_check_preemption(lock);
        }
        return Ok(got);
    }

    if timeout == NO_WAIT {
        // Below the trigger level: hand over whatever is buffered
        let got = copy_out_partial(cb, lock.borrow_mut(), buffer);
        return if got > 0 {
            Ok(got)
        } else {
            Err(ReceiveStreamError::Timeout)
        };
    }

    let payload = WaitPayload::StreamReceive {
        dst: buffer.as_mut_ptr(),
        cap: buffer.len(),
        got: 0,
    };
    let result = if timeout == WAIT_FOREVER {
        Ok(cb.recv_wait.wait(lock.borrow_mut(), payload))
    } else {
        cb.recv_wait.wait_timeout(lock.borrow_mut(), payload, timeout)
    };

    let got = match result {
        Ok(WaitPayload::StreamReceive { got, .. }) => got,
        Ok(_) => unreachable!(),
        Err(TimeoutError::Timeout) => {
            cb.timeouts.replace_with(&mut *lock, |x| x.wrapping_add(1));
            // The trigger level was never reached; deliver the partial
            // contents
            copy_out_partial(cb, lock.borrow_mut(), buffer)
        }
    };

    if got > 0 && service_senders(cb, lock.borrow_mut()) {
        task::unlock_cpu_and_check_preemption(lock);
        return Ok(got);
    }

    if got == 0 {
        Err(ReceiveStreamError::Timeout)
    } else {
        Ok(got)
    }
}

/// Byte-mode partial delivery used on timeout and for non-blocking
/// receives. In message mode a partial message never exists, so this only
/// returns whole messages too.
fn copy_out_partial<Traits: KernelTraits>(
    cb: &StreamBufferCb<Traits>,
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    buffer: &mut [u8],
) -> usize {
    if cb.message_mode.get(&*lock) {
        if cb.ring.read(&*lock).peek_header().is_some() {
            copy_out(cb, lock.borrow_mut(), buffer.as_mut_ptr(), buffer.len())
        } else {
            0
        }
    } else {
        cb.ring
            .write(&mut *lock)
            .read(buffer.as_mut_ptr(), buffer.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring_of(cap: usize) -> (ByteRing, Vec<u8>) {
        let mut backing = vec![0u8; cap];
        let ring = ByteRing {
            base: backing.as_mut_ptr(),
            cap,
            head: 0,
            len: 0,
        };
        (ring, backing)
    }

    #[test]
    fn write_then_read_round_trips() {
        let (mut ring, _backing) = ring_of(8);
        assert_eq!(ring.write(b"hello".as_ptr(), 5), 5);
        assert_eq!(ring.available(), 5);
        assert_eq!(ring.space(), 3);

        let mut out = [0u8; 5];
        assert_eq!(ring.read(out.as_mut_ptr(), 5), 5);
        assert_eq!(&out, b"hello");
        assert_eq!(ring.available(), 0);
    }

    #[test]
    fn write_wraps_around() {
        let (mut ring, _backing) = ring_of(8);
        assert_eq!(ring.write(b"abcdef".as_ptr(), 6), 6);
        let mut out = [0u8; 4];
        assert_eq!(ring.read(out.as_mut_ptr(), 4), 4);

        // The next write crosses the physical end of the buffer
        assert_eq!(ring.write(b"wxyz".as_ptr(), 4), 4);
        assert_eq!(ring.available(), 6);

        let mut out = [0u8; 6];
        assert_eq!(ring.read(out.as_mut_ptr(), 6), 6);
        assert_eq!(&out, b"efwxyz");
    }

    #[test]
    fn write_is_clamped_to_space() {
        let (mut ring, _backing) = ring_of(4);
        assert_eq!(ring.write(b"abcdef".as_ptr(), 6), 4);
        assert_eq!(ring.space(), 0);
        assert_eq!(ring.write(b"x".as_ptr(), 1), 0);
    }

    #[test]
    fn header_peek_and_skip() {
        let (mut ring, _backing) = ring_of(16);
        assert_eq!(ring.peek_header(), None);

        let header = 3u32.to_le_bytes();
        ring.write(header.as_ptr(), 4);
        ring.write(b"abc".as_ptr(), 3);

        assert_eq!(ring.peek_header(), Some(3));
        ring.skip(4);
        let mut out = [0u8; 3];
        assert_eq!(ring.read(out.as_mut_ptr(), 3), 3);
        assert_eq!(&out, b"abc");
    }

    #[test]
    fn header_peek_wraps() {
        let (mut ring, _backing) = ring_of(8);
        // Move the head close to the end
        ring.write(b"xxxxxx".as_ptr(), 6);
        ring.skip(6);

        let header = 2u32.to_le_bytes();
        ring.write(header.as_ptr(), 4);
        ring.write(b"hi".as_ptr(), 2);
        assert_eq!(ring.peek_header(), Some(2));
    }
}

/// Per-object operation counters: `(operations, timed-out waits)`.
pub fn streambuffer_stats<Traits: KernelTraits>(
    object: &StreamBuffer<Traits>,
) -> Result<(u32, u32), BadIdError> {
    let mut lock = klock::lock_cpu::<Traits>().map_err(|_| BadIdError::BadId)?;
    let cb = stream_buffer_cb::<Traits>(object.id(), lock.borrow_mut())?;
    Ok((cb.ops.get(&*lock), cb.timeouts.get(&*lock)))
}
