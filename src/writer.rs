//! `DataLog`: the mutex/condvar-guarded producer API and the background
//! flusher thread.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};

use crate::buffer::{Block, BufferPool};
use crate::codec::{self, CONTROL_FINISH, CONTROL_SET_METADATA, CONTROL_START};
use crate::config::{WriterConfig, RECORD_MAX_HEADER_SIZE};
use crate::registry::{EntryRegistry, StartOutcome};
use crate::sink::{make_random_filename, CallbackSink, FileSink, Sink};

/// Monotonic microsecond clock: the writer's own free-running time
/// source, consulted only when a caller passes `timestamp_us == 0`
/// ("now").
fn monotonic_now_us() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    let epoch = EPOCH.get_or_init(Instant::now);
    epoch.elapsed().as_micros() as u64
}

fn resolve_timestamp(timestamp_us: u64) -> u64 {
    if timestamp_us == 0 {
        monotonic_now_us()
    } else {
        timestamp_us
    }
}

struct SharedState {
    registry: EntryRegistry,
    pool: BufferPool,
    paused: bool,
    active: bool,
    do_flush: bool,
    new_filename: Option<String>,
    /// Set by the flusher thread if it could never open a log file (no
    /// free space, or every randomized filename was already taken).
    open_failed: bool,
}

impl SharedState {
    fn write_header(&mut self, entry_id: u32, timestamp_us: u64, payload_len: usize) -> bool {
        let (buf, outcome) = self.pool.reserve(RECORD_MAX_HEADER_SIZE);
        let header_len = codec::write_header(buf, entry_id, timestamp_us, payload_len as u32);
        self.pool.unreserve_tail(RECORD_MAX_HEADER_SIZE - header_len);
        outcome.overflowed
    }

    /// Writes `data`, splitting across block boundaries as needed.
    fn write_payload(&mut self, mut data: &[u8], block_size: usize) -> bool {
        let mut overflowed = false;
        while data.len() > block_size {
            let (buf, outcome) = self.pool.reserve(block_size);
            buf.copy_from_slice(&data[..block_size]);
            overflowed |= outcome.overflowed;
            data = &data[block_size..];
        }
        let (buf, outcome) = self.pool.reserve(data.len());
        buf.copy_from_slice(data);
        overflowed |= outcome.overflowed;
        overflowed
    }

    fn latch_overflow_if(&mut self, overflowed: bool) {
        if overflowed && !self.paused {
            log::error!(
                "outgoing buffers exceeded threshold, pausing logging -- \
                 consider flushing to disk more frequently (smaller period)"
            );
            self.paused = true;
        }
    }
}

/// Shared between the `DataLog` handle and the flusher thread.
struct Inner {
    state: Mutex<SharedState>,
    cond: Condvar,
    config: WriterConfig,
}

impl Inner {
    fn notify(&self) {
        self.cond.notify_all();
    }
}

/// The append-only WPILOG writer. Construct with [`DataLog::open_file`] or
/// [`DataLog::open_callback`]; closes and drains on [`Drop`].
pub struct DataLog {
    inner: Arc<Inner>,
    thread: Option<JoinHandle<()>>,
}

enum SinkTarget {
    File {
        dir: Utf8PathBuf,
        initial_filename: String,
    },
    Callback(CallbackSink),
}

impl DataLog {
    /// Starts a logger writing to `dir/filename` (or a randomly generated
    /// filename if `filename` is empty), flushing at `config.period`.
    #[must_use]
    pub fn open_file(
        dir: impl Into<Utf8PathBuf>,
        filename: impl Into<String>,
        extra_header: impl Into<String>,
        config: WriterConfig,
    ) -> Self {
        let dir = dir.into();
        let initial_filename = filename.into();
        let target = SinkTarget::File {
            dir,
            initial_filename,
        };
        Self::spawn(target, extra_header.into(), config)
    }

    /// Starts a logger invoking `write_fn(bytes)` on the flusher thread
    /// for each batch of data, flushing at `config.period`.
    #[must_use]
    pub fn open_callback(
        write_fn: impl FnMut(&[u8]) + Send + 'static,
        extra_header: impl Into<String>,
        config: WriterConfig,
    ) -> Self {
        let target = SinkTarget::Callback(CallbackSink::new(write_fn));
        Self::spawn(target, extra_header.into(), config)
    }

    fn spawn(target: SinkTarget, extra_header: String, config: WriterConfig) -> Self {
        let state = SharedState {
            registry: EntryRegistry::new(),
            pool: BufferPool::new(config.block_size, config.max_outgoing, config.max_free),
            paused: false,
            active: true,
            do_flush: false,
            new_filename: None,
            open_failed: false,
        };
        let inner = Arc::new(Inner {
            state: Mutex::new(state),
            cond: Condvar::new(),
            config,
        });

        let thread_inner = inner.clone();
        let thread = std::thread::Builder::new()
            .name("wpilog-flusher".into())
            .spawn(move || match target {
                SinkTarget::File {
                    dir,
                    initial_filename,
                } => run_file_flusher(&thread_inner, &dir, initial_filename, &extra_header),
                SinkTarget::Callback(sink) => run_callback_flusher(&thread_inner, sink, &extra_header),
            })
            .expect("failed to spawn flusher thread");

        Self {
            inner,
            thread: Some(thread),
        }
    }

    /// Requests that the log file be renamed on the next flush.
    pub fn set_filename(&self, filename: impl Into<String>) {
        {
            let mut state = self.inner.state.lock().unwrap();
            state.new_filename = Some(filename.into());
        }
        self.inner.notify();
    }

    /// Requests an immediate flush.
    pub fn flush(&self) {
        {
            let mut state = self.inner.state.lock().unwrap();
            state.do_flush = true;
        }
        self.inner.notify();
    }

    /// Suppresses all data records until [`DataLog::resume`] is called.
    pub fn pause(&self) {
        self.inner.state.lock().unwrap().paused = true;
    }

    /// Clears a user- or overflow-latched pause.
    pub fn resume(&self) {
        self.inner.state.lock().unwrap().paused = false;
    }

    /// Registers (or re-registers) `name` with the given `type` and
    /// `metadata`. Returns the entry id (`> 0`) on success, or `0` if
    /// `name` is already registered under a different type.
    pub fn start(
        &self,
        name: &str,
        ty: &str,
        metadata: &str,
        timestamp_us: u64,
    ) -> u32 {
        let ts = resolve_timestamp(timestamp_us);
        let mut state = self.inner.state.lock().unwrap();
        match state.registry.start(name, ty) {
            StartOutcome::TypeConflict => {
                log::error!(
                    "type mismatch for '{name}': requested '{ty}' conflicts with prior \
                     registration; ignoring"
                );
                0
            }
            StartOutcome::AlreadyLive { id } => id,
            StartOutcome::Emit { id } => {
                let payload_len = 5 + 12 + name.len() + ty.len() + metadata.len();
                let overflowed = state.write_header(0, ts, payload_len);
                let block_size = self.inner.config.block_size;
                let mut o2 = state.write_payload(&[CONTROL_START], block_size);
                o2 |= state.write_payload(&id.to_le_bytes(), block_size);
                o2 |= write_length_prefixed_string(&mut state, name, block_size);
                o2 |= write_length_prefixed_string(&mut state, ty, block_size);
                o2 |= write_length_prefixed_string(&mut state, metadata, block_size);
                state.latch_overflow_if(overflowed || o2);
                id
            }
        }
    }

    /// Releases one registration of `id`. Emits a Finish control record
    /// once the live count reaches zero.
    pub fn finish(&self, id: u32, timestamp_us: u64) {
        if id == 0 {
            return;
        }
        let ts = resolve_timestamp(timestamp_us);
        let mut state = self.inner.state.lock().unwrap();
        if !state.registry.finish(id) {
            return;
        }
        let block_size = self.inner.config.block_size;
        let overflowed = state.write_header(0, ts, 5);
        let mut o2 = state.write_payload(&[CONTROL_FINISH], block_size);
        o2 |= state.write_payload(&id.to_le_bytes(), block_size);
        state.latch_overflow_if(overflowed || o2);
    }

    /// Emits a SetMetadata control record for `id`.
    pub fn set_metadata(&self, id: u32, metadata: &str, timestamp_us: u64) {
        if id == 0 {
            return;
        }
        let ts = resolve_timestamp(timestamp_us);
        let mut state = self.inner.state.lock().unwrap();
        let payload_len = 5 + 4 + metadata.len();
        let overflowed = state.write_header(0, ts, payload_len);
        let block_size = self.inner.config.block_size;
        let mut o2 = state.write_payload(&[CONTROL_SET_METADATA], block_size);
        o2 |= state.write_payload(&id.to_le_bytes(), block_size);
        o2 |= write_length_prefixed_string(&mut state, metadata, block_size);
        state.latch_overflow_if(overflowed || o2);
    }

    fn with_record<F>(&self, entry_id: u32, timestamp_us: u64, payload_len: usize, write: F)
    where
        F: FnOnce(&mut SharedState, usize),
    {
        if entry_id == 0 {
            return;
        }
        let ts = resolve_timestamp(timestamp_us);
        let mut state = self.inner.state.lock().unwrap();
        if state.paused {
            return;
        }
        let overflowed = state.write_header(entry_id, ts, payload_len);
        let block_size = self.inner.config.block_size;
        write(&mut state, block_size);
        state.latch_overflow_if(overflowed);
    }

    pub fn append_boolean(&self, entry_id: u32, value: bool, timestamp_us: u64) {
        self.with_record(entry_id, timestamp_us, 1, |state, bs| {
            let o = state.write_payload(&codec::encode_bool(value), bs);
            state.latch_overflow_if(o);
        });
    }

    pub fn append_integer(&self, entry_id: u32, value: i64, timestamp_us: u64) {
        self.with_record(entry_id, timestamp_us, 8, |state, bs| {
            let o = state.write_payload(&codec::encode_integer(value), bs);
            state.latch_overflow_if(o);
        });
    }

    pub fn append_float(&self, entry_id: u32, value: f32, timestamp_us: u64) {
        self.with_record(entry_id, timestamp_us, 4, |state, bs| {
            let o = state.write_payload(&codec::encode_float(value), bs);
            state.latch_overflow_if(o);
        });
    }

    pub fn append_double(&self, entry_id: u32, value: f64, timestamp_us: u64) {
        self.with_record(entry_id, timestamp_us, 8, |state, bs| {
            let o = state.write_payload(&codec::encode_double(value), bs);
            state.latch_overflow_if(o);
        });
    }

    pub fn append_string(&self, entry_id: u32, value: &str, timestamp_us: u64) {
        self.append_raw(entry_id, value.as_bytes(), timestamp_us);
    }

    pub fn append_raw(&self, entry_id: u32, data: &[u8], timestamp_us: u64) {
        self.with_record(entry_id, timestamp_us, data.len(), |state, bs| {
            let o = state.write_payload(data, bs);
            state.latch_overflow_if(o);
        });
    }

    pub fn append_boolean_array(&self, entry_id: u32, values: &[bool], timestamp_us: u64) {
        let bytes: Vec<u8> = values.iter().map(|&b| u8::from(b)).collect();
        let len = codec::boolean_array_len(values.len());
        self.with_record(entry_id, timestamp_us, len, |state, bs| {
            let o = state.write_payload(&bytes, bs);
            state.latch_overflow_if(o);
        });
    }

    pub fn append_integer_array(&self, entry_id: u32, values: &[i64], timestamp_us: u64) {
        let len = codec::integer_array_len(values.len());
        self.with_record(entry_id, timestamp_us, len, |state, bs| {
            let o = write_le_array(state, values, bs, i64::to_le_bytes);
            state.latch_overflow_if(o);
        });
    }

    pub fn append_float_array(&self, entry_id: u32, values: &[f32], timestamp_us: u64) {
        let len = codec::float_array_len(values.len());
        self.with_record(entry_id, timestamp_us, len, |state, bs| {
            let o = write_le_array(state, values, bs, f32::to_le_bytes);
            state.latch_overflow_if(o);
        });
    }

    pub fn append_double_array(&self, entry_id: u32, values: &[f64], timestamp_us: u64) {
        let len = codec::double_array_len(values.len());
        self.with_record(entry_id, timestamp_us, len, |state, bs| {
            let o = write_le_array(state, values, bs, f64::to_le_bytes);
            state.latch_overflow_if(o);
        });
    }

    pub fn append_string_array<S: AsRef<str>>(
        &self,
        entry_id: u32,
        values: &[S],
        timestamp_us: u64,
    ) {
        let len = codec::string_array_len(values);
        self.with_record(entry_id, timestamp_us, len, |state, bs| {
            let count = u32::try_from(values.len()).unwrap_or(u32::MAX);
            let mut o = state.write_payload(&count.to_le_bytes(), bs);
            for s in values {
                let s = s.as_ref();
                let slen = u32::try_from(s.len()).unwrap_or(u32::MAX);
                o |= state.write_payload(&slen.to_le_bytes(), bs);
                o |= state.write_payload(s.as_bytes(), bs);
            }
            state.latch_overflow_if(o);
        });
    }
}

/// Converts each element to little-endian bytes explicitly rather than
/// relying on host endianness, so the payload is correct on big-endian
/// targets too.
fn write_le_array<T: Copy, const N: usize>(
    state: &mut SharedState,
    values: &[T],
    block_size: usize,
    to_le: fn(T) -> [u8; N],
) -> bool {
    let mut overflowed = false;
    for v in values {
        overflowed |= state.write_payload(&to_le(*v), block_size);
    }
    overflowed
}

fn write_length_prefixed_string(state: &mut SharedState, s: &str, block_size: usize) -> bool {
    let len = u32::try_from(s.len()).unwrap_or(u32::MAX);
    let mut overflowed = state.write_payload(&len.to_le_bytes(), block_size);
    overflowed |= state.write_payload(s.as_bytes(), block_size);
    overflowed
}

impl DataLog {
    /// Signals shutdown, drains outstanding buffers, and joins the
    /// flusher thread. Returns [`WriterError::ThreadJoin`] if the
    /// flusher panicked. `Drop` calls this and discards the result, so
    /// callers that care about a panicked flusher should call `close`
    /// explicitly instead of letting the handle simply go out of scope.
    pub fn close(mut self) -> Result<(), crate::error::WriterError> {
        self.shutdown_and_join()
    }

    fn shutdown_and_join(&mut self) -> Result<(), crate::error::WriterError> {
        {
            let mut state = self.inner.state.lock().unwrap();
            state.active = false;
            state.do_flush = true;
        }
        self.inner.notify();
        if let Some(thread) = self.thread.take() {
            thread
                .join()
                .map_err(|_| crate::error::WriterError::ThreadJoin)?;
        }
        if self.inner.state.lock().unwrap().open_failed {
            return Err(crate::error::WriterError::FileOpenExhausted);
        }
        Ok(())
    }
}

impl Drop for DataLog {
    fn drop(&mut self) {
        let _ = self.shutdown_and_join();
    }
}

fn file_header_bytes(extra_header: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(12 + extra_header.len());
    out.extend_from_slice(b"WPILOG");
    out.extend_from_slice(&[0x00, 0x01]);
    out.extend_from_slice(&(extra_header.len() as u32).to_le_bytes());
    out.extend_from_slice(extra_header.as_bytes());
    out
}

fn write_blocks_to_sink(sink: &mut impl Sink, blocks: &VecDeque<Block>) -> Result<(), ()> {
    for block in blocks {
        if block.is_empty() {
            continue;
        }
        if sink.write(block.as_bytes()).is_err() {
            log::error!("error writing to log sink; stopping writes for the rest of the run");
            return Err(());
        }
    }
    Ok(())
}

fn recycle_blocks(inner: &Inner, blocks: VecDeque<Block>, blocked: bool) {
    let mut state = inner.state.lock().unwrap();
    if blocked {
        state.paused = true;
    }
    for block in blocks {
        state.pool.recycle(block);
    }
}

/// Waits on the condvar until either `period` elapses (returns `true`,
/// meaning a periodic flush is due) or a shutdown/flush/rename request
/// arrives (returns `false`). Uses `wait_timeout_while` so a request that
/// arrives before this call starts waiting is never missed.
fn wait_for_deadline<'a>(
    inner: &'a Inner,
    guard: std::sync::MutexGuard<'a, SharedState>,
    period: Duration,
) -> (std::sync::MutexGuard<'a, SharedState>, bool) {
    let (guard, timeout_result) = inner
        .cond
        .wait_timeout_while(guard, period, |state| {
            state.active && !state.do_flush && state.new_filename.is_none()
        })
        .unwrap();
    (guard, timeout_result.timed_out())
}

fn run_file_flusher(
    inner: &Arc<Inner>,
    dir: &Utf8Path,
    initial_filename: String,
    extra_header: &str,
) {
    let filename = if initial_filename.is_empty() {
        make_random_filename()
    } else {
        initial_filename
    };

    let mut free_space = FileSink::free_space(dir).unwrap_or(0);
    let mut sink: Option<FileSink> = None;

    if free_space < inner.config.min_free_space {
        log::error!("insufficient free space ({free_space} bytes available), no log being saved");
        inner.state.lock().unwrap().open_failed = true;
    } else {
        let mut filename = filename;
        for attempt in 0..inner.config.filename_retries {
            match FileSink::create_new(dir, &filename) {
                Ok(s) => {
                    log::info!("logging to '{}' ({free_space} bytes free)", dir.join(&filename));
                    sink = Some(s);
                    break;
                }
                Err(e) => {
                    log::error!(
                        "could not open log file '{}' (attempt {attempt}): {e}",
                        dir.join(&filename)
                    );
                    filename = make_random_filename();
                }
            }
        }
        if sink.is_none() {
            log::error!("could not open log file after retries, no log being saved");
            inner.state.lock().unwrap().open_failed = true;
        }
    }

    if let Some(sink) = sink.as_mut() {
        let _ = sink.write(&file_header_bytes(extra_header));
    }

    let mut write_disabled = false;
    let mut free_space_counter: u32 = 0;

    let mut guard = inner.state.lock().unwrap();
    loop {
        let timed_out;
        (guard, timed_out) = wait_for_deadline(inner, guard, inner.config.period);

        if let Some(new_name) = guard.new_filename.take() {
            if let Some(sink) = sink.as_mut() {
                drop(guard);
                match sink.rename(&new_name) {
                    Ok(()) => log::info!("renamed log file to '{new_name}'"),
                    Err(e) => log::error!("could not rename log file to '{new_name}': {e}"),
                }
                guard = inner.state.lock().unwrap();
            }
            // if no file is open yet, the rename request is silently
            // discarded.
        }

        let should_flush = timed_out || guard.do_flush;
        guard.do_flush = false;

        if should_flush && !guard.pool.outgoing.is_empty() {
            let to_write = guard.pool.swap_outgoing();
            drop(guard);

            let mut blocked = false;
            if let Some(sink) = sink.as_mut() {
                if !write_disabled {
                    free_space_counter += 1;
                    if free_space_counter >= inner.config.free_space_resample_every {
                        free_space_counter = 0;
                        free_space = FileSink::free_space(dir).unwrap_or(free_space);
                    }

                    'write: for block in &to_write {
                        if block.is_empty() {
                            continue;
                        }
                        let needed = block.len() as u64;
                        if free_space < needed + inner.config.min_free_space {
                            log::error!(
                                "stopped logging due to low free space ({free_space} bytes available)"
                            );
                            blocked = true;
                            break 'write;
                        }
                        if sink.write(block.as_bytes()).is_err() {
                            log::error!(
                                "error writing to log file; stopping writes for the rest of the run"
                            );
                            write_disabled = true;
                            break 'write;
                        }
                        free_space -= needed;
                    }
                }
                if let Err(e) = sink.sync() {
                    log::warn!("could not sync log file to storage: {e}");
                }
            }

            recycle_blocks(inner, to_write, blocked);
            guard = inner.state.lock().unwrap();
        }

        if !guard.active {
            break;
        }
    }

    drop(guard);
}

fn run_callback_flusher(inner: &Arc<Inner>, mut sink: CallbackSink, extra_header: &str) {
    let _ = sink.write(&file_header_bytes(extra_header));

    let mut guard = inner.state.lock().unwrap();
    loop {
        let timed_out;
        (guard, timed_out) = wait_for_deadline(inner, guard, inner.config.period);

        let should_flush = timed_out || guard.do_flush;
        guard.do_flush = false;

        if should_flush && !guard.pool.outgoing.is_empty() {
            let to_write = guard.pool.swap_outgoing();
            drop(guard);
            let _ = write_blocks_to_sink(&mut sink, &to_write);
            recycle_blocks(inner, to_write, false);
            guard = inner.state.lock().unwrap();
        }

        if !guard.active {
            break;
        }
    }
    drop(guard);

    // EOF sentinel.
    let _ = sink.write(&[]);
}
