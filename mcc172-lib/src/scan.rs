//! Analog input scans: the acquisition controller, the background producer
//! and the consumer read path.
//!
//! A scan owns one producer thread. The producer polls the device status,
//! pulls raw 24-bit samples in bounded bursts, converts and calibrates
//! them, and appends them to the session ring. The application thread is
//! the only consumer. The two sides share nothing but the ring and a set of
//! atomic flags; ordering is acquire/release on every state transition, so
//! a consumer that sees `thread_running == false` with an empty ring is
//! guaranteed no further samples will appear.

use crate::constants::{
    Command, Options, ScanStatus, LSB_SIZE, MAX_SAMPLES_READ, MAX_SCAN_BUFFER_SIZE_SAMPLES,
    NUM_CHANNELS, SAMPLE_SIZE_BYTES,
};
use crate::device::{DeviceShared, Mcc172, CONFIG_TIMEOUT};
use crate::error::{Error, Result};
use crate::ring::SampleRing;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Producer poll floor in microseconds.
const MIN_SLEEP_US: u64 = 200;

/// Producer sleep while waiting for the external trigger.
const TRIG_SLEEP_US: u64 = 1000;

/// Consumer poll interval.
const READ_SLEEP: Duration = Duration::from_micros(100);

/// Clock rendezvous poll interval. Two boards sharing a clock must both
/// arrive before either reports sync, so this poll has no deadline.
const SYNC_POLL: Duration = Duration::from_millis(100);

const STATUS_TIMEOUT: Duration = Duration::from_millis(1);
const STATUS_RETRY: Duration = Duration::from_micros(20);
const DATA_TIMEOUT: Duration = Duration::from_millis(40);
const DATA_RETRY: Duration = Duration::from_micros(1);

// Device status byte bits.
const DEV_RUNNING: u8 = 0x01;
const DEV_HW_OVERRUN: u8 = 0x02;
const DEV_TRIGGERED: u8 = 0x04;

// Trigger-enable bit folded into the channel mask on scan start.
const MASK_TRIGGER_ENABLE: u8 = 0x04;

/// State shared between the producer thread and the consumer.
pub(crate) struct ScanShared {
    pub ring: SampleRing,
    pub read_threshold: u16,
    pub options: Options,
    pub channel_count: u8,
    pub channels: Vec<u8>,
    pub slopes: Vec<f64>,
    pub offsets: Vec<f64>,
    pub samples_transferred: AtomicU64,
    pub hw_overrun: AtomicBool,
    pub buffer_overrun: AtomicBool,
    pub thread_running: AtomicBool,
    pub stop_thread: AtomicBool,
    pub triggered: AtomicBool,
    pub scan_running: AtomicBool,
}

impl ScanShared {
    fn status_bits(&self) -> ScanStatus {
        let mut status = ScanStatus::default();
        if self.hw_overrun.load(Ordering::Acquire) {
            status = status | ScanStatus::HW_OVERRUN;
        }
        if self.buffer_overrun.load(Ordering::Acquire) {
            status = status | ScanStatus::BUFFER_OVERRUN;
        }
        if self.triggered.load(Ordering::Acquire) {
            status = status | ScanStatus::TRIGGERED;
        }
        if self.scan_running.load(Ordering::Acquire) {
            status = status | ScanStatus::RUNNING;
        }
        status
    }
}

/// One active scan: the producer thread handle plus the shared state.
pub(crate) struct ScanSession {
    thread: Option<JoinHandle<()>>,
    pub shared: Arc<ScanShared>,
}

/// Clears the arming flag on every exit path out of `a_in_scan_start`.
struct ArmingGuard<'a>(&'a AtomicBool);

impl Drop for ArmingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Result of [`Mcc172::a_in_scan_read`] and [`Mcc172::a_in_scan_status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanRead {
    /// Scan state bits at the time of the call.
    pub status: ScanStatus,
    /// Samples per channel delivered into the caller's buffer (for
    /// `a_in_scan_status`, the samples per channel available to read).
    pub samples_read_per_channel: u32,
}

fn normalize(count: u32, channel_count: u32) -> u32 {
    (count / channel_count) * channel_count
}

impl Mcc172 {
    /// Start an analog input scan.
    ///
    /// `channel_mask` selects the inputs (bit 0 = channel 0); samples are
    /// interleaved in ascending channel order. `samples_per_channel` sizes a
    /// finite scan, or (with [`Options::CONTINUOUS`]) only raises the ring
    /// floor. Waits for clock sync before arming, which can take a while
    /// when two boards share a clock; configuration writes and further scan
    /// starts fail with [`Error::Busy`] for the whole wait.
    pub fn a_in_scan_start(
        &self,
        channel_mask: u8,
        samples_per_channel: u32,
        options: Options,
    ) -> Result<()> {
        if channel_mask == 0 || channel_mask >= 1 << NUM_CHANNELS {
            return Err(Error::BadParameter("channel mask out of range"));
        }
        if samples_per_channel == 0 && !options.contains(Options::CONTINUOUS) {
            return Err(Error::BadParameter("finite scan needs a sample count"));
        }

        // Claim the arming slot. The session mutex is not held across the
        // clock rendezvous below; the flag is what makes concurrent config
        // writers observe Busy for the whole arming window instead of
        // stalling on the mutex.
        {
            let scan_guard = self.dev.scan.lock().unwrap();
            if scan_guard.is_some()
                || self
                    .dev
                    .arming
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
            {
                return Err(Error::Busy);
            }
        }
        let _arming = ArmingGuard(&self.dev.arming);

        // Snapshot the active channels and their coefficients in ascending
        // index order; the producer calibrates against this snapshot.
        let mut channels = Vec::new();
        let mut slopes = Vec::new();
        let mut offsets = Vec::new();
        {
            let state = self.dev.state.lock().unwrap();
            for channel in 0..NUM_CHANNELS as u8 {
                if channel_mask & (1 << channel) != 0 {
                    channels.push(channel);
                    slopes.push(state.factory.slopes[channel as usize]);
                    offsets.push(state.factory.offsets[channel as usize]);
                }
            }
        }
        let channel_count = channels.len() as u32;

        // Rendezvous on the shared clock before arming.
        let sample_rate = loop {
            let clock = self.a_in_clock_config_read()?;
            if clock.synced {
                break clock.sample_rate_per_channel;
            }
            std::thread::sleep(SYNC_POLL);
        };

        let per_channel = if options.contains(Options::CONTINUOUS) {
            let floor: u32 = if sample_rate <= 1024.0 {
                1_000
            } else if sample_rate <= 10_240.0 {
                10_000
            } else {
                100_000
            };
            floor.max(samples_per_channel)
        } else {
            samples_per_channel
        };
        let buffer_size = per_channel
            .checked_mul(channel_count)
            .filter(|&size| size <= MAX_SCAN_BUFFER_SIZE_SAMPLES)
            .ok_or(Error::BadParameter("scan buffer above 16 Mi samples"))?;

        // Burst target: read about ten times a second, bounded by what one
        // transfer can carry, in whole scans.
        let mut read_threshold =
            ((sample_rate / 10.0) as u32).min(MAX_SAMPLES_READ as u32) as u16;
        read_threshold = normalize(read_threshold as u32, channel_count) as u16;
        if read_threshold == 0 {
            read_threshold = channel_count as u16;
        }
        debug!(
            address = self.address(),
            buffer_size, read_threshold, "sized scan buffer"
        );

        let device_mask = if options.contains(Options::EXTTRIGGER) {
            channel_mask | MASK_TRIGGER_ENABLE
        } else {
            channel_mask
        };
        let scan_count: u32 = if options.contains(Options::CONTINUOUS) {
            0
        } else {
            samples_per_channel
        };

        let mut request = [0u8; 5];
        request[..4].copy_from_slice(&scan_count.to_le_bytes());
        request[4] = device_mask;
        self.dev.transfer(
            Command::AinScanStart,
            &request,
            &mut [],
            CONFIG_TIMEOUT,
            Duration::ZERO,
        )?;

        let shared = Arc::new(ScanShared {
            ring: SampleRing::new(buffer_size),
            read_threshold,
            options,
            channel_count: channel_count as u8,
            channels,
            slopes,
            offsets,
            samples_transferred: AtomicU64::new(0),
            hw_overrun: AtomicBool::new(false),
            buffer_overrun: AtomicBool::new(false),
            thread_running: AtomicBool::new(false),
            stop_thread: AtomicBool::new(false),
            triggered: AtomicBool::new(false),
            scan_running: AtomicBool::new(true),
        });

        let dev = Arc::clone(&self.dev);
        let producer = Arc::clone(&shared);
        let thread = std::thread::Builder::new()
            .name(format!("mcc172-scan-{}", self.address()))
            .spawn(move || run_producer(dev, producer));

        let thread = match thread {
            Ok(handle) => handle,
            Err(err) => {
                // Unwind fully: stop the device-side scan and leave no
                // session behind.
                warn!(address = self.address(), %err, "scan thread create failed");
                let _ = self.dev.transfer(
                    Command::AinScanStop,
                    &[],
                    &mut [],
                    CONFIG_TIMEOUT,
                    Duration::ZERO,
                );
                return Err(Error::ResourceUnavail("could not spawn scan thread"));
            }
        };

        // Publish the session before the arming guard drops, so callers see
        // either the flag or the session at every instant.
        *self.dev.scan.lock().unwrap() = Some(ScanSession {
            thread: Some(thread),
            shared,
        });
        Ok(())
    }

    /// Stop a running scan device-side. Non-blocking: the producer observes
    /// the stop on its next status poll and winds down by itself.
    pub fn a_in_scan_stop(&self) -> Result<()> {
        self.dev.transfer(
            Command::AinScanStop,
            &[],
            &mut [],
            CONFIG_TIMEOUT,
            Duration::ZERO,
        )
    }

    /// Free the scan session. Joins the producer thread first, so no buffer
    /// is reclaimed while the producer could still write into it.
    pub fn a_in_scan_cleanup(&self) -> Result<()> {
        let session = self.dev.scan.lock().unwrap().take();
        if let Some(mut session) = session {
            session.shared.stop_thread.store(true, Ordering::Release);
            if let Some(thread) = session.thread.take() {
                let _ = thread.join();
            }
            debug!(
                address = self.address(),
                samples_transferred = session.shared.samples_transferred.load(Ordering::Relaxed),
                "scan session reclaimed"
            );
        }
        Ok(())
    }

    /// Size of the scan ring in samples, across all channels.
    pub fn a_in_scan_buffer_size(&self) -> Result<u32> {
        let guard = self.dev.scan.lock().unwrap();
        let session = guard
            .as_ref()
            .ok_or(Error::ResourceUnavail("no scan in progress"))?;
        Ok(session.shared.ring.capacity())
    }

    /// Number of channels in the current scan, 0 when no scan exists.
    pub fn a_in_scan_channel_count(&self) -> u8 {
        let guard = self.dev.scan.lock().unwrap();
        guard
            .as_ref()
            .map(|session| session.shared.channel_count)
            .unwrap_or(0)
    }

    /// Scan state bits and the samples per channel available to read,
    /// without consuming anything.
    pub fn a_in_scan_status(&self) -> Result<ScanRead> {
        let guard = self.dev.scan.lock().unwrap();
        let session = guard
            .as_ref()
            .ok_or(Error::ResourceUnavail("no scan in progress"))?;
        let shared = &session.shared;
        Ok(ScanRead {
            status: shared.status_bits(),
            samples_read_per_channel: shared.ring.depth() / shared.channel_count as u32,
        })
    }

    /// Read scan data into `buffer`.
    ///
    /// `samples_per_channel == -1` drains whatever is available right now,
    /// ignoring the timeout. Otherwise the call waits for the requested
    /// count: `timeout_s < 0` waits indefinitely, `0` returns immediately
    /// with what is present, and a positive value is a monotonic deadline.
    /// On a deadline the partial data already copied is reported through
    /// [`Error::ReadTimeout`]. A scan that ends naturally returns whatever
    /// was drained with [`ScanStatus::RUNNING`] cleared.
    pub fn a_in_scan_read(
        &self,
        samples_per_channel: i32,
        timeout_s: f64,
        buffer: &mut [f64],
    ) -> Result<ScanRead> {
        if samples_per_channel < -1 {
            return Err(Error::BadParameter("invalid sample count"));
        }
        if samples_per_channel > 0 && buffer.is_empty() {
            return Err(Error::BadParameter("no output buffer"));
        }

        let shared = {
            let guard = self.dev.scan.lock().unwrap();
            let session = guard
                .as_ref()
                .ok_or(Error::ResourceUnavail("no scan in progress"))?;
            Arc::clone(&session.shared)
        };
        let channel_count = shared.channel_count as u32;

        // `-1` means one pass over what is buffered right now, which is the
        // same as an explicit request with a zero timeout.
        let effective_timeout_s = if samples_per_channel < 0 { 0.0 } else { timeout_s };
        let (mut samples_to_read, no_timeout, timeout) = if samples_per_channel < 0 {
            (shared.ring.depth(), false, Duration::ZERO)
        } else if effective_timeout_s < 0.0 {
            (
                (samples_per_channel as u32).saturating_mul(channel_count),
                true,
                Duration::ZERO,
            )
        } else {
            (
                (samples_per_channel as u32).saturating_mul(channel_count),
                false,
                Duration::from_secs_f64(effective_timeout_s),
            )
        };

        if (buffer.len() as u32) < samples_to_read {
            samples_to_read = normalize(buffer.len() as u32, channel_count);
        }

        let mut status = ScanStatus::default();
        let mut samples_read: u32 = 0;
        let mut timed_out = false;

        if samples_to_read > 0 {
            let start = Instant::now();
            loop {
                let depth = shared.ring.depth();
                if depth >= channel_count {
                    let current = normalize(depth.min(samples_to_read), channel_count);
                    if current > 0 {
                        shared.ring.pop_into(
                            &mut buffer[samples_read as usize..(samples_read + current) as usize],
                        );
                        samples_read += current;
                        samples_to_read -= current;
                        trace!(address = self.address(), current, "scan read drained");
                    }
                }

                std::thread::sleep(READ_SLEEP);

                if !no_timeout {
                    timed_out = start.elapsed() >= timeout;
                }

                let mut error = false;
                if shared.hw_overrun.load(Ordering::Acquire) {
                    status = status | ScanStatus::HW_OVERRUN;
                    error = true;
                }
                if shared.buffer_overrun.load(Ordering::Acquire) {
                    status = status | ScanStatus::BUFFER_OVERRUN;
                    error = true;
                }

                let more_coming = shared.thread_running.load(Ordering::Acquire)
                    || shared.ring.depth() > 0;
                if samples_to_read == 0 || error || !more_coming || timed_out {
                    break;
                }
            }
        } else {
            if shared.hw_overrun.load(Ordering::Acquire) {
                status = status | ScanStatus::HW_OVERRUN;
            }
            if shared.buffer_overrun.load(Ordering::Acquire) {
                status = status | ScanStatus::BUFFER_OVERRUN;
            }
        }

        if shared.triggered.load(Ordering::Acquire) {
            status = status | ScanStatus::TRIGGERED;
        }
        if shared.scan_running.load(Ordering::Acquire) {
            status = status | ScanStatus::RUNNING;
        }

        let samples_read_per_channel = samples_read / channel_count;
        if effective_timeout_s > 0.0 && timed_out && samples_to_read > 0 {
            return Err(Error::ReadTimeout {
                status,
                samples_read_per_channel,
            });
        }
        Ok(ScanRead {
            status,
            samples_read_per_channel,
        })
    }
}

/// Sign-extend a big-endian 24-bit sample to i32.
pub(crate) fn sign_extend_24(bytes: [u8; 3]) -> i32 {
    let raw = ((bytes[0] as u32) << 16) | ((bytes[1] as u32) << 8) | bytes[2] as u32;
    ((raw << 8) as i32) >> 8
}

/// Pull `read_count` raw samples, convert, calibrate and scale them.
fn read_scan_data(
    dev: &DeviceShared,
    shared: &ScanShared,
    read_count: u16,
    scaled: bool,
    calibrated: bool,
    channel_index: &mut usize,
) -> Result<Vec<f64>> {
    let mut rx = vec![0u8; read_count as usize * SAMPLE_SIZE_BYTES];
    dev.transfer(
        Command::AinScanData,
        &read_count.to_le_bytes(),
        &mut rx,
        DATA_TIMEOUT,
        DATA_RETRY,
    )?;

    let mut samples = Vec::with_capacity(read_count as usize);
    for raw in rx.chunks_exact(SAMPLE_SIZE_BYTES) {
        let mut value = sign_extend_24([raw[0], raw[1], raw[2]]) as f64;
        if calibrated {
            value = value * shared.slopes[*channel_index] + shared.offsets[*channel_index];
        }
        if scaled {
            value *= LSB_SIZE;
        }
        samples.push(value);

        *channel_index += 1;
        if *channel_index >= shared.channel_count as usize {
            *channel_index = 0;
        }
    }
    Ok(samples)
}

/// Producer loop. Runs until the scan finishes, an overrun kills it, or
/// cleanup raises `stop_thread`.
fn run_producer(dev: Arc<DeviceShared>, shared: Arc<ScanShared>) {
    shared.thread_running.store(true, Ordering::Release);
    shared.hw_overrun.store(false, Ordering::Release);
    debug!(
        address = dev.address,
        channels = ?shared.channels,
        read_threshold = shared.read_threshold,
        "scan producer started"
    );

    let scaled = !shared.options.contains(Options::NOSCALEDATA);
    let calibrated = !shared.options.contains(Options::NOCALIBRATEDATA);

    let mut channel_index: usize = 0;
    let mut sleep_us = MIN_SLEEP_US;
    let mut status_count: u32 = 0;
    let mut done = false;
    let mut status_reply = [0u8; 5];

    while !shared.stop_thread.load(Ordering::Acquire) && !done {
        if dev
            .transfer(
                Command::AinScanStatus,
                &[],
                &mut status_reply,
                STATUS_TIMEOUT,
                STATUS_RETRY,
            )
            .is_ok()
        {
            let device_status = status_reply[0];
            let available = u16::from_le_bytes([status_reply[1], status_reply[2]]);
            let max_read_now = u16::from_le_bytes([status_reply[3], status_reply[4]]);
            let device_running = device_status & DEV_RUNNING != 0;
            let hw_overrun = device_status & DEV_HW_OVERRUN != 0;
            let triggered = device_status & DEV_TRIGGERED != 0;

            if triggered {
                shared.triggered.store(true, Ordering::Release);
            }
            status_count += 1;

            if hw_overrun {
                warn!(address = dev.address, "hardware overrun");
                shared.hw_overrun.store(true, Ordering::Release);
                shared.scan_running.store(false, Ordering::Release);
                done = true;
            } else if !triggered {
                // Still waiting on the external trigger.
                sleep_us = TRIG_SLEEP_US;
            } else {
                let mut read_count = if !device_running
                    || available >= shared.read_threshold
                    || available > max_read_now
                {
                    available.min(max_read_now).min(MAX_SAMPLES_READ as u16)
                } else {
                    0
                };

                if read_count > 0 {
                    // Never split one device read across the ring wrap.
                    let space = shared.ring.space_to_wrap().min(u16::MAX as u32) as u16;
                    read_count = read_count.min(space);

                    match read_scan_data(
                        &dev,
                        &shared,
                        read_count,
                        scaled,
                        calibrated,
                        &mut channel_index,
                    ) {
                        Ok(samples) => {
                            let depth = shared.ring.push_burst(&samples);
                            trace!(
                                address = dev.address,
                                read_count,
                                depth,
                                available,
                                "scan data burst"
                            );
                            shared
                                .samples_transferred
                                .fetch_add(read_count as u64, Ordering::Relaxed);
                            if depth > shared.ring.capacity() {
                                warn!(address = dev.address, "scan buffer overrun");
                                shared.buffer_overrun.store(true, Ordering::Release);
                                shared.scan_running.store(false, Ordering::Release);
                                done = true;
                            }
                        }
                        Err(err) => {
                            // The next status poll decides whether this was
                            // fatal.
                            debug!(address = dev.address, %err, "scan data read failed");
                        }
                    }

                    // Adaptive cadence: many idle polls per read means the
                    // device fills slowly, back off; back-to-back productive
                    // polls mean we are behind, speed up.
                    if status_count > 4 {
                        sleep_us *= 2;
                    } else if status_count <= 1 {
                        sleep_us = (sleep_us / 2).max(MIN_SLEEP_US);
                    }
                    status_count = 0;
                }

                if !device_running && available == read_count {
                    shared.scan_running.store(false, Ordering::Release);
                    done = true;
                }
            }
        }

        std::thread::sleep(Duration::from_micros(sleep_us));
    }

    if shared.scan_running.load(Ordering::Acquire) {
        // Stopped from outside while the device still runs: shut the
        // device-side scan down before exiting.
        let _ = dev.transfer(
            Command::AinScanStop,
            &[],
            &mut [],
            CONFIG_TIMEOUT,
            Duration::ZERO,
        );
    }
    shared.thread_running.store(false, Ordering::Release);
}
