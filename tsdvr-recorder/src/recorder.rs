//! The recording pipeline.
//!
//! TS bursts from the receiving callback go through a bounded ring buffer
//! to a blocking worker task. The worker runs the frame detector over the
//! buffered bytes and writes whole frames to I-frame-aligned segment
//! files, prepending freshly generated PAT/PMT packets at every
//! independent frame, keeping a seek index entry per frame, and rolling
//! to the next segment when the current one grows past its size limit or
//! disk space runs low.

use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{error, info, warn};
use tokio::task::JoinHandle;

use tsdvr_core::channel::Channel;
use tsdvr_core::frame::{FrameDetector, DEFAULT_FIELD_PAIR_THRESHOLD};
use tsdvr_core::nalu::NaluStreamProcessor;
use tsdvr_core::psi::generator::PatPmtGenerator;
use tsdvr_core::ts::TS_SIZE;

use crate::error::RecorderError;
use crate::index::IndexFile;
use crate::ring::RingBuffer;
use crate::segment::{self, SegmentFiles};

/// Ring buffer size, a multiple of the TS packet size.
pub const RECORDER_BUF_SIZE: usize = 5 * 1024 * 1024 / TS_SIZE * TS_SIZE;

/// The longest time without a successfully written frame before the
/// stream counts as broken.
const MAX_BROKEN_TIMEOUT: Duration = Duration::from_secs(30);

/// Free disk space is sampled at most this often.
const DISK_CHECK_INTERVAL: Duration = Duration::from_secs(100);

const RING_GET_TIMEOUT: Duration = Duration::from_millis(100);
const STOP_JOIN_TIMEOUT: Duration = Duration::from_secs(3);

/// Monotonic time source.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Free-disk-space query, answered by the surrounding application.
pub trait DiskSpace: Send + Sync {
    fn free_mb(&self, path: &Path) -> Option<u64>;
}

/// Probe that never answers; disk-space rollover stays disabled.
pub struct NoDiskSpaceProbe;

impl DiskSpace for NoDiskSpaceProbe {
    fn free_mb(&self, _path: &Path) -> Option<u64> {
        None
    }
}

/// Receives the request for an emergency application shutdown when the
/// stream is broken.
pub trait ShutdownRequester: Send + Sync {
    fn request_emergency_exit(&self);
}

pub struct LogOnlyShutdown;

impl ShutdownRequester for LogOnlyShutdown {
    fn request_emergency_exit(&self) {
        error!("emergency exit requested");
    }
}

/// What to do with AVC filler NAL units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NaluFillPolicy {
    /// Record the stream as received.
    #[default]
    Keep,
    /// Strip filler NAL units while recording.
    Dump,
}

#[derive(Debug, Clone)]
pub struct RecorderConfig {
    /// Segment files roll over past this many bytes.
    pub max_segment_size: u64,
    pub nalu_fill: NaluFillPolicy,
    /// Roll over early when free disk space falls below this.
    pub min_free_disk_mb: u64,
    /// Forwarded to the frame detector's field-pair heuristic.
    pub field_pair_threshold: usize,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            max_segment_size: 2_000 * 1024 * 1024,
            nalu_fill: NaluFillPolicy::Keep,
            min_free_disk_mb: 512,
            field_pair_threshold: DEFAULT_FIELD_PAIR_THRESHOLD,
        }
    }
}

/// Records one channel into a directory of segment files.
pub struct Recorder {
    ring: Arc<RingBuffer>,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl Recorder {
    /// Start recording `channel` into `dir` with default collaborators.
    pub fn start(
        dir: &Path,
        channel: &Channel,
        config: RecorderConfig,
    ) -> Result<Self, RecorderError> {
        Self::start_with(
            dir,
            channel,
            config,
            Arc::new(SystemClock),
            Arc::new(NoDiskSpaceProbe),
            Arc::new(LogOnlyShutdown),
        )
    }

    /// Start recording with explicit collaborator implementations.
    pub fn start_with(
        dir: &Path,
        channel: &Channel,
        config: RecorderConfig,
        clock: Arc<dyn Clock>,
        disk: Arc<dyn DiskSpace>,
        shutdown: Arc<dyn ShutdownRequester>,
    ) -> Result<Self, RecorderError> {
        let (pid, stream_type) = pick_stream(channel).ok_or(RecorderError::NoPids)?;
        let mut detector = FrameDetector::new(pid, stream_type);
        detector.set_field_pair_threshold(config.field_pair_threshold);

        let mut generator = PatPmtGenerator::new();
        if let Some((pat_version, pmt_version)) = segment::last_pat_pmt_versions(dir) {
            generator.set_versions(pat_version.wrapping_add(1), pmt_version.wrapping_add(1));
        }
        generator.set_channel(channel);

        let nalu = if stream_type == 0x1B && config.nalu_fill == NaluFillPolicy::Dump {
            info!("starting NALU fill dumper");
            let mut processor = NaluStreamProcessor::new();
            processor.set_pid(pid);
            Some(processor)
        } else {
            None
        };

        let segments = SegmentFiles::open(dir).map_err(|source| RecorderError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let index = match IndexFile::create(dir) {
            Ok(index) => Some(index),
            Err(e) => {
                // Keep going without an index; the recording itself is
                // worth more.
                error!("can't create index file: {}", e);
                None
            }
        };

        let ring = Arc::new(RingBuffer::new(RECORDER_BUF_SIZE));
        let running = Arc::new(AtomicBool::new(true));
        let worker = Worker {
            ring: ring.clone(),
            running: running.clone(),
            detector,
            generator,
            nalu,
            segments,
            index,
            file_size: 0,
            config,
            clock,
            disk,
            shutdown,
            last_disk_check: None,
        };
        let handle = tokio::task::spawn_blocking(move || worker.run());

        Ok(Self {
            ring,
            running,
            worker: Some(handle),
        })
    }

    /// Producer side: enqueue a burst from the device callback. Never
    /// blocks; an overrun is reported and the excess dropped.
    pub fn receive(&self, data: &[u8]) {
        if !self.running.load(Ordering::SeqCst) {
            return;
        }
        let put = self.ring.put(data);
        if put != data.len() {
            warn!("ring buffer overflow, {} bytes dropped", data.len() - put);
        }
    }

    /// Bytes received but not yet processed by the worker.
    pub fn pending(&self) -> usize {
        self.ring.available()
    }

    /// Stop the worker with a bounded join.
    pub async fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.worker.take() {
            match tokio::time::timeout(STOP_JOIN_TIMEOUT, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("recorder worker failed: {}", e),
                Err(_) => error!(
                    "recorder worker did not stop within {:?}",
                    STOP_JOIN_TIMEOUT
                ),
            }
        }
    }
}

/// The PID and stream type the frame detector should watch: video when
/// the channel has it, otherwise the first audio or Dolby track.
fn pick_stream(channel: &Channel) -> Option<(u16, u8)> {
    if channel.vpid != 0 {
        return Some((channel.vpid, channel.vtype));
    }
    if let Some(track) = channel.audio.first() {
        return Some((track.pid, track.stream_type));
    }
    if let Some(track) = channel.dolby.first() {
        return Some((track.pid, 0x06));
    }
    None
}

struct Worker {
    ring: Arc<RingBuffer>,
    running: Arc<AtomicBool>,
    detector: FrameDetector,
    generator: PatPmtGenerator,
    nalu: Option<NaluStreamProcessor>,
    segments: SegmentFiles,
    index: Option<IndexFile>,
    file_size: u64,
    config: RecorderConfig,
    clock: Arc<dyn Clock>,
    disk: Arc<dyn DiskSpace>,
    shutdown: Arc<dyn ShutdownRequester>,
    last_disk_check: Option<Instant>,
}

impl Worker {
    fn run(mut self) {
        let mut buf = vec![0u8; 64 * 1024];
        let mut last_write = self.clock.now();
        let mut fps_logged = false;
        let mut first_iframe_seen = false;
        self.last_disk_check = Some(self.clock.now());

        while self.running.load(Ordering::SeqCst) {
            let got = self.ring.get(&mut buf, RING_GET_TIMEOUT);
            if got > 0 {
                let count = self.detector.analyze(&buf[..got]);
                if count > 0 {
                    if !self.running.load(Ordering::SeqCst) && self.detector.independent_frame() {
                        // Finish the recording before the next
                        // independent frame.
                        break;
                    }
                    if self.detector.synced() {
                        if !fps_logged && self.detector.frames_per_second() > 0.0 {
                            info!(
                                "detected {:.2} frames per second",
                                self.detector.frames_per_second()
                            );
                            fps_logged = true;
                        }
                        if first_iframe_seen || self.detector.independent_frame() {
                            // Recording starts at the first I-frame.
                            first_iframe_seen = true;
                            if let Err(e) = self.next_file() {
                                error!("can't roll to next segment file: {}", e);
                                break;
                            }
                            if self.detector.new_frame() {
                                self.write_index_entry();
                            }
                            if self.detector.independent_frame() && self.write_pat_pmt().is_err() {
                                break;
                            }
                            if self.write_chunk(&buf[..count]).is_err() {
                                break;
                            }
                            last_write = self.clock.now();
                        }
                    }
                    self.ring.del(count);
                }
            }
            if self.clock.now().duration_since(last_write) > MAX_BROKEN_TIMEOUT {
                error!("video data stream broken");
                self.shutdown.request_emergency_exit();
                last_write = self.clock.now();
            }
        }

        if let Some(nalu) = &self.nalu {
            nalu.log_statistics();
        }
    }

    /// Roll to the next segment when the current one is full or disk
    /// space is running out; only ever between independent frames.
    fn next_file(&mut self) -> io::Result<()> {
        if self.detector.independent_frame()
            && (self.file_size > self.config.max_segment_size || self.running_low_on_disk_space())
        {
            self.segments.next_file()?;
            self.file_size = 0;
        }
        Ok(())
    }

    fn running_low_on_disk_space(&mut self) -> bool {
        let now = self.clock.now();
        if let Some(last) = self.last_disk_check {
            if now.duration_since(last) < DISK_CHECK_INTERVAL {
                return false;
            }
        }
        self.last_disk_check = Some(now);
        if let Some(free) = self.disk.free_mb(self.segments.dir()) {
            if free < self.config.min_free_disk_mb {
                warn!(
                    "low disk space ({} MB, limit is {} MB)",
                    free, self.config.min_free_disk_mb
                );
                return true;
            }
        }
        false
    }

    fn write_index_entry(&mut self) {
        if let Some(index) = self.index.as_mut() {
            if let Err(e) = index.write(
                self.detector.independent_frame(),
                self.segments.number(),
                self.file_size,
            ) {
                error!("can't write index entry: {}", e);
                self.index = None;
            }
        }
    }

    fn write_pat_pmt(&mut self) -> io::Result<()> {
        let pat = *self.generator.pat();
        self.write_table_packet(&pat)?;
        let mut index = 0;
        loop {
            let Some(pmt) = self.generator.pmt(index) else {
                break;
            };
            let pmt = *pmt;
            self.write_table_packet(&pmt)?;
            index += 1;
        }
        Ok(())
    }

    fn write_table_packet(&mut self, packet: &[u8; TS_SIZE]) -> io::Result<()> {
        use std::io::Write;
        if let Err(e) = self.segments.file().write_all(packet) {
            error!("can't write to {}: {}", self.segments.path().display(), e);
            return Err(e);
        }
        self.file_size += TS_SIZE as u64;
        Ok(())
    }

    fn write_chunk(&mut self, chunk: &[u8]) -> io::Result<()> {
        use std::io::Write;
        if let Some(nalu) = self.nalu.as_mut() {
            nalu.put(chunk);
            while let Some(out) = nalu.get() {
                if let Err(e) = self.segments.file().write_all(out) {
                    error!("can't write to {}: {}", self.segments.path().display(), e);
                    return Err(e);
                }
                self.file_size += out.len() as u64;
            }
        } else {
            if let Err(e) = self.segments.file().write_all(chunk) {
                error!("can't write to {}: {}", self.segments.path().display(), e);
                return Err(e);
            }
            self.file_size += chunk.len() as u64;
        }
        Ok(())
    }
}
