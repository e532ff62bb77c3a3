// Evidence capture: a short recording that stands in for the kiosk token when the
// token already rotated by the time we got to the server.
//
// Recording starts as soon as a capture is created, there is no separate "start"
// button. The camera is given back when the capture is dropped no matter how we
// got there (finished, failed, or the student scanned a new code halfway through).

use crate::error::CaptureError;
use chrono::{DateTime, Duration, Utc};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

// The server only understands webm, and we never transcode.
pub const CONTAINER_MIME: &str = "video/webm";
pub const FILE_NAME: &str = "evidence.webm";

#[derive(Debug, Clone, PartialEq)]
pub struct MediaChunk {
    pub mime: String,
    pub data: Vec<u8>,
}

// Whatever owns the camera.
pub trait Recorder {
    fn start(&mut self) -> Result<(), CaptureError>;

    // Buffered media since the last call. After stop() this hands back whatever
    // was still in flight.
    fn take_chunks(&mut self) -> Result<Vec<MediaChunk>, CaptureError>;

    fn stop(&mut self) -> Result<(), CaptureError>;

    // Must be safe to call at any point, including before start() succeeded.
    fn release(&mut self);
}

#[derive(Debug, Clone, PartialEq)]
pub struct EvidenceArtifact {
    bytes: Vec<u8>,
    duration: Duration,
}

impl EvidenceArtifact {
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn mime(&self) -> &'static str {
        CONTAINER_MIME
    }

    pub fn file_name(&self) -> &'static str {
        FILE_NAME
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CaptureProgress {
    Recording,
    // Nothing more will be recorded, call finish() to send what we have.
    CapReached,
}

pub struct EvidenceCapture<R: Recorder> {
    recorder: R,
    chunks: Vec<MediaChunk>,
    started_at: DateTime<Utc>,
    max_duration: Duration,
    stopped: bool,
    released: bool,
}

impl<R: Recorder> EvidenceCapture<R> {
    pub fn begin(
        mut recorder: R,
        now: DateTime<Utc>,
        max_duration: Duration,
    ) -> Result<Self, CaptureError> {
        if let Err(e) = recorder.start() {
            recorder.release();
            return Err(e);
        }
        tracing::info!("Recording evidence (at most {}s)", max_duration.num_seconds());

        Ok(EvidenceCapture {
            recorder,
            chunks: Vec::new(),
            started_at: now,
            max_duration,
            stopped: false,
            released: false,
        })
    }

    pub fn elapsed(&self, now: DateTime<Utc>) -> Duration {
        now - self.started_at
    }

    // Pull buffered media and enforce the length cap.
    pub fn poll(&mut self, now: DateTime<Utc>) -> Result<CaptureProgress, CaptureError> {
        if self.stopped {
            return Ok(CaptureProgress::CapReached);
        }

        let mut fresh = self.recorder.take_chunks()?;
        self.chunks.append(&mut fresh);

        if self.elapsed(now) >= self.max_duration {
            tracing::info!("Evidence recording hit its length cap, stopping");
            self.stop_recorder()?;
            return Ok(CaptureProgress::CapReached);
        }
        Ok(CaptureProgress::Recording)
    }

    // The explicit stop: everything recorded so far becomes one artifact.
    pub fn finish(mut self, now: DateTime<Utc>) -> Result<EvidenceArtifact, CaptureError> {
        if !self.stopped {
            self.stop_recorder()?;
        }
        let chunks = std::mem::take(&mut self.chunks);
        let duration = std::cmp::min(self.elapsed(now), self.max_duration);
        self.release();

        package(chunks, duration)
    }

    fn stop_recorder(&mut self) -> Result<(), CaptureError> {
        self.recorder.stop()?;
        self.stopped = true;
        let mut rest = self.recorder.take_chunks()?;
        self.chunks.append(&mut rest);
        Ok(())
    }

    fn release(&mut self) {
        if !self.released {
            self.recorder.release();
            self.released = true;
            tracing::debug!("Camera released");
        }
    }
}

impl<R: Recorder> Drop for EvidenceCapture<R> {
    fn drop(&mut self) {
        self.release();
    }
}

fn package(chunks: Vec<MediaChunk>, duration: Duration) -> Result<EvidenceArtifact, CaptureError> {
    if chunks.is_empty() {
        return Err(CaptureError::Empty);
    }

    // Codec parameters are fine (video/webm;codecs=vp8), a different container is not.
    if let Some(bad) = chunks
        .iter()
        .find(|c| c.mime.split(';').next().map(str::trim) != Some(CONTAINER_MIME))
    {
        return Err(CaptureError::UnsupportedContainer {
            expected: CONTAINER_MIME,
            found: bad.mime.clone(),
        });
    }

    let bytes: Vec<u8> = chunks.into_iter().flat_map(|c| c.data).collect();
    if bytes.is_empty() {
        return Err(CaptureError::Empty);
    }

    Ok(EvidenceArtifact { bytes, duration })
}

// A terminal has no camera, so the command line "records" by streaming an
// existing clip off disk, one chunk per poll. Like a live camera, how much
// gets sent depends on how long the recording ran, so the length cap also
// caps the upload.
pub struct FileRecorder {
    path: PathBuf,
    file: Option<File>,
}

const FILE_CHUNK_LEN: u64 = 64 * 1024;

impl FileRecorder {
    pub fn new(path: &Path) -> Self {
        FileRecorder {
            path: path.to_path_buf(),
            file: None,
        }
    }

    fn mime(&self) -> String {
        match self.path.extension().and_then(|e| e.to_str()) {
            Some("webm") => CONTAINER_MIME.to_owned(),
            Some("mp4") => "video/mp4".to_owned(),
            Some(other) => format!("application/x-{}", other),
            None => "application/octet-stream".to_owned(),
        }
    }

    fn read(&mut self) -> Result<Vec<u8>, CaptureError> {
        let file = match self.file.as_mut() {
            Some(file) => file,
            None => return Ok(Vec::new()),
        };
        let mut data = Vec::new();
        file.take(FILE_CHUNK_LEN)
            .read_to_end(&mut data)
            .map_err(|e| CaptureError::Device(format!("{}: {}", self.path.display(), e)))?;
        Ok(data)
    }
}

impl Recorder for FileRecorder {
    fn start(&mut self) -> Result<(), CaptureError> {
        let file = File::open(&self.path)
            .map_err(|e| CaptureError::Device(format!("{}: {}", self.path.display(), e)))?;
        self.file = Some(file);
        Ok(())
    }

    fn take_chunks(&mut self) -> Result<Vec<MediaChunk>, CaptureError> {
        let data = self.read()?;
        if data.is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![MediaChunk {
            mime: self.mime(),
            data,
        }])
    }

    // Nothing buffered, so there is nothing to flush beyond the next chunk.
    fn stop(&mut self) -> Result<(), CaptureError> {
        Ok(())
    }

    fn release(&mut self) {
        self.file = None;
    }
}

#[cfg(test)]
pub mod fake {
    use super::*;
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::rc::Rc;

    #[derive(Default, Debug)]
    pub struct CameraLog {
        pub started: bool,
        pub stopped: bool,
        pub released: usize,
    }

    // Each take_chunks() hands out the next batch.
    pub struct FakeRecorder {
        pub batches: VecDeque<Vec<MediaChunk>>,
        pub log: Rc<RefCell<CameraLog>>,
        pub fail_start: bool,
    }

    impl FakeRecorder {
        pub fn new(batches: Vec<Vec<MediaChunk>>) -> (Self, Rc<RefCell<CameraLog>>) {
            let log = Rc::new(RefCell::new(CameraLog::default()));
            (
                FakeRecorder {
                    batches: batches.into_iter().collect(),
                    log: Rc::clone(&log),
                    fail_start: false,
                },
                log,
            )
        }
    }

    pub fn webm(data: &[u8]) -> MediaChunk {
        MediaChunk {
            mime: "video/webm;codecs=vp8,opus".to_owned(),
            data: data.to_vec(),
        }
    }

    impl Recorder for FakeRecorder {
        fn start(&mut self) -> Result<(), CaptureError> {
            if self.fail_start {
                return Err(CaptureError::Device("permission denied".to_owned()));
            }
            self.log.borrow_mut().started = true;
            Ok(())
        }

        fn take_chunks(&mut self) -> Result<Vec<MediaChunk>, CaptureError> {
            Ok(self.batches.pop_front().unwrap_or_default())
        }

        fn stop(&mut self) -> Result<(), CaptureError> {
            self.log.borrow_mut().stopped = true;
            Ok(())
        }

        fn release(&mut self) {
            self.log.borrow_mut().released += 1;
        }
    }
}
