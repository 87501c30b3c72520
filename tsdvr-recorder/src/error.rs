//! Error types of the recorder.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors that keep a recording from starting or abort it.
#[derive(Error, Debug)]
pub enum RecorderError {
    /// An I/O error on the recording directory or a segment file. Fatal
    /// to the current recording.
    #[error("recording I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The channel descriptor names no PID worth recording.
    #[error("channel has no video, audio or Dolby PID to record")]
    NoPids,
}
