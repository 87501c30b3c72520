//! Ordinal-numbered segment files of a recording.
//!
//! A recording directory holds `00001.ts`, `00002.ts`, ... plus the index
//! file. Restarting a recording into the same directory continues behind
//! the existing segments and continues the PAT/PMT version numbering
//! found in the newest one.

use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use log::info;

use tsdvr_core::psi::parser::PatPmtParser;
use tsdvr_core::ts::{self, TS_SIZE};

/// Path of the segment file `number` inside `dir`.
pub fn segment_path(dir: &Path, number: u16) -> PathBuf {
    dir.join(format!("{:05}.ts", number))
}

/// Number of the newest existing segment in `dir`, if any.
fn newest_segment(dir: &Path) -> Option<u16> {
    let mut newest = None;
    for entry in fs::read_dir(dir).ok()?.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some(stem) = name.strip_suffix(".ts") {
            if stem.len() == 5 {
                if let Ok(number) = stem.parse::<u16>() {
                    if newest.map_or(true, |n| number > n) {
                        newest = Some(number);
                    }
                }
            }
        }
    }
    newest
}

/// PAT/PMT version numbers found at the head of the newest existing
/// segment, so a restarted recording can continue the numbering.
pub fn last_pat_pmt_versions(dir: &Path) -> Option<(u8, u8)> {
    let number = newest_segment(dir)?;
    let mut head = vec![0u8; 32 * TS_SIZE];
    let n = File::open(segment_path(dir, number))
        .ok()?
        .read(&mut head)
        .ok()?;

    let mut parser = PatPmtParser::new();
    for packet in head[..n].chunks_exact(TS_SIZE) {
        if !ts::is_sync(packet) {
            break;
        }
        let pid = ts::pid(packet);
        if pid == ts::PID_PAT {
            parser.parse_pat(packet);
        } else if Some(pid) == parser.pmt_pid() {
            parser.parse_pmt(packet);
        }
        if let Some(versions) = parser.versions() {
            return Some(versions);
        }
    }
    None
}

/// The currently open segment file of a recording.
pub struct SegmentFiles {
    dir: PathBuf,
    number: u16,
    file: File,
}

impl SegmentFiles {
    /// Open the next free segment in `dir`, creating the directory as
    /// needed.
    pub fn open(dir: &Path) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        let number = newest_segment(dir).map_or(1, |n| n + 1);
        let path = segment_path(dir, number);
        let file = File::create(&path)?;
        info!("recording to {}", path.display());
        Ok(Self {
            dir: dir.to_path_buf(),
            number,
            file,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn number(&self) -> u16 {
        self.number
    }

    pub fn path(&self) -> PathBuf {
        segment_path(&self.dir, self.number)
    }

    pub fn file(&mut self) -> &mut File {
        &mut self.file
    }

    /// Roll over to the next ordinal segment file.
    pub fn next_file(&mut self) -> io::Result<()> {
        if self.number == u16::MAX {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "out of segment file numbers",
            ));
        }
        self.number += 1;
        let path = segment_path(&self.dir, self.number);
        self.file = File::create(&path)?;
        info!("recording to {}", path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tsdvr_core::channel::{AudioTrack, Channel};
    use tsdvr_core::psi::generator::PatPmtGenerator;

    #[test]
    fn test_numbering_starts_at_one() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut segments = SegmentFiles::open(dir.path()).unwrap();
        assert_eq!(segments.number(), 1);
        assert!(segment_path(dir.path(), 1).exists());

        segments.next_file().unwrap();
        assert_eq!(segments.number(), 2);
        assert!(segment_path(dir.path(), 2).exists());
    }

    #[test]
    fn test_reopen_continues_numbering() {
        let dir = tempfile::TempDir::new().unwrap();
        {
            let mut segments = SegmentFiles::open(dir.path()).unwrap();
            segments.next_file().unwrap();
        }
        let segments = SegmentFiles::open(dir.path()).unwrap();
        assert_eq!(segments.number(), 3);
    }

    #[test]
    fn test_version_continuation() {
        let dir = tempfile::TempDir::new().unwrap();
        assert_eq!(last_pat_pmt_versions(dir.path()), None);

        let channel = Channel {
            vpid: 0x100,
            vtype: 0x02,
            ppid: 0x100,
            audio: vec![AudioTrack {
                pid: 0x101,
                stream_type: 0x04,
                language: "eng".into(),
            }],
            ..Default::default()
        };
        let mut generator = PatPmtGenerator::new();
        generator.set_versions(4, 9);
        generator.set_channel(&channel);

        let mut file = File::create(segment_path(dir.path(), 1)).unwrap();
        file.write_all(generator.pat()).unwrap();
        let mut index = 0;
        while let Some(pmt) = generator.pmt(index) {
            let pmt = *pmt;
            file.write_all(&pmt).unwrap();
            index += 1;
        }
        drop(file);

        assert_eq!(last_pat_pmt_versions(dir.path()), Some((4, 9)));
    }
}
