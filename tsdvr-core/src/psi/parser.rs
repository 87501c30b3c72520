//! PAT/PMT parsing.
//!
//! Feeds on raw TS packets: `parse_pat` learns the PMT PID from the
//! program association table, `parse_pmt` reassembles the (possibly
//! multi-packet) program map section, verifies its CRC and exposes the
//! resulting channel descriptor. Tables are only re-read when the version
//! number changes; a new version replaces the channel atomically from the
//! caller's perspective.

use log::{error, warn};

use crate::channel::{
    AudioTrack, Channel, DolbyTrack, IdentityNormalizer, LanguageNormalizer, SubtitleTrack,
    TrackSink, MAX_APIDS, MAX_DPIDS, MAX_SPIDS,
};
use crate::ts::{self, TS_SIZE};

use super::{crc32_mpeg2, descriptor_tag, section_total_length, table_id, MAX_SECTION_SIZE};

/// Parses PAT and PMT packets into a [`Channel`] descriptor.
pub struct PatPmtParser {
    pmt_buf: Vec<u8>,
    pmt_pid: Option<u16>,
    pat_version: Option<u8>,
    pmt_version: Option<u8>,
    channel: Channel,
    normalizer: Box<dyn LanguageNormalizer>,
    track_sink: Option<Box<dyn TrackSink>>,
}

impl Default for PatPmtParser {
    fn default() -> Self {
        Self::new()
    }
}

impl PatPmtParser {
    pub fn new() -> Self {
        Self::with_normalizer(Box::new(IdentityNormalizer))
    }

    /// Use `normalizer` for all language codes taken from descriptors.
    pub fn with_normalizer(normalizer: Box<dyn LanguageNormalizer>) -> Self {
        Self {
            pmt_buf: Vec::new(),
            pmt_pid: None,
            pat_version: None,
            pmt_version: None,
            channel: Channel::default(),
            normalizer,
            track_sink: None,
        }
    }

    /// Announce audio/Dolby/subtitle tracks to `sink` as they are parsed.
    pub fn set_track_sink(&mut self, sink: Box<dyn TrackSink>) {
        self.track_sink = Some(sink);
    }

    /// Drop all state, as if freshly constructed.
    pub fn reset(&mut self) {
        self.pmt_buf.clear();
        self.pmt_pid = None;
        self.pat_version = None;
        self.pmt_version = None;
        self.channel = Channel::default();
    }

    /// The PMT PID announced by the last valid PAT.
    pub fn pmt_pid(&self) -> Option<u16> {
        self.pmt_pid
    }

    /// Video PID of the current channel (0 if none).
    pub fn vpid(&self) -> u16 {
        self.channel.vpid
    }

    /// Video stream type of the current channel.
    pub fn vtype(&self) -> u8 {
        self.channel.vtype
    }

    /// PCR PID of the current channel.
    pub fn ppid(&self) -> u16 {
        self.channel.ppid
    }

    /// The channel as described by the last valid PMT.
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// PAT and PMT version numbers, once both tables have been seen.
    pub fn versions(&self) -> Option<(u8, u8)> {
        Some((self.pat_version?, self.pmt_version?))
    }

    /// Process a TS packet carrying (part of) a PAT.
    ///
    /// The PAT is assumed to fit into a single packet; a corrupt section is
    /// logged and discarded.
    pub fn parse_pat(&mut self, packet: &[u8]) {
        if packet.len() < TS_SIZE || !ts::has_payload(packet) {
            return;
        }
        let data = &packet[ts::payload_offset(packet)..TS_SIZE];
        if data.is_empty() {
            return;
        }
        let pointer = data[0] as usize;
        if 1 + pointer >= data.len() {
            return;
        }
        let data = &data[1 + pointer..];

        let total = match section_total_length(data) {
            Some(total) if total <= data.len() => total,
            _ => {
                error!("PAT section does not fit into a single TS packet");
                return;
            }
        };
        let section = &data[..total];
        if section[0] != table_id::PAT || total < 12 {
            return;
        }
        let stored = u32::from_be_bytes(section[total - 4..].try_into().unwrap());
        if crc32_mpeg2(&section[..total - 4]) != stored {
            error!("invalid CRC in PAT");
            return;
        }

        let version = (section[5] >> 1) & 0x1F;
        if self.pat_version == Some(version) {
            return;
        }
        for assoc in section[8..total - 4].chunks_exact(4) {
            let program = ((assoc[0] as u16) << 8) | assoc[1] as u16;
            let pid = ((assoc[2] as u16 & 0x1F) << 8) | assoc[3] as u16;
            if program != 0 {
                // Program 0 would be the network PID.
                self.pmt_pid = Some(pid);
            }
        }
        self.pat_version = Some(version);
    }

    /// Process a TS packet carrying (part of) a PMT.
    ///
    /// The section may extend over several packets; call this for every
    /// packet on the PMT PID and poll [`channel`](Self::channel) for the
    /// result.
    pub fn parse_pmt(&mut self, packet: &[u8]) {
        if packet.len() < TS_SIZE || !ts::has_payload(packet) {
            return;
        }
        let data = &packet[ts::payload_offset(packet)..TS_SIZE];

        if ts::payload_start(packet) {
            self.pmt_buf.clear();
            if data.is_empty() {
                return;
            }
            let pointer = data[0] as usize;
            if 1 + pointer >= data.len() {
                return;
            }
            self.pmt_buf.extend_from_slice(&data[1 + pointer..]);
        } else if !self.pmt_buf.is_empty() {
            if self.pmt_buf.len() + data.len() > MAX_SECTION_SIZE {
                error!(
                    "PMT section length too big ({} bytes)",
                    self.pmt_buf.len() + data.len()
                );
                self.pmt_buf.clear();
                return;
            }
            self.pmt_buf.extend_from_slice(data);
        } else {
            return; // fragment of a section whose start we missed
        }

        let total = match section_total_length(&self.pmt_buf) {
            Some(total) => total,
            None => return,
        };
        if total > MAX_SECTION_SIZE {
            error!("PMT section length too big ({} bytes)", total);
            self.pmt_buf.clear();
            return;
        }
        if self.pmt_buf.len() < total {
            return; // more packets to come
        }

        let section = std::mem::take(&mut self.pmt_buf);
        self.parse_pmt_section(&section[..total]);
    }

    fn parse_pmt_section(&mut self, section: &[u8]) {
        let total = section.len();
        if section[0] != table_id::PMT || total < 16 {
            return;
        }
        let stored = u32::from_be_bytes(section[total - 4..].try_into().unwrap());
        if crc32_mpeg2(&section[..total - 4]) != stored {
            error!("invalid CRC in PMT");
            return;
        }

        let version = (section[5] >> 1) & 0x1F;
        if self.pmt_version == Some(version) {
            return;
        }
        if let Some(sink) = self.track_sink.as_mut() {
            sink.clear_tracks();
        }

        let pcr_pid = ((section[8] as u16 & 0x1F) << 8) | section[9] as u16;
        let program_info_length = ((section[10] as usize & 0x0F) << 8) | section[11] as usize;
        let mut channel = Channel::default();

        let mut offset = 12 + program_info_length;
        let end = total - 4;
        while offset + 5 <= end {
            let stream_type = section[offset];
            let pid = ((section[offset + 1] as u16 & 0x1F) << 8) | section[offset + 2] as u16;
            let es_info_length =
                ((section[offset + 3] as usize & 0x0F) << 8) | section[offset + 4] as usize;
            offset += 5;
            if offset + es_info_length > end {
                break;
            }
            let descriptors = &section[offset..offset + es_info_length];
            offset += es_info_length;

            match stream_type {
                0x01 | 0x02 | 0x1B => {
                    channel.vpid = pid;
                    channel.vtype = stream_type;
                    channel.ppid = pcr_pid;
                }
                0x03 | 0x04 | 0x0F | 0x11 => {
                    if channel.audio.len() < MAX_APIDS {
                        let mut language = String::new();
                        for (tag, body) in descriptor_iter(descriptors) {
                            if tag == descriptor_tag::ISO639_LANGUAGE {
                                language = self.join_languages(body);
                            }
                        }
                        let index = channel.audio.len();
                        if let Some(sink) = self.track_sink.as_mut() {
                            sink.audio_track(index, pid, &language);
                        }
                        channel.audio.push(AudioTrack {
                            pid,
                            stream_type,
                            language,
                        });
                    }
                }
                0x06 => {
                    // PES private data: the descriptors decide what it is.
                    let mut dolby_tag = None;
                    let mut language = String::new();
                    for (tag, body) in descriptor_iter(descriptors) {
                        match tag {
                            descriptor_tag::AC3 | descriptor_tag::ENHANCED_AC3 => {
                                dolby_tag = Some(tag);
                            }
                            descriptor_tag::SUBTITLING => {
                                if channel.subtitle.len() < MAX_SPIDS {
                                    let track = self.parse_subtitling(body, pid);
                                    let index = channel.subtitle.len();
                                    if let Some(sink) = self.track_sink.as_mut() {
                                        sink.subtitle_track(index, pid, &track.language);
                                    }
                                    channel.subtitle.push(track);
                                }
                            }
                            descriptor_tag::ISO639_LANGUAGE => {
                                language = self.join_languages(body);
                            }
                            _ => {}
                        }
                    }
                    if let Some(tag) = dolby_tag {
                        if channel.dolby.len() < MAX_DPIDS {
                            let index = channel.dolby.len();
                            if let Some(sink) = self.track_sink.as_mut() {
                                sink.dolby_track(index, pid, &language);
                            }
                            channel.dolby.push(DolbyTrack {
                                pid,
                                descriptor_tag: tag,
                                language,
                            });
                        }
                    }
                }
                _ => {}
            }
        }

        self.channel = channel;
        self.pmt_version = Some(version);
    }

    /// Join the languages of an ISO-639 descriptor body (4-byte entries)
    /// into a '+'-separated string of at most two normalized codes. A code
    /// starting with '-' means "none" and is skipped.
    fn join_languages(&self, body: &[u8]) -> String {
        let mut out = String::new();
        let mut n = 0;
        for entry in body.chunks_exact(4) {
            if entry[0] == b'-' || entry[0] == 0 {
                continue;
            }
            let raw = String::from_utf8_lossy(&entry[..3]);
            if n > 0 {
                out.push('+');
            }
            out.push_str(&self.normalizer.normalize(raw.trim_end()));
            n += 1;
            if n > 1 {
                break;
            }
        }
        out
    }

    /// One subtitle track per subtitling descriptor; with several 8-byte
    /// entries the languages are joined and the page ids of the last entry
    /// win.
    fn parse_subtitling(&self, body: &[u8], pid: u16) -> SubtitleTrack {
        let mut track = SubtitleTrack {
            pid,
            ..Default::default()
        };
        let mut n = 0;
        for entry in body.chunks_exact(8) {
            if entry[0] == 0 || entry[0] == b'-' {
                continue;
            }
            track.subtitling_type = entry[3];
            track.composition_page_id = ((entry[4] as u16) << 8) | entry[5] as u16;
            track.ancillary_page_id = ((entry[6] as u16) << 8) | entry[7] as u16;
            let raw = String::from_utf8_lossy(&entry[..3]);
            if n > 0 {
                track.language.push('+');
            }
            track
                .language
                .push_str(&self.normalizer.normalize(raw.trim_end()));
            n += 1;
            if n > 1 {
                warn!("more than two subtitle languages on PID {}", pid);
                break;
            }
        }
        track
    }
}

fn descriptor_iter(data: &[u8]) -> impl Iterator<Item = (u8, &[u8])> {
    let mut offset = 0;
    std::iter::from_fn(move || {
        if offset + 2 > data.len() {
            return None;
        }
        let tag = data[offset];
        let length = data[offset + 1] as usize;
        if offset + 2 + length > data.len() {
            return None;
        }
        let body = &data[offset + 2..offset + 2 + length];
        offset += 2 + length;
        Some((tag, body))
    })
}
