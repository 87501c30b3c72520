//! PAT/PMT generation.
//!
//! Recordings carry their own program tables: a single-program PAT and a
//! PMT describing exactly the streams of the recorded channel, regenerated
//! from the channel descriptor instead of copied from the broadcast
//! multiplex. The generator builds both as ready-to-write TS packets and
//! hands them out with rolling continuity counters.

use crate::channel::{Channel, SubtitleTrack};
use crate::ts::{self, TS_SIZE};

use super::{crc32_mpeg2, descriptor_tag, table_id, MAX_SECTION_SIZE, PSEUDO_PMT_PID, PSEUDO_TSID};

/// Generates the PAT and PMT TS packets for one channel.
pub struct PatPmtGenerator {
    pmt_pid: u16,
    pat_counter: u8,
    pmt_counter: u8,
    pat_version: u8,
    pmt_version: u8,
    pat: [u8; TS_SIZE],
    pmt: Vec<[u8; TS_SIZE]>,
}

impl Default for PatPmtGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl PatPmtGenerator {
    pub fn new() -> Self {
        Self {
            pmt_pid: 0,
            pat_counter: 0,
            pmt_counter: 0,
            pat_version: 0,
            pmt_version: 0,
            pat: [0xFF; TS_SIZE],
            pmt: Vec::new(),
        }
    }

    /// Seed the 5-bit version numbers, used to continue numbering across a
    /// recording restart.
    pub fn set_versions(&mut self, pat_version: u8, pmt_version: u8) {
        self.pat_version = pat_version & 0x1F;
        self.pmt_version = pmt_version & 0x1F;
    }

    /// (Re)generate the PAT and PMT packets for `channel`.
    pub fn set_channel(&mut self, channel: &Channel) {
        self.generate_pmt_pid(channel);
        self.generate_pat();
        self.generate_pmt(channel);
    }

    /// The pseudo PMT PID chosen for the current channel.
    pub fn pmt_pid(&self) -> u16 {
        self.pmt_pid
    }

    /// Number of TS packets the current PMT section occupies.
    pub fn pmt_packet_count(&self) -> usize {
        self.pmt.len()
    }

    /// The PAT packet, with its continuity counter advanced on every call.
    pub fn pat(&mut self) -> &[u8; TS_SIZE] {
        let cc = self.pat_counter;
        self.pat[3] = (self.pat[3] & 0xF0) | cc;
        self.pat_counter = (cc + 1) & 0x0F;
        &self.pat
    }

    /// The `index`th PMT packet, advancing the shared PMT continuity
    /// counter, or `None` past the last packet.
    pub fn pmt(&mut self, index: usize) -> Option<&[u8; TS_SIZE]> {
        let packet = self.pmt.get_mut(index)?;
        let cc = self.pmt_counter;
        packet[3] = (packet[3] & 0xF0) | cc;
        self.pmt_counter = (cc + 1) & 0x0F;
        Some(packet)
    }

    /// Pick a PMT PID that collides with no PID the channel already uses.
    fn generate_pmt_pid(&mut self, channel: &Channel) {
        let mut used = [false; ts::MAX_PID];
        for pid in channel.pids() {
            if (pid as usize) < ts::MAX_PID {
                used[pid as usize] = true;
            }
        }
        let mut pid = PSEUDO_PMT_PID;
        while used[pid as usize] {
            pid += 1;
        }
        self.pmt_pid = pid;
    }

    fn generate_pat(&mut self) {
        let pmt_pid = self.pmt_pid;
        let version = self.pat_version;
        let p = &mut self.pat;
        *p = [0xFF; TS_SIZE];

        p[0] = ts::SYNC_BYTE;
        p[1] = ts::TS_PAYLOAD_START | (ts::PID_PAT >> 8) as u8;
        p[2] = ts::PID_PAT as u8;
        p[3] = ts::TS_PAYLOAD_EXISTS; // counter filled in on hand-out
        p[4] = 0x00; // pointer field
        let payload_start = 5;
        let mut i = payload_start;
        p[i] = table_id::PAT;
        i += 1;
        p[i] = 0xB0; // section syntax indicator, section length hi
        i += 1;
        let section_length = i;
        p[i] = 0x00; // section length lo, filled in below
        i += 1;
        p[i] = (PSEUDO_TSID >> 8) as u8;
        i += 1;
        p[i] = PSEUDO_TSID as u8;
        i += 1;
        p[i] = 0xC1 | (version << 1); // version, current/next = 1
        i += 1;
        p[i] = 0x00; // section number
        i += 1;
        p[i] = 0x00; // last section number
        i += 1;
        p[i] = (pmt_pid >> 8) as u8; // program number == PMT PID
        i += 1;
        p[i] = pmt_pid as u8;
        i += 1;
        p[i] = 0xE0 | (pmt_pid >> 8) as u8;
        i += 1;
        p[i] = pmt_pid as u8;
        i += 1;

        p[section_length] = (i - section_length - 1 + 4) as u8; // + CRC
        let crc = crc32_mpeg2(&p[payload_start..i]);
        p[i..i + 4].copy_from_slice(&crc.to_be_bytes());

        self.pat_version = (version + 1) & 0x1F;
    }

    fn generate_pmt(&mut self, channel: &Channel) {
        let mut section = Vec::with_capacity(MAX_SECTION_SIZE);
        section.push(table_id::PMT);
        let section_length = section.len();
        section.push(0xB0); // section syntax indicator, section length hi
        section.push(0x00); // section length lo, filled in below
        section.push((self.pmt_pid >> 8) as u8); // program number == PMT PID
        section.push(self.pmt_pid as u8);
        section.push(0xC1 | (self.pmt_version << 1));
        section.push(0x00); // section number
        section.push(0x00); // last section number
        section.push(0xE0 | (channel.ppid >> 8) as u8);
        section.push(channel.ppid as u8);
        section.push(0xF0); // program info length hi
        section.push(0x00); // program info length lo

        if channel.vpid != 0 {
            put_stream(&mut section, channel.vtype, channel.vpid);
        }
        for track in &channel.audio {
            let es_info = put_stream(&mut section, track.stream_type, track.pid);
            let n = put_language_descriptor(&mut section, &track.language);
            inc_es_info_length(&mut section, es_info, n);
        }
        for track in &channel.dolby {
            let es_info = put_stream(&mut section, 0x06, track.pid);
            let mut n = put_ac3_descriptor(&mut section, track.descriptor_tag);
            n += put_language_descriptor(&mut section, &track.language);
            inc_es_info_length(&mut section, es_info, n);
        }
        for track in &channel.subtitle {
            let es_info = put_stream(&mut section, 0x06, track.pid);
            let n = put_subtitling_descriptor(&mut section, track);
            inc_es_info_length(&mut section, es_info, n);
        }

        let sl = section.len() - section_length - 2 + 4; // + CRC
        section[section_length] |= ((sl >> 8) & 0x0F) as u8;
        section[section_length + 1] = sl as u8;
        let crc = crc32_mpeg2(&section);
        section.extend_from_slice(&crc.to_be_bytes());

        // Slice the section into TS packets, payload-unit start and a zero
        // pointer field only on the first one.
        self.pmt.clear();
        let mut remaining = &section[..];
        let mut pusi = true;
        while !remaining.is_empty() {
            let mut p = [0xFF; TS_SIZE];
            let start_flag = if pusi { ts::TS_PAYLOAD_START } else { 0x00 };
            p[0] = ts::SYNC_BYTE;
            p[1] = start_flag | (self.pmt_pid >> 8) as u8;
            p[2] = self.pmt_pid as u8;
            p[3] = ts::TS_PAYLOAD_EXISTS;
            let mut j = 4;
            if pusi {
                p[j] = 0x00; // pointer field
                j += 1;
                pusi = false;
            }
            let l = (TS_SIZE - j).min(remaining.len());
            p[j..j + l].copy_from_slice(&remaining[..l]);
            remaining = &remaining[l..];
            self.pmt.push(p);
        }

        self.pmt_version = (self.pmt_version + 1) & 0x1F;
    }
}

/// Append a 5-byte stream-info header and return the index of its ES info
/// length field for later patching.
fn put_stream(section: &mut Vec<u8>, stream_type: u8, pid: u16) -> usize {
    section.push(stream_type);
    section.push(0xE0 | (pid >> 8) as u8);
    section.push(pid as u8);
    let es_info = section.len();
    section.push(0xF0); // ES info length hi
    section.push(0x00); // ES info length lo
    es_info
}

/// Add `added` bytes to the ES info length recorded at `at`.
fn inc_es_info_length(section: &mut [u8], at: usize, added: usize) {
    let length = (((section[at] as usize & 0x0F) << 8) | section[at + 1] as usize) + added;
    section[at] = 0xF0 | ((length >> 8) & 0x0F) as u8;
    section[at + 1] = length as u8;
}

/// ISO-639 language descriptor; a multi-language string like "deu+fra"
/// becomes repeated 4-byte entries. Returns the number of bytes appended.
fn put_language_descriptor(section: &mut Vec<u8>, language: &str) -> usize {
    let start = section.len();
    section.push(descriptor_tag::ISO639_LANGUAGE);
    let length_at = section.len();
    section.push(0x00);
    for code in language.split('+') {
        let mut bytes = code.bytes();
        for _ in 0..3 {
            section.push(bytes.next().unwrap_or(b' '));
        }
        section.push(0x00); // audio type
        section[length_at] += 0x04;
    }
    section.len() - start
}

/// AC-3 / enhanced AC-3 descriptor with an empty body.
fn put_ac3_descriptor(section: &mut Vec<u8>, tag: u8) -> usize {
    section.extend_from_slice(&[tag, 0x01, 0x00]);
    3
}

/// Subtitling descriptor with a single subtitle entry.
fn put_subtitling_descriptor(section: &mut Vec<u8>, track: &SubtitleTrack) -> usize {
    let start = section.len();
    section.push(descriptor_tag::SUBTITLING);
    section.push(0x08);
    let mut bytes = track.language.bytes();
    for _ in 0..3 {
        section.push(bytes.next().unwrap_or(b' '));
    }
    section.push(track.subtitling_type);
    section.push((track.composition_page_id >> 8) as u8);
    section.push(track.composition_page_id as u8);
    section.push((track.ancillary_page_id >> 8) as u8);
    section.push(track.ancillary_page_id as u8);
    section.len() - start
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{AudioTrack, DolbyTrack};
    use crate::psi::section_total_length;

    fn simple_channel() -> Channel {
        Channel {
            vpid: 0x100,
            vtype: 0x02,
            ppid: 0x100,
            audio: vec![AudioTrack {
                pid: 0x101,
                stream_type: 0x04,
                language: "eng".into(),
            }],
            ..Default::default()
        }
    }

    fn big_channel() -> Channel {
        let mut channel = Channel {
            vpid: 0x100,
            vtype: 0x1B,
            ppid: 0x100,
            ..Default::default()
        };
        for n in 0..8u16 {
            channel.audio.push(AudioTrack {
                pid: 0x110 + n,
                stream_type: 0x04,
                language: format!("a{:02}", n),
            });
        }
        for n in 0..4u16 {
            channel.dolby.push(DolbyTrack {
                pid: 0x120 + n,
                descriptor_tag: descriptor_tag::AC3,
                language: format!("d{:02}", n),
            });
        }
        for n in 0..4u16 {
            channel.subtitle.push(SubtitleTrack {
                pid: 0x130 + n,
                language: format!("s{:02}", n),
                subtitling_type: 0x10,
                composition_page_id: n + 1,
                ancillary_page_id: n + 2,
            });
        }
        channel
    }

    #[test]
    fn test_pat_layout() {
        let mut generator = PatPmtGenerator::new();
        generator.set_channel(&simple_channel());

        let pat = *generator.pat();
        assert_eq!(pat.len(), TS_SIZE);
        assert_eq!(pat[0], ts::SYNC_BYTE);
        assert_eq!(ts::pid(&pat), ts::PID_PAT);
        assert!(ts::payload_start(&pat));
        assert_eq!(pat[4], 0x00); // pointer field
        assert_eq!(pat[5], table_id::PAT);

        // Pseudo transport stream id.
        assert_eq!(((pat[8] as u16) << 8) | pat[9] as u16, PSEUDO_TSID);

        // Single association: program number == PMT PID == 0x0084.
        assert_eq!(generator.pmt_pid(), PSEUDO_PMT_PID);
        assert_eq!(((pat[13] as u16) << 8) | pat[14] as u16, PSEUDO_PMT_PID);
        assert_eq!(((pat[15] as u16 & 0x1F) << 8) | pat[16] as u16, PSEUDO_PMT_PID);

        // CRC over table_id..last association validates.
        let total = section_total_length(&pat[5..]).unwrap();
        let section = &pat[5..5 + total];
        let stored = u32::from_be_bytes(section[total - 4..].try_into().unwrap());
        assert_eq!(crc32_mpeg2(&section[..total - 4]), stored);

        // Remaining bytes are stuffing.
        assert!(pat[5 + total..].iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn test_pmt_pid_skips_used_pids() {
        let mut channel = simple_channel();
        channel.audio[0].pid = PSEUDO_PMT_PID;
        channel.dolby.push(DolbyTrack {
            pid: PSEUDO_PMT_PID + 1,
            descriptor_tag: descriptor_tag::AC3,
            language: "eng".into(),
        });

        let mut generator = PatPmtGenerator::new();
        generator.set_channel(&channel);
        assert_eq!(generator.pmt_pid(), PSEUDO_PMT_PID + 2);
    }

    #[test]
    fn test_pat_counter_increments() {
        let mut generator = PatPmtGenerator::new();
        generator.set_channel(&simple_channel());

        for expected in 0..32u8 {
            let pat = generator.pat();
            assert_eq!(ts::continuity_counter(pat), expected & 0x0F);
        }
    }

    #[test]
    fn test_pmt_counter_spans_packets() {
        let mut generator = PatPmtGenerator::new();
        generator.set_channel(&big_channel());
        assert!(generator.pmt_packet_count() >= 2);

        let mut expected = 0u8;
        for _ in 0..3 {
            let mut index = 0;
            while let Some(packet) = generator.pmt(index) {
                assert_eq!(ts::continuity_counter(packet), expected);
                expected = (expected + 1) & 0x0F;
                index += 1;
            }
            assert_eq!(index, generator.pmt_packet_count());
        }
    }

    #[test]
    fn test_multi_packet_pmt_layout() {
        let mut generator = PatPmtGenerator::new();
        generator.set_channel(&big_channel());

        let count = generator.pmt_packet_count();
        assert!(count >= 2);

        let mut section = Vec::new();
        for index in 0..count {
            let packet = *generator.pmt(index).unwrap();
            assert_eq!(packet[0], ts::SYNC_BYTE);
            assert_eq!(ts::pid(&packet), generator.pmt_pid());
            if index == 0 {
                assert!(ts::payload_start(&packet));
                assert_eq!(packet[4], 0x00); // pointer field
                section.extend_from_slice(&packet[5..]);
            } else {
                assert!(!ts::payload_start(&packet));
                section.extend_from_slice(&packet[4..]);
            }
        }

        let total = section_total_length(&section).unwrap();
        assert!(total > TS_SIZE - 5, "section should span packets");
        assert_eq!(section[0], table_id::PMT);
        let stored = u32::from_be_bytes(section[total - 4..total].try_into().unwrap());
        assert_eq!(crc32_mpeg2(&section[..total - 4]), stored);

        // Tail of the last packet is stuffing.
        assert!(section[total..].iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn test_versions_roll() {
        let mut generator = PatPmtGenerator::new();
        generator.set_versions(3, 7);
        generator.set_channel(&simple_channel());

        let pat = *generator.pat();
        assert_eq!((pat[10] >> 1) & 0x1F, 3);
        let pmt = *generator.pmt(0).unwrap();
        assert_eq!((pmt[10] >> 1) & 0x1F, 7);

        // Regenerating bumps both versions.
        generator.set_channel(&simple_channel());
        let pat = *generator.pat();
        assert_eq!((pat[10] >> 1) & 0x1F, 4);
        let pmt = *generator.pmt(0).unwrap();
        assert_eq!((pmt[10] >> 1) & 0x1F, 8);
    }
}
