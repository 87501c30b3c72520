//! AVC filler-NALU removal.
//!
//! Broadcast AVC streams pad their bitrate with filler NAL units (type 12:
//! a run of 0xFF bytes closed by the 0x80 RBSP trailing byte). For a
//! recording they are dead weight. [`NaluDumper`] rewrites the video
//! packets in place: filler bytes inside a packet are turned into
//! adaptation-field stuffing, packets that carry nothing but filler are
//! dropped, and the continuity counters of the surviving packets are
//! renumbered so the output stays gap-free while input discontinuities are
//! reproduced.
//!
//! [`NaluStreamProcessor`] wraps the dumper for arbitrary byte streams:
//! it reassembles TS packets straddling buffer boundaries, resynchronizes
//! after corruption, and can learn the video PID by sniffing PAT/PMT.

use log::{error, info, warn};

use crate::psi::parser::PatPmtParser;
use crate::ts::{self, PID_PAT, SYNC_BYTE, TS_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FillState {
    /// Not inside filler data.
    None,
    /// Consuming the 0xFF run of a filler NALU.
    Fill,
    /// The terminating 0x80 byte has just been consumed.
    Term,
    /// Directly behind a completed filler run.
    End,
}

/// What a payload scan found out about droppable bytes.
struct PayloadInfo {
    /// Filler bytes at the start of the payload (residue of a run
    /// terminated early in an earlier packet).
    drop_start_bytes: usize,
    /// Filler bytes running to the end of the payload.
    drop_end_bytes: usize,
    /// The whole payload consists of filler.
    drop_all_bytes: bool,
}

/// Strips filler NAL units from the TS packets of one AVC stream.
pub struct NaluDumper {
    last_cc_in: Option<u8>,
    last_cc_out: u8,
    continuity_offset: u8,
    pes_id: Option<u8>,
    pes_offset: usize,
    fill_state: FillState,
    nalu_offset: usize,
    history: u32,
    drop_all_payload: bool,
}

impl Default for NaluDumper {
    fn default() -> Self {
        Self::new()
    }
}

impl NaluDumper {
    pub fn new() -> Self {
        Self {
            last_cc_in: None,
            // One before 0, so the first payload packet gets counter 0.
            last_cc_out: 0x0F,
            continuity_offset: 0,
            pes_id: None,
            pes_offset: 0,
            fill_state: FillState::None,
            nalu_offset: 0,
            history: 0xFFFF_FFFF,
            drop_all_payload: false,
        }
    }

    /// Process one 188-byte packet in place.
    ///
    /// Returns `true` when the packet carries nothing worth keeping and
    /// must be dropped from the output.
    pub fn process_ts_packet(&mut self, packet: &mut [u8]) -> bool {
        let has_adaptation = ts::has_adaptation_field(packet);
        let has_payload = ts::has_payload(packet);

        // Track input continuity; a gap must reappear in the output.
        let cc_in = ts::continuity_counter(packet);
        if let Some(last) = self.last_cc_in {
            let expected = if has_payload { (last + 1) & 0x0F } else { last };
            let offset = cc_in.wrapping_sub(expected) & 0x0F;
            if offset > 0 {
                warn!("TS continuity offset {}", offset);
            }
            if offset > self.continuity_offset {
                // Maximum while packets get dropped, otherwise the
                // current one.
                self.continuity_offset = offset;
            }
        }
        self.last_cc_in = Some(cc_in);

        if has_payload {
            let offset = ts::payload_offset(packet);
            let payload_start = ts::payload_start(packet);
            let info = self.process_payload(&mut packet[offset..TS_SIZE], payload_start);

            if self.drop_all_payload && !info.drop_all_bytes {
                // Back from drop mode to normal mode.
                self.drop_all_payload = false;

                if info.drop_start_bytes > 0 {
                    // The packet begins with leftover filler, e.g.
                    //   FF FF FF 80 00 00 01 xx ...
                    //            ^-- drop_start_bytes
                    // Absorb those bytes as adaptation-field stuffing;
                    // the payload itself never moves.
                    ts::extend_adaptation_field(
                        packet,
                        (offset - 4 + info.drop_start_bytes) as i32,
                    );
                }
            }

            let mut drop_this_payload = self.drop_all_payload;

            if !self.drop_all_payload && info.drop_end_bytes > 0 {
                // The payload ends inside a filler run. Terminate the run
                // right here and drop every following packet until real
                // data shows up; its leading filler residue is absorbed
                // via drop_start_bytes above.
                packet[TS_SIZE - 1] = 0x80;
                self.drop_all_payload = true;
            }

            if drop_this_payload && has_adaptation {
                // Keep the adaptation field, remove only the payload.
                ts::extend_adaptation_field(packet, (TS_SIZE - 4) as i32);
                drop_this_payload = false;
            }

            if drop_this_payload {
                return true;
            }
        }

        // Renumber the continuity counter, reproducing input offsets.
        let mut cc_out = if ts::has_payload(packet) {
            (self.last_cc_out + 1) & 0x0F
        } else {
            self.last_cc_out
        };
        cc_out = (cc_out + self.continuity_offset) & 0x0F;
        ts::set_continuity_counter(packet, cc_out);
        self.last_cc_out = cc_out;
        self.continuity_offset = 0;

        false
    }

    /// Scan payload bytes, maintaining the PES/NALU state machine across
    /// packets, and record which bytes belong to filler NAL units.
    fn process_payload(&mut self, payload: &mut [u8], payload_start: bool) -> PayloadInfo {
        let mut info = PayloadInfo {
            drop_start_bytes: 0,
            drop_end_bytes: 0,
            drop_all_bytes: false,
        };
        let mut last_keep_byte = None;

        if payload_start {
            self.history = 0xFFFF_FFFF;
            self.pes_id = None;
            self.fill_state = FillState::None;
        }

        for i in 0..payload.len() {
            self.history = (self.history << 8) | payload[i] as u32;
            self.pes_offset = self.pes_offset.wrapping_add(1);
            self.nalu_offset = self.nalu_offset.wrapping_add(1);

            let mut drop_byte = false;
            let video_pes = matches!(self.pes_id, Some(id) if (0xE0..=0xEF).contains(&id));

            if (0x0000_0180..=0x0000_01FF).contains(&self.history) {
                // Start of a PES packet.
                self.pes_id = Some((self.history & 0xFF) as u8);
                self.pes_offset = 0;
                self.fill_state = FillState::None;
            } else if video_pes && (0x0000_0100..=0x0000_017F).contains(&self.history) {
                // NALU start code.
                let nalu_id = (self.history & 0xFF) as u8;
                self.nalu_offset = 0;
                self.fill_state = if nalu_id & 0x1F == 0x0C {
                    FillState::Fill
                } else {
                    FillState::None
                };
            }

            if video_pes && (1..=2).contains(&self.pes_offset) {
                // Zero out the PES length field; dropping filler changes
                // the packet length, and video PES may leave it undefined.
                payload[i] = 0;
            }

            if self.fill_state == FillState::Fill && self.nalu_offset > 0 {
                // A run of 0xFF bytes terminated by a single 0x80.
                match payload[i] {
                    0xFF => drop_byte = true,
                    0x80 => {
                        self.fill_state = FillState::Term;
                        drop_byte = true;
                    }
                    byte => {
                        warn!("unexpected NALU fill data: {:02x}", byte);
                        self.fill_state = FillState::End;
                        if last_keep_byte.is_none() {
                            // Filler from the beginning of the packet up
                            // to here.
                            info.drop_start_bytes = i;
                        }
                    }
                }
            } else if self.fill_state == FillState::Term {
                // First byte after the terminating 0x80.
                self.fill_state = FillState::End;
                if last_keep_byte.is_none() {
                    info.drop_start_bytes = i;
                }
            }

            if !drop_byte {
                last_keep_byte = Some(i);
            }
        }

        info.drop_all_bytes = last_keep_byte.is_none();
        info.drop_end_bytes = match last_keep_byte {
            Some(i) => payload.len() - 1 - i,
            None => payload.len(),
        };
        info
    }
}

/// Streaming front end of the [`NaluDumper`].
///
/// Accepts arbitrary byte ranges, cuts them into TS packets (reassembling
/// packets that straddle buffer boundaries), runs the video packets
/// through the dumper and returns the surviving bytes chunk by chunk.
pub struct NaluStreamProcessor {
    dumper: NaluDumper,
    parser: Option<PatPmtParser>,
    vpid: Option<u16>,
    data: Vec<u8>,
    pos: usize,
    temp: [u8; TS_SIZE],
    temp_len: usize,
    temp_at_end: bool,
    total_packets: u64,
    dropped_packets: u64,
}

impl Default for NaluStreamProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl NaluStreamProcessor {
    pub fn new() -> Self {
        Self {
            dumper: NaluDumper::new(),
            parser: None,
            vpid: None,
            data: Vec::new(),
            pos: 0,
            temp: [0; TS_SIZE],
            temp_len: 0,
            temp_at_end: false,
            total_packets: 0,
            dropped_packets: 0,
        }
    }

    /// Process packets of this PID, regardless of what the tables say.
    pub fn set_pid(&mut self, vpid: u16) {
        self.vpid = Some(vpid);
    }

    /// Learn the video PID and stream type from PAT/PMT packets found in
    /// the stream itself.
    pub fn enable_pat_pmt_sniffing(&mut self) {
        if self.parser.is_none() {
            self.parser = Some(PatPmtParser::new());
        }
    }

    /// Packets seen so far.
    pub fn total_packets(&self) -> u64 {
        self.total_packets
    }

    /// Packets removed from the stream so far.
    pub fn dropped_packets(&self) -> u64 {
        self.dropped_packets
    }

    /// Hand the processor the next byte range. All previously put data
    /// must have been drained with [`get`](Self::get) first.
    pub fn put(&mut self, data: &[u8]) {
        if self.pos < self.data.len() {
            error!("new data before old data was processed");
        }
        self.data.clear();
        self.data.extend_from_slice(data);
        self.pos = 0;
    }

    /// The next chunk of output, or `None` when all put data has been
    /// consumed (possibly leaving a partial packet buffered for the next
    /// [`put`](Self::put)).
    pub fn get(&mut self) -> Option<&[u8]> {
        if self.pos >= self.data.len() {
            return None;
        }

        if self.temp_len > 0 {
            if self.temp_at_end {
                self.temp.copy_within(TS_SIZE - self.temp_len.., 0);
                self.temp_at_end = false;
            }
            // Top up the partial packet from the new data.
            if self.temp_len < TS_SIZE {
                let size = (TS_SIZE - self.temp_len).min(self.data.len() - self.pos);
                self.temp[self.temp_len..self.temp_len + size]
                    .copy_from_slice(&self.data[self.pos..self.pos + size]);
                self.pos += size;
                self.temp_len += size;
            }
            if self.temp_len < TS_SIZE {
                return None; // everything buffered, still not a packet
            }
            if self.temp[0] != SYNC_BYTE {
                let remaining = self.data.len() - self.pos;
                let mut skipped = 1;
                while skipped < TS_SIZE
                    && (self.temp[skipped] != SYNC_BYTE
                        || (skipped < remaining && self.data[self.pos + skipped] != SYNC_BYTE))
                {
                    skipped += 1;
                }
                warn!("skipped {} bytes to sync on start of TS packet", skipped);
                // Pass the skipped bytes through untouched.
                self.temp_at_end = true;
                self.temp_len = TS_SIZE - skipped;
                return Some(&self.temp[..skipped]);
            }

            let pid = ts::pid(&self.temp);
            if let Some(parser) = self.parser.as_mut() {
                if pid == PID_PAT {
                    parser.parse_pat(&self.temp);
                } else if Some(pid) == parser.pmt_pid() {
                    parser.parse_pmt(&self.temp);
                }
            }
            self.total_packets += 1;
            let drop = self.is_target(pid) && self.dumper.process_ts_packet(&mut self.temp);
            self.temp_len = 0;
            if !drop {
                return Some(&self.temp[..TS_SIZE]);
            }
            self.dropped_packets += 1;
        }

        // Whole packets straight out of the put buffer, compacted in
        // place over dropped ones.
        let out_start = self.pos;
        let mut out_end = self.pos;
        while self.pos + TS_SIZE <= self.data.len() {
            if self.data[self.pos] != SYNC_BYTE {
                let mut skipped = 1;
                while self.pos + skipped < self.data.len()
                    && (self.data[self.pos + skipped] != SYNC_BYTE
                        || (self.data.len() - (self.pos + skipped) > TS_SIZE
                            && self.data[self.pos + skipped + TS_SIZE] != SYNC_BYTE))
                {
                    skipped += 1;
                }
                warn!("skipped {} bytes to sync on start of TS packet", skipped);
                if out_end != self.pos {
                    self.data.copy_within(self.pos..self.pos + skipped, out_end);
                }
                out_end += skipped;
                self.pos += skipped;
                continue;
            }

            let pid = ts::pid(&self.data[self.pos..]);
            if let Some(parser) = self.parser.as_mut() {
                if pid == PID_PAT {
                    parser.parse_pat(&self.data[self.pos..self.pos + TS_SIZE]);
                } else if Some(pid) == parser.pmt_pid() {
                    parser.parse_pmt(&self.data[self.pos..self.pos + TS_SIZE]);
                }
            }
            self.total_packets += 1;
            let drop = self.is_target(pid)
                && self
                    .dumper
                    .process_ts_packet(&mut self.data[self.pos..self.pos + TS_SIZE]);
            if !drop {
                if out_end != self.pos {
                    self.data.copy_within(self.pos..self.pos + TS_SIZE, out_end);
                }
                out_end += TS_SIZE;
            } else {
                self.dropped_packets += 1;
            }
            self.pos += TS_SIZE;
        }

        // Stash a trailing partial packet for the next put.
        let rem = self.data.len() - self.pos;
        if rem > 0 {
            self.temp[..rem].copy_from_slice(&self.data[self.pos..]);
            self.temp_len = rem;
            self.temp_at_end = false;
            self.pos = self.data.len();
        }

        if out_end > out_start {
            Some(&self.data[out_start..out_end])
        } else {
            None
        }
    }

    /// Log how much the filler removal saved.
    pub fn log_statistics(&self) {
        if self.total_packets > 0 {
            info!(
                "NALU fill dumper: {} of {} packets dropped ({}%)",
                self.dropped_packets,
                self.total_packets,
                self.dropped_packets * 100 / self.total_packets
            );
        }
    }

    fn is_target(&self, pid: u16) -> bool {
        if pid == 0 {
            return false;
        }
        if self.vpid == Some(pid) {
            return true;
        }
        match &self.parser {
            Some(parser) => parser.vpid() == pid && parser.vtype() == 0x1B,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{Channel, AudioTrack};
    use crate::psi::generator::PatPmtGenerator;

    const VIDEO_PID: u16 = 0x100;

    /// Video packet with the given payload head; the rest of the payload
    /// is 0xAA slice data.
    fn video_packet(pusi: bool, cc: u8, head: &[u8]) -> [u8; TS_SIZE] {
        assert!(head.len() <= TS_SIZE - 4);
        let mut p = [0xAAu8; TS_SIZE];
        let start_flag = if pusi { ts::TS_PAYLOAD_START } else { 0 };
        p[0] = SYNC_BYTE;
        p[1] = start_flag | (VIDEO_PID >> 8) as u8;
        p[2] = VIDEO_PID as u8;
        p[3] = ts::TS_PAYLOAD_EXISTS | (cc & 0x0F);
        p[4..4 + head.len()].copy_from_slice(head);
        p
    }

    fn pes_start() -> Vec<u8> {
        // Video PES with undefined (zero) length, no timestamps, followed
        // by an access unit delimiter and an IDR slice start.
        let mut head = vec![0x00, 0x00, 0x01, 0xE0, 0x00, 0x00, 0x80, 0x00, 0x00];
        head.extend_from_slice(&[0x00, 0x00, 0x01, 0x09, 0x10]);
        head.extend_from_slice(&[0x00, 0x00, 0x01, 0x65]);
        head
    }

    /// The ten-packet burst: packets 2..=5 carry a filler run, packet 6
    /// starts with its residue.
    fn filler_burst() -> Vec<[u8; TS_SIZE]> {
        let mut pkts = Vec::new();
        pkts.push(video_packet(true, 0, &pes_start()));
        pkts.push(video_packet(false, 1, &[]));
        // Filler NALU starting mid-packet, running to the packet end.
        let mut head = vec![0xAA; 50];
        head.extend_from_slice(&[0x00, 0x00, 0x01, 0x0C]);
        head.extend_from_slice(&vec![0xFF; TS_SIZE - 4 - head.len()]);
        pkts.push(video_packet(false, 2, &head));
        // Pure filler, but with an adaptation field worth keeping.
        let mut with_af = video_packet(false, 3, &[]);
        with_af[3] |= ts::TS_ADAPT_FIELD_EXISTS;
        with_af[4] = 0;
        for b in &mut with_af[5..] {
            *b = 0xFF;
        }
        pkts.push(with_af);
        // Pure filler, droppable.
        let mut pure = video_packet(false, 4, &[]);
        for b in &mut pure[4..] {
            *b = 0xFF;
        }
        pkts.push(pure);
        let mut pure = video_packet(false, 5, &[]);
        for b in &mut pure[4..] {
            *b = 0xFF;
        }
        pkts.push(pure);
        // Residual filler, terminator, then real data.
        let mut head = vec![0xFF; 10];
        head.push(0x80);
        head.extend_from_slice(&[0x00, 0x00, 0x01, 0x09, 0x10]);
        pkts.push(video_packet(false, 6, &head));
        pkts.push(video_packet(false, 7, &[]));
        pkts.push(video_packet(true, 8, &pes_start()));
        pkts.push(video_packet(false, 9, &[]));
        pkts
    }

    fn run_dumper(pkts: &[[u8; TS_SIZE]]) -> Vec<[u8; TS_SIZE]> {
        let mut dumper = NaluDumper::new();
        let mut out = Vec::new();
        for pkt in pkts {
            let mut copy = *pkt;
            if !dumper.process_ts_packet(&mut copy) {
                out.push(copy);
            }
        }
        out
    }

    #[test]
    fn test_no_filler_is_byte_identical() {
        let pkts = vec![
            video_packet(true, 0, &pes_start()),
            video_packet(false, 1, &[]),
            video_packet(false, 2, &[]),
            video_packet(true, 3, &pes_start()),
            video_packet(false, 4, &[]),
        ];
        let out = run_dumper(&pkts);
        assert_eq!(out, pkts);
    }

    #[test]
    fn test_filler_burst() {
        let pkts = filler_burst();
        let out = run_dumper(&pkts);

        // The two pure-filler packets without adaptation field are gone.
        assert_eq!(out.len(), pkts.len() - 2);
        for pkt in &out {
            assert_eq!(pkt.len(), TS_SIZE);
            assert_eq!(pkt[0], SYNC_BYTE);
        }

        // The packet ending in an unterminated run got closed early.
        assert_eq!(out[2][TS_SIZE - 1], 0x80);

        // The pure-filler packet with an adaptation field survives as
        // field-only stuffing.
        assert!(ts::has_adaptation_field(&out[3]));
        assert!(!ts::has_payload(&out[3]));
        assert_eq!(out[3][4] as usize, TS_SIZE - 5);

        // The residue packet absorbed its 11 leading filler bytes into a
        // new adaptation field; the real data did not move.
        assert!(ts::has_adaptation_field(&out[4]));
        assert_eq!(out[4][4], 10);
        assert_eq!(ts::payload_offset(&out[4]), 15);
        assert_eq!(&out[4][15..20], &[0x00, 0x00, 0x01, 0x09, 0x10]);

        // Continuity: +1 per payload packet, unchanged for the
        // field-only packet, no gap where packets were dropped.
        let ccs: Vec<u8> = out.iter().map(|p| ts::continuity_counter(p)).collect();
        assert_eq!(ccs, vec![0, 1, 2, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_second_pass_is_noop() {
        let out = run_dumper(&filler_burst());
        let again = run_dumper(&out);
        assert_eq!(again, out);
    }

    #[test]
    fn test_input_gap_is_reproduced() {
        // Continuity 0, 1, 3, 4: one packet lost upstream.
        let pkts = vec![
            video_packet(true, 0, &pes_start()),
            video_packet(false, 1, &[]),
            video_packet(false, 3, &[]),
            video_packet(false, 4, &[]),
        ];
        let out = run_dumper(&pkts);
        let ccs: Vec<u8> = out.iter().map(|p| ts::continuity_counter(p)).collect();
        assert_eq!(ccs, vec![0, 1, 3, 4]);
    }

    #[test]
    fn test_pes_length_field_zeroed() {
        let mut head = pes_start();
        head[4] = 0x12; // pretend the PES length was set
        head[5] = 0x34;
        let pkts = vec![video_packet(true, 0, &head)];
        let out = run_dumper(&pkts);
        assert_eq!(out[0][8], 0x00);
        assert_eq!(out[0][9], 0x00);
    }

    #[test]
    fn test_processor_passthrough_in_chunks() {
        let pkts = vec![
            video_packet(true, 0, &pes_start()),
            video_packet(false, 1, &[]),
            video_packet(true, 2, &pes_start()),
            video_packet(false, 3, &[]),
        ];
        let stream: Vec<u8> = pkts.iter().flat_map(|p| p.iter().copied()).collect();

        let mut processor = NaluStreamProcessor::new();
        processor.set_pid(VIDEO_PID);

        let mut out = Vec::new();
        for chunk in stream.chunks(100) {
            processor.put(chunk);
            while let Some(piece) = processor.get() {
                out.extend_from_slice(piece);
            }
        }
        assert_eq!(out, stream);
        assert_eq!(processor.total_packets(), 4);
        assert_eq!(processor.dropped_packets(), 0);
    }

    #[test]
    fn test_processor_drops_filler_packets() {
        let pkts = filler_burst();
        let stream: Vec<u8> = pkts.iter().flat_map(|p| p.iter().copied()).collect();

        let mut processor = NaluStreamProcessor::new();
        processor.set_pid(VIDEO_PID);
        processor.put(&stream);

        let mut out = Vec::new();
        while let Some(piece) = processor.get() {
            out.extend_from_slice(piece);
        }
        assert_eq!(out.len(), (pkts.len() - 2) * TS_SIZE);
        assert_eq!(processor.dropped_packets(), 2);
    }

    #[test]
    fn test_processor_resyncs_on_garbage() {
        let pkts = vec![
            video_packet(true, 0, &pes_start()),
            video_packet(false, 1, &[]),
        ];
        let mut stream = vec![0x13u8, 0x37];
        for p in &pkts {
            stream.extend_from_slice(p);
        }

        let mut processor = NaluStreamProcessor::new();
        processor.set_pid(VIDEO_PID);
        processor.put(&stream);

        let mut out = Vec::new();
        while let Some(piece) = processor.get() {
            out.extend_from_slice(piece);
        }
        // Garbage passes through, packets follow untouched.
        assert_eq!(out, stream);
    }

    #[test]
    fn test_processor_learns_pid_from_tables() {
        let channel = Channel {
            vpid: VIDEO_PID,
            vtype: 0x1B,
            ppid: VIDEO_PID,
            audio: vec![AudioTrack {
                pid: 0x101,
                stream_type: 0x04,
                language: "eng".into(),
            }],
            ..Default::default()
        };
        let mut generator = PatPmtGenerator::new();
        generator.set_channel(&channel);

        let mut stream = Vec::new();
        stream.extend_from_slice(generator.pat());
        let mut index = 0;
        while let Some(pmt) = generator.pmt(index) {
            stream.extend_from_slice(pmt);
            index += 1;
        }
        let table_packets = 1 + index;

        let pkts = filler_burst();
        for p in &pkts {
            stream.extend_from_slice(p);
        }

        let mut processor = NaluStreamProcessor::new();
        processor.enable_pat_pmt_sniffing();
        processor.put(&stream);

        let mut out = Vec::new();
        while let Some(piece) = processor.get() {
            out.extend_from_slice(piece);
        }
        assert_eq!(
            out.len(),
            (table_packets + pkts.len() - 2) * TS_SIZE,
            "filler packets dropped once the tables were sniffed"
        );
        assert_eq!(processor.dropped_packets(), 2);
    }
}
