use super::PartitionLog;
use crate::message::Message;
use crate::{Error, Result};
use parking_lot::{Mutex, RwLock};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Length-prefixed frame header size (u32, little endian)
const FRAME_HEADER: usize = 4;

/// File-backed partition log.
///
/// One segment file per partition: a sequence of `[len: u32 LE][bincode
/// Message]` frames. On open the file is scanned to rebuild the offset →
/// file-position index; a truncated trailing frame (crash mid-write) is
/// dropped and the file truncated back to the last complete frame.
///
/// Each topic has exactly one producing stage, so a segment has a single
/// writer process. Reader processes lazily rescan the file tail when asked
/// for offsets past their index, which is how a consumer deployed in a
/// different process from the producer sees new appends.
pub struct SegmentLog {
    path: PathBuf,
    writer: BufWriter<File>,
    /// Byte position of each frame, indexed by offset
    positions: RwLock<Vec<u64>>,
    /// Write position at the end of the last complete frame
    end_pos: Mutex<u64>,
    reader: Mutex<File>,
    flush_each_append: bool,
}

impl SegmentLog {
    /// Open (or create) the segment for `topic`/`partition` under `base_dir`
    pub fn open(
        base_dir: &Path,
        topic: &str,
        partition: u32,
        flush_each_append: bool,
    ) -> Result<Self> {
        let dir = base_dir.join(topic);
        fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{:05}.log", partition));

        let mut scan = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        let (positions, end_pos) = Self::scan_from(&mut scan, &path, 0)?;

        let file_len = scan.metadata()?.len();
        if end_pos < file_len {
            warn!(
                path = %path.display(),
                dropped_bytes = file_len - end_pos,
                "Truncating incomplete trailing frame"
            );
            scan.set_len(end_pos)?;
        }

        let mut write_file = OpenOptions::new().append(true).open(&path)?;
        write_file.seek(SeekFrom::End(0))?;

        let reader = File::open(&path)?;

        if !positions.is_empty() {
            info!(
                topic,
                partition,
                recovered = positions.len(),
                "Recovered partition segment"
            );
        }

        Ok(Self {
            path,
            writer: BufWriter::new(write_file),
            positions: RwLock::new(positions),
            end_pos: Mutex::new(end_pos),
            reader: Mutex::new(reader),
            flush_each_append,
        })
    }

    /// Scan frames from `start_pos`, returning their positions and the end
    /// of the last complete frame.
    fn scan_from(file: &mut File, path: &Path, start_pos: u64) -> Result<(Vec<u64>, u64)> {
        let mut positions = Vec::new();
        let mut pos = start_pos;
        file.seek(SeekFrom::Start(start_pos))?;

        loop {
            let mut header = [0u8; FRAME_HEADER];
            match file.read_exact(&mut header) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
            let len = u32::from_le_bytes(header) as u64;

            let mut body = vec![0u8; len as usize];
            match file.read_exact(&mut body) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }

            // A frame that fails to decode marks the end of the valid log
            if Message::from_bytes(&body).is_err() {
                warn!(path = %path.display(), pos, "Undecodable frame, stopping recovery");
                break;
            }

            positions.push(pos);
            pos += FRAME_HEADER as u64 + len;
        }

        Ok((positions, pos))
    }

    /// Pick up frames another process appended since our last scan
    fn rescan_tail(&self) -> Result<()> {
        let mut end_pos = self.end_pos.lock();
        let file_len = fs::metadata(&self.path)?.len();
        if file_len <= *end_pos {
            return Ok(());
        }

        let mut reader = self.reader.lock();
        let (new_positions, new_end) = Self::scan_from(&mut reader, &self.path, *end_pos)?;
        if !new_positions.is_empty() {
            debug!(
                path = %self.path.display(),
                appended = new_positions.len(),
                "Indexed frames appended by another process"
            );
            self.positions.write().extend(new_positions);
            *end_pos = new_end;
        }
        Ok(())
    }
}

impl PartitionLog for SegmentLog {
    fn append(&mut self, message: &Message) -> Result<()> {
        let expected = self.positions.read().len() as u64;
        if message.offset != expected {
            return Err(Error::Other(format!(
                "segment {} expected offset {}, got {}",
                self.path.display(),
                expected,
                message.offset
            )));
        }

        let body = message.to_bytes()?;
        let len = body.len() as u32;
        self.writer.write_all(&len.to_le_bytes())?;
        self.writer.write_all(&body)?;
        if self.flush_each_append {
            self.writer.flush()?;
            self.writer.get_ref().sync_data()?;
        }

        let mut end_pos = self.end_pos.lock();
        self.positions.write().push(*end_pos);
        *end_pos += FRAME_HEADER as u64 + body.len() as u64;
        Ok(())
    }

    fn read(&self, start_offset: u64, max_messages: usize) -> Result<Vec<Message>> {
        if max_messages == 0 {
            return Ok(Vec::new());
        }
        if start_offset as usize >= self.positions.read().len() {
            self.rescan_tail()?;
        }

        let positions = self.positions.read();
        let start = start_offset as usize;
        if start >= positions.len() {
            return Ok(Vec::new());
        }

        let mut reader = self.reader.lock();
        reader.seek(SeekFrom::Start(positions[start]))?;

        let end = (start + max_messages).min(positions.len());
        let mut messages = Vec::with_capacity(end - start);
        for _ in start..end {
            let mut header = [0u8; FRAME_HEADER];
            reader.read_exact(&mut header)?;
            let len = u32::from_le_bytes(header) as usize;
            let mut body = vec![0u8; len];
            reader.read_exact(&mut body)?;
            messages.push(Message::from_bytes(&body)?);
        }

        Ok(messages)
    }

    fn next_offset(&self) -> u64 {
        self.positions.read().len() as u64
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_read_reopen() {
        let dir = tempfile::tempdir().unwrap();

        {
            let mut log = SegmentLog::open(dir.path(), "uploads.raw", 0, true).unwrap();
            for i in 0..3u64 {
                let mut msg = Message::with_key("s1", format!("payload-{}", i));
                msg.offset = i;
                log.append(&msg).unwrap();
            }
            let read = log.read(1, 10).unwrap();
            assert_eq!(read.len(), 2);
            assert_eq!(read[0].offset, 1);
        }

        // Re-open and verify recovery
        let mut log = SegmentLog::open(dir.path(), "uploads.raw", 0, true).unwrap();
        assert_eq!(log.next_offset(), 3);
        let read = log.read(0, 10).unwrap();
        assert_eq!(read.len(), 3);
        assert_eq!(read[2].value, b"payload-2".to_vec());

        // And that appends continue from the recovered offset
        let mut msg = Message::new("payload-3");
        msg.offset = 3;
        log.append(&msg).unwrap();
        assert_eq!(log.next_offset(), 4);
    }

    #[test]
    fn test_truncated_trailing_frame_is_dropped() {
        let dir = tempfile::tempdir().unwrap();

        {
            let mut log = SegmentLog::open(dir.path(), "t", 0, true).unwrap();
            let mut msg = Message::new("complete");
            msg.offset = 0;
            log.append(&msg).unwrap();
        }

        // Simulate a crash mid-write: a frame header with no body
        let path = dir.path().join("t").join("00000.log");
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&1234u32.to_le_bytes()).unwrap();
        drop(file);

        let log = SegmentLog::open(dir.path(), "t", 0, true).unwrap();
        assert_eq!(log.next_offset(), 1);
        assert_eq!(log.read(0, 10).unwrap().len(), 1);
    }

    #[test]
    fn test_reader_sees_writer_process_appends() {
        let dir = tempfile::tempdir().unwrap();

        // Reader opens first (empty log), as a consumer process would
        let reader_log = SegmentLog::open(dir.path(), "t", 0, true).unwrap();
        assert!(reader_log.read(0, 10).unwrap().is_empty());

        // A separate handle plays the producer process
        {
            let mut writer_log = SegmentLog::open(dir.path(), "t", 0, true).unwrap();
            for i in 0..2u64 {
                let mut msg = Message::new(format!("m{}", i));
                msg.offset = i;
                writer_log.append(&msg).unwrap();
            }
        }

        // The reader's next poll picks up the tail
        let read = reader_log.read(0, 10).unwrap();
        assert_eq!(read.len(), 2);
        assert_eq!(read[1].value, b"m1".to_vec());
    }

    #[test]
    fn test_offset_gap_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = SegmentLog::open(dir.path(), "t", 0, true).unwrap();
        let mut msg = Message::new("x");
        msg.offset = 5;
        assert!(log.append(&msg).is_err());
    }
}
