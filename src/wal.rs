use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::limits::MAX_WAL_ENTRY_LEN;
use crate::model::Event;

/// Encode a single event to [len][bincode][crc32] format.
fn encode_event(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = payload.len() as u32;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(())
}

/// Append-only Write-Ahead Log.
///
/// Format per entry: `[u32: len][bincode: Event][u32: crc32]`
/// - `len` is the byte length of the bincode payload (not including the CRC).
/// - A torn or corrupt tail (crash mid-write) ends replay; `recover` cuts it
///   off so new entries are not appended behind unreadable bytes.
/// - A batch that fails to flush is cut off again with `rewind`. If that fails
///   too the log refuses every later write.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
    poisoned: bool,
}

/// End of the durable log at some point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalMark {
    len: u64,
    appends: u64,
}

struct Scan {
    events: Vec<Event>,
    /// Byte offset just past the last intact entry.
    valid_len: u64,
}

impl Wal {
    /// Open (or create) the WAL file at `path`.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
            poisoned: false,
        })
    }

    /// Replay the log, truncate any torn tail, and open it for appending.
    pub fn recover(path: &Path) -> io::Result<(Self, Vec<Event>)> {
        let scan = scan(path)?;
        if let Ok(meta) = fs::metadata(path)
            && meta.len() > scan.valid_len
        {
            warn!(
                "discarding {} trailing bytes of {}",
                meta.len() - scan.valid_len,
                path.display()
            );
            OpenOptions::new()
                .write(true)
                .open(path)?
                .set_len(scan.valid_len)?;
        }
        let mut wal = Self::open(path)?;
        wal.appends_since_compact = scan.events.len() as u64;
        Ok((wal, scan.events))
    }

    /// Append a single event and fsync. The writer task batches with
    /// `append_buffered` + `flush_sync` instead.
    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Append a single event to the BufWriter without flushing or syncing.
    /// Call `flush_sync()` after the batch to durably commit all buffered events.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        self.ensure_usable()?;
        encode_event(&mut self.writer, event)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    /// Flush the BufWriter and fsync the underlying file.
    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    /// Current end of the log. Only meaningful between batches, when nothing
    /// is left in the write buffer.
    pub fn mark(&self) -> io::Result<WalMark> {
        self.ensure_usable()?;
        Ok(WalMark {
            len: self.writer.get_ref().metadata()?.len(),
            appends: self.appends_since_compact,
        })
    }

    /// Drop everything written or buffered after `mark`.
    pub fn rewind(&mut self, mark: WalMark) -> io::Result<()> {
        let result = self.truncate_to(mark);
        if result.is_err() {
            self.poisoned = true;
        }
        result
    }

    fn truncate_to(&mut self, mark: WalMark) -> io::Result<()> {
        let file = OpenOptions::new().append(true).open(&self.path)?;
        let stale = std::mem::replace(&mut self.writer, BufWriter::new(file));
        // Unflushed bytes belong to the failed batch; never write them out.
        let _ = stale.into_parts();
        let file = self.writer.get_ref();
        file.set_len(mark.len)?;
        file.sync_all()?;
        self.appends_since_compact = mark.appends;
        Ok(())
    }

    fn ensure_usable(&self) -> io::Result<()> {
        if self.poisoned {
            return Err(io::Error::other(format!(
                "{} is unusable after a failed rewind",
                self.path.display()
            )));
        }
        Ok(())
    }

    /// Write compacted events to a temp file next to the log and fsync.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let tmp_path = path.with_extension("wal.tmp");
        let file = File::create(&tmp_path)?;
        let mut writer = BufWriter::new(file);
        for event in events {
            encode_event(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Atomic swap: copy the entries appended since `since` onto the temp
    /// file, rename it over the WAL and reopen.
    pub fn swap_compact_file(&mut self, since: WalMark) -> io::Result<()> {
        self.ensure_usable()?;
        self.writer.flush()?;
        let tmp_path = self.path.with_extension("wal.tmp");

        let mut tail = File::open(&self.path)?;
        tail.seek(SeekFrom::Start(since.len))?;
        let mut tmp = OpenOptions::new().append(true).open(&tmp_path)?;
        io::copy(&mut tail, &mut tmp)?;
        tmp.sync_all()?;

        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.appends_since_compact = self.appends_since_compact.saturating_sub(since.appends);
        Ok(())
    }

    /// Replace the WAL with a minimal set of events that recreates the current state.
    #[cfg(test)]
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        let mark = self.mark()?;
        Self::write_compact_file(&self.path, events)?;
        self.swap_compact_file(mark)
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Replay the WAL from disk, returning all valid events.
    /// Truncated/corrupt trailing entries are silently discarded.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        scan(path).map(|s| s.events)
    }
}

fn scan(path: &Path) -> io::Result<Scan> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Ok(Scan {
                events: Vec::new(),
                valid_len: 0,
            });
        }
        Err(e) => return Err(e),
    };
    let mut reader = BufReader::new(file);
    let mut events = Vec::new();
    let mut valid_len = 0u64;

    loop {
        let mut len_buf = [0u8; 4];
        match reader.read_exact(&mut len_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e),
        }
        let len = u32::from_le_bytes(len_buf) as usize;
        if len > MAX_WAL_ENTRY_LEN {
            break; // garbage length
        }

        let mut payload = vec![0u8; len];
        match reader.read_exact(&mut payload) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break, // truncated
            Err(e) => return Err(e),
        }

        let mut crc_buf = [0u8; 4];
        match reader.read_exact(&mut crc_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break, // truncated
            Err(e) => return Err(e),
        }
        if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
            break;
        }

        match bincode::deserialize::<Event>(&payload) {
            Ok(event) => events.push(event),
            Err(_) => break,
        }
        valid_len += 8 + len as u64;
    }

    Ok(Scan { events, valid_len })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, NaiveTime, TimeZone, Utc};
    use rust_decimal_macros::dec;

    use crate::model::*;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("courtbook_test_wal");
        fs::create_dir_all(&dir).unwrap();
        dir.join(name)
    }

    fn court_added(id: CourtId) -> Event {
        Event::CourtAdded {
            court: Court {
                id,
                name: format!("Court {id}"),
                hourly_rate: dec!(25.00),
            },
        }
    }

    fn committed(id: BookingId) -> Event {
        let date = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
        Event::BookingCommitted {
            booking: Booking {
                id,
                user_id: 1,
                court_id: 1,
                slot: Slot::new(
                    date,
                    NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
                    NaiveTime::from_hms_opt(10, 0, 0).unwrap(),
                ),
                state: BookingState::Confirmed,
            },
            payment: Payment {
                id,
                booking_id: id,
                amount: dec!(25.00),
                created_at: Utc.with_ymd_and_hms(2024, 5, 31, 12, 0, 0).unwrap(),
                transaction_ref: format!("REF{id:07}"),
                state: PaymentState::Completed,
            },
        }
    }

    fn cancelled(id: BookingId) -> Event {
        Event::BookingCancelled {
            booking_id: id,
            court_id: 1,
            date: NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(),
        }
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let _ = fs::remove_file(&path);

        let events = vec![court_added(1), committed(1), cancelled(1)];
        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append(e).unwrap();
            }
        }

        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed, events);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_handles_truncation() {
        let path = tmp_path("truncation.wal");
        let _ = fs::remove_file(&path);

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&court_added(1)).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[0u8; 6]).unwrap(); // partial length + some bytes
        }

        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed, vec![court_added(1)]);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn recover_cuts_torn_tail_before_appending() {
        let path = tmp_path("recover_torn.wal");
        let _ = fs::remove_file(&path);

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&court_added(1)).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[9u8, 0, 0, 0, 1, 2]).unwrap();
        }

        {
            let (mut wal, events) = Wal::recover(&path).unwrap();
            assert_eq!(events, vec![court_added(1)]);
            wal.append(&committed(1)).unwrap();
        }

        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed, vec![court_added(1), committed(1)]);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_nonexistent_file() {
        let path = tmp_path("nonexistent.wal");
        let _ = fs::remove_file(&path);
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn replay_corrupt_crc() {
        let path = tmp_path("corrupt_crc.wal");
        let _ = fs::remove_file(&path);

        {
            let payload = bincode::serialize(&cancelled(4)).unwrap();
            let len = payload.len() as u32;
            let bad_crc: u32 = 0xDEADBEEF;

            let mut f = File::create(&path).unwrap();
            f.write_all(&len.to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&bad_crc.to_le_bytes()).unwrap();
        }

        assert!(Wal::replay(&path).unwrap().is_empty());

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_rejects_oversized_length() {
        let path = tmp_path("oversized.wal");
        let _ = fs::remove_file(&path);

        {
            let mut f = File::create(&path).unwrap();
            f.write_all(&u32::MAX.to_le_bytes()).unwrap();
            f.write_all(&[0u8; 16]).unwrap();
        }

        assert!(Wal::replay(&path).unwrap().is_empty());

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn compact_reduces_wal() {
        let path = tmp_path("compact_reduce.wal");
        let _ = fs::remove_file(&path);

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&court_added(1)).unwrap();
            for id in 1..=10 {
                wal.append(&committed(id)).unwrap();
                wal.append(&cancelled(id)).unwrap();
            }
        }
        let before = fs::metadata(&path).unwrap().len();

        let compacted = vec![court_added(1), committed(10)];
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.compact(&compacted).unwrap();
            assert_eq!(wal.appends_since_compact(), 0);
        }

        let after = fs::metadata(&path).unwrap().len();
        assert!(after < before, "compacted WAL should be smaller: {after} < {before}");
        assert_eq!(Wal::replay(&path).unwrap(), compacted);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn compact_then_append() {
        let path = tmp_path("compact_append.wal");
        let _ = fs::remove_file(&path);

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&court_added(1)).unwrap();
            wal.compact(&[court_added(1)]).unwrap();
            wal.append(&committed(2)).unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), vec![court_added(1), committed(2)]);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn swap_keeps_entries_appended_after_snapshot() {
        let path = tmp_path("swap_tail.wal");
        let _ = fs::remove_file(&path);

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&court_added(1)).unwrap();
            wal.append(&committed(1)).unwrap();
            wal.append(&cancelled(1)).unwrap();

            let mark = wal.mark().unwrap();
            Wal::write_compact_file(&path, &[court_added(1)]).unwrap();
            wal.append(&committed(2)).unwrap();
            wal.append(&cancelled(2)).unwrap();

            wal.swap_compact_file(mark).unwrap();
            assert_eq!(wal.appends_since_compact(), 2);
            wal.append(&committed(3)).unwrap();
        }

        assert_eq!(
            Wal::replay(&path).unwrap(),
            vec![court_added(1), committed(2), cancelled(2), committed(3)]
        );

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn rewind_drops_failed_batch() {
        let path = tmp_path("rewind_batch.wal");
        let _ = fs::remove_file(&path);

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&court_added(1)).unwrap();
            let mark = wal.mark().unwrap();

            // One entry reaches the file, one is still buffered.
            wal.append_buffered(&committed(1)).unwrap();
            wal.writer.flush().unwrap();
            wal.append_buffered(&committed(2)).unwrap();
            assert_eq!(wal.appends_since_compact(), 3);

            wal.rewind(mark).unwrap();
            assert_eq!(wal.appends_since_compact(), 1);
            assert_eq!(fs::metadata(&path).unwrap().len(), mark.len);

            wal.append(&committed(3)).unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), vec![court_added(1), committed(3)]);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn failed_rewind_refuses_later_writes() {
        let path = tmp_path("rewind_poisoned.wal");
        let _ = fs::remove_file(&path);

        let mut wal = Wal::open(&path).unwrap();
        wal.append(&court_added(1)).unwrap();
        let mark = wal.mark().unwrap();
        wal.append(&committed(1)).unwrap();

        fs::remove_file(&path).unwrap();
        assert!(wal.rewind(mark).is_err());
        assert!(wal.append_buffered(&committed(2)).is_err());
        assert!(wal.mark().is_err());
    }

    #[test]
    fn append_buffered_then_flush_sync() {
        let path = tmp_path("buffered_flush.wal");
        let _ = fs::remove_file(&path);

        let events: Vec<Event> = (1..=5).map(committed).collect();
        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append_buffered(e).unwrap();
            }
            assert_eq!(wal.appends_since_compact(), 5);
            wal.flush_sync().unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), events);

        let _ = fs::remove_file(&path);
    }
}
