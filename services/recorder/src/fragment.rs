//! Time-bucketed fragment files with a JSON random-access sidecar.
//!
//! Packets land in `<storage>/<stream>/<folder>/<file>` where `folder` is
//! days since the epoch and `file` is the fragment's start in seconds
//! since midnight. Next to each binary file sits `<file>.json`, an array
//! of `{timestamp, offset, path}` objects, one per index point in write
//! order.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::debug;

use vigil_messaging::messages::MediaPacket;

use crate::nal;

pub const SECONDS_PER_DAY: i64 = 86_400;

/// Identifies one fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentKey {
    /// Days since the Unix epoch.
    pub folder: i64,
    /// Start of the fragment, seconds since midnight floored to the
    /// fragment length.
    pub file: i64,
}

/// Bucket a packet timestamp (epoch milliseconds) into its fragment key.
pub fn fragment_key(timestamp_ms: i64, fragment_length_secs: i64) -> FragmentKey {
    let seconds = timestamp_ms.div_euclid(1000);
    let since_midnight = seconds.rem_euclid(SECONDS_PER_DAY);
    FragmentKey {
        folder: seconds.div_euclid(SECONDS_PER_DAY),
        file: since_midnight - since_midnight % fragment_length_secs,
    }
}

/// An index point written to the currently open fragment, ready to be
/// published as an offset record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexPoint {
    pub key: FragmentKey,
    pub timestamp: i64,
    pub offset: i64,
}

/// One sidecar entry.
#[derive(Debug, Serialize)]
struct IndexEntry<'a> {
    timestamp: i64,
    offset: i64,
    path: &'a str,
}

/// Counters surfaced in the recorder's periodic stats log.
#[derive(Debug, Default, Clone, Copy)]
pub struct WriterStats {
    pub packets_written: u64,
    pub bytes_written: u64,
    pub index_points: u64,
    pub fragments_opened: u64,
}

struct OpenFragment {
    key: FragmentKey,
    /// `<folder>/<file>`, as recorded in sidecar entries.
    rel_path: String,
    media: File,
    index: File,
    /// Byte position the next payload will occupy in the media file.
    offset: i64,
    entries: u64,
}

/// Appends packets to time-bucketed binary files and maintains the `.json`
/// sidecar next to each one.
///
/// Files open in append mode so a writer restart continues an existing
/// fragment instead of truncating recorded media; the running offset picks
/// up from the existing file length. A restarted sidecar starts a fresh
/// JSON array after the previous one.
pub struct FragmentWriter {
    root: PathBuf,
    fragment_length_secs: i64,
    current: Option<OpenFragment>,
    stats: WriterStats,
}

impl FragmentWriter {
    pub fn new(storage_path: &Path, stream_uuid: &str, fragment_length_secs: i64) -> Self {
        Self {
            root: storage_path.join(stream_uuid),
            fragment_length_secs,
            current: None,
            stats: WriterStats::default(),
        }
    }

    pub fn stats(&self) -> WriterStats {
        self.stats
    }

    /// Append one packet, rotating fragments when its timestamp crosses a
    /// bucket boundary. Returns the index point to publish when the
    /// payload starts an IDR picture.
    pub fn write_packet(&mut self, packet: &MediaPacket) -> io::Result<Option<IndexPoint>> {
        let key = fragment_key(packet.timestamp, self.fragment_length_secs);

        let rotate = !matches!(&self.current, Some(fragment) if fragment.key == key);
        if rotate {
            self.close_current()?;
            self.current = Some(self.open_fragment(key)?);
        }
        let Some(fragment) = self.current.as_mut() else {
            return Err(io::Error::other("no open fragment after rotation"));
        };

        let index_point = if nal::is_index_point(&packet.payload) {
            if fragment.entries > 0 {
                fragment.index.write_all(b",\n")?;
            }
            let entry = IndexEntry {
                timestamp: packet.timestamp,
                offset: fragment.offset,
                path: &fragment.rel_path,
            };
            let line = serde_json::to_string(&entry).map_err(io::Error::other)?;
            fragment.index.write_all(b"\t")?;
            fragment.index.write_all(line.as_bytes())?;
            fragment.entries += 1;
            self.stats.index_points += 1;

            Some(IndexPoint {
                key,
                timestamp: packet.timestamp,
                offset: fragment.offset,
            })
        } else {
            None
        };

        fragment.media.write_all(&packet.payload)?;
        fragment.offset += packet.payload.len() as i64;
        self.stats.packets_written += 1;
        self.stats.bytes_written += packet.payload.len() as u64;

        Ok(index_point)
    }

    /// Flush and close the open fragment. Called on shutdown; rotation
    /// does the same internally.
    pub fn close(&mut self) -> io::Result<()> {
        self.close_current()
    }

    fn open_fragment(&mut self, key: FragmentKey) -> io::Result<OpenFragment> {
        let dir = self.root.join(key.folder.to_string());
        fs::create_dir_all(&dir)?;

        let media_path = dir.join(key.file.to_string());
        let media = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&media_path)?;
        let offset = media.metadata()?.len() as i64;

        let mut index = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(format!("{}.json", key.file)))?;
        index.write_all(b"[\n")?;

        self.stats.fragments_opened += 1;
        debug!(path = %media_path.display(), offset, "fragment opened");

        Ok(OpenFragment {
            key,
            rel_path: format!("{}/{}", key.folder, key.file),
            media,
            index,
            offset,
            entries: 0,
        })
    }

    fn close_current(&mut self) -> io::Result<()> {
        if let Some(mut fragment) = self.current.take() {
            fragment.index.write_all(b"\n]")?;
            fragment.index.flush()?;
            fragment.media.flush()?;
            debug!(path = %fragment.rel_path, entries = fragment.entries, "fragment closed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use tempfile::TempDir;

    const FRAGMENT_SECS: i64 = 300;

    /// A timestamp whose seconds-since-midnight equal `s`, on an arbitrary
    /// day (20000 days after the epoch).
    fn ts_at(s: i64) -> i64 {
        (20_000 * SECONDS_PER_DAY + s) * 1000
    }

    fn idr_packet(timestamp: i64, filler: &[u8]) -> MediaPacket {
        let mut payload = vec![0x00, 0x00, 0x00, 0x01, 0x65];
        payload.extend_from_slice(filler);
        MediaPacket { timestamp, payload }
    }

    fn slice_packet(timestamp: i64, filler: &[u8]) -> MediaPacket {
        let mut payload = vec![0x00, 0x00, 0x00, 0x01, 0x61];
        payload.extend_from_slice(filler);
        MediaPacket { timestamp, payload }
    }

    #[test]
    fn bucket_math_floors_to_the_fragment_length() {
        assert_eq!(fragment_key(ts_at(725), FRAGMENT_SECS).file, 600);
        assert_eq!(fragment_key(ts_at(899), FRAGMENT_SECS).file, 600);
        assert_eq!(fragment_key(ts_at(900), FRAGMENT_SECS).file, 900);
        assert_eq!(fragment_key(ts_at(0), FRAGMENT_SECS).file, 0);
        assert_eq!(fragment_key(ts_at(725), FRAGMENT_SECS).folder, 20_000);
    }

    #[test]
    fn rotates_when_the_bucket_changes() {
        let dir = TempDir::new().unwrap();
        let mut writer = FragmentWriter::new(dir.path(), "cam1_main", FRAGMENT_SECS);

        writer.write_packet(&idr_packet(ts_at(725), b"aa")).unwrap();
        writer.write_packet(&slice_packet(ts_at(899), b"bb")).unwrap();
        writer.write_packet(&idr_packet(ts_at(900), b"cc")).unwrap();
        writer.close().unwrap();

        let stream_dir = dir.path().join("cam1_main").join("20000");
        assert!(stream_dir.join("600").exists());
        assert!(stream_dir.join("600.json").exists());
        assert!(stream_dir.join("900").exists());
        assert!(stream_dir.join("900.json").exists());
        assert_eq!(writer.stats().fragments_opened, 2);

        // Both packets of the first bucket landed in one file.
        let media = fs::read(stream_dir.join("600")).unwrap();
        assert_eq!(media.len(), 14);
    }

    #[test]
    fn index_points_record_their_byte_offsets() {
        let dir = TempDir::new().unwrap();
        let mut writer = FragmentWriter::new(dir.path(), "cam1_main", FRAGMENT_SECS);

        // 7-byte IDR, 6-byte slice, then another IDR at offset 13.
        let first = writer.write_packet(&idr_packet(ts_at(700), b"aa")).unwrap();
        let none = writer.write_packet(&slice_packet(ts_at(701), b"b")).unwrap();
        let second = writer.write_packet(&idr_packet(ts_at(702), b"cc")).unwrap();
        writer.close().unwrap();

        let first = first.unwrap();
        assert_eq!(first.offset, 0);
        assert_eq!(first.key.file, 600);
        assert!(none.is_none());
        assert_eq!(second.unwrap().offset, 13);

        let sidecar =
            fs::read_to_string(dir.path().join("cam1_main/20000/600.json")).unwrap();
        let entries: Vec<Value> = serde_json::from_str(&sidecar).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0]["offset"], 0);
        assert_eq!(entries[0]["timestamp"], ts_at(700));
        assert_eq!(entries[0]["path"], "20000/600");
        assert_eq!(entries[1]["offset"], 13);
    }

    #[test]
    fn fragment_without_index_points_has_an_empty_sidecar_array() {
        let dir = TempDir::new().unwrap();
        let mut writer = FragmentWriter::new(dir.path(), "cam1_main", FRAGMENT_SECS);

        writer.write_packet(&slice_packet(ts_at(10), b"xx")).unwrap();
        writer.close().unwrap();

        let sidecar = fs::read_to_string(dir.path().join("cam1_main/20000/0.json")).unwrap();
        let entries: Vec<Value> = serde_json::from_str(&sidecar).unwrap();
        assert!(entries.is_empty());
    }

    #[test]
    fn day_rollover_changes_the_folder() {
        let dir = TempDir::new().unwrap();
        let mut writer = FragmentWriter::new(dir.path(), "cam1_main", FRAGMENT_SECS);

        writer
            .write_packet(&idr_packet(ts_at(SECONDS_PER_DAY - 1), b"aa"))
            .unwrap();
        writer
            .write_packet(&idr_packet(ts_at(SECONDS_PER_DAY), b"bb"))
            .unwrap();
        writer.close().unwrap();

        assert!(dir.path().join("cam1_main/20000/86100").exists());
        assert!(dir.path().join("cam1_main/20001/0").exists());
    }

    #[test]
    fn restart_appends_and_continues_the_offset() {
        let dir = TempDir::new().unwrap();

        let mut writer = FragmentWriter::new(dir.path(), "cam1_main", FRAGMENT_SECS);
        writer.write_packet(&idr_packet(ts_at(700), b"aa")).unwrap();
        writer.close().unwrap();

        // New writer, same fragment: media bytes append, offsets continue
        // past the existing file length.
        let mut writer = FragmentWriter::new(dir.path(), "cam1_main", FRAGMENT_SECS);
        let point = writer
            .write_packet(&idr_packet(ts_at(710), b"bb"))
            .unwrap()
            .unwrap();
        writer.close().unwrap();

        assert_eq!(point.offset, 7);
        let media = fs::read(dir.path().join("cam1_main/20000/600")).unwrap();
        assert_eq!(media.len(), 14);
    }
}
