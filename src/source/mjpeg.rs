//! Memory-mapped MJPEG file source
//!
//! The file is a plain concatenation of baseline or progressive JPEG pictures.
//! Frame boundaries are found by walking JPEG markers, so entropy-coded data
//! and embedded segments never produce false EOI hits.

use std::fs::File;
use std::ops::Range;

use bytes::Bytes;
use memmap2::Mmap;
use tracing::{debug, info, instrument};

use super::decoder::{decode_jpeg, probe_jpeg};
use super::frame::{Frame, FrameMetadata, PixelFormat, StreamInfo};
use super::{OpenOptions, VideoSource};
use crate::error::{Result, VReaderError};
use crate::utils::local_path;

const SOI: u8 = 0xD8;
const EOI: u8 = 0xD9;
const SOS: u8 = 0xDA;
const TEM: u8 = 0x01;

pub struct MjpegSource {
    map: Mmap,
    info: StreamInfo,
    /// Byte ranges of the frames found so far, in file order
    frames: Vec<Range<usize>>,
    /// First byte not yet scanned for frames
    scan_pos: usize,
    position: u64,
}

impl MjpegSource {
    #[instrument(skip(options), fields(analyze = options.analyze))]
    pub fn open(uri: &str, options: &OpenOptions) -> Result<Self> {
        let path = local_path(uri);
        let file = File::open(path).map_err(|e| VReaderError::open_failed(uri, e))?;
        // SAFETY: the mapping is read-only and lives as long as the source;
        // the file is not expected to be truncated while it is being read.
        let map = unsafe { Mmap::map(&file) }.map_err(|e| VReaderError::open_failed(uri, e))?;

        let mut source = Self {
            map,
            info: StreamInfo {
                width: 0,
                height: 0,
                format: PixelFormat::Rgb24,
                frame_rate: None,
                total_frames: None,
                live: false,
            },
            frames: Vec::new(),
            scan_pos: 0,
            position: 0,
        };

        let first = source
            .frame_range(0)?
            .ok_or_else(|| VReaderError::open_failed(uri, "no JPEG picture found"))?;
        let (width, height) = probe_jpeg(&source.map[first])?;
        source.info.width = width;
        source.info.height = height;

        if options.analyze {
            let total = source.index_all()?;
            source.info.total_frames = Some(total);
            info!(width, height, total, "MJPEG analysis complete");
        }
        Ok(source)
    }

    fn index_all(&mut self) -> Result<u64> {
        while self.scan_next()? {}
        Ok(self.frames.len() as u64)
    }

    fn frame_range(&mut self, index: u64) -> Result<Option<Range<usize>>> {
        while (self.frames.len() as u64) <= index {
            if !self.scan_next()? {
                return Ok(None);
            }
        }
        Ok(self.frames.get(index as usize).cloned())
    }

    /// Locate the next picture after `scan_pos`. Returns `false` at end of file.
    fn scan_next(&mut self) -> Result<bool> {
        let data: &[u8] = &self.map;
        let Some(start) = find_soi(data, self.scan_pos) else {
            self.scan_pos = data.len();
            return Ok(false);
        };
        let end = walk_markers(data, start)?;
        debug!(index = self.frames.len(), start, end, "Indexed JPEG picture");
        self.frames.push(start..end);
        self.scan_pos = end;
        Ok(true)
    }
}

fn find_soi(data: &[u8], from: usize) -> Option<usize> {
    data.get(from..)?
        .windows(2)
        .position(|w| w == [0xFF, SOI])
        .map(|offset| from + offset)
}

/// Walk the markers of the picture starting at `start` (an SOI) and return
/// the offset one past its EOI.
fn walk_markers(data: &[u8], start: usize) -> Result<usize> {
    let truncated = || VReaderError::Decode(format!("truncated JPEG picture at byte {start}"));
    let mut pos = start + 2;
    loop {
        // Skip fill bytes preceding a marker
        while data.get(pos) == Some(&0xFF) && data.get(pos + 1) == Some(&0xFF) {
            pos += 1;
        }
        if data.get(pos) != Some(&0xFF) {
            return Err(VReaderError::Decode(format!(
                "expected JPEG marker at byte {pos}"
            )));
        }
        let marker = *data.get(pos + 1).ok_or_else(truncated)?;
        match marker {
            EOI => return Ok(pos + 2),
            TEM | 0xD0..=0xD7 => pos += 2,
            _ => {
                let len_bytes = data.get(pos + 2..pos + 4).ok_or_else(truncated)?;
                let len = u16::from_be_bytes([len_bytes[0], len_bytes[1]]) as usize;
                pos += 2 + len;
                if marker == SOS {
                    pos = skip_entropy_data(data, pos).ok_or_else(truncated)?;
                }
            }
        }
    }
}

/// Advance over entropy-coded bytes to the next real marker.
fn skip_entropy_data(data: &[u8], mut pos: usize) -> Option<usize> {
    loop {
        if *data.get(pos)? != 0xFF {
            pos += 1;
            continue;
        }
        match *data.get(pos + 1)? {
            0x00 | 0xD0..=0xD7 => pos += 2,
            0xFF => pos += 1,
            _ => return Some(pos),
        }
    }
}

impl VideoSource for MjpegSource {
    fn info(&self) -> &StreamInfo {
        &self.info
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        let Some(range) = self.frame_range(self.position)? else {
            return Ok(None);
        };
        let image = decode_jpeg(&self.map[range])?;
        let frame = Frame::new(
            Bytes::from(image.pixels),
            FrameMetadata {
                index: self.position,
                width: image.width,
                height: image.height,
                stride: image.width * 3,
                format: PixelFormat::Rgb24,
                pts: None,
            },
        );
        self.position += 1;
        Ok(Some(frame))
    }

    fn seek(&mut self, index: u64) -> Result<()> {
        if self.frame_range(index)?.is_none() {
            return Err(VReaderError::OutOfRange {
                index,
                total: self.frames.len() as u64,
            });
        }
        self.position = index;
        Ok(())
    }

    fn probe_total(&mut self) -> Result<Option<u64>> {
        self.index_all().map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::decoder::tests::sample_jpeg;
    use std::io::Write;

    fn write_mjpeg(frames: u8) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for seed in 0..frames {
            file.write_all(&sample_jpeg(16, 8, seed * 20)).unwrap();
        }
        file.flush().unwrap();
        file
    }

    fn open(file: &tempfile::NamedTempFile, analyze: bool) -> MjpegSource {
        let options = OpenOptions {
            analyze,
            ..OpenOptions::default()
        };
        MjpegSource::open(file.path().to_str().unwrap(), &options).unwrap()
    }

    #[test]
    fn analysis_counts_pictures() {
        let file = write_mjpeg(5);
        let source = open(&file, true);
        assert_eq!(source.info().total_frames, Some(5));
        assert_eq!((source.info().width, source.info().height), (16, 8));
    }

    #[test]
    fn decodes_sequentially_until_eof() {
        let file = write_mjpeg(3);
        let mut source = open(&file, false);
        assert_eq!(source.info().total_frames, None);
        let mut count = 0;
        while let Some(frame) = source.next_frame().unwrap() {
            assert_eq!(frame.index(), count);
            assert_eq!(frame.meta.format, PixelFormat::Rgb24);
            assert_eq!(frame.data.len(), 16 * 8 * 3);
            count += 1;
        }
        assert_eq!(count, 3);
    }

    #[test]
    fn seek_matches_sequential_decode() {
        let file = write_mjpeg(4);
        let mut sequential = open(&file, true);
        let mut seeking = open(&file, true);
        for _ in 0..2 {
            sequential.next_frame().unwrap();
        }
        seeking.seek(2).unwrap();
        assert_eq!(
            sequential.next_frame().unwrap().unwrap().data,
            seeking.next_frame().unwrap().unwrap().data
        );
        assert!(matches!(
            seeking.seek(9),
            Err(VReaderError::OutOfRange { index: 9, total: 4 })
        ));
    }

    #[test]
    fn probe_total_after_skipped_analysis() {
        let file = write_mjpeg(6);
        let mut source = open(&file, false);
        assert_eq!(source.probe_total().unwrap(), Some(6));
    }

    #[test]
    fn stuffed_bytes_do_not_split_pictures() {
        // SOI, SOS with a 2-byte header, entropy data containing FF00 and a
        // restart marker, then EOI.
        let data = [
            0xFF, SOI, 0xFF, SOS, 0x00, 0x02, 0x12, 0xFF, 0x00, 0x34, 0xFF, 0xD3, 0x56, 0xFF,
            EOI, 0xAA,
        ];
        assert_eq!(walk_markers(&data, 0).unwrap(), 15);
    }

    #[test]
    fn truncated_picture_is_a_decode_error() {
        let data = [0xFF, SOI, 0xFF, SOS, 0x00, 0x02, 0x12, 0x34];
        assert!(matches!(walk_markers(&data, 0), Err(VReaderError::Decode(_))));
    }
}
