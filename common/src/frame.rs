use chrono::Utc;
use image::imageops::FilterType;
use image::RgbImage;
use std::io::{self, Read, Write};
use std::sync::Arc;

/// Bytes per pixel. Frames are always 8-bit, 3-channel.
pub const CHANNELS: usize = 3;

const SEQ_HEADER_SIZE: usize = 8; // u64 big-endian sequence number

/// Fixed frame dimensions agreed out-of-band by both peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameGeometry {
    pub width: u32,
    pub height: u32,
}

impl FrameGeometry {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Size of the raw pixel buffer: `width * height * channels`.
    pub fn pixel_bytes(&self) -> usize {
        self.width as usize * self.height as usize * CHANNELS
    }
}

/// How frames and results are framed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireMode {
    /// Frames carry a sequence number header, results echo it as `"seq"`.
    Sequenced,
    /// Headerless frames; results are paired by arrival order only.
    Legacy,
}

impl WireMode {
    pub fn from_sequenced(sequenced: bool) -> Self {
        if sequenced {
            WireMode::Sequenced
        } else {
            WireMode::Legacy
        }
    }
}

/// A captured image plus the metadata that travels with it through the pipeline.
///
/// Pixels are shared behind an `Arc`, so cloning a frame to feed two queues does
/// not copy the buffer. Nothing mutates shared pixels: a consumer that needs to
/// draw takes a private copy with [`Frame::into_image`].
#[derive(Debug, Clone)]
pub struct Frame {
    pub seq: u64,
    pub captured_at_ms: i64,
    pixels: Arc<RgbImage>,
}

impl Frame {
    pub fn new(image: RgbImage, seq: u64, captured_at_ms: i64) -> Self {
        Self {
            seq,
            captured_at_ms,
            pixels: Arc::new(image),
        }
    }

    /// Wrap an image captured just now.
    pub fn captured_now(image: RgbImage, seq: u64) -> Self {
        Self::new(image, seq, Utc::now().timestamp_millis())
    }

    pub fn image(&self) -> &RgbImage {
        &self.pixels
    }

    pub fn geometry(&self) -> FrameGeometry {
        FrameGeometry::new(self.pixels.width(), self.pixels.height())
    }

    /// Take the pixels out, copying only if another holder still shares them.
    pub fn into_image(self) -> RgbImage {
        Arc::try_unwrap(self.pixels).unwrap_or_else(|shared| (*shared).clone())
    }

    /// Return a frame at `geometry`, resizing if the dimensions differ.
    pub fn fit_to(self, geometry: FrameGeometry) -> Self {
        if self.geometry() == geometry {
            return self;
        }
        let resized = resize_image(&self.pixels, geometry);
        Self::new(resized, self.seq, self.captured_at_ms)
    }

    pub fn age_ms(&self) -> i64 {
        Utc::now().timestamp_millis() - self.captured_at_ms
    }
}

pub fn resize_image(image: &RgbImage, geometry: FrameGeometry) -> RgbImage {
    image::imageops::resize(image, geometry.width, geometry.height, FilterType::Triangle)
}

/// Binary frame codec.
///
/// Wire formats:
///
/// legacy:
///   [0..N]   pixels   (row-major, `width * height * 3` bytes, no header)
///
/// sequenced:
///   [0..8]   seq      (u64 big-endian)
///   [8..8+N] pixels
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    geometry: FrameGeometry,
    mode: WireMode,
}

impl FrameCodec {
    pub fn new(geometry: FrameGeometry, mode: WireMode) -> Self {
        Self { geometry, mode }
    }

    pub fn mode(&self) -> WireMode {
        self.mode
    }

    /// Total bytes of one frame message on the wire.
    pub fn message_size(&self) -> usize {
        self.header_size() + self.geometry.pixel_bytes()
    }

    fn header_size(&self) -> usize {
        match self.mode {
            WireMode::Sequenced => SEQ_HEADER_SIZE,
            WireMode::Legacy => 0,
        }
    }

    /// Serialize a frame into one wire message. The frame must already be at
    /// the agreed dimensions.
    pub fn serialize(&self, frame: &Frame) -> Result<Vec<u8>, FrameError> {
        if frame.geometry() != self.geometry {
            return Err(FrameError::SizeMismatch {
                expected: self.geometry,
                got: frame.geometry(),
            });
        }
        let pixels = frame.image().as_raw();
        let mut buf = Vec::with_capacity(self.message_size());
        if self.mode == WireMode::Sequenced {
            buf.extend_from_slice(&frame.seq.to_be_bytes());
        }
        buf.extend_from_slice(pixels);
        Ok(buf)
    }

    /// Deserialize one complete wire message. `local_seq` is used as the
    /// sequence number when the mode carries none.
    pub fn deserialize(&self, data: &[u8], local_seq: u64) -> Result<Frame, FrameError> {
        if data.len() != self.message_size() {
            return Err(FrameError::TooShort {
                got: data.len(),
                expected: self.message_size(),
            });
        }
        let (seq, pixels) = match self.mode {
            WireMode::Sequenced => {
                let mut header = [0u8; SEQ_HEADER_SIZE];
                header.copy_from_slice(&data[..SEQ_HEADER_SIZE]);
                (u64::from_be_bytes(header), &data[SEQ_HEADER_SIZE..])
            }
            WireMode::Legacy => (local_seq, data),
        };
        let image = RgbImage::from_raw(self.geometry.width, self.geometry.height, pixels.to_vec())
            .ok_or(FrameError::TooShort {
                got: pixels.len(),
                expected: self.geometry.pixel_bytes(),
            })?;
        Ok(Frame::captured_now(image, seq))
    }

    /// Write one frame message and flush.
    pub fn write_frame<W: Write>(&self, writer: &mut W, frame: &Frame) -> Result<(), FrameError> {
        let payload = self.serialize(frame)?;
        writer.write_all(&payload)?;
        writer.flush()?;
        Ok(())
    }
}

/// Reads consecutive frame messages from a byte stream.
pub struct FrameReader<R> {
    inner: R,
    codec: FrameCodec,
    buf: Vec<u8>,
    local_seq: u64,
}

impl<R: Read> FrameReader<R> {
    pub fn new(inner: R, codec: FrameCodec) -> Self {
        Self {
            inner,
            codec,
            buf: vec![0u8; codec.message_size()],
            local_seq: 0,
        }
    }

    /// Read exactly one frame.
    ///
    /// Returns `Ok(None)` when the stream ends cleanly on a frame boundary and
    /// [`FrameError::ConnectionClosed`] when it ends part-way through a frame.
    /// A partial frame is never decoded.
    pub fn read_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        let got = read_full(&mut self.inner, &mut self.buf)?;
        if got == 0 {
            return Ok(None);
        }
        if got < self.buf.len() {
            return Err(FrameError::ConnectionClosed {
                got,
                expected: self.buf.len(),
            });
        }
        let frame = self.codec.deserialize(&self.buf, self.local_seq)?;
        self.local_seq += 1;
        Ok(Some(frame))
    }
}

/// Fill `buf` from `reader`, stopping early only at end of stream.
/// Returns the number of bytes read.
pub fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("connection closed mid-frame: got {got} of {expected} bytes")]
    ConnectionClosed { got: usize, expected: usize },
    #[error("frame payload too short: got {got} bytes, expected {expected}")]
    TooShort { got: usize, expected: usize },
    #[error("frame is {got:?}, agreed geometry is {expected:?}")]
    SizeMismatch {
        expected: FrameGeometry,
        got: FrameGeometry,
    },
    #[error("frame i/o: {0}")]
    Io(#[from] io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn patterned(geometry: FrameGeometry, seed: u8) -> RgbImage {
        RgbImage::from_fn(geometry.width, geometry.height, |x, y| {
            image::Rgb([seed, x as u8, y as u8])
        })
    }

    #[test]
    fn roundtrip_sequenced() {
        let geometry = FrameGeometry::new(8, 4);
        let codec = FrameCodec::new(geometry, WireMode::Sequenced);
        let frame = Frame::new(patterned(geometry, 7), 42, 1708300000000);
        let bytes = codec.serialize(&frame).unwrap();
        assert_eq!(bytes.len(), 8 + 8 * 4 * 3);
        assert_eq!(&bytes[..8], &42u64.to_be_bytes());

        let decoded = codec.deserialize(&bytes, 0).unwrap();
        assert_eq!(decoded.seq, 42);
        assert_eq!(decoded.image().as_raw(), frame.image().as_raw());
    }

    #[test]
    fn legacy_has_no_header() {
        let geometry = FrameGeometry::new(4, 2);
        let codec = FrameCodec::new(geometry, WireMode::Legacy);
        let frame = Frame::new(patterned(geometry, 1), 9, 0);
        let bytes = codec.serialize(&frame).unwrap();
        assert_eq!(bytes.len(), geometry.pixel_bytes());
        assert_eq!(bytes.as_slice(), frame.image().as_raw().as_slice());

        let decoded = codec.deserialize(&bytes, 3).unwrap();
        assert_eq!(decoded.seq, 3, "legacy frames take the local sequence");
    }

    #[test]
    fn serialize_rejects_wrong_geometry() {
        let codec = FrameCodec::new(FrameGeometry::new(4, 4), WireMode::Legacy);
        let frame = Frame::new(RgbImage::new(2, 2), 0, 0);
        assert!(matches!(
            codec.serialize(&frame),
            Err(FrameError::SizeMismatch { .. })
        ));
    }

    #[test]
    fn reader_yields_frames_then_clean_end() {
        let geometry = FrameGeometry::new(3, 3);
        let codec = FrameCodec::new(geometry, WireMode::Sequenced);
        let mut wire = Vec::new();
        for seq in 0..3 {
            let frame = Frame::new(patterned(geometry, seq as u8), seq, 0);
            codec.write_frame(&mut wire, &frame).unwrap();
        }

        let mut reader = FrameReader::new(Cursor::new(wire), codec);
        for seq in 0..3 {
            let frame = reader.read_frame().unwrap().expect("frame");
            assert_eq!(frame.seq, seq);
            assert_eq!(frame.image().get_pixel(0, 0).0[0], seq as u8);
        }
        assert!(reader.read_frame().unwrap().is_none());
    }

    #[test]
    fn short_read_is_connection_closed() {
        let geometry = FrameGeometry::new(640, 360);
        let codec = FrameCodec::new(geometry, WireMode::Legacy);
        let mut reader = FrameReader::new(Cursor::new(vec![0u8; 100]), codec);
        match reader.read_frame() {
            Err(FrameError::ConnectionClosed { got, expected }) => {
                assert_eq!(got, 100);
                assert_eq!(expected, 640 * 360 * 3);
            }
            other => panic!("expected ConnectionClosed, got {other:?}"),
        }
    }

    #[test]
    fn into_image_copies_only_when_shared() {
        let frame = Frame::new(RgbImage::new(2, 2), 0, 0);
        let retained = frame.clone();
        let mut owned = frame.into_image();
        owned.put_pixel(0, 0, image::Rgb([255, 0, 0]));
        assert_eq!(retained.image().get_pixel(0, 0).0, [0, 0, 0]);
    }

    #[test]
    fn fit_to_resizes_and_keeps_metadata() {
        let frame = Frame::new(RgbImage::new(10, 10), 5, 77);
        let fitted = frame.fit_to(FrameGeometry::new(4, 6));
        assert_eq!(fitted.geometry(), FrameGeometry::new(4, 6));
        assert_eq!(fitted.seq, 5);
        assert_eq!(fitted.captured_at_ms, 77);
    }
}
