//! Common `ViewpointSource` loader.
//!
//! Recorded feature streams (`.vpf`) are little-endian. The header holds magic bytes and the
//! equirectangular sensor size. Every frame then holds:
//!
//! 1. `u32` feature count;
//! 2. per feature, `f32` pixel coordinates followed by `u8` red, green and blue;
//! 3. `u32` number of match slots;
//! 4. per feature and slot, `i32` matched feature index, `-1` meaning no match.

use panorec::prelude::v1::*;
use std::fs::File;
use std::io::{BufReader, Read, Write};

use nalgebra as na;

/// Magic bytes at the start of a `.vpf` stream.
pub const MAGIC: [u8; 4] = *b"VPF1";

/// Create a viewpoint source depending on the input.
///
/// If the input ends with `.vpf`, it will be interpreted as a recorded feature stream.
pub fn create_source(input: &str) -> Result<Box<dyn ViewpointSource>> {
    if input.ends_with(".vpf") {
        let reader = File::open(input)?;
        let reader = BufReader::new(reader);

        return Ok(Box::new(FeatureStream::new(reader)?));
    }

    Err(anyhow!("Unsupported input: {}", input))
}

/// Feature in pixel space, as stored in the stream.
pub type PixelFeature = (na::Point2<f32>, RGBA);

/// Recorded feature stream.
///
/// One frame is always read ahead, so that the end of the stream is known in advance.
pub struct FeatureStream<T> {
    reader: T,
    camera: SphericalCamera,
    frames: usize,
    lookahead: Result<Option<Frame>>,
}

impl<T: Read> FeatureStream<T> {
    /// Open a stream, validating its header.
    pub fn new(mut reader: T) -> Result<Self> {
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;

        if magic != MAGIC {
            return Err(anyhow!("Invalid stream magic: {:?}", magic));
        }

        let width = read_u32(&mut reader)? as usize;
        let height = read_u32(&mut reader)? as usize;

        let mut ret = Self {
            reader,
            camera: SphericalCamera::new(width, height)?,
            frames: 0,
            lookahead: Ok(None),
        };

        ret.lookahead = ret.read_frame();

        Ok(ret)
    }

    pub fn camera(&self) -> &SphericalCamera {
        &self.camera
    }

    fn read_frame(&mut self) -> Result<Option<Frame>> {
        let cnt = match read_u32_or_eof(&mut self.reader)? {
            Some(cnt) => cnt as usize,
            None => return Ok(None),
        };

        let frame = self.frames;
        let truncated = |_| anyhow!("Frame {} is truncated", frame);

        let mut features = Vec::with_capacity(cnt.min(1 << 16));

        for _ in 0..cnt {
            let x = read_f32(&mut self.reader).map_err(truncated)?;
            let y = read_f32(&mut self.reader).map_err(truncated)?;

            let mut rgb = [0u8; 3];
            self.reader.read_exact(&mut rgb).map_err(|_| anyhow!("Frame {} is truncated", frame))?;

            let ray = self.camera.ray(na::Point2::new(x as f64, y as f64));
            features.push(Feature::new(ray, RGBA::from_rgb_slice(&rgb)));
        }

        let slots = read_u32(&mut self.reader).map_err(truncated)? as usize;

        let entries = cnt
            .checked_mul(slots)
            .ok_or_else(|| anyhow!("Match table of frame {} is too large", frame))?;

        // Grow with the data actually read, the declared size may be bogus.
        let mut raw = Vec::with_capacity(entries.min(1 << 16));

        for _ in 0..entries {
            let mut buf = [0u8; 4];
            self.reader.read_exact(&mut buf).map_err(|_| anyhow!("Frame {} is truncated", frame))?;

            raw.push(match i32::from_le_bytes(buf) {
                -1 => None,
                m if m >= 0 => Some(m as usize),
                m => return Err(anyhow!("Invalid match index {} in frame {}", m, frame)),
            });
        }

        let mut matches = MatchTable::new(cnt, slots);

        for (i, matched) in raw.into_iter().enumerate() {
            matches.set(i / slots, i % slots, matched)?;
        }

        self.frames += 1;

        Ok(Some(Frame { features, matches }))
    }
}

impl<T: Read> ViewpointSource for FeatureStream<T> {
    fn next(&mut self) -> Result<Option<Frame>> {
        match std::mem::replace(&mut self.lookahead, Ok(None)) {
            Ok(Some(frame)) => {
                self.lookahead = self.read_frame();
                Ok(Some(frame))
            }
            other => other,
        }
    }

    fn has_next(&self) -> bool {
        !matches!(self.lookahead, Ok(None))
    }
}

fn read_u32(reader: &mut impl Read) -> Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_f32(reader: &mut impl Read) -> Result<f32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(f32::from_le_bytes(buf))
}

/// Read a `u32`, or `None` if the stream ended cleanly before it.
fn read_u32_or_eof(reader: &mut impl Read) -> Result<Option<u32>> {
    let mut buf = [0u8; 4];
    let mut filled = 0;

    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }

    match filled {
        0 => Ok(None),
        4 => Ok(Some(u32::from_le_bytes(buf))),
        _ => Err(anyhow!("Frame header is truncated")),
    }
}

/// Write the stream header.
pub fn write_header(out: &mut impl Write, width: u32, height: u32) -> Result<()> {
    out.write_all(&MAGIC)?;
    out.write_all(&width.to_le_bytes())?;
    out.write_all(&height.to_le_bytes())?;
    Ok(())
}

/// Write a single frame.
///
/// # Arguments
///
/// * `out` - output stream.
/// * `features` - pixel positions and colours of the features.
/// * `matches` - match table of the features. Must cover exactly `features.len()` features.
pub fn write_frame(
    out: &mut impl Write,
    features: &[PixelFeature],
    matches: &MatchTable,
) -> Result<()> {
    if matches.features() != features.len() {
        return Err(anyhow!(
            "Match table covers {} features, got {}",
            matches.features(),
            features.len()
        ));
    }

    // First encode number of features in a 32-bit LE integer.
    out.write_all(&(features.len() as u32).to_le_bytes())?;

    // Then each feature as 2 f32 coordinates plus 3 colour bytes.
    for (p, c) in features {
        out.write_all(&p.x.to_le_bytes())?;
        out.write_all(&p.y.to_le_bytes())?;
        out.write_all(&[c.r, c.g, c.b])?;
    }

    out.write_all(&(matches.slots() as u32).to_le_bytes())?;

    for q in 0..features.len() {
        for slot in 0..matches.slots() {
            let m = match matches.get(q, slot) {
                Some(m) => i32::try_from(m)?,
                None => -1,
            };
            out.write_all(&m.to_le_bytes())?;
        }
    }

    Ok(())
}
