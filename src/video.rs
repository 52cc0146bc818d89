//! Video formats, clip geometry and plane storage.
//!
//! The filter does no frame I/O of its own; the host owns frames. These
//! types pin the contract between the host and the compiled routine:
//! sample layout, plane geometry, and the 32-byte row guarantees the
//! generated code relies on.
//!
//! Author: Moroya Sakamoto

use crate::error::Error;

/// Maximum number of input clips (one per letter `a`-`z`).
pub const MAX_INPUTS: usize = 26;

/// Minimum row alignment (bytes) the host guarantees for every plane.
/// Rows are also padded so they can be written in whole 8-lane blocks.
pub const ALIGNMENT: usize = 32;

/// Sample interpretation of a plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleType {
    /// Unsigned integer samples, 8-16 bits.
    Integer,
    /// IEEE 754 float samples, 32 bits. (16-bit float is rejected.)
    Float,
}

/// Color family of a clip. Only planar families are accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorFamily {
    /// Single-plane grayscale.
    Gray,
    /// Planar luma + two subsampled chroma planes.
    Yuv,
    /// Planar RGB.
    Rgb,
    /// Packed/interleaved legacy formats. Always rejected.
    Compat,
}

/// Sample format of a video clip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoFormat {
    /// Integer or float samples.
    pub sample_type: SampleType,
    /// Meaningful bits per sample (8-16 for integer, 32 for float).
    pub bits_per_sample: u32,
    /// Storage bytes per sample (1, 2 or 4).
    pub bytes_per_sample: usize,
    /// Color family.
    pub color_family: ColorFamily,
    /// log2 horizontal chroma subsampling.
    pub sub_sampling_w: u32,
    /// log2 vertical chroma subsampling.
    pub sub_sampling_h: u32,
    /// Number of planes (1 or 3).
    pub num_planes: usize,
}

impl VideoFormat {
    /// Planar format with the given family, sample type and bit depth.
    pub fn new(
        color_family: ColorFamily,
        sample_type: SampleType,
        bits_per_sample: u32,
        sub_sampling_w: u32,
        sub_sampling_h: u32,
    ) -> Self {
        let bytes_per_sample = if bits_per_sample <= 8 {
            1
        } else if bits_per_sample <= 16 {
            2
        } else {
            4
        };
        let num_planes = match color_family {
            ColorFamily::Gray => 1,
            _ => 3,
        };
        VideoFormat {
            sample_type,
            bits_per_sample,
            bytes_per_sample,
            color_family,
            sub_sampling_w,
            sub_sampling_h,
            num_planes,
        }
    }

    /// 8-bit grayscale.
    pub fn gray8() -> Self {
        Self::new(ColorFamily::Gray, SampleType::Integer, 8, 0, 0)
    }

    /// 16-bit grayscale.
    pub fn gray16() -> Self {
        Self::new(ColorFamily::Gray, SampleType::Integer, 16, 0, 0)
    }

    /// 32-bit float grayscale.
    pub fn grays() -> Self {
        Self::new(ColorFamily::Gray, SampleType::Float, 32, 0, 0)
    }

    /// 8-bit YUV 4:2:0.
    pub fn yuv420p8() -> Self {
        Self::new(ColorFamily::Yuv, SampleType::Integer, 8, 1, 1)
    }

    /// Checks the sample format against what the compiler supports.
    pub fn validate(&self) -> Result<(), Error> {
        if self.color_family == ColorFamily::Compat {
            return Err(Error::CompatFormat);
        }
        match self.sample_type {
            SampleType::Integer => {
                if self.bits_per_sample < 8 || self.bits_per_sample > 16 {
                    return Err(Error::UnsupportedSampleFormat);
                }
            }
            SampleType::Float => {
                if self.bits_per_sample == 16 {
                    return Err(Error::HalfFloatUnsupported);
                }
                if self.bits_per_sample != 32 {
                    return Err(Error::UnsupportedSampleFormat);
                }
            }
        }
        Ok(())
    }
}

/// Constant geometry of a clip: format plus frame dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoInfo {
    /// Sample format.
    pub format: VideoFormat,
    /// Frame width in pixels (plane 0).
    pub width: usize,
    /// Frame height in pixels (plane 0).
    pub height: usize,
}

impl VideoInfo {
    /// New clip info.
    pub fn new(format: VideoFormat, width: usize, height: usize) -> Self {
        VideoInfo {
            format,
            width,
            height,
        }
    }

    /// Dimensions of one plane, subsampling applied.
    pub fn plane_dimensions(&self, plane: usize) -> (usize, usize) {
        if plane == 0 {
            (self.width, self.height)
        } else {
            (
                self.width >> self.format.sub_sampling_w,
                self.height >> self.format.sub_sampling_h,
            )
        }
    }
}

/// Output sample override: keeps the input's color family and
/// subsampling, replaces sample type and bit depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatPreset {
    /// Target sample type.
    pub sample_type: SampleType,
    /// Target bit depth.
    pub bits_per_sample: u32,
    /// Plane count of the preset; must match the inputs.
    pub num_planes: usize,
}

impl FormatPreset {
    /// Single-plane preset.
    pub fn gray(sample_type: SampleType, bits_per_sample: u32) -> Self {
        FormatPreset {
            sample_type,
            bits_per_sample,
            num_planes: 1,
        }
    }

    /// Three-plane preset.
    pub fn planar3(sample_type: SampleType, bits_per_sample: u32) -> Self {
        FormatPreset {
            sample_type,
            bits_per_sample,
            num_planes: 3,
        }
    }
}

/// Validates an input clip set: count, constant geometry agreement and
/// per-clip sample formats.
pub fn validate_inputs(inputs: &[VideoInfo]) -> Result<(), Error> {
    if inputs.is_empty() {
        return Err(Error::NoInputs);
    }
    if inputs.len() > MAX_INPUTS {
        return Err(Error::TooManyInputs);
    }
    let first = &inputs[0];
    for vi in inputs {
        vi.format.validate()?;
        if vi.format.num_planes != first.format.num_planes
            || vi.format.sub_sampling_w != first.format.sub_sampling_w
            || vi.format.sub_sampling_h != first.format.sub_sampling_h
            || vi.width != first.width
            || vi.height != first.height
        {
            return Err(Error::InputMismatch);
        }
    }
    Ok(())
}

/// Applies a format preset to input 0's info, producing the output info.
pub fn apply_format_preset(base: &VideoInfo, preset: &FormatPreset) -> Result<VideoInfo, Error> {
    if base.format.color_family == ColorFamily::Compat {
        return Err(Error::CompatFormat);
    }
    if preset.num_planes != base.format.num_planes {
        return Err(Error::PlaneCountMismatch);
    }
    let mut out = *base;
    out.format = VideoFormat::new(
        base.format.color_family,
        preset.sample_type,
        preset.bits_per_sample,
        base.format.sub_sampling_w,
        base.format.sub_sampling_h,
    );
    Ok(out)
}

// ============================================================================
// Plane storage
// ============================================================================

/// One 2D sample array with host-guaranteed row alignment.
///
/// Rows start 32-byte aligned and are padded so the compiled routine can
/// always read and write whole 8-lane blocks; a 4x1 plane still owns a
/// 32-byte row. Samples are stored little-endian in their native width.
pub struct Plane {
    raw: Vec<u8>,
    off: usize,
    width: usize,
    height: usize,
    stride: usize,
    bytes_per_sample: usize,
}

impl Plane {
    /// Allocates a zeroed plane for `width` x `height` samples of
    /// `bytes_per_sample` bytes each.
    pub fn new(width: usize, height: usize, bytes_per_sample: usize) -> Self {
        let row = width.max(crate::jit::LANES) * bytes_per_sample;
        let stride = row.div_ceil(ALIGNMENT) * ALIGNMENT;
        let raw = vec![0u8; stride * height + ALIGNMENT];
        let off = raw.as_ptr().align_offset(ALIGNMENT);
        Plane {
            raw,
            off,
            width,
            height,
            stride,
            bytes_per_sample,
        }
    }

    /// Allocates the plane `plane` of a frame described by `info`.
    pub fn for_plane(info: &VideoInfo, plane: usize) -> Self {
        let (w, h) = info.plane_dimensions(plane);
        Self::new(w, h, info.format.bytes_per_sample)
    }

    /// Width in samples.
    pub fn width(&self) -> usize {
        self.width
    }

    /// Height in rows.
    pub fn height(&self) -> usize {
        self.height
    }

    /// Row stride in bytes.
    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Bytes per sample.
    pub fn bytes_per_sample(&self) -> usize {
        self.bytes_per_sample
    }

    /// The full padded buffer.
    pub fn data(&self) -> &[u8] {
        &self.raw[self.off..self.off + self.stride * self.height]
    }

    /// The full padded buffer, writable.
    pub fn data_mut(&mut self) -> &mut [u8] {
        let end = self.off + self.stride * self.height;
        &mut self.raw[self.off..end]
    }

    /// One row, padding included.
    pub fn row(&self, y: usize) -> &[u8] {
        &self.data()[y * self.stride..(y + 1) * self.stride]
    }

    /// One row, padding included, writable.
    pub fn row_mut(&mut self, y: usize) -> &mut [u8] {
        let stride = self.stride;
        &mut self.data_mut()[y * stride..(y + 1) * stride]
    }

    /// Reads sample (x, y) widened to u32.
    pub fn get_int(&self, x: usize, y: usize) -> u32 {
        let row = self.row(y);
        match self.bytes_per_sample {
            1 => row[x] as u32,
            2 => u16::from_le_bytes([row[x * 2], row[x * 2 + 1]]) as u32,
            _ => u32::from_le_bytes(row[x * 4..x * 4 + 4].try_into().unwrap()),
        }
    }

    /// Reads sample (x, y) as f32. Only valid on 4-byte planes.
    pub fn get_f32(&self, x: usize, y: usize) -> f32 {
        let row = self.row(y);
        f32::from_le_bytes(row[x * 4..x * 4 + 4].try_into().unwrap())
    }

    /// Writes integer sample (x, y) in the plane's native width.
    pub fn set_int(&mut self, x: usize, y: usize, v: u32) {
        let bps = self.bytes_per_sample;
        let row = self.row_mut(y);
        match bps {
            1 => row[x] = v as u8,
            2 => row[x * 2..x * 2 + 2].copy_from_slice(&(v as u16).to_le_bytes()),
            _ => row[x * 4..x * 4 + 4].copy_from_slice(&v.to_le_bytes()),
        }
    }

    /// Writes float sample (x, y). Only valid on 4-byte planes.
    pub fn set_f32(&mut self, x: usize, y: usize, v: f32) {
        let row = self.row_mut(y);
        row[x * 4..x * 4 + 4].copy_from_slice(&v.to_le_bytes());
    }

    /// Copies the visible samples of `src` into this plane row by row.
    pub fn copy_from(&mut self, src: &Plane) {
        let bytes = self.width * self.bytes_per_sample;
        for y in 0..self.height {
            let dst_row = y * self.stride;
            let data = src.row(y)[..bytes].to_vec();
            self.data_mut()[dst_row..dst_row + bytes].copy_from_slice(&data);
        }
    }
}
