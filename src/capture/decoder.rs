use super::frame::PixelFormat;
use crate::{Error, Result};

/// Decode a raw driver buffer into packed RGB24.
pub fn decode_frame(data: &[u8], format: PixelFormat, width: u32, height: u32) -> Result<Vec<u8>> {
    let pixels = width as usize * height as usize;
    match format {
        PixelFormat::Mjpeg => decode_mjpeg(data),
        PixelFormat::Rgb24 => {
            expect_len(data, pixels * 3, format)?;
            Ok(data[..pixels * 3].to_vec())
        }
        PixelFormat::Bgr24 => {
            expect_len(data, pixels * 3, format)?;
            let mut rgb = data[..pixels * 3].to_vec();
            for px in rgb.chunks_exact_mut(3) {
                px.swap(0, 2);
            }
            Ok(rgb)
        }
        PixelFormat::Yuyv4 => {
            expect_len(data, pixels * 2, format)?;
            Ok(yuyv_to_rgb(&data[..pixels * 2]))
        }
        PixelFormat::Nv12 => {
            expect_len(data, pixels * 3 / 2, format)?;
            Ok(nv12_to_rgb(data, width as usize, height as usize))
        }
        PixelFormat::Z16 => Err(Error::Decode("Z16 is a depth format, not color".into())),
    }
}

fn expect_len(data: &[u8], needed: usize, format: PixelFormat) -> Result<()> {
    if data.len() < needed {
        return Err(Error::Decode(format!(
            "{format:?} buffer too short: {} < {needed} bytes",
            data.len()
        )));
    }
    Ok(())
}

#[cfg(feature = "fast-jpeg")]
fn decode_mjpeg(data: &[u8]) -> Result<Vec<u8>> {
    // zune-jpeg outputs RGB by default
    let mut decoder = zune_jpeg::JpegDecoder::new(data);
    decoder
        .decode()
        .map_err(|e| Error::Decode(format!("MJPEG: {e:?}")))
}

#[cfg(not(feature = "fast-jpeg"))]
fn decode_mjpeg(data: &[u8]) -> Result<Vec<u8>> {
    use jpeg_decoder::{Decoder, PixelFormat as JpegFormat};

    let mut decoder = Decoder::new(data);
    let pixels = decoder
        .decode()
        .map_err(|e| Error::Decode(format!("MJPEG: {e}")))?;
    match decoder.info().map(|info| info.pixel_format) {
        Some(JpegFormat::RGB24) => Ok(pixels),
        Some(JpegFormat::L8) => Ok(pixels.iter().flat_map(|&l| [l, l, l]).collect()),
        other => Err(Error::Decode(format!("unsupported JPEG pixel format {other:?}"))),
    }
}

/// BT.601 limited-range YCbCr to RGB, integer arithmetic.
#[inline]
fn ycbcr_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = i32::from(y) - 16;
    let d = i32::from(u) - 128;
    let e = i32::from(v) - 128;
    let clamp = |x: i32| (x >> 8).clamp(0, 255) as u8;
    [
        clamp(298 * c + 409 * e + 128),
        clamp(298 * c - 100 * d - 208 * e + 128),
        clamp(298 * c + 516 * d + 128),
    ]
}

fn yuyv_to_rgb(data: &[u8]) -> Vec<u8> {
    let mut rgb = Vec::with_capacity(data.len() / 2 * 3);
    for quad in data.chunks_exact(4) {
        let (y0, u, y1, v) = (quad[0], quad[1], quad[2], quad[3]);
        rgb.extend_from_slice(&ycbcr_to_rgb(y0, u, v));
        rgb.extend_from_slice(&ycbcr_to_rgb(y1, u, v));
    }
    rgb
}

fn nv12_to_rgb(data: &[u8], width: usize, height: usize) -> Vec<u8> {
    let (luma, chroma) = data.split_at(width * height);
    let mut rgb = Vec::with_capacity(width * height * 3);
    for row in 0..height {
        for col in 0..width {
            let y = luma[row * width + col];
            let uv = (row / 2) * width + (col & !1);
            rgb.extend_from_slice(&ycbcr_to_rgb(y, chroma[uv], chroma[uv + 1]));
        }
    }
    rgb
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yuyv_black_and_white() {
        let data = [16u8, 128, 235, 128];
        let rgb = decode_frame(&data, PixelFormat::Yuyv4, 2, 1).unwrap();
        assert_eq!(rgb, vec![0, 0, 0, 255, 255, 255]);
    }

    #[test]
    fn bgr_is_swapped() {
        let rgb = decode_frame(&[1, 2, 3], PixelFormat::Bgr24, 1, 1).unwrap();
        assert_eq!(rgb, vec![3, 2, 1]);
    }

    #[test]
    fn nv12_gray_plane() {
        // 2x2 luma, one interleaved chroma pair
        let data = [235u8, 235, 16, 16, 128, 128];
        let rgb = decode_frame(&data, PixelFormat::Nv12, 2, 2).unwrap();
        assert_eq!(&rgb[..3], &[255, 255, 255]);
        assert_eq!(&rgb[9..], &[0, 0, 0]);
    }

    #[test]
    fn short_buffers_are_rejected() {
        assert!(decode_frame(&[0u8; 5], PixelFormat::Rgb24, 2, 1).is_err());
        assert!(decode_frame(&[0u8; 4], PixelFormat::Z16, 2, 1).is_err());
    }
}
