//! Multi-page TIFF documents, common output from office scanners.
//!
//! Each page is an IFD in the main chain. We decode only the IFDs in the
//! requested range and re-encode them as PNG, which every OCR engine accepts.

use std::{
    fs::File,
    io::{BufReader, Cursor},
    ops::Range,
};

use image::{DynamicImage, GrayImage, ImageFormat, RgbImage, RgbaImage};
use tiff::{
    ColorType,
    decoder::{Decoder, DecodingResult},
};

use super::{Page, PagedDocument};
use crate::prelude::*;

/// A TIFF file on disk.
pub struct TiffDocument {
    path: PathBuf,
    page_count: usize,
}

impl TiffDocument {
    /// Open a TIFF and count its pages. This is blocking.
    pub fn open(path: &Path) -> Result<Self> {
        let mut decoder = open_decoder(path)?;
        let mut page_count = 1;
        while decoder.more_images() {
            decoder
                .next_image()
                .with_context(|| format!("failed to read IFD {}", page_count))?;
            page_count += 1;
        }
        debug!(path = %path.display(), page_count, "Counted TIFF pages");
        Ok(Self {
            path: path.to_owned(),
            page_count,
        })
    }
}

impl PagedDocument for TiffDocument {
    fn page_count(&self) -> usize {
        self.page_count
    }

    #[instrument(level = "debug", skip(self), fields(path = %self.path.display()))]
    fn render_pages(&self, pages: Range<usize>) -> Result<Vec<Page>> {
        if pages.is_empty() {
            return Ok(vec![]);
        }
        if pages.end > self.page_count {
            return Err(anyhow!(
                "page range {:?} out of bounds for {} pages",
                pages,
                self.page_count
            ));
        }

        let mut decoder = open_decoder(&self.path)?;
        let mut rendered = Vec::with_capacity(pages.len());
        for ifd_index in 0..pages.end {
            // The first IFD is loaded by `Decoder::new`.
            if ifd_index > 0 {
                decoder
                    .next_image()
                    .with_context(|| format!("failed to advance to IFD {}", ifd_index))?;
            }
            if ifd_index < pages.start {
                continue;
            }
            let image = decode_tiff_image(&mut decoder, ifd_index)?;
            let mut data = Vec::new();
            image
                .write_to(&mut Cursor::new(&mut data), ImageFormat::Png)
                .with_context(|| format!("failed to encode PNG for IFD {}", ifd_index))?;
            rendered.push(Page {
                mime_type: "image/png".to_owned(),
                data,
            });
        }
        Ok(rendered)
    }
}

fn open_decoder(path: &Path) -> Result<Decoder<BufReader<File>>> {
    let file = File::open(path)
        .with_context(|| format!("failed to open TIFF file {:?}", path.display()))?;
    Decoder::new(BufReader::new(file))
        .with_context(|| format!("failed to create TIFF decoder for {:?}", path.display()))
}

/// Decode the decoder's current IFD into an 8-bit image.
fn decode_tiff_image<R: std::io::Read + std::io::Seek>(
    decoder: &mut Decoder<R>,
    ifd_index: usize,
) -> Result<DynamicImage> {
    let (width, height) = decoder
        .dimensions()
        .with_context(|| format!("failed to get dimensions for IFD {}", ifd_index))?;
    let color_type = decoder
        .colortype()
        .with_context(|| format!("failed to get color type for IFD {}", ifd_index))?;
    let data = match decoder
        .read_image()
        .with_context(|| format!("failed to decode IFD {}", ifd_index))?
    {
        DecodingResult::U8(data) => data,
        // Scanners sometimes emit 16-bit grayscale. Keep the high byte.
        DecodingResult::U16(data) => data.iter().map(|&v| (v >> 8) as u8).collect(),
        _ => {
            return Err(anyhow!(
                "unsupported TIFF sample format in IFD {}",
                ifd_index
            ));
        }
    };

    let too_short = || anyhow!("pixel data too short for IFD {}", ifd_index);
    let image = match color_type {
        ColorType::Gray(_) => DynamicImage::ImageLuma8(
            GrayImage::from_raw(width, height, data).ok_or_else(too_short)?,
        ),
        ColorType::RGB(_) => DynamicImage::ImageRgb8(
            RgbImage::from_raw(width, height, data).ok_or_else(too_short)?,
        ),
        ColorType::RGBA(_) => DynamicImage::ImageRgba8(
            RgbaImage::from_raw(width, height, data).ok_or_else(too_short)?,
        ),
        other => {
            return Err(anyhow!(
                "unsupported TIFF color type {:?} in IFD {}",
                other,
                ifd_index
            ));
        }
    };
    Ok(image)
}
