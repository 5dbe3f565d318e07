//! EXIF orientation correction for still images.

use std::io::Cursor;

use image::DynamicImage;
use tracing::{debug, info, warn};

/// EXIF orientation (tag 274) values 1..=8.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Orientation {
    #[default]
    Normal,
    MirroredHorizontal,
    Rotated180,
    MirroredVertical,
    MirroredHorizontalAnd270Cw,
    Rotated90Cw,
    MirroredHorizontalAnd90Cw,
    Rotated270Cw,
}

impl From<u32> for Orientation {
    fn from(value: u32) -> Self {
        match value {
            2 => Self::MirroredHorizontal,
            3 => Self::Rotated180,
            4 => Self::MirroredVertical,
            5 => Self::MirroredHorizontalAnd270Cw,
            6 => Self::Rotated90Cw,
            7 => Self::MirroredHorizontalAnd90Cw,
            8 => Self::Rotated270Cw,
            _ => Self::Normal,
        }
    }
}

impl Orientation {
    /// Read the orientation tag from the primary image. `None` when there is
    /// no EXIF block or no orientation field.
    pub fn from_bytes(bytes: &[u8]) -> Option<u32> {
        let exif = exif::Reader::new()
            .read_from_container(&mut Cursor::new(bytes))
            .ok()?;
        let field = exif.get_field(exif::Tag::Orientation, exif::In::PRIMARY)?;
        field.value.get_uint(0)
    }

    pub fn apply(&self, img: DynamicImage) -> DynamicImage {
        match self {
            Self::Normal => img,
            Self::MirroredHorizontal => img.fliph(),
            Self::Rotated180 => img.rotate180(),
            Self::MirroredVertical => img.flipv(),
            Self::MirroredHorizontalAnd270Cw => img.fliph().rotate270(),
            Self::Rotated90Cw => img.rotate90(),
            Self::MirroredHorizontalAnd90Cw => img.fliph().rotate90(),
            Self::Rotated270Cw => img.rotate270(),
        }
    }
}

/// Bake the EXIF orientation into the pixels and re-encode as JPEG without
/// metadata. Returns the input unchanged when there is nothing to do or when
/// anything fails along the way.
pub fn normalize_orientation(bytes: &[u8]) -> Vec<u8> {
    let Some(value) = Orientation::from_bytes(bytes) else {
        debug!("No EXIF orientation found, keeping original bytes");
        return bytes.to_vec();
    };
    if value == 1 {
        return bytes.to_vec();
    }
    if !(2..=8).contains(&value) {
        warn!("Unknown EXIF orientation value {}, keeping original bytes", value);
        return bytes.to_vec();
    }

    let img = match image::load_from_memory(bytes) {
        Ok(img) => img,
        Err(e) => {
            warn!("Failed to decode image for orientation {}: {}", value, e);
            return bytes.to_vec();
        }
    };
    let rotated = Orientation::from(value).apply(img);
    match encode_jpeg(&rotated, 95) {
        Ok(out) => {
            info!("Normalized EXIF orientation {} -> 1", value);
            out
        }
        Err(e) => {
            warn!("Failed to re-encode image after orientation {}: {}", value, e);
            bytes.to_vec()
        }
    }
}

pub(crate) fn encode_jpeg(img: &DynamicImage, quality: u8) -> image::ImageResult<Vec<u8>> {
    let rgb = DynamicImage::ImageRgb8(img.to_rgb8());
    let mut buf = Vec::new();
    rgb.write_to(&mut Cursor::new(&mut buf), image::ImageOutputFormat::Jpeg(quality))?;
    Ok(buf)
}
