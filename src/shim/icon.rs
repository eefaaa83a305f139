//! Icon handling for launcher bundles - ICNS encoding and fallbacks

use std::io::{Cursor, Write};
use std::path::Path;

use image::imageops::FilterType;
use image::{DynamicImage, ImageEncoder};
use serde::Serialize;
use tracing::{debug, warn};

use crate::core::Application;
use crate::error::{InstanceError, Result};

/// ICNS entry types holding PNG payloads, with their edge length
const ICNS_ENTRIES: &[(&[u8; 4], u32)] = &[(b"ic07", 128), (b"ic08", 256), (b"ic09", 512)];

/// Where a launcher's icon came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum IconSource {
    Custom,
    Original,
    Generic,
}

/// Encode an image as an ICNS file
pub fn encode_icns(image: &DynamicImage) -> Result<Vec<u8>> {
    let mut entries: Vec<(&[u8; 4], Vec<u8>)> = Vec::new();

    for &(kind, size) in ICNS_ENTRIES {
        let resized = image.resize_exact(size, size, FilterType::Lanczos3).to_rgba8();
        let mut png_data: Vec<u8> = Vec::new();
        {
            let mut cursor = Cursor::new(&mut png_data);
            let encoder = image::codecs::png::PngEncoder::new(&mut cursor);
            encoder
                .write_image(resized.as_raw(), size, size, image::ExtendedColorType::Rgba8)
                .map_err(|e| InstanceError::Format(format!("Failed to encode icon: {}", e)))?;
        }
        entries.push((kind, png_data));
    }

    let total: usize = 8 + entries.iter().map(|(_, data)| 8 + data.len()).sum::<usize>();
    let mut out = Vec::with_capacity(total);

    // Header: magic + total length, big-endian
    out.write_all(b"icns")?;
    out.write_all(&(total as u32).to_be_bytes())?;

    for (kind, data) in &entries {
        out.write_all(*kind)?;
        out.write_all(&((data.len() + 8) as u32).to_be_bytes())?;
        out.write_all(data)?;
    }

    Ok(out)
}

/// Install `source` as an ICNS at `dest`, converting when it is not one already.
pub fn install_icon(source: &Path, dest: &Path) -> Result<()> {
    let is_icns = source
        .extension()
        .map(|e| e.eq_ignore_ascii_case("icns"))
        .unwrap_or(false);

    if is_icns {
        std::fs::copy(source, dest)
            .map_err(|e| InstanceError::environment("Failed to copy icon", source, e))?;
        return Ok(());
    }

    let image = image::open(source).map_err(|e| {
        InstanceError::Format(format!("Unreadable icon {}: {}", source.display(), e))
    })?;
    let icns = encode_icns(&image)?;
    std::fs::write(dest, icns)
        .map_err(|e| InstanceError::environment("Failed to write icon", dest, e))?;
    Ok(())
}

/// Pick an icon by falling through custom, original, then the OS generic icon.
pub fn resolve_icon(
    custom: Option<&Path>,
    app: &Application,
    dest: &Path,
) -> Option<IconSource> {
    if let Some(custom) = custom {
        match install_icon(custom, dest) {
            Ok(()) => return Some(IconSource::Custom),
            Err(e) => warn!("Custom icon unusable, falling back: {}", e),
        }
    }

    if let Some(original) = app.icon_path() {
        match install_icon(&original, dest) {
            Ok(()) => return Some(IconSource::Original),
            Err(e) => debug!("Original icon unusable: {}", e),
        }
    }

    match generic_icon().map(|generic| install_icon(generic, dest)) {
        Some(Ok(())) => Some(IconSource::Generic),
        Some(Err(e)) => {
            warn!("No icon available for {:?}: {}", dest, e);
            None
        }
        None => {
            warn!("No icon available for {:?}", dest);
            None
        }
    }
}

fn generic_icon() -> Option<&'static Path> {
    #[cfg(target_os = "macos")]
    {
        let path = Path::new(crate::platform::macos::GENERIC_APP_ICON);
        path.exists().then_some(path)
    }
    #[cfg(not(target_os = "macos"))]
    {
        None
    }
}
