//! PNG export with embedded metadata (tEXt chunks).

use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use image::RgbaImage;
use tracing::debug;

use crate::assembler::Assembled;

/// Metadata to embed in an exported PNG as tEXt chunks.
#[derive(Debug, Clone)]
pub struct ExportMetadata {
    pub center_re: f64,
    pub center_im: f64,
    pub zoom_level: u32,
    pub max_iterations: u32,
    pub palette_name: String,
}

impl ExportMetadata {
    pub fn from_assembled(assembled: &Assembled, palette_name: &str) -> Self {
        Self {
            center_re: assembled.center.re,
            center_im: assembled.center.im,
            zoom_level: assembled.level,
            max_iterations: assembled.max_iterations,
            palette_name: palette_name.to_string(),
        }
    }
}

impl ExportMetadata {
    /// `(keyword, text)` pairs written as tEXt chunks, `Software` first.
    pub fn text_chunks(&self, width: u32, height: u32) -> Vec<(String, String)> {
        let description = format!(
            "Mandelbrot set at {} {:+}i, zoom level {}, {} iterations",
            self.center_re, self.center_im, self.zoom_level, self.max_iterations,
        );
        [
            ("Software", "MandelTile".to_string()),
            ("Description", description),
            ("MandelTile.CenterRe", self.center_re.to_string()),
            ("MandelTile.CenterIm", self.center_im.to_string()),
            ("MandelTile.ZoomLevel", self.zoom_level.to_string()),
            ("MandelTile.MaxIterations", self.max_iterations.to_string()),
            ("MandelTile.Palette", self.palette_name.clone()),
            ("MandelTile.Resolution", format!("{width}x{height}")),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
    }
}

/// Write an RGBA image as a PNG file with the view metadata as tEXt chunks.
///
/// Goes through the `png` encoder rather than `image::save` so the chunks can
/// be added before the header is written.
pub fn export_png(image: &RgbaImage, path: &Path, metadata: &ExportMetadata) -> crate::Result<()> {
    let (width, height) = image.dimensions();
    let mut encoder = png::Encoder::new(BufWriter::new(File::create(path)?), width, height);
    encoder.set_color(png::ColorType::Rgba);
    encoder.set_depth(png::BitDepth::Eight);
    for (keyword, text) in metadata.text_chunks(width, height) {
        encoder.add_text_chunk(keyword, text)?;
    }

    let mut writer = encoder.write_header()?;
    writer.write_image_data(image.as_raw())?;
    writer.finish()?;

    debug!(width, height, path = %path.display(), "exported PNG");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn metadata() -> ExportMetadata {
        ExportMetadata {
            center_re: -0.745,
            center_im: 0.105,
            zoom_level: 8,
            max_iterations: 70,
            palette_name: "Ocean".into(),
        }
    }

    fn scratch_path(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("mandeltile_export_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir.join(name)
    }

    #[test]
    fn pixels_survive_export() {
        let image = RgbaImage::from_fn(3, 2, |x, y| image::Rgba([x as u8 * 80, y as u8 * 120, 7, 255]));
        let path = scratch_path("pixels.png");
        export_png(&image, &path, &metadata()).unwrap();

        let decoded = image::open(&path).unwrap().to_rgba8();
        assert_eq!(decoded, image);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn metadata_is_readable_back() {
        let path = scratch_path("meta.png");
        export_png(&RgbaImage::new(5, 4), &path, &metadata()).unwrap();

        let reader = png::Decoder::new(File::open(&path).unwrap())
            .read_info()
            .unwrap();
        let texts: HashMap<_, _> = reader
            .info()
            .uncompressed_latin1_text
            .iter()
            .map(|chunk| (chunk.keyword.clone(), chunk.text.clone()))
            .collect();
        assert_eq!(texts["Software"], "MandelTile");
        assert_eq!(texts["MandelTile.ZoomLevel"], "8");
        assert_eq!(texts["MandelTile.Palette"], "Ocean");
        assert_eq!(texts["MandelTile.Resolution"], "5x4");
        assert!(texts["Description"].contains("-0.745 +0.105i"));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn export_to_missing_directory_fails() {
        let path = std::env::temp_dir()
            .join("mandeltile_no_such_dir")
            .join("x.png");
        let err = export_png(&RgbaImage::new(1, 1), &path, &metadata()).unwrap_err();
        assert!(matches!(err, crate::RenderError::Io(_)));
    }
}
