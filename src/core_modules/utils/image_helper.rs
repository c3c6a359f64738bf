pub mod image_helper {
    use crate::core_modules::pixel_buffer::PixelBuffer;
    use crate::error::{EraserError, Result};
    use image::ImageEncoder;
    use std::io::{BufWriter, Seek, Write};
    use std::path::Path;

    /// Decodes any image the `image` crate understands into 16-bit RGB.
    pub fn load_rgb16(path: &Path) -> Result<PixelBuffer> {
        let decoded = image::open(path).map_err(|source| EraserError::Decode {
            path: path.to_path_buf(),
            source,
        })?;
        let rgb = decoded.into_rgb16();
        let (width, height) = rgb.dimensions();
        PixelBuffer::from_raw(width, height, rgb.into_raw()).ok_or_else(|| {
            EraserError::Config(format!("{} decoded to a short buffer", path.display()))
        })
    }

    /// Encodes `buffer` as a 16-bit RGB TIFF.
    pub fn write_tiff<W: Write + Seek>(writer: W, buffer: &PixelBuffer) -> image::ImageResult<()> {
        let bytes: Vec<u8> = buffer
            .data
            .iter()
            .flat_map(|channel| channel.to_ne_bytes())
            .collect();
        let encoder = image::codecs::tiff::TiffEncoder::new(writer);
        encoder.write_image(
            &bytes,
            buffer.width,
            buffer.height,
            image::ExtendedColorType::Rgb16,
        )
    }

    /// Writes a new TIFF at `path`. An existing file is left alone and
    /// `Ok(false)` is returned.
    pub fn save_tiff_new(path: &Path, buffer: &PixelBuffer) -> Result<bool> {
        let file = match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
        {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => return Ok(false),
            Err(err) => {
                return Err(EraserError::Write {
                    path: path.to_path_buf(),
                    message: err.to_string(),
                });
            }
        };
        let mut writer = BufWriter::new(file);
        let written = write_tiff(&mut writer, buffer)
            .map_err(|err| err.to_string())
            .and_then(|_| writer.flush().map_err(|err| err.to_string()));
        if let Err(message) = written {
            // never leave a truncated file behind, it would count as finished on resume
            let _ = std::fs::remove_file(path);
            return Err(EraserError::Write {
                path: path.to_path_buf(),
                message,
            });
        }
        Ok(true)
    }
}
