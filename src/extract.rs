//! Metadata extraction.
//!
//! Extraction is total: a file that cannot be read, or a tool that cannot be
//! launched, yields an empty or partial tag map, never an error. Two stages
//! compose statically through [`CompositeExtractor`]:
//!
//! 1. [`ExifToolExtractor`] runs `exiftool -json -g1 -n` and flattens the
//!    grouped output into `"Group:Tag"` keys.
//! 2. [`ContainerInspector`] opens PNG/GIF/BMP/WebP files with a generic
//!    decoder and adds what the container exposes under `Container:`.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use image::{ImageDecoder, ImageReader};
use serde_json::Value;
use tracing::debug;

use crate::model::Metadata;

/// Key prefix for values reported by the container inspector.
pub const CONTAINER_PREFIX: &str = "Container:";

/// Formats whose ancillary text is not reported by exiftool's grouped output.
pub const CONTAINER_EXTENSIONS: &[&str] = &["png", "gif", "bmp", "webp"];

pub trait MetadataExtractor: Send + Sync {
    fn extract(&self, path: &Path) -> Metadata;
}

impl<T: MetadataExtractor + ?Sized> MetadataExtractor for Box<T> {
    fn extract(&self, path: &Path) -> Metadata {
        (**self).extract(path)
    }
}

/// Extractor used by the binary: exiftool first, container inspection second.
pub type DefaultExtractor = CompositeExtractor<ExifToolExtractor, ContainerInspector>;

pub fn default_extractor(exiftool: impl Into<PathBuf>) -> DefaultExtractor {
    CompositeExtractor::new(ExifToolExtractor::new(exiftool), ContainerInspector)
}

#[derive(Debug, Clone)]
pub struct ExifToolExtractor {
    program: PathBuf,
}

impl Default for ExifToolExtractor {
    fn default() -> Self {
        Self::new("exiftool")
    }
}

impl ExifToolExtractor {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl MetadataExtractor for ExifToolExtractor {
    fn extract(&self, path: &Path) -> Metadata {
        let output = Command::new(&self.program)
            .args(["-json", "-g1", "-n"])
            .arg(path)
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output();

        match output {
            Ok(output) => flatten_grouped(&String::from_utf8_lossy(&output.stdout)),
            Err(err) => {
                debug!(path = %path.display(), error = %err, "exiftool not runnable");
                Metadata::new()
            }
        }
    }
}

/// Flattens exiftool's `-json -g1` document for a single file.
///
/// Group objects become `"Group:Tag"` keys. Only one level is flattened;
/// anything nested deeper is kept as its compact JSON text.
pub fn flatten_grouped(stdout: &str) -> Metadata {
    let mut metadata = Metadata::new();
    if stdout.trim().is_empty() {
        return metadata;
    }

    let items = match serde_json::from_str::<Value>(stdout) {
        Ok(Value::Array(items)) => items,
        Ok(_) => return metadata,
        Err(err) => {
            debug!(error = %err, "unparsable exiftool output");
            return metadata;
        }
    };

    let Some(Value::Object(groups)) = items.into_iter().next() else {
        return metadata;
    };

    for (key, value) in groups {
        match value {
            Value::Object(tags) => {
                for (tag, tag_value) in tags {
                    metadata.insert(format!("{key}:{tag}"), value_text(&tag_value));
                }
            }
            other => {
                metadata.insert(key, value_text(&other));
            }
        }
    }
    metadata
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Reads container-level information with the image decoders.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContainerInspector;

impl ContainerInspector {
    pub fn handles(path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| {
                let ext = ext.to_ascii_lowercase();
                CONTAINER_EXTENSIONS.contains(&ext.as_str())
            })
            .unwrap_or(false)
    }

    fn decoder_info(path: &Path, out: &mut Metadata) -> image::ImageResult<()> {
        let reader = ImageReader::open(path)?.with_guessed_format()?;
        if let Some(format) = reader.format() {
            out.insert(container_key("format"), format!("{format:?}"));
        }

        let mut decoder = reader.into_decoder()?;
        let (width, height) = decoder.dimensions();
        out.insert(container_key("width"), width.to_string());
        out.insert(container_key("height"), height.to_string());
        out.insert(
            container_key("color_type"),
            format!("{:?}", decoder.color_type()),
        );
        if let Some(icc) = decoder.icc_profile()? {
            out.insert(container_key("icc_profile"), format!("{} bytes", icc.len()));
        }
        Ok(())
    }

    fn png_text(path: &Path, out: &mut Metadata) -> Result<(), png::DecodingError> {
        let file = File::open(path)?;
        let reader = png::Decoder::new(BufReader::new(file)).read_info()?;
        let info = reader.info();

        if let Some(dims) = info.pixel_dims {
            if dims.unit == png::Unit::Meter {
                let dpi_x = (dims.xppu as f64 * 0.0254).round();
                let dpi_y = (dims.yppu as f64 * 0.0254).round();
                out.insert(container_key("dpi"), format!("{dpi_x}x{dpi_y}"));
            }
        }
        for chunk in &info.uncompressed_latin1_text {
            out.insert(container_key(&chunk.keyword), chunk.text.clone());
        }
        for chunk in &info.compressed_latin1_text {
            if let Ok(text) = chunk.get_text() {
                out.insert(container_key(&chunk.keyword), text);
            }
        }
        for chunk in &info.utf8_text {
            if let Ok(text) = chunk.get_text() {
                out.insert(container_key(&chunk.keyword), text);
            }
        }
        Ok(())
    }
}

fn container_key(name: &str) -> String {
    format!("{CONTAINER_PREFIX}{name}")
}

impl MetadataExtractor for ContainerInspector {
    fn extract(&self, path: &Path) -> Metadata {
        let mut metadata = Metadata::new();
        if !Self::handles(path) {
            return metadata;
        }

        if let Err(err) = Self::decoder_info(path, &mut metadata) {
            debug!(path = %path.display(), error = %err, "container decode failed");
        }
        let is_png = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("png"))
            .unwrap_or(false);
        if is_png {
            if let Err(err) = Self::png_text(path, &mut metadata) {
                debug!(path = %path.display(), error = %err, "png text chunks unreadable");
            }
        }
        metadata
    }
}

/// Runs `primary`, then merges whatever `secondary` adds on top.
#[derive(Debug, Clone, Default)]
pub struct CompositeExtractor<A, B> {
    primary: A,
    secondary: B,
}

impl<A, B> CompositeExtractor<A, B> {
    pub fn new(primary: A, secondary: B) -> Self {
        Self { primary, secondary }
    }
}

impl<A: MetadataExtractor, B: MetadataExtractor> MetadataExtractor for CompositeExtractor<A, B> {
    fn extract(&self, path: &Path) -> Metadata {
        let mut metadata = self.primary.extract(path);
        metadata.extend(self.secondary.extract(path));
        metadata
    }
}

/// Builds the full-text blob: every key and value in order, followed by the
/// whole map as one compact JSON document.
pub fn metadata_to_text(metadata: &Metadata) -> String {
    let mut parts: Vec<String> = Vec::with_capacity(metadata.len() * 2 + 1);
    for (key, value) in metadata {
        parts.push(key.clone());
        parts.push(value.clone());
    }
    parts.push(serde_json::to_string(metadata).unwrap_or_default());
    parts.join(" ")
}
