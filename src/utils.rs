use anyhow::{anyhow, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::Local;
use log::LevelFilter;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

// Logging setup and the small file helpers used by the command line client.

/// Largest image accepted for upload.
pub const MAX_IMAGE_BYTES: u64 = 5 * 1024 * 1024;

const IMAGE_TYPES: &[(&str, &str)] = &[
    ("png", "image/png"),
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("gif", "image/gif"),
    ("webp", "image/webp"),
    ("bmp", "image/bmp"),
    ("svg", "image/svg+xml"),
];

/// Route log output to `log_file` (or stderr) with source locations.
/// `level` wins over `RUST_LOG` when given.
pub fn setup_logging(log_file: Option<&str>, level: Option<LevelFilter>) -> Result<()> {
    let mut builder = env_logger::Builder::new();
    builder.parse_env(env_logger::Env::default());
    if let Some(level) = level {
        builder.filter_level(level);
    }
    builder.format(|buf, record| {
        writeln!(
            buf,
            "[{}] {} [{}:{}] {}",
            Local::now().format("%Y-%m-%d %H:%M:%S"),
            record.level(),
            record.file().unwrap_or("unknown"),
            record.line().unwrap_or(0),
            record.args()
        )
    });

    if let Some(path) = log_file {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }

    builder
        .try_init()
        .map_err(|e| anyhow!("Logger already initialized: {}", e))?;

    log::info!("Logging initialized at level: {}", log::max_level());
    log::info!("App version: {} ({})", env!("CARGO_PKG_VERSION"), env!("CARGO_PKG_NAME"));
    Ok(())
}

fn image_mime(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    IMAGE_TYPES
        .iter()
        .find(|(known, _)| *known == ext)
        .map(|(_, mime)| *mime)
}

/// Read an image file into a `data:` URL suitable for the send endpoint.
pub fn image_data_url(path: &Path) -> Result<String> {
    let mime = image_mime(path).ok_or_else(|| anyhow!("{} is not an image file", path.display()))?;

    let size = fs::metadata(path)
        .map_err(|e| anyhow!("Cannot read {}: {}", path.display(), e))?
        .len();
    if size > MAX_IMAGE_BYTES {
        return Err(anyhow!(
            "{} is {} bytes; images are limited to 5 MB",
            path.display(),
            size
        ));
    }

    let bytes = fs::read(path)?;
    Ok(format!("data:{};base64,{}", mime, BASE64.encode(bytes)))
}
