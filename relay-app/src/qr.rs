//! Pairing challenge rendering: token -> QR PNG -> `data:` URL.

use anyhow::{Context, Result};
use base64::Engine;
use image::{ImageBuffer, ImageFormat, Luma};
use qrcode::{Color, EcLevel, QrCode};
use std::io::Cursor;

const MODULE_PX: u32 = 10;
const QUIET_ZONE_MODULES: u32 = 2;

const DARK: Luma<u8> = Luma([0]);
const LIGHT: Luma<u8> = Luma([255]);

pub fn challenge_png(token: &str) -> Result<Vec<u8>> {
    let code = QrCode::with_error_correction_level(token.as_bytes(), EcLevel::L)
        .context("encode pairing challenge as QR")?;
    let width = code.width() as u32;
    let colors = code.to_colors();
    let side = (width + QUIET_ZONE_MODULES * 2) * MODULE_PX;

    let image = ImageBuffer::from_fn(side, side, |x, y| {
        let (col, row) = (x / MODULE_PX, y / MODULE_PX);
        if col < QUIET_ZONE_MODULES || row < QUIET_ZONE_MODULES {
            return LIGHT;
        }
        let (col, row) = (col - QUIET_ZONE_MODULES, row - QUIET_ZONE_MODULES);
        if col >= width || row >= width {
            return LIGHT;
        }
        match colors[(row * width + col) as usize] {
            Color::Dark => DARK,
            Color::Light => LIGHT,
        }
    });

    let mut png = Cursor::new(Vec::new());
    image
        .write_to(&mut png, ImageFormat::Png)
        .context("encode QR image as PNG")?;
    Ok(png.into_inner())
}

/// `data:image/png;base64,...` for embedding in an `<img src>`.
pub fn challenge_data_url(token: &str) -> Result<String> {
    let png = challenge_png(token)?;
    Ok(format!(
        "data:image/png;base64,{}",
        base64::engine::general_purpose::STANDARD.encode(png)
    ))
}
