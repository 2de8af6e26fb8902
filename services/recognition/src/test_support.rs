use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use std::io::Cursor;

/// Encode an in-memory image into `format`.
pub fn encode(img: &DynamicImage, format: ImageFormat) -> Vec<u8> {
    let mut buf = Cursor::new(Vec::new());
    img.write_to(&mut buf, format).unwrap();
    buf.into_inner()
}

/// A PNG filled with a single color.
pub fn solid_png(width: u32, height: u32, rgb: [u8; 3]) -> Vec<u8> {
    let img = RgbImage::from_pixel(width, height, Rgb(rgb));
    encode(&DynamicImage::ImageRgb8(img), ImageFormat::Png)
}
