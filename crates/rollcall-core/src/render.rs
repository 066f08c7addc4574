//! Annotated decision frames for the operator.

use crate::cycle::{DetectedFace, FaceClass};
use ab_glyph::{FontRef, PxScale};
use image::{DynamicImage, GrayImage, ImageFormat, Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;
use std::io::Cursor;

/// DejaVu Sans Mono, see `assets/DejaVu-LICENSE`.
static LABEL_FONT: &[u8] = include_bytes!("../assets/DejaVuSansMono.ttf");

const BOX_THICKNESS: u32 = 2;
const LABEL_SCALE: f32 = 14.0;
const LABEL_PAD: u32 = 2;
const LABEL_TEXT: Rgb<u8> = Rgb([0, 0, 0]);

fn colour(class: FaceClass) -> Rgb<u8> {
    match class {
        FaceClass::LiveKnown => Rgb([0, 200, 0]),
        FaceClass::SpoofSuspect => Rgb([220, 30, 30]),
        FaceClass::LiveUnknown => Rgb([240, 200, 0]),
        FaceClass::Dropped => Rgb([128, 128, 128]),
    }
}

/// Draw every face box and its [`DetectedFace::label`] onto an RGB copy
/// of the frame, coloured by class.
///
/// Labels sit on a filled strip above the box, or just inside its top
/// edge when the box touches the top of the frame.
pub fn annotate(frame: &GrayImage, faces: &[DetectedFace]) -> RgbImage {
    let mut out = DynamicImage::ImageLuma8(frame.clone()).to_rgb8();
    let font = match FontRef::try_from_slice(LABEL_FONT) {
        Ok(font) => Some(font),
        Err(e) => {
            tracing::warn!(error = %e, "label font unusable; drawing boxes only");
            None
        }
    };

    for face in faces {
        let Some(b) = face.bbox.clip(out.width(), out.height()) else {
            continue;
        };
        let colour = colour(face.class());
        for inset in 0..BOX_THICKNESS as i32 {
            let w = b.width() - 2 * inset;
            let h = b.height() - 2 * inset;
            if w <= 0 || h <= 0 {
                break;
            }
            let rect = Rect::at(b.left + inset, b.top + inset).of_size(w as u32, h as u32);
            draw_hollow_rect_mut(&mut out, rect, colour);
        }

        if let Some(font) = &font {
            draw_label(&mut out, font, b.left, b.top, &face.label(), colour);
        }
    }
    out
}

fn draw_label(image: &mut RgbImage, font: &FontRef<'_>, left: i32, top: i32, text: &str, background: Rgb<u8>) {
    if text.is_empty() {
        return;
    }
    let scale = PxScale::from(LABEL_SCALE);
    let (text_w, text_h) = text_size(scale, font, text);
    let strip_w = text_w + 2 * LABEL_PAD;
    let strip_h = text_h + 2 * LABEL_PAD;

    let strip_top = if top >= strip_h as i32 { top - strip_h as i32 } else { top };
    draw_filled_rect_mut(image, Rect::at(left, strip_top).of_size(strip_w, strip_h), background);
    draw_text_mut(
        image,
        LABEL_TEXT,
        left + LABEL_PAD as i32,
        strip_top + LABEL_PAD as i32,
        scale,
        font,
        text,
    );
}

/// PNG-encode an annotated frame.
pub fn to_png(image: &RgbImage) -> Result<Vec<u8>, image::ImageError> {
    let mut buf = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(image.clone()).write_to(&mut buf, ImageFormat::Png)?;
    Ok(buf.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BoundingBox, Embedding};

    fn face(bbox: BoundingBox, identity_id: Option<i64>, is_live: bool, name: &str) -> DetectedFace {
        DetectedFace {
            bbox,
            embedding: Embedding::new(vec![1.0]),
            identity_id,
            name: name.into(),
            distance: 0.1,
            motion_score: 9.0,
            is_live,
            liveness_assessed: true,
        }
    }

    #[test]
    fn test_annotate_draws_box_edges() {
        let frame = GrayImage::from_pixel(120, 120, image::Luma([10]));
        let faces = vec![face(BoundingBox::new(50, 90, 100, 30), Some(1), true, "Asha")];
        let out = annotate(&frame, &faces);

        assert_eq!(*out.get_pixel(30, 75), Rgb([0, 200, 0]));
        assert_eq!(*out.get_pixel(31, 75), Rgb([0, 200, 0]));
        assert_eq!(*out.get_pixel(89, 99), Rgb([0, 200, 0]));
        // Interior and far corner untouched.
        assert_eq!(*out.get_pixel(60, 80), Rgb([10, 10, 10]));
        assert_eq!(*out.get_pixel(115, 115), Rgb([10, 10, 10]));
    }

    #[test]
    fn test_label_strip_sits_above_box() {
        let frame = GrayImage::from_pixel(120, 120, image::Luma([10]));
        let faces = vec![face(BoundingBox::new(50, 90, 100, 30), Some(1), true, "Asha")];
        let out = annotate(&frame, &faces);

        let strip_rows = (30..50).filter(|&y| (30..60).any(|x| *out.get_pixel(x, y) != Rgb([10, 10, 10])));
        assert!(strip_rows.count() > 0);
    }

    #[test]
    fn test_different_names_render_differently() {
        let frame = GrayImage::from_pixel(200, 120, image::Luma([10]));
        let bbox = BoundingBox::new(50, 150, 110, 20);
        let asha = annotate(&frame, &[face(bbox, Some(1), true, "Asha")]);
        let bart = annotate(&frame, &[face(bbox, Some(1), true, "Bartholomew")]);
        assert_ne!(asha.as_raw(), bart.as_raw());
    }

    #[test]
    fn test_spoof_box_is_red() {
        let frame = GrayImage::new(40, 40);
        let faces = vec![face(BoundingBox::new(20, 30, 38, 10), Some(1), false, "")];
        assert_eq!(*annotate(&frame, &faces).get_pixel(10, 37), Rgb([220, 30, 30]));
    }

    #[test]
    fn test_png_signature() {
        let png = to_png(&RgbImage::new(3, 3)).unwrap();
        assert_eq!(&png[..4], &[0x89, b'P', b'N', b'G']);
    }
}
