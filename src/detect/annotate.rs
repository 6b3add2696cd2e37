//! Box drawing for annotated frames.

use image::{Rgb, RgbImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;

use crate::detect::result::Detection;

const BOX_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const BOX_THICKNESS: i32 = 2;

/// Copy `image` and draw every detection onto the copy.
///
/// With no detections the copy is pixel-identical to the input.
pub fn draw_detections(image: &RgbImage, detections: &[Detection]) -> RgbImage {
    let mut annotated = image.clone();
    let (width, height) = annotated.dimensions();
    if width == 0 || height == 0 {
        return annotated;
    }
    let max_x = width as i32 - 1;
    let max_y = height as i32 - 1;

    for detection in detections {
        let bbox = detection.bbox;
        let left = bbox.x1.clamp(0, max_x);
        let top = bbox.y1.clamp(0, max_y);
        let right = bbox.x2.clamp(0, max_x);
        let bottom = bbox.y2.clamp(0, max_y);

        for t in 0..BOX_THICKNESS {
            let w = right - left - 2 * t;
            let h = bottom - top - 2 * t;
            if w <= 0 || h <= 0 {
                break;
            }
            let rect = Rect::at(left + t, top + t).of_size(w as u32, h as u32);
            draw_hollow_rect_mut(&mut annotated, rect, BOX_COLOR);
        }
    }

    annotated
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::result::BoundingBox;

    #[test]
    fn no_detections_is_pass_through() {
        let image = RgbImage::from_pixel(16, 16, Rgb([9, 9, 9]));
        assert_eq!(draw_detections(&image, &[]), image);
    }

    #[test]
    fn draws_box_edges_only() {
        let image = RgbImage::from_pixel(32, 32, Rgb([0, 0, 0]));
        let detection = Detection::new(BoundingBox::from_corners(4, 4, 20, 20), 0.9);
        let annotated = draw_detections(&image, &[detection]);
        assert_eq!(*annotated.get_pixel(4, 4), BOX_COLOR);
        assert_eq!(*annotated.get_pixel(12, 12), Rgb([0, 0, 0]));
    }

    #[test]
    fn out_of_frame_boxes_are_clamped() {
        let image = RgbImage::from_pixel(8, 8, Rgb([0, 0, 0]));
        let detection = Detection::new(BoundingBox::from_corners(-5, -5, 50, 50), 0.5);
        let annotated = draw_detections(&image, &[detection]);
        assert_eq!(*annotated.get_pixel(0, 0), BOX_COLOR);
    }
}
