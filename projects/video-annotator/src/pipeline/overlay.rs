use crate::pipeline::types::{BBox, Detection};
use anyhow::Result;
use opencv::core::{Mat, Point, Rect, Scalar};
use opencv::imgproc::{self, FILLED, FONT_HERSHEY_SIMPLEX, LINE_8};
use opencv::prelude::*;

/// Class names of the PASCAL VOC MobileNet-SSD model, indexed by class id.
pub const CLASS_NAMES: [&str; 21] = [
    "background",
    "aeroplane",
    "bicycle",
    "bird",
    "boat",
    "bottle",
    "bus",
    "car",
    "cat",
    "chair",
    "cow",
    "diningtable",
    "dog",
    "horse",
    "motorbike",
    "person",
    "pottedplant",
    "sheep",
    "sofa",
    "train",
    "tvmonitor",
];

const BOX_THICKNESS: i32 = 2;
const FONT_SCALE: f64 = 1.0;
const FONT_THICKNESS: i32 = 1;

/// Draws detection results onto a frame in place.
pub trait OverlayRenderer<F> {
    fn render(&self, frame: &mut F, detections: &[Detection]) -> Result<()>;
}

pub fn label_for<'a>(labels: &[&'a str], class_id: i32) -> Option<&'a str> {
    usize::try_from(class_id)
        .ok()
        .and_then(|idx| labels.get(idx).copied())
}

/// Green box, white label plate above the top edge, black text.
pub struct BoxOverlay {
    labels: &'static [&'static str],
    box_color: Scalar,
    plate_color: Scalar,
    text_color: Scalar,
}

impl Default for BoxOverlay {
    fn default() -> Self {
        Self::new(&CLASS_NAMES)
    }
}

impl BoxOverlay {
    pub fn new(labels: &'static [&'static str]) -> Self {
        Self {
            labels,
            box_color: Scalar::new(0.0, 255.0, 0.0, 0.0),
            plate_color: Scalar::new(255.0, 255.0, 255.0, 0.0),
            text_color: Scalar::new(0.0, 0.0, 0.0, 0.0),
        }
    }

    fn draw_one(&self, frame: &mut Mat, detection: &Detection) -> Result<()> {
        let (cols, rows) = (frame.cols(), frame.rows());
        let (top_left, bottom_right) = clamp_corners(&detection.bbox, cols, rows);

        imgproc::rectangle_points(
            frame,
            top_left,
            bottom_right,
            self.box_color,
            BOX_THICKNESS,
            LINE_8,
            0,
        )?;

        let Some(name) = label_for(self.labels, detection.class_id) else {
            return Ok(());
        };

        let label = format!("{}: {}", name, detection.confidence);
        let mut base_line = 0;
        let text_size = imgproc::get_text_size(
            &label,
            FONT_HERSHEY_SIMPLEX,
            FONT_SCALE,
            FONT_THICKNESS,
            &mut base_line,
        )?;

        let plate = Rect::from_points(
            Point::new(top_left.x, top_left.y - text_size.height),
            Point::new(top_left.x + text_size.width, top_left.y + base_line),
        );
        imgproc::rectangle(frame, plate, self.plate_color, FILLED, LINE_8, 0)?;
        imgproc::put_text(
            frame,
            &label,
            top_left,
            FONT_HERSHEY_SIMPLEX,
            FONT_SCALE,
            self.text_color,
            FONT_THICKNESS,
            LINE_8,
            false,
        )?;

        Ok(())
    }
}

impl OverlayRenderer<Mat> for BoxOverlay {
    fn render(&self, frame: &mut Mat, detections: &[Detection]) -> Result<()> {
        for detection in detections {
            self.draw_one(frame, detection)?;
        }
        Ok(())
    }
}

/// Rounds box corners to pixels, keeping them within one frame size of the
/// visible area. Off-frame edges stay off-frame and are clipped by OpenCV.
fn clamp_corners(bbox: &BBox, cols: i32, rows: i32) -> (Point, Point) {
    let clamp = |v: f32, extent: i32| -> i32 {
        let v = if v.is_finite() { v } else { 0.0 };
        (v as i32).clamp(-extent, 2 * extent)
    };

    (
        Point::new(clamp(bbox.left, cols), clamp(bbox.top, rows)),
        Point::new(clamp(bbox.right, cols), clamp(bbox.bottom, rows)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use opencv::core::{Vec3b, CV_8UC3};

    fn black(cols: i32, rows: i32) -> Mat {
        Mat::new_rows_cols_with_default(rows, cols, CV_8UC3, Scalar::all(0.0)).unwrap()
    }

    fn count_color(mat: &Mat, bgr: [u8; 3]) -> usize {
        let mut count = 0;
        for y in 0..mat.rows() {
            for x in 0..mat.cols() {
                let px = mat.at_2d::<Vec3b>(y, x).unwrap();
                if px.0 == bgr {
                    count += 1;
                }
            }
        }
        count
    }

    fn detection(class_id: i32, left: f32, top: f32, right: f32, bottom: f32) -> Detection {
        Detection {
            class_id,
            confidence: 0.9,
            bbox: BBox {
                left,
                top,
                right,
                bottom,
            },
        }
    }

    #[test]
    fn test_label_lookup() {
        assert_eq!(label_for(&CLASS_NAMES, 0), Some("background"));
        assert_eq!(label_for(&CLASS_NAMES, 15), Some("person"));
        assert_eq!(label_for(&CLASS_NAMES, 20), Some("tvmonitor"));
        assert_eq!(label_for(&CLASS_NAMES, 21), None);
        assert_eq!(label_for(&CLASS_NAMES, -1), None);
    }

    #[test]
    fn test_known_class_draws_box_and_label() {
        let mut frame = black(200, 200);
        BoxOverlay::default()
            .render(&mut frame, &[detection(15, 20.0, 80.0, 120.0, 180.0)])
            .unwrap();

        assert_eq!(*frame.at_2d::<Vec3b>(130, 20).unwrap(), Vec3b::from([0, 255, 0]));
        assert!(count_color(&frame, [255, 255, 255]) > 0);
        assert!(count_color(&frame, [0, 255, 0]) > 0);
    }

    #[test]
    fn test_unknown_class_draws_box_without_label() {
        let mut frame = black(200, 200);
        BoxOverlay::default()
            .render(&mut frame, &[detection(42, 20.0, 80.0, 120.0, 180.0)])
            .unwrap();

        assert!(count_color(&frame, [0, 255, 0]) > 0);
        assert_eq!(count_color(&frame, [255, 255, 255]), 0);

        let mut negative = black(200, 200);
        BoxOverlay::default()
            .render(&mut negative, &[detection(-3, 20.0, 80.0, 120.0, 180.0)])
            .unwrap();
        assert_eq!(count_color(&negative, [255, 255, 255]), 0);
    }

    #[test]
    fn test_box_outside_frame_is_a_no_op() {
        let mut frame = black(100, 100);
        BoxOverlay::default()
            .render(&mut frame, &[detection(15, 500.0, 500.0, 600.0, 600.0)])
            .unwrap();

        assert_eq!(count_color(&frame, [0, 0, 0]), 100 * 100);
    }

    #[test]
    fn test_partially_visible_and_degenerate_boxes_do_not_fail() {
        let mut frame = black(100, 100);
        let overlay = BoxOverlay::default();
        overlay
            .render(
                &mut frame,
                &[
                    detection(7, -50.0, -50.0, 50.0, 50.0),
                    detection(7, f32::NAN, 10.0, f32::INFINITY, 20.0),
                    detection(7, 1e12, -1e12, 3e12, 1e12),
                ],
            )
            .unwrap();

        assert!(count_color(&frame, [0, 255, 0]) > 0);
    }

    #[test]
    fn test_clamp_keeps_offscreen_edges_offscreen() {
        let bbox = BBox {
            left: -1e9,
            top: 10.4,
            right: 1e9,
            bottom: 20.9,
        };
        let (tl, br) = clamp_corners(&bbox, 640, 480);
        assert_eq!(tl, Point::new(-640, 10));
        assert_eq!(br, Point::new(1280, 20));
    }
}
