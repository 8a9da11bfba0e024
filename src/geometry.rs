use serde::Serialize;

/// Axis-aligned box in image pixel space. Width and height are kept
/// non-negative by construction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: Option<f32>,
    pub class_id: Option<usize>,
    pub class_name: Option<String>,
}

impl BoundingBox {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width: width.max(0.0),
            height: height.max(0.0),
            confidence: None,
            class_id: None,
            class_name: None,
        }
    }

    /// Build from a center-form detection (cx, cy, w, h).
    pub fn from_center(cx: f32, cy: f32, w: f32, h: f32) -> Self {
        Self::new(cx - w / 2.0, cy - h / 2.0, w, h)
    }

    pub fn area(&self) -> f32 {
        self.width * self.height
    }

    pub fn center(&self) -> (f32, f32) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    /// Width over height; 0 when the box is degenerate in height.
    pub fn aspect_ratio(&self) -> f32 {
        if self.height <= f32::EPSILON {
            0.0
        } else {
            self.width / self.height
        }
    }

    pub fn right(&self) -> f32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> f32 {
        self.y + self.height
    }

    pub fn is_degenerate(&self) -> bool {
        self.width <= 0.0 || self.height <= 0.0
    }

    /// Intersection area with another box.
    pub fn intersection(&self, other: &BoundingBox) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = self.right().min(other.right());
        let y2 = self.bottom().min(other.bottom());

        if x2 <= x1 || y2 <= y1 {
            return 0.0;
        }
        (x2 - x1) * (y2 - y1)
    }

    /// Intersection over union, symmetric, in [0, 1].
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let inter = self.intersection(other);
        let union = self.area() + other.area() - inter;
        if union <= f32::EPSILON {
            return 0.0;
        }
        inter / union
    }

    /// Clamp the box into `[0, img_w] x [0, img_h]`, shrinking width/height
    /// to whatever remains inside the image.
    pub fn clamp_to(&mut self, img_w: f32, img_h: f32) {
        let x2 = self.right().clamp(0.0, img_w);
        let y2 = self.bottom().clamp(0.0, img_h);
        self.x = self.x.clamp(0.0, img_w);
        self.y = self.y.clamp(0.0, img_h);
        self.width = (x2 - self.x).max(0.0);
        self.height = (y2 - self.y).max(0.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iou_of_box_with_itself_is_one() {
        let b = BoundingBox::new(10.0, 10.0, 20.0, 20.0);
        assert!((b.iou(&b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn iou_of_disjoint_boxes_is_zero() {
        let a = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BoundingBox::new(50.0, 50.0, 10.0, 10.0);
        assert_eq!(a.iou(&b), 0.0);
    }

    #[test]
    fn iou_is_symmetric() {
        let a = BoundingBox::new(0.0, 0.0, 20.0, 20.0);
        let b = BoundingBox::new(10.0, 10.0, 20.0, 20.0);
        assert!((a.iou(&b) - b.iou(&a)).abs() < 1e-6);
    }

    #[test]
    fn center_and_area() {
        let b = BoundingBox::new(10.0, 10.0, 20.0, 20.0);
        assert_eq!(b.center(), (20.0, 20.0));
        assert_eq!(b.area(), 400.0);
        assert!((b.aspect_ratio() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn clamp_shrinks_out_of_bounds_box() {
        let mut b = BoundingBox::new(-5.0, 50.0, 20.0, 30.0);
        b.clamp_to(64.0, 64.0);
        assert_eq!(b.x, 0.0);
        assert_eq!(b.width, 15.0);
        assert_eq!(b.bottom(), 64.0);
    }

    #[test]
    fn negative_dimensions_are_clamped_at_construction() {
        let b = BoundingBox::new(0.0, 0.0, -3.0, 5.0);
        assert_eq!(b.width, 0.0);
        assert!(b.is_degenerate());
    }
}
