//! Class-aware greedy non-maximum suppression.
//!
//! Candidates are ranked by confidence (ties broken by original index, so the
//! pass is deterministic for a deterministic input ordering). A kept candidate
//! suppresses lower-ranked candidates of the same class whose IoU is strictly
//! greater than the threshold; equal-IoU survives. Different classes never
//! suppress each other.

use crate::decode::DetectedObject;

pub fn non_max_suppression(detections: Vec<DetectedObject>, iou_threshold: f32) -> Vec<DetectedObject> {
    if detections.len() <= 1 {
        return detections;
    }

    let mut order: Vec<usize> = (0..detections.len()).collect();
    order.sort_by(|&a, &b| {
        detections[b]
            .confidence
            .partial_cmp(&detections[a].confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.cmp(&b))
    });

    let mut suppressed = vec![false; detections.len()];
    let mut keep: Vec<usize> = Vec::new();

    for (rank, &i) in order.iter().enumerate() {
        if suppressed[i] {
            continue;
        }
        keep.push(i);

        for &j in &order[rank + 1..] {
            if suppressed[j] || detections[j].class_id != detections[i].class_id {
                continue;
            }
            if detections[i].bounding_box.iou(&detections[j].bounding_box) > iou_threshold {
                suppressed[j] = true;
            }
        }
    }

    // keep is already in greedy-selection (confidence-descending) order
    keep.into_iter().map(|i| detections[i].clone()).collect()
}
