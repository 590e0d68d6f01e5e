use crate::detect::Detection;
use crate::tally::LabelTally;
use serde::{Deserialize, Serialize};
use std::fmt::Write;
use std::time::Duration;

/// One entry of the `predictions` list returned to web clients.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub label: String,
    pub confidence: f32,
}

impl From<&Detection> for Prediction {
    fn from(det: &Detection) -> Self {
        Self {
            label: det.label.clone(),
            confidence: det.confidence,
        }
    }
}

/// Detections, their tally, and the inference time for one image or frame.
#[derive(Clone, Debug, PartialEq)]
pub struct FrameReport {
    pub detections: Vec<Detection>,
    pub tally: LabelTally,
    pub elapsed: Duration,
}

impl FrameReport {
    pub fn new(detections: Vec<Detection>, elapsed: Duration) -> Self {
        let tally = LabelTally::from_detections(&detections);
        Self {
            detections,
            tally,
            elapsed,
        }
    }

    pub fn predictions(&self) -> Vec<Prediction> {
        self.detections.iter().map(Prediction::from).collect()
    }

    pub fn processing_time(&self) -> String {
        format_seconds(self.elapsed)
    }

    /// The block appended to the GUI log for this report.
    pub fn log_text(&self) -> String {
        let mut out = format!("Inference time: {}\n", self.processing_time());
        for det in &self.detections {
            let _ = writeln!(out, "label: {}, confidence: {:.2}", det.label, det.confidence);
        }
        out.push_str("label counts:\n");
        for (label, count) in self.tally.sorted() {
            let _ = writeln!(out, "{label}: {count}");
        }
        out
    }
}

pub fn format_seconds(elapsed: Duration) -> String {
    format!("{:.2} s", elapsed.as_secs_f64())
}
