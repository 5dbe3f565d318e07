//! Per-face quality gating.
//!
//! Two policies exist: component gates (size, then pose, then occlusion) and
//! a flat floor on the composite score. Callers pick a floor per tier: a low
//! one before attempting recognition and a higher one before creating a new
//! identity.

use std::fmt;

use crate::models::vision::QualityScores;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ComponentGates {
    pub min_size: f64,
    pub min_pose: f64,
    pub min_occlusion: f64,
}

impl Default for ComponentGates {
    fn default() -> Self {
        Self { min_size: 0.2, min_pose: 0.5, min_occlusion: 0.6 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum QualityPolicy {
    Components(ComponentGates),
    Composite(f64),
}

impl QualityPolicy {
    /// Parse a configured floor. `components` or any value `<= 0` selects
    /// the component gates.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.eq_ignore_ascii_case("components") {
            return Some(QualityPolicy::Components(ComponentGates::default()));
        }
        raw.parse::<f64>().ok().map(Self::from_floor)
    }

    pub fn from_floor(floor: f64) -> Self {
        if floor > 0.0 {
            QualityPolicy::Composite(floor)
        } else {
            QualityPolicy::Components(ComponentGates::default())
        }
    }
}

impl fmt::Display for QualityPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QualityPolicy::Composite(min) => write!(f, "composite>={:.2}", min),
            QualityPolicy::Components(g) => write!(
                f,
                "components(size>={:.2}, pose>={:.2}, occlusion>={:.2})",
                g.min_size, g.min_pose, g.min_occlusion
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QualityAssessment {
    pub acceptable: bool,
    pub reason: Option<String>,
    pub composite: f64,
    pub size: f64,
    pub pose: f64,
    pub occlusion: f64,
    pub sharpness: f64,
}

impl QualityAssessment {
    fn perfect() -> Self {
        Self { acceptable: true, reason: None, composite: 1.0, size: 1.0, pose: 1.0, occlusion: 1.0, sharpness: 1.0 }
    }

    fn reject(mut self, reason: String) -> Self {
        self.acceptable = false;
        self.reason = Some(reason);
        self
    }
}

/// Evaluate quality scores against a policy. Missing scores are accepted.
pub fn assess(quality: Option<&QualityScores>, policy: &QualityPolicy) -> QualityAssessment {
    let Some(q) = quality else {
        return QualityAssessment::perfect();
    };
    let result = QualityAssessment {
        acceptable: true,
        reason: None,
        composite: q.composite,
        size: q.components.size,
        pose: q.components.pose,
        occlusion: q.components.occlusion,
        sharpness: q.components.sharpness,
    };

    match policy {
        QualityPolicy::Composite(min) => {
            if result.composite < *min {
                let reason = format!("composite={:.2} < {:.2}", result.composite, min);
                return result.reject(reason);
            }
            result
        }
        QualityPolicy::Components(gates) => {
            if result.size < gates.min_size {
                let reason = format!("size={:.2} < {}", result.size, gates.min_size);
                return result.reject(reason);
            }
            if result.pose < gates.min_pose {
                let reason = format!("pose={:.2} < {}", result.pose, gates.min_pose);
                return result.reject(reason);
            }
            if result.occlusion < gates.min_occlusion {
                let reason = format!("occlusion={:.2} < {}", result.occlusion, gates.min_occlusion);
                return result.reject(reason);
            }
            result
        }
    }
}
