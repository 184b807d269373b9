use serde::{Deserialize, Serialize};

use crate::workflow_config::StageValidation;

/// Verdict read from an artifact's markers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkerVerdict {
    Pass,
    Fail,
    /// Changes requested are minor; eligible for fast-track
    Minor,
    /// No marker present
    Ambiguous,
}

impl std::fmt::Display for MarkerVerdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MarkerVerdict::Pass => "pass",
            MarkerVerdict::Fail => "fail",
            MarkerVerdict::Minor => "minor",
            MarkerVerdict::Ambiguous => "ambiguous",
        };
        write!(f, "{}", s)
    }
}

/// Return the verdict of whichever declared marker occurs first in `text`.
pub fn scan_markers(text: &str, validation: &StageValidation) -> MarkerVerdict {
    let candidates = [
        (validation.pass_marker.as_deref(), MarkerVerdict::Pass),
        (validation.fail_marker.as_deref(), MarkerVerdict::Fail),
        (validation.minor_marker.as_deref(), MarkerVerdict::Minor),
    ];

    candidates
        .iter()
        .filter_map(|(marker, verdict)| {
            let marker = marker.filter(|m| !m.is_empty())?;
            text.find(marker).map(|pos| (pos, *verdict))
        })
        .min_by_key(|(pos, _)| *pos)
        .map(|(_, verdict)| verdict)
        .unwrap_or(MarkerVerdict::Ambiguous)
}
