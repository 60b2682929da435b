// Stride sampling with forced edge inclusion
//
// Given n input points and a point budget, every ceil(n / budget)-th point
// is emitted. Whenever the budget allows (two or more points), the first
// and last points of the window are included so decimated traces never
// clip visually at the window edges.

use crate::config::EngineConfig;
use crate::types::{DecimatedPoint, Reading};

/// Compute the point budget for a render width.
///
/// Returns `None` for the ultra-wide override: at or above the configured
/// width ceiling every point is returned for full-fidelity zoomed views.
pub fn point_budget(width_px: u32, config: &EngineConfig) -> Option<usize> {
    if width_px >= config.ultra_wide_px {
        return None;
    }
    Some(width_px as usize * config.quality.points_per_pixel())
}

/// Reduce a raw slice to at most `budget` points.
///
/// `None` means unbounded: all points are returned. The budget bound is
/// strict; a budget of 1 cannot satisfy edge inclusion, so it yields only
/// the newest point.
pub fn stride_decimate(points: &[Reading], budget: Option<usize>) -> Vec<DecimatedPoint> {
    let n = points.len();
    if n == 0 {
        return Vec::new();
    }

    let budget = match budget {
        Some(b) => b.max(1),
        None => return points.iter().map(|&r| r.into()).collect(),
    };

    if n <= budget {
        return points.iter().map(|&r| r.into()).collect();
    }

    if budget == 1 {
        return vec![points[n - 1].into()];
    }

    let step = n.div_ceil(budget);
    let mut out: Vec<DecimatedPoint> =
        points.iter().step_by(step).map(|&r| r.into()).collect();

    // The stride starts at the first point, so only the tail needs forcing.
    let last = points[n - 1];
    let tail_missing = out
        .last()
        .is_some_and(|p| p.timestamp_ms != last.timestamp_ms);
    if tail_missing {
        if out.len() >= budget {
            if let Some(tail) = out.last_mut() {
                *tail = last.into();
            }
        } else {
            out.push(last.into());
        }
    }

    out
}
