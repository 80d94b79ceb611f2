// src/runway_detection.rs
//
// Segmentation-based runway detection.
//
// Pipeline per frame:
//   1. Downscale to processing width
//   2. HSV classification into white (runway surface/markings),
//      green (grass surround) and gray (paved surround) masks
//   3. Morphological open/close on the white mask
//   4. Largest connected component + oriented-box geometry checks
//      (area, aspect ratio, axis angle)
//   5. Surround ring test: the band around the candidate must be
//      sufficiently green OR sufficiently gray
//
// The detector is a replaceable strategy behind the `RunwayDetector`
// trait; the trigger logic only consumes `DetectionResult`.

use crate::frame_source::FrameSource;
use crate::types::{CenterlineOffset, DetectionConfig, DetectionResult, Frame};
use anyhow::Result;
use std::time::{Duration, Instant};
use tracing::{debug, info};

const RING_OUTER_MIN_PX: u32 = 3;
const RING_OUTER_MAX_PX: u32 = 75;
const MORPH_KERNEL: usize = 2; // 5x5 structuring element radius

// Calibration clamps (H: 0-360, S: 0-100, V: 0-255)
const CAL_WHITE_V_MIN_CLAMP: (f32, f32) = (180.0, 240.0);
const CAL_WHITE_S_MAX_CLAMP: (f32, f32) = (8.0, 31.0);
const CAL_GREEN_H_WIDTH: f32 = 40.0;
const CAL_GREEN_S_MIN_CLAMP: (f32, f32) = (16.0, 47.0);
const CAL_GREEN_V_MIN_CLAMP: (f32, f32) = (30.0, 120.0);
const CAL_MIN_SAMPLES: usize = 1000;

/// Produce a DetectionResult from a Frame. Implementations must be
/// deterministic given the same frame and parameters.
pub trait RunwayDetector: Send {
    fn detect(&mut self, frame: &Frame) -> DetectionResult;
}

// ============================================================================
// HSV THRESHOLDS
// ============================================================================

/// HSV band for one pixel class. H in degrees [0, 360), S in [0, 100],
/// V in [0, 255].
#[derive(Debug, Clone, Copy)]
pub struct HsvBand {
    pub h_lo: f32,
    pub h_hi: f32,
    pub s_lo: f32,
    pub s_hi: f32,
    pub v_lo: f32,
    pub v_hi: f32,
}

impl HsvBand {
    #[inline]
    fn contains(&self, h: f32, s: f32, v: f32) -> bool {
        h >= self.h_lo
            && h <= self.h_hi
            && s >= self.s_lo
            && s <= self.s_hi
            && v >= self.v_lo
            && v <= self.v_hi
    }
}

#[derive(Debug, Clone, Copy)]
pub struct HsvThresholds {
    pub white: HsvBand,
    pub green: HsvBand,
    pub gray: HsvBand,
}

impl Default for HsvThresholds {
    fn default() -> Self {
        Self {
            // Low saturation, high brightness
            white: HsvBand {
                h_lo: 0.0,
                h_hi: 360.0,
                s_lo: 0.0,
                s_hi: 24.0,
                v_lo: 180.0,
                v_hi: 255.0,
            },
            // Hue window around 120 degrees with enough S/V
            green: HsvBand {
                h_lo: 90.0,
                h_hi: 170.0,
                s_lo: 24.0,
                s_hi: 100.0,
                v_lo: 40.0,
                v_hi: 255.0,
            },
            // Dark-to-mid gray: low saturation, mid brightness
            gray: HsvBand {
                h_lo: 0.0,
                h_hi: 360.0,
                s_lo: 0.0,
                s_hi: 16.0,
                v_lo: 60.0,
                v_hi: 200.0,
            },
        }
    }
}

/// Convert RGB to HSV. Returns (H: 0-360, S: 0-100, V: 0-255).
#[inline]
pub fn rgb_to_hsv(r: f32, g: f32, b: f32) -> (f32, f32, f32) {
    let r_n = r / 255.0;
    let g_n = g / 255.0;
    let b_n = b / 255.0;

    let max = r_n.max(g_n).max(b_n);
    let min = r_n.min(g_n).min(b_n);
    let delta = max - min;

    let h = if delta < 1e-6 {
        0.0
    } else if (max - r_n).abs() < 1e-6 {
        60.0 * (((g_n - b_n) / delta) % 6.0)
    } else if (max - g_n).abs() < 1e-6 {
        60.0 * (((b_n - r_n) / delta) + 2.0)
    } else {
        60.0 * (((r_n - g_n) / delta) + 4.0)
    };
    let h = if h < 0.0 { h + 360.0 } else { h };

    let s = if max < 1e-6 {
        0.0
    } else {
        (delta / max) * 100.0
    };

    (h, s, max * 255.0)
}

// ============================================================================
// DETECTOR
// ============================================================================

pub struct SegmentationDetector {
    config: DetectionConfig,
    proc_width: usize,
    thresholds: HsvThresholds,
}

struct OrientedBox {
    center_x: f32,
    length: f32,
    width: f32,
    /// Major-axis angle folded to [0, 45] degrees
    angle_deg: f32,
}

impl SegmentationDetector {
    pub fn new(config: DetectionConfig, proc_width: usize) -> Self {
        Self {
            config,
            proc_width,
            thresholds: HsvThresholds::default(),
        }
    }

    #[cfg(test)]
    fn with_thresholds(mut self, thresholds: HsvThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    /// Estimate white/green thresholds from live frames (lighting varies a
    /// lot between flights). Clamped percentile estimation; falls back to
    /// the defaults for any class with too few samples.
    pub fn calibrate(
        &mut self,
        source: &mut dyn FrameSource,
        max_frames: usize,
        timeout: Duration,
    ) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut white_s: Vec<f32> = Vec::new();
        let mut white_v: Vec<f32> = Vec::new();
        let mut green_h: Vec<f32> = Vec::new();
        let mut green_s: Vec<f32> = Vec::new();
        let mut green_v: Vec<f32> = Vec::new();
        let mut sampled = 0usize;

        while sampled < max_frames && Instant::now() < deadline {
            let frame = match source.next_frame(Duration::from_millis(100))? {
                Some(frame) => frame,
                None => continue,
            };

            let (proc, pw, ph) = self.downscale(&frame);
            for y in 0..ph {
                for x in 0..pw {
                    let i = (y * pw + x) * 3;
                    let (h, s, v) =
                        rgb_to_hsv(proc[i] as f32, proc[i + 1] as f32, proc[i + 2] as f32);
                    if v >= 160.0 && s <= 35.0 {
                        white_s.push(s);
                        white_v.push(v);
                    }
                    if (70.0..=170.0).contains(&h) && s >= 24.0 && v >= 40.0 {
                        green_h.push(h);
                        green_s.push(s);
                        green_v.push(v);
                    }
                }
            }
            sampled += 1;
        }

        if white_v.len() >= CAL_MIN_SAMPLES {
            let v_min = clamp(percentile(&mut white_v, 0.80) - 5.0, CAL_WHITE_V_MIN_CLAMP);
            let s_max = clamp(percentile(&mut white_s, 0.50) + 4.0, CAL_WHITE_S_MAX_CLAMP);
            self.thresholds.white.v_lo = v_min;
            self.thresholds.white.s_hi = s_max;
        }

        if green_h.len() >= CAL_MIN_SAMPLES {
            let h_med = percentile(&mut green_h, 0.50);
            self.thresholds.green.h_lo = (h_med - CAL_GREEN_H_WIDTH).max(0.0);
            self.thresholds.green.h_hi = (h_med + CAL_GREEN_H_WIDTH).min(360.0);
            self.thresholds.green.s_lo =
                clamp(percentile(&mut green_s, 0.40), CAL_GREEN_S_MIN_CLAMP);
            self.thresholds.green.v_lo =
                clamp(percentile(&mut green_v, 0.30), CAL_GREEN_V_MIN_CLAMP);
        }

        info!(
            "Calibration done over {} frame(s): white v>={:.0} s<={:.0}, green h=[{:.0},{:.0}] s>={:.0} v>={:.0}",
            sampled,
            self.thresholds.white.v_lo,
            self.thresholds.white.s_hi,
            self.thresholds.green.h_lo,
            self.thresholds.green.h_hi,
            self.thresholds.green.s_lo,
            self.thresholds.green.v_lo
        );
        Ok(())
    }

    fn downscale(&self, frame: &Frame) -> (Vec<u8>, usize, usize) {
        if frame.width <= self.proc_width {
            return (frame.data.clone(), frame.width, frame.height);
        }
        let pw = self.proc_width;
        let ph = (pw * frame.height / frame.width).max(1);
        (
            resize_bilinear(&frame.data, frame.width, frame.height, pw, ph),
            pw,
            ph,
        )
    }
}

impl RunwayDetector for SegmentationDetector {
    fn detect(&mut self, frame: &Frame) -> DetectionResult {
        let miss = DetectionResult::none(frame.seq, frame.timestamp_ms);

        let (proc, pw, ph) = self.downscale(frame);

        // Per-pixel classification
        let mut white = vec![false; pw * ph];
        let mut green = vec![false; pw * ph];
        let mut gray = vec![false; pw * ph];
        for i in 0..pw * ph {
            let (h, s, v) = rgb_to_hsv(
                proc[i * 3] as f32,
                proc[i * 3 + 1] as f32,
                proc[i * 3 + 2] as f32,
            );
            white[i] = self.thresholds.white.contains(h, s, v);
            green[i] = self.thresholds.green.contains(h, s, v);
            gray[i] = !white[i] && self.thresholds.gray.contains(h, s, v);
        }

        // Open then close to drop speckle and seal the runway blob
        let white = morph_close(&morph_open(&white, pw, ph), pw, ph);

        let component = match largest_component(&white, pw, ph) {
            Some(c) => c,
            None => return miss,
        };
        if component.len() < self.config.min_white_area {
            debug!(
                "Frame {}: component too small ({} px)",
                frame.seq,
                component.len()
            );
            return miss;
        }

        let rect = oriented_box(&component, pw);
        let aspect = rect.length / rect.width.max(1.0);
        if aspect < self.config.aspect_min {
            debug!("Frame {}: aspect {:.1} below minimum", frame.seq, aspect);
            return miss;
        }
        if rect.angle_deg > self.config.angle_tolerance_deg {
            debug!(
                "Frame {}: axis angle {:.1} outside tolerance",
                frame.seq, rect.angle_deg
            );
            return miss;
        }

        // Surround ring: band around the blob must look like grass or
        // pavement, not arbitrary clutter. Radii scale with the blob's
        // minor dimension.
        let outer_r = ((rect.width * self.config.ring_scale_outer) as u32)
            .clamp(RING_OUTER_MIN_PX, RING_OUTER_MAX_PX);
        let inner_r = ((outer_r as f32 * self.config.ring_inner_ratio) as u32)
            .clamp(1, outer_r.saturating_sub(1).max(1));

        let mut in_component = vec![false; pw * ph];
        for &idx in &component {
            in_component[idx] = true;
        }
        let dist = chamfer_distance(&in_component, pw, ph);

        let mut ring_px = 0u32;
        let mut green_px = 0u32;
        let mut gray_px = 0u32;
        for i in 0..pw * ph {
            if dist[i] > inner_r && dist[i] <= outer_r {
                ring_px += 1;
                if green[i] {
                    green_px += 1;
                }
                if gray[i] {
                    gray_px += 1;
                }
            }
        }
        if ring_px == 0 {
            return miss;
        }

        let green_ratio = green_px as f32 / ring_px as f32;
        let gray_ratio = gray_px as f32 / ring_px as f32;
        if green_ratio < self.config.min_green_ratio && gray_ratio < self.config.min_gray_ratio {
            debug!(
                "Frame {}: surround rejected (green {:.2}, gray {:.2})",
                frame.seq, green_ratio, gray_ratio
            );
            return miss;
        }

        let area_fraction = component.len() as f32 / (pw * ph) as f32;
        let surround = green_ratio.max(gray_ratio);
        let confidence = compose_confidence(surround, aspect, area_fraction);

        let lateral = (rect.center_x - pw as f32 / 2.0) / (pw as f32 / 2.0);

        debug!(
            "Frame {}: runway candidate conf={:.2} lat={:.2} angle={:.1} area={}px",
            frame.seq,
            confidence,
            lateral,
            rect.angle_deg,
            component.len()
        );

        DetectionResult {
            found: true,
            confidence,
            offset: Some(CenterlineOffset {
                lateral,
                angle_deg: rect.angle_deg,
            }),
            frame_seq: frame.seq,
            timestamp_ms: frame.timestamp_ms,
        }
    }
}

// ============================================================================
// CONFIDENCE
// ============================================================================

fn compose_confidence(surround: f32, aspect: f32, area_fraction: f32) -> f32 {
    let surround_conf: f32 = if surround >= 0.80 {
        0.95
    } else if surround >= 0.60 {
        0.85
    } else if surround >= 0.40 {
        0.70
    } else {
        0.55
    };

    let aspect_conf = if aspect >= 8.0 {
        0.95
    } else if aspect >= 5.0 {
        0.85
    } else if aspect >= 4.0 {
        0.70
    } else {
        0.60
    };

    let area_conf = if area_fraction >= 0.06 {
        0.95
    } else if area_fraction >= 0.03 {
        0.85
    } else if area_fraction >= 0.015 {
        0.70
    } else {
        0.55
    };

    (surround_conf * 0.45 + aspect_conf * 0.30 + area_conf * 0.25).clamp(0.0, 1.0)
}

// ============================================================================
// IMAGE OPS
// ============================================================================

/// Bilinear image resize
fn resize_bilinear(src: &[u8], src_w: usize, src_h: usize, dst_w: usize, dst_h: usize) -> Vec<u8> {
    let mut dst = vec![0u8; dst_h * dst_w * 3];

    let x_ratio = src_w as f32 / dst_w as f32;
    let y_ratio = src_h as f32 / dst_h as f32;

    for dy in 0..dst_h {
        for dx in 0..dst_w {
            let sx = dx as f32 * x_ratio;
            let sy = dy as f32 * y_ratio;

            let sx0 = sx.floor() as usize;
            let sy0 = sy.floor() as usize;
            let sx1 = (sx0 + 1).min(src_w - 1);
            let sy1 = (sy0 + 1).min(src_h - 1);

            let fx = sx - sx0 as f32;
            let fy = sy - sy0 as f32;

            for c in 0..3 {
                let p00 = src[(sy0 * src_w + sx0) * 3 + c] as f32;
                let p10 = src[(sy0 * src_w + sx1) * 3 + c] as f32;
                let p01 = src[(sy1 * src_w + sx0) * 3 + c] as f32;
                let p11 = src[(sy1 * src_w + sx1) * 3 + c] as f32;

                let val = p00 * (1.0 - fx) * (1.0 - fy)
                    + p10 * fx * (1.0 - fy)
                    + p01 * (1.0 - fx) * fy
                    + p11 * fx * fy;

                dst[(dy * dst_w + dx) * 3 + c] = val.round() as u8;
            }
        }
    }

    dst
}

fn morph_erode(mask: &[bool], w: usize, h: usize) -> Vec<bool> {
    let k = MORPH_KERNEL as isize;
    let mut out = vec![false; w * h];
    for y in 0..h as isize {
        'pixels: for x in 0..w as isize {
            for dy in -k..=k {
                for dx in -k..=k {
                    let (nx, ny) = (x + dx, y + dy);
                    if nx < 0 || ny < 0 || nx >= w as isize || ny >= h as isize {
                        continue 'pixels;
                    }
                    if !mask[ny as usize * w + nx as usize] {
                        continue 'pixels;
                    }
                }
            }
            out[y as usize * w + x as usize] = true;
        }
    }
    out
}

fn morph_dilate(mask: &[bool], w: usize, h: usize) -> Vec<bool> {
    let k = MORPH_KERNEL as isize;
    let mut out = vec![false; w * h];
    for y in 0..h as isize {
        for x in 0..w as isize {
            'kernel: for dy in -k..=k {
                for dx in -k..=k {
                    let (nx, ny) = (x + dx, y + dy);
                    if nx < 0 || ny < 0 || nx >= w as isize || ny >= h as isize {
                        continue;
                    }
                    if mask[ny as usize * w + nx as usize] {
                        out[y as usize * w + x as usize] = true;
                        break 'kernel;
                    }
                }
            }
        }
    }
    out
}

fn morph_open(mask: &[bool], w: usize, h: usize) -> Vec<bool> {
    morph_dilate(&morph_erode(mask, w, h), w, h)
}

fn morph_close(mask: &[bool], w: usize, h: usize) -> Vec<bool> {
    morph_erode(&morph_dilate(mask, w, h), w, h)
}

/// Largest 4-connected component, as a list of pixel indices.
fn largest_component(mask: &[bool], w: usize, h: usize) -> Option<Vec<usize>> {
    let mut visited = vec![false; w * h];
    let mut best: Option<Vec<usize>> = None;
    let mut stack = Vec::new();

    for start in 0..w * h {
        if !mask[start] || visited[start] {
            continue;
        }
        let mut component = Vec::new();
        visited[start] = true;
        stack.push(start);
        while let Some(idx) = stack.pop() {
            component.push(idx);
            let (x, y) = (idx % w, idx / w);
            let mut push = |nx: usize, ny: usize| {
                let nidx = ny * w + nx;
                if mask[nidx] && !visited[nidx] {
                    visited[nidx] = true;
                    stack.push(nidx);
                }
            };
            if x > 0 {
                push(x - 1, y);
            }
            if x + 1 < w {
                push(x + 1, y);
            }
            if y > 0 {
                push(x, y - 1);
            }
            if y + 1 < h {
                push(x, y + 1);
            }
        }
        if best.as_ref().map_or(true, |b| component.len() > b.len()) {
            best = Some(component);
        }
    }
    best
}

/// PCA-based oriented bounding box over a pixel component.
fn oriented_box(component: &[usize], w: usize) -> OrientedBox {
    let n = component.len() as f32;
    let mut mx = 0.0f32;
    let mut my = 0.0f32;
    for &idx in component {
        mx += (idx % w) as f32;
        my += (idx / w) as f32;
    }
    mx /= n;
    my /= n;

    let mut sxx = 0.0f32;
    let mut syy = 0.0f32;
    let mut sxy = 0.0f32;
    for &idx in component {
        let dx = (idx % w) as f32 - mx;
        let dy = (idx / w) as f32 - my;
        sxx += dx * dx;
        syy += dy * dy;
        sxy += dx * dy;
    }
    sxx /= n;
    syy /= n;
    sxy /= n;

    let theta = 0.5 * (2.0 * sxy).atan2(sxx - syy);
    let (cos_t, sin_t) = (theta.cos(), theta.sin());

    let mut major_min = f32::MAX;
    let mut major_max = f32::MIN;
    let mut minor_min = f32::MAX;
    let mut minor_max = f32::MIN;
    for &idx in component {
        let dx = (idx % w) as f32 - mx;
        let dy = (idx / w) as f32 - my;
        let major = dx * cos_t + dy * sin_t;
        let minor = -dx * sin_t + dy * cos_t;
        major_min = major_min.min(major);
        major_max = major_max.max(major);
        minor_min = minor_min.min(minor);
        minor_max = minor_max.max(minor);
    }

    let extent_a = major_max - major_min + 1.0;
    let extent_b = minor_max - minor_min + 1.0;
    let length = extent_a.max(extent_b);
    let width = extent_a.min(extent_b);

    // Fold the axis angle into [0, 45]
    let mut angle = theta.to_degrees().rem_euclid(90.0);
    if angle > 45.0 {
        angle = 90.0 - angle;
    }

    OrientedBox {
        center_x: mx,
        length,
        width,
        angle_deg: angle,
    }
}

/// Two-pass city-block distance from the component mask. Zero inside the
/// component, saturated at u32::MAX/2 far away.
fn chamfer_distance(mask: &[bool], w: usize, h: usize) -> Vec<u32> {
    const FAR: u32 = u32::MAX / 2;
    let mut dist = vec![FAR; w * h];
    for i in 0..w * h {
        if mask[i] {
            dist[i] = 0;
        }
    }

    for y in 0..h {
        for x in 0..w {
            let idx = y * w + x;
            if x > 0 {
                dist[idx] = dist[idx].min(dist[idx - 1].saturating_add(1));
            }
            if y > 0 {
                dist[idx] = dist[idx].min(dist[idx - w].saturating_add(1));
            }
        }
    }
    for y in (0..h).rev() {
        for x in (0..w).rev() {
            let idx = y * w + x;
            if x + 1 < w {
                dist[idx] = dist[idx].min(dist[idx + 1].saturating_add(1));
            }
            if y + 1 < h {
                dist[idx] = dist[idx].min(dist[idx + w].saturating_add(1));
            }
        }
    }
    dist
}

fn percentile(values: &mut [f32], p: f32) -> f32 {
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    if values.is_empty() {
        return 0.0;
    }
    let idx = ((values.len() - 1) as f32 * p).round() as usize;
    values[idx]
}

fn clamp(value: f32, range: (f32, f32)) -> f32 {
    value.clamp(range.0, range.1)
}

// ============================================================================
// TESTS
// ============================================================================
