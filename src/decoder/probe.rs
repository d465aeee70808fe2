//! Stream metadata probe via ffprobe.

use std::path::Path;
use std::process::Stdio;

use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;

use crate::decoder::{StreamInfo, DEFAULT_FRAME_RATE};
use crate::error::{FrameError, Result};
use crate::timecode::TimeCode;

#[derive(Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    format: Option<ProbeFormat>,
}

#[derive(Deserialize)]
struct ProbeStream {
    codec_type: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    avg_frame_rate: Option<String>,
    r_frame_rate: Option<String>,
    duration: Option<String>,
}

#[derive(Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
}

/// Probe width, height, frame rate, and duration of the first video stream.
///
/// A reported frame rate ≤ 0 is treated as unknown and defaults to ~60 fps.
pub async fn probe_stream(path: impl AsRef<Path>) -> Result<StreamInfo> {
    let path = path.as_ref();
    let output = Command::new("ffprobe")
        .args(["-v", "quiet", "-print_format", "json", "-show_streams", "-show_format"])
        .arg(path)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(FrameError::DecoderSpawn)?;

    if !output.status.success() {
        return Err(FrameError::ProbeFailed {
            path: path.to_path_buf(),
            reason: format!("ffprobe exited with {}", output.status),
        });
    }

    let parsed: ProbeOutput =
        serde_json::from_slice(&output.stdout).map_err(|e| FrameError::ProbeFailed {
            path: path.to_path_buf(),
            reason: format!("unparseable ffprobe output: {e}"),
        })?;

    let stream = parsed
        .streams
        .iter()
        .find(|s| {
            s.codec_type.as_deref() == Some("video") && s.width.is_some() && s.height.is_some()
        })
        .ok_or_else(|| FrameError::NoVideoStream(path.to_path_buf()))?;

    let width = stream.width.unwrap_or(0);
    let height = stream.height.unwrap_or(0);
    if width == 0 || height == 0 {
        return Err(FrameError::NoVideoStream(path.to_path_buf()));
    }

    let frame_rate = stream
        .avg_frame_rate
        .as_deref()
        .and_then(parse_rational)
        .filter(|fps| *fps > 0.0)
        .or_else(|| stream.r_frame_rate.as_deref().and_then(parse_rational))
        .filter(|fps| *fps > 0.0)
        .unwrap_or(DEFAULT_FRAME_RATE);

    let duration_secs = stream
        .duration
        .as_deref()
        .and_then(|d| d.parse::<f64>().ok())
        .or_else(|| {
            parsed
                .format
                .as_ref()
                .and_then(|f| f.duration.as_deref())
                .and_then(|d| d.parse::<f64>().ok())
        })
        .unwrap_or(0.0);

    let info = StreamInfo {
        width,
        height,
        frame_rate,
        duration: TimeCode::from_secs_f64(duration_secs.max(0.0)),
    };
    debug!(
        path = %path.display(),
        width, height, fps = frame_rate, duration = %info.duration,
        "probed stream"
    );
    Ok(info)
}

/// Parse ffprobe's `num/den` rational (or a plain float).
fn parse_rational(raw: &str) -> Option<f64> {
    let raw = raw.trim();
    if let Some((num, den)) = raw.split_once('/') {
        let num: f64 = num.parse().ok()?;
        let den: f64 = den.parse().ok()?;
        if den == 0.0 {
            return None;
        }
        Some(num / den)
    } else {
        raw.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rational_forms() {
        assert_eq!(parse_rational("30000/1001").map(|f| (f * 1000.0).round()), Some(29970.0));
        assert_eq!(parse_rational("60/1"), Some(60.0));
        assert_eq!(parse_rational("25"), Some(25.0));
        assert_eq!(parse_rational("0/0"), None);
        assert_eq!(parse_rational("garbage"), None);
    }
}
