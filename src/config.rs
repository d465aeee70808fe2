//! Decode options and settings-file ingest.
//!
//! Settings files are JSON with comments (`//` and `/* */`), the format the
//! host editor writes. Unknown fields are ignored so newer hosts can add keys
//! without breaking older helpers.

use std::path::Path;

use serde::Deserialize;

use crate::decoder::hwaccel::HwAccelApi;
use crate::error::Result;
use crate::pool::BYTES_PER_PIXEL;

/// Total pixel-buffer budget the automatic cache sizing works against.
const AUTO_CACHE_BUDGET_BYTES: usize = 768 * 1024 * 1024;
/// Pixel count of a full-HD frame; larger sources get a tighter entry cap.
const FULL_HD_PIXELS: usize = 1920 * 1080;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DecodeOptions {
    /// Try the hardware decode path first.
    pub hardware_decode: bool,
    /// API passed as `-hwaccel` when hardware decode is on.
    pub hardware_decode_api: HwAccelApi,
    /// Frame-cache capacity in entries; 0 derives it from the resolution.
    pub max_cache_size: usize,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        DecodeOptions {
            hardware_decode: true,
            hardware_decode_api: HwAccelApi::Auto,
            max_cache_size: 0,
        }
    }
}

impl DecodeOptions {
    /// Cache capacity for a source of the given geometry, resolving the
    /// automatic (0) setting against the memory budget.
    pub fn effective_cache_size(&self, width: u32, height: u32) -> usize {
        if self.max_cache_size > 0 {
            return self.max_cache_size;
        }
        auto_cache_size(width, height)
    }
}

/// Derive a frame-cache entry count from the source resolution: fit the
/// budget, clamped to `[12, 240]` (`[12, 120]` above full HD).
pub fn auto_cache_size(width: u32, height: u32) -> usize {
    let pixels = (width as usize).saturating_mul(height as usize).max(1);
    let frame_bytes = pixels * BYTES_PER_PIXEL;
    let upper = if pixels > FULL_HD_PIXELS { 120 } else { 240 };
    (AUTO_CACHE_BUDGET_BYTES / frame_bytes).clamp(12, upper)
}

/// Load options from a JSON-with-comments settings file.
pub fn load_settings(path: impl AsRef<Path>) -> Result<DecodeOptions> {
    let raw = std::fs::read_to_string(path)?;
    Ok(parse_settings(&raw))
}

/// Parse a settings document, tolerating comments and unknown fields.
/// Unparseable content yields the defaults.
pub fn parse_settings(raw: &str) -> DecodeOptions {
    serde_json::from_str(&strip_comments(raw)).unwrap_or_default()
}

/// Remove `//` and `/* */` comments, leaving string literals intact.
fn strip_comments(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    let mut in_string = false;
    let mut escaped = false;

    while let Some(c) = chars.next() {
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }

        match c {
            '"' => {
                in_string = true;
                out.push(c);
            }
            '/' if chars.peek() == Some(&'/') => {
                for c in chars.by_ref() {
                    if c == '\n' {
                        out.push('\n');
                        break;
                    }
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut prev = '\0';
                for c in chars.by_ref() {
                    if prev == '*' && c == '/' {
                        break;
                    }
                    prev = c;
                }
            }
            _ => out.push(c),
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let opts = DecodeOptions::default();
        assert!(opts.hardware_decode);
        assert_eq!(opts.hardware_decode_api, HwAccelApi::Auto);
        assert_eq!(opts.max_cache_size, 0);
    }

    #[test]
    fn parses_commented_settings() {
        let raw = r#"{
            // prefer the gpu path
            "hardware_decode": true,
            "hardware_decode_api": "vaapi", /* linux */
            "max_cache_size": 64,
            "some_future_knob": "ignored"
        }"#;
        let opts = parse_settings(raw);
        assert_eq!(opts.hardware_decode_api, HwAccelApi::Vaapi);
        assert_eq!(opts.max_cache_size, 64);
    }

    #[test]
    fn slashes_inside_strings_survive() {
        let raw = r#"{ "hardware_decode_api": "auto // not a comment" }"#;
        let opts = parse_settings(raw);
        // Unrecognised api string falls back to auto rather than erroring.
        assert_eq!(opts.hardware_decode_api, HwAccelApi::Auto);
    }

    #[test]
    fn garbage_yields_defaults() {
        let opts = parse_settings("not json at all");
        assert_eq!(opts.max_cache_size, 0);
    }

    #[test]
    fn auto_cache_size_bands() {
        // 1080p: 768 MiB / 8.3 MB ≈ 97 entries.
        assert_eq!(auto_cache_size(1920, 1080), 97);
        // 4K exceeds full HD; the budget gives 24, under the tighter cap.
        assert_eq!(auto_cache_size(3840, 2160), 24);
        // Tiny sources clamp at the ceiling.
        assert_eq!(auto_cache_size(320, 240), 240);
        // Enormous sources still keep a working set.
        assert_eq!(auto_cache_size(16000, 16000), 12);
    }

    #[test]
    fn explicit_size_wins_over_auto() {
        let opts = DecodeOptions {
            max_cache_size: 31,
            ..Default::default()
        };
        assert_eq!(opts.effective_cache_size(1920, 1080), 31);
        let auto = DecodeOptions::default();
        assert_eq!(auto.effective_cache_size(1920, 1080), 97);
    }
}
