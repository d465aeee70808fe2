//! Hardware acceleration selection and cross-platform detection.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer};

/// Value handed to the decoder's `-hwaccel` flag.
///
/// Unrecognised configuration strings fall back to `Auto`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HwAccelApi {
    #[default]
    Auto,
    None,
    Vdpau,
    Dxva2,
    D3d11va,
    Vaapi,
    Qsv,
    VideoToolbox,
    Cuda,
}

impl HwAccelApi {
    pub fn as_arg(self) -> &'static str {
        match self {
            HwAccelApi::Auto => "auto",
            HwAccelApi::None => "none",
            HwAccelApi::Vdpau => "vdpau",
            HwAccelApi::Dxva2 => "dxva2",
            HwAccelApi::D3d11va => "d3d11va",
            HwAccelApi::Vaapi => "vaapi",
            HwAccelApi::Qsv => "qsv",
            HwAccelApi::VideoToolbox => "videotoolbox",
            HwAccelApi::Cuda => "cuda",
        }
    }
}

impl FromStr for HwAccelApi {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "none" => HwAccelApi::None,
            "vdpau" => HwAccelApi::Vdpau,
            "dxva2" => HwAccelApi::Dxva2,
            "d3d11va" => HwAccelApi::D3d11va,
            "vaapi" => HwAccelApi::Vaapi,
            "qsv" => HwAccelApi::Qsv,
            "videotoolbox" => HwAccelApi::VideoToolbox,
            "cuda" => HwAccelApi::Cuda,
            _ => HwAccelApi::Auto,
        })
    }
}

impl fmt::Display for HwAccelApi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_arg())
    }
}

impl<'de> Deserialize<'de> for HwAccelApi {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(raw.parse().unwrap_or_default())
    }
}

/// Detect acceleration APIs plausibly available on this machine.
///
/// Purely advisory (used by the CLI probe output); the decoder itself relies
/// on ffmpeg's own `-hwaccel auto` negotiation plus the software fallback.
pub fn detect_hw_accel() -> Vec<HwAccelApi> {
    let mut available = Vec::new();

    #[cfg(target_os = "windows")]
    {
        // DXVA2 is present on anything ffmpeg still runs on; D3D11VA on 8+.
        available.push(HwAccelApi::Dxva2);
        available.push(HwAccelApi::D3d11va);

        if has_driver_dll("nvapi64.dll") {
            available.push(HwAccelApi::Cuda);
        }
        if has_driver_dll("mfx_dispatch.dll") || has_driver_dll("libmfxhw64.dll") {
            available.push(HwAccelApi::Qsv);
        }
    }

    #[cfg(target_os = "linux")]
    {
        if std::path::Path::new("/dev/dri/renderD128").exists() {
            available.push(HwAccelApi::Vaapi);
        }
        if std::path::Path::new("/dev/nvidia0").exists() {
            available.push(HwAccelApi::Cuda);
        }
    }

    #[cfg(target_os = "macos")]
    {
        available.push(HwAccelApi::VideoToolbox);
    }

    available
}

#[cfg(target_os = "windows")]
fn has_driver_dll(name: &str) -> bool {
    let system_root = std::env::var("SystemRoot").unwrap_or_else(|_| "C:\\Windows".to_string());
    std::path::PathBuf::from(system_root)
        .join("System32")
        .join(name)
        .exists()
}
