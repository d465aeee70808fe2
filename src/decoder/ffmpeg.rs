//! ffmpeg child-process decoder.
//!
//! Each operation spawns one `ffmpeg` child seeked with an *input*-side `-ss`
//! (fast keyframe seek) and reads raw BGRA off its stdout pipe. The child is
//! never asked to pace itself: back-pressure from the bounded frame channel
//! stalls the pipe reader, which stalls the child's pipe writes.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::config::DecodeOptions;
use crate::decoder::sink::{ChunkSink, SingleFrameSink};
use crate::decoder::{probe_stream, Decoder, FrameStream, HwAccelApi, StreamInfo};
use crate::error::{FrameError, Result};
use crate::frame::VideoFrame;
use crate::pool::BitmapPool;
use crate::timecode::TimeCode;

/// Pipe read size band: big enough to keep syscalls per frame low, small
/// enough to stay responsive to cancellation.
const MIN_PIPE_READ: usize = 256 * 1024;
const MAX_PIPE_READ: usize = 8 * 1024 * 1024;

/// Buffers the pool keeps parked: the frame channel can hold 8 frames, plus
/// headroom for the frame being assembled and frames in flight to the cache.
const POOL_CAPACITY: usize = 2 * FrameStream::CHANNEL_CAPACITY;

#[derive(Clone, Copy)]
enum RangeMode {
    SingleFrame,
    Length(TimeCode),
    Continuous,
}

pub struct FfmpegDecoder {
    source: Arc<PathBuf>,
    info: StreamInfo,
    pool: BitmapPool,
    options: DecodeOptions,
}

impl FfmpegDecoder {
    /// Probe the file once and set up the buffer pool for its geometry.
    pub async fn open(path: impl AsRef<Path>, options: DecodeOptions) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let info = probe_stream(&path).await?;
        let pool = BitmapPool::new(info.width, info.height, POOL_CAPACITY);
        Ok(FfmpegDecoder {
            source: Arc::new(path),
            info,
            pool,
            options,
        })
    }

    pub fn pool(&self) -> &BitmapPool {
        &self.pool
    }

    fn hw_api(&self) -> Option<HwAccelApi> {
        self.options.hardware_decode.then_some(self.options.hardware_decode_api)
    }

    fn pipe_read_size(&self) -> usize {
        self.info.frame_size().clamp(MIN_PIPE_READ, MAX_PIPE_READ)
    }

    fn build_args(&self, start: TimeCode, mode: RangeMode, hw: Option<HwAccelApi>) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(api) = hw {
            args.push("-hwaccel".into());
            args.push(api.as_arg().into());
        }
        // Input-side seek: lands on the keyframe before `start` without
        // decoding everything up to it.
        args.push("-ss".into());
        args.push(format!("{:.6}", start.as_secs_f64().max(0.0)));
        args.push("-i".into());
        args.push(self.source.to_string_lossy().into_owned());
        match mode {
            RangeMode::SingleFrame => {
                args.push("-frames:v".into());
                args.push("1".into());
            }
            RangeMode::Length(length) => {
                args.push("-t".into());
                args.push(format!("{:.6}", length.as_secs_f64().max(0.0)));
            }
            RangeMode::Continuous => {}
        }
        for fixed in [
            "-f", "rawvideo", "-preset", "ultrafast", "-pix_fmt", "bgra", "-an", "-sn", "-dn",
            "-loglevel", "error", "-nostdin", "-",
        ] {
            args.push(fixed.into());
        }
        args
    }

    async fn run_single(
        &self,
        time: TimeCode,
        hw: Option<HwAccelApi>,
        cancel: &CancelToken,
    ) -> Result<Option<VideoFrame>> {
        let mut child = spawn_ffmpeg(&self.build_args(time, RangeMode::SingleFrame, hw))?;
        let Some(mut stdout) = child.stdout.take() else {
            return Ok(None);
        };

        let mut sink = SingleFrameSink::new(&self.pool);
        let mut buf = vec![0u8; self.pipe_read_size()];
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = child.start_kill();
                    return Err(FrameError::Cancelled);
                }
                read = stdout.read(&mut buf) => match read {
                    Ok(0) => break,
                    Ok(n) => sink.write(&buf[..n]),
                    Err(e) => {
                        let _ = child.start_kill();
                        return Err(e.into());
                    }
                }
            }
        }

        let status = child.wait().await?;
        if !status.success() {
            warn!(source = %self.source.display(), %time, %status, "single-frame decoder failed");
            return Ok(None);
        }
        if !sink.has_frame() {
            warn!(
                source = %self.source.display(),
                %time,
                bytes = sink.bytes_written(),
                expected = self.info.frame_size(),
                "truncated single-frame output"
            );
            return Ok(None);
        }
        Ok(sink
            .take_buffer()
            .map(|buffer| VideoFrame::new(self.source.clone(), time, buffer)))
    }
}

impl Decoder for FfmpegDecoder {
    fn info(&self) -> &StreamInfo {
        &self.info
    }

    fn single_frame<'a>(
        &'a self,
        time: TimeCode,
        cancel: &'a CancelToken,
    ) -> BoxFuture<'a, Result<Option<VideoFrame>>> {
        Box::pin(async move {
            if let Some(api) = self.hw_api() {
                match self.run_single(time, Some(api), cancel).await {
                    Ok(Some(frame)) => return Ok(Some(frame)),
                    Err(FrameError::Cancelled) => return Err(FrameError::Cancelled),
                    Ok(None) | Err(_) => {
                        warn!(%time, %api, "hardware decode produced nothing, retrying in software");
                    }
                }
            }
            self.run_single(time, None, cancel).await
        })
    }

    fn decode_range(
        &self,
        start: TimeCode,
        max_length: Option<TimeCode>,
        cancel: &CancelToken,
    ) -> Result<FrameStream> {
        let mode = match max_length {
            Some(length) => RangeMode::Length(length),
            None => RangeMode::Continuous,
        };
        let software_args = self.build_args(start, mode, None);
        let child = match self.hw_api() {
            Some(api) => match spawn_ffmpeg(&self.build_args(start, mode, Some(api))) {
                Ok(child) => child,
                Err(e) => {
                    warn!(%start, %api, error = %e, "hardware decoder failed to start, using software");
                    spawn_ffmpeg(&software_args)?
                }
            },
            None => spawn_ffmpeg(&software_args)?,
        };

        debug!(source = %self.source.display(), %start, "decode stream started");
        let (tx, stream) = FrameStream::channel();
        let sink = ChunkSink::new(
            self.pool.clone(),
            self.source.clone(),
            start,
            self.info.frame_rate,
            tx,
        );
        tokio::spawn(pump_pipe(
            child,
            sink,
            self.pipe_read_size(),
            cancel.clone(),
            Some(software_args),
        ));
        Ok(stream)
    }
}

fn spawn_ffmpeg(args: &[String]) -> Result<Child> {
    Command::new("ffmpeg")
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(FrameError::DecoderSpawn)
}

/// Read the child's pixel pipe into the chunk sink until end of stream,
/// cancellation, or the consumer going away. A child that dies before its
/// first frame gets one software respawn (hardware-path startup failures
/// surface this way rather than at spawn time).
async fn pump_pipe(
    mut child: Child,
    mut sink: ChunkSink,
    read_size: usize,
    cancel: CancelToken,
    mut software_args: Option<Vec<String>>,
) {
    let mut buf = vec![0u8; read_size];
    loop {
        let Some(mut stdout) = child.stdout.take() else {
            return;
        };

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = child.start_kill();
                    return;
                }
                read = stdout.read(&mut buf) => match read {
                    Ok(0) => break,
                    Ok(n) => {
                        if !sink.write(&buf[..n]).await {
                            // Consumer gone; tear the child down.
                            let _ = child.start_kill();
                            return;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "decode pipe read failed");
                        let _ = child.start_kill();
                        return;
                    }
                }
            }
        }

        let status = child.wait().await;
        let clean = matches!(&status, Ok(s) if s.success());
        if !clean && sink.frames_emitted() == 0 {
            if let Some(args) = software_args.take() {
                warn!("decoder exited before first frame, retrying in software");
                match spawn_ffmpeg(&args) {
                    Ok(respawned) => {
                        child = respawned;
                        continue;
                    }
                    Err(e) => {
                        warn!(error = %e, "software decoder retry failed to start");
                        return;
                    }
                }
            }
        }
        if !clean {
            warn!(?status, frames = sink.frames_emitted(), "decode stream ended abnormally");
        }
        return;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decoder(options: DecodeOptions) -> FfmpegDecoder {
        let info = StreamInfo {
            width: 1280,
            height: 720,
            frame_rate: 60.0,
            duration: TimeCode::from_secs(120),
        };
        FfmpegDecoder {
            source: Arc::new(PathBuf::from("/media/clip.mp4")),
            pool: BitmapPool::new(info.width, info.height, POOL_CAPACITY),
            info,
            options,
        }
    }

    #[test]
    fn seek_precedes_input() {
        let d = decoder(DecodeOptions::default());
        let args = d.build_args(TimeCode::from_secs(30), RangeMode::Continuous, None);
        let ss = args.iter().position(|a| a == "-ss").unwrap();
        let input = args.iter().position(|a| a == "-i").unwrap();
        assert!(ss < input, "input-side seek must come before -i");
        assert_eq!(args[ss + 1], "30.000000");
    }

    #[test]
    fn single_frame_args() {
        let d = decoder(DecodeOptions::default());
        let args = d.build_args(TimeCode::ZERO, RangeMode::SingleFrame, None);
        let frames = args.iter().position(|a| a == "-frames:v").unwrap();
        assert_eq!(args[frames + 1], "1");
        assert!(args.contains(&"-pix_fmt".to_string()));
        assert!(args.contains(&"bgra".to_string()));
        assert_eq!(args.last().unwrap(), "-");
    }

    #[test]
    fn bounded_range_uses_duration() {
        let d = decoder(DecodeOptions::default());
        let args = d.build_args(
            TimeCode::from_secs(5),
            RangeMode::Length(TimeCode::from_millis(1500)),
            None,
        );
        let t = args.iter().position(|a| a == "-t").unwrap();
        assert_eq!(args[t + 1], "1.500000");
        assert!(!args.contains(&"-frames:v".to_string()));
    }

    #[test]
    fn hwaccel_flag_only_when_requested() {
        let d = decoder(DecodeOptions::default());
        let hw = d.build_args(TimeCode::ZERO, RangeMode::Continuous, Some(HwAccelApi::Vaapi));
        let pos = hw.iter().position(|a| a == "-hwaccel").unwrap();
        assert_eq!(hw[pos + 1], "vaapi");
        let input = hw.iter().position(|a| a == "-i").unwrap();
        assert!(pos < input, "hwaccel is an input option");

        let sw = d.build_args(TimeCode::ZERO, RangeMode::Continuous, None);
        assert!(!sw.contains(&"-hwaccel".to_string()));
    }

    #[test]
    fn audio_and_data_streams_disabled() {
        let d = decoder(DecodeOptions::default());
        let args = d.build_args(TimeCode::ZERO, RangeMode::Continuous, None);
        for flag in ["-an", "-sn", "-dn"] {
            assert!(args.contains(&flag.to_string()), "{flag} missing");
        }
    }

    #[test]
    fn pipe_read_size_clamped() {
        let d = decoder(DecodeOptions::default());
        // 1280x720x4 ≈ 3.5 MiB sits inside the band.
        assert_eq!(d.pipe_read_size(), d.info.frame_size());

        let tiny = FfmpegDecoder {
            source: Arc::new(PathBuf::from("a")),
            info: StreamInfo {
                width: 64,
                height: 64,
                frame_rate: 60.0,
                duration: TimeCode::ZERO,
            },
            pool: BitmapPool::new(64, 64, 2),
            options: DecodeOptions::default(),
        };
        assert_eq!(tiny.pipe_read_size(), MIN_PIPE_READ);
    }

    #[test]
    fn negative_seek_clamps_to_zero() {
        let d = decoder(DecodeOptions::default());
        let args = d.build_args(TimeCode::from_secs(-3), RangeMode::Continuous, None);
        let ss = args.iter().position(|a| a == "-ss").unwrap();
        assert_eq!(args[ss + 1], "0.000000");
    }
}
