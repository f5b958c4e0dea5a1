//! ffmpeg-backed audio codec
//!
//! PCM is staged as 16-bit WAV and handed to ffmpeg for OGG/Opus encoding.
//! Concatenation uses the concat demuxer: a stream-copy attempt first, then
//! a re-encode when the inputs disagree on stream parameters. Silence gaps
//! are generated with the `anullsrc` source.

use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::debug;

use super::traits::{AudioCodec, ConcatPart, PcmAudio};
use crate::core::error::{CodecOperation, Result, ServiceError};

const ENCODE_BITRATE: &str = "48k";
const CONCAT_BITRATE: &str = "64k";
const SILENCE_SAMPLE_RATE: u32 = 24_000;

/// Subprocess codec speaking the ffmpeg CLI
pub struct FfmpegCodec {
    ffmpeg: String,
    tmp_dir: PathBuf,
}

impl FfmpegCodec {
    pub fn new(ffmpeg: impl Into<String>, tmp_dir: PathBuf) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            tmp_dir,
        }
    }

    fn run(&self, args: &[String], operation: CodecOperation) -> Result<()> {
        let output = Command::new(&self.ffmpeg)
            .args(args)
            .output()
            .map_err(|e| ServiceError::Codec {
                message: format!("cannot run {}: {}", self.ffmpeg, e),
                operation,
            })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ServiceError::Codec {
                message: format!("ffmpeg failed: {}", stderr.trim()),
                operation,
            });
        }
        Ok(())
    }

    fn stage_wav(&self, audio: &PcmAudio) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.tmp_dir)?;
        let path = self
            .tmp_dir
            .join(format!("pcm_{}.wav", uuid::Uuid::new_v4().simple()));
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: audio.sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer =
            hound::WavWriter::create(&path, spec).map_err(|e| ServiceError::Codec {
                message: format!("cannot create WAV: {}", e),
                operation: CodecOperation::Encode,
            })?;
        for &sample in &audio.samples {
            let sample_i16 = (sample.clamp(-1.0, 1.0) * 32767.0) as i16;
            writer
                .write_sample(sample_i16)
                .map_err(|e| ServiceError::Codec {
                    message: format!("cannot write WAV sample: {}", e),
                    operation: CodecOperation::Encode,
                })?;
        }
        writer.finalize().map_err(|e| ServiceError::Codec {
            message: format!("cannot finalize WAV: {}", e),
            operation: CodecOperation::Encode,
        })?;
        Ok(path)
    }

    fn silence_ogg(&self, millis: u64) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.tmp_dir)?;
        let path = self.tmp_dir.join(format!("silence_{}.ogg", millis));
        if path.exists() {
            return Ok(path);
        }
        let staged = self
            .tmp_dir
            .join(format!("silence_{}_{}.ogg", millis, uuid::Uuid::new_v4().simple()));
        let args = vec![
            "-y".to_string(),
            "-loglevel".to_string(),
            "error".to_string(),
            "-f".to_string(),
            "lavfi".to_string(),
            "-i".to_string(),
            format!("anullsrc=r={}:cl=mono", SILENCE_SAMPLE_RATE),
            "-t".to_string(),
            format!("{:.3}", millis as f64 / 1000.0),
            "-c:a".to_string(),
            "libopus".to_string(),
            staged.to_string_lossy().into_owned(),
        ];
        self.run(&args, CodecOperation::Silence)?;
        // Several merges may want the same duration; last writer wins
        std::fs::rename(&staged, &path)?;
        Ok(path)
    }

    fn write_concat_list(&self, paths: &[PathBuf]) -> Result<PathBuf> {
        let list_path = self
            .tmp_dir
            .join(format!("concat_{}.txt", uuid::Uuid::new_v4().simple()));
        let mut lines = String::new();
        for path in paths {
            let escaped = path.to_string_lossy().replace('\'', "'\\''");
            lines.push_str(&format!("file '{}'\n", escaped));
        }
        std::fs::write(&list_path, lines)?;
        Ok(list_path)
    }

    fn concat_with_codec(&self, list_path: &Path, output: &Path, copy: bool) -> Result<()> {
        let mut args = vec![
            "-y".to_string(),
            "-loglevel".to_string(),
            "error".to_string(),
            "-f".to_string(),
            "concat".to_string(),
            "-safe".to_string(),
            "0".to_string(),
            "-i".to_string(),
            list_path.to_string_lossy().into_owned(),
        ];
        if copy {
            args.push("-c".to_string());
            args.push("copy".to_string());
        } else {
            args.push("-c:a".to_string());
            args.push("libopus".to_string());
            args.push("-b:a".to_string());
            args.push(CONCAT_BITRATE.to_string());
        }
        args.push(output.to_string_lossy().into_owned());
        self.run(&args, CodecOperation::Concat)
    }
}

impl AudioCodec for FfmpegCodec {
    fn encode_ogg(&self, audio: &PcmAudio, output: &Path) -> Result<()> {
        if audio.samples.is_empty() {
            return Err(ServiceError::Codec {
                message: "no samples to encode".to_string(),
                operation: CodecOperation::Encode,
            });
        }
        let wav = self.stage_wav(audio)?;
        let args = vec![
            "-y".to_string(),
            "-loglevel".to_string(),
            "error".to_string(),
            "-i".to_string(),
            wav.to_string_lossy().into_owned(),
            "-c:a".to_string(),
            "libopus".to_string(),
            "-b:a".to_string(),
            ENCODE_BITRATE.to_string(),
            output.to_string_lossy().into_owned(),
        ];
        let result = self.run(&args, CodecOperation::Encode);
        let _ = std::fs::remove_file(&wav);
        result
    }

    fn concat_ogg(&self, parts: &[ConcatPart], output: &Path) -> Result<()> {
        if parts.is_empty() {
            return Err(ServiceError::Codec {
                message: "nothing to concatenate".to_string(),
                operation: CodecOperation::Concat,
            });
        }
        let mut paths = Vec::with_capacity(parts.len());
        for part in parts {
            match part {
                ConcatPart::Audio(path) => paths.push(path.clone()),
                ConcatPart::Silence { millis } => paths.push(self.silence_ogg(*millis)?),
            }
        }
        let list_path = self.write_concat_list(&paths)?;
        let result = match self.concat_with_codec(&list_path, output, true) {
            Ok(()) => Ok(()),
            Err(copy_err) => {
                debug!("stream-copy concat failed, re-encoding: {}", copy_err);
                self.concat_with_codec(&list_path, output, false)
            }
        };
        let _ = std::fs::remove_file(&list_path);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_pcm_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let codec = FfmpegCodec::new("ffmpeg", dir.path().to_path_buf());
        let audio = PcmAudio {
            samples: Vec::new(),
            sample_rate: 22050,
        };
        assert!(codec.encode_ogg(&audio, &dir.path().join("out.ogg")).is_err());
    }

    #[test]
    fn test_empty_concat_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let codec = FfmpegCodec::new("ffmpeg", dir.path().to_path_buf());
        assert!(codec.concat_ogg(&[], &dir.path().join("out.ogg")).is_err());
    }

    #[test]
    fn test_concat_list_escaping() {
        let dir = tempfile::tempdir().unwrap();
        let codec = FfmpegCodec::new("ffmpeg", dir.path().to_path_buf());
        let tricky = dir.path().join("it's.ogg");
        let list = codec.write_concat_list(&[tricky]).unwrap();
        let content = std::fs::read_to_string(list).unwrap();
        assert!(content.contains("it'\\''s.ogg"));
    }

    #[test]
    fn test_missing_binary_reported_as_codec_error() {
        let dir = tempfile::tempdir().unwrap();
        let codec = FfmpegCodec::new("definitely-not-ffmpeg", dir.path().to_path_buf());
        let audio = PcmAudio {
            samples: vec![0.1; 256],
            sample_rate: 22050,
        };
        let err = codec
            .encode_ogg(&audio, &dir.path().join("out.ogg"))
            .unwrap_err();
        assert!(matches!(err, ServiceError::Codec { .. }));
    }
}
